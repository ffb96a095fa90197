//! Sandboxed expression evaluator for paused debug sessions.
//!
//! Expressions can only read the session's own bindings. Supported: number,
//! string, boolean and null literals; identifiers with `.name` and `[expr]`
//! member access; `+ - * / %`; comparisons; `&& || !`; parentheses. There are
//! no calls, no assignment, and no access to anything outside the bindings.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

const MAX_EXPRESSION_LEN: usize = 1024;
const MAX_DEPTH: usize = 64;

pub type EvalResult<T> = Result<T, String>;

/// Evaluates `source` against `bindings`.
pub fn evaluate(source: &str, bindings: &BTreeMap<String, Value>) -> EvalResult<Value> {
    if source.len() > MAX_EXPRESSION_LEN {
        return Err("expression too long".to_owned());
    }
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_owned());
    }
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
        bindings,
    };
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some(token) => Err(format!("unexpected token {token:?}")),
    }
}

/// JavaScript-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Console rendering: strings quoted, everything else as JSON.
pub fn display(value: &Value) -> String {
    value.to_string()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 21] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
    "(", ")", "[", "]", ".",
];

fn tokenize(source: &str) -> EvalResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;
    while index < chars.len() {
        let c = chars[index];
        if c.is_whitespace() {
            index += 1;
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(index + 1).is_some_and(char::is_ascii_digit))
        {
            let start = index;
            while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.') {
                index += 1;
            }
            let raw: String = chars[start..index].iter().collect();
            let number = raw
                .parse::<f64>()
                .map_err(|_| format!("invalid number {raw}"))?;
            tokens.push(Token::Number(number));
        } else if c == '"' || c == '\'' {
            index += 1;
            let mut text = String::new();
            loop {
                let Some(&next) = chars.get(index) else {
                    return Err("unterminated string".to_owned());
                };
                index += 1;
                match next {
                    _ if next == c => break,
                    '\\' => {
                        let escaped = chars
                            .get(index)
                            .ok_or_else(|| "unterminated string".to_owned())?;
                        index += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                    }
                    other => text.push(other),
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = index;
            while index < chars.len()
                && (chars[index].is_alphanumeric() || chars[index] == '_' || chars[index] == '$')
            {
                index += 1;
            }
            tokens.push(Token::Ident(chars[start..index].iter().collect()));
        } else {
            let rest: String = chars[index..chars.len().min(index + 3)].iter().collect();
            let operator = OPERATORS
                .iter()
                .find(|operator| rest.starts_with(**operator))
                .ok_or_else(|| format!("unexpected character '{c}'"))?;
            index += operator.len();
            tokens.push(Token::Op(*operator));
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
    bindings: &'a BTreeMap<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn eat(&mut self, operator: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(op)) if *op == operator) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn eat_any(&mut self, operators: &[&'static str]) -> Option<&'static str> {
        let Some(Token::Op(op)) = self.peek() else {
            return None;
        };
        let op = *op;
        if operators.contains(&op) {
            self.position += 1;
            Some(op)
        } else {
            None
        }
    }

    fn expression(&mut self) -> EvalResult<Value> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_owned());
        }
        let value = self.or();
        self.depth -= 1;
        value
    }

    fn or(&mut self) -> EvalResult<Value> {
        let mut left = self.and()?;
        while self.eat("||") {
            let right = self.and()?;
            left = if truthy(&left) { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> EvalResult<Value> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            let right = self.equality()?;
            left = if truthy(&left) { right } else { left };
        }
        Ok(left)
    }

    fn equality(&mut self) -> EvalResult<Value> {
        let mut left = self.comparison()?;
        while let Some(op) = self.eat_any(&["===", "!==", "==", "!="]) {
            let right = self.comparison()?;
            let equal = values_equal(&left, &right);
            left = Value::Bool(if op.starts_with('!') { !equal } else { equal });
        }
        Ok(left)
    }

    fn comparison(&mut self) -> EvalResult<Value> {
        let mut left = self.additive()?;
        while let Some(op) = self.eat_any(&["<=", ">=", "<", ">"]) {
            let right = self.additive()?;
            let ordering = match (&left, &right) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => as_number(&left)?.partial_cmp(&as_number(&right)?),
            };
            let result = ordering.is_some_and(|ordering| match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                _ => ordering.is_ge(),
            });
            left = Value::Bool(result);
        }
        Ok(left)
    }

    fn additive(&mut self) -> EvalResult<Value> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_any(&["+", "-"]) {
            let right = self.multiplicative()?;
            left = match (op, &left, &right) {
                ("+", Value::String(a), other) => Value::String(format!("{a}{}", plain(other))),
                ("+", other, Value::String(b)) => Value::String(format!("{}{b}", plain(other))),
                ("+", _, _) => number(as_number(&left)? + as_number(&right)?)?,
                _ => number(as_number(&left)? - as_number(&right)?)?,
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> EvalResult<Value> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_any(&["*", "/", "%"]) {
            let right = self.unary()?;
            let (a, b) = (as_number(&left)?, as_number(&right)?);
            left = match op {
                "*" => number(a * b)?,
                _ if b == 0.0 => return Err("division by zero".to_owned()),
                "/" => number(a / b)?,
                _ => number(a % b)?,
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> EvalResult<Value> {
        if self.eat("!") {
            let value = self.unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        if self.eat("-") {
            let value = self.unary()?;
            return number(-as_number(&value)?);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> EvalResult<Value> {
        let (mut value, mut label) = self.primary()?;
        loop {
            if self.eat(".") {
                let Some(Token::Ident(name)) = self.next() else {
                    return Err("expected property name after '.'".to_owned());
                };
                value = member(&value, &label, &Value::String(name.clone()))?;
                label = format!("{label}.{name}");
            } else if self.eat("[") {
                let key = self.expression()?;
                if !self.eat("]") {
                    return Err("expected ']'".to_owned());
                }
                value = member(&value, &label, &key)?;
                label = format!("{label}[{}]", display(&key));
            } else {
                return Ok(value);
            }
        }
    }

    fn primary(&mut self) -> EvalResult<(Value, String)> {
        match self.next() {
            Some(Token::Number(n)) => Ok((number(n)?, n.to_string())),
            Some(Token::Str(text)) => {
                let label = format!("{text:?}");
                Ok((Value::String(text), label))
            }
            Some(Token::Ident(name)) => {
                let value = match name.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    "null" | "undefined" => Value::Null,
                    _ => self
                        .bindings
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| format!("{name} is not defined"))?,
                };
                Ok((value, name))
            }
            Some(Token::Op("(")) => {
                let value = self.expression()?;
                if !self.eat(")") {
                    return Err("expected ')'".to_owned());
                }
                Ok((value, "(...)".to_owned()))
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_owned()),
        }
    }
}

fn member(base: &Value, label: &str, key: &Value) -> EvalResult<Value> {
    match (base, key) {
        (Value::Object(map), _) => Ok(map.get(&plain(key)).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::String(name)) if name == "length" => {
            Ok(Value::from(items.len()))
        }
        (Value::Array(items), Value::Number(index)) => Ok(index
            .as_u64()
            .and_then(|index| items.get(index as usize))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::String(text), Value::String(name)) if name == "length" => {
            Ok(Value::from(text.chars().count()))
        }
        (Value::Null, _) => Err(format!(
            "cannot read property {} of null ({label})",
            display(key)
        )),
        _ => Ok(Value::Null),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn as_number(value: &Value) -> EvalResult<f64> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| "number out of range".to_owned()),
        Value::Bool(flag) => Ok(f64::from(u8::from(*flag))),
        Value::Null => Ok(0.0),
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| format!("{} is not a number", display(value))),
        _ => Err(format!("{} is not a number", display(value))),
    }
}

/// Whole numbers come back as integers so `1 + 2` renders as `3`.
fn number(value: f64) -> EvalResult<Value> {
    if !value.is_finite() {
        return Err("result is not a finite number".to_owned());
    }
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        return Ok(Value::from(value as i64));
    }
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_owned())
}

/// String form used for concatenation and object keys.
fn plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bindings() -> BTreeMap<String, Value> {
        let mut bindings = BTreeMap::new();
        bindings.insert("count".to_owned(), json!(3));
        bindings.insert("name".to_owned(), json!("ada"));
        bindings.insert(
            "user".to_owned(),
            json!({"profile": {"age": 36}, "tags": ["a", "b"]}),
        );
        bindings
    }

    fn eval(source: &str) -> EvalResult<Value> {
        evaluate(source, &bindings())
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval("count % 2").unwrap(), json!(1));
        assert_eq!(eval("7 / 2").unwrap(), json!(3.5));
        assert_eq!(eval("-count + 1").unwrap(), json!(-2));
    }

    #[test]
    fn member_access_reads_bindings() {
        assert_eq!(eval("user.profile.age >= 18").unwrap(), json!(true));
        assert_eq!(eval("user.tags[1]").unwrap(), json!("b"));
        assert_eq!(eval("user.tags.length").unwrap(), json!(2));
        assert_eq!(eval("user['profile'].age").unwrap(), json!(36));
        assert_eq!(eval("user.missing").unwrap(), Value::Null);
        assert!(eval("user.missing.deeper").is_err());
    }

    #[test]
    fn strings_concatenate_and_compare() {
        assert_eq!(eval("'hi ' + name").unwrap(), json!("hi ada"));
        assert_eq!(eval("name + count").unwrap(), json!("ada3"));
        assert_eq!(eval("name == \"ada\" && count > 2").unwrap(), json!(true));
        assert_eq!(eval("!(count === 3) || name != 'ada'").unwrap(), json!(false));
    }

    #[test]
    fn logical_operators_short_circuit_values() {
        assert_eq!(eval("null || name").unwrap(), json!("ada"));
        assert_eq!(eval("0 && name").unwrap(), json!(0));
    }

    #[test]
    fn rejects_unknown_identifiers_and_calls() {
        assert_eq!(eval("secret").unwrap_err(), "secret is not defined");
        assert!(eval("process.exit(1)").is_err());
        assert!(eval("count = 4").is_err());
        assert!(eval("1 / 0").is_err());
        assert!(eval("").is_err());
        assert!(eval("'open").is_err());
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let source = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(eval(&source).is_err());
    }

    #[test]
    fn truthiness_follows_script_rules() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("0")));
    }
}
