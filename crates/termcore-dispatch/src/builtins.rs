//! The built-in shell-like command catalog.
//!
//! Handlers only read the [`CommandContext`]; anything that changes the
//! session is returned as an effect and applied by the dispatcher.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use regex::RegexBuilder;
use termcore_protocol::{
    CodeAssistant, Command, CommandCatalog, CommandContext, CommandHandler, CommandReply,
    CommandSpec, JobStatus, Mutation, OutputLine, TerminalError, TerminalResult, command_fn,
};
use termcore_session::{parent_path, resolve_path};

/// Interval between `ping` replies.
const PING_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PING_COUNT: u32 = 4;

pub struct BuiltinCatalog {
    commands: IndexMap<String, Command>,
    aliases: IndexMap<String, String>,
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinCatalog {
    /// Catalog without a code assistant; `ask` and `explain` report that.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_assistant(assistant: Arc<dyn CodeAssistant>) -> Self {
        Self::build(Some(assistant))
    }

    fn build(assistant: Option<Arc<dyn CodeAssistant>>) -> Self {
        let mut catalog = Self {
            commands: IndexMap::new(),
            aliases: IndexMap::new(),
        };
        for command in core_commands() {
            catalog.insert(command);
        }
        catalog.insert(Command::new(
            CommandSpec::new("ask", "ask <question>")
                .description("Ask the code assistant a question"),
            Arc::new(AssistantCommand {
                assistant: assistant.clone(),
                template: "{input}",
            }),
        ));
        catalog.insert(Command::new(
            CommandSpec::new("explain", "explain <code>")
                .description("Ask the code assistant to explain a snippet"),
            Arc::new(AssistantCommand {
                assistant,
                template: "Explain the following code:\n{input}",
            }),
        ));
        catalog.insert(Command::new(
            CommandSpec::new("ping", "ping <host> [-c count]")
                .description("Send simulated echo requests to a host")
                .streaming(),
            Arc::new(PingCommand {
                interval: PING_INTERVAL,
            }),
        ));
        catalog
    }

    /// Adds or replaces a command, indexing its aliases.
    pub fn insert(&mut self, command: Command) {
        for alias in &command.spec.metadata.aliases {
            self.aliases.insert(alias.clone(), command.spec.name.clone());
        }
        self.commands.insert(command.spec.name.clone(), command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandCatalog for BuiltinCatalog {
    fn resolve(&self, name: &str) -> Option<Command> {
        let name = self.aliases.get(name).map_or(name, String::as_str);
        self.commands.get(name).cloned()
    }

    fn commands(&self) -> Vec<CommandSpec> {
        self.commands
            .values()
            .map(|command| command.spec.clone())
            .collect()
    }
}

fn home(ctx: &CommandContext) -> &str {
    ctx.environment
        .get("HOME")
        .map_or("/home/user", String::as_str)
}

fn resolve(ctx: &CommandContext, path: &str) -> String {
    resolve_path(&ctx.directory, path, home(ctx))
}

fn lines(messages: impl IntoIterator<Item = String>) -> CommandReply {
    CommandReply::lines(messages.into_iter().map(OutputLine::log).collect())
}

/// Replaces `$NAME` and `${NAME}` with environment values.
fn expand_variables(input: &str, ctx: &CommandContext) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            output.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if name.is_empty() {
            output.push('$');
        } else if let Some(value) = ctx.environment.get(&name) {
            output.push_str(value);
        }
    }
    output
}

fn strip_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

/// Splits `KEY=VALUE`, rejecting empty or non-identifier keys.
fn parse_assignment(raw: &str) -> TerminalResult<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(TerminalError::Validation(format!(
            "expected KEY=VALUE, got {raw}"
        )));
    };
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid {
        return Err(TerminalError::Validation(format!("invalid name: {key}")));
    }
    Ok((key.to_owned(), strip_quotes(value).to_owned()))
}

/// Immediate children of `directory` in the virtual file map.
fn list_directory(ctx: &CommandContext, directory: &str) -> Vec<String> {
    let prefix = if directory == "/" {
        "/".to_owned()
    } else {
        format!("{directory}/")
    };
    let mut entries = BTreeSet::new();
    for path in ctx.files.keys() {
        if let Some(rest) = path.strip_prefix(&prefix) {
            match rest.split_once('/') {
                Some((dir, _)) => entries.insert(format!("{dir}/")),
                None => entries.insert(rest.to_owned()),
            };
        }
    }
    entries.into_iter().collect()
}

fn directory_exists(ctx: &CommandContext, directory: &str) -> bool {
    if directory == "/" || directory == home(ctx) || directory == ctx.directory {
        return true;
    }
    let prefix = format!("{directory}/");
    ctx.files.keys().any(|path| path.starts_with(&prefix))
        || home(ctx).starts_with(&prefix)
}

fn core_commands() -> Vec<Command> {
    vec![
        command_fn(
            CommandSpec::new("help", "help [command]")
                .description("List commands or show usage for one")
                .alias("?"),
            |args, ctx| {
                if let Some(name) = args.first() {
                    let spec = ctx
                        .commands
                        .iter()
                        .find(|spec| spec.name == *name || spec.metadata.aliases.contains(name))
                        .ok_or_else(|| TerminalError::NotFound(format!("no help for {name}")))?;
                    let mut reply = CommandReply::line(OutputLine::info(format!(
                        "usage: {}",
                        spec.usage
                    )));
                    if !spec.description.is_empty() {
                        reply = reply.with_line(OutputLine::log(spec.description.clone()));
                    }
                    return Ok(reply);
                }
                let mut specs = ctx.commands.clone();
                specs.sort_by(|a, b| a.name.cmp(&b.name));
                let width = specs.iter().map(|spec| spec.name.len()).max().unwrap_or(0);
                let mut reply = CommandReply::line(OutputLine::info("Available commands:"));
                for spec in specs {
                    reply = reply.with_line(OutputLine::log(format!(
                        "  {:width$}  {}",
                        spec.name, spec.description
                    )));
                }
                Ok(reply)
            },
        ),
        command_fn(
            CommandSpec::new("history", "history [count]")
                .description("Show this tab's command history"),
            |args, ctx| {
                let count = match args.first() {
                    Some(raw) => raw.parse::<usize>().map_err(|_| {
                        TerminalError::Validation(format!("history: invalid count {raw}"))
                    })?,
                    None => ctx.history.len(),
                };
                let skip = ctx.history.len().saturating_sub(count);
                Ok(lines(
                    ctx.history
                        .iter()
                        .enumerate()
                        .skip(skip)
                        .map(|(index, line)| format!("{:>5}  {line}", index + 1)),
                ))
            },
        ),
        command_fn(
            CommandSpec::new("clear", "clear")
                .description("Clear this tab's output")
                .alias("cls"),
            |_, ctx| {
                let Some(tab_id) = ctx.tab_id.clone() else {
                    return Ok(CommandReply::empty());
                };
                Ok(CommandReply::empty().with_effect(Mutation::ClearOutput { tab_id }))
            },
        ),
        command_fn(
            CommandSpec::new("echo", "echo [text...]").description("Print text"),
            |args, ctx| {
                let text = expand_variables(&args.join(" "), ctx);
                Ok(CommandReply::line(OutputLine::log(text)))
            },
        ),
        command_fn(
            CommandSpec::new("pwd", "pwd").description("Print the working directory"),
            |_, ctx| Ok(CommandReply::line(OutputLine::log(ctx.directory.clone()))),
        ),
        command_fn(
            CommandSpec::new("cd", "cd [directory]").description("Change directory"),
            |args, ctx| {
                let target = match args.first().map(String::as_str) {
                    Some("-") => ctx
                        .environment
                        .get("OLDPWD")
                        .cloned()
                        .unwrap_or_else(|| ctx.directory.clone()),
                    Some(path) => resolve(ctx, path),
                    None => home(ctx).to_owned(),
                };
                if ctx.files.contains_key(&target) {
                    return Err(TerminalError::Validation(format!(
                        "cd: not a directory: {target}"
                    )));
                }
                if !directory_exists(ctx, &target) {
                    return Err(TerminalError::NotFound(format!(
                        "cd: no such directory: {target}"
                    )));
                }
                Ok(CommandReply::empty()
                    .with_effect(Mutation::SetEnv {
                        key: "OLDPWD".to_owned(),
                        value: ctx.directory.clone(),
                    })
                    .with_effect(Mutation::ChangeDirectory {
                        tab_id: ctx.tab_id.clone(),
                        path: target,
                    }))
            },
        ),
        command_fn(
            CommandSpec::new("ls", "ls [directory]")
                .description("List directory contents")
                .alias("dir"),
            |args, ctx| {
                let directory = match args.iter().find(|arg| !arg.starts_with('-')) {
                    Some(path) => resolve(ctx, path),
                    None => ctx.directory.clone(),
                };
                if ctx.files.contains_key(&directory) {
                    return Ok(CommandReply::line(OutputLine::log(directory)));
                }
                Ok(lines(list_directory(ctx, &directory)))
            },
        ),
        command_fn(
            CommandSpec::new("cat", "cat <file...>").description("Print file contents"),
            |args, ctx| {
                if args.is_empty() {
                    return Err(TerminalError::Validation("usage: cat <file...>".into()));
                }
                let mut reply = CommandReply::empty();
                for arg in args {
                    let path = resolve(ctx, arg);
                    let content = ctx.files.get(&path).ok_or_else(|| {
                        TerminalError::NotFound(format!("cat: {arg}: No such file"))
                    })?;
                    for line in content.lines() {
                        reply = reply.with_line(OutputLine::log(line));
                    }
                }
                Ok(reply)
            },
        ),
        command_fn(
            CommandSpec::new("touch", "touch <file...>").description("Create empty files"),
            |args, ctx| {
                if args.is_empty() {
                    return Err(TerminalError::Validation("usage: touch <file...>".into()));
                }
                let mut reply = CommandReply::empty();
                for arg in args {
                    let path = resolve(ctx, arg);
                    if !ctx.files.contains_key(&path) {
                        reply = reply.with_effect(Mutation::WriteFile {
                            path,
                            content: String::new(),
                        });
                    }
                }
                Ok(reply)
            },
        ),
        command_fn(
            CommandSpec::new("rm", "rm <file...>").description("Remove files"),
            |args, ctx| {
                let targets: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
                if targets.is_empty() {
                    return Err(TerminalError::Validation("usage: rm <file...>".into()));
                }
                let mut reply = CommandReply::empty();
                for arg in targets {
                    let path = resolve(ctx, arg);
                    if !ctx.files.contains_key(&path) {
                        return Err(TerminalError::NotFound(format!(
                            "rm: {arg}: No such file"
                        )));
                    }
                    reply = reply.with_effect(Mutation::RemoveFile { path });
                }
                Ok(reply)
            },
        ),
        command_fn(
            CommandSpec::new("env", "env").description("Print environment variables"),
            |_, ctx| {
                Ok(lines(
                    ctx.environment
                        .iter()
                        .map(|(key, value)| format!("{key}={value}")),
                ))
            },
        ),
        command_fn(
            CommandSpec::new("export", "export KEY=VALUE...")
                .description("Set environment variables"),
            |args, ctx| {
                if args.is_empty() {
                    return Ok(lines(
                        ctx.environment
                            .iter()
                            .map(|(key, value)| format!("export {key}={value}")),
                    ));
                }
                let mut reply = CommandReply::empty();
                for arg in args {
                    let (key, value) = parse_assignment(arg)?;
                    let value = expand_variables(&value, ctx);
                    reply = reply.with_effect(Mutation::SetEnv { key, value });
                }
                Ok(reply)
            },
        ),
        command_fn(
            CommandSpec::new("unset", "unset <name...>")
                .description("Remove environment variables"),
            |args, _| {
                if args.is_empty() {
                    return Err(TerminalError::Validation("usage: unset <name...>".into()));
                }
                Ok(args.iter().fold(CommandReply::empty(), |reply, key| {
                    reply.with_effect(Mutation::UnsetEnv { key: key.clone() })
                }))
            },
        ),
        command_fn(
            CommandSpec::new("alias", "alias [name=expansion]")
                .description("Define or list command aliases"),
            |args, ctx| {
                if args.is_empty() {
                    return Ok(lines(
                        ctx.aliases
                            .iter()
                            .map(|(name, expansion)| format!("alias {name}='{expansion}'")),
                    ));
                }
                let (name, expansion) = parse_assignment(&args.join(" "))?;
                if expansion.trim().is_empty() {
                    return Err(TerminalError::Validation(format!(
                        "alias: empty expansion for {name}"
                    )));
                }
                Ok(CommandReply::empty().with_effect(Mutation::SetAlias { name, expansion }))
            },
        ),
        command_fn(
            CommandSpec::new("unalias", "unalias <name>").description("Remove an alias"),
            |args, ctx| {
                let name = args
                    .first()
                    .ok_or_else(|| TerminalError::Validation("usage: unalias <name>".into()))?;
                if !ctx.aliases.contains_key(name) {
                    return Err(TerminalError::NotFound(format!("unalias: {name}: not found")));
                }
                Ok(CommandReply::empty().with_effect(Mutation::RemoveAlias { name: name.clone() }))
            },
        ),
        command_fn(
            CommandSpec::new("jobs", "jobs").description("List background jobs"),
            |_, ctx| {
                Ok(lines(ctx.jobs.iter().map(|job| {
                    let status = match job.status {
                        JobStatus::Running => "Running",
                        JobStatus::Done => "Done",
                        JobStatus::Failed => "Failed",
                    };
                    format!("[{}]  {status:<8} {}", job.id, job.command)
                })))
            },
        ),
        command_fn(
            CommandSpec::new("grep", "grep [-i] [-v] <pattern>")
                .description("Filter this tab's output with a regular expression"),
            |args, ctx| {
                let mut case_insensitive = false;
                let mut invert = false;
                let mut pattern = None;
                for arg in args {
                    match arg.as_str() {
                        "-i" => case_insensitive = true,
                        "-v" => invert = true,
                        other => pattern = Some(strip_quotes(other).to_owned()),
                    }
                }
                let pattern = pattern
                    .ok_or_else(|| TerminalError::Validation("usage: grep <pattern>".into()))?;
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|error| {
                        TerminalError::Validation(format!("grep: invalid pattern: {error}"))
                    })?;
                Ok(lines(
                    ctx.outputs
                        .iter()
                        .filter(|entry| regex.is_match(&entry.message) != invert)
                        .map(|entry| entry.message.clone()),
                ))
            },
        ),
        command_fn(
            CommandSpec::new("date", "date").description("Print the current date and time"),
            |_, _| Ok(CommandReply::line(OutputLine::log(Utc::now().to_rfc2822()))),
        ),
        command_fn(
            CommandSpec::new("whoami", "whoami").description("Print the current user"),
            |_, ctx| Ok(CommandReply::line(OutputLine::log(ctx.username.clone()))),
        ),
        command_fn(
            CommandSpec::new("dirname", "dirname <path>").description("Strip the last path component"),
            |args, ctx| {
                let path = args
                    .first()
                    .ok_or_else(|| TerminalError::Validation("usage: dirname <path>".into()))?;
                let resolved = resolve(ctx, path);
                Ok(CommandReply::line(OutputLine::log(parent_path(&resolved))))
            },
        ),
    ]
}

struct AssistantCommand {
    assistant: Option<Arc<dyn CodeAssistant>>,
    template: &'static str,
}

#[async_trait]
impl CommandHandler for AssistantCommand {
    async fn run(&self, args: &[String], _ctx: &CommandContext) -> TerminalResult<CommandReply> {
        let Some(assistant) = &self.assistant else {
            return Err(TerminalError::Collaborator(
                "no code assistant is configured".into(),
            ));
        };
        let input = args.join(" ");
        if input.trim().is_empty() {
            return Err(TerminalError::Validation("a prompt is required".into()));
        }
        let answer = assistant.run(&self.template.replace("{input}", &input)).await?;
        Ok(CommandReply::lines(
            answer.lines().map(OutputLine::info).collect(),
        ))
    }
}

/// Fake round-trip time in `10..33` ms for reply `seq`.
fn simulated_latency(seq: u32) -> u32 {
    10 + seq.wrapping_mul(7) % 23
}

struct PingCommand {
    interval: Duration,
}

#[async_trait]
impl CommandHandler for PingCommand {
    async fn run(&self, args: &[String], _ctx: &CommandContext) -> TerminalResult<CommandReply> {
        let mut host = None;
        let mut count = DEFAULT_PING_COUNT;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-c" {
                let raw = iter
                    .next()
                    .ok_or_else(|| TerminalError::Validation("ping: -c needs a count".into()))?;
                count = raw
                    .parse()
                    .map_err(|_| TerminalError::Validation(format!("ping: invalid count {raw}")))?;
            } else {
                host = Some(arg.clone());
            }
        }
        let host = host.ok_or_else(|| TerminalError::Validation("usage: ping <host>".into()))?;
        let interval = self.interval;

        let stream = async_stream::stream! {
            yield OutputLine::info(format!("PING {host}: 56 data bytes"));
            for seq in 1..=count {
                tokio::time::sleep(interval).await;
                let millis = simulated_latency(seq);
                yield OutputLine::log(format!("64 bytes from {host}: icmp_seq={seq} time={millis} ms"));
            }
            yield OutputLine::success(format!(
                "--- {host} ping statistics --- {count} packets transmitted, {count} received"
            ));
        };
        Ok(CommandReply::stream(Box::pin(stream)))
    }
}
