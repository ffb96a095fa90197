//! Command-name completion with a circular selection mode.

use std::cmp::Reverse;

use termcore_protocol::CommandSpec;

use crate::suggest::edit_distance;

/// Keys the completion menu reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKey {
    ArrowUp,
    ArrowDown,
    /// Enter or Tab.
    Accept,
    Escape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Nothing matched; the line is unchanged.
    NoMatch,
    /// Exactly one match: the completed line, with a trailing space.
    Completed(String),
    /// Several matches, ranked. Selection mode is now active with nothing
    /// highlighted.
    Choices(Vec<String>),
}

/// Per-tab completion state.
#[derive(Debug, Clone, Default)]
pub struct Autocomplete {
    suggestions: Vec<String>,
    selected: Option<usize>,
}

impl Autocomplete {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the command token of `line` against `specs`.
    ///
    /// Only the first token is completed; a line that already has arguments
    /// yields [`Completion::NoMatch`]. `recent` lists recently used command
    /// names, most recent first, and breaks ranking ties.
    pub fn trigger(&mut self, line: &str, specs: &[CommandSpec], recent: &[String]) -> Completion {
        self.reset();
        let partial = line.trim_start();
        if partial.is_empty() || partial.contains(char::is_whitespace) {
            return Completion::NoMatch;
        }

        let matches = rank(partial, specs, recent);
        match matches.len() {
            0 => Completion::NoMatch,
            1 => Completion::Completed(format!("{} ", matches[0])),
            _ => {
                self.suggestions = matches.clone();
                Completion::Choices(matches)
            }
        }
    }

    /// Moves or accepts the selection. Returns the completed line on accept.
    pub fn key(&mut self, key: CompletionKey) -> Option<String> {
        let count = self.suggestions.len();
        if count == 0 {
            return None;
        }
        match key {
            CompletionKey::ArrowDown => {
                self.selected = Some(match self.selected {
                    None => 0,
                    Some(index) => (index + 1) % count,
                });
                None
            }
            CompletionKey::ArrowUp => {
                self.selected = Some(match self.selected {
                    None | Some(0) => count - 1,
                    Some(index) => index - 1,
                });
                None
            }
            CompletionKey::Accept => {
                let index = self.selected?;
                let line = format!("{} ", self.suggestions[index]);
                self.reset();
                Some(line)
            }
            CompletionKey::Escape => {
                self.reset();
                None
            }
        }
    }

    pub fn is_selecting(&self) -> bool {
        !self.suggestions.is_empty()
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn reset(&mut self) {
        self.suggestions.clear();
        self.selected = None;
    }
}

/// Candidates share the first character with the partial. Name matches rank
/// before alias matches, then recency, then the longer shared prefix, then
/// edit distance, then name.
fn rank(partial: &str, specs: &[CommandSpec], recent: &[String]) -> Vec<String> {
    let lowered = partial.to_lowercase();
    let mut scored: Vec<(bool, usize, Reverse<usize>, usize, &str)> = specs
        .iter()
        .filter_map(|spec| {
            let (shared, by_alias) = spec.completion_match(partial)?;
            let recency = recent
                .iter()
                .position(|name| *name == spec.name)
                .unwrap_or(usize::MAX);
            let distance = edit_distance(&lowered, &spec.name.to_lowercase());
            Some((by_alias, recency, Reverse(shared), distance, spec.name.as_str()))
        })
        .collect();
    scored.sort();
    scored.dedup_by(|a, b| a.4 == b.4);
    scored.into_iter().map(|(.., name)| name.to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(names: &[&str]) -> Vec<CommandSpec> {
        names.iter().map(|name| CommandSpec::new(*name, *name)).collect()
    }

    #[test]
    fn multiple_matches_enter_selection_with_nothing_selected() {
        let mut complete = Autocomplete::new();
        let outcome = complete.trigger("he", &specs(&["history", "help", "ls"]), &[]);
        assert_eq!(
            outcome,
            Completion::Choices(vec!["help".to_owned(), "history".to_owned()])
        );
        assert_eq!(complete.selected(), None);

        complete.key(CompletionKey::ArrowDown);
        assert_eq!(complete.selected(), Some(0));
    }

    #[test]
    fn selection_wraps_at_both_ends() {
        let mut complete = Autocomplete::new();
        complete.trigger("h", &specs(&["help", "history", "head"]), &[]);
        complete.key(CompletionKey::ArrowUp);
        assert_eq!(complete.selected(), Some(2));
        complete.key(CompletionKey::ArrowDown);
        assert_eq!(complete.selected(), Some(0));
        complete.key(CompletionKey::ArrowUp);
        assert_eq!(complete.selected(), Some(2));
    }

    #[test]
    fn accept_returns_highlighted_entry() {
        let mut complete = Autocomplete::new();
        complete.trigger("HE", &specs(&["help", "history"]), &[]);
        assert_eq!(complete.key(CompletionKey::Accept), None);
        complete.key(CompletionKey::ArrowDown);
        complete.key(CompletionKey::ArrowDown);
        assert_eq!(complete.key(CompletionKey::Accept), Some("history ".to_owned()));
        assert!(!complete.is_selecting());
    }

    #[test]
    fn longer_shared_prefix_ranks_first() {
        let mut complete = Autocomplete::new();
        let outcome = complete.trigger("hel", &specs(&["history", "help", "head", "ls"]), &[]);
        assert_eq!(
            outcome,
            Completion::Choices(vec!["help".to_owned(), "head".to_owned(), "history".to_owned()])
        );
    }

    #[test]
    fn different_first_character_never_matches() {
        let mut complete = Autocomplete::new();
        let outcome = complete.trigger("zz", &specs(&["help", "history"]), &[]);
        assert_eq!(outcome, Completion::NoMatch);
        assert!(!complete.is_selecting());
    }

    #[test]
    fn single_match_completes_with_trailing_space() {
        let mut complete = Autocomplete::new();
        let outcome = complete.trigger("pw", &specs(&["pwd", "ls"]), &[]);
        assert_eq!(outcome, Completion::Completed("pwd ".to_owned()));
        assert!(!complete.is_selecting());
    }

    #[test]
    fn aliases_match_but_rank_after_names() {
        let mut complete = Autocomplete::new();
        let specs = vec![
            CommandSpec::new("list", "list").alias("ls"),
            CommandSpec::new("lsof", "lsof"),
        ];
        let outcome = complete.trigger("ls", &specs, &[]);
        assert_eq!(
            outcome,
            Completion::Choices(vec!["lsof".to_owned(), "list".to_owned()])
        );
    }

    #[test]
    fn recent_commands_rank_first_among_equals() {
        let mut complete = Autocomplete::new();
        let outcome = complete.trigger("he", &specs(&["help", "history"]), &["history".to_owned()]);
        assert_eq!(
            outcome,
            Completion::Choices(vec!["history".to_owned(), "help".to_owned()])
        );
    }

    #[test]
    fn lines_with_arguments_do_not_complete() {
        let mut complete = Autocomplete::new();
        assert_eq!(complete.trigger("cat fi", &specs(&["cat"]), &[]), Completion::NoMatch);
        assert_eq!(complete.trigger("", &specs(&["cat"]), &[]), Completion::NoMatch);
        assert_eq!(complete.key(CompletionKey::ArrowDown), None);
    }
}
