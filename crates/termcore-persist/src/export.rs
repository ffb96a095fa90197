//! Human-readable text summaries of snapshots.
//!
//! The text form is a report, not an interchange format. Parsing it back
//! yields a skeleton state: directory, tabs by name, history, environment
//! and aliases. Output, files, jobs and preferences are not carried.

use std::fmt::Write as _;

use serde_json::Value;
use termcore_protocol::{
    SessionSnapshot, SessionState, Tab, TabKind, TerminalError, TerminalResult,
};

const HEADER: &str = "Terminal Session Export";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Summary,
    Tabs,
    History,
    Environment,
    Aliases,
}

pub fn render_text(snapshot: &SessionSnapshot) -> String {
    let state = &snapshot.state;
    let mut out = String::new();
    let _ = writeln!(out, "{HEADER}");
    let _ = writeln!(out, "{}", "=".repeat(HEADER.len()));
    let _ = writeln!(out, "Id: {}", snapshot.id);
    if let Some(name) = &snapshot.metadata.name {
        let _ = writeln!(out, "Name: {name}");
    }
    let _ = writeln!(out, "Saved: {}", snapshot.timestamp.to_rfc3339());
    let _ = writeln!(out, "Version: {}", snapshot.version);
    let _ = writeln!(out, "Directory: {}", state.directory);
    let _ = writeln!(out, "Tab count: {}", state.tabs.len());
    let _ = writeln!(out, "Command count: {}", state.command_count());
    let _ = writeln!(out, "Session history: {}", state.history.len());

    let _ = writeln!(out, "\nTabs:");
    for (index, tab) in state.tabs.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} ({}) {} [{} commands]",
            index + 1,
            tab.name,
            tab.kind,
            tab.directory,
            tab.command_history.len()
        );
    }

    let _ = writeln!(out, "\nHistory:");
    for (index, line) in state.history.iter().enumerate() {
        let _ = writeln!(out, "  {:>4}  {line}", index + 1);
    }

    let _ = writeln!(out, "\nEnvironment:");
    for (key, value) in &state.environment {
        let _ = writeln!(out, "  {key}={value}");
    }

    if !state.aliases.is_empty() {
        let _ = writeln!(out, "\nAliases:");
        for (name, expansion) in &state.aliases {
            let _ = writeln!(out, "  {name}={expansion}");
        }
    }
    out
}

/// Best-effort reconstruction from [`render_text`] output.
pub fn parse_text(data: &str) -> TerminalResult<SessionState> {
    let mut lines = data.lines().map(str::trim_end);
    if lines.next().map(str::trim) != Some(HEADER) {
        return Err(TerminalError::Validation(
            "text import expects a terminal session export".to_owned(),
        ));
    }

    let mut state = SessionState::default();
    let mut section = Section::Summary;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '=') {
            continue;
        }
        match trimmed {
            "Tabs:" => section = Section::Tabs,
            "History:" => section = Section::History,
            "Environment:" => section = Section::Environment,
            "Aliases:" => section = Section::Aliases,
            _ => match section {
                Section::Summary => {
                    if let Some(directory) = trimmed.strip_prefix("Directory:") {
                        state.directory = directory.trim().to_owned();
                    }
                }
                Section::Tabs => {
                    if let Some(tab) = parse_tab(trimmed) {
                        state.tabs.push(tab);
                    }
                }
                Section::History => {
                    let entry = trimmed
                        .split_once(char::is_whitespace)
                        .filter(|(number, _)| number.parse::<usize>().is_ok())
                        .map(|(_, rest)| rest.trim_start())
                        .unwrap_or(trimmed);
                    state.history.push(entry.to_owned());
                }
                Section::Environment => {
                    if let Some((key, value)) = trimmed.split_once('=') {
                        state.environment.insert(key.to_owned(), value.to_owned());
                    }
                }
                Section::Aliases => {
                    if let Some((name, expansion)) = trimmed.split_once('=') {
                        state.aliases.insert(name.to_owned(), expansion.to_owned());
                    }
                }
            },
        }
    }

    if let Some(first) = state.tabs.first_mut() {
        first.command_history = state.history.clone();
    }
    state.active_tab = state.tabs.first().map(|tab| tab.id.clone());
    Ok(state)
}

/// `1. Terminal 1 (console) /home/user [3 commands]`
fn parse_tab(line: &str) -> Option<Tab> {
    let (_, rest) = line.split_once(". ")?;
    let rest = rest.rsplit_once(" [").map_or(rest, |(head, _)| head);
    let open = rest.rfind(" (")?;
    let close = open + rest[open..].find(')')?;
    let name = &rest[..open];
    let kind = rest[open + 2..close].to_owned();
    let kind = serde_json::from_value::<TabKind>(Value::String(kind)).unwrap_or_default();
    let directory = rest[close + 1..].trim();
    let directory = if directory.is_empty() { "/" } else { directory };
    Some(Tab::new(kind, name, directory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionSnapshot {
        let mut state = SessionState {
            directory: "/home/user/project".into(),
            ..SessionState::default()
        };
        let mut shell = Tab::new(TabKind::Console, "Terminal 1", "/home/user/project");
        shell.command_history = vec!["ls".into(), "cd project".into()];
        state.tabs.push(shell);
        state.tabs.push(Tab::new(TabKind::Git, "Git (main)", "/home/user"));
        state.history = vec!["ls".into(), "cd project".into()];
        state.environment.insert("HOME".into(), "/home/user".into());
        state.environment.insert("EDITOR".into(), "vim".into());
        state.aliases.insert("ll".into(), "ls -la".into());
        SessionSnapshot {
            state,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn text_summary_lists_history_and_environment() {
        let text = render_text(&sample());
        assert!(text.starts_with(HEADER));
        assert!(text.contains("Directory: /home/user/project"));
        assert!(text.contains("Tab count: 2"));
        assert!(text.contains("Command count: 2"));
        assert!(text.contains("     1  ls"));
        assert!(text.contains("     2  cd project"));
        assert!(text.contains("  EDITOR=vim"));
        assert!(text.contains("  ll=ls -la"));
    }

    #[test]
    fn text_import_rebuilds_a_skeleton() {
        let state = parse_text(&render_text(&sample())).unwrap();
        assert_eq!(state.directory, "/home/user/project");
        assert_eq!(state.history, vec!["ls", "cd project"]);
        assert_eq!(state.environment["HOME"], "/home/user");
        assert_eq!(state.aliases["ll"], "ls -la");
        assert_eq!(state.tabs.len(), 2);
        assert_eq!(state.tabs[1].name, "Git (main)");
        assert_eq!(state.tabs[1].kind, TabKind::Git);
        assert_eq!(state.tabs[0].command_history.len(), 2);
        assert!(state.tabs[0].outputs.is_empty());
    }

    #[test]
    fn text_import_rejects_foreign_input() {
        assert!(matches!(
            parse_text("hello world"),
            Err(TerminalError::Validation(_))
        ));
    }
}
