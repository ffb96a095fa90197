//! Command contracts shared by plugins, the built-in catalog, and the dispatcher.

use crate::error::TerminalResult;
use crate::ids::TabId;
use crate::mutation::Mutation;
use crate::session::{Job, OutputEntry, OutputKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Incremental output of a streaming command. The stream closing ends it.
pub type OutputStream = BoxStream<'static, OutputLine>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Output arrives through [`CommandReply::stream`] instead of in one shot.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, usage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usage: usage.into(),
            description: String::new(),
            metadata: CommandMetadata::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.metadata.aliases.push(alias.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.metadata.streaming = true;
        self
    }

    /// Completion candidacy for `partial`: the longest case-insensitive
    /// prefix shared with the name or an alias, and whether an alias gave it.
    ///
    /// `None` unless the first character matches. `"he"` is a candidate for
    /// both `help` and `history`, sharing two and one characters.
    pub fn completion_match(&self, partial: &str) -> Option<(usize, bool)> {
        let partial = partial.to_lowercase();
        let by_name = shared_prefix_len(&partial, &self.name.to_lowercase());
        let by_alias = self
            .metadata
            .aliases
            .iter()
            .map(|alias| shared_prefix_len(&partial, &alias.to_lowercase()))
            .max()
            .unwrap_or(0);
        let best = by_name.max(by_alias);
        (best > 0).then_some((best, by_alias > by_name))
    }
}

fn shared_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Output produced by a handler before the dispatcher normalizes it.
///
/// A missing timestamp is replaced by the dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    #[serde(rename = "type", default)]
    pub kind: OutputKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OutputLine {
    pub fn new(kind: OutputKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Log, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Success, message)
    }

    pub fn into_entry(self) -> OutputEntry {
        let mut entry = OutputEntry::new(self.kind, self.message);
        if let Some(timestamp) = self.timestamp {
            entry.timestamp = timestamp;
        }
        entry
    }
}

/// Read-only view of the session handed to a command handler.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub tab_id: Option<TabId>,
    pub directory: String,
    pub username: String,
    pub files: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, String>,
    /// The invoking tab's history, oldest first.
    pub history: Vec<String>,
    /// The invoking tab's output at dispatch time.
    pub outputs: Vec<OutputEntry>,
    pub jobs: Vec<Job>,
    /// Specs of every command currently resolvable.
    pub commands: Vec<CommandSpec>,
}

/// What a handler hands back: output, state effects, and an optional stream.
#[derive(Default)]
pub struct CommandReply {
    pub lines: Vec<OutputLine>,
    /// Applied through the session store after the handler resolves.
    pub effects: Vec<Mutation>,
    pub stream: Option<OutputStream>,
}

impl CommandReply {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn lines(lines: Vec<OutputLine>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }

    pub fn line(line: OutputLine) -> Self {
        Self::lines(vec![line])
    }

    pub fn stream(stream: OutputStream) -> Self {
        Self {
            stream: Some(stream),
            ..Self::default()
        }
    }

    pub fn with_effect(mut self, effect: Mutation) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_line(mut self, line: OutputLine) -> Self {
        self.lines.push(line);
        self
    }
}

impl fmt::Debug for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandReply")
            .field("lines", &self.lines)
            .field("effects", &self.effects)
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, args: &[String], ctx: &CommandContext) -> TerminalResult<CommandReply>;
}

/// A named command bound to its handler.
#[derive(Clone)]
pub struct Command {
    pub spec: CommandSpec,
    pub handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(spec: CommandSpec, handler: Arc<dyn CommandHandler>) -> Self {
        Self { spec, handler }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("spec", &self.spec).finish()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&[String], &CommandContext) -> TerminalResult<CommandReply> + Send + Sync,
{
    async fn run(&self, args: &[String], ctx: &CommandContext) -> TerminalResult<CommandReply> {
        (self.0)(args, ctx)
    }
}

/// Builds a command from a synchronous closure.
pub fn command_fn<F>(spec: CommandSpec, handler: F) -> Command
where
    F: Fn(&[String], &CommandContext) -> TerminalResult<CommandReply> + Send + Sync + 'static,
{
    Command::new(spec, Arc::new(FnHandler(handler)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_match_is_case_insensitive_and_covers_aliases() {
        let spec = CommandSpec::new("history", "history [n]").alias("hist");
        assert_eq!(spec.completion_match("HIS"), Some((3, false)));
        assert_eq!(spec.completion_match("he"), Some((1, false)));
        assert_eq!(spec.completion_match("ls"), None);

        let aliased = CommandSpec::new("list", "list").alias("ls");
        assert_eq!(aliased.completion_match("l"), Some((1, false)));
        assert_eq!(aliased.completion_match("ls"), Some((2, true)));
    }

    #[test]
    fn into_entry_keeps_explicit_timestamp() {
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let line = OutputLine {
            kind: OutputKind::Success,
            message: "done".into(),
            timestamp: Some(at),
        };
        let entry = line.into_entry();
        assert_eq!(entry.timestamp, at);
        assert_eq!(entry.kind, OutputKind::Success);
    }

    #[tokio::test]
    async fn command_fn_wraps_closure() {
        let command = command_fn(CommandSpec::new("greet", "greet <name>"), |args, _ctx| {
            Ok(CommandReply::line(OutputLine::info(format!(
                "hello {}",
                args.join(" ")
            ))))
        });
        let reply = command
            .handler
            .run(&["world".to_owned()], &CommandContext::default())
            .await
            .unwrap();
        assert_eq!(reply.lines[0].message, "hello world");
        assert_eq!(command.name(), "greet");
    }
}
