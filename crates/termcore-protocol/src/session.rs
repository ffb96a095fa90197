//! Session shape: tabs, splits, panels, output, and background jobs.

use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Hard cap on splits per session.
pub const MAX_SPLITS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabKind {
    #[default]
    Console,
    File,
    Git,
    Package,
    Build,
    Test,
    Deploy,
    Debug,
    Network,
}

impl TabKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::File => "file",
            Self::Git => "git",
            Self::Package => "package",
            Self::Build => "build",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Debug => "debug",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for TabKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDirection {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Success,
    System,
}

/// One line of terminal output. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub id: OutputId,
    #[serde(rename = "type", default)]
    pub kind: OutputKind,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl OutputEntry {
    pub fn new(kind: OutputKind, message: impl Into<String>) -> Self {
        Self {
            id: OutputId::generate(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(OutputKind::System, message)
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutputKind::Error
    }
}

/// A logical command stream with its own history, output, and directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TabKind,
    #[serde(default)]
    pub outputs: VecDeque<OutputEntry>,
    #[serde(default)]
    pub command_history: Vec<String>,
    /// `-1` means "not browsing history".
    #[serde(default = "not_browsing")]
    pub history_index: i64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_modified: bool,
    #[serde(default)]
    pub directory: String,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    /// Composed command line. View-adjacent, never persisted.
    #[serde(skip)]
    pub input_line: String,
}

fn not_browsing() -> i64 {
    -1
}

impl Tab {
    pub fn new(kind: TabKind, name: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            id: TabId::generate(),
            name: name.into(),
            kind,
            outputs: VecDeque::new(),
            command_history: Vec::new(),
            history_index: -1,
            is_active: false,
            is_pinned: false,
            is_modified: false,
            directory: directory.into(),
            last_activity: Utc::now(),
            input_line: String::new(),
        }
    }

    /// Appends entries, silently dropping the oldest once `cap` is exceeded.
    pub fn push_outputs(&mut self, entries: impl IntoIterator<Item = OutputEntry>, cap: usize) {
        for entry in entries {
            self.outputs.push_back(entry);
        }
        let cap = cap.max(1);
        while self.outputs.len() > cap {
            self.outputs.pop_front();
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// A layout region hosting an ordered, non-empty set of tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub id: SplitId,
    #[serde(default)]
    pub direction: SplitDirection,
    #[serde(default)]
    pub tabs: Vec<TabId>,
    /// Percentage of the layout.
    #[serde(default = "full_size")]
    pub size: f32,
    #[serde(default = "resizable_default")]
    pub resizable: bool,
}

fn full_size() -> f32 {
    100.0
}

fn resizable_default() -> bool {
    true
}

impl Split {
    pub fn new(direction: SplitDirection) -> Self {
        Self {
            id: SplitId::generate(),
            direction,
            tabs: Vec::new(),
            size: 100.0,
            resizable: true,
        }
    }

    pub fn contains(&self, tab_id: &TabId) -> bool {
        self.tabs.iter().any(|id| id == tab_id)
    }
}

/// Ephemeral render binding between a tab and its surface. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panel {
    pub id: PanelId,
    pub tab_id: TabId,
    pub split_id: SplitId,
    pub scroll_anchor: usize,
    pub input_focused: bool,
}

impl Panel {
    pub fn bind(tab_id: TabId, split_id: SplitId) -> Self {
        Self {
            id: PanelId::generate(),
            tab_id,
            split_id,
            scroll_anchor: 0,
            input_focused: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: u32,
    pub command: String,
    pub tab_id: TabId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Canonical session state owned by the session store.
///
/// Every field is defaulted so older or newer snapshots still deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionState {
    pub directory: String,
    pub tabs: Vec<Tab>,
    pub splits: Vec<Split>,
    pub active_tab: Option<TabId>,
    /// Session-wide command history, oldest first.
    pub history: Vec<String>,
    pub files: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, String>,
    pub preferences: BTreeMap<String, Value>,
    pub jobs: Vec<Job>,
    pub next_job_id: u32,
    #[serde(skip)]
    pub panels: Vec<Panel>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            directory: "/".to_owned(),
            tabs: Vec::new(),
            splits: Vec::new(),
            active_tab: None,
            history: Vec::new(),
            files: BTreeMap::new(),
            environment: BTreeMap::new(),
            aliases: BTreeMap::new(),
            preferences: BTreeMap::new(),
            jobs: Vec::new(),
            next_job_id: 1,
            panels: Vec::new(),
        }
    }
}

impl SessionState {
    pub fn tab(&self, tab_id: &TabId) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.id == *tab_id)
    }

    pub fn tab_mut(&mut self, tab_id: &TabId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|tab| tab.id == *tab_id)
    }

    pub fn active(&self) -> Option<&Tab> {
        self.active_tab.as_ref().and_then(|id| self.tab(id))
    }

    pub fn split_of(&self, tab_id: &TabId) -> Option<&Split> {
        self.splits.iter().find(|split| split.contains(tab_id))
    }

    pub fn panel_for(&self, tab_id: &TabId) -> Option<&Panel> {
        self.panels.iter().find(|panel| panel.tab_id == *tab_id)
    }

    /// Total commands recorded across all tabs.
    pub fn command_count(&self) -> usize {
        self.tabs.iter().map(|tab| tab.command_history.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_outputs_drops_oldest_past_cap() {
        let mut tab = Tab::new(TabKind::Console, "Console", "/");
        let entries = (0..5).map(|i| OutputEntry::info(format!("line {i}")));
        tab.push_outputs(entries, 3);
        let messages: Vec<_> = tab.outputs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn output_kind_serializes_under_type_key() {
        let entry = OutputEntry::error("bad");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "bad");
    }

    #[test]
    fn session_state_tolerates_missing_and_unknown_fields() {
        let state: SessionState =
            serde_json::from_str(r#"{"directory":"/tmp","futureField":42}"#).unwrap();
        assert_eq!(state.directory, "/tmp");
        assert!(state.tabs.is_empty());
        assert_eq!(state.next_job_id, 1);
    }

    #[test]
    fn input_line_is_not_persisted() {
        let mut tab = Tab::new(TabKind::Git, "Git", "/repo");
        tab.input_line = "git st".into();
        let json = serde_json::to_string(&tab).unwrap();
        let back: Tab = serde_json::from_str(&json).unwrap();
        assert!(back.input_line.is_empty());
        assert_eq!(back.kind, TabKind::Git);
        assert_eq!(back.history_index, -1);
    }
}
