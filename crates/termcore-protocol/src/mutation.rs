//! The single mutation surface applied by the session store.

use crate::ids::{SplitId, TabId};
use crate::session::{JobStatus, OutputEntry, SessionState, SplitDirection, TabKind};
use serde_json::Value;

/// Every state change in a session goes through one of these variants.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Appends a tab to the split holding the active tab and activates it.
    CreateTab {
        kind: TabKind,
        name: Option<String>,
    },
    SwitchTab {
        tab_id: TabId,
    },
    /// No-op for pinned tabs and for the session's only tab.
    CloseTab {
        tab_id: TabId,
    },
    PinTab {
        tab_id: TabId,
        pinned: bool,
    },
    RenameTab {
        tab_id: TabId,
        name: String,
    },
    MarkModified {
        tab_id: TabId,
        modified: bool,
    },
    /// No-op once the split cap is reached.
    CreateSplit {
        direction: SplitDirection,
    },
    ResizeSplit {
        split_id: SplitId,
        size: f32,
    },
    AppendOutput {
        tab_id: TabId,
        entries: Vec<OutputEntry>,
    },
    ClearOutput {
        tab_id: TabId,
    },
    RecordHistory {
        tab_id: TabId,
        line: String,
    },
    SetInputLine {
        tab_id: TabId,
        line: String,
    },
    /// `delta < 0` walks toward older entries, `delta > 0` toward newer.
    NavigateHistory {
        tab_id: TabId,
        delta: i32,
    },
    ChangeDirectory {
        tab_id: Option<TabId>,
        path: String,
    },
    SetEnv {
        key: String,
        value: String,
    },
    UnsetEnv {
        key: String,
    },
    SetAlias {
        name: String,
        expansion: String,
    },
    RemoveAlias {
        name: String,
    },
    StartJob {
        tab_id: TabId,
        command: String,
    },
    FinishJob {
        job_id: u32,
        status: JobStatus,
    },
    SetPreference {
        key: String,
        value: Value,
    },
    WriteFile {
        path: String,
        content: String,
    },
    RemoveFile {
        path: String,
    },
    Restore {
        state: Box<SessionState>,
    },
}

impl Mutation {
    /// Event name published to observers once the mutation applies.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CreateTab { .. } => "tab_created",
            Self::SwitchTab { .. } => "tab_switched",
            Self::CloseTab { .. } => "tab_closed",
            Self::PinTab { .. } => "tab_pinned",
            Self::RenameTab { .. } => "tab_renamed",
            Self::MarkModified { .. } => "tab_modified",
            Self::CreateSplit { .. } => "split_created",
            Self::ResizeSplit { .. } => "split_resized",
            Self::AppendOutput { .. } => "output_appended",
            Self::ClearOutput { .. } => "output_cleared",
            Self::RecordHistory { .. } => "history_recorded",
            Self::SetInputLine { .. } => "input_changed",
            Self::NavigateHistory { .. } => "history_navigated",
            Self::ChangeDirectory { .. } => "directory_changed",
            Self::SetEnv { .. } | Self::UnsetEnv { .. } => "environment_changed",
            Self::SetAlias { .. } | Self::RemoveAlias { .. } => "aliases_changed",
            Self::StartJob { .. } => "job_started",
            Self::FinishJob { .. } => "job_finished",
            Self::SetPreference { .. } => "preferences_changed",
            Self::WriteFile { .. } | Self::RemoveFile { .. } => "files_changed",
            Self::Restore { .. } => "session_restored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Silent no-op (resource limit, unknown id, pinned tab).
    Ignored,
    TabCreated(TabId),
    SplitCreated { split_id: SplitId, tab_id: TabId },
    JobStarted(u32),
    /// Composed command line after history navigation.
    InputLine(String),
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}
