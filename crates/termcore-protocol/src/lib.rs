//! # termcore-protocol — shared terminal-core contract
//!
//! This crate defines the types every termcore component exchanges: the
//! session shape (tabs, splits, panels, output), the single mutation enum
//! the session store applies, plugin and command contracts, debug-session
//! records, persisted snapshots, and the collaborator ports the core calls
//! out to.
//!
//! It carries no runtime dependency (no tokio) so hosts can depend on it as a
//! pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (TabId, SplitId, PluginId, SnapshotId, ...)
//! - [`session`] — Tab, Split, Panel, OutputEntry, Job, SessionState
//! - [`mutation`] — Mutation, MutationOutcome
//! - [`command`] — CommandSpec, CommandContext, CommandReply, CommandHandler
//! - [`plugin`] — PluginManifest, Plugin, Hook, HookHandler
//! - [`debug`] — DebugSession, Breakpoint, StackFrame, WatchExpression
//! - [`snapshot`] — SessionSnapshot, SnapshotMetadata, ExportFormat
//! - [`ports`] — CommandCatalog, CloudStore, CodeAssistant
//! - [`error`] — TerminalError, TerminalResult

pub mod command;
pub mod debug;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod plugin;
pub mod ports;
pub mod session;
pub mod snapshot;

pub use command::{
    Command, CommandContext, CommandHandler, CommandMetadata, CommandReply, CommandSpec,
    OutputLine, OutputStream, command_fn,
};
pub use debug::{
    Breakpoint, DebugKind, DebugSession, DebugStatus, Evaluation, StackFrame, WatchExpression,
};
pub use error::{TerminalError, TerminalResult};
pub use ids::{
    BreakpointId, DebugSessionId, OutputId, PanelId, PluginId, SnapshotId, SplitId, TabId,
    WatchId,
};
pub use mutation::{Mutation, MutationOutcome};
pub use plugin::{AFTER_COMMAND, BEFORE_COMMAND, Hook, HookHandler, Plugin, PluginManifest};
pub use ports::{CloudStore, CodeAssistant, CommandCatalog};
pub use session::{
    Job, JobStatus, MAX_SPLITS, OutputEntry, OutputKind, Panel, SessionState, Split,
    SplitDirection, Tab, TabKind,
};
pub use snapshot::{ExportFormat, SNAPSHOT_VERSION, SessionSnapshot, SnapshotMetadata};
