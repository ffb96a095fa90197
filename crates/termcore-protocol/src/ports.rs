//! Collaborator ports the terminal core calls out to.
//!
//! These are the only boundary between the core and external services. The
//! core treats every implementation as opaque.
//!
//! Object-safety note: async ports use `async-trait` for dyn dispatch.

use crate::command::{Command, CommandSpec};
use crate::error::TerminalResult;
use crate::snapshot::SessionSnapshot;
use async_trait::async_trait;

/// The injected catalog of shell-like commands.
pub trait CommandCatalog: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Command>;
    fn commands(&self) -> Vec<CommandSpec>;
}

/// Remote store the persistence service may push snapshots to.
#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn push(&self, snapshot: &SessionSnapshot) -> TerminalResult<()>;
}

/// Black-box assistant used by specific commands.
#[async_trait]
pub trait CodeAssistant: Send + Sync {
    async fn run(&self, prompt: &str) -> TerminalResult<String>;
}
