//! Debug-session records. The state machine lives in `termcore-debug`.

use crate::ids::{BreakpointId, DebugSessionId, TabId, WatchId};
use crate::session::OutputEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugKind {
    #[default]
    Node,
    Browser,
    Python,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugStatus {
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
}

impl DebugStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DebugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identified by id, so duplicate file/line pairs are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub enabled: bool,
    pub hit_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchExpression {
    pub id: WatchId,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSession {
    pub id: DebugSessionId,
    #[serde(rename = "type")]
    pub kind: DebugKind,
    pub status: DebugStatus,
    pub breakpoints: Vec<Breakpoint>,
    pub variables: BTreeMap<String, Value>,
    pub stack: Vec<StackFrame>,
    pub watch_expressions: Vec<WatchExpression>,
    pub console: Vec<OutputEntry>,
    pub current_line: u32,
    pub current_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    pub created_at: DateTime<Utc>,
}

/// Result of evaluating an expression. Errors are values, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Value(String),
    Error(String),
}

impl Evaluation {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.write_str(value),
            Self::Error(message) => write!(f, "Error: {message}"),
        }
    }
}
