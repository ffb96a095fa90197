//! Persisted session snapshots and export formats.

use crate::error::TerminalError;
use crate::ids::SnapshotId;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Advisory schema version written into every snapshot. No migrations exist.
pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub tab_count: usize,
    pub command_count: usize,
    /// Hex sha256 of the serialized state.
    pub state_hash: String,
    pub app_version: String,
    /// Unknown metadata survives a load/save cycle.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub state: SessionState,
    pub metadata: SnapshotMetadata,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            id: SnapshotId::generate(),
            timestamp: Utc::now(),
            version: SNAPSHOT_VERSION.to_owned(),
            state: SessionState::default(),
            metadata: SnapshotMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Verbatim snapshot.
    Json,
    /// Human-readable summary. Not losslessly convertible back.
    Text,
}

impl FromStr for ExportFormat {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "txt" => Ok(Self::Text),
            other => Err(TerminalError::Validation(format!(
                "unsupported export format: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_with_missing_fields() {
        let snapshot: SessionSnapshot =
            serde_json::from_str(r#"{"id":"s1","state":{"directory":"/srv"}}"#).unwrap();
        assert_eq!(snapshot.id.as_str(), "s1");
        assert_eq!(snapshot.state.directory, "/srv");
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn unknown_metadata_is_kept() {
        let snapshot: SessionSnapshot =
            serde_json::from_str(r#"{"id":"s1","metadata":{"tabCount":2,"origin":"cloud"}}"#)
                .unwrap();
        assert_eq!(snapshot.metadata.tab_count, 2);
        assert_eq!(snapshot.metadata.extra["origin"], "cloud");
    }

    #[test]
    fn export_format_from_str() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("txt".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert!("yaml".parse::<ExportFormat>().is_err());
    }
}
