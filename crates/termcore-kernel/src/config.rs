use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use termcore_dispatch::OutputOrdering;
use termcore_persist::PersistenceConfig;
use termcore_session::SessionConfig;
use tokio::fs;

/// Every field is defaulted, so partial or newer config files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub max_output_lines: usize,
    pub max_history: usize,
    pub max_tab_history: usize,
    pub max_sessions: usize,
    pub autosave_interval_secs: u64,
    pub autosave_enabled: bool,
    pub cloud_sync_interval_secs: u64,
    pub metrics_poll_secs: u64,
    pub output_ordering: OutputOrdering,
    /// File-backed snapshots live here; in-memory when absent.
    pub storage_root: Option<PathBuf>,
    pub storage_quota_bytes: Option<u64>,
    pub initial_directory: String,
    pub username: String,
    /// Restore the newest snapshot during `init`.
    pub restore_latest: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_output_lines: 1000,
            max_history: 500,
            max_tab_history: 200,
            max_sessions: 10,
            autosave_interval_secs: 30,
            autosave_enabled: true,
            cloud_sync_interval_secs: 60,
            metrics_poll_secs: 5,
            output_ordering: OutputOrdering::BestEffort,
            storage_root: None,
            storage_quota_bytes: None,
            initial_directory: "/home/user".to_owned(),
            username: "user".to_owned(),
            restore_latest: false,
        }
    }
}

impl TerminalConfig {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading terminal config {path:?}"))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing terminal config {path:?}"))?;
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_output_lines: self.max_output_lines,
            max_tab_history: self.max_tab_history,
            max_history: self.max_history,
            home_directory: self.initial_directory.clone(),
            username: self.username.clone(),
        }
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            max_sessions: self.max_sessions,
            autosave_interval_secs: self.autosave_interval_secs,
            cloud_sync_interval_secs: self.cloud_sync_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_test_root;

    #[tokio::test]
    async fn partial_config_file_keeps_defaults() -> Result<()> {
        let root = unique_test_root("termcore-config");
        fs::create_dir_all(&root).await?;
        let path = root.join("terminal.json");
        fs::write(
            &path,
            r#"{"max_sessions": 3, "output_ordering": "strict", "theme": "dark"}"#,
        )
        .await?;

        let config = TerminalConfig::from_file(&path).await?;
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.output_ordering, OutputOrdering::Strict);
        assert_eq!(config.autosave_interval_secs, 30);
        assert_eq!(config.persistence_config().max_sessions, 3);
        assert_eq!(config.session_config().home_directory, "/home/user");

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_config_file_names_the_path() {
        let error = TerminalConfig::from_file("/nonexistent/termcore.json")
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("termcore.json"));
    }
}
