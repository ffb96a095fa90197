//! # termcore-kernel
//!
//! [`TerminalBuilder`] wires the session store, plugin registry, command
//! dispatcher, debug-session manager, and persistence service into one
//! [`Terminal`]. Collaborators (command catalog, cloud store, code
//! assistant, snapshot store) are injected through the builder; anything
//! left out falls back to the built-in catalog and an in-memory or
//! file-backed snapshot store chosen from [`TerminalConfig`].
//!
//! Timers only run between [`Terminal::init`] and [`Terminal::dispose`].

mod config;
mod monitor;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use termcore_debug::DebugSessionManager;
use termcore_dispatch::{BuiltinCatalog, CommandDispatcher, Completion};
use termcore_persist::{
    FileSnapshotStore, MemorySnapshotStore, PersistenceService, SnapshotStore,
};
use termcore_plugins::PluginRegistry;
use termcore_protocol::{
    CloudStore, CodeAssistant, CommandCatalog, Mutation, OutputEntry, SnapshotId, TabId,
    TerminalResult,
};
use termcore_session::SessionStore;
use tracing::{info, instrument, warn};

pub use config::TerminalConfig;
pub use monitor::{PerformanceMetrics, PerformanceMonitor};

pub struct TerminalBuilder {
    config: TerminalConfig,
    catalog: Option<Arc<dyn CommandCatalog>>,
    cloud: Option<Arc<dyn CloudStore>>,
    assistant: Option<Arc<dyn CodeAssistant>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl TerminalBuilder {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            catalog: None,
            cloud: None,
            assistant: None,
            snapshot_store: None,
        }
    }

    /// Replaces the built-in command catalog.
    pub fn catalog(mut self, catalog: Arc<dyn CommandCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn cloud_store(mut self, cloud: Arc<dyn CloudStore>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Backs `ask`/`explain` in the built-in catalog.
    pub fn code_assistant(mut self, assistant: Arc<dyn CodeAssistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn build(self) -> Terminal {
        let config = self.config;
        let store = Arc::new(SessionStore::new(config.session_config()));
        let plugins = Arc::new(PluginRegistry::new());

        let catalog: Arc<dyn CommandCatalog> = match (self.catalog, self.assistant) {
            (Some(catalog), _) => catalog,
            (None, Some(assistant)) => Arc::new(BuiltinCatalog::with_assistant(assistant)),
            (None, None) => Arc::new(BuiltinCatalog::new()),
        };
        let dispatcher = Arc::new(
            CommandDispatcher::new(store.clone(), plugins.clone(), catalog)
                .with_ordering(config.output_ordering),
        );

        let snapshot_store: Arc<dyn SnapshotStore> = match self.snapshot_store {
            Some(store) => store,
            None => match (&config.storage_root, config.storage_quota_bytes) {
                (Some(root), Some(quota)) => {
                    Arc::new(FileSnapshotStore::new(root.join("snapshots")).with_quota(quota))
                }
                (Some(root), None) => Arc::new(FileSnapshotStore::new(root.join("snapshots"))),
                (None, Some(quota)) => Arc::new(MemorySnapshotStore::with_quota(quota)),
                (None, None) => Arc::new(MemorySnapshotStore::new()),
            },
        };
        let mut persistence = PersistenceService::new(config.persistence_config(), snapshot_store);
        if let Some(cloud) = self.cloud {
            persistence = persistence.with_cloud_store(cloud);
        }

        Terminal {
            config,
            store,
            plugins,
            dispatcher,
            debug: Arc::new(DebugSessionManager::new()),
            persistence: Arc::new(persistence),
            monitor: PerformanceMonitor::new(),
            initialized: AtomicBool::new(false),
        }
    }
}

pub struct Terminal {
    config: TerminalConfig,
    store: Arc<SessionStore>,
    plugins: Arc<PluginRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    debug: Arc<DebugSessionManager>,
    persistence: Arc<PersistenceService>,
    monitor: PerformanceMonitor,
    initialized: AtomicBool,
}

impl Terminal {
    pub fn builder(config: TerminalConfig) -> TerminalBuilder {
        TerminalBuilder::new(config)
    }

    /// Hydrates persistence, optionally restores the newest snapshot, and
    /// starts the auto-save, cloud-sync, and metrics timers. Idempotent.
    #[instrument(skip(self))]
    pub async fn init(&self) -> TerminalResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let retained = match self.hydrate().await {
            Ok(retained) => retained,
            Err(error) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        self.monitor.attach(&self.store, &self.dispatcher);
        self.monitor
            .start_polling(Duration::from_secs(self.config.metrics_poll_secs.max(1)));
        if self.config.autosave_enabled {
            self.persistence.enable_autosave(self.store.clone());
        }
        self.persistence.enable_cloud_sync();
        info!(snapshots = retained, "terminal initialized");
        Ok(())
    }

    async fn hydrate(&self) -> TerminalResult<usize> {
        let retained = self.persistence.init().await?;
        if self.config.restore_latest
            && let Some(latest) = self.persistence.latest()
        {
            self.restore(&latest.id).await?;
        }
        Ok(retained)
    }

    /// Stops every timer, aborts streaming jobs, and writes a final
    /// auto-save. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn dispose(&self) -> TerminalResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.persistence.stop_timers();
        self.dispatcher.shutdown();
        self.monitor.detach(&self.store, &self.dispatcher);
        if let Err(error) = self.persistence.autosave_now(&self.store.snapshot()).await {
            warn!(%error, "final save failed");
            return Err(error);
        }
        info!("terminal disposed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Runs a line on the active tab.
    pub async fn execute(&self, line: &str) -> Vec<OutputEntry> {
        self.dispatcher.execute(line, None).await
    }

    pub async fn execute_in(&self, tab_id: &TabId, line: &str) -> Vec<OutputEntry> {
        self.dispatcher.execute(line, Some(tab_id)).await
    }

    /// Completes `line` on the active tab.
    pub fn autocomplete(&self, line: &str) -> Completion {
        match self.store.active_tab_id() {
            Some(tab_id) => self.dispatcher.autocomplete(&tab_id, line),
            None => Completion::NoMatch,
        }
    }

    pub async fn save(&self, name: Option<&str>) -> TerminalResult<SnapshotId> {
        self.persistence.save(&self.store.snapshot(), name).await
    }

    /// Replaces the live session with a stored snapshot.
    pub async fn restore(&self, id: &SnapshotId) -> TerminalResult<()> {
        let snapshot = self.persistence.load(id).await?;
        self.dispatcher.shutdown();
        self.store.apply(Mutation::Restore {
            state: Box::new(snapshot.state),
        });
        info!(snapshot_id = %id, "session restored from snapshot");
        Ok(())
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn debug(&self) -> &Arc<DebugSessionManager> {
        &self.debug
    }

    pub fn persistence(&self) -> &Arc<PersistenceService> {
        &self.persistence
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.monitor.metrics()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use termcore_persist::AUTOSAVE_ID;
    use termcore_protocol::{
        CommandReply, CommandSpec, DebugKind, DebugStatus, OutputLine, Plugin, SessionSnapshot,
        TabKind, TerminalError, command_fn,
    };

    use super::*;
    use crate::test_support::unique_test_root;

    fn quiet_config() -> TerminalConfig {
        TerminalConfig {
            autosave_enabled: false,
            ..TerminalConfig::default()
        }
    }

    struct EchoAssistant;

    #[async_trait]
    impl CodeAssistant for EchoAssistant {
        async fn run(&self, prompt: &str) -> TerminalResult<String> {
            Ok(format!("assistant: {prompt}"))
        }
    }

    #[derive(Default)]
    struct RecordingCloud {
        pushed: Mutex<Vec<SnapshotId>>,
    }

    #[async_trait]
    impl CloudStore for RecordingCloud {
        async fn push(&self, snapshot: &SessionSnapshot) -> TerminalResult<()> {
            self.pushed.lock().push(snapshot.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn executes_builtins_against_the_active_tab() {
        let terminal = Terminal::builder(quiet_config()).build();
        terminal.init().await.unwrap();

        let outputs = terminal.execute("pwd").await;
        assert_eq!(outputs.last().map(|e| e.message.as_str()), Some("/home/user"));

        let tab = terminal.store().create_tab(TabKind::Git).unwrap();
        terminal.execute_in(&tab, "cd /").await;
        let state = terminal.store().snapshot();
        assert_eq!(state.tab(&tab).map(|t| t.directory.as_str()), Some("/"));
        assert_eq!(terminal.metrics().commands_executed, 2);

        terminal.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn assistant_backs_ask_command() {
        let terminal = Terminal::builder(quiet_config())
            .code_assistant(Arc::new(EchoAssistant))
            .build();
        let outputs = terminal.execute("ask how do I list files").await;
        assert!(
            outputs
                .iter()
                .any(|e| e.message.starts_with("assistant:")
                    && e.message.contains("how do I list files"))
        );
    }

    #[tokio::test]
    async fn plugin_commands_run_through_the_facade() {
        let terminal = Terminal::builder(quiet_config()).build();
        let plugin = Plugin::builder("greeter", "Greeter", "1.0.0").command(command_fn(
            CommandSpec::new("greet", "greet <name>"),
            |args, _ctx| {
                Ok(CommandReply::line(OutputLine::info(format!(
                    "hello {}",
                    args.join(" ")
                ))))
            },
        ));
        let id = terminal.plugins().load(plugin).unwrap();
        terminal.plugins().enable(&id).unwrap();

        let outputs = terminal.execute("greet world").await;
        assert_eq!(outputs.last().map(|e| e.message.as_str()), Some("hello world"));
    }

    #[tokio::test]
    async fn autocomplete_writes_back_single_match() {
        let terminal = Terminal::builder(quiet_config()).build();
        assert_eq!(
            terminal.autocomplete("who"),
            Completion::Completed("whoami ".into())
        );
    }

    #[tokio::test]
    async fn debug_sessions_are_reachable() {
        let terminal = Terminal::builder(quiet_config()).build();
        let id = terminal.debug().start(DebugKind::Node, "app.js", None).await;
        assert_eq!(terminal.debug().status(&id), Some(DebugStatus::Running));
    }

    #[tokio::test]
    async fn dispose_writes_final_save_and_init_restores_it() -> anyhow::Result<()> {
        let root = unique_test_root("termcore-kernel-restore");
        let config = TerminalConfig {
            storage_root: Some(root.clone()),
            restore_latest: true,
            ..quiet_config()
        };

        let first = Terminal::builder(config.clone()).build();
        first.init().await?;
        first.execute("cd /home").await;
        first.execute("export EDITOR=vim").await;
        first.dispose().await?;
        assert!(root.join("snapshots").join(format!("{AUTOSAVE_ID}.json")).exists());

        let second = Terminal::builder(config).build();
        second.init().await?;
        let state = second.store().snapshot();
        assert_eq!(state.directory, "/home");
        assert_eq!(state.environment.get("EDITOR").map(String::as_str), Some("vim"));
        second.dispose().await?;

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn restore_unknown_snapshot_is_not_found() {
        let terminal = Terminal::builder(quiet_config()).build();
        let result = terminal.restore(&SnapshotId::from_string("missing")).await;
        assert!(matches!(result, Err(TerminalError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn init_starts_autosave_and_cloud_sync() -> anyhow::Result<()> {
        let cloud = Arc::new(RecordingCloud::default());
        let terminal = Terminal::builder(TerminalConfig::default())
            .cloud_store(cloud.clone())
            .build();
        terminal.init().await?;
        assert!(terminal.persistence().is_autosave_enabled());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            terminal.persistence().latest().map(|s| s.id.as_str().to_owned()),
            Some(AUTOSAVE_ID.to_owned())
        );
        assert_eq!(
            cloud.pushed.lock().clone(),
            vec![SnapshotId::from_string(AUTOSAVE_ID)]
        );

        terminal.dispose().await?;
        assert!(!terminal.persistence().is_autosave_enabled());
        Ok(())
    }
}
