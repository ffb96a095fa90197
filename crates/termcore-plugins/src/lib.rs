//! Plugin lifecycle and the global plugin command table.
//!
//! `load` validates and remembers a plugin, `enable` publishes its commands
//! and hooks, `disable` withdraws them, `unload` forgets the plugin. Command
//! names are last-enabled-wins: enabling a plugin that declares a name already
//! owned by another enabled plugin replaces the mapping, and disabling either
//! plugin removes the name outright.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use termcore_events::{Notification, ObserverHub, ObserverId};
use termcore_protocol::{
    Command, CommandCatalog, CommandSpec, Hook, Plugin, PluginId, TerminalError, TerminalResult,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Registry-facing summary of one loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
    pub enabled: bool,
    pub commands: Vec<String>,
    pub hooks: Vec<String>,
}

struct LoadedPlugin {
    plugin: Plugin,
    enabled: bool,
}

impl LoadedPlugin {
    fn info(&self) -> PluginInfo {
        let manifest = &self.plugin.manifest;
        PluginInfo {
            id: manifest.plugin_id(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            dependencies: manifest.dependencies.clone(),
            enabled: self.enabled,
            commands: self
                .plugin
                .commands
                .iter()
                .map(|command| command.name().to_owned())
                .collect(),
            hooks: manifest.hooks.clone().unwrap_or_default(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    plugins: IndexMap<PluginId, LoadedPlugin>,
    commands: HashMap<String, (PluginId, Command)>,
    hooks: HashMap<String, Vec<(PluginId, Hook)>>,
}

impl RegistryState {
    fn missing_dependencies(&self, plugin: &Plugin) -> Vec<String> {
        plugin
            .manifest
            .dependencies
            .iter()
            .filter(|dependency| {
                !self
                    .plugins
                    .contains_key(&PluginId::from_string(dependency.as_str()))
            })
            .cloned()
            .collect()
    }
}

pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    observers: ObserverHub<PluginId>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            observers: ObserverHub::new("plugins"),
        }
    }

    /// Validates the plugin and checks that every dependency is loaded.
    ///
    /// Failures come back as `Err` and leave the registry untouched.
    pub fn load(&self, plugin: Plugin) -> TerminalResult<PluginId> {
        plugin.validate()?;
        let plugin_id = plugin.id();
        {
            let mut state = self.state.write();
            if state.plugins.contains_key(&plugin_id) {
                return Err(TerminalError::Validation(format!(
                    "plugin {plugin_id} is already loaded"
                )));
            }
            let missing = state.missing_dependencies(&plugin);
            if !missing.is_empty() {
                return Err(TerminalError::Validation(format!(
                    "plugin {plugin_id} has unloaded dependencies: {}",
                    missing.join(", ")
                )));
            }
            state.plugins.insert(
                plugin_id.clone(),
                LoadedPlugin {
                    plugin,
                    enabled: false,
                },
            );
        }
        info!(plugin_id = %plugin_id, "plugin loaded");
        self.observers.notify(&plugin_id, "loaded");
        Ok(plugin_id)
    }

    /// Publishes the plugin's commands and hooks. Enabling twice is a no-op.
    pub fn enable(&self, plugin_id: &PluginId) -> TerminalResult<()> {
        {
            let mut state = self.state.write();
            let Some(entry) = state.plugins.get(plugin_id) else {
                return Err(TerminalError::NotFound(format!("plugin {plugin_id}")));
            };
            if entry.enabled {
                return Ok(());
            }
            let missing = state.missing_dependencies(&entry.plugin);
            if !missing.is_empty() {
                return Err(TerminalError::Validation(format!(
                    "plugin {plugin_id} has unloaded dependencies: {}",
                    missing.join(", ")
                )));
            }

            let commands = entry.plugin.commands.clone();
            let hooks = entry.plugin.hooks.clone();
            for command in commands {
                let name = command.name().to_owned();
                if let Some((owner, _)) =
                    state.commands.insert(name.clone(), (plugin_id.clone(), command))
                    && owner != *plugin_id
                {
                    warn!(command = %name, previous = %owner, plugin_id = %plugin_id, "plugin command overrides earlier mapping");
                }
            }
            for hook in hooks {
                state
                    .hooks
                    .entry(hook.point.clone())
                    .or_default()
                    .push((plugin_id.clone(), hook));
            }
            if let Some(entry) = state.plugins.get_mut(plugin_id) {
                entry.enabled = true;
            }
        }
        info!(plugin_id = %plugin_id, "plugin enabled");
        self.observers.notify(plugin_id, "enabled");
        Ok(())
    }

    /// Withdraws the plugin's command names and splices its hooks out by
    /// handler identity. Disabling a disabled plugin is a no-op.
    pub fn disable(&self, plugin_id: &PluginId) -> TerminalResult<()> {
        {
            let mut state = self.state.write();
            let Some(entry) = state.plugins.get(plugin_id) else {
                return Err(TerminalError::NotFound(format!("plugin {plugin_id}")));
            };
            if !entry.enabled {
                return Ok(());
            }
            let names: Vec<String> = entry
                .plugin
                .commands
                .iter()
                .map(|command| command.name().to_owned())
                .collect();
            let hooks = entry.plugin.hooks.clone();

            for name in names {
                state.commands.remove(&name);
            }
            for hook in &hooks {
                if let Some(pipeline) = state.hooks.get_mut(&hook.point) {
                    pipeline.retain(|(_, registered)| !registered.same_handler(hook));
                    if pipeline.is_empty() {
                        state.hooks.remove(&hook.point);
                    }
                }
            }
            if let Some(entry) = state.plugins.get_mut(plugin_id) {
                entry.enabled = false;
            }
        }
        info!(plugin_id = %plugin_id, "plugin disabled");
        self.observers.notify(plugin_id, "disabled");
        Ok(())
    }

    /// Disables and forgets the plugin. Dependents are not consulted.
    pub fn unload(&self, plugin_id: &PluginId) -> TerminalResult<()> {
        self.disable(plugin_id)?;
        let removed = self.state.write().plugins.shift_remove(plugin_id);
        if removed.is_none() {
            return Err(TerminalError::NotFound(format!("plugin {plugin_id}")));
        }
        info!(plugin_id = %plugin_id, "plugin unloaded");
        self.observers.notify(plugin_id, "unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, plugin_id: &PluginId) -> bool {
        self.state.read().plugins.contains_key(plugin_id)
    }

    pub fn is_enabled(&self, plugin_id: &PluginId) -> bool {
        self.state
            .read()
            .plugins
            .get(plugin_id)
            .is_some_and(|entry| entry.enabled)
    }

    pub fn get(&self, plugin_id: &PluginId) -> Option<PluginInfo> {
        self.state.read().plugins.get(plugin_id).map(LoadedPlugin::info)
    }

    /// Loaded plugins in load order.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.state
            .read()
            .plugins
            .values()
            .map(LoadedPlugin::info)
            .collect()
    }

    /// Sorted names currently in the command table.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// The plugin currently owning `name`, if any.
    pub fn command_owner(&self, name: &str) -> Option<PluginId> {
        self.state
            .read()
            .commands
            .get(name)
            .map(|(owner, _)| owner.clone())
    }

    pub fn has_hooks(&self, point: &str) -> bool {
        self.state
            .read()
            .hooks
            .get(point)
            .is_some_and(|pipeline| !pipeline.is_empty())
    }

    /// Runs every hook registered under `point` as a left fold over `data`.
    ///
    /// The pipeline is snapshotted first, so hooks may enable or disable
    /// plugins without deadlocking. A panicking hook is skipped and the value
    /// it received flows on to the next one.
    pub fn run_hooks(&self, point: &str, data: Value) -> Value {
        let pipeline: Vec<(PluginId, Hook)> = self
            .state
            .read()
            .hooks
            .get(point)
            .cloned()
            .unwrap_or_default();
        if pipeline.is_empty() {
            return data;
        }
        debug!(point, handlers = pipeline.len(), "running hook pipeline");

        pipeline.into_iter().fold(data, |data, (plugin_id, hook)| {
            let input = data.clone();
            match catch_unwind(AssertUnwindSafe(|| hook.handler.call(input))) {
                Ok(next) => next,
                Err(_) => {
                    warn!(point, plugin_id = %plugin_id, "hook panicked; skipped");
                    data
                }
            }
        })
    }

    pub fn add_observer(
        &self,
        observer: impl Fn(&PluginId, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<PluginId>> {
        self.observers.subscribe()
    }
}

impl CommandCatalog for PluginRegistry {
    /// Clones the handler out of the table so dispatch never holds the lock.
    fn resolve(&self, name: &str) -> Option<Command> {
        self.state
            .read()
            .commands
            .get(name)
            .map(|(_, command)| command.clone())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let mut specs: Vec<CommandSpec> = self
            .state
            .read()
            .commands
            .values()
            .map(|(_, command)| command.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;
    use termcore_protocol::{
        BEFORE_COMMAND, CommandContext, CommandReply, OutputLine, PluginManifest, command_fn,
    };

    use super::*;

    fn echo_command(name: &str, reply: &'static str) -> Command {
        command_fn(CommandSpec::new(name, name), move |_, _| {
            Ok(CommandReply::line(OutputLine::info(reply)))
        })
    }

    fn plugin(id: &str) -> Plugin {
        Plugin::builder(id, id.to_uppercase(), "1.0.0")
    }

    #[test]
    fn load_rejects_missing_dependency() {
        let registry = PluginRegistry::new();
        let result = registry.load(plugin("p1").depends_on("missing"));
        assert!(matches!(result, Err(TerminalError::Validation(_))));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn loaded_dependency_is_sufficient_without_enable() {
        let registry = PluginRegistry::new();
        registry.load(plugin("p0")).unwrap();
        registry.load(plugin("p1").depends_on("p0")).unwrap();
        assert!(!registry.is_enabled(&PluginId::from_string("p0")));
        registry.enable(&PluginId::from_string("p1")).unwrap();
        assert!(registry.is_enabled(&PluginId::from_string("p1")));
    }

    #[test]
    fn load_rejects_incomplete_manifest() {
        let registry = PluginRegistry::new();
        let manifest = PluginManifest::from_json(r#"{"id":"p","name":"P","version":"1"}"#).unwrap();
        let result = registry.load(Plugin::from_manifest(manifest));
        assert!(matches!(result, Err(TerminalError::Validation(_))));
    }

    #[test]
    fn duplicate_load_is_rejected() {
        let registry = PluginRegistry::new();
        registry.load(plugin("p0")).unwrap();
        assert!(registry.load(plugin("p0")).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn enable_twice_matches_enable_once() {
        let registry = PluginRegistry::new();
        let id = registry
            .load(
                plugin("git")
                    .command(echo_command("status", "clean"))
                    .hook(Hook::new(BEFORE_COMMAND, |data: Value| data)),
            )
            .unwrap();
        registry.enable(&id).unwrap();
        let names = registry.command_names();
        let info = registry.get(&id);

        registry.enable(&id).unwrap();
        assert_eq!(registry.command_names(), names);
        assert_eq!(registry.get(&id), info);
        assert_eq!(registry.state.read().hooks[BEFORE_COMMAND].len(), 1);
    }

    #[test]
    fn enable_unknown_plugin_is_not_found() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.enable(&PluginId::from_string("ghost")),
            Err(TerminalError::NotFound(_))
        ));
    }

    #[test]
    fn enable_rechecks_dependencies() {
        let registry = PluginRegistry::new();
        registry.load(plugin("base")).unwrap();
        let child = registry.load(plugin("child").depends_on("base")).unwrap();
        registry.unload(&PluginId::from_string("base")).unwrap();
        assert!(registry.is_loaded(&child));
        assert!(registry.enable(&child).is_err());
    }

    #[tokio::test]
    async fn last_enabled_plugin_wins_collisions() {
        let registry = PluginRegistry::new();
        let first = registry
            .load(plugin("first").command(echo_command("deploy", "first")))
            .unwrap();
        let second = registry
            .load(plugin("second").command(echo_command("deploy", "second")))
            .unwrap();
        registry.enable(&first).unwrap();
        registry.enable(&second).unwrap();
        assert_eq!(registry.command_owner("deploy"), Some(second.clone()));

        let command = registry.resolve("deploy").unwrap();
        let reply = command
            .handler
            .run(&[], &CommandContext::default())
            .await
            .unwrap();
        assert_eq!(reply.lines[0].message, "second");

        registry.disable(&first).unwrap();
        assert!(registry.resolve("deploy").is_none());
        assert!(registry.is_enabled(&second));
    }

    #[test]
    fn disable_splices_only_own_hooks() {
        let registry = PluginRegistry::new();
        let upper = registry
            .load(plugin("upper").hook(Hook::new("transform", |data: Value| {
                json!(data.as_str().unwrap_or_default().to_uppercase())
            })))
            .unwrap();
        let suffix = registry
            .load(plugin("suffix").hook(Hook::new("transform", |data: Value| {
                json!(format!("{}!", data.as_str().unwrap_or_default()))
            })))
            .unwrap();
        registry.enable(&upper).unwrap();
        registry.enable(&suffix).unwrap();
        assert_eq!(registry.run_hooks("transform", json!("hi")), json!("HI!"));

        registry.disable(&upper).unwrap();
        assert_eq!(registry.run_hooks("transform", json!("hi")), json!("hi!"));

        registry.disable(&suffix).unwrap();
        assert!(!registry.has_hooks("transform"));
        assert_eq!(registry.run_hooks("transform", json!("hi")), json!("hi"));
    }

    #[test]
    fn panicking_hook_is_skipped() {
        let registry = PluginRegistry::new();
        let broken = registry
            .load(plugin("broken").hook(Hook::new("transform", |_: Value| -> Value {
                panic!("hook failure")
            })))
            .unwrap();
        let tail = registry
            .load(plugin("tail").hook(Hook::new("transform", |data: Value| {
                json!(format!("{}.", data.as_str().unwrap_or_default()))
            })))
            .unwrap();
        registry.enable(&broken).unwrap();
        registry.enable(&tail).unwrap();
        assert_eq!(registry.run_hooks("transform", json!("ok")), json!("ok."));
    }

    #[test]
    fn unload_is_not_blocked_by_dependents() {
        let registry = PluginRegistry::new();
        let base = registry
            .load(plugin("base").command(echo_command("base", "base")))
            .unwrap();
        registry.load(plugin("child").depends_on("base")).unwrap();
        registry.enable(&base).unwrap();

        registry.unload(&base).unwrap();
        assert!(!registry.is_loaded(&base));
        assert!(registry.resolve("base").is_none());
        assert_eq!(registry.list().len(), 1);
        assert!(registry.unload(&base).is_err());
    }

    #[test]
    fn observers_receive_lifecycle_events() {
        let registry = PluginRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        registry.add_observer(move |id, event| sink.lock().push(format!("{id}:{event}")));

        let id = registry.load(plugin("p0")).unwrap();
        registry.enable(&id).unwrap();
        registry.enable(&id).unwrap();
        registry.unload(&id).unwrap();

        assert_eq!(
            events.lock().clone(),
            vec!["p0:loaded", "p0:enabled", "p0:disabled", "p0:unloaded"]
        );
    }

    #[test]
    fn list_preserves_load_order() {
        let registry = PluginRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.load(plugin(id)).unwrap();
        }
        let ids: Vec<String> = registry
            .list()
            .into_iter()
            .map(|info| info.id.to_string())
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }
}
