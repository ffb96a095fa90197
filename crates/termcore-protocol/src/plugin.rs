//! Plugin manifests, hooks, and the bundle the registry loads.

use crate::command::Command;
use crate::error::{TerminalError, TerminalResult};
use crate::ids::PluginId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Extension point run on every line before resolution. May rewrite `line`.
pub const BEFORE_COMMAND: &str = "before-command";
/// Extension point run after a command's output is appended.
pub const AFTER_COMMAND: &str = "after-command";

/// Declarative plugin metadata.
///
/// Every field is optional at the serde level so that a manifest missing data
/// still parses and is rejected by [`PluginManifest::validate`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
    /// Declared command names. `None` means the array was absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    /// Declared extension points. `None` means the array was absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

impl PluginManifest {
    pub fn from_json(raw: &str) -> TerminalResult<Self> {
        serde_json::from_str(raw)
            .map_err(|error| TerminalError::Validation(format!("invalid plugin manifest: {error}")))
    }

    pub fn plugin_id(&self) -> PluginId {
        PluginId::from_string(self.id.clone())
    }

    /// Checks required fields. Dependency presence is the registry's job.
    pub fn validate(&self) -> TerminalResult<()> {
        let required = [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("description", &self.description),
            ("author", &self.author),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| *field)
            .collect();
        if !missing.is_empty() {
            return Err(TerminalError::Validation(format!(
                "plugin manifest missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.commands.is_none() {
            return Err(TerminalError::Validation(format!(
                "plugin {} must declare a commands array",
                self.id
            )));
        }
        if self.hooks.is_none() {
            return Err(TerminalError::Validation(format!(
                "plugin {} must declare a hooks array",
                self.id
            )));
        }
        Ok(())
    }
}

/// Hook body: receives the previous handler's output, returns the next input.
pub trait HookHandler: Send + Sync {
    fn call(&self, data: Value) -> Value;
}

impl<F> HookHandler for F
where
    F: Fn(Value) -> Value + Send + Sync,
{
    fn call(&self, data: Value) -> Value {
        self(data)
    }
}

/// A handler registered under a named extension point.
#[derive(Clone)]
pub struct Hook {
    pub point: String,
    pub handler: Arc<dyn HookHandler>,
}

impl Hook {
    pub fn new(point: impl Into<String>, handler: impl HookHandler + 'static) -> Self {
        Self {
            point: point.into(),
            handler: Arc::new(handler),
        }
    }

    /// Identity comparison, used when splicing hooks back out.
    pub fn same_handler(&self, other: &Hook) -> bool {
        Arc::ptr_eq(&self.handler, &other.handler)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("point", &self.point).finish()
    }
}

/// A manifest plus the commands and hooks it binds.
#[derive(Debug, Clone)]
pub struct Plugin {
    pub manifest: PluginManifest,
    pub commands: Vec<Command>,
    pub hooks: Vec<Hook>,
}

impl Plugin {
    pub fn from_manifest(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            commands: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Starts a fully described manifest with empty command/hook arrays.
    pub fn builder(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self::from_manifest(PluginManifest {
            description: format!("{id} plugin"),
            author: "unknown".to_owned(),
            id,
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            commands: Some(Vec::new()),
            hooks: Some(Vec::new()),
        })
    }

    pub fn id(&self) -> PluginId {
        self.manifest.plugin_id()
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.manifest.dependencies.push(dependency.into());
        self
    }

    /// Binds a command and declares it in the manifest if missing.
    pub fn command(mut self, command: Command) -> Self {
        let declared = self.manifest.commands.get_or_insert_with(Vec::new);
        if !declared.iter().any(|name| name == command.name()) {
            declared.push(command.name().to_owned());
        }
        self.commands.push(command);
        self
    }

    /// Binds a hook and declares its extension point in the manifest if missing.
    pub fn hook(mut self, hook: Hook) -> Self {
        let declared = self.manifest.hooks.get_or_insert_with(Vec::new);
        if !declared.iter().any(|point| *point == hook.point) {
            declared.push(hook.point.clone());
        }
        self.hooks.push(hook);
        self
    }

    /// Manifest validation plus a check that declared commands are bound.
    pub fn validate(&self) -> TerminalResult<()> {
        self.manifest.validate()?;
        if let Some(declared) = &self.manifest.commands {
            for name in declared {
                if !self.commands.iter().any(|command| command.name() == name) {
                    return Err(TerminalError::Validation(format!(
                        "plugin {} declares command {name} without a handler",
                        self.manifest.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandReply, CommandSpec, command_fn};

    #[test]
    fn manifest_missing_fields_parses_but_fails_validation() {
        let manifest = PluginManifest::from_json(r#"{"id":"p1","name":"P1"}"#).unwrap();
        let error = manifest.validate().unwrap_err();
        let message = error.to_string();
        assert!(message.contains("version"));
        assert!(message.contains("author"));
    }

    #[test]
    fn manifest_without_arrays_is_rejected() {
        let manifest = PluginManifest {
            id: "p".into(),
            name: "P".into(),
            version: "1.0.0".into(),
            description: "d".into(),
            author: "a".into(),
            ..PluginManifest::default()
        };
        assert!(manifest.validate().unwrap_err().to_string().contains("commands"));
    }

    #[test]
    fn builder_declares_bound_commands_and_hooks() {
        let plugin = Plugin::builder("p0", "Zero", "0.1.0")
            .command(command_fn(CommandSpec::new("zero", "zero"), |_, _| {
                Ok(CommandReply::empty())
            }))
            .hook(Hook::new(BEFORE_COMMAND, |data: Value| data));
        assert!(plugin.validate().is_ok());
        assert_eq!(plugin.manifest.commands, Some(vec!["zero".to_owned()]));
        assert_eq!(plugin.manifest.hooks, Some(vec![BEFORE_COMMAND.to_owned()]));
    }

    #[test]
    fn declared_command_without_handler_is_rejected() {
        let mut plugin = Plugin::builder("p", "P", "1.0.0");
        plugin.manifest.commands = Some(vec!["ghost".into()]);
        assert!(matches!(
            plugin.validate(),
            Err(TerminalError::Validation(_))
        ));
    }

    #[test]
    fn hooks_compare_by_handler_identity() {
        let hook = Hook::new("x", |data: Value| data);
        let clone = hook.clone();
        let other = Hook::new("x", |data: Value| data);
        assert!(hook.same_handler(&clone));
        assert!(!hook.same_handler(&other));
    }
}
