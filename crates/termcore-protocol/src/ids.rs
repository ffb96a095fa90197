//! Typed identifiers for terminal-core entities.
//!
//! IDs are opaque String wrappers (serde-transparent). Generated IDs combine a
//! millisecond timestamp with a random suffix, so collisions are negligible but
//! not structurally prevented.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Generate a fresh timestamp+random ID.
            pub fn generate() -> Self {
                Self(generate_raw($prefix))
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

fn generate_raw(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{millis}_{}", &random[..9])
}

typed_id!(
    /// Identifier for a terminal tab.
    TabId,
    "tab"
);
typed_id!(
    /// Identifier for a layout split.
    SplitId,
    "split"
);
typed_id!(
    /// Identifier for an ephemeral render panel.
    PanelId,
    "panel"
);
typed_id!(
    /// Identifier for a single output entry.
    OutputId,
    "out"
);
typed_id!(
    /// Identifier for a plugin. Plugins usually supply their own.
    PluginId,
    "plugin"
);
typed_id!(
    /// Identifier for a debug session.
    DebugSessionId,
    "debug"
);
typed_id!(
    /// Identifier for a breakpoint. Unique per breakpoint, not per file/line.
    BreakpointId,
    "bp"
);
typed_id!(
    /// Identifier for a watch expression.
    WatchId,
    "watch"
);
typed_id!(
    /// Identifier for a persisted session snapshot.
    SnapshotId,
    "session"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = TabId::generate();
        let b = TabId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_carry_prefix() {
        let id = SplitId::generate();
        assert!(id.as_str().starts_with("split_"));
    }

    #[test]
    fn plugin_id_from_str() {
        let id: PluginId = "git-tools".into();
        assert_eq!(id.as_str(), "git-tools");
        assert_eq!(id.to_string(), "git-tools");
    }

    #[test]
    fn typed_id_serializes_as_plain_string() {
        let id = SnapshotId::from_string("autosave");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"autosave\"");
    }
}
