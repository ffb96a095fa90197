//! Command dispatch for the terminal core.
//!
//! [`CommandDispatcher::execute`] takes a raw line through hooks, alias
//! expansion, resolution (plugins first, then the injected catalog), and
//! invocation, and appends everything it produces to the session store.

mod autocomplete;
mod builtins;
mod dispatcher;
mod suggest;

pub use autocomplete::{Autocomplete, Completion, CompletionKey};
pub use builtins::BuiltinCatalog;
pub use dispatcher::{CommandDispatcher, DispatchRecord, DispatchStatus, OutputOrdering};
pub use suggest::{did_you_mean, edit_distance};
