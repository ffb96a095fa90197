use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use termcore_events::{Notification, ObserverHub, ObserverId};
use termcore_plugins::PluginRegistry;
use termcore_protocol::{
    AFTER_COMMAND, BEFORE_COMMAND, Command, CommandCatalog, CommandContext, CommandSpec, JobStatus,
    Mutation, MutationOutcome, OutputEntry, OutputStream, TabId,
};
use termcore_session::SessionStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::autocomplete::{Autocomplete, Completion, CompletionKey};
use crate::suggest::did_you_mean;

/// Recently used command names kept for completion ranking.
const MAX_RECENT_COMMANDS: usize = 50;
/// Alias expansion depth before giving up on a cycle.
const MAX_ALIAS_DEPTH: usize = 8;

/// How output from concurrent commands on one tab is sequenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrdering {
    /// Output lands in the order handlers resolve.
    #[default]
    BestEffort,
    /// Commands on the same tab run one at a time in submission order.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Succeeded,
    Failed,
    NotFound,
    /// Handed off to a background job.
    Streaming,
}

impl DispatchStatus {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Succeeded => "command_succeeded",
            Self::Failed => "command_failed",
            Self::NotFound => "command_not_found",
            Self::Streaming => "command_streaming",
        }
    }
}

/// Published to dispatcher observers after every non-empty line.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub tab_id: TabId,
    pub line: String,
    pub command: String,
    pub status: DispatchStatus,
    pub outputs: usize,
    pub elapsed: Duration,
}

pub struct CommandDispatcher {
    store: Arc<SessionStore>,
    plugins: Arc<PluginRegistry>,
    catalog: Arc<dyn CommandCatalog>,
    ordering: OutputOrdering,
    tab_locks: Mutex<HashMap<TabId, Arc<tokio::sync::Mutex<()>>>>,
    completions: Mutex<HashMap<TabId, Autocomplete>>,
    recent: Mutex<Vec<String>>,
    streams: Arc<Mutex<HashMap<u32, JoinHandle<()>>>>,
    observers: ObserverHub<DispatchRecord>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        plugins: Arc<PluginRegistry>,
        catalog: Arc<dyn CommandCatalog>,
    ) -> Self {
        Self {
            store,
            plugins,
            catalog,
            ordering: OutputOrdering::default(),
            tab_locks: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            observers: ObserverHub::new("dispatcher"),
        }
    }

    pub fn with_ordering(mut self, ordering: OutputOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn ordering(&self) -> OutputOrdering {
        self.ordering
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    fn lock_for(&self, tab_id: &TabId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.tab_locks.lock();
        guard
            .entry(tab_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn forget_tab(&self, tab_id: &TabId) {
        self.tab_locks.lock().remove(tab_id);
        self.completions.lock().remove(tab_id);
    }

    /// Plugin handlers shadow catalog handlers of the same name.
    fn resolve(&self, name: &str) -> Option<Command> {
        self.plugins
            .resolve(name)
            .or_else(|| self.catalog.resolve(name))
    }

    /// Every resolvable command, plugin commands first.
    pub fn command_specs(&self) -> Vec<CommandSpec> {
        let mut specs = self.plugins.commands();
        let shadowed: HashSet<String> = specs.iter().map(|spec| spec.name.clone()).collect();
        specs.extend(
            self.catalog
                .commands()
                .into_iter()
                .filter(|spec| !shadowed.contains(&spec.name)),
        );
        specs
    }

    fn record_usage(&self, name: &str) {
        let mut recent = self.recent.lock();
        recent.retain(|candidate| candidate != name);
        recent.insert(0, name.to_owned());
        recent.truncate(MAX_RECENT_COMMANDS);
    }

    /// Runs one command line against a tab (the active tab when `None`).
    ///
    /// Never fails: every problem is rendered as an `error` entry. Returns the
    /// entries this call appended, starting with the echoed line.
    #[instrument(skip(self))]
    pub async fn execute(&self, raw_line: &str, tab_id: Option<&TabId>) -> Vec<OutputEntry> {
        let line = raw_line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let Some(tab_id) = tab_id.cloned().or_else(|| self.store.active_tab_id()) else {
            return vec![OutputEntry::error("no active tab")];
        };
        if !self.store.has_tab(&tab_id) {
            self.forget_tab(&tab_id);
            warn!(tab_id = %tab_id, "command submitted for a closed tab");
            return vec![OutputEntry::error(format!("no such tab: {tab_id}"))];
        }

        let lock = self.lock_for(&tab_id);
        let _ordered = match self.ordering {
            OutputOrdering::Strict => Some(lock.lock_owned().await),
            OutputOrdering::BestEffort => None,
        };

        let started = Instant::now();
        let effective = self.rewrite_line(line, &tab_id);
        self.store.apply(Mutation::RecordHistory {
            tab_id: tab_id.clone(),
            line: line.to_owned(),
        });
        if effective.trim().is_empty() {
            debug!(tab_id = %tab_id, "line cancelled by before-command hook");
            return Vec::new();
        }

        let ctx = self.context_for(&tab_id);
        let mut produced = vec![self.echo_entry(&ctx, line)];
        self.append(&tab_id, produced.clone());

        let tokens = expand_aliases(
            effective.split_whitespace().map(str::to_owned).collect(),
            &ctx.aliases,
        );
        let Some((name, args)) = tokens.split_first() else {
            return produced;
        };

        let (status, entries) = match self.resolve(name) {
            Some(command) => {
                self.record_usage(&command.spec.name);
                self.invoke(command, args, &ctx, &tab_id, line).await
            }
            None => (DispatchStatus::NotFound, self.not_found(name)),
        };
        self.append(&tab_id, entries.clone());
        produced.extend(entries);

        let elapsed = started.elapsed();
        debug!(
            tab_id = %tab_id,
            command = %name,
            status = status.event_name(),
            elapsed_ms = elapsed.as_millis() as u64,
            "command dispatched"
        );
        self.run_after_hooks(line, &tab_id, &produced);
        let record = DispatchRecord {
            tab_id,
            line: line.to_owned(),
            command: name.clone(),
            status,
            outputs: produced.len(),
            elapsed,
        };
        self.observers.notify(&record, status.event_name());
        produced
    }

    /// Runs the `before-command` pipeline. Hooks may return an object with a
    /// `line` field or a bare string; anything else leaves the line as is.
    fn rewrite_line(&self, line: &str, tab_id: &TabId) -> String {
        if !self.plugins.has_hooks(BEFORE_COMMAND) {
            return line.to_owned();
        }
        let data = self.plugins.run_hooks(
            BEFORE_COMMAND,
            json!({ "line": line, "tab_id": tab_id.as_str() }),
        );
        data.get("line")
            .and_then(Value::as_str)
            .or_else(|| data.as_str())
            .map_or_else(|| line.to_owned(), str::to_owned)
    }

    fn run_after_hooks(&self, line: &str, tab_id: &TabId, outputs: &[OutputEntry]) {
        if !self.plugins.has_hooks(AFTER_COMMAND) {
            return;
        }
        let outputs = serde_json::to_value(outputs).unwrap_or(Value::Null);
        self.plugins.run_hooks(
            AFTER_COMMAND,
            json!({ "line": line, "tab_id": tab_id.as_str(), "outputs": outputs }),
        );
    }

    fn context_for(&self, tab_id: &TabId) -> CommandContext {
        let username = self.store.config().username.clone();
        let commands = self.command_specs();
        self.store.read(|state| {
            let tab = state.tab(tab_id);
            CommandContext {
                tab_id: Some(tab_id.clone()),
                directory: tab.map_or_else(|| state.directory.clone(), |tab| tab.directory.clone()),
                username,
                files: state.files.clone(),
                environment: state.environment.clone(),
                aliases: state.aliases.clone(),
                history: tab.map(|tab| tab.command_history.clone()).unwrap_or_default(),
                outputs: tab
                    .map(|tab| tab.outputs.iter().cloned().collect())
                    .unwrap_or_default(),
                jobs: state.jobs.clone(),
                commands,
            }
        })
    }

    fn echo_entry(&self, ctx: &CommandContext, line: &str) -> OutputEntry {
        let home = &self.store.config().home_directory;
        let directory = match ctx.directory.strip_prefix(home.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("~{rest}"),
            _ => ctx.directory.clone(),
        };
        OutputEntry::system(format!("{}:{directory}$ {line}", ctx.username))
    }

    /// Appends to the tab, dropping output for tabs closed in the meantime.
    fn append(&self, tab_id: &TabId, entries: Vec<OutputEntry>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        if !self.store.append_output(tab_id, entries) {
            warn!(tab_id = %tab_id, dropped = count, "dropping output for a closed tab");
        }
    }

    fn not_found(&self, name: &str) -> Vec<OutputEntry> {
        let mut names: Vec<String> = self.plugins.command_names();
        names.extend(self.catalog.commands().into_iter().map(|spec| spec.name));
        let suggestions = did_you_mean(name, names.iter().map(String::as_str));

        let mut entries = vec![OutputEntry::error(format!("command not found: {name}"))];
        if !suggestions.is_empty() {
            entries.push(OutputEntry::info(format!(
                "Did you mean: {}?",
                suggestions.join(", ")
            )));
        }
        entries
    }

    async fn invoke(
        &self,
        command: Command,
        args: &[String],
        ctx: &CommandContext,
        tab_id: &TabId,
        line: &str,
    ) -> (DispatchStatus, Vec<OutputEntry>) {
        let handler = command.handler.clone();
        let outcome = std::panic::AssertUnwindSafe(handler.run(args, ctx))
            .catch_unwind()
            .await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                debug!(command = %command.spec.name, error = %error, "command failed");
                return (
                    DispatchStatus::Failed,
                    vec![OutputEntry::error(error.detail())],
                );
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(command = %command.spec.name, message = %message, "command panicked");
                return (DispatchStatus::Failed, vec![OutputEntry::error(message)]);
            }
        };

        for effect in reply.effects {
            self.store.apply(effect);
        }
        let mut entries: Vec<OutputEntry> = reply
            .lines
            .into_iter()
            .map(|line| line.into_entry())
            .collect();

        let name = &command.spec.name;
        match (command.spec.metadata.streaming, reply.stream) {
            (true, Some(stream)) => {
                if let Some(job_id) = self.spawn_stream(tab_id, line, stream) {
                    entries.push(OutputEntry::system(format!("[{job_id}] {line}")));
                }
                (DispatchStatus::Streaming, entries)
            }
            (false, None) => (DispatchStatus::Succeeded, entries),
            (true, None) => {
                warn!(command = %name, "streaming command returned no stream");
                entries.push(OutputEntry::error(format!(
                    "{name}: streaming command returned no stream"
                )));
                (DispatchStatus::Failed, entries)
            }
            (false, Some(_)) => {
                warn!(command = %name, "single-shot command returned a stream");
                entries.push(OutputEntry::error(format!(
                    "{name}: command is not flagged as streaming"
                )));
                (DispatchStatus::Failed, entries)
            }
        }
    }

    /// Runs a streaming reply as a background job that appends each line as
    /// it arrives and finishes the job when the stream closes.
    fn spawn_stream(&self, tab_id: &TabId, line: &str, stream: OutputStream) -> Option<u32> {
        let MutationOutcome::JobStarted(job_id) = self.store.apply(Mutation::StartJob {
            tab_id: tab_id.clone(),
            command: line.to_owned(),
        }) else {
            return None;
        };
        info!(job_id, tab_id = %tab_id, "streaming job started");

        let store = self.store.clone();
        let streams = self.streams.clone();
        let tab_id = tab_id.clone();
        let mut streams_guard = self.streams.lock();
        let handle = tokio::spawn(async move {
            let consume = pump_stream(&store, &tab_id, stream);
            let status = match std::panic::AssertUnwindSafe(consume).catch_unwind().await {
                Ok(status) => status,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(job_id, message = %message, "streaming job panicked");
                    store.append_output(&tab_id, vec![OutputEntry::error(message)]);
                    JobStatus::Failed
                }
            };
            store.apply(Mutation::FinishJob { job_id, status });
            streams.lock().remove(&job_id);
            info!(job_id, status = ?status, "streaming job finished");
        });
        streams_guard.insert(job_id, handle);
        Some(job_id)
    }

    /// Waits for a streaming job to finish. Returns immediately for unknown
    /// or already finished jobs.
    pub async fn wait_for_job(&self, job_id: u32) {
        let handle = self.streams.lock().remove(&job_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn running_jobs(&self) -> Vec<u32> {
        let mut jobs: Vec<u32> = self.streams.lock().keys().copied().collect();
        jobs.sort_unstable();
        jobs
    }

    /// Aborts every streaming job and marks it failed.
    pub fn shutdown(&self) {
        let handles: Vec<(u32, JoinHandle<()>)> = self.streams.lock().drain().collect();
        for (job_id, handle) in handles {
            handle.abort();
            self.store.apply(Mutation::FinishJob {
                job_id,
                status: JobStatus::Failed,
            });
            info!(job_id, "streaming job aborted");
        }
    }

    /// Completes the command token of `line` for a tab. A single match is
    /// written back to the tab's input line.
    pub fn autocomplete(&self, tab_id: &TabId, line: &str) -> Completion {
        let specs = self.command_specs();
        let recent = self.recent.lock().clone();
        let completion = self
            .completions
            .lock()
            .entry(tab_id.clone())
            .or_default()
            .trigger(line, &specs, &recent);
        if let Completion::Completed(completed) = &completion {
            self.store.apply(Mutation::SetInputLine {
                tab_id: tab_id.clone(),
                line: completed.clone(),
            });
        }
        completion
    }

    /// Feeds a key to the tab's completion menu; an accepted entry is written
    /// back to the input line and returned.
    pub fn autocomplete_key(&self, tab_id: &TabId, key: CompletionKey) -> Option<String> {
        let accepted = self.completions.lock().get_mut(tab_id)?.key(key)?;
        self.store.apply(Mutation::SetInputLine {
            tab_id: tab_id.clone(),
            line: accepted.clone(),
        });
        Some(accepted)
    }

    /// Suggestions and highlighted index while the tab is in selection mode.
    pub fn completion_menu(&self, tab_id: &TabId) -> Option<(Vec<String>, Option<usize>)> {
        let completions = self.completions.lock();
        let menu = completions.get(tab_id)?;
        menu.is_selecting()
            .then(|| (menu.suggestions().to_vec(), menu.selected()))
    }

    pub fn add_observer(
        &self,
        observer: impl Fn(&DispatchRecord, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<DispatchRecord>> {
        self.observers.subscribe()
    }
}

async fn pump_stream(store: &SessionStore, tab_id: &TabId, mut stream: OutputStream) -> JobStatus {
    while let Some(line) = stream.next().await {
        if !store.append_output(tab_id, vec![line.into_entry()]) {
            warn!(tab_id = %tab_id, "tab closed; stopping streaming output");
            return JobStatus::Failed;
        }
    }
    JobStatus::Done
}

/// Expands the first token through the alias table until it no longer names
/// an alias. Cycles stop at the first repeated name.
fn expand_aliases(mut tokens: Vec<String>, aliases: &BTreeMap<String, String>) -> Vec<String> {
    let mut seen = HashSet::new();
    for _ in 0..MAX_ALIAS_DEPTH {
        let Some(first) = tokens.first().cloned() else {
            break;
        };
        let Some(expansion) = aliases.get(&first) else {
            break;
        };
        if !seen.insert(first) {
            break;
        }
        let mut expanded: Vec<String> = expansion.split_whitespace().map(str::to_owned).collect();
        if expanded.is_empty() {
            break;
        }
        expanded.extend(tokens.drain(1..));
        tokens = expanded;
    }
    tokens
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "command panicked".to_owned()
    }
}
