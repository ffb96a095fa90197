//! Debug-session state machine.
//!
//! Each session moves `starting -> running <-> paused -> stopped`, with a side
//! transition to `error` when initialization fails. No interpreter is attached:
//! stepping and breakpoint hits are simulated over `current_line`, and
//! expressions are evaluated by the sandboxed [`evaluator`] against the
//! session's own variable bindings.

pub mod evaluator;

use std::collections::BTreeMap;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use termcore_events::{Notification, ObserverHub, ObserverId};
use termcore_protocol::{
    Breakpoint, BreakpointId, DebugKind, DebugSession, DebugSessionId, DebugStatus, Evaluation,
    OutputEntry, OutputKind, StackFrame, TabId, WatchExpression, WatchId,
};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Console entries kept per session.
const MAX_CONSOLE_ENTRIES: usize = 500;
const NOT_AVAILABLE: &str = "<not available>";

pub struct DebugSessionManager {
    sessions: RwLock<IndexMap<DebugSessionId, DebugSession>>,
    observers: ObserverHub<DebugSessionId>,
}

impl Default for DebugSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn log(session: &mut DebugSession, kind: OutputKind, message: impl Into<String>) {
    session.console.push(OutputEntry::new(kind, message));
    if session.console.len() > MAX_CONSOLE_ENTRIES {
        let excess = session.console.len() - MAX_CONSOLE_ENTRIES;
        session.console.drain(..excess);
    }
}

fn set_status(session: &mut DebugSession, status: DebugStatus) {
    if session.status != status {
        info!(
            session_id = %session.id,
            from = %session.status,
            to = %status,
            "debug session status changed"
        );
        session.status = status;
    }
}

fn sync_top_frame(session: &mut DebugSession) {
    let (file, line) = (session.current_file.clone(), session.current_line);
    if let Some(frame) = session.stack.last_mut() {
        frame.file = file;
        frame.line = line;
    }
}

/// Re-evaluates every watch; only meaningful while paused.
fn refresh_watches(session: &mut DebugSession) {
    let paused = session.status == DebugStatus::Paused;
    for watch in &mut session.watch_expressions {
        watch.last_value = Some(if paused {
            evaluate_in(&session.variables, &watch.expression).to_string()
        } else {
            NOT_AVAILABLE.to_owned()
        });
    }
}

fn evaluate_in(variables: &BTreeMap<String, Value>, expression: &str) -> Evaluation {
    match evaluator::evaluate(expression, variables) {
        Ok(value) => Evaluation::Value(evaluator::display(&value)),
        Err(message) => Evaluation::Error(message),
    }
}

/// A breakpoint condition that fails to evaluate does not pause.
fn condition_holds(variables: &BTreeMap<String, Value>, condition: Option<&str>) -> bool {
    match condition.map(str::trim) {
        None | Some("") => true,
        Some(condition) => evaluator::evaluate(condition, variables)
            .map(|value| evaluator::truthy(&value))
            .unwrap_or(false),
    }
}

impl DebugSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(IndexMap::new()),
            observers: ObserverHub::new("debug"),
        }
    }

    /// Runs `update` on one session and notifies `event` if it reports a change.
    fn update<R>(
        &self,
        session_id: &DebugSessionId,
        event: &str,
        update: impl FnOnce(&mut DebugSession) -> Option<R>,
    ) -> Option<R> {
        let result = {
            let mut sessions = self.sessions.write();
            let session = sessions.get_mut(session_id)?;
            update(session)
        };
        if result.is_some() {
            self.observers.notify(session_id, event);
        }
        result
    }

    /// Creates a session in `starting` and runs the simulated initialization:
    /// an empty entry file moves it to `error`, anything else to `running`
    /// stopped at line 1.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        kind: DebugKind,
        file: &str,
        tab_id: Option<TabId>,
    ) -> DebugSessionId {
        let session_id = DebugSessionId::generate();
        let mut session = DebugSession {
            id: session_id.clone(),
            kind,
            status: DebugStatus::Starting,
            breakpoints: Vec::new(),
            variables: BTreeMap::new(),
            stack: Vec::new(),
            watch_expressions: Vec::new(),
            console: Vec::new(),
            current_line: 0,
            current_file: file.trim().to_owned(),
            tab_id,
            created_at: Utc::now(),
        };
        let starting = format!("Starting {kind:?} debugger for {}", session.current_file);
        log(&mut session, OutputKind::System, starting);
        self.sessions.write().insert(session_id.clone(), session);
        info!(session_id = %session_id, kind = ?kind, "debug session created");
        self.observers.notify(&session_id, "session_started");

        tokio::task::yield_now().await;

        self.update(&session_id, "status_changed", |session| {
            if session.status != DebugStatus::Starting {
                return None;
            }
            if session.current_file.is_empty() {
                set_status(session, DebugStatus::Error);
                log(session, OutputKind::Error, "Failed to start: no entry file");
                warn!(session_id = %session.id, "debug session failed to initialize");
            } else {
                session.current_line = 1;
                session.stack.push(StackFrame {
                    name: "main".to_owned(),
                    file: session.current_file.clone(),
                    line: 1,
                });
                set_status(session, DebugStatus::Running);
                let message = format!("Debugger attached to {}", session.current_file);
                log(session, OutputKind::Success, message);
            }
            refresh_watches(session);
            Some(())
        });
        session_id
    }

    /// `running -> paused`. False from any other state.
    pub fn pause(&self, session_id: &DebugSessionId) -> bool {
        self.update(session_id, "status_changed", |session| {
            if session.status != DebugStatus::Running {
                return None;
            }
            set_status(session, DebugStatus::Paused);
            let message = format!("Paused at {}:{}", session.current_file, session.current_line);
            log(session, OutputKind::Info, message);
            refresh_watches(session);
            Some(())
        })
        .is_some()
    }

    /// `paused -> running`, then pauses again at the next enabled breakpoint
    /// after the current line in the current file whose condition holds.
    pub fn resume(&self, session_id: &DebugSessionId) -> bool {
        self.update(session_id, "status_changed", |session| {
            if session.status != DebugStatus::Paused {
                return None;
            }
            set_status(session, DebugStatus::Running);
            log(session, OutputKind::Info, "Resumed");

            let current_line = session.current_line;
            let variables = session.variables.clone();
            let hit = session
                .breakpoints
                .iter_mut()
                .filter(|bp| {
                    bp.enabled && bp.file == session.current_file && bp.line > current_line
                })
                .filter(|bp| condition_holds(&variables, bp.condition.as_deref()))
                .min_by_key(|bp| bp.line);
            if let Some(breakpoint) = hit {
                breakpoint.hit_count += 1;
                let line = breakpoint.line;
                session.current_line = line;
                sync_top_frame(session);
                set_status(session, DebugStatus::Paused);
                let message = format!("Breakpoint hit at {}:{line}", session.current_file);
                log(session, OutputKind::Warn, message);
            }
            refresh_watches(session);
            Some(())
        })
        .is_some()
    }

    pub fn step_over(&self, session_id: &DebugSessionId) -> bool {
        self.step(session_id, |session| {
            session.current_line += 1;
            sync_top_frame(session);
            format!("Step over to line {}", session.current_line)
        })
    }

    /// Enters a synthetic call frame one line down.
    pub fn step_into(&self, session_id: &DebugSessionId) -> bool {
        self.step(session_id, |session| {
            session.current_line += 1;
            let depth = session.stack.len();
            session.stack.push(StackFrame {
                name: format!("frame_{depth}"),
                file: session.current_file.clone(),
                line: session.current_line,
            });
            format!("Step into frame_{depth} at line {}", session.current_line)
        })
    }

    /// Pops the innermost frame and resumes one line after the caller's.
    pub fn step_out(&self, session_id: &DebugSessionId) -> bool {
        self.step(session_id, |session| {
            if session.stack.len() > 1 {
                session.stack.pop();
                if let Some(caller) = session.stack.last() {
                    session.current_line = caller.line;
                }
            }
            session.current_line += 1;
            sync_top_frame(session);
            format!("Step out to line {}", session.current_line)
        })
    }

    fn step(
        &self,
        session_id: &DebugSessionId,
        advance: impl FnOnce(&mut DebugSession) -> String,
    ) -> bool {
        self.update(session_id, "stepped", |session| {
            if session.status != DebugStatus::Paused {
                return None;
            }
            let message = advance(session);
            log(session, OutputKind::Debug, message);
            refresh_watches(session);
            Some(())
        })
        .is_some()
    }

    /// Any live state to `stopped`. False if already stopped.
    pub fn stop(&self, session_id: &DebugSessionId) -> bool {
        self.update(session_id, "status_changed", |session| {
            if session.status == DebugStatus::Stopped {
                return None;
            }
            set_status(session, DebugStatus::Stopped);
            session.stack.clear();
            log(session, OutputKind::System, "Debugger stopped");
            refresh_watches(session);
            Some(())
        })
        .is_some()
    }

    pub fn remove(&self, session_id: &DebugSessionId) -> bool {
        let removed = self.sessions.write().shift_remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "debug session removed");
            self.observers.notify(session_id, "session_removed");
        }
        removed
    }

    pub fn get(&self, session_id: &DebugSessionId) -> Option<DebugSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Sessions in creation order.
    pub fn list(&self) -> Vec<DebugSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn status(&self, session_id: &DebugSessionId) -> Option<DebugStatus> {
        self.sessions.read().get(session_id).map(|session| session.status)
    }

    pub fn add_breakpoint(
        &self,
        session_id: &DebugSessionId,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Option<BreakpointId> {
        self.update(session_id, "breakpoints_changed", |session| {
            let breakpoint = Breakpoint {
                id: BreakpointId::generate(),
                file: file.to_owned(),
                line,
                condition: condition.filter(|condition| !condition.trim().is_empty()),
                enabled: true,
                hit_count: 0,
            };
            debug!(session_id = %session.id, file, line, "breakpoint added");
            let id = breakpoint.id.clone();
            session.breakpoints.push(breakpoint);
            Some(id)
        })
    }

    pub fn remove_breakpoint(&self, session_id: &DebugSessionId, breakpoint_id: &BreakpointId) -> bool {
        self.update(session_id, "breakpoints_changed", |session| {
            let position = session
                .breakpoints
                .iter()
                .position(|bp| bp.id == *breakpoint_id)?;
            session.breakpoints.remove(position);
            Some(())
        })
        .is_some()
    }

    /// Flips a breakpoint's enabled flag and returns the new value.
    pub fn toggle_breakpoint(
        &self,
        session_id: &DebugSessionId,
        breakpoint_id: &BreakpointId,
    ) -> Option<bool> {
        self.update(session_id, "breakpoints_changed", |session| {
            let breakpoint = session
                .breakpoints
                .iter_mut()
                .find(|bp| bp.id == *breakpoint_id)?;
            breakpoint.enabled = !breakpoint.enabled;
            Some(breakpoint.enabled)
        })
    }

    pub fn breakpoints(&self, session_id: &DebugSessionId) -> Vec<Breakpoint> {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.breakpoints.clone())
            .unwrap_or_default()
    }

    pub fn add_watch(&self, session_id: &DebugSessionId, expression: &str) -> Option<WatchId> {
        let expression = expression.trim();
        if expression.is_empty() {
            return None;
        }
        self.update(session_id, "watches_changed", |session| {
            let id = WatchId::generate();
            session.watch_expressions.push(WatchExpression {
                id: id.clone(),
                expression: expression.to_owned(),
                last_value: None,
            });
            refresh_watches(session);
            Some(id)
        })
    }

    pub fn remove_watch(&self, session_id: &DebugSessionId, watch_id: &WatchId) -> bool {
        self.update(session_id, "watches_changed", |session| {
            let position = session
                .watch_expressions
                .iter()
                .position(|watch| watch.id == *watch_id)?;
            session.watch_expressions.remove(position);
            Some(())
        })
        .is_some()
    }

    pub fn watches(&self, session_id: &DebugSessionId) -> Vec<WatchExpression> {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.watch_expressions.clone())
            .unwrap_or_default()
    }

    /// Binds a variable visible to conditions, watches, and evaluation.
    pub fn set_variable(&self, session_id: &DebugSessionId, name: &str, value: Value) -> bool {
        self.update(session_id, "variables_changed", |session| {
            session.variables.insert(name.to_owned(), value);
            refresh_watches(session);
            Some(())
        })
        .is_some()
    }

    /// Evaluates an expression in a paused session and echoes the exchange to
    /// the session console. Outside `paused` this is an error value.
    pub fn evaluate(&self, session_id: &DebugSessionId, expression: &str) -> Evaluation {
        let evaluation = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(session_id) else {
                return Evaluation::Error(format!("no debug session {session_id}"));
            };
            if session.status != DebugStatus::Paused {
                return Evaluation::Error(format!(
                    "cannot evaluate while {}; pause the session first",
                    session.status
                ));
            }
            let evaluation = evaluate_in(&session.variables, expression);
            log(session, OutputKind::Log, format!("> {expression}"));
            let kind = if evaluation.is_error() {
                OutputKind::Error
            } else {
                OutputKind::Log
            };
            log(session, kind, evaluation.to_string());
            evaluation
        };
        self.observers.notify(session_id, "console");
        evaluation
    }

    pub fn add_observer(
        &self,
        observer: impl Fn(&DebugSessionId, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<DebugSessionId>> {
        self.observers.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    async fn running(manager: &DebugSessionManager) -> DebugSessionId {
        let id = manager.start(DebugKind::Node, "app.js", None).await;
        assert_eq!(manager.status(&id), Some(DebugStatus::Running));
        id
    }

    #[tokio::test]
    async fn start_moves_to_running_or_error() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        let session = manager.get(&id).unwrap();
        assert_eq!(session.current_line, 1);
        assert_eq!(session.stack.len(), 1);

        let failed = manager.start(DebugKind::Python, "  ", None).await;
        assert_eq!(manager.status(&failed), Some(DebugStatus::Error));
        assert!(manager.get(&failed).unwrap().console.last().unwrap().is_error());
        assert_eq!(manager.list().len(), 2);
    }

    #[tokio::test]
    async fn pause_on_stopped_session_is_rejected() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        assert!(manager.stop(&id));
        assert!(!manager.pause(&id));
        assert_eq!(manager.status(&id), Some(DebugStatus::Stopped));
        assert!(!manager.stop(&id));
    }

    #[tokio::test]
    async fn pause_and_resume_are_only_legal_from_their_states() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        assert!(!manager.resume(&id));
        assert!(manager.pause(&id));
        assert!(!manager.pause(&id));
        assert!(manager.resume(&id));
        assert_eq!(manager.status(&id), Some(DebugStatus::Running));
    }

    #[tokio::test]
    async fn stepping_requires_pause_and_moves_the_line() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        assert!(!manager.step_over(&id));

        manager.pause(&id);
        assert!(manager.step_over(&id));
        assert!(manager.step_into(&id));
        let session = manager.get(&id).unwrap();
        assert_eq!(session.current_line, 3);
        assert_eq!(session.stack.len(), 2);

        assert!(manager.step_out(&id));
        let session = manager.get(&id).unwrap();
        assert_eq!(session.stack.len(), 1);
        assert_eq!(session.current_line, 3);
        assert_eq!(session.stack[0].line, 3);
    }

    #[tokio::test]
    async fn resume_stops_at_next_matching_breakpoint() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        manager.set_variable(&id, "count", json!(3));
        let skipped = manager
            .add_breakpoint(&id, "app.js", 5, Some("count > 10".into()))
            .unwrap();
        let disabled = manager.add_breakpoint(&id, "app.js", 7, None).unwrap();
        manager.toggle_breakpoint(&id, &disabled);
        manager.add_breakpoint(&id, "other.js", 8, None).unwrap();
        let target = manager.add_breakpoint(&id, "app.js", 12, Some("count == 3".into())).unwrap();
        manager.add_breakpoint(&id, "app.js", 12, None).unwrap();

        manager.pause(&id);
        assert!(manager.resume(&id));
        let session = manager.get(&id).unwrap();
        assert_eq!(session.status, DebugStatus::Paused);
        assert_eq!(session.current_line, 12);
        let hits: Vec<(BreakpointId, u32)> = session
            .breakpoints
            .iter()
            .map(|bp| (bp.id.clone(), bp.hit_count))
            .collect();
        assert!(hits.contains(&(target, 1)));
        assert!(hits.contains(&(skipped, 0)));

        assert!(manager.resume(&id));
        assert_eq!(manager.status(&id), Some(DebugStatus::Running));
    }

    #[tokio::test]
    async fn missing_ids_return_false() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        assert!(!manager.remove_breakpoint(&id, &BreakpointId::from_string("bp_x")));
        assert!(!manager.remove_watch(&id, &WatchId::from_string("watch_x")));
        assert_eq!(manager.toggle_breakpoint(&id, &BreakpointId::from_string("bp_x")), None);
        assert!(!manager.pause(&DebugSessionId::from_string("debug_x")));
        assert!(manager.remove(&id));
        assert!(!manager.remove(&id));
    }

    #[tokio::test]
    async fn evaluation_only_while_paused() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        manager.set_variable(&id, "user", json!({"name": "ada"}));

        let evaluation = manager.evaluate(&id, "user.name");
        assert!(evaluation.is_error());
        assert!(evaluation.to_string().starts_with("Error: cannot evaluate while running"));

        manager.pause(&id);
        assert_eq!(
            manager.evaluate(&id, "user.name + '!'"),
            Evaluation::Value("\"ada!\"".to_owned())
        );
        assert!(manager.evaluate(&id, "missing").is_error());
        let console = manager.get(&id).unwrap().console;
        assert!(console.iter().any(|entry| entry.message == "> user.name + '!'"));
    }

    #[tokio::test]
    async fn rejected_evaluation_is_silent() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.add_observer(move |_, event| sink.lock().push(event.to_owned()));

        assert!(manager.evaluate(&id, "1 + 1").is_error());
        assert!(manager.evaluate(&DebugSessionId::from_string("debug_x"), "1").is_error());
        assert!(events.lock().is_empty());

        manager.pause(&id);
        manager.evaluate(&id, "1 + 1");
        assert_eq!(events.lock().clone(), vec!["status_changed", "console"]);
    }

    #[tokio::test]
    async fn watches_refresh_on_pause() {
        let manager = DebugSessionManager::new();
        let id = running(&manager).await;
        manager.set_variable(&id, "count", json!(1));
        manager.add_watch(&id, "count * 2").unwrap();
        assert_eq!(
            manager.watches(&id)[0].last_value.as_deref(),
            Some(NOT_AVAILABLE)
        );

        manager.pause(&id);
        assert_eq!(manager.watches(&id)[0].last_value.as_deref(), Some("2"));
        manager.set_variable(&id, "count", json!(5));
        assert_eq!(manager.watches(&id)[0].last_value.as_deref(), Some("10"));
        assert!(manager.add_watch(&id, "   ").is_none());
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let manager = DebugSessionManager::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        manager.add_observer(move |_, event| sink.lock().push(event.to_owned()));
        let id = running(&manager).await;
        manager.pause(&id);
        manager.pause(&id);
        assert_eq!(
            events.lock().clone(),
            vec!["session_started", "status_changed", "status_changed"]
        );
    }
}
