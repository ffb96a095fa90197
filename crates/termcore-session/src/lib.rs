//! Canonical terminal session state behind a single mutation surface.
//!
//! All writers go through [`SessionStore::apply`]; all readers get cloned,
//! point-in-time [`SessionState`] values. Observers are notified after the
//! state lock is released, so an observer may read (or even mutate) the store.

mod paths;
mod reducer;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use termcore_events::{Notification, ObserverHub, ObserverId};
use termcore_protocol::{
    Mutation, MutationOutcome, OutputEntry, SessionState, SplitDirection, SplitId, TabId, TabKind,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use paths::{parent as parent_path, resolve as resolve_path};
pub use reducer::SessionEntity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_output_lines: usize,
    pub max_tab_history: usize,
    /// Cap on the session-wide history.
    pub max_history: usize,
    pub home_directory: String,
    pub username: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_output_lines: 1000,
            max_tab_history: 200,
            max_history: 500,
            home_directory: "/home/user".to_owned(),
            username: "user".to_owned(),
        }
    }
}

pub struct SessionStore {
    config: SessionConfig,
    state: Mutex<SessionState>,
    observers: ObserverHub<SessionEntity>,
}

impl SessionStore {
    /// Fresh session rooted at the home directory with one console tab.
    pub fn new(config: SessionConfig) -> Self {
        let mut state = SessionState {
            directory: config.home_directory.clone(),
            ..SessionState::default()
        };
        state
            .environment
            .insert("HOME".to_owned(), config.home_directory.clone());
        state
            .environment
            .insert("USER".to_owned(), config.username.clone());
        reducer::seed(&mut state);
        Self::with_state(config, state)
    }

    /// Session hydrated from a previously persisted state.
    pub fn from_state(config: SessionConfig, mut state: SessionState) -> Self {
        reducer::repair(&mut state, &config);
        Self::with_state(config, state)
    }

    fn with_state(config: SessionConfig, state: SessionState) -> Self {
        Self {
            config,
            state: Mutex::new(state),
            observers: ObserverHub::new("session"),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Applies one mutation. Silent no-ops come back as
    /// [`MutationOutcome::Ignored`] and notify nobody.
    pub fn apply(&self, mutation: Mutation) -> MutationOutcome {
        let event = mutation.event_name();
        let (outcome, entity) = {
            let mut state = self.state.lock();
            reducer::apply(&mut state, &self.config, mutation)
        };

        if outcome.is_applied() {
            match (&outcome, event) {
                (MutationOutcome::TabCreated(tab_id), _) => {
                    info!(tab_id = %tab_id, "tab created");
                }
                (MutationOutcome::SplitCreated { split_id, tab_id }, _) => {
                    info!(split_id = %split_id, tab_id = %tab_id, "split created");
                }
                (_, "tab_closed") => info!(entity = ?entity, "tab closed"),
                (_, "session_restored") => info!("session restored"),
                _ => debug!(event, entity = ?entity, "session mutation applied"),
            }
            self.observers.notify(&entity, event);
        } else {
            debug!(event, entity = ?entity, "session mutation ignored");
        }
        outcome
    }

    /// Point-in-time copy of the whole state.
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Reads without cloning the whole state. Do not call back into the store.
    pub fn read<R>(&self, reader: impl FnOnce(&SessionState) -> R) -> R {
        reader(&self.state.lock())
    }

    pub fn active_tab_id(&self) -> Option<TabId> {
        self.read(|state| state.active_tab.clone())
    }

    pub fn has_tab(&self, tab_id: &TabId) -> bool {
        self.read(|state| state.tab(tab_id).is_some())
    }

    pub fn create_tab(&self, kind: TabKind) -> Option<TabId> {
        match self.apply(Mutation::CreateTab { kind, name: None }) {
            MutationOutcome::TabCreated(tab_id) => Some(tab_id),
            _ => None,
        }
    }

    pub fn switch_tab(&self, tab_id: &TabId) -> bool {
        self.apply(Mutation::SwitchTab {
            tab_id: tab_id.clone(),
        })
        .is_applied()
    }

    /// False when the tab is pinned, unknown, or the session's only tab.
    pub fn close_tab(&self, tab_id: &TabId) -> bool {
        self.apply(Mutation::CloseTab {
            tab_id: tab_id.clone(),
        })
        .is_applied()
    }

    /// `None` once the split cap is reached.
    pub fn create_split(&self, direction: SplitDirection) -> Option<(SplitId, TabId)> {
        match self.apply(Mutation::CreateSplit { direction }) {
            MutationOutcome::SplitCreated { split_id, tab_id } => Some((split_id, tab_id)),
            _ => None,
        }
    }

    /// Returns the composed command line after navigation.
    pub fn navigate_history(&self, tab_id: &TabId, delta: i32) -> String {
        match self.apply(Mutation::NavigateHistory {
            tab_id: tab_id.clone(),
            delta,
        }) {
            MutationOutcome::InputLine(line) => line,
            _ => String::new(),
        }
    }

    /// False when the tab no longer exists; the entries are dropped.
    pub fn append_output(&self, tab_id: &TabId, entries: Vec<OutputEntry>) -> bool {
        self.apply(Mutation::AppendOutput {
            tab_id: tab_id.clone(),
            entries,
        })
        .is_applied()
    }

    pub fn add_observer(
        &self,
        observer: impl Fn(&SessionEntity, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.observers.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove_observer(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<SessionEntity>> {
        self.observers.subscribe()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex as PlMutex;
    use termcore_protocol::{JobStatus, MAX_SPLITS, OutputKind};

    use super::*;

    fn store() -> SessionStore {
        SessionStore::default()
    }

    fn active_count(store: &SessionStore) -> usize {
        store.read(|state| state.tabs.iter().filter(|tab| tab.is_active).count())
    }

    #[test]
    fn new_session_has_one_active_console_tab() {
        let store = store();
        let state = store.snapshot();
        assert_eq!(state.tabs.len(), 1);
        assert_eq!(state.splits.len(), 1);
        assert_eq!(state.tabs[0].kind, TabKind::Console);
        assert!(state.tabs[0].is_active);
        assert_eq!(state.directory, "/home/user");
        assert_eq!(state.panels.len(), 1);
        assert!(state.panels[0].input_focused);
    }

    #[test]
    fn create_tab_appends_to_current_split_and_activates() {
        let store = store();
        let tab_id = store.create_tab(TabKind::Git).unwrap();
        let state = store.snapshot();
        assert_eq!(state.active_tab.as_ref(), Some(&tab_id));
        assert_eq!(state.splits[0].tabs.last(), Some(&tab_id));
        assert_eq!(active_count(&store), 1);
    }

    #[test]
    fn closing_first_created_tab_leaves_second_active() {
        let store = store();
        let first = store.create_tab(TabKind::Console).unwrap();
        let second = store.create_tab(TabKind::Console).unwrap();
        assert!(store.close_tab(&first));
        assert_eq!(store.active_tab_id(), Some(second));
        assert_eq!(active_count(&store), 1);
    }

    #[test]
    fn closing_active_tab_activates_next_remaining() {
        let store = store();
        let initial = store.active_tab_id().unwrap();
        let middle = store.create_tab(TabKind::Console).unwrap();
        let last = store.create_tab(TabKind::Console).unwrap();
        store.switch_tab(&middle);

        assert!(store.close_tab(&middle));
        assert_eq!(store.active_tab_id(), Some(last.clone()));

        assert!(store.close_tab(&last));
        assert_eq!(store.active_tab_id(), Some(initial));
        assert_eq!(active_count(&store), 1);
    }

    #[test]
    fn pinned_tab_is_never_closed() {
        let store = store();
        let tab_id = store.create_tab(TabKind::Build).unwrap();
        store.apply(Mutation::PinTab {
            tab_id: tab_id.clone(),
            pinned: true,
        });
        assert!(!store.close_tab(&tab_id));
        assert!(store.read(|state| state.split_of(&tab_id).is_some()));
    }

    #[test]
    fn only_tab_cannot_be_closed() {
        let store = store();
        let only = store.active_tab_id().unwrap();
        assert!(!store.close_tab(&only));
        assert_eq!(store.snapshot().tabs.len(), 1);
    }

    #[test]
    fn split_count_never_exceeds_cap() {
        let store = store();
        for _ in 0..10 {
            store.create_split(SplitDirection::Vertical);
        }
        let state = store.snapshot();
        assert_eq!(state.splits.len(), MAX_SPLITS);
        assert!(state.splits.iter().all(|split| !split.tabs.is_empty()));
        let total: f32 = state.splits.iter().map(|split| split.size).sum();
        assert!((total - 100.0).abs() < 0.01);
    }

    #[test]
    fn new_split_is_seeded_with_one_active_tab() {
        let store = store();
        let (split_id, tab_id) = store.create_split(SplitDirection::Horizontal).unwrap();
        let state = store.snapshot();
        let split = state.splits.iter().find(|s| s.id == split_id).unwrap();
        assert_eq!(split.tabs, vec![tab_id.clone()]);
        assert_eq!(state.active_tab, Some(tab_id));
    }

    #[test]
    fn closing_last_tab_of_split_activates_sibling_split() {
        let store = store();
        let original = store.active_tab_id().unwrap();
        let (_, split_tab) = store.create_split(SplitDirection::Vertical).unwrap();
        assert!(store.close_tab(&split_tab));
        let state = store.snapshot();
        assert_eq!(state.splits.len(), 1);
        assert_eq!(state.active_tab, Some(original));
        assert_eq!(state.splits[0].size, 100.0);
    }

    #[test]
    fn resize_rebalances_remaining_splits() {
        let store = store();
        let first = store.snapshot().splits[0].id.clone();
        store.create_split(SplitDirection::Vertical);
        store.create_split(SplitDirection::Vertical);
        assert!(
            store
                .apply(Mutation::ResizeSplit {
                    split_id: first.clone(),
                    size: 95.0
                })
                .is_applied()
        );
        let state = store.snapshot();
        assert_eq!(state.splits[0].size, 90.0);
        assert_eq!(state.splits[1].size, 5.0);
    }

    #[test]
    fn output_is_bounded_by_config() {
        let store = SessionStore::new(SessionConfig {
            max_output_lines: 2,
            ..SessionConfig::default()
        });
        let tab_id = store.active_tab_id().unwrap();
        for i in 0..5 {
            store.append_output(&tab_id, vec![OutputEntry::info(format!("{i}"))]);
        }
        let outputs: Vec<String> = store.read(|state| {
            state
                .tab(&tab_id)
                .unwrap()
                .outputs
                .iter()
                .map(|entry| entry.message.clone())
                .collect()
        });
        assert_eq!(outputs, vec!["3", "4"]);
    }

    #[test]
    fn output_for_closed_tab_is_dropped() {
        let store = store();
        let tab_id = store.create_tab(TabKind::Console).unwrap();
        store.close_tab(&tab_id);
        assert!(!store.append_output(&tab_id, vec![OutputEntry::info("late")]));
    }

    #[test]
    fn navigate_history_with_empty_history_returns_empty_line() {
        let store = store();
        let tab_id = store.active_tab_id().unwrap();
        assert_eq!(store.navigate_history(&tab_id, -1), "");
        assert_eq!(store.navigate_history(&tab_id, 1), "");
    }

    #[test]
    fn record_history_feeds_tab_and_session_history() {
        let store = store();
        let tab_id = store.active_tab_id().unwrap();
        for line in ["ls", "ls", "pwd"] {
            store.apply(Mutation::RecordHistory {
                tab_id: tab_id.clone(),
                line: line.to_owned(),
            });
        }
        let state = store.snapshot();
        assert_eq!(state.tab(&tab_id).unwrap().command_history, vec!["ls", "pwd"]);
        assert_eq!(state.history, vec!["ls", "ls", "pwd"]);
        assert_eq!(store.navigate_history(&tab_id, -1), "pwd");
    }

    #[test]
    fn change_directory_updates_session_and_tab() {
        let store = store();
        let tab_id = store.active_tab_id().unwrap();
        store.apply(Mutation::ChangeDirectory {
            tab_id: Some(tab_id.clone()),
            path: "projects/../code".into(),
        });
        let state = store.snapshot();
        assert_eq!(state.directory, "/home/user/code");
        assert_eq!(state.tab(&tab_id).unwrap().directory, "/home/user/code");

        let next = store.create_tab(TabKind::Console).unwrap();
        assert_eq!(
            store.read(|state| state.tab(&next).unwrap().directory.clone()),
            "/home/user/code"
        );
    }

    #[test]
    fn jobs_start_and_finish() {
        let store = store();
        let tab_id = store.active_tab_id().unwrap();
        let outcome = store.apply(Mutation::StartJob {
            tab_id,
            command: "watch".into(),
        });
        assert_eq!(outcome, MutationOutcome::JobStarted(1));
        assert!(
            store
                .apply(Mutation::FinishJob {
                    job_id: 1,
                    status: JobStatus::Done
                })
                .is_applied()
        );
        assert!(
            !store
                .apply(Mutation::FinishJob {
                    job_id: 1,
                    status: JobStatus::Failed
                })
                .is_applied()
        );
        assert_eq!(store.snapshot().jobs[0].status, JobStatus::Done);
    }

    #[test]
    fn files_resolve_against_session_directory() {
        let store = store();
        store.apply(Mutation::WriteFile {
            path: "notes.txt".into(),
            content: "hi".into(),
        });
        assert!(store.read(|state| state.files.contains_key("/home/user/notes.txt")));
        assert!(
            store
                .apply(Mutation::RemoveFile {
                    path: "~/notes.txt".into()
                })
                .is_applied()
        );
    }

    #[test]
    fn observers_see_applied_mutations_only() {
        let store = store();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_observer(move |_, event| sink.lock().push(event.to_owned()));
        store.add_observer(|_, _| panic!("broken observer"));

        let only = store.active_tab_id().unwrap();
        store.close_tab(&only);
        store.create_tab(TabKind::Test);
        store.apply(Mutation::UnsetEnv {
            key: "MISSING".into(),
        });

        assert_eq!(seen.lock().clone(), vec!["tab_created".to_owned()]);
    }

    #[test]
    fn from_state_restores_and_repairs() {
        let source = store();
        let tab_id = source.active_tab_id().unwrap();
        source.append_output(
            &tab_id,
            vec![OutputEntry::new(OutputKind::Success, "restored")],
        );
        let json = serde_json::to_string(&source.snapshot()).unwrap();
        let state: SessionState = serde_json::from_str(&json).unwrap();

        let restored = SessionStore::from_state(SessionConfig::default(), state);
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.active_tab, Some(tab_id.clone()));
        assert_eq!(snapshot.panels.len(), 1);
        assert_eq!(snapshot.tab(&tab_id).unwrap().outputs[0].message, "restored");
    }
}
