//! Pure state transitions behind [`crate::SessionStore::apply`].

use chrono::Utc;
use termcore_protocol::{
    Job, JobStatus, MAX_SPLITS, Mutation, MutationOutcome, Panel, SessionState, Split,
    SplitDirection, SplitId, Tab, TabId, TabKind,
};

use crate::SessionConfig;
use crate::paths;

/// Finished jobs kept around for `jobs` listings.
const MAX_FINISHED_JOBS: usize = 50;
const MIN_SPLIT_SIZE: f32 = 10.0;
const MAX_SPLIT_SIZE: f32 = 90.0;

/// The entity a mutation touched, reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEntity {
    Session,
    Tab(TabId),
    Split(SplitId),
    Job(u32),
}

pub(crate) fn apply(
    state: &mut SessionState,
    config: &SessionConfig,
    mutation: Mutation,
) -> (MutationOutcome, SessionEntity) {
    match mutation {
        Mutation::CreateTab { kind, name } => {
            let tab_id = create_tab(state, kind, name);
            (
                MutationOutcome::TabCreated(tab_id.clone()),
                SessionEntity::Tab(tab_id),
            )
        }
        Mutation::SwitchTab { tab_id } => {
            let outcome = if activate(state, &tab_id) {
                MutationOutcome::Applied
            } else {
                MutationOutcome::Ignored
            };
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::CloseTab { tab_id } => {
            let outcome = close_tab(state, &tab_id);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::PinTab { tab_id, pinned } => {
            let outcome = with_tab(state, &tab_id, |tab| tab.is_pinned = pinned);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::RenameTab { tab_id, name } => {
            let outcome = with_tab(state, &tab_id, |tab| tab.name = name);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::MarkModified { tab_id, modified } => {
            let outcome = with_tab(state, &tab_id, |tab| tab.is_modified = modified);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::CreateSplit { direction } => match create_split(state, direction) {
            Some((split_id, tab_id)) => (
                MutationOutcome::SplitCreated {
                    split_id: split_id.clone(),
                    tab_id,
                },
                SessionEntity::Split(split_id),
            ),
            None => (MutationOutcome::Ignored, SessionEntity::Session),
        },
        Mutation::ResizeSplit { split_id, size } => {
            let outcome = resize_split(state, &split_id, size);
            (outcome, SessionEntity::Split(split_id))
        }
        Mutation::AppendOutput { tab_id, entries } => {
            let cap = config.max_output_lines;
            let outcome = with_tab(state, &tab_id, |tab| tab.push_outputs(entries, cap));
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::ClearOutput { tab_id } => {
            let outcome = with_tab(state, &tab_id, |tab| tab.outputs.clear());
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::RecordHistory { tab_id, line } => {
            let outcome = record_history(state, config, &tab_id, line);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::SetInputLine { tab_id, line } => {
            let outcome = with_tab(state, &tab_id, |tab| tab.input_line = line);
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::NavigateHistory { tab_id, delta } => {
            let outcome = match state.tab_mut(&tab_id) {
                Some(tab) => MutationOutcome::InputLine(navigate_history(tab, delta)),
                None => MutationOutcome::Ignored,
            };
            (outcome, SessionEntity::Tab(tab_id))
        }
        Mutation::ChangeDirectory { tab_id, path } => {
            let outcome = change_directory(state, config, tab_id.as_ref(), &path);
            let entity = tab_id.map_or(SessionEntity::Session, SessionEntity::Tab);
            (outcome, entity)
        }
        Mutation::SetEnv { key, value } => {
            state.environment.insert(key, value);
            (MutationOutcome::Applied, SessionEntity::Session)
        }
        Mutation::UnsetEnv { key } => (
            applied_if(state.environment.remove(&key).is_some()),
            SessionEntity::Session,
        ),
        Mutation::SetAlias { name, expansion } => {
            state.aliases.insert(name, expansion);
            (MutationOutcome::Applied, SessionEntity::Session)
        }
        Mutation::RemoveAlias { name } => (
            applied_if(state.aliases.remove(&name).is_some()),
            SessionEntity::Session,
        ),
        Mutation::StartJob { tab_id, command } => {
            let job_id = state.next_job_id;
            state.next_job_id = state.next_job_id.saturating_add(1);
            state.jobs.push(Job {
                id: job_id,
                command,
                tab_id,
                status: JobStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
            });
            (MutationOutcome::JobStarted(job_id), SessionEntity::Job(job_id))
        }
        Mutation::FinishJob { job_id, status } => {
            let outcome = finish_job(state, job_id, status);
            (outcome, SessionEntity::Job(job_id))
        }
        Mutation::SetPreference { key, value } => {
            state.preferences.insert(key, value);
            (MutationOutcome::Applied, SessionEntity::Session)
        }
        Mutation::WriteFile { path, content } => {
            let path = paths::resolve(&state.directory, &path, &config.home_directory);
            state.files.insert(path, content);
            (MutationOutcome::Applied, SessionEntity::Session)
        }
        Mutation::RemoveFile { path } => {
            let path = paths::resolve(&state.directory, &path, &config.home_directory);
            (
                applied_if(state.files.remove(&path).is_some()),
                SessionEntity::Session,
            )
        }
        Mutation::Restore { state: restored } => {
            *state = *restored;
            repair(state, config);
            (MutationOutcome::Applied, SessionEntity::Session)
        }
    }
}

fn applied_if(changed: bool) -> MutationOutcome {
    if changed {
        MutationOutcome::Applied
    } else {
        MutationOutcome::Ignored
    }
}

fn with_tab(
    state: &mut SessionState,
    tab_id: &TabId,
    update: impl FnOnce(&mut Tab),
) -> MutationOutcome {
    match state.tab_mut(tab_id) {
        Some(tab) => {
            update(tab);
            tab.touch();
            MutationOutcome::Applied
        }
        None => MutationOutcome::Ignored,
    }
}

/// Seeds an empty state with one console tab in one split.
pub(crate) fn seed(state: &mut SessionState) {
    if state.tabs.is_empty() {
        state.splits.clear();
        create_tab(state, TabKind::Console, None);
    }
}

fn default_tab_name(state: &SessionState, kind: TabKind) -> String {
    let ordinal = state.tabs.iter().filter(|tab| tab.kind == kind).count() + 1;
    let mut label = kind.as_str().to_owned();
    if let Some(first) = label.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    if ordinal == 1 {
        label
    } else {
        format!("{label} {ordinal}")
    }
}

fn current_directory(state: &SessionState) -> String {
    state
        .active()
        .map(|tab| tab.directory.clone())
        .unwrap_or_else(|| state.directory.clone())
}

fn create_tab(state: &mut SessionState, kind: TabKind, name: Option<String>) -> TabId {
    let name = name.unwrap_or_else(|| default_tab_name(state, kind));
    let tab = Tab::new(kind, name, current_directory(state));
    let tab_id = tab.id.clone();

    let split_index = state
        .active_tab
        .as_ref()
        .and_then(|active| state.splits.iter().position(|split| split.contains(active)))
        .unwrap_or(0);
    if state.splits.is_empty() {
        state.splits.push(Split::new(SplitDirection::Horizontal));
    }
    let split = &mut state.splits[split_index];
    split.tabs.push(tab_id.clone());
    let split_id = split.id.clone();

    state.tabs.push(tab);
    state.panels.push(Panel::bind(tab_id.clone(), split_id));
    activate(state, &tab_id);
    tab_id
}

/// Marks exactly one tab active and focuses its panel input.
fn activate(state: &mut SessionState, tab_id: &TabId) -> bool {
    if state.tab(tab_id).is_none() {
        return false;
    }
    for tab in &mut state.tabs {
        tab.is_active = tab.id == *tab_id;
        if tab.is_active {
            tab.touch();
        }
    }
    for panel in &mut state.panels {
        panel.input_focused = panel.tab_id == *tab_id;
    }
    state.active_tab = Some(tab_id.clone());
    true
}

fn close_tab(state: &mut SessionState, tab_id: &TabId) -> MutationOutcome {
    let Some(tab) = state.tab(tab_id) else {
        return MutationOutcome::Ignored;
    };
    if tab.is_pinned || state.tabs.len() <= 1 {
        return MutationOutcome::Ignored;
    }
    let Some(split_index) = state.splits.iter().position(|split| split.contains(tab_id)) else {
        return MutationOutcome::Ignored;
    };

    let split = &mut state.splits[split_index];
    let position = split.tabs.iter().position(|id| id == tab_id).unwrap_or(0);
    split.tabs.remove(position);

    let successor = if split.tabs.is_empty() {
        state.splits.remove(split_index);
        rebalance(&mut state.splits);
        let sibling = split_index.min(state.splits.len().saturating_sub(1));
        state
            .splits
            .get(sibling)
            .and_then(|split| split.tabs.first().cloned())
    } else {
        let next = position.min(split.tabs.len() - 1);
        split.tabs.get(next).cloned()
    };

    state.tabs.retain(|tab| tab.id != *tab_id);
    state.panels.retain(|panel| panel.tab_id != *tab_id);

    let was_active = state.active_tab.as_ref() == Some(tab_id);
    if was_active {
        state.active_tab = None;
        let fallback = successor.or_else(|| state.tabs.first().map(|tab| tab.id.clone()));
        if let Some(next) = fallback {
            activate(state, &next);
        }
    }
    MutationOutcome::Applied
}

fn create_split(state: &mut SessionState, direction: SplitDirection) -> Option<(SplitId, TabId)> {
    if state.splits.len() >= MAX_SPLITS {
        return None;
    }
    let split = Split::new(direction);
    let split_id = split.id.clone();
    state.splits.push(split);
    rebalance(&mut state.splits);

    let name = default_tab_name(state, TabKind::Console);
    let tab = Tab::new(TabKind::Console, name, current_directory(state));
    let tab_id = tab.id.clone();
    if let Some(split) = state.splits.last_mut() {
        split.tabs.push(tab_id.clone());
    }
    state.tabs.push(tab);
    state
        .panels
        .push(Panel::bind(tab_id.clone(), split_id.clone()));
    activate(state, &tab_id);
    Some((split_id, tab_id))
}

fn rebalance(splits: &mut [Split]) {
    if splits.is_empty() {
        return;
    }
    let share = 100.0 / splits.len() as f32;
    for split in splits {
        split.size = share;
    }
}

fn resize_split(state: &mut SessionState, split_id: &SplitId, size: f32) -> MutationOutcome {
    if state.splits.len() < 2 {
        return MutationOutcome::Ignored;
    }
    let Some(index) = state.splits.iter().position(|split| split.id == *split_id) else {
        return MutationOutcome::Ignored;
    };
    if !state.splits[index].resizable || !size.is_finite() {
        return MutationOutcome::Ignored;
    }
    let size = size.clamp(MIN_SPLIT_SIZE, MAX_SPLIT_SIZE);
    let remainder = (100.0 - size) / (state.splits.len() - 1) as f32;
    for (position, split) in state.splits.iter_mut().enumerate() {
        split.size = if position == index { size } else { remainder };
    }
    MutationOutcome::Applied
}

fn record_history(
    state: &mut SessionState,
    config: &SessionConfig,
    tab_id: &TabId,
    line: String,
) -> MutationOutcome {
    let Some(tab) = state.tab_mut(tab_id) else {
        return MutationOutcome::Ignored;
    };
    if tab.command_history.last() != Some(&line) {
        tab.command_history.push(line.clone());
    }
    trim_front(&mut tab.command_history, config.max_tab_history);
    tab.history_index = -1;
    tab.input_line.clear();
    tab.touch();

    state.history.push(line);
    trim_front(&mut state.history, config.max_history);
    MutationOutcome::Applied
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// Walks the tab history one step per unit of `delta`.
///
/// Index `-1` means "not browsing". Stepping older from `-1` lands on the most
/// recent entry; stepping past either end returns to `-1` with an empty line.
/// Never wraps around.
pub(crate) fn navigate_history(tab: &mut Tab, delta: i32) -> String {
    let len = tab.command_history.len() as i64;
    if len == 0 || delta == 0 {
        return tab.input_line.clone();
    }

    let mut index = tab.history_index.clamp(-1, len - 1);
    let mut reset = false;
    for _ in 0..delta.unsigned_abs() {
        if delta < 0 {
            index = match index {
                -1 => len - 1,
                0 => {
                    reset = true;
                    -1
                }
                other => other - 1,
            };
        } else {
            index = match index {
                -1 => -1,
                last if last == len - 1 => {
                    reset = true;
                    -1
                }
                other => other + 1,
            };
        }
        if reset {
            break;
        }
    }

    tab.history_index = index;
    if index >= 0 {
        tab.input_line = tab.command_history[index as usize].clone();
    } else if reset {
        tab.input_line.clear();
    }
    tab.input_line.clone()
}

fn change_directory(
    state: &mut SessionState,
    config: &SessionConfig,
    tab_id: Option<&TabId>,
    path: &str,
) -> MutationOutcome {
    let base = match tab_id {
        Some(id) => match state.tab(id) {
            Some(tab) => tab.directory.clone(),
            None => return MutationOutcome::Ignored,
        },
        None => state.directory.clone(),
    };
    let resolved = paths::resolve(&base, path, &config.home_directory);
    state.directory = resolved.clone();
    if let Some(tab) = tab_id.and_then(|id| state.tab_mut(id)) {
        tab.directory = resolved;
        tab.touch();
    }
    MutationOutcome::Applied
}

fn finish_job(state: &mut SessionState, job_id: u32, status: JobStatus) -> MutationOutcome {
    let Some(job) = state
        .jobs
        .iter_mut()
        .find(|job| job.id == job_id && job.status == JobStatus::Running)
    else {
        return MutationOutcome::Ignored;
    };
    job.status = status;
    job.finished_at = Some(Utc::now());

    let finished = state
        .jobs
        .iter()
        .filter(|job| job.status != JobStatus::Running)
        .count();
    if finished > MAX_FINISHED_JOBS {
        let mut excess = finished - MAX_FINISHED_JOBS;
        state.jobs.retain(|job| {
            if excess > 0 && job.status != JobStatus::Running {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
    MutationOutcome::Applied
}

/// Re-establishes layout invariants on a restored state and rebuilds panels.
pub(crate) fn repair(state: &mut SessionState, config: &SessionConfig) {
    let known: Vec<TabId> = state.tabs.iter().map(|tab| tab.id.clone()).collect();
    let mut placed: Vec<TabId> = Vec::new();
    for split in &mut state.splits {
        split
            .tabs
            .retain(|id| known.contains(id) && !placed.contains(id));
        placed.extend(split.tabs.iter().cloned());
    }
    state.splits.retain(|split| !split.tabs.is_empty());

    while state.splits.len() > MAX_SPLITS {
        if let Some(extra) = state.splits.pop()
            && let Some(last) = state.splits.last_mut()
        {
            last.tabs.extend(extra.tabs);
        }
    }

    let orphans: Vec<TabId> = known
        .iter()
        .filter(|id| !placed.contains(id))
        .cloned()
        .collect();
    if !orphans.is_empty() {
        if state.splits.is_empty() {
            state.splits.push(Split::new(SplitDirection::Horizontal));
        }
        state.splits[0].tabs.extend(orphans);
    }
    rebalance(&mut state.splits);

    for tab in &mut state.tabs {
        tab.input_line.clear();
        tab.history_index = -1;
        while tab.outputs.len() > config.max_output_lines.max(1) {
            tab.outputs.pop_front();
        }
    }

    state.panels = state
        .splits
        .iter()
        .flat_map(|split| {
            split
                .tabs
                .iter()
                .map(|tab_id| Panel::bind(tab_id.clone(), split.id.clone()))
        })
        .collect();

    seed(state);

    let active = state
        .active_tab
        .clone()
        .filter(|id| state.tab(id).is_some())
        .or_else(|| state.tabs.first().map(|tab| tab.id.clone()));
    if let Some(active) = active {
        activate(state, &active);
    }
}
