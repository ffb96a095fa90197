//! Command and session throughput counters.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use termcore_dispatch::{CommandDispatcher, DispatchStatus};
use termcore_events::ObserverId;
use termcore_session::SessionStore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub commands_not_found: u64,
    pub output_entries: u64,
    pub session_mutations: u64,
    pub mean_latency_ms: f64,
}

#[derive(Default)]
struct Totals {
    metrics: PerformanceMetrics,
    latency_total: Duration,
}

#[derive(Default)]
struct Attachments {
    session: Option<ObserverId>,
    dispatcher: Option<ObserverId>,
    poll: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct PerformanceMonitor {
    totals: Arc<Mutex<Totals>>,
    attachments: Mutex<Attachments>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers observers on both services. Calling it again is a no-op.
    pub fn attach(&self, store: &SessionStore, dispatcher: &CommandDispatcher) {
        let mut attachments = self.attachments.lock();
        if attachments.session.is_some() {
            return;
        }
        let totals = self.totals.clone();
        attachments.session = Some(store.add_observer(move |_, _| {
            totals.lock().metrics.session_mutations += 1;
        }));
        let totals = self.totals.clone();
        attachments.dispatcher = Some(dispatcher.add_observer(move |record, _| {
            let mut totals = totals.lock();
            totals.latency_total += record.elapsed;
            let totals = &mut *totals;
            let metrics = &mut totals.metrics;
            metrics.commands_executed += 1;
            metrics.output_entries += record.outputs as u64;
            match record.status {
                DispatchStatus::Failed => metrics.commands_failed += 1,
                DispatchStatus::NotFound => metrics.commands_not_found += 1,
                DispatchStatus::Succeeded | DispatchStatus::Streaming => {}
            }
            metrics.mean_latency_ms =
                totals.latency_total.as_secs_f64() * 1000.0 / metrics.commands_executed as f64;
        }));
    }

    pub fn detach(&self, store: &SessionStore, dispatcher: &CommandDispatcher) {
        let mut attachments = self.attachments.lock();
        if let Some(id) = attachments.session.take() {
            store.remove_observer(id);
        }
        if let Some(id) = attachments.dispatcher.take() {
            dispatcher.remove_observer(id);
        }
        if let Some(handle) = attachments.poll.take() {
            handle.abort();
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.totals.lock().metrics.clone()
    }

    /// Logs the counters at `debug` every `interval`.
    pub fn start_polling(&self, interval: Duration) {
        let mut attachments = self.attachments.lock();
        if attachments
            .poll
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let period = interval.max(Duration::from_millis(100));
        let totals = Arc::downgrade(&self.totals);
        attachments.poll = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(totals) = totals.upgrade() else {
                    break;
                };
                let metrics = totals.lock().metrics.clone();
                debug!(
                    commands = metrics.commands_executed,
                    failed = metrics.commands_failed,
                    not_found = metrics.commands_not_found,
                    outputs = metrics.output_entries,
                    mutations = metrics.session_mutations,
                    mean_latency_ms = metrics.mean_latency_ms,
                    "terminal metrics"
                );
            }
        }));
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.attachments.get_mut().poll.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use termcore_dispatch::BuiltinCatalog;
    use termcore_plugins::PluginRegistry;
    use termcore_session::SessionConfig;

    use super::*;

    #[tokio::test]
    async fn counts_commands_by_outcome() {
        let store = Arc::new(SessionStore::new(SessionConfig::default()));
        let dispatcher = CommandDispatcher::new(
            store.clone(),
            Arc::new(PluginRegistry::new()),
            Arc::new(BuiltinCatalog::new()),
        );
        let monitor = PerformanceMonitor::new();
        monitor.attach(&store, &dispatcher);
        monitor.attach(&store, &dispatcher);

        dispatcher.execute("pwd", None).await;
        dispatcher.execute("nosuchcommand", None).await;
        dispatcher.execute("grep [", None).await;

        let metrics = monitor.metrics();
        assert_eq!(metrics.commands_executed, 3);
        assert_eq!(metrics.commands_not_found, 1);
        assert_eq!(metrics.commands_failed, 1);
        assert!(metrics.output_entries >= 6);
        assert!(metrics.session_mutations > 0);

        monitor.detach(&store, &dispatcher);
        dispatcher.execute("pwd", None).await;
        assert_eq!(monitor.metrics().commands_executed, 3);
    }
}
