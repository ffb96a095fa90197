//! Publish/subscribe plumbing shared by every terminal-core service.
//!
//! [`ObserverHub`] is a synchronous callback list: each observer is invoked in
//! isolation, so a panicking observer is logged and skipped without breaking
//! the others. Every notification is also published on an [`EventStreamHub`]
//! for async consumers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Callback invoked with `(entity, event_name)`.
pub type ObserverFn<E> = Arc<dyn Fn(&E, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A notification as seen by stream subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<E> {
    pub entity: E,
    pub event: String,
}

#[derive(Clone, Debug)]
pub struct EventStreamHub<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventStreamHub<T> {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: T) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<T> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Stream that skips over lagged gaps instead of yielding errors.
    pub fn stream(&self) -> impl Stream<Item = T> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event stream subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct ObserverHub<E> {
    name: &'static str,
    observers: Mutex<Vec<(ObserverId, ObserverFn<E>)>>,
    next_id: AtomicU64,
    stream: EventStreamHub<Notification<E>>,
}

impl<E: Clone + Send + 'static> ObserverHub<E> {
    /// `name` labels log lines emitted when an observer fails.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stream: EventStreamHub::new(256),
        }
    }

    pub fn add_observer(&self, observer: impl Fn(&E, &str) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Returns false when the id was never registered or already removed.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(candidate, _)| *candidate != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Calls every observer outside the registration lock, so observers may
    /// add or remove observers while being notified.
    pub fn notify(&self, entity: &E, event: &str) {
        let observers: Vec<(ObserverId, ObserverFn<E>)> = self.observers.lock().clone();
        for (id, observer) in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer(entity, event)));
            if outcome.is_err() {
                warn!(hub = self.name, observer = id.0, event, "observer panicked; skipped");
            }
        }
        self.stream.publish(Notification {
            entity: entity.clone(),
            event: event.to_owned(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification<E>> {
        self.stream.subscribe()
    }

    pub fn stream(&self) -> impl Stream<Item = Notification<E>> + Send + 'static {
        self.stream.stream()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::StreamExt;

    use super::*;

    #[test]
    fn panicking_observer_does_not_stop_others() {
        let hub: ObserverHub<String> = ObserverHub::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        hub.add_observer(|_, _| panic!("faulty observer"));
        let counter = calls.clone();
        hub.add_observer(move |entity, event| {
            assert_eq!(entity, "tab-1");
            assert_eq!(event, "tab_created");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.notify(&"tab-1".to_owned(), "tab_created");
        hub.notify(&"tab-1".to_owned(), "tab_created");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_observer_is_not_called() {
        let hub: ObserverHub<u32> = ObserverHub::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = hub.add_observer(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(hub.remove_observer(id));
        assert!(!hub.remove_observer(id));
        hub.notify(&1, "changed");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn notifications_reach_stream_subscribers() {
        let hub: ObserverHub<u32> = ObserverHub::new("test");
        let mut stream = Box::pin(hub.stream());
        hub.notify(&7, "saved");

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.entity, 7);
        assert_eq!(notification.event, "saved");
    }

    #[tokio::test]
    async fn stream_hub_broadcasts_to_every_subscriber() {
        let hub = EventStreamHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        hub.publish("ping".to_owned());
        assert_eq!(first.recv().await.unwrap(), "ping");
        assert_eq!(second.recv().await.unwrap(), "ping");
        assert_eq!(hub.subscriber_count(), 2);
    }
}
