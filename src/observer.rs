//! Observer fan-out: callers can register observers to learn about queue and
//! delivery lifecycle transitions without blocking the pipeline's own locks.

use crate::event::Event;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives lifecycle notifications from the pipeline. All methods default
/// to no-ops so implementors only override what they care about. Delivery
/// is best-effort and non-blocking with respect to the pipeline's critical
/// sections — observers must not assume exactly-once delivery across
/// restarts.
pub trait Observer: Send + Sync {
    fn event_queued(&self, _event: &Event) {}
    fn events_sent(&self, _events: &[Event]) {}
    fn events_failed(&self, _events: &[Event], _error_kind: &str) {}
    fn events_dropped(&self, _count: usize, _reason: &str) {}
    fn events_expired(&self, _events: &[Event]) {}
}

/// Holds the registered observer list and dispatches notifications by
/// snapshotting the list before iterating, so no lock is held across
/// observer callbacks (an observer may itself call back into the pipeline).
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().push(observer);
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.lock().clone()
    }

    pub fn notify_event_queued(&self, event: &Event) {
        for observer in self.snapshot() {
            observer.event_queued(event);
        }
    }

    pub fn notify_events_sent(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            observer.events_sent(events);
        }
    }

    pub fn notify_events_failed(&self, events: &[Event], error_kind: &str) {
        if events.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            observer.events_failed(events, error_kind);
        }
    }

    pub fn notify_events_dropped(&self, count: usize, reason: &str) {
        if count == 0 {
            return;
        }
        for observer in self.snapshot() {
            observer.events_dropped(count, reason);
        }
    }

    pub fn notify_events_expired(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            observer.events_expired(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        queued: AtomicUsize,
        sent: AtomicUsize,
        dropped: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn event_queued(&self, _event: &Event) {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }

        fn events_sent(&self, events: &[Event]) {
            self.sent.fetch_add(events.len(), Ordering::SeqCst);
        }

        fn events_dropped(&self, count: usize, _reason: &str) {
            self.dropped.fetch_add(count, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatches_to_all_registered_observers() {
        let registry = ObserverRegistry::default();
        let observer = Arc::new(CountingObserver {
            queued: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });
        registry.register(observer.clone());

        registry.notify_event_queued(&Event::new("a"));
        registry.notify_events_sent(&[Event::new("a"), Event::new("b")]);
        registry.notify_events_dropped(3, "drop-oldest");

        assert_eq!(observer.queued.load(Ordering::SeqCst), 1);
        assert_eq!(observer.sent.load(Ordering::SeqCst), 2);
        assert_eq!(observer.dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unregistered_observer_receives_nothing() {
        let registry = ObserverRegistry::default();
        // No observers registered — should not panic and no-op cleanly.
        registry.notify_events_failed(&[Event::new("a")], "network");
        registry.notify_events_expired(&[Event::new("b")]);
    }

    #[test]
    fn empty_batches_are_not_dispatched() {
        let registry = ObserverRegistry::default();
        let observer = Arc::new(CountingObserver {
            queued: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });
        registry.register(observer.clone());
        registry.notify_events_sent(&[]);
        registry.notify_events_dropped(0, "drop-oldest");
        assert_eq!(observer.sent.load(Ordering::SeqCst), 0);
        assert_eq!(observer.dropped.load(Ordering::SeqCst), 0);
    }
}
