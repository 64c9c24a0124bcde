//! Durable, bounded FIFO queue of pending events.
//!
//! Persists as a single encrypted blob under the platform data directory,
//! written with the temp-file + fsync + rename pattern so a crash mid-write
//! never corrupts the previous snapshot.

use crate::codec;
use crate::config::OverflowStrategy;
use crate::error::{PipelineError, PipelineResult};
use crate::event::Event;
use crate::keystore::KeyStore;
use crate::observer::ObserverRegistry;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An `Event` plus the delivery bookkeeping the queue needs to schedule
/// retries and enforce TTL/overflow policy. Created exactly once per event
/// by the pipeline; only the queue mutates `retry_count`/`last_attempt_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: Event,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedEvent {
    fn new(event: Event) -> Self {
        Self { event, queued_at: Utc::now(), retry_count: 0, last_attempt_at: None }
    }

    /// Per-event retry-backoff: `delay = min(2^retry_count, 300)s`, jittered
    /// ±25%. Eligible if no attempt has been made yet, or the jittered delay
    /// has elapsed since the last attempt.
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        let Some(last_attempt) = self.last_attempt_at else {
            return true;
        };
        let delay = retry_backoff(self.retry_count);
        let elapsed = now.signed_duration_since(last_attempt);
        elapsed >= delay
    }
}

fn retry_backoff(retry_count: u32) -> chrono::Duration {
    let base_secs = 2u64.saturating_pow(retry_count).min(300);
    let jitter_fraction = rand::rng().random_range(-0.25..=0.25);
    let jittered = (base_secs as f64) * (1.0 + jitter_fraction);
    chrono::Duration::milliseconds((jittered.max(0.0) * 1000.0) as i64)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    events: VecDeque<QueuedEvent>,
}

/// Point-in-time counters describing queue health, exposed via
/// `Pipeline::stats()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub retriable: usize,
    pub expired: usize,
    pub oldest_age_seconds: u64,
    pub total_size_bytes: usize,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} retriable={} expired={} oldest_age_seconds={} total_size_bytes={}",
            self.total, self.retriable, self.expired, self.oldest_age_seconds, self.total_size_bytes
        )
    }
}

/// Bounded, durable FIFO queue of events awaiting transmission.
pub struct EventQueue {
    path: PathBuf,
    key_store: Arc<dyn KeyStore>,
    observers: Arc<ObserverRegistry>,
    max_queue_hard: usize,
    overflow_strategy: OverflowStrategy,
    ttl: chrono::Duration,
    max_retries: u32,
    events: VecDeque<QueuedEvent>,
}

fn queue_path() -> PathBuf {
    let home = dirs::data_local_dir().or_else(dirs::home_dir).unwrap_or_default();
    let dir = home.join("analytics-pipeline");
    dir.join("queue.bin")
}

impl EventQueue {
    /// Opens (and decrypts, if present) the on-disk queue, or starts empty.
    pub fn open(
        key_store: Arc<dyn KeyStore>,
        observers: Arc<ObserverRegistry>,
        max_queue_hard: usize,
        overflow_strategy: OverflowStrategy,
        ttl: std::time::Duration,
        max_retries: u32,
    ) -> PipelineResult<Self> {
        Self::open_at(queue_path(), key_store, observers, max_queue_hard, overflow_strategy, ttl, max_retries)
    }

    /// Opens a queue backed by an explicit path — used by the default
    /// platform location and directly by tests that want an isolated temp
    /// directory.
    pub fn open_at(
        path: PathBuf,
        key_store: Arc<dyn KeyStore>,
        observers: Arc<ObserverRegistry>,
        max_queue_hard: usize,
        overflow_strategy: OverflowStrategy,
        ttl: std::time::Duration,
        max_retries: u32,
    ) -> PipelineResult<Self> {
        let mut queue = EventQueue {
            path,
            key_store,
            observers,
            max_queue_hard,
            overflow_strategy,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(7)),
            max_retries,
            events: VecDeque::new(),
        };
        queue.load()?;
        queue.sweep_expired();
        Ok(queue)
    }

    fn load(&mut self) -> PipelineResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let blob = fs::read(&self.path)?;
        if blob.is_empty() {
            return Ok(());
        }
        let key = self.key_store.get_or_create_key()?;
        let plaintext = match codec::decrypt(&key, &blob) {
            Ok(p) => p,
            Err(e) => {
                warn!("[queue] failed to decrypt persisted queue, starting empty: {e}");
                return Ok(());
            }
        };
        let snapshot: QueueSnapshot = serde_json::from_slice(&plaintext)?;
        self.events = snapshot.events;
        info!("[queue] loaded {} persisted event(s)", self.events.len());
        Ok(())
    }

    /// Atomically persists the current queue contents: write to a temp file
    /// in the same directory, fsync, then rename over the real path.
    pub fn persist(&self) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot = QueueSnapshot { events: self.events.clone() };
        let plaintext = serde_json::to_vec(&snapshot)?;
        let key = self.key_store.get_or_create_key()?;
        let blob = codec::encrypt(&key, &plaintext)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&blob)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Partitions the queue into live/expired by `now - queued_at > ttl`,
    /// retaining live events and notifying `events_expired` for the rest.
    pub fn sweep_expired(&mut self) {
        let now = Utc::now();
        let ttl = self.ttl;
        let (live, expired): (VecDeque<_>, VecDeque<_>) =
            self.events.drain(..).partition(|q| now.signed_duration_since(q.queued_at) <= ttl);
        self.events = live;
        if !expired.is_empty() {
            info!("[queue] swept {} expired event(s)", expired.len());
            let events: Vec<Event> = expired.into_iter().map(|q| q.event).collect();
            self.observers.notify_events_expired(&events);
        }
    }

    /// Enqueues a new event, applying the configured overflow policy if the
    /// queue is already at `max_queue_hard`.
    pub fn enqueue(&mut self, event: Event) {
        if self.events.len() >= self.max_queue_hard {
            match self.overflow_strategy {
                OverflowStrategy::DropOldest => {
                    let drop_count = ((self.events.len() as f64) * 0.2).ceil().max(1.0) as usize;
                    for _ in 0..drop_count.min(self.events.len()) {
                        self.events.pop_front();
                    }
                    self.observers.notify_events_dropped(drop_count, "drop-oldest");
                }
                OverflowStrategy::DropNewest => {
                    self.observers.notify_events_dropped(1, "drop-newest");
                    return;
                }
                OverflowStrategy::DropAll => {
                    let count = self.events.len() + 1;
                    self.events.clear();
                    self.observers.notify_events_dropped(count, "drop-all");
                    return;
                }
            }
        }

        let queued = QueuedEvent::new(event);
        self.observers.notify_event_queued(&queued.event);
        self.events.push_back(queued);
    }

    /// Returns up to `batch_size` head events eligible for the next attempt
    /// (see retry-backoff above). Ineligible events are skipped in place —
    /// they are never reordered relative to events behind them.
    pub fn take_batch(&self, batch_size: usize) -> Vec<QueuedEvent> {
        let now = Utc::now();
        self.events
            .iter()
            .filter(|q| q.retry_count < self.max_retries && q.is_eligible(now))
            .take(batch_size)
            .cloned()
            .collect()
    }

    /// Records the outcome of attempting to deliver `batch_ids`.
    ///
    /// On success: removes the delivered events and notifies `events_sent`.
    /// On failure: increments `retry_count` and `last_attempt_at` for each
    /// member, dropping (and notifying `events_dropped`) any that have now
    /// exhausted their retry budget.
    pub fn commit_outcome(&mut self, batch_ids: &[String], success: bool, max_retries: u32) {
        if success {
            let mut sent = Vec::with_capacity(batch_ids.len());
            self.events.retain(|q| {
                if batch_ids.contains(&q.event.id) {
                    sent.push(q.event.clone());
                    false
                } else {
                    true
                }
            });
            self.observers.notify_events_sent(&sent);
            return;
        }

        let now = Utc::now();
        for queued in self.events.iter_mut() {
            if batch_ids.contains(&queued.event.id) {
                queued.retry_count += 1;
                queued.last_attempt_at = Some(now);
            }
        }

        let mut exhausted = 0usize;
        self.events.retain(|q| {
            if batch_ids.contains(&q.event.id) && q.retry_count >= max_retries {
                exhausted += 1;
                false
            } else {
                true
            }
        });
        self.observers.notify_events_dropped(exhausted, "max-retries");
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let retriable = self.events.iter().filter(|q| q.retry_count < self.max_retries && q.is_eligible(now)).count();
        let expired = self.events.iter().filter(|q| now.signed_duration_since(q.queued_at) > self.ttl).count();
        let oldest_age_seconds = self
            .events
            .front()
            .map(|q| now.signed_duration_since(q.queued_at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let total_size_bytes = self.events.iter().map(|q| q.event.approx_size()).sum();

        QueueStats {
            total: self.events.len(),
            retriable,
            expired,
            oldest_age_seconds,
            total_size_bytes,
        }
    }
}

/// Returns a `EventQueue` backed by a file under `dir` — used by
/// [`EventQueue::open`] indirectly via the default path, and directly by
/// tests that want an isolated temp directory.
pub fn path_under(dir: &Path) -> PathBuf {
    dir.join("queue.bin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::InMemoryKeyStore;
    use std::time::Duration;

    fn new_queue(max_queue_hard: usize, strategy: OverflowStrategy, max_retries: u32) -> (EventQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = path_under(dir.path());
        let queue = EventQueue::open_at(
            path,
            Arc::new(InMemoryKeyStore::default()),
            Arc::new(ObserverRegistry::default()),
            max_queue_hard,
            strategy,
            Duration::from_secs(3600),
            max_retries,
        )
        .unwrap();
        (queue, dir)
    }

    #[test]
    fn enqueue_and_take_batch_round_trip() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 3);
        queue.enqueue(Event::new("a"));
        queue.enqueue(Event::new("b"));
        assert_eq!(queue.len(), 2);
        let batch = queue.take_batch(10);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn drop_oldest_evicts_twenty_percent_on_overflow() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 3);
        let mut first_id = String::new();
        for i in 0..10 {
            let event = Event::new(format!("e{i}"));
            if i == 0 {
                first_id = event.id.clone();
            }
            queue.enqueue(event);
        }
        // queue now at max_queue_hard; next enqueue drops ceil(10*0.2)=2
        queue.enqueue(Event::new("overflow"));
        assert_eq!(queue.len(), 9);
        assert!(queue.take_batch(20).iter().all(|q| q.event.id != first_id));
    }

    #[test]
    fn drop_newest_rejects_incoming_event() {
        let (mut queue, _dir) = new_queue(1, OverflowStrategy::DropNewest, 3);
        queue.enqueue(Event::new("kept"));
        queue.enqueue(Event::new("rejected"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_batch(10)[0].event.name, "kept");
    }

    #[test]
    fn drop_all_clears_queue_on_overflow() {
        let (mut queue, _dir) = new_queue(2, OverflowStrategy::DropAll, 3);
        queue.enqueue(Event::new("a"));
        queue.enqueue(Event::new("b"));
        queue.enqueue(Event::new("c"));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn commit_outcome_failure_increments_and_drops_exhausted() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 2);
        let event = Event::new("flaky");
        let id = event.id.clone();
        queue.enqueue(event);

        queue.commit_outcome(&[id.clone()], false, 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_batch(10)[0].retry_count, 1);

        queue.commit_outcome(&[id.clone()], false, 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn ineligible_retry_is_skipped_by_take_batch() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 5);
        let event = Event::new("flaky");
        let id = event.id.clone();
        queue.enqueue(event);
        queue.commit_outcome(&[id], false, 5);
        // retry_count is now 1, last_attempt_at = now; backoff ~2s means it
        // should not be immediately eligible.
        assert!(queue.take_batch(10).is_empty());
    }

    #[test]
    fn commit_outcome_success_removes_delivered_events() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 3);
        let event = Event::new("delivered");
        let id = event.id.clone();
        queue.enqueue(event);
        queue.commit_outcome(&[id], true, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn persist_and_reload_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_under(dir.path());
        let key_store = Arc::new(InMemoryKeyStore::default());

        let mut queue = EventQueue::open_at(
            path.clone(),
            key_store.clone(),
            Arc::new(ObserverRegistry::default()),
            10,
            OverflowStrategy::DropOldest,
            Duration::from_secs(3600),
            3,
        )
        .unwrap();
        queue.enqueue(Event::new("persisted"));
        queue.persist().unwrap();

        let reloaded = EventQueue::open_at(
            path,
            key_store,
            Arc::new(ObserverRegistry::default()),
            10,
            OverflowStrategy::DropOldest,
            Duration::from_secs(3600),
            3,
        )
        .unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn sweep_expired_drops_stale_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_under(dir.path());
        let mut queue = EventQueue::open_at(
            path,
            Arc::new(InMemoryKeyStore::default()),
            Arc::new(ObserverRegistry::default()),
            10,
            OverflowStrategy::DropOldest,
            Duration::from_millis(1),
            3,
        )
        .unwrap();
        let stale = QueuedEvent {
            event: Event::new("stale"),
            queued_at: Utc::now() - chrono::Duration::hours(1),
            retry_count: 0,
            last_attempt_at: None,
        };
        queue.events.push_back(stale);
        queue.sweep_expired();
        assert!(queue.is_empty());
    }

    #[test]
    fn stats_reports_spec_shaped_snapshot() {
        let (mut queue, _dir) = new_queue(10, OverflowStrategy::DropOldest, 3);
        queue.enqueue(Event::new("a"));
        let stats = queue.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.retriable, 1);
        assert_eq!(stats.expired, 0);
        assert!(stats.total_size_bytes > 0);
    }
}
