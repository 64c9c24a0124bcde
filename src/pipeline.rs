//! The public orchestrator: owns the queue, circuit breakers, and observers,
//! and drives tracking, batching, and delivery.

use crate::circuit_breaker::{BreakerState, GlobalCircuitBreaker};
use crate::config::Configuration;
use crate::error::{PipelineError, PipelineResult};
use crate::event::{AlwaysOnline, ContextProvider, Event, NetworkStatus, NoopContextProvider};
use crate::keystore::{KeyStore, OsKeyStore};
use crate::observer::{Observer, ObserverRegistry};
use crate::queue::{EventQueue, QueueStats};
use crate::redactor;
use crate::transport::{CertPinConfig, Transport};
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initialized,
    Shutdown,
}

/// Construction parameters for [`Pipeline::new`], exposed so callers (and
/// tests) can substitute fakes for the key store, context, and network
/// status without reaching into pipeline internals.
pub struct PipelineDeps {
    pub key_store: Arc<dyn KeyStore>,
    pub context_provider: Arc<dyn ContextProvider>,
    pub network_status: Arc<dyn NetworkStatus>,
}

impl Default for PipelineDeps {
    fn default() -> Self {
        Self {
            key_store: Arc::new(OsKeyStore),
            context_provider: Arc::new(NoopContextProvider),
            network_status: Arc::new(AlwaysOnline),
        }
    }
}

struct SharedState {
    queue: EventQueue,
    enabled: bool,
    current_user_id: Option<String>,
    current_session_id: Option<String>,
}

/// Client-side telemetry pipeline: ingest, redact, persist, batch, and
/// deliver events, with resilience against transient network failure.
pub struct Pipeline {
    config: Configuration,
    state: SyncMutex<SharedState>,
    lifecycle: SyncMutex<LifecycleState>,
    transport: Arc<Transport>,
    breakers: GlobalCircuitBreaker,
    observers: Arc<ObserverRegistry>,
    context_provider: Arc<dyn ContextProvider>,
    network_status: Arc<dyn NetworkStatus>,
    flush_lock: AsyncMutex<()>,
    auto_flush_handle: SyncMutex<Option<JoinHandle<()>>>,
    auto_flush_stop: Arc<AtomicBool>,
    self_handle: SyncMutex<Weak<Pipeline>>,
}

impl Pipeline {
    /// Initializes the pipeline: opens (or creates) the persisted queue and,
    /// if `config.auto_flush` is set, starts the background flush timer.
    pub fn new(config: Configuration, deps: PipelineDeps) -> PipelineResult<Arc<Self>> {
        let observers = Arc::new(ObserverRegistry::default());

        let queue = EventQueue::open(
            deps.key_store.clone(),
            observers.clone(),
            config.max_queue_hard,
            config.overflow_strategy,
            config.event_ttl,
            config.max_retries,
        )?;

        let transport = Arc::new(Transport::new(
            config.endpoint_url.clone(),
            config.public_id.clone(),
            config.compression_enabled,
            config.compression_threshold_bytes,
            config.request_timeout,
            CertPinConfig {
                pins: config.certificate_pins.clone(),
                allow_self_signed: config.allow_self_signed,
                validate_chain: config.validate_chain,
            },
        )?);

        let pipeline = Arc::new(Pipeline {
            breakers: GlobalCircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown,
                config.half_open_max_attempts,
            ),
            state: SyncMutex::new(SharedState {
                queue,
                enabled: config.enabled,
                current_user_id: None,
                current_session_id: None,
            }),
            lifecycle: SyncMutex::new(LifecycleState::Initialized),
            transport,
            observers,
            context_provider: deps.context_provider,
            network_status: deps.network_status,
            flush_lock: AsyncMutex::new(()),
            auto_flush_handle: SyncMutex::new(None),
            auto_flush_stop: Arc::new(AtomicBool::new(false)),
            self_handle: SyncMutex::new(Weak::new()),
            config,
        });

        *pipeline.self_handle.lock() = Arc::downgrade(&pipeline);

        if pipeline.config.auto_flush {
            pipeline.start_auto_flush();
        }

        Ok(pipeline)
    }

    fn start_auto_flush(self: &Arc<Self>) {
        let pipeline = Arc::clone(self);
        let stop = self.auto_flush_stop.clone();
        let interval = self.config.flush_interval;

        let handle = tokio::spawn(async move {
            info!("[pipeline] auto-flush timer started ({interval:?} interval)");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        pipeline.flush().await;
                    }
                    _ = wait_for_stop(&stop) => {
                        info!("[pipeline] auto-flush timer stopped");
                        break;
                    }
                }
            }
        });

        *self.auto_flush_handle.lock() = Some(handle);
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    /// Enqueues an event for later delivery.
    ///
    /// Merges the context-provider's ambient map into the event's metadata
    /// (the event's own keys win on conflict), redacts PII when configured,
    /// and persists. If the queue reaches `max_queue_soft` after insert, an
    /// immediate flush is spawned in the background.
    ///
    /// Returns `Err(AnalyticsDisabled)` if the pipeline has been disabled via
    /// [`Pipeline::set_enabled`]; this and `NotInitialized`/`InvalidState`
    /// are the only errors `track` surfaces — all other internal failures
    /// (persistence, overflow) are swallowed and reported via observers.
    pub fn track(&self, mut event: Event) -> PipelineResult<()> {
        self.require_initialized()?;

        let mut state = self.state.lock();
        if !state.enabled {
            return Err(PipelineError::AnalyticsDisabled);
        }

        if event.user_id.is_none() {
            event.user_id = state.current_user_id.clone();
        }
        if event.session_id.is_none() {
            event.session_id = state.current_session_id.clone();
        }

        let mut merged = self.context_provider.context();
        merged.extend(event.metadata.drain());
        event.metadata = merged;

        if self.config.redact_pii {
            event.metadata = redactor::sanitize_map(&event.metadata);
        }

        state.queue.enqueue(event);
        let persist_result = state.queue.persist();
        let should_flush = state.queue.len() >= self.config.max_queue_soft;
        drop(state);

        if let Err(e) = persist_result {
            warn!("[pipeline] failed to persist queue after track: {e}");
        }
        if should_flush {
            self.spawn_immediate_flush();
        }
        Ok(())
    }

    fn spawn_immediate_flush(&self) {
        let weak = self.self_handle.lock().clone();
        tokio::spawn(async move {
            if let Some(pipeline) = weak.upgrade() {
                debug!("[pipeline] max_queue_soft reached, triggering immediate flush");
                pipeline.flush().await;
            }
        });
    }

    pub fn set_user(&self, user_id: impl Into<String>) {
        self.state.lock().current_user_id = Some(user_id.into());
    }

    pub fn set_session(&self, session_id: impl Into<String>) {
        self.state.lock().current_session_id = Some(session_id.into());
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().queue.stats()
    }

    /// Reports the current breaker state for this pipeline's endpoint —
    /// a read-only introspection point, not part of the delivery path.
    pub fn circuit_breaker_state(&self) -> BreakerState {
        self.breakers.for_endpoint(&self.transport.endpoint_host()).state()
    }

    pub fn clear(&self) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.queue.clear();
        state.queue.persist()
    }

    /// Attempts to deliver queued events in batches. Flush never throws:
    /// offline, a disabled pipeline, an open circuit, or a transport
    /// failure all simply end the flush early with outcomes recorded via
    /// observers and the circuit breaker, rather than propagated to the
    /// caller. Stops at the first failed batch, leaving the remainder
    /// queued for the next attempt.
    ///
    /// Returns the number of events successfully delivered this call.
    pub async fn flush(&self) -> usize {
        if self.require_initialized().is_err() {
            return 0;
        }

        let _guard = self.flush_lock.lock().await;

        if !self.state.lock().enabled {
            return 0;
        }
        if !self.network_status.is_online() {
            debug!("[pipeline] offline, skipping flush");
            return 0;
        }

        let endpoint = self.transport.endpoint_host();
        let breaker = self.breakers.for_endpoint(&endpoint);
        if !breaker.allow() {
            debug!("[pipeline] circuit open for {endpoint}, skipping flush");
            return 0;
        }

        {
            let mut state = self.state.lock();
            state.queue.sweep_expired();
        }

        let mut delivered_total = 0usize;
        loop {
            let batch = {
                let state = self.state.lock();
                state.queue.take_batch(self.config.batch_size)
            };
            if batch.is_empty() {
                break;
            }

            let ids: Vec<String> = batch.iter().map(|q| q.event.id.clone()).collect();
            let events: Vec<Event> = batch.iter().map(|q| q.event.clone()).collect();

            match self.transport.send(&self.config.project_id, &events).await {
                Ok(()) => {
                    breaker.record_success();
                    let mut state = self.state.lock();
                    state.queue.commit_outcome(&ids, true, self.config.max_retries);
                    state.queue.persist().ok();
                    delivered_total += ids.len();
                }
                Err(e) => {
                    breaker.record_failure();
                    self.observers.notify_events_failed(&events, error_kind(&e));
                    let mut state = self.state.lock();
                    state.queue.commit_outcome(&ids, false, self.config.max_retries);
                    state.queue.persist().ok();
                    warn!("[pipeline] flush batch failed: {e}");
                    break;
                }
            }
        }

        delivered_total
    }

    fn require_initialized(&self) -> PipelineResult<()> {
        match *self.lifecycle.lock() {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Uninitialized => Err(PipelineError::InvalidState("pipeline not initialized".into())),
            LifecycleState::Shutdown => Err(PipelineError::InvalidState("pipeline has been shut down".into())),
        }
    }

    /// Stops the auto-flush timer and marks the pipeline shut down. Further
    /// calls to `track`/`flush` return `PipelineError::InvalidState`.
    pub async fn shutdown(&self) {
        self.auto_flush_stop.store(true, Ordering::SeqCst);
        let handle = self.auto_flush_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.lifecycle.lock() = LifecycleState::Shutdown;
    }
}

/// Maps an error into the coarse `error_kind` string reported to observers
/// via `events_failed` (see §6.3).
fn error_kind(e: &PipelineError) -> &'static str {
    match e {
        PipelineError::Network(_) => "network",
        PipelineError::ServerRejected { .. } => "server",
        PipelineError::CircuitOpen(_) => "circuit_open",
        _ => "other",
    }
}

async fn wait_for_stop(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
