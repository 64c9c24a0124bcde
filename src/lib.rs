//! Durable, encrypted, batching client-side event pipeline for analytics
//! telemetry: events are redacted of obvious PII, persisted encrypted at
//! rest, and delivered in batches with retry, backoff, and per-endpoint
//! circuit breaking.

pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod keystore;
pub mod observer;
pub mod pipeline;
pub mod queue;
pub mod redactor;
pub mod transport;

pub use config::{Configuration, ConfigurationBuilder, OverflowStrategy};
pub use error::{PipelineError, PipelineResult};
pub use event::{AlwaysOnline, ContextProvider, Event, NetworkStatus, NoopContextProvider};
pub use observer::Observer;
pub use pipeline::{Pipeline, PipelineDeps};
pub use queue::{QueueStats, QueuedEvent};
