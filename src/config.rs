//! Pipeline configuration: DSN parsing, tunables, and environment overrides.

use crate::error::{PipelineError, PipelineResult};
use std::time::Duration;
use url::Url;

/// Strategy applied when the durable queue is full and a new event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    DropOldest,
    DropNewest,
    DropAll,
}

impl Default for OverflowStrategy {
    fn default() -> Self {
        OverflowStrategy::DropOldest
    }
}

/// Fully resolved pipeline configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub endpoint_url: Url,
    pub public_id: String,
    pub project_id: String,

    /// Triggers an immediate auto-flush on insert once reached.
    pub max_queue_soft: usize,
    /// Triggers the overflow policy on insert once reached.
    pub max_queue_hard: usize,
    pub overflow_strategy: OverflowStrategy,
    pub event_ttl: Duration,

    pub batch_size: usize,
    pub flush_interval: Duration,
    pub auto_flush: bool,

    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub half_open_max_attempts: u32,

    pub request_timeout: Duration,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,

    pub certificate_pins: Vec<String>,
    pub allow_self_signed: bool,
    pub validate_chain: bool,

    pub redact_pii: bool,
    pub enabled: bool,
    pub debug_logging: bool,
}

impl Configuration {
    /// Start building a configuration from a DSN of the form
    /// `https://{public_id}@{host}{path}/{project_id}`.
    pub fn builder(dsn: &str) -> PipelineResult<ConfigurationBuilder> {
        let (endpoint_url, public_id, project_id) = parse_dsn(dsn)?;
        Ok(ConfigurationBuilder {
            endpoint_url,
            public_id,
            project_id,
            max_queue_soft: 500,
            max_queue_hard: 10_000,
            overflow_strategy: OverflowStrategy::default(),
            event_ttl: Duration::from_secs(604_800),
            batch_size: 50,
            flush_interval: Duration::from_secs(30),
            auto_flush: true,
            max_retries: 5,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
            half_open_max_attempts: 3,
            request_timeout: Duration::from_secs(60),
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            certificate_pins: Vec::new(),
            allow_self_signed: false,
            validate_chain: true,
            redact_pii: true,
            enabled: true,
            debug_logging: false,
        })
    }

    /// Build a configuration from environment variables, primarily intended
    /// for server-driven or CI usage where a DSN is injected out-of-band.
    ///
    /// Reads `ANALYTICS_DSN` (required) and optionally `ANALYTICS_BATCH_SIZE`,
    /// `ANALYTICS_FLUSH_INTERVAL_SECS`, `ANALYTICS_DISABLED`, `ANALYTICS_DEBUG`.
    pub fn from_env() -> PipelineResult<Self> {
        let dsn = std::env::var("ANALYTICS_DSN")
            .map_err(|_| PipelineError::config("ANALYTICS_DSN is not set"))?;
        let mut builder = Self::builder(&dsn)?;

        if let Ok(v) = std::env::var("ANALYTICS_BATCH_SIZE") {
            let parsed: usize = v
                .parse()
                .map_err(|_| PipelineError::config("ANALYTICS_BATCH_SIZE must be a positive integer"))?;
            builder = builder.batch_size(parsed);
        }
        if let Ok(v) = std::env::var("ANALYTICS_FLUSH_INTERVAL_SECS") {
            let parsed: u64 = v
                .parse()
                .map_err(|_| PipelineError::config("ANALYTICS_FLUSH_INTERVAL_SECS must be a positive integer"))?;
            builder = builder.flush_interval(Duration::from_secs(parsed));
        }
        if let Ok(v) = std::env::var("ANALYTICS_DISABLED") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                builder = builder.enabled(false);
            }
        }
        if let Ok(v) = std::env::var("ANALYTICS_DEBUG") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                builder = builder.debug_logging(true);
            }
        }

        Ok(builder.build())
    }
}

/// Parses `https://{public_id}@{host}{path}/{project_id}` into
/// (endpoint_url, public_id, project_id).
fn parse_dsn(dsn: &str) -> PipelineResult<(Url, String, String)> {
    let url = Url::parse(dsn).map_err(|e| PipelineError::InvalidDsn(e.to_string()))?;

    let public_id = url.username();
    if public_id.is_empty() {
        return Err(PipelineError::InvalidDsn("DSN is missing a public id".into()));
    }
    let public_id = public_id.to_string();

    let path = url.path().trim_matches('/');
    let project_id = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::InvalidDsn("DSN is missing a project id".into()))?
        .to_string();

    let ingest_path = path
        .rsplitn(2, '/')
        .nth(1)
        .map(|p| format!("/{}", p))
        .unwrap_or_default();

    let mut endpoint_url = url.clone();
    endpoint_url.set_username("").ok();
    endpoint_url.set_password(None).ok();
    endpoint_url.set_path(&ingest_path);
    endpoint_url.set_query(None);

    Ok((endpoint_url, public_id, project_id))
}

/// Builder for [`Configuration`], mirroring the sensible-defaults-then-override
/// pattern used throughout the pipeline.
pub struct ConfigurationBuilder {
    endpoint_url: Url,
    public_id: String,
    project_id: String,
    max_queue_soft: usize,
    max_queue_hard: usize,
    overflow_strategy: OverflowStrategy,
    event_ttl: Duration,
    batch_size: usize,
    flush_interval: Duration,
    auto_flush: bool,
    max_retries: u32,
    circuit_breaker_threshold: u32,
    circuit_breaker_cooldown: Duration,
    half_open_max_attempts: u32,
    request_timeout: Duration,
    compression_enabled: bool,
    compression_threshold_bytes: usize,
    certificate_pins: Vec<String>,
    allow_self_signed: bool,
    validate_chain: bool,
    redact_pii: bool,
    enabled: bool,
    debug_logging: bool,
}

impl ConfigurationBuilder {
    pub fn max_queue_soft(mut self, v: usize) -> Self {
        self.max_queue_soft = v;
        self
    }

    pub fn max_queue_hard(mut self, v: usize) -> Self {
        self.max_queue_hard = v;
        self
    }

    pub fn overflow_strategy(mut self, v: OverflowStrategy) -> Self {
        self.overflow_strategy = v;
        self
    }

    pub fn event_ttl(mut self, v: Duration) -> Self {
        self.event_ttl = v;
        self
    }

    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    pub fn flush_interval(mut self, v: Duration) -> Self {
        self.flush_interval = v;
        self
    }

    pub fn auto_flush(mut self, v: bool) -> Self {
        self.auto_flush = v;
        self
    }

    pub fn max_retries(mut self, v: u32) -> Self {
        self.max_retries = v;
        self
    }

    pub fn circuit_breaker_threshold(mut self, v: u32) -> Self {
        self.circuit_breaker_threshold = v;
        self
    }

    pub fn circuit_breaker_cooldown(mut self, v: Duration) -> Self {
        self.circuit_breaker_cooldown = v;
        self
    }

    pub fn half_open_max_attempts(mut self, v: u32) -> Self {
        self.half_open_max_attempts = v;
        self
    }

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn compression_enabled(mut self, v: bool) -> Self {
        self.compression_enabled = v;
        self
    }

    pub fn compression_threshold_bytes(mut self, v: usize) -> Self {
        self.compression_threshold_bytes = v;
        self
    }

    pub fn certificate_pins(mut self, pins: Vec<String>) -> Self {
        self.certificate_pins = pins;
        self
    }

    pub fn allow_self_signed(mut self, v: bool) -> Self {
        self.allow_self_signed = v;
        self
    }

    pub fn validate_chain(mut self, v: bool) -> Self {
        self.validate_chain = v;
        self
    }

    pub fn redact_pii(mut self, v: bool) -> Self {
        self.redact_pii = v;
        self
    }

    pub fn enabled(mut self, v: bool) -> Self {
        self.enabled = v;
        self
    }

    pub fn debug_logging(mut self, v: bool) -> Self {
        self.debug_logging = v;
        self
    }

    pub fn build(self) -> Configuration {
        Configuration {
            endpoint_url: self.endpoint_url,
            public_id: self.public_id,
            project_id: self.project_id,
            max_queue_soft: self.max_queue_soft,
            max_queue_hard: self.max_queue_hard,
            overflow_strategy: self.overflow_strategy,
            event_ttl: self.event_ttl,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            auto_flush: self.auto_flush,
            max_retries: self.max_retries,
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_cooldown: self.circuit_breaker_cooldown,
            half_open_max_attempts: self.half_open_max_attempts,
            request_timeout: self.request_timeout,
            compression_enabled: self.compression_enabled,
            compression_threshold_bytes: self.compression_threshold_bytes,
            certificate_pins: self.certificate_pins,
            allow_self_signed: self.allow_self_signed,
            validate_chain: self.validate_chain,
            redact_pii: self.redact_pii,
            enabled: self.enabled,
            debug_logging: self.debug_logging,
        }
    }
}
