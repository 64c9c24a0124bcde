//! Wire data model: the `Event` a caller tracks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single telemetry event as tracked by a caller. This type is the exact
/// shape serialized onto the wire (see `transport`) — it carries no queue
/// bookkeeping (that lives on `queue::QueuedEvent`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            timestamp: Utc::now(),
            user_id: None,
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Approximate size in bytes of the serialized event, used for the
    /// compression-threshold decision and for bounding queue memory.
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Supplies ambient context merged into every tracked event's metadata
/// (caller-supplied keys win on conflict). Expected keys (none mandatory):
/// `device_model`, `device_type`, `system_version`, `app_version`,
/// `build_number`, `locale`, `timezone`, `device_id`, `screen_resolution`.
pub trait ContextProvider: Send + Sync {
    fn context(&self) -> HashMap<String, String>;
}

/// Default context provider that attaches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopContextProvider;

impl ContextProvider for NoopContextProvider {
    fn context(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Tells the pipeline whether the device currently has network connectivity.
/// Implementations on embedded platforms typically bridge to a native
/// reachability API; tests and default usage assume always-online.
pub trait NetworkStatus: Send + Sync {
    fn is_online(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}
