//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on messages held before a session starts
pub const DEFAULT_EARLY_MESSAGE_LIMIT: usize = 4096;

/// Tunables for a [`PartyEngine`](crate::engine::PartyEngine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of messages buffered while configured but idle.
    ///
    /// Peers that start a session slightly earlier than this party send their
    /// first round before the local session exists; those messages are held
    /// and replayed into the next session. Anything past the cap is dropped.
    pub early_message_limit: usize,

    /// Upper bound on a single session, applied on top of the caller's
    /// cancellation token
    #[serde(with = "optional_secs")]
    pub session_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            early_message_limit: DEFAULT_EARLY_MESSAGE_LIMIT,
            session_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Set the early message cap
    pub fn with_early_message_limit(mut self, limit: usize) -> Self {
        self.early_message_limit = limit;
        self
    }

    /// Set the per-session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        secs.map(|s| {
            Duration::try_from_secs_f64(s).map_err(|e| serde::de::Error::custom(e.to_string()))
        })
        .transpose()
    }
}
