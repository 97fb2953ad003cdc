// Shared configuration types and small helpers used across crates.
use serde::{Deserialize, Serialize};

pub mod bind;
pub mod config;

pub use bind::{BindSpec, PortSpec};
pub use config::BridgeConfig;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid bind spec: {0}")]
    InvalidBindSpec(String),
    #[error("unsupported transport scheme: {0}")]
    UnsupportedScheme(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs to avoid mixing instance kinds at compile time.
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Random v4 uuid; collisions are not a practical concern.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        };
    }

    id_type!(BridgeId);
    id_type!(EndpointId);
}

/// Normalize a pubsub topic for the wire: spaces become underscores.
///
/// ```
/// assert_eq!(trestle_common::normalize_topic("sensor data in"), "sensor_data_in");
/// ```
pub fn normalize_topic(topic: &str) -> String {
    topic.replace(' ', "_")
}

/// Default queue name used when a putter or getter does not name one.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_frame_bytes: usize,
    pub bulk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        // Sized for single-host development, not production fan-in.
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            bulk_size: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_normalization_replaces_spaces() {
        assert_eq!(normalize_topic("a b c"), "a_b_c");
        assert_eq!(normalize_topic("already_clean"), "already_clean");
    }

    #[test]
    fn bridge_id_is_unique_per_call() {
        assert_ne!(ids::BridgeId::new(), ids::BridgeId::new());
    }

    #[test]
    fn limits_defaults_are_positive() {
        let limits = LimitsConfig::default();
        assert!(limits.max_frame_bytes > 0);
        assert_eq!(limits.bulk_size, 1024);
    }
}
