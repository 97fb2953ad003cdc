// Message bridges: broker tasks that relay framed messages between an
// inbound (producer-facing) and an outbound (consumer-facing) socket.
//
// Two kinds exist: a fan-out pub/sub relay and a fair-queued work
// distributor. Both share the same lifecycle and socket plumbing; only the
// worker's buffering/serve step differs.
use async_trait::async_trait;
use std::time::Duration;

mod lifecycle;
mod net;
mod pubsub;
mod queue;

pub use pubsub::PubSubBridge;
pub use queue::QueueBridge;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no bindable address for {spec}")]
    Bind {
        spec: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bridge config: {0}")]
    Config(#[from] trestle_common::Error),
    #[error("bridge is {actual:?}; operation requires {expected:?}")]
    InvalidState {
        actual: BridgeState,
        expected: BridgeState,
    },
    #[error("worker failed to confirm startup")]
    StartAborted,
    #[error("wire: {0}")]
    Wire(#[from] trestle_wire::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Bridge lifecycle. `Stopped` is terminal; a stopped bridge is not
/// restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Things a supervisor can observe and shut down.
///
/// Replaces runtime attribute probing with a compile-time interface: anything
/// a process supervises must implement this.
#[async_trait]
pub trait Watchable: Send {
    fn name(&self) -> &str;
    fn is_alive(&self) -> bool;
    /// Request cooperative shutdown and wait up to `timeout` for the worker
    /// to observe it. Returns whether the worker exited in time; shutdown is
    /// best-effort and never force-kills.
    async fn stop(&mut self, timeout: Duration) -> bool;
}
