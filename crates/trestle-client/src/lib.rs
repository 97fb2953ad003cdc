// Endpoint library for talking to trestle bridges.
//
// Four roles map onto the two bridge kinds: `Publisher`/`Subscriber` speak to
// a fan-out bridge, `Putter`/`Getter` to a queue bridge. Each endpoint owns
// one connection; listener tasks for callback delivery are explicit
// single-reader loops fed through bounded registration, never concurrent
// readers on one stream.
use std::time::Duration;

mod getter;
mod listener;
mod publisher;
mod putter;
mod subscriber;

pub use getter::Getter;
pub use listener::{CallbackId, DeliveryMode, ListenerRegistry, QueueCallback};
pub use publisher::Publisher;
pub use putter::Putter;
pub use subscriber::{Subscriber, TopicCallback};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("bridge refused request: {0}")]
    Refused(String),
    #[error("connection closed by bridge")]
    ConnectionClosed,
    #[error("{0}")]
    InvalidState(&'static str),
    #[error("endpoint already has an active subscription")]
    AlreadySubscribed,
    #[error("wire: {0}")]
    Wire(#[from] trestle_wire::Error),
    #[error("codec: {0}")]
    Codec(#[from] trestle_codec::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection tuning shared by all endpoint kinds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest frame an endpoint will accept from a bridge.
    pub max_frame_bytes: usize,
    /// How long pull-driven loops sleep after an empty cycle.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: trestle_common::LimitsConfig::default().max_frame_bytes,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Extract `host:port` from a `tcp://host:port` endpoint url. A bare
/// `host:port` is accepted too.
fn endpoint_addr(url: &str) -> Result<String> {
    let rest = match url.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(Error::InvalidUrl(url.to_string())),
        None => url,
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    Ok(rest.to_string())
}

async fn connect(url: &str) -> Result<tokio::net::TcpStream> {
    let addr = endpoint_addr(url)?;
    tokio::net::TcpStream::connect(&addr)
        .await
        .map_err(|source| Error::Connect {
            url: url.to_string(),
            source,
        })
}
