// Fire-and-forget publishing to a fan-out bridge.
use std::sync::Arc;

use tokio::net::TcpStream;
use trestle_codec::{Serializer, Value};
use trestle_common::ids::EndpointId;
use trestle_common::normalize_topic;
use trestle_wire::{io as wire_io, pubsub};

use crate::{connect, Result};

/// Writes publish frames to a fan-out bridge's inbound socket.
///
/// Publishing is fire-and-forget: the call returns once the frame is on the
/// wire, with no delivery acknowledgement. A publish to a topic nobody
/// subscribed to is silently dropped by the bridge.
pub struct Publisher {
    id: EndpointId,
    url: String,
    stream: TcpStream,
    serializer: Arc<Serializer>,
}

impl Publisher {
    pub async fn connect(url: &str, serializer: Arc<Serializer>) -> Result<Self> {
        let stream = connect(url).await?;
        let id = EndpointId::new();
        tracing::debug!(endpoint = %id, %url, "publisher connected");
        Ok(Self {
            id,
            url: url.to_string(),
            stream,
            serializer,
        })
    }

    /// Identifier correlating this endpoint's log lines.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serialize `value` and publish it under `topic`. The topic is
    /// normalized first, so names with spaces are legal here.
    pub async fn put(&mut self, topic: &str, value: &Value) -> Result<()> {
        let topic = normalize_topic(topic);
        let payload = self.serializer.encode(value)?;
        let frame = pubsub::encode_publish(&topic, &payload)?;
        wire_io::write_frame(&mut self.stream, &frame).await?;
        metrics::counter!("trestle_client_published_total").increment(1);
        Ok(())
    }
}
