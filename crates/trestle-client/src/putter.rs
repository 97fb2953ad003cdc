// Producing work onto a queue bridge.
use bytes::Bytes;
use std::sync::Arc;

use tokio::net::TcpStream;
use trestle_codec::{Serializer, Value};
use trestle_common::ids::EndpointId;
use trestle_common::DEFAULT_QUEUE;
use trestle_wire::{io as wire_io, queue};

use crate::{connect, Result};

/// Writes push frames to a queue bridge's inbound socket.
///
/// All values given to one [`put`](Self::put) call travel in a single wire
/// unit and land in the queue back-to-back, so a producer's batch keeps its
/// internal order.
pub struct Putter {
    id: EndpointId,
    url: String,
    stream: TcpStream,
    serializer: Arc<Serializer>,
}

impl Putter {
    pub async fn connect(url: &str, serializer: Arc<Serializer>) -> Result<Self> {
        let stream = connect(url).await?;
        let id = EndpointId::new();
        tracing::debug!(endpoint = %id, %url, "putter connected");
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

    /// Push `values` onto the queue named `qname`, or the default queue when
    /// `None`.
    pub async fn put(&mut self, values: &[Value], qname: Option<&str>) -> Result<()> {
        let qname = qname.unwrap_or(DEFAULT_QUEUE);
        let payloads: Vec<Bytes> = values
            .iter()
            .map(|value| self.serializer.encode(value))
            .collect::<trestle_codec::Result<_>>()?;
        let frame = queue::encode_push(qname, &payloads)?;
        wire_io::write_frame(&mut self.stream, &frame).await?;
        metrics::counter!("trestle_client_pushed_total").increment(values.len() as u64);
        Ok(())
    }
}
