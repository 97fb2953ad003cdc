// Consuming work from a queue bridge, by polling or by callback.
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use trestle_codec::{Serializer, Value};
use trestle_common::ids::EndpointId;
use trestle_common::DEFAULT_QUEUE;
use trestle_wire::{io as wire_io, queue, FLAG_BULK};

use crate::listener::{CallbackId, DeliveryMode, ListenerRegistry, QueueCallback};
use crate::{connect, ClientConfig, Error, Result};

/// Consumer endpoint for a queue bridge.
///
/// Operates in one of two modes. Poll mode (`get`/`get_nowait`) pulls bulks
/// over this getter's own connection and hands messages out one at a time
/// from a local buffer. Callback mode (`subscribe`) routes delivery through
/// a shared [`ListenerRegistry`]. A getter with an active subscription
/// rejects poll calls, and a second `subscribe` on the same getter is
/// [`Error::AlreadySubscribed`].
pub struct Getter {
    id: EndpointId,
    url: String,
    stream: TcpStream,
    serializer: Arc<Serializer>,
    config: ClientConfig,
    buffered: HashMap<String, VecDeque<Value>>,
    subscription: Option<CallbackId>,
}

impl Getter {
    pub async fn connect(url: &str, serializer: Arc<Serializer>) -> Result<Self> {
        Self::connect_with(url, serializer, ClientConfig::default()).await
    }

    pub async fn connect_with(
        url: &str,
        serializer: Arc<Serializer>,
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = connect(url).await?;
        let id = EndpointId::new();
        tracing::debug!(endpoint = %id, %url, "getter connected");
        Ok(Self {
            id,
            url: url.to_string(),
            stream,
            serializer,
            config,
            buffered: HashMap::new(),
            subscription: None,
        })
    }

    /// Identifier correlating this endpoint's log lines.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Take the next message from `qname` (default queue when `None`),
    /// waiting as long as it takes.
    pub async fn get(&mut self, qname: Option<&str>) -> Result<Value> {
        self.ensure_polling()?;
        let qname = qname.unwrap_or(DEFAULT_QUEUE).to_string();
        loop {
            if let Some(value) = self.take_buffered(&qname) {
                return Ok(value);
            }
            if !self.refill(&qname).await? {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Like [`get`](Self::get) with a deadline; `None` on expiry. The
    /// deadline bounds waiting between round trips, never a round trip
    /// itself, so the stream stays in lock-step with the bridge.
    pub async fn get_nowait(
        &mut self,
        qname: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        self.ensure_polling()?;
        let qname = qname.unwrap_or(DEFAULT_QUEUE).to_string();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.take_buffered(&qname) {
                return Ok(Some(value));
            }
            if !self.refill(&qname).await? {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
            }
        }
    }

    /// Register `callback` for `qname` via the shared registry. Delivery
    /// happens on the registry's per-url listener task, not on this
    /// getter's connection.
    pub fn subscribe(
        &mut self,
        registry: &ListenerRegistry,
        qname: Option<&str>,
        callback: QueueCallback,
        mode: DeliveryMode,
    ) -> Result<CallbackId> {
        if self.subscription.is_some() {
            return Err(Error::AlreadySubscribed);
        }
        let qname = qname.unwrap_or(DEFAULT_QUEUE);
        let id = registry.subscribe(&self.url, qname, callback, mode)?;
        self.subscription = Some(id);
        Ok(id)
    }

    /// Drop this getter's subscription. Returns whether one was active.
    pub fn unsubscribe(&mut self, registry: &ListenerRegistry) -> bool {
        match self.subscription.take() {
            Some(id) => registry.unsubscribe(id),
            None => false,
        }
    }

    fn ensure_polling(&self) -> Result<()> {
        if self.subscription.is_some() {
            return Err(Error::InvalidState(
                "poll call on a getter with an active subscription",
            ));
        }
        Ok(())
    }

    fn take_buffered(&mut self, qname: &str) -> Option<Value> {
        let buffer = self.buffered.get_mut(qname)?;
        let value = buffer.pop_front();
        if buffer.is_empty() {
            self.buffered.remove(qname);
        }
        value
    }

    /// One pull round trip; buffers everything received. Returns whether
    /// any message arrived.
    async fn refill(&mut self, qname: &str) -> Result<bool> {
        let request = queue::encode_pull(qname)?;
        wire_io::write_frame(&mut self.stream, &request).await?;
        let mut scratch = BytesMut::new();
        let reply = wire_io::read_frame(&mut self.stream, &mut scratch, self.config.max_frame_bytes)
            .await?
            .ok_or(Error::ConnectionClosed)?;
        if reply.header.flags & FLAG_BULK == 0 {
            tracing::warn!(flags = reply.header.flags, "unexpected reply to pull");
            return Ok(false);
        }
        let (got_qname, payloads) = queue::decode_bulk(&reply)?;
        if payloads.is_empty() {
            return Ok(false);
        }
        let buffer = self.buffered.entry(got_qname).or_default();
        let mut added: u64 = 0;
        for payload in payloads {
            match self.serializer.decode(payload) {
                Ok(value) => {
                    buffer.push_back(value);
                    added += 1;
                }
                Err(err) => {
                    tracing::warn!(%qname, error = %err, "dropping undecodable message");
                }
            }
        }
        metrics::counter!("trestle_client_consumed_total").increment(added);
        Ok(added > 0)
    }
}
