// Work-distribution bridge: pushed messages are buffered per queue name and
// handed out in FIFO order, each message to exactly one puller.
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use trestle_common::BridgeConfig;
use trestle_wire::{queue as wire_queue, Frame, Message, FLAG_PULL, FLAG_PUSH};

use crate::lifecycle::BridgeCore;
use crate::net::{ConnId, OutboundEvent};
use crate::{BridgeState, Result, Watchable};

/// Fair-queued distributor.
///
/// Consumers drive distribution themselves by pulling: each pull drains up
/// to `bulk_size` messages from the named queue and answers immediately,
/// with an empty bulk when the queue has nothing. A message handed out is
/// gone from the buffer; no other consumer sees it.
pub struct QueueBridge {
    config: BridgeConfig,
    core: BridgeCore,
    name: String,
}

impl QueueBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let core = BridgeCore::new(config.channel.clone());
        let name = format!("queue-bridge-{}", config.channel);
        Self { config, core, name }
    }

    pub fn state(&self) -> BridgeState {
        self.core.state()
    }

    pub fn inbound_addr(&self) -> Option<&str> {
        self.core.inbound_addr()
    }

    pub fn outbound_addr(&self) -> Option<&str> {
        self.core.outbound_addr()
    }

    /// Bind both sockets without starting the worker.
    pub async fn initialize(&mut self) -> Result<()> {
        self.core
            .initialize(&self.config.inbound_bind, &self.config.outbound_bind)
            .await
    }

    /// Start serving. Initializes first if the bridge is freshly created;
    /// returns once the worker confirms it is polling.
    pub async fn start(&mut self) -> Result<()> {
        if self.core.state() == BridgeState::Created {
            self.initialize().await?;
        }
        let bulk_size = self.config.limits.bulk_size;
        self.core
            .start_with(self.config.limits.max_frame_bytes, move |inbound, outbound, cancel, ready| {
                tokio::spawn(run_worker(inbound, outbound, cancel, ready, bulk_size))
            })
            .await
    }
}

#[async_trait]
impl Watchable for QueueBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    async fn stop(&mut self, timeout: Duration) -> bool {
        self.core.stop(timeout).await
    }
}

struct Queues {
    buffers: HashMap<String, VecDeque<Bytes>>,
    conns: HashMap<ConnId, mpsc::Sender<Bytes>>,
    bulk_size: usize,
}

impl Queues {
    fn new(bulk_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            conns: HashMap::new(),
            bulk_size,
        }
    }

    fn push(&mut self, frame: &Frame) {
        let (qname, payloads) = match wire_queue::decode_push(frame) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed push");
                counter!("trestle_queue_malformed_total").increment(1);
                return;
            }
        };
        counter!("trestle_queue_pushed_total").increment(payloads.len() as u64);
        self.buffers.entry(qname).or_default().extend(payloads);
    }

    /// Answer a pull with up to `bulk_size` messages. An empty queue gets an
    /// empty bulk reply straight away; the consumer decides when to retry.
    fn serve_pull(&mut self, conn: ConnId, frame: &Frame) {
        let qname = match wire_queue::decode_pull(frame) {
            Ok(qname) => qname,
            Err(err) => {
                tracing::warn!(conn, error = %err, "dropping malformed pull");
                counter!("trestle_queue_malformed_total").increment(1);
                return;
            }
        };
        let mut batch = Vec::new();
        if let Some(buffer) = self.buffers.get_mut(&qname) {
            let take = buffer.len().min(self.bulk_size);
            batch.extend(buffer.drain(..take));
            if buffer.is_empty() {
                self.buffers.remove(&qname);
            }
        }
        counter!("trestle_queue_served_total").increment(batch.len() as u64);

        let Some(writer) = self.conns.get(&conn) else {
            // Consumer vanished between pull and reply; messages already
            // drained are lost, matching at-most-once delivery.
            return;
        };
        match wire_queue::encode_bulk(&qname, &batch) {
            Ok(reply) => {
                if writer.try_send(reply.encode()).is_err() {
                    tracing::debug!(conn, %qname, "consumer queue full, dropping bulk reply");
                }
            }
            Err(err) => tracing::warn!(conn, error = %err, "failed to encode bulk reply"),
        }
    }

    fn reject(&self, conn: ConnId, why: &str) {
        let Some(writer) = self.conns.get(&conn) else {
            return;
        };
        let message = Message::Error {
            message: why.to_string(),
        };
        if let Ok(frame) = message.encode() {
            let _ = writer.try_send(frame.encode());
        }
    }
}

async fn run_worker(
    mut inbound: mpsc::Receiver<Frame>,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
    bulk_size: usize,
) {
    let mut state = Queues::new(bulk_size);
    let _ = ready.send(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                if frame.header.flags & FLAG_PUSH != 0 {
                    state.push(&frame);
                } else {
                    tracing::warn!(flags = frame.header.flags, "ignoring non-push inbound frame");
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else { break };
                match event {
                    OutboundEvent::Connected { conn, writer } => {
                        state.conns.insert(conn, writer);
                    }
                    OutboundEvent::Frame { conn, frame } => {
                        if frame.header.flags & FLAG_PULL != 0 {
                            state.serve_pull(conn, &frame);
                        } else {
                            state.reject(conn, "queue consumers may only pull");
                        }
                    }
                    OutboundEvent::Disconnected { conn } => {
                        state.conns.remove(&conn);
                    }
                }
            }
        }
    }
    tracing::debug!("queue worker exited");
}
