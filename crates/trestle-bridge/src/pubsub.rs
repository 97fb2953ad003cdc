// Fan-out bridge: every publish received on the inbound socket is relayed to
// every consumer currently subscribed to its topic.
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use trestle_common::BridgeConfig;
use trestle_wire::{Frame, Message, FLAG_PUBLISH};

use crate::lifecycle::BridgeCore;
use crate::net::{ConnId, OutboundEvent};
use crate::{BridgeState, Result, Watchable};

/// Topic-based fan-out relay.
///
/// Subscriptions live only as long as the consumer connection that made
/// them. Messages published while a topic has no subscribers are dropped;
/// there is no retention and no replay for late subscribers.
///
/// ```no_run
/// use std::time::Duration;
/// use trestle_bridge::{PubSubBridge, Watchable};
/// use trestle_common::BridgeConfig;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut bridge = PubSubBridge::new(BridgeConfig::new("events"));
/// bridge.start().await?;
/// println!("publish to {}", bridge.inbound_addr().unwrap_or("?"));
/// bridge.stop(Duration::from_secs(1)).await;
/// # Ok(())
/// # }
/// ```
pub struct PubSubBridge {
    config: BridgeConfig,
    core: BridgeCore,
    name: String,
}

impl PubSubBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let core = BridgeCore::new(config.channel.clone());
        let name = format!("pubsub-bridge-{}", config.channel);
        Self { config, core, name }
    }

    pub fn state(&self) -> BridgeState {
        self.core.state()
    }

    /// Producer-facing `host:port`, available once initialized.
    pub fn inbound_addr(&self) -> Option<&str> {
        self.core.inbound_addr()
    }

    /// Consumer-facing `host:port`, available once initialized.
    pub fn outbound_addr(&self) -> Option<&str> {
        self.core.outbound_addr()
    }

    /// Bind both sockets without starting the worker.
    pub async fn initialize(&mut self) -> Result<()> {
        self.core
            .initialize(&self.config.inbound_bind, &self.config.outbound_bind)
            .await
    }

    /// Start relaying. Initializes first if the bridge is freshly created;
    /// returns once the worker confirms it is polling.
    pub async fn start(&mut self) -> Result<()> {
        if self.core.state() == BridgeState::Created {
            self.initialize().await?;
        }
        self.core
            .start_with(self.config.limits.max_frame_bytes, |inbound, outbound, cancel, ready| {
                tokio::spawn(run_worker(inbound, outbound, cancel, ready))
            })
            .await
    }
}

#[async_trait]
impl Watchable for PubSubBridge {
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

struct FanOut {
    subs: HashMap<String, HashSet<ConnId>>,
    conns: HashMap<ConnId, mpsc::Sender<Bytes>>,
}

impl FanOut {
    fn new() -> Self {
        Self {
            subs: HashMap::new(),
            conns: HashMap::new(),
        }
    }

    fn publish(&mut self, frame: &Frame) {
        let (topic, _payload) = match trestle_wire::pubsub::decode_publish(frame) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed publish");
                counter!("trestle_pubsub_malformed_total").increment(1);
                return;
            }
        };
        counter!("trestle_pubsub_published_total").increment(1);
        let Some(subscribers) = self.subs.get(&topic) else {
            return;
        };
        // Encode once, share the bytes across every subscriber.
        let encoded = frame.encode();
        for conn in subscribers {
            let Some(writer) = self.conns.get(conn) else {
                continue;
            };
            match writer.try_send(encoded.clone()) {
                Ok(()) => {
                    counter!("trestle_pubsub_delivered_total").increment(1);
                }
                Err(_) => {
                    // Slow consumer: drop the new message, keep the stream.
                    tracing::debug!(conn, %topic, "subscriber queue full, dropping message");
                    counter!("trestle_pubsub_dropped_total").increment(1);
                }
            }
        }
    }

    fn handle_control(&mut self, conn: ConnId, frame: Frame) {
        let reply = match Message::decode(frame) {
            Ok(Message::Subscribe { topic }) => {
                tracing::debug!(conn, %topic, "subscribe");
                self.subs.entry(topic).or_default().insert(conn);
                Message::Ok
            }
            Ok(Message::Unsubscribe { topic }) => {
                tracing::debug!(conn, %topic, "unsubscribe");
                if let Some(subscribers) = self.subs.get_mut(&topic) {
                    subscribers.remove(&conn);
                    if subscribers.is_empty() {
                        self.subs.remove(&topic);
                    }
                }
                Message::Ok
            }
            Ok(other) => Message::Error {
                message: format!("unexpected message: {other:?}"),
            },
            Err(err) => Message::Error {
                message: err.to_string(),
            },
        };
        self.reply(conn, reply);
    }

    fn reply(&self, conn: ConnId, message: Message) {
        let Some(writer) = self.conns.get(&conn) else {
            return;
        };
        match message.encode() {
            Ok(frame) => {
                let _ = writer.try_send(frame.encode());
            }
            Err(err) => tracing::warn!(conn, error = %err, "failed to encode reply"),
        }
    }

    fn disconnect(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.subs.retain(|_, subscribers| {
            subscribers.remove(&conn);
            !subscribers.is_empty()
        });
    }
}

async fn run_worker(
    mut inbound: mpsc::Receiver<Frame>,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let mut state = FanOut::new();
    let _ = ready.send(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                if frame.header.flags & FLAG_PUBLISH != 0 {
                    state.publish(&frame);
                } else {
                    tracing::warn!(flags = frame.header.flags, "ignoring non-publish inbound frame");
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else { break };
                match event {
                    OutboundEvent::Connected { conn, writer } => {
                        state.conns.insert(conn, writer);
                    }
                    OutboundEvent::Frame { conn, frame } => {
                        if frame.header.flags == 0 {
                            state.handle_control(conn, frame);
                        } else {
                            state.reply(conn, Message::Error {
                                message: "pubsub consumers may only send control frames".to_string(),
                            });
                        }
                    }
                    OutboundEvent::Disconnected { conn } => {
                        state.disconnect(conn);
                    }
                }
            }
        }
    }
    tracing::debug!("pubsub worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use trestle_wire::io as wire_io;

    const MAX: usize = 16 * 1024 * 1024;

    async fn started_bridge() -> PubSubBridge {
        let mut bridge = PubSubBridge::new(BridgeConfig::new("test"));
        bridge.start().await.expect("start");
        bridge
    }

    async fn subscribe(stream: &mut TcpStream, scratch: &mut BytesMut, topic: &str) {
        let frame = Message::Subscribe {
            topic: topic.to_string(),
        }
        .encode()
        .expect("encode");
        wire_io::write_frame(stream, &frame).await.expect("write");
        let reply = wire_io::read_frame(stream, scratch, MAX)
            .await
            .expect("read")
            .expect("reply");
        assert_eq!(Message::decode(reply).expect("decode"), Message::Ok);
    }

    async fn publish(addr: &str, topic: &str, payload: &[u8]) {
        let mut producer = TcpStream::connect(addr).await.expect("connect");
        let frame = trestle_wire::pubsub::encode_publish(topic, &Bytes::copy_from_slice(payload))
            .expect("encode");
        wire_io::write_frame(&mut producer, &frame)
            .await
            .expect("write");
    }

    async fn recv_publish(stream: &mut TcpStream, scratch: &mut BytesMut) -> (String, Bytes) {
        let frame = timeout(
            Duration::from_secs(2),
            wire_io::read_frame(stream, scratch, MAX),
        )
        .await
        .expect("timely")
        .expect("read")
        .expect("frame");
        trestle_wire::pubsub::decode_publish(&frame).expect("decode")
    }

    #[tokio::test]
    async fn fan_out_reaches_only_matching_subscribers() {
        let mut bridge = started_bridge().await;
        let outbound = bridge.outbound_addr().expect("addr").to_string();
        let inbound = bridge.inbound_addr().expect("addr").to_string();

        let mut sub_a = TcpStream::connect(&outbound).await.expect("connect");
        let mut sub_b = TcpStream::connect(&outbound).await.expect("connect");
        let mut scratch_a = BytesMut::new();
        let mut scratch_b = BytesMut::new();
        subscribe(&mut sub_a, &mut scratch_a, "alpha").await;
        subscribe(&mut sub_b, &mut scratch_b, "beta").await;

        publish(&inbound, "alpha", b"for alpha").await;

        let (topic, payload) = recv_publish(&mut sub_a, &mut scratch_a).await;
        assert_eq!(topic, "alpha");
        assert_eq!(payload, Bytes::from_static(b"for alpha"));

        // The beta subscriber sees nothing.
        let quiet = timeout(
            Duration::from_millis(200),
            wire_io::read_frame(&mut sub_b, &mut scratch_b, MAX),
        )
        .await;
        assert!(quiet.is_err());

        bridge.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn both_subscribers_of_one_topic_receive_the_message() {
        let mut bridge = started_bridge().await;
        let outbound = bridge.outbound_addr().expect("addr").to_string();
        let inbound = bridge.inbound_addr().expect("addr").to_string();

        let mut sub_a = TcpStream::connect(&outbound).await.expect("connect");
        let mut sub_b = TcpStream::connect(&outbound).await.expect("connect");
        let mut scratch_a = BytesMut::new();
        let mut scratch_b = BytesMut::new();
        subscribe(&mut sub_a, &mut scratch_a, "shared").await;
        subscribe(&mut sub_b, &mut scratch_b, "shared").await;

        publish(&inbound, "shared", b"hello").await;

        let (_, payload_a) = recv_publish(&mut sub_a, &mut scratch_a).await;
        let (_, payload_b) = recv_publish(&mut sub_b, &mut scratch_b).await;
        assert_eq!(payload_a, Bytes::from_static(b"hello"));
        assert_eq!(payload_b, Bytes::from_static(b"hello"));

        bridge.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_replay() {
        let mut bridge = started_bridge().await;
        let outbound = bridge.outbound_addr().expect("addr").to_string();
        let inbound = bridge.inbound_addr().expect("addr").to_string();

        // Published before anyone subscribes: dropped, not retained.
        publish(&inbound, "news", b"early").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sub = TcpStream::connect(&outbound).await.expect("connect");
        let mut scratch = BytesMut::new();
        subscribe(&mut sub, &mut scratch, "news").await;

        publish(&inbound, "news", b"late").await;
        let (_, payload) = recv_publish(&mut sub, &mut scratch).await;
        assert_eq!(payload, Bytes::from_static(b"late"));

        bridge.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut bridge = started_bridge().await;
        let outbound = bridge.outbound_addr().expect("addr").to_string();
        let inbound = bridge.inbound_addr().expect("addr").to_string();

        let mut sub = TcpStream::connect(&outbound).await.expect("connect");
        let mut scratch = BytesMut::new();
        subscribe(&mut sub, &mut scratch, "ticks").await;

        let frame = Message::Unsubscribe {
            topic: "ticks".to_string(),
        }
        .encode()
        .expect("encode");
        wire_io::write_frame(&mut sub, &frame).await.expect("write");
        let reply = wire_io::read_frame(&mut sub, &mut scratch, MAX)
            .await
            .expect("read")
            .expect("reply");
        assert_eq!(Message::decode(reply).expect("decode"), Message::Ok);

        publish(&inbound, "ticks", b"gone").await;
        let quiet = timeout(
            Duration::from_millis(200),
            wire_io::read_frame(&mut sub, &mut scratch, MAX),
        )
        .await;
        assert!(quiet.is_err());

        bridge.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_is_observed_within_the_deadline() {
        let mut bridge = started_bridge().await;
        assert!(bridge.is_alive());
        assert!(bridge.stop(Duration::from_secs(1)).await);
        assert!(!bridge.is_alive());
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }
}
