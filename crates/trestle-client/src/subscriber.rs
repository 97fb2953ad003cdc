// Topic subscription against a fan-out bridge, in pull or callback mode.
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trestle_codec::{Serializer, Value};
use trestle_common::ids::EndpointId;
use trestle_common::normalize_topic;
use trestle_wire::{io as wire_io, pubsub, Frame, Message, FLAG_PUBLISH};

use crate::{connect, ClientConfig, Error, Result};

/// Callback invoked with `(topic, value)` for each delivered publish.
/// Failures are logged and delivery continues; a callback cannot stop the
/// listener.
pub type TopicCallback = Arc<dyn Fn(&str, Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Pull,
    Callback,
}

/// Consumer endpoint for a fan-out bridge.
///
/// A subscriber receives nothing until it subscribes, and only messages
/// published after the subscription was acknowledged. It operates in one of
/// two modes, fixed by the first call made on it: pull (`subscribe` then
/// `get`/`get_nowait`) or callback (`subscribe_with`). Mixing the modes is
/// an [`Error::InvalidState`].
pub struct Subscriber {
    id: EndpointId,
    url: String,
    serializer: Arc<Serializer>,
    config: ClientConfig,
    reader: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    mode: Mode,
    // Publishes that arrived while waiting for a control reply.
    pending: VecDeque<Frame>,
    callbacks: Arc<Mutex<HashMap<String, TopicCallback>>>,
    listener: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Subscriber {
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
        tracing::debug!(endpoint = %id, %url, "subscriber connected");
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            id,
            url: url.to_string(),
            serializer,
            config,
            reader: Arc::new(tokio::sync::Mutex::new(read_half)),
            writer: write_half,
            mode: Mode::Idle,
            pending: VecDeque::new(),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Identifier correlating this endpoint's log lines.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register interest in `topic` for pull-mode consumption.
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if self.mode == Mode::Callback {
            return Err(Error::InvalidState(
                "pull-mode subscribe on a callback-mode subscriber",
            ));
        }
        let topic = normalize_topic(topic);
        self.send_control(Message::Subscribe { topic }).await?;
        self.await_control_reply().await?;
        self.mode = Mode::Pull;
        Ok(())
    }

    /// Drop interest in `topic`. In callback mode this also removes the
    /// topic's callback and stops the listener task once no callbacks
    /// remain, returning the subscriber to its initial state.
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let topic = normalize_topic(topic);
        self.send_control(Message::Unsubscribe {
            topic: topic.clone(),
        })
        .await?;
        match self.mode {
            Mode::Callback => {
                let empty = {
                    let mut callbacks = self.callbacks.lock();
                    callbacks.remove(&topic);
                    callbacks.is_empty()
                };
                if empty {
                    self.stop_listener().await;
                    self.mode = Mode::Idle;
                }
            }
            Mode::Pull => {
                self.await_control_reply().await?;
            }
            Mode::Idle => {}
        }
        Ok(())
    }

    /// Wait for the next publish on any subscribed topic.
    pub async fn get(&mut self) -> Result<(String, Value)> {
        if self.mode != Mode::Pull {
            return Err(Error::InvalidState("get on a subscriber not in pull mode"));
        }
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return self.decode_publish(&frame);
            }
            let mut reader = self.reader.lock().await;
            let mut scratch = BytesMut::new();
            match wire_io::read_frame(&mut *reader, &mut scratch, self.config.max_frame_bytes)
                .await?
            {
                Some(frame) if frame.header.flags & FLAG_PUBLISH != 0 => {
                    drop(reader);
                    return self.decode_publish(&frame);
                }
                Some(_) => {} // stray control reply
                None => return Err(Error::ConnectionClosed),
            }
        }
    }

    /// Like [`get`](Self::get) with a deadline; `None` on expiry.
    pub async fn get_nowait(&mut self, timeout: Duration) -> Result<Option<(String, Value)>> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Register `callback` for `topic` and deliver to it from a background
    /// listener task, started lazily on the first registration.
    pub async fn subscribe_with(&mut self, topic: &str, callback: TopicCallback) -> Result<()> {
        if self.mode == Mode::Pull {
            return Err(Error::InvalidState(
                "callback subscribe on a pull-mode subscriber",
            ));
        }
        let topic = normalize_topic(topic);
        if self.listener.is_none() {
            // First registration: acknowledge synchronously, then hand the
            // read half to the listener.
            self.send_control(Message::Subscribe {
                topic: topic.clone(),
            })
            .await?;
            self.await_control_reply().await?;
            self.callbacks.lock().insert(topic, callback);
            self.start_listener();
        } else {
            // The running listener swallows the acknowledgement.
            self.callbacks.lock().insert(topic.clone(), callback);
            self.send_control(Message::Subscribe { topic }).await?;
        }
        self.mode = Mode::Callback;
        Ok(())
    }

    async fn send_control(&mut self, message: Message) -> Result<()> {
        let frame = message.encode()?;
        wire_io::write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Read until the bridge's control reply arrives, parking any publishes
    /// that race past it.
    async fn await_control_reply(&mut self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut scratch = BytesMut::new();
        loop {
            match wire_io::read_frame(&mut *reader, &mut scratch, self.config.max_frame_bytes)
                .await?
            {
                Some(frame) if frame.header.flags == 0 => {
                    return match Message::decode(frame)? {
                        Message::Ok => Ok(()),
                        Message::Error { message } => Err(Error::Refused(message)),
                        other => Err(Error::Refused(format!("unexpected reply: {other:?}"))),
                    };
                }
                Some(frame) => self.pending.push_back(frame),
                None => return Err(Error::ConnectionClosed),
            }
        }
    }

    fn decode_publish(&self, frame: &Frame) -> Result<(String, Value)> {
        let (topic, payload) = pubsub::decode_publish(frame)?;
        let value = self.serializer.decode(payload)?;
        Ok((topic, value))
    }

    fn start_listener(&mut self) {
        let reader = Arc::clone(&self.reader);
        let serializer = Arc::clone(&self.serializer);
        let callbacks = Arc::clone(&self.callbacks);
        let cancel = self.cancel.clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        let mut pending: VecDeque<Frame> = self.pending.drain(..).collect();
        self.listener = Some(tokio::spawn(async move {
            dispatch_pending(&serializer, &callbacks, &mut pending);
            run_listener(reader, serializer, callbacks, cancel, max_frame_bytes).await;
        }));
    }

    async fn stop_listener(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.listener.take() {
            let _ = handle.await;
        }
        self.cancel = CancellationToken::new();
    }
}

fn dispatch_pending(
    serializer: &Serializer,
    callbacks: &Mutex<HashMap<String, TopicCallback>>,
    pending: &mut VecDeque<Frame>,
) {
    while let Some(frame) = pending.pop_front() {
        dispatch_frame(serializer, callbacks, &frame);
    }
}

fn dispatch_frame(
    serializer: &Serializer,
    callbacks: &Mutex<HashMap<String, TopicCallback>>,
    frame: &Frame,
) {
    let (topic, payload) = match pubsub::decode_publish(frame) {
        Ok(parts) => parts,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed publish");
            return;
        }
    };
    let value = match serializer.decode(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%topic, error = %err, "dropping undecodable publish");
            return;
        }
    };
    let callback = callbacks.lock().get(&topic).cloned();
    let Some(callback) = callback else {
        tracing::debug!(%topic, "publish for topic with no callback");
        return;
    };
    metrics::counter!("trestle_client_delivered_total").increment(1);
    if let Err(err) = callback(&topic, value) {
        tracing::warn!(%topic, error = %err, "topic callback failed");
    }
}

async fn run_listener(
    reader: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    serializer: Arc<Serializer>,
    callbacks: Arc<Mutex<HashMap<String, TopicCallback>>>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::new();
    loop {
        let mut guard = reader.lock().await;
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = wire_io::read_frame(&mut *guard, &mut scratch, max_frame_bytes) => result,
        };
        drop(guard);
        match result {
            Ok(Some(frame)) if frame.header.flags & FLAG_PUBLISH != 0 => {
                dispatch_frame(&serializer, &callbacks, &frame);
            }
            Ok(Some(_)) => {} // acknowledgement of a later subscribe
            Ok(None) => {
                tracing::warn!("bridge closed the subscription stream");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "subscription stream failed");
                break;
            }
        }
    }
    tracing::debug!("subscription listener exited");
}
