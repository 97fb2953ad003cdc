// Shared listener registry: one pull loop per bridge url, fanned out across
// every callback registered against that url.
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trestle_codec::{Serializer, Value};
use trestle_wire::{io as wire_io, queue, FLAG_BULK};

use crate::{connect, ClientConfig, Result};

/// How bulks handed to a queue callback are sliced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One callback invocation per pulled bulk.
    #[default]
    Bulk,
    /// One callback invocation per message.
    PerMessage,
}

/// Callback invoked with `(qname, values)` for pulled work. Failures are
/// logged and the loop continues.
pub type QueueCallback = Arc<dyn Fn(&str, Vec<Value>) -> anyhow::Result<()> + Send + Sync>;

/// Handle for one registered callback, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Clone)]
struct Slot {
    id: CallbackId,
    qname: String,
    callback: QueueCallback,
    mode: DeliveryMode,
}

struct UrlListener {
    cancel: CancellationToken,
    // Held so the registry owns the task's lifetime; the task exits on
    // cancellation and is never joined synchronously.
    _handle: JoinHandle<()>,
    slots: Arc<Mutex<Vec<Slot>>>,
}

/// Routes queue callbacks through one listener task per distinct bridge url.
///
/// Getters racing to subscribe against the same url share a single pulling
/// connection; the loop round-robins pulls across every callback registered
/// for that url, so no callback starves while another drains its queue.
/// Constructed explicitly and shared by reference; there is no global
/// instance.
pub struct ListenerRegistry {
    serializer: Arc<Serializer>,
    config: ClientConfig,
    listeners: Mutex<HashMap<String, UrlListener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(serializer: Arc<Serializer>) -> Self {
        Self::with_config(serializer, ClientConfig::default())
    }

    pub fn with_config(serializer: Arc<Serializer>, config: ClientConfig) -> Self {
        Self {
            serializer,
            config,
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `qname` on the bridge at `url`, starting the
    /// url's listener task if this is its first callback.
    pub fn subscribe(
        &self,
        url: &str,
        qname: &str,
        callback: QueueCallback,
        mode: DeliveryMode,
    ) -> Result<CallbackId> {
        // Validate the url before a background task trips over it.
        crate::endpoint_addr(url)?;
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Slot {
            id,
            qname: qname.to_string(),
            callback,
            mode,
        };
        let mut listeners = self.listeners.lock();
        if let Some(listener) = listeners.get(url) {
            listener.slots.lock().push(slot);
        } else {
            let slots = Arc::new(Mutex::new(vec![slot]));
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_url_listener(
                url.to_string(),
                Arc::clone(&slots),
                Arc::clone(&self.serializer),
                self.config.clone(),
                cancel.clone(),
            ));
            listeners.insert(
                url.to_string(),
                UrlListener {
                    cancel,
                    _handle: handle,
                    slots,
                },
            );
        }
        Ok(id)
    }

    /// Remove one callback. The url's listener is cancelled once its last
    /// callback goes. Returns whether the id was known.
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        let mut listeners = self.listeners.lock();
        let mut found = false;
        let mut emptied: Option<String> = None;
        for (url, listener) in listeners.iter() {
            let mut slots = listener.slots.lock();
            let before = slots.len();
            slots.retain(|slot| slot.id != id);
            if slots.len() != before {
                found = true;
                if slots.is_empty() {
                    emptied = Some(url.clone());
                }
                break;
            }
        }
        if let Some(url) = emptied {
            if let Some(listener) = listeners.remove(&url) {
                listener.cancel.cancel();
            }
        }
        found
    }

    /// Number of live per-url listener tasks.
    pub fn active_listeners(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        for listener in self.listeners.lock().values() {
            listener.cancel.cancel();
        }
    }
}

async fn run_url_listener(
    url: String,
    slots: Arc<Mutex<Vec<Slot>>>,
    serializer: Arc<Serializer>,
    config: ClientConfig,
    cancel: CancellationToken,
) {
    let mut cycle: usize = 0;
    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = connect(&url) => match connected {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%url, error = %err, "queue listener cannot connect, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval * 10) => continue,
                    }
                }
            },
        };
        tracing::debug!(%url, "queue listener connected");

        let mut scratch = BytesMut::new();
        loop {
            if cancel.is_cancelled() {
                break 'reconnect;
            }
            let snapshot: Vec<Slot> = slots.lock().clone();
            if snapshot.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }

            // Rotate the starting slot so equal subscribers take turns at
            // the head of the queue.
            let offset = cycle % snapshot.len();
            cycle = cycle.wrapping_add(1);
            let mut served_any = false;
            for slot in snapshot.iter().cycle().skip(offset).take(snapshot.len()) {
                match pull_once(&mut stream, &mut scratch, &config, &cancel, &slot.qname).await {
                    Ok(Some(payloads)) => {
                        if !payloads.is_empty() {
                            served_any = true;
                            dispatch(&serializer, slot, payloads);
                        }
                    }
                    Ok(None) => break 'reconnect,
                    Err(err) => {
                        tracing::warn!(%url, error = %err, "queue listener stream failed, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
            if !served_any {
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }
    tracing::debug!(%url, "queue listener exited");
}

/// One pull round trip. `Ok(None)` means the bridge is gone or we were
/// cancelled mid-read.
async fn pull_once(
    stream: &mut TcpStream,
    scratch: &mut BytesMut,
    config: &ClientConfig,
    cancel: &CancellationToken,
    qname: &str,
) -> Result<Option<Vec<bytes::Bytes>>> {
    let request = queue::encode_pull(qname)?;
    wire_io::write_frame(stream, &request).await?;
    let reply = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        reply = wire_io::read_frame(stream, scratch, config.max_frame_bytes) => reply?,
    };
    let Some(frame) = reply else {
        tracing::warn!("bridge closed the pull stream");
        return Ok(None);
    };
    if frame.header.flags & FLAG_BULK == 0 {
        tracing::warn!(flags = frame.header.flags, "unexpected reply to pull");
        return Ok(Some(Vec::new()));
    }
    let (_, payloads) = queue::decode_bulk(&frame)?;
    Ok(Some(payloads))
}

fn dispatch(serializer: &Serializer, slot: &Slot, payloads: Vec<bytes::Bytes>) {
    let mut values = Vec::with_capacity(payloads.len());
    for payload in payloads {
        match serializer.decode(payload) {
            Ok(value) => values.push(value),
            Err(err) => {
                // A bad message costs itself, not the rest of the bulk.
                tracing::warn!(qname = %slot.qname, error = %err, "dropping undecodable message");
            }
        }
    }
    if values.is_empty() {
        return;
    }
    metrics::counter!("trestle_client_consumed_total").increment(values.len() as u64);
    match slot.mode {
        DeliveryMode::Bulk => {
            if let Err(err) = (slot.callback)(&slot.qname, values) {
                tracing::warn!(qname = %slot.qname, error = %err, "queue callback failed");
            }
        }
        DeliveryMode::PerMessage => {
            for value in values {
                if let Err(err) = (slot.callback)(&slot.qname, vec![value]) {
                    tracing::warn!(qname = %slot.qname, error = %err, "queue callback failed");
                }
            }
        }
    }
}
