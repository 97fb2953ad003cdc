// Socket plumbing shared by both bridge kinds: bind-spec resolution, accept
// loops, and per-connection reader/writer tasks feeding the worker.
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trestle_common::BindSpec;
use trestle_wire::{io as wire_io, Frame};

use crate::{Error, Result};

/// Identifies one accepted consumer connection for the worker's registries.
pub(crate) type ConnId = u64;

// Depth of the per-connection outgoing queue. Consumers in request/reply
// lock-step use one slot; pub/sub consumers that fall this far behind start
// losing events (drop-new policy).
pub(crate) const CONN_SEND_DEPTH: usize = 64;

// Depth of the worker's event queues; producers are backpressured past this.
pub(crate) const WORKER_QUEUE_DEPTH: usize = 1024;

pub(crate) enum OutboundEvent {
    Connected {
        conn: ConnId,
        writer: mpsc::Sender<Bytes>,
    },
    Frame {
        conn: ConnId,
        frame: Frame,
    },
    Disconnected {
        conn: ConnId,
    },
}

/// Bind the first workable candidate address in the spec, in order.
pub(crate) async fn bind_spec(spec: &BindSpec) -> Result<(TcpListener, String)> {
    let mut last_err: Option<std::io::Error> = None;
    for candidate in spec.candidates() {
        match TcpListener::bind(&candidate).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                return Ok((listener, addr.to_string()));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(Error::Bind {
        spec: spec.to_string(),
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no candidates")),
    })
}

/// Accept producer connections and forward every received frame to the
/// worker. Producers are fire-and-forget; nothing is ever written back.
pub(crate) async fn accept_inbound(
    listener: TcpListener,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "inbound accept failed");
                continue;
            }
        };
        tracing::debug!(%peer, "producer connected");
        let (read_half, _write_half) = stream.into_split();
        tokio::spawn(read_inbound_conn(
            read_half,
            frames.clone(),
            cancel.clone(),
            max_frame_bytes,
        ));
    }
}

async fn read_inbound_conn(
    mut read_half: OwnedReadHalf,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = wire_io::read_frame(&mut read_half, &mut scratch, max_frame_bytes) => result,
        };
        match result {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                // Framing is unrecoverable once a stream desyncs; drop the
                // connection, not the bridge.
                tracing::warn!(error = %err, "closing producer connection after bad frame");
                break;
            }
        }
    }
}

/// Accept consumer connections. Each one gets a writer queue (owned by a
/// writer task) and a reader task that forwards its requests to the worker.
pub(crate) async fn accept_outbound(
    listener: TcpListener,
    events: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let next_conn = Arc::new(AtomicU64::new(1));
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "outbound accept failed");
                continue;
            }
        };
        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%peer, conn, "consumer connected");

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(CONN_SEND_DEPTH);
        if events
            .send(OutboundEvent::Connected {
                conn,
                writer: writer_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        tokio::spawn(write_outbound_conn(write_half, writer_rx, cancel.clone()));
        tokio::spawn(read_outbound_conn(
            read_half,
            conn,
            events.clone(),
            cancel.clone(),
            max_frame_bytes,
        ));
    }
}

async fn read_outbound_conn(
    mut read_half: OwnedReadHalf,
    conn: ConnId,
    events: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = wire_io::read_frame(&mut read_half, &mut scratch, max_frame_bytes) => result,
        };
        match result {
            Ok(Some(frame)) => {
                if events
                    .send(OutboundEvent::Frame { conn, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(conn, error = %err, "closing consumer connection after bad frame");
                break;
            }
        }
    }
    let _ = events.send(OutboundEvent::Disconnected { conn }).await;
}

async fn write_outbound_conn(
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = writer_rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        if let Err(err) = write_half.write_all(&bytes).await {
            tracing::debug!(error = %err, "consumer write failed");
            break;
        }
        if let Err(err) = write_half.flush().await {
            tracing::debug!(error = %err, "consumer flush failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_spec_picks_an_ephemeral_port() {
        let spec: BindSpec = "tcp://127.0.0.1:*".parse().expect("spec");
        let (_listener, addr) = bind_spec(&spec).await.expect("bind");
        assert!(addr.starts_with("127.0.0.1:"));
        assert_ne!(addr, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn bind_spec_walks_a_range_past_a_taken_port() {
        // Occupy some port, then ask for a range starting at it.
        let (first, addr) = bind_spec(&"tcp://127.0.0.1:*".parse().expect("spec"))
            .await
            .expect("bind");
        let taken: u16 = addr.rsplit(':').next().expect("port").parse().expect("u16");
        if taken == u16::MAX {
            return; // cannot express a range above the top port
        }
        let range: BindSpec = format!("tcp://127.0.0.1:{}-{}", taken, taken.saturating_add(1))
            .parse()
            .expect("spec");
        let (_second, second_addr) = bind_spec(&range).await.expect("bind in range");
        assert_ne!(second_addr, addr);
        drop(first);
    }

    #[tokio::test]
    async fn bind_spec_reports_failure_with_the_spec() {
        let (taken, addr) = bind_spec(&"tcp://127.0.0.1:*".parse().expect("spec"))
            .await
            .expect("bind");
        let port: u16 = addr.rsplit(':').next().expect("port").parse().expect("u16");
        let exact: BindSpec = format!("tcp://127.0.0.1:{port}").parse().expect("spec");
        let err = bind_spec(&exact).await.expect_err("port taken");
        assert!(matches!(err, Error::Bind { .. }));
        drop(taken);
    }
}
