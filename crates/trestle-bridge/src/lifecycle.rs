// Lifecycle scaffolding shared by both bridge kinds: bind, start with a
// confirmed worker, cooperative stop.
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use trestle_common::ids::BridgeId;
use trestle_common::BindSpec;
use trestle_wire::Frame;

use crate::net::{self, OutboundEvent, WORKER_QUEUE_DEPTH};
use crate::{BridgeState, Error, Result};

pub(crate) struct BridgeCore {
    pub(crate) id: BridgeId,
    pub(crate) channel: String,
    state: BridgeState,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    inbound: Option<TcpListener>,
    outbound: Option<TcpListener>,
    inbound_addr: Option<String>,
    outbound_addr: Option<String>,
}

impl BridgeCore {
    pub(crate) fn new(channel: impl Into<String>) -> Self {
        Self {
            id: BridgeId::new(),
            channel: channel.into(),
            state: BridgeState::Created,
            cancel: CancellationToken::new(),
            worker: None,
            inbound: None,
            outbound: None,
            inbound_addr: None,
            outbound_addr: None,
        }
    }

    pub(crate) fn state(&self) -> BridgeState {
        self.state
    }

    /// Public `host:port` of the producer-facing socket, known after
    /// initialization.
    pub(crate) fn inbound_addr(&self) -> Option<&str> {
        self.inbound_addr.as_deref()
    }

    pub(crate) fn outbound_addr(&self) -> Option<&str> {
        self.outbound_addr.as_deref()
    }

    /// Bind both sockets and record their public addresses. Bind failure is
    /// fatal and propagates; nothing is partially retained on error.
    pub(crate) async fn initialize(&mut self, inbound_bind: &str, outbound_bind: &str) -> Result<()> {
        if self.state != BridgeState::Created {
            return Err(Error::InvalidState {
                actual: self.state,
                expected: BridgeState::Created,
            });
        }
        let inbound_spec: BindSpec = inbound_bind.parse()?;
        let outbound_spec: BindSpec = outbound_bind.parse()?;
        let (inbound, inbound_addr) = net::bind_spec(&inbound_spec).await?;
        let (outbound, outbound_addr) = net::bind_spec(&outbound_spec).await?;
        tracing::info!(
            bridge = %self.id,
            channel = %self.channel,
            %inbound_addr,
            %outbound_addr,
            "bridge sockets bound"
        );
        self.inbound = Some(inbound);
        self.outbound = Some(outbound);
        self.inbound_addr = Some(inbound_addr);
        self.outbound_addr = Some(outbound_addr);
        self.state = BridgeState::Initialized;
        Ok(())
    }

    /// Spawn the accept loops and the kind-specific worker, then wait for
    /// the worker to confirm it entered its loop. Callers connecting after
    /// this returns are guaranteed a bound, polling bridge.
    pub(crate) async fn start_with<F>(&mut self, max_frame_bytes: usize, spawn_worker: F) -> Result<()>
    where
        F: FnOnce(
            mpsc::Receiver<Frame>,
            mpsc::Receiver<OutboundEvent>,
            CancellationToken,
            oneshot::Sender<()>,
        ) -> JoinHandle<()>,
    {
        if self.state != BridgeState::Initialized {
            return Err(Error::InvalidState {
                actual: self.state,
                expected: BridgeState::Initialized,
            });
        }
        let (inbound, outbound) = match (self.inbound.take(), self.outbound.take()) {
            (Some(inbound), Some(outbound)) => (inbound, outbound),
            _ => {
                return Err(Error::InvalidState {
                    actual: self.state,
                    expected: BridgeState::Initialized,
                })
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        tokio::spawn(net::accept_inbound(
            inbound,
            inbound_tx,
            self.cancel.clone(),
            max_frame_bytes,
        ));
        tokio::spawn(net::accept_outbound(
            outbound,
            outbound_tx,
            self.cancel.clone(),
            max_frame_bytes,
        ));

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = spawn_worker(inbound_rx, outbound_rx, self.cancel.clone(), ready_tx);
        self.worker = Some(worker);
        ready_rx.await.map_err(|_| Error::StartAborted)?;
        self.state = BridgeState::Running;
        tracing::info!(bridge = %self.id, channel = %self.channel, "bridge running");
        Ok(())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state == BridgeState::Running
            && self
                .worker
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    /// Signal the termination flag and wait up to `timeout` for the worker
    /// to observe it. Best-effort: a worker stuck in a forward call keeps
    /// running past the deadline, and we report that rather than killing it.
    pub(crate) async fn stop(&mut self, wait: std::time::Duration) -> bool {
        self.cancel.cancel();
        let observed = match self.worker.take() {
            Some(handle) => match timeout(wait, handle).await {
                Ok(join) => {
                    if let Err(err) = join {
                        tracing::warn!(bridge = %self.id, error = %err, "bridge worker panicked");
                    }
                    true
                }
                Err(_) => {
                    tracing::warn!(bridge = %self.id, "bridge worker did not stop within {wait:?}");
                    false
                }
            },
            None => true,
        };
        self.state = BridgeState::Stopped;
        tracing::info!(bridge = %self.id, channel = %self.channel, "bridge stopped");
        observed
    }
}
