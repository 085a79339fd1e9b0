//! In-process message transport.
//!
//! [`link`] builds a connected pair of [`LoopbackEnd`]s backed by
//! `crossbeam-channel`. [`LoopbackHub`] is a [`Connector`] that hands the local
//! end to whoever opens a channel and parks the remote end until an emulated
//! peer accepts it. The hub allows one open link per `(endpoint, port)` and
//! counts opens and closes so callers can check nothing leaked.
//!
//! Parked ends are only dropped by the hub once their local end has closed;
//! a peer that never drains [`LoopbackHub::acceptor`] keeps at most the ends
//! of links that are still open.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ChannelError, ChannelResult};
use crate::message::{ChannelId, ControlMsg, WaitTimeout};
use crate::transport::{Connector, MessageTransport};

/// One side of an in-process link.
pub struct LoopbackEnd {
    id: ChannelId,
    tx: Option<Sender<ControlMsg>>,
    rx: Receiver<ControlMsg>,
    hub: Option<Arc<HubShared>>,
    open: Arc<AtomicBool>,
    peer_open: Arc<AtomicBool>,
}

impl LoopbackEnd {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Whether the other end of the link has been closed or dropped.
    pub fn is_peer_closed(&self) -> bool {
        !self.peer_open.load(Ordering::Acquire)
    }
}

impl MessageTransport for LoopbackEnd {
    fn send(&mut self, msg: ControlMsg) -> ChannelResult<()> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        trace!(endpoint = self.id.endpoint, port = self.id.port, msg = msg.name(), "send");
        tx.send(msg).map_err(|_| ChannelError::Closed)
    }

    fn recv(&mut self, timeout: WaitTimeout) -> ChannelResult<ControlMsg> {
        if self.tx.is_none() {
            return Err(ChannelError::Closed);
        }
        let msg = match timeout {
            WaitTimeout::Infinite => self.rx.recv().map_err(|_| ChannelError::Closed)?,
            WaitTimeout::Bounded(waited) => self.rx.recv_timeout(waited).map_err(|err| match err {
                RecvTimeoutError::Timeout => ChannelError::Timeout { waited },
                RecvTimeoutError::Disconnected => ChannelError::Closed,
            })?,
        };
        trace!(endpoint = self.id.endpoint, port = self.id.port, msg = msg.name(), "recv");
        Ok(msg)
    }

    fn close(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        self.open.store(false, Ordering::Release);
        if let Some(hub) = self.hub.take() {
            hub.release(self.id);
        }
    }
}

impl Drop for LoopbackEnd {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds a connected pair of ends for `id`: `(local, remote)`.
pub fn link(id: ChannelId) -> (LoopbackEnd, LoopbackEnd) {
    let (local_tx, remote_rx) = unbounded();
    let (remote_tx, local_rx) = unbounded();
    let local_open = Arc::new(AtomicBool::new(true));
    let remote_open = Arc::new(AtomicBool::new(true));
    let local = LoopbackEnd {
        id,
        tx: Some(local_tx),
        rx: local_rx,
        hub: None,
        open: Arc::clone(&local_open),
        peer_open: Arc::clone(&remote_open),
    };
    let remote = LoopbackEnd {
        id,
        tx: Some(remote_tx),
        rx: remote_rx,
        hub: None,
        open: remote_open,
        peer_open: local_open,
    };
    (local, remote)
}

struct HubShared {
    claimed: Mutex<HashSet<ChannelId>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl HubShared {
    fn release(&self, id: ChannelId) {
        self.claimed.lock().remove(&id);
        self.closed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Connector handing out loopback links and parking their remote ends.
pub struct LoopbackHub {
    shared: Arc<HubShared>,
    accept_tx: Sender<LoopbackEnd>,
    accept_rx: Receiver<LoopbackEnd>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = unbounded();
        Self {
            shared: Arc::new(HubShared {
                claimed: Mutex::new(HashSet::new()),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
            accept_tx,
            accept_rx,
        }
    }

    /// Receiver of remote ends, one per successful [`Connector::open`].
    ///
    /// Clone it into the thread that plays the remote endpoint. Ends whose
    /// local side closed before being accepted are discarded on the next open.
    pub fn acceptor(&self) -> Receiver<LoopbackEnd> {
        self.accept_rx.clone()
    }

    /// Number of links opened through this hub.
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::Acquire)
    }

    /// Number of local ends closed so far.
    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of `(endpoint, port)` pairs with a live local end.
    pub fn active(&self) -> usize {
        self.shared.claimed.lock().len()
    }

    /// Number of remote ends waiting to be accepted.
    pub fn parked(&self) -> usize {
        self.accept_rx.len()
    }

    fn prune_parked(&self) {
        let parked: Vec<LoopbackEnd> = self.accept_rx.try_iter().collect();
        for end in parked {
            if end.is_peer_closed() {
                trace!(endpoint = end.id.endpoint, port = end.id.port, "dropping stale parked end");
                continue;
            }
            let _ = self.accept_tx.send(end);
        }
    }
}

impl Connector for LoopbackHub {
    fn open(&self, id: ChannelId) -> ChannelResult<Box<dyn MessageTransport>> {
        if !self.shared.claimed.lock().insert(id) {
            return Err(ChannelError::Busy {
                endpoint: id.endpoint,
                port: id.port,
            });
        }
        self.shared.opened.fetch_add(1, Ordering::AcqRel);

        self.prune_parked();
        let (mut local, remote) = link(id);
        local.hub = Some(Arc::clone(&self.shared));
        // The hub holds `accept_rx` itself, so this send cannot fail.
        let _ = self.accept_tx.send(remote);
        Ok(Box::new(local))
    }
}
