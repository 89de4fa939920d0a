//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): RTSP request/response signaling, one task per
//!   connection; also carries interleaved media for players that ask for it.
//! - **UDP** ([`udp`]): port-pair binding with conflict rotation, and
//!   per-player UDP delivery.
//! - **Interleaved** ([`interleaved`]): per-player delivery framed onto the
//!   control connection.
//!
//! [`ClientTransport`] is one player's binding to one [`Stream`]; the
//! relay only ever calls its [`send_rtp`](ClientTransport::send_rtp) /
//! [`send_rtcp`](ClientTransport::send_rtcp) capability.

pub mod interleaved;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::mount::{Mount, Stream};
use crate::session::ClientSession;
pub use interleaved::InterleavedDelivery;
pub use tcp::ControlSender;
pub use udp::{BindPolicy, UdpDelivery};

static TRANSPORT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How media reaches the player.
pub enum Delivery {
    Udp(UdpDelivery),
    Interleaved(InterleavedDelivery),
}

/// One player's data-plane binding to a [`Stream`].
///
/// Becomes a relay target on [`play`](Self::play) and stops receiving
/// anything once [`close`](Self::close) has run.
pub struct ClientTransport {
    id: u64,
    mount: Arc<Mount>,
    stream: Arc<Stream>,
    delivery: Delivery,
    closed: AtomicBool,
    owner: Mutex<Weak<ClientSession>>,
}

impl ClientTransport {
    pub fn new(mount: Arc<Mount>, stream: Arc<Stream>, delivery: Delivery) -> Arc<Self> {
        Arc::new(Self {
            id: TRANSPORT_COUNTER.fetch_add(1, Ordering::SeqCst),
            mount,
            stream,
            delivery,
            closed: AtomicBool::new(false),
            owner: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn stream_id(&self) -> u32 {
        self.stream.id()
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Local port pair, for UDP delivery.
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        match &self.delivery {
            Delivery::Udp(udp) => Some(udp.server_ports()),
            Delivery::Interleaved(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send_rtp(&self, buf: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        match &self.delivery {
            Delivery::Udp(udp) => udp.send_rtp(buf),
            Delivery::Interleaved(tcp) => tcp.send_rtp(buf),
        }
    }

    pub fn send_rtcp(&self, buf: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        match &self.delivery {
            Delivery::Udp(udp) => udp.send_rtcp(buf),
            Delivery::Interleaved(tcp) => tcp.send_rtcp(buf),
        }
    }

    /// Start receiving relayed packets from the stream.
    pub fn play(self: &Arc<Self>) {
        if !self.is_closed() && !self.mount.is_closed() {
            self.stream.add_client(self);
        }
    }

    /// Leave the stream's fan-out table and release the delivery resources.
    ///
    /// Idempotent; only the first call does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.mount.notify_client_left(self.stream.id(), self.id);
        match &self.delivery {
            Delivery::Udp(udp) => udp.close().await,
            Delivery::Interleaved(tcp) => tcp.close(),
        }
        tracing::debug!(client = self.id, mount = %self.mount.path(), "client transport closed");
    }

    pub(crate) fn set_owner(&self, session: Weak<ClientSession>) {
        *self.owner.lock() = session;
    }

    /// Tell the owning session this transport was closed from outside it.
    pub(crate) async fn notify_owner_closed(&self) {
        let owner = self.owner.lock().upgrade();
        if let Some(session) = owner {
            session.transport_closed(self.id).await;
        }
    }

    /// Whether this transport frames media onto the connection behind
    /// `control`.
    pub fn uses_connection(&self, control: &ControlSender) -> bool {
        match &self.delivery {
            Delivery::Interleaved(tcp) => tcp.uses_connection(control),
            Delivery::Udp(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_interleaved(
        channel: u8,
        mount: Arc<Mount>,
        stream: Arc<Stream>,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let delivery = Delivery::Interleaved(InterleavedDelivery::new(tx, channel, channel + 1));
        (Self::new(mount, stream, delivery), rx)
    }
}

impl fmt::Display for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.delivery {
            Delivery::Udp(udp) => {
                let (rtp, rtcp) = udp.server_ports();
                write!(
                    f,
                    "udp {}/streamid={} {}-{} -> {}",
                    self.mount.path(),
                    self.stream.id(),
                    rtp,
                    rtcp,
                    udp.remote_rtp()
                )
            }
            Delivery::Interleaved(tcp) => {
                let (rtp, rtcp) = tcp.channels();
                write!(
                    f,
                    "interleaved {}/streamid={} channels {}-{}",
                    self.mount.path(),
                    self.stream.id(),
                    rtp,
                    rtcp
                )
            }
        }
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("id", &self.id)
            .field("transport", &self.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}
