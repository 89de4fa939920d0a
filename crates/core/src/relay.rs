//! Inbound RTP/RTCP listeners and subscriber fan-out.
//!
//! Each recording [`Stream`] owns two [`RtpRelay`]s: one on its even (RTP)
//! port and one on its odd (RTCP) port. Every datagram the publisher sends
//! is handed, unmodified, to each client currently playing the stream.
//! Dispatch for one datagram finishes before the next is received, so
//! every client sees packets in arrival order.

use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::mount::Stream;
use crate::transport::ClientTransport;
use crate::transport::udp::is_transient_recv_error;

/// Largest datagram accepted from a publisher.
const MAX_DATAGRAM: usize = 65_536;

/// Which half of the pair a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    /// RTP rides on the even port, RTCP on the odd one.
    pub fn for_port(port: u16) -> Self {
        if port % 2 == 0 { Self::Rtp } else { Self::Rtcp }
    }
}

/// One UDP listener of a recording stream.
#[derive(Debug)]
pub struct RtpRelay {
    port: u16,
    kind: PacketKind,
    task: JoinHandle<()>,
}

impl RtpRelay {
    /// Start relaying datagrams received on `socket` to `stream`'s clients.
    pub fn spawn(socket: UdpSocket, port: u16, stream: Weak<Stream>) -> Self {
        let kind = PacketKind::for_port(port);
        let task = tokio::spawn(relay_loop(socket, port, kind, stream));
        tracing::debug!(port, ?kind, "relay listener started");
        Self { port, kind, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Stop the listener. Returns once its socket has been closed.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
        tracing::debug!(port = self.port, "relay listener closed");
    }
}

async fn relay_loop(socket: UdpSocket, port: u16, kind: PacketKind, stream: Weak<Stream>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(e) if is_transient_recv_error(&e) => {
                tracing::debug!(port, error = %e, "relay receive error");
                continue;
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "relay socket failed, listener stopped");
                break;
            }
        };

        let Some(stream) = stream.upgrade() else {
            break;
        };
        fan_out(&stream.clients(), kind, &buf[..len]);
    }
}

/// Deliver one datagram to every client, best-effort.
///
/// A failed send to one client does not affect the others. Returns how
/// many sends succeeded.
pub fn fan_out(clients: &[Arc<ClientTransport>], kind: PacketKind, payload: &[u8]) -> usize {
    clients
        .iter()
        .filter(|client| match kind {
            PacketKind::Rtp => client.send_rtp(payload),
            PacketKind::Rtcp => client.send_rtcp(payload),
        })
        .count()
}
