use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{Result, RtspError};
use crate::pool::PortPool;

/// How hard to try when a pair from the pool turns out to be in use.
#[derive(Debug, Clone)]
pub struct BindPolicy {
    /// Address the RTP/RTCP sockets bind to.
    pub host: IpAddr,
    /// Pairs tried before giving up with
    /// [`RtspError::BindRetriesExceeded`]. Always at least one.
    pub max_attempts: u32,
    /// Pause between a conflicting bind and the next attempt.
    pub retry_delay: Duration,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            max_attempts: 10,
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// A bound RTP (even) / RTCP (odd) socket pair.
#[derive(Debug)]
pub struct UdpPair {
    pub port: u16,
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

async fn try_bind(host: IpAddr, port: u16) -> io::Result<(UdpSocket, UdpSocket)> {
    let rtp = UdpSocket::bind(SocketAddr::new(host, port)).await?;
    // If the odd port fails `rtp` is dropped here, freeing the even one.
    let rtcp = UdpSocket::bind(SocketAddr::new(host, port + 1)).await?;
    Ok((rtp, rtcp))
}

/// Bind the pair starting at `port`, rotating through the pool on conflict.
///
/// `port` must have been allocated from `pool` by the caller. On success
/// the returned pair owns whichever port finally bound. On error every
/// port this call touched, including `port`, is back in the pool.
pub async fn bind_pair(pool: &PortPool, mut port: u16, policy: &BindPolicy) -> Result<UdpPair> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match try_bind(policy.host, port).await {
            Ok((rtp, rtcp)) => {
                tracing::debug!(rtp_port = port, rtcp_port = port + 1, attempt, "bound port pair");
                return Ok(UdpPair { port, rtp, rtcp });
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::warn!(port, attempt, "port pair in use, rotating to the next pair");
                pool.release(port);
                if attempt >= max_attempts {
                    return Err(RtspError::BindRetriesExceeded {
                        attempts: max_attempts,
                    });
                }
                tokio::time::sleep(policy.retry_delay).await;
                port = pool.allocate()?;
                attempt += 1;
            }
            Err(e) => {
                pool.release(port);
                return Err(e.into());
            }
        }
    }
}

/// Delivery of relayed media to a player over its own UDP port pair.
///
/// The local pair comes from the [`PortPool`]; packets are sent from the
/// local RTP/RTCP socket to the player's `client_port` pair.
pub struct UdpDelivery {
    local_port: u16,
    remote_rtp: SocketAddr,
    remote_rtcp: SocketAddr,
    sockets: Mutex<Option<(Arc<UdpSocket>, Arc<UdpSocket>)>>,
    rtcp_listener: Mutex<Option<JoinHandle<()>>>,
    pool: PortPool,
}

impl UdpDelivery {
    /// Allocate a local pair and bind it, retrying on conflict.
    pub async fn bind(
        pool: &PortPool,
        policy: &BindPolicy,
        remote_ip: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
    ) -> Result<Self> {
        let port = pool.allocate()?;
        let pair = bind_pair(pool, port, policy).await?;

        Ok(Self {
            local_port: pair.port,
            remote_rtp: SocketAddr::new(remote_ip, client_rtp_port),
            remote_rtcp: SocketAddr::new(remote_ip, client_rtcp_port),
            sockets: Mutex::new(Some((Arc::new(pair.rtp), Arc::new(pair.rtcp)))),
            rtcp_listener: Mutex::new(None),
            pool: pool.clone(),
        })
    }

    /// Local (server-side) RTP and RTCP ports.
    pub fn server_ports(&self) -> (u16, u16) {
        (self.local_port, self.local_port + 1)
    }

    pub fn remote_rtp(&self) -> SocketAddr {
        self.remote_rtp
    }

    pub fn send_rtp(&self, buf: &[u8]) -> bool {
        let rtp = match &*self.sockets.lock() {
            Some((rtp, _)) => rtp.clone(),
            None => return false,
        };
        send_best_effort(&rtp, buf, self.remote_rtp)
    }

    pub fn send_rtcp(&self, buf: &[u8]) -> bool {
        let rtcp = match &*self.sockets.lock() {
            Some((_, rtcp)) => rtcp.clone(),
            None => return false,
        };
        send_best_effort(&rtcp, buf, self.remote_rtcp)
    }

    /// Run `on_packet` for every datagram the player sends to our RTCP port
    /// (receiver reports), until [`close`](Self::close).
    pub fn watch_rtcp<F>(&self, on_packet: F)
    where
        F: Fn() + Send + 'static,
    {
        let Some((_, rtcp)) = self.sockets.lock().clone() else {
            return;
        };

        let local_port = self.local_port + 1;
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match rtcp.recv_from(&mut buf).await {
                    Ok(_) => on_packet(),
                    Err(e) if is_transient_recv_error(&e) => {
                        tracing::debug!(port = local_port, error = %e, "RTCP receive error");
                    }
                    Err(e) => {
                        tracing::warn!(port = local_port, error = %e, "RTCP socket failed, no longer watching");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.rtcp_listener.lock().replace(task) {
            previous.abort();
        }
    }

    /// Close both sockets and return the local pair to the pool.
    pub async fn close(&self) {
        let listener = self.rtcp_listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
            // The task holds a socket handle; wait until it is dropped.
            let _ = listener.await;
        }

        let sockets = self.sockets.lock().take();
        if sockets.is_some() {
            drop(sockets);
            self.pool.release(self.local_port);
            tracing::trace!(port = self.local_port, "client port pair closed");
        }
    }
}

/// Errors after which a UDP socket keeps working, e.g. an ICMP
/// port-unreachable from an earlier send surfacing on the next receive.
pub(crate) fn is_transient_recv_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn send_best_effort(socket: &UdpSocket, buf: &[u8], target: SocketAddr) -> bool {
    match socket.try_send_to(buf, target) {
        Ok(_) => true,
        Err(e) => {
            tracing::trace!(%target, error = %e, "dropped datagram");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_policy(max_attempts: u32) -> BindPolicy {
        BindPolicy {
            host: IpAddr::from([127, 0, 0, 1]),
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn rotates_past_a_busy_pair() {
        let pool = PortPool::new(42100, 6);
        let _squatter = std::net::UdpSocket::bind("127.0.0.1:42100").unwrap();

        let port = pool.allocate().unwrap();
        let pair = bind_pair(&pool, port, &localhost_policy(5)).await.unwrap();

        assert_eq!(pair.port, 42102);
        assert!(pool.is_free(42100));
        assert!(!pool.is_free(42102));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let pool = PortPool::new(42200, 4);
        let _a = std::net::UdpSocket::bind("127.0.0.1:42200").unwrap();
        let _b = std::net::UdpSocket::bind("127.0.0.1:42203").unwrap();

        let port = pool.allocate().unwrap();
        let err = bind_pair(&pool, port, &localhost_policy(2)).await.unwrap_err();

        assert!(matches!(err, RtspError::BindRetriesExceeded { attempts: 2 }));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn only_peer_errors_are_transient() {
        assert!(is_transient_recv_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient_recv_error(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient_recv_error(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_transient_recv_error(&io::Error::other("socket gone")));
    }

    #[tokio::test]
    async fn close_returns_ports_and_silences_sends() {
        let pool = PortPool::new(42300, 4);
        let delivery = UdpDelivery::bind(
            &pool,
            &localhost_policy(3),
            IpAddr::from([127, 0, 0, 1]),
            42390,
            42391,
        )
        .await
        .unwrap();

        assert_eq!(delivery.server_ports(), (42300, 42301));
        assert_eq!(pool.available(), 1);

        delivery.close().await;
        assert_eq!(pool.available(), 2);
        assert!(!delivery.send_rtp(b"late"));

        delivery.close().await;
        assert_eq!(pool.available(), 2);
    }
}
