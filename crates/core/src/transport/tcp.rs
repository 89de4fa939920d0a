use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::protocol::interleaved::{self, HEADER_LEN, MAGIC};
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};

/// Queue feeding a connection's writer task. Carries serialized responses
/// and interleaved media frames, in send order.
pub type ControlSender = mpsc::Sender<Vec<u8>>;

/// Frames a connection may have queued before media is dropped.
pub const CONTROL_QUEUE_DEPTH: usize = 1024;

/// Largest request head (request line plus headers) accepted.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Largest request body accepted (ANNOUNCE SDP).
const MAX_BODY_LEN: usize = 1024 * 1024;

/// How long a closing connection may spend writing out what is queued.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP accept loop for one RTSP role.
///
/// Each connection runs as its own task with a handler built by
/// `make_handler`. Dropping the returned future aborts every connection
/// task it spawned.
pub async fn accept_loop<F, H>(listener: TcpListener, role: &'static str, make_handler: F)
where
    F: Fn(SocketAddr, ControlSender) -> H,
    H: MethodHandler,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let (control, queue) = mpsc::channel(CONTROL_QUEUE_DEPTH);
                    let handler = make_handler(peer_addr, control.clone());
                    connections.spawn(Connection::handle(stream, peer_addr, role, handler, control, queue));
                }
                Err(e) => {
                    tracing::warn!(role, error = %e, "TCP accept error");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// A single RTSP client connection with its own lifecycle.
struct Connection<H> {
    reader: BufReader<OwnedReadHalf>,
    control: ControlSender,
    handler: H,
    peer_addr: SocketAddr,
    role: &'static str,
}

impl<H: MethodHandler> Connection<H> {
    /// Entry point: set up a connection and run its request loop.
    async fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        role: &'static str,
        handler: H,
        control: ControlSender,
        queue: mpsc::Receiver<Vec<u8>>,
    ) {
        tracing::info!(%peer_addr, role, "client connected");

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (done, done_rx) = oneshot::channel();
        let mut writer = tokio::spawn(write_loop(write_half, queue, done_rx));

        let mut conn = Connection {
            reader: BufReader::new(read_half),
            control,
            handler,
            peer_addr,
            role,
        };

        let reason = conn.run().await;
        conn.handler.on_disconnect().await;
        let _ = done.send(());
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }

        tracing::info!(%peer_addr, role, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    async fn run(&mut self) -> &'static str {
        loop {
            let first = match self.reader.fill_buf().await {
                Ok([]) => return "connection closed by client",
                Ok(buf) => buf[0],
                Err(_) => return "read error",
            };

            if first == MAGIC {
                if let Err(reason) = self.read_interleaved().await {
                    return reason;
                }
                continue;
            }

            let head = match self.read_head().await {
                Ok(head) => head,
                Err(reason) => return reason,
            };
            if head.trim().is_empty() {
                continue;
            }

            let request = match RtspRequest::parse(&head) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, role = self.role, error = %e, "parse error");
                    if self.respond(RtspResponse::bad_request()).await.is_err() {
                        return "write error";
                    }
                    continue;
                }
            };

            let request = match request.content_length() {
                Ok(0) => request,
                Ok(len) if len > MAX_BODY_LEN => {
                    tracing::warn!(peer = %self.peer_addr, len, "request body too large");
                    // The body is never read, so the stream cannot be resynchronised.
                    let _ = self
                        .respond(with_cseq(RtspResponse::entity_too_large(), &request))
                        .await;
                    return "request body too large";
                }
                Ok(len) => {
                    let mut body = vec![0u8; len];
                    if self.reader.read_exact(&mut body).await.is_err() {
                        return "read error";
                    }
                    match String::from_utf8(body) {
                        Ok(body) => request.with_body(body),
                        Err(_) => {
                            tracing::warn!(peer = %self.peer_addr, method = %request.method, "body is not UTF-8");
                            let response = with_cseq(RtspResponse::bad_request(), &request);
                            if self.respond(response).await.is_err() {
                                return "write error";
                            }
                            continue;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "bad Content-Length");
                    let response = with_cseq(RtspResponse::from_error(&e), &request);
                    if self.respond(response).await.is_err() {
                        return "write error";
                    }
                    continue;
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                role = self.role,
                method = %request.method,
                uri = %request.uri,
                "request"
            );

            let response = with_cseq(self.handler.handle(&request).await, &request);

            tracing::debug!(
                peer = %self.peer_addr,
                role = self.role,
                status = response.status_code,
                "response"
            );

            if self.respond(response).await.is_err() {
                return "write error";
            }
        }
    }

    /// Read up to and including the blank line that ends a request head.
    ///
    /// Never buffers more than [`MAX_HEAD_LEN`] bytes, even for a line that
    /// never ends.
    async fn read_head(&mut self) -> Result<String, &'static str> {
        let mut head = String::new();
        loop {
            let budget = MAX_HEAD_LEN.saturating_sub(head.len());
            if budget == 0 {
                return Err("request head too large");
            }

            match (&mut self.reader).take(budget as u64).read_line(&mut head).await {
                Ok(0) => return Err("connection closed by client"),
                Ok(_) => {}
                Err(_) => return Err("read error"),
            }

            if !head.ends_with('\n') {
                // Either the budget ran out mid-line or the peer closed.
                return Err(if head.len() >= MAX_HEAD_LEN {
                    "request head too large"
                } else {
                    "connection closed by client"
                });
            }
            if head == "\r\n" || head == "\n" || head.ends_with("\r\n\r\n") || head.ends_with("\n\n")
            {
                return Ok(head);
            }
        }
    }

    /// Read one `$`-framed packet sent by the client.
    async fn read_interleaved(&mut self) -> Result<(), &'static str> {
        let mut header = [0u8; HEADER_LEN];
        if self.reader.read_exact(&mut header).await.is_err() {
            return Err("read error");
        }
        let Some((channel, len)) = interleaved::parse_header(header) else {
            return Err("bad interleaved frame");
        };

        let mut payload = vec![0u8; len];
        if self.reader.read_exact(&mut payload).await.is_err() {
            return Err("read error");
        }

        tracing::trace!(peer = %self.peer_addr, channel, len, "interleaved frame received");
        self.handler.on_interleaved(channel, &payload);
        Ok(())
    }

    async fn respond(&mut self, response: RtspResponse) -> Result<(), ()> {
        self.control
            .send(response.serialize().into_bytes())
            .await
            .map_err(|_| ())
    }
}

/// Echo the request's CSeq unless the handler already set one.
fn with_cseq(response: RtspResponse, request: &RtspRequest) -> RtspResponse {
    match request.cseq() {
        Some(cseq) if response.header("CSeq").is_none() => response.add_header("CSeq", cseq),
        _ => response,
    }
}

/// Write queued frames in order until `done` fires, then flush whatever was
/// queued before it and stop.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut done: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = queue.recv() => next,
            _ = &mut done => None,
        };
        let Some(bytes) = next else {
            break;
        };
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::debug!(error = %e, "control connection write failed");
            return;
        }
    }

    while let Ok(bytes) = queue.try_recv() {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
