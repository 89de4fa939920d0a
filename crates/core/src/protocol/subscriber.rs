use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::mount::parse_mount_uri;
use crate::protocol::MethodHandler;
use crate::protocol::auth::authorize;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::{RtspResponse, reason_phrase};
use crate::server::RelayState;
use crate::session::{ClientSession, TransportHeader, TransportRequest};
use crate::transport::{ClientTransport, ControlSender, Delivery, InterleavedDelivery, UdpDelivery};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN";

/// Handles the subscriber (player) side of one control connection.
///
/// Sessions are looked up by the `Session` header on every request; the
/// connection itself only matters for interleaved delivery.
pub struct SubscriberHandler {
    state: RelayState,
    peer_addr: SocketAddr,
    control: ControlSender,
}

impl SubscriberHandler {
    pub fn new(state: RelayState, peer_addr: SocketAddr, control: ControlSender) -> Self {
        SubscriberHandler {
            state,
            peer_addr,
            control,
        }
    }

    fn session(&self, request: &RtspRequest) -> Result<Arc<ClientSession>> {
        let id = request.session_id().unwrap_or("");
        self.state
            .sessions
            .get_session(id)
            .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))
    }

    fn handle_options(&self, request: &RtspRequest) -> Result<RtspResponse> {
        if request.session_id().is_some() {
            self.session(request)?.keepalive();
        }
        Ok(RtspResponse::ok().add_header("Public", PUBLIC_METHODS))
    }

    fn handle_describe(&self, request: &RtspRequest) -> Result<RtspResponse> {
        if !self.state.hooks.mount_allowed(request) {
            return Err(RtspError::Forbidden(request.uri.clone()));
        }

        let path = parse_mount_uri(&request.uri).path;
        let mount = self
            .state
            .mounts
            .get(&path)
            .ok_or(RtspError::MountNotFound(path))?;

        Ok(RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &request.uri)
            .with_body(mount.sdp().to_string()))
    }

    async fn handle_setup(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let transport = request
            .get_header("Transport")
            .map(TransportHeader::parse)
            .ok_or_else(|| RtspError::MalformedTransportHeader(String::new()))?;

        if transport.is_bare_tcp() {
            tracing::warn!(peer = %self.peer_addr, transport = transport.as_str(), "TCP without interleave requested");
            return Ok(RtspResponse::new(504, reason_phrase(504)));
        }
        let wanted = transport.request()?;

        let info = parse_mount_uri(&request.uri);
        let mount = self
            .state
            .mounts
            .get(&info.path)
            .ok_or_else(|| RtspError::MountNotFound(info.path.clone()))?;
        let stream = info
            .stream_id
            .and_then(|id| mount.stream(id))
            .ok_or_else(|| RtspError::StreamNotFound {
                path: info.path.clone(),
                stream_id: info.stream_id.unwrap_or_default(),
            })?;

        let (session, created) = match request.session_id() {
            Some(id) => {
                let session = self.session(request)?;
                if !Arc::ptr_eq(session.mount(), &mount) {
                    return Err(RtspError::SessionMismatch(id.to_string()));
                }
                (session, false)
            }
            None => (self.state.sessions.create_session(mount.clone()), true),
        };

        let delivery = match wanted {
            TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let remote_ip = self.peer_addr.ip().to_canonical();
                let bound = UdpDelivery::bind(
                    &self.state.pool,
                    &self.state.bind_policy,
                    remote_ip,
                    client_rtp_port,
                    client_rtcp_port,
                )
                .await;
                match bound {
                    Ok(udp) => Delivery::Udp(udp),
                    Err(e) => {
                        if created {
                            session.close().await;
                        }
                        return Err(e);
                    }
                }
            }
            TransportRequest::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => Delivery::Interleaved(InterleavedDelivery::new(
                self.control.clone(),
                rtp_channel,
                rtcp_channel,
            )),
        };

        let client = ClientTransport::new(mount, stream, delivery);
        if session.is_closed() {
            client.close().await;
            return Err(RtspError::SessionNotFound(session.id().to_string()));
        }

        let reply = match client.server_ports() {
            Some((rtp, rtcp)) => transport.with_server_port(rtp, rtcp),
            None => transport.as_str().to_string(),
        };
        session.add_transport(client);
        session.keepalive();

        Ok(RtspResponse::ok()
            .add_header("Transport", &reply)
            .add_header("Session", &session.session_header_value()))
    }

    async fn handle_play(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.session(request)?;
        if session.mount().is_closed() {
            tracing::debug!(session_id = %session.id(), mount = %session.mount().path(), "mount gone before PLAY");
            session.close().await;
            return Err(RtspError::SessionNotFound(session.id().to_string()));
        }
        session.play();

        let mut response = RtspResponse::ok().add_header("Session", &session.session_header_value());
        if let Some(range) = session.mount().range() {
            response = response.add_header("Range", &range);
        }
        Ok(response)
    }

    async fn handle_teardown(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.session(request)?;
        session.close().await;
        Ok(RtspResponse::ok())
    }
}

impl MethodHandler for SubscriberHandler {
    async fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let result = match authorize(request, &self.state.hooks) {
            Err(e) => Err(e),
            Ok(()) => match request.method.as_str() {
                "OPTIONS" => self.handle_options(request),
                "DESCRIBE" => self.handle_describe(request),
                "SETUP" => self.handle_setup(request).await,
                "PLAY" => self.handle_play(request).await,
                "TEARDOWN" => self.handle_teardown(request).await,
                _ => {
                    tracing::warn!(method = %request.method, uri = %request.uri, "unsupported subscriber method");
                    Ok(RtspResponse::not_implemented())
                }
            },
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                status = e.status_code(),
                error = %e,
                "subscriber request rejected"
            );
            RtspResponse::from_error(&e)
        })
    }

    /// Players send RTCP receiver reports on the odd channel; any frame
    /// counts as a sign of life.
    fn on_interleaved(&mut self, _channel: u8, _payload: &[u8]) {
        for session in self.state.sessions.sessions_using(&self.control) {
            session.keepalive();
        }
    }

    async fn on_disconnect(&mut self) {
        for session in self.state.sessions.sessions_using(&self.control) {
            tracing::debug!(peer = %self.peer_addr, session_id = %session.id(), "closing session of closed connection");
            session.close().await;
        }
    }
}
