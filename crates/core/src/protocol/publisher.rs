use std::net::SocketAddr;

use crate::error::{Result, RtspError};
use crate::mount::parse_mount_uri;
use crate::protocol::auth::authorize;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::MethodHandler;
use crate::server::RelayState;
use crate::session::TransportHeader;

const PUBLIC_METHODS: &str = "OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN";

/// Handles the publisher (encoder) side of one control connection.
///
/// Mount state lives in the shared registry, not here, so a publisher may
/// ANNOUNCE on one connection and RECORD on another.
pub struct PublisherHandler {
    state: RelayState,
    peer_addr: SocketAddr,
}

impl PublisherHandler {
    pub fn new(state: RelayState, peer_addr: SocketAddr) -> Self {
        PublisherHandler { state, peer_addr }
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    fn handle_announce(&self, request: &RtspRequest) -> Result<RtspResponse> {
        authorize(request, &self.state.hooks)?;

        let path = parse_mount_uri(&request.uri).path;
        let mount = self.state.mounts.announce(&path, request.body.clone())?;

        Ok(RtspResponse::ok().add_header("Session", &self.session_value(mount.id())))
    }

    fn handle_setup(&self, request: &RtspRequest) -> Result<RtspResponse> {
        authorize(request, &self.state.hooks)?;

        let transport = TransportHeader::parse(request.get_header("Transport").unwrap_or(""));
        if transport.tcp {
            return Err(RtspError::UnsupportedTransport(transport.as_str().to_string()));
        }

        let info = parse_mount_uri(&request.uri);
        let mount = self
            .state
            .mounts
            .get(&info.path)
            .ok_or_else(|| RtspError::MountNotFound(info.path.clone()))?;
        let stream_id = info.stream_id.ok_or_else(|| RtspError::StreamNotFound {
            path: info.path.clone(),
            stream_id: 0,
        })?;

        let stream = mount.create_stream(stream_id)?;
        let (rtp, rtcp) = stream.ports().ok_or(RtspError::NoPortsAvailable)?;

        tracing::debug!(
            peer = %self.peer_addr,
            mount = %mount.path(),
            stream_id,
            rtp_port = rtp,
            "publisher stream set up"
        );

        Ok(RtspResponse::ok()
            .add_header("Transport", &transport.with_server_port(rtp, rtcp))
            .add_header("Session", &self.session_value(mount.id())))
    }

    async fn handle_record(&self, request: &RtspRequest) -> Result<RtspResponse> {
        authorize(request, &self.state.hooks)?;

        let session_id = request.session_id().unwrap_or("");
        let mount = self
            .state
            .mounts
            .resolve_from_uri(&request.uri)
            .filter(|mount| mount.id() == session_id)
            .ok_or_else(|| RtspError::SessionMismatch(session_id.to_string()))?;

        if let Some(range) = request.get_header("Range") {
            mount.set_range(range);
        }

        mount.start_recording(&self.state.bind_policy).await?;

        let mut response = RtspResponse::ok().add_header("Session", &self.session_value(mount.id()));
        if let Some(range) = mount.range() {
            response = response.add_header("Range", &range);
        }
        Ok(response)
    }

    async fn handle_teardown(&self, request: &RtspRequest) -> Result<RtspResponse> {
        authorize(request, &self.state.hooks)?;

        let path = parse_mount_uri(&request.uri).path;
        if self.state.mounts.remove(&path).await {
            tracing::info!(peer = %self.peer_addr, mount = %path, "publisher teardown");
        }
        Ok(RtspResponse::ok())
    }

    fn session_value(&self, id: &str) -> String {
        format!("{};timeout={}", id, self.state.sessions.timeout().as_secs())
    }
}

impl MethodHandler for PublisherHandler {
    async fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let result = match request.method.as_str() {
            "OPTIONS" => Ok(self.handle_options()),
            "ANNOUNCE" => self.handle_announce(request),
            "SETUP" => self.handle_setup(request),
            "RECORD" => self.handle_record(request).await,
            "TEARDOWN" => self.handle_teardown(request).await,
            _ => {
                tracing::warn!(method = %request.method, uri = %request.uri, "unsupported publisher method");
                Ok(RtspResponse::not_implemented())
            }
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                status = e.status_code(),
                error = %e,
                "publisher request rejected"
            );
            RtspResponse::from_error(&e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::server::ServerConfig;

    fn state(rtp_port_start: u16, hooks: Hooks) -> RelayState {
        let config = ServerConfig {
            bind_host: "127.0.0.1".parse().unwrap(),
            rtp_port_start,
            rtp_port_count: 20,
            ..ServerConfig::default()
        };
        RelayState::new(&config, hooks)
    }

    fn handler(state: &RelayState) -> PublisherHandler {
        PublisherHandler::new(state.clone(), "127.0.0.1:40000".parse().unwrap())
    }

    fn request(raw: &str) -> RtspRequest {
        RtspRequest::parse(raw).unwrap()
    }

    fn announce(body: &str) -> RtspRequest {
        request("ANNOUNCE rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .with_body(body.to_string())
    }

    fn setup(stream_id: u32) -> RtspRequest {
        request(&format!(
            "SETUP rtsp://localhost:5554/live/streamid={stream_id} RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP/UDP;unicast;client_port=5000-5001;mode=record\r\n\r\n"
        ))
    }

    #[tokio::test]
    async fn second_announce_is_503() {
        let state = state(45000, Hooks::new());
        let mut h = handler(&state);

        let first = h.handle(&announce("v=0\r\n")).await;
        assert_eq!(first.status_code, 200);
        assert!(first.header("Session").unwrap().ends_with(";timeout=60"));

        let second = h.handle(&announce("v=0\r\n")).await;
        assert_eq!(second.status_code, 503);
        assert_eq!(state.mounts.get("/live").unwrap().sdp(), "v=0\r\n");
    }

    #[tokio::test]
    async fn setups_get_consecutive_server_ports() {
        let state = state(10000, Hooks::new());
        let mut h = handler(&state);
        h.handle(&announce("v=0\r\n")).await;

        let s0 = h.handle(&setup(0)).await;
        let s1 = h.handle(&setup(1)).await;
        assert!(s0.header("Transport").unwrap().ends_with(";server_port=10000-10001"));
        assert!(s1.header("Transport").unwrap().ends_with(";server_port=10002-10003"));

        let again = h.handle(&setup(0)).await;
        assert!(again.header("Transport").unwrap().ends_with(";server_port=10000-10001"));
    }

    #[tokio::test]
    async fn setup_rejections() {
        let state = state(45100, Hooks::new());
        let mut h = handler(&state);

        assert_eq!(h.handle(&setup(0)).await.status_code, 404);

        h.handle(&announce("v=0\r\n")).await;
        let tcp = request(
            "SETUP rtsp://localhost:5554/live/streamid=0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        assert_eq!(h.handle(&tcp).await.status_code, 501);

        let no_stream = request(
            "SETUP rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 4\r\n\
             Transport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n",
        );
        assert_eq!(h.handle(&no_stream).await.status_code, 454);
    }

    #[tokio::test]
    async fn record_requires_the_announce_session() {
        let state = state(45200, Hooks::new());
        let mut h = handler(&state);
        let session = h
            .handle(&announce("v=0\r\n"))
            .await
            .header("Session")
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        h.handle(&setup(0)).await;

        let wrong = request("RECORD rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 5\r\nSession: 00\r\n\r\n");
        assert_eq!(h.handle(&wrong).await.status_code, 454);

        let record = request(&format!(
            "RECORD rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 6\r\nSession: {session}\r\nRange: npt=0.000-\r\n\r\n"
        ));
        let response = h.handle(&record).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.header("Range"), Some("npt=0.000-"));

        let mount = state.mounts.get("/live").unwrap();
        assert!(mount.stream(0).unwrap().is_recording());

        let teardown = request("TEARDOWN rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 7\r\n\r\n");
        assert_eq!(h.handle(&teardown).await.status_code, 200);
        assert!(state.mounts.get("/live").is_none());
        assert_eq!(state.pool.available(), 10);
    }

    #[tokio::test]
    async fn credentials_checked_before_the_verb() {
        let hooks = Hooks::new().with_authenticate(|user, pass| user == "enc" && pass == "pw");
        let state = state(45300, hooks);
        let mut h = handler(&state);

        let response = h.handle(&announce("v=0\r\n")).await;
        assert_eq!(response.status_code, 401);
        assert_eq!(response.header("WWW-Authenticate"), Some("Basic realm=\"rtsp\""));
        assert!(state.mounts.is_empty());

        let authed = request(
            "ANNOUNCE rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 1\r\nAuthorization: Basic ZW5jOnB3\r\n\r\n",
        );
        assert_eq!(h.handle(&authed).await.status_code, 200);

        let options = request("OPTIONS * RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert_eq!(h.handle(&options).await.status_code, 200);
    }

    #[tokio::test]
    async fn unknown_method_is_501() {
        let state = state(45400, Hooks::new());
        let describe = request("DESCRIBE rtsp://localhost:5554/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert_eq!(handler(&state).handle(&describe).await.status_code, 501);
    }
}
