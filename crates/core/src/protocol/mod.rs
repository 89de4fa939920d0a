//! RTSP protocol implementation (RFC 2326), split by role.
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! requests, building responses, and routing methods for the two roles
//! the relay plays.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! ANNOUNCE rtsp://server:5554/live RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 120\r\n
//! \r\n
//! v=0 ...
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Publisher | Subscriber |
//! |--------|-------------|-----------|------------|
//! | OPTIONS | §10.1 | capability discovery | capability discovery, keepalive |
//! | ANNOUNCE | §10.3 | create mount with SDP | - |
//! | DESCRIBE | §10.2 | - | return the mount's SDP |
//! | SETUP | §10.4 | allocate a stream port pair | bind a client transport |
//! | RECORD | §10.11 | bind stream listeners | - |
//! | PLAY | §10.5 | - | start relaying to the session |
//! | TEARDOWN | §10.7 | destroy the mount | close the session |
//!
//! Anything else is answered `501 Not Implemented`.

pub mod auth;
pub mod interleaved;
pub mod publisher;
pub mod request;
pub mod response;
pub mod subscriber;

use std::future::Future;

pub use publisher::PublisherHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use subscriber::SubscriberHandler;

/// Handles the RTSP requests of a single TCP connection.
///
/// One handler is created per accepted connection and dropped when it
/// closes.
pub trait MethodHandler: Send + 'static {
    /// Produce the response to one request. `CSeq` is echoed by the caller.
    fn handle(&mut self, request: &RtspRequest) -> impl Future<Output = RtspResponse> + Send;

    /// A `$`-framed packet arrived on the control connection.
    fn on_interleaved(&mut self, _channel: u8, _payload: &[u8]) {}

    /// The connection closed; release whatever it owned.
    fn on_disconnect(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
