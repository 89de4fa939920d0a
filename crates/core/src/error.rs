//! Error types for the RTSP relay library.

use std::fmt;

/// Errors that can occur in the relay.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Resource exhaustion**: [`NoPortsAvailable`](Self::NoPortsAvailable),
///   [`BindRetriesExceeded`](Self::BindRetriesExceeded).
/// - **Protocol**: [`Parse`](Self::Parse),
///   [`MalformedTransportHeader`](Self::MalformedTransportHeader),
///   [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`FrameTooLarge`](Self::FrameTooLarge).
/// - **Not found**: [`MountNotFound`](Self::MountNotFound),
///   [`StreamNotFound`](Self::StreamNotFound),
///   [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionMismatch`](Self::SessionMismatch).
/// - **Authorization**: [`Unauthenticated`](Self::Unauthenticated),
///   [`Forbidden`](Self::Forbidden).
/// - **Conflict**: [`MountAlreadyExists`](Self::MountAlreadyExists).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The RTP/RTCP port pool has no free pair left.
    #[error("no RTP/RTCP port pairs available")]
    NoPortsAvailable,

    /// Every pair tried while binding was already in use.
    #[error("gave up binding a port pair after {attempts} attempts")]
    BindRetriesExceeded { attempts: u32 },

    /// The `Transport` header lacks (or garbles) the parameter we need.
    #[error("malformed Transport header: {0}")]
    MalformedTransportHeader(String),

    /// The requested lower transport is not offered by this role.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// ANNOUNCE for a path that is already published.
    #[error("mount already exists: {0}")]
    MountAlreadyExists(String),

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The mount exists but has no stream with this id.
    #[error("stream {stream_id} not found on mount {path}")]
    StreamNotFound { path: String, stream_id: u32 },

    /// No session with the given ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The `Session` header does not belong to the addressed resource.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    /// Missing or rejected Basic credentials.
    #[error("authentication required")]
    Unauthenticated,

    /// The mount-allowed hook refused the request.
    #[error("access to {0} forbidden")]
    Forbidden(String),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// [`ServerConfig`](crate::ServerConfig) failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Payload does not fit the 16-bit length of an interleaved frame.
    #[error("interleaved payload of {0} bytes exceeds 65535")]
    FrameTooLarge(usize),
}

impl RtspError {
    /// Default RTSP status code for this error.
    ///
    /// The subscriber role answers unsupported transports with 504 instead
    /// of the 501 returned here.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse { .. } => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden(_) => 403,
            Self::MountNotFound(_) => 404,
            Self::StreamNotFound { .. } | Self::SessionNotFound(_) | Self::SessionMismatch(_) => {
                454
            }
            Self::UnsupportedTransport(_) => 501,
            Self::MountAlreadyExists(_) => 503,
            Self::Io(_)
            | Self::NoPortsAvailable
            | Self::BindRetriesExceeded { .. }
            | Self::MalformedTransportHeader(_)
            | Self::AlreadyRunning
            | Self::Config(_)
            | Self::FrameTooLarge(_) => 500,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(RtspError::MountAlreadyExists("/live".into()).status_code(), 503);
        assert_eq!(RtspError::MountNotFound("/x".into()).status_code(), 404);
        assert_eq!(RtspError::SessionNotFound("abc".into()).status_code(), 454);
        assert_eq!(RtspError::Unauthenticated.status_code(), 401);
        assert_eq!(RtspError::NoPortsAvailable.status_code(), 500);
        assert_eq!(
            RtspError::BindRetriesExceeded { attempts: 3 }.status_code(),
            500
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: RtspError = std::io::Error::from(std::io::ErrorKind::AddrInUse).into();
        assert!(matches!(err, RtspError::Io(_)));
        assert_eq!(err.status_code(), 500);
    }
}
