//! Interleaved binary data on the RTSP control connection (RFC 2326 §10.12).
//!
//! ```text
//! +------+---------+-----------------+------------------+
//! | 0x24 | channel | length (u16 BE) | payload...       |
//! +------+---------+-----------------+------------------+
//! ```

use crate::error::{Result, RtspError};

/// First byte of every interleaved frame (`$`).
pub const MAGIC: u8 = 0x24;

/// Size of the frame header.
pub const HEADER_LEN: usize = 4;

/// One decoded interleaved frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

/// Frame `payload` for `channel`.
pub fn encode(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| RtspError::FrameTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(MAGIC);
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame header into `(channel, payload length)`.
///
/// Returns `None` when the header does not start with [`MAGIC`].
pub fn parse_header(header: [u8; HEADER_LEN]) -> Option<(u8, usize)> {
    if header[0] != MAGIC {
        return None;
    }
    Some((header[1], usize::from(u16::from_be_bytes([header[2], header[3]]))))
}

/// Decode the frame at the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` if
/// `buf` does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> Option<(InterleavedFrame, usize)> {
    let header: [u8; HEADER_LEN] = buf.get(..HEADER_LEN)?.try_into().ok()?;
    let (channel, len) = parse_header(header)?;
    let payload = buf.get(HEADER_LEN..HEADER_LEN + len)?;
    Some((
        InterleavedFrame {
            channel,
            payload: payload.to_vec(),
        },
        HEADER_LEN + len,
    ))
}
