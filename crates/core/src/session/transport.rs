use crate::error::{Result, RtspError};

/// Parsed RTSP `Transport` header (RFC 2326 §12.39).
///
/// Only the parameters the relay acts on are extracted; the raw value is
/// kept so the reply can echo it back with `server_port` appended.
///
/// ## Wire format examples
///
/// ```text
/// UDP:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=10000-10001
///
/// TCP interleaved:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone)]
pub struct TransportHeader {
    raw: String,
    /// Lower transport mentions TCP anywhere in the header.
    pub tcp: bool,
    /// `client_port=RTP-RTCP`, if present and well-formed.
    pub client_port: Option<(u16, u16)>,
    /// `interleaved=RTP-RTCP`, if present and well-formed.
    pub interleaved: Option<(u8, u8)>,
}

/// How a subscriber wants its media delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRequest {
    Udp { client_rtp_port: u16, client_rtcp_port: u16 },
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// Never fails; missing or garbled parameters are simply absent.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001");
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    /// assert!(!th.tcp);
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3");
    /// assert_eq!(th.interleaved, Some((2, 3)));
    /// ```
    pub fn parse(header: &str) -> Self {
        let mut client_port = None;
        let mut interleaved = None;

        for part in header.split(';') {
            let part = part.trim();
            if let Some(ports) = part.strip_prefix("client_port=") {
                client_port = parse_pair::<u16>(ports);
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                interleaved = parse_pair::<u8>(channels);
            }
        }

        TransportHeader {
            raw: header.trim().to_string(),
            tcp: header.to_ascii_lowercase().contains("tcp"),
            client_port,
            interleaved,
        }
    }

    /// Whether the client asked for interleaved delivery over its TCP
    /// control connection.
    pub fn is_interleaved(&self) -> bool {
        self.tcp && self.raw.to_ascii_lowercase().contains("interleaved")
    }

    /// TCP was requested but no interleave channels were offered.
    pub fn is_bare_tcp(&self) -> bool {
        self.tcp && !self.is_interleaved()
    }

    /// Decide the delivery variant, failing with
    /// [`RtspError::MalformedTransportHeader`] if its parameter is missing.
    pub fn request(&self) -> Result<TransportRequest> {
        if self.is_interleaved() {
            let (rtp_channel, rtcp_channel) = self
                .interleaved
                .ok_or_else(|| RtspError::MalformedTransportHeader(self.raw.clone()))?;
            Ok(TransportRequest::Interleaved {
                rtp_channel,
                rtcp_channel,
            })
        } else {
            let (client_rtp_port, client_rtcp_port) = self
                .client_port
                .ok_or_else(|| RtspError::MalformedTransportHeader(self.raw.clone()))?;
            Ok(TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            })
        }
    }

    /// The header as received, with `server_port=RTP-RTCP` appended.
    pub fn with_server_port(&self, rtp: u16, rtcp: u16) -> String {
        format!("{};server_port={}-{}", self.raw, rtp, rtcp)
    }

    /// The header as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// `A-B`, or a lone `A` meaning `A-(A+1)`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let first: T = value.trim().parse().ok()?;
            let second = T::try_from(u32::from(first) + 1).ok()?;
            Some((first, second))
        }
    }
}
