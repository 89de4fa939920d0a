//! Basic authentication gate (RFC 2617 §2, as used by RTSP).
//!
//! Credentials are verified on every request through
//! [`Hooks::authenticate`](crate::hooks::Hooks); nothing is cached per
//! connection or session.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{Result, RtspError};
use crate::hooks::Hooks;
use crate::protocol::RtspRequest;

/// Decode an `Authorization: Basic <b64(user:pass)>` header value.
pub fn basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Check the request against the authentication hook, if one is set.
pub fn authorize(request: &RtspRequest, hooks: &Hooks) -> Result<()> {
    let Some(authenticate) = &hooks.authenticate else {
        return Ok(());
    };

    let (user, pass) = request
        .get_header("Authorization")
        .and_then(basic_credentials)
        .ok_or(RtspError::Unauthenticated)?;

    if authenticate(&user, &pass) {
        Ok(())
    } else {
        tracing::warn!(user = %user, method = %request.method, uri = %request.uri, "credentials rejected");
        Err(RtspError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>) -> RtspRequest {
        let mut raw = "ANNOUNCE rtsp://h/live RTSP/1.0\r\nCSeq: 1\r\n".to_string();
        if let Some(value) = auth {
            raw.push_str(&format!("Authorization: {value}\r\n"));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    #[test]
    fn decodes_basic_header() {
        let header = format!("Basic {}", BASE64_STANDARD.encode("user:p:ss"));
        assert_eq!(
            basic_credentials(&header),
            Some(("user".to_string(), "p:ss".to_string()))
        );
        assert!(basic_credentials("Digest abc").is_none());
        assert!(basic_credentials("Basic !!!").is_none());
    }

    #[test]
    fn no_hook_means_open() {
        assert!(authorize(&request(None), &Hooks::new()).is_ok());
    }

    #[test]
    fn hook_is_consulted_per_request() {
        let hooks = Hooks::new().with_authenticate(|u, p| u == "enc" && p == "pw");
        let good = format!("Basic {}", BASE64_STANDARD.encode("enc:pw"));
        let bad = format!("Basic {}", BASE64_STANDARD.encode("enc:nope"));

        assert!(authorize(&request(Some(&good)), &hooks).is_ok());
        assert!(matches!(
            authorize(&request(Some(&bad)), &hooks),
            Err(RtspError::Unauthenticated)
        ));
        assert!(matches!(
            authorize(&request(None), &hooks),
            Err(RtspError::Unauthenticated)
        ));
    }
}
