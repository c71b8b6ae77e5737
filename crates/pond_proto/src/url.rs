//! `pondserver` URLs.
//!
//! A server is named by its 32-byte identity public key, carried base32 in
//! the user-info portion: `pondserver://<base32-id>@<host>`. In production
//! the host must be a `.onion` name (or `localhost`), no explicit port is
//! allowed, and connections go to port 16333. Testing mode relaxes both so
//! a local server on any port works.
//!
//! Detachments add a path: `pondserver://<id>@<host>/<hex identity>/<hex file id>`.

use data_encoding::BASE32_NOPAD;
use url::Url;

use crate::error::ProtoError;

pub const SERVER_PORT: u16 = 16333;

/// Where a detachment lives: the holding server plus the uploader's
/// identity and the 64-bit file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachmentLocation {
    pub server: String,
    pub from: [u8; 32],
    pub id: u64,
}

fn bad(msg: &str) -> ProtoError {
    ProtoError::BadUrl(msg.to_string())
}

/// Accepts base32 with or without trailing padding.
fn decode_base32(s: &str) -> Result<Vec<u8>, ProtoError> {
    BASE32_NOPAD
        .decode(s.trim_end_matches('=').as_bytes())
        .map_err(|e| bad(&format!("bad base32: {e}")))
}

/// Parses a server URL into its identity and the host:port to dial.
pub fn parse_server(server: &str, testing: bool) -> Result<([u8; 32], String), ProtoError> {
    let url = Url::parse(server).map_err(|e| bad(&e.to_string()))?;
    if url.scheme() != "pondserver" {
        return Err(bad("bad URL scheme, should be pondserver"));
    }
    let user = url.username();
    if user.is_empty() {
        return Err(bad("no server ID in URL"));
    }
    let id_bytes = decode_base32(user)?;
    let identity: [u8; 32] = id_bytes
        .try_into()
        .map_err(|_| bad("bad server ID length"))?;
    let host = url.host_str().ok_or_else(|| bad("no host in URL"))?;

    let addr = if testing {
        format!("{host}:{}", url.port().unwrap_or(SERVER_PORT))
    } else {
        if url.port().is_some() {
            return Err(bad("URL contains a port number"));
        }
        if !host.ends_with(".onion") && host != "localhost" {
            return Err(bad("host is neither a .onion address nor localhost"));
        }
        format!("{host}:{SERVER_PORT}")
    };
    Ok((identity, addr))
}

/// Formats a server URL from its identity and host.
pub fn format_server(identity: &[u8; 32], host: &str) -> String {
    format!("pondserver://{}@{}", BASE32_NOPAD.encode(identity), host)
}

/// Parses a detachment URL into the server to dial and the file coordinates.
pub fn parse_detachment(detachment: &str) -> Result<DetachmentLocation, ProtoError> {
    let mut url = Url::parse(detachment)
        .map_err(|e| ProtoError::BadDetachmentUrl(e.to_string()))?;
    if url.scheme() != "pondserver" {
        return Err(ProtoError::BadDetachmentUrl("not a pondserver URL".into()));
    }
    let path = url.path().trim_start_matches('/').to_string();
    if path.is_empty() {
        return Err(ProtoError::BadDetachmentUrl("missing a path".into()));
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 2 {
        return Err(ProtoError::BadDetachmentUrl(
            "incorrect number of path elements".into(),
        ));
    }
    let from_bytes = hex::decode(parts[0])
        .map_err(|e| ProtoError::BadDetachmentUrl(format!("bad identity: {e}")))?;
    let from: [u8; 32] = from_bytes
        .try_into()
        .map_err(|_| ProtoError::BadDetachmentUrl("identity is wrong length".into()))?;
    let id = u64::from_str_radix(parts[1], 16)
        .map_err(|e| ProtoError::BadDetachmentUrl(format!("bad file id: {e}")))?;

    url.set_path("");
    Ok(DetachmentLocation {
        server: url.to_string(),
        from,
        id,
    })
}

/// Formats the URL a recipient needs to download an uploaded detachment.
pub fn format_detachment(server: &str, from: &[u8; 32], id: u64) -> Result<String, ProtoError> {
    let mut url =
        Url::parse(server).map_err(|e| ProtoError::BadDetachmentUrl(e.to_string()))?;
    url.set_path(&format!("{}/{:x}", hex::encode(from), id));
    Ok(url.to_string())
}
