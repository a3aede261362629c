//! Client identifier derivation.

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Bucket used when no usable identifier can be derived.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Longest identifier accepted before collapsing to [`UNKNOWN_CLIENT`].
const MAX_IDENTIFIER_LEN: usize = 256;

/// The key a client's requests are counted under.
///
/// Derived from the forwarded-for chain, the real-IP header, the peer
/// address, or an API key id. Anything malformed shares the single
/// `"unknown"` bucket instead of raising.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentifier(String);

impl ClientIdentifier {
    /// Sanitize a raw identifier.
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_well_formed(trimmed) {
            Self(trimmed.to_string())
        } else {
            Self::unknown()
        }
    }

    /// The anonymous bucket.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    /// Identify a client by its API key id.
    pub fn api_key(key_id: &str) -> Self {
        let id = Self::new(key_id);
        if id.is_unknown() {
            return id;
        }
        Self(format!("key:{}", id.0))
    }

    /// Identify a client from request headers, falling back to the peer
    /// address.
    ///
    /// Precedence: first `X-Forwarded-For` entry, `X-Real-IP`, peer.
    pub fn from_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(forwarded) = forwarded {
            return Self::new(forwarded);
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(real_ip) = real_ip {
            return Self::new(real_ip);
        }

        match peer {
            Some(ip) => Self(ip.to_string()),
            None => Self::unknown(),
        }
    }

    /// Whether this is the anonymous bucket.
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CLIENT
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_well_formed(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_IDENTIFIER_LEN
        && raw.chars().all(|c| c.is_ascii_graphic())
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
