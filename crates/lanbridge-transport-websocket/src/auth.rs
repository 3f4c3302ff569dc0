//! Shared-secret Basic authentication for the tunnel handshake (RFC 7617 header format)
//!
//! ```text
//! Authorization: Basic <base64(username:password)>
//! ```
//!
//! The broker compares the literal header value against the one derived from
//! its own secret. There is no user database behind it.

use base64::Engine;
use tracing::debug;

/// Realm announced in `WWW-Authenticate` on rejection
pub const REALM: &str = "TCP-Forward-Serv";

/// Body returned with a 401
pub const UNAUTHORIZED_BODY: &str =
    "401: Not Authenticated!username and password do not match to configuration";

/// Basic credentials derived from a `username:password` secret
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    header_value: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").finish_non_exhaustive()
    }
}

impl BasicAuth {
    /// Build from a `username:password` string
    pub fn new(secret: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret.as_bytes());
        Self {
            header_value: format!("Basic {}", encoded),
        }
    }

    /// `None` for an empty or missing secret, meaning no authentication
    pub fn from_secret(secret: Option<&str>) -> Option<Self> {
        secret.filter(|s| !s.is_empty()).map(Self::new)
    }

    /// Value for the `Authorization` header
    pub fn header_value(&self) -> &str {
        &self.header_value
    }

    /// Literal comparison of a received `Authorization` header
    pub fn matches(&self, header: Option<&str>) -> bool {
        let ok = header == Some(self.header_value.as_str());
        if !ok {
            debug!("Authorization header did not match configured secret");
        }
        ok
    }
}

/// Check a request header against an optional secret. No secret allows everything.
pub fn authorize(expected: Option<&BasicAuth>, header: Option<&str>) -> bool {
    match expected {
        Some(auth) => auth.matches(header),
        None => true,
    }
}
