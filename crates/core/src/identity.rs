//! Client identity resolution.
//!
//! Maps an inbound request to a stable `ClientIdentity`: the network origin
//! plus a fingerprint hash derived from stable request headers. The rest of
//! the core treats both as opaque strings — the fingerprint is attached to
//! rate-window entries for diagnostics only and never participates in
//! admission decisions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An identified caller. Stable for the lifetime of a session; never
/// persisted beyond the admission window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Network origin — forwarded client address or peer address.
    pub identifier: String,

    /// Short hex hash over stable request headers, for diagnostics.
    pub fingerprint: String,
}

impl ClientIdentity {
    pub fn new(identifier: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// Resolve an identity from request metadata.
///
/// `forwarded_for` is the raw `x-forwarded-for` header if present; the
/// first hop wins. `peer_addr` is the transport-level fallback.
/// `fingerprint_parts` are whichever stable headers the caller has
/// (user-agent, accept-language, …) in a fixed order.
pub fn resolve_identity(
    forwarded_for: Option<&str>,
    peer_addr: &str,
    fingerprint_parts: &[&str],
) -> ClientIdentity {
    let identifier = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(peer_addr)
        .to_string();

    ClientIdentity {
        identifier,
        fingerprint: fingerprint_hash(fingerprint_parts),
    }
}

/// Hash an ordered list of header values into a short hex fingerprint.
pub fn fingerprint_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    let digest = hasher.finalize();
    // 16 hex chars is plenty for a diagnostic tag.
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
