use thiserror::Error;

/// Error taxonomy shared across the gateway components.
///
/// Control-plane handlers map these onto HTTP status codes; the dispatcher
/// inspects `Auth` to drive its one-shot refresh, and everything else is
/// logged and surfaced as a single short user-visible message.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token expired, invalid, or missing a usable subject claim.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Process-wide session cap reached.
    #[error("maximum concurrent sessions reached ({0})")]
    SessionLimit(usize),

    /// Resource missing or owned by a different user. Indistinguishable to
    /// the caller by design.
    #[error("not found")]
    NotFound,

    /// Transport-level fault (socket closed, polling failure). Recoverable
    /// through backoff unless the transport reports a permanent logout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream backend or agent-runtime fault.
    #[error("backend error: {0}")]
    Backend(String),

    /// Encrypted token could not be decrypted; the record needs re-pairing.
    #[error("stored token could not be decrypted")]
    Decrypt,

    /// Session persistence fault.
    #[error("session store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    /// True when the error text indicates an expired/invalid bearer token,
    /// which entitles the dispatcher to exactly one refresh-and-retry.
    pub fn is_auth_failure(message: &str) -> bool {
        let lowered = message.to_ascii_lowercase();
        lowered.contains("unauthorized") || lowered.contains("401")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_detection_matches_known_markers() {
        assert!(GatewayError::is_auth_failure("agent call failed: 401"));
        assert!(GatewayError::is_auth_failure("Unauthorized: token expired"));
        assert!(!GatewayError::is_auth_failure("connection reset by peer"));
    }
}
