//! Error taxonomy.
//!
//! Transient transport failures are retried inside the gateway and only
//! surface after exhaustion; auth expiry goes through the refresh protocol
//! first. Everything else is fatal for the affected task only — the batch
//! keeps running.

use thiserror::Error;

/// Remote business code for rate limiting.
pub const CODE_RATE_LIMITED: i64 = 99_991_400;
/// Remote business codes signalling an expired or invalid access token.
pub const CODES_TOKEN_EXPIRED: &[i64] = &[99_991_663, 99_991_677];

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection reset, timeout, DNS failure. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-zero business code from the remote service, after retries.
    #[error("remote api error {code}: {msg}")]
    Api { code: i64, msg: String },

    /// Token expired and both refresh and re-login failed (or were not
    /// possible in this context).
    #[error("access token expired: {0}")]
    AuthExpired(String),

    /// Client-side invariant violation: wrong token kind, malformed config,
    /// unreadable local file. Fatal for the affected task.
    #[error("invalid sync target: {0}")]
    InvalidTarget(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn api(code: i64, msg: impl Into<String>) -> Self {
        SyncError::Api {
            code,
            msg: msg.into(),
        }
    }

    /// Whether a business code should be retried with backoff.
    pub fn code_is_retryable(code: i64) -> bool {
        code == CODE_RATE_LIMITED
    }

    /// Whether a business code means the access token must be refreshed.
    pub fn code_is_token_expired(code: i64) -> bool {
        CODES_TOKEN_EXPIRED.contains(&code)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_code_is_retryable() {
        assert!(SyncError::code_is_retryable(CODE_RATE_LIMITED));
        assert!(!SyncError::code_is_retryable(0));
        assert!(!SyncError::code_is_retryable(1_254_043));
    }

    #[test]
    fn expired_token_codes_trigger_refresh() {
        assert!(SyncError::code_is_token_expired(99_991_663));
        assert!(SyncError::code_is_token_expired(99_991_677));
        assert!(!SyncError::code_is_token_expired(99_991_400));
    }
}
