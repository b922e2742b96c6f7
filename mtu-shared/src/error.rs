//! Error types shared across the hub and the client SDK.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type MtuResult<T> = Result<T, MtuError>;

/// Errors raised while correlating, caching, or transporting IEC-104 messages.
#[derive(Debug, Error)]
pub enum MtuError {
    #[error("unknown RTU for COA {coa}")]
    UnknownCoa { coa: u32 },

    #[error("unknown information object {coa}:{ioa}")]
    UnknownIoa { coa: u32, ioa: u32 },

    #[error("collision on {coa}:{ioa}, already active under reference {reference_nr}")]
    Collision {
        coa: u32,
        ioa: u32,
        reference_nr: String,
    },

    #[error("cache entry for {coa}:{ioa} missing where an active command was expected")]
    MissingCacheEntry { coa: u32, ioa: u32 },

    #[error("reference number '{0}' is reserved for hub-initiated messages")]
    ReservedReferencePrefix(String),

    #[error("unsupported message combination: {0}")]
    PolicyUnsupported(String),

    #[error("network send failed after retries: {0}")]
    SendFailed(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("invalid subscriber handshake: {0}")]
    InvalidHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl MtuError {
    pub fn unknown_coa(coa: u32) -> Self {
        Self::UnknownCoa { coa }
    }

    pub fn unknown_ioa(coa: u32, ioa: u32) -> Self {
        Self::UnknownIoa { coa, ioa }
    }

    pub fn collision(coa: u32, ioa: u32, reference_nr: impl Into<String>) -> Self {
        Self::Collision {
            coa,
            ioa,
            reference_nr: reference_nr.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the caller could reasonably retry the operation that produced this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SendFailed(_) | Self::Timeout { .. } | Self::ChannelClosed(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_is_not_recoverable() {
        let err = MtuError::collision(1, 2, "APP_1");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn timeout_is_recoverable() {
        let err = MtuError::timeout("send");
        assert!(err.is_recoverable());
    }

    #[test]
    fn display_unknown_ioa() {
        let err = MtuError::unknown_ioa(14, 9001);
        assert_eq!(format!("{err}"), "unknown information object 14:9001");
    }

    #[test]
    fn reserved_prefix_rejected() {
        let err = MtuError::ReservedReferencePrefix("MTU".to_string());
        assert!(format!("{err}").contains("reserved"));
    }
}
