// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the subnet driver.

use std::fmt;

use crate::types::MadStatus;

/// Errors surfaced by the subnet driver.
///
/// Transport and correlation failures are normally recovered internally
/// through retries; only retry exhaustion and structural errors reach a
/// client.
#[derive(Debug)]
pub enum SdError {
    // ========================================================================
    // Correlation / lookup
    // ========================================================================
    /// Handle, transaction or group does not match any live record.
    NotFound,
    /// Same client already holds this membership.
    Duplicate,

    // ========================================================================
    // Transient
    // ========================================================================
    /// Peer or transport reported a transient busy condition.
    Busy,
    /// No response before the retry budget ran out.
    Timeout,
    /// Target port has no valid management address yet.
    AddressingUnavailable,
    /// Transport refused the datagram.
    SendFailed(String),

    // ========================================================================
    // Structural
    // ========================================================================
    /// Transaction table, group table or transport buffers exhausted.
    InsufficientResources,
    /// Operation attempted against a record already torn down.
    InvalidState(String),
    /// Caller supplied an unusable argument.
    InvalidParameter(String),
    /// Peer answered with a non-success status.
    Rejected(MadStatus),
    /// Response could not be reassembled or decoded.
    MalformedResponse(String),

    // ========================================================================
    // Environment
    // ========================================================================
    /// Underlying socket or file error.
    Io(std::io::Error),
    /// Configuration could not be loaded or validated.
    Config(String),
    /// The driver is shutting down.
    Shutdown,
}

impl SdError {
    /// True for conditions that a retry may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SdError::Busy | SdError::Timeout | SdError::AddressingUnavailable | SdError::SendFailed(_)
        )
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::NotFound => write!(f, "No matching record"),
            SdError::Duplicate => write!(f, "Membership already exists"),
            SdError::Busy => write!(f, "Peer busy"),
            SdError::Timeout => write!(f, "Request timed out"),
            SdError::AddressingUnavailable => write!(f, "Port addressing not yet available"),
            SdError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            SdError::InsufficientResources => write!(f, "Insufficient resources"),
            SdError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SdError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            SdError::Rejected(status) => write!(f, "Request rejected with status {}", status),
            SdError::MalformedResponse(msg) => write!(f, "Malformed response: {}", msg),
            SdError::Io(e) => write!(f, "I/O error: {}", e),
            SdError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SdError::Shutdown => write!(f, "Subnet driver shut down"),
        }
    }
}

impl std::error::Error for SdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SdError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SdError {
    fn from(e: std::io::Error) -> Self {
        SdError::Io(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SdError::Busy.is_transient());
        assert!(SdError::Timeout.is_transient());
        assert!(SdError::AddressingUnavailable.is_transient());
        assert!(!SdError::InsufficientResources.is_transient());
        assert!(!SdError::InvalidState("gone".into()).is_transient());
    }

    #[test]
    fn test_display_carries_detail() {
        let err = SdError::Rejected(MadStatus(0x0300));
        assert!(err.to_string().contains("0x0300"));
        let err = SdError::InvalidParameter("timeout must be non-zero".into());
        assert_eq!(err.to_string(), "Invalid parameter: timeout must be non-zero");
    }

    #[test]
    fn test_io_source() {
        use std::error::Error;
        let err = SdError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
        assert!(SdError::Timeout.source().is_none());
    }
}
