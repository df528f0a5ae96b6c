//! # Error Types
//!
//! Error handling for the discovery protocol engine.
//!
//! This module defines all error variants that can occur while resolving
//! constraints, encoding or decoding discovery datagrams, and running the
//! unicast discovery handshake.
//!
//! ## Error Categories
//! - **Protocol Errors**: malformed or truncated input, wrong version or packet
//!   type, unknown format identifier, item too long, negotiation failure
//! - **Constraint Errors**: conflicting or unsatisfiable caller constraints
//! - **Authorization Errors**: rejections raised by a client subject checker
//! - **I/O Errors**: datagram and stream failures, passed through unmodified
//!
//! ## Example Usage
//! ```rust
//! use discovery_protocol::error::{DiscoveryError, Result};
//!
//! fn require_v2(version: i32) -> Result<()> {
//!     if version != 2 {
//!         return Err(DiscoveryError::UnsupportedVersion(version));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_v2(1).unwrap_err().is_protocol_error());
//! ```

use crate::format::FormatId;
use crate::security::AccessDenied;
use std::borrow::Cow;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Decoding errors
    pub const ERR_TRUNCATED: &str = "Datagram truncated";
    pub const ERR_TRUNCATED_STREAM: &str = "Unicast stream ended early";
    pub const ERR_COUNT_EXCEEDS_BUFFER: &str = "Element count exceeds remaining buffer";
    pub const ERR_INVALID_UTF8: &str = "Invalid UTF-8 in string field";
    pub const ERR_TRAILING_BYTES: &str = "Unexpected trailing bytes";

    /// Encoding errors
    pub const ERR_PACKET_TOO_SMALL: &str = "Maximum packet size below protocol minimum";

    /// Constraint errors
    pub const ERR_VERSION_CONFLICT: &str = "Protocol version constraints conflict";
    pub const ERR_NO_SUPPORTED_VERSION: &str = "No supported protocol version allowed";
    pub const ERR_MIXED_ALTERNATIVES: &str =
        "Constraint alternatives span multiple discovery constraint types";
    pub const ERR_SECURITY_UNSUPPORTED: &str = "Format cannot satisfy security requirement";

    /// Negotiation errors
    pub const ERR_NO_FORMATS: &str = "No unicast discovery formats available";
    pub const ERR_SERVER_REJECTED: &str = "Server rejected all proposed formats";
    pub const ERR_UNPROPOSED_FORMAT: &str = "Server selected a format that was not proposed";
    pub const ERR_NO_MATCHING_FORMAT: &str = "No proposed format is acceptable";

    /// Integrity errors
    pub const ERR_MAC_MISMATCH: &str = "Integrity check failed";

    /// Internal errors
    pub const ERR_CACHE_READ_LOCK: &str = "Failed to acquire read lock on discovery cache";
    pub const ERR_CACHE_WRITE_LOCK: &str = "Failed to acquire write lock on discovery cache";
}

/// Primary error type for all discovery operations
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(i32),

    #[error("Unexpected packet type: expected {expected}, found {found}")]
    UnexpectedPacketType { expected: u8, found: u8 },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(FormatId),

    #[error("{kind} too long: {len} bytes does not fit in {capacity}-byte packet")]
    ItemTooLong {
        kind: &'static str,
        len: usize,
        capacity: usize,
    },

    #[error("Format negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Malformed input: {message}")]
    Malformed {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Unsupported constraint: {0}")]
    UnsupportedConstraint(String),

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiscoveryError {
    /// Malformed input without an underlying cause
    pub fn malformed(message: impl Into<Cow<'static, str>>) -> Self {
        DiscoveryError::Malformed {
            message: message.into(),
            source: None,
        }
    }

    /// Malformed input caused by a lower-level parse failure
    pub fn malformed_by<E>(message: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DiscoveryError::Malformed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for corrupt packets and incompatible peers
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DiscoveryError::UnsupportedVersion(_)
                | DiscoveryError::UnexpectedPacketType { .. }
                | DiscoveryError::UnsupportedFormat(_)
                | DiscoveryError::ItemTooLong { .. }
                | DiscoveryError::NegotiationFailed(_)
                | DiscoveryError::Malformed { .. }
        )
    }

    /// True when caller-supplied constraints cannot be satisfied
    pub fn is_constraint_error(&self) -> bool {
        matches!(self, DiscoveryError::UnsupportedConstraint(_))
    }

    /// Authorization failures and caller programming errors never succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DiscoveryError::Io(_) | DiscoveryError::NegotiationFailed(_))
    }
}

/// Type alias for Results using DiscoveryError
pub type Result<T> = std::result::Result<T, DiscoveryError>;
