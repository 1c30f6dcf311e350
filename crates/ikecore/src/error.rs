//! Error types for IKE and security policy operations
//!
//! This module defines a unified error type shared by both IKE versions,
//! the policy/SA databases and the crypto provider seam, plus the
//! [`ErrorCollector`] used to record non-fatal cleanup failures.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::ikev2::constants::NotifyType;

/// Result type for IKE operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKE and SPD errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument passed by the caller
    InvalidParameter(String),

    /// Invalid IKE message format
    InvalidMessage(String),

    /// Invalid IKE payload
    InvalidPayload(String),

    /// A payload required in this exchange is missing
    MissingPayload(String),

    /// Unsupported protocol version
    UnsupportedVersion(u8),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// No acceptable proposal found
    NoProposalChosen,

    /// First proposal number was not 1, or numbers were not sequential
    InvalidProposalNumber(u8),

    /// Protocol identifier not valid in this context
    InvalidProtocol(u8),

    /// Peer guessed the wrong Diffie-Hellman group
    InvalidKePayload {
        /// Group the local policy requires
        expected_group: u16,
    },

    /// Traffic selectors do not match any policy
    TsUnacceptable,

    /// Requested key material exceeds what the PRF can produce
    KeyMaterialTooLong {
        /// Bytes requested
        requested: usize,
        /// Upper bound (255 x PRF output length)
        max: usize,
    },

    /// Key has the wrong length for the algorithm
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Cryptographic operation failed
    CryptoError(String),

    /// Authentication failed
    AuthenticationFailed(String),

    /// Received hash did not match the locally computed one
    VerifyFailed(String),

    /// Security Association not found
    SaNotFound(String),

    /// No policy matched
    PolicyNotFound,

    /// Generic lookup failure
    NotFound(String),

    /// Invalid Security Parameter Index
    InvalidSpi(u32),

    /// State machine error
    InvalidState(String),

    /// Message arrived from an address other than the SA's peer
    AddressMismatch {
        /// Address recorded in the SA
        expected: IpAddr,
        /// Source address of the message
        actual: IpAddr,
    },

    /// Message ID outside the expected window
    InvalidMessageId {
        /// Expected message ID
        expected: u32,
        /// Received message ID
        actual: u32,
    },

    /// Peer reported an error-class notification
    Notified(u16),

    /// Policy requires the packet to be dropped
    PacketDiscard,

    /// Bounded wait on a resource lock expired
    LockTimeout(String),

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Message too large
    MessageTooLarge(u32),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Notification type to report back to the peer for this error,
    /// if the error is one the peer should be told about.
    pub fn notify_type(&self) -> Option<NotifyType> {
        match self {
            Error::NoProposalChosen | Error::InvalidProposalNumber(_) => {
                Some(NotifyType::NoProposalChosen)
            }
            Error::InvalidKePayload { .. } => Some(NotifyType::InvalidKePayload),
            Error::AuthenticationFailed(_) | Error::VerifyFailed(_) => {
                Some(NotifyType::AuthenticationFailed)
            }
            Error::TsUnacceptable => Some(NotifyType::TsUnacceptable),
            Error::InvalidMessage(_)
            | Error::InvalidPayload(_)
            | Error::MissingPayload(_)
            | Error::InvalidLength { .. }
            | Error::BufferTooShort { .. } => Some(NotifyType::InvalidSyntax),
            Error::InvalidSpi(_) => Some(NotifyType::InvalidSpi),
            Error::InvalidMessageId { .. } => Some(NotifyType::InvalidMessageId),
            Error::UnsupportedVersion(_) => Some(NotifyType::InvalidMajorVersion),
            _ => None,
        }
    }

    /// Whether this error is terminal for the negotiation
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailed(_) | Error::VerifyFailed(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidMessage(msg) => write!(f, "Invalid IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::MissingPayload(name) => write!(f, "Missing required payload: {}", name),
            Error::UnsupportedVersion(v) => {
                write!(f, "Unsupported IKE version: 0x{:02x}", v)
            }
            Error::UnsupportedExchangeType(t) => {
                write!(f, "Unsupported exchange type: {}", t)
            }
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::InvalidProposalNumber(n) => write!(f, "Invalid proposal number: {}", n),
            Error::InvalidProtocol(p) => write!(f, "Invalid protocol identifier: {}", p),
            Error::InvalidKePayload { expected_group } => {
                write!(f, "Invalid KE payload, expected DH group {}", expected_group)
            }
            Error::TsUnacceptable => write!(f, "Traffic selectors unacceptable"),
            Error::KeyMaterialTooLong { requested, max } => {
                write!(
                    f,
                    "Key material too long: requested {} bytes, PRF+ limit is {}",
                    requested, max
                )
            }
            Error::InvalidKeyLength { expected, actual } => {
                write!(f, "Invalid key length: expected {}, got {}", expected, actual)
            }
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::VerifyFailed(what) => write!(f, "Verification failed: {}", what),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::PolicyNotFound => write!(f, "No matching security policy"),
            Error::NotFound(what) => write!(f, "Not found: {}", what),
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::AddressMismatch { expected, actual } => {
                write!(
                    f,
                    "Source address mismatch: SA peer is {}, message from {}",
                    expected, actual
                )
            }
            Error::InvalidMessageId { expected, actual } => {
                write!(f, "Invalid message ID: expected {}, got {}", expected, actual)
            }
            Error::Notified(t) => write!(f, "Peer reported error notification {}", t),
            Error::PacketDiscard => write!(f, "Packet discarded by policy"),
            Error::LockTimeout(what) => write!(f, "Timed out waiting for lock: {}", what),
            Error::InvalidLength { expected, actual } => {
                write!(
                    f,
                    "Invalid length: expected {}, got {}",
                    expected, actual
                )
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::MessageTooLarge(size) => {
                write!(f, "IKE message too large: {} bytes", size)
            }
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// A failure recorded on a secondary cleanup path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedError {
    /// Where the failure happened
    pub context: String,
    /// The failure itself
    pub error: Error,
}

/// Side channel for non-fatal failures
///
/// Cleanup helpers (timer cancellation, SA removal during teardown)
/// report here instead of aborting the primary flow. Clones share the
/// same underlying list.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    entries: Arc<Mutex<Vec<CollectedError>>>,
}

impl ErrorCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-fatal failure and log it
    pub fn record(&self, context: impl Into<String>, error: Error) {
        let context = context.into();
        crate::logging::log_cleanup_failure(&context, &error);

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(CollectedError { context, error });
    }

    /// Record the error of a result, if any, and discard the value
    pub fn check<T>(&self, context: &str, result: Result<T>) {
        if let Err(e) = result {
            self.record(context, e);
        }
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<CollectedError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid IKE message: test");

        let err = Error::UnsupportedVersion(0x30);
        assert_eq!(err.to_string(), "Unsupported IKE version: 0x30");

        let err = Error::KeyMaterialTooLong {
            requested: 8200,
            max: 8160,
        };
        assert!(err.to_string().contains("8200"));
        assert!(err.to_string().contains("8160"));
    }

    #[test]
    fn test_error_clone() {
        let err1 = Error::InvalidKePayload { expected_group: 14 };
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_notify_type_mapping() {
        assert_eq!(
            Error::NoProposalChosen.notify_type(),
            Some(NotifyType::NoProposalChosen)
        );
        assert_eq!(
            Error::InvalidKePayload { expected_group: 2 }.notify_type(),
            Some(NotifyType::InvalidKePayload)
        );
        assert_eq!(
            Error::VerifyFailed("HASH_I".into()).notify_type(),
            Some(NotifyType::AuthenticationFailed)
        );
        assert_eq!(Error::LockTimeout("spd".into()).notify_type(), None);
        assert_eq!(Error::PacketDiscard.notify_type(), None);
    }

    #[test]
    fn test_collector_records_and_drains() {
        let collector = ErrorCollector::new();
        assert!(collector.is_empty());

        let shared = collector.clone();
        shared.record("timer cancel", Error::NotFound("event".into()));
        collector.check::<()>("sa removal", Err(Error::SaNotFound("0x1".into())));
        collector.check("noop", Ok(5u8));

        assert_eq!(collector.len(), 2);
        let entries = collector.drain();
        assert_eq!(entries[0].context, "timer cancel");
        assert_eq!(entries[1].error, Error::SaNotFound("0x1".into()));
        assert!(shared.is_empty());
    }
}
