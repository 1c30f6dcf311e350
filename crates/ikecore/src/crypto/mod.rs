//! Cryptographic operations for IKE
//!
//! This module provides:
//! - Algorithm identifiers with their IKEv1/IKEv2 wire mappings
//! - The [`CryptoProvider`] seam and a software [`DefaultProvider`]
//! - PRF / PRF+ key expansion

pub mod algorithms;
pub mod prf;
pub mod provider;
pub mod software;

pub use algorithms::{
    DhGroup, EncryptionAlgorithm, HashAlgorithm, IntegrityAlgorithm, PrfAlgorithm,
    SignatureAlgorithm,
};
pub use prf::{prf, prf_plus, KeyStream};
pub use provider::{CryptoProvider, DhKeyPair, DhPrivateKey};
pub use software::DefaultProvider;

use subtle::ConstantTimeEq;

/// Constant-time comparison for received MACs, hashes and AUTH data
pub fn verify_equal(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len() && bool::from(expected.ct_eq(received))
}
