//! PRF and PRF+ key expansion
//!
//! ```text
//! prf+ (K,S) = T1 | T2 | T3 | T4 | ...
//!
//! where:
//! T1 = prf (K, S | 0x01)
//! T2 = prf (K, T1 | S | 0x02)
//! T3 = prf (K, T2 | S | 0x03)
//! ...
//! ```
//!
//! The counter is a single octet, so at most 255 blocks can be produced
//! (RFC 7296 Section 2.13).

use zeroize::Zeroizing;

use super::algorithms::PrfAlgorithm;
use super::provider::CryptoProvider;
use crate::error::{Error, Result};

/// Maximum number of PRF+ blocks
pub const PRF_PLUS_MAX_BLOCKS: usize = 255;

/// Compute `prf(key, data[0] | data[1] | ...)`
pub fn prf(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    key: &[u8],
    data: &[&[u8]],
) -> Result<Zeroizing<Vec<u8>>> {
    provider.prf(alg, key, data).map(Zeroizing::new)
}

/// Compute prf+ truncated to exactly `output_len` bytes
///
/// # Arguments
///
/// * `provider` - Crypto provider
/// * `alg` - Negotiated PRF
/// * `key` - PRF key (K)
/// * `seed` - Seed data (S)
/// * `output_len` - Desired output length in bytes
///
/// # Returns
///
/// Returns the expanded key stream, or [`Error::KeyMaterialTooLong`] when
/// `output_len` exceeds 255 blocks of PRF output.
pub fn prf_plus(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    key: &[u8],
    seed: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let max = PRF_PLUS_MAX_BLOCKS * alg.output_len();
    if output_len > max {
        return Err(Error::KeyMaterialTooLong {
            requested: output_len,
            max,
        });
    }

    let mut output = Zeroizing::new(Vec::with_capacity(output_len));
    let mut t = Zeroizing::new(Vec::new());
    let mut counter: u8 = 1;

    while output.len() < output_len {
        // T(i) = prf(K, T(i-1) | S | counter)
        t = prf(provider, alg, key, &[&t, seed, &[counter]])?;
        output.extend_from_slice(&t);
        counter = counter.wrapping_add(1);
    }

    output.truncate(output_len);
    Ok(output)
}

/// Sequential reader over a derived key stream
///
/// Splits PRF+ output into individual keys in the order they are taken.
#[derive(Debug)]
pub struct KeyStream {
    bytes: Zeroizing<Vec<u8>>,
    offset: usize,
}

impl KeyStream {
    /// Wrap an expanded key stream
    pub fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Take the next `len` bytes
    pub fn take(&mut self, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        let end = self.offset + len;
        if end > self.bytes.len() {
            return Err(Error::BufferTooShort {
                required: end,
                available: self.bytes.len(),
            });
        }
        let key = Zeroizing::new(self.bytes[self.offset..end].to_vec());
        self.offset = end;
        Ok(key)
    }

    /// Bytes not yet taken
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultProvider;

    #[test]
    fn test_prf_hmac_sha256() {
        let provider = DefaultProvider::new();
        let output =
            prf(&provider, PrfAlgorithm::HmacSha256, b"test key", &[b"test data"]).unwrap();
        assert_eq!(output.len(), 32);

        // PRF should be deterministic
        let output2 =
            prf(&provider, PrfAlgorithm::HmacSha256, b"test key", &[b"test data"]).unwrap();
        assert_eq!(output, output2);
    }

    #[test]
    fn test_prf_plus_expansion() {
        let provider = DefaultProvider::new();
        let alg = PrfAlgorithm::HmacSha256;

        // Request more bytes than single PRF output
        let output = prf_plus(&provider, alg, b"secret key", b"seed data", 100).unwrap();
        assert_eq!(output.len(), 100);

        // First block is prf(K, S | 0x01)
        let t1 = prf(&provider, alg, b"secret key", &[b"seed data", &[1]]).unwrap();
        assert_eq!(&output[..32], &t1[..]);

        // Second block chains T1
        let t2 = prf(&provider, alg, b"secret key", &[&t1, b"seed data", &[2]]).unwrap();
        assert_eq!(&output[32..64], &t2[..]);
    }

    #[test]
    fn test_prf_plus_prefix_property() {
        let provider = DefaultProvider::new();
        let short = prf_plus(&provider, PrfAlgorithm::HmacSha1, b"k", b"s", 16).unwrap();
        let long = prf_plus(&provider, PrfAlgorithm::HmacSha1, b"k", b"s", 64).unwrap();
        assert_eq!(&short[..], &long[..16]);
    }

    #[test]
    fn test_prf_plus_input_sensitivity() {
        let provider = DefaultProvider::new();
        let alg = PrfAlgorithm::HmacSha256;
        let base = prf_plus(&provider, alg, b"key", b"seed", 48).unwrap();
        let other_key = prf_plus(&provider, alg, b"kex", b"seed", 48).unwrap();
        let other_seed = prf_plus(&provider, alg, b"key", b"seee", 48).unwrap();
        assert_ne!(base, other_key);
        assert_ne!(base, other_seed);
    }

    #[test]
    fn test_prf_plus_ceiling() {
        let provider = DefaultProvider::new();
        let alg = PrfAlgorithm::HmacSha1;

        let at_limit = prf_plus(&provider, alg, b"k", b"s", 255 * 20).unwrap();
        assert_eq!(at_limit.len(), 255 * 20);

        let err = prf_plus(&provider, alg, b"k", b"s", 255 * 20 + 1).unwrap_err();
        assert_eq!(
            err,
            Error::KeyMaterialTooLong {
                requested: 5101,
                max: 5100
            }
        );
    }

    #[test]
    fn test_key_stream_split() {
        let mut stream = KeyStream::new(Zeroizing::new((0u8..10).collect()));
        assert_eq!(&stream.take(4).unwrap()[..], &[0, 1, 2, 3]);
        assert_eq!(&stream.take(6).unwrap()[..], &[4, 5, 6, 7, 8, 9]);
        assert_eq!(stream.remaining(), 0);
        assert!(stream.take(1).is_err());
    }
}
