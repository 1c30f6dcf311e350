//! Crypto provider seam
//!
//! Every primitive the key-management core needs is consumed through
//! [`CryptoProvider`], parameterized by the algorithm enums in
//! [`super::algorithms`]. Hosts with hardware offload implement the trait
//! themselves; [`super::DefaultProvider`] is the software implementation.

use std::any::Any;
use std::fmt;

use zeroize::Zeroizing;

use super::algorithms::{
    DhGroup, EncryptionAlgorithm, HashAlgorithm, IntegrityAlgorithm, PrfAlgorithm,
    SignatureAlgorithm,
};
use crate::error::{Error, Result};

/// Opaque Diffie-Hellman private value
///
/// The provider decides the representation; the exchange handle only
/// keeps it until the peer's public value arrives and then hands it back
/// to [`CryptoProvider::dh_compute`], which consumes it.
pub struct DhPrivateKey {
    group: DhGroup,
    inner: Box<dyn Any + Send + Sync>,
}

impl DhPrivateKey {
    /// Wrap a provider specific private value
    pub fn new<T: Any + Send + Sync>(group: DhGroup, inner: T) -> Self {
        Self {
            group,
            inner: Box::new(inner),
        }
    }

    /// Group this key belongs to
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Recover the provider specific value
    pub fn downcast<T: Any>(self) -> Result<Box<T>> {
        self.inner
            .downcast::<T>()
            .map_err(|_| Error::CryptoError("DH private key from another provider".into()))
    }
}

impl fmt::Debug for DhPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhPrivateKey")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Freshly generated Diffie-Hellman key pair
#[derive(Debug)]
pub struct DhKeyPair {
    /// Public value as carried in the KE payload
    pub public: Vec<u8>,
    /// Private value, consumed by `dh_compute`
    pub private: DhPrivateKey,
}

/// Cryptographic operations consumed by IKE
///
/// Multi-part inputs are passed as slices of slices so callers never
/// concatenate secrets into temporary buffers.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    /// HMAC over the concatenation of `data`
    fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>>;

    /// Plain hash over the concatenation of `data`
    fn hash(&self, alg: HashAlgorithm, data: &[&[u8]]) -> Result<Vec<u8>>;

    /// Negotiated pseudo-random function
    ///
    /// HMAC based PRFs are derived from [`CryptoProvider::hmac`];
    /// providers supporting AES-XCBC override this.
    fn prf(&self, alg: PrfAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        match alg.hash() {
            Some(hash) => self.hmac(hash, key, data),
            None => Err(Error::CryptoError(format!("PRF {:?} not supported", alg))),
        }
    }

    /// Truncated integrity checksum
    fn integrity(&self, alg: IntegrityAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        let mut mac = self.hmac(alg.hash(), key, data)?;
        mac.truncate(alg.icv_len());
        Ok(mac)
    }

    /// Generate an ephemeral key pair for `group`
    fn dh_generate(&self, group: DhGroup) -> Result<DhKeyPair>;

    /// Compute the shared secret with the peer's public value
    fn dh_compute(&self, private: DhPrivateKey, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Encrypt `plaintext`; `aad` is only used by AEAD ciphers
    fn encrypt(
        &self,
        alg: EncryptionAlgorithm,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext`; `aad` is only used by AEAD ciphers
    fn decrypt(
        &self,
        alg: EncryptionAlgorithm,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>>;

    /// Sign `data` with a raw private key
    fn sign(&self, alg: SignatureAlgorithm, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature with a raw public key
    fn verify(
        &self,
        alg: SignatureAlgorithm,
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<()>;

    /// Fill `buf` with random bytes
    fn random_bytes(&self, buf: &mut [u8]) -> Result<()>;
}
