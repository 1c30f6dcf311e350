//! IKEv2 key derivation (RFC 7296 Sections 2.14, 2.17 and 2.18)
//!
//! ```text
//! SKEYSEED = prf(Ni | Nr, g^ir)
//! {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
//!          = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
//!
//! re-key:  SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)
//! child:   KEYMAT = prf+(SK_d, [g^ir (new)] | Ni | Nr)
//! ```

use std::fmt;

use zeroize::Zeroizing;

use crate::config::Phase1Attributes;
use crate::crypto::{prf, prf_plus, CryptoProvider, KeyStream, PrfAlgorithm};
use crate::error::Result;
use crate::install::ChildKeys;
use crate::spd::{SaKeys, SecurityProtocol};

/// Key material of an IKE SA
#[derive(Clone)]
pub struct IkeSaKeys {
    /// Key for deriving child SA and re-key material
    pub sk_d: Zeroizing<Vec<u8>>,
    /// Integrity key, initiator to responder
    pub sk_ai: Zeroizing<Vec<u8>>,
    /// Integrity key, responder to initiator
    pub sk_ar: Zeroizing<Vec<u8>>,
    /// Encryption key, initiator to responder
    pub sk_ei: Zeroizing<Vec<u8>>,
    /// Encryption key, responder to initiator
    pub sk_er: Zeroizing<Vec<u8>>,
    /// AUTH key for the initiator
    pub sk_pi: Zeroizing<Vec<u8>>,
    /// AUTH key for the responder
    pub sk_pr: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for IkeSaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkeSaKeys")
            .field("sk_d_len", &self.sk_d.len())
            .field("sk_e_len", &self.sk_ei.len())
            .field("sk_a_len", &self.sk_ai.len())
            .finish()
    }
}

/// Key used for the nonce-keyed PRF in SKEYSEED
///
/// PRFs with a fixed key size (AES-XCBC) take 64 bits from each nonce.
fn nonce_key(alg: PrfAlgorithm, ni: &[u8], nr: &[u8]) -> Vec<u8> {
    match alg {
        PrfAlgorithm::Aes128Xcbc => {
            let half = alg.key_len() / 2;
            let mut key = Vec::with_capacity(alg.key_len());
            key.extend_from_slice(&ni[..half.min(ni.len())]);
            key.extend_from_slice(&nr[..half.min(nr.len())]);
            key
        }
        _ => [ni, nr].concat(),
    }
}

/// SKEYSEED for a new IKE SA
pub fn skeyseed(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    ni: &[u8],
    nr: &[u8],
    shared_secret: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    prf(provider, alg, &nonce_key(alg, ni, nr), &[shared_secret])
}

/// SKEYSEED for an IKE SA replacing one with `old_sk_d`
///
/// `old_alg` is the PRF of the SA being re-keyed.
pub fn skeyseed_rekey(
    provider: &dyn CryptoProvider,
    old_alg: PrfAlgorithm,
    old_sk_d: &[u8],
    shared_secret: &[u8],
    ni: &[u8],
    nr: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    prf(provider, old_alg, old_sk_d, &[shared_secret, ni, nr])
}

/// Expand SKEYSEED into the seven IKE SA keys
///
/// # Arguments
///
/// * `suite` - Negotiated algorithms
/// * `skeyseed` - Output of [`skeyseed`] or [`skeyseed_rekey`]
/// * `ni`, `nr` - Nonces of the exchange creating the SA
/// * `spi_i`, `spi_r` - SPIs of the SA
pub fn derive_ike_keys(
    provider: &dyn CryptoProvider,
    suite: &Phase1Attributes,
    skeyseed: &[u8],
    ni: &[u8],
    nr: &[u8],
    spi_i: &[u8; 8],
    spi_r: &[u8; 8],
) -> Result<IkeSaKeys> {
    let prf_key_len = suite.prf.key_len();
    let integ_len = suite.integrity.map(|i| i.key_len()).unwrap_or(0);
    let encr_len = suite.encryption.keymat_len(suite.effective_key_bits());
    let total = 3 * prf_key_len + 2 * integ_len + 2 * encr_len;

    let seed = [ni, nr, spi_i.as_slice(), spi_r.as_slice()].concat();
    let mut stream = KeyStream::new(prf_plus(provider, suite.prf, skeyseed, &seed, total)?);

    Ok(IkeSaKeys {
        sk_d: stream.take(prf_key_len)?,
        sk_ai: stream.take(integ_len)?,
        sk_ar: stream.take(integ_len)?,
        sk_ei: stream.take(encr_len)?,
        sk_er: stream.take(encr_len)?,
        sk_pi: stream.take(prf_key_len)?,
        sk_pr: stream.take(prf_key_len)?,
    })
}

fn take_sa_keys(stream: &mut KeyStream, security: &SecurityProtocol) -> Result<SaKeys> {
    Ok(SaKeys {
        encryption: stream.take(security.encryption_keymat_len())?,
        integrity: stream.take(security.integrity_key_len())?,
    })
}

/// Derive child SA keys
///
/// One key stream is drawn for all protocols of the exchange, in
/// negotiation order. For each protocol the initiator-to-responder block
/// (encryption then integrity) is taken before the reverse block.
///
/// # Arguments
///
/// * `sk_d` - SK_d of the IKE SA
/// * `shared_secret` - Fresh g^ir when PFS was used
/// * `nonces` - `(Ni, Nr)` of the exchange
/// * `security` - Negotiated protocols
/// * `is_initiator` - Whether we initiated this exchange
pub fn derive_child_keys(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    sk_d: &[u8],
    shared_secret: Option<&[u8]>,
    nonces: (&[u8], &[u8]),
    security: &[SecurityProtocol],
    is_initiator: bool,
) -> Result<Vec<ChildKeys>> {
    let total: usize = security
        .iter()
        .map(|s| 2 * (s.encryption_keymat_len() + s.integrity_key_len()))
        .sum();

    let seed = [shared_secret.unwrap_or(&[]), nonces.0, nonces.1].concat();
    let mut stream = KeyStream::new(prf_plus(provider, alg, sk_d, &seed, total)?);

    security
        .iter()
        .map(|sec| {
            let i_to_r = take_sa_keys(&mut stream, sec)?;
            let r_to_i = take_sa_keys(&mut stream, sec)?;
            Ok(if is_initiator {
                ChildKeys {
                    inbound: r_to_i,
                    outbound: i_to_r,
                }
            } else {
                ChildKeys {
                    inbound: i_to_r,
                    outbound: r_to_i,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        DefaultProvider, DhGroup, EncryptionAlgorithm, IntegrityAlgorithm,
    };
    use crate::error::Error;

    fn suite() -> Phase1Attributes {
        Phase1Attributes::v2(
            EncryptionAlgorithm::AesCbc,
            Some(256),
            Some(IntegrityAlgorithm::HmacSha256_128),
            PrfAlgorithm::HmacSha256,
            DhGroup::Curve25519,
        )
    }

    const SHA256: PrfAlgorithm = PrfAlgorithm::HmacSha256;

    #[test]
    fn test_ike_key_lengths() {
        let p = DefaultProvider::new();
        let (ni, nr) = ([1u8; 32], [2u8; 32]);
        let seed = skeyseed(&p, SHA256, &ni, &nr, &[3u8; 32]).unwrap();
        assert_eq!(seed.len(), 32);

        let keys = derive_ike_keys(&p, &suite(), &seed, &ni, &nr, &[4u8; 8], &[5u8; 8]).unwrap();
        assert_eq!(keys.sk_d.len(), 32);
        assert_eq!(keys.sk_ai.len(), 32);
        assert_eq!(keys.sk_ei.len(), 32);
        assert_eq!(keys.sk_pr.len(), 32);
        assert_ne!(keys.sk_ei, keys.sk_er);
    }

    #[test]
    fn test_derivation_deterministic_and_sensitive() {
        let p = DefaultProvider::new();
        let (ni, nr) = ([1u8; 32], [2u8; 32]);
        let a = skeyseed(&p, SHA256, &ni, &nr, &[3u8; 32]).unwrap();
        let b = skeyseed(&p, SHA256, &ni, &nr, &[3u8; 32]).unwrap();
        assert_eq!(a, b);

        let mut other_nr = nr;
        other_nr[31] ^= 1;
        let c = skeyseed(&p, SHA256, &ni, &other_nr, &[3u8; 32]).unwrap();
        assert_ne!(a, c);

        let k1 = derive_ike_keys(&p, &suite(), &a, &ni, &nr, &[4u8; 8], &[5u8; 8]).unwrap();
        let k2 = derive_ike_keys(&p, &suite(), &a, &ni, &nr, &[4u8; 8], &[6u8; 8]).unwrap();
        assert_ne!(k1.sk_d, k2.sk_d);
    }

    #[test]
    fn test_rekey_skeyseed_differs() {
        let p = DefaultProvider::new();
        let (ni, nr) = ([1u8; 32], [2u8; 32]);
        let fresh = skeyseed(&p, SHA256, &ni, &nr, &[3u8; 32]).unwrap();
        let rekey = skeyseed_rekey(&p, SHA256, &[9u8; 32], &[3u8; 32], &ni, &nr).unwrap();
        assert_ne!(fresh, rekey);
    }

    #[test]
    fn test_xcbc_nonce_key_truncated() {
        assert_eq!(nonce_key(PrfAlgorithm::Aes128Xcbc, &[1u8; 32], &[2u8; 32]).len(), 16);
        assert_eq!(nonce_key(PrfAlgorithm::HmacSha1, &[1u8; 32], &[2u8; 32]).len(), 64);
    }

    #[test]
    fn test_child_keys_mirror_between_roles() {
        let p = DefaultProvider::new();
        let esp = SecurityProtocol::esp(
            EncryptionAlgorithm::AesGcm16,
            Some(128),
            None,
        );
        let ah = SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96);
        let security = vec![esp, ah];
        let nonces: (&[u8], &[u8]) = (&[1u8; 32], &[2u8; 32]);

        let sk_d = [7u8; 32];
        let init = derive_child_keys(&p, SHA256, &sk_d, None, nonces, &security, true).unwrap();
        let resp = derive_child_keys(&p, SHA256, &sk_d, None, nonces, &security, false).unwrap();

        assert_eq!(init.len(), 2);
        for (i, r) in init.iter().zip(&resp) {
            assert_eq!(i.outbound, r.inbound);
            assert_eq!(i.inbound, r.outbound);
        }
        // GCM key carries a 4 byte salt
        assert_eq!(init[0].outbound.encryption.len(), 20);
        assert!(init[0].outbound.integrity.is_empty());
        assert_eq!(init[1].outbound.integrity.len(), 20);
    }

    #[test]
    fn test_pfs_secret_changes_child_keys() {
        let p = DefaultProvider::new();
        let esp = vec![SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha256_128),
        )];
        let nonces: (&[u8], &[u8]) = (&[1u8; 32], &[2u8; 32]);
        let shared = [8u8; 32];
        let plain = derive_child_keys(&p, SHA256, &[7u8; 32], None, nonces, &esp, true).unwrap();
        let pfs = derive_child_keys(&p, SHA256, &[7u8; 32], Some(&shared[..]), nonces, &esp, true)
            .unwrap();
        assert_ne!(plain, pfs);
    }

    #[test]
    fn test_keymat_ceiling() {
        let p = DefaultProvider::new();
        // 255 x 20 bytes available from HMAC-SHA1; ask for more
        let esp = SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(256),
            Some(IntegrityAlgorithm::HmacSha512_256),
        );
        let bundle = vec![esp; 40];
        let nonces: (&[u8], &[u8]) = (&[1u8; 16], &[2u8; 16]);
        let result =
            derive_child_keys(&p, PrfAlgorithm::HmacSha1, &[7u8; 20], None, nonces, &bundle, true);
        assert!(matches!(result, Err(Error::KeyMaterialTooLong { max: 5100, .. })));
    }
}
