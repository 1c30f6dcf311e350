//! Software crypto provider
//!
//! Backed by the RustCrypto crates (`hmac`, `sha1`, `sha2`, `aes`, `cbc`,
//! `aes-gcm`, `p384`), `x25519-dalek` and `ed25519-dalek`. Identifiers the
//! provider does not implement (3DES, MODP groups, ECP-256) fail with
//! [`Error::CryptoError`] so negotiation can still carry them.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::{
    aead::{Aead, Payload},
    Aes128Gcm, Aes256Gcm, Nonce as AesGcmNonce,
};
use cbc::{Decryptor, Encryptor};
use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use ed25519_dalek::{Signer, Verifier};
use hmac::{Hmac, Mac};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use super::algorithms::{
    DhGroup, EncryptionAlgorithm, HashAlgorithm, PrfAlgorithm, SignatureAlgorithm,
};
use super::provider::{CryptoProvider, DhKeyPair, DhPrivateKey};
use crate::error::{Error, Result};

const AES_BLOCK: usize = 16;
const GCM_SALT_LEN: usize = 4;
const GCM_TAG_LEN: usize = 16;

macro_rules! hmac_parts {
    ($hash:ty, $key:expr, $data:expr) => {{
        let mut mac = <Hmac<$hash> as Mac>::new_from_slice($key)
            .map_err(|_| Error::CryptoError("HMAC key rejected".into()))?;
        for part in $data {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    }};
}

macro_rules! digest_parts {
    ($hash:ty, $data:expr) => {{
        let mut hasher = <$hash>::new();
        for part in $data {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }};
}

/// Software implementation of [`CryptoProvider`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProvider;

impl DefaultProvider {
    /// Create the provider
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for DefaultProvider {
    fn hmac(&self, alg: HashAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(match alg {
            HashAlgorithm::Sha1 => hmac_parts!(Sha1, key, data),
            HashAlgorithm::Sha256 => hmac_parts!(Sha256, key, data),
            HashAlgorithm::Sha384 => hmac_parts!(Sha384, key, data),
            HashAlgorithm::Sha512 => hmac_parts!(Sha512, key, data),
        })
    }

    fn hash(&self, alg: HashAlgorithm, data: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(match alg {
            HashAlgorithm::Sha1 => digest_parts!(Sha1, data),
            HashAlgorithm::Sha256 => digest_parts!(Sha256, data),
            HashAlgorithm::Sha384 => digest_parts!(Sha384, data),
            HashAlgorithm::Sha512 => digest_parts!(Sha512, data),
        })
    }

    fn prf(&self, alg: PrfAlgorithm, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        match alg.hash() {
            Some(hash) => self.hmac(hash, key, data),
            None => Ok(aes_xcbc_prf(key, data).to_vec()),
        }
    }

    fn dh_generate(&self, group: DhGroup) -> Result<DhKeyPair> {
        match group {
            DhGroup::Curve25519 => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Ok(DhKeyPair {
                    public: public.as_bytes().to_vec(),
                    private: DhPrivateKey::new(group, secret),
                })
            }
            DhGroup::Ecp384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                // KE carries x | y without the SEC1 prefix octet
                let public = point.as_bytes()[1..].to_vec();
                Ok(DhKeyPair {
                    public,
                    private: DhPrivateKey::new(group, secret),
                })
            }
            other => Err(Error::CryptoError(format!(
                "DH group {} not supported",
                other.number()
            ))),
        }
    }

    fn dh_compute(&self, private: DhPrivateKey, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let group = private.group();
        if peer_public.len() != group.public_len() {
            return Err(Error::InvalidKeyLength {
                expected: group.public_len(),
                actual: peer_public.len(),
            });
        }

        match group {
            DhGroup::Curve25519 => {
                let secret = private.downcast::<x25519_dalek::StaticSecret>()?;
                let mut peer = [0u8; 32];
                peer.copy_from_slice(peer_public);
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            DhGroup::Ecp384 => {
                let secret = private.downcast::<p384::ecdh::EphemeralSecret>()?;
                let mut sec1 = Vec::with_capacity(peer_public.len() + 1);
                sec1.push(0x04);
                sec1.extend_from_slice(peer_public);
                let peer = p384::PublicKey::from_sec1_bytes(&sec1)
                    .map_err(|_| Error::CryptoError("invalid ECP-384 public value".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            other => Err(Error::CryptoError(format!(
                "DH group {} not supported",
                other.number()
            ))),
        }
    }

    fn encrypt(
        &self,
        alg: EncryptionAlgorithm,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        match alg {
            EncryptionAlgorithm::AesCbc => {
                check_cbc_input(iv, plaintext)?;
                match key.len() {
                    16 => Ok(Encryptor::<Aes128>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext)),
                    24 => Ok(Encryptor::<Aes192>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext)),
                    32 => Ok(Encryptor::<Aes256>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext)),
                    n => Err(Error::InvalidKeyLength {
                        expected: 16,
                        actual: n,
                    }),
                }
            }
            EncryptionAlgorithm::AesGcm16 => {
                let (key, nonce) = split_gcm_key(key, iv)?;
                let nonce = AesGcmNonce::from_slice(&nonce);
                let payload = Payload {
                    msg: plaintext,
                    aad,
                };
                match key.len() {
                    16 => Aes128Gcm::new_from_slice(key)
                        .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?
                        .encrypt(nonce, payload)
                        .map_err(|_| Error::CryptoError("AES-GCM encryption failed".into())),
                    32 => Aes256Gcm::new_from_slice(key)
                        .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?
                        .encrypt(nonce, payload)
                        .map_err(|_| Error::CryptoError("AES-GCM encryption failed".into())),
                    n => Err(Error::InvalidKeyLength {
                        expected: 16,
                        actual: n,
                    }),
                }
            }
            EncryptionAlgorithm::Null => Ok(plaintext.to_vec()),
            EncryptionAlgorithm::TripleDes => {
                Err(Error::CryptoError("3DES not supported".into()))
            }
        }
    }

    fn decrypt(
        &self,
        alg: EncryptionAlgorithm,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        match alg {
            EncryptionAlgorithm::AesCbc => {
                check_cbc_input(iv, ciphertext)?;
                let plain = match key.len() {
                    16 => Decryptor::<Aes128>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                    24 => Decryptor::<Aes192>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                    32 => Decryptor::<Aes256>::new_from_slices(key, iv)
                        .map_err(|_| Error::CryptoError("Failed to create AES-CBC cipher".into()))?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                    n => {
                        return Err(Error::InvalidKeyLength {
                            expected: 16,
                            actual: n,
                        })
                    }
                };
                plain.map_err(|_| Error::CryptoError("AES-CBC decryption failed".into()))
            }
            EncryptionAlgorithm::AesGcm16 => {
                if ciphertext.len() < GCM_TAG_LEN {
                    return Err(Error::BufferTooShort {
                        required: GCM_TAG_LEN,
                        available: ciphertext.len(),
                    });
                }
                let (key, nonce) = split_gcm_key(key, iv)?;
                let nonce = AesGcmNonce::from_slice(&nonce);
                let payload = Payload {
                    msg: ciphertext,
                    aad,
                };
                match key.len() {
                    16 => Aes128Gcm::new_from_slice(key)
                        .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?
                        .decrypt(nonce, payload)
                        .map_err(|_| Error::CryptoError("AES-GCM decryption failed".into())),
                    32 => Aes256Gcm::new_from_slice(key)
                        .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?
                        .decrypt(nonce, payload)
                        .map_err(|_| Error::CryptoError("AES-GCM decryption failed".into())),
                    n => Err(Error::InvalidKeyLength {
                        expected: 16,
                        actual: n,
                    }),
                }
            }
            EncryptionAlgorithm::Null => Ok(ciphertext.to_vec()),
            EncryptionAlgorithm::TripleDes => {
                Err(Error::CryptoError("3DES not supported".into()))
            }
        }
    }

    fn sign(&self, alg: SignatureAlgorithm, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match alg {
            SignatureAlgorithm::Ed25519 => {
                let seed: [u8; 32] =
                    private_key
                        .try_into()
                        .map_err(|_| Error::InvalidKeyLength {
                            expected: 32,
                            actual: private_key.len(),
                        })?;
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
                Ok(signing_key.sign(data).to_bytes().to_vec())
            }
        }
    }

    fn verify(
        &self,
        alg: SignatureAlgorithm,
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        match alg {
            SignatureAlgorithm::Ed25519 => {
                let public: [u8; 32] =
                    public_key
                        .try_into()
                        .map_err(|_| Error::InvalidKeyLength {
                            expected: 32,
                            actual: public_key.len(),
                        })?;
                let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public)
                    .map_err(|_| Error::CryptoError("invalid Ed25519 public key".into()))?;
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| Error::AuthenticationFailed("malformed signature".into()))?;
                verifying_key
                    .verify(data, &signature)
                    .map_err(|_| Error::AuthenticationFailed("signature mismatch".into()))
            }
        }
    }

    fn random_bytes(&self, buf: &mut [u8]) -> Result<()> {
        rand::thread_rng()
            .try_fill_bytes(buf)
            .map_err(|e| Error::CryptoError(format!("random source failed: {}", e)))
    }
}

fn check_cbc_input(iv: &[u8], data: &[u8]) -> Result<()> {
    if iv.len() != AES_BLOCK {
        return Err(Error::InvalidLength {
            expected: AES_BLOCK,
            actual: iv.len(),
        });
    }
    if data.len() % AES_BLOCK != 0 {
        return Err(Error::InvalidLength {
            expected: data.len() + AES_BLOCK - data.len() % AES_BLOCK,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Split `key | salt` and build the 12 byte nonce `salt | iv` (RFC 5282)
fn split_gcm_key<'a>(key: &'a [u8], iv: &[u8]) -> Result<(&'a [u8], [u8; 12])> {
    if key.len() <= GCM_SALT_LEN {
        return Err(Error::InvalidKeyLength {
            expected: 16 + GCM_SALT_LEN,
            actual: key.len(),
        });
    }
    if iv.len() != 8 {
        return Err(Error::InvalidLength {
            expected: 8,
            actual: iv.len(),
        });
    }
    let (key, salt) = key.split_at(key.len() - GCM_SALT_LEN);
    let mut nonce = [0u8; 12];
    nonce[..GCM_SALT_LEN].copy_from_slice(salt);
    nonce[GCM_SALT_LEN..].copy_from_slice(iv);
    Ok((key, nonce))
}

/// AES-XCBC-PRF-128 (RFC 4434)
fn aes_xcbc_prf(key: &[u8], data: &[&[u8]]) -> [u8; 16] {
    let key = match key.len() {
        16 => {
            let mut k = [0u8; 16];
            k.copy_from_slice(key);
            k
        }
        n if n < 16 => {
            let mut k = [0u8; 16];
            k[..n].copy_from_slice(key);
            k
        }
        _ => aes_xcbc_mac(&[0u8; 16], &[key]),
    };
    aes_xcbc_mac(&key, data)
}

/// AES-XCBC-MAC-96 before truncation (RFC 3566)
fn aes_xcbc_mac(key: &[u8; 16], data: &[&[u8]]) -> [u8; 16] {
    let base = Aes128::new(GenericArray::from_slice(key));
    let derive = |fill: u8| {
        let mut block = GenericArray::clone_from_slice(&[fill; 16]);
        base.encrypt_block(&mut block);
        block
    };
    let k1 = Aes128::new(&derive(0x01));
    let k2 = derive(0x02);
    let k3 = derive(0x03);

    let msg: Vec<u8> = data.concat();
    let blocks = if msg.is_empty() {
        1
    } else {
        (msg.len() + AES_BLOCK - 1) / AES_BLOCK
    };

    let mut e = [0u8; 16];
    for i in 0..blocks {
        let start = i * AES_BLOCK;
        let chunk = &msg[start..msg.len().min(start + AES_BLOCK)];
        let mut block = [0u8; 16];
        block[..chunk.len()].copy_from_slice(chunk);

        if i == blocks - 1 {
            let tweak = if chunk.len() == AES_BLOCK {
                k2
            } else {
                block[chunk.len()] = 0x80;
                k3
            };
            for (b, t) in block.iter_mut().zip(tweak.iter()) {
                *b ^= t;
            }
        }
        for (b, prev) in block.iter_mut().zip(e.iter()) {
            *b ^= prev;
        }

        let mut ga = GenericArray::from(block);
        k1.encrypt_block(&mut ga);
        e.copy_from_slice(&ga);
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let provider = DefaultProvider::new();
        let mac = provider
            .hmac(
                HashAlgorithm::Sha256,
                b"Jefe",
                &[b"what do ya want ", b"for nothing?"],
            )
            .unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hash_multipart_matches_single() {
        let provider = DefaultProvider::new();
        let split = provider
            .hash(HashAlgorithm::Sha1, &[b"ab", b"c"])
            .unwrap();
        let whole = provider.hash(HashAlgorithm::Sha1, &[b"abc"]).unwrap();
        assert_eq!(split, whole);
        assert_eq!(
            hex::encode(whole),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_aes_xcbc_rfc3566_vectors() {
        let key: Vec<u8> = (0u8..16).collect();
        // Test case 1: empty message
        assert_eq!(
            hex::encode(aes_xcbc_mac(&key.clone().try_into().unwrap(), &[])),
            "75f0251d528ac01c4573dfd584d79f29"
        );
        // Test case 3: 16 byte message
        let msg: Vec<u8> = (0u8..16).collect();
        assert_eq!(
            hex::encode(aes_xcbc_mac(&key.try_into().unwrap(), &[&msg])),
            "d2a246fa349b68a79998a4394ff7a263"
        );
    }

    #[test]
    fn test_aes_cbc_roundtrip_and_alignment() {
        let provider = DefaultProvider::new();
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plain = [0x33u8; 32];

        let ct = provider
            .encrypt(EncryptionAlgorithm::AesCbc, &key, &iv, &plain, &[])
            .unwrap();
        assert_eq!(ct.len(), 32);
        assert_ne!(&ct[..], &plain[..]);
        let pt = provider
            .decrypt(EncryptionAlgorithm::AesCbc, &key, &iv, &ct, &[])
            .unwrap();
        assert_eq!(pt, plain);

        let result = provider.encrypt(EncryptionAlgorithm::AesCbc, &key, &iv, &[0u8; 10], &[]);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_aes_gcm_rejects_tampered_aad() {
        let provider = DefaultProvider::new();
        let key = [0x44u8; 20];
        let iv = [0x55u8; 8];

        let ct = provider
            .encrypt(EncryptionAlgorithm::AesGcm16, &key, &iv, b"payload", b"header")
            .unwrap();
        assert_eq!(ct.len(), 7 + GCM_TAG_LEN);

        let ok = provider
            .decrypt(EncryptionAlgorithm::AesGcm16, &key, &iv, &ct, b"header")
            .unwrap();
        assert_eq!(ok, b"payload");

        let bad = provider.decrypt(EncryptionAlgorithm::AesGcm16, &key, &iv, &ct, b"HEADER");
        assert!(matches!(bad, Err(Error::CryptoError(_))));
    }

    #[test]
    fn test_x25519_agreement() {
        let provider = DefaultProvider::new();
        let a = provider.dh_generate(DhGroup::Curve25519).unwrap();
        let b = provider.dh_generate(DhGroup::Curve25519).unwrap();
        let a_pub = a.public.clone();
        let b_pub = b.public.clone();

        let s1 = provider.dh_compute(a.private, &b_pub).unwrap();
        let s2 = provider.dh_compute(b.private, &a_pub).unwrap();
        assert_eq!(*s1, *s2);
        assert_eq!(s1.len(), 32);
    }

    #[test]
    fn test_ecp384_agreement() {
        let provider = DefaultProvider::new();
        let a = provider.dh_generate(DhGroup::Ecp384).unwrap();
        let b = provider.dh_generate(DhGroup::Ecp384).unwrap();
        assert_eq!(a.public.len(), 96);
        let a_pub = a.public.clone();
        let b_pub = b.public.clone();

        let s1 = provider.dh_compute(a.private, &b_pub).unwrap();
        let s2 = provider.dh_compute(b.private, &a_pub).unwrap();
        assert_eq!(*s1, *s2);
        assert_eq!(s1.len(), 48);
    }

    #[test]
    fn test_unsupported_group() {
        let provider = DefaultProvider::new();
        assert!(matches!(
            provider.dh_generate(DhGroup::Modp1024),
            Err(Error::CryptoError(_))
        ));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let provider = DefaultProvider::new();
        let seed = [7u8; 32];
        let public = ed25519_dalek::SigningKey::from_bytes(&seed)
            .verifying_key()
            .to_bytes();

        let sig = provider
            .sign(SignatureAlgorithm::Ed25519, &seed, b"signed octets")
            .unwrap();
        provider
            .verify(SignatureAlgorithm::Ed25519, &public, b"signed octets", &sig)
            .unwrap();

        let err = provider
            .verify(SignatureAlgorithm::Ed25519, &public, b"other octets", &sig)
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_random_bytes() {
        let provider = DefaultProvider::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        provider.random_bytes(&mut a).unwrap();
        provider.random_bytes(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
