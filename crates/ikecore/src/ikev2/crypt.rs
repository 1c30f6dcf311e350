//! Encrypted payload protection (RFC 7296 Section 3.14, RFC 5282)
//!
//! ```text
//! +-----------------+------------+----+----------------------------+-----+
//! | IKE header      | SK header  | IV | inner | pad | pad length  | ICV |
//! +-----------------+------------+----+----------------------------+-----+
//!                                     |<------- encrypted ------->|
//! ```
//!
//! CBC ciphers are followed by an integrity checksum over the whole
//! message. AES-GCM authenticates the IKE and SK headers as associated
//! data and carries its tag in place of the ICV.

use bytes::{BufMut, BytesMut};

use super::constants::{PayloadType, IKE_HEADER_SIZE};
use super::keymat::IkeSaKeys;
use super::message::IkeHeader;
use super::payload::{decode_payloads, encode_payloads, EncryptedPayload, Payload, PayloadHeader};
use crate::config::Phase1Attributes;
use crate::crypto::{verify_equal, CryptoProvider, EncryptionAlgorithm, IntegrityAlgorithm};
use crate::error::{Error, Result};

/// AES-GCM-16 tag length
const GCM_ICV_LEN: usize = 16;

/// Cipher state for one direction of an IKE SA
#[derive(Debug, Clone, Copy)]
pub struct SkCipher<'a> {
    encryption: EncryptionAlgorithm,
    integrity: Option<IntegrityAlgorithm>,
    encr_key: &'a [u8],
    integ_key: &'a [u8],
}

impl<'a> SkCipher<'a> {
    /// Keys for messages we send
    ///
    /// `is_initiator` is our role when the IKE SA was created.
    pub fn outbound(suite: &Phase1Attributes, keys: &'a IkeSaKeys, is_initiator: bool) -> Self {
        let (encr_key, integ_key) = if is_initiator {
            (keys.sk_ei.as_slice(), keys.sk_ai.as_slice())
        } else {
            (keys.sk_er.as_slice(), keys.sk_ar.as_slice())
        };
        SkCipher {
            encryption: suite.encryption,
            integrity: suite.integrity,
            encr_key,
            integ_key,
        }
    }

    /// Keys for messages we receive
    pub fn inbound(suite: &Phase1Attributes, keys: &'a IkeSaKeys, is_initiator: bool) -> Self {
        Self::outbound(suite, keys, !is_initiator)
    }

    fn icv_len(&self) -> Result<usize> {
        if self.encryption.is_aead() {
            return Ok(GCM_ICV_LEN);
        }
        self.integrity
            .map(|i| i.icv_len())
            .ok_or_else(|| Error::CryptoError("non-AEAD cipher without integrity".into()))
    }

    fn pad_len(&self, inner_len: usize) -> usize {
        if self.encryption.is_aead() {
            return 0;
        }
        let block = self.encryption.block_size();
        (block - (inner_len + 1) % block) % block
    }
}

/// Serialize `payloads` into an encrypted message
///
/// The header's next-payload and length fields are overwritten.
pub fn protect(
    provider: &dyn CryptoProvider,
    cipher: &SkCipher<'_>,
    header: &IkeHeader,
    payloads: &[Payload],
) -> Result<Vec<u8>> {
    let (first_inner, inner) = encode_payloads(payloads);

    let pad_len = cipher.pad_len(inner.len());
    let mut plaintext = Vec::with_capacity(inner.len() + pad_len + 1);
    plaintext.extend_from_slice(&inner);
    plaintext.resize(inner.len() + pad_len, 0);
    plaintext.push(pad_len as u8);

    let iv_len = cipher.encryption.iv_len();
    let icv_len = cipher.icv_len()?;
    let mut iv = vec![0u8; iv_len];
    provider.random_bytes(&mut iv)?;

    let body_len = iv_len + plaintext.len() + icv_len;
    let mut header = header.clone();
    header.next_payload = PayloadType::SK.to_u8();
    header.length = (IKE_HEADER_SIZE + PayloadHeader::SIZE + body_len) as u32;
    let sk_header = PayloadHeader {
        next_payload: first_inner,
        critical: false,
        length: (PayloadHeader::SIZE + body_len) as u16,
    };

    let mut raw = BytesMut::with_capacity(header.length as usize);
    raw.put_slice(&header.to_bytes());
    raw.put_slice(&sk_header.to_bytes());

    if cipher.encryption.is_aead() {
        let sealed = provider.encrypt(cipher.encryption, cipher.encr_key, &iv, &plaintext, &raw)?;
        raw.put_slice(&iv);
        raw.put_slice(&sealed);
    } else {
        let integrity = cipher
            .integrity
            .ok_or_else(|| Error::CryptoError("non-AEAD cipher without integrity".into()))?;
        let ciphertext =
            provider.encrypt(cipher.encryption, cipher.encr_key, &iv, &plaintext, &[])?;
        raw.put_slice(&iv);
        raw.put_slice(&ciphertext);
        let icv = provider.integrity(integrity, cipher.integ_key, &[&raw])?;
        raw.put_slice(&icv);
    }

    Ok(raw.to_vec())
}

/// Verify and decrypt the encrypted payload of a received message
///
/// `raw` is the received message up to its header length; `sk` is the
/// encrypted payload decoded from it.
///
/// # Errors
///
/// Returns [`Error::CryptoError`] when the checksum or tag does not
/// verify. Such messages are discarded without a reply.
pub fn unprotect(
    provider: &dyn CryptoProvider,
    cipher: &SkCipher<'_>,
    raw: &[u8],
    sk: &EncryptedPayload,
) -> Result<Vec<Payload>> {
    let iv_len = cipher.encryption.iv_len();
    let icv_len = cipher.icv_len()?;
    let body = &sk.body;
    if body.len() < iv_len + icv_len + 1 || body.len() > raw.len() {
        return Err(Error::InvalidPayload("Encrypted payload too short".into()));
    }
    let body_start = raw.len() - body.len();
    let iv = &body[..iv_len];

    let plaintext = if cipher.encryption.is_aead() {
        let aad = &raw[..body_start];
        provider
            .decrypt(cipher.encryption, cipher.encr_key, iv, &body[iv_len..], aad)
            .map_err(|_| Error::CryptoError("Encrypted payload failed authentication".into()))?
    } else {
        let integrity = cipher
            .integrity
            .ok_or_else(|| Error::CryptoError("non-AEAD cipher without integrity".into()))?;
        let (signed, icv) = raw.split_at(raw.len() - icv_len);
        let expected = provider.integrity(integrity, cipher.integ_key, &[signed])?;
        if !verify_equal(&expected, icv) {
            return Err(Error::CryptoError("Integrity check failed".into()));
        }
        let ciphertext = &body[iv_len..body.len() - icv_len];
        provider.decrypt(cipher.encryption, cipher.encr_key, iv, ciphertext, &[])?
    };

    let Some((&pad_len, rest)) = plaintext.split_last() else {
        return Err(Error::InvalidPayload("Empty encrypted payload".into()));
    };
    if pad_len as usize > rest.len() {
        return Err(Error::InvalidPayload("Invalid padding length".into()));
    }
    let inner = &rest[..rest.len() - pad_len as usize];
    decode_payloads(sk.first_inner, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultProvider, DhGroup, PrfAlgorithm};
    use crate::ikev2::constants::{ExchangeType, IkeFlags, NotifyType};
    use crate::ikev2::keymat::derive_ike_keys;
    use crate::ikev2::message::IkeMessage;
    use crate::ikev2::payload::{NoncePayload, NotifyPayload};

    fn suite(encryption: EncryptionAlgorithm) -> Phase1Attributes {
        let integrity = (!encryption.is_aead()).then_some(IntegrityAlgorithm::HmacSha256_128);
        Phase1Attributes::v2(
            encryption,
            Some(128),
            integrity,
            PrfAlgorithm::HmacSha256,
            DhGroup::Curve25519,
        )
    }

    fn keys(suite: &Phase1Attributes) -> IkeSaKeys {
        let p = DefaultProvider::new();
        derive_ike_keys(&p, suite, &[3u8; 32], &[1u8; 32], &[2u8; 32], &[4u8; 8], &[5u8; 8])
            .unwrap()
    }

    fn header() -> IkeHeader {
        IkeHeader::new(
            [4u8; 8],
            [5u8; 8],
            ExchangeType::Informational,
            IkeFlags::request(true),
            7,
        )
    }

    fn payloads() -> Vec<Payload> {
        vec![
            Payload::Notify(NotifyPayload::new(NotifyType::InitialContact.to_u16(), Vec::new())),
            Payload::Nonce(NoncePayload::new(vec![9u8; 20]).unwrap()),
        ]
    }

    fn open(
        raw: &[u8],
        suite: &Phase1Attributes,
        keys: &IkeSaKeys,
        receiver_is_initiator: bool,
    ) -> Result<Vec<Payload>> {
        let p = DefaultProvider::new();
        let msg = IkeMessage::decode(raw)?;
        let Some(Payload::Encrypted(sk)) = msg.payloads.last() else {
            panic!("no encrypted payload");
        };
        let cipher = SkCipher::inbound(suite, keys, receiver_is_initiator);
        unprotect(&p, &cipher, raw, sk)
    }

    #[test]
    fn test_cbc_roundtrip_between_roles() {
        let p = DefaultProvider::new();
        let suite = suite(EncryptionAlgorithm::AesCbc);
        let keys = keys(&suite);

        let cipher = SkCipher::outbound(&suite, &keys, true);
        let raw = protect(&p, &cipher, &header(), &payloads()).unwrap();
        let body_len = raw.len() - IKE_HEADER_SIZE - PayloadHeader::SIZE - 16 - 16;
        assert_eq!(body_len % 16, 0);
        assert_eq!(raw[16], PayloadType::SK.to_u8());

        assert_eq!(open(&raw, &suite, &keys, false).unwrap(), payloads());
        // The sender's own inbound keys do not open it
        assert!(open(&raw, &suite, &keys, true).is_err());
    }

    #[test]
    fn test_gcm_roundtrip() {
        let p = DefaultProvider::new();
        let suite = suite(EncryptionAlgorithm::AesGcm16);
        let keys = keys(&suite);
        assert_eq!(keys.sk_er.len(), 20);
        assert!(keys.sk_ar.is_empty());

        let cipher = SkCipher::outbound(&suite, &keys, false);
        let raw = protect(&p, &cipher, &header(), &payloads()).unwrap();
        assert_eq!(open(&raw, &suite, &keys, true).unwrap(), payloads());
    }

    #[test]
    fn test_tampering_detected() {
        let p = DefaultProvider::new();
        for enc in [EncryptionAlgorithm::AesCbc, EncryptionAlgorithm::AesGcm16] {
            let suite = suite(enc);
            let keys = keys(&suite);
            let cipher = SkCipher::outbound(&suite, &keys, true);
            let raw = protect(&p, &cipher, &header(), &payloads()).unwrap();

            // ciphertext
            let mut bad = raw.clone();
            let last = bad.len() - 20;
            bad[last] ^= 0x01;
            assert!(matches!(open(&bad, &suite, &keys, false), Err(Error::CryptoError(_))));

            // message id is authenticated too
            let mut bad = raw.clone();
            bad[23] ^= 0x01;
            assert!(matches!(open(&bad, &suite, &keys, false), Err(Error::CryptoError(_))));
        }
    }

    #[test]
    fn test_empty_inner_payloads() {
        let p = DefaultProvider::new();
        let suite = suite(EncryptionAlgorithm::AesCbc);
        let keys = keys(&suite);
        let raw = protect(&p, &SkCipher::outbound(&suite, &keys, true), &header(), &[]).unwrap();
        assert!(open(&raw, &suite, &keys, false).unwrap().is_empty());
    }
}
