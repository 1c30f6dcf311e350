//! ISAKMP payload encryption (RFC 2409 Appendix B)
//!
//! ```text
//! +---------------+-------------------------------------------+
//! | ISAKMP header | payloads | zero padding to the block size |
//! +---------------+-------------------------------------------+
//!                 |<-------------- CBC ciphertext ---------->|
//! ```
//!
//! There is no explicit IV on the wire. Both sides chain the IV: the
//! last ciphertext block of one message is the IV of the next message
//! of the same exchange. The caller commits the returned IV only once
//! the message has been sent or verified.

use bytes::{BufMut, BytesMut};

use super::constants::ISAKMP_HEADER_SIZE;
use super::message::{decode_payloads, encode_payloads, IsakmpHeader, Payload, PayloadChain};
use crate::crypto::{CryptoProvider, EncryptionAlgorithm};
use crate::error::{Error, Result};

/// Negotiated Phase 1 cipher and key
#[derive(Debug, Clone, Copy)]
pub struct Phase1Cipher<'a> {
    /// Cipher (CBC mode)
    pub encryption: EncryptionAlgorithm,
    /// Key derived from SKEYID_e
    pub key: &'a [u8],
}

impl Phase1Cipher<'_> {
    fn block_size(&self) -> usize {
        self.encryption.block_size()
    }
}

/// Encrypted message with the IV for the next message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Wire message
    pub data: Vec<u8>,
    /// Last ciphertext block
    pub next_iv: Vec<u8>,
}

/// Serialize and encrypt `payloads` under `iv`
///
/// The header's encryption flag, next-payload and length fields are
/// overwritten.
pub fn seal(
    provider: &dyn CryptoProvider,
    cipher: &Phase1Cipher<'_>,
    iv: &[u8],
    header: &IsakmpHeader,
    payloads: &[Payload],
) -> Result<Sealed> {
    let (first, body) = encode_payloads(payloads);
    let block = cipher.block_size();
    let padded_len = body.len().div_ceil(block).max(1) * block;
    let mut plaintext = body.to_vec();
    plaintext.resize(padded_len, 0);

    let ciphertext = provider.encrypt(cipher.encryption, cipher.key, iv, &plaintext, &[])?;
    let next_iv = ciphertext[ciphertext.len() - block..].to_vec();

    let mut header = header.clone();
    header.flags = header.flags.encrypted();
    header.next_payload = first;
    header.length = (ISAKMP_HEADER_SIZE + ciphertext.len()) as u32;

    let mut buf = BytesMut::with_capacity(header.length as usize);
    buf.put_slice(&header.to_bytes());
    buf.put_slice(&ciphertext);
    Ok(Sealed {
        data: buf.to_vec(),
        next_iv,
    })
}

/// Decrypted message with the IV for the next message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    /// Header as received
    pub header: IsakmpHeader,
    /// Decrypted payload chain
    pub chain: PayloadChain,
    /// Last ciphertext block
    pub next_iv: Vec<u8>,
}

/// Decrypt a received message with the encryption flag set
///
/// # Errors
///
/// Returns [`Error::InvalidLength`] when the ciphertext is empty or not
/// a whole number of blocks, and the codec error when the plaintext
/// does not parse (usually a wrong key or IV).
pub fn open(
    provider: &dyn CryptoProvider,
    cipher: &Phase1Cipher<'_>,
    iv: &[u8],
    data: &[u8],
) -> Result<Opened> {
    let header = IsakmpHeader::from_bytes(data)?;
    if !header.flags.is_encrypted() {
        return Err(Error::InvalidMessage("Expected an encrypted message".into()));
    }
    let ciphertext = &data[ISAKMP_HEADER_SIZE..header.length as usize];
    let block = cipher.block_size();
    if ciphertext.is_empty() || ciphertext.len() % block != 0 {
        return Err(Error::InvalidLength {
            expected: ciphertext.len().div_ceil(block).max(1) * block,
            actual: ciphertext.len(),
        });
    }

    let plaintext = provider.decrypt(cipher.encryption, cipher.key, iv, ciphertext, &[])?;
    let chain = decode_payloads(header.next_payload, &plaintext, true)?;
    Ok(Opened {
        header,
        chain,
        next_iv: ciphertext[ciphertext.len() - block..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultProvider;
    use crate::ikev1::constants::{ExchangeType, IsakmpFlags, NotifyType};
    use crate::ikev1::message::NotifyPayload;

    fn header() -> IsakmpHeader {
        IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Quick, IsakmpFlags::default(), 0x1234)
    }

    #[test]
    fn test_seal_open_chains_iv() {
        let p = DefaultProvider::new();
        let key = [7u8; 16];
        let cipher = Phase1Cipher {
            encryption: EncryptionAlgorithm::AesCbc,
            key: &key,
        };
        let iv = [0u8; 16];
        let payloads = vec![
            Payload::Hash(vec![1; 20]),
            Payload::Notify(NotifyPayload::new(NotifyType::Connected, Vec::new())),
        ];

        let sealed = seal(&p, &cipher, &iv, &header(), &payloads).unwrap();
        assert_eq!((sealed.data.len() - ISAKMP_HEADER_SIZE) % 16, 0);
        assert_eq!(sealed.next_iv, sealed.data[sealed.data.len() - 16..].to_vec());

        let opened = open(&p, &cipher, &iv, &sealed.data).unwrap();
        assert!(opened.header.flags.is_encrypted());
        assert_eq!(opened.chain.payloads, payloads);
        assert_eq!(opened.next_iv, sealed.next_iv);

        // a message sealed under the chained IV does not open under the old one
        let second = seal(&p, &cipher, &sealed.next_iv, &header(), &payloads).unwrap();
        assert!(open(&p, &cipher, &sealed.next_iv, &second.data).is_ok());
        assert_ne!(
            open(&p, &cipher, &iv, &second.data).map(|o| o.chain.payloads).ok(),
            Some(payloads)
        );
    }

    #[test]
    fn test_open_rejects_partial_blocks() {
        let p = DefaultProvider::new();
        let key = [7u8; 32];
        let cipher = Phase1Cipher {
            encryption: EncryptionAlgorithm::AesCbc,
            key: &key,
        };
        let sealed = seal(&p, &cipher, &[0; 16], &header(), &[Payload::Hash(vec![1; 20])]).unwrap();
        let mut cut = sealed.data[..sealed.data.len() - 3].to_vec();
        let len = cut.len() as u32;
        cut[24..28].copy_from_slice(&len.to_be_bytes());
        assert!(matches!(
            open(&p, &cipher, &[0; 16], &cut),
            Err(Error::InvalidLength { .. })
        ));

        let plain = crate::ikev1::message::IsakmpMessage::new(header(), Vec::new()).encode();
        assert!(open(&p, &cipher, &[0; 16], &plain).is_err());
    }
}
