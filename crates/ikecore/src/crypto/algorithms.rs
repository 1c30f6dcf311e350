//! Algorithm identifiers shared by both IKE versions
//!
//! Each enum maps to the IKEv2 transform IDs (RFC 7296 Section 3.3.2)
//! and to the IKEv1 attribute values (RFC 2409 Appendix A, RFC 2407
//! Section 4.5) so negotiation code works on one vocabulary.

/// Hash functions used for HMAC, legacy HASH payloads and IVs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// IKEv1 Phase 1 hash attribute value
    pub fn v1_attribute(self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha256 => 4,
            HashAlgorithm::Sha384 => 5,
            HashAlgorithm::Sha512 => 6,
        }
    }

    /// Parse IKEv1 Phase 1 hash attribute value
    pub fn from_v1_attribute(value: u16) -> Option<Self> {
        match value {
            2 => Some(HashAlgorithm::Sha1),
            4 => Some(HashAlgorithm::Sha256),
            5 => Some(HashAlgorithm::Sha384),
            6 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Pseudo-random functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrfAlgorithm {
    /// PRF_HMAC_SHA1
    HmacSha1,
    /// PRF_AES128_XCBC
    Aes128Xcbc,
    /// PRF_HMAC_SHA2_256
    HmacSha256,
    /// PRF_HMAC_SHA2_384
    HmacSha384,
    /// PRF_HMAC_SHA2_512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::Aes128Xcbc => 16,
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Preferred key length in bytes (also the SK_d/SK_p length)
    pub fn key_len(self) -> usize {
        self.output_len()
    }

    /// Underlying hash for HMAC based PRFs
    pub fn hash(self) -> Option<HashAlgorithm> {
        match self {
            PrfAlgorithm::HmacSha1 => Some(HashAlgorithm::Sha1),
            PrfAlgorithm::Aes128Xcbc => None,
            PrfAlgorithm::HmacSha256 => Some(HashAlgorithm::Sha256),
            PrfAlgorithm::HmacSha384 => Some(HashAlgorithm::Sha384),
            PrfAlgorithm::HmacSha512 => Some(HashAlgorithm::Sha512),
        }
    }

    /// HMAC PRF built on a negotiated IKEv1 hash
    pub fn from_hash(hash: HashAlgorithm) -> Self {
        match hash {
            HashAlgorithm::Sha1 => PrfAlgorithm::HmacSha1,
            HashAlgorithm::Sha256 => PrfAlgorithm::HmacSha256,
            HashAlgorithm::Sha384 => PrfAlgorithm::HmacSha384,
            HashAlgorithm::Sha512 => PrfAlgorithm::HmacSha512,
        }
    }

    /// IKEv2 transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            PrfAlgorithm::HmacSha1 => 2,
            PrfAlgorithm::Aes128Xcbc => 4,
            PrfAlgorithm::HmacSha256 => 5,
            PrfAlgorithm::HmacSha384 => 6,
            PrfAlgorithm::HmacSha512 => 7,
        }
    }

    /// Parse IKEv2 transform ID
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            2 => Some(PrfAlgorithm::HmacSha1),
            4 => Some(PrfAlgorithm::Aes128Xcbc),
            5 => Some(PrfAlgorithm::HmacSha256),
            6 => Some(PrfAlgorithm::HmacSha384),
            7 => Some(PrfAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// Integrity (MAC) algorithms for IKE SK payloads and child SAs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityAlgorithm {
    /// AUTH_HMAC_SHA1_96
    HmacSha1_96,
    /// AUTH_HMAC_SHA2_256_128
    HmacSha256_128,
    /// AUTH_HMAC_SHA2_384_192
    HmacSha384_192,
    /// AUTH_HMAC_SHA2_512_256
    HmacSha512_256,
}

impl IntegrityAlgorithm {
    /// Key length in bytes
    pub fn key_len(self) -> usize {
        self.hash().output_len()
    }

    /// Truncated checksum length in bytes
    pub fn icv_len(self) -> usize {
        match self {
            IntegrityAlgorithm::HmacSha1_96 => 12,
            IntegrityAlgorithm::HmacSha256_128 => 16,
            IntegrityAlgorithm::HmacSha384_192 => 24,
            IntegrityAlgorithm::HmacSha512_256 => 32,
        }
    }

    /// Underlying hash
    pub fn hash(self) -> HashAlgorithm {
        match self {
            IntegrityAlgorithm::HmacSha1_96 => HashAlgorithm::Sha1,
            IntegrityAlgorithm::HmacSha256_128 => HashAlgorithm::Sha256,
            IntegrityAlgorithm::HmacSha384_192 => HashAlgorithm::Sha384,
            IntegrityAlgorithm::HmacSha512_256 => HashAlgorithm::Sha512,
        }
    }

    /// IKEv2 transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            IntegrityAlgorithm::HmacSha1_96 => 2,
            IntegrityAlgorithm::HmacSha256_128 => 12,
            IntegrityAlgorithm::HmacSha384_192 => 13,
            IntegrityAlgorithm::HmacSha512_256 => 14,
        }
    }

    /// Parse IKEv2 transform ID
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            2 => Some(IntegrityAlgorithm::HmacSha1_96),
            12 => Some(IntegrityAlgorithm::HmacSha256_128),
            13 => Some(IntegrityAlgorithm::HmacSha384_192),
            14 => Some(IntegrityAlgorithm::HmacSha512_256),
            _ => None,
        }
    }

    /// IKEv1 IPsec DOI authentication algorithm attribute value
    pub fn v1_attribute(self) -> u16 {
        match self {
            IntegrityAlgorithm::HmacSha1_96 => 2,
            IntegrityAlgorithm::HmacSha256_128 => 5,
            IntegrityAlgorithm::HmacSha384_192 => 6,
            IntegrityAlgorithm::HmacSha512_256 => 7,
        }
    }

    /// Parse IKEv1 IPsec DOI authentication algorithm attribute value
    pub fn from_v1_attribute(value: u16) -> Option<Self> {
        match value {
            2 => Some(IntegrityAlgorithm::HmacSha1_96),
            5 => Some(IntegrityAlgorithm::HmacSha256_128),
            6 => Some(IntegrityAlgorithm::HmacSha384_192),
            7 => Some(IntegrityAlgorithm::HmacSha512_256),
            _ => None,
        }
    }

    /// IKEv1 AH transform ID
    pub fn v1_ah_transform_id(self) -> u8 {
        match self {
            IntegrityAlgorithm::HmacSha1_96 => 3,
            IntegrityAlgorithm::HmacSha256_128 => 5,
            IntegrityAlgorithm::HmacSha384_192 => 6,
            IntegrityAlgorithm::HmacSha512_256 => 7,
        }
    }

    /// Parse IKEv1 AH transform ID
    pub fn from_v1_ah_transform_id(id: u8) -> Option<Self> {
        match id {
            3 => Some(IntegrityAlgorithm::HmacSha1_96),
            5 => Some(IntegrityAlgorithm::HmacSha256_128),
            6 => Some(IntegrityAlgorithm::HmacSha384_192),
            7 => Some(IntegrityAlgorithm::HmacSha512_256),
            _ => None,
        }
    }
}

/// Encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    /// ENCR_3DES
    TripleDes,
    /// ENCR_AES_CBC
    AesCbc,
    /// ENCR_AES_GCM_16 (AEAD)
    AesGcm16,
    /// ENCR_NULL (ESP only)
    Null,
}

impl EncryptionAlgorithm {
    /// IKEv2 / ESP transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            EncryptionAlgorithm::TripleDes => 3,
            EncryptionAlgorithm::Null => 11,
            EncryptionAlgorithm::AesCbc => 12,
            EncryptionAlgorithm::AesGcm16 => 20,
        }
    }

    /// Parse IKEv2 / ESP transform ID
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            3 => Some(EncryptionAlgorithm::TripleDes),
            11 => Some(EncryptionAlgorithm::Null),
            12 => Some(EncryptionAlgorithm::AesCbc),
            20 => Some(EncryptionAlgorithm::AesGcm16),
            _ => None,
        }
    }

    /// IKEv1 Phase 1 encryption attribute value (Oakley)
    pub fn v1_attribute(self) -> Option<u16> {
        match self {
            EncryptionAlgorithm::TripleDes => Some(5),
            EncryptionAlgorithm::AesCbc => Some(7),
            _ => None,
        }
    }

    /// Parse IKEv1 Phase 1 encryption attribute value
    pub fn from_v1_attribute(value: u16) -> Option<Self> {
        match value {
            5 => Some(EncryptionAlgorithm::TripleDes),
            7 => Some(EncryptionAlgorithm::AesCbc),
            _ => None,
        }
    }

    /// Cipher block size in bytes
    pub fn block_size(self) -> usize {
        match self {
            EncryptionAlgorithm::TripleDes => 8,
            EncryptionAlgorithm::AesCbc | EncryptionAlgorithm::AesGcm16 => 16,
            EncryptionAlgorithm::Null => 1,
        }
    }

    /// Length of the explicit IV carried on the wire
    pub fn iv_len(self) -> usize {
        match self {
            EncryptionAlgorithm::TripleDes | EncryptionAlgorithm::AesGcm16 => 8,
            EncryptionAlgorithm::AesCbc => 16,
            EncryptionAlgorithm::Null => 0,
        }
    }

    /// Whether the key length is negotiated with a key-length attribute
    pub fn has_variable_key_len(self) -> bool {
        matches!(
            self,
            EncryptionAlgorithm::AesCbc | EncryptionAlgorithm::AesGcm16
        )
    }

    /// Key length in bits for fixed-length ciphers
    pub fn fixed_key_bits(self) -> Option<u16> {
        match self {
            EncryptionAlgorithm::TripleDes => Some(192),
            EncryptionAlgorithm::Null => Some(0),
            _ => None,
        }
    }

    /// Key length a key-length attribute must carry for this cipher
    ///
    /// `configured_bits` is the locally configured key length; it is
    /// ignored for fixed-length ciphers.
    pub fn expected_key_bits(self, configured_bits: Option<u16>) -> Option<u16> {
        match self.fixed_key_bits() {
            Some(bits) => Some(bits),
            None => configured_bits.or(Some(128)),
        }
    }

    /// Whether the cipher provides integrity itself
    pub fn is_aead(self) -> bool {
        matches!(self, EncryptionAlgorithm::AesGcm16)
    }

    /// Bytes of keying material taken from the key stream for a key of
    /// `key_bits` (GCM carries a 4 byte salt after the key)
    pub fn keymat_len(self, key_bits: u16) -> usize {
        let key = (key_bits / 8) as usize;
        match self {
            EncryptionAlgorithm::AesGcm16 => key + 4,
            _ => key,
        }
    }
}

/// Diffie-Hellman groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    /// 768-bit MODP (group 1)
    Modp768,
    /// 1024-bit MODP (group 2)
    Modp1024,
    /// 1536-bit MODP (group 5)
    Modp1536,
    /// 2048-bit MODP (group 14)
    Modp2048,
    /// 256-bit random ECP (group 19)
    Ecp256,
    /// 384-bit random ECP (group 20)
    Ecp384,
    /// Curve25519 (group 31)
    Curve25519,
}

impl DhGroup {
    /// Group number on the wire (same in both versions)
    pub fn number(self) -> u16 {
        match self {
            DhGroup::Modp768 => 1,
            DhGroup::Modp1024 => 2,
            DhGroup::Modp1536 => 5,
            DhGroup::Modp2048 => 14,
            DhGroup::Ecp256 => 19,
            DhGroup::Ecp384 => 20,
            DhGroup::Curve25519 => 31,
        }
    }

    /// Parse group number
    pub fn from_number(n: u16) -> Option<Self> {
        match n {
            1 => Some(DhGroup::Modp768),
            2 => Some(DhGroup::Modp1024),
            5 => Some(DhGroup::Modp1536),
            14 => Some(DhGroup::Modp2048),
            19 => Some(DhGroup::Ecp256),
            20 => Some(DhGroup::Ecp384),
            31 => Some(DhGroup::Curve25519),
            _ => None,
        }
    }

    /// Length of the public value carried in a KE payload
    pub fn public_len(self) -> usize {
        match self {
            DhGroup::Modp768 => 96,
            DhGroup::Modp1024 => 128,
            DhGroup::Modp1536 => 192,
            DhGroup::Modp2048 => 256,
            DhGroup::Ecp256 => 64,
            DhGroup::Ecp384 => 96,
            DhGroup::Curve25519 => 32,
        }
    }
}

/// Signature algorithms for certificate based authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// Ed25519
    Ed25519,
}
