//! ISAKMP / IKEv1 protocol constants (RFC 2408, RFC 2409, RFC 2407)

/// ISAKMP version 1.0 (major 1, minor 0)
pub const ISAKMP_VERSION: u8 = 0x10;

/// ISAKMP header size (28 bytes)
pub const ISAKMP_HEADER_SIZE: usize = 28;

/// Maximum message size accepted
pub const MAX_ISAKMP_MESSAGE_SIZE: u32 = 65535;

/// IPsec Domain of Interpretation (RFC 2407 Section 4.2)
pub const DOI_IPSEC: u32 = 1;

/// SIT_IDENTITY_ONLY situation
pub const SIT_IDENTITY_ONLY: u32 = 1;

/// KEY_IKE transform ID for Phase 1 proposals
pub const KEY_IKE: u8 = 1;

/// Phase 2 SPI size
pub const IPSEC_SPI_SIZE: usize = 4;

/// Attribute format bit for TV encoded attributes
pub const ATTR_FORMAT_TV: u16 = 0x8000;

/// Life type: seconds
pub const LIFE_TYPE_SECONDS: u16 = 1;

/// Life type: kilobytes
pub const LIFE_TYPE_KILOBYTES: u16 = 2;

/// Exchange types (RFC 2408 Section 3.1, RFC 2409 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// Base exchange
    Base = 1,
    /// Identity protection (Main Mode)
    IdentityProtection = 2,
    /// Authentication only
    AuthOnly = 3,
    /// Aggressive Mode
    Aggressive = 4,
    /// Informational
    Informational = 5,
    /// Quick Mode
    Quick = 32,
    /// New Group Mode
    NewGroup = 33,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ExchangeType::Base),
            2 => Some(ExchangeType::IdentityProtection),
            3 => Some(ExchangeType::AuthOnly),
            4 => Some(ExchangeType::Aggressive),
            5 => Some(ExchangeType::Informational),
            32 => Some(ExchangeType::Quick),
            33 => Some(ExchangeType::NewGroup),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            ExchangeType::Base => "BASE",
            ExchangeType::IdentityProtection => "MAIN_MODE",
            ExchangeType::AuthOnly => "AUTH_ONLY",
            ExchangeType::Aggressive => "AGGRESSIVE_MODE",
            ExchangeType::Informational => "INFORMATIONAL",
            ExchangeType::Quick => "QUICK_MODE",
            ExchangeType::NewGroup => "NEW_GROUP",
        }
    }
}

/// ISAKMP header flags (RFC 2408 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsakmpFlags(u8);

impl IsakmpFlags {
    /// Payloads after the header are encrypted
    pub const ENCRYPTION: u8 = 0x01;
    /// Commit bit (delay SA use until CONNECTED)
    pub const COMMIT: u8 = 0x02;
    /// Authentication only
    pub const AUTH_ONLY: u8 = 0x04;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IsakmpFlags(value & 0x07)
    }

    /// Raw value
    pub fn value(self) -> u8 {
        self.0
    }

    /// Whether the body is encrypted
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTION != 0
    }

    /// Whether the commit bit is set
    pub fn is_commit(self) -> bool {
        self.0 & Self::COMMIT != 0
    }

    /// Copy with the encryption bit set
    pub fn encrypted(self) -> Self {
        IsakmpFlags(self.0 | Self::ENCRYPTION)
    }

    /// Copy with the commit bit set
    pub fn with_commit(self) -> Self {
        IsakmpFlags(self.0 | Self::COMMIT)
    }
}

/// Payload types (RFC 2408 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload
    None = 0,
    /// Security Association
    Sa = 1,
    /// Proposal
    Proposal = 2,
    /// Transform
    Transform = 3,
    /// Key Exchange
    Ke = 4,
    /// Identification
    Id = 5,
    /// Certificate
    Cert = 6,
    /// Certificate Request
    CertReq = 7,
    /// Hash
    Hash = 8,
    /// Signature
    Sig = 9,
    /// Nonce
    Nonce = 10,
    /// Notification
    Notify = 11,
    /// Delete
    Delete = 12,
    /// Vendor ID
    Vendor = 13,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            1 => Some(PayloadType::Sa),
            2 => Some(PayloadType::Proposal),
            3 => Some(PayloadType::Transform),
            4 => Some(PayloadType::Ke),
            5 => Some(PayloadType::Id),
            6 => Some(PayloadType::Cert),
            7 => Some(PayloadType::CertReq),
            8 => Some(PayloadType::Hash),
            9 => Some(PayloadType::Sig),
            10 => Some(PayloadType::Nonce),
            11 => Some(PayloadType::Notify),
            12 => Some(PayloadType::Delete),
            13 => Some(PayloadType::Vendor),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol IDs (RFC 2407 Section 4.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// PROTO_ISAKMP
    Isakmp = 1,
    /// PROTO_IPSEC_AH
    Ah = 2,
    /// PROTO_IPSEC_ESP
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Isakmp),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Phase 1 (Oakley) attribute types (RFC 2409 Appendix A)
pub mod oakley {
    /// Encryption algorithm
    pub const ENCRYPTION: u16 = 1;
    /// Hash algorithm
    pub const HASH: u16 = 2;
    /// Authentication method
    pub const AUTH_METHOD: u16 = 3;
    /// Group description
    pub const GROUP_DESCRIPTION: u16 = 4;
    /// Life type
    pub const LIFE_TYPE: u16 = 11;
    /// Life duration
    pub const LIFE_DURATION: u16 = 12;
    /// Key length
    pub const KEY_LENGTH: u16 = 14;

    /// Pre-shared key authentication
    pub const AUTH_PRE_SHARED: u16 = 1;
    /// Ed25519 signatures (private use range)
    pub const AUTH_ED25519: u16 = 65001;
}

/// Phase 2 (IPsec DOI) attribute types (RFC 2407 Section 4.5)
pub mod ipsec {
    /// SA life type
    pub const SA_LIFE_TYPE: u16 = 1;
    /// SA life duration
    pub const SA_LIFE_DURATION: u16 = 2;
    /// Group description (PFS)
    pub const GROUP_DESCRIPTION: u16 = 3;
    /// Encapsulation mode
    pub const ENCAPSULATION_MODE: u16 = 4;
    /// Authentication algorithm
    pub const AUTH_ALGORITHM: u16 = 5;
    /// Key length
    pub const KEY_LENGTH: u16 = 6;

    /// Tunnel encapsulation
    pub const ENCAP_TUNNEL: u16 = 1;
    /// Transport encapsulation
    pub const ENCAP_TRANSPORT: u16 = 2;
}

/// IPsec DOI identification types (RFC 2407 Section 4.6.2.1)
pub mod id_type {
    /// Single IPv4 address
    pub const IPV4_ADDR: u8 = 1;
    /// Fully qualified domain name
    pub const FQDN: u8 = 2;
    /// User FQDN (RFC 822 address)
    pub const USER_FQDN: u8 = 3;
    /// IPv4 address and mask
    pub const IPV4_ADDR_SUBNET: u8 = 4;
    /// Single IPv6 address
    pub const IPV6_ADDR: u8 = 5;
    /// IPv6 address and mask
    pub const IPV6_ADDR_SUBNET: u8 = 6;
    /// IPv4 address range
    pub const IPV4_ADDR_RANGE: u8 = 7;
    /// IPv6 address range
    pub const IPV6_ADDR_RANGE: u8 = 8;
}

/// Notify message types (RFC 2408 Section 3.14.1, RFC 2407 Section 4.6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// INVALID-PAYLOAD-TYPE
    InvalidPayloadType = 1,
    /// DOI-NOT-SUPPORTED
    DoiNotSupported = 2,
    /// SITUATION-NOT-SUPPORTED
    SituationNotSupported = 3,
    /// INVALID-COOKIE
    InvalidCookie = 4,
    /// INVALID-MAJOR-VERSION
    InvalidMajorVersion = 5,
    /// INVALID-MINOR-VERSION
    InvalidMinorVersion = 6,
    /// INVALID-EXCHANGE-TYPE
    InvalidExchangeType = 7,
    /// INVALID-FLAGS
    InvalidFlags = 8,
    /// INVALID-MESSAGE-ID
    InvalidMessageId = 9,
    /// INVALID-PROTOCOL-ID
    InvalidProtocolId = 10,
    /// INVALID-SPI
    InvalidSpi = 11,
    /// INVALID-TRANSFORM-ID
    InvalidTransformId = 12,
    /// ATTRIBUTES-NOT-SUPPORTED
    AttributesNotSupported = 13,
    /// NO-PROPOSAL-CHOSEN
    NoProposalChosen = 14,
    /// BAD-PROPOSAL-SYNTAX
    BadProposalSyntax = 15,
    /// PAYLOAD-MALFORMED
    PayloadMalformed = 16,
    /// INVALID-KEY-INFORMATION
    InvalidKeyInformation = 17,
    /// INVALID-ID-INFORMATION
    InvalidIdInformation = 18,
    /// INVALID-HASH-INFORMATION
    InvalidHashInformation = 23,
    /// AUTHENTICATION-FAILED
    AuthenticationFailed = 24,
    /// INVALID-SIGNATURE
    InvalidSignature = 25,
    /// CONNECTED
    Connected = 16384,
    /// RESPONDER-LIFETIME
    ResponderLifetime = 24576,
    /// REPLAY-STATUS
    ReplayStatus = 24577,
    /// INITIAL-CONTACT
    InitialContact = 24578,
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        let t = match value {
            1 => NotifyType::InvalidPayloadType,
            2 => NotifyType::DoiNotSupported,
            3 => NotifyType::SituationNotSupported,
            4 => NotifyType::InvalidCookie,
            5 => NotifyType::InvalidMajorVersion,
            6 => NotifyType::InvalidMinorVersion,
            7 => NotifyType::InvalidExchangeType,
            8 => NotifyType::InvalidFlags,
            9 => NotifyType::InvalidMessageId,
            10 => NotifyType::InvalidProtocolId,
            11 => NotifyType::InvalidSpi,
            12 => NotifyType::InvalidTransformId,
            13 => NotifyType::AttributesNotSupported,
            14 => NotifyType::NoProposalChosen,
            15 => NotifyType::BadProposalSyntax,
            16 => NotifyType::PayloadMalformed,
            17 => NotifyType::InvalidKeyInformation,
            18 => NotifyType::InvalidIdInformation,
            23 => NotifyType::InvalidHashInformation,
            24 => NotifyType::AuthenticationFailed,
            25 => NotifyType::InvalidSignature,
            16384 => NotifyType::Connected,
            24576 => NotifyType::ResponderLifetime,
            24577 => NotifyType::ReplayStatus,
            24578 => NotifyType::InitialContact,
            _ => return None,
        };
        Some(t)
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether a raw type is in the error range (1..16383)
    pub fn is_error_type(value: u16) -> bool {
        (1..16384).contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(2), Some(ExchangeType::IdentityProtection));
        assert_eq!(ExchangeType::from_u8(32), Some(ExchangeType::Quick));
        assert_eq!(ExchangeType::from_u8(34), None);
        assert_eq!(ExchangeType::Aggressive.to_u8(), 4);
    }

    #[test]
    fn test_flags() {
        let flags = IsakmpFlags::new(0xff);
        assert_eq!(flags.value(), 0x07);
        assert!(flags.is_encrypted());
        assert!(flags.is_commit());

        let plain = IsakmpFlags::default();
        assert!(!plain.is_encrypted());
        assert!(plain.encrypted().is_encrypted());
        assert!(plain.with_commit().is_commit());
    }

    #[test]
    fn test_notify_ranges() {
        assert!(NotifyType::is_error_type(NotifyType::NoProposalChosen.to_u16()));
        assert!(!NotifyType::is_error_type(NotifyType::Connected.to_u16()));
        assert!(!NotifyType::is_error_type(NotifyType::InitialContact.to_u16()));
        assert_eq!(NotifyType::from_u16(24578), Some(NotifyType::InitialContact));
        assert_eq!(NotifyType::from_u16(19), None);
    }
}
