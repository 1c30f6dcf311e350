//! IKEv2 protocol constants from RFC 7296

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Maximum IKE message size (64KB - 1)
pub const MAX_IKE_MESSAGE_SIZE: u32 = 65535;

/// IKE header size (28 bytes)
pub const IKE_HEADER_SIZE: usize = 28;

/// Key Length transform attribute type (RFC 7296 Section 3.3.5)
pub const ATTR_KEY_LENGTH: u16 = 14;

/// Attribute format bit for TV encoded attributes
pub const ATTR_FORMAT_TV: u16 = 0x8000;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE message flags (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Response flag (bit 5)
    pub const RESPONSE: u8 = 0x20;
    /// Version flag (bit 4)
    pub const VERSION: u8 = 0x10;
    /// Initiator flag (bit 3)
    pub const INITIATOR: u8 = 0x08;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IkeFlags(value & 0x38) // Mask to only keep bits 3-5
    }

    /// Flags for a request sent by the original initiator or responder
    pub fn request(is_initiator: bool) -> Self {
        if is_initiator {
            IkeFlags(Self::INITIATOR)
        } else {
            IkeFlags(0)
        }
    }

    /// Flags for a response sent by the original initiator or responder
    pub fn response(is_initiator: bool) -> Self {
        let mut flags = Self::RESPONSE;
        if is_initiator {
            flags |= Self::INITIATOR;
        }
        IkeFlags(flags)
    }

    /// Check if this is a response
    pub fn is_response(self) -> bool {
        (self.0 & Self::RESPONSE) != 0
    }

    /// Check if this is from the original initiator
    pub fn is_initiator(self) -> bool {
        (self.0 & Self::INITIATOR) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    SA = 33,
    /// Key Exchange (34)
    KE = 34,
    /// Identification - Initiator (35)
    IDi = 35,
    /// Identification - Responder (36)
    IDr = 36,
    /// Certificate (37)
    CERT = 37,
    /// Certificate Request (38)
    CERTREQ = 38,
    /// Authentication (39)
    AUTH = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    N = 41,
    /// Delete (42)
    D = 42,
    /// Vendor ID (43)
    V = 43,
    /// Traffic Selector - Initiator (44)
    TSi = 44,
    /// Traffic Selector - Responder (45)
    TSr = 45,
    /// Encrypted and Authenticated (46)
    SK = 46,
    /// Configuration (47)
    CP = 47,
    /// Extensible Authentication (48)
    EAP = 48,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::SA),
            34 => Some(PayloadType::KE),
            35 => Some(PayloadType::IDi),
            36 => Some(PayloadType::IDr),
            37 => Some(PayloadType::CERT),
            38 => Some(PayloadType::CERTREQ),
            39 => Some(PayloadType::AUTH),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::N),
            42 => Some(PayloadType::D),
            43 => Some(PayloadType::V),
            44 => Some(PayloadType::TSi),
            45 => Some(PayloadType::TSr),
            46 => Some(PayloadType::SK),
            47 => Some(PayloadType::CP),
            48 => Some(PayloadType::EAP),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notify message types (RFC 7296 Section 3.10.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// UNSUPPORTED_CRITICAL_PAYLOAD
    UnsupportedCriticalPayload = 1,
    /// INVALID_IKE_SPI
    InvalidIkeSpi = 4,
    /// INVALID_MAJOR_VERSION
    InvalidMajorVersion = 5,
    /// INVALID_SYNTAX
    InvalidSyntax = 7,
    /// INVALID_MESSAGE_ID
    InvalidMessageId = 9,
    /// INVALID_SPI
    InvalidSpi = 11,
    /// NO_PROPOSAL_CHOSEN
    NoProposalChosen = 14,
    /// INVALID_KE_PAYLOAD
    InvalidKePayload = 17,
    /// AUTHENTICATION_FAILED
    AuthenticationFailed = 24,
    /// SINGLE_PAIR_REQUIRED
    SinglePairRequired = 34,
    /// NO_ADDITIONAL_SAS
    NoAdditionalSas = 35,
    /// INTERNAL_ADDRESS_FAILURE
    InternalAddressFailure = 36,
    /// FAILED_CP_REQUIRED
    FailedCpRequired = 37,
    /// TS_UNACCEPTABLE
    TsUnacceptable = 38,
    /// INVALID_SELECTORS
    InvalidSelectors = 39,
    /// TEMPORARY_FAILURE
    TemporaryFailure = 43,
    /// CHILD_SA_NOT_FOUND
    ChildSaNotFound = 44,
    /// INITIAL_CONTACT
    InitialContact = 16384,
    /// SET_WINDOW_SIZE
    SetWindowSize = 16385,
    /// ADDITIONAL_TS_POSSIBLE
    AdditionalTsPossible = 16386,
    /// IPCOMP_SUPPORTED
    IpcompSupported = 16387,
    /// NAT_DETECTION_SOURCE_IP
    NatDetectionSourceIp = 16388,
    /// NAT_DETECTION_DESTINATION_IP
    NatDetectionDestinationIp = 16389,
    /// COOKIE
    Cookie = 16390,
    /// USE_TRANSPORT_MODE
    UseTransportMode = 16391,
    /// HTTP_CERT_LOOKUP_SUPPORTED
    HttpCertLookupSupported = 16392,
    /// REKEY_SA
    RekeySa = 16393,
    /// ESP_TFC_PADDING_NOT_SUPPORTED
    EspTfcPaddingNotSupported = 16394,
    /// NON_FIRST_FRAGMENTS_ALSO
    NonFirstFragmentsAlso = 16395,
}

impl NotifyType {
    /// First status type; everything below is an error type
    pub const FIRST_STATUS: u16 = 16384;

    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        use NotifyType::*;
        let t = match value {
            1 => UnsupportedCriticalPayload,
            4 => InvalidIkeSpi,
            5 => InvalidMajorVersion,
            7 => InvalidSyntax,
            9 => InvalidMessageId,
            11 => InvalidSpi,
            14 => NoProposalChosen,
            17 => InvalidKePayload,
            24 => AuthenticationFailed,
            34 => SinglePairRequired,
            35 => NoAdditionalSas,
            36 => InternalAddressFailure,
            37 => FailedCpRequired,
            38 => TsUnacceptable,
            39 => InvalidSelectors,
            43 => TemporaryFailure,
            44 => ChildSaNotFound,
            16384 => InitialContact,
            16385 => SetWindowSize,
            16386 => AdditionalTsPossible,
            16387 => IpcompSupported,
            16388 => NatDetectionSourceIp,
            16389 => NatDetectionDestinationIp,
            16390 => Cookie,
            16391 => UseTransportMode,
            16392 => HttpCertLookupSupported,
            16393 => RekeySa,
            16394 => EspTfcPaddingNotSupported,
            16395 => NonFirstFragmentsAlso,
            _ => return None,
        };
        Some(t)
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether a raw notify type is in the error range
    pub fn is_error_type(value: u16) -> bool {
        value < Self::FIRST_STATUS
    }

    /// Whether receiving this type aborts processing of the message
    pub fn aborts_exchange(self) -> bool {
        matches!(
            self,
            NotifyType::InvalidIkeSpi
                | NotifyType::InvalidMajorVersion
                | NotifyType::InvalidSyntax
                | NotifyType::InvalidMessageId
                | NotifyType::InvalidSpi
                | NotifyType::NoProposalChosen
                | NotifyType::InvalidKePayload
                | NotifyType::AuthenticationFailed
                | NotifyType::SinglePairRequired
                | NotifyType::NoAdditionalSas
                | NotifyType::InternalAddressFailure
                | NotifyType::FailedCpRequired
                | NotifyType::TsUnacceptable
                | NotifyType::InvalidSelectors
        )
    }
}

/// Protocol ID in proposals, notify and delete payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH
    Ah = 2,
    /// ESP
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
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

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Diffie-Hellman Group (D-H)
    Dh = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Traffic selector types (RFC 7296 Section 3.13.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TsType {
    /// TS_IPV4_ADDR_RANGE
    Ipv4AddrRange = 7,
    /// TS_IPV6_ADDR_RANGE
    Ipv6AddrRange = 8,
}

impl TsType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            7 => Some(TsType::Ipv4AddrRange),
            8 => Some(TsType::Ipv6AddrRange),
            _ => None,
        }
    }

    /// Address length in bytes
    pub fn addr_len(self) -> usize {
        match self {
            TsType::Ipv4AddrRange => 4,
            TsType::Ipv6AddrRange => 16,
        }
    }
}

/// Authentication Method (RFC 7296 Section 3.8, RFC 7427)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA Digital Signature
    RsaSig = 1,
    /// Shared Key Message Integrity Code
    SharedKeyMic = 2,
    /// DSS Digital Signature
    DssSig = 3,
    /// Digital Signature with an ASN.1 algorithm identifier
    DigitalSignature = 14,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSig),
            2 => Some(AuthMethod::SharedKeyMic),
            3 => Some(AuthMethod::DssSig),
            14 => Some(AuthMethod::DigitalSignature),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(34), Some(ExchangeType::IkeSaInit));
        assert_eq!(ExchangeType::from_u8(36), Some(ExchangeType::CreateChildSa));
        assert_eq!(ExchangeType::from_u8(99), None);
        assert_eq!(ExchangeType::Informational.to_u8(), 37);
    }

    #[test]
    fn test_ike_flags() {
        let flags = IkeFlags::request(true);
        assert!(!flags.is_response());
        assert!(flags.is_initiator());

        let flags = IkeFlags::response(false);
        assert!(flags.is_response());
        assert!(!flags.is_initiator());

        // Version and reserved bits are masked
        assert_eq!(IkeFlags::new(0xff).value(), 0x38);
    }

    #[test]
    fn test_notify_classes() {
        assert_eq!(NotifyType::from_u16(16390), Some(NotifyType::Cookie));
        assert_eq!(NotifyType::from_u16(2), None);
        assert!(NotifyType::is_error_type(NotifyType::TsUnacceptable.to_u16()));
        assert!(!NotifyType::is_error_type(NotifyType::RekeySa.to_u16()));

        assert!(NotifyType::InvalidKePayload.aborts_exchange());
        assert!(NotifyType::InvalidSelectors.aborts_exchange());
        assert!(!NotifyType::TemporaryFailure.aborts_exchange());
        assert!(!NotifyType::InitialContact.aborts_exchange());
    }

    #[test]
    fn test_protocol_and_transform_ids() {
        assert_eq!(ProtocolId::from_u8(3), Some(ProtocolId::Esp));
        assert_eq!(ProtocolId::from_u8(4), None);
        assert_eq!(TransformType::from_u8(5), Some(TransformType::Esn));
        assert_eq!(TsType::from_u8(8).map(TsType::addr_len), Some(16));
        assert_eq!(AuthMethod::from_u8(14), Some(AuthMethod::DigitalSignature));
    }
}
