//! IKEv2 message structures and parsing
//!
//! Implements the IKE message format defined in RFC 7296 Section 3.1

use bytes::{BufMut, BytesMut};

use super::constants::*;
use super::payload::{decode_payloads, encode_payloads, NotifyPayload, Payload};
use crate::error::{Error, Result};

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's Security Parameter Index (8 bytes)
    pub initiator_spi: [u8; 8],

    /// Responder's Security Parameter Index (8 bytes, zero for IKE_SA_INIT request)
    pub responder_spi: [u8; 8],

    /// Next payload type
    pub next_payload: u8,

    /// Protocol version (major version must be 2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID (used for replay protection and matching)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a new IKE header; next payload and length are filled in on
    /// encoding
    pub fn new(
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: 0,
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length: IKE_HEADER_SIZE as u32,
        }
    }

    /// Parse IKE header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Buffer is too short (< 28 bytes)
    /// - Major version is not 2
    /// - Exchange type is unknown
    /// - Message length is smaller than the header, larger than the
    ///   received buffer, or larger than the protocol maximum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IKE_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut initiator_spi = [0u8; 8];
        let mut responder_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&data[0..8]);
        responder_spi.copy_from_slice(&data[8..16]);

        // Only the major version is checked
        let version = data[17];
        if version >> 4 != IKE_VERSION >> 4 {
            return Err(Error::UnsupportedVersion(version));
        }

        let exchange_type =
            ExchangeType::from_u8(data[18]).ok_or(Error::UnsupportedExchangeType(data[18]))?;
        let flags = IkeFlags::new(data[19]);
        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);

        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }
        if length < IKE_HEADER_SIZE as u32 {
            return Err(Error::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: length as usize,
            });
        }
        if length as usize > data.len() {
            return Err(Error::BufferTooShort {
                required: length as usize,
                available: data.len(),
            });
        }

        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: data[16],
            version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize IKE header to bytes
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.initiator_spi);
        bytes[8..16].copy_from_slice(&self.responder_spi);
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Whether the responder SPI is still unassigned
    pub fn responder_spi_unset(&self) -> bool {
        self.responder_spi == [0u8; 8]
    }
}

/// Decoded IKE message
///
/// For protected messages `payloads` holds a single
/// [`Payload::Encrypted`] until the exchange layer opens it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeMessage {
    /// Header
    pub header: IkeHeader,
    /// Payloads in wire order
    pub payloads: Vec<Payload>,
}

impl IkeMessage {
    /// Create a message with no payloads
    pub fn new(header: IkeHeader) -> Self {
        IkeMessage {
            header,
            payloads: Vec::new(),
        }
    }

    /// Append a payload
    pub fn push(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Serialize without protection, filling in next payload and length
    pub fn encode(&self) -> Vec<u8> {
        let (first, body) = encode_payloads(&self.payloads);
        let mut header = self.header.clone();
        header.next_payload = first;
        header.length = (IKE_HEADER_SIZE + body.len()) as u32;

        let mut buf = BytesMut::with_capacity(header.length as usize);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(&body);
        buf.to_vec()
    }

    /// Parse a message
    ///
    /// Bytes beyond the header's length field are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = IkeHeader::from_bytes(data)?;
        let body = &data[IKE_HEADER_SIZE..header.length as usize];
        let payloads = decode_payloads(header.next_payload, body)?;
        Ok(IkeMessage { header, payloads })
    }

    /// Whether this is a response
    pub fn is_response(&self) -> bool {
        self.header.flags.is_response()
    }

    /// Notify payloads
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// First notify of the given type
    pub fn notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        self.notifies()
            .find(|n| n.notify_type == notify_type.to_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::payload::NoncePayload;

    fn header() -> IkeHeader {
        IkeHeader::new(
            [1, 2, 3, 4, 5, 6, 7, 8],
            [0u8; 8],
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let mut h = header();
        h.length = 28;
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), IKE_HEADER_SIZE);
        assert_eq!(bytes[17], 0x20);
        assert_eq!(bytes[18], 34);
        assert_eq!(bytes[19], 0x08);
        assert_eq!(IkeHeader::from_bytes(&bytes).unwrap(), h);
        assert!(h.responder_spi_unset());
    }

    #[test]
    fn test_header_validation() {
        let mut bytes = header().to_bytes();

        // Short buffer
        assert!(IkeHeader::from_bytes(&bytes[..20]).is_err());

        // Major version 1
        bytes[17] = 0x10;
        assert_eq!(
            IkeHeader::from_bytes(&bytes),
            Err(Error::UnsupportedVersion(0x10))
        );
        // Minor version is ignored
        bytes[17] = 0x21;
        assert!(IkeHeader::from_bytes(&bytes).is_ok());

        bytes[18] = 99;
        assert_eq!(
            IkeHeader::from_bytes(&bytes),
            Err(Error::UnsupportedExchangeType(99))
        );
    }

    #[test]
    fn test_length_exceeding_buffer_rejected() {
        let mut h = header();
        h.length = 100;
        assert!(matches!(
            IkeHeader::from_bytes(&h.to_bytes()),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_message_roundtrip() {
        let mut msg = IkeMessage::new(header());
        msg.push(Payload::Nonce(NoncePayload::new(vec![5u8; 32]).unwrap()));
        msg.push(Payload::Notify(NotifyPayload::new(
            NotifyType::Cookie.to_u16(),
            vec![1, 2, 3],
        )));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 28 + 36 + 11);

        let decoded = IkeMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.header.next_payload, PayloadType::Nonce.to_u8());
        assert_eq!(decoded.payloads, msg.payloads);
        assert_eq!(decoded.notify(NotifyType::Cookie).unwrap().data, vec![1, 2, 3]);
        assert!(decoded.notify(NotifyType::RekeySa).is_none());
    }

    #[test]
    fn test_empty_message() {
        let bytes = IkeMessage::new(header()).encode();
        let decoded = IkeMessage::decode(&bytes).unwrap();
        assert!(decoded.payloads.is_empty());
        assert_eq!(decoded.header.next_payload, 0);
    }
}
