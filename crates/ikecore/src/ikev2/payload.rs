//! IKEv2 Payload structures and parsing
//!
//! Implements IKE payloads as defined in RFC 7296 Section 3.2. A message
//! body is a chain of payloads, each naming the type of the one after it.

use bytes::{BufMut, BytesMut};

use super::constants::{PayloadType, ProtocolId};
use super::proposal::{decode_proposals, encode_proposals, Proposal};
use super::traffic_selector::TsPayload;
use crate::error::{Error, Result};
use crate::identity::Identifier;

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type (raw, may be a type this implementation ignores)
    pub next_payload: u8,

    /// Critical bit (if set, must understand this payload)
    pub critical: bool,

    /// Total payload length including header (4 bytes + data)
    pub length: u16,
}

impl PayloadHeader {
    /// Payload header size
    pub const SIZE: usize = 4;

    /// Parse payload header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if buffer is too short or the length is smaller
    /// than the header itself
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        // Critical bit is bit 7 of the second byte
        let critical = (data[1] & 0x80) != 0;
        let length = u16::from_be_bytes([data[2], data[3]]);

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload: data[0],
            critical,
            length,
        })
    }

    /// Serialize payload header
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Diffie-Hellman Group Num    |           RESERVED            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                       Key Exchange Data                       ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Key exchange data (public value)
    pub key_data: Vec<u8>,
}

impl KePayload {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(KePayload {
            dh_group: u16::from_be_bytes([data[0], data[1]]),
            key_data: data[4..].to_vec(),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.dh_group);
        buf.put_u16(0);
        buf.put_slice(&self.key_data);
    }
}

/// Identification Payload (RFC 7296 Section 3.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identity
    pub id: Identifier,
}

impl IdPayload {
    /// Payload body: ID type, 3 reserved octets, identification data
    ///
    /// This is also the input to the MACed ID used in AUTH.
    pub fn body(&self) -> Vec<u8> {
        let data = self.id.data();
        let mut body = Vec::with_capacity(4 + data.len());
        body.push(self.id.id_type());
        body.extend_from_slice(&[0u8; 3]);
        body.extend_from_slice(&data);
        body
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(IdPayload {
            id: Identifier::from_wire(data[0], &data[4..])?,
        })
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub method: u8,

    /// Authentication data
    pub data: Vec<u8>,
}

impl AuthPayload {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(AuthPayload {
            method: data[0],
            data: data[4..].to_vec(),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.method);
        buf.put_slice(&[0u8; 3]);
        buf.put_slice(&self.data);
    }
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size (16 bytes)
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size (256 bytes)
    pub const MAX_SIZE: usize = 256;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too short: {} bytes (minimum {})",
                nonce.len(),
                Self::MIN_SIZE
            )));
        }

        if nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too long: {} bytes (maximum {})",
                nonce.len(),
                Self::MAX_SIZE
            )));
        }

        Ok(NoncePayload { nonce })
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Protocol ID  |   SPI Size    |      Notify Message Type      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                Security Parameter Index (SPI)                 ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                       Notification Data                       ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 when not SA specific)
    pub protocol_id: u8,
    /// SPI
    pub spi: Vec<u8>,
    /// Notify message type (raw, unknown types are kept)
    pub notify_type: u16,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notification not tied to an SA
    pub fn new(notify_type: u16, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type,
            data,
        }
    }

    /// Notification about a child SA
    pub fn for_child(notify_type: u16, protocol: ProtocolId, spi: u32) -> Self {
        NotifyPayload {
            protocol_id: protocol.to_u8(),
            spi: spi.to_be_bytes().to_vec(),
            notify_type,
            data: Vec::new(),
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let spi_size = data[1] as usize;
        if data.len() < 4 + spi_size {
            return Err(Error::BufferTooShort {
                required: 4 + spi_size,
                available: data.len(),
            });
        }
        Ok(NotifyPayload {
            protocol_id: data[0],
            spi: data[4..4 + spi_size].to_vec(),
            notify_type: u16::from_be_bytes([data[2], data[3]]),
            data: data[4 + spi_size..].to_vec(),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi.len() as u8);
        buf.put_u16(self.notify_type);
        buf.put_slice(&self.spi);
        buf.put_slice(&self.data);
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Protocol ID   |   SPI Size    |          Num of SPIs          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~               Security Parameter Index(es) (SPI)              ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol ID
    pub protocol_id: u8,
    /// SPI size
    pub spi_size: u8,
    /// SPIs, each `spi_size` bytes
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete the IKE SA carrying this payload
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike.to_u8(),
            spi_size: 0,
            spis: Vec::new(),
        }
    }

    /// Delete child SAs by their inbound SPIs
    pub fn child(protocol: ProtocolId, spis: &[u32]) -> Self {
        DeletePayload {
            protocol_id: protocol.to_u8(),
            spi_size: 4,
            spis: spis.iter().map(|s| s.to_be_bytes().to_vec()).collect(),
        }
    }

    /// SPIs as 32-bit values
    pub fn child_spis(&self) -> Result<Vec<u32>> {
        if self.spi_size != 4 {
            return Err(Error::InvalidPayload(format!(
                "Child SA delete with SPI size {}",
                self.spi_size
            )));
        }
        Ok(self
            .spis
            .iter()
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
            .collect())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let spi_size = data[1];
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;
        let body = &data[4..];
        if body.len() != count * spi_size as usize {
            return Err(Error::InvalidLength {
                expected: count * spi_size as usize,
                actual: body.len(),
            });
        }
        let spis = if spi_size == 0 {
            Vec::new()
        } else {
            body.chunks(spi_size as usize).map(<[u8]>::to_vec).collect()
        };
        Ok(DeletePayload {
            protocol_id: data[0],
            spi_size,
            spis,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi_size);
        buf.put_u16(self.spis.len() as u16);
        for spi in &self.spis {
            buf.put_slice(spi);
        }
    }
}

/// Encrypted and Authenticated Payload (RFC 7296 Section 3.14)
///
/// `body` holds IV, ciphertext and integrity checksum as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Type of the first inner payload
    pub first_inner: u8,
    /// IV | ciphertext | ICV
    pub body: Vec<u8>,
}

/// IKE Payload types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Security Association payload
    Sa(Vec<Proposal>),
    /// Key Exchange payload
    Ke(KePayload),
    /// Identification payload (Initiator)
    IdI(IdPayload),
    /// Identification payload (Responder)
    IdR(IdPayload),
    /// Certificate payload (kept raw)
    Cert(Vec<u8>),
    /// Certificate request payload (kept raw)
    CertReq(Vec<u8>),
    /// Authentication payload
    Auth(AuthPayload),
    /// Nonce payload
    Nonce(NoncePayload),
    /// Notify payload
    Notify(NotifyPayload),
    /// Delete payload
    Delete(DeletePayload),
    /// Vendor ID payload
    Vendor(Vec<u8>),
    /// Traffic selectors (Initiator)
    TsI(TsPayload),
    /// Traffic selectors (Responder)
    TsR(TsPayload),
    /// Encrypted payload
    Encrypted(EncryptedPayload),
    /// Payload this implementation does not interpret
    Unknown {
        /// Raw payload type
        payload_type: u8,
        /// Raw payload data (excluding header)
        data: Vec<u8>,
    },
}

impl Payload {
    /// Raw payload type
    pub fn type_id(&self) -> u8 {
        let t = match self {
            Payload::Sa(_) => PayloadType::SA,
            Payload::Ke(_) => PayloadType::KE,
            Payload::IdI(_) => PayloadType::IDi,
            Payload::IdR(_) => PayloadType::IDr,
            Payload::Cert(_) => PayloadType::CERT,
            Payload::CertReq(_) => PayloadType::CERTREQ,
            Payload::Auth(_) => PayloadType::AUTH,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::N,
            Payload::Delete(_) => PayloadType::D,
            Payload::Vendor(_) => PayloadType::V,
            Payload::TsI(_) => PayloadType::TSi,
            Payload::TsR(_) => PayloadType::TSr,
            Payload::Encrypted(_) => PayloadType::SK,
            Payload::Unknown { payload_type, .. } => return *payload_type,
        };
        t.to_u8()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Payload::Sa(proposals) => encode_proposals(proposals, buf),
            Payload::Ke(ke) => ke.encode(buf),
            Payload::IdI(id) | Payload::IdR(id) => buf.put_slice(&id.body()),
            Payload::Cert(data)
            | Payload::CertReq(data)
            | Payload::Vendor(data)
            | Payload::Unknown { data, .. } => buf.put_slice(data),
            Payload::Auth(auth) => auth.encode(buf),
            Payload::Nonce(nonce) => buf.put_slice(&nonce.nonce),
            Payload::Notify(notify) => notify.encode(buf),
            Payload::Delete(delete) => delete.encode(buf),
            Payload::TsI(ts) | Payload::TsR(ts) => ts.encode(buf),
            Payload::Encrypted(sk) => buf.put_slice(&sk.body),
        }
    }

    fn decode_body(payload_type: u8, critical: bool, data: &[u8]) -> Result<Self> {
        let Some(known) = PayloadType::from_u8(payload_type) else {
            if critical {
                return Err(Error::InvalidPayload(format!(
                    "Unsupported critical payload {}",
                    payload_type
                )));
            }
            return Ok(Payload::Unknown {
                payload_type,
                data: data.to_vec(),
            });
        };
        let payload = match known {
            PayloadType::SA => Payload::Sa(decode_proposals(data)?),
            PayloadType::KE => Payload::Ke(KePayload::decode(data)?),
            PayloadType::IDi => Payload::IdI(IdPayload::decode(data)?),
            PayloadType::IDr => Payload::IdR(IdPayload::decode(data)?),
            PayloadType::CERT => Payload::Cert(data.to_vec()),
            PayloadType::CERTREQ => Payload::CertReq(data.to_vec()),
            PayloadType::AUTH => Payload::Auth(AuthPayload::decode(data)?),
            PayloadType::Nonce => Payload::Nonce(NoncePayload::new(data.to_vec())?),
            PayloadType::N => Payload::Notify(NotifyPayload::decode(data)?),
            PayloadType::D => Payload::Delete(DeletePayload::decode(data)?),
            PayloadType::V => Payload::Vendor(data.to_vec()),
            PayloadType::TSi => Payload::TsI(TsPayload::decode(data)?),
            PayloadType::TSr => Payload::TsR(TsPayload::decode(data)?),
            PayloadType::None | PayloadType::SK | PayloadType::CP | PayloadType::EAP => {
                if critical {
                    return Err(Error::InvalidPayload(format!(
                        "Unsupported critical payload {}",
                        payload_type
                    )));
                }
                Payload::Unknown {
                    payload_type,
                    data: data.to_vec(),
                }
            }
        };
        Ok(payload)
    }
}

/// Serialize a payload chain
///
/// # Returns
///
/// Returns the type of the first payload (the value for the preceding
/// header's next-payload field) and the encoded chain.
pub fn encode_payloads(payloads: &[Payload]) -> (u8, BytesMut) {
    let mut buf = BytesMut::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = match payload {
            Payload::Encrypted(sk) => sk.first_inner,
            _ => payloads.get(i + 1).map(Payload::type_id).unwrap_or(0),
        };

        let mut body = BytesMut::new();
        payload.encode_body(&mut body);
        let header = PayloadHeader {
            next_payload: next,
            critical: false,
            length: (PayloadHeader::SIZE + body.len()) as u16,
        };
        buf.put_slice(&header.to_bytes());
        buf.put_slice(&body);
    }
    let first = payloads.first().map(Payload::type_id).unwrap_or(0);
    (first, buf)
}

/// Parse a payload chain starting with type `first`
///
/// An encrypted payload must be the last in the chain; its next-payload
/// field names the first inner payload instead.
pub fn decode_payloads(first: u8, data: &[u8]) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    let mut next = first;
    let mut offset = 0;

    while next != PayloadType::None.to_u8() {
        let header = PayloadHeader::from_bytes(&data[offset..])?;
        let end = offset + header.length as usize;
        if end > data.len() {
            return Err(Error::BufferTooShort {
                required: end,
                available: data.len(),
            });
        }
        let body = &data[offset + PayloadHeader::SIZE..end];

        if next == PayloadType::SK.to_u8() {
            if end != data.len() {
                return Err(Error::InvalidPayload(
                    "Encrypted payload must be the last payload".into(),
                ));
            }
            payloads.push(Payload::Encrypted(EncryptedPayload {
                first_inner: header.next_payload,
                body: body.to_vec(),
            }));
            return Ok(payloads);
        }

        payloads.push(Payload::decode_body(next, header.critical, body)?);
        next = header.next_payload;
        offset = end;
    }

    if offset != data.len() {
        return Err(Error::InvalidLength {
            expected: offset,
            actual: data.len(),
        });
    }
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_payload_header_roundtrip() {
        let header = PayloadHeader {
            next_payload: 40,
            critical: true,
            length: 36,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [40, 0x80, 0, 36]);
        assert_eq!(PayloadHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_payload_header_short_length() {
        assert!(PayloadHeader::from_bytes(&[0, 0, 0, 3]).is_err());
        assert!(PayloadHeader::from_bytes(&[0, 0]).is_err());
    }

    #[test]
    fn test_nonce_bounds() {
        assert!(NoncePayload::new(vec![0u8; 15]).is_err());
        assert!(NoncePayload::new(vec![0u8; 16]).is_ok());
        assert!(NoncePayload::new(vec![0u8; 257]).is_err());
    }

    #[test]
    fn test_chain_roundtrip() {
        let payloads = vec![
            Payload::Ke(KePayload {
                dh_group: 31,
                key_data: vec![7u8; 32],
            }),
            Payload::Nonce(NoncePayload::new(vec![1u8; 32]).unwrap()),
            Payload::IdI(IdPayload {
                id: Identifier::Ipv4(Ipv4Addr::new(192, 0, 2, 1)),
            }),
            Payload::Notify(NotifyPayload::new(16390, vec![9u8; 8])),
            Payload::Delete(DeletePayload::child(ProtocolId::Esp, &[1, 2])),
            Payload::Vendor(b"ikecore".to_vec()),
        ];
        let (first, bytes) = encode_payloads(&payloads);
        assert_eq!(first, PayloadType::KE.to_u8());
        assert_eq!(decode_payloads(first, &bytes).unwrap(), payloads);
    }

    #[test]
    fn test_id_body_layout() {
        let id = IdPayload {
            id: Identifier::Fqdn("gw.example".into()),
        };
        let body = id.body();
        assert_eq!(&body[..4], &[2, 0, 0, 0]);
        assert_eq!(&body[4..], b"gw.example");
    }

    #[test]
    fn test_unknown_payloads() {
        let mut bytes = vec![0u8, 0, 0, 8];
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let parsed = decode_payloads(200, &bytes).unwrap();
        assert_eq!(
            parsed,
            vec![Payload::Unknown {
                payload_type: 200,
                data: vec![1, 2, 3, 4]
            }]
        );

        // Same payload flagged critical
        bytes[1] = 0x80;
        assert!(decode_payloads(200, &bytes).is_err());
    }

    #[test]
    fn test_encrypted_payload_must_be_last() {
        let payloads = vec![Payload::Encrypted(EncryptedPayload {
            first_inner: PayloadType::IDi.to_u8(),
            body: vec![0u8; 48],
        })];
        let (first, bytes) = encode_payloads(&payloads);
        assert_eq!(first, PayloadType::SK.to_u8());
        // Header carries the first inner type
        assert_eq!(bytes[0], PayloadType::IDi.to_u8());
        assert_eq!(decode_payloads(first, &bytes).unwrap(), payloads);

        let mut trailing = bytes.to_vec();
        trailing.extend_from_slice(&[0, 0, 0, 4]);
        assert!(decode_payloads(first, &trailing).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let (first, bytes) = encode_payloads(&[Payload::Vendor(vec![1])]);
        let mut data = bytes.to_vec();
        data.push(0);
        assert!(decode_payloads(first, &data).is_err());
    }

    #[test]
    fn test_delete_payload_lengths() {
        let del = DeletePayload::child(ProtocolId::Esp, &[0xdeadbeef]);
        assert_eq!(del.child_spis().unwrap(), vec![0xdeadbeef]);
        assert!(DeletePayload::ike().child_spis().is_err());

        // Count says 2 SPIs, only one present
        assert!(DeletePayload::decode(&[3, 4, 0, 2, 1, 2, 3, 4]).is_err());
    }
}
