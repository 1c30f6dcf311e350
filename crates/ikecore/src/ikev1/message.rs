//! ISAKMP message and payload codec (RFC 2408 Section 3)
//!
//! A message is the fixed header followed by a chain of generic
//! payloads, each naming the type of the one after it. When the
//! encryption flag is set everything after the header is CBC ciphertext
//! padded to the cipher block size; the exchange layer decrypts it and
//! hands the plaintext to [`decode_payloads`] with padding allowed.
//!
//! Phase 1 and Phase 2 hashes are computed over raw payload bodies, so
//! [`PayloadChain`] keeps the exact encoding of every decoded payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use super::constants::*;
use crate::error::{Error, Result};
use crate::identity::Identifier;
use crate::spd::{AddrSpec, PortRange};

/// ISAKMP header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// !                          Initiator                            !
/// !                            Cookie                             !
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// !                          Responder                            !
/// !                            Cookie                             !
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// !  Next Payload ! MjVer ! MnVer ! Exchange Type !     Flags     !
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// !                          Message ID                           !
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// !                            Length                             !
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpHeader {
    /// Initiator cookie
    pub initiator_cookie: [u8; 8],
    /// Responder cookie (zero in the first message)
    pub responder_cookie: [u8; 8],
    /// First payload type
    pub next_payload: u8,
    /// Protocol version
    pub version: u8,
    /// Exchange type
    pub exchange_type: ExchangeType,
    /// Flags
    pub flags: IsakmpFlags,
    /// Message ID (zero in Phase 1)
    pub message_id: u32,
    /// Total message length including header
    pub length: u32,
}

impl IsakmpHeader {
    /// Create a header; next payload and length are filled in on encoding
    pub fn new(
        initiator_cookie: [u8; 8],
        responder_cookie: [u8; 8],
        exchange_type: ExchangeType,
        flags: IsakmpFlags,
        message_id: u32,
    ) -> Self {
        IsakmpHeader {
            initiator_cookie,
            responder_cookie,
            next_payload: 0,
            version: ISAKMP_VERSION,
            exchange_type,
            flags,
            message_id,
            length: ISAKMP_HEADER_SIZE as u32,
        }
    }

    /// Parse a header
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is shorter than the header, the major
    /// version is not 1, the exchange type is unknown, or the length field
    /// is smaller than the header or larger than the buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ISAKMP_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: ISAKMP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut initiator_cookie = [0u8; 8];
        let mut responder_cookie = [0u8; 8];
        initiator_cookie.copy_from_slice(&data[0..8]);
        responder_cookie.copy_from_slice(&data[8..16]);

        let version = data[17];
        if version >> 4 != ISAKMP_VERSION >> 4 {
            return Err(Error::UnsupportedVersion(version));
        }
        let exchange_type =
            ExchangeType::from_u8(data[18]).ok_or(Error::UnsupportedExchangeType(data[18]))?;
        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);

        if length > MAX_ISAKMP_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }
        if length < ISAKMP_HEADER_SIZE as u32 {
            return Err(Error::InvalidLength {
                expected: ISAKMP_HEADER_SIZE,
                actual: length as usize,
            });
        }
        if length as usize > data.len() {
            return Err(Error::BufferTooShort {
                required: length as usize,
                available: data.len(),
            });
        }

        Ok(IsakmpHeader {
            initiator_cookie,
            responder_cookie,
            next_payload: data[16],
            version,
            exchange_type,
            flags: IsakmpFlags::new(data[19]),
            message_id,
            length,
        })
    }

    /// Serialize
    pub fn to_bytes(&self) -> [u8; ISAKMP_HEADER_SIZE] {
        let mut bytes = [0u8; ISAKMP_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.initiator_cookie);
        bytes[8..16].copy_from_slice(&self.responder_cookie);
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Whether the responder cookie is still unassigned
    pub fn responder_cookie_unset(&self) -> bool {
        self.responder_cookie == [0u8; 8]
    }
}

/// Data attribute (RFC 2408 Section 3.3)
///
/// Basic attributes carry a 16 bit value in the header (TV); variable
/// ones carry a length and value (TLV).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// TV encoded
    Basic {
        /// Attribute type
        kind: u16,
        /// Value
        value: u16,
    },
    /// TLV encoded
    Variable {
        /// Attribute type
        kind: u16,
        /// Value octets
        value: Vec<u8>,
    },
}

impl Attribute {
    /// Numeric attribute, TV encoded when the value fits in 16 bits
    pub fn number(kind: u16, value: u32) -> Self {
        match u16::try_from(value) {
            Ok(value) => Attribute::Basic { kind, value },
            Err(_) => Attribute::Variable {
                kind,
                value: value.to_be_bytes().to_vec(),
            },
        }
    }

    /// Attribute type
    pub fn kind(&self) -> u16 {
        match self {
            Attribute::Basic { kind, .. } | Attribute::Variable { kind, .. } => *kind,
        }
    }

    /// Value as an integer; None for variable values longer than 4 octets
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Attribute::Basic { value, .. } => Some(*value as u32),
            Attribute::Variable { value, .. } if value.len() <= 4 => {
                Some(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
            }
            Attribute::Variable { .. } => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Attribute::Basic { kind, value } => {
                buf.put_u16(kind | ATTR_FORMAT_TV);
                buf.put_u16(*value);
            }
            Attribute::Variable { kind, value } => {
                buf.put_u16(kind & !ATTR_FORMAT_TV);
                buf.put_u16(value.len() as u16);
                buf.put_slice(value);
            }
        }
    }

    fn decode_all(mut data: &[u8]) -> Result<Vec<Attribute>> {
        let mut attributes = Vec::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(Error::InvalidPayload("Truncated data attribute".into()));
            }
            let raw_kind = u16::from_be_bytes([data[0], data[1]]);
            let field = u16::from_be_bytes([data[2], data[3]]);
            let kind = raw_kind & !ATTR_FORMAT_TV;
            if raw_kind & ATTR_FORMAT_TV != 0 {
                attributes.push(Attribute::Basic { kind, value: field });
                data = &data[4..];
            } else {
                let end = 4 + field as usize;
                if end > data.len() {
                    return Err(Error::BufferTooShort {
                        required: end,
                        available: data.len(),
                    });
                }
                attributes.push(Attribute::Variable {
                    kind,
                    value: data[4..end].to_vec(),
                });
                data = &data[end..];
            }
        }
        Ok(attributes)
    }
}

/// Look up an attribute value by type
pub fn attribute(attributes: &[Attribute], kind: u16) -> Option<u32> {
    attributes
        .iter()
        .find(|a| a.kind() == kind)
        .and_then(Attribute::as_u32)
}

/// Transform payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform number
    pub number: u8,
    /// Transform ID (KEY_IKE in Phase 1, cipher or AH algorithm in Phase 2)
    pub transform_id: u8,
    /// SA attributes
    pub attributes: Vec<Attribute>,
}

impl Transform {
    /// Value of an attribute
    pub fn attribute(&self, kind: u16) -> Option<u32> {
        attribute(&self.attributes, kind)
    }
}

/// Proposal payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number; consecutive payloads with equal numbers form a
    /// bundle (AH and ESP)
    pub number: u8,
    /// Protocol ID
    pub protocol_id: u8,
    /// SPI (empty in Phase 1)
    pub spi: Vec<u8>,
    /// Alternative transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// SPI as u32 for Phase 2 proposals
    pub fn spi_u32(&self) -> Result<u32> {
        <[u8; 4]>::try_from(self.spi.as_slice())
            .map(u32::from_be_bytes)
            .map_err(|_| Error::InvalidPayload(format!("SPI size {}", self.spi.len())))
    }
}

/// Security Association payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Situation
    pub situation: u32,
    /// Proposals in wire order
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// IPsec DOI, identity-only situation
    pub fn ipsec(proposals: Vec<Proposal>) -> Self {
        SaPayload {
            doi: DOI_IPSEC,
            situation: SIT_IDENTITY_ONLY,
            proposals,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.doi);
        buf.put_u32(self.situation);
        for (i, proposal) in self.proposals.iter().enumerate() {
            let next = if i + 1 < self.proposals.len() {
                PayloadType::Proposal.to_u8()
            } else {
                0
            };
            let mut body = BytesMut::new();
            body.put_u8(proposal.number);
            body.put_u8(proposal.protocol_id);
            body.put_u8(proposal.spi.len() as u8);
            body.put_u8(proposal.transforms.len() as u8);
            body.put_slice(&proposal.spi);
            for (j, transform) in proposal.transforms.iter().enumerate() {
                let next = if j + 1 < proposal.transforms.len() {
                    PayloadType::Transform.to_u8()
                } else {
                    0
                };
                let mut attrs = BytesMut::new();
                for attribute in &transform.attributes {
                    attribute.encode(&mut attrs);
                }
                body.put_u8(next);
                body.put_u8(0);
                body.put_u16((8 + attrs.len()) as u16);
                body.put_u8(transform.number);
                body.put_u8(transform.transform_id);
                body.put_u16(0);
                body.put_slice(&attrs);
            }
            buf.put_u8(next);
            buf.put_u8(0);
            buf.put_u16((4 + body.len()) as u16);
            buf.put_slice(&body);
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }
        let doi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let situation = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if doi != DOI_IPSEC {
            return Err(Error::InvalidPayload(format!("Unsupported DOI {}", doi)));
        }

        let mut proposals = Vec::new();
        let mut rest = &data[8..];
        loop {
            let (next, body, tail) = split_generic(rest)?;
            proposals.push(decode_proposal(body)?);
            rest = tail;
            match next {
                0 => break,
                n if n == PayloadType::Proposal.to_u8() => continue,
                n => {
                    return Err(Error::InvalidPayload(format!(
                        "Unexpected payload {} in SA",
                        n
                    )))
                }
            }
        }
        if proposals.is_empty() {
            return Err(Error::InvalidPayload("SA without proposals".into()));
        }
        Ok(SaPayload {
            doi,
            situation,
            proposals,
        })
    }
}

fn split_generic(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if data.len() < 4 {
        return Err(Error::BufferTooShort {
            required: 4,
            available: data.len(),
        });
    }
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length < 4 || length > data.len() {
        return Err(Error::InvalidLength {
            expected: data.len(),
            actual: length,
        });
    }
    Ok((data[0], &data[4..length], &data[length..]))
}

fn decode_proposal(data: &[u8]) -> Result<Proposal> {
    if data.len() < 4 {
        return Err(Error::InvalidPayload("Truncated proposal".into()));
    }
    let spi_size = data[2] as usize;
    let count = data[3] as usize;
    if data.len() < 4 + spi_size {
        return Err(Error::InvalidPayload("Truncated proposal SPI".into()));
    }
    let spi = data[4..4 + spi_size].to_vec();

    let mut transforms = Vec::with_capacity(count);
    let mut rest = &data[4 + spi_size..];
    for i in 0..count {
        let (next, body, tail) = split_generic(rest)?;
        if body.len() < 4 {
            return Err(Error::InvalidPayload("Truncated transform".into()));
        }
        transforms.push(Transform {
            number: body[0],
            transform_id: body[1],
            attributes: Attribute::decode_all(&body[4..])?,
        });
        rest = tail;
        let last = i + 1 == count;
        if (next == 0) != last {
            return Err(Error::InvalidPayload("Transform count mismatch".into()));
        }
    }
    if count == 0 {
        return Err(Error::InvalidPayload("Proposal without transforms".into()));
    }

    Ok(Proposal {
        number: data[0],
        protocol_id: data[1],
        spi,
        transforms,
    })
}

/// Identification payload (RFC 2407 Section 4.6.2)
///
/// In Phase 1 `protocol` and `port` are zero and `data` names the peer;
/// in Quick Mode the payload describes one side of the traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identification type
    pub id_type: u8,
    /// IP protocol
    pub protocol: u8,
    /// Port
    pub port: u16,
    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Phase 1 identity
    pub fn identity(id: &Identifier) -> Self {
        IdPayload {
            id_type: id.id_type(),
            protocol: 0,
            port: 0,
            data: id.data(),
        }
    }

    /// Phase 1 identity carried by this payload
    pub fn to_identifier(&self) -> Result<Identifier> {
        Identifier::from_wire(self.id_type, &self.data)
    }

    /// Client identity for one side of a Quick Mode selector
    ///
    /// `ipv4` picks the family of wildcard addresses. Port ranges other
    /// than a single port are sent as port 0 (any).
    pub fn for_traffic(addr: &AddrSpec, protocol: u8, ports: PortRange, ipv4: bool) -> Self {
        let (id_type, data) = match addr {
            AddrSpec::Single(IpAddr::V4(a)) => (id_type::IPV4_ADDR, a.octets().to_vec()),
            AddrSpec::Single(IpAddr::V6(a)) => (id_type::IPV6_ADDR, a.octets().to_vec()),
            AddrSpec::Subnet { addr, prefix_len } => subnet_data(*addr, *prefix_len),
            AddrSpec::Range { low, high } => match (low, high) {
                (IpAddr::V4(l), IpAddr::V4(h)) => {
                    (id_type::IPV4_ADDR_RANGE, [l.octets(), h.octets()].concat())
                }
                (l, h) => (
                    id_type::IPV6_ADDR_RANGE,
                    [v6_octets(*l), v6_octets(*h)].concat(),
                ),
            },
            AddrSpec::Any if ipv4 => subnet_data(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddrSpec::Any => subnet_data(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let port = if ports.start == ports.end { ports.start } else { 0 };
        IdPayload {
            id_type,
            protocol,
            port,
            data,
        }
    }

    /// Address set, protocol and ports of a Quick Mode client identity
    ///
    /// # Errors
    ///
    /// Returns [`Error::TsUnacceptable`] for non-address identity types
    /// and malformed address data.
    pub fn to_traffic(&self) -> Result<(AddrSpec, u8, PortRange)> {
        let d = &self.data;
        let addr = match (self.id_type, d.len()) {
            (id_type::IPV4_ADDR, 4) => AddrSpec::Single(IpAddr::V4(v4(&d[0..4]))),
            (id_type::IPV6_ADDR, 16) => AddrSpec::Single(IpAddr::V6(v6(&d[0..16]))),
            (id_type::IPV4_ADDR_SUBNET, 8) => {
                let mask = u32::from(v4(&d[4..8]));
                subnet(IpAddr::V4(v4(&d[0..4])), mask as u128, 32)?
            }
            (id_type::IPV6_ADDR_SUBNET, 32) => {
                let mask = u128::from(v6(&d[16..32]));
                subnet(IpAddr::V6(v6(&d[0..16])), mask, 128)?
            }
            (id_type::IPV4_ADDR_RANGE, 8) => {
                AddrSpec::range(IpAddr::V4(v4(&d[0..4])), IpAddr::V4(v4(&d[4..8])))
            }
            (id_type::IPV6_ADDR_RANGE, 32) => {
                AddrSpec::range(IpAddr::V6(v6(&d[0..16])), IpAddr::V6(v6(&d[16..32])))
            }
            _ => return Err(Error::TsUnacceptable),
        };
        addr.validate().map_err(|_| Error::TsUnacceptable)?;
        let ports = if self.port == 0 {
            PortRange::ANY
        } else {
            PortRange::single(self.port)
        };
        Ok((addr, self.protocol, ports))
    }

    /// Payload body (also the IDii_b / IDir_b hash input)
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.data.len());
        body.push(self.id_type);
        body.push(self.protocol);
        body.extend_from_slice(&self.port.to_be_bytes());
        body.extend_from_slice(&self.data);
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
            id_type: data[0],
            protocol: data[1],
            port: u16::from_be_bytes([data[2], data[3]]),
            data: data[4..].to_vec(),
        })
    }
}

fn v4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn v6(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

fn v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}

fn subnet_data(addr: IpAddr, prefix_len: u8) -> (u8, Vec<u8>) {
    match addr {
        IpAddr::V4(a) => {
            let mask = u32::MAX.checked_shl(32 - prefix_len.min(32) as u32).unwrap_or(0);
            (
                id_type::IPV4_ADDR_SUBNET,
                [a.octets(), mask.to_be_bytes()].concat(),
            )
        }
        IpAddr::V6(a) => {
            let mask = u128::MAX.checked_shl(128 - prefix_len.min(128) as u32).unwrap_or(0);
            (
                id_type::IPV6_ADDR_SUBNET,
                [a.octets(), mask.to_be_bytes()].concat(),
            )
        }
    }
}

fn subnet(addr: IpAddr, mask: u128, width: u32) -> Result<AddrSpec> {
    let shifted = mask << (128 - width);
    let prefix_len = shifted.leading_ones();
    if prefix_len < width && shifted.checked_shl(prefix_len).unwrap_or(0) != 0 {
        return Err(Error::TsUnacceptable);
    }
    if prefix_len == 0 {
        return Ok(AddrSpec::Any);
    }
    Ok(AddrSpec::Subnet {
        addr,
        prefix_len: prefix_len as u8,
    })
}

/// Notification payload (RFC 2408 Section 3.14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol the notification is about
    pub protocol_id: u8,
    /// Notify message type
    pub notify_type: u16,
    /// SPI (cookies for ISAKMP, 4 octets for IPsec)
    pub spi: Vec<u8>,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notification about the ISAKMP SA
    pub fn new(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            doi: DOI_IPSEC,
            protocol_id: ProtocolId::Isakmp.to_u8(),
            notify_type: notify_type.to_u16(),
            spi: Vec::new(),
            data,
        }
    }

    /// Notification about an IPsec SA
    pub fn for_spi(notify_type: NotifyType, protocol: ProtocolId, spi: u32) -> Self {
        NotifyPayload {
            doi: DOI_IPSEC,
            protocol_id: protocol.to_u8(),
            notify_type: notify_type.to_u16(),
            spi: spi.to_be_bytes().to_vec(),
            data: Vec::new(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.doi);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi.len() as u8);
        buf.put_u16(self.notify_type);
        buf.put_slice(&self.spi);
        buf.put_slice(&self.data);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }
        let spi_size = data[5] as usize;
        if data.len() < 8 + spi_size {
            return Err(Error::InvalidPayload("Truncated notification SPI".into()));
        }
        Ok(NotifyPayload {
            doi: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            protocol_id: data[4],
            notify_type: u16::from_be_bytes([data[6], data[7]]),
            spi: data[8..8 + spi_size].to_vec(),
            data: data[8 + spi_size..].to_vec(),
        })
    }
}

/// Delete payload (RFC 2408 Section 3.15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol of the deleted SAs
    pub protocol_id: u8,
    /// Size of every SPI
    pub spi_size: u8,
    /// SPIs
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete the ISAKMP SA identified by its cookie pair
    pub fn isakmp(initiator_cookie: [u8; 8], responder_cookie: [u8; 8]) -> Self {
        DeletePayload {
            doi: DOI_IPSEC,
            protocol_id: ProtocolId::Isakmp.to_u8(),
            spi_size: 16,
            spis: vec![[initiator_cookie, responder_cookie].concat()],
        }
    }

    /// Delete IPsec SAs by the SPIs their receiver chose
    pub fn ipsec(protocol: ProtocolId, spis: &[u32]) -> Self {
        DeletePayload {
            doi: DOI_IPSEC,
            protocol_id: protocol.to_u8(),
            spi_size: IPSEC_SPI_SIZE as u8,
            spis: spis.iter().map(|s| s.to_be_bytes().to_vec()).collect(),
        }
    }

    /// SPIs as u32 values for IPsec deletes
    pub fn ipsec_spis(&self) -> Result<Vec<u32>> {
        self.spis
            .iter()
            .map(|s| {
                <[u8; 4]>::try_from(s.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| Error::InvalidPayload(format!("SPI size {}", s.len())))
            })
            .collect()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.doi);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi_size);
        buf.put_u16(self.spis.len() as u16);
        for spi in &self.spis {
            buf.put_slice(spi);
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }
        let spi_size = data[5];
        let count = u16::from_be_bytes([data[6], data[7]]) as usize;
        let needed = 8 + spi_size as usize * count;
        if data.len() != needed {
            return Err(Error::InvalidLength {
                expected: needed,
                actual: data.len(),
            });
        }
        let spis = data[8..]
            .chunks(spi_size.max(1) as usize)
            .take(count)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(DeletePayload {
            doi: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            protocol_id: data[4],
            spi_size,
            spis,
        })
    }
}

/// ISAKMP payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Security Association
    Sa(SaPayload),
    /// Key Exchange data
    Ke(Vec<u8>),
    /// Identification
    Id(IdPayload),
    /// Certificate (kept raw)
    Cert(Vec<u8>),
    /// Certificate request (kept raw)
    CertReq(Vec<u8>),
    /// Hash
    Hash(Vec<u8>),
    /// Signature
    Sig(Vec<u8>),
    /// Nonce
    Nonce(Vec<u8>),
    /// Notification
    Notify(NotifyPayload),
    /// Delete
    Delete(DeletePayload),
    /// Vendor ID
    Vendor(Vec<u8>),
    /// Private use payload
    Unknown {
        /// Raw payload type
        payload_type: u8,
        /// Raw body
        data: Vec<u8>,
    },
}

impl Payload {
    /// Raw payload type
    pub fn type_id(&self) -> u8 {
        let t = match self {
            Payload::Sa(_) => PayloadType::Sa,
            Payload::Ke(_) => PayloadType::Ke,
            Payload::Id(_) => PayloadType::Id,
            Payload::Cert(_) => PayloadType::Cert,
            Payload::CertReq(_) => PayloadType::CertReq,
            Payload::Hash(_) => PayloadType::Hash,
            Payload::Sig(_) => PayloadType::Sig,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::Vendor(_) => PayloadType::Vendor,
            Payload::Unknown { payload_type, .. } => return *payload_type,
        };
        t.to_u8()
    }

    /// Encoded body without the generic header
    pub fn body(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Payload::Sa(sa) => sa.encode(&mut buf),
            Payload::Id(id) => buf.put_slice(&id.body()),
            Payload::Notify(n) => n.encode(&mut buf),
            Payload::Delete(d) => d.encode(&mut buf),
            Payload::Ke(data)
            | Payload::Cert(data)
            | Payload::CertReq(data)
            | Payload::Hash(data)
            | Payload::Sig(data)
            | Payload::Nonce(data)
            | Payload::Vendor(data)
            | Payload::Unknown { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    fn decode_body(payload_type: u8, data: &[u8]) -> Result<Self> {
        let Some(known) = PayloadType::from_u8(payload_type) else {
            // RFC 2408 reserves 128-255 for private use
            if payload_type >= 128 {
                return Ok(Payload::Unknown {
                    payload_type,
                    data: data.to_vec(),
                });
            }
            return Err(Error::InvalidPayload(format!(
                "Unknown payload type {}",
                payload_type
            )));
        };
        let payload = match known {
            PayloadType::Sa => Payload::Sa(SaPayload::decode(data)?),
            PayloadType::Ke => Payload::Ke(data.to_vec()),
            PayloadType::Id => Payload::Id(IdPayload::decode(data)?),
            PayloadType::Cert => Payload::Cert(data.to_vec()),
            PayloadType::CertReq => Payload::CertReq(data.to_vec()),
            PayloadType::Hash => Payload::Hash(data.to_vec()),
            PayloadType::Sig => Payload::Sig(data.to_vec()),
            PayloadType::Nonce => Payload::Nonce(data.to_vec()),
            PayloadType::Notify => Payload::Notify(NotifyPayload::decode(data)?),
            PayloadType::Delete => Payload::Delete(DeletePayload::decode(data)?),
            PayloadType::Vendor => Payload::Vendor(data.to_vec()),
            PayloadType::None | PayloadType::Proposal | PayloadType::Transform => {
                return Err(Error::InvalidPayload(format!(
                    "Payload type {} outside an SA",
                    payload_type
                )))
            }
        };
        Ok(payload)
    }
}

/// Serialize a payload chain
///
/// Returns the first payload type and the encoded chain.
pub fn encode_payloads(payloads: &[Payload]) -> (u8, BytesMut) {
    let mut buf = BytesMut::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads.get(i + 1).map(Payload::type_id).unwrap_or(0);
        let body = payload.body();
        buf.put_u8(next);
        buf.put_u8(0);
        buf.put_u16((4 + body.len()) as u16);
        buf.put_slice(&body);
    }
    let first = payloads.first().map(Payload::type_id).unwrap_or(0);
    (first, buf)
}

/// Decoded payload chain with the raw encoding of every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChain {
    /// Payloads in wire order
    pub payloads: Vec<Payload>,
    raw: Vec<Vec<u8>>,
}

impl PayloadChain {
    /// Raw body of payload `index` (without the generic header)
    pub fn raw_body(&self, index: usize) -> Option<&[u8]> {
        self.raw.get(index).map(|r| &r[4..])
    }

    /// Raw encoding of every payload from `index` on, headers included
    pub fn raw_from(&self, index: usize) -> Vec<u8> {
        self.raw.iter().skip(index).flatten().copied().collect()
    }

    /// Position of the first payload of a type
    pub fn position(&self, payload_type: PayloadType) -> Option<usize> {
        self.payloads
            .iter()
            .position(|p| p.type_id() == payload_type.to_u8())
    }
}

/// Parse a payload chain starting with type `first`
///
/// With `padded` set, bytes after the last payload (cipher padding) are
/// ignored; otherwise they are an error.
pub fn decode_payloads(first: u8, data: &[u8], padded: bool) -> Result<PayloadChain> {
    let mut payloads = Vec::new();
    let mut raw = Vec::new();
    let mut next = first;
    let mut offset = 0;

    while next != PayloadType::None.to_u8() {
        let (following, body, _) = split_generic(&data[offset..])?;
        let end = offset + 4 + body.len();
        payloads.push(Payload::decode_body(next, body)?);
        raw.push(data[offset..end].to_vec());
        next = following;
        offset = end;
    }

    if !padded && offset != data.len() {
        return Err(Error::InvalidLength {
            expected: offset,
            actual: data.len(),
        });
    }
    Ok(PayloadChain { payloads, raw })
}

/// Plaintext ISAKMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpMessage {
    /// Header
    pub header: IsakmpHeader,
    /// Payloads in wire order
    pub payloads: Vec<Payload>,
}

impl IsakmpMessage {
    /// Create a message
    pub fn new(header: IsakmpHeader, payloads: Vec<Payload>) -> Self {
        IsakmpMessage { header, payloads }
    }

    /// Serialize without encryption
    pub fn encode(&self) -> Vec<u8> {
        let (first, body) = encode_payloads(&self.payloads);
        let mut header = self.header.clone();
        header.next_payload = first;
        header.length = (ISAKMP_HEADER_SIZE + body.len()) as u32;
        let mut buf = BytesMut::with_capacity(header.length as usize);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(&body);
        buf.to_vec()
    }

    /// Parse an unencrypted message
    pub fn decode(data: &[u8]) -> Result<(Self, PayloadChain)> {
        let header = IsakmpHeader::from_bytes(data)?;
        if header.flags.is_encrypted() {
            return Err(Error::InvalidMessage(
                "Encrypted message needs the SA keys".into(),
            ));
        }
        let chain = decode_payloads(
            header.next_payload,
            &data[ISAKMP_HEADER_SIZE..header.length as usize],
            false,
        )?;
        let message = IsakmpMessage {
            header,
            payloads: chain.payloads.clone(),
        };
        Ok((message, chain))
    }
}
