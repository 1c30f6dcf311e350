//! Traffic Selector payloads (RFC 7296 Section 3.13)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   TS Type     |IP Protocol ID*|       Selector Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Start Port*         |           End Port*           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ~                         Starting Address*                     ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ~                         Ending Address*                       ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! For ICMP the type and code travel in the port fields as one 16-bit
//! value, type in the high octet. Only the first selector of a TS
//! payload is used when negotiating.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use super::constants::TsType;
use crate::error::{Error, Result};
use crate::spd::selector::is_icmp;
use crate::spd::{AddrSpec, PortRange, Selector};

/// One traffic selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    /// Address family
    pub ts_type: TsType,
    /// IP protocol (0 = any)
    pub protocol: u8,
    /// First port
    pub start_port: u16,
    /// Last port
    pub end_port: u16,
    /// First address
    pub start_addr: IpAddr,
    /// Last address
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    /// Encoded length
    pub fn encoded_len(&self) -> usize {
        8 + 2 * self.ts_type.addr_len()
    }

    /// Serialize
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ts_type as u8);
        buf.put_u8(self.protocol);
        buf.put_u16(self.encoded_len() as u16);
        buf.put_u16(self.start_port);
        buf.put_u16(self.end_port);
        put_addr(buf, self.start_addr);
        put_addr(buf, self.end_addr);
    }

    /// Parse one selector, returning it and the bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }
        let ts_type = TsType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unsupported TS type {}", data[0])))?;
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let expected = 8 + 2 * ts_type.addr_len();
        if len != expected {
            return Err(Error::InvalidLength {
                expected,
                actual: len,
            });
        }
        if data.len() < len {
            return Err(Error::BufferTooShort {
                required: len,
                available: data.len(),
            });
        }

        let alen = ts_type.addr_len();
        let start_addr = read_addr(ts_type, &data[8..8 + alen])?;
        let end_addr = read_addr(ts_type, &data[8 + alen..8 + 2 * alen])?;
        Ok((
            TrafficSelector {
                ts_type,
                protocol: data[1],
                start_port: u16::from_be_bytes([data[4], data[5]]),
                end_port: u16::from_be_bytes([data[6], data[7]]),
                start_addr,
                end_addr,
            },
            len,
        ))
    }

    fn addr_spec(&self) -> AddrSpec {
        let (low, high) = full_range(self.ts_type == TsType::Ipv4AddrRange);
        if self.start_addr == low && self.end_addr == high {
            AddrSpec::Any
        } else {
            AddrSpec::range(self.start_addr, self.end_addr)
        }
    }

    fn ports(&self) -> PortRange {
        PortRange {
            start: self.start_port,
            end: self.end_port,
        }
    }
}

fn put_addr(buf: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => buf.put_slice(&a.octets()),
        IpAddr::V6(a) => buf.put_slice(&a.octets()),
    }
}

fn read_addr(ts_type: TsType, data: &[u8]) -> Result<IpAddr> {
    match ts_type {
        TsType::Ipv4AddrRange => {
            let octets: [u8; 4] = data.try_into().map_err(|_| Error::InvalidLength {
                expected: 4,
                actual: data.len(),
            })?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        TsType::Ipv6AddrRange => {
            let octets: [u8; 16] = data.try_into().map_err(|_| Error::InvalidLength {
                expected: 16,
                actual: data.len(),
            })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

fn full_range(ipv4: bool) -> (IpAddr, IpAddr) {
    if ipv4 {
        (
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
        )
    } else {
        (
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::from(u128::MAX)),
        )
    }
}

/// TSi / TSr payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPayload {
    /// Selectors in wire order
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    /// Payload with a single selector
    pub fn single(selector: TrafficSelector) -> Self {
        TsPayload {
            selectors: vec![selector],
        }
    }

    /// First selector
    pub fn first(&self) -> Result<&TrafficSelector> {
        self.selectors
            .first()
            .ok_or_else(|| Error::InvalidPayload("Empty traffic selector payload".into()))
    }

    /// Serialize payload body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.selectors.len() as u8);
        buf.put_slice(&[0u8; 3]);
        for ts in &self.selectors {
            ts.encode(buf);
        }
    }

    /// Parse payload body
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let count = data[0] as usize;
        let mut selectors = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            let (ts, used) = TrafficSelector::decode(&data[offset..])?;
            selectors.push(ts);
            offset += used;
        }
        if offset != data.len() {
            return Err(Error::InvalidLength {
                expected: offset,
                actual: data.len(),
            });
        }
        Ok(TsPayload { selectors })
    }
}

fn side_range(addr: &AddrSpec, ipv4: bool) -> (IpAddr, IpAddr) {
    addr.to_range().unwrap_or_else(|| full_range(ipv4))
}

fn icmp_ports(icmp_type: Option<u8>, icmp_code: Option<u8>) -> PortRange {
    match (icmp_type, icmp_code) {
        (Some(t), Some(c)) => PortRange::single(((t as u16) << 8) | c as u16),
        (Some(t), None) => PortRange {
            start: (t as u16) << 8,
            end: ((t as u16) << 8) | 0xff,
        },
        (None, _) => PortRange::ANY,
    }
}

/// Traffic selectors for the two sides of `selector`
///
/// Returns `(source side, destination side)`. `family_hint` picks the
/// address family when both addresses are wildcards.
pub fn selector_to_ts(
    selector: &Selector,
    family_hint: IpAddr,
) -> (TrafficSelector, TrafficSelector) {
    let ipv4 = selector
        .source
        .is_ipv4()
        .or_else(|| selector.destination.is_ipv4())
        .unwrap_or(family_hint.is_ipv4());
    let ts_type = if ipv4 {
        TsType::Ipv4AddrRange
    } else {
        TsType::Ipv6AddrRange
    };

    let (source_ports, destination_ports) = if is_icmp(selector.protocol) {
        let ports = icmp_ports(selector.icmp_type, selector.icmp_code);
        (ports, ports)
    } else {
        (selector.source_port, selector.destination_port)
    };

    let make = |addr: &AddrSpec, ports: PortRange| {
        let (start_addr, end_addr) = side_range(addr, ipv4);
        TrafficSelector {
            ts_type,
            protocol: selector.protocol,
            start_port: ports.start,
            end_port: ports.end,
            start_addr,
            end_addr,
        }
    };
    (
        make(&selector.source, source_ports),
        make(&selector.destination, destination_ports),
    )
}

/// Selector covering traffic from `source` to `destination`
///
/// # Errors
///
/// Returns [`Error::TsUnacceptable`] when the two sides disagree on the
/// address family or the protocol.
pub fn ts_to_selector(source: &TrafficSelector, destination: &TrafficSelector) -> Result<Selector> {
    if source.ts_type != destination.ts_type || source.protocol != destination.protocol {
        return Err(Error::TsUnacceptable);
    }

    let mut selector = Selector::new(source.addr_spec(), destination.addr_spec())
        .with_protocol(source.protocol);
    if is_icmp(source.protocol) {
        let ports = destination.ports();
        if !ports.is_any() {
            let icmp_type = (ports.start >> 8) as u8;
            let any_code = ports.start & 0xff == 0 && ports.end & 0xff == 0xff;
            let icmp_code = if any_code {
                None
            } else {
                Some((ports.start & 0xff) as u8)
            };
            selector = selector.with_icmp(Some(icmp_type), icmp_code);
        }
    } else {
        selector = selector
            .with_source_port(source.ports())
            .with_destination_port(destination.ports());
    }
    selector.validate().map_err(|_| Error::TsUnacceptable)?;
    Ok(selector)
}
