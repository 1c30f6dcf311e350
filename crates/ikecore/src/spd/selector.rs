//! Traffic selectors
//!
//! A selector classifies traffic by source/destination address (single,
//! range or subnet), transport protocol and either ports or ICMP
//! type/code. Protocol 0, [`AddrSpec::Any`], [`PortRange::ANY`] and an
//! absent ICMP type/code are wildcards.
//!
//! Two matching modes are provided:
//!
//! - [`Selector::matches`]: the policy selector must cover the packet.
//! - [`Selector::matches_narrow`]: the offered traffic selector must cover
//!   the policy selector, which is then the narrowed result.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// ICMP
pub const PROTO_ICMP: u8 = 1;
/// IGMP
pub const PROTO_IGMP: u8 = 2;
/// TCP
pub const PROTO_TCP: u8 = 6;
/// UDP
pub const PROTO_UDP: u8 = 17;
/// ICMPv6
pub const PROTO_ICMPV6: u8 = 58;

const SELECTOR_PROTOCOLS: [u8; 6] = [0, PROTO_ICMP, PROTO_IGMP, PROTO_TCP, PROTO_UDP, PROTO_ICMPV6];

/// Whether `protocol` carries ICMP type/code instead of ports
pub fn is_icmp(protocol: u8) -> bool {
    protocol == PROTO_ICMP || protocol == PROTO_ICMPV6
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

fn addr_bits(addr: IpAddr) -> (Family, u128) {
    match addr {
        IpAddr::V4(v4) => (Family::V4, u32::from(v4) as u128),
        IpAddr::V6(v6) => (Family::V6, u128::from(v6)),
    }
}

fn bits_addr(family: Family, bits: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

/// Address part of a selector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddrSpec {
    /// Any address of any family
    Any,
    /// Exactly one address
    Single(IpAddr),
    /// Inclusive range
    Range {
        /// First address
        low: IpAddr,
        /// Last address
        high: IpAddr,
    },
    /// Network prefix
    Subnet {
        /// Network address (host bits are ignored)
        addr: IpAddr,
        /// Prefix length in bits
        prefix_len: u8,
    },
}

impl AddrSpec {
    /// Subnet from an IPv4 netmask such as 255.255.255.0
    pub fn from_netmask(addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let bits = u32::from(mask);
        let prefix_len = bits.leading_ones();
        if bits.checked_shl(prefix_len).unwrap_or(0) != 0 {
            return Err(Error::InvalidParameter(format!(
                "Non-contiguous netmask {}",
                mask
            )));
        }
        Ok(AddrSpec::Subnet {
            addr: IpAddr::V4(addr),
            prefix_len: prefix_len as u8,
        })
    }

    /// Range collapsing to a single address when both ends are equal
    pub fn range(low: IpAddr, high: IpAddr) -> Self {
        if low == high {
            AddrSpec::Single(low)
        } else {
            AddrSpec::Range { low, high }
        }
    }

    fn bounds(&self) -> Option<(Family, u128, u128)> {
        match self {
            AddrSpec::Any => None,
            AddrSpec::Single(addr) => {
                let (family, bits) = addr_bits(*addr);
                Some((family, bits, bits))
            }
            AddrSpec::Range { low, high } => {
                let (family, low) = addr_bits(*low);
                let (_, high) = addr_bits(*high);
                Some((family, low, high))
            }
            AddrSpec::Subnet { addr, prefix_len } => {
                let (family, bits) = addr_bits(*addr);
                let width: u32 = if family == Family::V4 { 32 } else { 128 };
                let host_bits = width.saturating_sub(*prefix_len as u32);
                let host_mask: u128 = if host_bits >= 128 {
                    u128::MAX
                } else {
                    (1u128 << host_bits) - 1
                };
                let low = bits & !host_mask;
                Some((family, low, low | host_mask))
            }
        }
    }

    /// Inclusive first and last address, None for [`AddrSpec::Any`]
    pub fn to_range(&self) -> Option<(IpAddr, IpAddr)> {
        self.bounds()
            .map(|(family, low, high)| (bits_addr(family, low), bits_addr(family, high)))
    }

    /// First address of the set
    pub fn first_addr(&self) -> Option<IpAddr> {
        self.to_range().map(|(low, _)| low)
    }

    /// Whether this is the IPv4 family (None for Any)
    pub fn is_ipv4(&self) -> Option<bool> {
        self.bounds().map(|(family, _, _)| family == Family::V4)
    }

    /// Reject empty ranges, mixed families and oversize prefixes
    pub fn validate(&self) -> Result<()> {
        match self {
            AddrSpec::Any | AddrSpec::Single(_) => Ok(()),
            AddrSpec::Range { low, high } => {
                let (low_family, low_bits) = addr_bits(*low);
                let (high_family, high_bits) = addr_bits(*high);
                if low_family != high_family {
                    return Err(Error::InvalidParameter(
                        "Address range mixes address families".into(),
                    ));
                }
                if low_bits > high_bits {
                    return Err(Error::InvalidParameter(format!(
                        "Empty address range {} - {}",
                        low, high
                    )));
                }
                Ok(())
            }
            AddrSpec::Subnet { addr, prefix_len } => {
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if *prefix_len > max {
                    return Err(Error::InvalidParameter(format!(
                        "Prefix length {} exceeds {}",
                        prefix_len, max
                    )));
                }
                Ok(())
            }
        }
    }

    /// Whether every address of `other` is in this set
    pub fn contains(&self, other: &AddrSpec) -> bool {
        match (self.bounds(), other.bounds()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((family, low, high)), Some((other_family, other_low, other_high))) => {
                family == other_family && low <= other_low && other_high <= high
            }
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port
    pub end: u16,
}

impl PortRange {
    /// All ports
    pub const ANY: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };

    /// Exactly one port
    pub fn single(port: u16) -> Self {
        PortRange {
            start: port,
            end: port,
        }
    }

    /// Whether this is the wildcard range
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Whether `other` lies inside this range
    pub fn contains(&self, other: &PortRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::ANY
    }
}

/// Result of a successful narrowing match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarrowResult {
    /// Concrete protocol the wildcard traffic selector was narrowed to
    pub narrowed_protocol: Option<u8>,
}

/// Traffic selector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    /// Source (local, for outbound traffic) addresses
    pub source: AddrSpec,
    /// Destination (remote, for outbound traffic) addresses
    pub destination: AddrSpec,
    /// IP protocol, 0 for any
    pub protocol: u8,
    /// Source ports
    pub source_port: PortRange,
    /// Destination ports
    pub destination_port: PortRange,
    /// ICMP type (ICMP protocols only)
    pub icmp_type: Option<u8>,
    /// ICMP code (ICMP protocols only)
    pub icmp_code: Option<u8>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::any()
    }
}

impl Selector {
    /// Selector matching all traffic
    pub fn any() -> Self {
        Selector {
            source: AddrSpec::Any,
            destination: AddrSpec::Any,
            protocol: 0,
            source_port: PortRange::ANY,
            destination_port: PortRange::ANY,
            icmp_type: None,
            icmp_code: None,
        }
    }

    /// Selector between two address sets
    pub fn new(source: AddrSpec, destination: AddrSpec) -> Self {
        Selector {
            source,
            destination,
            ..Self::any()
        }
    }

    /// Concrete selector describing one packet
    pub fn packet(
        source: IpAddr,
        destination: IpAddr,
        protocol: u8,
        source_port: u16,
        destination_port: u16,
    ) -> Self {
        Selector {
            source: AddrSpec::Single(source),
            destination: AddrSpec::Single(destination),
            protocol,
            source_port: PortRange::single(source_port),
            destination_port: PortRange::single(destination_port),
            icmp_type: None,
            icmp_code: None,
        }
    }

    /// Concrete selector describing one ICMP packet
    pub fn icmp_packet(
        source: IpAddr,
        destination: IpAddr,
        protocol: u8,
        icmp_type: u8,
        icmp_code: u8,
    ) -> Self {
        Selector {
            source: AddrSpec::Single(source),
            destination: AddrSpec::Single(destination),
            protocol,
            source_port: PortRange::ANY,
            destination_port: PortRange::ANY,
            icmp_type: Some(icmp_type),
            icmp_code: Some(icmp_code),
        }
    }

    /// Restrict to one protocol
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restrict source ports
    pub fn with_source_port(mut self, ports: PortRange) -> Self {
        self.source_port = ports;
        self
    }

    /// Restrict destination ports
    pub fn with_destination_port(mut self, ports: PortRange) -> Self {
        self.destination_port = ports;
        self
    }

    /// Restrict ICMP type and code
    pub fn with_icmp(mut self, icmp_type: Option<u8>, icmp_code: Option<u8>) -> Self {
        self.icmp_type = icmp_type;
        self.icmp_code = icmp_code;
        self
    }

    /// Validate protocol, addresses and ports
    pub fn validate(&self) -> Result<()> {
        if !SELECTOR_PROTOCOLS.contains(&self.protocol) {
            return Err(Error::InvalidParameter(format!(
                "Unsupported selector protocol {}",
                self.protocol
            )));
        }
        self.source.validate()?;
        self.destination.validate()?;
        if let (Some(src), Some(dst)) = (self.source.is_ipv4(), self.destination.is_ipv4()) {
            if src != dst {
                return Err(Error::InvalidParameter(
                    "Selector mixes address families".into(),
                ));
            }
        }
        if self.source_port.start > self.source_port.end
            || self.destination_port.start > self.destination_port.end
        {
            return Err(Error::InvalidParameter("Empty port range".into()));
        }
        if !is_icmp(self.protocol) && (self.icmp_type.is_some() || self.icmp_code.is_some()) {
            return Err(Error::InvalidParameter(
                "ICMP type/code on a non-ICMP selector".into(),
            ));
        }
        Ok(())
    }

    /// Same selector seen from the other direction
    pub fn switched(&self) -> Selector {
        Selector {
            source: self.destination.clone(),
            destination: self.source.clone(),
            source_port: self.destination_port,
            destination_port: self.source_port,
            ..self.clone()
        }
    }

    /// Whether this (policy) selector covers `pkt`
    ///
    /// With `swap`, the packet is matched with its source and destination
    /// roles exchanged (inbound traffic against a dual-flow policy).
    pub fn matches(&self, pkt: &Selector, swap: bool) -> bool {
        if self.protocol != 0 && self.protocol != pkt.protocol {
            return false;
        }

        if is_icmp(self.protocol) {
            if self.icmp_type.is_some() && self.icmp_type != pkt.icmp_type {
                return false;
            }
            if self.icmp_code.is_some() && self.icmp_code != pkt.icmp_code {
                return false;
            }
        } else {
            let (src_port, dst_port) = if swap {
                (&pkt.destination_port, &pkt.source_port)
            } else {
                (&pkt.source_port, &pkt.destination_port)
            };
            if !self.source_port.contains(src_port) || !self.destination_port.contains(dst_port) {
                return false;
            }
        }

        let (src, dst) = if swap {
            (&pkt.destination, &pkt.source)
        } else {
            (&pkt.source, &pkt.destination)
        };
        self.source.contains(src) && self.destination.contains(dst)
    }

    /// Whether the offered `traffic` selector covers this (policy) selector
    ///
    /// On success the policy selector is the narrowed result; when the
    /// traffic protocol was a wildcard and the policy names a concrete
    /// protocol, that protocol is reported.
    pub fn matches_narrow(&self, traffic: &Selector, swap: bool) -> Option<NarrowResult> {
        if traffic.protocol != 0 && traffic.protocol != self.protocol {
            return None;
        }
        let narrowed_protocol = if self.protocol != 0 && traffic.protocol == 0 {
            Some(self.protocol)
        } else {
            None
        };

        if is_icmp(self.protocol) {
            if traffic.protocol == self.protocol {
                if traffic.icmp_type.is_some() && traffic.icmp_type != self.icmp_type {
                    return None;
                }
                if traffic.icmp_code.is_some() && traffic.icmp_code != self.icmp_code {
                    return None;
                }
            }
        } else {
            let (src_port, dst_port) = if swap {
                (&traffic.destination_port, &traffic.source_port)
            } else {
                (&traffic.source_port, &traffic.destination_port)
            };
            if !src_port.contains(&self.source_port) || !dst_port.contains(&self.destination_port)
            {
                return None;
            }
        }

        let (src, dst) = if swap {
            (&traffic.destination, &traffic.source)
        } else {
            (&traffic.source, &traffic.destination)
        };
        if src.contains(&self.source) && dst.contains(&self.destination) {
            Some(NarrowResult { narrowed_protocol })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn subnet(a: u8, b: u8, c: u8, d: u8, prefix_len: u8) -> AddrSpec {
        AddrSpec::Subnet {
            addr: v4(a, b, c, d),
            prefix_len,
        }
    }

    #[test]
    fn test_subnet_bounds() {
        let net = subnet(192, 168, 1, 77, 24);
        assert_eq!(
            net.to_range(),
            Some((v4(192, 168, 1, 0), v4(192, 168, 1, 255)))
        );
        assert!(net.contains(&AddrSpec::Single(v4(192, 168, 1, 10))));
        assert!(!net.contains(&AddrSpec::Single(v4(192, 168, 2, 10))));
        assert!(subnet(0, 0, 0, 0, 0).contains(&AddrSpec::Single(v4(8, 8, 8, 8))));

        let v6 = AddrSpec::Subnet {
            addr: "2001:db8::".parse().unwrap(),
            prefix_len: 32,
        };
        assert!(v6.contains(&AddrSpec::Single("2001:db8::1".parse().unwrap())));
        assert!(!v6.contains(&AddrSpec::Single(v4(1, 2, 3, 4))));
    }

    #[test]
    fn test_netmask() {
        let net = AddrSpec::from_netmask(
            Ipv4Addr::new(10, 1, 0, 0),
            Ipv4Addr::new(255, 255, 0, 0),
        )
        .unwrap();
        assert_eq!(
            net,
            AddrSpec::Subnet {
                addr: v4(10, 1, 0, 0),
                prefix_len: 16
            }
        );
        assert!(AddrSpec::from_netmask(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 255, 0))
            .is_err());
    }

    #[test]
    fn test_range_validation() {
        assert!(AddrSpec::Range {
            low: v4(10, 0, 0, 9),
            high: v4(10, 0, 0, 1)
        }
        .validate()
        .is_err());
        assert!(AddrSpec::Range {
            low: v4(10, 0, 0, 1),
            high: "::1".parse().unwrap()
        }
        .validate()
        .is_err());
        assert!(subnet(10, 0, 0, 0, 33).validate().is_err());
        assert_eq!(
            AddrSpec::range(v4(1, 1, 1, 1), v4(1, 1, 1, 1)),
            AddrSpec::Single(v4(1, 1, 1, 1))
        );
    }

    #[test]
    fn test_selector_protocol_validation() {
        assert!(Selector::any().with_protocol(PROTO_TCP).validate().is_ok());
        assert!(Selector::any().with_protocol(47).validate().is_err());
        assert!(Selector::any()
            .with_protocol(PROTO_TCP)
            .with_icmp(Some(8), None)
            .validate()
            .is_err());
    }

    #[test]
    fn test_matches_ports_and_addresses() {
        let policy = Selector::new(subnet(10, 0, 0, 0, 24), subnet(10, 0, 1, 0, 24))
            .with_protocol(PROTO_TCP)
            .with_destination_port(PortRange::single(443));

        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 9), PROTO_TCP, 40000, 443);
        assert!(policy.matches(&pkt, false));

        let wrong_port = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 9), PROTO_TCP, 40000, 80);
        assert!(!policy.matches(&wrong_port, false));

        let wrong_proto = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 9), PROTO_UDP, 40000, 443);
        assert!(!policy.matches(&wrong_proto, false));

        // Reply traffic only matches with roles swapped
        let reply = Selector::packet(v4(10, 0, 1, 9), v4(10, 0, 0, 5), PROTO_TCP, 443, 40000);
        assert!(!policy.matches(&reply, false));
        assert!(policy.matches(&reply, true));
    }

    #[test]
    fn test_matches_icmp() {
        let policy = Selector::any()
            .with_protocol(PROTO_ICMP)
            .with_icmp(Some(8), None);
        let echo = Selector::icmp_packet(v4(1, 1, 1, 1), v4(2, 2, 2, 2), PROTO_ICMP, 8, 0);
        let reply = Selector::icmp_packet(v4(1, 1, 1, 1), v4(2, 2, 2, 2), PROTO_ICMP, 0, 0);
        assert!(policy.matches(&echo, false));
        assert!(!policy.matches(&reply, false));
    }

    #[test]
    fn test_matches_narrow() {
        let policy = Selector::new(subnet(10, 0, 0, 0, 24), subnet(10, 0, 1, 0, 24))
            .with_protocol(PROTO_UDP);

        // Offered traffic is wider than the policy: narrowed to the policy
        let offered = Selector::new(subnet(10, 0, 0, 0, 16), subnet(10, 0, 0, 0, 16));
        let result = policy.matches_narrow(&offered, false).unwrap();
        assert_eq!(result.narrowed_protocol, Some(PROTO_UDP));

        // Offered traffic narrower than the policy is not a superset
        let narrow = Selector::new(subnet(10, 0, 0, 0, 25), subnet(10, 0, 1, 0, 24));
        assert!(policy.matches_narrow(&narrow, false).is_none());

        // Conflicting protocol
        let tcp = offered.clone().with_protocol(PROTO_TCP);
        assert!(policy.matches_narrow(&tcp, false).is_none());

        // Swapped roles
        let reversed = Selector::new(subnet(10, 0, 1, 0, 24), subnet(10, 0, 0, 0, 24));
        assert!(policy.matches_narrow(&reversed, false).is_none());
        assert!(policy.matches_narrow(&reversed, true).is_some());
    }

    #[test]
    fn test_narrow_implies_cover() {
        let policy = Selector::new(subnet(192, 168, 0, 0, 24), AddrSpec::Any)
            .with_protocol(PROTO_TCP)
            .with_destination_port(PortRange::single(22));
        let offered = Selector::new(subnet(192, 168, 0, 0, 16), AddrSpec::Any);

        assert!(policy.matches_narrow(&offered, false).is_some());
        // The offered selector covers the policy (ignoring the protocol it left open)
        assert!(offered.with_protocol(PROTO_TCP).matches(&policy, false));
    }

    #[test]
    fn test_switched() {
        let sel = Selector::packet(v4(1, 1, 1, 1), v4(2, 2, 2, 2), PROTO_TCP, 1000, 22);
        let sw = sel.switched();
        assert_eq!(sw.source, AddrSpec::Single(v4(2, 2, 2, 2)));
        assert_eq!(sw.source_port, PortRange::single(22));
        assert_eq!(sw.switched(), sel);
    }
}
