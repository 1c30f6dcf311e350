//! Security policies
//!
//! A policy maps a selector and a flow direction to an action. For
//! [`PolicyAction::Apply`] it also lists the security protocols that must
//! protect the traffic, outermost last:
//!
//! ```text
//! security[0]   innermost  (e.g. ESP transport)
//! security[1]              (e.g. AH tunnel)
//! ```

use std::net::IpAddr;
use std::time::Duration;

use super::bundle::OutboundBundle;
use super::selector::Selector;
use crate::config::Lifetime;
use crate::crypto::{EncryptionAlgorithm, IntegrityAlgorithm};
use crate::error::{Error, Result};

/// Maximum number of security protocols in one policy
pub const MAX_BUNDLE: usize = 4;

/// What to do with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Pass in clear
    Bypass,
    /// Protect with the listed security protocols
    Apply,
    /// Drop
    Discard,
}

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received traffic
    Inbound,
    /// Sent traffic
    Outbound,
}

/// Directions a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Received traffic only
    Inbound,
    /// Sent traffic only
    Outbound,
    /// Both; inbound traffic is matched with roles swapped
    Dual,
}

impl Flow {
    /// Whether the flow covers `direction`
    pub fn includes(self, direction: Direction) -> bool {
        match self {
            Flow::Dual => true,
            Flow::Inbound => direction == Direction::Inbound,
            Flow::Outbound => direction == Direction::Outbound,
        }
    }

    /// Whether selector roles are swapped for traffic in `direction`
    pub fn swaps(self, direction: Direction) -> bool {
        self == Flow::Dual && direction == Direction::Inbound
    }
}

/// IPsec protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecProtocol {
    /// Encapsulating Security Payload
    Esp,
    /// Authentication Header
    Ah,
}

impl IpsecProtocol {
    /// IP protocol number
    pub fn ip_protocol(self) -> u8 {
        match self {
            IpsecProtocol::Esp => 50,
            IpsecProtocol::Ah => 51,
        }
    }

    /// Protocol ID in SA, notify and delete payloads (same in both versions)
    pub fn protocol_id(self) -> u8 {
        match self {
            IpsecProtocol::Ah => 2,
            IpsecProtocol::Esp => 3,
        }
    }

    /// Parse protocol ID
    pub fn from_protocol_id(id: u8) -> Option<Self> {
        match id {
            2 => Some(IpsecProtocol::Ah),
            3 => Some(IpsecProtocol::Esp),
            _ => None,
        }
    }
}

/// Encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    /// Transport mode
    Transport,
    /// Tunnel mode between two gateways
    Tunnel {
        /// Local tunnel endpoint
        source: IpAddr,
        /// Remote tunnel endpoint
        destination: IpAddr,
    },
}

impl SecurityMode {
    /// Whether this is tunnel mode
    pub fn is_tunnel(&self) -> bool {
        matches!(self, SecurityMode::Tunnel { .. })
    }

    /// Mode with tunnel endpoints exchanged
    pub fn switched(&self) -> SecurityMode {
        match *self {
            SecurityMode::Transport => SecurityMode::Transport,
            SecurityMode::Tunnel {
                source,
                destination,
            } => SecurityMode::Tunnel {
                source: destination,
                destination: source,
            },
        }
    }
}

/// Which request selector fields come from the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DerivationFlags {
    /// Local address from the packet
    pub local_addr: bool,
    /// Remote address from the packet
    pub remote_addr: bool,
    /// Protocol from the packet
    pub protocol: bool,
    /// Local port from the packet
    pub local_port: bool,
    /// Remote port from the packet
    pub remote_port: bool,
}

/// How the selector of a negotiated SA is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaDerivation {
    /// One SA for everything the policy covers
    FromPolicy,
    /// One SA per distinct packet selector
    FromPacket,
    /// Policy selector with some fields taken from the packet
    Partial(DerivationFlags),
}

impl SaDerivation {
    /// Build the selector used to find or request SAs for `pkt`
    pub fn request_selector(&self, policy: &Selector, pkt: &Selector) -> Selector {
        match self {
            SaDerivation::FromPolicy => policy.clone(),
            SaDerivation::FromPacket => pkt.clone(),
            SaDerivation::Partial(flags) => {
                let mut sel = policy.clone();
                if flags.local_addr {
                    sel.source = pkt.source.clone();
                }
                if flags.remote_addr {
                    sel.destination = pkt.destination.clone();
                }
                if flags.protocol {
                    sel.protocol = pkt.protocol;
                    sel.icmp_type = pkt.icmp_type;
                    sel.icmp_code = pkt.icmp_code;
                }
                if flags.local_port {
                    sel.source_port = pkt.source_port;
                }
                if flags.remote_port {
                    sel.destination_port = pkt.destination_port;
                }
                sel
            }
        }
    }
}

/// One required security protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProtocol {
    /// AH or ESP
    pub protocol: IpsecProtocol,
    /// Transport or tunnel
    pub mode: SecurityMode,
    /// Integrity algorithm (required for AH)
    pub integrity: Option<IntegrityAlgorithm>,
    /// Encryption algorithm (ESP only)
    pub encryption: Option<EncryptionAlgorithm>,
    /// Key length in bits for variable length ciphers
    pub encryption_key_bits: Option<u16>,
    /// Extended sequence numbers
    pub esn: bool,
    /// SA selector derivation
    pub derivation: SaDerivation,
    /// Lifetime of negotiated SAs
    pub lifetime: Lifetime,
}

impl SecurityProtocol {
    /// ESP with the given algorithms, transport mode
    pub fn esp(
        encryption: EncryptionAlgorithm,
        key_bits: Option<u16>,
        integrity: Option<IntegrityAlgorithm>,
    ) -> Self {
        SecurityProtocol {
            protocol: IpsecProtocol::Esp,
            mode: SecurityMode::Transport,
            integrity,
            encryption: Some(encryption),
            encryption_key_bits: key_bits,
            esn: false,
            derivation: SaDerivation::FromPolicy,
            lifetime: Lifetime::default(),
        }
    }

    /// AH with the given integrity algorithm, transport mode
    pub fn ah(integrity: IntegrityAlgorithm) -> Self {
        SecurityProtocol {
            protocol: IpsecProtocol::Ah,
            mode: SecurityMode::Transport,
            integrity: Some(integrity),
            encryption: None,
            encryption_key_bits: None,
            esn: false,
            derivation: SaDerivation::FromPolicy,
            lifetime: Lifetime::default(),
        }
    }

    /// Use tunnel mode between the given gateways
    pub fn with_tunnel(mut self, source: IpAddr, destination: IpAddr) -> Self {
        self.mode = SecurityMode::Tunnel {
            source,
            destination,
        };
        self
    }

    /// Enable extended sequence numbers
    pub fn with_esn(mut self, esn: bool) -> Self {
        self.esn = esn;
        self
    }

    /// Set SA selector derivation
    pub fn with_derivation(mut self, derivation: SaDerivation) -> Self {
        self.derivation = derivation;
        self
    }

    /// Set SA lifetime
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Effective encryption key length in bits
    pub fn key_bits(&self) -> u16 {
        self.encryption
            .and_then(|enc| enc.expected_key_bits(self.encryption_key_bits))
            .unwrap_or(0)
    }

    /// Encryption key material length in bytes
    pub fn encryption_keymat_len(&self) -> usize {
        self.encryption
            .map(|enc| enc.keymat_len(self.key_bits()))
            .unwrap_or(0)
    }

    /// Integrity key length in bytes
    pub fn integrity_key_len(&self) -> usize {
        self.integrity.map(|i| i.key_len()).unwrap_or(0)
    }

    /// Whether `other` provides the same protection (protocol, mode, algorithms)
    pub fn same_suite(&self, other: &SecurityProtocol) -> bool {
        self.protocol == other.protocol
            && self.mode.is_tunnel() == other.mode.is_tunnel()
            && self.integrity == other.integrity
            && self.encryption == other.encryption
            && self.key_bits() == other.key_bits()
            && self.esn == other.esn
    }

    /// Reject incomplete or contradictory algorithm choices
    pub fn validate(&self) -> Result<()> {
        match self.protocol {
            IpsecProtocol::Ah => {
                if self.integrity.is_none() {
                    return Err(Error::InvalidParameter(
                        "AH requires an integrity algorithm".into(),
                    ));
                }
                if self.encryption.is_some() {
                    return Err(Error::InvalidParameter("AH cannot encrypt".into()));
                }
            }
            IpsecProtocol::Esp => {
                let enc = self.encryption.ok_or_else(|| {
                    Error::InvalidParameter("ESP requires an encryption algorithm".into())
                })?;
                if enc.is_aead() && self.integrity.is_some() {
                    return Err(Error::InvalidParameter(
                        "AEAD cipher combined with an integrity algorithm".into(),
                    ));
                }
                if enc == EncryptionAlgorithm::Null && self.integrity.is_none() {
                    return Err(Error::InvalidParameter(
                        "ESP with NULL encryption requires integrity".into(),
                    ));
                }
                if let Some(bits) = self.encryption_key_bits {
                    if enc.has_variable_key_len() && ![128, 192, 256].contains(&bits) {
                        return Err(Error::InvalidParameter(format!(
                            "Invalid key length {}",
                            bits
                        )));
                    }
                }
            }
        }
        self.lifetime.validate()
    }
}

/// Security policy
#[derive(Debug, Clone)]
pub struct Policy {
    /// Index assigned when added to a group (0 until then)
    pub index: u32,
    /// Traffic selector
    pub selector: Selector,
    /// Directions
    pub flow: Flow,
    /// Action
    pub action: PolicyAction,
    /// Required security protocols, innermost first
    pub security: Vec<SecurityProtocol>,
    /// Lifetime of cached outbound bundles
    pub bundle_lifetime: Duration,
    pub(crate) bundles: Vec<OutboundBundle>,
}

impl Policy {
    fn new(selector: Selector, flow: Flow, action: PolicyAction) -> Self {
        Policy {
            index: 0,
            selector,
            flow,
            action,
            security: Vec::new(),
            bundle_lifetime: Duration::from_secs(300),
            bundles: Vec::new(),
        }
    }

    /// Pass matching traffic in clear
    pub fn bypass(selector: Selector, flow: Flow) -> Self {
        Self::new(selector, flow, PolicyAction::Bypass)
    }

    /// Drop matching traffic
    pub fn discard(selector: Selector, flow: Flow) -> Self {
        Self::new(selector, flow, PolicyAction::Discard)
    }

    /// Protect matching traffic
    pub fn apply(selector: Selector, flow: Flow, security: Vec<SecurityProtocol>) -> Self {
        Policy {
            security,
            ..Self::new(selector, flow, PolicyAction::Apply)
        }
    }

    /// Set outbound bundle lifetime
    pub fn with_bundle_lifetime(mut self, lifetime: Duration) -> Self {
        self.bundle_lifetime = lifetime;
        self
    }

    /// Cached outbound bundles
    pub fn bundles(&self) -> &[OutboundBundle] {
        &self.bundles
    }

    /// Validate selector, action and security list
    pub fn validate(&self) -> Result<()> {
        self.selector.validate()?;
        if self.security.len() > MAX_BUNDLE {
            return Err(Error::InvalidParameter(format!(
                "At most {} security protocols per policy",
                MAX_BUNDLE
            )));
        }
        if self.action == PolicyAction::Apply && self.security.is_empty() {
            return Err(Error::InvalidParameter(
                "Apply policy requires a security protocol".into(),
            ));
        }
        if !self.security.is_empty() {
            if self.action != PolicyAction::Apply {
                return Err(Error::InvalidParameter(format!(
                    "{:?} policy cannot list security protocols",
                    self.action
                )));
            }
            if self.bundle_lifetime.is_zero() {
                return Err(Error::InvalidParameter(
                    "Bundle lifetime must be non-zero".into(),
                ));
            }
        }
        for security in &self.security {
            security.validate()?;
        }
        Ok(())
    }

    pub(crate) fn bundle_index_by_selector(&self, req: &Selector) -> Option<usize> {
        self.bundles
            .iter()
            .position(|bundle| req.matches(&bundle.selector, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spd::selector::{AddrSpec, PortRange, PROTO_TCP};
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_flow_includes() {
        assert!(Flow::Dual.includes(Direction::Inbound));
        assert!(Flow::Outbound.includes(Direction::Outbound));
        assert!(!Flow::Outbound.includes(Direction::Inbound));
        assert!(Flow::Dual.swaps(Direction::Inbound));
        assert!(!Flow::Inbound.swaps(Direction::Inbound));
    }

    #[test]
    fn test_security_validation() {
        let esp = SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha256_128),
        );
        assert!(esp.validate().is_ok());
        assert_eq!(esp.key_bits(), 128);
        assert_eq!(esp.encryption_keymat_len(), 16);

        let gcm_with_integ = SecurityProtocol::esp(
            EncryptionAlgorithm::AesGcm16,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha1_96),
        );
        assert!(gcm_with_integ.validate().is_err());

        let null_only = SecurityProtocol::esp(EncryptionAlgorithm::Null, None, None);
        assert!(null_only.validate().is_err());

        let mut ah = SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96);
        assert!(ah.validate().is_ok());
        ah.integrity = None;
        assert!(ah.validate().is_err());
    }

    #[test]
    fn test_same_suite_ignores_tunnel_endpoints() {
        let a = SecurityProtocol::esp(EncryptionAlgorithm::AesGcm16, Some(256), None)
            .with_tunnel(v4(1, 1, 1, 1), v4(2, 2, 2, 2));
        let b = a.clone().with_tunnel(v4(3, 3, 3, 3), v4(4, 4, 4, 4));
        assert!(a.same_suite(&b));

        let transport = SecurityProtocol::esp(EncryptionAlgorithm::AesGcm16, Some(256), None);
        assert!(!a.same_suite(&transport));
        assert!(!transport.same_suite(&transport.clone().with_esn(true)));
    }

    #[test]
    fn test_policy_validation() {
        let sel = Selector::any();
        let esp = SecurityProtocol::esp(EncryptionAlgorithm::AesGcm16, None, None);

        let mut bypass = Policy::bypass(sel.clone(), Flow::Dual);
        assert!(bypass.validate().is_ok());
        bypass.security.push(esp.clone());
        assert!(bypass.validate().is_err());

        let too_many = Policy::apply(sel.clone(), Flow::Dual, vec![esp.clone(); 5]);
        assert!(too_many.validate().is_err());

        let no_lifetime =
            Policy::apply(sel, Flow::Dual, vec![esp]).with_bundle_lifetime(Duration::ZERO);
        assert!(no_lifetime.validate().is_err());
    }

    #[test]
    fn test_request_selector_derivation() {
        let policy = Selector::new(
            AddrSpec::Subnet {
                addr: v4(10, 0, 0, 0),
                prefix_len: 24,
            },
            AddrSpec::Any,
        );
        let pkt = Selector::packet(v4(10, 0, 0, 7), v4(8, 8, 8, 8), PROTO_TCP, 5000, 80);

        assert_eq!(SaDerivation::FromPolicy.request_selector(&policy, &pkt), policy);
        assert_eq!(SaDerivation::FromPacket.request_selector(&policy, &pkt), pkt);

        let partial = SaDerivation::Partial(DerivationFlags {
            remote_addr: true,
            remote_port: true,
            ..Default::default()
        });
        let req = partial.request_selector(&policy, &pkt);
        assert_eq!(req.source, policy.source);
        assert_eq!(req.destination, AddrSpec::Single(v4(8, 8, 8, 8)));
        assert_eq!(req.destination_port, PortRange::single(80));
        assert_eq!(req.protocol, 0);
    }
}
