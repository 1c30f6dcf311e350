//! SA installation bridge
//!
//! Turns negotiated child SA descriptors (protocol, SPIs, keys) into
//! inbound/outbound SA pairs in the policy database. Both key exchange
//! versions end their child negotiation here.
//!
//! A bundle (for example AH and ESP negotiated together) is installed
//! completely or not at all: when one pair fails, the pairs installed
//! before it are removed again.

use std::net::IpAddr;

use tokio::time::Instant;

use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::logging;
use crate::spd::{
    InboundSa, IpsecProtocol, OutboundSa, SaKeys, SecurityMode, SecurityPolicyDb,
    SecurityProtocol, Selector,
};

/// SPIs below this value are reserved (RFC 4303 Section 2.1)
const MIN_SPI: u32 = 0x100;

/// Keys of one negotiated child SA pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildKeys {
    /// Keys for traffic from the peer
    pub inbound: SaKeys,
    /// Keys for traffic to the peer
    pub outbound: SaKeys,
}

/// One negotiated child SA pair awaiting installation
#[derive(Debug, Clone)]
pub struct ChildSaDescriptor {
    /// Agreed protection, seen from our side
    pub security: SecurityProtocol,
    /// SPI we allocated (peer sends with it)
    pub inbound_spi: u32,
    /// SPI the peer allocated (we send with it)
    pub outbound_spi: u32,
    /// Derived keys
    pub keys: ChildKeys,
}

/// Record of an installed child SA pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledChild {
    /// Policy group
    pub group: String,
    /// Policy the pair was negotiated for
    pub policy_index: u32,
    /// Protocol
    pub protocol: IpsecProtocol,
    /// Our SPI
    pub inbound_spi: u32,
    /// Peer's SPI
    pub outbound_spi: u32,
    /// Outbound SA index in the database
    pub outbound_index: u32,
    /// Destination of outbound traffic (SADB key)
    pub destination: IpAddr,
}

/// Destination under which an outbound SA is keyed
pub fn outbound_destination(security: &SecurityProtocol, peer: IpAddr) -> IpAddr {
    match security.mode {
        SecurityMode::Tunnel { destination, .. } => destination,
        SecurityMode::Transport => peer,
    }
}

/// Pick a fresh inbound SPI for `protocol`
///
/// SPIs already used by an inbound SA of the group are skipped.
pub fn allocate_spi(
    provider: &dyn CryptoProvider,
    spd: &SecurityPolicyDb,
    group: &str,
    protocol: IpsecProtocol,
) -> Result<u32> {
    let sadb = spd.group(group)?.sadb();
    for _ in 0..16 {
        let mut buf = [0u8; 4];
        provider.random_bytes(&mut buf)?;
        let spi = u32::from_be_bytes(buf);
        if spi < MIN_SPI {
            continue;
        }
        if !sadb
            .inbound()
            .iter()
            .any(|sa| sa.spi == spi && sa.protocol() == protocol)
        {
            return Ok(spi);
        }
    }
    Err(Error::Internal("Could not allocate a free SPI".into()))
}

/// Install a negotiated bundle
///
/// # Arguments
///
/// * `group` - Policy group
/// * `policy_index` - Policy the bundle protects
/// * `selector` - Traffic selector in the outbound view (source is local)
/// * `peer` - Peer address
/// * `children` - Pairs in negotiation order
/// * `now` - Installation time (starts lifetime timers)
///
/// # Returns
///
/// One record per installed pair, or the first error after every pair of
/// this call has been removed again.
pub fn install_children(
    spd: &mut SecurityPolicyDb,
    group: &str,
    policy_index: u32,
    selector: &Selector,
    peer: IpAddr,
    children: Vec<ChildSaDescriptor>,
    now: Instant,
) -> Result<Vec<InstalledChild>> {
    let mut installed: Vec<InstalledChild> = Vec::with_capacity(children.len());

    for child in children {
        let protocol = child.security.protocol;
        let destination = outbound_destination(&child.security, peer);
        let inbound = InboundSa {
            spi: child.inbound_spi,
            security: SecurityProtocol {
                mode: child.security.mode.switched(),
                ..child.security.clone()
            },
            selector: selector.switched(),
            keys: child.keys.inbound,
            peer,
            created: now,
        };
        let outbound = OutboundSa {
            index: 0,
            spi: child.outbound_spi,
            inbound_spi: None,
            security: child.security,
            selector: selector.clone(),
            keys: child.keys.outbound,
            peer,
            created: now,
        };

        match spd.install_pair(group, inbound, outbound, now) {
            Ok(outbound_index) => {
                logging::log_child_sa_installed(
                    child.inbound_spi,
                    child.outbound_spi,
                    protocol.protocol_id(),
                );
                installed.push(InstalledChild {
                    group: group.to_string(),
                    policy_index,
                    protocol,
                    inbound_spi: child.inbound_spi,
                    outbound_spi: child.outbound_spi,
                    outbound_index,
                    destination,
                });
            }
            Err(e) => {
                for done in &installed {
                    let (spi, protocol) = (done.outbound_spi, done.protocol);
                    let result = spd.remove_sa_pair(group, spi, protocol, done.destination);
                    if let Err(cleanup) = result {
                        spd.errors().record("bundle rollback", cleanup);
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(installed)
}

/// Remove installed pairs, recording failures as non-fatal
///
/// Pairs that are already gone (expired) are skipped silently.
pub fn remove_children(spd: &mut SecurityPolicyDb, children: &[InstalledChild]) -> usize {
    let mut removed = 0;
    for child in children {
        let (spi, protocol) = (child.outbound_spi, child.protocol);
        match spd.remove_sa_pair(&child.group, spi, protocol, child.destination) {
            Ok(_) => {
                logging::log_child_sa_deleted(child.inbound_spi, "ike_sa_deleted");
                removed += 1;
            }
            Err(Error::SaNotFound(_)) => {}
            Err(e) => spd.errors().record("child SA removal", e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultProvider, EncryptionAlgorithm, IntegrityAlgorithm};
    use crate::spd::{AddrSpec, Flow, Policy};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use zeroize::Zeroizing;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn selector() -> Selector {
        Selector::new(
            AddrSpec::Single(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            AddrSpec::Single(PEER),
        )
    }

    fn keys(fill: u8) -> ChildKeys {
        ChildKeys {
            inbound: SaKeys {
                encryption: Zeroizing::new(vec![fill; 16]),
                integrity: Zeroizing::new(vec![fill; 20]),
            },
            outbound: SaKeys {
                encryption: Zeroizing::new(vec![fill + 1; 16]),
                integrity: Zeroizing::new(vec![fill + 1; 20]),
            },
        }
    }

    fn esp() -> SecurityProtocol {
        SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha1_96),
        )
    }

    fn spd() -> SecurityPolicyDb {
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        spd.add_group("g").unwrap();
        spd.add_policy("g", Policy::apply(selector(), Flow::Dual, vec![esp()])).unwrap();
        spd
    }

    #[test]
    fn test_install_and_remove() {
        let mut spd = spd();
        let now = Instant::now();
        let installed = install_children(
            &mut spd,
            "g",
            1,
            &selector(),
            PEER,
            vec![ChildSaDescriptor {
                security: esp(),
                inbound_spi: 0x1000,
                outbound_spi: 0x2000,
                keys: keys(1),
            }],
            now,
        )
        .unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].destination, PEER);

        let local = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let inbound = spd
            .inbound_sa("g", 0x1000, IpsecProtocol::Esp, Some(local))
            .unwrap();
        assert_eq!(inbound.keys, keys(1).inbound);
        let outbound = spd.outbound_sa("g", installed[0].outbound_index).unwrap();
        assert_eq!(outbound.spi, 0x2000);
        assert_eq!(outbound.inbound_spi, Some(0x1000));

        assert_eq!(remove_children(&mut spd, &installed), 1);
        // already gone
        assert_eq!(remove_children(&mut spd, &installed), 0);
        assert!(spd.errors().is_empty());
    }

    #[test]
    fn test_bundle_rolls_back_on_failure() {
        let mut spd = spd();
        let now = Instant::now();
        let good = ChildSaDescriptor {
            security: esp(),
            inbound_spi: 0x1000,
            outbound_spi: 0x2000,
            keys: keys(1),
        };
        // duplicate inbound SPI makes the second pair fail
        let dup = ChildSaDescriptor {
            outbound_spi: 0x3000,
            ..good.clone()
        };
        let bundle = vec![good, dup];
        assert!(install_children(&mut spd, "g", 1, &selector(), PEER, bundle, now).is_err());
        assert!(!spd.has_sas_with_peer("g", PEER).unwrap());
    }

    #[test]
    fn test_allocate_spi_avoids_reserved_range() {
        let spd = spd();
        let p = DefaultProvider::new();
        for _ in 0..32 {
            assert!(allocate_spi(&p, &spd, "g", IpsecProtocol::Esp).unwrap() >= MIN_SPI);
        }
        assert!(allocate_spi(&p, &spd, "missing", IpsecProtocol::Esp).is_err());
    }

    #[test]
    fn test_tunnel_destination() {
        let gw = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
        let sec = esp().with_tunnel(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), gw);
        assert_eq!(outbound_destination(&sec, PEER), gw);
        assert_eq!(outbound_destination(&esp(), PEER), PEER);
    }
}
