//! Security association database
//!
//! Inbound SAs are kept sorted by SPI and looked up by
//! `(SPI, protocol, destination)`. Outbound SAs are kept newest first and
//! identified by a non-zero index that outbound bundles cache.
//!
//! The destination of an SA is the remote tunnel endpoint in tunnel mode.
//! In transport mode it is the peer for outbound SAs and the first
//! destination address of the selector for inbound SAs.

use std::fmt;
use std::net::IpAddr;

use tokio::time::Instant;
use zeroize::Zeroizing;

use super::policy::{IpsecProtocol, SecurityMode, SecurityProtocol};
use super::selector::Selector;
use crate::error::{Error, Result};

/// Key material of one unidirectional SA
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SaKeys {
    /// Encryption key (including any AEAD salt)
    pub encryption: Zeroizing<Vec<u8>>,
    /// Integrity key
    pub integrity: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaKeys")
            .field("encryption_len", &self.encryption.len())
            .field("integrity_len", &self.integrity.len())
            .finish()
    }
}

/// Inbound SA
#[derive(Debug, Clone)]
pub struct InboundSa {
    /// Local SPI
    pub spi: u32,
    /// Negotiated protection (mode endpoints seen from the sender)
    pub security: SecurityProtocol,
    /// Traffic selector for received traffic
    pub selector: Selector,
    /// Keys
    pub keys: SaKeys,
    /// Peer address
    pub peer: IpAddr,
    /// Installation time
    pub created: Instant,
}

impl InboundSa {
    /// Protocol
    pub fn protocol(&self) -> IpsecProtocol {
        self.security.protocol
    }

    /// Destination address used for lookups
    pub fn destination(&self) -> Option<IpAddr> {
        match self.security.mode {
            SecurityMode::Tunnel { destination, .. } => Some(destination),
            SecurityMode::Transport => self.selector.destination.first_addr(),
        }
    }
}

/// Outbound SA
#[derive(Debug, Clone)]
pub struct OutboundSa {
    /// Database index (assigned on insertion, never 0)
    pub index: u32,
    /// Remote SPI
    pub spi: u32,
    /// SPI of the paired inbound SA
    pub inbound_spi: Option<u32>,
    /// Negotiated protection
    pub security: SecurityProtocol,
    /// Traffic selector for sent traffic
    pub selector: Selector,
    /// Keys
    pub keys: SaKeys,
    /// Peer address
    pub peer: IpAddr,
    /// Installation time
    pub created: Instant,
}

impl OutboundSa {
    /// Protocol
    pub fn protocol(&self) -> IpsecProtocol {
        self.security.protocol
    }

    /// Destination address used for lookups
    pub fn destination(&self) -> Option<IpAddr> {
        match self.security.mode {
            SecurityMode::Tunnel { destination, .. } => Some(destination),
            SecurityMode::Transport => Some(self.peer),
        }
    }
}

/// What [`SaDatabase::remove_pair`] removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedPair {
    /// Index of the removed outbound SA
    pub outbound_index: u32,
    /// Remote SPI of the removed outbound SA
    pub outbound_spi: u32,
    /// SPI of the removed inbound SA, if one was paired
    pub inbound_spi: Option<u32>,
}

/// Inbound and outbound SA tables
#[derive(Debug, Default)]
pub struct SaDatabase {
    inbound: Vec<InboundSa>,
    outbound: Vec<OutboundSa>,
    next_index: u32,
}

impl SaDatabase {
    /// Create empty database
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_index(&mut self) -> u32 {
        loop {
            self.next_index = self.next_index.wrapping_add(1);
            let candidate = self.next_index;
            if candidate != 0 && !self.outbound.iter().any(|sa| sa.index == candidate) {
                return candidate;
            }
        }
    }

    fn check_inbound_unique(&self, sa: &InboundSa) -> Result<()> {
        if self
            .get_inbound(sa.spi, sa.protocol(), sa.destination())
            .is_some()
        {
            return Err(Error::InvalidParameter(format!(
                "Inbound SA 0x{:08x} already installed",
                sa.spi
            )));
        }
        Ok(())
    }

    /// Insert an inbound SA, keeping SPI order
    pub fn add_inbound(&mut self, sa: InboundSa) -> Result<()> {
        sa.security.validate()?;
        self.check_inbound_unique(&sa)?;
        let pos = self.inbound.partition_point(|existing| existing.spi <= sa.spi);
        self.inbound.insert(pos, sa);
        Ok(())
    }

    /// Insert an outbound SA and return its index
    pub fn add_outbound(&mut self, mut sa: OutboundSa) -> Result<u32> {
        sa.security.validate()?;
        sa.index = self.allocate_index();
        let index = sa.index;
        self.outbound.insert(0, sa);
        Ok(index)
    }

    /// Insert an inbound/outbound pair; neither is inserted on failure
    pub fn add_pair(&mut self, inbound: InboundSa, mut outbound: OutboundSa) -> Result<u32> {
        inbound.security.validate()?;
        outbound.security.validate()?;
        self.check_inbound_unique(&inbound)?;

        outbound.inbound_spi = Some(inbound.spi);
        let index = self.add_outbound(outbound)?;
        self.add_inbound(inbound)?;
        Ok(index)
    }

    /// Find an inbound SA
    ///
    /// `destination` None matches SAs without a concrete destination.
    pub fn get_inbound(
        &self,
        spi: u32,
        protocol: IpsecProtocol,
        destination: Option<IpAddr>,
    ) -> Option<&InboundSa> {
        let start = self.inbound.partition_point(|sa| sa.spi < spi);
        self.inbound[start..]
            .iter()
            .take_while(|sa| sa.spi == spi)
            .find(|sa| sa.protocol() == protocol && sa.destination() == destination)
    }

    /// Outbound SA by index
    pub fn outbound_by_index(&self, index: u32) -> Option<&OutboundSa> {
        if index == 0 {
            return None;
        }
        self.outbound.iter().find(|sa| sa.index == index)
    }

    /// Newest outbound SA covering `pkt` with the given protection
    pub fn find_outbound(
        &self,
        pkt: &Selector,
        security: &SecurityProtocol,
    ) -> Option<&OutboundSa> {
        self.outbound
            .iter()
            .find(|sa| sa.selector.matches(pkt, false) && sa.security.same_suite(security))
    }

    /// Remove an inbound SA
    pub fn remove_inbound(
        &mut self,
        spi: u32,
        protocol: IpsecProtocol,
        destination: Option<IpAddr>,
    ) -> Result<InboundSa> {
        let pos = self
            .inbound
            .iter()
            .position(|sa| {
                sa.spi == spi && sa.protocol() == protocol && sa.destination() == destination
            })
            .ok_or_else(|| Error::SaNotFound(format!("inbound 0x{:08x}", spi)))?;
        Ok(self.inbound.remove(pos))
    }

    /// Remove an outbound SA by index
    pub fn remove_outbound(&mut self, index: u32) -> Result<OutboundSa> {
        let pos = self
            .outbound
            .iter()
            .position(|sa| sa.index == index)
            .ok_or_else(|| Error::SaNotFound(format!("outbound index {}", index)))?;
        Ok(self.outbound.remove(pos))
    }

    /// Remove the outbound SA `(remote_spi, protocol, destination)` and its
    /// paired inbound SA
    pub fn remove_pair(
        &mut self,
        remote_spi: u32,
        protocol: IpsecProtocol,
        destination: IpAddr,
    ) -> Result<RemovedPair> {
        let pos = self
            .outbound
            .iter()
            .position(|sa| {
                sa.spi == remote_spi
                    && sa.protocol() == protocol
                    && sa.destination() == Some(destination)
            })
            .ok_or_else(|| Error::SaNotFound(format!("outbound 0x{:08x}", remote_spi)))?;
        let outbound = self.outbound.remove(pos);

        let mut inbound_spi = None;
        if let Some(spi) = outbound.inbound_spi {
            if let Some(pos) = self
                .inbound
                .iter()
                .position(|sa| {
                    sa.spi == spi && sa.protocol() == protocol && sa.peer == outbound.peer
                })
            {
                self.inbound.remove(pos);
                inbound_spi = Some(spi);
            }
        }

        Ok(RemovedPair {
            outbound_index: outbound.index,
            outbound_spi: outbound.spi,
            inbound_spi,
        })
    }

    /// Remove every SA shared with `peer`
    ///
    /// Returns the indexes of removed outbound SAs.
    pub fn remove_by_peer(&mut self, peer: IpAddr) -> Vec<u32> {
        let removed = self
            .outbound
            .iter()
            .filter(|sa| sa.peer == peer)
            .map(|sa| sa.index)
            .collect();
        self.outbound.retain(|sa| sa.peer != peer);
        self.inbound.retain(|sa| sa.peer != peer);
        removed
    }

    /// Whether any SA is shared with `peer`
    pub fn has_sas_with_peer(&self, peer: IpAddr) -> bool {
        self.outbound.iter().any(|sa| sa.peer == peer)
            || self.inbound.iter().any(|sa| sa.peer == peer)
    }

    /// Assign fresh indexes to every outbound SA covering `selector` with
    /// the given protection, so cached bundle entries stop resolving
    ///
    /// Returns `(old, new)` index pairs.
    pub fn rehash_outbound(
        &mut self,
        selector: &Selector,
        security: &SecurityProtocol,
    ) -> Result<Vec<(u32, u32)>> {
        let targets: Vec<usize> = self
            .outbound
            .iter()
            .enumerate()
            .filter(|(_, sa)| {
                sa.selector.matches(selector, false) && sa.security.same_suite(security)
            })
            .map(|(pos, _)| pos)
            .collect();
        if targets.is_empty() {
            return Err(Error::NotFound("no outbound SA to rehash".into()));
        }

        let mut changes = Vec::with_capacity(targets.len());
        for pos in targets {
            let new_index = self.allocate_index();
            let old_index = std::mem::replace(&mut self.outbound[pos].index, new_index);
            changes.push((old_index, new_index));
        }
        Ok(changes)
    }

    /// All inbound SAs in SPI order
    pub fn inbound(&self) -> &[InboundSa] {
        &self.inbound
    }

    /// All outbound SAs, newest first
    pub fn outbound(&self) -> &[OutboundSa] {
        &self.outbound
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionAlgorithm, IntegrityAlgorithm};
    use crate::spd::selector::AddrSpec;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn esp() -> SecurityProtocol {
        SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha1_96),
        )
    }

    fn pair(local_spi: u32, remote_spi: u32, peer: IpAddr) -> (InboundSa, OutboundSa) {
        let local = v4(10, 0, 0, 1);
        let out_sel = Selector::new(AddrSpec::Single(local), AddrSpec::Single(peer));
        let now = Instant::now();
        (
            InboundSa {
                spi: local_spi,
                security: esp(),
                selector: out_sel.switched(),
                keys: SaKeys::default(),
                peer,
                created: now,
            },
            OutboundSa {
                index: 0,
                spi: remote_spi,
                inbound_spi: None,
                security: esp(),
                selector: out_sel,
                keys: SaKeys::default(),
                peer,
                created: now,
            },
        )
    }

    #[test]
    fn test_inbound_sorted_lookup() {
        let mut db = SaDatabase::new();
        let peer = v4(10, 0, 0, 2);
        for spi in [0x300, 0x100, 0x200] {
            let (inbound, _) = pair(spi, spi + 1, peer);
            db.add_inbound(inbound).unwrap();
        }
        let spis: Vec<u32> = db.inbound().iter().map(|sa| sa.spi).collect();
        assert_eq!(spis, vec![0x100, 0x200, 0x300]);

        let local = Some(v4(10, 0, 0, 1));
        assert!(db.get_inbound(0x200, IpsecProtocol::Esp, local).is_some());
        assert!(db.get_inbound(0x200, IpsecProtocol::Ah, local).is_none());
        assert!(db.get_inbound(0x200, IpsecProtocol::Esp, Some(peer)).is_none());

        // Duplicate (SPI, protocol, destination) is rejected
        let (dup, _) = pair(0x200, 0x999, peer);
        assert!(db.add_inbound(dup).is_err());
    }

    #[test]
    fn test_outbound_newest_first_and_index() {
        let mut db = SaDatabase::new();
        let peer = v4(10, 0, 0, 2);
        let (_, first) = pair(1, 0x10, peer);
        let (_, second) = pair(2, 0x20, peer);
        let i1 = db.add_outbound(first).unwrap();
        let i2 = db.add_outbound(second).unwrap();
        assert_ne!(i1, 0);
        assert_ne!(i1, i2);
        assert_eq!(db.outbound()[0].spi, 0x20);

        let pkt = Selector::packet(v4(10, 0, 0, 1), peer, 6, 1, 2);
        // Newest matching SA wins
        assert_eq!(db.find_outbound(&pkt, &esp()).unwrap().index, i2);
        assert!(db
            .find_outbound(&pkt, &SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96))
            .is_none());
        assert!(db.outbound_by_index(0).is_none());
    }

    #[test]
    fn test_remove_pair() {
        let mut db = SaDatabase::new();
        let peer = v4(10, 0, 0, 2);
        let (inbound, outbound) = pair(0x1000, 0x2000, peer);
        let index = db.add_pair(inbound, outbound).unwrap();

        let removed = db.remove_pair(0x2000, IpsecProtocol::Esp, peer).unwrap();
        assert_eq!(removed.outbound_index, index);
        assert_eq!(removed.inbound_spi, Some(0x1000));
        assert!(db.inbound().is_empty());
        assert!(db.outbound().is_empty());

        // Second removal reports the miss
        assert!(matches!(
            db.remove_pair(0x2000, IpsecProtocol::Esp, peer),
            Err(Error::SaNotFound(_))
        ));
    }

    #[test]
    fn test_add_pair_is_atomic() {
        let mut db = SaDatabase::new();
        let peer = v4(10, 0, 0, 2);
        let (inbound, outbound) = pair(0x1000, 0x2000, peer);
        db.add_pair(inbound, outbound).unwrap();

        let (dup_in, dup_out) = pair(0x1000, 0x3000, peer);
        assert!(db.add_pair(dup_in, dup_out).is_err());
        assert_eq!(db.outbound().len(), 1);
        assert_eq!(db.inbound().len(), 1);
    }

    #[test]
    fn test_remove_by_peer() {
        let mut db = SaDatabase::new();
        let a = v4(10, 0, 0, 2);
        let b = v4(10, 0, 0, 3);
        let (in_a, out_a) = pair(1, 2, a);
        let (in_b, out_b) = pair(3, 4, b);
        db.add_pair(in_a, out_a).unwrap();
        db.add_pair(in_b, out_b).unwrap();

        assert!(db.has_sas_with_peer(a));
        assert_eq!(db.remove_by_peer(a).len(), 1);
        assert!(!db.has_sas_with_peer(a));
        assert!(db.has_sas_with_peer(b));
    }

    #[test]
    fn test_rehash_outbound() {
        let mut db = SaDatabase::new();
        let peer = v4(10, 0, 0, 2);
        let (_, outbound) = pair(1, 2, peer);
        let index = db.add_outbound(outbound).unwrap();

        let sel = Selector::packet(v4(10, 0, 0, 1), peer, 0, 0, 0);
        let changes = db.rehash_outbound(&sel, &esp()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, index);
        assert!(db.outbound_by_index(index).is_none());
        assert!(db.outbound_by_index(changes[0].1).is_some());

        let other = Selector::packet(v4(10, 9, 9, 9), peer, 0, 0, 0);
        assert!(matches!(
            db.rehash_outbound(&other, &esp()),
            Err(Error::NotFound(_))
        ));
    }
}
