//! Security policy database
//!
//! Policies live in named groups, each with its own SA database. The
//! database owns the timers for outbound bundle and SA lifetimes and
//! raises SA requests to the key manager when outbound traffic needs SAs
//! that do not exist yet.
//!
//! # Outbound lookup
//!
//! ```text
//! packet selector
//!   -> first policy (list order) covering the packet
//!      DISCARD -> Error::PacketDiscard
//!      BYPASS  -> OutboundMatch::Bypass
//!      APPLY   -> bundle for the request selector (created on miss)
//!                 -> cached SA index per security entry (fast path)
//!                 -> SADB lookup by packet selector (slow path)
//!                 -> missing SAs: SaRequest (rate limited), Error::NotFound
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use super::bundle::OutboundBundle;
use super::policy::{Direction, Flow, IpsecProtocol, Policy, PolicyAction, SecurityProtocol};
use super::sadb::{InboundSa, OutboundSa, RemovedPair, SaDatabase};
use super::selector::{NarrowResult, Selector};
use crate::config::IkeConfig;
use crate::error::{Error, ErrorCollector, Result};
use crate::logging;
use crate::timer::{CancelScope, TimerQueue};

/// Timer events owned by the policy database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpdEvent {
    /// Outbound bundle expired (subject: bundle id)
    BundleLifetime,
    /// SA should be re-keyed (subject: outbound SA index)
    SaSoftLifetime,
    /// SA must be deleted (subject: outbound SA index)
    SaHardLifetime,
}

/// Request for the key manager to negotiate missing SAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaRequest {
    /// Policy group
    pub group: String,
    /// Policy that needs the SAs
    pub policy_index: u32,
    /// Selector to negotiate (outbound view)
    pub selector: Selector,
    /// Security protocols negotiated together, innermost first
    pub security: Vec<SecurityProtocol>,
    /// Peer to negotiate with
    pub peer: Option<IpAddr>,
}

/// Successful outbound lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMatch {
    /// Send in clear
    Bypass,
    /// Protect with the listed outbound SAs, innermost first
    Protect {
        /// Matching policy
        policy_index: u32,
        /// Bundle that cached the SAs
        bundle_id: u64,
        /// Outbound SA indexes
        sa_indexes: Vec<u32>,
    },
}

/// SA lifetime notification produced by [`SecurityPolicyDb::process_timers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpdExpiry {
    /// Soft lifetime reached; the SA pair should be re-keyed
    SoftLifetime {
        /// Policy group
        group: String,
        /// Outbound SA index
        outbound_index: u32,
        /// Remote SPI
        outbound_spi: u32,
        /// Protocol
        protocol: IpsecProtocol,
        /// Peer address
        peer: IpAddr,
    },
    /// Hard lifetime reached; the SA pair was removed
    HardLifetime {
        /// Policy group
        group: String,
        /// What was removed
        removed: RemovedPair,
        /// Protocol
        protocol: IpsecProtocol,
        /// Peer address
        peer: IpAddr,
    },
}

/// Transport endpoint state caching a policy or bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    /// Group id
    pub group_id: u64,
    /// Cached policy
    pub policy_index: u32,
    /// Cached bundle
    pub bundle_id: Option<u64>,
}

/// Named set of policies with its own SA database
#[derive(Debug)]
pub struct PolicyGroup {
    name: String,
    id: u64,
    policies: Vec<Policy>,
    next_policy_index: u32,
    sadb: SaDatabase,
}

impl PolicyGroup {
    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group id (timer context)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Policies in match order
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// SA database
    pub fn sadb(&self) -> &SaDatabase {
        &self.sadb
    }

    fn policy_pos(&self, index: u32) -> Result<usize> {
        self.policies
            .iter()
            .position(|p| p.index == index)
            .ok_or_else(|| Error::NotFound(format!("policy {} in group {}", index, self.name)))
    }
}

/// Security policy database
#[derive(Debug)]
pub struct SecurityPolicyDb {
    groups: Vec<PolicyGroup>,
    timers: TimerQueue<SpdEvent>,
    endpoints: HashMap<u64, EndpointRef>,
    sa_requests: Option<UnboundedSender<SaRequest>>,
    sa_request_timeout: Duration,
    next_group_id: u64,
    next_bundle_id: u64,
    errors: ErrorCollector,
}

impl SecurityPolicyDb {
    /// Create an empty database
    pub fn new(sa_request_timeout: Duration) -> Self {
        SecurityPolicyDb {
            groups: Vec::new(),
            timers: TimerQueue::new(),
            endpoints: HashMap::new(),
            sa_requests: None,
            sa_request_timeout,
            next_group_id: 1,
            next_bundle_id: 1,
            errors: ErrorCollector::new(),
        }
    }

    /// Create an empty database using the engine configuration
    pub fn from_config(config: &IkeConfig) -> Self {
        Self::new(config.sa_request_timeout)
    }

    /// Deliver SA requests over `sender`
    pub fn set_sa_request_sender(&mut self, sender: UnboundedSender<SaRequest>) {
        self.sa_requests = Some(sender);
    }

    /// Share an error collector with the caller
    pub fn with_error_collector(mut self, errors: ErrorCollector) -> Self {
        self.errors = errors;
        self
    }

    /// Non-fatal failures recorded so far
    pub fn errors(&self) -> &ErrorCollector {
        &self.errors
    }

    fn group_pos(&self, name: &str) -> Result<usize> {
        self.groups
            .iter()
            .position(|g| g.name == name)
            .ok_or_else(|| Error::NotFound(format!("policy group {}", name)))
    }

    /// Add a policy group
    pub fn add_group(&mut self, name: impl Into<String>) -> Result<u64> {
        let name = name.into();
        if self.groups.iter().any(|g| g.name == name) {
            return Err(Error::InvalidParameter(format!(
                "Policy group {} already exists",
                name
            )));
        }
        let id = self.next_group_id;
        self.next_group_id += 1;
        self.groups.push(PolicyGroup {
            name,
            id,
            policies: Vec::new(),
            next_policy_index: 0,
            sadb: SaDatabase::new(),
        });
        Ok(id)
    }

    /// Remove a group with all its policies and SAs
    pub fn remove_group(&mut self, name: &str) -> Result<()> {
        let pos = self.group_pos(name)?;
        let indexes: Vec<u32> = self.groups[pos].policies.iter().map(|p| p.index).collect();
        for index in indexes {
            self.remove_policy(name, index)?;
        }

        let group = self.groups.remove(pos);
        for sa in group.sadb.outbound() {
            self.timers.cancel_subject(sa.index as u64, group.id);
        }
        Ok(())
    }

    /// Policy group by name
    pub fn group(&self, name: &str) -> Result<&PolicyGroup> {
        self.group_pos(name).map(|pos| &self.groups[pos])
    }

    /// Validate and append a policy, returning its index
    pub fn add_policy(&mut self, group: &str, mut policy: Policy) -> Result<u32> {
        policy.validate()?;
        let pos = self.group_pos(group)?;
        let group = &mut self.groups[pos];

        group.next_policy_index = group.next_policy_index.wrapping_add(1).max(1);
        policy.index = group.next_policy_index;
        policy.bundles.clear();
        let index = policy.index;
        group.policies.push(policy);
        Ok(index)
    }

    /// Remove a policy, its cached bundles, their timers and any endpoint
    /// state caching it
    pub fn remove_policy(&mut self, group: &str, index: u32) -> Result<Policy> {
        let gpos = self.group_pos(group)?;
        let ppos = self.groups[gpos].policy_pos(index)?;
        let group_id = self.groups[gpos].id;

        self.endpoints
            .retain(|_, e| !(e.group_id == group_id && e.policy_index == index));

        let mut policy = self.groups[gpos].policies.remove(ppos);
        for bundle in &policy.bundles {
            self.timers.cancel_matching(
                &SpdEvent::BundleLifetime,
                bundle.id,
                group_id,
                CancelScope::Exact,
            );
        }
        logging::log_policy_removed(index, policy.bundles.len());
        policy.bundles.clear();
        Ok(policy)
    }

    /// Policy by index
    pub fn policy(&self, group: &str, index: u32) -> Result<&Policy> {
        let group = self.group(group)?;
        group.policy_pos(index).map(|pos| &group.policies[pos])
    }

    /// First policy for `direction` covering `selector`
    pub fn policy_by_selector(
        &self,
        group: &str,
        selector: &Selector,
        direction: Direction,
    ) -> Result<&Policy> {
        self.group(group)?
            .policies
            .iter()
            .find(|p| {
                p.flow.includes(direction)
                    && p.selector.matches(selector, p.flow.swaps(direction))
            })
            .ok_or(Error::PolicyNotFound)
    }

    /// First protecting policy for `direction` whose selector is covered by
    /// the offered `traffic` selector
    pub fn policy_by_selector_narrow(
        &self,
        group: &str,
        traffic: &Selector,
        direction: Direction,
    ) -> Result<(&Policy, NarrowResult)> {
        self.group(group)?
            .policies
            .iter()
            .filter(|p| p.action == PolicyAction::Apply && p.flow.includes(direction))
            .find_map(|p| {
                p.selector
                    .matches_narrow(traffic, p.flow.swaps(direction))
                    .map(|narrow| (p, narrow))
            })
            .ok_or(Error::PolicyNotFound)
    }

    /// Check that `selector` is covered by policy `index`
    pub fn verify_policy(&self, group: &str, index: u32, selector: &Selector) -> Result<()> {
        let policy = self.policy(group, index)?;
        if policy.selector.matches(selector, false) {
            Ok(())
        } else {
            Err(Error::TsUnacceptable)
        }
    }

    /// Outbound policy lookup for a packet
    pub fn match_outbound(
        &mut self,
        group: &str,
        pkt: &Selector,
        now: Instant,
    ) -> Result<OutboundMatch> {
        let gpos = self.group_pos(group)?;
        let group_id = self.groups[gpos].id;
        let ppos = self.groups[gpos]
            .policies
            .iter()
            .position(|p| p.flow.includes(Direction::Outbound) && p.selector.matches(pkt, false))
            .ok_or(Error::PolicyNotFound)?;

        let policy = &self.groups[gpos].policies[ppos];
        match policy.action {
            PolicyAction::Discard => return Err(Error::PacketDiscard),
            PolicyAction::Bypass => return Ok(OutboundMatch::Bypass),
            PolicyAction::Apply => {}
        }

        let req = policy.security[0]
            .derivation
            .request_selector(&policy.selector, pkt);
        let bpos = match policy.bundle_index_by_selector(&req) {
            Some(bpos) => bpos,
            None => {
                let id = self.next_bundle_id;
                self.next_bundle_id += 1;
                let policy = &mut self.groups[gpos].policies[ppos];
                let bundle = OutboundBundle::new(id, pkt.clone(), policy.security.len());
                self.timers.schedule(
                    SpdEvent::BundleLifetime,
                    id,
                    group_id,
                    policy.bundle_lifetime,
                    now,
                );
                policy.bundles.insert(0, bundle);
                0
            }
        };

        self.resolve_bundle(gpos, ppos, bpos, pkt, now)
    }

    fn resolve_bundle(
        &mut self,
        gpos: usize,
        ppos: usize,
        bpos: usize,
        pkt: &Selector,
        now: Instant,
    ) -> Result<OutboundMatch> {
        let timeout = self.sa_request_timeout;
        let PolicyGroup {
            name,
            policies,
            sadb,
            ..
        } = &mut self.groups[gpos];
        let policy = &mut policies[ppos];
        let bundle = &mut policy.bundles[bpos];

        let mut missing = false;
        for (slot, security) in bundle.sa_indexes.iter_mut().zip(&policy.security) {
            if sadb.outbound_by_index(*slot).is_some() {
                continue;
            }
            match sadb.find_outbound(pkt, security) {
                Some(sa) => *slot = sa.index,
                None => {
                    *slot = 0;
                    missing = true;
                }
            }
        }

        if !missing {
            return Ok(OutboundMatch::Protect {
                policy_index: policy.index,
                bundle_id: bundle.id,
                sa_indexes: bundle.sa_indexes.clone(),
            });
        }

        if bundle.may_request(now) {
            let requests = sa_requests_for(
                name,
                &policy.selector,
                policy.flow,
                policy.index,
                &policy.security,
                &bundle.sa_indexes,
                pkt,
            );
            bundle.sa_request_deadline = Some(now + timeout);
            for request in requests {
                self.raise_sa_request(request);
            }
        }
        Err(Error::NotFound("outbound SA bundle incomplete".into()))
    }

    fn raise_sa_request(&self, request: SaRequest) {
        if let Some(protocol) = request.security.first().map(|s| s.protocol.ip_protocol()) {
            logging::log_sa_request(request.policy_index, protocol);
        }
        if let Some(sender) = &self.sa_requests {
            if sender.send(request).is_err() {
                self.errors.record(
                    "sa request",
                    Error::Internal("SA request receiver dropped".into()),
                );
            }
        }
    }

    /// Inbound policy lookup
    ///
    /// `applied` lists the protection of the SAs the packet was processed
    /// with, outermost first; it must mirror the policy's security list.
    pub fn match_inbound(
        &self,
        group: &str,
        pkt: &Selector,
        applied: &[SecurityProtocol],
    ) -> Result<&Policy> {
        let group = self.group(group)?;
        for policy in group.policies.iter().filter(|p| {
            p.flow.includes(Direction::Inbound)
                && p.selector.matches(pkt, p.flow.swaps(Direction::Inbound))
        }) {
            match policy.action {
                PolicyAction::Discard => return Err(Error::PacketDiscard),
                PolicyAction::Bypass => {
                    if applied.is_empty() {
                        return Ok(policy);
                    }
                }
                PolicyAction::Apply => {
                    let mirrored = applied.len() == policy.security.len()
                        && applied
                            .iter()
                            .zip(policy.security.iter().rev())
                            .all(|(sa, required)| sa.same_suite(required));
                    if mirrored {
                        return Ok(policy);
                    }
                    return Err(Error::PacketDiscard);
                }
            }
        }
        Err(Error::PolicyNotFound)
    }

    /// Install an inbound/outbound SA pair and its lifetime timers
    pub fn install_pair(
        &mut self,
        group: &str,
        inbound: InboundSa,
        outbound: OutboundSa,
        now: Instant,
    ) -> Result<u32> {
        let gpos = self.group_pos(group)?;
        let group_id = self.groups[gpos].id;
        let lifetime = outbound.security.lifetime;

        let index = self.groups[gpos].sadb.add_pair(inbound, outbound)?;
        self.timers.schedule(
            SpdEvent::SaSoftLifetime,
            index as u64,
            group_id,
            lifetime.soft,
            now,
        );
        self.timers.schedule(
            SpdEvent::SaHardLifetime,
            index as u64,
            group_id,
            lifetime.hard,
            now,
        );
        Ok(index)
    }

    fn forget_outbound(&mut self, gpos: usize, index: u32) {
        let group_id = self.groups[gpos].id;
        for event in [SpdEvent::SaSoftLifetime, SpdEvent::SaHardLifetime] {
            self.timers
                .cancel_matching(&event, index as u64, group_id, CancelScope::AllExtra);
        }
        for policy in &mut self.groups[gpos].policies {
            for bundle in &mut policy.bundles {
                bundle.forget_sa(index);
            }
        }
    }

    /// Remove the SA pair identified by its outbound `(remote SPI,
    /// protocol, destination)`, cancelling its lifetime timers
    pub fn remove_sa_pair(
        &mut self,
        group: &str,
        remote_spi: u32,
        protocol: IpsecProtocol,
        destination: IpAddr,
    ) -> Result<RemovedPair> {
        let gpos = self.group_pos(group)?;
        let removed = self.groups[gpos]
            .sadb
            .remove_pair(remote_spi, protocol, destination)?;
        self.forget_outbound(gpos, removed.outbound_index);
        Ok(removed)
    }

    /// Remove every SA shared with `peer`
    pub fn remove_sas_by_peer(&mut self, group: &str, peer: IpAddr) -> Result<usize> {
        let gpos = self.group_pos(group)?;
        let removed = self.groups[gpos].sadb.remove_by_peer(peer);
        for index in &removed {
            self.forget_outbound(gpos, *index);
        }
        Ok(removed.len())
    }

    /// Whether SAs with `peer` already exist
    pub fn has_sas_with_peer(&self, group: &str, peer: IpAddr) -> Result<bool> {
        Ok(self.group(group)?.sadb.has_sas_with_peer(peer))
    }

    /// Inbound SA lookup
    pub fn inbound_sa(
        &self,
        group: &str,
        spi: u32,
        protocol: IpsecProtocol,
        destination: Option<IpAddr>,
    ) -> Result<&InboundSa> {
        self.group(group)?
            .sadb
            .get_inbound(spi, protocol, destination)
            .ok_or_else(|| Error::SaNotFound(format!("inbound 0x{:08x}", spi)))
    }

    /// Outbound SA by index
    pub fn outbound_sa(&self, group: &str, index: u32) -> Result<&OutboundSa> {
        self.group(group)?
            .sadb
            .outbound_by_index(index)
            .ok_or_else(|| Error::SaNotFound(format!("outbound index {}", index)))
    }

    /// Re-index outbound SAs after a selector change
    pub fn rehash_outbound(
        &mut self,
        group: &str,
        selector: &Selector,
        security: &SecurityProtocol,
    ) -> Result<usize> {
        let gpos = self.group_pos(group)?;
        let group_id = self.groups[gpos].id;
        let changes = self.groups[gpos].sadb.rehash_outbound(selector, security)?;
        for (old, new) in &changes {
            self.timers.move_subject(*old as u64, *new as u64, group_id);
            for policy in &mut self.groups[gpos].policies {
                for bundle in &mut policy.bundles {
                    bundle.forget_sa(*old);
                }
            }
        }
        Ok(changes.len())
    }

    /// Record that transport endpoint `endpoint` caches a policy/bundle
    pub fn cache_endpoint(
        &mut self,
        endpoint: u64,
        group: &str,
        policy_index: u32,
        bundle_id: Option<u64>,
    ) -> Result<()> {
        let group_id = self.group(group)?.id;
        self.policy(group, policy_index)?;
        self.endpoints.insert(
            endpoint,
            EndpointRef {
                group_id,
                policy_index,
                bundle_id,
            },
        );
        Ok(())
    }

    /// Cached state of a transport endpoint, if still valid
    pub fn endpoint(&self, endpoint: u64) -> Option<EndpointRef> {
        self.endpoints.get(&endpoint).copied()
    }

    /// Forget a transport endpoint
    pub fn release_endpoint(&mut self, endpoint: u64) {
        self.endpoints.remove(&endpoint);
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire due timers
    ///
    /// Expired bundles are dropped, hard-expired SA pairs are removed, and
    /// lifetime notifications are returned for the key manager.
    pub fn process_timers(&mut self, now: Instant) -> Vec<SpdExpiry> {
        let mut expiries = Vec::new();
        for entry in self.timers.pop_due(now) {
            let Some(gpos) = self.groups.iter().position(|g| g.id == entry.context) else {
                continue;
            };
            match entry.event {
                SpdEvent::BundleLifetime => {
                    logging::log_timer_event("bundle_lifetime", entry.subject);
                    for policy in &mut self.groups[gpos].policies {
                        policy.bundles.retain(|b| b.id != entry.subject);
                    }
                    self.endpoints
                        .retain(|_, e| e.bundle_id != Some(entry.subject));
                }
                SpdEvent::SaSoftLifetime => {
                    logging::log_timer_event("sa_soft_lifetime", entry.subject);
                    let group = &self.groups[gpos];
                    if let Some(sa) = group.sadb.outbound_by_index(entry.subject as u32) {
                        expiries.push(SpdExpiry::SoftLifetime {
                            group: group.name.clone(),
                            outbound_index: sa.index,
                            outbound_spi: sa.spi,
                            protocol: sa.protocol(),
                            peer: sa.peer,
                        });
                    }
                }
                SpdEvent::SaHardLifetime => {
                    logging::log_timer_event("sa_hard_lifetime", entry.subject);
                    let group = &self.groups[gpos];
                    let Some(sa) = group.sadb.outbound_by_index(entry.subject as u32) else {
                        continue;
                    };
                    let (spi, protocol, peer, destination) =
                        (sa.spi, sa.protocol(), sa.peer, sa.destination());
                    let group_name = group.name.clone();
                    let Some(destination) = destination else {
                        continue;
                    };
                    match self.remove_sa_pair(&group_name, spi, protocol, destination) {
                        Ok(removed) => {
                            logging::log_child_sa_deleted(spi, "lifetime");
                            expiries.push(SpdExpiry::HardLifetime {
                                group: group_name,
                                removed,
                                protocol,
                                peer,
                            });
                        }
                        Err(e) => self.errors.record("sa hard lifetime", e),
                    }
                }
            }
        }
        expiries
    }
}

/// Build the SA requests for every unresolved security entry
///
/// An entry is negotiated together with the transport entries that
/// follow it, up to the next tunnel entry.
fn sa_requests_for(
    group: &str,
    policy_selector: &Selector,
    flow: Flow,
    policy_index: u32,
    security: &[SecurityProtocol],
    sa_indexes: &[u32],
    pkt: &Selector,
) -> Vec<SaRequest> {
    let selector = if flow.includes(Direction::Outbound) {
        policy_selector.clone()
    } else {
        policy_selector.switched()
    };

    let mut requests = Vec::new();
    let mut i = 0;
    while i < security.len() {
        if sa_indexes[i] != 0 {
            i += 1;
            continue;
        }
        let mut end = i + 1;
        while end < security.len() && !security[end].mode.is_tunnel() {
            end += 1;
        }
        let suite = &security[i..end];
        let peer = suite
            .iter()
            .rev()
            .find_map(|s| match s.mode {
                super::policy::SecurityMode::Tunnel { destination, .. } => Some(destination),
                super::policy::SecurityMode::Transport => None,
            })
            .or_else(|| pkt.destination.first_addr());

        requests.push(SaRequest {
            group: group.to_string(),
            policy_index,
            selector: selector.clone(),
            security: suite.to_vec(),
            peer,
        });
        i = end;
    }
    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Lifetime;
    use crate::crypto::{EncryptionAlgorithm, IntegrityAlgorithm};
    use crate::spd::sadb::SaKeys;
    use crate::spd::selector::{AddrSpec, PROTO_TCP, PROTO_UDP};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn lan() -> AddrSpec {
        AddrSpec::Subnet {
            addr: v4(10, 0, 0, 0),
            prefix_len: 24,
        }
    }

    fn remote_lan() -> AddrSpec {
        AddrSpec::Subnet {
            addr: v4(10, 0, 1, 0),
            prefix_len: 24,
        }
    }

    fn esp() -> SecurityProtocol {
        SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha256_128),
        )
    }

    fn db_with_group() -> SecurityPolicyDb {
        let mut db = SecurityPolicyDb::new(Duration::from_secs(2));
        db.add_group("default").unwrap();
        db
    }

    fn sa_pair(
        local_spi: u32,
        remote_spi: u32,
        selector: Selector,
        peer: IpAddr,
    ) -> (InboundSa, OutboundSa) {
        let now = Instant::now();
        (
            InboundSa {
                spi: local_spi,
                security: esp(),
                selector: selector.switched(),
                keys: SaKeys::default(),
                peer,
                created: now,
            },
            OutboundSa {
                index: 0,
                spi: remote_spi,
                inbound_spi: None,
                security: esp(),
                selector,
                keys: SaKeys::default(),
                peer,
                created: now,
            },
        )
    }

    #[test]
    fn test_groups() {
        let mut db = db_with_group();
        assert!(db.add_group("default").is_err());
        db.add_group("other").unwrap();
        db.remove_group("other").unwrap();
        assert!(db.group("other").is_err());
    }

    #[test]
    fn test_policy_indices_and_lookup() {
        let mut db = db_with_group();
        let udp = Selector::new(lan(), remote_lan()).with_protocol(PROTO_UDP);
        let first = db
            .add_policy("default", Policy::bypass(udp, Flow::Dual))
            .unwrap();
        let second = db
            .add_policy("default", Policy::discard(Selector::any(), Flow::Dual))
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(db.policy("default", 2).unwrap().action, PolicyAction::Discard);

        let udp = Selector::packet(v4(10, 0, 0, 1), v4(10, 0, 1, 1), PROTO_UDP, 1, 2);
        assert_eq!(
            db.policy_by_selector("default", &udp, Direction::Outbound).unwrap().index,
            1
        );
        let tcp = Selector::packet(v4(10, 0, 0, 1), v4(10, 0, 1, 1), PROTO_TCP, 1, 2);
        assert_eq!(
            db.policy_by_selector("default", &tcp, Direction::Outbound).unwrap().index,
            2
        );

        // Dual flow policy matches inbound replies with roles swapped
        let reply = Selector::packet(v4(10, 0, 1, 1), v4(10, 0, 0, 1), PROTO_UDP, 2, 1);
        assert_eq!(
            db.policy_by_selector("default", &reply, Direction::Inbound).unwrap().index,
            1
        );
    }

    #[test]
    fn test_add_policy_rejects_invalid() {
        let mut db = db_with_group();
        let bad = Policy::apply(Selector::any().with_protocol(99), Flow::Dual, vec![esp()]);
        assert!(db.add_policy("default", bad).is_err());
        assert!(db
            .add_policy("missing", Policy::bypass(Selector::any(), Flow::Dual))
            .is_err());
    }

    #[test]
    fn test_match_outbound_actions() {
        let mut db = db_with_group();
        let to_remote = Selector::new(AddrSpec::Any, remote_lan());
        db.add_policy("default", Policy::discard(to_remote, Flow::Outbound))
            .unwrap();
        db.add_policy("default", Policy::bypass(Selector::any(), Flow::Outbound))
            .unwrap();
        let now = Instant::now();

        let dropped = Selector::packet(v4(10, 0, 0, 1), v4(10, 0, 1, 1), PROTO_TCP, 1, 2);
        assert_eq!(
            db.match_outbound("default", &dropped, now),
            Err(Error::PacketDiscard)
        );
        let clear = Selector::packet(v4(10, 0, 0, 1), v4(192, 0, 2, 1), PROTO_TCP, 1, 2);
        assert_eq!(
            db.match_outbound("default", &clear, now),
            Ok(OutboundMatch::Bypass)
        );
    }

    #[test]
    fn test_match_outbound_raises_rate_limited_request() {
        let mut db = db_with_group();
        let (tx, mut rx) = mpsc::unbounded_channel();
        db.set_sa_request_sender(tx);
        let policy = db
            .add_policy(
                "default",
                Policy::apply(Selector::new(lan(), remote_lan()), Flow::Dual, vec![esp()]),
            )
            .unwrap();

        let now = Instant::now();
        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 5), PROTO_TCP, 1000, 22);
        assert!(matches!(
            db.match_outbound("default", &pkt, now),
            Err(Error::NotFound(_))
        ));
        let request = rx.try_recv().unwrap();
        assert_eq!(request.policy_index, policy);
        assert_eq!(request.selector, Selector::new(lan(), remote_lan()));
        assert_eq!(request.peer, Some(v4(10, 0, 1, 5)));

        // Within the retry timeout no new request is raised
        assert!(db.match_outbound("default", &pkt, now + Duration::from_secs(1)).is_err());
        assert!(rx.try_recv().is_err());

        assert!(db.match_outbound("default", &pkt, now + Duration::from_secs(2)).is_err());
        assert!(rx.try_recv().is_ok());

        // One bundle per distinct request selector
        assert_eq!(db.policy("default", policy).unwrap().bundles().len(), 1);
    }

    #[test]
    fn test_match_outbound_slow_then_fast_path() {
        let mut db = db_with_group();
        let sel = Selector::new(lan(), remote_lan());
        db.add_policy("default", Policy::apply(sel.clone(), Flow::Dual, vec![esp()]))
            .unwrap();
        let peer = v4(10, 0, 1, 1);
        let (inbound, outbound) = sa_pair(0x100, 0x200, sel, peer);
        let now = Instant::now();
        let index = db.install_pair("default", inbound, outbound, now).unwrap();

        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 5), PROTO_TCP, 1000, 22);
        let first = db.match_outbound("default", &pkt, now).unwrap();
        match &first {
            OutboundMatch::Protect { sa_indexes, .. } => assert_eq!(sa_indexes, &vec![index]),
            other => panic!("unexpected {:?}", other),
        }
        // Cached bundle answers the second lookup
        assert_eq!(db.match_outbound("default", &pkt, now).unwrap(), first);
    }

    #[test]
    fn test_match_inbound_reverse_order() {
        let mut db = db_with_group();
        let ah = SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96);
        db.add_policy(
            "default",
            Policy::apply(Selector::new(lan(), remote_lan()), Flow::Dual, vec![esp(), ah.clone()]),
        )
        .unwrap();

        let pkt = Selector::packet(v4(10, 0, 1, 5), v4(10, 0, 0, 5), PROTO_TCP, 22, 1000);
        // Outermost (AH) was processed first
        assert!(db.match_inbound("default", &pkt, &[ah.clone(), esp()]).is_ok());
        assert_eq!(
            db.match_inbound("default", &pkt, &[esp(), ah]).unwrap_err(),
            Error::PacketDiscard
        );
        assert_eq!(
            db.match_inbound("default", &pkt, &[]).unwrap_err(),
            Error::PacketDiscard
        );

        let unrelated = Selector::packet(v4(192, 0, 2, 1), v4(10, 0, 0, 5), PROTO_TCP, 22, 1000);
        assert_eq!(
            db.match_inbound("default", &unrelated, &[]).unwrap_err(),
            Error::PolicyNotFound
        );
    }

    #[test]
    fn test_narrow_lookup() {
        let mut db = db_with_group();
        let index = db
            .add_policy(
                "default",
                Policy::apply(
                    Selector::new(lan(), remote_lan()).with_protocol(PROTO_TCP),
                    Flow::Dual,
                    vec![esp()],
                ),
            )
            .unwrap();

        let offered = Selector::new(
            AddrSpec::Subnet {
                addr: v4(10, 0, 0, 0),
                prefix_len: 16,
            },
            AddrSpec::Any,
        );
        let (policy, narrow) = db
            .policy_by_selector_narrow("default", &offered, Direction::Outbound)
            .unwrap();
        assert_eq!(policy.index, index);
        assert_eq!(narrow.narrowed_protocol, Some(PROTO_TCP));

        let too_small = Selector::new(AddrSpec::Single(v4(10, 0, 0, 1)), AddrSpec::Any);
        assert_eq!(
            db.policy_by_selector_narrow("default", &too_small, Direction::Outbound)
                .unwrap_err(),
            Error::PolicyNotFound
        );
    }

    #[test]
    fn test_remove_policy_clears_bundles_and_endpoints() {
        let mut db = db_with_group();
        let index = db
            .add_policy(
                "default",
                Policy::apply(Selector::new(lan(), remote_lan()), Flow::Dual, vec![esp()]),
            )
            .unwrap();
        let now = Instant::now();
        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 5), PROTO_TCP, 1000, 22);
        let _ = db.match_outbound("default", &pkt, now);
        assert!(db.next_deadline().is_some());

        db.cache_endpoint(42, "default", index, None).unwrap();
        let removed = db.remove_policy("default", index).unwrap();
        assert!(removed.bundles().is_empty());
        assert!(db.endpoint(42).is_none());
        assert!(db.next_deadline().is_none());
        assert!(db.policy("default", index).is_err());
    }

    #[test]
    fn test_bundle_lifetime_expiry() {
        let mut db = db_with_group();
        let index = db
            .add_policy(
                "default",
                Policy::apply(Selector::new(lan(), remote_lan()), Flow::Dual, vec![esp()])
                    .with_bundle_lifetime(Duration::from_secs(10)),
            )
            .unwrap();
        let now = Instant::now();
        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 5), PROTO_TCP, 1000, 22);
        let _ = db.match_outbound("default", &pkt, now);
        assert_eq!(db.policy("default", index).unwrap().bundles().len(), 1);

        assert!(db.process_timers(now + Duration::from_secs(10)).is_empty());
        assert!(db.policy("default", index).unwrap().bundles().is_empty());
    }

    #[test]
    fn test_sa_lifetimes() {
        let mut db = db_with_group();
        let peer = v4(10, 0, 1, 1);
        let (inbound, mut outbound) =
            sa_pair(0x100, 0x200, Selector::new(lan(), remote_lan()), peer);
        let lifetime = Lifetime::new(Duration::from_secs(30), Duration::from_secs(60)).unwrap();
        outbound.security = outbound.security.with_lifetime(lifetime);
        let now = Instant::now();
        let index = db.install_pair("default", inbound, outbound, now).unwrap();

        let soft = db.process_timers(now + Duration::from_secs(30));
        assert_eq!(
            soft,
            vec![SpdExpiry::SoftLifetime {
                group: "default".into(),
                outbound_index: index,
                outbound_spi: 0x200,
                protocol: IpsecProtocol::Esp,
                peer,
            }]
        );

        let hard = db.process_timers(now + Duration::from_secs(60));
        assert!(matches!(hard[0], SpdExpiry::HardLifetime { .. }));
        assert!(db.group("default").unwrap().sadb().outbound().is_empty());
        assert!(db.group("default").unwrap().sadb().inbound().is_empty());
    }

    #[test]
    fn test_remove_sa_pair_cancels_timers() {
        let mut db = db_with_group();
        let peer = v4(10, 0, 1, 1);
        let (inbound, outbound) = sa_pair(0x100, 0x200, Selector::new(lan(), remote_lan()), peer);
        let now = Instant::now();
        db.install_pair("default", inbound, outbound, now).unwrap();

        let removed = db
            .remove_sa_pair("default", 0x200, IpsecProtocol::Esp, peer)
            .unwrap();
        assert_eq!(removed.inbound_spi, Some(0x100));
        assert!(db.next_deadline().is_none());
        assert!(db
            .remove_sa_pair("default", 0x200, IpsecProtocol::Esp, peer)
            .is_err());
    }

    #[test]
    fn test_rehash_moves_timers() {
        let mut db = db_with_group();
        let peer = v4(10, 0, 1, 1);
        let sel = Selector::new(lan(), remote_lan());
        let (inbound, outbound) = sa_pair(0x100, 0x200, sel.clone(), peer);
        let now = Instant::now();
        let old = db.install_pair("default", inbound, outbound, now).unwrap();

        assert_eq!(db.rehash_outbound("default", &sel, &esp()).unwrap(), 1);
        assert!(db.outbound_sa("default", old).is_err());

        let hard = db.process_timers(now + Duration::from_secs(3600));
        assert!(hard
            .iter()
            .any(|e| matches!(e, SpdExpiry::HardLifetime { .. })));
    }

    #[test]
    fn test_sa_requests_split_by_tunnel() {
        let transport = esp();
        let tunnel = SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96)
            .with_tunnel(v4(1, 1, 1, 1), v4(2, 2, 2, 2));
        let pkt = Selector::packet(v4(10, 0, 0, 5), v4(10, 0, 1, 5), PROTO_TCP, 1, 2);

        let requests = sa_requests_for(
            "g",
            &Selector::any(),
            Flow::Dual,
            1,
            &[transport.clone(), tunnel.clone()],
            &[0, 0],
            &pkt,
        );
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].security, vec![transport.clone()]);
        assert_eq!(requests[0].peer, Some(v4(10, 0, 1, 5)));
        assert_eq!(requests[1].peer, Some(v4(2, 2, 2, 2)));

        let combined = sa_requests_for(
            "g",
            &Selector::any(),
            Flow::Inbound,
            1,
            &[transport.clone(), transport],
            &[0, 0],
            &pkt,
        );
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].security.len(), 2);
    }
}
