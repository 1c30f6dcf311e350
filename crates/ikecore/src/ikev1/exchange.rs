//! IKEv1 exchange engine
//!
//! Phase 1 (RFC 2409 Section 5):
//!
//! ```text
//! Main Mode                              Aggressive Mode
//! HDR, SA              -->               HDR, SA, KE, Ni, IDii  -->
//!                      <--  HDR, SA            <--  HDR, SA, KE, Nr, IDir, HASH_R
//! HDR, KE, Ni          -->               HDR*, HASH_I  -->
//!                      <--  HDR, KE, Nr
//! HDR*, IDii, HASH_I   -->
//!                      <--  HDR*, IDir, HASH_R
//! ```
//!
//! Quick Mode (RFC 2409 Section 5.5), any number in parallel under one
//! ISAKMP SA, distinguished by message ID:
//!
//! ```text
//! HDR*, HASH(1), SA, Ni [, KE] , IDci, IDcr  -->
//!                <--  HDR*, HASH(2), SA, Nr [, KE] , IDci, IDcr
//! HDR*, HASH(3)  -->
//!                <--  HDR*, HASH(4), N(CONNECTED)     (commit bit only)
//! ```
//!
//! With signatures, SIG_I / SIG_R take the place of HASH_I / HASH_R.
//!
//! Both sides retransmit every message that expects an answer. A message
//! equal to the last one received by an exchange is answered with the
//! saved reply. Negotiation failures are reported with an informational
//! notification: in the clear before the key exchange, under HASH(1)
//! after it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use zeroize::Zeroizing;

use super::constants::{ExchangeType, IsakmpFlags, NotifyType, PayloadType, ProtocolId};
use super::crypt::Opened;
use super::informational::{
    apply_delete, build_informational, check_hash, deletes, notify_for_error, open_informational,
    plain_notify, process_notifies, with_hash,
};
use super::keymat::{
    auth_hash, derive_ipsec_keys, derive_oakley_keys, phase1_iv, phase2_iv, quick_hash3,
    skeyid_psk, skeyid_signature, AuthHashInputs, KeymatSeed, Phase1Inputs,
};
use super::message::{
    DeletePayload, IdPayload, IsakmpHeader, IsakmpMessage, NotifyPayload, Payload, PayloadChain,
    SaPayload,
};
use super::proposal::{
    accepted_phase1, accepted_phase2, construct_phase1_proposal, construct_phase2_proposals,
    protocol_id, select_phase1, select_phase2,
};
use super::sa::{IsakmpSa, Phase1Handle, QuickBundle, QuickHandle, QuickRequest, Replay};
use super::state::{IsakmpSaState, Phase1Mode};
use crate::config::{
    AuthenticationMethod, IkeConfig, IkePolicy, IkeVersion, Lifetime, Phase1Attributes,
};
use crate::crypto::{verify_equal, CryptoProvider, DhGroup, SignatureAlgorithm};
use crate::engine::Datagram;
use crate::error::{Error, Result};
use crate::identity::{Identifier, IdentityStore};
use crate::ikev2::auth::resolve_psk;
use crate::install::{
    allocate_spi, install_children, remove_children, ChildSaDescriptor, InstalledChild,
};
use crate::logging;
use crate::spd::{Direction, IpsecProtocol, SaRequest, SecurityPolicyDb, Selector, SpdExpiry};
use crate::timer::{CancelScope, TimerQueue};

/// Timer events of the IKEv1 engine
///
/// The subject is the ISAKMP SA id, the context the Quick Mode message
/// ID (0 for Phase 1 and the SA itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ikev1Event {
    /// Last message went unanswered
    Retransmit,
    /// Phase 1 not completed in time
    HalfOpenTimeout,
    /// ISAKMP SA stops taking new Quick Modes
    SoftLifetime,
    /// ISAKMP SA must go
    HardLifetime,
}

const ALL_EVENTS: [Ikev1Event; 4] = [
    Ikev1Event::Retransmit,
    Ikev1Event::HalfOpenTimeout,
    Ikev1Event::SoftLifetime,
    Ikev1Event::HardLifetime,
];

/// Decrypted Quick Mode message
struct QuickMessage<'a> {
    raw: &'a [u8],
    commit: bool,
    chain: PayloadChain,
    next_iv: Vec<u8>,
}

fn find_sa(payloads: &[Payload]) -> Result<&SaPayload> {
    payloads
        .iter()
        .find_map(|p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        })
        .ok_or_else(|| Error::MissingPayload("SA".into()))
}

fn find_ke(payloads: &[Payload]) -> Option<&[u8]> {
    payloads.iter().find_map(|p| match p {
        Payload::Ke(data) => Some(data.as_slice()),
        _ => None,
    })
}

fn find_nonce(payloads: &[Payload]) -> Result<&[u8]> {
    payloads
        .iter()
        .find_map(|p| match p {
            Payload::Nonce(n) => Some(n.as_slice()),
            _ => None,
        })
        .ok_or_else(|| Error::MissingPayload("Nonce".into()))
}

fn find_ids(payloads: &[Payload]) -> Vec<&IdPayload> {
    payloads
        .iter()
        .filter_map(|p| match p {
            Payload::Id(id) => Some(id),
            _ => None,
        })
        .collect()
}

/// ID payload of a Phase 1 message with its position in the chain
fn phase1_id(chain: &PayloadChain) -> Result<(usize, &IdPayload)> {
    let index = chain
        .position(PayloadType::Id)
        .ok_or_else(|| Error::MissingPayload("ID".into()))?;
    match &chain.payloads[index] {
        Payload::Id(id) => Ok((index, id)),
        _ => Err(Error::Internal("ID payload position mismatch".into())),
    }
}

fn check_ke_len(group: DhGroup, data: &[u8]) -> Result<()> {
    if data.len() != group.public_len() {
        return Err(Error::InvalidKePayload {
            expected_group: group.number(),
        });
    }
    Ok(())
}

fn policy_mode(version: IkeVersion) -> Option<Phase1Mode> {
    match version {
        IkeVersion::V1Main => Some(Phase1Mode::Main),
        IkeVersion::V1Aggressive => Some(Phase1Mode::Aggressive),
        IkeVersion::V2 => None,
    }
}

fn phase1_exchange(mode: Phase1Mode) -> ExchangeType {
    match mode {
        Phase1Mode::Main => ExchangeType::IdentityProtection,
        Phase1Mode::Aggressive => ExchangeType::Aggressive,
    }
}

/// Client identities for a selector (outbound view): IDci, IDcr
fn quick_ids(selector: &Selector, peer: IpAddr) -> (IdPayload, IdPayload) {
    let ipv4 = selector
        .source
        .is_ipv4()
        .or_else(|| selector.destination.is_ipv4())
        .unwrap_or(peer.is_ipv4());
    (
        IdPayload::for_traffic(&selector.source, selector.protocol, selector.source_port, ipv4),
        IdPayload::for_traffic(
            &selector.destination,
            selector.protocol,
            selector.destination_port,
            ipv4,
        ),
    )
}

/// Selector from our client identity to the peer's
fn traffic_selector(local: &IdPayload, remote: &IdPayload) -> Result<Selector> {
    let (source, protocol, source_port) = local.to_traffic()?;
    let (destination, remote_protocol, destination_port) = remote.to_traffic()?;
    if protocol != remote_protocol {
        return Err(Error::TsUnacceptable);
    }
    Ok(Selector::new(source, destination)
        .with_protocol(protocol)
        .with_source_port(source_port)
        .with_destination_port(destination_port))
}

fn same_request(a: &QuickRequest, b: &QuickRequest) -> bool {
    a.group == b.group && a.policy_index == b.policy_index && a.selector == b.selector
}

/// IKEv1 engine: ISAKMP SA table, exchanges and their timers
pub struct Ikev1Engine {
    config: IkeConfig,
    provider: Arc<dyn CryptoProvider>,
    identities: Arc<IdentityStore>,
    policies: Vec<IkePolicy>,
    sas: Vec<IsakmpSa>,
    timers: TimerQueue<Ikev1Event>,
    next_id: u64,
}

impl std::fmt::Debug for Ikev1Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ikev1Engine")
            .field("policies", &self.policies.len())
            .field("sas", &self.sas.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Ikev1Engine {
    /// Create an engine without policies
    pub fn new(
        config: IkeConfig,
        provider: Arc<dyn CryptoProvider>,
        identities: Arc<IdentityStore>,
    ) -> Self {
        Ikev1Engine {
            config,
            provider,
            identities,
            policies: Vec::new(),
            sas: Vec::new(),
            timers: TimerQueue::new(),
            next_id: 1,
        }
    }

    /// Add an IKE policy
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an IKEv2 policy, a
    /// duplicate name, or an Aggressive Mode policy whose suites use
    /// more than one DH group (its first message carries a single KE).
    pub fn add_policy(&mut self, policy: IkePolicy) -> Result<()> {
        let Some(mode) = policy_mode(policy.version) else {
            return Err(Error::InvalidParameter(format!(
                "policy {} is not an IKEv1 policy",
                policy.name
            )));
        };
        if self.policies.iter().any(|p| p.name == policy.name) {
            return Err(Error::InvalidParameter(format!(
                "duplicate IKE policy {}",
                policy.name
            )));
        }
        if mode == Phase1Mode::Aggressive {
            let group = policy.attributes.first().map(|s| s.group);
            if policy.attributes.iter().any(|s| Some(s.group) != group) {
                return Err(Error::InvalidParameter(format!(
                    "Aggressive Mode policy {} mixes DH groups",
                    policy.name
                )));
            }
        }
        self.policies.push(policy);
        Ok(())
    }

    /// Configured policies
    pub fn policies(&self) -> &[IkePolicy] {
        &self.policies
    }

    /// ISAKMP SAs
    pub fn sas(&self) -> &[IsakmpSa] {
        &self.sas
    }

    /// ISAKMP SA by id
    pub fn sa(&self, id: u64) -> Option<&IsakmpSa> {
        self.sas.iter().find(|s| s.id == id)
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn pos(&self, id: u64) -> Result<usize> {
        self.sas
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::SaNotFound(format!("ISAKMP SA {}", id)))
    }

    fn policy(&self, name: &str) -> Result<IkePolicy> {
        self.policies
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("IKE policy {}", name)))
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn random_cookie(&self) -> Result<[u8; 8]> {
        let mut cookie = [0u8; 8];
        while cookie == [0u8; 8] {
            self.provider.random_bytes(&mut cookie)?;
        }
        Ok(cookie)
    }

    fn random_nonce(&self) -> Result<Vec<u8>> {
        let mut nonce = vec![0u8; self.config.nonce_len];
        self.provider.random_bytes(&mut nonce)?;
        Ok(nonce)
    }

    fn random_message_id(&self, pos: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        let mut message_id = 0;
        while !self.sas[pos].is_free_message_id(message_id) {
            self.provider.random_bytes(&mut buf)?;
            message_id = u32::from_be_bytes(buf);
        }
        Ok(message_id)
    }

    fn half_open_timeout(&self) -> Duration {
        self.config.exchange_timeout * (self.config.max_resend + 1)
    }

    fn lifetime(&self, suite: &Phase1Attributes) -> Lifetime {
        if suite.lifetime == Lifetime::default() {
            self.config.ike_lifetime
        } else {
            suite.lifetime
        }
    }

    fn phase1_handle(&self, pos: usize) -> Result<&Phase1Handle> {
        self.sas[pos]
            .phase1
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Phase 1 already finished".into()))
    }

    fn cancel_timers(&mut self, id: u64) {
        for event in ALL_EVENTS {
            self.timers.cancel_matching(&event, id, 0, CancelScope::AllExtra);
        }
    }

    /// Drop an ISAKMP SA
    ///
    /// Without `with_children` the IPsec SAs stay installed; an
    /// established SA with the same peer and policy adopts them.
    fn remove_sa(&mut self, spd: &mut SecurityPolicyDb, pos: usize, with_children: bool) {
        let mut sa = self.sas.remove(pos);
        self.cancel_timers(sa.id);
        let children = std::mem::take(&mut sa.children);
        if with_children {
            let installed: Vec<InstalledChild> =
                children.iter().flat_map(|b| b.pairs.iter().cloned()).collect();
            remove_children(spd, &installed);
        } else if !children.is_empty() {
            let heir = self.sas.iter_mut().find(|s| {
                s.peer == sa.peer && s.policy == sa.policy && s.state.is_established()
            });
            match heir {
                Some(heir) => heir.children.extend(children),
                None => tracing::debug!(
                    peer = %sa.peer,
                    bundles = children.len(),
                    "IPsec SAs outlive their ISAKMP SA"
                ),
            }
        }
        logging::log_ike_state_transition(
            &sa.initiator_cookie,
            &sa.responder_cookie,
            sa.state.name(),
            IsakmpSaState::Deleted.name(),
        );
    }

    fn fail(&mut self, spd: &mut SecurityPolicyDb, id: u64, e: &Error) {
        if let Ok(pos) = self.pos(id) {
            logging::log_handshake_failed(&self.sas[pos].peer.to_string(), e);
            self.remove_sa(spd, pos, true);
        }
    }

    // ----------------------------------------------------------------
    // Local requests
    // ----------------------------------------------------------------

    /// Negotiate the SAs asked for by the policy database
    ///
    /// Runs Quick Mode under an established ISAKMP SA with the peer,
    /// queues the request behind a Phase 1 in progress, or starts Phase 1.
    pub fn initiate(
        &mut self,
        spd: &mut SecurityPolicyDb,
        request: &SaRequest,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let peer = request
            .peer
            .ok_or_else(|| Error::InvalidParameter("SA request without a peer".into()))?;
        let policy = self
            .policies
            .iter()
            .find(|p| p.ipsec_group == request.group && p.matches_peer(peer))
            .cloned()
            .ok_or(Error::PolicyNotFound)?;
        logging::log_sa_request(
            request.policy_index,
            request
                .security
                .first()
                .map_or(0, |s| s.protocol.protocol_id()),
        );
        let quick = QuickRequest {
            group: request.group.clone(),
            policy_index: request.policy_index,
            selector: request.selector.clone(),
            security: request.security.clone(),
            inbound_spis: Vec::new(),
            pfs: policy.pfs_group,
            rekey: None,
        };
        self.request_quick(spd, &policy, peer, quick, now)
    }

    fn request_quick(
        &mut self,
        spd: &mut SecurityPolicyDb,
        policy: &IkePolicy,
        peer: IpAddr,
        request: QuickRequest,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let existing = self.sas.iter().position(|s| {
            s.peer == peer
                && s.policy == policy.name
                && (s.state == IsakmpSaState::Established
                    || (s.state == IsakmpSaState::Negotiating && s.is_initiator))
        });
        let Some(pos) = existing else {
            return self.start_phase1(policy, peer, request, now).map(|d| vec![d]);
        };

        let sa = &mut self.sas[pos];
        let duplicate = sa
            .waiting
            .iter()
            .chain(sa.quick.iter().filter_map(|h| h.request.as_ref()))
            .any(|r| same_request(r, &request));
        if duplicate {
            return Ok(Vec::new());
        }
        if sa.state == IsakmpSaState::Established {
            return self.start_quick(spd, pos, request, now).map(|d| vec![d]);
        }
        sa.waiting.push(request);
        Ok(Vec::new())
    }

    /// Delete IPsec SA pairs by our inbound SPIs and tell the peer
    pub fn delete_children(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        protocol: IpsecProtocol,
        inbound_spis: &[u32],
        _now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &mut self.sas[pos];
        if !sa.state.is_established() {
            return Err(Error::InvalidState("ISAKMP SA not established".into()));
        }
        let mut removed = Vec::new();
        for bundle in &mut sa.children {
            bundle.pairs.retain(|p| {
                let hit = p.protocol == protocol && inbound_spis.contains(&p.inbound_spi);
                if hit {
                    removed.push(p.clone());
                }
                !hit
            });
        }
        sa.children.retain(|b| !b.pairs.is_empty());
        if removed.is_empty() {
            return Err(Error::SaNotFound(format!(
                "no IPsec SA with inbound SPI {:08x?}",
                inbound_spis
            )));
        }
        remove_children(spd, &removed);
        let spis: Vec<u32> = removed.iter().map(|p| p.inbound_spi).collect();
        let delete = DeletePayload::ipsec(protocol_id(protocol), &spis);
        Ok(vec![self.send_informational(pos, vec![Payload::Delete(delete)])?])
    }

    /// Delete an ISAKMP SA and tell the peer
    ///
    /// IPsec SAs negotiated under it stay installed.
    pub fn delete_isakmp_sa(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        _now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &self.sas[pos];
        let mut out = Vec::new();
        if sa.keys.is_some() {
            let delete = DeletePayload::isakmp(sa.initiator_cookie, sa.responder_cookie);
            out.push(self.send_informational(pos, vec![Payload::Delete(delete)])?);
        }
        self.remove_sa(spd, pos, false);
        Ok(out)
    }

    fn send_informational(&self, pos: usize, payloads: Vec<Payload>) -> Result<Datagram> {
        let sa = &self.sas[pos];
        let (_, data) = build_informational(&*self.provider, sa, payloads)?;
        logging::log_message_send("INFORMATIONAL", &sa.peer.to_string(), data.len());
        Ok(Datagram {
            peer: sa.peer,
            data,
        })
    }

    // ----------------------------------------------------------------
    // Phase 1
    // ----------------------------------------------------------------

    fn start_phase1(
        &mut self,
        policy: &IkePolicy,
        peer: IpAddr,
        request: QuickRequest,
        now: Instant,
    ) -> Result<Datagram> {
        let suite = *policy
            .attributes
            .first()
            .ok_or_else(|| Error::InvalidParameter("IKE policy without suites".into()))?;
        let cookie = self.random_cookie()?;
        let offer = construct_phase1_proposal(&policy.attributes)?;
        let id = self.allocate_id();
        let mut sa = IsakmpSa::new(id, true, (cookie, [0u8; 8]), peer, policy, suite);
        sa.waiting.push(request);

        let mut payloads = vec![Payload::Sa(offer)];
        if sa.mode == Phase1Mode::Aggressive {
            let pair = self.provider.dh_generate(suite.group)?;
            let ni = self.random_nonce()?;
            payloads.push(Payload::Ke(pair.public.clone()));
            payloads.push(Payload::Nonce(ni.clone()));
            payloads.push(Payload::Id(IdPayload::identity(&sa.local_id)));
            let h = sa.phase1()?;
            h.dh = Some(pair.private);
            h.ke_i = pair.public;
            h.ni = ni;
        }
        let h = sa.phase1()?;
        h.offered = policy.attributes.clone();
        h.sa_i_body = payloads[0].body();

        let header = sa.header(phase1_exchange(sa.mode), 0, IsakmpFlags::default());
        let data = IsakmpMessage::new(header, payloads).encode();
        logging::log_handshake_start(&peer.to_string(), "initiator", sa.mode.name());
        self.sas.push(sa);

        let pos = self.sas.len() - 1;
        let timeout = self.half_open_timeout();
        self.timers
            .schedule(Ikev1Event::HalfOpenTimeout, id, 0, timeout, now);
        self.phase1_sent(pos, &[], data, true, now)
    }

    /// Record a Phase 1 message as the answer to `received`
    fn phase1_sent(
        &mut self,
        pos: usize,
        received: &[u8],
        data: Vec<u8>,
        awaiting: bool,
        now: Instant,
    ) -> Result<Datagram> {
        let sa = &mut self.sas[pos];
        let (id, peer, mode) = (sa.id, sa.peer, sa.mode);
        let h = sa.phase1()?;
        h.replay = Replay {
            message_id: 0,
            received: received.to_vec(),
            sent: data.clone(),
        };
        h.resend_count = 0;
        h.awaiting = awaiting;

        self.timers
            .cancel_matching(&Ikev1Event::Retransmit, id, 0, CancelScope::Exact);
        if awaiting {
            self.timers.schedule(
                Ikev1Event::Retransmit,
                id,
                0,
                self.config.exchange_timeout,
                now,
            );
        }
        logging::log_message_send(phase1_exchange(mode).name(), &peer.to_string(), data.len());
        Ok(Datagram { peer, data })
    }

    /// Move the Phase 1 handle to its next state
    fn advance(&mut self, pos: usize) -> Result<()> {
        let sa = &mut self.sas[pos];
        let (icky, rcky) = (sa.initiator_cookie, sa.responder_cookie);
        let h = sa.phase1()?;
        let next = h.state.next()?;
        logging::log_ike_state_transition(&icky, &rcky, &h.state.name(), &next.name());
        h.state = next;
        Ok(())
    }

    /// SKEYID and its derivatives, plus the first Phase 1 IV
    fn derive_phase1_keys(
        &mut self,
        pos: usize,
        psk_id: Option<&Identifier>,
        shared: &[u8],
    ) -> Result<()> {
        let provider = &*self.provider;
        let sa = &self.sas[pos];
        let h = self.phase1_handle(pos)?;
        let suite = sa.suite;
        let skeyid: Zeroizing<Vec<u8>> = match suite.auth {
            AuthenticationMethod::PreSharedKey => {
                let psk = resolve_psk(&self.identities, psk_id, sa.peer)?;
                skeyid_psk(provider, suite.prf, psk, &h.ni, &h.nr)?
            }
            AuthenticationMethod::Ed25519 => {
                skeyid_signature(provider, suite.prf, &h.ni, &h.nr, shared)?
            }
        };
        let inputs = Phase1Inputs {
            initiator_cookie: &sa.initiator_cookie,
            responder_cookie: &sa.responder_cookie,
            ni: &h.ni,
            nr: &h.nr,
            shared,
        };
        let keys = derive_oakley_keys(provider, &suite, skeyid, &inputs)?;
        let iv = phase1_iv(
            provider,
            suite.hash,
            &h.ke_i,
            &h.ke_r,
            suite.encryption.block_size(),
        )?;
        let sa = &mut self.sas[pos];
        sa.keys = Some(keys);
        sa.iv = iv;
        Ok(())
    }

    /// HASH_I (`for_initiator`) or HASH_R over an ID payload body
    fn phase1_hash(&self, pos: usize, id_body: &[u8], for_initiator: bool) -> Result<Vec<u8>> {
        let sa = &self.sas[pos];
        let h = self.phase1_handle(pos)?;
        let keys = sa.keys()?;
        let inputs = AuthHashInputs {
            ke_i: &h.ke_i,
            ke_r: &h.ke_r,
            initiator_cookie: &sa.initiator_cookie,
            responder_cookie: &sa.responder_cookie,
            sa_i: &h.sa_i_body,
        };
        auth_hash(
            &*self.provider,
            sa.suite.prf,
            &keys.skeyid,
            &inputs,
            id_body,
            for_initiator,
        )
    }

    /// HASH or SIG payload carrying our authentication
    fn our_auth(&self, pos: usize, hash: Vec<u8>) -> Result<Payload> {
        let sa = &self.sas[pos];
        match sa.suite.auth {
            AuthenticationMethod::PreSharedKey => Ok(Payload::Hash(hash)),
            AuthenticationMethod::Ed25519 => {
                let private_key = self
                    .identities
                    .credential(&sa.local_id)
                    .and_then(|c| c.private_key.as_ref())
                    .ok_or_else(|| {
                        Error::AuthenticationFailed(format!("no signing key for {}", sa.local_id))
                    })?;
                let signature = self
                    .provider
                    .sign(SignatureAlgorithm::Ed25519, private_key, &hash)?;
                Ok(Payload::Sig(signature))
            }
        }
    }

    fn check_auth(
        &self,
        pos: usize,
        peer_id: &Identifier,
        expected: &[u8],
        payloads: &[Payload],
    ) -> Result<()> {
        match self.sas[pos].suite.auth {
            AuthenticationMethod::PreSharedKey => {
                let received = payloads
                    .iter()
                    .find_map(|p| match p {
                        Payload::Hash(h) => Some(h),
                        _ => None,
                    })
                    .ok_or_else(|| Error::MissingPayload("HASH".into()))?;
                if !verify_equal(expected, received) {
                    return Err(Error::AuthenticationFailed("HASH mismatch".into()));
                }
                Ok(())
            }
            AuthenticationMethod::Ed25519 => {
                let signature = payloads
                    .iter()
                    .find_map(|p| match p {
                        Payload::Sig(s) => Some(s),
                        _ => None,
                    })
                    .ok_or_else(|| Error::MissingPayload("SIG".into()))?;
                let credential = self.identities.credential(peer_id).ok_or_else(|| {
                    Error::AuthenticationFailed(format!("no public key for {}", peer_id))
                })?;
                self.provider
                    .verify(
                        SignatureAlgorithm::Ed25519,
                        &credential.public_key,
                        expected,
                        signature,
                    )
                    .map_err(|_| Error::AuthenticationFailed("signature mismatch".into()))
            }
        }
    }

    fn check_peer_id(&self, pos: usize, peer_id: &Identifier) -> Result<()> {
        let policy = self.policy(&self.sas[pos].policy)?;
        match &policy.peer_id {
            Some(expected) if expected != peer_id => Err(Error::AuthenticationFailed(format!(
                "peer identified as {}",
                peer_id
            ))),
            _ => Ok(()),
        }
    }

    /// Encrypted [ID,] HASH/SIG message, chaining the Phase 1 IV
    fn auth_message(&mut self, pos: usize, with_id: bool) -> Result<Vec<u8>> {
        let sa = &self.sas[pos];
        let initiator = sa.is_initiator;
        let id = IdPayload::identity(&sa.local_id);
        let hash = self.phase1_hash(pos, &id.body(), initiator)?;

        let mut payloads = Vec::with_capacity(3);
        if with_id {
            payloads.push(Payload::Id(id));
        }
        payloads.push(self.our_auth(pos, hash)?);
        let first_contact = !self
            .sas
            .iter()
            .any(|s| s.id != sa.id && s.peer == sa.peer && s.state.is_established());
        if initiator && self.config.send_initial_contact && first_contact {
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::InitialContact,
                Vec::new(),
            )));
        }

        let header = sa.header(phase1_exchange(sa.mode), 0, IsakmpFlags::default());
        let (data, next_iv) = sa.seal(&*self.provider, &header, &sa.iv, &payloads)?;
        self.sas[pos].iv = next_iv;
        Ok(data)
    }

    /// Finish Phase 1 and start the Quick Modes waiting for it
    fn establish(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let sa = &mut self.sas[pos];
        if let Some(h) = sa.phase1.take() {
            sa.remember(h.replay);
        }
        sa.transition_to(IsakmpSaState::Established)?;
        logging::log_handshake_complete(
            &sa.peer.to_string(),
            &sa.initiator_cookie,
            &sa.responder_cookie,
        );
        let (id, suite) = (sa.id, sa.suite);
        let waiting = std::mem::take(&mut sa.waiting);

        let lifetime = self.lifetime(&suite);
        self.timers.cancel_subject(id, 0);
        self.timers
            .schedule(Ikev1Event::SoftLifetime, id, 0, lifetime.soft, now);
        self.timers
            .schedule(Ikev1Event::HardLifetime, id, 0, lifetime.hard, now);

        let mut out = Vec::new();
        for request in waiting {
            match self.start_quick(spd, pos, request, now) {
                Ok(d) => out.push(d),
                Err(e) => tracing::warn!(isakmp_sa = id, error = %e, "Queued Quick Mode failed"),
            }
        }
        Ok(out)
    }

    /// INITIAL_CONTACT: forget every other SA shared with the peer
    fn initial_contact(&mut self, spd: &mut SecurityPolicyDb, id: u64, peer: IpAddr, group: &str) {
        let stale: Vec<u64> = self
            .sas
            .iter()
            .filter(|s| s.id != id && s.peer == peer)
            .map(|s| s.id)
            .collect();
        for other in stale {
            if let Ok(pos) = self.pos(other) {
                self.remove_sa(spd, pos, true);
            }
        }
        match spd.remove_sas_by_peer(group, peer) {
            Ok(0) => {}
            Ok(n) => tracing::info!(peer = %peer, removed = n, "INITIAL_CONTACT removed stale SAs"),
            Err(e) => spd.errors().record("initial contact", e),
        }
    }

    // ----------------------------------------------------------------
    // Received messages
    // ----------------------------------------------------------------

    /// Process a received datagram
    ///
    /// # Returns
    ///
    /// Datagrams to send: the next message of an exchange, a saved reply
    /// to a retransmission, error notifications, or nothing.
    ///
    /// # Errors
    ///
    /// The message is dropped when it is malformed, matches no ISAKMP SA,
    /// comes from another address than the SA's peer, or fails its
    /// integrity check before anything could be reported to the peer.
    pub fn handle_message(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let header = IsakmpHeader::from_bytes(data)?;
        let raw = &data[..header.length as usize];
        logging::log_message_recv(header.exchange_type.name(), &src.to_string(), raw.len());

        let Some(id) = self.lookup(&header, src)? else {
            return self.on_phase1_request(spd, src, raw, &header, now);
        };
        let pos = self.pos(id)?;
        if let Some(saved) = self.sas[pos].replay_for(raw) {
            logging::log_duplicate_request(&src.to_string(), header.message_id);
            return Ok(vec![Datagram {
                peer: src,
                data: saved.to_vec(),
            }]);
        }
        match header.exchange_type {
            ExchangeType::IdentityProtection | ExchangeType::Aggressive => {
                self.on_phase1(spd, id, &header, raw, now)
            }
            ExchangeType::Quick => self.on_quick(spd, id, &header, raw, now),
            ExchangeType::Informational => self.on_info(spd, id, &header, raw),
            other => Err(Error::UnsupportedExchangeType(other.to_u8())),
        }
    }

    /// Find the ISAKMP SA a message belongs to
    ///
    /// `None` means a new Phase 1 from a peer. An initiator SA still
    /// waiting for the responder cookie matches any; a responder SA
    /// matches a zero responder cookie from its own peer (a retransmitted
    /// first message).
    fn lookup(&self, header: &IsakmpHeader, src: IpAddr) -> Result<Option<u64>> {
        let rcky = header.responder_cookie;
        let unset = header.responder_cookie_unset();
        let sa = self.sas.iter().find(|s| {
            s.initiator_cookie == header.initiator_cookie
                && (s.responder_cookie == rcky
                    || (s.is_initiator && s.responder_cookie == [0u8; 8])
                    || (!s.is_initiator && unset && s.peer == src))
        });
        match sa {
            Some(sa) if sa.peer != src => Err(Error::AddressMismatch {
                expected: sa.peer,
                actual: src,
            }),
            Some(sa) => Ok(Some(sa.id)),
            None if unset
                && matches!(
                    header.exchange_type,
                    ExchangeType::IdentityProtection | ExchangeType::Aggressive
                ) =>
            {
                Ok(None)
            }
            None => Err(Error::SaNotFound(format!(
                "ISAKMP cookies {}/{}",
                hex::encode(header.initiator_cookie),
                hex::encode(rcky)
            ))),
        }
    }

    /// Report a failed Phase 1 step to the peer and drop the SA
    fn phase1_error(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        e: Error,
    ) -> Result<Vec<Datagram>> {
        let Ok(pos) = self.pos(id) else {
            return Err(e);
        };
        let sa = &self.sas[pos];
        let peer = sa.peer;
        let reply = match notify_for_error(&e) {
            Some(notify) if sa.keys.is_some() => {
                let payload = Payload::Notify(NotifyPayload::new(notify, Vec::new()));
                build_informational(&*self.provider, sa, vec![payload])
                    .map(|(_, data)| data)
                    .ok()
            }
            Some(notify) => Some(plain_notify(
                (sa.initiator_cookie, sa.responder_cookie),
                notify,
            )),
            None => None,
        };
        self.fail(spd, id, &e);
        match reply {
            Some(data) => Ok(vec![Datagram { peer, data }]),
            None => Err(e),
        }
    }

    /// First message of a Phase 1 started by the peer
    fn on_phase1_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        raw: &[u8],
        header: &IsakmpHeader,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        if header.message_id != 0 {
            return Err(Error::InvalidMessageId {
                expected: 0,
                actual: header.message_id,
            });
        }
        let mode = match header.exchange_type {
            ExchangeType::Aggressive => Phase1Mode::Aggressive,
            _ => Phase1Mode::Main,
        };
        let policy = self
            .policies
            .iter()
            .find(|p| p.matches_peer(src) && policy_mode(p.version) == Some(mode))
            .cloned()
            .ok_or(Error::PolicyNotFound)?;
        let (_, chain) = IsakmpMessage::decode(raw)?;
        let offered = find_sa(&chain.payloads)?;
        logging::log_handshake_start(&src.to_string(), "responder", mode.name());

        let selection = match select_phase1(&policy.attributes, offered) {
            Ok(selection) => selection,
            Err(e) => {
                let Some(notify) = notify_for_error(&e) else {
                    return Err(e);
                };
                logging::log_handshake_failed(&src.to_string(), &e);
                let data = plain_notify((header.initiator_cookie, [0u8; 8]), notify);
                return Ok(vec![Datagram { peer: src, data }]);
            }
        };

        let cookie = self.random_cookie()?;
        let id = self.allocate_id();
        let mut sa = IsakmpSa::new(
            id,
            false,
            (header.initiator_cookie, cookie),
            src,
            &policy,
            selection.suite,
        );
        let sa_index = chain.position(PayloadType::Sa).unwrap_or(0);
        sa.phase1()?.sa_i_body = chain.raw_body(sa_index).unwrap_or_default().to_vec();
        self.sas.push(sa);
        let pos = self.sas.len() - 1;
        let timeout = self.half_open_timeout();
        self.timers
            .schedule(Ikev1Event::HalfOpenTimeout, id, 0, timeout, now);

        let response = Payload::Sa(selection.response);
        let built = match mode {
            Phase1Mode::Main => {
                let header = self.sas[pos].header(
                    ExchangeType::IdentityProtection,
                    0,
                    IsakmpFlags::default(),
                );
                Ok(IsakmpMessage::new(header, vec![response]).encode())
            }
            Phase1Mode::Aggressive => self.aggressive_r1(pos, &chain, response),
        };
        let step = built.and_then(|data| {
            self.advance(pos)?;
            self.phase1_sent(pos, raw, data, true, now)
        });
        match step {
            Ok(d) => Ok(vec![d]),
            Err(e) => self.phase1_error(spd, id, e),
        }
    }

    fn on_phase1(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        header: &IsakmpHeader,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &self.sas[pos];
        let Some(h) = sa.phase1.as_ref() else {
            return Err(Error::InvalidState("Phase 1 message on an established ISAKMP SA".into()));
        };
        if header.exchange_type != phase1_exchange(sa.mode) {
            return Err(Error::InvalidMessage(format!(
                "{} message during {}",
                header.exchange_type.name(),
                sa.mode.name()
            )));
        }
        if header.message_id != 0 {
            return Err(Error::InvalidMessageId {
                expected: 0,
                actual: header.message_id,
            });
        }

        let state = h.state;
        let step = match (sa.mode, state.number()) {
            (Phase1Mode::Main, 1) => self.main_i1(pos, header, raw, now),
            (Phase1Mode::Main, 3) => self.main_i2(pos, raw, now),
            (Phase1Mode::Main, 4) => self.main_r2(pos, raw, now),
            (Phase1Mode::Main, 5) => self.main_i3(spd, pos, raw, now),
            (Phase1Mode::Main, 6) => self.main_r3(spd, pos, raw, now),
            (Phase1Mode::Aggressive, 1) => self.aggressive_i1(spd, pos, header, raw, now),
            (Phase1Mode::Aggressive, 4) => self.aggressive_r2(spd, pos, raw, now),
            _ => {
                return Err(Error::InvalidState(format!(
                    "unexpected message in {}",
                    state.name()
                )))
            }
        };
        step.or_else(|e| self.phase1_error(spd, id, e))
    }

    /// MM_I1: responder accepted a suite, send KE, Ni
    fn main_i1(
        &mut self,
        pos: usize,
        header: &IsakmpHeader,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let (_, chain) = IsakmpMessage::decode(raw)?;
        if header.responder_cookie_unset() {
            return Err(Error::InvalidMessage("Phase 1 answer without responder cookie".into()));
        }
        let suite = accepted_phase1(&self.phase1_handle(pos)?.offered, find_sa(&chain.payloads)?)?;
        let ni = self.random_nonce()?;
        let pair = self.provider.dh_generate(suite.group)?;

        let sa = &mut self.sas[pos];
        sa.responder_cookie = header.responder_cookie;
        sa.suite = suite;
        let h = sa.phase1()?;
        h.dh = Some(pair.private);
        h.ke_i = pair.public.clone();
        h.ni = ni.clone();

        let header = sa.header(ExchangeType::IdentityProtection, 0, IsakmpFlags::default());
        let payloads = vec![Payload::Ke(pair.public), Payload::Nonce(ni)];
        let data = IsakmpMessage::new(header, payloads).encode();
        self.advance(pos)?;
        Ok(vec![self.phase1_sent(pos, raw, data, true, now)?])
    }

    /// MM_R2: key exchange, answer with KE, Nr and derive the keys
    fn main_r2(&mut self, pos: usize, raw: &[u8], now: Instant) -> Result<Vec<Datagram>> {
        let (_, chain) = IsakmpMessage::decode(raw)?;
        let ke_i = find_ke(&chain.payloads)
            .ok_or_else(|| Error::MissingPayload("KE".into()))?
            .to_vec();
        let ni = find_nonce(&chain.payloads)?.to_vec();
        let suite = self.sas[pos].suite;
        check_ke_len(suite.group, &ke_i)?;

        let nr = self.random_nonce()?;
        let pair = self.provider.dh_generate(suite.group)?;
        let shared = self.provider.dh_compute(pair.private, &ke_i)?;
        let h = self.sas[pos].phase1()?;
        h.ke_i = ke_i;
        h.ke_r = pair.public.clone();
        h.ni = ni;
        h.nr = nr.clone();

        let policy = self.policy(&self.sas[pos].policy)?;
        self.derive_phase1_keys(pos, policy.peer_id.as_ref(), &shared)?;
        let header =
            self.sas[pos].header(ExchangeType::IdentityProtection, 0, IsakmpFlags::default());
        let payloads = vec![Payload::Ke(pair.public), Payload::Nonce(nr)];
        let data = IsakmpMessage::new(header, payloads).encode();
        self.advance(pos)?;
        Ok(vec![self.phase1_sent(pos, raw, data, true, now)?])
    }

    /// MM_I2: derive the keys, send IDii and HASH_I encrypted
    fn main_i2(&mut self, pos: usize, raw: &[u8], now: Instant) -> Result<Vec<Datagram>> {
        let (_, chain) = IsakmpMessage::decode(raw)?;
        let ke_r = find_ke(&chain.payloads)
            .ok_or_else(|| Error::MissingPayload("KE".into()))?
            .to_vec();
        let nr = find_nonce(&chain.payloads)?.to_vec();
        check_ke_len(self.sas[pos].suite.group, &ke_r)?;

        let h = self.sas[pos].phase1()?;
        let dh = h
            .dh
            .take()
            .ok_or_else(|| Error::Internal("no DH value for Phase 1".into()))?;
        h.ke_r = ke_r.clone();
        h.nr = nr;
        let shared = self.provider.dh_compute(dh, &ke_r)?;

        let policy = self.policy(&self.sas[pos].policy)?;
        self.derive_phase1_keys(pos, policy.peer_id.as_ref(), &shared)?;
        let data = self.auth_message(pos, true)?;
        self.advance(pos)?;
        Ok(vec![self.phase1_sent(pos, raw, data, true, now)?])
    }

    /// MM_R3: authenticate the initiator, answer with IDir and HASH_R
    fn main_r3(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let Opened { chain, next_iv, .. } = {
            let sa = &self.sas[pos];
            sa.open(&*self.provider, &sa.iv, raw)?
        };
        let (index, id) = phase1_id(&chain)?;
        let peer_id = id.to_identifier()?;
        self.check_peer_id(pos, &peer_id)?;
        let expected = self.phase1_hash(pos, chain.raw_body(index).unwrap_or_default(), true)?;
        self.check_auth(pos, &peer_id, &expected, &chain.payloads)?;
        let flags = process_notifies(&chain.payloads);

        let sa = &mut self.sas[pos];
        sa.iv = next_iv;
        sa.peer_id = Some(peer_id);
        let data = self.auth_message(pos, true)?;
        let reply = self.phase1_sent(pos, raw, data, false, now)?;

        let (id, peer, policy) = {
            let sa = &self.sas[pos];
            (sa.id, sa.peer, sa.policy.clone())
        };
        if flags.initial_contact {
            let group = self.policy(&policy)?.ipsec_group;
            self.initial_contact(spd, id, peer, &group);
        }
        let pos = self.pos(id)?;
        let mut out = vec![reply];
        out.extend(self.establish(spd, pos, now)?);
        Ok(out)
    }

    /// MM_I3: authenticate the responder
    fn main_i3(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let Opened { chain, next_iv, .. } = {
            let sa = &self.sas[pos];
            sa.open(&*self.provider, &sa.iv, raw)?
        };
        let (index, id) = phase1_id(&chain)?;
        let peer_id = id.to_identifier()?;
        self.check_peer_id(pos, &peer_id)?;
        let expected = self.phase1_hash(pos, chain.raw_body(index).unwrap_or_default(), false)?;
        self.check_auth(pos, &peer_id, &expected, &chain.payloads)?;

        let sa = &mut self.sas[pos];
        sa.iv = next_iv;
        sa.peer_id = Some(peer_id);
        let id = sa.id;
        sa.phase1()?.awaiting = false;
        self.timers
            .cancel_matching(&Ikev1Event::Retransmit, id, 0, CancelScope::Exact);
        self.advance(pos)?;
        self.establish(spd, pos, now)
    }

    /// AM_R1: answer SA, KE, Ni, IDii with SA, KE, Nr, IDir, HASH_R
    fn aggressive_r1(
        &mut self,
        pos: usize,
        chain: &PayloadChain,
        response: Payload,
    ) -> Result<Vec<u8>> {
        let payloads = &chain.payloads;
        let suite = self.sas[pos].suite;
        let ke_i = find_ke(payloads)
            .ok_or_else(|| Error::MissingPayload("KE".into()))?
            .to_vec();
        check_ke_len(suite.group, &ke_i)?;
        let ni = find_nonce(payloads)?.to_vec();
        let (_, id) = phase1_id(chain)?;
        let peer_id = id.to_identifier()?;
        self.check_peer_id(pos, &peer_id)?;

        let nr = self.random_nonce()?;
        let pair = self.provider.dh_generate(suite.group)?;
        let shared = self.provider.dh_compute(pair.private, &ke_i)?;
        let h = self.sas[pos].phase1()?;
        h.ke_i = ke_i;
        h.ke_r = pair.public.clone();
        h.ni = ni;
        h.nr = nr.clone();
        h.peer_id = Some(id.clone());
        self.derive_phase1_keys(pos, Some(&peer_id), &shared)?;

        let ours = IdPayload::identity(&self.sas[pos].local_id);
        let hash = self.phase1_hash(pos, &ours.body(), false)?;
        let auth = self.our_auth(pos, hash)?;
        let header = self.sas[pos].header(ExchangeType::Aggressive, 0, IsakmpFlags::default());
        let payloads = vec![
            response,
            Payload::Ke(pair.public),
            Payload::Nonce(nr),
            Payload::Id(ours),
            auth,
        ];
        Ok(IsakmpMessage::new(header, payloads).encode())
    }

    /// AM_I1: authenticate the responder, send HASH_I encrypted
    fn aggressive_i1(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        header: &IsakmpHeader,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let (_, chain) = IsakmpMessage::decode(raw)?;
        if header.responder_cookie_unset() {
            return Err(Error::InvalidMessage("Phase 1 answer without responder cookie".into()));
        }
        let payloads = &chain.payloads;
        let suite = accepted_phase1(&self.phase1_handle(pos)?.offered, find_sa(payloads)?)?;
        let ke_r = find_ke(payloads)
            .ok_or_else(|| Error::MissingPayload("KE".into()))?
            .to_vec();
        check_ke_len(suite.group, &ke_r)?;
        let nr = find_nonce(payloads)?.to_vec();
        let (index, id) = phase1_id(&chain)?;
        let peer_id = id.to_identifier()?;
        self.check_peer_id(pos, &peer_id)?;

        let sa = &mut self.sas[pos];
        sa.responder_cookie = header.responder_cookie;
        sa.suite = suite;
        let h = sa.phase1()?;
        let dh = h
            .dh
            .take()
            .ok_or_else(|| Error::Internal("no DH value for Phase 1".into()))?;
        if dh.group() != suite.group {
            return Err(Error::NoProposalChosen);
        }
        h.ke_r = ke_r.clone();
        h.nr = nr;
        let shared = self.provider.dh_compute(dh, &ke_r)?;

        let psk_id = self.policy(&self.sas[pos].policy)?.peer_id.unwrap_or_else(|| peer_id.clone());
        self.derive_phase1_keys(pos, Some(&psk_id), &shared)?;
        let expected = self.phase1_hash(pos, chain.raw_body(index).unwrap_or_default(), false)?;
        self.check_auth(pos, &peer_id, &expected, payloads)?;

        self.sas[pos].peer_id = Some(peer_id);
        let data = self.auth_message(pos, false)?;
        self.advance(pos)?;
        let mut out = vec![self.phase1_sent(pos, raw, data, false, now)?];
        out.extend(self.establish(spd, pos, now)?);
        Ok(out)
    }

    /// AM_R2: authenticate the initiator
    fn aggressive_r2(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let Opened { chain, next_iv, .. } = {
            let sa = &self.sas[pos];
            sa.open(&*self.provider, &sa.iv, raw)?
        };
        let id = self
            .phase1_handle(pos)?
            .peer_id
            .clone()
            .ok_or_else(|| Error::Internal("Aggressive Mode without peer ID".into()))?;
        let peer_id = id.to_identifier()?;
        let expected = self.phase1_hash(pos, &id.body(), true)?;
        self.check_auth(pos, &peer_id, &expected, &chain.payloads)?;
        let flags = process_notifies(&chain.payloads);

        let sa = &mut self.sas[pos];
        sa.iv = next_iv;
        sa.peer_id = Some(peer_id);
        let (sa_id, peer, policy) = (sa.id, sa.peer, sa.policy.clone());
        let h = sa.phase1()?;
        h.replay.received = raw.to_vec();
        h.replay.sent.clear();
        h.awaiting = false;
        self.timers
            .cancel_matching(&Ikev1Event::Retransmit, sa_id, 0, CancelScope::Exact);

        if flags.initial_contact {
            let group = self.policy(&policy)?.ipsec_group;
            self.initial_contact(spd, sa_id, peer, &group);
        }
        let pos = self.pos(sa_id)?;
        self.establish(spd, pos, now)
    }

    // ----------------------------------------------------------------
    // Quick Mode
    // ----------------------------------------------------------------

    fn start_quick(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        mut request: QuickRequest,
        now: Instant,
    ) -> Result<Datagram> {
        let provider = Arc::clone(&self.provider);
        let spis = request
            .security
            .iter()
            .map(|s| allocate_spi(&*provider, spd, &request.group, s.protocol))
            .collect::<Result<Vec<_>>>()?;
        let proposals = construct_phase2_proposals(&request.security, &spis, request.pfs)?;
        request.inbound_spis = spis;
        let ni = self.random_nonce()?;
        let message_id = self.random_message_id(pos)?;

        let sa = &self.sas[pos];
        let (idci, idcr) = quick_ids(&request.selector, sa.peer);
        let mut payloads = vec![
            Payload::Sa(SaPayload::ipsec(proposals)),
            Payload::Nonce(ni.clone()),
        ];
        let dh = match request.pfs {
            Some(group) => {
                let pair = provider.dh_generate(group)?;
                payloads.push(Payload::Ke(pair.public));
                Some(pair.private)
            }
            None => None,
        };
        payloads.push(Payload::Id(idci));
        payloads.push(Payload::Id(idcr));
        let payloads = with_hash(&*provider, sa, message_id, None, payloads)?;

        let commit = self.config.quick_mode_commit;
        let flags = if commit {
            IsakmpFlags::default().with_commit()
        } else {
            IsakmpFlags::default()
        };
        let iv = phase2_iv(
            &*provider,
            sa.suite.hash,
            &sa.iv,
            message_id,
            sa.suite.encryption.block_size(),
        )?;
        let header = sa.header(ExchangeType::Quick, message_id, flags);
        let (data, next_iv) = sa.seal(&*provider, &header, &iv, &payloads)?;

        let mut handle = QuickHandle::new(message_id, true, next_iv);
        handle.request = Some(request);
        handle.ni = ni;
        handle.dh = dh;
        handle.commit = commit;
        let sa = &mut self.sas[pos];
        sa.quick.push(handle);
        let qpos = sa.quick.len() - 1;
        tracing::debug!(isakmp_sa = sa.id, message_id, commit, "Quick Mode started");
        self.quick_sent(pos, qpos, &[], data, true, now)
    }

    /// Record a Quick Mode message as the answer to `received`
    fn quick_sent(
        &mut self,
        pos: usize,
        qpos: usize,
        received: &[u8],
        data: Vec<u8>,
        awaiting: bool,
        now: Instant,
    ) -> Result<Datagram> {
        let sa = &mut self.sas[pos];
        let (id, peer) = (sa.id, sa.peer);
        let h = &mut sa.quick[qpos];
        h.replay.received = received.to_vec();
        h.replay.sent = data.clone();
        h.resend_count = 0;
        h.awaiting = awaiting;
        let context = u64::from(h.message_id);

        self.timers
            .cancel_matching(&Ikev1Event::Retransmit, id, context, CancelScope::Exact);
        if awaiting {
            self.timers.schedule(
                Ikev1Event::Retransmit,
                id,
                context,
                self.config.exchange_timeout,
                now,
            );
        }
        logging::log_message_send("QUICK_MODE", &peer.to_string(), data.len());
        Ok(Datagram { peer, data })
    }

    fn quick_step(&mut self, pos: usize, qpos: usize) -> Result<()> {
        let sa = &mut self.sas[pos];
        let (icky, rcky) = (sa.initiator_cookie, sa.responder_cookie);
        let h = &mut sa.quick[qpos];
        let next = h.state.next()?;
        logging::log_ike_state_transition(&icky, &rcky, &h.state.name(), &next.name());
        h.state = next;
        Ok(())
    }

    fn on_quick(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        header: &IsakmpHeader,
        raw: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let pos = self.pos(id)?;
        let message_id = header.message_id;
        if message_id == 0 {
            return Err(Error::InvalidMessage("Quick Mode with message ID 0".into()));
        }
        let sa = &mut self.sas[pos];
        if !sa.state.is_established() {
            return Err(Error::InvalidState(format!(
                "Quick Mode on ISAKMP SA in state {}",
                sa.state.name()
            )));
        }
        let (qpos, created) = match sa.quick_pos(message_id) {
            Some(qpos) => (qpos, false),
            None => {
                let iv = phase2_iv(
                    &*provider,
                    sa.suite.hash,
                    &sa.iv,
                    message_id,
                    sa.suite.encryption.block_size(),
                )?;
                sa.quick.push(QuickHandle::new(message_id, false, iv));
                (sa.quick.len() - 1, true)
            }
        };
        let opened = sa.open(&*provider, &sa.quick[qpos].iv, raw);
        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if created {
                    sa.quick.remove(qpos);
                }
                return Err(e);
            }
        };

        let state = sa.quick[qpos].state;
        let notify_spi = if state.is_initiator() {
            sa.quick[qpos].request.as_ref().and_then(|r| {
                let first = r.security.first()?;
                Some((protocol_id(first.protocol), *r.inbound_spis.first()?))
            })
        } else {
            find_sa(&opened.chain.payloads)
                .ok()
                .and_then(|s| s.proposals.first())
                .and_then(|p| Some((ProtocolId::from_u8(p.protocol_id)?, p.spi_u32().ok()?)))
        };
        let msg = QuickMessage {
            raw,
            commit: opened.header.flags.is_commit(),
            chain: opened.chain,
            next_iv: opened.next_iv,
        };
        let step = match (state.is_initiator(), state.number()) {
            (false, 2) => self.quick_r1(spd, pos, qpos, &msg, now),
            (true, 1) => self.quick_i1(spd, pos, qpos, &msg, now),
            (false, 4) => self.quick_r2(spd, pos, qpos, &msg, now),
            (true, 5) => self.quick_i3(spd, pos, qpos, &msg, now),
            _ => {
                return Err(Error::InvalidState(format!(
                    "unexpected message in {}",
                    state.name()
                )))
            }
        };
        step.or_else(|e| self.quick_error(id, message_id, notify_spi, e))
    }

    /// QM_R1: select a proposal, answer with HASH(2), SA, Nr [, KE], IDs
    fn quick_r1(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        qpos: usize,
        msg: &QuickMessage<'_>,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let message_id = self.sas[pos].quick[qpos].message_id;
        check_hash(&*provider, &self.sas[pos], message_id, None, &msg.chain)?;
        let payloads = &msg.chain.payloads;
        process_notifies(payloads).as_error()?;
        let offered = find_sa(payloads)?;
        let ni = find_nonce(payloads)?.to_vec();
        let ids = find_ids(payloads);
        let [idci, idcr] = ids.as_slice() else {
            return Err(Error::MissingPayload("IDci/IDcr".into()));
        };

        let policy = self.policy(&self.sas[pos].policy)?;
        let group = policy.ipsec_group.clone();
        let traffic = traffic_selector(idcr, idci)?;
        let (policy_index, selector, local) = {
            let (found, narrow) = spd
                .policy_by_selector_narrow(&group, &traffic, Direction::Outbound)
                .map_err(|_| Error::TsUnacceptable)?;
            tracing::debug!(
                policy = found.index,
                narrowed_protocol = ?narrow.narrowed_protocol,
                "Client identities narrowed to policy"
            );
            (found.index, found.selector.clone(), found.security.clone())
        };
        let selection = select_phase2(&local, &offered.proposals, policy.pfs_group)?;

        let (our_ke, shared) = match (policy.pfs_group, find_ke(payloads)) {
            (Some(group), Some(ke)) => {
                check_ke_len(group, ke)?;
                let pair = provider.dh_generate(group)?;
                let shared = provider.dh_compute(pair.private, ke)?;
                (Some(pair.public), Some(shared))
            }
            (Some(_), None) => return Err(Error::MissingPayload("KE".into())),
            (None, Some(_)) => {
                return Err(Error::InvalidPayload("KE without PFS".into()));
            }
            (None, None) => (None, None),
        };

        let security = selection.security();
        let spis = security
            .iter()
            .map(|s| allocate_spi(&*provider, spd, &group, s.protocol))
            .collect::<Result<Vec<_>>>()?;
        let nr = self.random_nonce()?;

        let sa = &self.sas[pos];
        let keys = sa.keys()?;
        let seed = KeymatSeed {
            pfs_shared: shared.as_ref().map(|s| s.as_slice()),
            ni: &ni,
            nr: &nr,
        };
        let pending = selection
            .entries
            .iter()
            .zip(&spis)
            .map(|(entry, spi)| {
                Ok(ChildSaDescriptor {
                    security: entry.security.clone(),
                    inbound_spi: *spi,
                    outbound_spi: entry.peer_spi,
                    keys: derive_ipsec_keys(
                        &*provider,
                        sa.suite.prf,
                        &keys.skeyid_d,
                        &seed,
                        &entry.security,
                        (*spi, entry.peer_spi),
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut reply = vec![
            Payload::Sa(SaPayload::ipsec(selection.response_proposals(&spis))),
            Payload::Nonce(nr.clone()),
        ];
        if let Some(public) = our_ke {
            reply.push(Payload::Ke(public));
        }
        reply.push(Payload::Id((*idci).clone()));
        reply.push(Payload::Id((*idcr).clone()));
        let reply = with_hash(&*provider, sa, message_id, Some(ni.as_slice()), reply)?;

        let commit = msg.commit || self.config.quick_mode_commit;
        let flags = if commit {
            IsakmpFlags::default().with_commit()
        } else {
            IsakmpFlags::default()
        };
        let header = sa.header(ExchangeType::Quick, message_id, flags);
        let (data, next_iv) = sa.seal(&*provider, &header, &msg.next_iv, &reply)?;

        let h = &mut self.sas[pos].quick[qpos];
        h.iv = next_iv;
        h.ni = ni;
        h.nr = nr;
        h.pending = pending;
        h.target = Some((group, policy_index, selector));
        h.commit = commit;
        self.quick_step(pos, qpos)?;
        Ok(vec![self.quick_sent(pos, qpos, msg.raw, data, true, now)?])
    }

    /// QM_I1: check the answer, send HASH(3), install unless committing
    fn quick_i1(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        qpos: usize,
        msg: &QuickMessage<'_>,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let sa = &self.sas[pos];
        let h = &sa.quick[qpos];
        let message_id = h.message_id;
        check_hash(&*provider, sa, message_id, Some(h.ni.as_slice()), &msg.chain)?;
        let payloads = &msg.chain.payloads;
        process_notifies(payloads).as_error()?;
        let request = h
            .request
            .clone()
            .ok_or_else(|| Error::Internal("Quick Mode without request".into()))?;
        let proposals = &find_sa(payloads)?.proposals;
        let selection = accepted_phase2(&request.security, proposals, request.pfs)?;
        let nr = find_nonce(payloads)?.to_vec();

        let (idci, idcr) = quick_ids(&request.selector, sa.peer);
        let ids = find_ids(payloads);
        if !matches!(ids.as_slice(), [ci, cr] if **ci == idci && **cr == idcr) {
            return Err(Error::TsUnacceptable);
        }

        let shared = match request.pfs {
            Some(group) => {
                let ke = find_ke(payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
                check_ke_len(group, ke)?;
                let dh = self.sas[pos].quick[qpos]
                    .dh
                    .take()
                    .ok_or_else(|| Error::Internal("no DH value for PFS".into()))?;
                Some(provider.dh_compute(dh, ke)?)
            }
            None => None,
        };

        let sa = &self.sas[pos];
        let h = &sa.quick[qpos];
        let keys = sa.keys()?;
        let seed = KeymatSeed {
            pfs_shared: shared.as_ref().map(|s| s.as_slice()),
            ni: &h.ni,
            nr: &nr,
        };
        let pending = selection
            .entries
            .iter()
            .map(|entry| {
                let spi = *request
                    .inbound_spis
                    .get(entry.local_index)
                    .ok_or_else(|| Error::Internal("SPI missing for offered protocol".into()))?;
                Ok(ChildSaDescriptor {
                    security: entry.security.clone(),
                    inbound_spi: spi,
                    outbound_spi: entry.peer_spi,
                    keys: derive_ipsec_keys(
                        &*provider,
                        sa.suite.prf,
                        &keys.skeyid_d,
                        &seed,
                        &entry.security,
                        (spi, entry.peer_spi),
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let hash = quick_hash3(&*provider, sa.suite.prf, &keys.skeyid_a, message_id, &h.ni, &nr)?;
        let header = sa.header(ExchangeType::Quick, message_id, IsakmpFlags::default());
        let (data, next_iv) = sa.seal(&*provider, &header, &msg.next_iv, &[Payload::Hash(hash)])?;

        let h = &mut self.sas[pos].quick[qpos];
        h.iv = next_iv;
        h.nr = nr;
        h.pending = pending;
        h.target = Some((request.group, request.policy_index, request.selector));
        h.commit = msg.commit;
        self.quick_step(pos, qpos)?;
        if msg.commit {
            self.quick_step(pos, qpos)?;
            return Ok(vec![self.quick_sent(pos, qpos, msg.raw, data, true, now)?]);
        }
        let mut out = vec![self.quick_sent(pos, qpos, msg.raw, data, false, now)?];
        out.extend(self.finish_quick(spd, pos, qpos, now)?);
        Ok(out)
    }

    /// QM_R2: check HASH(3), install, confirm with CONNECTED on commit
    fn quick_r2(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        qpos: usize,
        msg: &QuickMessage<'_>,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let sa = &self.sas[pos];
        let h = &sa.quick[qpos];
        let Some(Payload::Hash(received)) = msg.chain.payloads.first() else {
            return Err(Error::MissingPayload("HASH(3)".into()));
        };
        let keys = sa.keys()?;
        let expected = quick_hash3(
            &*provider,
            sa.suite.prf,
            &keys.skeyid_a,
            h.message_id,
            &h.ni,
            &h.nr,
        )?;
        if !verify_equal(&expected, received) {
            return Err(Error::VerifyFailed("HASH(3) mismatch".into()));
        }

        let connected = match (h.commit, h.pending.first()) {
            (true, Some(first)) => {
                let notify = NotifyPayload::for_spi(
                    NotifyType::Connected,
                    protocol_id(first.security.protocol),
                    first.outbound_spi,
                );
                let payloads =
                    with_hash(&*provider, sa, h.message_id, None, vec![Payload::Notify(notify)])?;
                let header = sa.header(ExchangeType::Quick, h.message_id, IsakmpFlags::default());
                Some(sa.seal(&*provider, &header, &msg.next_iv, &payloads)?)
            }
            _ => None,
        };

        let peer = sa.peer;
        let h = &mut self.sas[pos].quick[qpos];
        h.replay.received = msg.raw.to_vec();
        h.replay.sent.clear();
        h.iv = msg.next_iv.clone();
        let mut out = Vec::new();
        if let Some((data, next_iv)) = connected {
            h.iv = next_iv;
            h.replay.sent = data.clone();
            logging::log_message_send("QUICK_MODE", &peer.to_string(), data.len());
            out.push(Datagram { peer, data });
        }
        out.extend(self.finish_quick(spd, pos, qpos, now)?);
        Ok(out)
    }

    /// QM_I3: CONNECTED arrived, install
    fn quick_i3(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        qpos: usize,
        msg: &QuickMessage<'_>,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let sa = &self.sas[pos];
        let message_id = sa.quick[qpos].message_id;
        check_hash(&*self.provider, sa, message_id, None, &msg.chain)?;
        let flags = process_notifies(&msg.chain.payloads);
        flags.as_error()?;
        if flags.connected.is_none() {
            return Err(Error::MissingPayload("N(CONNECTED)".into()));
        }
        let h = &mut self.sas[pos].quick[qpos];
        h.iv = msg.next_iv.clone();
        h.awaiting = false;
        self.finish_quick(spd, pos, qpos, now)
    }

    /// Install the negotiated pairs and close the Quick Mode
    fn finish_quick(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        qpos: usize,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let sa = &mut self.sas[pos];
        let handle = sa.quick.remove(qpos);
        let (id, peer) = (sa.id, sa.peer);
        self.timers.cancel_subject(id, u64::from(handle.message_id));
        let QuickHandle {
            pending,
            target,
            request,
            replay,
            ..
        } = handle;
        self.sas[pos].remember(replay);

        let (group, policy_index, selector) =
            target.ok_or_else(|| Error::Internal("Quick Mode without target".into()))?;
        let pairs = install_children(spd, &group, policy_index, &selector, peer, pending, now)?;
        self.sas[pos].children.push(QuickBundle {
            selector,
            pairs,
            rekeying: false,
        });
        match request.and_then(|r| r.rekey) {
            Some(old) => Ok(self.retire_pairs(spd, pos, &old)),
            None => Ok(Vec::new()),
        }
    }

    /// Remove re-keyed pairs and tell the peer
    fn retire_pairs(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        old: &[InstalledChild],
    ) -> Vec<Datagram> {
        for sa in &mut self.sas {
            for bundle in &mut sa.children {
                bundle.pairs.retain(|p| {
                    !old
                        .iter()
                        .any(|o| o.inbound_spi == p.inbound_spi && o.protocol == p.protocol)
                });
            }
            sa.children.retain(|b| !b.pairs.is_empty());
        }
        remove_children(spd, old);

        let mut out = Vec::new();
        for protocol in [IpsecProtocol::Ah, IpsecProtocol::Esp] {
            let spis: Vec<u32> = old
                .iter()
                .filter(|p| p.protocol == protocol)
                .map(|p| p.inbound_spi)
                .collect();
            if spis.is_empty() {
                continue;
            }
            let delete = DeletePayload::ipsec(protocol_id(protocol), &spis);
            match self.send_informational(pos, vec![Payload::Delete(delete)]) {
                Ok(d) => out.push(d),
                Err(e) => spd.errors().record("re-keyed SA delete", e),
            }
        }
        out
    }

    fn set_rekeying(&mut self, pairs: &[InstalledChild], rekeying: bool) {
        for sa in &mut self.sas {
            for bundle in &mut sa.children {
                if bundle
                    .pairs
                    .iter()
                    .any(|p| {
                        pairs
                            .iter()
                            .any(|o| o.inbound_spi == p.inbound_spi && o.protocol == p.protocol)
                    })
                {
                    bundle.rekeying = rekeying;
                }
            }
        }
    }

    /// Drop a Quick Mode handle and its timers
    fn drop_quick(&mut self, pos: usize, message_id: u32) {
        let sa = &mut self.sas[pos];
        let id = sa.id;
        let old = sa.quick_pos(message_id).and_then(|q| {
            let handle = sa.quick.remove(q);
            handle.request.and_then(|r| r.rekey)
        });
        self.timers.cancel_subject(id, u64::from(message_id));
        if let Some(old) = old {
            self.set_rekeying(&old, false);
        }
    }

    /// Report a failed Quick Mode to the peer and drop it
    fn quick_error(
        &mut self,
        id: u64,
        message_id: u32,
        spi: Option<(ProtocolId, u32)>,
        e: Error,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        logging::log_handshake_failed(&self.sas[pos].peer.to_string(), &e);
        self.drop_quick(pos, message_id);
        let Some(notify) = notify_for_error(&e) else {
            return Err(e);
        };
        let payload = match spi {
            Some((protocol, spi)) => NotifyPayload::for_spi(notify, protocol, spi),
            None => NotifyPayload::new(notify, Vec::new()),
        };
        Ok(vec![self.send_informational(pos, vec![Payload::Notify(payload)])?])
    }

    // ----------------------------------------------------------------
    // Informational
    // ----------------------------------------------------------------

    fn on_info(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        header: &IsakmpHeader,
        raw: &[u8],
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        if !header.flags.is_encrypted() {
            if self.sas[pos].keys.is_some() {
                return Err(Error::InvalidMessage(
                    "Unprotected informational on a keyed ISAKMP SA".into(),
                ));
            }
            let (msg, _) = IsakmpMessage::decode(raw)?;
            if let Err(e) = process_notifies(&msg.payloads).as_error() {
                self.fail(spd, id, &e);
                return Err(e);
            }
            return Ok(Vec::new());
        }

        let payloads = open_informational(&*self.provider, &self.sas[pos], raw, header.message_id)?;
        let flags = process_notifies(&payloads);
        if let Some(err) = &flags.error {
            self.on_error_notify(spd, id, err);
            // deletes in the same message are not processed
            return Err(Error::Notified(err.notify_type));
        }
        let pos = self.pos(id)?;
        let (peer, group) = {
            let sa = &self.sas[pos];
            (sa.peer, self.policy(&sa.policy)?.ipsec_group)
        };
        if flags.initial_contact {
            self.initial_contact(spd, id, peer, &group);
        }

        let pos = self.pos(id)?;
        let mut close = false;
        for delete in deletes(&payloads) {
            match apply_delete(spd, &mut self.sas[pos], &group, delete) {
                Ok(outcome) => close |= outcome.isakmp,
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed Delete payload"),
            }
        }
        if close {
            self.remove_sa(spd, pos, false);
        }
        Ok(Vec::new())
    }

    /// Error notification from the peer
    ///
    /// Fails Phase 1 while it runs; afterwards the SPI names the Quick
    /// Mode it refers to.
    fn on_error_notify(&mut self, spd: &mut SecurityPolicyDb, id: u64, notify: &NotifyPayload) {
        let Ok(pos) = self.pos(id) else {
            return;
        };
        let e = Error::Notified(notify.notify_type);
        if self.sas[pos].phase1.is_some() {
            self.fail(spd, id, &e);
            return;
        }
        let spi = <[u8; 4]>::try_from(notify.spi.as_slice())
            .ok()
            .map(u32::from_be_bytes);
        let quick = spi.and_then(|spi| {
            self.sas[pos]
                .quick
                .iter()
                .find(|h| {
                    h.request
                        .as_ref()
                        .map_or(false, |r| r.inbound_spis.contains(&spi))
                        || h.pending.iter().any(|d| d.outbound_spi == spi)
                })
                .map(|h| h.message_id)
        });
        match quick {
            Some(message_id) => {
                logging::log_handshake_failed(&self.sas[pos].peer.to_string(), &e);
                self.drop_quick(pos, message_id);
            }
            None => tracing::warn!(notify_type = notify.notify_type, "Peer reported an error"),
        }
    }

    // ----------------------------------------------------------------
    // Timers and SA expiry
    // ----------------------------------------------------------------

    /// Fire due timers
    pub fn process_timers(&mut self, spd: &mut SecurityPolicyDb, now: Instant) -> Vec<Datagram> {
        let mut out = Vec::new();
        for entry in self.timers.pop_due(now) {
            let id = entry.subject;
            let Ok(pos) = self.pos(id) else {
                continue;
            };
            match entry.event {
                Ikev1Event::Retransmit => {
                    logging::log_timer_event("isakmp_retransmit", id);
                    let resent = if entry.context == 0 {
                        self.resend_phase1(spd, pos, now)
                    } else {
                        self.resend_quick(pos, entry.context as u32, now)
                    };
                    out.extend(resent);
                }
                Ikev1Event::HalfOpenTimeout => {
                    logging::log_timer_event("isakmp_half_open", id);
                    if self.sas[pos].state == IsakmpSaState::Negotiating {
                        self.fail(spd, id, &Error::InvalidState("Phase 1 timed out".into()));
                    }
                }
                Ikev1Event::SoftLifetime => {
                    logging::log_timer_event("isakmp_soft_lifetime", id);
                    let sa = &mut self.sas[pos];
                    if sa.state == IsakmpSaState::Established {
                        if let Err(e) = sa.transition_to(IsakmpSaState::Expiring) {
                            spd.errors().record("ISAKMP SA soft lifetime", e);
                        }
                    }
                }
                Ikev1Event::HardLifetime => {
                    logging::log_timer_event("isakmp_hard_lifetime", id);
                    if let Some(d) = self.expire(spd, pos) {
                        out.push(d);
                    }
                }
            }
        }
        out
    }

    fn resend_phase1(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        now: Instant,
    ) -> Option<Datagram> {
        let max_resend = self.config.max_resend;
        let sa = &mut self.sas[pos];
        let (id, peer) = (sa.id, sa.peer);
        let h = sa.phase1.as_mut().filter(|h| h.awaiting)?;
        if h.resend_count >= max_resend {
            let e = Error::InvalidState(format!("no answer after {} retransmissions", max_resend));
            self.fail(spd, id, &e);
            return None;
        }
        h.resend_count += 1;
        let data = h.replay.sent.clone();
        self.timers.schedule(
            Ikev1Event::Retransmit,
            id,
            0,
            self.config.exchange_timeout,
            now,
        );
        Some(Datagram { peer, data })
    }

    fn resend_quick(&mut self, pos: usize, message_id: u32, now: Instant) -> Option<Datagram> {
        let max_resend = self.config.max_resend;
        let sa = &mut self.sas[pos];
        let (id, peer) = (sa.id, sa.peer);
        let qpos = sa.quick_pos(message_id)?;
        let h = &mut sa.quick[qpos];
        if !h.awaiting {
            return None;
        }
        if h.resend_count >= max_resend {
            let e = Error::InvalidState(format!("no answer after {} retransmissions", max_resend));
            logging::log_handshake_failed(&peer.to_string(), &e);
            self.drop_quick(pos, message_id);
            return None;
        }
        h.resend_count += 1;
        let data = h.replay.sent.clone();
        self.timers.schedule(
            Ikev1Event::Retransmit,
            id,
            u64::from(message_id),
            self.config.exchange_timeout,
            now,
        );
        Some(Datagram { peer, data })
    }

    /// Hard expiry: tell the peer, then drop the SA
    fn expire(&mut self, spd: &mut SecurityPolicyDb, pos: usize) -> Option<Datagram> {
        let sa = &self.sas[pos];
        let notice = if sa.keys.is_some() {
            let delete = DeletePayload::isakmp(sa.initiator_cookie, sa.responder_cookie);
            match self.send_informational(pos, vec![Payload::Delete(delete)]) {
                Ok(d) => Some(d),
                Err(e) => {
                    spd.errors().record("ISAKMP SA hard lifetime", e);
                    None
                }
            }
        } else {
            None
        };
        self.remove_sa(spd, pos, false);
        notice
    }

    fn find_bundle(
        &self,
        peer: IpAddr,
        outbound_spi: u32,
        protocol: IpsecProtocol,
    ) -> Option<(usize, usize)> {
        self.sas.iter().enumerate().find_map(|(pos, sa)| {
            if sa.peer != peer {
                return None;
            }
            sa.bundle_by_outbound(outbound_spi, protocol).map(|b| (pos, b))
        })
    }

    /// React to IPsec SA lifetime events of the policy database
    ///
    /// Soft expiry starts a Quick Mode replacing the bundle (under a new
    /// ISAKMP SA if the current one is expiring), hard expiry tells the
    /// peer about the removed pair.
    pub fn handle_spd_expiry(
        &mut self,
        spd: &mut SecurityPolicyDb,
        expiries: &[SpdExpiry],
        now: Instant,
    ) -> Vec<Datagram> {
        let mut out = Vec::new();
        for expiry in expiries {
            match expiry {
                SpdExpiry::SoftLifetime {
                    group,
                    outbound_spi,
                    protocol,
                    peer,
                    ..
                } => {
                    let Some((pos, b)) = self.find_bundle(*peer, *outbound_spi, *protocol) else {
                        tracing::debug!(spi = outbound_spi, "Soft expiry of an unmanaged SA");
                        continue;
                    };
                    let Ok(policy) = self.policy(&self.sas[pos].policy) else {
                        continue;
                    };
                    let bundle = &self.sas[pos].children[b];
                    if bundle.rekeying {
                        continue;
                    }
                    let Some(first) = bundle.pairs.first() else {
                        continue;
                    };
                    let security = bundle
                        .pairs
                        .iter()
                        .map(|p| {
                            spd.outbound_sa(&p.group, p.outbound_index)
                                .map(|sa| sa.security.clone())
                        })
                        .collect::<Result<Vec<_>>>();
                    let security = match security {
                        Ok(security) => security,
                        Err(e) => {
                            tracing::debug!(error = %e, "Bundle partly gone, not re-keyed");
                            continue;
                        }
                    };
                    let request = QuickRequest {
                        group: group.clone(),
                        policy_index: first.policy_index,
                        selector: bundle.selector.clone(),
                        security,
                        inbound_spis: Vec::new(),
                        pfs: policy.pfs_group,
                        rekey: Some(bundle.pairs.clone()),
                    };
                    self.sas[pos].children[b].rekeying = true;
                    match self.request_quick(spd, &policy, *peer, request, now) {
                        Ok(sent) => out.extend(sent),
                        Err(e) => tracing::warn!(error = %e, "IPsec SA re-key failed to start"),
                    }
                }
                SpdExpiry::HardLifetime {
                    removed,
                    protocol,
                    peer,
                    ..
                } => {
                    let spi = removed.outbound_spi;
                    let Some((pos, b)) = self.find_bundle(*peer, spi, *protocol) else {
                        continue;
                    };
                    let sa = &mut self.sas[pos];
                    let bundle = &mut sa.children[b];
                    let inbound = removed.inbound_spi.or_else(|| {
                        bundle
                            .pairs
                            .iter()
                            .find(|p| p.outbound_spi == spi && p.protocol == *protocol)
                            .map(|p| p.inbound_spi)
                    });
                    bundle
                        .pairs
                        .retain(|p| !(p.outbound_spi == spi && p.protocol == *protocol));
                    if bundle.pairs.is_empty() {
                        sa.children.remove(b);
                    }
                    let (Some(spi), true) = (inbound, sa.state.is_established()) else {
                        continue;
                    };
                    let delete = DeletePayload::ipsec(protocol_id(*protocol), &[spi]);
                    match self.send_informational(pos, vec![Payload::Delete(delete)]) {
                        Ok(d) => out.push(d),
                        Err(e) => spd.errors().record("IPsec SA hard lifetime", e),
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultProvider, EncryptionAlgorithm, HashAlgorithm};
    use crate::spd::AddrSpec;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

    fn suite() -> Phase1Attributes {
        Phase1Attributes::v1(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            HashAlgorithm::Sha256,
            DhGroup::Curve25519,
            AuthenticationMethod::PreSharedKey,
        )
    }

    fn policy(version: IkeVersion) -> IkePolicy {
        IkePolicy::builder()
            .with_name("p")
            .with_peer(AddrSpec::Single(PEER))
            .with_version(version)
            .with_attributes(suite())
            .with_local_id(Identifier::Fqdn("gw.example".into()))
            .with_ipsec_group("g")
            .build()
            .unwrap()
    }

    fn engine() -> Ikev1Engine {
        let mut engine = Ikev1Engine::new(
            IkeConfig::default(),
            Arc::new(DefaultProvider::new()),
            Arc::new(IdentityStore::new()),
        );
        engine.add_policy(policy(IkeVersion::V1Main)).unwrap();
        engine
    }

    fn main_mode_offer(offer: Phase1Attributes) -> Vec<u8> {
        let header = IsakmpHeader::new(
            [7u8; 8],
            [0u8; 8],
            ExchangeType::IdentityProtection,
            IsakmpFlags::default(),
            0,
        );
        let sa = construct_phase1_proposal(&[offer]).unwrap();
        IsakmpMessage::new(header, vec![Payload::Sa(sa)]).encode()
    }

    #[test]
    fn test_add_policy_checks_version_and_groups() {
        let mut engine = engine();
        assert!(engine.add_policy(policy(IkeVersion::V1Main)).is_err());

        let mut v2 = policy(IkeVersion::V2);
        v2.name = "v2".into();
        assert!(engine.add_policy(v2).is_err());

        let mut mixed = policy(IkeVersion::V1Aggressive);
        mixed.name = "mixed".into();
        let mut other = suite();
        other.group = DhGroup::Modp2048;
        mixed.attributes.push(other);
        assert!(engine.add_policy(mixed).is_err());
    }

    #[test]
    fn test_unacceptable_offer_gets_plain_notify() {
        let mut engine = engine();
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        let mut offer = suite();
        offer.key_bits = Some(256);
        let out = engine
            .handle_message(&mut spd, PEER, &main_mode_offer(offer), Instant::now())
            .unwrap();
        assert_eq!(out.len(), 1);
        let (reply, _) = IsakmpMessage::decode(&out[0].data).unwrap();
        assert_eq!(reply.header.exchange_type, ExchangeType::Informational);
        assert_eq!(
            reply.payloads,
            vec![Payload::Notify(NotifyPayload::new(NotifyType::NoProposalChosen, Vec::new()))]
        );
        assert!(engine.sas().is_empty());
    }

    #[test]
    fn test_first_message_creates_sa_and_answers_duplicates() {
        let mut engine = engine();
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        let now = Instant::now();
        let request = main_mode_offer(suite());
        let first = engine.handle_message(&mut spd, PEER, &request, now).unwrap();
        assert_eq!(engine.sas().len(), 1);
        let sa = &engine.sas()[0];
        assert!(!sa.is_initiator);
        assert_eq!(sa.phase1.as_ref().unwrap().state.name(), "MM_R2");

        let (reply, _) = IsakmpMessage::decode(&first[0].data).unwrap();
        assert_eq!(reply.header.responder_cookie, sa.responder_cookie);
        let again = engine.handle_message(&mut spd, PEER, &request, now).unwrap();
        assert_eq!(first[0].data, again[0].data);
        assert_eq!(engine.sas().len(), 1);

        // never completed: dropped after the handshake timeout
        let later = now + engine.half_open_timeout();
        engine.process_timers(&mut spd, later);
        assert!(engine.sas().is_empty());
    }

    #[test]
    fn test_unknown_cookies_and_address_mismatch() {
        let mut engine = engine();
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        let now = Instant::now();
        let out = engine
            .handle_message(&mut spd, PEER, &main_mode_offer(suite()), now)
            .unwrap();
        let (reply, _) = IsakmpMessage::decode(&out[0].data).unwrap();

        let header = IsakmpHeader::new(
            [7u8; 8],
            reply.header.responder_cookie,
            ExchangeType::IdentityProtection,
            IsakmpFlags::default(),
            0,
        );
        let ke = IsakmpMessage::new(
            header,
            vec![Payload::Ke(vec![1; 32]), Payload::Nonce(vec![2; 32])],
        );
        let other = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99));
        assert!(matches!(
            engine.handle_message(&mut spd, other, &ke.encode(), now),
            Err(Error::AddressMismatch { .. })
        ));

        let mut stray = ke.clone();
        stray.header.responder_cookie = [1u8; 8];
        assert!(matches!(
            engine.handle_message(&mut spd, PEER, &stray.encode(), now),
            Err(Error::SaNotFound(_))
        ));

        // Quick Mode before Phase 1 completed
        let mut quick = ke.clone();
        quick.header.exchange_type = ExchangeType::Quick;
        quick.header.message_id = 5;
        quick.header.flags = IsakmpFlags::default().encrypted();
        assert!(matches!(
            engine.handle_message(&mut spd, PEER, &quick.encode(), now),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(engine.sas().len(), 1);
    }

    #[test]
    fn test_short_ke_gets_invalid_key_information() {
        let mut engine = engine();
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        let now = Instant::now();
        let out = engine
            .handle_message(&mut spd, PEER, &main_mode_offer(suite()), now)
            .unwrap();
        let (reply, _) = IsakmpMessage::decode(&out[0].data).unwrap();
        let header = IsakmpHeader::new(
            [7u8; 8],
            reply.header.responder_cookie,
            ExchangeType::IdentityProtection,
            IsakmpFlags::default(),
            0,
        );
        let ke = IsakmpMessage::new(
            header,
            vec![Payload::Ke(vec![1; 16]), Payload::Nonce(vec![2; 32])],
        );
        let out = engine.handle_message(&mut spd, PEER, &ke.encode(), now).unwrap();
        let (notice, _) = IsakmpMessage::decode(&out[0].data).unwrap();
        assert_eq!(
            notice.payloads,
            vec![Payload::Notify(NotifyPayload::new(NotifyType::InvalidKeyInformation, Vec::new()))]
        );
        assert!(engine.sas().is_empty());
    }
}
