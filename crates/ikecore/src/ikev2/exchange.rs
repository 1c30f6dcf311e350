//! IKEv2 exchange engine
//!
//! Implements the exchanges of RFC 7296 on top of the IKE SA table:
//!
//! ```text
//! Initiator                         Responder
//! -----------                       -----------
//! HDR, SAi1, KEi, Ni  -->
//!                     <--  HDR, SAr1, KEr, Nr
//! HDR, SK {IDi, [IDr,] AUTH,
//!          SAi2, TSi, TSr}  -->
//!                     <--  HDR, SK {IDr, AUTH, SAr2, TSi, TSr}
//!
//! HDR, SK {[N(REKEY_SA)], SA, Ni, [KEi], TSi, TSr}  -->
//!                     <--  HDR, SK {SA, Nr, [KEr], TSi, TSr}
//!
//! HDR, SK {[N], [D]}  -->
//!                     <--  HDR, SK {[N], [D]}
//! ```
//!
//! Each IKE SA has at most one request of its own in flight; further
//! requests are queued. Requests from the peer are answered in order and
//! a retransmitted request is answered from the saved response.
//!
//! Error policy:
//! - malformed or unauthenticated messages are dropped (`Err`, no reply)
//! - well-formed requests that cannot be honoured are answered with an
//!   error notification
//! - a failed IKE_SA_INIT / IKE_AUTH removes the IKE SA

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::auth::{signed_octets, AuthContext};
use super::child::{accept_answer, answer_offer, build_offer, ChildContext, ChildPayloads, KeyInput};
use super::constants::{ExchangeType, IkeFlags, NotifyType, ProtocolId};
use super::informational::{
    deletes, error_notify, mirrored_notifies, process_notifies, remove_deleted_children,
};
use super::keymat::{derive_ike_keys, skeyseed, skeyseed_rekey};
use super::message::{IkeHeader, IkeMessage};
use super::payload::{
    AuthPayload, DeletePayload, IdPayload, KePayload, NoncePayload, NotifyPayload, Payload,
};
use super::proposal::{
    accepted_ike_suite, construct_ike_proposals, protocol_id, select_ike_proposal, Proposal,
};
use super::sa::{
    ChildRequest, ExchangeHandle, IkeSa, InfoRequest, PendingKind, QueuedRequest,
};
use super::state::{ExchangeState, IkeSaState};
use crate::config::{IkeConfig, IkePolicy, IkeVersion, Lifetime, Phase1Attributes};
use crate::crypto::{CryptoProvider, DhPrivateKey};
use crate::engine::Datagram;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::install::{remove_children, InstalledChild};
use crate::logging;
use crate::spd::{IpsecProtocol, SaRequest, SecurityPolicyDb, SpdExpiry};
use crate::timer::{CancelScope, TimerQueue};

/// Timer events of the IKEv2 engine (subject: IKE SA id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ikev2Event {
    /// Our request went unanswered
    Retransmit,
    /// Handshake not completed in time
    HalfOpenTimeout,
    /// IKE SA should be re-keyed
    SoftLifetime,
    /// IKE SA must go
    HardLifetime,
}

/// Secrets of a request, moved into its handle once sent
#[derive(Default)]
struct HandleState {
    nonce: Vec<u8>,
    dh: Option<DhPrivateKey>,
    child: Option<ChildRequest>,
}

/// Answer to a peer request
struct Reply {
    payloads: Vec<Payload>,
    /// Remove the IKE SA once the answer is sent
    close: bool,
}

impl Reply {
    fn new(payloads: Vec<Payload>) -> Self {
        Reply {
            payloads,
            close: false,
        }
    }
}

fn proposals(payloads: &[Payload]) -> Result<&[Proposal]> {
    payloads
        .iter()
        .find_map(|p| match p {
            Payload::Sa(v) => Some(v.as_slice()),
            _ => None,
        })
        .ok_or_else(|| Error::MissingPayload("SA".into()))
}

fn key_exchange(payloads: &[Payload]) -> Option<&KePayload> {
    payloads.iter().find_map(|p| match p {
        Payload::Ke(ke) => Some(ke),
        _ => None,
    })
}

fn peer_nonce(payloads: &[Payload]) -> Result<&[u8]> {
    payloads
        .iter()
        .find_map(|p| match p {
            Payload::Nonce(n) => Some(n.nonce.as_slice()),
            _ => None,
        })
        .ok_or_else(|| Error::MissingPayload("Nonce".into()))
}

fn identity(payloads: &[Payload], initiator: bool) -> Option<&IdPayload> {
    payloads.iter().find_map(|p| match (p, initiator) {
        (Payload::IdI(id), true) | (Payload::IdR(id), false) => Some(id),
        _ => None,
    })
}

fn auth_payload(payloads: &[Payload]) -> Option<&AuthPayload> {
    payloads.iter().find_map(|p| match p {
        Payload::Auth(a) => Some(a),
        _ => None,
    })
}

fn ike_spi(spi: &[u8]) -> Result<[u8; 8]> {
    spi.try_into()
        .map_err(|_| Error::InvalidPayload(format!("IKE SA SPI of {} octets", spi.len())))
}

/// Notification answering a failed request, if the peer should be told
fn error_payloads(e: &Error) -> Option<Vec<Payload>> {
    let notify_type = e.notify_type()?;
    let data = match e {
        Error::InvalidKePayload { expected_group } => expected_group.to_be_bytes().to_vec(),
        _ => Vec::new(),
    };
    Some(vec![error_notify(notify_type, data)])
}

/// Unprotected IKE_SA_INIT answer carrying a single notification
fn plain_notify(request: &IkeHeader, notify: Payload) -> Vec<u8> {
    let mut msg = IkeMessage::new(IkeHeader::new(
        request.initiator_spi,
        [0u8; 8],
        ExchangeType::IkeSaInit,
        IkeFlags::response(false),
        request.message_id,
    ));
    msg.push(notify);
    msg.encode()
}

/// Log one step of a child exchange and return the state after it
fn exchange_step(sa: &IkeSa, state: ExchangeState) -> Result<ExchangeState> {
    let next = state.next()?;
    logging::log_ike_state_transition(
        &sa.initiator_spi,
        &sa.responder_spi,
        state.name(),
        next.name(),
    );
    Ok(next)
}

fn exchange_name(exchange: ExchangeType) -> &'static str {
    match exchange {
        ExchangeType::IkeSaInit => "IKE_SA_INIT",
        ExchangeType::IkeAuth => "IKE_AUTH",
        ExchangeType::CreateChildSa => "CREATE_CHILD_SA",
        ExchangeType::Informational => "INFORMATIONAL",
    }
}

/// IKEv2 engine: IKE SA table, exchanges and their timers
pub struct Ikev2Engine {
    config: IkeConfig,
    provider: Arc<dyn CryptoProvider>,
    identities: Arc<IdentityStore>,
    policies: Vec<IkePolicy>,
    sas: Vec<IkeSa>,
    timers: TimerQueue<Ikev2Event>,
    next_id: u64,
}

impl std::fmt::Debug for Ikev2Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ikev2Engine")
            .field("policies", &self.policies.len())
            .field("sas", &self.sas.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Ikev2Engine {
    /// Create an engine without policies
    pub fn new(
        config: IkeConfig,
        provider: Arc<dyn CryptoProvider>,
        identities: Arc<IdentityStore>,
    ) -> Self {
        Ikev2Engine {
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
    /// Returns [`Error::InvalidParameter`] for a legacy policy or a
    /// duplicate name.
    pub fn add_policy(&mut self, policy: IkePolicy) -> Result<()> {
        if policy.version != IkeVersion::V2 {
            return Err(Error::InvalidParameter(format!(
                "policy {} is not an IKEv2 policy",
                policy.name
            )));
        }
        if self.policies.iter().any(|p| p.name == policy.name) {
            return Err(Error::InvalidParameter(format!(
                "duplicate IKE policy {}",
                policy.name
            )));
        }
        self.policies.push(policy);
        Ok(())
    }

    /// Configured policies
    pub fn policies(&self) -> &[IkePolicy] {
        &self.policies
    }

    /// IKE SAs
    pub fn sas(&self) -> &[IkeSa] {
        &self.sas
    }

    /// IKE SA by id
    pub fn sa(&self, id: u64) -> Option<&IkeSa> {
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
            .ok_or_else(|| Error::SaNotFound(format!("IKE SA {}", id)))
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

    fn random_spi(&self) -> Result<[u8; 8]> {
        let mut spi = [0u8; 8];
        while spi == [0u8; 8] {
            self.provider.random_bytes(&mut spi)?;
        }
        Ok(spi)
    }

    fn random_nonce(&self) -> Result<Vec<u8>> {
        let mut nonce = vec![0u8; self.config.nonce_len];
        self.provider.random_bytes(&mut nonce)?;
        Ok(nonce)
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

    /// Mark the SA established and replace its handshake timers by
    /// lifetime timers
    fn establish(&mut self, pos: usize, now: Instant) -> Result<()> {
        let sa = &mut self.sas[pos];
        sa.transition_to(IkeSaState::Established)?;
        logging::log_handshake_complete(
            &sa.peer.to_string(),
            &sa.initiator_spi,
            &sa.responder_spi,
        );
        let (id, suite) = (sa.id, sa.suite);
        self.schedule_lifetime(id, &suite, now);
        Ok(())
    }

    fn schedule_lifetime(&mut self, id: u64, suite: &Phase1Attributes, now: Instant) {
        let lifetime = self.lifetime(suite);
        self.timers.cancel_subject(id, 0);
        self.timers
            .schedule(Ikev2Event::SoftLifetime, id, 0, lifetime.soft, now);
        self.timers
            .schedule(Ikev2Event::HardLifetime, id, 0, lifetime.hard, now);
    }

    /// Drop an IKE SA, optionally with its child SAs
    ///
    /// Children are kept when the SA was replaced by a re-keyed one.
    fn remove_sa(&mut self, spd: &mut SecurityPolicyDb, pos: usize, with_children: bool) {
        let sa = self.sas.remove(pos);
        self.timers.cancel_subject(sa.id, 0);
        if with_children && sa.replaced_by.is_none() {
            remove_children(spd, &sa.installed());
        }
        logging::log_ike_state_transition(
            &sa.initiator_spi,
            &sa.responder_spi,
            sa.state.name(),
            IkeSaState::Deleted.name(),
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
    /// Uses an IKE SA with the peer when one exists, otherwise starts
    /// IKE_SA_INIT; the first child bundle then travels in IKE_AUTH.
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

        let child = ChildRequest {
            group: request.group.clone(),
            policy_index: request.policy_index,
            selector: request.selector.clone(),
            security: request.security.clone(),
            inbound_spis: Vec::new(),
            pfs: policy.pfs_group,
            rekey: None,
        };

        let existing = self.sas.iter().position(|s| {
            s.peer == peer
                && s.policy == policy.name
                && s.replaced_by.is_none()
                && (s.state.is_established()
                    || (s.state == IkeSaState::Negotiating && s.is_initiator))
        });
        if let Some(pos) = existing {
            let sa = &mut self.sas[pos];
            let in_flight = sa.pending.as_ref().and_then(|h| h.child.as_ref());
            let duplicate = in_flight.map_or(false, |c| same_child(c, &child))
                || sa.queued.iter().any(|q| match q {
                    QueuedRequest::Child(c) => same_child(c, &child),
                    _ => false,
                });
            if !duplicate {
                sa.queued.push_back(QueuedRequest::Child(child));
            }
            let id = sa.id;
            return Ok(self.drain(spd, id, now));
        }

        // IKE_AUTH carries the first bundle without a key exchange
        let child = ChildRequest { pfs: None, ..child };
        self.start(&policy, peer, child, now).map(|d| vec![d])
    }

    fn start(
        &mut self,
        policy: &IkePolicy,
        peer: IpAddr,
        child: ChildRequest,
        now: Instant,
    ) -> Result<Datagram> {
        let suite = *policy
            .attributes
            .first()
            .ok_or_else(|| Error::InvalidParameter("IKE policy without suites".into()))?;
        let spi = self.random_spi()?;
        let nonce = self.random_nonce()?;
        let pair = self.provider.dh_generate(suite.group)?;
        let id = self.allocate_id();
        self.sas.push(IkeSa::new(
            id,
            true,
            (spi, [0u8; 8]),
            peer,
            &policy.name,
            suite,
            policy.local_id.clone(),
        ));
        logging::log_handshake_start(&peer.to_string(), "initiator", "IKEv2");

        let pos = self.sas.len() - 1;
        let kind = PendingKind::SaInit {
            offered: policy.attributes.clone(),
            cookie: None,
        };
        let state = HandleState {
            nonce,
            dh: Some(pair.private),
            child: Some(child),
        };
        match self.send_sa_init(pos, kind, &pair.public, state, now) {
            Ok(d) => {
                let timeout = self.half_open_timeout();
                self.timers
                    .schedule(Ikev2Event::HalfOpenTimeout, id, 0, timeout, now);
                Ok(d)
            }
            Err(e) => {
                self.sas.remove(pos);
                Err(e)
            }
        }
    }

    /// Re-key an established IKE SA
    pub fn rekey_ike(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &mut self.sas[pos];
        if sa.state != IkeSaState::Established {
            return Err(Error::InvalidState(format!(
                "cannot re-key IKE SA in state {}",
                sa.state.name()
            )));
        }
        if !sa.ike_rekey_pending() {
            sa.queued.push_back(QueuedRequest::RekeyIke);
        }
        Ok(self.drain(spd, id, now))
    }

    /// Delete an IKE SA and its child SAs
    ///
    /// Children are removed locally at once; the peer is told with a
    /// Delete payload and the IKE SA goes when the peer answers.
    pub fn delete_ike_sa(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        if !self.sas[pos].state.is_established() {
            self.remove_sa(spd, pos, true);
            return Ok(Vec::new());
        }
        let sa = &mut self.sas[pos];
        remove_children(spd, &sa.installed());
        sa.children.clear();
        sa.queued.clear();
        sa.queued.push_back(QueuedRequest::Info(InfoRequest::DeleteIke));
        Ok(self.drain(spd, id, now))
    }

    /// Delete child SA pairs by our inbound SPIs and tell the peer
    pub fn delete_children(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        protocol: IpsecProtocol,
        inbound_spis: &[u32],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &mut self.sas[pos];
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
                "no child SA with inbound SPI {:08x?}",
                inbound_spis
            )));
        }
        remove_children(spd, &removed);
        sa.queued
            .push_back(QueuedRequest::Info(InfoRequest::DeleteChildren {
                protocol: protocol_id(protocol),
                spis: removed.iter().map(|p| p.inbound_spi).collect(),
            }));
        Ok(self.drain(spd, id, now))
    }

    /// Send an empty INFORMATIONAL request
    pub fn send_liveness(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let pos = self.pos(id)?;
        let sa = &mut self.sas[pos];
        if !sa.state.is_established() {
            return Err(Error::InvalidState("liveness check on a half-open IKE SA".into()));
        }
        logging::log_liveness_probe(&sa.peer.to_string());
        sa.queued
            .push_back(QueuedRequest::Info(InfoRequest::Liveness));
        Ok(self.drain(spd, id, now))
    }

    /// Send the next queued request when the window is free
    fn drain(&mut self, spd: &mut SecurityPolicyDb, id: u64, now: Instant) -> Vec<Datagram> {
        let mut out = Vec::new();
        loop {
            let Ok(pos) = self.pos(id) else {
                break;
            };
            let sa = &mut self.sas[pos];
            if sa.pending.is_some() {
                break;
            }
            let allowed = match sa.queued.front() {
                None => break,
                Some(QueuedRequest::Info(_)) => {
                    sa.state.is_established() || sa.state == IkeSaState::Replaced
                }
                Some(_) => sa.state == IkeSaState::Established,
            };
            if !allowed {
                break;
            }
            let Some(request) = sa.queued.pop_front() else {
                break;
            };
            let sent = match request {
                QueuedRequest::Child(child) => self.send_child_request(spd, pos, child, now),
                QueuedRequest::RekeyIke => self.send_ike_rekey(pos, now),
                QueuedRequest::Info(info) => self.send_info(pos, info, now),
            };
            match sent {
                Ok(d) => {
                    out.push(d);
                    break;
                }
                Err(e) => tracing::warn!(ike_sa = id, error = %e, "Queued request failed"),
            }
        }
        out
    }

    fn send_request(
        &mut self,
        pos: usize,
        kind: PendingKind,
        payloads: Vec<Payload>,
        state: HandleState,
        now: Instant,
    ) -> Result<Datagram> {
        let provider = Arc::clone(&self.provider);
        let sa = &mut self.sas[pos];
        let exchange = kind.exchange_type();
        let message_id = sa.next_message_id;
        let data = sa.seal(&*provider, exchange, message_id, false, &payloads)?;
        sa.take_message_id();

        let mut handle = ExchangeHandle::new(kind, message_id, data.clone());
        handle.nonce = state.nonce;
        handle.dh = state.dh;
        handle.child = state.child;
        sa.pending = Some(handle);

        let (id, peer) = (sa.id, sa.peer);
        self.timers.schedule(
            Ikev2Event::Retransmit,
            id,
            0,
            self.config.exchange_timeout,
            now,
        );
        logging::log_message_send(exchange_name(exchange), &peer.to_string(), data.len());
        Ok(Datagram { peer, data })
    }

    fn send_sa_init(
        &mut self,
        pos: usize,
        kind: PendingKind,
        public: &[u8],
        state: HandleState,
        now: Instant,
    ) -> Result<Datagram> {
        let PendingKind::SaInit { offered, cookie } = &kind else {
            return Err(Error::Internal("IKE_SA_INIT without offer".into()));
        };
        let first = offered
            .first()
            .ok_or_else(|| Error::InvalidParameter("IKE policy without suites".into()))?;

        let sa = &mut self.sas[pos];
        let mut msg = IkeMessage::new(sa.header(ExchangeType::IkeSaInit, 0, false));
        if let Some(cookie) = cookie {
            msg.push(Payload::Notify(NotifyPayload::new(
                NotifyType::Cookie.to_u16(),
                cookie.clone(),
            )));
        }
        msg.push(Payload::Sa(construct_ike_proposals(offered, &[])));
        msg.push(Payload::Ke(KePayload {
            dh_group: first.group.number(),
            key_data: public.to_vec(),
        }));
        msg.push(Payload::Nonce(NoncePayload::new(state.nonce.clone())?));
        let data = msg.encode();

        sa.init.request = data.clone();
        sa.init.ni = state.nonce.clone();
        sa.next_message_id = 1;
        let mut handle = ExchangeHandle::new(kind, 0, data.clone());
        handle.nonce = state.nonce;
        handle.dh = state.dh;
        handle.child = state.child;
        sa.pending = Some(handle);

        let (id, peer) = (sa.id, sa.peer);
        self.timers.cancel_matching(&Ikev2Event::Retransmit, id, 0, CancelScope::Exact);
        self.timers.schedule(
            Ikev2Event::Retransmit,
            id,
            0,
            self.config.exchange_timeout,
            now,
        );
        logging::log_message_send("IKE_SA_INIT", &peer.to_string(), data.len());
        Ok(Datagram { peer, data })
    }

    fn send_auth(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        child: Option<ChildRequest>,
        now: Instant,
    ) -> Result<Datagram> {
        let provider = Arc::clone(&self.provider);
        let identities = Arc::clone(&self.identities);
        let policy = self.policy(&self.sas[pos].policy)?;
        let sa = &self.sas[pos];
        let initial_contact = self.config.send_initial_contact
            && !self
                .sas
                .iter()
                .any(|s| s.id != sa.id && s.peer == sa.peer && s.state.is_established());

        let keys = sa.keys()?;
        let idi = IdPayload {
            id: sa.local_id.clone(),
        };
        let octets = signed_octets(
            &*provider,
            sa.suite.prf,
            &sa.init.request,
            &sa.init.nr,
            &keys.sk_pi,
            &idi,
        )?;
        let auth = AuthContext {
            provider: &*provider,
            prf: sa.suite.prf,
            store: &*identities,
            method: sa.suite.auth,
            peer_addr: sa.peer,
        }
        .build(&sa.local_id, policy.peer_id.as_ref(), &octets)?;

        let mut payloads = vec![Payload::IdI(idi)];
        if let Some(peer_id) = &policy.peer_id {
            payloads.push(Payload::IdR(IdPayload {
                id: peer_id.clone(),
            }));
        }
        payloads.push(Payload::Auth(auth));
        if initial_contact {
            payloads.push(Payload::Notify(NotifyPayload::new(
                NotifyType::InitialContact.to_u16(),
                Vec::new(),
            )));
        }

        let peer = sa.peer;
        let child = match child {
            Some(mut request) => {
                let offer = build_offer(&*provider, spd, &mut request, peer)?;
                payloads.extend(offer.payloads(Vec::new()));
                Some(request)
            }
            None => None,
        };
        let state = HandleState {
            child,
            ..HandleState::default()
        };
        self.send_request(pos, PendingKind::Auth, payloads, state, now)
    }

    fn send_child_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        mut request: ChildRequest,
        now: Instant,
    ) -> Result<Datagram> {
        let provider = Arc::clone(&self.provider);
        let nonce = self.random_nonce()?;
        let peer = self.sas[pos].peer;
        let offer = build_offer(&*provider, spd, &mut request, peer)?;

        let mut middle = vec![Payload::Nonce(NoncePayload::new(nonce.clone())?)];
        let mut dh = None;
        if let Some(group) = request.pfs {
            let pair = provider.dh_generate(group)?;
            middle.push(Payload::Ke(KePayload {
                dh_group: group.number(),
                key_data: pair.public,
            }));
            dh = Some(pair.private);
        }

        let mut payloads = Vec::new();
        if let Some(old) = request.rekey.as_ref().and_then(|pairs| pairs.first()) {
            payloads.push(Payload::Notify(NotifyPayload::for_child(
                NotifyType::RekeySa.to_u16(),
                protocol_id(old.protocol),
                old.inbound_spi,
            )));
        }
        payloads.extend(offer.payloads(middle));

        exchange_step(&self.sas[pos], ExchangeState::CreateChildI)?;
        let state = HandleState {
            nonce,
            dh,
            child: Some(request),
        };
        self.send_request(pos, PendingKind::CreateChild, payloads, state, now)
    }

    fn send_ike_rekey(&mut self, pos: usize, now: Instant) -> Result<Datagram> {
        let new_spi = self.random_spi()?;
        let nonce = self.random_nonce()?;
        let sa = &self.sas[pos];
        let suite = sa.suite;
        let pair = self.provider.dh_generate(suite.group)?;
        logging::log_ike_rekey_start(&sa.initiator_spi, &sa.responder_spi);

        let offered = vec![suite];
        let payloads = vec![
            Payload::Sa(construct_ike_proposals(&offered, &new_spi)),
            Payload::Nonce(NoncePayload::new(nonce.clone())?),
            Payload::Ke(KePayload {
                dh_group: suite.group.number(),
                key_data: pair.public,
            }),
        ];
        let state = HandleState {
            nonce,
            dh: Some(pair.private),
            child: None,
        };
        let d = self.send_request(
            pos,
            PendingKind::RekeyIke { new_spi, offered },
            payloads,
            state,
            now,
        )?;
        self.sas[pos].transition_to(IkeSaState::Rekeying)?;
        Ok(d)
    }

    fn send_info(&mut self, pos: usize, request: InfoRequest, now: Instant) -> Result<Datagram> {
        let payloads = match &request {
            InfoRequest::Liveness => Vec::new(),
            InfoRequest::DeleteIke => vec![Payload::Delete(DeletePayload::ike())],
            InfoRequest::DeleteChildren { protocol, spis } => {
                vec![Payload::Delete(DeletePayload::child(*protocol, spis))]
            }
        };
        let deletes_ike = request == InfoRequest::DeleteIke;
        let d = self.send_request(
            pos,
            PendingKind::Info(request),
            payloads,
            HandleState::default(),
            now,
        )?;
        if deletes_ike {
            self.sas[pos].transition_to(IkeSaState::WaitDelete)?;
        }
        Ok(d)
    }

    // ----------------------------------------------------------------
    // Received messages
    // ----------------------------------------------------------------

    /// Process a received datagram
    ///
    /// # Returns
    ///
    /// Datagrams to send: the answer to a request, follow-up requests, or
    /// nothing.
    ///
    /// # Errors
    ///
    /// The message is dropped without an answer when it is malformed,
    /// fails its integrity check, matches no IKE SA, comes from another
    /// address than the SA's peer or has an unexpected message ID.
    pub fn handle_message(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let msg = IkeMessage::decode(data)?;
        let raw = &data[..msg.header.length as usize];
        logging::log_message_recv(
            exchange_name(msg.header.exchange_type),
            &src.to_string(),
            raw.len(),
        );

        if msg.header.exchange_type == ExchangeType::IkeSaInit && !msg.is_response() {
            return self.on_sa_init_request(src, raw, &msg, now);
        }
        let id = self.lookup(&msg.header, src)?;
        if msg.is_response() {
            self.handle_response(spd, id, raw, &msg, now)
        } else {
            self.handle_request(spd, id, raw, &msg, now)
        }
    }

    /// Find the IKE SA a message belongs to
    ///
    /// A zero peer SPI in the SA table means "not yet assigned" and
    /// matches any.
    fn lookup(&self, header: &IkeHeader, src: IpAddr) -> Result<u64> {
        let from_initiator = header.flags.is_initiator();
        let (local, peer) = if from_initiator {
            (header.responder_spi, header.initiator_spi)
        } else {
            (header.initiator_spi, header.responder_spi)
        };
        let sa = self
            .sas
            .iter()
            .find(|sa| {
                sa.is_initiator != from_initiator
                    && sa.local_spi() == local
                    && (sa.peer_spi() == peer || sa.peer_spi() == [0u8; 8])
            })
            .ok_or_else(|| Error::SaNotFound(format!("IKE SPI {}", hex::encode(local))))?;
        if sa.peer != src {
            return Err(Error::AddressMismatch {
                expected: sa.peer,
                actual: src,
            });
        }
        Ok(sa.id)
    }

    fn handle_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        raw: &[u8],
        msg: &IkeMessage,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let pos = self.pos(id)?;
        let sa = &self.sas[pos];
        let message_id = msg.header.message_id;
        if let Some((saved_id, saved)) = &sa.last_response {
            if *saved_id == message_id {
                logging::log_duplicate_request(&sa.peer.to_string(), message_id);
                return Ok(vec![Datagram {
                    peer: sa.peer,
                    data: saved.clone(),
                }]);
            }
        }
        if message_id != sa.peer_message_id {
            return Err(Error::InvalidMessageId {
                expected: sa.peer_message_id,
                actual: message_id,
            });
        }
        let payloads = sa.open(&*provider, raw, msg)?;

        let exchange = msg.header.exchange_type;
        let outcome = match exchange {
            ExchangeType::IkeAuth => self.on_auth_request(spd, id, &payloads, now),
            ExchangeType::CreateChildSa => self.on_create_child_request(spd, id, &payloads, now),
            ExchangeType::Informational => self.on_info_request(spd, id, &payloads),
            ExchangeType::IkeSaInit => Err(Error::InvalidMessage(
                "IKE_SA_INIT request on an existing IKE SA".into(),
            )),
        };

        let pos = self.pos(id)?;
        let mut out = Vec::new();
        match outcome {
            Ok(reply) => {
                out.push(self.respond(pos, exchange, message_id, &reply.payloads)?);
                if reply.close {
                    self.remove_sa(spd, pos, true);
                    return Ok(out);
                }
            }
            Err(e) => {
                let Some(payloads) = error_payloads(&e) else {
                    return Err(e);
                };
                logging::log_handshake_failed(&self.sas[pos].peer.to_string(), &e);
                out.push(self.respond(pos, exchange, message_id, &payloads)?);
                if exchange == ExchangeType::IkeAuth {
                    self.remove_sa(spd, pos, true);
                    return Ok(out);
                }
            }
        }
        out.extend(self.drain(spd, id, now));
        Ok(out)
    }

    fn respond(
        &mut self,
        pos: usize,
        exchange: ExchangeType,
        message_id: u32,
        payloads: &[Payload],
    ) -> Result<Datagram> {
        let provider = Arc::clone(&self.provider);
        let sa = &mut self.sas[pos];
        let data = sa.seal(&*provider, exchange, message_id, true, payloads)?;
        sa.last_response = Some((message_id, data.clone()));
        sa.peer_message_id = message_id.wrapping_add(1);
        logging::log_message_send(exchange_name(exchange), &sa.peer.to_string(), data.len());
        Ok(Datagram {
            peer: sa.peer,
            data,
        })
    }

    fn handle_response(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        raw: &[u8],
        msg: &IkeMessage,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let provider = Arc::clone(&self.provider);
        let pos = self.pos(id)?;
        let sa = &mut self.sas[pos];
        let message_id = msg.header.message_id;
        let exchange = msg.header.exchange_type;
        match &sa.pending {
            Some(h) if h.message_id == message_id && h.kind.exchange_type() == exchange => {}
            pending => {
                return Err(Error::InvalidMessageId {
                    expected: pending
                        .as_ref()
                        .map_or(sa.next_message_id.wrapping_sub(1), |h| h.message_id),
                    actual: message_id,
                })
            }
        }
        let payloads = if exchange == ExchangeType::IkeSaInit {
            msg.payloads.clone()
        } else {
            sa.open(&*provider, raw, msg)?
        };
        let Some(handle) = sa.pending.take() else {
            return Err(Error::Internal("pending request vanished".into()));
        };
        self.timers
            .cancel_matching(&Ikev2Event::Retransmit, id, 0, CancelScope::Exact);

        let rekey_ike = matches!(handle.kind, PendingKind::RekeyIke { .. });
        let mut out = Vec::new();
        match (exchange, rekey_ike) {
            (ExchangeType::IkeSaInit, _) => {
                match self.on_sa_init_response(spd, pos, handle, msg, raw, now) {
                    Ok(d) => out.push(d),
                    Err(e) => {
                        self.fail(spd, id, &e);
                        return Err(e);
                    }
                }
            }
            (ExchangeType::IkeAuth, _) => {
                if let Err(e) = self.on_auth_response(spd, pos, handle, &payloads, now) {
                    self.fail(spd, id, &e);
                    return Err(e);
                }
            }
            (ExchangeType::CreateChildSa, false) => {
                if let Err(e) = self.on_create_child_response(spd, pos, handle, &payloads, now) {
                    logging::log_handshake_failed(&self.sas[pos].peer.to_string(), &e);
                }
            }
            (ExchangeType::CreateChildSa, true) => {
                match self.on_ike_rekey_response(pos, handle, &payloads, now) {
                    Ok(new_id) => out.extend(self.drain(spd, new_id, now)),
                    Err(e) => {
                        logging::log_handshake_failed(&self.sas[pos].peer.to_string(), &e);
                        self.sas[pos].transition_to(IkeSaState::Established)?;
                    }
                }
            }
            (ExchangeType::Informational, _) => {
                if let PendingKind::Info(request) = handle.kind {
                    self.on_info_response(spd, pos, request, &payloads);
                }
            }
        }
        out.extend(self.drain(spd, id, now));
        Ok(out)
    }

    // ----------------------------------------------------------------
    // IKE_SA_INIT / IKE_AUTH
    // ----------------------------------------------------------------

    fn on_sa_init_request(
        &mut self,
        src: IpAddr,
        raw: &[u8],
        msg: &IkeMessage,
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let header = &msg.header;
        if header.message_id != 0 {
            return Err(Error::InvalidMessageId {
                expected: 0,
                actual: header.message_id,
            });
        }
        if let Some(sa) = self
            .sas
            .iter()
            .find(|s| !s.is_initiator && s.initiator_spi == header.initiator_spi && s.peer == src)
        {
            return match &sa.last_response {
                Some((0, saved)) => {
                    logging::log_duplicate_request(&src.to_string(), 0);
                    Ok(vec![Datagram {
                        peer: src,
                        data: saved.clone(),
                    }])
                }
                _ => Err(Error::InvalidState(
                    "IKE_SA_INIT repeated on an established IKE SA".into(),
                )),
            };
        }

        let policy = self
            .policies
            .iter()
            .find(|p| p.matches_peer(src))
            .cloned()
            .ok_or(Error::PolicyNotFound)?;
        let offered = proposals(&msg.payloads)?;
        let ke = key_exchange(&msg.payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
        let ni = peer_nonce(&msg.payloads)?.to_vec();
        logging::log_handshake_start(&src.to_string(), "responder", "IKEv2");

        let selection = match select_ike_proposal(&policy.attributes, offered, Some(ke.dh_group)) {
            Ok(selection) => selection,
            Err(e) => {
                let Some(mut notify) = error_payloads(&e) else {
                    return Err(e);
                };
                logging::log_handshake_failed(&src.to_string(), &e);
                let data = plain_notify(header, notify.remove(0));
                return Ok(vec![Datagram { peer: src, data }]);
            }
        };
        let suite = selection.suite;

        let provider = Arc::clone(&self.provider);
        let spi_r = self.random_spi()?;
        let nr = self.random_nonce()?;
        let pair = provider.dh_generate(suite.group)?;
        let shared = provider.dh_compute(pair.private, &ke.key_data)?;
        let seed = skeyseed(&*provider, suite.prf, &ni, &nr, &shared)?;
        let keys = derive_ike_keys(
            &*provider,
            &suite,
            &seed,
            &ni,
            &nr,
            &header.initiator_spi,
            &spi_r,
        )?;

        let id = self.allocate_id();
        let mut sa = IkeSa::new(
            id,
            false,
            (header.initiator_spi, spi_r),
            src,
            &policy.name,
            suite,
            policy.local_id.clone(),
        );
        sa.keys = Some(keys);

        let mut response = IkeMessage::new(sa.header(ExchangeType::IkeSaInit, 0, true));
        response.push(Payload::Sa(vec![selection.proposal]));
        response.push(Payload::Ke(KePayload {
            dh_group: suite.group.number(),
            key_data: pair.public,
        }));
        response.push(Payload::Nonce(NoncePayload::new(nr.clone())?));
        let data = response.encode();

        sa.init.request = raw.to_vec();
        sa.init.response = data.clone();
        sa.init.ni = ni;
        sa.init.nr = nr;
        sa.last_response = Some((0, data.clone()));
        sa.peer_message_id = 1;
        sa.advance()?;
        self.sas.push(sa);

        let timeout = self.half_open_timeout();
        self.timers
            .schedule(Ikev2Event::HalfOpenTimeout, id, 0, timeout, now);
        logging::log_message_send("IKE_SA_INIT", &src.to_string(), data.len());
        Ok(vec![Datagram { peer: src, data }])
    }

    fn on_sa_init_response(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        handle: ExchangeHandle,
        msg: &IkeMessage,
        raw: &[u8],
        now: Instant,
    ) -> Result<Datagram> {
        let ExchangeHandle {
            kind,
            nonce,
            dh,
            child,
            ..
        } = handle;
        let PendingKind::SaInit { offered, cookie } = kind else {
            return Err(Error::Internal("IKE_SA_INIT response without offer".into()));
        };

        let flags = process_notifies(&msg.payloads);
        if let Some(err) = &flags.error {
            if err.notify_type != NotifyType::InvalidKePayload.to_u16() {
                return Err(Error::Notified(err.notify_type));
            }
            let group = <[u8; 2]>::try_from(err.data.as_slice())
                .ok()
                .map(u16::from_be_bytes)
                .and_then(crate::crypto::DhGroup::from_number)
                .ok_or(Error::Notified(err.notify_type))?;
            let mut offered = offered;
            offered.sort_by_key(|s| s.group != group);
            let current = dh.as_ref().map(|d| d.group());
            if offered.first().map(|s| s.group) != Some(group) || current == Some(group) {
                return Err(Error::Notified(err.notify_type));
            }
            tracing::info!(group = group.number(), "Responder asked for another DH group");
            let pair = self.provider.dh_generate(group)?;
            let state = HandleState {
                nonce,
                dh: Some(pair.private),
                child,
            };
            let kind = PendingKind::SaInit { offered, cookie };
            return self.send_sa_init(pos, kind, &pair.public, state, now);
        }
        if let Some(data) = flags.cookie {
            if cookie.is_some() {
                return Err(Error::InvalidState("responder repeated its COOKIE request".into()));
            }
            let group = offered
                .first()
                .map(|s| s.group)
                .ok_or_else(|| Error::Internal("empty IKE offer".into()))?;
            let pair = self.provider.dh_generate(group)?;
            let state = HandleState {
                nonce,
                dh: Some(pair.private),
                child,
            };
            let kind = PendingKind::SaInit {
                offered,
                cookie: Some(data),
            };
            return self.send_sa_init(pos, kind, &pair.public, state, now);
        }

        let suite = accepted_ike_suite(&offered, proposals(&msg.payloads)?)?;
        let ke = key_exchange(&msg.payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
        let nr = peer_nonce(&msg.payloads)?.to_vec();
        let dh = dh.ok_or_else(|| Error::Internal("no DH value for IKE_SA_INIT".into()))?;
        if ke.dh_group != suite.group.number() || dh.group() != suite.group {
            return Err(Error::InvalidPayload(format!(
                "KE group {} does not match the accepted suite",
                ke.dh_group
            )));
        }
        if msg.header.responder_spi == [0u8; 8] {
            return Err(Error::InvalidMessage("IKE_SA_INIT response without responder SPI".into()));
        }

        let provider = Arc::clone(&self.provider);
        let shared = provider.dh_compute(dh, &ke.key_data)?;
        let sa = &mut self.sas[pos];
        sa.responder_spi = msg.header.responder_spi;
        sa.suite = suite;
        let seed = skeyseed(&*provider, suite.prf, &nonce, &nr, &shared)?;
        sa.keys = Some(derive_ike_keys(
            &*provider,
            &suite,
            &seed,
            &nonce,
            &nr,
            &sa.initiator_spi,
            &sa.responder_spi,
        )?);
        sa.init.response = raw.to_vec();
        sa.init.nr = nr;
        sa.advance()?;

        self.send_auth(spd, pos, child, now)
    }

    fn on_auth_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<Reply> {
        let provider = Arc::clone(&self.provider);
        let identities = Arc::clone(&self.identities);
        let pos = self.pos(id)?;
        let policy = self.policy(&self.sas[pos].policy)?;
        if self.sas[pos].exchange_state != ExchangeState::AuthR {
            return Err(Error::InvalidState("IKE_AUTH outside of the handshake".into()));
        }

        let flags = process_notifies(payloads);
        flags.request_error()?;
        let idi = identity(payloads, true).ok_or_else(|| Error::MissingPayload("IDi".into()))?;
        let auth = auth_payload(payloads).ok_or_else(|| Error::MissingPayload("AUTH".into()))?;
        if let Some(expected) = &policy.peer_id {
            if expected != &idi.id {
                return Err(Error::AuthenticationFailed(format!(
                    "peer identified as {}",
                    idi.id
                )));
            }
        }

        let (peer, idr, our_auth) = {
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let ctx = AuthContext {
                provider: &*provider,
                prf: sa.suite.prf,
                store: &*identities,
                method: sa.suite.auth,
                peer_addr: sa.peer,
            };
            let octets = signed_octets(
                &*provider,
                sa.suite.prf,
                &sa.init.request,
                &sa.init.nr,
                &keys.sk_pi,
                idi,
            )?;
            ctx.verify(&idi.id, auth, &octets)?;

            let idr = IdPayload {
                id: sa.local_id.clone(),
            };
            let octets = signed_octets(
                &*provider,
                sa.suite.prf,
                &sa.init.response,
                &sa.init.ni,
                &keys.sk_pr,
                &idr,
            )?;
            let our_auth = ctx.build(&sa.local_id, Some(&idi.id), &octets)?;
            (sa.peer, idr, our_auth)
        };

        if flags.initial_contact {
            self.initial_contact(spd, id, peer, &policy.ipsec_group);
        }
        let pos = self.pos(id)?;
        let mut reply = vec![Payload::IdR(idr), Payload::Auth(our_auth)];

        let answer = ChildPayloads::find(payloads).and_then(|found| {
            let Some(found) = found else {
                return Ok(None);
            };
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let ctx = ChildContext {
                provider: &*provider,
                prf: sa.suite.prf,
                sk_d: &keys.sk_d,
                peer,
                now,
            };
            let input = KeyInput {
                shared: None,
                ni: &sa.init.ni,
                nr: &sa.init.nr,
            };
            answer_offer(&ctx, spd, &policy.ipsec_group, None, &found, None, input).map(Some)
        });
        match answer {
            Ok(Some((mut answer, bundle))) => {
                answer.transport &= flags.transport_mode;
                self.sas[pos].children.push(bundle);
                reply.extend(answer.payloads(Vec::new()));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Child SA in IKE_AUTH rejected");
                let notify = e.notify_type().unwrap_or(NotifyType::NoProposalChosen);
                reply.push(error_notify(notify, Vec::new()));
            }
        }

        let sa = &mut self.sas[pos];
        sa.peer_id = Some(idi.id.clone());
        sa.advance()?;
        self.establish(pos, now)?;
        Ok(Reply::new(reply))
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

    fn on_auth_response(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        handle: ExchangeHandle,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<()> {
        let provider = Arc::clone(&self.provider);
        let identities = Arc::clone(&self.identities);
        let policy = self.policy(&self.sas[pos].policy)?;
        self.sas[pos].advance()?;

        let flags = process_notifies(payloads);
        let Some(auth) = auth_payload(payloads) else {
            flags.response_error()?;
            return Err(Error::MissingPayload("AUTH".into()));
        };
        let idr = identity(payloads, false).ok_or_else(|| Error::MissingPayload("IDr".into()))?;
        if let Some(expected) = &policy.peer_id {
            if expected != &idr.id {
                return Err(Error::AuthenticationFailed(format!(
                    "peer identified as {}",
                    idr.id
                )));
            }
        }
        {
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let octets = signed_octets(
                &*provider,
                sa.suite.prf,
                &sa.init.response,
                &sa.init.ni,
                &keys.sk_pr,
                idr,
            )?;
            AuthContext {
                provider: &*provider,
                prf: sa.suite.prf,
                store: &*identities,
                method: sa.suite.auth,
                peer_addr: sa.peer,
            }
            .verify(&idr.id, auth, &octets)?;
        }

        let sa = &mut self.sas[pos];
        sa.peer_id = Some(idr.id.clone());
        sa.advance()?;
        self.establish(pos, now)?;

        let Some(request) = handle.child else {
            return Ok(());
        };
        let bundle = ChildPayloads::find(payloads).and_then(|found| {
            let found = match found {
                Some(found) => found,
                None => {
                    flags.response_error()?;
                    return Err(Error::MissingPayload("SA".into()));
                }
            };
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let ctx = ChildContext {
                provider: &*provider,
                prf: sa.suite.prf,
                sk_d: &keys.sk_d,
                peer: sa.peer,
                now,
            };
            let input = KeyInput {
                shared: None,
                ni: &sa.init.ni,
                nr: &sa.init.nr,
            };
            accept_answer(&ctx, spd, &request, &found, input)
        });
        match bundle {
            Ok(bundle) => self.sas[pos].children.push(bundle),
            Err(e) => tracing::warn!(error = %e, "Child SA in IKE_AUTH not created"),
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // CREATE_CHILD_SA
    // ----------------------------------------------------------------

    fn on_create_child_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<Reply> {
        let provider = Arc::clone(&self.provider);
        let pos = self.pos(id)?;
        if self.sas[pos].state != IkeSaState::Established {
            return Err(Error::InvalidState(format!(
                "CREATE_CHILD_SA in state {}",
                self.sas[pos].state.name()
            )));
        }
        let flags = process_notifies(payloads);
        flags.request_error()?;
        if proposals(payloads)?.first().map(|p| p.protocol) == Some(ProtocolId::Ike) {
            return self.answer_ike_rekey(pos, payloads, now);
        }

        let policy = self.policy(&self.sas[pos].policy)?;
        let found = ChildPayloads::find(payloads)?
            .ok_or_else(|| Error::MissingPayload("TSi/TSr".into()))?;
        let ni = peer_nonce(payloads)?;
        let nr = self.random_nonce()?;
        let ke = key_exchange(payloads);

        let (our_ke, shared) = match (policy.pfs_group, ke) {
            (Some(group), Some(ke)) => {
                if ke.dh_group != group.number() {
                    return Err(Error::InvalidKePayload {
                        expected_group: group.number(),
                    });
                }
                let pair = provider.dh_generate(group)?;
                let shared = provider.dh_compute(pair.private, &ke.key_data)?;
                let our_ke = KePayload {
                    dh_group: group.number(),
                    key_data: pair.public,
                };
                (Some(our_ke), Some(shared))
            }
            _ => (None, None),
        };

        let (mut answer, bundle) = {
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let ctx = ChildContext {
                provider: &*provider,
                prf: sa.suite.prf,
                sk_d: &keys.sk_d,
                peer: sa.peer,
                now,
            };
            let input = KeyInput {
                shared: shared.as_ref().map(|s| s.as_slice()),
                ni,
                nr: &nr,
            };
            answer_offer(
                &ctx,
                spd,
                &policy.ipsec_group,
                policy.pfs_group,
                &found,
                ke.map(|k| k.dh_group),
                input,
            )?
        };
        answer.transport &= flags.transport_mode;

        let sa = &mut self.sas[pos];
        if let Some((protocol, spi)) = flags.rekey {
            if let Some(b) = sa.bundle_by_outbound(spi, protocol) {
                sa.children[b].rekeying = true;
            }
        }
        sa.children.push(bundle);
        exchange_step(sa, ExchangeState::CreateChildR)?;

        let mut middle = vec![Payload::Nonce(NoncePayload::new(nr)?)];
        if let Some(ke) = our_ke {
            middle.push(Payload::Ke(ke));
        }
        Ok(Reply::new(answer.payloads(middle)))
    }

    fn on_create_child_response(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        handle: ExchangeHandle,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<()> {
        exchange_step(&self.sas[pos], ExchangeState::CreateChildI)?;
        let ExchangeHandle {
            nonce, dh, child, ..
        } = handle;
        let old = child
            .as_ref()
            .and_then(|c| c.rekey.as_ref())
            .and_then(|pairs| pairs.first())
            .map(|p| (p.outbound_spi, protocol_id(p.protocol)));

        let state = HandleState { nonce, dh, child };
        let result = self.complete_child(spd, pos, state, payloads, now);
        if result.is_err() {
            if let Some((spi, protocol)) = old {
                let sa = &mut self.sas[pos];
                if let Some(b) = sa.bundle_by_outbound(spi, protocol) {
                    sa.children[b].rekeying = false;
                }
            }
        }
        result
    }

    fn complete_child(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        state: HandleState,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<()> {
        let provider = Arc::clone(&self.provider);
        let HandleState { nonce, dh, child } = state;
        let request =
            child.ok_or_else(|| Error::Internal("CREATE_CHILD_SA without request".into()))?;
        process_notifies(payloads).response_error()?;
        let found = ChildPayloads::find(payloads)?
            .ok_or_else(|| Error::MissingPayload("SA".into()))?;
        let nr = peer_nonce(payloads)?;

        let shared = match request.pfs {
            Some(group) => {
                let ke = key_exchange(payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
                if ke.dh_group != group.number() {
                    return Err(Error::InvalidPayload(format!(
                        "KE group {} instead of {}",
                        ke.dh_group,
                        group.number()
                    )));
                }
                let dh = dh.ok_or_else(|| Error::Internal("no DH value for PFS".into()))?;
                Some(provider.dh_compute(dh, &ke.key_data)?)
            }
            None => None,
        };

        let bundle = {
            let sa = &self.sas[pos];
            let keys = sa.keys()?;
            let ctx = ChildContext {
                provider: &*provider,
                prf: sa.suite.prf,
                sk_d: &keys.sk_d,
                peer: sa.peer,
                now,
            };
            let input = KeyInput {
                shared: shared.as_ref().map(|s| s.as_slice()),
                ni: &nonce,
                nr,
            };
            accept_answer(&ctx, spd, &request, &found, input)?
        };
        self.sas[pos].children.push(bundle);
        if let Some(old) = &request.rekey {
            self.retire_pairs(spd, pos, old);
        }
        exchange_step(&self.sas[pos], ExchangeState::CreateChildIResponse)?;
        Ok(())
    }

    /// Remove re-keyed pairs locally and queue their deletion at the peer
    fn retire_pairs(&mut self, spd: &mut SecurityPolicyDb, pos: usize, old: &[InstalledChild]) {
        let sa = &mut self.sas[pos];
        for bundle in &mut sa.children {
            bundle.pairs.retain(|p| {
                !old
                    .iter()
                    .any(|o| o.inbound_spi == p.inbound_spi && o.protocol == p.protocol)
            });
        }
        sa.children.retain(|b| !b.pairs.is_empty());
        remove_children(spd, old);

        for protocol in [IpsecProtocol::Ah, IpsecProtocol::Esp] {
            let spis: Vec<u32> = old
                .iter()
                .filter(|p| p.protocol == protocol)
                .map(|p| p.inbound_spi)
                .collect();
            if !spis.is_empty() {
                sa.queued
                    .push_back(QueuedRequest::Info(InfoRequest::DeleteChildren {
                        protocol: protocol_id(protocol),
                        spis,
                    }));
            }
        }
    }

    // ----------------------------------------------------------------
    // IKE SA re-key
    // ----------------------------------------------------------------

    fn answer_ike_rekey(
        &mut self,
        pos: usize,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<Reply> {
        let provider = Arc::clone(&self.provider);
        let policy = self.policy(&self.sas[pos].policy)?;
        let ke = key_exchange(payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
        let ni = peer_nonce(payloads)?;
        let selection =
            select_ike_proposal(&policy.attributes, proposals(payloads)?, Some(ke.dh_group))?;
        let peer_spi = ike_spi(&selection.proposal.spi)?;
        let our_spi = self.random_spi()?;
        let nr = self.random_nonce()?;
        let suite = selection.suite;
        let pair = provider.dh_generate(suite.group)?;
        let shared = provider.dh_compute(pair.private, &ke.key_data)?;

        let id = self.allocate_id();
        let old = &self.sas[pos];
        let seed = skeyseed_rekey(&*provider, old.suite.prf, &old.keys()?.sk_d, &shared, ni, &nr)?;
        let mut new_sa = IkeSa::new(
            id,
            false,
            (peer_spi, our_spi),
            old.peer,
            &old.policy,
            suite,
            old.local_id.clone(),
        );
        new_sa.keys = Some(derive_ike_keys(
            &*provider, &suite, &seed, ni, &nr, &peer_spi, &our_spi,
        )?);
        new_sa.peer_id = old.peer_id.clone();
        new_sa.exchange_state = ExchangeState::Complete;
        self.replace_sa(pos, new_sa, now)?;

        let mut proposal = selection.proposal;
        proposal.spi = our_spi.to_vec();
        Ok(Reply::new(vec![
            Payload::Sa(vec![proposal]),
            Payload::Nonce(NoncePayload::new(nr)?),
            Payload::Ke(KePayload {
                dh_group: suite.group.number(),
                key_data: pair.public,
            }),
        ]))
    }

    fn on_ike_rekey_response(
        &mut self,
        pos: usize,
        handle: ExchangeHandle,
        payloads: &[Payload],
        now: Instant,
    ) -> Result<u64> {
        let provider = Arc::clone(&self.provider);
        let ExchangeHandle {
            kind, nonce, dh, ..
        } = handle;
        let PendingKind::RekeyIke { new_spi, offered } = kind else {
            return Err(Error::Internal("IKE SA re-key response without offer".into()));
        };
        process_notifies(payloads).response_error()?;
        let answer = proposals(payloads)?;
        let suite = accepted_ike_suite(&offered, answer)?;
        let peer_spi = ike_spi(&answer[0].spi)?;
        let ke = key_exchange(payloads).ok_or_else(|| Error::MissingPayload("KE".into()))?;
        let nr = peer_nonce(payloads)?;
        if ke.dh_group != suite.group.number() {
            return Err(Error::InvalidPayload(format!(
                "KE group {} does not match the accepted suite",
                ke.dh_group
            )));
        }
        let dh = dh.ok_or_else(|| Error::Internal("no DH value for IKE SA re-key".into()))?;
        let shared = provider.dh_compute(dh, &ke.key_data)?;

        let id = self.allocate_id();
        let old = &self.sas[pos];
        let seed =
            skeyseed_rekey(&*provider, old.suite.prf, &old.keys()?.sk_d, &shared, &nonce, nr)?;
        let mut new_sa = IkeSa::new(
            id,
            true,
            (new_spi, peer_spi),
            old.peer,
            &old.policy,
            suite,
            old.local_id.clone(),
        );
        new_sa.keys = Some(derive_ike_keys(
            &*provider, &suite, &seed, &nonce, nr, &new_spi, &peer_spi,
        )?);
        new_sa.peer_id = old.peer_id.clone();
        new_sa.exchange_state = ExchangeState::Complete;
        self.replace_sa(pos, new_sa, now)?;

        self.sas[pos]
            .queued
            .push_back(QueuedRequest::Info(InfoRequest::DeleteIke));
        Ok(id)
    }

    /// Move children and queued work from the SA at `pos` to its
    /// replacement
    fn replace_sa(&mut self, pos: usize, mut new_sa: IkeSa, now: Instant) -> Result<()> {
        let linger = self.half_open_timeout();
        let old = &mut self.sas[pos];
        new_sa.children = std::mem::take(&mut old.children);
        new_sa.queued = old
            .queued
            .drain(..)
            .filter(|q| *q != QueuedRequest::RekeyIke)
            .collect();
        new_sa.transition_to(IkeSaState::Established)?;
        old.replaced_by = Some(new_sa.id);
        old.transition_to(IkeSaState::Replaced)?;
        logging::log_ike_rekey_complete(
            &old.initiator_spi,
            &new_sa.initiator_spi,
            &new_sa.responder_spi,
        );

        // the replaced SA only waits for its deletion
        let old_id = old.id;
        self.timers.cancel_subject(old_id, 0);
        self.timers
            .schedule(Ikev2Event::HardLifetime, old_id, 0, linger, now);

        let (new_id, suite) = (new_sa.id, new_sa.suite);
        self.sas.push(new_sa);
        self.schedule_lifetime(new_id, &suite, now);
        Ok(())
    }

    // ----------------------------------------------------------------
    // INFORMATIONAL
    // ----------------------------------------------------------------

    fn on_info_request(
        &mut self,
        spd: &mut SecurityPolicyDb,
        id: u64,
        payloads: &[Payload],
    ) -> Result<Reply> {
        let pos = self.pos(id)?;
        let flags = process_notifies(payloads);
        if let Some(err) = &flags.error {
            tracing::warn!(notify_type = err.notify_type, "Peer reported an error");
            // deletes in the same message are not processed
            flags.response_error()?;
        }
        if payloads.is_empty() {
            logging::log_liveness_probe(&self.sas[pos].peer.to_string());
            return Ok(Reply::new(Vec::new()));
        }

        let group = self.policy(&self.sas[pos].policy)?.ipsec_group;
        let mut reply = mirrored_notifies(&flags);
        let mut close = false;
        for delete in deletes(payloads) {
            if delete.protocol_id == ProtocolId::Ike.to_u8() {
                close = true;
                continue;
            }
            match remove_deleted_children(spd, &mut self.sas[pos], &group, delete) {
                Ok(Some(ours)) => reply.push(Payload::Delete(ours)),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed Delete payload"),
            }
        }
        if close {
            self.timers.cancel_subject(id, 0);
            reply.retain(|p| matches!(p, Payload::Notify(_)));
            return Ok(Reply {
                payloads: reply,
                close: true,
            });
        }
        Ok(Reply::new(reply))
    }

    fn on_info_response(
        &mut self,
        spd: &mut SecurityPolicyDb,
        pos: usize,
        request: InfoRequest,
        payloads: &[Payload],
    ) {
        match request {
            InfoRequest::DeleteIke => self.remove_sa(spd, pos, true),
            InfoRequest::DeleteChildren { protocol, spis } => {
                let answered = deletes(payloads).count();
                tracing::debug!(
                    protocol = protocol.to_u8(),
                    deleted = spis.len(),
                    answered,
                    "Child SA delete acknowledged"
                );
            }
            InfoRequest::Liveness => {
                tracing::debug!(peer = %self.sas[pos].peer, "Peer answered liveness check");
            }
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
                Ikev2Event::Retransmit => {
                    logging::log_timer_event("ike_retransmit", id);
                    let max_resend = self.config.max_resend;
                    let sa = &mut self.sas[pos];
                    let Some(handle) = sa.pending.as_mut() else {
                        continue;
                    };
                    if handle.resend_count >= max_resend {
                        let e = Error::InvalidState(format!(
                            "no answer after {} retransmissions",
                            max_resend
                        ));
                        self.fail(spd, id, &e);
                        continue;
                    }
                    handle.resend_count += 1;
                    out.push(Datagram {
                        peer: sa.peer,
                        data: handle.last_message.clone(),
                    });
                    self.timers.schedule(
                        Ikev2Event::Retransmit,
                        id,
                        0,
                        self.config.exchange_timeout,
                        now,
                    );
                }
                Ikev2Event::HalfOpenTimeout => {
                    logging::log_timer_event("ike_half_open", id);
                    if self.sas[pos].state == IkeSaState::Negotiating {
                        self.fail(spd, id, &Error::InvalidState("handshake timed out".into()));
                    }
                }
                Ikev2Event::SoftLifetime => {
                    logging::log_timer_event("ike_soft_lifetime", id);
                    let sa = &mut self.sas[pos];
                    if sa.state == IkeSaState::Established && !sa.ike_rekey_pending() {
                        sa.queued.push_back(QueuedRequest::RekeyIke);
                        out.extend(self.drain(spd, id, now));
                    }
                }
                Ikev2Event::HardLifetime => {
                    logging::log_timer_event("ike_hard_lifetime", id);
                    if let Some(d) = self.expire(spd, pos) {
                        out.push(d);
                    }
                }
            }
        }
        out
    }

    /// Hard expiry: tell the peer once, then drop the SA
    fn expire(&mut self, spd: &mut SecurityPolicyDb, pos: usize) -> Option<Datagram> {
        let provider = Arc::clone(&self.provider);
        let sa = &mut self.sas[pos];
        let notice = if sa.state.is_established() {
            let message_id = sa.take_message_id();
            match sa.seal(
                &*provider,
                ExchangeType::Informational,
                message_id,
                false,
                &[Payload::Delete(DeletePayload::ike())],
            ) {
                Ok(data) => Some(Datagram {
                    peer: sa.peer,
                    data,
                }),
                Err(e) => {
                    spd.errors().record("IKE SA hard lifetime", e);
                    None
                }
            }
        } else {
            None
        };
        self.remove_sa(spd, pos, true);
        notice
    }

    fn find_bundle(
        &self,
        peer: IpAddr,
        outbound_spi: u32,
        protocol: ProtocolId,
    ) -> Option<(usize, usize)> {
        self.sas.iter().enumerate().find_map(|(pos, sa)| {
            if sa.peer != peer || sa.replaced_by.is_some() {
                return None;
            }
            sa.bundle_by_outbound(outbound_spi, protocol).map(|b| (pos, b))
        })
    }

    /// React to child SA lifetime events of the policy database
    ///
    /// Soft expiry queues a re-key of the bundle, hard expiry tells the
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
                    let protocol = protocol_id(*protocol);
                    let Some((pos, b)) = self.find_bundle(*peer, *outbound_spi, protocol) else {
                        tracing::debug!(spi = outbound_spi, "Soft expiry of an unmanaged SA");
                        continue;
                    };
                    let pfs = self
                        .policy(&self.sas[pos].policy)
                        .ok()
                        .and_then(|p| p.pfs_group);
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
                    let request = ChildRequest {
                        group: group.clone(),
                        policy_index: first.policy_index,
                        selector: bundle.selector.clone(),
                        security,
                        inbound_spis: Vec::new(),
                        pfs,
                        rekey: Some(bundle.pairs.clone()),
                    };
                    let sa = &mut self.sas[pos];
                    sa.children[b].rekeying = true;
                    sa.queued.push_back(QueuedRequest::Child(request));
                    let id = sa.id;
                    out.extend(self.drain(spd, id, now));
                }
                SpdExpiry::HardLifetime {
                    removed,
                    protocol,
                    peer,
                    ..
                } => {
                    let spi = removed.outbound_spi;
                    let proto = protocol_id(*protocol);
                    let Some((pos, b)) = self.find_bundle(*peer, spi, proto) else {
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
                    if let (Some(spi), true) = (inbound, sa.state.is_established()) {
                        sa.queued
                            .push_back(QueuedRequest::Info(InfoRequest::DeleteChildren {
                                protocol: proto,
                                spis: vec![spi],
                            }));
                    }
                    let id = sa.id;
                    out.extend(self.drain(spd, id, now));
                }
            }
        }
        out
    }
}

fn same_child(a: &ChildRequest, b: &ChildRequest) -> bool {
    a.group == b.group && a.policy_index == b.policy_index && a.selector == b.selector
}
