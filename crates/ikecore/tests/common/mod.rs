//! Shared fixtures: two in-memory peers wired back to back

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ikecore::config::{AuthenticationMethod, IkeConfig, IkePolicy, IkeVersion, Phase1Attributes};
use ikecore::crypto::{
    DefaultProvider, DhGroup, EncryptionAlgorithm, HashAlgorithm, IntegrityAlgorithm, PrfAlgorithm,
};
use ikecore::identity::{Identifier, IdentityStore};
use ikecore::ikev1::Ikev1Engine;
use ikecore::ikev2::Ikev2Engine;
use ikecore::spd::{AddrSpec, Flow, Policy, SaRequest, SecurityPolicyDb, SecurityProtocol, Selector};
use ikecore::{Datagram, Result};
use tokio::time::Instant;

pub const ALICE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
pub const BOB: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
pub const GROUP: &str = "default";
pub const PSK: &[u8] = b"correct horse battery staple";

/// Engine surface the pump needs
pub trait Engine {
    fn receive(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>>;
}

impl Engine for Ikev1Engine {
    fn receive(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        self.handle_message(spd, src, data, now)
    }
}

impl Engine for Ikev2Engine {
    fn receive(
        &mut self,
        spd: &mut SecurityPolicyDb,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        self.handle_message(spd, src, data, now)
    }
}

/// One side of a test connection
pub struct Peer<E> {
    pub addr: IpAddr,
    pub spd: SecurityPolicyDb,
    pub engine: E,
    pub policy_index: u32,
}

impl<E: Engine> Peer<E> {
    /// SA request for the protect policy toward `remote`
    pub fn request(&self, remote: IpAddr) -> SaRequest {
        SaRequest {
            group: GROUP.into(),
            policy_index: self.policy_index,
            selector: Selector::new(AddrSpec::Single(self.addr), AddrSpec::Single(remote)),
            security: vec![esp()],
            peer: Some(remote),
        }
    }
}

pub fn esp() -> SecurityProtocol {
    SecurityProtocol::esp(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        Some(IntegrityAlgorithm::HmacSha256_128),
    )
}

pub fn identities() -> Arc<IdentityStore> {
    let mut store = IdentityStore::new();
    store.add_psk(Identifier::from_addr(ALICE), PSK).unwrap();
    store.add_psk(Identifier::from_addr(BOB), PSK).unwrap();
    Arc::new(store)
}

/// Policy database protecting all traffic between `local` and `remote`
pub fn spd(local: IpAddr, remote: IpAddr) -> (SecurityPolicyDb, u32) {
    let mut spd = SecurityPolicyDb::new(Duration::from_secs(2));
    spd.add_group(GROUP).unwrap();
    let selector = Selector::new(AddrSpec::Single(local), AddrSpec::Single(remote));
    let index = spd
        .add_policy(GROUP, Policy::apply(selector, Flow::Dual, vec![esp()]))
        .unwrap();
    (spd, index)
}

pub fn v1_suite() -> Phase1Attributes {
    Phase1Attributes::v1(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        HashAlgorithm::Sha256,
        DhGroup::Curve25519,
        AuthenticationMethod::PreSharedKey,
    )
}

pub fn v2_suite() -> Phase1Attributes {
    Phase1Attributes::v2(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        Some(IntegrityAlgorithm::HmacSha256_128),
        PrfAlgorithm::HmacSha256,
        DhGroup::Curve25519,
    )
    .with_auth(AuthenticationMethod::PreSharedKey)
}

pub fn ike_policy(version: IkeVersion, remote: IpAddr, name: &str) -> IkePolicy {
    let suite = if version.is_v1() { v1_suite() } else { v2_suite() };
    IkePolicy::builder()
        .with_name("to-peer")
        .with_peer(AddrSpec::Single(remote))
        .with_version(version)
        .with_attributes(suite)
        .with_local_id(Identifier::Fqdn(name.into()))
        .with_ipsec_group(GROUP)
        .build()
        .unwrap()
}

pub fn local_name(local: IpAddr) -> &'static str {
    if local == ALICE {
        "alice.example"
    } else {
        "bob.example"
    }
}

pub fn v1_peer(
    local: IpAddr,
    remote: IpAddr,
    version: IkeVersion,
    config: IkeConfig,
) -> Peer<Ikev1Engine> {
    let policy = ike_policy(version, remote, local_name(local));
    v1_peer_with(local, remote, policy, config, identities())
}

/// IKEv1 peer with a caller-built IKE policy and credentials
pub fn v1_peer_with(
    local: IpAddr,
    remote: IpAddr,
    policy: IkePolicy,
    config: IkeConfig,
    identities: Arc<IdentityStore>,
) -> Peer<Ikev1Engine> {
    let (spd, policy_index) = spd(local, remote);
    let mut engine = Ikev1Engine::new(config, Arc::new(DefaultProvider::new()), identities);
    engine.add_policy(policy).unwrap();
    Peer {
        addr: local,
        spd,
        engine,
        policy_index,
    }
}

pub fn v2_peer(local: IpAddr, remote: IpAddr, config: IkeConfig) -> Peer<Ikev2Engine> {
    let policy = ike_policy(IkeVersion::V2, remote, local_name(local));
    v2_peer_with(local, remote, policy, config)
}

/// IKEv2 peer with a caller-built IKE policy
pub fn v2_peer_with(
    local: IpAddr,
    remote: IpAddr,
    policy: IkePolicy,
    config: IkeConfig,
) -> Peer<Ikev2Engine> {
    let (spd, policy_index) = spd(local, remote);
    let mut engine = Ikev2Engine::new(config, Arc::new(DefaultProvider::new()), identities());
    engine.add_policy(policy).unwrap();
    Peer {
        addr: local,
        spd,
        engine,
        policy_index,
    }
}

/// Deliver datagrams between the peers until both are quiet
///
/// Returns the number of datagrams delivered.
pub fn pump<E: Engine>(
    a: &mut Peer<E>,
    b: &mut Peer<E>,
    first: Vec<Datagram>,
    now: Instant,
) -> usize {
    let mut queue: VecDeque<Datagram> = first.into();
    let mut delivered = 0;
    while let Some(datagram) = queue.pop_front() {
        delivered += 1;
        assert!(delivered < 64, "exchange does not converge");
        let (to, from) = if datagram.peer == a.addr {
            (&mut *a, b.addr)
        } else {
            (&mut *b, a.addr)
        };
        let out = to
            .engine
            .receive(&mut to.spd, from, &datagram.data, now)
            .unwrap();
        queue.extend(out);
    }
    delivered
}
