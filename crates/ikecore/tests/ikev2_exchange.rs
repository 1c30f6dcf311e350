//! IKEv2 exchanges between two in-memory peers
//!
//! IKE_SA_INIT and IKE_AUTH with the first child bundle, CREATE_CHILD_SA
//! re-keys, INFORMATIONAL deletes and liveness checks.

mod common;

use std::net::IpAddr;
use std::time::Duration;

use common::{Peer, ALICE, BOB, GROUP};
use ikecore::config::{IkeConfig, IkePolicy, IkeVersion};
use ikecore::crypto::{DefaultProvider, DhGroup};
use ikecore::identity::Identifier;
use ikecore::ikev2::payload::{DeletePayload, NotifyPayload};
use ikecore::ikev2::{
    ExchangeType, IkeMessage, IkeSa, IkeSaState, Ikev2Engine, NotifyType, Payload, ProtocolId,
};
use ikecore::spd::{AddrSpec, IpsecProtocol, SpdExpiry};
use ikecore::Error;
use tokio::time::Instant;

fn established(peer: &Peer<Ikev2Engine>) -> &IkeSa {
    let sas = peer.engine.sas();
    assert_eq!(sas.len(), 1, "one IKE SA expected");
    assert_eq!(sas[0].state, IkeSaState::Established);
    &sas[0]
}

fn assert_paired(a: &Peer<Ikev2Engine>, b: &Peer<Ikev2Engine>) {
    let a_pairs = established(a).installed();
    let b_pairs = established(b).installed();
    assert_eq!(a_pairs.len(), 1);
    assert_eq!(b_pairs.len(), 1);
    let (x, y) = (&a_pairs[0], &b_pairs[0]);
    assert_eq!(x.outbound_spi, y.inbound_spi);
    assert_eq!(y.outbound_spi, x.inbound_spi);

    for (from, to, pair, spi) in [(a, b, x, y.inbound_spi), (b, a, y, x.inbound_spi)] {
        let outbound = from.spd.outbound_sa(GROUP, pair.outbound_index).unwrap();
        let inbound = to
            .spd
            .inbound_sa(GROUP, spi, IpsecProtocol::Esp, Some(to.addr))
            .unwrap();
        assert_eq!(outbound.keys, inbound.keys);
    }
}

fn connect() -> (Peer<Ikev2Engine>, Peer<Ikev2Engine>) {
    let mut alice = common::v2_peer(ALICE, BOB, IkeConfig::default());
    let mut bob = common::v2_peer(BOB, ALICE, IkeConfig::default());
    let now = Instant::now();
    let request = alice.request(BOB);
    let first = alice.engine.initiate(&mut alice.spd, &request, now).unwrap();
    // IKE_SA_INIT and IKE_AUTH, request and response each
    assert_eq!(common::pump(&mut alice, &mut bob, first, now), 4);
    (alice, bob)
}

#[test]
fn test_auth_installs_first_child() {
    let (alice, bob) = connect();
    assert_paired(&alice, &bob);

    let a = established(&alice);
    let b = established(&bob);
    assert!(a.is_initiator);
    assert_eq!(a.initiator_spi, b.initiator_spi);
    assert_eq!(a.responder_spi, b.responder_spi);
    assert_eq!(a.peer_id, Some(Identifier::Fqdn("bob.example".into())));
    assert_eq!(b.peer_id, Some(Identifier::Fqdn("alice.example".into())));
    assert_eq!(a.next_message_id, 2);
    assert_eq!(b.peer_message_id, 2);
}

#[test]
fn test_child_rekey_on_soft_expiry() {
    let (mut alice, mut bob) = connect();
    let now = Instant::now();
    let old_a = established(&alice).installed()[0].clone();
    let old_b = established(&bob).installed()[0].clone();

    let expiry = SpdExpiry::SoftLifetime {
        group: GROUP.into(),
        outbound_index: old_a.outbound_index,
        outbound_spi: old_a.outbound_spi,
        protocol: IpsecProtocol::Esp,
        peer: BOB,
    };
    let sent = alice
        .engine
        .handle_spd_expiry(&mut alice.spd, &[expiry.clone()], now);
    assert_eq!(sent.len(), 1);
    assert!(alice
        .engine
        .handle_spd_expiry(&mut alice.spd, &[expiry], now)
        .is_empty());

    common::pump(&mut alice, &mut bob, sent, now);
    assert_paired(&alice, &bob);
    assert_ne!(established(&alice).installed()[0].inbound_spi, old_a.inbound_spi);
    assert!(alice.spd.outbound_sa(GROUP, old_a.outbound_index).is_err());
    assert!(bob.spd.outbound_sa(GROUP, old_b.outbound_index).is_err());
}

#[test]
fn test_ike_rekey_moves_children() {
    let (mut alice, mut bob) = connect();
    let now = Instant::now();
    let (old_id, old_spi) = {
        let old = established(&alice);
        (old.id, old.initiator_spi)
    };
    let pair = established(&alice).installed()[0].clone();

    let sent = alice.engine.rekey_ike(&mut alice.spd, old_id, now).unwrap();
    assert_eq!(sent.len(), 1);
    common::pump(&mut alice, &mut bob, sent, now);

    let a = established(&alice);
    let b = established(&bob);
    assert_ne!(a.id, old_id);
    assert_ne!(a.initiator_spi, old_spi);
    assert_eq!(a.initiator_spi, b.initiator_spi);
    assert_eq!(a.responder_spi, b.responder_spi);
    assert_eq!(a.installed(), vec![pair.clone()]);
    assert!(alice.spd.outbound_sa(GROUP, pair.outbound_index).is_ok());
    let new_id = a.id;
    assert_paired(&alice, &bob);

    // The new SA carries further exchanges
    let sent = alice.engine.send_liveness(&mut alice.spd, new_id, now).unwrap();
    assert_eq!(common::pump(&mut alice, &mut bob, sent, now), 2);
}

#[test]
fn test_delete_children_reaches_peer() {
    let (mut alice, mut bob) = connect();
    let now = Instant::now();
    let id = established(&alice).id;
    let pair = established(&alice).installed()[0].clone();
    let bob_pair = established(&bob).installed()[0].clone();

    let sent = alice
        .engine
        .delete_children(&mut alice.spd, id, IpsecProtocol::Esp, &[pair.inbound_spi], now)
        .unwrap();
    assert_eq!(sent.len(), 1);
    assert!(alice.spd.outbound_sa(GROUP, pair.outbound_index).is_err());

    common::pump(&mut alice, &mut bob, sent, now);
    assert!(established(&alice).children.is_empty());
    assert!(established(&bob).children.is_empty());
    assert!(bob.spd.outbound_sa(GROUP, bob_pair.outbound_index).is_err());
}

#[test]
fn test_delete_ike_sa_takes_children() {
    let (mut alice, mut bob) = connect();
    let now = Instant::now();
    let id = established(&alice).id;
    let a_pair = established(&alice).installed()[0].clone();
    let b_pair = established(&bob).installed()[0].clone();

    let sent = alice.engine.delete_ike_sa(&mut alice.spd, id, now).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(alice.engine.sas()[0].state, IkeSaState::WaitDelete);
    assert!(alice.spd.outbound_sa(GROUP, a_pair.outbound_index).is_err());

    common::pump(&mut alice, &mut bob, sent, now);
    assert!(alice.engine.sas().is_empty());
    assert!(bob.engine.sas().is_empty());
    assert!(bob.spd.outbound_sa(GROUP, b_pair.outbound_index).is_err());
}

#[test]
fn test_liveness_answered() {
    let (mut alice, mut bob) = connect();
    let now = Instant::now();
    let id = established(&alice).id;

    let sent = alice.engine.send_liveness(&mut alice.spd, id, now).unwrap();
    assert_eq!(sent.len(), 1);
    assert!(established(&alice).pending.is_some());
    assert_eq!(common::pump(&mut alice, &mut bob, sent, now), 2);
    assert!(established(&alice).pending.is_none());
    assert_eq!(established(&alice).next_message_id, 3);
    assert_paired(&alice, &bob);
}

#[test]
fn test_dead_peer_takes_children() {
    let (mut alice, _bob) = connect();
    let start = Instant::now();
    let id = established(&alice).id;
    let pair = established(&alice).installed()[0].clone();

    let probe = alice.engine.send_liveness(&mut alice.spd, id, start).unwrap();
    let step = Duration::from_secs(5);
    for n in 1..=3u32 {
        let resent = alice.engine.process_timers(&mut alice.spd, start + step * n);
        assert_eq!(resent, probe);
    }
    assert!(alice
        .engine
        .process_timers(&mut alice.spd, start + step * 4)
        .is_empty());
    assert!(alice.engine.sas().is_empty());
    assert!(alice.spd.outbound_sa(GROUP, pair.outbound_index).is_err());
}

#[test]
fn test_retransmitted_request_gets_cached_response() {
    let mut alice = common::v2_peer(ALICE, BOB, IkeConfig::default());
    let mut bob = common::v2_peer(BOB, ALICE, IkeConfig::default());
    let now = Instant::now();
    let request = alice.request(BOB);
    let first = alice.engine.initiate(&mut alice.spd, &request, now).unwrap();

    let resent = alice
        .engine
        .process_timers(&mut alice.spd, now + Duration::from_secs(5));
    assert_eq!(resent, first);

    let reply = bob
        .engine
        .handle_message(&mut bob.spd, ALICE, &first[0].data, now)
        .unwrap();
    let again = bob
        .engine
        .handle_message(&mut bob.spd, ALICE, &resent[0].data, now)
        .unwrap();
    assert_eq!(reply, again);
    assert_eq!(bob.engine.sas().len(), 1);
}

fn policy_with_groups(local: IpAddr, remote: IpAddr, groups: &[DhGroup]) -> IkePolicy {
    let mut builder = IkePolicy::builder()
        .with_name("to-peer")
        .with_peer(AddrSpec::Single(remote))
        .with_version(IkeVersion::V2)
        .with_local_id(Identifier::Fqdn(common::local_name(local).into()))
        .with_ipsec_group(GROUP);
    for group in groups {
        let mut suite = common::v2_suite();
        suite.group = *group;
        builder = builder.with_attributes(suite);
    }
    builder.build().unwrap()
}

#[test]
fn test_invalid_ke_payload_retry() {
    let mut alice = common::v2_peer_with(
        ALICE,
        BOB,
        policy_with_groups(ALICE, BOB, &[DhGroup::Curve25519, DhGroup::Ecp384]),
        IkeConfig::default(),
    );
    let mut bob = common::v2_peer_with(
        BOB,
        ALICE,
        policy_with_groups(BOB, ALICE, &[DhGroup::Ecp384]),
        IkeConfig::default(),
    );
    let now = Instant::now();
    let request = alice.request(BOB);
    let first = alice.engine.initiate(&mut alice.spd, &request, now).unwrap();

    // refused KE, retried SA_INIT, then AUTH
    assert_eq!(common::pump(&mut alice, &mut bob, first, now), 6);
    assert_eq!(established(&alice).suite.group, DhGroup::Ecp384);
    assert_eq!(established(&bob).suite.group, DhGroup::Ecp384);
    assert_paired(&alice, &bob);
}

/// INFORMATIONAL request from `peer` on its established IKE SA
fn info_request(peer: &Peer<Ikev2Engine>, payloads: &[Payload]) -> Vec<u8> {
    let sa = established(peer);
    sa.seal(
        &DefaultProvider::new(),
        ExchangeType::Informational,
        sa.next_message_id,
        false,
        payloads,
    )
    .unwrap()
}

#[test]
fn test_error_notify_stops_informational() {
    let (alice, mut bob) = connect();
    let now = Instant::now();
    let a_pair = established(&alice).installed()[0].clone();
    let b_pair = established(&bob).installed()[0].clone();

    let data = info_request(
        &alice,
        &[
            Payload::Notify(NotifyPayload::new(NotifyType::InvalidSpi.to_u16(), Vec::new())),
            Payload::Delete(DeletePayload::child(ProtocolId::Esp, &[a_pair.inbound_spi])),
        ],
    );
    let result = bob.engine.handle_message(&mut bob.spd, ALICE, &data, now);
    assert!(matches!(
        result,
        Err(Error::Notified(t)) if t == NotifyType::InvalidSpi.to_u16()
    ));

    // the Delete in the same message was not applied
    assert_eq!(established(&bob).installed(), vec![b_pair.clone()]);
    assert!(bob.spd.outbound_sa(GROUP, b_pair.outbound_index).is_ok());
}

#[test]
fn test_transport_mode_mirrored_in_informational() {
    let (alice, mut bob) = connect();
    let now = Instant::now();
    let transport = Payload::Notify(NotifyPayload::new(
        NotifyType::UseTransportMode.to_u16(),
        Vec::new(),
    ));

    let data = info_request(&alice, &[transport.clone()]);
    let reply = bob
        .engine
        .handle_message(&mut bob.spd, ALICE, &data, now)
        .unwrap();
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].peer, ALICE);

    let msg = IkeMessage::decode(&reply[0].data).unwrap();
    assert!(msg.header.flags.is_response());
    let payloads = established(&alice)
        .open(&DefaultProvider::new(), &reply[0].data, &msg)
        .unwrap();
    assert_eq!(payloads, vec![transport]);
    assert_paired(&alice, &bob);
}
