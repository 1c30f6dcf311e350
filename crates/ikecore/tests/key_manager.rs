//! Two key managers negotiating on demand
//!
//! An outbound lookup without SAs raises a request, the request starts
//! the exchange and datagrams are passed between the managers until the
//! lookup finds its SA.

mod common;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use common::{ALICE, BOB, GROUP};
use ikecore::config::{IkeConfig, IkeVersion};
use ikecore::crypto::DefaultProvider;
use ikecore::spd::{AddrSpec, Flow, OutboundMatch, Policy, Selector};
use ikecore::{Datagram, Error, KeyManager};
use tokio::time::Instant;

const TCP: u8 = 6;

async fn manager(local: IpAddr, remote: IpAddr, version: IkeVersion) -> KeyManager {
    let manager = KeyManager::new(
        IkeConfig::default(),
        Arc::new(DefaultProvider::new()),
        common::identities(),
    );
    {
        let mut spd = manager.spd().await.unwrap();
        spd.add_group(GROUP).unwrap();
        let selector = Selector::new(AddrSpec::Single(local), AddrSpec::Single(remote));
        spd.add_policy(GROUP, Policy::apply(selector, Flow::Dual, vec![common::esp()]))
            .unwrap();
    }
    manager
        .add_ike_policy(common::ike_policy(version, remote, common::local_name(local)))
        .await
        .unwrap();
    manager
}

/// Deliver datagrams until both managers are quiet
async fn exchange(
    alice: &KeyManager,
    bob: &KeyManager,
    first: Vec<Datagram>,
    now: Instant,
) -> usize {
    let mut queue: VecDeque<Datagram> = first.into();
    let mut delivered = 0;
    while let Some(datagram) = queue.pop_front() {
        delivered += 1;
        assert!(delivered < 64, "exchange does not converge");
        let (to, from) = if datagram.peer == ALICE {
            (alice, BOB)
        } else {
            (bob, ALICE)
        };
        queue.extend(to.handle_packet(from, &datagram.data, now).await.unwrap());
    }
    delivered
}

async fn negotiate_on_demand(version: IkeVersion) {
    let alice = manager(ALICE, BOB, version).await;
    let bob = manager(BOB, ALICE, version).await;
    let now = Instant::now();
    let pkt = Selector::packet(ALICE, BOB, TCP, 40000, 443);

    let miss = alice.match_outbound(GROUP, &pkt, now).await;
    assert!(matches!(miss, Err(Error::NotFound(_))));

    let first = alice.process_requests(now).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].peer, BOB);
    assert!(exchange(&alice, &bob, first, now).await >= 4);

    match alice.match_outbound(GROUP, &pkt, now).await.unwrap() {
        OutboundMatch::Protect { sa_indexes, .. } => {
            assert_eq!(sa_indexes.len(), 1);
            assert_ne!(sa_indexes[0], 0);
        }
        other => panic!("expected protection, got {:?}", other),
    }

    // The reverse direction is keyed as well
    let back = Selector::packet(BOB, ALICE, TCP, 443, 40000);
    assert!(matches!(
        bob.match_outbound(GROUP, &back, now).await.unwrap(),
        OutboundMatch::Protect { .. }
    ));
    assert!(bob.process_requests(now).await.unwrap().is_empty());
    assert!(alice.errors().is_empty());
    assert!(bob.errors().is_empty());
}

#[tokio::test]
async fn test_ikev2_on_demand() {
    negotiate_on_demand(IkeVersion::V2).await;
}

#[tokio::test]
async fn test_ikev1_main_mode_on_demand() {
    negotiate_on_demand(IkeVersion::V1Main).await;
}

#[tokio::test]
async fn test_ikev1_aggressive_mode_on_demand() {
    negotiate_on_demand(IkeVersion::V1Aggressive).await;
}

#[tokio::test]
async fn test_engine_picked_by_policy_version() {
    let alice = manager(ALICE, BOB, IkeVersion::V1Main).await;
    let now = Instant::now();
    let pkt = Selector::packet(ALICE, BOB, TCP, 40000, 443);
    assert!(alice.match_outbound(GROUP, &pkt, now).await.is_err());

    let first = alice.process_requests(now).await.unwrap();
    assert_eq!(first.len(), 1);
    // ISAKMP version octet
    assert_eq!(first[0].data[17], 0x10);
    let ike = alice.ike().await.unwrap();
    assert_eq!(ike.v1.sas().len(), 1);
    assert!(ike.v2.sas().is_empty());
}

#[tokio::test]
async fn test_repeated_lookups_raise_one_request() {
    let alice = manager(ALICE, BOB, IkeVersion::V2).await;
    let now = Instant::now();
    let pkt = Selector::packet(ALICE, BOB, TCP, 40000, 443);
    for _ in 0..5 {
        assert!(alice.match_outbound(GROUP, &pkt, now).await.is_err());
    }
    assert_eq!(alice.process_requests(now).await.unwrap().len(), 1);
    assert!(alice.process_requests(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timers_retransmit_unanswered_request() {
    let alice = manager(ALICE, BOB, IkeVersion::V2).await;
    let now = Instant::now();
    let pkt = Selector::packet(ALICE, BOB, TCP, 40000, 443);
    assert!(alice.match_outbound(GROUP, &pkt, now).await.is_err());
    let first = alice.process_requests(now).await.unwrap();

    let deadline = alice.next_deadline().await.unwrap().unwrap();
    assert!(deadline > now);
    assert!(alice.process_timers(now).await.unwrap().is_empty());
    assert_eq!(alice.process_timers(deadline).await.unwrap(), first);
}

#[tokio::test]
async fn test_garbage_is_rejected() {
    let bob = manager(BOB, ALICE, IkeVersion::V2).await;
    let now = Instant::now();
    assert!(matches!(
        bob.handle_packet(ALICE, &[0u8; 8], now).await,
        Err(Error::BufferTooShort { .. })
    ));

    let mut junk = vec![0u8; 40];
    junk[17] = 0x20;
    assert!(bob.handle_packet(ALICE, &junk, now).await.is_err());
    assert!(bob.ike().await.unwrap().v2.sas().is_empty());
}
