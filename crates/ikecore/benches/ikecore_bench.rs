//! Key management benchmarks
//!
//! Key derivation, Diffie-Hellman, policy lookups and a complete IKEv2
//! negotiation between two in-memory engines.
//!
//! Run with: `cargo bench --bench ikecore_bench`

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ikecore::config::{AuthenticationMethod, IkeConfig, IkePolicy, IkeVersion, Phase1Attributes};
use ikecore::crypto::{
    prf_plus, CryptoProvider, DefaultProvider, DhGroup, EncryptionAlgorithm, IntegrityAlgorithm,
    PrfAlgorithm,
};
use ikecore::identity::{Identifier, IdentityStore};
use ikecore::ikev1::keymat::{derive_oakley_keys, skeyid_psk, Phase1Inputs};
use ikecore::ikev2::keymat::{derive_ike_keys, skeyseed};
use ikecore::ikev2::Ikev2Engine;
use ikecore::spd::{AddrSpec, Flow, Policy, SaRequest, SecurityPolicyDb, SecurityProtocol, Selector};
use tokio::time::Instant;

const ALICE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
const BOB: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

fn esp() -> SecurityProtocol {
    SecurityProtocol::esp(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        Some(IntegrityAlgorithm::HmacSha256_128),
    )
}

fn v2_suite() -> Phase1Attributes {
    Phase1Attributes::v2(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        Some(IntegrityAlgorithm::HmacSha256_128),
        PrfAlgorithm::HmacSha256,
        DhGroup::Curve25519,
    )
    .with_auth(AuthenticationMethod::PreSharedKey)
}

fn bench_prf_plus(c: &mut Criterion) {
    let provider = DefaultProvider::new();
    let key = [0x5au8; 32];
    let seed = [0xa5u8; 64];
    let mut group = c.benchmark_group("prf_plus");

    for len in [64usize, 256, 1024] {
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("hmac_sha256_{}", len), |b| {
            b.iter(|| {
                prf_plus(
                    &provider,
                    PrfAlgorithm::HmacSha256,
                    black_box(&key),
                    black_box(&seed),
                    len,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let provider = DefaultProvider::new();
    let ni = [0x11u8; 32];
    let nr = [0x22u8; 32];
    let shared = [0x33u8; 32];
    let mut group = c.benchmark_group("key_derivation");

    let suite = v2_suite();
    group.bench_function("ikev2_ike_sa", |b| {
        b.iter(|| {
            let seed = skeyseed(&provider, suite.prf, &ni, &nr, black_box(&shared)).unwrap();
            derive_ike_keys(&provider, &suite, &seed, &ni, &nr, &[1; 8], &[2; 8]).unwrap()
        })
    });

    let v1 = Phase1Attributes::v1(
        EncryptionAlgorithm::AesCbc,
        Some(128),
        ikecore::crypto::HashAlgorithm::Sha256,
        DhGroup::Curve25519,
        AuthenticationMethod::PreSharedKey,
    );
    group.bench_function("ikev1_oakley", |b| {
        b.iter(|| {
            let skeyid = skeyid_psk(&provider, v1.prf, b"secret", &ni, &nr).unwrap();
            let inputs = Phase1Inputs {
                initiator_cookie: &[1; 8],
                responder_cookie: &[2; 8],
                ni: &ni,
                nr: &nr,
                shared: black_box(&shared),
            };
            derive_oakley_keys(&provider, &v1, skeyid, &inputs).unwrap()
        })
    });
    group.finish();
}

fn bench_diffie_hellman(c: &mut Criterion) {
    let provider = DefaultProvider::new();
    let mut group = c.benchmark_group("diffie_hellman");

    for dh in [DhGroup::Curve25519, DhGroup::Ecp384] {
        let peer = provider.dh_generate(dh).unwrap().public;
        group.bench_function(format!("{:?}", dh), |b| {
            b.iter(|| {
                let pair = provider.dh_generate(dh).unwrap();
                provider.dh_compute(pair.private, black_box(&peer)).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_policy_lookup(c: &mut Criterion) {
    let mut spd = SecurityPolicyDb::new(Duration::from_secs(2));
    spd.add_group("default").unwrap();
    for host in 1..=64u8 {
        let remote = IpAddr::V4(Ipv4Addr::new(198, 51, 100, host));
        let selector = Selector::new(AddrSpec::Single(ALICE), AddrSpec::Single(remote));
        spd.add_policy("default", Policy::bypass(selector, Flow::Outbound))
            .unwrap();
    }
    let last = Selector::packet(ALICE, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 64)), 6, 40000, 443);
    let now = Instant::now();

    c.bench_function("match_outbound_64_policies", |b| {
        b.iter(|| spd.match_outbound("default", black_box(&last), now).unwrap())
    });
}

struct Side {
    addr: IpAddr,
    spd: SecurityPolicyDb,
    engine: Ikev2Engine,
}

fn side(local: IpAddr, remote: IpAddr, identities: &Arc<IdentityStore>) -> (Side, SaRequest) {
    let mut spd = SecurityPolicyDb::new(Duration::from_secs(2));
    spd.add_group("default").unwrap();
    let selector = Selector::new(AddrSpec::Single(local), AddrSpec::Single(remote));
    let policy_index = spd
        .add_policy("default", Policy::apply(selector.clone(), Flow::Dual, vec![esp()]))
        .unwrap();
    let mut engine = Ikev2Engine::new(
        IkeConfig::default(),
        Arc::new(DefaultProvider::new()),
        Arc::clone(identities),
    );
    let policy = IkePolicy::builder()
        .with_name("bench")
        .with_peer(AddrSpec::Single(remote))
        .with_version(IkeVersion::V2)
        .with_attributes(v2_suite())
        .with_local_id(Identifier::from_addr(local))
        .with_ipsec_group("default")
        .build()
        .unwrap();
    engine.add_policy(policy).unwrap();
    let request = SaRequest {
        group: "default".into(),
        policy_index,
        selector,
        security: vec![esp()],
        peer: Some(remote),
    };
    (
        Side {
            addr: local,
            spd,
            engine,
        },
        request,
    )
}

fn bench_ikev2_negotiation(c: &mut Criterion) {
    let mut store = IdentityStore::new();
    store.add_psk(Identifier::from_addr(ALICE), b"bench".to_vec()).unwrap();
    store.add_psk(Identifier::from_addr(BOB), b"bench".to_vec()).unwrap();
    let identities = Arc::new(store);

    c.bench_function("ikev2_sa_init_and_auth", |b| {
        b.iter(|| {
            let (mut alice, request) = side(ALICE, BOB, &identities);
            let (mut bob, _) = side(BOB, ALICE, &identities);
            let now = Instant::now();
            let mut queue: VecDeque<_> = alice
                .engine
                .initiate(&mut alice.spd, &request, now)
                .unwrap()
                .into();
            while let Some(datagram) = queue.pop_front() {
                let (to, from) = if datagram.peer == alice.addr {
                    (&mut alice, BOB)
                } else {
                    (&mut bob, ALICE)
                };
                let out = to
                    .engine
                    .handle_message(&mut to.spd, from, &datagram.data, now)
                    .unwrap();
                queue.extend(out);
            }
            black_box(alice.engine.sas().len())
        })
    });
}

criterion_group!(
    benches,
    bench_prf_plus,
    bench_key_derivation,
    bench_diffie_hellman,
    bench_policy_lookup,
    bench_ikev2_negotiation
);
criterion_main!(benches);
