//! Child SA negotiation
//!
//! Shared by IKE_AUTH and CREATE_CHILD_SA:
//!
//! ```text
//! Initiator                              Responder
//! SA(our SPIs), TSi(src), TSr(dst)  -->  narrow TSr/TSi against the SPD,
//!                                        select a proposal, install
//!                                   <--  SA(its SPIs), TSi, TSr
//! verify TS against the policy,
//! install
//! ```
//!
//! Traffic selectors are always written from the initiator's point of
//! view: TSi is the initiator side, TSr the responder side.

use std::net::IpAddr;

use tokio::time::Instant;

use super::constants::NotifyType;
use super::keymat::derive_child_keys;
use super::payload::{NotifyPayload, Payload};
use super::proposal::{
    accepted_child_proposal, construct_child_proposals, select_child_proposal, Proposal,
};
use super::sa::{ChildBundle, ChildRequest};
use super::traffic_selector::{selector_to_ts, ts_to_selector, TsPayload};
use crate::crypto::{CryptoProvider, DhGroup, PrfAlgorithm};
use crate::error::{Error, Result};
use crate::install::{allocate_spi, install_children, ChildSaDescriptor};
use crate::spd::{Direction, SecurityPolicyDb, SecurityProtocol};

/// Per-exchange inputs of child negotiation
#[derive(Debug, Clone, Copy)]
pub struct ChildContext<'a> {
    /// Crypto provider
    pub provider: &'a dyn CryptoProvider,
    /// PRF of the IKE SA
    pub prf: PrfAlgorithm,
    /// SK_d of the IKE SA
    pub sk_d: &'a [u8],
    /// Peer address
    pub peer: IpAddr,
    /// Installation time
    pub now: Instant,
}

/// Key exchange results feeding KEYMAT
#[derive(Debug, Clone, Copy)]
pub struct KeyInput<'a> {
    /// Fresh g^ir when PFS was used
    pub shared: Option<&'a [u8]>,
    /// Initiator nonce of the exchange
    pub ni: &'a [u8],
    /// Responder nonce of the exchange
    pub nr: &'a [u8],
}

/// SA, TSi and TSr payloads of a message
#[derive(Debug, Clone, Copy)]
pub struct ChildPayloads<'a> {
    /// Proposals
    pub proposals: &'a [Proposal],
    /// Initiator traffic selectors
    pub tsi: &'a TsPayload,
    /// Responder traffic selectors
    pub tsr: &'a TsPayload,
}

impl<'a> ChildPayloads<'a> {
    /// Find the child payloads
    ///
    /// Returns `None` when the message carries none of them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingPayload`] when only some are present.
    pub fn find(payloads: &'a [Payload]) -> Result<Option<Self>> {
        let mut proposals = None;
        let mut tsi = None;
        let mut tsr = None;
        for p in payloads {
            match p {
                Payload::Sa(v) => proposals = Some(v.as_slice()),
                Payload::TsI(ts) => tsi = Some(ts),
                Payload::TsR(ts) => tsr = Some(ts),
                _ => {}
            }
        }
        match (proposals, tsi, tsr) {
            (None, None, None) => Ok(None),
            (Some(proposals), Some(tsi), Some(tsr)) => Ok(Some(ChildPayloads {
                proposals,
                tsi,
                tsr,
            })),
            (None, _, _) => Err(Error::MissingPayload("SA".into())),
            _ => Err(Error::MissingPayload("TSi/TSr".into())),
        }
    }
}

/// Child SA offer or answer, ready to be placed in a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOffer {
    /// Proposals
    pub proposals: Vec<Proposal>,
    /// Initiator traffic selectors
    pub tsi: TsPayload,
    /// Responder traffic selectors
    pub tsr: TsPayload,
    /// Transport mode requested or accepted
    pub transport: bool,
}

impl ChildOffer {
    /// Payloads in message order
    ///
    /// `middle` goes between SA and the traffic selectors (nonce and KE
    /// in CREATE_CHILD_SA).
    pub fn payloads(self, middle: Vec<Payload>) -> Vec<Payload> {
        let mut out = Vec::with_capacity(4 + middle.len());
        if self.transport {
            out.push(Payload::Notify(NotifyPayload::new(
                NotifyType::UseTransportMode.to_u16(),
                Vec::new(),
            )));
        }
        out.push(Payload::Sa(self.proposals));
        out.extend(middle);
        out.push(Payload::TsI(self.tsi));
        out.push(Payload::TsR(self.tsr));
        out
    }
}

fn is_transport(security: &[SecurityProtocol]) -> bool {
    security.first().map_or(false, |s| !s.mode.is_tunnel())
}

/// Build the offer for `request`, allocating our inbound SPIs
pub fn build_offer(
    provider: &dyn CryptoProvider,
    spd: &SecurityPolicyDb,
    request: &mut ChildRequest,
    peer: IpAddr,
) -> Result<ChildOffer> {
    let spis = request
        .security
        .iter()
        .map(|s| allocate_spi(provider, spd, &request.group, s.protocol))
        .collect::<Result<Vec<_>>>()?;
    let proposals = construct_child_proposals(&request.security, &spis, request.pfs)?;
    request.inbound_spis = spis;

    let (src, dst) = selector_to_ts(&request.selector, peer);
    Ok(ChildOffer {
        proposals,
        tsi: TsPayload::single(src),
        tsr: TsPayload::single(dst),
        transport: is_transport(&request.security),
    })
}

/// Responder: pick a policy and proposal for the peer's offer and
/// install the bundle
///
/// # Errors
///
/// * [`Error::TsUnacceptable`] when no protecting policy is covered by
///   the offered selectors
/// * [`Error::NoProposalChosen`] / [`Error::InvalidKePayload`] from
///   proposal selection
pub fn answer_offer(
    ctx: &ChildContext<'_>,
    spd: &mut SecurityPolicyDb,
    group: &str,
    pfs: Option<DhGroup>,
    received: &ChildPayloads<'_>,
    ke_group: Option<u16>,
    keys: KeyInput<'_>,
) -> Result<(ChildOffer, ChildBundle)> {
    // Our outbound view: we are the responder side
    let traffic = ts_to_selector(received.tsr.first()?, received.tsi.first()?)?;
    let (policy_index, selector, local) = {
        let (policy, narrow) = spd
            .policy_by_selector_narrow(group, &traffic, Direction::Outbound)
            .map_err(|_| Error::TsUnacceptable)?;
        tracing::debug!(
            policy = policy.index,
            narrowed_protocol = ?narrow.narrowed_protocol,
            "Traffic selectors narrowed to policy"
        );
        (policy.index, policy.selector.clone(), policy.security.clone())
    };

    let selection = select_child_proposal(&local, received.proposals, pfs, ke_group)?;
    let security = selection.security();
    let spis = security
        .iter()
        .map(|s| allocate_spi(ctx.provider, spd, group, s.protocol))
        .collect::<Result<Vec<_>>>()?;

    let child_keys = derive_child_keys(
        ctx.provider,
        ctx.prf,
        ctx.sk_d,
        keys.shared,
        (keys.ni, keys.nr),
        &security,
        false,
    )?;
    let descriptors = selection
        .entries
        .iter()
        .zip(&spis)
        .zip(child_keys)
        .map(|((entry, spi), keys)| ChildSaDescriptor {
            security: entry.security.clone(),
            inbound_spi: *spi,
            outbound_spi: entry.peer_spi,
            keys,
        })
        .collect();
    let pairs = install_children(
        spd,
        group,
        policy_index,
        &selector,
        ctx.peer,
        descriptors,
        ctx.now,
    )?;

    let (src, dst) = selector_to_ts(&selector, ctx.peer);
    let answer = ChildOffer {
        proposals: selection.response_proposals(&spis)?,
        tsi: TsPayload::single(dst),
        tsr: TsPayload::single(src),
        transport: is_transport(&security),
    };
    Ok((
        answer,
        ChildBundle {
            selector,
            pairs,
            rekeying: false,
        },
    ))
}

/// Initiator: check the responder's answer and install the bundle
///
/// # Errors
///
/// * [`Error::NoProposalChosen`] when the answer does not match the offer
/// * [`Error::TsUnacceptable`] when the returned selectors fall outside
///   the policy
pub fn accept_answer(
    ctx: &ChildContext<'_>,
    spd: &mut SecurityPolicyDb,
    request: &ChildRequest,
    received: &ChildPayloads<'_>,
    keys: KeyInput<'_>,
) -> Result<ChildBundle> {
    let selection = accepted_child_proposal(&request.security, received.proposals, request.pfs)?;
    let selector = ts_to_selector(received.tsi.first()?, received.tsr.first()?)?;
    spd.verify_policy(&request.group, request.policy_index, &selector)?;

    let security = selection.security();
    let child_keys = derive_child_keys(
        ctx.provider,
        ctx.prf,
        ctx.sk_d,
        keys.shared,
        (keys.ni, keys.nr),
        &security,
        true,
    )?;
    let descriptors = selection
        .entries
        .iter()
        .zip(child_keys)
        .map(|(entry, keys)| {
            let inbound_spi = *request
                .inbound_spis
                .get(entry.local_index)
                .ok_or_else(|| Error::Internal("No SPI allocated for protocol".into()))?;
            Ok(ChildSaDescriptor {
                security: entry.security.clone(),
                inbound_spi,
                outbound_spi: entry.peer_spi,
                keys,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let pairs = install_children(
        spd,
        &request.group,
        request.policy_index,
        &selector,
        ctx.peer,
        descriptors,
        ctx.now,
    )?;
    Ok(ChildBundle {
        selector,
        pairs,
        rekeying: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultProvider, EncryptionAlgorithm, IntegrityAlgorithm};
    use crate::spd::{AddrSpec, Flow, IpsecProtocol, Policy, Selector};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn esp() -> SecurityProtocol {
        SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha256_128),
        )
    }

    fn spd(local: IpAddr, remote: IpAddr, security: Vec<SecurityProtocol>) -> SecurityPolicyDb {
        let mut spd = SecurityPolicyDb::new(Duration::from_secs(1));
        spd.add_group("g").unwrap();
        let sel = Selector::new(AddrSpec::Single(local), AddrSpec::Single(remote));
        spd.add_policy("g", Policy::apply(sel, Flow::Dual, security))
            .unwrap();
        spd
    }

    fn request(security: Vec<SecurityProtocol>) -> ChildRequest {
        ChildRequest {
            group: "g".into(),
            policy_index: 1,
            selector: Selector::new(AddrSpec::Single(A), AddrSpec::Single(B)),
            security,
            inbound_spis: Vec::new(),
            pfs: None,
            rekey: None,
        }
    }

    fn find(payloads: &[Payload]) -> ChildPayloads<'_> {
        ChildPayloads::find(payloads).unwrap().unwrap()
    }

    #[test]
    fn test_offer_answer_accept() {
        let p = DefaultProvider::new();
        let now = Instant::now();
        let mut spd_a = spd(A, B, vec![esp()]);
        let mut spd_b = spd(B, A, vec![esp()]);
        let keys = KeyInput {
            shared: None,
            ni: &[1u8; 32],
            nr: &[2u8; 32],
        };

        let mut req = request(vec![esp()]);
        let offer = build_offer(&p, &spd_a, &mut req, B).unwrap();
        assert_eq!(req.inbound_spis.len(), 1);
        assert!(offer.transport);
        let offer_payloads = offer.payloads(Vec::new());
        assert!(matches!(offer_payloads[0], Payload::Notify(_)));

        let ctx_b = ChildContext {
            provider: &p,
            prf: PrfAlgorithm::HmacSha256,
            sk_d: &[7u8; 32],
            peer: A,
            now,
        };
        let (answer, bundle_b) =
            answer_offer(&ctx_b, &mut spd_b, "g", None, &find(&offer_payloads), None, keys)
                .unwrap();
        assert_eq!(bundle_b.pairs[0].outbound_spi, req.inbound_spis[0]);
        let answer_payloads = answer.payloads(Vec::new());

        let ctx_a = ChildContext { peer: B, ..ctx_b };
        let bundle_a =
            accept_answer(&ctx_a, &mut spd_a, &req, &find(&answer_payloads), keys).unwrap();
        assert_eq!(bundle_a.pairs[0].outbound_spi, bundle_b.pairs[0].inbound_spi);

        // Each side's outbound keys are the other side's inbound keys
        let out_a = spd_a.outbound_sa("g", bundle_a.pairs[0].outbound_index).unwrap();
        let in_b = spd_b
            .inbound_sa("g", out_a.spi, IpsecProtocol::Esp, Some(B))
            .unwrap();
        assert_eq!(out_a.keys, in_b.keys);
    }

    #[test]
    fn test_unmatched_selector_is_ts_unacceptable() {
        let p = DefaultProvider::new();
        let spd_a = spd(A, B, vec![esp()]);
        let other = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));
        let mut spd_b = spd(B, other, vec![esp()]);

        let mut req = request(vec![esp()]);
        let payloads = build_offer(&p, &spd_a, &mut req, B).unwrap().payloads(Vec::new());
        let ctx = ChildContext {
            provider: &p,
            prf: PrfAlgorithm::HmacSha256,
            sk_d: &[7u8; 32],
            peer: A,
            now: Instant::now(),
        };
        let keys = KeyInput {
            shared: None,
            ni: &[1u8; 32],
            nr: &[2u8; 32],
        };
        let err = answer_offer(&ctx, &mut spd_b, "g", None, &find(&payloads), None, keys)
            .unwrap_err();
        assert_eq!(err, Error::TsUnacceptable);
        assert!(!spd_b.has_sas_with_peer("g", A).unwrap());
    }

    #[test]
    fn test_bundle_span_mismatch() {
        let p = DefaultProvider::new();
        let ah = SecurityProtocol::ah(IntegrityAlgorithm::HmacSha1_96);
        let spd_a = spd(A, B, vec![ah.clone(), esp()]);
        let mut spd_b = spd(B, A, vec![esp()]);

        let mut req = request(vec![ah, esp()]);
        let payloads = build_offer(&p, &spd_a, &mut req, B).unwrap().payloads(Vec::new());
        let ctx = ChildContext {
            provider: &p,
            prf: PrfAlgorithm::HmacSha256,
            sk_d: &[7u8; 32],
            peer: A,
            now: Instant::now(),
        };
        let keys = KeyInput {
            shared: None,
            ni: &[1u8; 32],
            nr: &[2u8; 32],
        };
        let err = answer_offer(&ctx, &mut spd_b, "g", None, &find(&payloads), None, keys)
            .unwrap_err();
        assert_eq!(err, Error::NoProposalChosen);
    }

    #[test]
    fn test_partial_child_payloads() {
        let ts = TsPayload { selectors: Vec::new() };
        assert!(ChildPayloads::find(&[]).unwrap().is_none());
        assert!(ChildPayloads::find(&[Payload::TsI(ts)]).is_err());
    }
}
