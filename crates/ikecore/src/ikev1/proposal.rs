//! Phase 1 and Phase 2 proposal negotiation
//!
//! Phase 1 offers a single ISAKMP proposal whose transforms are the
//! alternative suites, each described by Oakley attributes. The
//! responder answers with exactly one of the transforms.
//!
//! Phase 2 offers one proposal payload per security protocol, all
//! sharing a proposal number (the "span" of a bundle), each carrying
//! the sender's inbound SPI and IPsec DOI attributes.

use super::constants::{ipsec, oakley, ProtocolId, KEY_IKE, LIFE_TYPE_SECONDS};
use super::message::{Attribute, Proposal, SaPayload, Transform};
use crate::config::{AuthenticationMethod, Phase1Attributes, MAX_SUITES};
use crate::crypto::{DhGroup, EncryptionAlgorithm, IntegrityAlgorithm};
use crate::error::{Error, Result};
use crate::logging;
use crate::spd::{IpsecProtocol, SecurityMode, SecurityProtocol};

fn auth_code(auth: AuthenticationMethod) -> u16 {
    match auth {
        AuthenticationMethod::PreSharedKey => oakley::AUTH_PRE_SHARED,
        AuthenticationMethod::Ed25519 => oakley::AUTH_ED25519,
    }
}

fn lifetime_secs(duration: std::time::Duration) -> u32 {
    duration.as_secs().min(u32::MAX as u64) as u32
}

fn phase1_transform(number: u8, suite: &Phase1Attributes) -> Transform {
    let mut attributes = Vec::with_capacity(7);
    if let Some(enc) = suite.encryption.v1_attribute() {
        attributes.push(Attribute::number(oakley::ENCRYPTION, enc as u32));
    }
    if suite.encryption.has_variable_key_len() {
        attributes.push(Attribute::number(
            oakley::KEY_LENGTH,
            suite.effective_key_bits() as u32,
        ));
    }
    attributes.push(Attribute::number(oakley::HASH, suite.hash.v1_attribute() as u32));
    attributes.push(Attribute::number(oakley::AUTH_METHOD, auth_code(suite.auth) as u32));
    attributes.push(Attribute::number(
        oakley::GROUP_DESCRIPTION,
        suite.group.number() as u32,
    ));
    attributes.push(Attribute::number(oakley::LIFE_TYPE, LIFE_TYPE_SECONDS as u32));
    attributes.push(Attribute::number(
        oakley::LIFE_DURATION,
        lifetime_secs(suite.lifetime.hard),
    ));
    Transform {
        number,
        transform_id: KEY_IKE,
        attributes,
    }
}

/// Phase 1 SA payload offering every local suite in order
pub fn construct_phase1_proposal(suites: &[Phase1Attributes]) -> Result<SaPayload> {
    if suites.is_empty() {
        return Err(Error::InvalidParameter("No Phase 1 suite configured".into()));
    }
    if suites.len() > MAX_SUITES {
        return Err(Error::InvalidParameter(format!(
            "{} Phase 1 suites exceed the transform numbering",
            suites.len()
        )));
    }
    let transforms = suites
        .iter()
        .zip(1..=u8::MAX)
        .map(|(suite, number)| phase1_transform(number, suite))
        .collect();
    Ok(SaPayload::ipsec(vec![Proposal {
        number: 1,
        protocol_id: ProtocolId::Isakmp.to_u8(),
        spi: Vec::new(),
        transforms,
    }]))
}

fn phase1_matches(t: &Transform, suite: &Phase1Attributes) -> bool {
    if t.transform_id != KEY_IKE {
        return false;
    }
    let Some(enc) = suite.encryption.v1_attribute() else {
        return false;
    };
    let key_len_ok = match t.attribute(oakley::KEY_LENGTH) {
        Some(bits) => bits == suite.effective_key_bits() as u32,
        None => !suite.encryption.has_variable_key_len(),
    };
    t.attribute(oakley::ENCRYPTION) == Some(enc as u32)
        && key_len_ok
        && t.attribute(oakley::HASH) == Some(suite.hash.v1_attribute() as u32)
        && t.attribute(oakley::AUTH_METHOD) == Some(auth_code(suite.auth) as u32)
        && t.attribute(oakley::GROUP_DESCRIPTION) == Some(suite.group.number() as u32)
}

/// Accepted Phase 1 transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase1Selection {
    /// SA payload to send back (the chosen transform only)
    pub response: SaPayload,
    /// Matching local suite
    pub suite: Phase1Attributes,
}

/// Select a Phase 1 transform
///
/// Transforms are evaluated in wire order against every local suite;
/// the first complete match wins.
///
/// # Errors
///
/// Returns [`Error::NoProposalChosen`] when no transform matches.
pub fn select_phase1(local: &[Phase1Attributes], received: &SaPayload) -> Result<Phase1Selection> {
    let offered: usize = received.proposals.iter().map(|p| p.transforms.len()).sum();
    for proposal in &received.proposals {
        if proposal.protocol_id != ProtocolId::Isakmp.to_u8() {
            continue;
        }
        for t in &proposal.transforms {
            let Some(suite) = local.iter().find(|s| phase1_matches(t, s)) else {
                continue;
            };
            logging::log_proposal_negotiation(offered, Some(t.number));
            let response = SaPayload {
                doi: received.doi,
                situation: received.situation,
                proposals: vec![Proposal {
                    number: proposal.number,
                    protocol_id: proposal.protocol_id,
                    spi: proposal.spi.clone(),
                    transforms: vec![t.clone()],
                }],
            };
            return Ok(Phase1Selection {
                response,
                suite: *suite,
            });
        }
    }
    logging::log_proposal_negotiation(offered, None);
    Err(Error::NoProposalChosen)
}

/// Check the responder's Phase 1 answer against what was offered
pub fn accepted_phase1(
    offered: &[Phase1Attributes],
    response: &SaPayload,
) -> Result<Phase1Attributes> {
    let [proposal] = response.proposals.as_slice() else {
        return Err(Error::NoProposalChosen);
    };
    let [t] = proposal.transforms.as_slice() else {
        return Err(Error::NoProposalChosen);
    };
    offered
        .iter()
        .find(|s| phase1_matches(t, s))
        .copied()
        .ok_or(Error::NoProposalChosen)
}

/// ISAKMP protocol ID of an IPsec protocol
pub fn protocol_id(protocol: IpsecProtocol) -> ProtocolId {
    match protocol {
        IpsecProtocol::Ah => ProtocolId::Ah,
        IpsecProtocol::Esp => ProtocolId::Esp,
    }
}

fn encapsulation(mode: &SecurityMode) -> u16 {
    if mode.is_tunnel() {
        ipsec::ENCAP_TUNNEL
    } else {
        ipsec::ENCAP_TRANSPORT
    }
}

fn phase2_transform(security: &SecurityProtocol, pfs: Option<DhGroup>) -> Transform {
    let transform_id = match (security.protocol, security.encryption, security.integrity) {
        (IpsecProtocol::Esp, Some(enc), _) => enc.transform_id() as u8,
        (IpsecProtocol::Ah, _, Some(integ)) => integ.v1_ah_transform_id(),
        _ => 0,
    };
    let mut attributes = vec![
        Attribute::number(ipsec::SA_LIFE_TYPE, LIFE_TYPE_SECONDS as u32),
        Attribute::number(ipsec::SA_LIFE_DURATION, lifetime_secs(security.lifetime.hard)),
    ];
    if let Some(group) = pfs {
        attributes.push(Attribute::number(ipsec::GROUP_DESCRIPTION, group.number() as u32));
    }
    attributes.push(Attribute::number(
        ipsec::ENCAPSULATION_MODE,
        encapsulation(&security.mode) as u32,
    ));
    if let Some(integ) = security.integrity {
        attributes.push(Attribute::number(ipsec::AUTH_ALGORITHM, integ.v1_attribute() as u32));
    }
    if security
        .encryption
        .map_or(false, EncryptionAlgorithm::has_variable_key_len)
    {
        attributes.push(Attribute::number(ipsec::KEY_LENGTH, security.key_bits() as u32));
    }
    Transform {
        number: 1,
        transform_id,
        attributes,
    }
}

/// Quick Mode SA proposals for a security protocol list
///
/// All entries share proposal number 1; `spis` holds our inbound SPI of
/// each entry.
pub fn construct_phase2_proposals(
    security: &[SecurityProtocol],
    spis: &[u32],
    pfs: Option<DhGroup>,
) -> Result<Vec<Proposal>> {
    if security.is_empty() || security.len() != spis.len() {
        return Err(Error::InvalidParameter(
            "One SPI per security protocol required".into(),
        ));
    }
    Ok(security
        .iter()
        .zip(spis)
        .map(|(sec, spi)| Proposal {
            number: 1,
            protocol_id: protocol_id(sec.protocol).to_u8(),
            spi: spi.to_be_bytes().to_vec(),
            transforms: vec![phase2_transform(sec, pfs)],
        })
        .collect())
}

fn phase2_matches(
    protocol: u8,
    t: &Transform,
    local: &SecurityProtocol,
    pfs: Option<DhGroup>,
) -> bool {
    if protocol != protocol_id(local.protocol).to_u8() {
        return false;
    }
    let group_ok = t.attribute(ipsec::GROUP_DESCRIPTION) == pfs.map(|g| g.number() as u32);
    let mode_ok = t
        .attribute(ipsec::ENCAPSULATION_MODE)
        .unwrap_or(ipsec::ENCAP_TUNNEL as u32)
        == encapsulation(&local.mode) as u32;
    let integ_ok = t.attribute(ipsec::AUTH_ALGORITHM)
        == local.integrity.map(|i| i.v1_attribute() as u32);
    let algorithm_ok = match (local.protocol, local.encryption, local.integrity) {
        (IpsecProtocol::Esp, Some(enc), _) => {
            let key_ok = match t.attribute(ipsec::KEY_LENGTH) {
                Some(bits) => bits == local.key_bits() as u32,
                None => !enc.has_variable_key_len(),
            };
            t.transform_id as u16 == enc.transform_id() && key_ok
        }
        (IpsecProtocol::Ah, _, Some(integ)) => {
            IntegrityAlgorithm::from_v1_ah_transform_id(t.transform_id) == Some(integ)
        }
        _ => false,
    };
    group_ok && mode_ok && integ_ok && algorithm_ok
}

/// One matched wire entry of an accepted Quick Mode proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Match {
    /// Index into the local security protocol list
    pub local_index: usize,
    /// Peer's inbound SPI
    pub peer_spi: u32,
    /// Transform chosen from the entry
    pub transform: Transform,
    /// Agreed protection
    pub security: SecurityProtocol,
}

/// Accepted Quick Mode proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Selection {
    /// Proposal number
    pub number: u8,
    /// Matched entries in wire order
    pub entries: Vec<Phase2Match>,
}

impl Phase2Selection {
    /// Proposal payloads to send back, with our inbound SPIs
    pub fn response_proposals(&self, spis: &[u32]) -> Vec<Proposal> {
        self.entries
            .iter()
            .zip(spis)
            .map(|(e, spi)| Proposal {
                number: self.number,
                protocol_id: protocol_id(e.security.protocol).to_u8(),
                spi: spi.to_be_bytes().to_vec(),
                transforms: vec![e.transform.clone()],
            })
            .collect()
    }

    /// Agreed protection in wire order
    pub fn security(&self) -> Vec<SecurityProtocol> {
        self.entries.iter().map(|e| e.security.clone()).collect()
    }

    /// Peer SPIs in wire order
    pub fn peer_spis(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.peer_spi).collect()
    }
}

/// Select a Quick Mode proposal
///
/// Wire entries sharing a proposal number form one group; a group is a
/// candidate only when its span equals the number of local security
/// protocols. Each entry may carry alternative transforms; the first
/// one matching an unused local protocol is taken.
///
/// # Errors
///
/// Returns [`Error::NoProposalChosen`] when no group matches.
pub fn select_phase2(
    local: &[SecurityProtocol],
    received: &[Proposal],
    pfs: Option<DhGroup>,
) -> Result<Phase2Selection> {
    let mut start = 0;
    while start < received.len() {
        let number = received[start].number;
        let span = received[start..]
            .iter()
            .take_while(|p| p.number == number)
            .count();
        let group = &received[start..start + span];
        start += span;

        if span != local.len() {
            tracing::debug!(number, span, local = local.len(), "Proposal span mismatch");
            continue;
        }

        let mut used = vec![false; local.len()];
        let mut entries = Vec::with_capacity(span);
        for p in group {
            let found = p.transforms.iter().find_map(|t| {
                (0..local.len())
                    .find(|&j| !used[j] && phase2_matches(p.protocol_id, t, &local[j], pfs))
                    .map(|j| (j, t))
            });
            let Some((j, t)) = found else {
                break;
            };
            used[j] = true;
            entries.push(Phase2Match {
                local_index: j,
                peer_spi: p.spi_u32()?,
                transform: t.clone(),
                security: local[j].clone(),
            });
        }
        if entries.len() != span {
            continue;
        }

        logging::log_proposal_negotiation(received.len(), Some(number));
        return Ok(Phase2Selection { number, entries });
    }

    logging::log_proposal_negotiation(received.len(), None);
    Err(Error::NoProposalChosen)
}

/// Check the responder's Quick Mode answer against what was offered
///
/// Entries must come back in the offered order with one transform each.
pub fn accepted_phase2(
    offered: &[SecurityProtocol],
    response: &[Proposal],
    pfs: Option<DhGroup>,
) -> Result<Phase2Selection> {
    let number = response.first().ok_or(Error::NoProposalChosen)?.number;
    if response.len() != offered.len() || response.iter().any(|p| p.number != number) {
        return Err(Error::NoProposalChosen);
    }
    let mut entries = Vec::with_capacity(response.len());
    for (j, (p, local)) in response.iter().zip(offered).enumerate() {
        let [t] = p.transforms.as_slice() else {
            return Err(Error::NoProposalChosen);
        };
        if !phase2_matches(p.protocol_id, t, local, pfs) {
            return Err(Error::NoProposalChosen);
        }
        entries.push(Phase2Match {
            local_index: j,
            peer_spi: p.spi_u32()?,
            transform: t.clone(),
            security: local.clone(),
        });
    }
    Ok(Phase2Selection { number, entries })
}
