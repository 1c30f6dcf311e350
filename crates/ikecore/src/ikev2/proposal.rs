//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal encoding and negotiation as defined in
//! RFC 7296 Section 3.3.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//!               └── Attribute(s)   (key length only)
//! ```
//!
//! Child SA proposals that bundle several protocols (AH and ESP) are sent
//! as consecutive wire entries sharing one proposal number; the number of
//! entries in such a group is its span.

use bytes::{BufMut, BytesMut};

use super::constants::{ProtocolId, TransformType, ATTR_FORMAT_TV, ATTR_KEY_LENGTH};
use crate::config::Phase1Attributes;
use crate::crypto::{DhGroup, EncryptionAlgorithm};
use crate::error::{Error, Result};
use crate::logging;
use crate::spd::{IpsecProtocol, SecurityProtocol};

/// Transform ID of the "none" DH group
const DH_NONE: u16 = 0;

/// One algorithm choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,
    /// Transform ID
    pub id: u16,
    /// Key length attribute in bits
    pub key_length: Option<u16>,
}

impl Transform {
    /// Transform without attributes
    pub fn new(transform_type: TransformType, id: u16) -> Self {
        Transform {
            transform_type,
            id,
            key_length: None,
        }
    }

    /// Encryption transform, with a key-length attribute for variable
    /// length ciphers
    pub fn encryption(alg: EncryptionAlgorithm, key_bits: Option<u16>) -> Self {
        let key_length = if alg.has_variable_key_len() {
            alg.expected_key_bits(key_bits)
        } else {
            None
        };
        Transform {
            transform_type: TransformType::Encr,
            id: alg.transform_id(),
            key_length,
        }
    }

    /// Serialize transform (RFC 7296 Section 3.3.2)
    ///
    /// ```text
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | Last Substruc |   RESERVED    |        Transform Length       |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |Transform Type |   RESERVED    |          Transform ID         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ~                      Transform Attributes                     ~
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn encode(&self, is_last: bool, buf: &mut BytesMut) {
        let len = if self.key_length.is_some() { 12 } else { 8 };

        // Last/More: 0 = last, 3 = more
        buf.put_u8(if is_last { 0 } else { 3 });
        buf.put_u8(0);
        buf.put_u16(len);
        buf.put_u8(self.transform_type.to_u8());
        buf.put_u8(0);
        buf.put_u16(self.id);

        if let Some(bits) = self.key_length {
            buf.put_u16(ATTR_FORMAT_TV | ATTR_KEY_LENGTH);
            buf.put_u16(bits);
        }
    }

    /// Parse one transform
    ///
    /// # Returns
    ///
    /// Returns `(transform, is_last, bytes_consumed)`. The transform is
    /// `None` when its type is not one this implementation knows.
    pub fn decode(data: &[u8]) -> Result<(Option<Self>, bool, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let is_last = match data[0] {
            0 => true,
            3 => false,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Invalid transform substructure marker {}",
                    other
                )))
            }
        };
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < 8 || len > data.len() {
            return Err(Error::InvalidLength {
                expected: len.max(8),
                actual: data.len(),
            });
        }

        let id = u16::from_be_bytes([data[6], data[7]]);
        let mut key_length = None;
        let mut attrs = &data[8..len];
        while !attrs.is_empty() {
            if attrs.len() < 4 {
                return Err(Error::InvalidPayload("Truncated transform attribute".into()));
            }
            let raw_type = u16::from_be_bytes([attrs[0], attrs[1]]);
            let value = u16::from_be_bytes([attrs[2], attrs[3]]);
            if raw_type & ATTR_FORMAT_TV != 0 {
                if raw_type & !ATTR_FORMAT_TV == ATTR_KEY_LENGTH {
                    key_length = Some(value);
                }
                attrs = &attrs[4..];
            } else {
                // TLV attributes are not defined for IKEv2 transforms; skip them
                let end = 4 + value as usize;
                if end > attrs.len() {
                    return Err(Error::InvalidPayload("Truncated transform attribute".into()));
                }
                attrs = &attrs[end..];
            }
        }

        let transform = TransformType::from_u8(data[4]).map(|transform_type| Transform {
            transform_type,
            id,
            key_length,
        });
        Ok((transform, is_last, len))
    }
}

/// One proposal entry on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number
    pub number: u8,
    /// Protocol ID
    pub protocol: ProtocolId,
    /// SPI (empty in the initial IKE SA negotiation)
    pub spi: Vec<u8>,
    /// Transforms
    pub transforms: Vec<Transform>,
    /// Whether the peer included transform types not understood here
    pub has_unknown_transforms: bool,
}

impl Proposal {
    /// Create empty proposal
    pub fn new(number: u8, protocol: ProtocolId, spi: Vec<u8>) -> Self {
        Proposal {
            number,
            protocol,
            spi,
            transforms: Vec::new(),
            has_unknown_transforms: false,
        }
    }

    /// Add a transform
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Transforms of one type
    pub fn transforms_of(&self, transform_type: TransformType) -> impl Iterator<Item = &Transform> {
        self.transforms
            .iter()
            .filter(move |t| t.transform_type == transform_type)
    }

    /// Child SA SPI as a 32-bit value
    pub fn child_spi(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidLength {
                expected: 4,
                actual: self.spi.len(),
            })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Serialize proposal (RFC 7296 Section 3.3.1)
    pub fn encode(&self, is_last: bool, buf: &mut BytesMut) {
        let mut transforms = BytesMut::new();
        for (i, t) in self.transforms.iter().enumerate() {
            t.encode(i + 1 == self.transforms.len(), &mut transforms);
        }
        let len = 8 + self.spi.len() + transforms.len();

        // Last/More: 0 = last, 2 = more
        buf.put_u8(if is_last { 0 } else { 2 });
        buf.put_u8(0);
        buf.put_u16(len as u16);
        buf.put_u8(self.number);
        buf.put_u8(self.protocol.to_u8());
        buf.put_u8(self.spi.len() as u8);
        buf.put_u8(self.transforms.len() as u8);
        buf.put_slice(&self.spi);
        buf.put_slice(&transforms);
    }

    /// Parse one proposal
    ///
    /// # Returns
    ///
    /// Returns `(proposal, is_last, bytes_consumed)`
    pub fn decode(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let is_last = match data[0] {
            0 => true,
            2 => false,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Invalid proposal substructure marker {}",
                    other
                )))
            }
        };
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < 8 || len > data.len() {
            return Err(Error::InvalidLength {
                expected: len.max(8),
                actual: data.len(),
            });
        }

        let number = data[4];
        let protocol = ProtocolId::from_u8(data[5]).ok_or(Error::InvalidProtocol(data[5]))?;
        let spi_size = data[6] as usize;
        let count = data[7] as usize;
        if 8 + spi_size > len {
            return Err(Error::InvalidPayload("SPI exceeds proposal length".into()));
        }
        let spi = data[8..8 + spi_size].to_vec();

        let mut proposal = Proposal::new(number, protocol, spi);
        let mut offset = 8 + spi_size;
        for i in 0..count {
            let (transform, last, used) = Transform::decode(&data[offset..len])?;
            match transform {
                Some(t) => proposal.transforms.push(t),
                None => proposal.has_unknown_transforms = true,
            }
            offset += used;
            if last != (i + 1 == count) {
                return Err(Error::InvalidPayload(
                    "Transform count does not match last marker".into(),
                ));
            }
        }
        if offset != len {
            return Err(Error::InvalidLength {
                expected: len,
                actual: offset,
            });
        }

        Ok((proposal, is_last, len))
    }
}

/// Serialize a proposal list as SA payload body
pub fn encode_proposals(proposals: &[Proposal], buf: &mut BytesMut) {
    for (i, p) in proposals.iter().enumerate() {
        p.encode(i + 1 == proposals.len(), buf);
    }
}

/// Parse an SA payload body
pub fn decode_proposals(data: &[u8]) -> Result<Vec<Proposal>> {
    let mut proposals = Vec::new();
    let mut offset = 0;
    loop {
        if offset >= data.len() {
            return Err(Error::InvalidPayload("SA payload without last proposal".into()));
        }
        let (proposal, is_last, used) = Proposal::decode(&data[offset..])?;
        proposals.push(proposal);
        offset += used;
        if is_last {
            break;
        }
    }
    if offset != data.len() {
        return Err(Error::InvalidLength {
            expected: offset,
            actual: data.len(),
        });
    }
    Ok(proposals)
}

/// Build the IKE SA proposal list, one proposal per local suite
///
/// Proposal numbers are one octet; suites past the 255th are not offered.
///
/// # Arguments
///
/// * `suites` - Local suites in preference order
/// * `spi` - Proposal SPI (empty in IKE_SA_INIT, the new SPI when re-keying)
pub fn construct_ike_proposals(suites: &[Phase1Attributes], spi: &[u8]) -> Vec<Proposal> {
    suites
        .iter()
        .zip(1..=u8::MAX)
        .map(|(suite, number)| ike_proposal_for(number, suite, spi))
        .collect()
}

fn ike_proposal_for(number: u8, suite: &Phase1Attributes, spi: &[u8]) -> Proposal {
    let mut proposal = Proposal::new(number, ProtocolId::Ike, spi.to_vec())
        .with_transform(Transform::encryption(suite.encryption, suite.key_bits))
        .with_transform(Transform::new(TransformType::Prf, suite.prf.transform_id()));
    if let Some(integ) = suite.integrity {
        proposal =
            proposal.with_transform(Transform::new(TransformType::Integ, integ.transform_id()));
    }
    proposal.with_transform(Transform::new(TransformType::Dh, suite.group.number()))
}

/// Accepted IKE SA proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeSelection {
    /// Proposal to send back (one transform per type)
    pub proposal: Proposal,
    /// Index of the matching local suite
    pub suite_index: usize,
    /// Matching local suite
    pub suite: Phase1Attributes,
}

fn encryption_matches(t: &Transform, alg: EncryptionAlgorithm, key_bits: Option<u16>) -> bool {
    if t.id != alg.transform_id() {
        return false;
    }
    match t.key_length {
        Some(bits) => Some(bits) == alg.expected_key_bits(key_bits),
        None => !alg.has_variable_key_len(),
    }
}

fn has_transform(p: &Proposal, transform_type: TransformType, id: u16) -> bool {
    p.transforms_of(transform_type).any(|t| t.id == id)
}

fn ike_suite_matches(p: &Proposal, suite: &Phase1Attributes) -> bool {
    let encr = p
        .transforms_of(TransformType::Encr)
        .any(|t| encryption_matches(t, suite.encryption, suite.key_bits));
    let prf = has_transform(p, TransformType::Prf, suite.prf.transform_id());
    let dh = has_transform(p, TransformType::Dh, suite.group.number());
    let integ = match suite.integrity {
        Some(integ) => has_transform(p, TransformType::Integ, integ.transform_id()),
        None => suite.encryption.is_aead(),
    };
    encr && prf && dh && integ
}

/// Select an IKE SA proposal
///
/// Proposals are evaluated in wire order; for each one the local suites
/// are tried in preference order and the first complete match wins.
///
/// # Arguments
///
/// * `suites` - Local suites
/// * `received` - Proposals offered by the peer
/// * `ke_group` - Group of the peer's KE payload, if one was sent
///
/// # Errors
///
/// * [`Error::InvalidProtocol`] for a proposal that is not for IKE
/// * [`Error::InvalidKePayload`] when the matching suite uses another
///   group than the KE payload
/// * [`Error::NoProposalChosen`] when nothing matches
pub fn select_ike_proposal(
    suites: &[Phase1Attributes],
    received: &[Proposal],
    ke_group: Option<u16>,
) -> Result<IkeSelection> {
    for p in received {
        if p.protocol != ProtocolId::Ike {
            return Err(Error::InvalidProtocol(p.protocol.to_u8()));
        }
        if p.has_unknown_transforms {
            continue;
        }
        for (suite_index, suite) in suites.iter().enumerate() {
            if !ike_suite_matches(p, suite) {
                continue;
            }
            if let Some(group) = ke_group {
                if group != suite.group.number() {
                    return Err(Error::InvalidKePayload {
                        expected_group: suite.group.number(),
                    });
                }
            }
            logging::log_proposal_negotiation(received.len(), Some(p.number));
            let proposal = ike_proposal_for(p.number, suite, &p.spi);
            return Ok(IkeSelection {
                proposal,
                suite_index,
                suite: *suite,
            });
        }
    }
    logging::log_proposal_negotiation(received.len(), None);
    Err(Error::NoProposalChosen)
}

/// Parse the suite chosen by the responder
///
/// The response must carry exactly one transform per type and match one
/// of the suites that were offered.
pub fn accepted_ike_suite(
    offered: &[Phase1Attributes],
    response: &[Proposal],
) -> Result<Phase1Attributes> {
    let [p] = response else {
        return Err(Error::InvalidPayload(
            "Response must carry exactly one proposal".into(),
        ));
    };
    if p.protocol != ProtocolId::Ike {
        return Err(Error::InvalidProtocol(p.protocol.to_u8()));
    }
    for transform_type in [TransformType::Encr, TransformType::Prf, TransformType::Dh] {
        if p.transforms_of(transform_type).count() != 1 {
            return Err(Error::InvalidPayload(format!(
                "Response must carry one {:?} transform",
                transform_type
            )));
        }
    }
    offered
        .iter()
        .find(|suite| ike_suite_matches(p, suite))
        .copied()
        .ok_or(Error::NoProposalChosen)
}

fn child_transforms(security: &SecurityProtocol, pfs: Option<DhGroup>) -> Vec<Transform> {
    let mut transforms = Vec::new();
    if let Some(enc) = security.encryption {
        transforms.push(Transform::encryption(enc, security.encryption_key_bits));
    }
    if let Some(integ) = security.integrity {
        transforms.push(Transform::new(TransformType::Integ, integ.transform_id()));
    }
    if let Some(group) = pfs {
        transforms.push(Transform::new(TransformType::Dh, group.number()));
    }
    transforms.push(Transform::new(TransformType::Esn, security.esn as u16));
    transforms
}

/// Wire protocol ID of a child SA protocol
pub fn protocol_id(protocol: IpsecProtocol) -> ProtocolId {
    match protocol {
        IpsecProtocol::Ah => ProtocolId::Ah,
        IpsecProtocol::Esp => ProtocolId::Esp,
    }
}

/// Build the child SA proposal for a security protocol list
///
/// All entries share proposal number 1; `spis` holds the local inbound
/// SPI of each entry.
pub fn construct_child_proposals(
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
        .map(|(sec, spi)| {
            let mut p = Proposal::new(1, protocol_id(sec.protocol), spi.to_be_bytes().to_vec());
            p.transforms = child_transforms(sec, pfs);
            p
        })
        .collect())
}

fn child_entry_matches(p: &Proposal, local: &SecurityProtocol) -> bool {
    if p.protocol != protocol_id(local.protocol) || p.has_unknown_transforms {
        return false;
    }
    let esn = has_transform(p, TransformType::Esn, local.esn as u16);
    let integ = match local.integrity {
        Some(integ) => has_transform(p, TransformType::Integ, integ.transform_id()),
        None => true,
    };
    match local.protocol {
        IpsecProtocol::Esp => {
            let encr = match local.encryption {
                Some(enc) => p
                    .transforms_of(TransformType::Encr)
                    .any(|t| encryption_matches(t, enc, local.encryption_key_bits)),
                None => false,
            };
            encr && integ && esn
        }
        IpsecProtocol::Ah => local.integrity.is_some() && integ && esn,
    }
}

/// One matched wire entry of an accepted child proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildMatch {
    /// Index into the local security protocol list
    pub local_index: usize,
    /// Peer's inbound SPI for this protocol
    pub peer_spi: u32,
    /// Agreed protection
    pub security: SecurityProtocol,
}

/// Accepted child SA proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSelection {
    /// Proposal number
    pub number: u8,
    /// Matched entries in wire order
    pub entries: Vec<ChildMatch>,
    /// PFS group in use
    pub pfs: Option<DhGroup>,
}

impl ChildSelection {
    /// Proposal entries to send back, with our inbound SPIs
    pub fn response_proposals(&self, spis: &[u32]) -> Result<Vec<Proposal>> {
        let security: Vec<SecurityProtocol> =
            self.entries.iter().map(|e| e.security.clone()).collect();
        let mut proposals = construct_child_proposals(&security, spis, self.pfs)?;
        for p in &mut proposals {
            p.number = self.number;
        }
        Ok(proposals)
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

fn pfs_acceptable(group: &[Proposal], pfs: Option<DhGroup>, ke_group: Option<u16>) -> Result<bool> {
    match pfs {
        Some(g) => {
            if !group.iter().all(|p| has_transform(p, TransformType::Dh, g.number())) {
                return Ok(false);
            }
            if ke_group != Some(g.number()) {
                return Err(Error::InvalidKePayload {
                    expected_group: g.number(),
                });
            }
            Ok(true)
        }
        None => Ok(group.iter().all(|p| {
            p.transforms_of(TransformType::Dh).next().is_none()
                || has_transform(p, TransformType::Dh, DH_NONE)
        })),
    }
}

/// Select a child SA proposal
///
/// Wire entries sharing a proposal number form one group; a group is a
/// candidate only when its span equals the number of local security
/// protocols. Entries are matched against local protocols in any order,
/// each local protocol used at most once.
///
/// # Errors
///
/// * [`Error::InvalidProposalNumber`] when the first number is not 1
/// * [`Error::InvalidKePayload`] when PFS is required and the KE payload
///   uses another group
/// * [`Error::NoProposalChosen`] when nothing matches
pub fn select_child_proposal(
    local: &[SecurityProtocol],
    received: &[Proposal],
    pfs: Option<DhGroup>,
    ke_group: Option<u16>,
) -> Result<ChildSelection> {
    let first = received.first().ok_or(Error::NoProposalChosen)?;
    if first.number != 1 {
        return Err(Error::InvalidProposalNumber(first.number));
    }

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
            let Some(j) = (0..local.len()).find(|&j| !used[j] && child_entry_matches(p, &local[j]))
            else {
                break;
            };
            used[j] = true;
            entries.push(ChildMatch {
                local_index: j,
                peer_spi: p.child_spi()?,
                security: local[j].clone(),
            });
        }
        if entries.len() != span {
            continue;
        }
        if !pfs_acceptable(group, pfs, ke_group)? {
            continue;
        }

        logging::log_proposal_negotiation(received.len(), Some(number));
        return Ok(ChildSelection {
            number,
            entries,
            pfs,
        });
    }

    logging::log_proposal_negotiation(received.len(), None);
    Err(Error::NoProposalChosen)
}

/// Check the responder's child SA answer against what was offered
pub fn accepted_child_proposal(
    offered: &[SecurityProtocol],
    response: &[Proposal],
    pfs: Option<DhGroup>,
) -> Result<ChildSelection> {
    let number = response.first().ok_or(Error::NoProposalChosen)?.number;
    if response.len() != offered.len() {
        return Err(Error::NoProposalChosen);
    }
    let mut used = vec![false; offered.len()];
    let mut entries = Vec::with_capacity(response.len());
    for p in response {
        let j = (0..offered.len())
            .find(|&j| !used[j] && child_entry_matches(p, &offered[j]))
            .ok_or(Error::NoProposalChosen)?;
        used[j] = true;
        entries.push(ChildMatch {
            local_index: j,
            peer_spi: p.child_spi()?,
            security: offered[j].clone(),
        });
    }
    Ok(ChildSelection {
        number,
        entries,
        pfs,
    })
}
