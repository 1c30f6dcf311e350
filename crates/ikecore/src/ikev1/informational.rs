//! Informational exchange and HASH-protected payload chains
//!
//! ```text
//! HDR*, HASH(1), N/D
//! HASH(1) = prf(SKEYID_a, M-ID | N/D)
//! ```
//!
//! Informational messages are one-way: nothing answers them. Before
//! the ISAKMP SA has keys, errors are reported in the clear.
//!
//! The same HASH(1) construction protects every Quick Mode message
//! except the third, so the helpers here serve both exchanges.

use super::constants::{ExchangeType, IsakmpFlags, NotifyType, PayloadType, ProtocolId};
use super::keymat::{message_hash, phase2_iv};
use super::message::{
    encode_payloads, DeletePayload, IsakmpMessage, NotifyPayload, Payload, PayloadChain,
};
use super::sa::IsakmpSa;
use crate::crypto::{verify_equal, CryptoProvider};
use crate::error::{Error, Result};
use crate::logging;
use crate::spd::{IpsecProtocol, SecurityPolicyDb};

/// Notification to send for a failed negotiation step
pub fn notify_for_error(e: &Error) -> Option<NotifyType> {
    match e {
        Error::NoProposalChosen | Error::InvalidProposalNumber(_) => {
            Some(NotifyType::NoProposalChosen)
        }
        Error::InvalidKePayload { .. } => Some(NotifyType::InvalidKeyInformation),
        Error::TsUnacceptable => Some(NotifyType::InvalidIdInformation),
        Error::VerifyFailed(_) => Some(NotifyType::InvalidHashInformation),
        Error::AuthenticationFailed(_) => Some(NotifyType::AuthenticationFailed),
        Error::InvalidMessage(_)
        | Error::InvalidPayload(_)
        | Error::MissingPayload(_)
        | Error::InvalidLength { .. }
        | Error::BufferTooShort { .. } => Some(NotifyType::PayloadMalformed),
        Error::InvalidSpi(_) => Some(NotifyType::InvalidSpi),
        Error::InvalidMessageId { .. } => Some(NotifyType::InvalidMessageId),
        Error::InvalidProtocol(_) => Some(NotifyType::InvalidProtocolId),
        Error::UnsupportedVersion(_) => Some(NotifyType::InvalidMajorVersion),
        Error::UnsupportedExchangeType(_) => Some(NotifyType::InvalidExchangeType),
        _ => None,
    }
}

/// Notifications found in a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    /// INITIAL_CONTACT
    pub initial_contact: bool,
    /// CONNECTED with the protocol and SPI it names
    pub connected: Option<(u8, Vec<u8>)>,
    /// First error notification
    pub error: Option<NotifyPayload>,
}

impl NotifyFlags {
    /// Error carried by the message, if any
    pub fn as_error(&self) -> Result<()> {
        match &self.error {
            Some(n) => Err(Error::Notified(n.notify_type)),
            None => Ok(()),
        }
    }
}

/// Collect the notifications of a message
pub fn process_notifies(payloads: &[Payload]) -> NotifyFlags {
    let mut flags = NotifyFlags::default();
    for payload in payloads {
        let Payload::Notify(n) = payload else {
            continue;
        };
        let is_error = NotifyType::is_error_type(n.notify_type);
        logging::log_notify_received(n.notify_type, is_error);
        if is_error {
            flags.error.get_or_insert_with(|| n.clone());
            continue;
        }
        match NotifyType::from_u16(n.notify_type) {
            Some(NotifyType::InitialContact) => flags.initial_contact = true,
            Some(NotifyType::Connected) => flags.connected = Some((n.protocol_id, n.spi.clone())),
            _ => {}
        }
    }
    flags
}

/// Prepend HASH(1)/HASH(2)/HASH(4) to `payloads`
///
/// `ni` is the initiator nonce for HASH(2), `None` otherwise.
pub fn with_hash(
    provider: &dyn CryptoProvider,
    sa: &IsakmpSa,
    message_id: u32,
    ni: Option<&[u8]>,
    payloads: Vec<Payload>,
) -> Result<Vec<Payload>> {
    let keys = sa.keys()?;
    let (_, rest) = encode_payloads(&payloads);
    let hash = message_hash(provider, sa.suite.prf, &keys.skeyid_a, message_id, ni, &rest)?;
    let mut out = Vec::with_capacity(payloads.len() + 1);
    out.push(Payload::Hash(hash));
    out.extend(payloads);
    Ok(out)
}

/// Check that a decrypted chain starts with a valid HASH payload
///
/// # Errors
///
/// Returns [`Error::MissingPayload`] when HASH is not the first payload
/// and [`Error::VerifyFailed`] when it does not match.
pub fn check_hash(
    provider: &dyn CryptoProvider,
    sa: &IsakmpSa,
    message_id: u32,
    ni: Option<&[u8]>,
    chain: &PayloadChain,
) -> Result<()> {
    let Some(Payload::Hash(received)) = chain.payloads.first() else {
        return Err(Error::MissingPayload("HASH".into()));
    };
    let keys = sa.keys()?;
    let expected = message_hash(
        provider,
        sa.suite.prf,
        &keys.skeyid_a,
        message_id,
        ni,
        &chain.raw_from(1),
    )?;
    if !verify_equal(&expected, received) {
        return Err(Error::VerifyFailed("HASH payload mismatch".into()));
    }
    Ok(())
}

/// Encrypted informational message carrying `payloads`
///
/// Returns the message ID used with the wire message.
pub fn build_informational(
    provider: &dyn CryptoProvider,
    sa: &IsakmpSa,
    payloads: Vec<Payload>,
) -> Result<(u32, Vec<u8>)> {
    let mut buf = [0u8; 4];
    let mut message_id = 0;
    while !sa.is_free_message_id(message_id) {
        provider.random_bytes(&mut buf)?;
        message_id = u32::from_be_bytes(buf);
    }
    let block = sa.suite.encryption.block_size();
    let iv = phase2_iv(provider, sa.suite.hash, &sa.iv, message_id, block)?;
    let payloads = with_hash(provider, sa, message_id, None, payloads)?;
    let header = sa.header(ExchangeType::Informational, message_id, IsakmpFlags::default());
    let (data, _) = sa.seal(provider, &header, &iv, &payloads)?;
    Ok((message_id, data))
}

/// Decrypt and authenticate an informational message
pub fn open_informational(
    provider: &dyn CryptoProvider,
    sa: &IsakmpSa,
    data: &[u8],
    message_id: u32,
) -> Result<Vec<Payload>> {
    let block = sa.suite.encryption.block_size();
    let iv = phase2_iv(provider, sa.suite.hash, &sa.iv, message_id, block)?;
    let opened = sa.open(provider, &iv, data)?;
    check_hash(provider, sa, message_id, None, &opened.chain)?;
    let mut payloads = opened.chain.payloads;
    payloads.remove(0);
    Ok(payloads)
}

/// Unprotected informational message with one notification
///
/// Used while the ISAKMP SA has no keys.
pub fn plain_notify(cookies: ([u8; 8], [u8; 8]), notify: NotifyType) -> Vec<u8> {
    let header = super::message::IsakmpHeader::new(
        cookies.0,
        cookies.1,
        ExchangeType::Informational,
        IsakmpFlags::default(),
        0,
    );
    let notify = Payload::Notify(NotifyPayload::new(notify, Vec::new()));
    IsakmpMessage::new(header, vec![notify]).encode()
}

/// Delete payloads of a message
pub fn deletes(payloads: &[Payload]) -> impl Iterator<Item = &DeletePayload> {
    payloads.iter().filter_map(|p| match p {
        Payload::Delete(d) => Some(d),
        _ => None,
    })
}

/// What a peer's Delete payload asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The ISAKMP SA itself is to go
    pub isakmp: bool,
    /// Child SA pairs removed
    pub removed: usize,
}

fn ipsec_protocol(protocol_id: u8) -> Result<IpsecProtocol> {
    match ProtocolId::from_u8(protocol_id) {
        Some(ProtocolId::Ah) => Ok(IpsecProtocol::Ah),
        Some(ProtocolId::Esp) => Ok(IpsecProtocol::Esp),
        _ => Err(Error::InvalidProtocol(protocol_id)),
    }
}

/// Apply a peer's Delete payload
///
/// IPsec SPIs in the payload are the peer's inbound SPIs, i.e. our
/// outbound ones. Pairs not tracked by `sa` are looked up in
/// `fallback_group` by the peer's address; a miss is only logged.
pub fn apply_delete(
    spd: &mut SecurityPolicyDb,
    sa: &mut IsakmpSa,
    fallback_group: &str,
    delete: &DeletePayload,
) -> Result<DeleteOutcome> {
    let mut outcome = DeleteOutcome::default();
    if delete.protocol_id == ProtocolId::Isakmp.to_u8() {
        let ours = sa.cookies();
        outcome.isakmp = delete.spis.iter().any(|spi| *spi == ours);
        if !outcome.isakmp {
            tracing::debug!(peer = %sa.peer, "Delete names another ISAKMP SA");
        }
        return Ok(outcome);
    }

    let protocol = ipsec_protocol(delete.protocol_id)?;
    for spi in delete.ipsec_spis()? {
        if let Some(b) = sa.bundle_by_outbound(spi, protocol) {
            let bundle = &mut sa.children[b];
            let Some(pos) = bundle
                .pairs
                .iter()
                .position(|p| p.outbound_spi == spi && p.protocol == protocol)
            else {
                continue;
            };
            let pair = bundle.pairs.remove(pos);
            if bundle.pairs.is_empty() {
                sa.children.remove(b);
            }
            match spd.remove_sa_pair(&pair.group, spi, protocol, pair.destination) {
                Ok(_) | Err(Error::SaNotFound(_)) => {
                    logging::log_child_sa_deleted(pair.inbound_spi, "peer_delete");
                    outcome.removed += 1;
                }
                Err(e) => spd.errors().record("child SA delete", e),
            }
            continue;
        }

        match spd.remove_sa_pair(fallback_group, spi, protocol, sa.peer) {
            Ok(removed) => {
                logging::log_child_sa_deleted(removed.inbound_spi.unwrap_or(spi), "peer_delete");
                outcome.removed += 1;
            }
            Err(_) => logging::log_child_sa_delete_miss(spi, delete.protocol_id),
        }
    }
    Ok(outcome)
}

/// Position of the first payload of `payload_type` in a chain
pub fn find(chain: &PayloadChain, payload_type: PayloadType) -> Option<&Payload> {
    chain.position(payload_type).map(|i| &chain.payloads[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthenticationMethod, IkePolicy, IkeVersion, Phase1Attributes};
    use crate::crypto::{DefaultProvider, DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use crate::identity::Identifier;
    use crate::ikev1::keymat::OakleyKeys;
    use crate::ikev1::message::decode_payloads;
    use crate::spd::AddrSpec;
    use std::net::{IpAddr, Ipv4Addr};
    use zeroize::Zeroizing;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

    fn keyed_sa() -> IsakmpSa {
        let suite = Phase1Attributes::v1(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            HashAlgorithm::Sha256,
            DhGroup::Curve25519,
            AuthenticationMethod::PreSharedKey,
        );
        let policy = IkePolicy::builder()
            .with_name("p")
            .with_peer(AddrSpec::Single(PEER))
            .with_version(IkeVersion::V1Main)
            .with_attributes(suite)
            .with_local_id(Identifier::Fqdn("a.example".into()))
            .with_ipsec_group("g")
            .build()
            .unwrap();
        let mut sa = IsakmpSa::new(1, true, ([1; 8], [2; 8]), PEER, &policy, suite);
        sa.keys = Some(OakleyKeys {
            skeyid: Zeroizing::new(vec![1; 32]),
            skeyid_d: Zeroizing::new(vec![2; 32]),
            skeyid_a: Zeroizing::new(vec![3; 32]),
            skeyid_e: Zeroizing::new(vec![4; 32]),
            encryption_key: Zeroizing::new(vec![5; 16]),
        });
        sa.iv = vec![6; 16];
        sa
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(notify_for_error(&Error::NoProposalChosen), Some(NotifyType::NoProposalChosen));
        assert_eq!(
            notify_for_error(&Error::VerifyFailed("x".into())),
            Some(NotifyType::InvalidHashInformation)
        );
        assert_eq!(
            notify_for_error(&Error::TsUnacceptable),
            Some(NotifyType::InvalidIdInformation)
        );
        assert_eq!(notify_for_error(&Error::LockTimeout("spd".into())), None);
    }

    #[test]
    fn test_informational_roundtrip() {
        let p = DefaultProvider::new();
        let sa = keyed_sa();
        let delete = Payload::Delete(DeletePayload::ipsec(ProtocolId::Esp, &[0x1234]));
        let (message_id, data) = build_informational(&p, &sa, vec![delete.clone()]).unwrap();
        assert_ne!(message_id, 0);

        let payloads = open_informational(&p, &sa, &data, message_id).unwrap();
        assert_eq!(payloads, vec![delete]);

        // wrong message ID gives another IV and another hash
        assert!(open_informational(&p, &sa, &data, message_id ^ 1).is_err());
    }

    #[test]
    fn test_hash_must_lead() {
        let p = DefaultProvider::new();
        let sa = keyed_sa();
        let notify = Payload::Notify(NotifyPayload::new(NotifyType::InitialContact, Vec::new()));
        let hashed = with_hash(&p, &sa, 5, None, vec![notify.clone()]).unwrap();
        let (first, body) = encode_payloads(&hashed);
        let chain = decode_payloads(first, &body, false).unwrap();
        assert!(check_hash(&p, &sa, 5, None, &chain).is_ok());
        assert!(matches!(
            check_hash(&p, &sa, 5, Some(&[1, 2]), &chain),
            Err(Error::VerifyFailed(_))
        ));

        let (first, body) = encode_payloads(&[notify]);
        let bare = decode_payloads(first, &body, false).unwrap();
        assert!(matches!(
            check_hash(&p, &sa, 5, None, &bare),
            Err(Error::MissingPayload(_))
        ));
    }

    #[test]
    fn test_notify_flags() {
        let payloads = vec![
            Payload::Notify(NotifyPayload::new(NotifyType::InitialContact, Vec::new())),
            Payload::Notify(NotifyPayload::for_spi(NotifyType::Connected, ProtocolId::Esp, 9)),
            Payload::Notify(NotifyPayload::new(NotifyType::NoProposalChosen, Vec::new())),
        ];
        let flags = process_notifies(&payloads);
        assert!(flags.initial_contact);
        assert_eq!(flags.connected, Some((3, vec![0, 0, 0, 9])));
        assert_eq!(
            flags.as_error(),
            Err(Error::Notified(NotifyType::NoProposalChosen.to_u16()))
        );
    }

    #[test]
    fn test_isakmp_delete_matches_cookies() {
        let mut spd = SecurityPolicyDb::new(std::time::Duration::from_secs(1));
        spd.add_group("g").unwrap();
        let mut sa = keyed_sa();
        let ours = DeletePayload::isakmp([1; 8], [2; 8]);
        assert!(apply_delete(&mut spd, &mut sa, "g", &ours).unwrap().isakmp);
        let other = DeletePayload::isakmp([1; 8], [3; 8]);
        assert!(!apply_delete(&mut spd, &mut sa, "g", &other).unwrap().isakmp);

        // unknown child SPI is not an error
        let child = DeletePayload::ipsec(ProtocolId::Esp, &[0x4444]);
        assert_eq!(apply_delete(&mut spd, &mut sa, "g", &child).unwrap().removed, 0);
    }

    #[test]
    fn test_child_delete_skips_unknown_spi() {
        use crate::crypto::IntegrityAlgorithm;
        use crate::ikev1::sa::QuickBundle;
        use crate::install::{install_children, ChildKeys, ChildSaDescriptor};
        use crate::spd::{Flow, Policy, SaKeys, SecurityProtocol, Selector};

        let esp = SecurityProtocol::esp(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha1_96),
        );
        let local = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let selector = Selector::new(AddrSpec::Single(local), AddrSpec::Single(PEER));
        let mut spd = SecurityPolicyDb::new(std::time::Duration::from_secs(1));
        spd.add_group("g").unwrap();
        let index = spd
            .add_policy("g", Policy::apply(selector.clone(), Flow::Dual, vec![esp.clone()]))
            .unwrap();
        let keys = |fill: u8| SaKeys {
            encryption: Zeroizing::new(vec![fill; 16]),
            integrity: Zeroizing::new(vec![fill; 20]),
        };
        let pairs = install_children(
            &mut spd,
            "g",
            index,
            &selector,
            PEER,
            vec![ChildSaDescriptor {
                security: esp,
                inbound_spi: 0x1000,
                outbound_spi: 0x2000,
                keys: ChildKeys {
                    inbound: keys(1),
                    outbound: keys(2),
                },
            }],
            tokio::time::Instant::now(),
        )
        .unwrap();
        let outbound_index = pairs[0].outbound_index;

        let mut sa = keyed_sa();
        sa.children.push(QuickBundle {
            selector,
            pairs,
            rekeying: false,
        });

        let delete = DeletePayload::ipsec(ProtocolId::Esp, &[0x2000, 0x4444]);
        assert_eq!(apply_delete(&mut spd, &mut sa, "g", &delete).unwrap().removed, 1);
        assert!(sa.children.is_empty());
        assert!(spd.outbound_sa("g", outbound_index).is_err());
    }
}
