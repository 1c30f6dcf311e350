//! IKE SA and exchange handle
//!
//! An [`IkeSa`] owns everything negotiated with one peer: SPIs, the
//! chosen suite, key material, message ID counters, the saved response
//! used to answer retransmitted requests and the child SA bundles
//! installed under it. The request this side currently has in flight is
//! an [`ExchangeHandle`]; further requests wait in a queue until it
//! completes (window size one).

use std::collections::VecDeque;
use std::net::IpAddr;

use super::constants::{ExchangeType, IkeFlags, ProtocolId};
use super::crypt::{protect, unprotect, SkCipher};
use super::keymat::IkeSaKeys;
use super::message::{IkeHeader, IkeMessage};
use super::payload::Payload;
use super::state::{ExchangeState, IkeSaState};
use crate::config::Phase1Attributes;
use crate::crypto::{CryptoProvider, DhGroup, DhPrivateKey};
use crate::error::{Error, Result};
use crate::identity::Identifier;
use crate::install::InstalledChild;
use crate::logging;
use crate::spd::{SecurityProtocol, Selector};

/// Child SAs negotiated by one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildBundle {
    /// Selector the bundle was installed for (outbound view)
    pub selector: Selector,
    /// Installed pairs in negotiation order
    pub pairs: Vec<InstalledChild>,
    /// A replacement is being negotiated
    pub rekeying: bool,
}

impl ChildBundle {
    /// Whether the bundle holds the pair we send to with `outbound_spi`
    pub fn has_outbound(&self, outbound_spi: u32, protocol: ProtocolId) -> bool {
        self.pairs.iter().any(|p| {
            p.outbound_spi == outbound_spi && super::proposal::protocol_id(p.protocol) == protocol
        })
    }

    /// Whether the bundle holds the pair the peer sends to with `inbound_spi`
    pub fn has_inbound(&self, inbound_spi: u32, protocol: ProtocolId) -> bool {
        self.pairs.iter().any(|p| {
            p.inbound_spi == inbound_spi && super::proposal::protocol_id(p.protocol) == protocol
        })
    }
}

/// Child SA negotiation requested locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRequest {
    /// Policy group
    pub group: String,
    /// Policy needing the SAs
    pub policy_index: u32,
    /// Selector to offer (outbound view)
    pub selector: Selector,
    /// Protocols negotiated together
    pub security: Vec<SecurityProtocol>,
    /// Our inbound SPIs, one per protocol, filled in when the request is sent
    pub inbound_spis: Vec<u32>,
    /// PFS group (CREATE_CHILD_SA only)
    pub pfs: Option<DhGroup>,
    /// Bundle being re-keyed
    pub rekey: Option<Vec<InstalledChild>>,
}

/// What an INFORMATIONAL request carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoRequest {
    /// Empty message (liveness check)
    Liveness,
    /// Delete the IKE SA itself
    DeleteIke,
    /// Delete child SAs by our inbound SPIs
    DeleteChildren {
        /// Protocol
        protocol: ProtocolId,
        /// Our inbound SPIs
        spis: Vec<u32>,
    },
}

/// Request waiting for the current exchange to finish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedRequest {
    /// New or replacement child SA bundle
    Child(ChildRequest),
    /// Re-key the IKE SA
    RekeyIke,
    /// INFORMATIONAL exchange
    Info(InfoRequest),
}

/// Kind of request in flight
#[derive(Debug)]
pub enum PendingKind {
    /// IKE_SA_INIT
    SaInit {
        /// Suites offered, in the order they were offered
        offered: Vec<Phase1Attributes>,
        /// Cookie reflected from the responder
        cookie: Option<Vec<u8>>,
    },
    /// IKE_AUTH, possibly creating the first child bundle
    Auth,
    /// CREATE_CHILD_SA for a child bundle
    CreateChild,
    /// CREATE_CHILD_SA re-keying the IKE SA
    RekeyIke {
        /// SPI of the replacement SA on our side
        new_spi: [u8; 8],
        /// Suites offered
        offered: Vec<Phase1Attributes>,
    },
    /// INFORMATIONAL
    Info(InfoRequest),
}

impl PendingKind {
    /// Exchange type the request travels in
    pub fn exchange_type(&self) -> ExchangeType {
        match self {
            PendingKind::SaInit { .. } => ExchangeType::IkeSaInit,
            PendingKind::Auth => ExchangeType::IkeAuth,
            PendingKind::CreateChild | PendingKind::RekeyIke { .. } => ExchangeType::CreateChildSa,
            PendingKind::Info(_) => ExchangeType::Informational,
        }
    }
}

/// Request in flight
#[derive(Debug)]
pub struct ExchangeHandle {
    /// What was asked
    pub kind: PendingKind,
    /// Message ID of the request
    pub message_id: u32,
    /// Our nonce, when the exchange carries one
    pub nonce: Vec<u8>,
    /// Our Diffie-Hellman private value until the response arrives
    pub dh: Option<DhPrivateKey>,
    /// Child SAs being negotiated
    pub child: Option<ChildRequest>,
    /// Request as sent, for retransmission
    pub last_message: Vec<u8>,
    /// Retransmissions so far
    pub resend_count: u32,
}

impl ExchangeHandle {
    /// Handle for a request that has just been sent
    pub fn new(kind: PendingKind, message_id: u32, last_message: Vec<u8>) -> Self {
        ExchangeHandle {
            kind,
            message_id,
            nonce: Vec::new(),
            dh: None,
            child: None,
            last_message,
            resend_count: 0,
        }
    }
}

/// Material of the IKE_SA_INIT exchange needed by IKE_AUTH
#[derive(Debug, Clone, Default)]
pub struct InitExchange {
    /// IKE_SA_INIT request as transmitted
    pub request: Vec<u8>,
    /// IKE_SA_INIT response as transmitted
    pub response: Vec<u8>,
    /// Initiator nonce
    pub ni: Vec<u8>,
    /// Responder nonce
    pub nr: Vec<u8>,
}

/// IKE Security Association
#[derive(Debug)]
pub struct IkeSa {
    /// Local identifier, also the timer subject
    pub id: u64,
    /// Lifecycle state
    pub state: IkeSaState,
    /// Progress of IKE_SA_INIT / IKE_AUTH
    pub exchange_state: ExchangeState,
    /// Whether we were the original initiator
    pub is_initiator: bool,
    /// Initiator SPI
    pub initiator_spi: [u8; 8],
    /// Responder SPI (zero until assigned)
    pub responder_spi: [u8; 8],
    /// Peer address
    pub peer: IpAddr,
    /// Name of the IKE policy in use
    pub policy: String,
    /// Negotiated suite
    pub suite: Phase1Attributes,
    /// Key material, once IKE_SA_INIT completed
    pub keys: Option<IkeSaKeys>,
    /// Our identity
    pub local_id: Identifier,
    /// Authenticated peer identity
    pub peer_id: Option<Identifier>,
    /// Message ID of our next request
    pub next_message_id: u32,
    /// Message ID expected on the peer's next request
    pub peer_message_id: u32,
    /// Last response sent, by message ID
    pub last_response: Option<(u32, Vec<u8>)>,
    /// Request in flight
    pub pending: Option<ExchangeHandle>,
    /// Requests waiting for the window
    pub queued: VecDeque<QueuedRequest>,
    /// Installed child bundles
    pub children: Vec<ChildBundle>,
    /// Replacement SA after an IKE SA re-key
    pub replaced_by: Option<u64>,
    /// IKE_SA_INIT material
    pub init: InitExchange,
}

impl IkeSa {
    /// New SA in the negotiating state
    pub fn new(
        id: u64,
        is_initiator: bool,
        spis: ([u8; 8], [u8; 8]),
        peer: IpAddr,
        policy: &str,
        suite: Phase1Attributes,
        local_id: Identifier,
    ) -> Self {
        IkeSa {
            id,
            state: IkeSaState::Negotiating,
            exchange_state: if is_initiator {
                ExchangeState::SaInitI
            } else {
                ExchangeState::SaInitR
            },
            is_initiator,
            initiator_spi: spis.0,
            responder_spi: spis.1,
            peer,
            policy: policy.to_string(),
            suite,
            keys: None,
            local_id,
            peer_id: None,
            next_message_id: 0,
            peer_message_id: 0,
            last_response: None,
            pending: None,
            queued: VecDeque::new(),
            children: Vec::new(),
            replaced_by: None,
            init: InitExchange::default(),
        }
    }

    /// Our SPI
    pub fn local_spi(&self) -> [u8; 8] {
        if self.is_initiator {
            self.initiator_spi
        } else {
            self.responder_spi
        }
    }

    /// Peer's SPI (zero until assigned)
    pub fn peer_spi(&self) -> [u8; 8] {
        if self.is_initiator {
            self.responder_spi
        } else {
            self.initiator_spi
        }
    }

    /// Transition to a new lifecycle state
    pub fn transition_to(&mut self, new_state: IkeSaState) -> Result<()> {
        if !self.state.can_transition_to(new_state) {
            return Err(Error::InvalidState(format!(
                "Invalid state transition from {:?} to {:?}",
                self.state, new_state
            )));
        }
        logging::log_ike_state_transition(
            &self.initiator_spi,
            &self.responder_spi,
            self.state.name(),
            new_state.name(),
        );
        self.state = new_state;
        Ok(())
    }

    /// Advance IKE_SA_INIT / IKE_AUTH by one round trip
    pub fn advance(&mut self) -> Result<()> {
        let next = self.exchange_state.next()?;
        logging::log_ike_state_transition(
            &self.initiator_spi,
            &self.responder_spi,
            self.exchange_state.name(),
            next.name(),
        );
        self.exchange_state = next;
        Ok(())
    }

    /// Get next request message ID and increment
    pub fn take_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Key material
    pub fn keys(&self) -> Result<&IkeSaKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE SA has no keys yet".into()))
    }

    /// Header for a message of this SA
    pub fn header(&self, exchange: ExchangeType, message_id: u32, is_response: bool) -> IkeHeader {
        let flags = if is_response {
            IkeFlags::response(self.is_initiator)
        } else {
            IkeFlags::request(self.is_initiator)
        };
        IkeHeader::new(
            self.initiator_spi,
            self.responder_spi,
            exchange,
            flags,
            message_id,
        )
    }

    /// Encrypt `payloads` into a message of this SA
    pub fn seal(
        &self,
        provider: &dyn CryptoProvider,
        exchange: ExchangeType,
        message_id: u32,
        is_response: bool,
        payloads: &[Payload],
    ) -> Result<Vec<u8>> {
        let keys = self.keys()?;
        let cipher = SkCipher::outbound(&self.suite, keys, self.is_initiator);
        protect(
            provider,
            &cipher,
            &self.header(exchange, message_id, is_response),
            payloads,
        )
    }

    /// Verify and decrypt a received message of this SA
    pub fn open(
        &self,
        provider: &dyn CryptoProvider,
        raw: &[u8],
        msg: &IkeMessage,
    ) -> Result<Vec<Payload>> {
        let Some(Payload::Encrypted(sk)) = msg.payloads.last() else {
            return Err(Error::MissingPayload("SK".into()));
        };
        let keys = self.keys()?;
        let cipher = SkCipher::inbound(&self.suite, keys, self.is_initiator);
        unprotect(provider, &cipher, raw, sk)
    }

    /// Bundle containing the pair we send to with `outbound_spi`
    pub fn bundle_by_outbound(&self, outbound_spi: u32, protocol: ProtocolId) -> Option<usize> {
        self.children
            .iter()
            .position(|b| b.has_outbound(outbound_spi, protocol))
    }

    /// Every installed pair
    pub fn installed(&self) -> Vec<InstalledChild> {
        self.children
            .iter()
            .flat_map(|b| b.pairs.iter().cloned())
            .collect()
    }

    /// Whether a request for re-keying the IKE SA is queued or in flight
    pub fn ike_rekey_pending(&self) -> bool {
        matches!(
            self.pending.as_ref().map(|h| &h.kind),
            Some(PendingKind::RekeyIke { .. })
        ) || self.queued.contains(&QueuedRequest::RekeyIke)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultProvider, EncryptionAlgorithm, IntegrityAlgorithm, PrfAlgorithm};
    use crate::ikev2::keymat::derive_ike_keys;
    use crate::ikev2::payload::NotifyPayload;
    use crate::spd::IpsecProtocol;
    use std::net::Ipv4Addr;

    fn suite() -> Phase1Attributes {
        Phase1Attributes::v2(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            Some(IntegrityAlgorithm::HmacSha256_128),
            PrfAlgorithm::HmacSha256,
            DhGroup::Curve25519,
        )
    }

    fn pair(is_initiator: bool) -> IkeSa {
        let peer = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let mut sa = IkeSa::new(
            1,
            is_initiator,
            ([1u8; 8], [2u8; 8]),
            peer,
            "p",
            suite(),
            Identifier::Fqdn("a.example".into()),
        );
        sa.keys = Some(
            derive_ike_keys(
                &DefaultProvider::new(),
                &suite(),
                &[9u8; 32],
                &[1u8; 32],
                &[2u8; 32],
                &[1u8; 8],
                &[2u8; 8],
            )
            .unwrap(),
        );
        sa
    }

    #[test]
    fn test_spis_by_role() {
        let i = pair(true);
        let r = pair(false);
        assert_eq!(i.local_spi(), [1u8; 8]);
        assert_eq!(i.peer_spi(), [2u8; 8]);
        assert_eq!(r.local_spi(), [2u8; 8]);
        assert_eq!(r.peer_spi(), [1u8; 8]);
    }

    #[test]
    fn test_seal_open_between_roles() {
        let p = DefaultProvider::new();
        let i = pair(true);
        let r = pair(false);
        let payloads = vec![Payload::Notify(NotifyPayload::new(16384, Vec::new()))];

        let raw = i
            .seal(&p, ExchangeType::Informational, 3, false, &payloads)
            .unwrap();
        let msg = IkeMessage::decode(&raw).unwrap();
        assert!(msg.header.flags.is_initiator());
        assert!(!msg.is_response());
        assert_eq!(r.open(&p, &raw, &msg).unwrap(), payloads);
        assert!(i.open(&p, &raw, &msg).is_err());
    }

    #[test]
    fn test_message_ids_and_transitions() {
        let mut sa = pair(true);
        assert_eq!(sa.take_message_id(), 0);
        assert_eq!(sa.take_message_id(), 1);

        assert!(sa.transition_to(IkeSaState::Rekeying).is_err());
        sa.transition_to(IkeSaState::Established).unwrap();
        sa.advance().unwrap();
        assert_eq!(sa.exchange_state, ExchangeState::AuthI);
    }

    #[test]
    fn test_bundle_lookup() {
        let mut sa = pair(true);
        let child = InstalledChild {
            group: "g".into(),
            policy_index: 1,
            protocol: IpsecProtocol::Esp,
            inbound_spi: 0x100,
            outbound_spi: 0x200,
            outbound_index: 1,
            destination: sa.peer,
        };
        sa.children.push(ChildBundle {
            selector: Selector::any(),
            pairs: vec![child],
            rekeying: false,
        });
        assert_eq!(sa.bundle_by_outbound(0x200, ProtocolId::Esp), Some(0));
        assert_eq!(sa.bundle_by_outbound(0x200, ProtocolId::Ah), None);
        assert!(sa.children[0].has_inbound(0x100, ProtocolId::Esp));
        assert_eq!(sa.installed().len(), 1);
    }
}
