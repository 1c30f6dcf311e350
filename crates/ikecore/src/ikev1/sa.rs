//! ISAKMP SA and its exchange handles
//!
//! An [`IsakmpSa`] is keyed by the cookie pair. It owns the Phase 1
//! handle while Phase 1 runs, then any number of Quick Mode handles
//! (distinguished by message ID) running in parallel.
//!
//! Every handle keeps the last message it received and sent. A message
//! equal to the last one received is a retransmission and is answered
//! with the saved reply. Finished exchanges leave a short [`Replay`]
//! record behind so a lost final message can still be resent.

use std::collections::VecDeque;
use std::net::IpAddr;

use super::constants::{ExchangeType, IsakmpFlags};
use super::crypt::{open, seal, Opened, Phase1Cipher};
use super::keymat::OakleyKeys;
use super::message::{IdPayload, IsakmpHeader, Payload};
use super::state::{ExchangeState, IsakmpSaState, Phase1Mode};
use crate::config::{IkePolicy, IkeVersion, Phase1Attributes};
use crate::crypto::{CryptoProvider, DhGroup, DhPrivateKey};
use crate::error::{Error, Result};
use crate::identity::Identifier;
use crate::install::{ChildSaDescriptor, InstalledChild};
use crate::logging;
use crate::spd::{SecurityProtocol, Selector};

/// Finished exchanges remembered per SA for retransmissions
const MAX_REPLAYS: usize = 8;

/// Child SAs negotiated by one Quick Mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickBundle {
    /// Selector (outbound view)
    pub selector: Selector,
    /// Installed pairs in negotiation order
    pub pairs: Vec<InstalledChild>,
    /// A replacement is being negotiated
    pub rekeying: bool,
}

/// Child SA negotiation requested locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickRequest {
    /// Policy group
    pub group: String,
    /// Policy needing the SAs
    pub policy_index: u32,
    /// Selector to offer (outbound view)
    pub selector: Selector,
    /// Protocols negotiated together
    pub security: Vec<SecurityProtocol>,
    /// Our inbound SPIs, filled in when the request is sent
    pub inbound_spis: Vec<u32>,
    /// PFS group
    pub pfs: Option<DhGroup>,
    /// Pairs being replaced
    pub rekey: Option<Vec<InstalledChild>>,
}

/// Last message in and out of an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    /// Message ID (0 for Phase 1)
    pub message_id: u32,
    /// Last message received, as received
    pub received: Vec<u8>,
    /// Answer sent to it
    pub sent: Vec<u8>,
}

/// Phase 1 handle
#[derive(Debug)]
pub struct Phase1Handle {
    /// Current state
    pub state: ExchangeState,
    /// Suites offered (initiator)
    pub offered: Vec<Phase1Attributes>,
    /// SA payload body of the initiator's first message
    pub sa_i_body: Vec<u8>,
    /// Our Diffie-Hellman value until the peer's arrives
    pub dh: Option<DhPrivateKey>,
    /// Initiator KE data
    pub ke_i: Vec<u8>,
    /// Responder KE data
    pub ke_r: Vec<u8>,
    /// Initiator nonce
    pub ni: Vec<u8>,
    /// Responder nonce
    pub nr: Vec<u8>,
    /// ID payload the peer sent, authenticated with its HASH
    pub peer_id: Option<IdPayload>,
    /// Last messages
    pub replay: Replay,
    /// Retransmissions of the last message
    pub resend_count: u32,
    /// Whether the last message sent expects an answer
    pub awaiting: bool,
}

impl Phase1Handle {
    /// Handle in the first state of `mode`
    pub fn new(mode: Phase1Mode, initiator: bool) -> Self {
        Phase1Handle {
            state: ExchangeState::start(super::state::ExchangeKind::Phase1(mode), initiator),
            offered: Vec::new(),
            sa_i_body: Vec::new(),
            dh: None,
            ke_i: Vec::new(),
            ke_r: Vec::new(),
            ni: Vec::new(),
            nr: Vec::new(),
            peer_id: None,
            replay: Replay::default(),
            resend_count: 0,
            awaiting: false,
        }
    }
}

/// Quick Mode handle
#[derive(Debug)]
pub struct QuickHandle {
    /// Message ID
    pub message_id: u32,
    /// Current state
    pub state: ExchangeState,
    /// IV for the next message of the exchange
    pub iv: Vec<u8>,
    /// Request (initiator)
    pub request: Option<QuickRequest>,
    /// Initiator nonce
    pub ni: Vec<u8>,
    /// Responder nonce
    pub nr: Vec<u8>,
    /// Our PFS value until the peer's arrives
    pub dh: Option<DhPrivateKey>,
    /// Negotiated pairs waiting for HASH(3) or CONNECTED
    pub pending: Vec<ChildSaDescriptor>,
    /// Where the pending pairs go: group, policy index, selector
    pub target: Option<(String, u32, Selector)>,
    /// Commit bit of the exchange
    pub commit: bool,
    /// Last messages
    pub replay: Replay,
    /// Retransmissions of the last message
    pub resend_count: u32,
    /// Whether the last message sent expects an answer
    pub awaiting: bool,
}

impl QuickHandle {
    /// Handle in the first state of a side
    pub fn new(message_id: u32, initiator: bool, iv: Vec<u8>) -> Self {
        QuickHandle {
            message_id,
            state: ExchangeState::start(super::state::ExchangeKind::Quick, initiator),
            iv,
            request: None,
            ni: Vec::new(),
            nr: Vec::new(),
            dh: None,
            pending: Vec::new(),
            target: None,
            commit: false,
            replay: Replay {
                message_id,
                ..Replay::default()
            },
            resend_count: 0,
            awaiting: false,
        }
    }
}

/// ISAKMP Security Association
#[derive(Debug)]
pub struct IsakmpSa {
    /// Local identifier, also the timer subject
    pub id: u64,
    /// Lifecycle state
    pub state: IsakmpSaState,
    /// Phase 1 flavour
    pub mode: Phase1Mode,
    /// Whether we started Phase 1
    pub is_initiator: bool,
    /// Initiator cookie
    pub initiator_cookie: [u8; 8],
    /// Responder cookie (zero until assigned)
    pub responder_cookie: [u8; 8],
    /// Peer address
    pub peer: IpAddr,
    /// Name of the IKE policy in use
    pub policy: String,
    /// Negotiated suite
    pub suite: Phase1Attributes,
    /// Key material once the key exchange completed
    pub keys: Option<OakleyKeys>,
    /// Phase 1 IV chain; after Phase 1 the last CBC block of it
    pub iv: Vec<u8>,
    /// Our identity
    pub local_id: Identifier,
    /// Authenticated peer identity
    pub peer_id: Option<Identifier>,
    /// Phase 1 in progress
    pub phase1: Option<Phase1Handle>,
    /// Quick Modes in progress
    pub quick: Vec<QuickHandle>,
    /// Requests waiting for Phase 1
    pub waiting: Vec<QuickRequest>,
    /// Installed bundles
    pub children: Vec<QuickBundle>,
    /// Finished exchanges, newest last
    pub replays: VecDeque<Replay>,
}

impl IsakmpSa {
    /// New SA in the negotiating state
    ///
    /// The mode and local identity come from `policy`; `suite` is the
    /// first offered (initiator) or the selected (responder) suite.
    pub fn new(
        id: u64,
        is_initiator: bool,
        cookies: ([u8; 8], [u8; 8]),
        peer: IpAddr,
        policy: &IkePolicy,
        suite: Phase1Attributes,
    ) -> Self {
        let mode = match policy.version {
            IkeVersion::V1Aggressive => Phase1Mode::Aggressive,
            _ => Phase1Mode::Main,
        };
        IsakmpSa {
            id,
            state: IsakmpSaState::Negotiating,
            mode,
            is_initiator,
            initiator_cookie: cookies.0,
            responder_cookie: cookies.1,
            peer,
            policy: policy.name.clone(),
            suite,
            keys: None,
            iv: Vec::new(),
            local_id: policy.local_id.clone(),
            peer_id: None,
            phase1: Some(Phase1Handle::new(mode, is_initiator)),
            quick: Vec::new(),
            waiting: Vec::new(),
            children: Vec::new(),
            replays: VecDeque::new(),
        }
    }

    /// Cookie pair as carried in ISAKMP Delete and notify SPIs
    pub fn cookies(&self) -> Vec<u8> {
        [self.initiator_cookie, self.responder_cookie].concat()
    }

    /// Transition to a new lifecycle state
    pub fn transition_to(&mut self, new_state: IsakmpSaState) -> Result<()> {
        if !self.state.can_transition_to(new_state) {
            return Err(Error::InvalidState(format!(
                "Invalid ISAKMP SA transition from {:?} to {:?}",
                self.state, new_state
            )));
        }
        logging::log_ike_state_transition(
            &self.initiator_cookie,
            &self.responder_cookie,
            self.state.name(),
            new_state.name(),
        );
        self.state = new_state;
        Ok(())
    }

    /// Key material
    pub fn keys(&self) -> Result<&OakleyKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("ISAKMP SA has no keys yet".into()))
    }

    /// Phase 1 handle
    pub fn phase1(&mut self) -> Result<&mut Phase1Handle> {
        self.phase1
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Phase 1 already finished".into()))
    }

    /// Header for a message of this SA
    pub fn header(
        &self,
        exchange: ExchangeType,
        message_id: u32,
        flags: IsakmpFlags,
    ) -> IsakmpHeader {
        IsakmpHeader::new(
            self.initiator_cookie,
            self.responder_cookie,
            exchange,
            flags,
            message_id,
        )
    }

    /// Encrypt `payloads` under `iv`
    ///
    /// Returns the wire message and the IV following it.
    pub fn seal(
        &self,
        provider: &dyn CryptoProvider,
        header: &IsakmpHeader,
        iv: &[u8],
        payloads: &[Payload],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let keys = self.keys()?;
        let cipher = Phase1Cipher {
            encryption: self.suite.encryption,
            key: &keys.encryption_key,
        };
        let sealed = seal(provider, &cipher, iv, header, payloads)?;
        Ok((sealed.data, sealed.next_iv))
    }

    /// Decrypt a message under `iv`
    pub fn open(&self, provider: &dyn CryptoProvider, iv: &[u8], data: &[u8]) -> Result<Opened> {
        let keys = self.keys()?;
        let cipher = Phase1Cipher {
            encryption: self.suite.encryption,
            key: &keys.encryption_key,
        };
        open(provider, &cipher, iv, data)
    }

    /// Quick Mode handle by message ID
    pub fn quick_pos(&self, message_id: u32) -> Option<usize> {
        self.quick.iter().position(|h| h.message_id == message_id)
    }

    /// Saved answer to a retransmitted message, if `raw` is one
    pub fn replay_for(&self, raw: &[u8]) -> Option<&[u8]> {
        let live = self
            .phase1
            .iter()
            .map(|h| &h.replay)
            .chain(self.quick.iter().map(|h| &h.replay));
        live.chain(self.replays.iter())
            .find(|r| !r.sent.is_empty() && r.received == raw)
            .map(|r| r.sent.as_slice())
    }

    /// Remember a finished exchange
    pub fn remember(&mut self, replay: Replay) {
        if replay.received.is_empty() || replay.sent.is_empty() {
            return;
        }
        if self.replays.len() == MAX_REPLAYS {
            self.replays.pop_front();
        }
        self.replays.push_back(replay);
    }

    /// Bundle holding the pair we send to with `outbound_spi`
    pub fn bundle_by_outbound(
        &self,
        outbound_spi: u32,
        protocol: crate::spd::IpsecProtocol,
    ) -> Option<usize> {
        self.children.iter().position(|b| {
            b.pairs
                .iter()
                .any(|p| p.outbound_spi == outbound_spi && p.protocol == protocol)
        })
    }

    /// Every installed pair
    pub fn installed(&self) -> Vec<InstalledChild> {
        self.children
            .iter()
            .flat_map(|b| b.pairs.iter().cloned())
            .collect()
    }

    /// Message ID not used by a running Quick Mode
    pub fn is_free_message_id(&self, message_id: u32) -> bool {
        message_id != 0 && self.quick_pos(message_id).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthenticationMethod;
    use crate::crypto::{EncryptionAlgorithm, HashAlgorithm};
    use std::net::Ipv4Addr;

    fn sa() -> IsakmpSa {
        let suite = Phase1Attributes::v1(
            EncryptionAlgorithm::AesCbc,
            Some(128),
            HashAlgorithm::Sha256,
            DhGroup::Curve25519,
            AuthenticationMethod::PreSharedKey,
        );
        let policy = IkePolicy::builder()
            .with_name("p")
            .with_peer(crate::spd::AddrSpec::Any)
            .with_version(IkeVersion::V1Aggressive)
            .with_attributes(suite)
            .with_local_id(Identifier::Fqdn("a.example".into()))
            .with_ipsec_group("g")
            .build()
            .unwrap();
        IsakmpSa::new(
            1,
            true,
            ([1; 8], [0; 8]),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            &policy,
            suite,
        )
    }

    #[test]
    fn test_replays_are_bounded() {
        let mut sa = sa();
        for i in 0..(MAX_REPLAYS as u8 + 2) {
            sa.remember(Replay {
                message_id: i as u32,
                received: vec![i],
                sent: vec![i, i],
            });
        }
        assert_eq!(sa.replays.len(), MAX_REPLAYS);
        assert_eq!(sa.replay_for(&[0]), None);
        assert_eq!(sa.replay_for(&[9]), Some([9u8, 9].as_slice()));

        // nothing is remembered without an answer
        sa.remember(Replay {
            message_id: 42,
            received: vec![42],
            sent: Vec::new(),
        });
        assert_eq!(sa.replay_for(&[42]), None);
    }

    #[test]
    fn test_live_handles_answer_duplicates() {
        let mut sa = sa();
        let mut handle = QuickHandle::new(7, false, vec![0; 16]);
        handle.replay.received = vec![1, 2, 3];
        handle.replay.sent = vec![4, 5];
        sa.quick.push(handle);
        assert_eq!(sa.replay_for(&[1, 2, 3]), Some([4u8, 5].as_slice()));
        assert!(!sa.is_free_message_id(7));
        assert!(!sa.is_free_message_id(0));
        assert!(sa.is_free_message_id(8));
    }

    #[test]
    fn test_no_keys_before_key_exchange() {
        let sa = sa();
        assert!(matches!(sa.keys(), Err(Error::InvalidState(_))));
        assert_eq!(sa.mode, Phase1Mode::Aggressive);
        assert_eq!(sa.cookies().len(), 16);
    }
}
