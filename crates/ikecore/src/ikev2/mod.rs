//! IKEv2 (Internet Key Exchange v2) protocol implementation
//!
//! This module implements the IKEv2 protocol as defined in RFC 7296.
//!
//! # Protocol Overview
//!
//! IKEv2 negotiates Security Associations (SAs) for IPsec in four
//! exchanges:
//!
//! 1. **IKE_SA_INIT**: negotiate the IKE SA suite, Diffie-Hellman and nonces
//! 2. **IKE_AUTH**: authenticate peers and create the first child SA bundle
//! 3. **CREATE_CHILD_SA**: create or re-key child SAs, re-key the IKE SA
//! 4. **INFORMATIONAL**: deletes, error notifications and liveness checks
//!
//! The [`Ikev2Engine`] drives all of them; the other modules hold the
//! wire codec, key derivation and negotiation helpers.
//!
//! # Message Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Initiator's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Responder's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol

pub mod auth;
pub mod child;
pub mod constants;
pub mod crypt;
pub mod exchange;
pub mod informational;
pub mod keymat;
pub mod message;
pub mod payload;
pub mod proposal;
pub mod sa;
pub mod state;
pub mod traffic_selector;

pub use constants::{ExchangeType, IkeFlags, NotifyType, PayloadType, ProtocolId};
pub use exchange::{Ikev2Engine, Ikev2Event};
pub use message::{IkeHeader, IkeMessage};
pub use payload::Payload;
pub use sa::{ChildBundle, IkeSa};
pub use state::{ExchangeState, IkeSaState};
