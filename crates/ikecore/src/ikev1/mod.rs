//! IKEv1 (ISAKMP/Oakley) protocol implementation
//!
//! Implements the ISAKMP framework of RFC 2408 with the exchanges of
//! RFC 2409 under the IPsec DOI of RFC 2407.
//!
//! # Protocol Overview
//!
//! 1. **Phase 1** (Main or Aggressive Mode): negotiate and authenticate
//!    an ISAKMP SA, keyed by the initiator and responder cookies
//! 2. **Quick Mode**: negotiate IPsec SA bundles under the ISAKMP SA,
//!    one exchange per message ID, optionally with PFS
//! 3. **Informational**: notifications and deletes protected by HASH(1)
//!
//! The [`Ikev1Engine`] drives all of them. The header carries the
//! version byte `0x10`, which is how received datagrams are told apart
//! from IKEv2 ones.
//!
//! # References
//!
//! - [RFC 2407](https://datatracker.ietf.org/doc/html/rfc2407) - IPsec DOI
//! - [RFC 2408](https://datatracker.ietf.org/doc/html/rfc2408) - ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - IKE

pub mod constants;
pub mod crypt;
pub mod exchange;
pub mod informational;
pub mod keymat;
pub mod message;
pub mod proposal;
pub mod sa;
pub mod state;

pub use constants::{ExchangeType, IsakmpFlags, NotifyType, PayloadType, ProtocolId};
pub use exchange::{Ikev1Engine, Ikev1Event};
pub use message::{IsakmpHeader, IsakmpMessage, Payload};
pub use sa::{IsakmpSa, QuickBundle};
pub use state::{ExchangeState, IsakmpSaState, Phase1Mode};
