//! Security policy and SA databases
//!
//! - [`selector`]: traffic selectors and their matching rules
//! - [`policy`]: policies, flows and required security protocols
//! - [`bundle`]: per-selector caches of outbound SAs
//! - [`sadb`]: inbound and outbound SA tables
//! - [`database`]: policy groups, lookups and lifetime timers
//!
//! # Example
//!
//! ```rust
//! use ikecore::spd::{AddrSpec, Flow, Policy, SecurityPolicyDb, Selector, OutboundMatch};
//! use std::time::Duration;
//!
//! let mut spd = SecurityPolicyDb::new(Duration::from_secs(2));
//! spd.add_group("default").unwrap();
//! spd.add_policy("default", Policy::bypass(Selector::any(), Flow::Dual)).unwrap();
//!
//! let pkt = Selector::packet(
//!     "10.0.0.1".parse().unwrap(),
//!     "10.0.0.2".parse().unwrap(),
//!     6,
//!     40000,
//!     22,
//! );
//! let now = tokio::time::Instant::now();
//! assert_eq!(spd.match_outbound("default", &pkt, now), Ok(OutboundMatch::Bypass));
//! # let _ = AddrSpec::Any;
//! ```

pub mod bundle;
pub mod database;
pub mod policy;
pub mod sadb;
pub mod selector;

pub use bundle::OutboundBundle;
pub use database::{
    EndpointRef, OutboundMatch, PolicyGroup, SaRequest, SecurityPolicyDb, SpdEvent, SpdExpiry,
};
pub use policy::{
    DerivationFlags, Direction, Flow, IpsecProtocol, Policy, PolicyAction, SaDerivation,
    SecurityMode, SecurityProtocol, MAX_BUNDLE,
};
pub use sadb::{InboundSa, OutboundSa, RemovedPair, SaDatabase, SaKeys};
pub use selector::{AddrSpec, NarrowResult, PortRange, Selector};
