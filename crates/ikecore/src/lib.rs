//! IKE key management core
//!
//! This crate negotiates IPsec security associations with IKEv2 (RFC 7296)
//! and IKEv1 (RFC 2409) and keeps the security policy database that
//! decides which traffic needs them.
//!
//! - [`spd`] - policies, selectors, outbound bundles and the SA database
//! - [`ikev2`] - IKE_SA_INIT, IKE_AUTH, CREATE_CHILD_SA and INFORMATIONAL
//! - [`ikev1`] - Main, Aggressive and Quick Mode, informational exchanges
//! - [`install`] - moves negotiated keys into SA pairs
//! - [`engine`] - [`KeyManager`], the locked facade over all of the above
//!
//! Packet I/O stays outside: the engines consume received datagrams and
//! return [`engine::Datagram`]s to send.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ikecore::config::IkeConfig;
//! use ikecore::crypto::DefaultProvider;
//! use ikecore::identity::IdentityStore;
//! use ikecore::KeyManager;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ikecore::Result<()> {
//! let manager = KeyManager::new(
//!     IkeConfig::default(),
//!     Arc::new(DefaultProvider::new()),
//!     Arc::new(IdentityStore::new()),
//! );
//! manager.spd().await?.add_group("default")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Key material lives in `zeroize` buffers
//! - HASH, AUTH and ICV comparisons run in constant time
//! - Primitives come from the RustCrypto and dalek crates

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ikev1;
pub mod ikev2;
pub mod install;
pub mod lock;
pub mod logging;
pub mod spd;
pub mod timer;

pub use engine::{Datagram, KeyManager};
pub use error::{Error, Result};
