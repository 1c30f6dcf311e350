//! Key manager facade
//!
//! [`KeyManager`] owns the policy database and both IKE engines behind
//! bounded-wait locks and is driven from outside by three entry points:
//! received datagrams ([`KeyManager::handle_packet`]), SA requests raised
//! by outbound lookups ([`KeyManager::process_requests`]) and timers
//! ([`KeyManager::process_timers`]). Each returns the datagrams to send.
//!
//! Locks are always taken IKE databases first, policy database second.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tokio::sync::MutexGuard;
use tokio::time::Instant;

use crate::config::{IkeConfig, IkePolicy};
use crate::crypto::CryptoProvider;
use crate::error::{Error, ErrorCollector, Result};
use crate::identity::IdentityStore;
use crate::ikev1::Ikev1Engine;
use crate::ikev2::Ikev2Engine;
use crate::lock::ResourceLock;
use crate::spd::{OutboundMatch, SaRequest, SecurityPolicyDb, Selector};

/// Offset of the version octet in both header formats
const VERSION_OFFSET: usize = 17;

/// Both headers are 28 octets
const MIN_HEADER_LEN: usize = 28;

/// Message to send to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination address
    pub peer: IpAddr,
    /// Wire message
    pub data: Vec<u8>,
}

/// IKE databases guarded together
#[derive(Debug)]
pub struct IkeDatabases {
    /// IKEv1 engine
    pub v1: Ikev1Engine,
    /// IKEv2 engine
    pub v2: Ikev2Engine,
}

impl IkeDatabases {
    fn uses_v1(&self, request: &SaRequest) -> bool {
        let Some(peer) = request.peer else {
            return false;
        };
        self.v1
            .policies()
            .iter()
            .any(|p| p.ipsec_group == request.group && p.matches_peer(peer))
    }
}

/// Major version of a received datagram
fn major_version(data: &[u8]) -> Result<u8> {
    if data.len() < MIN_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: MIN_HEADER_LEN,
            available: data.len(),
        });
    }
    Ok(data[VERSION_OFFSET] >> 4)
}

/// Locked facade over the policy database and the IKE engines
pub struct KeyManager {
    ike: ResourceLock<IkeDatabases>,
    spd: ResourceLock<SecurityPolicyDb>,
    requests: ResourceLock<UnboundedReceiver<SaRequest>>,
    errors: ErrorCollector,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Create a key manager with an empty policy database
    pub fn new(
        config: IkeConfig,
        provider: Arc<dyn CryptoProvider>,
        identities: Arc<IdentityStore>,
    ) -> Self {
        let errors = ErrorCollector::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut spd = SecurityPolicyDb::from_config(&config).with_error_collector(errors.clone());
        spd.set_sa_request_sender(sender);

        let lock_timeout = config.lock_timeout;
        let ike = IkeDatabases {
            v1: Ikev1Engine::new(config.clone(), Arc::clone(&provider), Arc::clone(&identities)),
            v2: Ikev2Engine::new(config, provider, identities),
        };
        KeyManager {
            ike: ResourceLock::new("ike", ike, lock_timeout),
            spd: ResourceLock::new("spd", spd, lock_timeout),
            requests: ResourceLock::new("sa requests", receiver, lock_timeout),
            errors,
        }
    }

    /// Non-fatal failures recorded by every component
    pub fn errors(&self) -> &ErrorCollector {
        &self.errors
    }

    /// Lock the policy database for configuration or inspection
    pub async fn spd(&self) -> Result<MutexGuard<'_, SecurityPolicyDb>> {
        self.spd.acquire().await
    }

    /// Lock the IKE databases for inspection
    pub async fn ike(&self) -> Result<MutexGuard<'_, IkeDatabases>> {
        self.ike.acquire().await
    }

    /// Add an IKE policy to the engine of its version
    pub async fn add_ike_policy(&self, policy: IkePolicy) -> Result<()> {
        let mut ike = self.ike.acquire().await?;
        if policy.version.is_v1() {
            ike.v1.add_policy(policy)
        } else {
            ike.v2.add_policy(policy)
        }
    }

    /// Outbound policy lookup for a packet
    ///
    /// A missing SA bundle raises SA requests, picked up by
    /// [`KeyManager::process_requests`].
    pub async fn match_outbound(
        &self,
        group: &str,
        pkt: &Selector,
        now: Instant,
    ) -> Result<OutboundMatch> {
        let mut spd = self.spd.acquire().await?;
        spd.match_outbound(group, pkt, now)
    }

    /// Process a datagram received from `src`
    ///
    /// The version octet picks the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooShort`] for runt datagrams,
    /// [`Error::UnsupportedVersion`] for unknown major versions,
    /// [`Error::LockTimeout`] when a database stays locked, and whatever
    /// the engine reports for a dropped message.
    pub async fn handle_packet(
        &self,
        src: IpAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>> {
        let major = major_version(data)?;
        let mut ike = self.ike.acquire().await?;
        let mut spd = self.spd.acquire().await?;
        match major {
            1 => ike.v1.handle_message(&mut spd, src, data, now),
            2 => ike.v2.handle_message(&mut spd, src, data, now),
            _ => Err(Error::UnsupportedVersion(data[VERSION_OFFSET])),
        }
    }

    /// Start negotiating the SAs for `request`
    ///
    /// IKEv1 is used when an IKEv1 policy covers the request's group and
    /// peer, IKEv2 otherwise.
    pub async fn initiate(&self, request: &SaRequest, now: Instant) -> Result<Vec<Datagram>> {
        let mut ike = self.ike.acquire().await?;
        let mut spd = self.spd.acquire().await?;
        if ike.uses_v1(request) {
            ike.v1.initiate(&mut spd, request, now)
        } else {
            ike.v2.initiate(&mut spd, request, now)
        }
    }

    /// Negotiate every SA request raised since the last call
    ///
    /// Failed requests are recorded in [`KeyManager::errors`]; the policy
    /// database raises them again after its retry timeout. Requests stay
    /// queued when a database lock times out.
    pub async fn process_requests(&self, now: Instant) -> Result<Vec<Datagram>> {
        let mut ike = self.ike.acquire().await?;
        let mut spd = self.spd.acquire().await?;
        let mut pending = Vec::new();
        {
            let mut receiver = self.requests.acquire().await?;
            loop {
                match receiver.try_recv() {
                    Ok(request) => pending.push(request),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }

        let mut out = Vec::new();
        for request in pending {
            let result = if ike.uses_v1(&request) {
                ike.v1.initiate(&mut spd, &request, now)
            } else {
                ike.v2.initiate(&mut spd, &request, now)
            };
            match result {
                Ok(sent) => out.extend(sent),
                Err(e) => self.errors.record(
                    format!("sa request for policy {}", request.policy_index),
                    e,
                ),
            }
        }
        Ok(out)
    }

    /// Fire due timers of the policy database and both engines
    pub async fn process_timers(&self, now: Instant) -> Result<Vec<Datagram>> {
        let mut ike = self.ike.acquire().await?;
        let mut spd = self.spd.acquire().await?;
        let IkeDatabases { v1, v2 } = &mut *ike;

        let expiries = spd.process_timers(now);
        let mut out = v1.process_timers(&mut spd, now);
        out.extend(v2.process_timers(&mut spd, now));
        if !expiries.is_empty() {
            out.extend(v1.handle_spd_expiry(&mut spd, &expiries, now));
            out.extend(v2.handle_spd_expiry(&mut spd, &expiries, now));
        }
        Ok(out)
    }

    /// Earliest timer of any component
    pub async fn next_deadline(&self) -> Result<Option<Instant>> {
        let ike = self.ike.acquire().await?;
        let spd = self.spd.acquire().await?;
        Ok([
            ike.v1.next_deadline(),
            ike.v2.next_deadline(),
            spd.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultProvider;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

    fn manager() -> KeyManager {
        let config = IkeConfig::builder()
            .with_lock_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        KeyManager::new(
            config,
            Arc::new(DefaultProvider::new()),
            Arc::new(IdentityStore::new()),
        )
    }

    #[test]
    fn test_major_version() {
        assert_eq!(
            major_version(&[0u8; 10]),
            Err(Error::BufferTooShort {
                required: 28,
                available: 10
            })
        );
        let mut header = [0u8; 28];
        header[VERSION_OFFSET] = 0x20;
        assert_eq!(major_version(&header), Ok(2));
        header[VERSION_OFFSET] = 0x10;
        assert_eq!(major_version(&header), Ok(1));
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let manager = manager();
        let mut header = [0u8; 28];
        header[VERSION_OFFSET] = 0x30;
        assert_eq!(
            manager.handle_packet(PEER, &header, Instant::now()).await,
            Err(Error::UnsupportedVersion(0x30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_spd_times_out() {
        let manager = manager();
        let held = manager.spd().await.unwrap();
        let err = manager.process_timers(Instant::now()).await.unwrap_err();
        assert_eq!(err, Error::LockTimeout("spd".into()));

        // IKE lock was released with the failed call
        assert!(manager.ike().await.is_ok());
        drop(held);
        assert!(manager.process_timers(Instant::now()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_survive_lock_timeout() {
        use crate::crypto::{EncryptionAlgorithm, IntegrityAlgorithm};
        use crate::spd::{AddrSpec, Flow, Policy, SecurityProtocol};

        let manager = manager();
        let local = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        {
            let mut spd = manager.spd().await.unwrap();
            spd.add_group("g").unwrap();
            let esp = SecurityProtocol::esp(
                EncryptionAlgorithm::AesCbc,
                Some(128),
                Some(IntegrityAlgorithm::HmacSha1_96),
            );
            let selector = Selector::new(AddrSpec::Single(local), AddrSpec::Single(PEER));
            spd.add_policy("g", Policy::apply(selector, Flow::Dual, vec![esp]))
                .unwrap();
        }
        let now = Instant::now();
        let pkt = Selector::packet(local, PEER, 6, 40000, 443);
        assert!(manager.match_outbound("g", &pkt, now).await.is_err());

        let held = manager.ike().await.unwrap();
        assert_eq!(
            manager.process_requests(now).await.unwrap_err(),
            Error::LockTimeout("ike".into())
        );
        drop(held);
        assert!(manager.errors().is_empty());

        // no IKE policy covers the peer, so the kept request fails now
        assert!(manager.process_requests(now).await.unwrap().is_empty());
        assert_eq!(manager.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_no_requests_no_work() {
        let manager = manager();
        assert!(manager.process_requests(Instant::now()).await.unwrap().is_empty());
        assert_eq!(manager.next_deadline().await.unwrap(), None);
    }
}
