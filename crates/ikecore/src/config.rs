//! Key manager configuration
//!
//! Provides the engine-wide [`IkeConfig`] (timeouts, retry counts, default
//! lifetimes) and the per-peer [`IkePolicy`] describing how a key exchange
//! with a peer is negotiated. Both are built with builder types that
//! validate values in `build()`.

use std::net::IpAddr;
use std::time::Duration;

use crate::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm, IntegrityAlgorithm, PrfAlgorithm};
use crate::error::{Error, Result};
use crate::identity::Identifier;
use crate::spd::selector::AddrSpec;

/// Default nonce length in bytes
pub const DEFAULT_NONCE_LEN: usize = 32;

/// Most suites one policy can offer (proposal and transform numbers are one octet)
pub const MAX_SUITES: usize = u8::MAX as usize;

/// SA lifetime limits
///
/// Defines when an SA should be re-keyed (soft limit) and when it must
/// be deleted (hard limit). Both time and byte based limits are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    /// Soft time limit - initiate re-key when reached
    pub soft: Duration,

    /// Hard time limit - delete SA when reached
    pub hard: Duration,

    /// Soft byte limit (optional)
    pub soft_bytes: Option<u64>,

    /// Hard byte limit (optional)
    pub hard_bytes: Option<u64>,
}

impl Default for Lifetime {
    /// 1 hour hard, 45 minutes soft
    fn default() -> Self {
        Lifetime {
            soft: Duration::from_secs(45 * 60),
            hard: Duration::from_secs(60 * 60),
            soft_bytes: None,
            hard_bytes: None,
        }
    }
}

impl Lifetime {
    /// Create custom lifetime with time limits
    pub fn new(soft: Duration, hard: Duration) -> Result<Self> {
        let lifetime = Lifetime {
            soft,
            hard,
            soft_bytes: None,
            hard_bytes: None,
        };
        lifetime.validate()?;
        Ok(lifetime)
    }

    /// Add byte based limits
    pub fn with_byte_limits(mut self, soft_bytes: u64, hard_bytes: u64) -> Result<Self> {
        self.soft_bytes = Some(soft_bytes);
        self.hard_bytes = Some(hard_bytes);
        self.validate()?;
        Ok(self)
    }

    /// Check that every soft limit is below its hard limit
    pub fn validate(&self) -> Result<()> {
        if self.hard.is_zero() {
            return Err(Error::InvalidParameter(
                "Hard lifetime must be non-zero".into(),
            ));
        }
        if self.soft >= self.hard {
            return Err(Error::InvalidParameter(
                "Soft lifetime must be less than hard lifetime".into(),
            ));
        }
        if let (Some(soft), Some(hard)) = (self.soft_bytes, self.hard_bytes) {
            if soft >= hard {
                return Err(Error::InvalidParameter(
                    "Soft byte limit must be less than hard byte limit".into(),
                ));
            }
        }
        Ok(())
    }

    /// Check if soft lifetime has been exceeded
    pub fn is_soft_expired(&self, age: Duration, bytes: u64) -> bool {
        age >= self.soft || self.soft_bytes.map_or(false, |limit| bytes >= limit)
    }

    /// Check if hard lifetime has been exceeded
    pub fn is_hard_expired(&self, age: Duration, bytes: u64) -> bool {
        age >= self.hard || self.hard_bytes.map_or(false, |limit| bytes >= limit)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct IkeConfig {
    /// Time to wait for a response before resending
    pub exchange_timeout: Duration,

    /// Resends before a negotiation is abandoned
    pub max_resend: u32,

    /// Minimum interval between SA requests for the same outbound bundle
    pub sa_request_timeout: Duration,

    /// Lifetime of cached outbound bundles
    pub bundle_lifetime: Duration,

    /// Bounded wait for the SPD and exchange locks
    pub lock_timeout: Duration,

    /// Length of locally generated nonces
    pub nonce_len: usize,

    /// Default lifetime of key-exchange SAs
    pub ike_lifetime: Lifetime,

    /// Whether INITIAL_CONTACT is sent on the first exchange with a peer
    pub send_initial_contact: bool,

    /// Whether legacy Quick Mode requests set the commit bit
    pub quick_mode_commit: bool,
}

impl Default for IkeConfig {
    fn default() -> Self {
        IkeConfig {
            exchange_timeout: Duration::from_secs(5),
            max_resend: 3,
            sa_request_timeout: Duration::from_secs(2),
            bundle_lifetime: Duration::from_secs(300),
            lock_timeout: Duration::from_millis(500),
            nonce_len: DEFAULT_NONCE_LEN,
            ike_lifetime: Lifetime {
                soft: Duration::from_secs(3 * 3600),
                hard: Duration::from_secs(4 * 3600),
                soft_bytes: None,
                hard_bytes: None,
            },
            send_initial_contact: true,
            quick_mode_commit: false,
        }
    }
}

impl IkeConfig {
    /// Create builder
    pub fn builder() -> IkeConfigBuilder {
        IkeConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.exchange_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "exchange_timeout must be non-zero".into(),
            ));
        }
        if self.bundle_lifetime.is_zero() {
            return Err(Error::InvalidParameter(
                "bundle_lifetime must be non-zero".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidParameter("lock_timeout must be non-zero".into()));
        }
        // RFC 7296 Section 2.10
        if !(16..=256).contains(&self.nonce_len) {
            return Err(Error::InvalidParameter(format!(
                "nonce_len {} outside 16..=256",
                self.nonce_len
            )));
        }
        self.ike_lifetime.validate()
    }
}

/// Builder for [`IkeConfig`]
#[derive(Debug, Default)]
pub struct IkeConfigBuilder {
    exchange_timeout: Option<Duration>,
    max_resend: Option<u32>,
    sa_request_timeout: Option<Duration>,
    bundle_lifetime: Option<Duration>,
    lock_timeout: Option<Duration>,
    nonce_len: Option<usize>,
    ike_lifetime: Option<Lifetime>,
    send_initial_contact: Option<bool>,
    quick_mode_commit: Option<bool>,
}

impl IkeConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set response timeout
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = Some(timeout);
        self
    }

    /// Set resend limit
    pub fn with_max_resend(mut self, count: u32) -> Self {
        self.max_resend = Some(count);
        self
    }

    /// Set SA request retry interval
    pub fn with_sa_request_timeout(mut self, timeout: Duration) -> Self {
        self.sa_request_timeout = Some(timeout);
        self
    }

    /// Set outbound bundle lifetime
    pub fn with_bundle_lifetime(mut self, lifetime: Duration) -> Self {
        self.bundle_lifetime = Some(lifetime);
        self
    }

    /// Set lock wait bound
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Set nonce length
    pub fn with_nonce_len(mut self, len: usize) -> Self {
        self.nonce_len = Some(len);
        self
    }

    /// Set default key-exchange SA lifetime
    pub fn with_ike_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.ike_lifetime = Some(lifetime);
        self
    }

    /// Enable or disable INITIAL_CONTACT
    pub fn with_initial_contact(mut self, enabled: bool) -> Self {
        self.send_initial_contact = Some(enabled);
        self
    }

    /// Request the commit bit in legacy Quick Mode
    pub fn with_quick_mode_commit(mut self, enabled: bool) -> Self {
        self.quick_mode_commit = Some(enabled);
        self
    }

    /// Build IkeConfig with validation
    pub fn build(self) -> Result<IkeConfig> {
        let defaults = IkeConfig::default();
        let config = IkeConfig {
            exchange_timeout: self.exchange_timeout.unwrap_or(defaults.exchange_timeout),
            max_resend: self.max_resend.unwrap_or(defaults.max_resend),
            sa_request_timeout: self
                .sa_request_timeout
                .unwrap_or(defaults.sa_request_timeout),
            bundle_lifetime: self.bundle_lifetime.unwrap_or(defaults.bundle_lifetime),
            lock_timeout: self.lock_timeout.unwrap_or(defaults.lock_timeout),
            nonce_len: self.nonce_len.unwrap_or(defaults.nonce_len),
            ike_lifetime: self.ike_lifetime.unwrap_or(defaults.ike_lifetime),
            send_initial_contact: self
                .send_initial_contact
                .unwrap_or(defaults.send_initial_contact),
            quick_mode_commit: self
                .quick_mode_commit
                .unwrap_or(defaults.quick_mode_commit),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Key exchange protocol version and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeVersion {
    /// Legacy Phase 1 Main Mode (identity protection)
    V1Main,
    /// Legacy Phase 1 Aggressive Mode
    V1Aggressive,
    /// Unified SA_INIT / AUTH model
    V2,
}

impl IkeVersion {
    /// Whether this is a legacy mode
    pub fn is_v1(self) -> bool {
        !matches!(self, IkeVersion::V2)
    }
}

/// Peer authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Shared secret looked up by identifier
    PreSharedKey,
    /// Ed25519 signatures with raw public keys
    Ed25519,
}

/// One locally acceptable key-exchange cipher suite
///
/// The legacy model negotiates `hash` (its PRF is HMAC over the hash);
/// the unified model negotiates `prf` and `integrity` separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase1Attributes {
    /// Encryption algorithm
    pub encryption: EncryptionAlgorithm,
    /// Key length in bits for variable length ciphers
    pub key_bits: Option<u16>,
    /// Pseudo-random function
    pub prf: PrfAlgorithm,
    /// Integrity algorithm (None with AEAD ciphers)
    pub integrity: Option<IntegrityAlgorithm>,
    /// Hash algorithm (legacy HASH payloads and IVs)
    pub hash: HashAlgorithm,
    /// Diffie-Hellman group
    pub group: DhGroup,
    /// Authentication method
    pub auth: AuthenticationMethod,
    /// Lifetime of the resulting SA
    pub lifetime: Lifetime,
}

impl Phase1Attributes {
    /// Unified model suite
    pub fn v2(
        encryption: EncryptionAlgorithm,
        key_bits: Option<u16>,
        integrity: Option<IntegrityAlgorithm>,
        prf: PrfAlgorithm,
        group: DhGroup,
    ) -> Self {
        Phase1Attributes {
            encryption,
            key_bits,
            prf,
            integrity,
            hash: prf.hash().unwrap_or(HashAlgorithm::Sha256),
            group,
            auth: AuthenticationMethod::PreSharedKey,
            lifetime: Lifetime::default(),
        }
    }

    /// Legacy model suite
    pub fn v1(
        encryption: EncryptionAlgorithm,
        key_bits: Option<u16>,
        hash: HashAlgorithm,
        group: DhGroup,
        auth: AuthenticationMethod,
    ) -> Self {
        Phase1Attributes {
            encryption,
            key_bits,
            prf: PrfAlgorithm::from_hash(hash),
            integrity: None,
            hash,
            group,
            auth,
            lifetime: Lifetime::default(),
        }
    }

    /// Set authentication method
    pub fn with_auth(mut self, auth: AuthenticationMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Set lifetime
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Key length in bits this suite uses
    pub fn effective_key_bits(&self) -> u16 {
        self.encryption
            .expected_key_bits(self.key_bits)
            .unwrap_or(128)
    }

    /// Validate for the given protocol version
    pub fn validate(&self, version: IkeVersion) -> Result<()> {
        if version.is_v1() {
            if self.encryption.v1_attribute().is_none() {
                return Err(Error::InvalidParameter(format!(
                    "{:?} is not a legacy Phase 1 cipher",
                    self.encryption
                )));
            }
        } else {
            if self.encryption == EncryptionAlgorithm::Null {
                return Err(Error::InvalidParameter(
                    "NULL encryption is not allowed for the IKE SA".into(),
                ));
            }
            if self.integrity.is_none() && !self.encryption.is_aead() {
                return Err(Error::InvalidParameter(
                    "Integrity algorithm required with non-AEAD cipher".into(),
                ));
            }
        }
        if let Some(bits) = self.key_bits {
            if self.encryption.has_variable_key_len() && ![128, 192, 256].contains(&bits) {
                return Err(Error::InvalidParameter(format!("Invalid key length {}", bits)));
            }
        }
        self.lifetime.validate()
    }
}

/// How negotiation with one peer (or peer range) is carried out
#[derive(Debug, Clone)]
pub struct IkePolicy {
    /// Policy name
    pub name: String,
    /// Peer addresses this policy applies to
    pub peer: AddrSpec,
    /// Protocol version / mode
    pub version: IkeVersion,
    /// Acceptable suites in preference order
    pub attributes: Vec<Phase1Attributes>,
    /// Local identity
    pub local_id: Identifier,
    /// Expected peer identity (any identity accepted when None)
    pub peer_id: Option<Identifier>,
    /// SPD group consulted for child SAs negotiated under this policy
    pub ipsec_group: String,
    /// Diffie-Hellman group for Phase 2 / CREATE_CHILD_SA PFS
    pub pfs_group: Option<DhGroup>,
}

impl IkePolicy {
    /// Create builder
    pub fn builder() -> IkePolicyBuilder {
        IkePolicyBuilder::default()
    }

    /// Whether this policy applies to `peer`
    pub fn matches_peer(&self, peer: IpAddr) -> bool {
        self.peer.contains(&AddrSpec::Single(peer))
    }
}

/// Builder for [`IkePolicy`]
#[derive(Debug, Default)]
pub struct IkePolicyBuilder {
    name: Option<String>,
    peer: Option<AddrSpec>,
    version: Option<IkeVersion>,
    attributes: Vec<Phase1Attributes>,
    local_id: Option<Identifier>,
    peer_id: Option<Identifier>,
    ipsec_group: Option<String>,
    pfs_group: Option<DhGroup>,
}

impl IkePolicyBuilder {
    /// Set policy name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set peer address specification
    pub fn with_peer(mut self, peer: AddrSpec) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Set protocol version
    pub fn with_version(mut self, version: IkeVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Append an acceptable suite
    pub fn with_attributes(mut self, attributes: Phase1Attributes) -> Self {
        self.attributes.push(attributes);
        self
    }

    /// Set local identity
    pub fn with_local_id(mut self, id: Identifier) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Set expected peer identity
    pub fn with_peer_id(mut self, id: Identifier) -> Self {
        self.peer_id = Some(id);
        self
    }

    /// Set SPD group
    pub fn with_ipsec_group(mut self, group: impl Into<String>) -> Self {
        self.ipsec_group = Some(group.into());
        self
    }

    /// Enable PFS for child SAs
    pub fn with_pfs_group(mut self, group: DhGroup) -> Self {
        self.pfs_group = Some(group);
        self
    }

    /// Build IkePolicy with validation
    pub fn build(self) -> Result<IkePolicy> {
        let version = self.version.unwrap_or(IkeVersion::V2);
        if self.attributes.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one Phase 1 suite required".into(),
            ));
        }
        if self.attributes.len() > MAX_SUITES {
            return Err(Error::InvalidParameter(format!(
                "At most {} Phase 1 suites can be offered",
                MAX_SUITES
            )));
        }
        for attributes in &self.attributes {
            attributes.validate(version)?;
        }
        let peer = self
            .peer
            .ok_or_else(|| Error::InvalidParameter("peer is required".into()))?;
        peer.validate()?;

        Ok(IkePolicy {
            name: self
                .name
                .ok_or_else(|| Error::InvalidParameter("name is required".into()))?,
            peer,
            version,
            attributes: self.attributes,
            local_id: self
                .local_id
                .ok_or_else(|| Error::InvalidParameter("local_id is required".into()))?,
            peer_id: self.peer_id,
            ipsec_group: self
                .ipsec_group
                .ok_or_else(|| Error::InvalidParameter("ipsec_group is required".into()))?,
            pfs_group: self.pfs_group,
        })
    }
}
