//! Peer identities and credentials
//!
//! Identification payloads carry a type and opaque data; both key
//! exchange versions share the same type numbers for the identifier
//! kinds supported here:
//!
//! ```text
//! ID_IPV4_ADDR     1   4 octets
//! ID_FQDN          2   domain name
//! ID_RFC822_ADDR   3   user@domain
//! ID_IPV6_ADDR     5   16 octets
//! ID_DER_ASN1_DN   9   DER encoded distinguished name
//! ID_KEY_ID       11   opaque octets
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zeroize::Zeroizing;

use crate::crypto::SignatureAlgorithm;
use crate::error::{Error, Result};

/// Identifier carried in ID payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Fully qualified domain name
    Fqdn(String),
    /// RFC 822 address
    UserFqdn(String),
    /// DER encoded distinguished name
    DerDn(Vec<u8>),
    /// Opaque key identifier
    KeyId(Vec<u8>),
}

impl Identifier {
    /// ID type value on the wire
    pub fn id_type(&self) -> u8 {
        match self {
            Identifier::Ipv4(_) => 1,
            Identifier::Fqdn(_) => 2,
            Identifier::UserFqdn(_) => 3,
            Identifier::Ipv6(_) => 5,
            Identifier::DerDn(_) => 9,
            Identifier::KeyId(_) => 11,
        }
    }

    /// Identification data on the wire
    pub fn data(&self) -> Vec<u8> {
        match self {
            Identifier::Ipv4(addr) => addr.octets().to_vec(),
            Identifier::Ipv6(addr) => addr.octets().to_vec(),
            Identifier::Fqdn(name) | Identifier::UserFqdn(name) => name.as_bytes().to_vec(),
            Identifier::DerDn(data) | Identifier::KeyId(data) => data.clone(),
        }
    }

    /// Parse an identifier from its wire type and data
    ///
    /// Address identifiers whose data length does not match the address
    /// family are rejected.
    pub fn from_wire(id_type: u8, data: &[u8]) -> Result<Self> {
        match id_type {
            1 => {
                let octets: [u8; 4] = data.try_into().map_err(|_| Error::InvalidLength {
                    expected: 4,
                    actual: data.len(),
                })?;
                Ok(Identifier::Ipv4(Ipv4Addr::from(octets)))
            }
            5 => {
                let octets: [u8; 16] = data.try_into().map_err(|_| Error::InvalidLength {
                    expected: 16,
                    actual: data.len(),
                })?;
                Ok(Identifier::Ipv6(Ipv6Addr::from(octets)))
            }
            2 | 3 => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| Error::InvalidPayload("Identifier is not valid UTF-8".into()))?;
                if text.is_empty() {
                    return Err(Error::InvalidPayload("Empty identifier".into()));
                }
                if id_type == 2 {
                    Ok(Identifier::Fqdn(text.to_string()))
                } else {
                    Ok(Identifier::UserFqdn(text.to_string()))
                }
            }
            9 => Ok(Identifier::DerDn(data.to_vec())),
            11 => Ok(Identifier::KeyId(data.to_vec())),
            other => Err(Error::InvalidPayload(format!(
                "Unsupported identification type {}",
                other
            ))),
        }
    }

    /// Address identifier
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Identifier::Ipv4(v4),
            IpAddr::V6(v6) => Identifier::Ipv6(v6),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Ipv4(addr) => write!(f, "{}", addr),
            Identifier::Ipv6(addr) => write!(f, "{}", addr),
            Identifier::Fqdn(name) | Identifier::UserFqdn(name) => f.write_str(name),
            Identifier::DerDn(data) => write!(f, "dn:{}", hex::encode(data)),
            Identifier::KeyId(data) => write!(f, "keyid:{}", hex::encode(data)),
        }
    }
}

/// Signature credential
#[derive(Clone)]
pub struct Credential {
    /// Signature algorithm
    pub algorithm: SignatureAlgorithm,
    /// Raw public key
    pub public_key: Vec<u8>,
    /// Raw private key (only for local identities)
    pub private_key: Option<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("algorithm", &self.algorithm)
            .field("public_key", &hex::encode(&self.public_key))
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

/// Pre-shared key and credential lookup by identifier
#[derive(Default)]
pub struct IdentityStore {
    psks: HashMap<Identifier, Zeroizing<Vec<u8>>>,
    credentials: HashMap<Identifier, Credential>,
}

impl fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityStore")
            .field("psks", &self.psks.len())
            .field("credentials", &self.credentials.len())
            .finish()
    }
}

impl IdentityStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-shared key for `id`
    pub fn add_psk(&mut self, id: Identifier, psk: impl Into<Vec<u8>>) -> Result<()> {
        let psk = psk.into();
        if psk.is_empty() {
            return Err(Error::InvalidParameter("PSK cannot be empty".into()));
        }
        self.psks.insert(id, Zeroizing::new(psk));
        Ok(())
    }

    /// Pre-shared key for `id`
    pub fn psk(&self, id: &Identifier) -> Option<&[u8]> {
        self.psks.get(id).map(|k| k.as_slice())
    }

    /// Pre-shared key registered for a peer address
    pub fn psk_for_addr(&self, addr: IpAddr) -> Option<&[u8]> {
        self.psk(&Identifier::from_addr(addr))
    }

    /// Register a signature credential for `id`
    pub fn add_credential(&mut self, id: Identifier, credential: Credential) -> Result<()> {
        if credential.public_key.is_empty() {
            return Err(Error::InvalidParameter("Public key cannot be empty".into()));
        }
        self.credentials.insert(id, credential);
        Ok(())
    }

    /// Signature credential for `id`
    pub fn credential(&self, id: &Identifier) -> Option<&Credential> {
        self.credentials.get(id)
    }

    /// Forget everything registered for `id`
    pub fn remove(&mut self, id: &Identifier) -> bool {
        let psk = self.psks.remove(id).is_some();
        let cred = self.credentials.remove(id).is_some();
        psk || cred
    }
}
