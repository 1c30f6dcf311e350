//! IKEv2 Authentication
//!
//! Implements authentication logic as defined in RFC 7296 Section 2.15.
//!
//! ```text
//! SignedOctets = RealMessage | PeerNonce | prf(SK_p, IDPayloadBody)
//!
//! PSK:        AUTH = prf(prf(Shared Secret, "Key Pad for IKEv2"), SignedOctets)
//! Signature:  AUTH = sign(private key, SignedOctets)
//! ```

use std::net::IpAddr;

use super::constants::AuthMethod;
use super::payload::{AuthPayload, IdPayload};
use crate::config::AuthenticationMethod;
use crate::crypto::{prf, verify_equal, CryptoProvider, PrfAlgorithm, SignatureAlgorithm};
use crate::error::{Error, Result};
use crate::identity::{Identifier, IdentityStore};

/// Key pad for IKEv2 (RFC 7296 Section 2.15)
const KEY_PAD_IKEV2: &[u8] = b"Key Pad for IKEv2";

/// Length-prefixed AlgorithmIdentifier for Ed25519 (RFC 7427, RFC 8420)
const ED25519_ALGORITHM_ID: [u8; 8] = [0x07, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70];

/// Octets covered by an AUTH payload
///
/// # Arguments
///
/// * `message` - The first message this side sent (IKE_SA_INIT request
///   or response) exactly as transmitted
/// * `peer_nonce` - Nonce data received from the other side
/// * `sk_p` - SK_pi when authenticating the initiator, SK_pr otherwise
/// * `id` - ID payload of the side being authenticated
pub fn signed_octets(
    provider: &dyn CryptoProvider,
    prf_alg: PrfAlgorithm,
    message: &[u8],
    peer_nonce: &[u8],
    sk_p: &[u8],
    id: &IdPayload,
) -> Result<Vec<u8>> {
    let maced_id = prf(provider, prf_alg, sk_p, &[&id.body()])?;
    Ok([message, peer_nonce, maced_id.as_slice()].concat())
}

/// Compute PSK authentication data
pub fn psk_auth(
    provider: &dyn CryptoProvider,
    prf_alg: PrfAlgorithm,
    psk: &[u8],
    octets: &[u8],
) -> Result<Vec<u8>> {
    let pad_key = prf(provider, prf_alg, psk, &[KEY_PAD_IKEV2])?;
    Ok(prf(provider, prf_alg, &pad_key, &[octets])?.to_vec())
}

/// Pre-shared key shared with a peer
///
/// Looks the key up by the peer's identity first and by its address
/// second.
pub fn resolve_psk<'a>(
    store: &'a IdentityStore,
    peer_id: Option<&Identifier>,
    peer_addr: IpAddr,
) -> Result<&'a [u8]> {
    peer_id
        .and_then(|id| store.psk(id))
        .or_else(|| store.psk_for_addr(peer_addr))
        .ok_or_else(|| {
            Error::AuthenticationFailed(format!("no pre-shared key for peer {}", peer_addr))
        })
}

/// Inputs shared by building and verifying AUTH payloads of one IKE SA
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    /// Crypto provider
    pub provider: &'a dyn CryptoProvider,
    /// Negotiated PRF
    pub prf: PrfAlgorithm,
    /// Keys and credentials
    pub store: &'a IdentityStore,
    /// Authentication method of the negotiated suite
    pub method: AuthenticationMethod,
    /// Peer address (PSK fallback)
    pub peer_addr: IpAddr,
}

impl AuthContext<'_> {
    /// Build our AUTH payload
    ///
    /// # Arguments
    ///
    /// * `local_id` - Our identity (selects the signing credential)
    /// * `peer_id` - Peer identity, if known (selects the PSK)
    /// * `octets` - Output of [`signed_octets`] for our side
    pub fn build(
        &self,
        local_id: &Identifier,
        peer_id: Option<&Identifier>,
        octets: &[u8],
    ) -> Result<AuthPayload> {
        match self.method {
            AuthenticationMethod::PreSharedKey => {
                let psk = resolve_psk(self.store, peer_id, self.peer_addr)?;
                Ok(AuthPayload {
                    method: AuthMethod::SharedKeyMic.to_u8(),
                    data: psk_auth(self.provider, self.prf, psk, octets)?,
                })
            }
            AuthenticationMethod::Ed25519 => {
                let private_key = self
                    .store
                    .credential(local_id)
                    .and_then(|c| c.private_key.as_ref())
                    .ok_or_else(|| {
                        Error::AuthenticationFailed(format!("no signing key for {}", local_id))
                    })?;
                let signature =
                    self.provider
                        .sign(SignatureAlgorithm::Ed25519, private_key, octets)?;
                let mut data = ED25519_ALGORITHM_ID.to_vec();
                data.extend_from_slice(&signature);
                Ok(AuthPayload {
                    method: AuthMethod::DigitalSignature.to_u8(),
                    data,
                })
            }
        }
    }

    /// Verify the peer's AUTH payload
    ///
    /// The payload's method must match the negotiated one.
    pub fn verify(
        &self,
        peer_id: &Identifier,
        received: &AuthPayload,
        octets: &[u8],
    ) -> Result<()> {
        match self.method {
            AuthenticationMethod::PreSharedKey => {
                if received.method != AuthMethod::SharedKeyMic.to_u8() {
                    return Err(Error::AuthenticationFailed(format!(
                        "expected PSK authentication, got method {}",
                        received.method
                    )));
                }
                let psk = resolve_psk(self.store, Some(peer_id), self.peer_addr)?;
                let expected = psk_auth(self.provider, self.prf, psk, octets)?;
                if !verify_equal(&expected, &received.data) {
                    return Err(Error::AuthenticationFailed("AUTH data mismatch".into()));
                }
                Ok(())
            }
            AuthenticationMethod::Ed25519 => {
                if received.method != AuthMethod::DigitalSignature.to_u8() {
                    return Err(Error::AuthenticationFailed(format!(
                        "expected signature authentication, got method {}",
                        received.method
                    )));
                }
                let signature = received
                    .data
                    .strip_prefix(ED25519_ALGORITHM_ID.as_slice())
                    .ok_or_else(|| {
                        Error::AuthenticationFailed("unexpected signature algorithm".into())
                    })?;
                let credential = self.store.credential(peer_id).ok_or_else(|| {
                    Error::AuthenticationFailed(format!("no public key for {}", peer_id))
                })?;
                self.provider.verify(
                    SignatureAlgorithm::Ed25519,
                    &credential.public_key,
                    octets,
                    signature,
                )
            }
        }
    }
}
