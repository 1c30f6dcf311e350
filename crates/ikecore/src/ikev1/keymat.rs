//! Oakley key derivation (RFC 2409 Section 5 and Appendix B)
//!
//! ```text
//! SKEYID   = prf(pre-shared-key, Ni_b | Nr_b)            pre-shared keys
//! SKEYID   = prf(Ni_b | Nr_b, g^xy)                      signatures
//! SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0)
//! SKEYID_a = prf(SKEYID, SKEYID_d | g^xy | CKY-I | CKY-R | 1)
//! SKEYID_e = prf(SKEYID, SKEYID_a | g^xy | CKY-I | CKY-R | 2)
//!
//! HASH_I   = prf(SKEYID, g^xi | g^xr | CKY-I | CKY-R | SAi_b | IDii_b)
//! HASH_R   = prf(SKEYID, g^xr | g^xi | CKY-R | CKY-I | SAi_b | IDir_b)
//!
//! KEYMAT   = K1 | K2 | ...
//!   K1 = prf(SKEYID_d, [g(qm)^xy |] protocol | SPI | Ni_b | Nr_b)
//!   Kn = prf(SKEYID_d, K(n-1) | [g(qm)^xy |] protocol | SPI | Ni_b | Nr_b)
//! ```

use zeroize::Zeroizing;

use crate::config::Phase1Attributes;
use crate::crypto::{prf, CryptoProvider, HashAlgorithm, PrfAlgorithm};
use crate::error::{Error, Result};
use crate::install::ChildKeys;
use crate::spd::{SaKeys, SecurityProtocol};

/// Longest nonce key accepted by the PRF when keying SKEYID for signatures
pub const MAX_PRF_KEY_LEN: usize = 64;

/// Key material of an established ISAKMP SA
#[derive(Clone)]
pub struct OakleyKeys {
    /// SKEYID
    pub skeyid: Zeroizing<Vec<u8>>,
    /// SKEYID_d (Phase 2 keying material)
    pub skeyid_d: Zeroizing<Vec<u8>>,
    /// SKEYID_a (Phase 2 and informational hashes)
    pub skeyid_a: Zeroizing<Vec<u8>>,
    /// SKEYID_e
    pub skeyid_e: Zeroizing<Vec<u8>>,
    /// Cipher key derived from SKEYID_e
    pub encryption_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for OakleyKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OakleyKeys")
            .field("encryption_key_len", &self.encryption_key.len())
            .finish_non_exhaustive()
    }
}

/// Cookies, nonces and shared secret feeding the SKEYID family
#[derive(Debug, Clone, Copy)]
pub struct Phase1Inputs<'a> {
    /// Initiator cookie
    pub initiator_cookie: &'a [u8; 8],
    /// Responder cookie
    pub responder_cookie: &'a [u8; 8],
    /// Initiator nonce body
    pub ni: &'a [u8],
    /// Responder nonce body
    pub nr: &'a [u8],
    /// Diffie-Hellman shared secret g^xy
    pub shared: &'a [u8],
}

/// SKEYID for pre-shared key authentication
pub fn skeyid_psk(
    provider: &dyn CryptoProvider,
    prf_alg: PrfAlgorithm,
    psk: &[u8],
    ni: &[u8],
    nr: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    prf(provider, prf_alg, psk, &[ni, nr])
}

/// SKEYID for signature authentication
///
/// The nonce key is cut to [`MAX_PRF_KEY_LEN`] octets.
pub fn skeyid_signature(
    provider: &dyn CryptoProvider,
    prf_alg: PrfAlgorithm,
    ni: &[u8],
    nr: &[u8],
    shared: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new([ni, nr].concat());
    key.truncate(MAX_PRF_KEY_LEN);
    prf(provider, prf_alg, &key, &[shared])
}

/// Derive SKEYID_d/a/e and the cipher key from SKEYID
///
/// # Errors
///
/// Returns [`Error::InvalidKeyLength`] when the suite's key length is
/// not a whole number of octets.
pub fn derive_oakley_keys(
    provider: &dyn CryptoProvider,
    suite: &Phase1Attributes,
    skeyid: Zeroizing<Vec<u8>>,
    inputs: &Phase1Inputs<'_>,
) -> Result<OakleyKeys> {
    let alg = suite.prf;
    let cky_i = inputs.initiator_cookie.as_slice();
    let cky_r = inputs.responder_cookie.as_slice();

    let skeyid_d = prf(provider, alg, &skeyid, &[inputs.shared, cky_i, cky_r, &[0]])?;
    let skeyid_a = prf(
        provider,
        alg,
        &skeyid,
        &[&skeyid_d, inputs.shared, cky_i, cky_r, &[1]],
    )?;
    let skeyid_e = prf(
        provider,
        alg,
        &skeyid,
        &[&skeyid_a, inputs.shared, cky_i, cky_r, &[2]],
    )?;

    let bits = suite.effective_key_bits();
    if bits % 8 != 0 {
        return Err(Error::InvalidKeyLength {
            expected: (bits as usize / 8 + 1) * 8,
            actual: bits as usize,
        });
    }
    let encryption_key = expand_cipher_key(provider, alg, &skeyid_e, bits as usize / 8)?;

    Ok(OakleyKeys {
        skeyid,
        skeyid_d,
        skeyid_a,
        skeyid_e,
        encryption_key,
    })
}

/// Cipher key from SKEYID_e (RFC 2409 Appendix B)
///
/// A long enough SKEYID_e is truncated; otherwise it is expanded with
/// `K1 = prf(SKEYID_e, 0)`, `Kn = prf(SKEYID_e, K(n-1))`.
pub fn expand_cipher_key(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid_e: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if skeyid_e.len() >= len {
        return Ok(Zeroizing::new(skeyid_e[..len].to_vec()));
    }
    let mut key = Zeroizing::new(Vec::with_capacity(len));
    let mut k = Zeroizing::new(vec![0u8]);
    while key.len() < len {
        k = prf(provider, alg, skeyid_e, &[&k])?;
        key.extend_from_slice(&k);
    }
    key.truncate(len);
    Ok(key)
}

/// Inputs of HASH_I / HASH_R
#[derive(Debug, Clone, Copy)]
pub struct AuthHashInputs<'a> {
    /// Initiator public value g^xi
    pub ke_i: &'a [u8],
    /// Responder public value g^xr
    pub ke_r: &'a [u8],
    /// Initiator cookie
    pub initiator_cookie: &'a [u8; 8],
    /// Responder cookie
    pub responder_cookie: &'a [u8; 8],
    /// Body of the initiator's SA payload
    pub sa_i: &'a [u8],
}

/// HASH_I (`for_initiator`) or HASH_R over the ID payload body of the
/// side being authenticated
pub fn auth_hash(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid: &[u8],
    inputs: &AuthHashInputs<'_>,
    id_body: &[u8],
    for_initiator: bool,
) -> Result<Vec<u8>> {
    let cky_i = inputs.initiator_cookie.as_slice();
    let cky_r = inputs.responder_cookie.as_slice();
    let data: [&[u8]; 6] = if for_initiator {
        [inputs.ke_i, inputs.ke_r, cky_i, cky_r, inputs.sa_i, id_body]
    } else {
        [inputs.ke_r, inputs.ke_i, cky_r, cky_i, inputs.sa_i, id_body]
    };
    Ok(prf(provider, alg, skeyid, &data)?.to_vec())
}

/// Initial Phase 1 IV: `hash(g^xi | g^xr)` cut to the block size
pub fn phase1_iv(
    provider: &dyn CryptoProvider,
    hash: HashAlgorithm,
    ke_i: &[u8],
    ke_r: &[u8],
    block_size: usize,
) -> Result<Vec<u8>> {
    let mut iv = provider.hash(hash, &[ke_i, ke_r])?;
    iv.truncate(block_size);
    Ok(iv)
}

/// IV of a Phase 2 or informational exchange:
/// `hash(last Phase 1 CBC block | M-ID)` cut to the block size
pub fn phase2_iv(
    provider: &dyn CryptoProvider,
    hash: HashAlgorithm,
    last_phase1_block: &[u8],
    message_id: u32,
    block_size: usize,
) -> Result<Vec<u8>> {
    let mut iv = provider.hash(hash, &[last_phase1_block, &message_id.to_be_bytes()])?;
    iv.truncate(block_size);
    Ok(iv)
}

/// Quick Mode HASH(1), HASH(2) and informational HASH(1)
///
/// `prf(SKEYID_a, M-ID | [Ni_b |] rest)` where `rest` is every payload
/// after the HASH payload, headers included.
pub fn message_hash(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid_a: &[u8],
    message_id: u32,
    ni: Option<&[u8]>,
    rest: &[u8],
) -> Result<Vec<u8>> {
    let id = message_id.to_be_bytes();
    let hash = match ni {
        Some(ni) => prf(provider, alg, skeyid_a, &[&id, ni, rest])?,
        None => prf(provider, alg, skeyid_a, &[&id, rest])?,
    };
    Ok(hash.to_vec())
}

/// Quick Mode HASH(3): `prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)`
pub fn quick_hash3(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid_a: &[u8],
    message_id: u32,
    ni: &[u8],
    nr: &[u8],
) -> Result<Vec<u8>> {
    Ok(prf(provider, alg, skeyid_a, &[&[0], &message_id.to_be_bytes(), ni, nr])?.to_vec())
}

/// Per-exchange inputs of Quick Mode KEYMAT
#[derive(Debug, Clone, Copy)]
pub struct KeymatSeed<'a> {
    /// Shared secret of the Quick Mode key exchange, with PFS
    pub pfs_shared: Option<&'a [u8]>,
    /// Initiator nonce body
    pub ni: &'a [u8],
    /// Responder nonce body
    pub nr: &'a [u8],
}

/// KEYMAT for one direction of an IPsec SA
///
/// `spi` is the SPI chosen by the receiver of that direction.
pub fn keymat(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid_d: &[u8],
    seed: &KeymatSeed<'_>,
    protocol: u8,
    spi: u32,
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let spi = spi.to_be_bytes();
    let shared = seed.pfs_shared.unwrap_or(&[]);
    let (ni, nr) = (seed.ni, seed.nr);

    let mut out = Zeroizing::new(Vec::with_capacity(len));
    let mut k = Zeroizing::new(Vec::new());
    while out.len() < len {
        k = prf(provider, alg, skeyid_d, &[&k, shared, &[protocol], &spi, ni, nr])?;
        out.extend_from_slice(&k);
    }
    out.truncate(len);
    Ok(out)
}

fn split_keys(security: &SecurityProtocol, stream: &[u8]) -> SaKeys {
    let encr = security.encryption_keymat_len();
    SaKeys {
        encryption: Zeroizing::new(stream[..encr].to_vec()),
        integrity: Zeroizing::new(stream[encr..].to_vec()),
    }
}

/// Keys of one negotiated IPsec SA pair
///
/// Each direction has its own KEYMAT keyed by the receiver's SPI; the
/// cipher key comes first, the integrity key after it.
pub fn derive_ipsec_keys(
    provider: &dyn CryptoProvider,
    alg: PrfAlgorithm,
    skeyid_d: &[u8],
    seed: &KeymatSeed<'_>,
    security: &SecurityProtocol,
    spis: (u32, u32),
) -> Result<ChildKeys> {
    let (inbound_spi, outbound_spi) = spis;
    let len = security.encryption_keymat_len() + security.integrity_key_len();
    let protocol = security.protocol.protocol_id();
    let inbound = keymat(provider, alg, skeyid_d, seed, protocol, inbound_spi, len)?;
    let outbound = keymat(provider, alg, skeyid_d, seed, protocol, outbound_spi, len)?;
    Ok(ChildKeys {
        inbound: split_keys(security, &inbound),
        outbound: split_keys(security, &outbound),
    })
}
