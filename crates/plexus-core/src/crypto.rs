//! Cryptographic primitives for Plexus.
//!
//! Provides three things:
//!   1. P-384 keys: ephemeral keypairs and their `x5u` encoding
//!      (base64 of the DER SubjectPublicKeyInfo)
//!   2. Key agreement: ECDH shared secret and the 32-byte frame key
//!      derived from it with the handshake salt
//!   3. BLAKE3 session id derivation
//!
//! Remote public keys are validated when they are decoded, so any `PublicKey`
//! that reaches `derive_shared_secret` is already a valid curve point.
//! Secret material is wiped from memory when dropped.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p384::ecdh::diffie_hellman;
use p384::pkcs8::{DecodePublicKey, EncodePublicKey};
use p384::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the salt the proxy generates when acting as the server.
pub const SALT_LEN: usize = 16;

/// Length of the derived frame key (AES-256).
pub const SYMMETRIC_KEY_LEN: usize = 32;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A P-384 keypair.
///
/// The proxy holds one for its lifetime; it is the key presented to clients in
/// the server-handshake token and to backends in the re-signed login chain.
/// `SecretKey` zeroizes itself on drop.
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new keypair from the OS entropy source.
    ///
    /// Entropy failure panics inside the RNG; there is no recovery from it.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// The public key in `x5u` form, as carried in token headers.
    pub fn x5u(&self) -> Result<String, CryptoError> {
        encode_x5u(&self.public)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").finish_non_exhaustive()
    }
}

/// Generate a fresh ephemeral keypair.
pub fn generate_ephemeral_keypair() -> Keypair {
    Keypair::generate()
}

/// Encode a public key as base64 DER SubjectPublicKeyInfo.
pub fn encode_x5u(key: &PublicKey) -> Result<String, CryptoError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(format!("cannot encode public key: {e}")))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// Resolve the public key an `x5u` header field points to.
///
/// The field embeds the key itself. A missing or undecodable field is an
/// `InvalidCertificate`; a decodable field that does not hold a valid P-384
/// point is an `InvalidKey`.
pub fn public_key_from_x5u(x5u: &str) -> Result<PublicKey, CryptoError> {
    let x5u = x5u.trim();
    if x5u.is_empty() {
        return Err(CryptoError::InvalidCertificate("empty x5u".into()));
    }
    let der = STANDARD
        .decode(x5u)
        .map_err(|e| CryptoError::InvalidCertificate(format!("x5u is not base64: {e}")))?;
    PublicKey::from_public_key_der(&der)
        .map_err(|e| CryptoError::InvalidKey(format!("x5u does not hold a P-384 key: {e}")))
}

/// Decode a SEC1-encoded point, rejecting anything not on the curve.
pub fn public_key_from_sec1(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| CryptoError::InvalidKey("point is not on P-384".into()))
}

// ── Key agreement ─────────────────────────────────────────────────────────────

/// ECDH between our private key and the peer's public key.
///
/// Returns the raw 48-byte x-coordinate, wiped on drop.
pub fn derive_shared_secret(local: &Keypair, remote: &PublicKey) -> Zeroizing<Vec<u8>> {
    let shared = diffie_hellman(local.secret.to_nonzero_scalar(), remote.as_affine());
    Zeroizing::new(shared.raw_secret_bytes().to_vec())
}

/// Derive the frame key:
///
///   key = SHA-256(salt || shared_secret)
pub fn derive_symmetric_key(shared_secret: &[u8], salt: &[u8]) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(shared_secret);
    SymmetricKey(hasher.finalize().into())
}

/// Generate a random handshake salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// A derived AES-256 frame key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }

    /// CFB8 IV: the first 16 bytes of the key.
    pub fn iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.0[..16]);
        iv
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

// ── Encryption context ────────────────────────────────────────────────────────

/// Everything one leg's handshake needs to arrive at a frame key.
///
/// Lives only for the duration of a handshake step. The shared secret and
/// salt are wiped when the context is consumed or dropped.
pub struct EncryptionContext {
    local_public: PublicKey,
    remote_public: PublicKey,
    shared_secret: Zeroizing<Vec<u8>>,
    salt: Zeroizing<Vec<u8>>,
}

impl EncryptionContext {
    /// Run ECDH against `remote_public` and hold the result with `salt`.
    pub fn new(local: &Keypair, remote_public: PublicKey, salt: Vec<u8>) -> Result<Self, CryptoError> {
        if salt.is_empty() {
            return Err(CryptoError::InvalidSalt("salt is empty".into()));
        }
        let shared_secret = derive_shared_secret(local, &remote_public);
        Ok(Self {
            local_public: *local.public_key(),
            remote_public,
            shared_secret,
            salt: Zeroizing::new(salt),
        })
    }

    pub fn local_public(&self) -> &PublicKey {
        &self.local_public
    }

    pub fn remote_public(&self) -> &PublicKey {
        &self.remote_public
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Derive the frame key, consuming the context.
    pub fn into_symmetric_key(self) -> SymmetricKey {
        derive_symmetric_key(&self.shared_secret, &self.salt)
    }
}

// ── Session ids ───────────────────────────────────────────────────────────────

/// Generate a cryptographically random 16-byte nonce.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Derive a session id from the client identity and a per-connection nonce.
///
///   session_id = BLAKE3(identity || nonce)
pub fn derive_session_id(identity: &str, nonce: &[u8; 16]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identity.as_bytes());
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("token is missing the {0} claim")]
    MissingClaim(&'static str),

    #[error("invalid salt: {0}")]
    InvalidSalt(String),

    #[error("token signature does not verify")]
    BadSignature,

    #[error("token chain is not rooted in a trusted key")]
    UntrustedIssuer,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
