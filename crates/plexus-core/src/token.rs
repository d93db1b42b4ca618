//! Signed ES384 tokens carried in login and server-handshake packets.
//!
//! A token is three base64url segments joined by '.': header JSON, claims
//! JSON, signature. The header names its issuer in `x5u`, which holds the
//! issuer's P-384 public key directly (see `crypto::public_key_from_x5u`).
//! Signatures are the fixed 96-byte `r || s` form.
//!
//! Parsing never implies trust. `verify_login_chain` applies a `TrustPolicy`
//! on top of the parsed tokens.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::PublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{TrustConfig, TrustPolicyKind};
use crate::crypto::{public_key_from_x5u, CryptoError, Keypair};

pub const ALG_ES384: &str = "ES384";

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5u: Option<String>,
}

/// A parsed token. Holds the exact text that was signed so verification
/// does not depend on re-serializing JSON.
#[derive(Debug, Clone)]
pub struct SignedToken {
    header: TokenHeader,
    claims: Map<String, Value>,
    signing_input: String,
    signature: Vec<u8>,
    raw: String,
}

impl SignedToken {
    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// The token in its compact wire form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Public key of the issuer, taken from the header's `x5u`.
    pub fn issuer_public_key(&self) -> Result<PublicKey, CryptoError> {
        match self.header.x5u.as_deref() {
            Some(x5u) => public_key_from_x5u(x5u),
            None => Err(CryptoError::InvalidCertificate(
                "token header has no x5u".into(),
            )),
        }
    }

    pub fn string_claim(&self, name: &'static str) -> Result<&str, CryptoError> {
        self.claims
            .get(name)
            .and_then(Value::as_str)
            .ok_or(CryptoError::MissingClaim(name))
    }

    /// Decode the base64 `salt` claim of a server-handshake token.
    pub fn salt(&self) -> Result<Vec<u8>, CryptoError> {
        let encoded = self.string_claim("salt")?;
        let salt = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidSalt(format!("salt is not base64: {e}")))?;
        if salt.is_empty() {
            return Err(CryptoError::InvalidSalt("salt is empty".into()));
        }
        Ok(salt)
    }

    /// Check the signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<(), CryptoError> {
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| CryptoError::BadSignature)?;
        VerifyingKey::from(key)
            .verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Check the signature against the token's own `x5u` key and return it.
    pub fn verify_self_signed(&self) -> Result<PublicKey, CryptoError> {
        let key = self.issuer_public_key()?;
        self.verify(&key)?;
        Ok(key)
    }
}

/// Split a compact token into header, claims and signature.
///
/// Structural only: the signature is not checked.
pub fn parse_certificate_chain(token: &str) -> Result<SignedToken, CryptoError> {
    let token = token.trim();
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::MalformedToken(
            "expected three dot-separated segments".into(),
        ));
    };

    let header_bytes = decode_segment(header_b64, "header")?;
    let claims_bytes = decode_segment(claims_b64, "claims")?;
    let signature = decode_segment(sig_b64, "signature")?;

    let header: TokenHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| CryptoError::MalformedToken(format!("header: {e}")))?;
    let claims: Map<String, Value> = serde_json::from_slice(&claims_bytes)
        .map_err(|e| CryptoError::MalformedToken(format!("claims: {e}")))?;

    Ok(SignedToken {
        header,
        claims,
        signing_input: format!("{header_b64}.{claims_b64}"),
        signature,
        raw: token.to_string(),
    })
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| CryptoError::MalformedToken(format!("{what} is not base64url: {e}")))
}

/// Sign `claims` with `keypair`, naming the keypair's public key in `x5u`.
pub fn sign_token(keypair: &Keypair, claims: Map<String, Value>) -> Result<SignedToken, CryptoError> {
    let header = TokenHeader {
        alg: ALG_ES384.to_string(),
        x5u: Some(keypair.x5u()?),
    };
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| CryptoError::MalformedToken(format!("header: {e}")))?;
    let claims_json = serde_json::to_vec(&claims)
        .map_err(|e| CryptoError::MalformedToken(format!("claims: {e}")))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let signature: Signature = SigningKey::from(keypair.secret_key()).sign(signing_input.as_bytes());
    let signature = signature.to_bytes().to_vec();
    let raw = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(&signature));

    Ok(SignedToken {
        header,
        claims,
        signing_input,
        signature,
        raw,
    })
}

/// The token the proxy sends a client in its server-handshake packet.
pub fn server_handshake_token(keypair: &Keypair, salt: &[u8]) -> Result<SignedToken, CryptoError> {
    let mut claims = Map::new();
    claims.insert("salt".into(), Value::String(STANDARD.encode(salt)));
    sign_token(keypair, claims)
}

// ── Trust ─────────────────────────────────────────────────────────────────────

/// How much of a client's login chain is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Parse only. Signatures are not checked.
    Accept,
    /// Every link verifies against its own `x5u`, each link's `x5u` equals
    /// the previous link's `identityPublicKey`, and when `anchors` is not
    /// empty at least one link must be issued by an anchor key.
    Verify { anchors: Vec<String> },
}

impl From<&TrustConfig> for TrustPolicy {
    fn from(config: &TrustConfig) -> Self {
        match config.policy {
            TrustPolicyKind::Accept => TrustPolicy::Accept,
            TrustPolicyKind::Verify => TrustPolicy::Verify {
                anchors: config.anchors.clone(),
            },
        }
    }
}

/// Who a login belongs to, as asserted by the last link of its chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub display_name: String,
    pub xuid: String,
    pub uuid: String,
    /// The client's key in `x5u` form.
    pub identity_public_key: String,
    pub extra_data: Value,
}

/// A verified client login.
#[derive(Debug, Clone)]
pub struct VerifiedLogin {
    pub profile: ClientProfile,
    pub identity_key: PublicKey,
    pub client_data: SignedToken,
}

pub fn verify_login_chain(
    chain: &[String],
    client_data: &str,
    policy: &TrustPolicy,
) -> Result<VerifiedLogin, CryptoError> {
    if chain.is_empty() {
        return Err(CryptoError::MalformedToken("login chain is empty".into()));
    }
    let links = chain
        .iter()
        .map(|t| parse_certificate_chain(t))
        .collect::<Result<Vec<_>, _>>()?;

    if let TrustPolicy::Verify { anchors } = policy {
        let mut expected_issuer: Option<&str> = None;
        let mut anchored = anchors.is_empty();
        for link in &links {
            link.verify_self_signed()?;
            let issuer = link.header.x5u.as_deref().unwrap_or_default();
            if let Some(expected) = expected_issuer {
                if expected != issuer {
                    return Err(CryptoError::UntrustedIssuer);
                }
            }
            anchored |= anchors.iter().any(|a| a == issuer);
            expected_issuer = Some(link.string_claim("identityPublicKey")?);
        }
        if !anchored {
            return Err(CryptoError::UntrustedIssuer);
        }
    }

    let last = &links[links.len() - 1];
    let identity_public_key = last.string_claim("identityPublicKey")?.to_string();
    let identity_key = public_key_from_x5u(&identity_public_key)?;

    let extra_data = last
        .claims
        .get("extraData")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or(CryptoError::MissingClaim("extraData"))?;
    let display_name = extra_data
        .get("displayName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(CryptoError::MissingClaim("displayName"))?
        .to_string();
    let field = |name: &str| {
        extra_data
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let xuid = field("XUID");
    let uuid = field("identity");

    let client_data = parse_certificate_chain(client_data)?;
    if matches!(policy, TrustPolicy::Verify { .. }) {
        client_data.verify(&identity_key)?;
    }

    Ok(VerifiedLogin {
        profile: ClientProfile {
            display_name,
            xuid,
            uuid,
            identity_public_key,
            extra_data,
        },
        identity_key,
        client_data,
    })
}

// ── Login signing ─────────────────────────────────────────────────────────────

/// The two token fields of a login packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTokens {
    pub chain: Vec<String>,
    pub client_data: String,
}

/// Build a single-link, self-signed login for `keypair`.
pub fn sign_login(
    keypair: &Keypair,
    extra_data: Value,
    client_claims: Map<String, Value>,
) -> Result<LoginTokens, CryptoError> {
    let mut claims = Map::new();
    claims.insert("identityPublicKey".into(), Value::String(keypair.x5u()?));
    claims.insert("extraData".into(), extra_data);
    let link = sign_token(keypair, claims)?;
    let client_data = sign_token(keypair, client_claims)?;
    Ok(LoginTokens {
        chain: vec![link.raw],
        client_data: client_data.raw,
    })
}

/// Re-issue a client's login under the proxy key.
///
/// The backend then runs its key exchange against the proxy, which is what
/// lets the proxy decrypt the downstream leg.
pub fn forge_login(
    keypair: &Keypair,
    profile: &ClientProfile,
    client_data: &SignedToken,
) -> Result<LoginTokens, CryptoError> {
    sign_login(keypair, profile.extra_data.clone(), client_data.claims.clone())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
