//! Handshake credentials.
//!
//! [`Auth`] issues and checks HS256 compact tokens
//! (`base64url(header).base64url(claims).base64url(hmac)`). Several secrets
//! may be configured: tokens are signed with the first and accepted if any of
//! them verifies, which allows key rotation.
//!
//! Connections only see the two capability traits: a client holds a
//! [`Signer`] that produces the token it presents, a server holds an
//! [`Authenticator`] that turns a presented token into a session value.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

/// Default token lifetime (1 hour).
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Token signing/verification failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The `exp` claim is in the past.
    #[error("Expired: {0}")]
    Expired(i64),

    /// No configured secret verifies the token.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Not a well-formed token.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// `Auth` was built without any secret.
    #[error("\"secrets\" required!")]
    NoSecrets,

    /// A custom authenticator refused the token.
    #[error("{0}")]
    Rejected(String),
}

/// HS256 token issuer/verifier.
#[derive(Clone)]
pub struct Auth {
    secrets: Vec<Vec<u8>>,
    expires_in: Duration,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("secrets", &self.secrets.len())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl Auth {
    /// Create with a single secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        Self::with_secrets([secret])
    }

    /// Create with several secrets; the first one signs.
    pub fn with_secrets<I, S>(secrets: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let secrets: Vec<Vec<u8>> = secrets
            .into_iter()
            .map(|s| s.as_ref().to_vec())
            .filter(|s| !s.is_empty())
            .collect();
        if secrets.is_empty() {
            return Err(AuthError::NoSecrets);
        }
        Ok(Self {
            secrets,
            expires_in: DEFAULT_EXPIRES_IN,
        })
    }

    /// Set the lifetime stamped into new tokens. Zero keeps the default.
    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        if !expires_in.is_zero() {
            self.expires_in = expires_in;
        }
        self
    }

    /// Sign `claims` (a JSON object, or null for none).
    ///
    /// An `exp` claim is added unless the caller supplied one.
    pub fn sign(&self, claims: &Value) -> Result<String, AuthError> {
        let mut payload = match claims {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(AuthError::Malformed(
                    "claims must be a JSON object".to_string(),
                ))
            }
        };
        if !payload.contains_key("exp") {
            let exp = unix_now().as_secs() + self.expires_in.as_secs();
            payload.insert("exp".to_string(), json!(exp));
        }

        let header = URL_SAFE_NO_PAD.encode(json!({ "alg": ALGORITHM }).to_string());
        let body = URL_SAFE_NO_PAD.encode(Value::Object(payload).to_string());
        let signing_input = format!("{}.{}", header, body);
        let signature = URL_SAFE_NO_PAD.encode(mac(&self.secrets[0], &signing_input)?);

        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Read the claims without checking signature or expiry.
    pub fn decode(&self, token: &str) -> Option<Value> {
        parse(token).ok().map(|parts| parts.claims)
    }

    /// Check expiry, then the signature against every secret.
    pub fn verify(&self, token: &str) -> Result<Value, AuthError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: Duration) -> Result<Value, AuthError> {
        let parts = parse(token)?;

        let exp = parts.claims.get("exp").and_then(Value::as_i64).unwrap_or(0);
        if exp <= 0 || (exp as u128) * 1000 < now.as_millis() {
            return Err(AuthError::Expired(exp));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(parts.signature)
            .map_err(|_| AuthError::InvalidSignature)?;
        for secret in &self.secrets {
            let mut mac = HmacSha256::new_from_slice(secret)
                .map_err(|e| AuthError::Malformed(e.to_string()))?;
            mac.update(parts.signing_input.as_bytes());
            if mac.verify_slice(&signature).is_ok() {
                return Ok(parts.claims);
            }
        }
        Err(AuthError::InvalidSignature)
    }
}

struct TokenParts<'a> {
    signing_input: &'a str,
    signature: &'a str,
    claims: Value,
}

fn parse(token: &str) -> Result<TokenParts<'_>, AuthError> {
    let (signing_input, signature) = token
        .rsplit_once('.')
        .ok_or_else(|| AuthError::Malformed("expected three segments".to_string()))?;
    let (header, body) = signing_input
        .split_once('.')
        .ok_or_else(|| AuthError::Malformed("expected three segments".to_string()))?;

    let header = decode_segment(header)?;
    if header.get("alg").and_then(Value::as_str) != Some(ALGORITHM) {
        return Err(AuthError::Malformed("unsupported algorithm".to_string()));
    }
    let claims = decode_segment(body)?;
    if !claims.is_object() {
        return Err(AuthError::Malformed("claims must be a JSON object".to_string()));
    }

    Ok(TokenParts {
        signing_input,
        signature,
        claims,
    })
}

fn decode_segment(segment: &str) -> Result<Value, AuthError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| AuthError::Malformed(e.to_string()))
}

fn mac(secret: &[u8], input: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| AuthError::Malformed(e.to_string()))?;
    mac.update(input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Produces the token a client presents in the handshake.
///
/// Called once per connection attempt, so time-limited tokens stay fresh
/// across reconnects.
pub trait Signer: Send + Sync + 'static {
    /// Token to send as the single `auth` parameter.
    fn signature(&self) -> Result<String, AuthError>;
}

impl<F> Signer for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn signature(&self) -> Result<String, AuthError> {
        Ok(self())
    }
}

/// [`Signer`] that signs a fixed set of claims with an [`Auth`].
#[derive(Debug, Clone)]
pub struct ClaimsSigner {
    auth: Auth,
    claims: Value,
}

impl ClaimsSigner {
    /// Sign `claims` with `auth` on every connection attempt.
    pub fn new(auth: Auth, claims: Value) -> Self {
        Self { auth, claims }
    }
}

impl Signer for ClaimsSigner {
    fn signature(&self) -> Result<String, AuthError> {
        self.auth.sign(&self.claims)
    }
}

/// Checks the token presented in the handshake.
///
/// The returned value becomes the connection's session.
pub trait Authenticator: Send + Sync + 'static {
    /// Verify `token`, returning the session value.
    fn authenticate(&self, token: &str) -> Result<Value, AuthError>;
}

impl Authenticator for Auth {
    fn authenticate(&self, token: &str) -> Result<Value, AuthError> {
        self.verify(token)
    }
}

impl<F> Authenticator for F
where
    F: Fn(&str) -> Result<Value, AuthError> + Send + Sync + 'static,
{
    fn authenticate(&self, token: &str) -> Result<Value, AuthError> {
        self(token)
    }
}
