//! Connection tokens: compact HS256 JWS signed with the project secret.
//!
//! [`verify`] only checks the signature and the identity claim. Expiry and
//! single-use enforcement are handshake policy and live in
//! `connection::handshake`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// The one claim every connection token must carry.
pub const IDENTITY_CLAIM: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token has no identity claim")]
    MissingIdentity,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                TokenError::InvalidSignature
            }
            _ => TokenError::Malformed(e.to_string()),
        }
    }
}

/// Verified claim set.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    /// Value of the `id` claim.
    pub id: String,
    /// Every other claim, untouched.
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Signature and algorithm only; `exp` is checked by the handshake.
fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

/// Verify `token` against `secret` and extract its claims.
pub fn verify(token: &str, secret: &str) -> Result<Claims, TokenError> {
    match jsonwebtoken::decode_header(token) {
        Ok(header) if header.alg != Algorithm::HS256 => return Err(TokenError::InvalidSignature),
        Ok(_) => {}
        // An `alg` outside the known set ("none") fails header parsing.
        Err(e) if matches!(e.kind(), ErrorKind::Json(_)) => return Err(TokenError::InvalidSignature),
        Err(e) => return Err(e.into()),
    }

    let data = jsonwebtoken::decode::<Map<String, Value>>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation(),
    )?;
    let mut extra = data.claims;

    let id = match extra.remove(IDENTITY_CLAIM) {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => return Err(TokenError::MissingIdentity),
    };

    Ok(Claims { id, extra })
}

/// Sign a claim object with `secret`.
pub fn sign(claims: &Value, secret: &str) -> Result<String, TokenError> {
    if !claims.is_object() {
        return Err(TokenError::Malformed("claims must be a JSON object".into()));
    }
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Tokens that already opened a connection, kept until they expire.
///
/// Keyed by the signature segment. Local to one broker instance.
#[derive(Default)]
pub struct UsedTokens {
    inner: Mutex<UsedInner>,
}

#[derive(Default)]
struct UsedInner {
    expiry: HashMap<String, i64>,
    /// Earliest expiry on top.
    queue: BinaryHeap<Reverse<(i64, String)>>,
}

impl UsedInner {
    fn prune(&mut self, now: i64) {
        while self.queue.peek().is_some_and(|Reverse((exp, _))| *exp <= now) {
            if let Some(Reverse((exp, key))) = self.queue.pop() {
                if self.expiry.get(&key) == Some(&exp) {
                    self.expiry.remove(&key);
                }
            }
        }
    }
}

impl UsedTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `token` as used until `expires_at` (unix seconds).
    ///
    /// Returns `false` if the token was already recorded and has not aged out.
    pub fn mark_used(&self, token: &str, expires_at: i64, now: i64) -> bool {
        let key = token.rsplit('.').next().unwrap_or(token).to_string();
        let mut inner = self.inner.lock();
        inner.prune(now);
        if inner.expiry.contains_key(&key) {
            return false;
        }
        inner.expiry.insert(key.clone(), expires_at);
        inner.queue.push(Reverse((expires_at, key)));
        true
    }
}
