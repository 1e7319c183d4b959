//! Admission checks run before a WebSocket upgrade is accepted.
//!
//! Order: project lookup, origin policy, token signature, expiry, the
//! `sendable` claim, then the single-use cache. The first failing check
//! decides the error; nothing about it is ever sent to the client.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::{ExpiryPolicy, ServerConfig};
use crate::db::StoreError;
use crate::domain::{self, RejectReason, Verdict};
use crate::handle::ClientIdentity;
use crate::project::{Project, ProjectLookup};
use crate::token::{self, Claims, TokenError, UsedTokens};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unknown project '{0}'")]
    UnknownProject(String),
    #[error("origin rejected: {}", .0.as_str())]
    OriginRejected(RejectReason),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("token expired")]
    Expired,
    #[error("token already used")]
    Replayed,
    #[error("invalid '{0}' claim")]
    InvalidClaim(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A client that passed every check.
#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: ClientIdentity,
    pub sendable: bool,
    /// Claims other than `id` and `sendable`.
    pub claims: Map<String, Value>,
}

pub struct Gatekeeper {
    projects: Arc<dyn ProjectLookup>,
    expiry: ExpiryPolicy,
    used_tokens: Option<UsedTokens>,
    replay_ttl_secs: i64,
}

impl Gatekeeper {
    pub fn new(projects: Arc<dyn ProjectLookup>, config: &ServerConfig) -> Self {
        Self {
            projects,
            expiry: config.token_expiry,
            used_tokens: config.single_use_tokens.then(UsedTokens::new),
            replay_ttl_secs: config.replay_ttl_secs,
        }
    }

    /// Authenticate a connection request for `project` carrying `token`.
    pub async fn authenticate(
        &self,
        project: &str,
        token: &str,
        origin: Option<&str>,
    ) -> Result<Admission, HandshakeError> {
        let name = project.to_lowercase();
        let lookup = Arc::clone(&self.projects);
        let found = tokio::task::spawn_blocking(move || lookup.lookup_project(&name))
            .await
            .map_err(|e| StoreError::Database(format!("project lookup task failed: {e}")))??;
        let Some(project_record) = found else {
            return Err(HandshakeError::UnknownProject(project.to_string()));
        };
        self.admit(&project_record, token, origin, chrono::Utc::now().timestamp())
    }

    /// Run the checks that follow the lookup, at time `now` (unix seconds).
    pub fn admit(
        &self,
        project: &Project,
        token: &str,
        origin: Option<&str>,
        now: i64,
    ) -> Result<Admission, HandshakeError> {
        if let Verdict::Reject(reason) = domain::evaluate(origin, project) {
            return Err(HandshakeError::OriginRejected(reason));
        }

        let mut claims = token::verify(token, &project.secret)?;
        let expires_at = check_expiry(&claims, self.expiry, now)?;

        let sendable = match claims.extra.remove("sendable") {
            None => true,
            Some(Value::Bool(b)) => b,
            Some(_) => return Err(HandshakeError::InvalidClaim("sendable")),
        };

        if let Some(used) = &self.used_tokens {
            let until = expires_at.unwrap_or(now + self.replay_ttl_secs);
            if !used.mark_used(token, until, now) {
                return Err(HandshakeError::Replayed);
            }
        }

        Ok(Admission {
            identity: ClientIdentity::new(project.name.clone(), claims.id),
            sendable,
            claims: claims.extra,
        })
    }
}

/// Apply the expiry policy. Returns the token's `exp` when it was enforced.
fn check_expiry(claims: &Claims, policy: ExpiryPolicy, now: i64) -> Result<Option<i64>, HandshakeError> {
    let exp = match (policy, claims.get("exp")) {
        (ExpiryPolicy::Ignore, _) => return Ok(None),
        (ExpiryPolicy::Required, None) => return Err(HandshakeError::InvalidClaim("exp")),
        (ExpiryPolicy::IfPresent, None) => return Ok(None),
        (_, Some(v)) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .ok_or(HandshakeError::InvalidClaim("exp"))?,
    };
    if exp <= now {
        return Err(HandshakeError::Expired);
    }
    Ok(Some(exp))
}
