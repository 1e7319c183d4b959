//! Project (tenant) records as the broker sees them.
//!
//! Projects are owned by account management; the broker only reads them
//! through [`ProjectLookup`] when a connection is being authenticated.

use std::fmt;
use std::str::FromStr;

use crate::db::StoreError;

/// Whether a domain rule admits or blocks matching origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Allow,
    Deny,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Deny => "deny",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(RuleKind::Allow),
            "deny" => Ok(RuleKind::Deny),
            other => Err(format!("unknown rule kind: {other}")),
        }
    }
}

/// One entry of a project's origin ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    /// Literal host, `localhost`, or a `*` glob such as `*.example.com`.
    pub pattern: String,
    pub kind: RuleKind,
}

impl DomainRule {
    pub fn allow(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into(), kind: RuleKind::Allow }
    }

    pub fn deny(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into(), kind: RuleKind::Deny }
    }
}

/// A tenant: signing secret plus origin policy.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub secret: String,
    pub allow_any_domain: bool,
    pub rules: Vec<DomainRule>,
}

/// Read side of the project store, consumed during the handshake.
///
/// Implementations may block on I/O; callers run them on the blocking pool.
pub trait ProjectLookup: Send + Sync {
    /// Returns `Ok(None)` when no project has this name.
    fn lookup_project(&self, name: &str) -> Result<Option<Project>, StoreError>;
}
