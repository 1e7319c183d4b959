//! Origin policy: decides whether a connection's `Origin` may reach a project.
//!
//! Deny rules always win. Otherwise the origin is admitted when an allow
//! rule matches or the project accepts any domain. Browsers send the
//! literal origin `null` for sandboxed and opaque contexts; that origin is
//! never admitted.

use crate::project::{Project, RuleKind};

/// Host used when the request carried no `Origin` header.
pub const UNKNOWN_ORIGIN: &str = "unknown";

const PATTERN_HINT: &str = "E.g. example.com, sub.example.com, *.example.com, *.com or localhost";

/// Outcome of evaluating an origin against a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The origin was the opaque `null` origin.
    NullOrigin,
    /// A deny rule matched.
    Denied,
    /// No allow rule matched and the project does not accept any domain.
    NotAllowed,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::NullOrigin => "null origin",
            RejectReason::Denied => "origin denied",
            RejectReason::NotAllowed => "origin not allowed",
        }
    }
}

impl Verdict {
    pub fn is_admitted(self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Reduce an origin (or a configured pattern) to a bare lower-case host:
/// scheme, one trailing slash and any port are removed.
pub fn normalize_origin(origin: &str) -> String {
    let lowered = origin.trim().to_lowercase();
    let host = lowered
        .strip_prefix("http://")
        .or_else(|| lowered.strip_prefix("https://"))
        .unwrap_or(&lowered);
    let host = host.strip_suffix('/').unwrap_or(host);
    host.split(':').next().unwrap_or_default().to_string()
}

/// Evaluate the request's origin header (if any) against a project's policy.
pub fn evaluate(origin: Option<&str>, project: &Project) -> Verdict {
    let host = match origin {
        Some(o) => normalize_origin(o),
        None => UNKNOWN_ORIGIN.to_string(),
    };

    if host == "null" {
        return Verdict::Reject(RejectReason::NullOrigin);
    }

    let matching = |kind: RuleKind| {
        project
            .rules
            .iter()
            .filter(move |r| r.kind == kind)
            .any(|r| pattern_matches(&r.pattern, &host))
    };

    if matching(RuleKind::Deny) {
        return Verdict::Reject(RejectReason::Denied);
    }
    if project.allow_any_domain || matching(RuleKind::Allow) {
        Verdict::Admit
    } else {
        Verdict::Reject(RejectReason::NotAllowed)
    }
}

/// Match a normalized host against a rule pattern.
///
/// Without `*` the pattern must equal the host. Each `*` consumes one or
/// more host characters drawn from `[a-z0-9.-]`, so `*.example.com`
/// covers `a.example.com` and `b.a.example.com` but not `example.com`.
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    let pattern = normalize_origin(pattern);
    if !pattern.contains('*') {
        return pattern == host;
    }
    glob_match(pattern.as_bytes(), host.as_bytes())
}

fn is_label_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.'
}

fn glob_match(pattern: &[u8], host: &[u8]) -> bool {
    match (pattern.first(), host.first()) {
        (None, None) => true,
        (Some(b'*'), Some(&c)) if is_label_byte(c) => {
            // Star has consumed `c`: either it stops here or keeps going.
            glob_match(&pattern[1..], &host[1..]) || glob_match(pattern, &host[1..])
        }
        (Some(b'*'), _) => false,
        (Some(a), Some(b)) if a == b => glob_match(&pattern[1..], &host[1..]),
        _ => false,
    }
}

/// Validate a domain pattern before it is stored, returning its normalized form.
///
/// Accepted: `localhost`, dotted hosts whose last label is alphabetic, and
/// either of those behind a single leading `*.` label.
pub fn validate_pattern(raw: &str) -> Result<String, String> {
    let host = normalize_origin(raw);
    if host == "localhost" {
        return Ok(host);
    }

    let (wildcard, rest) = match host.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, host.as_str()),
    };

    let labels: Vec<&str> = rest.split('.').collect();
    if labels.len() < 2 && !wildcard {
        return Err(format!("Invalid domain '{host}'. {PATTERN_HINT}"));
    }
    let label_ok = |l: &&str| {
        !l.is_empty() && l.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    };
    let tld_ok = labels
        .last()
        .is_some_and(|tld| !tld.is_empty() && tld.bytes().all(|b| b.is_ascii_lowercase()));

    if labels.iter().all(label_ok) && tld_ok {
        Ok(host)
    } else {
        Err(format!("Invalid domain '{host}'. {PATTERN_HINT}"))
    }
}
