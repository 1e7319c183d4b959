//! Inbound frame routing.
//!
//! Clients send `{"message": <any JSON>, "receivers": <id or [ids]>}`.
//! Without `receivers` the message goes to everyone else in the project;
//! with it, only to the named identities of the sender's own project.
//! Recipients always get `{"sender": <id>, "message": <message>}`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backplane::Backplane;
use crate::handle::{ClientIdentity, ConnectionHandle, Delivery};
use crate::registry::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub message: Value,
    #[serde(default)]
    pub receivers: Option<Receivers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Receivers {
    One(ReceiverId),
    Many(Vec<ReceiverId>),
}

/// Integer ids match identities minted from integer `id` claims.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReceiverId {
    Text(String),
    Number(i64),
}

impl From<ReceiverId> for String {
    fn from(id: ReceiverId) -> Self {
        match id {
            ReceiverId::Text(s) => s,
            ReceiverId::Number(n) => n.to_string(),
        }
    }
}

impl Receivers {
    fn into_vec(self) -> Vec<String> {
        match self {
            Receivers::One(id) => vec![id.into()],
            Receivers::Many(ids) => ids.into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    sender: &'a str,
    message: &'a Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not valid JSON, or missing `message`. Dropped.
    Malformed,
    Broadcast,
    /// Frames queued on this node; remote nodes deliver their own share.
    Targeted { local_deliveries: usize },
}

/// Route one text frame from `sender`.
pub fn route(
    sender: &ConnectionHandle,
    raw: &str,
    registry: &SessionRegistry,
    backplane: &dyn Backplane,
) -> RouteOutcome {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(raw) else {
        return RouteOutcome::Malformed;
    };
    let Ok(out) = serde_json::to_string(&OutboundFrame {
        sender: &sender.identity.id,
        message: &frame.message,
    }) else {
        return RouteOutcome::Malformed;
    };
    let out: Arc<str> = Arc::from(out);

    let Some(receivers) = frame.receivers else {
        backplane.publish(sender.group(), out, Some(sender.id));
        return RouteOutcome::Broadcast;
    };

    let mut seen = HashSet::new();
    let mut local_deliveries = 0;
    for receiver in receivers.into_vec() {
        if !seen.insert(receiver.clone()) {
            continue;
        }
        let identity = ClientIdentity::new(sender.identity.project.clone(), receiver);
        for handle in registry.lookup(&identity) {
            if handle.id == sender.id {
                continue;
            }
            if handle.deliver(Arc::clone(&out)) == Delivery::Queued {
                local_deliveries += 1;
            }
        }
        backplane.relay_direct(&identity, Arc::clone(&out));
    }
    RouteOutcome::Targeted { local_deliveries }
}
