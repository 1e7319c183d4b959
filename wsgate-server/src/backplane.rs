//! Group fan-out.
//!
//! Every connection joins the group named after its project. [`Backplane`]
//! is the seam between the single-process table ([`LocalGroups`]) and the
//! cluster-wide implementation in `mesh`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::{ClientIdentity, ConnId, ConnectionHandle, Delivery};

pub trait Backplane: Send + Sync {
    fn join_group(&self, group: &str, handle: Arc<ConnectionHandle>);

    /// Leaving a group the connection is not in is a no-op.
    fn leave_group(&self, group: &str, conn: ConnId);

    /// Deliver `frame` to every member of `group` except `exclude`,
    /// on every broker instance.
    fn publish(&self, group: &str, frame: Arc<str>, exclude: Option<ConnId>);

    /// Hand a targeted frame to the other broker instances. Local delivery
    /// is the caller's job.
    fn relay_direct(&self, receiver: &ClientIdentity, frame: Arc<str>);

    /// Connected broker peers.
    fn peer_count(&self) -> usize {
        0
    }
}

/// In-process group table.
#[derive(Default)]
pub struct LocalGroups {
    groups: Mutex<HashMap<String, HashMap<ConnId, Arc<ConnectionHandle>>>>,
}

impl LocalGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to local members. Returns how many frames were queued.
    pub fn fan_out(&self, group: &str, frame: &Arc<str>, exclude: Option<ConnId>) -> usize {
        // Snapshot under the lock, deliver outside it.
        let members: Vec<Arc<ConnectionHandle>> = match self.groups.lock().get(group) {
            Some(m) => m.values().filter(|h| Some(h.id) != exclude).cloned().collect(),
            None => return 0,
        };
        members
            .iter()
            .filter(|h| h.deliver(Arc::clone(frame)) == Delivery::Queued)
            .count()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.groups.lock().get(group).map_or(0, HashMap::len)
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

impl Backplane for LocalGroups {
    fn join_group(&self, group: &str, handle: Arc<ConnectionHandle>) {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(handle.id, handle);
    }

    fn leave_group(&self, group: &str, conn: ConnId) {
        let mut groups = self.groups.lock();
        if let Some(members) = groups.get_mut(group) {
            members.remove(&conn);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    fn publish(&self, group: &str, frame: Arc<str>, exclude: Option<ConnId>) {
        let n = self.fan_out(group, &frame, exclude);
        tracing::trace!(group, delivered = n, "Group publish");
    }

    fn relay_direct(&self, _receiver: &ClientIdentity, _frame: Arc<str>) {}
}
