//! Session registry: which connections are live for each client identity.
//!
//! One identity may hold several connections at once (browser tabs,
//! devices). A session exists exactly while it has at least one handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::{ClientIdentity, ConnId, ConnectionHandle};

#[derive(Default)]
struct Session {
    handles: HashMap<ConnId, Arc<ConnectionHandle>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ClientIdentity, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to its identity's session, creating the session if needed.
    ///
    /// Registering the same handle twice has no further effect. Returns the
    /// number of handles the session now holds.
    pub fn register(&self, handle: &Arc<ConnectionHandle>) -> usize {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(handle.identity.clone()).or_default();
        session.handles.insert(handle.id, Arc::clone(handle));
        session.handles.len()
    }

    /// Remove a handle. Unknown handles are ignored. Returns how many handles
    /// the identity still has.
    pub fn deregister(&self, identity: &ClientIdentity, conn: ConnId) -> usize {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(identity) else {
            return 0;
        };
        session.handles.remove(&conn);
        let remaining = session.handles.len();
        if remaining == 0 {
            sessions.remove(identity);
        }
        remaining
    }

    /// Live handles for an identity, in no particular order.
    pub fn lookup(&self, identity: &ClientIdentity) -> Vec<Arc<ConnectionHandle>> {
        self.sessions
            .lock()
            .get(identity)
            .map(|s| s.handles.values().filter(|h| h.is_open()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.lock().values().map(|s| s.handles.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn handle(project: &str, id: &str) -> (Arc<ConnectionHandle>, tokio::sync::mpsc::Receiver<Arc<str>>) {
        ConnectionHandle::new(ClientIdentity::new(project, id), true, Map::new(), 8)
    }

    #[test]
    fn multiple_handles_per_identity() {
        let reg = SessionRegistry::new();
        let (a, _ra) = handle("acme", "u1");
        let (b, _rb) = handle("acme", "u1");
        assert_eq!(reg.register(&a), 1);
        assert_eq!(reg.register(&b), 2);
        assert_eq!(reg.lookup(&a.identity).len(), 2);
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.connection_count(), 2);
    }

    #[test]
    fn register_is_idempotent() {
        let reg = SessionRegistry::new();
        let (a, _ra) = handle("acme", "u1");
        reg.register(&a);
        assert_eq!(reg.register(&a), 1);
    }

    #[test]
    fn session_removed_with_last_handle() {
        let reg = SessionRegistry::new();
        let (a, _ra) = handle("acme", "u1");
        let (b, _rb) = handle("acme", "u1");
        reg.register(&a);
        reg.register(&b);
        assert_eq!(reg.deregister(&a.identity, a.id), 1);
        assert_eq!(reg.session_count(), 1);
        assert_eq!(reg.deregister(&b.identity, b.id), 0);
        assert_eq!(reg.session_count(), 0);
        assert!(reg.lookup(&a.identity).is_empty());
    }

    #[test]
    fn deregister_unknown_is_harmless() {
        let reg = SessionRegistry::new();
        let (a, _ra) = handle("acme", "u1");
        assert_eq!(reg.deregister(&a.identity, a.id), 0);
        reg.register(&a);
        assert_eq!(reg.deregister(&a.identity, a.id + 1_000_000), 1);
    }

    #[test]
    fn identities_are_scoped_by_project() {
        let reg = SessionRegistry::new();
        let (a, _ra) = handle("acme", "u1");
        let (b, _rb) = handle("globex", "u1");
        reg.register(&a);
        reg.register(&b);
        assert_eq!(reg.lookup(&ClientIdentity::new("acme", "u1"))[0].id, a.id);
        assert_eq!(reg.lookup(&ClientIdentity::new("globex", "u1"))[0].id, b.id);
    }

    #[test]
    fn lookup_skips_closed_handles() {
        let reg = SessionRegistry::new();
        let (a, ra) = handle("acme", "u1");
        reg.register(&a);
        drop(ra);
        assert!(reg.lookup(&a.identity).is_empty());
    }

    #[test]
    fn concurrent_register_deregister_leaves_no_sessions() {
        let reg = Arc::new(SessionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let (h, _rx) = handle("acme", &format!("u{}", (t + i) % 5));
                        reg.register(&h);
                        assert!(reg.lookup(&h.identity).iter().any(|x| x.id == h.id));
                        reg.deregister(&h.identity, h.id);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(reg.session_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }
}
