//! Lock-free registry of live sessions.
//!
//! Readers load an immutable snapshot; writers publish a modified copy
//! with read-copy-update, so listing sessions never blocks an event loop.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::session::{Session, SessionId};

type SessionMap = HashMap<SessionId, Arc<Session>>;

pub struct SessionRegistry {
    sessions: ArcSwap<SessionMap>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.load().is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.load().contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.load().get(&id).cloned()
    }

    /// Append every live session to `out`.
    pub fn copy_into<E: Extend<Arc<Session>>>(&self, out: &mut E) {
        out.extend(self.sessions.load().values().cloned());
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions = Vec::new();
        self.copy_into(&mut sessions);
        sessions
    }

    /// Publish a session whose passive side is registered.
    ///
    /// A session retired before it becomes visible is withdrawn again, so
    /// a removal racing with publication never leaves a stale entry.
    /// Returns false when this call withdrew it; exactly one of `publish`
    /// and `retire` reports the entry, so open and close counts pair up.
    pub(crate) fn publish(&self, session: &Arc<Session>) -> bool {
        self.insert(Arc::clone(session));
        !(session.is_retired() && self.remove(session.id()))
    }

    /// Retire a session and drop it from the registry.
    pub(crate) fn retire(&self, session: &Session) -> bool {
        session.retire();
        self.remove(session.id())
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions.rcu(|current| {
            let mut next = SessionMap::clone(current);
            next.insert(session.id(), Arc::clone(&session));
            next
        });
    }

    fn remove(&self, id: SessionId) -> bool {
        let mut removed = false;
        self.sessions.rcu(|current| {
            removed = current.contains_key(&id);
            let mut next = SessionMap::clone(current);
            next.remove(&id);
            next
        });
        removed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::session::tests::aliased_pair;

    fn session() -> (Arc<Session>, Vec<std::net::TcpStream>) {
        let (active, passive, peers) = aliased_pair();
        (Arc::new(Session::new(active, passive)), peers)
    }

    #[test]
    fn test_publish_and_retire() {
        let registry = SessionRegistry::new();
        let (a, _pa) = session();
        let (b, _pb) = session();

        assert!(registry.publish(&a));
        assert!(registry.publish(&b));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id()));

        assert!(registry.retire(&a));
        assert!(!registry.retire(&a));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(b.id()).is_some());
    }

    #[test]
    fn test_retired_session_is_never_visible() {
        let registry = SessionRegistry::new();
        let (s, _peers) = session();

        // Passive removal ran before the dispatcher published.
        assert!(!registry.retire(&s));
        assert!(!registry.publish(&s));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retire_after_publish_reports_once() {
        let registry = SessionRegistry::new();
        let (s, _peers) = session();

        assert!(registry.publish(&s));
        assert!(registry.retire(&s));
        // A late publish of the retired session is withdrawn and not
        // reported again.
        assert!(!registry.publish(&s));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_copy_into_extends() {
        let registry = SessionRegistry::new();
        let (s, _peers) = session();
        assert!(registry.publish(&s));

        let mut out = vec![Arc::clone(&s)];
        registry.copy_into(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
