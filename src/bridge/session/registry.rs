//! Explicit lookup service for live sessions.

use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use super::Session;

/// Identity of one [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sessions by id.
///
/// Uses `DashMap` so lookups from many tasks never contend on one lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` and return its id.
    pub fn insert(&self, session: Session) -> (SessionId, Arc<Session>) {
        let id = session.id();
        let session = Arc::new(session);
        self.sessions.insert(id, Arc::clone(&session));
        (id, session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Forget `id`. The caller is responsible for shutting the session down.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Remove and shut down every registered session.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(session) = self.remove(id) {
                session.shutdown().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;

    #[tokio::test]
    async fn insert_lookup_remove() {
        let registry = SessionRegistry::new();
        let session = Session::open(BridgeSettings::default(), None).await.unwrap();
        let (id, session) = registry.insert(session);

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(id).unwrap(), &session));

        let removed = registry.remove(id).unwrap();
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
        removed.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_all_closes_sessions() {
        let registry = SessionRegistry::new();
        let (_, first) = registry.insert(Session::open(BridgeSettings::default(), None).await.unwrap());
        let (_, second) = registry.insert(Session::open(BridgeSettings::default(), None).await.unwrap());

        registry.shutdown_all().await;

        assert!(registry.is_empty());
        assert!(first.is_closed());
        assert!(second.is_closed());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
