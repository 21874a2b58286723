//! Live sessions on the accepting side, keyed by token

use super::Session;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lets additional links find the session they belong to
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and drop it again once it closes
    pub fn insert(self: &Arc<Self>, session: Arc<Session>) {
        let token = session.token().to_string();
        self.sessions.write().insert(token.clone(), session.clone());
        debug!(session = %token, "session registered");

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(&token);
            }
        });
    }

    /// Look up a live session
    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .get(token)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(token);
        if removed.is_some() {
            debug!(session = %token, "session unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_reap() {
        let registry = Arc::new(SessionRegistry::new());
        let session = Session::acceptor(None, None, TunnelConfig::default());
        let token = session.token().to_string();

        registry.insert(session.clone());
        assert!(registry.get(&token).is_some());
        assert!(registry.get("unknown").is_none());

        session.close();
        assert!(registry.get(&token).is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = Arc::new(SessionRegistry::new());
        let a = Session::acceptor(None, None, TunnelConfig::default());
        let b = Session::acceptor(None, None, TunnelConfig::default());
        registry.insert(a.clone());
        registry.insert(b.clone());
        assert_eq!(registry.len(), 2);

        registry.close_all();
        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
    }
}
