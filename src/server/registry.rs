//! Directory of live sessions, indexed by connection id and by account.
//!
//! Both indexes live under one lock so every operation observes them in a
//! consistent state: a session visible under its id is always visible under
//! its account, and vice versa. `add` refuses id collisions so the driver
//! can apply the eviction policy; `force_add` replaces the holder once the
//! driver has decided.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::ConnectionId;
use crate::server::session::Session;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<ConnectionId, Arc<Session>>,
    by_account: HashMap<Uuid, Vec<Arc<Session>>>,
}

impl Indexes {
    fn insert(&mut self, session: Arc<Session>) {
        self.by_account
            .entry(session.account)
            .or_default()
            .push(Arc::clone(&session));
        self.by_id.insert(session.id, session);
    }

    fn unlink_account(&mut self, session: &Arc<Session>) {
        if let Some(sessions) = self.by_account.get_mut(&session.account) {
            sessions.retain(|other| !Arc::ptr_eq(other, session));
            if sessions.is_empty() {
                self.by_account.remove(&session.account);
            }
        }
    }
}

/// All live sessions. One mutex over both indexes; hold times are short and
/// callbacks passed to [`ConnectionRegistry::for_each`] must not re-enter.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Returns false without side effects when the
    /// connection id is already taken.
    pub async fn add(&self, session: Arc<Session>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.by_id.contains_key(&session.id) {
            return false;
        }
        inner.insert(session);
        true
    }

    /// Registers a session, evicting whoever holds the id from both indexes.
    pub async fn force_add(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock().await;
        if let Some(evicted) = inner.by_id.remove(&session.id) {
            inner.unlink_account(&evicted);
        }
        inner.insert(session);
    }

    /// Removes this exact session. A session that was force-replaced under
    /// the same id leaves the replacement untouched.
    pub async fn remove(&self, session: &Arc<Session>) {
        let mut inner = self.inner.lock().await;
        let holder_matches = inner
            .by_id
            .get(&session.id)
            .is_some_and(|held| Arc::ptr_eq(held, session));
        if holder_matches {
            inner.by_id.remove(&session.id);
        }
        inner.unlink_account(session);
    }

    pub async fn by_id(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.inner.lock().await.by_id.get(&id).cloned()
    }

    /// Sessions for one account, oldest first.
    pub async fn by_account(&self, account: Uuid) -> Vec<Arc<Session>> {
        self.inner
            .lock()
            .await
            .by_account
            .get(&account)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.by_id.is_empty()
    }

    /// Visits every session under the lock. The callback must not block or
    /// call back into the registry.
    pub async fn for_each(&self, mut visit: impl FnMut(&Arc<Session>)) {
        let inner = self.inner.lock().await;
        for session in inner.by_id.values() {
            visit(session);
        }
    }
}
