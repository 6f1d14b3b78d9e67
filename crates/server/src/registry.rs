use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub type OutboundSender = mpsc::Sender<serde_json::Value>;

/// One live socket. A session starts unauthenticated and is bound to a user
/// by a successful authenticate command.
#[derive(Clone)]
pub struct Session {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub sender: OutboundSender,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, HashSet<String>>,
}

/// Tracks live connections and the user index over them. A user may hold any
/// number of concurrent sessions; presence means at least one.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly accepted, not yet authenticated connection. An entry
    /// left behind under the same id by an earlier socket is replaced.
    pub async fn attach(&self, connection_id: &str, sender: OutboundSender) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.sessions.remove(connection_id) {
            detach_from_index(&mut inner.by_user, &previous);
        }
        inner.sessions.insert(
            connection_id.to_string(),
            Session {
                connection_id: connection_id.to_string(),
                user_id: None,
                connected_at: Utc::now(),
                sender,
            },
        );
    }

    /// Binds a connection to a user. Idempotent for repeated authentication
    /// and rebinds cleanly when a connection re-authenticates as someone else.
    pub async fn register(&self, connection_id: &str, user_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let session = match inner.sessions.get_mut(connection_id) {
            Some(session) => session,
            None => return false,
        };
        let previous = session.user_id.replace(user_id.to_string());
        if let Some(previous_user) = previous {
            if previous_user == user_id {
                return true;
            }
            remove_index_entry(&mut inner.by_user, &previous_user, connection_id);
        }
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection = %connection_id, user = %user_id, "session registered");
        true
    }

    /// Drops a connection. A no-op when the id is unknown.
    pub async fn unregister(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.remove(connection_id) {
            detach_from_index(&mut inner.by_user, &session);
            debug!(
                connection = %session.connection_id,
                connected_at = %session.connected_at,
                "session removed"
            );
        }
    }

    pub async fn user_for(&self, connection_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(connection_id)
            .and_then(|session| session.user_id.clone())
    }

    pub async fn connections_for(&self, user_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of live senders for a user, taken under the read lock so the
    /// actual sends happen without holding it.
    pub async fn senders_for(&self, user_id: &str) -> Vec<(String, OutboundSender)> {
        let inner = self.inner.read().await;
        let ids = match inner.by_user.get(user_id) {
            Some(ids) => ids,
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| {
                inner
                    .sessions
                    .get(id)
                    .map(|session| (id.clone(), session.sender.clone()))
            })
            .collect()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }
}

fn detach_from_index(by_user: &mut HashMap<String, HashSet<String>>, session: &Session) {
    if let Some(user_id) = session.user_id.as_deref() {
        remove_index_entry(by_user, user_id, &session.connection_id);
    }
}

fn remove_index_entry(
    by_user: &mut HashMap<String, HashSet<String>>,
    user_id: &str,
    connection_id: &str,
) {
    if let Some(ids) = by_user.get_mut(user_id) {
        ids.remove(connection_id);
        if ids.is_empty() {
            by_user.remove(user_id);
        }
    }
}
