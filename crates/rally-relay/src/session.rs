//! Session store: maps session ids to the members currently joined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rally_common::{ParticipantId, SessionId};
use tokio::sync::{mpsc, RwLock};

/// One joined socket.
struct Member {
    peer_id: ParticipantId,
    tx: mpsc::Sender<String>,
}

/// A session fans frames out among any number of members.
#[derive(Default)]
struct Session {
    members: HashMap<u64, Member>,
    /// First participant to join; kept for the life of the session.
    host: Option<ParticipantId>,
}

/// Result of a join.
pub struct Joined {
    /// Key for later `others`/`leave` calls.
    pub member: u64,
    /// Elected host, when host election is on.
    pub host: Option<ParticipantId>,
    /// Every member including the joiner.
    pub everyone: Vec<mpsc::Sender<String>>,
}

/// Thread-safe session store.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    next_member: Arc<AtomicU64>,
    elect_host: bool,
}

impl SessionStore {
    pub fn new(elect_host: bool) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_member: Arc::new(AtomicU64::new(1)),
            elect_host,
        }
    }

    /// Add a member, creating the session on first join.
    pub async fn join(
        &self,
        session_id: &SessionId,
        peer_id: &ParticipantId,
        tx: mpsc::Sender<String>,
    ) -> Joined {
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        let mut map = self.sessions.write().await;
        let session = map.entry(session_id.clone()).or_default();
        session.members.insert(
            member,
            Member {
                peer_id: peer_id.clone(),
                tx,
            },
        );
        let host = self
            .elect_host
            .then(|| session.host.get_or_insert_with(|| peer_id.clone()).clone());
        let everyone = session.members.values().map(|m| m.tx.clone()).collect();
        Joined {
            member,
            host,
            everyone,
        }
    }

    /// Senders of every member except `member`.
    pub async fn others(&self, session_id: &SessionId, member: u64) -> Vec<mpsc::Sender<String>> {
        let map = self.sessions.read().await;
        map.get(session_id)
            .map(|session| {
                session
                    .members
                    .iter()
                    .filter(|(id, _)| **id != member)
                    .map(|(_, m)| m.tx.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a member. Returns true if the session was removed (last one out).
    pub async fn leave(&self, session_id: &SessionId, member: u64) -> bool {
        let mut map = self.sessions.write().await;
        let Some(session) = map.get_mut(session_id) else {
            return false;
        };
        if let Some(gone) = session.members.remove(&member) {
            tracing::debug!(session = %session_id, peer = %gone.peer_id, "member removed");
        }
        if session.members.is_empty() {
            map.remove(session_id);
            return true;
        }
        false
    }

    pub async fn host(&self, session_id: &SessionId) -> Option<ParticipantId> {
        self.sessions.read().await.get(session_id)?.host.clone()
    }

    pub async fn member_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |s| s.members.len())
    }

    /// Number of active sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
