//! In-process signaling hub.
//!
//! Mirrors the dev relay server: frames sent by one endpoint reach every
//! other endpoint of the same session, and the first participant to join a
//! session is announced as its host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rally_common::{ParticipantId, SessionId};
use serde_json::Value;
use tracing::{debug, warn};

use super::{MessageHandler, Signaling, SignalingEvent};
use crate::protocol::{Negotiation, SignalingMessage};

#[derive(Default)]
struct Hub {
    rooms: HashMap<SessionId, Room>,
    next_member: u64,
}

#[derive(Default)]
struct Room {
    members: Vec<(u64, Arc<EndpointShared>)>,
    host: Option<ParticipantId>,
}

struct EndpointShared {
    session_id: SessionId,
    peer_id: ParticipantId,
    handler: RwLock<Option<MessageHandler>>,
    member: Mutex<Option<u64>>,
}

impl EndpointShared {
    fn deliver(&self, event: SignalingEvent) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared hub; cheap to clone.
#[derive(Clone)]
pub struct MemorySignaling {
    hub: Arc<Mutex<Hub>>,
    elect_host: bool,
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignaling {
    /// Hub that announces the first joiner of each session as host.
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            elect_host: true,
        }
    }

    /// Hub that only relays frames.
    pub fn without_host_election() -> Self {
        Self {
            elect_host: false,
            ..Self::new()
        }
    }

    pub fn endpoint(&self, session_id: SessionId, peer_id: ParticipantId) -> MemoryEndpoint {
        MemoryEndpoint {
            hub: self.clone(),
            shared: Arc::new(EndpointShared {
                session_id,
                peer_id,
                handler: RwLock::new(None),
                member: Mutex::new(None),
            }),
        }
    }

    pub fn host_of(&self, session_id: &SessionId) -> Option<ParticipantId> {
        lock(&self.hub)
            .rooms
            .get(session_id)
            .and_then(|room| room.host.clone())
    }

    pub fn member_count(&self, session_id: &SessionId) -> usize {
        lock(&self.hub)
            .rooms
            .get(session_id)
            .map_or(0, |room| room.members.len())
    }
}

/// One participant's view of a [`MemorySignaling`] hub.
pub struct MemoryEndpoint {
    hub: MemorySignaling,
    shared: Arc<EndpointShared>,
}

impl MemoryEndpoint {
    fn member_id(&self) -> Option<u64> {
        *lock(&self.shared.member)
    }
}

impl Signaling for MemoryEndpoint {
    fn connect(&self) {
        if self.member_id().is_some() {
            return;
        }

        let (announce, recipients) = {
            let mut hub = lock(&self.hub.hub);
            hub.next_member += 1;
            let member = hub.next_member;
            let room = hub
                .rooms
                .entry(self.shared.session_id.clone())
                .or_default();
            room.members.push((member, Arc::clone(&self.shared)));
            *lock(&self.shared.member) = Some(member);

            let mut announce = None;
            if self.hub.elect_host {
                let host = room
                    .host
                    .get_or_insert_with(|| self.shared.peer_id.clone())
                    .clone();
                announce = Some(host);
            }
            let recipients: Vec<_> = room.members.iter().map(|(_, m)| Arc::clone(m)).collect();
            (announce, recipients)
        };

        debug!(session = %self.shared.session_id, peer = %self.shared.peer_id, "joined memory hub");
        self.shared.deliver(SignalingEvent::Connected);

        if let Some(host_peer_id) = announce {
            let ready = SignalingMessage::new(
                self.shared.session_id.clone(),
                self.shared.peer_id.clone(),
                Negotiation::SessionReady { host_peer_id },
            );
            match ready.to_value() {
                Ok(value) => {
                    for member in recipients {
                        member.deliver(SignalingEvent::Message(value.clone()));
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode SessionReady"),
            }
        }
    }

    fn send(&self, message: Value) {
        let Some(member) = self.member_id() else {
            warn!("signaling not connected, message not sent");
            return;
        };
        let recipients: Vec<_> = {
            let hub = lock(&self.hub.hub);
            match hub.rooms.get(&self.shared.session_id) {
                Some(room) => room
                    .members
                    .iter()
                    .filter(|(id, _)| *id != member)
                    .map(|(_, m)| Arc::clone(m))
                    .collect(),
                None => Vec::new(),
            }
        };
        for recipient in recipients {
            recipient.deliver(SignalingEvent::Message(message.clone()));
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn disconnect(&self) {
        let Some(member) = lock(&self.shared.member).take() else {
            return;
        };
        let mut hub = lock(&self.hub.hub);
        let now_empty = match hub.rooms.get_mut(&self.shared.session_id) {
            Some(room) => {
                room.members.retain(|(id, _)| *id != member);
                room.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            hub.rooms.remove(&self.shared.session_id);
        }
        debug!(session = %self.shared.session_id, peer = %self.shared.peer_id, "left memory hub");
    }

    fn is_connected(&self) -> bool {
        self.member_id().is_some()
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(endpoint: &MemoryEndpoint) -> Arc<Mutex<Vec<SignalingEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        endpoint.set_message_handler(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        log
    }

    fn ready_host(event: &SignalingEvent) -> Option<(String, String)> {
        match event {
            SignalingEvent::Message(value) if value["state"] == "SessionReady" => Some((
                value["peer_id"].as_str()?.to_string(),
                value["host_peer_id"].as_str()?.to_string(),
            )),
            _ => None,
        }
    }

    #[test]
    fn first_joiner_is_announced_host() {
        let hub = MemorySignaling::new();
        let a = hub.endpoint("s1".into(), "p1".into());
        let b = hub.endpoint("s1".into(), "p2".into());
        let log_a = recorder(&a);
        let log_b = recorder(&b);

        a.connect();
        b.connect();

        let a_events = log_a.lock().unwrap().clone();
        assert_eq!(a_events[0], SignalingEvent::Connected);
        let a_ready: Vec<_> = a_events.iter().filter_map(ready_host).collect();
        assert_eq!(
            a_ready,
            vec![
                ("p1".to_string(), "p1".to_string()),
                ("p2".to_string(), "p1".to_string())
            ]
        );

        let b_ready: Vec<_> = log_b.lock().unwrap().iter().filter_map(ready_host).collect();
        assert_eq!(b_ready, vec![("p2".to_string(), "p1".to_string())]);
        assert_eq!(hub.host_of(&"s1".into()), Some("p1".into()));
    }

    #[test]
    fn send_reaches_everyone_but_the_sender() {
        let hub = MemorySignaling::without_host_election();
        let a = hub.endpoint("s1".into(), "p1".into());
        let b = hub.endpoint("s1".into(), "p2".into());
        let c = hub.endpoint("s2".into(), "p3".into());
        let log_a = recorder(&a);
        let log_b = recorder(&b);
        let log_c = recorder(&c);
        a.connect();
        b.connect();
        c.connect();

        a.send(json!({"hello": 1}));

        let messages = |log: &Arc<Mutex<Vec<SignalingEvent>>>| {
            log.lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, SignalingEvent::Message(_)))
                .count()
        };
        assert_eq!(messages(&log_a), 0);
        assert_eq!(messages(&log_b), 1);
        assert_eq!(messages(&log_c), 0);
        assert_eq!(hub.host_of(&"s1".into()), None);
    }

    #[test]
    fn send_before_connect_is_a_no_op() {
        let hub = MemorySignaling::new();
        let a = hub.endpoint("s1".into(), "p1".into());
        assert!(!a.is_connected());
        a.send(json!({"hello": 1}));
        assert_eq!(hub.member_count(&"s1".into()), 0);
    }

    #[test]
    fn disconnect_leaves_the_room() {
        let hub = MemorySignaling::new();
        let a = hub.endpoint("s1".into(), "p1".into());
        let b = hub.endpoint("s1".into(), "p2".into());
        a.connect();
        b.connect();
        assert_eq!(hub.member_count(&"s1".into()), 2);

        b.disconnect();
        assert!(!b.is_connected());
        assert_eq!(hub.member_count(&"s1".into()), 1);

        drop(a);
        assert_eq!(hub.member_count(&"s1".into()), 0);
    }

    #[test]
    fn host_stays_fixed_after_leaving() {
        let hub = MemorySignaling::new();
        let a = hub.endpoint("s1".into(), "p1".into());
        let b = hub.endpoint("s1".into(), "p2".into());
        a.connect();
        b.connect();
        a.disconnect();

        let c = hub.endpoint("s1".into(), "p3".into());
        let log_c = recorder(&c);
        c.connect();
        let ready: Vec<_> = log_c.lock().unwrap().iter().filter_map(ready_host).collect();
        assert_eq!(ready, vec![("p3".to_string(), "p1".to_string())]);
    }
}
