//! Session fan-out: routes [`room_world::Routed`] events to the right TCP
//! session(s), and keeps the reverse indexes (`session_of_runtime`,
//! `members_of_room`) the session layer and tick driver both need without
//! having to ask `WorldDirector` for them on every delivery.
//!
//! `members_of_room` updates generically by watching `AvatarAdded`/
//! `AvatarRemoved` events as they pass through `deliver` — it never
//! special-cases *why* an avatar moved (direct join, a `/join` intent, or
//! a door's portal request resolving inside `WorldDirector::route`), the
//! same way `room-kernel` never special-cases who triggered an `Outbound`.

use std::collections::{HashMap, HashSet};

use room_events::Event;
use room_world::{Routed, RuntimeId};
use tokio::sync::{mpsc::Sender, RwLock};

pub type RoomId = String;
pub type SessionId = String;

#[derive(Default)]
struct HubState {
    senders: HashMap<SessionId, Sender<Event>>,
    session_of_runtime: HashMap<RuntimeId, SessionId>,
    members_of_room: HashMap<RoomId, HashSet<RuntimeId>>,
}

/// Bounded capacity for one session's outbound channel; a session that
/// cannot keep up with its own mailbox is disconnected rather than let
/// memory grow unbounded.
pub const SESSION_OUTBOX_CAP: usize = 256;

pub struct SessionHub {
    state: RwLock<HubState>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self { state: RwLock::new(HubState::default()) }
    }

    pub async fn register(&self, session_id: SessionId, runtime_id: RuntimeId, tx: Sender<Event>) {
        let mut state = self.state.write().await;
        state.senders.insert(session_id.clone(), tx);
        state.session_of_runtime.insert(runtime_id, session_id);
    }

    pub async fn unregister(&self, session_id: &str, runtime_id: RuntimeId) {
        let mut state = self.state.write().await;
        state.senders.remove(session_id);
        state.session_of_runtime.remove(&runtime_id);
        for members in state.members_of_room.values_mut() {
            members.remove(&runtime_id);
        }
    }

    /// Deliver a batch of routed events, updating room membership as
    /// `AvatarAdded`/`AvatarRemoved` events are observed.
    pub async fn deliver(&self, routed: Vec<Routed>) {
        if routed.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for item in routed {
            match item {
                Routed::RoomBroadcast { room_id, event } => {
                    Self::track_membership(&mut state, &room_id, &event);
                    let targets: Vec<SessionId> = state
                        .members_of_room
                        .get(&room_id)
                        .into_iter()
                        .flatten()
                        .filter_map(|rid| state.session_of_runtime.get(rid).cloned())
                        .collect();
                    for session_id in targets {
                        Self::send_to(&state, &session_id, event.clone());
                    }
                }
                Routed::ToSession { session_id, event } => {
                    Self::send_to(&state, &session_id, event);
                }
            }
        }
    }

    fn track_membership(state: &mut HubState, room_id: &str, event: &Event) {
        match event {
            Event::AvatarAdded(dto) => {
                state.members_of_room.entry(room_id.to_string()).or_default().insert(dto.runtime_id);
            }
            Event::AvatarRemoved { runtime_id } => {
                if let Some(members) = state.members_of_room.get_mut(room_id) {
                    members.remove(runtime_id);
                }
            }
            _ => {}
        }
    }

    fn send_to(state: &HubState, session_id: &str, event: Event) {
        if let Some(tx) = state.senders.get(session_id) {
            if tx.try_send(event).is_err() {
                tracing::warn!(target: "room.server.hub", session_id, "session outbox full or closed, dropping event");
            }
        }
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}
