//! The World Director (spec §4.6): the registry of rooms, session→avatar
//! binding, and inter-room migration. Each room's kernel sits behind its
//! own `tokio::sync::Mutex` so the rare cross-task access (the tick
//! driver) serializes against inbound intents the same way
//! `EventSourceRegistry` serializes producers against one consumer —
//! an owned collection, mutated only through the Director's own methods.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use room_avatar::Avatar;
use room_catalog::{ColorWhitelist, EmoteCatalog, FurnitureCatalog, ShopCatalog};
use room_events::Event;
use room_grid::Layout;
use room_kernel::{KernelError, Outbound, RoomDirectory, RoomKernel};
use room_persist::RoomStore;
use tokio::sync::Mutex;

pub type RoomId = String;
pub type RuntimeId = u64;

/// A kernel output tagged with where it must be delivered: a specific
/// room's subscribers, or one session directly. Unlike `room_kernel::
/// Outbound`, this never carries an unresolved `PortalRequest` — the
/// Director consumes those itself and expands them into the
/// `RoomBroadcast`/`ToSession` pairs a migration produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    RoomBroadcast { room_id: RoomId, event: Event },
    ToSession { session_id: String, event: Event },
}

struct RoomDirectoryHandle {
    known: RwLock<HashSet<RoomId>>,
}

impl RoomDirectory for RoomDirectoryHandle {
    fn room_exists(&self, room_id: &str) -> bool {
        self.known.read().expect("room directory lock poisoned").contains(room_id)
    }
}

pub struct WorldDirector {
    rooms: HashMap<RoomId, Mutex<RoomKernel>>,
    avatar_location: HashMap<RuntimeId, RoomId>,
    user_sessions: HashMap<String, RuntimeId>,
    directory: Arc<RoomDirectoryHandle>,
    store: Arc<dyn RoomStore>,
    catalog: Arc<FurnitureCatalog>,
    recolor_whitelist: Arc<ColorWhitelist>,
    emote_catalog: Arc<EmoteCatalog>,
    shop_catalog: Arc<ShopCatalog>,
    stack_factor: f64,
    max_stack_z: f64,
}

/// Outcome of `bind_session`: the new session's own routed events, plus
/// the prior session's disconnect events if this user already had one
/// bound (spec §4.6: "single-session-per-user").
pub struct BindOutcome {
    pub outs: Vec<Routed>,
    pub forced_disconnect: Option<Vec<Routed>>,
}

impl WorldDirector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RoomStore>,
        catalog: Arc<FurnitureCatalog>,
        recolor_whitelist: Arc<ColorWhitelist>,
        emote_catalog: Arc<EmoteCatalog>,
        shop_catalog: Arc<ShopCatalog>,
        stack_factor: f64,
        max_stack_z: f64,
    ) -> Self {
        Self {
            rooms: HashMap::new(),
            avatar_location: HashMap::new(),
            user_sessions: HashMap::new(),
            directory: Arc::new(RoomDirectoryHandle { known: RwLock::new(HashSet::new()) }),
            store,
            catalog,
            recolor_whitelist,
            emote_catalog,
            shop_catalog,
            stack_factor,
            max_stack_z,
        }
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn avatar_room(&self, runtime_id: RuntimeId) -> Option<&str> {
        self.avatar_location.get(&runtime_id).map(String::as_str)
    }

    /// The persistence facade this Director was built with, for session
    /// bootstrap code that needs to load/seed a user row before an avatar
    /// exists to own it.
    pub fn store(&self) -> Arc<dyn RoomStore> {
        self.store.clone()
    }

    /// The emote catalog this Director was built with, for chat-command
    /// parsing that needs to recognize a bare per-emote alias (e.g.
    /// `/wave`) before falling back to treating unrecognized input as an
    /// unknown command.
    pub fn emote_catalog(&self) -> Arc<EmoteCatalog> {
        self.emote_catalog.clone()
    }

    /// Register a room, loading its layout from the store if present and
    /// falling back to `default_layout` otherwise (spec §4.1's layout
    /// resolution, applied at the Director level since only the Director
    /// knows whether a room is being created for the first time).
    /// Idempotent: registering an already-known room id is a no-op.
    pub async fn register_room(&mut self, room_id: impl Into<RoomId>, default_layout: Layout) -> Result<(), KernelError> {
        let room_id = room_id.into();
        if self.rooms.contains_key(&room_id) {
            return Ok(());
        }
        let stored = self
            .store
            .load_room_layout(&room_id)
            .await
            .map_err(|e| KernelError::persistence(e.to_string()))?;
        let layout = match stored {
            Some(layout) => layout,
            None => {
                // spec §4.1: a room seeded from its bundled default is
                // written back so subsequent loads come from the store.
                self.store
                    .save_room_layout(&room_id, default_layout.clone())
                    .await
                    .map_err(|e| KernelError::persistence(e.to_string()))?;
                default_layout
            }
        };

        let directory: Arc<dyn RoomDirectory> = self.directory.clone();
        let mut kernel = RoomKernel::with_stack_params(
            room_id.clone(),
            layout,
            self.stack_factor,
            self.max_stack_z,
            self.catalog.clone(),
            self.recolor_whitelist.clone(),
            self.emote_catalog.clone(),
            self.shop_catalog.clone(),
            self.store.clone(),
            directory,
        );
        kernel.load_furniture_from_store().await?;

        self.directory
            .known
            .write()
            .expect("room directory lock poisoned")
            .insert(room_id.clone());
        self.rooms.insert(room_id, Mutex::new(kernel));
        Ok(())
    }

    /// Run `f` against a locked room kernel and route the resulting
    /// outbound events, resolving any portal request it produced. Used by
    /// the session layer to apply a single intent without needing to know
    /// about locking or migration.
    pub async fn dispatch<R>(
        &mut self,
        room_id: &str,
        f: impl FnOnce(&mut RoomKernel) -> (R, Vec<Outbound>),
    ) -> Option<(R, Vec<Routed>)> {
        let outs = {
            let mutex = self.rooms.get(room_id)?;
            let mut guard = mutex.lock().await;
            let (r, outs) = f(&mut guard);
            (r, outs)
        };
        let (r, outs) = outs;
        Some((r, self.route(room_id, outs).await))
    }

    /// Like [`WorldDirector::dispatch`], for the kernel operations that are
    /// themselves `async` (the furniture ops, which await the persistence
    /// facade while holding the room's lock). `f` returns a boxed future
    /// borrowing the kernel reference it was handed, the standard shape for
    /// an "async closure" against a plain `Fn*` trait: a bare generic
    /// `Future` associated type cannot express a lifetime tied to the
    /// per-call `&mut RoomKernel` the way a higher-ranked boxed trait
    /// object can.
    pub async fn dispatch_async<R>(
        &mut self,
        room_id: &str,
        f: impl for<'k> FnOnce(&'k mut RoomKernel) -> std::pin::Pin<Box<dyn std::future::Future<Output = (R, Vec<Outbound>)> + 'k>>,
    ) -> Option<(R, Vec<Routed>)> {
        let (r, outs) = {
            let mutex = self.rooms.get(room_id)?;
            let mut guard = mutex.lock().await;
            f(&mut guard).await
        };
        Some((r, self.route(room_id, outs).await))
    }

    /// Convert a room's raw `Outbound`s into delivery-addressed `Routed`
    /// events, recursively resolving any `PortalRequest` via `change_room`.
    pub async fn route(&mut self, room_id: &str, outs: Vec<Outbound>) -> Vec<Routed> {
        let mut result = Vec::with_capacity(outs.len());
        for out in outs {
            match out {
                Outbound::Broadcast(event) => result.push(Routed::RoomBroadcast { room_id: room_id.to_string(), event }),
                Outbound::ToSession(session_id, event) => result.push(Routed::ToSession { session_id, event }),
                Outbound::PortalRequest { runtime_id, target_room_id, target_x, target_y, session_id } => {
                    match self.change_room(runtime_id, &target_room_id, target_x, target_y, &session_id).await {
                        Ok(mut routed) => result.append(&mut routed),
                        Err(e) => result.push(Routed::ToSession {
                            session_id,
                            event: Event::ActionFailed { kind: e.action_failed_kind(), reason: e.reason().to_string() },
                        }),
                    }
                }
            }
        }
        result
    }

    /// `Join(avatar, room, cell?)` plus single-session-per-user
    /// enforcement: if `user_id` already has a bound session, that prior
    /// session is disconnected first (spec §4.6).
    pub async fn bind_session(
        &mut self,
        user_id: &str,
        mut avatar: Avatar,
        target_room_id: &str,
        requested_cell: Option<(i32, i32)>,
    ) -> Result<BindOutcome, KernelError> {
        if !self.room_exists(target_room_id) {
            return Err(KernelError::validation("unknown room"));
        }
        let runtime_id = avatar.runtime_id;

        let forced_disconnect = match self.user_sessions.get(user_id).copied() {
            Some(prior) if prior != runtime_id => Some(self.force_disconnect(prior, "signed in from another location").await),
            _ => None,
        };

        let spawn = {
            let mutex = self.rooms.get(target_room_id).expect("checked above");
            let guard = mutex.lock().await;
            Self::select_spawn_cell(&guard, requested_cell)
        };
        avatar.x = spawn.0 as f64;
        avatar.y = spawn.1 as f64;

        let join_outs = {
            let mutex = self.rooms.get(target_room_id).expect("checked above");
            let mut guard = mutex.lock().await;
            guard.join(avatar, None)
        };
        self.avatar_location.insert(runtime_id, target_room_id.to_string());
        self.user_sessions.insert(user_id.to_string(), runtime_id);

        let outs = self.route(target_room_id, join_outs).await;
        Ok(BindOutcome { outs, forced_disconnect })
    }

    /// `Leave(runtimeId)` for a clean session disconnect: removes the
    /// avatar from its room and clears the user↔session binding.
    pub async fn unbind_session(&mut self, runtime_id: RuntimeId) -> Option<(Avatar, Vec<Routed>)> {
        let room_id = self.avatar_location.remove(&runtime_id)?;
        let (removed, outs) = {
            let mutex = self.rooms.get(&room_id)?;
            let mut guard = mutex.lock().await;
            guard.leave(runtime_id)
        };
        let avatar = removed?;
        if self.user_sessions.get(&avatar.user_id) == Some(&runtime_id) {
            self.user_sessions.remove(&avatar.user_id);
        }
        let routed = self.route(&room_id, outs).await;
        Some((avatar, routed))
    }

    /// Disconnects a session that lost its single-session-per-user race,
    /// appending a `ForceDisconnect` addressed to it directly.
    async fn force_disconnect(&mut self, runtime_id: RuntimeId, reason: &str) -> Vec<Routed> {
        let Some((avatar, mut routed)) = self.unbind_session(runtime_id).await else {
            return Vec::new();
        };
        routed.push(Routed::ToSession {
            session_id: avatar.session_id.clone(),
            event: Event::ForceDisconnect { reason: reason.to_string() },
        });
        routed
    }

    /// `ChangeRoom`/Portal-arrival handling (spec §4.6): verifies the
    /// target exists and differs from the current room, `Leave`s the
    /// source, `PrepareRoomChange`s the avatar, `Join`s the target, and
    /// pushes a fresh `RoomState` to the moving session.
    pub async fn change_room(
        &mut self,
        runtime_id: RuntimeId,
        target_room_id: &str,
        target_x: Option<i32>,
        target_y: Option<i32>,
        session_id: &str,
    ) -> Result<Vec<Routed>, KernelError> {
        let source_room_id = self
            .avatar_location
            .get(&runtime_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("avatar is not in any room"))?;
        if source_room_id == target_room_id {
            return Err(KernelError::validation("target room is the current room"));
        }
        if !self.room_exists(target_room_id) {
            return Err(KernelError::state_conflict("target room does not exist"));
        }

        let (removed, leave_outs) = {
            let mutex = self.rooms.get(&source_room_id).expect("tracked room must exist");
            let mut guard = mutex.lock().await;
            guard.leave(runtime_id)
        };
        let mut avatar = removed.ok_or_else(|| KernelError::internal("avatar missing from its tracked room"))?;

        let requested = match (target_x, target_y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        };
        let spawn = {
            let mutex = self.rooms.get(target_room_id).expect("checked above");
            let guard = mutex.lock().await;
            Self::select_spawn_cell(&guard, requested)
        };
        avatar.prepare_room_change(target_room_id, spawn.0, spawn.1);

        let join_outs = {
            let mutex = self.rooms.get(target_room_id).expect("checked above");
            let mut guard = mutex.lock().await;
            guard.join(avatar, None)
        };
        self.avatar_location.insert(runtime_id, target_room_id.to_string());

        let mut result = Vec::new();
        result.extend(self.route(&source_room_id, leave_outs).await);
        result.extend(self.route(target_room_id, join_outs).await);
        let snapshot = {
            let mutex = self.rooms.get(target_room_id).expect("checked above");
            let guard = mutex.lock().await;
            guard.state_snapshot()
        };
        result.push(Routed::ToSession { session_id: session_id.to_string(), event: Event::RoomState(snapshot) });
        Ok(result)
    }

    /// Advance every room's tick and route the combined outbound events
    /// (spec §4.4's `Tick`, fanned out over every registered room).
    pub async fn tick_all(&mut self, dt: f64) -> Vec<Routed> {
        let room_ids: Vec<RoomId> = self.rooms.keys().cloned().collect();
        let mut result = Vec::new();
        for room_id in room_ids {
            let outs = {
                let mutex = self.rooms.get(&room_id).expect("iterating known rooms");
                let mut guard = mutex.lock().await;
                guard.tick(dt)
            };
            result.extend(self.route(&room_id, outs).await);
        }
        result
    }

    /// Spawn selection fallback chain (spec §4.6): requested cell, then
    /// room center, then a spiral outward, then the first walkable cell
    /// top-to-bottom, then `(0,0)` with a critical log.
    fn select_spawn_cell(kernel: &RoomKernel, requested: Option<(i32, i32)>) -> (i32, i32) {
        if let Some((x, y)) = requested {
            if kernel.is_walkable(x, y) {
                return (x, y);
            }
        }
        let layout = kernel.layout();
        let (cols, rows) = (layout.cols() as i32, layout.rows() as i32);
        let (cx, cy) = (cols / 2, rows / 2);
        if kernel.is_walkable(cx, cy) {
            return (cx, cy);
        }
        let max_radius = cols.max(rows);
        for radius in 1..=max_radius {
            for (dx, dy) in spiral_ring(radius) {
                let (x, y) = (cx + dx, cy + dy);
                if kernel.is_walkable(x, y) {
                    return (x, y);
                }
            }
        }
        for y in 0..rows {
            for x in 0..cols {
                if kernel.is_walkable(x, y) {
                    return (x, y);
                }
            }
        }
        tracing::error!(target: "room.world", room_id = kernel.room_id(), "no walkable spawn cell found, falling back to (0,0)");
        (0, 0)
    }
}

/// The square ring of cells at Chebyshev distance exactly `radius` from the
/// origin, in no particular rotational order — sufficient for "spiral
/// outward" since spec.md does not mandate a specific traversal order
/// within a ring, only that nearer rings are tried first.
fn spiral_ring(radius: i32) -> Vec<(i32, i32)> {
    let mut out = Vec::new();
    for dx in -radius..=radius {
        out.push((dx, -radius));
        out.push((dx, radius));
    }
    for dy in (-radius + 1)..radius {
        out.push((-radius, dy));
        out.push((radius, dy));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_grid::TileKind;
    use room_persist::MemoryStore;

    fn catalog() -> Arc<FurnitureCatalog> {
        Arc::new(
            FurnitureCatalog::from_toml_str(
                r#"
[[furniture]]
definition_id = "door_simple"
name = "Simple Door"
width = 1
height = 1
is_door = true
sit_facing_dir = 2
target_room_id = "lounge"
target_x = 1
target_y = 4
"#,
            )
            .unwrap(),
        )
    }

    fn open_layout(cols: usize, rows: usize) -> Layout {
        Layout::new(vec![vec![TileKind::Floor; cols]; rows]).unwrap()
    }

    fn emote_catalog() -> Arc<EmoteCatalog> {
        Arc::new(EmoteCatalog::from_toml_str("").unwrap())
    }

    fn shop_catalog() -> Arc<ShopCatalog> {
        Arc::new(ShopCatalog::from_toml_str("").unwrap())
    }

    async fn director() -> WorldDirector {
        let mut d = WorldDirector::new(
            Arc::new(MemoryStore::new()),
            catalog(),
            Arc::new(ColorWhitelist::default()),
            emote_catalog(),
            shop_catalog(),
            1.0,
            20.0,
        );
        d.register_room("main_lobby", open_layout(14, 6)).await.unwrap();
        d.register_room("lounge", open_layout(6, 6)).await.unwrap();
        d
    }

    fn avatar(runtime_id: u64, user_id: &str, session_id: &str) -> Avatar {
        Avatar::new(runtime_id, user_id, "Tester", session_id, "main_lobby", 4.0, "#FFFFFF")
    }

    #[tokio::test]
    async fn registering_a_room_twice_is_idempotent() {
        let mut d = director().await;
        assert_eq!(d.room_count(), 2);
        d.register_room("main_lobby", open_layout(14, 6)).await.unwrap();
        assert_eq!(d.room_count(), 2);
    }

    #[tokio::test]
    async fn binding_a_session_joins_the_room_and_broadcasts_avatar_added() {
        let mut d = director().await;
        let outcome = d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "main_lobby", Some((1, 1))).await.unwrap();
        assert!(outcome.forced_disconnect.is_none());
        assert!(outcome.outs.iter().any(|r| matches!(r, Routed::RoomBroadcast { room_id, event: Event::AvatarAdded(_) } if room_id == "main_lobby")));
        assert_eq!(d.avatar_room(1), Some("main_lobby"));
    }

    #[tokio::test]
    async fn second_bind_for_same_user_force_disconnects_the_first() {
        let mut d = director().await;
        d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "main_lobby", Some((1, 1))).await.unwrap();
        let outcome = d.bind_session("user-1", avatar(2, "user-1", "sess-2"), "main_lobby", Some((2, 1))).await.unwrap();
        let forced = outcome.forced_disconnect.expect("prior session should be forced out");
        assert!(forced.iter().any(|r| matches!(r, Routed::ToSession { session_id, event: Event::ForceDisconnect { .. } } if session_id == "sess-1")));
        assert_eq!(d.avatar_room(2), Some("main_lobby"));
        assert_eq!(d.avatar_room(1), None);
    }

    #[tokio::test]
    async fn scenario_c_portal_removes_from_source_and_adds_to_target() {
        use room_persist::{FurnitureRow, RoomStore};

        let store = Arc::new(MemoryStore::new());
        store
            .insert_furniture(FurnitureRow {
                instance_id: "door-1".to_string(),
                room_id: "main_lobby".to_string(),
                definition_id: "door_simple".to_string(),
                x: 5,
                y: 3,
                z: 0.0,
                rotation: 0,
                owner_user_id: None,
                state: None,
                color_override: None,
            })
            .await
            .unwrap();
        let mut d = WorldDirector::new(store, catalog(), Arc::new(ColorWhitelist::default()), emote_catalog(), shop_catalog(), 1.0, 20.0);
        d.register_room("main_lobby", open_layout(14, 6)).await.unwrap();
        d.register_room("lounge", open_layout(6, 6)).await.unwrap();

        // South-facing door at (5,3) with rotation 0: interaction tile is one
        // step north, (5,2). Spawning the avatar there lets request_sit
        // dispatch the portal immediately, no tick loop needed.
        d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "main_lobby", Some((5, 2))).await.unwrap();

        let (ok, routed) = d
            .dispatch("main_lobby", |kernel| match kernel.request_sit(1, "door-1") {
                Ok(outs) => (true, outs),
                Err(_) => (false, vec![]),
            })
            .await
            .unwrap();
        assert!(ok, "request_sit against the door should succeed");

        assert!(routed.iter().any(|r| matches!(r, Routed::RoomBroadcast { room_id, event: Event::AvatarRemoved { .. } } if room_id == "main_lobby")));
        assert!(routed.iter().any(|r| matches!(r, Routed::RoomBroadcast { room_id, event: Event::AvatarAdded(_) } if room_id == "lounge")));
        assert!(routed.iter().any(|r| matches!(r, Routed::ToSession { session_id, event: Event::RoomState(_) } if session_id == "sess-1")));
        assert_eq!(d.avatar_room(1), Some("lounge"));
    }

    #[tokio::test]
    async fn change_room_to_the_current_room_is_rejected() {
        let mut d = director().await;
        d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "main_lobby", Some((1, 1))).await.unwrap();
        let err = d.change_room(1, "main_lobby", None, None, "sess-1").await.unwrap_err();
        assert!(matches!(err, KernelError::Validation { .. }));
    }

    #[tokio::test]
    async fn change_room_to_an_unknown_room_is_a_state_conflict() {
        let mut d = director().await;
        d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "main_lobby", Some((1, 1))).await.unwrap();
        let err = d.change_room(1, "nowhere", None, None, "sess-1").await.unwrap_err();
        assert!(matches!(err, KernelError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn spawn_selection_falls_back_to_center_when_requested_cell_is_blocked() {
        let mut d = WorldDirector::new(
            Arc::new(MemoryStore::new()),
            catalog(),
            Arc::new(ColorWhitelist::default()),
            emote_catalog(),
            shop_catalog(),
            1.0,
            20.0,
        );
        let mut cells = vec![vec![TileKind::Floor; 5]; 5];
        cells[0][0] = TileKind::Wall;
        d.register_room("room-1", Layout::new(cells).unwrap()).await.unwrap();
        let outcome = d.bind_session("user-1", avatar(1, "user-1", "sess-1"), "room-1", Some((0, 0))).await.unwrap();
        assert!(outcome.outs.iter().any(|r| matches!(r, Routed::RoomBroadcast { event: Event::AvatarAdded(dto), .. } if dto.x == 2.0 && dto.y == 2.0)));
    }
}
