//! Wire types for event ingress/egress (spec §4.7/§6): the typed `Intent`s
//! a session decodes from a client, the typed `Event`s a kernel emits back,
//! and the generic async-source plumbing `room-server`'s world-tick driver
//! runs on.
//!
//! The channel/source plumbing below generalizes `core-events`'s
//! `AsyncEventSource`/`EventSourceRegistry`/`TickEventSource` trio to an
//! arbitrary event type. `room-server` currently uses it for exactly one
//! channel (the fixed-rate tick that drives `WorldDirector::tick_all`); it
//! stays generic over `E` rather than hardcoded to that one case because
//! it costs nothing to keep it reusable for a future bounded-channel
//! producer, the way the teacher's version only ever had one caller too.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

/// Chat messages longer than this are rejected before reaching the kernel
/// (spec §4.7).
pub const CHAT_MAX_LEN: usize = 100;

/// Implemented by any async producer that pushes events of type `E` into a
/// bounded channel. Mirrors `core-events::AsyncEventSource`; generalized
/// over the event type so any bounded-channel producer (today: the world
/// tick) can reuse it instead of hand-rolling its own spawn loop.
pub trait AsyncEventSource<E: Send + 'static>: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, tx: Sender<E>) -> JoinHandle<()>;
}

/// Registry of async sources for one channel. Spawns each registered
/// source exactly once, handing it its own `Sender` clone.
#[derive(Default)]
pub struct EventSourceRegistry<E: Send + 'static> {
    sources: Vec<Box<dyn AsyncEventSource<E>>>,
}

impl<E: Send + 'static> EventSourceRegistry<E> {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    pub fn register<S: AsyncEventSource<E>>(&mut self, src: S) {
        self.sources.push(Box::new(src));
    }

    /// Spawn every registered source, returning their handles. Drop the
    /// caller's own `Sender` before awaiting these handles during shutdown
    /// so each source observes the closed channel and exits.
    pub fn spawn_all(&mut self, tx: &Sender<E>) -> Vec<JoinHandle<()>> {
        let mut out = Vec::with_capacity(self.sources.len());
        for src in self.sources.drain(..) {
            let name = src.name();
            tracing::info!(target: "room.events", source = name, "spawning event source");
            out.push(src.spawn(tx.clone()));
        }
        out
    }
}

/// Monotonic tick source: emits `make_event()` on every `interval` elapsed,
/// stopping as soon as the channel closes. The event value itself is
/// supplied by a closure so this stays reusable across distinct event enums
/// (room commands vs. session-facing `Event`s).
pub struct TickEventSource<E> {
    interval: Duration,
    make_event: Box<dyn Fn() -> E + Send>,
}

impl<E> TickEventSource<E> {
    pub fn new(interval: Duration, make_event: impl Fn() -> E + Send + 'static) -> Self {
        Self {
            interval,
            make_event: Box::new(make_event),
        }
    }
}

impl<E: Send + 'static> AsyncEventSource<E> for TickEventSource<E> {
    fn name(&self) -> &'static str {
        "tick"
    }

    fn spawn(self: Box<Self>, tx: Sender<E>) -> JoinHandle<()> {
        let dur = self.interval;
        let make_event = self.make_event;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dur);
            loop {
                interval.tick().await;
                if tx.send(make_event()).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Typed intents decoded from a client session (spec §4.7/§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Move { target_x: i32, target_y: i32 },
    SendChat { text: String },
    PlaceFurni { definition_id: String, x: i32, y: i32, rotation: u8 },
    PickupFurni { instance_id: String },
    RotateFurni { instance_id: String },
    Sit { instance_id: String },
    Stand,
    UseFurni { instance_id: String },
    RecolorFurni { instance_id: String, hex: Option<String> },
    BuyItem { item_id: String },
    ChangeRoom { target_room_id: String },
    RequestProfile { runtime_id: Option<u64> },
    RequestUserList,
    /// Ambient heartbeat (SPEC_FULL §4.7 supplement).
    Ping,
}

/// Failure kind carried by `ActionFailed`, mirroring `room-kernel`'s
/// `KernelError` taxonomy (minus `Protocol`, which never reaches the kernel
/// in the first place, and `Internal`, which is logged but generalized to
/// `internal` on the wire so clients don't depend on server internals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailedKind {
    Validation,
    StateConflict,
    Persistence,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FurniDto {
    pub instance_id: String,
    pub definition_id: String,
    pub x: i32,
    pub y: i32,
    pub z: f64,
    pub rotation: u8,
    pub owner_user_id: Option<String>,
    pub state: Option<String>,
    pub color_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarDto {
    pub runtime_id: u64,
    pub user_id: String,
    pub name: String,
    pub room_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub direction: u8,
    pub state: String,
    pub sitting_on_instance_id: Option<String>,
    pub body_color: String,
    pub emote_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStateDto {
    pub room_id: String,
    pub layout: room_grid::Layout,
    pub furniture: Vec<FurniDto>,
    pub avatars: Vec<AvatarDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserListEntryDto {
    pub runtime_id: u64,
    pub name: String,
}

/// A sparse per-tick avatar delta: only the fields that actually changed
/// this tick are `Some` (spec §4.5: "emits AvatarUpdate DTOs only for
/// avatars whose position/direction/state actually changed").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarUpdateDto {
    pub runtime_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub direction: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sitting_on_instance_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub emote_id: Option<Option<String>>,
}

impl AvatarUpdateDto {
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.z.is_none()
            && self.direction.is_none()
            && self.state.is_none()
            && self.sitting_on_instance_id.is_none()
            && self.emote_id.is_none()
    }
}

/// A sparse furniture delta, only the fields changed by `RequestUse`/
/// `RequestRotate`/`RequestRecolor` (spec §4.5: "emits FurniUpdated with
/// changed fields only").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FurniUpdatedDto {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rotation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color_override: Option<Option<String>>,
}

/// Typed events encoded back to a client session (spec §4.7/§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RoomState(RoomStateDto),
    YourAvatarId { runtime_id: u64 },
    InventoryUpdate { inventory: HashMap<String, u32> },
    CurrencyUpdate { currency: i64 },
    AvatarAdded(AvatarDto),
    AvatarRemoved { runtime_id: u64 },
    AvatarUpdate(AvatarUpdateDto),
    FurniAdded(FurniDto),
    FurniRemoved { instance_id: String },
    FurniUpdated(FurniUpdatedDto),
    Chat { runtime_id: u64, text: String },
    UserListUpdate { users: Vec<UserListEntryDto> },
    ActionFailed { kind: ActionFailedKind, reason: String },
    ForceDisconnect { reason: String },
    /// Ambient heartbeat reply (SPEC_FULL §4.7 supplement).
    Pong,
}

/// Trims and length-caps raw chat text per spec §4.7. Returns `None` if the
/// trimmed text is empty.
pub fn normalize_chat_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(CHAT_MAX_LEN).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Once,
        Tick,
    }

    struct OnceSource {
        flag: Arc<AtomicBool>,
    }

    impl AsyncEventSource<TestEvent> for OnceSource {
        fn name(&self) -> &'static str {
            "once"
        }
        fn spawn(self: Box<Self>, tx: Sender<TestEvent>) -> JoinHandle<()> {
            tokio::spawn(async move {
                let _ = tx.send(TestEvent::Once).await;
                self.flag.store(true, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn registry_spawns_sources_and_they_emit() {
        let (tx, mut rx) = mpsc::channel(8);
        let flag = Arc::new(AtomicBool::new(false));
        let mut reg: EventSourceRegistry<TestEvent> = EventSourceRegistry::new();
        reg.register(OnceSource { flag: flag.clone() });
        reg.register(TickEventSource::new(Duration::from_millis(5), || TestEvent::Tick));
        let handles = reg.spawn_all(&tx);

        let mut got_once = false;
        let mut got_tick = false;
        for _ in 0..20 {
            if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
                match ev {
                    TestEvent::Once => got_once = true,
                    TestEvent::Tick => got_tick = true,
                }
            }
            if got_once && got_tick {
                break;
            }
        }
        assert!(got_once && got_tick);
        assert!(flag.load(Ordering::SeqCst));

        drop(tx);
        drop(rx);
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_millis(50), h).await;
        }
    }

    #[test]
    fn intent_move_round_trips_through_json() {
        let intent = Intent::Move { target_x: 3, target_y: 4 };
        let json = serde_json::to_string(&intent).unwrap();
        let back: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(intent, back);
    }

    #[test]
    fn avatar_update_skips_unset_fields_on_the_wire() {
        let delta = AvatarUpdateDto {
            runtime_id: 7,
            x: Some(1.0),
            ..Default::default()
        };
        let json = serde_json::to_string(&delta).unwrap();
        assert!(json.contains("\"x\":1.0"));
        assert!(!json.contains("\"y\""));
    }

    #[test]
    fn chat_text_is_trimmed_and_capped() {
        assert_eq!(normalize_chat_text("  hi  ").as_deref(), Some("hi"));
        assert_eq!(normalize_chat_text("   "), None);
        let long = "x".repeat(200);
        assert_eq!(normalize_chat_text(&long).unwrap().len(), CHAT_MAX_LEN);
    }

    #[test]
    fn action_failed_serializes_with_snake_case_kind() {
        let ev = Event::ActionFailed {
            kind: ActionFailedKind::StateConflict,
            reason: "seat occupied".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"state_conflict\""));
    }
}
