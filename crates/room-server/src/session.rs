//! Per-connection handling: the handshake, the read loop that decodes
//! `Intent`s and dispatches them into the shared [`WorldDirector`], and the
//! write loop that drains this session's hub-assigned outbox to the socket.
//!
//! spec.md scopes credential verification out as a thin external
//! collaborator, so the wire protocol here is deliberately minimal: the
//! first line a client sends is a small `{"user_id": "..."}` object (not an
//! `Intent` — there is no avatar, let alone a room, to address one to yet)
//! used only to bootstrap the session. Every line after that is a JSON
//! `Intent`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use room_avatar::Avatar;
use room_catalog::EmoteCatalog;
use room_config::Config;
use room_events::{normalize_chat_text, ActionFailedKind, Event, Intent, UserListEntryDto};
use room_kernel::{KernelError, Outbound};
use room_persist::{UserRow, UserRowPatch};
use room_world::{Routed, RuntimeId, WorldDirector};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command_parser::{CommandParser, ParsedCommand};
use crate::hub::{SessionHub, SESSION_OUTBOX_CAP};

#[derive(serde::Deserialize)]
struct Handshake {
    user_id: String,
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

fn next_runtime_id() -> RuntimeId {
    NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed)
}

fn kernel_error_event(err: &KernelError) -> Event {
    Event::ActionFailed { kind: err.action_failed_kind(), reason: err.reason().to_string() }
}

fn to_session(session_id: &str, event: Event) -> Routed {
    Routed::ToSession { session_id: session_id.to_string(), event }
}

/// Folds a kernel op's `Result<Vec<Outbound>, KernelError>` into a plain
/// `Vec<Outbound>`, turning a validation/state-conflict error into a
/// single session-addressed `ActionFailed` instead of dropping it —
/// `WorldDirector::dispatch`/`dispatch_async` only know how to route
/// outbounds, not results.
fn fold_result(session_id: &str, result: Result<Vec<Outbound>, KernelError>) -> ((), Vec<Outbound>) {
    match result {
        Ok(outs) => ((), outs),
        Err(e) => ((), vec![Outbound::ToSession(session_id.to_string(), kernel_error_event(&e))]),
    }
}

pub async fn handle_connection(socket: TcpStream, world: Arc<Mutex<WorldDirector>>, hub: Arc<SessionHub>, config: Arc<Config>) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let handshake_line = lines.next_line().await?.ok_or_else(|| anyhow!("connection closed before handshake"))?;
    let handshake: Handshake = serde_json::from_str(&handshake_line).context("malformed handshake")?;
    let user_id = handshake.user_id;

    let runtime_id = next_runtime_id();
    let session_id = Uuid::new_v4().to_string();
    info!(target: "room.server.session", user_id = %user_id, runtime_id, session_id = %session_id, "handshake complete");

    let (store, emote_catalog) = {
        let guard = world.lock().await;
        (guard.store(), guard.emote_catalog())
    };
    let user_row = match store.load_user(&user_id).await? {
        Some(row) => row,
        None => {
            let row = UserRow {
                user_id: user_id.clone(),
                username: user_id.clone(),
                password_hash: String::new(),
                is_admin: false,
                currency: 0,
                inventory: Default::default(),
                body_color: "#FFFFFF".to_string(),
                last_room_id: None,
                last_x: None,
                last_y: None,
                last_z: None,
            };
            store.upsert_user(row.clone()).await?;
            row
        }
    };

    let target_room_id = user_row.last_room_id.clone().unwrap_or_else(|| config.file.default_room_id.clone());
    let requested_cell = match (user_row.last_x, user_row.last_y) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    };

    let mut avatar = Avatar::new(
        runtime_id,
        user_id.clone(),
        user_row.username.clone(),
        session_id.clone(),
        target_room_id.clone(),
        config.file.avatar_speed,
        user_row.body_color.clone(),
    );
    avatar.currency = user_row.currency;
    avatar.inventory = user_row.inventory.clone();

    let (tx, mut rx) = mpsc::channel::<Event>(SESSION_OUTBOX_CAP);

    let bind = {
        let mut guard = world.lock().await;
        guard.bind_session(&user_id, avatar, &target_room_id, requested_cell).await
    };
    let bind = match bind {
        Ok(bind) => bind,
        Err(e) => {
            let _ = write_half.write_all(format!("{}\n", serde_json::to_string(&kernel_error_event(&e))?).as_bytes()).await;
            return Ok(());
        }
    };

    hub.register(session_id.clone(), runtime_id, tx).await;
    hub.deliver(bind.outs).await;
    if let Some(forced) = bind.forced_disconnect {
        hub.deliver(forced).await;
    }
    hub.deliver(vec![to_session(&session_id, Event::YourAvatarId { runtime_id })]).await;

    let write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&event) else { continue };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let intent: Intent = match serde_json::from_str(&line) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(target: "room.server.session", session_id = %session_id, error = %e, "malformed intent, ignoring");
                continue;
            }
        };
        dispatch_intent(&world, &hub, runtime_id, &session_id, intent, &emote_catalog).await;
    }

    // Connection closed: persist final state, leave the room, drop from the hub.
    let unbind = {
        let mut guard = world.lock().await;
        guard.unbind_session(runtime_id).await
    };
    if let Some((avatar, routed)) = unbind {
        hub.deliver(routed).await;
        let patch = UserRowPatch {
            currency: Some(avatar.currency),
            inventory: Some(avatar.inventory.clone()),
            body_color: Some(avatar.body_color.clone()),
            last_room_id: Some(Some(avatar.room_id.clone())),
            last_x: Some(Some(avatar.cell().0)),
            last_y: Some(Some(avatar.cell().1)),
            last_z: Some(Some(avatar.z)),
        };
        if let Err(e) = store.update_user(&user_id, patch).await {
            warn!(target: "room.server.session", user_id = %user_id, error = %e, "failed to persist user state on disconnect");
        }
    }
    hub.unregister(&session_id, runtime_id).await;
    write_task.abort();
    info!(target: "room.server.session", session_id = %session_id, "session ended");
    Ok(())
}

async fn dispatch_intent(world: &Arc<Mutex<WorldDirector>>, hub: &Arc<SessionHub>, runtime_id: RuntimeId, session_id: &str, intent: Intent, emote_catalog: &EmoteCatalog) {
    let room_id = {
        let guard = world.lock().await;
        guard.avatar_room(runtime_id).map(str::to_string)
    };
    let Some(room_id) = room_id else {
        return;
    };

    match intent {
        Intent::Ping => {
            hub.deliver(vec![to_session(session_id, Event::Pong)]).await;
        }
        Intent::Move { target_x, target_y } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| fold_result(session_id, k.request_move(runtime_id, (target_x, target_y)))).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::SendChat { text } => {
            handle_chat(world, hub, runtime_id, session_id, &room_id, text, emote_catalog).await;
        }
        Intent::PlaceFurni { definition_id, x, y, rotation } => {
            let mut guard = world.lock().await;
            let outcome = guard
                .dispatch_async(&room_id, move |k| Box::pin(async move { fold_result(session_id, k.request_place(runtime_id, &definition_id, (x, y), rotation).await) }))
                .await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::PickupFurni { instance_id } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch_async(&room_id, move |k| Box::pin(async move { fold_result(session_id, k.request_pickup(runtime_id, &instance_id).await) })).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::RotateFurni { instance_id } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch_async(&room_id, move |k| Box::pin(async move { fold_result(session_id, k.request_rotate(runtime_id, &instance_id).await) })).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::Sit { instance_id } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| fold_result(session_id, k.request_sit(runtime_id, &instance_id))).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::Stand => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| fold_result(session_id, k.request_stand(runtime_id))).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::UseFurni { instance_id } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch_async(&room_id, move |k| Box::pin(async move { fold_result(session_id, k.request_use(runtime_id, &instance_id).await) })).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::RecolorFurni { instance_id, hex } => {
            let mut guard = world.lock().await;
            let outcome = guard
                .dispatch_async(&room_id, move |k| Box::pin(async move { fold_result(session_id, k.request_recolor(runtime_id, &instance_id, hex).await) }))
                .await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::BuyItem { item_id } => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| fold_result(session_id, k.request_buy(runtime_id, &item_id))).await;
            drop(guard);
            deliver_outcome(hub, outcome).await;
        }
        Intent::ChangeRoom { target_room_id } => {
            let mut guard = world.lock().await;
            let result = guard.change_room(runtime_id, &target_room_id, None, None, session_id).await;
            drop(guard);
            match result {
                Ok(routed) => hub.deliver(routed).await,
                Err(e) => hub.deliver(vec![to_session(session_id, kernel_error_event(&e))]).await,
            }
        }
        Intent::RequestProfile { runtime_id: target } => {
            let target = target.unwrap_or(runtime_id);
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| (k.profile_dto(target), Vec::new())).await;
            drop(guard);
            if let Some((Some(dto), _)) = outcome {
                hub.deliver(vec![to_session(session_id, Event::AvatarAdded(dto))]).await;
            }
        }
        Intent::RequestUserList => {
            let mut guard = world.lock().await;
            let outcome = guard.dispatch(&room_id, |k| (k.state_snapshot(), Vec::new())).await;
            drop(guard);
            if let Some((snapshot, _)) = outcome {
                let users = snapshot.avatars.into_iter().map(|a| UserListEntryDto { runtime_id: a.runtime_id, name: a.name }).collect();
                hub.deliver(vec![to_session(session_id, Event::UserListUpdate { users })]).await;
            }
        }
    }
}

/// Chat text starting with `/` is a command, not a broadcast (spec §4.7
/// supplement). Everything else is trimmed/capped and, if non-empty,
/// broadcast as `Chat`.
async fn handle_chat(
    world: &Arc<Mutex<WorldDirector>>,
    hub: &Arc<SessionHub>,
    runtime_id: RuntimeId,
    session_id: &str,
    room_id: &str,
    text: String,
    emote_catalog: &EmoteCatalog,
) {
    if text.trim_start().starts_with('/') {
        match CommandParser::parse(&text, emote_catalog) {
            ParsedCommand::Emote { alias } => {
                let mut guard = world.lock().await;
                let outcome = guard.dispatch(room_id, |k| fold_result(session_id, k.request_emote(runtime_id, &alias))).await;
                drop(guard);
                deliver_outcome(hub, outcome).await;
            }
            ParsedCommand::SetColor { .. } => {
                // Recoloring an avatar's body has no kernel operation
                // today (RecolorFurni targets furniture only); surface
                // that plainly rather than silently misrouting it.
                hub.deliver(vec![to_session(session_id, Event::ActionFailed { kind: ActionFailedKind::Validation, reason: "avatar recoloring is not yet supported".to_string() })])
                    .await;
            }
            ParsedCommand::Join { room_id: target } => {
                let mut guard = world.lock().await;
                let result = guard.change_room(runtime_id, &target, None, None, session_id).await;
                drop(guard);
                match result {
                    Ok(routed) => hub.deliver(routed).await,
                    Err(e) => hub.deliver(vec![to_session(session_id, kernel_error_event(&e))]).await,
                }
            }
            ParsedCommand::Unknown(_) => {
                hub.deliver(vec![to_session(session_id, Event::ActionFailed { kind: ActionFailedKind::Validation, reason: "unknown command".to_string() })]).await;
            }
        }
        return;
    }
    if let Some(normalized) = normalize_chat_text(&text) {
        hub.deliver(vec![Routed::RoomBroadcast { room_id: room_id.to_string(), event: Event::Chat { runtime_id, text: normalized } }]).await;
    }
}

async fn deliver_outcome(hub: &Arc<SessionHub>, outcome: Option<((), Vec<Routed>)>) {
    if let Some((_, routed)) = outcome {
        hub.deliver(routed).await;
    }
}
