//! Per-avatar state machine: idle/walking/sitting/emoting, the path
//! follower, and deferred-action dispatch on arrival (spec §4.4).
//!
//! This crate knows nothing about furniture definitions or the grid; the
//! kernel resolves seats, portals, and walkability and drives this state
//! machine with plain coordinates and ids. That keeps the one genuinely
//! stateful per-actor machine testable in isolation, the way the teacher
//! keeps `core-state`'s undo engine ignorant of rendering.

use std::collections::VecDeque;

use room_grid::Octant;
use thiserror::Error;

pub type InstanceId = String;
pub type DefinitionId = String;

/// Default standing height, used whenever an avatar is not sitting on
/// something with a `z_offset`.
pub const AVATAR_DEFAULT_Z: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarState {
    Idle,
    Walking,
    Sitting,
    Emoting,
}

/// A task attached to an avatar's active path, executed exactly once on
/// arrival (spec glossary: "Deferred action").
#[derive(Debug, Clone, PartialEq)]
pub enum ActionAfterPath {
    Sit { instance_id: InstanceId },
    Portal {
        target_room_id: String,
        target_x: Option<i32>,
        target_y: Option<i32>,
        session_id: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AvatarError {
    #[error("avatar is sitting and cannot start movement")]
    CannotMoveWhileSitting,
    #[error("avatar is not sitting")]
    NotSitting,
    #[error("avatar is already emoting or sitting")]
    CannotEmoteNow,
}

/// Outcome of advancing a Walking avatar by one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkTick {
    /// Still moving; position/direction may have changed.
    Moving,
    /// Reached the end of the path. Carries the deferred action, if any, for
    /// the kernel to execute (seat/portal resolution lives outside this
    /// crate).
    Arrived { action: Option<ActionAfterPath> },
    /// Nothing to do (not walking, or no path).
    Idle,
}

/// Outcome of advancing an Emoting avatar by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmoteTick {
    StillEmoting,
    /// Expired this tick; avatar fell back to `Walking` (path non-empty) or
    /// `Idle`.
    Expired,
    NotEmoting,
}

#[derive(Debug, Clone)]
pub struct Avatar {
    pub runtime_id: u64,
    pub user_id: String,
    pub name: String,
    pub session_id: String,
    pub room_id: String,

    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub direction: Octant,
    pub state: AvatarState,

    pub sitting_on_instance_id: Option<InstanceId>,
    path: VecDeque<(i32, i32)>,
    action_after_path: Option<ActionAfterPath>,

    pub speed: f64,
    pub currency: i64,
    pub inventory: std::collections::HashMap<DefinitionId, u32>,
    pub body_color: String,

    pub emote_id: Option<String>,
    emote_remaining_secs: f64,
}

impl Avatar {
    pub fn new(runtime_id: u64, user_id: impl Into<String>, name: impl Into<String>, session_id: impl Into<String>, room_id: impl Into<String>, speed: f64, body_color: impl Into<String>) -> Self {
        Self {
            runtime_id,
            user_id: user_id.into(),
            name: name.into(),
            session_id: session_id.into(),
            room_id: room_id.into(),
            x: 0.0,
            y: 0.0,
            z: AVATAR_DEFAULT_Z,
            direction: Octant::South,
            state: AvatarState::Idle,
            sitting_on_instance_id: None,
            path: VecDeque::new(),
            action_after_path: None,
            speed,
            currency: 0,
            inventory: std::collections::HashMap::new(),
            body_color: body_color.into(),
            emote_id: None,
            emote_remaining_secs: 0.0,
        }
    }

    pub fn cell(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn has_path(&self) -> bool {
        !self.path.is_empty()
    }

    /// `Idle/Walking -> Walking`: begin following `waypoints` (already
    /// stripped of the current cell by the caller). If `waypoints` is empty
    /// the deferred action, if any, is returned for the caller to evaluate
    /// immediately instead of being stored (spec §4.4 `MoveTo` semantics for
    /// "target = current cell").
    pub fn start_path(
        &mut self,
        waypoints: Vec<(i32, i32)>,
        action: Option<ActionAfterPath>,
    ) -> Result<Option<ActionAfterPath>, AvatarError> {
        if self.state == AvatarState::Sitting {
            return Err(AvatarError::CannotMoveWhileSitting);
        }
        if self.state == AvatarState::Emoting {
            tracing::trace!(target: "room.avatar", runtime_id = self.runtime_id, "movement cancels active emote");
            self.clear_emote();
        }
        if waypoints.is_empty() {
            return Ok(action);
        }
        self.path = waypoints.into_iter().collect();
        self.action_after_path = action;
        self.state = AvatarState::Walking;
        if let Some(&(nx, ny)) = self.path.front() {
            self.reorient_toward(nx as f64, ny as f64);
        }
        Ok(None)
    }

    fn reorient_toward(&mut self, tx: f64, ty: f64) {
        let dx = tx - self.x;
        let dy = ty - self.y;
        if dx != 0.0 || dy != 0.0 {
            self.direction = Octant::from_heading(dy, dx);
        }
    }

    /// Advance a Walking avatar by `dt` seconds.
    pub fn tick_walk(&mut self, dt: f64) -> WalkTick {
        if self.state != AvatarState::Walking {
            return WalkTick::Idle;
        }
        let Some(&(tx, ty)) = self.path.front() else {
            self.state = AvatarState::Idle;
            return WalkTick::Idle;
        };
        let (tx, ty) = (tx as f64, ty as f64);
        let dx = tx - self.x;
        let dy = ty - self.y;
        let distance = dx.hypot(dy);
        let move_amount = self.speed * dt;

        if distance <= move_amount {
            self.x = tx;
            self.y = ty;
            self.path.pop_front();
            if let Some(&(nx, ny)) = self.path.front() {
                self.reorient_toward(nx as f64, ny as f64);
                WalkTick::Moving
            } else {
                self.state = AvatarState::Idle;
                let action = self.action_after_path.take();
                WalkTick::Arrived { action }
            }
        } else if distance > 0.0 {
            let t = move_amount / distance;
            self.x += dx * t;
            self.y += dy * t;
            self.reorient_toward(tx, ty);
            WalkTick::Moving
        } else {
            WalkTick::Moving
        }
    }

    /// `Idle/Walking -> Sitting` on arrival at a seat's interaction tile.
    pub fn sit(&mut self, instance_id: InstanceId, base_x: i32, base_y: i32, seat_z: f64, sit_height_offset: f64, facing: Octant) {
        self.x = base_x as f64;
        self.y = base_y as f64;
        self.z = seat_z + sit_height_offset;
        self.direction = facing;
        self.path.clear();
        self.action_after_path = None;
        self.sitting_on_instance_id = Some(instance_id);
        self.state = AvatarState::Sitting;
    }

    /// `Sitting -> Idle`. Returns the seat's base cell so the caller can
    /// search for an adjacent walkable cell to relocate to; if the caller
    /// finds none it leaves the avatar's position untouched (spec §4.4).
    pub fn stand(&mut self) -> Result<(i32, i32), AvatarError> {
        if self.state != AvatarState::Sitting {
            return Err(AvatarError::NotSitting);
        }
        let seat_cell = self.cell();
        self.z = AVATAR_DEFAULT_Z;
        self.sitting_on_instance_id = None;
        self.state = AvatarState::Idle;
        Ok(seat_cell)
    }

    pub fn relocate_after_stand(&mut self, x: i32, y: i32) {
        self.x = x as f64;
        self.y = y as f64;
    }

    /// `Idle/Walking -> Emoting`.
    pub fn start_emote(&mut self, emote_id: impl Into<String>, duration_secs: f64) -> Result<(), AvatarError> {
        if matches!(self.state, AvatarState::Sitting | AvatarState::Emoting) {
            return Err(AvatarError::CannotEmoteNow);
        }
        self.emote_id = Some(emote_id.into());
        self.emote_remaining_secs = duration_secs;
        self.state = AvatarState::Emoting;
        Ok(())
    }

    fn clear_emote(&mut self) {
        self.emote_id = None;
        self.emote_remaining_secs = 0.0;
        if self.state == AvatarState::Emoting {
            self.state = if self.has_path() { AvatarState::Walking } else { AvatarState::Idle };
        }
    }

    /// Advance an Emoting avatar's expiry timer by `dt` seconds.
    pub fn tick_emote(&mut self, dt: f64) -> EmoteTick {
        if self.state != AvatarState::Emoting {
            return EmoteTick::NotEmoting;
        }
        self.emote_remaining_secs -= dt;
        if self.emote_remaining_secs <= 0.0 {
            self.clear_emote();
            EmoteTick::Expired
        } else {
            EmoteTick::StillEmoting
        }
    }

    /// `any -> (removed from room)`: reset transient state for a room
    /// change and move the avatar to its arrival cell in the new room.
    pub fn prepare_room_change(&mut self, target_room_id: impl Into<String>, arrival_x: i32, arrival_y: i32) {
        self.emote_id = None;
        self.emote_remaining_secs = 0.0;
        self.path.clear();
        self.action_after_path = None;
        self.sitting_on_instance_id = None;
        self.z = AVATAR_DEFAULT_Z;
        self.x = arrival_x as f64;
        self.y = arrival_y as f64;
        self.room_id = target_room_id.into();
        self.state = AvatarState::Idle;
    }

    /// Session disconnect cancels all pending deferred actions (spec §5).
    pub fn cancel_pending_actions(&mut self) {
        self.action_after_path = None;
        self.path.clear();
        if self.state == AvatarState::Walking {
            self.state = AvatarState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avatar() -> Avatar {
        Avatar::new(1, "user-1", "Tester", "sess-1", "room-1", 4.0, "#FFFFFF")
    }

    #[test]
    fn start_path_sets_walking_and_orients_toward_first_waypoint() {
        let mut a = avatar();
        a.start_path(vec![(2, 1), (3, 1)], None).unwrap();
        assert_eq!(a.state, AvatarState::Walking);
        assert_eq!(a.direction, Octant::East);
    }

    #[test]
    fn cannot_start_movement_while_sitting() {
        let mut a = avatar();
        a.sit("chair-1".into(), 3, 3, 0.0, 0.4, Octant::South);
        let err = a.start_path(vec![(0, 0)], None).unwrap_err();
        assert_eq!(err, AvatarError::CannotMoveWhileSitting);
    }

    #[test]
    fn moving_while_emoting_cancels_the_emote() {
        let mut a = avatar();
        a.start_emote("wave", 5.0).unwrap();
        a.start_path(vec![(1, 0)], None).unwrap();
        assert_eq!(a.state, AvatarState::Walking);
        assert!(a.emote_id.is_none());
    }

    #[test]
    fn move_to_current_cell_with_no_path_returns_action_for_immediate_eval() {
        let mut a = avatar();
        let action = ActionAfterPath::Sit { instance_id: "chair-1".into() };
        let immediate = a.start_path(vec![], Some(action.clone())).unwrap();
        assert_eq!(immediate, Some(action));
        assert_eq!(a.state, AvatarState::Idle);
    }

    #[test]
    fn walking_scenario_a_reaches_interaction_tile_after_one_second() {
        // 6x6 room, avatar at (1,1), chair interaction tile (3,2), speed 4 tiles/s.
        let mut a = avatar();
        a.x = 1.0;
        a.y = 1.0;
        a.start_path(
            vec![(2, 1), (3, 1), (3, 2)],
            Some(ActionAfterPath::Sit { instance_id: "chair-1".into() }),
        )
        .unwrap();

        // Advance in 100ms increments for 1 second; 4 tiles/s * 1s = 4 tiles of
        // travel, more than the 3-tile path, so arrival should occur.
        let mut arrived_action = None;
        for _ in 0..10 {
            match a.tick_walk(0.1) {
                WalkTick::Arrived { action } => {
                    arrived_action = Some(action);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(a.cell(), (3, 2));
        assert_eq!(
            arrived_action,
            Some(Some(ActionAfterPath::Sit { instance_id: "chair-1".into() }))
        );
    }

    #[test]
    fn sitting_sets_z_from_seat_plus_offset_and_clears_path() {
        let mut a = avatar();
        a.sit("chair-1".into(), 3, 3, 1.0, 0.4, Octant::South);
        assert_eq!(a.state, AvatarState::Sitting);
        assert_eq!(a.z, 1.4);
        assert!(!a.has_path());
        assert_eq!(a.sitting_on_instance_id.as_deref(), Some("chair-1"));
    }

    #[test]
    fn standing_resets_z_and_sitting_reference() {
        let mut a = avatar();
        a.sit("chair-1".into(), 3, 3, 1.0, 0.4, Octant::South);
        let seat_cell = a.stand().unwrap();
        assert_eq!(seat_cell, (3, 3));
        assert_eq!(a.z, AVATAR_DEFAULT_Z);
        assert!(a.sitting_on_instance_id.is_none());
        assert_eq!(a.state, AvatarState::Idle);
    }

    #[test]
    fn standing_when_not_sitting_fails() {
        let mut a = avatar();
        assert_eq!(a.stand().unwrap_err(), AvatarError::NotSitting);
    }

    #[test]
    fn emote_expires_to_idle_when_no_path_and_to_walking_otherwise() {
        let mut a = avatar();
        a.start_emote("wave", 1.0).unwrap();
        assert_eq!(a.tick_emote(0.5), EmoteTick::StillEmoting);
        assert_eq!(a.tick_emote(0.6), EmoteTick::Expired);
        assert_eq!(a.state, AvatarState::Idle);
    }

    #[test]
    fn room_change_clears_transient_state_and_relocates() {
        let mut a = avatar();
        a.start_emote("wave", 5.0).unwrap();
        a.prepare_room_change("lounge", 1, 4);
        assert_eq!(a.room_id, "lounge");
        assert_eq!(a.cell(), (1, 4));
        assert!(a.emote_id.is_none());
        assert_eq!(a.z, AVATAR_DEFAULT_Z);
        assert_eq!(a.state, AvatarState::Idle);
    }
}
