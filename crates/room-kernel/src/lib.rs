//! The Room Kernel (spec §4.5): owns one room's furniture registry and
//! resident avatars, validates every request against §4.1–§4.4, and
//! produces the outbound deltas the ingress/egress layer broadcasts.
//!
//! Every public operation here is non-suspending except where it must call
//! into the Persistence Facade (`RequestPlace`/`RequestPickup`/
//! `RequestRotate`/`RequestUse`/`RequestRecolor`), matching spec §5's
//! suspension-point rule: a mutation's persistent write is awaited before
//! the in-memory state changes in a way visible to later requests.

use std::collections::HashMap;
use std::sync::Arc;

use room_avatar::{ActionAfterPath, Avatar, AvatarState, WalkTick};
use room_catalog::{ColorWhitelist, EmoteCatalog, FurnitureCatalog, ShopCatalog};
use room_events::{
    ActionFailedKind, AvatarDto, AvatarUpdateDto, Event, FurniDto, FurniUpdatedDto, RoomStateDto,
    UserListEntryDto,
};
use room_furniture::{FurnitureInstance, FurnitureRegistry};
use room_grid::{Layout, Octant};
use room_persist::{FurnitureRow, FurnitureRowPatch, RoomStore};
use thiserror::Error;

pub type RuntimeId = u64;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("state conflict: {reason}")]
    StateConflict { reason: String },
    #[error("persistence failure: {reason}")]
    Persistence { reason: String },
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl KernelError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }
    pub fn state_conflict(reason: impl Into<String>) -> Self {
        Self::StateConflict { reason: reason.into() }
    }
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence { reason: reason.into() }
    }
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal { reason: reason.into() }
    }

    /// Maps this error onto the wire-facing `ActionFailed` kind (spec §7).
    pub fn action_failed_kind(&self) -> ActionFailedKind {
        match self {
            Self::Validation { .. } => ActionFailedKind::Validation,
            Self::StateConflict { .. } => ActionFailedKind::StateConflict,
            Self::Persistence { .. } => ActionFailedKind::Persistence,
            Self::Internal { .. } => ActionFailedKind::Internal,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Validation { reason }
            | Self::StateConflict { reason }
            | Self::Persistence { reason }
            | Self::Internal { reason } => reason,
        }
    }
}

/// Narrow view the kernel needs of the World Director: whether a named
/// room exists, used only to validate a door's target at request time
/// (spec §8 boundary: "door interaction with a missing target room fails
/// with StateConflict"). Kept as a trait so this crate never depends on
/// `room-world`.
pub trait RoomDirectory: Send + Sync {
    fn room_exists(&self, room_id: &str) -> bool;
}

/// A kernel output: either broadcast to every current observer of this
/// room, addressed to one session, or a request the World Director must
/// act on (a portal arrival is not resolved locally; spec §4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast(Event),
    ToSession(String, Event),
    PortalRequest {
        runtime_id: RuntimeId,
        target_room_id: String,
        target_x: Option<i32>,
        target_y: Option<i32>,
        session_id: String,
    },
}

struct KernelWalkable<'a> {
    furniture: &'a FurnitureRegistry,
    catalog: &'a FurnitureCatalog,
}

impl room_pathfind::Walkable for KernelWalkable<'_> {
    fn is_walkable(&self, x: i32, y: i32) -> bool {
        self.furniture.is_walkable(self.catalog, x, y)
    }
}

pub struct RoomKernel {
    room_id: String,
    furniture: FurnitureRegistry,
    avatars: HashMap<RuntimeId, Avatar>,
    catalog: Arc<FurnitureCatalog>,
    recolor_whitelist: Arc<ColorWhitelist>,
    emote_catalog: Arc<EmoteCatalog>,
    shop_catalog: Arc<ShopCatalog>,
    store: Arc<dyn RoomStore>,
    directory: Arc<dyn RoomDirectory>,
}

impl RoomKernel {
    pub fn new(
        room_id: impl Into<String>,
        layout: Layout,
        catalog: Arc<FurnitureCatalog>,
        recolor_whitelist: Arc<ColorWhitelist>,
        emote_catalog: Arc<EmoteCatalog>,
        shop_catalog: Arc<ShopCatalog>,
        store: Arc<dyn RoomStore>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        Self::with_stack_params(
            room_id,
            layout,
            room_furniture::DEFAULT_STACK_FACTOR,
            room_furniture::MAX_STACK_Z,
            catalog,
            recolor_whitelist,
            emote_catalog,
            shop_catalog,
            store,
            directory,
        )
    }

    /// Like [`RoomKernel::new`], but with the stack-height parameters the
    /// configuration surface (spec §6: `maxStackZ`, `defaultStackFactor`)
    /// names explicitly, rather than this crate's compiled-in defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn with_stack_params(
        room_id: impl Into<String>,
        layout: Layout,
        stack_factor: f64,
        max_stack_z: f64,
        catalog: Arc<FurnitureCatalog>,
        recolor_whitelist: Arc<ColorWhitelist>,
        emote_catalog: Arc<EmoteCatalog>,
        shop_catalog: Arc<ShopCatalog>,
        store: Arc<dyn RoomStore>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            furniture: FurnitureRegistry::with_stack_params(layout, stack_factor, max_stack_z),
            avatars: HashMap::new(),
            catalog,
            recolor_whitelist,
            emote_catalog,
            shop_catalog,
            store,
            directory,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn avatar(&self, runtime_id: RuntimeId) -> Option<&Avatar> {
        self.avatars.get(&runtime_id)
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    pub fn furniture_count(&self) -> usize {
        self.furniture.len()
    }

    pub fn is_walkable(&self, x: i32, y: i32) -> bool {
        self.furniture.is_walkable(&self.catalog, x, y)
    }

    pub fn layout(&self) -> &Layout {
        self.furniture.layout()
    }

    /// Hydrate the furniture registry from the store at room startup.
    pub async fn load_furniture_from_store(&mut self) -> Result<(), KernelError> {
        let rows = self
            .store
            .load_furniture(&self.room_id)
            .await
            .map_err(|e| KernelError::persistence(e.to_string()))?;
        for row in rows {
            self.furniture.insert(FurnitureInstance {
                instance_id: row.instance_id,
                definition_id: row.definition_id,
                x: row.x,
                y: row.y,
                z: row.z,
                rotation: row.rotation,
                owner_user_id: row.owner_user_id,
                state: row.state,
                color_override: row.color_override,
            });
        }
        Ok(())
    }

    fn is_occupied(&self, instance_id: &str) -> bool {
        self.avatars.values().any(|a| a.sitting_on_instance_id.as_deref() == Some(instance_id))
    }

    fn user_list(&self) -> Vec<UserListEntryDto> {
        self.avatars
            .values()
            .map(|a| UserListEntryDto { runtime_id: a.runtime_id, name: a.name.clone() })
            .collect()
    }

    fn walkable(&self) -> KernelWalkable<'_> {
        KernelWalkable { furniture: &self.furniture, catalog: &self.catalog }
    }

    /// `Join(avatar, atCell?) → Ok`.
    pub fn join(&mut self, mut avatar: Avatar, at_cell: Option<(i32, i32)>) -> Vec<Outbound> {
        if let Some((x, y)) = at_cell {
            avatar.x = x as f64;
            avatar.y = y as f64;
        }
        avatar.room_id = self.room_id.clone();
        let dto = avatar_dto(&avatar);
        self.avatars.insert(avatar.runtime_id, avatar);
        vec![
            Outbound::Broadcast(Event::AvatarAdded(dto)),
            Outbound::Broadcast(Event::UserListUpdate { users: self.user_list() }),
        ]
    }

    /// `Leave(runtimeId) → removedAvatar?`.
    pub fn leave(&mut self, runtime_id: RuntimeId) -> (Option<Avatar>, Vec<Outbound>) {
        let Some(removed) = self.avatars.remove(&runtime_id) else {
            return (None, vec![]);
        };
        let outs = vec![
            Outbound::Broadcast(Event::AvatarRemoved { runtime_id }),
            Outbound::Broadcast(Event::UserListUpdate { users: self.user_list() }),
        ];
        (Some(removed), outs)
    }

    /// `RequestMove(runtimeId, (x,y))`.
    pub fn request_move(&mut self, runtime_id: RuntimeId, target: (i32, i32)) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        if avatar.state == AvatarState::Sitting {
            return Err(KernelError::validation("cannot move while sitting"));
        }
        if !self.is_walkable(target.0, target.1) {
            return Err(KernelError::validation("target cell is not walkable"));
        }
        let current = avatar.cell();
        if current == target {
            return Ok(vec![]);
        }
        let (cols, rows) = (self.furniture.layout().cols(), self.furniture.layout().rows());
        let path = room_pathfind::find_path(
            &self.walkable(),
            room_pathfind::Cell::new(current.0, current.1),
            room_pathfind::Cell::new(target.0, target.1),
            cols,
            rows,
        )
        .ok_or_else(|| KernelError::validation("no path to target"))?;
        let waypoints: Vec<(i32, i32)> = path.into_iter().skip(1).map(|c| (c.x, c.y)).collect();
        let avatar = self.avatars.get_mut(&runtime_id).expect("checked above");
        avatar.start_path(waypoints, None).map_err(|e| KernelError::validation(e.to_string()))?;
        Ok(vec![Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
            runtime_id,
            direction: Some(avatar.direction.index()),
            state: Some("walking".to_string()),
            ..Default::default()
        }))])
    }

    /// Shared seat-arrival logic used both by `RequestSit`'s immediate path
    /// and by `Tick`'s deferred-action dispatch (spec §4.4).
    fn try_sit(&mut self, runtime_id: RuntimeId, instance_id: &str) -> Result<Vec<Outbound>, KernelError> {
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::state_conflict("seat no longer exists"))?;
        let def = self
            .catalog
            .get(&inst.definition_id)
            .ok_or_else(|| KernelError::internal("unknown furniture definition"))?;
        if !def.can_sit {
            return Err(KernelError::validation("instance is not sittable"));
        }
        if self.is_occupied(instance_id) {
            return Err(KernelError::state_conflict("seat is occupied"));
        }
        let facing = Octant::from_index(def.sit_facing_dir).rotate(inst.rotation);
        let sit_height_offset = def.sit_height_offset;
        let avatar = self.avatars.get_mut(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        avatar.sit(instance_id.to_string(), inst.x, inst.y, inst.z, sit_height_offset, facing);
        Ok(vec![Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
            runtime_id,
            x: Some(avatar.x),
            y: Some(avatar.y),
            z: Some(avatar.z),
            direction: Some(avatar.direction.index()),
            state: Some("sitting".to_string()),
            sitting_on_instance_id: Some(Some(instance_id.to_string())),
        }))])
    }

    /// `RequestSit(runtimeId, instanceId)`. Also handles door interaction:
    /// a door is walked to the same way a seat is, but its arrival action
    /// is `Portal` rather than `Sit` (spec §8 scenario C).
    pub fn request_sit(&mut self, runtime_id: RuntimeId, instance_id: &str) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        if avatar.state == AvatarState::Sitting {
            return Err(KernelError::validation("already sitting"));
        }
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture instance"))?;
        let def = self
            .catalog
            .get(&inst.definition_id)
            .cloned()
            .ok_or_else(|| KernelError::internal("unknown furniture definition"))?;
        if !def.can_sit && !def.is_door {
            return Err(KernelError::validation("instance cannot be interacted with"));
        }
        if def.can_sit && self.is_occupied(instance_id) {
            return Err(KernelError::state_conflict("seat is occupied"));
        }
        let action = if def.is_door {
            let target_room_id = def
                .target_room_id
                .clone()
                .ok_or_else(|| KernelError::internal("door has no target room"))?;
            if !self.directory.room_exists(&target_room_id) {
                return Err(KernelError::state_conflict("target room does not exist"));
            }
            ActionAfterPath::Portal {
                target_room_id,
                target_x: def.target_x,
                target_y: def.target_y,
                session_id: avatar.session_id.clone(),
            }
        } else {
            ActionAfterPath::Sit { instance_id: instance_id.to_string() }
        };
        let interaction_tile = self
            .furniture
            .interaction_tile(&self.catalog, &inst)
            .ok_or_else(|| KernelError::validation("instance has no interaction tile"))?;
        let current = avatar.cell();
        if current == interaction_tile {
            return match action {
                ActionAfterPath::Sit { instance_id } => self.try_sit(runtime_id, &instance_id),
                ActionAfterPath::Portal { target_room_id, target_x, target_y, session_id } => {
                    Ok(vec![Outbound::PortalRequest { runtime_id, target_room_id, target_x, target_y, session_id }])
                }
            };
        }
        let (cols, rows) = (self.furniture.layout().cols(), self.furniture.layout().rows());
        let path = room_pathfind::find_path(
            &self.walkable(),
            room_pathfind::Cell::new(current.0, current.1),
            room_pathfind::Cell::new(interaction_tile.0, interaction_tile.1),
            cols,
            rows,
        )
        .ok_or_else(|| KernelError::validation("interaction tile unreachable"))?;
        let waypoints: Vec<(i32, i32)> = path.into_iter().skip(1).map(|c| (c.x, c.y)).collect();
        let avatar = self.avatars.get_mut(&runtime_id).expect("checked above");
        avatar.start_path(waypoints, Some(action)).map_err(|e| KernelError::validation(e.to_string()))?;
        Ok(vec![Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
            runtime_id,
            direction: Some(avatar.direction.index()),
            state: Some("walking".to_string()),
            ..Default::default()
        }))])
    }

    /// `RequestStand(runtimeId)`.
    pub fn request_stand(&mut self, runtime_id: RuntimeId) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get_mut(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        let seat_cell = avatar.stand().map_err(|e| KernelError::validation(e.to_string()))?;
        if !self.is_walkable(seat_cell.0, seat_cell.1) {
            if let Some(adjacent) = self.find_adjacent_walkable(seat_cell) {
                let avatar = self.avatars.get_mut(&runtime_id).expect("checked above");
                avatar.relocate_after_stand(adjacent.0, adjacent.1);
            }
        }
        let avatar = &self.avatars[&runtime_id];
        Ok(vec![Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
            runtime_id,
            x: Some(avatar.x),
            y: Some(avatar.y),
            z: Some(avatar.z),
            state: Some("idle".to_string()),
            sitting_on_instance_id: Some(None),
            ..Default::default()
        }))])
    }

    fn find_adjacent_walkable(&self, (x, y): (i32, i32)) -> Option<(i32, i32)> {
        const OFFSETS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
        OFFSETS.iter().map(|(dx, dy)| (x + dx, y + dy)).find(|&(nx, ny)| self.is_walkable(nx, ny))
    }

    /// `RequestPlace(runtimeId, definitionId, (x,y), rotation)`.
    pub async fn request_place(
        &mut self,
        runtime_id: RuntimeId,
        definition_id: &str,
        cell: (i32, i32),
        rotation: u8,
    ) -> Result<Vec<Outbound>, KernelError> {
        let def = self
            .catalog
            .get(definition_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture definition"))?;
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        if avatar.inventory.get(definition_id).copied().unwrap_or(0) == 0 {
            return Err(KernelError::validation("definition not held in inventory"));
        }
        let (w, h) = def.footprint();
        let tiles = FurnitureRegistry::footprint_tiles(cell.0, cell.1, w, h);
        for &(tx, ty) in &tiles {
            if !self.furniture.layout().is_valid_terrain(tx, ty) {
                return Err(KernelError::validation("footprint tile is not valid terrain"));
            }
            if !def.is_flat {
                if let Some(top) = self.furniture.topmost_at(&self.catalog, tx, ty, None) {
                    let top_def = self
                        .catalog
                        .get(&top.definition_id)
                        .ok_or_else(|| KernelError::internal("unknown top definition"))?;
                    if !top_def.is_stackable() {
                        return Err(KernelError::validation("topmost item at target tile is not stackable"));
                    }
                }
            }
        }
        let z = self.furniture.stack_height_at(&self.catalog, cell.0, cell.1, None) + def.z_offset;
        if !(z < self.furniture.max_stack_z()) {
            return Err(KernelError::validation("placement would exceed max stack height"));
        }

        let owner_user_id = Some(avatar.user_id.clone());
        let row = FurnitureRow {
            instance_id: String::new(),
            room_id: self.room_id.clone(),
            definition_id: definition_id.to_string(),
            x: cell.0,
            y: cell.1,
            z,
            rotation,
            owner_user_id: owner_user_id.clone(),
            state: def.default_state.clone(),
            color_override: None,
        };
        let instance_id = self.store.insert_furniture(row).await.map_err(|e| KernelError::persistence(e.to_string()))?;
        let instance = FurnitureInstance {
            instance_id: instance_id.clone(),
            definition_id: definition_id.to_string(),
            x: cell.0,
            y: cell.1,
            z,
            rotation,
            owner_user_id,
            state: def.default_state.clone(),
            color_override: None,
        };
        self.furniture.insert(instance.clone());

        let avatar = self.avatars.get_mut(&runtime_id).expect("checked above");
        if let Some(count) = avatar.inventory.get_mut(definition_id) {
            *count -= 1;
            if *count == 0 {
                avatar.inventory.remove(definition_id);
            }
        }
        Ok(vec![
            Outbound::Broadcast(Event::FurniAdded(furni_dto(&instance))),
            Outbound::ToSession(avatar.session_id.clone(), Event::InventoryUpdate { inventory: avatar.inventory.clone() }),
        ])
    }

    /// `RequestPickup(runtimeId, instanceId)`.
    pub async fn request_pickup(&mut self, runtime_id: RuntimeId, instance_id: &str) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture instance"))?;
        if inst.owner_user_id.as_deref() != Some(avatar.user_id.as_str()) {
            return Err(KernelError::validation("not the owner of this instance"));
        }
        if self.is_occupied(instance_id) {
            return Err(KernelError::state_conflict("instance is occupied"));
        }
        let def = self
            .catalog
            .get(&inst.definition_id)
            .cloned()
            .ok_or_else(|| KernelError::internal("unknown furniture definition"))?;
        let (w, h) = def.footprint();
        for (tx, ty) in FurnitureRegistry::footprint_tiles(inst.x, inst.y, w, h) {
            if let Some(top) = self.furniture.topmost_at(&self.catalog, tx, ty, Some(instance_id)) {
                if top.z > inst.z {
                    return Err(KernelError::state_conflict("another item rests on top of this one"));
                }
            }
        }

        // Remove from the registry only after the store confirms the delete,
        // per spec §5's persistence-before-visibility rule; on failure the
        // instance is never removed in the first place, so there is nothing
        // to reinsert.
        if let Err(e) = self.store.delete_furniture(instance_id).await {
            return Err(KernelError::persistence(e.to_string()));
        }
        self.furniture.remove(instance_id);

        let avatar = self.avatars.get_mut(&runtime_id).expect("checked above");
        *avatar.inventory.entry(inst.definition_id.clone()).or_insert(0) += 1;
        Ok(vec![
            Outbound::Broadcast(Event::FurniRemoved { instance_id: instance_id.to_string() }),
            Outbound::ToSession(avatar.session_id.clone(), Event::InventoryUpdate { inventory: avatar.inventory.clone() }),
        ])
    }

    /// `RequestRotate(runtimeId, instanceId)`.
    pub async fn request_rotate(&mut self, runtime_id: RuntimeId, instance_id: &str) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture instance"))?;
        if inst.owner_user_id.as_deref() != Some(avatar.user_id.as_str()) {
            return Err(KernelError::validation("not the owner of this instance"));
        }
        let new_rotation = (inst.rotation + 2) % 8;
        self.store
            .update_furniture(instance_id, FurnitureRowPatch { rotation: Some(new_rotation), ..Default::default() })
            .await
            .map_err(|e| KernelError::persistence(e.to_string()))?;
        self.furniture
            .update(instance_id, |f| f.rotation = new_rotation)
            .map_err(|e| KernelError::internal(e.to_string()))?;

        let mut outs = vec![Outbound::Broadcast(Event::FurniUpdated(FurniUpdatedDto {
            instance_id: instance_id.to_string(),
            rotation: Some(new_rotation),
            ..Default::default()
        }))];

        if let Some(def) = self.catalog.get(&inst.definition_id) {
            if def.can_sit {
                let facing = Octant::from_index(def.sit_facing_dir).rotate(new_rotation);
                let sitter = self
                    .avatars
                    .iter_mut()
                    .find(|(_, a)| a.sitting_on_instance_id.as_deref() == Some(instance_id));
                if let Some((sitter_id, sitter)) = sitter {
                    sitter.direction = facing;
                    outs.push(Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
                        runtime_id: *sitter_id,
                        direction: Some(facing.index()),
                        ..Default::default()
                    })));
                }
            }
        }
        Ok(outs)
    }

    /// `RequestUse(runtimeId, instanceId)`.
    pub async fn request_use(&mut self, runtime_id: RuntimeId, instance_id: &str) -> Result<Vec<Outbound>, KernelError> {
        self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture instance"))?;
        let def = self
            .catalog
            .get(&inst.definition_id)
            .cloned()
            .ok_or_else(|| KernelError::internal("unknown furniture definition"))?;
        if !def.can_use || def.is_door {
            return Err(KernelError::validation("instance cannot be used"));
        }
        let new_state = if def.is_toggle {
            match inst.state.as_deref() {
                Some("on") => Some("off".to_string()),
                _ => Some("on".to_string()),
            }
        } else {
            inst.state.clone()
        };
        let epsilon = if new_state.as_deref() == Some("on") { 0.01 } else { 0.0 };
        let new_z = self.furniture.stack_height_at(&self.catalog, inst.x, inst.y, Some(instance_id)) + def.z_offset + epsilon;

        self.store
            .update_furniture(
                instance_id,
                FurnitureRowPatch { state: Some(new_state.clone()), z: Some(new_z), ..Default::default() },
            )
            .await
            .map_err(|e| KernelError::persistence(e.to_string()))?;
        self.furniture
            .update(instance_id, |f| {
                f.state = new_state.clone();
                f.z = new_z;
            })
            .map_err(|e| KernelError::internal(e.to_string()))?;

        Ok(vec![Outbound::Broadcast(Event::FurniUpdated(FurniUpdatedDto {
            instance_id: instance_id.to_string(),
            z: Some(new_z),
            state: Some(new_state),
            ..Default::default()
        }))])
    }

    /// `RequestRecolor(runtimeId, instanceId, hexOrNull)`.
    pub async fn request_recolor(
        &mut self,
        runtime_id: RuntimeId,
        instance_id: &str,
        hex: Option<String>,
    ) -> Result<Vec<Outbound>, KernelError> {
        let avatar = self.avatars.get(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        let inst = self
            .furniture
            .get(instance_id)
            .cloned()
            .ok_or_else(|| KernelError::validation("unknown furniture instance"))?;
        if inst.owner_user_id.as_deref() != Some(avatar.user_id.as_str()) {
            return Err(KernelError::validation("not the owner of this instance"));
        }
        let def = self
            .catalog
            .get(&inst.definition_id)
            .ok_or_else(|| KernelError::internal("unknown furniture definition"))?;
        if !def.can_recolor {
            return Err(KernelError::validation("instance cannot be recolored"));
        }
        let normalized = hex.filter(|h| !h.is_empty());
        if let Some(h) = &normalized {
            if !self.recolor_whitelist.is_allowed(h) {
                return Err(KernelError::validation("color is not in the whitelist"));
            }
        }
        self.store
            .update_furniture(instance_id, FurnitureRowPatch { color_override: Some(normalized.clone()), ..Default::default() })
            .await
            .map_err(|e| KernelError::persistence(e.to_string()))?;
        self.furniture
            .update(instance_id, |f| f.color_override = normalized.clone())
            .map_err(|e| KernelError::internal(e.to_string()))?;

        Ok(vec![Outbound::Broadcast(Event::FurniUpdated(FurniUpdatedDto {
            instance_id: instance_id.to_string(),
            color_override: Some(normalized),
            ..Default::default()
        }))])
    }

    /// Chat-command emote trigger (spec §4.7: `/emote` and per-emote
    /// aliases resolve to this; there is no standalone wire `Intent` for
    /// it). Accepts either a catalog id or an alias.
    pub fn request_emote(&mut self, runtime_id: RuntimeId, id_or_alias: &str) -> Result<Vec<Outbound>, KernelError> {
        let def = self
            .emote_catalog
            .get(id_or_alias)
            .or_else(|| self.emote_catalog.resolve_alias(id_or_alias))
            .ok_or_else(|| KernelError::validation("unknown emote"))?;
        let emote_id = def.emote_id.clone();
        let duration_secs = def.duration_ms as f64 / 1000.0;
        let avatar = self.avatars.get_mut(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        avatar.start_emote(emote_id.clone(), duration_secs).map_err(|e| KernelError::validation(e.to_string()))?;
        Ok(vec![Outbound::Broadcast(Event::AvatarUpdate(AvatarUpdateDto {
            runtime_id,
            state: Some("emoting".to_string()),
            emote_id: Some(Some(emote_id)),
            ..Default::default()
        }))])
    }

    /// `BuyItem{itemId}` (spec §6; treated as a thin shop/currency
    /// collaborator per spec §1, but currency/inventory live on the avatar
    /// the kernel already owns, so it is implemented here rather than
    /// inventing a second owner for those fields).
    pub fn request_buy(&mut self, runtime_id: RuntimeId, item_id: &str) -> Result<Vec<Outbound>, KernelError> {
        let item = self.shop_catalog.get(item_id).cloned().ok_or_else(|| KernelError::validation("unknown shop item"))?;
        let avatar = self.avatars.get_mut(&runtime_id).ok_or_else(|| KernelError::validation("unknown avatar"))?;
        if avatar.currency < item.price {
            return Err(KernelError::validation("insufficient currency"));
        }
        avatar.currency -= item.price;
        *avatar.inventory.entry(item.definition_id.clone()).or_insert(0) += 1;
        Ok(vec![
            Outbound::ToSession(avatar.session_id.clone(), Event::CurrencyUpdate { currency: avatar.currency }),
            Outbound::ToSession(avatar.session_id.clone(), Event::InventoryUpdate { inventory: avatar.inventory.clone() }),
        ])
    }

    /// `Tick(Δt, emitter)`: advances every Walking/Emoting avatar and emits
    /// sparse `AvatarUpdate`s only for avatars that actually changed.
    pub fn tick(&mut self, dt: f64) -> Vec<Outbound> {
        let runtime_ids: Vec<RuntimeId> = self.avatars.keys().copied().collect();
        let mut outs = Vec::new();

        for runtime_id in runtime_ids {
            let before = {
                let a = &self.avatars[&runtime_id];
                (a.x, a.y, a.z, a.direction, a.state, a.emote_id.clone())
            };

            let walk_tick = {
                let avatar = self.avatars.get_mut(&runtime_id).expect("avatar present this tick");
                if avatar.state == AvatarState::Emoting {
                    avatar.tick_emote(dt);
                }
                avatar.tick_walk(dt)
            };

            if let WalkTick::Arrived { action: Some(action) } = walk_tick {
                match action {
                    ActionAfterPath::Sit { instance_id } => {
                        if let Ok(mut sit_outs) = self.try_sit(runtime_id, &instance_id) {
                            outs.append(&mut sit_outs);
                        }
                    }
                    ActionAfterPath::Portal { target_room_id, target_x, target_y, session_id } => {
                        outs.push(Outbound::PortalRequest { runtime_id, target_room_id, target_x, target_y, session_id });
                    }
                }
            }

            let Some(after) = self.avatars.get(&runtime_id) else { continue };
            let mut delta = AvatarUpdateDto { runtime_id, ..Default::default() };
            let mut changed = false;
            if after.x != before.0 {
                delta.x = Some(after.x);
                changed = true;
            }
            if after.y != before.1 {
                delta.y = Some(after.y);
                changed = true;
            }
            if after.z != before.2 {
                delta.z = Some(after.z);
                changed = true;
            }
            if after.direction != before.3 {
                delta.direction = Some(after.direction.index());
                changed = true;
            }
            if after.state != before.4 {
                delta.state = Some(state_str(after.state).to_string());
                changed = true;
            }
            if after.emote_id != before.5 {
                delta.emote_id = Some(after.emote_id.clone());
                changed = true;
            }
            if changed {
                outs.push(Outbound::Broadcast(Event::AvatarUpdate(delta)));
            }
        }
        outs
    }

    /// `StateSnapshot()`.
    pub fn state_snapshot(&self) -> RoomStateDto {
        RoomStateDto {
            room_id: self.room_id.clone(),
            layout: self.furniture.layout().clone(),
            furniture: self.furniture.iter().map(furni_dto).collect(),
            avatars: self.avatars.values().map(avatar_dto).collect(),
        }
    }

    /// `RequestProfile(runtimeId)`: the DTO for one avatar in this room, for
    /// a session asking after itself or another occupant.
    pub fn profile_dto(&self, runtime_id: RuntimeId) -> Option<AvatarDto> {
        self.avatars.get(&runtime_id).map(avatar_dto)
    }
}

fn state_str(state: AvatarState) -> &'static str {
    match state {
        AvatarState::Idle => "idle",
        AvatarState::Walking => "walking",
        AvatarState::Sitting => "sitting",
        AvatarState::Emoting => "emoting",
    }
}

fn furni_dto(inst: &FurnitureInstance) -> FurniDto {
    FurniDto {
        instance_id: inst.instance_id.clone(),
        definition_id: inst.definition_id.clone(),
        x: inst.x,
        y: inst.y,
        z: inst.z,
        rotation: inst.rotation,
        owner_user_id: inst.owner_user_id.clone(),
        state: inst.state.clone(),
        color_override: inst.color_override.clone(),
    }
}

fn avatar_dto(a: &Avatar) -> AvatarDto {
    AvatarDto {
        runtime_id: a.runtime_id,
        user_id: a.user_id.clone(),
        name: a.name.clone(),
        room_id: a.room_id.clone(),
        x: a.x,
        y: a.y,
        z: a.z,
        direction: a.direction.index(),
        state: state_str(a.state).to_string(),
        sitting_on_instance_id: a.sitting_on_instance_id.clone(),
        body_color: a.body_color.clone(),
        emote_id: a.emote_id.clone(),
    }
}
