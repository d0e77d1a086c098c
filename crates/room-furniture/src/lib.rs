//! The insertion-ordered registry of [`FurnitureInstance`]s placed in one
//! room, and the spatial queries the pathfinder and kernel need against it
//! (spec §4.3).

use std::collections::HashMap;

use room_catalog::{DefinitionId, FurnitureCatalog};
use room_grid::{Layout, Octant};
use thiserror::Error;

pub type InstanceId = String;

/// The default multiplier applied to a stackable, non-flat item's logical
/// `stack_height` when computing how much vertical space it consumes.
pub const DEFAULT_STACK_FACTOR: f64 = 1.0;

/// Upper bound (exclusive) on any instance's resting `z`, per spec §3.
pub const MAX_STACK_Z: f64 = 20.0;

/// A placed, mutable furniture row (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct FurnitureInstance {
    pub instance_id: InstanceId,
    pub definition_id: DefinitionId,
    pub x: i32,
    pub y: i32,
    pub z: f64,
    /// 0..=7, an `Octant` index.
    pub rotation: u8,
    pub owner_user_id: Option<String>,
    pub state: Option<String>,
    pub color_override: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum FurnitureError {
    #[error("furniture definition {0} is not in the catalog")]
    UnknownDefinition(String),
    #[error("instance {0} not found in this room")]
    NotFound(InstanceId),
}

/// Outcome of a mutation: whether it actually changed anything. Per spec
/// §4.3, mutations are idempotent w.r.t. repeated identical inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    Unchanged,
}

/// Holds one room's placed furniture plus the static layout it sits on.
/// Derived spatial queries compose the two.
pub struct FurnitureRegistry {
    layout: Layout,
    order: Vec<InstanceId>,
    by_id: HashMap<InstanceId, FurnitureInstance>,
    stack_factor: f64,
    max_stack_z: f64,
}

impl FurnitureRegistry {
    pub fn new(layout: Layout) -> Self {
        Self::with_stack_params(layout, DEFAULT_STACK_FACTOR, MAX_STACK_Z)
    }

    pub fn with_stack_params(layout: Layout, stack_factor: f64, max_stack_z: f64) -> Self {
        Self {
            layout,
            order: Vec::new(),
            by_id: HashMap::new(),
            stack_factor,
            max_stack_z,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn max_stack_z(&self) -> f64 {
        self.max_stack_z
    }

    pub fn get(&self, instance_id: &str) -> Option<&FurnitureInstance> {
        self.by_id.get(instance_id)
    }

    /// All instances, in insertion order (the order clients should render).
    pub fn iter(&self) -> impl Iterator<Item = &FurnitureInstance> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Footprint tiles for a definition's `(w, h)` placed with base `(x, y)`,
    /// centered with a floor half-extent (spec glossary: "Footprint").
    pub fn footprint_tiles(x: i32, y: i32, w: u32, h: u32) -> Vec<(i32, i32)> {
        let half_w = (w as i32) / 2;
        let half_h = (h as i32) / 2;
        let start_x = x - half_w;
        let start_y = y - half_h;
        let mut tiles = Vec::with_capacity((w * h) as usize);
        for dy in 0..h as i32 {
            for dx in 0..w as i32 {
                tiles.push((start_x + dx, start_y + dy));
            }
        }
        tiles
    }

    fn definition<'a>(&self, catalog: &'a FurnitureCatalog, instance: &FurnitureInstance) -> Option<&'a room_catalog::FurnitureDefinition> {
        catalog.get(&instance.definition_id)
    }

    /// All instances whose *base* tile equals `(x, y)`.
    pub fn stack_at(&self, x: i32, y: i32) -> Vec<&FurnitureInstance> {
        self.iter().filter(|f| f.x == x && f.y == y).collect()
    }

    /// The z of the next available resting surface on `(x, y)`, considering
    /// only stackable items whose footprint covers that tile.
    pub fn stack_height_at(&self, catalog: &FurnitureCatalog, x: i32, y: i32, exclude_id: Option<&str>) -> f64 {
        let mut max_height: f64 = 0.0;
        for inst in self.iter() {
            if Some(inst.instance_id.as_str()) == exclude_id {
                continue;
            }
            let Some(def) = self.definition(catalog, inst) else { continue };
            if !def.is_stackable() {
                continue;
            }
            let (w, h) = def.footprint();
            if !Self::footprint_tiles(inst.x, inst.y, w, h).contains(&(x, y)) {
                continue;
            }
            let contribution = if def.is_flat {
                0.0
            } else {
                def.stack_height * self.stack_factor
            };
            let top = inst.z + contribution;
            if top > max_height {
                max_height = top;
            }
        }
        max_height
    }

    /// Returns the topmost instance occupying `(x, y)`'s footprint, if any
    /// (by highest `z`), used to decide whether a non-flat placement may
    /// rest on it.
    pub fn topmost_at(&self, catalog: &FurnitureCatalog, x: i32, y: i32, exclude_id: Option<&str>) -> Option<&FurnitureInstance> {
        self.iter()
            .filter(|inst| Some(inst.instance_id.as_str()) != exclude_id)
            .filter(|inst| {
                let Some(def) = self.definition(catalog, inst) else { return false };
                let (w, h) = def.footprint();
                Self::footprint_tiles(inst.x, inst.y, w, h).contains(&(x, y))
            })
            .max_by(|a, b| a.z.partial_cmp(&b.z).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// True if any non-walkable, non-flat instance's footprint includes
    /// `(x, y)`.
    pub fn is_solid_blocked(&self, catalog: &FurnitureCatalog, x: i32, y: i32, exclude_id: Option<&str>) -> bool {
        self.iter()
            .filter(|inst| Some(inst.instance_id.as_str()) != exclude_id)
            .any(|inst| {
                let Some(def) = self.definition(catalog, inst) else { return false };
                if def.is_walkable || def.is_flat {
                    return false;
                }
                let (w, h) = def.footprint();
                Self::footprint_tiles(inst.x, inst.y, w, h).contains(&(x, y))
            })
    }

    /// `is_valid_terrain(x,y) && !is_solid_blocked(x,y)`.
    pub fn is_walkable(&self, catalog: &FurnitureCatalog, x: i32, y: i32) -> bool {
        self.layout.is_valid_terrain(x, y) && !self.is_solid_blocked(catalog, x, y, None)
    }

    /// The cell an avatar must stand on to interact with `instance`: one
    /// step opposite the instance's rotated seat-facing direction from its
    /// base cell. Doors reuse the same derivation (spec §4.3).
    pub fn interaction_tile(&self, catalog: &FurnitureCatalog, instance: &FurnitureInstance) -> Option<(i32, i32)> {
        let def = self.definition(catalog, instance)?;
        let base_facing = Octant::from_index(def.sit_facing_dir);
        let facing = base_facing.rotate(instance.rotation);
        let (dx, dy) = facing.delta();
        Some((instance.x - dx, instance.y - dy))
    }

    /// Insert a new instance. Idempotent: inserting an instance with an id
    /// already present and identical fields is a no-op.
    pub fn insert(&mut self, instance: FurnitureInstance) -> MutationOutcome {
        if let Some(existing) = self.by_id.get(&instance.instance_id) {
            if *existing == instance {
                return MutationOutcome::Unchanged;
            }
        }
        let is_new = !self.by_id.contains_key(&instance.instance_id);
        let id = instance.instance_id.clone();
        self.by_id.insert(id.clone(), instance);
        if is_new {
            self.order.push(id);
        }
        MutationOutcome::Applied
    }

    /// Remove an instance by id. Idempotent: removing an absent id is a
    /// no-op that returns `None`.
    pub fn remove(&mut self, instance_id: &str) -> Option<FurnitureInstance> {
        let removed = self.by_id.remove(instance_id);
        if removed.is_some() {
            self.order.retain(|id| id != instance_id);
        }
        removed
    }

    /// Apply a field patch via a closure; returns whether anything changed.
    pub fn update(&mut self, instance_id: &str, patch: impl FnOnce(&mut FurnitureInstance)) -> Result<MutationOutcome, FurnitureError> {
        let inst = self
            .by_id
            .get_mut(instance_id)
            .ok_or_else(|| FurnitureError::NotFound(instance_id.to_string()))?;
        let before = inst.clone();
        patch(inst);
        if *inst == before {
            Ok(MutationOutcome::Unchanged)
        } else {
            Ok(MutationOutcome::Applied)
        }
    }
}
