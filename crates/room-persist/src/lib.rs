//! The Persistence Facade (spec §4.8): a narrow repository trait plus one
//! concrete in-process backend. `room-kernel`/`room-world` depend only on
//! [`RoomStore`], never on `MemoryStore` directly, so a real network-backed
//! store can be swapped in without touching the core.

use std::collections::HashMap;

use async_trait::async_trait;
use room_grid::Layout;
use thiserror::Error;
use tokio::sync::Mutex;

pub type RoomId = String;
pub type InstanceId = String;
pub type UserId = String;
pub type DefinitionId = String;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no furniture row with instance id {0}")]
    UnknownInstance(InstanceId),
    #[error("no user row with user id {0}")]
    UnknownUser(UserId),
}

/// One furniture row as stored at rest (spec §6 logical schema:
/// `furniture(instanceId PK, roomId, definitionId, x, y, z, rotation,
/// ownerUserId?, state?, colorOverride?)`).
#[derive(Debug, Clone, PartialEq)]
pub struct FurnitureRow {
    pub instance_id: InstanceId,
    pub room_id: RoomId,
    pub definition_id: DefinitionId,
    pub x: i32,
    pub y: i32,
    pub z: f64,
    pub rotation: u8,
    pub owner_user_id: Option<String>,
    pub state: Option<String>,
    pub color_override: Option<String>,
}

/// A sparse patch applied to a stored [`FurnitureRow`]. `None` leaves a
/// field unchanged; for the nullable fields, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct FurnitureRowPatch {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub z: Option<f64>,
    pub rotation: Option<u8>,
    pub owner_user_id: Option<Option<String>>,
    pub state: Option<Option<String>>,
    pub color_override: Option<Option<String>>,
}

impl FurnitureRowPatch {
    fn apply_to(self, row: &mut FurnitureRow) {
        if let Some(x) = self.x {
            row.x = x;
        }
        if let Some(y) = self.y {
            row.y = y;
        }
        if let Some(z) = self.z {
            row.z = z;
        }
        if let Some(rotation) = self.rotation {
            row.rotation = rotation;
        }
        if let Some(owner) = self.owner_user_id {
            row.owner_user_id = owner;
        }
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(color) = self.color_override {
            row.color_override = color;
        }
    }
}

/// One user row as stored at rest (spec §6: `users(userId PK, username
/// unique, passwordHash, isAdmin, currency, inventory map, bodyColor,
/// lastRoomId, lastX, lastY, lastZ)`).
#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub user_id: UserId,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub currency: i64,
    pub inventory: HashMap<DefinitionId, u32>,
    pub body_color: String,
    pub last_room_id: Option<RoomId>,
    pub last_x: Option<i32>,
    pub last_y: Option<i32>,
    pub last_z: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct UserRowPatch {
    pub currency: Option<i64>,
    pub inventory: Option<HashMap<DefinitionId, u32>>,
    pub body_color: Option<String>,
    pub last_room_id: Option<Option<RoomId>>,
    pub last_x: Option<Option<i32>>,
    pub last_y: Option<Option<i32>>,
    pub last_z: Option<Option<f64>>,
}

impl UserRowPatch {
    fn apply_to(self, row: &mut UserRow) {
        if let Some(currency) = self.currency {
            row.currency = currency;
        }
        if let Some(inventory) = self.inventory {
            row.inventory = inventory;
        }
        if let Some(body_color) = self.body_color {
            row.body_color = body_color;
        }
        if let Some(last_room_id) = self.last_room_id {
            row.last_room_id = last_room_id;
        }
        if let Some(last_x) = self.last_x {
            row.last_x = last_x;
        }
        if let Some(last_y) = self.last_y {
            row.last_y = last_y;
        }
        if let Some(last_z) = self.last_z {
            row.last_z = last_z;
        }
    }
}

/// The narrow repository interface the core calls into (spec §4.8). Every
/// operation either succeeds or fails outright; there is no partial
/// success.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn load_room_layout(&self, room_id: &str) -> Result<Option<Layout>, PersistError>;
    async fn save_room_layout(&self, room_id: &str, layout: Layout) -> Result<(), PersistError>;
    async fn load_furniture(&self, room_id: &str) -> Result<Vec<FurnitureRow>, PersistError>;
    async fn insert_furniture(&self, row: FurnitureRow) -> Result<InstanceId, PersistError>;
    async fn update_furniture(&self, instance_id: &str, patch: FurnitureRowPatch) -> Result<(), PersistError>;
    async fn delete_furniture(&self, instance_id: &str) -> Result<(), PersistError>;
    async fn load_user(&self, user_id: &str) -> Result<Option<UserRow>, PersistError>;
    async fn update_user(&self, user_id: &str, patch: UserRowPatch) -> Result<(), PersistError>;
    /// Creates `row` if no user with its id exists yet; a no-op otherwise.
    /// The bootstrap path for a session whose `userId` has never been seen
    /// before (spec treats credential issuance as an external collaborator,
    /// so the first connection under a given id is its own account
    /// creation).
    async fn upsert_user(&self, row: UserRow) -> Result<(), PersistError>;
}

#[derive(Default)]
struct MemoryTables {
    layouts: HashMap<RoomId, Layout>,
    furniture: HashMap<InstanceId, FurnitureRow>,
    users: HashMap<UserId, UserRow>,
}

/// The bundled reference [`RoomStore`]: an in-process, mutex-guarded set of
/// tables. Good enough to run the server and its test suite without an
/// external database; satisfies the same upsert/absent-after-delete
/// contract a networked store would (spec §4.8).
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user row directly, bypassing the trait — used by bootstrap
    /// code and tests that need a known starting fixture.
    pub async fn seed_user(&self, row: UserRow) {
        let mut tables = self.tables.lock().await;
        tables.users.insert(row.user_id.clone(), row);
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn load_room_layout(&self, room_id: &str) -> Result<Option<Layout>, PersistError> {
        let tables = self.tables.lock().await;
        Ok(tables.layouts.get(room_id).cloned())
    }

    async fn save_room_layout(&self, room_id: &str, layout: Layout) -> Result<(), PersistError> {
        let mut tables = self.tables.lock().await;
        tables.layouts.insert(room_id.to_string(), layout);
        Ok(())
    }

    async fn load_furniture(&self, room_id: &str) -> Result<Vec<FurnitureRow>, PersistError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .furniture
            .values()
            .filter(|row| row.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn insert_furniture(&self, row: FurnitureRow) -> Result<InstanceId, PersistError> {
        let mut tables = self.tables.lock().await;
        let instance_id = if row.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            row.instance_id.clone()
        };
        let mut row = row;
        row.instance_id = instance_id.clone();
        tables.furniture.insert(instance_id.clone(), row);
        tracing::debug!(target: "room.persist", instance_id = %instance_id, "inserted furniture row");
        Ok(instance_id)
    }

    async fn update_furniture(&self, instance_id: &str, patch: FurnitureRowPatch) -> Result<(), PersistError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .furniture
            .get_mut(instance_id)
            .ok_or_else(|| PersistError::UnknownInstance(instance_id.to_string()))?;
        patch.apply_to(row);
        Ok(())
    }

    async fn delete_furniture(&self, instance_id: &str) -> Result<(), PersistError> {
        let mut tables = self.tables.lock().await;
        tables.furniture.remove(instance_id);
        Ok(())
    }

    async fn load_user(&self, user_id: &str) -> Result<Option<UserRow>, PersistError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.get(user_id).cloned())
    }

    async fn update_user(&self, user_id: &str, patch: UserRowPatch) -> Result<(), PersistError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .users
            .get_mut(user_id)
            .ok_or_else(|| PersistError::UnknownUser(user_id.to_string()))?;
        patch.apply_to(row);
        Ok(())
    }

    async fn upsert_user(&self, row: UserRow) -> Result<(), PersistError> {
        let mut tables = self.tables.lock().await;
        tables.users.entry(row.user_id.clone()).or_insert(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_grid::TileKind;

    fn floor_layout() -> Layout {
        Layout::new(vec![vec![TileKind::Floor; 4]; 4]).unwrap()
    }

    fn sample_row(room_id: &str) -> FurnitureRow {
        FurnitureRow {
            instance_id: String::new(),
            room_id: room_id.to_string(),
            definition_id: "chair_basic".to_string(),
            x: 1,
            y: 1,
            z: 0.0,
            rotation: 0,
            owner_user_id: None,
            state: None,
            color_override: None,
        }
    }

    #[tokio::test]
    async fn save_then_load_room_layout_round_trips() {
        let store = MemoryStore::new();
        assert!(store.load_room_layout("room-1").await.unwrap().is_none());
        store.save_room_layout("room-1", floor_layout()).await.unwrap();
        let loaded = store.load_room_layout("room-1").await.unwrap().unwrap();
        assert_eq!(loaded.cols(), 4);
    }

    #[tokio::test]
    async fn insert_furniture_assigns_an_opaque_instance_id() {
        let store = MemoryStore::new();
        let id = store.insert_furniture(sample_row("room-1")).await.unwrap();
        assert!(!id.is_empty());
        let rows = store.load_furniture("room-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instance_id, id);
    }

    #[tokio::test]
    async fn update_furniture_applies_a_sparse_patch() {
        let store = MemoryStore::new();
        let id = store.insert_furniture(sample_row("room-1")).await.unwrap();
        store
            .update_furniture(
                &id,
                FurnitureRowPatch {
                    rotation: Some(2),
                    color_override: Some(Some("#AABBCC".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let rows = store.load_furniture("room-1").await.unwrap();
        assert_eq!(rows[0].rotation, 2);
        assert_eq!(rows[0].x, 1, "unpatched field stays put");
        assert_eq!(rows[0].color_override.as_deref(), Some("#AABBCC"));
    }

    #[tokio::test]
    async fn update_furniture_on_unknown_instance_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_furniture("missing", FurnitureRowPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn delete_furniture_is_absent_afterward() {
        let store = MemoryStore::new();
        let id = store.insert_furniture(sample_row("room-1")).await.unwrap();
        store.delete_furniture(&id).await.unwrap();
        assert!(store.load_furniture("room-1").await.unwrap().is_empty());
        // Idempotent: deleting again is not an error.
        store.delete_furniture(&id).await.unwrap();
    }

    #[tokio::test]
    async fn update_user_patches_currency_and_clears_last_room() {
        let store = MemoryStore::new();
        store
            .seed_user(UserRow {
                user_id: "u1".to_string(),
                username: "tester".to_string(),
                password_hash: "hash".to_string(),
                is_admin: false,
                currency: 100,
                inventory: HashMap::new(),
                body_color: "#FFFFFF".to_string(),
                last_room_id: Some("room-1".to_string()),
                last_x: Some(1),
                last_y: Some(1),
                last_z: Some(0.0),
            })
            .await;
        store
            .update_user(
                "u1",
                UserRowPatch {
                    currency: Some(150),
                    last_room_id: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let row = store.load_user("u1").await.unwrap().unwrap();
        assert_eq!(row.currency, 150);
        assert!(row.last_room_id.is_none());
    }

    fn new_user_row(user_id: &str) -> UserRow {
        UserRow {
            user_id: user_id.to_string(),
            username: user_id.to_string(),
            password_hash: String::new(),
            is_admin: false,
            currency: 0,
            inventory: HashMap::new(),
            body_color: "#FFFFFF".to_string(),
            last_room_id: None,
            last_x: None,
            last_y: None,
            last_z: None,
        }
    }

    #[tokio::test]
    async fn upsert_user_creates_once_and_is_a_no_op_afterward() {
        let store = MemoryStore::new();
        store.upsert_user(new_user_row("u2")).await.unwrap();
        store
            .update_user("u2", UserRowPatch { currency: Some(50), ..Default::default() })
            .await
            .unwrap();
        store.upsert_user(new_user_row("u2")).await.unwrap();
        let row = store.load_user("u2").await.unwrap().unwrap();
        assert_eq!(row.currency, 50, "second upsert must not clobber an existing row");
    }
}
