//! Process-wide, read-only-after-load catalogs: furniture definitions,
//! emotes, the recolor whitelist, and the shop. Loaded once at startup by
//! `room-config` and handed by reference (`Arc`) to every `RoomKernel`; see
//! spec §3 ("Catalog is loaded once at start") and §5 ("read-only after
//! startup").

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use thiserror::Error;

pub type DefinitionId = String;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("furniture catalog is empty")]
    EmptyFurnitureCatalog,
    #[error("duplicate furniture definition id {0}")]
    DuplicateDefinition(String),
}

/// One furniture definition row, immutable for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct FurnitureDefinition {
    pub definition_id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub is_walkable: bool,
    #[serde(default)]
    pub is_flat: bool,
    /// Defaults to `!is_flat` when absent, per spec §3.
    #[serde(default)]
    pub stackable: Option<bool>,
    #[serde(default)]
    pub stack_height: f64,
    #[serde(default)]
    pub z_offset: f64,
    #[serde(default)]
    pub can_sit: bool,
    /// Octant 0..8, meaningful only when `can_sit`.
    #[serde(default)]
    pub sit_facing_dir: u8,
    #[serde(default)]
    pub sit_height_offset: f64,
    #[serde(default)]
    pub can_use: bool,
    #[serde(default)]
    pub is_toggle: bool,
    #[serde(default)]
    pub default_state: Option<String>,
    #[serde(default)]
    pub can_recolor: bool,
    #[serde(default)]
    pub is_door: bool,
    #[serde(default)]
    pub target_room_id: Option<String>,
    #[serde(default)]
    pub target_x: Option<i32>,
    #[serde(default)]
    pub target_y: Option<i32>,
}

impl FurnitureDefinition {
    pub fn is_stackable(&self) -> bool {
        self.stackable.unwrap_or(!self.is_flat)
    }

    pub fn footprint(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Deserialize)]
struct FurnitureFile {
    #[serde(rename = "furniture", default)]
    items: Vec<FurnitureDefinition>,
}

/// Immutable, process-wide furniture catalog.
#[derive(Debug, Clone)]
pub struct FurnitureCatalog {
    definitions: HashMap<DefinitionId, FurnitureDefinition>,
}

impl FurnitureCatalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let file: FurnitureFile = toml::from_str(raw)?;
        if file.items.is_empty() {
            return Err(CatalogError::EmptyFurnitureCatalog);
        }
        let mut definitions = HashMap::with_capacity(file.items.len());
        for def in file.items {
            if definitions.insert(def.definition_id.clone(), def).is_some() {
                return Err(CatalogError::DuplicateDefinition(
                    definitions.keys().last().cloned().unwrap_or_default(),
                ));
            }
        }
        tracing::info!(target: "room.catalog", count = definitions.len(), "loaded furniture catalog");
        Ok(Self { definitions })
    }

    pub fn load(path: &std::path::Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn get(&self, id: &str) -> Option<&FurnitureDefinition> {
        self.definitions.get(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// One emote definition: its catalog id, duration, and chat aliases
/// (`/emotename`) that select it.
#[derive(Debug, Clone, Deserialize)]
pub struct EmoteDefinition {
    pub emote_id: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EmoteFile {
    #[serde(rename = "emote", default)]
    items: Vec<EmoteDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct EmoteCatalog {
    by_id: HashMap<String, EmoteDefinition>,
    by_alias: HashMap<String, String>,
}

impl EmoteCatalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let file: EmoteFile = toml::from_str(raw)?;
        let mut by_id = HashMap::new();
        let mut by_alias = HashMap::new();
        for emote in file.items {
            for alias in &emote.aliases {
                by_alias.insert(alias.clone(), emote.emote_id.clone());
            }
            by_id.insert(emote.emote_id.clone(), emote);
        }
        Ok(Self { by_id, by_alias })
    }

    pub fn get(&self, id: &str) -> Option<&EmoteDefinition> {
        self.by_id.get(id)
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<&EmoteDefinition> {
        self.by_alias.get(alias).and_then(|id| self.by_id.get(id))
    }
}

/// Whitelist of valid recolor hex strings (e.g. `"#A1B2C3"`), read-only after
/// load. `RequestRecolor` rejects anything not in this set (spec §4.5/§7).
#[derive(Debug, Clone, Default)]
pub struct ColorWhitelist {
    allowed: HashSet<String>,
}

impl ColorWhitelist {
    pub fn new(colors: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: colors.into_iter().map(|c| c.to_ascii_uppercase()).collect(),
        }
    }

    pub fn is_allowed(&self, hex: &str) -> bool {
        self.allowed.contains(&hex.to_ascii_uppercase())
    }
}

/// One purchasable catalog row: the price, in currency units, of one unit of
/// `definition_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShopItem {
    pub item_id: String,
    pub definition_id: DefinitionId,
    pub price: i64,
}

#[derive(Debug, Deserialize, Default)]
struct ShopFile {
    #[serde(rename = "item", default)]
    items: Vec<ShopItem>,
}

#[derive(Debug, Clone, Default)]
pub struct ShopCatalog {
    by_item_id: HashMap<String, ShopItem>,
}

impl ShopCatalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let file: ShopFile = toml::from_str(raw)?;
        let by_item_id = file
            .items
            .into_iter()
            .map(|item| (item.item_id.clone(), item))
            .collect();
        Ok(Self { by_item_id })
    }

    pub fn get(&self, item_id: &str) -> Option<&ShopItem> {
        self.by_item_id.get(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FURNITURE: &str = r#"
[[furniture]]
definition_id = "chair_basic"
name = "Basic Chair"
width = 1
height = 1
can_sit = true
sit_facing_dir = 2
sit_height_offset = 0.4

[[furniture]]
definition_id = "box_small"
name = "Small Box"
width = 1
height = 1
stack_height = 1.0
"#;

    #[test]
    fn loads_definitions_and_defaults_stackable_from_is_flat() {
        let cat = FurnitureCatalog::from_toml_str(SAMPLE_FURNITURE).unwrap();
        let chair = cat.get("chair_basic").unwrap();
        assert!(chair.can_sit);
        assert_eq!(chair.sit_facing_dir, 2);
        assert!(chair.is_stackable(), "non-flat item defaults to stackable");
        assert!(cat.get("missing").is_none());
    }

    #[test]
    fn rejects_empty_catalog() {
        let err = FurnitureCatalog::from_toml_str("").unwrap_err();
        assert!(matches!(err, CatalogError::EmptyFurnitureCatalog));
    }

    #[test]
    fn rejects_duplicate_definition_ids() {
        let dup = format!("{SAMPLE_FURNITURE}\n[[furniture]]\ndefinition_id = \"chair_basic\"\nname = \"dup\"\nwidth = 1\nheight = 1\n");
        let err = FurnitureCatalog::from_toml_str(&dup).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateDefinition(_)));
    }

    #[test]
    fn color_whitelist_is_case_insensitive() {
        let wl = ColorWhitelist::new(["#AABBCC".to_string()]);
        assert!(wl.is_allowed("#aabbcc"));
        assert!(!wl.is_allowed("#000000"));
    }

    #[test]
    fn emote_alias_resolves_to_definition() {
        let cat = EmoteCatalog::from_toml_str(
            r#"
[[emote]]
emote_id = "wave"
duration_ms = 2000
aliases = ["wave", "hi"]
"#,
        )
        .unwrap();
        assert_eq!(cat.resolve_alias("hi").unwrap().emote_id, "wave");
        assert!(cat.resolve_alias("unknown").is_none());
    }
}
