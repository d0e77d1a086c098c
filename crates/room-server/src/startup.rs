//! Bootstrap: load configuration and catalogs, build the shared
//! [`room_world::WorldDirector`], and register the default/initial rooms.
//! Mirrors the teacher's `AppStartup::load_editor_state` in spirit: one
//! function that turns CLI args plus on-disk resources into the state the
//! runtime loop needs, failing fast on the conditions spec §7 calls fatal.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use room_catalog::{EmoteCatalog, FurnitureCatalog, ShopCatalog};
use room_config::Config;
use room_grid::Layout;
use room_persist::MemoryStore;
use room_world::WorldDirector;

use crate::Args;

pub struct Bootstrap {
    pub world: WorldDirector,
    pub tick_interval: Duration,
    pub config: Config,
}

/// Loads `{rooms_dir}/{room_id}.json` and parses it as a [`Layout`]. Falls
/// back to a 1x1 wall cell with a critical log if the file is missing or
/// unparsable (spec §4.1's layout-resolution fallback chain), since a
/// bundled default existing-but-broken is still "no default produced a
/// non-empty 2D array".
fn load_bundled_layout(rooms_dir: &Path, room_id: &str) -> Layout {
    let path = rooms_dir.join(format!("{room_id}.json"));
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<Layout>(&raw) {
            Ok(layout) => layout,
            Err(e) => {
                tracing::error!(target: "room.server.startup", room_id, path = %path.display(), error = %e, "bundled layout failed to parse, falling back to single wall cell");
                Layout::fallback_single_wall()
            }
        },
        Err(e) => {
            tracing::error!(target: "room.server.startup", room_id, path = %path.display(), error = %e, "bundled layout missing, falling back to single wall cell");
            Layout::fallback_single_wall()
        }
    }
}

/// Reads an optional catalog path; an absent path yields an empty catalog
/// rather than an error (spec §6: emote/shop catalogs are not in the fatal
/// set, unlike the furniture catalog).
fn load_optional_toml(path: Option<&str>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("failed to read catalog file {p}")),
        None => Ok(String::new()),
    }
}

pub async fn bootstrap(args: &Args) -> Result<Bootstrap> {
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    // spec §7: failure to load the furniture catalog is fatal.
    let furniture_catalog = Arc::new(
        FurnitureCatalog::load(Path::new(&config.file.furniture_catalog_path))
            .context("failed to load furniture catalog")?,
    );

    let emote_raw = load_optional_toml(config.file.emote_catalog_path.as_deref())?;
    let emote_catalog = Arc::new(EmoteCatalog::from_toml_str(&emote_raw).context("failed to parse emote catalog")?);

    let shop_raw = load_optional_toml(config.file.shop_catalog_path.as_deref())?;
    let shop_catalog = Arc::new(ShopCatalog::from_toml_str(&shop_raw).context("failed to parse shop catalog")?);

    let recolor_whitelist = Arc::new(config.recolor_whitelist.clone());

    let store = Arc::new(MemoryStore::new());

    let mut world = WorldDirector::new(
        store,
        furniture_catalog,
        recolor_whitelist,
        emote_catalog,
        shop_catalog,
        config.file.default_stack_factor,
        config.file.max_stack_z,
    );

    // spec §7: failure to load the default room on startup is fatal.
    let default_room_id = config.file.default_room_id.clone();
    let default_layout = load_bundled_layout(&args.rooms_dir, &default_room_id);
    world
        .register_room(default_room_id.clone(), default_layout)
        .await
        .with_context(|| format!("failed to register default room {default_room_id}"))?;

    for room_id in &config.file.initial_rooms {
        if room_id == &default_room_id {
            continue;
        }
        let layout = load_bundled_layout(&args.rooms_dir, room_id);
        world
            .register_room(room_id.clone(), layout)
            .await
            .with_context(|| format!("failed to register room {room_id}"))?;
    }

    let tick_interval = config.tick_interval();
    Ok(Bootstrap { world, tick_interval, config })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_is_single_wall(layout: &Layout) {
        assert_eq!(layout.cols(), 1);
        assert_eq!(layout.rows(), 1);
        assert_eq!(layout.tile_kind(0, 0), room_grid::TileKind::Wall);
    }

    #[test]
    fn missing_layout_file_falls_back_to_single_wall() {
        let dir = tempfile::tempdir().unwrap();
        let layout = load_bundled_layout(dir.path(), "nope");
        assert_is_single_wall(&layout);
    }

    #[test]
    fn malformed_layout_file_falls_back_to_single_wall() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lobby.json"), b"not json").unwrap();
        let layout = load_bundled_layout(dir.path(), "lobby");
        assert_is_single_wall(&layout);
    }

    #[test]
    fn well_formed_layout_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::fallback_single_wall();
        let raw = serde_json::to_string(&layout).unwrap();
        std::fs::write(dir.path().join("lobby.json"), raw).unwrap();
        let loaded = load_bundled_layout(dir.path(), "lobby");
        assert_is_single_wall(&loaded);
    }

    #[test]
    fn load_optional_toml_is_empty_string_when_absent() {
        assert_eq!(load_optional_toml(None).unwrap(), "");
    }

    #[test]
    fn load_optional_toml_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emotes.toml");
        std::fs::write(&path, b"dummy = true").unwrap();
        let raw = load_optional_toml(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(raw, "dummy = true");
    }

    #[test]
    fn load_optional_toml_errors_on_missing_file() {
        assert!(load_optional_toml(Some("/nonexistent/path/catalog.toml")).is_err());
    }
}
