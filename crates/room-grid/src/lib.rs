//! Static tile layout for one room.
//!
//! A `Layout` is a dense, immutable-within-run 2D grid of [`TileKind`]. It
//! answers the purely geometric questions (`is_in_bounds`, `tile_kind`,
//! `is_valid_terrain`); everything dynamic (furniture occupying a tile,
//! whether an avatar can currently step there) is layered on top by
//! `room-furniture`, which composes a `Layout` with a mutable registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single tile's static classification.
///
/// Wire encoding (per the external schema): `Floor = 0`, `Wall = 1`,
/// `AltFloor = 2`, `Hole = "X"` (a string, not a number). `OutOfBounds` never
/// appears on the wire; it is only ever a `tile_kind` query result for
/// coordinates outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    Floor,
    AltFloor,
    Wall,
    Hole,
    OutOfBounds,
}

impl Serialize for TileKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TileKind::Floor => serializer.serialize_u8(0),
            TileKind::Wall => serializer.serialize_u8(1),
            TileKind::AltFloor => serializer.serialize_u8(2),
            TileKind::Hole => serializer.serialize_str("X"),
            TileKind::OutOfBounds => {
                Err(serde::ser::Error::custom("OutOfBounds is not a wire tile kind"))
            }
        }
    }
}

impl<'de> Deserialize<'de> for TileKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct TileKindVisitor;
        impl<'de> Visitor<'de> for TileKindVisitor {
            type Value = TileKind;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0, 1, 2, or the string \"X\"")
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TileKind, E> {
                match v {
                    0 => Ok(TileKind::Floor),
                    1 => Ok(TileKind::Wall),
                    2 => Ok(TileKind::AltFloor),
                    other => Err(E::custom(format!("unknown numeric tile kind {other}"))),
                }
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TileKind, E> {
                self.visit_u64(v as u64)
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<TileKind, E> {
                if v.eq_ignore_ascii_case("x") {
                    Ok(TileKind::Hole)
                } else {
                    Err(E::custom(format!("unknown string tile kind {v:?}")))
                }
            }
        }
        deserializer.deserialize_any(TileKindVisitor)
    }
}

impl TileKind {
    /// `Floor ∨ AltFloor`.
    pub fn is_valid_terrain(self) -> bool {
        matches!(self, TileKind::Floor | TileKind::AltFloor)
    }
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("layout rows/cols do not match the declared dimensions ({declared_cols}x{declared_rows} vs {actual_cols}x{actual_rows})")]
    DimensionMismatch {
        declared_cols: usize,
        declared_rows: usize,
        actual_cols: usize,
        actual_rows: usize,
    },
    #[error("layout has zero rows or zero columns")]
    Empty,
}

/// A dense `cols x rows` grid of [`TileKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layout {
    cols: usize,
    rows: usize,
    /// Row-major: `cells[y][x]`.
    cells: Vec<Vec<TileKind>>,
}

impl Layout {
    /// Build a layout from a row-major grid, validating rectangularity.
    pub fn new(cells: Vec<Vec<TileKind>>) -> Result<Self, GridError> {
        let rows = cells.len();
        if rows == 0 {
            return Err(GridError::Empty);
        }
        let cols = cells[0].len();
        if cols == 0 {
            return Err(GridError::Empty);
        }
        for (y, row) in cells.iter().enumerate() {
            if row.len() != cols {
                return Err(GridError::DimensionMismatch {
                    declared_cols: cols,
                    declared_rows: rows,
                    actual_cols: row.len(),
                    actual_rows: y + 1,
                });
            }
        }
        Ok(Self { cols, rows, cells })
    }

    /// The degenerate fallback layout used when neither persistence nor a
    /// bundled default produces a non-empty grid (spec §4.1).
    pub fn fallback_single_wall() -> Self {
        tracing::error!(target: "room.grid", "falling back to 1x1 wall layout; no layout source produced a non-empty grid");
        Self {
            cols: 1,
            rows: 1,
            cells: vec![vec![TileKind::Wall]],
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.cols && (y as usize) < self.rows
    }

    pub fn tile_kind(&self, x: i32, y: i32) -> TileKind {
        if !self.is_in_bounds(x, y) {
            return TileKind::OutOfBounds;
        }
        self.cells[y as usize][x as usize]
    }

    pub fn is_valid_terrain(&self, x: i32, y: i32) -> bool {
        self.tile_kind(x, y).is_valid_terrain()
    }
}

/// One of the 8 octant directions used for avatar facing and furniture
/// seat-facing rotation. `East = 0`, proceeding clockwise by π/4 steps, per
/// spec §4.4's direction quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Octant {
    East = 0,
    SouthEast = 1,
    South = 2,
    SouthWest = 3,
    West = 4,
    NorthWest = 5,
    North = 6,
    NorthEast = 7,
}

impl Octant {
    pub fn from_index(idx: u8) -> Self {
        match idx % 8 {
            0 => Octant::East,
            1 => Octant::SouthEast,
            2 => Octant::South,
            3 => Octant::SouthWest,
            4 => Octant::West,
            5 => Octant::NorthWest,
            6 => Octant::North,
            _ => Octant::NorthEast,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Unit delta `(dx, dy)` for this facing, screen/grid coordinates (y grows
    /// downward, matching `Layout`'s row-major storage).
    pub fn delta(self) -> (i32, i32) {
        match self {
            Octant::East => (1, 0),
            Octant::SouthEast => (1, 1),
            Octant::South => (0, 1),
            Octant::SouthWest => (-1, 1),
            Octant::West => (-1, 0),
            Octant::NorthWest => (-1, -1),
            Octant::North => (0, -1),
            Octant::NorthEast => (1, -1),
        }
    }

    /// This octant rotated by `steps` increments of 45 degrees.
    pub fn rotate(self, steps: u8) -> Self {
        Octant::from_index(self.index().wrapping_add(steps))
    }

    pub fn opposite(self) -> Self {
        self.rotate(4)
    }

    /// Quantize a continuous heading (`atan2(dy, dx)`) into the nearest
    /// octant using π/8 bisectors, per spec §4.4.
    pub fn from_heading(dy: f64, dx: f64) -> Self {
        if dx == 0.0 && dy == 0.0 {
            return Octant::East;
        }
        let angle = dy.atan2(dx); // (-pi, pi], 0 = East, increasing clockwise toward South since y grows downward
        let step = std::f64::consts::PI / 4.0;
        let idx = ((angle / step).round() as i64).rem_euclid(8) as u8;
        Octant::from_index(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_grid(cols: usize, rows: usize) -> Layout {
        Layout::new(vec![vec![TileKind::Floor; cols]; rows]).unwrap()
    }

    #[test]
    fn bounds_check_rejects_negative_and_overflowing_coords() {
        let g = floor_grid(6, 6);
        assert!(g.is_in_bounds(0, 0));
        assert!(g.is_in_bounds(5, 5));
        assert!(!g.is_in_bounds(6, 0));
        assert!(!g.is_in_bounds(-1, 0));
    }

    #[test]
    fn out_of_bounds_tile_kind_is_distinct_from_wall() {
        let g = floor_grid(3, 3);
        assert_eq!(g.tile_kind(10, 10), TileKind::OutOfBounds);
        assert!(!g.is_valid_terrain(10, 10));
    }

    #[test]
    fn floor_and_alt_floor_are_valid_terrain_wall_and_hole_are_not() {
        let g = Layout::new(vec![vec![
            TileKind::Floor,
            TileKind::AltFloor,
            TileKind::Wall,
            TileKind::Hole,
        ]])
        .unwrap();
        assert!(g.is_valid_terrain(0, 0));
        assert!(g.is_valid_terrain(1, 0));
        assert!(!g.is_valid_terrain(2, 0));
        assert!(!g.is_valid_terrain(3, 0));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = Layout::new(vec![vec![TileKind::Floor; 3], vec![TileKind::Floor; 2]])
            .expect_err("ragged grid must fail");
        assert!(matches!(err, GridError::DimensionMismatch { .. }));
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert!(matches!(Layout::new(vec![]), Err(GridError::Empty)));
        assert!(matches!(Layout::new(vec![vec![]]), Err(GridError::Empty)));
    }

    #[test]
    fn fallback_layout_is_a_single_wall() {
        let g = Layout::fallback_single_wall();
        assert_eq!(g.cols(), 1);
        assert_eq!(g.rows(), 1);
        assert_eq!(g.tile_kind(0, 0), TileKind::Wall);
    }

    #[test]
    fn rotating_an_octant_eight_times_returns_to_origin() {
        let mut o = Octant::South;
        for _ in 0..8 {
            o = o.rotate(1);
        }
        assert_eq!(o, Octant::South);
    }

    #[test]
    fn opposite_of_south_is_north() {
        assert_eq!(Octant::South.opposite(), Octant::North);
        assert_eq!(Octant::East.opposite(), Octant::West);
    }

    #[test]
    fn heading_quantizes_cardinal_directions() {
        assert_eq!(Octant::from_heading(0.0, 1.0), Octant::East);
        assert_eq!(Octant::from_heading(1.0, 0.0), Octant::South);
        assert_eq!(Octant::from_heading(0.0, -1.0), Octant::West);
        assert_eq!(Octant::from_heading(-1.0, 0.0), Octant::North);
    }

    #[test]
    fn wire_encoding_round_trips_numeric_and_hole_string() {
        let g = Layout::new(vec![vec![
            TileKind::Floor,
            TileKind::Wall,
            TileKind::AltFloor,
            TileKind::Hole,
        ]])
        .unwrap();
        let json = serde_json::to_string(&g).unwrap();
        assert!(json.contains('0'));
        assert!(json.contains('1'));
        assert!(json.contains('2'));
        assert!(json.contains("\"X\""));
        let back: Layout = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tile_kind(3, 0), TileKind::Hole);
    }
}
