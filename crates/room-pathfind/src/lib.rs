//! A* over a room's dynamic walkability.
//!
//! This crate knows nothing about furniture or avatars: callers supply a
//! [`Walkable`] implementation (the room's furniture registry, composed with
//! its grid, implements this) so a furniture change invalidates paths
//! implicitly on the next query rather than requiring this crate to observe
//! mutation events.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

/// A 4-connected integer grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Supplies the only dynamic fact the search needs: can an avatar currently
/// stand on `(x, y)`.
pub trait Walkable {
    fn is_walkable(&self, x: i32, y: i32) -> bool;
}

fn manhattan(a: Cell, b: Cell) -> u32 {
    a.x.abs_diff(b.x) + a.y.abs_diff(b.y)
}

fn neighbors(c: Cell) -> [Cell; 4] {
    [
        Cell::new(c.x + 1, c.y),
        Cell::new(c.x - 1, c.y),
        Cell::new(c.x, c.y + 1),
        Cell::new(c.x, c.y - 1),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenEntry {
    f: u32,
    h: u32,
    cell: Cell,
}

// BinaryHeap is a max-heap; we want the lowest f (ties broken by lowest h) first.
impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .cmp(&self.f)
            .then_with(|| other.h.cmp(&self.h))
            .then_with(|| other.cell.cmp(&self.cell))
    }
}
impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Searches for a shortest 4-connected path from `start` to `goal` inclusive.
///
/// `cols * rows` bounds the hard node-expansion cap (`2 * cols * rows`,
/// spec §4.2); exceeding it returns `None` ("no path") rather than continuing
/// indefinitely.
#[tracing::instrument(level = "debug", skip(walkable), fields(cols, rows))]
pub fn find_path(
    walkable: &impl Walkable,
    start: Cell,
    goal: Cell,
    cols: usize,
    rows: usize,
) -> Option<Vec<Cell>> {
    if !walkable.is_walkable(start.x, start.y) || !walkable.is_walkable(goal.x, goal.y) {
        tracing::debug!(target: "room.pathfind", "start or goal not walkable");
        return None;
    }
    if start == goal {
        return Some(vec![start]);
    }

    let node_cap = 2usize.saturating_mul(cols.max(1)).saturating_mul(rows.max(1));
    let mut open = BinaryHeap::new();
    let mut g_score: BTreeMap<Cell, u32> = BTreeMap::new();
    let mut came_from: BTreeMap<Cell, Cell> = BTreeMap::new();
    let mut expanded = 0usize;

    g_score.insert(start, 0);
    open.push(OpenEntry {
        f: manhattan(start, goal),
        h: manhattan(start, goal),
        cell: start,
    });

    while let Some(OpenEntry { cell, .. }) = open.pop() {
        if cell == goal {
            return Some(reconstruct(&came_from, start, goal));
        }
        expanded += 1;
        if expanded > node_cap {
            tracing::debug!(target: "room.pathfind", node_cap, "exceeded node cap, no path");
            return None;
        }
        let cur_g = *g_score.get(&cell).expect("expanded node must have a g-score");
        for n in neighbors(cell) {
            if !walkable.is_walkable(n.x, n.y) {
                continue;
            }
            let tentative_g = cur_g + 1;
            if tentative_g < *g_score.get(&n).unwrap_or(&u32::MAX) {
                came_from.insert(n, cell);
                g_score.insert(n, tentative_g);
                open.push(OpenEntry {
                    f: tentative_g + manhattan(n, goal),
                    h: manhattan(n, goal),
                    cell: n,
                });
            }
        }
    }
    tracing::debug!(target: "room.pathfind", "open set exhausted, no path");
    None
}

fn reconstruct(came_from: &BTreeMap<Cell, Cell>, start: Cell, goal: Cell) -> Vec<Cell> {
    let mut cell = goal;
    let mut path = vec![cell];
    while cell != start {
        cell = *came_from
            .get(&cell)
            .expect("reconstructed path must terminate at start");
        path.push(cell);
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OpenField {
        cols: i32,
        rows: i32,
        blocked: Vec<Cell>,
    }
    impl Walkable for OpenField {
        fn is_walkable(&self, x: i32, y: i32) -> bool {
            x >= 0
                && y >= 0
                && x < self.cols
                && y < self.rows
                && !self.blocked.contains(&Cell::new(x, y))
        }
    }

    #[test]
    fn straight_line_path_on_open_field() {
        let field = OpenField { cols: 6, rows: 6, blocked: vec![] };
        let path = find_path(&field, Cell::new(1, 1), Cell::new(3, 2), 6, 6).unwrap();
        assert_eq!(path.first(), Some(&Cell::new(1, 1)));
        assert_eq!(path.last(), Some(&Cell::new(3, 2)));
        // Manhattan distance is 3, so the shortest path has 4 cells inclusive.
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn start_equal_to_goal_returns_single_cell_path() {
        let field = OpenField { cols: 6, rows: 6, blocked: vec![] };
        let path = find_path(&field, Cell::new(2, 2), Cell::new(2, 2), 6, 6).unwrap();
        assert_eq!(path, vec![Cell::new(2, 2)]);
    }

    #[test]
    fn unreachable_goal_behind_a_wall_returns_none() {
        let mut blocked = Vec::new();
        for y in 0..6 {
            blocked.push(Cell::new(3, y));
        }
        let field = OpenField { cols: 6, rows: 6, blocked };
        assert!(find_path(&field, Cell::new(0, 0), Cell::new(5, 5), 6, 6).is_none());
    }

    #[test]
    fn goal_outside_walkable_set_returns_none() {
        let field = OpenField { cols: 6, rows: 6, blocked: vec![Cell::new(5, 5)] };
        assert!(find_path(&field, Cell::new(0, 0), Cell::new(5, 5), 6, 6).is_none());
    }

    #[test]
    fn every_waypoint_of_a_successful_path_is_walkable() {
        let blocked = vec![Cell::new(2, 0), Cell::new(2, 1)];
        let field = OpenField { cols: 6, rows: 6, blocked };
        let path = find_path(&field, Cell::new(0, 0), Cell::new(4, 0), 6, 6).unwrap();
        for cell in &path {
            assert!(field.is_walkable(cell.x, cell.y));
        }
    }
}
