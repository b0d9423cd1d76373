//! Grid geometry.
//!
//! Square grid, 8-way movement, every step costs one movement point.
//! Distances are Chebyshev so range and movement agree.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

/// A cell on the combat grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev distance in cells.
    pub fn distance(&self, other: GridPos) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dy = (self.y as i64 - other.y as i64).unsigned_abs();
        dx.max(dy) as u32
    }

    pub fn neighbors(&self) -> impl Iterator<Item = GridPos> + '_ {
        const OFFSETS: [(i32, i32); 8] = [
            (-1, -1),
            (0, -1),
            (1, -1),
            (-1, 0),
            (1, 0),
            (-1, 1),
            (0, 1),
            (1, 1),
        ];
        OFFSETS
            .iter()
            .map(move |(dx, dy)| GridPos::new(self.x + dx, self.y + dy))
    }
}

impl std::fmt::Display for GridPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Grid dimensions and impassable cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSpec {
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub blocked: BTreeSet<GridPos>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self::open(12, 12)
    }
}

impl GridSpec {
    /// A grid with no blocked cells.
    pub fn open(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            blocked: BTreeSet::new(),
        }
    }

    pub fn with_blocked(mut self, cells: impl IntoIterator<Item = GridPos>) -> Self {
        self.blocked.extend(cells);
        self
    }

    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    /// In bounds and not blocked by terrain.
    pub fn is_walkable(&self, pos: GridPos) -> bool {
        self.in_bounds(pos) && !self.blocked.contains(&pos)
    }

    /// Movement cost from `from` to every cell reachable within `budget`.
    ///
    /// Cells in `occupied` can be neither entered nor passed through. The
    /// origin is included at cost 0.
    pub fn path_costs(
        &self,
        from: GridPos,
        occupied: &BTreeSet<GridPos>,
        budget: u32,
    ) -> BTreeMap<GridPos, u32> {
        let mut costs = BTreeMap::new();
        costs.insert(from, 0);

        let mut frontier = VecDeque::new();
        frontier.push_back(from);

        while let Some(cell) = frontier.pop_front() {
            let cost = costs[&cell];
            if cost >= budget {
                continue;
            }
            for next in cell.neighbors() {
                if costs.contains_key(&next) || !self.is_walkable(next) || occupied.contains(&next) {
                    continue;
                }
                costs.insert(next, cost + 1);
                frontier.push_back(next);
            }
        }

        costs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chebyshev_distance() {
        let a = GridPos::new(0, 0);
        assert_eq!(a.distance(GridPos::new(3, 1)), 3);
        assert_eq!(a.distance(GridPos::new(-2, -2)), 2);
        assert_eq!(a.distance(a), 0);
    }

    #[test]
    fn test_bounds_and_blocking() {
        let grid = GridSpec::open(4, 3).with_blocked([GridPos::new(1, 1)]);
        assert!(grid.is_walkable(GridPos::new(0, 0)));
        assert!(!grid.is_walkable(GridPos::new(1, 1)));
        assert!(!grid.in_bounds(GridPos::new(4, 0)));
        assert!(!grid.in_bounds(GridPos::new(0, -1)));
    }

    #[test]
    fn test_path_costs_respect_budget() {
        let grid = GridSpec::open(10, 10);
        let costs = grid.path_costs(GridPos::new(5, 5), &BTreeSet::new(), 2);

        assert_eq!(costs[&GridPos::new(5, 5)], 0);
        assert_eq!(costs[&GridPos::new(6, 6)], 1);
        assert_eq!(costs[&GridPos::new(7, 3)], 2);
        assert!(!costs.contains_key(&GridPos::new(8, 5)));
        // 5x5 square around the origin
        assert_eq!(costs.len(), 25);
    }

    #[test]
    fn test_path_costs_route_around_walls() {
        // Wall at x=1 except the top row
        let grid = GridSpec::open(3, 3).with_blocked([GridPos::new(1, 1), GridPos::new(1, 2)]);
        let costs = grid.path_costs(GridPos::new(0, 2), &BTreeSet::new(), 10);

        assert_eq!(costs[&GridPos::new(2, 2)], 4);
    }

    #[test]
    fn test_occupied_cells_block_paths() {
        let grid = GridSpec::open(5, 1);
        let occupied: BTreeSet<_> = [GridPos::new(2, 0)].into_iter().collect();
        let costs = grid.path_costs(GridPos::new(0, 0), &occupied, 10);

        assert!(costs.contains_key(&GridPos::new(1, 0)));
        assert!(!costs.contains_key(&GridPos::new(2, 0)));
        assert!(!costs.contains_key(&GridPos::new(3, 0)));
    }
}
