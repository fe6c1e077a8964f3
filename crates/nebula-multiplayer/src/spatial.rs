//! Spatial lookup from world position to nearby entity handles.

use rustc_hash::FxHashMap;

use crate::movement::{BoundingBox, Position};
use crate::world::NetworkId;

/// Default grid cell edge length in world units.
pub const DEFAULT_CELL_SIZE: f32 = 16.0;

/// Position-to-handles lookup used by the AOI tracker.
pub trait SpatialIndex {
    /// Inserts or moves `id` to `bounds`.
    fn update(&mut self, id: NetworkId, bounds: BoundingBox);

    /// Forgets `id`. Unknown ids are ignored.
    fn remove(&mut self, id: NetworkId);

    /// Every entity whose centre lies within `radius` of `position`
    /// (inclusive), sorted by handle.
    fn entities_within(&self, position: Position, radius: f32) -> Vec<NetworkId>;

    /// Current centre of `id`.
    fn position_of(&self, id: NetworkId) -> Option<Position>;
}

type Cell = (i32, i32, i32);

/// Uniform hash grid keyed by cell coordinate.
#[derive(Debug, Clone)]
pub struct GridSpatialIndex {
    cell_size: f32,
    cells: FxHashMap<Cell, Vec<NetworkId>>,
    entries: FxHashMap<NetworkId, (Cell, Position)>,
}

impl GridSpatialIndex {
    /// Creates an empty grid with cells of `cell_size` units.
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self {
            cell_size,
            cells: FxHashMap::default(),
            entries: FxHashMap::default(),
        }
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn coord(&self, v: f32) -> i32 {
        (v / self.cell_size).floor() as i32
    }

    fn cell_of(&self, p: Position) -> Cell {
        (self.coord(p.x), self.coord(p.y), self.coord(p.z))
    }

    fn detach(&mut self, id: NetworkId, cell: Cell) {
        if let Some(members) = self.cells.get_mut(&cell) {
            members.retain(|m| *m != id);
            if members.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }
}

impl Default for GridSpatialIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl SpatialIndex for GridSpatialIndex {
    fn update(&mut self, id: NetworkId, bounds: BoundingBox) {
        let center = bounds.center();
        let cell = self.cell_of(center);
        if let Some((old_cell, _)) = self.entries.get(&id).copied()
            && old_cell != cell
        {
            self.detach(id, old_cell);
            self.cells.entry(cell).or_default().push(id);
        } else if !self.entries.contains_key(&id) {
            self.cells.entry(cell).or_default().push(id);
        }
        self.entries.insert(id, (cell, center));
    }

    fn remove(&mut self, id: NetworkId) {
        if let Some((cell, _)) = self.entries.remove(&id) {
            self.detach(id, cell);
        }
    }

    fn entities_within(&self, position: Position, radius: f32) -> Vec<NetworkId> {
        let lo = self.cell_of(Position::new(
            position.x - radius,
            position.y - radius,
            position.z - radius,
        ));
        let hi = self.cell_of(Position::new(
            position.x + radius,
            position.y + radius,
            position.z + radius,
        ));

        let mut found = Vec::new();
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                for cz in lo.2..=hi.2 {
                    let Some(members) = self.cells.get(&(cx, cy, cz)) else {
                        continue;
                    };
                    for id in members {
                        if let Some((_, center)) = self.entries.get(id)
                            && center.within(&position, radius)
                        {
                            found.push(*id);
                        }
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }

    fn position_of(&self, id: NetworkId) -> Option<Position> {
        self.entries.get(&id).map(|(_, p)| *p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::Collision;

    fn place(index: &mut GridSpatialIndex, id: u64, x: f32) {
        index.update(
            NetworkId(id),
            Collision::default().bounds_at(Position::new(x, 0.0, 0.0)),
        );
    }

    #[test]
    fn test_query_is_inclusive_and_sorted() {
        let mut index = GridSpatialIndex::new(16.0);
        place(&mut index, 9, 50.0);
        place(&mut index, 2, -10.0);
        place(&mut index, 5, 51.0);
        let found = index.entities_within(Position::default(), 50.0);
        assert_eq!(found, vec![NetworkId(2), NetworkId(9)]);
    }

    #[test]
    fn test_move_across_cells() {
        let mut index = GridSpatialIndex::new(4.0);
        place(&mut index, 1, 0.0);
        place(&mut index, 1, 100.0);
        assert!(index.entities_within(Position::default(), 10.0).is_empty());
        assert_eq!(
            index.entities_within(Position::new(100.0, 0.0, 0.0), 1.0),
            vec![NetworkId(1)]
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_forgets_entity() {
        let mut index = GridSpatialIndex::default();
        place(&mut index, 3, 1.0);
        index.remove(NetworkId(3));
        index.remove(NetworkId(3));
        assert!(index.is_empty());
        assert!(index.position_of(NetworkId(3)).is_none());
        assert!(index.entities_within(Position::default(), 10.0).is_empty());
    }
}
