//! Proximity grid for efficient spatial queries in crowd simulation
//!
//! A fixed-capacity spatial hash on the xz-plane. Items are rasterized into
//! every cell their bounds overlap and chained per hash bucket through a flat
//! item pool, so rebuilding the grid every tick never allocates.

use nav_common::{next_pow2, Error, Result};

/// Marks the end of a bucket chain
const NULL_IDX: usize = usize::MAX;

/// Grid item stored in the pool
#[derive(Debug, Clone, Copy)]
struct GridItem {
    x: i32,
    y: i32,
    id: usize,
    next: usize,
}

/// Proximity grid for efficient spatial queries
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    /// Cell size in world units
    cell_size: f32,
    inv_cell_size: f32,
    /// Item pool, chained per bucket
    pool: Vec<GridItem>,
    pool_size: usize,
    /// Head of each bucket chain
    buckets: Vec<usize>,
    /// Occupied cell range (min x, min y, max x, max y)
    bounds: [i32; 4],
}

impl ProximityGrid {
    /// Creates a grid holding at most `pool_size` item-cell entries
    pub fn new(pool_size: usize, cell_size: f32) -> Result<Self> {
        if pool_size == 0 {
            return Err(Error::InvalidParam("proximity grid pool must not be empty".into()));
        }
        if cell_size <= 0.0 {
            return Err(Error::InvalidParam(format!(
                "proximity grid cell size must be positive, got {cell_size}"
            )));
        }

        let buckets_size = next_pow2(pool_size as u32) as usize;
        let mut grid = Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            pool: Vec::with_capacity(pool_size),
            pool_size,
            buckets: vec![NULL_IDX; buckets_size],
            bounds: [0; 4],
        };
        grid.clear();
        Ok(grid)
    }

    /// Empties all buckets and rewinds the pool
    pub fn clear(&mut self) {
        self.buckets.fill(NULL_IDX);
        self.pool.clear();
        self.bounds = [i32::MAX, i32::MAX, i32::MIN, i32::MIN];
    }

    /// Adds `id` to every cell overlapped by the rectangle.
    /// Entries beyond the pool capacity are silently dropped.
    pub fn add_item(&mut self, id: usize, min_x: f32, min_y: f32, max_x: f32, max_y: f32) {
        let iminx = (min_x * self.inv_cell_size).floor() as i32;
        let iminy = (min_y * self.inv_cell_size).floor() as i32;
        let imaxx = (max_x * self.inv_cell_size).floor() as i32;
        let imaxy = (max_y * self.inv_cell_size).floor() as i32;

        self.bounds[0] = self.bounds[0].min(iminx);
        self.bounds[1] = self.bounds[1].min(iminy);
        self.bounds[2] = self.bounds[2].max(imaxx);
        self.bounds[3] = self.bounds[3].max(imaxy);

        for y in iminy..=imaxy {
            for x in iminx..=imaxx {
                if self.pool.len() >= self.pool_size {
                    return;
                }
                let h = self.hash(x, y);
                let idx = self.pool.len();
                self.pool.push(GridItem {
                    x,
                    y,
                    id,
                    next: self.buckets[h],
                });
                self.buckets[h] = idx;
            }
        }
    }

    /// Collects the unique ids overlapping the rectangle into `ids`,
    /// stopping at `max_ids`. Returns the number of ids found.
    pub fn query_items(
        &self,
        min_x: f32,
        min_y: f32,
        max_x: f32,
        max_y: f32,
        ids: &mut Vec<usize>,
        max_ids: usize,
    ) -> usize {
        ids.clear();
        let iminx = (min_x * self.inv_cell_size).floor() as i32;
        let iminy = (min_y * self.inv_cell_size).floor() as i32;
        let imaxx = (max_x * self.inv_cell_size).floor() as i32;
        let imaxy = (max_y * self.inv_cell_size).floor() as i32;

        for y in iminy..=imaxy {
            for x in iminx..=imaxx {
                let mut idx = self.buckets[self.hash(x, y)];
                while idx != NULL_IDX {
                    let item = &self.pool[idx];
                    if item.x == x && item.y == y && !ids.contains(&item.id) {
                        if ids.len() >= max_ids {
                            return ids.len();
                        }
                        ids.push(item.id);
                    }
                    idx = item.next;
                }
            }
        }
        ids.len()
    }

    /// Number of entries stored in cell (x, y)
    pub fn item_count_at(&self, x: i32, y: i32) -> usize {
        let mut count = 0;
        let mut idx = self.buckets[self.hash(x, y)];
        while idx != NULL_IDX {
            let item = &self.pool[idx];
            if item.x == x && item.y == y {
                count += 1;
            }
            idx = item.next;
        }
        count
    }

    /// Occupied cell range as (min x, min y, max x, max y). Inverted while
    /// the grid is empty.
    pub fn bounds(&self) -> [i32; 4] {
        self.bounds
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of pool entries in use
    pub fn item_count(&self) -> usize {
        self.pool.len()
    }

    fn hash(&self, x: i32, y: i32) -> usize {
        let h1 = x.wrapping_mul(73_856_093);
        let h2 = y.wrapping_mul(19_349_663);
        ((h1 ^ h2) as u32 as usize) & (self.buckets.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_params() {
        assert!(ProximityGrid::new(0, 1.0).is_err());
        assert!(ProximityGrid::new(16, 0.0).is_err());
    }

    #[test]
    fn test_disjoint_items_are_found_once() -> Result<()> {
        let mut grid = ProximityGrid::new(64, 1.0)?;
        for i in 0..5 {
            let x = i as f32 * 2.0 + 0.25;
            grid.add_item(i, x, 0.25, x + 0.5, 0.75);
        }

        let mut ids = Vec::new();
        let n = grid.query_items(0.0, 0.0, 10.0, 1.0, &mut ids, 32);
        assert_eq!(n, 5);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_spanning_item_is_deduplicated() -> Result<()> {
        let mut grid = ProximityGrid::new(64, 1.0)?;
        // Covers a 4x4 block of cells.
        grid.add_item(7, -1.5, -1.5, 1.5, 1.5);
        assert_eq!(grid.item_count(), 16);
        assert_eq!(grid.item_count_at(0, 0), 1);
        assert_eq!(grid.bounds(), [-2, -2, 1, 1]);

        let mut ids = Vec::new();
        assert_eq!(grid.query_items(-2.0, -2.0, 2.0, 2.0, &mut ids, 32), 1);
        assert_eq!(ids, vec![7]);
        Ok(())
    }

    #[test]
    fn test_query_stops_at_max_ids() -> Result<()> {
        let mut grid = ProximityGrid::new(64, 4.0)?;
        for i in 0..10 {
            grid.add_item(i, 0.5, 0.5, 1.0, 1.0);
        }
        let mut ids = Vec::new();
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, &mut ids, 3), 3);
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_drops_items() -> Result<()> {
        let mut grid = ProximityGrid::new(4, 1.0)?;
        for i in 0..6 {
            grid.add_item(i, i as f32 + 0.5, 0.5, i as f32 + 0.5, 0.5);
        }
        assert_eq!(grid.item_count(), 4);

        let mut ids = Vec::new();
        assert_eq!(grid.query_items(0.0, 0.0, 10.0, 1.0, &mut ids, 32), 4);
        assert!(!ids.contains(&5));
        Ok(())
    }

    #[test]
    fn test_clear_resets_grid() -> Result<()> {
        let mut grid = ProximityGrid::new(16, 2.0)?;
        grid.add_item(1, 0.0, 0.0, 1.0, 1.0);
        grid.clear();
        assert_eq!(grid.item_count(), 0);
        assert_eq!(grid.item_count_at(0, 0), 0);
        assert_eq!(grid.bounds(), [i32::MAX, i32::MAX, i32::MIN, i32::MIN]);

        let mut ids = Vec::new();
        assert_eq!(grid.query_items(-5.0, -5.0, 5.0, 5.0, &mut ids, 8), 0);
        Ok(())
    }

    #[test]
    fn test_negative_coordinates() -> Result<()> {
        let mut grid = ProximityGrid::new(32, 1.0)?;
        grid.add_item(3, -10.4, -7.6, -10.2, -7.4);
        let mut ids = Vec::new();
        assert_eq!(grid.query_items(-11.0, -8.0, -10.0, -7.0, &mut ids, 8), 1);
        assert_eq!(grid.query_items(10.0, 7.0, 11.0, 8.0, &mut ids, 8), 0);
        Ok(())
    }
}
