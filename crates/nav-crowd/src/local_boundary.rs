//! Cached wall segments around an agent

use glam::Vec3;
use nav_common::{dist_pt_seg_sqr_2d, insert_bounded, sqr, Result};
use nav_query::{NavMeshQuery, PolyRef, QueryFilter, WallSegment};

pub const MAX_LOCAL_SEGS: usize = 8;
pub const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    /// Segment start and end
    s: WallSegment,
    /// Squared distance for pruning
    d: f32,
}

#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: Vec3,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: Vec3::splat(f32::MAX),
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    /// Forgets all cached data. The next drift check always triggers.
    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects the walls within `collision_query_range` of `pos`, closest
    /// first.
    pub fn update<Q: NavMeshQuery>(
        &mut self,
        poly_ref: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = pos;
        self.segs.clear();

        navquery.find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
            &mut self.polys,
        )?;

        let range_sqr = sqr(collision_query_range);
        let mut walls = Vec::new();
        for &poly in &self.polys {
            walls.clear();
            navquery.get_poly_wall_segments(poly, filter, &mut walls)?;
            for &s in &walls {
                let (d, _) = dist_pt_seg_sqr_2d(pos, s[0], s[1]);
                if d > range_sqr {
                    continue;
                }
                insert_bounded(&mut self.segs, MAX_LOCAL_SEGS, Segment { s, d }, |a, b| a.d <= b.d);
            }
        }

        Ok(())
    }

    /// Returns false when the cache is empty or any cached polygon is no
    /// longer traversable.
    pub fn is_valid<Q: NavMeshQuery>(&self, navquery: &Q, filter: &QueryFilter) -> bool {
        if self.polys.is_empty() {
            return false;
        }
        self.polys.iter().all(|&poly| navquery.is_valid_poly_ref(poly, filter))
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, i: usize) -> Option<&WallSegment> {
        self.segs.get(i).map(|seg| &seg.s)
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys
    }
}
