//! The navigation mesh query capability consumed by the crowd engine

use bitflags::bitflags;
use glam::Vec3;
use nav_common::Result;

use crate::{PolyRef, QueryFilter, QueryStatus};

bitflags! {
    /// Flags attached to each straight path point
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StraightPathFlags: u8 {
        /// The point is the start position of the path
        const START = 0x01;
        /// The point is the end position of the path
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// A corner of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon entered at this point (`PolyRef::NULL` for the path end)
    pub poly: PolyRef,
}

impl StraightPathPoint {
    pub fn new(pos: Vec3, flags: StraightPathFlags, poly: PolyRef) -> Self {
        Self { pos, flags, poly }
    }

    pub fn is_offmesh_connection(&self) -> bool {
        self.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
    }

    pub fn is_end(&self) -> bool {
        self.flags.contains(StraightPathFlags::END)
    }
}

/// Result of a navigation mesh raycast
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the ray, as a fraction of its length.
    /// `f32::MAX` when the ray reached its end without hitting a wall.
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: Vec3,
    /// Polygons visited by the ray, starting with the start polygon
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    pub fn no_hit(path: Vec<PolyRef>) -> Self {
        Self {
            t: f32::MAX,
            hit_normal: Vec3::ZERO,
            path,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.t < f32::MAX
    }
}

/// A wall segment of a polygon
pub type WallSegment = [Vec3; 2];

/// Navigation mesh query operations.
///
/// Sliced pathfinding keeps its progress inside the implementor, so a single
/// instance can only run one sliced search at a time. All other operations are
/// stateless with respect to the query.
pub trait NavMeshQuery {
    /// Resizes the search node pool, discarding any sliced search in progress
    fn set_max_nodes(&mut self, max_nodes: usize);

    /// Finds the polygon nearest to `center` within `half_extents`.
    ///
    /// Returns `Ok(None)` when no polygon overlaps the search box.
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, Vec3)>>;

    /// Returns true if `poly` exists and passes `filter`
    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool;

    /// Starts a sliced path search
    fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> QueryStatus;

    /// Runs at most `max_iter` search iterations.
    ///
    /// Returns the new status and the number of iterations performed.
    fn update_sliced_find_path(&mut self, max_iter: usize) -> (QueryStatus, usize);

    /// Finishes the search and writes the best polygon path found into `path`
    fn finalize_sliced_find_path(&mut self, path: &mut Vec<PolyRef>, max_path: usize) -> QueryStatus;

    /// Finishes the search, ending the result at the furthest polygon of
    /// `existing` that the search visited
    fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        path: &mut Vec<PolyRef>,
        max_path: usize,
    ) -> QueryStatus;

    /// Extracts the straight path corners along a polygon corridor
    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
        points: &mut Vec<StraightPathPoint>,
    ) -> Result<QueryStatus>;

    /// Casts a ray from `start_pos` toward `end_pos` along the mesh surface
    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit>;

    /// Moves from `start_pos` toward `end_pos` constrained to the mesh.
    ///
    /// Returns the reached position and writes the visited polygons into
    /// `visited`, ordered from the start polygon to the final one.
    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        visited: &mut Vec<PolyRef>,
        max_visited: usize,
    ) -> Result<Vec3>;

    /// Closest point on the polygon, with height
    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3>;

    /// Closest point on the polygon boundary, or `pos` itself if it lies inside
    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3>;

    /// Height of the polygon surface below/above `pos`
    fn get_poly_height(&self, poly: PolyRef, pos: Vec3) -> Result<f32>;

    /// Appends the wall segments of `poly` to `segments`
    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &QueryFilter,
        segments: &mut Vec<WallSegment>,
    ) -> Result<()>;

    /// Finds non-overlapping polygons around `center` within `radius`
    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
        result: &mut Vec<PolyRef>,
    ) -> Result<()>;

    /// Start and end points of an off-mesh connection, oriented for travel
    /// coming from `prev_ref`
    fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)>;
}
