//! Path corridor implementation
//!
//! A corridor is the list of polygons an agent intends to cross, from the
//! polygon containing its position to the polygon containing its target.
//! Local movement is applied to the corridor as it happens, so the path only
//! needs to be searched again when the corridor becomes invalid.

use glam::Vec3;
use log::trace;
use nav_common::{dist_2d, dist_2d_sqr, sqr};
use nav_query::{NavMeshQuery, PolyRef, QueryFilter, StraightPathPoint};

/// Corners closer than this to the position are skipped
const MIN_TARGET_DIST: f32 = 0.01;

/// Polygons visited by a single surface move
const MAX_VISITED: usize = 16;

/// Polygons gathered by the visibility raycast
const MAX_RAYCAST_RES: usize = 32;

/// Result size of a topology optimization search
const MAX_TOPOLOGY_RES: usize = 32;

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position in the corridor
    pos: Vec3,
    /// Target position in the corridor
    target: Vec3,
    /// Path polygon references
    path: Vec<PolyRef>,
    max_path: usize,
}

/// Result of moving a corridor over an off-mesh connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffMeshTraversal {
    /// Polygon before the connection and the connection itself
    pub refs: [PolyRef; 2],
    pub start: Vec3,
    pub end: Vec3,
}

impl PathCorridor {
    /// Creates a corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        assert!(max_path > 0, "corridor capacity must be positive");
        Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::with_capacity(max_path),
            max_path,
        }
    }

    /// Collapses the corridor to the single polygon `poly_ref`
    pub fn reset(&mut self, poly_ref: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        self.path.push(poly_ref);
    }

    /// Replaces the whole corridor. The path must start at the polygon
    /// containing the current position.
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        assert!(!path.is_empty(), "corridor path must not be empty");
        assert!(
            path.len() <= self.max_path,
            "corridor path of {} polygons exceeds capacity {}",
            path.len(),
            self.max_path
        );
        self.target = target;
        self.path.clear();
        self.path.extend_from_slice(path);
    }

    /// Finds up to `max_corners` straight path corners ahead of the position.
    ///
    /// Corners within `MIN_TARGET_DIST` are dropped and the list ends at the
    /// first off-mesh connection corner.
    pub fn find_corners<Q: NavMeshQuery>(
        &self,
        corners: &mut Vec<StraightPathPoint>,
        max_corners: usize,
        navquery: &Q,
    ) -> usize {
        if navquery
            .find_straight_path(self.pos, self.target, &self.path, max_corners, corners)
            .is_err()
        {
            corners.clear();
            return 0;
        }

        let prune = corners
            .iter()
            .take_while(|c| {
                !c.is_offmesh_connection() && dist_2d_sqr(c.pos, self.pos) <= sqr(MIN_TARGET_DIST)
            })
            .count();
        corners.drain(..prune);

        if let Some(i) = corners.iter().position(|c| c.is_offmesh_connection()) {
            corners.truncate(i + 1);
        }

        corners.len()
    }

    /// Shortcuts the corridor when `next` is directly visible from the
    /// current position.
    ///
    /// The ray is stretched to `path_optimization_range`, so a shortcut is
    /// only taken across open areas.
    pub fn optimize_path_visibility<Q: NavMeshQuery>(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        navquery: &Q,
        filter: &QueryFilter,
    ) {
        let mut dist = dist_2d(self.pos, next);

        // Too close to the goal to bother.
        if dist < 0.01 {
            return;
        }

        // Overshoot a little. This helps to optimize open fields in tiled meshes.
        dist = (dist + 0.01).min(path_optimization_range);

        let delta = next - self.pos;
        let goal = self.pos + delta * (path_optimization_range / dist);

        let hit = match navquery.raycast(self.path[0], self.pos, goal, filter, MAX_RAYCAST_RES) {
            Ok(hit) => hit,
            Err(err) => {
                trace!("visibility raycast failed: {err}");
                return;
            }
        };

        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }
    }

    /// Re-searches the corridor with a sliced search of at most
    /// `max_iterations` and splices the result onto the front. Returns true
    /// when the corridor was updated.
    pub fn optimize_path_topology<Q: NavMeshQuery>(
        &mut self,
        navquery: &mut Q,
        filter: &QueryFilter,
        max_iterations: usize,
    ) -> bool {
        if self.path.len() < 3 {
            return false;
        }

        let last = self.path[self.path.len() - 1];
        navquery.init_sliced_find_path(self.path[0], last, self.pos, self.target, filter);
        navquery.update_sliced_find_path(max_iterations);

        let mut res = Vec::with_capacity(MAX_TOPOLOGY_RES);
        let status = navquery.finalize_sliced_find_path_partial(&self.path, &mut res, MAX_TOPOLOGY_RES);

        if status.is_success() && !res.is_empty() {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &res);
            return true;
        }
        false
    }

    /// Advances the corridor over the off-mesh connection `offmesh_con_ref`.
    ///
    /// Returns `None` when the connection is not part of the corridor.
    pub fn move_over_offmesh_connection<Q: NavMeshQuery>(
        &mut self,
        offmesh_con_ref: PolyRef,
        navquery: &Q,
    ) -> Option<OffMeshTraversal> {
        // Advance the path up to and over the off-mesh connection.
        let mut prev_ref = PolyRef::NULL;
        let mut poly_ref = self.path[0];
        let mut npos = 0;
        while npos < self.path.len() && poly_ref != offmesh_con_ref {
            prev_ref = poly_ref;
            poly_ref = self.path[npos];
            npos += 1;
        }
        if npos == self.path.len() {
            return None;
        }

        self.path.drain(..npos);

        match navquery.get_off_mesh_connection_poly_end_points(prev_ref, poly_ref) {
            Ok((start, end)) => {
                self.pos = end;
                Some(OffMeshTraversal {
                    refs: [prev_ref, poly_ref],
                    start,
                    end,
                })
            }
            Err(err) => {
                trace!("off-mesh endpoints unavailable for {poly_ref:?}: {err}");
                None
            }
        }
    }

    /// Moves the position along the mesh surface toward `npos`, pruning the
    /// corridor start accordingly. Returns false if the move failed.
    pub fn move_position<Q: NavMeshQuery>(&mut self, npos: Vec3, navquery: &Q, filter: &QueryFilter) -> bool {
        let mut visited = Vec::with_capacity(MAX_VISITED);
        let Ok(mut result) =
            navquery.move_along_surface(self.path[0], self.pos, npos, filter, &mut visited, MAX_VISITED)
        else {
            return false;
        };

        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        // Stay on top of the mesh.
        if let Ok(h) = navquery.get_poly_height(self.path[0], result) {
            result.y = h;
        }
        self.pos = result;
        true
    }

    /// Moves the target along the mesh surface toward `npos`, extending the
    /// corridor end accordingly. Returns false if the move failed.
    pub fn move_target_position<Q: NavMeshQuery>(
        &mut self,
        npos: Vec3,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> bool {
        let last = self.path[self.path.len() - 1];
        let mut visited = Vec::with_capacity(MAX_VISITED);
        let Ok(result) = navquery.move_along_surface(last, self.target, npos, filter, &mut visited, MAX_VISITED)
        else {
            return false;
        };

        merge_corridor_end_moved(&mut self.path, self.max_path, &visited);
        self.target = result;
        true
    }

    /// Rebinds the corridor start after the agent was relocated to a safe
    /// polygon.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        match self.path.first_mut() {
            Some(first) => *first = safe_ref,
            None => self.path.push(safe_ref),
        }
    }

    /// Keeps the longest valid prefix of the corridor and clamps the target
    /// into its last polygon.
    pub fn trim_invalid_path<Q: NavMeshQuery>(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        navquery: &Q,
        filter: &QueryFilter,
    ) {
        let n = self
            .path
            .iter()
            .take_while(|&&poly| navquery.is_valid_poly_ref(poly, filter))
            .count();

        if n == self.path.len() {
            return;
        }
        if n == 0 {
            // The first polygon is bad, use the safe values.
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        let last = self.path[self.path.len() - 1];
        if let Ok(target) = navquery.closest_point_on_poly_boundary(last, self.target) {
            self.target = target;
        }
    }

    /// Checks the first `max_look_ahead` polygons against the filter
    pub fn is_valid<Q: NavMeshQuery>(&self, max_look_ahead: usize, navquery: &Q, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&poly| navquery.is_valid_poly_ref(poly, filter))
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    /// Polygon containing the position
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    /// Polygon containing the target
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    pub fn max_path(&self) -> usize {
        self.max_path
    }
}

/// Furthest polygon of `path` that also appears in `visited`, scanning the
/// path from the end. Returns (path index, first visited index).
fn furthest_common_from_end(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, p)| visited.iter().position(|v| v == p).map(|j| (i, j)))
}

/// Merges the polygons visited while the position moved onto the corridor
/// start. The last visited polygon becomes the new first polygon.
///
/// The path is left untouched when the two lists share no polygon.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return path.len();
    };

    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[furthest_path + 1..]);
    merged.truncate(max_path);
    *path = merged;
    path.len()
}

/// Merges the polygons visited while the target moved onto the corridor end
///
/// The path is left untouched when the two lists share no polygon.
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let common = path
        .iter()
        .enumerate()
        .find_map(|(i, p)| visited.iter().position(|v| v == p).map(|j| (i, j)));
    let Some((furthest_path, furthest_visited)) = common else {
        return path.len();
    };

    path.truncate(furthest_path + 1);
    let count = (visited.len() - (furthest_visited + 1)).min(max_path.saturating_sub(path.len()));
    path.extend_from_slice(&visited[furthest_visited + 1..furthest_visited + 1 + count]);
    path.len()
}

/// Replaces the corridor start with a shortcut that rejoins the path
///
/// The path is left untouched when the two lists share no polygon or the
/// shortcut rejoins at its own first polygon.
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return path.len();
    };
    if furthest_visited == 0 {
        return path.len();
    }

    let mut merged = visited[..furthest_visited].to_vec();
    merged.extend_from_slice(&path[furthest_path..]);
    merged.truncate(max_path);
    *path = merged;
    path.len()
}
