//! Uniform grid navigation mesh
//!
//! Every walkable cell of a `width x depth` grid is one square polygon, linked
//! to its four axis neighbours. Off-mesh links connect the cell containing the
//! link start with the cell containing the link end through a dedicated link
//! polygon, the same way baked meshes model jumps and teleports.
//!
//! Polygon references are `cell_index + 1` for cells and follow on after the
//! last cell for off-mesh links.

use std::collections::VecDeque;

use glam::Vec3;
use nav_common::{dist_pt_seg_sqr_2d, Error, Result};

use crate::node_pool::{NodeFlags, NodePool, NodeQueue};
use crate::{
    NavMeshQuery, PolyFlags, PolyRef, QueryFilter, QueryStatus, RaycastHit, StraightPathFlags,
    StraightPathPoint, WallSegment,
};

/// Heuristic scale used by the A* search
const H_SCALE: f32 = 0.999;

/// Nodes available to surface-constrained moves
const MAX_SURFACE_NODES: usize = 64;

/// Default number of A* nodes for a query
pub const DEFAULT_MAX_NODES: usize = 2048;

/// A single grid cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    pub walkable: bool,
    pub flags: PolyFlags,
    pub area: u8,
    /// Surface height relative to the mesh origin
    pub height: f32,
}

impl Default for GridCell {
    fn default() -> Self {
        Self {
            walkable: true,
            flags: PolyFlags::WALK,
            area: 0,
            height: 0.0,
        }
    }
}

/// A scripted link between two cells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffMeshLink {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub flags: PolyFlags,
    pub area: u8,
    start_cell: usize,
    end_cell: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolyKind {
    Cell { x: usize, z: usize },
    Link(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    South,
    West,
    North,
    East,
}

const DIRS: [Dir; 4] = [Dir::South, Dir::West, Dir::North, Dir::East];

impl Dir {
    fn normal(self) -> Vec3 {
        match self {
            Dir::South => Vec3::new(0.0, 0.0, -1.0),
            Dir::West => Vec3::new(-1.0, 0.0, 0.0),
            Dir::North => Vec3::new(0.0, 0.0, 1.0),
            Dir::East => Vec3::new(1.0, 0.0, 0.0),
        }
    }
}

/// Uniform grid navigation mesh
#[derive(Debug, Clone)]
pub struct GridNavMesh {
    origin: Vec3,
    cell_size: f32,
    width: usize,
    depth: usize,
    cells: Vec<GridCell>,
    links: Vec<OffMeshLink>,
}

/// Builder for [`GridNavMesh`]
#[derive(Debug, Clone)]
pub struct GridNavMeshBuilder {
    origin: Vec3,
    cell_size: f32,
    width: usize,
    depth: usize,
    cells: Vec<GridCell>,
    links: Vec<(Vec3, Vec3, f32, bool)>,
}

impl GridNavMeshBuilder {
    pub fn new(width: usize, depth: usize) -> Self {
        Self {
            origin: Vec3::ZERO,
            cell_size: 1.0,
            width,
            depth,
            cells: vec![GridCell::default(); width * depth],
            links: Vec::new(),
        }
    }

    /// Minimum corner of the grid
    pub fn with_origin(mut self, origin: Vec3) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_cell_size(mut self, cell_size: f32) -> Self {
        self.cell_size = cell_size;
        self
    }

    /// Marks a cell as not walkable
    pub fn with_blocked(mut self, x: usize, z: usize) -> Self {
        if let Some(cell) = self.cell_mut(x, z) {
            cell.walkable = false;
        }
        self
    }

    pub fn with_flags(mut self, x: usize, z: usize, flags: PolyFlags) -> Self {
        if let Some(cell) = self.cell_mut(x, z) {
            cell.flags = flags;
        }
        self
    }

    pub fn with_area(mut self, x: usize, z: usize, area: u8) -> Self {
        if let Some(cell) = self.cell_mut(x, z) {
            cell.area = area;
        }
        self
    }

    pub fn with_height(mut self, x: usize, z: usize, height: f32) -> Self {
        if let Some(cell) = self.cell_mut(x, z) {
            cell.height = height;
        }
        self
    }

    /// Adds an off-mesh link between two world positions
    pub fn with_off_mesh_link(mut self, start: Vec3, end: Vec3, radius: f32, bidirectional: bool) -> Self {
        self.links.push((start, end, radius, bidirectional));
        self
    }

    fn cell_mut(&mut self, x: usize, z: usize) -> Option<&mut GridCell> {
        if x < self.width && z < self.depth {
            self.cells.get_mut(z * self.width + x)
        } else {
            None
        }
    }

    pub fn build(self) -> Result<GridNavMesh> {
        if self.width == 0 || self.depth == 0 {
            return Err(Error::InvalidParam("grid must have at least one cell".into()));
        }
        if self.cell_size <= 0.0 {
            return Err(Error::InvalidParam(format!(
                "cell size must be positive, got {}",
                self.cell_size
            )));
        }

        let mut mesh = GridNavMesh {
            origin: self.origin,
            cell_size: self.cell_size,
            width: self.width,
            depth: self.depth,
            cells: self.cells,
            links: Vec::with_capacity(self.links.len()),
        };

        for (start, end, radius, bidirectional) in self.links {
            let start_cell = mesh.walkable_cell_index(start).ok_or_else(|| {
                Error::InvalidParam(format!("off-mesh link start {start} is not on a walkable cell"))
            })?;
            let end_cell = mesh.walkable_cell_index(end).ok_or_else(|| {
                Error::InvalidParam(format!("off-mesh link end {end} is not on a walkable cell"))
            })?;
            if start_cell == end_cell {
                return Err(Error::InvalidParam(
                    "off-mesh link must connect two different cells".into(),
                ));
            }
            mesh.links.push(OffMeshLink {
                start,
                end,
                radius,
                bidirectional,
                flags: PolyFlags::JUMP,
                area: 0,
                start_cell,
                end_cell,
            });
        }

        Ok(mesh)
    }
}

impl GridNavMesh {
    pub fn builder(width: usize, depth: usize) -> GridNavMeshBuilder {
        GridNavMeshBuilder::new(width, depth)
    }

    /// Fully walkable grid with its minimum corner at `origin`
    pub fn open(width: usize, depth: usize, cell_size: f32, origin: Vec3) -> Result<Self> {
        GridNavMeshBuilder::new(width, depth)
            .with_cell_size(cell_size)
            .with_origin(origin)
            .build()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn cell(&self, x: usize, z: usize) -> Option<&GridCell> {
        if x < self.width && z < self.depth {
            self.cells.get(z * self.width + x)
        } else {
            None
        }
    }

    pub fn links(&self) -> &[OffMeshLink] {
        &self.links
    }

    /// Reference of the cell at grid coordinates
    pub fn cell_ref(&self, x: usize, z: usize) -> PolyRef {
        if x < self.width && z < self.depth {
            PolyRef::new((z * self.width + x + 1) as u32)
        } else {
            PolyRef::NULL
        }
    }

    /// Reference of the `index`th off-mesh link
    pub fn link_ref(&self, index: usize) -> PolyRef {
        if index < self.links.len() {
            PolyRef::new((self.cells.len() + index + 1) as u32)
        } else {
            PolyRef::NULL
        }
    }

    /// Walkable cell polygon under `pos`, ignoring height
    pub fn poly_at(&self, pos: Vec3) -> PolyRef {
        match self.walkable_cell_index(pos) {
            Some(idx) => PolyRef::new(idx as u32 + 1),
            None => PolyRef::NULL,
        }
    }

    /// Center of a polygon. For links this is the midpoint of the link.
    pub fn poly_center(&self, poly: PolyRef) -> Option<Vec3> {
        match self.kind(poly)? {
            PolyKind::Cell { x, z } => {
                let (min, max) = self.cell_bounds(x, z);
                Some((min + max) * 0.5)
            }
            PolyKind::Link(k) => {
                let link = &self.links[k];
                Some((link.start + link.end) * 0.5)
            }
        }
    }

    /// Returns true if `pos` lies inside `poly` on the xz-plane
    pub fn contains_point(&self, poly: PolyRef, pos: Vec3) -> bool {
        const EPS: f32 = 1e-4;
        match self.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                let (min, max) = self.cell_bounds(x, z);
                pos.x >= min.x - EPS && pos.x <= max.x + EPS && pos.z >= min.z - EPS && pos.z <= max.z + EPS
            }
            _ => false,
        }
    }

    fn kind(&self, poly: PolyRef) -> Option<PolyKind> {
        let id = poly.id() as usize;
        if id == 0 {
            return None;
        }
        let idx = id - 1;
        if idx < self.cells.len() {
            Some(PolyKind::Cell {
                x: idx % self.width,
                z: idx / self.width,
            })
        } else if idx - self.cells.len() < self.links.len() {
            Some(PolyKind::Link(idx - self.cells.len()))
        } else {
            None
        }
    }

    fn cell_coords(&self, pos: Vec3) -> Option<(usize, usize)> {
        let fx = ((pos.x - self.origin.x) / self.cell_size).floor();
        let fz = ((pos.z - self.origin.z) / self.cell_size).floor();
        if fx < 0.0 || fz < 0.0 {
            return None;
        }
        let (x, z) = (fx as usize, fz as usize);
        if x < self.width && z < self.depth {
            Some((x, z))
        } else {
            None
        }
    }

    fn walkable_cell_index(&self, pos: Vec3) -> Option<usize> {
        let (x, z) = self.cell_coords(pos)?;
        let idx = z * self.width + x;
        self.cells[idx].walkable.then_some(idx)
    }

    fn cell_bounds(&self, x: usize, z: usize) -> (Vec3, Vec3) {
        let h = self.origin.y + self.cells[z * self.width + x].height;
        let min = Vec3::new(
            self.origin.x + x as f32 * self.cell_size,
            h,
            self.origin.z + z as f32 * self.cell_size,
        );
        (min, Vec3::new(min.x + self.cell_size, h, min.z + self.cell_size))
    }

    /// Edge of a cell, wound so walls face into the cell
    fn cell_edge(&self, x: usize, z: usize, dir: Dir) -> (Vec3, Vec3) {
        let (min, max) = self.cell_bounds(x, z);
        let y = min.y;
        match dir {
            Dir::South => (Vec3::new(max.x, y, min.z), Vec3::new(min.x, y, min.z)),
            Dir::West => (Vec3::new(min.x, y, min.z), Vec3::new(min.x, y, max.z)),
            Dir::North => (Vec3::new(min.x, y, max.z), Vec3::new(max.x, y, max.z)),
            Dir::East => (Vec3::new(max.x, y, max.z), Vec3::new(max.x, y, min.z)),
        }
    }

    fn cell_neighbour(&self, x: usize, z: usize, dir: Dir) -> Option<(usize, usize)> {
        match dir {
            Dir::South => z.checked_sub(1).map(|z| (x, z)),
            Dir::West => x.checked_sub(1).map(|x| (x, z)),
            Dir::North => (z + 1 < self.depth).then_some((x, z + 1)),
            Dir::East => (x + 1 < self.width).then_some((x + 1, z)),
        }
    }

    fn passable(&self, x: usize, z: usize, filter: &QueryFilter) -> bool {
        let cell = &self.cells[z * self.width + x];
        cell.walkable && filter.pass_filter(cell.flags)
    }

    fn poly_area(&self, poly: PolyRef) -> u8 {
        match self.kind(poly) {
            Some(PolyKind::Cell { x, z }) => self.cells[z * self.width + x].area,
            Some(PolyKind::Link(k)) => self.links[k].area,
            None => 0,
        }
    }

    fn is_valid(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        match self.kind(poly) {
            Some(PolyKind::Cell { x, z }) => self.passable(x, z, filter),
            Some(PolyKind::Link(k)) => filter.pass_filter(self.links[k].flags),
            None => false,
        }
    }

    /// Polygons reachable from `poly` in one step with their portal edges
    fn neighbours(&self, poly: PolyRef, filter: &QueryFilter) -> Vec<(PolyRef, Vec3, Vec3)> {
        let mut result = Vec::with_capacity(6);
        match self.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                for dir in DIRS {
                    if let Some((nx, nz)) = self.cell_neighbour(x, z, dir) {
                        if self.passable(nx, nz, filter) {
                            let (left, right) = self.cell_edge(x, z, dir);
                            result.push((self.cell_ref(nx, nz), left, right));
                        }
                    }
                }
                let idx = z * self.width + x;
                for (k, link) in self.links.iter().enumerate() {
                    if !filter.pass_filter(link.flags) {
                        continue;
                    }
                    if link.start_cell == idx {
                        result.push((self.link_ref(k), link.start, link.start));
                    } else if link.bidirectional && link.end_cell == idx {
                        result.push((self.link_ref(k), link.end, link.end));
                    }
                }
            }
            Some(PolyKind::Link(k)) => {
                let link = &self.links[k];
                let cells = [(link.end_cell, link.end), (link.start_cell, link.start)];
                let count = if link.bidirectional { 2 } else { 1 };
                for &(cell, point) in cells.iter().take(count) {
                    let (x, z) = (cell % self.width, cell / self.width);
                    if self.passable(x, z, filter) {
                        result.push((self.cell_ref(x, z), point, point));
                    }
                }
            }
            None => {}
        }
        result
    }

    /// Portal between two adjacent polygons, plus whether `to` is a link
    fn portal_points(&self, from: PolyRef, to: PolyRef) -> Option<(Vec3, Vec3, bool)> {
        let to_link = matches!(self.kind(to), Some(PolyKind::Link(_)));
        match self.kind(from)? {
            PolyKind::Cell { x, z } => match self.kind(to)? {
                PolyKind::Cell { x: tx, z: tz } => {
                    let dir = DIRS
                        .into_iter()
                        .find(|&d| self.cell_neighbour(x, z, d) == Some((tx, tz)))?;
                    let (left, right) = self.cell_edge(x, z, dir);
                    Some((left, right, false))
                }
                PolyKind::Link(k) => {
                    let link = &self.links[k];
                    let idx = z * self.width + x;
                    if link.start_cell == idx {
                        Some((link.start, link.start, to_link))
                    } else if link.end_cell == idx {
                        Some((link.end, link.end, to_link))
                    } else {
                        None
                    }
                }
            },
            PolyKind::Link(k) => {
                let link = &self.links[k];
                let target = self.kind(to)?;
                let PolyKind::Cell { x, z } = target else {
                    return None;
                };
                let idx = z * self.width + x;
                if link.end_cell == idx {
                    Some((link.end, link.end, false))
                } else if link.start_cell == idx {
                    Some((link.start, link.start, false))
                } else {
                    None
                }
            }
        }
    }
}

/// Progress of a sliced A* search
#[derive(Debug, Clone)]
struct SlicedSearch {
    status: QueryStatus,
    start_ref: PolyRef,
    end_ref: PolyRef,
    end_pos: Vec3,
    filter: QueryFilter,
    last_best_node: Option<usize>,
    last_best_cost: f32,
}

/// [`NavMeshQuery`] implementation over a [`GridNavMesh`]
#[derive(Debug, Clone)]
pub struct GridMeshQuery<'a> {
    mesh: &'a GridNavMesh,
    node_pool: NodePool,
    open_list: NodeQueue,
    search: Option<SlicedSearch>,
}

impl<'a> GridMeshQuery<'a> {
    pub fn new(mesh: &'a GridNavMesh) -> Self {
        Self::with_max_nodes(mesh, DEFAULT_MAX_NODES)
    }

    pub fn with_max_nodes(mesh: &'a GridNavMesh, max_nodes: usize) -> Self {
        Self {
            mesh,
            node_pool: NodePool::new(max_nodes),
            open_list: NodeQueue::new(max_nodes),
            search: None,
        }
    }

    pub fn mesh(&self) -> &'a GridNavMesh {
        self.mesh
    }

    fn path_to_node(&self, node: usize, path: &mut Vec<PolyRef>, max_path: usize) -> QueryStatus {
        let mut chain = Vec::new();
        let mut cur = Some(node);
        while let Some(idx) = cur {
            let n = self.node_pool.node(idx);
            chain.push(n.id);
            cur = n.parent;
        }
        chain.reverse();

        let mut status = QueryStatus::empty();
        if chain.len() > max_path {
            chain.truncate(max_path);
            status |= QueryStatus::BUFFER_TOO_SMALL;
        }
        path.extend(chain);
        status
    }
}

impl<'a> NavMeshQuery for GridMeshQuery<'a> {
    fn set_max_nodes(&mut self, max_nodes: usize) {
        self.node_pool = NodePool::new(max_nodes);
        self.open_list = NodeQueue::new(max_nodes);
        self.search = None;
    }

    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, Vec3)>> {
        let mesh = self.mesh;
        let to_cell = |v: f32, o: f32, n: usize| -> usize {
            let c = ((v - o) / mesh.cell_size).floor();
            if c < 0.0 {
                0
            } else {
                (c as usize).min(n - 1)
            }
        };
        let min = center - half_extents;
        let max = center + half_extents;
        if max.x < mesh.origin.x
            || max.z < mesh.origin.z
            || min.x > mesh.origin.x + mesh.width as f32 * mesh.cell_size
            || min.z > mesh.origin.z + mesh.depth as f32 * mesh.cell_size
        {
            return Ok(None);
        }
        let (x0, x1) = (to_cell(min.x, mesh.origin.x, mesh.width), to_cell(max.x, mesh.origin.x, mesh.width));
        let (z0, z1) = (to_cell(min.z, mesh.origin.z, mesh.depth), to_cell(max.z, mesh.origin.z, mesh.depth));

        let mut nearest = None;
        let mut nearest_dist = f32::MAX;
        for z in z0..=z1 {
            for x in x0..=x1 {
                if !mesh.passable(x, z, filter) {
                    continue;
                }
                let (bmin, bmax) = mesh.cell_bounds(x, z);
                if bmin.y < min.y || bmin.y > max.y {
                    continue;
                }
                let closest = Vec3::new(center.x.clamp(bmin.x, bmax.x), bmin.y, center.z.clamp(bmin.z, bmax.z));
                let d = closest.distance_squared(center);
                if d < nearest_dist {
                    nearest_dist = d;
                    nearest = Some((mesh.cell_ref(x, z), closest));
                }
            }
        }
        Ok(nearest)
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        self.mesh.is_valid(poly, filter)
    }

    fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> QueryStatus {
        let mut search = SlicedSearch {
            status: QueryStatus::FAILURE,
            start_ref,
            end_ref,
            end_pos,
            filter: filter.clone(),
            last_best_node: None,
            last_best_cost: f32::MAX,
        };

        if !self.mesh.is_valid(start_ref, filter) || !self.mesh.is_valid(end_ref, filter) {
            search.status = QueryStatus::FAILURE | QueryStatus::INVALID_PARAM;
            let status = search.status;
            self.search = Some(search);
            return status;
        }

        if start_ref == end_ref {
            search.status = QueryStatus::SUCCESS;
            self.search = Some(search);
            return QueryStatus::SUCCESS;
        }

        self.node_pool.clear();
        self.open_list.clear();

        let Some(start_node) = self.node_pool.get_node(start_ref) else {
            search.status = QueryStatus::FAILURE | QueryStatus::OUT_OF_NODES;
            let status = search.status;
            self.search = Some(search);
            return status;
        };
        let heuristic = start_pos.distance(end_pos) * H_SCALE;
        {
            let node = self.node_pool.node_mut(start_node);
            node.pos = start_pos;
            node.cost = 0.0;
            node.total = heuristic;
            node.parent = None;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_node, self.node_pool.nodes());

        search.last_best_node = Some(start_node);
        search.last_best_cost = heuristic;
        search.status = QueryStatus::IN_PROGRESS;
        self.search = Some(search);
        QueryStatus::IN_PROGRESS
    }

    fn update_sliced_find_path(&mut self, max_iter: usize) -> (QueryStatus, usize) {
        let Some(mut search) = self.search.take() else {
            return (QueryStatus::FAILURE, 0);
        };
        if !search.status.is_in_progress() {
            let status = search.status;
            self.search = Some(search);
            return (status, 0);
        }

        if !self.mesh.is_valid(search.start_ref, &search.filter)
            || !self.mesh.is_valid(search.end_ref, &search.filter)
        {
            search.status = QueryStatus::FAILURE;
            self.search = Some(search);
            return (QueryStatus::FAILURE, 0);
        }

        let mut iter = 0;
        while iter < max_iter {
            let Some(best) = self.open_list.pop(self.node_pool.nodes()) else {
                break;
            };
            iter += 1;

            let (best_ref, best_pos, best_cost, parent_ref) = {
                let node = self.node_pool.node_mut(best);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
                (node.id, node.pos, node.cost, node.parent)
            };
            let parent_ref = parent_ref.map(|p| self.node_pool.node(p).id);

            if best_ref == search.end_ref {
                search.last_best_node = Some(best);
                search.status = QueryStatus::success_with(search.status);
                let status = search.status;
                self.search = Some(search);
                return (status, iter);
            }

            let best_area = self.mesh.poly_area(best_ref);
            for (nei_ref, left, right) in self.mesh.neighbours(best_ref, &search.filter) {
                if Some(nei_ref) == parent_ref {
                    continue;
                }
                let Some(nei) = self.node_pool.get_node(nei_ref) else {
                    search.status |= QueryStatus::OUT_OF_NODES;
                    continue;
                };

                if self.node_pool.node(nei).flags == NodeFlags::default() {
                    self.node_pool.node_mut(nei).pos = (left + right) * 0.5;
                }
                let nei_pos = self.node_pool.node(nei).pos;

                let (cost, heuristic) = if nei_ref == search.end_ref {
                    let cur_cost = search.filter.cost(best_pos, nei_pos, best_area);
                    let end_cost =
                        search
                            .filter
                            .cost(nei_pos, search.end_pos, self.mesh.poly_area(nei_ref));
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = search.filter.cost(best_pos, nei_pos, best_area);
                    (best_cost + cur_cost, nei_pos.distance(search.end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                let flags = self.node_pool.node(nei).flags;
                if (flags.contains(NodeFlags::OPEN) || flags.contains(NodeFlags::CLOSED))
                    && total >= self.node_pool.node(nei).total
                {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(nei);
                    node.parent = Some(best);
                    node.flags.remove(NodeFlags::CLOSED);
                    node.cost = cost;
                    node.total = total;
                }
                if flags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(nei, self.node_pool.nodes());
                } else {
                    self.node_pool.node_mut(nei).flags.insert(NodeFlags::OPEN);
                    self.open_list.push(nei, self.node_pool.nodes());
                }

                if heuristic < search.last_best_cost {
                    search.last_best_cost = heuristic;
                    search.last_best_node = Some(nei);
                }
            }
        }

        if self.open_list.is_empty() {
            search.status = QueryStatus::success_with(search.status);
        }
        let status = search.status;
        self.search = Some(search);
        (status, iter)
    }

    fn finalize_sliced_find_path(&mut self, path: &mut Vec<PolyRef>, max_path: usize) -> QueryStatus {
        path.clear();
        let Some(search) = self.search.take() else {
            return QueryStatus::FAILURE;
        };
        if search.status.is_failure() || max_path == 0 {
            return QueryStatus::FAILURE;
        }

        if search.start_ref == search.end_ref {
            path.push(search.start_ref);
            return QueryStatus::SUCCESS;
        }

        let Some(best) = search.last_best_node else {
            return QueryStatus::FAILURE;
        };
        let mut details = search.status.detail();
        if self.node_pool.node(best).id != search.end_ref {
            details |= QueryStatus::PARTIAL_RESULT;
        }
        details |= self.path_to_node(best, path, max_path);
        QueryStatus::success_with(details)
    }

    fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        path: &mut Vec<PolyRef>,
        max_path: usize,
    ) -> QueryStatus {
        path.clear();
        if existing.is_empty() || max_path == 0 {
            return QueryStatus::FAILURE | QueryStatus::INVALID_PARAM;
        }
        let Some(search) = self.search.take() else {
            return QueryStatus::FAILURE;
        };
        if search.status.is_failure() {
            return QueryStatus::FAILURE;
        }

        if search.start_ref == search.end_ref {
            path.push(search.start_ref);
            return QueryStatus::SUCCESS;
        }

        let mut details = search.status.detail();
        let furthest = existing
            .iter()
            .rev()
            .find_map(|&r| self.node_pool.find_node(r));
        let node = match furthest {
            Some(node) => node,
            None => {
                details |= QueryStatus::PARTIAL_RESULT;
                match search.last_best_node {
                    Some(node) => node,
                    None => return QueryStatus::FAILURE,
                }
            }
        };
        details |= self.path_to_node(node, path, max_path);
        QueryStatus::success_with(details)
    }

    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
        points: &mut Vec<StraightPathPoint>,
    ) -> Result<QueryStatus> {
        points.clear();
        if path.is_empty() || max_points == 0 {
            return Err(Error::InvalidParam("straight path needs a corridor and room for points".into()));
        }

        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        let mut out = StraightPathWriter { points, max_points };
        let stat = out.append(closest_start, StraightPathFlags::START, path[0]);
        if !stat.is_in_progress() {
            return Ok(stat);
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut left_index = 0usize;
            let mut right_index = 0usize;
            let mut left_is_link = false;
            let mut right_is_link = false;
            let mut left_ref = path[0];
            let mut right_ref = path[0];

            let mut i = 0usize;
            while i < path.len() {
                let (left, right, to_link) = if i + 1 < path.len() {
                    match self.mesh.portal_points(path[i], path[i + 1]) {
                        Some(portal) => portal,
                        None => {
                            // Corridor is broken here, end at the last reachable polygon.
                            let end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            out.append(end, StraightPathFlags::empty(), path[i]);
                            return Ok(QueryStatus::SUCCESS | QueryStatus::PARTIAL_RESULT);
                        }
                    }
                } else {
                    (closest_end, closest_end, false)
                };

                if i == 0 {
                    let (d, _) = dist_pt_seg_sqr_2d(portal_apex, left, right);
                    if d < 0.001 * 0.001 {
                        i += 1;
                        continue;
                    }
                }

                let next_ref = if i + 1 < path.len() { path[i + 1] } else { PolyRef::NULL };

                // Right vertex.
                if nav_common::tri_area_2d(portal_apex, portal_right, right) <= 0.0 {
                    if nav_common::v_equal(portal_apex, portal_right)
                        || nav_common::tri_area_2d(portal_apex, portal_left, right) > 0.0
                    {
                        portal_right = right;
                        right_ref = next_ref;
                        right_is_link = to_link;
                        right_index = i;
                    } else {
                        portal_apex = portal_left;
                        let apex_index = left_index;

                        let flags = if !left_ref.is_valid() {
                            StraightPathFlags::END
                        } else if left_is_link {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        let stat = out.append(portal_apex, flags, left_ref);
                        if !stat.is_in_progress() {
                            return Ok(stat);
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex.
                if nav_common::tri_area_2d(portal_apex, portal_left, left) >= 0.0 {
                    if nav_common::v_equal(portal_apex, portal_left)
                        || nav_common::tri_area_2d(portal_apex, portal_right, left) < 0.0
                    {
                        portal_left = left;
                        left_ref = next_ref;
                        left_is_link = to_link;
                        left_index = i;
                    } else {
                        portal_apex = portal_right;
                        let apex_index = right_index;

                        let flags = if !right_ref.is_valid() {
                            StraightPathFlags::END
                        } else if right_is_link {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        let stat = out.append(portal_apex, flags, right_ref);
                        if !stat.is_in_progress() {
                            return Ok(stat);
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        let stat = out.append(closest_end, StraightPathFlags::END, PolyRef::NULL);
        if stat.is_in_progress() {
            return Ok(QueryStatus::SUCCESS);
        }
        Ok(stat)
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit> {
        let mesh = self.mesh;
        let Some(PolyKind::Cell { mut x, mut z }) = mesh.kind(start_ref) else {
            return Err(Error::InvalidParam(format!("raycast start {start_ref:?} is not a cell")));
        };
        if !mesh.passable(x, z, filter) {
            return Err(Error::InvalidParam(format!("raycast start {start_ref:?} is not walkable")));
        }

        let dir = end_pos - start_pos;
        let mut path = Vec::new();
        let max_steps = mesh.width + mesh.depth + 2;

        for _ in 0..max_steps {
            if path.len() < max_path {
                path.push(mesh.cell_ref(x, z));
            }

            let (min, max) = mesh.cell_bounds(x, z);
            let (tx, dx) = if dir.x > 1e-6 {
                ((max.x - start_pos.x) / dir.x, Dir::East)
            } else if dir.x < -1e-6 {
                ((min.x - start_pos.x) / dir.x, Dir::West)
            } else {
                (f32::MAX, Dir::East)
            };
            let (tz, dz) = if dir.z > 1e-6 {
                ((max.z - start_pos.z) / dir.z, Dir::North)
            } else if dir.z < -1e-6 {
                ((min.z - start_pos.z) / dir.z, Dir::South)
            } else {
                (f32::MAX, Dir::North)
            };
            let (tmax, exit) = if tx <= tz { (tx, dx) } else { (tz, dz) };

            if tmax > 1.0 {
                return Ok(RaycastHit::no_hit(path));
            }

            match mesh.cell_neighbour(x, z, exit) {
                Some((nx, nz)) if mesh.passable(nx, nz, filter) => {
                    x = nx;
                    z = nz;
                }
                _ => {
                    return Ok(RaycastHit {
                        t: tmax.max(0.0),
                        hit_normal: exit.normal(),
                        path,
                    });
                }
            }
        }

        Ok(RaycastHit::no_hit(path))
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        visited: &mut Vec<PolyRef>,
        max_visited: usize,
    ) -> Result<Vec3> {
        visited.clear();
        let mesh = self.mesh;
        let Some(PolyKind::Cell { .. }) = mesh.kind(start_ref) else {
            return Err(Error::InvalidParam(format!("move start {start_ref:?} is not a cell")));
        };
        if !mesh.is_valid(start_ref, filter) {
            return Err(Error::InvalidParam(format!("move start {start_ref:?} is not walkable")));
        }

        // (polygon, parent node)
        let mut nodes: Vec<(PolyRef, Option<usize>)> = vec![(start_ref, None)];
        let mut queue = VecDeque::from([0usize]);

        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0usize;

        let search_pos = (start_pos + end_pos) * 0.5;
        let search_rad_sqr = nav_common::sqr(start_pos.distance(end_pos) * 0.5 + 0.001);

        while let Some(cur) = queue.pop_front() {
            let cur_ref = nodes[cur].0;
            let Some(PolyKind::Cell { x, z }) = mesh.kind(cur_ref) else {
                continue;
            };

            if mesh.contains_point(cur_ref, end_pos) {
                best_node = cur;
                best_pos = end_pos;
                break;
            }

            for dir in DIRS {
                let (p, q) = mesh.cell_edge(x, z, dir);
                let neighbour = mesh
                    .cell_neighbour(x, z, dir)
                    .filter(|&(nx, nz)| mesh.passable(nx, nz, filter))
                    .map(|(nx, nz)| mesh.cell_ref(nx, nz));

                match neighbour {
                    None => {
                        let (d, t) = dist_pt_seg_sqr_2d(end_pos, p, q);
                        if d < best_dist {
                            best_pos = p.lerp(q, t);
                            best_dist = d;
                            best_node = cur;
                        }
                    }
                    Some(nei_ref) => {
                        if nodes.iter().any(|(r, _)| *r == nei_ref) {
                            continue;
                        }
                        let (d, _) = dist_pt_seg_sqr_2d(search_pos, p, q);
                        if d > search_rad_sqr {
                            continue;
                        }
                        if nodes.len() < MAX_SURFACE_NODES {
                            nodes.push((nei_ref, Some(cur)));
                            queue.push_back(nodes.len() - 1);
                        }
                    }
                }
            }
        }

        let mut chain = Vec::new();
        let mut cur = Some(best_node);
        while let Some(idx) = cur {
            chain.push(nodes[idx].0);
            cur = nodes[idx].1;
        }
        chain.reverse();
        chain.truncate(max_visited.max(1));
        visited.extend(chain);

        Ok(best_pos)
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        match self.mesh.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                let (min, max) = self.mesh.cell_bounds(x, z);
                Ok(Vec3::new(pos.x.clamp(min.x, max.x), min.y, pos.z.clamp(min.z, max.z)))
            }
            Some(PolyKind::Link(k)) => {
                let link = &self.mesh.links[k];
                let (_, t) = dist_pt_seg_sqr_2d(pos, link.start, link.end);
                Ok(link.start.lerp(link.end, t))
            }
            None => Err(Error::Query(format!("unknown polygon {poly:?}"))),
        }
    }

    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        match self.mesh.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                let (min, max) = self.mesh.cell_bounds(x, z);
                if pos.x >= min.x && pos.x <= max.x && pos.z >= min.z && pos.z <= max.z {
                    Ok(pos)
                } else {
                    Ok(Vec3::new(pos.x.clamp(min.x, max.x), min.y, pos.z.clamp(min.z, max.z)))
                }
            }
            Some(PolyKind::Link(_)) => self.closest_point_on_poly(poly, pos),
            None => Err(Error::Query(format!("unknown polygon {poly:?}"))),
        }
    }

    fn get_poly_height(&self, poly: PolyRef, pos: Vec3) -> Result<f32> {
        match self.mesh.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                if !self.mesh.contains_point(poly, pos) {
                    return Err(Error::Query(format!("{pos} is outside polygon {poly:?}")));
                }
                Ok(self.mesh.cell_bounds(x, z).0.y)
            }
            Some(PolyKind::Link(k)) => {
                let link = &self.mesh.links[k];
                let (_, t) = dist_pt_seg_sqr_2d(pos, link.start, link.end);
                Ok(link.start.y + (link.end.y - link.start.y) * t)
            }
            None => Err(Error::Query(format!("unknown polygon {poly:?}"))),
        }
    }

    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &QueryFilter,
        segments: &mut Vec<WallSegment>,
    ) -> Result<()> {
        let mesh = self.mesh;
        match mesh.kind(poly) {
            Some(PolyKind::Cell { x, z }) => {
                for dir in DIRS {
                    let open = mesh
                        .cell_neighbour(x, z, dir)
                        .is_some_and(|(nx, nz)| mesh.passable(nx, nz, filter));
                    if !open {
                        let (p, q) = mesh.cell_edge(x, z, dir);
                        segments.push([p, q]);
                    }
                }
                Ok(())
            }
            Some(PolyKind::Link(_)) => Ok(()),
            None => Err(Error::Query(format!("unknown polygon {poly:?}"))),
        }
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
        result: &mut Vec<PolyRef>,
    ) -> Result<()> {
        result.clear();
        let mesh = self.mesh;
        if !matches!(mesh.kind(start_ref), Some(PolyKind::Cell { .. })) || !mesh.is_valid(start_ref, filter) {
            return Err(Error::InvalidParam(format!("neighbourhood start {start_ref:?} is not walkable")));
        }
        if max_result == 0 {
            return Ok(());
        }

        let radius_sqr = radius * radius;
        let mut queue = VecDeque::from([start_ref]);
        result.push(start_ref);

        while let Some(cur) = queue.pop_front() {
            let Some(PolyKind::Cell { x, z }) = mesh.kind(cur) else {
                continue;
            };
            for dir in DIRS {
                let Some((nx, nz)) = mesh.cell_neighbour(x, z, dir) else {
                    continue;
                };
                if !mesh.passable(nx, nz, filter) {
                    continue;
                }
                let nei = mesh.cell_ref(nx, nz);
                if result.contains(&nei) {
                    continue;
                }
                let (p, q) = mesh.cell_edge(x, z, dir);
                let (d, _) = dist_pt_seg_sqr_2d(center, p, q);
                if d > radius_sqr {
                    continue;
                }
                if result.len() >= max_result {
                    return Ok(());
                }
                result.push(nei);
                queue.push_back(nei);
            }
        }
        Ok(())
    }

    fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        let Some(PolyKind::Link(k)) = self.mesh.kind(con_ref) else {
            return Err(Error::InvalidParam(format!("{con_ref:?} is not an off-mesh connection")));
        };
        let link = &self.mesh.links[k];
        if prev_ref == PolyRef::new(link.start_cell as u32 + 1) {
            Ok((link.start, link.end))
        } else {
            Ok((link.end, link.start))
        }
    }
}

/// Appends straight path points, merging coincident ones
struct StraightPathWriter<'p> {
    points: &'p mut Vec<StraightPathPoint>,
    max_points: usize,
}

impl StraightPathWriter<'_> {
    fn append(&mut self, pos: Vec3, flags: StraightPathFlags, poly: PolyRef) -> QueryStatus {
        if let Some(last) = self.points.last_mut() {
            if nav_common::v_equal(last.pos, pos) {
                last.flags = flags;
                last.poly = poly;
                return QueryStatus::IN_PROGRESS;
            }
        }
        self.points.push(StraightPathPoint::new(pos, flags, poly));
        if self.points.len() >= self.max_points {
            return QueryStatus::SUCCESS | QueryStatus::BUFFER_TOO_SMALL;
        }
        if flags == StraightPathFlags::END {
            return QueryStatus::SUCCESS;
        }
        QueryStatus::IN_PROGRESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// 10x10 grid of unit cells centered on cell (5, 5) at the origin
    fn open_mesh() -> GridNavMesh {
        GridNavMesh::open(10, 10, 1.0, Vec3::new(-5.5, 0.0, -5.5)).expect("valid grid")
    }

    /// 10x5 grid with a wall on column 5 except for a gap at row 4
    fn walled_mesh() -> GridNavMesh {
        let mut builder = GridNavMesh::builder(10, 5);
        for z in 0..4 {
            builder = builder.with_blocked(5, z);
        }
        builder.build().expect("valid grid")
    }

    fn run_search(query: &mut GridMeshQuery, from: Vec3, to: Vec3) -> (QueryStatus, Vec<PolyRef>) {
        let filter = QueryFilter::default();
        let start = query.mesh().poly_at(from);
        let end = query.mesh().poly_at(to);
        query.init_sliced_find_path(start, end, from, to, &filter);
        let (status, _) = query.update_sliced_find_path(10_000);
        assert!(status.is_success());
        let mut path = Vec::new();
        let status = query.finalize_sliced_find_path(&mut path, 256);
        (status, path)
    }

    #[test]
    fn nearest_poly_snaps_onto_grid() -> Result<()> {
        let mesh = open_mesh();
        let query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let (poly, pos) = query
            .find_nearest_poly(Vec3::new(0.1, 0.5, 0.2), Vec3::new(1.0, 1.0, 1.0), &filter)?
            .expect("inside the grid");
        assert_eq!(poly, mesh.cell_ref(5, 5));
        assert_abs_diff_eq!(pos.y, 0.0);

        let outside = query.find_nearest_poly(Vec3::new(50.0, 0.0, 0.0), Vec3::ONE, &filter)?;
        assert!(outside.is_none());
        Ok(())
    }

    #[test]
    fn sliced_search_crosses_open_grid() {
        let mesh = open_mesh();
        let mut query = GridMeshQuery::new(&mesh);
        let (status, path) = run_search(&mut query, Vec3::new(-4.0, 0.0, 0.0), Vec3::new(4.0, 0.0, 0.0));
        assert!(!status.is_partial());
        assert_eq!(path.first(), Some(&mesh.cell_ref(1, 5)));
        assert_eq!(path.last(), Some(&mesh.cell_ref(9, 5)));
        assert_eq!(path.len(), 9);
    }

    #[test]
    fn sliced_search_reports_partial_when_blocked() -> Result<()> {
        let mesh = GridNavMesh::builder(6, 1).with_blocked(3, 0).build()?;
        let mut query = GridMeshQuery::new(&mesh);
        let (status, path) = run_search(&mut query, Vec3::new(0.5, 0.0, 0.5), Vec3::new(5.5, 0.0, 0.5));
        assert!(status.is_success());
        assert!(status.is_partial());
        assert_eq!(path.last(), Some(&mesh.cell_ref(2, 0)));
        Ok(())
    }

    #[test]
    fn sliced_search_can_be_resumed() {
        let mesh = open_mesh();
        let mut query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let (from, to) = (Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 0.0, 4.0));
        let status = query.init_sliced_find_path(mesh.poly_at(from), mesh.poly_at(to), from, to, &filter);
        assert!(status.is_in_progress());

        let mut total = 0;
        loop {
            let (status, iters) = query.update_sliced_find_path(2);
            assert!(iters <= 2);
            total += iters;
            if !status.is_in_progress() {
                assert!(status.is_success());
                break;
            }
        }
        assert!(total > 2);
        let mut path = Vec::new();
        assert!(query.finalize_sliced_find_path(&mut path, 256).is_success());
        assert_eq!(path.last(), Some(&mesh.poly_at(to)));
    }

    #[test]
    fn partial_finalize_ends_on_existing_corridor() {
        let mesh = open_mesh();
        let mut query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let (from, to) = (Vec3::new(-4.0, 0.0, 0.0), Vec3::new(4.0, 0.0, 0.0));
        query.init_sliced_find_path(mesh.poly_at(from), mesh.poly_at(to), from, to, &filter);
        query.update_sliced_find_path(3);

        let existing = [mesh.cell_ref(1, 5), mesh.cell_ref(2, 5), mesh.cell_ref(3, 5)];
        let mut path = Vec::new();
        let status = query.finalize_sliced_find_path_partial(&existing, &mut path, 32);
        assert!(status.is_success());
        assert_eq!(path.first(), Some(&mesh.cell_ref(1, 5)));
        assert!(existing.contains(path.last().expect("non-empty")));
    }

    #[test]
    fn straight_path_turns_around_wall() -> Result<()> {
        let mesh = walled_mesh();
        let mut query = GridMeshQuery::new(&mesh);
        let (from, to) = (Vec3::new(1.5, 0.0, 0.5), Vec3::new(8.5, 0.0, 0.5));
        let (_, path) = run_search(&mut query, from, to);

        let mut points = Vec::new();
        query.find_straight_path(from, to, &path, 8, &mut points)?;
        assert!(points.len() >= 3);
        assert!(points[0].flags.contains(StraightPathFlags::START));
        let last = points.last().expect("end point");
        assert!(last.is_end());
        assert_abs_diff_eq!(last.pos.x, 8.5);
        assert_abs_diff_eq!(points[0].pos.x, 1.5);
        // The path wraps the far corner of the wall at the gap.
        assert!(points[1..points.len() - 1]
            .iter()
            .any(|p| p.pos.distance(Vec3::new(6.0, 0.0, 4.0)) < 1e-4));
        Ok(())
    }

    #[test]
    fn straight_path_turns_around_mirrored_wall() -> Result<()> {
        // Gap at row 0, the funnel wraps the wall on the other side.
        let mut builder = GridNavMesh::builder(10, 5);
        for z in 1..5 {
            builder = builder.with_blocked(5, z);
        }
        let mesh = builder.build()?;
        let mut query = GridMeshQuery::new(&mesh);
        let (from, to) = (Vec3::new(1.5, 0.0, 4.5), Vec3::new(8.5, 0.0, 4.5));
        let (_, path) = run_search(&mut query, from, to);

        let mut points = Vec::new();
        query.find_straight_path(from, to, &path, 8, &mut points)?;
        assert!(points.len() >= 3);
        let last = points.last().expect("end point");
        assert!(last.is_end());
        assert_abs_diff_eq!(last.pos.x, 8.5);
        assert!(points[1..points.len() - 1]
            .iter()
            .any(|p| p.pos.distance(Vec3::new(6.0, 0.0, 1.0)) < 1e-4));
        Ok(())
    }

    #[test]
    fn straight_path_flags_off_mesh_link() -> Result<()> {
        let mut builder = GridNavMesh::builder(7, 1);
        builder = builder
            .with_blocked(3, 0)
            .with_off_mesh_link(Vec3::new(2.5, 0.0, 0.5), Vec3::new(4.5, 0.0, 0.5), 0.5, false);
        let mesh = builder.build()?;
        let mut query = GridMeshQuery::new(&mesh);
        let (from, to) = (Vec3::new(0.5, 0.0, 0.5), Vec3::new(6.5, 0.0, 0.5));
        let (status, path) = run_search(&mut query, from, to);
        assert!(!status.is_partial());
        assert!(path.contains(&mesh.link_ref(0)));

        let mut points = Vec::new();
        query.find_straight_path(from, to, &path, 8, &mut points)?;
        let link_corner = points
            .iter()
            .find(|p| p.is_offmesh_connection())
            .expect("off-mesh corner");
        assert_eq!(link_corner.poly, mesh.link_ref(0));
        assert_abs_diff_eq!(link_corner.pos.x, 2.5);

        let (start, end) = query.get_off_mesh_connection_poly_end_points(mesh.cell_ref(2, 0), mesh.link_ref(0))?;
        assert_abs_diff_eq!(start.x, 2.5);
        assert_abs_diff_eq!(end.x, 4.5);
        Ok(())
    }

    #[test]
    fn raycast_stops_at_wall() -> Result<()> {
        let mesh = walled_mesh();
        let query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = Vec3::new(1.5, 0.0, 0.5);
        let hit = query.raycast(mesh.poly_at(start), start, Vec3::new(9.5, 0.0, 0.5), &filter, 32)?;
        assert!(hit.is_hit());
        assert_abs_diff_eq!(hit.t, 0.4375, epsilon = 1e-5);
        assert_abs_diff_eq!(hit.hit_normal.x, 1.0);
        assert_eq!(hit.path.len(), 4);

        let clear = query.raycast(mesh.poly_at(start), start, Vec3::new(1.5, 0.0, 3.5), &filter, 32)?;
        assert!(!clear.is_hit());
        assert_eq!(clear.path.last(), Some(&mesh.cell_ref(1, 3)));
        Ok(())
    }

    #[test]
    fn surface_move_slides_along_wall() -> Result<()> {
        let mesh = walled_mesh();
        let query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = Vec3::new(4.5, 0.0, 1.5);
        let mut visited = Vec::new();
        let pos = query.move_along_surface(
            mesh.poly_at(start),
            start,
            Vec3::new(5.5, 0.0, 1.5),
            &filter,
            &mut visited,
            16,
        )?;
        assert_abs_diff_eq!(pos.x, 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(pos.z, 1.5, epsilon = 1e-5);
        assert_eq!(visited, vec![mesh.cell_ref(4, 1)]);

        let pos = query.move_along_surface(
            mesh.poly_at(start),
            start,
            Vec3::new(3.2, 0.0, 1.5),
            &filter,
            &mut visited,
            16,
        )?;
        assert_abs_diff_eq!(pos.x, 3.2, epsilon = 1e-5);
        assert_eq!(visited, vec![mesh.cell_ref(4, 1), mesh.cell_ref(3, 1)]);
        Ok(())
    }

    #[test]
    fn wall_segments_face_into_cell() -> Result<()> {
        let mesh = walled_mesh();
        let query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let corner = mesh.cell_ref(0, 0);
        let mut segments = Vec::new();
        query.get_poly_wall_segments(corner, &filter, &mut segments)?;
        assert_eq!(segments.len(), 2);

        let center = mesh.poly_center(corner).expect("cell");
        for [p, q] in segments {
            assert!(nav_common::tri_area_2d(center, p, q) > 0.0);
        }
        Ok(())
    }

    #[test]
    fn local_neighbourhood_is_bounded() -> Result<()> {
        let mesh = open_mesh();
        let query = GridMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let center = Vec3::ZERO;
        let mut polys = Vec::new();
        query.find_local_neighbourhood(mesh.poly_at(center), center, 1.2, &filter, 16, &mut polys)?;
        assert_eq!(polys[0], mesh.cell_ref(5, 5));
        assert!(polys.len() > 4);
        assert!(polys.len() <= 16);

        query.find_local_neighbourhood(mesh.poly_at(center), center, 5.0, &filter, 4, &mut polys)?;
        assert_eq!(polys.len(), 4);
        Ok(())
    }

    #[test]
    fn filter_rejects_excluded_cells() -> Result<()> {
        let mesh = GridNavMesh::builder(3, 1).with_flags(1, 0, PolyFlags::DOOR).build()?;
        let query = GridMeshQuery::new(&mesh);
        let mut filter = QueryFilter::default();
        assert!(query.is_valid_poly_ref(mesh.cell_ref(1, 0), &filter));
        filter.exclude_flags = PolyFlags::DOOR;
        assert!(!query.is_valid_poly_ref(mesh.cell_ref(1, 0), &filter));
        assert!(!query.is_valid_poly_ref(PolyRef::NULL, &filter));
        Ok(())
    }

    #[test]
    fn builder_rejects_link_off_grid() {
        let result = GridNavMesh::builder(3, 1)
            .with_off_mesh_link(Vec3::new(0.5, 0.0, 0.5), Vec3::new(9.5, 0.0, 0.5), 0.5, true)
            .build();
        assert!(matches!(result, Err(Error::InvalidParam(_))));
    }
}
