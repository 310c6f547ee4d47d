//! Navigation mesh query capability interface
//!
//! The crowd engine never talks to a concrete navigation mesh. Everything it
//! needs (nearest polygon search, sliced A*, straight path extraction,
//! raycasts, surface-constrained moves, wall segments) goes through the
//! [`NavMeshQuery`] trait defined here.
//!
//! [`grid_mesh`] provides a small reference implementation on a uniform grid of
//! square polygons. It is used by the crowd tests and is handy for
//! experimenting without a baked navigation mesh.

pub mod grid_mesh;
pub mod node_pool;
pub mod query;
pub mod status;

pub use grid_mesh::*;
pub use query::*;
pub use status::*;

use bitflags::bitflags;

/// Maximum number of vertices per navigation polygon
pub const DT_VERTS_PER_POLYGON: usize = 6;

/// Number of area types a query filter can price
pub const DT_MAX_AREAS: usize = 64;

/// Opaque reference to a navigation mesh polygon. Zero is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(u32);

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

bitflags! {
    /// Polygon ability flags tested by [`QueryFilter`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        /// Ground that can be walked on
        const WALK = 0x01;
        /// Water that can be swum through
        const SWIM = 0x02;
        /// Door that can be moved through
        const DOOR = 0x04;
        /// Jump links
        const JUMP = 0x08;
        /// Polygon is disabled
        const DISABLED = 0x10;
    }
}

/// Decides which polygons a query may traverse and what they cost
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area type
    pub area_cost: Vec<f32>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
            area_cost: vec![1.0; DT_MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Default::default()
        }
    }

    /// Returns true if a polygon with `flags` may be visited
    pub fn pass_filter(&self, flags: PolyFlags) -> bool {
        self.include_flags.intersects(flags) && !self.exclude_flags.intersects(flags)
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }

    /// Cost of travelling the segment `pa -> pb` over a polygon of `area`
    pub fn cost(&self, pa: glam::Vec3, pb: glam::Vec3, area: u8) -> f32 {
        pa.distance(pb) * self.area_cost(area)
    }
}
