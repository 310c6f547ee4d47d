//! Common utilities shared by the navigation query and crowd crates

mod bounded;
mod geometry;

pub use bounded::*;
pub use geometry::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("navigation query failed: {0}")]
    Query(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("crowd error: {0}")]
    Crowd(String),
}

/// Result type for navigation operations
pub type Result<T> = std::result::Result<T, Error>;
