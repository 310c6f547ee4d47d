//! Multi-agent crowd simulation on navigation meshes
//!
//! This crate moves many agents over a shared navigation mesh. Each agent
//! follows a polygon corridor toward its target while steering around its
//! neighbours and nearby walls. Long path searches are spread over several
//! ticks through a shared request queue.
//!
//! # Features
//!
//! - **Agent Management**: Fixed pool of agent slots with move requests by target or velocity
//! - **Path Following**: Corridor following with visibility and topology shortcuts
//! - **Collision Avoidance**: Sampled velocity obstacles against agents and walls
//! - **Off-Mesh Connections**: Timed traversal of jump links and ladders
//! - **Proximity Queries**: Spatial hash for neighbour lookups
//!
//! # Example
//!
//! ```rust,ignore
//! use nav_crowd::{AgentParams, Crowd, CrowdConfig};
//! use nav_query::{GridMeshQuery, GridNavMesh};
//!
//! let mesh = GridNavMesh::open(32, 32, 1.0, Vec3::ZERO)?;
//! let mut crowd = Crowd::new(CrowdConfig::new(64, 0.6), GridMeshQuery::new(&mesh))?;
//!
//! let idx = crowd.add_agent(start_pos, &AgentParams::default())?;
//! crowd.request_move_target(idx, target_poly, target_pos);
//!
//! crowd.update(delta_time, None);
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: Main simulation manager
//! - [`PathCorridor`]: Per-agent polygon path and steering corners
//! - [`LocalBoundary`]: Cached walls around an agent
//! - [`ObstacleAvoidanceQuery`]: Velocity sampling against obstacles
//! - [`ProximityGrid`]: Spatial indexing for neighbour queries
//! - [`PathQueue`]: Time-sliced path requests

pub mod config;
pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod path_queue;
pub mod proximity_grid;
pub mod telemetry;

pub use config::*;
pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use path_queue::*;
pub use proximity_grid::*;
pub use telemetry::*;
