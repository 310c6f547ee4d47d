//! Crowd and agent configuration

use bitflags::bitflags;

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const DT_CROWDAGENT_MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
/// Due to the behavior of the crowd manager, the actual number of useful
/// corners will be one less than this number.
pub const DT_CROWDAGENT_MAX_CORNERS: usize = 4;

/// The maximum number of crowd avoidance configurations supported by the
/// crowd manager.
pub const DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

/// The maximum number of query filter types supported by the crowd manager.
pub const DT_CROWD_MAX_QUERY_FILTER_TYPE: usize = 16;

/// Default radius of an agent
const DEFAULT_AGENT_RADIUS: f32 = 0.6;

/// Default height of an agent
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;

/// Default max acceleration of an agent
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;

/// Default max speed of an agent
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

bitflags! {
    /// Per-agent steering and optimization switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct UpdateFlags: u8 {
        /// Steer smoothly through the next two corners
        const ANTICIPATE_TURNS = 1;
        /// Sample velocities around neighbours and walls
        const OBSTACLE_AVOIDANCE = 2;
        /// Keep distance from neighbours
        const SEPARATION = 4;
        /// Shortcut the corridor with visibility raycasts
        const OPTIMIZE_VIS = 8;
        /// Periodically re-search the local corridor topology
        const OPTIMIZE_TOPO = 16;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::all()
    }
}

/// Agent parameters for crowd
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AgentParams {
    /// Radius of the agent
    pub radius: f32,
    /// Height of the agent
    pub height: f32,
    /// Maximum acceleration of the agent
    pub max_acceleration: f32,
    /// Maximum speed of the agent
    pub max_speed: f32,
    /// Range within which neighbours and walls are considered for steering
    pub collision_query_range: f32,
    /// Range of the visibility-based path optimization
    pub path_optimization_range: f32,
    /// How strongly the agent pushes away from its neighbours
    pub separation_weight: f32,
    /// Update flags for the agent
    pub update_flags: UpdateFlags,
    /// Index of the obstacle avoidance preset
    pub obstacle_avoidance_type: usize,
    /// Index of the query filter used by the agent
    pub query_filter_type: usize,
    /// User data for the agent
    pub user_data: Option<usize>,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: 12.0,
            path_optimization_range: 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
            user_data: None,
        }
    }
}

impl AgentParams {
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_height(mut self, height: f32) -> Self {
        self.height = height;
        self
    }

    pub fn with_max_acceleration(mut self, max_acceleration: f32) -> Self {
        self.max_acceleration = max_acceleration;
        self
    }

    pub fn with_max_speed(mut self, max_speed: f32) -> Self {
        self.max_speed = max_speed;
        self
    }

    pub fn with_collision_query_range(mut self, range: f32) -> Self {
        self.collision_query_range = range;
        self
    }

    pub fn with_path_optimization_range(mut self, range: f32) -> Self {
        self.path_optimization_range = range;
        self
    }

    pub fn with_separation_weight(mut self, weight: f32) -> Self {
        self.separation_weight = weight;
        self
    }

    pub fn with_update_flags(mut self, flags: UpdateFlags) -> Self {
        self.update_flags = flags;
        self
    }

    pub fn with_obstacle_avoidance_type(mut self, preset: usize) -> Self {
        self.obstacle_avoidance_type = preset;
        self
    }

    pub fn with_query_filter_type(mut self, filter: usize) -> Self {
        self.query_filter_type = filter;
        self
    }

    pub fn with_user_data(mut self, user_data: usize) -> Self {
        self.user_data = Some(user_data);
        self
    }
}

/// Crowd-wide capacities and tuning
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CrowdConfig {
    /// Maximum number of agents the crowd can manage
    pub max_agents: usize,
    /// Largest radius any agent will have
    pub max_agent_radius: f32,
    /// Capacity of each agent corridor
    pub max_path_result: usize,
    /// Search nodes of the path queue query
    pub path_queue_nodes: usize,
    /// Search nodes of the crowd's own query
    pub common_query_nodes: usize,
    /// Path queue iteration budget per tick
    pub max_iterations_per_update: usize,
    /// Iterations of the quick search done on a new move request
    pub max_target_find_path_iterations: usize,
    /// Iterations of each topology optimization search
    pub max_topology_optimization_iterations: usize,
    /// Seconds between topology optimizations of an agent
    pub topology_optimization_time_threshold: f32,
    /// Agents whose topology is optimized per tick
    pub max_topology_optimization_agents: usize,
    /// Corridor polygons checked for validity every tick
    pub check_lookahead: usize,
    /// Seconds before a path that does not reach its target is replanned
    pub target_replan_delay: f32,
    /// Collision resolve passes per tick
    pub collision_resolve_iterations: usize,
    /// Fraction of the penetration resolved per pass
    pub collision_resolve_factor: f32,
    /// Neighbour circles handed to obstacle avoidance
    pub max_obstacle_circles: usize,
    /// Wall segments handed to obstacle avoidance
    pub max_obstacle_segments: usize,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self::new(128, DEFAULT_AGENT_RADIUS)
    }
}

impl CrowdConfig {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Self {
        Self {
            max_agents,
            max_agent_radius,
            max_path_result: 256,
            path_queue_nodes: 4096,
            common_query_nodes: 512,
            max_iterations_per_update: 100,
            max_target_find_path_iterations: 20,
            max_topology_optimization_iterations: 32,
            topology_optimization_time_threshold: 0.5,
            max_topology_optimization_agents: 1,
            check_lookahead: 10,
            target_replan_delay: 1.0,
            collision_resolve_iterations: 4,
            collision_resolve_factor: 0.7,
            max_obstacle_circles: 6,
            max_obstacle_segments: 8,
        }
    }

    pub fn with_max_path_result(mut self, max_path_result: usize) -> Self {
        self.max_path_result = max_path_result;
        self
    }

    pub fn with_path_queue_nodes(mut self, nodes: usize) -> Self {
        self.path_queue_nodes = nodes;
        self
    }

    pub fn with_common_query_nodes(mut self, nodes: usize) -> Self {
        self.common_query_nodes = nodes;
        self
    }

    pub fn with_max_iterations_per_update(mut self, iterations: usize) -> Self {
        self.max_iterations_per_update = iterations;
        self
    }

    pub fn with_check_lookahead(mut self, lookahead: usize) -> Self {
        self.check_lookahead = lookahead;
        self
    }

    pub fn with_target_replan_delay(mut self, delay: f32) -> Self {
        self.target_replan_delay = delay;
        self
    }

    pub fn with_collision_resolve(mut self, iterations: usize, factor: f32) -> Self {
        self.collision_resolve_iterations = iterations;
        self.collision_resolve_factor = factor;
        self
    }

    pub fn with_topology_optimization(mut self, time_threshold: f32, max_agents: usize) -> Self {
        self.topology_optimization_time_threshold = time_threshold;
        self.max_topology_optimization_agents = max_agents;
        self
    }

    /// Half extents used to place agents and targets on the mesh
    pub fn query_half_extents(&self) -> glam::Vec3 {
        let r = self.max_agent_radius;
        glam::Vec3::new(r * 2.0, r * 1.5, r * 2.0)
    }
}
