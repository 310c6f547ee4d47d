//! Crowd management
//!
//! The crowd owns a fixed pool of agents and moves them every tick through a
//! fixed pipeline: path upkeep, asynchronous path requests, neighbour
//! gathering, steering, velocity planning, integration, collision resolution
//! and off-mesh connection animation. Each stage completes for all agents
//! before the next one starts.

use glam::Vec3;
use log::{debug, log_enabled, trace, warn, Level};
use nav_common::{dist_2d, dist_2d_sqr, insert_bounded, sqr, tri_area_2d, Error, Result};
use nav_query::{NavMeshQuery, PolyRef, QueryFilter, StraightPathFlags, StraightPathPoint};

use crate::config::{
    AgentParams, CrowdConfig, UpdateFlags, DT_CROWDAGENT_MAX_CORNERS, DT_CROWDAGENT_MAX_NEIGHBOURS,
    DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS, DT_CROWD_MAX_QUERY_FILTER_TYPE,
};
use crate::local_boundary::LocalBoundary;
use crate::obstacle_avoidance::{ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
use crate::path_corridor::PathCorridor;
use crate::path_queue::{PathQueue, PathQueueRef, DT_PATHQ_INVALID};
use crate::proximity_grid::ProximityGrid;
use crate::telemetry::{CrowdStage, CrowdTelemetry};

/// Agents submitted to the path queue per tick
const PATH_MAX_AGENTS: usize = 8;

/// Result size of the quick search done on a new move request
const MAX_QUICK_SEARCH_RES: usize = 32;

/// Grid ids examined when gathering neighbours
const MAX_NEIGHBOUR_QUERY: usize = 32;

/// Samples kept by the per-agent debug sink
const MAX_DEBUG_SAMPLES: usize = 2048;

/// The type of navigation mesh polygon the agent is currently traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not in a valid state.
    #[default]
    Invalid,
    /// The agent is traversing a normal navigation mesh polygon.
    Walking,
    /// The agent is traversing an off-mesh connection.
    OffMesh,
}

/// Move request state for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
}

impl MoveRequestState {
    /// True when the agent follows a path toward a target
    fn has_path_target(self) -> bool {
        !matches!(self, MoveRequestState::None | MoveRequestState::Velocity)
    }
}

/// A neighbour of an agent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    /// Slot of the neighbour agent
    pub idx: usize,
    /// Squared xz-distance to the neighbour
    pub dist: f32,
}

/// State of an off-mesh connection traversal
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OffMeshAnimation {
    pub active: bool,
    /// Position when the traversal was triggered
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    /// The connection polygon
    pub poly_ref: PolyRef,
    /// Elapsed time
    pub t: f32,
    /// Duration
    pub tmax: f32,
}

/// Agent in the crowd
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    active: bool,
    state: CrowdAgentState,
    /// The path corridor ends short of the requested target
    partial: bool,
    corridor: PathCorridor,
    boundary: LocalBoundary,
    /// Time since the last topology optimization
    topology_opt_time: f32,
    neis: Vec<CrowdNeighbour>,
    desired_speed: f32,
    /// Current position
    npos: Vec3,
    /// Collision resolve displacement
    disp: Vec3,
    /// Desired velocity
    dvel: Vec3,
    /// Obstacle-adjusted velocity
    nvel: Vec3,
    /// Current velocity
    vel: Vec3,
    params: AgentParams,
    corners: Vec<StraightPathPoint>,
    target_state: MoveRequestState,
    target_ref: PolyRef,
    /// Target position, or the velocity for velocity requests
    target_pos: Vec3,
    target_pathq_ref: PathQueueRef,
    target_replan: bool,
    /// Time since the target was last (re)planned
    target_replan_time: f32,
    /// Time spent waiting on the path queue
    target_wait_time: f32,
    anim: OffMeshAnimation,
}

impl CrowdAgent {
    fn new(max_path: usize) -> Self {
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(max_path),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::with_capacity(DT_CROWDAGENT_MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            disp: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params: AgentParams::default(),
            corners: Vec::with_capacity(DT_CROWDAGENT_MAX_CORNERS),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            target_pathq_ref: DT_PATHQ_INVALID,
            target_replan: false,
            target_replan_time: 0.0,
            target_wait_time: 0.0,
            anim: OffMeshAnimation::default(),
        }
    }

    /// Reinitializes a pooled slot for a new agent at `pos`
    fn activate(&mut self, params: AgentParams, poly_ref: PolyRef, pos: Vec3) {
        self.corridor.reset(poly_ref, pos);
        self.boundary.reset();
        self.partial = false;
        self.topology_opt_time = 0.0;
        self.target_replan_time = 0.0;
        self.target_wait_time = 0.0;
        self.neis.clear();
        self.corners.clear();
        self.dvel = Vec3::ZERO;
        self.nvel = Vec3::ZERO;
        self.vel = Vec3::ZERO;
        self.disp = Vec3::ZERO;
        self.npos = pos;
        self.desired_speed = 0.0;
        self.params = params;
        self.state = if poly_ref.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        self.target_state = MoveRequestState::None;
        self.target_ref = PolyRef::NULL;
        self.target_pathq_ref = DT_PATHQ_INVALID;
        self.target_replan = false;
        self.anim = OffMeshAnimation::default();
        self.active = true;
    }

    fn request_target(&mut self, target_ref: PolyRef, pos: Vec3, replan: bool) {
        self.target_ref = target_ref;
        self.target_pos = pos;
        self.target_pathq_ref = DT_PATHQ_INVALID;
        self.target_replan = replan;
        self.target_state = if target_ref.is_valid() {
            MoveRequestState::Requesting
        } else {
            MoveRequestState::Failed
        };
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> CrowdAgentState {
        self.state
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn position(&self) -> Vec3 {
        self.npos
    }

    pub fn velocity(&self) -> Vec3 {
        self.vel
    }

    pub fn desired_velocity(&self) -> Vec3 {
        self.dvel
    }

    pub fn planned_velocity(&self) -> Vec3 {
        self.nvel
    }

    pub fn desired_speed(&self) -> f32 {
        self.desired_speed
    }

    pub fn params(&self) -> &AgentParams {
        &self.params
    }

    pub fn corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    pub fn neighbours(&self) -> &[CrowdNeighbour] {
        &self.neis
    }

    pub fn corners(&self) -> &[StraightPathPoint] {
        &self.corners
    }

    pub fn target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn target_pos(&self) -> Vec3 {
        self.target_pos
    }

    pub fn animation(&self) -> &OffMeshAnimation {
        &self.anim
    }
}

/// Read-only view of an active agent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSnapshot {
    pub idx: usize,
    pub pos: Vec3,
    pub vel: Vec3,
    pub state: CrowdAgentState,
    pub target_state: MoveRequestState,
}

/// Debug sink filled for a single agent during [`Crowd::update`]
#[derive(Debug, Clone)]
pub struct CrowdAgentDebugInfo {
    /// Agent to record
    pub idx: Option<usize>,
    /// Visibility optimization ray
    pub opt_start: Vec3,
    pub opt_end: Vec3,
    /// Avoidance samples evaluated for the agent
    pub vod: ObstacleAvoidanceDebugData,
}

impl CrowdAgentDebugInfo {
    pub fn new(idx: usize) -> Self {
        Self {
            idx: Some(idx),
            opt_start: Vec3::ZERO,
            opt_end: Vec3::ZERO,
            vod: ObstacleAvoidanceDebugData::new(MAX_DEBUG_SAMPLES),
        }
    }

    fn records(&self, idx: usize) -> bool {
        self.idx == Some(idx)
    }
}

/// Crowd of agents moving over a navigation mesh
#[derive(Debug)]
pub struct Crowd<Q> {
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    /// Slots of the active agents, rebuilt every tick
    active_agents: Vec<usize>,
    path_queue: PathQueue<Q>,
    obstacle_query: ObstacleAvoidanceQuery,
    obstacle_query_params: [ObstacleAvoidanceParams; DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS],
    filters: Vec<QueryFilter>,
    grid: ProximityGrid,
    agent_placement_half_extents: Vec3,
    navquery: Q,
    telemetry: CrowdTelemetry,

    // Per-tick scratch
    path_result: Vec<PolyRef>,
    move_queue: Vec<usize>,
    opt_queue: Vec<usize>,
    neighbour_ids: Vec<usize>,
}

impl<Q: NavMeshQuery + Clone> Crowd<Q> {
    /// Creates a crowd. `query` is cloned once for the path queue.
    pub fn new(config: CrowdConfig, query: Q) -> Result<Self> {
        if config.max_agents == 0 {
            return Err(Error::InvalidParam("crowd needs room for at least one agent".into()));
        }
        if !(config.max_agent_radius > 0.0) {
            return Err(Error::InvalidParam(format!(
                "max agent radius must be positive, got {}",
                config.max_agent_radius
            )));
        }
        if config.max_path_result == 0 {
            return Err(Error::InvalidParam("max path result must be positive".into()));
        }

        let grid = ProximityGrid::new(config.max_agents * 4, config.max_agent_radius * 3.0)?;

        let mut path_query = query.clone();
        path_query.set_max_nodes(config.path_queue_nodes);
        let mut navquery = query;
        navquery.set_max_nodes(config.common_query_nodes);

        let agents = (0..config.max_agents)
            .map(|_| CrowdAgent::new(config.max_path_result))
            .collect();

        Ok(Self {
            agents,
            active_agents: Vec::with_capacity(config.max_agents),
            path_queue: PathQueue::new(config.max_path_result, path_query),
            obstacle_query: ObstacleAvoidanceQuery::new(config.max_obstacle_circles, config.max_obstacle_segments),
            obstacle_query_params: [ObstacleAvoidanceParams::default(); DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS],
            filters: vec![QueryFilter::default(); DT_CROWD_MAX_QUERY_FILTER_TYPE],
            grid,
            agent_placement_half_extents: config.query_half_extents(),
            navquery,
            telemetry: CrowdTelemetry::new(),
            path_result: Vec::with_capacity(config.max_path_result),
            move_queue: Vec::with_capacity(PATH_MAX_AGENTS),
            opt_queue: Vec::with_capacity(config.max_topology_optimization_agents),
            neighbour_ids: Vec::with_capacity(MAX_NEIGHBOUR_QUERY),
            config,
        })
    }

    /// Adds an agent at the nearest navigation mesh position to `pos`.
    ///
    /// An agent that cannot be placed on the mesh is still created, in the
    /// [`CrowdAgentState::Invalid`] state.
    pub fn add_agent(&mut self, pos: Vec3, params: &AgentParams) -> Result<usize> {
        validate_params(params)?;

        let Some(idx) = self.agents.iter().position(|ag| !ag.active) else {
            return Err(Error::Crowd(format!("all {} agent slots are in use", self.agents.len())));
        };

        let filter = &self.filters[params.query_filter_type];
        let nearest = match self
            .navquery
            .find_nearest_poly(pos, self.agent_placement_half_extents, filter)
        {
            Ok(found) => found,
            Err(err) => {
                warn!("nearest polygon search for new agent failed: {err}");
                None
            }
        };
        let (poly_ref, npos) = nearest.unwrap_or((PolyRef::NULL, pos));

        self.agents[idx].activate(params.clone(), poly_ref, npos);
        if poly_ref.is_valid() {
            debug!("added agent {idx} at {npos}");
        } else {
            debug!("added agent {idx} off the navigation mesh at {pos}");
        }
        Ok(idx)
    }

    /// Deactivates the agent. The slot is reused by later additions.
    pub fn remove_agent(&mut self, idx: usize) {
        if let Some(ag) = self.agents.get_mut(idx) {
            if ag.active {
                debug!("removed agent {idx}");
            }
            ag.active = false;
        }
    }

    /// Replaces the parameters of an active agent
    pub fn update_agent_parameters(&mut self, idx: usize, params: &AgentParams) -> bool {
        if validate_params(params).is_err() {
            return false;
        }
        match self.active_agent_mut(idx) {
            Some(ag) => {
                ag.params = params.clone();
                true
            }
            None => false,
        }
    }

    /// Submits a new move request. Returns false for unknown agents or a
    /// null polygon.
    pub fn request_move_target(&mut self, idx: usize, target_ref: PolyRef, pos: Vec3) -> bool {
        if !target_ref.is_valid() {
            return false;
        }
        match self.active_agent_mut(idx) {
            Some(ag) => {
                ag.request_target(target_ref, pos, false);
                true
            }
            None => false,
        }
    }

    /// Drives the agent with a raw velocity instead of a path
    pub fn request_move_velocity(&mut self, idx: usize, vel: Vec3) -> bool {
        match self.active_agent_mut(idx) {
            Some(ag) => {
                ag.target_ref = PolyRef::NULL;
                ag.target_pos = vel;
                ag.target_pathq_ref = DT_PATHQ_INVALID;
                ag.target_replan = false;
                ag.target_state = MoveRequestState::Velocity;
                true
            }
            None => false,
        }
    }

    /// Cancels any move request. The agent comes to a halt.
    pub fn reset_move_target(&mut self, idx: usize) -> bool {
        match self.active_agent_mut(idx) {
            Some(ag) => {
                ag.target_ref = PolyRef::NULL;
                ag.target_pos = Vec3::ZERO;
                ag.dvel = Vec3::ZERO;
                ag.target_pathq_ref = DT_PATHQ_INVALID;
                ag.target_replan = false;
                ag.target_state = MoveRequestState::None;
                true
            }
            None => false,
        }
    }

    /// Advances the simulation by `dt` seconds
    pub fn update(&mut self, dt: f32, mut debug: Option<&mut CrowdAgentDebugInfo>) -> &CrowdTelemetry {
        self.telemetry.reset();

        self.active_agents.clear();
        self.active_agents
            .extend(self.agents.iter().enumerate().filter(|(_, ag)| ag.active).map(|(i, _)| i));

        self.telemetry.begin_stage(CrowdStage::CheckPathValidity);
        self.check_path_validity(dt);

        self.telemetry.begin_stage(CrowdStage::UpdateMoveRequest);
        self.update_move_request(dt);

        self.telemetry.begin_stage(CrowdStage::UpdateTopologyOptimization);
        self.update_topology_optimization(dt);

        self.telemetry.begin_stage(CrowdStage::BuildProximityGrid);
        self.build_proximity_grid();

        self.telemetry.begin_stage(CrowdStage::BuildNeighbours);
        self.build_neighbours();

        self.telemetry.begin_stage(CrowdStage::FindCorners);
        self.find_corners(debug.as_deref_mut());

        self.telemetry.begin_stage(CrowdStage::TriggerOffMeshConnections);
        self.trigger_off_mesh_connections();

        self.telemetry.begin_stage(CrowdStage::CalculateSteering);
        self.calculate_steering();

        self.telemetry.begin_stage(CrowdStage::PlanVelocity);
        self.plan_velocity(debug.as_deref_mut());

        self.telemetry.begin_stage(CrowdStage::Integrate);
        for k in 0..self.active_agents.len() {
            let ag = &mut self.agents[self.active_agents[k]];
            if ag.state == CrowdAgentState::Walking {
                integrate(ag, dt);
            }
        }

        self.telemetry.begin_stage(CrowdStage::HandleCollisions);
        self.handle_collisions();

        self.telemetry.begin_stage(CrowdStage::MoveAgents);
        self.move_agents();

        self.telemetry.begin_stage(CrowdStage::UpdateOffMeshConnections);
        self.update_off_mesh_connections(dt);
        self.telemetry.end_stage();

        if log_enabled!(Level::Trace) {
            for (stage, duration) in self.telemetry.stage_durations() {
                trace!("crowd stage {stage}: {duration:?}");
            }
        }

        &self.telemetry
    }

    /// Repairs or invalidates agents whose polygons went bad and flags
    /// replans.
    fn check_path_validity(&mut self, dt: f32) {
        let lookahead = self.config.check_lookahead;
        let replan_delay = self.config.target_replan_delay;

        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            ag.target_replan_time += dt;
            let filter = &self.filters[ag.params.query_filter_type];
            let mut replan = false;

            // First check that the current location is valid.
            let mut agent_ref = ag.corridor.first_poly();
            let mut agent_pos = ag.npos;
            if !self.navquery.is_valid_poly_ref(agent_ref, filter) {
                let nearest = nearest_poly(&self.navquery, agent_pos, self.agent_placement_half_extents, filter);
                let Some((nearest_ref, nearest_pos)) = nearest else {
                    debug!("agent {idx} lost the navigation mesh at {agent_pos}, invalidating");
                    ag.corridor.reset(PolyRef::NULL, agent_pos);
                    ag.partial = false;
                    ag.boundary.reset();
                    ag.state = CrowdAgentState::Invalid;
                    continue;
                };
                agent_ref = nearest_ref;
                agent_pos = nearest_pos;

                // Keep the rest of the path so the replan can reuse it.
                ag.corridor.fix_path_start(agent_ref, agent_pos);
                ag.boundary.reset();
                ag.npos = agent_pos;
                replan = true;
            }

            if !ag.target_state.has_path_target() {
                continue;
            }

            // Try to recover the move request position.
            if ag.target_state != MoveRequestState::Failed {
                if !self.navquery.is_valid_poly_ref(ag.target_ref, filter) {
                    match nearest_poly(&self.navquery, ag.target_pos, self.agent_placement_half_extents, filter) {
                        Some((target_ref, target_pos)) => {
                            ag.target_ref = target_ref;
                            ag.target_pos = target_pos;
                        }
                        None => ag.target_ref = PolyRef::NULL,
                    }
                    replan = true;
                }
                if !ag.target_ref.is_valid() {
                    debug!("agent {idx} target is off the navigation mesh, dropping move request");
                    ag.corridor.reset(agent_ref, agent_pos);
                    ag.partial = false;
                    ag.target_state = MoveRequestState::None;
                }
            }

            if !ag.corridor.is_valid(lookahead, &self.navquery, filter) {
                ag.corridor.trim_invalid_path(agent_ref, agent_pos, &self.navquery, filter);
                ag.boundary.reset();
                replan = true;
            }

            // The end of the path is near and it is not the requested location.
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > replan_delay
                && ag.corridor.path_count() < lookahead
                && ag.corridor.last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != MoveRequestState::None {
                let (target_ref, target_pos) = (ag.target_ref, ag.target_pos);
                ag.request_target(target_ref, target_pos, true);
            }
        }
    }

    /// Runs quick searches for new requests, feeds the path queue and merges
    /// finished paths into the corridors.
    fn update_move_request(&mut self, dt: f32) {
        self.move_queue.clear();

        // Fire off new requests.
        for idx in 0..self.agents.len() {
            let ag = &mut self.agents[idx];
            if !ag.active || ag.state == CrowdAgentState::Invalid || !ag.target_state.has_path_target() {
                continue;
            }
            if matches!(
                ag.target_state,
                MoveRequestState::WaitingForQueue | MoveRequestState::WaitingForPath
            ) {
                ag.target_wait_time += dt;
            }

            if ag.target_state == MoveRequestState::Requesting {
                let filter = &self.filters[ag.params.query_filter_type];
                let path = ag.corridor.path();
                debug_assert!(!path.is_empty(), "agent corridor is empty");

                // Quick search towards the goal.
                self.navquery
                    .init_sliced_find_path(path[0], ag.target_ref, ag.npos, ag.target_pos, filter);
                self.navquery
                    .update_sliced_find_path(self.config.max_target_find_path_iterations);

                let mut req_path = Vec::with_capacity(MAX_QUICK_SEARCH_RES);
                let max_res = MAX_QUICK_SEARCH_RES.min(self.config.max_path_result);
                let status = if ag.target_replan {
                    // Try to use the existing steady path during replan.
                    self.navquery
                        .finalize_sliced_find_path_partial(path, &mut req_path, max_res)
                } else {
                    self.navquery.finalize_sliced_find_path(&mut req_path, max_res)
                };

                let mut req_pos = ag.target_pos;
                match req_path.last().copied() {
                    Some(last) if !status.is_failure() => {
                        if last != ag.target_ref {
                            // Partial path, constrain the target inside the last polygon.
                            match self.navquery.closest_point_on_poly(last, ag.target_pos) {
                                Ok(pos) => req_pos = pos,
                                Err(_) => req_path.clear(),
                            }
                        }
                    }
                    _ => req_path.clear(),
                }

                if req_path.is_empty() {
                    // Could not find a path, start the request from the current location.
                    req_pos = ag.npos;
                    req_path.push(ag.corridor.first_poly());
                }

                ag.corridor.set_corridor(req_pos, &req_path);
                ag.boundary.reset();
                ag.partial = false;

                if req_path.last() == Some(&ag.target_ref) {
                    ag.target_state = MoveRequestState::Valid;
                    ag.target_replan_time = 0.0;
                } else {
                    // The path is longer or potentially unreachable, full plan.
                    ag.target_state = MoveRequestState::WaitingForQueue;
                    ag.target_wait_time = 0.0;
                }
            }

            if ag.target_state == MoveRequestState::WaitingForQueue {
                let agents = &self.agents;
                insert_bounded(&mut self.move_queue, PATH_MAX_AGENTS, idx, |&a, &b| {
                    agents[a].target_replan_time >= agents[b].target_replan_time
                });
            }
        }

        for k in 0..self.move_queue.len() {
            let idx = self.move_queue[k];
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type];
            ag.target_pathq_ref = self.path_queue.request(
                ag.corridor.last_poly(),
                ag.target_ref,
                ag.corridor.target(),
                ag.target_pos,
                filter,
            );
            if ag.target_pathq_ref != DT_PATHQ_INVALID {
                ag.target_state = MoveRequestState::WaitingForPath;
                self.telemetry.record_enqueue_wait(ag.target_wait_time);
            }
        }

        self.path_queue.update(self.config.max_iterations_per_update);

        // Process path results.
        for idx in 0..self.agents.len() {
            let ag = &mut self.agents[idx];
            if !ag.active || ag.target_state != MoveRequestState::WaitingForPath {
                continue;
            }

            let status = self.path_queue.get_request_status(ag.target_pathq_ref);
            if status.is_failure() {
                // Retry if the target location is still valid.
                ag.target_pathq_ref = DT_PATHQ_INVALID;
                ag.target_state = if ag.target_ref.is_valid() {
                    MoveRequestState::Requesting
                } else {
                    debug!("agent {idx} path request failed");
                    MoveRequestState::Failed
                };
                ag.target_replan_time = 0.0;
                continue;
            }
            if !status.is_success() {
                continue;
            }

            self.telemetry.record_path_wait(ag.target_wait_time);

            let max_path = self.config.max_path_result;
            let res = &mut self.path_result;
            let status = self.path_queue.get_path_result(ag.target_pathq_ref, res, max_path);
            ag.target_pathq_ref = DT_PATHQ_INVALID;
            ag.partial = status.is_partial();

            let mut target_pos = ag.target_pos;
            let path = ag.corridor.path();
            // The request was issued from the last polygon of the corridor.
            let mut valid = !status.is_failure() && res.first() == path.last();

            if valid {
                if path.len() > 1 {
                    // Put the old path in front of the result.
                    let keep = path.len() - 1;
                    res.truncate(max_path.saturating_sub(keep));
                    res.splice(0..0, path[..keep].iter().copied());
                    remove_trackbacks(res);
                }

                if let Some(&last) = res.last() {
                    if last != ag.target_ref {
                        // Partial path, constrain the target inside the last polygon.
                        match self.navquery.closest_point_on_poly(last, target_pos) {
                            Ok(nearest) => target_pos = nearest,
                            Err(_) => valid = false,
                        }
                    }
                }
            }

            if valid {
                ag.corridor.set_corridor(target_pos, res);
                ag.boundary.reset();
                ag.target_state = MoveRequestState::Valid;
            } else {
                debug!("agent {idx} received a path that does not join its corridor");
                ag.target_state = MoveRequestState::Failed;
            }
            ag.target_replan_time = 0.0;
        }
    }

    fn update_topology_optimization(&mut self, dt: f32) {
        let threshold = self.config.topology_optimization_time_threshold;
        self.opt_queue.clear();

        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking
                || !ag.target_state.has_path_target()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= threshold {
                let agents = &self.agents;
                insert_bounded(
                    &mut self.opt_queue,
                    self.config.max_topology_optimization_agents,
                    idx,
                    |&a, &b| agents[a].topology_opt_time >= agents[b].topology_opt_time,
                );
            }
        }

        for k in 0..self.opt_queue.len() {
            let ag = &mut self.agents[self.opt_queue[k]];
            let filter = &self.filters[ag.params.query_filter_type];
            ag.corridor.optimize_path_topology(
                &mut self.navquery,
                filter,
                self.config.max_topology_optimization_iterations,
            );
            ag.topology_opt_time = 0.0;
        }
    }

    fn build_proximity_grid(&mut self) {
        self.grid.clear();
        for &idx in &self.active_agents {
            let ag = &self.agents[idx];
            let p = ag.npos;
            let r = ag.params.radius;
            self.grid.add_item(idx, p.x - r, p.z - r, p.x + r, p.z + r);
        }
    }

    fn build_neighbours(&mut self) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            // Refresh the collision boundary after moving far enough or when it went stale.
            let filter = &self.filters[ag.params.query_filter_type];
            let range = ag.params.collision_query_range;
            let update_thr = range * 0.25;
            if dist_2d_sqr(ag.npos, ag.boundary.center()) > sqr(update_thr)
                || !ag.boundary.is_valid(&self.navquery, filter)
            {
                if let Err(err) = ag.boundary.update(ag.corridor.first_poly(), ag.npos, range, &self.navquery, filter) {
                    warn!("agent {idx} boundary update failed: {err}");
                    ag.boundary.reset();
                }
            }

            let pos = ag.npos;
            let height = ag.params.height;
            let mut neis = std::mem::take(&mut ag.neis);
            neis.clear();

            self.grid.query_items(
                pos.x - range,
                pos.z - range,
                pos.x + range,
                pos.z + range,
                &mut self.neighbour_ids,
                MAX_NEIGHBOUR_QUERY,
            );
            for &id in &self.neighbour_ids {
                if id == idx {
                    continue;
                }
                let other = &self.agents[id];
                let mut diff = pos - other.npos;
                if diff.y.abs() >= (height + other.params.height) / 2.0 {
                    continue;
                }
                diff.y = 0.0;
                let dist_sqr = diff.length_squared();
                if dist_sqr > sqr(range) {
                    continue;
                }
                insert_bounded(
                    &mut neis,
                    DT_CROWDAGENT_MAX_NEIGHBOURS,
                    CrowdNeighbour { idx: id, dist: dist_sqr },
                    |a, b| a.dist <= b.dist,
                );
            }

            self.agents[idx].neis = neis;
        }
    }

    fn find_corners(&mut self, mut debug: Option<&mut CrowdAgentDebugInfo>) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking || !ag.target_state.has_path_target() {
                continue;
            }

            let filter = &self.filters[ag.params.query_filter_type];
            ag.corridor
                .find_corners(&mut ag.corners, DT_CROWDAGENT_MAX_CORNERS, &self.navquery);

            let info = debug.as_deref_mut().filter(|info| info.records(idx));

            // Shortcut to the corner after next when it is directly visible.
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty() {
                let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                ag.corridor.optimize_path_visibility(
                    target,
                    ag.params.path_optimization_range,
                    &self.navquery,
                    filter,
                );
                if let Some(info) = info {
                    info.opt_start = ag.corridor.pos();
                    info.opt_end = target;
                }
            } else if let Some(info) = info {
                info.opt_start = Vec3::ZERO;
                info.opt_end = Vec3::ZERO;
            }
        }
    }

    fn trigger_off_mesh_connections(&mut self) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking || !ag.target_state.has_path_target() {
                continue;
            }

            let trigger_radius = ag.params.radius * 2.25;
            let Some(con_ref) = over_off_mesh_connection(ag, trigger_radius) else {
                continue;
            };

            // Advance the path over the off-mesh connection. A blocked
            // connection is replanned by the path validity check.
            let Some(traversal) = ag.corridor.move_over_offmesh_connection(con_ref, &self.navquery) else {
                trace!("agent {idx} could not enter off-mesh connection {con_ref:?}");
                continue;
            };

            let tmax = if ag.params.max_speed > 0.0 {
                dist_2d(traversal.start, traversal.end) / ag.params.max_speed * 0.5
            } else {
                0.0
            };
            ag.anim = OffMeshAnimation {
                active: true,
                init_pos: ag.npos,
                start_pos: traversal.start,
                end_pos: traversal.end,
                poly_ref: traversal.refs[1],
                t: 0.0,
                tmax,
            };
            ag.state = CrowdAgentState::OffMesh;
            ag.corners.clear();
            ag.neis.clear();
        }
    }

    fn calculate_steering(&mut self) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking || ag.target_state == MoveRequestState::None {
                continue;
            }

            let (mut dvel, desired_speed) = if ag.target_state == MoveRequestState::Velocity {
                (ag.target_pos, ag.target_pos.length())
            } else {
                let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    smooth_steer_direction(ag)
                } else {
                    straight_steer_direction(ag)
                };
                // Slow down at the end of the path.
                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = distance_to_goal(ag, slow_down_radius) / slow_down_radius;
                (dir * ag.params.max_speed * speed_scale, ag.params.max_speed)
            };

            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let separation_weight = ag.params.separation_weight;

                let mut w = 0.0;
                let mut disp = Vec3::ZERO;
                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = separation_weight * (1.0 - sqr(dist * inv_separation_dist));
                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel += disp * (1.0 / w);
                    // Clamp to the desired speed.
                    let speed_sqr = dvel.length_squared();
                    let desired_sqr = sqr(desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel *= desired_sqr / speed_sqr;
                    }
                }
            }

            let ag = &mut self.agents[idx];
            ag.dvel = dvel;
            ag.desired_speed = desired_speed;
        }
    }

    fn plan_velocity(&mut self, mut debug: Option<&mut CrowdAgentDebugInfo>) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            let nvel = if ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                self.obstacle_query.reset();

                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];
                    self.obstacle_query
                        .add_circle(other.npos, other.params.radius, other.vel, other.dvel);
                }

                // Only walls facing the agent.
                for j in 0..ag.boundary.segment_count() {
                    let Some(s) = ag.boundary.segment(j) else {
                        continue;
                    };
                    if tri_area_2d(ag.npos, s[0], s[1]) < 0.0 {
                        continue;
                    }
                    self.obstacle_query.add_segment(s[0], s[1]);
                }

                let vod = debug
                    .as_deref_mut()
                    .filter(|info| info.records(idx))
                    .map(|info| &mut info.vod);
                let params = &self.obstacle_query_params[ag.params.obstacle_avoidance_type];
                let (pos, rad, vmax, vel, dvel) =
                    (ag.npos, ag.params.radius, ag.desired_speed, ag.vel, ag.dvel);
                let (nvel, samples) = if params.adaptive {
                    self.obstacle_query
                        .sample_velocity_adaptive(pos, rad, vmax, vel, dvel, params, vod)
                } else {
                    self.obstacle_query.sample_velocity_grid(pos, rad, vmax, vel, dvel, params, vod)
                };
                self.telemetry.velocity_sample_count += samples;
                nvel
            } else {
                ag.dvel
            };

            self.agents[idx].nvel = nvel;
        }
    }

    fn handle_collisions(&mut self) {
        let factor = self.config.collision_resolve_factor;

        for _ in 0..self.config.collision_resolve_iterations {
            for k in 0..self.active_agents.len() {
                let idx0 = self.active_agents[k];
                let ag = &self.agents[idx0];
                if ag.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut disp = Vec3::ZERO;
                let mut w = 0.0;
                for nei in &ag.neis {
                    let idx1 = nei.idx;
                    let other = &self.agents[idx1];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;

                    let radii = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > sqr(radii) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // Agents on top of each other, pick diverging directions.
                        diff = if idx0 > idx1 {
                            Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
                        } else {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((radii - dist) * 0.5) * factor
                    };

                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp *= 1.0 / w;
                }
                self.agents[idx0].disp = disp;
            }

            for k in 0..self.active_agents.len() {
                let ag = &mut self.agents[self.active_agents[k]];
                if ag.state == CrowdAgentState::Walking {
                    ag.npos += ag.disp;
                }
            }
        }
    }

    fn move_agents(&mut self) {
        for k in 0..self.active_agents.len() {
            let idx = self.active_agents[k];
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            // Move along the navigation mesh and take back the constrained position.
            let filter = &self.filters[ag.params.query_filter_type];
            if !ag.corridor.move_position(ag.npos, &self.navquery, filter) {
                trace!("agent {idx} surface move failed, keeping corridor position");
            }
            ag.npos = ag.corridor.pos();

            // Without a path target the corridor is just the current polygon.
            if !ag.target_state.has_path_target() {
                ag.corridor.reset(ag.corridor.first_poly(), ag.npos);
                ag.partial = false;
            }
        }
    }

    fn update_off_mesh_connections(&mut self, dt: f32) {
        for k in 0..self.active_agents.len() {
            let ag = &mut self.agents[self.active_agents[k]];
            let anim = &mut ag.anim;
            if !anim.active {
                continue;
            }

            anim.t += dt;
            if anim.t > anim.tmax {
                anim.active = false;
                ag.state = CrowdAgentState::Walking;
                continue;
            }

            // Ease onto the connection start, then traverse it.
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            ag.npos = if anim.t < ta {
                anim.init_pos.lerp(anim.start_pos, tween(anim.t, 0.0, ta))
            } else {
                anim.start_pos.lerp(anim.end_pos, tween(anim.t, ta, tb))
            };

            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
        }
    }

    fn active_agent_mut(&mut self, idx: usize) -> Option<&mut CrowdAgent> {
        self.agents.get_mut(idx).filter(|ag| ag.active)
    }

    /// The agent in slot `idx`, active or not
    pub fn agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx)
    }

    pub fn active_agents(&self) -> impl Iterator<Item = (usize, &CrowdAgent)> + '_ {
        self.agents.iter().enumerate().filter(|(_, ag)| ag.active)
    }

    /// Positions and states of all active agents
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.active_agents()
            .map(|(idx, ag)| AgentSnapshot {
                idx,
                pos: ag.npos,
                vel: ag.vel,
                state: ag.state,
                target_state: ag.target_state,
            })
            .collect()
    }

    /// Number of agent slots
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn set_obstacle_avoidance_params(&mut self, idx: usize, params: ObstacleAvoidanceParams) -> bool {
        match self.obstacle_query_params.get_mut(idx) {
            Some(slot) => {
                *slot = params;
                true
            }
            None => false,
        }
    }

    pub fn obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.obstacle_query_params.get(idx)
    }

    pub fn filter(&self, idx: usize) -> Option<&QueryFilter> {
        self.filters.get(idx)
    }

    pub fn filter_mut(&mut self, idx: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(idx)
    }

    /// Search extents used to place agents and targets on the mesh
    pub fn query_half_extents(&self) -> Vec3 {
        self.agent_placement_half_extents
    }

    /// Avoidance samples evaluated during the last update
    pub fn velocity_sample_count(&self) -> usize {
        self.telemetry.velocity_sample_count
    }

    pub fn telemetry(&self) -> &CrowdTelemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    pub fn grid(&self) -> &ProximityGrid {
        &self.grid
    }

    pub fn path_queue(&self) -> &PathQueue<Q> {
        &self.path_queue
    }

    pub fn nav_query(&self) -> &Q {
        &self.navquery
    }
}

fn validate_params(params: &AgentParams) -> Result<()> {
    if !(params.radius > 0.0) {
        return Err(Error::InvalidParam(format!("agent radius must be positive, got {}", params.radius)));
    }
    if params.obstacle_avoidance_type >= DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS {
        return Err(Error::InvalidParam(format!(
            "obstacle avoidance preset {} out of range",
            params.obstacle_avoidance_type
        )));
    }
    if params.query_filter_type >= DT_CROWD_MAX_QUERY_FILTER_TYPE {
        return Err(Error::InvalidParam(format!(
            "query filter {} out of range",
            params.query_filter_type
        )));
    }
    Ok(())
}

/// Nearest polygon search where a query error counts as not found
fn nearest_poly<Q: NavMeshQuery>(
    navquery: &Q,
    pos: Vec3,
    half_extents: Vec3,
    filter: &QueryFilter,
) -> Option<(PolyRef, Vec3)> {
    match navquery.find_nearest_poly(pos, half_extents, filter) {
        Ok(found) => found,
        Err(err) => {
            warn!("nearest polygon search around {pos} failed: {err}");
            None
        }
    }
}

/// Removes `A -> B -> A` detours from a merged path
fn remove_trackbacks(path: &mut Vec<PolyRef>) {
    let mut i = 1;
    while i + 1 < path.len() {
        if path[i - 1] == path[i + 1] {
            path.drain(i..i + 2);
            i = i.saturating_sub(1).max(1);
        } else {
            i += 1;
        }
    }
}

/// Returns the off-mesh connection polygon when the last corner is a
/// connection within `radius`
fn over_off_mesh_connection(ag: &CrowdAgent, radius: f32) -> Option<PolyRef> {
    let corner = ag.corners.last()?;
    if corner.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) && dist_2d_sqr(ag.npos, corner.pos) < sqr(radius) {
        Some(corner.poly)
    } else {
        None
    }
}

fn distance_to_goal(ag: &CrowdAgent, range: f32) -> f32 {
    match ag.corners.last() {
        Some(corner) if corner.flags.contains(StraightPathFlags::END) => dist_2d(ag.npos, corner.pos).min(range),
        _ => range,
    }
}

fn smooth_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let Some(p0) = ag.corners.first() else {
        return Vec3::ZERO;
    };
    let p1 = &ag.corners[1.min(ag.corners.len() - 1)];

    let mut dir0 = p0.pos - ag.npos;
    let mut dir1 = p1.pos - ag.npos;
    dir0.y = 0.0;
    dir1.y = 0.0;

    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 /= len1;
    }

    Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5).normalize_or_zero()
}

fn straight_steer_direction(ag: &CrowdAgent) -> Vec3 {
    let Some(corner) = ag.corners.first() else {
        return Vec3::ZERO;
    };
    let mut dir = corner.pos - ag.npos;
    dir.y = 0.0;
    dir.normalize_or_zero()
}

/// Bounded-acceleration velocity update followed by position integration
fn integrate(ag: &mut CrowdAgent, dt: f32) {
    let max_delta = ag.params.max_acceleration * dt;
    let mut dv = ag.nvel - ag.vel;
    let ds = dv.length();
    if ds > max_delta {
        dv *= max_delta / ds;
    }
    ag.vel += dv;

    if ag.vel.length() > 0.0001 {
        ag.npos += ag.vel * dt;
    } else {
        ag.vel = Vec3::ZERO;
    }
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nav_query::{GridMeshQuery, GridNavMesh};

    fn target_state<Q: NavMeshQuery + Clone>(crowd: &Crowd<Q>, idx: usize) -> Option<MoveRequestState> {
        crowd.agent(idx).map(|ag| ag.target_state())
    }

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&id| PolyRef::new(id)).collect()
    }

    #[test]
    fn test_create_crowd() -> Result<()> {
        let mesh = GridNavMesh::open(8, 8, 1.0, Vec3::ZERO)?;
        let crowd = Crowd::new(CrowdConfig::new(16, 0.6), GridMeshQuery::new(&mesh))?;

        assert_eq!(crowd.agent_count(), 16);
        assert_eq!(crowd.active_agents().count(), 0);
        let ext = crowd.query_half_extents();
        assert_abs_diff_eq!(ext.x, 1.2, epsilon = 1e-6);
        assert_abs_diff_eq!(ext.y, 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(ext.z, 1.2, epsilon = 1e-6);
        assert_abs_diff_eq!(crowd.grid().cell_size(), 1.8, epsilon = 1e-6);
        assert!(crowd.filter(DT_CROWD_MAX_QUERY_FILTER_TYPE - 1).is_some());
        assert!(crowd.filter(DT_CROWD_MAX_QUERY_FILTER_TYPE).is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_bad_config() -> Result<()> {
        let mesh = GridNavMesh::open(2, 2, 1.0, Vec3::ZERO)?;
        assert!(Crowd::new(CrowdConfig::new(0, 0.6), GridMeshQuery::new(&mesh)).is_err());
        assert!(Crowd::new(CrowdConfig::new(4, 0.0), GridMeshQuery::new(&mesh)).is_err());
        assert!(Crowd::new(CrowdConfig::new(4, 0.6).with_max_path_result(0), GridMeshQuery::new(&mesh)).is_err());
        Ok(())
    }

    #[test]
    fn test_add_and_remove_agents() -> Result<()> {
        let mesh = GridNavMesh::open(8, 8, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(2, 0.6), GridMeshQuery::new(&mesh))?;
        let params = AgentParams::default();

        let a = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), &params)?;
        let b = crowd.add_agent(Vec3::new(4.5, 0.0, 4.5), &params)?;
        assert_ne!(a, b);
        assert!(crowd.add_agent(Vec3::new(2.5, 0.0, 2.5), &params).is_err());

        let agent = crowd.agent(a).expect("agent");
        assert_eq!(agent.state(), CrowdAgentState::Walking);
        assert_eq!(agent.target_state(), MoveRequestState::None);
        assert_eq!(agent.corridor().path(), &[mesh.cell_ref(1, 1)]);

        crowd.remove_agent(a);
        assert_eq!(crowd.active_agents().count(), 1);
        // The freed slot is reused.
        assert_eq!(crowd.add_agent(Vec3::new(6.5, 0.0, 6.5), &params)?, a);
        Ok(())
    }

    #[test]
    fn test_agent_off_mesh_is_invalid() -> Result<()> {
        let mesh = GridNavMesh::open(4, 4, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(4, 0.5), GridMeshQuery::new(&mesh))?;
        let idx = crowd.add_agent(Vec3::new(50.0, 0.0, 50.0), &AgentParams::default().with_radius(0.5))?;
        assert_eq!(crowd.agent(idx).map(|ag| ag.state()), Some(CrowdAgentState::Invalid));

        // Invalid agents are left alone by the update.
        crowd.update(1.0 / 30.0, None);
        assert_eq!(crowd.agent(idx).map(|ag| ag.position()), Some(Vec3::new(50.0, 0.0, 50.0)));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_agent_params() -> Result<()> {
        let mesh = GridNavMesh::open(4, 4, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(4, 0.5), GridMeshQuery::new(&mesh))?;
        let pos = Vec3::new(1.5, 0.0, 1.5);
        assert!(crowd
            .add_agent(pos, &AgentParams::default().with_obstacle_avoidance_type(8))
            .is_err());
        assert!(crowd.add_agent(pos, &AgentParams::default().with_query_filter_type(16)).is_err());
        assert!(crowd.add_agent(pos, &AgentParams::default().with_radius(0.0)).is_err());

        let idx = crowd.add_agent(pos, &AgentParams::default())?;
        assert!(crowd.update_agent_parameters(idx, &AgentParams::default().with_max_speed(1.0)));
        assert_eq!(crowd.agent(idx).map(|ag| ag.params().max_speed), Some(1.0));
        assert!(!crowd.update_agent_parameters(idx, &AgentParams::default().with_query_filter_type(99)));
        assert!(!crowd.update_agent_parameters(99, &AgentParams::default()));

        crowd.remove_agent(idx);
        assert!(!crowd.update_agent_parameters(idx, &AgentParams::default().with_max_speed(2.0)));
        assert_eq!(crowd.agent(idx).map(|ag| ag.params().max_speed), Some(1.0));
        Ok(())
    }

    #[test]
    fn test_small_corridor_truncates_quick_search() -> Result<()> {
        let mesh = GridNavMesh::open(30, 1, 1.0, Vec3::ZERO)?;
        let config = CrowdConfig::new(4, 0.5).with_max_path_result(8);
        let mut crowd = Crowd::new(config, GridMeshQuery::new(&mesh))?;
        let idx = crowd.add_agent(Vec3::new(0.5, 0.0, 0.5), &AgentParams::default().with_radius(0.5))?;
        assert!(crowd.request_move_target(idx, mesh.cell_ref(20, 0), Vec3::new(20.5, 0.0, 0.5)));

        for _ in 0..60 {
            crowd.update(1.0 / 30.0, None);
            let agent = crowd.agent(idx).expect("agent");
            assert!(agent.corridor().path_count() <= 8);
            assert_ne!(agent.target_state(), MoveRequestState::Failed);
        }
        assert!(crowd.agent(idx).map_or(0.0, |ag| ag.position().x) > 2.0);
        Ok(())
    }

    #[test]
    fn test_grid_sampler_preset() -> Result<()> {
        let mesh = GridNavMesh::open(10, 10, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(4, 0.5), GridMeshQuery::new(&mesh))?;
        let params = AgentParams::default().with_radius(0.5).with_max_speed(2.0);
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 5.5), &params)?;
        assert!(crowd.request_move_target(idx, mesh.cell_ref(8, 5), Vec3::new(8.5, 0.0, 5.5)));

        // Adaptive: depth 5 over a pattern of 1 + 2 * 7 samples at most.
        let adaptive = crowd.update(1.0 / 30.0, None).velocity_sample_count;
        assert!(adaptive > 0 && adaptive <= 75, "adaptive samples {adaptive}");

        let grid = ObstacleAvoidanceParams {
            adaptive: false,
            ..Default::default()
        };
        assert!(crowd.set_obstacle_avoidance_params(params.obstacle_avoidance_type, grid));
        let sampled = crowd.update(1.0 / 30.0, None).velocity_sample_count;
        // A 33x33 grid clipped to the speed circle.
        assert!(sampled > 500 && sampled <= 33 * 33, "grid samples {sampled}");

        let agent = crowd.agent(idx).expect("agent");
        assert!(agent.planned_velocity().length() <= 2.0 + 0.1);
        assert!(agent.planned_velocity().x > 0.0);
        Ok(())
    }

    #[test]
    fn test_move_request_transitions() -> Result<()> {
        let mesh = GridNavMesh::open(8, 8, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(4, 0.6), GridMeshQuery::new(&mesh))?;
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), &AgentParams::default())?;

        // A null polygon is rejected and leaves the state alone.
        assert!(!crowd.request_move_target(idx, PolyRef::NULL, Vec3::ZERO));
        assert_eq!(target_state(&crowd, idx), Some(MoveRequestState::None));
        assert!(!crowd.request_move_target(42, mesh.cell_ref(2, 2), Vec3::ZERO));

        assert!(crowd.request_move_target(idx, mesh.cell_ref(5, 5), Vec3::new(5.5, 0.0, 5.5)));
        assert_eq!(target_state(&crowd, idx), Some(MoveRequestState::Requesting));

        crowd.update(1.0 / 30.0, None);
        assert_eq!(target_state(&crowd, idx), Some(MoveRequestState::Valid));
        let agent = crowd.agent(idx).expect("agent");
        assert_eq!(agent.corridor().last_poly(), mesh.cell_ref(5, 5));
        assert!(!agent.is_partial());

        assert!(crowd.request_move_velocity(idx, Vec3::new(1.0, 0.0, 0.0)));
        assert_eq!(target_state(&crowd, idx), Some(MoveRequestState::Velocity));

        assert!(crowd.reset_move_target(idx));
        assert_eq!(target_state(&crowd, idx), Some(MoveRequestState::None));
        assert_eq!(crowd.agent(idx).map(|ag| ag.desired_velocity()), Some(Vec3::ZERO));

        crowd.remove_agent(idx);
        assert!(!crowd.reset_move_target(idx));
        Ok(())
    }

    #[test]
    fn test_debug_info_records_agent() -> Result<()> {
        let mesh = GridNavMesh::open(10, 10, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(4, 0.5), GridMeshQuery::new(&mesh))?;
        let params = AgentParams::default().with_radius(0.5).with_max_speed(2.0);
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 5.5), &params)?;
        assert!(crowd.request_move_target(idx, mesh.cell_ref(8, 5), Vec3::new(8.5, 0.0, 5.5)));

        let mut info = CrowdAgentDebugInfo::new(idx);
        let samples = crowd.update(1.0 / 30.0, Some(&mut info)).velocity_sample_count;

        assert!(samples > 0);
        // Samples that cannot beat the best one are skipped before recording.
        assert!(info.vod.sample_count() > 0);
        assert!(info.vod.sample_count() <= samples);
        assert_abs_diff_eq!(info.opt_end.x, 8.5, epsilon = 1e-4);
        assert_eq!(crowd.velocity_sample_count(), samples);
        Ok(())
    }

    #[test]
    fn test_obstacle_avoidance_presets() -> Result<()> {
        let mesh = GridNavMesh::open(2, 2, 1.0, Vec3::ZERO)?;
        let mut crowd = Crowd::new(CrowdConfig::new(1, 0.5), GridMeshQuery::new(&mesh))?;
        let params = ObstacleAvoidanceParams {
            adaptive_divs: 5,
            ..Default::default()
        };
        assert!(crowd.set_obstacle_avoidance_params(2, params));
        assert!(!crowd.set_obstacle_avoidance_params(DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS, params));
        assert_eq!(crowd.obstacle_avoidance_params(2).map(|p| p.adaptive_divs), Some(5));
        assert!(crowd.obstacle_avoidance_params(DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS).is_none());
        Ok(())
    }

    #[test]
    fn test_remove_trackbacks() {
        let mut path = refs(&[1, 2, 1, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, refs(&[1, 3]));

        // Nested detours unwind completely.
        let mut path = refs(&[1, 2, 3, 2, 1, 4]);
        remove_trackbacks(&mut path);
        assert_eq!(path, refs(&[1, 4]));

        let mut path = refs(&[1, 2, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_integrate_clamps_acceleration() {
        let mut ag = CrowdAgent::new(4);
        ag.params = AgentParams::default().with_max_acceleration(6.0);
        ag.nvel = Vec3::new(3.0, 0.0, 0.0);

        integrate(&mut ag, 0.1);
        assert_abs_diff_eq!(ag.vel.x, 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(ag.npos.x, 0.06, epsilon = 1e-6);

        // Tiny velocities snap to rest.
        ag.vel = Vec3::new(0.00005, 0.0, 0.0);
        ag.nvel = ag.vel;
        let before = ag.npos;
        integrate(&mut ag, 0.1);
        assert_eq!(ag.vel, Vec3::ZERO);
        assert_eq!(ag.npos, before);
    }

    #[test]
    fn test_tween_is_clamped() {
        assert_eq!(tween(-1.0, 0.0, 1.0), 0.0);
        assert_abs_diff_eq!(tween(0.25, 0.0, 0.5), 0.5);
        assert_eq!(tween(2.0, 0.0, 1.0), 1.0);
    }
}
