//! Per-tick crowd statistics and stage timing

use std::fmt;
use std::time::Duration;
use web_time::Instant;

/// Pipeline stages of a crowd update, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrowdStage {
    CheckPathValidity,
    UpdateMoveRequest,
    UpdateTopologyOptimization,
    BuildProximityGrid,
    BuildNeighbours,
    FindCorners,
    TriggerOffMeshConnections,
    CalculateSteering,
    PlanVelocity,
    Integrate,
    HandleCollisions,
    MoveAgents,
    UpdateOffMeshConnections,
}

impl CrowdStage {
    pub const COUNT: usize = 13;

    pub const ALL: [CrowdStage; Self::COUNT] = [
        CrowdStage::CheckPathValidity,
        CrowdStage::UpdateMoveRequest,
        CrowdStage::UpdateTopologyOptimization,
        CrowdStage::BuildProximityGrid,
        CrowdStage::BuildNeighbours,
        CrowdStage::FindCorners,
        CrowdStage::TriggerOffMeshConnections,
        CrowdStage::CalculateSteering,
        CrowdStage::PlanVelocity,
        CrowdStage::Integrate,
        CrowdStage::HandleCollisions,
        CrowdStage::MoveAgents,
        CrowdStage::UpdateOffMeshConnections,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CrowdStage::CheckPathValidity => "check path validity",
            CrowdStage::UpdateMoveRequest => "update move request",
            CrowdStage::UpdateTopologyOptimization => "update topology optimization",
            CrowdStage::BuildProximityGrid => "build proximity grid",
            CrowdStage::BuildNeighbours => "build neighbours",
            CrowdStage::FindCorners => "find corners",
            CrowdStage::TriggerOffMeshConnections => "trigger off-mesh connections",
            CrowdStage::CalculateSteering => "calculate steering",
            CrowdStage::PlanVelocity => "plan velocity",
            CrowdStage::Integrate => "integrate",
            CrowdStage::HandleCollisions => "handle collisions",
            CrowdStage::MoveAgents => "move agents",
            CrowdStage::UpdateOffMeshConnections => "update off-mesh connections",
        }
    }
}

impl fmt::Display for CrowdStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statistics gathered during the last crowd update. Reset at the start of
/// every tick.
#[derive(Debug, Clone, Default)]
pub struct CrowdTelemetry {
    /// Avoidance samples evaluated this tick
    pub velocity_sample_count: usize,
    /// Longest simulated time an agent waited for a path queue slot
    pub max_time_to_enqueue_request: f32,
    /// Longest simulated time between queueing a request and its result
    pub max_time_to_find_path: f32,
    /// Wall-clock time spent in each stage
    stage_durations: [Duration; CrowdStage::COUNT],
    active_stage: Option<(CrowdStage, Instant)>,
}

impl CrowdTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Starts timing `stage`, closing any stage still running
    pub fn begin_stage(&mut self, stage: CrowdStage) {
        self.end_stage();
        self.active_stage = Some((stage, Instant::now()));
    }

    /// Stops the running stage timer and records its duration
    pub fn end_stage(&mut self) {
        if let Some((stage, start)) = self.active_stage.take() {
            self.stage_durations[stage.index()] += start.elapsed();
        }
    }

    pub fn record_enqueue_wait(&mut self, time: f32) {
        self.max_time_to_enqueue_request = self.max_time_to_enqueue_request.max(time);
    }

    pub fn record_path_wait(&mut self, time: f32) {
        self.max_time_to_find_path = self.max_time_to_find_path.max(time);
    }

    pub fn stage_duration(&self, stage: CrowdStage) -> Duration {
        self.stage_durations[stage.index()]
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.stage_durations.iter().sum()
    }

    pub fn stage_durations(&self) -> impl Iterator<Item = (CrowdStage, Duration)> + '_ {
        CrowdStage::ALL.iter().map(|&stage| (stage, self.stage_durations[stage.index()]))
    }
}
