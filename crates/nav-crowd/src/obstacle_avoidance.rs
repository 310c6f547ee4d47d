//! Velocity-obstacle based local avoidance
//!
//! Candidate velocities are scored against nearby agents (circles) and walls
//! (segments). The score mixes deviation from the desired and current
//! velocity, a side preference for passing obstacles, and the time to the
//! first impact within the sampling horizon.

use glam::Vec3;
use nav_common::{
    dist_2d, dist_pt_seg_sqr_2d, dot_2d, intersect_ray_seg, normalize_2d, rotate_2d, sqr,
    sweep_circle_circle, tri_area_2d,
};

pub const DT_MAX_PATTERN_DIVS: usize = 32;
pub const DT_MAX_PATTERN_RINGS: usize = 4;

/// Agent treated as a moving circular obstacle
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleCircle {
    /// Position of the obstacle
    pub p: Vec3,
    /// Velocity of the obstacle
    pub vel: Vec3,
    /// Desired velocity of the obstacle
    pub dvel: Vec3,
    /// Radius of the obstacle
    pub rad: f32,
    /// Direction towards the obstacle, used for side selection
    pub dp: Vec3,
    /// Preferred passing side, used for side selection
    pub np: Vec3,
}

/// Static wall segment
#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleSegment {
    /// Start point of the obstacle segment
    pub p: Vec3,
    /// End point of the obstacle segment
    pub q: Vec3,
    /// The agent is practically touching the segment
    pub touch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleAvoidanceParams {
    /// Fraction of the desired velocity the sample field is centered on
    pub vel_bias: f32,
    /// Weight for deviating from the desired velocity
    pub weight_des_vel: f32,
    /// Weight for deviating from the current velocity
    pub weight_cur_vel: f32,
    /// Weight for passing obstacles on the wrong side
    pub weight_side: f32,
    /// Weight for time of impact
    pub weight_toi: f32,
    /// Sampling horizon in seconds
    pub horiz_time: f32,
    /// Grid size for grid-based sampling
    pub grid_size: u8,
    /// Angular divisions of the adaptive pattern
    pub adaptive_divs: u8,
    /// Rings of the adaptive pattern
    pub adaptive_rings: u8,
    /// Refinement rounds of adaptive sampling
    pub adaptive_depth: u8,
    /// Use the adaptive pattern instead of the brute-force grid
    pub adaptive: bool,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
            adaptive: true,
        }
    }
}

/// One evaluated candidate velocity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AvoidanceSample {
    pub vel: Vec3,
    pub size: f32,
    pub pen: f32,
    pub vpen: f32,
    pub vcpen: f32,
    pub spen: f32,
    pub tpen: f32,
}

/// Records the samples of one avoidance call for inspection
#[derive(Debug, Clone, Default)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<AvoidanceSample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn add_sample(&mut self, sample: AvoidanceSample) {
        if self.samples.len() >= self.max_samples {
            return;
        }
        self.samples.push(sample);
    }

    /// Rescales every penalty column to [0, 1]
    pub fn normalize_samples(&mut self) {
        normalize_column(&mut self.samples, |s| &mut s.pen);
        normalize_column(&mut self.samples, |s| &mut s.vpen);
        normalize_column(&mut self.samples, |s| &mut s.vcpen);
        normalize_column(&mut self.samples, |s| &mut s.spen);
        normalize_column(&mut self.samples, |s| &mut s.tpen);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn sample(&self, i: usize) -> Option<&AvoidanceSample> {
        self.samples.get(i)
    }

    pub fn samples(&self) -> &[AvoidanceSample] {
        &self.samples
    }
}

fn normalize_column(samples: &mut [AvoidanceSample], field: impl Fn(&mut AvoidanceSample) -> &mut f32) {
    if samples.is_empty() {
        return;
    }
    let mut min_pen = f32::MAX;
    let mut max_pen = -f32::MAX;
    for s in samples.iter_mut() {
        let v = *field(s);
        min_pen = min_pen.min(v);
        max_pen = max_pen.max(v);
    }
    let range = max_pen - min_pen;
    let scale = if range > 0.001 { 1.0 / range } else { 1.0 };
    for s in samples.iter_mut() {
        let v = field(s);
        *v = ((*v - min_pen) * scale).clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,

    max_circles: usize,
    circles: Vec<ObstacleCircle>,

    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a circular obstacle, ignored once the circle list is full
    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    /// Adds a wall segment, ignored once the segment list is full
    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment { p, q, touch: false });
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn circle(&self, i: usize) -> Option<&ObstacleCircle> {
        self.circles.get(i)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, i: usize) -> Option<&ObstacleSegment> {
        self.segments.get(i)
    }

    /// Brute-force samples a square grid of candidate velocities.
    /// Returns the chosen velocity and the number of samples taken.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.setup(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let mut nvel = Vec3::ZERO;
        let cvx = dvel.x * params.vel_bias;
        let cvz = dvel.z * params.vel_bias;
        let grid = params.grid_size.max(2) as usize;
        let cs = vmax * 2.0 * (1.0 - params.vel_bias) / (grid - 1) as f32;
        let half = (grid - 1) as f32 * cs * 0.5;

        let mut min_penalty = f32::MAX;
        let mut ns = 0;

        for y in 0..grid {
            for x in 0..grid {
                let vcand = Vec3::new(cvx + x as f32 * cs - half, 0.0, cvz + y as f32 * cs - half);
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + cs / 2.0) {
                    continue;
                }

                let penalty = self.process_sample(vcand, cs, pos, rad, vel, dvel, min_penalty, debug.as_deref_mut());
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }

        (nvel, ns)
    }

    /// Samples a polar pattern aligned with the desired velocity, refining
    /// around the best candidate with a halved radius each round.
    /// Returns the chosen velocity and the number of samples taken.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.setup(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let pattern = build_pattern(dvel, params);

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = Vec3::new(dvel.x * params.vel_bias, 0.0, dvel.z * params.vel_bias);
        let mut ns = 0;

        for _ in 0..params.adaptive_depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;

            for &(px, pz) in &pattern {
                let vcand = Vec3::new(res.x + px * cr, 0.0, res.z + pz * cr);
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + 0.001) {
                    continue;
                }

                let penalty =
                    self.process_sample(vcand, cr / 10.0, pos, rad, vel, dvel, min_penalty, debug.as_deref_mut());
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (res, ns)
    }

    fn setup(&mut self, pos: Vec3, vmax: f32, dvel: Vec3, params: &ObstacleAvoidanceParams) {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            cir.dp = (cir.p - pos).normalize_or_zero();
            let dv = cir.dvel - dvel;
            let a = tri_area_2d(Vec3::ZERO, cir.dp, dv);
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        for seg in &mut self.segments {
            let (d, _) = dist_pt_seg_sqr_2d(pos, seg.p, seg.q);
            seg.touch = d < sqr(0.01);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: Vec3,
        cs: f32,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> f32 {
        let params = &self.params;

        // Penalty for straying away from the desired and current velocities.
        let vpen = params.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        // Hit time below which this sample cannot beat the best one.
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = params.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal velocity obstacle.
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5)
                .min(dot_2d(cir.np, vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad) else {
                continue;
            };

            // Avoid more when overlapped.
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let mut htmin = if seg.touch {
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                // Moving away from a touching wall is free.
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match intersect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Avoid less when facing walls.
            htmin *= 2.0;

            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }

        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));

        let penalty = vpen + vcpen + spen + tpen;

        if let Some(debug) = debug {
            debug.add_sample(AvoidanceSample {
                vel: vcand,
                size: cs,
                pen: penalty,
                vpen,
                vcpen,
                spen,
                tpen,
            });
        }

        penalty
    }
}

/// Unit-radius sample pattern: the origin followed by rings of points, the
/// first point of each ring aligned with the desired direction and every
/// other ring rotated by half a division.
fn build_pattern(dvel: Vec3, params: &ObstacleAvoidanceParams) -> Vec<(f32, f32)> {
    let nd = (params.adaptive_divs as usize).clamp(1, DT_MAX_PATTERN_DIVS);
    let nr = (params.adaptive_rings as usize).clamp(1, DT_MAX_PATTERN_RINGS);
    let da = std::f32::consts::TAU / nd as f32;
    let (sa, ca) = da.sin_cos();

    let dir = normalize_2d(dvel);
    let ddir = [dir, rotate_2d(dir, da * 0.5)];

    let mut pattern = Vec::with_capacity(nd * nr + 1);
    pattern.push((0.0, 0.0));

    for j in 0..nr {
        let r = (nr - j) as f32 / nr as f32;
        let first = (ddir[j % 2].x * r, ddir[j % 2].z * r);
        pattern.push(first);

        let mut last1 = first;
        let mut last2 = first;
        let mut i = 1;
        while i + 1 < nd {
            // Next point on the right, rotating clockwise.
            let right = (last1.0 * ca + last1.1 * sa, -last1.0 * sa + last1.1 * ca);
            // Next point on the left, rotating counter-clockwise.
            let left = (last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca);
            pattern.push(right);
            pattern.push(left);
            last1 = right;
            last2 = left;
            i += 2;
        }

        if nd % 2 == 0 {
            pattern.push((last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca));
        }
    }

    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const VMAX: f32 = 2.0;

    #[test]
    fn test_pattern_size() {
        let params = ObstacleAvoidanceParams::default();
        let pattern = build_pattern(Vec3::new(1.0, 0.0, 0.0), &params);
        // Center plus two rings of seven divisions.
        assert_eq!(pattern.len(), 1 + 2 * 7);
        assert_abs_diff_eq!(pattern[1].0, 1.0);
        assert_abs_diff_eq!(pattern[1].1, 0.0);

        let even = ObstacleAvoidanceParams {
            adaptive_divs: 8,
            ..Default::default()
        };
        let pattern = build_pattern(Vec3::new(0.0, 0.0, 1.0), &even);
        assert_eq!(pattern.len(), 1 + 2 * 8);
        for &(x, z) in &pattern[1..9] {
            assert_abs_diff_eq!((x * x + z * z).sqrt(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_adaptive_without_obstacles_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = Vec3::new(VMAX, 0.0, 0.0);
        let (nvel, ns) = query.sample_velocity_adaptive(
            Vec3::ZERO,
            0.5,
            VMAX,
            dvel,
            dvel,
            &ObstacleAvoidanceParams::default(),
            None,
        );
        assert!(ns > 0);
        assert_abs_diff_eq!(nvel.x, dvel.x, epsilon = 1e-3);
        assert_abs_diff_eq!(nvel.z, dvel.z, epsilon = 1e-3);
    }

    #[test]
    fn test_grid_without_obstacles_stays_near_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        let dvel = Vec3::new(0.0, 0.0, -VMAX);
        let (nvel, ns) = query.sample_velocity_grid(Vec3::ZERO, 0.5, VMAX, dvel, dvel, &params, None);
        let cs = VMAX * 2.0 * (1.0 - params.vel_bias) / (params.grid_size as f32 - 1.0);
        assert!(ns > 0);
        assert!(nvel.distance(dvel) <= cs);
    }

    #[test]
    fn test_head_on_circle_is_avoided() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = Vec3::new(VMAX, 0.0, 0.0);
        query.add_circle(Vec3::new(1.5, 0.0, 0.0), 0.5, -dvel, -dvel);

        let (nvel, _) = query.sample_velocity_adaptive(
            Vec3::ZERO,
            0.6,
            VMAX,
            dvel,
            dvel,
            &ObstacleAvoidanceParams::default(),
            None,
        );
        assert!(nvel.distance(dvel) > 0.1);
        assert!(nvel.length_squared() <= sqr(VMAX + 0.001));
    }

    #[test]
    fn test_wall_ahead_slows_agent() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = Vec3::new(VMAX, 0.0, 0.0);
        query.add_segment(Vec3::new(1.0, 0.0, -5.0), Vec3::new(1.0, 0.0, 5.0));

        let (nvel, _) = query.sample_velocity_adaptive(
            Vec3::ZERO,
            0.5,
            VMAX,
            dvel,
            dvel,
            &ObstacleAvoidanceParams::default(),
            None,
        );
        assert!(nvel.x < 1.5);
    }

    #[test]
    fn test_touching_segment_sets_touch() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        query.add_segment(Vec3::new(1.0, 0.0, 0.005), Vec3::new(-1.0, 0.0, 0.005));
        query.add_segment(Vec3::new(1.0, 0.0, 3.0), Vec3::new(-1.0, 0.0, 3.0));
        query.prepare(Vec3::ZERO, Vec3::ZERO);
        assert!(query.segment(0).is_some_and(|s| s.touch));
        assert!(query.segment(1).is_some_and(|s| !s.touch));
    }

    #[test]
    fn test_capacity_truncates_silently() {
        let mut query = ObstacleAvoidanceQuery::new(2, 1);
        for i in 0..4 {
            query.add_circle(Vec3::new(i as f32, 0.0, 0.0), 0.5, Vec3::ZERO, Vec3::ZERO);
            query.add_segment(Vec3::ZERO, Vec3::ONE);
        }
        assert_eq!(query.circle_count(), 2);
        assert_eq!(query.segment_count(), 1);
        query.reset();
        assert_eq!(query.circle_count(), 0);
    }

    #[test]
    fn test_debug_samples_normalize() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let mut debug = ObstacleAvoidanceDebugData::new(512);
        let dvel = Vec3::new(1.0, 0.0, 1.0);
        query.add_circle(Vec3::new(1.0, 0.0, 1.0), 0.5, Vec3::ZERO, Vec3::ZERO);
        let (_, ns) = query.sample_velocity_adaptive(
            Vec3::ZERO,
            0.5,
            VMAX,
            Vec3::ZERO,
            dvel,
            &ObstacleAvoidanceParams::default(),
            Some(&mut debug),
        );
        assert!(debug.sample_count() > 0);
        assert!(debug.sample_count() <= ns);

        debug.normalize_samples();
        for s in debug.samples() {
            assert!((0.0..=1.0).contains(&s.pen));
            assert!((0.0..=1.0).contains(&s.tpen));
        }
    }
}
