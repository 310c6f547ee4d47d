//! Planar geometry on the xz-plane
//!
//! Navigation meshes are y-up, so every "2D" helper here ignores the y
//! component and works on (x, z).

use glam::Vec3;

/// Squared distance threshold below which two points are considered equal
const EQUAL_THRESHOLD_SQR: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);

#[inline]
pub fn sqr(x: f32) -> f32 {
    x * x
}

/// Dot product of two vectors on the xz-plane
#[inline]
pub fn dot_2d(u: Vec3, v: Vec3) -> f32 {
    u.x * v.x + u.z * v.z
}

/// Perp-dot product of two vectors on the xz-plane
#[inline]
pub fn perp_2d(u: Vec3, v: Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Signed doubled area of triangle (a, b, c) on the xz-plane.
///
/// Positive when `c` lies to the left of the directed edge `a -> b` as seen
/// from above with the funnel convention used by straight path extraction.
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_2d_sqr(a, b).sqrt()
}

#[inline]
pub fn dist_2d_sqr(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Returns true when the two points are within a tiny tolerance in 3D
#[inline]
pub fn v_equal(a: Vec3, b: Vec3) -> bool {
    a.distance_squared(b) < EQUAL_THRESHOLD_SQR
}

/// Normalizes the xz components in place, leaving y untouched.
/// Zero-length vectors are left as they are.
pub fn normalize_2d(v: Vec3) -> Vec3 {
    let d = (v.x * v.x + v.z * v.z).sqrt();
    if d == 0.0 {
        return v;
    }
    let inv = 1.0 / d;
    Vec3::new(v.x * inv, v.y, v.z * inv)
}

/// Rotates a vector around the y axis by `ang` radians
pub fn rotate_2d(v: Vec3, ang: f32) -> Vec3 {
    let (s, c) = ang.sin_cos();
    Vec3::new(v.x * c - v.z * s, v.y, v.x * s + v.z * c)
}

/// Squared distance from `pt` to segment `p..q` on the xz-plane.
///
/// Returns the squared distance together with the parametric position of the
/// closest point along the segment.
pub fn dist_pt_seg_sqr_2d(pt: Vec3, p: Vec3, q: Vec3) -> (f32, f32) {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;
    let dx = pt.x - p.x;
    let dz = pt.z - p.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;
    (dx * dx + dz * dz, t)
}

/// Time of overlap between a moving circle and a static circle on the xz-plane.
///
/// Circle `c0`/`r0` moves with velocity `v` against `c1`/`r1`. Returns the entry
/// and exit times, or `None` when the circles never touch or `v` is ~zero.
pub fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Intersects the ray `ap + u * t` with segment `bp..bq` on the xz-plane.
///
/// Returns the ray parameter `t` in `[0, 1]` on a hit.
pub fn intersect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let inv_d = 1.0 / d;
    let t = perp_2d(v, w) * inv_d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * inv_d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

/// Smallest power of two greater than or equal to `v`
pub fn next_pow2(v: u32) -> u32 {
    v.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn tri_area_sign_follows_side() {
        let a = Vec3::ZERO;
        let b = Vec3::new(1.0, 0.0, 0.0);
        // Larger z sits on the positive side for a +x edge.
        assert!(tri_area_2d(a, Vec3::new(1.0, 0.0, 1.0), b) > 0.0);
        assert!(tri_area_2d(a, b, Vec3::new(1.0, 0.0, 1.0)) < 0.0);
        assert_abs_diff_eq!(tri_area_2d(a, b, Vec3::new(2.0, 5.0, 0.0)), 0.0);
    }

    #[test]
    fn point_segment_distance_clamps_to_endpoints() {
        let p = Vec3::new(0.0, 0.0, 0.0);
        let q = Vec3::new(2.0, 0.0, 0.0);

        let (d, t) = dist_pt_seg_sqr_2d(Vec3::new(1.0, 3.0, 1.0), p, q);
        assert_abs_diff_eq!(d, 1.0);
        assert_abs_diff_eq!(t, 0.5);

        let (d, t) = dist_pt_seg_sqr_2d(Vec3::new(-1.0, 0.0, 0.0), p, q);
        assert_abs_diff_eq!(d, 1.0);
        assert_abs_diff_eq!(t, 0.0);
    }

    #[test]
    fn sweep_reports_entry_and_exit() {
        let hit = sweep_circle_circle(
            Vec3::ZERO,
            0.5,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 0.0),
            0.5,
        );
        let (tmin, tmax) = hit.expect("circles on a collision course");
        assert_abs_diff_eq!(tmin, 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(tmax, 5.0, epsilon = 1e-5);

        assert!(sweep_circle_circle(Vec3::ZERO, 0.5, Vec3::ZERO, Vec3::X, 0.5).is_none());
    }

    #[test]
    fn ray_hits_crossing_segment() {
        let t = intersect_ray_seg(
            Vec3::ZERO,
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert_abs_diff_eq!(t.unwrap_or(-1.0), 0.5, epsilon = 1e-6);

        let miss = intersect_ray_seg(
            Vec3::ZERO,
            Vec3::new(0.5, 0.0, 0.0),
            Vec3::new(1.0, 0.0, -1.0),
            Vec3::new(1.0, 0.0, 1.0),
        );
        assert!(miss.is_none());
    }

    #[test]
    fn rotate_quarter_turn() {
        let r = rotate_2d(Vec3::new(1.0, 2.0, 0.0), std::f32::consts::FRAC_PI_2);
        assert_abs_diff_eq!(r.x, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(r.y, 2.0);
        assert_abs_diff_eq!(r.z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn next_pow2_rounds_up() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(64), 64);
    }
}
