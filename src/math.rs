use bevy::math::Vec3;

/// Shared epsilon for geometric predicates (plane parallelism, zero velocity,
/// near-collinearity).
pub(crate) const EPSILON: f32 = 1e-5;

/// Bound-plane containment allows extra slack to accommodate drift
/// accumulated during decimation.
pub(crate) const PLANE_CONTAINMENT_EPSILON: f32 = 1e-4;

/// Two plane normals within this dot of each other count as the same
/// direction when deduplicating bound planes.
pub(crate) const NORMAL_DEDUP_DOT: f32 = 0.999_99;

/// Barycentric edge-inside tests accept points this far onto the wrong side
/// so that points on shared edges resolve to the face projection.
const EDGE_INSIDE_TOLERANCE: f32 = -1e-5;

#[inline]
pub(crate) fn triangle_normal(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    (b - a).cross(c - a)
}

/// Closest point to `point` on the segment `a`-`b`.
#[inline]
pub(crate) fn closest_point_on_segment(a: Vec3, b: Vec3, point: Vec3) -> Vec3 {
    let ab = b - a;
    let length_squared = ab.length_squared();
    if length_squared <= EPSILON * EPSILON {
        return a;
    }

    let t = (point - a).dot(ab) / length_squared;
    a + ab * t.clamp(0.0, 1.0)
}

/// Closest point to `point` on the triangle `a`-`b`-`c`, including its
/// boundary.
///
/// Projects onto the face when the projection passes all three edge-inside
/// half-plane tests (normalized cross, with tolerance), otherwise falls back
/// to the closest point on the three edges.
pub(crate) fn closest_point_on_triangle(a: Vec3, b: Vec3, c: Vec3, point: Vec3) -> Vec3 {
    let normal = triangle_normal(a, b, c);
    let normal_length = normal.length();

    if normal_length > EPSILON {
        let unit_normal = normal / normal_length;
        let projected = point - unit_normal * (point - a).dot(unit_normal);

        if point_inside_triangle_edges(a, b, c, unit_normal, projected) {
            return projected;
        }
    }

    // Degenerate triangle or projection outside, take the best edge point.
    let on_ab = closest_point_on_segment(a, b, point);
    let on_bc = closest_point_on_segment(b, c, point);
    let on_ca = closest_point_on_segment(c, a, point);

    let distance_ab = on_ab.distance_squared(point);
    let distance_bc = on_bc.distance_squared(point);
    let distance_ca = on_ca.distance_squared(point);

    if distance_ab <= distance_bc && distance_ab <= distance_ca {
        on_ab
    } else if distance_bc <= distance_ca {
        on_bc
    } else {
        on_ca
    }
}

/// True when `point` (assumed on the triangle plane) lies inside all three
/// edge half-planes of `a`-`b`-`c`.
fn point_inside_triangle_edges(a: Vec3, b: Vec3, c: Vec3, unit_normal: Vec3, point: Vec3) -> bool {
    for (from, to) in [(a, b), (b, c), (c, a)] {
        let cross = (to - from).cross(point - from);
        let cross_length = cross.length();
        if cross_length <= EPSILON {
            // On the edge line itself.
            continue;
        }

        if (cross / cross_length).dot(unit_normal) < EDGE_INSIDE_TOLERANCE {
            return false;
        }
    }

    true
}

/// Möller–Trumbore intersection of the segment `start + t * direction`,
/// `t ∈ (t_min, 1]`, against triangle `a`-`b`-`c`. No backface culling.
///
/// Returns the parameter `t` of the hit.
pub(crate) fn intersect_segment_triangle(
    start: Vec3,
    direction: Vec3,
    a: Vec3,
    b: Vec3,
    c: Vec3,
    t_min: f32,
) -> Option<f32> {
    let edge_ab = b - a;
    let edge_ac = c - a;

    let p = direction.cross(edge_ac);
    let determinant = edge_ab.dot(p);
    if determinant.abs() <= EPSILON {
        // Segment parallel to the triangle plane.
        return None;
    }

    let inverse_determinant = 1.0 / determinant;
    let to_start = start - a;

    let u = to_start.dot(p) * inverse_determinant;
    if !(-EPSILON..=1.0 + EPSILON).contains(&u) {
        return None;
    }

    let q = to_start.cross(edge_ab);
    let v = direction.dot(q) * inverse_determinant;
    if v < -EPSILON || u + v > 1.0 + EPSILON {
        return None;
    }

    let t = edge_ac.dot(q) * inverse_determinant;
    (t > t_min && t <= 1.0).then_some(t)
}

/// Cheap rejection before Möller–Trumbore: the triangle cannot intersect the
/// segment if all three vertices lie on the same side of the segment's
/// axis-aligned bounds on any axis.
#[inline]
pub(crate) fn triangle_outside_segment_bounds(
    start: Vec3,
    end: Vec3,
    a: Vec3,
    b: Vec3,
    c: Vec3,
) -> bool {
    let min = start.min(end);
    let max = start.max(end);

    for axis in 0..3 {
        if a[axis] < min[axis] && b[axis] < min[axis] && c[axis] < min[axis] {
            return true;
        }
        if a[axis] > max[axis] && b[axis] > max[axis] && c[axis] > max[axis] {
            return true;
        }
    }

    false
}

/// An arbitrary unit vector perpendicular to `direction`. Used to break
/// perfect symmetry in avoidance.
pub(crate) fn arbitrary_perpendicular(direction: Vec3) -> Vec3 {
    let candidate = if direction.x.abs() < 0.9 {
        Vec3::X
    } else {
        Vec3::Y
    };

    let perpendicular = direction.cross(candidate);
    let length = perpendicular.length();
    if length <= EPSILON {
        Vec3::Z
    } else {
        perpendicular / length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_point_on_segment_clamps_to_endpoints() {
        let a = Vec3::ZERO;
        let b = Vec3::new(2.0, 0.0, 0.0);

        assert_eq!(
            closest_point_on_segment(a, b, Vec3::new(-1.0, 1.0, 0.0)),
            a
        );
        assert_eq!(closest_point_on_segment(a, b, Vec3::new(3.0, 1.0, 0.0)), b);
        assert_eq!(
            closest_point_on_segment(a, b, Vec3::new(1.0, 1.0, 0.0)),
            Vec3::new(1.0, 0.0, 0.0)
        );
    }

    #[test]
    fn closest_point_on_triangle_face_projection() {
        let a = Vec3::ZERO;
        let b = Vec3::new(4.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 4.0);

        let closest = closest_point_on_triangle(a, b, c, Vec3::new(1.0, 2.0, 1.0));
        assert!(closest.distance(Vec3::new(1.0, 0.0, 1.0)) < 1e-5);
    }

    #[test]
    fn closest_point_on_triangle_falls_back_to_edges() {
        let a = Vec3::ZERO;
        let b = Vec3::new(4.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 4.0);

        let closest = closest_point_on_triangle(a, b, c, Vec3::new(5.0, 1.0, -2.0));
        assert!(closest.distance(Vec3::new(4.0, 0.0, 0.0)) < 1e-5);

        let closest = closest_point_on_triangle(a, b, c, Vec3::new(3.0, -1.0, 3.0));
        assert!(closest.distance(Vec3::new(2.0, 0.0, 2.0)) < 1e-5);
    }

    #[test]
    fn segment_triangle_hit_and_miss() {
        let a = Vec3::new(-1.0, -1.0, 1.0);
        let b = Vec3::new(1.0, -1.0, 1.0);
        let c = Vec3::new(0.0, 1.0, 1.0);

        let start = Vec3::new(0.0, 0.0, 0.0);
        let direction = Vec3::new(0.0, 0.0, 2.0);

        let t = intersect_segment_triangle(start, direction, a, b, c, 0.01).unwrap();
        assert!((t - 0.5).abs() < 1e-5);

        // Pointing away.
        assert!(intersect_segment_triangle(start, -direction, a, b, c, 0.01).is_none());
        // Too short.
        assert!(
            intersect_segment_triangle(start, direction * 0.25, a, b, c, 0.01).is_none()
        );
    }

    #[test]
    fn zero_length_raycast_misses() {
        let a = Vec3::new(-1.0, -1.0, 1.0);
        let b = Vec3::new(1.0, -1.0, 1.0);
        let c = Vec3::new(0.0, 1.0, 1.0);

        assert!(intersect_segment_triangle(Vec3::ZERO, Vec3::ZERO, a, b, c, 0.01).is_none());
    }

    #[test]
    fn segment_bounds_rejection() {
        let start = Vec3::ZERO;
        let end = Vec3::new(1.0, 1.0, 1.0);

        let a = Vec3::new(5.0, 0.0, 0.0);
        let b = Vec3::new(6.0, 1.0, 0.0);
        let c = Vec3::new(5.0, 0.0, 1.0);
        assert!(triangle_outside_segment_bounds(start, end, a, b, c));

        let inside = Vec3::new(0.5, 0.5, 0.5);
        assert!(!triangle_outside_segment_bounds(start, end, a, b, inside));
    }

    #[test]
    fn arbitrary_perpendicular_is_perpendicular() {
        for direction in [Vec3::X, Vec3::Y, Vec3::Z, Vec3::new(0.3, -0.8, 0.5)] {
            let perpendicular = arbitrary_perpendicular(direction);
            assert!(perpendicular.dot(direction).abs() < 1e-5);
            assert!((perpendicular.length() - 1.0).abs() < 1e-5);
        }
    }
}
