//! Module for querying loaded navigation volumes.

use bevy::math::Vec3;

use crate::{
    math::{
        closest_point_on_triangle, intersect_segment_triangle, triangle_outside_segment_bounds,
    },
    registry::VolumeRegistry,
    volume::{Aabb3, VolumeId},
};

/// Raycasts ignore hits closer than this along the segment so a cast that
/// starts flush against a surface doesn't immediately self-hit.
const RAYCAST_MIN_T: f32 = 0.01;

/// Result of [`sample_position`]: the region containing (or nearest to) the
/// queried point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavHit {
    pub volume: VolumeId,
    pub region: u32,
    /// True when the point was projected onto the region surface instead of
    /// lying inside it.
    pub on_edge: bool,
    /// World-space sampled position: the input point when inside, otherwise
    /// the nearest point on the region surface.
    pub position: Vec3,
}

/// Samples `point` against all loaded volumes.
///
/// Per volume: containment first (bound planes of every region whose AABB
/// holds the point), then, within `max_distance`, the nearest point on any
/// region triangle. The first volume-local success wins; there is no global
/// nearest-across-all-volumes.
pub fn sample_position(
    registry: &VolumeRegistry,
    point: Vec3,
    max_distance: f32,
) -> Option<NavHit> {
    for (id, volume) in registry.iter() {
        let local = volume.world_to_local.transform_point3(point);

        if volume.local_aabb.contains(local) {
            let inside = volume
                .data
                .regions
                .iter()
                .find(|region| region.aabb.contains(local) && region.contains(&volume.data.vertices, local));

            if let Some(region) = inside {
                return Some(NavHit {
                    volume: id,
                    region: region.id,
                    on_edge: false,
                    position: point,
                });
            }
        }

        if max_distance <= 0.0 {
            continue;
        }

        let search = Aabb3 {
            min: local - Vec3::splat(max_distance),
            max: local + Vec3::splat(max_distance),
        };
        if !volume.local_aabb.intersects(&search) {
            continue;
        }

        let mut best: Option<(u32, Vec3, f32)> = None;
        for region in &volume.data.regions {
            if !region.aabb.intersects(&search) {
                continue;
            }

            for triangle in region.triangle_indices.chunks_exact(3) {
                let nearest = closest_point_on_triangle(
                    volume.data.vertices[triangle[0] as usize],
                    volume.data.vertices[triangle[1] as usize],
                    volume.data.vertices[triangle[2] as usize],
                    local,
                );
                let distance_squared = nearest.distance_squared(local);

                if distance_squared <= max_distance * max_distance
                    && best.is_none_or(|(.., best_distance)| distance_squared < best_distance)
                {
                    best = Some((region.id, nearest, distance_squared));
                }
            }
        }

        if let Some((region, nearest, _)) = best {
            return Some(NavHit {
                volume: id,
                region,
                on_edge: true,
                position: volume.local_to_world.transform_point3(nearest),
            });
        }
    }

    None
}

/// Casts the segment `start`-`end` (world space) against a volume's blocking
/// triangles. Returns the smallest hit parameter `t ∈ [0, 1]`, or `-1.0` on
/// a miss (including when the volume isn't loaded).
pub fn raycast(registry: &VolumeRegistry, volume: VolumeId, start: Vec3, end: Vec3) -> f32 {
    cast_blocking(registry, volume, start, end, false)
}

/// Like [`raycast`] but returns on the first blocking hit found, without
/// searching for the nearest one.
pub fn raycast_any(registry: &VolumeRegistry, volume: VolumeId, start: Vec3, end: Vec3) -> bool {
    cast_blocking(registry, volume, start, end, true) >= 0.0
}

fn cast_blocking(
    registry: &VolumeRegistry,
    volume: VolumeId,
    start: Vec3,
    end: Vec3,
    early_return: bool,
) -> f32 {
    let Some(volume) = registry.get(volume) else {
        return -1.0;
    };

    let local_start = volume.world_to_local.transform_point3(start);
    let local_end = volume.world_to_local.transform_point3(end);
    let direction = local_end - local_start;

    let mut nearest = -1.0f32;

    for triangle in volume.data.blocking_triangle_indices.chunks_exact(3) {
        let a = volume.data.vertices[triangle[0] as usize];
        let b = volume.data.vertices[triangle[1] as usize];
        let c = volume.data.vertices[triangle[2] as usize];

        if triangle_outside_segment_bounds(local_start, local_end, a, b, c) {
            continue;
        }

        if let Some(t) =
            intersect_segment_triangle(local_start, direction, a, b, c, RAYCAST_MIN_T)
        {
            if nearest < 0.0 || t < nearest {
                nearest = t;
                if early_return {
                    break;
                }
            }
        }
    }

    nearest
}
