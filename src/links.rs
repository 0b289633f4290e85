use bevy::math::{Mat4, Vec3};

use crate::{
    math::closest_point_on_triangle,
    volume::{Aabb3, ExternalLink, VolumeData, VolumeId},
};

/// Connects regions of different volumes whose surfaces come within
/// `max_distance` of each other, writing reciprocal [`ExternalLink`]s into
/// the volume data (positions in each owning volume's local space).
///
/// This is a separate pass over already-baked volumes, not part of the bake
/// pipeline itself.
pub fn connect_external_links(
    volumes: &mut [(VolumeId, &mut VolumeData, Mat4)],
    max_distance: f32,
) {
    // Clear previous links; the pass rebuilds all of them.
    for (_, data, _) in volumes.iter_mut() {
        for region in &mut data.regions {
            region.external_links.clear();
        }
        data.external_links_are_local_space = true;
    }

    let max_distance_squared = max_distance * max_distance;

    for first in 0..volumes.len() {
        for second in first + 1..volumes.len() {
            let (head, tail) = volumes.split_at_mut(second);
            let (id_a, data_a, to_world_a) = &mut head[first];
            let (id_b, data_b, to_world_b) = &mut tail[0];

            // Bounding-sphere reject before any triangle work.
            let bounds_a = world_bounds(data_a, *to_world_a);
            let bounds_b = world_bounds(data_b, *to_world_b);
            let gap = bounds_a.center().distance(bounds_b.center())
                - bounds_a.bounding_radius()
                - bounds_b.bounding_radius();
            if gap > max_distance {
                continue;
            }

            let world_to_a = to_world_a.inverse();
            let world_to_b = to_world_b.inverse();

            for region_a in 0..data_a.regions.len() {
                for region_b in 0..data_b.regions.len() {
                    let Some((point_a, point_b, distance_squared)) = nearest_between_regions(
                        data_a, region_a, *to_world_a, data_b, region_b, *to_world_b,
                    ) else {
                        continue;
                    };

                    if distance_squared > max_distance_squared {
                        continue;
                    }

                    let cost = distance_squared.sqrt();

                    data_a.regions[region_a].external_links.push(ExternalLink {
                        to_volume: *id_b,
                        to_region: region_b as u32,
                        from_position: world_to_a.transform_point3(point_a),
                        to_position: world_to_a.transform_point3(point_b),
                        cost,
                    });
                    data_b.regions[region_b].external_links.push(ExternalLink {
                        to_volume: *id_a,
                        to_region: region_a as u32,
                        from_position: world_to_b.transform_point3(point_b),
                        to_position: world_to_b.transform_point3(point_a),
                        cost,
                    });
                }
            }
        }
    }
}

fn world_bounds(data: &VolumeData, to_world: Mat4) -> Aabb3 {
    Aabb3::from_points(
        data.vertices
            .iter()
            .map(|vertex| to_world.transform_point3(*vertex)),
    )
}

/// Mutual nearest point pair between two regions' triangle surfaces in world
/// space: seed with the best vertex-to-triangle projection in both
/// directions, then refine the winner against the opposite surface.
fn nearest_between_regions(
    data_a: &VolumeData,
    region_a: usize,
    to_world_a: Mat4,
    data_b: &VolumeData,
    region_b: usize,
    to_world_b: Mat4,
) -> Option<(Vec3, Vec3, f32)> {
    let triangles_a = &data_a.regions[region_a].triangle_indices;
    let triangles_b = &data_b.regions[region_b].triangle_indices;
    if triangles_a.is_empty() || triangles_b.is_empty() {
        return None;
    }

    let vertex_a = |index: u32| to_world_a.transform_point3(data_a.vertices[index as usize]);
    let vertex_b = |index: u32| to_world_b.transform_point3(data_b.vertices[index as usize]);

    let mut best: Option<(Vec3, Vec3, f32)> = None;

    for index in triangles_b {
        let point = vertex_b(*index);
        let (nearest, distance_squared) = nearest_on_surface(triangles_a, &vertex_a, point);
        if best.is_none_or(|(.., best_distance)| distance_squared < best_distance) {
            best = Some((nearest, point, distance_squared));
        }
    }

    for index in triangles_a {
        let point = vertex_a(*index);
        let (nearest, distance_squared) = nearest_on_surface(triangles_b, &vertex_b, point);
        if best.is_none_or(|(.., best_distance)| distance_squared < best_distance) {
            best = Some((point, nearest, distance_squared));
        }
    }

    // Refine: project the winning point on A back onto B's surface.
    let (point_a, _, _) = best?;
    let (point_b, distance_squared) = nearest_on_surface(triangles_b, &vertex_b, point_a);

    Some((point_a, point_b, distance_squared))
}

fn nearest_on_surface(
    triangle_indices: &[u32],
    vertex: &impl Fn(u32) -> Vec3,
    point: Vec3,
) -> (Vec3, f32) {
    let mut best = Vec3::ZERO;
    let mut best_distance = f32::MAX;

    for triangle in triangle_indices.chunks_exact(3) {
        let candidate = closest_point_on_triangle(
            vertex(triangle[0]),
            vertex(triangle[1]),
            vertex(triangle[2]),
            point,
        );
        let distance = candidate.distance_squared(point);
        if distance < best_distance {
            best_distance = distance;
            best = candidate;
        }
    }

    (best, best_distance)
}
