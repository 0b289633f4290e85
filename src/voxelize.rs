use bevy::math::{IVec3, UVec3, Vec3};
use parry3d::{math::Isometry, query::intersection_test, shape::Ball, shape::SharedShape};

use crate::{
    grid::{voxel_center, VoxelGrid, NEIGHBOUR_OFFSETS, VOXEL_BLOCKED, VOXEL_OPEN},
    volume::Aabb3,
    NavVolumeSettings,
};

/// A blocking collider snapshotted into the bake task, already transformed
/// into the volume's local space.
pub struct BlockerShape {
    pub shape: SharedShape,
    pub isometry: Isometry<f32>,
    pub layers: u32,
    pub is_static: bool,
}

/// Samples the physics environment into a voxel grid of
/// [`VOXEL_BLOCKED`]/[`VOXEL_OPEN`] labels.
///
/// A voxel is blocked when any sample sphere of `max_agent_radius` overlaps
/// a blocker on the volume's blocking layers. With `enable_multi_query` the
/// samples form an N×N×N lattice covering the voxel, `N = ceil(voxel_size /
/// max_agent_radius) + 1`, accepting on any hit.
pub(crate) fn voxelize_volume(
    aabb: &Aabb3,
    settings: &NavVolumeSettings,
    blockers: &[BlockerShape],
) -> VoxelGrid {
    let extents = aabb.max - aabb.min;
    let dimensions = UVec3::new(
        (extents.x / settings.voxel_size) as u32,
        (extents.y / settings.voxel_size) as u32,
        (extents.z / settings.voxel_size) as u32,
    );

    let mut grid = VoxelGrid::new(dimensions, VOXEL_OPEN);

    let relevant: Vec<&BlockerShape> = blockers
        .iter()
        .filter(|blocker| {
            blocker.layers & settings.blocking_layers != 0
                && (!settings.static_only || blocker.is_static)
        })
        .collect();

    if !relevant.is_empty() {
        let lattice_side = if settings.enable_multi_query {
            (settings.voxel_size / settings.max_agent_radius).ceil() as u32 + 1
        } else {
            1
        };

        for z in 0..dimensions.z {
            for y in 0..dimensions.y {
                for x in 0..dimensions.x {
                    let position = UVec3::new(x, y, z);
                    if voxel_is_blocked(aabb.min, settings, &relevant, position, lattice_side) {
                        grid.set_label(position, VOXEL_BLOCKED);
                    }
                }
            }
        }
    }

    if let Some(start_locations) = &settings.start_locations {
        reclassify_unreachable(&mut grid, aabb, settings.voxel_size, start_locations);
    }

    grid
}

fn voxel_is_blocked(
    bounds_min: Vec3,
    settings: &NavVolumeSettings,
    blockers: &[&BlockerShape],
    position: UVec3,
    lattice_side: u32,
) -> bool {
    let voxel_min = bounds_min + position.as_vec3() * settings.voxel_size;

    for sample_z in 0..lattice_side {
        for sample_y in 0..lattice_side {
            for sample_x in 0..lattice_side {
                let sample = if lattice_side == 1 {
                    voxel_center(bounds_min, settings.voxel_size, position)
                } else {
                    let step = settings.voxel_size / (lattice_side - 1) as f32;
                    voxel_min
                        + Vec3::new(
                            sample_x as f32 * step,
                            sample_y as f32 * step,
                            sample_z as f32 * step,
                        )
                };

                if sphere_overlaps_any(sample, settings.max_agent_radius, blockers) {
                    return true;
                }
            }
        }
    }

    false
}

fn sphere_overlaps_any(center: Vec3, radius: f32, blockers: &[&BlockerShape]) -> bool {
    let ball = Ball::new(radius);
    let ball_position = Isometry::translation(center.x, center.y, center.z);

    blockers.iter().any(|blocker| {
        intersection_test(&ball_position, &ball, &blocker.isometry, &*blocker.shape)
            .unwrap_or(false)
    })
}

/// BFS from the start voxels; any open voxel the flood never reaches is
/// reclassified as blocked.
fn reclassify_unreachable(
    grid: &mut VoxelGrid,
    aabb: &Aabb3,
    voxel_size: f32,
    start_locations: &[Vec3],
) {
    let mut reached = vec![false; grid.voxel_count()];
    let mut queue = Vec::with_capacity(256);

    for location in start_locations {
        let voxel = ((*location - aabb.min) / voxel_size).floor();
        let voxel = IVec3::new(voxel.x as i32, voxel.y as i32, voxel.z as i32);
        if !grid.in_bounds(voxel) || grid.label(voxel) == VOXEL_BLOCKED {
            continue;
        }

        let index = grid.index(voxel.as_uvec3());
        if !reached[index] {
            reached[index] = true;
            queue.push(voxel);
        }
    }

    while let Some(voxel) = queue.pop() {
        for offset in NEIGHBOUR_OFFSETS {
            let neighbour = voxel + offset;
            if !grid.in_bounds(neighbour) || grid.label(neighbour) == VOXEL_BLOCKED {
                continue;
            }

            let index = grid.index(neighbour.as_uvec3());
            if !reached[index] {
                reached[index] = true;
                queue.push(neighbour);
            }
        }
    }

    for (index, reached) in reached.iter().enumerate() {
        if !reached && grid.labels()[index] == VOXEL_OPEN {
            grid.labels_mut()[index] = VOXEL_BLOCKED;
        }
    }
}
