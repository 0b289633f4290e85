use bevy::math::{IVec3, UVec3, Vec3};

/// Label of a voxel overlapping blocking geometry.
pub(crate) const VOXEL_BLOCKED: i32 = 0;
/// Label of an open voxel that has not been assigned a region yet.
pub(crate) const VOXEL_OPEN: i32 = -1;

/// Offsets of the six face neighbours of a voxel.
pub(crate) const NEIGHBOUR_OFFSETS: [IVec3; 6] = [
    IVec3::new(-1, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, -1, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(0, 0, -1),
    IVec3::new(0, 0, 1),
];

/// Which region labels a probe should match.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RegionFilter {
    Single(i32),
    /// Matches either label. Used when testing whether the union of two
    /// regions is still convex.
    OneOf(i32, i32),
}

impl RegionFilter {
    #[inline]
    pub(crate) fn matches(&self, label: i32) -> bool {
        match *self {
            RegionFilter::Single(region) => label == region,
            RegionFilter::OneOf(region_a, region_b) => label == region_a || label == region_b,
        }
    }
}

/// Flat-indexed 3D grid of region labels, laid out X, then Y, then Z.
///
/// Out-of-bounds reads resolve to [`VOXEL_BLOCKED`], which lets cube scans
/// run over the -1 border without special cases.
#[derive(Clone, Debug)]
pub(crate) struct VoxelGrid {
    dimensions: UVec3,
    voxels: Box<[i32]>,
}

impl VoxelGrid {
    pub(crate) fn new(dimensions: UVec3, initial_label: i32) -> Self {
        let length = (dimensions.x * dimensions.y * dimensions.z) as usize;
        Self {
            dimensions,
            voxels: vec![initial_label; length].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    #[inline]
    pub(crate) fn voxel_count(&self) -> usize {
        self.voxels.len()
    }

    #[inline]
    pub(crate) fn in_bounds(&self, position: IVec3) -> bool {
        position.x >= 0
            && position.y >= 0
            && position.z >= 0
            && (position.x as u32) < self.dimensions.x
            && (position.y as u32) < self.dimensions.y
            && (position.z as u32) < self.dimensions.z
    }

    #[inline]
    pub(crate) fn index(&self, position: UVec3) -> usize {
        (position.x
            + position.y * self.dimensions.x
            + position.z * self.dimensions.x * self.dimensions.y) as usize
    }

    #[inline]
    pub(crate) fn position(&self, index: usize) -> UVec3 {
        let index = index as u32;
        let slice = self.dimensions.x * self.dimensions.y;
        UVec3::new(
            index % self.dimensions.x,
            (index % slice) / self.dimensions.x,
            index / slice,
        )
    }

    /// Label at `position`, treating anything outside the grid as blocked.
    #[inline]
    pub(crate) fn label(&self, position: IVec3) -> i32 {
        if self.in_bounds(position) {
            self.voxels[self.index(position.as_uvec3())]
        } else {
            VOXEL_BLOCKED
        }
    }

    #[inline]
    pub(crate) fn set_label(&mut self, position: UVec3, label: i32) {
        let index = self.index(position);
        self.voxels[index] = label;
    }

    #[inline]
    pub(crate) fn labels(&self) -> &[i32] {
        &self.voxels
    }

    #[inline]
    pub(crate) fn labels_mut(&mut self) -> &mut [i32] {
        &mut self.voxels
    }

    /// True when the voxel at `position` matches `filter`, out-of-bounds
    /// reading as blocked.
    #[inline]
    pub(crate) fn is_one_of(&self, position: IVec3, filter: RegionFilter) -> bool {
        filter.matches(self.label(position))
    }
}

/// World-space center of the voxel at `position` inside a grid anchored at
/// `bounds_min`.
#[inline]
pub(crate) fn voxel_center(bounds_min: Vec3, voxel_size: f32, position: UVec3) -> Vec3 {
    bounds_min + (position.as_vec3() + Vec3::splat(0.5)) * voxel_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        let grid = VoxelGrid::new(UVec3::new(3, 4, 5), VOXEL_OPEN);

        for z in 0..5 {
            for y in 0..4 {
                for x in 0..3 {
                    let position = UVec3::new(x, y, z);
                    assert_eq!(grid.position(grid.index(position)), position);
                }
            }
        }
    }

    #[test]
    fn out_of_bounds_reads_blocked() {
        let grid = VoxelGrid::new(UVec3::new(2, 2, 2), VOXEL_OPEN);

        assert_eq!(grid.label(IVec3::new(-1, 0, 0)), VOXEL_BLOCKED);
        assert_eq!(grid.label(IVec3::new(0, 2, 0)), VOXEL_BLOCKED);
        assert_eq!(grid.label(IVec3::new(0, 0, 0)), VOXEL_OPEN);
    }

    #[test]
    fn one_of_probe() {
        let mut grid = VoxelGrid::new(UVec3::new(2, 1, 1), VOXEL_OPEN);
        grid.set_label(UVec3::new(0, 0, 0), 1);
        grid.set_label(UVec3::new(1, 0, 0), 2);

        let filter = RegionFilter::OneOf(1, 2);
        assert!(grid.is_one_of(IVec3::new(0, 0, 0), filter));
        assert!(grid.is_one_of(IVec3::new(1, 0, 0), filter));
        assert!(!grid.is_one_of(IVec3::new(0, 0, 0), RegionFilter::Single(2)));
        assert!(!grid.is_one_of(IVec3::new(2, 0, 0), filter));
    }

    #[test]
    fn voxel_centers() {
        let center = voxel_center(Vec3::new(-5.0, 0.0, 5.0), 0.5, UVec3::new(0, 1, 2));
        assert_eq!(center, Vec3::new(-4.75, 0.75, 6.25));
    }
}
