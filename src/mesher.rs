use bevy::{
    math::{IVec3, Vec3},
    platform::collections::HashMap,
};
use smallvec::SmallVec;

use crate::{
    grid::VoxelGrid,
    tables::{ACROSS_CENTER_MIDPOINTS, CORNER_OFFSETS, EDGE_CORNERS, TRI_TABLE},
};

/// Label of the blocking surface (the boundary towards blocked space) in the
/// triangle soup. Region surfaces use their region index `0..`.
pub(crate) const BLOCKING_LABEL: i32 = -1;

pub(crate) struct SoupTriangle {
    pub indices: [u32; 3],
    /// Sorted labels whose surface this triangle belongs to. A triangle on
    /// the boundary between two regions (or a region and blocked space)
    /// carries both.
    pub labels: SmallVec<[i32; 2]>,
    pub alive: bool,
}

/// Triangle soup shared by every region surface plus the blocking surface,
/// with the per-triangle and per-vertex label tracking that link building
/// and decimation rely on.
pub(crate) struct LabeledSoup {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<SoupTriangle>,
    /// Alive incident triangles per vertex.
    pub vertex_triangles: Vec<SmallVec<[u32; 8]>>,
    vertex_lookup: HashMap<IVec3, u32>,
    triangle_lookup: HashMap<[u32; 3], u32>,
}

impl LabeledSoup {
    fn new() -> Self {
        Self {
            vertices: Vec::new(),
            triangles: Vec::new(),
            vertex_triangles: Vec::new(),
            vertex_lookup: HashMap::new(),
            triangle_lookup: HashMap::new(),
        }
    }

    /// Vertices are deduplicated on their position quantized to half-voxel
    /// units; every Marching-Cubes vertex lands exactly on that lattice.
    fn resolve_vertex(&mut self, grid_position: Vec3, bounds_min: Vec3, voxel_size: f32) -> u32 {
        let key = (grid_position * 2.0).round().as_ivec3();

        if let Some(index) = self.vertex_lookup.get(&key) {
            return *index;
        }

        let index = self.vertices.len() as u32;
        self.vertices.push(bounds_min + grid_position * voxel_size);
        self.vertex_triangles.push(SmallVec::new());
        self.vertex_lookup.insert(key, index);
        index
    }

    fn add_triangle(&mut self, indices: [u32; 3], label: i32) {
        let mut key = indices;
        key.sort_unstable();

        if let Some(existing) = self.triangle_lookup.get(&key) {
            let labels = &mut self.triangles[*existing as usize].labels;
            if let Err(slot) = labels.binary_search(&label) {
                labels.insert(slot, label);
            }
            return;
        }

        let triangle = self.triangles.len() as u32;
        self.triangles.push(SoupTriangle {
            indices,
            labels: SmallVec::from_slice(&[label]),
            alive: true,
        });
        self.triangle_lookup.insert(key, triangle);
        for index in indices {
            self.vertex_triangles[index as usize].push(triangle);
        }
    }

    /// Registers a decimation refill triangle carrying a whole label set.
    pub(crate) fn add_triangle_with_labels(&mut self, indices: [u32; 3], labels: &[i32]) {
        let mut key = indices;
        key.sort_unstable();

        if let Some(existing) = self.triangle_lookup.get(&key).copied() {
            let triangle = &mut self.triangles[existing as usize];
            if !triangle.alive {
                triangle.alive = true;
                triangle.indices = indices;
                for index in indices {
                    self.vertex_triangles[index as usize].push(existing);
                }
            }
            for label in labels {
                if let Err(slot) = triangle.labels.binary_search(label) {
                    triangle.labels.insert(slot, *label);
                }
            }
            return;
        }

        let triangle = self.triangles.len() as u32;
        self.triangles.push(SoupTriangle {
            indices,
            labels: SmallVec::from_slice(labels),
            alive: true,
        });
        self.triangle_lookup.insert(key, triangle);
        for index in indices {
            self.vertex_triangles[index as usize].push(triangle);
        }
    }

    pub(crate) fn remove_triangle(&mut self, triangle: u32) {
        let entry = &mut self.triangles[triangle as usize];
        if !entry.alive {
            return;
        }
        entry.alive = false;

        let indices = entry.indices;
        for index in indices {
            self.vertex_triangles[index as usize].retain(|candidate| *candidate != triangle);
        }
    }

    /// Labels a vertex belongs to, from its alive incident triangles.
    pub(crate) fn vertex_labels(&self, vertex: u32) -> SmallVec<[i32; 4]> {
        let mut labels: SmallVec<[i32; 4]> = SmallVec::new();
        for triangle in &self.vertex_triangles[vertex as usize] {
            for label in &self.triangles[*triangle as usize].labels {
                if let Err(slot) = labels.binary_search(label) {
                    labels.insert(slot, *label);
                }
            }
        }
        labels
    }

    pub(crate) fn alive_triangles(&self) -> impl Iterator<Item = &SoupTriangle> {
        self.triangles.iter().filter(|triangle| triangle.alive)
    }
}

/// Step 5: Marching-Cubes surface extraction over every 2×2×2 voxel-center
/// cube, including the half-cubes off the -1 border. Each distinct label
/// among a cube's corners (region index, or [`BLOCKING_LABEL`] for blocked
/// space) emits its own case triangles; identical triangles from different
/// labels merge into one soup entry carrying both labels.
pub(crate) fn build_surface_soup(
    grid: &VoxelGrid,
    bounds_min: Vec3,
    voxel_size: f32,
) -> LabeledSoup {
    let mut soup = LabeledSoup::new();
    let dimensions = grid.dimensions().as_ivec3();

    for z in -1..dimensions.z {
        for y in -1..dimensions.y {
            for x in -1..dimensions.x {
                let base = IVec3::new(x, y, z);

                let mut corner_labels = [BLOCKING_LABEL; 8];
                for (corner, offset) in CORNER_OFFSETS.iter().enumerate() {
                    corner_labels[corner] = grid.label(base + *offset) - 1;
                }

                let mut remaining: SmallVec<[i32; 4]> = SmallVec::new();
                for label in corner_labels {
                    if !remaining.contains(&label) {
                        remaining.push(label);
                    }
                }

                for label in remaining {
                    let mut case = 0usize;
                    for (corner, corner_label) in corner_labels.iter().enumerate() {
                        if *corner_label == label {
                            case |= 1 << corner;
                        }
                    }

                    if case == 0 || case == 255 {
                        continue;
                    }

                    emit_cube_triangles(&mut soup, base, case, label, bounds_min, voxel_size);
                }
            }
        }
    }

    soup
}

fn emit_cube_triangles(
    soup: &mut LabeledSoup,
    base: IVec3,
    case: usize,
    label: i32,
    bounds_min: Vec3,
    voxel_size: f32,
) {
    for triangle_edges in TRI_TABLE[case].chunks_exact(3) {
        let edges = [
            triangle_edges[0] as usize,
            triangle_edges[1] as usize,
            triangle_edges[2] as usize,
        ];

        let positions = edges.map(|edge| edge_midpoint(base, edge));

        // A triangle spanning two mutually across-center edges cuts the cube
        // diagonally; opposite cubes from different regions disagree on that
        // diagonal, so it is split at the cube center instead.
        let across_pair = [(0, 1), (1, 2), (2, 0)]
            .into_iter()
            .find(|(a, b)| ACROSS_CENTER_MIDPOINTS[edges[*a]] == edges[*b]);

        if let Some((a, b)) = across_pair {
            let c = 3 - a - b;
            let center = base.as_vec3() + Vec3::ONE;

            let vertex_a = soup.resolve_vertex(positions[a], bounds_min, voxel_size);
            let vertex_b = soup.resolve_vertex(positions[b], bounds_min, voxel_size);
            let vertex_c = soup.resolve_vertex(positions[c], bounds_min, voxel_size);
            let vertex_center = soup.resolve_vertex(center, bounds_min, voxel_size);

            // Splitting edge a-b at the center keeps the winding.
            match (a, b) {
                (0, 1) => {
                    soup.add_triangle([vertex_a, vertex_center, vertex_c], label);
                    soup.add_triangle([vertex_center, vertex_b, vertex_c], label);
                }
                (1, 2) => {
                    soup.add_triangle([vertex_c, vertex_a, vertex_center], label);
                    soup.add_triangle([vertex_c, vertex_center, vertex_b], label);
                }
                _ => {
                    soup.add_triangle([vertex_c, vertex_a, vertex_center], label);
                    soup.add_triangle([vertex_c, vertex_center, vertex_b], label);
                }
            }
        } else {
            let indices =
                positions.map(|position| soup.resolve_vertex(position, bounds_min, voxel_size));
            soup.add_triangle(indices, label);
        }
    }
}

/// Midpoint of a cube edge in grid coordinates (voxel units, corner voxel
/// centers sit at `base + offset + 0.5`).
#[inline]
fn edge_midpoint(base: IVec3, edge: usize) -> Vec3 {
    let [corner_a, corner_b] = EDGE_CORNERS[edge];
    let a = (base + CORNER_OFFSETS[corner_a]).as_vec3() + Vec3::splat(0.5);
    let b = (base + CORNER_OFFSETS[corner_b]).as_vec3() + Vec3::splat(0.5);
    (a + b) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::VOXEL_BLOCKED;
    use bevy::math::UVec3;

    #[test]
    fn single_voxel_region_meshes_to_an_octahedron() {
        let mut grid = VoxelGrid::new(UVec3::splat(1), VOXEL_BLOCKED);
        grid.set_label(UVec3::ZERO, 1);

        let soup = build_surface_soup(&grid, Vec3::ZERO, 1.0);

        // Eight corner triangles shared between the region surface and the
        // blocking surface, over the six axis midpoints.
        assert_eq!(soup.alive_triangles().count(), 8);
        assert_eq!(soup.vertices.len(), 6);
        for triangle in soup.alive_triangles() {
            assert_eq!(triangle.labels.as_slice(), &[BLOCKING_LABEL, 0]);
        }

        // The surface wraps the voxel center.
        let center = Vec3::splat(0.5);
        for vertex in &soup.vertices {
            assert!((vertex.distance(center) - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn adjacent_regions_share_the_face_midpoint() {
        let mut grid = VoxelGrid::new(UVec3::new(2, 1, 1), VOXEL_BLOCKED);
        grid.set_label(UVec3::new(0, 0, 0), 1);
        grid.set_label(UVec3::new(1, 0, 0), 2);

        let soup = build_surface_soup(&grid, Vec3::ZERO, 1.0);

        let labels_of = |vertex: u32| soup.vertex_labels(vertex);

        let shared: Vec<u32> = (0..soup.vertices.len() as u32)
            .filter(|vertex| {
                let labels = labels_of(*vertex);
                labels.contains(&0) && labels.contains(&1)
            })
            .collect();

        // Exactly the midpoint of the face between the two voxels.
        assert_eq!(shared.len(), 1);
        assert_eq!(soup.vertices[shared[0] as usize], Vec3::new(1.0, 0.5, 0.5));
    }

    #[test]
    fn open_box_blocking_surface_is_watertight() {
        let mut grid = VoxelGrid::new(UVec3::splat(3), VOXEL_BLOCKED);
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..3 {
                    grid.set_label(UVec3::new(x, y, z), 1);
                }
            }
        }

        let soup = build_surface_soup(&grid, Vec3::ZERO, 1.0);

        // Every edge of the blocking surface is used by exactly two blocking
        // triangles.
        let mut edge_counts: HashMap<[u32; 2], u32> = HashMap::new();
        for triangle in soup.alive_triangles() {
            if !triangle.labels.contains(&BLOCKING_LABEL) {
                continue;
            }
            let [a, b, c] = triangle.indices;
            for (from, to) in [(a, b), (b, c), (c, a)] {
                let key = [from.min(to), from.max(to)];
                *edge_counts.entry(key).or_default() += 1;
            }
        }

        assert!(!edge_counts.is_empty());
        assert!(edge_counts.values().all(|count| *count == 2));
    }
}
