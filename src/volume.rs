use std::fmt;

use bevy::{math::Vec3, platform::collections::HashMap};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    math::{triangle_normal, EPSILON, NORMAL_DEDUP_DOT, PLANE_CONTAINMENT_EPSILON},
    mesher::{LabeledSoup, BLOCKING_LABEL},
};

/// Stable identifier of a navigation volume, unique process-wide and across
/// reloads.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize,
)]
pub struct VolumeId(pub u64);

impl VolumeId {
    /// Derives a stable id by hashing a stable name (FNV-1a, folded to keep
    /// the id non-negative).
    pub fn from_name(name: &str) -> Self {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }

        VolumeId(hash & (u64::MAX >> 1))
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{:#x}", self.0)
    }
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Aabb3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb3 {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Aabb3 {
            min: Vec3::MAX,
            max: Vec3::MIN,
        };
        for point in points {
            aabb.min = aabb.min.min(point);
            aabb.max = aabb.max.max(point);
        }
        aabb
    }

    #[inline]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb3) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    #[inline]
    pub fn expanded(&self, amount: f32) -> Aabb3 {
        Aabb3 {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn bounding_radius(&self) -> f32 {
        (self.max - self.center()).length()
    }
}

/// Outward-pointing half-space bounding a convex region, anchored on one of
/// the region's vertices.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BoundPlane {
    pub normal: Vec3,
    pub vertex_index: u32,
}

/// Neighbour relation between two regions of the same volume, carrying the
/// geometry they share. At least one of the lists is non-empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InternalLink {
    pub to_region: u32,
    pub shared_vertices: Vec<u32>,
    pub shared_edges: Vec<[u32; 2]>,
    pub shared_triangles: Vec<[u32; 3]>,
}

/// Bridge between two regions of different volumes. Positions are in the
/// owning volume's local space iff
/// [`VolumeData::external_links_are_local_space`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalLink {
    pub to_volume: VolumeId,
    pub to_region: u32,
    pub from_position: Vec3,
    pub to_position: Vec3,
    /// Cached Euclidean length of the bridge itself.
    pub cost: f32,
}

/// A convex polyhedral subset of a volume's open space.
///
/// For any point inside the AABB, the point lies in the region iff
/// `dot(p - vertices[plane.vertex_index], plane.normal) <= 0` for every
/// bound plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Region {
    pub id: u32,
    pub aabb: Aabb3,
    /// Indices into the volume's vertex array, three per triangle.
    pub triangle_indices: Vec<u32>,
    pub internal_links: Vec<InternalLink>,
    pub external_links: Vec<ExternalLink>,
    pub bound_planes: Vec<BoundPlane>,
}

impl Region {
    /// Bound-plane containment test against the shared vertex array.
    pub fn contains(&self, vertices: &[Vec3], point: Vec3) -> bool {
        self.bound_planes.iter().all(|plane| {
            let anchor = vertices[plane.vertex_index as usize];
            (point - anchor).dot(plane.normal) <= PLANE_CONTAINMENT_EPSILON
        })
    }
}

/// Everything baked for one volume. Immutable once built; shared behind an
/// `Arc` by the registry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeData {
    pub vertices: Vec<Vec3>,
    pub regions: Vec<Region>,
    /// Impassible surface used by raycasts, three indices per triangle.
    pub blocking_triangle_indices: Vec<u32>,
    pub external_links_are_local_space: bool,
}

/// Step 7: flattens the decimated soup into the serialized form, computing
/// region AABBs, outward bound planes and the internal links between
/// neighbouring regions.
pub(crate) fn build_volume_data(soup: &LabeledSoup, region_count: u32) -> VolumeData {
    // Compact to the vertices still referenced by alive triangles.
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut vertices = Vec::new();
    let mut resolve = |index: u32, vertices: &mut Vec<Vec3>| -> u32 {
        *remap.entry(index).or_insert_with(|| {
            vertices.push(soup.vertices[index as usize]);
            vertices.len() as u32 - 1
        })
    };

    let mut region_triangles: Vec<Vec<u32>> = vec![Vec::new(); region_count as usize];
    let mut blocking_triangle_indices = Vec::new();

    for triangle in soup.alive_triangles() {
        let indices = triangle.indices.map(|index| resolve(index, &mut vertices));

        for label in &triangle.labels {
            if *label == BLOCKING_LABEL {
                blocking_triangle_indices.extend(indices);
            } else {
                region_triangles[*label as usize].extend(indices);
            }
        }
    }

    // Shared features between region pairs, keyed (smaller, larger).
    let mut shared_vertices: HashMap<(u32, u32), Vec<u32>> = HashMap::new();
    let mut shared_edges: HashMap<(u32, u32), Vec<[u32; 2]>> = HashMap::new();
    let mut shared_triangles: HashMap<(u32, u32), Vec<[u32; 3]>> = HashMap::new();

    let mut edge_labels: HashMap<[u32; 2], SmallVec<[i32; 4]>> = HashMap::new();
    let mut vertex_labels: HashMap<u32, SmallVec<[i32; 4]>> = HashMap::new();

    for triangle in soup.alive_triangles() {
        let indices = triangle.indices.map(|index| remap[&index]);

        let regions: SmallVec<[i32; 2]> = triangle
            .labels
            .iter()
            .copied()
            .filter(|label| *label != BLOCKING_LABEL)
            .collect();

        for (slot, region_a) in regions.iter().enumerate() {
            for region_b in regions.iter().skip(slot + 1) {
                let key = (*region_a as u32, *region_b as u32);
                let mut sorted = indices;
                sorted.sort_unstable();
                shared_triangles.entry(key).or_default().push(sorted);
            }
        }

        let [a, b, c] = indices;
        for (from, to) in [(a, b), (b, c), (c, a)] {
            let key = [from.min(to), from.max(to)];
            let labels = edge_labels.entry(key).or_default();
            for region in &regions {
                if !labels.contains(region) {
                    labels.push(*region);
                }
            }
        }
        for index in indices {
            let labels = vertex_labels.entry(index).or_default();
            for region in &regions {
                if !labels.contains(region) {
                    labels.push(*region);
                }
            }
        }
    }

    for (edge, labels) in &edge_labels {
        for (slot, region_a) in labels.iter().enumerate() {
            for region_b in labels.iter().skip(slot + 1) {
                let key = (
                    (*region_a).min(*region_b) as u32,
                    (*region_a).max(*region_b) as u32,
                );
                shared_edges.entry(key).or_default().push(*edge);
            }
        }
    }
    for (vertex, labels) in &vertex_labels {
        for (slot, region_a) in labels.iter().enumerate() {
            for region_b in labels.iter().skip(slot + 1) {
                let key = (
                    (*region_a).min(*region_b) as u32,
                    (*region_a).max(*region_b) as u32,
                );
                shared_vertices.entry(key).or_default().push(*vertex);
            }
        }
    }

    let mut regions = Vec::with_capacity(region_count as usize);
    for (region_index, triangle_indices) in region_triangles.into_iter().enumerate() {
        let region_id = region_index as u32;

        let aabb = Aabb3::from_points(
            triangle_indices
                .iter()
                .map(|index| vertices[*index as usize]),
        );

        let bound_planes = build_bound_planes(&vertices, &triangle_indices);

        // One link per neighbouring region, sorted by target id, with the
        // shared multisets in canonical order so reciprocal links compare
        // equal.
        let mut internal_links = Vec::new();
        let mut neighbours: Vec<u32> = shared_vertices
            .keys()
            .filter_map(|(a, b)| {
                if *a == region_id {
                    Some(*b)
                } else if *b == region_id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        neighbours.sort_unstable();
        neighbours.dedup();

        for neighbour in neighbours {
            let key = (region_id.min(neighbour), region_id.max(neighbour));

            let mut link = InternalLink {
                to_region: neighbour,
                shared_vertices: shared_vertices.get(&key).cloned().unwrap_or_default(),
                shared_edges: shared_edges.get(&key).cloned().unwrap_or_default(),
                shared_triangles: shared_triangles.get(&key).cloned().unwrap_or_default(),
            };
            link.shared_vertices.sort_unstable();
            link.shared_edges.sort_unstable();
            link.shared_triangles.sort_unstable();

            internal_links.push(link);
        }

        regions.push(Region {
            id: region_id,
            aabb,
            triangle_indices,
            internal_links,
            external_links: Vec::new(),
            bound_planes,
        });
    }

    VolumeData {
        vertices,
        regions,
        blocking_triangle_indices,
        external_links_are_local_space: true,
    }
}

/// Bound planes from the region's triangle normals, flipped to face away
/// from the region centroid and deduplicated by direction. When the centroid
/// lands exactly on a plane the plane is kept with its emitted orientation.
fn build_bound_planes(vertices: &[Vec3], triangle_indices: &[u32]) -> Vec<BoundPlane> {
    let mut centroid = Vec3::ZERO;
    let mut count = 0;
    let mut seen: Vec<u32> = Vec::new();
    for index in triangle_indices {
        if !seen.contains(index) {
            seen.push(*index);
            centroid += vertices[*index as usize];
            count += 1;
        }
    }
    if count == 0 {
        return Vec::new();
    }
    centroid /= count as f32;

    let mut planes: Vec<BoundPlane> = Vec::new();

    for triangle in triangle_indices.chunks_exact(3) {
        let anchor = triangle[0];
        let a = vertices[triangle[0] as usize];
        let b = vertices[triangle[1] as usize];
        let c = vertices[triangle[2] as usize];

        let normal = triangle_normal(a, b, c);
        let length = normal.length();
        if length <= EPSILON {
            continue;
        }

        let mut normal = normal / length;
        if (centroid - a).dot(normal) > 0.0 {
            normal = -normal;
        }

        if planes
            .iter()
            .any(|plane| plane.normal.dot(normal) > NORMAL_DEDUP_DOT)
        {
            continue;
        }

        planes.push(BoundPlane {
            normal,
            vertex_index: anchor,
        });
    }

    planes
}

impl VolumeData {
    /// Rewrites the volume ids referenced by external links.
    ///
    /// When the id derivation changes between releases, hosts replay the
    /// derivation over their stable names and feed the old-to-new mapping
    /// through here before re-persisting. Ids absent from the map are kept.
    pub fn remap_volume_ids(&mut self, map: &HashMap<VolumeId, VolumeId>) {
        for region in &mut self.regions {
            for link in &mut region.external_links {
                if let Some(new_id) = map.get(&link.to_volume) {
                    link.to_volume = *new_id;
                }
            }
        }
    }
}

const BLOB_MAGIC: [u8; 4] = *b"OXVL";
const BLOB_VERSION: u32 = 1;

/// Errors produced when encoding or decoding the persisted volume blob.
#[derive(Debug)]
pub enum BlobError {
    BadMagic,
    UnsupportedVersion(u32),
    Truncated,
    Serialization(String),
}

impl fmt::Display for BlobError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlobError::BadMagic => write!(formatter, "not a volume blob"),
            BlobError::UnsupportedVersion(version) => {
                write!(formatter, "unsupported volume blob version {version}")
            }
            BlobError::Truncated => write!(formatter, "volume blob is truncated"),
            BlobError::Serialization(message) => write!(formatter, "{message}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl VolumeData {
    /// Encodes into the opaque, versioned per-volume blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlobError> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&BLOB_MAGIC);
        bytes.extend_from_slice(&BLOB_VERSION.to_le_bytes());

        bincode::serialize_into(&mut bytes, self)
            .map_err(|error| BlobError::Serialization(error.to_string()))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() < 8 {
            return Err(BlobError::Truncated);
        }
        if bytes[0..4] != BLOB_MAGIC {
            return Err(BlobError::BadMagic);
        }

        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != BLOB_VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }

        bincode::deserialize(&bytes[8..])
            .map_err(|error| BlobError::Serialization(error.to_string()))
    }
}
