use bevy::{log::warn, math::Vec3, platform::collections::HashMap};
use smallvec::SmallVec;

use crate::{
    math::{triangle_normal, EPSILON},
    mesher::LabeledSoup,
};

/// Two adjacent face normals closer than this |dot| count as coplanar; the
/// edge between them is otherwise sharp.
const SHARP_EDGE_DOT: f32 = 0.95;

/// Corner angle considered a straight line when picking ears.
const COLLINEAR_DOT: f32 = -0.999_99;

/// Step 6: removes vertices whose surrounding surface is flat (no sharp
/// edges) or lies along a single crease (exactly two sharp edges), refilling
/// each fan hole by ear clipping.
///
/// Only vertices whose incident triangles all carry an identical label set
/// are candidates; every mesh containing such a vertex then shares the same
/// fan, so a single refill preserves the features shared between regions and
/// with the blocking surface.
///
/// Returns the number of vertices removed.
pub(crate) fn decimate_soup(soup: &mut LabeledSoup) -> usize {
    let mut removed = 0;
    let mut cursor = 0;

    while let Some(next) = decimate_range(soup, cursor, usize::MAX, &mut removed) {
        cursor = next;
    }

    removed
}

/// Processes up to `budget` vertices starting at `start`, so async callers
/// can yield between batches. Returns the next start index, or `None` when
/// the pass is complete.
pub(crate) fn decimate_range(
    soup: &mut LabeledSoup,
    start: usize,
    budget: usize,
    removed: &mut usize,
) -> Option<usize> {
    let end = soup.vertices.len().min(start.saturating_add(budget));

    for vertex in start..end {
        if try_remove_vertex(soup, vertex as u32) {
            *removed += 1;
        }
    }

    (end < soup.vertices.len()).then_some(end)
}

fn try_remove_vertex(soup: &mut LabeledSoup, vertex: u32) -> bool {
    let fan: SmallVec<[u32; 8]> = soup.vertex_triangles[vertex as usize].clone();
    if fan.len() < 3 {
        return false;
    }

    // All incident triangles must agree on their label set, otherwise the
    // containing meshes have different fans around this vertex and a shared
    // refill is impossible.
    let labels = soup.triangles[fan[0] as usize].labels.clone();
    if fan
        .iter()
        .any(|triangle| soup.triangles[*triangle as usize].labels != labels)
    {
        return false;
    }

    let Some(ring) = walk_boundary_ring(soup, vertex, &fan) else {
        return false;
    };

    let sharp: SmallVec<[u32; 2]> = ring
        .iter()
        .copied()
        .filter(|other| is_sharp_edge(soup, vertex, *other))
        .collect();

    let new_triangles = match sharp.len() {
        0 => {
            let normal = newell_normal(&soup.vertices, &ring);
            ear_clip_polygon(&soup.vertices, &ring, normal)
        }
        2 => refill_around_crease(soup, &ring, sharp[0], sharp[1]),
        _ => return false,
    };

    let Some(new_triangles) = new_triangles else {
        warn!(
            "Ear clipping failed around vertex {vertex} (ring of {}), keeping it.",
            ring.len()
        );
        return false;
    };

    for triangle in fan {
        soup.remove_triangle(triangle);
    }
    for indices in new_triangles {
        soup.add_triangle_with_labels(indices, &labels);
    }

    true
}

/// Orders the fan's outer edges into a closed ring around `vertex` by
/// repeatedly hopping to the triangle that shares the current ring vertex
/// and the removed vertex. Edge direction is ignored; shared triangles keep
/// whichever winding they were first emitted with.
fn walk_boundary_ring(soup: &LabeledSoup, vertex: u32, fan: &[u32]) -> Option<Vec<u32>> {
    // The edge of each fan triangle that does not touch `vertex`.
    let mut outer_edges: Vec<[u32; 2]> = Vec::with_capacity(fan.len());
    for triangle in fan {
        let indices = soup.triangles[*triangle as usize].indices;
        let position = indices.iter().position(|index| *index == vertex)?;
        outer_edges.push([indices[(position + 1) % 3], indices[(position + 2) % 3]]);
    }

    let mut ring = Vec::with_capacity(fan.len());
    let mut used = vec![false; outer_edges.len()];

    ring.push(outer_edges[0][0]);
    let mut current = outer_edges[0][1];
    used[0] = true;

    for _ in 1..outer_edges.len() {
        let next = outer_edges
            .iter()
            .enumerate()
            .find(|(index, edge)| !used[*index] && edge.contains(&current));

        let Some((index, edge)) = next else {
            // "Next edge" not found: the fan is not a closed manifold disk.
            warn!("No next edge while walking the ring around vertex {vertex}.");
            return None;
        };

        ring.push(current);
        current = if edge[0] == current { edge[1] } else { edge[0] };
        used[index] = true;
    }

    (current == ring[0] && ring.len() == fan.len()).then_some(ring)
}

/// An edge is sharp when, within any label's surface, its two adjacent
/// triangles bend past the coplanarity threshold. Non-manifold edges count
/// as sharp.
fn is_sharp_edge(soup: &LabeledSoup, a: u32, b: u32) -> bool {
    let mut per_label: HashMap<i32, SmallVec<[Vec3; 2]>> = HashMap::new();

    for triangle in &soup.vertex_triangles[a as usize] {
        let entry = &soup.triangles[*triangle as usize];
        if !entry.indices.contains(&b) {
            continue;
        }

        let [i0, i1, i2] = entry.indices;
        let normal = triangle_normal(
            soup.vertices[i0 as usize],
            soup.vertices[i1 as usize],
            soup.vertices[i2 as usize],
        )
        .normalize_or_zero();

        for label in &entry.labels {
            per_label.entry(*label).or_default().push(normal);
        }
    }

    per_label.values().any(|normals| {
        normals.len() != 2 || normals[0].dot(normals[1]).abs() < SHARP_EDGE_DOT
    })
}

/// Polygon normal consistent with the ring's own orientation (Newell-style,
/// summed around the centroid). The refill is validated against this, so the
/// ring may run in either direction around the hole.
fn newell_normal(vertices: &[Vec3], ring: &[u32]) -> Vec3 {
    let centroid = ring
        .iter()
        .map(|vertex| vertices[*vertex as usize])
        .sum::<Vec3>()
        / ring.len() as f32;

    let mut normal = Vec3::ZERO;
    for (index, vertex) in ring.iter().enumerate() {
        let a = vertices[*vertex as usize] - centroid;
        let b = vertices[ring[(index + 1) % ring.len()] as usize] - centroid;
        normal += a.cross(b);
    }
    normal.normalize_or_zero()
}

/// Splits the ring at the two crease endpoints and refills each side
/// separately; both halves close over the `s1`-`s2` edge, which keeps the
/// crease connected through the refill.
fn refill_around_crease(
    soup: &LabeledSoup,
    ring: &[u32],
    s1: u32,
    s2: u32,
) -> Option<Vec<[u32; 3]>> {
    let start = ring.iter().position(|vertex| *vertex == s1)?;
    let split = ring.iter().position(|vertex| *vertex == s2)?;
    if start == split {
        return None;
    }

    let length = ring.len();
    let mut first_chain = Vec::new();
    let mut second_chain = Vec::new();

    let mut index = start;
    loop {
        first_chain.push(ring[index]);
        if index == split {
            break;
        }
        index = (index + 1) % length;
    }
    loop {
        second_chain.push(ring[index]);
        if index == start {
            break;
        }
        index = (index + 1) % length;
    }

    let mut triangles = Vec::new();
    for chain in [first_chain, second_chain] {
        if chain.len() < 3 {
            continue;
        }
        let normal = newell_normal(&soup.vertices, &chain);
        triangles.extend(ear_clip_polygon(&soup.vertices, &chain, normal)?);
    }

    Some(triangles)
}

/// Ear clipping over a (near planar) polygon ring.
///
/// Each iteration clips the convex, non-flat ear with the sharpest corner
/// angle, preferring ears adjacent to a nearly collinear corner so slivers
/// don't survive to the end. Concave ears are only clipped when nothing else
/// is left; an all-flat polygon fails.
pub(crate) fn ear_clip_polygon(
    vertices: &[Vec3],
    ring: &[u32],
    normal: Vec3,
) -> Option<Vec<[u32; 3]>> {
    let mut polygon: Vec<u32> = ring.to_vec();
    let mut triangles = Vec::with_capacity(polygon.len().saturating_sub(2));

    while polygon.len() > 3 {
        let best = select_ear(vertices, &polygon, normal)?;

        let previous = polygon[(best + polygon.len() - 1) % polygon.len()];
        let ear = polygon[best];
        let next = polygon[(best + 1) % polygon.len()];

        triangles.push([previous, ear, next]);
        polygon.remove(best);
    }

    let [a, b, c] = [polygon[0], polygon[1], polygon[2]];
    if a == b || b == c || a == c {
        return None;
    }
    triangles.push([a, b, c]);

    Some(triangles)
}

fn select_ear(vertices: &[Vec3], polygon: &[u32], normal: Vec3) -> Option<usize> {
    let length = polygon.len();

    let corner = |index: usize| -> (Vec3, Vec3, Vec3) {
        let a = vertices[polygon[(index + length - 1) % length] as usize];
        let b = vertices[polygon[index] as usize];
        let c = vertices[polygon[(index + 1) % length] as usize];
        (a, b, c)
    };

    let corner_is_collinear = |index: usize| -> bool {
        let (a, b, c) = corner(index);
        let to_previous = (a - b).normalize_or_zero();
        let to_next = (c - b).normalize_or_zero();
        to_previous.dot(to_next) < COLLINEAR_DOT
    };

    // Sharpness metric: dot of the two edge directions leaving the ear.
    let sharpness = |index: usize| -> f32 {
        let (a, b, c) = corner(index);
        (a - b).normalize_or_zero().dot((c - b).normalize_or_zero())
    };

    let mut best_convex: Option<(usize, f32)> = None;
    let mut best_convex_collinear: Option<(usize, f32)> = None;
    let mut best_fallback: Option<(usize, f32)> = None;

    for index in 0..length {
        let (a, b, c) = corner(index);
        let cross = (b - a).cross(c - b);

        let flat = cross.length_squared() <= EPSILON * EPSILON;
        let convex = !flat && cross.dot(normal) > 0.0;
        let score = sharpness(index);

        if convex {
            if best_convex.is_none_or(|(_, best)| score > best) {
                best_convex = Some((index, score));
            }

            let next_collinear = corner_is_collinear((index + 1) % length)
                || corner_is_collinear((index + length - 1) % length);
            if next_collinear && best_convex_collinear.is_none_or(|(_, best)| score > best) {
                best_convex_collinear = Some((index, score));
            }
        } else if !flat && best_fallback.is_none_or(|(_, best)| score > best) {
            best_fallback = Some((index, score));
        }
    }

    best_convex_collinear
        .or(best_convex)
        .or(best_fallback)
        .map(|(index, _)| index)
}
