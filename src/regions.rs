use std::{
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use bevy::{
    log::warn,
    math::{IVec3, UVec3},
    platform::collections::{HashMap, HashSet},
    tasks::ComputeTaskPool,
};

use crate::{
    grid::{RegionFilter, VoxelGrid, NEIGHBOUR_OFFSETS, VOXEL_BLOCKED, VOXEL_OPEN},
    tables::{
        is_concave_neighbour, is_cube_broken_on_axis, CORNER_OFFSETS,
        CUBES_WITH_INTERNAL_CAVITIES,
    },
};

/// Region tasks that fail to converge within this window keep whatever shape
/// they reached.
const REGION_TASK_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct RegionBuild {
    /// Voxel labels: [`VOXEL_BLOCKED`] or `1..=region_count`.
    pub grid: VoxelGrid,
    pub region_count: u32,
}

/// Bake steps 2-4: label open space into regions, split every region until
/// convex, then greedily merge neighbouring regions whose union stays convex
/// and compact the surviving ids.
pub(crate) fn build_regions(mut grid: VoxelGrid, use_multithreading: bool) -> RegionBuild {
    let initial = label_initial_regions(&mut grid);

    let next_id = AtomicI32::new(initial.len() as i32 + 1);
    let convex = convexify_regions(initial, &next_id, use_multithreading);

    // The split tasks never wrote to the shared grid, flush their labels.
    for region in &convex {
        for voxel in &region.voxels {
            grid.set_label(*voxel, region.id);
        }
    }

    let regions = merge_regions(&mut grid, convex, use_multithreading);

    let region_count = compact_region_ids(&mut grid, regions);

    RegionBuild { grid, region_count }
}

struct RegionVoxels {
    id: i32,
    voxels: Vec<UVec3>,
    started: Instant,
}

/// Step 2: row-major scan allocating an id per 6-connected component of open
/// voxels. Ids start at 1; 0 stays reserved for blocked space.
fn label_initial_regions(grid: &mut VoxelGrid) -> Vec<RegionVoxels> {
    let mut regions = Vec::new();
    let mut queue = Vec::with_capacity(256);
    let dimensions = grid.dimensions();

    for z in 0..dimensions.z {
        for y in 0..dimensions.y {
            for x in 0..dimensions.x {
                let seed = UVec3::new(x, y, z);
                if grid.label(seed.as_ivec3()) != VOXEL_OPEN {
                    continue;
                }

                let id = regions.len() as i32 + 1;
                let mut voxels = Vec::new();

                grid.set_label(seed, id);
                queue.push(seed.as_ivec3());

                while let Some(voxel) = queue.pop() {
                    voxels.push(voxel.as_uvec3());

                    for offset in NEIGHBOUR_OFFSETS {
                        let neighbour = voxel + offset;
                        if grid.label(neighbour) == VOXEL_OPEN {
                            grid.set_label(neighbour.as_uvec3(), id);
                            queue.push(neighbour);
                        }
                    }
                }

                regions.push(RegionVoxels {
                    id,
                    voxels,
                    started: Instant::now(),
                });
            }
        }
    }

    regions
}

/// Step 3: split regions at concavities until every region passes the
/// Marching-Cubes convexity scan. Tasks are independent per region; a shared
/// atomic hands out fresh ids, so the queue can be drained by any number of
/// workers.
fn convexify_regions(
    tasks: Vec<RegionVoxels>,
    next_id: &AtomicI32,
    use_multithreading: bool,
) -> Vec<RegionVoxels> {
    let pending = AtomicUsize::new(tasks.len());
    let queue = Mutex::new(tasks);
    let finished = Mutex::new(Vec::new());

    if use_multithreading {
        let pool = ComputeTaskPool::get_or_init(Default::default);
        let workers = pool.thread_num().max(1);

        pool.scope(|scope| {
            for _ in 0..workers {
                let queue = &queue;
                let finished = &finished;
                let pending = &pending;
                scope.spawn(async move {
                    convexify_worker(queue, finished, pending, next_id);
                });
            }
        });
    } else {
        convexify_worker(&queue, &finished, &pending, next_id);
    }

    finished.into_inner().unwrap()
}

fn convexify_worker(
    queue: &Mutex<Vec<RegionVoxels>>,
    finished: &Mutex<Vec<RegionVoxels>>,
    pending: &AtomicUsize,
    next_id: &AtomicI32,
) {
    loop {
        let task = queue.lock().unwrap().pop();
        let Some(task) = task else {
            if pending.load(Ordering::Acquire) == 0 {
                return;
            }
            // Another worker may still split its region into new tasks.
            std::thread::yield_now();
            continue;
        };

        match convexify_step(task, next_id) {
            ConvexifyOutcome::Convex(region) => {
                finished.lock().unwrap().push(region);
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            ConvexifyOutcome::Split(parts) => {
                pending.fetch_add(parts.len() - 1, Ordering::AcqRel);
                queue.lock().unwrap().extend(parts);
            }
        }
    }
}

enum ConvexifyOutcome {
    Convex(RegionVoxels),
    Split(Vec<RegionVoxels>),
}

fn convexify_step(task: RegionVoxels, next_id: &AtomicI32) -> ConvexifyOutcome {
    // A single cube of voxels is convex by definition, and a region that
    // exceeds its time budget keeps whatever shape it reached.
    if task.voxels.len() <= 1 {
        return ConvexifyOutcome::Convex(task);
    }
    if task.started.elapsed() > REGION_TASK_TIMEOUT {
        warn!(
            "Region {} did not converge within {REGION_TASK_TIMEOUT:?}, keeping partial shape.",
            task.id
        );
        return ConvexifyOutcome::Convex(task);
    }

    let bitmap = RegionBitmap::from_voxels(&task.voxels);

    let Some(concavity) = find_first_concavity(&bitmap) else {
        return ConvexifyOutcome::Convex(task);
    };

    let (axis, plane) = match concavity {
        Concavity::InternalCavity { base, case } => {
            // Split along whichever axis separates the cube into two
            // non-trivial halves at the lowest cost.
            let mut candidates: Vec<usize> = (0..3)
                .filter(|axis| is_cube_broken_on_axis(case, *axis))
                .collect();
            if candidates.is_empty() {
                candidates = vec![0, 1, 2];
            }

            candidates
                .into_iter()
                .map(|axis| {
                    let plane = base[axis] + 1;
                    (score_split(&bitmap, axis, plane), axis, plane)
                })
                .min_by_key(|(score, ..)| *score)
                .map(|(_, axis, plane)| (axis, plane))
                .unwrap()
        }
        Concavity::ConcaveNeighbour { base, axis } => {
            // The plane has to land between the two cubes, on either side of
            // the shared voxel layer.
            [base[axis] + 1, base[axis] + 2]
                .into_iter()
                .map(|plane| (score_split(&bitmap, axis, plane), plane))
                .min_by_key(|(score, _)| *score)
                .map(|(_, plane)| (axis, plane))
                .unwrap()
        }
    };

    ConvexifyOutcome::Split(split_region(task, &bitmap, axis, plane, next_id))
}

enum Concavity {
    InternalCavity { base: IVec3, case: u8 },
    ConcaveNeighbour { base: IVec3, axis: usize },
}

/// Scans every 2×2×2 window of the region for a case in the internal-cavity
/// table, then every adjacent cube pair along the positive axes for an entry
/// in the concave-neighbour table.
fn find_first_concavity(bitmap: &RegionBitmap) -> Option<Concavity> {
    let scan = bitmap.dimensions.as_ivec3() - IVec3::ONE;

    for z in 0..scan.z {
        for y in 0..scan.y {
            for x in 0..scan.x {
                let base = IVec3::new(x, y, z);
                let case = bitmap.case_at(base);
                if case == 0 {
                    continue;
                }

                if CUBES_WITH_INTERNAL_CAVITIES[case as usize] {
                    return Some(Concavity::InternalCavity { base, case });
                }

                for axis in 0..3 {
                    let neighbour_base = base + axis_offset(axis);
                    if neighbour_base[axis] >= scan[axis] {
                        continue;
                    }

                    let neighbour_case = bitmap.case_at(neighbour_base);
                    if is_concave_neighbour(case, neighbour_case, axis) {
                        return Some(Concavity::ConcaveNeighbour { base, axis });
                    }
                }
            }
        }
    }

    None
}

/// Net damage of splitting at `plane`: +1 per currently-convex cube the
/// plane would break apart, -1 per concavity it resolves.
fn score_split(bitmap: &RegionBitmap, axis: usize, plane: i32) -> i32 {
    let scan = bitmap.dimensions.as_ivec3() - IVec3::ONE;
    let mut score = 0;

    let (u_axis, v_axis) = cross_axes(axis);
    for u in 0..scan[u_axis] {
        for v in 0..scan[v_axis] {
            let mut base = IVec3::ZERO;
            base[axis] = plane - 1;
            base[u_axis] = u;
            base[v_axis] = v;

            let case = bitmap.case_at(base);
            if case == 0 {
                continue;
            }

            if CUBES_WITH_INTERNAL_CAVITIES[case as usize] {
                score -= 1;
            } else if is_cube_broken_on_axis(case, axis) {
                score += 1;
            }
        }
    }

    score
}

/// Re-labels the voxels on the far side of the plane that are reachable
/// without crossing it to a fresh id. Whatever the flood can't reach stays
/// behind; if that remainder falls apart into several components the extra
/// components get fresh ids as well so regions stay connected.
fn split_region(
    task: RegionVoxels,
    bitmap: &RegionBitmap,
    axis: usize,
    plane: i32,
    next_id: &AtomicI32,
) -> Vec<RegionVoxels> {
    let far_side =
        |voxel: UVec3| -> bool { voxel.as_ivec3()[axis] - bitmap.origin[axis] >= plane };

    let Some(seed) = task.voxels.iter().copied().find(|voxel| far_side(*voxel)) else {
        // Degenerate plane, nothing to move. Should not happen for a scored
        // split but guard against an infinite requeue loop regardless.
        return vec![RegionVoxels {
            started: Instant::now(),
            ..task
        }];
    };

    let mut moved = HashSet::new();
    let mut queue = vec![seed];
    moved.insert(seed);

    let region_voxels: HashSet<UVec3> = task.voxels.iter().copied().collect();
    while let Some(voxel) = queue.pop() {
        for offset in NEIGHBOUR_OFFSETS {
            let neighbour = voxel.as_ivec3() + offset;
            if neighbour.min_element() < 0 {
                continue;
            }
            let neighbour = neighbour.as_uvec3();
            if far_side(neighbour)
                && region_voxels.contains(&neighbour)
                && moved.insert(neighbour)
            {
                queue.push(neighbour);
            }
        }
    }

    let (moved_voxels, remainder): (Vec<UVec3>, Vec<UVec3>) = task
        .voxels
        .into_iter()
        .partition(|voxel| moved.contains(voxel));

    let mut parts = Vec::with_capacity(2);
    parts.push(RegionVoxels {
        id: next_id.fetch_add(1, Ordering::Relaxed),
        voxels: moved_voxels,
        started: task.started,
    });

    // The remainder keeps the old id; extra components split off.
    for (index, component) in connected_components(remainder).into_iter().enumerate() {
        let id = if index == 0 {
            task.id
        } else {
            next_id.fetch_add(1, Ordering::Relaxed)
        };
        parts.push(RegionVoxels {
            id,
            voxels: component,
            started: task.started,
        });
    }

    parts.retain(|part| !part.voxels.is_empty());
    parts
}

fn connected_components(voxels: Vec<UVec3>) -> Vec<Vec<UVec3>> {
    let mut remaining: HashSet<UVec3> = voxels.into_iter().collect();
    let mut components = Vec::new();

    while let Some(seed) = remaining.iter().next().copied() {
        remaining.remove(&seed);
        let mut component = Vec::new();
        let mut queue = vec![seed];

        while let Some(voxel) = queue.pop() {
            component.push(voxel);

            for offset in NEIGHBOUR_OFFSETS {
                let neighbour = voxel.as_ivec3() + offset;
                if neighbour.min_element() < 0 {
                    continue;
                }
                let neighbour = neighbour.as_uvec3();
                if remaining.remove(&neighbour) {
                    queue.push(neighbour);
                }
            }
        }

        components.push(component);
    }

    components
}

/// Step 4: greedy convex re-merging. Each round tests every adjacent pair in
/// parallel, applies non-overlapping merges, and reschedules pairs touching
/// a merge endpoint. Rounds repeat until one produces no merges.
fn merge_regions(
    grid: &mut VoxelGrid,
    regions: Vec<RegionVoxels>,
    use_multithreading: bool,
) -> Vec<RegionVoxels> {
    let mut regions: HashMap<i32, Vec<UVec3>> = regions
        .into_iter()
        .map(|region| (region.id, region.voxels))
        .collect();

    let mut adjacency = build_adjacency(grid);

    loop {
        let mut candidates: Vec<(i32, i32)> = adjacency
            .iter()
            .flat_map(|(region, neighbours)| {
                neighbours
                    .iter()
                    .filter(move |neighbour| *region < **neighbour)
                    .map(move |neighbour| (*region, *neighbour))
            })
            .collect();
        candidates.sort_unstable();

        if candidates.is_empty() {
            break;
        }

        // All feasibility checks finish before any merge is applied.
        let feasible = test_merge_feasibility(grid, &regions, &candidates, use_multithreading);

        let mut merged_this_round: HashSet<i32> = HashSet::new();
        let mut merges = 0;

        for ((into, from), feasible) in candidates.into_iter().zip(feasible) {
            if !feasible || merged_this_round.contains(&into) || merged_this_round.contains(&from)
            {
                continue;
            }

            let from_voxels = regions.remove(&from).unwrap();
            for voxel in &from_voxels {
                grid.set_label(*voxel, into);
            }
            regions.get_mut(&into).unwrap().extend(from_voxels);

            // Rewire the adjacency lists of the merge endpoints.
            let from_neighbours = adjacency.remove(&from).unwrap_or_default();
            for neighbour in from_neighbours {
                if let Some(list) = adjacency.get_mut(&neighbour) {
                    list.remove(&from);
                    if neighbour != into {
                        list.insert(into);
                    }
                }
                if neighbour != into {
                    adjacency.entry(into).or_default().insert(neighbour);
                }
            }
            if let Some(list) = adjacency.get_mut(&into) {
                list.remove(&from);
            }

            merged_this_round.insert(into);
            merged_this_round.insert(from);
            merges += 1;
        }

        if merges == 0 {
            break;
        }
    }

    regions
        .into_iter()
        .map(|(id, voxels)| RegionVoxels {
            id,
            voxels,
            started: Instant::now(),
        })
        .collect()
}

fn build_adjacency(grid: &VoxelGrid) -> HashMap<i32, HashSet<i32>> {
    let mut adjacency: HashMap<i32, HashSet<i32>> = HashMap::new();
    let dimensions = grid.dimensions();

    for z in 0..dimensions.z {
        for y in 0..dimensions.y {
            for x in 0..dimensions.x {
                let position = IVec3::new(x as i32, y as i32, z as i32);
                let label = grid.label(position);
                if label == VOXEL_BLOCKED {
                    continue;
                }

                for axis in 0..3 {
                    let neighbour_label = grid.label(position + axis_offset(axis));
                    if neighbour_label != VOXEL_BLOCKED && neighbour_label != label {
                        adjacency.entry(label).or_default().insert(neighbour_label);
                        adjacency.entry(neighbour_label).or_default().insert(label);
                    }
                }
            }
        }
    }

    adjacency
}

/// A pair is merge-able when the union of the two regions still passes the
/// convexity scan, probed straight off the grid with the
/// [`RegionFilter::OneOf`] primitive.
fn test_merge_feasibility(
    grid: &VoxelGrid,
    regions: &HashMap<i32, Vec<UVec3>>,
    candidates: &[(i32, i32)],
    use_multithreading: bool,
) -> Vec<bool> {
    let union_is_convex = |pair: &(i32, i32)| -> bool {
        let (a, b) = pair;
        let (Some(voxels_a), Some(voxels_b)) = (regions.get(a), regions.get(b)) else {
            return false;
        };

        let bitmap = RegionBitmap::from_grid(
            grid,
            voxels_a.iter().chain(voxels_b.iter()).copied(),
            RegionFilter::OneOf(*a, *b),
        );
        find_first_concavity(&bitmap).is_none()
    };

    if use_multithreading {
        let union_is_convex = &union_is_convex;
        ComputeTaskPool::get_or_init(Default::default).scope(|scope| {
            for pair in candidates {
                scope.spawn(async move { union_is_convex(pair) });
            }
        })
    } else {
        candidates.iter().map(union_is_convex).collect()
    }
}

/// Renumbers the surviving regions to a dense `1..=count` and relabels the
/// grid accordingly.
fn compact_region_ids(grid: &mut VoxelGrid, regions: Vec<RegionVoxels>) -> u32 {
    let mut ids: Vec<i32> = regions.iter().map(|region| region.id).collect();
    ids.sort_unstable();

    let remap: HashMap<i32, i32> = ids
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index as i32 + 1))
        .collect();

    for label in grid.labels_mut() {
        if *label != VOXEL_BLOCKED {
            *label = remap[label];
        }
    }

    ids.len() as u32
}

/// Bitmap of one region's voxels over its bounding box, padded by one voxel
/// so cube windows can sample the border.
struct RegionBitmap {
    origin: IVec3,
    dimensions: UVec3,
    bits: Vec<bool>,
}

impl RegionBitmap {
    /// Bitmap over the bounding box of `voxels`, set wherever the grid label
    /// matches `filter`.
    fn from_grid(
        grid: &VoxelGrid,
        voxels: impl Iterator<Item = UVec3>,
        filter: RegionFilter,
    ) -> Self {
        let mut min = IVec3::MAX;
        let mut max = IVec3::MIN;
        for voxel in voxels {
            min = min.min(voxel.as_ivec3());
            max = max.max(voxel.as_ivec3());
        }
        if min.cmpgt(max).any() {
            min = IVec3::ZERO;
            max = IVec3::ZERO;
        }

        let origin = min - IVec3::ONE;
        let dimensions = (max - min + IVec3::splat(3)).as_uvec3();
        let mut bits = vec![false; (dimensions.x * dimensions.y * dimensions.z) as usize];

        for z in 0..dimensions.z as i32 {
            for y in 0..dimensions.y as i32 {
                for x in 0..dimensions.x as i32 {
                    let local = IVec3::new(x, y, z);
                    if grid.is_one_of(origin + local, filter) {
                        bits[Self::index(dimensions, local)] = true;
                    }
                }
            }
        }

        Self {
            origin,
            dimensions,
            bits,
        }
    }

    fn from_voxels(voxels: &[UVec3]) -> Self {
        let mut min = IVec3::MAX;
        let mut max = IVec3::MIN;
        for voxel in voxels {
            min = min.min(voxel.as_ivec3());
            max = max.max(voxel.as_ivec3());
        }
        if voxels.is_empty() {
            min = IVec3::ZERO;
            max = IVec3::ZERO;
        }

        let origin = min - IVec3::ONE;
        let dimensions = (max - min + IVec3::splat(3)).as_uvec3();
        let mut bits = vec![false; (dimensions.x * dimensions.y * dimensions.z) as usize];

        for voxel in voxels {
            let local = voxel.as_ivec3() - origin;
            bits[Self::index(dimensions, local)] = true;
        }

        Self {
            origin,
            dimensions,
            bits,
        }
    }

    #[inline]
    fn index(dimensions: UVec3, local: IVec3) -> usize {
        (local.x as u32
            + local.y as u32 * dimensions.x
            + local.z as u32 * dimensions.x * dimensions.y) as usize
    }

    #[inline]
    fn contains(&self, local: IVec3) -> bool {
        if local.min_element() < 0
            || local.x as u32 >= self.dimensions.x
            || local.y as u32 >= self.dimensions.y
            || local.z as u32 >= self.dimensions.z
        {
            return false;
        }
        self.bits[Self::index(self.dimensions, local)]
    }

    /// 8-bit corner mask of the cube window based at `base` (local
    /// coordinates).
    #[inline]
    fn case_at(&self, base: IVec3) -> u8 {
        let mut case = 0u8;
        for (corner, offset) in CORNER_OFFSETS.iter().enumerate() {
            if self.contains(base + *offset) {
                case |= 1 << corner;
            }
        }
        case
    }
}

#[inline]
fn axis_offset(axis: usize) -> IVec3 {
    match axis {
        0 => IVec3::X,
        1 => IVec3::Y,
        _ => IVec3::Z,
    }
}

#[inline]
fn cross_axes(axis: usize) -> (usize, usize) {
    match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_from_blocked(dimensions: UVec3, blocked: &[UVec3]) -> VoxelGrid {
        let mut grid = VoxelGrid::new(dimensions, VOXEL_OPEN);
        for voxel in blocked {
            grid.set_label(*voxel, VOXEL_BLOCKED);
        }
        grid
    }

    fn region_of(build: &RegionBuild, voxel: UVec3) -> i32 {
        build.grid.label(voxel.as_ivec3())
    }

    #[test]
    fn empty_box_is_a_single_region() {
        let grid = grid_from_blocked(UVec3::splat(6), &[]);
        let build = build_regions(grid, false);

        assert_eq!(build.region_count, 1);
        assert!(build.grid.labels().iter().all(|label| *label == 1));
    }

    #[test]
    fn separated_halves_become_two_regions() {
        // A full wall at x == 2.
        let mut blocked = Vec::new();
        for y in 0..4 {
            for z in 0..4 {
                blocked.push(UVec3::new(2, y, z));
            }
        }

        let grid = grid_from_blocked(UVec3::new(5, 4, 4), &blocked);
        let build = build_regions(grid, false);

        assert_eq!(build.region_count, 2);
        assert_ne!(
            region_of(&build, UVec3::new(0, 0, 0)),
            region_of(&build, UVec3::new(4, 0, 0))
        );
    }

    #[test]
    fn l_shape_splits_into_convex_parts() {
        // A 4x1x4 slab with one 2x1x2 quadrant blocked -> L shape.
        let mut blocked = Vec::new();
        for x in 2..4 {
            for z in 2..4 {
                blocked.push(UVec3::new(x, 0, z));
            }
        }

        let grid = grid_from_blocked(UVec3::new(4, 1, 4), &blocked);
        let build = build_regions(grid, false);

        // The L cannot stay one region; it must come out as convex boxes.
        assert!(build.region_count >= 2);

        // Every voxel still belongs to a region and regions stay connected.
        for index in 0..build.grid.voxel_count() {
            let position = build.grid.position(index);
            let label = build.grid.label(position.as_ivec3());
            if blocked.contains(&position) {
                assert_eq!(label, VOXEL_BLOCKED);
            } else {
                assert!(label >= 1 && label <= build.region_count as i32);
            }
        }

        for region in 1..=build.region_count as i32 {
            let voxels: Vec<UVec3> = (0..build.grid.voxel_count())
                .map(|index| build.grid.position(index))
                .filter(|position| build.grid.label(position.as_ivec3()) == region)
                .collect();
            assert_eq!(
                connected_components(voxels.clone()).len(),
                1,
                "region {region}"
            );
        }
    }

    #[test]
    fn merge_rejoins_needless_splits() {
        // Whatever the splitter does to a plain box, the merge pass must
        // rejoin anything whose union is convex, so it ends as one region.
        let grid = grid_from_blocked(UVec3::new(8, 2, 3), &[]);
        let build = build_regions(grid, false);

        assert_eq!(build.region_count, 1);
    }

    #[test]
    fn multithreaded_matches_single_threaded_region_count() {
        let mut blocked = Vec::new();
        for x in 3..5 {
            for z in 0..5 {
                for y in 0..3 {
                    blocked.push(UVec3::new(x, y, z));
                }
            }
        }

        let single = build_regions(grid_from_blocked(UVec3::new(8, 3, 8), &blocked), false);
        let multi = build_regions(grid_from_blocked(UVec3::new(8, 3, 8), &blocked), true);

        assert_eq!(single.region_count, multi.region_count);
    }
}
