//! A* pathfinding over the region-transition graph.
//!
//! A search node is not a region but a *transition*: "entered region R of
//! volume V through link L, coming from region R' of volume V'". Expansion
//! walks the entered region's internal and external links; the frontier is
//! an indexed min-heap with priority-update semantics.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Instant,
};

use bevy::{
    log::warn,
    math::Vec3,
    platform::collections::HashMap,
    prelude::{EventReader, Res, ResMut, Resource},
    tasks::{futures_lite::future, AsyncComputeTaskPool, Task},
};

use crate::{
    heap::MinHeap,
    math::{closest_point_on_segment, closest_point_on_triangle},
    query::{raycast, NavHit},
    registry::{NavVolumes, VolumeDataChanging, VolumeRegistry},
    volume::VolumeId,
};

/// Node pops per registry read-lock acquisition in worker mode.
const WORKER_BATCH_OPS: usize = 128;

/// Handle to an enqueued pathfinding request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PathId(pub u32);

impl PathId {
    /// Returned by [`Pathfinder::find_path`] when a precondition fails.
    pub const INVALID: PathId = PathId(u32::MAX);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaypointKind {
    Outside,
    InsideVolume,
    EnterVolume,
    ExitVolume,
}

#[derive(Clone, Copy, Debug)]
pub struct Waypoint {
    pub position: Vec3,
    pub kind: WaypointKind,
    pub volume: VolumeId,
}

/// A finished path. Owned by the [`Pathfinder`]; callers receive a borrow in
/// their callback and must release it with [`Pathfinder::release`] when
/// done.
#[derive(Clone, Debug, Default)]
pub struct NavPath {
    pub waypoints: Vec<Waypoint>,
    pub start_hit: Option<NavHit>,
    pub end_hit: Option<NavHit>,
    pub start_position: Vec3,
    pub end_position: Vec3,
}

impl NavPath {
    fn recycle(&mut self) {
        self.waypoints.clear();
        self.start_hit = None;
        self.end_hit = None;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathStatus {
    Pending,
    Success,
    Failure,
}

/// How the plugin drives queued searches each frame.
#[derive(Clone, Copy, Debug)]
pub enum PathfindingMode {
    /// Run every queued search to completion synchronously.
    EndOfFrame,
    /// Spend a bounded operation budget per frame, shared fairly across the
    /// in-flight searches.
    Cooperative { ops_per_frame: usize },
    /// One worker task per search. A worker exceeding the frame budget
    /// blocks the main thread until it completes.
    Worker { max_completion_frames: u32 },
}

pub type PathCallback = Box<dyn FnOnce(Option<&NavPath>) + Send + Sync>;

/// Identity of a region transition. Equality and hashing deliberately
/// exclude the enter position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct NodeKey {
    from_volume: Option<VolumeId>,
    from_region: i32,
    to_volume: VolumeId,
    to_region: i32,
    is_external: bool,
    link_index: i32,
}

struct SearchNode {
    key: NodeKey,
    position: Vec3,
    cost: f32,
    parent: Option<u32>,
    closed: bool,
}

enum SearchStep {
    Pending,
    Success,
    Failure,
    /// The registry mutated underneath the search; partial state must be
    /// discarded and the request requeued.
    Invalidated,
}

pub(crate) struct PathSearch {
    id: PathId,
    start_hit: NavHit,
    end_hit: NavHit,
    start_position: Vec3,
    end_position: Vec3,

    nodes: Vec<SearchNode>,
    lookup: HashMap<NodeKey, u32>,
    frontier: MinHeap,
    epoch: u64,
    started: bool,

    /// Recycled path buffer from the pool, filled on success.
    scratch: Option<NavPath>,
    result: Option<NavPath>,
    failed: bool,
}

impl PathSearch {
    fn new(
        id: PathId,
        start_hit: NavHit,
        end_hit: NavHit,
        start_position: Vec3,
        end_position: Vec3,
    ) -> Self {
        Self {
            id,
            start_hit,
            end_hit,
            start_position,
            end_position,
            nodes: Vec::with_capacity(32),
            lookup: HashMap::new(),
            frontier: MinHeap::default(),
            epoch: 0,
            started: false,
            scratch: None,
            result: None,
            failed: false,
        }
    }

    /// Discards partial state so the search restarts from scratch.
    fn reset(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
        self.frontier.clear();
        self.started = false;
        self.result = None;
        self.failed = false;
    }

    #[inline]
    fn heuristic(&self, position: Vec3) -> f32 {
        position.distance(self.end_hit.position)
    }

    /// Pops at most `op_limit` nodes. Returns `Pending` when the budget runs
    /// out, `Success`/`Failure` on termination.
    fn update(&mut self, registry: &VolumeRegistry, op_limit: usize) -> SearchStep {
        if !self.started {
            self.epoch = registry.change_epoch();
            self.started = true;

            if !registry.is_loaded(self.start_hit.volume)
                || !registry.is_loaded(self.end_hit.volume)
            {
                self.failed = true;
                return SearchStep::Failure;
            }

            let start_key = NodeKey {
                from_volume: None,
                from_region: -1,
                to_volume: self.start_hit.volume,
                to_region: self.start_hit.region as i32,
                is_external: false,
                link_index: -1,
            };
            self.nodes.push(SearchNode {
                key: start_key,
                position: self.start_hit.position,
                cost: 0.0,
                parent: None,
                closed: false,
            });
            self.lookup.insert(start_key, 0);
            self.frontier
                .push_or_update(0, self.heuristic(self.start_hit.position));
        }

        if registry.change_epoch() != self.epoch {
            return SearchStep::Invalidated;
        }

        for _ in 0..op_limit {
            let Some((node_index, _)) = self.frontier.pop() else {
                self.failed = true;
                return SearchStep::Failure;
            };

            let node = &mut self.nodes[node_index as usize];
            if node.closed {
                continue;
            }
            node.closed = true;

            let key = node.key;
            let position = node.position;
            let cost = node.cost;

            if key.to_volume == self.end_hit.volume
                && key.to_region == self.end_hit.region as i32
            {
                match self.reconstruct(registry, node_index) {
                    Some(path) => {
                        self.result = Some(path);
                        return SearchStep::Success;
                    }
                    None => {
                        self.failed = true;
                        return SearchStep::Failure;
                    }
                }
            }

            self.expand(registry, node_index, key, position, cost);
        }

        SearchStep::Pending
    }

    fn expand(
        &mut self,
        registry: &VolumeRegistry,
        node_index: u32,
        key: NodeKey,
        position: Vec3,
        cost: f32,
    ) {
        let Some(volume) = registry.get(key.to_volume) else {
            return;
        };
        let Some(region) = volume.data.regions.get(key.to_region as usize) else {
            return;
        };

        let local_position = volume.world_to_local.transform_point3(position);

        for (link_index, link) in region.internal_links.iter().enumerate() {
            // No backtracking through the link we came from.
            if key.from_volume == Some(key.to_volume) && key.from_region == link.to_region as i32
            {
                continue;
            }

            // The next position is the point on the shared feature set
            // nearest to where we entered this region.
            let mut nearest = None;
            let mut nearest_distance = f32::MAX;

            let vertices = &volume.data.vertices;
            for triangle in &link.shared_triangles {
                let candidate = closest_point_on_triangle(
                    vertices[triangle[0] as usize],
                    vertices[triangle[1] as usize],
                    vertices[triangle[2] as usize],
                    local_position,
                );
                let distance = candidate.distance_squared(local_position);
                if distance < nearest_distance {
                    nearest_distance = distance;
                    nearest = Some(candidate);
                }
            }
            for edge in &link.shared_edges {
                let candidate = closest_point_on_segment(
                    vertices[edge[0] as usize],
                    vertices[edge[1] as usize],
                    local_position,
                );
                let distance = candidate.distance_squared(local_position);
                if distance < nearest_distance {
                    nearest_distance = distance;
                    nearest = Some(candidate);
                }
            }
            for vertex in &link.shared_vertices {
                let candidate = vertices[*vertex as usize];
                let distance = candidate.distance_squared(local_position);
                if distance < nearest_distance {
                    nearest_distance = distance;
                    nearest = Some(candidate);
                }
            }

            let Some(nearest) = nearest else {
                continue;
            };

            let next_position = volume.local_to_world.transform_point3(nearest);
            let next_key = NodeKey {
                from_volume: Some(key.to_volume),
                from_region: key.to_region,
                to_volume: key.to_volume,
                to_region: link.to_region as i32,
                is_external: false,
                link_index: link_index as i32,
            };

            self.open_node(
                next_key,
                next_position,
                cost + position.distance(next_position),
                node_index,
            );
        }

        for (link_index, link) in region.external_links.iter().enumerate() {
            if key.from_volume == Some(link.to_volume) && key.from_region == link.to_region as i32
            {
                continue;
            }
            if !registry.is_loaded(link.to_volume) {
                continue;
            }

            let (from_world, _) = volume.link_world_positions(key.to_region as usize)[link_index];

            let next_key = NodeKey {
                from_volume: Some(key.to_volume),
                from_region: key.to_region,
                to_volume: link.to_volume,
                to_region: link.to_region as i32,
                is_external: true,
                link_index: link_index as i32,
            };

            self.open_node(
                next_key,
                from_world,
                cost + position.distance(from_world) + link.cost,
                node_index,
            );
        }
    }

    fn open_node(&mut self, key: NodeKey, position: Vec3, cost: f32, parent: u32) {
        match self.lookup.get(&key) {
            Some(existing) => {
                let node = &mut self.nodes[*existing as usize];
                if node.closed || cost >= node.cost {
                    return;
                }
                node.cost = cost;
                node.parent = Some(parent);
                node.position = position;

                let priority = cost + self.heuristic(position);
                self.frontier.push_or_update(*existing, priority);
            }
            None => {
                let index = self.nodes.len() as u32;
                self.nodes.push(SearchNode {
                    key,
                    position,
                    cost,
                    parent: Some(parent),
                    closed: false,
                });
                self.lookup.insert(key, index);
                self.frontier
                    .push_or_update(index, cost + self.heuristic(position));
            }
        }
    }

    /// Walks the predecessor chain from the goal node, emits waypoints and
    /// runs the raycast simplification pass.
    fn reconstruct(&mut self, registry: &VolumeRegistry, goal: u32) -> Option<NavPath> {
        let mut chain = Vec::with_capacity(8);
        let mut cursor = Some(goal);
        while let Some(index) = cursor {
            chain.push(index);
            cursor = self.nodes[index as usize].parent;
        }
        chain.reverse();

        let mut waypoints = Vec::with_capacity(chain.len() + 3);

        if self.start_hit.on_edge {
            waypoints.push(Waypoint {
                position: self.start_position,
                kind: WaypointKind::Outside,
                volume: self.start_hit.volume,
            });
        }
        waypoints.push(Waypoint {
            position: self.start_hit.position,
            kind: WaypointKind::EnterVolume,
            volume: self.start_hit.volume,
        });

        for index in chain.iter().skip(1) {
            let node = &self.nodes[*index as usize];
            let key = node.key;

            if key.is_external {
                let from_volume = key.from_volume?;
                let owner = registry.get(from_volume)?;
                let (from_world, to_world) =
                    owner.link_world_positions(key.from_region as usize)[key.link_index as usize];

                waypoints.push(Waypoint {
                    position: from_world,
                    kind: WaypointKind::ExitVolume,
                    volume: from_volume,
                });
                waypoints.push(Waypoint {
                    position: to_world,
                    kind: WaypointKind::EnterVolume,
                    volume: key.to_volume,
                });
            } else {
                waypoints.push(Waypoint {
                    position: node.position,
                    kind: WaypointKind::InsideVolume,
                    volume: key.to_volume,
                });
            }
        }

        waypoints.push(Waypoint {
            position: self.end_hit.position,
            kind: WaypointKind::ExitVolume,
            volume: self.end_hit.volume,
        });

        simplify_waypoints(registry, &mut waypoints);

        let mut path = self.scratch.take().unwrap_or_default();
        path.waypoints = waypoints;
        path.start_hit = Some(self.start_hit);
        path.end_hit = Some(self.end_hit);
        path.start_position = self.start_position;
        path.end_position = self.end_position;

        Some(path)
    }
}

/// Deletes every waypoint that can be skipped with an unobstructed straight
/// segment inside a single volume. Volume transitions are never skipped.
fn simplify_waypoints(registry: &VolumeRegistry, waypoints: &mut Vec<Waypoint>) {
    let mut start = 0;

    while start + 2 < waypoints.len() {
        let volume = waypoints[start].volume;

        let mut furthest = None;
        for end in (start + 2..waypoints.len()).rev() {
            if waypoints[start + 1..=end]
                .iter()
                .any(|waypoint| waypoint.volume != volume)
            {
                continue;
            }

            if raycast(
                registry,
                volume,
                waypoints[start].position,
                waypoints[end].position,
            ) < 0.0
            {
                furthest = Some(end);
                break;
            }
        }

        if let Some(end) = furthest {
            waypoints.drain(start + 1..end);
        }

        start += 1;
    }
}

struct WorkerSlot {
    id: PathId,
    task: Task<PathSearch>,
    abort: Arc<AtomicBool>,
    frames: u32,
}

/// Owner of all pathfinding state: the request queue, the in-flight
/// searches, finished results awaiting callback dispatch and the path pool.
#[derive(Resource)]
pub struct Pathfinder {
    mode: PathfindingMode,
    next_id: u32,

    queue: VecDeque<PathSearch>,
    workers: Vec<WorkerSlot>,
    callbacks: HashMap<PathId, PathCallback>,
    /// Completed searches in completion order, waiting for the main-thread
    /// callback dispatch.
    finished: VecDeque<(PathId, Option<NavPath>)>,
    /// Paths handed to callbacks, owned here until released.
    results: HashMap<PathId, NavPath>,
    pool: Vec<NavPath>,
}

impl Pathfinder {
    pub fn new(mode: PathfindingMode) -> Self {
        Self {
            mode,
            next_id: 0,
            queue: VecDeque::new(),
            workers: Vec::new(),
            callbacks: HashMap::new(),
            finished: VecDeque::new(),
            results: HashMap::new(),
            pool: Vec::new(),
        }
    }

    pub fn mode(&self) -> PathfindingMode {
        self.mode
    }

    /// Adjusts the worker frame budget. Fails while searches are running.
    pub fn set_mode(&mut self, mode: PathfindingMode) -> bool {
        if !self.workers.is_empty() || !self.queue.is_empty() {
            warn!("Cannot change the pathfinding mode while searches are in flight.");
            return false;
        }
        self.mode = mode;
        true
    }

    /// Number of queued or running searches.
    pub fn in_flight(&self) -> usize {
        self.queue.len() + self.workers.len()
    }

    /// Enqueues a search between two sampled hits. Returns
    /// [`PathId::INVALID`] when no volumes are loaded.
    pub fn find_path(
        &mut self,
        registry: &VolumeRegistry,
        start_hit: NavHit,
        end_hit: NavHit,
        start_position: Vec3,
        end_position: Vec3,
        callback: PathCallback,
    ) -> PathId {
        if registry.is_empty() {
            warn!("find_path called before any volume was loaded.");
            return PathId::INVALID;
        }

        let id = PathId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let mut search = PathSearch::new(id, start_hit, end_hit, start_position, end_position);
        search.scratch = Some(self.pooled_path());

        self.queue.push_back(search);
        self.callbacks.insert(id, callback);

        id
    }

    /// Cancels a request. A queued search is dropped outright (its callback
    /// never fires); an executing worker cannot be interrupted, but its
    /// callback is detached so the caller is never invoked.
    pub fn cancel(&mut self, id: PathId) {
        self.callbacks.remove(&id);
        self.queue.retain(|search| search.id != id);
        self.finished.retain(|(finished, _)| *finished != id);
    }

    /// Returns a dispatched path to the internal pool.
    pub fn release(&mut self, id: PathId) {
        if let Some(mut path) = self.results.remove(&id) {
            path.recycle();
            self.pool.push(path);
        }
    }

    fn pooled_path(&mut self) -> NavPath {
        self.pool.pop().unwrap_or_default()
    }

    /// Drives queued searches according to the mode. Worker-mode spawning
    /// and polling happens in [`progress_pathfinding_system`], which has the
    /// shared registry handle.
    pub fn progress(&mut self, registry: &VolumeRegistry) {
        match self.mode {
            PathfindingMode::EndOfFrame => {
                while let Some(mut search) = self.queue.pop_front() {
                    match search.update(registry, usize::MAX) {
                        SearchStep::Pending => {
                            self.queue.push_front(search);
                            break;
                        }
                        SearchStep::Invalidated => {
                            search.reset();
                            self.queue.push_back(search);
                            break;
                        }
                        SearchStep::Success | SearchStep::Failure => {
                            self.finish(search);
                        }
                    }
                }
            }
            PathfindingMode::Cooperative { ops_per_frame } => {
                let mut remaining = ops_per_frame;
                let mut still_pending = VecDeque::with_capacity(self.queue.len());

                while let Some(mut search) = self.queue.pop_front() {
                    if remaining == 0 {
                        still_pending.push_back(search);
                        continue;
                    }

                    let share = (remaining / (self.queue.len() + 1)).max(1);
                    remaining = remaining.saturating_sub(share);

                    match search.update(registry, share) {
                        SearchStep::Pending => still_pending.push_back(search),
                        SearchStep::Invalidated => {
                            search.reset();
                            still_pending.push_back(search);
                        }
                        SearchStep::Success | SearchStep::Failure => self.finish(search),
                    }
                }

                self.queue = still_pending;
            }
            PathfindingMode::Worker { .. } => {
                // Spawning/polling requires the shared lock, handled by the
                // driving system.
            }
        }
    }

    fn finish(&mut self, mut search: PathSearch) {
        let result = search.result.take();
        self.finished.push_back((search.id, result));
    }

    /// Invokes completion callbacks in FIFO completion order. Runs on the
    /// main thread.
    pub fn dispatch_callbacks(&mut self) {
        while let Some((id, path)) = self.finished.pop_front() {
            let Some(callback) = self.callbacks.remove(&id) else {
                // Detached by cancellation; reclaim the path memory.
                if let Some(mut path) = path {
                    path.recycle();
                    self.pool.push(path);
                }
                continue;
            };

            match path {
                Some(path) => {
                    callback(Some(&path));
                    self.results.insert(id, path);
                }
                None => callback(None),
            }
        }
    }

    /// Force-completes every in-flight search and requeues it from scratch.
    /// Called when the volume registry is about to mutate.
    pub fn force_complete_and_requeue(&mut self) {
        for slot in std::mem::take(&mut self.workers) {
            slot.abort.store(true, Ordering::Release);
            let mut search = future::block_on(slot.task);
            search.reset();
            self.queue.push_back(search);
        }

        for search in &mut self.queue {
            search.reset();
        }
    }

    fn spawn_worker(&mut self, mut search: PathSearch, volumes: &Arc<RwLock<VolumeRegistry>>) {
        let id = search.id;
        let abort = Arc::new(AtomicBool::new(false));
        let worker_abort = abort.clone();
        let volumes = volumes.clone();

        let task = AsyncComputeTaskPool::get().spawn(async move {
            loop {
                if worker_abort.load(Ordering::Acquire) {
                    return search;
                }

                let step = {
                    let Ok(registry) = volumes.read() else {
                        search.failed = true;
                        return search;
                    };
                    search.update(&registry, WORKER_BATCH_OPS)
                };

                match step {
                    SearchStep::Pending => future::yield_now().await,
                    SearchStep::Invalidated => {
                        search.reset();
                        return search;
                    }
                    SearchStep::Success | SearchStep::Failure => return search,
                }
            }
        });

        self.workers.push(WorkerSlot {
            id,
            task,
            abort,
            frames: 0,
        });
    }
}

/// Runs pathfinding for the frame. Worker mode spawns one task per queued
/// search and blocks on any worker exceeding its frame budget, logging the
/// block duration.
pub(crate) fn progress_pathfinding_system(
    mut pathfinder: ResMut<Pathfinder>,
    volumes: Res<NavVolumes>,
) {
    let shared = volumes.get();
    let pathfinder = &mut *pathfinder;

    if let PathfindingMode::Worker {
        max_completion_frames,
    } = pathfinder.mode
    {
        // Spawn every queued search on its own worker.
        while let Some(search) = pathfinder.queue.pop_front() {
            pathfinder.spawn_worker(search, &shared);
        }

        // Poll running workers; block on overruns.
        let mut index = 0;
        while index < pathfinder.workers.len() {
            let polled = {
                let slot = &mut pathfinder.workers[index];
                future::block_on(future::poll_once(&mut slot.task))
            };

            if let Some(search) = polled {
                pathfinder.workers.swap_remove(index);
                settle_worker_result(pathfinder, search);
                continue;
            }

            let slot = &mut pathfinder.workers[index];
            slot.frames += 1;

            if slot.frames > max_completion_frames {
                let slot = pathfinder.workers.swap_remove(index);
                let blocked_at = Instant::now();
                let search = future::block_on(slot.task);

                warn!(
                    "Pathfinding worker for path {:?} exceeded {max_completion_frames} frames; \
                     blocked the main thread for {:.2}ms.",
                    slot.id,
                    blocked_at.elapsed().as_secs_f64() * 1000.0
                );

                settle_worker_result(pathfinder, search);
                continue;
            }

            index += 1;
        }
    } else {
        let Ok(registry) = shared.read() else {
            return;
        };
        pathfinder.progress(&registry);
    }
}

fn settle_worker_result(pathfinder: &mut Pathfinder, search: PathSearch) {
    if search.result.is_some() || search.failed {
        pathfinder.finish(search);
    } else {
        // Invalidated or aborted: requeue from scratch.
        let mut search = search;
        search.reset();
        pathfinder.queue.push_back(search);
    }
}

/// Invokes finished-path callbacks on the main thread, in FIFO completion
/// order, the frame after the search finished.
pub(crate) fn dispatch_path_callbacks_system(mut pathfinder: ResMut<Pathfinder>) {
    pathfinder.dispatch_callbacks();
}

/// Reacts to registry mutations: every in-flight search is force-completed,
/// its partial state discarded and the request requeued transparently.
pub(crate) fn invalidate_searches_system(
    mut pathfinder: ResMut<Pathfinder>,
    mut changing: EventReader<VolumeDataChanging>,
) {
    if changing.is_empty() {
        return;
    }
    changing.clear();

    pathfinder.force_complete_and_requeue();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimate::decimate_soup;
    use crate::grid::{VoxelGrid, VOXEL_BLOCKED};
    use crate::mesher::build_surface_soup;
    use crate::query::sample_position;
    use crate::regions::build_regions;
    use crate::volume::{build_volume_data, Aabb3, VolumeData};
    use bevy::math::{Mat4, UVec3};
    use std::sync::atomic::AtomicUsize;

    fn bake_grid(grid: VoxelGrid) -> VolumeData {
        let bounds_min = Vec3::ZERO;
        let build = build_regions(grid, false);
        let mut soup = build_surface_soup(&build.grid, bounds_min, 1.0);
        decimate_soup(&mut soup);
        build_volume_data(&soup, build.region_count)
    }

    fn open_grid(dimensions: UVec3) -> VoxelGrid {
        VoxelGrid::new(dimensions, crate::grid::VOXEL_OPEN)
    }

    fn registry_with(data: VolumeData, id: VolumeId, side: Vec3) -> VolumeRegistry {
        let mut registry = VolumeRegistry::default();
        registry.insert(
            id,
            Arc::new(data),
            Aabb3 {
                min: Vec3::ZERO,
                max: side,
            },
            Mat4::IDENTITY,
        );
        registry.bump_epoch();
        registry
    }

    fn run_to_completion(search: &mut PathSearch, registry: &VolumeRegistry) -> PathStatus {
        loop {
            match search.update(registry, 16) {
                SearchStep::Pending => continue,
                SearchStep::Success => return PathStatus::Success,
                SearchStep::Failure => return PathStatus::Failure,
                SearchStep::Invalidated => panic!("registry mutated during test"),
            }
        }
    }

    #[test]
    fn same_region_path_is_a_straight_line() {
        let data = bake_grid(open_grid(UVec3::splat(10)));
        let registry = registry_with(data, VolumeId(1), Vec3::splat(10.0));

        let start = Vec3::splat(1.0);
        let end = Vec3::splat(9.0);
        let start_hit = sample_position(&registry, start, 0.0).unwrap();
        let end_hit = sample_position(&registry, end, 0.0).unwrap();
        assert!(!start_hit.on_edge);

        let mut search = PathSearch::new(PathId(0), start_hit, end_hit, start, end);
        assert_eq!(run_to_completion(&mut search, &registry), PathStatus::Success);

        let path = search.result.unwrap();
        assert_eq!(path.waypoints.len(), 2);
        assert_eq!(path.waypoints[0].position, start);
        assert_eq!(path.waypoints[0].kind, WaypointKind::EnterVolume);
        assert_eq!(path.waypoints[1].position, end);
        assert_eq!(path.waypoints[1].kind, WaypointKind::ExitVolume);
    }

    #[test]
    fn wall_forces_a_detour() {
        // 10x4x10 volume with a wall from (4,0,0) to (6,4,5): the path from
        // one side to the other has to go around through the far corridor.
        let mut grid = open_grid(UVec3::new(10, 4, 10));
        for x in 4..6 {
            for y in 0..4 {
                for z in 0..5 {
                    grid.set_label(UVec3::new(x, y, z), VOXEL_BLOCKED);
                }
            }
        }

        let data = bake_grid(grid);
        let registry = registry_with(data, VolumeId(1), Vec3::new(10.0, 4.0, 10.0));

        let start = Vec3::new(2.0, 2.0, 2.0);
        let end = Vec3::new(8.0, 2.0, 2.0);
        let start_hit = sample_position(&registry, start, 0.0).unwrap();
        let end_hit = sample_position(&registry, end, 0.0).unwrap();
        assert_ne!(start_hit.region, end_hit.region);

        let mut search = PathSearch::new(PathId(0), start_hit, end_hit, start, end);
        assert_eq!(run_to_completion(&mut search, &registry), PathStatus::Success);

        let path = search.result.unwrap();
        assert!(path.waypoints.len() > 2);

        let length: f32 = path
            .waypoints
            .windows(2)
            .map(|pair| pair[0].position.distance(pair[1].position))
            .sum();
        assert!(length > 10.0, "length {length}");
    }

    #[test]
    fn unloaded_end_volume_fails() {
        let data = bake_grid(open_grid(UVec3::splat(4)));
        let registry = registry_with(data, VolumeId(1), Vec3::splat(4.0));

        let start_hit = sample_position(&registry, Vec3::splat(2.0), 0.0).unwrap();
        let end_hit = NavHit {
            volume: VolumeId(99),
            region: 0,
            on_edge: false,
            position: Vec3::splat(50.0),
        };

        let mut search =
            PathSearch::new(PathId(0), start_hit, end_hit, Vec3::splat(2.0), Vec3::splat(50.0));
        assert_eq!(run_to_completion(&mut search, &registry), PathStatus::Failure);
    }

    #[test]
    fn queued_cancellations_never_call_back() {
        let data = bake_grid(open_grid(UVec3::splat(6)));
        let registry = registry_with(data, VolumeId(1), Vec3::splat(6.0));

        let hit_a = sample_position(&registry, Vec3::splat(1.0), 0.0).unwrap();
        let hit_b = sample_position(&registry, Vec3::splat(5.0), 0.0).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let mut pathfinder = Pathfinder::new(PathfindingMode::EndOfFrame);

        let ids: Vec<PathId> = (0..4)
            .map(|_| {
                let fired = fired.clone();
                pathfinder.find_path(
                    &registry,
                    hit_a,
                    hit_b,
                    hit_a.position,
                    hit_b.position,
                    Box::new(move |_| {
                        fired.fetch_add(1, Ordering::Relaxed);
                    }),
                )
            })
            .collect();

        pathfinder.cancel(ids[0]);
        pathfinder.cancel(ids[1]);

        pathfinder.progress(&registry);
        pathfinder.dispatch_callbacks();

        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn find_path_without_volumes_is_rejected() {
        let registry = VolumeRegistry::default();
        let mut pathfinder = Pathfinder::new(PathfindingMode::EndOfFrame);

        let hit = NavHit {
            volume: VolumeId(1),
            region: 0,
            on_edge: false,
            position: Vec3::ZERO,
        };

        let id = pathfinder.find_path(
            &registry,
            hit,
            hit,
            Vec3::ZERO,
            Vec3::ZERO,
            Box::new(|_| {}),
        );
        assert_eq!(id, PathId::INVALID);
    }

    #[test]
    fn cooperative_mode_makes_incremental_progress() {
        let data = bake_grid(open_grid(UVec3::splat(8)));
        let registry = registry_with(data, VolumeId(1), Vec3::splat(8.0));

        let hit_a = sample_position(&registry, Vec3::splat(1.0), 0.0).unwrap();
        let hit_b = sample_position(&registry, Vec3::splat(7.0), 0.0).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let mut pathfinder = Pathfinder::new(PathfindingMode::Cooperative { ops_per_frame: 1 });

        let fired_clone = fired.clone();
        pathfinder.find_path(
            &registry,
            hit_a,
            hit_b,
            hit_a.position,
            hit_b.position,
            Box::new(move |path| {
                assert!(path.is_some());
                fired_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );

        // One op per frame: the search still terminates within a few frames.
        for _ in 0..16 {
            pathfinder.progress(&registry);
            pathfinder.dispatch_callbacks();
        }

        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(pathfinder.in_flight(), 0);
    }

    #[test]
    fn epoch_change_invalidates_a_running_search() {
        let data = bake_grid(open_grid(UVec3::splat(8)));
        let mut registry = registry_with(data, VolumeId(1), Vec3::splat(8.0));

        let hit_a = sample_position(&registry, Vec3::splat(1.0), 0.0).unwrap();
        let hit_b = sample_position(&registry, Vec3::splat(7.0), 0.0).unwrap();

        let mut search = PathSearch::new(PathId(0), hit_a, hit_b, hit_a.position, hit_b.position);
        // Start but don't finish.
        assert!(matches!(search.update(&registry, 0), SearchStep::Pending));

        registry.bump_epoch();
        assert!(matches!(
            search.update(&registry, usize::MAX),
            SearchStep::Invalidated
        ));

        // After a reset the search completes against the new epoch.
        search.reset();
        assert_eq!(run_to_completion(&mut search, &registry), PathStatus::Success);
    }
}
