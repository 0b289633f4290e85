//! Volumetric **3D** navigation for [Bevy]: bakes axis-aligned volumes of
//! collidable space into convex polyhedral regions, serves pathfinding
//! queries across them, and computes ORCA collision avoidance between
//! moving agents.
//!
//! Takes in colliders that implement the [`VolumeCollider`](colliders::VolumeCollider)
//! trait from entities with the [`NavBlocker`] component and
//! **asynchronously** bakes [`NavVolume`]s into convex-region graphs that
//! can then be queried with [`sample_position`], [`raycast`] and the
//! [`Pathfinder`] resource.
//!
//! ## Quick-start:
//! **Volume baking:**
//! 1. Implement the `VolumeCollider` trait for your collider component that
//!    wraps a `parry3d::shape::SharedShape` (or use your physics crate's
//!    collider through a thin wrapper).
//! 2. Add ``OxidizedVolumesPlugin`` as a plugin
//!    (eg. ``OxidizedVolumesPlugin::<MyCollider>::new(VolumesSettings::default())``).
//! 3. Attach a ``NavBlocker`` component and a collider to anything that
//!    should block navigation.
//! 4. Spawn entities with a ``NavVolume`` component describing the box of
//!    space to bake. Baking starts automatically and the result enters the
//!    volume registry when done (a [`VolumeBaked`] event fires).
//!
//! **Querying / Pathfinding:**
//! 1. Take in the [`NavVolumes`] resource and read the registry through its
//!    ``RwLock``.
//! 2. Sample the start and end points with [`sample_position`].
//! 3. Enqueue a search with [`Pathfinder::find_path`]; your callback gets
//!    the finished [`NavPath`] on the main thread.
//!
//! **Avoidance:**
//! Attach [`AvoidanceObstacle`] (and [`AvoidanceAgent`] for active movers)
//! components; read back ``avoidance_velocity`` after the engine runs in
//! the schedule selected by [`AvoidanceSettings`].
//!
//! Volume transforms are honoured when their ``GlobalTransform`` changes;
//! colliders are sampled with scale already applied to the parry3d shape,
//! so apply your transform's scale to the shape yourself.
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::num::NonZeroU16;
use std::sync::Arc;

use bevy::ecs::entity::EntityHashMap;
use bevy::ecs::{intern::Interned, schedule::ScheduleLabel};
use bevy::platform::collections::HashSet;
use bevy::prelude::*;
use bevy::tasks::futures_lite::future;
use bevy::tasks::{AsyncComputeTaskPool, Task};
use parry3d::math::Isometry;
use std::marker::PhantomData;

#[cfg(feature = "trace")]
use bevy::log::info_span;

use colliders::VolumeCollider;
use decimate::{decimate_range, decimate_soup};
use mesher::build_surface_soup;
use regions::build_regions;
use volume::build_volume_data;
use voxelize::voxelize_volume;

pub mod avoidance;
pub mod colliders;
mod decimate;
mod grid;
mod heap;
pub mod links;
mod math;
mod mesher;
pub mod pathfinder;
pub mod query;
pub mod registry;
mod regions;
mod tables;
pub mod volume;
pub mod voxelize;

pub use avoidance::{
    compute_avoidance_velocities, AvoidanceAgent, AvoidanceBuffers, AvoidanceObstacle,
    AvoidanceSchedule, AvoidanceSettings, ObstacleSnapshot,
};
pub use links::connect_external_links;
pub use pathfinder::{
    NavPath, PathCallback, PathId, Pathfinder, PathfindingMode, PathStatus, Waypoint,
    WaypointKind,
};
pub use query::{raycast, raycast_any, sample_position, NavHit};
pub use registry::{
    LoadedVolume, NavVolumes, VolumeDataChanged, VolumeDataChanging, VolumeRegistry,
};
pub use volume::{
    Aabb3, BlobError, BoundPlane, ExternalLink, InternalLink, Region, VolumeData, VolumeId,
};
pub use voxelize::BlockerShape;

/// System sets containing the crate's systems.
#[derive(SystemSet, Debug, PartialEq, Eq, Hash, Clone)]
pub enum OxidizedVolumes {
    /// Handles dirty marking when a NavVolume component is removed.
    /// Separated to make sure removal events are caught even if Main is
    /// throttled.
    RemovedComponent,
    /// Bake task management, registry batching and pathfinding.
    Main,
}

pub struct OxidizedVolumesPlugin<ColliderComponent> {
    pub settings: VolumesSettings,
    pub avoidance: AvoidanceSettings,
    schedule: Interned<dyn ScheduleLabel>,
    _collider_type: PhantomData<fn() -> ColliderComponent>,
}

impl<C> OxidizedVolumesPlugin<C>
where
    C: VolumeCollider,
{
    #[must_use]
    pub fn new(settings: VolumesSettings) -> OxidizedVolumesPlugin<C> {
        OxidizedVolumesPlugin::<C> {
            settings,
            avoidance: AvoidanceSettings::default(),
            schedule: Update.intern(),
            _collider_type: PhantomData,
        }
    }

    /// Sets the schedule the bake & pathfinding systems run in. Defaults to
    /// [`Update`].
    #[must_use]
    pub fn in_schedule(mut self, schedule: impl ScheduleLabel) -> Self {
        self.schedule = schedule.intern();
        self
    }

    /// Overrides the avoidance configuration.
    #[must_use]
    pub fn with_avoidance(mut self, avoidance: AvoidanceSettings) -> Self {
        self.avoidance = avoidance;
        self
    }
}

impl<C: VolumeCollider> Plugin for OxidizedVolumesPlugin<C> {
    fn build(&self, app: &mut App) {
        app.insert_resource(self.settings.clone());
        app.insert_resource(self.avoidance.clone());
        app.insert_resource(Pathfinder::new(self.settings.pathfinding_mode));

        app.init_resource::<NavVolumes>()
            .init_resource::<DirtyVolumes>()
            .init_resource::<VolumeRelations>()
            .init_resource::<ActiveBakeTasks>()
            .init_resource::<RegistryOps>()
            .init_resource::<AvoidanceBuffers>();

        app.configure_sets(
            self.schedule,
            (
                OxidizedVolumes::RemovedComponent,
                OxidizedVolumes::Main,
            )
                .chain(),
        );

        app.add_systems(
            self.schedule,
            handle_removed_volumes_system
                .run_if(any_component_removed::<NavVolume>)
                .in_set(OxidizedVolumes::RemovedComponent),
        );

        app.add_systems(
            self.schedule,
            (
                update_dirty_volumes_system,
                send_bake_tasks_system::<C>.run_if(can_start_new_bakes),
                poll_bake_tasks_system,
                refresh_volume_transforms_system,
                apply_registry_ops_system,
                pathfinder::invalidate_searches_system,
                pathfinder::progress_pathfinding_system,
                pathfinder::dispatch_path_callbacks_system,
            )
                .chain()
                .in_set(OxidizedVolumes::Main),
        );

        match self.avoidance.schedule {
            AvoidanceSchedule::Update => {
                app.add_systems(Update, avoidance::update_avoidance_system);
            }
            AvoidanceSchedule::FixedUpdate => {
                app.add_systems(FixedUpdate, avoidance::update_avoidance_system);
            }
            AvoidanceSchedule::LateUpdate => {
                app.add_systems(PostUpdate, avoidance::update_avoidance_system);
            }
            AvoidanceSchedule::Manual => {}
        }

        app.add_event::<VolumeDataChanging>()
            .add_event::<VolumeDataChanged>()
            .add_event::<VolumeBaked>();
    }
}

/// Global settings for volume management and pathfinding.
#[derive(Resource, Clone)]
pub struct VolumesSettings {
    /// Maximum surface-to-surface distance bridged by external links
    /// between volumes.
    pub max_external_link_distance: f32,
    /// Max volumes baking in parallel at once. ``None`` means no limit.
    pub max_bake_tasks: Option<NonZeroU16>,
    /// How queued searches are driven each frame.
    pub pathfinding_mode: PathfindingMode,
}

impl Default for VolumesSettings {
    fn default() -> Self {
        Self {
            max_external_link_distance: 5.0,
            max_bake_tasks: NonZeroU16::new(4),
            pathfinding_mode: PathfindingMode::Cooperative { ops_per_frame: 512 },
        }
    }
}

/// Per-volume bake settings.
#[derive(Clone, Debug)]
pub struct NavVolumeSettings {
    /// Edge length of one voxel in world units.
    ///
    /// **Suggested value**: agent radius, or below for more surface detail.
    pub voxel_size: f32,
    /// Radius of the overlap spheres sampled against the physics
    /// environment.
    ///
    /// **Suggested value**: the radius of your largest navigating agent.
    pub max_agent_radius: f32,
    /// Only blockers whose [`NavBlocker::layers`] intersect this mask
    /// count.
    pub blocking_layers: u32,
    /// Ignore blockers not flagged static.
    pub static_only: bool,
    /// Sample a lattice of spheres per voxel instead of just the center;
    /// slower but catches thin geometry.
    pub enable_multi_query: bool,
    /// When set, open space unreachable from these world-space locations is
    /// treated as blocked.
    pub start_locations: Option<Vec<Vec3>>,
    /// Fan region convexification out over the compute task pool.
    pub use_multithreading: bool,
}

impl Default for NavVolumeSettings {
    fn default() -> Self {
        Self {
            voxel_size: 1.0,
            max_agent_radius: 0.5,
            blocking_layers: u32::MAX,
            static_only: false,
            enable_multi_query: true,
            start_locations: None,
            use_multithreading: true,
        }
    }
}

impl NavVolumeSettings {
    /// Helper for reasonable defaults from the size of your agents.
    #[inline]
    pub fn from_agent_radius(agent_radius: f32) -> Self {
        Self {
            voxel_size: agent_radius * 2.0,
            max_agent_radius: agent_radius,
            ..Default::default()
        }
    }

    /// Setter for [`NavVolumeSettings::blocking_layers`]
    pub fn with_blocking_layers(mut self, blocking_layers: u32) -> Self {
        self.blocking_layers = blocking_layers;

        self
    }

    /// Setter for [`NavVolumeSettings::static_only`]
    pub fn with_static_only(mut self, static_only: bool) -> Self {
        self.static_only = static_only;

        self
    }

    /// Setter for [`NavVolumeSettings::start_locations`]
    pub fn with_start_locations(mut self, start_locations: Vec<Vec3>) -> Self {
        self.start_locations = Some(start_locations);

        self
    }

    /// Setter for [`NavVolumeSettings::enable_multi_query`]
    pub fn with_multi_query(mut self, enable_multi_query: bool) -> Self {
        self.enable_multi_query = enable_multi_query;

        self
    }
}

/// Component describing one bakeable navigation volume: an oriented box of
/// collidable space. Changing it (or adding it) queues a re-bake.
#[derive(Component, Clone)]
pub struct NavVolume {
    /// Stable identity, preserved across reloads. Derive one from a stable
    /// name with [`VolumeId::from_name`].
    pub id: VolumeId,
    /// Local-space bounds of the baked box.
    pub aabb: Aabb3,
    pub settings: NavVolumeSettings,
}

/// Component for entities whose collider blocks navigation volumes.
#[derive(Component, Clone, Debug)]
pub struct NavBlocker {
    pub layers: u32,
    pub is_static: bool,
}

impl Default for NavBlocker {
    fn default() -> Self {
        Self {
            layers: 1,
            is_static: true,
        }
    }
}

/// Event fired when a volume finished baking and entered the registry.
#[derive(Event)]
pub struct VolumeBaked(pub VolumeId);

#[derive(Resource, Default)]
struct VolumeRelations(EntityHashMap<VolumeId>);

#[derive(Default, Resource)]
struct DirtyVolumes(HashSet<Entity>);

#[derive(Default, Resource)]
pub struct ActiveBakeTasks(Vec<BakeTask>);

impl ActiveBakeTasks {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct BakeTask {
    entity: Entity,
    id: VolumeId,
    aabb: Aabb3,
    task: Task<VolumeData>,
}

/// Registry mutations accumulated during the frame, applied as one
/// transactional batch.
#[derive(Default, Resource)]
struct RegistryOps {
    inserts: Vec<(VolumeId, Aabb3, Mat4, VolumeData)>,
    removals: Vec<VolumeId>,
    moves: Vec<(VolumeId, Mat4)>,
}

impl RegistryOps {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removals.is_empty() && self.moves.is_empty()
    }
}

fn handle_removed_volumes_system(
    mut removed_volumes: RemovedComponents<NavVolume>,
    mut relations: ResMut<VolumeRelations>,
    mut ops: ResMut<RegistryOps>,
    mut dirty: ResMut<DirtyVolumes>,
) {
    for entity in removed_volumes.read() {
        dirty.0.remove(&entity);
        if let Some(id) = relations.0.remove(&entity) {
            ops.removals.push(id);
        }
    }
}

fn update_dirty_volumes_system(
    mut dirty: ResMut<DirtyVolumes>,
    query: Query<Entity, Changed<NavVolume>>,
) {
    for entity in query.iter() {
        dirty.0.insert(entity);
    }
}

fn can_start_new_bakes(
    active: Res<ActiveBakeTasks>,
    dirty: Res<DirtyVolumes>,
    settings: Res<VolumesSettings>,
) -> bool {
    settings
        .max_bake_tasks
        .is_none_or(|max_bake_tasks| active.0.len() < max_bake_tasks.get().into())
        && !dirty.0.is_empty()
}

fn send_bake_tasks_system<C: VolumeCollider>(
    mut active: ResMut<ActiveBakeTasks>,
    mut dirty: ResMut<DirtyVolumes>,
    mut relations: ResMut<VolumeRelations>,
    settings: Res<VolumesSettings>,
    volumes: Query<(&NavVolume, &GlobalTransform)>,
    blockers: Query<(&C::Component, &NavBlocker, &GlobalTransform)>,
) {
    let thread_pool = AsyncComputeTaskPool::get();

    let budget = (settings
        .max_bake_tasks
        .map_or(usize::MAX, |max| max.get().into()))
    .saturating_sub(active.0.len());

    let starting: Vec<Entity> = dirty.0.iter().take(budget).copied().collect();
    for entity in starting {
        dirty.0.remove(&entity);

        let Ok((volume, volume_transform)) = volumes.get(entity) else {
            continue;
        };

        relations.0.insert(entity, volume.id);

        // Snapshot every relevant blocker into the volume's local space.
        let world_to_local = volume_transform.affine().inverse();
        let blocker_shapes: Vec<BlockerShape> = blockers
            .iter()
            .filter(|(_, blocker, _)| blocker.layers & volume.settings.blocking_layers != 0)
            .map(|(collider, blocker, transform)| {
                let local = Transform::from_matrix(Mat4::from(world_to_local * transform.affine()));
                BlockerShape {
                    shape: C::volume_collider_shape(collider),
                    isometry: Isometry::new(
                        local.translation.into(),
                        local.rotation.to_scaled_axis().into(),
                    ),
                    layers: blocker.layers,
                    is_static: blocker.is_static,
                }
            })
            .collect();

        let task = thread_pool.spawn(bake_volume(
            volume.settings.clone(),
            volume.aabb,
            blocker_shapes,
        ));

        active.0.push(BakeTask {
            entity,
            id: volume.id,
            aabb: volume.aabb,
            task,
        });
    }
}

fn poll_bake_tasks_system(
    mut active: ResMut<ActiveBakeTasks>,
    mut ops: ResMut<RegistryOps>,
    transforms: Query<&GlobalTransform, With<NavVolume>>,
) {
    active.0.retain_mut(|bake| {
        let Some(data) = future::block_on(future::poll_once(&mut bake.task)) else {
            return true;
        };

        let local_to_world = transforms
            .get(bake.entity)
            .map(|transform| Mat4::from(transform.affine()))
            .unwrap_or(Mat4::IDENTITY);

        ops.inserts.push((bake.id, bake.aabb, local_to_world, data));
        false
    });
}

fn refresh_volume_transforms_system(
    mut ops: ResMut<RegistryOps>,
    relations: Res<VolumeRelations>,
    moved: Query<(Entity, &GlobalTransform), (With<NavVolume>, Changed<GlobalTransform>)>,
) {
    for (entity, transform) in moved.iter() {
        if let Some(id) = relations.0.get(&entity) {
            ops.moves.push((*id, Mat4::from(transform.affine())));
        }
    }
}

/// Applies the frame's registry mutations as one transactional batch:
/// `VolumeDataChanging`, the writes plus one epoch bump, then
/// `VolumeDataChanged`.
fn apply_registry_ops_system(
    mut ops: ResMut<RegistryOps>,
    volumes: Res<NavVolumes>,
    settings: Res<VolumesSettings>,
    mut changing: EventWriter<VolumeDataChanging>,
    mut changed: EventWriter<VolumeDataChanged>,
    mut baked: EventWriter<VolumeBaked>,
) {
    if ops.is_empty() {
        return;
    }

    changing.write(VolumeDataChanging);

    {
        let registry = volumes.get();
        let Ok(mut registry) = registry.write() else {
            error!("Volume registry lock has been poisoned; dropping registry updates.");
            return;
        };

        let rebuild_links = !ops.inserts.is_empty() || !ops.removals.is_empty();

        for id in ops.removals.drain(..) {
            registry.remove(id);
        }
        for (id, aabb, local_to_world, data) in ops.inserts.drain(..) {
            registry.insert(id, Arc::new(data), aabb, local_to_world);
            baked.write(VolumeBaked(id));
        }
        for (id, local_to_world) in ops.moves.drain(..) {
            registry.update_transform(id, local_to_world);
        }

        if rebuild_links {
            registry.rebuild_external_links(settings.max_external_link_distance);
        }

        registry.bump_epoch();
    }

    changed.write(VolumeDataChanged);
}

/// Bakes one volume asynchronously, yielding between pipeline steps and
/// every few hundred decimation vertices.
async fn bake_volume(
    settings: NavVolumeSettings,
    aabb: Aabb3,
    blockers: Vec<BlockerShape>,
) -> VolumeData {
    const DECIMATION_YIELD_BATCH: usize = 500;

    let grid = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Voxelize volume").entered();
        voxelize_volume(&aabb, &settings, &blockers)
    };
    future::yield_now().await;

    let build = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build regions").entered();
        build_regions(grid, settings.use_multithreading)
    };
    future::yield_now().await;

    let mut soup = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build surface soup").entered();
        build_surface_soup(&build.grid, aabb.min, settings.voxel_size)
    };
    future::yield_now().await;

    let mut removed = 0;
    let mut cursor = 0;
    loop {
        // The span must not live across the yield.
        let next = {
            #[cfg(feature = "trace")]
            let _span = info_span!("Decimate").entered();
            decimate_range(&mut soup, cursor, DECIMATION_YIELD_BATCH, &mut removed)
        };
        let Some(next) = next else {
            break;
        };
        cursor = next;
        future::yield_now().await;
    }

    #[cfg(feature = "trace")]
    let _span = info_span!("Build volume data").entered();
    build_volume_data(&soup, build.region_count)
}

/// Runs the whole bake pipeline synchronously. This is what the async task
/// does, minus the yields; useful for tools, tests and benches.
pub fn bake_volume_sync(
    settings: &NavVolumeSettings,
    aabb: Aabb3,
    blockers: &[BlockerShape],
) -> VolumeData {
    let grid = voxelize_volume(&aabb, settings, blockers);
    let build = build_regions(grid, settings.use_multithreading);

    let mut soup = build_surface_soup(&build.grid, aabb.min, settings.voxel_size);
    decimate_soup(&mut soup);

    build_volume_data(&soup, build.region_count)
}
