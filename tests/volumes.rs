use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bevy::prelude::*;
use oxidized_volumes::{
    bake_volume_sync, colliders::VolumeCollider, sample_position, Aabb3, ActiveBakeTasks,
    BlockerShape, NavBlocker, NavVolume, NavVolumeSettings, NavVolumes, OxidizedVolumesPlugin,
    PathId, Pathfinder, PathfindingMode, VolumeId, VolumesSettings, Waypoint, WaypointKind,
};
use parry3d::{math::Isometry, shape::SharedShape};

const TIMEOUT_DURATION: Duration = Duration::new(30, 0);
const SLEEP_DURATION: Duration = Duration::from_millis(2);

#[derive(Component)]
struct MyParryCollider {
    collider: SharedShape,
}

struct MyColliderBackend;

impl VolumeCollider for MyColliderBackend {
    type Component = MyParryCollider;

    fn volume_collider_shape(item: &MyParryCollider) -> SharedShape {
        item.collider.clone()
    }

    fn volume_collider_compute_local_aabb(
        item: &MyParryCollider,
    ) -> parry3d::bounding_volume::Aabb {
        item.collider.compute_local_aabb()
    }
}

fn volume_settings() -> NavVolumeSettings {
    NavVolumeSettings {
        voxel_size: 1.0,
        max_agent_radius: 0.4,
        blocking_layers: u32::MAX,
        static_only: false,
        enable_multi_query: false,
        start_locations: None,
        use_multithreading: false,
    }
}

fn setup_app(app: &mut App, settings: VolumesSettings) {
    app.add_plugins((
        MinimalPlugins,
        TransformPlugin,
        OxidizedVolumesPlugin::<MyColliderBackend>::new(settings),
    ));
}

fn wait_for_bakes_to_finish(app: &mut App, expected_volumes: usize) {
    loop {
        app.update();

        let idle = app.world().resource::<ActiveBakeTasks>().is_empty();
        let loaded = {
            let volumes = app.world().resource::<NavVolumes>().get();
            let registry = volumes.read().expect("registry lock");
            registry.len()
        };

        if idle && loaded >= expected_volumes {
            break;
        } else if app.world().resource::<Time>().elapsed() >= TIMEOUT_DURATION {
            panic!("Baking timed out.");
        }

        std::thread::sleep(SLEEP_DURATION);
    }
}

/// Queues a path between two world positions and runs the app until the
/// callback fires, returning the waypoints (or `None` on failure).
fn find_path_blocking(app: &mut App, start: Vec3, end: Vec3) -> Option<Vec<Waypoint>> {
    let volumes = app.world().resource::<NavVolumes>().get();

    let result: Arc<Mutex<Option<Option<Vec<Waypoint>>>>> = Arc::new(Mutex::new(None));
    let callback_result = result.clone();

    {
        let registry = volumes.read().expect("registry lock");
        let start_hit =
            sample_position(&registry, start, 1.0).expect("start position not on any volume");
        let end_hit = sample_position(&registry, end, 1.0).expect("end position not on any volume");

        let mut pathfinder = app.world_mut().resource_mut::<Pathfinder>();
        let id = pathfinder.find_path(
            &registry,
            start_hit,
            end_hit,
            start,
            end,
            Box::new(move |path| {
                *callback_result.lock().unwrap() =
                    Some(path.map(|path| path.waypoints.clone()));
            }),
        );
        assert_ne!(id, PathId::INVALID);
    }

    for _ in 0..600 {
        app.update();
        if let Some(outcome) = result.lock().unwrap().take() {
            return outcome;
        }
        std::thread::sleep(SLEEP_DURATION);
    }

    panic!("Pathfinding did not complete in time.");
}

fn path_length(waypoints: &[Waypoint]) -> f32 {
    waypoints
        .windows(2)
        .map(|pair| pair[0].position.distance(pair[1].position))
        .sum()
}

#[test]
fn empty_box_bakes_samples_and_paths() {
    let mut app = App::new();
    setup_app(&mut app, VolumesSettings::default());

    app.world_mut().spawn((
        Transform::IDENTITY,
        NavVolume {
            id: VolumeId::from_name("empty-box"),
            aabb: oxidized_volumes::Aabb3 {
                min: Vec3::ZERO,
                max: Vec3::splat(10.0),
            },
            settings: volume_settings(),
        },
    ));

    wait_for_bakes_to_finish(&mut app, 1);

    {
        let volumes = app.world().resource::<NavVolumes>().get();
        let registry = volumes.read().unwrap();

        let (_, loaded) = registry.iter().next().unwrap();
        assert_eq!(loaded.data.regions.len(), 1);

        let hit = sample_position(&registry, Vec3::splat(5.0), 0.0).unwrap();
        assert_eq!(hit.region, 0);
        assert!(!hit.on_edge);
        assert_eq!(hit.position, Vec3::splat(5.0));
    }

    let waypoints = find_path_blocking(&mut app, Vec3::splat(1.0), Vec3::splat(9.0))
        .expect("path through an empty box");

    assert_eq!(waypoints.len(), 2);
    assert!(waypoints[0].position.distance(Vec3::splat(1.0)) < 1e-4);
    assert!(waypoints[1].position.distance(Vec3::splat(9.0)) < 1e-4);
}

#[test]
fn wall_forces_a_detour_until_removed() {
    let mut app = App::new();
    setup_app(&mut app, VolumesSettings::default());

    // Wall from (4,0,0) to (6,4,5) inside a 10x4x10 volume.
    let wall = app
        .world_mut()
        .spawn((
            Transform::from_xyz(5.0, 2.0, 2.5),
            MyParryCollider {
                collider: SharedShape::cuboid(1.0, 2.0, 2.5),
            },
            NavBlocker::default(),
        ))
        .id();

    let volume_entity = app
        .world_mut()
        .spawn((
            Transform::IDENTITY,
            NavVolume {
                id: VolumeId::from_name("walled"),
                aabb: oxidized_volumes::Aabb3 {
                    min: Vec3::ZERO,
                    max: Vec3::new(10.0, 4.0, 10.0),
                },
                settings: volume_settings(),
            },
        ))
        .id();

    wait_for_bakes_to_finish(&mut app, 1);

    {
        let volumes = app.world().resource::<NavVolumes>().get();
        let registry = volumes.read().unwrap();
        let (_, loaded) = registry.iter().next().unwrap();
        assert!(loaded.data.regions.len() >= 2);
    }

    let start = Vec3::new(2.0, 2.0, 2.0);
    let end = Vec3::new(8.0, 2.0, 2.0);

    let detour = find_path_blocking(&mut app, start, end).expect("path around the wall");
    assert!(detour.len() > 2);
    assert!(path_length(&detour) > 10.0, "length {}", path_length(&detour));

    // Remove the wall and re-bake: the path straightens out.
    app.world_mut().entity_mut(wall).despawn();
    let volume = app
        .world()
        .entity(volume_entity)
        .get::<NavVolume>()
        .unwrap()
        .clone();
    app.world_mut().entity_mut(volume_entity).insert(volume);

    app.update();
    wait_for_bakes_to_finish(&mut app, 1);

    let straight = find_path_blocking(&mut app, start, end).expect("path without the wall");
    assert_eq!(straight.len(), 2);
    assert!(path_length(&straight) < 11.0);
}

#[test]
fn two_volumes_link_up_and_paths_cross() {
    let mut app = App::new();
    setup_app(
        &mut app,
        VolumesSettings {
            max_external_link_distance: 1.0,
            ..Default::default()
        },
    );

    let fine_settings = NavVolumeSettings {
        voxel_size: 0.25,
        ..volume_settings()
    };

    let id_a = VolumeId::from_name("island-a");
    let id_b = VolumeId::from_name("island-b");

    let aabb = oxidized_volumes::Aabb3 {
        min: Vec3::ZERO,
        max: Vec3::splat(5.0),
    };

    app.world_mut().spawn((
        Transform::IDENTITY,
        NavVolume {
            id: id_a,
            aabb,
            settings: fine_settings.clone(),
        },
    ));
    // Half a unit of empty space between the two boxes.
    app.world_mut().spawn((
        Transform::from_xyz(5.5, 0.0, 0.0),
        NavVolume {
            id: id_b,
            aabb,
            settings: fine_settings,
        },
    ));

    wait_for_bakes_to_finish(&mut app, 2);
    // One more frame so the link pass sees both volumes.
    app.update();

    {
        let volumes = app.world().resource::<NavVolumes>().get();
        let registry = volumes.read().unwrap();

        let links_a = &registry.get(id_a).unwrap().data.regions[0].external_links;
        let links_b = &registry.get(id_b).unwrap().data.regions[0].external_links;

        assert_eq!(links_a.len(), 1);
        assert_eq!(links_b.len(), 1);
        assert_eq!(links_a[0].to_volume, id_b);
        assert_eq!(links_b[0].to_volume, id_a);
    }

    let waypoints = find_path_blocking(&mut app, Vec3::splat(2.5), Vec3::new(8.0, 2.5, 2.5))
        .expect("path across the gap");

    let crossings = waypoints
        .windows(2)
        .filter(|pair| {
            pair[0].kind == WaypointKind::ExitVolume
                && pair[1].kind == WaypointKind::EnterVolume
                && pair[0].volume != pair[1].volume
        })
        .count();
    assert_eq!(crossings, 1);
}

#[test]
fn queued_cancellations_fire_no_callbacks() {
    let mut app = App::new();
    setup_app(&mut app, VolumesSettings::default());

    app.world_mut().spawn((
        Transform::IDENTITY,
        NavVolume {
            id: VolumeId::from_name("cancel-box"),
            aabb: oxidized_volumes::Aabb3 {
                min: Vec3::ZERO,
                max: Vec3::splat(8.0),
            },
            settings: volume_settings(),
        },
    ));

    wait_for_bakes_to_finish(&mut app, 1);

    let fired = Arc::new(AtomicUsize::new(0));
    let volumes = app.world().resource::<NavVolumes>().get();

    let ids: Vec<PathId> = {
        let registry = volumes.read().unwrap();
        let start_hit = sample_position(&registry, Vec3::splat(1.0), 0.5).unwrap();
        let end_hit = sample_position(&registry, Vec3::splat(7.0), 0.5).unwrap();

        let mut pathfinder = app.world_mut().resource_mut::<Pathfinder>();
        (0..100)
            .map(|_| {
                let fired = fired.clone();
                pathfinder.find_path(
                    &registry,
                    start_hit,
                    end_hit,
                    start_hit.position,
                    end_hit.position,
                    Box::new(move |_| {
                        fired.fetch_add(1, Ordering::Relaxed);
                    }),
                )
            })
            .collect()
    };

    {
        let mut pathfinder = app.world_mut().resource_mut::<Pathfinder>();
        for id in &ids[..50] {
            pathfinder.cancel(*id);
        }
    }

    for _ in 0..120 {
        app.update();
        if fired.load(Ordering::Relaxed) >= 50 {
            break;
        }
        std::thread::sleep(SLEEP_DURATION);
    }

    assert_eq!(fired.load(Ordering::Relaxed), 50);
}

#[test]
fn baking_the_same_input_twice_is_deterministic() {
    let settings = volume_settings();
    let aabb = Aabb3 {
        min: Vec3::ZERO,
        max: Vec3::splat(6.0),
    };
    let blockers = vec![BlockerShape {
        shape: SharedShape::cuboid(1.0, 1.0, 1.0),
        isometry: Isometry::translation(3.0, 3.0, 3.0),
        layers: 1,
        is_static: true,
    }];

    let first = bake_volume_sync(&settings, aabb, &blockers);
    let second = bake_volume_sync(&settings, aabb, &blockers);

    assert_eq!(first.regions.len(), second.regions.len());
    assert_eq!(first.vertices.len(), second.vertices.len());
    assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
}

#[test]
fn registry_mutation_mid_search_still_calls_back_once() {
    let mut app = App::new();
    // One node expansion per frame keeps the search in flight across the
    // registry change.
    setup_app(
        &mut app,
        VolumesSettings {
            pathfinding_mode: PathfindingMode::Cooperative { ops_per_frame: 1 },
            ..Default::default()
        },
    );

    let searched_id = VolumeId::from_name("searched");
    let doomed_id = VolumeId::from_name("doomed");

    // A wall keeps the searched volume multi-region so the one-op-per-frame
    // search is still pending when the registry mutates.
    app.world_mut().spawn((
        Transform::from_xyz(6.0, 2.0, 3.0),
        MyParryCollider {
            collider: SharedShape::cuboid(1.0, 2.0, 3.0),
        },
        NavBlocker::default(),
    ));

    app.world_mut().spawn((
        Transform::IDENTITY,
        NavVolume {
            id: searched_id,
            aabb: oxidized_volumes::Aabb3 {
                min: Vec3::ZERO,
                max: Vec3::new(12.0, 4.0, 12.0),
            },
            settings: volume_settings(),
        },
    ));
    let doomed = app
        .world_mut()
        .spawn((
            Transform::from_xyz(50.0, 0.0, 0.0),
            NavVolume {
                id: doomed_id,
                aabb: oxidized_volumes::Aabb3 {
                    min: Vec3::ZERO,
                    max: Vec3::splat(4.0),
                },
                settings: volume_settings(),
            },
        ))
        .id();

    wait_for_bakes_to_finish(&mut app, 2);

    let fired = Arc::new(AtomicUsize::new(0));
    let waypoints: Arc<Mutex<Vec<Waypoint>>> = Arc::new(Mutex::new(Vec::new()));
    let volumes = app.world().resource::<NavVolumes>().get();

    {
        let registry = volumes.read().unwrap();
        let start_hit = sample_position(&registry, Vec3::new(1.0, 2.0, 1.0), 0.5).unwrap();
        let end_hit = sample_position(&registry, Vec3::new(11.0, 2.0, 11.0), 0.5).unwrap();

        let fired = fired.clone();
        let waypoints = waypoints.clone();
        let mut pathfinder = app.world_mut().resource_mut::<Pathfinder>();
        pathfinder.find_path(
            &registry,
            start_hit,
            end_hit,
            start_hit.position,
            end_hit.position,
            Box::new(move |path| {
                fired.fetch_add(1, Ordering::Relaxed);
                if let Some(path) = path {
                    *waypoints.lock().unwrap() = path.waypoints.clone();
                }
            }),
        );
    }

    // Let the search make partial progress, then unload the other volume.
    app.update();
    app.world_mut().entity_mut(doomed).despawn();

    for _ in 0..600 {
        app.update();
        if fired.load(Ordering::Relaxed) > 0 {
            break;
        }
        std::thread::sleep(SLEEP_DURATION);
    }

    assert_eq!(fired.load(Ordering::Relaxed), 1);
    for waypoint in waypoints.lock().unwrap().iter() {
        assert_ne!(waypoint.volume, doomed_id);
    }
}
