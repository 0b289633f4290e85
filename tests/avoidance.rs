use std::time::Duration;

use bevy::prelude::*;
use oxidized_volumes::{
    colliders::VolumeCollider, AvoidanceAgent, AvoidanceObstacle, AvoidanceSettings,
    OxidizedVolumesPlugin, VolumesSettings,
};
use parry3d::shape::SharedShape;

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

fn setup_app(app: &mut App) {
    app.add_plugins((
        MinimalPlugins,
        TransformPlugin,
        OxidizedVolumesPlugin::<MyColliderBackend>::new(VolumesSettings::default())
            .with_avoidance(AvoidanceSettings {
                time_horizon: 5.0,
                ..Default::default()
            }),
    ));
}

fn spawn_agent(app: &mut App, position: Vec3, velocity: Vec3) -> Entity {
    app.world_mut()
        .spawn((
            Transform::from_translation(position),
            AvoidanceObstacle {
                input_velocity: velocity,
                radius: 0.5,
                max_speed: 1.0,
                tag_mask: 1,
            },
            AvoidanceAgent::default(),
        ))
        .id()
}

fn agent_velocity(app: &App, entity: Entity) -> Vec3 {
    app.world()
        .entity(entity)
        .get::<AvoidanceAgent>()
        .unwrap()
        .avoidance_velocity
}

#[test]
fn head_on_agents_get_symmetric_lateral_velocities() {
    let mut app = App::new();
    setup_app(&mut app);

    let left = spawn_agent(&mut app, Vec3::new(-3.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
    let right = spawn_agent(&mut app, Vec3::new(3.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0));

    // A couple of updates so the time delta becomes non-zero.
    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(5));
        app.update();
    }

    for entity in [left, right] {
        let velocity = agent_velocity(&app, entity);
        let lateral = velocity.y.abs() + velocity.z.abs();
        assert!(lateral > 1e-4, "agent kept a straight course: {velocity:?}");
        assert!(velocity.length() <= 1.0 + 1e-4);
    }

    // Reciprocal avoidance: the dodges mirror each other.
    let left_velocity = agent_velocity(&app, left);
    let right_velocity = agent_velocity(&app, right);
    assert!((left_velocity.z + right_velocity.z).abs() < 1e-3);
}

#[test]
fn lone_agent_keeps_its_input_velocity() {
    let mut app = App::new();
    setup_app(&mut app);

    let agent = spawn_agent(&mut app, Vec3::ZERO, Vec3::new(0.5, 0.0, 0.0));

    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(5));
        app.update();
    }

    let velocity = agent_velocity(&app, agent);
    assert!((velocity - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-4);
}

#[test]
fn passive_obstacles_do_not_dodge() {
    let mut app = App::new();
    setup_app(&mut app);

    // A passive mover on a collision course with an active agent.
    let passive = app
        .world_mut()
        .spawn((
            Transform::from_translation(Vec3::new(-2.0, 0.0, 0.0)),
            AvoidanceObstacle {
                input_velocity: Vec3::new(0.8, 0.0, 0.0),
                radius: 0.5,
                max_speed: 1.0,
                tag_mask: 1,
            },
            AvoidanceAgent {
                avoidance_weight: 0.0,
                ..Default::default()
            },
        ))
        .id();
    let active = spawn_agent(&mut app, Vec3::new(2.0, 0.0, 0.0), Vec3::new(-0.8, 0.0, 0.0));

    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(5));
        app.update();
    }

    // The passive agent is notified with its own input velocity.
    assert_eq!(agent_velocity(&app, passive), Vec3::new(0.8, 0.0, 0.0));

    // The active agent swerves on its own.
    let velocity = agent_velocity(&app, active);
    assert!(velocity.y.abs() + velocity.z.abs() > 1e-4);
}
