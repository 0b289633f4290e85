//! ORCA — Optimal Reciprocal Collision Avoidance in 3D.
//!
//! Based on: van den Berg, Guy, Lin, Manocha — "Reciprocal n-Body Collision
//! Avoidance" (2011). The incremental linear program follows the RVO2-3D
//! reference solver, expressed with outward-facing half-space planes
//! (`dot(v - point, normal) <= 0` is feasible) and extended with the 4D
//! fallback that minimises the worst violation when the program is
//! infeasible.
//!
//! Agents solve independently against a dense obstacle snapshot taken
//! before the frame's run, fanning out over the compute task pool with one
//! disjoint scratch-plane slice per agent.

use bevy::{
    log::debug,
    math::Vec3,
    prelude::{Component, Entity, GlobalTransform, Query, Res, ResMut, Resource, Time},
    tasks::ComputeTaskPool,
};

use crate::math::{arbitrary_perpendicular, EPSILON};

/// Magnitude of the symmetry-breaking velocity perturbation applied when an
/// agent and an obstacle move exactly along their connecting line.
const SYMMETRY_BREAK: f32 = 0.01;

/// Anything that moving agents steer around. Position comes from the
/// entity's `GlobalTransform`.
#[derive(Component, Clone, Debug)]
pub struct AvoidanceObstacle {
    /// Velocity the mover intends to travel with this frame.
    pub input_velocity: Vec3,
    pub radius: f32,
    pub max_speed: f32,
    /// Group bits other agents match against their avoided mask.
    pub tag_mask: u32,
}

impl Default for AvoidanceObstacle {
    fn default() -> Self {
        Self {
            input_velocity: Vec3::ZERO,
            radius: 0.5,
            max_speed: 1.0,
            tag_mask: 1,
        }
    }
}

/// Marks an [`AvoidanceObstacle`] entity as actively avoiding. The computed
/// [`AvoidanceAgent::avoidance_velocity`] is published every run.
#[derive(Component, Clone, Debug)]
pub struct AvoidanceAgent {
    /// Share of the mutual avoidance effort this agent takes on. Zero turns
    /// the agent into a passive obstacle that still receives its input
    /// velocity back.
    pub avoidance_weight: f32,
    /// Extra clearance kept around this agent.
    pub padding: f32,
    /// Obstacles whose `tag_mask` intersects this are avoided.
    pub avoided_tag_mask: u32,
    pub debug: bool,
    /// Output: collision-free velocity closest to the input velocity.
    pub avoidance_velocity: Vec3,
}

impl Default for AvoidanceAgent {
    fn default() -> Self {
        Self {
            avoidance_weight: 1.0,
            padding: 0.0,
            avoided_tag_mask: u32::MAX,
            debug: false,
            avoidance_velocity: Vec3::ZERO,
        }
    }
}

/// When the avoidance systems run.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AvoidanceSchedule {
    #[default]
    Update,
    FixedUpdate,
    LateUpdate,
    /// Nothing runs automatically; the host calls
    /// [`compute_avoidance_velocities`] itself.
    Manual,
}

#[derive(Resource, Clone)]
pub struct AvoidanceSettings {
    /// Look-ahead window for avoidance, in seconds.
    pub time_horizon: f32,
    /// Cap on half-space planes per agent. Zero disables avoidance and
    /// passes input velocities through (clamped to max speed).
    pub max_obstacles_considered: usize,
    pub schedule: AvoidanceSchedule,
    /// Capacity growth factor for the snapshot buffers, clamped to [1, 2].
    pub data_grow_ratio: f32,
}

impl Default for AvoidanceSettings {
    fn default() -> Self {
        Self {
            time_horizon: 5.0,
            max_obstacles_considered: 10,
            schedule: AvoidanceSchedule::default(),
            data_grow_ratio: 1.5,
        }
    }
}

/// Dense per-mover snapshot the solver runs against. Plain obstacles leave
/// the agent-only fields zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct ObstacleSnapshot {
    pub position: Vec3,
    pub input_velocity: Vec3,
    pub radius: f32,
    pub max_speed: f32,
    pub padding: f32,
    pub avoidance_weight: f32,
    pub tag_mask: u32,
    pub avoided_tags: u32,
}

/// Reused snapshot and scratch storage owned by the avoidance engine.
#[derive(Resource, Default)]
pub struct AvoidanceBuffers {
    pub obstacles: Vec<ObstacleSnapshot>,
    /// Indices into `obstacles` for the entries that are active agents.
    pub agents: Vec<usize>,
    entities: Vec<Entity>,
    results: Vec<Vec3>,
    planes: Vec<AvoidancePlane>,
    candidates: Vec<Vec<(f32, usize)>>,
}

impl AvoidanceBuffers {
    fn clear(&mut self) {
        self.obstacles.clear();
        self.agents.clear();
        self.entities.clear();
    }

    /// Grows `vec` to at least `len`, over-reserving by the configured
    /// ratio when the capacity is exceeded.
    fn grow<T: Clone + Default>(vec: &mut Vec<T>, len: usize, ratio: f32) {
        if vec.capacity() < len {
            let target = ((vec.capacity() as f32) * ratio.clamp(1.0, 2.0)).ceil() as usize;
            vec.reserve_exact(target.max(len) - vec.len());
        }
        vec.resize(len, T::default());
    }
}

/// Half-space constraint in velocity space: feasible velocities satisfy
/// `dot(v - point, normal) <= 0`.
#[derive(Clone, Copy, Debug, Default)]
struct AvoidancePlane {
    point: Vec3,
    normal: Vec3,
}

/// Line on a constraint plane, for the 1D sub-program.
#[derive(Clone, Copy)]
struct PlaneLine {
    point: Vec3,
    direction: Vec3,
}

/// Computes avoidance velocities for every agent index in
/// `buffers.agents` against the dense `buffers.obstacles` snapshot.
/// Results line up with `buffers.agents`.
///
/// This is the whole engine; the scheduling systems only gather snapshots
/// and scatter results. `Manual` hosts fill the buffers themselves and call
/// this with their own `delta_time`.
pub fn compute_avoidance_velocities<'a>(
    settings: &AvoidanceSettings,
    buffers: &'a mut AvoidanceBuffers,
    delta_time: f32,
) -> &'a [Vec3] {
    let AvoidanceBuffers {
        obstacles,
        agents,
        results,
        planes,
        candidates,
        ..
    } = buffers;

    let agent_count = agents.len();
    AvoidanceBuffers::grow(results, agent_count, settings.data_grow_ratio);
    AvoidanceBuffers::grow(
        planes,
        agent_count * settings.max_obstacles_considered,
        settings.data_grow_ratio,
    );
    AvoidanceBuffers::grow(candidates, agent_count, settings.data_grow_ratio);

    if agent_count == 0 {
        return results;
    }

    if settings.max_obstacles_considered == 0 || delta_time <= 0.0 {
        for (slot, agent) in agents.iter().enumerate() {
            let agent = &obstacles[*agent];
            results[slot] = clamp_speed(agent.input_velocity, agent.max_speed);
        }
        return results;
    }

    let max_planes = settings.max_obstacles_considered;
    let pool = ComputeTaskPool::get_or_init(Default::default);
    let chunk = agent_count.div_ceil(pool.thread_num().max(1)).max(1);

    pool.scope(|scope| {
        for ((results, planes), (agents, candidates)) in results
            .chunks_mut(chunk)
            .zip(planes.chunks_mut(chunk * max_planes))
            .zip(agents.chunks(chunk).zip(candidates.chunks_mut(chunk)))
        {
            let obstacles = &*obstacles;
            scope.spawn(async move {
                for (slot, agent_index) in agents.iter().enumerate() {
                    let scratch = &mut planes[slot * max_planes..(slot + 1) * max_planes];
                    results[slot] = solve_agent(
                        settings,
                        obstacles,
                        *agent_index,
                        scratch,
                        &mut candidates[slot],
                        delta_time,
                    );
                }
            });
        }
    });

    results
}

fn solve_agent(
    settings: &AvoidanceSettings,
    obstacles: &[ObstacleSnapshot],
    agent_index: usize,
    planes: &mut [AvoidancePlane],
    candidates: &mut Vec<(f32, usize)>,
    delta_time: f32,
) -> Vec3 {
    let agent = &obstacles[agent_index];

    if agent.avoidance_weight <= 0.0 {
        // Passive: treated as an obstacle by everyone else, but still
        // notified with its own input velocity.
        return agent.input_velocity;
    }

    let time_horizon = settings.time_horizon;

    // Nearest neighbours first, so the plane cap keeps the most pressing
    // collisions.
    candidates.clear();
    for (other_index, other) in obstacles.iter().enumerate() {
        if other_index == agent_index {
            continue;
        }
        if agent.avoided_tags & other.tag_mask == 0 {
            continue;
        }

        let reach = (agent.radius + agent.max_speed * time_horizon)
            + (other.radius + other.max_speed * time_horizon)
            + agent.padding;
        let distance_squared = (other.position - agent.position).length_squared();
        if distance_squared > reach * reach {
            continue;
        }

        candidates.push((distance_squared, other_index));
    }
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    candidates.truncate(planes.len());

    let plane_count = candidates.len();
    for (plane, (_, other_index)) in planes.iter_mut().zip(candidates.iter()) {
        *plane = avoidance_plane(agent, &obstacles[*other_index], time_horizon, delta_time);
    }

    let planes = &planes[..plane_count];
    let mut result = Vec3::ZERO;
    let fail = lp3(
        planes,
        agent.max_speed,
        agent.input_velocity,
        false,
        &mut result,
    );
    if fail < planes.len() {
        lp4(planes, fail, agent.max_speed, &mut result);
    }

    result
}

/// The half-space of velocities that keeps `agent` clear of `other` for the
/// time horizon, shifted by the reciprocity share.
fn avoidance_plane(
    agent: &ObstacleSnapshot,
    other: &ObstacleSnapshot,
    time_horizon: f32,
    delta_time: f32,
) -> AvoidancePlane {
    let inv_time_horizon = 1.0 / time_horizon;

    let relative_position = other.position - agent.position;
    let mut velocity = agent.input_velocity;

    // Exactly head-on (or head-away) movement leaves the program symmetric;
    // nudge sideways to break the tie.
    let collinearity = velocity.cross(relative_position).length_squared();
    if collinearity < EPSILON {
        velocity += arbitrary_perpendicular(relative_position) * SYMMETRY_BREAK;
    }

    let relative_velocity = velocity - other.input_velocity;
    let distance_squared = relative_position.length_squared();
    let combined_radius = agent.radius + other.radius + agent.padding;
    let combined_radius_squared = combined_radius * combined_radius;

    let inward_normal;
    let u;

    if distance_squared > combined_radius_squared {
        // No current collision: velocity obstacle is a cone truncated by
        // the cutoff sphere at the horizon.
        let w = relative_velocity - inv_time_horizon * relative_position;
        let w_length_squared = w.length_squared();

        let dot = w.dot(relative_position);
        if dot < 0.0 && dot * dot > combined_radius_squared * w_length_squared {
            // Closest exit is through the cutoff sphere cap.
            let w_length = w_length_squared.sqrt();
            let unit_w = if w_length > EPSILON {
                w / w_length
            } else {
                -relative_position.normalize_or_zero()
            };

            inward_normal = unit_w;
            u = (combined_radius * inv_time_horizon - w_length) * unit_w;
        } else {
            // Closest exit is through the cone side; solve the quadratic
            // for the tangency parameter t.
            let a = distance_squared;
            let b = relative_position.dot(relative_velocity);
            let c = relative_velocity.length_squared()
                - relative_position.cross(relative_velocity).length_squared()
                    / (distance_squared - combined_radius_squared);
            let t = (b + (b * b - a * c).max(0.0).sqrt()) / a;

            let ww = relative_velocity - t * relative_position;
            let ww_length = ww.length();
            let unit_ww = if ww_length > EPSILON {
                ww / ww_length
            } else {
                -relative_position.normalize_or_zero()
            };

            inward_normal = unit_ww;
            u = (combined_radius * t - ww_length) * unit_ww;
        }
    } else {
        // Already overlapping: resolve within a single step.
        let inv_delta_time = 1.0 / delta_time;
        let w = relative_velocity - inv_delta_time * relative_position;
        let w_length = w.length();
        let unit_w = if w_length > EPSILON {
            w / w_length
        } else {
            -relative_position.normalize_or_zero()
        };

        inward_normal = unit_w;
        u = (combined_radius * inv_delta_time - w_length) * unit_w;
    }

    // Reciprocity: the other side only shares the effort when it actually
    // avoids this agent's tags.
    let other_weight = if other.avoided_tags & agent.tag_mask != 0 {
        other.avoidance_weight
    } else {
        0.0
    };
    let share = if agent.avoidance_weight + other_weight > 0.0 {
        agent.avoidance_weight / (agent.avoidance_weight + other_weight)
    } else {
        1.0
    };

    AvoidancePlane {
        point: velocity + share * u,
        normal: -inward_normal,
    }
}

#[inline]
fn clamp_speed(velocity: Vec3, max_speed: f32) -> Vec3 {
    if velocity.length_squared() > max_speed * max_speed {
        velocity.normalize() * max_speed
    } else {
        velocity
    }
}

#[inline]
fn violates(plane: &AvoidancePlane, velocity: Vec3) -> bool {
    (velocity - plane.point).dot(plane.normal) > 0.0
}

/// 1D program: best point on a line lying in the current constraint plane,
/// inside the max-speed sphere, subject to the earlier planes.
fn lp1(
    planes: &[AvoidancePlane],
    plane_count: usize,
    line: PlaneLine,
    radius: f32,
    opt_velocity: Vec3,
    direction_opt: bool,
    result: &mut Vec3,
) -> bool {
    let dot = line.point.dot(line.direction);
    let discriminant = dot * dot + radius * radius - line.point.length_squared();
    if discriminant < 0.0 {
        // The max-speed sphere fully cuts the line off.
        return false;
    }

    let root = discriminant.sqrt();
    let mut t_left = -dot - root;
    let mut t_right = -dot + root;

    for plane in &planes[..plane_count] {
        let denominator = line.direction.dot(plane.normal);
        let numerator = (plane.point - line.point).dot(plane.normal);

        if denominator * denominator <= EPSILON {
            // Line parallel to this plane.
            if numerator < 0.0 {
                return false;
            }
            continue;
        }

        let t = numerator / denominator;
        if denominator > 0.0 {
            t_right = t_right.min(t);
        } else {
            t_left = t_left.max(t);
        }

        if t_left > t_right {
            return false;
        }
    }

    if direction_opt {
        if opt_velocity.dot(line.direction) > 0.0 {
            *result = line.point + t_right * line.direction;
        } else {
            *result = line.point + t_left * line.direction;
        }
    } else {
        let t = line.direction.dot(opt_velocity - line.point);
        *result = line.point + t.clamp(t_left, t_right) * line.direction;
    }

    true
}

/// 2D program: best point on the disk where constraint plane `plane_index`
/// cuts the max-speed sphere, subject to the earlier planes.
fn lp2(
    planes: &[AvoidancePlane],
    plane_index: usize,
    radius: f32,
    opt_velocity: Vec3,
    direction_opt: bool,
    result: &mut Vec3,
) -> bool {
    let plane = planes[plane_index];
    let plane_distance = plane.point.dot(plane.normal);
    let plane_distance_squared = plane_distance * plane_distance;
    let radius_squared = radius * radius;

    if plane_distance_squared > radius_squared {
        // The plane misses the max-speed sphere entirely.
        return false;
    }

    let plane_radius_squared = radius_squared - plane_distance_squared;
    let plane_center = plane_distance * plane.normal;

    if direction_opt {
        let plane_opt = opt_velocity - opt_velocity.dot(plane.normal) * plane.normal;
        let length_squared = plane_opt.length_squared();

        *result = if length_squared <= EPSILON {
            plane_center
        } else {
            plane_center + (plane_radius_squared / length_squared).sqrt() * plane_opt
        };
    } else {
        // Project the preferred velocity onto the plane, then clamp to the
        // disk.
        *result = opt_velocity + (plane.point - opt_velocity).dot(plane.normal) * plane.normal;

        if result.length_squared() > radius_squared {
            let on_plane = *result - plane_center;
            *result =
                plane_center + (plane_radius_squared / on_plane.length_squared()).sqrt() * on_plane;
        }
    }

    for earlier in 0..plane_index {
        if !violates(&planes[earlier], *result) {
            continue;
        }

        let cross = planes[earlier].normal.cross(plane.normal);
        if cross.length_squared() <= EPSILON {
            // The two planes are parallel and conflicting.
            return false;
        }

        // Optimise along the intersection line of the two planes.
        let direction = cross.normalize();
        let line_normal = direction.cross(plane.normal);
        let offset = (planes[earlier].point - plane.point).dot(planes[earlier].normal)
            / line_normal.dot(planes[earlier].normal);
        let line = PlaneLine {
            point: plane.point + offset * line_normal,
            direction,
        };

        if !lp1(
            planes,
            earlier,
            line,
            radius,
            opt_velocity,
            direction_opt,
            result,
        ) {
            return false;
        }
    }

    true
}

/// 3D program: closest feasible velocity to `opt_velocity` within the
/// max-speed sphere (or the extreme point along it in direction mode).
/// Returns the index of the first unsatisfiable plane, or `planes.len()`.
fn lp3(
    planes: &[AvoidancePlane],
    radius: f32,
    opt_velocity: Vec3,
    direction_opt: bool,
    result: &mut Vec3,
) -> usize {
    *result = if direction_opt {
        // `opt_velocity` is a unit direction in this mode.
        opt_velocity * radius
    } else {
        clamp_speed(opt_velocity, radius)
    };

    for index in 0..planes.len() {
        if !violates(&planes[index], *result) {
            continue;
        }

        let previous = *result;
        if !lp2(planes, index, radius, opt_velocity, direction_opt, result) {
            *result = previous;
            return index;
        }
    }

    planes.len()
}

/// 4D fallback: when the program is infeasible from plane `begin` on, find
/// the velocity minimising the worst violation. Each violated plane is
/// relaxed in turn by optimising along its inward normal against the
/// earlier planes projected onto it. This cannot fail.
fn lp4(planes: &[AvoidancePlane], begin: usize, radius: f32, result: &mut Vec3) {
    let mut distance = 0.0f32;

    for index in begin..planes.len() {
        if (*result - planes[index].point).dot(planes[index].normal) <= distance {
            continue;
        }

        let mut projected: Vec<AvoidancePlane> = Vec::with_capacity(index);
        for earlier in 0..index {
            let cross = planes[earlier].normal.cross(planes[index].normal);

            let point = if cross.length_squared() <= EPSILON {
                if planes[index].normal.dot(planes[earlier].normal) > 0.0 {
                    // Same halfspace, already subsumed.
                    continue;
                }
                0.5 * (planes[index].point + planes[earlier].point)
            } else {
                let line_normal = cross.cross(planes[index].normal);
                planes[index].point
                    + ((planes[earlier].point - planes[index].point).dot(planes[earlier].normal)
                        / line_normal.dot(planes[earlier].normal))
                        * line_normal
            };

            projected.push(AvoidancePlane {
                point,
                normal: (planes[earlier].normal - planes[index].normal).normalize_or_zero(),
            });
        }

        let previous = *result;
        if lp3(&projected, radius, -planes[index].normal, true, result) < projected.len() {
            // Numerical edge case, keep the previous best.
            *result = previous;
        }

        distance = (*result - planes[index].point).dot(planes[index].normal);
    }
}

/// Gathers the dense obstacle snapshot, runs the solver in parallel and
/// publishes the per-agent avoidance velocities. Registered in the schedule
/// selected by [`AvoidanceSettings::schedule`]; `Manual` hosts drive
/// [`compute_avoidance_velocities`] directly instead.
pub(crate) fn update_avoidance_system(
    settings: Res<AvoidanceSettings>,
    mut buffers: ResMut<AvoidanceBuffers>,
    time: Res<Time>,
    mut movers: Query<(
        Entity,
        &GlobalTransform,
        &AvoidanceObstacle,
        Option<&mut AvoidanceAgent>,
    )>,
) {
    let delta_time = time.delta_secs();

    buffers.clear();
    for (entity, transform, obstacle, agent) in movers.iter() {
        let index = buffers.obstacles.len();

        let mut snapshot = ObstacleSnapshot {
            position: transform.translation(),
            input_velocity: obstacle.input_velocity,
            radius: obstacle.radius,
            max_speed: obstacle.max_speed,
            tag_mask: obstacle.tag_mask,
            ..Default::default()
        };

        if let Some(agent) = agent {
            snapshot.padding = agent.padding;
            snapshot.avoidance_weight = agent.avoidance_weight;
            snapshot.avoided_tags = agent.avoided_tag_mask;

            buffers.agents.push(index);
            buffers.entities.push(entity);
        }

        buffers.obstacles.push(snapshot);
    }

    compute_avoidance_velocities(&settings, &mut buffers, delta_time);

    let AvoidanceBuffers {
        entities, results, ..
    } = &mut *buffers;
    for (entity, velocity) in entities.iter().zip(results.iter()) {
        if let Ok((.., Some(mut agent))) = movers.get_mut(*entity) {
            agent.avoidance_velocity = *velocity;
            if agent.debug {
                debug!("avoidance agent {entity}: velocity {velocity}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_snapshot(position: Vec3, velocity: Vec3) -> ObstacleSnapshot {
        ObstacleSnapshot {
            position,
            input_velocity: velocity,
            radius: 0.5,
            max_speed: 1.0,
            padding: 0.0,
            avoidance_weight: 1.0,
            tag_mask: 1,
            avoided_tags: 1,
        }
    }

    fn run(
        obstacles: Vec<ObstacleSnapshot>,
        agents: Vec<usize>,
        settings: &AvoidanceSettings,
        delta_time: f32,
    ) -> Vec<Vec3> {
        // The solver fans out over the compute pool; make sure it exists.
        ComputeTaskPool::get_or_init(Default::default);

        let mut buffers = AvoidanceBuffers::default();
        buffers.obstacles = obstacles;
        buffers.agents = agents;

        compute_avoidance_velocities(settings, &mut buffers, delta_time).to_vec()
    }

    #[test]
    fn no_neighbours_returns_clamped_input() {
        let settings = AvoidanceSettings::default();
        let fast = agent_snapshot(Vec3::ZERO, Vec3::new(5.0, 0.0, 0.0));

        let velocities = run(vec![fast], vec![0], &settings, 0.02);
        assert!((velocities[0].length() - 1.0).abs() < 1e-5);
        assert!(velocities[0].x > 0.99);
    }

    #[test]
    fn zero_obstacle_budget_passes_input_through() {
        let settings = AvoidanceSettings {
            max_obstacles_considered: 0,
            ..Default::default()
        };

        let a = agent_snapshot(Vec3::ZERO, Vec3::new(3.0, 0.0, 0.0));
        let b = agent_snapshot(Vec3::new(1.0, 0.0, 0.0), Vec3::new(-3.0, 0.0, 0.0));

        let velocities = run(vec![a, b], vec![0, 1], &settings, 0.02);
        for velocity in velocities {
            assert!((velocity.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn head_on_agents_dodge_symmetrically() {
        let settings = AvoidanceSettings::default();

        let a = agent_snapshot(Vec3::new(-3.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        let b = agent_snapshot(Vec3::new(3.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0));

        let velocities = run(vec![a, b], vec![0, 1], &settings, 0.02);

        for velocity in &velocities {
            let lateral = velocity.y.abs() + velocity.z.abs();
            assert!(lateral > 1e-4, "no lateral dodge: {velocity:?}");
            assert!(velocity.length() <= 1.0 + 1e-4);
        }

        // The epsilon perturbation is mirrored, so the dodges are too.
        assert!((velocities[0].z + velocities[1].z).abs() < 1e-3);
    }

    #[test]
    fn zero_weight_agent_keeps_its_input_velocity() {
        let settings = AvoidanceSettings::default();

        let mut passive = agent_snapshot(Vec3::new(-3.0, 0.0, 0.0), Vec3::new(0.7, 0.0, 0.0));
        passive.avoidance_weight = 0.0;
        let active = agent_snapshot(Vec3::new(3.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0));

        let velocities = run(vec![passive, active], vec![0, 1], &settings, 0.02);

        assert_eq!(velocities[0], Vec3::new(0.7, 0.0, 0.0));
        // The active agent carries the whole dodge.
        assert!(velocities[1].y.abs() + velocities[1].z.abs() > 1e-4);
    }

    #[test]
    fn dense_crossing_stays_bounded() {
        let settings = AvoidanceSettings::default();

        // Eight agents converging on the origin from a circle.
        let mut obstacles = Vec::new();
        for index in 0..8 {
            let angle = index as f32 * std::f32::consts::TAU / 8.0;
            let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * 2.0;
            obstacles.push(agent_snapshot(position, -position.normalize()));
        }

        let velocities = run(obstacles, (0..8).collect(), &settings, 0.02);

        for velocity in velocities {
            assert!(velocity.is_finite());
            assert!(velocity.length() <= 1.0 + 1e-3);
        }
    }

    #[test]
    fn overlapping_agents_push_apart() {
        let settings = AvoidanceSettings::default();

        // Centres closer than the combined radius.
        let a = agent_snapshot(Vec3::new(-0.3, 0.0, 0.0), Vec3::ZERO);
        let b = agent_snapshot(Vec3::new(0.3, 0.0, 0.0), Vec3::ZERO);

        let velocities = run(vec![a, b], vec![0, 1], &settings, 0.02);

        // Both gain separating velocity along the axis.
        assert!(velocities[0].x < -1e-3);
        assert!(velocities[1].x > 1e-3);
    }

    #[test]
    fn tag_filter_ignores_unmatched_obstacles() {
        let settings = AvoidanceSettings::default();

        let mut a = agent_snapshot(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        a.avoided_tags = 0b10;
        let b = agent_snapshot(Vec3::new(1.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0));

        let velocities = run(vec![a, b], vec![0, 1], &settings, 0.02);

        // Agent a does not consider b at all; velocity passes straight
        // through.
        assert!((velocities[0] - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-4);
    }
}
