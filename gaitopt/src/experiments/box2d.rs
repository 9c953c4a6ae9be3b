//! Side-view rigid-body quadruped using wrapped2d (Box2D).
//!
//! Box2D's (x, y) plane is the sagittal plane, so `Position::z` maps to
//! Box2D's y. Each leg is two segments: the sweep servo drives the hip, the
//! lift servo the knee. Spine servos have no joint in this view and twist
//! commands are ignored.
//!
//! Lengths are multiplied by `SCALE` before reaching Box2D, whose contact
//! slop is too coarse for millimetre boxes at unit scale.

use wrapped2d::b2;
use wrapped2d::b2::UnknownJoint;
use wrapped2d::user_data::NoUserData;

use super::terrain::Obstacle;
use super::world::{Backend, PhysicsWorld, Position, Robot, RobotSpec, ServoAxis};
use crate::error::{SimError, SimResult};

// ─── Constants ────────────────────────────────────────────────────────
const SCALE: f32 = 20.0;
const GRAVITY: f32 = 9.81;
const GROUND_HALF_LENGTH: f64 = 10.0;
/// Boxes further than this from the robot's lane are left out of the view.
const LANE_HALF_WIDTH: f64 = 0.06;
const FRICTION: f32 = 2.5;

const HULL_HALF_LENGTH: f64 = 0.1;
const HULL_HALF_HEIGHT: f64 = 0.025;
const SEGMENT_LENGTH: f64 = 0.06;
const SEGMENT_HALF_WIDTH: f64 = 0.008;
const HULL_DENSITY: f32 = 5.0;
const LEG_DENSITY: f32 = 1.0;

const MOTORS_TORQUE: f32 = 400.0;
const MOTOR_GAIN: f32 = 12.0;
const MOTOR_MAX_SPEED: f32 = 6.0;
const SERVO_LIMIT: f32 = 1.6;
const SPINE_JOINTS: usize = 2;

const VELOCITY_ITERATIONS: i32 = 8;
const POSITION_ITERATIONS: i32 = 3;

const GROUND_CATEGORY: u16 = 0x0001;
const ROBOT_CATEGORY: u16 = 0x0002;

fn vec2(x: f64, z: f64) -> b2::Vec2 {
    b2::Vec2 {
        x: x as f32 * SCALE,
        y: z as f32 * SCALE,
    }
}

fn ground_fixture() -> b2::FixtureDef {
    b2::FixtureDef {
        friction: FRICTION,
        filter: b2::Filter {
            category_bits: GROUND_CATEGORY,
            mask_bits: 0xFFFF,
            group_index: 0,
        },
        ..b2::FixtureDef::new()
    }
}

/// Robot parts only touch the ground, never each other.
fn robot_fixture(density: f32) -> b2::FixtureDef {
    b2::FixtureDef {
        density,
        friction: FRICTION,
        filter: b2::Filter {
            category_bits: ROBOT_CATEGORY,
            mask_bits: GROUND_CATEGORY,
            group_index: 0,
        },
        ..b2::FixtureDef::new()
    }
}

pub struct Box2dBackend;

impl Backend for Box2dBackend {
    type World = Box2dWorld;

    fn create_world(&self, tilt: f64) -> SimResult<Box2dWorld> {
        if !tilt.is_finite() || tilt.abs() >= std::f64::consts::FRAC_PI_2 {
            return Err(SimError::Physics(format!("ground tilt {tilt} rad is not a usable slope")));
        }
        Ok(Box2dWorld::new(tilt))
    }

    fn name(&self) -> &'static str {
        "box2d"
    }
}

pub struct Box2dWorld {
    world: b2::World<NoUserData>,
    /// Obstacles registered, including those outside the lane.
    obstacles: usize,
    time: f64,
}

impl Box2dWorld {
    pub fn new(tilt: f64) -> Self {
        let mut world = b2::World::new(&b2::Vec2 {
            x: 0.0,
            y: -GRAVITY * SCALE,
        });

        // Ground line z = -x·tan(tilt), the same plane the terrain sits on.
        let slope = tilt.tan();
        let edge = b2::EdgeShape::new_with(
            &vec2(-GROUND_HALF_LENGTH, slope * GROUND_HALF_LENGTH),
            &vec2(GROUND_HALF_LENGTH, -slope * GROUND_HALF_LENGTH),
        );
        let ground = world.create_body(&b2::BodyDef {
            body_type: b2::BodyType::Static,
            ..b2::BodyDef::new()
        });
        world.body_mut(ground).create_fixture(&edge, &mut ground_fixture());

        Box2dWorld {
            world,
            obstacles: 0,
            time: 0.0,
        }
    }

    fn joint_angle(&self, handle: b2::JointHandle) -> f32 {
        let jref = self.world.joint(handle);
        match **jref {
            UnknownJoint::Revolute(ref rj) => rj.joint_angle(),
            _ => 0.0,
        }
    }

    fn create_segment(&mut self, center: b2::Vec2) -> b2::BodyHandle {
        let shape = b2::PolygonShape::new_box(
            SEGMENT_HALF_WIDTH as f32 * SCALE,
            SEGMENT_LENGTH as f32 / 2.0 * SCALE,
        );
        let body = self.world.create_body(&b2::BodyDef {
            body_type: b2::BodyType::Dynamic,
            position: center,
            ..b2::BodyDef::new()
        });
        self.world.body_mut(body).create_fixture(&shape, &mut robot_fixture(LEG_DENSITY));
        body
    }

    fn create_servo(
        &mut self,
        a: b2::BodyHandle,
        b: b2::BodyHandle,
        anchor_a: b2::Vec2,
        anchor_b: b2::Vec2,
    ) -> b2::JointHandle {
        let mut jd = b2::RevoluteJointDef::new(a, b);
        jd.local_anchor_a = anchor_a;
        jd.local_anchor_b = anchor_b;
        jd.enable_limit = true;
        jd.lower_angle = -SERVO_LIMIT;
        jd.upper_angle = SERVO_LIMIT;
        jd.enable_motor = true;
        jd.max_motor_torque = MOTORS_TORQUE;
        jd.motor_speed = 0.0;
        self.world.create_joint(&jd)
    }
}

impl PhysicsWorld for Box2dWorld {
    type Robot = Box2dRobot;

    fn add_to_ground(&mut self, obstacle: &Obstacle) -> SimResult<()> {
        if !obstacle.fixed {
            return Err(SimError::NotFixed);
        }
        self.obstacles += 1;
        if obstacle.center.y.abs() - obstacle.depth / 2.0 > LANE_HALF_WIDTH {
            return Ok(());
        }

        let shape = b2::PolygonShape::new_box(
            obstacle.width as f32 / 2.0 * SCALE,
            obstacle.height as f32 / 2.0 * SCALE,
        );
        let body = self.world.create_body(&b2::BodyDef {
            body_type: b2::BodyType::Static,
            position: vec2(obstacle.center.x, obstacle.center.z),
            // Pitch about y is the in-plane rotation.
            angle: obstacle.rotation[1] as f32,
            ..b2::BodyDef::new()
        });
        self.world.body_mut(body).create_fixture(&shape, &mut ground_fixture());
        Ok(())
    }

    fn static_bodies(&self) -> usize {
        self.obstacles
    }

    fn spawn_robot(&mut self, spec: &RobotSpec) -> SimResult<Box2dRobot> {
        let start = spec.start;
        let hull_shape = b2::PolygonShape::new_box(
            HULL_HALF_LENGTH as f32 * SCALE,
            HULL_HALF_HEIGHT as f32 * SCALE,
        );
        let hull = self.world.create_body(&b2::BodyDef {
            body_type: b2::BodyType::Dynamic,
            position: vec2(start.x, start.z),
            ..b2::BodyDef::new()
        });
        self.world.body_mut(hull).create_fixture(&hull_shape, &mut robot_fixture(HULL_DENSITY));

        let side_servos = spec.side_servos();
        let per_side = side_servos / 2;
        let mut joints = vec![None; spec.servos];

        for side in 0..2 {
            for leg in 0..per_side {
                let lift = SPINE_JOINTS + side * side_servos + 2 * leg;
                let sweep = lift + 1;
                if sweep >= spec.servos {
                    continue;
                }
                let mount_x = if per_side > 1 {
                    -HULL_HALF_LENGTH + 2.0 * HULL_HALF_LENGTH * leg as f64 / (per_side - 1) as f64
                } else {
                    0.0
                };

                let (leg_x, hip_z) = (start.x + mount_x, start.z - HULL_HALF_HEIGHT);
                let upper = self.create_segment(vec2(leg_x, hip_z - SEGMENT_LENGTH / 2.0));
                let lower = self.create_segment(vec2(leg_x, hip_z - 1.5 * SEGMENT_LENGTH));

                let hip = self.create_servo(
                    hull,
                    upper,
                    vec2(mount_x, -HULL_HALF_HEIGHT),
                    vec2(0.0, SEGMENT_LENGTH / 2.0),
                );
                let knee = self.create_servo(
                    upper,
                    lower,
                    vec2(0.0, -SEGMENT_LENGTH / 2.0),
                    vec2(0.0, SEGMENT_LENGTH / 2.0),
                );
                joints[sweep] = Some(hip);
                joints[lift] = Some(knee);
            }
        }

        Ok(Box2dRobot {
            hull,
            joints,
            targets: vec![0.0; spec.servos],
            position: start,
        })
    }

    fn next_step(&mut self, robot: &mut Box2dRobot, dt: f64) -> SimResult<()> {
        // Position servos: motor speed proportional to the angle error.
        for (servo, joint) in robot.joints.iter().enumerate() {
            let Some(handle) = *joint else { continue };
            let error = robot.targets[servo] as f32 - self.joint_angle(handle);
            let speed = (MOTOR_GAIN * error).clamp(-MOTOR_MAX_SPEED, MOTOR_MAX_SPEED);
            let mut jref = self.world.joint_mut(handle);
            if let UnknownJoint::Revolute(ref mut rj) = **jref {
                rj.set_motor_speed(speed);
            }
        }

        self.world.step(dt as f32, VELOCITY_ITERATIONS, POSITION_ITERATIONS);
        self.time += dt;

        let p = *self.world.body(robot.hull).position();
        let scale = SCALE as f64;
        robot.position = Position::new(p.x as f64 / scale, robot.position.y, p.y as f64 / scale);
        if !robot.position.x.is_finite() || !robot.position.z.is_finite() {
            let msg = format!("box2d state diverged at t={:.3}", self.time);
            return Err(SimError::Physics(msg));
        }
        Ok(())
    }
}

/// Handles into the owning `Box2dWorld`. Servo targets are applied by the
/// world on its next step.
pub struct Box2dRobot {
    hull: b2::BodyHandle,
    /// Joint per servo; `None` for servos without a joint in this view.
    joints: Vec<Option<b2::JointHandle>>,
    targets: Vec<f64>,
    position: Position,
}

impl Robot for Box2dRobot {
    fn servo_count(&self) -> usize {
        self.targets.len()
    }

    fn set_angle(&mut self, servo: usize, axis: ServoAxis, radians: f64) -> SimResult<()> {
        let servos = self.targets.len();
        let target = self
            .targets
            .get_mut(servo)
            .ok_or(SimError::ServoIndex { index: servo, servos })?;
        if axis == ServoAxis::Dihedral {
            *target = radians.clamp(-SERVO_LIMIT as f64, SERVO_LIMIT as f64);
        }
        Ok(())
    }

    fn next_step(&mut self, _dt: f64) -> SimResult<()> {
        Ok(())
    }

    fn position(&self) -> Position {
        self.position
    }
}
