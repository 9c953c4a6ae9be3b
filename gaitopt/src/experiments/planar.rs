//! Planar quadruped on rough ground: pure Rust, no physics engine needed.
//!
//! Simplified contact model, good enough to rank gaits:
//! - servos are rate-limited proportional actuators;
//! - a leg grips the ground while its lift joint is at or below zero;
//! - gripping legs push the body by their sweep motion times the leg length;
//! - stepping up onto a box costs traction, and a slope pulls the body
//!   downhill when no leg grips.
//!
//! Servo layout follows `RobotSpec`: two spine joints, then `(lift, sweep)`
//! pairs for each leg on one side, then the mirrored side.

use super::terrain::Obstacle;
use super::world::{Backend, PhysicsWorld, Position, Robot, RobotSpec, ServoAxis};
use crate::error::{SimError, SimResult};

// ─── Constants ────────────────────────────────────────────────────────
const GRAVITY: f64 = 9.81;
const SERVO_GAIN: f64 = 12.0; // 1/s
const SERVO_MAX_SPEED: f64 = 6.0; // rad/s
const SERVO_LIMIT: f64 = 1.6; // rad
const LEG_LENGTH: f64 = 0.12;
const BODY_HEIGHT: f64 = 0.08;
const SPINE_JOINTS: usize = 2;
/// Extra stride per radian of spine flex.
const SPINE_REACH: f64 = 0.15;
/// Lateral drift per radian of spine yaw.
const SPINE_DRIFT: f64 = 0.05;
/// Traction lost per unit of climb / stride.
const CLIMB_PENALTY: f64 = 8.0;
const SLIDE_DAMPING: f64 = 2.0; // 1/s

pub struct PlanarBackend;

impl Backend for PlanarBackend {
    type World = PlanarWorld;

    fn create_world(&self, tilt: f64) -> SimResult<PlanarWorld> {
        if !tilt.is_finite() || tilt.abs() >= std::f64::consts::FRAC_PI_2 {
            return Err(SimError::Physics(format!("ground tilt {tilt} rad is not a usable slope")));
        }
        Ok(PlanarWorld::new(tilt))
    }

    fn name(&self) -> &'static str {
        "planar"
    }
}

pub struct PlanarWorld {
    tilt: f64,
    slope: f64,
    ground: Vec<Obstacle>,
    time: f64,
}

impl PlanarWorld {
    pub fn new(tilt: f64) -> Self {
        PlanarWorld {
            tilt,
            slope: tilt.tan(),
            ground: Vec::new(),
            time: 0.0,
        }
    }

    /// Ground surface height: the tilted plane, or the highest box top
    /// covering `(x, y)`.
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        let plane = self.slope * -x;
        self.ground
            .iter()
            .filter(|o| o.covers(x, y))
            .map(|o| o.top())
            .fold(plane, f64::max)
    }
}

impl PhysicsWorld for PlanarWorld {
    type Robot = PlanarRobot;

    fn add_to_ground(&mut self, obstacle: &Obstacle) -> SimResult<()> {
        if !obstacle.fixed {
            return Err(SimError::NotFixed);
        }
        self.ground.push(obstacle.clone());
        Ok(())
    }

    fn static_bodies(&self) -> usize {
        self.ground.len()
    }

    fn spawn_robot(&mut self, spec: &RobotSpec) -> SimResult<PlanarRobot> {
        Ok(PlanarRobot::new(spec))
    }

    fn next_step(&mut self, robot: &mut PlanarRobot, dt: f64) -> SimResult<()> {
        let Position { x, y, .. } = robot.position;

        let mut stroke = 0.0;
        let mut stance = 0usize;
        let legs = robot.legs();
        for &(lift, sweep) in &legs {
            if robot.angles[lift] <= 0.0 {
                stance += 1;
                stroke += (robot.angles[sweep] - robot.previous[sweep]) * LEG_LENGTH;
            }
        }

        let mut drive = 0.0;
        if stance > 0 {
            drive = stroke / stance as f64 * (1.0 + SPINE_REACH * robot.spine_flex());
            let climb = self.height_at(x + drive, y) - self.height_at(x, y);
            if climb > 0.0 && drive != 0.0 {
                drive /= 1.0 + CLIMB_PENALTY * climb / drive.abs();
            }
        }

        // Gravity only acts along the slope when nothing grips.
        let grip = if legs.is_empty() { 0.0 } else { stance as f64 / legs.len() as f64 };
        robot.velocity += GRAVITY * self.tilt.sin() * (1.0 - grip) * dt;
        robot.velocity *= (1.0 - (SLIDE_DAMPING + grip / dt) * dt).max(0.0);

        let new_x = x + drive + robot.velocity * dt;
        let new_y = y + drive.abs() * SPINE_DRIFT * robot.spine_yaw();
        robot.position = Position::new(new_x, new_y, self.height_at(new_x, new_y) + BODY_HEIGHT);

        self.time += dt;
        if !robot.position.x.is_finite() {
            let msg = format!("robot state diverged at t={:.3}", self.time);
            return Err(SimError::Physics(msg));
        }
        Ok(())
    }
}

pub struct PlanarRobot {
    angles: Vec<f64>,
    previous: Vec<f64>,
    targets: Vec<f64>,
    position: Position,
    /// Slide velocity along x.
    velocity: f64,
    side_servos: usize,
}

impl PlanarRobot {
    fn new(spec: &RobotSpec) -> Self {
        PlanarRobot {
            angles: vec![0.0; spec.servos],
            previous: vec![0.0; spec.servos],
            targets: vec![0.0; spec.servos],
            position: spec.start,
            velocity: 0.0,
            side_servos: spec.side_servos(),
        }
    }

    /// `(lift, sweep)` servo pairs, one side then the other.
    fn legs(&self) -> Vec<(usize, usize)> {
        let per_side = self.side_servos / 2;
        (0..2)
            .flat_map(|side| {
                let base = SPINE_JOINTS + side * self.side_servos;
                (0..per_side).map(move |leg| (base + 2 * leg, base + 2 * leg + 1))
            })
            .filter(|&(_, sweep)| sweep < self.angles.len())
            .collect()
    }

    fn spine_flex(&self) -> f64 {
        self.angles.iter().take(SPINE_JOINTS).map(|a| a.abs()).sum()
    }

    fn spine_yaw(&self) -> f64 {
        self.angles.first().copied().unwrap_or(0.0)
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }
}

impl Robot for PlanarRobot {
    fn servo_count(&self) -> usize {
        self.angles.len()
    }

    fn set_angle(&mut self, servo: usize, axis: ServoAxis, radians: f64) -> SimResult<()> {
        let servos = self.targets.len();
        let target = self
            .targets
            .get_mut(servo)
            .ok_or(SimError::ServoIndex { index: servo, servos })?;
        // Twist has no effect in the sagittal plane.
        if axis == ServoAxis::Dihedral {
            *target = radians.clamp(-SERVO_LIMIT, SERVO_LIMIT);
        }
        Ok(())
    }

    fn next_step(&mut self, dt: f64) -> SimResult<()> {
        self.previous.copy_from_slice(&self.angles);
        let max_delta = SERVO_MAX_SPEED * dt;
        for (angle, &target) in self.angles.iter_mut().zip(&self.targets) {
            let delta = (SERVO_GAIN * (target - *angle) * dt).clamp(-max_delta, max_delta);
            *angle = (*angle + delta).clamp(-SERVO_LIMIT, SERVO_LIMIT);
        }
        Ok(())
    }

    fn position(&self) -> Position {
        self.position
    }
}
