//! Physics collaborator abstraction.
//!
//! The simulation core only needs a handful of operations from a physics
//! engine: add static ground bodies, spawn a robot, drive its servos and
//! advance time. Each backend (`planar`, `box2d`) implements these traits.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::terrain::Obstacle;
use crate::error::SimResult;

/// World-frame position in meters. `z` is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Servo rotation axis. The gait only uses the dihedral axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoAxis {
    Dihedral,
    Twist,
}

/// Robot prototype: what a backend needs to build a robot instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotSpec {
    pub name: String,
    /// Servos in controller order: body joints, one side, the mirrored side.
    pub servos: usize,
    pub start: Position,
}

impl RobotSpec {
    /// The 10-servo quadruped the gait experiments were tuned for:
    /// 2 spine joints, then (lift, sweep) for front and rear leg on each side.
    pub fn quadruped() -> Self {
        RobotSpec {
            name: "quadruped".into(),
            servos: 10,
            start: Position::new(0.0, 0.0, 0.5),
        }
    }

    /// Servos per side, after the spine joints.
    pub fn side_servos(&self) -> usize {
        self.servos.saturating_sub(2) / 2
    }
}

impl Default for RobotSpec {
    fn default() -> Self {
        Self::quadruped()
    }
}

/// A robot living inside a physics world.
pub trait Robot {
    fn servo_count(&self) -> usize;

    /// Set the target angle (radians) of one servo axis.
    fn set_angle(&mut self, servo: usize, axis: ServoAxis, radians: f64) -> SimResult<()>;

    /// Advance the robot's own actuator state by `dt`.
    fn next_step(&mut self, dt: f64) -> SimResult<()>;

    fn position(&self) -> Position;
}

/// Rigid-body world: static ground set plus the dynamics of one robot.
///
/// Not `Send` by requirement: Box2D worlds hold raw pointers.
/// Parallel evaluation builds one world per task.
pub trait PhysicsWorld {
    type Robot: Robot;

    /// Register a fixed body with the ground-contact set.
    fn add_to_ground(&mut self, obstacle: &Obstacle) -> SimResult<()>;

    /// Number of static bodies registered so far.
    fn static_bodies(&self) -> usize;

    /// Instantiate a robot from its prototype.
    fn spawn_robot(&mut self, spec: &RobotSpec) -> SimResult<Self::Robot>;

    /// Advance the world (contacts, ground interaction) by `dt`.
    fn next_step(&mut self, robot: &mut Self::Robot, dt: f64) -> SimResult<()>;
}

/// Factory for worlds, shared across evaluation threads.
pub trait Backend: Sync {
    type World: PhysicsWorld;

    /// Construct an empty world with standard gravity and the given ground tilt.
    fn create_world(&self, tilt: f64) -> SimResult<Self::World>;

    fn name(&self) -> &'static str;
}

/// One rendered frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub time: f64,
    pub position: Position,
}

/// Optional visualization collaborator.
pub trait Visualizer {
    fn attach(&mut self, spec: &RobotSpec);
    fn add_obstacle(&mut self, obstacle: &Obstacle);
    fn render(&mut self, frame: &Frame);
    fn abort_requested(&self) -> bool;
}
