//! Gait experiments: a CPG-driven quadruped walked over generated rough ground.
//!
//! Architecture:
//! - `world`: physics/robot/viewer traits every backend implements
//! - `terrain`: Gaussian-bell obstacle generator
//! - `gait`: per-joint oscillators and the group → servo table
//! - `simulation`: stepping loop and fitness
//! - `planar`, `box2d`: physics backends
//! - `optim`, `runner`: CMA-ES and parallel evaluation

pub mod world;
pub mod terrain;
pub mod gait;
pub mod simulation;
pub mod planar;
#[cfg(feature = "box2d")]
pub mod box2d;
pub mod viewer;
pub mod optim;
pub mod runner;
