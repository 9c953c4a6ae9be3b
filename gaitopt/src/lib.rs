//! gaitopt: evaluates oscillator-driven legged gaits on rough simulated
//! terrain and searches for good ones with CMA-ES.

pub mod config;
pub mod error;
pub mod experiments;

pub use error::{SimError, SimResult};
