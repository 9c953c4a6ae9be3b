//! Rough-ground generator.
//!
//! Boxes are scattered around a skewed 2-D Gaussian bell: positions are
//! drawn uniformly inside the bell's core and each box's size is the bell's
//! density at its center, scaled by a random amplitude. Big boxes sit near the
//! skew center, small ones at the rim.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::world::Position;
use crate::error::{SimError, SimResult};

/// Mass of every terrain box.
pub const OBSTACLE_MASS: f64 = 10.0;
/// Footprint stretch relative to box height.
pub const FOOTPRINT_STRETCH: f64 = 4.0;
/// Smallest amplitude a box can be drawn with.
pub const MIN_AMPLITUDE: f64 = 0.002;

/// A static terrain box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub center: Position,
    pub width: f64,
    pub depth: f64,
    pub height: f64,
    /// Euler angles (roll, pitch, yaw) in radians.
    pub rotation: [f64; 3],
    pub mass: f64,
    pub fixed: bool,
}

impl Obstacle {
    /// Linear size the box was generated from.
    pub fn size(&self) -> f64 {
        self.height
    }

    pub fn fix(&mut self) {
        self.fixed = true;
    }

    /// Whether the box footprint covers ground point `(x, y)`, ignoring rotation.
    pub fn covers(&self, x: f64, y: f64) -> bool {
        (x - self.center.x).abs() <= self.width / 2.0
            && (y - self.center.y).abs() <= self.depth / 2.0
    }

    /// World height of the box top.
    pub fn top(&self) -> f64 {
        self.center.z + self.height / 2.0
    }
}

/// Shape of the Gaussian bell the terrain is drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianShape {
    pub xc: f64,
    pub yc: f64,
    pub spread: f64,
}

impl Default for GaussianShape {
    fn default() -> Self {
        GaussianShape {
            xc: -0.4,
            yc: 0.0,
            spread: 0.5,
        }
    }
}

impl GaussianShape {
    /// Unnormalized density at `(x, y)` with unit amplitude.
    pub fn density(&self, x: f64, y: f64) -> f64 {
        let two_s2 = 2.0 * self.spread * self.spread;
        (-((x - self.xc).powi(2) / two_s2 + (y - self.yc).powi(2) / two_s2)).exp()
    }

    /// Half-width of the sampling window. Trimmed by 0.1 so the bell's
    /// skirts (where boxes would be tiny) are never sampled.
    pub fn window(&self) -> f64 {
        self.spread - 0.1
    }
}

/// Produces the obstacle field for one simulation.
pub struct TerrainGenerator {
    shape: GaussianShape,
    rng: ChaCha12Rng,
    seed: u64,
}

impl TerrainGenerator {
    pub fn new(seed: u64) -> Self {
        TerrainGenerator {
            shape: GaussianShape::default(),
            rng: ChaCha12Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed from the explicit value or, failing that, the wall clock.
    pub fn from_seed(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            let s = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            tracing::info!(seed = s, "terrain seeded from wall clock");
            s
        });
        Self::new(seed)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn shape(&self) -> &GaussianShape {
        &self.shape
    }

    /// Draw `count` boxes with amplitudes between `MIN_AMPLITUDE` and
    /// `size_scale / 1000`. Boxes are lifted and rotated to lie flush with a
    /// ground tilted by `tilt`.
    ///
    /// Below a scale of 2 the bounds swap, so amplitudes fall in
    /// `[size_scale / 1000, MIN_AMPLITUDE]`. Tiny boxes are kept.
    pub fn generate(
        &mut self,
        count: usize,
        size_scale: u32,
        tilt: f64,
    ) -> SimResult<Vec<Obstacle>> {
        if size_scale == 0 {
            return Err(SimError::InvalidTerrain { size_scale });
        }
        let scaled = size_scale as f64 / 1000.0;
        let (lo, hi) = (MIN_AMPLITUDE.min(scaled), MIN_AMPLITUDE.max(scaled));

        let w = self.shape.window();
        let slope = tilt.tan();
        let mut obstacles = Vec::with_capacity(count);

        for _ in 0..count {
            let a = self.rng.gen_range(lo..=hi);
            let x = self.rng.gen_range(-w..=w) + self.shape.xc;
            let y = self.rng.gen_range(-w..=w) + self.shape.yc;

            let bsize = a * self.shape.density(x, y);

            let mut obstacle = Obstacle {
                center: Position::new(x, y, bsize / 2.0 + slope * -x),
                width: bsize * FOOTPRINT_STRETCH,
                depth: bsize * FOOTPRINT_STRETCH,
                height: bsize,
                rotation: [0.0, -tilt, 0.0],
                mass: OBSTACLE_MASS,
                fixed: false,
            };
            obstacle.fix();
            obstacles.push(obstacle);
        }

        Ok(obstacles)
    }
}
