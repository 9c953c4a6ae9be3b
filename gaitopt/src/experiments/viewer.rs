//! Log-based viewer: "renders" by emitting tracing events and reports user
//! aborts raised through a shared flag (set by the signal handler in `main`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::terrain::Obstacle;
use super::world::{Frame, RobotSpec, Visualizer};

pub struct TraceViewer {
    abort: Arc<AtomicBool>,
    /// Emit one frame out of every `every`.
    every: u64,
    frames: u64,
    obstacles: usize,
}

impl TraceViewer {
    pub fn new(abort: Arc<AtomicBool>, every: u64) -> Self {
        TraceViewer {
            abort,
            every: every.max(1),
            frames: 0,
            obstacles: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Visualizer for TraceViewer {
    fn attach(&mut self, spec: &RobotSpec) {
        tracing::info!(
            robot = %spec.name,
            servos = spec.servos,
            start = %spec.start,
            "viewer attached"
        );
    }

    fn add_obstacle(&mut self, obstacle: &Obstacle) {
        self.obstacles += 1;
        tracing::debug!(
            n = self.obstacles,
            center = %obstacle.center,
            size = obstacle.size(),
            "obstacle"
        );
    }

    fn render(&mut self, frame: &Frame) {
        if self.frames % self.every == 0 {
            tracing::info!(time = frame.time, position = %frame.position, "frame");
        }
        self.frames += 1;
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}
