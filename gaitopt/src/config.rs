use serde::{Deserialize, Serialize};

/// World setup for one `Simulation`. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Ground inclination in radians.
    pub tilt: f64,
    /// Skip the viewer entirely (no rendering, no abort polling).
    pub headless: bool,
    /// Number of terrain boxes.
    pub obstacle_count: usize,
    /// Upper bound of the box amplitude, in thousandths of a meter.
    pub obstacle_size: u32,
    /// Terrain seed. `None` seeds from the wall clock.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            tilt: 0.0,
            headless: true,
            obstacle_count: 10,
            obstacle_size: 6,
            seed: None,
        }
    }
}

/// Per-evaluation stepping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Integration step in seconds.
    pub step: f64,
    /// Simulated-time budget per run, in seconds.
    pub step_limit: f64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            step: 0.008,
            step_limit: 4.0,
        }
    }
}

/// CMA-ES search budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_evals: usize,
    pub sigma0: f64,
    /// `None` uses the CMA-ES default of 4 + 3 ln(n).
    pub pop_size: Option<usize>,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_evals: 2000,
            sigma0: 0.2,
            pop_size: None,
            seed: 42,
        }
    }
}

/// Physics implementation driving the robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Planar,
    Box2d,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sim: SimulationConfig,
    pub eval: EvalConfig,
    pub backend: BackendKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let sim: SimulationConfig = serde_json::from_str(r#"{"tilt": 0.1, "seed": 7}"#).unwrap();
        assert_eq!(sim.tilt, 0.1);
        assert_eq!(sim.seed, Some(7));
        assert_eq!(sim.obstacle_count, 10);
        assert_eq!(sim.obstacle_size, 6);
        assert!(sim.headless);

        let eval: EvalConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(eval, EvalConfig::default());
    }

    #[test]
    fn test_backend_names() {
        let kind: BackendKind = serde_json::from_str(r#""box2d""#).unwrap();
        assert_eq!(kind, BackendKind::Box2d);
        assert_eq!(Config::default().backend, BackendKind::Planar);
    }
}
