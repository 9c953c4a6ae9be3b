//! Gait evaluation and CMA-ES search.
//!
//! Every evaluation builds its own world, robot and terrain, so candidates of a
//! generation run in parallel on the rayon pool without sharing state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::gait::{GaitDescriptor, JointTable};
use super::optim::CmaEs;
use super::simulation::Simulation;
use super::world::{Backend, Position, Robot, RobotSpec, Visualizer};
use crate::config::{Config, EvalConfig, SearchConfig, SimulationConfig};
use crate::error::SimResult;

/// Terrains the best genome is re-scored on after a search.
const FINAL_TRIALS: u64 = 10;
const FINAL_SEED_OFFSET: u64 = 1_000_000;

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub backend: String,
    pub genome: Vec<f64>,
    pub fitness: f64,
    pub position: Position,
    pub steps: u64,
    pub clock: f64,
    pub descriptor: GaitDescriptor,
    pub terrain_seed: u64,
}

/// Result streamed per generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenResult {
    pub generation: usize,
    pub best: f64,
    pub best_ever: f64,
    pub mean: f64,
    pub sigma: f64,
    pub evals: usize,
    pub time: f64,
}

/// Final search result.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub method: String,
    pub backend: String,
    pub best_ever: f64,
    pub genome: Vec<f64>,
    pub descriptor: GaitDescriptor,
    /// Best genome re-scored on fresh terrains.
    pub final_mean: f64,
    pub final_std: f64,
    pub total_evals: usize,
    pub generations: usize,
    pub elapsed: f64,
    pub aborted: bool,
}

/// Genes the quadruped's controller expects.
pub fn genome_len() -> SimResult<usize> {
    Ok(JointTable::mirrored(RobotSpec::quadruped().servos)?.genome_len())
}

/// Run one genome on a fresh simulation.
pub fn evaluate<B: Backend>(
    backend: &B,
    sim: &SimulationConfig,
    eval: &EvalConfig,
    genome: &[f64],
    viewer: Option<Box<dyn Visualizer>>,
) -> SimResult<EvalReport> {
    let world = backend.create_world(sim.tilt)?;
    let mut simulation = Simulation::new(sim.clone(), world, &RobotSpec::quadruped(), viewer)?;
    let fitness = simulation.run(genome, eval.step, eval.step_limit)?;
    let joints = simulation.joints();
    let descriptor = joints.descriptor(&joints.genome(genome)?)?;

    Ok(EvalReport {
        backend: backend.name().to_string(),
        genome: genome.to_vec(),
        fitness,
        position: simulation.robot().position(),
        steps: simulation.steps_taken(),
        clock: simulation.clock(),
        descriptor,
        terrain_seed: simulation.terrain_seed(),
    })
}

fn headless_fitness<B: Backend>(
    backend: &B,
    sim: &SimulationConfig,
    eval: &EvalConfig,
    genome: &[f64],
) -> SimResult<f64> {
    evaluate(backend, sim, eval, genome, None).map(|r| r.fitness)
}

fn terrain_for(base: &SimulationConfig, seed: u64) -> SimulationConfig {
    SimulationConfig {
        headless: true,
        seed: Some(seed),
        ..base.clone()
    }
}

/// CMA-ES over the gait genome. All candidates of a generation share one
/// terrain; each generation draws a new one from the base seed.
///
/// `abort` is polled between generations. When it is set the search stops
/// and returns what it has, flagged `aborted`.
pub fn run_cma_es<B: Backend>(
    backend: &B,
    config: &Config,
    search: &SearchConfig,
    abort: &AtomicBool,
    mut on_gen: impl FnMut(&GenResult),
) -> Result<RunResult> {
    let n = genome_len()?;
    let mut cma = CmaEs::new(n, search.sigma0, search.pop_size, search.seed);
    let base_seed = config.sim.seed.unwrap_or(search.seed);

    tracing::info!(
        backend = backend.name(),
        genes = n,
        pop = cma.pop_size,
        budget = search.max_evals,
        base_seed,
        "CMA-ES search started"
    );

    let mut total_evals = 0usize;
    let mut aborted = false;
    let start = Instant::now();

    while total_evals < search.max_evals {
        if abort.load(Ordering::Relaxed) {
            tracing::warn!(generation = cma.generation, "search aborted");
            aborted = true;
            break;
        }

        let sim = terrain_for(&config.sim, base_seed.wrapping_add(cma.generation as u64));
        let candidates = cma.ask();
        let fitnesses: Vec<f64> = candidates
            .par_iter()
            .map(|c| headless_fitness(backend, &sim, &config.eval, c))
            .collect::<SimResult<Vec<f64>>>()
            .with_context(|| format!("generation {} evaluation failed", cma.generation))?;

        total_evals += candidates.len();
        cma.tell(&candidates, &fitnesses);

        let gen_best = fitnesses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let gen_mean = fitnesses.iter().sum::<f64>() / fitnesses.len() as f64;

        let gr = GenResult {
            generation: cma.generation,
            best: gen_best,
            best_ever: cma.best().map_or(f64::NEG_INFINITY, |(_, f)| f),
            mean: gen_mean,
            sigma: cma.sigma,
            evals: total_evals,
            time: start.elapsed().as_secs_f64(),
        };
        tracing::info!(
            generation = gr.generation,
            best = gr.best,
            best_ever = gr.best_ever,
            mean = gr.mean,
            sigma = gr.sigma,
            evals = gr.evals,
            "generation"
        );
        on_gen(&gr);
    }

    let (genome, best_ever) = match cma.best() {
        Some((x, f)) => (x.to_vec(), f),
        None => (cma.mean.clone(), f64::NEG_INFINITY),
    };
    let (final_mean, final_std) = if aborted || total_evals == 0 {
        (f64::NAN, f64::NAN)
    } else {
        let scores: Vec<f64> = (0..FINAL_TRIALS)
            .into_par_iter()
            .map(|i| {
                let sim = terrain_for(&config.sim, base_seed.wrapping_add(FINAL_SEED_OFFSET + i));
                headless_fitness(backend, &sim, &config.eval, &genome)
            })
            .collect::<SimResult<Vec<f64>>>()
            .context("final evaluation failed")?;
        mean_std(&scores)
    };

    let joints = JointTable::mirrored(RobotSpec::quadruped().servos)?;
    let descriptor = joints.descriptor(&joints.genome(&genome)?)?;

    Ok(RunResult {
        method: "CMA-ES".into(),
        backend: backend.name().into(),
        best_ever,
        genome,
        descriptor,
        final_mean,
        final_std,
        total_evals,
        generations: cma.generation,
        elapsed: start.elapsed().as_secs_f64(),
        aborted,
    })
}

fn mean_std(scores: &[f64]) -> (f64, f64) {
    let n = scores.len() as f64;
    let m = scores.iter().sum::<f64>() / n;
    let s = (scores.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n).sqrt();
    (m, s)
}

/// Read a genome from a JSON file: a bare array, or an object carrying a
/// `genome` array (such as a previous report).
pub fn load_genome(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading genome file {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing genome file {}", path.display()))?;
    let genes = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("genome") {
            Some(genes) => genes,
            None => bail!("{}: object has no `genome` field", path.display()),
        },
        _ => bail!("{}: expected an array or an object with `genome`", path.display()),
    };
    serde_json::from_value(genes)
        .with_context(|| format!("{}: genome must be numbers", path.display()))
}

/// Pretty JSON to `path`, or to stdout when `None`.
pub fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match path {
        Some(p) => {
            std::fs::write(p, json + "\n")
                .with_context(|| format!("writing report {}", p.display()))?;
            tracing::info!(path = %p.display(), "report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::experiments::planar::PlanarBackend;

    fn config(obstacles: usize) -> Config {
        Config {
            sim: SimulationConfig {
                obstacle_count: obstacles,
                seed: Some(11),
                ..SimulationConfig::default()
            },
            eval: EvalConfig {
                step: 0.008,
                step_limit: 0.5,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_genome_len_for_quadruped() {
        assert_eq!(genome_len().unwrap(), 19);
    }

    #[test]
    fn test_evaluate_reports_run() {
        let cfg = config(10);
        let genome = vec![0.5; 19];
        let report = evaluate(&PlanarBackend, &cfg.sim, &cfg.eval, &genome, None).unwrap();
        assert_eq!(report.backend, "planar");
        assert_eq!(report.steps, 63);
        assert!((report.clock - 63.0 * 0.008).abs() < 1e-9);
        assert_eq!(report.fitness, -report.position.x);
        assert_eq!(report.terrain_seed, 11);
        assert_eq!(report.genome, genome);
    }

    #[test]
    fn test_evaluate_rejects_short_genome() {
        let cfg = config(0);
        let err = evaluate(&PlanarBackend, &cfg.sim, &cfg.eval, &[0.5; 18], None).unwrap_err();
        assert!(matches!(err, SimError::ParameterLength { expected: 19, actual: 18 }));
    }

    #[test]
    fn test_search_respects_budget() {
        let cfg = config(5);
        let search = SearchConfig {
            max_evals: 24,
            pop_size: Some(8),
            ..SearchConfig::default()
        };
        let mut gens = Vec::new();
        let abort = AtomicBool::new(false);
        let result =
            run_cma_es(&PlanarBackend, &cfg, &search, &abort, |g| gens.push(g.clone())).unwrap();
        assert_eq!(result.total_evals, 24);
        assert_eq!(result.generations, 3);
        assert_eq!(gens.len(), 3);
        assert!(!result.aborted);
        assert_eq!(result.genome.len(), 19);
        assert!(result.final_mean.is_finite());
        assert_eq!(result.best_ever, gens.last().unwrap().best_ever);
        let top = gens.iter().map(|g| g.best).fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.best_ever, top, "best_ever is the best score of any generation");
        for pair in gens.windows(2) {
            assert!(pair[1].best_ever >= pair[0].best_ever);
        }
    }

    #[test]
    fn test_search_stops_on_abort() {
        let cfg = config(5);
        let abort = AtomicBool::new(true);
        let search = SearchConfig::default();
        let result = run_cma_es(&PlanarBackend, &cfg, &search, &abort, |_| {}).unwrap();
        assert!(result.aborted);
        assert_eq!(result.total_evals, 0);
        assert_eq!(result.genome, vec![0.5; 19]);
    }

    #[test]
    fn test_search_propagates_errors() {
        let mut cfg = config(5);
        cfg.eval.step = 0.0;
        let abort = AtomicBool::new(false);
        let search = SearchConfig::default();
        assert!(run_cma_es(&PlanarBackend, &cfg, &search, &abort, |_| {}).is_err());
    }

    #[test]
    fn test_report_round_trips_through_genome_file() {
        let cfg = config(0);
        let report = evaluate(&PlanarBackend, &cfg.sim, &cfg.eval, &[0.25; 19], None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(Some(&path), &report).unwrap();
        assert_eq!(load_genome(&path).unwrap(), vec![0.25; 19]);
    }

    #[test]
    fn test_load_genome_formats() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, "[0.1, 0.2, 0.3]").unwrap();
        assert_eq!(load_genome(&bare).unwrap(), vec![0.1, 0.2, 0.3]);

        let missing = dir.path().join("missing.json");
        std::fs::write(&missing, r#"{"fitness": 1.0}"#).unwrap();
        assert!(load_genome(&missing).is_err());

        let strings = dir.path().join("strings.json");
        std::fs::write(&strings, r#"["a", "b"]"#).unwrap();
        assert!(load_genome(&strings).is_err());
    }
}
