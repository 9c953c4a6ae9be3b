use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use gaitopt::config::{BackendKind, Config, EvalConfig, SearchConfig, SimulationConfig};
use gaitopt::experiments::planar::PlanarBackend;
use gaitopt::experiments::runner;
use gaitopt::experiments::viewer::TraceViewer;
use gaitopt::experiments::world::{Backend, Visualizer};

#[derive(Parser)]
#[command(name = "gaitopt", about = "Evaluate and search CPG gaits on rough simulated terrain")]
struct Cli {
    /// Ground tilt in radians
    #[arg(
        long,
        env = "GAITOPT_TILT",
        default_value_t = 0.0,
        allow_negative_numbers = true,
        global = true
    )]
    tilt: f64,

    /// Number of terrain boxes
    #[arg(long, env = "GAITOPT_OBSTACLES", default_value_t = 10, global = true)]
    obstacles: usize,

    /// Upper bound of box amplitude, in thousandths of a meter (>= 2)
    #[arg(long, env = "GAITOPT_OBSTACLE_SIZE", default_value_t = 6, global = true)]
    obstacle_size: u32,

    /// Terrain seed (wall clock when unset)
    #[arg(long, env = "GAITOPT_SEED", global = true)]
    seed: Option<u64>,

    /// Integration step in seconds
    #[arg(long, env = "GAITOPT_STEP", default_value_t = 0.008, global = true)]
    step: f64,

    /// Simulated seconds per evaluation
    #[arg(long, env = "GAITOPT_STEP_LIMIT", default_value_t = 4.0, global = true)]
    step_limit: f64,

    /// Physics backend
    #[arg(
        long,
        env = "GAITOPT_BACKEND",
        value_enum,
        default_value_t = BackendKind::Planar,
        global = true
    )]
    backend: BackendKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one genome and report its fitness
    Evaluate {
        /// Comma-separated genes in [0, 1]
        #[arg(
            long,
            value_delimiter = ',',
            allow_negative_numbers = true,
            required_unless_present = "genome_file",
            conflicts_with = "genome_file"
        )]
        genome: Vec<f64>,

        /// JSON array, or a report with a `genome` field
        #[arg(long)]
        genome_file: Option<PathBuf>,

        /// Attach the trace viewer (Ctrl-C aborts the run)
        #[arg(long, default_value = "false")]
        render: bool,

        /// Log one frame out of every N when rendering
        #[arg(long, default_value = "25")]
        render_every: u64,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// CMA-ES search over the gait genome
    Search {
        #[arg(long, env = "GAITOPT_MAX_EVALS", default_value_t = 2000)]
        max_evals: usize,

        #[arg(long, default_value_t = 0.2)]
        sigma0: f64,

        /// Population size (default 4 + 3 ln n)
        #[arg(long)]
        pop_size: Option<usize>,

        /// Seed of the CMA-ES sampler
        #[arg(long, default_value_t = 42)]
        search_seed: u64,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = Config {
        sim: SimulationConfig {
            tilt: cli.tilt,
            headless: true,
            obstacle_count: cli.obstacles,
            obstacle_size: cli.obstacle_size,
            seed: cli.seed,
        },
        eval: EvalConfig {
            step: cli.step,
            step_limit: cli.step_limit,
        },
        backend: cli.backend,
    };
    tracing::info!(
        backend = ?cfg.backend,
        tilt = cfg.sim.tilt,
        obstacles = cfg.sim.obstacle_count,
        step = cfg.eval.step,
        step_limit = cfg.eval.step_limit,
        version = env!("CARGO_PKG_VERSION"),
        "Starting gaitopt"
    );

    // First signal asks the job to stop, a second one quits outright.
    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        // Headless evaluations never poll the flag and run to their step limit.
        tracing::warn!(
            "Abort requested: rendered runs stop at the next step, search at the next \
             generation (signal again to quit)"
        );
        flag.store(true, Ordering::Relaxed);
        shutdown_signal().await;
        std::process::exit(130);
    });

    let command = cli.command;
    tokio::task::spawn_blocking(move || run(command, &cfg, abort))
        .await
        .context("job panicked")?
}

fn run(command: Command, cfg: &Config, abort: Arc<AtomicBool>) -> Result<()> {
    match cfg.backend {
        BackendKind::Planar => dispatch(&PlanarBackend, command, cfg, abort),
        #[cfg(feature = "box2d")]
        BackendKind::Box2d => {
            dispatch(&gaitopt::experiments::box2d::Box2dBackend, command, cfg, abort)
        }
        #[cfg(not(feature = "box2d"))]
        BackendKind::Box2d => {
            anyhow::bail!("this build has no Box2D backend (rebuild with --features box2d)")
        }
    }
}

fn dispatch<B: Backend>(
    backend: &B,
    command: Command,
    cfg: &Config,
    abort: Arc<AtomicBool>,
) -> Result<()> {
    match command {
        Command::Evaluate {
            genome,
            genome_file,
            render,
            render_every,
            output,
        } => {
            let genome = match genome_file {
                Some(path) => runner::load_genome(&path)?,
                None => genome,
            };
            let sim = SimulationConfig {
                headless: !render,
                ..cfg.sim.clone()
            };
            let viewer: Option<Box<dyn Visualizer>> = if render {
                Some(Box::new(TraceViewer::new(abort, render_every)))
            } else {
                None
            };

            match runner::evaluate(backend, &sim, &cfg.eval, &genome, viewer) {
                Ok(report) => {
                    tracing::info!(
                        fitness = report.fitness,
                        position = %report.position,
                        steps = report.steps,
                        terrain_seed = report.terrain_seed,
                        "Evaluation done"
                    );
                    runner::write_report(output.as_deref(), &report)?;
                }
                Err(e) if e.is_abort() => tracing::warn!("Evaluation aborted"),
                Err(e) => return Err(e).context("evaluation failed"),
            }
        }
        Command::Search {
            max_evals,
            sigma0,
            pop_size,
            search_seed,
            output,
        } => {
            let search = SearchConfig {
                max_evals,
                sigma0,
                pop_size,
                seed: search_seed,
            };
            let result = runner::run_cma_es(backend, cfg, &search, &abort, |_| {})?;
            tracing::info!(
                best_ever = result.best_ever,
                final_mean = result.final_mean,
                final_std = result.final_std,
                evals = result.total_evals,
                aborted = result.aborted,
                elapsed = result.elapsed,
                "Search done"
            );
            runner::write_report(output.as_deref(), &result)?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
