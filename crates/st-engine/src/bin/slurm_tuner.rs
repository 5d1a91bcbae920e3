use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use st_data::{Cancellation, CsvResultsStore};
use st_engine::TunerConfig;
use st_scheduler::SlurmScheduler;

/// Tune hyperparameters by running every trial as a SLURM batch job.
#[derive(Debug, Parser)]
#[command(name = "slurm-tuner", version, about)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, env = "SLURM_TUNER_CONFIG")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Override the number of trials
    #[arg(long)]
    trials: Option<usize>,

    /// Override how many trials run at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override the sampler seed
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = TunerConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(trials) = args.trials {
        config.n_trials = trials;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;

    let store = Arc::new(CsvResultsStore::new(&config.results_path));
    let scheduler = Arc::new(SlurmScheduler::new(config.scheduler.clone()));
    let cancellation = Cancellation::new();
    let engine = config
        .build_engine(store, scheduler)?
        .with_cancellation(cancellation.clone());
    let study = config.build_study();

    {
        let study = study.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling running trials");
                study.stop();
                cancellation.cancel();
            }
        });
    }

    info!(
        "Tuning {} with results in {}",
        config.script,
        config.results_path.display()
    );
    let summary = study
        .optimize(Arc::new(engine), config.n_trials, config.concurrency)
        .await;

    println!("{summary}");
    if summary.best_trial.is_none() {
        anyhow::bail!("no trial completed");
    }
    Ok(())
}
