use std::ffi::OsString;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use patch_ensemble::{
    config::{AggregateArgs, Command, ReplicaArgs, RunArgs},
    logging::init_logging,
    ArtifactStore, Config, EnsembleAggregator, InProcessRunner, Isolation, OnnxModelProvider,
    Orchestrator, SubprocessRunner,
};

fn main() -> Result<()> {
    init_logging();
    let config = Config::parse();
    let show_progress = !config.quiet;

    match config.command {
        Command::Run(args) => run(args, show_progress),
        Command::Replica(args) => replica(args, show_progress),
        Command::Aggregate(args) => aggregate(args, show_progress),
    }
}

fn run(args: RunArgs, show_progress: bool) -> Result<()> {
    ensure!(args.number_models > 0, "number of models must be positive");
    ensure!(args.predict.image.exists(), "Input raster does not exist");
    args.predict.geometry()?;

    let layout = args.experiment.layout();
    layout.create_dirs()?;
    let store = ArtifactStore::create(layout.predicted_dir())?;

    let summary = match args.isolation {
        Isolation::InProcess => {
            let inputs = patch_ensemble::load_inputs(&args.predict)?;
            let provider = OnnxModelProvider::new(
                layout.models_dir(),
                args.predict.device_id,
                *inputs.grid.geometry(),
                inputs.raster.dim().2,
            );
            let runner = InProcessRunner::new(&provider, &inputs, &store, |idx| {
                layout.replica_log_path(idx)
            })
            .with_progress(show_progress);
            let summary = Orchestrator::new(runner, &store, args.number_models)
                .with_progress(show_progress)
                .run()?;
            summary
        }
        Isolation::Subprocess => {
            let mut child_args: Vec<OsString> = vec!["replica".into()];
            if !show_progress {
                child_args.push("--quiet".into());
            }
            child_args.extend(args.experiment.to_args());
            child_args.extend(args.predict.to_args());
            let runner = SubprocessRunner::current_exe(child_args, store.clone())?;
            Orchestrator::new(runner, &store, args.number_models)
                .with_progress(show_progress)
                .run()?
        }
    };

    for (model_idx, reason) in &summary.failed {
        log::warn!("replica {} did not complete: {}", model_idx, reason);
    }
    println!(
        "Ensemble of {} replicas {:?} saved to {}",
        summary.completed.len(),
        summary.ensemble_shape,
        summary.ensemble_path.display()
    );
    Ok(())
}

fn replica(args: ReplicaArgs, show_progress: bool) -> Result<()> {
    ensure!(args.predict.image.exists(), "Input raster does not exist");

    let layout = args.experiment.layout();
    layout.create_dirs()?;
    let store = ArtifactStore::create(layout.predicted_dir())?;
    let inputs = patch_ensemble::load_inputs(&args.predict)?;
    let provider = OnnxModelProvider::new(
        layout.models_dir(),
        args.predict.device_id,
        *inputs.grid.geometry(),
        inputs.raster.dim().2,
    );

    let report = InProcessRunner::new(&provider, &inputs, &store, |idx| {
        layout.replica_log_path(idx)
    })
    .with_progress(show_progress)
    .run_with_report(args.model_idx)
    .with_context(|| format!("Replica {} failed", args.model_idx))?;

    log::info!(
        "replica {} done in {:.3} s",
        report.model_idx,
        report.prediction_time.as_secs_f64()
    );
    Ok(())
}

fn aggregate(args: AggregateArgs, show_progress: bool) -> Result<()> {
    let layout = args.experiment.layout();
    let store = ArtifactStore::new(layout.predicted_dir());
    ensure!(
        store.dir().exists(),
        "Prediction directory {} does not exist",
        store.dir().display()
    );

    let (path, mean) = EnsembleAggregator::new(&store)
        .with_progress(show_progress)
        .run(args.number_models)?;
    println!("Ensemble {:?} saved to {}", mean.dim(), path.display());
    Ok(())
}
