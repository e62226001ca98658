use clap::{Args, Parser, Subcommand, ValueEnum};
use image::ImageFormat;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{EnsembleError, Result};
use crate::grid::GridGeometry;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Predict with every replica, then average the results
    Run(RunArgs),
    /// Predict with a single replica (used for process isolation)
    Replica(ReplicaArgs),
    /// Average already persisted replica predictions
    Aggregate(AggregateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub experiment: ExperimentArgs,

    #[command(flatten)]
    pub predict: PredictArgs,

    /// Number of trained replicas in the ensemble
    #[arg(short, long, default_value_t = 5)]
    pub number_models: usize,

    #[arg(long, value_enum, default_value_t = Isolation::InProcess)]
    pub isolation: Isolation,
}

#[derive(Args, Clone, Debug)]
pub struct ReplicaArgs {
    #[command(flatten)]
    pub experiment: ExperimentArgs,

    #[command(flatten)]
    pub predict: PredictArgs,

    #[arg(long)]
    pub model_idx: usize,
}

#[derive(Args, Clone, Debug)]
pub struct AggregateArgs {
    #[command(flatten)]
    pub experiment: ExperimentArgs,

    #[arg(short, long, default_value_t = 5)]
    pub number_models: usize,
}

#[derive(Args, Clone, Debug)]
pub struct ExperimentArgs {
    /// The number of the experiment
    #[arg(short, long, default_value_t = 1)]
    pub experiment: u32,

    /// Directory holding the data generated by all experiments
    #[arg(short = 'x', long, default_value = "experiments")]
    pub experiments_path: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct PredictArgs {
    /// Raster to predict (.npy of shape (H, W, C) or an image file)
    #[arg(short, long, value_parser = check_raster_path)]
    pub image: PathBuf,

    #[arg(short, long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 128)]
    pub patch_size: usize,

    /// Border pixels dropped from each side of a predicted patch
    #[arg(long, default_value_t = 8)]
    pub test_crop: usize,

    #[arg(long, default_value_t = 3)]
    pub n_classes: usize,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, requires = "train_labels")]
    pub train_patches: Option<PathBuf>,

    #[arg(long, requires = "train_patches")]
    pub train_labels: Option<PathBuf>,

    #[arg(long, requires = "val_labels")]
    pub val_patches: Option<PathBuf>,

    #[arg(long, requires = "val_patches")]
    pub val_labels: Option<PathBuf>,
}

/// How replicas are kept apart from each other.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isolation {
    /// Scoped worker in this process; the predictor is dropped after each replica
    InProcess,
    /// Re-execute this binary once per replica and wait for it to exit
    Subprocess,
}

impl PredictArgs {
    pub fn geometry(&self) -> Result<GridGeometry> {
        GridGeometry::new(self.patch_size, self.test_crop, self.n_classes)
    }

    /// Flags that reproduce these arguments on a child `replica` invocation.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--image".into(),
            self.image.clone().into(),
            "--batch-size".into(),
            self.batch_size.to_string().into(),
            "--patch-size".into(),
            self.patch_size.to_string().into(),
            "--test-crop".into(),
            self.test_crop.to_string().into(),
            "--n-classes".into(),
            self.n_classes.to_string().into(),
            "--device-id".into(),
            self.device_id.to_string().into(),
        ];
        let optional = [
            ("--train-patches", &self.train_patches),
            ("--train-labels", &self.train_labels),
            ("--val-patches", &self.val_patches),
            ("--val-labels", &self.val_labels),
        ];
        for (flag, value) in optional {
            if let Some(path) = value {
                args.push(flag.into());
                args.push(path.clone().into());
            }
        }
        args
    }
}

impl ExperimentArgs {
    pub fn layout(&self) -> ExperimentLayout {
        ExperimentLayout::new(&self.experiments_path, self.experiment)
    }

    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            "--experiment".into(),
            self.experiment.to_string().into(),
            "--experiments-path".into(),
            self.experiments_path.clone().into(),
        ]
    }
}

/// Directory layout of one experiment: `{experiments_path}/exp_{n}/…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    experiment: u32,
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new(experiments_path: &Path, experiment: u32) -> Self {
        Self {
            experiment,
            root: experiments_path.join(format!("exp_{}", experiment)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn predicted_dir(&self) -> PathBuf {
        self.root.join("predicted")
    }

    pub fn replica_log_path(&self, model_idx: usize) -> PathBuf {
        self.logs_dir()
            .join(format!("pred_{}_{}.txt", self.experiment, model_idx))
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.logs_dir(), self.predicted_dir()] {
            fs::create_dir_all(&dir).map_err(|e| EnsembleError::FileSystem {
                path: dir.clone(),
                operation: "create experiment directory".to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

fn check_raster_path(s: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(s);
    let is_npy = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("npy"));
    if is_npy {
        return Ok(path);
    }

    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.reading_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    match ImageFormat::from_path(&path) {
        Ok(format) if format.reading_enabled() => Ok(path),
        _ => Err(format!(
            "{} is not a supported raster. Supported: `npy`, {}",
            s,
            supported.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ExperimentLayout::new(Path::new("experiments"), 4);
        assert_eq!(layout.root(), Path::new("experiments/exp_4"));
        assert_eq!(
            layout.replica_log_path(2),
            Path::new("experiments/exp_4/logs/pred_4_2.txt")
        );
        assert_eq!(
            layout.models_dir(),
            Path::new("experiments/exp_4/models")
        );
    }

    #[test]
    fn test_run_defaults() {
        let config = Config::try_parse_from(["patch-ensemble", "run", "--image", "scene.npy"])
            .unwrap();
        let Command::Run(args) = config.command else {
            panic!("expected run");
        };
        assert_eq!(args.number_models, 5);
        assert_eq!(args.isolation, Isolation::InProcess);
        assert_eq!(args.predict.patch_size, 128);
        assert_eq!(args.predict.test_crop, 8);
        assert_eq!(args.experiment.experiment, 1);
    }

    #[test]
    fn test_rejects_unknown_raster_extension() {
        assert!(check_raster_path("scene.txt").is_err());
        assert!(check_raster_path("scene.NPY").is_ok());
        assert!(check_raster_path("scene.png").is_ok());
    }

    #[test]
    fn test_replica_args_round_trip() {
        let config = Config::try_parse_from([
            "patch-ensemble",
            "run",
            "-e",
            "3",
            "--image",
            "scene.npy",
            "--test-crop",
            "4",
            "--val-patches",
            "val_x.npy",
            "--val-labels",
            "val_y.npy",
        ])
        .unwrap();
        let Command::Run(run) = config.command else {
            panic!("expected run");
        };

        let mut argv: Vec<OsString> = vec!["patch-ensemble".into(), "replica".into()];
        argv.extend(run.experiment.to_args());
        argv.extend(run.predict.to_args());
        argv.extend(["--model-idx".into(), "1".into()]);

        let Command::Replica(replica) = Config::try_parse_from(argv).unwrap().command else {
            panic!("expected replica");
        };
        assert_eq!(replica.model_idx, 1);
        assert_eq!(replica.experiment.experiment, 3);
        assert_eq!(replica.predict.test_crop, 4);
        assert_eq!(replica.predict.val_labels, Some(PathBuf::from("val_y.npy")));
        assert_eq!(replica.predict.train_patches, None);
    }

    #[test]
    fn test_geometry_validation_surfaces() {
        let config = Config::try_parse_from([
            "patch-ensemble",
            "run",
            "--image",
            "scene.npy",
            "--patch-size",
            "16",
        ])
        .unwrap();
        let Command::Run(args) = config.command else {
            panic!("expected run");
        };
        assert!(matches!(
            args.predict.geometry(),
            Err(EnsembleError::Configuration { .. })
        ));
    }
}
