pub mod artifact;
pub mod config;
pub mod ensemble;
pub mod errors;
pub mod evaluate;
pub mod grid;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod patches;
pub mod reconstruct;
pub mod traits;
pub mod worker;

pub mod mocks;

mod progress_tracker;

pub use artifact::{read_raster, ArtifactStore};
pub use config::{Config, ExperimentLayout, Isolation, PredictArgs};
pub use ensemble::{ensemble_mean, EnsembleAggregator};
pub use errors::{EnsembleError, Result};
pub use evaluate::{EvalReport, LabeledPatches};
pub use grid::{GridGeometry, PatchGrid};
pub use model::{OnnxModelProvider, OnnxPredictor};
pub use orchestrator::{Orchestrator, RunSummary, SubprocessRunner};
pub use patches::PatchExtractor;
pub use reconstruct::{reconstruct, PatchPredictions, PredictionCollector};
pub use traits::*;
pub use worker::{InProcessRunner, ReplicaInputs, ReplicaReport, ReplicaWorker};

use std::path::Path;

/// 推論対象ラスタと評価用データを読み込み、全レプリカ共通の入力を組み立てる
///
/// ジオメトリの検証はここで一度だけ行い、処理開始前に設定エラーを返す
pub fn load_inputs(args: &PredictArgs) -> Result<ReplicaInputs> {
    let geometry = args.geometry()?;
    let raster = read_raster(&args.image)?;
    let (height, width, channels) = raster.dim();
    let grid = PatchGrid::new(height, width, geometry)?;
    log::info!(
        "raster {}x{}x{} -> grid {}x{} of {}px patches (crop {}, stride {})",
        height,
        width,
        channels,
        grid.rows(),
        grid.cols(),
        geometry.patch_size(),
        geometry.test_crop(),
        geometry.inner()
    );

    let train = load_labeled(args.train_patches.as_deref(), args.train_labels.as_deref())?;
    let val = load_labeled(args.val_patches.as_deref(), args.val_labels.as_deref())?;

    Ok(ReplicaInputs::new(raster, grid, args.batch_size)?.with_evaluation(train, val))
}

fn load_labeled(patches: Option<&Path>, labels: Option<&Path>) -> Result<Option<LabeledPatches>> {
    match (patches, labels) {
        (Some(patches), Some(labels)) => LabeledPatches::load(patches, labels).map(Some),
        (None, None) => Ok(None),
        _ => Err(EnsembleError::configuration(
            "evaluation patches and labels must be given together",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use ndarray_npy::write_npy;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn predict_args(image: PathBuf) -> PredictArgs {
        PredictArgs {
            image,
            batch_size: 4,
            patch_size: 16,
            test_crop: 2,
            n_classes: 3,
            device_id: 0,
            train_patches: None,
            train_labels: None,
            val_patches: None,
            val_labels: None,
        }
    }

    #[test]
    fn test_load_inputs_builds_grid() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let image = temp_dir.path().join("scene.npy");
        write_npy(&image, &Array3::<f32>::zeros((30, 25, 3))).unwrap();

        let inputs = load_inputs(&predict_args(image))?;
        assert_eq!(inputs.grid.shape(), (3, 3));
        assert!(inputs.train.is_none());
        Ok(())
    }

    #[test]
    fn test_load_inputs_with_evaluation_sets() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let image = temp_dir.path().join("scene.npy");
        let patches = temp_dir.path().join("val_x.npy");
        let labels = temp_dir.path().join("val_y.npy");
        write_npy(&image, &Array3::<f32>::zeros((30, 25, 3))).unwrap();
        write_npy(&patches, &Array4::<f32>::zeros((2, 16, 16, 3))).unwrap();
        write_npy(&labels, &Array3::<u8>::zeros((2, 16, 16))).unwrap();

        let mut args = predict_args(image);
        args.val_patches = Some(patches);
        args.val_labels = Some(labels);

        let inputs = load_inputs(&args)?;
        assert_eq!(inputs.val.map(|v| v.len()), Some(2));
        Ok(())
    }

    #[test]
    fn test_invalid_geometry_fails_before_reading() {
        let mut args = predict_args(PathBuf::from("missing.npy"));
        args.test_crop = 8;
        assert!(matches!(
            load_inputs(&args),
            Err(EnsembleError::Configuration { .. })
        ));
    }
}
