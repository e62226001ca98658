use std::path::PathBuf;
use std::time::{Duration, Instant};

use ndarray::prelude::*;

use crate::artifact::ArtifactStore;
use crate::errors::{EnsembleError, Result};
use crate::evaluate::{evaluate, EvalReport, LabeledPatches};
use crate::grid::PatchGrid;
use crate::logging::ReplicaLog;
use crate::patches::PatchExtractor;
use crate::progress_tracker::ProgressTracker;
use crate::reconstruct::{reconstruct, PredictionCollector};
use crate::traits::{ModelProvider, ReplicaPredictor, ReplicaRunner};

/// Read-only inputs shared by every replica of an experiment.
#[derive(Debug, Clone)]
pub struct ReplicaInputs {
    pub raster: Array3<f32>,
    pub grid: PatchGrid,
    pub batch_size: usize,
    pub train: Option<LabeledPatches>,
    pub val: Option<LabeledPatches>,
}

impl ReplicaInputs {
    pub fn new(raster: Array3<f32>, grid: PatchGrid, batch_size: usize) -> Result<Self> {
        let (h, w, _) = raster.dim();
        if (h, w) != (grid.height(), grid.width()) {
            return Err(EnsembleError::shape_mismatch(
                "raster extent",
                (grid.height(), grid.width()),
                (h, w),
            ));
        }
        Ok(Self {
            raster,
            grid,
            batch_size: batch_size.max(1),
            train: None,
            val: None,
        })
    }

    pub fn with_evaluation(
        mut self,
        train: Option<LabeledPatches>,
        val: Option<LabeledPatches>,
    ) -> Self {
        self.train = train;
        self.val = val;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaReport {
    pub model_idx: usize,
    pub artifact: PathBuf,
    pub prediction_time: Duration,
    pub train: Option<EvalReport>,
    pub val: Option<EvalReport>,
}

/// Owns one replica's predictor for exactly one run.
///
/// [`ReplicaWorker::run`] consumes the worker, so the predictor (and whatever
/// device memory or runtime state it holds) is released when the run returns,
/// on success and on error alike, before the next replica is loaded.
pub struct ReplicaWorker<P: ReplicaPredictor> {
    model_idx: usize,
    predictor: P,
    log: ReplicaLog,
    show_progress: bool,
}

impl<P: ReplicaPredictor> ReplicaWorker<P> {
    pub fn load<M>(provider: &M, model_idx: usize, log: ReplicaLog) -> Result<Self>
    where
        M: ModelProvider<Predictor = P>,
    {
        let predictor = provider.load(model_idx)?;
        Ok(Self {
            model_idx,
            predictor,
            log,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run(mut self, inputs: &ReplicaInputs, store: &ArtifactStore) -> Result<ReplicaReport> {
        let description = self.predictor.describe();
        self.note(format_args!("Model: {}", description));

        let train = self.diagnose("train", inputs.train.as_ref(), inputs.batch_size);
        let val = self.diagnose("val", inputs.val.as_ref(), inputs.batch_size);

        let started = Instant::now();
        let raster = self.predict_raster(inputs)?;
        let prediction_time = started.elapsed();
        self.note(format_args!(
            "Prediction time: {:.3} s",
            prediction_time.as_secs_f64()
        ));

        let artifact = store.save_replica(self.model_idx, raster.view())?;
        self.note(format_args!("Saved {:?} to {}", raster.dim(), artifact.display()));

        Ok(ReplicaReport {
            model_idx: self.model_idx,
            artifact,
            prediction_time,
            train,
            val,
        })
    }

    /// Evaluation is diagnostic only: a failure is logged and prediction
    /// still runs.
    fn diagnose(
        &mut self,
        name: &str,
        set: Option<&LabeledPatches>,
        batch_size: usize,
    ) -> Option<EvalReport> {
        let set = set?;
        match evaluate(&self.predictor, set, batch_size, None) {
            Ok(report) => {
                self.note(format_args!("Evaluate {}: {}", name, report));
                Some(report)
            }
            Err(e) => {
                self.note(format_args!("Evaluate {} skipped: {}", name, e));
                None
            }
        }
    }

    fn note(&mut self, line: impl std::fmt::Display) {
        if let Err(e) = self.log.record(line) {
            log::warn!("replica {}: {}", self.model_idx, e);
        }
    }

    fn predict_raster(&self, inputs: &ReplicaInputs) -> Result<Array3<f32>> {
        let extractor = PatchExtractor::new(inputs.raster.view(), inputs.grid)?;
        let batches = extractor.batches(inputs.batch_size);
        let tracker = ProgressTracker::new(
            batches.len(),
            &format!("Predicting replica {}", self.model_idx),
            self.show_progress,
        );

        let mut collector = PredictionCollector::new(inputs.grid);
        for batch in batches {
            let prediction = self.predictor.predict_on_batch(batch.view())?;
            if prediction.dim().0 != batch.dim().0 {
                return Err(EnsembleError::shape_mismatch(
                    "predictor batch size",
                    batch.dim().0,
                    prediction.dim().0,
                ));
            }
            collector.push_batch(prediction.view())?;
            tracker.inc();
        }
        tracker.finish();

        Ok(reconstruct(&collector.finish()?))
    }
}

impl<P: ReplicaPredictor> Drop for ReplicaWorker<P> {
    fn drop(&mut self) {
        log::debug!("releasing predictor of replica {}", self.model_idx);
    }
}

/// Runs replicas inside the current process, one [`ReplicaWorker`] at a time.
pub struct InProcessRunner<'a, M: ModelProvider> {
    provider: &'a M,
    inputs: &'a ReplicaInputs,
    store: &'a ArtifactStore,
    log_path: Box<dyn Fn(usize) -> PathBuf + 'a>,
    show_progress: bool,
}

impl<'a, M: ModelProvider> InProcessRunner<'a, M> {
    pub fn new(
        provider: &'a M,
        inputs: &'a ReplicaInputs,
        store: &'a ArtifactStore,
        log_path: impl Fn(usize) -> PathBuf + 'a,
    ) -> Self {
        Self {
            provider,
            inputs,
            store,
            log_path: Box::new(log_path),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run_with_report(&self, model_idx: usize) -> Result<ReplicaReport> {
        let log = ReplicaLog::create(&(self.log_path)(model_idx), model_idx)?;
        ReplicaWorker::load(self.provider, model_idx, log)?
            .with_progress(self.show_progress)
            .run(self.inputs, self.store)
    }
}

impl<M: ModelProvider> ReplicaRunner for InProcessRunner<'_, M> {
    fn run_replica(&self, model_idx: usize) -> Result<PathBuf> {
        self.run_with_report(model_idx).map(|report| report.artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridGeometry;
    use crate::mocks::MockModelProvider;
    use tempfile::TempDir;

    fn inputs(h: usize, w: usize, channels: usize) -> Result<ReplicaInputs> {
        let raster = Array3::from_shape_fn((h, w, channels), |(y, x, c)| {
            ((y * 31 + x * 7 + c) % 64) as f32 / 64.0
        });
        let grid = PatchGrid::new(h, w, GridGeometry::new(16, 3, channels)?)?;
        ReplicaInputs::new(raster, grid, 3)
    }

    #[test]
    fn test_identity_predictor_reproduces_raster() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path().join("predicted"))?;
        let inputs = inputs(45, 38, 2)?;
        let provider = MockModelProvider::new(vec![1.0], 2);

        let log = ReplicaLog::create(&temp_dir.path().join("logs/pred_1_0.txt"), 0)?;
        let report = ReplicaWorker::load(&provider, 0, log)?
            .with_progress(false)
            .run(&inputs, &store)?;

        assert_eq!(report.artifact, store.replica_path(0));
        assert_eq!(store.load_replica(0)?, inputs.raster);
        assert_eq!(provider.live_predictors(), 0);
        Ok(())
    }

    #[test]
    fn test_evaluation_is_logged() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        let set = LabeledPatches::new(
            Array4::from_elem((4, 16, 16, 2), 0.25),
            Array3::zeros((4, 16, 16)),
        )?;
        let inputs = inputs(20, 20, 2)?.with_evaluation(Some(set.clone()), Some(set));
        let provider = MockModelProvider::new(vec![1.0], 2);
        let log_path = temp_dir.path().join("pred_1_0.txt");

        let runner = InProcessRunner::new(&provider, &inputs, &store, |_| log_path.clone())
            .with_progress(false);
        let report = runner.run_with_report(0)?;

        assert_eq!(report.train.map(|r| r.patches), Some(3));
        let log = std::fs::read_to_string(&log_path)?;
        assert!(log.contains("Evaluate train"));
        assert!(log.contains("Evaluate val"));
        assert!(log.contains("Prediction time"));
        Ok(())
    }

    #[test]
    fn test_undersized_evaluation_set_still_persists_prediction() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        // three labelled patches cannot fill one batch of four
        let set = LabeledPatches::new(
            Array4::from_elem((3, 16, 16, 2), 0.25),
            Array3::zeros((3, 16, 16)),
        )?;
        let raster = Array3::from_elem((20, 20, 2), 0.5f32);
        let grid = PatchGrid::new(20, 20, GridGeometry::new(16, 3, 2)?)?;
        let inputs = ReplicaInputs::new(raster, grid, 4)?.with_evaluation(Some(set), None);
        let provider = MockModelProvider::new(vec![1.0], 2);
        let log_path = temp_dir.path().join("pred_1_0.txt");

        let report = InProcessRunner::new(&provider, &inputs, &store, |_| log_path.clone())
            .with_progress(false)
            .run_with_report(0)?;

        assert!(report.train.is_none());
        assert_eq!(store.load_replica(0)?, inputs.raster);
        let log = std::fs::read_to_string(&log_path)?;
        assert!(log.contains("Evaluate train skipped"));
        assert!(log.contains("Prediction time"));
        Ok(())
    }

    #[test]
    fn test_out_of_range_labels_do_not_fail_replica() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        let set = LabeledPatches::new(
            Array4::from_elem((4, 16, 16, 2), 0.25),
            Array3::from_elem((4, 16, 16), 7),
        )?;
        let inputs = inputs(20, 20, 2)?.with_evaluation(None, Some(set));
        let provider = MockModelProvider::new(vec![1.0], 2);

        let report = InProcessRunner::new(&provider, &inputs, &store, |_| {
            temp_dir.path().join("pred_1_0.txt")
        })
        .with_progress(false)
        .run_with_report(0)?;

        assert!(report.val.is_none());
        assert!(store.contains_replica(0));
        Ok(())
    }

    #[test]
    fn test_failed_run_releases_predictor_and_leaves_no_artifact() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        // three input channels but the mock only accepts two
        let raster = Array3::<f32>::zeros((20, 20, 3));
        let grid = PatchGrid::new(20, 20, GridGeometry::new(16, 3, 2)?)?;
        let inputs = ReplicaInputs::new(raster, grid, 4)?;
        let provider = MockModelProvider::new(vec![1.0], 2);

        let runner = InProcessRunner::new(&provider, &inputs, &store, |i| {
            temp_dir.path().join(format!("pred_{}.txt", i))
        })
        .with_progress(false);

        assert!(runner.run_replica(0).is_err());
        assert_eq!(provider.live_predictors(), 0);
        assert!(!store.contains_replica(0));
        Ok(())
    }
}
