use std::path::PathBuf;

use ndarray::prelude::*;
use ndarray::Zip;

use crate::artifact::ArtifactStore;
use crate::errors::{EnsembleError, Result};
use crate::progress_tracker::ProgressTracker;

/// Averages the persisted replica rasters of an experiment.
pub struct EnsembleAggregator<'a> {
    store: &'a ArtifactStore,
    show_progress: bool,
}

impl<'a> EnsembleAggregator<'a> {
    pub const fn new(store: &'a ArtifactStore) -> Self {
        Self {
            store,
            show_progress: true,
        }
    }

    pub const fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Mean of replicas `0..number_models`.
    ///
    /// Every artifact is checked for presence before any is read; an absent
    /// one fails the whole aggregation instead of shrinking the ensemble.
    pub fn aggregate(&self, number_models: usize) -> Result<Array3<f32>> {
        if number_models == 0 {
            return Err(EnsembleError::configuration(
                "number_models must be at least 1",
            ));
        }

        let missing: Vec<usize> = (0..number_models)
            .filter(|&idx| !self.store.contains_replica(idx))
            .collect();
        if !missing.is_empty() {
            return Err(EnsembleError::MissingArtifact {
                missing,
                directory: self.store.dir().to_path_buf(),
            });
        }

        let tracker = ProgressTracker::new(
            number_models,
            "Opening prediction files",
            self.show_progress,
        );
        let mut mean = MeanAccumulator::default();
        for model_idx in 0..number_models {
            let raster = self.store.load_replica(model_idx)?;
            mean.add(raster.view())
                .map_err(|e| annotate_replica(e, model_idx))?;
            tracker.inc();
        }
        tracker.finish();

        mean.finish()
    }

    /// Aggregates and persists the result as the experiment's ensemble file.
    pub fn run(&self, number_models: usize) -> Result<(PathBuf, Array3<f32>)> {
        let mean = self.aggregate(number_models)?;
        let path = self.store.save_ensemble(mean.view())?;
        log::info!(
            "ensemble of {} replicas {:?} written to {}",
            number_models,
            mean.dim(),
            path.display()
        );
        Ok((path, mean))
    }
}

fn annotate_replica(err: EnsembleError, model_idx: usize) -> EnsembleError {
    match err {
        EnsembleError::ShapeMismatch {
            context,
            expected,
            actual,
        } => EnsembleError::ShapeMismatch {
            context: format!("{} (replica {})", context, model_idx),
            expected,
            actual,
        },
        other => other,
    }
}

/// Element-wise running mean over rasters of identical shape.
///
/// Sums are kept in `f64`, so the mean of half-precision inputs does not
/// depend on the order the rasters are added in.
#[derive(Default)]
pub struct MeanAccumulator {
    sum: Option<Array3<f64>>,
    count: usize,
}

impl MeanAccumulator {
    pub fn add(&mut self, raster: ArrayView3<f32>) -> Result<()> {
        match &mut self.sum {
            None => self.sum = Some(raster.mapv(f64::from)),
            Some(sum) => {
                if sum.dim() != raster.dim() {
                    return Err(EnsembleError::shape_mismatch(
                        "replica raster",
                        sum.dim(),
                        raster.dim(),
                    ));
                }
                Zip::from(sum)
                    .and(&raster)
                    .par_for_each(|acc, &v| *acc += f64::from(v));
            }
        }
        self.count += 1;
        Ok(())
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub fn finish(self) -> Result<Array3<f32>> {
        let n = self.count as f64;
        self.sum
            .map(|sum| sum.mapv(|v| (v / n) as f32))
            .ok_or_else(|| EnsembleError::configuration("no rasters to average"))
    }
}

/// Mean of in-memory rasters; same semantics as [`EnsembleAggregator::aggregate`].
pub fn ensemble_mean<'a, I>(rasters: I) -> Result<Array3<f32>>
where
    I: IntoIterator<Item = ArrayView3<'a, f32>>,
{
    let mut mean = MeanAccumulator::default();
    for raster in rasters {
        mean.add(raster)?;
    }
    mean.finish()
}
