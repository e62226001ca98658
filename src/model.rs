use std::path::{Path, PathBuf};

use crate::{
    errors::{EnsembleError, Result},
    grid::GridGeometry,
    traits::{ModelProvider, ReplicaPredictor},
};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

/// ONNX Runtime session for one trained replica.
///
/// Expects an NHWC float input `(B, P, P, C_in)` and produces per-pixel class
/// probabilities `(B, P, P, n_classes)`. Tensor names are read from the model.
pub struct OnnxPredictor {
    model_path: PathBuf,
    input_name: String,
    output_name: String,
    n_classes: usize,
    session: Mutex<Session>,
}

impl OnnxPredictor {
    pub fn new(
        model_path: &Path,
        device_id: i32,
        geometry: &GridGeometry,
        in_channels: usize,
    ) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| EnsembleError::Model {
                operation: "session builder initialisation".to_string(),
                source: Box::new(e),
            })?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| EnsembleError::Model {
                operation: "execution provider registration".to_string(),
                source: Box::new(e),
            })?
            .with_memory_pattern(true)
            .map_err(|e| EnsembleError::Model {
                operation: "memory pattern configuration".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| EnsembleError::Model {
                operation: format!("loading weights from {}", model_path.display()),
                source: Box::new(e),
            })?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| EnsembleError::configuration("model declares no inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| EnsembleError::configuration("model declares no outputs"))?;

        // initialize model
        let p = geometry.patch_size();
        let data = Array4::<f32>::zeros((1, p, p, in_channels));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)?])
            .map_err(|e| EnsembleError::Model {
                operation: "warm-up run".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            model_path: model_path.to_path_buf(),
            input_name,
            output_name,
            n_classes: geometry.n_classes(),
            session: Mutex::new(session),
        })
    }
}

impl ReplicaPredictor for OnnxPredictor {
    fn predict_on_batch(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&batch.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn describe(&self) -> String {
        format!(
            "onnx model {} ({} -> {}, {} classes)",
            self.model_path.display(),
            self.input_name,
            self.output_name,
            self.n_classes
        )
    }
}

/// Resolves replica `i` to `{models_dir}/model_{i}.onnx`.
pub struct OnnxModelProvider {
    models_dir: PathBuf,
    device_id: i32,
    geometry: GridGeometry,
    in_channels: usize,
}

impl OnnxModelProvider {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        device_id: i32,
        geometry: GridGeometry,
        in_channels: usize,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            device_id,
            geometry,
            in_channels,
        }
    }

    pub fn model_path(&self, model_idx: usize) -> PathBuf {
        self.models_dir.join(format!("model_{}.onnx", model_idx))
    }
}

impl ModelProvider for OnnxModelProvider {
    type Predictor = OnnxPredictor;

    fn load(&self, model_idx: usize) -> Result<OnnxPredictor> {
        let path = self.model_path(model_idx);
        if !path.is_file() {
            return Err(EnsembleError::FileSystem {
                path,
                operation: "model weights lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "replica weights not found",
                ),
            });
        }
        OnnxPredictor::new(&path, self.device_id, &self.geometry, self.in_channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_layout() -> Result<()> {
        let provider = OnnxModelProvider::new("exp_1/models", 0, GridGeometry::new(128, 8, 3)?, 4);
        assert_eq!(
            provider.model_path(3),
            Path::new("exp_1/models/model_3.onnx")
        );
        Ok(())
    }

    #[test]
    fn test_missing_weights_is_reported() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let provider = OnnxModelProvider::new(temp_dir.path(), 0, GridGeometry::new(128, 8, 3)?, 4);

        match provider.load(0) {
            Err(EnsembleError::FileSystem { path, .. }) => {
                assert_eq!(path, temp_dir.path().join("model_0.onnx"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected missing weights"),
        }
        Ok(())
    }
}
