use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for tiled ensemble inference.
///
/// The three geometry/artifact failures (`Configuration`, `ShapeMismatch`,
/// `MissingArtifact`) are the ones the pipeline itself raises; the remaining
/// variants wrap failures of the collaborators (filesystem, npy codec,
/// inference runtime) with the operation that was being attempted.
#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Missing replica artifacts {missing:?} in {directory:?}")]
    MissingArtifact {
        missing: Vec<usize>,
        directory: PathBuf,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact error: {operation} failed for {path:?}")]
    Artifact {
        path: PathBuf,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Replica {model_idx} failed: {reason}")]
    ReplicaRun { model_idx: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, EnsembleError>;

impl EnsembleError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Only the CLI layer produces anyhow errors, and those are argument or
/// environment problems discovered before any processing starts.
impl From<anyhow::Error> for EnsembleError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Fallback for call sites without path context; code that knows the path
/// constructs `EnsembleError::FileSystem` directly.
impl From<std::io::Error> for EnsembleError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for EnsembleError {
    fn from(err: image::ImageError) -> Self {
        Self::Artifact {
            path: PathBuf::from("unknown"),
            operation: "image decoding".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for EnsembleError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of reshaping runtime output tensors, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for EnsembleError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
