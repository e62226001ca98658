use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use half::f16;
use ndarray::prelude::*;
use ndarray_npy::{
    read_npy, write_npy, ReadDataError, ReadableElement, WritableElement, WriteDataError,
    WriteNpyExt,
};
use py_literal::Value as PyValue;

use crate::errors::{EnsembleError, Result};

/// Persisted prediction rasters of one experiment.
///
/// ```text
/// predicted/pred_{idx}.npy   replica raster, <f2
/// predicted/pred_m.npy       ensemble mean, <f4
/// ```
///
/// Files are written once through a temporary sibling and renamed into
/// place, so a run that dies mid-write leaves no artifact behind.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).map_err(|e| EnsembleError::FileSystem {
            path: store.dir.clone(),
            operation: "create artifact directory".to_string(),
            source: e,
        })?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn replica_path(&self, model_idx: usize) -> PathBuf {
        self.dir.join(format!("pred_{}.npy", model_idx))
    }

    pub fn ensemble_path(&self) -> PathBuf {
        self.dir.join("pred_m.npy")
    }

    pub fn contains_replica(&self, model_idx: usize) -> bool {
        self.replica_path(model_idx).is_file()
    }

    /// Stores a reconstructed raster at half precision.
    pub fn save_replica(&self, model_idx: usize, raster: ArrayView3<f32>) -> Result<PathBuf> {
        let path = self.replica_path(model_idx);
        if path.exists() {
            log::warn!("overwriting existing artifact {}", path.display());
        }
        let half = raster.mapv(|v| Half(f16::from_f32(v)));
        write_atomically(&path, &half)?;
        Ok(path)
    }

    /// Loads a replica raster and widens it back to `f32`.
    pub fn load_replica(&self, model_idx: usize) -> Result<Array3<f32>> {
        let path = self.replica_path(model_idx);
        if !path.is_file() {
            return Err(EnsembleError::MissingArtifact {
                missing: vec![model_idx],
                directory: self.dir.clone(),
            });
        }
        let half: Array3<Half> = read_npy(&path).map_err(|e| EnsembleError::Artifact {
            path: path.clone(),
            operation: "read replica raster".to_string(),
            source: Box::new(e),
        })?;
        Ok(half.mapv(|h| h.0.to_f32()))
    }

    /// Deletes a replica artifact if present.
    ///
    /// Called before a replica runs so that a file from an earlier run of
    /// the same experiment can never stand in for a replica that failed.
    pub fn remove_replica(&self, model_idx: usize) -> Result<()> {
        remove_if_present(&self.replica_path(model_idx))
    }

    pub fn remove_ensemble(&self) -> Result<()> {
        remove_if_present(&self.ensemble_path())
    }

    pub fn save_ensemble(&self, raster: ArrayView3<f32>) -> Result<PathBuf> {
        let path = self.ensemble_path();
        write_atomically(&path, &raster)?;
        Ok(path)
    }

    pub fn load_ensemble(&self) -> Result<Array3<f32>> {
        let path = self.ensemble_path();
        read_npy(&path).map_err(|e| EnsembleError::Artifact {
            path,
            operation: "read ensemble raster".to_string(),
            source: Box::new(e),
        })
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::debug!("removed stale artifact {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EnsembleError::FileSystem {
            path: path.to_path_buf(),
            operation: "remove stale artifact".to_string(),
            source: e,
        }),
    }
}

/// IEEE-754 binary16 element stored in `.npy` files as NumPy `float16`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(transparent)]
struct Half(f16);

impl WritableElement for Half {
    fn type_descriptor() -> PyValue {
        PyValue::String("<f2".to_string())
    }

    fn write<W: Write>(&self, mut writer: W) -> std::result::Result<(), WriteDataError> {
        writer.write_all(&self.0.to_le_bytes())?;
        Ok(())
    }

    fn write_slice<W: Write>(
        slice: &[Self],
        mut writer: W,
    ) -> std::result::Result<(), WriteDataError> {
        let bytes: Vec<u8> = slice.iter().flat_map(|h| h.0.to_le_bytes()).collect();
        writer.write_all(&bytes)?;
        Ok(())
    }
}

impl ReadableElement for Half {
    fn read_to_end_exact_vec<R: Read>(
        mut reader: R,
        type_desc: &PyValue,
        len: usize,
    ) -> std::result::Result<Vec<Self>, ReadDataError> {
        let decode: fn([u8; 2]) -> f16 = match type_desc {
            PyValue::String(s) if s == "<f2" => f16::from_le_bytes,
            PyValue::String(s) if s == ">f2" => f16::from_be_bytes,
            other => return Err(ReadDataError::WrongDescriptor(other.clone())),
        };
        let mut bytes = Vec::with_capacity(len * 2);
        reader.read_to_end(&mut bytes)?;
        if bytes.len() < len * 2 {
            return Err(ReadDataError::MissingData);
        }
        if bytes.len() > len * 2 {
            return Err(ReadDataError::ExtraBytes(bytes.len() - len * 2));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| Half(decode([pair[0], pair[1]])))
            .collect())
    }
}

fn write_atomically<T: WriteNpyExt>(path: &Path, array: &T) -> Result<()> {
    let partial = path.with_extension("npy.partial");
    write_npy(&partial, array).map_err(|e| EnsembleError::Artifact {
        path: partial.clone(),
        operation: "write npy".to_string(),
        source: Box::new(e),
    })?;
    fs::rename(&partial, path).map_err(|e| EnsembleError::FileSystem {
        path: path.to_path_buf(),
        operation: "move artifact into place".to_string(),
        source: e,
    })
}

/// Reads an input raster as `(H, W, C)` `f32`.
///
/// `.npy` files are taken as-is (must be a 3D `<f4` array); any other
/// extension goes through the `image` crate and yields RGB scaled to [0, 1].
pub fn read_raster(path: &Path) -> Result<Array3<f32>> {
    let is_npy = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("npy"));

    if is_npy {
        return read_npy(path).map_err(|e| EnsembleError::Artifact {
            path: path.to_path_buf(),
            operation: "read input raster".to_string(),
            source: Box::new(e),
        });
    }

    let image = image::open(path)
        .map_err(|e| EnsembleError::Artifact {
            path: path.to_path_buf(),
            operation: "decode input image".to_string(),
            source: Box::new(e),
        })?
        .into_rgb32f();
    let (width, height) = image.dimensions();
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        image.into_raw(),
    )?)
}
