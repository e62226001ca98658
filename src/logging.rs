use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use env_logger::Env;

use crate::errors::{EnsembleError, Result};

/// Installs the global logger. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Per-replica diagnostic log (`logs/pred_{experiment}_{idx}.txt`).
///
/// Every line is also forwarded to the `log` facade so the console shows
/// the same diagnostics.
pub struct ReplicaLog {
    model_idx: usize,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ReplicaLog {
    pub fn create(path: &Path, model_idx: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EnsembleError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create log directory".to_string(),
                source: e,
            })?;
        }
        let file = File::create(path).map_err(|e| EnsembleError::FileSystem {
            path: path.to_path_buf(),
            operation: "create replica log".to_string(),
            source: e,
        })?;
        Ok(Self {
            model_idx,
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, line: impl Display) -> Result<()> {
        log::info!("[replica {}] {}", self.model_idx, line);
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| EnsembleError::FileSystem {
                path: self.path.clone(),
                operation: "write replica log".to_string(),
                source: e,
            })
    }
}
