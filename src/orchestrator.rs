use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

use crate::artifact::ArtifactStore;
use crate::ensemble::EnsembleAggregator;
use crate::errors::{EnsembleError, Result};
use crate::traits::ReplicaRunner;

/// Outcome of a full ensemble run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completed: Vec<usize>,
    pub failed: Vec<(usize, String)>,
    pub ensemble_path: PathBuf,
    pub ensemble_shape: (usize, usize, usize),
}

/// Runs replicas `0..number_models` strictly one after another, then
/// averages their artifacts.
///
/// Every replica's artifact is deleted before that replica runs. A replica
/// that fails is logged and skipped, so its artifact stays missing and the
/// aggregation step afterwards fails with `MissingArtifact` instead of
/// averaging a smaller ensemble or a file left by an earlier run.
pub struct Orchestrator<'a, R: ReplicaRunner> {
    runner: R,
    store: &'a ArtifactStore,
    number_models: usize,
    show_progress: bool,
}

impl<'a, R: ReplicaRunner> Orchestrator<'a, R> {
    pub fn new(runner: R, store: &'a ArtifactStore, number_models: usize) -> Self {
        Self {
            runner,
            store,
            number_models,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run(&self) -> Result<RunSummary> {
        if self.number_models == 0 {
            return Err(EnsembleError::configuration(
                "number_models must be at least 1",
            ));
        }

        self.store.remove_ensemble()?;
        let mut completed = Vec::with_capacity(self.number_models);
        let mut failed = Vec::new();
        for model_idx in 0..self.number_models {
            log::info!("replica {}/{}: starting", model_idx + 1, self.number_models);
            self.store.remove_replica(model_idx)?;
            match self.runner.run_replica(model_idx) {
                Ok(artifact) => {
                    log::info!(
                        "replica {}/{}: wrote {}",
                        model_idx + 1,
                        self.number_models,
                        artifact.display()
                    );
                    completed.push(model_idx);
                }
                Err(e) => {
                    log::error!("replica {} failed: {}", model_idx, e);
                    failed.push((model_idx, e.to_string()));
                }
            }
        }

        let (ensemble_path, mean) = EnsembleAggregator::new(self.store)
            .with_progress(self.show_progress)
            .run(self.number_models)?;

        Ok(RunSummary {
            completed,
            failed,
            ensemble_path,
            ensemble_shape: mean.dim(),
        })
    }
}

/// Runs each replica in a child process and blocks until it exits.
///
/// The child is `program args… --model-idx <i>`; for the CLI that is this
/// binary's own `replica` subcommand, so every replica gets a fresh runtime
/// and all of its device memory is returned to the OS on exit.
pub struct SubprocessRunner {
    program: PathBuf,
    args: Vec<OsString>,
    store: ArtifactStore,
}

impl SubprocessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, store: ArtifactStore) -> Self {
        Self {
            program: program.into(),
            args,
            store,
        }
    }

    pub fn current_exe(args: Vec<OsString>, store: ArtifactStore) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| EnsembleError::FileSystem {
            path: PathBuf::from("<current executable>"),
            operation: "resolve current executable".to_string(),
            source: e,
        })?;
        Ok(Self::new(program, args, store))
    }
}

impl ReplicaRunner for SubprocessRunner {
    fn run_replica(&self, model_idx: usize) -> Result<PathBuf> {
        // only a file written by this child counts as its artifact
        self.store.remove_replica(model_idx)?;
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--model-idx")
            .arg(model_idx.to_string())
            .status()
            .map_err(|e| EnsembleError::FileSystem {
                path: self.program.clone(),
                operation: "spawn replica process".to_string(),
                source: e,
            })?;

        if !status.success() {
            return Err(EnsembleError::ReplicaRun {
                model_idx,
                reason: format!("process exited with {}", status),
            });
        }
        let artifact = self.store.replica_path(model_idx);
        if !artifact.is_file() {
            return Err(EnsembleError::ReplicaRun {
                model_idx,
                reason: "process exited cleanly without writing its artifact".to_string(),
            });
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Writes a constant raster per replica and records call order.
    struct FakeRunner<'a> {
        store: &'a ArtifactStore,
        fail: Option<usize>,
        calls: Mutex<Vec<usize>>,
    }

    impl ReplicaRunner for FakeRunner<'_> {
        fn run_replica(&self, model_idx: usize) -> Result<PathBuf> {
            self.calls.lock().push(model_idx);
            if self.fail == Some(model_idx) {
                return Err(EnsembleError::ReplicaRun {
                    model_idx,
                    reason: "crashed".to_string(),
                });
            }
            let raster = Array3::from_elem((3, 3, 2), model_idx as f32);
            self.store.save_replica(model_idx, raster.view())
        }
    }

    #[test]
    fn test_sequential_run_then_aggregate() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        let runner = FakeRunner {
            store: &store,
            fail: None,
            calls: Mutex::new(Vec::new()),
        };

        let summary = Orchestrator::new(&runner, &store, 3)
            .with_progress(false)
            .run()?;

        assert_eq!(*runner.calls.lock(), vec![0, 1, 2]);
        assert_eq!(summary.completed, vec![0, 1, 2]);
        assert_eq!(summary.ensemble_shape, (3, 3, 2));
        assert_eq!(store.load_ensemble()?[[0, 0, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn test_crashed_replica_blocks_aggregation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        let runner = FakeRunner {
            store: &store,
            fail: Some(1),
            calls: Mutex::new(Vec::new()),
        };

        let result = Orchestrator::new(&runner, &store, 3).with_progress(false).run();

        // later replicas still ran
        assert_eq!(*runner.calls.lock(), vec![0, 1, 2]);
        assert!(matches!(
            result,
            Err(EnsembleError::MissingArtifact { ref missing, .. }) if missing == &vec![1]
        ));
        Ok(())
    }

    #[test]
    fn test_stale_artifact_does_not_replace_crashed_replica() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        let stale = Array3::from_elem((3, 3, 2), 9.0f32);
        store.save_replica(1, stale.view())?;
        store.save_ensemble(stale.view())?;
        let runner = FakeRunner {
            store: &store,
            fail: Some(1),
            calls: Mutex::new(Vec::new()),
        };

        let result = Orchestrator::new(&runner, &store, 3).with_progress(false).run();

        assert!(matches!(
            result,
            Err(EnsembleError::MissingArtifact { ref missing, .. }) if missing == &vec![1]
        ));
        assert!(!store.contains_replica(1));
        assert!(!store.ensemble_path().exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_subprocess_ignores_artifact_it_did_not_write() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;
        store.save_replica(0, Array3::<f32>::zeros((2, 2, 1)).view())?;

        let silent = SubprocessRunner::new("sh", vec!["-c".into(), "exit 0".into()], store.clone());
        assert!(matches!(
            silent.run_replica(0),
            Err(EnsembleError::ReplicaRun { model_idx: 0, .. })
        ));
        assert!(!store.contains_replica(0));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_subprocess_exit_status_is_checked() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ArtifactStore::create(temp_dir.path())?;

        let failing = SubprocessRunner::new("sh", vec!["-c".into(), "exit 3".into()], store.clone());
        assert!(matches!(
            failing.run_replica(0),
            Err(EnsembleError::ReplicaRun { model_idx: 0, .. })
        ));

        let silent = SubprocessRunner::new("sh", vec!["-c".into(), "exit 0".into()], store.clone());
        assert!(silent.run_replica(0).is_err());

        let script = format!("touch {}", store.replica_path(2).display());
        let writer = SubprocessRunner::new("sh", vec!["-c".into(), script.into()], store.clone());
        assert_eq!(writer.run_replica(2)?, store.replica_path(2));
        Ok(())
    }
}
