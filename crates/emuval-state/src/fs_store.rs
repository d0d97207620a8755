use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{validate_key, StoreError, StoreResult};
use crate::records::{RunId, RunRecord, ValidationOutcome};
use crate::storage_traits::{check_seal, RunStore};

const RUN_FILE: &str = "run.json";
const OUTCOMES_DIR: &str = "outcomes";

/// Filesystem-backed run store.
///
/// Layout:
/// ```text
/// <root>/runs/<run-id>/run.json
/// <root>/runs/<run-id>/outcomes/<candidate-hash>.json
/// ```
///
/// Every write goes to a temp file in the target directory and is renamed
/// into place, so readers never observe a half-written record.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    runs_dir: PathBuf,
}

impl FsRunStore {
    /// Create a store rooted at `root`. Creates `root/runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn run_dir(&self, run_id: &RunId) -> StoreResult<PathBuf> {
        validate_key(run_id.as_str())?;
        Ok(self.runs_dir.join(run_id.as_str()))
    }
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T, overwrite: bool) -> StoreResult<()> {
    let dir = path.parent().ok_or_else(|| StoreError::InvalidKey {
        key: path.display().to_string(),
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;

    if overwrite {
        tmp.persist(path).map_err(|e| e.error)?;
    } else {
        tmp.persist_noclobber(path).map_err(|e| e.error)?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<StoreResult<T>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes).map_err(StoreError::from))
}

fn read_run(run_dir: &Path, run_id: &RunId) -> StoreResult<RunRecord> {
    match read_json(&run_dir.join(RUN_FILE)) {
        Ok(parsed) => parsed,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::RunNotFound {
            run_id: run_id.to_string(),
        }),
        Err(e) => Err(StoreError::Io(e)),
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn create_run(&self, record: &RunRecord) -> StoreResult<()> {
        let run_dir = self.run_dir(&record.run_id)?;
        let record = record.clone();
        blocking(move || {
            let path = run_dir.join(RUN_FILE);
            match write_json_atomic(&path, &record, false) {
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(StoreError::RunExists {
                        run_id: record.run_id.to_string(),
                    })
                }
                other => other,
            }
        })
        .await
    }

    async fn record_outcome(&self, outcome: &ValidationOutcome) -> StoreResult<()> {
        validate_key(&outcome.candidate_hash)?;
        let run_dir = self.run_dir(&outcome.run_id)?;
        let outcome = outcome.clone();
        blocking(move || {
            let record = read_run(&run_dir, &outcome.run_id)?;
            if record.status.is_sealed() {
                return Err(StoreError::RunSealed {
                    run_id: outcome.run_id.to_string(),
                });
            }
            let path = run_dir
                .join(OUTCOMES_DIR)
                .join(format!("{}.json", outcome.candidate_hash));
            match write_json_atomic(&path, &outcome, false) {
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(StoreError::OutcomeExists {
                        run_id: outcome.run_id.to_string(),
                        candidate_hash: outcome.candidate_hash.clone(),
                    })
                }
                other => other,
            }
        })
        .await
    }

    async fn seal_run(&self, record: &RunRecord) -> StoreResult<()> {
        let run_dir = self.run_dir(&record.run_id)?;
        let record = record.clone();
        blocking(move || {
            let existing = read_run(&run_dir, &record.run_id)?;
            check_seal(&existing, &record)?;
            write_json_atomic(&run_dir.join(RUN_FILE), &record, true)
        })
        .await
    }

    async fn get_run(&self, run_id: &RunId) -> StoreResult<RunRecord> {
        let run_dir = self.run_dir(run_id)?;
        let run_id = run_id.clone();
        blocking(move || read_run(&run_dir, &run_id)).await
    }

    async fn list_outcomes(&self, run_id: &RunId) -> StoreResult<Vec<ValidationOutcome>> {
        let run_dir = self.run_dir(run_id)?;
        let run_id = run_id.clone();
        blocking(move || {
            read_run(&run_dir, &run_id)?;
            let dir = run_dir.join(OUTCOMES_DIR);
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut outcomes = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let outcome: ValidationOutcome = read_json(&path)??;
                outcomes.push(outcome);
            }
            outcomes.sort_by(|a, b| a.candidate_hash.cmp(&b.candidate_hash));
            Ok(outcomes)
        })
        .await
    }

    async fn list_runs(&self) -> StoreResult<Vec<RunRecord>> {
        let runs_dir = self.runs_dir.clone();
        blocking(move || {
            let mut runs = Vec::new();
            for entry in fs::read_dir(&runs_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let path = entry.path().join(RUN_FILE);
                match read_json::<RunRecord>(&path) {
                    Ok(Ok(record)) => runs.push(record),
                    Ok(Err(e)) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %entry.path().display(), "run directory without run.json")
                    }
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
            runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
            Ok(runs)
        })
        .await
    }
}
