//! Loading candidates and harnesses from an artifacts directory.
//!
//! Layout:
//!
//! ```text
//! <root>/candidates/<dir>/*.tf
//! <root>/candidates/<dir>/candidate.json   (optional metadata)
//! <root>/harnesses/<candidate-hash>/...    (test_app.py, requirements.txt, ...)
//! ```
//!
//! A candidate is only schedulable together with its harness; candidates
//! without one are skipped and logged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::candidate::{Candidate, TestHarness};
use crate::error::{EngineError, EngineResult};
use crate::pipeline::ValidationJob;

pub const CANDIDATES_DIR: &str = "candidates";
pub const HARNESSES_DIR: &str = "harnesses";
pub const METADATA_FILE: &str = "candidate.json";

#[derive(Debug, Default, Deserialize)]
struct CandidateMetadata {
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    source_ref: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Candidates and harnesses found under one artifacts root.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every candidate under `candidates/`, sorted by hash.
    pub fn candidates(&self) -> EngineResult<Vec<Candidate>> {
        let dir = self.root.join(CANDIDATES_DIR);
        if !dir.is_dir() {
            return Err(catalog_error(&dir, "candidates directory not found"));
        }
        let mut found = Vec::new();
        for entry in read_dir_sorted(&dir)? {
            if entry.is_dir() {
                if let Some(candidate) = load_candidate(&entry)? {
                    found.push(candidate);
                }
            }
        }
        found.sort_by(|a, b| a.hash().cmp(b.hash()));
        found.dedup_by(|a, b| a.hash() == b.hash());
        Ok(found)
    }

    /// The harness for `candidate_hash`, if one exists.
    pub fn harness(&self, candidate_hash: &str) -> EngineResult<Option<TestHarness>> {
        let dir = self.root.join(HARNESSES_DIR).join(candidate_hash);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut files = BTreeMap::new();
        collect_files(&dir, &dir, &mut files)?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(TestHarness::new(candidate_hash, files)))
    }

    /// Schedulable jobs: candidates paired with their harness.
    ///
    /// `filter` selects a single candidate by full hash or unique prefix.
    /// A prefix shared by several candidates is rejected.
    pub fn jobs(&self, filter: Option<&str>) -> EngineResult<Vec<ValidationJob>> {
        let mut candidates = self.candidates()?;
        if let Some(wanted) = filter {
            candidates.retain(|c| c.hash().starts_with(wanted));
            if candidates.len() > 1 {
                let hashes: Vec<&str> = candidates.iter().map(|c| c.hash()).collect();
                return Err(catalog_error(
                    &self.root,
                    format!("candidate prefix {wanted:?} is ambiguous: {}", hashes.join(", ")),
                ));
            }
        }

        let mut jobs = Vec::new();
        for candidate in candidates {
            match self.harness(candidate.hash())? {
                Some(harness) => jobs.push(ValidationJob::new(candidate, Some(harness))),
                None => info!(
                    candidate = %candidate.hash(),
                    source = %candidate.source_ref,
                    "skipping candidate without a test harness"
                ),
            }
        }
        if let Some(wanted) = filter {
            if jobs.is_empty() {
                return Err(catalog_error(
                    &self.root,
                    format!("no candidate with a harness matches {wanted}"),
                ));
            }
        }
        debug!(jobs = jobs.len(), root = %self.root.display(), "catalog loaded");
        Ok(jobs)
    }
}

fn load_candidate(dir: &Path) -> EngineResult<Option<Candidate>> {
    let mut files = BTreeMap::new();
    for path in read_dir_sorted(dir)? {
        if path.is_file() && path.extension().is_some_and(|e| e == "tf") {
            let name = file_name(&path);
            files.insert(name, read_text(&path)?);
        }
    }
    if files.is_empty() {
        warn!(dir = %dir.display(), "candidate directory has no definition files");
        return Ok(None);
    }

    let metadata_path = dir.join(METADATA_FILE);
    let metadata = if metadata_path.is_file() {
        serde_json::from_str::<CandidateMetadata>(&read_text(&metadata_path)?)
            .map_err(|e| catalog_error(&metadata_path, e.to_string()))?
    } else {
        CandidateMetadata::default()
    };

    let source_ref = metadata
        .source_ref
        .unwrap_or_else(|| format!("local:{}", file_name(dir)));
    let mut candidate = Candidate::new(files, metadata.capabilities, source_ref);
    if let Some(name) = metadata.name {
        candidate = candidate.with_name(name);
    }
    Ok(Some(candidate))
}

fn collect_files(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> EngineResult<()> {
    for path in read_dir_sorted(dir)? {
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| catalog_error(&path, e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            out.insert(relative, read_text(&path)?);
        }
    }
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .map_err(|e| catalog_error(dir, e.to_string()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| catalog_error(dir, e.to_string()))?;
    paths.sort();
    Ok(paths)
}

fn read_text(path: &Path) -> EngineResult<String> {
    fs::read_to_string(path).map_err(|e| catalog_error(path, e.to_string()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn catalog_error(path: &Path, detail: impl Into<String>) -> EngineError {
    EngineError::Catalog {
        path: path.display().to_string(),
        detail: detail.into(),
    }
}
