//! Up-to-date checks between runs.
//!
//! The tracker collects the outputs a task declares and a fingerprint over
//! the manifest, every input file and every file the backends pulled in
//! during the last run (includes, imports, library resources). A run can be
//! skipped when the stored fingerprint matches and every declared output
//! still exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::output::OutputRegistry;
use crate::ops::transform::TransformTask;
use crate::util::fs::write_bytes;
use crate::util::hash::Fingerprint;

/// File name of the stored record inside the state directory.
pub const FINGERPRINT_FILE: &str = "fingerprint.json";

/// What a successful run left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub fingerprint: String,
    pub output_files: Vec<PathBuf>,
    pub output_dirs: Vec<PathBuf>,
    /// Files read through the loader, hashed into the fingerprint.
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
}

/// Host-side registry of declared outputs with a persisted fingerprint.
#[derive(Debug)]
pub struct StalenessTracker {
    state_dir: PathBuf,
    output_files: Vec<PathBuf>,
    output_dirs: Vec<PathBuf>,
}

impl OutputRegistry for StalenessTracker {
    fn output_file(&mut self, path: &Path) {
        if !self.output_files.iter().any(|p| p == path) {
            self.output_files.push(path.to_path_buf());
        }
    }

    fn output_dir(&mut self, path: &Path) {
        if !self.output_dirs.iter().any(|p| p == path) {
            self.output_dirs.push(path.to_path_buf());
        }
    }
}

impl StalenessTracker {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        StalenessTracker {
            state_dir: state_dir.into(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
        }
    }

    /// Collect the outputs `task` declares.
    pub fn for_task(state_dir: impl Into<PathBuf>, task: &TransformTask) -> Result<Self> {
        let mut tracker = StalenessTracker::new(state_dir);
        task.declare_outputs(&mut tracker)?;
        Ok(tracker)
    }

    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    pub fn output_dirs(&self) -> &[PathBuf] {
        &self.output_dirs
    }

    pub fn record_path(&self) -> PathBuf {
        self.state_dir.join(FINGERPRINT_FILE)
    }

    /// Digest of the manifest, every set's inputs, `dependencies` and the
    /// declared outputs.
    pub fn fingerprint(
        &self,
        manifest_path: &Path,
        task: &TransformTask,
        dependencies: &[PathBuf],
    ) -> Result<String> {
        let mut fp = Fingerprint::new();
        fp.update_file(manifest_path)?;

        for set in task.sets() {
            fp.update_str(set.kind().as_str());
            for file in set.source_files()? {
                fp.update_file(file)?;
            }
            fp.update_str("--");
            for file in set.template_files()? {
                fp.update_file(file)?;
            }
            if let Some(config) = set.config_file() {
                fp.update_file(config)?;
            }
        }

        fp.update_str("deps");
        for file in dependencies {
            fp.update_str(&file.to_string_lossy());
            fp.update_file(file)?;
        }

        for file in &self.output_files {
            fp.update_str(&file.to_string_lossy());
        }
        for dir in &self.output_dirs {
            fp.update_str(&dir.to_string_lossy());
        }
        Ok(fp.finish())
    }

    /// The stored record, if any.
    pub fn load(&self) -> Result<Option<RunRecord>> {
        let path = self.record_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        // A record we cannot read just means the next run is not skipped.
        Ok(serde_json::from_str(&contents).ok())
    }

    /// True when the stored fingerprint still matches and all outputs exist.
    ///
    /// The dependencies of the stored run are re-hashed, so editing an
    /// included file makes the task stale.
    pub fn is_up_to_date(&self, manifest_path: &Path, task: &TransformTask) -> Result<bool> {
        let Some(record) = self.load()? else {
            return Ok(false);
        };
        let fingerprint = self.fingerprint(manifest_path, task, &record.dependencies)?;
        Ok(record.fingerprint == fingerprint
            && self.output_files.iter().all(|p| p.is_file())
            && self.output_dirs.iter().all(|p| p.is_dir()))
    }

    /// Record a finished run of `task`, with the files its loader served.
    pub fn record(&self, manifest_path: &Path, task: &TransformTask) -> Result<()> {
        let dependencies = task.loader().dependencies();
        let record = RunRecord {
            fingerprint: self.fingerprint(manifest_path, task, &dependencies)?,
            output_files: self.output_files.clone(),
            output_dirs: self.output_dirs.clone(),
            dependencies,
        };
        self.store(&record)
    }

    fn store(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        write_bytes(&self.record_path(), json.as_bytes())
    }

    /// Remove the stored record. Returns whether one existed.
    pub fn clear(&self) -> Result<bool> {
        let path = self.record_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
