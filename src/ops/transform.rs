//! The transformation task.
//!
//! Runs an ordered list of transformation sets against one backend loader
//! and sums their error counts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use miette::Diagnostic;
use thiserror::Error;

use crate::backend::trait_def::BackendKind;
use crate::core::output::OutputRegistry;
use crate::core::transformation_set::TransformationSet;
use crate::loader::IsolatedBackendLoader;
use crate::util::log::Logger;

/// A strict run that produced errors.
#[derive(Debug, Error, Diagnostic)]
pub enum TransformError {
    #[error("There were {count} transformation errors")]
    #[diagnostic(
        code(munge::transform::failed),
        help("The failing files are logged above; unset `fail_on_error` to continue past errors")
    )]
    Failed { count: usize },
}

/// Outcome of a run that did not fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub sets: usize,
    pub errors: usize,
}

impl TransformReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// An ordered list of transformation sets sharing one loader.
pub struct TransformTask {
    base_dir: PathBuf,
    loader: Arc<IsolatedBackendLoader>,
    sets: Vec<TransformationSet>,
    fail_on_error: bool,
    logger: Logger,
}

impl fmt::Debug for TransformTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformTask")
            .field("base_dir", &self.base_dir)
            .field("sets", &self.sets)
            .field("fail_on_error", &self.fail_on_error)
            .finish_non_exhaustive()
    }
}

impl TransformTask {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        loader: Arc<IsolatedBackendLoader>,
        logger: Logger,
    ) -> Self {
        TransformTask {
            base_dir: base_dir.into(),
            loader,
            sets: Vec::new(),
            fail_on_error: false,
            logger,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn loader(&self) -> &Arc<IsolatedBackendLoader> {
        &self.loader
    }

    pub fn sets(&self) -> &[TransformationSet] {
        &self.sets
    }

    /// Create a set of `kind`, let `configure` fill it in and append it.
    pub fn add_set<F>(&mut self, kind: BackendKind, configure: F) -> &mut TransformationSet
    where
        F: FnOnce(&mut TransformationSet),
    {
        let index = self.sets.len() + 1;
        let logger = self.logger.child(&format!("{} set #{}", kind, index));
        let mut set = TransformationSet::new(kind, &self.base_dir, logger);
        configure(&mut set);
        self.sets.push(set);
        let last = self.sets.len() - 1;
        &mut self.sets[last]
    }

    pub fn xslt<F>(&mut self, configure: F) -> &mut TransformationSet
    where
        F: FnOnce(&mut TransformationSet),
    {
        self.add_set(BackendKind::Xslt, configure)
    }

    pub fn template<F>(&mut self, configure: F) -> &mut TransformationSet
    where
        F: FnOnce(&mut TransformationSet),
    {
        self.add_set(BackendKind::Template, configure)
    }

    pub fn set_fail_on_error(&mut self, fail_on_error: bool) -> &mut Self {
        self.fail_on_error = fail_on_error;
        self
    }

    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    /// Run every set in declaration order.
    ///
    /// Errors are only fatal when `fail_on_error` is set; otherwise the
    /// report carries the count.
    pub fn transform(&self) -> Result<TransformReport, TransformError> {
        let mut errors = 0;
        for set in &self.sets {
            errors += set.transform(&self.loader);
        }

        let report = TransformReport {
            sets: self.sets.len(),
            errors,
        };
        if errors == 0 {
            self.logger
                .info(format!("Ran {} transformation sets", report.sets));
            return Ok(report);
        }
        if self.fail_on_error {
            return Err(TransformError::Failed { count: errors });
        }
        self.logger.warn(format!(
            "There were {} transformation errors, continuing",
            errors
        ));
        Ok(report)
    }

    /// Forward every set's output locations to the host.
    pub fn declare_outputs(&self, registry: &mut dyn OutputRegistry) -> Result<()> {
        for set in &self.sets {
            set.declare_outputs(registry)?;
        }
        Ok(())
    }

    /// Every mapped output of every set, in declaration order.
    pub fn mapped_output_files(&self) -> Result<Vec<PathBuf>> {
        let mut outputs = Vec::new();
        for set in &self.sets {
            outputs.extend(set.mapped_output_files()?);
        }
        Ok(outputs)
    }
}
