//! The `outputfile` call block.
//!
//! ```jinja
//! {% call outputfile("reports/" ~ name ~ ".txt", charset="ISO-8859-1") %}
//! body written to the side file
//! {% endcall %}
//! ```
//!
//! The rendered body goes to the named file, resolved against the base
//! directory; nothing is emitted into the primary output.

use std::fs;
use std::path::{Path, PathBuf};

use encoding_rs::UTF_8;
use minijinja::value::{Kwargs, Value};
use minijinja::{Error, ErrorKind, State};

use crate::core::output::{encode_output, output_charset};
use crate::util::fs::{ensure_parent_dir, resolve_against};
use crate::util::log::Logger;

/// Writes call-block bodies to side files.
#[derive(Debug, Clone)]
pub struct OutputFileFunction {
    base_dir: PathBuf,
    logger: Logger,
}

impl OutputFileFunction {
    pub fn new(base_dir: impl Into<PathBuf>, logger: Logger) -> Self {
        OutputFileFunction {
            base_dir: base_dir.into(),
            logger,
        }
    }

    pub fn call(&self, state: &State, path: String, kwargs: Kwargs) -> Result<String, Error> {
        let caller: Value = kwargs.get("caller")?;
        let charset: Option<String> = kwargs.get("charset")?;
        kwargs.assert_all_used()?;

        let encoding = match charset {
            Some(label) => output_charset(&label).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("unknown or unsupported charset `{}`", label),
                )
            })?,
            None => UTF_8,
        };

        let body = caller.call(state, &[])?.to_string();
        let target = resolve_against(&self.base_dir, Path::new(&path));
        self.logger
            .debug(format!("writing output file {}", target.display()));

        let bytes = encode_output(encoding, &body);
        ensure_parent_dir(&target)
            .and_then(|()| fs::write(&target, &bytes))
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("failed to write output file {}", target.display()),
                )
                .with_source(e)
            })?;
        Ok(String::new())
    }
}
