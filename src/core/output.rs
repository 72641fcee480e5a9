//! Output file specifications.

use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};

use crate::util::fs::ensure_parent_dir;

/// How an output file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file, truncating any existing content.
    Truncate,
    /// Create the file if missing and append to it.
    Append,
}

/// A resolved output destination for one transformation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFileSpec {
    path: PathBuf,
    mode: OpenMode,
}

impl OutputFileSpec {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        OutputFileSpec {
            path: path.into(),
            mode,
        }
    }

    /// An output spec that replaces the file's content.
    pub fn truncate(path: impl Into<PathBuf>) -> Self {
        Self::new(path, OpenMode::Truncate)
    }

    /// An output spec that appends to the file.
    pub fn append(path: impl Into<PathBuf>) -> Self {
        Self::new(path, OpenMode::Append)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Create the parent directories and open the file in this spec's mode.
    pub fn open(&self) -> io::Result<File> {
        ensure_parent_dir(&self.path)?;

        let mut options = OpenOptions::new();
        options.create(true);
        match self.mode {
            OpenMode::Truncate => options.write(true).truncate(true),
            OpenMode::Append => options.append(true),
        };
        options.open(&self.path)
    }

    /// Open the spec and write `contents` in one step.
    pub fn write_all(&self, contents: &[u8]) -> io::Result<()> {
        let mut file = self.open()?;
        file.write_all(contents)?;
        file.flush()
    }
}

/// Write fully materialized output to an optional destination.
///
/// A `None` destination discards the output.
pub fn write_output(spec: Option<&OutputFileSpec>, contents: &[u8]) -> io::Result<()> {
    match spec {
        Some(spec) => spec.write_all(contents),
        None => io::sink().write_all(contents),
    }
}

/// Look up an output charset by label.
///
/// Labels that resolve to a decode-only encoding, such as `replacement`,
/// are rejected, since encoding to them would silently produce UTF-8.
pub fn output_charset(label: &str) -> Option<&'static Encoding> {
    let encoding = Encoding::for_label(label.trim().as_bytes())?;
    let encodable =
        encoding == UTF_16LE || encoding == UTF_16BE || encoding.output_encoding() == encoding;
    encodable.then_some(encoding)
}

/// Encode output text in `encoding`.
///
/// UTF-16 is written without a byte order mark. Characters the target
/// charset cannot represent become numeric character references.
pub fn encode_output<'a>(encoding: &'static Encoding, text: &'a str) -> Cow<'a, [u8]> {
    if encoding == UTF_16LE {
        Cow::Owned(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
    } else if encoding == UTF_16BE {
        Cow::Owned(text.encode_utf16().flat_map(u16::to_be_bytes).collect())
    } else {
        encoding.encode(text).0
    }
}

/// Host registry of output locations, used for staleness tracking.
pub trait OutputRegistry {
    /// A file the transformations write.
    fn output_file(&mut self, path: &Path);

    /// A directory the transformations write into.
    fn output_dir(&mut self, path: &Path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/file.txt");

        let spec = OutputFileSpec::truncate(&path);
        spec.write_all(b"first").unwrap();
        spec.write_all(b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_append_accumulates_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep/nested/out.txt");

        let spec = OutputFileSpec::append(&path);
        spec.write_all(b"a").unwrap();
        spec.write_all(b"b").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "ab");
        assert_eq!(spec.mode(), OpenMode::Append);
    }

    #[test]
    fn test_write_output_discards_without_destination() {
        write_output(None, b"ignored").unwrap();
    }

    #[test]
    fn test_output_charset_rejects_decode_only_labels() {
        assert_eq!(output_charset("utf-8"), Some(encoding_rs::UTF_8));
        assert_eq!(output_charset("UTF-16"), Some(UTF_16LE));
        assert_eq!(output_charset("utf-16be"), Some(UTF_16BE));
        assert_eq!(output_charset("latin1"), Some(encoding_rs::WINDOWS_1252));
        assert_eq!(output_charset("replacement"), None);
        assert_eq!(output_charset("iso-2022-kr"), None);
        assert_eq!(output_charset("klingon"), None);
    }

    #[test]
    fn test_encode_output() {
        assert_eq!(&*encode_output(UTF_16LE, "hi"), &[b'h', 0, b'i', 0]);
        assert_eq!(&*encode_output(UTF_16BE, "hi"), &[0, b'h', 0, b'i']);
        assert_eq!(
            &*encode_output(encoding_rs::WINDOWS_1252, "caf\u{e9}"),
            b"caf\xe9"
        );
        assert_eq!(&*encode_output(encoding_rs::UTF_8, "caf\u{e9}"), "caf\u{e9}".as_bytes());
    }
}
