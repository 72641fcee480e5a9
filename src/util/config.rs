//! The `Munge.toml` project manifest.
//!
//! A manifest declares the artifact repository, the library versions the
//! backends may load, and the transformation sets to run:
//!
//! ```toml
//! fail_on_error = true
//! module_path = ["lib"]
//!
//! [versions]
//! template-macros = "1.2.0"
//!
//! [[set]]
//! backend = "xslt"
//! source_dirs = [{ dir = "src", include = ["**/*.xml"] }]
//! templates = ["xsl/page.xsl"]
//! output_dir = "build/html"
//!
//! [[set.output_mapping]]
//! template = "index*"
//! output = "build/{source_stem}.html"
//! ```
//!
//! The project root is the directory holding the manifest; every relative
//! path in it resolves against that directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::trait_def::BackendKind;
use crate::core::files_spec::PatternSet;
use crate::core::output::output_charset;
use crate::core::parameters::Parameters;
use crate::core::transformation_set::TransformationSet;
use crate::loader::{
    AmbientLoader, IsolatedBackendLoader, LibraryCatalog, LibrarySpec, LibraryVersions,
    LocalRepository, VersionSetting,
};
use crate::ops::transform::TransformTask;
use crate::util::fs::{file_name_str, file_stem_str, resolve_against};
use crate::util::log::Logger;

/// Manifest file name.
pub const MANIFEST_NAME: &str = "Munge.toml";

/// Directory for per-project state, relative to the project root.
pub const STATE_DIR: &str = ".munge";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("could not find `Munge.toml` in `{}` or any parent directory", dir.display())]
    #[diagnostic(
        code(munge::config::not_found),
        help("Create a Munge.toml in the project root or pass --manifest")
    )]
    NotFound { dir: PathBuf },

    #[error("failed to read {}", path.display())]
    #[diagnostic(code(munge::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    #[diagnostic(code(munge::config::parse))]
    Parse {
        path: PathBuf,
        message: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("here")]
        span: Option<SourceSpan>,
    },

    #[error("set #{index}: {message}")]
    #[diagnostic(
        code(munge::config::invalid_set),
        help("Set numbers count `[[set]]` tables from 1 in manifest order")
    )]
    InvalidSet { index: usize, message: String },
}

/// A directory of inputs with Ant-style filters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DirConfig {
    fn patterns(&self) -> PatternSet {
        PatternSet::new()
            .include(self.include.iter().cloned())
            .exclude(self.exclude.iter().cloned())
    }
}

/// A declarative output mapping.
///
/// `output` may use `{source}`, `{template}`, `{source_stem}` and
/// `{template_stem}`. The optional globs match file names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRule {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    pub output: String,
}

impl MappingRule {
    /// Turn the rule into a mapping function.
    pub fn compile(&self) -> Result<impl Fn(&Path, &Path) -> Option<PathBuf> + 'static, String> {
        let source = compile_glob(self.source.as_deref())?;
        let template = compile_glob(self.template.as_deref())?;
        let output = self.output.clone();

        Ok(move |source_path: &Path, template_path: &Path| {
            let source_name = file_name_str(source_path);
            let template_name = file_name_str(template_path);
            let matches = |pattern: &Option<Pattern>, name: &str| {
                pattern.as_ref().map_or(true, |p| p.matches(name))
            };
            if !matches(&source, &source_name) || !matches(&template, &template_name) {
                return None;
            }
            let expanded = output
                .replace("{source_stem}", &file_stem_str(source_path))
                .replace("{template_stem}", &file_stem_str(template_path))
                .replace("{source}", &source_name)
                .replace("{template}", &template_name);
            Some(PathBuf::from(expanded))
        })
    }
}

fn compile_glob(pattern: Option<&str>) -> Result<Option<Pattern>, String> {
    pattern
        .map(|p| Pattern::new(p).map_err(|e| format!("invalid pattern `{}`: {}", p, e)))
        .transpose()
}

/// One `[[set]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetConfig {
    pub backend: String,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub source_dirs: Vec<DirConfig>,
    #[serde(default)]
    pub templates: Vec<PathBuf>,
    #[serde(default)]
    pub template_dirs: Vec<DirConfig>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub dynamic_output_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub output_mapping: Vec<MappingRule>,
}

impl SetConfig {
    /// Copy this table into `set`. `index` is the 1-based set number.
    pub fn apply(&self, index: usize, set: &mut TransformationSet) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidSet { index, message };

        set.sources(self.sources.iter().cloned());
        for dir in &self.source_dirs {
            set.source_dir(&dir.dir, dir.patterns());
        }
        set.templates(self.templates.iter().cloned());
        for dir in &self.template_dirs {
            set.template_dir(&dir.dir, dir.patterns());
        }

        set.set_output_dir(self.output_dir.as_deref())
            .set_output_file(self.output_file.as_deref())
            .set_config_file(self.config_file.as_deref())
            .parameters(self.parameters.clone());

        if let Some(label) = &self.charset {
            let charset = output_charset(label)
                .ok_or_else(|| invalid(format!("unknown or unsupported charset `{}`", label)))?;
            set.set_charset(charset);
        }
        for dir in &self.dynamic_output_dirs {
            set.dynamic_output_dir(dir);
        }
        for rule in &self.output_mapping {
            set.output_mapping(rule.compile().map_err(invalid)?);
        }
        Ok(())
    }

    pub fn kind(&self, index: usize) -> Result<BackendKind, ConfigError> {
        self.backend
            .parse::<BackendKind>()
            .map_err(|e| ConfigError::InvalidSet {
                index,
                message: e.to_string(),
            })
    }
}

/// A parsed `Munge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub fail_on_error: bool,
    /// Root of the local artifact repository.
    #[serde(default)]
    pub repository: Option<PathBuf>,
    /// Directories searched for modules the artifact set does not provide.
    #[serde(default)]
    pub module_path: Vec<PathBuf>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionSetting>,
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibrarySpec>,
    #[serde(default, rename = "set")]
    pub sets: Vec<SetConfig>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Parse manifest text; `path` is only used in diagnostics.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.message().to_string(),
            span: e.span().map(SourceSpan::from),
            src: NamedSource::new(path.display().to_string(), contents.to_string()),
        })
    }
}

/// Walk up from `start` to the nearest directory holding a manifest.
pub fn find_manifest(start: &Path) -> Result<PathBuf, ConfigError> {
    start
        .ancestors()
        .map(|dir| dir.join(MANIFEST_NAME))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::NotFound {
            dir: start.to_path_buf(),
        })
}

/// A manifest together with the project it belongs to.
#[derive(Debug, Clone)]
pub struct Project {
    manifest_path: PathBuf,
    root: PathBuf,
    manifest: Manifest,
}

impl Project {
    /// Load the manifest at `explicit`, or the nearest one above `cwd`.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
        let manifest_path = match explicit {
            Some(path) => resolve_against(cwd, path),
            None => find_manifest(cwd)?,
        };
        Self::load(&manifest_path)
    }

    pub fn load(manifest_path: &Path) -> Result<Self, ConfigError> {
        let manifest = Manifest::load(manifest_path)?;
        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Project {
            manifest_path: manifest_path.to_path_buf(),
            root,
            manifest,
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// The artifact repository: the manifest's, else `~/.munge/repository`.
    pub fn repository_root(&self) -> PathBuf {
        match &self.manifest.repository {
            Some(path) => resolve_against(&self.root, path),
            None => LocalRepository::default_root()
                .unwrap_or_else(|| self.state_dir().join("repository")),
        }
    }

    pub fn catalog(&self) -> LibraryCatalog {
        let mut catalog = LibraryCatalog::builtin();
        for library in &self.manifest.libraries {
            catalog.add(library.clone());
        }
        catalog
    }

    pub fn versions(&self) -> LibraryVersions {
        let mut versions = LibraryVersions::new();
        for (key, setting) in &self.manifest.versions {
            versions.set(key.clone(), setting.clone());
        }
        versions
    }

    /// A backend loader over the project's repository and module path.
    pub fn loader(&self, logger: Logger) -> Arc<IsolatedBackendLoader> {
        let module_path = self
            .manifest
            .module_path
            .iter()
            .map(|dir| resolve_against(&self.root, dir))
            .collect();
        Arc::new(IsolatedBackendLoader::new(
            self.catalog(),
            self.versions(),
            Arc::new(LocalRepository::new(self.repository_root())),
            Arc::new(AmbientLoader::new(module_path)),
            logger,
        ))
    }

    /// The task running every `[[set]]` of the manifest.
    pub fn task(
        &self,
        loader: Arc<IsolatedBackendLoader>,
        logger: Logger,
    ) -> Result<TransformTask, ConfigError> {
        let mut task = TransformTask::new(&self.root, loader, logger);
        task.set_fail_on_error(self.manifest.fail_on_error);

        for (i, config) in self.manifest.sets.iter().enumerate() {
            let index = i + 1;
            let kind = config.kind(index)?;
            let mut result = Ok(());
            task.add_set(kind, |set| result = config.apply(index, set));
            result?;
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameters::ParamValue;
    use crate::test_support::ProjectFixture;

    const FULL: &str = r#"
fail_on_error = true
repository = "repo"
module_path = ["lib"]

[versions]
template-macros = "1.2.0"
template-macros-compat = false

[[library]]
key = "xsl-commons"
group = "org.example"
name = "xsl-commons"
version = "3.1"

[[set]]
backend = "xslt"
sources = ["src/doc.xml"]
source_dirs = [{ dir = "src/xml", include = ["**/*.xml"], exclude = ["draft/**"] }]
templates = ["xsl/page.xsl"]
output_dir = "build/out"
config_file = "xslt.toml"
parameters = { title = "Docs", level = 2 }
dynamic_output_dirs = ["build/extra"]

[[set.output_mapping]]
template = "xyz*"
output = "build/{source_stem}-{template_stem}.html"

[[set]]
backend = "template"
templates = ["t.j2"]
output_file = "build/all.txt"
charset = "ISO-8859-1"
"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::parse(FULL, Path::new(MANIFEST_NAME)).unwrap();

        assert!(manifest.fail_on_error);
        assert_eq!(manifest.module_path, vec![PathBuf::from("lib")]);
        assert_eq!(
            manifest.versions["template-macros"],
            VersionSetting::version("1.2.0")
        );
        assert!(manifest.versions["template-macros-compat"].is_excluded());
        assert_eq!(manifest.libraries[0].default_version.as_deref(), Some("3.1"));
        assert_eq!(manifest.sets.len(), 2);

        let xslt = &manifest.sets[0];
        assert_eq!(xslt.kind(1).unwrap(), BackendKind::Xslt);
        assert_eq!(xslt.source_dirs[0].exclude, vec!["draft/**".to_string()]);
        assert_eq!(xslt.parameters["level"], ParamValue::Integer(2));
        assert_eq!(xslt.output_mapping[0].template.as_deref(), Some("xyz*"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = Manifest::parse("[[set]]\nbackend = \"xslt\"\noutput = \"x\"\n", Path::new("M"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("output"));

        assert!(Manifest::parse("colour = true\n", Path::new("M")).is_err());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let project = ProjectFixture::new();
        project.file(MANIFEST_NAME, "[[set]]\nbackend = \"velocity\"\n");

        let project = Project::discover(None, project.root()).unwrap();
        let err = project
            .task(project.loader(Logger::new("test")), Logger::new("test"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSet { index: 1, .. }));
        assert!(err.to_string().contains("velocity"));
    }

    #[test]
    fn test_unknown_charset_is_rejected() {
        let project = ProjectFixture::new();
        project.file(
            MANIFEST_NAME,
            "[[set]]\nbackend = \"template\"\n\n[[set]]\nbackend = \"template\"\ncharset = \"klingon\"\n",
        );

        let project = Project::discover(None, project.root()).unwrap();
        let err = project
            .task(project.loader(Logger::new("test")), Logger::new("test"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSet { index: 2, .. }));
    }

    #[test]
    fn test_decode_only_charset_is_rejected() {
        let project = ProjectFixture::new();
        project.file(
            MANIFEST_NAME,
            "[[set]]\nbackend = \"template\"\ncharset = \"iso-2022-kr\"\n",
        );

        let project = Project::discover(None, project.root()).unwrap();
        let err = project
            .task(project.loader(Logger::new("test")), Logger::new("test"))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported charset `iso-2022-kr`"));

        let mut set =
            TransformationSet::new(BackendKind::Template, project.root(), Logger::new("test"));
        let config: SetConfig =
            toml::from_str("backend = \"template\"\ncharset = \"UTF-16BE\"").unwrap();
        config.apply(1, &mut set).unwrap();
        assert_eq!(set.charset(), encoding_rs::UTF_16BE);
    }

    #[test]
    fn test_find_manifest_walks_up() {
        let project = ProjectFixture::new();
        project.file(MANIFEST_NAME, "");
        let nested = project.dir("a/b/c");

        assert_eq!(find_manifest(&nested).unwrap(), project.path(MANIFEST_NAME));
    }

    #[test]
    fn test_find_manifest_reports_start_dir() {
        let project = ProjectFixture::new();
        let dir = project.dir("empty");
        // Nothing above a temp dir is expected to carry a manifest.
        match find_manifest(&dir) {
            Err(ConfigError::NotFound { dir: reported }) => assert_eq!(reported, dir),
            Ok(found) => assert!(!found.starts_with(project.root())),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_mapping_rule_placeholders_and_filters() {
        let rule = MappingRule {
            source: Some("*.xml".into()),
            template: Some("xyz*".into()),
            output: "out/{source_stem}-{template_stem}/{source}+{template}".into(),
        };
        let mapping = rule.compile().unwrap();

        assert_eq!(
            mapping(Path::new("in/page.xml"), Path::new("t/xyzPage.xsl")),
            Some(PathBuf::from("out/page-xyzPage/page.xml+xyzPage.xsl"))
        );
        assert_eq!(
            mapping(Path::new("in/page.xml"), Path::new("t/abc.xsl")),
            None
        );
        assert_eq!(
            mapping(Path::new("in/page.txt"), Path::new("t/xyz.xsl")),
            None
        );
    }

    #[test]
    fn test_invalid_mapping_glob() {
        let rule = MappingRule {
            source: Some("[".into()),
            template: None,
            output: "x".into(),
        };
        assert!(rule.compile().is_err());
    }

    #[test]
    fn test_task_from_manifest() {
        let fixture = ProjectFixture::new();
        fixture.file(MANIFEST_NAME, FULL);
        fixture.file("src/xml/a.xml", "<a/>");
        fixture.file("src/xml/draft/b.xml", "<b/>");
        fixture.file("xsl/page.xsl", "<x/>");
        fixture.file("t.j2", "");

        let project = Project::discover(Some(Path::new(MANIFEST_NAME)), fixture.root()).unwrap();
        assert_eq!(project.root(), fixture.root());
        assert_eq!(project.repository_root(), fixture.path("repo"));
        assert!(project.catalog().get("xsl-commons").is_some());

        let task = project
            .task(project.loader(Logger::new("test")), Logger::new("test"))
            .unwrap();
        assert!(task.fail_on_error());
        assert_eq!(task.sets().len(), 2);

        let xslt = &task.sets()[0];
        assert_eq!(xslt.source_files().unwrap().len(), 1);
        assert_eq!(xslt.config_file(), Some(fixture.path("xslt.toml").as_path()));
        assert_eq!(
            xslt.mapped_output_files().unwrap(),
            vec![fixture.path("build/out/a.xml")]
        );

        let template = &task.sets()[1];
        assert_eq!(template.charset(), encoding_rs::WINDOWS_1252);
        assert_eq!(template.output_file(), Some(fixture.path("build/all.txt").as_path()));
    }

    #[test]
    fn test_manifest_without_versions_resolves_cleanly() {
        let fixture = ProjectFixture::new();
        fixture.file(MANIFEST_NAME, "repository = \"repo\"\n");

        let project = Project::discover(None, fixture.root()).unwrap();
        let loader = project.loader(Logger::new("test"));
        assert_eq!(loader.search_path(), Ok(&[][..]));
    }

    #[test]
    fn test_pinned_library_resolves_from_repository() {
        let fixture = ProjectFixture::new();
        fixture.file(
            MANIFEST_NAME,
            "repository = \"repo\"\n\n[versions]\ntemplate-macros = \"1.2.0\"\n",
        );
        let artifact = fixture.dir("repo/munge/template-macros/1.2.0");

        let project = Project::discover(None, fixture.root()).unwrap();
        let loader = project.loader(Logger::new("test"));
        assert_eq!(loader.search_path(), Ok(&[artifact][..]));
    }
}
