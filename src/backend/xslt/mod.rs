//! XSLT backend.
//!
//! Applies XSLT 1.0 stylesheets (with `xsl:result-document` for side
//! outputs) to XML sources. Sources are parsed and stylesheets compiled at
//! load time; a transformation then only evaluates the compiled tree.

pub mod eval;
pub mod exec;
pub mod result;
pub mod stylesheet;
pub mod xpath;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use encoding_rs::Encoding;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::trait_def::{
    BackendContext, BackendFactory, BackendKind, OutputMapping, ParsedFile, Transformer,
};
use crate::backend::xml::Document;
use crate::core::files_spec::FileCollection;
use crate::core::output::{write_output, OutputFileSpec};
use crate::core::parameters::Parameters;
use crate::util::fs::read_to_string;
use crate::util::log::Logger;

use self::exec::{ExecError, Executor};
use self::stylesheet::Stylesheet;

/// Error from one XSLT transformation.
#[derive(Debug, Error)]
pub enum XsltError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("failed to write {}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Settings read from the backend settings file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XsltSettings {
    /// Drop whitespace-only text nodes from sources.
    pub strip_whitespace: bool,
    /// Maximum template nesting.
    pub max_depth: usize,
}

impl Default for XsltSettings {
    fn default() -> Self {
        XsltSettings {
            strip_whitespace: true,
            max_depth: 256,
        }
    }
}

impl XsltSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = read_to_string(path)?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse XSLT settings: {}", path.display()))
    }
}

/// Factory for [`XsltTransformer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XsltBackend;

impl BackendFactory for XsltBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Xslt
    }

    fn create(&self, context: BackendContext) -> Box<dyn Transformer> {
        Box::new(XsltTransformer::new(context))
    }
}

/// Transformer applying compiled stylesheets to parsed XML sources.
pub struct XsltTransformer {
    context: BackendContext,
    settings: XsltSettings,
    parameters: Parameters,
    sources: Vec<ParsedFile<Document>>,
    templates: Vec<ParsedFile<Stylesheet>>,
}

impl XsltTransformer {
    pub fn new(context: BackendContext) -> Self {
        XsltTransformer {
            context,
            settings: XsltSettings::default(),
            parameters: Parameters::new(),
            sources: Vec::new(),
            templates: Vec::new(),
        }
    }

    pub fn settings(&self) -> &XsltSettings {
        &self.settings
    }

    fn transform(
        &self,
        source: &ParsedFile<Document>,
        template: &ParsedFile<Stylesheet>,
        output: Option<&OutputFileSpec>,
    ) -> Result<(), XsltError> {
        let bytes = Executor::new(
            template.contents(),
            source.contents(),
            &self.context.descriptor.base_dir,
            &self.context.logger,
            self.settings.max_depth,
        )
        .run(&self.parameters)?;

        write_output(output, &bytes).map_err(|source| XsltError::Output {
            path: output.map(|o| o.path().to_path_buf()).unwrap_or_default(),
            source,
        })
    }
}

impl Transformer for XsltTransformer {
    fn configure(&mut self, config_file: Option<&Path>) -> bool {
        let Some(path) = config_file else {
            return true;
        };
        match XsltSettings::load(path) {
            Ok(settings) => {
                self.logger().debug(format!("XSLT settings: {:?}", settings));
                self.settings = settings;
                true
            }
            Err(e) => {
                self.logger().failure(
                    format!("Failed to configure XSLT backend from '{}'", path.display()),
                    &e,
                );
                false
            }
        }
    }

    fn set_parameters(&mut self, parameters: &Parameters) {
        self.parameters = parameters.clone();
    }

    fn set_output_charset(&mut self, _charset: &'static Encoding) {
        // Stylesheets choose their own encoding through xsl:output.
    }

    fn load_sources(&mut self, files: &FileCollection) -> usize {
        let mut errors = 0;
        for path in files {
            match Document::parse_file(path, self.settings.strip_whitespace) {
                Ok(doc) => self.sources.push(ParsedFile::new(path, doc)),
                Err(e) => {
                    errors += 1;
                    self.logger().failure(
                        format!("Failed to load source '{}'", path.display()),
                        &e.into(),
                    );
                }
            }
        }
        errors
    }

    fn load_templates(&mut self, files: &FileCollection) -> usize {
        let mut errors = 0;
        for path in files {
            match Stylesheet::compile_file(path, Some(self.context.modules.as_ref())) {
                Ok(sheet) => self.templates.push(ParsedFile::new(path, sheet)),
                Err(e) => {
                    errors += 1;
                    self.logger().failure(
                        format!("Failed to load stylesheet '{}'", path.display()),
                        &e.into(),
                    );
                }
            }
        }
        errors
    }

    fn execute_transformations(&mut self, mapping: &OutputMapping<'_>) -> usize {
        let mut errors = 0;
        for source in &self.sources {
            for template in &self.templates {
                let output = mapping(source.path(), template.path());
                self.log_transformation(source.path(), template.path(), output.as_ref());

                if let Err(e) = self.transform(source, template, output.as_ref()) {
                    errors += 1;
                    self.logger().failure(
                        format!(
                            "Failed to transform '{}' with '{}'",
                            source.path().display(),
                            template.path().display()
                        ),
                        &e.into(),
                    );
                }
            }
        }
        errors
    }

    fn logger(&self) -> &Logger {
        &self.context.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::trait_def::BackendDescriptor;
    use crate::test_support::{test_loader, test_loader_with, ProjectFixture};

    const SHEET: &str = r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:output method="text"/>
  <xsl:param name="greeting" select="'Hello'"/>
  <xsl:template match="/"><xsl:value-of select="$greeting"/>, <xsl:value-of select="/person/@name"/>!</xsl:template>
</xsl:stylesheet>"#;

    fn transformer(project: &ProjectFixture) -> Box<dyn Transformer> {
        test_loader()
            .instantiate(BackendKind::Xslt, project.root(), Logger::new("test"))
            .unwrap()
    }

    fn files(paths: Vec<PathBuf>) -> FileCollection {
        paths.into_iter().collect()
    }

    #[test]
    fn test_configure() {
        let project = ProjectFixture::new();
        let mut xslt = XsltTransformer::new(BackendContext {
            descriptor: BackendDescriptor {
                kind: BackendKind::Xslt,
                search_path: Vec::new(),
                base_dir: project.root().to_path_buf(),
            },
            modules: test_loader(),
            logger: Logger::new("test"),
        });

        assert!(xslt.configure(None));
        assert_eq!(xslt.settings(), &XsltSettings::default());

        let good = project.file("xslt.toml", "strip_whitespace = false\nmax_depth = 8\n");
        assert!(xslt.configure(Some(&good)));
        assert!(!xslt.settings().strip_whitespace);
        assert_eq!(xslt.settings().max_depth, 8);

        let unknown = project.file("unknown.toml", "indent = true\n");
        assert!(!xslt.configure(Some(&unknown)));
        assert!(!xslt.configure(Some(&project.path("missing.toml"))));
    }

    #[test]
    fn test_bad_source_is_counted_and_skipped() {
        let project = ProjectFixture::new();
        let good = project.file("a.xml", r#"<person name="Ada"/>"#);
        let bad = project.file("b.xml", "<person>");
        let sheet = project.file("hello.xsl", SHEET);

        let mut xslt = transformer(&project);
        assert!(xslt.configure(None));
        assert_eq!(xslt.load_sources(&files(vec![bad, good])), 1);
        assert_eq!(xslt.load_templates(&files(vec![sheet])), 0);

        let out = project.path("out.txt");
        let errors = xslt.execute_transformations(&|_, _| Some(OutputFileSpec::truncate(&out)));
        assert_eq!(errors, 0);
        assert_eq!(project.read("out.txt"), "Hello, Ada!");
    }

    #[test]
    fn test_parameters_override_stylesheet_params() {
        let project = ProjectFixture::new();
        let source = project.file("a.xml", r#"<person name="Grace"/>"#);
        let sheet = project.file("hello.xsl", SHEET);

        let mut xslt = transformer(&project);
        let mut params = Parameters::new();
        params.insert("greeting".into(), "Goodbye".into());
        xslt.set_parameters(&params);
        xslt.load_sources(&files(vec![source]));
        xslt.load_templates(&files(vec![sheet]));

        let out = project.path("out/greeting.txt");
        assert_eq!(
            xslt.execute_transformations(&|_, _| Some(OutputFileSpec::truncate(&out))),
            0
        );
        assert_eq!(project.read("out/greeting.txt"), "Goodbye, Grace!");
    }

    #[test]
    fn test_failed_transformation_is_counted() {
        let project = ProjectFixture::new();
        let source = project.file("a.xml", "<a/>");
        let sheet = project.file(
            "fail.xsl",
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:template match="/"><xsl:value-of select="$undefined"/></xsl:template>
</xsl:stylesheet>"#,
        );
        let ok = project.file("hello.xsl", SHEET);

        let mut xslt = transformer(&project);
        xslt.load_sources(&files(vec![source]));
        xslt.load_templates(&files(vec![sheet, ok]));
        assert_eq!(xslt.execute_transformations(&|_, _| None), 1);
    }

    #[test]
    fn test_result_document_and_discarded_primary_output() {
        let project = ProjectFixture::new();
        let source = project.file("list.xml", "<list><item>one</item><item>two</item></list>");
        let sheet = project.file(
            "split.xsl",
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:template match="item">
    <xsl:result-document href="items/{.}.txt" method="text"><xsl:value-of select="."/></xsl:result-document>
  </xsl:template>
</xsl:stylesheet>"#,
        );

        let mut xslt = transformer(&project);
        xslt.load_sources(&files(vec![source]));
        xslt.load_templates(&files(vec![sheet]));
        assert_eq!(xslt.execute_transformations(&|_, _| None), 0);

        assert_eq!(project.read("items/one.txt"), "one");
        assert_eq!(project.read("items/two.txt"), "two");
    }

    #[test]
    fn test_include_resolves_through_artifact_roots() {
        let project = ProjectFixture::new();
        let artifact = project.dir("repo/xslt-stdlib/1.0");
        project.file(
            "repo/xslt-stdlib/1.0/lib/upper.xsl",
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:template name="upper"><xsl:param name="s"/><xsl:value-of select="upper-case($s)"/></xsl:template>
</xsl:stylesheet>"#,
        );
        let source = project.file("a.xml", "<word>quiet</word>");
        let sheet = project.file(
            "xsl/shout.xsl",
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="lib/upper.xsl"/>
  <xsl:output method="text"/>
  <xsl:template match="/"><xsl:call-template name="upper"><xsl:with-param name="s" select="word"/></xsl:call-template></xsl:template>
</xsl:stylesheet>"#,
        );

        let loader = test_loader_with(vec![artifact], Vec::new());
        let mut xslt = loader
            .instantiate(BackendKind::Xslt, project.root(), Logger::new("test"))
            .unwrap();
        xslt.load_sources(&files(vec![source]));
        assert_eq!(xslt.load_templates(&files(vec![sheet])), 0);

        let out = project.path("shout.txt");
        xslt.execute_transformations(&|_, _| Some(OutputFileSpec::truncate(&out)));
        assert_eq!(project.read("shout.txt"), "QUIET");
        assert_eq!(
            loader.dependencies(),
            vec![project.path("repo/xslt-stdlib/1.0/lib/upper.xsl")]
        );
    }
}
