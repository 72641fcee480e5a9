//! Template backend.
//!
//! Renders template-language files (minijinja) with a data model built from
//! each XML source. Templates are compiled at load time; includes and
//! imports resolve next to the including template first and through the
//! module loader otherwise.

pub mod outputfile;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use encoding_rs::{Encoding, UTF_8};
use minijinja::value::{Kwargs, Value};
use minijinja::{AutoEscape, Environment, Error, ErrorKind, State, UndefinedBehavior};
use serde::Deserialize;

use crate::backend::trait_def::{
    BackendContext, BackendFactory, BackendKind, OutputMapping, ParsedFile, Transformer,
};
use crate::backend::xml::Document;
use crate::core::files_spec::FileCollection;
use crate::core::output::{encode_output, write_output, OutputFileSpec};
use crate::core::parameters::Parameters;
use crate::loader::{LoadError, ModuleLoader};
use crate::util::fs::{file_name_str, read_to_string};
use crate::util::log::Logger;

use self::outputfile::OutputFileFunction;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndefinedSetting {
    #[default]
    Lenient,
    Strict,
    Chainable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoEscapeSetting {
    #[default]
    None,
    Html,
}

/// Settings read from the backend settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateSettings {
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
    pub undefined: UndefinedSetting,
    pub auto_escape: AutoEscapeSetting,
}

impl TemplateSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = read_to_string(path)?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse template settings: {}", path.display()))
    }

    fn apply(&self, env: &mut Environment<'static>) {
        env.set_trim_blocks(self.trim_blocks);
        env.set_lstrip_blocks(self.lstrip_blocks);
        env.set_keep_trailing_newline(self.keep_trailing_newline);
        env.set_undefined_behavior(match self.undefined {
            UndefinedSetting::Lenient => UndefinedBehavior::Lenient,
            UndefinedSetting::Strict => UndefinedBehavior::Strict,
            UndefinedSetting::Chainable => UndefinedBehavior::Chainable,
        });
        let escape = self.auto_escape;
        env.set_auto_escape_callback(move |_| match escape {
            AutoEscapeSetting::None => AutoEscape::None,
            AutoEscapeSetting::Html => AutoEscape::Html,
        });
    }
}

/// Factory for [`TemplateTransformer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateBackend;

impl BackendFactory for TemplateBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Template
    }

    fn create(&self, context: BackendContext) -> Box<dyn Transformer> {
        Box::new(TemplateTransformer::new(context))
    }
}

/// Transformer rendering templates against XML data models.
pub struct TemplateTransformer {
    context: BackendContext,
    env: Environment<'static>,
    settings: TemplateSettings,
    parameters: Parameters,
    charset: &'static Encoding,
    /// The `doc` data model of every loaded source.
    sources: Vec<ParsedFile<Value>>,
    /// Loaded templates, keyed in the environment by their path.
    templates: Vec<ParsedFile<String>>,
}

impl TemplateTransformer {
    pub fn new(context: BackendContext) -> Self {
        let env = Self::environment(&context);
        let settings = TemplateSettings::default();
        let mut transformer = TemplateTransformer {
            context,
            env,
            settings,
            parameters: Parameters::new(),
            charset: UTF_8,
            sources: Vec::new(),
            templates: Vec::new(),
        };
        transformer.settings.apply(&mut transformer.env);
        transformer
    }

    pub fn settings(&self) -> &TemplateSettings {
        &self.settings
    }

    fn environment(context: &BackendContext) -> Environment<'static> {
        let mut env = Environment::new();

        env.set_path_join_callback(|name, parent| {
            if let Some(dir) = Path::new(parent).parent() {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Cow::Owned(candidate.to_string_lossy().into_owned());
                }
            }
            Cow::Borrowed(name)
        });

        let modules = context.modules.clone();
        env.set_loader(move |name| load_template_source(modules.as_ref(), name));

        let outputfile = OutputFileFunction::new(
            &context.descriptor.base_dir,
            context.logger.child("outputfile"),
        );
        env.add_function(
            "outputfile",
            move |state: &State, path: String, kwargs: Kwargs| outputfile.call(state, path, kwargs),
        );
        env
    }

    fn data_model(&self, source: &ParsedFile<Value>, template: &ParsedFile<String>) -> Value {
        let mut model: BTreeMap<String, Value> = self
            .parameters
            .iter()
            .map(|(name, value)| (name.clone(), Value::from_serialize(value)))
            .collect();
        model.insert("doc".into(), source.contents().clone());
        model.insert("source_name".into(), Value::from(file_name_str(source.path())));
        model.insert(
            "template_name".into(),
            Value::from(file_name_str(template.path())),
        );
        Value::from(model)
    }

    fn transform(
        &self,
        source: &ParsedFile<Value>,
        template: &ParsedFile<String>,
        output: Option<&OutputFileSpec>,
    ) -> anyhow::Result<()> {
        let rendered = self
            .env
            .get_template(template.contents())?
            .render(self.data_model(source, template))?;
        let bytes = encode_output(self.charset, &rendered);
        if let Some(output) = output {
            write_output(Some(output), &bytes)
                .with_context(|| format!("failed to write {}", output.path().display()))?;
        }
        Ok(())
    }
}

/// Source text of a template that is not next to its includer.
fn load_template_source(modules: &dyn ModuleLoader, name: &str) -> Result<Option<String>, Error> {
    let direct = Path::new(name);
    let path = if direct.is_absolute() && direct.is_file() {
        direct.to_path_buf()
    } else {
        match modules.load_module(name) {
            Ok(module) => match module.resource_path() {
                Some(path) => path.to_path_buf(),
                None => return Ok(None),
            },
            Err(LoadError::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(Error::new(
                    ErrorKind::TemplateNotFound,
                    format!("failed to load template `{}`", name),
                )
                .with_source(e))
            }
        }
    };
    modules.record_dependency(&path);
    std::fs::read_to_string(&path).map(Some).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("failed to read template {}", path.display()),
        )
        .with_source(e)
    })
}

fn source_model(path: &Path) -> anyhow::Result<Value> {
    let doc = Document::parse_file(path, true)?;
    let mut model = BTreeMap::new();
    model.insert("root", Value::from_serialize(doc.to_view()));
    Ok(Value::from_serialize(model))
}

fn template_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Transformer for TemplateTransformer {
    fn configure(&mut self, config_file: Option<&Path>) -> bool {
        let Some(path) = config_file else {
            return true;
        };
        match TemplateSettings::load(path) {
            Ok(settings) => {
                self.logger().debug(format!("template settings: {:?}", settings));
                settings.apply(&mut self.env);
                self.settings = settings;
                true
            }
            Err(e) => {
                self.logger().failure(
                    format!("Failed to configure template backend from '{}'", path.display()),
                    &e,
                );
                false
            }
        }
    }

    fn set_parameters(&mut self, parameters: &Parameters) {
        self.parameters = parameters.clone();
    }

    fn set_output_charset(&mut self, charset: &'static Encoding) {
        self.charset = charset;
    }

    fn load_sources(&mut self, files: &FileCollection) -> usize {
        let mut errors = 0;
        for path in files {
            match source_model(path) {
                Ok(model) => self.sources.push(ParsedFile::new(path, model)),
                Err(e) => {
                    errors += 1;
                    self.logger()
                        .failure(format!("Failed to load source '{}'", path.display()), &e);
                }
            }
        }
        errors
    }

    fn load_templates(&mut self, files: &FileCollection) -> usize {
        let mut errors = 0;
        for path in files {
            let key = template_key(path);
            let loaded = read_to_string(path).and_then(|text| {
                self.env
                    .add_template_owned(key.clone(), text)
                    .map_err(anyhow::Error::from)
            });
            match loaded {
                Ok(()) => self.templates.push(ParsedFile::new(path, key)),
                Err(e) => {
                    errors += 1;
                    self.logger()
                        .failure(format!("Failed to load template '{}'", path.display()), &e);
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
                        &e,
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
