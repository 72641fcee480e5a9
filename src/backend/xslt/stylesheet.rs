//! Stylesheet compilation.
//!
//! A stylesheet document is compiled into template rules and an instruction
//! tree once, at load time. `xsl:include` and `xsl:import` hrefs resolve
//! next to the including stylesheet first and through the module loader
//! otherwise; imported rules get a lower import precedence than the rules of
//! the importing stylesheet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::xml::{Document, NodeId, NodeKind, XmlError};
use crate::backend::xslt::result::{OutputMethod, OutputSettings};
use crate::backend::xslt::xpath::{Axis, BinaryOp, Expr, NodeTest, Step};
use crate::core::output::output_charset;
use crate::loader::ModuleLoader;

pub const XSLT_NAMESPACE: &str = "http://www.w3.org/1999/XSL/Transform";

/// Error compiling a stylesheet.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to parse stylesheet {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: XmlError,
    },

    #[error("{}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}

/// An attribute value template.
#[derive(Debug, Clone, PartialEq)]
pub struct Avt {
    pub parts: Vec<AvtPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AvtPart {
    Literal(String),
    Expr(Expr),
}

impl Avt {
    pub fn parse(text: &str) -> Result<Avt, String> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(format!("unmatched `}}` in `{}`", text)),
                '{' => {
                    let mut expr = String::new();
                    let mut quote: Option<char> = None;
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match (quote, c) {
                            (None, '}') => {
                                closed = true;
                                break;
                            }
                            (None, '"' | '\'') => quote = Some(c),
                            (Some(q), c) if c == q => quote = None,
                            _ => {}
                        }
                        expr.push(c);
                    }
                    if !closed {
                        return Err(format!("unterminated `{{` in `{}`", text));
                    }
                    if !literal.is_empty() {
                        parts.push(AvtPart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(AvtPart::Expr(Expr::parse(&expr).map_err(|e| e.to_string())?));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(AvtPart::Literal(literal));
        }
        Ok(Avt { parts })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue {
    Select(Expr),
    Content(Vec<Instruction>),
    /// No select and no content: the empty string.
    Empty,
}

/// A variable, parameter or with-param.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub value: BindingValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub select: Expr,
    pub numeric: bool,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Text(String),
    LiteralElement {
        name: String,
        namespaces: Vec<(String, String)>,
        attributes: Vec<(String, Avt)>,
        body: Vec<Instruction>,
    },
    ApplyTemplates {
        select: Option<Expr>,
        mode: Option<String>,
        sorts: Vec<Sort>,
        params: Vec<Binding>,
    },
    CallTemplate {
        name: String,
        params: Vec<Binding>,
    },
    ForEach {
        select: Expr,
        sorts: Vec<Sort>,
        body: Vec<Instruction>,
    },
    ValueOf {
        select: Expr,
    },
    If {
        test: Expr,
        body: Vec<Instruction>,
    },
    Choose {
        branches: Vec<(Expr, Vec<Instruction>)>,
        otherwise: Vec<Instruction>,
    },
    Variable(Binding),
    Copy {
        body: Vec<Instruction>,
    },
    CopyOf {
        select: Expr,
    },
    Element {
        name: Avt,
        body: Vec<Instruction>,
    },
    Attribute {
        name: Avt,
        body: Vec<Instruction>,
    },
    Message {
        body: Vec<Instruction>,
        terminate: bool,
    },
    ResultDocument {
        href: Avt,
        encoding: Option<Avt>,
        method: Option<OutputMethod>,
        body: Vec<Instruction>,
    },
}

/// A compiled `xsl:template`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: Option<String>,
    pub params: Vec<Binding>,
    pub body: Vec<Instruction>,
}

/// One alternative of a template's match pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub template: usize,
    pub pattern: Expr,
    pub mode: Option<String>,
    pub priority: f64,
    pub precedence: u32,
    /// Position in declaration order across the whole stylesheet.
    pub order: usize,
}

/// A compiled stylesheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub templates: Vec<Template>,
    pub rules: Vec<Rule>,
    /// Named templates, resolved to the highest import precedence.
    pub named: HashMap<String, usize>,
    /// Top-level variables and params in declaration order; `true` marks a param.
    pub globals: Vec<(Binding, bool)>,
    pub output: OutputSettings,
}

impl Stylesheet {
    /// Compile the stylesheet at `path`.
    pub fn compile_file(
        path: &Path,
        modules: Option<&dyn ModuleLoader>,
    ) -> Result<Stylesheet, CompileError> {
        let mut compiler = Compiler::new(modules);
        compiler.compile_file(path)?;
        Ok(compiler.finish())
    }

    /// Compile stylesheet text; `path` locates relative hrefs and names errors.
    pub fn compile_str(
        text: &str,
        path: &Path,
        modules: Option<&dyn ModuleLoader>,
    ) -> Result<Stylesheet, CompileError> {
        let doc = Document::parse(text).map_err(|source| CompileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut compiler = Compiler::new(modules);
        compiler.compile_document(&doc, path)?;
        Ok(compiler.finish())
    }
}

struct Compiler<'m> {
    modules: Option<&'m dyn ModuleLoader>,
    templates: Vec<Template>,
    rules: Vec<Rule>,
    named: HashMap<String, (usize, u32)>,
    globals: Vec<(Binding, bool)>,
    output: OutputSettings,
    next_precedence: u32,
    /// Stylesheets being compiled, for cycle detection.
    loading: Vec<PathBuf>,
}

/// The stylesheet document an element belongs to.
struct Source<'d> {
    doc: &'d Document,
    path: &'d Path,
}

impl Source<'_> {
    fn invalid(&self, message: impl Into<String>) -> CompileError {
        CompileError::Invalid {
            path: self.path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Local name of an element in the XSLT namespace.
    fn xsl_name(&self, node: NodeId) -> Option<&str> {
        if self.doc.is_element(node) && self.doc.namespace_uri(node) == Some(XSLT_NAMESPACE) {
            self.doc.local_name(node)
        } else {
            None
        }
    }

    fn element_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.doc
            .children(node)
            .iter()
            .copied()
            .filter(|&c| self.doc.is_element(c))
    }

    fn required(&self, node: NodeId, attr: &str) -> Result<&str, CompileError> {
        self.doc.attribute(node, attr).ok_or_else(|| {
            self.invalid(format!(
                "xsl:{} requires the `{}` attribute",
                self.doc.local_name(node).unwrap_or_default(),
                attr
            ))
        })
    }

    fn expr(&self, text: &str) -> Result<Expr, CompileError> {
        Expr::parse(text).map_err(|e| self.invalid(e.to_string()))
    }

    fn avt(&self, text: &str) -> Result<Avt, CompileError> {
        Avt::parse(text).map_err(|e| self.invalid(e))
    }

    fn optional_expr(&self, node: NodeId, attr: &str) -> Result<Option<Expr>, CompileError> {
        self.doc
            .attribute(node, attr)
            .map(|text| self.expr(text))
            .transpose()
    }
}

impl<'m> Compiler<'m> {
    fn new(modules: Option<&'m dyn ModuleLoader>) -> Self {
        Compiler {
            modules,
            templates: Vec::new(),
            rules: Vec::new(),
            named: HashMap::new(),
            globals: Vec::new(),
            output: OutputSettings::default(),
            next_precedence: 0,
            loading: Vec::new(),
        }
    }

    fn finish(self) -> Stylesheet {
        Stylesheet {
            templates: self.templates,
            rules: self.rules,
            named: self
                .named
                .into_iter()
                .map(|(name, (index, _))| (name, index))
                .collect(),
            globals: self.globals,
            output: self.output,
        }
    }

    fn compile_file(&mut self, path: &Path) -> Result<(), CompileError> {
        if self.loading.iter().any(|p| p == path) {
            return Err(CompileError::Invalid {
                path: path.to_path_buf(),
                message: "stylesheet includes or imports itself".into(),
            });
        }
        let doc = Document::parse_file(path, false).map_err(|source| CompileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.compile_document(&doc, path)
    }

    fn compile_document(&mut self, doc: &Document, path: &Path) -> Result<(), CompileError> {
        let source = Source { doc, path };
        let root = source.doc.document_element().ok_or_else(|| source.invalid("empty stylesheet"))?;
        match source.xsl_name(root) {
            Some("stylesheet" | "transform") => {}
            _ => {
                return Err(source.invalid(
                    "root element must be xsl:stylesheet or xsl:transform in the XSLT namespace",
                ))
            }
        }

        self.loading.push(path.to_path_buf());
        let result = self.compile_imports(&source, root).and_then(|()| {
            let precedence = self.next_precedence;
            self.next_precedence += 1;
            self.compile_top_level(&source, root, precedence)
        });
        self.loading.pop();
        result
    }

    fn compile_imports(&mut self, source: &Source<'_>, root: NodeId) -> Result<(), CompileError> {
        for child in source.element_children(root) {
            if source.xsl_name(child) == Some("import") {
                let href = source.required(child, "href")?;
                let resolved = self.resolve_href(source, href)?;
                self.compile_file(&resolved)?;
            }
        }
        Ok(())
    }

    fn resolve_href(&self, source: &Source<'_>, href: &str) -> Result<PathBuf, CompileError> {
        let base = source.path.parent().unwrap_or_else(|| Path::new("."));
        let candidate = base.join(href);
        if candidate.is_file() {
            if let Some(modules) = self.modules {
                modules.record_dependency(&candidate);
            }
            return Ok(candidate);
        }

        let modules = self.modules.ok_or_else(|| {
            source.invalid(format!("cannot resolve `{}`: {} does not exist", href, candidate.display()))
        })?;
        let module = modules
            .load_module(href)
            .map_err(|e| source.invalid(format!("cannot resolve `{}`: {}", href, e)))?;
        let path = module
            .resource_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| source.invalid(format!("module `{}` is not a stylesheet", href)))?;
        modules.record_dependency(&path);
        Ok(path)
    }

    fn compile_top_level(
        &mut self,
        source: &Source<'_>,
        root: NodeId,
        precedence: u32,
    ) -> Result<(), CompileError> {
        for child in source.element_children(root) {
            let Some(name) = source.xsl_name(child) else {
                continue;
            };
            match name {
                "import" => {}
                "include" => {
                    let href = source.required(child, "href")?;
                    let resolved = self.resolve_href(source, href)?;
                    if self.loading.contains(&resolved) {
                        return Err(source.invalid(format!("`{}` includes itself", href)));
                    }
                    let doc = Document::parse_file(&resolved, false).map_err(|e| {
                        CompileError::Parse {
                            path: resolved.clone(),
                            source: e,
                        }
                    })?;
                    let included = Source {
                        doc: &doc,
                        path: &resolved,
                    };
                    let included_root = doc
                        .document_element()
                        .filter(|&r| matches!(included.xsl_name(r), Some("stylesheet" | "transform")))
                        .ok_or_else(|| included.invalid("included document is not a stylesheet"))?;

                    self.loading.push(resolved.clone());
                    let result = self
                        .compile_imports(&included, included_root)
                        .and_then(|()| self.compile_top_level(&included, included_root, precedence));
                    self.loading.pop();
                    result?;
                }
                "template" => self.compile_template(source, child, precedence)?,
                "param" | "variable" => {
                    let binding = self.compile_binding(source, child)?;
                    self.globals.push((binding, name == "param"));
                }
                "output" => self.compile_output(source, child)?,
                "strip-space" | "preserve-space" => {}
                other => {
                    return Err(source.invalid(format!("unsupported declaration xsl:{}", other)))
                }
            }
        }
        Ok(())
    }

    fn compile_output(&mut self, source: &Source<'_>, node: NodeId) -> Result<(), CompileError> {
        if let Some(method) = source.doc.attribute(node, "method") {
            self.output.method = Some(match method {
                "xml" => OutputMethod::Xml,
                "html" => OutputMethod::Html,
                "text" => OutputMethod::Text,
                other => return Err(source.invalid(format!("unsupported output method `{}`", other))),
            });
        }
        if let Some(label) = source.doc.attribute(node, "encoding") {
            self.output.encoding = output_charset(label).ok_or_else(|| {
                source.invalid(format!("unknown or unsupported output encoding `{}`", label))
            })?;
        }
        if let Some(omit) = source.doc.attribute(node, "omit-xml-declaration") {
            self.output.omit_xml_declaration = omit == "yes";
        }
        Ok(())
    }

    fn compile_template(
        &mut self,
        source: &Source<'_>,
        node: NodeId,
        precedence: u32,
    ) -> Result<(), CompileError> {
        let name = source.doc.attribute(node, "name").map(str::to_string);
        let pattern = source.optional_expr(node, "match")?;
        if name.is_none() && pattern.is_none() {
            return Err(source.invalid("xsl:template requires `match` or `name`"));
        }
        let explicit_priority = match source.doc.attribute(node, "priority") {
            Some(p) => Some(
                p.trim()
                    .parse::<f64>()
                    .map_err(|_| source.invalid(format!("invalid priority `{}`", p)))?,
            ),
            None => None,
        };
        let mode = source.doc.attribute(node, "mode").map(str::to_string);

        let mut params = Vec::new();
        let mut body_start = 0;
        let children = source.doc.children(node);
        for (i, &child) in children.iter().enumerate() {
            if source.xsl_name(child) == Some("param") {
                params.push(self.compile_binding(source, child)?);
                body_start = i + 1;
            } else if !is_blank_text(source.doc, child) {
                break;
            }
        }
        let body = self.compile_nodes(source, &children[body_start..], false)?;

        let index = self.templates.len();
        self.templates.push(Template {
            name: name.clone(),
            params,
            body,
        });

        if let Some(name) = name {
            let replace = self
                .named
                .get(&name)
                .map_or(true, |&(_, existing)| precedence >= existing);
            if replace {
                self.named.insert(name, (index, precedence));
            }
        }

        if let Some(pattern) = pattern {
            for alternative in split_union(pattern) {
                let priority = explicit_priority.unwrap_or_else(|| default_priority(&alternative));
                let order = self.rules.len();
                self.rules.push(Rule {
                    template: index,
                    pattern: alternative,
                    mode: mode.clone(),
                    priority,
                    precedence,
                    order,
                });
            }
        }
        Ok(())
    }

    fn compile_binding(&mut self, source: &Source<'_>, node: NodeId) -> Result<Binding, CompileError> {
        let name = source.required(node, "name")?.to_string();
        let value = match source.optional_expr(node, "select")? {
            Some(expr) => BindingValue::Select(expr),
            None => {
                let children = source.doc.children(node);
                if children.iter().all(|&c| is_blank_text(source.doc, c)) {
                    BindingValue::Empty
                } else {
                    BindingValue::Content(self.compile_nodes(source, children, false)?)
                }
            }
        };
        Ok(Binding { name, value })
    }

    fn compile_nodes(
        &mut self,
        source: &Source<'_>,
        nodes: &[NodeId],
        keep_whitespace: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        let mut body = Vec::new();
        for &node in nodes {
            match source.doc.kind(node) {
                NodeKind::Text(text) => {
                    if keep_whitespace || !text.trim().is_empty() {
                        body.push(Instruction::Text(text.clone()));
                    }
                }
                NodeKind::Element { .. } => body.push(self.compile_element(source, node)?),
                NodeKind::Root | NodeKind::Attribute { .. } => {}
            }
        }
        Ok(body)
    }

    fn compile_children(
        &mut self,
        source: &Source<'_>,
        node: NodeId,
    ) -> Result<Vec<Instruction>, CompileError> {
        self.compile_nodes(source, source.doc.children(node), false)
    }

    fn compile_element(&mut self, source: &Source<'_>, node: NodeId) -> Result<Instruction, CompileError> {
        let doc = source.doc;
        let Some(name) = source.xsl_name(node) else {
            return self.compile_literal(source, node);
        };

        let instruction = match name {
            "apply-templates" => {
                let (sorts, params) = self.compile_sorts_and_params(source, node)?;
                Instruction::ApplyTemplates {
                    select: source.optional_expr(node, "select")?,
                    mode: doc.attribute(node, "mode").map(str::to_string),
                    sorts,
                    params,
                }
            }
            "call-template" => {
                let (_, params) = self.compile_sorts_and_params(source, node)?;
                Instruction::CallTemplate {
                    name: source.required(node, "name")?.to_string(),
                    params,
                }
            }
            "for-each" => {
                let (sorts, _) = self.compile_sorts_and_params(source, node)?;
                let rest: Vec<NodeId> = doc
                    .children(node)
                    .iter()
                    .copied()
                    .filter(|&c| source.xsl_name(c) != Some("sort"))
                    .collect();
                Instruction::ForEach {
                    select: source.expr(source.required(node, "select")?)?,
                    sorts,
                    body: self.compile_nodes(source, &rest, false)?,
                }
            }
            "value-of" => Instruction::ValueOf {
                select: source.expr(source.required(node, "select")?)?,
            },
            "text" => Instruction::Text(doc.string_value(node)),
            "if" => Instruction::If {
                test: source.expr(source.required(node, "test")?)?,
                body: self.compile_children(source, node)?,
            },
            "choose" => {
                let mut branches = Vec::new();
                let mut otherwise = Vec::new();
                for child in source.element_children(node) {
                    match source.xsl_name(child) {
                        Some("when") => branches.push((
                            source.expr(source.required(child, "test")?)?,
                            self.compile_children(source, child)?,
                        )),
                        Some("otherwise") => otherwise = self.compile_children(source, child)?,
                        _ => return Err(source.invalid("xsl:choose may only contain xsl:when and xsl:otherwise")),
                    }
                }
                if branches.is_empty() {
                    return Err(source.invalid("xsl:choose requires at least one xsl:when"));
                }
                Instruction::Choose {
                    branches,
                    otherwise,
                }
            }
            "variable" | "param" => Instruction::Variable(self.compile_binding(source, node)?),
            "copy" => Instruction::Copy {
                body: self.compile_children(source, node)?,
            },
            "copy-of" => Instruction::CopyOf {
                select: source.expr(source.required(node, "select")?)?,
            },
            "element" => Instruction::Element {
                name: source.avt(source.required(node, "name")?)?,
                body: self.compile_children(source, node)?,
            },
            "attribute" => Instruction::Attribute {
                name: source.avt(source.required(node, "name")?)?,
                body: self.compile_children(source, node)?,
            },
            "message" => Instruction::Message {
                body: self.compile_children(source, node)?,
                terminate: doc.attribute(node, "terminate") == Some("yes"),
            },
            "result-document" => Instruction::ResultDocument {
                href: source.avt(source.required(node, "href")?)?,
                encoding: doc
                    .attribute(node, "encoding")
                    .map(|e| source.avt(e))
                    .transpose()?,
                method: match doc.attribute(node, "method") {
                    None => None,
                    Some("xml") => Some(OutputMethod::Xml),
                    Some("html") => Some(OutputMethod::Html),
                    Some("text") => Some(OutputMethod::Text),
                    Some(other) => {
                        return Err(source.invalid(format!("unsupported output method `{}`", other)))
                    }
                },
                body: self.compile_children(source, node)?,
            },
            other => return Err(source.invalid(format!("unsupported instruction xsl:{}", other))),
        };
        Ok(instruction)
    }

    fn compile_sorts_and_params(
        &mut self,
        source: &Source<'_>,
        node: NodeId,
    ) -> Result<(Vec<Sort>, Vec<Binding>), CompileError> {
        let mut sorts = Vec::new();
        let mut params = Vec::new();
        for child in source.element_children(node) {
            match source.xsl_name(child) {
                Some("sort") => sorts.push(Sort {
                    select: source
                        .optional_expr(child, "select")?
                        .unwrap_or_else(|| Expr::Path {
                            absolute: false,
                            steps: vec![Step {
                                axis: Axis::SelfAxis,
                                test: NodeTest::Node,
                                predicates: Vec::new(),
                            }],
                        }),
                    numeric: source.doc.attribute(child, "data-type") == Some("number"),
                    descending: source.doc.attribute(child, "order") == Some("descending"),
                }),
                Some("with-param") => params.push(self.compile_binding(source, child)?),
                _ => {}
            }
        }
        Ok((sorts, params))
    }

    fn compile_literal(&mut self, source: &Source<'_>, node: NodeId) -> Result<Instruction, CompileError> {
        let doc = source.doc;
        let name = doc.name(node).unwrap_or_default().to_string();

        let mut namespaces: Vec<(String, String)> = match doc.kind(node) {
            NodeKind::Element { namespaces, .. } => namespaces
                .iter()
                .filter(|(_, uri)| uri != XSLT_NAMESPACE)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let prefix = name.split_once(':').map(|(p, _)| p).unwrap_or("");
        if !namespaces.iter().any(|(p, _)| p == prefix) {
            if let Some(uri) = doc.namespace_for_prefix(node, prefix) {
                namespaces.push((prefix.to_string(), uri.to_string()));
            }
        }

        let mut attributes = Vec::new();
        for &attr in doc.attributes(node) {
            if let NodeKind::Attribute { name, value } = doc.kind(attr) {
                if name.starts_with("xsl:") {
                    continue;
                }
                attributes.push((name.clone(), source.avt(value)?));
            }
        }

        Ok(Instruction::LiteralElement {
            name,
            namespaces,
            attributes,
            body: self.compile_children(source, node)?,
        })
    }
}

fn is_blank_text(doc: &Document, node: NodeId) -> bool {
    doc.text(node).is_some_and(|t| t.trim().is_empty())
}

fn split_union(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::Binary(BinaryOp::Union, lhs, rhs) => {
            let mut out = split_union(*lhs);
            out.extend(split_union(*rhs));
            out
        }
        other => vec![other],
    }
}

/// The default priority of a single-alternative pattern.
fn default_priority(pattern: &Expr) -> f64 {
    match pattern {
        Expr::Path {
            absolute: false,
            steps,
        } if steps.len() == 1
            && steps[0].predicates.is_empty()
            && matches!(steps[0].axis, Axis::Child | Axis::Attribute) =>
        {
            match &steps[0].test {
                NodeTest::Name(_) => 0.0,
                NodeTest::AnyInPrefix(_) => -0.25,
                NodeTest::AnyName | NodeTest::Text | NodeTest::Node => -0.5,
            }
        }
        _ => 0.5,
    }
}
