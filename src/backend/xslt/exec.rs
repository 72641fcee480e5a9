//! Stylesheet execution.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

use crate::backend::xml::{Document, NodeId, NodeKind};
use crate::backend::xslt::eval::{matches_pattern, parse_number, Context, EvalError, Scope, Value};
use crate::backend::xslt::result::{BuildError, ResultBuilder, ResultNode};
use crate::backend::xslt::stylesheet::{
    Avt, AvtPart, Binding, BindingValue, Instruction, Rule, Sort, Stylesheet, Template,
};
use crate::backend::xslt::xpath::{Axis, Expr, NodeTest, Step};
use crate::core::output::output_charset;
use crate::core::parameters::{ParamValue, Parameters};
use crate::util::fs::{ensure_parent_dir, resolve_against};
use crate::util::log::Logger;

/// Error raised while executing a stylesheet.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("template nesting exceeded {0} levels")]
    TooDeep(usize),

    #[error("no template named `{0}`")]
    UnknownTemplate(String),

    #[error("invalid element name `{0}`")]
    InvalidName(String),

    #[error("unknown or unsupported output encoding `{0}`")]
    UnknownEncoding(String),

    #[error("terminated by xsl:message: {0}")]
    Terminated(String),

    #[error("failed to write result document {}", .path.display())]
    ResultDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Focus of the instruction being executed.
#[derive(Clone, Copy)]
struct Focus {
    node: NodeId,
    position: usize,
    size: usize,
    current: NodeId,
}

impl Focus {
    fn on(node: NodeId, position: usize, size: usize) -> Self {
        Focus {
            node,
            position,
            size,
            current: node,
        }
    }
}

/// Runs one stylesheet against one source document.
pub struct Executor<'a> {
    sheet: &'a Stylesheet,
    doc: &'a Document,
    base_dir: &'a Path,
    logger: &'a Logger,
    max_depth: usize,
    depth: usize,
    globals: Rc<HashMap<String, Value>>,
}

impl<'a> Executor<'a> {
    pub fn new(
        sheet: &'a Stylesheet,
        doc: &'a Document,
        base_dir: &'a Path,
        logger: &'a Logger,
        max_depth: usize,
    ) -> Self {
        Executor {
            sheet,
            doc,
            base_dir,
            logger,
            max_depth,
            depth: 0,
            globals: Rc::new(HashMap::new()),
        }
    }

    /// Execute the stylesheet and return the serialized primary result.
    pub fn run(mut self, params: &Parameters) -> Result<Vec<u8>, ExecError> {
        self.bind_globals(params)?;

        let mut out = ResultBuilder::new();
        let root = self.doc.root();
        self.apply_templates(&[root], None, &[], &mut out)?;
        Ok(self.sheet.output.to_bytes(&out.finish()))
    }

    fn bind_globals(&mut self, params: &Parameters) -> Result<(), ExecError> {
        let sheet = self.sheet;
        let root = self.doc.root();
        for (binding, is_param) in &sheet.globals {
            let supplied = if *is_param {
                params.get(&binding.name).map(param_value)
            } else {
                None
            };
            let value = match supplied {
                Some(value) => value,
                None => {
                    let mut scope = Scope::new(self.globals.clone());
                    self.binding_value(binding, Focus::on(root, 1, 1), &mut scope)?
                }
            };
            Rc::make_mut(&mut self.globals).insert(binding.name.clone(), value);
        }
        Ok(())
    }

    fn context<'s>(&self, focus: Focus, scope: &'s Scope) -> Context<'s>
    where
        'a: 's,
    {
        Context {
            doc: self.doc,
            node: focus.node,
            position: focus.position,
            size: focus.size,
            current: focus.current,
            scope,
        }
    }

    fn best_template(&self, node: NodeId, mode: Option<&str>) -> Result<Option<&'a Template>, ExecError> {
        let sheet = self.sheet;
        let scope = Scope::new(self.globals.clone());
        let mut best: Option<&Rule> = None;

        for rule in &sheet.rules {
            if rule.mode.as_deref() != mode {
                continue;
            }
            if let Some(current) = best {
                let rank = (rule.precedence, rule.priority);
                let best_rank = (current.precedence, current.priority);
                // Later rules win ties.
                if rank.partial_cmp(&best_rank) == Some(Ordering::Less) {
                    continue;
                }
            }
            if matches_pattern(self.doc, node, &rule.pattern, &scope)? {
                best = Some(rule);
            }
        }
        Ok(best.map(|rule| &sheet.templates[rule.template]))
    }

    fn apply_templates(
        &mut self,
        nodes: &[NodeId],
        mode: Option<&str>,
        params: &[(String, Value)],
        out: &mut ResultBuilder,
    ) -> Result<(), ExecError> {
        let size = nodes.len();
        for (i, &node) in nodes.iter().enumerate() {
            let focus = Focus::on(node, i + 1, size);
            match self.best_template(node, mode)? {
                Some(template) => self.invoke(template, focus, params, out)?,
                None => self.builtin(focus, mode, out)?,
            }
        }
        Ok(())
    }

    fn builtin(&mut self, focus: Focus, mode: Option<&str>, out: &mut ResultBuilder) -> Result<(), ExecError> {
        let doc = self.doc;
        match doc.kind(focus.node) {
            NodeKind::Root | NodeKind::Element { .. } => {
                let children = doc.children(focus.node).to_vec();
                self.apply_templates(&children, mode, &[], out)
            }
            NodeKind::Text(text) => {
                out.text(text);
                Ok(())
            }
            NodeKind::Attribute { value, .. } => {
                out.text(value);
                Ok(())
            }
        }
    }

    fn invoke(
        &mut self,
        template: &'a Template,
        focus: Focus,
        params: &[(String, Value)],
        out: &mut ResultBuilder,
    ) -> Result<(), ExecError> {
        if self.depth >= self.max_depth {
            return Err(ExecError::TooDeep(self.max_depth));
        }
        self.depth += 1;
        let result = self.invoke_body(template, focus, params, out);
        self.depth -= 1;
        result
    }

    fn invoke_body(
        &mut self,
        template: &Template,
        focus: Focus,
        params: &[(String, Value)],
        out: &mut ResultBuilder,
    ) -> Result<(), ExecError> {
        let mut scope = Scope::new(self.globals.clone());
        for param in &template.params {
            let value = match params.iter().find(|(name, _)| *name == param.name) {
                Some((_, value)) => value.clone(),
                None => self.binding_value(param, focus, &mut scope)?,
            };
            scope.bind(param.name.clone(), value);
        }
        self.execute(&template.body, focus, &mut scope, out)
    }

    fn binding_value(&mut self, binding: &Binding, focus: Focus, scope: &mut Scope) -> Result<Value, ExecError> {
        Ok(match &binding.value {
            BindingValue::Select(expr) => self.context(focus, scope).evaluate(expr)?,
            BindingValue::Content(body) => Value::Fragment(Rc::new(self.fragment(body, focus, scope)?)),
            BindingValue::Empty => Value::String(String::new()),
        })
    }

    fn with_params(&mut self, bindings: &[Binding], focus: Focus, scope: &mut Scope) -> Result<Vec<(String, Value)>, ExecError> {
        bindings
            .iter()
            .map(|b| Ok((b.name.clone(), self.binding_value(b, focus, scope)?)))
            .collect()
    }

    /// Execute `body` into a fresh result tree.
    fn fragment(&mut self, body: &[Instruction], focus: Focus, scope: &mut Scope) -> Result<Vec<ResultNode>, ExecError> {
        let mut builder = ResultBuilder::new();
        self.execute(body, focus, scope, &mut builder)?;
        Ok(builder.finish())
    }

    fn fragment_text(&mut self, body: &[Instruction], focus: Focus, scope: &mut Scope) -> Result<String, ExecError> {
        let mut text = String::new();
        for node in self.fragment(body, focus, scope)? {
            node.collect_text(&mut text);
        }
        Ok(text)
    }

    fn avt(&self, avt: &Avt, focus: Focus, scope: &Scope) -> Result<String, ExecError> {
        let ctx = self.context(focus, scope);
        let mut value = String::new();
        for part in &avt.parts {
            match part {
                AvtPart::Literal(text) => value.push_str(text),
                AvtPart::Expr(expr) => value.push_str(&ctx.evaluate_string(expr)?),
            }
        }
        Ok(value)
    }

    fn select_sorted(&self, select: &Expr, sorts: &[Sort], focus: Focus, scope: &Scope) -> Result<Vec<NodeId>, ExecError> {
        let ctx = self.context(focus, scope);
        let nodes = ctx.evaluate_nodes(select)?;
        if sorts.is_empty() {
            return Ok(nodes);
        }

        let size = nodes.len();
        let mut keyed = Vec::with_capacity(size);
        for (i, &node) in nodes.iter().enumerate() {
            let item = ctx.at(node, i + 1, size);
            let item = Context { current: node, ..item };
            let keys = sorts
                .iter()
                .map(|sort| item.evaluate_string(&sort.select))
                .collect::<Result<Vec<_>, _>>()?;
            keyed.push((node, keys));
        }

        keyed.sort_by(|(_, a), (_, b)| {
            for (sort, (x, y)) in sorts.iter().zip(a.iter().zip(b.iter())) {
                let ordering = if sort.numeric {
                    compare_numbers(parse_number(x), parse_number(y))
                } else {
                    x.cmp(y)
                };
                let ordering = if sort.descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(node, _)| node).collect())
    }

    fn execute(
        &mut self,
        body: &[Instruction],
        focus: Focus,
        scope: &mut Scope,
        out: &mut ResultBuilder,
    ) -> Result<(), ExecError> {
        let mark = scope.mark();
        let result = body
            .iter()
            .try_for_each(|instruction| self.instruction(instruction, focus, scope, out));
        scope.truncate(mark);
        result
    }

    fn instruction(
        &mut self,
        instruction: &Instruction,
        focus: Focus,
        scope: &mut Scope,
        out: &mut ResultBuilder,
    ) -> Result<(), ExecError> {
        let doc = self.doc;
        match instruction {
            Instruction::Text(text) => out.text(text),

            Instruction::LiteralElement {
                name,
                namespaces,
                attributes,
                body,
            } => {
                out.start_element(name.as_str());
                for (prefix, uri) in namespaces {
                    out.namespace(prefix, uri);
                }
                for (attr, avt) in attributes {
                    let value = self.avt(avt, focus, scope)?;
                    out.attribute(attr, value)?;
                }
                self.execute(body, focus, scope, out)?;
                out.end_element();
            }

            Instruction::ApplyTemplates {
                select,
                mode,
                sorts,
                params,
            } => {
                let children = Expr::Path {
                    absolute: false,
                    steps: vec![Step {
                        axis: Axis::Child,
                        test: NodeTest::Node,
                        predicates: Vec::new(),
                    }],
                };
                let nodes = self.select_sorted(select.as_ref().unwrap_or(&children), sorts, focus, scope)?;
                let params = self.with_params(params, focus, scope)?;
                self.apply_templates(&nodes, mode.as_deref(), &params, out)?;
            }

            Instruction::CallTemplate { name, params } => {
                let sheet = self.sheet;
                let template = sheet
                    .named
                    .get(name)
                    .map(|&index| &sheet.templates[index])
                    .ok_or_else(|| ExecError::UnknownTemplate(name.clone()))?;
                let params = self.with_params(params, focus, scope)?;
                self.invoke(template, focus, &params, out)?;
            }

            Instruction::ForEach { select, sorts, body } => {
                let nodes = self.select_sorted(select, sorts, focus, scope)?;
                let size = nodes.len();
                for (i, node) in nodes.into_iter().enumerate() {
                    self.execute(body, Focus::on(node, i + 1, size), scope, out)?;
                }
            }

            Instruction::ValueOf { select } => {
                let text = self.context(focus, scope).evaluate_string(select)?;
                out.text(&text);
            }

            Instruction::If { test, body } => {
                if self.context(focus, scope).evaluate_boolean(test)? {
                    self.execute(body, focus, scope, out)?;
                }
            }

            Instruction::Choose { branches, otherwise } => {
                let mut chosen = otherwise;
                for (test, body) in branches {
                    if self.context(focus, scope).evaluate_boolean(test)? {
                        chosen = body;
                        break;
                    }
                }
                self.execute(chosen, focus, scope, out)?;
            }

            Instruction::Variable(binding) => {
                let value = self.binding_value(binding, focus, scope)?;
                scope.bind(binding.name.clone(), value);
            }

            Instruction::Copy { body } => match doc.kind(focus.node) {
                NodeKind::Root => self.execute(body, focus, scope, out)?,
                NodeKind::Element { name, .. } => {
                    out.start_element(name.as_str());
                    self.execute(body, focus, scope, out)?;
                    out.end_element();
                }
                NodeKind::Attribute { name, value } => out.attribute(name, value.clone())?,
                NodeKind::Text(text) => out.text(text),
            },

            Instruction::CopyOf { select } => match self.context(focus, scope).evaluate(select)? {
                Value::NodeSet(nodes) => {
                    for node in nodes {
                        self.copy_node(node, out)?;
                    }
                }
                Value::Fragment(nodes) => {
                    for node in nodes.iter() {
                        out.node(node.clone());
                    }
                }
                other => out.text(&other.to_string_value(doc)),
            },

            Instruction::Element { name, body } => {
                let name = self.avt(name, focus, scope)?;
                if !is_valid_name(&name) {
                    return Err(ExecError::InvalidName(name));
                }
                out.start_element(name);
                self.execute(body, focus, scope, out)?;
                out.end_element();
            }

            Instruction::Attribute { name, body } => {
                let name = self.avt(name, focus, scope)?;
                if !is_valid_name(&name) {
                    return Err(ExecError::InvalidName(name));
                }
                let value = self.fragment_text(body, focus, scope)?;
                out.attribute(&name, value)?;
            }

            Instruction::Message { body, terminate } => {
                let text = self.fragment_text(body, focus, scope)?;
                if *terminate {
                    return Err(ExecError::Terminated(text));
                }
                self.logger.info(format!("xsl:message: {}", text));
            }

            Instruction::ResultDocument {
                href,
                encoding,
                method,
                body,
            } => {
                let href = self.avt(href, focus, scope)?;
                let mut settings = self.sheet.output.clone();
                if let Some(encoding) = encoding {
                    let label = self.avt(encoding, focus, scope)?;
                    settings.encoding =
                        output_charset(&label).ok_or(ExecError::UnknownEncoding(label))?;
                }
                if method.is_some() {
                    settings.method = *method;
                }

                let nodes = self.fragment(body, focus, scope)?;
                let path = resolve_against(self.base_dir, Path::new(&href));
                self.logger.debug(format!("writing result document {}", path.display()));
                ensure_parent_dir(&path)
                    .and_then(|()| fs::write(&path, settings.to_bytes(&nodes)))
                    .map_err(|source| ExecError::ResultDocument { path, source })?;
            }
        }
        Ok(())
    }

    fn copy_node(&self, node: NodeId, out: &mut ResultBuilder) -> Result<(), ExecError> {
        match self.doc.kind(node) {
            NodeKind::Root => {
                for &child in self.doc.children(node) {
                    self.copy_node(child, out)?;
                }
            }
            NodeKind::Element { name, namespaces } => {
                out.start_element(name.as_str());
                for (prefix, uri) in namespaces {
                    out.namespace(prefix, uri);
                }
                for &attr in self.doc.attributes(node) {
                    self.copy_node(attr, out)?;
                }
                for &child in self.doc.children(node) {
                    self.copy_node(child, out)?;
                }
                out.end_element();
            }
            NodeKind::Attribute { name, value } => out.attribute(name, value.clone())?,
            NodeKind::Text(text) => out.text(text),
        }
        Ok(())
    }
}

fn param_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::Boolean(b) => Value::Boolean(*b),
        ParamValue::Integer(i) => Value::Number(*i as f64),
        ParamValue::Float(f) => Value::Number(*f),
        ParamValue::String(s) => Value::String(s.clone()),
    }
}

/// NaN sorts before every number.
fn compare_numbers(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ProjectFixture;

    fn run_with(xsl_body: &str, source: &str, params: &Parameters, base_dir: &Path) -> Result<String, ExecError> {
        let text = format!(
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
                 <xsl:output omit-xml-declaration="yes"/>{}</xsl:stylesheet>"#,
            xsl_body
        );
        let sheet = Stylesheet::compile_str(&text, Path::new("t.xsl"), None).unwrap();
        let doc = Document::parse_with(source, true).unwrap();
        let logger = Logger::new("test");
        let bytes = Executor::new(&sheet, &doc, base_dir, &logger, 64).run(params)?;
        Ok(String::from_utf8(bytes).unwrap())
    }

    fn run(xsl_body: &str, source: &str) -> String {
        run_with(xsl_body, source, &Parameters::new(), Path::new(".")).unwrap()
    }

    const LIBRARY: &str = r#"<library>
        <book year="2005"><title>Beta</title></book>
        <book year="1999"><title>Alpha</title></book>
        <book year="2012"><title>Gamma</title></book>
    </library>"#;

    #[test]
    fn test_builtin_rules_copy_text() {
        assert_eq!(run("", "<a>x<b>y</b>z</a>"), "xyz");
    }

    #[test]
    fn test_apply_templates_and_value_of() {
        let out = run(
            r#"<xsl:template match="/"><ul><xsl:apply-templates select="library/book"/></ul></xsl:template>
               <xsl:template match="book"><li id="y{@year}"><xsl:value-of select="title"/></li></xsl:template>"#,
            LIBRARY,
        );
        assert_eq!(
            out,
            r#"<ul><li id="y2005">Beta</li><li id="y1999">Alpha</li><li id="y2012">Gamma</li></ul>"#
        );
    }

    #[test]
    fn test_conflict_resolution() {
        let out = run(
            r#"<xsl:template match="/"><xsl:apply-templates select="//title"/></xsl:template>
               <xsl:template match="*">any;</xsl:template>
               <xsl:template match="title">title;</xsl:template>
               <xsl:template match="book/title">nested;</xsl:template>
               <xsl:template match="book/title">later;</xsl:template>"#,
            LIBRARY,
        );
        assert_eq!(out, "later;later;later;");
    }

    #[test]
    fn test_sort_and_for_each() {
        let out = run(
            r#"<xsl:template match="/">
                 <xsl:for-each select="//book">
                   <xsl:sort select="@year" data-type="number" order="descending"/>
                   <xsl:value-of select="position()"/>:<xsl:value-of select="title"/><xsl:text> </xsl:text>
                 </xsl:for-each>
               </xsl:template>"#,
            LIBRARY,
        );
        assert_eq!(out, "1:Gamma 2:Beta 3:Alpha ");
    }

    #[test]
    fn test_modes_and_named_templates() {
        let out = run(
            r#"<xsl:template match="/">
                 <xsl:apply-templates select="//book[1]" mode="short"/>
                 <xsl:call-template name="greet"><xsl:with-param name="who" select="'you'"/></xsl:call-template>
               </xsl:template>
               <xsl:template match="book" mode="short">[<xsl:value-of select="@year"/>]</xsl:template>
               <xsl:template name="greet"><xsl:param name="who" select="'nobody'"/>hi <xsl:value-of select="$who"/></xsl:template>"#,
            LIBRARY,
        );
        assert_eq!(out, "[2005]hi you");
    }

    #[test]
    fn test_global_params_are_overridden() {
        let xsl = r#"<xsl:param name="title" select="'default'"/>
                     <xsl:variable name="shout" select="concat($title, '!')"/>
                     <xsl:template match="/"><xsl:value-of select="$shout"/></xsl:template>"#;

        assert_eq!(run(xsl, "<a/>"), "default!");

        let mut params = Parameters::new();
        params.insert("title".into(), ParamValue::from("custom"));
        assert_eq!(run_with(xsl, "<a/>", &params, Path::new(".")).unwrap(), "custom!");
    }

    #[test]
    fn test_variables_choose_and_copy() {
        let out = run(
            r#"<xsl:template match="/">
                 <xsl:variable name="n" select="count(//book)"/>
                 <xsl:choose>
                   <xsl:when test="$n &gt; 5">many</xsl:when>
                   <xsl:otherwise>few</xsl:otherwise>
                 </xsl:choose>
                 <xsl:copy-of select="//book[@year = 1999]"/>
                 <xsl:element name="x-{$n}"><xsl:attribute name="n"><xsl:value-of select="$n"/></xsl:attribute></xsl:element>
               </xsl:template>"#,
            LIBRARY,
        );
        assert_eq!(
            out,
            r#"few<book year="1999"><title>Alpha</title></book><x-3 n="3"/>"#
        );
    }

    #[test]
    fn test_result_fragments() {
        let out = run(
            r#"<xsl:template match="/">
                 <xsl:variable name="frag"><b>bold</b></xsl:variable>
                 <p><xsl:copy-of select="$frag"/>|<xsl:value-of select="$frag"/></p>
               </xsl:template>"#,
            "<a/>",
        );
        assert_eq!(out, "<p><b>bold</b>|bold</p>");
    }

    #[test]
    fn test_message_terminate() {
        let err = run_with(
            r#"<xsl:template match="/"><xsl:message terminate="yes">stop here</xsl:message></xsl:template>"#,
            "<a/>",
            &Parameters::new(),
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Terminated(ref text) if text == "stop here"));
    }

    #[test]
    fn test_unbounded_recursion_is_an_error() {
        let err = run_with(
            r#"<xsl:template match="/"><xsl:call-template name="loop"/></xsl:template>
               <xsl:template name="loop"><xsl:call-template name="loop"/></xsl:template>"#,
            "<a/>",
            &Parameters::new(),
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::TooDeep(64)));
    }

    #[test]
    fn test_result_document_writes_side_file() {
        let project = ProjectFixture::new();
        let out = run_with(
            r#"<xsl:template match="/">
                 <xsl:for-each select="//book">
                   <xsl:result-document href="books/{@year}.txt" method="text">
                     <xsl:value-of select="title"/>
                   </xsl:result-document>
                 </xsl:for-each>
                 <done/>
               </xsl:template>"#,
            LIBRARY,
            &Parameters::new(),
            project.root(),
        )
        .unwrap();

        assert_eq!(out, "<done/>");
        assert_eq!(project.read("books/1999.txt"), "Alpha");
        assert_eq!(project.read("books/2012.txt"), "Gamma");
    }

    #[test]
    fn test_result_document_encoding() {
        let project = ProjectFixture::new();
        run_with(
            r#"<xsl:template match="/">
                 <xsl:result-document href="be.txt" method="text" encoding="UTF-16BE">hi</xsl:result-document>
               </xsl:template>"#,
            "<a/>",
            &Parameters::new(),
            project.root(),
        )
        .unwrap();
        assert_eq!(
            std::fs::read(project.path("be.txt")).unwrap(),
            [0, b'h', 0, b'i']
        );

        let err = run_with(
            r#"<xsl:template match="/">
                 <xsl:result-document href="x.txt" encoding="csiso2022kr">hi</xsl:result-document>
               </xsl:template>"#,
            "<a/>",
            &Parameters::new(),
            project.root(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::UnknownEncoding(ref label) if label == "csiso2022kr"));
    }
}
