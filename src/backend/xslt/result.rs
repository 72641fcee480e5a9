//! Result trees and their serialization.

use encoding_rs::{Encoding, UTF_8};

use crate::backend::xml::{escape_attribute, escape_text};
use crate::core::output::encode_output;

/// A node of a result tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultNode {
    Element {
        name: String,
        /// Attributes and namespace declarations, in insertion order.
        attributes: Vec<(String, String)>,
        children: Vec<ResultNode>,
    },
    Text(String),
}

impl ResultNode {
    pub fn collect_text(&self, out: &mut String) {
        match self {
            ResultNode::Text(t) => out.push_str(t),
            ResultNode::Element { children, .. } => {
                for child in children {
                    child.collect_text(out);
                }
            }
        }
    }
}

/// Error building a result tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("attribute `{0}` created outside an element")]
    AttributeOutsideElement(String),

    #[error("attribute `{0}` created after the element's children")]
    AttributeAfterChildren(String),
}

struct OpenElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<ResultNode>,
}

/// Builds a result tree incrementally.
#[derive(Default)]
pub struct ResultBuilder {
    open: Vec<OpenElement>,
    top: Vec<ResultNode>,
}

impl ResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: ResultNode) {
        let siblings = match self.open.last_mut() {
            Some(parent) => &mut parent.children,
            None => &mut self.top,
        };
        if let (ResultNode::Text(text), Some(ResultNode::Text(last))) = (&node, siblings.last_mut()) {
            last.push_str(text);
            return;
        }
        siblings.push(node);
    }

    pub fn start_element(&mut self, name: impl Into<String>) {
        self.open.push(OpenElement {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        });
    }

    pub fn end_element(&mut self) {
        if let Some(element) = self.open.pop() {
            self.push(ResultNode::Element {
                name: element.name,
                attributes: element.attributes,
                children: element.children,
            });
        }
    }

    /// Add an attribute to the innermost open element, replacing one with
    /// the same name.
    pub fn attribute(&mut self, name: &str, value: String) -> Result<(), BuildError> {
        let element = self
            .open
            .last_mut()
            .ok_or_else(|| BuildError::AttributeOutsideElement(name.to_string()))?;
        if !element.children.is_empty() {
            return Err(BuildError::AttributeAfterChildren(name.to_string()));
        }
        match element.attributes.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value,
            None => element.attributes.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Declare a namespace on the innermost open element unless an open
    /// element already declares the same binding.
    pub fn namespace(&mut self, prefix: &str, uri: &str) {
        let attr = if prefix.is_empty() {
            "xmlns".to_string()
        } else {
            format!("xmlns:{}", prefix)
        };
        let in_scope = self
            .open
            .iter()
            .rev()
            .find_map(|e| e.attributes.iter().find(|(n, _)| *n == attr))
            .map(|(_, v)| v.as_str());
        if in_scope == Some(uri) {
            return;
        }
        if let Some(element) = self.open.last_mut() {
            element.attributes.push((attr, uri.to_string()));
        }
    }

    pub fn text(&mut self, text: &str) {
        if !text.is_empty() {
            self.push(ResultNode::Text(text.to_string()));
        }
    }

    pub fn node(&mut self, node: ResultNode) {
        self.push(node);
    }

    /// Close any open elements and return the tree.
    pub fn finish(mut self) -> Vec<ResultNode> {
        while !self.open.is_empty() {
            self.end_element();
        }
        self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMethod {
    Xml,
    Html,
    Text,
}

/// Serialization settings from `xsl:output`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    /// `None` picks html or xml from the first element.
    pub method: Option<OutputMethod>,
    pub encoding: &'static Encoding,
    pub omit_xml_declaration: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            method: None,
            encoding: UTF_8,
            omit_xml_declaration: false,
        }
    }
}

const HTML_VOID: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "wbr",
];

impl OutputSettings {
    fn effective_method(&self, nodes: &[ResultNode]) -> OutputMethod {
        if let Some(method) = self.method {
            return method;
        }
        let first_element = nodes.iter().find_map(|n| match n {
            ResultNode::Element { name, .. } => Some(name.as_str()),
            ResultNode::Text(t) if t.trim().is_empty() => None,
            ResultNode::Text(_) => Some(""),
        });
        match first_element {
            Some(name) if name.eq_ignore_ascii_case("html") => OutputMethod::Html,
            _ => OutputMethod::Xml,
        }
    }

    /// Serialize a result tree to text.
    pub fn serialize(&self, nodes: &[ResultNode]) -> String {
        let method = self.effective_method(nodes);
        let mut out = String::new();
        match method {
            OutputMethod::Text => {
                for node in nodes {
                    node.collect_text(&mut out);
                }
            }
            OutputMethod::Xml => {
                if !self.omit_xml_declaration {
                    out.push_str(&format!(
                        "<?xml version=\"1.0\" encoding=\"{}\"?>",
                        self.encoding.name()
                    ));
                }
                for node in nodes {
                    write_node(&mut out, node, false, false);
                }
            }
            OutputMethod::Html => {
                for node in nodes {
                    write_node(&mut out, node, true, false);
                }
            }
        }
        out
    }

    /// Serialize and encode a result tree.
    pub fn to_bytes(&self, nodes: &[ResultNode]) -> Vec<u8> {
        let text = self.serialize(nodes);
        encode_output(self.encoding, &text).into_owned()
    }
}

fn write_node(out: &mut String, node: &ResultNode, html: bool, raw_text: bool) {
    match node {
        ResultNode::Text(t) if raw_text => out.push_str(t),
        ResultNode::Text(t) => out.push_str(&escape_text(t)),
        ResultNode::Element {
            name,
            attributes,
            children,
        } => {
            out.push('<');
            out.push_str(name);
            for (attr, value) in attributes {
                out.push(' ');
                out.push_str(attr);
                out.push_str("=\"");
                out.push_str(&escape_attribute(value));
                out.push('"');
            }

            let lower = name.to_ascii_lowercase();
            if html && HTML_VOID.contains(&lower.as_str()) {
                out.push('>');
                return;
            }
            if children.is_empty() && !html {
                out.push_str("/>");
                return;
            }

            out.push('>');
            let raw = html && (lower == "script" || lower == "style");
            for child in children {
                write_node(out, child, html, raw);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
    }
}
