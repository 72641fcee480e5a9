//! XML document model shared by the backends.
//!
//! Documents are parsed with `quick-xml` into an arena. Node ids are indices
//! into the arena and increase in document order; attributes are stored as
//! nodes whose parent is their element and come right after it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use encoding_rs::{Encoding, UTF_8};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

/// Index of a node in its document.
pub type NodeId = usize;

/// Error parsing an XML document.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("document has no root element")]
    NoRootElement,

    #[error("element `{0}` is not closed")]
    Unclosed(String),

    #[error("text content outside the root element")]
    TextOutsideRoot,

    #[error("document has more than one root element")]
    MultipleRoots,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Root,
    Element {
        name: String,
        /// Namespace declarations made on this element, `("", uri)` for the
        /// default namespace.
        namespaces: Vec<(String, String)>,
    },
    Attribute {
        name: String,
        value: String,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: Vec<NodeId>,
}

/// A parsed XML document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
}

impl Document {
    /// Parse a document, keeping whitespace-only text.
    pub fn parse(text: &str) -> Result<Document, XmlError> {
        Self::parse_with(text, false)
    }

    /// Parse a document, optionally dropping whitespace-only text nodes.
    pub fn parse_with(text: &str, strip_whitespace: bool) -> Result<Document, XmlError> {
        let mut reader = Reader::from_str(text);
        let mut doc = Document {
            nodes: vec![NodeData {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
                attributes: Vec::new(),
            }],
        };
        let mut stack: Vec<NodeId> = vec![0];

        let syntax = |reader: &Reader<&[u8]>, e: &dyn std::fmt::Display| XmlError::Syntax {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        };

        loop {
            let event = reader.read_event().map_err(|e| syntax(&reader, &e))?;
            let parent = *stack.last().unwrap_or(&0);
            match event {
                Event::Start(start) => {
                    let id = doc.push_element(parent, &start, reader.buffer_position() as u64)?;
                    stack.push(id);
                }
                Event::Empty(start) => {
                    doc.push_element(parent, &start, reader.buffer_position() as u64)?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(|e| syntax(&reader, &e))?;
                    doc.push_text(parent, text, strip_whitespace)?;
                }
                Event::CData(c) => {
                    let text = String::from_utf8_lossy(&c);
                    doc.push_text(parent, text, false)?;
                }
                Event::Eof => break,
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            }
        }

        if stack.len() > 1 {
            let open = stack[stack.len() - 1];
            return Err(XmlError::Unclosed(doc.name(open).unwrap_or_default().to_string()));
        }
        if doc.document_element().is_none() {
            return Err(XmlError::NoRootElement);
        }
        Ok(doc)
    }

    /// Read and parse a file, decoding it from its declared encoding.
    pub fn parse_file(path: &Path, strip_whitespace: bool) -> Result<Document, XmlError> {
        let bytes = std::fs::read(path).map_err(|source| XmlError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_with(&decode_xml(&bytes), strip_whitespace)
    }

    fn push_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(NodeData {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            attributes: Vec::new(),
        });
        id
    }

    fn push_element(
        &mut self,
        parent: NodeId,
        start: &BytesStart<'_>,
        position: u64,
    ) -> Result<NodeId, XmlError> {
        if parent == 0 && self.document_element().is_some() {
            return Err(XmlError::MultipleRoots);
        }
        let syntax = |e: &dyn std::fmt::Display| XmlError::Syntax {
            position,
            message: e.to_string(),
        };

        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut namespaces = Vec::new();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| syntax(&e))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| syntax(&e))?.into_owned();
            if key == "xmlns" {
                namespaces.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                namespaces.push((prefix.to_string(), value));
            } else {
                attributes.push((key, value));
            }
        }

        let id = self.push_node(parent, NodeKind::Element { name, namespaces });
        self.nodes[parent].children.push(id);
        for (name, value) in attributes {
            let attr = self.push_node(id, NodeKind::Attribute { name, value });
            self.nodes[id].attributes.push(attr);
        }
        Ok(id)
    }

    fn push_text(&mut self, parent: NodeId, text: Cow<'_, str>, strip: bool) -> Result<(), XmlError> {
        let blank = text.trim().is_empty();
        if parent == 0 {
            return if blank { Ok(()) } else { Err(XmlError::TextOutsideRoot) };
        }
        if text.is_empty() || (strip && blank) {
            return Ok(());
        }

        // Merge adjacent text, e.g. text followed by CDATA.
        if let Some(&last) = self.nodes[parent].children.last() {
            if let NodeKind::Text(existing) = &mut self.nodes[last].kind {
                existing.push_str(&text);
                return Ok(());
            }
        }
        let id = self.push_node(parent, NodeKind::Text(text.into_owned()));
        self.nodes[parent].children.push(id);
        Ok(())
    }

    /// The root (document) node.
    pub fn root(&self) -> NodeId {
        0
    }

    /// The single top-level element.
    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[0]
            .children
            .iter()
            .copied()
            .find(|&c| self.is_element(c))
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn attributes(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].attributes
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Element { .. })
    }

    pub fn is_attribute(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Attribute { .. })
    }

    pub fn is_text(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Text(_))
    }

    /// Qualified name of an element or attribute.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } | NodeKind::Attribute { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Name without its prefix.
    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.name(id).map(local_part)
    }

    /// Value of the attribute `name` on element `id`.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id].attributes.iter().find_map(|&a| match &self.nodes[a].kind {
            NodeKind::Attribute { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Text of a text node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The XPath string value of a node.
    pub fn string_value(&self, id: NodeId) -> String {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => t.clone(),
            NodeKind::Attribute { value, .. } => value.clone(),
            NodeKind::Root | NodeKind::Element { .. } => {
                let mut out = String::new();
                self.collect_text(id, &mut out);
                out
            }
        }
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        for &child in &self.nodes[id].children {
            match &self.nodes[child].kind {
                NodeKind::Text(t) => out.push_str(t),
                NodeKind::Element { .. } => self.collect_text(child, out),
                _ => {}
            }
        }
    }

    /// Namespace URI bound to `prefix` in scope at element `id`.
    pub fn namespace_for_prefix(&self, id: NodeId, prefix: &str) -> Option<&str> {
        let mut current = Some(id);
        while let Some(node) = current {
            if let NodeKind::Element { namespaces, .. } = &self.nodes[node].kind {
                if let Some((_, uri)) = namespaces.iter().find(|(p, _)| p == prefix) {
                    return Some(uri);
                }
            }
            current = self.nodes[node].parent;
        }
        None
    }

    /// Namespace URI of an element's name.
    pub fn namespace_uri(&self, id: NodeId) -> Option<&str> {
        let name = self.name(id)?;
        let prefix = name.split_once(':').map(|(p, _)| p).unwrap_or("");
        self.namespace_for_prefix(id, prefix)
    }

    /// Every namespace declaration in scope at element `id`, innermost first.
    pub fn namespaces_in_scope(&self, id: NodeId) -> Vec<(String, String)> {
        let mut seen: Vec<(String, String)> = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if let NodeKind::Element { namespaces, .. } = &self.nodes[node].kind {
                for (prefix, uri) in namespaces {
                    if !seen.iter().any(|(p, _)| p == prefix) {
                        seen.push((prefix.clone(), uri.clone()));
                    }
                }
            }
            current = self.nodes[node].parent;
        }
        seen
    }

    /// All descendants of `id` in document order, excluding attributes.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.push_descendants(id, &mut out);
        out
    }

    fn push_descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &child in &self.nodes[id].children {
            out.push(child);
            self.push_descendants(child, out);
        }
    }

    /// Data model view of the document element.
    pub fn to_view(&self) -> Option<ElementView> {
        self.document_element().map(|id| self.element_view(id))
    }

    fn element_view(&self, id: NodeId) -> ElementView {
        let attributes = self.nodes[id]
            .attributes
            .iter()
            .filter_map(|&a| match &self.nodes[a].kind {
                NodeKind::Attribute { name, value } => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect();
        let mut text = String::new();
        let mut children = Vec::new();
        for &child in &self.nodes[id].children {
            match &self.nodes[child].kind {
                NodeKind::Text(t) => text.push_str(t),
                NodeKind::Element { .. } => children.push(self.element_view(child)),
                _ => {}
            }
        }
        ElementView {
            name: self.name(id).unwrap_or_default().to_string(),
            attributes,
            text,
            children,
        }
    }
}

/// Serializable view of an element, for template data models.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementView {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    /// Concatenated text of the direct text children.
    pub text: String,
    pub children: Vec<ElementView>,
}

/// The part of a qualified name after the prefix.
pub fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, l)| l).unwrap_or(name)
}

/// Decode raw XML bytes using the byte order mark or the encoding declared
/// in the XML declaration, defaulting to UTF-8.
pub fn decode_xml(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    let encoding = declared_encoding(bytes).unwrap_or(UTF_8);
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(200)];
    let head = String::from_utf8_lossy(head);
    let decl = head.strip_prefix("<?xml")?;
    let decl = &decl[..decl.find("?>")?];
    let start = decl.find("encoding")? + "encoding".len();
    let rest = decl[start..].trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value = &rest[1..];
    let label = &value[..value.find(quote)?];
    Encoding::for_label(label.as_bytes())
}

/// Escape text content.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    escape(text, false)
}

/// Escape an attribute value for double quotes.
pub fn escape_attribute(text: &str) -> Cow<'_, str> {
    escape(text, true)
}

fn escape(text: &str, attribute: bool) -> Cow<'_, str> {
    let needs = |c: char| matches!(c, '<' | '>' | '&') || (attribute && matches!(c, '"' | '\n' | '\t'));
    if !text.chars().any(needs) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' if attribute => out.push_str("&quot;"),
            '\n' if attribute => out.push_str("&#10;"),
            '\t' if attribute => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builds_document_order_arena() {
        let doc = Document::parse(r#"<a x="1"><b>hi</b><c/>tail</a>"#).unwrap();
        let a = doc.document_element().unwrap();
        assert_eq!(doc.name(a), Some("a"));
        assert_eq!(doc.attribute(a, "x"), Some("1"));

        let children = doc.children(a);
        assert_eq!(children.len(), 3);
        assert!(children.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(doc.string_value(a), "hitail");
        assert!(doc.attributes(a)[0] > a);
        assert!(doc.attributes(a)[0] < children[0]);
    }

    #[test]
    fn test_whitespace_stripping() {
        let text = "<a>\n  <b> x </b>\n</a>";
        let kept = Document::parse(text).unwrap();
        let stripped = Document::parse_with(text, true).unwrap();

        let a = kept.document_element().unwrap();
        assert_eq!(kept.children(a).len(), 3);
        let a = stripped.document_element().unwrap();
        assert_eq!(stripped.children(a).len(), 1);
        assert_eq!(stripped.string_value(a), " x ");
    }

    #[test]
    fn test_entities_cdata_and_namespaces() {
        let doc = Document::parse(
            r#"<x:a xmlns:x="urn:x" v="&lt;&amp;"><![CDATA[<raw>]]>&#65;</x:a>"#,
        )
        .unwrap();
        let a = doc.document_element().unwrap();
        assert_eq!(doc.attribute(a, "v"), Some("<&"));
        assert_eq!(doc.string_value(a), "<raw>A");
        assert_eq!(doc.namespace_uri(a), Some("urn:x"));
        assert_eq!(doc.local_name(a), Some("a"));
        assert!(doc.attribute(a, "xmlns:x").is_none());
    }

    #[test]
    fn test_malformed_documents_are_rejected() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("<a>").is_err());
        assert!(Document::parse("").is_err());
        assert!(Document::parse("just text").is_err());
        assert!(Document::parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_view() {
        let doc = Document::parse(r#"<a k="v">t<b>u</b></a>"#).unwrap();
        let view = doc.to_view().unwrap();
        assert_eq!(view.name, "a");
        assert_eq!(view.attributes["k"], "v");
        assert_eq!(view.text, "t");
        assert_eq!(view.children[0].text, "u");
    }

    #[test]
    fn test_decode_declared_encoding() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1252
            .encode("<?xml version=\"1.0\" encoding=\"windows-1252\"?><a>caf\u{e9}</a>");
        let text = decode_xml(&bytes);
        assert!(text.contains("caf\u{e9}"));

        let utf8 = decode_xml("<a>\u{e9}</a>".as_bytes());
        assert_eq!(utf8, "<a>\u{e9}</a>");
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_text("a<b&c"), "a&lt;b&amp;c");
        assert_eq!(escape_attribute("\"q\""), "&quot;q&quot;");
        assert!(matches!(escape_text("plain"), Cow::Borrowed(_)));
    }
}
