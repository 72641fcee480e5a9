//! XPath evaluation against a source document.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::backend::xml::{local_part, Document, NodeId, NodeKind};
use crate::backend::xslt::result::ResultNode;
use crate::backend::xslt::xpath::{Axis, BinaryOp, Expr, NodeTest, Step};

/// Error evaluating an XPath expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unknown variable `${0}`")]
    UnknownVariable(String),

    #[error("unknown function `{0}()`")]
    UnknownFunction(String),

    #[error("function `{name}()` expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: &'static str,
        actual: usize,
    },

    #[error("expected a node-set, found {0}")]
    NotANodeSet(&'static str),
}

/// An XPath value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Nodes of the source document, in document order without duplicates.
    NodeSet(Vec<NodeId>),
    String(String),
    Number(f64),
    Boolean(bool),
    /// A result tree fragment built by a variable's content.
    Fragment(Rc<Vec<ResultNode>>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::NodeSet(_) => "node-set",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::Fragment(_) => "result tree fragment",
        }
    }

    pub fn to_string_value(&self, doc: &Document) -> String {
        match self {
            Value::NodeSet(nodes) => nodes
                .first()
                .map(|&n| doc.string_value(n))
                .unwrap_or_default(),
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Boolean(b) => b.to_string(),
            Value::Fragment(nodes) => fragment_text(nodes),
        }
    }

    pub fn to_number(&self, doc: &Document) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            other => parse_number(&other.to_string_value(doc)),
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            Value::NodeSet(nodes) => !nodes.is_empty(),
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Boolean(b) => *b,
            Value::Fragment(_) => true,
        }
    }

    pub fn into_node_set(self) -> Result<Vec<NodeId>, EvalError> {
        match self {
            Value::NodeSet(nodes) => Ok(nodes),
            other => Err(EvalError::NotANodeSet(other.type_name())),
        }
    }
}

fn fragment_text(nodes: &[ResultNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        node.collect_text(&mut out);
    }
    out
}

/// Format a number the way XPath `string()` does.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".into()
        } else {
            "-Infinity".into()
        }
    } else if n == n.trunc() && n.abs() < 1e18 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Parse a string the way XPath `number()` does.
pub fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .strip_prefix('-')
            .unwrap_or(trimmed)
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
        && trimmed.matches('.').count() <= 1
        && trimmed.chars().any(|c| c.is_ascii_digit());
    if valid {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    globals: Rc<HashMap<String, Value>>,
    locals: Vec<(String, Value)>,
}

impl Scope {
    pub fn new(globals: Rc<HashMap<String, Value>>) -> Self {
        Scope {
            globals,
            locals: Vec::new(),
        }
    }

    /// A scope with the same globals and no locals.
    pub fn fresh(&self) -> Self {
        Scope::new(self.globals.clone())
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.push((name.into(), value));
    }

    /// Number of local bindings, for restoring with [`Scope::truncate`].
    pub fn mark(&self) -> usize {
        self.locals.len()
    }

    pub fn truncate(&mut self, mark: usize) {
        self.locals.truncate(mark);
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.globals.get(name))
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.locals.iter().any(|(n, _)| n == name)
    }
}

/// The dynamic context of an evaluation.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub doc: &'a Document,
    pub node: NodeId,
    pub position: usize,
    pub size: usize,
    /// The XSLT current node.
    pub current: NodeId,
    pub scope: &'a Scope,
}

impl<'a> Context<'a> {
    pub fn new(doc: &'a Document, node: NodeId, scope: &'a Scope) -> Self {
        Context {
            doc,
            node,
            position: 1,
            size: 1,
            current: node,
            scope,
        }
    }

    /// The same context focused on `node` at `position` of `size`.
    pub fn at(&self, node: NodeId, position: usize, size: usize) -> Self {
        Context {
            node,
            position,
            size,
            ..*self
        }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(s) => Ok(Value::String(s.clone())),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Variable(name) => self
                .scope
                .lookup(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
            Expr::Negate(inner) => Ok(Value::Number(-self.evaluate(inner)?.to_number(self.doc))),
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Expr::Function(name, args) => self.function(name, args),
            Expr::Path { absolute, steps } => {
                let start = if *absolute {
                    self.doc.root()
                } else {
                    self.node
                };
                self.apply_steps(vec![start], steps).map(Value::NodeSet)
            }
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let value = self.evaluate(primary)?;
                if predicates.is_empty() && steps.is_empty() {
                    return Ok(value);
                }
                let mut nodes = value.into_node_set()?;
                for predicate in predicates {
                    nodes = self.filter(&nodes, predicate)?;
                }
                self.apply_steps(nodes, steps).map(Value::NodeSet)
            }
        }
    }

    pub fn evaluate_string(&self, expr: &Expr) -> Result<String, EvalError> {
        Ok(self.evaluate(expr)?.to_string_value(self.doc))
    }

    pub fn evaluate_boolean(&self, expr: &Expr) -> Result<bool, EvalError> {
        Ok(self.evaluate(expr)?.to_boolean())
    }

    pub fn evaluate_nodes(&self, expr: &Expr) -> Result<Vec<NodeId>, EvalError> {
        self.evaluate(expr)?.into_node_set()
    }

    fn binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Or => Ok(Value::Boolean(
                self.evaluate_boolean(lhs)? || self.evaluate_boolean(rhs)?,
            )),
            BinaryOp::And => Ok(Value::Boolean(
                self.evaluate_boolean(lhs)? && self.evaluate_boolean(rhs)?,
            )),
            BinaryOp::Union => {
                let mut nodes = self.evaluate_nodes(lhs)?;
                nodes.extend(self.evaluate_nodes(rhs)?);
                nodes.sort_unstable();
                nodes.dedup();
                Ok(Value::NodeSet(nodes))
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let l = self.evaluate(lhs)?;
                let r = self.evaluate(rhs)?;
                Ok(Value::Boolean(compare(self.doc, op, &l, &r)))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let l = self.evaluate(lhs)?.to_number(self.doc);
                let r = self.evaluate(rhs)?.to_number(self.doc);
                Ok(Value::Number(match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    _ => l % r,
                }))
            }
        }
    }

    fn apply_steps(&self, mut nodes: Vec<NodeId>, steps: &[Step]) -> Result<Vec<NodeId>, EvalError> {
        for step in steps {
            let mut next = Vec::new();
            for &node in &nodes {
                let mut selected: Vec<NodeId> = axis_nodes(self.doc, node, step.axis)
                    .into_iter()
                    .filter(|&n| matches_test(self.doc, n, step.axis, &step.test))
                    .collect();
                for predicate in &step.predicates {
                    selected = self.filter(&selected, predicate)?;
                }
                next.extend(selected);
            }
            next.sort_unstable();
            next.dedup();
            nodes = next;
        }
        Ok(nodes)
    }

    /// Keep the nodes for which `predicate` holds. Positions follow the
    /// order of `nodes`, which is axis order for steps.
    fn filter(&self, nodes: &[NodeId], predicate: &Expr) -> Result<Vec<NodeId>, EvalError> {
        let size = nodes.len();
        let mut kept = Vec::new();
        for (index, &node) in nodes.iter().enumerate() {
            let position = index + 1;
            let value = self.at(node, position, size).evaluate(predicate)?;
            let keep = match value {
                Value::Number(n) => n == position as f64,
                other => other.to_boolean(),
            };
            if keep {
                kept.push(node);
            }
        }
        Ok(kept)
    }

    fn function(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(EvalError::Arity {
                    name: name.to_string(),
                    expected,
                    actual: args.len(),
                })
            }
        };
        let string_arg = |i: usize| -> Result<String, EvalError> {
            match args.get(i) {
                Some(expr) => self.evaluate_string(expr),
                None => Ok(self.doc.string_value(self.node)),
            }
        };
        let node_arg = |i: usize| -> Result<Option<NodeId>, EvalError> {
            match args.get(i) {
                Some(expr) => Ok(self.evaluate_nodes(expr)?.first().copied()),
                None => Ok(Some(self.node)),
            }
        };
        let number_arg =
            |i: usize| -> Result<f64, EvalError> { Ok(self.evaluate(&args[i])?.to_number(self.doc)) };

        let value = match name {
            "last" => {
                arity("0", args.is_empty())?;
                Value::Number(self.size as f64)
            }
            "position" => {
                arity("0", args.is_empty())?;
                Value::Number(self.position as f64)
            }
            "current" => {
                arity("0", args.is_empty())?;
                Value::NodeSet(vec![self.current])
            }
            "count" => {
                arity("1", args.len() == 1)?;
                Value::Number(self.evaluate_nodes(&args[0])?.len() as f64)
            }
            "sum" => {
                arity("1", args.len() == 1)?;
                let nodes = self.evaluate_nodes(&args[0])?;
                Value::Number(
                    nodes
                        .iter()
                        .map(|&n| parse_number(&self.doc.string_value(n)))
                        .sum(),
                )
            }
            "name" | "local-name" => {
                arity("0 or 1", args.len() <= 1)?;
                let node = node_arg(0)?;
                let qname = node.and_then(|n| self.doc.name(n)).unwrap_or_default();
                let name = if name == "name" { qname } else { local_part(qname) };
                Value::String(name.to_string())
            }
            "generate-id" => {
                arity("0 or 1", args.len() <= 1)?;
                Value::String(node_arg(0)?.map(|n| format!("n{}", n)).unwrap_or_default())
            }
            "string" => {
                arity("0 or 1", args.len() <= 1)?;
                Value::String(string_arg(0)?)
            }
            "concat" => {
                arity("2 or more", args.len() >= 2)?;
                let mut out = String::new();
                for arg in args {
                    out.push_str(&self.evaluate_string(arg)?);
                }
                Value::String(out)
            }
            "contains" | "starts-with" | "ends-with" | "substring-before" | "substring-after" => {
                arity("2", args.len() == 2)?;
                let haystack = string_arg(0)?;
                let needle = string_arg(1)?;
                match name {
                    "contains" => Value::Boolean(haystack.contains(&needle)),
                    "starts-with" => Value::Boolean(haystack.starts_with(&needle)),
                    "ends-with" => Value::Boolean(haystack.ends_with(&needle)),
                    "substring-before" => Value::String(
                        haystack
                            .split_once(needle.as_str())
                            .map(|(before, _)| before.to_string())
                            .unwrap_or_default(),
                    ),
                    _ => Value::String(
                        haystack
                            .split_once(needle.as_str())
                            .map(|(_, after)| after.to_string())
                            .unwrap_or_default(),
                    ),
                }
            }
            "substring" => {
                arity("2 or 3", args.len() == 2 || args.len() == 3)?;
                let s = string_arg(0)?;
                let start = round(number_arg(1)?);
                let end = if args.len() == 3 {
                    start + round(number_arg(2)?)
                } else {
                    f64::INFINITY
                };
                Value::String(
                    s.chars()
                        .enumerate()
                        .filter(|(i, _)| {
                            let p = (*i + 1) as f64;
                            p >= start && p < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            "string-length" => {
                arity("0 or 1", args.len() <= 1)?;
                Value::Number(string_arg(0)?.chars().count() as f64)
            }
            "normalize-space" => {
                arity("0 or 1", args.len() <= 1)?;
                Value::String(
                    string_arg(0)?
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" "),
                )
            }
            "translate" => {
                arity("3", args.len() == 3)?;
                let s = string_arg(0)?;
                let from: Vec<char> = string_arg(1)?.chars().collect();
                let to: Vec<char> = string_arg(2)?.chars().collect();
                Value::String(
                    s.chars()
                        .filter_map(|c| match from.iter().position(|&f| f == c) {
                            Some(i) => to.get(i).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            "upper-case" => {
                arity("1", args.len() == 1)?;
                Value::String(string_arg(0)?.to_uppercase())
            }
            "lower-case" => {
                arity("1", args.len() == 1)?;
                Value::String(string_arg(0)?.to_lowercase())
            }
            "not" => {
                arity("1", args.len() == 1)?;
                Value::Boolean(!self.evaluate_boolean(&args[0])?)
            }
            "true" | "false" => {
                arity("0", args.is_empty())?;
                Value::Boolean(name == "true")
            }
            "boolean" => {
                arity("1", args.len() == 1)?;
                Value::Boolean(self.evaluate_boolean(&args[0])?)
            }
            "number" => {
                arity("0 or 1", args.len() <= 1)?;
                match args.first() {
                    Some(arg) => Value::Number(self.evaluate(arg)?.to_number(self.doc)),
                    None => Value::Number(parse_number(&self.doc.string_value(self.node))),
                }
            }
            "floor" | "ceiling" | "round" => {
                arity("1", args.len() == 1)?;
                let n = number_arg(0)?;
                Value::Number(match name {
                    "floor" => n.floor(),
                    "ceiling" => n.ceil(),
                    _ => round(n),
                })
            }
            other => return Err(EvalError::UnknownFunction(other.to_string())),
        };
        Ok(value)
    }
}

fn round(n: f64) -> f64 {
    if n.is_nan() || n.is_infinite() {
        n
    } else {
        (n + 0.5).floor()
    }
}

fn compare(doc: &Document, op: BinaryOp, l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::NodeSet(a), Value::NodeSet(b)) => a.iter().any(|&x| {
            let xs = doc.string_value(x);
            b.iter().any(|&y| {
                let ys = Value::String(doc.string_value(y));
                compare_atoms(doc, op, &Value::String(xs.clone()), &ys)
            })
        }),
        (Value::NodeSet(nodes), Value::Boolean(_)) => {
            compare_atoms(doc, op, &Value::Boolean(!nodes.is_empty()), r)
        }
        (Value::Boolean(_), Value::NodeSet(nodes)) => {
            compare_atoms(doc, op, l, &Value::Boolean(!nodes.is_empty()))
        }
        (Value::NodeSet(nodes), other) => nodes
            .iter()
            .any(|&n| compare_atoms(doc, op, &Value::String(doc.string_value(n)), other)),
        (other, Value::NodeSet(nodes)) => nodes
            .iter()
            .any(|&n| compare_atoms(doc, op, other, &Value::String(doc.string_value(n)))),
        _ => compare_atoms(doc, op, l, r),
    }
}

fn compare_atoms(doc: &Document, op: BinaryOp, l: &Value, r: &Value) -> bool {
    match op {
        BinaryOp::Eq | BinaryOp::Ne => {
            let equal = if matches!(l, Value::Boolean(_)) || matches!(r, Value::Boolean(_)) {
                l.to_boolean() == r.to_boolean()
            } else if matches!(l, Value::Number(_)) || matches!(r, Value::Number(_)) {
                l.to_number(doc) == r.to_number(doc)
            } else {
                l.to_string_value(doc) == r.to_string_value(doc)
            };
            equal == (op == BinaryOp::Eq)
        }
        _ => {
            let (a, b) = (l.to_number(doc), r.to_number(doc));
            match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            }
        }
    }
}

/// Nodes along `axis` from `node`, in axis order (nearest first for the
/// reverse axes).
fn axis_nodes(doc: &Document, node: NodeId, axis: Axis) -> Vec<NodeId> {
    let is_attr = doc.is_attribute(node);
    match axis {
        Axis::Child => {
            if is_attr {
                Vec::new()
            } else {
                doc.children(node).to_vec()
            }
        }
        Axis::Attribute => doc.attributes(node).to_vec(),
        Axis::SelfAxis => vec![node],
        Axis::Parent => doc.parent(node).into_iter().collect(),
        Axis::Descendant => {
            if is_attr {
                Vec::new()
            } else {
                doc.descendants(node)
            }
        }
        Axis::DescendantOrSelf => {
            let mut out = vec![node];
            if !is_attr {
                out.extend(doc.descendants(node));
            }
            out
        }
        Axis::Ancestor | Axis::AncestorOrSelf => {
            let mut out = Vec::new();
            if axis == Axis::AncestorOrSelf {
                out.push(node);
            }
            let mut current = doc.parent(node);
            while let Some(parent) = current {
                out.push(parent);
                current = doc.parent(parent);
            }
            out
        }
        Axis::FollowingSibling | Axis::PrecedingSibling => {
            if is_attr {
                return Vec::new();
            }
            let Some(parent) = doc.parent(node) else {
                return Vec::new();
            };
            let siblings = doc.children(parent);
            let index = siblings.iter().position(|&s| s == node).unwrap_or(0);
            if axis == Axis::FollowingSibling {
                siblings[index + 1..].to_vec()
            } else {
                siblings[..index].iter().rev().copied().collect()
            }
        }
    }
}

fn matches_test(doc: &Document, node: NodeId, axis: Axis, test: &NodeTest) -> bool {
    // The principal node type of the attribute axis is attribute; of every
    // other axis, element.
    let principal = if axis == Axis::Attribute {
        doc.is_attribute(node)
    } else {
        doc.is_element(node)
    };
    match test {
        NodeTest::Node => true,
        NodeTest::Text => doc.is_text(node),
        NodeTest::AnyName => principal,
        NodeTest::AnyInPrefix(prefix) => {
            principal
                && doc
                    .name(node)
                    .and_then(|n| n.split_once(':'))
                    .is_some_and(|(p, _)| p == prefix)
        }
        NodeTest::Name(name) => principal && doc.name(node) == Some(name.as_str()),
    }
}

/// Whether `node` matches a pattern written as a location path.
///
/// A node matches when it is selected by the path evaluated from the node
/// itself or one of its ancestors.
pub fn matches_pattern(
    doc: &Document,
    node: NodeId,
    pattern: &Expr,
    scope: &Scope,
) -> Result<bool, EvalError> {
    if let Expr::Path {
        absolute: true,
        steps,
    } = pattern
    {
        if steps.is_empty() {
            return Ok(node == doc.root());
        }
    }

    let mut candidate = Some(node);
    while let Some(context) = candidate {
        let selected = Context::new(doc, context, scope).evaluate(pattern)?;
        if let Value::NodeSet(nodes) = selected {
            if nodes.binary_search(&node).is_ok() {
                return Ok(true);
            }
        }
        if matches!(pattern, Expr::Path { absolute: true, .. }) {
            return Ok(false);
        }
        candidate = doc.parent(context);
    }
    Ok(false)
}

/// Whether the node is the root node.
pub fn is_root(doc: &Document, node: NodeId) -> bool {
    matches!(doc.kind(node), NodeKind::Root)
}
