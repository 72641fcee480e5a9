//! XPath expression syntax: tokenizer, parser and AST.
//!
//! Covers the XPath 1.0 subset stylesheets use in practice: location paths
//! over the child, descendant, parent, ancestor, self, attribute and sibling
//! axes with their abbreviations, predicates, variables, literals, the usual
//! operators and function calls.

use std::fmt;

use thiserror::Error;

/// Error parsing an XPath expression.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid XPath expression `{expr}`: {message}")]
pub struct XPathSyntaxError {
    pub expr: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    SelfAxis,
    Attribute,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    fn from_name(name: &str) -> Option<Axis> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "self" => Axis::SelfAxis,
            "attribute" => Axis::Attribute,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeTest {
    /// A qualified name.
    Name(String),
    /// `*`
    AnyName,
    /// `prefix:*`
    AnyInPrefix(String),
    /// `text()`
    Text,
    /// `node()`
    Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Step {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Union,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Literal(String),
    Number(f64),
    Variable(String),
    Function(String, Vec<Expr>),
    /// A location path; `absolute` paths start at the root node.
    Path { absolute: bool, steps: Vec<Step> },
    /// A primary expression filtered by predicates and followed by steps.
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
}

impl Expr {
    pub fn parse(text: &str) -> Result<Expr, XPathSyntaxError> {
        let error = |message: String| XPathSyntaxError {
            expr: text.to_string(),
            message,
        };
        let tokens = tokenize(text).map_err(error)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr().map_err(error)?;
        match parser.peek() {
            None => Ok(expr),
            Some(t) => Err(error(format!("unexpected {}", t))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    DotDot,
    At,
    Comma,
    ColonColon,
    Slash,
    DoubleSlash,
    Pipe,
    Plus,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `*` as a name test.
    Star,
    Multiply,
    And,
    Or,
    Div,
    Mod,
    Literal(String),
    Number(f64),
    Variable(String),
    /// A QName, NCName or `prefix:*`.
    Name(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Literal(s) => write!(f, "literal '{}'", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Variable(v) => write!(f, "${}", v),
            Token::Name(n) => write!(f, "`{}`", n),
            other => write!(f, "{:?}", other),
        }
    }
}

impl Token {
    fn is_operator(&self) -> bool {
        matches!(
            self,
            Token::And
                | Token::Or
                | Token::Mod
                | Token::Div
                | Token::Multiply
                | Token::Slash
                | Token::DoubleSlash
                | Token::Pipe
                | Token::Plus
                | Token::Minus
                | Token::Eq
                | Token::Ne
                | Token::Lt
                | Token::Le
                | Token::Gt
                | Token::Ge
        )
    }

    /// Whether a following `*` or operator name is an operator.
    fn precedes_operator(&self) -> bool {
        !(self.is_operator()
            || matches!(
                self,
                Token::At | Token::ColonColon | Token::LParen | Token::LBracket | Token::Comma
            ))
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    let read_ncname = |i: &mut usize| -> String {
        let start = *i;
        while *i < chars.len() && is_name_char(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let operator_context = tokens.last().is_some_and(Token::precedes_operator);

        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '@' => Token::At,
            ',' => Token::Comma,
            '|' => Token::Pipe,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '=' => Token::Eq,
            ':' if next == Some(':') => {
                i += 2;
                tokens.push(Token::ColonColon);
                continue;
            }
            '!' if next == Some('=') => {
                i += 2;
                tokens.push(Token::Ne);
                continue;
            }
            '<' | '>' => {
                let token = match (c, next == Some('=')) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    (_, true) => Token::Ge,
                    (_, false) => Token::Gt,
                };
                i += if next == Some('=') { 2 } else { 1 };
                tokens.push(token);
                continue;
            }
            '/' => {
                if next == Some('/') {
                    i += 2;
                    tokens.push(Token::DoubleSlash);
                } else {
                    i += 1;
                    tokens.push(Token::Slash);
                }
                continue;
            }
            '*' => {
                if operator_context {
                    Token::Multiply
                } else {
                    Token::Star
                }
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                let literal: String = chars[i + 1..i + 1 + end].iter().collect();
                i += end + 2;
                tokens.push(Token::Literal(literal));
                continue;
            }
            '.' if next == Some('.') => {
                i += 2;
                tokens.push(Token::DotDot);
                continue;
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{}`", literal))?;
                tokens.push(Token::Number(value));
                continue;
            }
            '.' => Token::Dot,
            '$' => {
                i += 1;
                if i >= chars.len() || !is_name_start(chars[i]) {
                    return Err("expected a variable name after `$`".into());
                }
                let mut name = read_ncname(&mut i);
                if i + 1 < chars.len() && chars[i] == ':' && is_name_start(chars[i + 1]) {
                    i += 1;
                    name.push(':');
                    name.push_str(&read_ncname(&mut i));
                }
                tokens.push(Token::Variable(name));
                continue;
            }
            c if is_name_start(c) => {
                let mut name = read_ncname(&mut i);
                if operator_context {
                    let op = match name.as_str() {
                        "and" => Some(Token::And),
                        "or" => Some(Token::Or),
                        "div" => Some(Token::Div),
                        "mod" => Some(Token::Mod),
                        _ => None,
                    };
                    if let Some(op) = op {
                        tokens.push(op);
                        continue;
                    }
                }
                if i + 1 < chars.len() && chars[i] == ':' && chars[i + 1] != ':' {
                    if chars[i + 1] == '*' {
                        i += 2;
                        name.push_str(":*");
                    } else if is_name_start(chars[i + 1]) {
                        i += 1;
                        name.push(':');
                        name.push_str(&read_ncname(&mut i));
                    }
                }
                tokens.push(Token::Name(name));
                continue;
            }
            other => return Err(format!("unexpected character `{}`", other)),
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> ParseResult<()> {
        match self.advance() {
            Some(ref t) if t == token => Ok(()),
            Some(t) => Err(format!("expected {}, found {}", token, t)),
            None => Err(format!("expected {}, found end of expression", token)),
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Parser) -> ParseResult<Expr>,
    ) -> ParseResult<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[(Token::Or, BinaryOp::Or)], Parser::and_expr)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[(Token::And, BinaryOp::And)], Parser::equality_expr)
    }

    fn equality_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Parser::relational_expr,
        )
    }

    fn relational_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[
                (Token::Lt, BinaryOp::Lt),
                (Token::Le, BinaryOp::Le),
                (Token::Gt, BinaryOp::Gt),
                (Token::Ge, BinaryOp::Ge),
            ],
            Parser::additive_expr,
        )
    }

    fn additive_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Parser::multiplicative_expr,
        )
    }

    fn multiplicative_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[
                (Token::Multiply, BinaryOp::Mul),
                (Token::Div, BinaryOp::Div),
                (Token::Mod, BinaryOp::Mod),
            ],
            Parser::unary_expr,
        )
    }

    fn unary_expr(&mut self) -> ParseResult<Expr> {
        if self.eat(&Token::Minus) {
            Ok(Expr::Negate(Box::new(self.unary_expr()?)))
        } else {
            self.union_expr()
        }
    }

    fn union_expr(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[(Token::Pipe, BinaryOp::Union)], Parser::path_expr)
    }

    fn starts_primary(&self) -> bool {
        match self.peek() {
            Some(Token::Variable(_) | Token::LParen | Token::Literal(_) | Token::Number(_)) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen) && !is_node_type(name)
            }
            _ => false,
        }
    }

    fn path_expr(&mut self) -> ParseResult<Expr> {
        if !self.starts_primary() {
            return self.location_path();
        }

        let primary = self.primary_expr()?;
        let predicates = self.predicates()?;
        let mut steps = Vec::new();
        self.trailing_steps(&mut steps)?;

        if predicates.is_empty() && steps.is_empty() {
            Ok(primary)
        } else {
            Ok(Expr::Filter {
                primary: Box::new(primary),
                predicates,
                steps,
            })
        }
    }

    fn trailing_steps(&mut self, steps: &mut Vec<Step>) -> ParseResult<()> {
        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.step()?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.step()?);
            } else {
                return Ok(());
            }
        }
    }

    fn primary_expr(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            Some(Token::Variable(name)) => Ok(Expr::Variable(name)),
            Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Name(name)) => {
                self.expect(&Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Expr::Function(name, args))
            }
            Some(t) => Err(format!("unexpected {}", t)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn predicates(&mut self) -> ParseResult<Vec<Expr>> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.or_expr()?);
            self.expect(&Token::RBracket)?;
        }
        Ok(predicates)
    }

    fn location_path(&mut self) -> ParseResult<Expr> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                if !self.starts_step() {
                    return Ok(Expr::Path {
                        absolute: true,
                        steps,
                    });
                }
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                true
            }
            _ => false,
        };

        steps.push(self.step()?);
        self.trailing_steps(&mut steps)?;
        Ok(Expr::Path { absolute, steps })
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn step(&mut self) -> ParseResult<Step> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let (Some(Token::Name(name)), Some(Token::ColonColon)) =
            (self.peek(), self.peek_at(1))
        {
            let axis =
                Axis::from_name(name).ok_or_else(|| format!("unsupported axis `{}`", name))?;
            self.pos += 2;
            axis
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Some(Token::Star) => NodeTest::AnyName,
            Some(Token::Name(name)) if self.peek() == Some(&Token::LParen) && is_node_type(&name) => {
                self.pos += 1;
                self.expect(&Token::RParen)?;
                match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    other => return Err(format!("unsupported node type test `{}()`", other)),
                }
            }
            Some(Token::Name(name)) => match name.strip_suffix(":*") {
                Some(prefix) => NodeTest::AnyInPrefix(prefix.to_string()),
                None => NodeTest::Name(name),
            },
            Some(t) => return Err(format!("expected a node test, found {}", t)),
            None => return Err("expected a node test, found end of expression".into()),
        };

        let predicates = self.predicates()?;
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(name, "text" | "node" | "comment" | "processing-instruction")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(absolute: bool, steps: Vec<Step>) -> Expr {
        Expr::Path { absolute, steps }
    }

    fn child(name: &str) -> Step {
        Step {
            axis: Axis::Child,
            test: NodeTest::Name(name.into()),
            predicates: vec![],
        }
    }

    #[test]
    fn test_simple_paths() {
        assert_eq!(
            Expr::parse("a/b").unwrap(),
            path(false, vec![child("a"), child("b")])
        );
        assert_eq!(Expr::parse("/").unwrap(), path(true, vec![]));
        assert_eq!(
            Expr::parse("//a").unwrap(),
            path(true, vec![Step::descendant_or_self(), child("a")])
        );
    }

    #[test]
    fn test_abbreviations() {
        let expr = Expr::parse("../@id").unwrap();
        match expr {
            Expr::Path { absolute, steps } => {
                assert!(!absolute);
                assert_eq!(steps[0].axis, Axis::Parent);
                assert_eq!(steps[1].axis, Axis::Attribute);
                assert_eq!(steps[1].test, NodeTest::Name("id".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_star_disambiguation() {
        // `*` after an operand is multiplication; elsewhere a name test.
        let expr = Expr::parse("2 * 3").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Mul, _, _)));

        let expr = Expr::parse("*").unwrap();
        assert!(matches!(&expr, Expr::Path { steps, .. } if steps[0].test == NodeTest::AnyName));

        let expr = Expr::parse("count(*) * 2").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn test_operator_names_as_element_names() {
        let expr = Expr::parse("div and mod").unwrap();
        match expr {
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                assert_eq!(*lhs, path(false, vec![child("div")]));
                assert_eq!(*rhs, path(false, vec![child("mod")]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = Expr::parse("1 + 2 * 3 = 7 or false()").unwrap();
        match expr {
            Expr::Binary(BinaryOp::Or, lhs, _) => {
                assert!(matches!(*lhs, Expr::Binary(BinaryOp::Eq, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_expression_and_predicates() {
        let expr = Expr::parse("$items[2]/name").unwrap();
        match expr {
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                assert_eq!(*primary, Expr::Variable("items".into()));
                assert_eq!(predicates, vec![Expr::Number(2.0)]);
                assert_eq!(steps, vec![child("name")]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let expr = Expr::parse("item[@type='a'][last()]").unwrap();
        match expr {
            Expr::Path { steps, .. } => assert_eq!(steps[0].predicates.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_axes_and_node_types() {
        let expr = Expr::parse("ancestor-or-self::node()/following-sibling::text()").unwrap();
        match expr {
            Expr::Path { steps, .. } => {
                assert_eq!(steps[0].axis, Axis::AncestorOrSelf);
                assert_eq!(steps[0].test, NodeTest::Node);
                assert_eq!(steps[1].axis, Axis::FollowingSibling);
                assert_eq!(steps[1].test, NodeTest::Text);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(Expr::parse("x:*").is_ok());
        assert!(Expr::parse("namespace::x").is_err());
    }

    #[test]
    fn test_errors() {
        assert!(Expr::parse("'unterminated").is_err());
        assert!(Expr::parse("a[").is_err());
        assert!(Expr::parse("concat(1,").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("#").is_err());
    }

    #[test]
    fn test_negative_numbers_and_subtraction() {
        assert!(matches!(
            Expr::parse("-1").unwrap(),
            Expr::Negate(_)
        ));
        assert!(matches!(
            Expr::parse("5 - 1").unwrap(),
            Expr::Binary(BinaryOp::Sub, _, _)
        ));
        assert!(matches!(
            Expr::parse(".5").unwrap(),
            Expr::Number(n) if n == 0.5
        ));
    }
}
