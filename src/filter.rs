//! Subscriber filters.
//!
//! Subscribers hand the broadcaster XPath expressions; an event is forwarded
//! to them if any expression selects something in it. Full XPath 1.0 is not
//! required by any known peer, so [`XPathCompiler`] implements the subset
//! seen in practice:
//!
//! * location paths: `/a/b`, `//b`, `a//b`, `.`, `..`, `*`, `@attr`, `@*`,
//!   `text()`, `node()`; namespace prefixes on name tests are ignored
//! * predicates: `[expr]`, positional `[n]`
//! * operators: `or`, `and`, `=`, `!=`, `<`, `<=`, `>`, `>=`
//! * functions: `contains`, `starts-with`, `not`, `count`, `string`,
//!   `number`, `normalize-space`, `true`, `false`
//!
//! Other backends can be plugged in through [`FilterCompiler`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use roxmltree::{Document, Node, NodeId};

use crate::document::XmlDocument;
use crate::types::FilterError;

/// A compiled filter.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// Source text the filter was compiled from.
    fn expression(&self) -> &str;

    /// Does the filter select anything in `doc`?
    fn matches(&self, doc: &XmlDocument) -> Result<bool, FilterError>;
}

/// Compiles filter source text into predicates.
pub trait FilterCompiler: Send + Sync {
    fn compile(&self, expr: &str) -> Result<Arc<dyn Predicate>, FilterError>;
}

/// Built-in XPath-subset compiler.
#[derive(Debug, Default, Clone, Copy)]
pub struct XPathCompiler;

impl FilterCompiler for XPathCompiler {
    fn compile(&self, expr: &str) -> Result<Arc<dyn Predicate>, FilterError> {
        Ok(Arc::new(XPathFilter::compile(expr)?))
    }
}

/// A compiled XPath-subset expression.
#[derive(Debug, Clone)]
pub struct XPathFilter {
    source: String,
    expr: Expr,
}

impl XPathFilter {
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        let syntax = |reason: String| FilterError::Syntax {
            expr: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(syntax)?;
        if tokens.is_empty() {
            return Err(syntax("empty expression".into()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            nodes: 0,
        };
        let expr = parser.parse_or().map_err(syntax)?;
        if let Some(tok) = parser.peek() {
            return Err(syntax(format!("unexpected trailing {tok:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against an already-parsed tree.
    pub fn matches_tree(&self, doc: &Document<'_>) -> bool {
        let ctx = Context {
            node: doc.root(),
            position: 1,
        };
        eval(&self.expr, &ctx).truthy()
    }
}

impl Predicate for XPathFilter {
    fn expression(&self) -> &str {
        &self.source
    }

    fn matches(&self, doc: &XmlDocument) -> Result<bool, FilterError> {
        Ok(doc.with_tree(|tree| self.matches_tree(tree)))
    }
}

// ---------------------------------------------------------------------------
// Lexing

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Star,
    Dot,
    DotDot,
    Op(CmpOp),
    Name(String),
    Str(String),
    Num(f64),
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '.' if next == Some('.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number {text:?}"))?;
                tokens.push(Token::Num(value));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '-' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number {text:?}"))?;
                tokens.push(Token::Num(value));
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parsing

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn flipped(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            same => same,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Contains,
    StartsWith,
    Not,
    Count,
    String,
    Number,
    NormalizeSpace,
    True,
    False,
}

impl Func {
    fn lookup(name: &str) -> Option<(Func, usize)> {
        Some(match name {
            "contains" => (Func::Contains, 2),
            "starts-with" => (Func::StartsWith, 2),
            "not" => (Func::Not, 1),
            "count" => (Func::Count, 1),
            "string" => (Func::String, 1),
            "number" => (Func::Number, 1),
            "normalize-space" => (Func::NormalizeSpace, 1),
            "true" => (Func::True, 0),
            "false" => (Func::False, 0),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    /// Element by local name; `None` is `*`.
    Element(Option<String>),
    Attribute(Option<String>),
    Text,
    AnyNode,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone)]
struct Path {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Literal(String),
    Number(f64),
    Call(Func, Vec<Expr>),
    Path(Path),
}

fn local_part(name: &str) -> String {
    name.rsplit(':').next().unwrap_or(name).to_string()
}

/// Nesting allowed for parentheses, predicates and call arguments.
const MAX_DEPTH: usize = 64;
/// Steps, operators and calls allowed in one expression.
const MAX_NODES: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    nodes: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(format!("expected {want:?}, found {tok:?}")),
            None => Err(format!("expected {want:?}, found end of expression")),
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == word)
    }

    fn charge(&mut self) -> Result<(), String> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(format!("expression has more than {MAX_NODES} terms"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("expression nests deeper than {MAX_DEPTH}"));
        }
        self.depth += 1;
        let parsed = self.parse_or_inner();
        self.depth -= 1;
        parsed
    }

    fn parse_or_inner(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.at_keyword("or") {
            self.pos += 1;
            self.charge()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_cmp()?;
        while self.at_keyword("and") {
            self.pos += 1;
            self.charge()?;
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            self.charge()?;
            let rhs = self.parse_primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Expr::Literal(s))
            }
            Some(Token::Num(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name))
                if self.peek_at(1) == Some(&Token::LParen) && name != "text" && name != "node" =>
            {
                self.parse_call(&name)
            }
            Some(_) => self.parse_path().map(Expr::Path),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, String> {
        let (func, arity) = Func::lookup(name).ok_or_else(|| format!("unsupported function {name}()"))?;
        self.charge()?;
        self.pos += 1;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != arity {
            return Err(format!("{name}() takes {arity} argument(s), got {}", args.len()));
        }
        Ok(Expr::Call(func, args))
    }

    fn parse_path(&mut self) -> Result<Path, String> {
        let mut absolute = false;
        let mut axis = Axis::Child;
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                absolute = true;
                if !self.step_follows() {
                    return Ok(Path {
                        absolute,
                        steps: Vec::new(),
                    });
                }
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                absolute = true;
                axis = Axis::Descendant;
            }
            _ => {}
        }

        let mut steps = vec![self.parse_step(axis)?];
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step(Axis::Child)?);
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(self.parse_step(Axis::Descendant)?);
                }
                _ => break,
            }
        }
        Ok(Path { absolute, steps })
    }

    fn step_follows(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Name(_) | Token::Star | Token::At | Token::Dot | Token::DotDot)
        )
    }

    fn parse_step(&mut self, axis: Axis) -> Result<Step, String> {
        self.charge()?;
        let test = match self.next() {
            Some(Token::At) => match self.next() {
                Some(Token::Star) => NodeTest::Attribute(None),
                Some(Token::Name(n)) => NodeTest::Attribute(Some(local_part(&n))),
                other => return Err(format!("expected attribute name, found {other:?}")),
            },
            Some(Token::Dot) => NodeTest::SelfNode,
            Some(Token::DotDot) => NodeTest::Parent,
            Some(Token::Star) => NodeTest::Element(None),
            Some(Token::Name(n)) if (n == "text" || n == "node") && self.peek() == Some(&Token::LParen) => {
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                if n == "text" {
                    NodeTest::Text
                } else {
                    NodeTest::AnyNode
                }
            }
            Some(Token::Name(n)) => NodeTest::Element(Some(local_part(&n))),
            other => return Err(format!("expected location step, found {other:?}")),
        };

        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            self.charge()?;
            predicates.push(self.parse_or()?);
            self.expect(Token::RBracket)?;
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone)]
enum Item<'a, 'i> {
    Node(Node<'a, 'i>),
    Attr(String),
}

impl Item<'_, '_> {
    fn string_value(&self) -> String {
        match self {
            Item::Node(node) => node_string(*node),
            Item::Attr(value) => value.clone(),
        }
    }
}

fn node_string(node: Node<'_, '_>) -> String {
    if node.is_text() {
        return node.text().unwrap_or_default().to_string();
    }
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

#[derive(Debug, Clone)]
enum Value<'a, 'i> {
    Nodes(Vec<Item<'a, 'i>>),
    Str(String),
    Num(f64),
    Bool(bool),
}

fn str_to_num(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(f64::NAN)
}

impl Value<'_, '_> {
    fn truthy(&self) -> bool {
        match self {
            Value::Nodes(items) => !items.is_empty(),
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }

    fn string(&self) -> String {
        match self {
            Value::Nodes(items) => items.first().map(Item::string_value).unwrap_or_default(),
            Value::Str(s) => s.clone(),
            Value::Num(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
            Value::Num(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn number(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            other => str_to_num(&other.string()),
        }
    }
}

#[derive(Debug, Clone)]
enum Atom {
    Str(String),
    Num(f64),
    Bool(bool),
}

fn compare_atoms(op: CmpOp, a: &Atom, b: &Atom) -> bool {
    fn as_num(a: &Atom) -> f64 {
        match a {
            Atom::Num(n) => *n,
            Atom::Str(s) => str_to_num(s),
            Atom::Bool(b) => f64::from(u8::from(*b)),
        }
    }
    fn as_bool(a: &Atom) -> bool {
        match a {
            Atom::Num(n) => *n != 0.0 && !n.is_nan(),
            Atom::Str(s) => !s.is_empty(),
            Atom::Bool(b) => *b,
        }
    }

    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (a, b) {
                (Atom::Bool(_), _) | (_, Atom::Bool(_)) => as_bool(a) == as_bool(b),
                (Atom::Num(_), _) | (_, Atom::Num(_)) => as_num(a) == as_num(b),
                (Atom::Str(x), Atom::Str(y)) => x == y,
            };
            equal == (op == CmpOp::Eq)
        }
        CmpOp::Lt => as_num(a) < as_num(b),
        CmpOp::Le => as_num(a) <= as_num(b),
        CmpOp::Gt => as_num(a) > as_num(b),
        CmpOp::Ge => as_num(a) >= as_num(b),
    }
}

fn compare(op: CmpOp, lhs: &Value<'_, '_>, rhs: &Value<'_, '_>) -> bool {
    match (lhs, rhs) {
        (Value::Nodes(xs), Value::Nodes(ys)) => xs.iter().any(|x| {
            let x = Atom::Str(x.string_value());
            ys.iter()
                .any(|y| compare_atoms(op, &x, &Atom::Str(y.string_value())))
        }),
        (Value::Nodes(xs), Value::Bool(b)) => {
            compare_atoms(op, &Atom::Bool(!xs.is_empty()), &Atom::Bool(*b))
        }
        (Value::Nodes(xs), Value::Num(n)) => xs
            .iter()
            .any(|x| compare_atoms(op, &Atom::Num(str_to_num(&x.string_value())), &Atom::Num(*n))),
        (Value::Nodes(xs), Value::Str(s)) => xs
            .iter()
            .any(|x| compare_atoms(op, &Atom::Str(x.string_value()), &Atom::Str(s.clone()))),
        (_, Value::Nodes(_)) => compare(op.flipped(), rhs, lhs),
        (a, b) => compare_atoms(op, &atom(a), &atom(b)),
    }
}

fn atom(value: &Value<'_, '_>) -> Atom {
    match value {
        Value::Str(s) => Atom::Str(s.clone()),
        Value::Num(n) => Atom::Num(*n),
        Value::Bool(b) => Atom::Bool(*b),
        Value::Nodes(_) => Atom::Str(value.string()),
    }
}

struct Context<'a, 'i> {
    node: Node<'a, 'i>,
    position: usize,
}

fn eval<'a, 'i>(expr: &Expr, ctx: &Context<'a, 'i>) -> Value<'a, 'i> {
    match expr {
        Expr::Or(a, b) => Value::Bool(eval(a, ctx).truthy() || eval(b, ctx).truthy()),
        Expr::And(a, b) => Value::Bool(eval(a, ctx).truthy() && eval(b, ctx).truthy()),
        Expr::Cmp(op, a, b) => Value::Bool(compare(*op, &eval(a, ctx), &eval(b, ctx))),
        Expr::Literal(s) => Value::Str(s.clone()),
        Expr::Number(n) => Value::Num(*n),
        Expr::Call(func, args) => call(*func, args, ctx),
        Expr::Path(path) => Value::Nodes(eval_path(path, ctx)),
    }
}

fn call<'a, 'i>(func: Func, args: &[Expr], ctx: &Context<'a, 'i>) -> Value<'a, 'i> {
    let arg = |i: usize| eval(&args[i], ctx);
    match func {
        Func::Contains => Value::Bool(arg(0).string().contains(&arg(1).string())),
        Func::StartsWith => Value::Bool(arg(0).string().starts_with(&arg(1).string())),
        Func::Not => Value::Bool(!arg(0).truthy()),
        Func::Count => match arg(0) {
            Value::Nodes(items) => Value::Num(items.len() as f64),
            _ => Value::Num(f64::NAN),
        },
        Func::String => Value::Str(arg(0).string()),
        Func::Number => Value::Num(arg(0).number()),
        Func::NormalizeSpace => {
            Value::Str(arg(0).string().split_whitespace().collect::<Vec<_>>().join(" "))
        }
        Func::True => Value::Bool(true),
        Func::False => Value::Bool(false),
    }
}

fn name_matches(node: Node<'_, '_>, name: &Option<String>) -> bool {
    node.is_element() && name.as_deref().map_or(true, |n| node.tag_name().name() == n)
}

/// Node list that keeps discovery order and drops repeats.
#[derive(Default)]
struct NodeSet<'a, 'i> {
    items: Vec<Item<'a, 'i>>,
    seen: HashSet<NodeId>,
}

impl<'a, 'i> NodeSet<'a, 'i> {
    fn push_node(&mut self, node: Node<'a, 'i>) {
        if self.seen.insert(node.id()) {
            self.items.push(Item::Node(node));
        }
    }

    fn push(&mut self, item: Item<'a, 'i>) {
        match item {
            Item::Node(node) => self.push_node(node),
            attr => self.items.push(attr),
        }
    }
}

fn step_candidates<'a, 'i>(step: &Step, node: Node<'a, 'i>) -> Vec<Item<'a, 'i>> {
    // For the descendant axis `//x` means descendant-or-self::node()/x.
    let bases: Vec<Node<'a, 'i>> = match step.axis {
        Axis::Child => vec![node],
        Axis::Descendant => node.descendants().collect(),
    };

    let mut out = NodeSet::default();
    for base in bases {
        match &step.test {
            NodeTest::Element(name) => {
                for child in base.children().filter(|c| name_matches(*c, name)) {
                    out.push_node(child);
                }
            }
            NodeTest::Text => {
                for child in base.children().filter(|c| c.is_text()) {
                    out.push_node(child);
                }
            }
            NodeTest::AnyNode => {
                for child in base.children() {
                    out.push_node(child);
                }
            }
            NodeTest::Attribute(name) => {
                for attr in base.attributes() {
                    if name.as_deref().map_or(true, |n| attr.name() == n) {
                        out.push(Item::Attr(attr.value().to_string()));
                    }
                }
            }
            NodeTest::SelfNode => out.push_node(base),
            NodeTest::Parent => {
                if let Some(parent) = base.parent() {
                    out.push_node(parent);
                }
            }
        }
    }
    out.items
}

fn apply_predicates<'a, 'i>(predicates: &[Expr], mut items: Vec<Item<'a, 'i>>) -> Vec<Item<'a, 'i>> {
    for predicate in predicates {
        items = items
            .into_iter()
            .enumerate()
            .filter(|(idx, item)| match item {
                Item::Node(node) => {
                    let ctx = Context {
                        node: *node,
                        position: idx + 1,
                    };
                    match eval(predicate, &ctx) {
                        Value::Num(n) => n == ctx.position as f64,
                        other => other.truthy(),
                    }
                }
                Item::Attr(_) => false,
            })
            .map(|(_, item)| item)
            .collect();
    }
    items
}

fn eval_path<'a, 'i>(path: &Path, ctx: &Context<'a, 'i>) -> Vec<Item<'a, 'i>> {
    let start = if path.absolute {
        ctx.node.document().root()
    } else {
        ctx.node
    };
    let mut current = vec![Item::Node(start)];

    for step in &path.steps {
        // Without predicates, a descendant step from a node whose ancestor is
        // also in context can only find what the ancestor already finds.
        let covered: HashSet<NodeId> = match (step.axis, step.predicates.is_empty()) {
            (Axis::Descendant, true) => current
                .iter()
                .filter_map(|item| match item {
                    Item::Node(node) => Some(node.id()),
                    Item::Attr(_) => None,
                })
                .collect(),
            _ => HashSet::new(),
        };

        let mut next = NodeSet::default();
        for item in &current {
            if let Item::Node(node) = item {
                if !covered.is_empty() && node.ancestors().skip(1).any(|a| covered.contains(&a.id())) {
                    continue;
                }
                let candidates = step_candidates(step, *node);
                for found in apply_predicates(&step.predicates, candidates) {
                    next.push(found);
                }
            }
        }
        current = next.items;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::*;

    fn matches(expr: &str) -> bool {
        let doc = XmlDocument::parse(dummy_voevent()).unwrap();
        XPathFilter::compile(expr).unwrap().matches(&doc).unwrap()
    }

    #[test]
    fn simple_paths() {
        assert!(matches("/VOEvent"));
        assert!(matches("/voe:VOEvent/Who/AuthorIVORN"));
        assert!(matches("//AuthorIVORN"));
        assert!(!matches("//WhereWhen"));
        assert!(!matches("/Who"));
        assert!(matches("//Who/*"));
    }

    #[test]
    fn root_attribute_predicates() {
        assert!(matches("/*[@role='test']"));
        assert!(!matches("/*[@role=\"observation\"]"));
        assert!(matches("//@ivorn"));
    }

    #[test]
    fn param_comparisons() {
        assert!(matches("//Param[@name='snr' and @value > 10]"));
        assert!(!matches("//Param[@name='snr' and @value > 20]"));
        assert!(matches("//Param[@name='snr']/@value >= 12.5"));
        assert!(matches("//Param[@name='instrument' or @name='telescope']"));
        assert!(matches("//Param[@name='instrument']/@value != 'XRT'"));
    }

    #[test]
    fn text_and_functions() {
        assert!(matches("//AuthorIVORN[text()='ivo://comet.broker/test']"));
        assert!(matches("contains(//AuthorIVORN, 'comet')"));
        assert!(matches("starts-with(//Date, '2012')"));
        assert!(matches("not(//Citations)"));
        assert!(matches("count(//Param) = 2"));
        assert!(!matches("false()"));
    }

    #[test]
    fn positional_predicates() {
        assert!(matches("//Param[1][@name='snr']"));
        assert!(matches("//Param[2][@name='instrument']"));
        assert!(!matches("//Param[3]"));
    }

    #[test]
    fn parent_and_self_steps() {
        assert!(matches("//AuthorIVORN/../Date"));
        assert!(matches("//Who/.[Date]"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        for bad in ["", "//Param[", "//Param[@name=']", "unknown(1)", "contains(//a)", "//a b", "$x"] {
            assert!(
                matches!(XPathFilter::compile(bad), Err(FilterError::Syntax { .. })),
                "{bad:?} should not compile"
            );
        }
    }

    #[test]
    fn deep_nesting_is_refused() {
        let nested = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        assert!(matches!(XPathFilter::compile(&nested), Err(FilterError::Syntax { .. })));

        let predicates = format!("//Param{}", "[not(.".repeat(100) + &")]".repeat(100));
        assert!(matches!(XPathFilter::compile(&predicates), Err(FilterError::Syntax { .. })));

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert!(XPathFilter::compile(&shallow).is_ok());
    }

    #[test]
    fn oversized_expressions_are_refused() {
        let chain = vec!["//Param"; 400].join(" and ");
        assert!(matches!(XPathFilter::compile(&chain), Err(FilterError::Syntax { .. })));

        let steps = "/*".repeat(400);
        assert!(matches!(XPathFilter::compile(&steps), Err(FilterError::Syntax { .. })));

        assert!(XPathFilter::compile(&vec!["//Param"; 20].join(" and ")).is_ok());
    }

    #[test]
    fn repeated_descendant_steps() {
        assert!(matches("//*//*//Param[@name='snr']"));
        assert!(matches("count(//*//Param) = 2"));
        assert!(matches("count(//*//*//*) = 4"));
        assert!(!matches("//*//*//Who"));
    }

    #[test]
    fn compiler_trait_object() {
        let compiler: Arc<dyn FilterCompiler> = Arc::new(XPathCompiler);
        let filter = compiler.compile("//Who").unwrap();
        assert_eq!(filter.expression(), "//Who");
    }
}
