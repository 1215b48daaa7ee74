//! XPath 1.0 subset over scraper's tree
//!
//! Supported: absolute and relative location paths (`/`, `//`, `.`, `..`),
//! the child, descendant, descendant-or-self, self, parent, ancestor,
//! ancestor-or-self, following-sibling, preceding-sibling and attribute axes
//! (abbreviated or `axis::` form), name tests, `*`, `text()`, `node()`,
//! predicates, unions, comparisons, `and`/`or`, filter expressions such as
//! `(//li)[1]`, arithmetic, and the core function library. Node-sets come
//! back without duplicates, in document order.

use std::collections::{HashMap, HashSet};

use scraper::node::Element;
use scraper::{ElementRef, Html};
use thiserror::Error;

use super::{Match, QueryResult};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path query at offset {offset}: {message}")]
pub struct QueryParseError {
    pub offset: usize,
    pub message: String,
}

/// Pre-order position of every element and text node of a document
#[derive(Debug, Default)]
pub(super) struct DocumentOrder {
    index: HashMap<usize, usize>,
}

impl DocumentOrder {
    pub(super) fn new(html: &Html) -> Self {
        let mut index = HashMap::new();
        for (position, node) in html.tree.root().descendants().enumerate() {
            if let Some(el) = ElementRef::wrap(node) {
                index.insert(el.value() as *const Element as usize, position);
            } else if let Some(text) = node.value().as_text() {
                let text: &str = text;
                index.insert(text.as_ptr() as usize, position);
            }
        }
        Self { index }
    }

    // Attributes sort right after their owner, in declaration order
    fn key(&self, item: &Item<'_>) -> (usize, usize) {
        let position = |ptr: usize| self.index.get(&ptr).copied().unwrap_or(usize::MAX);
        match item {
            Item::Document => (0, 0),
            Item::Element(el) => (position(el.value() as *const Element as usize), 0),
            Item::Text(s) => (position(s.as_ptr() as usize), 0),
            Item::Attr { owner, name, .. } => {
                let slot = owner
                    .value()
                    .attrs()
                    .position(|(attr, _)| attr == *name)
                    .unwrap_or(0);
                (position(owner.value() as *const Element as usize), slot + 1)
            }
        }
    }
}

/// Evaluate `query` with `context` as the context node
pub(super) fn evaluate<'a>(
    html: &'a Html,
    order: &DocumentOrder,
    context: ElementRef<'a>,
    query: &str,
) -> Result<QueryResult<ElementRef<'a>>, QueryParseError> {
    let expr = parse(query)?;
    let evaluator = Evaluator { html, order };
    let ctx = Ctx {
        item: Item::Element(context),
        position: 1,
        size: 1,
    };

    Ok(match evaluator.eval(&expr, &ctx) {
        Val::Nodes(items) => QueryResult::Matches(
            items.into_iter().map(|item| evaluator.to_match(item)).collect(),
        ),
        other => QueryResult::Scalar(evaluator.string_of(&other)),
    })
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Star,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    Plus,
    Minus,
    ColonColon,
    Op(CmpOp),
    Literal(String),
    Number(f64),
    Name(String),
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, QueryParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);

    while i < chars.len() {
        let (offset, c) = chars[i];
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if peek(i + 1) == Some('/') => {
                i += 2;
                Token::DoubleSlash
            }
            '/' => {
                i += 1;
                Token::Slash
            }
            '.' if peek(i + 1) == Some('.') => {
                i += 2;
                Token::DotDot
            }
            '.' if peek(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                let (number, next) = lex_number(&chars, i);
                i = next;
                Token::Number(number)
            }
            '.' => {
                i += 1;
                Token::Dot
            }
            '@' => {
                i += 1;
                Token::At
            }
            '*' => {
                i += 1;
                Token::Star
            }
            '[' => {
                i += 1;
                Token::LBracket
            }
            ']' => {
                i += 1;
                Token::RBracket
            }
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            '|' => {
                i += 1;
                Token::Pipe
            }
            '+' => {
                i += 1;
                Token::Plus
            }
            '-' => {
                i += 1;
                Token::Minus
            }
            ':' if peek(i + 1) == Some(':') => {
                i += 2;
                Token::ColonColon
            }
            '=' => {
                i += 1;
                Token::Op(CmpOp::Eq)
            }
            '!' if peek(i + 1) == Some('=') => {
                i += 2;
                Token::Op(CmpOp::Ne)
            }
            '<' | '>' => {
                let or_equal = peek(i + 1) == Some('=');
                i += if or_equal { 2 } else { 1 };
                Token::Op(match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                })
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(QueryParseError {
                        offset,
                        message: "unterminated string literal".to_string(),
                    });
                }
                let literal: String = chars[start..end].iter().map(|&(_, c)| c).collect();
                i = end + 1;
                Token::Literal(literal)
            }
            c if c.is_ascii_digit() => {
                let (number, next) = lex_number(&chars, i);
                i = next;
                Token::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '-' || chars[i].1 == '_')
                {
                    i += 1;
                }
                Token::Name(chars[start..i].iter().map(|&(_, c)| c).collect())
            }
            other => {
                return Err(QueryParseError {
                    offset,
                    message: format!("unexpected character {:?}", other),
                })
            }
        };
        tokens.push((offset, token));
    }

    Ok(tokens)
}

fn lex_number(chars: &[(usize, char)], mut i: usize) -> (f64, usize) {
    let start = i;
    let mut seen_dot = false;
    while i < chars.len() {
        match chars[i].1 {
            c if c.is_ascii_digit() => i += 1,
            '.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
    (text.parse().unwrap_or(f64::NAN), i)
}

// ---------------------------------------------------------------------------
// Syntax tree

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Attribute,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "self" => Axis::SelfAxis,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            "attribute" => Axis::Attribute,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
    Text,
    Node,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

impl Step {
    // The `//` abbreviation
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LocationPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Position,
    Last,
    Not,
    True,
    False,
    Contains,
    StartsWith,
    EndsWith,
    NormalizeSpace,
    String,
    StringLength,
    Substring,
    SubstringBefore,
    SubstringAfter,
    Translate,
    Concat,
    Count,
    Sum,
    Name,
    Number,
    Boolean,
    Floor,
    Ceiling,
    Round,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "position" => Function::Position,
            "last" => Function::Last,
            "not" => Function::Not,
            "true" => Function::True,
            "false" => Function::False,
            "contains" => Function::Contains,
            "starts-with" => Function::StartsWith,
            "ends-with" => Function::EndsWith,
            "normalize-space" => Function::NormalizeSpace,
            "string" => Function::String,
            "string-length" => Function::StringLength,
            "substring" => Function::Substring,
            "substring-before" => Function::SubstringBefore,
            "substring-after" => Function::SubstringAfter,
            "translate" => Function::Translate,
            "concat" => Function::Concat,
            "count" => Function::Count,
            "sum" => Function::Sum,
            "name" | "local-name" => Function::Name,
            "number" => Function::Number,
            "boolean" => Function::Boolean,
            "floor" => Function::Floor,
            "ceiling" => Function::Ceiling,
            "round" => Function::Round,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    Negate(Box<Expr>),
    Union(Vec<Expr>),
    Path(LocationPath),
    /// `(expr)[pred]...`
    Filter(Box<Expr>, Vec<Expr>),
    /// `(expr)/step/...`
    PathFrom(Box<Expr>, Vec<Step>),
    Literal(String),
    Number(f64),
    Call(Function, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Parser

fn parse(query: &str) -> Result<Expr, QueryParseError> {
    let tokens = tokenize(query)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: query.len(),
    };
    if parser.tokens.is_empty() {
        return Err(parser.error("empty query"));
    }
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), QueryParseError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", expected)))
        }
    }

    fn error(&self, message: &str) -> QueryParseError {
        QueryParseError {
            offset: self
                .tokens
                .get(self.pos)
                .map(|(offset, _)| *offset)
                .unwrap_or(self.len),
            message: message.to_string(),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr, QueryParseError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryParseError> {
        let mut left = self.parse_compare()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_compare()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_compare(&mut self) -> Result<Expr, QueryParseError> {
        let mut left = self.parse_additive()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Compare(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, QueryParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(Box::new(left), op, Box::new(right));
        }
    }

    // After a complete operand, `*`, `div` and `mod` are operators, not name tests
    fn parse_multiplicative(&mut self) -> Result<Expr, QueryParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.peek() == Some(&Token::Star) {
                ArithOp::Mul
            } else if self.peek_keyword("div") {
                ArithOp::Div
            } else if self.peek_keyword("mod") {
                ArithOp::Mod
            } else {
                return Ok(left);
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, QueryParseError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, QueryParseError> {
        let first = self.parse_filter()?;
        if self.peek() != Some(&Token::Pipe) {
            return Ok(first);
        }
        let mut members = vec![first];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            members.push(self.parse_filter()?);
        }
        Ok(Expr::Union(members))
    }

    fn parse_filter(&mut self) -> Result<Expr, QueryParseError> {
        let parenthesized = self.peek() == Some(&Token::LParen);
        let primary = self.parse_primary()?;
        if !parenthesized && matches!(primary, Expr::Path(_)) {
            return Ok(primary);
        }

        let mut expr = primary;
        let predicates = self.parse_predicates()?;
        if !predicates.is_empty() {
            expr = Expr::Filter(Box::new(expr), predicates);
        }

        let mut steps = Vec::new();
        self.parse_step_tail(&mut steps)?;
        if !steps.is_empty() {
            expr = Expr::PathFrom(Box::new(expr), steps);
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, QueryParseError> {
        match self.peek() {
            Some(Token::Literal(_)) => match self.advance() {
                Some(Token::Literal(s)) => Ok(Expr::Literal(s)),
                _ => Err(self.error("expected literal")),
            },
            Some(Token::Number(n)) => {
                let n = *n;
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
                let function = Function::from_name(name)
                    .ok_or_else(|| self.error(&format!("unknown function {}()", name)))?;
                self.pos += 2;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.parse_or()?);
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.parse_or()?);
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(function, args))
            }
            Some(_) => Ok(Expr::Path(self.parse_location_path()?)),
            None => Err(self.error("unexpected end of query")),
        }
    }

    fn parse_location_path(&mut self) -> Result<LocationPath, QueryParseError> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                if self.starts_step() {
                    steps.push(self.parse_step()?);
                }
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
                true
            }
            _ => {
                steps.push(self.parse_step()?);
                false
            }
        };
        self.parse_step_tail(&mut steps)?;
        Ok(LocationPath { absolute, steps })
    }

    fn parse_step_tail(&mut self, steps: &mut Vec<Step>) -> Result<(), QueryParseError> {
        loop {
            match self.peek() {
                Some(Token::Slash) => {
                    self.pos += 1;
                    steps.push(self.parse_step()?);
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(Step::descendant_or_self());
                    steps.push(self.parse_step()?);
                }
                _ => return Ok(()),
            }
        }
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn parse_step(&mut self) -> Result<Step, QueryParseError> {
        let (axis, test) = match self.peek() {
            Some(Token::Dot) => {
                self.pos += 1;
                (Axis::SelfAxis, NodeTest::Node)
            }
            Some(Token::DotDot) => {
                self.pos += 1;
                (Axis::Parent, NodeTest::Node)
            }
            Some(Token::At) => {
                self.pos += 1;
                (Axis::Attribute, self.parse_node_test()?)
            }
            Some(Token::Name(name)) if self.peek_at(1) == Some(&Token::ColonColon) => {
                let axis = Axis::from_name(name)
                    .ok_or_else(|| self.error(&format!("unknown axis {}", name)))?;
                self.pos += 2;
                (axis, self.parse_node_test()?)
            }
            _ => (Axis::Child, self.parse_node_test()?),
        };
        let predicates = self.parse_predicates()?;
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_node_test(&mut self) -> Result<NodeTest, QueryParseError> {
        match self.advance() {
            Some(Token::Star) => Ok(NodeTest::Any),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let test = match name.as_str() {
                        "text" => NodeTest::Text,
                        "node" => NodeTest::Node,
                        _ => {
                            self.pos -= 1;
                            return Err(self.error(&format!("{}() is not a node test", name)));
                        }
                    };
                    self.pos += 1;
                    self.expect(Token::RParen)?;
                    Ok(test)
                } else {
                    Ok(NodeTest::Name(name))
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a node test"))
            }
        }
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, QueryParseError> {
        let mut predicates = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            predicates.push(self.parse_or()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, Copy)]
enum Item<'a> {
    Document,
    Element(ElementRef<'a>),
    Text(&'a str),
    Attr {
        owner: ElementRef<'a>,
        name: &'a str,
        value: &'a str,
    },
}

impl Item<'_> {
    // Tree nodes never move while the document is borrowed, so addresses
    // identify them.
    fn identity(&self) -> (usize, usize) {
        match self {
            Item::Document => (0, 0),
            Item::Element(el) => (el.value() as *const Element as usize, 0),
            Item::Text(s) => (s.as_ptr() as usize, s.len()),
            Item::Attr { owner, name, .. } => {
                (owner.value() as *const Element as usize, name.as_ptr() as usize)
            }
        }
    }
}

// Map tree nodes to items, skipping comments and doctypes
macro_rules! node_items {
    ($nodes:expr) => {
        $nodes
            .filter_map(|node| {
                if let Some(el) = ElementRef::wrap(node) {
                    Some(Item::Element(el))
                } else if let Some(text) = node.value().as_text() {
                    Some(Item::Text(&**text))
                } else if node.value().is_document() || node.value().is_fragment() {
                    Some(Item::Document)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
    };
}

#[derive(Debug, Clone, Copy)]
struct Ctx<'a> {
    item: Item<'a>,
    position: usize,
    size: usize,
}

#[derive(Debug, Clone)]
enum Val<'a> {
    Nodes(Vec<Item<'a>>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Evaluator<'a, 'o> {
    html: &'a Html,
    order: &'o DocumentOrder,
}

impl<'a> Evaluator<'a, '_> {
    fn eval(&self, expr: &Expr, ctx: &Ctx<'a>) -> Val<'a> {
        match expr {
            Expr::Or(l, r) => Val::Bool(self.truthy(l, ctx) || self.truthy(r, ctx)),
            Expr::And(l, r) => Val::Bool(self.truthy(l, ctx) && self.truthy(r, ctx)),
            Expr::Compare(l, op, r) => {
                let left = self.eval(l, ctx);
                let right = self.eval(r, ctx);
                Val::Bool(self.compare(&left, *op, &right))
            }
            Expr::Arith(l, op, r) => {
                let left = self.number_of(&self.eval(l, ctx));
                let right = self.number_of(&self.eval(r, ctx));
                Val::Num(match op {
                    ArithOp::Add => left + right,
                    ArithOp::Sub => left - right,
                    ArithOp::Mul => left * right,
                    ArithOp::Div => left / right,
                    ArithOp::Mod => left % right,
                })
            }
            Expr::Negate(inner) => Val::Num(-self.number_of(&self.eval(inner, ctx))),
            Expr::Union(members) => {
                let mut seen = HashSet::new();
                let mut nodes = Vec::new();
                for member in members {
                    if let Val::Nodes(items) = self.eval(member, ctx) {
                        for item in items {
                            if seen.insert(item.identity()) {
                                nodes.push(item);
                            }
                        }
                    }
                }
                Val::Nodes(self.in_document_order(nodes))
            }
            Expr::Path(path) => {
                let start = if path.absolute {
                    vec![Item::Document]
                } else {
                    vec![ctx.item]
                };
                Val::Nodes(self.apply_steps(start, &path.steps))
            }
            Expr::Filter(inner, predicates) => {
                Val::Nodes(self.apply_predicates(self.nodes_of(inner, ctx), predicates))
            }
            Expr::PathFrom(inner, steps) => Val::Nodes(self.apply_steps(self.nodes_of(inner, ctx), steps)),
            Expr::Literal(s) => Val::Str(s.clone()),
            Expr::Number(n) => Val::Num(*n),
            Expr::Call(function, args) => self.call(*function, args, ctx),
        }
    }

    fn truthy(&self, expr: &Expr, ctx: &Ctx<'a>) -> bool {
        self.boolean(&self.eval(expr, ctx))
    }

    fn nodes_of(&self, expr: &Expr, ctx: &Ctx<'a>) -> Vec<Item<'a>> {
        match self.eval(expr, ctx) {
            Val::Nodes(items) => items,
            _ => Vec::new(),
        }
    }

    fn apply_steps(&self, start: Vec<Item<'a>>, steps: &[Step]) -> Vec<Item<'a>> {
        let mut current = start;
        for step in steps {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for item in &current {
                let candidates: Vec<Item<'a>> = self
                    .axis(*item, step.axis)
                    .into_iter()
                    .filter(|candidate| node_test(&step.test, step.axis, candidate))
                    .collect();
                for selected in self.apply_predicates(candidates, &step.predicates) {
                    if seen.insert(selected.identity()) {
                        next.push(selected);
                    }
                }
            }
            current = self.in_document_order(next);
        }
        current
    }

    fn in_document_order(&self, mut items: Vec<Item<'a>>) -> Vec<Item<'a>> {
        items.sort_by_cached_key(|item| self.order.key(item));
        items
    }

    fn apply_predicates(&self, mut items: Vec<Item<'a>>, predicates: &[Expr]) -> Vec<Item<'a>> {
        for predicate in predicates {
            let size = items.len();
            items = items
                .into_iter()
                .enumerate()
                .filter(|(i, item)| {
                    let ctx = Ctx {
                        item: *item,
                        position: i + 1,
                        size,
                    };
                    match self.eval(predicate, &ctx) {
                        Val::Num(n) => n == (i + 1) as f64,
                        other => self.boolean(&other),
                    }
                })
                .map(|(_, item)| item)
                .collect();
        }
        items
    }

    fn axis(&self, item: Item<'a>, axis: Axis) -> Vec<Item<'a>> {
        match item {
            Item::Element(el) => match axis {
                Axis::Child => node_items!(el.children()),
                Axis::Descendant => node_items!(el.descendants().skip(1)),
                Axis::DescendantOrSelf => node_items!(el.descendants()),
                Axis::SelfAxis => vec![item],
                Axis::Parent => node_items!(el.parent().into_iter()),
                Axis::Ancestor => node_items!(el.ancestors()),
                Axis::AncestorOrSelf => {
                    let mut items = vec![item];
                    items.extend(node_items!(el.ancestors()));
                    items
                }
                Axis::FollowingSibling => node_items!(el.next_siblings()),
                Axis::PrecedingSibling => node_items!(el.prev_siblings()),
                Axis::Attribute => el
                    .value()
                    .attrs()
                    .map(|(name, value)| Item::Attr {
                        owner: el,
                        name,
                        value,
                    })
                    .collect(),
            },
            Item::Document => {
                let root = self.html.tree.root();
                match axis {
                    Axis::Child => node_items!(root.children()),
                    Axis::Descendant => node_items!(root.descendants().skip(1)),
                    Axis::DescendantOrSelf => node_items!(root.descendants()),
                    Axis::SelfAxis | Axis::AncestorOrSelf => vec![item],
                    _ => Vec::new(),
                }
            }
            Item::Attr { owner, .. } => match axis {
                Axis::SelfAxis => vec![item],
                Axis::Parent => vec![Item::Element(owner)],
                Axis::Ancestor | Axis::AncestorOrSelf => {
                    let mut items = if axis == Axis::AncestorOrSelf {
                        vec![item]
                    } else {
                        Vec::new()
                    };
                    items.push(Item::Element(owner));
                    items.extend(node_items!(owner.ancestors()));
                    items
                }
                _ => Vec::new(),
            },
            Item::Text(_) => match axis {
                Axis::SelfAxis | Axis::DescendantOrSelf | Axis::AncestorOrSelf => vec![item],
                _ => Vec::new(),
            },
        }
    }

    fn call(&self, function: Function, args: &[Expr], ctx: &Ctx<'a>) -> Val<'a> {
        let arg = |i: usize| args.get(i).map(|expr| self.eval(expr, ctx));
        let string_arg = |i: usize| {
            arg(i)
                .map(|v| self.string_of(&v))
                .unwrap_or_else(|| self.string_value(&ctx.item))
        };

        match function {
            Function::Position => Val::Num(ctx.position as f64),
            Function::Last => Val::Num(ctx.size as f64),
            Function::Not => Val::Bool(!arg(0).map(|v| self.boolean(&v)).unwrap_or(false)),
            Function::True => Val::Bool(true),
            Function::False => Val::Bool(false),
            Function::Contains => Val::Bool(string_arg(0).contains(&string_arg(1))),
            Function::StartsWith => Val::Bool(string_arg(0).starts_with(&string_arg(1))),
            Function::EndsWith => Val::Bool(string_arg(0).ends_with(&string_arg(1))),
            Function::NormalizeSpace => Val::Str(
                string_arg(0).split_whitespace().collect::<Vec<_>>().join(" "),
            ),
            Function::String => Val::Str(string_arg(0)),
            Function::StringLength => Val::Num(string_arg(0).chars().count() as f64),
            Function::Substring => {
                let start = xpath_round(arg(1).map(|v| self.number_of(&v)).unwrap_or(f64::NAN));
                let end = match arg(2) {
                    Some(len) => start + xpath_round(self.number_of(&len)),
                    None => f64::INFINITY,
                };
                // 1-based positions p with start <= p < end; NaN bounds select nothing
                Val::Str(
                    string_arg(0)
                        .chars()
                        .enumerate()
                        .filter(|(i, _)| {
                            let p = (i + 1) as f64;
                            p >= start && p < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            Function::SubstringBefore => {
                let (haystack, needle) = (string_arg(0), string_arg(1));
                Val::Str(match haystack.find(&needle) {
                    Some(i) => haystack[..i].to_string(),
                    None => String::new(),
                })
            }
            Function::SubstringAfter => {
                let (haystack, needle) = (string_arg(0), string_arg(1));
                Val::Str(match haystack.find(&needle) {
                    Some(i) => haystack[i + needle.len()..].to_string(),
                    None => String::new(),
                })
            }
            Function::Translate => {
                let from: Vec<char> = string_arg(1).chars().collect();
                let to: Vec<char> = string_arg(2).chars().collect();
                Val::Str(
                    string_arg(0)
                        .chars()
                        .filter_map(|c| match from.iter().position(|&f| f == c) {
                            Some(i) => to.get(i).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            Function::Concat => Val::Str(
                args.iter()
                    .map(|expr| self.string_of(&self.eval(expr, ctx)))
                    .collect(),
            ),
            Function::Count => Val::Num(match arg(0) {
                Some(Val::Nodes(items)) => items.len() as f64,
                _ => 0.0,
            }),
            Function::Sum => Val::Num(match arg(0) {
                Some(Val::Nodes(items)) => items
                    .iter()
                    .map(|item| to_number(&self.string_value(item)))
                    .sum(),
                _ => 0.0,
            }),
            Function::Name => {
                let target = match arg(0) {
                    Some(Val::Nodes(items)) => items.first().copied(),
                    Some(_) => None,
                    None => Some(ctx.item),
                };
                Val::Str(match target {
                    Some(Item::Element(el)) => el.value().name().to_string(),
                    Some(Item::Attr { name, .. }) => name.to_string(),
                    _ => String::new(),
                })
            }
            Function::Number => Val::Num(match arg(0) {
                Some(v) => self.number_of(&v),
                None => to_number(&self.string_value(&ctx.item)),
            }),
            Function::Boolean => Val::Bool(arg(0).map(|v| self.boolean(&v)).unwrap_or(false)),
            Function::Floor => Val::Num(self.number_arg(arg(0)).floor()),
            Function::Ceiling => Val::Num(self.number_arg(arg(0)).ceil()),
            Function::Round => Val::Num(xpath_round(self.number_arg(arg(0)))),
        }
    }

    fn number_arg(&self, val: Option<Val<'a>>) -> f64 {
        val.map(|v| self.number_of(&v)).unwrap_or(f64::NAN)
    }

    fn string_value(&self, item: &Item<'a>) -> String {
        match item {
            Item::Document => self.html.root_element().text().collect(),
            Item::Element(el) => el.text().collect(),
            Item::Text(s) => s.to_string(),
            Item::Attr { value, .. } => value.to_string(),
        }
    }

    fn string_of(&self, val: &Val<'a>) -> String {
        match val {
            Val::Nodes(items) => items
                .first()
                .map(|item| self.string_value(item))
                .unwrap_or_default(),
            Val::Str(s) => s.clone(),
            Val::Num(n) => format_number(*n),
            Val::Bool(b) => b.to_string(),
        }
    }

    fn number_of(&self, val: &Val<'a>) -> f64 {
        match val {
            Val::Num(n) => *n,
            Val::Bool(b) => f64::from(u8::from(*b)),
            other => to_number(&self.string_of(other)),
        }
    }

    fn boolean(&self, val: &Val<'a>) -> bool {
        match val {
            Val::Nodes(items) => !items.is_empty(),
            Val::Str(s) => !s.is_empty(),
            Val::Num(n) => *n != 0.0 && !n.is_nan(),
            Val::Bool(b) => *b,
        }
    }

    // XPath 1.0 comparison: a node-set compares true if any member does
    fn compare(&self, left: &Val<'a>, op: CmpOp, right: &Val<'a>) -> bool {
        match (left, right) {
            (Val::Nodes(a), Val::Nodes(b)) => a.iter().any(|x| {
                let sx = Val::Str(self.string_value(x));
                b.iter()
                    .any(|y| self.compare_atoms(&sx, op, &Val::Str(self.string_value(y))))
            }),
            (Val::Nodes(nodes), Val::Bool(_)) => {
                self.compare_atoms(&Val::Bool(!nodes.is_empty()), op, right)
            }
            (Val::Bool(_), Val::Nodes(nodes)) => {
                self.compare_atoms(left, op, &Val::Bool(!nodes.is_empty()))
            }
            (Val::Nodes(nodes), other) => nodes
                .iter()
                .any(|x| self.compare_atoms(&Val::Str(self.string_value(x)), op, other)),
            (other, Val::Nodes(nodes)) => nodes
                .iter()
                .any(|y| self.compare_atoms(other, op, &Val::Str(self.string_value(y)))),
            _ => self.compare_atoms(left, op, right),
        }
    }

    fn compare_atoms(&self, left: &Val<'a>, op: CmpOp, right: &Val<'a>) -> bool {
        match op {
            CmpOp::Eq | CmpOp::Ne => {
                let equal = match (left, right) {
                    (Val::Bool(_), _) | (_, Val::Bool(_)) => self.boolean(left) == self.boolean(right),
                    (Val::Num(_), _) | (_, Val::Num(_)) => self.number_of(left) == self.number_of(right),
                    _ => self.string_of(left) == self.string_of(right),
                };
                equal == (op == CmpOp::Eq)
            }
            CmpOp::Lt => self.number_of(left) < self.number_of(right),
            CmpOp::Le => self.number_of(left) <= self.number_of(right),
            CmpOp::Gt => self.number_of(left) > self.number_of(right),
            CmpOp::Ge => self.number_of(left) >= self.number_of(right),
        }
    }

    fn to_match(&self, item: Item<'a>) -> Match<ElementRef<'a>> {
        match item {
            Item::Document => Match::Node(self.html.root_element()),
            Item::Element(el) => Match::Node(el),
            Item::Text(s) => Match::Text(s.to_string()),
            Item::Attr { name, value, .. } => Match::Attribute {
                name: name.to_string(),
                value: value.to_string(),
            },
        }
    }
}

fn node_test(test: &NodeTest, axis: Axis, item: &Item<'_>) -> bool {
    let on_attributes = axis == Axis::Attribute;
    match (test, item) {
        (NodeTest::Node, _) => true,
        (NodeTest::Text, Item::Text(_)) => true,
        (NodeTest::Any, Item::Element(_)) => !on_attributes,
        (NodeTest::Any, Item::Attr { .. }) => on_attributes,
        (NodeTest::Name(wanted), Item::Element(el)) => {
            !on_attributes && el.value().name().eq_ignore_ascii_case(wanted)
        }
        (NodeTest::Name(wanted), Item::Attr { name, .. }) => {
            on_attributes && name.eq_ignore_ascii_case(wanted)
        }
        _ => false,
    }
}

fn to_number(s: &str) -> f64 {
    s.trim().parse().unwrap_or(f64::NAN)
}

// Halves round towards positive infinity
fn xpath_round(n: f64) -> f64 {
    if n.is_finite() {
        (n + 0.5).floor()
    } else {
        n
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        (if n > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
    <html>
    <body>
        <ul id="menu">
            <li class="item first"><a href="/home">Home</a></li>
            <li class="item"><a href="/about">About</a></li>
            <li class="item last"><a href="/contact">Contact</a></li>
        </ul>
        <dl>
            <dt>Price</dt><dd>$10</dd>
            <dt>Stock</dt><dd>7 left</dd>
        </dl>
        <div class="outer"><div class="inner"><span>deep</span></div></div>
        <p>Hello <b>bold</b> world</p>
    </body>
    </html>
    "#;

    fn run(query: &str) -> Vec<String> {
        let html = Html::parse_document(PAGE);
        let order = DocumentOrder::new(&html);
        let result = evaluate(&html, &order, html.root_element(), query).unwrap();
        match result {
            QueryResult::Matches(matches) => matches
                .into_iter()
                .map(|m| match m {
                    Match::Node(el) => el.text().collect::<String>(),
                    Match::Attribute { value, .. } => value,
                    Match::Text(t) => t,
                })
                .collect(),
            QueryResult::Scalar(s) => vec![format!("scalar:{}", s)],
        }
    }

    #[test]
    fn test_descendant_and_child_steps() {
        assert_eq!(run("//ul/li/a"), ["Home", "About", "Contact"]);
        assert_eq!(run("/html/body/ul/li/a/@href"), ["/home", "/about", "/contact"]);
        assert_eq!(run("//a/@href")[1], "/about");
    }

    #[test]
    fn test_positional_predicates_apply_per_parent() {
        assert_eq!(run("//li[1]/a"), ["Home"]);
        assert_eq!(run("//li[last()]/a"), ["Contact"]);
        assert_eq!(run("(//a)[2]"), ["About"]);
        assert_eq!(run("(//li)[position() > 1]/a/@href"), ["/about", "/contact"]);
    }

    #[test]
    fn test_attribute_and_text_predicates() {
        assert_eq!(run("//li[contains(@class, 'last')]/a"), ["Contact"]);
        assert_eq!(run("//li[@class='item']/a"), ["About"]);
        assert_eq!(run("//li[@class!='item']/a"), ["Home", "Contact"]);
        assert_eq!(run("//a[text()='About']/@href"), ["/about"]);
        assert_eq!(run("//a[starts-with(@href, '/c')]"), ["Contact"]);
        assert_eq!(run("//li[not(contains(@class, 'first')) and a]/a"), ["About", "Contact"]);
        assert_eq!(run("//ul[@id='menu' or @id='nav']/li[2]"), ["About"]);
    }

    #[test]
    fn test_sibling_axes() {
        assert_eq!(run("//dt[text()='Stock']/following-sibling::dd[1]"), ["7 left"]);
        assert_eq!(run("//dd[1]/preceding-sibling::dt"), ["Price"]);
    }

    #[test]
    fn test_nested_descendants_not_duplicated() {
        assert_eq!(run("//div//span"), ["deep"]);
        assert_eq!(run("//div").len(), 2);
    }

    const NESTED: &str = r#"
    <html><body>
        <div id="a">
            <p><span>first</span></p>
            <span>second</span>
            <ol><li>third</li></ol>
        </div>
        <p>fourth</p>
        <span>fifth</span>
    </body></html>
    "#;

    fn run_on(page: &str, query: &str) -> Vec<String> {
        let html = Html::parse_document(page);
        let order = DocumentOrder::new(&html);
        let matches = evaluate(&html, &order, html.root_element(), query)
            .unwrap()
            .into_matches();
        matches
            .into_iter()
            .map(|m| match m {
                Match::Node(el) => el.text().collect::<String>(),
                Match::Attribute { value, .. } => value,
                Match::Text(t) => t,
            })
            .collect()
    }

    #[test]
    fn test_results_in_document_order_across_depths() {
        assert_eq!(run_on(NESTED, "//span"), ["first", "second", "fifth"]);
        assert_eq!(run_on(NESTED, "//*[self::li or self::p]"), ["first", "third", "fourth"]);
        assert_eq!(run_on(NESTED, "(//*[self::li or self::p])[1]"), ["first"]);
        assert_eq!(run_on(NESTED, "//span | //p | //li"), ["first", "first", "second", "third", "fourth", "fifth"]);
        assert_eq!(run_on(NESTED, "//div//text()[normalize-space()]"), ["first", "second", "third"]);
    }

    #[test]
    fn test_reverse_axis_positions_count_from_context() {
        assert_eq!(run_on(NESTED, "//li/ancestor::*[1]/@id"), Vec::<String>::new());
        assert_eq!(run_on(NESTED, "//ol/ancestor::*[1]/@id"), ["a"]);
        assert_eq!(run_on(NESTED, "//ol/preceding-sibling::*[1]"), ["second"]);
        // the selected nodes themselves still come back in document order
        assert_eq!(run_on(NESTED, "//ol/preceding-sibling::*"), ["first", "second"]);
    }

    #[test]
    fn test_attributes_follow_their_owner() {
        let page = r#"<html><body><a href="/1"><b title="t">b</b></a><i lang="en">i</i></body></html>"#;
        assert_eq!(run_on(page, "//i/@lang | //b/@title | //a/@href"), ["/1", "t", "en"]);
        assert_eq!(run_on(page, "//b/@title | //a"), ["b", "t"]);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("//li[last() - 1]/a"), ["About"]);
        assert_eq!(run("//li[position() mod 2 = 1]/a"), ["Home", "Contact"]);
        assert_eq!(run("count(//li) * 2 + 1"), ["scalar:7"]);
        assert_eq!(run("7 div 2"), ["scalar:3.5"]);
        assert_eq!(run("-count(//li)"), ["scalar:-3"]);
        assert_eq!(run("//ul/*[2]/a"), ["About"]);
        assert_eq!(run("count(//div) div count(//span)"), ["scalar:2"]);
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(run("substring(//dd[2], 1, 1)"), ["scalar:7"]);
        assert_eq!(run("substring('12345', 1.5, 2.6)"), ["scalar:234"]);
        assert_eq!(run("substring('12345', 3)"), ["scalar:345"]);
        assert_eq!(run("substring-before(//dd[2], ' ')"), ["scalar:7"]);
        assert_eq!(run("substring-after(//a[1]/@href, '/')"), ["scalar:home"]);
        assert_eq!(run("substring-after('abc', 'z')"), ["scalar:"]);
        assert_eq!(run("translate(//dd[1], '$', '')"), ["scalar:10"]);
        assert_eq!(run("translate('bar', 'abc', 'ABC')"), ["scalar:BAr"]);
    }

    #[test]
    fn test_numeric_and_boolean_functions() {
        assert_eq!(run("boolean(//p)"), ["scalar:true"]);
        assert_eq!(run("boolean(//table)"), ["scalar:false"]);
        assert_eq!(run("sum(//nothing)"), ["scalar:0"]);
        assert_eq!(run("sum(//li/@missing | //dd[1]/following-sibling::dd)"), ["scalar:NaN"]);
        assert_eq!(run("floor(2.7)"), ["scalar:2"]);
        assert_eq!(run("ceiling(2.1)"), ["scalar:3"]);
        assert_eq!(run("round(2.5)"), ["scalar:3"]);
        assert_eq!(run("round(-2.5)"), ["scalar:-2"]);
        assert_eq!(run("number(substring-after(//dd[1], '$')) + 1"), ["scalar:11"]);
    }

    #[test]
    fn test_text_nodes() {
        assert_eq!(run("//p/text()"), ["Hello ", " world"]);
        assert_eq!(run("//p/text()[2]"), [" world"]);
    }

    #[test]
    fn test_union_and_parent() {
        assert_eq!(run("//dt | //dd[1]"), ["Price", "Stock", "$10"]);
        assert_eq!(run("//span/../@class"), ["inner"]);
    }

    #[test]
    fn test_scalar_functions() {
        assert_eq!(run("count(//li)"), ["scalar:3"]);
        assert_eq!(run("normalize-space(//p)"), ["scalar:Hello bold world"]);
        assert_eq!(run("string(//a/@href)"), ["scalar:/home"]);
        assert_eq!(run("count(//table) = 0"), ["scalar:true"]);
    }

    #[test]
    fn test_relative_queries() {
        let html = Html::parse_document(PAGE);
        let order = DocumentOrder::new(&html);
        let ul = match evaluate(&html, &order, html.root_element(), "//ul").unwrap() {
            QueryResult::Matches(mut m) => match m.remove(0) {
                Match::Node(el) => el,
                other => panic!("expected node, got {:?}", other),
            },
            other => panic!("expected matches, got {:?}", other),
        };

        let count = |q: &str| evaluate(&html, &order, ul, q).unwrap().into_matches().len();
        assert_eq!(count("li"), 3);
        assert_eq!(count("./li"), 3);
        assert_eq!(count(".//a"), 3);
        assert_eq!(count("."), 1);
        // absolute paths ignore the context
        assert_eq!(count("//dt"), 2);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "//li[", "//li[@class='x]", "foo(1)", "//li/bar()", "bogus::li", "#"] {
            assert!(parse(bad).is_err(), "{:?} should not parse", bad);
        }
    }
}
