//! Restricted boolean expression language evaluated against a [`Variables`] bag.
//!
//! ```text
//! expr       := and_expr ( "||" and_expr )*
//! and_expr   := unary ( "&&" unary )*
//! unary      := "!" unary | primary
//! primary    := "(" expr ")" | operand ( cmp_op operand )?
//! cmp_op     := "==" | "!=" | ">" | ">=" | "<" | "<=" | "contains"
//! operand    := identifier | number | string | true | false | null
//! ```
//!
//! Expressions are parsed in full before evaluation, so syntax errors surface
//! even in branches that short-circuiting would skip.

use std::cmp::Ordering;

use serde_json::Value;

use weft_core::error::{Result, WeftError};

use super::variables::{value_to_text, Variables};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl CmpOp {
    /// Accepts symbol and word forms (`>=`, `gte`).
    pub fn parse(op: &str) -> Option<Self> {
        let op = match op.trim().to_ascii_lowercase().as_str() {
            "==" | "eq" | "equals" => Self::Eq,
            "!=" | "ne" | "neq" | "not_equals" => Self::Ne,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" | "ge" => Self::Gte,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" | "le" => Self::Lte,
            "contains" => Self::Contains,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Var(String),
    Lit(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

/// A parsed expression, reusable across variable bags.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(WeftError::ConditionEvaluation("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(WeftError::ConditionEvaluation(format!(
                "unexpected token {:?} in '{}'",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a variable bag. Unknown variables are errors.
    pub fn evaluate(&self, vars: &Variables) -> Result<bool> {
        eval(&self.root, vars)
    }

    /// Variable names referenced anywhere in the expression.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_vars(&self.root, &mut out);
        out
    }
}

/// Parse and evaluate in one call.
pub fn evaluate(source: &str, vars: &Variables) -> Result<bool> {
    Expression::parse(source)?.evaluate(vars)
}

/// Compare two values with numeric coercion across number / numeric-string
/// representations.
pub fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool> {
    if op == CmpOp::Contains {
        return Ok(contains(left, right));
    }

    let ordering = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match op {
            CmpOp::Eq => return Ok(loose_eq(left, right)),
            CmpOp::Ne => return Ok(!loose_eq(left, right)),
            _ => match (left, right) {
                (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                _ => {
                    return Err(WeftError::ConditionEvaluation(format!(
                        "cannot order {} {} {}",
                        left,
                        op.as_str(),
                        right
                    )))
                }
            },
        },
    };

    let Some(ordering) = ordering else {
        return Err(WeftError::ConditionEvaluation("NaN in comparison".into()));
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Gte => ordering != Ordering::Less,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Lte => ordering != Ordering::Greater,
        CmpOp::Contains => unreachable!("handled above"),
    })
}

/// Truthiness used for bare operands.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => value_to_text(left) == value_to_text(right),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_to_text(needle)),
        Value::Array(items) => items.iter().any(|item| {
            match (as_number(item), as_number(needle)) {
                (Some(a), Some(b)) => a == b,
                _ => loose_eq(item, needle),
            }
        }),
        Value::Object(map) => map.contains_key(&value_to_text(needle)),
        _ => false,
    }
}

fn resolve<'a>(operand: &'a Operand, vars: &'a Variables) -> Result<&'a Value> {
    match operand {
        Operand::Lit(v) => Ok(v),
        Operand::Var(name) => vars
            .lookup(name)
            .ok_or_else(|| WeftError::ConditionEvaluation(format!("undefined variable: {}", name))),
    }
}

fn eval(expr: &Expr, vars: &Variables) -> Result<bool> {
    match expr {
        Expr::Or(l, r) => Ok(eval(l, vars)? || eval(r, vars)?),
        Expr::And(l, r) => Ok(eval(l, vars)? && eval(r, vars)?),
        Expr::Not(inner) => Ok(!eval(inner, vars)?),
        Expr::Compare(l, op, r) => compare(resolve(l, vars)?, *op, resolve(r, vars)?),
        Expr::Truthy(operand) => Ok(is_truthy(resolve(operand, vars)?)),
    }
}

fn collect_vars<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Or(l, r) | Expr::And(l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
        Expr::Not(inner) => collect_vars(inner, out),
        Expr::Compare(l, _, r) => {
            push_var(l, out);
            push_var(r, out);
        }
        Expr::Truthy(operand) => push_var(operand, out),
    }
}

fn push_var<'a>(operand: &'a Operand, out: &mut Vec<&'a str>) {
    if let Operand::Var(name) = operand {
        if !out.contains(&name.as_str()) {
            out.push(name.as_str());
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax("missing closing parenthesis")),
                }
            }
            Some(Token::Ident(name)) => self.parse_comparison(Operand::Var(name)),
            Some(Token::Literal(value)) => self.parse_comparison(Operand::Lit(value)),
            Some(tok) => Err(syntax(&format!("unexpected token {:?}", tok))),
            None => Err(syntax("unexpected end of expression")),
        }
    }

    fn parse_comparison(&mut self, left: Operand) -> Result<Expr> {
        let Some(Token::Cmp(op)) = self.peek().cloned() else {
            return Ok(Expr::Truthy(left));
        };
        self.pos += 1;
        let right = match self.next() {
            Some(Token::Ident(name)) => Operand::Var(name),
            Some(Token::Literal(value)) => Operand::Lit(value),
            _ => return Err(syntax(&format!("missing right operand for '{}'", op.as_str()))),
        };
        Ok(Expr::Compare(left, op, right))
    }
}

fn syntax(msg: &str) -> WeftError {
    WeftError::ConditionEvaluation(format!("syntax error: {}", msg))
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next) {
                    ('>', Some('=')) => CmpOp::Gte,
                    ('<', Some('=')) => CmpOp::Lte,
                    ('>', _) => CmpOp::Gt,
                    _ => CmpOp::Lt,
                };
                i += if matches!(op, CmpOp::Gte | CmpOp::Lte) { 2 } else { 1 };
                tokens.push(Token::Cmp(op));
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        ch => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(syntax("unterminated string literal"));
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" | "True" | "TRUE" => Token::Literal(Value::Bool(true)),
                    "false" | "False" | "FALSE" => Token::Literal(Value::Bool(false)),
                    "null" | "nil" => Token::Literal(Value::Null),
                    "contains" => Token::Cmp(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(syntax(&format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| syntax(&format!("invalid number '{}'", text)))
}
