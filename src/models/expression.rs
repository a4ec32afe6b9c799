//! Condition expression language for sequence flows.
//!
//! Conditions such as `x > 3 && status == "open"` are lexed with logos and
//! parsed by recursive descent into a small AST that is evaluated against
//! the instance's variables.
//!
//! # Grammar
//!
//! ```text
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := INT | FLOAT | STRING | "true" | "false" | IDENT
//!          | "-" primary | "(" or ")"
//! ```
//!
//! Identifiers name variables. Comparisons between numbers coerce int and
//! float; a number compared with a string parses the string.

use std::cmp::Ordering;
use std::fmt;

use logos::Logos;

use super::variable::{Value, VarType};
use crate::{Result, ThresherError};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Lexeme {
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("&&")]
    #[token("and")]
    And,
    #[token("||")]
    #[token("or")]
    Or,
    #[token("!")]
    #[token("not")]
    Not,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("-")]
    Minus,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    #[regex(r"'[^']*'", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Expression> {
        let mut tokens = Vec::new();
        for (tok, span) in Lexeme::lexer(source).spanned() {
            match tok {
                Ok(t) => tokens.push(t),
                Err(()) => {
                    return Err(ThresherError::Expression {
                        source_text: source.to_string(),
                        reason: format!("unexpected input at {}..{}", span.start, span.end),
                    })
                }
            }
        }
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error(format!("unexpected token {:?}", parser.tokens[parser.pos])));
        }
        Ok(Expression {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of every variable the expression reads
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_vars(&self.root, &mut out);
        out
    }

    /// Evaluate to a boolean, resolving variables through `lookup`
    pub fn evaluate<F>(&self, lookup: &F) -> Result<bool>
    where
        F: Fn(&str) -> Result<Value>,
    {
        let v = self.eval(&self.root, lookup)?;
        Ok(v.as_bool())
    }

    fn eval<F>(&self, expr: &Expr, lookup: &F) -> Result<Value>
    where
        F: Fn(&str) -> Result<Value>,
    {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => lookup(name),
            Expr::Neg(inner) => match self.eval(inner, lookup)? {
                Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| {
                    ThresherError::Expression {
                        source_text: self.source.clone(),
                        reason: format!("cannot negate {}", i),
                    }
                }),
                other => Ok(Value::Float(-other.as_float()?)),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner, lookup)?.as_bool())),
            Expr::And(l, r) => {
                if !self.eval(l, lookup)?.as_bool() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(r, lookup)?.as_bool()))
            }
            Expr::Or(l, r) => {
                if self.eval(l, lookup)?.as_bool() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(r, lookup)?.as_bool()))
            }
            Expr::Compare(op, l, r) => {
                let left = self.eval(l, lookup)?;
                let right = self.eval(r, lookup)?;
                let ord = compare_values(&left, &right)?;
                let result = match op {
                    CmpOp::Eq => ord == Some(Ordering::Equal),
                    CmpOp::Ne => ord != Some(Ordering::Equal),
                    CmpOp::Lt => ord == Some(Ordering::Less),
                    CmpOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                    CmpOp::Gt => ord == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                };
                Ok(Value::Bool(result))
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Order two values, coercing mixed types
///
/// Numbers compare numerically across int and float; a time or bool on either
/// side pulls the other operand into that type; anything else goes through
/// float coercion, so unparseable strings are errors.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Result<Option<Ordering>> {
    use Value::*;
    let ord = match (left, right) {
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Time(a), Time(b)) => Some(a.cmp(b)),
        (Time(a), other) | (other, Time(a)) => {
            let b = other.as_time()?;
            let o = a.cmp(&b);
            Some(if matches!(left, Time(_)) { o } else { o.reverse() })
        }
        (Bool(a), other) | (other, Bool(a)) => {
            let o = a.cmp(&other.as_bool());
            Some(if matches!(left, Bool(_)) { o } else { o.reverse() })
        }
        (a, b) => {
            let fa = a.coerce(VarType::Float)?.as_float()?;
            let fb = b.coerce(VarType::Float)?.as_float()?;
            fa.partial_cmp(&fb)
        }
    };
    Ok(ord)
}

fn collect_vars(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Var(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Neg(e) | Expr::Not(e) => collect_vars(e, out),
        Expr::Compare(_, l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Lexeme>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: String) -> ThresherError {
        ThresherError::Expression {
            source_text: self.source.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Lexeme> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Lexeme> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Lexeme::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Lexeme::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Lexeme::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Lexeme::EqEq) => CmpOp::Eq,
            Some(Lexeme::NotEq) => CmpOp::Ne,
            Some(Lexeme::Lt) => CmpOp::Lt,
            Some(Lexeme::Le) => CmpOp::Le,
            Some(Lexeme::Gt) => CmpOp::Gt,
            Some(Lexeme::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Lexeme::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Lexeme::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Lexeme::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Lexeme::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Lexeme::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Lexeme::Ident(name)) => Ok(Expr::Var(name)),
            Some(Lexeme::Minus) => Ok(Expr::Neg(Box::new(self.parse_primary()?))),
            Some(Lexeme::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Lexeme::RParen) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis".to_string())),
                }
            }
            Some(other) => Err(self.error(format!("unexpected token {:?}", other))),
            None => Err(self.error("unexpected end of expression".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("x".to_string(), Value::Int(5));
        m.insert("rate".to_string(), Value::Float(0.5));
        m.insert("status".to_string(), Value::Str("open".to_string()));
        m.insert("count_text".to_string(), Value::Str("12".to_string()));
        m.insert("flag".to_string(), Value::Bool(true));
        m
    }

    fn eval(src: &str) -> Result<bool> {
        let vars = vars();
        let lookup = |name: &str| {
            vars.get(name)
                .cloned()
                .ok_or_else(|| ThresherError::VariableNotFound(name.to_string()))
        };
        Expression::parse(src)?.evaluate(&lookup)
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("x > 3").unwrap());
        assert!(eval("x>3").unwrap());
        assert!(!eval("x < 3").unwrap());
        assert!(eval("x >= 5 && x <= 5").unwrap());
        assert!(eval("rate < 1").unwrap());
        assert!(eval("x == 5.0").unwrap());
        assert!(eval("x > -1").unwrap());
    }

    #[test]
    fn test_strings_and_logic() {
        assert!(eval("status == \"open\"").unwrap());
        assert!(eval("status != 'closed'").unwrap());
        assert!(eval("count_text > 10").unwrap());
        assert!(eval("flag and not (x < 3)").unwrap());
        assert!(eval("x < 3 || flag").unwrap());
        assert!(eval("!(x < 3)").unwrap());
        assert!(eval("flag").unwrap());
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        assert!(matches!(eval("missing > 1"), Err(ThresherError::VariableNotFound(_))));
    }

    #[test]
    fn test_short_circuit_skips_missing_variable() {
        assert!(eval("flag || missing > 1").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("x >").is_err());
        assert!(Expression::parse("(x > 1").is_err());
        assert!(Expression::parse("x > 1 1").is_err());
        assert!(Expression::parse("x # 1").is_err());
    }

    #[test]
    fn test_negating_min_int_is_an_error() {
        let lookup = |_: &str| -> Result<Value> { Ok(Value::Int(i64::MIN)) };
        let e = Expression::parse("-x > 0").unwrap();
        assert!(matches!(e.evaluate(&lookup), Err(ThresherError::Expression { .. })));
        assert!(eval("-x < 0").unwrap());
    }

    #[test]
    fn test_variables_listed_once() {
        let e = Expression::parse("x > 1 && (x < 10 || rate == 2.5)").unwrap();
        assert_eq!(e.variables(), vec!["x".to_string(), "rate".to_string()]);
    }
}
