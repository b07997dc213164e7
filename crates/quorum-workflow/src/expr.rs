// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Edge condition expressions.
//!
//! A deliberately small, total language evaluated against one JSON value
//! (the source node-run's output) and nothing else:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | cmp
//! cmp     := term (("=="|"!="|"<="|">="|"<"|">") term)?
//! term    := literal | path | "(" expr ")"
//! literal := number | string | true | false | null
//! path    := ident ("." ident)*
//! ```
//!
//! Paths resolve inside the output object (`output.x` and `x` are the same).
//! Comparisons between mismatched types are `false`, never an error; the
//! only errors are syntax errors, raised at parse time.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error at offset {0}")]
    Syntax(usize),
    #[error("expression too deep")]
    TooDeep,
}

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
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

/// Parse and evaluate `source` against `output`.  A missing path evaluates
/// to `null`; a bare path is truthy like JavaScript (non-null, non-false,
/// non-zero, non-empty string).
pub fn evaluate(source: &str, output: &Value) -> Result<bool, ExprError> {
    let expr = Parser::new(source).parse()?;
    Ok(truthy(&eval(&expr, output)))
}

fn eval(expr: &Expr, output: &Value) -> Value {
    match expr {
        Expr::Lit(v) => v.clone(),
        Expr::Path(segments) => {
            let mut cur = output;
            let mut iter = segments.iter();
            // Leading `output.` is an alias for the root.
            let mut first = iter.next();
            if first.map(String::as_str) == Some("output") {
                first = iter.next();
            }
            for seg in first.into_iter().chain(iter) {
                match cur.get(seg) {
                    Some(next) => cur = next,
                    None => return Value::Null,
                }
            }
            cur.clone()
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, output))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, output)) && truthy(&eval(b, output))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, output)) || truthy(&eval(b, output))),
        Expr::Cmp(a, op, b) => Value::Bool(compare(&eval(a, output), *op, &eval(b, output))),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    use CmpOp::*;
    match op {
        Eq => a == b,
        Ne => a != b,
        Lt | Le | Gt | Ge => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return false;
            };
            match op {
                Lt => x < y,
                Le => x <= y,
                Gt => x > y,
                Ge => x >= y,
                _ => unreachable!(),
            }
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(ExprError::Syntax(self.pos));
        }
        Ok(expr)
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.eat(b"||") {
                let right = self.parse_and()?;
                left = Expr::Or(Box::new(left), Box::new(right));
            } else {
                self.depth -= 1;
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let mut left = self.parse_unary()?;
        loop {
            self.skip_ws();
            if self.eat(b"&&") {
                let right = self.parse_unary()?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else {
                self.depth -= 1;
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        self.skip_ws();
        let expr = if self.peek() == Some(b'!') && self.src.get(self.pos + 1) != Some(&b'=') {
            self.pos += 1;
            Expr::Not(Box::new(self.parse_unary()?))
        } else {
            self.parse_cmp()?
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_term()?;
        self.skip_ws();
        let op = if self.eat(b"==") {
            CmpOp::Eq
        } else if self.eat(b"!=") {
            CmpOp::Ne
        } else if self.eat(b"<=") {
            CmpOp::Le
        } else if self.eat(b">=") {
            CmpOp::Ge
        } else if self.eat(b"<") {
            CmpOp::Lt
        } else if self.eat(b">") {
            CmpOp::Gt
        } else {
            return Ok(left);
        };
        let right = self.parse_term()?;
        Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.skip_ws();
                if !self.eat(b")") {
                    return Err(ExprError::Syntax(self.pos));
                }
                Ok(inner)
            }
            Some(b'\'') | Some(b'"') => self.parse_string(),
            Some(c) if c.is_ascii_digit() || c == b'-' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.parse_path_or_keyword(),
            _ => Err(ExprError::Syntax(self.pos)),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, ExprError> {
        let quote = self.src[self.pos];
        self.pos += 1;
        let start = self.pos;
        while let Some(&c) = self.src.get(self.pos) {
            if c == quote {
                let s = std::str::from_utf8(&self.src[start..self.pos])
                    .map_err(|_| ExprError::Syntax(start))?;
                self.pos += 1;
                return Ok(Expr::Lit(Value::String(s.to_string())));
            }
            self.pos += 1;
        }
        Err(ExprError::Syntax(start))
    }

    fn parse_number(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self
            .peek()
            .map(|c| c.is_ascii_digit() || c == b'.')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| ExprError::Syntax(start))?;
        let n: f64 = text.parse().map_err(|_| ExprError::Syntax(start))?;
        let value = serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        Ok(Expr::Lit(value))
    }

    fn parse_path_or_keyword(&mut self) -> Result<Expr, ExprError> {
        let mut segments = Vec::new();
        loop {
            let start = self.pos;
            while self
                .peek()
                .map(|c| c.is_ascii_alphanumeric() || c == b'_')
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            if start == self.pos {
                return Err(ExprError::Syntax(self.pos));
            }
            let seg = std::str::from_utf8(&self.src[start..self.pos])
                .map_err(|_| ExprError::Syntax(start))?
                .to_string();
            segments.push(seg);
            if self.peek() == Some(b'.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if segments.len() == 1 {
            match segments[0].as_str() {
                "true" => return Ok(Expr::Lit(Value::Bool(true))),
                "false" => return Ok(Expr::Lit(Value::Bool(false))),
                "null" => return Ok(Expr::Lit(Value::Null)),
                _ => {}
            }
        }
        Ok(Expr::Path(segments))
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|c| c.is_ascii_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, token: &[u8]) -> bool {
        if self.src[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output() -> Value {
        json!({"status": "ok", "count": 3, "nested": {"flag": true}, "empty": ""})
    }

    #[test]
    fn equality_on_strings() {
        assert!(evaluate("status == 'ok'", &output()).unwrap());
        assert!(!evaluate("status == 'fail'", &output()).unwrap());
        assert!(evaluate("status != 'fail'", &output()).unwrap());
    }

    #[test]
    fn output_prefix_is_an_alias() {
        assert!(evaluate("output.status == 'ok'", &output()).unwrap());
        assert!(evaluate("output.nested.flag", &output()).unwrap());
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate("count > 2", &output()).unwrap());
        assert!(evaluate("count <= 3", &output()).unwrap());
        assert!(!evaluate("count < 3", &output()).unwrap());
    }

    #[test]
    fn boolean_connectives_and_negation() {
        assert!(evaluate("status == 'ok' && count > 0", &output()).unwrap());
        assert!(evaluate("status == 'x' || nested.flag", &output()).unwrap());
        assert!(evaluate("!(status == 'x')", &output()).unwrap());
        assert!(evaluate("!empty", &output()).unwrap());
    }

    #[test]
    fn missing_path_is_null_and_falsy() {
        assert!(!evaluate("does.not.exist", &output()).unwrap());
        assert!(evaluate("does.not.exist == null", &output()).unwrap());
    }

    #[test]
    fn type_mismatch_comparisons_are_false_not_errors() {
        assert!(!evaluate("status > 2", &output()).unwrap());
        assert!(!evaluate("nested < 1", &output()).unwrap());
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(evaluate("status ==", &output()).is_err());
        assert!(evaluate("(status", &output()).is_err());
        assert!(evaluate("status = 'ok'", &output()).is_err());
    }

    #[test]
    fn depth_is_bounded() {
        let deep = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&deep, &output()), Err(ExprError::TooDeep));
    }

    #[test]
    fn no_process_state_is_reachable() {
        // Only the provided output is visible; anything else is null.
        assert!(!evaluate("env", &json!({})).unwrap());
        assert!(!evaluate("process.pid", &json!({})).unwrap());
    }
}
