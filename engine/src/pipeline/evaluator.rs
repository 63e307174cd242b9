//! Restricted expression evaluator for `IF_ELSE` / `LOOP` condition strings.
//! Parses a tiny grammar, literals, dotted payload
//! lookups, comparisons, boolean `and`/`or`/`not`, and `+ - *` arithmetic --
//! into an AST and evaluates it against the run payload. Anything outside
//! that grammar (function calls, subscripts, arbitrary attribute access)
//! fails to parse rather than silently running, via a hand-rolled
//! tokenizer + recursive-descent parser.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvaluatorError {
    #[error("invalid condition expression: {0}")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Str(String),
    Ident(String),
    Op(&'static str),
}

fn tokenize(src: &str) -> Result<Vec<Token>, EvaluatorError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    s.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                s.push(chars[i]);
                i += 1;
            }
            if !closed {
                return Err(EvaluatorError::Syntax("unterminated string literal".into()));
            }
            tokens.push(Token::Str(s));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        match two.as_str() {
            "==" | "!=" | "<=" | ">=" => {
                tokens.push(Token::Op(match two.as_str() {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    _ => unreachable!(),
                }));
                i += 2;
                continue;
            }
            _ => {}
        }
        let op = match c {
            '<' => "<",
            '>' => ">",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '(' => return Err(EvaluatorError::Syntax("function calls are not permitted".into())),
            '[' => return Err(EvaluatorError::Syntax("subscripts are not permitted".into())),
            _ => return Err(EvaluatorError::Syntax(format!("unexpected character '{c}'"))),
        };
        tokens.push(Token::Op(op));
        i += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(Vec<String>),
    Not(Box<Expr>),
    BoolOp(bool /* true = and, false = or */, Vec<Expr>),
    Compare(Box<Expr>, Vec<(&'static str, Expr)>),
    BinOp(Box<Expr>, &'static str, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == word)
    }

    fn parse_expr(&mut self) -> Result<Expr, EvaluatorError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, EvaluatorError> {
        let mut values = vec![self.parse_and()?];
        while self.is_ident("or") {
            self.advance();
            values.push(self.parse_and()?);
        }
        if values.len() == 1 {
            Ok(values.pop().unwrap())
        } else {
            Ok(Expr::BoolOp(false, values))
        }
    }

    fn parse_and(&mut self) -> Result<Expr, EvaluatorError> {
        let mut values = vec![self.parse_not()?];
        while self.is_ident("and") {
            self.advance();
            values.push(self.parse_not()?);
        }
        if values.len() == 1 {
            Ok(values.pop().unwrap())
        } else {
            Ok(Expr::BoolOp(true, values))
        }
    }

    fn parse_not(&mut self) -> Result<Expr, EvaluatorError> {
        if self.is_ident("not") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvaluatorError> {
        let left = self.parse_additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op(o @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) => *o,
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_additive()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvaluatorError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(o @ ("+" | "-"))) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvaluatorError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(o @ "*")) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvaluatorError> {
        if matches!(self.peek(), Some(Token::Op("-"))) {
            self.advance();
            if let Some(Token::Number(n)) = self.peek().cloned() {
                self.advance();
                let value: f64 = n
                    .parse()
                    .map_err(|_| EvaluatorError::Syntax(format!("invalid number '{n}'")))?;
                return Ok(Expr::Literal(json_number(-value)));
            }
            return Err(EvaluatorError::Syntax("unary '-' only supported on numeric literals".into()));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvaluatorError> {
        match self.advance() {
            Some(Token::Number(n)) => {
                let value: f64 = n
                    .parse()
                    .map_err(|_| EvaluatorError::Syntax(format!("invalid number '{n}'")))?;
                Ok(Expr::Literal(json_number(value)))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name.split('.').map(String::from).collect())),
            Some(other) => Err(EvaluatorError::Syntax(format!("unexpected token: {other:?}"))),
            None => Err(EvaluatorError::Syntax("unexpected end of expression".into())),
        }
    }
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn resolve_ident(path: &[String], payload: &serde_json::Map<String, Value>) -> Value {
    match path {
        [one] if one == "true" => Value::Bool(true),
        [one] if one == "false" => Value::Bool(false),
        [one] if one == "null" => Value::Null,
        _ => {
            let mut current = Value::Object(payload.clone());
            for part in path {
                current = match current {
                    Value::Object(ref map) => map.get(part).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            current
        }
    }
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => left == right,
        "!=" => left != right,
        _ => match (numeric(left), numeric(right)) {
            (Some(l), Some(r)) => match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => false,
            },
            _ => match (left.as_str(), right.as_str()) {
                (Some(l), Some(r)) => match op {
                    "<" => l < r,
                    "<=" => l <= r,
                    ">" => l > r,
                    ">=" => l >= r,
                    _ => false,
                },
                _ => false,
            },
        },
    }
}

fn eval(expr: &Expr, payload: &serde_json::Map<String, Value>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ident(path) => resolve_ident(path, payload),
        Expr::Not(inner) => Value::Bool(!as_bool(&eval(inner, payload))),
        Expr::BoolOp(is_and, values) => {
            let mut iter = values.iter();
            let mut result = eval(iter.next().unwrap(), payload);
            for value_expr in iter {
                let next = eval(value_expr, payload);
                result = if *is_and {
                    if as_bool(&result) {
                        next
                    } else {
                        result
                    }
                } else if as_bool(&result) {
                    result
                } else {
                    next
                };
            }
            result
        }
        Expr::Compare(left, rest) => {
            let mut left_val = eval(left, payload);
            for (op, right_expr) in rest {
                let right_val = eval(right_expr, payload);
                if !compare(op, &left_val, &right_val) {
                    return Value::Bool(false);
                }
                left_val = right_val;
            }
            Value::Bool(true)
        }
        Expr::BinOp(left, op, right) => {
            let l = eval(left, payload);
            let r = eval(right, payload);
            match (*op, &l, &r) {
                ("+", Value::String(a), Value::String(b)) => Value::String(format!("{a}{b}")),
                _ => match (numeric(&l), numeric(&r)) {
                    (Some(a), Some(b)) => json_number(match *op {
                        "+" => a + b,
                        "-" => a - b,
                        "*" => a * b,
                        _ => 0.0,
                    }),
                    _ => Value::Null,
                },
            }
        }
    }
}

/// Evaluates `expression` against `payload`. An empty (or whitespace-only)
/// expression is `false` by definition, never an error.
pub fn evaluate_condition(
    expression: &str,
    payload: &serde_json::Map<String, Value>,
) -> Result<bool, EvaluatorError> {
    if expression.trim().is_empty() {
        return Ok(false);
    }
    let tokens = tokenize(expression.trim())?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvaluatorError::Syntax("trailing tokens after expression".into()));
    }
    Ok(as_bool(&eval(&ast, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn empty_expression_is_false() {
        assert_eq!(evaluate_condition("", &payload(&[])).unwrap(), false);
        assert_eq!(evaluate_condition("   ", &payload(&[])).unwrap(), false);
    }

    #[test]
    fn numeric_comparison() {
        let p = payload(&[("word_count", json!(600))]);
        assert!(evaluate_condition("word_count > 500", &p).unwrap());
        assert!(!evaluate_condition("word_count > 700", &p).unwrap());
    }

    #[test]
    fn boolean_identifier_synonyms() {
        let p = payload(&[("ready", json!(true))]);
        assert!(evaluate_condition("ready == true", &p).unwrap());
    }

    #[test]
    fn string_equality() {
        let p = payload(&[("status", json!("done"))]);
        assert!(evaluate_condition("status == 'done'", &p).unwrap());
    }

    #[test]
    fn dotted_attribute_access() {
        let p = payload(&[("result", json!({"ready": true}))]);
        assert!(evaluate_condition("result.ready == true", &p).unwrap());
    }

    #[test]
    fn unknown_key_resolves_to_null() {
        let p = payload(&[]);
        assert!(!evaluate_condition("missing_key == true", &p).unwrap());
    }

    #[test]
    fn boolean_and_or_not() {
        let p = payload(&[("a", json!(true)), ("b", json!(false))]);
        assert!(evaluate_condition("a and not b", &p).unwrap());
        assert!(evaluate_condition("a or b", &p).unwrap());
        assert!(!evaluate_condition("not a", &p).unwrap());
    }

    #[test]
    fn arithmetic_then_compare() {
        let p = payload(&[("x", json!(3))]);
        assert!(evaluate_condition("x + 2 > 4", &p).unwrap());
    }

    #[test]
    fn function_calls_are_rejected() {
        let err = evaluate_condition("len(x) > 0", &payload(&[])).unwrap_err();
        assert!(matches!(err, EvaluatorError::Syntax(_)));
    }

    #[test]
    fn subscripts_are_rejected() {
        let err = evaluate_condition("x[0] == 1", &payload(&[])).unwrap_err();
        assert!(matches!(err, EvaluatorError::Syntax(_)));
    }

    #[test]
    fn malformed_expression_is_a_validation_error() {
        let err = evaluate_condition("x >", &payload(&[])).unwrap_err();
        assert!(matches!(err, EvaluatorError::Syntax(_)));
    }
}
