//! Snippet engine - a deliberately tiny statement language
//!
//! ```text
//! // comments run to the end of the line
//! let total = order.total      // declarations: let / var
//! order.status = "seen"        // assignment into the job's own copy
//! throw "reason"               // runtime failure
//! sleep 250                    // block for N milliseconds
//! loop                         // spin until the deadline
//! grow                         // allocate until the deadline
//! total                        // a trailing expression is the result
//! ```
//!
//! Statements are separated by newlines or `;`. Expressions are literals
//! (`null`, `true`, `false`, `undefined`, numbers, quoted strings) or dotted
//! lookups into the scope.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::engine::ScriptEngine;

/// Allocation step for `grow`
const GROW_CHUNK_BYTES: usize = 256 * 1024;
const GROW_PAUSE: Duration = Duration::from_millis(1);

const KEYWORDS: &[&str] = &["let", "var", "throw", "sleep", "loop", "grow"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnippetError {
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { line: usize, message: String },

    #[error("ReferenceError: {0} is not defined")]
    Reference(String),

    #[error("TypeError: {0}")]
    Type(String),

    /// Value of a `throw` statement
    #[error("{0}")]
    Thrown(String),

    #[error("Script execution timed out after {0}ms")]
    Timeout(u128),
}

fn syntax(line: usize, message: impl Into<String>) -> SnippetError {
    SnippetError::Syntax {
        line,
        message: message.into(),
    }
}

// ----------------------------------------------------------------------------
// Syntax
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    Assign,
    /// Statement separator
    End,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Undefined,
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Declare(String, Expr),
    Assign(Vec<String>, Expr),
    Throw(Expr),
    Sleep(Expr),
    Loop,
    Grow,
    Expr(Expr),
}

fn tokenize(code: &str) -> Result<Vec<(Token, usize)>, SnippetError> {
    let mut tokens = Vec::new();
    let mut chars = code.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                tokens.push((Token::End, line));
                line += 1;
            }
            ';' => {
                chars.next();
                tokens.push((Token::End, line));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() != Some(&'/') {
                    return Err(syntax(line, "Unexpected token '/'"));
                }
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '.' => {
                chars.next();
                tokens.push((Token::Dot, line));
            }
            '=' => {
                chars.next();
                tokens.push((Token::Assign, line));
            }
            '"' | '\'' => {
                chars.next();
                tokens.push((Token::Str(lex_string(&mut chars, c, line)?), line));
            }
            c if c.is_ascii_digit() || c == '-' => {
                tokens.push((Token::Number(lex_number(&mut chars, line)?), line));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_alphanumeric() || c == '_' || c == '$') {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push((Token::Ident(ident), line));
            }
            other => return Err(syntax(line, format!("Unexpected token '{}'", other))),
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &mut Peekable<Chars<'_>>, quote: char, line: usize) -> Result<String, SnippetError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some(c) if c == quote => return Ok(value),
            Some('\\') => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(c @ ('\\' | '"' | '\'')) => value.push(c),
                _ => return Err(syntax(line, "Invalid escape sequence")),
            },
            Some('\n') | None => return Err(syntax(line, "Invalid or unexpected token")),
            Some(c) => value.push(c),
        }
    }
}

fn lex_number(chars: &mut Peekable<Chars<'_>>, line: usize) -> Result<f64, SnippetError> {
    let mut raw = String::new();
    if chars.peek() == Some(&'-') {
        raw.push('-');
        chars.next();
    }
    while let Some(&c) = chars.peek() {
        let exponent_sign = (c == '+' || c == '-') && raw.ends_with(['e', 'E']);
        if !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign) {
            break;
        }
        raw.push(c);
        chars.next();
    }
    raw.parse::<f64>()
        .map_err(|_| syntax(line, format!("Invalid number '{}'", raw)))
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn parse(code: &str) -> Result<Vec<Statement>, SnippetError> {
        let mut parser = Parser {
            tokens: tokenize(code)?,
            pos: 0,
        };
        let mut statements = Vec::new();
        while parser.pos < parser.tokens.len() {
            if parser.eat(&Token::End) {
                continue;
            }
            statements.push(parser.statement()?);
            if !parser.at_end() && !parser.eat(&Token::End) {
                return Err(parser.unexpected());
            }
        }
        Ok(statements)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |(_, line)| *line)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn unexpected(&self) -> SnippetError {
        match self.peek() {
            None | Some(Token::End) => syntax(self.line(), "Unexpected end of input"),
            Some(Token::Ident(name)) => syntax(self.line(), format!("Unexpected identifier '{}'", name)),
            Some(token) => syntax(self.line(), format!("Unexpected token {:?}", token)),
        }
    }

    fn statement(&mut self) -> Result<Statement, SnippetError> {
        let keyword = match self.peek() {
            Some(Token::Ident(name)) if KEYWORDS.contains(&name.as_str()) => name.clone(),
            _ => {
                let target = self.expr()?;
                if !self.eat(&Token::Assign) {
                    return Ok(Statement::Expr(target));
                }
                let Expr::Path(path) = target else {
                    return Err(syntax(self.line(), "Invalid left-hand side in assignment"));
                };
                return Ok(Statement::Assign(path, self.expr()?));
            }
        };
        self.pos += 1;

        match keyword.as_str() {
            "let" | "var" => {
                let name = match self.peek() {
                    Some(Token::Ident(name)) if !KEYWORDS.contains(&name.as_str()) => name.clone(),
                    _ => return Err(self.unexpected()),
                };
                self.pos += 1;
                let init = if self.eat(&Token::Assign) {
                    self.expr()?
                } else {
                    Expr::Undefined
                };
                Ok(Statement::Declare(name, init))
            }
            "throw" => Ok(Statement::Throw(self.expr()?)),
            "sleep" => Ok(Statement::Sleep(self.expr()?)),
            "loop" => Ok(Statement::Loop),
            _ => Ok(Statement::Grow),
        }
    }

    fn expr(&mut self) -> Result<Expr, SnippetError> {
        let line = self.line();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "null" => Ok(Expr::Literal(Value::Null)),
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "undefined" => Ok(Expr::Undefined),
                keyword if KEYWORDS.contains(&keyword) => {
                    Err(syntax(line, format!("Unexpected token '{}'", keyword)))
                }
                _ => {
                    let mut path = vec![name];
                    while self.eat(&Token::Dot) {
                        match self.next() {
                            Some(Token::Ident(segment)) => path.push(segment),
                            _ => return Err(syntax(line, "Unexpected token after '.'")),
                        }
                    }
                    Ok(Expr::Path(path))
                }
            },
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Prepared snippet plus its per-execution time budget
#[derive(Debug, Clone)]
pub struct SnippetScript {
    statements: Vec<Statement>,
    timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SnippetEngine;

impl SnippetEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for SnippetEngine {
    type Script = SnippetScript;

    fn prepare(&self, code: &str, timeout: Option<Duration>) -> Result<SnippetScript, String> {
        let statements = Parser::parse(code).map_err(|e| e.to_string())?;
        Ok(SnippetScript {
            statements,
            timeout,
        })
    }

    fn load_library(&self, module: &str) -> Result<Value, String> {
        let mut exports = Map::new();
        match module {
            "os" => {
                exports.insert("platform".into(), std::env::consts::OS.into());
                exports.insert("arch".into(), std::env::consts::ARCH.into());
                exports.insert("EOL".into(), if cfg!(windows) { "\r\n" } else { "\n" }.into());
            }
            "path" => {
                exports.insert("sep".into(), std::path::MAIN_SEPARATOR_STR.into());
                exports.insert("delimiter".into(), if cfg!(windows) { ";" } else { ":" }.into());
            }
            other => return Err(format!("Cannot find module '{}'", other)),
        }
        Ok(Value::Object(exports))
    }

    fn execute(
        &self,
        script: &SnippetScript,
        scope: Map<String, Value>,
    ) -> Result<Option<Value>, String> {
        let mut execution = Execution {
            vars: scope.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            deadline: script.timeout.map(|t| Instant::now() + t),
            timeout: script.timeout.unwrap_or_default(),
        };
        execution.run(&script.statements).map_err(|e| e.to_string())
    }
}

/// One run of a script; `None` values are `undefined`
struct Execution {
    vars: HashMap<String, Option<Value>>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl Execution {
    fn run(&mut self, statements: &[Statement]) -> Result<Option<Value>, SnippetError> {
        let mut completion = None;
        for statement in statements {
            completion = None;
            match statement {
                Statement::Declare(name, expr) => {
                    let value = self.eval(expr)?;
                    self.vars.insert(name.clone(), value);
                }
                Statement::Assign(path, expr) => {
                    let value = self.eval(expr)?;
                    self.assign(path, value)?;
                }
                Statement::Throw(expr) => {
                    let thrown = match self.eval(expr)? {
                        Some(Value::String(s)) => s,
                        Some(other) => other.to_string(),
                        None => "undefined".to_string(),
                    };
                    return Err(SnippetError::Thrown(thrown));
                }
                Statement::Sleep(expr) => {
                    let millis = match self.eval(expr)? {
                        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0).max(0.0),
                        other => {
                            return Err(SnippetError::Type(format!(
                                "sleep expects milliseconds, got {}",
                                describe(other.as_ref())
                            )))
                        }
                    };
                    self.sleep(Duration::from_millis(millis as u64))?;
                }
                Statement::Loop => self.spin()?,
                Statement::Grow => self.grow()?,
                Statement::Expr(expr) => completion = self.eval(expr)?,
            }
        }
        Ok(completion)
    }

    fn eval(&self, expr: &Expr) -> Result<Option<Value>, SnippetError> {
        let path = match expr {
            Expr::Literal(value) => return Ok(Some(value.clone())),
            Expr::Undefined => return Ok(None),
            Expr::Path(path) => path,
        };
        let (root, rest) = split_path(path)?;
        let mut current = self
            .vars
            .get(root)
            .ok_or_else(|| SnippetError::Reference(root.clone()))?
            .clone();

        for segment in rest {
            current = match current {
                Some(Value::Object(mut map)) => map.remove(segment),
                Some(Value::Array(items)) if segment == "length" => Some(items.len().into()),
                Some(Value::String(s)) if segment == "length" => Some(s.chars().count().into()),
                None => return Err(cannot_read("undefined", segment)),
                Some(Value::Null) => return Err(cannot_read("null", segment)),
                Some(_) => None,
            };
        }
        Ok(current)
    }

    fn assign(&mut self, path: &[String], value: Option<Value>) -> Result<(), SnippetError> {
        let (root, rest) = split_path(path)?;
        let slot = self
            .vars
            .get_mut(root)
            .ok_or_else(|| SnippetError::Reference(root.clone()))?;
        let Some((last, parents)) = rest.split_last() else {
            *slot = value;
            return Ok(());
        };

        let cannot_set = |target: Option<&Value>, segment: &str| {
            SnippetError::Type(format!(
                "Cannot set properties of {} (setting '{}')",
                describe(target),
                segment
            ))
        };
        let mut target = match slot {
            Some(target) => target,
            None => return Err(cannot_set(None, rest[0].as_str())),
        };
        for segment in parents {
            let current = target;
            target = match current {
                Value::Object(map) => match map.get_mut(segment) {
                    Some(next) => next,
                    None => return Err(cannot_set(None, segment)),
                },
                other => return Err(cannot_set(Some(&*other), segment)),
            };
        }
        match target {
            Value::Object(map) => {
                map.insert(last.clone(), value.unwrap_or(Value::Null));
                Ok(())
            }
            other => Err(cannot_set(Some(&*other), last)),
        }
    }

    fn timed_out(&self) -> SnippetError {
        SnippetError::Timeout(self.timeout.as_millis())
    }

    fn sleep(&self, duration: Duration) -> Result<(), SnippetError> {
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if wake > deadline => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                Err(self.timed_out())
            }
            _ => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }

    fn spin(&self) -> Result<(), SnippetError> {
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.timed_out());
            }
            std::hint::spin_loop();
        }
    }

    fn grow(&self) -> Result<(), SnippetError> {
        let mut hoard: Vec<Vec<u8>> = Vec::new();
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.timed_out());
            }
            // Non-zero fill so the pages are actually resident
            hoard.push(vec![0xA5; GROW_CHUNK_BYTES]);
            std::thread::sleep(GROW_PAUSE);
        }
    }
}

fn cannot_read(kind: &str, segment: &str) -> SnippetError {
    SnippetError::Type(format!(
        "Cannot read properties of {} (reading '{}')",
        kind, segment
    ))
}

fn split_path(path: &[String]) -> Result<(&String, &[String]), SnippetError> {
    path.split_first()
        .ok_or_else(|| SnippetError::Type("empty reference".to_string()))
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(code: &str, scope: Value) -> Result<Option<Value>, String> {
        run_with_timeout(code, scope, None)
    }

    fn run_with_timeout(
        code: &str,
        scope: Value,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, String> {
        let engine = SnippetEngine::new();
        let script = engine.prepare(code, timeout)?;
        let Value::Object(scope) = scope else {
            panic!("scope must be an object");
        };
        engine.execute(&script, scope)
    }

    #[test]
    fn test_trailing_expression_is_result() {
        assert_eq!(run("data", json!({"data": "test"})), Ok(Some(json!("test"))));
        assert_eq!(run("order.items.length", json!({"order": {"items": [1, 2]}})), Ok(Some(json!(2))));
        assert_eq!(run("let x = 1", json!({})), Ok(None));
        assert_eq!(run("1.5; -3; 'done'", json!({})), Ok(Some(json!("done"))));
        assert_eq!(run("-3", json!({})), Ok(Some(json!(-3))));
        assert_eq!(run("missing.field", json!({"missing": {}})), Ok(None));
    }

    #[test]
    fn test_declarations_and_assignment() {
        let code = "// copy and tweak\nvar x = data\nx.seen = true; x.note = \"it's\"\nx";
        assert_eq!(
            run(code, json!({"data": {"n": 1}})),
            Ok(Some(json!({"n": 1, "seen": true, "note": "it's"})))
        );
    }

    #[test]
    fn test_reference_and_type_errors() {
        assert_eq!(run("nope", json!({})), Err("ReferenceError: nope is not defined".to_string()));
        assert_eq!(run("nope = 1", json!({})), Err("ReferenceError: nope is not defined".to_string()));
        assert_eq!(
            run("data.a.b", json!({"data": null})),
            Err("TypeError: Cannot read properties of null (reading 'a')".to_string())
        );
        assert_eq!(
            run("data.a.b = 1", json!({"data": {}})),
            Err("TypeError: Cannot set properties of undefined (setting 'a')".to_string())
        );
    }

    #[test]
    fn test_throw() {
        assert_eq!(run("throw 'boom'", json!({})), Err("boom".to_string()));
        assert_eq!(run("throw data", json!({"data": {"code": 7}})), Err(r#"{"code":7}"#.to_string()));
    }

    #[test]
    fn test_syntax_errors_fail_prepare() {
        let engine = SnippetEngine::new();
        for code in ["let = 1", "'open", "a +", "data.", "1 = 2", "let x = throw", "sleep"] {
            let err = engine.prepare(code, None).unwrap_err();
            assert!(err.starts_with("SyntaxError: "), "{}: {}", code, err);
        }
        assert!(engine.prepare("", None).is_ok());
    }

    #[test]
    fn test_loop_and_grow_stop_at_deadline() {
        let timeout = Some(Duration::from_millis(30));
        let started = Instant::now();
        assert_eq!(
            run_with_timeout("loop", json!({}), timeout),
            Err("Script execution timed out after 30ms".to_string())
        );
        assert!(started.elapsed() >= Duration::from_millis(30));

        assert_eq!(
            run_with_timeout("grow", json!({}), timeout),
            Err("Script execution timed out after 30ms".to_string())
        );
    }

    #[test]
    fn test_sleep() {
        assert_eq!(run("sleep 5; 'awake'", json!({})), Ok(Some(json!("awake"))));
        assert_eq!(
            run_with_timeout("sleep 1000", json!({}), Some(Duration::from_millis(10))),
            Err("Script execution timed out after 10ms".to_string())
        );
        assert!(run("sleep 'soon'", json!({})).unwrap_err().starts_with("TypeError"));
    }

    #[test]
    fn test_libraries() {
        let engine = SnippetEngine::new();
        let os = engine.load_library("os").unwrap();
        assert_eq!(os["platform"], json!(std::env::consts::OS));
        let path = engine.load_library("path").unwrap();
        assert_eq!(path["sep"], json!(std::path::MAIN_SEPARATOR_STR));
        assert_eq!(engine.load_library("fs"), Err("Cannot find module 'fs'".to_string()));
    }
}
