//! Template expansion applied to a task's argument line just before
//! execution (or at submit time). A pattern is a command-line containing
//! `{...}` placeholders:
//!
//! - `{}`: the full argument line
//! - `{[i]}`, `{[a:b]}`, `{[a:b:s]}`: whitespace slices, 0-indexed,
//!   negative from the end, end-exclusive
//! - `{/}`, `{/-}`, `{-}`, `{+}`, `{++}`, `{.}`, `{..}`: filepath
//!   derivations treating the argument line as a path
//! - `{% CMD %}`: run CMD through the shell with `@` replaced by the
//!   argument line, splice the trimmed stdout
//! - `{= EXPR =}`: evaluate a restricted expression with the coerced
//!   argument line bound to `x`

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{HyperError, Result};

/// A plain `{}` passes the argument line through verbatim.
pub const DEFAULT_TEMPLATE: &str = "{}";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(.*?)\}").unwrap());

#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
}

impl Template {
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.raw
    }

    /// Expand the template against the input argument line.
    pub fn expand(&self, args: &str) -> Result<String> {
        if !PATTERN.is_match(&self.raw) {
            return Ok(self.raw.clone());
        }
        let mut expansion = String::new();
        let mut index = 0;
        for found in PATTERN.captures_iter(&self.raw) {
            let whole = found.get(0).unwrap();
            let key = found.get(1).unwrap().as_str().trim();
            expansion.push_str(&self.raw[index..whole.start()]);
            expansion.push_str(&expand_key(args, key, whole.start())?);
            index = whole.end();
        }
        expansion.push_str(&self.raw[index..]);
        Ok(expansion)
    }
}

fn expand_key(args: &str, key: &str, position: usize) -> Result<String> {
    match key {
        "" => Ok(args.to_string()),
        "." => Ok(dirname(args)),
        ".." => Ok(dirname(&dirname(args))),
        "/" => Ok(basename(args)),
        "/-" => Ok(split_ext(&basename(args)).0),
        "-" => Ok(split_ext(args).0),
        "+" => Ok(split_ext(args).1),
        "++" => Ok(split_ext(args).1.trim_start_matches('.').to_string()),
        _ => {
            if let Some(inner) = key.strip_prefix('[').and_then(|k| k.strip_suffix(']')) {
                expand_slice(args, inner)
            } else if let Some(inner) = key.strip_prefix('=').and_then(|k| k.strip_suffix('=')) {
                eval::evaluate(inner.trim(), args)
                    .map_err(|err| HyperError::Template(format!("'{{{key}}}' for ({args}): {err}")))
            } else if let Some(inner) = key.strip_prefix('%').and_then(|k| k.strip_suffix('%')) {
                expand_shell(args, inner.trim())
            } else {
                Err(HyperError::Template(format!(
                    "unrecognized pattern '{{{key}}}' in template (at position {position})"
                )))
            }
        }
    }
}

fn dirname(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Split a trailing extension like `os.path.splitext`: the dot must not be
/// the leading character of the final component.
fn split_ext(path: &str) -> (String, String) {
    let name = basename(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let cut = path.len() - (name.len() - pos);
            (path[..cut].to_string(), path[cut..].to_string())
        }
        _ => (path.to_string(), String::new()),
    }
}

/// Expand `[start][:stop][:step]` against the whitespace-split argument
/// line. Half-open, negative indices count from the end, step defaults 1.
fn expand_slice(args: &str, key: &str) -> Result<String> {
    let chunks: Vec<&str> = args.split_whitespace().collect();
    let error = |reason: &str| {
        HyperError::Template(format!("invalid slice expression '[{key}]' ({reason})"))
    };
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() > 3 {
        return Err(error("too many components"));
    }
    let parse = |part: &str| -> Result<Option<i64>> {
        if part.is_empty() {
            Ok(None)
        } else {
            part.parse::<i64>()
                .map(Some)
                .map_err(|_| error("not an integer"))
        }
    };
    let resolve = |index: i64| -> i64 {
        if index < 0 {
            index + chunks.len() as i64
        } else {
            index
        }
    };
    if parts.len() == 1 {
        let index = parse(parts[0])?.ok_or_else(|| error("empty index"))?;
        let resolved = resolve(index);
        return chunks
            .get(usize::try_from(resolved).map_err(|_| error("index out of range"))?)
            .map(|chunk| chunk.to_string())
            .ok_or_else(|| error("index out of range"));
    }
    let start = parse(parts[0])?.map(resolve).unwrap_or(0).clamp(0, chunks.len() as i64);
    let stop = parse(parts[1])?
        .map(resolve)
        .unwrap_or(chunks.len() as i64)
        .clamp(0, chunks.len() as i64);
    let step = parts
        .get(2)
        .map(|part| parse(part))
        .transpose()?
        .flatten()
        .unwrap_or(1);
    if step < 1 {
        return Err(error("step must be positive"));
    }
    let mut selected = Vec::new();
    let mut index = start;
    while index < stop {
        selected.push(chunks[index as usize]);
        index += step;
    }
    Ok(selected.join(" "))
}

/// Run a sub-command through the shell, substituting `@` with the argument
/// line, and splice the trimmed stdout.
fn expand_shell(args: &str, key: &str) -> Result<String> {
    let command = key.replace('@', args);
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output()
        .map_err(|err| HyperError::Template(format!("'{{% {key} %}}': {err}")))?;
    if !output.status.success() {
        return Err(HyperError::Template(format!(
            "'{{% {key} %}}' exited with status {:?}",
            output.status.code()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Restricted expression evaluation for `{= EXPR =}` patterns.
mod eval {
    use std::fmt;

    /// Typed value after intelligent coercion of the argument line.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Value {
        Int(i64),
        Float(f64),
        Str(String),
        Bool(bool),
        Null,
    }

    impl fmt::Display for Value {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Value::Int(v) => write!(f, "{v}"),
                Value::Float(v) => write!(f, "{v}"),
                Value::Str(v) => write!(f, "{v}"),
                Value::Bool(v) => write!(f, "{v}"),
                Value::Null => write!(f, "null"),
            }
        }
    }

    /// Coerce a raw string to the most specific value type.
    pub fn coerce(raw: &str) -> Value {
        if let Ok(value) = raw.parse::<i64>() {
            return Value::Int(value);
        }
        if let Ok(value) = raw.parse::<f64>() {
            return Value::Float(value);
        }
        match raw.to_lowercase().as_str() {
            "null" | "none" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Str(raw.to_string()),
        }
    }

    pub fn evaluate(expression: &str, args: &str) -> Result<String, String> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            x: coerce(args),
        };
        let value = parser.expression()?;
        if parser.position != parser.tokens.len() {
            return Err("trailing input after expression".to_string());
        }
        Ok(value.to_string())
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Number(String),
        Str(String),
        Ident(String),
        Op(&'static str),
    }

    fn tokenize(input: &str) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                ' ' | '\t' => i += 1,
                '0'..='9' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    tokens.push(Token::Number(chars[start..i].iter().collect()));
                }
                '\'' | '"' => {
                    let quote = c;
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != quote {
                        i += 1;
                    }
                    if i == chars.len() {
                        return Err("unterminated string literal".to_string());
                    }
                    tokens.push(Token::Str(chars[start..i].iter().collect()));
                    i += 1;
                }
                'a'..='z' | 'A'..='Z' | '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    tokens.push(Token::Ident(chars[start..i].iter().collect()));
                }
                '+' => push_op(&mut tokens, "+", &mut i),
                '-' => push_op(&mut tokens, "-", &mut i),
                '*' => push_op(&mut tokens, "*", &mut i),
                '/' => push_op(&mut tokens, "/", &mut i),
                '%' => push_op(&mut tokens, "%", &mut i),
                '(' => push_op(&mut tokens, "(", &mut i),
                ')' => push_op(&mut tokens, ")", &mut i),
                ',' => push_op(&mut tokens, ",", &mut i),
                '=' | '!' | '<' | '>' => {
                    if i + 1 < chars.len() && chars[i + 1] == '=' {
                        tokens.push(Token::Op(match c {
                            '=' => "==",
                            '!' => "!=",
                            '<' => "<=",
                            _ => ">=",
                        }));
                        i += 2;
                    } else if c == '<' || c == '>' {
                        tokens.push(Token::Op(if c == '<' { "<" } else { ">" }));
                        i += 1;
                    } else {
                        return Err(format!("unexpected character '{c}'"));
                    }
                }
                _ => return Err(format!("unexpected character '{c}'")),
            }
        }
        Ok(tokens)
    }

    fn push_op(tokens: &mut Vec<Token>, op: &'static str, i: &mut usize) {
        tokens.push(Token::Op(op));
        *i += 1;
    }

    struct Parser {
        tokens: Vec<Token>,
        position: usize,
        x: Value,
    }

    impl Parser {
        fn peek_op(&self) -> Option<&'static str> {
            match self.tokens.get(self.position) {
                Some(Token::Op(op)) => Some(*op),
                _ => None,
            }
        }

        fn expression(&mut self) -> Result<Value, String> {
            let left = self.term()?;
            if let Some(op @ ("==" | "!=" | "<" | "<=" | ">" | ">=")) = self.peek_op() {
                self.position += 1;
                let right = self.term()?;
                return compare(op, &left, &right);
            }
            Ok(left)
        }

        fn term(&mut self) -> Result<Value, String> {
            let mut left = self.factor()?;
            while let Some(op @ ("+" | "-")) = self.peek_op() {
                self.position += 1;
                let right = self.factor()?;
                left = arithmetic(op, &left, &right)?;
            }
            Ok(left)
        }

        fn factor(&mut self) -> Result<Value, String> {
            let mut left = self.unary()?;
            while let Some(op @ ("*" | "/" | "%")) = self.peek_op() {
                self.position += 1;
                let right = self.unary()?;
                left = arithmetic(op, &left, &right)?;
            }
            Ok(left)
        }

        fn unary(&mut self) -> Result<Value, String> {
            if self.peek_op() == Some("-") {
                self.position += 1;
                return match self.unary()? {
                    Value::Int(v) => Ok(Value::Int(-v)),
                    Value::Float(v) => Ok(Value::Float(-v)),
                    other => Err(format!("cannot negate {other:?}")),
                };
            }
            self.primary()
        }

        fn primary(&mut self) -> Result<Value, String> {
            let token = self
                .tokens
                .get(self.position)
                .cloned()
                .ok_or("unexpected end of expression")?;
            match token {
                Token::Number(raw) => {
                    self.position += 1;
                    if raw.contains('.') {
                        raw.parse::<f64>()
                            .map(Value::Float)
                            .map_err(|_| format!("bad number '{raw}'"))
                    } else {
                        raw.parse::<i64>()
                            .map(Value::Int)
                            .map_err(|_| format!("bad number '{raw}'"))
                    }
                }
                Token::Str(raw) => {
                    self.position += 1;
                    Ok(Value::Str(raw))
                }
                Token::Op("(") => {
                    self.position += 1;
                    let inner = self.expression()?;
                    self.expect(")")?;
                    Ok(inner)
                }
                Token::Ident(name) => {
                    self.position += 1;
                    if self.peek_op() == Some("(") {
                        self.position += 1;
                        let mut arguments = Vec::new();
                        if self.peek_op() != Some(")") {
                            loop {
                                arguments.push(self.expression()?);
                                if self.peek_op() == Some(",") {
                                    self.position += 1;
                                } else {
                                    break;
                                }
                            }
                        }
                        self.expect(")")?;
                        call(&name, &arguments)
                    } else {
                        match name.as_str() {
                            "x" => Ok(self.x.clone()),
                            "true" | "True" => Ok(Value::Bool(true)),
                            "false" | "False" => Ok(Value::Bool(false)),
                            "null" | "None" => Ok(Value::Null),
                            _ => Err(format!("unknown name '{name}'")),
                        }
                    }
                }
                other => Err(format!("unexpected token {other:?}")),
            }
        }

        fn expect(&mut self, op: &str) -> Result<(), String> {
            if self.peek_op() == Some(op) {
                self.position += 1;
                Ok(())
            } else {
                Err(format!("expected '{op}'"))
            }
        }
    }

    fn as_float(value: &Value) -> Result<f64, String> {
        match value {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            other => Err(format!("expected number, found {other:?}")),
        }
    }

    fn arithmetic(op: &str, left: &Value, right: &Value) -> Result<Value, String> {
        if op == "+" {
            if let (Value::Str(a), b) = (left, right) {
                return Ok(Value::Str(format!("{a}{b}")));
            }
        }
        if let (Value::Int(a), Value::Int(b)) = (left, right) {
            return match op {
                "+" => Ok(Value::Int(a + b)),
                "-" => Ok(Value::Int(a - b)),
                "*" => Ok(Value::Int(a * b)),
                "%" if *b != 0 => Ok(Value::Int(a.rem_euclid(*b))),
                "/" if *b != 0 => Ok(Value::Float(*a as f64 / *b as f64)),
                _ => Err("division by zero".to_string()),
            };
        }
        let (a, b) = (as_float(left)?, as_float(right)?);
        match op {
            "+" => Ok(Value::Float(a + b)),
            "-" => Ok(Value::Float(a - b)),
            "*" => Ok(Value::Float(a * b)),
            "/" if b != 0.0 => Ok(Value::Float(a / b)),
            "%" if b != 0.0 => Ok(Value::Float(a.rem_euclid(b))),
            _ => Err("division by zero".to_string()),
        }
    }

    fn compare(op: &str, left: &Value, right: &Value) -> Result<Value, String> {
        let result = match (left, right) {
            (Value::Str(a), Value::Str(b)) => match op {
                "==" => a == b,
                "!=" => a != b,
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            },
            _ => {
                let (a, b) = (as_float(left)?, as_float(right)?);
                match op {
                    "==" => a == b,
                    "!=" => a != b,
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn call(name: &str, arguments: &[Value]) -> Result<Value, String> {
        let single = || -> Result<&Value, String> {
            if arguments.len() == 1 {
                Ok(&arguments[0])
            } else {
                Err(format!("{name}() takes exactly one argument"))
            }
        };
        match name {
            "abs" => match single()? {
                Value::Int(v) => Ok(Value::Int(v.abs())),
                other => Ok(Value::Float(as_float(other)?.abs())),
            },
            "floor" => Ok(Value::Int(as_float(single()?)?.floor() as i64)),
            "ceil" => Ok(Value::Int(as_float(single()?)?.ceil() as i64)),
            "round" => Ok(Value::Int(as_float(single()?)?.round() as i64)),
            "sqrt" => Ok(Value::Float(as_float(single()?)?.sqrt())),
            "int" => Ok(Value::Int(as_float(single()?)? as i64)),
            "float" => Ok(Value::Float(as_float(single()?)?)),
            "str" => Ok(Value::Str(single()?.to_string())),
            "len" => Ok(Value::Int(single()?.to_string().chars().count() as i64)),
            "upper" => Ok(Value::Str(single()?.to_string().to_uppercase())),
            "lower" => Ok(Value::Str(single()?.to_string().to_lowercase())),
            "strip" => Ok(Value::Str(single()?.to_string().trim().to_string())),
            "basename" => Ok(Value::Str(super::basename(&single()?.to_string()))),
            "dirname" => Ok(Value::Str(super::dirname(&single()?.to_string()))),
            "stem" => Ok(Value::Str(
                super::split_ext(&super::basename(&single()?.to_string())).0,
            )),
            "suffix" => Ok(Value::Str(super::split_ext(&single()?.to_string()).1)),
            "timestamp" => {
                if arguments.is_empty() {
                    Ok(Value::Int(chrono::Utc::now().timestamp()))
                } else {
                    Err("timestamp() takes no arguments".to_string())
                }
            }
            _ => Err(format!("unknown function '{name}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_passthrough() {
        let template = Template::new("{}");
        assert_eq!(template.expand("echo hello").unwrap(), "echo hello");
    }

    #[test]
    fn literal_without_patterns() {
        let template = Template::new("run-batch");
        assert_eq!(template.expand("anything").unwrap(), "run-batch");
    }

    #[test]
    fn filepath_shortcuts() {
        let path = "/a/b/c.h5";
        assert_eq!(Template::new("{/}").expand(path).unwrap(), "c.h5");
        assert_eq!(Template::new("{/-}").expand(path).unwrap(), "c");
        assert_eq!(Template::new("{-}").expand(path).unwrap(), "/a/b/c");
        assert_eq!(Template::new("{+}").expand(path).unwrap(), ".h5");
        assert_eq!(Template::new("{++}").expand(path).unwrap(), "h5");
        assert_eq!(Template::new("{.}").expand(path).unwrap(), "/a/b");
        assert_eq!(Template::new("{..}").expand(path).unwrap(), "/a");
    }

    #[test]
    fn hidden_file_has_no_extension() {
        assert_eq!(Template::new("{+}").expand("/a/.bashrc").unwrap(), "");
        assert_eq!(Template::new("{-}").expand("/a/.bashrc").unwrap(), "/a/.bashrc");
    }

    #[test]
    fn slices_are_half_open() {
        let args = "a b c d e";
        assert_eq!(Template::new("{[0]}").expand(args).unwrap(), "a");
        assert_eq!(Template::new("{[-1]}").expand(args).unwrap(), "e");
        assert_eq!(Template::new("{[1:3]}").expand(args).unwrap(), "b c");
        assert_eq!(Template::new("{[:2]}").expand(args).unwrap(), "a b");
        assert_eq!(Template::new("{[2:]}").expand(args).unwrap(), "c d e");
        assert_eq!(Template::new("{[::2]}").expand(args).unwrap(), "a c e");
        assert_eq!(Template::new("{[1:-1]}").expand(args).unwrap(), "b c d");
    }

    #[test]
    fn slice_out_of_range_fails() {
        assert!(Template::new("{[9]}").expand("a b").is_err());
    }

    #[test]
    fn mixed_text_and_patterns() {
        let template = Template::new("convert {} -o {-}.png");
        assert_eq!(
            template.expand("img/cat.jpg").unwrap(),
            "convert img/cat.jpg -o img/cat.png"
        );
    }

    #[test]
    fn shell_subcommand_splice() {
        let template = Template::new("{% echo @ | tr a-z A-Z %}");
        assert_eq!(template.expand("hello").unwrap(), "HELLO");
    }

    #[test]
    fn shell_subcommand_failure_is_error() {
        assert!(Template::new("{% false %}").expand("x").is_err());
    }

    #[test]
    fn lambda_arithmetic() {
        assert_eq!(Template::new("{= x + 1 =}").expand("41").unwrap(), "42");
        assert_eq!(Template::new("{= x * 2.5 =}").expand("2").unwrap(), "5");
        assert_eq!(Template::new("{= (x + 1) % 3 =}").expand("5").unwrap(), "0");
    }

    #[test]
    fn lambda_string_helpers() {
        assert_eq!(Template::new("{= upper(x) =}").expand("abc").unwrap(), "ABC");
        assert_eq!(Template::new("{= len(x) =}").expand("abcd").unwrap(), "4");
        assert_eq!(
            Template::new("{= stem(x) + '.png' =}").expand("/a/cat.jpg").unwrap(),
            "cat.png"
        );
    }

    #[test]
    fn lambda_comparison() {
        assert_eq!(Template::new("{= x > 3 =}").expand("5").unwrap(), "true");
        assert_eq!(Template::new("{= x == 'aa' =}").expand("aa").unwrap(), "true");
    }

    #[test]
    fn lambda_error_escalates() {
        assert!(Template::new("{= nosuch(x) =}").expand("1").is_err());
        assert!(Template::new("{= x / 0 =}").expand("1").is_err());
    }

    #[test]
    fn unmatched_pattern_is_error() {
        assert!(Template::new("{&}").expand("x").is_err());
    }
}
