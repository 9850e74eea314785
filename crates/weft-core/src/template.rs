//! Template engine for `{{...}}` expressions over a context scope.
//!
//! Templates mix literal text with expressions delimited by `{{` and `}}`.
//! An expression is a dotted reference (`.steps.gather.text`), a literal, a
//! function call (`add .a .b`), or a pipeline (`.name | upper`) where the
//! piped value becomes the final argument of the next call. The function
//! library lives in [`crate::functions`].
//!
//! Missing references render as `<no value>`, matching the graceful
//! degradation contract of the parameter resolver. User-supplied payloads
//! are always passed through the scope object, never spliced into
//! expression source.

use serde_json::Value;

use crate::functions;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Cap on JSON payloads handled by the template function library (1 MiB).
pub const MAX_JSON_SIZE: usize = 1_048_576;

/// Cap on array lengths handled by the template function library.
pub const MAX_ARRAY_LEN: usize = 10_000;

/// Rendered in place of an unresolvable reference.
pub const NO_VALUE: &str = "<no value>";

// ---------------------------------------------------------------------------
// TemplateError
// ---------------------------------------------------------------------------

/// Errors from template parsing or evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    /// The expression source is malformed.
    #[error("template syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    /// A call names a function that is not in the library.
    #[error("unknown template function {name:?}")]
    UnknownFunction { name: String },

    /// A function rejected its arguments.
    #[error("function {name:?}: {message}")]
    Function { name: String, message: String },

    /// Integer division or modulo by zero.
    #[error("function {name:?}: divide by zero")]
    DivideByZero { name: &'static str },

    /// A size or length cap was exceeded.
    #[error("{what} size {size} exceeds limit {max}")]
    ResourceExceeded {
        what: &'static str,
        size: usize,
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// Expression AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// Dotted reference into the scope (path stored without the leading dot).
    Ref(String),
    /// Literal value (string, number, bool, nil).
    Lit(Value),
    /// Function call; pipeline stages append the piped value as last arg.
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Pipe,
    LParen,
    RParen,
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                let mut path = String::new();
                while let Some(&(_, pc)) = chars.peek() {
                    if is_path_char(pc) {
                        path.push(pc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ref(path)));
            }
            '|' => {
                chars.next();
                tokens.push((pos, Token::Pipe));
            }
            '(' => {
                chars.next();
                tokens.push((pos, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((pos, Token::RParen));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, sc)) = chars.next() {
                    match sc {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, '\\')) => s.push('\\'),
                            Some((_, '"')) => s.push('"'),
                            other => {
                                return Err(TemplateError::Syntax {
                                    position: pos,
                                    message: format!(
                                        "invalid escape {:?} in string literal",
                                        other.map(|(_, c)| c)
                                    ),
                                });
                            }
                        },
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(TemplateError::Syntax {
                        position: pos,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push((pos, Token::Str(s)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut num = String::from(c);
                let mut is_float = false;
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_ascii_digit() {
                        num.push(nc);
                        chars.next();
                    } else if nc == '.' && !is_float {
                        is_float = true;
                        num.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if is_float {
                    Token::Float(num.parse().map_err(|_| TemplateError::Syntax {
                        position: pos,
                        message: format!("invalid number {num:?}"),
                    })?)
                } else {
                    Token::Int(num.parse().map_err(|_| TemplateError::Syntax {
                        position: pos,
                        message: format!("invalid number {num:?}"),
                    })?)
                };
                tokens.push((pos, token));
            }
            c if is_ident_start(c) => {
                let mut ident = String::new();
                while let Some(&(_, ic)) = chars.peek() {
                    if is_ident_char(ic) {
                        ident.push(ic);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ident(ident)));
            }
            other => {
                return Err(TemplateError::Syntax {
                    position: pos,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .unwrap_or_else(|| self.tokens.last().map(|(p, _)| *p + 1).unwrap_or(0))
    }

    fn parse_pipeline(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.parse_stage()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            let position = self.offset();
            match self.next() {
                Some((_, Token::Ident(name))) => {
                    let mut args = self.parse_args()?;
                    args.push(expr);
                    expr = Expr::Call { name, args };
                }
                _ => {
                    return Err(TemplateError::Syntax {
                        position,
                        message: "expected function name after '|'".to_string(),
                    });
                }
            }
        }
        Ok(expr)
    }

    /// One pipeline stage: a function call with arguments, or a bare atom.
    fn parse_stage(&mut self) -> Result<Expr, TemplateError> {
        if let Some(Token::Ident(name)) = self.peek() {
            if !matches!(name.as_str(), "true" | "false" | "nil") {
                let name = name.clone();
                self.next();
                let args = self.parse_args()?;
                return Ok(Expr::Call { name, args });
            }
        }
        self.parse_atom()
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        while matches!(
            self.peek(),
            Some(
                Token::Ref(_)
                    | Token::Str(_)
                    | Token::Int(_)
                    | Token::Float(_)
                    | Token::LParen
                    | Token::Ident(_)
            )
        ) {
            args.push(self.parse_atom()?);
        }
        Ok(args)
    }

    fn parse_atom(&mut self) -> Result<Expr, TemplateError> {
        let position = self.offset();
        match self.next() {
            Some((_, Token::Ref(path))) => Ok(Expr::Ref(path)),
            Some((_, Token::Str(s))) => Ok(Expr::Lit(Value::String(s))),
            Some((_, Token::Int(i))) => Ok(Expr::Lit(Value::from(i))),
            Some((_, Token::Float(f))) => Ok(Expr::Lit(Value::from(f))),
            Some((_, Token::Ident(ident))) => match ident.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "nil" => Ok(Expr::Lit(Value::Null)),
                other => Err(TemplateError::Syntax {
                    position,
                    message: format!(
                        "unexpected identifier {other:?} in argument position \
                         (parenthesize nested calls)"
                    ),
                }),
            },
            Some((_, Token::LParen)) => {
                let inner = self.parse_pipeline()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(TemplateError::Syntax {
                        position,
                        message: "unclosed '('".to_string(),
                    }),
                }
            }
            _ => Err(TemplateError::Syntax {
                position,
                message: "expected expression".to_string(),
            }),
        }
    }
}

fn parse_expression(source: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(TemplateError::Syntax {
            position: 0,
            message: "empty expression".to_string(),
        });
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_pipeline()?;
    if parser.peek().is_some() {
        return Err(TemplateError::Syntax {
            position: parser.offset(),
            message: "trailing tokens after expression".to_string(),
        });
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// TemplateEngine
// ---------------------------------------------------------------------------

/// Stateless template renderer and expression evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    /// Render a template against a scope object.
    ///
    /// Text outside `{{...}}` passes through untouched; each expression is
    /// evaluated and stringified. Unresolvable references become
    /// [`NO_VALUE`]. A template with no `{{` token renders to itself.
    pub fn render(&self, template: &str, scope: &Value) -> Result<String, TemplateError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(TemplateError::Syntax {
                    position: start,
                    message: "unclosed '{{'".to_string(),
                });
            };
            let value = self.eval(&after[..end], scope)?;
            result.push_str(&value_to_string(&value));
            rest = &after[end + 2..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Evaluate a single expression (the text between `{{` and `}}`).
    ///
    /// Missing references evaluate to `Null`; function errors propagate.
    pub fn eval(&self, source: &str, scope: &Value) -> Result<Value, TemplateError> {
        let expr = parse_expression(source)?;
        self.eval_expr(&expr, scope)
    }

    fn eval_expr(&self, expr: &Expr, scope: &Value) -> Result<Value, TemplateError> {
        match expr {
            Expr::Ref(path) => Ok(lookup_path(path, scope).unwrap_or(Value::Null)),
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, scope)?);
                }
                functions::call(name, &values)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path lookup and pure references
// ---------------------------------------------------------------------------

/// Traverse a dotted path (`steps.gather.text`) through maps and arrays.
///
/// Numeric segments index into arrays. Returns `None` when any segment is
/// missing. An empty path yields the whole scope.
pub fn lookup_path(path: &str, scope: &Value) -> Option<Value> {
    if path.is_empty() {
        return Some(scope.clone());
    }
    let mut current = scope;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

/// If `template`, after trimming, is exactly one `{{.<path>}}` reference with
/// no surrounding text and no function calls, return the path.
pub fn as_pure_reference(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let expr = inner.trim();
    let path = expr.strip_prefix('.')?;
    if !path.is_empty() && path.chars().all(|c| is_path_char(c)) {
        Some(path)
    } else if path.is_empty() && expr == "." {
        Some("")
    } else {
        None
    }
}

/// Stringify an evaluated value for text-mode substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => NO_VALUE.to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "name": "Alice",
            "a": 2,
            "b": 3,
            "pi": 3.5,
            "tags": ["rust", "wasm"],
            "steps": {
                "gather": { "text": "Hi Alice", "count": 5 }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    #[test]
    fn test_render_plain_text_is_identity() {
        let engine = TemplateEngine::new();
        let result = engine.render("no templates here", &scope()).unwrap();
        assert_eq!(result, "no templates here");
    }

    #[test]
    fn test_render_simple_reference() {
        let engine = TemplateEngine::new();
        let result = engine.render("Hello {{.name}}!", &scope()).unwrap();
        assert_eq!(result, "Hello Alice!");
    }

    #[test]
    fn test_render_nested_reference() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("Result: {{.steps.gather.text}}", &scope())
            .unwrap();
        assert_eq!(result, "Result: Hi Alice");
    }

    #[test]
    fn test_render_missing_reference_is_no_value() {
        let engine = TemplateEngine::new();
        let result = engine.render("x={{.missing.path}}", &scope()).unwrap();
        assert_eq!(result, "x=<no value>");
    }

    #[test]
    fn test_render_multiple_expressions() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{.name}} has {{.steps.gather.count}} articles", &scope())
            .unwrap();
        assert_eq!(result, "Alice has 5 articles");
    }

    #[test]
    fn test_render_array_index() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{.tags.0}}", &scope()).unwrap();
        assert_eq!(result, "rust");
    }

    #[test]
    fn test_render_array_as_json() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{.tags}}", &scope()).unwrap();
        assert_eq!(result, r#"["rust","wasm"]"#);
    }

    #[test]
    fn test_render_unclosed_expression_errors() {
        let engine = TemplateEngine::new();
        let err = engine.render("oops {{.name", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    // -----------------------------------------------------------------------
    // Function calls and pipelines
    // -----------------------------------------------------------------------

    #[test]
    fn test_render_function_call() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{add .a .b}}", &scope()).unwrap();
        assert_eq!(result, "5");
    }

    #[test]
    fn test_render_pipeline_appends_last_arg() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{.name | upper}}", &scope()).unwrap();
        assert_eq!(result, "ALICE");
    }

    #[test]
    fn test_render_pipeline_chain() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{.name | upper | trimPrefix \"AL\"}}", &scope())
            .unwrap();
        assert_eq!(result, "ICE");
    }

    #[test]
    fn test_render_nested_call_with_parens() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{add .a (mul .b 2)}}", &scope()).unwrap();
        assert_eq!(result, "8");
    }

    #[test]
    fn test_literals() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.eval("42", &scope()).unwrap(), json!(42));
        assert_eq!(engine.eval("-3", &scope()).unwrap(), json!(-3));
        assert_eq!(engine.eval("2.5", &scope()).unwrap(), json!(2.5));
        assert_eq!(engine.eval("true", &scope()).unwrap(), json!(true));
        assert_eq!(engine.eval("nil", &scope()).unwrap(), Value::Null);
        assert_eq!(
            engine.eval("\"a \\\"quoted\\\" str\"", &scope()).unwrap(),
            json!("a \"quoted\" str")
        );
    }

    #[test]
    fn test_unknown_function() {
        let engine = TemplateEngine::new();
        let err = engine.eval("frobnicate .a", &scope()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownFunction {
                name: "frobnicate".to_string()
            }
        );
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let engine = TemplateEngine::new();
        let err = engine.eval(".a .b", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    // -----------------------------------------------------------------------
    // Pure references
    // -----------------------------------------------------------------------

    #[test]
    fn test_pure_reference_detection() {
        assert_eq!(as_pure_reference("{{.tags}}"), Some("tags"));
        assert_eq!(as_pure_reference("  {{ .steps.gather.count }}  "), Some("steps.gather.count"));
        assert_eq!(as_pure_reference("{{.}}"), Some(""));
        assert_eq!(as_pure_reference("hello {{.tags}}"), None);
        assert_eq!(as_pure_reference("{{.tags}} trailing"), None);
        assert_eq!(as_pure_reference("{{upper .name}}"), None);
        assert_eq!(as_pure_reference("{{.a | upper}}"), None);
        assert_eq!(as_pure_reference("{{.a}}{{.b}}"), None);
        assert_eq!(as_pure_reference("plain"), None);
    }

    #[test]
    fn test_lookup_path() {
        let s = scope();
        assert_eq!(lookup_path("name", &s), Some(json!("Alice")));
        assert_eq!(lookup_path("steps.gather.count", &s), Some(json!(5)));
        assert_eq!(lookup_path("tags.1", &s), Some(json!("wasm")));
        assert_eq!(lookup_path("tags.9", &s), None);
        assert_eq!(lookup_path("nope", &s), None);
        assert_eq!(lookup_path("name.deeper", &s), None);
    }

    #[test]
    fn test_lookup_path_with_hyphenated_segment() {
        let s = json!({"steps": {"gather-news": {"text": "ok"}}});
        assert_eq!(lookup_path("steps.gather-news.text", &s), Some(json!("ok")));
    }
}
