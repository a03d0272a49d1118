//! Field binding resolution.
//!
//! Turns a [`FieldBinding`] into a value by reading the execution context.
//! Resolution never performs I/O and never mutates the context.
//!
//! - `Fixed`: the literal, untouched.
//! - `Variable`: dotted path rooted at `sys`, `input`, `loop` or a node key.
//! - `JsonPath`: dotted path with bracket indices, e.g. `search.results[0].title`.
//!   A leading `$.` is accepted and ignored.
//! - `StringInterpolation`: text with `{path}` segments; `{{` and `}}` escape braces.

use serde_json::Value;

use crate::dsl::{ExpressionType, FieldBinding, FieldType};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::ExpressionError;
use crate::runtime::value::stringify;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Text(String),
    Path(&'a str),
}

pub fn resolve(binding: &FieldBinding, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    match binding.expression_type {
        ExpressionType::Fixed => Ok(binding.expression.clone()),
        ExpressionType::Variable => resolve_path(expression_text(binding)?, ctx),
        ExpressionType::JsonPath => resolve_json_path(expression_text(binding)?, ctx),
        ExpressionType::StringInterpolation => {
            interpolate(expression_text(binding)?, ctx).map(Value::String)
        }
    }
}

/// Variable semantics: plain dotted keys.
pub fn resolve_path(path: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    let segments = parse_path(path, false)?;
    walk(path, &segments, ctx)
}

pub fn resolve_json_path(path: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    let segments = parse_path(path, true)?;
    walk(path, &segments, ctx)
}

pub fn interpolate(template: &str, ctx: &ExecutionContext) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    for piece in parse_template(template)? {
        match piece {
            Piece::Text(text) => out.push_str(&text),
            Piece::Path(path) => out.push_str(&stringify(&resolve_json_path(path, ctx)?)),
        }
    }
    Ok(out)
}

/// Root namespaces a binding reads from (`input`, `sys`, `loop`, node keys).
/// Fixed bindings read nothing. Also serves as a syntax check.
pub fn references(binding: &FieldBinding) -> Result<Vec<String>, ExpressionError> {
    let paths: Vec<(&str, bool)> = match binding.expression_type {
        ExpressionType::Fixed => return Ok(Vec::new()),
        ExpressionType::Variable => vec![(expression_text(binding)?, false)],
        ExpressionType::JsonPath => vec![(expression_text(binding)?, true)],
        ExpressionType::StringInterpolation => parse_template(expression_text(binding)?)?
            .into_iter()
            .filter_map(|p| match p {
                Piece::Path(path) => Some((path, true)),
                Piece::Text(_) => None,
            })
            .collect(),
    };

    let mut roots = Vec::new();
    for (path, allow_index) in paths {
        if let Some(Segment::Key(root)) = parse_path(path, allow_index)?.first() {
            if !roots.iter().any(|r| r == root) {
                roots.push(root.to_string());
            }
        }
    }
    Ok(roots)
}

fn expression_text(binding: &FieldBinding) -> Result<&str, ExpressionError> {
    binding.expression.as_str().ok_or_else(|| {
        ExpressionError::invalid(binding.expression.to_string(), "expression must be a string")
    })
}

fn walk(path: &str, segments: &[Segment<'_>], ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
    let Some((Segment::Key(root), rest)) = segments.split_first() else {
        return Err(ExpressionError::invalid(path, "path must start with a namespace"));
    };
    let mut current = ctx.namespace(root).ok_or_else(|| ExpressionError::unresolved(path))?;

    for segment in rest {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(mut map)) => {
                map.remove(*key).ok_or_else(|| ExpressionError::unresolved(path))?
            }
            // A scalar or array has no keys, so the key is absent.
            (Segment::Key(_), _) => return Err(ExpressionError::unresolved(path)),
            (Segment::Index(index), Value::Array(mut items)) => {
                let len = items.len();
                if *index >= len {
                    return Err(ExpressionError::IndexOutOfRange {
                        path: path.to_string(),
                        index: *index,
                        len,
                    });
                }
                items.swap_remove(*index)
            }
            (Segment::Index(_), other) => {
                return Err(ExpressionError::mismatch(path, FieldType::Array, FieldType::of(&other)));
            }
        };
    }
    Ok(current)
}

fn parse_path(path: &str, allow_index: bool) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let trimmed = path.trim();
    let body = if allow_index {
        trimmed.strip_prefix("$.").unwrap_or(trimmed)
    } else {
        trimmed
    };
    if body.is_empty() {
        return Err(ExpressionError::invalid(path, "empty path"));
    }

    let mut segments = Vec::new();
    for part in body.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(ExpressionError::invalid(path, "empty path segment"));
        }
        if name.contains(']') {
            return Err(ExpressionError::invalid(path, "unbalanced ']'"));
        }
        segments.push(Segment::Key(name));

        while !rest.is_empty() {
            if !allow_index {
                return Err(ExpressionError::invalid(path, "indices need a json_path binding"));
            }
            let inner = rest
                .strip_prefix('[')
                .and_then(|r| r.split_once(']'))
                .ok_or_else(|| ExpressionError::invalid(path, "malformed index"))?;
            let index = inner.0.trim().parse::<usize>()
                .map_err(|_| ExpressionError::invalid(path, format!("'{}' is not an array index", inner.0)))?;
            segments.push(Segment::Index(index));
            rest = inner.1;
        }
    }
    Ok(segments)
}

fn parse_template(template: &str) -> Result<Vec<Piece<'_>>, ExpressionError> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                text.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let start = i + 1;
                let end = template[start..]
                    .find('}')
                    .map(|offset| start + offset)
                    .ok_or_else(|| ExpressionError::invalid(template, "unclosed '{'"))?;
                let path = template[start..end].trim();
                if path.is_empty() {
                    return Err(ExpressionError::invalid(template, "empty '{}' segment"));
                }
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Path(path));
                while let Some((j, _)) = chars.peek() {
                    if *j > end {
                        break;
                    }
                    chars.next();
                }
            }
            other => text.push(other),
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}
