//! Command templating
//!
//! Command templates embed `{token}` placeholders. A token is a dotted path
//! into the parameter tree; each segment may carry a single `[index]`:
//!
//! ```text
//! GOTO {user.addresses[0].city}
//! ```
//!
//! A token whose top-level key is missing from the parameters is left in
//! place verbatim. A token whose top-level key exists but whose remaining
//! path does not resolve is replaced with an empty string.

use serde_json::Value;
use tracing::trace;

/// One parsed path segment: `key`, `key[3]`
#[derive(Debug, PartialEq, Eq)]
struct Segment<'a> {
    key: &'a str,
    index: Option<usize>,
}

fn parse_segment(segment: &str) -> Option<Segment<'_>> {
    match segment.find('[') {
        None => Some(Segment {
            key: segment,
            index: None,
        }),
        Some(open) => {
            let inner = segment[open + 1..].strip_suffix(']')?;
            let index = inner.trim().parse().ok()?;
            Some(Segment {
                key: &segment[..open],
                index: Some(index),
            })
        }
    }
}

fn step<'v>(value: &'v Value, segment: &Segment<'_>) -> Option<&'v Value> {
    let value = if segment.key.is_empty() {
        value
    } else {
        value.get(segment.key)?
    };
    match segment.index {
        Some(i) => value.get(i),
        None => Some(value),
    }
}

/// Resolve a dotted path such as `a.items[2].name` against `params`
pub fn resolve_path<'v>(params: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(params, |value, raw| {
        let segment = parse_segment(raw.trim())?;
        step(value, &segment)
    })
}

fn top_level_key(path: &str) -> &str {
    let first = path.split('.').next().unwrap_or(path).trim();
    match first.find('[') {
        Some(open) => &first[..open],
        None => first,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn substitute(path: &str, token: &str, params: &Value) -> String {
    if params.get(top_level_key(path)).is_none() {
        trace!("Template token {} has no parameter, left as is", token);
        return token.to_string();
    }
    resolve_path(params, path).map(display).unwrap_or_default()
}

/// Substitute every `{token}` in `template` from `params`
pub fn render(template: &str, params: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find(|c: char| c == '{' || c == '}') {
            Some(close) if close > 0 && after[close..].starts_with('}') => {
                out.push_str(&rest[..open]);
                let token = &rest[open..open + close + 2];
                out.push_str(&substitute(&after[..close], token, params));
                rest = &after[close + 1..];
            }
            _ => {
                // Lone or empty brace, copy through
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
