//! Placeholder templates.
//!
//! Templates use `{{ path }}` placeholders resolved against a JSON variable
//! set, with optional filters chained by `|`:
//!
//! - `quote`: emit the value as a double-quoted YAML/JSON string
//! - `json`: emit the value as compact JSON (required for maps and lists)
//! - `indent N`: prefix every line after the first with `N` spaces
//!
//! A placeholder naming a variable that is not set is an error; nothing is
//! silently rendered as empty.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use crate::ops::op::Template;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*((?:\|\s*[a-z]+(?:\s+\d+)?\s*)*)\}\}")
        .unwrap()
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}`: variable `{var}` is not set")]
    Missing { template: String, var: String },

    #[error("template `{template}`: variable `{var}` is a {found}; use `| json`")]
    NotScalar {
        template: String,
        var: String,
        found: &'static str,
    },

    #[error("template `{template}`: unknown filter `{filter}`")]
    UnknownFilter { template: String, filter: String },
}

/// Look up a dotted path; numeric segments index arrays.
pub fn lookup<'v>(vars: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(vars, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&pad);
            }
        }
        out.push_str(line);
    }
    out
}

fn render_one(template: &Template, caps: &Captures<'_>, vars: &Value) -> Result<String, TemplateError> {
    let var = &caps[1];
    let value = lookup(vars, var).ok_or_else(|| TemplateError::Missing {
        template: template.name.to_string(),
        var: var.to_string(),
    })?;

    let filters: Vec<(&str, Option<usize>)> = caps
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or("")
        .split('|')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| match f.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim().parse().ok()),
            None => (f, None),
        })
        .collect();

    let as_json = filters.iter().any(|(name, _)| *name == "json");
    let mut text = if as_json {
        value.to_string()
    } else {
        match value {
            Value::String(s) => s.clone(),
            Value::Bool(_) | Value::Number(_) => value.to_string(),
            other => {
                return Err(TemplateError::NotScalar {
                    template: template.name.to_string(),
                    var: var.to_string(),
                    found: kind_of(other),
                })
            }
        }
    };

    for (name, arg) in filters {
        match name {
            "json" => {}
            "quote" => text = Value::String(text).to_string(),
            "indent" => text = indent(&text, arg.unwrap_or(2)),
            other => {
                return Err(TemplateError::UnknownFilter {
                    template: template.name.to_string(),
                    filter: other.to_string(),
                })
            }
        }
    }

    Ok(text)
}

/// Render a template against `vars`.
pub fn render(template: &Template, vars: &Value) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.source.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template.source) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template.source[last..whole.start()]);
        out.push_str(&render_one(template, &caps, vars)?);
        last = whole.end();
    }
    out.push_str(&template.source[last..]);

    Ok(out)
}

/// Every variable a template references, in order of first use.
pub fn variables(template: &Template) -> Vec<String> {
    let mut vars: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template.source) {
        let var = caps[1].to_string();
        if !vars.contains(&var) {
            vars.push(var);
        }
    }
    vars
}
