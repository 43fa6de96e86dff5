//! `${key}` placeholder substitution
//!
//! Placeholders are rendered by minijinja with `${`/`}` as variable
//! delimiters:
//! - `${key}` renders the value, or nothing when the key is unknown
//! - `${key:-fallback}` renders `fallback` when the value is missing or empty
//!
//! Everything else, including `${` sequences that are not a placeholder and
//! any `{%`/`{#` in the manifest, is passed through as a raw block.

use std::collections::BTreeMap;

use minijinja::syntax::SyntaxConfig;
use minijinja::{context, Environment, Error, UndefinedBehavior, Value};

/// Placeholder name to value
pub type Substitutions = BTreeMap<String, String>;

/// Replace every placeholder in `text`.
pub fn substitute(text: &str, vars: &Substitutions) -> Result<String, Error> {
    environment()?.render_str(&to_template(text), context! { vars => vars })
}

fn environment() -> Result<Environment<'static>, Error> {
    let syntax = SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .block_delimiters("{%", "%}")
        .comment_delimiters("{#", "#}")
        .build()?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_keep_trailing_newline(true);
    env.add_filter("or_fallback", or_fallback);
    Ok(env)
}

/// Fallback for missing, none or empty values
///
/// Usage: `${value | or_fallback("text")}`
fn or_fallback(value: Value, fallback: String) -> Value {
    if value.is_undefined() || value.is_none() || value.as_str() == Some("") {
        Value::from(fallback)
    } else {
        value
    }
}

// Literal text goes into raw blocks, placeholders become lookups into `vars`.
fn to_template(text: &str) -> String {
    let mut template = String::with_capacity(text.len() + 32);
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let placeholder = after
            .find('}')
            .and_then(|end| expression(&after[..end]).map(|expr| (end, expr)));

        match placeholder {
            Some((end, expr)) => {
                literal.push_str(&rest[..start]);
                push_raw(&mut template, &literal);
                literal.clear();
                template.push_str(&expr);
                rest = &after[end + 1..];
            }
            None => {
                literal.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }

    literal.push_str(rest);
    push_raw(&mut template, &literal);
    template
}

fn push_raw(template: &mut String, literal: &str) {
    if !literal.is_empty() {
        template.push_str("{% raw %}");
        template.push_str(literal);
        template.push_str("{% endraw %}");
    }
}

fn expression(body: &str) -> Option<String> {
    let (key, fallback) = match body.split_once(":-") {
        Some((key, fallback)) => (key, Some(fallback)),
        None => (body, None),
    };
    if !is_identifier(key) {
        return None;
    }

    let key = quoted(key);
    Some(match fallback {
        Some(fallback) => format!("${{ vars[{}] | or_fallback({}) }}", key, quoted(fallback)),
        None => format!("${{ vars[{}] }}", key),
    })
}

fn quoted(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
