//! `%(Key)s` expansion of command lines.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template key {0}")]
    UnknownKey(String),
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    #[error("unsupported format character at offset {0}")]
    Unsupported(usize),
}

/// Expands every `%(Key)s` in `template` with the value of `Key` in
/// `params`. Strings are single-quoted for the shell, numbers and booleans
/// are inserted verbatim, `%%` is a literal `%`.
pub fn expand(template: &str, params: &Map<String, Value>) -> Result<String, TemplateError> {
    expand_with(template, params, render_quoted)
}

/// Like [`expand`] but without shell quoting, for arguments passed to a
/// program directly.
pub fn expand_arg(template: &str, params: &Map<String, Value>) -> Result<String, TemplateError> {
    expand_with(template, params, render_plain)
}

fn expand_with(
    template: &str,
    params: &Map<String, Value>,
    render: fn(&Value) -> String,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let at = offset + pos;
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('%') {
            out.push('%');
            offset = at + 2;
            rest = after;
            continue;
        }

        let Some(inner) = tail.strip_prefix('(') else {
            return Err(TemplateError::Unsupported(at));
        };
        let close = inner.find(')').ok_or(TemplateError::Unterminated(at))?;
        let key = &inner[..close];
        let Some(after) = inner[close + 1..].strip_prefix('s') else {
            return Err(TemplateError::Unsupported(at));
        };

        let value = params
            .get(key)
            .ok_or_else(|| TemplateError::UnknownKey(key.to_string()))?;
        out.push_str(&render(value));

        let consumed = 1 + 1 + close + 1 + 1;
        offset = at + consumed;
        rest = after;
    }
    out.push_str(rest);
    Ok(out)
}

fn render_quoted(value: &Value) -> String {
    match value {
        Value::Bool(_) | Value::Number(_) => render_plain(value),
        other => shell_quote(&render_plain(other)),
    }
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn shell_quote(raw: &str) -> String {
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn expands_and_quotes() {
        let p = params(json!({"Host": "db1; rm -rf /", "Port": 5432, "Verbose": true}));
        let line = expand("check --host %(Host)s --port %(Port)s -v %(Verbose)s", &p).unwrap();
        assert_eq!(line, "check --host 'db1; rm -rf /' --port 5432 -v true");
    }

    #[test]
    fn escapes_single_quotes() {
        let p = params(json!({"Msg": "it's"}));
        assert_eq!(expand("echo %(Msg)s", &p).unwrap(), "echo 'it'\\''s'");
    }

    #[test]
    fn plain_args_are_not_quoted() {
        let p = params(json!({"Path": "/var/log/it's here", "Missing": null}));
        assert_eq!(expand_arg("--path=%(Path)s", &p).unwrap(), "--path=/var/log/it's here");
        assert_eq!(expand_arg("%(Missing)s", &p).unwrap(), "");
        assert_eq!(expand("x %(Missing)s", &p).unwrap(), "x ''");
    }

    #[test]
    fn literal_percent_and_plain_text() {
        let p = Map::new();
        assert_eq!(expand("df | awk '$5 > 90%%'", &p).unwrap(), "df | awk '$5 > 90%'");
        assert_eq!(expand("echo hello", &p).unwrap(), "echo hello");
    }

    #[test]
    fn rejects_bad_placeholders() {
        let p = Map::new();
        assert_eq!(
            expand("echo %(Missing)s", &p),
            Err(TemplateError::UnknownKey("Missing".to_string()))
        );
        assert_eq!(expand("echo %(Open", &p), Err(TemplateError::Unterminated(5)));
        assert_eq!(expand("echo %d", &p), Err(TemplateError::Unsupported(5)));
    }

    #[test]
    fn quote_keeps_dollars_literal() {
        let quoted = shell_quote("a 'b' $c");
        assert_eq!(quoted, "'a '\\''b'\\'' $c'");
    }
}
