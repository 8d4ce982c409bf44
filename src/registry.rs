//! Named query templates and positional substitution.
//!
//! A registry compiles raw SQL once — comments stripped, whitespace
//! compressed outside quoted regions, `#name` constants resolved — and
//! records `$<name>` (escaped) and `@<name>` (raw) variable positions so
//! [`QueryRegistry::get_query`] can render with values later. A marker
//! prefixed with an adjacent `-` negates the substituted value. Templates
//! without variables render once and are served verbatim.
//!
//! The registry is a plain value built at startup and handed to the
//! cluster behind an `Arc`; there is no global state.
//!
//! ```ignore
//! let mut registry = QueryRegistry::new();
//! registry.add_query("greet", "SELECT '$<name>'")?;
//! assert_eq!(
//!     registry.get_query("greet", &[("name", Value::from("world"))])?,
//!     "SELECT 'world'",
//! );
//! ```

use crate::error::{HiveError, HiveResult};
use crate::value::{encode_literal, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A recorded variable position inside a compiled template.
#[derive(Debug, Clone, PartialEq)]
struct Position {
    name: String,
    /// Byte offset into the compiled text where the value is inserted.
    offset: usize,
    escape: bool,
    negate: bool,
}

#[derive(Debug, Clone)]
struct Template {
    text: String,
    positions: Vec<Position>,
    /// Render-once cache for templates with no variables.
    rendered: Option<String>,
}

/// Persisted form of one compiled template: either the variable-bearing
/// `request` text plus its positions, or the pre-rendered `cache` text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub positions: Vec<(String, usize, bool, bool)>,
}

/// Compiles and stores named query templates and global constants.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    templates: HashMap<String, Template>,
    constants: HashMap<String, String>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register replacement text for `#name` references.
    pub fn add_constant(&mut self, name: &str, text: &str) {
        self.constants.insert(name.to_string(), text.to_string());
    }

    pub fn constant(&self, name: &str) -> Option<&str> {
        self.constants.get(name).map(String::as_str)
    }

    /// Compile and store a template. The stored set is untouched on failure.
    pub fn add_query(&mut self, name: &str, raw: &str) -> HiveResult<()> {
        let cleaned = clean_sql(raw);
        let resolved = self.resolve_constants(&cleaned)?;
        let (text, positions) = extract_markers(&resolved);
        let rendered = if positions.is_empty() {
            Some(text.clone())
        } else {
            None
        };
        self.templates.insert(
            name.to_string(),
            Template {
                text,
                positions,
                rendered,
            },
        );
        Ok(())
    }

    /// Render a template with named values.
    pub fn get_query(&self, name: &str, args: &[(&str, Value)]) -> HiveResult<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| HiveError::new("query not found"))?;
        if let Some(done) = &template.rendered {
            return Ok(done.clone());
        }

        let mut out = String::with_capacity(template.text.len() + 32);
        let mut last = 0;
        for position in &template.positions {
            out.push_str(&template.text[last..position.offset]);
            last = position.offset;
            let value = args
                .iter()
                .find(|(key, _)| *key == position.name)
                .map(|(_, value)| value)
                .ok_or_else(|| {
                    HiveError::new(format!(
                        "query '{}' expects a value for '{}'",
                        name, position.name
                    ))
                })?;
            out.push_str(&encode_literal(value, position.escape, position.negate));
        }
        out.push_str(&template.text[last..]);
        Ok(out)
    }

    /// Positional substitution: one value per `?`, scanned left to right.
    ///
    /// `\?` is a literal question mark, `$?` substitutes raw, `-?` negates,
    /// `-$?` both. Fails when placeholders outnumber values.
    pub fn emplace(&self, text: &str, values: &[Value]) -> HiveResult<String> {
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len() + 16);
        let mut next = 0usize;
        let mut run = 0usize;
        let mut i = 0usize;
        while i < bytes.len() {
            let (advance, escape, negate) = match bytes[i] {
                b'\\' if bytes.get(i + 1) == Some(&b'?') => {
                    out.push_str(&text[run..i]);
                    out.push('?');
                    i += 2;
                    run = i;
                    continue;
                }
                b'-' if bytes.get(i + 1) == Some(&b'?') => (2, true, true),
                b'-' if bytes.get(i + 1) == Some(&b'$') && bytes.get(i + 2) == Some(&b'?') => {
                    (3, false, true)
                }
                b'$' if bytes.get(i + 1) == Some(&b'?') => (2, false, false),
                b'?' => (1, true, false),
                _ => {
                    i += 1;
                    continue;
                }
            };
            out.push_str(&text[run..i]);
            let value = values.get(next).ok_or_else(|| {
                HiveError::new(format!(
                    "emplace expects at least {} values, got {}",
                    next + 1,
                    values.len()
                ))
            })?;
            next += 1;
            out.push_str(&encode_literal(value, escape, negate));
            i += advance;
            run = i;
        }
        out.push_str(&text[run..]);
        Ok(out)
    }

    /// Compiled templates as persistable records, sorted by name.
    pub fn dump(&self) -> Vec<TemplateRecord> {
        let mut records: Vec<TemplateRecord> = self
            .templates
            .iter()
            .map(|(name, template)| TemplateRecord {
                name: name.clone(),
                request: if template.rendered.is_none() {
                    Some(template.text.clone())
                } else {
                    None
                },
                cache: template.rendered.clone(),
                positions: template
                    .positions
                    .iter()
                    .map(|p| (p.name.clone(), p.offset, p.escape, p.negate))
                    .collect(),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Restore compiled templates, skipping the parse step.
    pub fn load(&mut self, records: Vec<TemplateRecord>) -> HiveResult<()> {
        for record in records {
            let template = match (record.request, record.cache) {
                (_, Some(cache)) => Template {
                    text: cache.clone(),
                    positions: Vec::new(),
                    rendered: Some(cache),
                },
                (Some(request), None) => Template {
                    text: request,
                    positions: record
                        .positions
                        .into_iter()
                        .map(|(name, offset, escape, negate)| Position {
                            name,
                            offset,
                            escape,
                            negate,
                        })
                        .collect(),
                    rendered: None,
                },
                (None, None) => {
                    return Err(HiveError::new(format!(
                        "template record '{}' has neither request nor cache text",
                        record.name
                    )))
                }
            };
            self.templates.insert(record.name, template);
        }
        Ok(())
    }

    pub fn to_json(&self) -> HiveResult<String> {
        serde_json::to_string_pretty(&self.dump())
            .map_err(|e| HiveError::new(format!("template dump failed: {}", e)))
    }

    pub fn load_json(&mut self, json: &str) -> HiveResult<()> {
        let records: Vec<TemplateRecord> = serde_json::from_str(json)
            .map_err(|e| HiveError::new(format!("template load failed: {}", e)))?;
        self.load(records)
    }

    fn resolve_constants(&self, text: &str) -> HiveResult<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '#' {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                if j > start {
                    let name: String = chars[start..j].iter().collect();
                    let value = self.constants.get(&name).ok_or_else(|| {
                        HiveError::new(format!("query expects @{} constant", name))
                    })?;
                    out.push_str(value);
                    i = j;
                    continue;
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        Ok(out)
    }
}

/// Strip `--` and nested `/* */` comments and compress whitespace runs to a
/// single space, leaving quoted regions untouched.
fn clean_sql(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                pending_space = true;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut depth = 1;
                i += 2;
                while i < chars.len() && depth > 0 {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                pending_space = true;
            }
            c if c.is_whitespace() => {
                pending_space = true;
                i += 1;
            }
            quote @ ('\'' | '"') => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(quote);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == quote {
                        // a doubled quote stays inside the literal
                        if chars.get(i + 1) == Some(&quote) {
                            out.push(quote);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Remove `$<name>` / `@<name>` markers (with optional adjacent `-`) and
/// record their byte offsets in the remaining text.
fn extract_markers(text: &str) -> (String, Vec<Position>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut positions = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if (c == '$' || c == '@') && chars.get(i + 1) == Some(&'<') {
            let start = i + 2;
            let mut j = start;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            if j > start && chars.get(j) == Some(&'>') {
                let name: String = chars[start..j].iter().collect();
                let mut negate = false;
                if out.ends_with('-') {
                    out.pop();
                    negate = true;
                }
                positions.push(Position {
                    name,
                    offset: out.len(),
                    escape: c == '$',
                    negate,
                });
                i = j + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    (out, positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_sql_strips_comments_and_whitespace() {
        let raw = "SELECT  a, -- trailing note\n  b /* block\ncomment */ FROM t\n";
        assert_eq!(clean_sql(raw), "SELECT a, b FROM t");
    }

    #[test]
    fn test_clean_sql_preserves_quoted_regions() {
        let raw = "SELECT '  -- not a comment  ', \"Weird  Col\" FROM t";
        assert_eq!(
            clean_sql(raw),
            "SELECT '  -- not a comment  ', \"Weird  Col\" FROM t"
        );
    }

    #[test]
    fn test_clean_sql_nested_block_comment() {
        let raw = "SELECT 1 /* outer /* inner */ still outer */ + 2";
        assert_eq!(clean_sql(raw), "SELECT 1 + 2");
    }

    #[test]
    fn test_doubled_quote_inside_literal() {
        let raw = "SELECT 'it''s  fine'";
        assert_eq!(clean_sql(raw), "SELECT 'it''s  fine'");
    }

    #[test]
    fn test_render_with_escaped_marker() {
        let mut registry = QueryRegistry::new();
        registry.add_query("greet", "SELECT '$<name>'").expect("add");
        let out = registry
            .get_query("greet", &[("name", Value::from("world"))])
            .expect("render");
        assert_eq!(out, "SELECT 'world'");
    }

    #[test]
    fn test_render_is_idempotent() {
        let mut registry = QueryRegistry::new();
        registry
            .add_query("by_id", "SELECT * FROM users WHERE id = $<id> AND name = '$<name>'")
            .expect("add");
        let args = [("id", Value::Int(7)), ("name", Value::from("o'hara"))];
        let first = registry.get_query("by_id", &args).expect("render");
        let second = registry.get_query("by_id", &args).expect("render");
        assert_eq!(first, second);
        assert_eq!(
            first,
            "SELECT * FROM users WHERE id = 7 AND name = 'o''hara'"
        );
    }

    #[test]
    fn test_no_dangling_markers() {
        let mut registry = QueryRegistry::new();
        registry
            .add_query("q", "SELECT @<cols> FROM t WHERE a = $<a> AND b = -$<b>")
            .expect("add");
        let out = registry
            .get_query(
                "q",
                &[
                    ("cols", Value::from("a, b")),
                    ("a", Value::Int(1)),
                    ("b", Value::Int(2)),
                ],
            )
            .expect("render");
        assert!(!out.contains("$<"));
        assert!(!out.contains("@<"));
        assert_eq!(out, "SELECT a, b FROM t WHERE a = 1 AND b = -2");
    }

    #[test]
    fn test_raw_marker_skips_escaping() {
        let mut registry = QueryRegistry::new();
        registry.add_query("q", "SELECT @<expr>").expect("add");
        let out = registry
            .get_query("q", &[("expr", Value::from("count(*) -- as is"))])
            .expect("render");
        assert_eq!(out, "SELECT count(*) -- as is");
    }

    #[test]
    fn test_render_once_cache() {
        let mut registry = QueryRegistry::new();
        registry
            .add_query("static", "  SELECT   1  -- done\n")
            .expect("add");
        assert_eq!(registry.get_query("static", &[]).expect("render"), "SELECT 1");
    }

    #[test]
    fn test_unknown_template() {
        let registry = QueryRegistry::new();
        let err = registry.get_query("missing", &[]).unwrap_err();
        assert_eq!(err.message(), "query not found");
    }

    #[test]
    fn test_missing_value() {
        let mut registry = QueryRegistry::new();
        registry.add_query("q", "SELECT $<x>").expect("add");
        assert!(registry.get_query("q", &[]).is_err());
    }

    #[test]
    fn test_constants_resolved_with_drift() {
        let mut registry = QueryRegistry::new();
        registry.add_constant("schema", "analytics");
        registry.add_constant("limit", "250");
        registry
            .add_query("top", "SELECT * FROM #schema.events WHERE id = $<id> LIMIT #limit")
            .expect("add");
        let out = registry
            .get_query("top", &[("id", Value::Int(3))])
            .expect("render");
        assert_eq!(out, "SELECT * FROM analytics.events WHERE id = 3 LIMIT 250");
    }

    #[test]
    fn test_unknown_constant_fails_without_mutation() {
        let mut registry = QueryRegistry::new();
        let err = registry.add_query("q", "SELECT #nope").unwrap_err();
        assert_eq!(err.message(), "query expects @nope constant");
        assert!(registry.get_query("q", &[]).is_err());
    }

    #[test]
    fn test_emplace_variants() {
        let registry = QueryRegistry::new();
        let out = registry
            .emplace(
                "SELECT ?, $?, -?, -$?, '\\?'",
                &[
                    Value::from("a'b"),
                    Value::from("raw'txt"),
                    Value::Int(4),
                    Value::Int(4),
                ],
            )
            .expect("emplace");
        assert_eq!(out, "SELECT a''b, raw'txt, -4, -4, '?'");
    }

    #[test]
    fn test_emplace_too_few_values() {
        let registry = QueryRegistry::new();
        let err = registry.emplace("SELECT ?, ?", &[Value::Int(1)]).unwrap_err();
        assert_eq!(err.message(), "emplace expects at least 2 values, got 1");
    }

    #[test]
    fn test_emplace_extra_values_are_ignored() {
        let registry = QueryRegistry::new();
        let out = registry
            .emplace("SELECT ?", &[Value::Int(1), Value::Int(2)])
            .expect("emplace");
        assert_eq!(out, "SELECT 1");
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let mut registry = QueryRegistry::new();
        registry.add_query("static", "SELECT 1").expect("add");
        registry
            .add_query("vars", "SELECT $<a>, @<b>")
            .expect("add");

        let json = registry.to_json().expect("dump");
        let mut restored = QueryRegistry::new();
        restored.load_json(&json).expect("load");

        let args = [("a", Value::Int(1)), ("b", Value::from("x"))];
        assert_eq!(
            registry.get_query("vars", &args).expect("render"),
            restored.get_query("vars", &args).expect("render")
        );
        assert_eq!(
            restored.get_query("static", &[]).expect("render"),
            "SELECT 1"
        );
    }

    #[test]
    fn test_record_shape() {
        let mut registry = QueryRegistry::new();
        registry.add_query("static", "SELECT 1").expect("add");
        registry.add_query("vars", "SELECT $<a>").expect("add");

        let records = registry.dump();
        let static_record = records.iter().find(|r| r.name == "static").expect("static");
        assert!(static_record.cache.is_some());
        assert!(static_record.request.is_none());
        assert!(static_record.positions.is_empty());

        let vars_record = records.iter().find(|r| r.name == "vars").expect("vars");
        assert!(vars_record.cache.is_none());
        assert_eq!(vars_record.request.as_deref(), Some("SELECT "));
        assert_eq!(vars_record.positions, vec![("a".to_string(), 7, true, false)]);
    }
}
