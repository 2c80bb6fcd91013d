//! Template resolution
//!
//! Recognized path roots: `input.`, `tasks.<id>.output.`, `env.`, `item`/
//! `index` (inside a `forEach` body), `parent.output.` (inside a
//! sub-workflow child). The evaluator is a pure function of (parsed AST,
//! context); parsing is cached by template-string identity so a step
//! re-rendered across forEach iterations only pays the lex/parse cost once,
//! per spec §4.1's "lex→parse once per string, cache by string identity".

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::ExecutionContext;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template root '{0}'")]
    UnknownRoot(String),
    #[error("malformed template path '{0}': {1}")]
    MalformedPath(String, String),
}

impl HasErrorCode for TemplateError {
    fn code(&self) -> ErrorCode {
        ErrorCode::TemplateError
    }
}

/// Result of resolving a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The whole input was a single `{{...}}` placeholder referencing a
    /// non-string-only field; the original typed value is preserved.
    Value(Value),
    /// One or more literal segments and/or placeholders were concatenated.
    Text(String),
}

impl Resolved {
    pub fn into_value(self) -> Value {
        match self {
            Resolved::Value(v) => v,
            Resolved::Text(s) => Value::String(s),
        }
    }

    pub fn as_str_lossy(&self) -> String {
        match self {
            Resolved::Value(v) => value_to_interpolated_string(v),
            Resolved::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathRoot {
    Input,
    TaskOutput(String),
    Env,
    Item,
    Index,
    ParentOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplatePath {
    root: PathRoot,
    segments: Vec<PathSegment>,
    raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Placeholder(TemplatePath),
}

/// Lex `{{ ... }}` delimited placeholders out of a template string. Braces
/// do not nest; a `{{` with no matching `}}` is treated as a literal (the
/// resolver is forgiving of stray braces in free-form text bodies).
fn lex(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            parts.push(TemplatePart::Literal(rest[..start].to_string()));
        }
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let inner = after_open[..end].trim();
                match parse_path(inner) {
                    Ok(path) => parts.push(TemplatePart::Placeholder(path)),
                    Err(_) => {
                        // Malformed path: keep the placeholder literal so callers
                        // see an UnknownRoot/MalformedPath error only when they
                        // actually try to resolve it, not while lexing.
                        parts.push(TemplatePart::Placeholder(TemplatePath {
                            root: PathRoot::Input,
                            segments: vec![PathSegment::Field(format!("\0invalid:{inner}"))],
                            raw: inner.to_string(),
                        }));
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                parts.push(TemplatePart::Literal(format!("{{{{{after_open}")));
                rest = "";
                break;
            }
        }
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Literal(rest.to_string()));
    }
    parts
}

fn parse_path(inner: &str) -> Result<TemplatePath, TemplateError> {
    if inner.is_empty() {
        return Err(TemplateError::MalformedPath(inner.to_string(), "empty placeholder".into()));
    }
    let raw_components: Vec<&str> = inner.split('.').collect();
    let mut components = raw_components.into_iter();
    let first = components.next().unwrap();
    let (first_ident, first_brackets) = split_brackets(first)?;

    let (root, remaining_first_segments): (PathRoot, Vec<PathSegment>) = match first_ident {
        "input" => (PathRoot::Input, first_brackets),
        "env" => (PathRoot::Env, first_brackets),
        "item" => (PathRoot::Item, first_brackets),
        "index" => (PathRoot::Index, first_brackets),
        "tasks" => {
            let id = components
                .next()
                .ok_or_else(|| TemplateError::MalformedPath(inner.to_string(), "missing task id".into()))?;
            let (id_ident, id_brackets) = split_brackets(id)?;
            if !id_brackets.is_empty() {
                return Err(TemplateError::MalformedPath(inner.to_string(), "task id may not be indexed".into()));
            }
            let output_tok = components
                .next()
                .ok_or_else(|| TemplateError::MalformedPath(inner.to_string(), "expected '.output' after task id".into()))?;
            let (output_ident, output_brackets) = split_brackets(output_tok)?;
            if output_ident != "output" {
                return Err(TemplateError::MalformedPath(inner.to_string(), "expected '.output' after task id".into()));
            }
            (PathRoot::TaskOutput(id_ident.to_string()), output_brackets)
        }
        "parent" => {
            let output_tok = components
                .next()
                .ok_or_else(|| TemplateError::MalformedPath(inner.to_string(), "expected '.output' after 'parent'".into()))?;
            let (output_ident, output_brackets) = split_brackets(output_tok)?;
            if output_ident != "output" {
                return Err(TemplateError::MalformedPath(inner.to_string(), "expected '.output' after 'parent'".into()));
            }
            (PathRoot::ParentOutput, output_brackets)
        }
        other => return Err(TemplateError::MalformedPath(inner.to_string(), format!("unknown root '{other}'"))),
    };

    let mut segments = remaining_first_segments;
    for comp in components {
        let (ident, brackets) = split_brackets(comp)?;
        if !ident.is_empty() {
            segments.push(PathSegment::Field(ident.to_string()));
        }
        segments.extend(brackets);
    }

    Ok(TemplatePath {
        root,
        segments,
        raw: inner.to_string(),
    })
}

/// Split `name[0][1]` into (`"name"`, `[Index(0), Index(1)]`)
fn split_brackets(token: &str) -> Result<(&str, Vec<PathSegment>), TemplateError> {
    match token.find('[') {
        None => Ok((token, Vec::new())),
        Some(pos) => {
            let ident = &token[..pos];
            let mut rest = &token[pos..];
            let mut segments = Vec::new();
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| TemplateError::MalformedPath(token.to_string(), "unterminated '['".into()))?;
                let idx_str = &stripped[..close];
                let idx: usize = idx_str
                    .parse()
                    .map_err(|_| TemplateError::MalformedPath(token.to_string(), format!("invalid array index '{idx_str}'")))?;
                segments.push(PathSegment::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(TemplateError::MalformedPath(token.to_string(), "trailing characters after ']'".into()));
            }
            Ok((ident, segments))
        }
    }
}

fn navigate(value: &Value, segments: &[PathSegment]) -> Value {
    let mut cur = value;
    for seg in segments {
        match (cur, seg) {
            (Value::Object(map), PathSegment::Field(name)) => match map.get(name) {
                Some(v) => cur = v,
                None => return Value::Null,
            },
            (Value::Array(arr), PathSegment::Index(i)) => match arr.get(*i) {
                Some(v) => cur = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    cur.clone()
}

fn segments_to_path_string(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            PathSegment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn value_to_interpolated_string(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_path(path: &TemplatePath, ctx: &ExecutionContext) -> Result<Value, TemplateError> {
    if let PathSegment::Field(f) = path.segments.first().unwrap_or(&PathSegment::Index(0)) {
        if let Some(bad) = f.strip_prefix('\0') {
            let _ = bad;
            return Err(TemplateError::MalformedPath(path.raw.clone(), "invalid placeholder".into()));
        }
    }
    let value = match &path.root {
        PathRoot::Input => navigate(&ctx.input, &path.segments),
        PathRoot::Env => navigate(&ctx.env, &path.segments),
        PathRoot::TaskOutput(id) => match ctx.tasks.get(id) {
            Some(outcome) => navigate(&outcome.output, &path.segments),
            None => Value::Null,
        },
        PathRoot::ParentOutput => match &ctx.parent {
            Some(parent) => navigate(&parent.output, &path.segments),
            None => Value::Null,
        },
        PathRoot::Item => match &ctx.loop_binding {
            Some(binding) => navigate(&binding.item, &path.segments),
            None => Value::Null,
        },
        PathRoot::Index => match &ctx.loop_binding {
            Some(binding) => navigate(&Value::from(binding.index), &path.segments),
            None => Value::Null,
        },
    };
    Ok(value)
}

fn resolve_path_preview(path: &TemplatePath) -> String {
    match &path.root {
        PathRoot::TaskOutput(id) => {
            let sub = segments_to_path_string(&path.segments);
            if sub.is_empty() {
                format!("<will-resolve-from-{id}>")
            } else {
                format!("<will-resolve-from-{id}.{sub}>")
            }
        }
        _ => "<null>".to_string(),
    }
}

/// Scan a template string for `tasks.<id>.output.*` references, used by the
/// dependency extractor. Malformed placeholders are ignored here;
/// they surface as a [`TemplateError`] only when the template is resolved.
pub(crate) fn referenced_task_ids(template: &str) -> Vec<String> {
    lex(template)
        .into_iter()
        .filter_map(|part| match part {
            TemplatePart::Placeholder(path) => match path.root {
                PathRoot::TaskOutput(id) => Some(id),
                _ => None,
            },
            TemplatePart::Literal(_) => None,
        })
        .collect()
}

/// Resolves `{{...}}` template strings against an [`ExecutionContext`],
/// caching the parsed form of each distinct template string.
#[derive(Debug, Default)]
pub struct TemplateResolver {
    cache: DashMap<String, Arc<Vec<TemplatePart>>>,
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn parts_for(&self, template: &str) -> Arc<Vec<TemplatePart>> {
        if let Some(cached) = self.cache.get(template) {
            return cached.clone();
        }
        let parsed = Arc::new(lex(template));
        self.cache.insert(template.to_string(), parsed.clone());
        parsed
    }

    /// Resolve a template string for real execution. Fails on an unknown
    /// root or malformed path; a missing leaf resolves to `null` rather
    /// than failing.
    pub fn resolve(&self, template: &str, ctx: &ExecutionContext) -> Result<Resolved, TemplateError> {
        let parts = self.parts_for(template);

        if let [TemplatePart::Placeholder(path)] = parts.as_slice() {
            if let PathSegment::Field(f) = path.segments.first().unwrap_or(&PathSegment::Index(usize::MAX)) {
                if f.starts_with('\0') {
                    return Err(TemplateError::MalformedPath(path.raw.clone(), "invalid placeholder".into()));
                }
            }
            let value = resolve_path(path, ctx)?;
            return Ok(Resolved::Value(value));
        }

        let mut out = String::new();
        for part in parts.iter() {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Placeholder(path) => {
                    if let PathSegment::Field(f) = path.segments.first().unwrap_or(&PathSegment::Index(usize::MAX)) {
                        if f.starts_with('\0') {
                            return Err(TemplateError::MalformedPath(path.raw.clone(), "invalid placeholder".into()));
                        }
                    }
                    let value = resolve_path(path, ctx)?;
                    out.push_str(&value_to_interpolated_string(&value));
                }
            }
        }
        Ok(Resolved::Text(out))
    }

    /// Resolve for preview/dry-run. Never fails: unresolved `tasks.*`
    /// references render as `<will-resolve-from-<id>.<path>>`; any other
    /// miss or unknown root renders as `<null>`. Idempotent by construction
    /// (a pure function of the template string alone).
    pub fn resolve_preview(&self, template: &str) -> String {
        let parts = self.parts_for(template);
        let mut out = String::new();
        for part in parts.iter() {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Placeholder(path) => {
                    let is_invalid = matches!(path.segments.first(), Some(PathSegment::Field(f)) if f.starts_with('\0'));
                    if is_invalid {
                        out.push_str("<null>");
                    } else {
                        out.push_str(&resolve_path_preview(path));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_input(input: Value) -> ExecutionContext {
        ExecutionContext::new(input, json!({}))
    }

    #[test]
    fn resolves_whole_string_typed_placeholder() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({"userId": "u1", "count": 3}));
        let resolved = resolver.resolve("{{input.count}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Value(json!(3)));
    }

    #[test]
    fn resolves_embedded_string_placeholder() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({"userId": "u1"}));
        let resolved = resolver.resolve("id={{input.userId}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Text("id=u1".to_string()));
    }

    #[test]
    fn missing_leaf_resolves_to_null_text() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({}));
        let resolved = resolver.resolve("v={{input.missing}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Text("v=null".to_string()));
    }

    #[test]
    fn whole_string_missing_leaf_is_typed_null() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({}));
        let resolved = resolver.resolve("{{input.missing}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Value(Value::Null));
    }

    #[test]
    fn unknown_root_fails() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({}));
        let err = resolver.resolve("{{bogus.foo}}", &ctx).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TemplateError);
    }

    #[test]
    fn bracketed_index_path() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({"items": [{"name": "a"}, {"name": "b"}]}));
        let resolved = resolver.resolve("{{input.items[1].name}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Value(json!("b")));
    }

    #[test]
    fn task_output_reference() {
        let resolver = TemplateResolver::new();
        let mut ctx = ctx_with_input(json!({}));
        ctx.tasks.insert(
            "t1".to_string(),
            crate::model::TaskOutcome {
                output: json!({"email": "a@x"}),
                success: true,
                started_at: chrono::Utc::now(),
                completed_at: chrono::Utc::now(),
                retry_count: 0,
                error: None,
            },
        );
        let resolved = resolver.resolve("{{tasks.t1.output.email}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Value(json!("a@x")));
    }

    #[test]
    fn unexecuted_task_output_is_null() {
        let resolver = TemplateResolver::new();
        let ctx = ctx_with_input(json!({}));
        let resolved = resolver.resolve("{{tasks.never_ran.output.x}}", &ctx).unwrap();
        assert_eq!(resolved, Resolved::Value(Value::Null));
    }

    #[test]
    fn preview_mode_never_fails_and_substitutes_tasks() {
        let resolver = TemplateResolver::new();
        let preview = resolver.resolve_preview("hello {{tasks.t1.output.email}} / {{bogus.foo}} / {{input.missing}}");
        assert_eq!(preview, "hello <will-resolve-from-t1.email> / <null> / <null>");
    }

    #[test]
    fn preview_is_idempotent() {
        let resolver = TemplateResolver::new();
        let a = resolver.resolve_preview("{{tasks.t1.output.x}}");
        let b = resolver.resolve_preview("{{tasks.t1.output.x}}");
        assert_eq!(a, b);
    }

    #[test]
    fn item_and_index_roots() {
        let resolver = TemplateResolver::new();
        let mut ctx = ctx_with_input(json!({}));
        ctx.loop_binding = Some(crate::model::LoopBinding {
            item: json!({"n": 7}),
            index: 2,
        });
        assert_eq!(resolver.resolve("{{item.n}}", &ctx).unwrap(), Resolved::Value(json!(7)));
        assert_eq!(resolver.resolve("{{index}}", &ctx).unwrap(), Resolved::Value(json!(2)));
    }
}
