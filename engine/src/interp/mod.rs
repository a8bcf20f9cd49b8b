//! Variable interpolation over the test execution context.
//!
//! Every string handed to a handler may reference `${…}` expressions. A
//! reference that cannot be resolved stays literal, so a half-configured
//! suite degrades to visible placeholders instead of silent empty strings.

pub mod eval;

use std::path::PathBuf;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder regex"));

/// Names resolvable without a prefix, ahead of the fallback search order.
const MAGIC_NAMES: &[&str] = &[
    "suite_path",
    "workdir",
    "fixtures_dir",
    "artifacts",
    "uc_artifacts",
    "exit_code",
    "stdout",
    "stderr",
];

/// Execution context threaded through a single test.
///
/// `config`, `state`, `captured`, `steps`, and `last` are shared across
/// routine calls (mutations made inside a routine stay visible to the
/// caller); `params` is shadowed per routine invocation and restored when
/// the call returns.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Raw suite config tree (`config.a.b` dot-paths)
    pub config: Value,
    /// Shared mutable state map (`state.x`)
    pub state: Map<String, Value>,
    /// Captured step stdout by capture name (`captured.x`)
    pub captured: Map<String, Value>,
    /// Full step results by capture name (`steps.x.exit_code` …)
    pub steps: Map<String, Value>,
    /// Prior step result: exit_code, stdout, stderr (`last.x`)
    pub last: Map<String, Value>,
    /// Routine parameters, bound only inside a routine call (`params.x`)
    pub params: Map<String, Value>,
    /// Well-known values: suite_path, workdir, fixtures_dir, artifacts,
    /// uc_artifacts, test_id, uc_name, tc_name
    pub magic: Map<String, Value>,
    /// Ad-hoc values injected by the caller, searched after magic names
    pub extra: Map<String, Value>,
}

impl Context {
    /// Build a context for one test.
    #[allow(clippy::too_many_arguments)]
    pub fn for_test(
        config: Value,
        suite_path: &std::path::Path,
        workdir: &std::path::Path,
        artifacts: &std::path::Path,
        uc_artifacts: &std::path::Path,
        test_id: &str,
        uc_name: &str,
        tc_name: &str,
    ) -> Self {
        let mut magic = Map::new();
        let fixtures = suite_path.join("fixtures");
        magic.insert("suite_path".into(), path_value(suite_path));
        magic.insert("workdir".into(), path_value(workdir));
        magic.insert("fixtures_dir".into(), path_value(&fixtures));
        magic.insert("artifacts".into(), path_value(artifacts));
        magic.insert("uc_artifacts".into(), path_value(uc_artifacts));
        magic.insert("test_id".into(), Value::String(test_id.to_string()));
        magic.insert("uc_name".into(), Value::String(uc_name.to_string()));
        magic.insert("tc_name".into(), Value::String(tc_name.to_string()));
        Self {
            config,
            magic,
            ..Default::default()
        }
    }

    /// Record the outcome of the step that just ran.
    pub fn set_last(&mut self, exit_code: i64, stdout: &str, stderr: &str) {
        self.last.clear();
        self.last
            .insert("exit_code".into(), Value::Number(exit_code.into()));
        self.last
            .insert("stdout".into(), Value::String(stdout.to_string()));
        self.last
            .insert("stderr".into(), Value::String(stderr.to_string()));
    }

    /// Store a captured step under `name`: the full result object in
    /// `steps`, its stdout in `captured`.
    pub fn capture(&mut self, name: &str, result: Value, stdout: &str) {
        self.steps.insert(name.to_string(), result);
        self.captured
            .insert(name.to_string(), Value::String(stdout.to_string()));
    }

    fn fixtures_dir(&self) -> Option<PathBuf> {
        self.magic
            .get("fixtures_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    /// Substitute every `${expr}` in `text`. Unresolved references are left
    /// literal.
    pub fn resolve(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for caps in PLACEHOLDER_RE.captures_iter(text) {
            let whole = caps.get(0).expect("group 0 always present");
            let expr = caps.get(1).expect("group 1 in pattern").as_str();
            out.push_str(&text[cursor..whole.start()]);
            match self.resolve_expr(expr) {
                Some(value) => out.push_str(&render(&value)),
                None => {
                    debug!(expr, "unresolved reference, keeping placeholder");
                    out.push_str(whole.as_str());
                }
            }
            cursor = whole.end();
        }
        out.push_str(&text[cursor..]);
        out
    }

    /// Recursively interpolate a structured value: string values and object
    /// keys are resolved, other scalars pass through unchanged.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(self.resolve(k), self.resolve_value(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Resolve a single reference expression to a value, or `None` when the
    /// reference does not resolve. Explicit nulls count as unresolved so the
    /// placeholder survives.
    pub fn resolve_expr(&self, expr: &str) -> Option<Value> {
        let expr = expr.trim();

        if let Some(name) = expr.strip_prefix("env:") {
            return std::env::var(name).ok().map(Value::String);
        }
        if let Some(path) = expr.strip_prefix("file:") {
            return std::fs::read_to_string(path).ok().map(Value::String);
        }
        if let Some(rel) = expr.strip_prefix("fixture:") {
            let base = self.fixtures_dir()?;
            return std::fs::read_to_string(base.join(rel)).ok().map(Value::String);
        }
        if let Some(query) = expr.strip_prefix("json:") {
            let stdout = self.last.get("stdout").and_then(Value::as_str)?;
            return json_path_query(stdout, query);
        }
        if let Some(rest) = expr.strip_prefix("jsonfile:") {
            let (path, tail) = rest.split_once(":$")?;
            let text = std::fs::read_to_string(path).ok()?;
            return json_path_query(&text, &format!("${tail}"));
        }
        if let Some(rest) = expr.strip_prefix("jq:") {
            // Two forms: `jq:QUERY` over last.stdout, or
            // `jq:captured.NAME:QUERY` over a captured string.
            let (input, query) = if let Some(capture_rest) = rest.strip_prefix("captured.") {
                let (name, query) = capture_rest.split_once(':')?;
                let value = self.captured.get(name)?;
                (value.as_str().map(str::to_string)?, query)
            } else {
                let stdout = self.last.get("stdout").and_then(Value::as_str)?;
                (stdout.to_string(), rest)
            };
            return jq_query(&input, query);
        }

        if let Some(path) = expr.strip_prefix("config.") {
            return non_null(lookup_path(&self.config, path));
        }
        if let Some(path) = expr.strip_prefix("state.") {
            return non_null(lookup_map(&self.state, path));
        }
        if let Some(path) = expr.strip_prefix("captured.") {
            return non_null(lookup_map(&self.captured, path));
        }
        if let Some(path) = expr.strip_prefix("steps.") {
            return non_null(lookup_map(&self.steps, path));
        }
        if let Some(path) = expr.strip_prefix("params.") {
            return non_null(lookup_map(&self.params, path));
        }
        if let Some(field) = expr.strip_prefix("last.") {
            return non_null(self.last.get(field).cloned());
        }

        self.resolve_bare(expr)
    }

    /// Fallback search order for unprefixed identifiers: magic names, then
    /// the extra map, then captured, state, and config.
    fn resolve_bare(&self, expr: &str) -> Option<Value> {
        if MAGIC_NAMES.contains(&expr) {
            if let Some(value) = non_null(self.last.get(expr).cloned()) {
                return Some(value);
            }
            if let Some(value) = non_null(self.magic.get(expr).cloned()) {
                return Some(value);
            }
        }
        non_null(lookup_map(&self.extra, expr))
            .or_else(|| non_null(lookup_map(&self.captured, expr)))
            .or_else(|| non_null(lookup_map(&self.state, expr)))
            .or_else(|| non_null(lookup_path(&self.config, expr)))
    }
}

/// Render a resolved value as replacement text.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_null(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

fn path_value(path: &std::path::Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

/// Walk a dot-path through objects (by key) and arrays (by index).
fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Dot-path lookup where the first segment indexes a top-level map.
fn lookup_map(map: &Map<String, Value>, path: &str) -> Option<Value> {
    match path.split_once('.') {
        Some((head, rest)) => lookup_path(map.get(head)?, rest),
        None => map.get(path).cloned(),
    }
}

/// Evaluate a JSONPath query over a JSON document, returning the first match.
fn json_path_query(text: &str, query: &str) -> Option<Value> {
    let doc: Value = serde_json::from_str(text).ok()?;
    let matches = jsonpath_lib::select(&doc, query).ok()?;
    matches.first().map(|v| (*v).clone())
}

/// Run the external `jq` tool over an input string.
///
/// `-r` emits raw output so string results arrive unquoted; trailing newline
/// is trimmed. A missing binary or non-zero exit leaves the placeholder.
fn jq_query(input: &str, query: &str) -> Option<Value> {
    use std::io::Write;

    let mut child = std::process::Command::new("jq")
        .arg("-r")
        .arg(query)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(input.as_bytes()).ok()?;
    }
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(Value::String(text.trim_end_matches('\n').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> Context {
        let mut ctx = Context::for_test(
            json!({"packages": {"cli_version": "1.2.3"}, "aliases": {"api": "http://x"}}),
            std::path::Path::new("/suite"),
            std::path::Path::new("/work"),
            std::path::Path::new("/suite/suites/uc1/tc01/artifacts"),
            std::path::Path::new("/suite/suites/uc1/artifacts"),
            "uc1/tc01",
            "uc1",
            "tc01",
        );
        ctx.set_last(0, "hello world", "");
        ctx.state.insert("token".into(), json!("abc"));
        ctx.captured.insert("health".into(), json!("status ok"));
        ctx
    }

    #[test]
    fn test_resolve_prefixed_paths() {
        let ctx = test_context();
        assert_eq!(ctx.resolve("${config.packages.cli_version}"), "1.2.3");
        assert_eq!(ctx.resolve("${state.token}"), "abc");
        assert_eq!(ctx.resolve("${captured.health}"), "status ok");
        assert_eq!(ctx.resolve("${last.exit_code}"), "0");
        assert_eq!(ctx.resolve("v=${last.stdout}!"), "v=hello world!");
    }

    #[test]
    fn test_unresolved_reference_stays_literal() {
        let ctx = test_context();
        assert_eq!(ctx.resolve("${state.missing}"), "${state.missing}");
        assert_eq!(ctx.resolve("${nonsense}"), "${nonsense}");
    }

    #[test]
    fn test_magic_names() {
        let ctx = test_context();
        assert_eq!(ctx.resolve("${suite_path}"), "/suite");
        assert_eq!(ctx.resolve("${workdir}"), "/work");
        assert_eq!(ctx.resolve("${fixtures_dir}"), "/suite/fixtures");
        // Bare exit_code/stdout come from the last step result
        assert_eq!(ctx.resolve("${exit_code}"), "0");
        assert_eq!(ctx.resolve("${stdout}"), "hello world");
    }

    #[test]
    fn test_bare_fallback_order() {
        let mut ctx = test_context();
        ctx.extra.insert("health".into(), json!("from extra"));
        // extra wins over captured
        assert_eq!(ctx.resolve("${health}"), "from extra");
        ctx.extra.remove("health");
        assert_eq!(ctx.resolve("${health}"), "status ok");
        // config is the final fallback
        assert_eq!(ctx.resolve("${aliases.api}"), "http://x");
    }

    #[test]
    fn test_steps_lookup() {
        let mut ctx = test_context();
        ctx.capture("login", json!({"exit_code": 0, "stdout": "tok-1"}), "tok-1");
        assert_eq!(ctx.resolve("${steps.login.stdout}"), "tok-1");
        assert_eq!(ctx.resolve("${captured.login}"), "tok-1");
    }

    #[test]
    fn test_env_prefix() {
        let ctx = test_context();
        std::env::set_var("TSUITE_INTERP_TEST", "set");
        assert_eq!(ctx.resolve("${env:TSUITE_INTERP_TEST}"), "set");
        assert_eq!(
            ctx.resolve("${env:TSUITE_NOT_SET_EVER}"),
            "${env:TSUITE_NOT_SET_EVER}"
        );
    }

    #[test]
    fn test_json_path_over_last_stdout() {
        let mut ctx = test_context();
        ctx.set_last(0, r#"{"n": 42, "items": [{"id": "a"}]}"#, "");
        assert_eq!(ctx.resolve("${json:$.n}"), "42");
        assert_eq!(ctx.resolve("${json:$.items[0].id}"), "a");
    }

    #[test]
    fn test_jsonfile_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"version": "9.9"}"#).unwrap();
        let ctx = test_context();
        let expr = format!("${{jsonfile:{}:$.version}}", path.display());
        assert_eq!(ctx.resolve(&expr), "9.9");
    }

    #[test]
    fn test_file_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.txt");
        std::fs::write(&path, "file-content").unwrap();
        let ctx = test_context();
        let expr = format!("${{file:{}}}", path.display());
        assert_eq!(ctx.resolve(&expr), "file-content");
    }

    #[test]
    fn test_structured_interpolation() {
        let ctx = test_context();
        let input = json!({
            "${state.token}": {"url": "${aliases.api}/v1", "count": 3},
            "list": ["${captured.health}", 7, null]
        });
        let out = ctx.resolve_value(&input);
        assert_eq!(out.pointer("/abc/url").unwrap(), &json!("http://x/v1"));
        assert_eq!(out.pointer("/abc/count").unwrap(), &json!(3));
        assert_eq!(out.pointer("/list/0").unwrap(), &json!("status ok"));
        assert_eq!(out.pointer("/list/1").unwrap(), &json!(7));
    }

    #[test]
    fn test_params_only_inside_routine() {
        let mut ctx = test_context();
        assert_eq!(ctx.resolve("${params.x}"), "${params.x}");
        ctx.params.insert("x".into(), json!("bound"));
        assert_eq!(ctx.resolve("${params.x}"), "bound");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let mut ctx = test_context();
        ctx.state.insert("nums".into(), json!([1, 2]));
        assert_eq!(ctx.resolve("${state.nums}"), "[1,2]");
    }
}
