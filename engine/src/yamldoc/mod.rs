//! Read-modify-write access to YAML files that preserves comments and key
//! order.
//!
//! Re-serializing a parsed map would drop comments and reorder keys, so all
//! writes here are line-surgical: the document is held as its original
//! lines, keys are located by indentation scanning, and only the touched
//! lines change. The parsed tree is used for reads only.

use serde_json::Value;

use crate::config::yaml_to_json;

/// Leaf value that removes a key during [`YamlDocument::merge_updates`].
pub const DELETE_SENTINEL: &str = "__DELETE__";

/// Error type for YAML document editing
#[derive(Debug, thiserror::Error)]
pub enum YamlDocError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("index {index} out of bounds for sequence {key} (len {len})")]
    IndexOutOfBounds {
        key: String,
        index: usize,
        len: usize,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for YAML document editing
pub type YamlDocResult<T> = Result<T, YamlDocError>;

/// A YAML file held as editable lines.
#[derive(Debug, Clone)]
pub struct YamlDocument {
    lines: Vec<String>,
}

/// Location of a mapping key within the document.
#[derive(Debug, Clone, Copy)]
struct KeyLoc {
    /// Line holding `key:` or `key: value`
    line: usize,
    indent: usize,
    /// First line after the key's nested block
    block_end: usize,
}

impl YamlDocument {
    /// Parse document text. The text is also validated as YAML.
    pub fn parse(text: &str) -> YamlDocResult<Self> {
        let _: serde_yaml::Value = serde_yaml::from_str(text)?;
        Ok(Self {
            lines: text.lines().map(str::to_string).collect(),
        })
    }

    /// Load a document from disk.
    pub fn load(path: &std::path::Path) -> YamlDocResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Serialize back to text. Byte-identical to the input modulo the
    /// trailing newline.
    pub fn to_text(&self) -> String {
        if self.lines.is_empty() {
            String::new()
        } else {
            let mut out = self.lines.join("\n");
            out.push('\n');
            out
        }
    }

    /// Write the document back to disk.
    pub fn save(&self, path: &std::path::Path) -> YamlDocResult<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Read a value at a dot-path, from the parsed tree.
    pub fn get_field(&self, path: &str) -> Option<Value> {
        let parsed: serde_yaml::Value = serde_yaml::from_str(&self.to_text()).ok()?;
        let mut current = yaml_to_json(parsed);
        for segment in path.split('.') {
            current = match current {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut items) => {
                    let idx: usize = segment.parse().ok()?;
                    if idx >= items.len() {
                        return None;
                    }
                    items.swap_remove(idx)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a value at a dot-path, creating intermediate mappings as needed.
    /// Comments on the key's own line survive scalar replacement.
    pub fn set_field(&mut self, path: &str, value: &Value) -> YamlDocResult<()> {
        let segments: Vec<&str> = path.split('.').collect();
        self.set_in_block(0, self.lines.len(), 0, &segments, value);
        Ok(())
    }

    /// Merge a nested update map into the document. Mappings merge
    /// recursively in place (sibling order and comments untouched); a leaf
    /// equal to [`DELETE_SENTINEL`] removes the key.
    pub fn merge_updates(&mut self, updates: &serde_json::Map<String, Value>) -> YamlDocResult<()> {
        for (key, value) in updates {
            match value {
                Value::String(s) if s == DELETE_SENTINEL => {
                    self.remove_field(key);
                }
                Value::Object(nested) => self.merge_at_path(key, nested)?,
                other => self.set_field(key, other)?,
            }
        }
        Ok(())
    }

    fn merge_at_path(
        &mut self,
        path: &str,
        updates: &serde_json::Map<String, Value>,
    ) -> YamlDocResult<()> {
        for (key, value) in updates {
            let child_path = format!("{path}.{key}");
            match value {
                Value::String(s) if s == DELETE_SENTINEL => {
                    self.remove_field(&child_path);
                }
                Value::Object(nested) => self.merge_at_path(&child_path, nested)?,
                other => self.set_field(&child_path, other)?,
            }
        }
        Ok(())
    }

    /// Remove a key and its nested block. Missing keys are a no-op.
    pub fn remove_field(&mut self, path: &str) {
        let segments: Vec<&str> = path.split('.').collect();
        if let Some(loc) = self.locate(0, self.lines.len(), 0, &segments) {
            self.lines.drain(loc.line..loc.block_end);
        }
    }

    /// Append a sequence item under `key`, or insert it at `index`.
    pub fn add_sequence_item(
        &mut self,
        key: &str,
        value: &Value,
        index: Option<usize>,
    ) -> YamlDocResult<()> {
        let loc = self.require_key(key)?;
        let items = self.sequence_items(&loc);
        let item_indent = items
            .first()
            .map(|r| indent_of(&self.lines[r.0]))
            .unwrap_or(loc.indent + 2);

        let rendered = render_sequence_item(value, item_indent);
        let at = match index {
            Some(i) if i < items.len() => items[i].0,
            _ => items.last().map(|r| r.1).unwrap_or(loc.block_end),
        };
        self.splice(at, 0, rendered);
        Ok(())
    }

    /// Remove the `index`-th item of the sequence under `key`.
    pub fn remove_sequence_item(&mut self, key: &str, index: usize) -> YamlDocResult<()> {
        let loc = self.require_key(key)?;
        let items = self.sequence_items(&loc);
        let range = items
            .get(index)
            .copied()
            .ok_or_else(|| YamlDocError::IndexOutOfBounds {
                key: key.to_string(),
                index,
                len: items.len(),
            })?;
        self.lines.drain(range.0..range.1);
        Ok(())
    }

    /// Merge field updates into the mapping item at `index` of the sequence
    /// under `key`. A [`DELETE_SENTINEL`] leaf removes the field.
    pub fn update_sequence_item(
        &mut self,
        key: &str,
        index: usize,
        updates: &serde_json::Map<String, Value>,
    ) -> YamlDocResult<()> {
        let loc = self.require_key(key)?;
        let items = self.sequence_items(&loc);
        let range = items
            .get(index)
            .copied()
            .ok_or_else(|| YamlDocError::IndexOutOfBounds {
                key: key.to_string(),
                index,
                len: items.len(),
            })?;

        // Fields of a `- key: value` item sit at the indent of the text
        // after the dash.
        let dash_indent = indent_of(&self.lines[range.0]);
        let field_indent = dash_indent + 2;

        for (field, value) in updates {
            let deleting = matches!(value, Value::String(s) if s == DELETE_SENTINEL);
            // Recompute the item's current extent each round: edits shift
            // line numbers.
            let items = self.sequence_items(&self.require_key(key)?);
            let range = items[index];
            let found = self.find_item_field(range, field_indent, field);
            match (found, deleting) {
                (Some(loc), true) => {
                    self.lines.drain(loc.line..loc.block_end);
                }
                (Some(loc), false) if loc.line == range.0 => {
                    // The field shares the dash line: `- key: value`
                    self.replace_dash_line_value(loc.line, value);
                }
                (Some(loc), false) => {
                    self.replace_value_at(loc, field, value, field_indent);
                }
                (None, true) => {}
                (None, false) => {
                    let rendered = render_mapping_entry(field, value, field_indent);
                    self.splice(range.1, 0, rendered);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Location helpers
    // =========================================================================

    fn require_key(&self, path: &str) -> YamlDocResult<KeyLoc> {
        let segments: Vec<&str> = path.split('.').collect();
        self.locate(0, self.lines.len(), 0, &segments)
            .ok_or_else(|| YamlDocError::KeyNotFound(path.to_string()))
    }

    /// Find a dot-path key inside the block `[start, end)` whose children
    /// sit at `min_indent` or deeper.
    fn locate(&self, start: usize, end: usize, min_indent: usize, segments: &[&str]) -> Option<KeyLoc> {
        let (head, rest) = segments.split_first()?;
        let block_indent = self.block_child_indent(start, end, min_indent)?;

        let mut i = start;
        while i < end {
            let line = &self.lines[i];
            if is_blank_or_comment(line) || indent_of(line) != block_indent {
                i += 1;
                continue;
            }
            if let Some(key) = mapping_key(line) {
                if key == *head {
                    let block_end = self.block_end(i, block_indent, end);
                    let loc = KeyLoc {
                        line: i,
                        indent: block_indent,
                        block_end,
                    };
                    return if rest.is_empty() {
                        Some(loc)
                    } else {
                        self.locate(i + 1, block_end, block_indent + 1, rest)
                    };
                }
            }
            i += 1;
        }
        None
    }

    /// Indent of the first real mapping line within a block.
    fn block_child_indent(&self, start: usize, end: usize, min_indent: usize) -> Option<usize> {
        self.lines[start..end]
            .iter()
            .find(|l| !is_blank_or_comment(l) && indent_of(l) >= min_indent)
            .map(|l| indent_of(l))
    }

    /// First line after `line` that closes the block opened at `indent`.
    fn block_end(&self, line: usize, indent: usize, limit: usize) -> usize {
        let mut i = line + 1;
        let mut end = i;
        while i < limit {
            let l = &self.lines[i];
            if is_blank_or_comment(l) {
                i += 1;
                continue;
            }
            if indent_of(l) <= indent {
                break;
            }
            i += 1;
            end = i;
        }
        end
    }

    /// Item ranges `[start, end)` of the sequence directly under a key.
    fn sequence_items(&self, loc: &KeyLoc) -> Vec<(usize, usize)> {
        let mut items = Vec::new();
        let mut item_indent = None;
        let mut i = loc.line + 1;
        while i < loc.block_end {
            let line = &self.lines[i];
            if is_blank_or_comment(line) {
                i += 1;
                continue;
            }
            let indent = indent_of(line);
            if line.trim_start().starts_with('-') && item_indent.map_or(true, |ii| ii == indent) {
                item_indent = Some(indent);
                let end = self.item_end(i, indent, loc.block_end);
                items.push((i, end));
                i = end;
            } else {
                i += 1;
            }
        }
        items
    }

    /// End of a sequence item: the next dash at the same indent or the end
    /// of the owning block.
    fn item_end(&self, start: usize, indent: usize, limit: usize) -> usize {
        let mut i = start + 1;
        let mut end = i;
        while i < limit {
            let line = &self.lines[i];
            if is_blank_or_comment(line) {
                i += 1;
                continue;
            }
            let li = indent_of(line);
            if li < indent || (li == indent && line.trim_start().starts_with('-')) {
                break;
            }
            i += 1;
            end = i;
        }
        end
    }

    /// Find a field line inside a sequence item range.
    fn find_item_field(
        &self,
        range: (usize, usize),
        field_indent: usize,
        field: &str,
    ) -> Option<KeyLoc> {
        let mut i = range.0;
        while i < range.1 {
            let line = &self.lines[i];
            if is_blank_or_comment(line) {
                i += 1;
                continue;
            }
            // The first field may share the dash line: `- key: value`
            let content = if i == range.0 {
                line.trim_start().strip_prefix('-').unwrap_or(line).trim_start()
            } else if indent_of(line) == field_indent {
                line.trim_start()
            } else {
                i += 1;
                continue;
            };
            if mapping_key(content) == Some(field) {
                let block_end = self.block_end(i, field_indent.max(indent_of(line)), range.1);
                return Some(KeyLoc {
                    line: i,
                    indent: field_indent,
                    block_end,
                });
            }
            i += 1;
        }
        None
    }

    // =========================================================================
    // Mutation helpers
    // =========================================================================

    fn set_in_block(
        &mut self,
        start: usize,
        end: usize,
        min_indent: usize,
        segments: &[&str],
        value: &Value,
    ) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };
        let block_indent = self
            .block_child_indent(start, end, min_indent)
            .unwrap_or(min_indent);

        // Look for the key at this level
        let mut i = start;
        while i < end {
            let line = self.lines[i].clone();
            if !is_blank_or_comment(&line) && indent_of(&line) == block_indent {
                if mapping_key(&line) == Some(head) {
                    let block_end = self.block_end(i, block_indent, end);
                    if rest.is_empty() {
                        let loc = KeyLoc {
                            line: i,
                            indent: block_indent,
                            block_end,
                        };
                        self.replace_value_at(loc, head, value, block_indent);
                    } else {
                        self.set_in_block(i + 1, block_end, block_indent + 1, rest, value);
                    }
                    return;
                }
            }
            i += 1;
        }

        // Key missing: append it (and any remaining path) at the end of the
        // block.
        let mut nested = value.clone();
        for segment in rest.iter().rev() {
            let mut map = serde_json::Map::new();
            map.insert(segment.to_string(), nested);
            nested = Value::Object(map);
        }
        let rendered = render_mapping_entry(head, &nested, block_indent);
        self.splice(end, 0, rendered);
    }

    /// Replace the value of the key at `loc`, keeping a trailing comment on
    /// the key line when the new value is scalar.
    fn replace_value_at(&mut self, loc: KeyLoc, key: &str, value: &Value, indent: usize) {
        let comment = trailing_comment(&self.lines[loc.line]);
        let replacement = match value {
            Value::Object(_) | Value::Array(_) => render_mapping_entry(key, value, indent),
            scalar => {
                let mut line = format!(
                    "{}{}: {}",
                    " ".repeat(indent),
                    key,
                    render_scalar(scalar)
                );
                if let Some(c) = comment {
                    line.push(' ');
                    line.push_str(&c);
                }
                vec![line]
            }
        };
        let removed = loc.block_end - loc.line;
        self.splice(loc.line, removed, replacement);
    }

    /// Replace the value on a `- key: value` line, keeping the dash prefix
    /// and any trailing comment.
    fn replace_dash_line_value(&mut self, line: usize, value: &Value) {
        let original = self.lines[line].clone();
        let comment = trailing_comment(&original);
        if let Some(colon) = find_unquoted_colon(&original) {
            let mut replaced = format!("{}: {}", &original[..colon], render_scalar(value));
            if let Some(c) = comment {
                replaced.push(' ');
                replaced.push_str(&c);
            }
            self.lines[line] = replaced;
        }
    }

    fn splice(&mut self, at: usize, remove: usize, insert: Vec<String>) {
        self.lines.splice(at..at + remove, insert);
    }
}

// =============================================================================
// Line-level helpers
// =============================================================================

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.is_empty() || t.starts_with('#')
}

/// The key of a `key:` / `key: value` line, if it is one.
fn mapping_key(line: &str) -> Option<&str> {
    let t = line.trim_start();
    if t.starts_with('#') || t.starts_with('-') {
        return None;
    }
    let colon = find_unquoted_colon(t)?;
    let key = t[..colon].trim();
    let after = t[colon + 1..].chars().next();
    match after {
        None | Some(' ') => Some(key.trim_matches(|c| c == '"' || c == '\'')),
        _ => None,
    }
}

fn find_unquoted_colon(s: &str) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ':' if !in_single && !in_double => return Some(i),
            '#' if !in_single && !in_double => return None,
            _ => {}
        }
    }
    None
}

/// A ` # comment` trailing the value on a key line.
fn trailing_comment(line: &str) -> Option<String> {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => {
                if i > 0 && line.as_bytes()[i - 1] == b' ' {
                    return Some(line[i..].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Render a scalar the way it appears inline after `key: `.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if needs_quoting(s) {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.contains(':')
        || s.contains('#')
        || s.contains('\n')
        || s.starts_with(|c: char| c.is_whitespace() || "-?[]{}&*!|>'\"%@`".contains(c))
        || s.ends_with(char::is_whitespace)
        || matches!(s, "true" | "false" | "null" | "~" | "yes" | "no")
        || s.parse::<f64>().is_ok()
}

/// Render `key: value` lines for a mapping entry, block style for nested
/// structures.
fn render_mapping_entry(key: &str, value: &Value, indent: usize) -> Vec<String> {
    let pad = " ".repeat(indent);
    match value {
        Value::Object(map) if !map.is_empty() => {
            let mut lines = vec![format!("{pad}{key}:")];
            for (k, v) in map {
                lines.extend(render_mapping_entry(k, v, indent + 2));
            }
            lines
        }
        Value::Array(items) if !items.is_empty() => {
            let mut lines = vec![format!("{pad}{key}:")];
            for item in items {
                lines.extend(render_sequence_item(item, indent + 2));
            }
            lines
        }
        Value::Object(_) => vec![format!("{pad}{key}: {{}}")],
        Value::Array(_) => vec![format!("{pad}{key}: []")],
        scalar => vec![format!("{pad}{key}: {}", render_scalar(scalar))],
    }
}

/// Render one `- …` sequence item at the given indent.
fn render_sequence_item(value: &Value, indent: usize) -> Vec<String> {
    let pad = " ".repeat(indent);
    match value {
        Value::Object(map) if !map.is_empty() => {
            let mut lines = Vec::new();
            for (i, (k, v)) in map.iter().enumerate() {
                if i == 0 {
                    match v {
                        Value::Object(_) | Value::Array(_) => {
                            lines.push(format!("{pad}- {k}:"));
                            let rendered = render_mapping_entry(k, v, indent + 2);
                            lines.extend(rendered.into_iter().skip(1));
                        }
                        scalar => lines.push(format!("{pad}- {k}: {}", render_scalar(scalar))),
                    }
                } else {
                    lines.extend(render_mapping_entry(k, v, indent + 2));
                }
            }
            lines
        }
        scalar => vec![format!("{pad}- {}", render_scalar(scalar))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = "\
# Suite configuration
suite:
  name: mesh  # the suite name
  mode: docker

execution:
  max_workers: 4
  timeout: 600

# Steps below
test:
  - name: first
    handler: shell
    command: echo one
  - name: second
    handler: shell
    command: echo two
";

    #[test]
    fn test_round_trip_preserves_bytes() {
        let doc = YamlDocument::parse(DOC).unwrap();
        assert_eq!(doc.to_text(), DOC);
    }

    #[test]
    fn test_round_trip_without_trailing_newline() {
        let trimmed = DOC.trim_end();
        let doc = YamlDocument::parse(trimmed).unwrap();
        assert_eq!(doc.to_text(), format!("{trimmed}\n"));
    }

    #[test]
    fn test_get_field() {
        let doc = YamlDocument::parse(DOC).unwrap();
        assert_eq!(doc.get_field("suite.name"), Some(json!("mesh")));
        assert_eq!(doc.get_field("execution.max_workers"), Some(json!(4)));
        assert_eq!(doc.get_field("test.1.command"), Some(json!("echo two")));
        assert_eq!(doc.get_field("suite.missing"), None);
    }

    #[test]
    fn test_set_field_keeps_comments_and_order() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.set_field("suite.name", &json!("renamed")).unwrap();
        let text = doc.to_text();
        assert!(text.contains("  name: renamed  # the suite name"));
        assert!(text.starts_with("# Suite configuration\n"));
        // Order unchanged: suite still before execution
        let suite_pos = text.find("suite:").unwrap();
        let exec_pos = text.find("execution:").unwrap();
        assert!(suite_pos < exec_pos);
    }

    #[test]
    fn test_set_field_creates_missing_keys() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.set_field("execution.retries", &json!(3)).unwrap();
        let parsed = doc.get_field("execution.retries");
        assert_eq!(parsed, Some(json!(3)));
        // Existing sibling untouched
        assert_eq!(doc.get_field("execution.timeout"), Some(json!(600)));
    }

    #[test]
    fn test_set_field_numeric_and_bool() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.set_field("execution.max_workers", &json!(16)).unwrap();
        doc.set_field("suite.verbose", &json!(true)).unwrap();
        assert_eq!(doc.get_field("execution.max_workers"), Some(json!(16)));
        assert_eq!(doc.get_field("suite.verbose"), Some(json!(true)));
    }

    #[test]
    fn test_add_sequence_item_appends() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.add_sequence_item(
            "test",
            &json!({"name": "third", "handler": "shell", "command": "echo three"}),
            None,
        )
        .unwrap();
        assert_eq!(doc.get_field("test.2.name"), Some(json!("third")));
        assert_eq!(doc.get_field("test.0.name"), Some(json!("first")));
    }

    #[test]
    fn test_add_sequence_item_at_index() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.add_sequence_item("test", &json!({"name": "inserted", "handler": "wait"}), Some(1))
            .unwrap();
        assert_eq!(doc.get_field("test.1.name"), Some(json!("inserted")));
        assert_eq!(doc.get_field("test.2.name"), Some(json!("second")));
    }

    #[test]
    fn test_remove_sequence_item() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        doc.remove_sequence_item("test", 0).unwrap();
        assert_eq!(doc.get_field("test.0.name"), Some(json!("second")));
        let err = doc.remove_sequence_item("test", 5).unwrap_err();
        assert!(matches!(err, YamlDocError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn test_update_sequence_item() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        let mut updates = serde_json::Map::new();
        updates.insert("command".into(), json!("echo patched"));
        updates.insert("timeout".into(), json!(30));
        doc.update_sequence_item("test", 1, &updates).unwrap();
        assert_eq!(doc.get_field("test.1.command"), Some(json!("echo patched")));
        assert_eq!(doc.get_field("test.1.timeout"), Some(json!(30)));
        // Neighbour untouched
        assert_eq!(doc.get_field("test.0.command"), Some(json!("echo one")));
    }

    #[test]
    fn test_update_sequence_item_dash_line_field() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        let mut updates = serde_json::Map::new();
        updates.insert("name".into(), json!("renamed"));
        doc.update_sequence_item("test", 0, &updates).unwrap();
        assert_eq!(doc.get_field("test.0.name"), Some(json!("renamed")));
        assert!(doc.to_text().contains("  - name: renamed"));
        assert_eq!(doc.get_field("test.0.handler"), Some(json!("shell")));
    }

    #[test]
    fn test_update_sequence_item_delete_field() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        let mut updates = serde_json::Map::new();
        updates.insert("command".into(), json!(DELETE_SENTINEL));
        doc.update_sequence_item("test", 0, &updates).unwrap();
        assert_eq!(doc.get_field("test.0.command"), None);
        assert_eq!(doc.get_field("test.0.handler"), Some(json!("shell")));
    }

    #[test]
    fn test_merge_updates_recursive() {
        let mut doc = YamlDocument::parse(DOC).unwrap();
        let updates: serde_json::Map<String, Value> = serde_json::from_value(json!({
            "execution": {"max_workers": 8},
            "suite": {"mode": "__DELETE__"},
            "reports": {"output_dir": "out"}
        }))
        .unwrap();
        doc.merge_updates(&updates).unwrap();

        assert_eq!(doc.get_field("execution.max_workers"), Some(json!(8)));
        // Sibling of the merged key survives with its comment
        assert!(doc.to_text().contains("# the suite name"));
        assert_eq!(doc.get_field("suite.mode"), None);
        assert_eq!(doc.get_field("suite.name"), Some(json!("mesh")));
        assert_eq!(doc.get_field("reports.output_dir"), Some(json!("out")));
    }

    #[test]
    fn test_scalar_rendering_quotes_when_needed() {
        let mut doc = YamlDocument::parse("a: 1\n").unwrap();
        doc.set_field("b", &json!("plain")).unwrap();
        doc.set_field("c", &json!("needs: quoting")).unwrap();
        doc.set_field("d", &json!("123")).unwrap();
        let text = doc.to_text();
        assert!(text.contains("b: plain"));
        assert!(text.contains("c: \"needs: quoting\""));
        // Numeric-looking strings stay strings
        assert_eq!(doc.get_field("d"), Some(json!("123")));
    }

    #[test]
    fn test_blank_lines_and_comments_inside_blocks_survive_edits() {
        let text = "\
top:
  a: 1

  # interior comment
  b: 2
tail: x
";
        let mut doc = YamlDocument::parse(text).unwrap();
        doc.set_field("top.b", &json!(3)).unwrap();
        let out = doc.to_text();
        assert!(out.contains("# interior comment"));
        assert!(out.contains("  b: 3"));
        assert!(out.contains("tail: x"));
        assert_eq!(doc.get_field("top.a"), Some(json!(1)));
    }
}
