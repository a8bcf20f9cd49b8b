//! Assertion expression evaluator.
//!
//! Expressions compare two interpolated operands with one of the supported
//! operators, optionally combined with `and`/`or`. Both operands are
//! interpolated first, then coerced: numeric when both sides parse as
//! numbers, string otherwise.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Context;

/// Comparison operators, longest-first so `<=` wins over `<` and
/// `not contains` over `contains`.
const OPERATORS: &[&str] = &[
    "not contains",
    "contains",
    "matches",
    "==",
    "!=",
    "<=",
    ">=",
    "<",
    ">",
];

/// Outcome of evaluating one assertion, with both operand values retained
/// so the reporting surface can show a diff.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EvalResult {
    pub passed: bool,
    pub actual_value: String,
    pub expected_value: String,
    pub message: String,
}

impl EvalResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            actual_value: String::new(),
            expected_value: String::new(),
            message: message.into(),
        }
    }
}

/// Evaluate an assertion expression against the context.
///
/// `message` overrides the generated description on failure.
pub fn evaluate(ctx: &Context, expression: &str, message: Option<&str>) -> EvalResult {
    let mut first: Option<EvalResult> = None;
    let mut any_passed = false;

    // `and` binds tighter than `or`.
    for or_term in split_top_level(expression, "or") {
        let mut term_result: Option<EvalResult> = None;
        let mut term_passed = true;
        for clause in split_top_level(&or_term, "and") {
            let result = eval_clause(ctx, clause.trim());
            if !result.passed {
                term_passed = false;
            }
            // Keep the first failing clause of the term for diagnostics,
            // falling back to the first clause.
            if term_result.is_none() || (!result.passed && term_result.as_ref().is_some_and(|r| r.passed)) {
                term_result = Some(result);
            }
        }
        let mut term = term_result.unwrap_or_else(|| EvalResult::failed("empty expression"));
        term.passed = term_passed;
        if term_passed {
            any_passed = true;
        }
        if first.is_none() || (!first.as_ref().is_some_and(|r| r.passed) && term_passed) {
            first = Some(term);
        }
    }

    let mut result = first.unwrap_or_else(|| EvalResult::failed("empty expression"));
    result.passed = any_passed;
    if !result.passed {
        if let Some(msg) = message {
            result.message = msg.to_string();
        }
    }
    result
}

fn eval_clause(ctx: &Context, clause: &str) -> EvalResult {
    let Some((lhs, op, rhs)) = find_operator(clause) else {
        // No operator: treat the interpolated clause as a truth value.
        let actual = unquote(&ctx.resolve(clause));
        let passed = actual == "true" || actual == "1";
        return EvalResult {
            passed,
            actual_value: actual,
            expected_value: "true".to_string(),
            message: format!("{clause} is not true"),
        };
    };

    let actual = unquote(&ctx.resolve(lhs.trim()));
    let expected = unquote(&ctx.resolve(rhs.trim()));
    let passed = compare(&actual, op, &expected);

    EvalResult {
        passed,
        message: if passed {
            String::new()
        } else {
            format!("expected {lhs} {op} {rhs}, got '{actual}'")
        },
        actual_value: actual,
        expected_value: expected,
    }
}

fn compare(actual: &str, op: &str, expected: &str) -> bool {
    match op {
        "contains" => actual.contains(expected),
        "not contains" => !actual.contains(expected),
        "matches" => Regex::new(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        _ => {
            // Numeric when both sides parse as numbers, string otherwise.
            if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
                match op {
                    "==" => a == b,
                    "!=" => a != b,
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    ">=" => a >= b,
                    _ => false,
                }
            } else {
                match op {
                    "==" => actual == expected,
                    "!=" => actual != expected,
                    "<" => actual < expected,
                    "<=" => actual <= expected,
                    ">" => actual > expected,
                    ">=" => actual >= expected,
                    _ => false,
                }
            }
        }
    }
}

/// Locate the first comparison operator outside quotes and `${…}` braces.
fn find_operator(clause: &str) -> Option<(&str, &str, &str)> {
    let bytes = clause.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut brace_depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '$' if !in_single && !in_double && bytes.get(i + 1) == Some(&b'{') => {
                brace_depth += 1;
                i += 2;
                continue;
            }
            '}' if brace_depth > 0 => brace_depth -= 1,
            _ => {}
        }

        if !in_single && !in_double && brace_depth == 0 {
            for op in OPERATORS {
                if clause[i..].starts_with(op) && operator_delimited(clause, i, op) {
                    let lhs = &clause[..i];
                    let rhs = &clause[i + op.len()..];
                    return Some((lhs, op, rhs));
                }
            }
        }
        i += 1;
    }
    None
}

static WORD_OP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]").expect("valid word-op regex"));

/// Word operators (`contains`, `matches`, …) must stand alone between
/// whitespace; symbol operators need no delimiters.
fn operator_delimited(clause: &str, at: usize, op: &str) -> bool {
    if !WORD_OP.is_match(op) {
        return true;
    }
    let before_ok = at == 0
        || clause[..at]
            .chars()
            .next_back()
            .map(char::is_whitespace)
            .unwrap_or(true);
    let after = at + op.len();
    let after_ok = after >= clause.len()
        || clause[after..]
            .chars()
            .next()
            .map(char::is_whitespace)
            .unwrap_or(true);
    before_ok && after_ok
}

/// Split on a lowercase boolean keyword appearing outside quotes/braces.
fn split_top_level(expr: &str, keyword: &str) -> Vec<String> {
    let needle = format!(" {keyword} ");
    let bytes = expr.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut brace_depth = 0usize;
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '$' if !in_single && !in_double && bytes.get(i + 1) == Some(&b'{') => {
                brace_depth += 1;
                i += 2;
                continue;
            }
            '}' if brace_depth > 0 => brace_depth -= 1,
            _ => {}
        }

        if !in_single && !in_double && brace_depth == 0 && expr[i..].starts_with(&needle) {
            parts.push(expr[start..i].to_string());
            i += needle.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(expr[start..].to_string());
    parts
}

/// Strip one matching layer of surrounding quotes.
fn unquote(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2
        && ((t.starts_with('\'') && t.ends_with('\'')) || (t.starts_with('"') && t.ends_with('"')))
    {
        t[1..t.len() - 1].to_string()
    } else {
        t.to_string()
    }
}
