//! Task condition evaluation and template substitution.
//!
//! Conditions are a small comparison language over the execution's shared
//! context:
//!
//! ```text
//! expr       := and_expr ('||' and_expr)*
//! and_expr   := unary ('&&' unary)*
//! unary      := '!'? comparison
//! comparison := operand (('==' | '!=' | '>=' | '<=' | '>' | '<') operand)?
//! operand    := number | 'true' | 'false' | '"string"' | dotted_path
//! ```
//!
//! A dotted path (`task_id.field.subfield`) reads a prior task's output.
//! Unknown fields resolve to null; null compares unequal to everything and
//! is falsy, so conditions over failed-and-absent outputs evaluate false.

use std::collections::HashMap;

use serde_json::Value;

/// Shared execution context: task id -> output map.
pub type SharedContext = HashMap<String, HashMap<String, Value>>;

/// Evaluate a condition against the shared context. Empty conditions are
/// unconditionally true.
pub fn evaluate(condition: &str, context: &SharedContext) -> bool {
    let trimmed = condition.trim();
    if trimmed.is_empty() {
        return true;
    }
    eval_or(trimmed, context)
}

fn eval_or(expr: &str, context: &SharedContext) -> bool {
    split_top_level(expr, "||")
        .into_iter()
        .any(|part| eval_and(part.trim(), context))
}

fn eval_and(expr: &str, context: &SharedContext) -> bool {
    split_top_level(expr, "&&")
        .into_iter()
        .all(|part| eval_unary(part.trim(), context))
}

fn eval_unary(expr: &str, context: &SharedContext) -> bool {
    if let Some(rest) = expr.strip_prefix('!') {
        !eval_unary(rest.trim(), context)
    } else {
        eval_comparison(expr, context)
    }
}

/// Split on an operator outside of quoted strings. The language has no
/// parentheses, so quote state is the only nesting to honor.
fn split_top_level<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut in_quotes = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                in_quotes = !in_quotes;
                i += 1;
            }
            _ if !in_quotes && bytes[i..].starts_with(op_bytes) => {
                parts.push(&expr[start..i]);
                i += op_bytes.len();
                start = i;
            }
            _ => i += 1,
        }
    }
    parts.push(&expr[start..]);
    parts
}

fn eval_comparison(expr: &str, context: &SharedContext) -> bool {
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((lhs, rhs)) = split_once_top_level(expr, op) {
            let left = resolve_operand(lhs.trim(), context);
            let right = resolve_operand(rhs.trim(), context);
            return compare(op, &left, &right);
        }
    }
    truthy(&resolve_operand(expr, context))
}

fn split_once_top_level<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts = split_top_level(expr, op);
    if parts.len() >= 2 {
        let lhs_len = parts[0].len();
        Some((&expr[..lhs_len], &expr[lhs_len + op.len()..]))
    } else {
        None
    }
}

fn resolve_operand(token: &str, context: &SharedContext) -> Value {
    if token == "true" {
        return Value::Bool(true);
    }
    if token == "false" {
        return Value::Bool(false);
    }
    if let Some(stripped) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Value::String(stripped.to_string());
    }
    if let Ok(n) = token.parse::<f64>() {
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    lookup_path(token, context).unwrap_or(Value::Null)
}

/// Resolve `task_id.field.subfield` in the shared context.
fn lookup_path(path: &str, context: &SharedContext) -> Option<Value> {
    let mut segments = path.split('.');
    let task_id = segments.next()?;
    let field = segments.next()?;

    let mut value = context.get(task_id)?.get(field)?.clone();
    for segment in segments {
        value = value.get(segment)?.clone();
    }
    Some(value)
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => values_equal(left, right),
        "!=" => !values_equal(left, right),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(l), Some(r)) => match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                "<=" => l <= r,
                _ => false,
            },
            // Ordered comparison against a non-number is false.
            _ => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Substitute `{{task_id.field}}`, `{{workflow.id}}`, and `{{workflow.name}}`
/// placeholders. Unknown placeholders are left verbatim.
pub fn substitute(
    template: &str,
    context: &SharedContext,
    workflow_id: &str,
    workflow_name: &str,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                let replacement = match key {
                    "workflow.id" => Some(workflow_id.to_string()),
                    "workflow.name" => Some(workflow_name.to_string()),
                    path => lookup_path(path, context).map(value_to_string),
                };
                match replacement {
                    Some(text) => out.push_str(&text),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..close]);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> SharedContext {
        let mut ctx = SharedContext::new();
        let mut score = HashMap::new();
        score.insert("risk".to_string(), json!(0.9));
        score.insert("label".to_string(), json!("malicious"));
        score.insert("hit".to_string(), json!(true));
        score.insert("details".to_string(), json!({"engine": "sig", "count": 3}));
        ctx.insert("score".to_string(), score);
        ctx
    }

    #[test]
    fn test_empty_condition_is_true() {
        assert!(evaluate("", &context()));
        assert!(evaluate("   ", &context()));
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = context();
        assert!(evaluate("score.risk > 0.8", &ctx));
        assert!(!evaluate("score.risk > 0.95", &ctx));
        assert!(evaluate("score.risk >= 0.9", &ctx));
        assert!(evaluate("score.risk < 1", &ctx));
        assert!(evaluate("score.risk != 1", &ctx));
    }

    #[test]
    fn test_string_equality() {
        let ctx = context();
        assert!(evaluate("score.label == \"malicious\"", &ctx));
        assert!(!evaluate("score.label == \"benign\"", &ctx));
        assert!(evaluate("score.label != \"benign\"", &ctx));
    }

    #[test]
    fn test_truthiness() {
        let ctx = context();
        assert!(evaluate("score.hit", &ctx));
        assert!(evaluate("score.label", &ctx));
        assert!(!evaluate("score.missing", &ctx));
        assert!(!evaluate("absent.anything", &ctx));
    }

    #[test]
    fn test_negation_and_boolean_operators() {
        let ctx = context();
        assert!(evaluate("!score.missing", &ctx));
        assert!(evaluate("score.hit && score.risk > 0.5", &ctx));
        assert!(!evaluate("score.hit && score.risk > 0.95", &ctx));
        assert!(evaluate("score.risk > 0.95 || score.label == \"malicious\"", &ctx));
        // && binds tighter than ||.
        assert!(evaluate("score.missing && score.hit || score.hit", &ctx));
    }

    #[test]
    fn test_nested_field_access() {
        let ctx = context();
        assert!(evaluate("score.details.count == 3", &ctx));
        assert!(evaluate("score.details.engine == \"sig\"", &ctx));
    }

    #[test]
    fn test_missing_fields_compare_false() {
        let ctx = context();
        assert!(!evaluate("ghost.value > 1", &ctx));
        assert!(!evaluate("ghost.value == 1", &ctx));
        // Inequality against null is true by negation of equality.
        assert!(evaluate("ghost.value != 1", &ctx));
    }

    #[test]
    fn test_substitution() {
        let ctx = context();
        let out = substitute(
            "http://svc/report?label={{score.label}}&run={{workflow.id}}",
            &ctx,
            "wf-123",
            "nightly",
        );
        assert_eq!(out, "http://svc/report?label=malicious&run=wf-123");
    }

    #[test]
    fn test_substitution_unknown_left_verbatim() {
        let ctx = context();
        let out = substitute("{{nothing.here}} stays", &ctx, "id", "name");
        assert_eq!(out, "{{nothing.here}} stays");
    }

    #[test]
    fn test_substitution_non_string_values() {
        let ctx = context();
        let out = substitute("risk={{score.risk}} n={{score.details.count}}", &ctx, "i", "n");
        assert_eq!(out, "risk=0.9 n=3");
    }

    #[test]
    fn test_workflow_name_placeholder() {
        let out = substitute("{{workflow.name}}", &SharedContext::new(), "id-1", "pipeline");
        assert_eq!(out, "pipeline");
    }
}
