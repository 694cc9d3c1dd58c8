//! Scalar and Promise Expansion
//!
//! Substitutes `$(ref)` / `${ref}` variable references against the
//! context, expands container trees (leaf keys and string leaves), and
//! produces the fully expanded promise an iteration frame carries.
//! References that do not resolve to a scalar are kept literal.

use serde_json::Value as Json;

use crate::classes::expression::ExpressionValue;
use crate::eval::context::EvalContext;
use crate::policy::types::Promise;
use crate::value::Value;
use crate::vars::types::VarRef;

/// Cap on value-driven re-expansion, guarding against reference cycles
/// that individual self-reference checks cannot see.
const MAX_EXPANSION_DEPTH: usize = 32;

/// Does `text` contain a substitution token naming exactly `lval`?
pub fn contains_var_token(text: &str, lval: &str) -> bool {
    text.contains(&format!("$({})", lval)) || text.contains(&format!("${{{}}}", lval))
}

/// Does `text` still carry any unexpanded substitution token?
pub fn contains_any_var_token(text: &str) -> bool {
    text.contains("$(") || text.contains("${")
}

/// Expand every variable reference in `input`. Unqualified references
/// are qualified with `(ns, scope)` before lookup when a scope is given.
pub fn expand_scalar(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    input: &str,
) -> String {
    expand_scalar_depth(ctx, ns, scope, input, 0)
}

fn expand_scalar_depth(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    input: &str,
    depth: usize,
) -> String {
    if depth > MAX_EXPANSION_DEPTH {
        return input.to_string();
    }

    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        // copy verbatim up to the next '$'
        let dollar = match input[i..].find('$') {
            Some(offset) => i + offset,
            None => {
                out.push_str(&input[i..]);
                break;
            }
        };
        out.push_str(&input[i..dollar]);
        i = dollar;

        let open = match bytes.get(i + 1) {
            Some(b'(') => Some((b'(', b')')),
            Some(b'{') => Some((b'{', b'}')),
            _ => None,
        };
        let Some((open_ch, close_ch)) = open else {
            out.push('$');
            i += 1;
            continue;
        };

        // find the matching closer, honoring nesting of the same kind
        let start = i + 2;
        let mut depth_count = 1;
        let mut j = start;
        while j < bytes.len() && depth_count > 0 {
            if bytes[j] == open_ch {
                depth_count += 1;
            } else if bytes[j] == close_ch {
                depth_count -= 1;
            }
            j += 1;
        }

        if depth_count != 0 {
            // unterminated reference, keep the rest literal
            out.push_str(&input[i..]);
            break;
        }

        let inner_raw = &input[start..j - 1];
        let inner = expand_scalar_depth(ctx, ns, scope, inner_raw, depth + 1);

        let mut reference = VarRef::parse(&inner);
        if !reference.is_qualified() {
            if let Some(scope) = scope {
                reference.qualify(ns, scope);
            }
        }

        match ctx.variable_get(&reference) {
            (Some(Value::Scalar(found)), _) => {
                if contains_any_var_token(&found) {
                    out.push_str(&expand_scalar_depth(ctx, ns, scope, &found, depth + 1));
                } else {
                    out.push_str(&found);
                }
            }
            _ => {
                // unresolved or not scalar-shaped: keep the token literal
                out.push('$');
                out.push(open_ch as char);
                out.push_str(&inner);
                out.push(close_ch as char);
            }
        }

        i = j;
    }

    out
}

/// Expand a container tree: every object key and every string leaf goes
/// through scalar expansion in the `this` scope.
pub fn json_expand(ctx: &EvalContext, source: &Json) -> Json {
    match source {
        Json::String(text) => Json::String(expand_scalar(ctx, None, Some("this"), text)),
        Json::Object(map) => {
            let mut expanded = serde_json::Map::new();
            for (key, child) in map {
                expanded.insert(expand_scalar(ctx, None, Some("this"), key), json_expand(ctx, child));
            }
            Json::Object(expanded)
        }
        Json::Array(items) => Json::Array(items.iter().map(|item| json_expand(ctx, item)).collect()),
        other => other.clone(),
    }
}

/// Expand a value of any shape.
pub fn expand_value(ctx: &EvalContext, value: &Value, ns: Option<&str>, scope: Option<&str>) -> Value {
    match value {
        Value::Scalar(text) => Value::Scalar(expand_scalar(ctx, ns, scope, text)),
        Value::List(items) => {
            Value::List(items.iter().map(|item| expand_value(ctx, item, ns, scope)).collect())
        }
        Value::Container(json) => Value::Container(json_expand(ctx, json)),
        Value::FnCall(call) => {
            let mut expanded = call.clone();
            expanded.args = call.args.iter().map(|arg| expand_value(ctx, arg, ns, scope)).collect();
            Value::FnCall(expanded)
        }
        Value::None => Value::None,
    }
}

/// Fully expand a promise against the current context. Returns `None`
/// when the promise's class context evaluates false or errors, i.e. the
/// promise is excluded from this iteration.
pub fn expand_promise(ctx: &EvalContext, pp: &Promise) -> Option<Promise> {
    if !pp.classes.is_empty()
        && ctx.check_class_expression(&pp.classes) != ExpressionValue::True
    {
        return None;
    }

    let mut expanded = pp.clone();
    expanded.promiser = expand_scalar(ctx, None, Some("this"), &pp.promiser);
    for constraint in &mut expanded.constraints {
        constraint.rval = expand_value(ctx, &constraint.rval, None, Some("this"));
    }
    Some(expanded)
}
