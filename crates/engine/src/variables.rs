//! `${name}` placeholder substitution for task parameters.
//!
//! Substitution is deliberately shallow and identity-matched: only string
//! values that are *exactly* `${name}` are replaced, and resolution never
//! descends into nested objects or arrays. Callers that need to template a
//! nested value wrap it in a single variable.

use serde_json::Value;

use crate::models::JsonMap;

/// Substitute `${name}` placeholders in `params` from `variables`.
///
/// A placeholder whose variable is absent is left verbatim so the
/// misconfiguration surfaces to the agent instead of silently becoming
/// null. Resolution is idempotent for non-placeholder variable values.
pub fn resolve_params(params: &JsonMap, variables: &JsonMap) -> JsonMap {
    params
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(s) => match placeholder_name(s) {
                    Some(name) => variables.get(name).cloned().unwrap_or_else(|| value.clone()),
                    None => value.clone(),
                },
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

/// Return the variable name iff the whole string is a single `${name}`
/// placeholder.
fn placeholder_name(s: &str) -> Option<&str> {
    let name = s.strip_prefix("${")?.strip_suffix('}')?;
    if name.is_empty() || name.contains(['$', '{', '}']) {
        return None;
    }
    Some(name)
}
