//! Payload template resolution.
//!
//! `{eqpid}` resolves to the connection's equipment identity and
//! `{var.<key>}` to a configured variable; placeholder names are matched
//! case-insensitively. Anything else in braces stays verbatim, including
//! unterminated braces.

use std::collections::HashMap;

/// Resolves placeholders in a payload template.
///
/// `vars` must be keyed by lowercase variable name; `{var.<key>}` lookups
/// lowercase the key before probing.
pub fn resolve(template: &str, eqp_id: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let raw = &after_open[..close];
        let key = raw.trim().to_ascii_lowercase();
        let replacement = if key == "eqpid" {
            Some(eqp_id)
        } else {
            key.strip_prefix("var.").and_then(|k| vars.get(k)).map(String::as_str)
        };

        match replacement {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(raw);
                out.push('}');
            }
        }
        rest = &after_open[close + 1..];
    }

    out.push_str(rest);
    out
}
