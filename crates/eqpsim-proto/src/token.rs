//! `NAME=VALUE` token parsing for frame payloads.
//!
//! A frame's payload is whitespace-separated tokens of the form
//! `NAME=VALUE`. Names are case-insensitive and normalized to upper case;
//! values keep their case but are trimmed. The `CMD` token drives the wait
//! and handshake matching, so it gets a dedicated accessor.

use std::collections::HashMap;

/// Extract the `CMD` value from a frame payload, uppercased.
///
/// The first whitespace-separated `CMD=<value>` token with a non-empty name
/// and value wins; the name comparison is case-insensitive. Returns `None`
/// when no such token exists.
pub fn extract_command(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        let Some((name, value)) = split_token(token) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if name.eq_ignore_ascii_case("CMD") {
            return Some(value.to_ascii_uppercase());
        }
    }
    None
}

/// Parse a frame payload into an upper-key map.
///
/// Keys are uppercased, values trimmed but otherwise preserved. The last
/// occurrence of a key wins. Tokens without `=` or with an empty name are
/// skipped.
pub fn parse_all(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for token in text.split_whitespace() {
        let Some((name, value)) = split_token(token) else {
            continue;
        };
        out.insert(name.to_ascii_uppercase(), value.to_string());
    }
    out
}

/// Split one token into `(name, value)`, both trimmed. Returns `None` when
/// there is no `=` or the name is empty. The value is everything after the
/// first `=`, so values may themselves contain `=`.
fn split_token(token: &str) -> Option<(&str, &str)> {
    let (name, value) = token.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
