// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Locate JSON objects embedded in script text and walk them by path.

use serde_json::Value;

/// Balanced `{...}` / `[...]` spans in `text`, outermost only.
///
/// Quoted strings (single or double) are skipped so brackets inside them do
/// not count. A mismatched closer discards the span in progress.
pub fn json_candidates(text: &str) -> Vec<&str> {
    let mut results = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut start: Option<usize> = None;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(i);
                }
                stack.push(if c == '{' { '}' } else { ']' });
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                    if stack.is_empty() {
                        if let Some(s) = start.take() {
                            results.push(&text[s..=i]);
                        }
                    }
                } else {
                    stack.clear();
                    start = None;
                }
            }
            _ => {}
        }
    }
    results
}

/// Parse every candidate in `text` into JSON objects.
///
/// Top-level arrays contribute their object elements.
pub fn json_objects(text: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for candidate in json_candidates(text) {
        match serde_json::from_str::<Value>(candidate.trim().trim_end_matches(';')) {
            Ok(Value::Object(map)) => out.push(Value::Object(map)),
            Ok(Value::Array(items)) => out.extend(items.into_iter().filter(Value::is_object)),
            _ => {}
        }
    }
    out
}

/// Whether `key` appears anywhere in `value`.
pub fn contains_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key) || map.values().any(|v| contains_key(v, key)),
        Value::Array(items) => items.iter().any(|v| contains_key(v, key)),
        _ => false,
    }
}

/// Follow a dotted path such as `product.offers.0.price`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Scalar JSON value as text (strings unquoted, numbers verbatim).
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_skip_strings_and_noise() {
        let script = r#"window.__STATE__ = {"title": "a } tricky { one", "price": 10}; var x = [1, 2];"#;
        let found = json_candidates(script);
        assert_eq!(found.len(), 2);
        assert!(found[0].starts_with("{\"title\""));
        assert_eq!(found[1], "[1, 2]");
    }

    #[test]
    fn test_mismatched_closer_resets() {
        assert_eq!(json_candidates("{ ] {\"a\": 1}"), vec!["{\"a\": 1}"]);
    }

    #[test]
    fn test_objects_and_lookup() {
        let script = r#"dataLayer.push([{"event":"view"},{"product":{"offers":[{"price":"1299.00"}],"sku":"A1"}}]);"#;
        let objects = json_objects(script);
        assert_eq!(objects.len(), 2);
        let product = objects.iter().find(|o| contains_key(o, "sku")).unwrap();
        let price = lookup(product, "product.offers.0.price").unwrap();
        assert_eq!(scalar_text(price).as_deref(), Some("1299.00"));
        assert!(lookup(product, "product.offers.5.price").is_none());
    }
}
