//! JSON tree helpers shared by loading, secret scanning and the unused-key
//! report. Leaves are addressed by RFC 6901 pointers.

use serde_json::Value;

/// Every scalar in `root`, paired with its pointer, sorted by pointer.
/// Empty containers contribute nothing; a scalar root is reported as `/`.
pub(crate) fn leaves(root: &Value) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    let mut stack: Vec<(String, &Value)> = vec![(String::new(), root)];
    while let Some((ptr, v)) = stack.pop() {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    stack.push((format!("{ptr}/{}", escape(k)), child));
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    stack.push((format!("{ptr}/{i}"), child));
                }
            }
            _ => {
                let ptr = if ptr.is_empty() { "/".to_string() } else { ptr };
                out.push((ptr, v));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Overlay `layer` onto `base`: objects merge key by key, anything else
/// replaces.
pub(crate) fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(&k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        dst.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Whether `section` owns `pointer`. `/orders` owns `/orders/ttl_secs` but
/// not `/orders_legacy`.
pub(crate) fn owns(section: &str, pointer: &str) -> bool {
    match pointer.strip_prefix(section) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
