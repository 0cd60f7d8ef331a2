use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Canonical key for an action: lowercased tool name plus the arguments
/// rendered as canonical JSON (object keys sorted recursively, no
/// insignificant whitespace). Two calls that differ only in key order or
/// tool-name case count as the same action.
pub fn canonical_action_key(tool: &str, args: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    tool.to_lowercase().hash(&mut hasher);
    canonical_json(args).hash(&mut hasher);
    hasher.finish()
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Detects an executor stuck re-issuing the same failing action.
///
/// Purely mechanical: the window holds the last action key and its
/// consecutive failure count, no model involvement.
#[derive(Debug, Default)]
pub struct RepeatTracker {
    threshold: usize,
    last_key: Option<u64>,
    consecutive_failures: usize,
}

impl RepeatTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last_key: None,
            consecutive_failures: 0,
        }
    }

    /// Record one action outcome. Returns true when the same action has
    /// now failed `threshold` times in a row.
    pub fn record(&mut self, key: u64, success: bool) -> bool {
        if success {
            self.last_key = None;
            self.consecutive_failures = 0;
            return false;
        }
        if self.last_key == Some(key) {
            self.consecutive_failures += 1;
        } else {
            self.last_key = Some(key);
            self.consecutive_failures = 1;
        }
        self.consecutive_failures >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_ignores_field_order_and_case() {
        let a = canonical_action_key("Http_Get", &json!({"url": "/login", "verify": true}));
        let b = canonical_action_key("http_get", &json!({"verify": true, "url": "/login"}));
        assert_eq!(a, b);

        let c = canonical_action_key("http_get", &json!({"url": "/admin", "verify": true}));
        assert_ne!(a, c);
    }

    #[test]
    fn trips_on_third_consecutive_failure() {
        let mut tracker = RepeatTracker::new(3);
        let key = canonical_action_key("nmap", &json!({"target": "10.0.0.1"}));
        assert!(!tracker.record(key, false));
        assert!(!tracker.record(key, false));
        assert!(tracker.record(key, false));
    }

    #[test]
    fn success_or_different_action_resets() {
        let mut tracker = RepeatTracker::new(3);
        let a = canonical_action_key("nmap", &json!({"t": 1}));
        let b = canonical_action_key("curl", &json!({"t": 1}));
        assert!(!tracker.record(a, false));
        assert!(!tracker.record(a, false));
        assert!(!tracker.record(b, false)); // different action resets
        assert!(!tracker.record(b, true)); // success resets
        assert!(!tracker.record(b, false));
        assert!(!tracker.record(b, false));
        assert!(tracker.record(b, false));
    }
}
