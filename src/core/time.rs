//! Timestamps, run ids and the JSON envelope printed by `--format json`.

use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Unix-epoch seconds with a `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Identifier of one bootstrap run. Sorts by creation time.
pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "ts": now_epoch_z(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_epoch_z_format() {
        let result = now_epoch_z();
        assert!(result.ends_with('Z'));
        assert!(result.trim_end_matches('Z').parse::<u64>().is_ok());
    }

    #[test]
    fn test_run_ids_are_distinct_ulids() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(Ulid::from_string(&a).is_ok());
    }

    #[test]
    fn test_envelope_merges_extra_fields() {
        let envelope = command_envelope(
            "simulate",
            "ok",
            serde_json::json!({"run_id": "01J", "deployed": 3}),
        );
        assert_eq!(envelope["cmd"], "simulate");
        assert_eq!(envelope["status"], "ok");
        assert_eq!(envelope["run_id"], "01J");
        assert_eq!(envelope["deployed"], 3);
        assert!(envelope["ts"].is_string());
    }
}
