//! ABOUTME: The tagged result envelope every tool call returns
//! ABOUTME: ok:true payloads or ok:false with a stable error kind and context

use ko_core::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};

/// Wrap a kernel result in the `{ok, ...}` / `{ok, error_kind, ...}` shape
pub fn envelope<T: Serialize>(result: Result<T>) -> Value {
    match result {
        Ok(payload) => match serde_json::to_value(&payload) {
            Ok(Value::Object(mut map)) => {
                map.insert("ok".to_string(), Value::Bool(true));
                Value::Object(map)
            }
            Ok(other) => json!({"ok": true, "result": other}),
            Err(e) => json!({
                "ok": false,
                "error_kind": "ConfigError",
                "message": format!("unserializable payload: {}", e),
            }),
        },
        Err(error) => {
            let mut map = serde_json::Map::new();
            map.insert("ok".to_string(), Value::Bool(false));
            map.insert("error_kind".to_string(), json!(error.kind()));
            map.insert("message".to_string(), json!(error.to_string()));
            if let Some(context) = context_for(&error) {
                map.insert("context".to_string(), context);
            }
            Value::Object(map)
        }
    }
}

/// Structured context per error kind, for client-side handling
fn context_for(error: &Error) -> Option<Value> {
    match error {
        Error::Timeout {
            op_id,
            estimate_s,
            limit_s,
        } => Some(json!({
            "op_id": op_id,
            "estimate_s": estimate_s,
            "limit_s": limit_s,
            "cleanup_attempted": true,
        })),
        Error::ExecFailed { code, stderr_tail } => Some(json!({
            "exit_code": code,
            "stderr_tail": stderr_tail,
        })),
        Error::Validation { field, .. } => Some(json!({"field": field})),
        Error::OutsidePolicy(path) => Some(json!({"path": path})),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        file_id: String,
    }

    #[test]
    fn test_ok_envelope_flattens_payload() {
        let value = envelope(Ok(Payload {
            file_id: "file_12345678".to_string(),
        }));
        assert_eq!(value["ok"], true);
        assert_eq!(value["file_id"], "file_12345678");
    }

    #[test]
    fn test_ok_envelope_wraps_sequences() {
        let value = envelope(Ok(vec![1, 2, 3]));
        assert_eq!(value["ok"], true);
        assert_eq!(value["result"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_error_envelope_carries_kind_and_context() {
        let result: ko_core::Result<Payload> = Err(Error::Timeout {
            op_id: "op-1".to_string(),
            estimate_s: 100,
            limit_s: 150,
        });
        let value = envelope(result);
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_kind"], "Timeout");
        assert_eq!(value["context"]["cleanup_attempted"], true);
        assert_eq!(value["context"]["limit_s"], 150);
    }

    #[test]
    fn test_validation_error_names_field() {
        let result: ko_core::Result<Payload> =
            Err(Error::validation("segments[0].params.duration", "must be > 0"));
        let value = envelope(result);
        assert_eq!(value["error_kind"], "ValidationError");
        assert_eq!(value["context"]["field"], "segments[0].params.duration");
    }
}
