use serde_json::{Map, Value};

/// Fire-and-forget structured event sink. Events become one JSON line each
/// on the `log` facade; emitting can never fail a job.
#[derive(Debug, Clone)]
pub struct Telemetry {
    enabled: bool,
}

impl Telemetry {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn emit(&self, event: &str, fields: &[(&str, Value)]) {
        if !self.enabled {
            return;
        }

        let mut payload = Map::new();
        payload.insert("ts".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
        payload.insert("event".to_string(), Value::String(event.to_string()));
        for (key, value) in fields {
            payload.insert((*key).to_string(), value.clone());
        }

        log::info!(target: "telemetry", "{}", Value::Object(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_sink_is_silent() {
        // must not panic or touch the logger in any observable way
        let t = Telemetry::new(false);
        t.emit("job.started", &[("job_id", json!("job_x"))]);
    }

    #[test]
    fn test_enabled_sink_accepts_arbitrary_fields() {
        let t = Telemetry::new(true);
        t.emit(
            "job.succeeded",
            &[
                ("job_id", json!("job_x")),
                ("user_id", json!("u1")),
                ("attempt", json!(2)),
                ("duration_ms", json!(1234)),
            ],
        );
    }
}
