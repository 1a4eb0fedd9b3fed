use chrono::{DateTime, Utc};

/// Pulls an optional trimmed string param; blank counts as absent.
pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn str_list(params: &serde_json::Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Wall clock, overridable per request so scheduled behavior is testable.
pub fn effective_now(params: &serde_json::Value) -> Result<DateTime<Utc>, String> {
    match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => raw
            .parse::<DateTime<Utc>>()
            .map_err(|e| format!("bad now timestamp: {}", e)),
        None => Ok(Utc::now()),
    }
}
