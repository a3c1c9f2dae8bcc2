//! Append-only JSONL audit log: event normalization, sensitive-field
//! masking, order traces, and the review queue derived from them.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::{Error, Result};

const MASK_TEXT: &str = "***";
const SENSITIVE_KEYS: [&str; 8] =
    ["password", "token", "api_key", "authorization", "cookie", "phone", "mobile", "email"];

/// Fields every persisted event carries, defaulted to null when absent.
const DEFAULTED_NULL_FIELDS: [&str; 9] = [
    "raw_text",
    "parse_result",
    "candidates",
    "llm_request",
    "llm_response",
    "fallback_reason",
    "merge_result",
    "final_output",
    "human_correction",
];

fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYS.contains(&lowered.as_str())
        || lowered.contains("token")
        || lowered.contains("secret")
}

fn looks_like_email(text: &str) -> bool {
    text.contains('@') && text.contains('.')
}

fn looks_like_token(text: &str) -> bool {
    text.chars().count() >= 16
        && text.chars().any(|ch| ch.is_numeric())
        && text.chars().any(|ch| ch.is_alphabetic())
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if is_sensitive_key(key) {
                        (key.clone(), json!(MASK_TEXT))
                    } else {
                        (key.clone(), mask_value(inner))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_value).collect()),
        Value::String(text) => {
            if looks_like_email(text) || looks_like_token(text) {
                json!(MASK_TEXT)
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

fn non_blank_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).map(str::trim).filter(|text| !text.is_empty())
}

/// Owns the JSONL audit file; appends are whole-line under an exclusive
/// file lock.
pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event with sensitive masking on (the default).
    pub fn write_event(&self, event: &Value) -> Result<Value> {
        self.write_event_with(event, true)
    }

    pub fn write_event_with(&self, event: &Value, mask_sensitive: bool) -> Result<Value> {
        let mut payload = self.to_event_payload(event)?;
        if mask_sensitive {
            for field in ["llm_request", "llm_response"] {
                let masked = payload.get(field).map(mask_value).unwrap_or(Value::Null);
                payload.insert(field.to_string(), masked);
            }
        }

        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');

        let file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(Error::Audit(format!(
                "failed to lock audit log: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mut file = file;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        // Lock released when `file` drops.

        Ok(Value::Object(payload))
    }

    /// Events for one order, in append order.
    pub fn list_events(&self, order_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|event| event.get("order_id").and_then(Value::as_str) == Some(order_id))
            .collect())
    }

    pub fn list_by_type(&self, event_type: &str) -> Result<Vec<Value>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|event| event.get("event_type").and_then(Value::as_str) == Some(event_type))
            .collect())
    }

    /// Fold an order's events into one trace: latest non-empty text wins,
    /// last non-null wins per stage field, corrections accumulate.
    pub fn get_order_trace(&self, order_id: &str) -> Result<Value> {
        let events = self.list_events(order_id)?;
        let mut trace = json!({
            "order_id": order_id,
            "raw_text": null,
            "parse_result": null,
            "candidates": null,
            "llm_request": null,
            "llm_response": null,
            "fallback_reason": null,
            "merge_result": null,
            "final_output": null,
            "manual_corrections": [],
            "events": events,
        });

        let events = trace["events"].as_array().unwrap().clone();
        for event in &events {
            if let Some(raw_text) = non_blank_str(event.get("raw_text")) {
                trace["raw_text"] = json!(raw_text);
            }
            for field in [
                "parse_result",
                "candidates",
                "llm_request",
                "llm_response",
                "merge_result",
                "final_output",
            ] {
                if let Some(value) = event.get(field) {
                    if !value.is_null() {
                        trace[field] = value.clone();
                    }
                }
            }
            if let Some(reason) = non_blank_str(event.get("fallback_reason")) {
                trace["fallback_reason"] = json!(reason);
            }
            if let Some(correction) = event.get("human_correction") {
                if correction.is_object() {
                    trace["manual_corrections"].as_array_mut().unwrap().push(correction.clone());
                }
            }
        }

        Ok(trace)
    }

    /// Orders with review-flagged events newer than their latest manual
    /// correction, newest activity first.
    pub fn list_review_queue(&self, limit: usize, unresolved_only: bool) -> Result<Vec<Value>> {
        let mut order_ids: Vec<String> = Vec::new();
        let mut by_order: HashMap<String, Vec<Value>> = HashMap::new();
        for event in self.read_all()? {
            let Some(order_id) = event.get("order_id").and_then(Value::as_str) else {
                continue;
            };
            if order_id.is_empty() {
                continue;
            }
            if !by_order.contains_key(order_id) {
                order_ids.push(order_id.to_string());
            }
            by_order.entry(order_id.to_string()).or_default().push(event);
        }

        let mut queue: Vec<Value> = Vec::new();
        for order_id in order_ids {
            let events = &by_order[&order_id];
            let mut latest_manual_fix_index: Option<usize> = None;
            for (index, event) in events.iter().enumerate() {
                if event.get("event_type").and_then(Value::as_str) != Some("manual_correction") {
                    continue;
                }
                let has_after = event
                    .get("human_correction")
                    .and_then(Value::as_object)
                    .and_then(|correction| correction.get("after"))
                    .map(|after| !after.is_null())
                    .unwrap_or(false);
                if has_after {
                    latest_manual_fix_index = Some(index);
                }
            }

            let pending_events: Vec<&Value> = events
                .iter()
                .enumerate()
                .filter(|(index, event)| {
                    event_needs_review(event)
                        && !(unresolved_only
                            && latest_manual_fix_index.is_some_and(|fix| *index <= fix))
                })
                .map(|(_, event)| event)
                .collect();
            if pending_events.is_empty() {
                continue;
            }

            let latest_event = events.last().unwrap();
            let latest_manual_fix = latest_manual_fix_index.map(|index| &events[index]);
            let raw_preview = events
                .iter()
                .rev()
                .find_map(|event| non_blank_str(event.get("raw_text")));

            let mut pending_event_types: Vec<&str> = Vec::new();
            for event in &pending_events {
                if let Some(event_type) = event.get("event_type").and_then(Value::as_str) {
                    if !pending_event_types.contains(&event_type) {
                        pending_event_types.push(event_type);
                    }
                }
            }

            queue.push(json!({
                "order_id": order_id,
                "latest_event_type": latest_event.get("event_type"),
                "latest_timestamp": latest_event.get("timestamp"),
                "pending_event_types": pending_event_types,
                "pending_count": pending_events.len(),
                "has_manual_correction": latest_manual_fix_index.is_some(),
                "latest_manual_correction": latest_manual_fix
                    .and_then(|event| event.get("human_correction")),
                "raw_preview": raw_preview,
            }));
        }

        queue.sort_by(|a, b| {
            let a_ts = a["latest_timestamp"].as_str().unwrap_or("");
            let b_ts = b["latest_timestamp"].as_str().unwrap_or("");
            b_ts.cmp(a_ts)
        });
        queue.truncate(limit);
        Ok(queue)
    }

    fn to_event_payload(&self, event: &Value) -> Result<Map<String, Value>> {
        let Some(source) = event.as_object() else {
            return Err(Error::Audit("audit event must be an object".to_string()));
        };
        let mut payload = source.clone();

        if non_blank_str(payload.get("order_id")).is_none() {
            return Err(Error::Audit("audit event missing required field: order_id".to_string()));
        }
        if non_blank_str(payload.get("event_type")).is_none() {
            return Err(Error::Audit(
                "audit event missing required field: event_type".to_string(),
            ));
        }

        payload.entry("timestamp".to_string()).or_insert_with(|| json!(utc_now_iso()));
        for field in DEFAULTED_NULL_FIELDS {
            payload.entry(field.to_string()).or_insert(Value::Null);
        }
        payload.entry("metadata".to_string()).or_insert_with(|| json!({}));
        payload.entry("needs_review".to_string()).or_insert(json!(false));

        let correction = normalize_human_correction(&payload)?;
        payload.insert(
            "human_correction".to_string(),
            correction.map(Value::Object).unwrap_or(Value::Null),
        );

        Ok(payload)
    }

    fn read_all(&self) -> Result<Vec<Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut events: Vec<Value> = Vec::new();
        for line in content.lines() {
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed) if parsed.is_object() => events.push(parsed),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "skipping malformed audit log line");
                }
            }
        }
        Ok(events)
    }
}

fn event_needs_review(event: &Value) -> bool {
    if event.get("needs_review") == Some(&Value::Bool(true)) {
        return true;
    }
    if event
        .get("metadata")
        .and_then(Value::as_object)
        .map(|metadata| metadata.get("needs_review") == Some(&Value::Bool(true)))
        .unwrap_or(false)
    {
        return true;
    }
    if non_blank_str(event.get("fallback_reason")).is_some() {
        return true;
    }
    for field in ["merge_result", "final_output"] {
        if let Some(value) = event.get(field).and_then(Value::as_object) {
            if value.get("overall_needs_review") == Some(&Value::Bool(true))
                || value.get("needs_review") == Some(&Value::Bool(true))
            {
                return true;
            }
        }
    }
    false
}

/// Promote legacy top-level correction fields into `human_correction` and
/// default its operator/timestamp.
fn normalize_human_correction(
    payload: &Map<String, Value>,
) -> Result<Option<Map<String, Value>>> {
    let correction = payload.get("human_correction").filter(|value| !value.is_null());
    let legacy_before = payload.get("before").filter(|value| !value.is_null());
    let legacy_after = payload.get("after").filter(|value| !value.is_null());
    let legacy_operator = payload.get("operator").filter(|value| !value.is_null());
    let legacy_timestamp = payload.get("correction_timestamp").filter(|value| !value.is_null());

    let correction = match correction {
        Some(value) => Some(value.clone()),
        None => {
            if legacy_before.is_some()
                || legacy_after.is_some()
                || legacy_operator.is_some()
                || legacy_timestamp.is_some()
            {
                Some(json!({
                    "before": legacy_before,
                    "after": legacy_after,
                    "operator": legacy_operator,
                    "timestamp": legacy_timestamp,
                }))
            } else {
                None
            }
        }
    };

    let Some(correction) = correction else {
        return Ok(None);
    };
    let Value::Object(mut correction) = correction else {
        return Err(Error::Audit("human_correction must be an object".to_string()));
    };

    if correction.get("before").map(Value::is_null).unwrap_or(true) {
        if let Some(before) = legacy_before {
            correction.insert("before".to_string(), before.clone());
        }
    }
    if correction.get("after").map(Value::is_null).unwrap_or(true) {
        if let Some(after) = legacy_after {
            correction.insert("after".to_string(), after.clone());
        }
    }

    let operator = non_blank_str(correction.get("operator"))
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    correction.insert("operator".to_string(), json!(operator));

    if non_blank_str(correction.get("timestamp")).is_none() {
        correction.insert("timestamp".to_string(), json!(utc_now_iso()));
    }

    Ok(Some(correction))
}
