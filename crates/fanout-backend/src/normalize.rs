//! Normalization of heterogeneous backend event vocabularies.
//!
//! Backends disagree on field names: a browser agent may report
//! `{"type":"step","purpose":"..."}` and `{"liveUrl":"..."}`, a hosted API
//! `{"event":"completed","output":{...}}`, and a CLI agent stream-json
//! `{"type":"result","is_error":false,"result":"..."}`. Every line is reduced
//! to the four canonical [`BackendEvent`] kinds here; nothing downstream
//! looks at raw backend JSON.

use serde_json::{Map, Value};

use crate::repair;

const KIND_KEYS: &[&str] = &["type", "event", "kind", "status"];
const MESSAGE_KEYS: &[&str] = &["message", "step", "description", "purpose", "text", "log"];
const HANDLE_KEYS: &[&str] = &[
    "liveUrl",
    "live_url",
    "streamingUrl",
    "streaming_url",
    "debugUrl",
    "debug_url",
    "live_view_url",
    "liveViewUrl",
];
const RESULT_KEYS: &[&str] = &["result", "output", "resultJson", "extracted", "data"];

const PROGRESS_KINDS: &[&str] = &["step", "progress", "log", "status", "thinking", "running"];
const COMPLETE_KINDS: &[&str] = &["complete", "completed", "done", "success", "finished", "succeeded"];
const FAILURE_KINDS: &[&str] = &["error", "failed", "failure", "errored"];

/// Canonical event decoded from one backend line.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Human-readable step or progress description.
    Progress(String),
    /// Live-view handle URL.
    StreamingHandle(String),
    /// Terminal success with result payload.
    Completed(Value),
    /// Terminal failure with message.
    Failed(String),
}

/// Normalize one decoded line.
///
/// Returns an empty list for lines that carry no event (blank lines, SSE
/// comments and field lines other than `data:`, `[DONE]`, unrecognized JSON)
/// and an error for payloads that are not valid JSON.
pub fn normalize_line(line: &str) -> Result<Vec<BackendEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return Ok(Vec::new());
    }

    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if is_sse_field(trimmed) => return Ok(Vec::new()),
        None => trimmed,
    };
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(payload)?;
    Ok(normalize_value(&value))
}

/// Normalize one already-parsed JSON value.
pub fn normalize_value(value: &Value) -> Vec<BackendEvent> {
    let Some(obj) = value.as_object() else {
        return Vec::new();
    };
    let kind = first_str(obj, KIND_KEYS).map(str::to_ascii_lowercase);
    let mut events = Vec::new();

    match kind.as_deref() {
        // CLI stream-json: text blocks of assistant turns are progress.
        Some("assistant") => {
            let text = assistant_text(obj);
            if !text.is_empty() {
                events.push(BackendEvent::Progress(text));
            }
            return events;
        }
        // CLI stream-json terminal message.
        Some("result") => {
            let is_error = obj.get("is_error").or_else(|| obj.get("isError"));
            if is_error.and_then(Value::as_bool).unwrap_or(false) {
                events.push(BackendEvent::Failed(failure_message(obj)));
            } else {
                events.push(BackendEvent::Completed(result_payload(obj)));
            }
            return events;
        }
        _ => {}
    }

    let nested = obj.get("data").and_then(Value::as_object);
    let message = first_str(obj, MESSAGE_KEYS).or_else(|| nested.and_then(|d| first_str(d, MESSAGE_KEYS)));
    let handle = first_str(obj, HANDLE_KEYS).or_else(|| nested.and_then(|d| first_str(d, HANDLE_KEYS)));

    let terminal_kind = kind.as_deref().is_some_and(|k| COMPLETE_KINDS.contains(&k));
    let has_error = obj.get("error").is_some_and(|e| !e.is_null());
    // A terminal event may still report failure through `status` or `error`.
    let failed_status = obj
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| FAILURE_KINDS.contains(&s.to_ascii_lowercase().as_str()));

    let is_failure = kind.as_deref().is_some_and(|k| FAILURE_KINDS.contains(&k))
        || (kind.is_none() && has_error)
        || (terminal_kind && (failed_status || has_error))
        || obj.get("success").and_then(Value::as_bool) == Some(false);
    let is_complete = !is_failure
        && (terminal_kind || obj.get("success").and_then(Value::as_bool) == Some(true));

    if is_failure {
        events.push(BackendEvent::Failed(failure_message(obj)));
        return events;
    }

    if !is_complete {
        if let Some(message) = message {
            events.push(BackendEvent::Progress(message.to_string()));
        } else if let Some(k) = kind.as_deref().filter(|k| PROGRESS_KINDS.contains(k)) {
            events.push(BackendEvent::Progress(k.to_string()));
        }
    }
    if let Some(url) = handle {
        events.push(BackendEvent::StreamingHandle(url.to_string()));
    }
    if is_complete {
        events.push(BackendEvent::Completed(result_payload(obj)));
    }
    events
}

fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn assistant_text(obj: &Map<String, Value>) -> String {
    obj.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn failure_message(obj: &Map<String, Value>) -> String {
    let from_error = obj.get("error").and_then(|e| match e {
        Value::String(s) => Some(s.clone()),
        Value::Object(inner) => first_str(inner, &["message", "detail", "type"]).map(str::to_string),
        _ => None,
    });
    from_error
        .or_else(|| first_str(obj, &["message", "reason", "detail"]).map(str::to_string))
        .or_else(|| obj.get("result").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "backend reported failure".to_string())
}

/// Result payload of a terminal success. String payloads that look like
/// structured output go through the tiered repair parser.
fn result_payload(obj: &Map<String, Value>) -> Value {
    let payload = RESULT_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or(Value::Null);

    match payload {
        Value::String(ref text) if looks_structured(text) => {
            repair::parse_structured(text).unwrap_or(payload)
        }
        other => other,
    }
}

fn looks_structured(text: &str) -> bool {
    let t = text.trim_start();
    t.starts_with('{') || t.starts_with('[') || t.starts_with("```")
}
