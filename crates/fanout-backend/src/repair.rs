//! Best-effort recovery of structured output from backend results.
//!
//! Model and agent backends often return JSON wrapped in markdown fences,
//! surrounded by prose, or cut off mid-object when a token budget runs out.
//! Parsing is tiered: strict parse, then extraction of the JSON-looking
//! region, then structural repair of truncation. Anything still invalid is
//! an explicit error.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Which tier produced the parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTier {
    /// Input was valid JSON as-is.
    Strict,
    /// JSON was found inside fences or surrounding text.
    Extracted,
    /// Truncated JSON was closed structurally.
    Repaired,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepairError {
    #[error("Structured output is empty")]
    Empty,

    #[error("No JSON object or array found in output")]
    NoStructure,

    #[error("Structured output could not be repaired: {0}")]
    Unrepairable(String),
}

/// Parse structured output, repairing it if needed.
pub fn parse_structured(text: &str) -> Result<Value, RepairError> {
    parse_structured_with_tier(text).map(|(value, _)| value)
}

/// Parse structured output and report which tier succeeded.
pub fn parse_structured_with_tier(text: &str) -> Result<(Value, RepairTier), RepairError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RepairError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok((value, RepairTier::Strict));
    }

    let region = extract_region(trimmed).ok_or(RepairError::NoStructure)?;
    if let Ok(value) = serde_json::from_str::<Value>(region) {
        return Ok((value, RepairTier::Extracted));
    }

    let repaired = close_structure(region)?;
    debug!(
        original_len = region.len(),
        repaired_len = repaired.len(),
        "Attempting structural repair"
    );
    serde_json::from_str::<Value>(&repaired)
        .map(|value| (value, RepairTier::Repaired))
        .map_err(|e| RepairError::Unrepairable(e.to_string()))
}

/// Find the JSON-looking region: fenced content first, otherwise from the
/// first opening bracket to the last matching closer (or to the end if the
/// output was truncated).
fn extract_region(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after_fence = &text[start + 3..];
        // Skip optional language identifier (e.g., "json")
        let content_start = after_fence.find('\n').map(|nl| nl + 1).unwrap_or(0);
        let content = &after_fence[content_start..];
        let content = match content.find("```") {
            Some(end) => &content[..end],
            None => content,
        };
        let content = content.trim();
        if content.starts_with('{') || content.starts_with('[') {
            return Some(content);
        }
    }

    let start = text.find(|c: char| c == '{' || c == '[')?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    match text.rfind(closer) {
        Some(end) if end > start => {
            let candidate = &text[start..=end];
            if serde_json::from_str::<Value>(candidate).is_ok() {
                Some(candidate)
            } else {
                Some(&text[start..])
            }
        }
        _ => Some(&text[start..]),
    }
}

/// Close unterminated strings, drop dangling commas, and append missing
/// closers.
fn close_structure(text: &str) -> Result<String, RepairError> {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return Err(RepairError::Unrepairable(format!(
                        "unbalanced '{}' in structured output",
                        c
                    )));
                }
                strip_dangling_comma(&mut out);
                out.push(c);
                if stack.is_empty() {
                    break;
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    strip_dangling_comma(&mut out);
    if out.ends_with(':') {
        out.push_str("null");
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Ok(out)
}

fn strip_dangling_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}
