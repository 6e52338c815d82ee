//! Recover a tool call or a final answer from raw model text.
//!
//! Models wrap JSON in prose or markdown fences often enough that a strict
//! parse is not sufficient. The scanner below finds the first complete
//! top-level `{...}` block while respecting string literals and escapes.

use crate::models::ToolCallRequest;
use serde_json::{Map, Value};

/// What the model meant by its response.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    ToolCall(ToolCallRequest),
    FinalAnswer(String),
    /// Looked structured but could not be used; `reason` is fed back to the model.
    ParseError { reason: String, raw: String },
}

pub struct ResponseExtractor;

impl ResponseExtractor {
    pub fn extract(raw_text: &str) -> Extraction {
        let trimmed = raw_text.trim();

        if trimmed.is_empty() {
            return Extraction::ParseError {
                reason: "the response was empty".to_string(),
                raw: raw_text.to_string(),
            };
        }

        let looks_structured = trimmed.starts_with('{') || trimmed.starts_with('[');

        // (a) whole text is one structured object
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return settle(interpret(value, trimmed), looks_structured, trimmed);
        }

        // (b) first balanced block embedded in prose / fences
        if let Some(block) = first_balanced_block(trimmed) {
            return match serde_json::from_str::<Value>(block) {
                Ok(value) => settle(interpret(value, trimmed), looks_structured, trimmed),
                Err(e) if looks_structured => Extraction::ParseError {
                    reason: format!("invalid JSON: {}", e),
                    raw: trimmed.to_string(),
                },
                // Prose with a brace-delimited aside is still prose.
                Err(_) => Extraction::FinalAnswer(trimmed.to_string()),
            };
        }

        if looks_structured {
            return Extraction::ParseError {
                reason: "the JSON object is incomplete (unbalanced brackets)".to_string(),
                raw: trimmed.to_string(),
            };
        }

        // (c) plain natural-language answer
        Extraction::FinalAnswer(trimmed.to_string())
    }
}

/// Only text that opens with a bracket can be malformed; anything else that
/// is not a tool call is the model's answer.
fn settle(extraction: Extraction, looks_structured: bool, trimmed: &str) -> Extraction {
    match extraction {
        Extraction::ParseError { .. } if !looks_structured => {
            Extraction::FinalAnswer(trimmed.to_string())
        }
        other => other,
    }
}

/// Map a parsed JSON value to a tool call, or explain why it is not one.
fn interpret(value: Value, raw: &str) -> Extraction {
    let Value::Object(map) = value else {
        return Extraction::ParseError {
            reason: "expected a single JSON object describing one tool call".to_string(),
            raw: raw.to_string(),
        };
    };

    let name = map
        .get("tool")
        .or_else(|| map.get("name"))
        .or_else(|| map.get("tool_name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();

    if name.is_empty() {
        // An explicit answer object is accepted as a final answer.
        if let Some(answer) = map
            .get("answer")
            .or_else(|| map.get("final_answer"))
            .and_then(Value::as_str)
        {
            return Extraction::FinalAnswer(answer.trim().to_string());
        }
        return Extraction::ParseError {
            reason: "the JSON object has no \"tool\" field".to_string(),
            raw: raw.to_string(),
        };
    }

    let arguments = match map
        .get("arguments")
        .or_else(|| map.get("parameters"))
        .or_else(|| map.get("input"))
    {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(args)) => args,
            _ => {
                return Extraction::ParseError {
                    reason: "\"arguments\" must be a JSON object".to_string(),
                    raw: raw.to_string(),
                }
            }
        },
        Some(_) => {
            return Extraction::ParseError {
                reason: "\"arguments\" must be a JSON object".to_string(),
                raw: raw.to_string(),
            }
        }
    };

    Extraction::ToolCall(ToolCallRequest::new(name, arguments))
}

/// Slice of the first complete top-level `{...}` block, if any.
fn first_balanced_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}
