//! Gemini API backend
//!
//! Completions go through a long-lived async `reqwest::Client` for
//! connection pooling. Streaming uses `streamGenerateContent` over SSE,
//! read by a blocking client that is created inside the producer thread.

use super::LanguageModel;
use crate::config::GeminiConfig;
use crate::error::EngineError;
use crate::stream::TokenProducer;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tracing::{debug, error, info};

/// Bounds on the blocking streaming connection. The bridge's idle timeout
/// ends the stream for the consumer; these release the producer thread.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_MAX_DURATION: Duration = Duration::from_secs(300);

const SYSTEM_PROMPT: &str = "You are a professional financial assistant. Be accurate, \
structured and concise, and emphasize risk awareness.";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, model_id: &str, method: &str) -> String {
        format!(
            "{}/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model_id,
            method
        )
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn complete(&self, prompt: &str, model_id: &str) -> Result<String> {
        let url = self.endpoint(model_id, "generateContent");
        let request = GeminiRequest::new(prompt);

        info!(model = %model_id, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                EngineError::FatalBackend(format!("Gemini API unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(EngineError::FatalBackend(format!(
                "Gemini API returned {}",
                status
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            EngineError::FatalBackend(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response.text();
        if answer.trim().is_empty() {
            return Err(EngineError::FatalBackend(
                "Empty response from Gemini".to_string(),
            ));
        }

        debug!(
            model = %model_id,
            finish_reason = gemini_response.finish_reason().unwrap_or("unknown"),
            chars = answer.len(),
            "Gemini response received"
        );

        Ok(answer)
    }

    fn stream(&self, prompt: &str, model_id: &str) -> Result<Box<dyn TokenProducer>> {
        let body = serde_json::to_value(GeminiRequest::new(prompt))?;

        Ok(Box::new(GeminiStreamProducer {
            url: self.endpoint(model_id, "streamGenerateContent"),
            api_key: self.config.api_key.clone(),
            body,
            reader: None,
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

/// Blocking SSE reader; connects on the first `next_token` call.
struct GeminiStreamProducer {
    url: String,
    api_key: String,
    body: serde_json::Value,
    reader: Option<BufReader<reqwest::blocking::Response>>,
    pending: VecDeque<String>,
    done: bool,
}

impl GeminiStreamProducer {
    fn connect(&self) -> Result<BufReader<reqwest::blocking::Response>> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .timeout(STREAM_MAX_DURATION)
            .build()
            .map_err(|e| EngineError::StreamingProducer(e.to_string()))?;

        let response = client
            .post(&self.url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&self.body)
            .send()
            .map_err(|e| EngineError::StreamingProducer(format!("Gemini stream unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::StreamingProducer(format!(
                "Gemini stream returned {}",
                response.status()
            )));
        }

        Ok(BufReader::new(response))
    }
}

impl TokenProducer for GeminiStreamProducer {
    fn next_token(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }
            if self.done {
                return None;
            }

            if self.reader.is_none() {
                match self.connect() {
                    Ok(reader) => self.reader = Some(reader),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            let reader = self.reader.as_mut()?;
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    self.reader = None;
                }
                Ok(_) => match parse_sse_line(&line) {
                    Ok(texts) => self.pending.extend(texts),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(EngineError::StreamingProducer(format!(
                        "Gemini stream interrupted: {}",
                        e
                    ))));
                }
            }
        }
    }

    fn stop(&mut self) {
        self.done = true;
        self.pending.clear();
        // Dropping the reader closes the connection.
        self.reader = None;
    }
}

/// Text carried by one SSE line; non-data lines yield nothing.
fn parse_sse_line(line: &str) -> Result<Vec<String>> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(Vec::new());
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(Vec::new());
    }

    let chunk: GeminiStreamChunk = serde_json::from_str(payload)
        .map_err(|e| EngineError::StreamingProducer(format!("bad stream chunk: {}", e)))?;

    if let Some(err) = chunk.error {
        return Err(EngineError::StreamingProducer(err.message));
    }

    Ok(chunk
        .candidates
        .iter()
        .take(1)
        .flat_map(|c| c.content.parts.iter())
        .map(|p| p.text.clone())
        .filter(|t| !t.is_empty())
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

impl GeminiRequest {
    fn new(prompt: &str) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates.first()?.finish_reason.as_deref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(GeminiConfig {
            api_key: "test-key".into(),
            base_url: "https://example.test/v1beta/models/".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let json = serde_json::to_string(&GeminiRequest::new("What is RSI?")).unwrap();
        assert!(json.contains("What is RSI?"));
        assert!(json.contains("generationConfig"));
        assert!(json.contains("maxOutputTokens"));
        assert!(json.contains("systemInstruction"));
    }

    #[test]
    fn test_endpoint_uses_model_id() {
        assert_eq!(
            client().endpoint("gemini-2.0-flash", "generateContent"),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_response_text_joins_parts() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Apple "},{"text":"is up."}],"role":"model"},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "Apple is up.");
        assert_eq!(response.finish_reason(), Some("STOP"));
    }

    #[test]
    fn test_parse_sse_lines() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), vec!["Hello"]);
        assert!(parse_sse_line(": keep-alive").unwrap().is_empty());
        assert!(parse_sse_line("data: [DONE]").unwrap().is_empty());
        assert!(parse_sse_line("\n").unwrap().is_empty());

        let err = parse_sse_line(r#"data: {"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert!(matches!(err, EngineError::StreamingProducer(m) if m.contains("quota")));
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_stream_producer_is_lazy() {
        // Opening the producer performs no I/O.
        let producer = client().stream("hi", "gemini-2.0-flash");
        assert!(producer.is_ok());
    }
}
