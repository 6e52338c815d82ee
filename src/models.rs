//! Core data models for the reasoning engine

use crate::error::ToolError;
use crate::history::ConversationMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

//
// ================= Routing =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Low-complexity conversational query, answered in one shot.
    Fast,
    /// Anything else: full decide/act loop.
    Agentic,
}

//
// ================= Tool Schema =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
}

/// Statically declared tool contract. Registered once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Builder-style parameter declaration, in prompt order.
    pub fn param(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        required: bool,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(ToolParameter {
            name: name.into(),
            param_type,
            required,
            description: description.into(),
        });
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ToolParameter> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// Wire shape serialized into prompts:
    /// `{name, description, parameters: {property -> {type, description, required}}}`
    pub fn to_prompt_json(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({
                    "type": p.param_type,
                    "description": p.description,
                    "required": p.required,
                }),
            );
        }

        json!({
            "name": self.name,
            "description": self.description,
            "parameters": properties,
        })
    }
}

//
// ================= Tool Calls =================
//

/// A tool call proposed by the model, arguments not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub tool: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

/// Canonical (tool, arguments) key. Argument order and numeric
/// representation never affect equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCallSignature {
    tool: String,
    canonical_args: String,
}

impl ToolCallSignature {
    pub fn new(tool: &str, arguments: &Map<String, Value>) -> Self {
        let mut keys: Vec<&String> = arguments.keys().collect();
        keys.sort();

        let canonical_args = keys
            .into_iter()
            .map(|k| format!("{}={}", canonical_key(k), canonical_value(&arguments[k.as_str()])))
            .collect::<Vec<_>>()
            .join(",");

        Self {
            tool: tool.to_string(),
            canonical_args,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn canonical_args(&self) -> &str {
        &self.canonical_args
    }

    /// Short hex digest for log correlation.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.canonical_args.as_bytes());
        hex::encode(&hasher.finalize()[..6])
    }
}

impl fmt::Display for ToolCallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tool, self.canonical_args)
    }
}

/// Identifier-like keys stay bare; anything else is JSON-quoted so
/// separators inside a key cannot alias another argument set.
fn canonical_key(key: &str) -> String {
    let bare = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if bare {
        key.to_string()
    } else {
        Value::String(key.to_string()).to_string()
    }
}

/// Type-stable rendering: object keys sorted, integral floats collapse to integers.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            }
        }
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(canonical_value).collect::<Vec<_>>().join(",")
        ),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            format!(
                "{{{}}}",
                keys.into_iter()
                    .map(|k| format!("{}:{}", canonical_key(k), canonical_value(&map[k.as_str()])))
                    .collect::<Vec<_>>()
                    .join(",")
            )
        }
    }
}

//
// ================= Tool Results =================
//

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub signature: ToolCallSignature,
    pub outcome: std::result::Result<Value, ToolError>,
    pub completed_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn success(signature: ToolCallSignature, value: Value) -> Self {
        Self {
            signature,
            outcome: Ok(value),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(signature: ToolCallSignature, error: ToolError) -> Self {
        Self {
            signature,
            outcome: Err(error),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A successful tool output accumulated during a turn.
#[derive(Debug, Clone)]
pub struct ToolObservation {
    pub signature: ToolCallSignature,
    pub output: Value,
    pub from_cache: bool,
}

impl ToolObservation {
    /// Output as prompt text: strings verbatim, everything else as JSON.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

//
// ================= User Profile =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradingExperience {
    Beginner,
    Intermediate,
    Advanced,
    Professional,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskAppetite {
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentGoal {
    ShortTermGains,
    LongTermGrowth,
    IncomeGeneration,
    CapitalPreservation,
    Speculation,
}

/// Read-only profile snapshot, fetched once per turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfileSummary {
    pub username: Option<String>,
    pub experience: Option<TradingExperience>,
    pub risk_appetite: Option<RiskAppetite>,
    pub investment_goals: Option<InvestmentGoal>,
    #[serde(default)]
    pub preferred_assets: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl UserProfileSummary {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.experience.is_none()
            && self.risk_appetite.is_none()
            && self.investment_goals.is_none()
            && self.preferred_assets.is_empty()
            && self.interests.is_empty()
    }

    /// Prompt block; one line per known attribute.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No profile information available.".to_string();
        }

        let mut lines = Vec::new();
        if let Some(name) = &self.username {
            lines.push(format!("User: {}", name));
        }
        if let Some(experience) = self.experience {
            lines.push(format!("Trading Experience: {}", experience));
        }
        if let Some(risk) = self.risk_appetite {
            lines.push(format!("Risk Appetite: {}", risk));
        }
        if let Some(goal) = self.investment_goals {
            lines.push(format!("Investment Goals: {}", goal));
        }
        if !self.preferred_assets.is_empty() {
            lines.push(format!("Preferred Assets: {}", self.preferred_assets.join(", ")));
        }
        if !self.interests.is_empty() {
            lines.push(format!("Interests: {}", self.interests.join(", ")));
        }
        lines.join("\n")
    }
}

//
// ================= Turn I/O =================
//

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: Uuid,
    pub query: String,
    pub history: Vec<ConversationMessage>,
}

impl TurnRequest {
    pub fn new(user_id: Uuid, query: impl Into<String>) -> Self {
        Self {
            user_id,
            query: query.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub route: Route,
    pub answer: String,
    pub iterations: u32,
    pub observations: usize,
    pub reasoning_trace: Vec<String>,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Route::Fast => "fast",
            Route::Agentic => "agentic",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TradingExperience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradingExperience::Beginner => "Beginner",
            TradingExperience::Intermediate => "Intermediate",
            TradingExperience::Advanced => "Advanced",
            TradingExperience::Professional => "Professional",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RiskAppetite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskAppetite::Low => "Low",
            RiskAppetite::Medium => "Medium",
            RiskAppetite::High => "High",
            RiskAppetite::VeryHigh => "Very High",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for InvestmentGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvestmentGoal::ShortTermGains => "Short-term Gains",
            InvestmentGoal::LongTermGrowth => "Long-term Growth",
            InvestmentGoal::IncomeGeneration => "Income Generation",
            InvestmentGoal::CapitalPreservation => "Capital Preservation",
            InvestmentGoal::Speculation => "Speculation",
        };
        write!(f, "{}", s)
    }
}
