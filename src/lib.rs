//! Financial Reasoning Engine
//!
//! Answers a user's financial question in one turn:
//! - Routes small talk to a single fast-model call
//! - Runs a bounded decide/act loop over registered tools otherwise
//! - Caches tool results across turns and intercepts repeated calls
//! - Streams the synthesized answer to the caller
//!
//! TURN LIFECYCLE:
//! ROUTE → DECIDE → ACT → DECIDE … → SYNTHESIZE → DONE

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod extraction;
pub mod history;
pub mod llm;
pub mod models;
pub mod profile;
pub mod prompts;
pub mod router;
pub mod stream;
pub mod tools;

pub use error::{EngineError, Result, ToolError};

// Re-export common types
pub use agent::ReasoningEngine;
pub use cache::ResultCache;
pub use config::{EngineConfig, FailedCallPolicy, GeminiConfig};
pub use extraction::{Extraction, ResponseExtractor};
pub use history::{ConversationMessage, HistoryWindow, MessageRole};
pub use llm::{GeminiClient, LanguageModel, ScriptedModel, ScriptedReply};
pub use models::*;
pub use profile::{InMemoryProfileStore, ProfileStore};
pub use prompts::PromptAssembler;
pub use router::QueryRouter;
pub use stream::{StreamBridge, StreamEvent, TokenProducer, TokenStream};
pub use tools::{ToolArguments, ToolHandler, ToolRegistry};
