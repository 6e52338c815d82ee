use financial_reasoning_engine::{
    tools::catalog::{register_http_tools, FinancialApiClient},
    EngineConfig, GeminiClient, GeminiConfig, InMemoryProfileStore, LanguageModel,
    ReasoningEngine, ResultCache, ScriptedModel, StreamEvent, ToolRegistry, TurnRequest,
};
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env()?;
    info!(
        primary = %config.primary_model,
        fast = %config.fast_model,
        max_iterations = config.max_iterations,
        "Financial assistant starting"
    );

    // Model backend
    let model: Arc<dyn LanguageModel> = match GeminiConfig::from_env() {
        Some(gemini) => Arc::new(GeminiClient::new(gemini)?),
        None => {
            warn!("GEMINI_API_KEY not set, answering with an offline scripted model");
            Arc::new(ScriptedModel::new(Vec::new()).with_fallback(
                "I'm running offline right now, so I can't look up live market data. \
                 Set GEMINI_API_KEY to enable full answers.",
            ))
        }
    };

    // Tools
    let mut tools = ToolRegistry::new();
    match FinancialApiClient::from_env() {
        Some(api) => {
            register_http_tools(&mut tools, &api)?;
            info!(base_url = %api.base_url(), tools = tools.len(), "Financial tools registered");
        }
        None => warn!("FINANCIAL_API_BASE_URL not set, running without tools"),
    }

    let cache = Arc::new(ResultCache::new(config.cache_ttl, config.cache_capacity));
    let engine = ReasoningEngine::new(
        model,
        Arc::new(tools),
        cache,
        Arc::new(InMemoryProfileStore::new()),
        config,
    );

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let query = if query.trim().is_empty() {
        "What is the current price of AAPL?".to_string()
    } else {
        query
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let request = TurnRequest::new(Uuid::new_v4(), query);
    let mut stream = match engine.answer_streaming_with_cancel(&request, &cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Fragment(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::Done => break,
            StreamEvent::Error(message) => {
                eprintln!("\nAnswer interrupted: {}", message);
                break;
            }
        }
    }
    writeln!(stdout)?;

    Ok(())
}
