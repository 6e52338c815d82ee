use async_trait::async_trait;
use financial_reasoning_engine::{
    tools::handler_fn, EngineConfig, EngineError, InMemoryProfileStore, LanguageModel, ParamType,
    ReasoningEngine, ResultCache, Route, ScriptedModel, ScriptedReply, StreamEvent,
    TokenProducer, ToolArguments, ToolRegistry, ToolSchema, TurnRequest,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const AAPL_CALL: &str = r#"{"tool": "get_stock_price", "arguments": {"symbol": "AAPL"}}"#;

fn price_registry(calls: Arc<AtomicUsize>, delay: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            ToolSchema::new("get_stock_price", "Latest stock quote for a ticker")
                .param("symbol", ParamType::String, true, "Ticker symbol, e.g. AAPL"),
            handler_fn(move |args: ToolArguments| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    Ok(json!({
                        "symbol": args.str("symbol").unwrap_or_default(),
                        "price": 189.2,
                        "currency": "USD"
                    }))
                }
            }),
        )
        .unwrap();
    registry
}

fn engine(
    model: Arc<dyn LanguageModel>,
    registry: ToolRegistry,
    config: EngineConfig,
) -> ReasoningEngine {
    let cache = Arc::new(ResultCache::new(config.cache_ttl, config.cache_capacity));
    ReasoningEngine::new(
        model,
        Arc::new(registry),
        cache,
        Arc::new(InMemoryProfileStore::new()),
        config,
    )
}

#[tokio::test]
async fn price_question_runs_one_tool_and_synthesizes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(ScriptedModel::from_texts([
        AAPL_CALL,
        "AAPL is at $189.20.",
        "Apple (AAPL) is currently trading at $189.20.",
    ]));
    let engine = engine(
        model.clone(),
        price_registry(calls.clone(), Duration::ZERO),
        EngineConfig::default(),
    );

    let outcome = engine
        .answer(&TurnRequest::new(Uuid::new_v4(), "What is the price of AAPL?"))
        .await
        .unwrap();

    assert_eq!(outcome.route, Route::Agentic);
    assert_eq!(outcome.answer, "Apple (AAPL) is currently trading at $189.20.");
    assert_eq!(outcome.iterations, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let prompts = model.calls();
    assert_eq!(prompts.len(), 3);
    let synthesis = &prompts[2].prompt;
    assert!(synthesis.contains("189.2"));
    assert!(synthesis.contains("Do not mention tools"));
}

#[tokio::test]
async fn identical_call_in_one_turn_reaches_the_handler_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(ScriptedModel::from_texts([
        AAPL_CALL,
        // Same call with the keys in a different order.
        r#"{"arguments": {"symbol": "AAPL"}, "tool": "get_stock_price"}"#,
        "Apple is at $189.20.",
        "Apple trades at $189.20.",
    ]));
    let engine = engine(
        model.clone(),
        price_registry(calls.clone(), Duration::ZERO),
        EngineConfig::default(),
    );

    let outcome = engine
        .answer(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.iterations, 2);
    assert!(model.calls()[2].prompt.contains("You already called"));
}

#[tokio::test]
async fn loop_stops_at_the_iteration_budget() {
    let model = Arc::new(ScriptedModel::new(Vec::new()).with_fallback("{ not json"));
    let config = EngineConfig {
        max_iterations: 4,
        ..EngineConfig::default()
    };
    let engine = engine(
        model.clone(),
        price_registry(Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        config,
    );

    let outcome = engine
        .answer(&TurnRequest::new(Uuid::new_v4(), "analyze my portfolio"))
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 4);
    // Four decisions plus one synthesis.
    assert_eq!(model.call_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn cached_result_is_reused_until_it_expires() {
    let calls = Arc::new(AtomicUsize::new(0));
    let turn = [AAPL_CALL, "AAPL is $189.20.", "Apple is at $189.20."];
    let model = Arc::new(ScriptedModel::from_texts(
        turn.iter().chain(turn.iter()).chain(turn.iter()).copied(),
    ));
    let config = EngineConfig {
        cache_ttl: Duration::from_secs(60),
        ..EngineConfig::default()
    };
    let engine = engine(model, price_registry(calls.clone(), Duration::ZERO), config);
    let user = Uuid::new_v4();

    engine.answer(&TurnRequest::new(user, "price of AAPL")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    let outcome = engine.answer(&TurnRequest::new(user, "price of AAPL")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.observations, 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    engine.answer(&TurnRequest::new(user, "price of AAPL")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backend_failure_fails_the_turn() {
    let model = Arc::new(ScriptedModel::new([
        ScriptedReply::text(AAPL_CALL),
        ScriptedReply::Fail("quota exceeded".into()),
    ]));
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        model,
        price_registry(calls.clone(), Duration::ZERO),
        EngineConfig::default(),
    );

    let err = engine
        .answer(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::FatalBackend(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_a_tool_call_ends_the_turn() {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(ScriptedModel::from_texts([AAPL_CALL]));
    let engine = engine(
        model.clone(),
        price_registry(calls.clone(), Duration::from_secs(10)),
        EngineConfig::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = engine
        .answer_with_cancel(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(model.call_count(), 1);
}

/// Streams forever and records whether it was told to stop.
struct EndlessModel {
    stopped: Arc<AtomicBool>,
}

struct EndlessProducer {
    stopped: Arc<AtomicBool>,
}

impl TokenProducer for EndlessProducer {
    fn next_token(&mut self) -> Option<financial_reasoning_engine::Result<String>> {
        std::thread::sleep(Duration::from_millis(1));
        Some(Ok("tick ".to_string()))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for EndlessModel {
    async fn complete(&self, _prompt: &str, _model_id: &str) -> financial_reasoning_engine::Result<String> {
        Ok("unused".to_string())
    }

    fn stream(
        &self,
        _prompt: &str,
        _model_id: &str,
    ) -> financial_reasoning_engine::Result<Box<dyn TokenProducer>> {
        Ok(Box::new(EndlessProducer {
            stopped: self.stopped.clone(),
        }))
    }
}

#[tokio::test]
async fn dropping_the_stream_stops_the_producer() {
    let stopped = Arc::new(AtomicBool::new(false));
    let model = Arc::new(EndlessModel {
        stopped: stopped.clone(),
    });
    let engine = engine(model, ToolRegistry::new(), EngineConfig::default());

    let mut stream = engine
        .answer_streaming(&TurnRequest::new(Uuid::new_v4(), "hello"))
        .await
        .unwrap();

    let first = stream.next().await;
    assert_eq!(first, Some(StreamEvent::Fragment("tick ".to_string())));
    drop(stream);

    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "producer was never stopped");
}

/// Answers decisions immediately but never produces a streamed token until released.
struct StalledStreamModel {
    released: Arc<AtomicBool>,
}

struct StalledProducer {
    released: Arc<AtomicBool>,
}

impl TokenProducer for StalledProducer {
    fn next_token(&mut self) -> Option<financial_reasoning_engine::Result<String>> {
        let started = std::time::Instant::now();
        while !self.released.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

#[async_trait]
impl LanguageModel for StalledStreamModel {
    async fn complete(&self, _prompt: &str, _model_id: &str) -> financial_reasoning_engine::Result<String> {
        Ok("Apple is trading near $189.".to_string())
    }

    fn stream(
        &self,
        _prompt: &str,
        _model_id: &str,
    ) -> financial_reasoning_engine::Result<Box<dyn TokenProducer>> {
        Ok(Box::new(StalledProducer {
            released: self.released.clone(),
        }))
    }
}

#[tokio::test]
async fn stalled_streamed_answer_fails_after_the_model_timeout() {
    let released = Arc::new(AtomicBool::new(false));
    let model = Arc::new(StalledStreamModel {
        released: released.clone(),
    });
    let config = EngineConfig {
        model_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let engine = engine(model, ToolRegistry::new(), config);

    let stream = engine
        .answer_streaming(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), stream.collect_text())
        .await
        .expect("streamed answer waited past the model timeout");
    released.store(true, Ordering::SeqCst);

    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::StreamingProducer(m) if m.contains("did not respond")));
}

#[tokio::test]
async fn broken_streamed_answer_ends_with_an_error_marker() {
    let model = Arc::new(ScriptedModel::new([
        ScriptedReply::text("Apple is trading near $189."),
        ScriptedReply::BrokenStream {
            partial: "Apple (AAPL) is trading".into(),
            error: "connection reset by peer".into(),
        },
        ScriptedReply::text("Apple is trading near $189."),
        ScriptedReply::BrokenStream {
            partial: "Apple (AAPL) is trading".into(),
            error: "connection reset by peer".into(),
        },
    ]));
    let engine = engine(
        model,
        price_registry(Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        EngineConfig::default(),
    );

    let stream = engine
        .answer_streaming(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"))
        .await
        .unwrap();
    assert!(stream.turn_id().is_some());

    let events: Vec<StreamEvent> = stream.collect().await;
    assert!(matches!(events.first(), Some(StreamEvent::Fragment(_))));
    assert!(matches!(events.last(), Some(StreamEvent::Error(m)) if m.contains("connection reset")));
    assert!(!events.contains(&StreamEvent::Done));

    let err = engine
        .answer_streaming(&TurnRequest::new(Uuid::new_v4(), "price of AAPL"))
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StreamingProducer(m) if m.contains("connection reset")));
}
