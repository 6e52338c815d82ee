//! Reasoning engine - drives one turn through the decide/act loop
//!
//! INIT → DECIDE → (ACT | SYNTHESIZE) → DECIDE | DONE, FAILED on fatal errors.
//!
//! Recoverable problems (unparseable output, bad arguments, failing tools,
//! repeated calls) are turned into feedback for the next DECIDE step; the
//! model chooses how to correct course. Only backend failures, stream
//! failures and cancellation end a turn early.

mod state;

use crate::cache::ResultCache;
use crate::config::{EngineConfig, FailedCallPolicy};
use crate::error::{EngineError, ToolError};
use crate::extraction::{Extraction, ResponseExtractor};
use crate::history::HistoryWindow;
use crate::llm::LanguageModel;
use crate::models::{
    Route, ToolCallRequest, ToolCallSignature, ToolObservation, ToolSchema, TurnOutcome,
    TurnRequest, UserProfileSummary,
};
use crate::profile::ProfileStore;
use crate::prompts::{DecisionContext, PromptAssembler, SynthesisContext};
use crate::router::QueryRouter;
use crate::stream::{StreamBridge, TokenStream};
use crate::tools::ToolRegistry;
use crate::Result;
use chrono::{NaiveDate, Utc};
use state::{AgentState, TurnPhase};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Final prompt of a turn, ready to be sent once or streamed.
struct PreparedAnswer {
    route: Route,
    prompt: String,
    model_id: String,
    state: AgentState,
}

impl PreparedAnswer {
    fn into_outcome(self, answer: String) -> TurnOutcome {
        let iterations = self.state.iteration();
        let observations = self.state.outputs().len();
        TurnOutcome {
            turn_id: self.state.turn_id,
            route: self.route,
            answer,
            iterations,
            observations,
            reasoning_trace: self.state.into_trace(),
        }
    }
}

pub struct ReasoningEngine {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    cache: Arc<ResultCache>,
    profiles: Arc<dyn ProfileStore>,
    router: QueryRouter,
    prompts: PromptAssembler,
    bridge: StreamBridge,
    config: EngineConfig,
}

impl ReasoningEngine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        cache: Arc<ResultCache>,
        profiles: Arc<dyn ProfileStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            tools,
            cache,
            profiles,
            router: QueryRouter::new(),
            prompts: PromptAssembler::new(HistoryWindow::new(config.history_window)),
            bridge: StreamBridge::new(config.stream_buffer).with_idle_timeout(config.model_timeout),
            config,
        }
    }

    pub fn with_router(mut self, router: QueryRouter) -> Self {
        self.router = router;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Run a full turn and return the complete answer.
    pub async fn answer(&self, request: &TurnRequest) -> Result<TurnOutcome> {
        self.answer_with_cancel(request, &CancellationToken::new()).await
    }

    /// As `answer`; cancelling `cancel` aborts the turn at its next suspension point.
    pub async fn answer_with_cancel(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let prepared = self.prepare(request, cancel).await?;
        let turn_id = prepared.state.turn_id;

        let answer = self
            .call_model(&prepared.prompt, &prepared.model_id, cancel)
            .await
            .map_err(|e| turn_failed(turn_id, e))?;

        info!(%turn_id, route = %prepared.route, iterations = prepared.state.iteration(), "turn complete");
        Ok(prepared.into_outcome(answer.trim().to_string()))
    }

    /// Run routing and the loop, then stream the final answer.
    pub async fn answer_streaming(&self, request: &TurnRequest) -> Result<TokenStream> {
        self.answer_streaming_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// As `answer_streaming`; cancelling `cancel` also stops the stream producer.
    pub async fn answer_streaming_with_cancel(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        let prepared = self.prepare(request, cancel).await?;
        let turn_id = prepared.state.turn_id;

        let producer = self
            .model
            .stream(&prepared.prompt, &prepared.model_id)
            .map_err(|e| turn_failed(turn_id, into_backend_error(e)))?;

        info!(%turn_id, route = %prepared.route, iterations = prepared.state.iteration(), "streaming answer");
        Ok(self
            .bridge
            .spawn_with_token(producer, cancel.child_token())
            .for_turn(turn_id))
    }

    async fn prepare(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<PreparedAnswer> {
        let turn_id = Uuid::new_v4();
        let route = self.router.classify(&request.query, &request.history);

        info!(%turn_id, user_id = %request.user_id, %route, "turn started");

        if cancel.is_cancelled() {
            return Err(turn_failed(turn_id, EngineError::Cancelled));
        }

        match route {
            Route::Fast => {
                let mut state = AgentState::new(turn_id, self.config.max_iterations);
                state.trace("ROUTE: fast path");
                Ok(PreparedAnswer {
                    route,
                    prompt: self.prompts.build_fast_prompt(&request.query, &request.history),
                    model_id: self.config.fast_model.clone(),
                    state,
                })
            }
            Route::Agentic => self
                .run_loop(turn_id, request, cancel)
                .await
                .map_err(|e| turn_failed(turn_id, e)),
        }
    }

    async fn run_loop(
        &self,
        turn_id: Uuid,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<PreparedAnswer> {
        // === INIT ===
        let mut state = AgentState::new(turn_id, self.config.max_iterations);
        state.trace("ROUTE: agentic");

        let profile = self.load_profile(request, cancel).await?;
        let schemas = self.tools.schemas();
        let today = Utc::now().date_naive();

        let mut phase = TurnPhase::Decide;
        loop {
            phase = match phase {
                TurnPhase::Decide if state.budget_exhausted() => {
                    info!(
                        %turn_id,
                        iterations = state.iteration(),
                        observations = state.outputs().len(),
                        "iteration budget reached, synthesizing"
                    );
                    state.trace(format!(
                        "BUDGET: {} iterations used, synthesizing with {} result(s)",
                        state.iteration(),
                        state.outputs().len()
                    ));
                    TurnPhase::Synthesize { draft: None }
                }
                // === DECIDE ===
                TurnPhase::Decide => {
                    self.decide(&mut state, request, &profile, &schemas, today, cancel)
                        .await?
                }
                // === ACT ===
                TurnPhase::Act(call) => {
                    self.act(&mut state, call, cancel).await?;
                    TurnPhase::Decide
                }
                // === SYNTHESIZE ===
                TurnPhase::Synthesize { draft } => {
                    state.trace("SYNTHESIZE: composing final answer");
                    let prompt = self.prompts.build_synthesis_prompt(&SynthesisContext {
                        query: &request.query,
                        history: &request.history,
                        profile: &profile,
                        outputs: state.outputs(),
                        draft: draft.as_deref(),
                        today,
                    });

                    return Ok(PreparedAnswer {
                        route: Route::Agentic,
                        prompt,
                        model_id: self.config.primary_model.clone(),
                        state,
                    });
                }
            };
        }
    }

    async fn decide(
        &self,
        state: &mut AgentState,
        request: &TurnRequest,
        profile: &UserProfileSummary,
        schemas: &[ToolSchema],
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<TurnPhase> {
        let feedback = state.take_feedback();
        let prompt = self.prompts.build_decision_prompt(&DecisionContext {
            query: &request.query,
            history: &request.history,
            profile,
            schemas,
            outputs: state.outputs(),
            feedback: &feedback,
            today,
        });

        debug!(
            turn_id = %state.turn_id,
            iteration = state.iteration(),
            feedback = feedback.len(),
            "deciding next step"
        );

        let raw = self
            .call_model(&prompt, &self.config.primary_model, cancel)
            .await?;

        let next = match ResponseExtractor::extract(&raw) {
            Extraction::FinalAnswer(text) => {
                state.trace(format!("DECIDE: answer ready (iteration {})", state.iteration()));
                TurnPhase::Synthesize { draft: Some(text) }
            }
            Extraction::ToolCall(call) => {
                state.trace(format!("DECIDE: call {}", call.tool));
                TurnPhase::Act(call)
            }
            Extraction::ParseError { reason, .. } => {
                warn!(turn_id = %state.turn_id, %reason, "model output could not be parsed");
                state.trace(format!("DECIDE: unparseable output ({})", reason));
                state.push_feedback(parse_error_notice(&reason));
                state.advance();
                TurnPhase::Decide
            }
        };

        Ok(next)
    }

    async fn act(
        &self,
        state: &mut AgentState,
        call: ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let signature = self.tools.signature_for(&call);

        if state.has_executed(&signature) {
            info!(turn_id = %state.turn_id, sig = %signature, "repeated tool call intercepted");
            state.trace(format!("ACT: skipped repeated call {}", signature));
            state.replace_feedback(redundancy_notice(&signature));
            state.advance();
            return Ok(());
        }

        if let Some(cached) = self.cache.get(&signature) {
            if let Ok(output) = cached.outcome {
                debug!(turn_id = %state.turn_id, sig = %signature.fingerprint(), "cache hit");
                state.trace(format!("ACT: {} (cached)", signature));
                state.record_output(ToolObservation {
                    signature: signature.clone(),
                    output,
                    from_cache: true,
                });
                state.mark_executed(signature);
                state.advance();
                return Ok(());
            }
        }

        let result = until_cancelled(cancel, self.tools.invoke(&call, self.config.tool_timeout)).await?;

        match result.outcome.clone() {
            Ok(output) => {
                state.trace(format!("ACT: {} succeeded", signature));
                state.record_output(ToolObservation {
                    signature: signature.clone(),
                    output,
                    from_cache: false,
                });
                self.cache.put(signature.clone(), result);
                state.mark_executed(signature);
            }
            Err(e) => {
                state.trace(format!("ACT: {} failed ({})", signature, e));
                state.push_feedback(failure_notice(&signature, &e));
                if self.config.failed_call_policy == FailedCallPolicy::MarkOnAttempt {
                    state.mark_executed(signature);
                }
            }
        }

        state.advance();
        Ok(())
    }

    /// A store failure degrades to an empty profile.
    async fn load_profile(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<UserProfileSummary> {
        match until_cancelled(cancel, self.profiles.get_summary(request.user_id)).await? {
            Ok(profile) => Ok(profile),
            Err(e) => {
                warn!(user_id = %request.user_id, error = %e, "profile unavailable, continuing without it");
                Ok(UserProfileSummary::default())
            }
        }
    }

    async fn call_model(
        &self,
        prompt: &str,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let timeout = self.config.model_timeout;
        let call = tokio::time::timeout(timeout, self.model.complete(prompt, model_id));

        match until_cancelled(cancel, call).await? {
            Err(_) => Err(EngineError::FatalBackend(format!(
                "model '{}' did not respond within {} s",
                model_id,
                timeout.as_secs()
            ))),
            Ok(result) => result.map_err(into_backend_error),
        }
    }
}

/// Race `fut` against the turn's cancellation token.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        output = fut => Ok(output),
    }
}

fn into_backend_error(error: EngineError) -> EngineError {
    match error {
        EngineError::FatalBackend(_) | EngineError::Cancelled => error,
        other => EngineError::FatalBackend(other.to_string()),
    }
}

fn turn_failed(turn_id: Uuid, error: EngineError) -> EngineError {
    match &error {
        EngineError::Cancelled => info!(%turn_id, "turn cancelled"),
        e => error!(%turn_id, error = %e, "turn failed"),
    }
    error
}

fn parse_error_notice(reason: &str) -> String {
    format!(
        "Your previous reply could not be used: {}. Reply with exactly one JSON object \
         {{\"tool\": \"<name>\", \"arguments\": {{...}}}} or with a plain-text answer.",
        reason
    )
}

fn redundancy_notice(signature: &ToolCallSignature) -> String {
    format!(
        "You already called {} in this conversation turn and its result is listed under \
         DATA GATHERED SO FAR. Do not call it again; use that data, call a different tool, \
         or answer now.",
        signature
    )
}

fn failure_notice(signature: &ToolCallSignature, error: &ToolError) -> String {
    match error {
        ToolError::UnknownTool(name) => format!(
            "There is no tool named '{}'. Use only the tools listed under AVAILABLE TOOLS.",
            name
        ),
        ToolError::ArgumentValidation { field, reason } => format!(
            "The call {} was rejected: invalid argument '{}' ({}). Correct the arguments \
             and try again.",
            signature, field, reason
        ),
        other => format!(
            "The call {} failed: {}. Try different arguments, another tool, or answer \
             with what you have.",
            signature, other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedReply};
    use crate::models::{ParamType, RiskAppetite};
    use crate::profile::InMemoryProfileStore;
    use crate::tools::{handler_fn, ToolArguments};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        engine: ReasoningEngine,
        model: Arc<ScriptedModel>,
        price_calls: Arc<AtomicUsize>,
    }

    fn harness(replies: Vec<ScriptedReply>, config: EngineConfig) -> Harness {
        let price_calls = Arc::new(AtomicUsize::new(0));
        let counter = price_calls.clone();

        let mut tools = ToolRegistry::new();
        tools
            .register(
                ToolSchema::new("get_stock_price", "Latest stock quote")
                    .param("symbol", ParamType::String, true, "Ticker symbol"),
                handler_fn(move |args: ToolArguments| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match args.str("symbol") {
                            Some("ZZZZ") => Err(EngineError::ToolExecution {
                                tool: "get_stock_price".into(),
                                message: "no quote found for ZZZZ".into(),
                            }),
                            Some(symbol) => Ok(json!({"symbol": symbol, "price": 189.2})),
                            None => Ok(Value::Null),
                        }
                    }
                }),
            )
            .unwrap();

        let model = Arc::new(ScriptedModel::new(replies));
        let engine = ReasoningEngine::new(
            model.clone(),
            Arc::new(tools),
            Arc::new(ResultCache::new(config.cache_ttl, config.cache_capacity)),
            Arc::new(InMemoryProfileStore::new()),
            config,
        );

        Harness {
            engine,
            model,
            price_calls,
        }
    }

    fn text(s: &str) -> ScriptedReply {
        ScriptedReply::text(s)
    }

    fn request(query: &str) -> TurnRequest {
        TurnRequest::new(Uuid::new_v4(), query)
    }

    const PRICE_CALL: &str = r#"{"tool": "get_stock_price", "arguments": {"symbol": "AAPL"}}"#;

    #[tokio::test]
    async fn test_fast_path_uses_fast_model_once() {
        let h = harness(vec![text("Hi! How can I help with your investments?")], EngineConfig::default());
        let outcome = h.engine.answer(&request("hello")).await.unwrap();

        assert_eq!(outcome.route, Route::Fast);
        assert_eq!(outcome.iterations, 0);
        let calls = h.model.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model_id, EngineConfig::default().fast_model);
        assert_eq!(h.price_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_final_answer_on_first_iteration() {
        let h = harness(
            vec![
                text("A P/E ratio compares price with earnings per share."),
                text("The P/E ratio compares a company's share price with its earnings per share."),
            ],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("explain the P/E ratio")).await.unwrap();

        assert_eq!(outcome.iterations, 0);
        assert!(outcome.answer.starts_with("The P/E ratio"));
        // Draft is handed to synthesis.
        let synthesis = &h.model.calls()[1].prompt;
        assert!(synthesis.contains("DRAFT ANSWER"));
        assert!(synthesis.contains("compares price with earnings"));
    }

    #[tokio::test]
    async fn test_tool_result_reaches_synthesis() {
        let h = harness(
            vec![
                text(PRICE_CALL),
                text("Apple trades at $189.20."),
                text("Apple (AAPL) is trading at $189.20."),
            ],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("price of AAPL")).await.unwrap();

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.observations, 1);
        assert_eq!(h.price_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.cache().len(), 1);

        let calls = h.model.calls();
        assert!(calls[1].prompt.contains("189.2"));
        assert!(calls[2].prompt.contains("189.2"));
    }

    #[tokio::test]
    async fn test_repeated_call_is_intercepted() {
        let h = harness(
            vec![
                text(PRICE_CALL),
                text(r#"{"tool": "get_stock_price", "arguments": {"symbol": "AAPL", "extra": 1}}"#),
                text("AAPL is at $189.20."),
                text("Apple is at $189.20."),
            ],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("price of AAPL")).await.unwrap();

        assert_eq!(h.price_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.observations, 1);
        assert!(h.model.calls()[2].prompt.contains("You already called"));
    }

    #[tokio::test]
    async fn test_parse_error_becomes_feedback() {
        let h = harness(
            vec![
                text(r#"{"tool": "get_stock_price", "arguments": {"symbol": "AAPL""#),
                text(PRICE_CALL),
                text("done"),
                text("Apple is at $189.20."),
            ],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("price of AAPL")).await.unwrap();

        assert_eq!(outcome.iterations, 2);
        assert!(h.model.calls()[1].prompt.contains("could not be used"));
        // Feedback is consumed once.
        assert!(!h.model.calls()[2].prompt.contains("could not be used"));
    }

    #[tokio::test]
    async fn test_failed_call_is_fed_back_and_marked() {
        let bad = r#"{"tool": "get_stock_price", "arguments": {"symbol": "ZZZZ"}}"#;
        let h = harness(
            vec![text(bad), text(bad), text("I could not find that ticker."), text("Sorry.")],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("price of ZZZZ")).await.unwrap();

        assert_eq!(h.price_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.observations, 0);
        let calls = h.model.calls();
        assert!(calls[1].prompt.contains("no quote found for ZZZZ"));
        assert!(calls[2].prompt.contains("You already called"));
        assert!(h.engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_allow_retry_policy_reinvokes_failed_call() {
        let bad = r#"{"tool": "get_stock_price", "arguments": {"symbol": "ZZZZ"}}"#;
        let config = EngineConfig {
            failed_call_policy: FailedCallPolicy::AllowRetry,
            ..EngineConfig::default()
        };
        let h = harness(vec![text(bad), text(bad), text("No data."), text("Sorry.")], config);
        h.engine.answer(&request("price of ZZZZ")).await.unwrap();

        assert_eq!(h.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_feedback_not_failure() {
        let h = harness(
            vec![
                text(r#"{"tool": "get_weather", "arguments": {"city": "Paris"}}"#),
                text("I can only help with financial data."),
                text("I can only help with financial questions."),
            ],
            EngineConfig::default(),
        );
        let outcome = h.engine.answer(&request("weather in paris for my portfolio")).await.unwrap();

        assert_eq!(outcome.iterations, 1);
        assert!(h.model.calls()[1].prompt.contains("There is no tool named 'get_weather'"));
    }

    #[tokio::test]
    async fn test_iteration_budget_forces_synthesis() {
        let config = EngineConfig {
            max_iterations: 3,
            ..EngineConfig::default()
        };
        let replies = vec![
            text(r#"{"tool": "get_stock_price", "arguments": {"symbol": "AAPL"}}"#),
            text(r#"{"tool": "get_stock_price", "arguments": {"symbol": "MSFT"}}"#),
            text(r#"{"tool": "get_stock_price", "arguments": {"symbol": "NVDA"}}"#),
            text("Here is what I found for your stocks."),
        ];
        let h = harness(replies, config);
        let outcome = h.engine.answer(&request("price of AAPL MSFT NVDA and TSLA")).await.unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.observations, 3);
        assert_eq!(h.model.call_count(), 4);
        assert!(outcome.reasoning_trace.iter().any(|t| t.starts_with("BUDGET")));
    }

    #[tokio::test]
    async fn test_backend_failure_aborts_turn() {
        let h = harness(vec![ScriptedReply::Fail("503 from upstream".into())], EngineConfig::default());
        let err = h.engine.answer(&request("price of AAPL")).await.unwrap_err();

        assert!(matches!(err, EngineError::FatalBackend(_)));
        assert_eq!(h.model.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_timeout_is_fatal() {
        let config = EngineConfig {
            model_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let h = harness(
            vec![ScriptedReply::Delayed(Duration::from_secs(120), "late".into())],
            config,
        );
        let err = h.engine.answer(&request("price of AAPL")).await.unwrap_err();
        assert!(matches!(err, EngineError::FatalBackend(m) if m.contains("did not respond")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(vec![text(PRICE_CALL)], EngineConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .engine
            .answer_with_cancel(&request("price of AAPL"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(h.model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_profile_reaches_prompt() {
        let store = Arc::new(InMemoryProfileStore::new());
        let user_id = Uuid::new_v4();
        store
            .upsert(
                user_id,
                UserProfileSummary {
                    risk_appetite: Some(RiskAppetite::Low),
                    ..Default::default()
                },
            )
            .await;

        let model = Arc::new(ScriptedModel::from_texts(["Bonds may suit you.", "Consider bonds."]));
        let engine = ReasoningEngine::new(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(ResultCache::default()),
            store,
            EngineConfig::default(),
        );

        engine
            .answer(&TurnRequest::new(user_id, "should I invest in bonds?"))
            .await
            .unwrap();
        assert!(model.calls()[0].prompt.contains("Risk Appetite: Low"));
    }

    struct UnavailableProfiles;

    #[async_trait::async_trait]
    impl ProfileStore for UnavailableProfiles {
        async fn get_summary(&self, _user_id: Uuid) -> Result<UserProfileSummary> {
            Err(EngineError::ProfileStore("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_profile_failure_degrades_to_empty_profile() {
        let model = Arc::new(ScriptedModel::from_texts(["Diversify.", "Consider diversifying."]));
        let engine = ReasoningEngine::new(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(ResultCache::default()),
            Arc::new(UnavailableProfiles),
            EngineConfig::default(),
        );

        let outcome = engine
            .answer(&request("how should I invest 10k?"))
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Consider diversifying.");
        assert!(model.calls()[0].prompt.contains("No profile information available."));
    }

    #[tokio::test]
    async fn test_streaming_answer() {
        let h = harness(
            vec![
                text(PRICE_CALL),
                text("Apple trades at $189.20."),
                text("Apple (AAPL) is trading at $189.20 today."),
            ],
            EngineConfig::default(),
        );
        let stream = h.engine.answer_streaming(&request("price of AAPL")).await.unwrap();
        let answer = stream.collect_text().await.unwrap();

        assert_eq!(answer, "Apple (AAPL) is trading at $189.20 today.");
        assert!(h.model.calls()[2].streaming);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_streaming_failure_is_logged_with_turn_id() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = harness(
            vec![
                text("Apple trades at $189.20."),
                ScriptedReply::BrokenStream {
                    partial: "Apple trades".into(),
                    error: "socket closed".into(),
                },
            ],
            EngineConfig::default(),
        );
        let stream = h.engine.answer_streaming(&request("price of AAPL")).await.unwrap();
        let turn_id = stream.turn_id().unwrap();
        assert!(stream.collect_text().await.is_err());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("turn failed while streaming"))
            .expect("no failure log line");
        assert!(line.contains(&turn_id.to_string()));
        assert!(line.contains("socket closed"));
    }

    #[test]
    fn test_notices_name_the_call() {
        let mut args = serde_json::Map::new();
        args.insert("symbol".into(), json!("AAPL"));
        let sig = ToolCallSignature::new("get_stock_price", &args);

        assert!(redundancy_notice(&sig).contains("get_stock_price(symbol=\"AAPL\")"));
        let notice = failure_notice(
            &sig,
            &ToolError::ArgumentValidation {
                field: "symbol".into(),
                reason: "required parameter is missing".into(),
            },
        );
        assert!(notice.contains("'symbol'"));
    }
}
