use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use quill_core::conversation::{ConversationHistory, ConversationStore};
use quill_core::errors::{ConversationError, ModelError, TransportError};
use quill_core::ids::{RequestId, SessionId};
use quill_core::model::{ModelClient, ModelOptions};
use quill_core::tools::ToolOutcome;
use quill_core::transport::{ResponseMetadata, Transport};
use quill_core::turns::{Context, ContextError, ToolInvocation};

use crate::config::EngineConfig;
use crate::prompt;
use crate::protocol::{self, ParsedTurn, TurnClassifier, OBSERVATION_STOP};
use crate::registry::ToolRegistry;
use crate::relay::TokenRelay;
use crate::transport::TransportAdapter;
use crate::truncate::truncate_output;

pub const STEP_LIMIT_ANSWER: &str =
    "I was unable to complete this request within the allowed number of steps.";

/// Why a run stopped without an answer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AbortReason {
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("{0}")]
    Transport(TransportError),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AbortReason {
    /// Status sent when the run fails before any response was opened.
    pub fn status(&self) -> u16 {
        match self {
            Self::Model(ModelError::Timeout(_)) => 504,
            Self::Model(ModelError::Cancelled) | Self::Cancelled => 503,
            Self::Model(ModelError::Unavailable(_)) => 502,
            Self::ConnectionClosed | Self::Transport(_) | Self::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Model(e) => e.error_kind(),
            Self::ConnectionClosed => "connection_closed",
            Self::Transport(_) => "transport",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<TransportError> for AbortReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionClosed => Self::ConnectionClosed,
            other => Self::Transport(other),
        }
    }
}

impl From<ContextError> for AbortReason {
    fn from(e: ContextError) -> Self {
        Self::Internal(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub enum Outcome {
    /// `synthetic` is set when the step limit produced the answer.
    Answered { answer: String, synthetic: bool },
    Aborted(AbortReason),
}

impl Outcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered { .. })
    }
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub context: Context,
    /// Generations performed.
    pub steps: u32,
}

/// Drives one request from goal to final answer.
///
/// Start → Generating → (Parsing → ToolExecuting → Observing → Generating)*
/// → Finalizing → Done, with Aborted reachable from every non-terminal state.
pub struct AgentRunner {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    config: EngineConfig,
    options: ModelOptions,
}

impl AgentRunner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
        config: EngineConfig,
    ) -> Self {
        let mut options = config.model.clone();
        if !options.stop_sequences.iter().any(|s| s == OBSERVATION_STOP) {
            options.stop_sequences.push(OBSERVATION_STOP.to_string());
        }
        Self {
            model,
            tools,
            store,
            config,
            options,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Run `goal` for `session_id`, streaming the answer into `transport`.
    ///
    /// The transport is always closed exactly once before this returns.
    pub async fn run<T: Transport>(
        &self,
        goal: &str,
        session_id: &SessionId,
        transport: &mut TransportAdapter<T>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let request_id = RequestId::new();
        let span = info_span!(
            "run",
            session_id = %session_id,
            request_id = %request_id,
            model = %self.model.name(),
        );
        self.run_inner(request_id, goal, session_id, transport, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner<T: Transport>(
        &self,
        request_id: RequestId,
        goal: &str,
        session_id: &SessionId,
        transport: &mut TransportAdapter<T>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        info!(goal_len = goal.len(), "run started");

        let history_key = self.history_key(session_id).await;
        let history = self.load_history(&history_key).await;
        let mut context = Context::new(goal, history);

        let mut steps = 0;
        let mut relay = TokenRelay::new(transport, self.config.frame_format);
        let result = self.reason(&mut context, &mut relay, &mut steps, cancel).await;

        // Finalizing: make sure the caller saw a status line before closing.
        let result = match result {
            Ok(answer) => relay.ensure_open().await.map(|_| answer).map_err(AbortReason::from),
            Err(reason) => Err(reason),
        };
        drop(relay);

        let outcome = match result {
            Ok((answer, synthetic)) => {
                if let Err(e) = transport.close(true).await {
                    warn!(error = %e, "close failed");
                }
                info!(
                    steps,
                    synthetic,
                    frames = transport.frames_written(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run answered"
                );
                Outcome::Answered { answer, synthetic }
            }
            Err(reason) => {
                self.abort(transport, &reason).await;
                warn!(
                    steps,
                    reason = %reason,
                    kind = reason.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run aborted"
                );
                Outcome::Aborted(reason)
            }
        };

        self.save_history(&history_key, &context, &outcome).await;

        RunReport {
            request_id,
            outcome,
            context,
            steps,
        }
    }

    /// The generate/parse/execute/observe cycle. Returns the answer and
    /// whether it was synthesised after the step limit.
    async fn reason<T: Transport>(
        &self,
        context: &mut Context,
        relay: &mut TokenRelay<'_, T>,
        steps: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), AbortReason> {
        let definitions = self.tools.definitions();

        while *steps < self.config.step_limit {
            relay.check_connected()?;
            *steps += 1;
            let step = *steps;
            let prompt = prompt::build_prompt(context, &definitions);
            debug!(step, prompt_len = prompt.len(), "generating");

            let (parsed, released) = if self.options.streaming {
                self.generate_streaming(&prompt, relay, cancel).await?
            } else {
                (self.generate_complete(&prompt, cancel).await?, false)
            };

            if let Some(thought) = parsed.thought() {
                context.push_thought(thought)?;
            }

            match parsed {
                ParsedTurn::FinalAnswer { answer, marked, .. } => {
                    debug!(step, marked, released, "final answer");
                    if !released {
                        relay.relay_text(&answer).await?;
                    }
                    context.push_final_answer(answer.clone())?;
                    return Ok((answer, false));
                }
                ParsedTurn::ToolCall { invocation, .. } => {
                    let observation = self.execute_tool(step, &invocation);
                    context.push_tool_call(invocation)?;
                    context.push_observation(observation)?;
                }
            }
        }

        info!(step_limit = self.config.step_limit, "step limit reached");
        relay.relay_text(STEP_LIMIT_ANSWER).await?;
        context.push_final_answer(STEP_LIMIT_ANSWER)?;
        Ok((STEP_LIMIT_ANSWER.to_string(), true))
    }

    /// Stream one generation, relaying answer text as soon as the turn is
    /// known to be a final answer. Returns the parsed turn and whether any
    /// of it was relayed.
    async fn generate_streaming<T: Transport>(
        &self,
        prompt: &str,
        relay: &mut TokenRelay<'_, T>,
        cancel: &CancellationToken,
    ) -> Result<(ParsedTurn, bool), AbortReason> {
        let started = Instant::now();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AbortReason::Cancelled),
            stream = self.model.stream(prompt, &self.options) => stream?,
        };

        let mut classifier = TurnClassifier::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AbortReason::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let event = item?;
            relay.check_connected()?;
            if let Some(text) = classifier.push(&event.text) {
                relay.relay_text(&text).await?;
            }
            if event.is_final {
                break;
            }
        }
        drop(stream);

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            classification = ?classifier.state(),
            "generation finished"
        );
        let released = classifier.has_released();
        Ok((classifier.finish(), released))
    }

    async fn generate_complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<ParsedTurn, AbortReason> {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AbortReason::Cancelled),
            text = self.model.complete(prompt, &self.options) => text?,
        };
        Ok(protocol::parse_turn(&text))
    }

    fn execute_tool(&self, step: u32, invocation: &ToolInvocation) -> String {
        let started = Instant::now();
        let outcome = ToolOutcome::from(self.tools.invoke(&invocation.tool_name, &invocation.raw_arguments));
        info!(
            step,
            tool = %invocation.tool_name,
            success = outcome.is_success(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "tool executed"
        );
        truncate_output(&outcome.observation(), self.config.max_observation_bytes)
    }

    async fn abort<T: Transport>(&self, transport: &mut TransportAdapter<T>, reason: &AbortReason) {
        if !transport.is_open() && !transport.is_disconnected() {
            if let Err(e) = transport.open(ResponseMetadata::error(reason.status())).await {
                debug!(error = %e, "could not send error status");
            }
        }
        if let Err(e) = transport.close(false).await {
            debug!(error = %e, "close after abort failed");
        }
    }

    async fn history_key(&self, session_id: &SessionId) -> String {
        let index = match self.store.chat_index(session_id.as_str()).await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "chat index unavailable, using 0");
                0
            }
        };
        session_id.conversation_key(index)
    }

    async fn load_history(&self, key: &str) -> ConversationHistory {
        match self.store.get(key).await {
            Ok(history) => {
                debug!(entries = history.len(), "history loaded");
                history
            }
            Err(ConversationError::NotFound(_)) => ConversationHistory::new(),
            Err(e) => {
                warn!(error = %e, "history unavailable, starting empty");
                ConversationHistory::new()
            }
        }
    }

    async fn save_history(&self, key: &str, context: &Context, outcome: &Outcome) {
        let mut history = context.history().clone();
        history.push_user(context.goal());
        if let Outcome::Answered { answer, .. } = outcome {
            history.push_assistant(answer.as_str());
        }
        if let Err(e) = self.store.put(key, &history).await {
            warn!(error = %e, key, "failed to save history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use quill_core::transport::{FrameFormat, CONTENT_TYPE_EVENT_STREAM};
    use quill_core::turns::TurnKind;
    use quill_llm::{MockModelClient, MockResponse};
    use quill_store::MemoryConversationStore;

    use crate::tools::builtin_registry;
    use crate::transport::{CloseState, MemoryTransport};

    const TOOL_TURN: &str = "Thought: I need to compute this.\nAction: calculator\nAction Input: 2^8";
    const ANSWER_TURN: &str = "Thought: I now know the final answer.\nFinal Answer: The answer is 256.";

    struct Harness {
        model: Arc<MockModelClient>,
        store: Arc<MemoryConversationStore>,
        runner: AgentRunner,
    }

    fn harness(responses: Vec<MockResponse>, config: EngineConfig) -> Harness {
        let model = Arc::new(MockModelClient::new(responses));
        let store = Arc::new(MemoryConversationStore::new());
        let runner = AgentRunner::new(
            model.clone(),
            Arc::new(builtin_registry().unwrap()),
            store.clone(),
            config,
        );
        Harness { model, store, runner }
    }

    async fn run(h: &Harness, goal: &str, transport: MemoryTransport) -> (RunReport, TransportAdapter<MemoryTransport>) {
        let mut adapter = TransportAdapter::new(transport);
        let report = h
            .runner
            .run(goal, &SessionId::from_raw("user-1"), &mut adapter, &CancellationToken::new())
            .await;
        (report, adapter)
    }

    fn kinds(context: &Context) -> Vec<TurnKind> {
        context.turns().iter().map(|t| t.kind()).collect()
    }

    fn assert_turn_invariants(context: &Context) {
        let turns = context.turns();
        for pair in turns.windows(2) {
            assert!(pair[0].sequence() < pair[1].sequence());
            if pair[0].kind() == TurnKind::ToolCall {
                assert_eq!(pair[1].kind(), TurnKind::Observation);
            }
        }
        if let Some(last) = turns.last() {
            assert_ne!(last.kind(), TurnKind::ToolCall);
        }
    }

    #[tokio::test]
    async fn tool_call_then_answer_streams_only_the_answer() {
        let h = harness(
            vec![MockResponse::text(TOOL_TURN), MockResponse::text(ANSWER_TURN)],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let (report, adapter) = run(&h, "What is 2^8?", memory.clone()).await;

        assert!(matches!(
            &report.outcome,
            Outcome::Answered { answer, synthetic: false } if answer == "The answer is 256."
        ));
        assert_eq!(memory.body(), "The answer is 256.");
        assert_eq!(memory.metadata().len(), 1);
        assert_eq!(memory.metadata()[0].status, 200);
        assert_eq!(memory.closes(), 1);
        assert_eq!(adapter.close_state(), CloseState::Closed { answered: true });
        assert_eq!(report.steps, 2);
        assert_eq!(h.model.stream_calls(), 2);

        assert_eq!(
            kinds(&report.context),
            vec![
                TurnKind::Thought,
                TurnKind::ToolCall,
                TurnKind::Observation,
                TurnKind::Thought,
                TurnKind::FinalAnswer,
            ]
        );
        assert_eq!(report.context.turns()[2].text(), Some("256"));
        assert_turn_invariants(&report.context);

        let prompts = h.model.prompts();
        assert!(prompts[1].contains("Action Input: 2^8\nObservation: 256\n"));
    }

    #[tokio::test]
    async fn tool_call_text_never_reaches_the_connection() {
        let h = harness(
            vec![
                MockResponse::text(TOOL_TURN),
                MockResponse::text("Thought: again\nAction: calculator\nAction Input: 3*3"),
                MockResponse::text(ANSWER_TURN),
            ],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let (_, _) = run(&h, "q", memory.clone()).await;

        let body = memory.body();
        assert!(!body.contains("Action"));
        assert!(!body.contains("calculator"));
        assert!(!body.contains("Thought"));
        assert_eq!(body, "The answer is 256.");
    }

    #[tokio::test]
    async fn step_limit_produces_synthetic_answer() {
        let config = EngineConfig {
            step_limit: 2,
            ..Default::default()
        };
        let h = harness(
            vec![
                MockResponse::text(TOOL_TURN),
                MockResponse::text(TOOL_TURN),
                MockResponse::text(ANSWER_TURN),
            ],
            config,
        );
        let memory = MemoryTransport::new();
        let (report, adapter) = run(&h, "loop forever", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Answered { synthetic: true, .. }));
        assert_eq!(h.model.stream_calls(), 2);
        assert_eq!(h.model.remaining(), 1);
        assert_eq!(memory.body(), STEP_LIMIT_ANSWER);
        assert_eq!(report.context.final_answer(), Some(STEP_LIMIT_ANSWER));
        assert_eq!(report.context.count(TurnKind::ToolCall), 2);
        assert_eq!(report.context.count(TurnKind::Observation), 2);
        assert_eq!(adapter.inner_closes(), 1);
        assert_turn_invariants(&report.context);
    }

    #[tokio::test]
    async fn missing_action_input_becomes_error_observation() {
        let h = harness(
            vec![
                MockResponse::text("Thought: compute\nAction: calculator"),
                MockResponse::text(ANSWER_TURN),
            ],
            EngineConfig::default(),
        );
        let (report, _) = run(&h, "q", MemoryTransport::new()).await;

        let observation = report
            .context
            .turns()
            .iter()
            .find(|t| t.kind() == TurnKind::Observation)
            .and_then(|t| t.text())
            .unwrap()
            .to_string();
        assert!(observation.starts_with("Error: invalid arguments for `calculator`"), "{observation}");
        assert!(report.outcome.is_answered());
        assert!(h.model.prompts()[1].contains("Observation: Error:"));
    }

    #[tokio::test]
    async fn unknown_tool_and_failing_tool_are_observations() {
        let h = harness(
            vec![
                MockResponse::text("Action: search\nAction Input: weather"),
                MockResponse::text("Action: calculator\nAction Input: 1/0"),
                MockResponse::text(ANSWER_TURN),
            ],
            EngineConfig::default(),
        );
        let (report, _) = run(&h, "q", MemoryTransport::new()).await;

        let observations: Vec<&str> = report
            .context
            .turns()
            .iter()
            .filter(|t| t.kind() == TurnKind::Observation)
            .filter_map(|t| t.text())
            .collect();
        assert_eq!(observations[0], "Error: unknown tool `search`");
        assert!(observations[1].contains("division by zero"));
        assert!(report.outcome.is_answered());
    }

    #[tokio::test]
    async fn long_observations_are_truncated() {
        let config = EngineConfig {
            max_observation_bytes: 4,
            ..Default::default()
        };
        let h = harness(
            vec![
                MockResponse::text("Action: calculator\nAction Input: 123456789 * 10"),
                MockResponse::text(ANSWER_TURN),
            ],
            config,
        );
        let (report, _) = run(&h, "q", MemoryTransport::new()).await;
        let observation = report.context.turns()[1].text().unwrap();
        assert!(observation.starts_with("1234\n\n[truncated:"), "{observation}");
    }

    #[tokio::test]
    async fn model_error_before_output_sends_error_status() {
        let h = harness(
            vec![MockResponse::FailAfter(
                vec!["Thought: ".into(), "hmm".into()],
                ModelError::Unavailable("throttled".into()),
            )],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let (report, adapter) = run(&h, "q", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::Model(ModelError::Unavailable(_)))));
        assert_eq!(memory.metadata().len(), 1);
        assert_eq!(memory.metadata()[0].status, 502);
        assert!(memory.frames().is_empty());
        assert_eq!(memory.closes(), 1);
        assert_eq!(adapter.close_state(), CloseState::Closed { answered: false });
        assert!(report.context.final_answer().is_none());
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let h = harness(
            vec![MockResponse::Error(ModelError::Timeout(Duration::from_secs(120)))],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let (report, _) = run(&h, "q", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::Model(ModelError::Timeout(_)))));
        assert_eq!(memory.metadata()[0].status, 504);
        assert_eq!(memory.closes(), 1);
    }

    #[tokio::test]
    async fn model_error_mid_answer_keeps_relayed_prefix() {
        let h = harness(
            vec![MockResponse::FailAfter(
                vec!["Final Answer:".into(), " The".into(), " ans".into()],
                ModelError::Unavailable("connection reset".into()),
            )],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let (report, adapter) = run(&h, "q", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::Model(_))));
        assert_eq!(memory.body(), "The ans");
        assert_eq!(memory.metadata().len(), 1);
        assert_eq!(memory.metadata()[0].status, 200);
        assert_eq!(adapter.inner_closes(), 1);
        assert_eq!(report.context.count(TurnKind::FinalAnswer), 0);
    }

    #[tokio::test]
    async fn disconnect_stops_generation() {
        let h = harness(
            vec![
                MockResponse::Endless("Final Answer: more ".into()),
                MockResponse::text(ANSWER_TURN),
            ],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::disconnect_after(3);
        let (report, adapter) = run(&h, "q", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::ConnectionClosed)));
        assert_eq!(memory.frames().len(), 3);
        assert_eq!(h.model.stream_calls(), 1);
        assert_eq!(h.model.tokens_pulled(), 4);
        assert_eq!(h.model.streams_dropped(), 1);
        assert_eq!(memory.closes(), 1);
        assert_eq!(memory.metadata().len(), 1);
        assert_eq!(adapter.close_state(), CloseState::Closed { answered: false });
    }

    /// Reports the peer gone as soon as the model has been asked once.
    struct LeavesAfterFirstCall {
        memory: MemoryTransport,
        model: Arc<MockModelClient>,
    }

    #[async_trait]
    impl Transport for LeavesAfterFirstCall {
        async fn open(&mut self, metadata: ResponseMetadata) -> Result<(), TransportError> {
            self.memory.open(metadata).await
        }

        async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.memory.write(frame).await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.memory.close().await
        }

        fn is_closed(&self) -> bool {
            self.model.stream_calls() >= 1
        }
    }

    #[tokio::test]
    async fn disconnect_during_tool_turns_stops_generating() {
        let h = harness(
            vec![
                MockResponse::text(TOOL_TURN),
                MockResponse::text(TOOL_TURN),
                MockResponse::text(TOOL_TURN),
                MockResponse::text(ANSWER_TURN),
            ],
            EngineConfig::default(),
        );
        let memory = MemoryTransport::new();
        let mut adapter = TransportAdapter::new(LeavesAfterFirstCall {
            memory: memory.clone(),
            model: h.model.clone(),
        });
        let report = h
            .runner
            .run("q", &SessionId::from_raw("user-1"), &mut adapter, &CancellationToken::new())
            .await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::ConnectionClosed)));
        assert_eq!(h.model.stream_calls(), 1);
        assert_eq!(h.model.remaining(), 3);
        assert!(memory.metadata().is_empty());
        assert!(memory.frames().is_empty());
        assert_eq!(memory.closes(), 1);
        assert_eq!(adapter.close_state(), CloseState::Closed { answered: false });
    }

    #[tokio::test]
    async fn peer_gone_before_start_never_calls_model() {
        let h = harness(vec![MockResponse::text(ANSWER_TURN)], EngineConfig::default());
        let memory = MemoryTransport::new();
        memory.hang_up();
        let (report, _) = run(&h, "q", memory.clone()).await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::ConnectionClosed)));
        assert_eq!(h.model.stream_calls(), 0);
        assert!(memory.metadata().is_empty());
        assert_eq!(memory.closes(), 1);
    }

    #[tokio::test]
    async fn streamed_answer_matches_recorded_answer() {
        let h = harness(vec![MockResponse::tokens(&["Final Answer: 256", "\n"])], EngineConfig::default());
        let memory = MemoryTransport::new();
        let (report, _) = run(&h, "q", memory.clone()).await;

        assert_eq!(memory.body(), "256");
        assert_eq!(report.context.final_answer(), Some("256"));
        assert!(matches!(&report.outcome, Outcome::Answered { answer, .. } if answer == "256"));
        let saved = h.store.get("user-1#0").await.unwrap();
        assert_eq!(saved.entries[1].text, memory.body());
    }

    #[tokio::test]
    async fn cancellation_aborts_before_generation() {
        let h = harness(vec![MockResponse::text(ANSWER_TURN)], EngineConfig::default());
        let memory = MemoryTransport::new();
        let mut adapter = TransportAdapter::new(memory.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h
            .runner
            .run("q", &SessionId::from_raw("user-1"), &mut adapter, &cancel)
            .await;

        assert!(matches!(report.outcome, Outcome::Aborted(AbortReason::Cancelled)));
        assert_eq!(h.model.stream_calls(), 0);
        assert_eq!(memory.metadata()[0].status, 503);
        assert_eq!(memory.closes(), 1);
    }

    #[tokio::test]
    async fn unmarked_output_is_flushed_as_answer() {
        let h = harness(vec![MockResponse::tokens(&["Hello", " there"])], EngineConfig::default());
        let memory = MemoryTransport::new();
        let (report, _) = run(&h, "hi", memory.clone()).await;

        assert!(matches!(&report.outcome, Outcome::Answered { answer, .. } if answer == "Hello there"));
        assert_eq!(memory.frames().len(), 1);
        assert_eq!(memory.body(), "Hello there");
    }

    #[tokio::test]
    async fn non_streaming_relays_single_frame() {
        let mut config = EngineConfig::default();
        config.model.streaming = false;
        let h = harness(
            vec![MockResponse::text(TOOL_TURN), MockResponse::text(ANSWER_TURN)],
            config,
        );
        let memory = MemoryTransport::new();
        let (report, _) = run(&h, "What is 2^8?", memory.clone()).await;

        assert!(report.outcome.is_answered());
        assert_eq!(h.model.complete_calls(), 2);
        assert_eq!(h.model.stream_calls(), 0);
        assert_eq!(memory.frames().len(), 1);
        assert_eq!(memory.body(), "The answer is 256.");
    }

    #[tokio::test]
    async fn token_line_framing_end_to_end() {
        let config = EngineConfig {
            frame_format: FrameFormat::TokenLine,
            ..Default::default()
        };
        let h = harness(vec![MockResponse::tokens(&["Final Answer:", " 256"])], config);
        let memory = MemoryTransport::new();
        run(&h, "q", memory.clone()).await;

        assert_eq!(memory.body(), "token: 256\n");
        assert_eq!(memory.metadata()[0].header("content-type"), Some(CONTENT_TYPE_EVENT_STREAM));
    }

    #[tokio::test]
    async fn history_is_saved_and_replayed() {
        let h = harness(
            vec![
                MockResponse::text("Final Answer: Hi Ada."),
                MockResponse::text("Final Answer: Ada."),
            ],
            EngineConfig::default(),
        );
        run(&h, "My name is Ada.", MemoryTransport::new()).await;

        let saved = h.store.get("user-1#0").await.unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.entries[1].text, "Hi Ada.");

        run(&h, "What is my name?", MemoryTransport::new()).await;
        let prompts = h.model.prompts();
        assert!(prompts[1].contains("Human: My name is Ada.\nAssistant: Hi Ada.\n"));
        assert_eq!(h.store.get("user-1#0").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn aborted_run_saves_goal_only() {
        let h = harness(
            vec![MockResponse::Error(ModelError::Unavailable("down".into()))],
            EngineConfig::default(),
        );
        run(&h, "remember me", MemoryTransport::new()).await;

        let saved = h.store.get("user-1#0").await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.entries[0].text, "remember me");
    }

    #[tokio::test]
    async fn new_chat_index_starts_fresh_history() {
        let h = harness(
            vec![MockResponse::text("Final Answer: one"), MockResponse::text("Final Answer: two")],
            EngineConfig::default(),
        );
        run(&h, "first", MemoryTransport::new()).await;
        h.store.increment_chat_index("user-1").await.unwrap();
        run(&h, "second", MemoryTransport::new()).await;

        assert!(!h.model.prompts()[1].contains("Previous conversation"));
        assert_eq!(h.store.get("user-1#1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_sequence_is_always_requested() {
        let h = harness(vec![], EngineConfig::default());
        assert!(h.runner.options.stop_sequences.contains(&OBSERVATION_STOP.to_string()));
    }
}
