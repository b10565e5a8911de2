//! Session orchestrator
//!
//! Drives one conversation against the completion service. Before each
//! outbound call the history is checked against the [`BudgetConfig`] and
//! summarized when it no longer fits. A context-too-large rejection moves the
//! session into the degraded state: history is compacted aggressively and the
//! same message is retried, and once the escalation rounds run out the session
//! resets and answers with a fallback reply that quotes the request.
//!
//! ```text
//!            over budget / forced
//!   Normal ──────────────────────▶ Summarizing ──▶ Normal
//!     │
//!     │ context too large
//!     ▼
//!   Degraded{1} ─▶ ... ─▶ Degraded{max} ─▶ reset + fallback reply
//! ```

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{BudgetConfig, SessionConfig};
use crate::config::ParleyConfig;
use crate::conversation::{ConversationState, Summarizer, SummarizerConfig, Turn, truncate_chars};
use crate::error::{ParleyError, Result};
use crate::llm::{
    CompletionError, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
    FailureClass, Message, RetryExecutor, StreamEvent, ToolCall,
};
use crate::tools::ToolDispatcher;

/// Where the overflow-recovery state machine currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Exchanges run against the retained history
    #[default]
    Normal,
    /// Older turns are being condensed
    Summarizing,
    /// Recovering from a context-too-large rejection
    Degraded { round: usize },
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Summarizing => f.write_str("summarizing"),
            Self::Degraded { round } => write!(f, "degraded (round {round})"),
        }
    }
}

/// Current state, shared with the guard of the exchange in flight
#[derive(Debug, Clone, Default)]
struct StateCell(Arc<Mutex<OrchestratorState>>);

impl StateCell {
    fn get(&self) -> OrchestratorState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: OrchestratorState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Puts the session back to `Normal` however an exchange ends, including
/// when its future or stream is dropped half way
struct ExchangeGuard(StateCell);

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.0.set(OrchestratorState::Normal);
    }
}

/// Read-only snapshot of a session's context usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub turn_count: usize,
    /// Estimated size of summary plus retained turns
    pub estimated_size: usize,
    /// Configured maximum total size
    pub budget: usize,
    pub has_summary: bool,
    /// `estimated_size` as a percentage of `budget`
    pub usage_percent: f64,
}

/// Top-level controller for one conversation.
///
/// `send` and `send_streaming` take `&mut self`, so a session never has two
/// exchanges in flight.
pub struct SessionOrchestrator {
    provider: Arc<dyn CompletionProvider>,
    dispatcher: Arc<ToolDispatcher>,
    summarizer: Summarizer,
    retry: RetryExecutor,
    budget: Arc<BudgetConfig>,
    config: Arc<SessionConfig>,
    cancel: Option<CancellationToken>,
    conversation: ConversationState,
    state: StateCell,
}

impl SessionOrchestrator {
    /// Session with default budget, retry policy and no actions
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            summarizer: Summarizer::new(provider.clone()),
            provider,
            dispatcher: Arc::new(ToolDispatcher::new()),
            retry: RetryExecutor::default(),
            budget: Arc::new(BudgetConfig::default()),
            config: Arc::new(SessionConfig::default()),
            cancel: None,
            conversation: ConversationState::new(),
            state: StateCell::default(),
        }
    }

    /// Build a session from loaded configuration
    pub fn from_config(
        provider: Arc<dyn CompletionProvider>,
        dispatcher: Arc<ToolDispatcher>,
        config: &ParleyConfig,
    ) -> Self {
        Self::new(provider)
            .with_dispatcher(dispatcher)
            .with_budget(config.budget.clone())
            .with_session_config(config.session.clone())
            .with_summarizer_config(config.summarizer.clone())
            .with_retry(RetryExecutor::new(config.retry.clone()))
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<ToolDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_budget(mut self, budget: impl Into<Arc<BudgetConfig>>) -> Self {
        self.budget = budget.into();
        self
    }

    pub fn with_session_config(mut self, config: impl Into<Arc<SessionConfig>>) -> Self {
        self.config = config.into();
        self
    }

    pub fn with_summarizer_config(mut self, config: SummarizerConfig) -> Self {
        self.summarizer = Summarizer::with_config(self.provider.clone(), config);
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Abort in-flight calls and backoffs when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn session_id(&self) -> &str {
        self.conversation.session_id()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state.get()
    }

    fn exchange_guard(&self) -> ExchangeGuard {
        ExchangeGuard(self.state.clone())
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Direct access to the history, e.g. to restore an earlier exchange
    pub fn conversation_mut(&mut self) -> &mut ConversationState {
        &mut self.conversation
    }

    /// Context usage snapshot
    pub fn stats(&self) -> SessionStats {
        let estimated_size = self.conversation.total_size();
        let budget = self.budget.max_total_size;
        let usage_percent = if budget == 0 {
            0.0
        } else {
            estimated_size as f64 / budget as f64 * 100.0
        };

        SessionStats {
            turn_count: self.conversation.turn_count(),
            estimated_size,
            budget,
            has_summary: self.conversation.summary().is_some(),
            usage_percent,
        }
    }

    /// Clear history and summary and start a fresh remote thread
    pub fn reset(&mut self) {
        self.conversation.reset();
        self.conversation.renew_thread();
        self.state.set(OrchestratorState::Normal);
        info!(session_id = %self.session_id(), "Session reset");
    }

    /// Summarize the history now, regardless of budget
    pub async fn compact_now(&mut self) {
        if self.conversation.is_empty() {
            debug!(session_id = %self.session_id(), "Nothing to compact");
            return;
        }
        let _guard = self.exchange_guard();
        self.summarize_history().await;
    }

    /// Run one full exchange and return the assistant's reply.
    ///
    /// A context-too-large rejection that survives every escalation round
    /// resets the session and yields the fallback reply as `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the classified completion failure once retries are exhausted or
    /// the failure is fatal, or [`ParleyError::ToolRoundLimit`].
    pub async fn send(&mut self, message: &str) -> Result<String> {
        let _guard = self.exchange_guard();
        let user_turn = Turn::user(message, self.conversation.estimator());
        self.prepare().await;

        let mut round = 0;
        loop {
            let request = self.build_request(message);
            match self.run_exchange(request).await {
                Ok(reply) => {
                    self.commit(user_turn, &reply);
                    return Ok(reply);
                }
                Err(e) if is_context_too_large(&e) => {
                    if round >= self.budget.max_escalation_rounds {
                        return Ok(self.give_up(message));
                    }
                    round += 1;
                    self.escalate(round).await;
                }
                Err(e) => {
                    warn!(session_id = %self.session_id(), error = %e, "Exchange failed");
                    return Err(e);
                }
            }
        }
    }

    /// Run one exchange, yielding text fragments as they arrive.
    ///
    /// The stream never fails: a failure after output started, or any
    /// failure other than a recoverable context-too-large rejection, ends the
    /// stream with a single warning fragment. Turns are only committed when
    /// the exchange completes. Dropping the stream early abandons the
    /// exchange without touching the history.
    pub fn send_streaming<'a>(
        &'a mut self,
        message: &'a str,
    ) -> impl Stream<Item = String> + Send + 'a {
        async_stream::stream! {
            let _guard = self.exchange_guard();
            let user_turn = Turn::user(message, self.conversation.estimator());
            self.prepare().await;

            let mut round = 0;
            let mut reply = String::new();
            'exchange: loop {
                let mut request = self.build_request(message);
                let mut tool_rounds = 0;
                reply.clear();

                loop {
                    let failure = match self.open_stream(&request).await {
                        Ok(mut events) => {
                            let mut calls = None;
                            let mut failure = None;
                            while let Some(event) = events.next().await {
                                match event {
                                    Ok(StreamEvent::Delta(text)) => {
                                        reply.push_str(&text);
                                        yield text;
                                    }
                                    Ok(StreamEvent::ToolCalls(requested)) => calls = Some(requested),
                                    Err(e) => {
                                        failure = Some(e);
                                        break;
                                    }
                                }
                            }

                            match (failure, calls) {
                                (Some(e), _) => e,
                                (None, None) => break 'exchange,
                                (None, Some(calls)) => {
                                    tool_rounds += 1;
                                    if tool_rounds >= self.config.max_tool_rounds {
                                        let e = ParleyError::ToolRoundLimit(self.config.max_tool_rounds);
                                        warn!(session_id = %self.session_id(), error = %e, "Streaming exchange failed");
                                        yield warning_chunk(&e.to_string());
                                        return;
                                    }
                                    self.dispatch_calls(&mut request, String::new(), calls).await;
                                    continue;
                                }
                            }
                        }
                        Err(e) => e,
                    };

                    if failure.class == FailureClass::ContextTooLarge && reply.is_empty() {
                        if round >= self.budget.max_escalation_rounds {
                            yield self.give_up(message);
                            return;
                        }
                        round += 1;
                        self.escalate(round).await;
                        continue 'exchange;
                    }

                    warn!(
                        session_id = %self.session_id(),
                        class = %failure.class,
                        error = %failure,
                        "Streaming exchange interrupted"
                    );
                    yield warning_chunk(&failure.class.to_string());
                    return;
                }
            }

            self.commit(user_turn, &reply);
        }
    }

    /// Summarize first if the history no longer fits
    async fn prepare(&mut self) {
        let total = self.conversation.total_size();
        let over_size = total + self.budget.reserved_instruction_size > self.budget.max_total_size;
        let over_turns = self.conversation.turn_count() > self.budget.max_turns_before_summary;

        if over_size || over_turns {
            info!(
                session_id = %self.session_id(),
                estimated_size = total,
                turns = self.conversation.turn_count(),
                "History over budget, summarizing"
            );
            self.summarize_history().await;
        }
    }

    async fn summarize_history(&mut self) {
        self.state.set(OrchestratorState::Summarizing);
        let before = self.conversation.total_size();

        if !self.conversation.turns().is_empty() {
            let summary = self
                .summarizer
                .summarize(self.conversation.summary(), self.conversation.turns())
                .await;
            self.conversation.compact(summary, true);
        }
        self.fit_to_budget();
        self.conversation.renew_thread();

        info!(
            session_id = %self.session_id(),
            before,
            after = self.conversation.total_size(),
            "History compacted"
        );
        self.state.set(OrchestratorState::Normal);
    }

    /// Aggressive compaction after a context-too-large rejection
    async fn escalate(&mut self, round: usize) {
        self.state.set(OrchestratorState::Degraded { round });
        warn!(
            session_id = %self.session_id(),
            round,
            max_rounds = self.budget.max_escalation_rounds,
            "Context too large, compacting aggressively"
        );

        let summary = match self.conversation.turns() {
            [] => self.conversation.summary().map(str::to_string),
            turns => Some(
                self.summarizer
                    .summarize(self.conversation.summary(), turns)
                    .await,
            ),
        };
        match summary {
            Some(summary) => self.conversation.compact(summary, false),
            None => self.conversation.reset(),
        }
        self.fit_to_budget();
        self.conversation.renew_thread();
    }

    /// Reset and build the fallback reply quoting the request
    fn give_up(&mut self, message: &str) -> String {
        warn!(
            session_id = %self.session_id(),
            rounds = self.budget.max_escalation_rounds,
            "Context still too large after escalation, resetting session"
        );
        self.reset();
        fallback_reply(message, self.budget.fallback_excerpt_chars)
    }

    /// Drop retained turns, then shrink the summary, until the history fits
    fn fit_to_budget(&mut self) {
        let limit = self.budget.history_budget();
        while self.conversation.total_size() > limit {
            if self.conversation.drop_oldest().is_none() {
                self.conversation.cap_summary(limit);
                break;
            }
        }
    }

    fn commit(&mut self, user_turn: Turn, reply: &str) {
        let max = self.budget.max_turn_size;
        let user_turn = self.conversation.truncate_turn(&user_turn, max);
        let assistant_turn = self.conversation.truncate_turn(
            &Turn::assistant(reply, self.conversation.estimator()),
            max,
        );

        self.conversation.append(user_turn);
        self.conversation.append(assistant_turn);
        self.state.set(OrchestratorState::Normal);

        debug!(
            session_id = %self.session_id(),
            turns = self.conversation.turn_count(),
            estimated_size = self.conversation.total_size(),
            "Exchange committed"
        );
    }

    fn build_request(&self, message: &str) -> CompletionRequest {
        let system_prompt = self.config.render_system_prompt();
        let mut messages = self.conversation.to_messages(Some(&system_prompt));
        messages.push(Message::user(message));

        let mut request = CompletionRequest::new(messages)
            .with_tools(self.dispatcher.definitions())
            .with_thread_id(self.conversation.thread_id());
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Non-streaming exchange including the action loop
    async fn run_exchange(&self, mut request: CompletionRequest) -> Result<String> {
        for _ in 0..self.config.max_tool_rounds {
            match self.complete(&request).await? {
                CompletionResponse::Text { content, .. } => return Ok(content),
                CompletionResponse::ToolCalls { content, calls, .. } => {
                    self.dispatch_calls(&mut request, content, calls).await;
                }
            }
        }
        Err(ParleyError::ToolRoundLimit(self.config.max_tool_rounds))
    }

    /// Run requested actions and feed their results back into `request`
    async fn dispatch_calls(
        &self,
        request: &mut CompletionRequest,
        content: String,
        calls: Vec<ToolCall>,
    ) {
        request
            .messages
            .push(Message::assistant_tool_calls(content, calls.clone()));

        for call in calls {
            debug!(session_id = %self.session_id(), tool = %call.name, "Invoking action");
            let result = self.dispatcher.invoke(&call.name, &call.arguments).await;
            request.messages.push(Message::tool_result(call.id, result));
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, CompletionError> {
        let provider = &self.provider;
        let call = || provider.complete(request);
        match &self.cancel {
            Some(token) => self.retry.execute_cancellable(call, token).await,
            None => self.retry.execute(call).await,
        }
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionStream, CompletionError> {
        let provider = &self.provider;
        let call = || provider.complete_stream(request);
        match &self.cancel {
            Some(token) => self.retry.execute_cancellable(call, token).await,
            None => self.retry.execute(call).await,
        }
    }
}

impl fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("turns", &self.conversation.turn_count())
            .field("model", &self.provider.model_info().model_name)
            .finish()
    }
}

fn is_context_too_large(err: &ParleyError) -> bool {
    err.as_completion()
        .is_some_and(|e| e.class == FailureClass::ContextTooLarge)
}

/// Reply returned when the context could not be brought under the limit
pub fn fallback_reply(message: &str, excerpt_chars: usize) -> String {
    let request = message.trim();
    let excerpt = truncate_chars(request, excerpt_chars);
    let ellipsis = if excerpt.len() < request.len() { "..." } else { "" };

    format!(
        "Sorry, our conversation grew too large for me to handle, so I had to start over \
         and lost the earlier context. Your last request was: \"{excerpt}{ellipsis}\". \
         Please rephrase it more briefly or send it again."
    )
}

/// Final fragment of an interrupted stream
pub fn warning_chunk(reason: &str) -> String {
    format!("\n\n[Warning: the response was interrupted ({reason}). Please try again.]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{FALLBACK_SUMMARY, TurnRole};
    use crate::llm::{RetryPolicy, Sleeper};
    use crate::tools::{FnTool, ParamSpec, ParamType, ToolMetadata};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    type Reply = std::result::Result<CompletionResponse, CompletionError>;

    /// Replies in order; summary requests are answered separately
    #[derive(Default)]
    struct ScriptedProvider {
        replies: Mutex<VecDeque<Reply>>,
        summary: Mutex<Option<Reply>>,
        requests: Mutex<Vec<CompletionRequest>>,
        summary_calls: Mutex<usize>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                summary: Mutex::new(Some(Ok(CompletionResponse::text("short summary")))),
                ..Default::default()
            })
        }

        fn main_calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: &CompletionRequest) -> Reply {
            if request.max_tokens == Some(300) && request.tools.is_empty() {
                *self.summary_calls.lock().unwrap() += 1;
                return self
                    .summary
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(CompletionError::rejected("no summary")));
            }
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::rejected("script exhausted")))
        }
    }

    struct InstantSleeper;

    #[async_trait]
    impl Sleeper for InstantSleeper {
        async fn sleep(&self, _delay: Duration) {}
    }

    fn session(provider: Arc<ScriptedProvider>) -> SessionOrchestrator {
        SessionOrchestrator::new(provider).with_retry(
            RetryExecutor::new(RetryPolicy::default()).with_sleeper(Arc::new(InstantSleeper)),
        )
    }

    #[tokio::test]
    async fn test_send_commits_turn_pair() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::text("Hi there!"))]);
        let mut session = session(provider.clone());

        let reply = session.send("hello").await.unwrap();

        assert_eq!(reply, "Hi there!");
        let turns = session.conversation().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role(), TurnRole::User);
        assert_eq!(turns[1].content(), "Hi there!");
        assert_eq!(session.state(), OrchestratorState::Normal);
    }

    #[tokio::test]
    async fn test_request_layout() {
        let provider = ScriptedProvider::new(vec![
            Ok(CompletionResponse::text("first")),
            Ok(CompletionResponse::text("second")),
        ]);
        let mut session = session(provider.clone());

        session.send("one").await.unwrap();
        session.send("two").await.unwrap();

        let requests = provider.requests.lock().unwrap();
        let roles: Vec<_> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [
                crate::llm::MessageRole::System,
                crate::llm::MessageRole::User,
                crate::llm::MessageRole::Assistant,
                crate::llm::MessageRole::User,
            ]
        );
        assert_eq!(requests[1].messages[3].content, "two");
        assert_eq!(requests[1].thread_id.as_deref(), Some(session.conversation().thread_id()));
    }

    #[tokio::test]
    async fn test_client_rejected_surfaces_without_turns() {
        let provider = ScriptedProvider::new(vec![Err(CompletionError::rejected("bad key"))]);
        let mut session = session(provider.clone());

        let err = session.send("hello").await.unwrap_err();

        assert_eq!(
            err.as_completion().map(|e| e.class),
            Some(FailureClass::ClientRejected)
        );
        assert_eq!(provider.main_calls(), 1);
        assert_eq!(session.stats().turn_count, 0);
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let provider = ScriptedProvider::new(vec![
            Ok(CompletionResponse::tool_calls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "list_documents".to_string(),
                arguments: r#"{"category":"travel"}"#.to_string(),
            }])),
            Ok(CompletionResponse::text("You have a passport on file.")),
        ]);

        let mut dispatcher = ToolDispatcher::new();
        dispatcher
            .register(Arc::new(FnTool::new(
                ToolMetadata::new("list_documents", "List saved documents").with_param(
                    ParamSpec::optional("category", ParamType::String, "Filter by category"),
                ),
                |args| {
                    let category = args.str("category").unwrap_or("all").to_string();
                    async move { Ok(format!("[{category}] Passport, expires 2027-05-01")) }.boxed()
                },
            )))
            .unwrap();

        let mut session = session(provider.clone()).with_dispatcher(Arc::new(dispatcher));
        let reply = session.send("what documents do I have?").await.unwrap();

        assert_eq!(reply, "You have a passport on file.");
        assert_eq!(session.stats().turn_count, 2);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].tools.len(), 1);
        let tool_message = requests[1].messages.last().unwrap();
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_message.content, "[travel] Passport, expires 2027-05-01");
    }

    #[tokio::test]
    async fn test_tool_round_limit() {
        let call = || {
            Ok(CompletionResponse::tool_calls(vec![ToolCall {
                id: "loop".to_string(),
                name: "missing".to_string(),
                arguments: "{}".to_string(),
            }]))
        };
        let provider = ScriptedProvider::new(vec![call(), call()]);
        let mut session = session(provider).with_session_config(
            SessionConfig::default().with_max_tool_rounds(2),
        );

        let err = session.send("loop forever").await.unwrap_err();
        assert!(matches!(err, ParleyError::ToolRoundLimit(2)));
        assert_eq!(session.stats().turn_count, 0);
    }

    #[tokio::test]
    async fn test_escalation_recovers() {
        let provider = ScriptedProvider::new(vec![
            Err(CompletionError::context_too_large("too many tokens")),
            Ok(CompletionResponse::text("Recovered answer")),
        ]);
        let mut session = session(provider.clone());
        let estimator = *session.conversation().estimator();
        session
            .conversation_mut()
            .append(Turn::user("earlier question", &estimator));
        session
            .conversation_mut()
            .append(Turn::assistant("earlier answer", &estimator));
        let thread_before = session.conversation().thread_id().to_string();

        let reply = session.send("next question").await.unwrap();

        assert_eq!(reply, "Recovered answer");
        assert_eq!(*provider.summary_calls.lock().unwrap(), 1);
        assert_eq!(session.conversation().summary(), Some("short summary"));
        assert_eq!(session.stats().turn_count, 2);
        assert_ne!(session.conversation().thread_id(), thread_before);
        assert_eq!(session.state(), OrchestratorState::Normal);
    }

    #[tokio::test]
    async fn test_turn_limit_triggers_summary() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::text("ok"))]);
        let mut session = session(provider.clone())
            .with_budget(BudgetConfig::default().with_max_turns_before_summary(2));
        let estimator = *session.conversation().estimator();
        for i in 0..3 {
            session
                .conversation_mut()
                .append(Turn::user(format!("q{i}"), &estimator));
        }

        session.send("hello").await.unwrap();

        assert_eq!(*provider.summary_calls.lock().unwrap(), 1);
        assert_eq!(session.stats().turn_count, 3);
        assert!(session.stats().has_summary);
    }

    #[tokio::test]
    async fn test_summary_renews_thread() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::text("ok"))]);
        let mut session = session(provider.clone())
            .with_budget(BudgetConfig::default().with_max_turns_before_summary(2));
        let estimator = *session.conversation().estimator();
        for i in 0..3 {
            session
                .conversation_mut()
                .append(Turn::user(format!("q{i}"), &estimator));
        }
        let thread_before = session.conversation().thread_id().to_string();

        session.send("hello").await.unwrap();

        assert_eq!(*provider.summary_calls.lock().unwrap(), 1);
        assert_ne!(session.conversation().thread_id(), thread_before);
        let requests = provider.requests.lock().unwrap();
        assert_eq!(
            requests[0].thread_id.as_deref(),
            Some(session.conversation().thread_id())
        );
    }

    /// Never answers a summary request
    struct StalledSummaryProvider;

    #[async_trait]
    impl CompletionProvider for StalledSummaryProvider {
        async fn complete(&self, request: &CompletionRequest) -> Reply {
            if request.tools.is_empty() && request.max_tokens == Some(300) {
                futures::future::pending::<()>().await;
            }
            Ok(CompletionResponse::text("ok"))
        }
    }

    #[tokio::test]
    async fn test_dropped_exchange_returns_to_normal() {
        let mut session = SessionOrchestrator::new(Arc::new(StalledSummaryProvider))
            .with_budget(BudgetConfig::default().with_max_turns_before_summary(1));
        let estimator = *session.conversation().estimator();
        session.conversation_mut().append(Turn::user("a", &estimator));
        session.conversation_mut().append(Turn::assistant("b", &estimator));

        {
            let exchange = session.send("hello");
            tokio::pin!(exchange);
            assert!(futures::poll!(&mut exchange).is_pending());
        }
        assert_eq!(session.state(), OrchestratorState::Normal);

        {
            let stream = session.send_streaming("hello");
            tokio::pin!(stream);
            assert!(futures::poll!(stream.next()).is_pending());
        }
        assert_eq!(session.state(), OrchestratorState::Normal);
        assert_eq!(session.conversation().turn_count(), 2);
    }

    #[tokio::test]
    async fn test_compact_now() {
        let provider = ScriptedProvider::new(vec![]);
        let mut session = session(provider.clone());

        session.compact_now().await;
        assert_eq!(*provider.summary_calls.lock().unwrap(), 0);

        let estimator = *session.conversation().estimator();
        session
            .conversation_mut()
            .append(Turn::user("remember my gym membership", &estimator));
        session.compact_now().await;

        assert_eq!(*provider.summary_calls.lock().unwrap(), 1);
        assert_eq!(session.conversation().summary(), Some("short summary"));
    }

    #[tokio::test]
    async fn test_summary_failure_absorbed() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::text("ok"))]);
        *provider.summary.lock().unwrap() = Some(Err(CompletionError::transient("down")));
        let mut session = session(provider.clone())
            .with_budget(BudgetConfig::default().with_max_turns_before_summary(1));
        let estimator = *session.conversation().estimator();
        session.conversation_mut().append(Turn::user("a", &estimator));
        session.conversation_mut().append(Turn::assistant("b", &estimator));

        assert_eq!(session.send("hello").await.unwrap(), "ok");
        assert_eq!(session.conversation().summary(), Some(FALLBACK_SUMMARY));
    }

    #[tokio::test]
    async fn test_stored_turns_truncated() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::text("noted"))]);
        let mut session = session(provider.clone())
            .with_budget(BudgetConfig::default().with_max_turn_size(20));

        let long = "z".repeat(1000);
        session.send(&long).await.unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].messages.last().unwrap().content, long);
        assert!(session.conversation().turns()[0].size() <= 20);
    }

    #[test]
    fn test_fallback_reply_excerpt() {
        let reply = fallback_reply(&"x".repeat(300), 200);
        assert!(reply.contains(&format!("\"{}...\"", "x".repeat(200))));
        assert!(!reply.contains(&"x".repeat(201)));

        let reply = fallback_reply("book a flight", 200);
        assert!(reply.contains("\"book a flight\""));
        assert!(reply.contains("rephrase"));
    }

    #[test]
    fn test_stats_serialize() {
        let session = session(ScriptedProvider::new(vec![]));
        let stats = serde_json::to_value(session.stats()).unwrap();
        assert_eq!(stats["turn_count"], 0);
        assert_eq!(stats["budget"], 6000);
        assert_eq!(stats["has_summary"], false);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OrchestratorState::Degraded { round: 2 }.to_string(), "degraded (round 2)");
        assert_eq!(
            serde_json::to_value(OrchestratorState::Degraded { round: 1 }).unwrap(),
            serde_json::json!({"state": "degraded", "round": 1})
        );
    }
}
