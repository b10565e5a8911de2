//! End-to-end session behaviour against a scripted completion service

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parley_core::prelude::*;
use parley_core::llm::Sleeper;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

type Reply = std::result::Result<CompletionResponse, CompletionError>;
type StreamScript = Vec<std::result::Result<StreamEvent, CompletionError>>;

/// What the scripted service does for one main call
enum Step {
    Reply(Reply),
    Stream(StreamScript),
    /// Fail before any stream is opened
    StreamOpenError(CompletionError),
}

/// Completion service answering from a script.
///
/// Summary requests (no tools, 300-token ceiling) are answered from
/// `summary` and counted separately from main calls.
struct ScriptedService {
    steps: Mutex<VecDeque<Step>>,
    /// Used once the script runs out
    otherwise: Option<Reply>,
    summary: Reply,
    main_calls: Mutex<Vec<CompletionRequest>>,
    summary_calls: Mutex<usize>,
}

impl ScriptedService {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            otherwise: None,
            summary: Ok(CompletionResponse::text("The user asked about renewals.")),
            main_calls: Mutex::new(Vec::new()),
            summary_calls: Mutex::new(0),
        }
    }

    fn always(reply: Reply) -> Self {
        Self {
            otherwise: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    fn main_calls(&self) -> usize {
        self.main_calls.lock().unwrap().len()
    }

    fn summary_calls(&self) -> usize {
        *self.summary_calls.lock().unwrap()
    }

    fn is_summary(request: &CompletionRequest) -> bool {
        request.tools.is_empty() && request.max_tokens == Some(300)
    }

    fn next_step(&self, request: &CompletionRequest) -> Step {
        self.main_calls.lock().unwrap().push(request.clone());
        match self.steps.lock().unwrap().pop_front() {
            Some(step) => step,
            None => Step::Reply(
                self.otherwise
                    .clone()
                    .unwrap_or_else(|| Err(CompletionError::rejected("script exhausted"))),
            ),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedService {
    async fn complete(&self, request: &CompletionRequest) -> Reply {
        if Self::is_summary(request) {
            *self.summary_calls.lock().unwrap() += 1;
            return self.summary.clone();
        }
        match self.next_step(request) {
            Step::Reply(reply) => reply,
            Step::StreamOpenError(e) => Err(e),
            Step::Stream(_) => panic!("stream step used by a non-streaming call"),
        }
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionStream, CompletionError> {
        match self.next_step(request) {
            Step::Stream(events) => Ok(Box::pin(futures::stream::iter(events))),
            Step::StreamOpenError(e) => Err(e),
            Step::Reply(reply) => {
                let event = match reply? {
                    CompletionResponse::Text { content, .. } => StreamEvent::Delta(content),
                    CompletionResponse::ToolCalls { calls, .. } => StreamEvent::ToolCalls(calls),
                };
                Ok(Box::pin(futures::stream::iter(vec![Ok(event)])))
            }
        }
    }
}

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

fn session_with(
    service: Arc<ScriptedService>,
    budget: BudgetConfig,
) -> (SessionOrchestrator, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    let retry = RetryExecutor::new(RetryPolicy::default()).with_sleeper(sleeper.clone());
    let session = SessionOrchestrator::new(service)
        .with_budget(budget)
        .with_retry(retry);
    (session, sleeper)
}

fn preload(session: &mut SessionOrchestrator, pairs: usize, chars_per_turn: usize) {
    let estimator = *session.conversation().estimator();
    for i in 0..pairs {
        let question = format!("{i}:{}", "q".repeat(chars_per_turn - 2));
        let answer = format!("{i}:{}", "a".repeat(chars_per_turn - 2));
        session
            .conversation_mut()
            .append(Turn::user(question, &estimator));
        session
            .conversation_mut()
            .append(Turn::assistant(answer, &estimator));
    }
}

#[tokio::test]
async fn over_budget_history_is_summarized_once() {
    let service = Arc::new(ScriptedService::new(vec![Step::Reply(Ok(
        CompletionResponse::text("Hello again!"),
    ))]));
    let budget = BudgetConfig::new()
        .with_max_total_size(100)
        .with_reserved_instruction_size(0);
    let (mut session, _) = session_with(service.clone(), budget);

    // 3 pairs of 100-char turns: 6 * 25 = 150 units
    preload(&mut session, 3, 100);
    assert_eq!(session.stats().estimated_size, 150);

    let reply = assert_ok!(session.send("hello").await);
    assert_eq!(reply, "Hello again!");

    assert_eq!(service.summary_calls(), 1);
    let estimator = TokenBudgetEstimator::new();
    let new_turns = estimator.estimate("hello") + estimator.estimate("Hello again!");
    let stats = session.stats();
    assert!(stats.estimated_size <= 100 + new_turns);
    assert!(stats.has_summary);
}

#[tokio::test]
async fn persistent_overflow_falls_back_and_resets() {
    let service = Arc::new(ScriptedService::always(Err(
        CompletionError::context_too_large("maximum context length exceeded"),
    )));
    let (mut session, sleeper) = session_with(service.clone(), BudgetConfig::default());
    preload(&mut session, 2, 40);

    let reply = assert_ok!(session.send("book a flight").await);

    assert!(reply.contains("book a flight"));
    assert!(reply.contains("rephrase"));
    assert_eq!(session.stats().turn_count, 0);
    assert!(!session.stats().has_summary);
    assert_eq!(session.state(), OrchestratorState::Normal);
    // first attempt plus two escalation rounds, never retried by backoff
    assert_eq!(service.main_calls(), 3);
    assert!(sleeper.delays.lock().unwrap().is_empty());
}

#[tokio::test]
async fn fallback_excerpt_is_capped() {
    let service = Arc::new(ScriptedService::always(Err(
        CompletionError::context_too_large("request too large"),
    )));
    let budget = BudgetConfig::default().with_fallback_excerpt_chars(10);
    let (mut session, _) = session_with(service, budget);

    let reply = assert_ok!(session.send("book a flight to Lisbon for Friday").await);
    assert!(reply.contains("\"book a fli...\""));
}

#[tokio::test]
async fn retries_do_not_duplicate_turns() {
    let service = Arc::new(ScriptedService::new(vec![
        Step::Reply(Err(CompletionError::rate_limited("slow down"))),
        Step::Reply(Err(CompletionError::transient("connection reset"))),
        Step::Reply(Ok(CompletionResponse::text("Your passport expires in May."))),
    ]));
    let (mut session, sleeper) = session_with(service.clone(), BudgetConfig::default());

    let reply = assert_ok!(session.send("when does my passport expire?").await);

    assert_eq!(reply, "Your passport expires in May.");
    assert_eq!(session.stats().turn_count, 2);
    assert_eq!(service.main_calls(), 3);

    let delays = sleeper.delays.lock().unwrap();
    assert_eq!(delays.len(), 2);
    assert!(delays[0] < delays[1]);

    // every attempt carried the same message once
    for request in service.main_calls.lock().unwrap().iter() {
        let user_messages = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        assert_eq!(user_messages, 1);
    }
}

#[tokio::test]
async fn exhausted_retries_surface_last_failure() {
    let service = Arc::new(ScriptedService::always(Err(CompletionError::transient(
        "upstream unavailable",
    ))));
    let (mut session, sleeper) = session_with(service.clone(), BudgetConfig::default());

    let err = session.send("hello").await.unwrap_err();

    assert_eq!(
        err.as_completion().map(|e| e.class),
        Some(FailureClass::TransientConnection)
    );
    assert_eq!(service.main_calls(), 3);
    assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    assert_eq!(session.stats().turn_count, 0);
}

#[tokio::test]
async fn stream_failure_yields_warning_chunk() {
    let service = Arc::new(ScriptedService::new(vec![Step::Stream(vec![
        Ok(StreamEvent::Delta("Your gym ".to_string())),
        Ok(StreamEvent::Delta("membership renews".to_string())),
        Err(CompletionError::transient("connection reset by peer")),
    ])]));
    let (mut session, _) = session_with(service.clone(), BudgetConfig::default());

    let chunks: Vec<String> = session
        .send_streaming("when does my gym membership renew?")
        .collect()
        .await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], "Your gym ");
    assert_eq!(chunks[1], "membership renews");
    assert!(chunks[2].contains("Warning"));
    assert_eq!(session.stats().turn_count, 0);
    assert_eq!(service.main_calls(), 1);
}

#[tokio::test]
async fn stream_success_commits_concatenated_reply() {
    let service = Arc::new(ScriptedService::new(vec![
        Step::Stream(vec![Ok(StreamEvent::ToolCalls(vec![ToolCall {
            id: "call_1".to_string(),
            name: "get_spending_summary".to_string(),
            arguments: "{}".to_string(),
        }]))]),
        Step::Stream(vec![
            Ok(StreamEvent::Delta("You spend ".to_string())),
            Ok(StreamEvent::Delta("42 USD a month.".to_string())),
        ]),
    ]));

    let mut dispatcher = ToolDispatcher::new();
    dispatcher
        .register(Arc::new(FnTool::new(
            ToolMetadata::new("get_spending_summary", "Monthly subscription total"),
            |_args| async { Ok::<_, ToolError>("42 USD".to_string()) }.boxed(),
        )))
        .unwrap();

    let (session, _) = session_with(service.clone(), BudgetConfig::default());
    let mut session = session.with_dispatcher(Arc::new(dispatcher));

    let chunks: Vec<String> = session
        .send_streaming("how much do I spend?")
        .collect()
        .await;

    assert_eq!(chunks.concat(), "You spend 42 USD a month.");
    let turns = session.conversation().turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content(), "You spend 42 USD a month.");

    let calls = service.main_calls.lock().unwrap();
    let tool_result = calls[1].messages.last().unwrap();
    assert_eq!(tool_result.role, MessageRole::Tool);
    assert_eq!(tool_result.content, "42 USD");
}

#[tokio::test]
async fn stream_recovers_from_overflow_before_output() {
    let service = Arc::new(ScriptedService::new(vec![
        Step::StreamOpenError(CompletionError::context_too_large("context_length_exceeded")),
        Step::Stream(vec![Ok(StreamEvent::Delta("Done.".to_string()))]),
    ]));
    let (mut session, _) = session_with(service.clone(), BudgetConfig::default());
    preload(&mut session, 1, 20);

    let chunks: Vec<String> = session.send_streaming("archive my visa").collect().await;

    assert_eq!(chunks, ["Done."]);
    assert_eq!(service.summary_calls(), 1);
    assert_eq!(session.stats().turn_count, 2);
}

#[tokio::test]
async fn stream_overflow_exhaustion_yields_fallback() {
    let service = Arc::new(ScriptedService::always(Err(
        CompletionError::context_too_large("prompt is too long"),
    )));
    let (mut session, _) = session_with(service, BudgetConfig::default());

    let chunks: Vec<String> = session.send_streaming("book a flight").collect().await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].contains("book a flight"));
    assert_eq!(session.stats().turn_count, 0);
}

#[tokio::test]
async fn reset_twice_equals_once() {
    let service = Arc::new(ScriptedService::new(vec![Step::Reply(Ok(
        CompletionResponse::text("Saved."),
    ))]));
    let (mut session, _) = session_with(service, BudgetConfig::default());
    assert_ok!(session.send("add my passport").await);

    session.reset();
    let once = session.stats();
    session.reset();
    let twice = session.stats();

    assert_eq!(once, twice);
    assert_eq!(twice.turn_count, 0);
    assert_eq!(twice.estimated_size, 0);
    assert!(!twice.has_summary);
    assert_eq!(session.state(), OrchestratorState::Normal);
}

#[tokio::test]
async fn cancellation_is_fatal() {
    let service = Arc::new(ScriptedService::always(Err(CompletionError::rate_limited(
        "slow down",
    ))));
    let token = CancellationToken::new();
    token.cancel();
    let (session, sleeper) = session_with(service.clone(), BudgetConfig::default());
    let mut session = session.with_cancellation(token);

    let err = session.send("hello").await.unwrap_err();

    assert_eq!(err.as_completion().map(|e| e.class), Some(FailureClass::Cancelled));
    assert_eq!(service.main_calls(), 0);
    assert!(sleeper.delays.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stats_report_usage() {
    let service = Arc::new(ScriptedService::new(vec![]));
    let budget = BudgetConfig::new()
        .with_max_total_size(1000)
        .with_reserved_instruction_size(100);
    let (mut session, _) = session_with(service, budget);
    preload(&mut session, 1, 200);

    let stats = session.stats();
    assert_eq!(stats.turn_count, 2);
    assert_eq!(stats.estimated_size, 100);
    assert_eq!(stats.budget, 1000);
    assert!((stats.usage_percent - 10.0).abs() < 1e-9);
}
