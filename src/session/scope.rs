//! Interactive subagent scope (C7) — spec §4.7.
//!
//! Drives one session's conversation: drains a FIFO message queue, streams
//! a response from the chat client for each message, dispatches any tool
//! calls the response requests, and surfaces chunks/final text as events.
//! See spec §5 for the concurrency model this implements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventBus, SessionEvent, SubagentEvent};
use crate::logging::Logger;

use super::{SessionContext, SessionId};

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
}

/// One function-invocation request emitted by the model within a round.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Outcome of dispatching a [`FunctionCall`].
#[derive(Debug, Clone)]
pub struct ToolDispatchResult {
    pub call_id: String,
    pub success: bool,
    pub summary: Option<String>,
}

/// Opaque capability provider the scope dispatches tool calls against.
/// Out of scope per spec §1 — only the interface the core needs.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn get_function_declarations(&self) -> Vec<ToolDeclaration>;

    fn get_function_declarations_filtered(&self, names: &[String]) -> Vec<ToolDeclaration> {
        self.get_function_declarations()
            .into_iter()
            .filter(|d| names.contains(&d.name))
            .collect()
    }

    async fn dispatch(&self, call: FunctionCall) -> ToolDispatchResult;
}

/// One chunk of a streaming model response.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub function_calls: Vec<FunctionCall>,
    pub text_parts: Vec<String>,
    pub usage: Option<Value>,
}

/// An event read off the chat client's streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The client is retrying the underlying request transparently.
    Retry,
    Chunk(ChatChunk),
}

/// Per-call configuration passed to [`ChatClient::send_message_stream`].
#[derive(Clone)]
pub struct StreamRequestConfig {
    pub tools: Vec<ToolDeclaration>,
    pub cancellation: CancellationToken,
}

/// Opaque streaming chat interface. Out of scope per spec §1 — the LLM
/// client itself lives entirely outside the core.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message_stream(
        &self,
        message: &str,
        config: StreamRequestConfig,
        prompt_id: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, crate::error::AgentError>;
}

/// Non-owning control surface the session manager holds for a bound scope
/// (Design Note: "weak upward coupling from scope to session manager").
pub trait ScopeControl: Send + Sync {
    fn enqueue_user_message(&self, text: String);
    fn cancel_current_message(&self);
}

/// A type-erased reference to a bound scope.
pub type ScopeHandle = Arc<dyn ScopeControl>;

/// Tunables that shape a round beyond the wire-level chat call.
#[derive(Clone, Default)]
pub struct ScopeConfig {
    /// Whether the delegation tool (spawning a nested task/session) is
    /// included in the tool list offered to the model.
    pub allow_nested_tasks: bool,
    /// When set, only these tool names (plus `inline_tools`) are offered.
    pub tool_whitelist: Option<Vec<String>>,
    /// Tools always appended regardless of the whitelist.
    pub inline_tools: Vec<ToolDeclaration>,
    pub max_turns: Option<u64>,
    pub max_time: Option<Duration>,
}

pub const DELEGATION_TOOL_NAME: &str = "delegate_task";

fn delegation_tool() -> ToolDeclaration {
    ToolDeclaration {
        name: DELEGATION_TOOL_NAME.to_string(),
        description: "Delegate a subtask to a new nested session".to_string(),
    }
}

/// Why [`InteractiveSubagentScope::run_interactive`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    Running,
    Finished,
    Cancelled,
    Error,
    MaxTurnsReached,
    MaxTimeReached,
}

#[derive(Debug, Default, Clone)]
struct UsageStats {
    total_tokens: u64,
    rounds: u64,
}

/// Drives the interactive loop for one session.
pub struct InteractiveSubagentScope<C, T>
where
    C: ChatClient + 'static,
    T: ToolRegistry + 'static,
{
    session_id: SessionId,
    chat_client: Arc<C>,
    tool_registry: Arc<T>,
    events: EventBus,
    logger: Arc<Logger>,
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    external_cancel: CancellationToken,
    round_cancel: Mutex<CancellationToken>,
    round_counter: AtomicU64,
    usage: Mutex<UsageStats>,
    config: ScopeConfig,
    terminate_mode: Mutex<TerminateMode>,
    started_at: Mutex<Option<Instant>>,
}

impl<C, T> InteractiveSubagentScope<C, T>
where
    C: ChatClient + 'static,
    T: ToolRegistry + 'static,
{
    pub fn new(
        session_id: SessionId,
        chat_client: Arc<C>,
        tool_registry: Arc<T>,
        events: EventBus,
        logger: Arc<Logger>,
        config: ScopeConfig,
        external_cancel: CancellationToken,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id,
            chat_client,
            tool_registry,
            events,
            logger,
            sender,
            receiver: Mutex::new(Some(receiver)),
            round_cancel: Mutex::new(external_cancel.child_token()),
            external_cancel,
            round_counter: AtomicU64::new(0),
            usage: Mutex::new(UsageStats::default()),
            config,
            terminate_mode: Mutex::new(TerminateMode::Running),
            started_at: Mutex::new(None),
        })
    }

    pub fn terminate_mode(&self) -> TerminateMode {
        *self.terminate_mode.lock().unwrap()
    }

    fn set_terminate_mode(&self, mode: TerminateMode) {
        *self.terminate_mode.lock().unwrap() = mode;
    }

    fn emit(&self, event: SubagentEvent) {
        self.events
            .emit(Event::subagent(self.session_id.clone(), event));
    }

    fn emit_session(&self, event: SessionEvent) {
        self.events
            .emit(Event::session(self.session_id.clone(), event));
    }

    /// Runs the interactive loop until the session's internal abort
    /// controller fires (spec §4.7). Binds itself to `manager` first.
    pub async fn run_interactive(
        self: &Arc<Self>,
        manager: &crate::session::SessionManager,
        context: &SessionContext,
    ) {
        if let Err(e) = manager.bind_scope(self.session_id.clone(), self.clone() as ScopeHandle) {
            self.logger.error(
                "failed to bind scope",
                Some(serde_json::json!({"session_id": self.session_id.as_str()})),
                Some((&e).into()),
            );
            return;
        }
        *self.started_at.lock().unwrap() = Some(Instant::now());

        self.emit(SubagentEvent::Start);

        if let Some(Value::String(prompt)) = context.get("task_prompt") {
            self.enqueue_user_message(prompt);
        }

        let mut receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("run_interactive must be called exactly once");

        loop {
            if self.external_cancel.is_cancelled() {
                self.set_terminate_mode(TerminateMode::Cancelled);
                break;
            }

            if let Some(max_turns) = self.config.max_turns {
                if self.usage.lock().unwrap().rounds >= max_turns {
                    self.set_terminate_mode(TerminateMode::MaxTurnsReached);
                    break;
                }
            }
            if let Some(max_time) = self.config.max_time {
                let elapsed = self.started_at.lock().unwrap().unwrap().elapsed();
                if elapsed >= max_time {
                    self.set_terminate_mode(TerminateMode::MaxTimeReached);
                    break;
                }
            }

            tokio::select! {
                _ = self.external_cancel.cancelled() => {
                    self.set_terminate_mode(TerminateMode::Cancelled);
                    break;
                }
                message = receiver.recv() => {
                    match message {
                        Some(text) => self.process_round(text).await,
                        None => {
                            self.set_terminate_mode(TerminateMode::Finished);
                            break;
                        }
                    }
                }
            }
        }

        let stats = self.usage.lock().unwrap().clone();
        self.emit(SubagentEvent::Finish {
            stats: Some(serde_json::json!({
                "rounds": stats.rounds,
                "total_tokens": stats.total_tokens,
                "terminate_mode": format!("{:?}", self.terminate_mode()),
            })),
        });
    }

    fn build_tool_list(&self) -> Vec<ToolDeclaration> {
        let mut tools = self.tool_registry.get_function_declarations();
        if !self.config.allow_nested_tasks {
            tools.retain(|t| t.name != DELEGATION_TOOL_NAME);
        } else if !tools.iter().any(|t| t.name == DELEGATION_TOOL_NAME) {
            tools.push(delegation_tool());
        }

        if let Some(whitelist) = &self.config.tool_whitelist {
            tools.retain(|t| whitelist.contains(&t.name));
        }

        for inline in &self.config.inline_tools {
            if !tools.iter().any(|t| t.name == inline.name) {
                tools.push(inline.clone());
            }
        }

        tools
    }

    async fn process_round(&self, user_text: String) {
        let round = self.round_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let round_token = self.external_cancel.child_token();
        *self.round_cancel.lock().unwrap() = round_token.clone();

        let tools = self.build_tool_list();
        let prompt_id = format!("{}#round#{}", self.session_id, round);

        self.emit(SubagentEvent::RoundStart {
            round,
            prompt_id: prompt_id.clone(),
        });

        let stream_config = StreamRequestConfig {
            tools,
            cancellation: round_token.clone(),
        };

        let mut receiver = match self
            .chat_client
            .send_message_stream(&user_text, stream_config, &prompt_id)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.logger.error(
                    "chat client call failed",
                    Some(serde_json::json!({"session_id": self.session_id.as_str()})),
                    Some((&e).into()),
                );
                self.emit(SubagentEvent::Error {
                    message: e.to_string(),
                });
                self.emit(SubagentEvent::RoundEnd { round });
                return;
            }
        };

        let mut text_buffer = String::new();
        let mut last_usage: Option<Value> = None;
        let mut function_calls: Vec<FunctionCall> = Vec::new();
        let mut aborted = false;

        loop {
            tokio::select! {
                _ = round_token.cancelled() => {
                    aborted = true;
                    break;
                }
                event = receiver.recv() => {
                    match event {
                        None => break,
                        Some(StreamEvent::Retry) => continue,
                        Some(StreamEvent::Chunk(chunk)) => {
                            function_calls.extend(chunk.function_calls);
                            for text in chunk.text_parts {
                                text_buffer.push_str(&text);
                                self.emit(SubagentEvent::StreamText { text: text.clone() });
                                self.emit_session(SessionEvent::SubagentMessageToUser {
                                    text_chunk: Some(text),
                                    final_text: None,
                                });
                            }
                            if chunk.usage.is_some() {
                                last_usage = chunk.usage;
                            }
                        }
                    }
                }
            }
        }

        {
            let mut usage = self.usage.lock().unwrap();
            usage.rounds += 1;
            if let Some(Value::Number(n)) = last_usage.as_ref().and_then(|u| u.get("total_tokens")) {
                if let Some(tokens) = n.as_u64() {
                    usage.total_tokens += tokens;
                }
            }
        }

        if aborted {
            self.emit(SubagentEvent::RoundEnd { round });
            return;
        }

        if !function_calls.is_empty() {
            self.dispatch_tool_calls(function_calls).await;
        }

        let trimmed = text_buffer.trim();
        if !trimmed.is_empty() {
            self.emit_session(SessionEvent::SubagentMessageToUser {
                text_chunk: None,
                final_text: Some(trimmed.to_string()),
            });
        }

        self.emit(SubagentEvent::RoundEnd { round });
    }

    async fn dispatch_tool_calls(&self, calls: Vec<FunctionCall>) {
        for call in calls {
            let call_id = call.call_id.clone();
            self.emit(SubagentEvent::ToolCall {
                name: call.name.clone(),
                call_id: call_id.clone(),
            });

            let result = self.tool_registry.dispatch(call).await;

            self.emit(SubagentEvent::ToolResult {
                call_id: result.call_id,
                success: result.success,
                summary: result.summary,
            });
        }
    }
}

impl<C, T> ScopeControl for InteractiveSubagentScope<C, T>
where
    C: ChatClient + 'static,
    T: ToolRegistry + 'static,
{
    /// Appends to the internal queue. The blocked `recv()` in
    /// `run_interactive`'s loop wakes as soon as a message lands, so a
    /// message enqueued while idle is picked up without a separate
    /// "trigger the processor" step.
    fn enqueue_user_message(&self, text: String) {
        self.emit_session(SessionEvent::UserMessageToSession { text: text.clone() });
        let _ = self.sender.send(text);
    }

    /// Cancels only the in-flight round; the session stays alive and keeps
    /// draining its queue afterwards (spec §5).
    fn cancel_current_message(&self) {
        self.round_cancel.lock().unwrap().cancel();
    }
}
