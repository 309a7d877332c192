use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::context::{ReasoningStep, StepAction, WorkingContext};
use crate::agent::tools::{ToolContext, ToolRegistry, ToolResult, ToolSpec};
use crate::embedding::Embedder;
use crate::error::{GatewayError, LoopErrorKind, StoreError};
use crate::insights::{self, RelatedSession};
use crate::models::{CompletionRequest, ModelGateway, ModelOutput, ToolCallRequest};
use crate::session::Turn;
use crate::settings::{LoopConfig, ReasoningStrategy, StoreFailurePolicy};
use crate::storage::MemoryStore;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that reasons step by step. \
Think about what you need, call a tool when it helps, read the observation it returns, \
and give the final answer once you have enough information.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Start,
    Thinking,
    ToolExecuting,
    Finalizing,
    Done,
    Exhausted,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopResult {
    Answer(String),
    /// Step budget ran out; carries the steps taken so far.
    Exhausted(Vec<ReasoningStep>),
    Failed(LoopErrorKind),
}

impl LoopResult {
    fn outcome(&self) -> &'static str {
        match self {
            LoopResult::Answer(_) => "answer",
            LoopResult::Exhausted(_) => "exhausted",
            LoopResult::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub result: LoopResult,
    pub step_count: usize,
    pub gateway_calls: usize,
    pub states: Vec<LoopState>,
    /// Set when a memory write failed and the run continued in-memory only.
    pub degraded: bool,
}

pub(super) struct Run {
    states: Vec<LoopState>,
    pub(super) step_count: usize,
    gateway_calls: usize,
    degraded: bool,
}

impl Run {
    fn new() -> Self {
        Self { states: vec![LoopState::Start], step_count: 0, gateway_calls: 0, degraded: false }
    }

    pub(super) fn enter(&mut self, state: LoopState) {
        debug!(?state, step = self.step_count, "transition");
        self.states.push(state);
    }

    fn finish(mut self, result: LoopResult) -> LoopReport {
        let terminal = match &result {
            LoopResult::Answer(_) => LoopState::Done,
            LoopResult::Exhausted(_) => LoopState::Exhausted,
            LoopResult::Failed(_) => LoopState::Failed,
        };
        self.enter(terminal);
        metrics::counter!("agent_loop_runs_total", "outcome" => result.outcome()).increment(1);
        match &result {
            LoopResult::Failed(kind) => warn!(%kind, steps = self.step_count, "loop failed"),
            _ => info!(outcome = result.outcome(), steps = self.step_count, gateway_calls = self.gateway_calls, "loop finished"),
        }
        LoopReport {
            result,
            step_count: self.step_count,
            gateway_calls: self.gateway_calls,
            states: self.states,
            degraded: self.degraded,
        }
    }
}

/// Runs the reasoning loop (ReAct, chain-of-thought or tree-of-thoughts) for
/// one session at a time. Shared across sessions; holds no per-run state.
pub struct Engine {
    gateway: Arc<dyn ModelGateway>,
    tools: Arc<ToolRegistry>,
    tool_specs: Vec<ToolSpec>,
    memory: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    system_prompt: String,
}

impl Engine {
    pub fn new(gateway: Arc<dyn ModelGateway>, tools: Arc<ToolRegistry>, memory: Arc<dyn MemoryStore>, embedder: Arc<dyn Embedder>) -> Self {
        let tool_specs = tools.specs();
        Self { gateway, tools, tool_specs, memory, embedder, system_prompt: DEFAULT_SYSTEM_PROMPT.to_string() }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.tool_specs
    }

    pub fn memory(&self) -> &dyn MemoryStore {
        self.memory.as_ref()
    }

    pub async fn history(&self, session_id: &str, n: usize) -> Result<Vec<Turn>, StoreError> {
        self.memory.recent(session_id, n).await
    }

    pub async fn search_memory(&self, session_id: &str, query: &str, k: usize) -> Result<Vec<Turn>, StoreError> {
        let embedding = self.embedder.embed(query);
        self.memory.search(session_id, &embedding, k).await
    }

    pub async fn session_summary(&self, session_id: &str, max_length: usize) -> Result<String, StoreError> {
        insights::session_summary(self.memory.as_ref(), session_id, max_length).await
    }

    pub async fn related_sessions(&self, session_id: &str, limit: usize) -> Result<Vec<RelatedSession>, StoreError> {
        insights::related_sessions(self.memory.as_ref(), self.embedder.as_ref(), session_id, limit).await
    }

    pub async fn run_loop(&self, session_id: &str, user_message: &str, config: &LoopConfig) -> LoopReport {
        self.run_loop_with_cancel(session_id, user_message, config, &CancellationToken::new()).await
    }

    #[instrument(skip(self, user_message, config, cancel), fields(max_steps = config.max_steps, strategy = ?config.strategy))]
    pub async fn run_loop_with_cancel(&self, session_id: &str, user_message: &str, config: &LoopConfig, cancel: &CancellationToken) -> LoopReport {
        let mut run = Run::new();
        if cancel.is_cancelled() {
            return run.finish(LoopResult::Failed(LoopErrorKind::Cancelled));
        }
        let ctx = match self.open_context(session_id, user_message, config, &mut run).await {
            Ok(ctx) => ctx,
            Err(kind) => return run.finish(LoopResult::Failed(kind)),
        };
        let result = match config.strategy {
            ReasoningStrategy::React => self.react(session_id, ctx, config, cancel, &mut run).await,
            ReasoningStrategy::ChainOfThought => self.chain_of_thought(session_id, ctx, config, cancel, &mut run).await,
            ReasoningStrategy::TreeOfThoughts => self.tree_of_thoughts(session_id, ctx, config, cancel, &mut run).await,
        };
        run.finish(result)
    }

    /// Persists the user turn and seeds the working context from recent history.
    async fn open_context(&self, session_id: &str, user_message: &str, config: &LoopConfig, run: &mut Run) -> Result<WorkingContext, LoopErrorKind> {
        let user_turn = Turn::user(user_message);
        if let Err(e) = self.memory.append(session_id, user_turn.clone()).await {
            self.on_store_failure(run, config, e)?;
        }
        let mut seed = match self.memory.recent(session_id, config.context_window_turns).await {
            Ok(turns) => turns,
            Err(e) => {
                self.on_store_failure(run, config, e)?;
                Vec::new()
            }
        };
        if !seed.contains(&user_turn) {
            seed.push(user_turn);
        }
        Ok(WorkingContext::new(seed))
    }

    async fn react(&self, session_id: &str, mut ctx: WorkingContext, config: &LoopConfig, cancel: &CancellationToken, run: &mut Run) -> LoopResult {
        let mut trail: Vec<ReasoningStep> = Vec::new();
        loop {
            let output = match self.think(&mut ctx, &self.system_prompt, &self.tool_specs, config, cancel, run).await {
                Ok(o) => o,
                Err(kind) => return LoopResult::Failed(kind),
            };
            match output {
                ModelOutput::FinalAnswer(text) => return self.finalize(session_id, text, config, run).await,
                ModelOutput::ToolCall(call) => {
                    if run.step_count >= config.max_steps {
                        info!(tool = %call.name, "step budget spent; not executing further tool calls");
                        return LoopResult::Exhausted(trail);
                    }
                    match self.execute_tool(session_id, call, config, run).await {
                        Ok(step) => {
                            ctx.push(step.clone());
                            trail.push(step);
                        }
                        Err(kind) => return LoopResult::Failed(kind),
                    }
                }
            }
        }
    }

    /// Trims `ctx` to budget and makes one model call with `prompt` and
    /// `tools`. Cancellation is checked on both sides of the call.
    pub(super) async fn think(
        &self,
        ctx: &mut WorkingContext,
        prompt: &str,
        tools: &[ToolSpec],
        config: &LoopConfig,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<ModelOutput, LoopErrorKind> {
        if cancel.is_cancelled() {
            return Err(LoopErrorKind::Cancelled);
        }
        let evicted = ctx.fit_to_budget(prompt, config.context_token_budget);
        if evicted > 0 {
            debug!(evicted, "trimmed working context to budget");
        }
        run.enter(LoopState::Thinking);
        let output = self.complete_with_retries(ctx, prompt, tools, config, cancel, run).await?;
        if cancel.is_cancelled() {
            return Err(LoopErrorKind::Cancelled);
        }
        Ok(output)
    }

    /// One model call with bounded retries on transport failure. Malformed
    /// output is never retried.
    async fn complete_with_retries(
        &self,
        ctx: &WorkingContext,
        prompt: &str,
        tools: &[ToolSpec],
        config: &LoopConfig,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<ModelOutput, LoopErrorKind> {
        let history = ctx.to_messages();
        let mut retries = 0u32;
        loop {
            run.gateway_calls += 1;
            let req = CompletionRequest {
                system_prompt: prompt,
                history: &history,
                tools,
                timeout: config.gateway_timeout(),
            };
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(LoopErrorKind::Cancelled),
                r = tokio::time::timeout(config.gateway_timeout(), self.gateway.complete(req)) => {
                    r.unwrap_or_else(|_| Err(GatewayError::timeout(format!("no reply within {}ms", config.gateway_timeout_ms))))
                }
            };
            match res {
                Ok(output) => return Ok(output),
                Err(GatewayError::MalformedOutput(msg)) => {
                    error!(error = %msg, "model output could not be parsed");
                    return Err(LoopErrorKind::ParseError);
                }
                Err(GatewayError::Unavailable { reason, message }) => {
                    if retries >= config.max_gateway_retries {
                        error!(?reason, error = %message, attempts = retries + 1, "model gateway unavailable");
                        return Err(LoopErrorKind::GatewayUnavailable);
                    }
                    retries += 1;
                    let delay = config.backoff_for(retries);
                    warn!(?reason, error = %message, attempt = retries, ?delay, "retrying model gateway");
                    metrics::counter!("agent_loop_gateway_retries_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LoopErrorKind::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Runs one tool call, persists the tool turn and counts the step. Tool
    /// failures come back as observations, never as errors.
    pub(super) async fn execute_tool(&self, session_id: &str, call: ToolCallRequest, config: &LoopConfig, run: &mut Run) -> Result<ReasoningStep, LoopErrorKind> {
        run.enter(LoopState::ToolExecuting);
        let tctx = ToolContext { session_id, memory: self.memory.as_ref(), embedder: self.embedder.as_ref() };
        let result = match self.tools.invoke(&call.name, call.arguments.clone(), tctx).await {
            Ok(r) => r,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool call rejected");
                ToolResult::from_tool_error(&e)
            }
        };
        metrics::counter!("agent_loop_tool_calls_total", "tool" => call.name.clone(), "success" => if result.success { "true" } else { "false" }).increment(1);
        let observation = result.observation();
        if let Err(e) = self.memory.append(session_id, Turn::tool(call.name.clone(), call.arguments.clone(), result)).await {
            self.on_store_failure(run, config, e)?;
        }
        run.step_count += 1;
        Ok(ReasoningStep {
            thought: call.thought,
            action: StepAction::ToolCall { name: call.name, arguments: call.arguments },
            observation: Some(observation),
        })
    }

    pub(super) async fn finalize(&self, session_id: &str, text: String, config: &LoopConfig, run: &mut Run) -> LoopResult {
        run.enter(LoopState::Finalizing);
        if let Err(e) = self.memory.append(session_id, Turn::assistant(text.clone())).await {
            if let Err(kind) = self.on_store_failure(run, config, e) {
                return LoopResult::Failed(kind);
            }
        }
        LoopResult::Answer(text)
    }

    pub(super) fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn on_store_failure(&self, run: &mut Run, config: &LoopConfig, err: StoreError) -> Result<(), LoopErrorKind> {
        match config.store_failure {
            StoreFailurePolicy::Abort => {
                error!(error = %err, "memory store unavailable");
                Err(LoopErrorKind::StoreUnavailable)
            }
            StoreFailurePolicy::Degrade => {
                warn!(error = %err, "memory store unavailable; continuing in-memory");
                run.degraded = true;
                Ok(())
            }
        }
    }
}
