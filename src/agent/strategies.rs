//! Chain-of-thought and tree-of-thoughts runs. Both reason without tools
//! first, then share a decide / act once / answer tail that uses the same
//! gateway, registry and step bound as the ReAct loop.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::context::{ReasoningStep, WorkingContext};
use crate::agent::engine::{Engine, LoopResult, Run};
use crate::error::LoopErrorKind;
use crate::models::ModelOutput;
use crate::settings::LoopConfig;

/// Upper bounds on the tree search, whatever a request asks for.
pub const MAX_TOT_BRANCHES: usize = 5;
pub const MAX_TOT_DEPTH: usize = 3;
pub const MAX_COT_THOUGHTS: usize = 10;

/// Score used when an evaluation carries no readable number.
pub const DEFAULT_SCORE: f64 = 5.0;

fn chain_prompt(thoughts: usize) -> String {
    format!(
        "Before acting, think through the user's latest message step by step. \
         Put your reasoning in final_answer as at most {thoughts} lines of the form \
         \"Step 1: ...\", \"Step 2: ...\". Do not answer the question yet."
    )
}

fn branch_prompt(branches: usize, level: usize) -> String {
    format!(
        "Propose {branches} distinct approaches for the next reasoning step (level {level}) \
         toward answering the user's latest message, building on the thoughts so far. \
         Put them in final_answer as a JSON array of {branches} short strings."
    )
}

const EVALUATE_PROMPT: &str = "Rate how promising the most recent thought is for answering the user's \
latest message. Put a JSON object in final_answer: {\"score\": <0-10>, \"evaluation\": \"<one sentence>\"}.";

const ACT_SUFFIX: &str = "Use the reasoning above. Either give the final answer now, or call exactly one tool \
if you still need information; you will not get a second tool call.";

const ANSWER_PROMPT: &str = "Give the final answer to the user's latest message, using the reasoning and any \
tool observation above.";

fn step_marker_re() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"^(?i:step\s*\d+\s*[:.)-]|\d+\s*[.)])\s*").ok()).as_ref()
}

fn number_re() -> Option<&'static Regex> {
    static NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").ok()).as_ref()
}

/// Splits a numbered chain into thoughts, keeping at most `max`. Lines without
/// a marker continue the current thought; text with no markers at all is a
/// single thought.
pub fn parse_thought_chain(text: &str, max: usize) -> Vec<String> {
    let mut thoughts: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let marker = step_marker_re().and_then(|re| re.find(line));
        match marker {
            Some(m) => {
                if !current.is_empty() {
                    thoughts.push(std::mem::take(&mut current));
                }
                current.push_str(line[m.end()..].trim());
            }
            None => {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(line);
            }
        }
    }
    if !current.is_empty() {
        thoughts.push(current);
    }
    thoughts.retain(|t| !t.is_empty());
    thoughts.truncate(max);
    thoughts
}

/// Reads up to `n` candidate thoughts from a JSON array of strings, falling
/// back to one candidate per non-empty line.
pub fn parse_branches(text: &str, n: usize) -> Vec<String> {
    let from_json = match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str::<Vec<Value>>(&text[start..=end]).ok(),
        _ => None,
    };
    let mut branches: Vec<String> = match from_json {
        Some(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        None => text
            .lines()
            .map(|l| {
                let l = l.trim().trim_start_matches(['-', '*']).trim();
                step_marker_re().map(|re| re.replace(l, "").into_owned()).unwrap_or_else(|| l.to_string())
            })
            .collect(),
    };
    branches.retain(|b| !b.trim().is_empty());
    branches.truncate(n);
    branches
}

/// Reads a 0-10 score from `{"score": ..}`, a bare number, or the first number
/// in free text. Unreadable evaluations score [`DEFAULT_SCORE`].
pub fn parse_score(text: &str) -> f64 {
    let trimmed = text.trim();
    let structured = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str::<Value>(&trimmed[start..=end])
            .ok()
            .and_then(|v| match v.get("score") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse().ok(),
                _ => None,
            }),
        _ => None,
    };
    let score = structured
        .or_else(|| number_re().and_then(|re| re.find(trimmed)).and_then(|m| m.as_str().parse().ok()))
        .filter(|s: &f64| s.is_finite())
        .unwrap_or(DEFAULT_SCORE);
    score.clamp(0.0, 10.0)
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    thought: String,
    score: f64,
}

impl Engine {
    pub(super) async fn chain_of_thought(
        &self,
        session_id: &str,
        mut ctx: WorkingContext,
        config: &LoopConfig,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> LoopResult {
        let limit = config.cot_thoughts.clamp(1, MAX_COT_THOUGHTS);
        let chain = match self.think(&mut ctx, &chain_prompt(limit), &[], config, cancel, run).await {
            Ok(ModelOutput::FinalAnswer(text)) => parse_thought_chain(&text, limit),
            Ok(ModelOutput::ToolCall(call)) => {
                warn!(tool = %call.name, "tool call while no tools were offered");
                return LoopResult::Failed(LoopErrorKind::ParseError);
            }
            Err(kind) => return LoopResult::Failed(kind),
        };
        debug!(thoughts = chain.len(), "thought chain ready");
        let mut trail = Vec::with_capacity(chain.len() + 1);
        for thought in chain {
            let step = ReasoningStep::thinking(thought);
            ctx.push(step.clone());
            trail.push(step);
        }
        self.act_once(session_id, ctx, trail, config, cancel, run).await
    }

    /// Greedy tree search: each level proposes `tot_branches` candidates,
    /// scores every one of them, and keeps only the best before descending.
    pub(super) async fn tree_of_thoughts(
        &self,
        session_id: &str,
        mut ctx: WorkingContext,
        config: &LoopConfig,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> LoopResult {
        let branches = config.tot_branches.clamp(1, MAX_TOT_BRANCHES);
        let depth = config.tot_depth.clamp(1, MAX_TOT_DEPTH);
        let mut trail = Vec::with_capacity(depth + 1);

        for level in 1..=depth {
            let proposals = match self.think(&mut ctx, &branch_prompt(branches, level), &[], config, cancel, run).await {
                Ok(ModelOutput::FinalAnswer(text)) => parse_branches(&text, branches),
                Ok(ModelOutput::ToolCall(call)) => {
                    warn!(tool = %call.name, "tool call while no tools were offered");
                    return LoopResult::Failed(LoopErrorKind::ParseError);
                }
                Err(kind) => return LoopResult::Failed(kind),
            };
            if proposals.is_empty() {
                info!(level, "no branches proposed; stopping the search");
                break;
            }

            let mut best: Option<Candidate> = None;
            for thought in proposals {
                let mut scratch = ctx.clone();
                scratch.push(ReasoningStep::thinking(thought.clone()));
                let score = match self.think(&mut scratch, EVALUATE_PROMPT, &[], config, cancel, run).await {
                    Ok(ModelOutput::FinalAnswer(text)) => parse_score(&text),
                    Ok(ModelOutput::ToolCall(call)) => {
                        warn!(tool = %call.name, "tool call while no tools were offered");
                        return LoopResult::Failed(LoopErrorKind::ParseError);
                    }
                    Err(kind) => return LoopResult::Failed(kind),
                };
                debug!(level, score, "scored branch");
                // ties keep the earlier proposal
                match &best {
                    Some(b) if b.score >= score => {}
                    _ => best = Some(Candidate { thought, score }),
                }
            }
            let Some(chosen) = best else { break };
            info!(level, score = chosen.score, "selected branch");
            let step = ReasoningStep::thinking(chosen.thought);
            ctx.push(step.clone());
            trail.push(step);
        }
        self.act_once(session_id, ctx, trail, config, cancel, run).await
    }

    /// Offers the tools once. A direct answer finishes the run; a tool call is
    /// executed (if the step bound allows) and followed by an answer-only call.
    async fn act_once(
        &self,
        session_id: &str,
        mut ctx: WorkingContext,
        mut trail: Vec<ReasoningStep>,
        config: &LoopConfig,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> LoopResult {
        let prompt = format!("{}\n\n{}", self.system_prompt(), ACT_SUFFIX);
        let call = match self.think(&mut ctx, &prompt, self.tool_specs(), config, cancel, run).await {
            Ok(ModelOutput::FinalAnswer(text)) => return self.finalize(session_id, text, config, run).await,
            Ok(ModelOutput::ToolCall(call)) => call,
            Err(kind) => return LoopResult::Failed(kind),
        };
        if run.step_count >= config.max_steps {
            info!(tool = %call.name, "step budget spent; not executing the tool call");
            return LoopResult::Exhausted(trail);
        }
        match self.execute_tool(session_id, call, config, run).await {
            Ok(step) => {
                ctx.push(step.clone());
                trail.push(step);
            }
            Err(kind) => return LoopResult::Failed(kind),
        }

        let prompt = format!("{}\n\n{}", self.system_prompt(), ANSWER_PROMPT);
        match self.think(&mut ctx, &prompt, &[], config, cancel, run).await {
            Ok(ModelOutput::FinalAnswer(text)) => self.finalize(session_id, text, config, run).await,
            Ok(ModelOutput::ToolCall(call)) => {
                warn!(tool = %call.name, "second tool call after the single action");
                LoopResult::Failed(LoopErrorKind::ParseError)
            }
            Err(kind) => LoopResult::Failed(kind),
        }
    }
}
