use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::models::{ChatMessage, ChatRole};
use crate::session::{Role, Turn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    ToolCall { name: String, arguments: Value },
    /// Reasoning only; nothing was executed.
    Think,
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub thought: Option<String>,
    pub action: StepAction,
    pub observation: Option<String>,
}

impl ReasoningStep {
    pub fn thinking(thought: impl Into<String>) -> Self {
        Self { thought: Some(thought.into()), action: StepAction::Think, observation: None }
    }
}

const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Rough token count: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The view of history handed to one model call. Seed turns are never evicted.
#[derive(Debug, Clone, Default)]
pub struct WorkingContext {
    seed: Vec<Turn>,
    steps: Vec<ReasoningStep>,
}

impl WorkingContext {
    pub fn new(seed: Vec<Turn>) -> Self {
        Self { seed, steps: Vec::new() }
    }

    pub fn seed(&self) -> &[Turn] {
        &self.seed
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    pub fn push(&mut self, step: ReasoningStep) {
        self.steps.push(step);
    }

    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.seed.len() + self.steps.len() * 2);
        for t in &self.seed {
            out.push(match t.role {
                Role::User => ChatMessage::new(ChatRole::User, t.text()),
                Role::Assistant => ChatMessage::new(ChatRole::Assistant, t.text()),
                Role::Tool => {
                    let name = t.tool.as_ref().map(|c| c.name.as_str()).unwrap_or("tool");
                    ChatMessage::new(ChatRole::Tool, format!("{} -> {}", name, t.text()))
                }
            });
        }
        for s in &self.steps {
            match &s.action {
                StepAction::ToolCall { name, arguments } => {
                    let mut call = Map::new();
                    if let Some(t) = &s.thought {
                        call.insert("thought".into(), Value::String(t.clone()));
                    }
                    call.insert("action".into(), Value::String(name.clone()));
                    call.insert("arguments".into(), arguments.clone());
                    out.push(ChatMessage::new(ChatRole::Assistant, Value::Object(call).to_string()));
                }
                StepAction::Think => {
                    if let Some(t) = &s.thought {
                        out.push(ChatMessage::new(ChatRole::Assistant, json!({ "thought": t }).to_string()));
                    }
                }
                StepAction::Finalize => {}
            }
            if let Some(obs) = &s.observation {
                out.push(ChatMessage::new(ChatRole::Tool, obs.clone()));
            }
        }
        out
    }

    pub fn estimated_tokens(&self, system_prompt: &str) -> usize {
        estimate_tokens(system_prompt)
            + self.to_messages().iter().map(|m| estimate_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS).sum::<usize>()
    }

    /// Evicts from the oldest steps until the estimate fits `budget`:
    /// observations first, then thoughts, then whole steps. The newest step is
    /// kept intact. Returns the number of evictions; an unreachable budget is
    /// not an error.
    pub fn fit_to_budget(&mut self, system_prompt: &str, budget: usize) -> usize {
        let mut evicted = 0;
        while self.estimated_tokens(system_prompt) > budget {
            if !self.evict_one() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn evict_one(&mut self) -> bool {
        let Some(older) = self.steps.len().checked_sub(1) else { return false };
        if let Some(s) = self.steps[..older].iter_mut().find(|s| s.observation.is_some()) {
            s.observation = None;
            return true;
        }
        if let Some(s) = self.steps[..older].iter_mut().find(|s| s.thought.is_some()) {
            s.thought = None;
            return true;
        }
        if older > 0 {
            self.steps.remove(0);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(i: usize) -> ReasoningStep {
        ReasoningStep {
            thought: Some(format!("thought number {} {}", i, "x".repeat(40))),
            action: StepAction::ToolCall { name: "calculator".into(), arguments: json!({"expr": format!("{}+1", i)}) },
            observation: Some(format!("observation {} {}", i, "y".repeat(80))),
        }
    }

    fn ctx_with(n: usize) -> WorkingContext {
        let mut ctx = WorkingContext::new(vec![Turn::user("question")]);
        for i in 0..n {
            ctx.push(step(i));
        }
        ctx
    }

    #[test]
    fn renders_seed_then_steps() {
        let ctx = ctx_with(1);
        let msgs = ctx.to_messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, ChatRole::User);
        assert_eq!(msgs[1].role, ChatRole::Assistant);
        let call: Value = serde_json::from_str(&msgs[1].content).unwrap();
        assert_eq!(call["action"], json!("calculator"));
        assert_eq!(msgs[2].role, ChatRole::Tool);
    }

    #[test]
    fn within_budget_nothing_is_evicted() {
        let mut ctx = ctx_with(3);
        assert_eq!(ctx.fit_to_budget("sys", 100_000), 0);
        assert!(ctx.steps().iter().all(|s| s.observation.is_some() && s.thought.is_some()));
    }

    #[test]
    fn observations_go_before_thoughts_oldest_first() {
        let mut ctx = ctx_with(3);
        let full = ctx.estimated_tokens("sys");
        // one observation's worth of room less than the full context
        let evicted = ctx.fit_to_budget("sys", full - 10);
        assert_eq!(evicted, 1);
        assert!(ctx.steps()[0].observation.is_none());
        assert!(ctx.steps()[0].thought.is_some());
        assert!(ctx.steps()[1].observation.is_some());
    }

    #[test]
    fn eviction_order_is_deterministic_and_keeps_newest_and_seed() {
        let mut ctx = ctx_with(3);
        ctx.fit_to_budget("sys", 0);
        // everything evictable is gone; seed and newest step survive
        assert_eq!(ctx.seed().len(), 1);
        assert_eq!(ctx.steps().len(), 1);
        assert_eq!(ctx.steps()[0], step(2));

        let mut a = ctx_with(4);
        let mut b = ctx_with(4);
        let budget = a.estimated_tokens("sys") / 2;
        assert_eq!(a.fit_to_budget("sys", budget), b.fit_to_budget("sys", budget));
        assert_eq!(a.steps(), b.steps());
        assert!(a.estimated_tokens("sys") <= budget);
    }

    #[test]
    fn thoughts_evicted_after_all_older_observations() {
        let mut ctx = ctx_with(3);
        let mut stripped = ctx.clone();
        stripped.steps[0].observation = None;
        stripped.steps[1].observation = None;
        let budget = stripped.estimated_tokens("sys") - 1;
        ctx.fit_to_budget("sys", budget);
        assert!(ctx.steps()[0].observation.is_none());
        assert!(ctx.steps()[1].observation.is_none());
        assert!(ctx.steps()[0].thought.is_none());
        assert!(ctx.steps()[1].thought.is_some());
        assert!(ctx.steps()[2].observation.is_some());
    }

    #[test]
    fn thinking_steps_render_as_assistant_thoughts() {
        let mut ctx = WorkingContext::new(vec![Turn::user("question")]);
        ctx.push(ReasoningStep::thinking("split the problem"));
        ctx.push(step(0));
        let msgs = ctx.to_messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].role, ChatRole::Assistant);
        let v: Value = serde_json::from_str(&msgs[1].content).unwrap();
        assert_eq!(v, json!({"thought": "split the problem"}));

        // an evicted thought leaves nothing to render
        ctx.fit_to_budget("sys", 0);
        assert_eq!(ctx.steps().len(), 1);
        assert_eq!(ctx.to_messages().len(), 3);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
