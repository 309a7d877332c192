use serde::{Deserialize, Serialize};

use crate::embedding::{Embedder, cosine_similarity};
use crate::error::StoreError;
use crate::session::{Role, Turn};
use crate::storage::MemoryStore;

pub const DEFAULT_SUMMARY_LENGTH: usize = 500;
pub const DEFAULT_RELATED_LIMIT: usize = 5;

/// Turns read when summarizing a session or describing it for comparison.
const SUMMARY_WINDOW: usize = 200;
const PROFILE_WINDOW: usize = 20;
const TOPIC_WORDS: usize = 5;
const LISTED_TOPICS: usize = 5;

/// One-line digest of a session: how many user messages it holds and the
/// opening words of the first few, cut to `max_length` characters.
pub async fn session_summary(memory: &dyn MemoryStore, session_id: &str, max_length: usize) -> Result<String, StoreError> {
    let turns = memory.recent(session_id, SUMMARY_WINDOW).await?;
    let topics: Vec<String> = turns
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.text().split_whitespace().take(TOPIC_WORDS).collect::<Vec<_>>().join(" "))
        .collect();
    if topics.is_empty() {
        return Ok("No conversation history found.".to_string());
    }
    let listed: Vec<&str> = topics.iter().take(LISTED_TOPICS).map(String::as_str).collect();
    let summary = format!("Discussed {} topics: {}", topics.len(), listed.join(", "));
    Ok(truncate_chars(&summary, max_length))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedSession {
    pub session_id: String,
    pub score: f32,
    /// The turn of that session closest to this one.
    pub turn: Turn,
}

/// Other sessions ranked by how close their best-matching turn is to the
/// recent user messages in `session_id`. Sessions with nothing in common are
/// left out; equal scores keep the more recently active session first.
pub async fn related_sessions(
    memory: &dyn MemoryStore,
    embedder: &dyn Embedder,
    session_id: &str,
    limit: usize,
) -> Result<Vec<RelatedSession>, StoreError> {
    let profile: Vec<String> = memory
        .recent(session_id, PROFILE_WINDOW)
        .await?
        .iter()
        .filter(|t| t.role == Role::User)
        .map(Turn::text)
        .collect();
    if profile.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let query = embedder.embed(&profile.join("\n"));

    let mut related = Vec::new();
    for other in memory.sessions().await? {
        if other == session_id {
            continue;
        }
        let Some(turn) = memory.search(&other, &query, 1).await?.into_iter().next() else { continue };
        let score = cosine_similarity(&query, &embedder.embed(&turn.text()));
        if score > 0.0 {
            related.push(RelatedSession { session_id: other, score, turn });
        }
    }
    related.sort_by(|a, b| b.score.total_cmp(&a.score));
    related.truncate(limit);
    Ok(related)
}
