use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::embedding::{Embedder, HashingEmbedder, cosine_similarity};
use crate::error::StoreError;
use crate::session::{Role, ToolCallRecord, Turn, TurnContent};

// applied to every pooled connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Append-only, per-session conversation log.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append(&self, session_id: &str, turn: Turn) -> Result<(), StoreError>;
    /// Up to `n` most recent turns, oldest first. Unknown sessions yield an empty list.
    async fn recent(&self, session_id: &str, n: usize) -> Result<Vec<Turn>, StoreError>;
    /// Up to `k` turns by descending similarity; equal scores favour the newer turn.
    async fn search(&self, session_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<Turn>, StoreError>;
    /// Session ids, most recently active first.
    async fn sessions(&self) -> Result<Vec<String>, StoreError>;
    async fn count(&self, session_id: &str) -> Result<usize, StoreError>;
}

fn rank_by_similarity<T>(candidates: Vec<(T, u64, f32)>, k: usize) -> Vec<T> {
    let mut scored = candidates;
    scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(b.1.cmp(&a.1)));
    scored.into_iter().take(k).map(|(t, _, _)| t).collect()
}

struct StoredTurn {
    seq: u64,
    turn: Turn,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct SessionLog {
    turns: Vec<StoredTurn>,
}

/// Each session owns its own lock, so appends to one session never wait on another.
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionLog>>>>,
    embedder: Arc<dyn Embedder>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), embedder, seq: AtomicU64::new(0) }
    }

    async fn log(&self, session_id: &str) -> Option<Arc<Mutex<SessionLog>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn log_or_create(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        if let Some(log) = self.log(session_id).await {
            return log;
        }
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_default().clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn append(&self, session_id: &str, turn: Turn) -> Result<(), StoreError> {
        let embedding = self.embedder.embed(&turn.text());
        let log = self.log_or_create(session_id).await;
        let mut log = log.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        log.turns.push(StoredTurn { seq, turn, embedding });
        Ok(())
    }

    async fn recent(&self, session_id: &str, n: usize) -> Result<Vec<Turn>, StoreError> {
        let Some(log) = self.log(session_id).await else { return Ok(Vec::new()) };
        let log = log.lock().await;
        let start = log.turns.len().saturating_sub(n);
        Ok(log.turns[start..].iter().map(|s| s.turn.clone()).collect())
    }

    async fn search(&self, session_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<Turn>, StoreError> {
        let Some(log) = self.log(session_id).await else { return Ok(Vec::new()) };
        let log = log.lock().await;
        let candidates = log
            .turns
            .iter()
            .map(|s| (s.turn.clone(), s.seq, cosine_similarity(query_embedding, &s.embedding)))
            .collect();
        Ok(rank_by_similarity(candidates, k))
    }

    async fn sessions(&self) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut active = Vec::with_capacity(sessions.len());
        for (id, log) in sessions.iter() {
            let last = log.lock().await.turns.last().map(|s| s.seq);
            if let Some(last) = last {
                active.push((id.clone(), last));
            }
        }
        active.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(active.into_iter().map(|(id, _)| id).collect())
    }

    async fn count(&self, session_id: &str) -> Result<usize, StoreError> {
        match self.log(session_id).await {
            Some(log) => Ok(log.lock().await.turns.len()),
            None => Ok(0),
        }
    }
}

#[derive(Clone)]
pub struct SqliteMemoryStore {
    pool: Pool<Sqlite>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteMemoryStore {
    pub async fn initialize(database_url: Option<String>, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(%url, "memory store ready");
        Ok(Self { pool, embedder })
    }

    /// Shared with the other SQLite-backed stores of the service.
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("agent_loop");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("memory.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn turn_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let role: String = r.try_get("role")?;
    let role = Role::parse(&role).ok_or_else(|| StoreError::Unavailable(format!("corrupt record: unknown role {}", role)))?;
    let content: TurnContent = serde_json::from_str(&r.try_get::<String, _>("content_json")?)?;
    let tool: Option<ToolCallRecord> = match r.try_get::<Option<String>, _>("tool_json")? {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };
    let created_at: String = r.try_get("created_at")?;
    let timestamp = DateTime::parse_from_rfc3339(&created_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt record: {}", e)))?;
    Ok(Turn { role, content, timestamp, tool })
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn append(&self, session_id: &str, turn: Turn) -> Result<(), StoreError> {
        let embedding = serde_json::to_string(&self.embedder.embed(&turn.text()))?;
        let content_json = serde_json::to_string(&turn.content)?;
        let tool_json = turn.tool.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query("INSERT INTO turns (session_id, role, content_json, tool_json, embedding_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)")
            .bind(session_id)
            .bind(turn.role.as_str())
            .bind(content_json)
            .bind(tool_json)
            .bind(embedding)
            .bind(turn.timestamp.to_rfc3339())
            .execute(&self.pool).await?;
        debug!(session_id, role = turn.role.as_str(), "turn appended");
        Ok(())
    }

    async fn recent(&self, session_id: &str, n: usize) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query("SELECT role, content_json, tool_json, created_at FROM turns WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2")
            .bind(session_id)
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .fetch_all(&self.pool).await?;
        let mut turns = rows.iter().map(turn_from_row).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn search(&self, session_id: &str, query_embedding: &[f32], k: usize) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query("SELECT id, role, content_json, tool_json, embedding_json, created_at FROM turns WHERE session_id = ?1")
            .bind(session_id)
            .fetch_all(&self.pool).await?;
        let mut candidates = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: i64 = r.try_get("id")?;
            let embedding: Vec<f32> = serde_json::from_str(&r.try_get::<String, _>("embedding_json")?)?;
            let score = cosine_similarity(query_embedding, &embedding);
            candidates.push((turn_from_row(r)?, id as u64, score));
        }
        Ok(rank_by_similarity(candidates, k))
    }

    async fn sessions(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT session_id, MAX(id) AS last_id FROM turns GROUP BY session_id ORDER BY last_id DESC")
            .fetch_all(&self.pool).await?;
        rows.iter().map(|r| r.try_get::<String, _>("session_id").map_err(StoreError::from)).collect()
    }

    async fn count(&self, session_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT count(*) AS c FROM turns WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool).await?;
        let c: i64 = row.try_get("c")?;
        Ok(c as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{ToolOutput, ToolResult};
    use serde_json::json;
    use tempfile::tempdir;

    async fn sqlite_store(dir: &tempfile::TempDir) -> SqliteMemoryStore {
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        SqliteMemoryStore::initialize(Some(url), Arc::new(HashingEmbedder::default())).await.unwrap()
    }

    async fn exercise_contract(store: &dyn MemoryStore) {
        assert!(store.recent("missing", 5).await.unwrap().is_empty());
        assert!(store.search("missing", &[1.0], 5).await.unwrap().is_empty());

        let first = Turn::user("book the dentist appointment");
        store.append("s1", first.clone()).await.unwrap();
        assert_eq!(store.recent("s1", 1).await.unwrap(), vec![first.clone()]);

        let tool_turn = Turn::tool("calculator", json!({"expr": "2+2"}), ToolResult::ok(ToolOutput::text("4")));
        store.append("s1", tool_turn.clone()).await.unwrap();
        let last = Turn::assistant("done");
        store.append("s1", last.clone()).await.unwrap();
        store.append("s2", Turn::user("other session")).await.unwrap();

        let recent = store.recent("s1", 2).await.unwrap();
        assert_eq!(recent, vec![tool_turn.clone(), last.clone()]);
        // idempotent without intervening appends
        assert_eq!(store.recent("s1", 2).await.unwrap(), recent);
        assert_eq!(store.recent("s1", 10).await.unwrap(), vec![first.clone(), tool_turn, last]);
        assert!(store.recent("s1", 0).await.unwrap().is_empty());

        assert_eq!(store.count("s1").await.unwrap(), 3);
        assert_eq!(store.count("nope").await.unwrap(), 0);
        assert_eq!(store.sessions().await.unwrap(), vec!["s2".to_string(), "s1".to_string()]);
    }

    async fn exercise_search(store: &dyn MemoryStore) {
        let emb = HashingEmbedder::default();
        store.append("s", Turn::user("dentist appointment")).await.unwrap();
        store.append("s", Turn::user("weather in paris")).await.unwrap();
        store.append("s", Turn::assistant("dentist appointment")).await.unwrap();

        let hits = store.search("s", &emb.embed("dentist appointment"), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        // equal scores: newer turn first
        assert_eq!(hits[0].role, Role::Assistant);
        assert_eq!(hits[1].role, Role::User);
        assert_eq!(hits[1].text(), "dentist appointment");

        let all = store.search("s", &emb.embed("dentist"), 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn in_memory_contract() {
        exercise_contract(&InMemoryStore::default()).await;
        exercise_search(&InMemoryStore::default()).await;
    }

    #[tokio::test]
    async fn sqlite_contract() {
        let dir = tempdir().unwrap();
        exercise_contract(&sqlite_store(&dir).await).await;
        let dir2 = tempdir().unwrap();
        exercise_search(&sqlite_store(&dir2).await).await;
    }

    async fn exercise_concurrent_appends(store: Arc<dyn MemoryStore>) {
        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let own = format!("s{}", w);
                for i in 0..25 {
                    store.append(&own, Turn::user(format!("{}", i))).await.unwrap();
                    store.append("shared", Turn::user(format!("w{}-{}", w, i))).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        for w in 0..4 {
            let turns = store.recent(&format!("s{}", w), 100).await.unwrap();
            let texts: Vec<String> = turns.iter().map(|t| t.text()).collect();
            assert_eq!(texts, expected);
        }

        // interleaved writers: nothing lost, each writer's turns stay in its own order
        let shared = store.recent("shared", 1000).await.unwrap();
        assert_eq!(shared.len(), 100);
        for w in 0..4 {
            let prefix = format!("w{}-", w);
            let mine: Vec<String> = shared.iter().filter_map(|t| t.text().strip_prefix(&prefix).map(str::to_string)).collect();
            assert_eq!(mine, expected);
        }
    }

    #[tokio::test]
    async fn concurrent_appends_keep_per_session_order() {
        exercise_concurrent_appends(Arc::new(InMemoryStore::default())).await;
    }

    #[tokio::test]
    async fn sqlite_concurrent_appends_keep_per_session_order() {
        let dir = tempdir().unwrap();
        exercise_concurrent_appends(Arc::new(sqlite_store(&dir).await)).await;
    }

    #[tokio::test]
    async fn pragmas_and_migrations_applied() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir).await;

        let row = sqlx::query("PRAGMA journal_mode;").fetch_one(store.pool()).await.unwrap();
        let mode: String = row.get(0);
        assert!(mode.eq_ignore_ascii_case("wal"), "journal_mode should be WAL, got {}", mode);
        let row = sqlx::query("PRAGMA busy_timeout;").fetch_one(store.pool()).await.unwrap();
        let timeout: i64 = row.get(0);
        assert_eq!(timeout, 5000);

        // re-running migrations on the same file is a no-op
        let _again = sqlite_store(&dir).await;
    }

    #[tokio::test]
    async fn sqlite_history_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = sqlite_store(&dir).await;
            store.append("s", Turn::user("remember me")).await.unwrap();
        }
        let store = sqlite_store(&dir).await;
        let turns = store.recent("s", 5).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text(), "remember me");
    }
}
