use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::session::Role;
use crate::storage::MemoryStore;

/// Sessions and turns per session scanned by pattern detection.
pub const PATTERN_SCAN_SESSIONS: usize = 50;
pub const PATTERN_SCAN_TURNS: usize = 50;
pub const DEFAULT_MIN_OCCURRENCES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceSource {
    /// Stated by the user.
    Explicit,
    /// Inferred from conversation history.
    Pattern,
}

impl PreferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceSource::Explicit => "explicit",
            PreferenceSource::Pattern => "pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(PreferenceSource::Explicit),
            "pattern" => Some(PreferenceSource::Pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub key: String,
    pub value: Value,
    pub source: PreferenceSource,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    pub fn explicit(category: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self { category: category.into(), key: key.into(), value, source: PreferenceSource::Explicit, updated_at: Utc::now() }
    }

    pub fn pattern(category: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self { category: category.into(), key: key.into(), value, source: PreferenceSource::Pattern, updated_at: Utc::now() }
    }

    fn display_value(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// At most one preference per (category, key, source); writing again replaces it.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn put(&self, pref: Preference) -> Result<(), StoreError>;
    /// Everything stored, explicit entries first, then by category and key.
    async fn list(&self) -> Result<Vec<Preference>, StoreError>;
    /// The explicit value if the user stated one, otherwise the detected pattern.
    async fn get(&self, category: &str, key: &str) -> Result<Option<Preference>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    entries: RwLock<BTreeMap<(PreferenceSource, String, String), Preference>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn put(&self, pref: Preference) -> Result<(), StoreError> {
        let key = (pref.source, pref.category.clone(), pref.key.clone());
        self.entries.write().await.insert(key, pref);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Preference>, StoreError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn get(&self, category: &str, key: &str) -> Result<Option<Preference>, StoreError> {
        let entries = self.entries.read().await;
        for source in [PreferenceSource::Explicit, PreferenceSource::Pattern] {
            if let Some(p) = entries.get(&(source, category.to_string(), key.to_string())) {
                return Ok(Some(p.clone()));
            }
        }
        Ok(None)
    }
}

/// Lives in the same database as the conversation log; the schema comes from
/// the shared migrations.
#[derive(Clone)]
pub struct SqlitePreferenceStore {
    pool: Pool<Sqlite>,
}

impl SqlitePreferenceStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

fn preference_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<Preference, StoreError> {
    let source: String = r.try_get("source")?;
    let source = PreferenceSource::parse(&source).ok_or_else(|| StoreError::Unavailable(format!("corrupt record: unknown source {}", source)))?;
    let value: Value = serde_json::from_str(&r.try_get::<String, _>("value_json")?)?;
    let updated_at: String = r.try_get("updated_at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt record: {}", e)))?;
    Ok(Preference { category: r.try_get("category")?, key: r.try_get("key")?, value, source, updated_at })
}

#[async_trait]
impl PreferenceStore for SqlitePreferenceStore {
    async fn put(&self, pref: Preference) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO preferences (category, key, source, value_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (category, key, source) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        )
        .bind(&pref.category)
        .bind(&pref.key)
        .bind(pref.source.as_str())
        .bind(serde_json::to_string(&pref.value)?)
        .bind(pref.updated_at.to_rfc3339())
        .execute(&self.pool).await?;
        debug!(category = %pref.category, key = %pref.key, source = pref.source.as_str(), "preference stored");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Preference>, StoreError> {
        let rows = sqlx::query("SELECT category, key, source, value_json, updated_at FROM preferences ORDER BY source, category, key")
            .fetch_all(&self.pool).await?;
        rows.iter().map(preference_from_row).collect()
    }

    async fn get(&self, category: &str, key: &str) -> Result<Option<Preference>, StoreError> {
        let row = sqlx::query(
            "SELECT category, key, source, value_json, updated_at FROM preferences WHERE category = ?1 AND key = ?2 ORDER BY source LIMIT 1",
        )
        .bind(category)
        .bind(key)
        .fetch_optional(&self.pool).await?;
        row.as_ref().map(preference_from_row).transpose()
    }
}

const WEEKDAYS: [&str; 5] = ["monday", "tuesday", "wednesday", "thursday", "friday"];

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Recognizes a stated preference such as "I prefer short answers" or "I like
/// Tuesday mornings". Returns the explicit preference to store, if any.
pub fn extract_preference_from_text(text: &str) -> Option<Preference> {
    let lower = text.to_lowercase();
    let has = |w: &str| lower.contains(w);

    if has("i prefer") || has("i like") {
        if has("morning") {
            return Some(Preference::explicit("scheduling", "preferred_time_of_day", Value::from("morning")));
        }
        if has("afternoon") {
            return Some(Preference::explicit("scheduling", "preferred_time_of_day", Value::from("afternoon")));
        }
        if let Some(day) = WEEKDAYS.iter().find(|d| has(**d)) {
            return Some(Preference::explicit("scheduling", "preferred_day", Value::from(capitalize(day))));
        }
        if ["short", "brief", "concise"].iter().any(|w| has(*w)) {
            return Some(Preference::explicit("responses", "length", Value::from("short")));
        }
        if ["detailed", "in depth", "thorough"].iter().any(|w| has(*w)) {
            return Some(Preference::explicit("responses", "length", Value::from("detailed")));
        }
    }
    if (has("always") || has("never")) && has("meeting") && has("morning") {
        let rule = if has("always") { "always_morning" } else { "never_morning" };
        return Some(Preference::explicit("scheduling", "meeting_time_rule", Value::from(rule)));
    }
    None
}

/// Stores the preference stated in `text`, if there is one.
pub async fn learn_from_message(store: &dyn PreferenceStore, text: &str) -> Result<Option<Preference>, StoreError> {
    let Some(pref) = extract_preference_from_text(text) else { return Ok(None) };
    store.put(pref.clone()).await?;
    info!(category = %pref.category, key = %pref.key, value = %pref.display_value(), "saved stated preference");
    Ok(Some(pref))
}

/// Most frequent key; ties go to the smallest key.
fn most_common(counts: &BTreeMap<String, usize>) -> Option<(&str, usize)> {
    let mut best: Option<(&str, usize)> = None;
    for (k, &n) in counts {
        if best.is_none_or(|(_, m)| n > m) {
            best = Some((k.as_str(), n));
        }
    }
    best
}

/// Scans recent history for habits: the hour and weekday (UTC) the user
/// usually writes, and the tool used most. Each habit seen at least
/// `min_occurrences` times is stored as a pattern preference and returned.
pub async fn detect_patterns(memory: &dyn MemoryStore, store: &dyn PreferenceStore, min_occurrences: usize) -> Result<Vec<Preference>, StoreError> {
    let min = min_occurrences.max(1);
    let mut hours: BTreeMap<String, usize> = BTreeMap::new();
    let mut days: BTreeMap<String, usize> = BTreeMap::new();
    let mut tools: BTreeMap<String, usize> = BTreeMap::new();

    let sessions = memory.sessions().await?;
    for session_id in sessions.iter().take(PATTERN_SCAN_SESSIONS) {
        for turn in memory.recent(session_id, PATTERN_SCAN_TURNS).await? {
            match turn.role {
                Role::User => {
                    *hours.entry(format!("{:02}:00", turn.timestamp.hour())).or_default() += 1;
                    *days.entry(weekday_name(turn.timestamp.weekday()).to_string()).or_default() += 1;
                }
                Role::Tool => {
                    if let Some(call) = &turn.tool {
                        *tools.entry(call.name.clone()).or_default() += 1;
                    }
                }
                Role::Assistant => {}
            }
        }
    }

    let mut found = Vec::new();
    for (counts, category, key) in [(&hours, "activity", "preferred_hour"), (&days, "activity", "preferred_day"), (&tools, "tools", "most_used")] {
        if let Some((value, n)) = most_common(counts) {
            if n >= min {
                found.push(Preference::pattern(category, key, Value::from(value)));
            }
        }
    }
    for pref in &found {
        store.put(pref.clone()).await?;
        info!(category = %pref.category, key = %pref.key, value = %pref.display_value(), "detected pattern");
    }
    Ok(found)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Human-readable listing, explicit preferences before detected patterns.
pub fn summary(prefs: &[Preference]) -> String {
    let mut sections: Vec<String> = Vec::new();
    for (source, title) in [(PreferenceSource::Explicit, "Your Preferences:"), (PreferenceSource::Pattern, "Detected Patterns:")] {
        let lines: Vec<String> = prefs
            .iter()
            .filter(|p| p.source == source)
            .map(|p| format!("  • {}: {}", p.key, p.display_value()))
            .collect();
        if !lines.is_empty() {
            sections.push(format!("{}\n{}", title, lines.join("\n")));
        }
    }
    if sections.is_empty() {
        return "No preferences set yet.".to_string();
    }
    sections.join("\n\n")
}
