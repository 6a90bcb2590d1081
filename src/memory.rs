//! Per-user long-term memory.
//!
//! [`LongTermMemory`] keeps short texts (preferences, facts, conversation
//! turns, summaries) in its own SQLite database. Each memory carries an
//! importance score computed at write time and access statistics
//! updated on every retrieval; [`LongTermMemory::cleanup`] uses both to
//! decide what to forget.
//!
//! Retrieval is lexical: relevance is the fraction of query words that
//! also appear in the memory. [`MemoryManager`] layers the conversation
//! policy on top: remember a turn only when it is important enough, and
//! render recalled memories as a context block.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::llm::ChatMessage;
use crate::migrate;
use crate::models::Metadata;

pub const PREFERENCE: &str = "preference";
pub const FACT: &str = "fact";
pub const CONVERSATION: &str = "conversation";
pub const CONVERSATION_SUMMARY: &str = "conversation_summary";

const IMPORTANT_KEYWORDS: [&str; 11] = [
    "always", "never", "prefer", "favorite", "hate", "love", "important", "remember", "key", "critical",
    "essential",
];
const MIN_RELEVANCE: f64 = 0.1;
const RECENT_PREFERENCES: usize = 5;

/// Importance in `[0, 1]`: a base score by memory type, plus 0.1 per
/// importance keyword contained in the text (at most 0.3), plus up to
/// 0.2 for length.
pub fn importance(content: &str, memory_type: &str) -> f64 {
    let base = match memory_type {
        PREFERENCE => 0.8,
        FACT => 0.7,
        CONVERSATION_SUMMARY => 0.6,
        CONVERSATION => 0.4,
        _ => 0.5,
    };
    let lower = content.to_lowercase();
    let matches = IMPORTANT_KEYWORDS.iter().filter(|k| lower.contains(*k)).count();
    let keyword_boost = (matches as f64 * 0.1).min(0.3);
    let length_boost = (content.chars().count() as f64 / 500.0).min(0.2);
    (base + keyword_boost + length_boost).clamp(0.0, 1.0)
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

/// Fraction of query words present in `content`.
pub fn relevance(query: &str, content: &str) -> f64 {
    let query_words = words(query);
    if query_words.is_empty() {
        return 0.0;
    }
    let content_words = words(content);
    let overlap = query_words.intersection(&content_words).count();
    (overlap as f64 / query_words.len() as f64).min(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub memory_type: String,
    pub content: String,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub last_accessed: i64,
    pub access_count: i64,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub total_memories: usize,
    pub memory_types: BTreeMap<String, usize>,
    pub total_accesses: i64,
    pub average_importance: f64,
    pub recent_preferences: Vec<String>,
    pub facts: Vec<String>,
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryItem> {
    let metadata_json: String = row.get("metadata_json");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(MemoryItem {
        id: row.get("id"),
        user_id: row.get("user_id"),
        memory_type: row.get("memory_type"),
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata_json).context("Corrupt memory metadata")?,
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        created_at: row.get("created_at"),
        last_accessed: row.get("last_accessed"),
        access_count: row.get("access_count"),
        importance: row.get("importance"),
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct LongTermMemory {
    pool: SqlitePool,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl LongTermMemory {
    /// Open the memory database at `path`, creating it on first use.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        migrate::migrate_memory(&pool).await?;
        Ok(Self { pool, embedder: None })
    }

    /// Embed memories as they are stored.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn remember(
        &self,
        user_id: &str,
        content: &str,
        memory_type: &str,
        metadata: Metadata,
    ) -> Result<MemoryItem> {
        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed_one(content).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(error = %e, "memory embedding failed, storing without vector");
                    None
                }
            },
            None => None,
        };

        let now = now_millis();
        let item = MemoryItem {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            memory_type: memory_type.to_string(),
            content: content.to_string(),
            metadata,
            embedding,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            importance: importance(content, memory_type),
        };

        sqlx::query(
            "INSERT INTO memories (id, user_id, memory_type, content, metadata_json, embedding, created_at, last_accessed, access_count, importance)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(&item.memory_type)
        .bind(&item.content)
        .bind(serde_json::to_string(&item.metadata)?)
        .bind(item.embedding.as_deref().map(vec_to_blob))
        .bind(item.created_at)
        .bind(item.last_accessed)
        .bind(item.access_count)
        .bind(item.importance)
        .execute(&self.pool)
        .await?;

        tracing::debug!(user = user_id, memory_type, importance = item.importance, "memory stored");
        Ok(item)
    }

    /// Memories relevant to `query`, most relevant (then most recently
    /// used) first. Returned memories have their access count and
    /// last-accessed time updated.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        memory_type: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        let rows = match memory_type {
            Some(kind) => {
                sqlx::query("SELECT * FROM memories WHERE user_id = ? AND memory_type = ?")
                    .bind(user_id)
                    .bind(kind)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM memories WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut scored = Vec::new();
        for row in &rows {
            let item = item_from_row(row)?;
            let score = relevance(query, &item.content);
            if score > MIN_RELEVANCE {
                scored.push((score, item));
            }
        }
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa).then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        scored.truncate(limit);

        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let mut result = Vec::with_capacity(scored.len());
        for (_, mut item) in scored {
            sqlx::query("UPDATE memories SET last_accessed = ?, access_count = access_count + 1 WHERE id = ?")
                .bind(now)
                .bind(&item.id)
                .execute(&mut *tx)
                .await?;
            item.last_accessed = now;
            item.access_count += 1;
            result.push(item);
        }
        tx.commit().await?;

        Ok(result)
    }

    /// Contents of the memories [`retrieve`](Self::retrieve) returns.
    pub async fn recall(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve(user_id, query, limit, None)
            .await?
            .into_iter()
            .map(|m| m.content)
            .collect())
    }

    /// All memories of a user, oldest first.
    pub async fn all_memories(&self, user_id: &str) -> Result<Vec<MemoryItem>> {
        let rows = sqlx::query("SELECT * FROM memories WHERE user_id = ? ORDER BY created_at, rowid")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memories WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keep the `max_memories` most important (then most recently used)
    /// memories of a user. Returns how many were removed.
    pub async fn cleanup(&self, user_id: &str, max_memories: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM memories WHERE user_id = ? AND id NOT IN (
                SELECT id FROM memories WHERE user_id = ?
                ORDER BY importance DESC, last_accessed DESC
                LIMIT ?
            )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(max_memories as i64)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(user = user_id, removed, kept = max_memories, "memory cleanup");
        }
        Ok(removed)
    }

    pub async fn user_profile(&self, user_id: &str) -> Result<UserProfile> {
        let memories = self.all_memories(user_id).await?;

        let mut memory_types = BTreeMap::new();
        for memory in &memories {
            *memory_types.entry(memory.memory_type.clone()).or_insert(0) += 1;
        }
        let average_importance = if memories.is_empty() {
            0.0
        } else {
            memories.iter().map(|m| m.importance).sum::<f64>() / memories.len() as f64
        };

        Ok(UserProfile {
            user_id: user_id.to_string(),
            total_memories: memories.len(),
            memory_types,
            total_accesses: memories.iter().map(|m| m.access_count).sum(),
            average_importance,
            recent_preferences: memories
                .iter()
                .rev()
                .filter(|m| m.memory_type == PREFERENCE)
                .take(RECENT_PREFERENCES)
                .map(|m| m.content.clone())
                .collect(),
            facts: memories
                .iter()
                .filter(|m| m.memory_type == FACT)
                .map(|m| m.content.clone())
                .collect(),
        })
    }

    /// The user's stored conversation turns, oldest first, as chat
    /// messages. A turn without an `A:` part yields only its question.
    pub async fn stored_conversation(&self, user_id: &str) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();
        for item in self.all_memories(user_id).await? {
            if item.memory_type != CONVERSATION {
                continue;
            }
            let turn = item.content.strip_prefix("Q: ").unwrap_or(&item.content);
            match turn.split_once("\nA: ") {
                Some((question, answer)) => {
                    messages.push(ChatMessage::user(question));
                    messages.push(ChatMessage::assistant(answer));
                }
                None => messages.push(ChatMessage::user(turn)),
            }
        }
        Ok(messages)
    }

    /// Store a one-line summary of a conversation. Empty conversations
    /// store nothing and return an empty string.
    pub async fn summarize_conversation(&self, user_id: &str, conversation: &[ChatMessage]) -> Result<String> {
        if conversation.is_empty() {
            return Ok(String::new());
        }

        let mut parts = Vec::new();
        if let Some(first) = conversation.iter().find(|m| m.role == "user") {
            let opening: String = first.content.chars().take(100).collect();
            parts.push(format!("User asked about: {}...", opening));
        }
        if conversation.iter().any(|m| m.role == "assistant") {
            parts.push("Assistant responded with information about the query".to_string());
        }
        let summary = parts.join(" ");

        let total_chars: usize = conversation.iter().map(|m| m.content.chars().count()).sum();
        let mut metadata = Metadata::new();
        metadata.insert("message_count".into(), conversation.len().into());
        metadata.insert("weight".into(), (total_chars as f64 / 1000.0).min(1.0).into());

        self.remember(user_id, &summary, CONVERSATION_SUMMARY, metadata).await?;
        Ok(summary)
    }
}

/// Conversation-level memory policy.
pub struct MemoryManager {
    memory: Arc<LongTermMemory>,
    importance_threshold: f64,
    context_limit: usize,
}

impl MemoryManager {
    pub fn new(memory: Arc<LongTermMemory>, importance_threshold: f64) -> Self {
        Self {
            memory,
            importance_threshold,
            context_limit: 3,
        }
    }

    pub fn memory(&self) -> &Arc<LongTermMemory> {
        &self.memory
    }

    /// Store the turn as `Q: ..\nA: ..` when its importance reaches the
    /// threshold. Returns whether it was stored.
    pub async fn add_conversation_memory(&self, user_id: &str, question: &str, answer: &str) -> Result<bool> {
        let content = format!("Q: {}\nA: {}", question, answer);
        let score = importance(&content, CONVERSATION);
        if score < self.importance_threshold {
            tracing::debug!(user = user_id, importance = score, "conversation turn not important enough to keep");
            return Ok(false);
        }
        let mut metadata = Metadata::new();
        metadata.insert("importance".into(), score.into());
        self.memory.remember(user_id, &content, CONVERSATION, metadata).await?;
        Ok(true)
    }

    /// Recalled memories as a context block, or an empty string.
    pub async fn memory_context(&self, user_id: &str, query: &str) -> Result<String> {
        let memories = self.memory.recall(user_id, query, self.context_limit).await?;
        if memories.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["Previous relevant information:".to_string()];
        lines.extend(memories.iter().map(|m| format!("- {}", m)));
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::WordHashEmbedder;
    use tempfile::TempDir;

    async fn open() -> (TempDir, LongTermMemory) {
        let tmp = TempDir::new().unwrap();
        let memory = LongTermMemory::open(&tmp.path().join("memory.sqlite")).await.unwrap();
        (tmp, memory)
    }

    #[test]
    fn test_importance_rules() {
        assert!((importance("likes tea", PREFERENCE) - (0.8 + 9.0 / 500.0)).abs() < 1e-9);
        assert!((importance("x", "note") - (0.5 + 1.0 / 500.0)).abs() < 1e-9);
        // four keywords, boost capped at 0.3
        let capped = importance("always never prefer love", CONVERSATION);
        assert!((capped - (0.4 + 0.3 + 24.0 / 500.0)).abs() < 1e-9);
        assert_eq!(importance(&"important ".repeat(200), PREFERENCE), 1.0);
    }

    #[test]
    fn test_relevance() {
        assert_eq!(relevance("metric units", "I prefer metric units"), 1.0);
        assert_eq!(relevance("metric units please", "metric"), 1.0 / 3.0);
        assert_eq!(relevance("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_remember_and_retrieve_touches_access() {
        let (_tmp, memory) = open().await;
        memory.remember("u1", "I prefer metric units", PREFERENCE, Metadata::new()).await.unwrap();
        memory.remember("u1", "my cat is called Euler", FACT, Metadata::new()).await.unwrap();
        memory.remember("u2", "I prefer imperial units", PREFERENCE, Metadata::new()).await.unwrap();

        let found = memory.retrieve("u1", "which units do I prefer", 10, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "I prefer metric units");
        assert_eq!(found[0].access_count, 1);

        let stored = memory.all_memories("u1").await.unwrap();
        let touched = stored.iter().find(|m| m.id == found[0].id).unwrap();
        assert_eq!(touched.access_count, 1);

        let facts_only = memory.retrieve("u1", "prefer units", 10, Some(FACT)).await.unwrap();
        assert!(facts_only.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_orders_by_relevance() {
        let (_tmp, memory) = open().await;
        memory.remember("u", "units", FACT, Metadata::new()).await.unwrap();
        memory.remember("u", "metric units", FACT, Metadata::new()).await.unwrap();
        let found = memory.recall("u", "metric units", 5).await.unwrap();
        assert_eq!(found, vec!["metric units".to_string(), "units".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_most_important() {
        let (_tmp, memory) = open().await;
        memory.remember("u", "small talk", CONVERSATION, Metadata::new()).await.unwrap();
        memory.remember("u", "a fact", FACT, Metadata::new()).await.unwrap();
        memory.remember("u", "a preference", PREFERENCE, Metadata::new()).await.unwrap();
        memory.remember("other", "untouched", CONVERSATION, Metadata::new()).await.unwrap();

        assert_eq!(memory.cleanup("u", 2).await.unwrap(), 1);
        let kept: Vec<String> = memory.all_memories("u").await.unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(kept, vec!["a fact".to_string(), "a preference".to_string()]);
        assert_eq!(memory.all_memories("other").await.unwrap().len(), 1);
        assert_eq!(memory.cleanup("u", 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_profile() {
        let (_tmp, memory) = open().await;
        let tea = memory.remember("u", "likes tea", PREFERENCE, Metadata::new()).await.unwrap();
        memory.remember("u", "lives in Lyon", FACT, Metadata::new()).await.unwrap();

        let profile = memory.user_profile("u").await.unwrap();
        assert_eq!(profile.total_memories, 2);
        assert_eq!(profile.memory_types.get(PREFERENCE), Some(&1));
        assert_eq!(profile.recent_preferences, vec!["likes tea".to_string()]);
        assert_eq!(profile.facts, vec!["lives in Lyon".to_string()]);

        assert!(memory.delete("u", &tea.id).await.unwrap());
        assert!(!memory.delete("u", &tea.id).await.unwrap());
        assert_eq!(memory.user_profile("u").await.unwrap().total_memories, 1);
    }

    #[tokio::test]
    async fn test_manager_threshold_and_context() {
        let (_tmp, memory) = open().await;
        let manager = MemoryManager::new(Arc::new(memory), 0.6);

        assert!(!manager.add_conversation_memory("u", "what is 2+2", "4").await.unwrap());
        assert!(manager
            .add_conversation_memory("u", "remember that I always prefer radians", "Noted, this is important.")
            .await
            .unwrap());

        let context = manager.memory_context("u", "do I prefer radians").await.unwrap();
        assert_eq!(
            context,
            "Previous relevant information:\n- Q: remember that I always prefer radians\nA: Noted, this is important."
        );
        assert_eq!(manager.memory_context("u", "zebra").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_embedder_vectors_persist() {
        let tmp = TempDir::new().unwrap();
        let memory = LongTermMemory::open(&tmp.path().join("memory.sqlite"))
            .await
            .unwrap()
            .with_embedder(Arc::new(WordHashEmbedder { dims: 16 }));

        let item = memory.remember("u", "I prefer dark mode", PREFERENCE, Metadata::new()).await.unwrap();
        let vector = item.embedding.clone().unwrap();
        assert_eq!(vector.len(), 16);

        let stored = memory.all_memories("u").await.unwrap();
        assert_eq!(stored[0].embedding.as_deref(), Some(vector.as_slice()));
    }

    #[tokio::test]
    async fn test_summarize_conversation() {
        let (_tmp, memory) = open().await;
        let conversation = vec![ChatMessage::user("How do I invert a matrix?"), ChatMessage::assistant("Use Gauss-Jordan.")];
        let summary = memory.summarize_conversation("u", &conversation).await.unwrap();
        assert_eq!(
            summary,
            "User asked about: How do I invert a matrix?... Assistant responded with information about the query"
        );
        let stored = memory.all_memories("u").await.unwrap();
        assert_eq!(stored[0].memory_type, CONVERSATION_SUMMARY);
        assert_eq!(stored[0].metadata["message_count"], 2);
        assert_eq!(memory.summarize_conversation("u", &[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_stored_conversation_rebuilds_turns() {
        let (_tmp, memory) = open().await;
        let manager = MemoryManager::new(Arc::new(memory), 0.0);
        manager
            .add_conversation_memory("u", "what is a group?", "a set with an operation")
            .await
            .unwrap();
        manager.memory().remember("u", "likes proofs", PREFERENCE, Metadata::new()).await.unwrap();
        manager.memory().remember("u", "dangling question", CONVERSATION, Metadata::new()).await.unwrap();

        let conversation = manager.memory().stored_conversation("u").await.unwrap();
        let roles: Vec<&str> = conversation.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(conversation[0].content, "what is a group?");
        assert_eq!(conversation[1].content, "a set with an operation");

        let summary = manager.memory().summarize_conversation("u", &conversation).await.unwrap();
        assert!(summary.starts_with("User asked about: what is a group?..."));
        assert!(manager.memory().stored_conversation("nobody").await.unwrap().is_empty());
    }
}
