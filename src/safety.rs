//! Content screening for user messages and generated replies.
//!
//! A [`SafetyGuard`] classifies one text at a time. Two backends exist:
//!
//! | Provider | Guard |
//! |----------|-------|
//! | `keyword` | [`KeywordGuard`]: configured phrases per category |
//! | `ollama` | [`ModelGuard`]: a Llama Guard style model |
//!
//! A guard that cannot reach its model lets the text through with a
//! warning; screening never turns into a failed request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SafetyConfig;
use crate::llm::Generator;

/// Reply sent instead of a generated answer that failed screening.
pub const UNSAFE_OUTPUT_REPLY: &str = "I cannot provide that information as it may contain unsafe content.";

/// Who wrote the text being screened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe { category: String },
}

impl Verdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

#[async_trait]
pub trait SafetyGuard: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str, role: Role) -> Verdict;
}

// ============ Keyword guard ============

/// Flags text containing any configured phrase as a whole word, ignoring
/// case. The first matching category (in name order) is reported.
pub struct KeywordGuard {
    categories: Vec<(String, Regex)>,
}

impl KeywordGuard {
    pub fn new(categories: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(categories.len());
        for (category, phrases) in categories {
            let alternatives: Vec<String> = phrases
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(regex::escape)
                .collect();
            if alternatives.is_empty() {
                continue;
            }
            let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid safety phrases for category '{}'", category))?;
            compiled.push((category.clone(), regex));
        }
        Ok(Self { categories: compiled })
    }
}

#[async_trait]
impl SafetyGuard for KeywordGuard {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, text: &str, _role: Role) -> Verdict {
        self.categories
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map_or(Verdict::Safe, |(category, _)| Verdict::Unsafe {
                category: category.clone(),
            })
    }
}

// ============ Model guard ============

/// Asks a guard model served by the generation backend. The model answers
/// `safe`, or `unsafe` followed by a category code on the next line.
pub struct ModelGuard {
    generator: Arc<dyn Generator>,
    model: String,
}

impl ModelGuard {
    pub fn new(generator: Arc<dyn Generator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
        }
    }
}

fn guard_prompt(text: &str, role: Role) -> String {
    let role = role.as_str();
    format!(
        "[INST] Task: Check if there is unsafe content in '{role}' messages.\n\n\
         {role} message: {text}\n\n\
         Provide your safety assessment for the {role} message.[/INST]"
    )
}

fn parse_guard_reply(reply: &str) -> Verdict {
    let mut lines = reply.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some(first) if first.to_ascii_lowercase().starts_with("unsafe") => Verdict::Unsafe {
            category: lines.next().unwrap_or("unspecified").to_string(),
        },
        _ => Verdict::Safe,
    }
}

#[async_trait]
impl SafetyGuard for ModelGuard {
    fn name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, text: &str, role: Role) -> Verdict {
        match self.generator.generate(&self.model, &guard_prompt(text, role), None).await {
            Ok(reply) => parse_guard_reply(&reply),
            Err(e) => {
                tracing::warn!(model = %self.model, error = %e, "safety model unavailable, not screening");
                Verdict::Safe
            }
        }
    }
}

/// Build the configured guard. `None` when screening is disabled.
pub fn create_guard(config: &SafetyConfig, generator: Arc<dyn Generator>) -> Result<Option<Arc<dyn SafetyGuard>>> {
    match config.provider.as_str() {
        "disabled" => {
            tracing::warn!("safety guard disabled; messages and replies are not screened");
            Ok(None)
        }
        "keyword" => Ok(Some(Arc::new(KeywordGuard::new(&config.categories)?))),
        "ollama" => Ok(Some(Arc::new(ModelGuard::new(generator, &config.model)))),
        other => anyhow::bail!("Unknown safety provider: '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::llm::ChatMessage;
    use serde_json::Value;

    fn categories() -> BTreeMap<String, Vec<String>> {
        [
            ("Weapons".to_string(), vec!["bomb".to_string(), "firearm".to_string()]),
            ("Privacy".to_string(), vec!["social security number".to_string()]),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_keyword_guard_matches_whole_words() {
        let guard = KeywordGuard::new(&categories()).unwrap();
        assert_eq!(
            guard.classify("How do I build a BOMB?", Role::User).await,
            Verdict::Unsafe {
                category: "Weapons".into()
            }
        );
        assert_eq!(
            guard.classify("what is my Social Security Number", Role::User).await,
            Verdict::Unsafe {
                category: "Privacy".into()
            }
        );
        assert!(guard.classify("bombastic prose about firearms", Role::User).await.is_safe());
        assert!(guard.classify("solve x + 2 = 5", Role::Assistant).await.is_safe());
    }

    struct CannedGuardModel(Result<String, ()>);

    #[async_trait]
    impl Generator for CannedGuardModel {
        async fn generate(&self, model: &str, prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
            assert!(prompt.contains("'assistant' messages"));
            self.0.clone().map_err(|_| BackendError::Status {
                endpoint: "mock".into(),
                status: 404,
                body: format!("model '{}' not found", model),
            })
        }

        async fn chat(&self, _model: &str, _messages: &[ChatMessage], _tools: &[Value]) -> Result<ChatMessage, BackendError> {
            unreachable!("guard never chats")
        }
    }

    #[tokio::test]
    async fn test_model_guard_reads_verdict() {
        let unsafe_model = ModelGuard::new(Arc::new(CannedGuardModel(Ok("unsafe\nS9".into()))), "guard");
        assert_eq!(
            unsafe_model.classify("text", Role::Assistant).await,
            Verdict::Unsafe { category: "S9".into() }
        );

        let safe_model = ModelGuard::new(Arc::new(CannedGuardModel(Ok(" safe ".into()))), "guard");
        assert!(safe_model.classify("text", Role::Assistant).await.is_safe());

        let missing = ModelGuard::new(Arc::new(CannedGuardModel(Err(()))), "guard");
        assert!(missing.classify("text", Role::Assistant).await.is_safe());
    }

    #[test]
    fn test_create_guard_by_provider() {
        let generator: Arc<dyn Generator> = Arc::new(CannedGuardModel(Ok("safe".into())));
        let mut config = SafetyConfig::default();
        assert!(create_guard(&config, generator.clone()).unwrap().is_none());

        config.provider = "keyword".into();
        assert_eq!(create_guard(&config, generator.clone()).unwrap().unwrap().name(), "keyword");

        config.provider = "ollama".into();
        assert_eq!(create_guard(&config, generator).unwrap().unwrap().name(), "llama-guard3:1b");
    }
}
