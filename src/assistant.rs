//! Conversation front door.
//!
//! [`Assistant::respond`] retrieves context for the message, resolves the
//! answering mode and hands off to one of three strategies:
//!
//! - `math`: the tandem debate in [`crate::synthesis`]
//! - `chat`: a single chat turn with native tool calling
//! - `agent`: the plan-act loop in [`crate::agent`]
//!
//! `auto` picks `math` when the message mentions a math keyword and
//! `chat` otherwise. `respond` always produces a reply; backend failures
//! surface as `System Error: ...` text.
//!
//! With a [`SafetyGuard`] attached, the message is screened before any
//! retrieval or generation and the reply before it is returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::agent::Agent;
use crate::llm::{ChatMessage, Generator};
use crate::memory::MemoryManager;
use crate::models::{RetrievalResult, SourceSummary};
use crate::retrieval::{format_context, RetrievalOrchestrator};
use crate::safety::{Role, SafetyGuard, Verdict, UNSAFE_OUTPUT_REPLY};
use crate::synthesis::TandemDebate;
use crate::tools::ToolRegistry;

const MATH_KEYWORDS: [&str; 8] = [
    "solve", "calculate", "equation", "deriv", "integral", "math", "proof", "compute",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Math,
    Chat,
    Agent,
}

impl Mode {
    /// Resolve `Auto` against the message; other modes are returned as is.
    pub fn resolve(self, message: &str) -> Mode {
        match self {
            Mode::Auto => {
                let lower = message.to_lowercase();
                if MATH_KEYWORDS.iter().any(|k| lower.contains(k)) {
                    Mode::Math
                } else {
                    Mode::Chat
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            mode: Mode::Auto,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    /// The mode actually used; never `auto`.
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub sources: Vec<SourceSummary>,
}

pub struct Assistant {
    retrieval: Arc<RetrievalOrchestrator>,
    generator: Arc<dyn Generator>,
    tools: Arc<ToolRegistry>,
    debate: TandemDebate,
    agent: Agent,
    memory: Option<MemoryManager>,
    safety: Option<Arc<dyn SafetyGuard>>,
    tool_model: String,
    k: usize,
}

impl Assistant {
    pub fn new(
        retrieval: Arc<RetrievalOrchestrator>,
        generator: Arc<dyn Generator>,
        tools: Arc<ToolRegistry>,
        debate: TandemDebate,
        agent: Agent,
        tool_model: impl Into<String>,
        k: usize,
    ) -> Self {
        Self {
            retrieval,
            generator,
            tools,
            debate,
            agent,
            memory: None,
            safety: None,
            tool_model: tool_model.into(),
            k,
        }
    }

    pub fn with_memory(mut self, memory: MemoryManager) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_safety(mut self, guard: Arc<dyn SafetyGuard>) -> Self {
        self.safety = Some(guard);
        self
    }

    pub fn retrieval(&self) -> &Arc<RetrievalOrchestrator> {
        &self.retrieval
    }

    pub async fn respond(&self, request: ChatRequest) -> ChatResponse {
        let mode = request.mode.resolve(&request.message);
        if let Some(category) = self.screen(&request.message, Role::User).await {
            return ChatResponse {
                response: format!("Safety violation detected: {}", category),
                mode,
                details: Some(serde_json::json!({ "blocked": "input", "category": category })),
                sources: Vec::new(),
            };
        }

        let results = self.retrieve(&request.message).await;
        let mut context = format_context(&results);
        if let Some(recalled) = self.recall(&request).await {
            context = if context.is_empty() {
                recalled
            } else {
                format!("{}\n\n{}", recalled, context)
            };
        }

        tracing::info!(?mode, passages = results.len(), "answering");

        let (response, details) = match mode {
            Mode::Math => {
                let outcome = self.debate.run(&request.message, &context).await;
                let details = serde_json::to_value(&outcome).ok();
                (outcome.final_analysis, details)
            }
            Mode::Agent => {
                let run = self.agent.run(&request.message, &request.history).await;
                let details = serde_json::json!({ "iterations": run.iterations, "steps": run.steps });
                (run.answer, Some(details))
            }
            Mode::Chat | Mode::Auto => self.chat_with_tools(&request, &context).await,
        };

        let (response, details) = match self.screen(&response, Role::Assistant).await {
            Some(category) => (
                UNSAFE_OUTPUT_REPLY.to_string(),
                Some(serde_json::json!({ "blocked": "output", "category": category })),
            ),
            None => (response, details),
        };

        if let (Some(memory), Some(user)) = (&self.memory, &request.user_id) {
            if let Err(e) = memory.add_conversation_memory(user, &request.message, &response).await {
                tracing::warn!(user = %user, error = %e, "failed to store conversation memory");
            }
        }

        ChatResponse {
            response,
            mode,
            details,
            sources: results.iter().map(SourceSummary::from).collect(),
        }
    }

    /// The violated category, if the guard rejects `text`.
    async fn screen(&self, text: &str, role: Role) -> Option<String> {
        let guard = self.safety.as_ref()?;
        match guard.classify(text, role).await {
            Verdict::Safe => None,
            Verdict::Unsafe { category } => {
                tracing::warn!(guard = guard.name(), ?role, %category, "blocked by safety guard");
                Some(category)
            }
        }
    }

    async fn retrieve(&self, message: &str) -> Vec<RetrievalResult> {
        match self.retrieval.query(message, self.k).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, answering without context");
                Vec::new()
            }
        }
    }

    async fn recall(&self, request: &ChatRequest) -> Option<String> {
        let memory = self.memory.as_ref()?;
        let user = request.user_id.as_deref()?;
        match memory.memory_context(user, &request.message).await {
            Ok(context) if !context.is_empty() => Some(context),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(user, error = %e, "memory recall failed");
                None
            }
        }
    }

    /// One chat turn offering every registered tool. When the model asks
    /// for tools, each call is dispatched, its output appended as a
    /// `tool` message, and a second chat turn produces the reply.
    async fn chat_with_tools(&self, request: &ChatRequest, context: &str) -> (String, Option<Value>) {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(format!(
            "You are Axiom, an advanced AI assistant. Use the provided tools to answer questions precisely. Context: {}",
            context
        )));
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(request.message.clone()));

        let reply = match self
            .generator
            .chat(&self.tool_model, &messages, &self.tools.schemas())
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(model = %self.tool_model, error = %e, "chat generation failed");
                return (format!("System Error: {}", e), None);
            }
        };

        if reply.tool_calls.is_empty() {
            return (non_empty_or_default(reply.content), None);
        }

        let calls = reply.tool_calls.clone();
        messages.push(reply);
        let mut trace = Vec::with_capacity(calls.len());
        for call in &calls {
            let params = call.arguments();
            let outcome = self.tools.dispatch(&call.function.name, params.clone()).await;
            tracing::info!(tool = %call.function.name, is_error = outcome.is_error, "tool call");
            messages.push(ChatMessage::tool(outcome.output.clone()));
            trace.push(serde_json::json!({
                "tool": call.function.name,
                "params": params,
                "result": outcome.output,
                "is_error": outcome.is_error,
            }));
        }
        let details = Some(serde_json::json!({ "tool_calls": trace }));

        match self.generator.chat(&self.tool_model, &messages, &[]).await {
            Ok(final_reply) => (non_empty_or_default(final_reply.content), details),
            Err(e) => {
                tracing::error!(model = %self.tool_model, error = %e, "follow-up chat generation failed");
                (format!("System Error: {}", e), details)
            }
        }
    }
}

fn non_empty_or_default(content: String) -> String {
    if content.trim().is_empty() {
        "No response generated.".to_string()
    } else {
        content
    }
}
