//! Plan-act agent loop over the tool registry.
//!
//! Each iteration asks the tool model for its next move given the query,
//! the tool list and a bounded window of history. The reply is parsed
//! into one of:
//!
//! - `Final Answer: <text>`: the loop ends with `<text>`.
//! - `Action: <tool>` + `Action Input: <json>`: the tool is dispatched and
//!   both the call and its result are appended to the history.
//! - anything else: the loop ends with a fixed rephrase request.
//!
//! The loop runs at most `max_iterations` times. Tool failures are fed
//! back to the model as results, never raised.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::llm::{ChatMessage, Generator};
use crate::tools::ToolRegistry;

const FINAL_MARKER: &str = "Final Answer:";
const ACTION_MARKER: &str = "Action:";
const INPUT_MARKER: &str = "Action Input:";

pub const UNPARSEABLE_ANSWER: &str =
    "I'm not sure how to respond to that request. Could you please rephrase your question?";
pub const ITERATION_LIMIT_ANSWER: &str =
    "I wasn't able to complete this task within the allowed number of steps. Let me provide what I found so far.";

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Final(String),
    Act { tool: String, params: Value },
    Unparseable,
}

/// One tool call made by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStep {
    pub iteration: usize,
    pub tool: String,
    pub params: Value,
    pub result: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRun {
    pub answer: String,
    pub iterations: usize,
    pub steps: Vec<AgentStep>,
}

pub struct Agent {
    generator: Arc<dyn Generator>,
    tools: Arc<ToolRegistry>,
    model: String,
    max_iterations: usize,
    history_window: usize,
    history_chars: usize,
}

impl Agent {
    pub fn new(
        generator: Arc<dyn Generator>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            generator,
            tools,
            model: model.into(),
            max_iterations: config.max_iterations,
            history_window: config.history_window,
            history_chars: config.history_chars,
        }
    }

    pub async fn run(&self, query: &str, history: &[ChatMessage]) -> AgentRun {
        let mut history = history.to_vec();
        let mut steps = Vec::new();

        for iteration in 1..=self.max_iterations {
            let prompt = self.prompt(query, &history);
            let output = match self.generator.generate(&self.model, &prompt, None).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(model = %self.model, error = %e, iteration, "agent planning failed");
                    return AgentRun {
                        answer: format!("System Error: {}", e),
                        iterations: iteration,
                        steps,
                    };
                }
            };

            match parse_decision(&output) {
                Decision::Final(answer) => {
                    tracing::info!(iteration, "agent reached final answer");
                    return AgentRun {
                        answer,
                        iterations: iteration,
                        steps,
                    };
                }
                Decision::Unparseable => {
                    tracing::warn!(
                        iteration,
                        output = %output.chars().take(200).collect::<String>(),
                        "could not parse agent output"
                    );
                    return AgentRun {
                        answer: UNPARSEABLE_ANSWER.to_string(),
                        iterations: iteration,
                        steps,
                    };
                }
                Decision::Act { tool, params } => {
                    let outcome = self.tools.dispatch(&tool, params.clone()).await;
                    history.push(ChatMessage::assistant(format!(
                        "I used the {} tool with parameters: {}",
                        tool, params
                    )));
                    history.push(ChatMessage::tool(format!("Tool result: {}", outcome.output)));
                    tracing::info!(iteration, max = self.max_iterations, tool = %tool, "agent iteration complete");
                    steps.push(AgentStep {
                        iteration,
                        tool,
                        params,
                        result: outcome.output,
                        is_error: outcome.is_error,
                    });
                }
            }
        }

        tracing::warn!(max = self.max_iterations, "agent hit iteration limit without a final answer");
        AgentRun {
            answer: ITERATION_LIMIT_ANSWER.to_string(),
            iterations: self.max_iterations,
            steps,
        }
    }

    fn prompt(&self, query: &str, history: &[ChatMessage]) -> String {
        let tools = self.tools.describe();

        let start = history.len().saturating_sub(self.history_window);
        let mut history_block = history[start..]
            .iter()
            .map(|m| {
                let content: String = m.content.chars().take(self.history_chars).collect();
                format!("{}: {}", m.role, content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !history_block.is_empty() {
            history_block.push_str("\n\n");
        }

        format!(
            "You are a helpful AI assistant with access to tools. Use them when you need specific \
information or computations.

Available Tools:
{tools}

Tool Usage Format:
When you need to use a tool, respond with:
Action: tool_name
Action Input: {{\"param1\": \"value1\"}}

When you have enough information to answer, respond with:
Final Answer: your complete answer

Guidelines:
- For questions about stored documents, use search_knowledge_base first, then search_web if available
- For calculations, use calculate
- Base your answer on tool results

User Query: {query}

{history_block}What is your next action?"
        )
    }
}

/// Parse one planning reply. `Final Answer:` wins over an action when
/// both appear. Action input that is not a JSON object becomes `{}`.
pub fn parse_decision(output: &str) -> Decision {
    let output = output.trim();

    if let Some((_, answer)) = output.split_once(FINAL_MARKER) {
        return Decision::Final(answer.trim().to_string());
    }

    let (Some(action_at), Some(input_at)) = (output.find(ACTION_MARKER), output.find(INPUT_MARKER)) else {
        return Decision::Unparseable;
    };
    if input_at < action_at {
        return Decision::Unparseable;
    }

    let tool = output[action_at + ACTION_MARKER.len()..input_at]
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches('`')
        .to_string();
    if tool.is_empty() {
        return Decision::Unparseable;
    }

    let raw_input = output[input_at + INPUT_MARKER.len()..].trim();
    let params = match serde_json::Deserializer::from_str(raw_input).into_iter::<Value>().next() {
        Some(Ok(value @ Value::Object(_))) => value,
        _ => {
            tracing::warn!(tool = %tool, input = %raw_input, "could not parse action input as a JSON object");
            Value::Object(Default::default())
        }
    };

    Decision::Act { tool, params }
}
