//! Tandem answer synthesis: two independent solvers and a judge.
//!
//! 1. Both solver models get the same query and context, prompted
//!    separately so neither sees the other's answer. They run
//!    concurrently and both finish before judging starts.
//! 2. The judge model receives both solutions verbatim, checks them
//!    against each other, and writes one final answer.
//! 3. All three texts are returned; disagreement between the solvers is
//!    itself useful to the caller.
//!
//! A failed generation call never aborts the debate. The failing
//! branch's text becomes `Error calling <model>: <error>` and the branch
//! is flagged in [`DebateOutcome::failed_branches`]. The judge is told
//! which branch failed instead of being handed the error as a solution,
//! and is skipped entirely when both branches failed.

use serde::Serialize;
use std::sync::Arc;

use crate::llm::Generator;

const SOLVER_SYSTEM: &str = "You are a rigorous mathematician. Solve the problem accurately.";
const JUDGE_SYSTEM: &str =
    "You are an expert mathematical judge. Your goal is to find the truth by comparing proposed solutions.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebateOutcome {
    pub solution_1: String,
    pub solution_2: String,
    pub final_analysis: String,
    /// 1-based indices of solver branches whose generation call failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_branches: Vec<u8>,
}

/// One solver's result.
enum Branch {
    Solved(String),
    Failed(String),
}

impl Branch {
    fn text(&self) -> &str {
        match self {
            Branch::Solved(text) | Branch::Failed(text) => text,
        }
    }
}

pub struct TandemDebate {
    generator: Arc<dyn Generator>,
    solvers: [String; 2],
    judge: String,
}

impl TandemDebate {
    pub fn new(generator: Arc<dyn Generator>, solvers: [String; 2], judge: impl Into<String>) -> Self {
        Self {
            generator,
            solvers,
            judge: judge.into(),
        }
    }

    pub async fn run(&self, query: &str, context: &str) -> DebateOutcome {
        let first_prompt = format!(
            "Please solve this math problem. Show your work step by step.\nProblem: {}\nContext: {}",
            query, context
        );
        let second_prompt = format!(
            "Please solve this math problem independent of others. Show your work.\nProblem: {}\nContext: {}",
            query, context
        );

        let (first, second) = tokio::join!(
            self.solve(&self.solvers[0], &first_prompt),
            self.solve(&self.solvers[1], &second_prompt)
        );

        let failed_branches: Vec<u8> = [(1u8, &first), (2u8, &second)]
            .iter()
            .filter(|(_, branch)| matches!(branch, Branch::Failed(_)))
            .map(|(index, _)| *index)
            .collect();

        let final_analysis = if failed_branches.len() == 2 {
            tracing::warn!("both solver models failed, skipping judge");
            "Neither solver model produced an answer, so no solution can be given. \
             Check that the generation backend is running and the models are available."
                .to_string()
        } else {
            self.judge(query, &first, &second).await
        };

        DebateOutcome {
            solution_1: first.text().to_string(),
            solution_2: second.text().to_string(),
            final_analysis,
            failed_branches,
        }
    }

    async fn solve(&self, model: &str, prompt: &str) -> Branch {
        match self.generator.generate(model, prompt, Some(SOLVER_SYSTEM)).await {
            Ok(text) => Branch::Solved(text),
            Err(e) => {
                tracing::warn!(model, error = %e, "solver generation failed");
                Branch::Failed(format!("Error calling {}: {}", model, e))
            }
        }
    }

    async fn judge(&self, query: &str, first: &Branch, second: &Branch) -> String {
        let prompt = judge_prompt(query, first, second);
        match self.generator.generate(&self.judge, &prompt, Some(JUDGE_SYSTEM)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(model = %self.judge, error = %e, "judge generation failed");
                format!("Error calling {}: {}", self.judge, e)
            }
        }
    }
}

fn describe(index: usize, branch: &Branch) -> String {
    match branch {
        Branch::Solved(text) => format!("Solution {}:\n{}", index, text),
        Branch::Failed(_) => format!(
            "Solution {}:\n(unavailable: this solver failed to respond; it is not a proposed answer)",
            index
        ),
    }
}

fn judge_prompt(query: &str, first: &Branch, second: &Branch) -> String {
    let instructions = match (first, second) {
        (Branch::Solved(_), Branch::Solved(_)) => {
            "Please evaluate both solutions. Check for errors in calculation or logic.\n\
             If they agree, summarize the answer.\n\
             If they disagree, determine which one is correct and explain why.\n\
             Provide the final, correct answer clearly."
        }
        _ => {
            "Only one solution is available. Check it carefully for errors in calculation or logic, \
             correct it if needed, and provide the final, correct answer clearly."
        }
    };
    format!(
        "I have two solutions to the following problem:\nProblem: {}\n\n{}\n\n{}\n\n{}",
        query,
        describe(1, first),
        describe(2, second),
        instructions
    )
}
