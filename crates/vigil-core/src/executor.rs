//! Playbook execution
//!
//! One monitoring session: fetch the playbook, then alternate model turns and
//! tool calls until the model answers without requesting tools or the turn
//! cap is reached.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::model::{ChatMessage, ModelClient};
use crate::playbook::PlaybookStore;
use crate::schedule::{RunOutcome, Schedule};
use crate::tools::ToolRegistry;

pub const MONITORING_SYSTEM_PROMPT: &str = "You are an AI assistant expert in PostgreSQL and database administration.
Your name is Vigil.
Always answer SUCCINCTLY and to the point.
Be CONCISE.

You are now executing a periodic monitoring task.
You are provided with a playbook name and a set of tools that you can use to execute the playbook.
First thing you need to do is call the getPlaybook tool to get the playbook contents.
Then use the contents of the playbook as an action plan. Execute the plan step by step.
At the end of your execution, print a summary of the results.";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Playbook not found: {0}")]
    PlaybookNotFound(String),
    #[error("Failed to load playbook '{name}': {source}")]
    PlaybookStore {
        name: String,
        source: anyhow::Error,
    },
    #[error("Model completion failed: {0}")]
    Model(anyhow::Error),
    #[error("execution did not converge after {turns} turns")]
    DidNotConverge { turns: usize, partial: String },
}

pub struct PlaybookExecutor {
    playbooks: Arc<dyn PlaybookStore>,
    model: Arc<dyn ModelClient>,
    max_turns: usize,
}

fn opening_message(schedule: &Schedule, playbook: &str) -> String {
    let mut message = format!(
        "Run the playbook '{}'. Its contents are:\n\n{}",
        schedule.playbook,
        playbook.trim()
    );
    if let Some(extra) = schedule
        .additional_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        message.push_str(&format!("\n\nAdditional instructions: {}", extra));
    }
    message
}

impl PlaybookExecutor {
    pub fn new(
        playbooks: Arc<dyn PlaybookStore>,
        model: Arc<dyn ModelClient>,
        max_turns: usize,
    ) -> Self {
        Self {
            playbooks,
            model,
            max_turns: max_turns.max(1),
        }
    }

    /// Run a schedule's playbook; every failure is folded into the outcome
    pub async fn run(&self, schedule: &Schedule, registry: &ToolRegistry) -> RunOutcome {
        match self.execute(schedule, registry).await {
            Ok(summary) => {
                info!("Playbook '{}' completed for schedule {}", schedule.playbook, schedule.id);
                RunOutcome::success(summary)
            }
            Err(ExecutorError::DidNotConverge { turns, partial }) => {
                warn!(
                    "Playbook '{}' for schedule {} hit the {} turn cap",
                    schedule.playbook, schedule.id, turns
                );
                RunOutcome::failure(format!("execution did not converge after {} turns", turns))
                    .with_summary(partial)
            }
            Err(e) => {
                warn!("Playbook '{}' for schedule {} failed: {}", schedule.playbook, schedule.id, e);
                RunOutcome::failure(e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        schedule: &Schedule,
        registry: &ToolRegistry,
    ) -> Result<String, ExecutorError> {
        let playbook = self
            .playbooks
            .get_content(&schedule.playbook)
            .await
            .map_err(|source| ExecutorError::PlaybookStore {
                name: schedule.playbook.clone(),
                source,
            })?
            .ok_or_else(|| ExecutorError::PlaybookNotFound(schedule.playbook.clone()))?;

        let specs = registry.specs();
        let mut conversation = vec![ChatMessage::User(opening_message(schedule, &playbook))];
        let mut partial = String::new();

        for turn in 1..=self.max_turns {
            let completion = self
                .model
                .complete(
                    &schedule.model,
                    MONITORING_SYSTEM_PROMPT,
                    &conversation,
                    &specs,
                )
                .await
                .map_err(ExecutorError::Model)?;

            if completion.tool_calls.is_empty() {
                return Ok(completion.text.trim().to_string());
            }

            if !completion.text.trim().is_empty() {
                partial = completion.text.trim().to_string();
            }

            debug!(
                "Turn {}: {} tool call(s) for schedule {}",
                turn,
                completion.tool_calls.len(),
                schedule.id
            );

            let calls = completion.tool_calls.clone();
            conversation.push(ChatMessage::Assistant {
                text: completion.text,
                tool_calls: completion.tool_calls,
            });

            for call in calls {
                let result = registry.invoke(&call.name, call.arguments).await;
                if !result.success {
                    debug!("Tool {} returned an error: {:?}", call.name, result.error);
                }
                conversation.push(ChatMessage::Tool {
                    call_id: call.id,
                    name: call.name,
                    content: result.to_content(),
                });
            }
        }

        Err(ExecutorError::DidNotConverge {
            turns: self.max_turns,
            partial,
        })
    }
}
