//! Binds a schedule to its target and tools, then hands it to the executor

use async_trait::async_trait;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{error, warn};
use vigil_tools::{Connection, QueryExecutor};

use crate::executor::PlaybookExecutor;
use crate::playbook::PlaybookStore;
use crate::schedule::{RunOutcome, Schedule};
use crate::store::ConnectionStore;
use crate::toolsets::{ClusterTools, CommonTools, PlaybookTools};
use crate::tools::{ToolError, ToolRegistry, ToolsetGroup};

/// What the scheduler dispatches for each due schedule
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, schedule: &Schedule) -> RunOutcome;
}

pub struct MonitoringRunner {
    connections: Arc<dyn ConnectionStore>,
    query_executor: Arc<dyn QueryExecutor>,
    playbooks: Arc<dyn PlaybookStore>,
    executor: PlaybookExecutor,
    display_timezone: Tz,
}

impl MonitoringRunner {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        query_executor: Arc<dyn QueryExecutor>,
        playbooks: Arc<dyn PlaybookStore>,
        executor: PlaybookExecutor,
        display_timezone: Tz,
    ) -> Self {
        Self {
            connections,
            query_executor,
            playbooks,
            executor,
            display_timezone,
        }
    }

    fn registry_for(
        &self,
        schedule: &Schedule,
        connection: Connection,
    ) -> Result<ToolRegistry, ToolError> {
        let groups: Vec<Box<dyn ToolsetGroup>> = vec![
            Box::new(CommonTools::new(self.display_timezone)),
            Box::new(PlaybookTools::new(self.playbooks.clone())),
            Box::new(ClusterTools::new(
                self.query_executor.clone(),
                connection,
                Some(schedule.user_id.clone()),
            )),
        ];
        ToolRegistry::merge(&groups)
    }
}

#[async_trait]
impl PlaybookRunner for MonitoringRunner {
    async fn run(&self, schedule: &Schedule) -> RunOutcome {
        let connection = match self.connections.get_connection(schedule.connection_id) {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                error!(
                    "Connection {} for schedule {} no longer exists",
                    schedule.connection_id, schedule.id
                );
                return RunOutcome::fatal(format!(
                    "Connection {} not found",
                    schedule.connection_id
                ));
            }
            Err(e) => {
                warn!("Failed to load connection for schedule {}: {}", schedule.id, e);
                return RunOutcome::failure(format!("Failed to load connection: {}", e));
            }
        };

        let registry = match self.registry_for(schedule, connection) {
            Ok(registry) => registry,
            Err(e) => {
                error!("Toolset configuration error for schedule {}: {}", schedule.id, e);
                return RunOutcome::fatal(e.to_string());
            }
        };

        self.executor.run(schedule, &registry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{call, text, ScriptedModel};
    use crate::playbook::testing::StaticPlaybooks;
    use crate::schedule::{NewSchedule, RunStatus};
    use crate::store::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;
    use vigil_tools::QueryResult;

    struct NoRows;

    #[async_trait]
    impl QueryExecutor for NoRows {
        async fn execute(
            &self,
            _connection: &Connection,
            _sql: &str,
            _as_user: Option<&str>,
        ) -> anyhow::Result<QueryResult> {
            Ok(QueryResult::default())
        }
    }

    fn schedule(connection_id: Uuid) -> Schedule {
        NewSchedule {
            user_id: "user-1".to_string(),
            connection_id,
            playbook: "generalMonitoring".to_string(),
            schedule_expression: "*/10 * * * *".to_string(),
            additional_instructions: None,
            model: "deepseek-chat".to_string(),
            enabled: true,
        }
        .into_schedule(Uuid::new_v4())
    }

    fn runner(store: Arc<MemoryStore>, model: Arc<ScriptedModel>) -> MonitoringRunner {
        let playbooks: Arc<dyn PlaybookStore> =
            Arc::new(StaticPlaybooks::default().with("generalMonitoring", "1. Check settings"));
        MonitoringRunner::new(
            store,
            Arc::new(NoRows),
            playbooks.clone(),
            PlaybookExecutor::new(playbooks, model, 5),
            Tz::UTC,
        )
    }

    #[tokio::test]
    async fn test_missing_connection_is_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let runner = runner(Arc::new(MemoryStore::new()), model.clone());

        let outcome = runner.run(&schedule(Uuid::new_v4())).await;

        assert_eq!(outcome.status, RunStatus::Failure);
        assert!(outcome.fatal);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_runs_with_merged_toolsets() {
        let store = Arc::new(MemoryStore::new());
        let connection = Connection {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            name: "primary".to_string(),
            connection_string: "postgres://localhost/app".to_string(),
        };
        store.add_connection(connection.clone()).unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "getPerformanceAndVacuumSettings", json!({})),
            text("Settings look fine."),
        ]));
        let runner = runner(store, model.clone());

        let outcome = runner.run(&schedule(connection.id)).await;

        assert_eq!(outcome, RunOutcome::success("Settings look fine."));
        let recorded = model.calls.lock().unwrap();
        assert_eq!(recorded[0].2.len(), 8);
        assert_eq!(
            recorded[1].1[2],
            crate::model::ChatMessage::Tool {
                call_id: "c1".to_string(),
                name: "getPerformanceAndVacuumSettings".to_string(),
                content: "No settings found.".to_string(),
            }
        );
    }
}
