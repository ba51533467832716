//! Toolset groups offered to the model during a monitoring run

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use vigil_tools::{
    Connection, DbInfoCollector, LogCollector, MetricCollector, MetricKind, QueryExecutor,
};

use crate::playbook::PlaybookStore;
use crate::tools::{NoArgs, Tool, ToolDescriptor, ToolsetGroup};
use crate::trigger::format_local;

// ============================================================================
// Common
// ============================================================================

pub struct CommonTools {
    display_timezone: Tz,
}

impl CommonTools {
    pub fn new(display_timezone: Tz) -> Self {
        Self { display_timezone }
    }
}

impl ToolsetGroup for CommonTools {
    fn group_name(&self) -> &str {
        "common"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor::of(CurrentTime {
            display_timezone: self.display_timezone,
        })]
    }
}

struct CurrentTime {
    display_timezone: Tz,
}

#[async_trait]
impl Tool for CurrentTime {
    const NAME: &'static str = "getCurrentTime";
    type Args = NoArgs;

    fn description(&self) -> String {
        "Get the current time".to_string()
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<String> {
        let now = Utc::now();
        Ok(format!(
            "{} ({})",
            now.to_rfc3339(),
            format_local(now, self.display_timezone)
        ))
    }
}

// ============================================================================
// Playbooks
// ============================================================================

pub struct PlaybookTools {
    playbooks: Arc<dyn PlaybookStore>,
}

impl PlaybookTools {
    pub fn new(playbooks: Arc<dyn PlaybookStore>) -> Self {
        Self { playbooks }
    }
}

impl ToolsetGroup for PlaybookTools {
    fn group_name(&self) -> &str {
        "playbook"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::of(GetPlaybook {
                playbooks: self.playbooks.clone(),
            }),
            ToolDescriptor::of(ListPlaybooks {
                playbooks: self.playbooks.clone(),
            }),
        ]
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetPlaybookArgs {
    /// Name of the playbook to fetch
    pub name: String,
}

struct GetPlaybook {
    playbooks: Arc<dyn PlaybookStore>,
}

#[async_trait]
impl Tool for GetPlaybook {
    const NAME: &'static str = "getPlaybook";
    type Args = GetPlaybookArgs;

    fn description(&self) -> String {
        "Get the contents of a playbook by name. A playbook is a list of steps to follow to achieve a goal."
            .to_string()
    }

    async fn call(&self, args: GetPlaybookArgs) -> anyhow::Result<String> {
        self.playbooks
            .get_content(&args.name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Playbook '{}' not found", args.name))
    }
}

struct ListPlaybooks {
    playbooks: Arc<dyn PlaybookStore>,
}

#[async_trait]
impl Tool for ListPlaybooks {
    const NAME: &'static str = "listPlaybooks";
    type Args = NoArgs;

    fn description(&self) -> String {
        "List the names of all available playbooks".to_string()
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<String> {
        let names = self.playbooks.list_names().await?;
        if names.is_empty() {
            return Ok("No playbooks available.".to_string());
        }
        Ok(names.join("\n"))
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Collectors bound to one target and acting identity
struct ClusterBinding {
    connection: Connection,
    as_user: Option<String>,
    metrics: MetricCollector,
    logs: LogCollector,
    info: DbInfoCollector,
}

impl ClusterBinding {
    fn as_user(&self) -> Option<&str> {
        self.as_user.as_deref()
    }
}

pub struct ClusterTools {
    binding: Arc<ClusterBinding>,
}

impl ClusterTools {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        connection: Connection,
        as_user: Option<String>,
    ) -> Self {
        Self {
            binding: Arc::new(ClusterBinding {
                connection,
                as_user,
                metrics: MetricCollector::new(executor.clone()),
                logs: LogCollector::new(executor.clone()),
                info: DbInfoCollector::new(executor),
            }),
        }
    }
}

impl ToolsetGroup for ClusterTools {
    fn group_name(&self) -> &str {
        "cluster"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        let b = &self.binding;
        vec![
            ToolDescriptor::of(TablesAndInstanceInfo(b.clone())),
            ToolDescriptor::of(PostgresExtensions(b.clone())),
            ToolDescriptor::of(PerformanceAndVacuumSettings(b.clone())),
            ToolDescriptor::of(InstanceLogs(b.clone())),
            ToolDescriptor::of(InstanceMetric(b.clone())),
        ]
    }
}

struct TablesAndInstanceInfo(Arc<ClusterBinding>);

#[async_trait]
impl Tool for TablesAndInstanceInfo {
    const NAME: &'static str = "getTablesAndInstanceInfo";
    type Args = NoArgs;

    fn description(&self) -> String {
        "Get the information about tables (sizes, row counts, usage) and the data about the server \
         instance on which the database is running. Useful during the initial assessment."
            .to_string()
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<String> {
        Ok(self
            .0
            .info
            .tables_and_instance_info(&self.0.connection, self.0.as_user())
            .await)
    }
}

struct PostgresExtensions(Arc<ClusterBinding>);

#[async_trait]
impl Tool for PostgresExtensions {
    const NAME: &'static str = "getPostgresExtensions";
    type Args = NoArgs;

    fn description(&self) -> String {
        "Get the available and installed PostgreSQL extensions for the database.".to_string()
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<String> {
        self.0
            .info
            .extensions(&self.0.connection, self.0.as_user())
            .await
    }
}

struct PerformanceAndVacuumSettings(Arc<ClusterBinding>);

#[async_trait]
impl Tool for PerformanceAndVacuumSettings {
    const NAME: &'static str = "getPerformanceAndVacuumSettings";
    type Args = NoArgs;

    fn description(&self) -> String {
        "Get the performance and autovacuum related settings of the PostgreSQL instance.".to_string()
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<String> {
        self.0
            .info
            .performance_and_vacuum_settings(&self.0.connection, self.0.as_user())
            .await
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLogsArgs {
    /// Look-back window in seconds
    pub period_in_seconds: u64,
    /// Keep only entries containing this text (case-insensitive)
    pub grep: Option<String>,
}

struct InstanceLogs(Arc<ClusterBinding>);

#[async_trait]
impl Tool for InstanceLogs {
    const NAME: &'static str = "getInstanceLogs";
    type Args = InstanceLogsArgs;

    fn description(&self) -> String {
        "Get recent activity from the PostgreSQL instance: active queries, slow queries, \
         connections and transaction statistics. You can specify the period in seconds and \
         optionally grep for a substring."
            .to_string()
    }

    async fn call(&self, args: InstanceLogsArgs) -> anyhow::Result<String> {
        Ok(self
            .0
            .logs
            .collect_report(
                &self.0.connection,
                args.period_in_seconds,
                args.grep.as_deref(),
                self.0.as_user(),
            )
            .await)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetricArgs {
    /// One of: cpu_utilization, memory_utilization, disk_utilization,
    /// connection_count, transaction_rate, cache_hit_ratio, index_usage,
    /// table_size, index_size, vacuum_status
    pub metric_name: String,
    /// Averaging window in seconds for rate metrics
    pub period_in_seconds: u64,
}

struct InstanceMetric(Arc<ClusterBinding>);

#[async_trait]
impl Tool for InstanceMetric {
    const NAME: &'static str = "getInstanceMetric";
    type Args = InstanceMetricArgs;

    fn description(&self) -> String {
        let supported: Vec<&str> = MetricKind::ALL.iter().map(MetricKind::as_str).collect();
        format!(
            "Get the metrics for the PostgreSQL instance. Supported metrics: {}.",
            supported.join(", ")
        )
    }

    async fn call(&self, args: InstanceMetricArgs) -> anyhow::Result<String> {
        let sample = self
            .0
            .metrics
            .collect_named(
                &self.0.connection,
                &args.metric_name,
                args.period_in_seconds,
                self.0.as_user(),
            )
            .await?;
        Ok(sample.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::testing::StaticPlaybooks;
    use crate::tools::ToolRegistry;
    use serde_json::json;
    use std::sync::Mutex;
    use vigil_tools::{QueryResult, ToolResult};

    /// Answers every statement with one fixed row and records who asked
    struct OneRowExecutor {
        row: serde_json::Value,
        seen_users: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl QueryExecutor for OneRowExecutor {
        async fn execute(
            &self,
            _connection: &Connection,
            _sql: &str,
            as_user: Option<&str>,
        ) -> anyhow::Result<QueryResult> {
            self.seen_users
                .lock()
                .unwrap()
                .push(as_user.map(str::to_string));
            let row = self.row.as_object().cloned().unwrap_or_default();
            Ok(QueryResult { rows: vec![row] })
        }
    }

    fn connection() -> Connection {
        Connection {
            id: uuid::Uuid::new_v4(),
            user_id: "user-1".to_string(),
            name: "primary".to_string(),
            connection_string: "postgres://localhost/app".to_string(),
        }
    }

    fn registry(executor: Arc<OneRowExecutor>) -> ToolRegistry {
        let playbooks = StaticPlaybooks::default().with("generalMonitoring", "1. Check CPU");
        let groups: Vec<Box<dyn ToolsetGroup>> = vec![
            Box::new(CommonTools::new(Tz::UTC)),
            Box::new(PlaybookTools::new(Arc::new(playbooks))),
            Box::new(ClusterTools::new(
                executor,
                connection(),
                Some("user-1".to_string()),
            )),
        ];
        ToolRegistry::merge(&groups).unwrap()
    }

    fn executor(row: serde_json::Value) -> Arc<OneRowExecutor> {
        Arc::new(OneRowExecutor {
            row,
            seen_users: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_groups_merge_without_collisions() {
        let registry = registry(executor(json!({})));

        assert_eq!(
            registry.names(),
            vec![
                "getCurrentTime",
                "getInstanceLogs",
                "getInstanceMetric",
                "getPerformanceAndVacuumSettings",
                "getPlaybook",
                "getPostgresExtensions",
                "getTablesAndInstanceInfo",
                "listPlaybooks",
            ]
        );
    }

    #[test]
    fn test_metric_schema_lists_kinds() {
        let registry = registry(executor(json!({})));
        let spec = registry.resolve("getInstanceMetric").unwrap().spec();
        let text = spec.parameters.to_string();

        assert!(text.contains("metricName"));
        assert!(text.contains("periodInSeconds"));
        assert!(text.contains("vacuum_status"));
        assert!(spec.description.contains("cache_hit_ratio"));
    }

    #[tokio::test]
    async fn test_metric_call_renders_sample_as_acting_user() {
        let exec = executor(json!({
            "timestamp": "2024-01-01T10:00:00+00:00",
            "cache_hit_ratio": 99.5,
            "heap_blocks_hit": 995,
            "heap_blocks_read": 5
        }));
        let registry = registry(exec.clone());

        let result = registry
            .invoke(
                "getInstanceMetric",
                json!({"metricName": "cache_hit_ratio", "periodInSeconds": 300}),
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        assert!(result.output.starts_with("2024-01-01T10:00:00+00:00: 99.5"));
        assert!(result.output.contains("\nDetails: {"));
        assert_eq!(
            exec.seen_users.lock().unwrap().as_slice(),
            &[Some("user-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_metric_is_an_error_result() {
        let exec = executor(json!({}));
        let registry = registry(exec.clone());

        let result = registry
            .invoke(
                "getInstanceMetric",
                json!({"metricName": "swap_usage", "periodInSeconds": 60}),
            )
            .await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Unsupported metric type: swap_usage")
        );
        assert!(exec.seen_users.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_playbook_tools() {
        let registry = registry(executor(json!({})));

        assert_eq!(
            registry
                .invoke("getPlaybook", json!({"name": "generalMonitoring"}))
                .await,
            ToolResult::success("1. Check CPU")
        );
        assert_eq!(
            registry.invoke("getPlaybook", json!({"name": "nope"})).await,
            ToolResult::error("Playbook 'nope' not found")
        );
        assert_eq!(
            registry.invoke("listPlaybooks", json!({})).await,
            ToolResult::success("generalMonitoring")
        );
    }
}
