//! Vigil Tools - telemetry capabilities for monitored PostgreSQL targets
//!
//! Tools are organized by concern:
//! - query: query-execution capability and its PostgreSQL implementation
//! - metrics: typed metric samples over server-introspection views
//! - logs: activity report that degrades per section instead of failing
//! - dbinfo: table, instance, extension and settings probes

pub mod dbinfo;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod query;

pub use dbinfo::DbInfoCollector;
pub use error::CollectorError;
pub use logs::LogCollector;
pub use metrics::{MetricBatch, MetricCollector, MetricKind, MetricSample};
pub use query::{Connection, PgQueryExecutor, QueryExecutor, QueryResult, Row};

/// Tool execution result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model for this result
    pub fn to_content(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("Unknown error"))
        }
    }
}
