//! PostgreSQL instance metrics
//!
//! Every metric kind maps to exactly one statement against the server's
//! introspection views. Results are normalized into a `MetricSample`:
//! - ratios are 0-100 percentages
//! - sizes are raw byte counts
//! - rates are per-second averages over the requested period
//! - null or missing values become `0`, flagged with `value_missing` (the
//!   primary value) or listed under `missing` (detail columns) in details

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::error::CollectorError;
use crate::query::{as_f64, Connection, QueryExecutor, Row};

/// The closed set of collectable metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuUtilization,
    MemoryUtilization,
    DiskUtilization,
    ConnectionCount,
    TransactionRate,
    CacheHitRatio,
    IndexUsage,
    TableSize,
    IndexSize,
    VacuumStatus,
}

impl MetricKind {
    pub const ALL: [MetricKind; 10] = [
        MetricKind::CpuUtilization,
        MetricKind::MemoryUtilization,
        MetricKind::DiskUtilization,
        MetricKind::ConnectionCount,
        MetricKind::TransactionRate,
        MetricKind::CacheHitRatio,
        MetricKind::IndexUsage,
        MetricKind::TableSize,
        MetricKind::IndexSize,
        MetricKind::VacuumStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUtilization => "cpu_utilization",
            MetricKind::MemoryUtilization => "memory_utilization",
            MetricKind::DiskUtilization => "disk_utilization",
            MetricKind::ConnectionCount => "connection_count",
            MetricKind::TransactionRate => "transaction_rate",
            MetricKind::CacheHitRatio => "cache_hit_ratio",
            MetricKind::IndexUsage => "index_usage",
            MetricKind::TableSize => "table_size",
            MetricKind::IndexSize => "index_size",
            MetricKind::VacuumStatus => "vacuum_status",
        }
    }

    /// The statement backing this metric
    fn query(&self, period_seconds: u64) -> String {
        match self {
            // Active backends relative to the connection ceiling; Postgres
            // exposes no host CPU counters through SQL.
            MetricKind::CpuUtilization => "SELECT now() AS timestamp, \
                   a.active::float8 AS active_connections, \
                   m.max::float8 AS max_connections, \
                   a.active::float8 / NULLIF(m.max, 0)::float8 * 100 AS cpu_utilization \
                 FROM (SELECT count(*) AS active FROM pg_stat_activity WHERE state = 'active') a, \
                      (SELECT current_setting('max_connections')::int AS max) m"
                .to_string(),
            MetricKind::MemoryUtilization => "SELECT now() AS timestamp, \
                   sb.bytes AS shared_buffers_bytes, \
                   ecs.bytes AS effective_cache_size_bytes, \
                   sb.bytes / NULLIF(ecs.bytes, 0) * 100 AS memory_utilization \
                 FROM (SELECT setting::float8 * 8192 AS bytes FROM pg_settings WHERE name = 'shared_buffers') sb, \
                      (SELECT setting::float8 * 8192 AS bytes FROM pg_settings WHERE name = 'effective_cache_size') ecs"
                .to_string(),
            MetricKind::DiskUtilization => "SELECT now() AS timestamp, \
                   d.size AS database_size, \
                   t.size AS total_size, \
                   d.size / NULLIF(t.size, 0) * 100 AS disk_utilization \
                 FROM (SELECT pg_database_size(current_database())::float8 AS size) d, \
                      (SELECT sum(pg_database_size(datname))::float8 AS size FROM pg_database \
                       WHERE has_database_privilege(datname, 'CONNECT')) t"
                .to_string(),
            MetricKind::ConnectionCount => "SELECT now() AS timestamp, \
                   (SELECT count(*) FROM pg_stat_activity)::float8 AS connection_count, \
                   (SELECT count(*) FROM pg_stat_activity WHERE state = 'active')::float8 AS active_connections, \
                   (SELECT count(*) FROM pg_stat_activity WHERE state = 'idle')::float8 AS idle_connections, \
                   (SELECT count(*) FROM pg_stat_activity WHERE state = 'idle in transaction')::float8 \
                     AS idle_in_transaction_connections, \
                   current_setting('max_connections')::float8 AS max_connections"
                .to_string(),
            MetricKind::TransactionRate => format!(
                "SELECT now() AS timestamp, \
                   sum(xact_commit + xact_rollback)::float8 AS total_transactions, \
                   {period}::float8 AS period_seconds, \
                   sum(xact_commit + xact_rollback)::float8 / {period} AS transaction_rate \
                 FROM pg_stat_database WHERE datname = current_database()",
                period = period_seconds.max(1)
            ),
            MetricKind::CacheHitRatio => "SELECT now() AS timestamp, \
                   sum(heap_blks_hit)::float8 AS heap_blocks_hit, \
                   sum(heap_blks_read)::float8 AS heap_blocks_read, \
                   sum(heap_blks_hit)::float8 / NULLIF(sum(heap_blks_hit + heap_blks_read), 0) * 100 \
                     AS cache_hit_ratio \
                 FROM pg_statio_user_tables"
                .to_string(),
            MetricKind::IndexUsage => "SELECT now() AS timestamp, \
                   sum(idx_scan)::float8 AS index_scans, \
                   sum(seq_scan)::float8 AS sequential_scans, \
                   sum(idx_scan)::float8 / NULLIF(sum(idx_scan + seq_scan), 0) * 100 AS index_usage \
                 FROM pg_stat_user_tables"
                .to_string(),
            MetricKind::TableSize => "SELECT now() AS timestamp, \
                   count(*)::float8 AS table_count, \
                   sum(pg_total_relation_size(quote_ident(schemaname) || '.' || quote_ident(tablename)))::float8 \
                     AS total_table_size \
                 FROM pg_tables WHERE schemaname NOT IN ('pg_catalog', 'information_schema')"
                .to_string(),
            MetricKind::IndexSize => "SELECT now() AS timestamp, \
                   count(*)::float8 AS index_count, \
                   sum(pg_relation_size(quote_ident(schemaname) || '.' || quote_ident(indexname)))::float8 \
                     AS total_index_size \
                 FROM pg_indexes WHERE schemaname NOT IN ('pg_catalog', 'information_schema')"
                .to_string(),
            MetricKind::VacuumStatus => "SELECT now() AS timestamp, \
                   count(*) FILTER (WHERE n_dead_tup > 0)::float8 AS tables_needing_vacuum, \
                   sum(n_dead_tup)::float8 AS dead_tuples \
                 FROM pg_stat_user_tables"
                .to_string(),
        }
    }

    /// Column carrying the sample's value
    fn value_column(&self) -> &'static str {
        match self {
            MetricKind::TableSize => "total_table_size",
            MetricKind::IndexSize => "total_index_size",
            MetricKind::VacuumStatus => "tables_needing_vacuum",
            other => other.as_str(),
        }
    }

    /// Auxiliary columns copied into the sample's details
    fn detail_columns(&self) -> &'static [&'static str] {
        match self {
            MetricKind::CpuUtilization => &["active_connections", "max_connections"],
            MetricKind::MemoryUtilization => &["shared_buffers_bytes", "effective_cache_size_bytes"],
            MetricKind::DiskUtilization => &["database_size", "total_size"],
            MetricKind::ConnectionCount => &[
                "active_connections",
                "idle_connections",
                "idle_in_transaction_connections",
                "max_connections",
            ],
            MetricKind::TransactionRate => &["total_transactions", "period_seconds"],
            MetricKind::CacheHitRatio => &["heap_blocks_hit", "heap_blocks_read"],
            MetricKind::IndexUsage => &["index_scans", "sequential_scans"],
            MetricKind::TableSize => &["table_count"],
            MetricKind::IndexSize => &["index_count"],
            MetricKind::VacuumStatus => &["dead_tuples"],
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CollectorError::UnsupportedMetric(s.to_string()))
    }
}

/// One collected value with its auxiliary readings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub details: Map<String, Value>,
}

impl MetricSample {
    fn failed(timestamp: DateTime<Utc>, error: &CollectorError) -> Self {
        let mut details = Map::new();
        details.insert("error".to_string(), Value::String(error.to_string()));
        Self {
            timestamp,
            value: 0.0,
            details,
        }
    }

    fn from_row(kind: MetricKind, row: Option<&Row>, fallback: DateTime<Utc>) -> Self {
        let mut details = Map::new();

        let timestamp = row
            .and_then(|r| r.get("timestamp"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fallback);

        let value = match row.and_then(|r| as_f64(r.get(kind.value_column()))) {
            Some(v) if v.is_finite() => v,
            _ => {
                details.insert("value_missing".to_string(), Value::Bool(true));
                0.0
            }
        };

        // Absent readings still read as 0.0 but are listed under `missing`
        let mut missing = Vec::new();
        for column in kind.detail_columns() {
            let reading = match row.and_then(|r| as_f64(r.get(*column))) {
                Some(v) if v.is_finite() => v,
                _ => {
                    missing.push(Value::from(*column));
                    0.0
                }
            };
            details.insert(column.to_string(), Value::from(reading));
        }
        if !missing.is_empty() {
            details.insert("missing".to_string(), Value::Array(missing));
        }

        Self {
            timestamp,
            value,
            details,
        }
    }

    /// `<rfc3339>: <value>` followed by the details as JSON
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.timestamp.to_rfc3339(), self.value);
        if !self.details.is_empty() {
            out.push_str(&format!("\nDetails: {}", Value::Object(self.details.clone())));
        }
        out
    }
}

/// Samples collected together under one timestamp
#[derive(Debug, Clone, Serialize)]
pub struct MetricBatch {
    pub timestamp: DateTime<Utc>,
    pub samples: BTreeMap<MetricKind, MetricSample>,
}

pub struct MetricCollector {
    executor: Arc<dyn QueryExecutor>,
}

impl MetricCollector {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Collect a single metric
    pub async fn collect(
        &self,
        connection: &Connection,
        kind: MetricKind,
        period_seconds: u64,
        as_user: Option<&str>,
    ) -> Result<MetricSample, CollectorError> {
        let result = self
            .executor
            .execute(connection, &kind.query(period_seconds), as_user)
            .await?;
        Ok(MetricSample::from_row(kind, result.first(), Utc::now()))
    }

    /// Collect a metric by its wire name
    pub async fn collect_named(
        &self,
        connection: &Connection,
        name: &str,
        period_seconds: u64,
        as_user: Option<&str>,
    ) -> Result<MetricSample, CollectorError> {
        let kind: MetricKind = name.parse()?;
        self.collect(connection, kind, period_seconds, as_user).await
    }

    /// Collect several metrics; a failing kind yields a zeroed sample carrying the error
    pub async fn collect_many(
        &self,
        connection: &Connection,
        kinds: &[MetricKind],
        period_seconds: u64,
        as_user: Option<&str>,
    ) -> MetricBatch {
        let timestamp = Utc::now();
        let mut samples = BTreeMap::new();

        for kind in kinds {
            let sample = match self
                .collect(connection, *kind, period_seconds, as_user)
                .await
            {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Error getting metric {} on '{}': {}", kind, connection.name, e);
                    MetricSample::failed(timestamp, &e)
                }
            };
            samples.insert(*kind, sample);
        }

        MetricBatch { timestamp, samples }
    }
}
