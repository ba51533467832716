//! PostgreSQL activity report
//!
//! Builds a four-section report (active queries, slow queries, connections,
//! transactions). Each section is queried on its own; a section that cannot
//! be collected is replaced by an explanatory line so the rest of the report
//! still reaches the caller.

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use crate::query::{as_f64, column_or, Connection, QueryExecutor, Row};

const ACTIVE_QUERIES_SQL: &str = "SELECT pid, usename AS user, application_name, client_addr, state, \
       wait_event_type, wait_event, query_start, state_change, query \
     FROM pg_stat_activity \
     WHERE datname = current_database() \
       AND state = 'active' \
       AND query NOT LIKE '%pg_stat_activity%' \
       AND query NOT LIKE '%pg_stat_database%' \
     ORDER BY query_start DESC \
     LIMIT 100";

const SLOW_QUERY_EXTENSION_SQL: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements') AS installed";

const SLOW_QUERIES_SQL: &str = "SELECT query, calls, total_exec_time, mean_exec_time, rows \
     FROM pg_stat_statements \
     WHERE dbid = (SELECT oid FROM pg_database WHERE datname = current_database()) \
     ORDER BY total_exec_time DESC \
     LIMIT 20";

const TRANSACTIONS_SQL: &str = "SELECT datname, xact_commit, xact_rollback, blks_read, blks_hit, \
       tup_returned, tup_fetched, tup_inserted, tup_updated, tup_deleted \
     FROM pg_stat_database \
     WHERE datname = current_database()";

const SLOW_QUERIES_UNAVAILABLE: &str =
    "pg_stat_statements extension is not installed. Slow query logging is not available.";

fn connections_sql(period_seconds: u64) -> String {
    format!(
        "SELECT pid, usename AS user, application_name, client_addr, state, \
           wait_event_type, wait_event, query_start, state_change, query \
         FROM pg_stat_activity \
         WHERE datname = current_database() \
           AND (state_change IS NULL OR state_change >= now() - make_interval(secs => {})) \
         ORDER BY query_start DESC NULLS LAST \
         LIMIT 100",
        period_seconds
    )
}

/// What a section produced
enum SectionBody {
    /// Individual entries, subject to the grep filter
    Entries(Vec<String>),
    /// A fixed statement, shown as-is
    Note(String),
}

struct Section {
    title: &'static str,
    /// Shown when there are no entries
    empty: &'static str,
    /// Used in the explanatory line when the section fails
    subject: &'static str,
    filterable: bool,
}

const ACTIVE_QUERIES: Section = Section {
    title: "Active Queries",
    empty: "No active queries found.",
    subject: "active queries",
    filterable: true,
};

const SLOW_QUERIES: Section = Section {
    title: "Slow Queries",
    empty: "No slow query statistics found.",
    subject: "slow query statistics",
    filterable: true,
};

const CONNECTIONS: Section = Section {
    title: "Connections",
    empty: "No connections found.",
    subject: "connection activity",
    filterable: true,
};

const TRANSACTIONS: Section = Section {
    title: "Transactions",
    empty: "No transaction statistics found.",
    subject: "transaction statistics",
    filterable: false,
};

fn render_section(
    section: &Section,
    body: Result<SectionBody>,
    grep: Option<&str>,
    target: &str,
) -> String {
    let text = match body {
        Ok(SectionBody::Note(note)) => note,
        Ok(SectionBody::Entries(entries)) => {
            let needle = grep.filter(|g| section.filterable && !g.is_empty());
            let entries: Vec<String> = match needle {
                Some(g) => {
                    let g = g.to_lowercase();
                    entries
                        .into_iter()
                        .filter(|e| e.to_lowercase().contains(&g))
                        .collect()
                }
                None => entries,
            };

            if entries.is_empty() {
                match needle {
                    Some(g) => format!("No entries matching '{}'.", g),
                    None => section.empty.to_string(),
                }
            } else {
                entries.join("\n\n")
            }
        }
        Err(e) => {
            warn!("Failed to collect {} for '{}': {}", section.subject, target, e);
            format!("Unable to retrieve {}: {}", section.subject, e)
        }
    };

    format!("=== {} ===\n{}", section.title, text)
}

/// One backend from pg_stat_activity
fn render_backend(row: &Row) -> String {
    let wait = match (
        crate::query::as_text(row.get("wait_event_type")),
        crate::query::as_text(row.get("wait_event")),
    ) {
        (Some(kind), Some(event)) => format!("\nWaiting: {} - {}", kind, event),
        _ => String::new(),
    };

    format!(
        "[{}] {}@{} ({})\nState: {}\nStarted: {}\nLast State Change: {}{}\nQuery: {}",
        column_or(row, "pid", "?"),
        column_or(row, "user", "unknown"),
        column_or(row, "application_name", "unknown"),
        column_or(row, "client_addr", "local"),
        column_or(row, "state", "idle"),
        column_or(row, "query_start", "N/A"),
        column_or(row, "state_change", "N/A"),
        wait,
        column_or(row, "query", "N/A"),
    )
}

fn render_statement(row: &Row) -> String {
    format!(
        "Query: {}\nCalls: {}\nTotal Time: {:.2}ms\nMean Time: {:.2}ms\nRows: {}",
        column_or(row, "query", "N/A"),
        column_or(row, "calls", "0"),
        as_f64(row.get("total_exec_time")).unwrap_or(0.0),
        as_f64(row.get("mean_exec_time")).unwrap_or(0.0),
        column_or(row, "rows", "0"),
    )
}

fn render_transactions(stats: &Row) -> String {
    let hit = as_f64(stats.get("blks_hit")).unwrap_or(0.0);
    let read = as_f64(stats.get("blks_read")).unwrap_or(0.0);
    let hit_ratio = if hit + read > 0.0 {
        hit / (hit + read) * 100.0
    } else {
        0.0
    };

    format!(
        "Database: {}\nTransactions:\n  Committed: {}\n  Rolled Back: {}\n\
         Block Statistics:\n  Read: {}\n  Hit: {}\n  Hit Ratio: {:.2}%\n\
         Tuple Statistics:\n  Returned: {}\n  Fetched: {}\n  Inserted: {}\n  Updated: {}\n  Deleted: {}",
        column_or(stats, "datname", "unknown"),
        column_or(stats, "xact_commit", "0"),
        column_or(stats, "xact_rollback", "0"),
        column_or(stats, "blks_read", "0"),
        column_or(stats, "blks_hit", "0"),
        hit_ratio,
        column_or(stats, "tup_returned", "0"),
        column_or(stats, "tup_fetched", "0"),
        column_or(stats, "tup_inserted", "0"),
        column_or(stats, "tup_updated", "0"),
        column_or(stats, "tup_deleted", "0"),
    )
}

pub struct LogCollector {
    executor: Arc<dyn QueryExecutor>,
}

impl LogCollector {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Build the report. Never fails; unavailable sections explain themselves.
    pub async fn collect_report(
        &self,
        connection: &Connection,
        period_seconds: u64,
        grep: Option<&str>,
        as_user: Option<&str>,
    ) -> String {
        let active = self.active_queries(connection, as_user).await;
        let slow = self.slow_queries(connection, as_user).await;
        let connections = self.connections(connection, period_seconds, as_user).await;
        let transactions = self.transactions(connection, as_user).await;

        let target = connection.name.as_str();
        let mut report = vec![format!(
            "PostgreSQL activity for '{}' (window: last {}s)",
            target, period_seconds
        )];
        if let Some(g) = grep.filter(|g| !g.is_empty()) {
            report.push(format!("Filter: '{}'", g));
        }
        report.push(render_section(&ACTIVE_QUERIES, active, grep, target));
        report.push(render_section(&SLOW_QUERIES, slow, grep, target));
        report.push(render_section(&CONNECTIONS, connections, grep, target));
        report.push(render_section(&TRANSACTIONS, transactions, grep, target));

        report.join("\n\n")
    }

    async fn active_queries(
        &self,
        connection: &Connection,
        as_user: Option<&str>,
    ) -> Result<SectionBody> {
        let result = self
            .executor
            .execute(connection, ACTIVE_QUERIES_SQL, as_user)
            .await?;
        Ok(SectionBody::Entries(
            result.rows.iter().map(render_backend).collect(),
        ))
    }

    async fn slow_queries(
        &self,
        connection: &Connection,
        as_user: Option<&str>,
    ) -> Result<SectionBody> {
        let check = self
            .executor
            .execute(connection, SLOW_QUERY_EXTENSION_SQL, as_user)
            .await?;
        let installed = check
            .first()
            .and_then(|row| row.get("installed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !installed {
            return Ok(SectionBody::Note(SLOW_QUERIES_UNAVAILABLE.to_string()));
        }

        let result = self
            .executor
            .execute(connection, SLOW_QUERIES_SQL, as_user)
            .await?;
        Ok(SectionBody::Entries(
            result.rows.iter().map(render_statement).collect(),
        ))
    }

    async fn connections(
        &self,
        connection: &Connection,
        period_seconds: u64,
        as_user: Option<&str>,
    ) -> Result<SectionBody> {
        let result = self
            .executor
            .execute(connection, &connections_sql(period_seconds), as_user)
            .await?;
        Ok(SectionBody::Entries(
            result.rows.iter().map(render_backend).collect(),
        ))
    }

    async fn transactions(
        &self,
        connection: &Connection,
        as_user: Option<&str>,
    ) -> Result<SectionBody> {
        let result = self
            .executor
            .execute(connection, TRANSACTIONS_SQL, as_user)
            .await?;
        Ok(SectionBody::Entries(
            result.first().map(render_transactions).into_iter().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::testing::{target, ScriptedExecutor};
    use serde_json::json;

    fn backend(pid: i64, query: &str) -> serde_json::Value {
        json!({
            "pid": pid,
            "user": "app",
            "application_name": "api",
            "client_addr": null,
            "state": "active",
            "wait_event_type": "Lock",
            "wait_event": "relation",
            "query_start": "2024-01-01T10:00:00+00:00",
            "state_change": null,
            "query": query
        })
    }

    fn stats() -> serde_json::Value {
        json!({
            "datname": "app",
            "xact_commit": 900,
            "xact_rollback": 3,
            "blks_read": 25,
            "blks_hit": 75,
            "tup_returned": 1,
            "tup_fetched": 2,
            "tup_inserted": 3,
            "tup_updated": 4,
            "tup_deleted": 5
        })
    }

    #[test]
    fn test_report_without_slow_query_extension() {
        let executor = ScriptedExecutor::new()
            .rows("pg_extension", vec![json!({ "installed": false })])
            .rows("state = 'active'", vec![backend(41, "UPDATE orders SET paid = true")])
            .rows("make_interval", vec![])
            .rows("FROM pg_stat_database", vec![stats()]);
        let collector = LogCollector::new(Arc::new(executor));

        let report = tokio_test::block_on(collector.collect_report(&target(), 600, None, None));

        assert!(report.starts_with("PostgreSQL activity for 'primary' (window: last 600s)"));
        for title in ["Active Queries", "Slow Queries", "Connections", "Transactions"] {
            assert!(report.contains(&format!("=== {} ===", title)), "missing {}", title);
        }
        assert!(report.contains(SLOW_QUERIES_UNAVAILABLE));
        assert!(report.contains("[41] app@api (local)"));
        assert!(report.contains("Waiting: Lock - relation"));
        assert!(report.contains("No connections found."));
        assert!(report.contains("Hit Ratio: 75.00%"));
    }

    #[test]
    fn test_failing_sections_degrade_independently() {
        let executor = ScriptedExecutor::new()
            .fail("pg_extension", "permission denied for pg_extension")
            .fail("state = 'active'", "canceling statement due to statement timeout")
            .rows("make_interval", vec![backend(7, "SELECT 1")])
            .fail("FROM pg_stat_database", "connection reset");
        let collector = LogCollector::new(Arc::new(executor));

        let report = tokio_test::block_on(collector.collect_report(&target(), 60, None, None));

        assert!(report.contains("Unable to retrieve active queries: canceling statement"));
        assert!(report.contains("Unable to retrieve slow query statistics: permission denied"));
        assert!(report.contains("[7] app@api"));
        assert!(report.contains("Unable to retrieve transaction statistics: connection reset"));
    }

    #[test]
    fn test_slow_queries_rendered_when_installed() {
        let executor = ScriptedExecutor::new()
            .rows("pg_extension", vec![json!({ "installed": true })])
            .rows(
                "FROM pg_stat_statements",
                vec![json!({
                    "query": "SELECT * FROM orders WHERE customer_id = $1",
                    "calls": 1200,
                    "total_exec_time": 5321.456,
                    "mean_exec_time": 4.4345,
                    "rows": 1200
                })],
            )
            .rows("state = 'active'", vec![])
            .rows("make_interval", vec![])
            .rows("FROM pg_stat_database", vec![]);
        let collector = LogCollector::new(Arc::new(executor));

        let report = tokio_test::block_on(collector.collect_report(&target(), 60, None, None));

        assert!(report.contains("Calls: 1200\nTotal Time: 5321.46ms\nMean Time: 4.43ms"));
        assert!(report.contains("No active queries found."));
        assert!(report.contains("No transaction statistics found."));
    }

    #[test]
    fn test_grep_filters_entries() {
        let executor = ScriptedExecutor::new()
            .rows("pg_extension", vec![json!({ "installed": false })])
            .rows(
                "state = 'active'",
                vec![
                    backend(1, "UPDATE orders SET paid = true"),
                    backend(2, "SELECT * FROM invoices"),
                ],
            )
            .rows("make_interval", vec![backend(3, "VACUUM invoices")])
            .rows("FROM pg_stat_database", vec![stats()]);
        let collector = LogCollector::new(Arc::new(executor));

        let report =
            tokio_test::block_on(collector.collect_report(&target(), 60, Some("ORDERS"), None));

        assert!(report.contains("Filter: 'ORDERS'"));
        assert!(report.contains("[1] app@api"));
        assert!(!report.contains("[2] app@api"));
        assert!(report.contains("No entries matching 'ORDERS'."));
        // Counters are not filtered
        assert!(report.contains("Database: app"));
    }

    #[test]
    fn test_connections_window_uses_period() {
        assert!(connections_sql(900).contains("make_interval(secs => 900)"));
    }
}
