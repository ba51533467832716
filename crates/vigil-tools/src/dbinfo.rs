//! Table, instance, extension and settings probes used during the initial assessment

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use crate::query::{as_f64, column_or, Connection, QueryExecutor, Row};

const TABLES_SQL: &str = "SELECT schemaname AS schema, relname AS name, \
       pg_total_relation_size(relid) AS total_bytes, \
       n_live_tup AS live_rows, n_dead_tup AS dead_rows, \
       seq_scan, idx_scan, last_autovacuum, last_autoanalyze \
     FROM pg_stat_user_tables \
     ORDER BY pg_total_relation_size(relid) DESC \
     LIMIT 50";

const INSTANCE_SQL: &str = "SELECT version() AS version, \
       pg_postmaster_start_time() AS started_at, \
       date_trunc('second', now() - pg_postmaster_start_time())::text AS uptime, \
       current_database() AS database, \
       pg_database_size(current_database()) AS database_bytes, \
       current_setting('max_connections') AS max_connections, \
       current_setting('shared_buffers') AS shared_buffers, \
       current_setting('work_mem') AS work_mem";

const EXTENSIONS_SQL: &str = "SELECT name, default_version, installed_version, comment \
     FROM pg_available_extensions \
     ORDER BY (installed_version IS NULL), name";

const SETTINGS_SQL: &str = "SELECT name, setting, unit, source \
     FROM pg_settings \
     WHERE name IN ('shared_buffers', 'effective_cache_size', 'work_mem', 'maintenance_work_mem', \
       'max_connections', 'random_page_cost', 'effective_io_concurrency', 'max_wal_size', \
       'checkpoint_timeout', 'default_statistics_target', 'autovacuum', \
       'autovacuum_max_workers', 'autovacuum_naptime', 'autovacuum_vacuum_scale_factor', \
       'autovacuum_vacuum_threshold', 'autovacuum_analyze_scale_factor', \
       'autovacuum_vacuum_cost_limit', 'autovacuum_vacuum_cost_delay') \
     ORDER BY name";

/// Human-readable byte count
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn render_table(row: &Row) -> String {
    format!(
        "{}.{}: {} | live rows: {} | dead rows: {} | seq scans: {} | index scans: {} | last autovacuum: {}",
        column_or(row, "schema", "public"),
        column_or(row, "name", "?"),
        format_bytes(as_f64(row.get("total_bytes")).unwrap_or(0.0)),
        column_or(row, "live_rows", "0"),
        column_or(row, "dead_rows", "0"),
        column_or(row, "seq_scan", "0"),
        column_or(row, "idx_scan", "0"),
        column_or(row, "last_autovacuum", "never"),
    )
}

fn render_instance(row: &Row) -> String {
    format!(
        "Version: {}\nDatabase: {} ({})\nUp since: {} (uptime {})\nmax_connections: {}\nshared_buffers: {}\nwork_mem: {}",
        column_or(row, "version", "unknown"),
        column_or(row, "database", "unknown"),
        format_bytes(as_f64(row.get("database_bytes")).unwrap_or(0.0)),
        column_or(row, "started_at", "unknown"),
        column_or(row, "uptime", "unknown"),
        column_or(row, "max_connections", "?"),
        column_or(row, "shared_buffers", "?"),
        column_or(row, "work_mem", "?"),
    )
}

pub struct DbInfoCollector {
    executor: Arc<dyn QueryExecutor>,
}

impl DbInfoCollector {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Table sizes and usage plus instance facts; either half may be unavailable
    pub async fn tables_and_instance_info(
        &self,
        connection: &Connection,
        as_user: Option<&str>,
    ) -> String {
        let tables = match self.executor.execute(connection, TABLES_SQL, as_user).await {
            Ok(result) if result.rows.is_empty() => "No user tables found.".to_string(),
            Ok(result) => result
                .rows
                .iter()
                .map(render_table)
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!("Failed to list tables for '{}': {}", connection.name, e);
                format!("Unable to retrieve table information: {}", e)
            }
        };

        let instance = match self.executor.execute(connection, INSTANCE_SQL, as_user).await {
            Ok(result) => result
                .first()
                .map(render_instance)
                .unwrap_or_else(|| "No instance information found.".to_string()),
            Err(e) => {
                warn!("Failed to read instance info for '{}': {}", connection.name, e);
                format!("Unable to retrieve instance information: {}", e)
            }
        };

        format!("=== Tables ===\n{}\n\n=== Instance ===\n{}", tables, instance)
    }

    /// Installed extensions first, then the ones available to install
    pub async fn extensions(&self, connection: &Connection, as_user: Option<&str>) -> Result<String> {
        let result = self
            .executor
            .execute(connection, EXTENSIONS_SQL, as_user)
            .await?;

        let (installed, available): (Vec<&Row>, Vec<&Row>) = result
            .rows
            .iter()
            .partition(|row| crate::query::as_text(row.get("installed_version")).is_some());

        let installed = if installed.is_empty() {
            "(none)".to_string()
        } else {
            installed
                .iter()
                .map(|row| {
                    format!(
                        "- {} {} (default {})",
                        column_or(row, "name", "?"),
                        column_or(row, "installed_version", "?"),
                        column_or(row, "default_version", "?")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let available = available
            .iter()
            .map(|row| column_or(row, "name", "?"))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "Installed extensions:\n{}\n\nAvailable extensions: {}",
            installed,
            if available.is_empty() { "(none)" } else { available.as_str() }
        ))
    }

    pub async fn performance_and_vacuum_settings(
        &self,
        connection: &Connection,
        as_user: Option<&str>,
    ) -> Result<String> {
        let result = self
            .executor
            .execute(connection, SETTINGS_SQL, as_user)
            .await?;

        if result.rows.is_empty() {
            return Ok("No settings found.".to_string());
        }

        Ok(result
            .rows
            .iter()
            .map(|row| {
                let unit = crate::query::as_text(row.get("unit"))
                    .map(|u| format!(" {}", u))
                    .unwrap_or_default();
                format!(
                    "{} = {}{} (source: {})",
                    column_or(row, "name", "?"),
                    column_or(row, "setting", "?"),
                    unit,
                    column_or(row, "source", "default")
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
