//! Query execution against monitored PostgreSQL targets
//!
//! Collectors never touch diesel directly. They go through the
//! `QueryExecutor` capability, which returns every row as a JSON object
//! keyed by column name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
// The domain `Connection` below shadows the prelude's trait
use diesel::Connection as _;
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A monitored database target, owned by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub connection_string: String,
}

/// One result row: column name -> value
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Executes SQL against a target, optionally on behalf of an acting user
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        connection: &Connection,
        sql: &str,
        as_user: Option<&str>,
    ) -> Result<QueryResult>;
}

/// Numeric view of a column. Postgres `numeric` and `bigint` may arrive as strings.
pub fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Text view of a column; null and missing columns are `None`
pub fn as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Column rendered for a report line, with a fallback for null
pub fn column_or(row: &Row, column: &str, fallback: &str) -> String {
    as_text(row.get(column)).unwrap_or_else(|| fallback.to_string())
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

#[derive(QueryableByName, Debug)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row: String,
}

/// Wrap a statement so each row comes back as a single JSON text column
fn wrap_as_json(sql: &str) -> String {
    let body = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT row_to_json(q)::text AS row FROM ({}) q", body)
}

/// Diesel-backed executor; keeps one connection per target
pub struct PgQueryExecutor {
    connections: Mutex<HashMap<Uuid, Arc<Mutex<PgConnection>>>>,
}

impl PgQueryExecutor {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, target: &Connection) -> Result<Option<Arc<Mutex<PgConnection>>>> {
        let cache = self
            .connections
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(cache.get(&target.id).cloned())
    }

    /// Cache a freshly opened connection. A connection cached meanwhile by
    /// another caller wins and is returned instead.
    fn remember(
        &self,
        target: &Connection,
        conn: Arc<Mutex<PgConnection>>,
    ) -> Result<Arc<Mutex<PgConnection>>> {
        let mut cache = self
            .connections
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(cache.entry(target.id).or_insert(conn).clone())
    }

    async fn connection_for(&self, target: &Connection) -> Result<Arc<Mutex<PgConnection>>> {
        if let Some(conn) = self.cached(target)? {
            return Ok(conn);
        }

        // Connecting blocks, so it runs off the runtime and without the cache lock
        let url = target.connection_string.clone();
        let name = target.name.clone();
        let conn = tokio::task::spawn_blocking(move || {
            PgConnection::establish(&url).with_context(|| format!("Failed to connect to '{}'", name))
        })
        .await
        .context("Connect task panicked")??;

        tracing::debug!("Opened connection to target '{}'", target.name);
        self.remember(target, Arc::new(Mutex::new(conn)))
    }

    fn forget(&self, target: &Connection) {
        if let Ok(mut cache) = self.connections.lock() {
            cache.remove(&target.id);
        }
    }
}

impl Default for PgQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(
        &self,
        connection: &Connection,
        sql: &str,
        as_user: Option<&str>,
    ) -> Result<QueryResult> {
        let handle = self.connection_for(connection).await?;
        let wrapped = wrap_as_json(sql);
        let as_user = as_user.map(str::to_string);

        let loaded = tokio::task::spawn_blocking(move || -> Result<Vec<JsonRow>> {
            let mut conn = handle
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

            let rows = match as_user {
                // Scoped to the transaction so the setting never leaks to other runs
                Some(user) => conn.transaction::<_, diesel::result::Error, _>(move |conn| {
                    diesel::sql_query("SELECT set_config('vigil.acting_user', $1, true)")
                        .bind::<Text, _>(user)
                        .execute(conn)?;
                    diesel::sql_query(wrapped).load::<JsonRow>(conn)
                })?,
                None => diesel::sql_query(wrapped).load::<JsonRow>(&mut *conn)?,
            };
            Ok(rows)
        })
        .await
        .context("Query task panicked")?;

        let loaded = match loaded {
            Ok(rows) => rows,
            Err(e) => {
                if e.downcast_ref::<diesel::result::Error>().is_some_and(|err| {
                    matches!(
                        err,
                        diesel::result::Error::DatabaseError(
                            diesel::result::DatabaseErrorKind::ClosedConnection,
                            _
                        )
                    )
                }) {
                    self.forget(connection);
                }
                return Err(e);
            }
        };

        let rows = loaded
            .into_iter()
            .map(|r| serde_json::from_str::<Row>(&r.row).context("Failed to decode row JSON"))
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryResult { rows })
    }
}

// ============================================================================
// Test support
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrap_as_json_strips_terminator() {
        let wrapped = wrap_as_json("  SELECT 1 AS one;\n ");
        assert_eq!(
            wrapped,
            "SELECT row_to_json(q)::text AS row FROM (SELECT 1 AS one) q"
        );
    }

    #[test]
    fn test_as_f64_coerces_strings_and_numbers() {
        assert_eq!(as_f64(Some(&json!(12.5))), Some(12.5));
        assert_eq!(as_f64(Some(&json!("42"))), Some(42.0));
        assert_eq!(as_f64(Some(&json!(null))), None);
        assert_eq!(as_f64(None), None);
        assert_eq!(as_f64(Some(&json!("n/a"))), None);
    }

    #[test]
    fn test_as_text_treats_null_and_empty_as_missing() {
        assert_eq!(as_text(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(as_text(Some(&json!(7))), Some("7".to_string()));
        assert_eq!(as_text(Some(&json!(""))), None);
        assert_eq!(as_text(Some(&json!(null))), None);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let executor = PgQueryExecutor::new();
        let unreachable = Connection {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            name: "offline".to_string(),
            connection_string: "postgres://vigil@127.0.0.1:1/app?connect_timeout=2".to_string(),
        };

        let err = executor
            .execute(&unreachable, "SELECT 1", None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Failed to connect to 'offline'"));
        // The cache lock is free again and holds nothing for the target
        assert!(executor.cached(&unreachable).unwrap().is_none());
        assert!(executor.connections.try_lock().is_ok());
    }
}
