//! PostgreSQL-backed schedule and connection store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
// `vigil_tools::Connection` shadows the prelude's trait
use diesel::Connection as _;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use vigil_tools::Connection;

use crate::schedule::{RunStatus, Schedule, ScheduleRun, ScheduleStatus};
use crate::schema::{connections, schedule_runs, schedules};
use crate::store::{ConnectionStore, ScheduleStore};

// ============================================================================
// Rows
// ============================================================================

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = schedules)]
#[diesel(treat_none_as_null = true)]
struct ScheduleRow {
    id: Uuid,
    user_id: String,
    connection_id: Uuid,
    playbook: String,
    schedule_expression: String,
    additional_instructions: Option<String>,
    model: String,
    enabled: bool,
    status: String,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

impl From<&Schedule> for ScheduleRow {
    fn from(s: &Schedule) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id.clone(),
            connection_id: s.connection_id,
            playbook: s.playbook.clone(),
            schedule_expression: s.schedule_expression.clone(),
            additional_instructions: s.additional_instructions.clone(),
            model: s.model.clone(),
            enabled: s.enabled,
            status: s.status.as_str().to_string(),
            last_run: s.last_run,
            next_run: s.next_run,
        }
    }
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = anyhow::Error;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        Ok(Schedule {
            id: row.id,
            user_id: row.user_id,
            connection_id: row.connection_id,
            playbook: row.playbook,
            schedule_expression: row.schedule_expression,
            additional_instructions: row.additional_instructions,
            model: row.model,
            enabled: row.enabled,
            status: ScheduleStatus::from_str(&row.status)?,
            last_run: row.last_run,
            next_run: row.next_run,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = schedule_runs)]
struct RunRow {
    id: Uuid,
    schedule_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    summary: String,
    error: Option<String>,
}

impl From<&ScheduleRun> for RunRow {
    fn from(run: &ScheduleRun) -> Self {
        Self {
            id: run.id,
            schedule_id: run.schedule_id,
            started_at: run.started_at,
            finished_at: run.finished_at,
            status: run.status.as_str().to_string(),
            summary: run.summary.clone(),
            error: run.error.clone(),
        }
    }
}

impl TryFrom<RunRow> for ScheduleRun {
    type Error = anyhow::Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(ScheduleRun {
            id: row.id,
            schedule_id: row.schedule_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: RunStatus::from_str(&row.status)?,
            summary: row.summary,
            error: row.error,
        })
    }
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = connections)]
struct ConnectionRow {
    id: Uuid,
    user_id: String,
    name: String,
    connection_string: String,
}

// ============================================================================
// Store
// ============================================================================

pub struct PgStore {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgStore {
    pub fn new(conn: Arc<Mutex<PgConnection>>) -> Self {
        Self { conn }
    }

    pub fn connect(db_url: &str) -> Result<Self> {
        let conn = PgConnection::establish(db_url).context("Failed to connect to database")?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut PgConnection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        f(&mut *conn)
    }
}

impl ScheduleStore for PgStore {
    fn create(&self, schedule: &Schedule) -> Result<()> {
        self.with_conn(|conn| {
            diesel::insert_into(schedules::table)
                .values(&ScheduleRow::from(schedule))
                .execute(conn)
                .context("Failed to insert schedule")?;
            Ok(())
        })
    }

    fn update(&self, schedule: &Schedule) -> Result<()> {
        self.with_conn(|conn| {
            let updated = diesel::update(schedules::table.find(schedule.id))
                .set(&ScheduleRow::from(schedule))
                .execute(conn)
                .context("Failed to update schedule")?;
            if updated == 0 {
                anyhow::bail!("Schedule {} not found", schedule.id);
            }
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        self.with_conn(|conn| {
            let row: Option<ScheduleRow> = schedules::table
                .find(id)
                .select(ScheduleRow::as_select())
                .first(conn)
                .optional()
                .context("Failed to query schedule")?;
            row.map(Schedule::try_from).transpose()
        })
    }

    fn list(&self) -> Result<Vec<Schedule>> {
        self.with_conn(|conn| {
            let rows: Vec<ScheduleRow> = schedules::table
                .select(ScheduleRow::as_select())
                .order(schedules::created_at.asc())
                .load(conn)
                .context("Failed to query schedules")?;
            rows.into_iter().map(Schedule::try_from).collect()
        })
    }

    fn delete(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = diesel::delete(schedules::table.find(id))
                .execute(conn)
                .context("Failed to delete schedule")?;
            Ok(deleted > 0)
        })
    }

    fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<ScheduleRun>> {
        self.with_conn(|conn| {
            let rows: Vec<RunRow> = schedule_runs::table
                .filter(schedule_runs::schedule_id.eq(schedule_id))
                .select(RunRow::as_select())
                .order(schedule_runs::started_at.desc())
                .load(conn)
                .context("Failed to query schedule runs")?;
            rows.into_iter().map(ScheduleRun::try_from).collect()
        })
    }

    fn create_run(&self, run: &ScheduleRun) -> Result<()> {
        self.with_conn(|conn| {
            diesel::insert_into(schedule_runs::table)
                .values(&RunRow::from(run))
                .execute(conn)
                .context("Failed to insert schedule run")?;
            Ok(())
        })
    }

    fn close_run(
        &self,
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        status: RunStatus,
        summary: &str,
        error: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = diesel::update(
                schedule_runs::table
                    .filter(schedule_runs::id.eq(run_id))
                    .filter(schedule_runs::finished_at.is_null()),
            )
            .set((
                schedule_runs::finished_at.eq(finished_at),
                schedule_runs::status.eq(status.as_str()),
                schedule_runs::summary.eq(summary),
                schedule_runs::error.eq(error),
            ))
            .execute(conn)
            .context("Failed to close schedule run")?;

            Ok(updated > 0)
        })
    }

    fn open_runs(&self) -> Result<Vec<ScheduleRun>> {
        self.with_conn(|conn| {
            let rows: Vec<RunRow> = schedule_runs::table
                .filter(schedule_runs::finished_at.is_null())
                .select(RunRow::as_select())
                .order(schedule_runs::started_at.asc())
                .load(conn)
                .context("Failed to query open runs")?;
            rows.into_iter().map(ScheduleRun::try_from).collect()
        })
    }
}

impl ConnectionStore for PgStore {
    fn get_connection(&self, id: Uuid) -> Result<Option<Connection>> {
        self.with_conn(|conn| {
            let row: Option<ConnectionRow> = connections::table
                .find(id)
                .select(ConnectionRow::as_select())
                .first(conn)
                .optional()
                .context("Failed to query connection")?;

            Ok(row.map(|r| Connection {
                id: r.id,
                user_id: r.user_id,
                name: r.name,
                connection_string: r.connection_string,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_reports_unreachable_database() {
        let result = PgStore::connect("postgres://vigil@127.0.0.1:1/vigil?connect_timeout=2");

        let err = result.err().unwrap();
        assert!(err.to_string().contains("Failed to connect to database"));
    }
}
