//! Schedule and connection persistence seams
//!
//! The scheduler only depends on these traits. `MemoryStore` backs tests and
//! local runs; `PgStore` (see `pg_store`) is the diesel-backed store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use vigil_tools::Connection;

use crate::schedule::{RunStatus, Schedule, ScheduleRun};

pub trait ScheduleStore: Send + Sync {
    fn create(&self, schedule: &Schedule) -> Result<()>;
    fn update(&self, schedule: &Schedule) -> Result<()>;
    fn get(&self, id: Uuid) -> Result<Option<Schedule>>;
    fn list(&self) -> Result<Vec<Schedule>>;
    /// Removes the schedule and its run history; false if it did not exist
    fn delete(&self, id: Uuid) -> Result<bool>;

    /// Runs of one schedule, newest first
    fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<ScheduleRun>>;
    fn create_run(&self, run: &ScheduleRun) -> Result<()>;
    /// Close a run if it is still open. Returns false when it was already closed
    /// or no longer exists.
    fn close_run(
        &self,
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        status: RunStatus,
        summary: &str,
        error: Option<&str>,
    ) -> Result<bool>;
    /// Runs with no `finished_at`
    fn open_runs(&self) -> Result<Vec<ScheduleRun>>;
}

pub trait ConnectionStore: Send + Sync {
    fn get_connection(&self, id: Uuid) -> Result<Option<Connection>>;
}

#[derive(Default)]
struct MemoryState {
    schedules: HashMap<Uuid, Schedule>,
    runs: HashMap<Uuid, ScheduleRun>,
    connections: HashMap<Uuid, Connection>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, connection: Connection) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        state.connections.insert(connection.id, connection);
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        f(&mut *state)
    }
}

impl ScheduleStore for MemoryStore {
    fn create(&self, schedule: &Schedule) -> Result<()> {
        self.with_state(|state| {
            if state.schedules.contains_key(&schedule.id) {
                anyhow::bail!("Schedule {} already exists", schedule.id);
            }
            state.schedules.insert(schedule.id, schedule.clone());
            Ok(())
        })
    }

    fn update(&self, schedule: &Schedule) -> Result<()> {
        self.with_state(|state| match state.schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => Err(anyhow::anyhow!("Schedule {} not found", schedule.id)),
        })
    }

    fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        self.with_state(|state| Ok(state.schedules.get(&id).cloned()))
    }

    fn list(&self) -> Result<Vec<Schedule>> {
        self.with_state(|state| {
            let mut schedules: Vec<Schedule> = state.schedules.values().cloned().collect();
            schedules.sort_by_key(|s| s.id);
            Ok(schedules)
        })
    }

    fn delete(&self, id: Uuid) -> Result<bool> {
        self.with_state(|state| {
            let existed = state.schedules.remove(&id).is_some();
            state.runs.retain(|_, run| run.schedule_id != id);
            Ok(existed)
        })
    }

    fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<ScheduleRun>> {
        self.with_state(|state| {
            let mut runs: Vec<ScheduleRun> = state
                .runs
                .values()
                .filter(|run| run.schedule_id == schedule_id)
                .cloned()
                .collect();
            runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok(runs)
        })
    }

    fn create_run(&self, run: &ScheduleRun) -> Result<()> {
        self.with_state(|state| {
            state.runs.insert(run.id, run.clone());
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
        self.with_state(|state| match state.runs.get_mut(&run_id) {
            Some(run) if run.is_open() => {
                run.finished_at = Some(finished_at);
                run.status = status;
                run.summary = summary.to_string();
                run.error = error.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn open_runs(&self) -> Result<Vec<ScheduleRun>> {
        self.with_state(|state| {
            Ok(state
                .runs
                .values()
                .filter(|run| run.is_open())
                .cloned()
                .collect())
        })
    }
}

impl ConnectionStore for MemoryStore {
    fn get_connection(&self, id: Uuid) -> Result<Option<Connection>> {
        self.with_state(|state| Ok(state.connections.get(&id).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{NewSchedule, ScheduleStatus};
    use chrono::TimeZone;

    fn schedule() -> Schedule {
        NewSchedule {
            user_id: "user-1".to_string(),
            connection_id: Uuid::new_v4(),
            playbook: "generalMonitoring".to_string(),
            schedule_expression: "0 2 * * *".to_string(),
            additional_instructions: None,
            model: "openai-gpt-4o".to_string(),
            enabled: false,
        }
        .into_schedule(Uuid::new_v4())
    }

    #[test]
    fn test_schedule_crud() {
        let store = MemoryStore::new();
        let mut s = schedule();

        store.create(&s).unwrap();
        assert!(store.create(&s).is_err());

        s.status = ScheduleStatus::Failed;
        store.update(&s).unwrap();
        assert_eq!(store.get(s.id).unwrap().unwrap().status, ScheduleStatus::Failed);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.delete(s.id).unwrap());
        assert!(!store.delete(s.id).unwrap());
        assert!(store.get(s.id).unwrap().is_none());
    }

    #[test]
    fn test_close_run_only_once() {
        let store = MemoryStore::new();
        let started = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let run = ScheduleRun::start(Uuid::new_v4(), started);
        store.create_run(&run).unwrap();
        assert_eq!(store.open_runs().unwrap().len(), 1);

        let finished = started + chrono::Duration::minutes(20);
        assert!(store
            .close_run(run.id, finished, RunStatus::Failure, "", Some("timed out"))
            .unwrap());
        assert!(!store
            .close_run(run.id, finished, RunStatus::Success, "late summary", None)
            .unwrap());

        let closed = &store.list_runs(run.schedule_id).unwrap()[0];
        assert_eq!(closed.status, RunStatus::Failure);
        assert_eq!(closed.error.as_deref(), Some("timed out"));
        assert_eq!(closed.summary, "");
        assert!(store.open_runs().unwrap().is_empty());
    }

    #[test]
    fn test_delete_drops_run_history() {
        let store = MemoryStore::new();
        let s = schedule();
        store.create(&s).unwrap();
        store.create_run(&ScheduleRun::start(s.id, Utc::now())).unwrap();

        store.delete(s.id).unwrap();

        assert!(store.list_runs(s.id).unwrap().is_empty());
    }
}
