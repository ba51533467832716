//! Schedule and run records
//!
//! A `Schedule` is the persistent definition of a recurring monitoring task.
//! A `ScheduleRun` is one execution attempt of it. Both are plain data; the
//! scheduler owns every state transition.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Schedule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    Running,
    Disabled,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Running => "running",
            ScheduleStatus::Disabled => "disabled",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(ScheduleStatus::Scheduled),
            "running" => Ok(ScheduleStatus::Running),
            "disabled" => Ok(ScheduleStatus::Disabled),
            "failed" => Ok(ScheduleStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid schedule status: {}", s)),
        }
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            _ => Err(anyhow::anyhow!("Invalid run status: {}", s)),
        }
    }
}

/// A recurring monitoring task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub user_id: String,
    pub connection_id: Uuid,
    pub playbook: String,
    /// Cron-style trigger description
    pub schedule_expression: String,
    pub additional_instructions: Option<String>,
    /// Model id with provider prefix, e.g. `openai-gpt-4o`
    pub model: String,
    pub enabled: bool,
    pub status: ScheduleStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub user_id: String,
    pub connection_id: Uuid,
    pub playbook: String,
    pub schedule_expression: String,
    pub additional_instructions: Option<String>,
    pub model: String,
    pub enabled: bool,
}

impl NewSchedule {
    /// Unarmed record; the scheduler fills in status and next run
    pub fn into_schedule(self, id: Uuid) -> Schedule {
        Schedule {
            id,
            user_id: self.user_id,
            connection_id: self.connection_id,
            playbook: self.playbook,
            schedule_expression: self.schedule_expression,
            additional_instructions: self.additional_instructions,
            model: self.model,
            enabled: self.enabled,
            status: ScheduleStatus::Disabled,
            last_run: None,
            next_run: None,
        }
    }
}

/// One execution attempt of a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub summary: String,
    pub error: Option<String>,
}

impl ScheduleRun {
    pub fn start(schedule_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            summary: String::new(),
            error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// What the executor reports back for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub summary: String,
    pub error: Option<String>,
    /// Set for configuration errors that retrying cannot fix (e.g. a missing connection)
    pub fatal: bool,
}

impl RunOutcome {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Success,
            summary: summary.into(),
            error: None,
            fatal: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            summary: String::new(),
            error: Some(error.into()),
            fatal: false,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::failure(error)
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}
