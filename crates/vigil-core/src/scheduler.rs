//! Scheduler for recurring monitoring runs
//!
//! `tick` is the single scheduling cycle:
//! 1. reclaim open runs older than the timeout (and re-arm their schedules)
//! 2. pick due schedules, oldest `next_run` first, up to the free parallel budget
//! 3. mark each running, open a run record, and dispatch it without waiting
//!
//! Dispatched runs report back through a channel; `on_run_complete` closes the
//! run and re-arms the schedule. A run that was already reclaimed is not
//! reopened: its late result is discarded.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::runner::PlaybookRunner;
use crate::schedule::{
    NewSchedule, RunOutcome, RunStatus, Schedule, ScheduleRun, ScheduleStatus,
};
use crate::store::ScheduleStore;
use crate::trigger::{self, format_local, TriggerError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidTrigger(#[from] TriggerError),
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),
    #[error("Schedule store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// A finished run as reported by its task
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run: ScheduleRun,
    pub outcome: RunOutcome,
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Another tick was in progress; nothing was done
    pub skipped: bool,
    /// Run ids closed as timed out
    pub reclaimed: Vec<Uuid>,
    /// Schedule ids dispatched, in dispatch order
    pub dispatched: Vec<Uuid>,
    /// Due schedule ids left for a later tick
    pub deferred: Vec<Uuid>,
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    runner: Arc<dyn PlaybookRunner>,
    config: SchedulerConfig,
    /// Held for the whole tick; a second tick that cannot take it is skipped
    tick_guard: Mutex<()>,
    /// Serializes every schedule/run state transition
    bookkeeping: Mutex<()>,
    completions: mpsc::Sender<RunCompletion>,
}

fn lock<'a>(mutex: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>, SchedulerError> {
    mutex
        .lock()
        .map_err(|e| SchedulerError::Store(anyhow::anyhow!("Lock error: {}", e)))
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runner: Arc<dyn PlaybookRunner>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::Receiver<RunCompletion>) {
        let (tx, rx) = mpsc::channel(config.max_parallel_runs.max(1) * 2);
        (
            Self {
                store,
                runner,
                config,
                tick_guard: Mutex::new(()),
                bookkeeping: Mutex::new(()),
                completions: tx,
            },
            rx,
        )
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn compute_next_run(
        &self,
        schedule: &Schedule,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        Ok(trigger::compute_next_run(schedule, from)?)
    }

    /// Enabled schedules become `scheduled` with a fresh next run; an
    /// unusable trigger marks them `failed`
    fn arm(&self, schedule: &mut Schedule, from: DateTime<Utc>) {
        if !schedule.enabled {
            schedule.status = ScheduleStatus::Disabled;
            schedule.next_run = None;
            return;
        }

        match trigger::compute_next_run(schedule, from) {
            Ok(next) => {
                schedule.status = ScheduleStatus::Scheduled;
                schedule.next_run = Some(next);
            }
            Err(e) => {
                error!("Schedule {} cannot be re-armed: {}", schedule.id, e);
                schedule.status = ScheduleStatus::Failed;
                schedule.next_run = None;
            }
        }
    }

    fn has_open_run(&self, schedule_id: Uuid) -> Result<bool, SchedulerError> {
        Ok(self
            .store
            .open_runs()?
            .iter()
            .any(|run| run.schedule_id == schedule_id))
    }

    // ========================================================================
    // Tick
    // ========================================================================

    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let _tick = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Tick already in progress, skipping");
                return Ok(TickReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let _books = lock(&self.bookkeeping)?;

        let mut report = TickReport::default();
        let timeout = Duration::seconds(self.config.timeout_seconds);

        // Stall recovery
        let (stale, live): (Vec<ScheduleRun>, Vec<ScheduleRun>) = self
            .store
            .open_runs()?
            .into_iter()
            .partition(|run| now - run.started_at > timeout);

        for run in stale {
            let message = format!(
                "Run timed out after {} seconds without completing",
                self.config.timeout_seconds
            );
            if !self
                .store
                .close_run(run.id, now, RunStatus::Failure, "", Some(message.as_str()))?
            {
                continue;
            }
            warn!(
                "Reclaimed run {} of schedule {} (started {})",
                run.id,
                run.schedule_id,
                format_local(run.started_at, self.config.display_timezone)
            );
            report.reclaimed.push(run.id);

            if let Some(mut schedule) = self.store.get(run.schedule_id)? {
                schedule.last_run = Some(run.started_at);
                if schedule.status == ScheduleStatus::Running {
                    self.arm(&mut schedule, now);
                }
                self.store.update(&schedule)?;
            }
        }

        let schedules = self.store.list()?;
        let busy: HashSet<Uuid> = live.iter().map(|run| run.schedule_id).collect();

        // A running schedule with no open run lost its record (crash between writes)
        for schedule in &schedules {
            if schedule.status == ScheduleStatus::Running && !busy.contains(&schedule.id) {
                warn!("Schedule {} is running without an open run, re-arming", schedule.id);
                let mut schedule = schedule.clone();
                self.arm(&mut schedule, now);
                self.store.update(&schedule)?;
            }
        }

        let mut due: Vec<Schedule> = schedules
            .into_iter()
            .filter(|s| {
                s.enabled
                    && s.status == ScheduleStatus::Scheduled
                    && s.next_run.is_some_and(|next| next <= now)
                    && !busy.contains(&s.id)
            })
            .collect();
        due.sort_by_key(|s| (s.next_run, s.id));

        let budget = self.config.max_parallel_runs.saturating_sub(live.len());
        if due.len() > budget {
            info!(
                "{} due schedule(s), {} slot(s) free; deferring {}",
                due.len(),
                budget,
                due.len() - budget
            );
            report.deferred = due[budget..].iter().map(|s| s.id).collect();
            due.truncate(budget);
        }

        for mut schedule in due {
            let run = ScheduleRun::start(schedule.id, now);
            self.store.create_run(&run)?;
            schedule.status = ScheduleStatus::Running;
            self.store.update(&schedule)?;

            info!(
                "Dispatching playbook '{}' for schedule {} (due {})",
                schedule.playbook,
                schedule.id,
                schedule
                    .next_run
                    .map(|next| format_local(next, self.config.display_timezone))
                    .unwrap_or_default()
            );
            report.dispatched.push(schedule.id);
            self.dispatch(schedule, run);
        }

        Ok(report)
    }

    fn dispatch(&self, schedule: Schedule, run: ScheduleRun) {
        let runner = self.runner.clone();
        let tx = self.completions.clone();

        tokio::spawn(async move {
            let outcome = runner.run(&schedule).await;
            let run_id = run.id;
            if tx.send(RunCompletion { run, outcome }).await.is_err() {
                warn!("Completion channel closed, dropping result of run {}", run_id);
            }
        });
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Close the run and re-arm its schedule. Returns false when the run had
    /// already been closed (reclaimed) and the result was discarded.
    pub fn on_run_complete(
        &self,
        completion: RunCompletion,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let _books = lock(&self.bookkeeping)?;
        let RunCompletion { run, outcome } = completion;

        let closed = self.store.close_run(
            run.id,
            now,
            outcome.status,
            &outcome.summary,
            outcome.error.as_deref(),
        )?;
        if !closed {
            warn!(
                "Discarding late result of run {} for schedule {}; it was already closed",
                run.id, run.schedule_id
            );
            return Ok(false);
        }

        let Some(mut schedule) = self.store.get(run.schedule_id)? else {
            warn!("Schedule {} was deleted while run {} was in flight", run.schedule_id, run.id);
            return Ok(true);
        };

        schedule.last_run = Some(run.started_at);
        if schedule.enabled && outcome.fatal {
            error!(
                "Schedule {} failed with a configuration error: {}",
                schedule.id,
                outcome.error.as_deref().unwrap_or("unknown")
            );
            schedule.status = ScheduleStatus::Failed;
            schedule.next_run = None;
        } else {
            self.arm(&mut schedule, now);
        }
        self.store.update(&schedule)?;

        match outcome.status {
            RunStatus::Success => info!("Run {} of schedule {} succeeded", run.id, schedule.id),
            _ => warn!(
                "Run {} of schedule {} failed: {}",
                run.id,
                schedule.id,
                outcome.error.as_deref().unwrap_or("unknown")
            ),
        }
        if let Some(next) = schedule.next_run {
            debug!(
                "Schedule {} next runs at {}",
                schedule.id,
                format_local(next, self.config.display_timezone)
            );
        }

        Ok(true)
    }

    // ========================================================================
    // Management
    // ========================================================================

    pub fn create_schedule(
        &self,
        new: NewSchedule,
        now: DateTime<Utc>,
    ) -> Result<Schedule, SchedulerError> {
        let mut schedule = new.into_schedule(Uuid::new_v4());
        if schedule.enabled {
            schedule.next_run = Some(trigger::compute_next_run(&schedule, now)?);
            schedule.status = ScheduleStatus::Scheduled;
        }

        let _books = lock(&self.bookkeeping)?;
        self.store.create(&schedule)?;
        info!("Created schedule {} for playbook '{}'", schedule.id, schedule.playbook);
        Ok(schedule)
    }

    /// Persist user edits; status and next run are derived, never taken from the caller
    pub fn update_schedule(
        &self,
        edited: Schedule,
        now: DateTime<Utc>,
    ) -> Result<Schedule, SchedulerError> {
        let _books = lock(&self.bookkeeping)?;
        let existing = self
            .store
            .get(edited.id)?
            .ok_or(SchedulerError::ScheduleNotFound(edited.id))?;

        let mut schedule = Schedule {
            last_run: existing.last_run,
            status: existing.status,
            next_run: existing.next_run,
            ..edited
        };

        let trigger_changed = schedule.schedule_expression != existing.schedule_expression;
        if schedule.status == ScheduleStatus::Running && self.has_open_run(schedule.id)? {
            // completion re-arms it
            if !schedule.enabled {
                schedule.status = ScheduleStatus::Disabled;
                schedule.next_run = None;
            }
        } else if !schedule.enabled {
            schedule.status = ScheduleStatus::Disabled;
            schedule.next_run = None;
        } else if trigger_changed
            || schedule.status != ScheduleStatus::Scheduled
            || schedule.next_run.is_none()
        {
            schedule.next_run = Some(trigger::compute_next_run(&schedule, now)?);
            schedule.status = ScheduleStatus::Scheduled;
        }

        self.store.update(&schedule)?;
        Ok(schedule)
    }

    /// Toggle a schedule. Disabling never aborts an in-flight run, and that
    /// run's completion will not re-arm the schedule.
    pub fn set_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Schedule, SchedulerError> {
        let _books = lock(&self.bookkeeping)?;
        let mut schedule = self
            .store
            .get(id)?
            .ok_or(SchedulerError::ScheduleNotFound(id))?;

        schedule.enabled = enabled;
        if enabled && self.has_open_run(id)? {
            schedule.status = ScheduleStatus::Running;
            schedule.next_run = None;
        } else {
            self.arm(&mut schedule, now);
        }

        self.store.update(&schedule)?;
        info!(
            "Schedule {} {} (status {})",
            id,
            if enabled { "enabled" } else { "disabled" },
            schedule.status.as_str()
        );
        Ok(schedule)
    }

    pub fn delete_schedule(&self, id: Uuid) -> Result<bool, SchedulerError> {
        let _books = lock(&self.bookkeeping)?;
        Ok(self.store.delete(id)?)
    }

    pub fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, SchedulerError> {
        Ok(self.store.get(id)?)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.store.list()?)
    }

    pub fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<ScheduleRun>, SchedulerError> {
        Ok(self.store.list_runs(schedule_id)?)
    }
}

// ============================================================================
// Background loops
// ============================================================================

/// Spawn the periodic tick loop
pub fn spawn_scheduler(scheduler: Arc<Scheduler>, poll_interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(poll_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match scheduler.tick(Utc::now()) {
                Ok(report) if !report.dispatched.is_empty() || !report.reclaimed.is_empty() => {
                    debug!(
                        "Tick dispatched {} and reclaimed {} run(s)",
                        report.dispatched.len(),
                        report.reclaimed.len()
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Scheduler tick failed: {}", e),
            }
        }
    })
}

/// Spawn the loop that records finished runs
pub fn spawn_completion_loop(
    scheduler: Arc<Scheduler>,
    mut completions: mpsc::Receiver<RunCompletion>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(completion) = completions.recv().await {
            let run_id = completion.run.id;
            if let Err(e) = scheduler.on_run_complete(completion, Utc::now()) {
                error!("Failed to record completion of run {}: {}", run_id, e);
            }
        }
        warn!("Completion channel closed, stopping completion loop");
    })
}
