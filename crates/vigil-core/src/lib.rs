//! Vigil Core Library
//!
//! Scheduling and playbook execution for the Vigil monitoring agent.

pub mod config;
pub mod executor;
pub mod model;
pub mod pg_store;
pub mod playbook;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod tools;
pub mod toolsets;
pub mod trigger;

// Re-export key types for convenience
pub use config::{Config, SchedulerConfig};
pub use executor::{ExecutorError, PlaybookExecutor};
pub use model::{ModelClient, OpenAiCompatClient};
pub use runner::{MonitoringRunner, PlaybookRunner};
pub use schedule::{NewSchedule, RunOutcome, RunStatus, Schedule, ScheduleRun, ScheduleStatus};
pub use scheduler::{RunCompletion, Scheduler, SchedulerError, TickReport};
pub use store::{ConnectionStore, MemoryStore, ScheduleStore};
pub use tools::{ToolDescriptor, ToolError, ToolRegistry, ToolsetGroup};
pub use trigger::{compute_next_run, generate_cron_expression, TriggerError};
