//! # Waypoint Schedule Trigger
//!
//! Cron parsing and a local in-process tick loop that fires registered
//! workflows on their due time. Not a distributed scheduler:
//! per spec.md §1's non-goals, triggers use a local scheduler rather than
//! leader election across multiple engine instances.
//!
//! ```ignore
//! use std::sync::Arc;
//! use waypoint_scheduler::{cron::CronSchedule, trigger::{InMemoryTriggerStore, Scheduler, TriggerDefinition}};
//!
//! let scheduler = Arc::new(Scheduler::new(orchestrator, workflows, Arc::new(InMemoryTriggerStore::new())));
//! scheduler.register(TriggerDefinition {
//!     name: "nightly".into(),
//!     workflow_name: "nightly-report".into(),
//!     workflow_namespace: "default".into(),
//!     schedule: CronSchedule::parse("0 2 * * *").unwrap(),
//!     input: serde_json::json!({}),
//! })?;
//! ```

pub mod cron;
pub mod trigger;

pub use cron::{is_due, next_occurrence, CronError, CronSchedule};
pub use trigger::{InMemoryTriggerStore, Scheduler, SchedulerError, TriggerDefinition, TriggerStore};
