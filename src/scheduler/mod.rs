//! Restart-safe recurring task scheduling.

pub mod persistent;

pub use persistent::{PersistentScheduler, ScheduleState};
