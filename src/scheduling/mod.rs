//! Scheduling module for tandem.
//!
//! Provides cron-based schedules for the failure-detection and
//! auto-activation sweeps.

mod cron;

pub use cron::{CronExpr, CronField, CronParseError};
