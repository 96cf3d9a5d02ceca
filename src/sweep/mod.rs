//! Time-based sweeps
//!
//! Expires temporary bans and timeouts and delivers due reminders by scanning
//! store documents on a fixed interval.

mod error;
mod handler;
mod record;
mod scheduler;

pub use error::{SweepError, SweepResult};
pub use handler::{
    DEFAULT_COMPLETED_FIELD, ReminderHandler, Registration, SweepHandler, UnbanHandler,
    UnmuteHandler,
};
pub use record::{
    ACTIVE_FIELD, DueRecord, RecordLocator, RecordStatus, classify, format_timestamp,
    timestamp_field,
};
pub use scheduler::{
    DEFAULT_RETENTION_DAYS, DEFAULT_SWEEP_INTERVAL, SweepConfig, SweepHandle, SweepReport,
    SweepScheduler,
};

/// Request type for the sweep task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepRequest {
    /// Run a sweep now instead of waiting for the interval
    SweepNow,
    /// Shutdown the sweep task
    Shutdown,
}
