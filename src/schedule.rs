//! Weekly programming: the SQLite store and the slot-filling scheduler.

pub mod auto;
pub mod store;

pub use auto::{AutoScheduler, FillReport, FillStrategy, PlannedSlot};
pub use store::{
    ConflictResolution, NewShow, Schedule, ScheduleChannel, ScheduleStore, ScheduleSummary, Show,
    TimeSlot,
};
