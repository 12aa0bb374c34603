//! Weekly schedules and session resolution

pub mod resolver;
pub mod types;

pub use resolver::{ActiveSession, ScheduleResolver};
pub use types::{
    parse_utc_offset, DayOfWeek, RecordingKey, ScheduleSession, SessionTime, Station, WeeklySchedule,
};
