//! Schedule resolution
//!
//! Maps a weekly schedule and the current instant to the session that is on
//! air. Overlapping sessions are not merged: the first match in list order
//! wins, and today's sessions are checked before yesterday's overnight ones.

use super::types::{DayOfWeek, RecordingKey, ScheduleSession, WeeklySchedule};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Serialize;

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// A schedule session anchored to the date it started on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSession {
    pub session: ScheduleSession,

    /// Weekday the session belongs to in the schedule
    pub day_of_week: DayOfWeek,

    /// Date (station local) the session started on
    pub session_date: NaiveDate,

    pub starts_at: DateTime<FixedOffset>,

    pub ends_at: DateTime<FixedOffset>,
}

impl ActiveSession {
    /// Anchor `session` to `session_date` in the `tz` offset
    pub fn new(session: ScheduleSession, session_date: NaiveDate, tz: FixedOffset) -> Self {
        let start = session_date.and_time(session.start_time.to_naive());
        let mut end = session_date.and_time(session.end_time.to_naive());
        if session.crosses_midnight() {
            end += Duration::days(1);
        }

        Self {
            day_of_week: session_date.weekday().into(),
            session_date,
            starts_at: localize(start, tz),
            ends_at: localize(end, tz),
            session,
        }
    }

    pub fn key(&self, station_id: &str) -> RecordingKey {
        RecordingKey::new(station_id, self.session_date, self.session.start_time)
    }

    pub fn should_start(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at.with_timezone(&Utc)
    }

    pub fn should_stop(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at.with_timezone(&Utc)
    }
}

fn localize(local: NaiveDateTime, tz: FixedOffset) -> DateTime<FixedOffset> {
    let utc = local - Duration::seconds(i64::from(tz.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, tz)
}

/// Resolves sessions in one fixed station timezone
#[derive(Debug, Clone, Copy)]
pub struct ScheduleResolver {
    tz: FixedOffset,
}

impl ScheduleResolver {
    pub fn new(tz: FixedOffset) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    /// Session on air at `now`, if any
    pub fn current_session(&self, schedule: &WeeklySchedule, now: DateTime<Utc>) -> Option<ActiveSession> {
        let local = now.with_timezone(&self.tz);
        let today = local.date_naive();
        let seconds = local.num_seconds_from_midnight();
        let day = DayOfWeek::from(local.weekday());

        if let Some(session) = schedule.sessions_on(day).iter().find(|s| s.contains(seconds)) {
            return Some(ActiveSession::new(session.clone(), today, self.tz));
        }

        // Yesterday's overnight sessions, measured from yesterday's midnight
        let yesterday = today.pred_opt()?;
        schedule
            .sessions_on(day.pred())
            .iter()
            .filter(|s| s.crosses_midnight())
            .find(|s| s.contains(seconds + SECONDS_PER_DAY))
            .map(|s| ActiveSession::new(s.clone(), yesterday, self.tz))
    }

    /// The resolved session's date in this resolver's timezone
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }
}
