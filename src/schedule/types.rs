//! Schedule data types
//!
//! Stations, their weekly program grid and the identity of one capture
//! attempt. Times are wall-clock times in the station's fixed UTC offset.

use chrono::{FixedOffset, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// A station that can be recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,

    pub name: String,

    /// Live stream the capture process connects to
    pub stream_url: String,

    /// Fixed UTC offset such as `+03:00`; the deployment default applies when absent
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Day of the week as used for schedule keys (`"monday"` .. `"sunday"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        }
    }

    /// The day before
    pub fn pred(&self) -> Self {
        Weekday::from(*self).pred().into()
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

impl From<DayOfWeek> for Weekday {
    fn from(day: DayOfWeek) -> Self {
        match day {
            DayOfWeek::Monday => Weekday::Mon,
            DayOfWeek::Tuesday => Weekday::Tue,
            DayOfWeek::Wednesday => Weekday::Wed,
            DayOfWeek::Thursday => Weekday::Thu,
            DayOfWeek::Friday => Weekday::Fri,
            DayOfWeek::Saturday => Weekday::Sat,
            DayOfWeek::Sunday => Weekday::Sun,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time of day with minute precision, written `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionTime {
    hour: u8,
    minute: u8,
}

impl SessionTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn seconds_of_day(&self) -> u32 {
        u32::from(self.hour) * 3600 + u32::from(self.minute) * 60
    }

    /// `HHMM`, as used in recording keys
    pub fn compact(&self) -> String {
        format!("{:02}{:02}", self.hour, self.minute)
    }

    pub fn to_naive(&self) -> NaiveTime {
        NaiveTime::from_num_seconds_from_midnight_opt(self.seconds_of_day(), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for SessionTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(hour), Some(minute)) = (parts.next(), parts.next()) else {
            return Err(format!("invalid session time '{}', expected HH:MM", s));
        };
        // "09:00:00" is accepted, seconds must be zero
        if let Some(seconds) = parts.next() {
            if seconds != "00" || parts.next().is_some() {
                return Err(format!("invalid session time '{}', expected HH:MM", s));
            }
        }

        let hour: u8 = hour
            .parse()
            .map_err(|_| format!("invalid hour in session time '{}'", s))?;
        let minute: u8 = minute
            .parse()
            .map_err(|_| format!("invalid minute in session time '{}'", s))?;

        SessionTime::new(hour, minute).ok_or_else(|| format!("session time '{}' out of range", s))
    }
}

impl TryFrom<String> for SessionTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionTime> for String {
    fn from(time: SessionTime) -> Self {
        time.to_string()
    }
}

impl fmt::Display for SessionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// One scheduled program slot on a given weekday
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSession {
    #[serde(default)]
    pub program_id: Option<String>,

    pub start_time: SessionTime,

    /// At or before `start_time` means the session runs past midnight
    pub end_time: SessionTime,

    #[serde(default)]
    pub studio: Option<String>,

    #[serde(default)]
    pub host_ids: Vec<String>,

    #[serde(default = "default_true")]
    pub is_live: bool,

    #[serde(default)]
    pub is_repeat: bool,

    #[serde(default)]
    pub notes: Option<String>,
}

impl ScheduleSession {
    pub fn crosses_midnight(&self) -> bool {
        self.end_time <= self.start_time
    }

    /// End in seconds from the start day's midnight, +24h for overnight sessions
    pub fn end_seconds(&self) -> u32 {
        let end = self.end_time.seconds_of_day();
        if self.crosses_midnight() {
            end + SECONDS_PER_DAY
        } else {
            end
        }
    }

    /// Whether `seconds` (from the start day's midnight) falls in `[start, end)`
    pub fn contains(&self, seconds: u32) -> bool {
        self.start_time.seconds_of_day() <= seconds && seconds < self.end_seconds()
    }

    pub fn duration_seconds(&self) -> u32 {
        self.end_seconds() - self.start_time.seconds_of_day()
    }
}

/// Sessions per weekday, in list order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule(pub BTreeMap<DayOfWeek, Vec<ScheduleSession>>);

impl WeeklySchedule {
    pub fn sessions_on(&self, day: DayOfWeek) -> &[ScheduleSession] {
        self.0.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

/// Identity of one capture attempt: `{station_id}_{YYYYMMDD}_{HHMM}`
///
/// The date is the day the session started, so an overnight session keeps
/// its key after midnight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordingKey {
    pub station_id: String,
    pub session_date: NaiveDate,
    pub start_time: SessionTime,
}

impl RecordingKey {
    pub fn new(station_id: impl Into<String>, session_date: NaiveDate, start_time: SessionTime) -> Self {
        Self {
            station_id: station_id.into(),
            session_date,
            start_time,
        }
    }

    pub fn belongs_to(&self, station_id: &str) -> bool {
        self.station_id == station_id
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.station_id,
            self.session_date.format("%Y%m%d"),
            self.start_time.compact()
        )
    }
}

/// Parse a fixed UTC offset: `UTC`, `Z`, `+03:00`, `-0530` or `+3`
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, String> {
    let invalid = || format!("invalid UTC offset '{}', expected e.g. +03:00", value);

    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(invalid()),
    };
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return Err(invalid());
    }

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };

    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
