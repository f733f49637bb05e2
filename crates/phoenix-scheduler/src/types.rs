//! Schedule types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ScheduleError;

/// Artifact holding the scheduler's bookkeeping.
pub const SCHEDULE_STATE_FILE: &str = "schedule_state.txt";

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// The schedule as it appears in the settings document: one array per
/// lowercase weekday name, each element an object with optional `on`/`off`.
///
/// Elements are kept as raw JSON so one malformed slot does not reject the
/// whole document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleDocument(pub BTreeMap<String, Vec<serde_json::Value>>);

/// One slot as written in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off: Option<String>,
}

/// One `{on, off}` window within a weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub on: Option<NaiveTime>,
    pub off: Option<NaiveTime>,
}

impl TimeSlot {
    pub fn new(on: Option<NaiveTime>, off: Option<NaiveTime>) -> Self {
        Self { on, off }
    }

    /// A window from `on` to `off`.
    pub fn window(on: NaiveTime, off: NaiveTime) -> Self {
        Self::new(Some(on), Some(off))
    }

    /// The off boundary lands on the following calendar day.
    pub fn off_rolls_over(&self) -> bool {
        matches!((self.on, self.off), (Some(on), Some(off)) if off <= on)
    }
}

/// Slots for each weekday, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: [Vec<TimeSlot>; 7],
}

/// Something in a schedule document that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleIssue {
    /// Weekday key as written.
    pub day: String,
    /// Position of the slot, if the issue concerns one slot.
    pub index: Option<usize>,
    pub reason: String,
}

impl fmt::Display for ScheduleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]: {}", self.day, index, self.reason),
            None => write!(f, "{}: {}", self.day, self.reason),
        }
    }
}

/// A parsed schedule plus whatever had to be skipped to get it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSchedule {
    pub schedule: WeeklySchedule,
    pub issues: Vec<ScheduleIssue>,
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`WeeklySchedule::push`].
    pub fn with_slot(mut self, day: Weekday, slot: TimeSlot) -> Self {
        self.push(day, slot);
        self
    }

    pub fn push(&mut self, day: Weekday, slot: TimeSlot) {
        self.days[day.num_days_from_monday() as usize].push(slot);
    }

    pub fn slots(&self, day: Weekday) -> &[TimeSlot] {
        &self.days[day.num_days_from_monday() as usize]
    }

    /// No slot on any day.
    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Vec::is_empty)
    }

    /// Parse a JSON schedule document.
    pub fn from_json(text: &str) -> Result<LoadedSchedule, ScheduleError> {
        let document: ScheduleDocument = serde_json::from_str(text)?;
        Ok(Self::from_document(&document))
    }

    /// Build a schedule from its document form, skipping anything malformed.
    ///
    /// Elements with neither `on` nor `off` are ignored silently. A slot with
    /// a time that does not parse is dropped whole and reported.
    pub fn from_document(document: &ScheduleDocument) -> LoadedSchedule {
        let mut loaded = LoadedSchedule::default();

        for (key, elements) in &document.0 {
            let Some(day) = parse_weekday(key) else {
                loaded.issues.push(ScheduleIssue {
                    day: key.clone(),
                    index: None,
                    reason: "unknown weekday".to_string(),
                });
                continue;
            };

            for (index, element) in elements.iter().enumerate() {
                let issue = |reason: String| ScheduleIssue {
                    day: key.clone(),
                    index: Some(index),
                    reason,
                };

                let slot: SlotDocument = match serde_json::from_value(element.clone()) {
                    Ok(slot) => slot,
                    Err(e) => {
                        loaded.issues.push(issue(e.to_string()));
                        continue;
                    }
                };

                match (parse_field(slot.on.as_deref()), parse_field(slot.off.as_deref())) {
                    (Ok(None), Ok(None)) => {}
                    (Ok(on), Ok(off)) => loaded.schedule.push(day, TimeSlot::new(on, off)),
                    (Err(e), _) | (_, Err(e)) => loaded.issues.push(issue(e.to_string())),
                }
            }
        }

        loaded
    }
}

fn parse_weekday(key: &str) -> Option<Weekday> {
    let key = key.trim().to_ascii_lowercase();
    WEEKDAYS
        .into_iter()
        .find(|day| weekday_name(*day) == key)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Empty strings count as absent.
fn parse_field(value: Option<&str>) -> Result<Option<NaiveTime>, ScheduleError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_slot_time(text).map(Some),
    }
}

/// Parse a 24-hour `HH:MM` time of day.
pub fn parse_slot_time(text: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTime(text.to_string()))
}

/// ON or OFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    On,
    Off,
}

impl TransitionKind {
    pub fn from_on(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "ON",
            Self::Off => "OFF",
        })
    }
}

/// A concrete instant at which the device flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub kind: TransitionKind,
}

impl Transition {
    pub fn epoch_millis(&self) -> i64 {
        self.at.timestamp_millis()
    }
}

/// The zone slot times are read in.
///
/// `UTC` and fixed offsets such as `+02:00` or `UTC-05:30` resolve directly,
/// IANA names such as `Europe/Berlin` through the bundled tz database. An
/// absent or unknown name falls back to the host zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScheduleZone {
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
    #[default]
    Local,
}

impl ScheduleZone {
    pub fn from_name(name: Option<&str>) -> Self {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Self::Local;
        };

        match name {
            "UTC" | "GMT" | "Z" | "Etc/UTC" | "Etc/GMT" | "Universal" => Self::Utc,
            _ if name.starts_with(['+', '-']) || name.starts_with("UTC") || name.starts_with("GMT") => {
                match parse_offset(name) {
                    Ok(offset) => Self::Fixed(offset),
                    Err(e) => {
                        warn!(error = %e, "falling back to the host time zone");
                        Self::Local
                    }
                }
            }
            _ => match name.parse::<Tz>() {
                Ok(tz) => Self::Named(tz),
                Err(e) => {
                    warn!(zone = name, error = %e, "unknown time zone, falling back to the host zone");
                    Self::Local
                }
            },
        }
    }

    /// Calendar date of `instant` in this zone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Utc => instant.date_naive(),
            Self::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            Self::Named(tz) => instant.with_timezone(tz).date_naive(),
            Self::Local => instant.with_timezone(&Local).date_naive(),
        }
    }

    /// The instant `time` falls on `date` in this zone.
    ///
    /// Ambiguous local times take the earlier instant; times inside a
    /// forward gap move past it.
    pub fn resolve(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(time);
        match self {
            Self::Utc => resolve_in(&Utc, naive),
            Self::Fixed(offset) => resolve_in(offset, naive),
            Self::Named(tz) => resolve_in(tz, naive),
            Self::Local => resolve_in(&Local, naive),
        }
    }

    /// Human form of `instant` in this zone, for log lines.
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        const FORMAT: &str = "%a %Y-%m-%d %H:%M %:z";
        match self {
            Self::Utc => instant.format(FORMAT).to_string(),
            Self::Fixed(offset) => instant.with_timezone(offset).format(FORMAT).to_string(),
            Self::Named(tz) => instant.with_timezone(tz).format(FORMAT).to_string(),
            Self::Local => instant.with_timezone(&Local).format(FORMAT).to_string(),
        }
    }
}

impl fmt::Display for ScheduleZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utc => f.write_str("UTC"),
            Self::Fixed(offset) => write!(f, "{offset}"),
            Self::Named(tz) => f.write_str(tz.name()),
            Self::Local => f.write_str("local"),
        }
    }
}

fn resolve_in<Z: TimeZone>(tz: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|instant| instant.with_timezone(&Utc))
}

fn parse_offset(name: &str) -> Result<FixedOffset, ScheduleError> {
    let invalid = || ScheduleError::InvalidOffset(name.to_string());
    let rest = name
        .strip_prefix("UTC")
        .or_else(|| name.strip_prefix("GMT"))
        .unwrap_or(name);

    let (sign, digits) = if let Some(digits) = rest.strip_prefix('+') {
        (1, digits)
    } else if let Some(digits) = rest.strip_prefix('-') {
        (-1, digits)
    } else {
        return Err(invalid());
    };

    let (hours, minutes) = match digits.split_once(':') {
        Some(parts) => parts,
        None if digits.len() > 2 => digits.split_at(digits.len() - 2),
        None => (digits, "0"),
    };
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }

    let seconds = (hours * 3600 + minutes * 60) as i32;
    FixedOffset::east_opt(sign * seconds).ok_or_else(invalid)
}

/// Bookkeeping kept in [`SCHEDULE_STATE_FILE`] as `key=value` lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Epoch milliseconds of the last armed alarm.
    pub next_scheduled_at: Option<i64>,
    /// State set by the last fired transition.
    pub currently_on: Option<bool>,
}

impl ScheduleState {
    /// Unknown keys and unreadable values are ignored.
    pub fn parse(text: &str) -> Self {
        let mut state = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "next_scheduled_at" => {
                    state.next_scheduled_at = value.trim().parse().ok();
                }
                "currently_on" => state.currently_on = value.trim().parse().ok(),
                _ => {}
            }
        }
        state
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(at) = self.next_scheduled_at {
            out.push_str(&format!("next_scheduled_at={at}\n"));
        }
        if let Some(on) = self.currently_on {
            out.push_str(&format!("currently_on={on}\n"));
        }
        out
    }
}
