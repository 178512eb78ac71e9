//! Weekly program schedule: wire format and the normalised view.

use chrono::{Datelike, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];
const SHORT_DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

// ── wire format ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScheduleResponse {
    #[serde(default)]
    pub schedule: Vec<ScheduleDayResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDayResponse {
    pub day: String,
    #[serde(default)]
    pub programs: Vec<ScheduleProgramResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleProgramResponse {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_time: String,
    pub end_time: String,
}

// ── normalised view ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleDay {
    /// 0 = Sunday .. 6 = Saturday; list position for unrecognised names.
    pub id: usize,
    pub name: String,
    pub short_name: String,
    pub programs: Vec<ScheduleProgram>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleProgram {
    pub id: String,
    pub name: String,
    pub description: String,
    pub start_time: String,
    pub end_time: String,
}

impl ScheduleProgram {
    pub fn time_range(&self) -> String {
        format!("{} - {}", self.start_time, self.end_time)
    }

    /// Whether `now` falls inside this program.  Programs whose end is not
    /// after their start run overnight.
    pub fn is_on_air(&self, now: NaiveTime) -> bool {
        let current = now.hour() * 60 + now.minute();
        let start = parse_minutes(&self.start_time);
        let end = parse_minutes(&self.end_time);
        if end > start {
            (start..end).contains(&current)
        } else {
            current >= start || current < end
        }
    }
}

pub fn parse_schedule(body: &str) -> anyhow::Result<Vec<ScheduleDay>> {
    let response: ScheduleResponse = serde_json::from_str(body)?;
    Ok(normalise(response))
}

pub fn normalise(response: ScheduleResponse) -> Vec<ScheduleDay> {
    let mut days: Vec<ScheduleDay> = response
        .schedule
        .into_iter()
        .enumerate()
        .map(|(index, day)| {
            let known = DAY_NAMES
                .iter()
                .position(|d| d.eq_ignore_ascii_case(day.day.trim()));
            let id = known.unwrap_or(index);
            let (name, short_name) = match known {
                Some(i) => (DAY_NAMES[i].to_string(), SHORT_DAY_NAMES[i].to_string()),
                None => (day.day.clone(), day.day.chars().take(3).collect()),
            };
            let programs = day
                .programs
                .into_iter()
                .enumerate()
                .map(|(program_index, p)| ScheduleProgram {
                    id: format!("{}_{}", id, program_index),
                    name: p.name,
                    description: p.description,
                    start_time: p.start_time,
                    end_time: p.end_time,
                })
                .collect();
            ScheduleDay {
                id,
                name,
                short_name,
                programs,
            }
        })
        .collect();
    days.sort_by_key(|d| d.id);
    days
}

/// Index into the schedule for `date`, Sunday = 0.
pub fn current_day_index(date: impl Datelike) -> usize {
    date.weekday().num_days_from_sunday() as usize
}

/// Minutes after midnight for "7:30 PM", "12:00 AM" or "19:30".
/// Unparseable parts count as 0.
fn parse_minutes(time: &str) -> u32 {
    let upper = time.trim().to_ascii_uppercase();
    let pm = upper.contains("PM");
    let am = upper.contains("AM");
    let clock = upper.replace("AM", "").replace("PM", "");
    let mut parts = clock.trim().split(':');
    let mut hour: u32 = parts
        .next()
        .and_then(|h| h.trim().parse().ok())
        .unwrap_or(0);
    let minute: u32 = parts
        .next()
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(0);

    if pm && hour != 12 {
        hour += 12;
    }
    if am && hour == 12 {
        hour = 0;
    }
    hour * 60 + minute
}
