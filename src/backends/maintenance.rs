//! Weekly maintenance windows

use std::fmt;

use chrono::{NaiveTime, Timelike, Weekday};

use crate::crd::MaintenanceSpec;

/// One-hour weekly maintenance window (UTC)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaintenanceWindow {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
}

impl MaintenanceWindow {
    /// Parse a weekday (`mon`..`sun`, full names, or `0`..`6` with Monday
    /// as 0) and a start time `HH:MM`
    pub fn parse(weekday: &str, starttime: &str) -> Result<Self, String> {
        let weekday = parse_weekday(weekday.trim())
            .ok_or_else(|| format!("Could not parse maintenance.window.weekday '{}'", weekday))?;
        let start = NaiveTime::parse_from_str(starttime.trim(), "%H:%M")
            .map_err(|_| format!("Could not parse maintenance.window.starttime '{}'", starttime))?;
        Ok(Self {
            weekday,
            hour: start.hour(),
            minute: start.minute(),
        })
    }

    /// Window from an optional spec section
    pub fn from_spec(spec: Option<&MaintenanceSpec>) -> Result<Option<Self>, String> {
        spec.map(|m| Self::parse(&m.window.weekday, &m.window.starttime))
            .transpose()
    }

    /// End of the window; the day advances when the hour wraps past midnight
    pub fn end(&self) -> (Weekday, u32, u32) {
        let hour = (self.hour + 1) % 24;
        let weekday = if hour < self.hour {
            self.weekday.succ()
        } else {
            self.weekday
        };
        (weekday, hour, self.minute)
    }
}

impl fmt::Display for MaintenanceWindow {
    /// `ddd:HH:MM-ddd:HH:MM`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (end_day, end_hour, end_minute) = self.end();
        write!(
            f,
            "{}:{:02}:{:02}-{}:{:02}:{:02}",
            day(self.weekday),
            self.hour,
            self.minute,
            day(end_day),
            end_hour,
            end_minute
        )
    }
}

fn day(weekday: Weekday) -> String {
    weekday.to_string().to_lowercase()
}

fn parse_weekday(raw: &str) -> Option<Weekday> {
    if let Ok(index) = raw.parse::<u8>() {
        return Weekday::try_from(index).ok();
    }
    raw.parse::<Weekday>().ok()
}
