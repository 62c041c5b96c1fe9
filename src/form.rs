//! Client-side event form: wall-clock fields for both endpoints plus one zone.
//!
//! All cascading resets and clamps live in [`EventForm::apply`], a pure reducer,
//! so the form can be driven and tested without any UI.

use std::cmp::Ordering;

use crate::model::{EventPatch, EventRecord, Ms};
use crate::tz::{self, TzError};

pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const DEFAULT_TIME: &str = "09:00";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub date: String,
    pub time: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            date: String::new(),
            time: DEFAULT_TIME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormChange {
    Timezone(String),
    StartDate(String),
    StartTime(String),
    EndDate(String),
    EndTime(String),
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventForm {
    pub timezone: String,
    pub start: Endpoint,
    pub end: Endpoint,
}

impl Default for EventForm {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            start: Endpoint::default(),
            end: Endpoint::default(),
        }
    }
}

/// Orders two `HH:MM` strings. `None` if either does not parse.
fn cmp_times(a: &str, b: &str) -> Option<Ordering> {
    Some(tz::parse_time(a).ok()?.cmp(&tz::parse_time(b).ok()?))
}

fn cmp_dates(a: &str, b: &str) -> Option<Ordering> {
    Some(tz::parse_date(a).ok()?.cmp(&tz::parse_date(b).ok()?))
}

impl EventForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompose a stored event in its own authoring zone, so editing starts from
    /// what the author typed rather than what a viewer sees.
    pub fn from_event(event: &EventRecord) -> Result<Self, TzError> {
        let start = tz::to_display(event.start, &event.timezone)?;
        let end = tz::to_display(event.end, &event.timezone)?;
        Ok(Self {
            timezone: event.timezone.clone(),
            start: Endpoint {
                date: start.date,
                time: start.time,
            },
            end: Endpoint {
                date: end.date,
                time: end.time,
            },
        })
    }

    fn same_day(&self) -> bool {
        !self.start.date.is_empty() && self.start.date == self.end.date
    }

    pub fn apply(mut self, change: FormChange) -> Self {
        match change {
            FormChange::Timezone(zone) => self.timezone = zone,
            FormChange::StartDate(date) => {
                // A start past the chosen end forces the end date to be picked again.
                if !self.end.date.is_empty()
                    && cmp_dates(&date, &self.end.date) == Some(Ordering::Greater)
                {
                    self.end.date.clear();
                }
                self.start.date = date;
            }
            FormChange::StartTime(time) => {
                if self.same_day() && cmp_times(&self.end.time, &time) == Some(Ordering::Less) {
                    self.end.time = time.clone();
                }
                self.start.time = time;
            }
            FormChange::EndDate(date) => self.end.date = date,
            FormChange::EndTime(time) => {
                if self.same_day() && cmp_times(&time, &self.start.time) == Some(Ordering::Less) {
                    self.end.time = self.start.time.clone();
                } else {
                    self.end.time = time;
                }
            }
            FormChange::Reset => {
                self.start = Endpoint::default();
                self.end = Endpoint::default();
            }
        }
        self
    }

    pub fn compose_to_absolute(&self) -> Result<(Ms, Ms), TzError> {
        let start = tz::to_absolute(&self.start.date, &self.start.time, &self.timezone)?;
        let end = tz::to_absolute(&self.end.date, &self.end.time, &self.timezone)?;
        Ok((start, end))
    }

    pub fn is_valid(&self) -> bool {
        if self.start.date.is_empty() || self.end.date.is_empty() {
            return false;
        }
        matches!(self.compose_to_absolute(), Ok((start, end)) if end >= start)
    }

    /// The instant payload a client submits for this form.
    pub fn to_patch(&self) -> Result<EventPatch, TzError> {
        let (start, end) = self.compose_to_absolute()?;
        Ok(EventPatch {
            timezone: Some(self.timezone.clone()),
            start: Some(start),
            end: Some(end),
            profiles: None,
        })
    }
}
