//! Read-side projection of stored records into text rows.
//!
//! Instants are stored in UTC. A caller may ask for a display zone, in which
//! case instants are rendered offset-qualified in that zone and events gain
//! wall-clock date/time columns. Nothing here touches stored data.

use ulid::Ulid;

use crate::model::*;
use crate::tz::{self, TzError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileView {
    pub id: String,
    pub name: String,
    pub timezone: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventView {
    pub id: String,
    pub timezone: String,
    pub start: String,
    pub end: String,
    pub profiles: String,
    /// Wall-clock columns, present only when a display zone was requested.
    pub local: Option<LocalSpan>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSpan {
    pub start_date: String,
    pub start_time: String,
    pub end_date: String,
    pub end_time: String,
}

/// One changed field of one change-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub event_id: String,
    /// Position of the entry in the event's log, from 0.
    pub seq: i64,
    pub changed_at: String,
    pub field: &'static str,
    pub from: String,
    pub to: String,
}

pub fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(",")
}

pub fn profile_view(profile: &Profile) -> Result<ProfileView, TzError> {
    Ok(ProfileView {
        id: profile.id.to_string(),
        name: profile.name.clone(),
        timezone: profile.timezone.clone(),
        created_at: tz::to_rfc3339(profile.created_at, None)?,
        updated_at: tz::to_rfc3339(profile.updated_at, None)?,
    })
}

pub fn event_view(event: &EventRecord, zone: Option<&str>) -> Result<EventView, TzError> {
    let local = match zone {
        Some(zone) => {
            let start = tz::to_display(event.start, zone)?;
            let end = tz::to_display(event.end, zone)?;
            Some(LocalSpan {
                start_date: start.date,
                start_time: start.time,
                end_date: end.date,
                end_time: end.time,
            })
        }
        None => None,
    };
    Ok(EventView {
        id: event.id.to_string(),
        timezone: event.timezone.clone(),
        start: tz::to_rfc3339(event.start, zone)?,
        end: tz::to_rfc3339(event.end, zone)?,
        profiles: join_ids(&event.profiles),
        local,
        created_at: tz::to_rfc3339(event.created_at, zone)?,
        updated_at: tz::to_rfc3339(event.updated_at, zone)?,
    })
}

/// Flatten a change log into rows, oldest entry first, fields in log order.
pub fn log_rows(event_id: &Ulid, logs: &[ChangeLogEntry], zone: Option<&str>) -> Result<Vec<LogRow>, TzError> {
    let event_id = event_id.to_string();
    let mut rows = Vec::new();
    for (seq, entry) in logs.iter().enumerate() {
        let changed_at = tz::to_rfc3339(entry.timestamp, zone)?;
        for change in &entry.changes {
            let (from, to) = match change {
                FieldChange::Timezone { from, to } => (from.clone(), to.clone()),
                FieldChange::Start { from, to } | FieldChange::End { from, to } => {
                    (tz::to_rfc3339(*from, zone)?, tz::to_rfc3339(*to, zone)?)
                }
                FieldChange::Profiles { from, to } => (join_ids(from), join_ids(to)),
            };
            rows.push(LogRow {
                event_id: event_id.clone(),
                seq: seq as i64,
                changed_at: changed_at.clone(),
                field: change.field().as_str(),
                from,
                to,
            });
        }
    }
    Ok(rows)
}
