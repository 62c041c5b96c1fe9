use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, always UTC.
pub type Ms = i64;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// A participant. `name` is unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Ulid,
    pub name: String,
    pub timezone: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A scheduled event. `start`/`end` are absolute instants regardless of the
/// zone it was authored in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Ulid,
    pub timezone: String,
    pub start: Ms,
    pub end: Ms,
    /// Deduplicated; order carries no meaning.
    pub profiles: Vec<Ulid>,
    pub logs: Vec<ChangeLogEntry>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl EventRecord {
    pub fn has_profile(&self, profile_id: &Ulid) -> bool {
        self.profiles.contains(profile_id)
    }
}

/// Fields tracked by the change log, in the order they are diffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Timezone,
    Start,
    End,
    Profiles,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Timezone => "timezone",
            Field::Start => "start",
            Field::End => "end",
            Field::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field's `{from, to}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldChange {
    Timezone { from: String, to: String },
    Start { from: Ms, to: Ms },
    End { from: Ms, to: Ms },
    Profiles { from: Vec<Ulid>, to: Vec<Ulid> },
}

impl FieldChange {
    pub fn field(&self) -> Field {
        match self {
            FieldChange::Timezone { .. } => Field::Timezone,
            FieldChange::Start { .. } => Field::Start,
            FieldChange::End { .. } => Field::End,
            FieldChange::Profiles { .. } => Field::Profiles,
        }
    }
}

/// Immutable audit record of one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub timestamp: Ms,
    pub changes: Vec<FieldChange>,
}

impl ChangeLogEntry {
    pub fn touches(&self, field: Field) -> bool {
        self.changes.iter().any(|c| c.field() == field)
    }

    pub fn change(&self, field: Field) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field() == field)
    }
}

/// Everything needed to create an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub timezone: String,
    pub start: Ms,
    pub end: Ms,
    pub profiles: Vec<Ulid>,
}

/// Partial update; `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub timezone: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub profiles: Option<Vec<Ulid>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.timezone.is_none() && self.start.is_none() && self.end.is_none() && self.profiles.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub timezone: Option<String>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.timezone.is_none()
    }
}

/// Event list filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub profile_id: Option<Ulid>,
}

/// Drop repeated ids, keeping the first occurrence.
pub fn dedup_profiles(ids: &[Ulid]) -> Vec<Ulid> {
    let mut out: Vec<Ulid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

/// The WAL record format. One successful mutation is exactly one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    ProfileCreated(Profile),
    ProfileUpdated {
        id: Ulid,
        name: String,
        timezone: String,
        updated_at: Ms,
    },
    EventCreated(EventRecord),
    EventUpdated {
        id: Ulid,
        timezone: String,
        start: Ms,
        end: Ms,
        profiles: Vec<Ulid>,
        entry: ChangeLogEntry,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = Ulid::new();
        let b = Ulid::new();
        assert_eq!(dedup_profiles(&[a, b, a, b, a]), vec![a, b]);
        assert!(dedup_profiles(&[]).is_empty());
    }

    #[test]
    fn entry_lookup_by_field() {
        let entry = ChangeLogEntry {
            timestamp: 1,
            changes: vec![FieldChange::End { from: 10, to: 20 }],
        };
        assert!(entry.touches(Field::End));
        assert!(!entry.touches(Field::Start));
        assert_eq!(entry.change(Field::End), Some(&FieldChange::End { from: 10, to: 20 }));
    }

    #[test]
    fn empty_patches() {
        assert!(EventPatch::default().is_empty());
        assert!(ProfilePatch::default().is_empty());
        let patch = EventPatch {
            end: Some(5),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let record = Record::EventUpdated {
            id: Ulid::new(),
            timezone: "Europe/Paris".into(),
            start: 1000,
            end: 2000,
            profiles: vec![Ulid::new()],
            entry: ChangeLogEntry {
                timestamp: 3000,
                changes: vec![FieldChange::Timezone {
                    from: "UTC".into(),
                    to: "Europe/Paris".into(),
                }],
            },
        };
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
