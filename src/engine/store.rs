use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedEvent = Arc<RwLock<EventRecord>>;

/// Keyed storage for profiles and events. Knows nothing about validation;
/// callers hold whatever locks the operation needs.
pub struct InMemoryStore {
    profiles: DashMap<Ulid, Profile>,
    /// Exact (case-sensitive) name → profile id.
    names: DashMap<String, Ulid>,
    events: DashMap<Ulid, SharedEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            names: DashMap::new(),
            events: DashMap::new(),
        }
    }

    // ── Profiles ─────────────────────────────────────────────

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub fn find_profile(&self, id: &Ulid) -> Option<Profile> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    pub fn find_profile_by_name(&self, name: &str) -> Option<Profile> {
        let id = *self.names.get(name)?.value();
        self.find_profile(&id)
    }

    /// Ids from `ids` that resolve to a profile.
    pub fn find_profiles(&self, ids: &[Ulid]) -> Vec<Profile> {
        ids.iter().filter_map(|id| self.find_profile(id)).collect()
    }

    pub fn all_profiles(&self) -> Vec<Profile> {
        self.profiles.iter().map(|e| e.value().clone()).collect()
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.names.insert(profile.name.clone(), profile.id);
        self.profiles.insert(profile.id, profile);
    }

    pub fn save_profile(&self, id: Ulid, name: String, timezone: String, updated_at: Ms) {
        if let Some(mut entry) = self.profiles.get_mut(&id) {
            if entry.name != name {
                self.names.remove(&entry.name);
                self.names.insert(name.clone(), id);
            }
            entry.name = name;
            entry.timezone = timezone;
            entry.updated_at = updated_at;
        }
    }

    // ── Events ───────────────────────────────────────────────

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn contains_event(&self, id: &Ulid) -> bool {
        self.events.contains_key(id)
    }

    pub fn find_event(&self, id: &Ulid) -> Option<SharedEvent> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn event_handles(&self) -> Vec<SharedEvent> {
        self.events.iter().map(|e| e.value().clone()).collect()
    }

    pub fn insert_event(&self, event: EventRecord) {
        self.events.insert(event.id, Arc::new(RwLock::new(event)));
    }

    // ── Record application ───────────────────────────────────

    /// Apply a record that does not touch an existing event's state.
    pub fn apply_record(&self, record: &Record) {
        match record {
            Record::ProfileCreated(profile) => self.insert_profile(profile.clone()),
            Record::ProfileUpdated {
                id,
                name,
                timezone,
                updated_at,
            } => self.save_profile(*id, name.clone(), timezone.clone(), *updated_at),
            Record::EventCreated(event) => self.insert_event(event.clone()),
            // Handled under the event's own lock, see `apply_event_update`.
            Record::EventUpdated { .. } => {}
        }
    }
}

/// Write the new field values and append the log entry in one step.
pub fn apply_event_update(event: &mut EventRecord, record: &Record) {
    if let Record::EventUpdated {
        timezone,
        start,
        end,
        profiles,
        entry,
        ..
    } = record
    {
        event.timezone = timezone.clone();
        event.start = *start;
        event.end = *end;
        event.profiles = profiles.clone();
        event.updated_at = entry.timestamp;
        event.logs.push(entry.clone());
    }
}
