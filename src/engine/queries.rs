use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Newest first. Ties on `created_at` fall back to the id, which for ULIDs
    /// generated in the same millisecond still reflects creation order.
    pub fn list_profiles(&self) -> Vec<Profile> {
        let mut profiles = self.store.all_profiles();
        profiles.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        profiles
    }

    pub fn get_profile(&self, id: &Ulid) -> Result<Profile, EngineError> {
        self.store.find_profile(id).ok_or(EngineError::NotFound(*id))
    }

    pub async fn get_event(&self, id: &Ulid) -> Result<EventRecord, EngineError> {
        let handle = self.store.find_event(id).ok_or(EngineError::NotFound(*id))?;
        let guard = handle.read().await;
        Ok(guard.clone())
    }

    /// Events ordered by start ascending, optionally only those a profile takes part in.
    pub async fn list_events(&self, filter: &EventFilter) -> Vec<EventRecord> {
        let mut events = Vec::new();
        for handle in self.store.event_handles() {
            let guard = handle.read().await;
            if filter.profile_id.is_none_or(|p| guard.has_profile(&p)) {
                events.push(guard.clone());
            }
        }
        events.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        events
    }

    /// The full change log of one event, oldest entry first.
    pub async fn event_logs(&self, id: &Ulid) -> Result<Vec<ChangeLogEntry>, EngineError> {
        let handle = self.store.find_event(id).ok_or(EngineError::NotFound(*id))?;
        let guard = handle.read().await;
        Ok(guard.logs.clone())
    }
}
