use ulid::Ulid;

use super::store::InMemoryStore;
use super::EngineError;

/// Fails if another profile already uses `name`. `exclude_id` lets a profile
/// keep its own name during an update.
pub fn ensure_unique_name(store: &InMemoryStore, name: &str, exclude_id: Option<Ulid>) -> Result<(), EngineError> {
    match store.find_profile_by_name(name) {
        Some(existing) if Some(existing.id) != exclude_id => Err(EngineError::Conflict(name.to_string())),
        _ => Ok(()),
    }
}

/// Every id in the (already deduplicated) set must resolve to a profile.
pub fn ensure_profiles_exist(store: &InMemoryStore, ids: &[Ulid]) -> Result<(), EngineError> {
    let found = store.find_profiles(ids);
    if found.len() == ids.len() {
        return Ok(());
    }
    let missing = ids
        .iter()
        .filter(|id| !found.iter().any(|p| p.id == **id))
        .copied()
        .collect();
    Err(EngineError::ProfileNotFound(missing))
}
