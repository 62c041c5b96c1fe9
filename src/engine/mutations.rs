use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::tz;

use super::diff::{apply_update, UpdateOutcome};
use super::guard::{ensure_profiles_exist, ensure_unique_name};
use super::store::apply_event_update;
use super::{Engine, EngineError};

/// Trimmed, non-empty, bounded.
fn validate_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("profile name too long"));
    }
    Ok(name.to_string())
}

/// Returns the trimmed zone name once it resolves to an IANA zone.
fn validate_zone(zone: &str) -> Result<String, EngineError> {
    if zone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    tz::parse_zone(zone)?;
    Ok(zone.trim().to_string())
}

fn validate_instant(at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn validate_profile_set(ids: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
    let ids = dedup_profiles(ids);
    if ids.is_empty() {
        return Err(EngineError::Validation("an event needs at least one profile".into()));
    }
    if ids.len() > MAX_PROFILES_PER_EVENT {
        return Err(EngineError::LimitExceeded("too many profiles on event"));
    }
    Ok(ids)
}

impl Engine {
    pub async fn create_profile(&self, id: Ulid, name: &str, timezone: Option<&str>) -> Result<Profile, EngineError> {
        let name = validate_name(name)?;
        let timezone = validate_zone(timezone.unwrap_or("UTC"))?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.profile_count() >= MAX_PROFILES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }
        if self.store.find_profile(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        ensure_unique_name(&self.store, &name, None)?;

        let now = now_ms();
        let profile = Profile {
            id,
            name,
            timezone,
            created_at: now,
            updated_at: now,
        };
        let record = Record::ProfileCreated(profile.clone());
        self.wal_append(&record).await?;
        self.store.apply_record(&record);
        tracing::debug!("profile {id} created as {:?}", profile.name);
        Ok(profile)
    }

    pub async fn update_profile(&self, id: Ulid, patch: ProfilePatch) -> Result<Profile, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("at least one of name or timezone is required".into()));
        }
        let name = patch.name.as_deref().map(validate_name).transpose()?;
        let timezone = patch.timezone.as_deref().map(validate_zone).transpose()?;

        let _catalog = self.catalog_lock.lock().await;
        let current = self.store.find_profile(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(name) = &name {
            ensure_unique_name(&self.store, name, Some(id))?;
        }

        let name = name.unwrap_or(current.name.clone());
        let timezone = timezone.unwrap_or(current.timezone.clone());
        if name == current.name && timezone == current.timezone {
            return Ok(current);
        }

        let record = Record::ProfileUpdated {
            id,
            name,
            timezone,
            updated_at: now_ms(),
        };
        self.wal_append(&record).await?;
        self.store.apply_record(&record);
        tracing::debug!("profile {id} updated");
        self.store.find_profile(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn create_event(&self, id: Ulid, draft: EventDraft) -> Result<EventRecord, EngineError> {
        let timezone = validate_zone(&draft.timezone)?;
        validate_instant(draft.start)?;
        validate_instant(draft.end)?;
        if draft.end < draft.start {
            return Err(EngineError::InvalidRange {
                start: draft.start,
                end: draft.end,
            });
        }
        let profiles = validate_profile_set(&draft.profiles)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.event_count() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if self.store.contains_event(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        ensure_profiles_exist(&self.store, &profiles)?;

        let now = now_ms();
        let event = EventRecord {
            id,
            timezone,
            start: draft.start,
            end: draft.end,
            profiles,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let record = Record::EventCreated(event.clone());
        self.wal_append(&record).await?;
        self.store.apply_record(&record);
        tracing::debug!("event {id} created with {} profiles", event.profiles.len());
        Ok(event)
    }

    /// Diff `patch` against the stored event and persist the result.
    ///
    /// The new field values and their change-log entry go to the WAL as one
    /// record and are applied under the event's write lock, so readers never
    /// see one without the other. A patch that changes nothing writes nothing.
    pub async fn update_event(&self, id: Ulid, patch: EventPatch) -> Result<UpdateOutcome, EngineError> {
        let mut patch = patch;
        if let Some(zone) = &patch.timezone {
            patch.timezone = Some(validate_zone(zone)?);
        }
        if let Some(start) = patch.start {
            validate_instant(start)?;
        }
        if let Some(end) = patch.end {
            validate_instant(end)?;
        }
        if let Some(profiles) = &patch.profiles {
            validate_profile_set(profiles)?;
        }

        let handle = self.store.find_event(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = handle.write().await;

        let outcome = apply_update(&guard, &patch, now_ms())?;
        let Some(entry) = outcome.entry().cloned() else {
            metrics::counter!(crate::observability::NOOP_UPDATES_TOTAL).increment(1);
            tracing::debug!("event {id}: no tracked field changed");
            return Ok(outcome);
        };
        if entry.touches(Field::Profiles) {
            ensure_profiles_exist(&self.store, &outcome.event.profiles)?;
        }

        let record = Record::EventUpdated {
            id,
            timezone: outcome.event.timezone.clone(),
            start: outcome.event.start,
            end: outcome.event.end,
            profiles: outcome.event.profiles.clone(),
            entry,
        };
        self.wal_append(&record).await?;
        apply_event_update(&mut guard, &record);
        metrics::counter!(crate::observability::CHANGELOG_ENTRIES_TOTAL).increment(1);
        tracing::debug!(
            "event {id} updated: {}",
            outcome
                .entry()
                .map(|e| e.changes.iter().map(|c| c.field().as_str()).collect::<Vec<_>>().join(", "))
                .unwrap_or_default()
        );
        Ok(outcome)
    }
}
