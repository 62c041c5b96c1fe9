//! Field-by-field comparison of a stored event against a patch.
//!
//! Each field type has its own comparison; nothing falls back to a generic
//! equality. The whole module is pure: profile existence is checked by the
//! engine, which owns the store.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Instants closer than this are the same instant. This absorbs serialization
/// rounding on round trips through clients; it applies to `start`/`end` only.
pub const INSTANT_TOLERANCE_MS: u64 = 1000;

pub fn instant_changed(old: Ms, new: Ms) -> bool {
    old.abs_diff(new) > INSTANT_TOLERANCE_MS
}

/// Set comparison; order and duplicates are ignored.
pub fn profiles_changed(old: &[Ulid], new: &[Ulid]) -> bool {
    let mut old = old.to_vec();
    let mut new = new.to_vec();
    old.sort();
    old.dedup();
    new.sort();
    new.dedup();
    old != new
}

pub fn text_changed(old: &str, new: &str) -> bool {
    old != new
}

/// Result of [`apply_update`]: the entity as it would be stored, and whether
/// anything changed. When `changed` is true the last log entry is the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub event: EventRecord,
    pub changed: bool,
}

impl UpdateOutcome {
    pub fn entry(&self) -> Option<&ChangeLogEntry> {
        if self.changed {
            self.event.logs.last()
        } else {
            None
        }
    }
}

/// Compute the changes `patch` makes to `existing` and produce the updated
/// entity. Fields that did not change under their policy keep the stored value.
///
/// Fails with `InvalidRange` if the result would end before it starts; the
/// range check is exact, not tolerant.
pub fn apply_update(existing: &EventRecord, patch: &EventPatch, now: Ms) -> Result<UpdateOutcome, EngineError> {
    let mut next = existing.clone();
    let mut changes = Vec::new();

    if let Some(timezone) = &patch.timezone
        && text_changed(&existing.timezone, timezone)
    {
        changes.push(FieldChange::Timezone {
            from: existing.timezone.clone(),
            to: timezone.clone(),
        });
        next.timezone = timezone.clone();
    }

    if let Some(start) = patch.start
        && instant_changed(existing.start, start)
    {
        changes.push(FieldChange::Start {
            from: existing.start,
            to: start,
        });
        next.start = start;
    }

    if let Some(end) = patch.end
        && instant_changed(existing.end, end)
    {
        changes.push(FieldChange::End {
            from: existing.end,
            to: end,
        });
        next.end = end;
    }

    if let Some(profiles) = &patch.profiles {
        let profiles = dedup_profiles(profiles);
        if profiles_changed(&existing.profiles, &profiles) {
            changes.push(FieldChange::Profiles {
                from: existing.profiles.clone(),
                to: profiles.clone(),
            });
            next.profiles = profiles;
        }
    }

    if next.end < next.start {
        return Err(EngineError::InvalidRange {
            start: next.start,
            end: next.end,
        });
    }

    let changed = !changes.is_empty();
    if changed {
        next.updated_at = now;
        next.logs.push(ChangeLogEntry {
            timestamp: now,
            changes,
        });
    }

    Ok(UpdateOutcome { event: next, changed })
}
