//! Hard caps applied before anything is written.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Largest WAL payload written or accepted on replay.
pub const MAX_RECORD_LEN: usize = 1 << 20;

pub const MAX_PROFILES_PER_TENANT: usize = 100_000;
pub const MAX_EVENTS_PER_TENANT: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TIMEZONE_LEN: usize = 64;
pub const MAX_PROFILES_PER_EVENT: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
