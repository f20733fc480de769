use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KIND_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 32;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// One booking may not exceed a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Concurrent arbitration attempts admitted past the gate.
pub const DEFAULT_ADMISSION_PERMITS: usize = 5;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
pub const COMPACT_CHECK_INTERVAL_SECS: u64 = 30;

/// Bound on the group-commit channel.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
