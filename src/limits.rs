use crate::model::Minutes;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 200;

/// Upper bound on the rolling window a snapshot may cover.
pub const MAX_WINDOW_DAYS: u32 = 31;

/// How far past a requested date the alternative finder looks for a working day.
pub const MAX_LOOKAHEAD_DAYS: i64 = 7;

pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_COMMITMENTS_PER_TENANT: usize = 100_000;

/// Longest bookable service: one whole day.
pub const MAX_DURATION_MINUTES: Minutes = 24 * 60;
