//! Hard caps on tenant-supplied input. Every check that uses one of these
//! fails with `EngineError::LimitExceeded`.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_SERVICE: usize = 100_000;
pub const MAX_PAYOUTS_PER_TENANT: usize = 100_000;

/// Titles, names, phone numbers, emails, provider identifiers.
pub const MAX_TEXT_LEN: usize = 255;
/// Bank and tax registration codes (BIK, INN, KPP).
pub const MAX_REGISTRATION_CODE_LEN: usize = 16;
pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MAX_META_BYTES: usize = 16 * 1024;
pub const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;

/// One appointment may not run longer than a leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
