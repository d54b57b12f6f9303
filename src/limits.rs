//! Hard limits. Everything user-supplied is bounded so a single tenant can't
//! exhaust memory or blow up the WAL.

pub const MAX_APARTMENTS_PER_TENANT: usize = 100_000;
pub const MAX_BEDROOMS_PER_APARTMENT: usize = 64;
pub const MAX_BEDS_PER_BEDROOM: usize = 32;
/// Active + cancelled reservations kept per apartment.
pub const MAX_RESERVATIONS_PER_APARTMENT: usize = 10_000;
pub const MAX_CAPACITY: u32 = 1_000;
pub const MAX_ENABLED_CAPACITIES: usize = 64;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_HOLDER_ID_LEN: usize = 256;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Transaction attempts for a single reservation before surfacing a transient error.
pub const MAX_COMMIT_ATTEMPTS: usize = 2;
