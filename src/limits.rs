/// Largest undo batch a configuration may allow.
pub const MAX_UNDO_CEILING: usize = 100;
/// Default upper bound of `undo_last(k)`.
pub const DEFAULT_MAX_UNDO: usize = 10;

pub const MAX_VEHICLE_ID_LEN: usize = 32;
pub const MAX_VEHICLES: usize = 1_000_000;
pub const MAX_REQUESTS: usize = 10_000_000;

pub const MAX_ZONES: usize = 64;
pub const MAX_ZONE_NAME_LEN: usize = 32;
pub const MAX_SLOTS_PER_FACILITY: usize = 100_000;

pub const MAX_REQUEST_PAGE: usize = 50;
pub const DEFAULT_LEDGER_PAGE: usize = 10;
pub const MAX_LEDGER_PAGE: usize = 1_000;

pub const MAX_FACILITIES: usize = 256;
pub const MAX_FACILITY_NAME_LEN: usize = 128;
