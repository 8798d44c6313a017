//! Constants and default configuration for the entity tables

/// Longest label accepted for actions and events.
pub const MAX_LABEL_BYTES: usize = 32;

/// Id value that is never handed out by an id generator.
pub const ENT_ID_NONE: u64 = 0;

/// First id produced by the default sequential generator.
pub const FIRST_ENT_ID: u64 = 1;

pub const DEFAULT_ROUTE_PRIVATE_DATA_SIZE: usize = 0;
pub const DEFAULT_ROUTE_PRIVATE_DATA_ALIGNMENT: usize = 0;
pub const DEFAULT_MAX_CONNECTION_COUNT: u32 = 10;
pub const DEFAULT_PENALTYBOX_DURATION_SECS: i64 = 0;

/// Routes idle longer than this (µs) are purgeable; 0 disables purging.
pub const DEFAULT_PURGE_AGE: i64 = 0;

/// Upper bound on extra (non-primary) ports per endpoint.
pub const MAX_EXTRA_PORTS: usize = 255;

/// Longest endpoint address, in bits.
pub const MAX_ADDR_BITS: u16 = 2048;

pub const USEC_PER_SEC: i64 = 1_000_000;

/// Address family tags carried in route keys.
pub const FAMILY_INET: u16 = 2;
pub const FAMILY_INET6: u16 = 10;
