//! Event configuration: defaults, validation, derived route layout

use crate::constants::*;
use crate::errors::{Error, Result};
use crate::helpers::align_up;
use crate::types::Time;

/// Caller-facing event configuration.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventConfig {
    /// Bytes of caller-private data reserved in every route using this config.
    pub route_private_data_size: usize,
    /// Alignment of the private data area; 0 means no requirement.
    pub route_private_data_alignment: usize,
    pub max_connection_count: u32,
    /// Seconds a penalty-boxed route stays boxed.
    pub penaltybox_duration: i64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            route_private_data_size: DEFAULT_ROUTE_PRIVATE_DATA_SIZE,
            route_private_data_alignment: DEFAULT_ROUTE_PRIVATE_DATA_ALIGNMENT,
            max_connection_count: DEFAULT_MAX_CONNECTION_COUNT,
            penaltybox_duration: DEFAULT_PENALTYBOX_DURATION_SECS,
        }
    }
}

/// Validated config with the route private-data size padded to its alignment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventConfigInternal {
    pub config: EventConfig,
    pub penaltybox_duration_usecs: Time,
}

impl EventConfig {
    pub fn load(self) -> Result<EventConfigInternal> {
        let align = self.route_private_data_alignment;
        if align != 0 && !align.is_power_of_two() {
            return Err(Error::InvalidArg("route private data alignment must be a power of two"));
        }
        if self.penaltybox_duration < 0 {
            return Err(Error::InvalidArg("negative penalty-box duration"));
        }
        let mut config = self;
        if align > 1 {
            config.route_private_data_size = align_up(config.route_private_data_size, align);
        }
        Ok(EventConfigInternal {
            config,
            penaltybox_duration_usecs: self.penaltybox_duration.saturating_mul(USEC_PER_SEC),
        })
    }
}

impl Default for EventConfigInternal {
    fn default() -> Self {
        let config = EventConfig::default();
        Self {
            config,
            penaltybox_duration_usecs: config.penaltybox_duration.saturating_mul(USEC_PER_SEC),
        }
    }
}
