//! Entity/table engine for a network policy runtime.
//!
//! Actions, events and routes live as reference-counted entries in keyed
//! tables owned by a [`Context`]. Events carry ordered action lists that
//! [`dispatch`] walks whenever a route matches.

pub mod action;
pub mod capabilities;
pub mod config;
pub mod constants;
pub mod context;
pub mod dispatch;
pub mod entity;
pub mod errors;
pub mod event;
pub mod handle_registry;
pub mod helpers;
pub mod list;
pub mod route;
pub mod rwlock;
pub mod table;
pub mod telemetry;
pub mod types;

pub use action::{handler, Action, ActionCall, ActionHandler, ActionList, CallerArg, HandlerArg};
pub use capabilities::{Clock, IdGenerator, MonotonicClock, SequentialIds};
pub use config::{EventConfig, EventConfigInternal};
pub use context::{Context, ContextBuilder, Tables};
pub use dispatch::dispatch;
pub use entity::{EntHeader, EntRef, Entity, RefDrop, TableEnt};
pub use errors::{Error, ErrorCode, HandlerError, Result};
pub use event::{Event, SubEvent};
pub use route::{EndpointSpec, Route, RouteKey, RouteSpec, RouteTable, RouteTableKind};
pub use table::{ByIdIndex, Cursor, SeekPosition, Table};
pub use types::{ActionRes, EntId, HitCount, Label, ObjectType, Priority, RouteFlags, Time};

use once_cell::sync::OnceCell;

/// Installs `env_logger` once per process unless the host already set a
/// logger.
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

pub mod public_api;

pub use public_api::*;
