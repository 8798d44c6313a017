//! The root context: tables, lock, capabilities and default config.

use crate::action::{new_action_table, ActionTable};
use crate::capabilities::{Clock, IdGenerator, MonotonicClock, SequentialIds};
use crate::config::{EventConfig, EventConfigInternal};
use crate::constants::DEFAULT_PURGE_AGE;
use crate::entity::{EntRef, Entity, IndexedEnt, RefDrop};
use crate::errors::{Error, Result};
use crate::event::{new_event_table, EventTable};
use crate::route::{RouteTable, RouteTableKind};
use crate::rwlock::{RwLock, RwLockReadGuard};
use crate::table::ByIdIndex;
use crate::types::{ActionRes, EntId, HitCount, Time};
use log::{info, warn};

/// Every table owned by a context, plus the by-id index spanning them.
/// Reached through the context lock.
pub struct Tables {
    pub(crate) actions: ActionTable,
    pub(crate) events: EventTable,
    pub(crate) static_routes: RouteTable,
    pub(crate) dynamic_routes: RouteTable,
    pub(crate) by_id: ByIdIndex,
}

impl Tables {
    fn new(purge_age: [Time; 2], default_policy: [ActionRes; 2]) -> Self {
        Self {
            actions: new_action_table(),
            events: new_event_table(),
            static_routes: RouteTable::new(RouteTableKind::Static, purge_age[0], default_policy[0]),
            dynamic_routes: RouteTable::new(RouteTableKind::Dynamic, purge_age[1], default_policy[1]),
            by_id: ByIdIndex::new(),
        }
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    pub fn events(&self) -> &EventTable {
        &self.events
    }

    pub fn by_id(&self) -> &ByIdIndex {
        &self.by_id
    }
}

pub struct ContextBuilder {
    config: EventConfig,
    clock: Option<Box<dyn Clock>>,
    ids: Option<Box<dyn IdGenerator>>,
    purge_age: [Time; 2],
    default_policy: [ActionRes; 2],
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            config: EventConfig::default(),
            clock: None,
            ids: None,
            purge_age: [DEFAULT_PURGE_AGE; 2],
            default_policy: [ActionRes::empty(); 2],
        }
    }
}

impl ContextBuilder {
    pub fn config(mut self, config: EventConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Box::new(ids));
        self
    }

    pub fn purge_age(mut self, kind: RouteTableKind, age: Time) -> Self {
        self.purge_age[kind as usize] = age;
        self
    }

    pub fn default_policy(mut self, kind: RouteTableKind, policy: ActionRes) -> Self {
        self.default_policy[kind as usize] = policy;
        self
    }

    pub fn build(self) -> Result<Context> {
        crate::ensure_logging();
        crate::telemetry::init();
        if self.purge_age.iter().any(|a| *a < 0) {
            return Err(Error::InvalidArg("negative purge age"));
        }
        let config = self.config.load()?;
        let ctx = Context {
            tables: RwLock::new(Tables::new(self.purge_age, self.default_policy)),
            config,
            clock: self.clock.unwrap_or_else(|| Box::new(MonotonicClock::new())),
            ids: self.ids.unwrap_or_else(|| Box::new(SequentialIds::new())),
        };
        info!(
            "[CONTEXT] created: private_data={} max_connections={}",
            config.config.route_private_data_size, config.config.max_connection_count
        );
        Ok(ctx)
    }
}

/// Root object owning every table.
///
/// Table and action-list mutation take the context lock exclusively;
/// lookups and dispatch take it shared. Refcounts and hit counts are
/// atomics and need no lock.
pub struct Context {
    pub(crate) tables: RwLock<Tables>,
    pub(crate) config: EventConfigInternal,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) ids: Box<dyn IdGenerator>,
}

impl Context {
    /// Context with the default config, clock and id generator.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn config(&self) -> &EventConfigInternal {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Shared view of every table, for lookups and cursor walks.
    pub fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    pub fn lock(&self) -> &RwLock<Tables> {
        &self.tables
    }

    /// Counted handle to the entity with `id`, of any kind.
    pub fn get_by_id(&self, id: EntId) -> Result<Entity> {
        let tables = self.tables.read();
        tables.by_id.get(id)?.acquire().ok_or(Error::ItemNotFound)
    }

    pub fn hitcount(&self, id: EntId) -> Result<HitCount> {
        let tables = self.tables.read();
        Ok(tables.by_id.get(id)?.header().hitcount())
    }

    /// Deletes the entity with `id` from whichever table holds it.
    pub fn delete_by_id(&self, id: EntId) -> Result<RefDrop> {
        let ent = {
            let mut tables = self.tables.write();
            match tables.by_id.get(id)? {
                IndexedEnt::Action(a) => {
                    let Tables { actions, by_id, .. } = &mut *tables;
                    Entity::Action(actions.delete_ent(&a, by_id)?)
                }
                IndexedEnt::Event(e) => {
                    tables.check_not_subevent(&e)?;
                    let Tables { events, by_id, .. } = &mut *tables;
                    Entity::Event(events.delete_ent(&e, by_id)?)
                }
                IndexedEnt::Route(r) => Entity::Route(tables.unlink_route(&r)?),
            }
        };
        let kind = ent.kind();
        let outcome = ent.drop_reference();
        info!("[DELETE_BY_ID] {} id={} released={}", kind.as_str(), id, outcome.released());
        Ok(outcome)
    }

    /// Drops a reference obtained from any `*_get_reference` call.
    pub fn drop_reference<T: crate::entity::TableEnt>(&self, ent: EntRef<T>) -> RefDrop {
        ent.drop_reference()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let Tables {
            actions,
            events,
            static_routes,
            dynamic_routes,
            by_id,
        } = self.tables.get_mut();
        // Routes first: they reference events. Events next: releasing an
        // event drops its action-list references.
        let routes = static_routes.clear(by_id) + dynamic_routes.clear(by_id);
        let n_events = events.free_ents(by_id);
        let n_actions = actions.free_ents(by_id);
        if !by_id.is_empty() {
            warn!("[CONTEXT] {} ids still indexed after teardown", by_id.len());
        }
        info!(
            "[CONTEXT] torn down: routes={} events={} actions={}",
            routes, n_events, n_actions
        );
    }
}
