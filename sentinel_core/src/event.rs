//! Events: labelled action programs with optional config overrides and
//! child-event links.

use crate::action::{ActionList, CallerArg};
use crate::config::{EventConfig, EventConfigInternal};
use crate::constants::ENT_ID_NONE;
use crate::context::{Context, Tables};
use crate::dispatch::dispatch;
use crate::entity::{EntHeader, EntRef, IndexedEnt, RefDrop, TableEnt};
use crate::errors::{Error, Result};
use crate::route::{Route, RouteTableKind};
use crate::rwlock::RwLock;
use crate::table::Table;
use crate::types::{ActionRes, EntId, Label, ObjectType, Priority};
use log::{debug, info};
use metrics::counter;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which child-event slot of an event.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubEvent {
    Insert = 0,
    Match = 1,
    Delete = 2,
}

impl SubEvent {
    pub const ALL: [SubEvent; 3] = [SubEvent::Insert, SubEvent::Match, SubEvent::Delete];
}

pub struct Event {
    header: EntHeader,
    label: Label,
    priority: Priority,
    config: Option<EventConfigInternal>,
    action_list: RwLock<ActionList>,
    // Child events by id; ENT_ID_NONE when unset. Non-owning.
    subevents: [AtomicU64; 3],
}

impl Event {
    pub(crate) fn new(
        id: EntId,
        label: Label,
        priority: Priority,
        config: Option<EventConfigInternal>,
    ) -> Self {
        Self {
            header: EntHeader::new(id),
            label,
            priority,
            config,
            action_list: RwLock::new(ActionList::new()),
            subevents: [
                AtomicU64::new(ENT_ID_NONE),
                AtomicU64::new(ENT_ID_NONE),
                AtomicU64::new(ENT_ID_NONE),
            ],
        }
    }

    #[inline]
    pub fn label(&self) -> &Label {
        &self.label
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The config override embedded at insert, if any.
    pub fn config(&self) -> Option<&EventConfigInternal> {
        self.config.as_ref()
    }

    pub fn action_list(&self) -> &RwLock<ActionList> {
        &self.action_list
    }

    /// Id of the child event in `which`, if set.
    pub fn subevent_id(&self, which: SubEvent) -> Option<EntId> {
        match self.subevents[which as usize].load(Ordering::Acquire) {
            ENT_ID_NONE => None,
            id => Some(id),
        }
    }

    fn set_subevent_id(&self, which: SubEvent, id: EntId) {
        self.subevents[which as usize].store(id, Ordering::Release);
    }

    /// Whether any child slot points at `id`.
    pub fn references(&self, id: EntId) -> bool {
        SubEvent::ALL.iter().any(|w| self.subevent_id(*w) == Some(id))
    }
}

impl TableEnt for Event {
    type Key = Label;
    const KIND: ObjectType = ObjectType::Event;

    fn header(&self) -> &EntHeader {
        &self.header
    }

    fn key(&self) -> &Label {
        &self.label
    }

    fn release(&self) {
        let n = self.action_list.write().delete_all();
        if n > 0 {
            debug!("[EVENT_RELEASE] {} dropped {} action refs", self.label, n);
        }
    }

    fn index_ptr(ent: &Arc<Self>) -> IndexedEnt {
        IndexedEnt::Event(Arc::clone(ent))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

pub type EventTable = Table<Event>;

pub(crate) fn new_event_table() -> EventTable {
    Table::new("events", Label::cmp)
}

impl Tables {
    /// Fails with `Busy` while another event names `event` as a child.
    pub(crate) fn check_not_subevent(&self, event: &Event) -> Result<()> {
        let id = event.header().id();
        if let Some(parent) = self.events.iter().find(|e| e.id() != id && e.references(id)) {
            debug!("[EVENT_DELETE] {} still a child of {}", event.label(), parent.label());
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub(crate) fn event_by_id(&self, id: EntId) -> Option<Arc<Event>> {
        match self.by_id.get(id) {
            Ok(IndexedEnt::Event(e)) => Some(e),
            _ => None,
        }
    }
}

impl Context {
    /// Inserts an event. `config`, when given, is validated and overrides
    /// the context default for routes under this event.
    pub fn event_insert(
        &self,
        label: impl AsRef<[u8]>,
        priority: Priority,
        config: Option<EventConfig>,
    ) -> Result<EntId> {
        let label = Label::new(label)?;
        let config = config.map(EventConfig::load).transpose()?;
        let id = self.ids.make_id(ObjectType::Event)?;
        let event = EntRef::adopt(Event::new(id, label, priority, config));
        let mut tables = self.tables.write();
        let Tables { events, by_id, .. } = &mut *tables;
        events.insert(event, true, by_id)?;
        info!("[EVENT_INSERT] label={} id={} priority={}", label, id, priority);
        counter!("sentinel_events_inserted_total").increment(1);
        Ok(id)
    }

    pub fn event_delete(&self, label: impl AsRef<[u8]>) -> Result<RefDrop> {
        let label = Label::new(label)?;
        let event = {
            let mut tables = self.tables.write();
            tables.check_not_subevent(tables.events.get(&label)?)?;
            let Tables { events, by_id, .. } = &mut *tables;
            events.delete(&label, by_id)?
        };
        let id = event.id();
        let outcome = event.drop_reference();
        info!("[EVENT_DELETE] label={} id={} released={}", label, id, outcome.released());
        Ok(outcome)
    }

    pub fn event_get_reference(&self, label: impl AsRef<[u8]>) -> Result<EntRef<Event>> {
        let label = Label::new(label)?;
        self.tables.read().events.get_reference(&label)
    }

    pub fn event_drop_reference(&self, event: EntRef<Event>) -> RefDrop {
        event.drop_reference()
    }

    /// Points `which` of event `label` at `child`.
    pub fn event_set_subevent(
        &self,
        label: impl AsRef<[u8]>,
        which: SubEvent,
        child: impl AsRef<[u8]>,
    ) -> Result<()> {
        let label = Label::new(label)?;
        let child = Label::new(child)?;
        let tables = self.tables.write();
        let parent = tables.events.get(&label)?;
        let child = tables.events.get(&child)?;
        parent.set_subevent_id(which, child.id());
        debug!("[SUBEVENT] {} {:?} -> {}", parent.label(), which, child.label());
        Ok(())
    }

    pub fn event_clear_subevent(&self, label: impl AsRef<[u8]>, which: SubEvent) -> Result<()> {
        let label = Label::new(label)?;
        let tables = self.tables.write();
        tables.events.get(&label)?.set_subevent_id(which, ENT_ID_NONE);
        Ok(())
    }

    /// Counted reference to the child event in `which`, or `ItemNotFound`
    /// when the slot is empty or the child is gone.
    pub fn event_get_subevent(&self, label: impl AsRef<[u8]>, which: SubEvent) -> Result<EntRef<Event>> {
        let label = Label::new(label)?;
        let tables = self.tables.read();
        let id = tables
            .events
            .get(&label)?
            .subevent_id(which)
            .ok_or(Error::ItemNotFound)?;
        let child = tables.event_by_id(id).ok_or(Error::ItemNotFound)?;
        EntRef::acquire(&child).ok_or(Error::ItemNotFound)
    }

    pub fn event_action_append(&self, label: impl AsRef<[u8]>, action: impl AsRef<[u8]>) -> Result<()> {
        let label = Label::new(label)?;
        let action = Label::new(action)?;
        let tables = self.tables.write();
        let event = tables.events.get(&label)?;
        event.action_list.write().append(&tables.actions, &action)?;
        debug!("[EVENT_ACTION] {} append {}", label, action);
        Ok(())
    }

    pub fn event_action_prepend(&self, label: impl AsRef<[u8]>, action: impl AsRef<[u8]>) -> Result<()> {
        let label = Label::new(label)?;
        let action = Label::new(action)?;
        let tables = self.tables.write();
        let event = tables.events.get(&label)?;
        event.action_list.write().prepend(&tables.actions, &action)?;
        debug!("[EVENT_ACTION] {} prepend {}", label, action);
        Ok(())
    }

    pub fn event_action_insert_after(
        &self,
        label: impl AsRef<[u8]>,
        action: impl AsRef<[u8]>,
        point: impl AsRef<[u8]>,
    ) -> Result<()> {
        let label = Label::new(label)?;
        let action = Label::new(action)?;
        let point = Label::new(point)?;
        let tables = self.tables.write();
        let event = tables.events.get(&label)?;
        event
            .action_list
            .write()
            .insert_after(&tables.actions, &action, &point)?;
        debug!("[EVENT_ACTION] {} insert {} after {}", label, action, point);
        Ok(())
    }

    pub fn event_action_delete(&self, label: impl AsRef<[u8]>, action: impl AsRef<[u8]>) -> Result<RefDrop> {
        let label = Label::new(label)?;
        let action = Label::new(action)?;
        let tables = self.tables.write();
        let event = tables.events.get(&label)?;
        let outcome = event.action_list.write().delete(&action)?;
        debug!("[EVENT_ACTION] {} delete {}", label, action);
        Ok(outcome)
    }

    /// Labels of the event's action list, in run order.
    pub fn event_action_labels(&self, label: impl AsRef<[u8]>) -> Result<Vec<Label>> {
        let label = Label::new(label)?;
        let tables = self.tables.read();
        let labels = tables.events.get(&label)?.action_list.read().labels();
        Ok(labels)
    }

    /// Runs the event's action list. The context's shared lock is held for
    /// the whole walk.
    pub fn event_dispatch(
        &self,
        label: impl AsRef<[u8]>,
        caller_arg: Option<CallerArg<'_>>,
        route_table: Option<RouteTableKind>,
        route: Option<&Route>,
        results: &mut ActionRes,
    ) -> Result<()> {
        let label = Label::new(label)?;
        let tables = self.tables.read();
        let event = tables.events.get(&label)?;
        let list = event.action_list.read();
        dispatch(
            &tables,
            &list,
            caller_arg,
            Some(&**event),
            route_table.map(|k| tables.route_table(k)),
            route,
            results,
        )
    }
}
