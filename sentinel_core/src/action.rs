//! Actions (named handlers) and the per-event action lists built from them.

use crate::context::{Context, Tables};
use crate::entity::{EntHeader, EntRef, IndexedEnt, RefDrop, TableEnt};
use crate::errors::{Error, HandlerError, Result};
use crate::event::Event;
use crate::list::{List, NodeId};
use crate::route::{Route, RouteTable};
use crate::table::Table;
use crate::types::{ActionRes, EntId, Label, ObjectType};
use log::{debug, info};
use metrics::counter;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque value stored with an action and handed back to its handler.
pub type HandlerArg = Arc<dyn Any + Send + Sync>;

/// Caller-side value passed through dispatch to every handler.
pub type CallerArg<'a> = &'a (dyn Any + Send + Sync);

/// Everything a handler sees besides the result word.
///
/// `tables` is the context's table set as seen under the shared lock
/// dispatch already holds. Handlers must not call back into the
/// [`Context`] (that would take its lock again) and must not mutate the
/// action list being walked.
pub struct ActionCall<'a> {
    pub tables: &'a Tables,
    pub action: &'a Action,
    pub handler_arg: Option<&'a HandlerArg>,
    pub caller_arg: Option<CallerArg<'a>>,
    pub trigger_event: Option<&'a Event>,
    pub route_table: Option<&'a RouteTable>,
    pub route: Option<&'a Route>,
}

pub type ActionHandler = Arc<
    dyn Fn(&ActionCall<'_>, &mut ActionRes) -> std::result::Result<(), HandlerError> + Send + Sync,
>;

/// Wraps a closure as an [`ActionHandler`].
pub fn handler<F>(f: F) -> ActionHandler
where
    F: Fn(&ActionCall<'_>, &mut ActionRes) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub struct Action {
    header: EntHeader,
    label: Label,
    handler: ActionHandler,
    handler_arg: Option<HandlerArg>,
}

impl Action {
    pub(crate) fn new(
        id: EntId,
        label: Label,
        handler: ActionHandler,
        handler_arg: Option<HandlerArg>,
    ) -> Self {
        Self {
            header: EntHeader::new(id),
            label,
            handler,
            handler_arg,
        }
    }

    #[inline]
    pub fn label(&self) -> &Label {
        &self.label
    }

    #[inline]
    pub fn handler_arg(&self) -> Option<&HandlerArg> {
        self.handler_arg.as_ref()
    }

    pub(crate) fn invoke(
        &self,
        call: &ActionCall<'_>,
        results: &mut ActionRes,
    ) -> std::result::Result<(), HandlerError> {
        (self.handler)(call, results)
    }
}

impl TableEnt for Action {
    type Key = Label;
    const KIND: ObjectType = ObjectType::Action;

    fn header(&self) -> &EntHeader {
        &self.header
    }

    fn key(&self) -> &Label {
        &self.label
    }

    fn index_ptr(ent: &Arc<Self>) -> IndexedEnt {
        IndexedEnt::Action(Arc::clone(ent))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("label", &self.label)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

pub type ActionTable = Table<Action>;

pub(crate) fn new_action_table() -> ActionTable {
    Table::new("actions", Label::cmp)
}

/// Ordered list of counted action references. An action appears at most
/// once per list.
#[derive(Default)]
pub struct ActionList {
    entries: List<EntRef<Action>>,
}

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntRef<Action>> + '_ {
        self.entries.iter()
    }

    pub fn labels(&self) -> Vec<Label> {
        self.iter().map(|a| *a.label()).collect()
    }

    fn find_label(&self, label: &Label) -> Option<NodeId> {
        self.entries.find(|a| a.label() == label)
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.find_label(label).is_some()
    }

    fn check_absent(&self, action: &EntRef<Action>) -> Result<()> {
        if self.entries.find(|a| a.ptr_eq(action)).is_some() {
            return Err(Error::ItemAlreadyPresent);
        }
        Ok(())
    }

    // On every error path below the acquired `action` reference goes out of
    // scope and is dropped, so the action's refcount is left as it was.

    pub fn append(&mut self, actions: &ActionTable, label: &Label) -> Result<()> {
        let action = actions.get_reference(label)?;
        self.check_absent(&action)?;
        self.entries.push_back(action)?;
        Ok(())
    }

    pub fn prepend(&mut self, actions: &ActionTable, label: &Label) -> Result<()> {
        let action = actions.get_reference(label)?;
        self.check_absent(&action)?;
        self.entries.push_front(action)?;
        Ok(())
    }

    /// Inserts `label` right after the entry for `point`.
    pub fn insert_after(&mut self, actions: &ActionTable, label: &Label, point: &Label) -> Result<()> {
        let action = actions.get_reference(label)?;
        self.check_absent(&action)?;
        let point = self.find_label(point).ok_or(Error::ItemNotFound)?;
        self.entries.insert_after(point, action)?;
        Ok(())
    }

    /// Removes the entry for `label` and drops its reference.
    pub fn delete(&mut self, label: &Label) -> Result<RefDrop> {
        let node = self.find_label(label).ok_or(Error::ItemNotFound)?;
        let action = self.entries.remove(node)?;
        Ok(action.drop_reference())
    }

    /// Removes every entry, dropping each reference. Returns how many were
    /// removed.
    pub fn delete_all(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.drain_with(drop);
        n
    }
}

impl fmt::Debug for ActionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|a| a.label())).finish()
    }
}

impl Context {
    /// Registers a new action. Returns its id.
    pub fn action_insert(
        &self,
        label: impl AsRef<[u8]>,
        handler: ActionHandler,
        handler_arg: Option<HandlerArg>,
    ) -> Result<EntId> {
        let label = Label::new(label)?;
        let id = self.ids.make_id(ObjectType::Action)?;
        let action = EntRef::adopt(Action::new(id, label, handler, handler_arg));
        let mut tables = self.tables.write();
        let Tables { actions, by_id, .. } = &mut *tables;
        actions.insert(action, true, by_id)?;
        info!("[ACTION_INSERT] label={} id={}", label, id);
        counter!("sentinel_actions_inserted_total").increment(1);
        Ok(id)
    }

    /// Unlinks the action and drops the table's reference. Lists still
    /// holding it keep the detached action alive.
    pub fn action_delete(&self, label: impl AsRef<[u8]>) -> Result<RefDrop> {
        let label = Label::new(label)?;
        let action = {
            let mut tables = self.tables.write();
            let Tables { actions, by_id, .. } = &mut *tables;
            actions.delete(&label, by_id)?
        };
        let id = action.id();
        let outcome = action.drop_reference();
        info!("[ACTION_DELETE] label={} id={} released={}", label, id, outcome.released());
        Ok(outcome)
    }

    pub fn action_get_reference(&self, label: impl AsRef<[u8]>) -> Result<EntRef<Action>> {
        let label = Label::new(label)?;
        let action = self.tables.read().actions.get_reference(&label)?;
        debug!("[ACTION_REF] label={} refcount={}", label, action.refcount());
        Ok(action)
    }

    pub fn action_drop_reference(&self, action: EntRef<Action>) -> RefDrop {
        action.drop_reference()
    }
}
