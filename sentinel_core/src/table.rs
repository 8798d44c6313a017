//! Keyed entity tables and the context-wide by-id index.
//!
//! A [`Table`] keeps its entries in a doubly-linked list ordered by the
//! table's comparator; entries with equal keys (non-unique tables) keep
//! insertion order. The table itself owns one reference to every member.

use crate::entity::{EntRef, IndexedEnt, TableEnt};
use crate::errors::{Error, Result};
use crate::list::{List, NodeId};
use crate::types::{EntId, ObjectType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, trace, warn};
use metrics::gauge;
use std::cmp::Ordering;

pub type CmpFn<K> = fn(&K, &K) -> Ordering;

/// Maps every live table member, of any kind, to its id.
#[derive(Default)]
pub struct ByIdIndex {
    ents: DashMap<EntId, IndexedEnt>,
}

impl ByIdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, ptr: IndexedEnt) -> Result<()> {
        match self.ents.entry(ptr.header().id()) {
            Entry::Occupied(_) => Err(Error::ItemAlreadyPresent),
            Entry::Vacant(v) => {
                v.insert(ptr);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, id: EntId) -> Option<IndexedEnt> {
        self.ents.remove(&id).map(|(_, ptr)| ptr)
    }

    pub fn get(&self, id: EntId) -> Result<IndexedEnt> {
        self.ents
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(Error::ItemNotFound)
    }

    pub fn contains(&self, id: EntId) -> bool {
        self.ents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.ents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ents.is_empty()
    }
}

pub struct Table<T: TableEnt> {
    name: &'static str,
    list: List<EntRef<T>>,
    cmp_fn: CmpFn<T::Key>,
    n_ents: u64,
}

impl<T: TableEnt> Table<T> {
    pub fn new(name: &'static str, cmp_fn: CmpFn<T::Key>) -> Self {
        Self {
            name,
            list: List::new(),
            cmp_fn,
            n_ents: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn ent_type(&self) -> ObjectType {
        T::KIND
    }

    /// Number of member entries.
    #[inline]
    pub fn len(&self) -> u64 {
        self.n_ents
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_ents == 0
    }

    #[inline]
    fn cmp(&self, a: &T::Key, b: &T::Key) -> Ordering {
        (self.cmp_fn)(a, b)
    }

    fn report_size(&self) {
        gauge!("sentinel_table_entries", "table" => self.name).set(self.n_ents as f64);
    }

    /// Walks to the first node with key `>= key`. Returns the node and
    /// whether its key is equal.
    fn lower_bound(&self, key: &T::Key) -> Option<(NodeId, bool)> {
        let mut cur = self.list.head();
        while let Some(id) = cur {
            let ent = self.list.get(id)?;
            match self.cmp(ent.key(), key) {
                Ordering::Less => cur = self.list.next(id),
                Ordering::Equal => return Some((id, true)),
                Ordering::Greater => return Some((id, false)),
            }
        }
        None
    }

    /// First node with key strictly greater than `key`.
    fn upper_bound(&self, key: &T::Key) -> Option<NodeId> {
        let mut cur = self.list.head();
        while let Some(id) = cur {
            let ent = self.list.get(id)?;
            if self.cmp(ent.key(), key) == Ordering::Greater {
                return Some(id);
            }
            cur = self.list.next(id);
        }
        None
    }

    /// Links `ent` into the table and the by-id index. The table takes over
    /// the reference passed in. On failure nothing stays linked and the
    /// reference is dropped.
    pub fn insert(&mut self, ent: EntRef<T>, unique: bool, by_id: &ByIdIndex) -> Result<EntId> {
        let id = ent.id();
        if unique {
            if let Some((_, true)) = self.lower_bound(ent.key()) {
                return Err(Error::ItemAlreadyPresent);
            }
        }
        let ptr = T::index_ptr(ent.arc());
        let node = match self.upper_bound(ent.key()) {
            Some(point) => self.list.insert_before(point, ent)?,
            None => self.list.push_back(ent)?,
        };
        if let Err(e) = by_id.insert(ptr) {
            debug!("[TABLE_INSERT] {}: id {} already indexed, rolling back", self.name, id);
            // Dropping the unlinked reference releases the entity.
            let _ = self.list.remove(node);
            return Err(e);
        }
        self.n_ents += 1;
        trace!("[TABLE_INSERT] {} id={} n_ents={}", self.name, id, self.n_ents);
        self.report_size();
        Ok(id)
    }

    /// Member with a key equal to `key`. The refcount is unchanged.
    pub fn get(&self, key: &T::Key) -> Result<&EntRef<T>> {
        match self.lower_bound(key) {
            Some((node, true)) => self.list.get(node).ok_or(Error::ItemNotFound),
            _ => Err(Error::ItemNotFound),
        }
    }

    /// Member with a key equal to `key`, with a new reference taken on it.
    pub fn get_reference(&self, key: &T::Key) -> Result<EntRef<T>> {
        self.get(key).cloned()
    }

    fn unlink(&mut self, node: NodeId, by_id: &ByIdIndex) -> Result<EntRef<T>> {
        let ent = self.list.remove(node)?;
        by_id.remove(ent.id());
        self.n_ents -= 1;
        trace!("[TABLE_DELETE] {} id={} n_ents={}", self.name, ent.id(), self.n_ents);
        self.report_size();
        Ok(ent)
    }

    /// Unlinks the member with a key equal to `key` and hands the table's
    /// reference to the caller.
    pub fn delete(&mut self, key: &T::Key, by_id: &ByIdIndex) -> Result<EntRef<T>> {
        match self.lower_bound(key) {
            Some((node, true)) => self.unlink(node, by_id),
            _ => Err(Error::ItemNotFound),
        }
    }

    /// Unlinks exactly `ent` (by identity, not just by key).
    pub fn delete_ent(&mut self, ent: &T, by_id: &ByIdIndex) -> Result<EntRef<T>> {
        let mut cur = match self.lower_bound(ent.key()) {
            Some((node, true)) => Some(node),
            _ => return Err(Error::ItemNotFound),
        };
        while let Some(node) = cur {
            let member = self.list.get(node).ok_or(Error::ItemNotFound)?;
            if std::ptr::eq(&**member, ent) {
                return self.unlink(node, by_id);
            }
            if self.cmp(member.key(), ent.key()) != Ordering::Equal {
                break;
            }
            cur = self.list.next(node);
        }
        Err(Error::ItemNotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntRef<T>> + '_ {
        self.list.iter()
    }

    pub fn cursor(&self) -> Cursor<'_, T> {
        Cursor {
            table: self,
            point: self.list.head(),
        }
    }

    /// Single pass over every member: `filter` returning `true` unlinks the
    /// member and passes the table's reference to `dropper`. Returns the
    /// number of members dropped.
    pub fn filter<F, D>(&mut self, by_id: &ByIdIndex, mut filter: F, mut dropper: D) -> Result<usize>
    where
        F: FnMut(&T) -> Result<bool>,
        D: FnMut(EntRef<T>) -> Result<()>,
    {
        let mut dropped = 0;
        let mut cur = self.list.head();
        while let Some(node) = cur {
            // Captured before the current node can be unlinked.
            cur = self.list.next(node);
            let verdict = match self.list.get(node) {
                Some(ent) => filter(&**ent)?,
                None => break,
            };
            if verdict {
                let ent = self.unlink(node, by_id)?;
                dropper(ent)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Unlinks and drops every member, head to tail.
    pub fn free_ents(&mut self, by_id: &ByIdIndex) -> usize {
        let mut freed = 0;
        while let Some(node) = self.list.head() {
            match self.unlink(node, by_id) {
                Ok(ent) => {
                    drop(ent);
                    freed += 1;
                }
                Err(e) => {
                    warn!("[TABLE_FREE] {}: stopped after {} entries: {}", self.name, freed, e);
                    break;
                }
            }
        }
        freed
    }
}

/// Where [`Cursor::seek`] landed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SeekPosition {
    /// On an entry with an equal key.
    Exact,
    /// On the first entry with a greater key.
    AfterKey,
    /// Every entry is less than the key; the cursor is on the tail (or the
    /// table is empty).
    PastEnd,
}

/// Ordered walk over a table. The cursor borrows the table, so the table
/// cannot be mutated while a cursor on it is alive.
pub struct Cursor<'a, T: TableEnt> {
    table: &'a Table<T>,
    point: Option<NodeId>,
}

impl<'a, T: TableEnt> Cursor<'a, T> {
    pub fn seek_to_head(&mut self) {
        self.point = self.table.list.head();
    }

    pub fn seek_to_tail(&mut self) {
        self.point = self.table.list.tail();
    }

    pub fn current(&self) -> Option<&'a EntRef<T>> {
        self.table.list.get(self.point?)
    }

    /// Advances and returns the new current entry.
    pub fn next(&mut self) -> Option<&'a EntRef<T>> {
        self.point = self.table.list.next(self.point?);
        self.current()
    }

    /// Steps back and returns the new current entry.
    pub fn prev(&mut self) -> Option<&'a EntRef<T>> {
        self.point = self.table.list.prev(self.point?);
        self.current()
    }

    pub fn seek(&mut self, key: &T::Key) -> SeekPosition {
        match self.table.lower_bound(key) {
            Some((node, exact)) => {
                self.point = Some(node);
                if exact {
                    SeekPosition::Exact
                } else {
                    SeekPosition::AfterKey
                }
            }
            None => {
                self.point = self.table.list.tail();
                SeekPosition::PastEnd
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{handler, Action, ActionHandler};
    use crate::capabilities::{IdGenerator, SequentialIds};
    use crate::types::Label;
    use std::sync::Arc;

    fn noop() -> ActionHandler {
        handler(|_call, _res| Ok(()))
    }

    fn action(ids: &SequentialIds, label: &str) -> EntRef<Action> {
        let id = ids.make_id(ObjectType::Action).unwrap();
        EntRef::adopt(Action::new(id, Label::new(label).unwrap(), noop(), None))
    }

    fn table() -> Table<Action> {
        Table::new("actions", Label::cmp)
    }

    fn labels(t: &Table<Action>) -> Vec<String> {
        t.iter().map(|a| a.label().to_string()).collect()
    }

    #[test]
    fn insert_keeps_key_order_and_count() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        for l in ["ccc", "a", "bb", "b"] {
            t.insert(action(&ids, l), true, &by_id).unwrap();
        }
        assert_eq!(labels(&t), vec!["a", "b", "bb", "ccc"]);
        assert_eq!(t.len(), 4);
        assert_eq!(by_id.len(), 4);
    }

    #[test]
    fn unique_insert_rejects_duplicate_and_releases_it() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        t.insert(action(&ids, "log"), true, &by_id).unwrap();
        let dup = action(&ids, "log");
        let arc = Arc::clone(dup.arc());
        assert_eq!(t.insert(dup, true, &by_id), Err(Error::ItemAlreadyPresent));
        assert_eq!(arc.header().refcount(), 0);
        assert_eq!(t.len(), 1);
        assert_eq!(by_id.len(), 1);
    }

    #[test]
    fn non_unique_insert_keeps_insertion_order_for_equal_keys() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        let first = action(&ids, "dup");
        let first_id = first.id();
        t.insert(first, false, &by_id).unwrap();
        let second = action(&ids, "dup");
        let second_id = second.id();
        t.insert(second, false, &by_id).unwrap();
        let got: Vec<_> = t.iter().map(|a| a.id()).collect();
        assert_eq!(got, vec![first_id, second_id]);
        assert!(matches!(by_id.get(second_id), Ok(IndexedEnt::Action(_))));
        // get() finds the first of the run.
        assert_eq!(t.get(&Label::new("dup").unwrap()).unwrap().id(), first_id);
    }

    #[test]
    fn delete_ent_removes_exact_member_among_equal_keys() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        let a = action(&ids, "dup");
        let b = action(&ids, "dup");
        let b_id = b.id();
        let b_arc = Arc::clone(b.arc());
        t.insert(a, false, &by_id).unwrap();
        t.insert(b, false, &by_id).unwrap();
        let removed = t.delete_ent(&b_arc, &by_id).unwrap();
        assert_eq!(removed.id(), b_id);
        assert!(!by_id.contains(b_id));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn id_collision_rolls_back_insert() {
        let by_id = ByIdIndex::new();
        let mut t = table();
        t.insert(EntRef::adopt(Action::new(5, Label::new("x").unwrap(), noop(), None)), true, &by_id)
            .unwrap();
        let clash = EntRef::adopt(Action::new(5, Label::new("y").unwrap(), noop(), None));
        assert_eq!(t.insert(clash, true, &by_id), Err(Error::ItemAlreadyPresent));
        assert_eq!(labels(&t), vec!["x"]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn cursor_walks_both_ways_and_seeks() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        for l in ["a", "c", "e"] {
            t.insert(action(&ids, l), true, &by_id).unwrap();
        }
        let mut c = t.cursor();
        assert_eq!(c.current().unwrap().label().to_string(), "a");
        assert_eq!(c.next().unwrap().label().to_string(), "c");
        assert_eq!(c.next().unwrap().label().to_string(), "e");
        assert!(c.next().is_none());
        c.seek_to_tail();
        assert_eq!(c.prev().unwrap().label().to_string(), "c");

        assert_eq!(c.seek(&Label::new("c").unwrap()), SeekPosition::Exact);
        assert_eq!(c.seek(&Label::new("d").unwrap()), SeekPosition::AfterKey);
        assert_eq!(c.current().unwrap().label().to_string(), "e");
        assert_eq!(c.seek(&Label::new("zz").unwrap()), SeekPosition::PastEnd);
        assert_eq!(c.current().unwrap().label().to_string(), "e");
    }

    #[test]
    fn filter_drops_matching_members() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        for l in ["a", "b", "c", "d"] {
            t.insert(action(&ids, l), true, &by_id).unwrap();
        }
        let mut seen = Vec::new();
        let dropped = t
            .filter(
                &by_id,
                |a| Ok(a.label().as_bytes() == b"b" || a.label().as_bytes() == b"c"),
                |ent| {
                    seen.push(ent.label().to_string());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(seen, vec!["b", "c"]);
        assert_eq!(labels(&t), vec!["a", "d"]);
        assert_eq!(t.len(), 2);
        assert_eq!(by_id.len(), 2);
    }

    #[test]
    fn free_ents_empties_table_and_index() {
        let ids = SequentialIds::new();
        let by_id = ByIdIndex::new();
        let mut t = table();
        for l in ["a", "b"] {
            t.insert(action(&ids, l), true, &by_id).unwrap();
        }
        assert_eq!(t.free_ents(&by_id), 2);
        assert!(t.is_empty());
        assert!(by_id.is_empty());
    }
}
