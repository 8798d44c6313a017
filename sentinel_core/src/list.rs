//! Doubly-linked list over an index slab.
//!
//! Nodes live in a growable slot vector and link to each other by index, so
//! the list never aliases raw addresses. Every node handed out carries the
//! generation of its slot; a [`NodeId`] that outlives its node is rejected
//! instead of silently addressing whatever reused the slot.

use crate::errors::{Error, Result};
use crate::helpers::{pack, unpack};

/// Generation-tagged handle to a list node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    fn new(index: u32, gen: u32) -> Self {
        NodeId(pack(index, gen))
    }

    #[inline]
    fn index(self) -> usize {
        unpack(self.0).0 as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        unpack(self.0).1
    }
}

struct Node<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

pub struct List<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn id_of(&self, index: u32) -> NodeId {
        NodeId::new(index, self.slots[index as usize].generation)
    }

    fn node(&self, index: u32) -> &Node<T> {
        match self.slots[index as usize].node.as_ref() {
            Some(n) => n,
            None => unreachable!("linked slot {index} is vacant"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        match self.slots[index as usize].node.as_mut() {
            Some(n) => n,
            None => unreachable!("linked slot {index} is vacant"),
        }
    }

    /// Resolves `id` to its slot index if it still names a live node.
    fn live(&self, id: NodeId) -> Option<u32> {
        let slot = self.slots.get(id.index())?;
        (slot.generation == id.generation() && slot.node.is_some()).then_some(id.index() as u32)
    }

    fn alloc(&mut self, value: T) -> Result<u32> {
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize].node = Some(node);
            return Ok(index);
        }
        if self.slots.len() >= u32::MAX as usize {
            return Err(Error::SysResourceFailed);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| Error::SysResourceFailed)?;
        // The free list may need to hold every slot once they are released.
        self.free
            .try_reserve(self.slots.len() + 1 - self.free.len())
            .map_err(|_| Error::SysResourceFailed)?;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        Ok((self.slots.len() - 1) as u32)
    }

    pub fn push_back(&mut self, value: T) -> Result<NodeId> {
        let index = self.alloc(value)?;
        let old_tail = self.tail;
        {
            let n = self.node_mut(index);
            n.prev = old_tail;
            n.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Ok(self.id_of(index))
    }

    pub fn push_front(&mut self, value: T) -> Result<NodeId> {
        let index = self.alloc(value)?;
        let old_head = self.head;
        {
            let n = self.node_mut(index);
            n.prev = None;
            n.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
        Ok(self.id_of(index))
    }

    /// Links `value` immediately after `point`.
    pub fn insert_after(&mut self, point: NodeId, value: T) -> Result<NodeId> {
        let p = self.live(point).ok_or(Error::ItemNotFound)?;
        let index = self.alloc(value)?;
        let after = self.node(p).next;
        {
            let n = self.node_mut(index);
            n.prev = Some(p);
            n.next = after;
        }
        self.node_mut(p).next = Some(index);
        match after {
            Some(a) => self.node_mut(a).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        Ok(self.id_of(index))
    }

    /// Links `value` immediately before `point`.
    pub fn insert_before(&mut self, point: NodeId, value: T) -> Result<NodeId> {
        let p = self.live(point).ok_or(Error::ItemNotFound)?;
        let index = self.alloc(value)?;
        let before = self.node(p).prev;
        {
            let n = self.node_mut(index);
            n.prev = before;
            n.next = Some(p);
        }
        self.node_mut(p).prev = Some(index);
        match before {
            Some(b) => self.node_mut(b).next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
        Ok(self.id_of(index))
    }

    /// Unlinks the node and hands its value back.
    pub fn remove(&mut self, id: NodeId) -> Result<T> {
        let index = self.live(id).ok_or(Error::ItemNotFound)?;
        let slot = &mut self.slots[index as usize];
        let node = match slot.node.take() {
            Some(n) => n,
            None => return Err(Error::ItemNotFound),
        };
        slot.generation = slot.generation.wrapping_add(1);
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        // Capacity was reserved in alloc().
        self.free.push(index);
        self.len -= 1;
        Ok(node.value)
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head.map(|i| self.id_of(i))
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail.map(|i| self.id_of(i))
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        let i = self.live(id)?;
        self.node(i).next.map(|n| self.id_of(n))
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        let i = self.live(id)?;
        self.node(i).prev.map(|p| self.id_of(p))
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.live(id).map(|i| &self.node(i).value)
    }

    /// First node whose value satisfies `pred`, walking head to tail.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<NodeId> {
        let mut cur = self.head;
        while let Some(i) = cur {
            let n = self.node(i);
            if pred(&n.value) {
                return Some(self.id_of(i));
            }
            cur = n.next;
        }
        None
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cur: self.head,
            remaining: self.len,
        }
    }

    /// Unlinks every node head to tail, handing each value to `f`.
    pub fn drain_with(&mut self, mut f: impl FnMut(T)) {
        while let Some(h) = self.head() {
            if let Ok(v) = self.remove(h) {
                f(v);
            }
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a List<T>,
    cur: Option<u32>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let i = self.cur?;
        let n = self.list.node(i);
        self.cur = n.next;
        self.remaining -= 1;
        Some(&n.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
