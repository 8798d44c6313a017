//! Reference-counted entity lifecycle shared by actions, events and routes.
//!
//! Every entity carries an [`EntHeader`] with an explicit atomic refcount.
//! Table membership holds one reference; each [`EntRef`] handed out holds
//! one more. The entity's destructor hook runs exactly once, on the 1→0
//! transition, whichever holder triggers it.

use crate::action::Action;
use crate::event::Event;
use crate::route::Route;
use crate::types::{EntId, HitCount, ObjectType};
use log::{debug, error};
use metrics::counter;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Header embedded at the head of every table entity.
pub struct EntHeader {
    id: EntId,
    hitcount: AtomicU64,
    refcount: AtomicU32,
}

impl EntHeader {
    /// Fresh header; the initial reference belongs to whoever inserts the
    /// entity into its table.
    pub(crate) fn new(id: EntId) -> Self {
        Self {
            id,
            hitcount: AtomicU64::new(0),
            refcount: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn id(&self) -> EntId {
        self.id
    }

    #[inline]
    pub fn hitcount(&self) -> HitCount {
        self.hitcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Bumps the hit counter, returning the new count.
    #[inline]
    pub(crate) fn count_hit(&self) -> HitCount {
        self.hitcount.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for EntHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntHeader")
            .field("id", &self.id)
            .field("hitcount", &self.hitcount())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// An entity storable in a [`crate::table::Table`].
pub trait TableEnt: Send + Sync + Sized + 'static {
    /// Lookup key, compared by the owning table's comparator.
    type Key: ?Sized;

    const KIND: ObjectType;

    fn header(&self) -> &EntHeader;

    fn key(&self) -> &Self::Key;

    /// Destructor hook, run once when the last reference is dropped.
    fn release(&self) {}

    fn index_ptr(ent: &Arc<Self>) -> IndexedEnt;
}

/// Outcome of dropping one reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefDrop {
    /// Other references remain.
    Retained { refcount: u32 },
    /// This was the last reference; the entity has been released.
    Released,
}

impl RefDrop {
    pub fn released(self) -> bool {
        matches!(self, RefDrop::Released)
    }
}

/// One counted reference to an entity.
///
/// Cloning acquires a reference; dropping (or [`EntRef::drop_reference`])
/// gives it back.
pub struct EntRef<T: TableEnt> {
    ent: Arc<T>,
}

impl<T: TableEnt> EntRef<T> {
    /// Wraps a freshly built entity whose header already holds refcount 1.
    pub(crate) fn adopt(ent: T) -> Self {
        debug_assert_eq!(ent.header().refcount(), 1);
        Self { ent: Arc::new(ent) }
    }

    /// Takes a new reference on an entity reached through an index. Fails if
    /// the entity is already being released.
    pub(crate) fn acquire(ent: &Arc<T>) -> Option<Self> {
        ent.header()
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    v.checked_add(1)
                } else {
                    None
                }
            })
            .ok()?;
        Some(Self {
            ent: Arc::clone(ent),
        })
    }

    #[inline]
    pub fn id(&self) -> EntId {
        self.ent.header().id()
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.ent.header().refcount()
    }

    #[inline]
    pub fn hitcount(&self) -> HitCount {
        self.ent.header().hitcount()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ent, &other.ent)
    }

    pub(crate) fn arc(&self) -> &Arc<T> {
        &self.ent
    }

    /// Gives this reference back, reporting whether it was the last one.
    pub fn drop_reference(self) -> RefDrop {
        let mut this = ManuallyDrop::new(self);
        let outcome = this.release_one();
        // SAFETY: `this` is never touched again and its Drop never runs, so
        // the Arc is dropped exactly once here.
        unsafe { std::ptr::drop_in_place(&mut this.ent) };
        outcome
    }

    fn release_one(&self) -> RefDrop {
        let header = self.ent.header();
        match header
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(1) => {
                debug!("[RELEASE] {} id={}", T::KIND.as_str(), header.id());
                self.ent.release();
                counter!("sentinel_entities_released_total", "kind" => T::KIND.as_str()).increment(1);
                RefDrop::Released
            }
            Ok(prev) => RefDrop::Retained { refcount: prev - 1 },
            Err(_) => {
                error!(
                    "[RELEASE] refcount underflow on {} id={}",
                    T::KIND.as_str(),
                    header.id()
                );
                debug_assert!(false, "refcount underflow");
                RefDrop::Retained { refcount: 0 }
            }
        }
    }
}

impl<T: TableEnt> Clone for EntRef<T> {
    fn clone(&self) -> Self {
        // We hold a reference, so the count cannot be zero.
        self.ent.header().refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            ent: Arc::clone(&self.ent),
        }
    }
}

impl<T: TableEnt> Drop for EntRef<T> {
    fn drop(&mut self) {
        let _ = self.release_one();
    }
}

impl<T: TableEnt> Deref for EntRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.ent
    }
}

impl<T: TableEnt + fmt::Debug> fmt::Debug for EntRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.ent, f)
    }
}

/// Uncounted pointer held by the context-wide by-id index.
#[derive(Clone)]
pub enum IndexedEnt {
    Action(Arc<Action>),
    Event(Arc<Event>),
    Route(Arc<Route>),
}

impl IndexedEnt {
    pub fn kind(&self) -> ObjectType {
        match self {
            IndexedEnt::Action(_) => ObjectType::Action,
            IndexedEnt::Event(_) => ObjectType::Event,
            IndexedEnt::Route(_) => ObjectType::Route,
        }
    }

    pub fn header(&self) -> &EntHeader {
        match self {
            IndexedEnt::Action(a) => a.header(),
            IndexedEnt::Event(e) => e.header(),
            IndexedEnt::Route(r) => r.header(),
        }
    }

    /// Counted handle for the indexed entity.
    pub fn acquire(&self) -> Option<Entity> {
        Some(match self {
            IndexedEnt::Action(a) => Entity::Action(EntRef::acquire(a)?),
            IndexedEnt::Event(e) => Entity::Event(EntRef::acquire(e)?),
            IndexedEnt::Route(r) => Entity::Route(EntRef::acquire(r)?),
        })
    }
}

/// Counted reference to an entity of any kind.
pub enum Entity {
    Action(EntRef<Action>),
    Event(EntRef<Event>),
    Route(EntRef<Route>),
}

impl Entity {
    pub fn kind(&self) -> ObjectType {
        match self {
            Entity::Action(_) => ObjectType::Action,
            Entity::Event(_) => ObjectType::Event,
            Entity::Route(_) => ObjectType::Route,
        }
    }

    pub fn id(&self) -> EntId {
        self.header().id()
    }

    pub fn header(&self) -> &EntHeader {
        match self {
            Entity::Action(a) => a.header(),
            Entity::Event(e) => e.header(),
            Entity::Route(r) => r.header(),
        }
    }

    pub fn drop_reference(self) -> RefDrop {
        match self {
            Entity::Action(a) => a.drop_reference(),
            Entity::Event(e) => e.drop_reference(),
            Entity::Route(r) => r.drop_reference(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    struct Dummy {
        header: EntHeader,
    }

    impl TableEnt for Dummy {
        type Key = EntId;
        const KIND: ObjectType = ObjectType::Action;

        fn header(&self) -> &EntHeader {
            &self.header
        }

        fn key(&self) -> &EntId {
            &self.header.id
        }

        fn release(&self) {
            RELEASED.fetch_add(1, Ordering::SeqCst);
        }

        fn index_ptr(_ent: &Arc<Self>) -> IndexedEnt {
            unreachable!("dummy entities are never indexed")
        }
    }

    #[test]
    fn release_runs_once_on_last_drop() {
        let before = RELEASED.load(Ordering::SeqCst);
        let r = EntRef::adopt(Dummy {
            header: EntHeader::new(9),
        });
        let r2 = r.clone();
        let r3 = EntRef::acquire(r.arc()).unwrap();
        assert_eq!(r.refcount(), 3);
        assert_eq!(r2.drop_reference(), RefDrop::Retained { refcount: 2 });
        drop(r3);
        assert_eq!(RELEASED.load(Ordering::SeqCst), before);
        let arc = Arc::clone(r.arc());
        assert_eq!(r.drop_reference(), RefDrop::Released);
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);
        // A released entity cannot be resurrected through a stale pointer.
        assert!(EntRef::acquire(&arc).is_none());
        assert_eq!(arc.header().refcount(), 0);
    }
}
