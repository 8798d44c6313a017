//! Read–write lock with a reader→writer promotion path.
//!
//! Three waiter queues sit behind one state mutex: readers, writers and
//! promoters (shared holders asking for exclusive access). A promoter gives
//! up its shared count while it is queued, and queued promoters are served
//! before writers and new readers. Two concurrent promoters therefore never
//! wait on each other's shared claim; they are granted exclusive access one
//! after the other.
//!
//! Implements writer preference: a new reader waits while any writer or
//! promoter is queued. A thread that already holds a shared lock must not
//! take a second one, or it can deadlock behind a queued writer.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    shared: u32,
    exclusive: bool,
    read_waiters: u32,
    write_waiters: u32,
    promote_waiters: u32,
}

impl LockState {
    #[inline]
    fn reader_must_wait(&self) -> bool {
        self.exclusive || self.write_waiters > 0 || self.promote_waiters > 0
    }

    #[inline]
    fn writer_must_wait(&self) -> bool {
        self.exclusive || self.shared > 0 || self.promote_waiters > 0
    }

    #[inline]
    fn promoter_must_wait(&self) -> bool {
        self.exclusive || self.shared > 0
    }
}

/// Snapshot of the lock state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Shared(u32),
    Exclusive,
}

pub struct RawRwLock {
    state: Mutex<LockState>,
    read_waiters: Condvar,
    write_waiters: Condvar,
    promote_waiters: Condvar,
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwLock {
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(LockState {
                shared: 0,
                exclusive: false,
                read_waiters: 0,
                write_waiters: 0,
                promote_waiters: 0,
            }),
            read_waiters: Condvar::new(),
            write_waiters: Condvar::new(),
            promote_waiters: Condvar::new(),
        }
    }

    pub fn mode(&self) -> LockMode {
        let st = self.state.lock();
        if st.exclusive {
            LockMode::Exclusive
        } else if st.shared > 0 {
            LockMode::Shared(st.shared)
        } else {
            LockMode::Unlocked
        }
    }

    /// Number of threads queued in each waiter queue: (readers, writers, promoters).
    pub fn waiters(&self) -> (u32, u32, u32) {
        let st = self.state.lock();
        (st.read_waiters, st.write_waiters, st.promote_waiters)
    }

    /// Hands the lock to the next queue in priority order. Called with the
    /// state mutex held, after a release.
    fn wake_next(&self, st: &LockState) {
        if st.exclusive {
            return;
        }
        if st.promote_waiters > 0 {
            if st.shared == 0 {
                self.promote_waiters.notify_all();
            }
        } else if st.write_waiters > 0 {
            if st.shared == 0 {
                self.write_waiters.notify_all();
            }
        } else if st.read_waiters > 0 {
            self.read_waiters.notify_all();
        }
    }

    /// Acquire a **shared** (read) lock.
    /// Blocks while a writer holds the lock or any writer/promoter is queued.
    pub fn read_lock(&self) -> ReadGuard<'_> {
        let mut st = self.state.lock();
        if st.reader_must_wait() {
            st.read_waiters += 1;
            while st.reader_must_wait() {
                self.read_waiters.wait(&mut st);
            }
            st.read_waiters -= 1;
        }
        st.shared += 1;
        ReadGuard { lock: self }
    }

    /// Try to acquire a shared lock, giving up after `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Option<ReadGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        if st.reader_must_wait() {
            st.read_waiters += 1;
            while st.reader_must_wait() {
                if self.read_waiters.wait_until(&mut st, deadline).timed_out() && st.reader_must_wait() {
                    st.read_waiters -= 1;
                    return None;
                }
            }
            st.read_waiters -= 1;
        }
        st.shared += 1;
        Some(ReadGuard { lock: self })
    }

    fn read_unlock(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.shared > 0, "shared unlock without a shared holder");
        st.shared -= 1;
        if st.shared == 0 {
            self.wake_next(&st);
        }
    }

    /// Acquire an **exclusive** (write) lock.
    /// Blocks new readers and waits for in-flight readers to drain.
    pub fn write_lock(&self) -> WriteGuard<'_> {
        let mut st = self.state.lock();
        st.write_waiters += 1;
        while st.writer_must_wait() {
            self.write_waiters.wait(&mut st);
        }
        st.write_waiters -= 1;
        st.exclusive = true;
        WriteGuard { lock: self }
    }

    /// Try to acquire an exclusive lock, giving up after `timeout`.
    /// `Duration::ZERO` never blocks.
    pub fn try_write_for(&self, timeout: Duration) -> Option<WriteGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        st.write_waiters += 1;
        while st.writer_must_wait() {
            if self.write_waiters.wait_until(&mut st, deadline).timed_out() && st.writer_must_wait() {
                st.write_waiters -= 1;
                // Readers queued behind us may now proceed.
                self.wake_after_abandon(&st);
                return None;
            }
        }
        st.write_waiters -= 1;
        st.exclusive = true;
        Some(WriteGuard { lock: self })
    }

    fn wake_after_abandon(&self, st: &MutexGuard<'_, LockState>) {
        if !st.reader_must_wait() && st.read_waiters > 0 {
            self.read_waiters.notify_all();
        }
    }

    fn write_unlock(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.exclusive, "exclusive unlock without an exclusive holder");
        st.exclusive = false;
        self.wake_next(&st);
    }

    /// Trades one shared hold for an exclusive one. The shared count is given
    /// up while queued; promoters are served ahead of writers and readers.
    fn promote(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.shared > 0, "promotion without a shared hold");
        st.shared -= 1;
        st.promote_waiters += 1;
        if st.promoter_must_wait() {
            debug!(
                "[LOCK] promotion queued: shared={} promoters={}",
                st.shared, st.promote_waiters
            );
            while st.promoter_must_wait() {
                self.promote_waiters.wait(&mut st);
            }
        }
        st.promote_waiters -= 1;
        st.exclusive = true;
    }

    /// Non-blocking promotion: succeeds only when the caller is the sole
    /// shared holder and no other promotion is queued.
    fn try_promote(&self) -> bool {
        let mut st = self.state.lock();
        if st.shared == 1 && !st.exclusive && st.promote_waiters == 0 {
            st.shared = 0;
            st.exclusive = true;
            true
        } else {
            false
        }
    }

    fn downgrade(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.exclusive, "downgrade without an exclusive hold");
        st.exclusive = false;
        st.shared += 1;
        if !st.reader_must_wait() && st.read_waiters > 0 {
            self.read_waiters.notify_all();
        }
    }
}

/// Represents an acquired exclusive (write) lock.
/// The lock is released when this guard is dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct WriteGuard<'a> {
    lock: &'a RawRwLock,
}

impl<'a> WriteGuard<'a> {
    /// Converts to a shared hold without letting a writer in between.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.downgrade();
        ReadGuard { lock }
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

/// Represents an acquired shared (read) lock.
/// The lock is released when this guard is dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ReadGuard<'a> {
    lock: &'a RawRwLock,
}

impl<'a> ReadGuard<'a> {
    /// Blocks until this shared hold becomes exclusive. If another promotion
    /// was queued first, it completes before this one, so state read under
    /// the shared hold must be re-validated.
    pub fn promote(self) -> WriteGuard<'a> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.promote();
        WriteGuard { lock }
    }

    /// Promotes only if no waiting is needed; hands the shared hold back
    /// otherwise.
    pub fn try_promote(self) -> Result<WriteGuard<'a>, ReadGuard<'a>> {
        if self.lock.try_promote() {
            let lock = self.lock;
            core::mem::forget(self);
            Ok(WriteGuard { lock })
        } else {
            Err(self)
        }
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// A [`RawRwLock`] owning the data it protects.
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `raw`: shared references only
// under a shared hold, the mutable reference only under the exclusive hold.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn raw(&self) -> &RawRwLock {
        &self.raw
    }

    pub fn mode(&self) -> LockMode {
        self.raw.mode()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard {
            raw: self.raw.read_lock(),
            data: &self.data,
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard {
            raw: self.raw.write_lock(),
            data: &self.data,
        }
    }

    pub fn try_read_for(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, T>> {
        self.raw.try_read_for(timeout).map(|raw| RwLockReadGuard {
            raw,
            data: &self.data,
        })
    }

    pub fn try_write_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw.try_write_for(timeout).map(|raw| RwLockWriteGuard {
            raw,
            data: &self.data,
        })
    }

    /// Exclusive access through `&mut self`; no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    raw: ReadGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<'a, T: ?Sized> RwLockReadGuard<'a, T> {
    pub fn promote(self) -> RwLockWriteGuard<'a, T> {
        RwLockWriteGuard {
            raw: self.raw.promote(),
            data: self.data,
        }
    }

    pub fn try_promote(self) -> Result<RwLockWriteGuard<'a, T>, RwLockReadGuard<'a, T>> {
        let data = self.data;
        match self.raw.try_promote() {
            Ok(raw) => Ok(RwLockWriteGuard { raw, data }),
            Err(raw) => Err(RwLockReadGuard { raw, data }),
        }
    }
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared hold excludes every exclusive holder.
        unsafe { &*self.data.get() }
    }
}

#[must_use = "if unused the lock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    raw: WriteGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        RwLockReadGuard {
            raw: self.raw.downgrade(),
            data: self.data,
        }
    }
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive hold excludes every other holder.
        unsafe { &*self.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive hold excludes every other holder.
        unsafe { &mut *self.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_tracks_holders() {
        let lock = RawRwLock::new();
        assert_eq!(lock.mode(), LockMode::Unlocked);
        let r1 = lock.read_lock();
        let r2 = lock.read_lock();
        assert_eq!(lock.mode(), LockMode::Shared(2));
        drop(r1);
        drop(r2);
        let w = lock.write_lock();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        let r = w.downgrade();
        assert_eq!(lock.mode(), LockMode::Shared(1));
        let w = r.promote();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        drop(w);
        assert_eq!(lock.mode(), LockMode::Unlocked);
    }

    #[test]
    fn try_promote_needs_sole_reader() {
        let lock = RawRwLock::new();
        let r1 = lock.read_lock();
        let r2 = lock.read_lock();
        let r1 = match r1.try_promote() {
            Ok(_) => panic!("promoted while another reader held the lock"),
            Err(r) => r,
        };
        drop(r2);
        let w = r1.try_promote().ok().expect("sole reader should promote");
        assert_eq!(lock.mode(), LockMode::Exclusive);
        drop(w);
    }

    #[test]
    fn typed_lock_guards_data() {
        let lock = RwLock::new(vec![1, 2]);
        lock.write().push(3);
        assert_eq!(lock.read().len(), 3);
        let r = lock.read();
        let mut w = r.promote();
        w.push(4);
        let r = w.downgrade();
        assert_eq!(*r, vec![1, 2, 3, 4]);
    }

    #[test]
    fn try_write_zero_timeout_does_not_block() {
        let lock = RawRwLock::new();
        let r = lock.read_lock();
        assert!(lock.try_write_for(Duration::ZERO).is_none());
        assert_eq!(lock.waiters(), (0, 0, 0));
        drop(r);
        assert!(lock.try_write_for(Duration::ZERO).is_some());
    }
}
