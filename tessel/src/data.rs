//! # Data handles
//!
//! A `Handle` wraps one piece of data shared by the workers of a task region, in practice one
//! tile. It is the only synchronization point between tasks: there is no task graph and no
//! master thread. Every worker walks the same program and numbers tasks in the same order, so
//! each worker can keep its own record of the reads and writes declared so far on a handle and
//! compare it with the shared record of the reads and writes actually executed.
//!
//! The `Handle` object has the following structure:
//! - local:  this worker's view of the declared accesses (last declared write, reads declared
//!           since that write).
//! - shared: state common to every clone of the handle:
//!   + data:    the wrapped value.
//!   + condvar: wakes workers blocked on an access.
//!   + inner:   the executed accesses, behind a lock.
//!
//! A write may start once every earlier read and write has executed, a read once every earlier
//! write has executed. Two tasks writing the same tile are therefore executed in program order,
//! whichever worker they are mapped to.
//!
//! Outside of a task region a handle can be borrowed through `lock`, which holds the shared lock
//! for the lifetime of the guard.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::drop;
use std::ops::{Deref, DerefMut, Drop};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

// ————————————————————————————————— Handle ————————————————————————————————— //

/// Position of a task in program order, starting at 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

pub struct Handle<T> {
    local: LocalState,
    shared: Arc<SharedState<T>>,
}

#[derive(Clone, Default)]
struct LocalState {
    last_declared_write: usize,
    reads_since_write: usize,
    // Set when an access was declared but not executed by this worker since its last own access.
    stale: bool,
}

struct SharedState<T> {
    inner: Mutex<ExecutedState>,
    condvar: Condvar,
    data: UnsafeCell<T>,
}

#[derive(Default)]
struct ExecutedState {
    last_executed_write: usize,
    reads_since_write: usize,
    waiting: usize,
}

// Safety: accesses to `data` are ordered by the declared/executed bookkeeping, or happen while
// holding `inner`.
unsafe impl<T: Send + Sync> Sync for SharedState<T> {}

fn recover<G>(result: Result<G, PoisonError<G>>) -> G {
    // A panicking task aborts the whole region, the bookkeeping itself is never left half
    // updated.
    result.unwrap_or_else(PoisonError::into_inner)
}

impl<T> Handle<T> {
    pub fn new(data: T) -> Self {
        let shared = Arc::new(SharedState {
            inner: Mutex::new(ExecutedState::default()),
            condvar: Condvar::new(),
            data: UnsafeCell::new(data),
        });
        Self {
            local: LocalState::default(),
            shared,
        }
    }

    /// Whether two handles wrap the same data.
    pub fn same_data(&self, other: &Handle<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn write_is_ready(&self, inner: &ExecutedState) -> bool {
        inner.reads_since_write == self.local.reads_since_write
            && inner.last_executed_write == self.local.last_declared_write
    }

    fn read_is_ready(&self, inner: &ExecutedState) -> bool {
        inner.last_executed_write == self.local.last_declared_write
    }

    fn wait_until(&self, ready: impl Fn(&Self, &ExecutedState) -> bool) {
        let mut inner = recover(self.shared.inner.lock());
        if ready(self, &inner) {
            return;
        }
        inner.waiting += 1;
        loop {
            inner = recover(self.shared.condvar.wait(inner));
            if ready(self, &inner) {
                inner.waiting -= 1;
                drop(inner);
                return;
            }
        }
    }

    /// Declare a read executed by another worker.
    ///
    /// # Safety
    ///
    /// Every worker must declare every task touching this handle exactly once, in program order.
    /// Use the `task!` macro rather than calling this directly.
    pub unsafe fn declare_read(&mut self) {
        self.local.reads_since_write += 1;
        self.local.stale = true;
    }

    /// Declare a write executed by another worker.
    ///
    /// # Safety
    ///
    /// Same contract as `declare_read`.
    pub unsafe fn declare_write(&mut self, task_id: TaskId) {
        self.local.last_declared_write = task_id.0;
        self.local.reads_since_write = 0;
        self.local.stale = true;
    }

    /// Read access for the current task, blocks until every earlier write has executed.
    ///
    /// # Safety
    ///
    /// Sound only if all workers declare their tasks consistently, see `declare_read`.
    pub unsafe fn get_read(&mut self) -> Ref<'_, T> {
        // Nothing happened on this handle since our own last access.
        if !self.local.stale {
            return Ref(self);
        }
        self.wait_until(Self::read_is_ready);
        Ref(self)
    }

    /// Read-write access for the current task, blocks until every earlier read and write has
    /// executed.
    ///
    /// # Safety
    ///
    /// Sound only if all workers declare their tasks consistently, see `declare_write`.
    pub unsafe fn get_write(&mut self, task_id: TaskId) -> RefMut<'_, T> {
        self.wait_until(Self::write_is_ready);
        RefMut(self, task_id)
    }

    unsafe fn terminate_read(&mut self) {
        self.declare_read();
        self.local.stale = false;
        let mut inner = recover(self.shared.inner.lock());
        inner.reads_since_write += 1;
        if inner.waiting > 0 {
            self.shared.condvar.notify_all();
        }
    }

    unsafe fn terminate_write(&mut self, task_id: TaskId) {
        self.declare_write(task_id);
        self.local.stale = false;
        let mut inner = recover(self.shared.inner.lock());
        inner.last_executed_write = task_id.0;
        inner.reads_since_write = 0;
        if inner.waiting > 0 {
            self.shared.condvar.notify_all();
        }
    }

    /// Reset the bookkeeping so that task numbering can start over.
    ///
    /// # Safety
    ///
    /// No task region touching this data may be in flight.
    pub unsafe fn fence(&mut self) {
        self.local = LocalState::default();
        *recover(self.shared.inner.lock()) = ExecutedState::default();
    }

    /// Exclusive access outside of a task region.
    ///
    /// Clones of the handle (including the ones held by aliasing matrix views) are excluded for
    /// the lifetime of the guard. Must not be used by a task body.
    pub fn lock(&self) -> Guard<'_, T> {
        Guard {
            _lock: recover(self.shared.inner.lock()),
            data: &self.shared.data,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Default> Default for Handle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("last_declared_write", &self.local.last_declared_write)
            .field("reads_since_write", &self.local.reads_since_write)
            .finish()
    }
}

// ————————————————————————————————— Fence —————————————————————————————————— //

/// Values carrying handles that a task region works on.
///
/// `run_tasks` fences its arguments before spawning workers, the previous region being joined.
pub trait Fence {
    /// # Safety
    ///
    /// See `Handle::fence`.
    unsafe fn fence(&mut self);
}

impl<T> Fence for Handle<T> {
    unsafe fn fence(&mut self) {
        Handle::fence(self)
    }
}

impl<A: Fence, B: Fence> Fence for (A, B) {
    unsafe fn fence(&mut self) {
        self.0.fence();
        self.1.fence();
    }
}

// ————————————————————————————— Smart Pointers ————————————————————————————— //

/// Read access held by a task, the read is marked executed on drop.
pub struct Ref<'data, T>(&'data mut Handle<T>);

/// Read-write access held by a task, the write is marked executed on drop.
pub struct RefMut<'data, T>(&'data mut Handle<T>, TaskId);

/// Exclusive access outside of task regions.
pub struct Guard<'data, T> {
    _lock: MutexGuard<'data, ExecutedState>,
    data: &'data UnsafeCell<T>,
}

impl<'data, T> Deref for Ref<'data, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0.shared.data.get() }
    }
}

impl<'data, T> Deref for RefMut<'data, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0.shared.data.get() }
    }
}

impl<'data, T> DerefMut for RefMut<'data, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0.shared.data.get() }
    }
}

impl<'data, T> Deref for Guard<'data, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the shared lock is held.
        unsafe { &*self.data.get() }
    }
}

impl<'data, T> DerefMut for Guard<'data, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the shared lock is held.
        unsafe { &mut *self.data.get() }
    }
}

impl<'data, T> Drop for Ref<'data, T> {
    fn drop(&mut self) {
        // Safety: the destructor runs once.
        unsafe { self.0.terminate_read() }
    }
}

impl<'data, T> Drop for RefMut<'data, T> {
    fn drop(&mut self) {
        // Safety: the destructor runs once.
        unsafe { self.0.terminate_write(self.1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_sees_writes_through_clones() {
        let a = Handle::new(1);
        let b = a.clone();
        *b.lock() += 41;
        assert_eq!(*a.lock(), 42);
        assert!(a.same_data(&b));
    }

    #[test]
    fn fence_resets_numbering() {
        let mut a = Handle::new(0_u8);
        let mut stale_clone = a.clone();
        unsafe {
            *a.get_write(TaskId(1)) = 3;
            // Without the fence the clone would wait for a task 1 it never declared.
            stale_clone.fence();
            *stale_clone.get_write(TaskId(1)) += 1;
        }
        assert_eq!(*a.lock(), 4);
    }
}
