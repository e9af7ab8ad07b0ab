use crate::{
    sync::{AtomicU64, Condvar, Mutex, Ordering, lock, wait},
    types::ObjectId,
};
use std::collections::VecDeque;
use thiserror::Error;

/// A payload tagged with the run that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tagged<T> {
    /// The run the payload belongs to.
    pub object_id: ObjectId,
    /// The payload itself.
    pub payload: T,
}

impl<T> Tagged<T> {
    /// Tag `payload` with `object_id`.
    pub fn new(object_id: ObjectId, payload: T) -> Self {
        Self { object_id, payload }
    }

    /// Transform the payload, keeping the tag.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Tagged<U> {
        Tagged {
            object_id: self.object_id,
            payload: f(self.payload),
        }
    }
}

/// Reason a push was refused. The rejected value is handed back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError<T> {
    /// Every slot holds unread data.
    #[error("buffer pool is full")]
    Full(T),
    /// The pool has been closed.
    #[error("buffer pool is closed")]
    Closed(T),
    /// The pool has no slots at all, e.g. it belongs to a graph that was never
    /// frozen.
    #[error("buffer pool has no slots")]
    ZeroCapacity(T),
}

impl<T> PoolError<T> {
    /// The value that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) | Self::ZeroCapacity(value) => value,
        }
    }
}

/// A fixed-capacity set of reusable payload slots.
///
/// At any instant every slot is either free (writable) or full (readable).
/// Full slots form a FIFO queue. A producer blocks in [`push`](Self::push)
/// while no slot is free, a consumer blocks in [`pop`](Self::pop) while no
/// slot is full. Slots are allocated once, so steady-state execution does not
/// allocate.
#[derive(Debug)]
pub struct BufferPool<T> {
    state: Mutex<PoolState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    starved: AtomicU64,
}

#[derive(Debug)]
struct PoolState<T> {
    slots: Box<[Option<Tagged<T>>]>,
    free: Vec<usize>,
    full: VecDeque<usize>,
    closed: bool,
}

impl<T> BufferPool<T> {
    /// Create a pool with `capacity` slots, all free.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: (0..capacity).map(|_| None).collect(),
                // Reversed so that slot 0 is handed out first.
                free: (0..capacity).rev().collect(),
                full: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            starved: AtomicU64::new(0),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        lock(&self.state).slots.len()
    }

    /// Number of slots holding unread data.
    pub fn num_full(&self) -> usize {
        lock(&self.state).full.len()
    }

    /// Number of writable slots.
    pub fn num_free(&self) -> usize {
        lock(&self.state).free.len()
    }

    /// How many times a producer had to wait for a free slot.
    pub fn starved(&self) -> u64 {
        self.starved.load(Ordering::Relaxed)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Store `value` in a free slot, waiting for one if necessary.
    ///
    /// # Errors
    /// If the pool is closed (also while waiting) or has no slots.
    pub fn push(&self, value: Tagged<T>) -> Result<(), PoolError<Tagged<T>>> {
        let mut state = lock(&self.state);
        if state.slots.is_empty() {
            return Err(PoolError::ZeroCapacity(value));
        }
        if state.free.is_empty() && !state.closed {
            self.starved.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(object_id = value.object_id, "buffer pool starved, waiting");
            while state.free.is_empty() && !state.closed {
                state = wait(&self.not_full, state);
            }
        }
        if state.closed {
            return Err(PoolError::Closed(value));
        }
        state.fill(value);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Store `value` in a free slot without waiting.
    ///
    /// # Errors
    /// If no slot is free, the pool is closed or has no slots.
    pub fn try_push(&self, value: Tagged<T>) -> Result<(), PoolError<Tagged<T>>> {
        let mut state = lock(&self.state);
        if state.slots.is_empty() {
            return Err(PoolError::ZeroCapacity(value));
        }
        if state.closed {
            return Err(PoolError::Closed(value));
        }
        if state.free.is_empty() {
            return Err(PoolError::Full(value));
        }
        state.fill(value);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest full slot, waiting for one if necessary.
    ///
    /// Returns `None` once the pool is closed and drained.
    pub fn pop(&self) -> Option<Tagged<T>> {
        let mut state = lock(&self.state);
        loop {
            if let Some(idx) = state.full.pop_front() {
                let value = state.drain(idx);
                drop(state);
                self.not_full.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            state = wait(&self.not_empty, state);
        }
    }

    /// Take the oldest full slot without waiting.
    pub fn try_pop(&self) -> Option<Tagged<T>> {
        let mut state = lock(&self.state);
        let idx = state.full.pop_front()?;
        let value = state.drain(idx);
        drop(state);
        self.not_full.notify_one();
        Some(value)
    }

    /// Take the oldest full slot tagged with `object_id` without waiting.
    ///
    /// Runs may complete out of order, so a consumer working on one run must
    /// not pick up data produced for another.
    pub fn take_tagged(&self, object_id: ObjectId) -> Option<Tagged<T>> {
        let mut state = lock(&self.state);
        let pos = state.full.iter().position(|&idx| {
            state.slots[idx]
                .as_ref()
                .is_some_and(|slot| slot.object_id == object_id)
        })?;
        let idx = state
            .full
            .remove(pos)
            .expect("BufferPool::take_tagged: [1]");
        let value = state.drain(idx);
        drop(state);
        self.not_full.notify_one();
        Some(value)
    }

    /// Refuse further pushes and wake every waiter.
    ///
    /// Data already stored can still be popped.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl<T> PoolState<T> {
    fn fill(&mut self, value: Tagged<T>) {
        let idx = self.free.pop().expect("PoolState::fill: [1]");
        let slot = &mut self.slots[idx];
        assert!(slot.is_none(), "PoolState::fill: [2]");
        *slot = Some(value);
        self.full.push_back(idx);
    }

    fn drain(&mut self, idx: usize) -> Tagged<T> {
        let value = self.slots[idx].take().expect("PoolState::drain: [1]");
        self.free.push(idx);
        value
    }
}
