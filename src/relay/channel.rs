// Bounded thread-safe FIFO channel with timed and interruptible operations

use crate::relay::error::Interrupted;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    interrupted: bool,
}

/// Mailbox for exchanging items between threads.
///
/// A capacity of `0` creates an unbounded channel. Producers block while a
/// bounded channel is full and consumers block while it is empty.
///
/// [`Channel::interrupt`] wakes every blocked thread. The channel then stays
/// interrupted until the next [`Channel::offer`] (or [`Channel::offer_timeout`])
/// clears the flag; consuming does not clear it.
pub struct Channel<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    // Mirrors `items.len()` for the lock-free empty check of zero-timeout takes
    len: AtomicUsize,
    capacity: usize,
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` items (`0` = unbounded)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Create a channel that grows as needed
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Maximum number of items, `0` when unbounded
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the channel holds no items
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether the channel has been interrupted and not offered to since
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Wake every thread blocked on the channel.
    ///
    /// Blocked `take`/`offer` calls fail with [`Interrupted`]; timed calls
    /// return without transferring.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and return the oldest item, blocking until one is available.
    pub fn take(&self) -> Result<T, Interrupted> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.pop(&mut state) {
                return Ok(item);
            }
            if state.interrupted {
                return Err(Interrupted);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Remove and return the oldest item, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or interruption. A zero timeout on an empty
    /// channel returns immediately without locking.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        if timeout.is_zero() && self.len.load(Ordering::Acquire) == 0 {
            return None;
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.pop(&mut state) {
                return Some(item);
            }
            if state.interrupted {
                return None;
            }
            if wait_deadline(&self.not_empty, &mut state, deadline) {
                return if state.interrupted {
                    None
                } else {
                    self.pop(&mut state)
                };
            }
        }
    }

    /// Like [`Channel::take_timeout`] but yields `fallback` instead of `None`
    pub fn take_or(&self, timeout: Duration, fallback: T) -> T {
        self.take_timeout(timeout).unwrap_or(fallback)
    }

    /// Append an item, blocking while the channel is full.
    ///
    /// Clears the interrupted flag before waiting.
    pub fn offer(&self, item: T) -> Result<(), Interrupted> {
        let mut state = self.state.lock();
        state.interrupted = false;
        loop {
            if self.has_room(&state) {
                self.push(&mut state, item);
                return Ok(());
            }
            if state.interrupted {
                return Err(Interrupted);
            }
            self.not_full.wait(&mut state);
        }
    }

    /// Append an item, waiting up to `timeout` for room.
    ///
    /// Returns `false` on timeout or interruption; a zero timeout never
    /// blocks. Clears the interrupted flag before waiting.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        state.interrupted = false;
        loop {
            if self.has_room(&state) {
                self.push(&mut state, item);
                return true;
            }
            if state.interrupted {
                return false;
            }
            if wait_deadline(&self.not_full, &mut state, deadline) {
                if !state.interrupted && self.has_room(&state) {
                    self.push(&mut state, item);
                    return true;
                }
                return false;
            }
        }
    }

    fn has_room(&self, state: &State<T>) -> bool {
        self.capacity == 0 || state.items.len() < self.capacity
    }

    fn push(&self, state: &mut MutexGuard<'_, State<T>>, item: T) {
        state.items.push_back(item);
        self.len.store(state.items.len(), Ordering::Release);
        self.not_empty.notify_one();
    }

    fn pop(&self, state: &mut MutexGuard<'_, State<T>>) -> Option<T> {
        let item = state.items.pop_front()?;
        self.len.store(state.items.len(), Ordering::Release);
        self.not_full.notify_one();
        Some(item)
    }
}

impl<T: Clone> Channel<T> {
    /// Return a copy of the oldest item without removing it, waiting up to
    /// `timeout` for one to arrive.
    pub fn peek_timeout(&self, timeout: Duration) -> Option<T> {
        if timeout.is_zero() && self.len.load(Ordering::Acquire) == 0 {
            return None;
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.front() {
                return Some(item.clone());
            }
            if state.interrupted {
                return None;
            }
            if wait_deadline(&self.not_empty, &mut state, deadline) {
                return state.items.front().cloned();
            }
        }
    }
}

/// Wait on `cond` until notified or `deadline` passes. A `None` deadline
/// (a timeout too large to represent) waits until notified. Returns whether
/// the wait timed out.
pub(crate) fn wait_deadline<S>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, S>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => cond.wait_until(guard, deadline).timed_out(),
        None => {
            cond.wait(guard);
            false
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
