//! Timers.
//!
//! Timers live in a min-heap ordered by deadline, with arming order
//! breaking ties. Stopping a timer flips a cancellation flag shared with
//! its heap entry instead of digging it out of the heap; cancelled
//! entries are purged when they surface.

use crate::event_loop::EventLoop;
use crate::handle::{inval, Handle, HandleId, HandleKind};

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::io;
use std::rc::Rc;

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, TimerHandle)>>;

/// A timer handle. Fires its callback once its deadline passes, and
/// periodically after that when a repeat interval is set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(pub(crate) HandleId);

impl From<TimerHandle> for HandleId {
    fn from(handle: TimerHandle) -> HandleId {
        handle.0
    }
}

pub(crate) struct TimerState {
    cb: Option<TimerCallback>,
    repeat: u64,
    due: u64,

    /// Cancellation flag shared with the live heap entry, present while
    /// the timer is armed.
    armed: Option<Rc<Cell<bool>>>,
}

impl TimerState {
    pub(crate) fn new() -> TimerState {
        TimerState {
            cb: None,
            repeat: 0,
            due: 0,
            armed: None,
        }
    }
}

/// An entry in the loop's timer heap.
pub(crate) struct TimerEntry {
    due: u64,

    /// Arming order. Ensures timers with equal deadlines fire in the
    /// order they were started.
    seq: u64,

    id: HandleId,
    cancelled: Rc<Cell<bool>>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Ord for TimerEntry {
    /// Reversed so that `BinaryHeap<TimerEntry>` behaves as a min-heap:
    /// the earliest deadline surfaces first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl EventLoop {
    /// Creates an unarmed timer handle.
    pub fn new_timer(&mut self) -> TimerHandle {
        TimerHandle(self.add_handle(HandleKind::Timer(TimerState::new())))
    }

    /// Arms the timer to fire `timeout` milliseconds from now. A nonzero
    /// `repeat` re-arms it with that interval after each firing. An
    /// already armed timer is restarted.
    pub fn timer_start<F>(
        &mut self,
        handle: TimerHandle,
        timeout: u64,
        repeat: u64,
        cb: F,
    ) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, TimerHandle) + 'static,
    {
        let id = handle.0;
        self.timer_state_mut(id)?;
        if self.is_closing(id) {
            return Err(inval());
        }
        if self.is_active(id) {
            self.timer_stop_internal(id);
        }

        let cb: TimerCallback = Rc::new(RefCell::new(cb));
        {
            let state = self.timer_state_mut(id)?;
            state.cb = Some(cb);
            state.repeat = repeat;
        }
        self.timer_arm(id, timeout);
        Ok(())
    }

    /// Disarms the timer. The callback is kept for [`timer_again`].
    ///
    /// [`timer_again`]: EventLoop::timer_again
    pub fn timer_stop(&mut self, handle: TimerHandle) -> io::Result<()> {
        self.timer_state_mut(handle.0)?;
        self.timer_stop_internal(handle.0);
        Ok(())
    }

    /// Restarts a repeating timer from its repeat interval. Fails when
    /// the timer has never been started.
    pub fn timer_again(&mut self, handle: TimerHandle) -> io::Result<()> {
        let id = handle.0;
        let (has_cb, repeat) = {
            let state = self.timer_state_mut(id)?;
            (state.cb.is_some(), state.repeat)
        };
        if !has_cb {
            return Err(inval());
        }
        if repeat != 0 {
            self.timer_stop_internal(id);
            self.timer_arm(id, repeat);
        }
        Ok(())
    }

    /// Updates the repeat interval. Takes effect the next time the timer
    /// fires or is restarted.
    pub fn timer_set_repeat(&mut self, handle: TimerHandle, repeat: u64) -> io::Result<()> {
        self.timer_state_mut(handle.0)?.repeat = repeat;
        Ok(())
    }

    pub fn timer_repeat(&self, handle: TimerHandle) -> io::Result<u64> {
        Ok(self.timer_state(handle.0)?.repeat)
    }

    /// Milliseconds until the timer fires, zero when overdue or unarmed.
    pub fn timer_due_in(&self, handle: TimerHandle) -> io::Result<u64> {
        let state = self.timer_state(handle.0)?;
        if state.armed.is_none() {
            return Ok(0);
        }
        Ok(state.due.saturating_sub(self.time))
    }

    pub(crate) fn timer_close(&mut self, id: HandleId) {
        self.timer_stop_internal(id);
    }

    fn timer_stop_internal(&mut self, id: HandleId) {
        if let Ok(state) = self.timer_state_mut(id) {
            if let Some(flag) = state.armed.take() {
                flag.set(true);
            }
        }
        self.handle_stop(id);
    }

    fn timer_arm(&mut self, id: HandleId, timeout: u64) {
        // Saturate instead of wrapping: a deadline past the end of the
        // clock means "effectively never".
        let due = self.time.checked_add(timeout).unwrap_or(u64::MAX);
        let cancelled = Rc::new(Cell::new(false));
        self.timer_seq += 1;
        let seq = self.timer_seq;

        {
            let state = self.timer_state_mut(id).expect("arming a non-timer");
            state.due = due;
            state.armed = Some(cancelled.clone());
        }

        self.timers.push(TimerEntry {
            due,
            seq,
            id,
            cancelled,
        });
        self.handle_start(id);
    }

    /// Fires every timer whose deadline has passed, re-arming repeating
    /// ones before their callback runs.
    pub(crate) fn run_timers(&mut self) {
        loop {
            let (due, cancelled) = match self.timers.peek() {
                None => break,
                Some(top) => (top.due, top.cancelled.get()),
            };
            if cancelled {
                self.timers.pop();
                continue;
            }
            if due > self.time {
                break;
            }

            let entry = self.timers.pop().unwrap();
            let id = entry.id;

            if let Ok(state) = self.timer_state_mut(id) {
                state.armed = None;
            }
            self.handle_stop(id);

            let (repeat, cb) = match self.timer_state(id) {
                Ok(state) => (state.repeat, state.cb.clone()),
                Err(_) => continue,
            };
            if repeat != 0 {
                self.timer_arm(id, repeat);
            }
            if let Some(cb) = cb {
                (&mut *cb.borrow_mut())(self, TimerHandle(id));
            }
        }
    }

    /// Milliseconds until the next live timer fires: 0 when one is
    /// already due, -1 when none exist.
    pub(crate) fn next_timer_timeout(&mut self) -> i32 {
        loop {
            let (due, cancelled) = match self.timers.peek() {
                None => return -1,
                Some(top) => (top.due, top.cancelled.get()),
            };
            if cancelled {
                self.timers.pop();
                continue;
            }
            if due <= self.time {
                return 0;
            }
            return (due - self.time).min(i32::MAX as u64) as i32;
        }
    }

    fn timer_state(&self, id: HandleId) -> io::Result<&TimerState> {
        match self.handles.get(id) {
            Some(Handle {
                kind: HandleKind::Timer(state),
                ..
            }) => Ok(state),
            _ => Err(inval()),
        }
    }

    fn timer_state_mut(&mut self, id: HandleId) -> io::Result<&mut TimerState> {
        match self.handles.get_mut(id) {
            Some(Handle {
                kind: HandleKind::Timer(state),
                ..
            }) => Ok(state),
            _ => Err(inval()),
        }
    }
}
