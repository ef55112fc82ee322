//! I/O watchers and the fd-indexed watcher table.
//!
//! A watcher binds a file descriptor to an interest mask and a callback.
//! Watchers live in a table indexed by fd; `nfds` counts the populated
//! slots. Changing a watcher's desired events never talks to the kernel
//! directly: the watcher is put on the registration queue and reconciled
//! at the start of the next poll step, so repeated start/stop sequences
//! collapse into a single kernel call.

use crate::event_loop::EventLoop;
use crate::events::EventMask;
use crate::queue::{LinkStore, QueueId, QueueLink};

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Callback invoked when a watcher's fd is ready (or the watcher was fed
/// to the pending queue). Receives the owning loop, the fd and the
/// delivered event mask.
pub(crate) type IoCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, RawFd, EventMask)>>;

pub(crate) struct Watcher {
    pub(crate) fd: RawFd,

    /// Events currently registered with the kernel.
    pub(crate) events: EventMask,

    /// Desired events, pending reconciliation.
    pub(crate) pevents: EventMask,

    pub(crate) cb: IoCallback,

    links: [QueueLink; 2],
}

impl Watcher {
    fn new(fd: RawFd, cb: IoCallback) -> Watcher {
        Watcher {
            fd,
            events: EventMask::empty(),
            pevents: EventMask::empty(),
            cb,
            links: [QueueLink::new(); 2],
        }
    }

    pub(crate) fn is_linked(&self, queue: QueueId) -> bool {
        self.links[queue as usize].is_linked()
    }
}

/// Dynamic array of watchers indexed by fd.
pub(crate) struct WatcherTable {
    slots: Vec<Option<Watcher>>,

    /// Number of fds currently registered with the loop: populated slots
    /// whose desired events are nonzero.
    pub(crate) nfds: usize,
}

impl WatcherTable {
    pub(crate) fn new() -> WatcherTable {
        WatcherTable {
            slots: Vec::new(),
            nfds: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Grows the table so that `len` slots exist. The new size is
    /// `next_power_of_two(len + 2) - 2`; growth never shrinks and an
    /// allocation failure aborts, as losing the fd mapping would break
    /// every invariant downstream.
    pub(crate) fn maybe_resize(&mut self, len: usize) {
        if len <= self.slots.len() {
            return;
        }
        let n = (len + 2).next_power_of_two() - 2;
        self.slots.resize_with(n, || None);
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&Watcher> {
        self.slots.get(fd as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, fd: RawFd) -> Option<&mut Watcher> {
        self.slots.get_mut(fd as usize)?.as_mut()
    }

    /// Looks up the watcher registered at `fd`, treating inert records
    /// (no desired events) the same as an empty slot.
    pub(crate) fn registered(&self, fd: RawFd) -> Option<&Watcher> {
        self.get(fd).filter(|w| !w.pevents.is_empty())
    }

    fn insert(&mut self, fd: RawFd, cb: IoCallback) -> &mut Watcher {
        let slot = &mut self.slots[fd as usize];
        debug_assert!(slot.is_none());
        slot.insert(Watcher::new(fd, cb))
    }

    fn remove(&mut self, fd: RawFd) -> Option<Watcher> {
        self.slots.get_mut(fd as usize)?.take()
    }

    /// Drops a record that no longer has desired events and sits on no
    /// queue. Records are kept while the pending queue references them so
    /// a fed-then-stopped watcher still runs its deferred callback.
    pub(crate) fn remove_if_inert(&mut self, fd: RawFd) {
        if let Some(w) = self.get(fd) {
            if w.pevents.is_empty()
                && !w.is_linked(QueueId::Watcher)
                && !w.is_linked(QueueId::Pending)
            {
                self.remove(fd);
            }
        }
    }
}

impl LinkStore for WatcherTable {
    fn link(&self, fd: RawFd, queue: QueueId) -> &QueueLink {
        &self.slots[fd as usize].as_ref().unwrap().links[queue as usize]
    }

    fn link_mut(&mut self, fd: RawFd, queue: QueueId) -> &mut QueueLink {
        &mut self.slots[fd as usize].as_mut().unwrap().links[queue as usize]
    }
}

impl EventLoop {
    /// Adds `events` to the interest set of the watcher on `fd`,
    /// creating the watcher with `cb` when none is registered. The
    /// kernel registration happens lazily on the next poll step.
    pub(crate) fn io_start(&mut self, fd: RawFd, events: EventMask, cb: IoCallback) {
        assert!(!events.is_empty());
        assert!(EventMask::STARTABLE.contains(events));
        assert!(fd >= 0);

        self.watchers.maybe_resize(fd as usize + 1);

        let was_registered = self.watchers.registered(fd).is_some();
        if self.watchers.get(fd).is_none() {
            self.watchers.insert(fd, cb);
        } else {
            self.watchers.get_mut(fd).unwrap().cb = cb;
        }

        let w = self.watchers.get_mut(fd).unwrap();
        debug_assert_eq!(w.fd, fd);
        w.pevents |= events;

        if !was_registered {
            self.watchers.nfds += 1;
        }

        let w = self.watchers.get(fd).unwrap();
        // Kernel state already matches; nothing to reconcile.
        if w.events == w.pevents {
            return;
        }

        if !w.is_linked(QueueId::Watcher) {
            self.watcher_queue
                .push_back(&mut self.watchers, QueueId::Watcher, fd, false);
        }
    }

    /// Removes `events` from the watcher's interest set. When no desired
    /// events remain the fd is deregistered from the loop; the kernel
    /// registration is cleaned up lazily by the next dispatch that sees
    /// an event for the now-empty slot.
    pub(crate) fn io_stop(&mut self, fd: RawFd, events: EventMask) {
        assert!(!events.is_empty());
        assert!(EventMask::STARTABLE.contains(events));

        if fd == -1 || fd as usize >= self.watchers.len() {
            return;
        }
        // Stop on a watcher that was never started.
        if self.watchers.get(fd).is_none() {
            return;
        }

        let (was_registered, now_empty) = {
            let w = self.watchers.get_mut(fd).unwrap();
            let was_registered = !w.pevents.is_empty();
            w.pevents &= !events;
            (was_registered, w.pevents.is_empty())
        };

        if now_empty {
            self.watcher_queue
                .unlink(&mut self.watchers, QueueId::Watcher, fd);

            if was_registered {
                debug_assert!(self.watchers.nfds > 0);
                self.watchers.nfds -= 1;
                self.watchers.get_mut(fd).unwrap().events = EventMask::empty();
            }

            self.watchers.remove_if_inert(fd);
        } else if !self.watchers.get(fd).unwrap().is_linked(QueueId::Watcher) {
            self.watcher_queue
                .push_back(&mut self.watchers, QueueId::Watcher, fd, false);
        }
    }

    /// Fully tears down the watcher on `fd`: stops every event, drops any
    /// deferred callback and cancels undelivered events for the fd in the
    /// batch currently being dispatched.
    pub(crate) fn io_close(&mut self, fd: RawFd) {
        self.io_stop(fd, EventMask::STARTABLE);
        debug_assert!(!self.io_active(fd, EventMask::STARTABLE));

        if self.watchers.get(fd).is_some() {
            self.pending_queue
                .unlink(&mut self.watchers, QueueId::Pending, fd);
            self.watchers.remove(fd);
        }

        self.poller.invalidate(fd);
    }

    /// Schedules the watcher's callback to run in the next pending phase,
    /// without consulting the kernel.
    pub(crate) fn io_feed(&mut self, fd: RawFd) {
        let epoch = self.pending_epoch;
        if let Some(w) = self.watchers.get(fd) {
            if !w.is_linked(QueueId::Pending) {
                self.pending_queue
                    .push_back(&mut self.watchers, QueueId::Pending, fd, epoch);
            }
        }
    }

    /// Whether the watcher on `fd` has any of `events` in its interest
    /// set.
    pub(crate) fn io_active(&self, fd: RawFd, events: EventMask) -> bool {
        assert!(!events.is_empty());
        assert!(EventMask::STARTABLE.contains(events));
        self.watchers
            .registered(fd)
            .map_or(false, |w| w.pevents.intersects(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_cb() -> IoCallback {
        Rc::new(RefCell::new(|_: &mut EventLoop, _, _| {}))
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn table_growth_follows_power_of_two_minus_two() {
        let mut table = WatcherTable::new();
        table.maybe_resize(1);
        assert_eq!(table.len(), 2);
        table.maybe_resize(3);
        assert_eq!(table.len(), 6);
        table.maybe_resize(7);
        assert_eq!(table.len(), 14);
        // Never shrinks.
        table.maybe_resize(2);
        assert_eq!(table.len(), 14);
    }

    #[test]
    fn start_then_stop_is_a_no_op() {
        let mut lp = EventLoop::new().unwrap();
        // Flush the loop's own wakeup registration so the queue checks
        // below see only this test's watcher.
        lp.io_poll(0);
        let base = lp.watchers.nfds;
        let (r, w) = pipe();

        lp.io_start(r, EventMask::READABLE, noop_cb());
        assert_eq!(lp.watchers.nfds, base + 1);
        assert!(lp.io_active(r, EventMask::READABLE));
        assert!(!lp.watcher_queue.is_empty());

        lp.io_stop(r, EventMask::READABLE);
        assert_eq!(lp.watchers.nfds, base);
        assert!(lp.watchers.get(r).is_none());
        assert!(lp.watcher_queue.is_empty());

        for fd in [r, w] {
            let _ = crate::fd::close_fd(fd);
        }
    }

    #[test]
    fn coalesced_reconfiguration_registers_once() {
        let mut lp = EventLoop::new().unwrap();
        lp.io_poll(0);
        let base = lp.watchers.nfds;
        let (r, w) = pipe();

        // Watch the write end: a pipe with buffer space is writable, so a
        // zero-timeout poll sees the registration immediately.
        lp.io_start(w, EventMask::READABLE, noop_cb());
        lp.io_start(w, EventMask::READABLE | EventMask::WRITABLE, noop_cb());
        lp.io_start(w, EventMask::WRITABLE, noop_cb());
        lp.io_stop(w, EventMask::READABLE);

        {
            let watcher = lp.watchers.registered(w).unwrap();
            assert_eq!(watcher.pevents, EventMask::WRITABLE);
            assert_eq!(watcher.events, EventMask::empty());
            assert!(watcher.is_linked(QueueId::Watcher));
        }
        assert_eq!(lp.watchers.nfds, base + 1);

        // One poll step reconciles the single queued change.
        lp.io_poll(0);
        let watcher = lp.watchers.registered(w).unwrap();
        assert_eq!(watcher.events, EventMask::WRITABLE);
        assert!(!watcher.is_linked(QueueId::Watcher));

        for fd in [r, w] {
            let _ = crate::fd::close_fd(fd);
        }
    }

    #[test]
    fn partial_stop_keeps_registration() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();

        lp.io_start(r, EventMask::READABLE | EventMask::DISCONNECT, noop_cb());
        lp.io_poll(0);
        lp.io_stop(r, EventMask::DISCONNECT);

        let watcher = lp.watchers.registered(r).unwrap();
        assert_eq!(watcher.pevents, EventMask::READABLE);
        // Dirty again: desired differs from registered.
        assert!(watcher.is_linked(QueueId::Watcher));

        for fd in [r, w] {
            let _ = crate::fd::close_fd(fd);
        }
    }
}
