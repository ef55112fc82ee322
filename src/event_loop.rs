//! The event loop driver.
//!
//! One `EventLoop` owns the kernel poller, the watcher table, every
//! handle and all the queues between them, and is driven from a single
//! thread. Each iteration of [`EventLoop::run`] walks a fixed sequence
//! of phases:
//!
//! 1. refresh the loop time
//! 2. fire due timers
//! 3. run pending watcher callbacks
//! 4. run idle handles
//! 5. run prepare handles
//! 6. block for I/O (with a timeout derived from loop state)
//! 7. run check handles
//! 8. finalize closing handles
//!
//! Liveness is the loop's exit condition: it keeps iterating while any
//! referenced handle is active, a request is in flight or a close awaits
//! finalization.

use crate::clock::{hrtime, ClockType};
use crate::events::EventMask;
use crate::fd;
use crate::handle::{inval, HandleFlags, HandleId, HandleKind, HandleTable};
use crate::queue::{IndexQueue, LinkStore, QueueId};
use crate::reactor::poller::Poller;
use crate::reactor::watcher::WatcherTable;
use crate::timer::TimerEntry;

use std::collections::BinaryHeap;
use std::io;
use std::os::fd::RawFd;

/// How [`EventLoop::run`] drives the loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunMode {
    /// Iterate until the loop has nothing left to do or is stopped.
    Default,
    /// One iteration, blocking for I/O. Guarantees forward progress: at
    /// least one callback has run when it returns, timers included.
    Once,
    /// One iteration without blocking.
    NoWait,
}

/// Loop-wide options for [`EventLoop::configure`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopOption {
    /// Block the given signal for the duration of the kernel wait.
    /// Only `SIGPROF` is supported, for profilers that would otherwise
    /// interrupt every poll.
    BlockSignal(i32),
}

pub struct EventLoop {
    /// Loop time in monotonic milliseconds, refreshed at phase
    /// boundaries. Never decreases.
    pub(crate) time: u64,

    pub(crate) poller: Poller,

    pub(crate) watchers: WatcherTable,

    /// Watchers whose desired events differ from their kernel
    /// registration, reconciled by the next poll step.
    pub(crate) watcher_queue: IndexQueue,

    /// Watchers whose callbacks run before the next kernel wait.
    pub(crate) pending_queue: IndexQueue,
    pub(crate) pending_epoch: bool,

    pub(crate) handles: HandleTable,

    /// Head of the closing list, handles awaiting finalization.
    pub(crate) closing: Option<HandleId>,

    pub(crate) idle_handles: Vec<HandleId>,
    pub(crate) prepare_handles: Vec<HandleId>,
    pub(crate) check_handles: Vec<HandleId>,

    pub(crate) timers: BinaryHeap<TimerEntry>,
    pub(crate) timer_seq: u64,

    pub(crate) active_handles: u32,
    pub(crate) active_reqs: u32,

    pub(crate) stop_flag: bool,
    pub(crate) block_sigprof: bool,

    /// Fd of the designated signal watcher, -1 when none. Its callback
    /// runs last in a dispatch and ends the poll step.
    pub(crate) signal_fd: RawFd,
}

impl EventLoop {
    /// Creates a loop with a fresh kernel poller (close-on-exec) and the
    /// current monotonic time.
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        let mut lp = EventLoop {
            time: 0,
            poller,
            watchers: WatcherTable::new(),
            watcher_queue: IndexQueue::new(),
            pending_queue: IndexQueue::new(),
            pending_epoch: false,
            handles: HandleTable::new(),
            closing: None,
            idle_handles: Vec::new(),
            prepare_handles: Vec::new(),
            check_handles: Vec::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            active_handles: 0,
            active_reqs: 0,
            stop_flag: false,
            block_sigprof: false,
            signal_fd: -1,
        };
        lp.update_time();

        // A loop with no fds would return from the kernel wait
        // immediately and spin on timer deadlines. The internal wakeup
        // handle keeps one fd registered at all times; it is also the
        // rendezvous point for cross-thread work completion.
        let wakeup = lp.new_async(|_, _| {})?;
        let id: HandleId = wakeup.into();
        if let Some(handle) = lp.handles.get_mut(id) {
            handle.flags |= HandleFlags::INTERNAL;
        }
        lp.unref_handle(wakeup);

        Ok(lp)
    }

    /// Drives the loop. Returns whether it is still alive, i.e. whether
    /// another `run` would have work to wait for.
    pub fn run(&mut self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag {
            self.update_time();
            self.run_timers();
            let ran_pending = self.run_pending();
            self.run_idle();
            self.run_prepare();

            let mut timeout = 0;
            if (mode == RunMode::Once && !ran_pending) || mode == RunMode::Default {
                timeout = self.backend_timeout();
            }

            self.io_poll(timeout);
            self.run_check();
            self.run_closing_handles();

            if mode == RunMode::Once {
                // The poll can return on timeout expiry without invoking
                // anything; the timers that produced that timeout are
                // the forward progress this mode promises.
                self.update_time();
                self.run_timers();
            }

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }

        if self.stop_flag {
            self.stop_flag = false;
        }

        alive
    }

    /// Makes the current `run` return once it reaches the end of its
    /// iteration.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// Whether the loop has work: active referenced handles, in-flight
    /// requests or handles awaiting close finalization.
    pub fn alive(&self) -> bool {
        self.active_handles > 0 || self.active_reqs > 0 || self.closing.is_some()
    }

    /// The loop's notion of "now", in monotonic milliseconds. Cached;
    /// refreshed at phase boundaries or via [`update_time`].
    ///
    /// [`update_time`]: EventLoop::update_time
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Refreshes the cached loop time.
    pub fn update_time(&mut self) {
        let now = hrtime(ClockType::Fast) / 1_000_000;
        debug_assert!(now >= self.time);
        self.time = now;
    }

    /// The kernel poller's file descriptor.
    pub fn backend_fd(&self) -> RawFd {
        self.poller.fd()
    }

    /// The timeout the next kernel wait would use: 0 when any
    /// immediately runnable work exists, -1 to wait forever, otherwise
    /// milliseconds until the next timer.
    pub fn backend_timeout(&mut self) -> i32 {
        if self.stop_flag {
            return 0;
        }
        if self.active_handles == 0 && self.active_reqs == 0 {
            return 0;
        }
        if !self.idle_handles.is_empty() {
            return 0;
        }
        if !self.pending_queue.is_empty() {
            return 0;
        }
        if self.closing.is_some() {
            return 0;
        }
        self.next_timer_timeout()
    }

    /// Probes whether the kernel poller accepts `fd`.
    pub fn check_fd(&self, fd: RawFd) -> io::Result<()> {
        self.poller.check_fd(fd)
    }

    pub fn configure(&mut self, option: LoopOption) -> io::Result<()> {
        match option {
            LoopOption::BlockSignal(signum) => {
                if signum != libc::SIGPROF {
                    return Err(inval());
                }
                self.block_sigprof = true;
                Ok(())
            }
        }
    }

    /// Re-establishes loop state in a forked child.
    ///
    /// The child inherits the parent's epoll state, which is unusable:
    /// the poller is rebuilt, every watcher's kernel registration is
    /// reset and those with desired events are queued for
    /// re-registration on the next poll.
    pub fn fork(&mut self) -> io::Result<()> {
        self.poller = Poller::new()?;

        for fd in 0..self.watchers.len() as RawFd {
            let Some(w) = self.watchers.get_mut(fd) else {
                continue;
            };
            if w.pevents.is_empty() {
                continue;
            }
            w.events = EventMask::empty();
            if !w.is_linked(QueueId::Watcher) {
                self.watcher_queue
                    .push_back(&mut self.watchers, QueueId::Watcher, fd, false);
            }
        }

        Ok(())
    }

    /// Counts an in-flight request toward loop liveness. Request-shaped
    /// collaborators (name resolution, file operations) call this when
    /// work starts.
    pub fn register_request(&mut self) {
        self.active_reqs += 1;
    }

    /// Drops a request from the liveness count.
    pub fn unregister_request(&mut self) {
        debug_assert!(self.active_reqs > 0);
        self.active_reqs = self.active_reqs.saturating_sub(1);
    }

    /// Designates `fd` as the loop's signal multiplexer: the watcher on
    /// it is dispatched last within a poll batch and terminates the
    /// dispatch, so signal-driven work observes every other state change
    /// of the iteration. Pass -1 to clear.
    pub fn set_signal_watcher(&mut self, fd: RawFd) {
        self.signal_fd = fd;
    }

    /// Drains the pending queue, invoking each watcher's callback with
    /// the writable mask. Watchers fed during the drain wait for the
    /// next iteration. Returns whether any callback ran.
    pub(crate) fn run_pending(&mut self) -> bool {
        let old = self.pending_epoch;
        self.pending_epoch = !old;

        let mut ran = false;
        loop {
            let Some(fd) = self.pending_queue.head() else {
                break;
            };
            // Fed during this drain; runs no earlier than next iteration.
            if self.watchers.link(fd, QueueId::Pending).epoch != old {
                break;
            }
            self.pending_queue
                .unlink(&mut self.watchers, QueueId::Pending, fd);

            let cb = self
                .watchers
                .get(fd)
                .expect("pending watcher has no record")
                .cb
                .clone();
            ran = true;
            (&mut *cb.borrow_mut())(self, fd, EventMask::WRITABLE);

            self.watchers.remove_if_inert(fd);
        }
        ran
    }
}


impl Drop for EventLoop {
    fn drop(&mut self) {
        // The backend fd closes with the poller; eventfds of async
        // handles are loop-owned and must not leak past it.
        let fds: Vec<RawFd> = self
            .handles
            .iter()
            .filter_map(|handle| match &handle.kind {
                HandleKind::Async(state) if state.fd >= 0 => Some(state.fd),
                _ => None,
            })
            .collect();
        for efd in fds {
            let _ = fd::close_fd(efd);
        }
    }
}
