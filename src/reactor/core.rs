//! The I/O poll step.
//!
//! One call reconciles every queued watcher with the kernel, blocks for
//! readiness, and dispatches the returned batch to watcher callbacks.
//! Callbacks run synchronously and may reconfigure or tear down any
//! watcher, including ones with undelivered events in the same batch.

use crate::event_loop::EventLoop;
use crate::events::{EventMask, INVALID_TOKEN};
use crate::queue::QueueId;
use crate::reactor::poller::EVENT_BATCH;

use std::io;
use std::mem;
use std::os::fd::RawFd;

/// Kernels before 2.6.37 truncate timeouts larger than roughly 30
/// minutes on 32-bit architectures, turning them effectively infinite.
/// The constant assumes CONFIG_HZ=1200, the largest value seen in the
/// wild; the wait is capped and re-issued with the remainder.
const MAX_SAFE_TIMEOUT: i32 = 1_789_569;

/// How many times a single poll step may re-poll with a zero timeout to
/// drain a saturated batch before handing control back to the loop.
const REPOLL_BUDGET: u32 = 48;

impl EventLoop {
    /// Flushes the registration queue, waits for up to `timeout`
    /// milliseconds (-1 blocks indefinitely) and dispatches ready
    /// events.
    pub(crate) fn io_poll(&mut self, mut timeout: i32) {
        if self.watchers.nfds == 0 {
            debug_assert!(self.watcher_queue.is_empty());
            return;
        }

        // Reconcile: one kernel call per dirty watcher, no matter how
        // many start/stop calls happened since the last poll.
        while let Some(fd) = self
            .watcher_queue
            .pop_front(&mut self.watchers, QueueId::Watcher)
        {
            let (registered, desired) = {
                let w = self.watchers.get(fd).expect("queued watcher has no record");
                assert!(!w.pevents.is_empty());
                assert!(w.fd >= 0);
                (w.events, w.pevents)
            };

            let result = if registered.is_empty() {
                match self.poller.add(fd, desired) {
                    // The fd still carries a registration from a watcher
                    // that was dropped without a kernel round-trip.
                    Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                        self.poller.modify(fd, desired)
                    }
                    other => other,
                }
            } else {
                self.poller.modify(fd, desired)
            };

            if let Err(err) = result {
                panic!("epoll registration desynchronized: {err}");
            }

            self.watchers.get_mut(fd).unwrap().events = desired;
        }

        let sigmask = self.block_sigprof.then(sigprof_mask);

        assert!(timeout >= -1);
        let base = self.time;
        let mut budget = REPOLL_BUDGET;
        let real_timeout = timeout;

        loop {
            if mem::size_of::<libc::c_long>() == mem::size_of::<i32>()
                && timeout >= MAX_SAFE_TIMEOUT
            {
                timeout = MAX_SAFE_TIMEOUT;
            }

            let wait = self.poller.wait(timeout, sigmask.as_ref());

            // Refresh unconditionally: the OS may have rescheduled this
            // process while it sat in the syscall. The wait result was
            // captured first, so the clock read cannot clobber it.
            self.update_time();

            let nfds = match wait {
                Ok(0) => {
                    assert!(timeout != -1);
                    if timeout == 0 {
                        return;
                    }
                    match remaining(real_timeout, base, self.time) {
                        Some(t) => {
                            timeout = t;
                            continue;
                        }
                        None => return,
                    }
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if timeout == -1 {
                        continue;
                    }
                    if timeout == 0 {
                        return;
                    }
                    match remaining(real_timeout, base, self.time) {
                        Some(t) => {
                            timeout = t;
                            continue;
                        }
                        None => return,
                    }
                }
                Err(err) => panic!("epoll_pwait: {err}"),
            };

            let mut have_signals = false;
            let mut nevents = 0usize;

            for i in 0..nfds {
                // Re-read the entry: a callback earlier in the batch may
                // have invalidated it in place.
                let (token, bits) = self.poller.event(i);
                if token == INVALID_TOKEN {
                    continue;
                }

                let fd = token as RawFd;
                debug_assert!(fd >= 0);
                debug_assert!((fd as usize) < self.watchers.len());

                let (mask, cb) = match self.watchers.registered(fd) {
                    None => {
                        // The fd was stopped between the wait and this
                        // dispatch step. Disarm it; errors are ignored
                        // since the fd may already be closed.
                        let _ = self.poller.delete(fd);
                        continue;
                    }
                    Some(w) => {
                        // Deliver only subscribed events, plus error and
                        // hang-up which the kernel reports regardless.
                        let mut mask = EventMask::from_bits_retain(bits)
                            & (w.pevents | EventMask::ERROR | EventMask::HANGUP);

                        // Epoll sometimes reports just ERROR or HANGUP.
                        // Merge in the subscribed read/write interests so
                        // the callback drains the fd and observes the
                        // condition there.
                        if mask == EventMask::ERROR || mask == EventMask::HANGUP {
                            mask |= w.pevents & EventMask::STARTABLE;
                        }

                        (mask, w.cb.clone())
                    }
                };

                if mask.is_empty() {
                    continue;
                }

                if fd == self.signal_fd {
                    // Signal watchers run last, once the rest of the
                    // batch has settled.
                    have_signals = true;
                } else {
                    (&mut *cb.borrow_mut())(self, fd, mask);
                }
                nevents += 1;
            }

            if have_signals {
                let cb = self
                    .watchers
                    .registered(self.signal_fd)
                    .map(|w| w.cb.clone());
                if let Some(cb) = cb {
                    let fd = self.signal_fd;
                    (&mut *cb.borrow_mut())(self, fd, EventMask::READABLE);
                }
            }

            self.poller.finish_dispatch();

            if have_signals {
                // The loop should cycle now so signal-driven state
                // changes are observed on a fresh iteration.
                return;
            }

            if nevents != 0 {
                if nfds == EVENT_BATCH && budget > 1 {
                    // A full batch suggests more events are ready; drain
                    // them without blocking.
                    budget -= 1;
                    timeout = 0;
                    continue;
                }
                return;
            }

            if timeout == 0 {
                return;
            }
            if timeout == -1 {
                continue;
            }

            match remaining(real_timeout, base, self.time) {
                Some(t) => timeout = t,
                None => return,
            }
        }
    }
}

/// Time left of the originally requested wait after `base → now`
/// elapsed, or `None` once it is used up.
fn remaining(real_timeout: i32, base: u64, now: u64) -> Option<i32> {
    debug_assert!(real_timeout > 0);
    let elapsed = now.saturating_sub(base) as i64;
    let left = real_timeout as i64 - elapsed;
    (left > 0).then(|| left as i32)
}

fn sigprof_mask() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPROF);
        set
    }
}
