//! Linux `epoll`-based poller.
//!
//! Wraps the readiness primitive behind the reactor: per-fd add, modify
//! and delete, and a blocking wait with millisecond timeout and optional
//! signal mask. Readiness is level-triggered.
//!
//! The poller also owns the reusable event batch. While a batch is being
//! dispatched it doubles as the invalidation surface: closing a file
//! descriptor mid-dispatch patches its undelivered entries in place so a
//! recycled descriptor number cannot be mistaken for the old one.

use crate::events::{token_of, EventMask, INVALID_TOKEN};
use crate::fd;
use crate::reactor::poller::EVENT_BATCH;

use libc::{
    epoll_create, epoll_create1, epoll_ctl, epoll_event, epoll_pwait, EPOLL_CLOEXEC,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

pub(crate) struct Poller {
    /// Epoll file descriptor, the loop's backend fd.
    epoll: RawFd,

    /// Reusable batch filled by [`Poller::wait`] and drained by the poll
    /// step. Empty whenever no dispatch is in progress.
    events: Vec<epoll_event>,
}

impl Poller {
    /// Creates the epoll instance with close-on-exec applied atomically.
    ///
    /// `epoll_create1` can fail either because it is not implemented (old
    /// kernel) or because it does not understand `EPOLL_CLOEXEC`; both
    /// fall back to plain `epoll_create` plus an explicit flag.
    pub(crate) fn new() -> io::Result<Poller> {
        let mut epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };

        if epoll == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOSYS) | Some(libc::EINVAL) => {
                    epoll = unsafe { epoll_create(256) };
                    if epoll == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    let _ = fd::cloexec(epoll, true);
                }
                _ => return Err(err),
            }
        }

        Ok(Poller {
            epoll,
            events: Vec::with_capacity(EVENT_BATCH),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.epoll
    }

    /// Registers `fd` with the given interest mask.
    pub(crate) fn add(&self, fd: RawFd, events: EventMask) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, events)
    }

    /// Replaces the interest mask of an already registered `fd`.
    pub(crate) fn modify(&self, fd: RawFd, events: EventMask) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, events)
    }

    /// Removes `fd` from the epoll set.
    ///
    /// A dummy event record is passed to work around kernels that fault
    /// on a null pointer for `EPOLL_CTL_DEL`.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut dummy: epoll_event = unsafe { mem::zeroed() };
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, &mut dummy) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: EventMask) -> io::Result<()> {
        let mut event = epoll_event {
            events: events.bits(),
            u64: token_of(fd),
        };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks for up to `timeout` milliseconds (-1 blocks indefinitely),
    /// optionally swapping in `sigmask` for the duration of the wait.
    /// Fills the internal batch and returns the number of ready events.
    pub(crate) fn wait(
        &mut self,
        timeout: i32,
        sigmask: Option<&libc::sigset_t>,
    ) -> io::Result<usize> {
        let mask = sigmask.map_or(ptr::null(), |m| m as *const libc::sigset_t);

        self.events.clear();

        let n = unsafe {
            epoll_pwait(
                self.epoll,
                self.events.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout,
                mask,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // The kernel wrote n records into the spare capacity.
        unsafe {
            self.events.set_len(n as usize);
        }

        Ok(n as usize)
    }

    /// Reads batch entry `i`. Re-read on every dispatch step: earlier
    /// callbacks may have invalidated entries in place.
    pub(crate) fn event(&self, i: usize) -> (u64, u32) {
        let event = self.events[i];
        (event.u64, event.events)
    }

    /// Cancels undelivered batch entries for `fd` and removes it from the
    /// epoll set.
    ///
    /// The kernel-side removal avoids junk events when the same file
    /// description remains open in another process; its errors are
    /// ignored because the watcher table is the source of truth.
    pub(crate) fn invalidate(&mut self, fd: RawFd) {
        let token = token_of(fd);
        for event in &mut self.events {
            if event.u64 == token {
                event.u64 = INVALID_TOKEN;
            }
        }

        if self.epoll >= 0 {
            let _ = self.delete(fd);
        }
    }

    /// Ends a dispatch: the batch no longer backs invalidation.
    pub(crate) fn finish_dispatch(&mut self) {
        self.events.clear();
    }

    /// Probes whether the kernel poller accepts `fd` by registering and
    /// immediately deregistering it. An fd that is already registered
    /// counts as acceptable.
    pub(crate) fn check_fd(&self, fd: RawFd) -> io::Result<()> {
        if let Err(err) = self.add(fd, EventMask::READABLE) {
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
        }

        if self.delete(fd).is_err() {
            panic!("epoll rejected deletion of a probed fd");
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = fd::close_fd(self.epoll);
    }
}
