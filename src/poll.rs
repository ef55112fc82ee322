//! Poll handles.
//!
//! The user-facing readiness surface: a poll handle watches an arbitrary
//! file descriptor the caller owns (a socket, pipe, TTY or device fd)
//! and invokes a callback with the delivered event mask. The handle
//! never reads, writes or closes the descriptor itself.

use crate::event_loop::EventLoop;
use crate::events::EventMask;
use crate::fd;
use crate::handle::{inval, Handle, HandleId, HandleKind};
use crate::reactor::watcher::IoCallback;

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Watches a caller-owned file descriptor for readiness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PollHandle(pub(crate) HandleId);

impl From<PollHandle> for HandleId {
    fn from(handle: PollHandle) -> HandleId {
        handle.0
    }
}

pub(crate) struct PollState {
    fd: RawFd,
}

impl EventLoop {
    /// Creates a poll handle for `fd`.
    ///
    /// The fd is probed against the kernel poller (regular files are
    /// rejected with `EPERM`) and switched to non-blocking mode, which
    /// callbacks rely on when draining it.
    pub fn new_poll(&mut self, fd: RawFd) -> io::Result<PollHandle> {
        self.check_fd(fd)?;
        fd::nonblock(fd, true)?;
        Ok(PollHandle(self.add_handle(HandleKind::Poll(PollState { fd }))))
    }

    /// Subscribes to `events`, one or more of READABLE, WRITABLE,
    /// DISCONNECT and PRIORITY. The delivered mask may additionally
    /// carry ERROR or HANGUP, which are reported whether subscribed or
    /// not. Starting an already started handle replaces both the mask
    /// and the callback.
    pub fn poll_start<F>(&mut self, handle: PollHandle, events: EventMask, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, PollHandle, EventMask) + 'static,
    {
        let id = handle.0;
        let fd = self.poll_state(id)?.fd;
        if events.is_empty() || !EventMask::STARTABLE.contains(events) {
            return Err(inval());
        }
        if self.is_closing(id) {
            return Err(inval());
        }

        self.io_stop(fd, EventMask::STARTABLE);

        let mut cb = cb;
        let iocb: IoCallback = Rc::new(RefCell::new(
            move |lp: &mut EventLoop, _fd: RawFd, revents: EventMask| {
                cb(lp, PollHandle(id), revents);
            },
        ));
        self.io_start(fd, events, iocb);
        self.handle_start(id);
        Ok(())
    }

    /// Unsubscribes from every event. No callback fires after this
    /// returns, even for events already collected from the kernel.
    pub fn poll_stop(&mut self, handle: PollHandle) -> io::Result<()> {
        let id = handle.0;
        let fd = self.poll_state(id)?.fd;
        self.io_stop(fd, EventMask::STARTABLE);
        self.handle_stop(id);
        Ok(())
    }

    /// The file descriptor the handle watches.
    pub fn poll_fd(&self, handle: PollHandle) -> io::Result<RawFd> {
        Ok(self.poll_state(handle.0)?.fd)
    }

    pub(crate) fn poll_close(&mut self, id: HandleId) {
        let fd = match self.handles.get(id) {
            Some(Handle {
                kind: HandleKind::Poll(state),
                ..
            }) => state.fd,
            _ => return,
        };
        self.io_close(fd);
        self.handle_stop(id);
    }

    fn poll_state(&self, id: HandleId) -> io::Result<&PollState> {
        match self.handles.get(id) {
            Some(Handle {
                kind: HandleKind::Poll(state),
                ..
            }) => Ok(state),
            _ => Err(inval()),
        }
    }
}
