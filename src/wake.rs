//! Cross-thread wakeups.
//!
//! The async handle is the one loop surface other threads may touch. It
//! owns an eventfd the loop polls for readability; [`AsyncWaker::wake`]
//! bumps the counter from any thread and the loop drains it and invokes
//! the callback on its own thread. Wakes that land before the loop gets
//! around to the callback coalesce into a single invocation.

use crate::event_loop::EventLoop;
use crate::events::EventMask;
use crate::fd;
use crate::handle::{inval, Handle, HandleId, HandleKind};
use crate::reactor::watcher::IoCallback;

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

pub(crate) type AsyncCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, AsyncHandle)>>;

/// Handle invoking a callback on the loop thread when woken from any
/// thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AsyncHandle(pub(crate) HandleId);

impl From<AsyncHandle> for HandleId {
    fn from(handle: AsyncHandle) -> HandleId {
        handle.0
    }
}

/// The sending side of an async handle. Cheap to clone and safe to use
/// from any thread; must not outlive a close of its handle.
#[derive(Clone, Debug)]
pub struct AsyncWaker {
    fd: RawFd,
}

impl AsyncWaker {
    /// Wakes the owning loop. Async-signal-safe: one write syscall, no
    /// allocation, no locking.
    pub fn wake(&self) {
        let one: u64 = 1;
        loop {
            let rc = unsafe { libc::write(self.fd, &one as *const u64 as *const _, 8) };
            // EAGAIN means the counter is already saturated and a wake
            // is pending, which is all a wake has to guarantee.
            if rc != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }
}

pub(crate) struct AsyncState {
    cb: AsyncCallback,
    pub(crate) fd: RawFd,
}

impl EventLoop {
    /// Creates an async handle. The handle starts active and referenced,
    /// so it keeps the loop alive until closed.
    pub fn new_async<F>(&mut self, cb: F) -> io::Result<AsyncHandle>
    where
        F: FnMut(&mut EventLoop, AsyncHandle) + 'static,
    {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd == -1 {
            return Err(io::Error::last_os_error());
        }

        let cb: AsyncCallback = Rc::new(RefCell::new(cb));
        let id = self.add_handle(HandleKind::Async(AsyncState { cb, fd: efd }));

        let iocb: IoCallback = Rc::new(RefCell::new(
            move |lp: &mut EventLoop, fd: RawFd, _events: EventMask| {
                async_io(lp, id, fd);
            },
        ));
        self.io_start(efd, EventMask::READABLE, iocb);
        self.handle_start(id);

        Ok(AsyncHandle(id))
    }

    /// Returns a waker for the handle, the piece that crosses threads.
    pub fn async_waker(&self, handle: AsyncHandle) -> io::Result<AsyncWaker> {
        match self.handles.get(handle.0) {
            Some(Handle {
                kind: HandleKind::Async(state),
                ..
            }) if state.fd >= 0 => Ok(AsyncWaker { fd: state.fd }),
            _ => Err(inval()),
        }
    }

    pub(crate) fn async_close(&mut self, id: HandleId) {
        let efd = match self.handles.get_mut(id) {
            Some(Handle {
                kind: HandleKind::Async(state),
                ..
            }) => std::mem::replace(&mut state.fd, -1),
            _ => return,
        };

        if efd >= 0 {
            self.io_close(efd);
            let _ = fd::close_fd(efd);
        }
        self.handle_stop(id);
    }
}

fn async_io(lp: &mut EventLoop, id: HandleId, fd: RawFd) {
    // One read drains the whole counter; however many wakes piled up,
    // the callback runs once.
    let mut value = 0u64;
    loop {
        let rc = unsafe { libc::read(fd, &mut value as *mut u64 as *mut _, 8) };
        if rc != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }

    let cb = match lp.handles.get(id) {
        Some(Handle {
            kind: HandleKind::Async(state),
            ..
        }) => Some(state.cb.clone()),
        _ => None,
    };
    if let Some(cb) = cb {
        (&mut *cb.borrow_mut())(lp, AsyncHandle(id));
    }
}
