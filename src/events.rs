use std::os::fd::RawFd;

bitflags::bitflags! {
    /// Readiness events on a file descriptor.
    ///
    /// These are the event types reported by the kernel poller. The values
    /// match the `EPOLL*` constants so masks can be handed to the kernel
    /// without translation.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct EventMask: u32 {
        /// Data can be read.
        const READABLE = libc::EPOLLIN as u32;
        /// Data can be written.
        const WRITABLE = libc::EPOLLOUT as u32;
        /// Urgent out-of-band data is available.
        const PRIORITY = libc::EPOLLPRI as u32;
        /// The peer closed its end of the connection.
        const DISCONNECT = libc::EPOLLRDHUP as u32;
        /// An error condition is pending. Delivered unconditionally,
        /// never subscribed to directly.
        const ERROR = libc::EPOLLERR as u32;
        /// Hang-up. Delivered unconditionally, never subscribed to
        /// directly.
        const HANGUP = libc::EPOLLHUP as u32;
    }
}

impl EventMask {
    /// Events a watcher may subscribe to. `ERROR` and `HANGUP` are
    /// delivery-only: the kernel reports them whether asked or not.
    pub(crate) const STARTABLE: EventMask = EventMask::from_bits_retain(
        EventMask::READABLE.bits()
            | EventMask::WRITABLE.bits()
            | EventMask::PRIORITY.bits()
            | EventMask::DISCONNECT.bits(),
    );
}

/// Token value patched into an in-flight event batch when its file
/// descriptor is invalidated mid-dispatch.
pub(crate) const INVALID_TOKEN: u64 = u64::MAX;

pub(crate) fn token_of(fd: RawFd) -> u64 {
    fd as u64
}
