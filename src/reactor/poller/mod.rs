#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

/// Largest batch of events a single kernel wait may return.
pub(crate) const EVENT_BATCH: usize = 1024;
