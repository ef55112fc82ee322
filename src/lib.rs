//! # Vortice
//!
//! **Vortice** is a callback-driven event loop core for Rust, designed
//! as the low-level I/O readiness layer for the **Nebula** ecosystem.
//!
//! Unlike future-based runtimes, Vortice exposes the event loop itself:
//! a single-threaded loop that multiplexes file descriptors over a
//! level-triggered kernel poller (epoll on Linux) and dispatches plain
//! callbacks. It is the layer a runtime, a protocol server or a
//! language binding builds its own abstractions on.
//!
//! The loop provides:
//!
//! - **Poll handles** watching caller-owned file descriptors for
//!   readable/writable/disconnect/priority readiness
//! - **Timers** with one-shot and repeating deadlines off a monotonic
//!   millisecond clock
//! - **Idle, prepare and check handles** hooked into fixed points of
//!   every loop iteration
//! - **Async handles** for waking the loop from other threads
//! - **Lazy kernel registration**: start/stop churn between two polls
//!   collapses into one `epoll_ctl` per fd
//! - **Two-phase handle close** with exactly-once close callbacks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vortice::{EventLoop, EventMask, RunMode};
//!
//! let mut lp = EventLoop::new()?;
//!
//! let timer = lp.new_timer();
//! lp.timer_start(timer, 500, 0, |lp, timer| {
//!     println!("half a second at t={}", lp.now());
//!     lp.close(timer, None);
//! })?;
//!
//! let poll = lp.new_poll(socket_fd)?;
//! lp.poll_start(poll, EventMask::READABLE, |lp, poll, events| {
//!     // drain socket_fd here
//! })?;
//!
//! lp.run(RunMode::Default);
//! ```
//!
//! ## Threading
//!
//! A loop and all its handles belong to the thread driving `run`.
//! [`AsyncWaker`] is the one piece that may cross threads. Callbacks run
//! synchronously on the loop thread and must not block; long work
//! belongs on a worker pool that reports back through an async handle.

mod clock;
mod event_loop;
mod events;
mod handle;
mod phase;
mod poll;
mod queue;
mod reactor;
mod timer;
mod wake;

pub mod fd;

pub use clock::{hrtime, ClockType};
pub use event_loop::{EventLoop, LoopOption, RunMode};
pub use events::EventMask;
pub use handle::{CloseCallback, HandleId, HandleType};
pub use phase::{CheckHandle, IdleHandle, PrepareHandle};
pub use poll::PollHandle;
pub use timer::TimerHandle;
pub use wake::{AsyncHandle, AsyncWaker};
