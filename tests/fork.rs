//! Poller reconstruction and loop configuration.

use vortice::{ClockType, EventLoop, EventMask, LoopOption, RunMode};

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    (fds[0], fds[1])
}

#[test]
fn fork_rebuilds_kernel_registrations() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();

    let fired = Rc::new(Cell::new(0u32));
    let poll = lp.new_poll(r).unwrap();
    {
        let fired = fired.clone();
        lp.poll_start(poll, EventMask::READABLE, move |_, _, _| {
            fired.set(fired.get() + 1);
        })
        .unwrap();
    }

    // Get the watcher registered with the old poller, then throw that
    // poller away the way a forked child must.
    lp.run(RunMode::NoWait);
    lp.fork().unwrap();
    assert!(lp.backend_fd() >= 0);

    let byte = [0u8];
    assert_eq!(unsafe { libc::write(w, byte.as_ptr() as *const _, 1) }, 1);
    lp.run(RunMode::Once);

    assert_eq!(fired.get(), 1, "watcher survives the poller swap");

    for fd in [r, w] {
        unsafe { libc::close(fd) };
    }
}

#[test]
fn only_sigprof_may_be_blocked() {
    let mut lp = EventLoop::new().unwrap();
    assert!(lp.configure(LoopOption::BlockSignal(libc::SIGPROF)).is_ok());
    assert!(lp.configure(LoopOption::BlockSignal(libc::SIGINT)).is_err());
}

#[test]
fn blocked_sigprof_still_polls() {
    let mut lp = EventLoop::new().unwrap();
    lp.configure(LoopOption::BlockSignal(libc::SIGPROF)).unwrap();

    let fired = Rc::new(Cell::new(0u32));
    let timer = lp.new_timer();
    {
        let fired = fired.clone();
        lp.timer_start(timer, 10, 0, move |_, _| {
            fired.set(fired.get() + 1);
        })
        .unwrap();
    }

    lp.run(RunMode::Default);
    assert_eq!(fired.get(), 1);
}

#[test]
fn clock_variants_are_monotonic() {
    let a = vortice::hrtime(ClockType::Precise);
    let b = vortice::hrtime(ClockType::Precise);
    assert!(a > 0 && b >= a);
    assert!(vortice::hrtime(ClockType::Fast) > 0);
}
