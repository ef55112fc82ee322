//! Handle lifecycle, loop liveness and phase ordering.

use vortice::{EventLoop, HandleType, RunMode};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn close_callback_runs_exactly_once() {
    let mut lp = EventLoop::new().unwrap();
    let closed = Rc::new(Cell::new(0u32));

    let timer = lp.new_timer();
    assert_eq!(lp.handle_count(), 1);

    {
        let closed = closed.clone();
        lp.close(
            timer,
            Some(Box::new(move |_, _| {
                closed.set(closed.get() + 1);
            })),
        );
    }

    assert!(lp.is_closing(timer));
    assert_eq!(closed.get(), 0, "finalize waits for the loop");

    lp.run(RunMode::NoWait);
    assert_eq!(closed.get(), 1);
    assert_eq!(lp.handle_count(), 0);
}

#[test]
#[should_panic(expected = "handle closed twice")]
fn double_close_is_rejected() {
    let mut lp = EventLoop::new().unwrap();
    let timer = lp.new_timer();
    lp.close(timer, None);
    lp.close(timer, None);
}

#[test]
fn finalized_ids_go_stale() {
    let mut lp = EventLoop::new().unwrap();
    let timer = lp.new_timer();
    lp.close(timer, None);
    lp.run(RunMode::NoWait);

    assert!(!lp.is_active(timer));
    assert!(!lp.is_closing(timer));
    assert_eq!(lp.handle_type(timer), None);
    assert!(lp.timer_start(timer, 1, 0, |_, _| {}).is_err());
}

#[test]
fn pending_close_keeps_the_loop_alive() {
    let mut lp = EventLoop::new().unwrap();
    let timer = lp.new_timer();

    assert!(!lp.alive());
    lp.close(timer, None);
    assert!(lp.alive(), "a queued finalize counts as work");

    let alive = lp.run(RunMode::NoWait);
    assert!(!alive);
}

#[test]
fn requests_count_toward_liveness() {
    let mut lp = EventLoop::new().unwrap();
    assert!(!lp.alive());

    lp.register_request();
    assert!(lp.alive());
    assert!(lp.run(RunMode::NoWait));

    lp.unregister_request();
    assert!(!lp.alive());
}

#[test]
fn unreferenced_handles_do_not_hold_the_loop() {
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer = lp.new_timer();
    {
        let fired = fired.clone();
        lp.timer_start(timer, 10_000, 0, move |_, _| {
            fired.set(fired.get() + 1);
        })
        .unwrap();
    }

    assert!(lp.has_ref(timer));
    lp.unref_handle(timer);
    assert!(!lp.has_ref(timer));
    assert!(!lp.alive());

    let start = std::time::Instant::now();
    assert!(!lp.run(RunMode::Default));
    assert!(start.elapsed().as_millis() < 5_000, "run must not wait for it");
    assert_eq!(fired.get(), 0);

    // Re-referencing restores the accounting.
    lp.ref_handle(timer);
    assert!(lp.alive());
}

#[test]
fn handle_types_are_inspectable() {
    let mut lp = EventLoop::new().unwrap();
    let timer = lp.new_timer();
    let idle = lp.new_idle();
    let prepare = lp.new_prepare();
    let check = lp.new_check();

    assert_eq!(lp.handle_type(timer), Some(HandleType::Timer));
    assert_eq!(lp.handle_type(idle), Some(HandleType::Idle));
    assert_eq!(lp.handle_type(prepare), Some(HandleType::Prepare));
    assert_eq!(lp.handle_type(check), Some(HandleType::Check));
}

#[test]
fn phases_run_in_loop_order() {
    let mut lp = EventLoop::new().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    let timer = lp.new_timer();
    {
        let log = log.clone();
        lp.timer_start(timer, 0, 0, move |_, _| log.borrow_mut().push("timer"))
            .unwrap();
    }

    let check = lp.new_check();
    {
        let log = log.clone();
        lp.check_start(check, move |_, _| log.borrow_mut().push("check"))
            .unwrap();
    }
    let prepare = lp.new_prepare();
    {
        let log = log.clone();
        lp.prepare_start(prepare, move |_, _| log.borrow_mut().push("prepare"))
            .unwrap();
    }
    let idle = lp.new_idle();
    {
        let log = log.clone();
        lp.idle_start(idle, move |_, _| log.borrow_mut().push("idle"))
            .unwrap();
    }

    lp.run(RunMode::Once);

    assert_eq!(*log.borrow(), vec!["timer", "idle", "prepare", "check"]);
}

#[test]
fn idle_handles_busy_cycle_the_loop() {
    let mut lp = EventLoop::new().unwrap();
    let spins = Rc::new(Cell::new(0u32));

    let idle = lp.new_idle();
    {
        let spins = spins.clone();
        lp.idle_start(idle, move |lp, idle| {
            spins.set(spins.get() + 1);
            if spins.get() == 5 {
                lp.close(idle, None);
            }
        })
        .unwrap();
    }

    let start = std::time::Instant::now();
    let alive = lp.run(RunMode::Default);

    assert_eq!(spins.get(), 5);
    assert!(!alive);
    assert!(
        start.elapsed().as_millis() < 5_000,
        "idle iterations must not wait in the kernel"
    );
}

#[test]
fn stop_finishes_the_iteration_and_clears_itself() {
    let mut lp = EventLoop::new().unwrap();
    let checks = Rc::new(Cell::new(0u32));

    // A repeating timer would keep the loop alive forever.
    let timer = lp.new_timer();
    lp.timer_start(timer, 1, 1, |_, _| {}).unwrap();

    let check = lp.new_check();
    {
        let checks = checks.clone();
        lp.check_start(check, move |lp, _| {
            checks.set(checks.get() + 1);
            lp.stop();
        })
        .unwrap();
    }

    let alive = lp.run(RunMode::Default);
    assert_eq!(checks.get(), 1, "stop ends the run after one iteration");
    assert!(alive, "stopped, not drained");

    // The stop flag does not leak into the next run.
    lp.run(RunMode::NoWait);
    assert_eq!(checks.get(), 2);
}

#[test]
fn stopped_phase_handles_fall_silent() {
    let mut lp = EventLoop::new().unwrap();
    let runs = Rc::new(Cell::new(0u32));

    let prepare = lp.new_prepare();
    {
        let runs = runs.clone();
        lp.prepare_start(prepare, move |_, _| runs.set(runs.get() + 1))
            .unwrap();
    }

    lp.run(RunMode::NoWait);
    assert_eq!(runs.get(), 1);

    lp.prepare_stop(prepare).unwrap();
    assert!(!lp.is_active(prepare));
    lp.run(RunMode::NoWait);
    assert_eq!(runs.get(), 1);
}

#[test]
fn backend_timeout_reflects_loop_state() {
    let mut lp = EventLoop::new().unwrap();

    // Nothing active: the poll must not block.
    assert_eq!(lp.backend_timeout(), 0);

    let timer = lp.new_timer();
    lp.timer_start(timer, 100, 0, |_, _| {}).unwrap();
    let timeout = lp.backend_timeout();
    assert!(timeout > 0 && timeout <= 100);

    // A started idle handle forces immediate polls.
    let idle = lp.new_idle();
    lp.idle_start(idle, |_, _| {}).unwrap();
    assert_eq!(lp.backend_timeout(), 0);
    lp.idle_stop(idle).unwrap();

    // A pending close forces immediate polls too.
    lp.close(idle, None);
    assert_eq!(lp.backend_timeout(), 0);
}

#[test]
fn loop_time_is_monotonic_and_refreshable() {
    let mut lp = EventLoop::new().unwrap();
    let t0 = lp.now();
    assert!(t0 > 0);

    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(lp.now(), t0, "loop time is cached between phases");

    lp.update_time();
    assert!(lp.now() >= t0);

    lp.run(RunMode::NoWait);
    assert!(lp.now() >= t0);
}

#[test]
fn backend_fd_is_valid() {
    let lp = EventLoop::new().unwrap();
    assert!(lp.backend_fd() >= 0);
}
