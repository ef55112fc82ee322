//! Idle, prepare and check handles.
//!
//! Three handle kinds whose callbacks run once per loop iteration: idle
//! and prepare before the kernel wait, check after it. A started idle
//! handle also forces the wait to return immediately, so idle callbacks
//! degrade the loop into a busy cycle on purpose.

use crate::event_loop::EventLoop;
use crate::handle::{inval, Handle, HandleId, HandleKind, HandleType};

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

pub(crate) type PhaseCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, HandleId)>>;

/// Runs its callback right after timers and pending callbacks, every
/// iteration, keeping the loop from blocking while started.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IdleHandle(pub(crate) HandleId);

/// Runs its callback right before the loop blocks for I/O.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PrepareHandle(pub(crate) HandleId);

/// Runs its callback right after the loop comes back from I/O.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CheckHandle(pub(crate) HandleId);

impl From<IdleHandle> for HandleId {
    fn from(handle: IdleHandle) -> HandleId {
        handle.0
    }
}

impl From<PrepareHandle> for HandleId {
    fn from(handle: PrepareHandle) -> HandleId {
        handle.0
    }
}

impl From<CheckHandle> for HandleId {
    fn from(handle: CheckHandle) -> HandleId {
        handle.0
    }
}

pub(crate) struct PhaseState {
    cb: Option<PhaseCallback>,
}

impl PhaseState {
    pub(crate) fn new() -> PhaseState {
        PhaseState { cb: None }
    }
}

impl EventLoop {
    pub fn new_idle(&mut self) -> IdleHandle {
        IdleHandle(self.add_handle(HandleKind::Idle(PhaseState::new())))
    }

    pub fn new_prepare(&mut self) -> PrepareHandle {
        PrepareHandle(self.add_handle(HandleKind::Prepare(PhaseState::new())))
    }

    pub fn new_check(&mut self) -> CheckHandle {
        CheckHandle(self.add_handle(HandleKind::Check(PhaseState::new())))
    }

    /// Starts the idle handle. A start on an already started handle is a
    /// no-op and keeps the original callback.
    pub fn idle_start<F>(&mut self, handle: IdleHandle, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, IdleHandle) + 'static,
    {
        let mut cb = cb;
        self.phase_start(
            handle.0,
            HandleType::Idle,
            Rc::new(RefCell::new(move |lp: &mut EventLoop, id: HandleId| {
                cb(lp, IdleHandle(id))
            })),
        )
    }

    pub fn idle_stop(&mut self, handle: IdleHandle) -> io::Result<()> {
        self.phase_stop(handle.0, HandleType::Idle)
    }

    /// Starts the prepare handle. See [`idle_start`] for restart
    /// semantics.
    ///
    /// [`idle_start`]: EventLoop::idle_start
    pub fn prepare_start<F>(&mut self, handle: PrepareHandle, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, PrepareHandle) + 'static,
    {
        let mut cb = cb;
        self.phase_start(
            handle.0,
            HandleType::Prepare,
            Rc::new(RefCell::new(move |lp: &mut EventLoop, id: HandleId| {
                cb(lp, PrepareHandle(id))
            })),
        )
    }

    pub fn prepare_stop(&mut self, handle: PrepareHandle) -> io::Result<()> {
        self.phase_stop(handle.0, HandleType::Prepare)
    }

    /// Starts the check handle. See [`idle_start`] for restart
    /// semantics.
    ///
    /// [`idle_start`]: EventLoop::idle_start
    pub fn check_start<F>(&mut self, handle: CheckHandle, cb: F) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop, CheckHandle) + 'static,
    {
        let mut cb = cb;
        self.phase_start(
            handle.0,
            HandleType::Check,
            Rc::new(RefCell::new(move |lp: &mut EventLoop, id: HandleId| {
                cb(lp, CheckHandle(id))
            })),
        )
    }

    pub fn check_stop(&mut self, handle: CheckHandle) -> io::Result<()> {
        self.phase_stop(handle.0, HandleType::Check)
    }

    fn phase_start(
        &mut self,
        id: HandleId,
        kind: HandleType,
        cb: PhaseCallback,
    ) -> io::Result<()> {
        if self.handle_type(id) != Some(kind) || self.is_closing(id) {
            return Err(inval());
        }
        if self.is_active(id) {
            return Ok(());
        }

        match &mut self.handles.get_mut(id).unwrap().kind {
            HandleKind::Idle(state) | HandleKind::Prepare(state) | HandleKind::Check(state) => {
                state.cb = Some(cb);
            }
            _ => unreachable!(),
        }

        self.phase_list_mut(kind).push(id);
        self.handle_start(id);
        Ok(())
    }

    fn phase_stop(&mut self, id: HandleId, kind: HandleType) -> io::Result<()> {
        if self.handle_type(id) != Some(kind) {
            return Err(inval());
        }
        if !self.is_active(id) {
            return Ok(());
        }

        self.phase_list_mut(kind).retain(|entry| *entry != id);
        self.handle_stop(id);
        Ok(())
    }

    pub(crate) fn phase_close(&mut self, id: HandleId, kind: HandleType) {
        let _ = self.phase_stop(id, kind);
    }

    pub(crate) fn run_idle(&mut self) {
        self.run_phase(HandleType::Idle);
    }

    pub(crate) fn run_prepare(&mut self) {
        self.run_phase(HandleType::Prepare);
    }

    pub(crate) fn run_check(&mut self) {
        self.run_phase(HandleType::Check);
    }

    /// Runs the callbacks of every started handle of the phase, in
    /// arming order. The snapshot keeps iteration stable while callbacks
    /// start, stop or close handles of the same phase.
    fn run_phase(&mut self, kind: HandleType) {
        let snapshot = self.phase_list_mut(kind).clone();
        for id in snapshot {
            if !self.is_active(id) || self.is_closing(id) {
                continue;
            }
            let cb = match self.handles.get(id) {
                Some(Handle {
                    kind:
                        HandleKind::Idle(state)
                        | HandleKind::Prepare(state)
                        | HandleKind::Check(state),
                    ..
                }) => state.cb.clone(),
                _ => None,
            };
            if let Some(cb) = cb {
                (&mut *cb.borrow_mut())(self, id);
            }
        }
    }

    fn phase_list_mut(&mut self, kind: HandleType) -> &mut Vec<HandleId> {
        match kind {
            HandleType::Idle => &mut self.idle_handles,
            HandleType::Prepare => &mut self.prepare_handles,
            HandleType::Check => &mut self.check_handles,
            _ => unreachable!("not a phase handle"),
        }
    }
}
