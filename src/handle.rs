//! Handle lifecycle.
//!
//! Handles are long-lived objects owned by the loop: timers, phase
//! handles, async wakers and poll handles. A handle contributes to loop
//! liveness while it is both active and referenced. Closing is two-phase:
//! `close` runs the kind-specific teardown immediately and queues the
//! handle, and the loop finalizes it at the end of the same iteration,
//! invoking the close callback exactly once.

use crate::event_loop::EventLoop;
use crate::phase::PhaseState;
use crate::poll::PollState;
use crate::timer::TimerState;
use crate::wake::AsyncState;

use std::io;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct HandleFlags: u8 {
        /// Close requested; teardown ran, finalize pending.
        const CLOSING = 0x01;
        /// Finalized. Terminal.
        const CLOSED = 0x02;
        /// Counts toward loop liveness while active.
        const REF = 0x04;
        /// Doing work; set by the kind-specific start operation.
        const ACTIVE = 0x08;
        /// Owned by the loop itself, hidden from handle accounting.
        const INTERNAL = 0x10;
    }
}

/// The kind of a handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleType {
    Timer,
    Idle,
    Prepare,
    Check,
    Async,
    Poll,
}

pub(crate) enum HandleKind {
    Timer(TimerState),
    Idle(PhaseState),
    Prepare(PhaseState),
    Check(PhaseState),
    Async(AsyncState),
    Poll(PollState),
}

impl HandleKind {
    pub(crate) fn handle_type(&self) -> HandleType {
        match self {
            HandleKind::Timer(_) => HandleType::Timer,
            HandleKind::Idle(_) => HandleType::Idle,
            HandleKind::Prepare(_) => HandleType::Prepare,
            HandleKind::Check(_) => HandleType::Check,
            HandleKind::Async(_) => HandleType::Async,
            HandleKind::Poll(_) => HandleType::Poll,
        }
    }
}

/// Identifier of a handle owned by a loop. Stale ids (of finalized
/// handles) are detected and rejected by every operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

/// Callback invoked when a handle finishes closing.
pub type CloseCallback = Box<dyn FnOnce(&mut EventLoop, HandleId)>;

pub(crate) struct Handle {
    pub(crate) kind: HandleKind,
    pub(crate) flags: HandleFlags,
    pub(crate) close_cb: Option<CloseCallback>,
    pub(crate) next_closing: Option<HandleId>,
}

impl Handle {
    fn new(kind: HandleKind) -> Handle {
        Handle {
            kind,
            flags: HandleFlags::REF,
            close_cb: None,
            next_closing: None,
        }
    }
}

/// All live handles of one loop.
pub(crate) struct HandleTable {
    slots: Vec<HandleSlot>,
    free: Vec<u32>,
}

struct HandleSlot {
    generation: u32,
    entry: Option<Handle>,
}

impl HandleTable {
    pub(crate) fn new() -> HandleTable {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, handle: Handle) -> HandleId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.entry.is_none());
                slot.entry = Some(handle);
                HandleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(HandleSlot {
                    generation: 0,
                    entry: Some(handle),
                });
                HandleId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&Handle> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<Handle> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let handle = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(handle)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }
}

pub(crate) fn inval() -> io::Error {
    io::Error::from(io::ErrorKind::InvalidInput)
}

impl EventLoop {
    pub(crate) fn add_handle(&mut self, kind: HandleKind) -> HandleId {
        self.handles.insert(Handle::new(kind))
    }

    pub(crate) fn handle_start(&mut self, id: HandleId) {
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if handle.flags.contains(HandleFlags::ACTIVE) {
            return;
        }
        handle.flags |= HandleFlags::ACTIVE;
        if handle.flags.contains(HandleFlags::REF) {
            self.active_handles += 1;
        }
    }

    pub(crate) fn handle_stop(&mut self, id: HandleId) {
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if !handle.flags.contains(HandleFlags::ACTIVE) {
            return;
        }
        handle.flags &= !HandleFlags::ACTIVE;
        if handle.flags.contains(HandleFlags::REF) {
            debug_assert!(self.active_handles > 0);
            self.active_handles -= 1;
        }
    }

    /// References the handle: while it is also active, it keeps the loop
    /// alive.
    pub fn ref_handle<H: Into<HandleId>>(&mut self, handle: H) {
        let id = handle.into();
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if handle.flags.contains(HandleFlags::REF) {
            return;
        }
        handle.flags |= HandleFlags::REF;
        if handle.flags.contains(HandleFlags::CLOSING) {
            return;
        }
        if handle.flags.contains(HandleFlags::ACTIVE) {
            self.active_handles += 1;
        }
    }

    /// Unreferences the handle: it may stay active but no longer keeps
    /// the loop alive.
    pub fn unref_handle<H: Into<HandleId>>(&mut self, handle: H) {
        let id = handle.into();
        self.unref_internal(id);
    }

    fn unref_internal(&mut self, id: HandleId) {
        let Some(handle) = self.handles.get_mut(id) else {
            return;
        };
        if !handle.flags.contains(HandleFlags::REF) {
            return;
        }
        handle.flags &= !HandleFlags::REF;
        if handle.flags.contains(HandleFlags::CLOSING) {
            return;
        }
        if handle.flags.contains(HandleFlags::ACTIVE) {
            debug_assert!(self.active_handles > 0);
            self.active_handles -= 1;
        }
    }

    /// Whether the handle is referenced.
    pub fn has_ref<H: Into<HandleId>>(&self, handle: H) -> bool {
        self.handles
            .get(handle.into())
            .map_or(false, |h| h.flags.contains(HandleFlags::REF))
    }

    /// Whether the handle is doing work (started and not yet stopped or
    /// closed).
    pub fn is_active<H: Into<HandleId>>(&self, handle: H) -> bool {
        self.handles
            .get(handle.into())
            .map_or(false, |h| h.flags.contains(HandleFlags::ACTIVE))
    }

    /// Whether a close was requested for the handle.
    pub fn is_closing<H: Into<HandleId>>(&self, handle: H) -> bool {
        self.handles.get(handle.into()).map_or(false, |h| {
            h.flags
                .intersects(HandleFlags::CLOSING | HandleFlags::CLOSED)
        })
    }

    /// The kind of the handle, while it is live.
    pub fn handle_type<H: Into<HandleId>>(&self, handle: H) -> Option<HandleType> {
        self.handles
            .get(handle.into())
            .map(|h| h.kind.handle_type())
    }

    /// Number of live user handles owned by the loop.
    pub fn handle_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| !h.flags.contains(HandleFlags::INTERNAL))
            .count()
    }

    /// Requests a close. The kind-specific teardown (stopping watchers,
    /// releasing kernel resources) runs now; `close_cb` runs when the
    /// loop finalizes the handle at the end of the current iteration.
    ///
    /// # Panics
    ///
    /// Panics when the handle is already closing: a close may be
    /// requested only once.
    pub fn close<H: Into<HandleId>>(&mut self, handle: H, close_cb: Option<CloseCallback>) {
        let id = handle.into();
        let kind = {
            let handle = self.handles.get_mut(id).expect("close of an unknown handle");
            assert!(
                !handle
                    .flags
                    .intersects(HandleFlags::CLOSING | HandleFlags::CLOSED),
                "handle closed twice"
            );
            handle.flags |= HandleFlags::CLOSING;
            handle.close_cb = close_cb;
            handle.kind.handle_type()
        };

        match kind {
            HandleType::Timer => self.timer_close(id),
            HandleType::Idle | HandleType::Prepare | HandleType::Check => {
                self.phase_close(id, kind)
            }
            HandleType::Async => self.async_close(id),
            HandleType::Poll => self.poll_close(id),
        }

        self.make_close_pending(id);
    }

    pub(crate) fn make_close_pending(&mut self, id: HandleId) {
        let head = self.closing.take();
        let handle = self.handles.get_mut(id).unwrap();
        debug_assert!(handle.flags.contains(HandleFlags::CLOSING));
        debug_assert!(!handle.flags.contains(HandleFlags::CLOSED));
        handle.next_closing = head;
        self.closing = Some(id);
    }

    pub(crate) fn run_closing_handles(&mut self) {
        let mut next = self.closing.take();
        while let Some(id) = next {
            next = self.handles.get_mut(id).unwrap().next_closing.take();
            self.finish_close(id);
        }
    }

    fn finish_close(&mut self, id: HandleId) {
        let close_cb = {
            let handle = self.handles.get_mut(id).unwrap();
            assert!(handle.flags.contains(HandleFlags::CLOSING));
            assert!(!handle.flags.contains(HandleFlags::CLOSED));
            handle.flags |= HandleFlags::CLOSED;
            handle.close_cb.take()
        };

        self.unref_internal(id);

        if let Some(cb) = close_cb {
            cb(self, id);
        }

        self.handles.remove(id);
    }
}
