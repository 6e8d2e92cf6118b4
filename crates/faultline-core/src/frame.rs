//! Execution frames and the per-thread frame stack.
//!
//! A [`Frame`] is created for every call of a [`crate::call::Callable`]. It owns
//! one slot per declared variable name of its [`Code`]; bound slots are
//! retained, and the slots are released when the call leaves the frame.
//!
//! Each thread keeps a stack of active frames. Frames are popped by a guard when
//! a call returns or unwinds. A non-local resumption after a fault skips that
//! guard, which leaves the faulting frames on the stack: the supervisor reads
//! the innermost one to name the unit of work, then calls [`unwind_to`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::object::{Header, Value};

/// Static description of a unit of code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    name: String,
    varnames: Vec<String>,
}

impl Code {
    #[must_use]
    pub fn new(name: &str, varnames: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            varnames: varnames.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local variable names, parameters first.
    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    #[must_use]
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.varnames.iter().position(|v| v == name)
    }
}

/// Shared handle to a [`Frame`].
pub type FrameRef = Arc<Frame>;

/// An activation record with named local slots.
pub struct Frame {
    header: Header,
    code: Arc<Code>,
    slots: Mutex<Vec<Option<Value>>>,
    back: Option<FrameRef>,
}

impl Frame {
    /// A frame for `code` whose caller is `back`. All slots start unbound.
    #[must_use]
    pub fn new(code: Arc<Code>, back: Option<FrameRef>) -> FrameRef {
        let slots = vec![None; code.varnames.len()];
        Arc::new(Self {
            header: Header::new(),
            code,
            slots: Mutex::new(slots),
            back,
        })
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    /// The calling frame.
    #[must_use]
    pub fn back(&self) -> Option<&FrameRef> {
        self.back.as_ref()
    }

    /// Snapshot of the bound locals, keyed by name.
    #[must_use]
    pub fn locals(&self) -> BTreeMap<String, Value> {
        let slots = self.slots.lock();
        self.code
            .varnames
            .iter()
            .zip(slots.iter())
            .filter_map(|(name, slot)| slot.as_ref().map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Current value bound to `name`.
    #[must_use]
    pub fn local(&self, name: &str) -> Option<Value> {
        let index = self.code.slot_of(name)?;
        self.slots.lock().get(index).cloned().flatten()
    }

    /// Bind `name`, retaining the new value and releasing the old one.
    pub fn set_local(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let index = self
            .code
            .slot_of(name)
            .ok_or_else(|| RuntimeError::UnknownLocal(name.to_string()))?;
        value.retain();
        if let Some(previous) = self.swap_slot(index, Some(value)) {
            previous.release();
        }
        Ok(())
    }

    /// Exchange the raw content of slot `index`, returning what was there.
    /// No ownership bookkeeping is done. Out-of-range indices are ignored.
    pub fn swap_slot(&self, index: usize, value: Option<Value>) -> Option<Value> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index)?;
        std::mem::replace(slot, value)
    }

    /// Release and unbind every slot.
    pub fn clear(&self) {
        let taken: Vec<Value> = self.slots.lock().iter_mut().filter_map(Option::take).collect();
        for value in taken {
            value.release();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.name)
            .field("locals", &self.locals())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Per-thread frame stack
// ---------------------------------------------------------------------------

thread_local! {
    static FRAME_STACK: RefCell<Vec<FrameRef>> = const { RefCell::new(Vec::new()) };
}

/// Number of frames active on this thread.
#[must_use]
pub fn depth() -> usize {
    FRAME_STACK.with(|stack| stack.borrow().len())
}

/// Innermost active frame on this thread.
#[must_use]
pub fn current_frame() -> Option<FrameRef> {
    FRAME_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Innermost frame pushed after the stack was `depth` deep, if any.
#[must_use]
pub fn innermost_since(depth: usize) -> Option<FrameRef> {
    FRAME_STACK.with(|stack| {
        let stack = stack.borrow();
        if stack.len() > depth {
            stack.last().cloned()
        } else {
            None
        }
    })
}

/// Pop every frame above `depth`, releasing their slots. Returns how many
/// frames were abandoned.
pub fn unwind_to(depth: usize) -> usize {
    let abandoned: Vec<FrameRef> = FRAME_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.len() > depth {
            stack.split_off(depth)
        } else {
            Vec::new()
        }
    });
    for frame in abandoned.iter().rev() {
        frame.clear();
    }
    abandoned.len()
}

/// Keeps a frame on the thread's stack while alive.
pub(crate) struct ActiveFrame {
    frame: FrameRef,
    depth: usize,
}

impl ActiveFrame {
    pub(crate) fn enter(frame: FrameRef) -> Self {
        let depth = FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Arc::clone(&frame));
            stack.len() - 1
        });
        Self { frame, depth }
    }

    pub(crate) fn frame(&self) -> &FrameRef {
        &self.frame
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() > self.depth {
                stack.truncate(self.depth);
            }
        });
        self.frame.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> Arc<Code> {
        Arc::new(Code::new("compute", &["a", "b", "total"]))
    }

    #[test]
    fn locals_view_lists_bound_slots_only() {
        let frame = Frame::new(code(), None);
        frame.set_local("a", Value::Int(1)).unwrap();
        frame.set_local("total", Value::Int(3)).unwrap();

        let locals = frame.locals();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals.get("a"), Some(&Value::Int(1)));
        assert!(!locals.contains_key("b"));
        assert_eq!(frame.local("total"), Some(Value::Int(3)));
    }

    #[test]
    fn unknown_local_is_an_error() {
        let frame = Frame::new(code(), None);
        assert_eq!(
            frame.set_local("zzz", Value::None).unwrap_err(),
            RuntimeError::UnknownLocal("zzz".into())
        );
    }

    #[test]
    fn active_frame_pops_on_drop() {
        let base = depth();
        {
            let outer = ActiveFrame::enter(Frame::new(code(), None));
            assert_eq!(depth(), base + 1);
            let _inner = ActiveFrame::enter(Frame::new(code(), Some(Arc::clone(outer.frame()))));
            assert_eq!(depth(), base + 2);
            assert_eq!(innermost_since(base).unwrap().name(), "compute");
        }
        assert_eq!(depth(), base);
        assert!(innermost_since(base).is_none());
    }

    #[test]
    fn unwind_to_releases_abandoned_frames() {
        let held = Frame::new(Arc::new(Code::new("held", &[])), None);
        let base = depth();
        let frame = Frame::new(code(), None);
        frame.set_local("a", Value::Frame(Arc::clone(&held))).unwrap();
        assert_eq!(held.header().count(), 2);

        let guard = ActiveFrame::enter(Arc::clone(&frame));
        std::mem::forget(guard);
        assert_eq!(unwind_to(base), 1);

        assert_eq!(depth(), base);
        assert_eq!(held.header().count(), 1);
        assert!(frame.locals().is_empty());
    }
}
