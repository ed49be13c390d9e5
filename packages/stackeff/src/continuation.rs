//! Continuations: captured stack mirrors and their resumption.
//!
//! A capture walks the chain from the innermost frame down to (excluding)
//! the frame hosting the clause, unlinking each frame and taking a byte
//! mirror of its live stack region plus its saved machine context. The
//! mirrors are plain data on the heap, so a continuation can be cloned,
//! stored, and resumed any number of times; each resume copies the bytes
//! back and re-enters the suspension point.

use std::any::Any;
use std::marker::PhantomData;
use std::panic;
use std::ptr;
use std::rc::Rc;

use crate::frame::{self, HandlerFrame, SessionOutcome};
use crate::ids::ContId;
use crate::pointer::{PointerSnapshot, Tracked};
use crate::stack::Stack;

/// One captured frame: who it was, its stack bytes above the saved stack
/// pointer, the machine context to re-enter it, and the adopted reference
/// state of its tracked handles.
pub(crate) struct StackMirror {
    frame: Rc<HandlerFrame>,
    bytes: Vec<u8>,
    context: libc::ucontext_t,
    pointers: PointerSnapshot,
}

/// Heap record shared by all clones of one continuation. Mirrors are ordered
/// innermost first.
pub(crate) struct ContRecord {
    id: ContId,
    mirrors: Vec<StackMirror>,
    raise_slot: *mut Option<Box<dyn Any>>,
}

/// Untyped continuation handle. Tracked-backed so that instances living on
/// capturable stacks stay reference-correct across replays.
pub(crate) struct RawContinuation {
    record: Tracked<ContRecord>,
}

/// Capture every frame above `host` into a fresh continuation, leaving
/// `host` as the top of the chain. Runs on `host`'s stack before the clause.
pub(crate) fn capture(
    host: &Rc<HandlerFrame>,
    raise_slot: *mut Option<Box<dyn Any>>,
) -> RawContinuation {
    let mut mirrors = Vec::new();
    let mut cur = frame::current_top();
    while !Rc::ptr_eq(&cur, host) {
        let prev = cur
            .previous
            .borrow_mut()
            .take()
            .expect("capture walked past the chain root");
        let bytes = unsafe { cur.stack.snapshot_bytes() };
        let context = unsafe { cur.stack.snapshot_context() };
        // The suspended instances in those bytes no longer run destructors;
        // the snapshot adopts their references as-is.
        let pointers = PointerSnapshot::adopt(std::mem::take(&mut *cur.tracked.borrow_mut()));
        mirrors.push(StackMirror {
            frame: cur,
            bytes,
            context,
            pointers,
        });
        cur = prev;
    }
    frame::set_top(cur);

    let id = ContId::fresh();
    crate::eff_debug_log!(
        "captured continuation {} spanning {} frame(s)",
        id.raw(),
        mirrors.len()
    );
    RawContinuation {
        record: Tracked::new(ContRecord {
            id,
            mirrors,
            raise_slot,
        }),
    }
}

impl Clone for RawContinuation {
    fn clone(&self) -> Self {
        RawContinuation {
            record: self.record.clone(),
        }
    }
}

impl RawContinuation {
    /// Restore the mirrors onto the current chain, deliver `value` to the
    /// suspended raise, and run the replay to its next settlement.
    pub(crate) fn invoke(&self, value: Box<dyn Any>) -> SessionOutcome {
        let record: &ContRecord = self.record.get();
        assert!(
            !record.mirrors.is_empty(),
            "continuation captured no frames"
        );

        {
            let top = frame::current_top();
            for m in &record.mirrors {
                let active = Rc::ptr_eq(&m.frame, &top) || m.frame.previous.borrow().is_some();
                assert!(
                    !active,
                    "cannot resume a continuation whose frames are still running"
                );
            }
        }

        // This stack may itself be captured while the replay runs, so the
        // two handles needed after the switch are Tracked rather than Rcs.
        let host = Tracked::new(frame::current_top());
        {
            let mut below: Rc<HandlerFrame> = (*host).clone();
            // Relink and restore outermost first, finishing at the
            // innermost frame as the new chain top.
            for m in record.mirrors.iter().rev() {
                *m.frame.previous.borrow_mut() = Some(below.clone());
                *m.frame.tracked.borrow_mut() = m.pointers.restore_entries();
                unsafe { m.frame.stack.restore(&m.bytes, &m.context) };
                below = m.frame.clone();
            }
            frame::set_top(below);
        }

        // The restore overwrote the raise's slot with its captured (empty)
        // bytes; write the delivered value in on top of them.
        unsafe { ptr::write(record.raise_slot, Some(value)) };

        let outermost = Tracked::new(
            record
                .mirrors
                .last()
                .expect("continuation captured no frames")
                .frame
                .clone(),
        );
        crate::eff_debug_log!("resuming continuation {}", record.id.raw());

        let innermost_stack = &record.mirrors[0].frame.stack as *const Stack;
        let host_stack = &(*host).stack as *const Stack;
        unsafe { (*innermost_stack).switch_from(&*host_stack) };

        frame::drive(&*host, &*outermost)
    }
}

/// A suspended computation waiting for the value of one raised effect.
///
/// Handed to handler clauses. `resume` feeds a value to the suspended raise
/// and runs the computation until its session settles, returning that
/// session's result. Continuations are multi-shot: clone or resume the same
/// one as often as needed; dropping one without resuming discards the
/// captured frames and releases their tracked state.
pub struct Continuation<P: 'static, Out: 'static> {
    raw: RawContinuation,
    _marker: PhantomData<fn(P) -> Out>,
}

impl<P: 'static, Out: 'static> Continuation<P, Out> {
    pub(crate) fn from_raw(raw: RawContinuation) -> Self {
        Continuation {
            raw,
            _marker: PhantomData,
        }
    }

    /// Resume the suspended computation with `value`.
    ///
    /// Returns when the resumed session completes or a clause of a nested
    /// raise settles it. A panic that ended the replayed body resumes
    /// unwinding here.
    ///
    /// # Panics
    /// Panics if any captured frame is still running, which happens only
    /// when a clause resumes its own continuation while a previous resume
    /// of it is still in flight.
    pub fn resume(&self, value: P) -> Out {
        match self.raw.invoke(Box::new(value)) {
            Ok(out) => *out
                .downcast::<Out>()
                .expect("session outcome type mismatch"),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<P: 'static, Out: 'static> Clone for Continuation<P, Out> {
    fn clone(&self) -> Self {
        Continuation {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}
