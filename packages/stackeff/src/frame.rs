//! Handler frames: the per-thread chain, session startup, and dispatch.
//!
//! Every `handle` call pushes a frame running its body on a private stack.
//! Frames link downward through `previous`; the thread-local `TOP` names the
//! innermost one. Raising an effect walks that chain for the owning clause,
//! parks a pending-dispatch record on the frame *below* the owner, and
//! switches into that frame's suspended driver. The driver captures every
//! frame above itself into a continuation and runs the clause on its own
//! stack, so the clause can resume the captured frames as many times as it
//! likes.
//!
//! Replay discipline: any code here that stays live across a stack switch on
//! a capturable stack may hold only `Copy` data or `Tracked` handles. An
//! owning local (`Rc`, `Box`) live across a suspension point would run its
//! destructor once per replay of the captured bytes.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::continuation;
use crate::error::EffectError;
use crate::handler::ErasedClause;
use crate::ids::EffectId;
use crate::pointer::{CountHeader, Tracked, TrackedEntry};
use crate::stack::Stack;

/// Panic payload carried out of a session body or clause.
pub(crate) type Failure = Box<dyn Any + Send>;

/// What a session produced: its boxed result, or the panic that ended it.
/// Panics are deferred here and re-raised at whichever call is waiting on
/// the session, never across a context switch.
pub(crate) type SessionOutcome = Result<Box<dyn Any>, Failure>;

/// Session body as stored in its frame. `FnMut` rather than `FnOnce`: a
/// multi-shot resume replays the body's completion, and a consumed-once
/// environment would be dropped once per replay.
pub(crate) type BodyFn = dyn FnMut() -> SessionOutcome;

/// Dispatch record parked on the frame below the clause owner while control
/// switches over to it.
pub(crate) struct PendingResume {
    pub(crate) effect: EffectId,
    pub(crate) clause: Rc<dyn ErasedClause>,
    pub(crate) args: Box<dyn Any>,
    /// Slot inside the raising frame where a resume deposits its value.
    /// Points into stack memory that the capture is about to mirror.
    pub(crate) raise_slot: *mut Option<Box<dyn Any>>,
}

/// One entry in the handler chain.
///
/// The root frame of a thread wraps the thread's own stack: no clauses, no
/// body, never captured. All other frames are session frames created by
/// `handle`.
pub(crate) struct HandlerFrame {
    pub(crate) stack: Stack,
    pub(crate) previous: RefCell<Option<Rc<HandlerFrame>>>,
    pub(crate) clauses: HashMap<EffectId, Rc<dyn ErasedClause>>,
    pub(crate) pending: RefCell<Option<PendingResume>>,
    /// Registry of `Tracked` instances living in this frame's stack memory.
    pub(crate) tracked: RefCell<Vec<TrackedEntry>>,
    pub(crate) result: RefCell<Option<SessionOutcome>>,
    body: RefCell<Option<Box<BodyFn>>>,
}

impl HandlerFrame {
    fn root() -> HandlerFrame {
        HandlerFrame {
            stack: Stack::current(),
            previous: RefCell::new(None),
            clauses: HashMap::new(),
            pending: RefCell::new(None),
            tracked: RefCell::new(Vec::new()),
            result: RefCell::new(None),
            body: RefCell::new(None),
        }
    }
}

thread_local! {
    static TOP: RefCell<Option<Rc<HandlerFrame>>> = const { RefCell::new(None) };
    /// Hand-off slot for the frame a freshly started stack should run;
    /// `makecontext` entry points take no arguments.
    static TRAMPOLINE_FRAME: Cell<*const HandlerFrame> = const { Cell::new(ptr::null()) };
}

/// Innermost frame of this thread's chain, creating the root lazily.
pub(crate) fn current_top() -> Rc<HandlerFrame> {
    TOP.with(|top| {
        let mut top = top.borrow_mut();
        if top.is_none() {
            *top = Some(Rc::new(HandlerFrame::root()));
        }
        top.clone().expect("chain root just initialized")
    })
}

pub(crate) fn set_top(frame: Rc<HandlerFrame>) {
    TOP.with(|top| *top.borrow_mut() = Some(frame));
}

/// Record a `Tracked` instance with the frame whose stack contains it.
/// Returns false when no frame does (heap or root-stack handles).
pub(crate) fn register_handle(addr: usize, header: NonNull<CountHeader>) -> bool {
    TOP.with(|top| {
        let mut cur = top.borrow().clone();
        while let Some(frame) = cur {
            if frame.stack.contains(addr) {
                frame.tracked.borrow_mut().push(TrackedEntry { addr, header });
                return true;
            }
            let prev = frame.previous.borrow().clone();
            cur = prev;
        }
        false
    })
}

/// Remove a registration made by `register_handle`.
///
/// Matching is by header, preferring the exact address within the frame
/// containing the handle: a handle moved within its own frame still
/// unregisters cleanly. A handle that left its origin stack (moved into a
/// box, or into another frame) is looked up across the whole chain: the
/// entry must go before this drop releases the reference, or a later
/// capture would adopt a reference that no longer exists.
pub(crate) fn unregister_handle(addr: usize, header: NonNull<CountHeader>) {
    TOP.with(|top| {
        let mut cur = top.borrow().clone();
        while let Some(frame) = cur {
            if frame.stack.contains(addr) {
                let mut registry = frame.tracked.borrow_mut();
                if let Some(i) = registry
                    .iter()
                    .position(|e| e.addr == addr && e.header == header)
                {
                    registry.swap_remove(i);
                    return;
                }
                if let Some(i) = registry.iter().position(|e| e.header == header) {
                    registry.swap_remove(i);
                    return;
                }
                // Moved into this frame from elsewhere; the entry is in
                // whichever frame registered it.
                break;
            }
            let prev = frame.previous.borrow().clone();
            cur = prev;
        }

        let mut cur = top.borrow().clone();
        while let Some(frame) = cur {
            {
                let mut registry = frame.tracked.borrow_mut();
                if let Some(i) = registry.iter().position(|e| e.header == header) {
                    registry.swap_remove(i);
                    return;
                }
            }
            let prev = frame.previous.borrow().clone();
            cur = prev;
        }
        crate::eff_debug_log!(
            "tracked handle at {addr:#x} dropped with no registration anywhere in the chain"
        );
    });
}

/// Push a session frame, run `body` on its own stack, and return the
/// session's outcome once it completes or a clause settles it.
pub(crate) fn begin_session(
    clauses: HashMap<EffectId, Rc<dyn ErasedClause>>,
    body: Box<BodyFn>,
) -> Result<SessionOutcome, EffectError> {
    let stack = Stack::allocate()?;

    // These two handles survive the switch below, and this stack may itself
    // be captured while the session runs. Tracked keeps their counts honest
    // across replays.
    let cur = Tracked::new(current_top());
    let frame = Tracked::new(Rc::new(HandlerFrame {
        stack,
        previous: RefCell::new(Some((*cur).clone())),
        clauses,
        pending: RefCell::new(None),
        tracked: RefCell::new(Vec::new()),
        result: RefCell::new(None),
        body: RefCell::new(Some(body)),
    }));
    set_top((*frame).clone());
    TRAMPOLINE_FRAME.with(|slot| slot.set(Rc::as_ptr(&*frame)));

    let frame_stack = &(*frame).stack as *const Stack;
    let cur_stack = &(*cur).stack as *const Stack;
    // Control comes back here when the session completes or raises.
    unsafe { (*frame_stack).start(&*cur_stack, frame_trampoline) };

    Ok(drive(&*cur, &*frame))
}

/// Woken driver step, shared by `begin_session` and continuation resumes.
///
/// A pending record on `host` means a clause owned by `awaiting` matched a
/// raise: capture everything above `host` and run the clause here, its
/// result settling the awaited session. No pending record means `awaiting`
/// ran to completion; consume its stored outcome.
pub(crate) fn drive(host: &Rc<HandlerFrame>, awaiting: &Rc<HandlerFrame>) -> SessionOutcome {
    let taken = host.pending.borrow_mut().take();
    match taken {
        Some(p) => {
            let cont = continuation::capture(host, p.raise_slot);
            crate::eff_debug_log!("dispatching effect {} to its clause", p.effect.raw());
            // The clause may suspend this stack; keep its closure alive
            // through a Tracked rather than a bare Rc local.
            let clause = Tracked::new(p.clause);
            let args = p.args;
            panic::catch_unwind(AssertUnwindSafe(|| clause.call(args, cont)))
        }
        None => awaiting
            .result
            .borrow_mut()
            .take()
            .expect("awaited session ended without an outcome"),
    }
}

/// Find the owning clause for `effect`, park a dispatch record below it, and
/// switch into that frame's driver. Returns once some resume delivers a
/// value into this raise's slot.
pub(crate) fn raise_erased(
    effect: EffectId,
    args: Box<dyn Any>,
) -> Result<Box<dyn Any>, EffectError> {
    let mut slot: Option<Box<dyn Any>> = None;
    let slot_ptr: *mut Option<Box<dyn Any>> = &mut slot;

    // Resolve the owner and park the record; every Rc temporary dies inside
    // this block, before the stack below can be mirrored.
    let (below_stack, cur_stack): (*const Stack, *const Stack) = {
        let top = current_top();
        let mut walk = Some(top.clone());
        let mut found: Option<(Rc<HandlerFrame>, Rc<dyn ErasedClause>)> = None;
        while let Some(frame) = walk {
            if let Some(clause) = frame.clauses.get(&effect) {
                found = Some((frame.clone(), clause.clone()));
                break;
            }
            let prev = frame.previous.borrow().clone();
            walk = prev;
        }
        let (owner, clause) = match found {
            Some(hit) => hit,
            // No switch has happened: the chain is untouched and usable.
            None => return Err(EffectError::no_handler(effect)),
        };
        let below = owner
            .previous
            .borrow()
            .clone()
            .expect("clause owner has no frame below it");
        *below.pending.borrow_mut() = Some(PendingResume {
            effect,
            clause,
            args,
            raise_slot: slot_ptr,
        });
        (&below.stack as *const Stack, &top.stack as *const Stack)
    };

    // Raw pointers only across the switch; both stacks are kept alive by
    // their frames' chain and mirror references.
    unsafe { (*below_stack).switch_from(&*cur_stack) };

    // A resume wrote the value through slot_ptr before switching back in.
    Ok(slot.take().expect("raise resumed without a value"))
}

extern "C" fn frame_trampoline() {
    unsafe { run_frame() }
}

/// Entry point of every session stack. Never returns: completion hands
/// control to the driver below with a one-way switch.
///
/// The completion path replays once per resume of a continuation that spans
/// this frame, so it holds no owning locals: the body runs through a raw
/// pointer, the outcome moves straight into heap storage, and the previous
/// frame moves into the chain slot.
unsafe fn run_frame() -> ! {
    let frame: *const HandlerFrame = TRAMPOLINE_FRAME.with(|slot| slot.replace(ptr::null()));
    let frame = &*frame;
    let body: *mut BodyFn = {
        let mut body = frame.body.borrow_mut();
        match body.as_mut() {
            Some(b) => &mut **b as *mut BodyFn,
            None => unreachable!("session stack started without a body"),
        }
    };

    let outcome = (*body)();
    *frame.result.borrow_mut() = Some(outcome);

    {
        let leaked = frame.tracked.borrow();
        if !leaked.is_empty() {
            crate::eff_debug_log!(
                "session completed with {} tracked handle(s) still registered",
                leaked.len()
            );
        }
    }

    let prev = frame
        .previous
        .borrow_mut()
        .take()
        .expect("session frame completed without a frame below");
    let prev_stack: *const Stack = &prev.stack;
    set_top(prev);
    (*prev_stack).enter()
}
