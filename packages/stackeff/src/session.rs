//! Running a body under a handler.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::error::EffectError;
use crate::frame::{self, SessionOutcome};
use crate::handler::Handler;

/// Run `body` in a fresh session under `handler`, on its own stack.
///
/// The session ends either when the body completes naturally, its result
/// mapped through the handler's transform, or when a clause settles it
/// without resuming. A panic in the body or transform is carried across the
/// stack switch and resumes unwinding here (or at whichever `resume` call
/// was driving the replay that panicked).
///
/// The handler is consumed: its clause table and transform move to the heap
/// before the session starts, so calling `handle` from inside another
/// session leaves no handler state on that session's stack for replays to
/// drop again. Handlers clone shallowly; clone one to run it in several
/// sessions.
///
/// The body is `FnMut` because a multi-shot clause replays its completion;
/// state it owns is shared across replays, and state on its stack that must
/// survive a raise belongs in a `Tracked` handle.
pub fn handle<In, Out, F>(handler: Handler<In, Out>, mut body: F) -> Result<Out, EffectError>
where
    In: 'static,
    Out: 'static,
    F: FnMut() -> In + 'static,
{
    let Handler { clauses, transform } = handler;
    let thunk = Box::new(move || -> SessionOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| (*transform)(body()))) {
            Ok(out) => Ok(Box::new(out) as Box<dyn Any>),
            Err(payload) => Err(payload),
        }
    });

    match frame::begin_session(clauses, thunk)? {
        Ok(out) => Ok(*out
            .downcast::<Out>()
            .expect("session outcome type mismatch")),
        Err(payload) => panic::resume_unwind(payload),
    }
}
