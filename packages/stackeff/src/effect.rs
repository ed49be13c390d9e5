//! Typed effect declarations.

use std::marker::PhantomData;

use crate::error::EffectError;
use crate::frame;
use crate::ids::EffectId;

/// A declared effect taking `A` and producing `R` at each raise.
///
/// Dispatch is by identity: two effects declared with the same argument and
/// result types are still distinct, and a handler clause matches only the
/// exact effect it was bound to. `Effect` is `Copy`, so it moves freely into
/// body and clause closures.
pub struct Effect<A: 'static, R: 'static> {
    id: EffectId,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A: 'static, R: 'static> Effect<A, R> {
    /// Declare a fresh effect with its own identity.
    pub fn new() -> Self {
        Effect {
            id: EffectId::fresh(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    /// Raise this effect, suspending the current computation until some
    /// clause resumes it with an `R`.
    ///
    /// Fails with `NoHandler` when no enclosing handler has a clause for
    /// this effect; the failure is synchronous and the computation simply
    /// continues.
    pub fn raise(&self, args: A) -> Result<R, EffectError> {
        let value = frame::raise_erased(self.id, Box::new(args))?;
        Ok(*value
            .downcast::<R>()
            .expect("resume delivered a value of the wrong type"))
    }
}

impl<A: 'static, R: 'static> Default for Effect<A, R> {
    fn default() -> Self {
        Effect::new()
    }
}

impl<A: 'static, R: 'static> Clone for Effect<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: 'static, R: 'static> Copy for Effect<A, R> {}

impl<A: 'static, R: 'static> std::fmt::Debug for Effect<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Effect").field(&self.id.raw()).finish()
    }
}
