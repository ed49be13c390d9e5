//! Handler construction: clause tables and the return transform.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::continuation::{Continuation, RawContinuation};
use crate::effect::Effect;
use crate::ids::EffectId;

/// Type-erased handler clause as stored in a frame's dispatch table. The
/// boxed argument and result cross the engine untyped; the typed wrapper
/// below restores both ends.
pub(crate) trait ErasedClause {
    fn call(&self, args: Box<dyn Any>, cont: RawContinuation) -> Box<dyn Any>;
}

struct BoundClause<A, R, Out, F> {
    clause: F,
    _marker: PhantomData<fn(A, R) -> Out>,
}

impl<A, R, Out, F> ErasedClause for BoundClause<A, R, Out, F>
where
    A: 'static,
    R: 'static,
    Out: 'static,
    F: Fn(A, Continuation<R, Out>) -> Out + 'static,
{
    fn call(&self, args: Box<dyn Any>, cont: RawContinuation) -> Box<dyn Any> {
        let args = args
            .downcast::<A>()
            .expect("effect raised with arguments of the wrong type");
        Box::new((self.clause)(*args, Continuation::from_raw(cont)))
    }
}

/// A reusable set of effect clauses plus a transform applied to the body's
/// natural result.
///
/// `In` is what the handled body returns, `Out` what the session produces.
/// The transform runs only on natural completion; a clause that settles the
/// session without resuming supplies the `Out` directly, untransformed.
///
/// Handlers are values and clone shallowly (the clause table shares its
/// closures). `handle` consumes one per session; clone it to run the same
/// handler in several sessions, nested or not.
pub struct Handler<In: 'static, Out: 'static> {
    pub(crate) clauses: HashMap<EffectId, Rc<dyn ErasedClause>>,
    pub(crate) transform: Rc<dyn Fn(In) -> Out>,
}

impl<T: 'static> Handler<T, T> {
    /// A handler with no clauses and the identity transform.
    pub fn new() -> Handler<T, T> {
        Handler {
            clauses: HashMap::new(),
            transform: Rc::new(|value| value),
        }
    }
}

impl<T: 'static> Default for Handler<T, T> {
    fn default() -> Self {
        Handler::new()
    }
}

impl<In: 'static, Out: 'static> Handler<In, Out> {
    /// A handler whose sessions map the body's natural result through
    /// `transform`.
    pub fn with_transform(transform: impl Fn(In) -> Out + 'static) -> Handler<In, Out> {
        Handler {
            clauses: HashMap::new(),
            transform: Rc::new(transform),
        }
    }

    /// Bind a clause for `effect`.
    ///
    /// The clause receives the raise's arguments and a continuation for the
    /// suspended computation; whatever it returns settles the session.
    ///
    /// # Panics
    /// Panics if this handler already has a clause for `effect`.
    pub fn on<A: 'static, R: 'static>(
        mut self,
        effect: &Effect<A, R>,
        clause: impl Fn(A, Continuation<R, Out>) -> Out + 'static,
    ) -> Handler<In, Out> {
        let replaced = self.clauses.insert(
            effect.id(),
            Rc::new(BoundClause {
                clause,
                _marker: PhantomData,
            }),
        );
        assert!(
            replaced.is_none(),
            "handler already has a clause for effect {}",
            effect.id().raw()
        );
        self
    }
}

impl<In: 'static, Out: 'static> Clone for Handler<In, Out> {
    fn clone(&self) -> Self {
        Handler {
            clauses: self.clauses.clone(),
            transform: self.transform.clone(),
        }
    }
}
