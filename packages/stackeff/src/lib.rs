//! stackeff: resumable, multi-shot effect handlers over real execution
//! stacks.
//!
//! Effectful code runs unchanged as ordinary functions; raising an effect
//! physically switches stacks to the owning handler clause, and the clause
//! receives a continuation backed by byte-for-byte mirrors of the suspended
//! frames. No CPS transform, no generators: a continuation resumes by
//! copying the mirrors back in place, so it can be resumed any number of
//! times.
//!
//! # Architecture
//!
//! - **Chain of handler frames**: one private guard-paged stack per
//!   `handle` call, linked downward, thread-local top
//! - **Identity dispatch**: clause tables keyed by `EffectId`, innermost
//!   handler wins
//! - **Mirror-based continuations**: captured stack bytes plus saved
//!   machine context, multi-shot by construction
//! - **Tracked handles**: reference counts that stay honest when stacks are
//!   abandoned, copied, and replayed
//!
//! x86_64 Linux only.

mod continuation;
mod effect;
pub mod error;
mod frame;
mod handler;
pub mod ids;
mod logging;
mod pointer;
mod session;
mod stack;

pub use continuation::Continuation;
pub use effect::Effect;
pub use error::EffectError;
pub use handler::Handler;
pub use ids::{ContId, EffectId};
pub use pointer::Tracked;
pub use session::handle;
