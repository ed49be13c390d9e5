//! Core identifier types for the effect engine.
//!
//! All IDs are lightweight Copy types using newtype pattern for type safety.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide unique identity of a declared effect.
///
/// Each `Effect::new` mints a fresh EffectId; equality is identity, never
/// structural. Handler clause tables are keyed by this token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EffectId(pub u64);

/// Unique identifier for captured continuations.
///
/// Purely diagnostic: continuations here are multi-shot, so no consumption
/// tracking hangs off this token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContId(pub u64);

// Global counters for ID generation
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl EffectId {
    /// Create a fresh unique EffectId.
    pub fn fresh() -> Self {
        EffectId(EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ContId {
    /// Create a fresh unique ContId.
    pub fn fresh() -> Self {
        ContId(CONT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}
