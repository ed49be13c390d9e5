//! Error types for the effect engine.

use crate::ids::EffectId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// Dispatch exhausted the handler chain without finding a clause for the
    /// effect. Raised synchronously at the raise site, before any stack
    /// switch.
    NoHandler { effect: EffectId },
    /// A new handler frame could not allocate its execution stack.
    StackAllocation { size: usize },
}

impl std::fmt::Display for EffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectError::NoHandler { effect } => {
                write!(f, "no handler for effect {}", effect.raw())
            }
            EffectError::StackAllocation { size } => {
                write!(f, "failed to allocate a {size}-byte execution stack")
            }
        }
    }
}

impl std::error::Error for EffectError {}

impl EffectError {
    pub fn no_handler(effect: EffectId) -> Self {
        EffectError::NoHandler { effect }
    }

    pub fn stack_allocation(size: usize) -> Self {
        EffectError::StackAllocation { size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EffectError::no_handler(EffectId(7));
        assert!(err.to_string().contains("no handler for effect 7"));

        let err = EffectError::stack_allocation(4096);
        assert!(err.to_string().contains("4096"));
    }
}
