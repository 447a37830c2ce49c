use thiserror::Error;

/// Everything that can go wrong while building a graph
///
/// Traversals never fail, so every variant originates from a constructor (or
/// from a consumer validating its inputs before construction)...
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradError {
  /// The operand lies in a region the operation refuses, e.g. `inverse` of ~0
  #[error("invalid operand for {op}: {value} is within {epsilon} of zero")]
  InvalidOperand {
    op: &'static str,
    value: f64,
    epsilon: f64,
  },

  /// Number of supplied inputs does not match the expected arity
  #[error("shape mismatch: expected {expected} inputs, got {actual}")]
  ShapeMismatch { expected: usize, actual: usize },

  /// No analytic gradient exists for the requested construction
  #[error("unsupported gradient rule for {op}: {reason}")]
  UnsupportedGradientRule {
    op: &'static str,
    reason: &'static str,
  },
}

pub type Result<T, E = GradError> = std::result::Result<T, E>;

/// Check an input count before any node gets allocated
///
/// ```
/// use valgrad::{ensure_arity, GradError};
///
/// assert!(ensure_arity(3, 3).is_ok());
/// assert_eq!(
///   ensure_arity(3, 2),
///   Err(GradError::ShapeMismatch { expected: 3, actual: 2 })
/// );
/// ```
pub fn ensure_arity(expected: usize, actual: usize) -> Result<()> {
  if expected == actual {
    Ok(())
  } else {
    Err(GradError::ShapeMismatch { expected, actual })
  }
}
