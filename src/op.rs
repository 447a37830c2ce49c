use std::fmt;

use smallvec::{smallvec, SmallVec};

/// Contributions a node hands to each of its operands, in operand order
pub(crate) type Contributions = SmallVec<[f64; 2]>;

/// The operation that produced a node
///
/// Each tag owns a forward rule (recompute the value from operand values) and a
/// pullback rule (split the node's gradient across its operands)... keeping both
/// in one exhaustive match means a new tag cannot be added without a gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
  /// An input; no operands, no rule
  Leaf,
  Add,
  Mul,
  Neg,
  /// Power with a constant exponent, operands are `[base, exponent leaf]`
  Pow,
  Inverse,
  Relu,
  Exp,
  Tanh,
}

impl OpKind {
  /// Number of operands a node of this kind holds
  #[inline]
  pub fn arity(self) -> usize {
    match self {
      OpKind::Leaf => 0,
      OpKind::Neg | OpKind::Inverse | OpKind::Relu | OpKind::Exp | OpKind::Tanh => 1,
      OpKind::Add | OpKind::Mul | OpKind::Pow => 2,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      OpKind::Leaf => "leaf",
      OpKind::Add => "add",
      OpKind::Mul => "mul",
      OpKind::Neg => "neg",
      OpKind::Pow => "pow",
      OpKind::Inverse => "inverse",
      OpKind::Relu => "relu",
      OpKind::Exp => "exp",
      OpKind::Tanh => "tanh",
    }
  }

  /// Recompute a value from the current operand values
  ///
  /// Leaves have no rule, the caller keeps whatever value the leaf holds...
  #[inline]
  pub(crate) fn forward(self, operands: &[f64]) -> Option<f64> {
    debug_assert_eq!(operands.len(), self.arity());
    let value = match self {
      OpKind::Leaf => return None,
      OpKind::Add => operands[0] + operands[1],
      OpKind::Mul => operands[0] * operands[1],
      OpKind::Neg => -operands[0],
      OpKind::Pow => operands[0].powf(operands[1]),
      OpKind::Inverse => 1.0 / operands[0],
      OpKind::Relu => operands[0].max(0.0),
      OpKind::Exp => operands[0].exp(),
      OpKind::Tanh => operands[0].tanh(),
    };
    Some(value)
  }

  /// Split `upstream` (the node's own gradient) across its operands
  ///
  /// `operands` are the operand values and `out` is the node's value, both read
  /// at the time of the backward pass.
  ///
  /// The exponent of `Pow` is a constant by construction and explicitly gets a
  /// zero contribution.
  #[inline]
  pub(crate) fn pullback(self, operands: &[f64], out: f64, upstream: f64) -> Contributions {
    debug_assert_eq!(operands.len(), self.arity());
    match self {
      OpKind::Leaf => SmallVec::new(),
      OpKind::Add => smallvec![upstream, upstream],
      OpKind::Mul => smallvec![operands[1] * upstream, operands[0] * upstream],
      OpKind::Neg => smallvec![-upstream],
      OpKind::Pow => {
        let (base, k) = (operands[0], operands[1]);
        smallvec![k * base.powf(k - 1.0) * upstream, 0.0]
      }
      // d/dx(1/x) = -1/x^2 = -out^2
      OpKind::Inverse => smallvec![-(out * out) * upstream],
      // subgradient is 0 at the kink
      OpKind::Relu => smallvec![if out > 0.0 { upstream } else { 0.0 }],
      OpKind::Exp => smallvec![out * upstream],
      OpKind::Tanh => smallvec![(1.0 - out * out) * upstream],
    }
  }
}

impl fmt::Display for OpKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}
