use std::cell::{Ref, RefCell};
use std::ops::{Add, BitXor, Mul, Neg, Sub};
use std::ptr;

use log::trace;
use smallvec::{smallvec, SmallVec};

use crate::error::{GradError, Result};
use crate::op::OpKind;

pub(crate) type NodeIndex = usize;

/// Operands of a node, never more than two
pub(crate) type Operands = SmallVec<[NodeIndex; 2]>;

/// One scalar in the graph
///
/// `op` and `operands` are frozen at construction; only `value` (forward
/// re-evaluation, `Var::set_value`) and `gradient` (engine passes) ever change.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
  pub(crate) value: f64,
  pub(crate) gradient: f64,
  pub(crate) op: OpKind,
  pub(crate) operands: Operands,
}

/// Knobs for a `Graph`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphConfig {
  /// `inverse` refuses operands with `|x| < inverse_epsilon`
  pub inverse_epsilon: f64,
  /// Number of nodes to preallocate
  pub capacity: usize,
}

impl GraphConfig {
  pub fn with_inverse_epsilon(mut self, inverse_epsilon: f64) -> Self {
    self.inverse_epsilon = inverse_epsilon;
    self
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }
}

impl Default for GraphConfig {
  fn default() -> Self {
    Self {
      inverse_epsilon: 1e-4,
      capacity: 0,
    }
  }
}

/// An append-only arena of nodes
///
/// Nodes only ever reference nodes pushed before them, so the arena is a DAG in
/// topological order of creation... handles (`Var`) borrow the graph, and the
/// whole thing is reclaimed at once when the graph is dropped or cleared.
#[derive(Debug, Default)]
pub struct Graph {
  config: GraphConfig,
  pub(crate) nodes: RefCell<Vec<Node>>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_config(config: GraphConfig) -> Self {
    Self {
      config,
      nodes: RefCell::new(Vec::with_capacity(config.capacity)),
    }
  }

  #[inline]
  pub fn config(&self) -> &GraphConfig {
    &self.config
  }

  /// Create an input node with no operands and a zero gradient
  #[inline]
  pub fn leaf(&self, value: f64) -> Var<'_> {
    let index = self.push(Node {
      value,
      gradient: 0.0,
      op: OpKind::Leaf,
      operands: SmallVec::new(),
    });
    Var { index, graph: self }
  }

  /// One leaf per value, in order
  pub fn leaves(&self, values: &[f64]) -> Vec<Var<'_>> {
    values.iter().map(|&v| self.leaf(v)).collect()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.nodes.borrow().len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.nodes.borrow().is_empty()
  }

  /// Drop every node at once
  ///
  /// Taking `&mut self` guarantees no `Var` into this graph is still alive.
  pub fn clear(&mut self) {
    self.nodes.get_mut().clear();
  }

  #[inline]
  fn push(&self, node: Node) -> NodeIndex {
    let mut nodes = self.nodes.borrow_mut();
    let index = nodes.len();
    trace!("alloc node {index} ({})", node.op);
    nodes.push(node);
    index
  }

  /// Allocate the result of `op` over already existing operands
  fn apply(&self, op: OpKind, operands: Operands) -> NodeIndex {
    let value = {
      let nodes = self.nodes.borrow();
      let values: SmallVec<[f64; 2]> = operands.iter().map(|&i| nodes[i].value).collect();
      op.forward(&values).unwrap_or_default()
    };
    self.push(Node {
      value,
      gradient: 0.0,
      op,
      operands,
    })
  }
}

/// A handle to one node of a `Graph`
///
/// Handles are `Copy`; they are only ever a node index plus the graph they
/// index into, and cannot outlive that graph.
#[derive(Clone, Copy)]
pub struct Var<'g> {
  pub(crate) index: NodeIndex,
  pub(crate) graph: &'g Graph,
}

impl<'g> Var<'g> {
  #[inline]
  pub(crate) fn node(&self) -> Ref<'g, Node> {
    let index = self.index;
    Ref::map(self.graph.nodes.borrow(), move |nodes| &nodes[index])
  }

  #[inline]
  pub fn value(&self) -> f64 {
    self.node().value
  }

  #[inline]
  pub fn gradient(&self) -> f64 {
    self.node().gradient
  }

  /// Overwrite the value in place
  ///
  /// Consumers are not recomputed until `forward_reevaluate` runs on a root
  /// above this node; setting a non-leaf is allowed but the next re-evaluation
  /// will overwrite it.
  #[inline]
  pub fn set_value(&self, value: f64) {
    self.graph.nodes.borrow_mut()[self.index].value = value;
  }

  #[inline]
  pub fn op(&self) -> OpKind {
    self.node().op
  }

  #[inline]
  pub fn is_leaf(&self) -> bool {
    self.op() == OpKind::Leaf
  }

  /// Handles to the operands, in order
  pub fn operands(&self) -> Vec<Var<'g>> {
    self
      .node()
      .operands
      .iter()
      .map(|&index| Var {
        index,
        graph: self.graph,
      })
      .collect()
  }

  #[inline]
  fn unary(&self, op: OpKind) -> Self {
    Var {
      index: self.graph.apply(op, smallvec![self.index]),
      graph: self.graph,
    }
  }

  #[inline]
  fn binary(&self, other: &Self, op: OpKind) -> Self {
    debug_assert!(
      ptr::eq(self.graph, other.graph),
      "operands belong to different graphs"
    );
    Var {
      index: self.graph.apply(op, smallvec![self.index, other.index]),
      graph: self.graph,
    }
  }

  #[inline]
  pub fn add_f64(&self, other: f64) -> Self {
    self.binary(&self.graph.leaf(other), OpKind::Add)
  }

  #[inline]
  pub fn mul_f64(&self, other: f64) -> Self {
    self.binary(&self.graph.leaf(other), OpKind::Mul)
  }

  /// `1 / self`, refused when `self` is within `inverse_epsilon` of zero
  ///
  /// No node is allocated on failure.
  pub fn inverse(&self) -> Result<Self> {
    let value = self.value();
    let epsilon = self.graph.config.inverse_epsilon;
    if value.abs() < epsilon {
      return Err(GradError::InvalidOperand {
        op: OpKind::Inverse.label(),
        value,
        epsilon,
      });
    }
    Ok(self.unary(OpKind::Inverse))
  }

  /// `self * other^-1`, fails exactly when `other.inverse()` does
  pub fn try_div(&self, other: &Self) -> Result<Self> {
    Ok(self.binary(&other.inverse()?, OpKind::Mul))
  }

  #[inline]
  pub fn relu(&self) -> Self {
    self.unary(OpKind::Relu)
  }

  #[inline]
  pub fn exp(&self) -> Self {
    self.unary(OpKind::Exp)
  }

  #[inline]
  pub fn tanh(&self) -> Self {
    self.unary(OpKind::Tanh)
  }

  /// `self^k` for a constant `k`; the exponent is stored as its own leaf
  #[inline]
  pub fn pow(&self, k: f64) -> Self {
    self.binary(&self.graph.leaf(k), OpKind::Pow)
  }

  /// `self^k` where `k` is an existing node
  ///
  /// Only a leaf is accepted as exponent, and it is treated as a constant: it
  /// receives no gradient. A computed exponent has no rule here and is rejected.
  pub fn pow_var(&self, k: &Self) -> Result<Self> {
    if !k.is_leaf() {
      return Err(GradError::UnsupportedGradientRule {
        op: OpKind::Pow.label(),
        reason: "exponent must be a leaf",
      });
    }
    Ok(self.binary(k, OpKind::Pow))
  }
}

impl<'g> Add for &Var<'g> {
  type Output = Var<'g>;

  #[inline]
  fn add(self, other: Self) -> Self::Output {
    self.binary(other, OpKind::Add)
  }
}

impl<'g> Add<f64> for &Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn add(self, other: f64) -> Self::Output {
    self.add_f64(other)
  }
}

impl<'g> Add for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn add(self, other: Self) -> Self::Output {
    (&self).add(&other)
  }
}

impl<'g> Add<&Var<'g>> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn add(self, other: &Var<'g>) -> Self::Output {
    (&self).add(other)
  }
}

impl<'g> Add<f64> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn add(self, other: f64) -> Self::Output {
    self.add_f64(other)
  }
}

impl<'g> Neg for &Var<'g> {
  type Output = Var<'g>;

  #[inline]
  fn neg(self) -> Self::Output {
    self.unary(OpKind::Neg)
  }
}

impl<'g> Neg for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn neg(self) -> Self::Output {
    (&self).neg()
  }
}

/// Subtraction has no tag of its own, it is `a + (-b)`
impl<'g> Sub for &Var<'g> {
  type Output = Var<'g>;

  #[inline]
  fn sub(self, other: Self) -> Self::Output {
    self.add(&other.neg())
  }
}

impl<'g> Sub<f64> for &Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn sub(self, other: f64) -> Self::Output {
    self.add_f64(-other)
  }
}

impl<'g> Sub for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn sub(self, other: Self) -> Self::Output {
    (&self).sub(&other)
  }
}

impl<'g> Sub<&Var<'g>> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn sub(self, other: &Var<'g>) -> Self::Output {
    (&self).sub(other)
  }
}

impl<'g> Sub<f64> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn sub(self, other: f64) -> Self::Output {
    (&self).sub(other)
  }
}

impl<'g> Mul for &Var<'g> {
  type Output = Var<'g>;

  #[inline]
  fn mul(self, other: Self) -> Self::Output {
    self.binary(other, OpKind::Mul)
  }
}

impl<'g> Mul<f64> for &Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn mul(self, other: f64) -> Self::Output {
    self.mul_f64(other)
  }
}

impl<'g> Mul for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn mul(self, other: Self) -> Self::Output {
    (&self).mul(&other)
  }
}

impl<'g> Mul<&Var<'g>> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn mul(self, other: &Var<'g>) -> Self::Output {
    (&self).mul(other)
  }
}

impl<'g> Mul<f64> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn mul(self, other: f64) -> Self::Output {
    self.mul_f64(other)
  }
}

/// `^` is a constant power, same as `Var::pow`
impl<'g> BitXor<f64> for &Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn bitxor(self, k: f64) -> Self::Output {
    self.pow(k)
  }
}

impl<'g> BitXor<f64> for Var<'g> {
  type Output = Var<'g>;

  #[inline(always)]
  fn bitxor(self, k: f64) -> Self::Output {
    self.pow(k)
  }
}
