use bit_set::BitSet;
use log::{debug, warn};
use smallvec::SmallVec;

use crate::graph::{Node, NodeIndex, Var};
use crate::op::OpKind;

/// Topologically sort the subgraph below `root`, moving along operand edges
///
/// Every reachable node shows up exactly once, after all of its operands... so
/// walking the result forwards evaluates operands before consumers, and walking
/// it backwards finalizes a node only once every consumer has contributed to it.
pub(crate) fn topological_order(nodes: &[Node], root: NodeIndex) -> Vec<NodeIndex> {
  let mut stack = Vec::with_capacity(64);
  let mut order = Vec::new();
  let mut visited = BitSet::with_capacity(nodes.len());

  stack.push((root, false));

  while let Some((index, operands_done)) = stack.pop() {
    if operands_done {
      order.push(index);
    } else if visited.insert(index) {
      // marker to emit the node after its operands
      stack.push((index, true));
      // pushed in reverse so operand 0 is explored first
      for &operand in nodes[index].operands.iter().rev() {
        if !visited.contains(operand) {
          stack.push((operand, false));
        }
      }
    }
  }

  order
}

fn operand_values(nodes: &[Node], node: &Node) -> SmallVec<[f64; 2]> {
  node.operands.iter().map(|&i| nodes[i].value).collect()
}

fn reset(nodes: &mut [Node], order: &[NodeIndex]) {
  for &index in order {
    nodes[index].gradient = 0.0;
  }
}

/// Apply every node's pullback in reverse topological order
fn propagate(nodes: &mut [Node], order: &[NodeIndex]) {
  for &index in order.iter().rev() {
    let node = &nodes[index];
    if node.op == OpKind::Leaf {
      continue;
    }
    let values = operand_values(nodes, node);
    let grads = node.op.pullback(&values, node.value, node.gradient);
    let operands = node.operands.clone();
    for (operand, grad) in operands.into_iter().zip(grads) {
      nodes[operand].gradient += grad;
    }
  }
}

/// Recompute every non-leaf value, operands first
fn evaluate(nodes: &mut [Node], order: &[NodeIndex]) {
  for &index in order {
    let node = &nodes[index];
    let values = operand_values(nodes, node);
    if let Some(value) = node.op.forward(&values) {
      if !value.is_finite() && values.iter().all(|v| v.is_finite()) {
        warn!(
          "node {index} ({}) re-evaluated to {value} from {values:?}",
          node.op
        );
      }
      nodes[index].value = value;
    }
  }
}

/// The gradient engine, driven from whichever node is the root
///
/// `run` is the entry point; the individual steps are exposed for inspection.
impl<'g> Var<'g> {
  /// Zero the gradient of every node reachable from this one
  pub fn reset_gradients(&self) {
    let mut nodes = self.graph.nodes.borrow_mut();
    let order = topological_order(&nodes, self.index);
    reset(&mut nodes, &order);
  }

  /// d(self)/d(self) = 1
  pub fn seed(&self) {
    self.graph.nodes.borrow_mut()[self.index].gradient = 1.0;
  }

  /// Distribute this node's current gradient down to everything it depends on
  ///
  /// Accumulates on top of whatever gradients are already stored; call
  /// `reset_gradients` and `seed` first (or just `run`).
  pub fn backpropagate(&self) {
    let mut nodes = self.graph.nodes.borrow_mut();
    let order = topological_order(&nodes, self.index);
    debug!("backpropagate from node {} over {} nodes", self.index, order.len());
    propagate(&mut nodes, &order);
  }

  /// Compute d(self)/dx for every node x reachable from self
  ///
  /// Running twice without changing the graph yields identical gradients.
  pub fn run(&self) {
    let mut nodes = self.graph.nodes.borrow_mut();
    let order = topological_order(&nodes, self.index);
    debug!("run from node {} over {} nodes", self.index, order.len());
    reset(&mut nodes, &order);
    nodes[self.index].gradient = 1.0;
    propagate(&mut nodes, &order);
  }

  /// Recompute values below (and including) this node after leaves changed
  ///
  /// Never fails: an `inverse` whose operand drifted to zero evaluates to an
  /// infinity and is reported through `warn!`.
  pub fn forward_reevaluate(&self) {
    let mut nodes = self.graph.nodes.borrow_mut();
    let order = topological_order(&nodes, self.index);
    debug!("forward re-evaluation from node {} over {} nodes", self.index, order.len());
    evaluate(&mut nodes, &order);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use approx::assert_relative_eq;

  use crate::graph::Graph;

  fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
  }

  mod order {
    use super::*;

    #[test]
    fn operands_before_consumers() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = &a * &a;
      let c = &b + &a;
      let d = &c * &a;
      let nodes = graph.nodes.borrow();
      let order = topological_order(&nodes, d.index);
      assert_eq!(order.len(), 4);
      let position = |i: NodeIndex| order.iter().position(|&x| x == i).unwrap();
      for &index in &order {
        for &operand in &nodes[index].operands {
          assert!(position(operand) < position(index));
        }
      }
      assert_eq!(*order.last().unwrap(), d.index);
    }

    #[test]
    fn only_reachable() {
      let graph = Graph::new();
      let a = graph.leaf(1.0);
      let b = graph.leaf(2.0);
      let _unrelated = &b * &b;
      let c = -a;
      let nodes = graph.nodes.borrow();
      assert_eq!(topological_order(&nodes, c.index), vec![a.index, c.index]);
    }

    #[test]
    fn deep_chain() {
      // would blow a recursive traversal's stack
      let graph = Graph::new();
      let x = graph.leaf(1.0);
      let mut y = x;
      for _ in 0..200_000 {
        y = -y;
      }
      y.run();
      assert_eq!(x.gradient(), 1.0);
      y.forward_reevaluate();
      assert_eq!(y.value(), 1.0);
    }
  }

  mod run {
    use super::*;

    #[test]
    fn leaf_is_its_own_derivative() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      a.run();
      assert_eq!(a.gradient(), 1.0);
      assert_eq!(b.gradient(), 0.0);
    }

    #[test]
    fn add() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      let c = a + b;
      c.run();
      assert_eq!(c.gradient(), 1.0);
      assert_eq!(a.gradient(), 1.0);
      assert_eq!(b.gradient(), 1.0);
    }

    #[test]
    fn mul() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      let c = a * b;
      c.run();
      // df/da = b
      // df/db = a
      assert_eq!(a.gradient(), 3.0);
      assert_eq!(b.gradient(), 2.0);
    }

    #[test]
    fn sub() {
      let graph = Graph::new();
      let a = graph.leaf(7.0);
      let b = graph.leaf(4.0);
      let c = a - b;
      c.run();
      assert_eq!(a.gradient(), 1.0);
      assert_eq!(b.gradient(), -1.0);
    }

    #[test]
    fn self_mul() {
      let graph = Graph::new();
      let a = graph.leaf(3.0);
      let b = a * a;
      b.run();
      // 2a
      assert_eq!(a.gradient(), 6.0);
    }

    #[test]
    fn shared_leaf_chain() {
      init();
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a * a;
      let c = b + a;
      let d = c * a;
      assert_eq!(b.value(), 4.0);
      assert_eq!(c.value(), 6.0);
      assert_eq!(d.value(), 12.0);
      d.run();
      // d = a^3 + a^2, dd/da = 3a^2 + 2a
      assert_eq!(a.gradient(), 16.0);
      assert_eq!(b.gradient(), 2.0);
      assert_eq!(c.gradient(), 2.0);
    }

    #[test]
    fn diamond() {
      let graph = Graph::new();
      let a = graph.leaf(1.0);
      let a2 = -a;
      let b = graph.leaf(3.0);
      let c = graph.leaf(5.0);
      let ab = a2 + b;
      let ac = a2 + c;
      let abac = ab * ac;
      abac.run();
      // (b - a)(c - a)
      assert_eq!(a.gradient(), -(4.0 + 2.0));
      assert_eq!(b.gradient(), 4.0);
      assert_eq!(c.gradient(), 2.0);
      assert_eq!(a2.gradient(), 6.0);
    }

    #[test]
    fn pow() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a ^ 3.0;
      b.run();
      assert_eq!(a.gradient(), 3.0 * 4.0);
      // the exponent is a constant
      assert_eq!(b.operands()[1].gradient(), 0.0);
    }

    #[test]
    fn inverse() {
      let graph = Graph::new();
      let a = graph.leaf(1.3);
      let b = a.inverse().unwrap();
      b.run();
      assert_relative_eq!(a.gradient(), -1.0 / (1.3 * 1.3), epsilon = 1e-12);
    }

    #[test]
    fn div() {
      let graph = Graph::new();
      let a = graph.leaf(6.0);
      let b = graph.leaf(3.0);
      let c = a.try_div(&b).unwrap();
      c.run();
      assert_relative_eq!(a.gradient(), 1.0 / 3.0, epsilon = 1e-12);
      assert_relative_eq!(b.gradient(), -6.0 / 9.0, epsilon = 1e-12);
    }

    #[test]
    fn relu() {
      let graph = Graph::new();
      let pos = graph.leaf(2.0);
      let neg = graph.leaf(-2.0);
      let zero = graph.leaf(0.0);
      let y = pos.relu() + neg.relu() + zero.relu();
      y.run();
      assert_eq!(pos.gradient(), 1.0);
      assert_eq!(neg.gradient(), 0.0);
      assert_eq!(zero.gradient(), 0.0);
    }

    #[test]
    fn exp_tanh() {
      let graph = Graph::new();
      let a = graph.leaf(0.5);
      let y = a.exp() + a.tanh();
      y.run();
      let expected = 0.5f64.exp() + 1.0 - 0.5f64.tanh().powi(2);
      assert_relative_eq!(a.gradient(), expected, epsilon = 1e-12);
    }

    #[test]
    fn idempotent() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(-1.5);
      let y = ((&a * &b) + &a).relu() + (a ^ 2.0) * b;
      y.run();
      let first = (a.gradient(), b.gradient(), y.gradient());
      y.run();
      let second = (a.gradient(), b.gradient(), y.gradient());
      assert_eq!(first, second);
    }

    #[test]
    fn only_subgraph_is_touched() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      let y = &a * &b;
      let z = &b + 1.0;
      y.run();
      z.run();
      // y's pass left a alone when z ran
      assert_eq!(a.gradient(), 3.0);
      assert_eq!(b.gradient(), 1.0);
    }
  }

  mod steps {
    use super::*;

    #[test]
    fn manual_steps_match_run() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let d = ((a * a) + a) * a;
      d.reset_gradients();
      d.seed();
      d.backpropagate();
      assert_eq!(a.gradient(), 16.0);
    }

    #[test]
    fn reset_zeroes_reachable() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a * a;
      b.run();
      assert_eq!(a.gradient(), 4.0);
      b.reset_gradients();
      assert_eq!(a.gradient(), 0.0);
      assert_eq!(b.gradient(), 0.0);
    }

    #[test]
    fn backpropagate_accumulates() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      let c = a * b;
      c.run();
      // without a reset the second pass adds on top
      c.backpropagate();
      assert_eq!(a.gradient(), 6.0);
      assert_eq!(b.gradient(), 4.0);
    }

    #[test]
    fn single_rule() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(-2.0);
      let ra = a.relu();
      let rb = b.relu();
      ra.seed();
      ra.backpropagate();
      rb.seed();
      rb.backpropagate();
      assert_eq!(a.gradient(), 1.0);
      assert_eq!(b.gradient(), 0.0);
    }
  }

  mod forward {
    use super::*;

    #[test]
    fn follows_leaf_mutation() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a * a;
      let c = b + a;
      let d = c * a;
      for x in [-3.0, 0.5, 4.0, 10.0] {
        a.set_value(x);
        d.forward_reevaluate();
        assert_relative_eq!(d.value(), x * x * x + x * x);
        assert_relative_eq!(c.value(), x * x + x);
      }
    }

    #[test]
    fn every_op() {
      let graph = Graph::new();
      let x = graph.leaf(1.5);
      let y = graph.leaf(-0.5);
      let f = |x: f64, y: f64| (x * y).max(0.0) + (x + y).exp() + (-x).tanh() + x.powf(3.0) + 1.0 / x;
      let out = (&x * &y).relu() + (&x + &y).exp() + (-x).tanh() + (x ^ 3.0) + x.inverse().unwrap();
      assert_relative_eq!(out.value(), f(1.5, -0.5), epsilon = 1e-12);
      x.set_value(2.5);
      y.set_value(0.75);
      out.forward_reevaluate();
      assert_relative_eq!(out.value(), f(2.5, 0.75), epsilon = 1e-12);
    }

    #[test]
    fn then_run() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = graph.leaf(3.0);
      let c = a * b;
      a.set_value(5.0);
      c.forward_reevaluate();
      c.run();
      assert_eq!(c.value(), 15.0);
      assert_eq!(b.gradient(), 5.0);
    }

    #[test]
    fn inverse_drifting_to_zero() {
      init();
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a.inverse().unwrap();
      a.set_value(0.0);
      b.forward_reevaluate();
      assert!(b.value().is_infinite());
    }

    #[test]
    fn leaves_untouched() {
      let graph = Graph::new();
      let a = graph.leaf(2.0);
      let b = a ^ 2.0;
      b.forward_reevaluate();
      assert_eq!(a.value(), 2.0);
      assert_eq!(b.value(), 4.0);
    }
  }
}
