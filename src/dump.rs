use std::fmt;

use rustc_hash::FxHashMap;

use crate::graph::{NodeIndex, Var};

enum Step {
  Open(NodeIndex, usize),
  Close(usize),
}

const INDENT: &str = "  ";

/// Render the node and everything below it as an indented tree
///
/// A node reached a second time (a shared operand) is printed as a reference to
/// the id it got on first visit instead of being expanded again, so the output
/// stays linear in the size of the graph.
///
/// ```text
/// - #0 [val=12 grad=1 op=mul] (
///   - #1 [val=6 grad=2 op=add] (
///     - #2 [val=4 grad=2 op=mul] (
///       - #3 [val=2 grad=16 op=leaf]
///       - #3 (shared)
///     )
///     - #3 (shared)
///   )
///   - #3 (shared)
/// )
/// ```
impl fmt::Display for Var<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let nodes = self.graph.nodes.borrow();
    let mut ids: FxHashMap<NodeIndex, usize> = FxHashMap::default();
    let mut stack = vec![Step::Open(self.index, 0)];

    while let Some(step) = stack.pop() {
      match step {
        Step::Open(index, depth) => {
          let indent = INDENT.repeat(depth);
          if let Some(id) = ids.get(&index) {
            writeln!(f, "{indent}- #{id} (shared)")?;
            continue;
          }
          let id = ids.len();
          ids.insert(index, id);

          let node = &nodes[index];
          write!(
            f,
            "{indent}- #{id} [val={} grad={} op={}]",
            node.value, node.gradient, node.op
          )?;
          if node.operands.is_empty() {
            writeln!(f)?;
          } else {
            writeln!(f, " (")?;
            stack.push(Step::Close(depth));
            for &operand in node.operands.iter().rev() {
              stack.push(Step::Open(operand, depth + 1));
            }
          }
        }
        Step::Close(depth) => writeln!(f, "{})", INDENT.repeat(depth))?,
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Var<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let node = self.node();
    f.debug_struct("Var")
      .field("index", &self.index)
      .field("value", &node.value)
      .field("gradient", &node.gradient)
      .field("op", &node.op)
      .finish()
  }
}

impl Var<'_> {
  /// Same as the `Display` output
  pub fn dump(&self) -> String {
    self.to_string()
  }
}
