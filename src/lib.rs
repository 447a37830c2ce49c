//!
//! # valgrad
//!
//! Reverse-mode automatic differentiation over scalars.
//!
//! A [`Graph`] is an append-only arena of nodes; every arithmetic operation on a
//! [`Var`] handle pushes one new node recording its operation and operands.
//! Calling [`Var::run`] on an output then fills in d(output)/d(node) for every
//! node it depends on.
//!
//! ```
//! use valgrad::Graph;
//!
//! let graph = Graph::new();
//! let a = graph.leaf(2.0);
//! let b = a * a;
//! let c = b + a;
//! let d = c * a;
//! d.run();
//! assert_eq!(d.value(), 12.0);
//! // d = a^3 + a^2
//! assert_eq!(a.gradient(), 16.0);
//!
//! // mutate an input and recompute without rebuilding
//! a.set_value(3.0);
//! d.forward_reevaluate();
//! assert_eq!(d.value(), 36.0);
//! ```
//!
//! ## Ordering
//!
//! Nodes may be shared by many consumers. Both engine passes walk one
//! topological order of the subgraph under the root (built iteratively, each
//! node once), forwards for re-evaluation and backwards for gradients, so a
//! shared node only propagates after all of its consumers contributed to it.
//!

mod dump;
mod engine;
mod error;
mod graph;
mod op;

pub use error::{ensure_arity, GradError, Result};
pub use graph::{Graph, GraphConfig, Var};
pub use op::OpKind;
