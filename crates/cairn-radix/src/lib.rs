//! Immutable radix tree for the Cairn store.
//!
//! A [`Tree`] is a persistent, path-compressed prefix tree mapping byte-string
//! keys to values. Every mutation returns a new tree that shares all untouched
//! subtrees with the previous one; a tree that has been handed out never
//! changes, so it can be read from any number of threads without locks.
//!
//! # Key Types
//!
//! - [`Tree`] -- a published, immutable version of the tree
//! - [`Txn`] -- a batch of mutations that produces the next version
//! - [`Iter`] -- ordered, restartable iteration over a tree
//! - [`Watch`] -- a one-shot signal closed when a node is superseded
//!
//! # Design Rules
//!
//! 1. Nodes reachable from a published tree are never mutated.
//! 2. A batch mutates in place only the nodes it created itself.
//! 3. Iteration order is byte-lexicographic on the full key.
//! 4. Superseding a node closes its watch, so readers waiting on a prefix
//!    wake up when anything under that prefix changes.

mod iter;
mod node;
mod tree;
mod txn;
mod watch;

pub use iter::Iter;
pub use tree::Tree;
pub use txn::Txn;
pub use watch::Watch;
