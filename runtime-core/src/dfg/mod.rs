//! Dataflow graph of model function calls (MFCs).
//!
//! Nodes live in an arena indexed by [`NodeId`]. Edges are derived from data
//! keys: a node depends on whichever node produces one of its input keys.
//! Keys nobody produces are loaded from the dataset.

mod graph;

pub use graph::{DataflowGraph, MfcDef, MfcNode, NodeId};
