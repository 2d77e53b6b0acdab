// runtime-core/src/lib.rs

//! Distributed Training Runtime - Control Plane
//!
//! This crate provides the coordinator side of a dataflow-graph training
//! system: a request-reply transport to workers, a name-resolve service for
//! rendezvous, sample bookkeeping, and the executor that drives every model
//! function call of the graph once per step.

pub mod config;
pub mod error;
pub mod retry;

// Re-export commonly used types for convenience
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};

pub mod name_resolve;
pub use name_resolve::{FileNameResolver, MemoryNameResolver, NameResolver};

pub mod transport;
pub use transport::{CoordinatorEndpoint, Handler, Payload, ReplyPattern, ShardId, WorkerEndpoint};

pub mod dfg;
pub use dfg::{DataflowGraph, MfcDef, MfcNode};

pub mod system;
pub use system::{FunctionExecutor, RequestHandler, SampleId, SequenceBuffer, WorkerServer};
