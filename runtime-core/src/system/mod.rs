//! Coordinator-side execution of the dataflow graph, and the worker loop
//! that answers it.

mod buffer;
mod control;
pub mod data;
mod function_call;
mod function_executor;
mod redistributor;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BufferBatch, SequenceBuffer};
pub use control::{CompletionCounter, ControlState, RpcControl};
pub use data::{DataBatchMeta, DataTransferPlan, MfcRequest, SampleId, SampleMeta};
pub use function_call::{split_ids, ModelFunctionCall, DATA_TRANSFER};
pub use function_executor::{FunctionExecutor, StepPhase};
pub use redistributor::{GlobalStorageTracker, RedistribPlanner, RedistribStep};
pub use worker::{serve_once, RequestHandler, WorkerServer};
