//! Sample metadata and the request bodies exchanged with workers.

use serde::{Deserialize, Serialize};

use crate::system::redistributor::RedistribStep;

/// Globally unique sample identifier assigned by the data sources.
pub type SampleId = u64;

/// Metadata of one sample. The tensors themselves stay on the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMeta {
    pub id: SampleId,
    /// Keys the sample carries when it enters the buffer.
    pub keys: Vec<String>,
}

impl SampleMeta {
    pub fn new<I, S>(id: SampleId, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Body of a `fetch` reply from a data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBatchMeta {
    pub dp_rank: usize,
    pub samples: Vec<SampleMeta>,
    /// Set on the last batch of a dataset epoch.
    #[serde(default)]
    pub is_final_batch: bool,
}

/// Body of a model function call request sent to each shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfcRequest {
    /// Graph node issuing the call.
    pub node: String,
    /// Samples assigned to the receiving shard's data-parallel rank.
    pub ids: Vec<SampleId>,
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
}

/// Data of the `data_transfer` pre-hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransferPlan {
    pub steps: Vec<RedistribStep>,
}

impl DataTransferPlan {
    /// Steps the given worker takes part in, as source or destination.
    pub fn steps_for(&self, worker: usize) -> impl Iterator<Item = &RedistribStep> {
        self.steps
            .iter()
            .filter(move |s| s.src == worker || s.dst == worker)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
