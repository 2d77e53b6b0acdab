//! The unit of RPC exchanged between the coordinator and workers.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RuntimeError};

/// Identity of one model-parallel partition of a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub model_name: String,
    pub dp_rank: u32,
    pub tp_rank: u32,
    pub pp_rank: u32,
}

impl ShardId {
    pub fn new(model_name: impl Into<String>, dp_rank: u32, tp_rank: u32, pp_rank: u32) -> Self {
        Self {
            model_name: model_name.into(),
            dp_rank,
            tp_rank,
            pp_rank,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@dp{}tp{}pp{}",
            self.model_name, self.dp_rank, self.tp_rank, self.pp_rank
        )
    }
}

/// Addressable target of a request.
///
/// `Shard` and `Named` handlers go through the endpoint's routing table;
/// `Worker` addresses a worker channel by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handler {
    Shard(ShardId),
    Named(String),
    Worker(usize),
}

impl Handler {
    /// Conventional name of the data-source handler of data-parallel rank `dp_rank`.
    pub fn data(dp_rank: usize) -> Self {
        Self::Named(format!("__data{}__", dp_rank))
    }

    /// Data-parallel rank of a data-source handler.
    pub fn data_rank(&self) -> Option<usize> {
        match self {
            Self::Named(name) => name
                .strip_prefix("__data")
                .and_then(|s| s.strip_suffix("__"))
                .and_then(|s| s.parse().ok()),
            _ => None,
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shard(shard) => write!(f, "{}", shard),
            Self::Named(name) => f.write_str(name),
            Self::Worker(index) => write!(f, "worker#{}", index),
        }
    }
}

impl From<ShardId> for Handler {
    fn from(shard: ShardId) -> Self {
        Self::Shard(shard)
    }
}

impl From<&str> for Handler {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<usize> for Handler {
    fn from(index: usize) -> Self {
        Self::Worker(index)
    }
}

/// A named hook run by the worker before or after the main operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    pub data: Option<Vec<u8>>,
}

impl Hook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
        self.data = Some(encode(data)?);
        Ok(self)
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.data.as_deref().map(decode).transpose()
    }
}

/// Request or reply message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub handler: Handler,
    pub operation: String,

    pub request_id: Uuid,
    pub syn_reply_id: Uuid,
    pub ack_reply_id: Uuid,

    pub no_sync: bool,

    /// Set by `post`.
    pub send_time: Option<DateTime<Utc>>,

    /// Application data, bincode-encoded by the typed helpers.
    pub data: Option<Vec<u8>>,
    /// Failure reported by a worker in place of data.
    pub error: Option<String>,

    pub pre_hooks: Vec<Hook>,
    pub post_hooks: Vec<Hook>,
}

impl Payload {
    /// A new request with fresh correlation ids.
    pub fn new(handler: impl Into<Handler>, operation: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            operation: operation.into(),
            request_id: Uuid::new_v4(),
            syn_reply_id: Uuid::new_v4(),
            ack_reply_id: Uuid::new_v4(),
            no_sync: true,
            send_time: None,
            data: None,
            error: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// A reply echoing the request id of `request`.
    pub fn reply_to(request: &Payload) -> Self {
        Self::new(request.handler.clone(), request.operation.clone())
            .with_request_id(request.request_id)
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
        self.data = Some(encode(data)?);
        Ok(self)
    }

    pub fn with_raw_data(mut self, data: Option<Vec<u8>>) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn with_pre_hook(mut self, hook: Hook) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    pub fn with_post_hook(mut self, hook: Hook) -> Self {
        self.post_hooks.push(hook);
        self
    }

    /// Decode the application data, `None` if the payload carries none.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.data.as_deref().map(decode).transpose()
    }

    /// Turn a worker-reported failure into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(message) => Err(RuntimeError::worker(
                self.handler.to_string(),
                self.operation,
                message,
            )),
            None => Ok(self),
        }
    }
}

/// Encode application data.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode application data.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Exact-match filter over the request ids of received payloads.
#[derive(Debug, Clone, Default)]
pub struct ReplyPattern {
    ids: Option<HashSet<Uuid>>,
}

impl ReplyPattern {
    /// Matches every payload.
    pub fn any() -> Self {
        Self { ids: None }
    }

    /// Matches payloads whose request id is one of `ids`.
    pub fn exact(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
        }
    }

    pub fn matches(&self, request_id: &Uuid) -> bool {
        match &self.ids {
            None => true,
            Some(ids) => ids.contains(request_id),
        }
    }
}
