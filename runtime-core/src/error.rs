// runtime-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::system::data::SampleId;

#[derive(Error, Debug)]
pub enum RuntimeError {

    /// A non-blocking poll found no matching reply. Callers retry.
    #[error("no message yet")]
    NoMessageYet,

    #[error("timed out after {timeout_secs}s waiting for peer '{name}'")]
    TimeoutWaitingForPeer {
        name: String,
        timeout_secs: u64,
    },

    #[error("duplicate sample id {id} received from data workers")]
    DuplicateSampleId {
        id: SampleId,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Name resolve error at '{name}': {message}")]
    NameResolve {
        name: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Dataflow graph error: {message}")]
    Graph {
        message: String,
    },

    #[error("Sequence buffer error: {message}")]
    Buffer {
        message: String,
    },

    #[error("Redistribution error: {message}")]
    Redistribution {
        message: String,
    },

    #[error("Worker {handler} failed on '{operation}': {message}")]
    Worker {
        handler: String,
        operation: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// Convenience constructors
impl RuntimeError {

    pub fn timeout_waiting_for_peer(name: impl Into<String>, timeout_secs: u64) -> Self {
        Self::TimeoutWaitingForPeer {
            name: name.into(),
            timeout_secs,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn name_resolve(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NameResolve {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn name_resolve_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::NameResolve {
            name: path.into().display().to_string(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    pub fn buffer(message: impl Into<String>) -> Self {
        Self::Buffer {
            message: message.into(),
        }
    }

    pub fn redistribution(message: impl Into<String>) -> Self {
        Self::Redistribution {
            message: message.into(),
        }
    }

    pub fn worker(
        handler: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Worker {
            handler: handler.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// True for the expected "nothing arrived yet" outcome of a non-blocking poll.
    pub fn is_no_message(&self) -> bool {
        matches!(self, Self::NoMessageYet)
    }
}

impl From<bincode::Error> for RuntimeError {
    fn from(e: bincode::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
