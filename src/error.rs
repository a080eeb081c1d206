//! Error types for the simulator components.
//!
//! Each component has its own enum; binaries wrap them with `anyhow`.
use crate::record::{FieldKind, Method};
use std::path::PathBuf;
use thiserror::Error;

/// A record that does not fit the schema of its method.
///
/// Met during replay these are logged and skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("{method}: expected {expected} fields, got {got}")]
    Arity { method: Method, expected: usize, got: usize },

    #[error("{method}: field {index} should be {expected:?}, got {got:?}")]
    Kind { method: Method, index: usize, expected: FieldKind, got: FieldKind },

    #[error("cannot parse {value:?} as {kind:?}")]
    BadField { value: String, kind: FieldKind },

    #[error("truncated line: {line:?}")]
    Truncated { line: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    /// The resource behind a source is missing or unreadable.
    #[error("cannot open {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("data source {resource} failed")]
    Generation {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("data source {0} has no sink; register it with an endpoint first")]
    NoSink(String),

    #[error("sink of data source {0} is closed")]
    SinkClosed(String),

    #[error("data source {0} already ran")]
    AlreadyRun(String),
}

/// Fatal for the endpoint that hit it.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("cannot dispatch {method}: {source}")]
    Arguments {
        method: Method,
        #[source]
        source: RecordError,
    },

    #[error("listener failed in {method}: {reason}")]
    Listener { method: Method, reason: String },
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode record")]
    Encode(#[from] bincode::Error),

    /// The frame length of the log format cannot describe this record.
    #[error("encoded record is {size} bytes; this log format holds at most {limit}")]
    RecordTooLarge { size: usize, limit: usize },

    /// A string field would break the line layout of a CSV log.
    #[error("{method} record has a string field with a comma or line break")]
    NotCsv { method: crate::record::Method },

    #[error("{path} is not an event log container: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error("unknown log extension for {0}")]
    UnknownFormat(PathBuf),
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io { path: path.into(), source }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue {0} already started")]
    AlreadyStarted(String),

    #[error("cannot spawn consumer thread for {0}")]
    Spawn(String),
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("endpoint {0} has no listener; call create() first")]
    NotReady(String),

    #[error("endpoint {0} is already dispatching")]
    AlreadyRunning(String),

    #[error("cannot spawn dispatch thread for {id}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}
