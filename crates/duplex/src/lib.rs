//! Transport-agnostic, symmetric, full-duplex RPC engine core.
//!
//! Two peer [`Controller`]s each expose callable functions and invoke the
//! peer's functions. The embedder supplies a message-send callback and feeds
//! received messages back through [`Controller::insert`] (or
//! [`Controller::insert_waitable`]); everything else — correlating calls to
//! results, passing functions and cancellation tokens across the boundary by
//! identifier, keeping both peers' object tables coherent under independent
//! collection, and streaming results — happens here.

mod controller;
mod dispatch;
mod invoke;
mod marshal;
mod message;
mod value;

pub use controller::{Controller, Delivery, Options, Registration};
pub use deferred::Deferred;
pub use message::{Descriptor, DescriptorKind, ErrorRecord, Kind, Message, WireValue};
pub use value::{Callable, Token, Value};

/// Errors raised by embedder callbacks, carried opaquely through the core.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("function '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Function '{0}' is not found")]
    NotFound(String),
    /// A failure raised by a target procedure, either locally or
    /// reconstructed from a peer's error message.
    #[error("{0}")]
    Failed(ErrorRecord),
    #[error("unexpected response to invocation of '{0}'")]
    UnexpectedResponse(String),
    #[error("invocation was cancelled")]
    Cancelled,
    #[error("Controller released")]
    Released,
    #[error("failed to send message to the peer")]
    Transport(#[source] BoxError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A procedure failure with the conventional "Error" name and the
    /// given message, as a peer will observe it.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(ErrorRecord {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        })
    }

    /// Convert this error into a transportable record. When `trace_from`
    /// names the local controller, a stack string (the record's own, or a
    /// freshly captured backtrace) is attached under a remote-origin
    /// trailer; otherwise any stack is stripped.
    pub(crate) fn to_record(&self, trace_from: Option<&str>) -> ErrorRecord {
        let mut record = match self {
            Error::Failed(record) => record.clone(),
            other => ErrorRecord {
                name: "Error".to_string(),
                message: other.to_string(),
                stack: None,
            },
        };
        record.stack = trace_from.map(|controller_id| {
            let stack = record
                .stack
                .take()
                .unwrap_or_else(|| std::backtrace::Backtrace::force_capture().to_string());
            format!("\n------- Remote stack trace [{controller_id}]:\n{stack}")
        });
        record
    }

    /// Reconstruct a caller-visible error from a peer's record.
    pub(crate) fn from_record(mut record: ErrorRecord, keep_stack: bool) -> Self {
        if !keep_stack {
            record.stack = None;
        }
        Error::Failed(record)
    }

    /// The record carried by a [`Error::Failed`], if that's what this is.
    pub fn as_record(&self) -> Option<&ErrorRecord> {
        match self {
            Error::Failed(record) => Some(record),
            _ => None,
        }
    }
}
