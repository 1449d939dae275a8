// pixfetch-net/src/adapter.rs
//! The seam between the fetcher and whatever executes network exchanges.
//!
//! A [`SessionAdapter`] turns an [`OutgoingRequest`] plus two callbacks into a
//! [`DataTask`]. The fetcher only ever starts and cancels tasks; everything the
//! transport learns is reported back through the callbacks given at creation.
use std::sync::Arc;

use bytes::Bytes;
use pixfetch_common::error::TransportCause;
use pixfetch_common::{OutgoingRequest, ResponseMetadata};
use thiserror::Error;

/// Called for every chunk received: `(chunk, bytes_received, bytes_expected)`.
///
/// `bytes_received` is cumulative. `bytes_expected` is `None` when the
/// transport does not know the body length.
pub type ProgressCallback = Box<dyn Fn(Bytes, u64, Option<u64>) + Send + Sync>;

/// Called exactly once when the exchange ends.
pub type CompletionCallback = Box<dyn FnOnce(TaskResult) + Send>;

pub type TaskResult = std::result::Result<ResponseMetadata, TaskError>;

/// Why a task ended without a response.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Transport(TransportCause),
}

impl TaskError {
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Transport(Arc::new(err))
    }

    pub fn message(msg: impl Into<String>) -> Self {
        TaskError::Transport(Arc::new(std::io::Error::other(msg.into())))
    }
}

/// Handle to one network exchange.
pub trait DataTask: Send + Sync {
    /// Starts the exchange. Callbacks must not fire from inside this call.
    fn resume(&self);

    /// Signals cancellation. The completion callback follows later with
    /// [`TaskError::Cancelled`] (or whatever result was already on its way),
    /// never from inside this call.
    fn cancel(&self);
}

/// Produces tasks bound to the given callbacks.
///
/// Adapters should report through the callbacks only after the task is
/// resumed. One that calls them from inside `data_task` is tolerated: the
/// operation resolves normally and the returned task is never resumed.
/// Dropping the completion callback without calling it resolves the
/// operation with a transport error.
pub trait SessionAdapter: Send + Sync {
    fn data_task(
        &self,
        request: OutgoingRequest,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Arc<dyn DataTask>;
}
