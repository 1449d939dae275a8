// pixfetch-net/src/operation.rs
//! Per-fetch state and the handle given back to callers.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use pixfetch_common::error::{FetchError, Result};
use pixfetch_common::{FetchProgress, FetchResponse, ImageRequest, OutgoingRequest, ResponseMetadata};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::adapter::{DataTask, TaskError, TaskResult};
use crate::validation::ResponseValidator;

/// Receives `(bytes received, bytes expected)` updates for one fetch.
pub type ProgressHandler = Arc<dyn Fn(FetchProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FetchState::Pending)
    }

    fn of(result: &Result<FetchResponse>) -> Self {
        match result {
            Ok(_) => FetchState::Succeeded,
            Err(FetchError::Cancelled) => FetchState::Cancelled,
            Err(_) => FetchState::Failed,
        }
    }
}

struct Inner {
    state: FetchState,
    cancel_requested: bool,
    received: u64,
    expected: Option<u64>,
    body: BytesMut,
    task: Option<Arc<dyn DataTask>>,
    validator: Option<Box<dyn ResponseValidator>>,
    progress: Option<ProgressHandler>,
    result_tx: Option<oneshot::Sender<Result<FetchResponse>>>,
}

/// One in-flight fetch, from issue to terminal state.
pub(crate) struct OperationState {
    id: OperationId,
    request: ImageRequest,
    outgoing: OutgoingRequest,
    inner: Mutex<Inner>,
    // Serializes delivery of progress and completion to the caller.
    delivery: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OperationState {
    pub(crate) fn new(
        id: OperationId,
        request: ImageRequest,
        outgoing: OutgoingRequest,
        validator: Option<Box<dyn ResponseValidator>>,
        progress: Option<ProgressHandler>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<FetchResponse>>) {
        let (result_tx, result_rx) = oneshot::channel();
        let state = Arc::new(Self {
            id,
            request,
            outgoing,
            inner: Mutex::new(Inner {
                state: FetchState::Pending,
                cancel_requested: false,
                received: 0,
                expected: None,
                body: BytesMut::new(),
                task: None,
                validator,
                progress,
                result_tx: Some(result_tx),
            }),
            delivery: Mutex::new(()),
        });
        (state, result_rx)
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    /// Binds the task created for this operation. Returns `false` when the
    /// operation already finished while the task was being created, in which
    /// case the task must not be resumed.
    pub(crate) fn attach_task(&self, task: &Arc<dyn DataTask>) -> bool {
        let cancel_now = {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                return false;
            }
            inner.task = Some(Arc::clone(task));
            inner.cancel_requested
        };
        if cancel_now {
            debug!("[{}] Cancel: forwarding request made during task creation", self.id);
            task.cancel();
        }
        true
    }

    pub(crate) fn state(&self) -> FetchState {
        lock(&self.inner).state
    }

    /// Signals the task. The terminal state arrives through `complete`.
    pub(crate) fn cancel(&self) {
        let task = {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() || inner.cancel_requested {
                trace!("[{}] Cancel: nothing to do ({:?})", self.id, inner.state);
                return;
            }
            inner.cancel_requested = true;
            inner.task.clone()
        };
        debug!("[{}] Cancel: signalling task for {}", self.id, self.outgoing.url);
        if let Some(task) = task {
            task.cancel();
        }
    }

    pub(crate) fn record_progress(&self, chunk: Bytes, received: u64, expected: Option<u64>) {
        let _delivery = lock(&self.delivery);
        let (handler, progress) = {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() || inner.cancel_requested {
                trace!("[{}] Progress: dropped after cancel or completion", self.id);
                return;
            }
            inner.body.extend_from_slice(&chunk);
            if received < inner.received {
                warn!(
                    "[{}] Progress: transport reported {} bytes after {}, not relaying",
                    self.id, received, inner.received
                );
                return;
            }
            inner.received = received;
            inner.expected = expected;
            (
                inner.progress.clone(),
                FetchProgress {
                    completed: received,
                    total: expected,
                },
            )
        };
        if let Some(handler) = handler {
            handler(progress);
        }
    }

    /// Resolves the operation. `on_terminal` runs once the terminal state is
    /// set and before the result reaches the caller. Returns `false` if the
    /// operation was already terminal.
    pub(crate) fn complete(&self, result: TaskResult, on_terminal: impl FnOnce()) -> bool {
        let delivery = lock(&self.delivery);

        let (body, validator) = {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                trace!("[{}] Completion: ignored, already {:?}", self.id, inner.state);
                return false;
            }
            (inner.body.split().freeze(), inner.validator.take())
        };

        let outcome = match result {
            Err(TaskError::Cancelled) => Err(FetchError::Cancelled),
            Err(TaskError::Transport(cause)) => Err(FetchError::Transport(cause)),
            Ok(response) => self.evaluate(response, body, validator),
        };

        let (tx, released) = {
            let mut inner = lock(&self.inner);
            let outcome = if inner.cancel_requested {
                Err(FetchError::Cancelled)
            } else {
                outcome
            };
            inner.state = FetchState::of(&outcome);
            let released = (inner.task.take(), inner.progress.take());
            match &outcome {
                Ok(resp) => debug!(
                    "[{}] Completion: {} bytes from {}",
                    self.id,
                    resp.data.len(),
                    self.outgoing.url
                ),
                Err(e) => debug!("[{}] Completion: {} ({})", self.id, e, self.outgoing.url),
            }
            (inner.result_tx.take().map(|tx| (tx, outcome)), released)
        };

        on_terminal();
        if let Some((tx, outcome)) = tx {
            if tx.send(outcome).is_err() {
                trace!("[{}] Completion: caller no longer waiting", self.id);
            }
        }
        drop(delivery);
        // Task and handler are dropped with no lock held.
        drop(released);
        true
    }

    fn evaluate(
        &self,
        response: ResponseMetadata,
        body: Bytes,
        validator: Option<Box<dyn ResponseValidator>>,
    ) -> Result<FetchResponse> {
        if body.is_empty() {
            return if response.permits_empty_body() {
                Ok(FetchResponse {
                    data: body,
                    response,
                })
            } else {
                Err(FetchError::EmptyResponse(response.url.to_string()))
            };
        }
        if let Some(validator) = validator {
            if let Err(reason) = validator.validate(&response, &body) {
                debug!("[{}] Validation: rejected: {}", self.id, reason);
                return Err(FetchError::Validation(reason));
            }
        }
        Ok(FetchResponse {
            data: body,
            response,
        })
    }
}

/// Caller's handle to an issued fetch.
pub struct FetchOperation {
    state: Arc<OperationState>,
    result_rx: oneshot::Receiver<Result<FetchResponse>>,
}

impl FetchOperation {
    pub(crate) fn new(
        state: Arc<OperationState>,
        result_rx: oneshot::Receiver<Result<FetchResponse>>,
    ) -> Self {
        Self { state, result_rx }
    }

    pub fn id(&self) -> OperationId {
        self.state.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.state.request
    }

    /// The request as it was handed to the session adapter.
    pub fn outgoing_request(&self) -> &OutgoingRequest {
        &self.state.outgoing
    }

    pub fn state(&self) -> FetchState {
        self.state.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Same as cancelling through the fetcher.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Waits for the terminal result.
    pub async fn result(self) -> Result<FetchResponse> {
        let FetchOperation { state, result_rx } = self;
        drop(state);
        match result_rx.await {
            Ok(result) => result,
            // Operation state dropped without a result.
            Err(_) => Err(FetchError::Cancelled),
        }
    }
}

impl fmt::Debug for FetchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOperation")
            .field("id", &self.state.id)
            .field("url", &self.state.outgoing.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}
