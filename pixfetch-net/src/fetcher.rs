// pixfetch-net/src/fetcher.rs
//! The URL image fetcher.
//!
//! A fetch runs through fixed steps: the scheme is checked against the
//! supported set, the default outgoing request is built and offered to the
//! request customizer, the validator factory is asked for a validator, and
//! the session adapter produces a task bound to this operation's callbacks.
//! The task is registered before it is resumed and unregistered once the
//! operation reaches a terminal state.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use pixfetch_common::config::Config;
use pixfetch_common::error::{FetchError, Result};
use pixfetch_common::{ImageRequest, OutgoingRequest};
use tracing::{debug, trace, warn};

use crate::adapter::{CompletionCallback, ProgressCallback, SessionAdapter, TaskError, TaskResult};
use crate::customizer::RequestCustomizer;
use crate::operation::{FetchOperation, OperationId, OperationState, ProgressHandler};
use crate::session::HttpSession;
use crate::validation::{validate_scheme, ResponseValidatorFactory};

/// What an image pipeline needs from a fetcher.
pub trait ImageFetching: Send + Sync {
    /// Whether `fetch` would accept the request right now.
    fn can_handle_request(&self, request: &ImageRequest) -> bool;

    /// Whether two requests would produce the same network exchange.
    fn is_request_fetch_equivalent(&self, a: &ImageRequest, b: &ImageRequest) -> bool;

    /// Issues a fetch. With an adapter that reports only after `resume`,
    /// returns before any callback fires. Unsupported schemes fail here
    /// without creating a task.
    fn fetch(
        &self,
        request: &ImageRequest,
        progress: Option<ProgressHandler>,
    ) -> Result<FetchOperation>;

    /// Requests cancellation. Idempotent.
    fn cancel(&self, id: OperationId);
}

enum AdapterRef {
    Owned(Arc<dyn SessionAdapter>),
    External(Weak<dyn SessionAdapter>),
}

impl AdapterRef {
    fn get(&self) -> Result<Arc<dyn SessionAdapter>> {
        match self {
            AdapterRef::Owned(adapter) => Ok(Arc::clone(adapter)),
            AdapterRef::External(adapter) => adapter.upgrade().ok_or(FetchError::SessionUnavailable),
        }
    }
}

struct Shared {
    adapter: AdapterRef,
    config: Config,
    supported_schemes: RwLock<Arc<BTreeSet<String>>>,
    customizer: RwLock<Option<Weak<dyn RequestCustomizer>>>,
    validator_factory: RwLock<Option<Weak<dyn ResponseValidatorFactory>>>,
    registry: Mutex<HashMap<OperationId, Arc<OperationState>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<OperationId, Arc<OperationState>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, id: OperationId) {
        if self.registry().remove(&id).is_some() {
            trace!("[{}] Registry: removed", id);
        }
    }
}

/// Resolves its operation exactly once: when the transport reports back, or
/// when the transport drops the callback without ever calling it.
struct CompletionGuard {
    state: Arc<OperationState>,
    shared: Weak<Shared>,
    fired: bool,
}

impl CompletionGuard {
    fn resolve(&mut self, result: TaskResult) {
        self.fired = true;
        let id = self.state.id();
        let shared = &self.shared;
        self.state.complete(result, || {
            if let Some(shared) = shared.upgrade() {
                shared.unregister(id);
            }
        });
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.fired {
            warn!("[{}] Completion: task dropped without completing", self.state.id());
            self.resolve(Err(TaskError::message("task dropped without completing")));
        }
    }
}

/// Fetches image data for `http`, `https`, `ftp`, `file` and `data` URLs.
///
/// Delegate hooks are held weakly: the fetcher never keeps a customizer,
/// validator factory or external adapter alive past the call that uses it.
pub struct UrlImageFetcher {
    shared: Arc<Shared>,
}

impl UrlImageFetcher {
    /// Fetcher with its own reqwest session built from `config`.
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let session = HttpSession::new(&config)?;
        Ok(Self::build(AdapterRef::Owned(Arc::new(session)), config))
    }

    /// Fetcher driving a caller-managed session through `adapter`.
    ///
    /// Only a weak reference is kept; once the caller drops the adapter,
    /// new fetches fail with `SessionUnavailable`.
    pub fn with_session_adapter<A>(adapter: &Arc<A>, config: Config) -> Self
    where
        A: SessionAdapter + 'static,
    {
        let weak: Weak<dyn SessionAdapter> = Arc::downgrade(adapter) as Weak<dyn SessionAdapter>;
        Self::build(AdapterRef::External(weak), config)
    }

    fn build(adapter: AdapterRef, config: Config) -> Self {
        let schemes = Arc::new(config.supported_schemes.clone());
        Self {
            shared: Arc::new(Shared {
                adapter,
                config,
                supported_schemes: RwLock::new(schemes),
                customizer: RwLock::new(None),
                validator_factory: RwLock::new(None),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn supported_schemes(&self) -> BTreeSet<String> {
        self.schemes_snapshot().as_ref().clone()
    }

    /// Applies to fetches issued after this call only.
    pub fn set_supported_schemes<I, S>(&self, schemes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let schemes: BTreeSet<String> = schemes
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .collect();
        debug!("Supported schemes set to {:?}", schemes);
        *self
            .shared
            .supported_schemes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(schemes);
    }

    pub fn set_request_customizer<C>(&self, customizer: &Arc<C>)
    where
        C: RequestCustomizer + 'static,
    {
        let weak: Weak<dyn RequestCustomizer> = Arc::downgrade(customizer) as Weak<dyn RequestCustomizer>;
        *self
            .shared
            .customizer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
    }

    pub fn clear_request_customizer(&self) {
        *self
            .shared
            .customizer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_validator_factory<F>(&self, factory: &Arc<F>)
    where
        F: ResponseValidatorFactory + 'static,
    {
        let weak: Weak<dyn ResponseValidatorFactory> =
            Arc::downgrade(factory) as Weak<dyn ResponseValidatorFactory>;
        *self
            .shared
            .validator_factory
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
    }

    pub fn clear_validator_factory(&self) {
        *self
            .shared
            .validator_factory
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of operations that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.shared.registry().len()
    }

    /// Cancels every operation still in flight.
    pub fn cancel_all(&self) {
        let pending: Vec<Arc<OperationState>> = self.shared.registry().values().cloned().collect();
        debug!("Cancelling {} in-flight operations", pending.len());
        for operation in pending {
            operation.cancel();
        }
    }

    fn schemes_snapshot(&self) -> Arc<BTreeSet<String>> {
        Arc::clone(
            &self
                .shared
                .supported_schemes
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn customizer(&self) -> Option<Arc<dyn RequestCustomizer>> {
        self.shared
            .customizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn validator_factory(&self) -> Option<Arc<dyn ResponseValidatorFactory>> {
        self.shared
            .validator_factory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn default_outgoing_request(&self, request: &ImageRequest) -> Result<OutgoingRequest> {
        let cache_policy = request
            .cache_policy()
            .unwrap_or(self.shared.config.default_cache_policy);
        Ok(OutgoingRequest::new(request.url()?).with_cache_policy(cache_policy))
    }
}

impl ImageFetching for UrlImageFetcher {
    fn can_handle_request(&self, request: &ImageRequest) -> bool {
        request
            .url()
            .is_ok_and(|url| self.schemes_snapshot().contains(url.scheme()))
    }

    fn is_request_fetch_equivalent(&self, a: &ImageRequest, b: &ImageRequest) -> bool {
        match (self.default_outgoing_request(a), self.default_outgoing_request(b)) {
            (Ok(a), Ok(b)) => a.url == b.url && a.cache_policy == b.cache_policy,
            _ => false,
        }
    }

    fn fetch(
        &self,
        request: &ImageRequest,
        progress: Option<ProgressHandler>,
    ) -> Result<FetchOperation> {
        let url = request.url()?;
        validate_scheme(&url, &self.schemes_snapshot())?;
        let adapter = self.shared.adapter.get()?;

        let mut outgoing = self.default_outgoing_request(request)?;
        if let Some(customizer) = self.customizer() {
            outgoing = customizer.customize(request, outgoing);
            trace!("Customized request for {}: {}", request.resource, outgoing.url);
        }
        let validator = self
            .validator_factory()
            .and_then(|factory| factory.validator_for(request, &outgoing));

        let id = OperationId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (state, result_rx) = OperationState::new(
            id,
            request.clone(),
            outgoing.clone(),
            validator,
            progress,
        );

        // Registered before the adapter sees the callbacks, so a task that
        // finishes during creation still unregisters its operation.
        self.shared.registry().insert(id, Arc::clone(&state));

        let progress_cb: ProgressCallback = {
            let state = Arc::clone(&state);
            Box::new(move |chunk, received, expected| {
                state.record_progress(chunk, received, expected)
            })
        };
        let completion_cb: CompletionCallback = {
            let guard = CompletionGuard {
                state: Arc::clone(&state),
                shared: Arc::downgrade(&self.shared),
                fired: false,
            };
            Box::new(move |result| {
                let mut guard = guard;
                guard.resolve(result);
            })
        };

        let policy = outgoing.cache_policy;
        let task = adapter.data_task(outgoing, progress_cb, completion_cb);
        if state.attach_task(&task) {
            debug!("[{}] Fetch: {} (cache policy {})", id, request.resource, policy);
            task.resume();
        } else {
            debug!("[{}] Fetch: {} finished while its task was created", id, request.resource);
        }

        Ok(FetchOperation::new(state, result_rx))
    }

    fn cancel(&self, id: OperationId) {
        let operation = self.shared.registry().get(&id).cloned();
        match operation {
            Some(operation) => operation.cancel(),
            None => trace!("[{}] Cancel: not in flight", id),
        }
    }
}
