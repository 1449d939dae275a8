use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pixfetch_net::{
    CachePolicy, CompletionCallback, Config, DataTask, FetchError, FetchProgress, FetchState,
    ImageFetching, ImageRequest, OutgoingRequest, ProgressCallback, ProgressHandler,
    ResponseMetadata, ResponseValidator, ResponseValidatorFactory, SessionAdapter, TaskError,
    TaskResult, UrlImageFetcher,
};
use url::Url;

/// Task whose callbacks are driven by the test.
struct ScriptedTask {
    request: OutgoingRequest,
    progress: Mutex<Option<ProgressCallback>>,
    completion: Mutex<Option<CompletionCallback>>,
    resumed: AtomicBool,
    cancel_calls: AtomicUsize,
}

impl ScriptedTask {
    fn chunk(&self, data: &[u8], received: u64, expected: Option<u64>) {
        if let Some(progress) = self.progress.lock().unwrap().as_ref() {
            progress(Bytes::copy_from_slice(data), received, expected);
        }
    }

    fn finish(&self, result: TaskResult) {
        let completion = self.completion.lock().unwrap().take();
        if let Some(completion) = completion {
            completion(result);
        }
    }

    fn finish_ok(&self, status: u16) {
        self.finish(Ok(response(&self.request.url, Some(status))));
    }

    /// Drops the completion callback without calling it.
    fn abandon(&self) {
        drop(self.completion.lock().unwrap().take());
    }

    fn cancelled(&self) -> bool {
        self.cancel_calls.load(Ordering::SeqCst) > 0
    }
}

impl DataTask for ScriptedTask {
    fn resume(&self) {
        self.resumed.store(true, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedAdapter {
    tasks: Mutex<Vec<Arc<ScriptedTask>>>,
}

impl ScriptedAdapter {
    fn created(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    fn task(&self, index: usize) -> Arc<ScriptedTask> {
        Arc::clone(&self.tasks.lock().unwrap()[index])
    }
}

impl SessionAdapter for ScriptedAdapter {
    fn data_task(
        &self,
        request: OutgoingRequest,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Arc<dyn DataTask> {
        let task = Arc::new(ScriptedTask {
            request,
            progress: Mutex::new(Some(progress)),
            completion: Mutex::new(Some(completion)),
            resumed: AtomicBool::new(false),
            cancel_calls: AtomicUsize::new(0),
        });
        self.tasks.lock().unwrap().push(Arc::clone(&task));
        task
    }
}

fn response(url: &Url, status: Option<u16>) -> ResponseMetadata {
    let mut meta = ResponseMetadata::new(url.clone());
    meta.status = status;
    meta
}

fn setup() -> (Arc<ScriptedAdapter>, UrlImageFetcher) {
    let adapter = Arc::new(ScriptedAdapter::default());
    let fetcher = UrlImageFetcher::with_session_adapter(&adapter, Config::default());
    (adapter, fetcher)
}

fn recorder() -> (ProgressHandler, Arc<Mutex<Vec<FetchProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: ProgressHandler = Arc::new(move |p| sink.lock().unwrap().push(p));
    (handler, seen)
}

struct RejectEverything;

impl ResponseValidator for RejectEverything {
    fn validate(&self, _: &ResponseMetadata, _: &[u8]) -> Result<(), String> {
        Err("not an image".to_string())
    }
}

struct RejectingFactory {
    calls: AtomicUsize,
}

impl ResponseValidatorFactory for RejectingFactory {
    fn validator_for(
        &self,
        _: &ImageRequest,
        _: &OutgoingRequest,
    ) -> Option<Box<dyn ResponseValidator>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(RejectEverything))
    }
}

struct ForceReload;

impl pixfetch_net::RequestCustomizer for ForceReload {
    fn customize(&self, _: &ImageRequest, request: OutgoingRequest) -> OutgoingRequest {
        request.with_cache_policy(CachePolicy::ReloadIgnoringCache)
    }
}

#[tokio::test]
async fn two_chunks_relay_progress_then_succeed() {
    let (adapter, fetcher) = setup();
    let (handler, seen) = recorder();

    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), Some(handler))
        .expect("fetch issued");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(op.state(), FetchState::Pending);
    assert!(!op.is_finished());
    assert_eq!(op.outgoing_request().url.as_str(), "http://example.com/a.jpg");
    assert_eq!(fetcher.in_flight(), 1);

    let task = adapter.task(0);
    assert!(task.resumed.load(Ordering::SeqCst));
    task.chunk(&[1u8; 512], 512, Some(1024));
    task.chunk(&[2u8; 512], 1024, Some(1024));
    task.finish_ok(200);
    assert!(op.is_finished());

    let response = op.result().await.expect("success");
    assert_eq!(response.data.len(), 1024);
    assert_eq!(&response.data[..512], &[1u8; 512][..]);
    assert_eq!(&response.data[512..], &[2u8; 512][..]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            FetchProgress { completed: 512, total: Some(1024) },
            FetchProgress { completed: 1024, total: Some(1024) },
        ]
    );
    assert_eq!(fetcher.in_flight(), 0);
}

#[tokio::test]
async fn unsupported_scheme_fails_without_task() {
    let (adapter, fetcher) = setup();
    fetcher.set_supported_schemes(["http", "https"]);

    let err = fetcher
        .fetch(&ImageRequest::new("ftp://x/y.png"), None)
        .unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedScheme { ref scheme, .. } if scheme == "ftp"));
    assert_eq!(adapter.created(), 0);
    assert_eq!(fetcher.in_flight(), 0);
}

#[tokio::test]
async fn customizer_override_reaches_the_task() {
    let (adapter, fetcher) = setup();
    let customizer = Arc::new(ForceReload);
    fetcher.set_request_customizer(&customizer);

    let op = fetcher
        .fetch(&ImageRequest::new("https://example.com/b.png"), None)
        .unwrap();
    assert_eq!(
        adapter.task(0).request.cache_policy,
        CachePolicy::ReloadIgnoringCache
    );
    assert_eq!(
        op.outgoing_request().cache_policy,
        CachePolicy::ReloadIgnoringCache
    );
}

#[tokio::test]
async fn cache_policy_option_is_recognized_only_when_present() {
    let (adapter, fetcher) = setup();
    let _plain = fetcher
        .fetch(&ImageRequest::new("https://example.com/c.png"), None)
        .unwrap();
    let _offline = fetcher
        .fetch(
            &ImageRequest::new("https://example.com/c.png")
                .with_cache_policy(CachePolicy::ReturnCacheDataDontLoad),
            None,
        )
        .unwrap();
    assert_eq!(
        adapter.task(0).request.cache_policy,
        Config::default().default_cache_policy
    );
    assert_eq!(
        adapter.task(1).request.cache_policy,
        CachePolicy::ReturnCacheDataDontLoad
    );
}

#[tokio::test]
async fn rejecting_validator_turns_success_into_validation_error() {
    let (adapter, fetcher) = setup();
    let factory = Arc::new(RejectingFactory {
        calls: AtomicUsize::new(0),
    });
    fetcher.set_validator_factory(&factory);

    for i in 0..3 {
        let op = fetcher
            .fetch(&ImageRequest::new(format!("http://example.com/{i}.jpg")), None)
            .unwrap();
        let task = adapter.task(i);
        task.chunk(b"bytes", 5, Some(5));
        task.finish_ok(200);
        match op.result().await {
            Err(FetchError::Validation(reason)) => assert_eq!(reason, "not an image"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
    assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancel_resolves_as_cancelled_and_silences_callbacks() {
    let (adapter, fetcher) = setup();
    let (handler, seen) = recorder();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), Some(handler))
        .unwrap();
    let task = adapter.task(0);

    task.chunk(&[0u8; 100], 100, Some(1000));
    fetcher.cancel(op.id());
    assert!(task.cancelled());

    // Already in flight at the transport; none of it may surface.
    task.chunk(&[0u8; 900], 1000, Some(1000));
    task.finish_ok(200);

    let id = op.id();
    assert_eq!(op.state(), FetchState::Cancelled);
    let err = op.result().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![FetchProgress { completed: 100, total: Some(1000) }]
    );
    assert_eq!(fetcher.in_flight(), 0);

    // Idempotent once terminal.
    fetcher.cancel(id);
    assert_eq!(task.cancel_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_reported_cancel_is_cancelled_not_transport_error() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    op.cancel();
    adapter.task(0).finish(Err(TaskError::Cancelled));
    assert!(matches!(op.result().await, Err(FetchError::Cancelled)));
}

#[tokio::test]
async fn completion_wins_over_late_cancel() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    let task = adapter.task(0);
    task.chunk(b"done", 4, None);
    task.finish_ok(200);
    op.cancel();
    assert!(!task.cancelled());
    assert_eq!(op.result().await.unwrap().data.as_ref(), b"done");
}

#[tokio::test]
async fn scheme_change_does_not_touch_in_flight_operations() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();

    fetcher.set_supported_schemes(["file"]);
    let task = adapter.task(0);
    task.chunk(b"abc", 3, Some(3));
    task.finish_ok(200);
    assert!(op.result().await.is_ok());

    let err = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedScheme { .. }));
    assert_eq!(adapter.created(), 1);
}

#[tokio::test]
async fn transport_failure_wraps_cause() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("https://example.com/a.jpg"), None)
        .unwrap();
    let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "operation timed out");
    adapter.task(0).finish(Err(TaskError::transport(timeout)));

    match op.result().await {
        Err(FetchError::Transport(cause)) => assert_eq!(cause.to_string(), "operation timed out"),
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_body_policy() {
    let (adapter, fetcher) = setup();

    let plain = fetcher
        .fetch(&ImageRequest::new("http://example.com/empty.jpg"), None)
        .unwrap();
    adapter.task(0).finish_ok(200);
    assert!(matches!(
        plain.result().await,
        Err(FetchError::EmptyResponse(_))
    ));

    let no_content = fetcher
        .fetch(&ImageRequest::new("http://example.com/none.jpg"), None)
        .unwrap();
    adapter.task(1).finish_ok(204);
    assert!(no_content.result().await.unwrap().data.is_empty());

    let data = fetcher.fetch(&ImageRequest::new("data:,"), None).unwrap();
    let url = adapter.task(2).request.url.clone();
    adapter.task(2).finish(Ok(response(&url, None)));
    assert!(data.result().await.unwrap().data.is_empty());
}

#[tokio::test]
async fn no_progress_after_completion() {
    let (adapter, fetcher) = setup();
    let (handler, seen) = recorder();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), Some(handler))
        .unwrap();
    let task = adapter.task(0);
    task.chunk(b"ab", 2, Some(2));
    task.finish_ok(200);
    task.chunk(b"cd", 4, Some(2));

    assert_eq!(op.result().await.unwrap().data.as_ref(), b"ab");
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn regressing_progress_is_not_relayed() {
    let (adapter, fetcher) = setup();
    let (handler, seen) = recorder();
    let _op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), Some(handler))
        .unwrap();
    let task = adapter.task(0);
    task.chunk(b"abcd", 4, None);
    task.chunk(b"e", 2, None);
    task.chunk(b"f", 6, None);

    let completed: Vec<u64> = seen.lock().unwrap().iter().map(|p| p.completed).collect();
    assert_eq!(completed, vec![4, 6]);
}

#[tokio::test]
async fn delegates_are_not_kept_alive() {
    let (adapter, fetcher) = setup();
    let customizer = Arc::new(ForceReload);
    fetcher.set_request_customizer(&customizer);
    drop(customizer);

    let _op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    assert_eq!(
        adapter.task(0).request.cache_policy,
        CachePolicy::UseProtocolCachePolicy
    );
}

#[tokio::test]
async fn dropped_external_adapter_is_reported() {
    let (adapter, fetcher) = setup();
    drop(adapter);
    let err = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap_err();
    assert!(matches!(err, FetchError::SessionUnavailable));
}

#[tokio::test]
async fn concurrent_operations_are_independent() {
    let (adapter, fetcher) = setup();
    let ops: Vec<_> = (0..4)
        .map(|i| {
            fetcher
                .fetch(&ImageRequest::new(format!("http://example.com/{i}.jpg")), None)
                .unwrap()
        })
        .collect();
    assert_eq!(fetcher.in_flight(), 4);

    for i in (0..4).rev() {
        let task = adapter.task(i);
        let body = format!("image-{i}");
        task.chunk(body.as_bytes(), body.len() as u64, None);
        task.finish_ok(200);
    }
    for (i, op) in ops.into_iter().enumerate() {
        let response = op.result().await.unwrap();
        assert_eq!(response.data.as_ref(), format!("image-{i}").as_bytes());
    }
    assert_eq!(fetcher.in_flight(), 0);
}

#[tokio::test]
async fn cancel_all_signals_every_task() {
    let (adapter, fetcher) = setup();
    let _a = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    let _b = fetcher
        .fetch(&ImageRequest::new("http://example.com/b.jpg"), None)
        .unwrap();
    fetcher.cancel_all();
    assert!(adapter.task(0).cancelled());
    assert!(adapter.task(1).cancelled());
}

#[tokio::test]
async fn request_predicates() {
    let (_adapter, fetcher) = setup();
    assert!(fetcher.can_handle_request(&ImageRequest::new("https://example.com/a.jpg")));
    assert!(!fetcher.can_handle_request(&ImageRequest::new("gopher://example.com/a.jpg")));
    assert!(!fetcher.can_handle_request(&ImageRequest::new("::not a url::")));

    let a = ImageRequest::new("https://example.com/a.jpg");
    let same = ImageRequest::new("https://example.com/a.jpg");
    let reload = ImageRequest::new("https://example.com/a.jpg")
        .with_cache_policy(CachePolicy::ReloadIgnoringCache);
    assert!(fetcher.is_request_fetch_equivalent(&a, &same));
    assert!(!fetcher.is_request_fetch_equivalent(&a, &reload));
}

#[tokio::test]
async fn abandoned_completion_resolves_and_unregisters() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    let task = adapter.task(0);
    task.chunk(b"part", 4, Some(100));
    task.abandon();

    let result = tokio::time::timeout(Duration::from_secs(1), op.result())
        .await
        .expect("operation resolves once the callback is gone");
    match result {
        Err(FetchError::Transport(cause)) => {
            assert_eq!(cause.to_string(), "task dropped without completing")
        }
        other => panic!("expected transport error, got {other:?}"),
    }
    assert_eq!(fetcher.in_flight(), 0);
}

#[tokio::test]
async fn abandoned_completion_after_cancel_is_cancelled() {
    let (adapter, fetcher) = setup();
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    op.cancel();
    adapter.task(0).abandon();
    assert!(matches!(op.result().await, Err(FetchError::Cancelled)));
    assert_eq!(fetcher.in_flight(), 0);
}

#[derive(Default)]
struct IdleTask {
    resumes: AtomicUsize,
}

impl DataTask for IdleTask {
    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) {}
}

/// Answers every request from inside `data_task`.
#[derive(Default)]
struct InlineAdapter {
    tasks: Mutex<Vec<Arc<IdleTask>>>,
}

impl SessionAdapter for InlineAdapter {
    fn data_task(
        &self,
        request: OutgoingRequest,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Arc<dyn DataTask> {
        let body = request.url.path().as_bytes().to_vec();
        let len = body.len() as u64;
        progress(Bytes::from(body), len, Some(len));
        completion(Ok(response(&request.url, Some(200))));
        let task = Arc::new(IdleTask::default());
        self.tasks.lock().unwrap().push(Arc::clone(&task));
        task
    }
}

/// Drops every completion callback it is given.
struct ForgetfulAdapter;

impl SessionAdapter for ForgetfulAdapter {
    fn data_task(
        &self,
        _request: OutgoingRequest,
        _progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Arc<dyn DataTask> {
        drop(completion);
        Arc::new(IdleTask::default())
    }
}

#[tokio::test]
async fn completion_during_task_creation_leaves_registry_empty() {
    let adapter = Arc::new(InlineAdapter::default());
    let fetcher = UrlImageFetcher::with_session_adapter(&adapter, Config::default());
    let (handler, seen) = recorder();

    for i in 0..3 {
        let op = fetcher
            .fetch(
                &ImageRequest::new(format!("http://example.com/{i}.png")),
                Some(Arc::clone(&handler)),
            )
            .unwrap();
        assert!(op.is_finished());
        let response = op.result().await.unwrap();
        assert_eq!(response.data.as_ref(), format!("/{i}.png").as_bytes());
    }
    assert_eq!(fetcher.in_flight(), 0);
    assert_eq!(seen.lock().unwrap().len(), 3);
    // Tasks that finished during creation are never started.
    let tasks = adapter.tasks.lock().unwrap();
    assert!(tasks.iter().all(|t| t.resumes.load(Ordering::SeqCst) == 0));
}

#[tokio::test]
async fn completion_dropped_during_task_creation_fails_the_fetch() {
    let adapter = Arc::new(ForgetfulAdapter);
    let fetcher = UrlImageFetcher::with_session_adapter(&adapter, Config::default());
    let op = fetcher
        .fetch(&ImageRequest::new("http://example.com/a.jpg"), None)
        .unwrap();
    assert!(matches!(op.result().await, Err(FetchError::Transport(_))));
    assert_eq!(fetcher.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_is_clear_when_result_arrives() {
    let (adapter, fetcher) = setup();
    for i in 0..50 {
        let op = fetcher
            .fetch(&ImageRequest::new(format!("http://example.com/{i}.jpg")), None)
            .unwrap();
        let task = adapter.task(i);
        let finisher = std::thread::spawn(move || {
            task.chunk(b"x", 1, Some(1));
            task.finish_ok(200);
        });
        op.result().await.unwrap();
        assert_eq!(fetcher.in_flight(), 0);
        finisher.join().unwrap();
    }
}
