// pixfetch-net/src/session.rs
//! Default transport session built on reqwest.
//!
//! `http` and `https` go through the reqwest client, `ftp` through a
//! passive-mode FTP exchange, `file` is read from disk and `data` is decoded
//! in place. Every task runs on the tokio runtime the
//! session was created on.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use pixfetch_common::config::Config;
use pixfetch_common::error::{FetchError, Result};
use pixfetch_common::{CachePolicy, OutgoingRequest, ResponseMetadata};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, PRAGMA, USER_AGENT,
};
use reqwest::Client;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::adapter::{
    CompletionCallback, DataTask, ProgressCallback, SessionAdapter, TaskError, TaskResult,
};
use crate::{data_url, ftp};

const ACCEPT_IMAGES: &str = "image/*,*/*;q=0.8";
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Transport session owned by a fetcher, or shared by the caller.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    runtime: Handle,
    connect_timeout: Duration,
}

impl HttpSession {
    /// Builds a client from `config`. Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let mut session = Self::from_client(build_http_client(config)?)?;
        session.connect_timeout = config.connect_timeout;
        Ok(session)
    }

    /// Wraps a caller-configured client. Must be called inside a tokio runtime.
    pub fn from_client(client: Client) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            FetchError::Config(format!("HTTP session needs a tokio runtime: {e}"))
        })?;
        Ok(Self {
            client,
            runtime,
            connect_timeout: Config::defaults().connect_timeout,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl SessionAdapter for HttpSession {
    fn data_task(
        &self,
        request: OutgoingRequest,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Arc<dyn DataTask> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(HttpTask {
            runtime: self.runtime.clone(),
            cancel_tx,
            pending: Mutex::new(Some(Exchange {
                client: self.client.clone(),
                connect_timeout: self.connect_timeout,
                request,
                progress,
                completion,
                cancel_rx,
            })),
        })
    }
}

fn build_http_client(config: &Config) -> Result<Client> {
    let mut headers = HeaderMap::new();
    let user_agent = HeaderValue::from_str(&config.user_agent)
        .map_err(|e| FetchError::Config(format!("Invalid user agent: {e}")))?;
    headers.insert(USER_AGENT, user_agent);
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_IMAGES));
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .build()
        .map_err(|e| FetchError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Request headers that express `policy` to HTTP caches.
pub fn cache_control_headers(policy: CachePolicy) -> Vec<(HeaderName, HeaderValue)> {
    match policy {
        CachePolicy::UseProtocolCachePolicy => Vec::new(),
        CachePolicy::ReloadIgnoringCache => vec![
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        CachePolicy::ReturnCacheDataElseLoad => {
            vec![(CACHE_CONTROL, HeaderValue::from_static("max-stale"))]
        }
        CachePolicy::ReturnCacheDataDontLoad => {
            vec![(CACHE_CONTROL, HeaderValue::from_static("only-if-cached"))]
        }
    }
}

struct Exchange {
    client: Client,
    connect_timeout: Duration,
    request: OutgoingRequest,
    progress: ProgressCallback,
    completion: CompletionCallback,
    cancel_rx: watch::Receiver<bool>,
}

struct HttpTask {
    runtime: Handle,
    cancel_tx: watch::Sender<bool>,
    pending: Mutex<Option<Exchange>>,
}

impl DataTask for HttpTask {
    fn resume(&self) {
        let taken = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(exchange) = taken else {
            trace!("Task already resumed");
            return;
        };
        self.runtime.spawn(exchange.run());
    }

    fn cancel(&self) {
        // Receivers may already be gone if the exchange finished.
        let _ = self.cancel_tx.send(true);
    }
}

impl Exchange {
    async fn run(self) {
        let Exchange {
            client,
            connect_timeout,
            request,
            progress,
            completion,
            mut cancel_rx,
        } = self;
        let url = request.url.clone();
        let result: TaskResult = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => Err(TaskError::Cancelled),
            result = perform(&client, connect_timeout, request, &progress) => result,
        };
        match &result {
            Ok(meta) => debug!("Exchange finished for {} (status {:?})", url, meta.status),
            Err(e) => debug!("Exchange for {} ended: {}", url, e),
        }
        drop(progress);
        completion(result);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if sender_gone {
        // Dropped without cancelling; never resolve.
        std::future::pending::<()>().await;
    }
}

async fn perform(
    client: &Client,
    connect_timeout: Duration,
    request: OutgoingRequest,
    progress: &ProgressCallback,
) -> TaskResult {
    match request.scheme() {
        "http" | "https" => perform_http(client, request, progress).await,
        "ftp" => {
            let timeout = request.timeout.unwrap_or(connect_timeout);
            ftp::retrieve(&request.url, timeout, progress).await
        }
        "file" => perform_file(request, progress).await,
        "data" => perform_data(request, progress),
        other => Err(TaskError::message(format!(
            "Scheme '{other}' is not carried by the default session"
        ))),
    }
}

async fn perform_http(
    client: &Client,
    request: OutgoingRequest,
    progress: &ProgressCallback,
) -> TaskResult {
    let mut headers = request.headers.clone();
    for (name, value) in cache_control_headers(request.cache_policy) {
        headers.entry(name).or_insert(value);
    }
    let mut builder = client
        .request(request.method.clone(), request.url.clone())
        .headers(headers);
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await.map_err(|e| {
        debug!("HTTP request failed for {}: {}", request.url, e);
        TaskError::transport(e)
    })?;
    let status = response.status();
    trace!("Received HTTP status: {} for {}", status, request.url);

    let mut meta = ResponseMetadata::new(response.url().clone());
    meta.status = Some(status.as_u16());
    meta.headers = response.headers().clone();
    meta.expected_content_length = response.content_length();
    meta.mime_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let expected = meta.expected_content_length;
    let mut received: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TaskError::transport)?;
        if chunk.is_empty() {
            continue;
        }
        received += chunk.len() as u64;
        progress(chunk, received, expected);
    }
    Ok(meta)
}

async fn perform_file(request: OutgoingRequest, progress: &ProgressCallback) -> TaskResult {
    let path = request
        .url
        .to_file_path()
        .map_err(|_| TaskError::message(format!("Not a local file URL: {}", request.url)))?;
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(TaskError::transport)?;
    let len = file.metadata().await.map_err(TaskError::transport)?.len();

    let mut meta = ResponseMetadata::new(request.url.clone());
    meta.expected_content_length = Some(len);

    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(TaskError::transport)?;
        if n == 0 {
            break;
        }
        if received == 0 {
            meta.mime_type = infer::get(&buf[..n]).map(|kind| kind.mime_type().to_string());
        }
        received += n as u64;
        progress(Bytes::copy_from_slice(&buf[..n]), received, Some(len));
    }
    Ok(meta)
}

fn perform_data(request: OutgoingRequest, progress: &ProgressCallback) -> TaskResult {
    let decoded = data_url::decode(&request.url).map_err(TaskError::transport)?;
    let len = decoded.body.len() as u64;

    let mut meta = ResponseMetadata::new(request.url.clone());
    meta.expected_content_length = Some(len);
    meta.mime_type = Some(decoded.media_type);
    if len > 0 {
        progress(Bytes::from(decoded.body), len, Some(len));
    }
    Ok(meta)
}
