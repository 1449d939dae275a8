// pixfetch-net/src/customizer.rs
use pixfetch_common::error::Result;
use pixfetch_common::{ImageRequest, OutgoingRequest};

/// Hook that may rewrite or replace the request derived from an image request.
///
/// Runs synchronously on the thread calling `fetch`, so it must not block.
/// Whatever it returns is used as-is; the scheme is not checked again.
pub trait RequestCustomizer: Send + Sync {
    fn customize(&self, image_request: &ImageRequest, request: OutgoingRequest)
        -> OutgoingRequest;
}

impl<F> RequestCustomizer for F
where
    F: Fn(&ImageRequest, OutgoingRequest) -> OutgoingRequest + Send + Sync,
{
    fn customize(
        &self,
        image_request: &ImageRequest,
        request: OutgoingRequest,
    ) -> OutgoingRequest {
        self(image_request, request)
    }
}

/// Adds a fixed set of headers to every request.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: Vec<(String, String)>,
}

impl StaticHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `Name: value` lines, as given on a command line.
    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut headers = Self::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                pixfetch_common::FetchError::Config(format!(
                    "Header '{line}' must look like 'Name: value'"
                ))
            })?;
            headers = headers.with(name.trim(), value.trim());
        }
        Ok(headers)
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl RequestCustomizer for StaticHeaders {
    fn customize(&self, image_request: &ImageRequest, request: OutgoingRequest) -> OutgoingRequest {
        let mut current = request;
        for (name, value) in &self.headers {
            match current.clone().with_header(name, value) {
                Ok(next) => current = next,
                Err(e) => tracing::warn!(
                    "Skipping header {} for {}: {}",
                    name,
                    image_request.resource,
                    e
                ),
            }
        }
        current
    }
}
