// pixfetch-common/src/model.rs
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{FetchError, Result};

/// Option key carrying a cache policy override inside [`ImageRequestOptions::user_info`].
pub const CACHE_POLICY_KEY: &str = "cachePolicy";

/// How the transport should treat locally cached responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Whatever the transport does by default.
    #[default]
    UseProtocolCachePolicy,
    ReloadIgnoringCache,
    ReturnCacheDataElseLoad,
    ReturnCacheDataDontLoad,
}

impl CachePolicy {
    /// Legacy numeric code, as found in older option dictionaries.
    pub fn code(self) -> u8 {
        match self {
            CachePolicy::UseProtocolCachePolicy => 0,
            CachePolicy::ReloadIgnoringCache => 1,
            CachePolicy::ReturnCacheDataElseLoad => 2,
            CachePolicy::ReturnCacheDataDontLoad => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CachePolicy::UseProtocolCachePolicy),
            1 => Some(CachePolicy::ReloadIgnoringCache),
            2 => Some(CachePolicy::ReturnCacheDataElseLoad),
            3 => Some(CachePolicy::ReturnCacheDataDontLoad),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CachePolicy::UseProtocolCachePolicy => "UseProtocolCachePolicy",
            CachePolicy::ReloadIgnoringCache => "ReloadIgnoringCache",
            CachePolicy::ReturnCacheDataElseLoad => "ReturnCacheDataElseLoad",
            CachePolicy::ReturnCacheDataDontLoad => "ReturnCacheDataDontLoad",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u8>() {
            return CachePolicy::from_code(code).ok_or_else(|| {
                FetchError::Config(format!("Unknown cache policy code: {code}"))
            });
        }
        let normalized: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "useprotocolcachepolicy" | "default" | "protocol" => {
                Ok(CachePolicy::UseProtocolCachePolicy)
            }
            "reloadignoringcache" | "reloadignoringlocalcachedata" | "reload" | "nocache" => {
                Ok(CachePolicy::ReloadIgnoringCache)
            }
            "returncachedataelseload" | "prefercache" => {
                Ok(CachePolicy::ReturnCacheDataElseLoad)
            }
            "returncachedatadontload" | "cacheonly" | "offline" => {
                Ok(CachePolicy::ReturnCacheDataDontLoad)
            }
            _ => Err(FetchError::Config(format!("Unknown cache policy: '{s}'"))),
        }
    }
}

/// Free-form options attached to an [`ImageRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRequestOptions {
    pub user_info: HashMap<String, String>,
}

/// What the caller wants fetched. Immutable once handed to a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub resource: String,
    pub options: ImageRequestOptions,
}

impl ImageRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            options: ImageRequestOptions::default(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.user_info.insert(key.into(), value.into());
        self
    }

    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        self.with_option(CACHE_POLICY_KEY, policy.as_str())
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.resource)
            .map_err(|e| FetchError::InvalidUrl(format!("'{}': {e}", self.resource)))
    }

    /// The cache policy override, if one was given and it parses.
    pub fn cache_policy(&self) -> Option<CachePolicy> {
        let raw = self.options.user_info.get(CACHE_POLICY_KEY)?;
        match raw.parse() {
            Ok(policy) => Some(policy),
            Err(e) => {
                warn!(
                    "Ignoring cache policy option for {}: {}",
                    self.resource, e
                );
                None
            }
        }
    }
}

/// Concrete request handed to the transport.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub cache_policy: CachePolicy,
    pub timeout: Option<Duration>,
}

impl OutgoingRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: None,
        }
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::Config(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::Config(format!("Invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response metadata, available without the body.
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    pub url: Url,
    /// HTTP status; `None` for schemes without one (file, data).
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub expected_content_length: Option<u64>,
    pub mime_type: Option<String>,
}

impl ResponseMetadata {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            status: None,
            headers: HeaderMap::new(),
            expected_content_length: None,
            mime_type: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Media type without parameters, lowercased.
    pub fn essence(&self) -> Option<String> {
        self.mime_type
            .as_deref()
            .or_else(|| self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()))
            .and_then(|m| m.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
    }

    /// Whether a zero-length body is a legitimate outcome for this response.
    pub fn permits_empty_body(&self) -> bool {
        self.url.scheme() == "data" || matches!(self.status, Some(204) | Some(205))
    }
}

/// Progress of one fetch. `total` is `None` while the size is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub completed: u64,
    pub total: Option<u64>,
}

impl FetchProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
        }
    }
}

/// Successful result of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub data: Bytes,
    pub response: ResponseMetadata,
}
