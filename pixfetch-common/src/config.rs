// pixfetch-common/src/config.rs
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::{FetchError, Result};
use crate::model::CachePolicy;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_USER_AGENT: &str = "pixfetch image fetcher (Rust)";

/// Schemes a freshly constructed fetcher accepts.
pub const DEFAULT_SCHEMES: [&str; 5] = ["http", "https", "ftp", "file", "data"];

/// Session configuration. The fetcher's own transport is built from this.
#[derive(Debug, Clone)]
pub struct Config {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
    pub supported_schemes: BTreeSet<String>,
    pub default_cache_policy: CachePolicy,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading pixfetch configuration");
        let mut config = Self::defaults();

        if let Some(secs) = env_u64("PIXFETCH_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PIXFETCH_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_u64("PIXFETCH_MAX_REDIRECTS")? {
            config.max_redirects = max as usize;
        }
        if let Some(ua) = env_nonempty("PIXFETCH_USER_AGENT") {
            config.user_agent = ua;
        }
        if let Some(raw) = env_nonempty("PIXFETCH_SCHEMES") {
            let schemes = parse_scheme_list(&raw);
            if schemes.is_empty() {
                warn!("PIXFETCH_SCHEMES is set but lists no schemes, keeping defaults");
            } else {
                config.supported_schemes = schemes;
            }
        }
        if let Some(raw) = env_nonempty("PIXFETCH_CACHE_POLICY") {
            config.default_cache_policy = raw.parse().map_err(|e| {
                FetchError::Config(format!("PIXFETCH_CACHE_POLICY: {e}"))
            })?;
        }
        config.log_dir = env_nonempty("PIXFETCH_LOG_DIR").map(PathBuf::from);

        debug!(
            "Configuration loaded: timeout={:?}, schemes={:?}, cache policy={}",
            config.timeout, config.supported_schemes, config.default_cache_policy
        );
        Ok(config)
    }

    pub fn defaults() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            supported_schemes: DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            default_cache_policy: CachePolicy::default(),
            log_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Splits a comma separated scheme list, lowercasing each entry.
pub fn parse_scheme_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches(':').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match env_nonempty(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| FetchError::Config(format!("{key}='{raw}': {e}"))),
    }
}
