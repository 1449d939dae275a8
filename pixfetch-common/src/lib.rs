// pixfetch-common/src/lib.rs
pub mod config;
pub mod error;
pub mod model;

// Re-export key types
pub use config::Config;
pub use error::{FetchError, Result};
pub use model::{
    CachePolicy, FetchProgress, FetchResponse, ImageRequest, ImageRequestOptions,
    OutgoingRequest, ResponseMetadata, CACHE_POLICY_KEY,
};
