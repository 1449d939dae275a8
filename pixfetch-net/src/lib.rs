// pixfetch-net/src/lib.rs
pub mod adapter;
pub mod customizer;
pub mod data_url;
pub mod fetcher;
mod ftp;
pub mod operation;
pub mod session;
pub mod validation;

pub use adapter::{
    CompletionCallback, DataTask, ProgressCallback, SessionAdapter, TaskError, TaskResult,
};
pub use customizer::{RequestCustomizer, StaticHeaders};
pub use fetcher::{ImageFetching, UrlImageFetcher};
pub use operation::{FetchOperation, FetchState, OperationId, ProgressHandler};
pub use pixfetch_common::{
    config::Config,
    error::{FetchError, Result},
    CachePolicy, FetchProgress, FetchResponse, ImageRequest, ImageRequestOptions,
    OutgoingRequest, ResponseMetadata, CACHE_POLICY_KEY,
};
pub use session::HttpSession;
pub use validation::{
    validate_scheme, HttpResponseValidator, HttpValidatorFactory, ResponseValidator,
    ResponseValidatorFactory,
};
