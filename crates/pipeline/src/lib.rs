//! Authenticated HTTP request pipeline
//!
//! `ApiClient` wraps every backend call with credential injection, CSRF echo,
//! envelope unwrapping and error classification. A 401 on a refreshable
//! endpoint triggers at most one refresh, shared by every request that failed
//! while it was in flight, and the original request is replayed once.
//!
//! Layout:
//! - `client`: the pipeline itself and its builder
//! - `refresh`: single-flight refresh coordinator
//! - `policy`: which endpoints may refresh
//! - `envelope`: success body decoding
//! - `error`: `ApiError` classification

pub mod client;
pub mod envelope;
pub mod error;
pub mod policy;
pub mod refresh;

pub use client::{
    ApiClient, ApiClientBuilder, DEFAULT_TIMEOUT, PipelineConfig, RequestOptions,
    SessionExpiredHandler,
};
pub use envelope::{ApiResponse, Envelope};
pub use error::{ApiError, BuildError, ErrorKind, codes};
pub use policy::EndpointPolicy;
pub use refresh::{RefreshCoordinator, RefreshFailed, RefreshOutcome};
