//! External provider contracts plus HTTP and fixture-backed implementations.

use async_trait::async_trait;
use ciq_core::{PromptContext, ProviderError, RawMetrics, StructuredInsight};
use reqwest::StatusCode;

pub mod fixture;
pub mod http;
pub mod insight;
pub mod standardize;

pub use fixture::{load_fixture_file, FixtureFailure, FixtureFile, FixtureProvider, FixtureTarget};
pub use http::{HttpInsightProvider, HttpMetricsProvider, HttpProviderConfig};

pub const CRATE_NAME: &str = "ciq-adapters";

/// Fetches current metrics for a single target.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Short stable name, used in cache fingerprints.
    fn provider_id(&self) -> &'static str;

    async fn fetch(&self, target_id: &str) -> Result<RawMetrics, ProviderError>;
}

/// Produces an AI-generated insight for a target.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn analyze(&self, context: &PromptContext) -> Result<StructuredInsight, ProviderError>;
}

/// 5xx and 429 are worth retrying; any other non-success status is a
/// permanent rejection of the request.
pub fn classify_status(status: StatusCode, context: &str) -> ProviderError {
    let message = format!("http status {} for {context}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, "request")
    } else {
        ProviderError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "x").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "x").is_transient());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "x").is_transient());
    }
}
