pub mod graphql;

use crate::model::Page;
use async_trait::async_trait;
use extractor_core::Result;
use serde_json::Value;

/// One parameterized query against one endpoint.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub stream: &'a str,
    pub endpoint: &'a str,
    pub query: &'a str,
    /// Collection to pull out of the `data` envelope.
    pub object_returned: &'a str,
    pub variables: Value,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Issue the request once and decode the named result collection.
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page>;
}

pub use graphql::GraphQlFetcher;
