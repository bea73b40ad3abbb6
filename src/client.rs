use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::trace;

use crate::config::AppConfig;
use crate::dataset::RawDetail;
use crate::errors::{AppError, AppResult, FetchError};

#[async_trait]
pub trait DetailLookup: Send + Sync {
    async fn fetch_details(&self, identifier: &str) -> Result<RawDetail, FetchError>;
}

/// Fetches one identifier's detail record over a shared, pooled HTTP client.
#[derive(Clone)]
pub struct HttpDetailClient {
    http: Client,
    endpoint: Url,
    id_param: String,
}

impl HttpDetailClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(&config.detail_endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid detail endpoint '{}': {err}",
                config.detail_endpoint
            ))
        })?;
        let http = Client::builder()
            .user_agent(concat!("flavor-map/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.pool_size)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            id_param: config.id_param.clone(),
        })
    }

    pub fn into_lookup(self) -> Arc<dyn DetailLookup> {
        Arc::new(self)
    }

    fn url_for(&self, identifier: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair(&self.id_param, identifier);
        url
    }
}

#[async_trait]
impl DetailLookup for HttpDetailClient {
    async fn fetch_details(&self, identifier: &str) -> Result<RawDetail, FetchError> {
        let response = self
            .http
            .get(self.url_for(identifier))
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        let value = serde_json::from_slice(&body)
            .map_err(|err| FetchError::Decode(err.to_string()))?;
        trace!(identifier, bytes = body.len(), "detail payload received");
        Ok(RawDetail(value))
    }
}
