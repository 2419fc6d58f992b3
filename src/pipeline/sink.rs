//! Batching sink and the HTTP push transport behind it.
//!
//! Items accumulate in arrival order; the batch is posted as one JSON body
//! when it reaches its threshold. A failed post discards the whole batch.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AuthScheme, Endpoint};
use crate::error::{NodeError, Result};

/// One-shot JSON POST to the collection server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// POST `body` to `path`; any non-2xx status is an error
    async fn post_json(&self, path: &str, body: String) -> Result<()>;
}

/// [`PushTransport`] over reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl HttpTransport {
    /// # Arguments
    ///
    /// * `endpoint` - Collection server host and port
    /// * `scheme` - `Authorization` scheme
    /// * `token` - Static credential; empty sends no `Authorization` header
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(endpoint: &Endpoint, scheme: AuthScheme, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let authorization = (!token.is_empty()).then(|| format!("{} {}", scheme.as_str(), token));

        info!("Push endpoint {}", endpoint.http_base_url());
        Ok(Self {
            client,
            base_url: endpoint.http_base_url(),
            authorization,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn post_json(&self, path: &str, body: String) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(auth) = &self.authorization {
            request = request.header(AUTHORIZATION, auth.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NodeError::Network(format!(
                "POST {} returned {}: {}",
                path,
                status,
                text.trim()
            )));
        }

        debug!("POST {} -> {}", path, status);
        Ok(())
    }
}

/// Request body layout for a flushed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    /// `[item, item, ...]`
    Array,
    /// The single item as a bare object
    SingleObject,
}

/// Accumulates items and posts them in batches
#[derive(Debug)]
pub struct BatchingSink<R, T> {
    transport: T,
    path: String,
    threshold: usize,
    shape: BodyShape,
    batch: Vec<R>,
}

impl<R, T> BatchingSink<R, T>
where
    R: Serialize + Send + Sync,
    T: PushTransport,
{
    pub fn new(transport: T, path: impl Into<String>, threshold: usize) -> Self {
        Self {
            transport,
            path: path.into(),
            threshold: threshold.max(1),
            shape: BodyShape::Array,
            batch: Vec::with_capacity(threshold),
        }
    }

    pub fn with_shape(mut self, shape: BodyShape) -> Self {
        self.shape = shape;
        self
    }

    /// Items waiting for the next flush
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Add an item, flushing once the batch reaches its threshold
    ///
    /// Returns `Some(n)` when a flush delivered `n` items.
    ///
    /// # Errors
    ///
    /// Returns the flush error; the batch has already been discarded.
    pub async fn offer(&mut self, item: R) -> Result<Option<usize>> {
        self.batch.push(item);
        if self.batch.len() < self.threshold {
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    /// Post everything pending as one request
    ///
    /// The batch is empty afterwards whatever the outcome. An empty batch
    /// makes no request.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }

        let items = std::mem::take(&mut self.batch);
        let count = items.len();
        let body = match (self.shape, items.as_slice()) {
            (BodyShape::SingleObject, [only]) => serde_json::to_string(only)?,
            _ => serde_json::to_string(&items)?,
        };
        drop(items);

        self.transport.post_json(&self.path, body).await?;
        debug!("Flushed {} item(s) to {}", count, self.path);
        Ok(count)
    }
}
