//! Network access for the cache layer.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;

use super::traits::{Request, Response};

/// Performs the real network round trip for an intercepted request.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  /// Requests that take longer than `timeout` count as network failures.
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    if request.navigate {
      builder = builder.header(ACCEPT, "text/html");
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}
