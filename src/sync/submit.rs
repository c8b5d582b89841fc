//! Remote submission hooks, one per domain.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::store::Domain;

#[derive(Debug, Error)]
pub enum SubmitError {
  #[error("Remote rejected record with status {status}")]
  Rejected { status: u16 },

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Timed out after {0:?}")]
  Timeout(Duration),
}

/// Delivers one record payload upstream.
#[async_trait]
pub trait Submitter: Send + Sync {
  async fn submit(&self, payload: &Value) -> Result<(), SubmitError>;
}

/// Posts payloads as JSON to a fixed endpoint.
#[derive(Clone)]
pub struct HttpSubmitter {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpSubmitter {
  pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
    Self { client, endpoint }
  }
}

#[async_trait]
impl Submitter for HttpSubmitter {
  async fn submit(&self, payload: &Value) -> Result<(), SubmitError> {
    let response = self
      .client
      .post(self.endpoint.clone())
      .json(payload)
      .send()
      .await
      .map_err(|e| SubmitError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      Err(SubmitError::Rejected {
        status: status.as_u16(),
      })
    }
  }
}

/// Registry of submitters keyed by domain.
#[derive(Clone, Default)]
pub struct Submitters {
  by_domain: HashMap<Domain, Arc<dyn Submitter>>,
}

impl Submitters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, domain: Domain, submitter: Arc<dyn Submitter>) -> Self {
    self.by_domain.insert(domain, submitter);
    self
  }

  /// Build HTTP submitters from the configured per-domain endpoints.
  pub fn from_endpoints(client: &reqwest::Client, endpoints: &HashMap<Domain, Url>) -> Self {
    endpoints
      .iter()
      .fold(Self::new(), |submitters, (domain, endpoint)| {
        submitters.with(
          *domain,
          Arc::new(HttpSubmitter::new(client.clone(), endpoint.clone())),
        )
      })
  }

  pub fn get(&self, domain: Domain) -> Option<&Arc<dyn Submitter>> {
    self.by_domain.get(&domain)
  }

  pub fn is_empty(&self) -> bool {
    self.by_domain.is_empty()
  }
}
