use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::error::{CacheError, Result};
use crate::remote::Clause;

/// CRUD access to the clause service.
///
/// Object-safe so the library can run against the HTTP client or a test
/// double.
pub trait Remote: Send + Sync + 'static {
  /// `GET /entities`
  fn list(&self) -> BoxFuture<'_, Result<Vec<Clause>>>;

  /// `POST /entities`
  fn create<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>>;

  /// `PUT /entities/{id}`
  fn update<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>>;

  /// `DELETE /entities/{id}`
  fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

  /// `POST /entities/{id}/use`
  fn record_use<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Clause service client over HTTP
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  timeout: Duration,
}

impl HttpRemote {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let timeout = config.request_timeout();
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

    let base = Url::parse(&config.url)
      .map_err(|e| CacheError::Config(format!("Invalid API url {}: {}", config.url, e)))?;
    if base.cannot_be_a_base() {
      return Err(CacheError::Config(format!("Invalid API url {}", config.url)));
    }

    Ok(Self {
      client,
      base,
      token,
      timeout,
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.api, Config::api_token())
  }

  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        CacheError::timeout(self.timeout)
      } else {
        CacheError::from(e)
      }
    })?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(CacheError::Remote {
      status: status.as_u16(),
      message,
    })
  }

  async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
    let response = self.send(builder).await?;
    let body = response.text().await?;
    // A malformed body is not a connectivity problem
    Ok(serde_json::from_str(&body)?)
  }
}

impl Remote for HttpRemote {
  fn list(&self) -> BoxFuture<'_, Result<Vec<Clause>>> {
    async move {
      let url = self.endpoint(&["entities"]);
      debug!(%url, "fetching clauses");
      self
        .send_json(self.request(reqwest::Method::GET, url))
        .await
    }
    .boxed()
  }

  fn create<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>> {
    async move {
      let url = self.endpoint(&["entities"]);
      self
        .send_json(self.request(reqwest::Method::POST, url).json(clause))
        .await
    }
    .boxed()
  }

  fn update<'a>(&'a self, clause: &'a Clause) -> BoxFuture<'a, Result<Clause>> {
    async move {
      let url = self.endpoint(&["entities", &clause.id]);
      self
        .send_json(self.request(reqwest::Method::PUT, url).json(clause))
        .await
    }
    .boxed()
  }

  fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
    async move {
      let url = self.endpoint(&["entities", id]);
      self.send(self.request(reqwest::Method::DELETE, url)).await?;
      Ok(())
    }
    .boxed()
  }

  fn record_use<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
    async move {
      let url = self.endpoint(&["entities", id, "use"]);
      self.send(self.request(reqwest::Method::POST, url)).await?;
      Ok(())
    }
    .boxed()
  }
}
