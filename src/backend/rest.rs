use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::realtime;
use super::{Backend, ChangeStream, Mutation, MutationOp, ResourceQuery};
use crate::config::{BackendConfig, Config};

/// Backend client for a PostgREST-style API with a realtime socket.
#[derive(Clone)]
pub struct RestBackend {
  http: reqwest::Client,
  base: Url,
  realtime: Url,
  api_key: String,
  schema: String,
}

impl RestBackend {
  pub fn new(config: &BackendConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_key(config, api_key)
  }

  pub fn with_key(config: &BackendConfig, api_key: String) -> Result<Self> {
    let base = parse_base(&config.url)?;
    let realtime = match &config.realtime_url {
      Some(url) => parse_base(url)?,
      None => websocket_form(&base)?,
    };

    let mut headers = HeaderMap::new();
    let key_header = HeaderValue::from_str(&api_key)
      .map_err(|e| eyre!("API key is not a valid header value: {}", e))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| eyre!("API key is not a valid header value: {}", e))?;
    headers.insert("apikey", key_header);
    headers.insert(AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      realtime,
      api_key,
      schema: config.schema.clone(),
    })
  }

  fn table_url(&self, resource: &str) -> Result<Url> {
    self
      .base
      .join(&format!("rest/v1/{}", resource))
      .map_err(|e| eyre!("Invalid resource name {}: {}", resource, e))
  }

  fn query_url(&self, query: &ResourceQuery) -> Result<Url> {
    let mut url = self.table_url(&query.resource)?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", query.select.as_deref().unwrap_or("*"));
      for filter in &query.filters {
        pairs.append_pair(&filter.column, &filter.expression());
      }
      if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.append_pair("order", &format!("{}.{}", order.column, direction));
      }
      if let Some(limit) = query.limit {
        pairs.append_pair("limit", &limit.to_string());
      }
    }
    Ok(url)
  }

  fn row_url(&self, resource: &str, id: &str) -> Result<Url> {
    let mut url = self.table_url(resource)?;
    url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
    Ok(url)
  }
}

#[async_trait]
impl Backend for RestBackend {
  async fn query(&self, query: &ResourceQuery) -> Result<Value> {
    let url = self.query_url(query)?;
    debug!(resource = %query.resource, url = %url, "backend query");

    let mut request = self.http.get(url);
    if query.single {
      request = request.header(ACCEPT, "application/vnd.pgrst.object+json");
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", query.resource, e))?
      .error_for_status()
      .map_err(|e| eyre!("Query on {} rejected: {}", query.resource, e))?;

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse {} rows: {}", query.resource, e))
  }

  async fn mutate(&self, mutation: &Mutation) -> Result<Value> {
    let request = match &mutation.op {
      MutationOp::Insert => self
        .http
        .post(self.table_url(&mutation.resource)?)
        .json(&mutation.payload),
      MutationOp::Update { id } => self
        .http
        .patch(self.row_url(&mutation.resource, id)?)
        .json(&mutation.payload),
      MutationOp::Delete { id } => self.http.delete(self.row_url(&mutation.resource, id)?),
    };
    debug!(resource = %mutation.resource, op = %mutation.change_op(), "backend mutation");

    let response = request
      .header("Prefer", "return=representation")
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", mutation.change_op(), mutation.resource, e))?
      .error_for_status()
      .map_err(|e| eyre!("{} on {} rejected: {}", mutation.change_op(), mutation.resource, e))?;

    let rows = response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", mutation.resource, e))?;

    // PostgREST returns the affected rows as an array.
    Ok(match rows {
      Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
      Value::Array(_) => Value::Null,
      row => row,
    })
  }

  async fn subscribe(&self, table: &str) -> Result<ChangeStream> {
    realtime::subscribe(&self.realtime, &self.api_key, &self.schema, table).await
  }
}

fn parse_base(raw: &str) -> Result<Url> {
  // A trailing slash keeps `join` from replacing the last path segment.
  let normalized = if raw.ends_with('/') {
    raw.to_string()
  } else {
    format!("{}/", raw)
  };
  Url::parse(&normalized).map_err(|e| eyre!("Invalid backend URL {}: {}", raw, e))
}

fn websocket_form(base: &Url) -> Result<Url> {
  let scheme = match base.scheme() {
    "https" => "wss",
    "http" => "ws",
    other => return Err(eyre!("Unsupported backend URL scheme: {}", other)),
  };
  let mut url = base.clone();
  url
    .set_scheme(scheme)
    .map_err(|_| eyre!("Cannot derive realtime URL from {}", base))?;
  Ok(url)
}
