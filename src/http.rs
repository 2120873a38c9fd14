//! Request and response values passed between clients, the worker and the network.

use color_eyre::{eyre::eyre, Report, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

/// Body served when neither the network nor the cache can answer.
pub const OFFLINE_BODY: &str = "Offline";

/// HTTP request method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }
}

impl FromStr for Method {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Normalized identity of a request inside a cache generation.
///
/// The URL is re-serialized by the `url` crate, so scheme and host casing and
/// default ports never produce distinct keys. Fragments are dropped because
/// they never reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.as_str(), url))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// An outgoing request issued by a client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Parse `target` as an absolute URL, or resolve it against `origin`.
  pub fn resolve(method: Method, origin: &Url, target: &str) -> Result<Self> {
    let url = Url::parse(target)
      .or_else(|_| origin.join(target))
      .map_err(|e| eyre!("Invalid request URL '{}': {}", target, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn cache_key(&self) -> RequestKey {
    RequestKey::new(self.method, &self.url)
  }
}

/// A response snapshot. Cloning it is how a response is "teed" into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  /// Placeholder returned when both network and cache fail.
  pub fn offline() -> Self {
    Self::new(503, OFFLINE_BODY).with_header("Content-Type", "text/plain; charset=utf-8")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}
