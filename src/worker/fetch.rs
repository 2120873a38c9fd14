//! Fetch interception: network first, cache on failure, offline placeholder last.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::Worker;
use crate::http::{Method, Request, RequestKey, Response};

/// Which requests are intercepted and which responses are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
  /// URL substrings of realtime/streaming endpoints
  pub realtime_markers: Vec<String>,
  /// Path substring identifying API calls
  pub api_marker: String,
  /// Extensions (without dot) of cacheable static assets
  pub static_extensions: Vec<String>,
  /// Path substring identifying the static assets directory
  pub static_segment: String,
}

impl Default for FetchPolicy {
  fn default() -> Self {
    Self {
      realtime_markers: vec!["socket.io".to_string()],
      api_marker: "/api/".to_string(),
      static_extensions: ["js", "css", "png", "jpg", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      static_segment: "/static/".to_string(),
    }
  }
}

/// Why a request was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
  Realtime,
  Api,
  Method(Method),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; goes straight to the network with no caching
  Bypass(BypassReason),
  NetworkFirst,
}

impl FetchPolicy {
  pub fn route(&self, request: &Request) -> Route {
    if self
      .realtime_markers
      .iter()
      .any(|m| request.url.as_str().contains(m.as_str()))
    {
      return Route::Bypass(BypassReason::Realtime);
    }
    if request.path().contains(&self.api_marker) {
      return Route::Bypass(BypassReason::Api);
    }
    if request.method != Method::Get {
      return Route::Bypass(BypassReason::Method(request.method));
    }
    Route::NetworkFirst
  }

  /// Root document, static extensions, or anything under the static segment.
  pub fn is_static_asset(&self, url: &Url) -> bool {
    let path = url.path();
    path == "/"
      || path.contains(&self.static_segment)
      || self
        .static_extensions
        .iter()
        .any(|ext| path.ends_with(&format!(".{}", ext)))
  }

  pub fn should_store(&self, request: &Request, response: &Response) -> bool {
    request.method == Method::Get && response.status == 200 && self.is_static_asset(&request.url)
  }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  Network,
  Cache,
  /// Synthesized placeholder, neither network nor cache could answer
  Offline,
  /// A write was queued for later replay
  Queued,
  /// Unexpired copy of an API response, served while offline
  Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// The worker did not respond; the caller performs a plain network fetch
  Passthrough(BypassReason),
  Responded {
    response: Response,
    source: FetchSource,
  },
}

impl Worker {
  pub async fn on_fetch(&self, request: &Request) -> FetchOutcome {
    if let Route::Bypass(reason) = self.ctx.policy.route(request) {
      debug!(url = %request.url, ?reason, "bypassed");
      return FetchOutcome::Passthrough(reason);
    }

    match self.ctx.network.fetch(request).await {
      Ok(response) => {
        if self.ctx.policy.should_store(request, &response) {
          self.store_detached(request.cache_key(), response.clone());
        }
        FetchOutcome::Responded {
          response,
          source: FetchSource::Network,
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        self.cache_fallback(request).await
      }
    }
  }

  async fn cache_fallback(&self, request: &Request) -> FetchOutcome {
    match self.ctx.cache.match_any(&request.cache_key()).await {
      Ok(Some(stored)) => {
        info!(url = %request.url, "served from cache");
        FetchOutcome::Responded {
          response: stored.response,
          source: FetchSource::Cache,
        }
      }
      Ok(None) => FetchOutcome::Responded {
        response: Response::offline(),
        source: FetchSource::Offline,
      },
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        FetchOutcome::Responded {
          response: Response::offline(),
          source: FetchSource::Offline,
        }
      }
    }
  }

  /// Write to this generation without making the response wait for it.
  /// The write is tracked in the shared [`PendingWrites`](super::PendingWrites).
  fn store_detached(&self, key: RequestKey, response: Response) {
    let cache = Arc::clone(&self.ctx.cache);
    let tag = self.tag.clone();
    self.ctx.writes.spawn(async move {
      if let Err(e) = cache.put(&tag, &key, &response).await {
        warn!(%key, error = %e, "failed to cache response");
      }
    });
  }
}
