//! Shared reqwest plumbing: one client per proxy, auth, and error mapping.

use std::time::Duration;

use harvester_core::error::FetchError;
use harvester_core::source::{Credentials, Proxy};
use moka::future::Cache;
use reqwest::{Client, RequestBuilder, StatusCode};
use uuid::Uuid;

const USER_AGENT: &str = "Harvester/0.1";

/// Builds reqwest clients and keeps one per proxy so connections are pooled.
#[derive(Clone)]
pub(crate) struct ClientPool {
    direct: Client,
    proxied: Cache<Uuid, Client>,
    timeout: Duration,
}

impl ClientPool {
    pub(crate) fn new(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            direct: build_client(timeout, None)?,
            proxied: Cache::builder()
                .max_capacity(256)
                .time_to_idle(Duration::from_secs(600))
                .build(),
            timeout,
        })
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) async fn client(&self, proxy: Option<&Proxy>) -> Result<Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let timeout = self.timeout;
        self.proxied
            .try_get_with(proxy.id, async move { build_client(timeout, Some(proxy)) })
            .await
            .map_err(|e| (*e).clone())
    }
}

fn build_client(timeout: Duration, proxy: Option<&Proxy>) -> Result<Client, FetchError> {
    let mut builder = Client::builder().user_agent(USER_AGENT).timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|e| FetchError::Proxy(format!("Invalid proxy {}: {e}", proxy.host)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {e}")))
}

/// Attach source credentials: an API key as a bearer token, otherwise basic auth.
pub(crate) fn authorize(request: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
    match credentials {
        Some(Credentials {
            api_key: Some(key), ..
        }) => request.bearer_auth(key),
        Some(Credentials {
            username: Some(user),
            password,
            ..
        }) => request.basic_auth(user, password.as_ref()),
        _ => request,
    }
}

/// Map a transport failure. Connection failures through a proxy are charged
/// to the proxy.
pub(crate) fn transport_error(err: reqwest::Error, proxied: bool, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout.as_secs())
    } else if err.is_connect() && proxied {
        FetchError::Proxy(err.to_string())
    } else if err.is_decode() {
        FetchError::Parse(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Map a non-success status. `None` for 2xx.
pub(crate) fn status_error(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            FetchError::Proxy("proxy authentication required".into())
        }
        other => FetchError::Blocked(other.as_u16()),
    })
}
