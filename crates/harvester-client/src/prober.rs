use std::time::{Duration, Instant};

use harvester_core::error::FetchError;
use harvester_core::source::{ProbeResult, Proxy};
use harvester_core::traits::Prober;
use url::Url;

use crate::guard::validate_url;
use crate::http::{ClientPool, status_error, transport_error};

/// Connectivity check: a GET against the URL, optionally through a proxy.
///
/// Any answer below 400 counts as reachable. Authentication failures (401,
/// 403) are reported as failures so misconfigured credentials surface.
#[derive(Clone)]
pub struct HttpProber {
    clients: ClientPool,
    private_urls: bool,
}

impl HttpProber {
    /// `timeout` caps the client; each probe may ask for less.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            clients: ClientPool::new(timeout)?,
            private_urls: false,
        })
    }

    /// Allow probes of private and loopback addresses.
    pub fn allow_private_urls(mut self) -> Self {
        self.private_urls = true;
        self
    }

    async fn try_probe(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::Unsupported(format!("Invalid URL: {e}")))?;
        if !self.private_urls {
            validate_url(&url).await?;
        }
        let client = self.clients.client(proxy).await?;
        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, proxy.is_some(), timeout))?;

        let status = response.status();
        if status.is_redirection() || status.is_informational() {
            return Ok(());
        }
        match status_error(status) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Prober for HttpProber {
    async fn probe(&self, url: &str, proxy: Option<&Proxy>, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let result = self.try_probe(url, proxy, timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::debug!(%url, latency_ms, "Probe succeeded");
                ProbeResult {
                    success: true,
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                tracing::info!(%url, latency_ms, error = %e, "Probe failed");
                ProbeResult {
                    success: false,
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_fails_without_request() {
        let prober = HttpProber::new(Duration::from_secs(1)).unwrap();
        let result = prober.probe("not a url", None, Duration::from_secs(1)).await;
        assert!(!result.success);
        assert!(result.error.is_some_and(|e| e.contains("Invalid URL")));
    }

    #[tokio::test]
    async fn test_internal_address_is_refused() {
        let prober = HttpProber::new(Duration::from_secs(1)).unwrap();
        let result = prober
            .probe("http://127.0.0.1:9/health", None, Duration::from_secs(1))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some_and(|e| e.contains("internal address")));
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_failure() {
        let prober = HttpProber::new(Duration::from_secs(2))
            .unwrap()
            .allow_private_urls();
        // Port 9 (discard) is closed on loopback in test environments.
        let result = prober
            .probe("http://127.0.0.1:9/", None, Duration::from_secs(2))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
