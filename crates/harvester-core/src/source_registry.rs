//! Source and proxy management, connectivity probes and source health.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEvent, SharedAuditSink};
use crate::clock::SharedClock;
use crate::error::AppError;
use crate::job::{JobFilter, JobStatus};
use crate::source::{
    CreateSourceRequest, HealthStatus, ProbeResult, Proxy, ProxyRequest, Source,
    SourceCategory, SourceFilter, UpdateProxyRequest, UpdateSourceRequest,
};
use crate::traits::{JobStore, Prober, SourceStore};

const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct SourceRegistryConfig {
    pub probe_timeout: Duration,
    /// Consecutive fetch failures before a healthy source is marked degraded.
    pub degraded_after: u32,
    /// Consecutive fetch failures before a source is marked down.
    pub down_after: u32,
}

impl Default for SourceRegistryConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            degraded_after: 5,
            down_after: 20,
        }
    }
}

/// Description of one source kind for clients building forms.
#[derive(Debug, Clone, Serialize)]
pub struct SourceTypeInfo {
    pub name: &'static str,
    pub queue: &'static str,
    pub required_fields: &'static [&'static str],
}

pub fn source_types() -> Vec<SourceTypeInfo> {
    vec![
        SourceTypeInfo {
            name: "listing_api",
            queue: "listing_api",
            required_fields: &["endpoint", "page_param", "page_size"],
        },
        SourceTypeInfo {
            name: "paginated_html",
            queue: "paginated_html",
            required_fields: &["list_path", "page_param", "item_selector"],
        },
        SourceTypeInfo {
            name: "file_import",
            queue: "file_import",
            required_fields: &["file_url", "format"],
        },
    ]
}

pub fn source_categories() -> Vec<&'static str> {
    SourceCategory::ALL.iter().map(|c| c.as_str()).collect()
}

#[derive(Clone)]
pub struct SourceRegistry<S: SourceStore, J: JobStore, P: Prober> {
    sources: S,
    jobs: J,
    prober: P,
    clock: SharedClock,
    audit: SharedAuditSink,
    config: SourceRegistryConfig,
}

impl<S: SourceStore, J: JobStore, P: Prober> SourceRegistry<S, J, P> {
    pub fn new(
        sources: S,
        jobs: J,
        prober: P,
        clock: SharedClock,
        audit: SharedAuditSink,
        config: SourceRegistryConfig,
    ) -> Self {
        Self {
            sources,
            jobs,
            prober,
            clock,
            audit,
            config,
        }
    }

    pub async fn create_source(
        &self,
        request: CreateSourceRequest,
        actor: &str,
    ) -> Result<Source, AppError> {
        request.validate()?;
        let source = Source::from_request(request, self.clock.now());
        self.sources.insert(&source).await?;
        tracing::info!(source_id = %source.id, kind = source.kind.type_name(), "Source created");
        self.audit.emit(
            AuditEvent::new(actor, "source.create", "source", source.id, source.created_at)
                .after(&source),
        );
        Ok(source)
    }

    pub async fn get_source(&self, id: Uuid) -> Result<Source, AppError> {
        self.sources
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("source", id))
    }

    pub async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>, AppError> {
        self.sources.list(filter).await
    }

    pub async fn update_source(
        &self,
        id: Uuid,
        request: UpdateSourceRequest,
        actor: &str,
    ) -> Result<Source, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |source| {
                request.clone().apply(source)?;
                source.updated_at = now;
                Ok(true)
            })
            .await?;
        self.audited(actor, "source.update", &before, &after);
        Ok(after)
    }

    /// Delete a source that no unfinished job depends on.
    pub async fn delete_source(&self, id: Uuid, actor: &str) -> Result<(), AppError> {
        let source = self.get_source(id).await?;
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Paused] {
            let filter = JobFilter {
                source_id: Some(id),
                ..JobFilter::with_status(status)
            };
            let blocking = self.jobs.count(&filter).await?;
            if blocking > 0 {
                return Err(AppError::Validation(format!(
                    "Source {id} still has {blocking} {status} job(s)"
                )));
            }
        }
        self.sources.delete(id).await?;
        tracing::info!(source_id = %id, %actor, "Source deleted");
        self.audit.emit(
            AuditEvent::new(actor, "source.delete", "source", id, self.clock.now())
                .before(&source),
        );
        Ok(())
    }

    /// Enable or disable a source without touching its configuration.
    pub async fn toggle_source_status(&self, id: Uuid, actor: &str) -> Result<Source, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |source| {
                source.is_active = !source.is_active;
                source.updated_at = now;
                Ok(true)
            })
            .await?;
        tracing::info!(source_id = %id, is_active = after.is_active, "Source toggled");
        self.audited(actor, "source.toggle", &before, &after);
        Ok(after)
    }

    pub async fn add_proxy(
        &self,
        source_id: Uuid,
        request: ProxyRequest,
        actor: &str,
    ) -> Result<Proxy, AppError> {
        let proxy = Proxy::from_request(request)?;
        let now = self.clock.now();
        let (before, after) = self
            .modify(source_id, |source| {
                if source
                    .proxies
                    .iter()
                    .any(|p| p.host == proxy.host && p.port == proxy.port)
                {
                    return Err(AppError::Validation(format!(
                        "Proxy {}:{} already configured",
                        proxy.host, proxy.port
                    )));
                }
                source.proxies.push(proxy.clone());
                source.updated_at = now;
                Ok(true)
            })
            .await?;
        self.audited(actor, "source.proxy.add", &before, &after);
        Ok(proxy)
    }

    pub async fn update_proxy(
        &self,
        source_id: Uuid,
        proxy_id: Uuid,
        request: UpdateProxyRequest,
        actor: &str,
    ) -> Result<Proxy, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(source_id, |source| {
                let proxy = source
                    .proxy_mut(proxy_id)
                    .ok_or_else(|| AppError::not_found("proxy", proxy_id))?;
                request.clone().apply(proxy)?;
                source.updated_at = now;
                Ok(true)
            })
            .await?;
        self.audited(actor, "source.proxy.update", &before, &after);
        after
            .proxy(proxy_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("proxy", proxy_id))
    }

    pub async fn remove_proxy(
        &self,
        source_id: Uuid,
        proxy_id: Uuid,
        actor: &str,
    ) -> Result<(), AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(source_id, |source| {
                let len = source.proxies.len();
                source.proxies.retain(|p| p.id != proxy_id);
                if source.proxies.len() == len {
                    return Err(AppError::not_found("proxy", proxy_id));
                }
                source.updated_at = now;
                Ok(true)
            })
            .await?;
        self.audited(actor, "source.proxy.remove", &before, &after);
        Ok(())
    }

    pub async fn list_proxies(&self, source_id: Uuid) -> Result<Vec<Proxy>, AppError> {
        Ok(self.get_source(source_id).await?.proxies)
    }

    /// Probe the source's base URL directly and record the resulting health.
    pub async fn test_source(&self, id: Uuid) -> Result<ProbeResult, AppError> {
        let source = self.get_source(id).await?;
        let result = self
            .prober
            .probe(&source.base_url, None, self.config.probe_timeout)
            .await;
        let now = self.clock.now();
        self.modify(id, |source| {
            source.health.last_checked_at = Some(now);
            if result.success {
                source.health.status = HealthStatus::Healthy;
                source.health.consecutive_failures = 0;
                source.health.reason = None;
            } else {
                source.health.status = HealthStatus::Degraded;
                source.health.reason = result.error.clone();
            }
            Ok(true)
        })
        .await?;
        tracing::info!(source_id = %id, success = result.success, latency_ms = result.latency_ms, "Source tested");
        Ok(result)
    }

    /// Probe the source's base URL through one proxy and record its test metadata.
    pub async fn test_proxy(&self, source_id: Uuid, proxy_id: Uuid) -> Result<ProbeResult, AppError> {
        let source = self.get_source(source_id).await?;
        let proxy = source
            .proxy(proxy_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("proxy", proxy_id))?;
        let result = self
            .prober
            .probe(&source.base_url, Some(&proxy), self.config.probe_timeout)
            .await;
        let now = self.clock.now();
        self.modify(source_id, |source| {
            let Some(proxy) = source.proxy_mut(proxy_id) else {
                return Ok(false);
            };
            proxy.last_tested_at = Some(now);
            if result.success {
                proxy.last_latency_ms = Some(result.latency_ms);
                proxy.consecutive_failures = 0;
            } else {
                proxy.consecutive_failures += 1;
            }
            Ok(true)
        })
        .await?;
        tracing::info!(%source_id, %proxy_id, success = result.success, "Proxy tested");
        Ok(result)
    }

    /// Mark a source degraded with a reason.
    pub async fn mark_degraded(&self, id: Uuid, reason: &str) -> Result<Source, AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |source| {
                if source.health.status == HealthStatus::Degraded
                    && source.health.reason.as_deref() == Some(reason)
                {
                    return Ok(false);
                }
                if source.health.status != HealthStatus::Down {
                    source.health.status = HealthStatus::Degraded;
                }
                source.health.reason = Some(reason.to_string());
                source.health.last_checked_at = Some(now);
                Ok(true)
            })
            .await?;
        if before.health.status != after.health.status {
            tracing::warn!(source_id = %id, %reason, "Source degraded");
        }
        Ok(after)
    }

    /// A fetch through this source succeeded.
    pub async fn record_success(&self, id: Uuid) -> Result<(), AppError> {
        let now = self.clock.now();
        let (before, after) = self
            .modify(id, |source| {
                if source.health.status == HealthStatus::Healthy
                    && source.health.consecutive_failures == 0
                {
                    return Ok(false);
                }
                source.health.status = HealthStatus::Healthy;
                source.health.consecutive_failures = 0;
                source.health.reason = None;
                source.health.last_checked_at = Some(now);
                Ok(true)
            })
            .await?;
        if before.health.status != after.health.status {
            tracing::info!(source_id = %id, "Source healthy again");
        }
        Ok(())
    }

    /// A fetch through this source failed for a reason not charged to a proxy.
    pub async fn record_failure(&self, id: Uuid, reason: &str) -> Result<(), AppError> {
        let now = self.clock.now();
        let degraded_after = self.config.degraded_after;
        let down_after = self.config.down_after;
        let (before, after) = self
            .modify(id, |source| {
                let health = &mut source.health;
                health.consecutive_failures += 1;
                health.last_checked_at = Some(now);
                if health.consecutive_failures >= down_after {
                    health.status = HealthStatus::Down;
                    health.reason = Some(reason.to_string());
                } else if health.consecutive_failures >= degraded_after
                    && health.status == HealthStatus::Healthy
                {
                    health.status = HealthStatus::Degraded;
                    health.reason = Some(reason.to_string());
                }
                Ok(true)
            })
            .await?;
        if before.health.status != after.health.status {
            tracing::warn!(
                source_id = %id,
                status = %after.health.status,
                failures = after.health.consecutive_failures,
                "Source health changed"
            );
        }
        Ok(())
    }

    async fn modify<F>(&self, id: Uuid, mut f: F) -> Result<(Source, Source), AppError>
    where
        F: FnMut(&mut Source) -> Result<bool, AppError> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_source(id).await?;
            let mut next = current.clone();
            if !f(&mut next)? {
                return Ok((current.clone(), current));
            }
            match self.sources.update(&next).await {
                Ok(saved) => return Ok((current, saved)),
                Err(AppError::VersionConflict { .. }) => {
                    tracing::debug!(source_id = %id, "Source version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::conflict("source", id))
    }

    fn audited(&self, actor: &str, action: &str, before: &Source, after: &Source) {
        self.audit.emit(
            AuditEvent::new(actor, action, "source", after.id, after.updated_at)
                .before(before)
                .after(after),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryJobStore, MemorySourceStore};
    use crate::source::{ProxyProtocol, RateLimitPolicy, SourceKind};
    use crate::testutil::{MockAuditSink, MockProber, job_fixture};

    type Registry = SourceRegistry<MemorySourceStore, MemoryJobStore, MockProber>;

    fn registry(prober: MockProber) -> (Registry, MemoryJobStore, MockAuditSink) {
        let jobs = MemoryJobStore::default();
        let audit = MockAuditSink::new();
        let registry = SourceRegistry::new(
            MemorySourceStore::default(),
            jobs.clone(),
            prober,
            ManualClock::new(Utc::now()).shared(),
            audit.shared(),
            SourceRegistryConfig::default(),
        );
        (registry, jobs, audit)
    }

    fn create_request() -> CreateSourceRequest {
        CreateSourceRequest {
            name: "Job board".into(),
            kind: SourceKind::ListingApi {
                endpoint: "/v1/candidates".into(),
                page_param: "page".into(),
                page_size: 50,
                records_path: Some("data".into()),
            },
            base_url: "https://board.example.com".into(),
            credentials: None,
            rate_limit: RateLimitPolicy::default(),
            category: SourceCategory::JobBoard,
        }
    }

    fn proxy_request(port: u16) -> ProxyRequest {
        ProxyRequest {
            host: "proxy.example.net".into(),
            port,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
        }
    }

    #[tokio::test]
    async fn test_create_validates_kind_fields() {
        let (registry, _, _) = registry(MockProber::ok(20));
        let mut request = create_request();
        request.kind = SourceKind::PaginatedHtml {
            list_path: "/people".into(),
            page_param: "p".into(),
            item_selector: "".into(),
        };
        let err = registry.create_source(request, "admin").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_proxy_crud() {
        let (registry, _, audit) = registry(MockProber::ok(20));
        let source = registry.create_source(create_request(), "admin").await.unwrap();

        let proxy = registry
            .add_proxy(source.id, proxy_request(8080), "admin")
            .await
            .unwrap();
        let dup = registry
            .add_proxy(source.id, proxy_request(8080), "admin")
            .await;
        assert!(dup.is_err());

        let updated = registry
            .update_proxy(
                source.id,
                proxy.id,
                UpdateProxyRequest {
                    port: Some(9090),
                    is_active: Some(false),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .unwrap();
        assert_eq!(updated.port, 9090);
        assert!(!updated.is_active);

        registry.remove_proxy(source.id, proxy.id, "admin").await.unwrap();
        assert!(registry.list_proxies(source.id).await.unwrap().is_empty());
        assert!(
            registry
                .remove_proxy(source.id, proxy.id, "admin")
                .await
                .is_err()
        );
        assert_eq!(
            audit.actions(),
            vec![
                "source.create",
                "source.proxy.add",
                "source.proxy.update",
                "source.proxy.remove"
            ]
        );
    }

    #[tokio::test]
    async fn test_toggle_keeps_config() {
        let (registry, _, _) = registry(MockProber::ok(20));
        let source = registry.create_source(create_request(), "admin").await.unwrap();
        let toggled = registry.toggle_source_status(source.id, "admin").await.unwrap();
        assert!(!toggled.is_active);
        assert_eq!(toggled.kind, source.kind);
        assert!(!toggled.is_dispatchable());
    }

    #[tokio::test]
    async fn test_source_probe_sets_health() {
        let (registry, _, _) = registry(MockProber::failing("connection refused"));
        let source = registry.create_source(create_request(), "admin").await.unwrap();

        let result = registry.test_source(source.id).await.unwrap();
        assert!(!result.success);
        let stored = registry.get_source(source.id).await.unwrap();
        assert_eq!(stored.health.status, HealthStatus::Degraded);
        assert_eq!(stored.health.reason.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_proxy_probe_records_metadata() {
        let prober = MockProber::ok(42);
        let (registry, _, _) = registry(prober.clone());
        let source = registry.create_source(create_request(), "admin").await.unwrap();
        let proxy = registry
            .add_proxy(source.id, proxy_request(3128), "admin")
            .await
            .unwrap();

        let result = registry.test_proxy(source.id, proxy.id).await.unwrap();
        assert!(result.success);
        let stored = registry.list_proxies(source.id).await.unwrap();
        assert_eq!(stored[0].last_latency_ms, Some(42));
        assert!(stored[0].last_tested_at.is_some());
        assert_eq!(prober.calls(), vec![(source.base_url.clone(), Some(proxy.id))]);
    }

    #[tokio::test]
    async fn test_failures_degrade_then_success_heals() {
        let (registry, _, _) = registry(MockProber::ok(1));
        let source = registry.create_source(create_request(), "admin").await.unwrap();
        for _ in 0..4 {
            registry.record_failure(source.id, "timeout").await.unwrap();
        }
        assert_eq!(
            registry.get_source(source.id).await.unwrap().health.status,
            HealthStatus::Healthy
        );
        registry.record_failure(source.id, "timeout").await.unwrap();
        assert_eq!(
            registry.get_source(source.id).await.unwrap().health.status,
            HealthStatus::Degraded
        );

        registry.record_success(source.id).await.unwrap();
        let healed = registry.get_source(source.id).await.unwrap();
        assert_eq!(healed.health.status, HealthStatus::Healthy);
        assert_eq!(healed.health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_delete_blocked_by_unfinished_jobs() {
        let (registry, jobs, _) = registry(MockProber::ok(1));
        let source = registry.create_source(create_request(), "admin").await.unwrap();
        let mut job = job_fixture(source.id);
        job.status = JobStatus::Running;
        jobs.insert(&job).await.unwrap();

        let err = registry.delete_source(source.id, "admin").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        job.status = JobStatus::Cancelled;
        jobs.update(&job).await.unwrap();
        registry.delete_source(source.id, "admin").await.unwrap();
        assert!(registry.get_source(source.id).await.is_err());
    }

    #[test]
    fn test_type_catalogue() {
        let names: Vec<&str> = source_types().iter().map(|t| t.name).collect();
        assert_eq!(names, crate::source::QUEUE_NAMES.to_vec());
        assert_eq!(source_categories().len(), 5);
    }
}
