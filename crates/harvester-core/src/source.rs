use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;

/// Name of the task queue serving each source kind.
pub const QUEUE_NAMES: [&str; 3] = ["listing_api", "paginated_html", "file_import"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    Csv,
    Json,
}

/// How records are pulled from a source. Each variant carries the fields it
/// needs and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    ListingApi {
        /// Path appended to the source base URL.
        endpoint: String,
        page_param: String,
        page_size: u32,
        /// Dotted path to the record array in the response body.
        #[serde(default)]
        records_path: Option<String>,
    },
    PaginatedHtml {
        list_path: String,
        page_param: String,
        item_selector: String,
    },
    FileImport {
        file_url: String,
        format: ImportFormat,
    },
}

impl SourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceKind::ListingApi { .. } => "listing_api",
            SourceKind::PaginatedHtml { .. } => "paginated_html",
            SourceKind::FileImport { .. } => "file_import",
        }
    }

    /// Queue that carries this kind's tasks.
    pub fn queue_name(&self) -> &'static str {
        self.type_name()
    }

    /// File imports are fetched in one task regardless of page count.
    pub fn is_paged(&self) -> bool {
        !matches!(self, SourceKind::FileImport { .. })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        fn required(field: &str, value: &str) -> Result<(), AppError> {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{field} must not be empty")));
            }
            Ok(())
        }

        match self {
            SourceKind::ListingApi {
                endpoint,
                page_param,
                page_size,
                ..
            } => {
                required("endpoint", endpoint)?;
                required("page_param", page_param)?;
                if *page_size == 0 || *page_size > 1000 {
                    return Err(AppError::Validation(
                        "page_size must be between 1 and 1000".into(),
                    ));
                }
            }
            SourceKind::PaginatedHtml {
                list_path,
                page_param,
                item_selector,
            } => {
                required("list_path", list_path)?;
                required("page_param", page_param)?;
                required("item_selector", item_selector)?;
            }
            SourceKind::FileImport { file_url, .. } => {
                validate_http_url("file_url", file_url)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    JobBoard,
    ProfessionalNetwork,
    Freelance,
    Internal,
    Other,
}

impl SourceCategory {
    pub const ALL: [SourceCategory; 5] = [
        SourceCategory::JobBoard,
        SourceCategory::ProfessionalNetwork,
        SourceCategory::Freelance,
        SourceCategory::Internal,
        SourceCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCategory::JobBoard => "job_board",
            SourceCategory::ProfessionalNetwork => "professional_network",
            SourceCategory::Freelance => "freelance",
            SourceCategory::Internal => "internal",
            SourceCategory::Other => "other",
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown source category: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "down" => Ok(HealthStatus::Down),
            _ => Err(format!("Unknown health status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_checked_at: None,
            reason: None,
        }
    }
}

/// Per-source request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    pub max_concurrent: u32,
    /// How long an excluded proxy stays out of rotation.
    pub cooldown_seconds: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            max_concurrent: 2,
            cooldown_seconds: 300,
        }
    }
}

impl RateLimitPolicy {
    /// Token bucket capacity: a tenth of a minute's budget, at least one.
    pub fn burst(&self) -> u32 {
        (self.requests_per_minute / 6).max(1)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.requests_per_minute == 0 {
            return Err(AppError::Validation(
                "requests_per_minute must be positive".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(AppError::Validation("max_concurrent must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" => Ok(ProxyProtocol::Socks5),
            _ => Err(format!("Unknown proxy protocol: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub is_active: bool,
}

impl Proxy {
    pub fn from_request(request: ProxyRequest) -> Result<Self, AppError> {
        request.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            host: request.host,
            port: request.port,
            username: request.username,
            password: request.password,
            protocol: request.protocol,
            last_tested_at: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            is_active: true,
        })
    }

    /// Proxy URL including credentials, as understood by HTTP clients.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol.as_str(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
}

impl ProxyRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.host.trim().is_empty() {
            return Err(AppError::Validation("proxy host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(AppError::Validation("proxy port must be positive".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(AppError::Validation(
                "proxy username and password must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Partial update of a proxy. Credentials are replaced as a pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProxyRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<ProxyProtocol>,
    #[serde(default)]
    pub credentials: Option<(String, String)>,
    pub is_active: Option<bool>,
}

impl UpdateProxyRequest {
    pub fn apply(self, proxy: &mut Proxy) -> Result<(), AppError> {
        let (username, password) = match self.credentials {
            Some((user, pass)) => (Some(user), Some(pass)),
            None => (proxy.username.clone(), proxy.password.clone()),
        };
        let merged = ProxyRequest {
            host: self.host.unwrap_or_else(|| proxy.host.clone()),
            port: self.port.unwrap_or(proxy.port),
            username,
            password,
            protocol: self.protocol.unwrap_or(proxy.protocol),
        };
        merged.validate()?;
        proxy.host = merged.host;
        proxy.port = merged.port;
        proxy.username = merged.username;
        proxy.password = merged.password;
        proxy.protocol = merged.protocol;
        if let Some(active) = self.is_active {
            proxy.is_active = active;
            if active {
                proxy.consecutive_failures = 0;
            }
        }
        Ok(())
    }
}

/// A configured origin of candidate records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub proxies: Vec<Proxy>,
    pub rate_limit: RateLimitPolicy,
    pub category: SourceCategory,
    pub health: SourceHealth,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Source {
    pub fn from_request(request: CreateSourceRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            kind: request.kind,
            base_url: request.base_url,
            credentials: request.credentials,
            proxies: Vec::new(),
            rate_limit: request.rate_limit,
            category: request.category,
            health: SourceHealth::default(),
            is_active: true,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Tasks of this source may be handed to workers.
    pub fn is_dispatchable(&self) -> bool {
        self.is_active && self.health.status != HealthStatus::Down
    }

    pub fn active_proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.iter().filter(|p| p.is_active)
    }

    pub fn proxy(&self, id: Uuid) -> Option<&Proxy> {
        self.proxies.iter().find(|p| p.id == id)
    }

    pub fn proxy_mut(&mut self, id: Uuid) -> Option<&mut Proxy> {
        self.proxies.iter_mut().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    pub category: SourceCategory,
}

impl CreateSourceRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("source name must not be empty".into()));
        }
        validate_http_url("base_url", &self.base_url)?;
        self.kind.validate()?;
        self.rate_limit.validate()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSourceRequest {
    pub name: Option<String>,
    pub kind: Option<SourceKind>,
    pub base_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub category: Option<SourceCategory>,
}

impl UpdateSourceRequest {
    pub fn apply(self, source: &mut Source) -> Result<(), AppError> {
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(AppError::Validation("source name must not be empty".into()));
            }
            source.name = name;
        }
        if let Some(kind) = self.kind {
            kind.validate()?;
            source.kind = kind;
        }
        if let Some(base_url) = self.base_url {
            validate_http_url("base_url", &base_url)?;
            source.base_url = base_url;
        }
        if let Some(credentials) = self.credentials {
            source.credentials = Some(credentials);
        }
        if let Some(rate_limit) = self.rate_limit {
            rate_limit.validate()?;
            source.rate_limit = rate_limit;
        }
        if let Some(category) = self.category {
            source.category = category;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub category: Option<SourceCategory>,
    pub kind: Option<String>,
    pub is_active: Option<bool>,
    pub health: Option<HealthStatus>,
}

impl SourceFilter {
    pub fn matches(&self, source: &Source) -> bool {
        self.category.is_none_or(|c| source.category == c)
            && self
                .kind
                .as_deref()
                .is_none_or(|k| source.kind.type_name() == k)
            && self.is_active.is_none_or(|a| source.is_active == a)
            && self.health.is_none_or(|h| source.health.status == h)
    }
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

fn validate_http_url(field: &str, value: &str) -> Result<(), AppError> {
    let url = Url::parse(value)
        .map_err(|e| AppError::Validation(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "{field} must use http or https"
        )));
    }
    Ok(())
}
