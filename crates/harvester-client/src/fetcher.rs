use std::time::Duration;

use harvester_core::error::FetchError;
use harvester_core::queue::QueueTask;
use harvester_core::record::RawRecord;
use harvester_core::source::{ImportFormat, Proxy, Source, SourceKind};
use harvester_core::traits::Fetcher;
use serde_json::Value;
use url::Url;

use crate::guard::validate_url;
use crate::http::{ClientPool, authorize, status_error, transport_error};

/// HTTP fetcher for listing APIs and file imports.
///
/// Listing APIs are requested page by page (`page_param=<page>`) and the
/// record array is read from `records_path`. File imports download the whole
/// file in one task and parse it as CSV or a JSON array. Paginated HTML needs
/// per-site extraction and is reported as unsupported.
///
/// Requests to private or reserved addresses are refused unless
/// [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct HttpFetcher {
    clients: ClientPool,
    private_urls: bool,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            clients: ClientPool::new(timeout)?,
            private_urls: false,
        })
    }

    /// Allow requests to private and loopback addresses.
    pub fn allow_private_urls(mut self) -> Self {
        self.private_urls = true;
        self
    }

    async fn get(&self, url: Url, source: &Source, proxy: Option<&Proxy>) -> Result<Vec<u8>, FetchError> {
        if !self.private_urls {
            validate_url(&url).await?;
        }
        let client = self.clients.client(proxy).await?;
        let timeout = self.clients.timeout();
        let request = authorize(client.get(url.clone()), source.credentials.as_ref());

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, proxy.is_some(), timeout))?;
        if let Some(error) = status_error(response.status()) {
            tracing::debug!(%url, status = response.status().as_u16(), "Upstream refused request");
            return Err(error);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, proxy.is_some(), timeout))?;
        Ok(body.to_vec())
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        task: &QueueTask,
        source: &Source,
        proxy: Option<&Proxy>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        match &source.kind {
            SourceKind::ListingApi {
                endpoint,
                page_param,
                page_size,
                records_path,
            } => {
                let mut url = join(&source.base_url, endpoint)?;
                url.query_pairs_mut()
                    .append_pair(page_param, &task.payload.page.to_string());
                if let Some(cursor) = &task.payload.cursor {
                    url.query_pairs_mut().append_pair("cursor", cursor);
                }
                let body = self.get(url, source, proxy).await?;
                let value: Value = serde_json::from_slice(&body)
                    .map_err(|e| FetchError::Parse(format!("Invalid JSON response: {e}")))?;
                let records = extract_records(&value, records_path.as_deref())?;
                if records.len() > *page_size as usize {
                    tracing::debug!(
                        source_id = %source.id,
                        page = task.payload.page,
                        returned = records.len(),
                        page_size,
                        "Page larger than configured page size"
                    );
                }
                Ok(records)
            }
            SourceKind::FileImport { file_url, format } => {
                let url = join(&source.base_url, file_url)?;
                let body = self.get(url, source, proxy).await?;
                match format {
                    ImportFormat::Csv => parse_csv(&body),
                    ImportFormat::Json => {
                        let value: Value = serde_json::from_slice(&body)
                            .map_err(|e| FetchError::Parse(format!("Invalid JSON file: {e}")))?;
                        extract_records(&value, None)
                    }
                }
            }
            SourceKind::PaginatedHtml { .. } => Err(FetchError::Unsupported(
                "paginated HTML sources need a site-specific fetcher".into(),
            )),
        }
    }
}

/// Resolve `path` against the source base URL. Absolute URLs are used as-is.
fn join(base: &str, path: &str) -> Result<Url, FetchError> {
    if let Ok(absolute) = Url::parse(path) {
        return Ok(absolute);
    }
    let mut base =
        Url::parse(base).map_err(|e| FetchError::Unsupported(format!("Invalid base URL: {e}")))?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| FetchError::Unsupported(format!("Invalid path {path}: {e}")))
}

/// Follow a dotted path to the record array. Non-object items are skipped.
fn extract_records(body: &Value, path: Option<&str>) -> Result<Vec<RawRecord>, FetchError> {
    let mut node = body;
    if let Some(path) = path.filter(|p| !p.is_empty()) {
        for segment in path.split('.') {
            node = node
                .get(segment)
                .ok_or_else(|| FetchError::Parse(format!("Response has no field '{path}'")))?;
        }
    }
    let Value::Array(items) = node else {
        return Err(FetchError::Parse("Expected an array of records".into()));
    };

    let total = items.len();
    let records: Vec<RawRecord> = items.iter().cloned().filter_map(RawRecord::from_value).collect();
    if records.len() < total {
        tracing::warn!(skipped = total - records.len(), "Skipped non-object records");
    }
    Ok(records)
}

/// One record per CSV row, keyed by header. Empty cells are left out.
fn parse_csv(body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body);
    let headers = reader
        .headers()
        .map_err(|e| FetchError::Parse(format!("Invalid CSV header: {e}")))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| FetchError::Parse(format!("Invalid CSV row: {e}")))?;
        let fields = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();
        records.push(RawRecord::new(fields));
    }
    Ok(records)
}
