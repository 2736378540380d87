use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Field map exactly as a fetcher produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: serde_json::Map<String, Value>,
}

impl RawRecord {
    pub fn new(fields: serde_json::Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Wraps a JSON object; anything else yields `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }
}

/// Candidate profile fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CvFields {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub headline: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub experience_years: Option<f64>,
    pub summary: Option<String>,
    /// Source-specific fields with no canonical slot.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

const NAME_KEYS: &[&str] = &["full_name", "fullName", "name"];
const EMAIL_KEYS: &[&str] = &["email", "email_address", "emailAddress", "mail"];
const PHONE_KEYS: &[&str] = &["phone", "phone_number", "phoneNumber", "mobile"];
const LOCATION_KEYS: &[&str] = &["location", "city", "address"];
const HEADLINE_KEYS: &[&str] = &["headline", "title", "position"];
const SKILLS_KEYS: &[&str] = &["skills", "skill_list", "technologies"];
const EXPERIENCE_KEYS: &[&str] = &["experience_years", "years_experience", "experience"];
const SUMMARY_KEYS: &[&str] = &["summary", "bio", "about"];

impl CvFields {
    /// Map a raw record onto canonical fields, accepting common key aliases.
    /// Keys that match no canonical field are kept in `extra`.
    pub fn from_raw(raw: &RawRecord) -> Self {
        let mut extra = BTreeMap::new();
        let mut fields = CvFields::default();

        for (key, value) in &raw.fields {
            let k = key.as_str();
            if NAME_KEYS.contains(&k) {
                fields.full_name = fields.full_name.or_else(|| as_text(value));
            } else if EMAIL_KEYS.contains(&k) {
                fields.email = fields.email.or_else(|| as_text(value));
            } else if PHONE_KEYS.contains(&k) {
                fields.phone = fields.phone.or_else(|| as_text(value));
            } else if LOCATION_KEYS.contains(&k) {
                fields.location = fields.location.or_else(|| as_text(value));
            } else if HEADLINE_KEYS.contains(&k) {
                fields.headline = fields.headline.or_else(|| as_text(value));
            } else if SKILLS_KEYS.contains(&k) {
                if fields.skills.is_empty() {
                    fields.skills = as_list(value);
                }
            } else if EXPERIENCE_KEYS.contains(&k) {
                fields.experience_years = fields.experience_years.or_else(|| as_number(value));
            } else if SUMMARY_KEYS.contains(&k) {
                fields.summary = fields.summary.or_else(|| as_text(value));
            } else {
                extra.insert(key.clone(), value.clone());
            }
        }

        fields.extra = extra;
        fields
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(as_text).collect(),
        Value::String(s) => s.split([',', ';']).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Raw,
    Validated,
    Invalid,
    Duplicate,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::Raw,
        RecordStatus::Validated,
        RecordStatus::Invalid,
        RecordStatus::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Raw => "raw",
            RecordStatus::Validated => "validated",
            RecordStatus::Invalid => "invalid",
            RecordStatus::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("Unknown record status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Missing,
    Format,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub kind: IssueKind,
    pub message: String,
}

/// A candidate profile in the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub job_id: Option<Uuid>,
    pub fields: CvFields,
    pub content_hash: String,
    pub status: RecordStatus,
    pub quality_score: f64,
    pub issues: Vec<ValidationIssue>,
    /// Canonical record this one was merged into.
    pub duplicate_of: Option<Uuid>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl CvRecord {
    pub fn new(
        source_id: Uuid,
        job_id: Option<Uuid>,
        fields: CvFields,
        now: DateTime<Utc>,
    ) -> Self {
        let content_hash = fields_hash(&fields);
        Self {
            id: Uuid::new_v4(),
            source_id,
            job_id,
            fields,
            content_hash,
            status: RecordStatus::Raw,
            quality_score: 0.0,
            issues: Vec::new(),
            duplicate_of: None,
            merged_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.duplicate_of.is_none()
    }

    pub fn cursor(&self) -> RecordCursor {
        RecordCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content hash of a field set. Field order is fixed by the struct and the
/// `extra` map is ordered, so equal fields hash equally.
pub fn fields_hash(fields: &CvFields) -> String {
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    compute_hash(&canonical)
}

/// Position in a `(created_at, id)` ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Filter over the record corpus, shared by validation, export and reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub source_id: Option<Uuid>,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the candidate name.
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl RecordQuery {
    pub fn matches(&self, record: &CvRecord) -> bool {
        self.source_id.is_none_or(|s| record.source_id == s)
            && self.job_id.is_none_or(|j| record.job_id == Some(j))
            && self.status.is_none_or(|s| record.status == s)
            && self.min_score.is_none_or(|m| record.quality_score >= m)
            && self.created_after.is_none_or(|t| record.created_at >= t)
            && self.created_before.is_none_or(|t| record.created_at < t)
            && self.name_contains.as_deref().is_none_or(|needle| {
                record
                    .fields
                    .full_name
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase().contains(&needle.to_lowercase()))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeResolution {
    KeptPrimary,
    TookDuplicate,
    FilledEmpty,
}

impl MergeResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeResolution::KeptPrimary => "kept_primary",
            MergeResolution::TookDuplicate => "took_duplicate",
            MergeResolution::FilledEmpty => "filled_empty",
        }
    }
}

impl FromStr for MergeResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kept_primary" => Ok(MergeResolution::KeptPrimary),
            "took_duplicate" => Ok(MergeResolution::TookDuplicate),
            "filled_empty" => Ok(MergeResolution::FilledEmpty),
            _ => Err(format!("Unknown merge resolution: {s}")),
        }
    }
}

/// One field decision made while folding a duplicate into its primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub primary_id: Uuid,
    pub duplicate_id: Uuid,
    pub field: String,
    pub primary_value: Option<String>,
    pub duplicate_value: Option<String>,
    pub resolution: MergeResolution,
    pub merged_at: DateTime<Utc>,
}
