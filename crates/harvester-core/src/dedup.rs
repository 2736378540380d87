//! Duplicate detection and merge planning.
//!
//! Candidates are blocked by normalized email and phone digits, then scored
//! with Jaro-Winkler over the fields both records carry. Fields missing on
//! either side drop out and their weight is redistributed.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{CvFields, CvRecord, MergeLogEntry, MergeResolution, RecordStatus, fields_hash};
use crate::validation::{normalize_email, phone_digits};

const SIMILARITY_WEIGHTS: [(&str, f64); 5] = [
    ("full_name", 0.45),
    ("email", 0.25),
    ("phone", 0.20),
    ("location", 0.05),
    ("headline", 0.05),
];

/// Field similarity at or above this counts as a match for reporting.
const FIELD_MATCH: f64 = 0.9;

/// How conflicting non-empty values are settled when folding a duplicate
/// into its primary. Empty primary fields are always filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    PrimaryWins,
    PreferLonger,
    PreferNewer,
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_wins" => Ok(ConflictResolution::PrimaryWins),
            "prefer_longer" => Ok(ConflictResolution::PreferLonger),
            "prefer_newer" => Ok(ConflictResolution::PreferNewer),
            _ => Err(format!("Unknown conflict resolution: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupPolicy {
    pub threshold: f64,
    pub resolution: ConflictResolution,
    /// Fold near-duplicates into an existing canonical record on ingest.
    pub auto_merge: bool,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            resolution: ConflictResolution::PrimaryWins,
            auto_merge: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Similarity {
    pub score: f64,
    pub matched_on: Vec<&'static str>,
}

fn text_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
}

fn phone_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (phone_digits(a), phone_digits(b));
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    // Same number with and without a country prefix.
    if short.len() >= 7 && long.ends_with(&short) {
        1.0
    } else {
        0.0
    }
}

fn field_similarity(field: &str, a: &CvFields, b: &CvFields) -> Option<f64> {
    let pair = |x: &Option<String>, y: &Option<String>| match (x, y) {
        (Some(x), Some(y)) => Some((x.clone(), y.clone())),
        _ => None,
    };
    match field {
        "full_name" => pair(&a.full_name, &b.full_name).map(|(x, y)| text_similarity(&x, &y)),
        "email" => pair(&a.email, &b.email).map(|(x, y)| {
            if normalize_email(&x) == normalize_email(&y) {
                1.0
            } else {
                0.0
            }
        }),
        "phone" => pair(&a.phone, &b.phone).map(|(x, y)| phone_similarity(&x, &y)),
        "location" => pair(&a.location, &b.location).map(|(x, y)| text_similarity(&x, &y)),
        "headline" => pair(&a.headline, &b.headline).map(|(x, y)| text_similarity(&x, &y)),
        _ => None,
    }
}

/// Weighted similarity of two field sets in [0, 1].
pub fn similarity(a: &CvFields, b: &CvFields) -> Similarity {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    let mut matched_on = Vec::new();

    for (field, weight) in SIMILARITY_WEIGHTS {
        if let Some(sim) = field_similarity(field, a, b) {
            weighted += weight * sim;
            total_weight += weight;
            if sim >= FIELD_MATCH {
                matched_on.push(field);
            }
        }
    }

    let score = if total_weight == 0.0 {
        0.0
    } else {
        weighted / total_weight
    };
    Similarity { score, matched_on }
}

/// Keys that put two records in the same comparison block.
pub fn blocking_keys(fields: &CvFields) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(email) = fields.email.as_deref() {
        let email = normalize_email(email);
        if !email.is_empty() {
            keys.push(format!("email:{email}"));
        }
    }
    if let Some(phone) = fields.phone.as_deref() {
        let digits = phone_digits(phone);
        if digits.len() >= 7 {
            // Suffix so numbers with and without a country code collide.
            keys.push(format!("phone:{}", &digits[digits.len() - 7..]));
        }
    }
    keys
}

/// A suspected duplicate pair. `primary_id` is the suggested survivor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidate {
    pub primary_id: Uuid,
    pub duplicate_id: Uuid,
    pub score: f64,
    pub matched_on: Vec<&'static str>,
}

/// The better record survives: higher score, then older.
fn survivor<'a>(a: &'a CvRecord, b: &'a CvRecord) -> (&'a CvRecord, &'a CvRecord) {
    let a_first = match b.quality_score.partial_cmp(&a.quality_score) {
        Some(std::cmp::Ordering::Less) => true,
        Some(std::cmp::Ordering::Greater) => false,
        _ => a.cursor() <= b.cursor(),
    };
    if a_first { (a, b) } else { (b, a) }
}

/// Pairwise duplicates among canonical records, never pairing a record with
/// itself. With `focus`, only pairs involving that record are reported.
pub fn find_candidates(
    records: &[CvRecord],
    threshold: f64,
    focus: Option<Uuid>,
) -> Vec<DuplicateCandidate> {
    let mut blocks: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        if !record.is_canonical() {
            continue;
        }
        for key in blocking_keys(&record.fields) {
            blocks.entry(key).or_default().push(idx);
        }
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for members in blocks.values() {
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                let (ra, rb) = (&records[a], &records[b]);
                if ra.id == rb.id {
                    continue;
                }
                if focus.is_some_and(|f| ra.id != f && rb.id != f) {
                    continue;
                }
                let pair = if ra.id < rb.id {
                    (ra.id, rb.id)
                } else {
                    (rb.id, ra.id)
                };
                if !seen.insert(pair) {
                    continue;
                }
                let sim = similarity(&ra.fields, &rb.fields);
                if sim.score >= threshold {
                    let (primary, duplicate) = survivor(ra, rb);
                    candidates.push(DuplicateCandidate {
                        primary_id: primary.id,
                        duplicate_id: duplicate.id,
                        score: sim.score,
                        matched_on: sim.matched_on,
                    });
                }
            }
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
}

/// Everything one merge group writes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Primary with merged fields; `version` is the version read.
    pub primary: CvRecord,
    /// Duplicates marked `duplicate_of` the primary; `version` is the version read.
    pub duplicates: Vec<CvRecord>,
    pub log: Vec<MergeLogEntry>,
}

struct FieldMerge<'a> {
    primary_id: Uuid,
    duplicate_id: Uuid,
    resolution: ConflictResolution,
    duplicate_is_newer: bool,
    now: DateTime<Utc>,
    log: &'a mut Vec<MergeLogEntry>,
}

impl FieldMerge<'_> {
    fn text(&mut self, field: &str, primary: &mut Option<String>, duplicate: &Option<String>) {
        let Some(dup) = duplicate else {
            return;
        };
        let resolution = match primary.as_deref() {
            None => MergeResolution::FilledEmpty,
            Some(current) if current == dup.as_str() => return,
            Some(current) => {
                let take = match self.resolution {
                    ConflictResolution::PrimaryWins => false,
                    ConflictResolution::PreferLonger => dup.chars().count() > current.chars().count(),
                    ConflictResolution::PreferNewer => self.duplicate_is_newer,
                };
                if take {
                    MergeResolution::TookDuplicate
                } else {
                    MergeResolution::KeptPrimary
                }
            }
        };

        self.log.push(MergeLogEntry {
            primary_id: self.primary_id,
            duplicate_id: self.duplicate_id,
            field: field.to_string(),
            primary_value: primary.clone(),
            duplicate_value: Some(dup.clone()),
            resolution,
            merged_at: self.now,
        });
        if resolution != MergeResolution::KeptPrimary {
            *primary = Some(dup.clone());
        }
    }
}

/// Fold `duplicates` into `primary`, recording every field decision.
pub fn plan_merge(
    primary: &CvRecord,
    duplicates: &[CvRecord],
    resolution: ConflictResolution,
    now: DateTime<Utc>,
) -> MergePlan {
    let mut merged = primary.clone();
    let mut log = Vec::new();
    let mut marked = Vec::with_capacity(duplicates.len());

    for dup in duplicates {
        let mut step = FieldMerge {
            primary_id: primary.id,
            duplicate_id: dup.id,
            resolution,
            duplicate_is_newer: dup.updated_at > merged.updated_at,
            now,
            log: &mut log,
        };
        let fields = &mut merged.fields;
        step.text("full_name", &mut fields.full_name, &dup.fields.full_name);
        step.text("email", &mut fields.email, &dup.fields.email);
        step.text("phone", &mut fields.phone, &dup.fields.phone);
        step.text("location", &mut fields.location, &dup.fields.location);
        step.text("headline", &mut fields.headline, &dup.fields.headline);
        step.text("summary", &mut fields.summary, &dup.fields.summary);

        let mut years = fields.experience_years.map(|y| y.to_string());
        step.text(
            "experience_years",
            &mut years,
            &dup.fields.experience_years.map(|y| y.to_string()),
        );
        fields.experience_years = years.and_then(|y| y.parse().ok());

        let known: HashSet<String> = fields.skills.iter().map(|s| s.to_lowercase()).collect();
        let added: Vec<String> = dup
            .fields
            .skills
            .iter()
            .filter(|s| !known.contains(&s.to_lowercase()))
            .cloned()
            .collect();
        if !added.is_empty() {
            log.push(MergeLogEntry {
                primary_id: primary.id,
                duplicate_id: dup.id,
                field: "skills".into(),
                primary_value: Some(fields.skills.join(", ")).filter(|s| !s.is_empty()),
                duplicate_value: Some(dup.fields.skills.join(", ")),
                resolution: if fields.skills.is_empty() {
                    MergeResolution::FilledEmpty
                } else {
                    MergeResolution::TookDuplicate
                },
                merged_at: now,
            });
            fields.skills.extend(added);
        }

        for (key, value) in &dup.fields.extra {
            fields.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let mut dup_record = dup.clone();
        dup_record.duplicate_of = Some(primary.id);
        dup_record.status = RecordStatus::Duplicate;
        dup_record.merged_at = Some(now);
        dup_record.updated_at = now;
        marked.push(dup_record);
    }

    merged.content_hash = fields_hash(&merged.fields);
    merged.updated_at = now;

    MergePlan {
        primary: merged,
        duplicates: marked,
        log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(name: &str, email: Option<&str>, phone: Option<&str>) -> CvRecord {
        CvRecord::new(
            Uuid::new_v4(),
            None,
            CvFields {
                full_name: Some(name.into()),
                email: email.map(Into::into),
                phone: phone.map(Into::into),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_similarity_identical() {
        let a = record("Ada Lovelace", Some("ada@example.com"), None);
        let sim = similarity(&a.fields, &a.fields);
        assert!((sim.score - 1.0).abs() < 1e-9);
        assert_eq!(sim.matched_on, vec!["full_name", "email"]);
    }

    #[test]
    fn test_similarity_redistributes_missing_fields() {
        let a = record("Ada Lovelace", Some("ada@example.com"), Some("+44 20 7946 0958"));
        let b = record("Ada Lovelace", Some("ada@example.com"), None);
        assert!((similarity(&a.fields, &b.fields).score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_email_different_person_below_threshold() {
        let a = record("Ada Lovelace", Some("shared@example.com"), None);
        let b = record("Charles Babbage", Some("shared@example.com"), None);
        assert!(similarity(&a.fields, &b.fields).score < DedupPolicy::default().threshold);
    }

    #[test]
    fn test_phone_with_country_code_matches() {
        assert_eq!(phone_similarity("+1 555 123 4567", "5551234567"), 1.0);
        assert_eq!(phone_similarity("5551234567", "5559999999"), 0.0);
    }

    #[test]
    fn test_find_candidates_never_pairs_self() {
        let a = record("Ada Lovelace", Some("ada@example.com"), Some("5551234567"));
        let b = record("Ada  Lovelace", Some("ADA@example.com"), Some("+1 555 123 4567"));
        let c = record("Someone Else", Some("other@example.com"), None);
        let records = vec![a.clone(), b.clone(), c, a.clone()];

        let candidates = find_candidates(&records, 0.85, None);
        assert_eq!(candidates.len(), 1);
        assert!(candidates.iter().all(|c| c.primary_id != c.duplicate_id));

        let focused = find_candidates(&records, 0.85, Some(b.id));
        assert_eq!(focused.len(), 1);
    }

    #[test]
    fn test_find_candidates_skips_merged_records() {
        let a = record("Ada Lovelace", Some("ada@example.com"), None);
        let mut b = record("Ada Lovelace", Some("ada@example.com"), None);
        b.duplicate_of = Some(a.id);
        assert!(find_candidates(&[a, b], 0.85, None).is_empty());
    }

    #[test]
    fn test_plan_merge_primary_wins_and_fills_empty() {
        let mut primary = record("Ada Lovelace", Some("ada@example.com"), None);
        primary.fields.skills = vec!["math".into()];
        let mut dup = record("Ada King", Some("ada@example.com"), Some("5551234567"));
        dup.fields.skills = vec!["Math".into(), "poetry".into()];

        let plan = plan_merge(&primary, &[dup.clone()], ConflictResolution::PrimaryWins, Utc::now());
        assert_eq!(plan.primary.fields.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(plan.primary.fields.phone.as_deref(), Some("5551234567"));
        assert_eq!(plan.primary.fields.skills, vec!["math".to_string(), "poetry".to_string()]);

        let name_entry = plan.log.iter().find(|e| e.field == "full_name").unwrap();
        assert_eq!(name_entry.resolution, MergeResolution::KeptPrimary);
        let phone_entry = plan.log.iter().find(|e| e.field == "phone").unwrap();
        assert_eq!(phone_entry.resolution, MergeResolution::FilledEmpty);
        assert!(plan.log.iter().all(|e| e.field != "email"));

        assert_eq!(plan.duplicates.len(), 1);
        assert_eq!(plan.duplicates[0].duplicate_of, Some(primary.id));
        assert_eq!(plan.duplicates[0].status, RecordStatus::Duplicate);
    }

    #[test]
    fn test_plan_merge_prefer_longer_and_newer() {
        let primary = record("Ada L", None, None);
        let mut dup = record("Ada Lovelace", None, None);

        let plan = plan_merge(&primary, &[dup.clone()], ConflictResolution::PreferLonger, Utc::now());
        assert_eq!(plan.primary.fields.full_name.as_deref(), Some("Ada Lovelace"));

        dup.fields.full_name = Some("A".into());
        dup.updated_at = primary.updated_at + TimeDelta::seconds(10);
        let plan = plan_merge(&primary, &[dup], ConflictResolution::PreferNewer, Utc::now());
        assert_eq!(plan.primary.fields.full_name.as_deref(), Some("A"));
    }
}
