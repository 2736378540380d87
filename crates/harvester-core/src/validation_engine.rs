//! Record validation, cleaning, duplicate detection and merging over a
//! [`RecordStore`].

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEvent, SharedAuditSink};
use crate::clock::SharedClock;
use crate::dedup::{DedupPolicy, DuplicateCandidate, find_candidates, plan_merge, similarity};
use crate::error::AppError;
use crate::record::{
    CvFields, CvRecord, IssueKind, MergeLogEntry, RawRecord, RecordCursor, RecordQuery,
    RecordStatus, fields_hash,
};
use crate::traits::RecordStore;
use crate::validation::{assess, clean_fields, field_presence, grade, score_bucket};

const MAX_CAS_ATTEMPTS: usize = 5;
const SCAN_CHUNK: usize = 500;
const MAX_MERGE_GROUP: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkValidateOptions {
    /// Compute the outcome without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkValidationReport {
    pub processed: u64,
    pub valid: u64,
    pub invalid: u64,
    /// Records whose status, score or issues would change.
    pub changed: u64,
    pub dry_run: bool,
}

/// Which records to search for duplicates.
#[derive(Debug, Clone, Default)]
pub struct DuplicateSearch {
    pub query: RecordQuery,
    /// Only report pairs involving this record.
    pub record_id: Option<Uuid>,
    /// Overrides the policy threshold.
    pub threshold: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueCount {
    pub field: String,
    pub kind: IssueKind,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub average_score: f64,
    pub common_issues: Vec<IssueCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBucket {
    pub range: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCompleteness {
    pub field: &'static str,
    pub present: u64,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: u64,
    pub average_score: f64,
    pub score_distribution: Vec<ScoreBucket>,
    pub grades: BTreeMap<String, u64>,
    pub field_completeness: Vec<FieldCompleteness>,
}

/// Counters from one ingest batch, fed into job progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub found: u64,
    pub validated: u64,
    pub invalid: u64,
    pub duplicate: u64,
    pub record_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct ValidationEngine<R: RecordStore> {
    records: R,
    clock: SharedClock,
    audit: SharedAuditSink,
    policy: DedupPolicy,
}

impl<R: RecordStore> ValidationEngine<R> {
    pub fn new(records: R, clock: SharedClock, audit: SharedAuditSink, policy: DedupPolicy) -> Self {
        Self {
            records,
            clock,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    pub async fn get_record(&self, id: Uuid) -> Result<CvRecord, AppError> {
        self.records
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("record", id))
    }

    /// Re-assess one record and store its status, score and issues.
    pub async fn validate_cv(&self, id: Uuid) -> Result<CvRecord, AppError> {
        let now = self.clock.now();
        self.modify(id, |record| {
            let changed = apply_assessment(record);
            if changed {
                record.updated_at = now;
            }
            changed
        })
        .await
    }

    pub async fn bulk_validate(
        &self,
        query: &RecordQuery,
        options: BulkValidateOptions,
    ) -> Result<BulkValidationReport, AppError> {
        let now = self.clock.now();
        let mut report = BulkValidationReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let mut cursor: Option<RecordCursor> = None;
        loop {
            let chunk = self.records.scan(query, cursor, SCAN_CHUNK).await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = Some(last.cursor());
            for mut record in chunk {
                report.processed += 1;
                let changed = apply_assessment(&mut record);
                match record.status {
                    RecordStatus::Validated => report.valid += 1,
                    RecordStatus::Invalid => report.invalid += 1,
                    _ => {}
                }
                if !changed {
                    continue;
                }
                report.changed += 1;
                if !options.dry_run {
                    record.updated_at = now;
                    if let Err(e) = self.records.update(&record).await {
                        tracing::warn!(record_id = %record.id, error = %e, "Skipped record in bulk validation");
                    }
                }
            }
        }
        tracing::info!(
            processed = report.processed,
            changed = report.changed,
            dry_run = report.dry_run,
            "Bulk validation finished"
        );
        Ok(report)
    }

    /// Normalize a record's fields. Cleaning a clean record writes nothing.
    pub async fn clean_data(&self, id: Uuid) -> Result<CvRecord, AppError> {
        let now = self.clock.now();
        self.modify(id, |record| {
            let cleaned = clean_fields(&record.fields);
            if cleaned == record.fields {
                return false;
            }
            record.fields = cleaned;
            record.content_hash = fields_hash(&record.fields);
            apply_assessment(record);
            record.updated_at = now;
            true
        })
        .await
    }

    pub async fn find_duplicates(
        &self,
        search: &DuplicateSearch,
    ) -> Result<Vec<DuplicateCandidate>, AppError> {
        let threshold = search.threshold.unwrap_or(self.policy.threshold);
        let pool = match search.record_id {
            Some(id) => {
                let focus = self.get_record(id).await?;
                let mut pool = self
                    .records
                    .find_by_contact(focus.fields.email.as_deref(), focus.fields.phone.as_deref())
                    .await?;
                pool.retain(|r| r.id != focus.id && search.query.matches(r));
                pool.push(focus);
                pool
            }
            None => self.scan_all(&search.query).await?,
        };
        let mut candidates = find_candidates(&pool, threshold, search.record_id);
        if let Some(limit) = search.limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    /// Fold duplicates into a primary as one atomic merge group.
    pub async fn merge_duplicates(
        &self,
        primary_id: Uuid,
        duplicate_ids: &[Uuid],
        actor: &str,
    ) -> Result<CvRecord, AppError> {
        if duplicate_ids.is_empty() {
            return Err(AppError::Validation("no duplicates given".into()));
        }
        if duplicate_ids.len() > MAX_MERGE_GROUP {
            return Err(AppError::Validation(format!(
                "at most {MAX_MERGE_GROUP} duplicates per merge"
            )));
        }
        let unique: HashSet<Uuid> = duplicate_ids.iter().copied().collect();
        if unique.len() != duplicate_ids.len() {
            return Err(AppError::Validation("duplicate ids repeat".into()));
        }
        if unique.contains(&primary_id) {
            return Err(AppError::Validation(
                "a record cannot be merged into itself".into(),
            ));
        }

        let primary = self.get_record(primary_id).await?;
        if !primary.is_canonical() {
            return Err(AppError::Validation(format!(
                "record {primary_id} is itself a duplicate"
            )));
        }
        let mut duplicates = Vec::with_capacity(duplicate_ids.len());
        for &id in duplicate_ids {
            let record = self.get_record(id).await?;
            if !record.is_canonical() {
                return Err(AppError::Validation(format!(
                    "record {id} is already merged"
                )));
            }
            duplicates.push(record);
        }

        let now = self.clock.now();
        let mut plan = plan_merge(&primary, &duplicates, self.policy.resolution, now);
        apply_assessment(&mut plan.primary);
        let merged = self.records.apply_merge(&plan).await?;

        tracing::info!(%primary_id, merged = duplicates.len(), conflicts = plan.log.len(), "Records merged");
        self.audit.emit(
            AuditEvent::new(actor, "record.merge", "record", primary_id, now)
                .before(&primary)
                .after(&merged),
        );
        Ok(merged)
    }

    pub async fn merge_log(&self, record_id: Uuid) -> Result<Vec<MergeLogEntry>, AppError> {
        self.get_record(record_id).await?;
        self.records.merge_log(record_id).await
    }

    pub async fn validation_statistics(
        &self,
        query: &RecordQuery,
    ) -> Result<ValidationStatistics, AppError> {
        let records = self.scan_all(query).await?;
        let mut by_status: BTreeMap<String, u64> = RecordStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut issues: HashMap<(String, IssueKind), u64> = HashMap::new();
        for record in &records {
            *by_status.entry(record.status.as_str().to_string()).or_default() += 1;
            for issue in &record.issues {
                *issues.entry((issue.field.clone(), issue.kind)).or_default() += 1;
            }
        }
        let mut common_issues: Vec<IssueCount> = issues
            .into_iter()
            .map(|((field, kind), count)| IssueCount { field, kind, count })
            .collect();
        common_issues.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.field.cmp(&b.field)));

        Ok(ValidationStatistics {
            total: records.len() as u64,
            by_status,
            average_score: average_score(&records),
            common_issues,
        })
    }

    pub async fn generate_quality_report(
        &self,
        query: &RecordQuery,
    ) -> Result<QualityReport, AppError> {
        let records = self.scan_all(query).await?;
        let total = records.len() as u64;

        let mut buckets = [0u64; 10];
        let mut grades: BTreeMap<String, u64> = ["A", "B", "C", "D", "F"]
            .iter()
            .map(|g| (g.to_string(), 0))
            .collect();
        let mut present: BTreeMap<&'static str, u64> = BTreeMap::new();
        for record in &records {
            buckets[score_bucket(record.quality_score)] += 1;
            *grades.entry(grade(record.quality_score).to_string()).or_default() += 1;
            for (field, has) in field_presence(&record.fields) {
                *present.entry(field).or_default() += u64::from(has);
            }
        }

        let score_distribution = buckets
            .iter()
            .enumerate()
            .map(|(i, &count)| ScoreBucket {
                range: format!("{:.1}-{:.1}", i as f64 / 10.0, (i + 1) as f64 / 10.0),
                count,
            })
            .collect();
        let field_completeness = field_presence(&CvFields::default())
            .map(|(field, _)| {
                let count = present.get(field).copied().unwrap_or(0);
                FieldCompleteness {
                    field,
                    present: count,
                    ratio: if total == 0 {
                        0.0
                    } else {
                        count as f64 / total as f64
                    },
                }
            })
            .collect();

        Ok(QualityReport {
            total,
            average_score: average_score(&records),
            score_distribution,
            grades,
            field_completeness,
        })
    }

    /// Persist fetched records: clean, validate, then fold exact and near
    /// duplicates into existing canonical records.
    pub async fn ingest(
        &self,
        source_id: Uuid,
        job_id: Option<Uuid>,
        raws: Vec<RawRecord>,
    ) -> Result<IngestSummary, AppError> {
        let mut summary = IngestSummary {
            found: raws.len() as u64,
            ..Default::default()
        };
        for raw in raws {
            let now = self.clock.now();
            let fields = clean_fields(&CvFields::from_raw(&raw));
            let mut record = CvRecord::new(source_id, job_id, fields, now);
            apply_assessment(&mut record);
            summary.record_ids.push(record.id);

            if let Some(existing) = self.records.find_by_hash(&record.content_hash).await? {
                record.duplicate_of = Some(existing.id);
                record.status = RecordStatus::Duplicate;
                record.merged_at = Some(now);
                self.records.insert(&record).await?;
                summary.duplicate += 1;
                continue;
            }

            self.records.insert(&record).await?;
            if record.status == RecordStatus::Invalid {
                summary.invalid += 1;
                continue;
            }

            if self.policy.auto_merge
                && let Some(primary) = self.best_match(&record).await?
            {
                match self.auto_merge(&primary, &record).await {
                    Ok(()) => {
                        summary.duplicate += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(record_id = %record.id, primary_id = %primary.id, error = %e, "Auto-merge skipped");
                    }
                }
            }
            summary.validated += 1;
        }
        Ok(summary)
    }

    async fn best_match(&self, record: &CvRecord) -> Result<Option<CvRecord>, AppError> {
        let candidates = self
            .records
            .find_by_contact(record.fields.email.as_deref(), record.fields.phone.as_deref())
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.id != record.id)
            .map(|c| (similarity(&c.fields, &record.fields).score, c))
            .filter(|(score, _)| *score >= self.policy.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, c)| c))
    }

    async fn auto_merge(&self, primary: &CvRecord, duplicate: &CvRecord) -> Result<(), AppError> {
        let mut plan = plan_merge(
            primary,
            std::slice::from_ref(duplicate),
            self.policy.resolution,
            self.clock.now(),
        );
        apply_assessment(&mut plan.primary);
        self.records.apply_merge(&plan).await?;
        tracing::debug!(primary_id = %primary.id, duplicate_id = %duplicate.id, "Near duplicate merged on ingest");
        Ok(())
    }

    async fn scan_all(&self, query: &RecordQuery) -> Result<Vec<CvRecord>, AppError> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let chunk = self.records.scan(query, cursor, SCAN_CHUNK).await?;
            let Some(last) = chunk.last() else {
                break;
            };
            cursor = Some(last.cursor());
            out.extend(chunk);
        }
        Ok(out)
    }

    async fn modify<F>(&self, id: Uuid, mut f: F) -> Result<CvRecord, AppError>
    where
        F: FnMut(&mut CvRecord) -> bool + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut record = self.get_record(id).await?;
            if !f(&mut record) {
                return Ok(record);
            }
            match self.records.update(&record).await {
                Ok(saved) => return Ok(saved),
                Err(AppError::VersionConflict { .. }) => {
                    tracing::debug!(record_id = %id, "Record version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::conflict("record", id))
    }
}

/// Store a fresh assessment on the record. Duplicates keep their status.
/// Returns true if anything changed.
fn apply_assessment(record: &mut CvRecord) -> bool {
    let assessment = assess(&record.fields);
    let status = if record.status == RecordStatus::Duplicate {
        RecordStatus::Duplicate
    } else if assessment.valid {
        RecordStatus::Validated
    } else {
        RecordStatus::Invalid
    };
    let changed = status != record.status
        || assessment.score != record.quality_score
        || assessment.issues != record.issues;
    record.status = status;
    record.quality_score = assessment.score;
    record.issues = assessment.issues;
    changed
}

fn average_score(records: &[CvRecord]) -> f64 {
    if records.is_empty() {
        0.0
    } else {
        records.iter().map(|r| r.quality_score).sum::<f64>() / records.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::dedup::ConflictResolution;
    use crate::memory::MemoryRecordStore;
    use crate::testutil::{MockAuditSink, raw_record};

    fn engine(policy: DedupPolicy) -> (ValidationEngine<MemoryRecordStore>, MemoryRecordStore) {
        let store = MemoryRecordStore::default();
        let engine = ValidationEngine::new(
            store.clone(),
            ManualClock::new(Utc::now()).shared(),
            MockAuditSink::new().shared(),
            policy,
        );
        (engine, store)
    }

    fn manual_merge() -> DedupPolicy {
        DedupPolicy {
            auto_merge: false,
            ..Default::default()
        }
    }

    async fn ingest_one(
        engine: &ValidationEngine<MemoryRecordStore>,
        raw: RawRecord,
    ) -> (IngestSummary, Uuid) {
        let summary = engine.ingest(Uuid::new_v4(), None, vec![raw]).await.unwrap();
        let id = summary.record_ids[0];
        (summary, id)
    }

    #[tokio::test]
    async fn test_ingest_cleans_and_validates() {
        let (engine, _) = engine(DedupPolicy::default());
        let raw = RawRecord::from_value(json!({
            "name": "  Ada\u{200B}  Lovelace ",
            "email": "ADA@Example.COM ",
            "skills": ["Rust", "rust", " SQL "],
        }))
        .unwrap();
        let (summary, id) = ingest_one(&engine, raw).await;
        assert_eq!(summary.validated, 1);

        let record = engine.get_record(id).await.unwrap();
        assert_eq!(record.fields.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(record.fields.email.as_deref(), Some("ada@example.com"));
        assert_eq!(record.fields.skills, vec!["Rust", "SQL"]);
        assert_eq!(record.status, RecordStatus::Validated);
    }

    #[tokio::test]
    async fn test_ingest_marks_invalid_without_contact() {
        let (engine, _) = engine(DedupPolicy::default());
        let raw = RawRecord::from_value(json!({"name": "Grace Hopper"})).unwrap();
        let (summary, id) = ingest_one(&engine, raw).await;
        assert_eq!(summary.invalid, 1);
        assert_eq!(engine.get_record(id).await.unwrap().status, RecordStatus::Invalid);
    }

    #[tokio::test]
    async fn test_exact_duplicate_on_ingest() {
        let (engine, _) = engine(manual_merge());
        let (_, first) = ingest_one(&engine, raw_record("Alan Turing", "alan@example.com")).await;
        let (summary, second) =
            ingest_one(&engine, raw_record("Alan Turing", "ALAN@example.com")).await;
        assert_eq!(summary.duplicate, 1);
        let dup = engine.get_record(second).await.unwrap();
        assert_eq!(dup.duplicate_of, Some(first));
    }

    #[tokio::test]
    async fn test_near_duplicate_auto_merged() {
        let (engine, _) = engine(DedupPolicy::default());
        let (_, first) = ingest_one(&engine, raw_record("Katherine Johnson", "kj@example.com")).await;
        let mut raw = raw_record("Katherine G. Johnson", "kj@example.com");
        raw.fields.insert("location".into(), json!("Hampton, VA"));
        let (summary, second) = ingest_one(&engine, raw).await;

        assert_eq!(summary.duplicate, 1);
        let primary = engine.get_record(first).await.unwrap();
        assert_eq!(primary.fields.location.as_deref(), Some("Hampton, VA"));
        assert_eq!(primary.fields.full_name.as_deref(), Some("Katherine Johnson"));
        assert_eq!(
            engine.get_record(second).await.unwrap().duplicate_of,
            Some(first)
        );
        assert!(!engine.merge_log(first).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_duplicates_never_returns_self() {
        let (engine, _) = engine(manual_merge());
        let (_, a) = ingest_one(&engine, raw_record("Linus Torvalds", "linus@example.com")).await;
        let (_, b) = ingest_one(&engine, raw_record("Linus B. Torvalds", "linus@example.com")).await;
        ingest_one(&engine, raw_record("Someone Else", "else@example.com")).await;

        let all = engine.find_duplicates(&DuplicateSearch::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.iter().all(|c| c.primary_id != c.duplicate_id));

        let focused = engine
            .find_duplicates(&DuplicateSearch {
                record_id: Some(a),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(focused.len(), 1);
        let pair = [focused[0].primary_id, focused[0].duplicate_id];
        assert!(pair.contains(&a) && pair.contains(&b));
    }

    #[tokio::test]
    async fn test_merge_leaves_one_canonical() {
        let (engine, store) = engine(manual_merge());
        let (_, p) = ingest_one(&engine, raw_record("Barbara Liskov", "bl@example.com")).await;
        let (_, d1) = ingest_one(&engine, raw_record("Barbara H. Liskov", "bl@example.com")).await;
        let (_, d2) = ingest_one(&engine, raw_record("B. Liskov", "bl@example.com")).await;

        engine.merge_duplicates(p, &[d1, d2], "curator").await.unwrap();

        let canonical = store
            .find_by_contact(Some("bl@example.com"), None)
            .await
            .unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, p);
        for id in [d1, d2] {
            let record = engine.get_record(id).await.unwrap();
            assert_eq!(record.duplicate_of, Some(p));
            assert_eq!(record.status, RecordStatus::Duplicate);
        }

        let again = engine.merge_duplicates(p, &[d1], "curator").await;
        assert!(matches!(again, Err(AppError::Validation(_))));
        let own = engine.merge_duplicates(p, &[p], "curator").await;
        assert!(matches!(own, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_prefer_longer_policy() {
        let policy = DedupPolicy {
            resolution: ConflictResolution::PreferLonger,
            auto_merge: false,
            ..Default::default()
        };
        let (engine, _) = engine(policy);
        let (_, p) = ingest_one(&engine, raw_record("Ken Thompson", "ken@example.com")).await;
        let (_, d) = ingest_one(&engine, raw_record("Kenneth Lane Thompson", "ken@example.com")).await;
        let merged = engine.merge_duplicates(p, &[d], "curator").await.unwrap();
        assert_eq!(merged.fields.full_name.as_deref(), Some("Kenneth Lane Thompson"));
    }

    #[tokio::test]
    async fn test_clean_data_is_idempotent() {
        let (engine, store) = engine(DedupPolicy::default());
        let dirty = CvFields {
            full_name: Some("  Margaret   Hamilton ".into()),
            email: Some("MH@Example.com".into()),
            ..Default::default()
        };
        let record = CvRecord::new(Uuid::new_v4(), None, dirty, Utc::now());
        store.insert(&record).await.unwrap();

        let once = engine.clean_data(record.id).await.unwrap();
        assert_eq!(once.fields.full_name.as_deref(), Some("Margaret Hamilton"));
        let twice = engine.clean_data(record.id).await.unwrap();
        assert_eq!(twice.version, once.version);
        assert_eq!(twice.fields, once.fields);
    }

    #[tokio::test]
    async fn test_bulk_validate_dry_run_writes_nothing() {
        let (engine, store) = engine(DedupPolicy::default());
        for name in ["Edsger Dijkstra", "Tony Hoare"] {
            let fields = CvFields {
                full_name: Some(name.into()),
                phone: Some("+31 20 555 0101".into()),
                ..Default::default()
            };
            store
                .insert(&CvRecord::new(Uuid::new_v4(), None, fields, Utc::now()))
                .await
                .unwrap();
        }

        let dry = engine
            .bulk_validate(&RecordQuery::default(), BulkValidateOptions { dry_run: true })
            .await
            .unwrap();
        assert_eq!(dry.processed, 2);
        assert_eq!(dry.changed, 2);
        let stats = engine.validation_statistics(&RecordQuery::default()).await.unwrap();
        assert_eq!(stats.by_status["raw"], 2);

        engine
            .bulk_validate(&RecordQuery::default(), BulkValidateOptions::default())
            .await
            .unwrap();
        let stats = engine.validation_statistics(&RecordQuery::default()).await.unwrap();
        assert_eq!(stats.by_status["validated"], 2);
    }

    #[tokio::test]
    async fn test_quality_report_buckets() {
        let (engine, _) = engine(manual_merge());
        ingest_one(&engine, raw_record("Donald Knuth", "dk@example.com")).await;
        ingest_one(&engine, raw_record("Leslie Lamport", "ll@example.com")).await;

        let report = engine
            .generate_quality_report(&RecordQuery::default())
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.score_distribution.len(), 10);
        let bucketed: u64 = report.score_distribution.iter().map(|b| b.count).sum();
        assert_eq!(bucketed, 2);
        let names = report
            .field_completeness
            .iter()
            .find(|f| f.field == "full_name")
            .unwrap();
        assert_eq!(names.ratio, 1.0);
    }
}
