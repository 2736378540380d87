use chrono::{TimeDelta, Utc};
use harvester_core::AppError;
use harvester_core::dedup::MergePlan;
use harvester_core::record::{
    CvFields, CvRecord, MergeLogEntry, MergeResolution, RecordQuery, RecordStatus,
};
use harvester_core::traits::RecordStore;
use uuid::Uuid;

use crate::common::setup_test_db;

fn candidate(name: &str, email: Option<&str>, phone: Option<&str>) -> CvRecord {
    let fields = CvFields {
        full_name: Some(name.into()),
        email: email.map(str::to_string),
        phone: phone.map(str::to_string),
        skills: vec!["Rust".into()],
        ..Default::default()
    };
    CvRecord::new(Uuid::new_v4(), None, fields, Utc::now())
}

#[tokio::test]
async fn contact_and_hash_lookups_only_return_canonical_records() {
    let (db, _container) = setup_test_db().await;
    let records = db.record_store();

    let ada = candidate("Ada Lovelace", Some("ada@example.com"), None);
    records.insert(&ada).await.unwrap();
    let mut copy = candidate("Ada Lovelace", Some("ada@example.com"), None);
    copy.duplicate_of = Some(ada.id);
    copy.status = RecordStatus::Duplicate;
    records.insert(&copy).await.unwrap();
    let grace = candidate("Grace Hopper", None, Some("+1 (555) 010-2030"));
    records.insert(&grace).await.unwrap();

    let by_email = records
        .find_by_contact(Some("ADA@example.com"), None)
        .await
        .unwrap();
    assert_eq!(by_email.len(), 1);
    assert_eq!(by_email[0].id, ada.id);

    let by_phone = records
        .find_by_contact(None, Some("555-010-2030"))
        .await
        .unwrap();
    assert_eq!(by_phone.len(), 1);
    assert_eq!(by_phone[0].id, grace.id);

    assert!(records.find_by_contact(None, None).await.unwrap().is_empty());

    let by_hash = records.find_by_hash(&ada.content_hash).await.unwrap();
    assert_eq!(by_hash.map(|r| r.id), Some(ada.id));
}

#[tokio::test]
async fn scan_pages_in_creation_order() {
    let (db, _container) = setup_test_db().await;
    let records = db.record_store();
    let base = Utc::now() - TimeDelta::hours(1);

    let mut inserted = Vec::new();
    for i in 0..5 {
        let mut record = candidate(&format!("Candidate {i}"), None, None);
        record.created_at = base + TimeDelta::seconds(i);
        records.insert(&record).await.unwrap();
        inserted.push(record.id);
    }

    let query = RecordQuery::default();
    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = records.scan(&query, cursor, 2).await.unwrap();
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(CvRecord::cursor);
        seen.extend(page.into_iter().map(|r| r.id));
    }
    assert_eq!(seen, inserted);
    assert_eq!(records.count(&query).await.unwrap(), 5);
}

#[tokio::test]
async fn query_filters_match_the_in_memory_semantics() {
    let (db, _container) = setup_test_db().await;
    let records = db.record_store();

    let mut grace = candidate("Grace Hopper", Some("grace@example.com"), None);
    grace.status = RecordStatus::Validated;
    grace.quality_score = 0.8;
    records.insert(&grace).await.unwrap();
    let mut alan = candidate("Alan Turing", Some("alan@example.com"), None);
    alan.quality_score = 0.3;
    records.insert(&alan).await.unwrap();

    let query = RecordQuery {
        name_contains: Some("HOPPER".into()),
        ..Default::default()
    };
    assert_eq!(records.count(&query).await.unwrap(), 1);

    let query = RecordQuery {
        min_score: Some(0.5),
        status: Some(RecordStatus::Validated),
        ..Default::default()
    };
    let matched = records.scan(&query, None, 10).await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, grace.id);
    assert!(query.matches(&matched[0]));
}

#[tokio::test]
async fn update_is_a_version_check() {
    let (db, _container) = setup_test_db().await;
    let records = db.record_store();

    let record = candidate("Edsger Dijkstra", Some("ewd@example.com"), None);
    records.insert(&record).await.unwrap();

    let mut changed = record.clone();
    changed.status = RecordStatus::Validated;
    changed.fields.email = Some("edsger@example.com".into());
    let saved = records.update(&changed).await.unwrap();
    assert_eq!(saved.version, 1);

    // The contact index follows the new email.
    let found = records
        .find_by_contact(Some("edsger@example.com"), None)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    let err = records.update(&changed).await.unwrap_err();
    assert!(matches!(err, AppError::VersionConflict { .. }));
}

#[tokio::test]
async fn merge_group_is_all_or_nothing() {
    let (db, _container) = setup_test_db().await;
    let records = db.record_store();
    let now = Utc::now();

    let primary = candidate("Barbara Liskov", Some("bl@example.com"), None);
    let dup = candidate("B. Liskov", Some("bl@example.com"), Some("+1 555 0100 200"));
    records.insert(&primary).await.unwrap();
    records.insert(&dup).await.unwrap();

    let mut merged_primary = primary.clone();
    merged_primary.fields.phone = dup.fields.phone.clone();
    merged_primary.merged_at = Some(now);
    let mut merged_dup = dup.clone();
    merged_dup.duplicate_of = Some(primary.id);
    merged_dup.status = RecordStatus::Duplicate;
    merged_dup.merged_at = Some(now);
    let log = vec![MergeLogEntry {
        primary_id: primary.id,
        duplicate_id: dup.id,
        field: "phone".into(),
        primary_value: None,
        duplicate_value: dup.fields.phone.clone(),
        resolution: MergeResolution::FilledEmpty,
        merged_at: now,
    }];

    let mut stale_dup = merged_dup.clone();
    stale_dup.version = 7;
    let stale = MergePlan {
        primary: merged_primary.clone(),
        duplicates: vec![stale_dup],
        log: log.clone(),
    };
    let err = records.apply_merge(&stale).await.unwrap_err();
    assert!(matches!(err, AppError::VersionConflict { .. }));
    let untouched = records.get(primary.id).await.unwrap().unwrap();
    assert_eq!(untouched.version, 0);
    assert!(untouched.fields.phone.is_none());
    assert!(records.merge_log(primary.id).await.unwrap().is_empty());

    let plan = MergePlan {
        primary: merged_primary,
        duplicates: vec![merged_dup],
        log,
    };
    let survivor = records.apply_merge(&plan).await.unwrap();
    assert_eq!(survivor.version, 1);
    assert_eq!(survivor.fields.phone, dup.fields.phone);

    let folded = records.get(dup.id).await.unwrap().unwrap();
    assert_eq!(folded.duplicate_of, Some(primary.id));
    let entries = records.merge_log(dup.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].resolution, MergeResolution::FilledEmpty);
}
