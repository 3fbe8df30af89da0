mod common;

use std::time::Duration;

use anyhow::Result;
use common::{test_config, FailureMode, TestApp};
use doclib::jobs::PERMANENT_ERROR_CODE;
use doclib::models::{
    ExtractionMethod, IndexStatus, JobStatus, StorageBackendKind, StoragePolicy, SyncStatus,
    FULL_TEXT_CONTENT,
};
use doclib::pipeline::UploadRequest;
use doclib::repository::Repository;
use doclib::storage::{hybrid::BACKUP_FAILURE_TRIGGER, StoreRequest};
use doclib::strategy::MB;
use doclib::QueueName;
use uuid::Uuid;

fn upload(organization_id: Uuid, name: &str, mime: &str, bytes: Vec<u8>) -> UploadRequest {
    UploadRequest {
        store: StoreRequest::new(organization_id, name, mime, bytes),
        force_sync: false,
    }
}

#[tokio::test]
async fn small_urgent_pdf_is_extracted_inline_and_indexed() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    let body = b"Boiler inspection is due on Monday".to_vec();

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "urgent-notice.pdf", "application/pdf", body))
        .await?;

    assert!(outcome.processed_inline);
    assert_eq!(outcome.plan.method, ExtractionMethod::FastPdf);
    assert_eq!(outcome.plan.priority, 7);
    assert!(!outcome.plan.use_async);
    assert_eq!(outcome.extraction_status, JobStatus::Completed);

    let content = app
        .repo
        .get_extracted_text(outcome.file.id, FULL_TEXT_CONTENT)
        .await?
        .expect("extracted text stored");
    assert_eq!(content.word_count, 6);
    assert_eq!(content.extraction_job_id, Some(outcome.extraction_job_id));

    // indexing is only enqueued, never run inline
    assert!(app.search.document(outcome.file.id).await.is_none());
    app.drain().await?;

    let document = app
        .search
        .document(outcome.file.id)
        .await
        .expect("document indexed");
    assert_eq!(document.organization_id, org);
    assert_eq!(document.title, "urgent-notice.pdf");
    let status = app.repo.get_index_status(outcome.file.id).await?.unwrap();
    assert_eq!(status.status, IndexStatus::Indexed);
    assert_eq!(app.extractor.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn large_pdf_is_queued_for_async_ocr() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    let bytes = vec![b'a'; 12 * MB as usize];

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "quarterly-report.pdf", "application/pdf", bytes))
        .await?;

    assert!(!outcome.processed_inline);
    assert_eq!(outcome.plan.method, ExtractionMethod::AsyncOcr);
    assert_eq!(outcome.plan.priority, 7);
    assert!(outcome.plan.use_async);
    assert_eq!(outcome.extraction_status, JobStatus::Pending);
    assert_eq!(app.extractor.calls(), 0);

    let entries = app.repo.queue_entries().await;
    let extraction: Vec<_> = entries
        .iter()
        .filter(|entry| entry.queue == QueueName::Extraction.as_str())
        .collect();
    assert_eq!(extraction.len(), 1);
    assert_eq!(extraction[0].priority, 7);

    app.drain().await?;
    assert_eq!(app.extractor.methods(), vec![ExtractionMethod::AsyncOcr]);
    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(app.search.document(outcome.file.id).await.is_some());
    Ok(())
}

#[tokio::test]
async fn failed_inline_extraction_falls_back_to_queue_without_spending_a_retry() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.extractor.set_mode(FailureMode::Transient);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(
            org,
            "urgent-notice.pdf",
            "application/pdf",
            b"Evacuation drill".to_vec(),
        ))
        .await?;

    assert!(!outcome.processed_inline);
    assert_eq!(outcome.extraction_status, JobStatus::Pending);
    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.retry_count, 0);

    app.extractor.set_mode(FailureMode::None);
    app.drain().await?;

    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(app.extractor.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn transient_failures_stop_at_the_retry_limit() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.extractor.set_mode(FailureMode::Transient);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "notes.txt", "text/plain", b"meeting notes".to_vec()))
        .await?;
    assert!(!outcome.processed_inline);

    app.drain().await?;

    let max_retries = app.state.config.pipeline.extraction_max_retries;
    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, max_retries);
    assert_eq!(app.extractor.calls(), max_retries as usize);

    // another sweep must not revive an exhausted job
    let report = app.state.queue.process_pending_database_jobs().await?;
    assert_eq!(report.enqueued_extraction_jobs, 0);
    app.drain().await?;
    assert_eq!(app.extractor.calls(), max_retries as usize);
    Ok(())
}

#[tokio::test]
async fn hung_extraction_is_cut_off_and_retried() -> Result<()> {
    let mut config = test_config();
    config.pipeline.inline_min_priority = i32::MAX;
    config.pipeline.extraction_timeout_factor = 0;
    config.pipeline.extraction_timeout_floor = Duration::from_millis(50);
    let app = TestApp::with_config(config);
    let org = Uuid::new_v4();
    app.extractor.set_mode(FailureMode::Hang);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "notes.txt", "text/plain", b"meeting notes".to_vec()))
        .await?;
    assert!(!outcome.processed_inline);

    let processed = tokio::time::timeout(
        Duration::from_secs(5),
        app.state.queue.run_once(QueueName::Extraction),
    )
    .await
    .expect("attempt is bounded by its time limit")?;
    assert!(processed);

    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.error_code.as_deref(), Some("transient_io"));
    assert_eq!(app.extractor.calls(), 1);

    app.extractor.set_mode(FailureMode::None);
    app.drain().await?;
    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn concurrent_uploads_cannot_overrun_the_quota() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.repo
        .upsert_organization_settings(doclib::models::OrganizationSettings {
            organization_id: org,
            storage_policy: StoragePolicy::ObjectStore,
            primary_backend: StorageBackendKind::ObjectStore,
            quota_bytes: Some(10),
            downstream_enabled: false,
        })
        .await?;

    let (first, second) = tokio::join!(
        app.state
            .pipeline
            .ingest(upload(org, "a.txt", "text/plain", vec![b'a'; 6])),
        app.state
            .pipeline
            .ingest(upload(org, "b.txt", "text/plain", vec![b'b'; 6])),
    );
    let accepted = [first.is_ok(), second.is_ok()];
    assert_eq!(accepted.iter().filter(|ok| **ok).count(), 1);
    let err = first.err().or(second.err()).expect("one upload rejected");
    assert_eq!(err.code(), "quota_exceeded");
    assert_eq!(app.repo.organization_usage_bytes(org).await?, 6);
    assert_eq!(app.object_store.object_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn operator_reset_revives_an_exhausted_job() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.extractor.set_mode(FailureMode::Transient);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "notes.txt", "text/plain", b"meeting notes".to_vec()))
        .await?;
    app.drain().await?;

    app.extractor.set_mode(FailureMode::None);
    let job = app
        .state
        .pipeline
        .retry_extraction(outcome.extraction_job_id)
        .await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);

    app.drain().await?;
    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(app.search.document(outcome.file.id).await.is_some());
    Ok(())
}

#[tokio::test]
async fn corrupt_input_fails_permanently_on_first_attempt() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.extractor.set_mode(FailureMode::Permanent);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "ledger.csv", "text/csv", b"a,b".to_vec()))
        .await?;
    app.drain().await?;

    let job = app
        .repo
        .get_extraction_job(outcome.extraction_job_id)
        .await?
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some(PERMANENT_ERROR_CODE));
    assert_eq!(app.extractor.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn backup_write_failure_does_not_fail_the_upload() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.set_policy(org, StoragePolicy::Hybrid, StorageBackendKind::ObjectStore)
        .await?;
    app.local.fail_writes(true);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(org, "contract.pdf", "application/pdf", b"signed".to_vec()))
        .await?;

    let sync_job_id = outcome.backup_sync_job_id.expect("repair scheduled");
    let locations = app.repo.list_locations(outcome.file.id).await?;
    assert_eq!(locations.len(), 1);
    assert!(locations[0].is_primary);
    assert_eq!(locations[0].backend, StorageBackendKind::ObjectStore);

    let sync_job = app.repo.get_sync_job(sync_job_id).await?.unwrap();
    assert_eq!(sync_job.status, SyncStatus::Pending);
    assert_eq!(sync_job.triggered_by, BACKUP_FAILURE_TRIGGER);
    assert_eq!(sync_job.file_id, Some(outcome.file.id));

    app.local.fail_writes(false);
    app.drain().await?;

    let sync_job = app.repo.get_sync_job(sync_job_id).await?.unwrap();
    assert_eq!(sync_job.status, SyncStatus::Completed);
    let locations = app.repo.list_locations(outcome.file.id).await?;
    assert_eq!(locations.len(), 2);
    assert!(locations
        .iter()
        .all(|location| location.checksum == outcome.file.checksum));
    Ok(())
}

#[tokio::test]
async fn unhealthy_search_engine_defers_indexing() -> Result<()> {
    let mut config = test_config();
    // a single attempt leaves the failure for the recovery sweep
    config.queue.max_attempts = 1;
    let app = TestApp::with_config(config);
    let org = Uuid::new_v4();
    app.search.set_healthy(false);

    let outcome = app
        .state
        .pipeline
        .ingest(upload(
            org,
            "urgent-notice.pdf",
            "application/pdf",
            b"Roof repair scheduled".to_vec(),
        ))
        .await?;
    assert!(outcome.processed_inline);

    app.drain().await?;
    let status = app.repo.get_index_status(outcome.file.id).await?.unwrap();
    assert_eq!(status.status, IndexStatus::IndexFailed);
    assert_eq!(status.retry_count, 1);
    assert!(status.last_error.is_some());
    assert!(app.search.document(outcome.file.id).await.is_none());

    app.search.set_healthy(true);
    let report = app.state.queue.process_pending_database_jobs().await?;
    assert_eq!(report.enqueued_index_jobs, 1);
    app.drain().await?;

    let status = app.repo.get_index_status(outcome.file.id).await?.unwrap();
    assert_eq!(status.status, IndexStatus::Indexed);
    assert_eq!(status.retry_count, 0);
    Ok(())
}

#[tokio::test]
async fn deleting_a_file_removes_its_search_document() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();

    let outcome = app
        .state
        .pipeline
        .ingest(upload(
            org,
            "urgent-notice.pdf",
            "application/pdf",
            b"Office closed Friday".to_vec(),
        ))
        .await?;
    app.drain().await?;
    assert!(app.search.document(outcome.file.id).await.is_some());

    let deleted = app.state.pipeline.delete_file(outcome.file.id).await?;
    assert!(deleted.is_deleted);
    app.drain().await?;

    assert!(app.search.document(outcome.file.id).await.is_none());
    let status = app.repo.get_index_status(outcome.file.id).await?.unwrap();
    assert_eq!(status.status, IndexStatus::NotIndexed);
    Ok(())
}

#[tokio::test]
async fn quota_is_enforced_before_any_write() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    app.repo
        .upsert_organization_settings(doclib::models::OrganizationSettings {
            organization_id: org,
            storage_policy: StoragePolicy::ObjectStore,
            primary_backend: StorageBackendKind::ObjectStore,
            quota_bytes: Some(10),
            downstream_enabled: false,
        })
        .await?;

    let err = app
        .state
        .pipeline
        .ingest(upload(org, "big.txt", "text/plain", vec![b'x'; 11]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "quota_exceeded");
    assert_eq!(app.object_store.object_count().await, 0);
    Ok(())
}
