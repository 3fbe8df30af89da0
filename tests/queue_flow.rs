mod common;

use std::time::Duration;

use anyhow::{ensure, Result};
use chrono::Utc;
use common::{test_config, TestApp};
use doclib::jobs::new_extraction_job;
use doclib::models::{ExtractionMethod, JobStatus, StorageSyncJob, SyncStatus, SyncType};
use doclib::pipeline::UploadRequest;
use doclib::repository::{Repository, RepositoryError};
use doclib::storage::StoreRequest;
use doclib::strategy::{classify, FileCharacteristics};
use doclib::{JobKind, QueueName};
use uuid::Uuid;

fn queued_only_app() -> TestApp {
    let mut config = test_config();
    // nothing runs on the request path
    config.pipeline.inline_min_priority = i32::MAX;
    TestApp::with_config(config)
}

async fn ingest_text(app: &TestApp, org: Uuid, name: &str) -> Result<Uuid> {
    let outcome = app
        .state
        .pipeline
        .ingest(UploadRequest {
            store: StoreRequest::new(org, name, "text/plain", format!("body of {name}").into_bytes()),
            force_sync: false,
        })
        .await?;
    Ok(outcome.extraction_job_id)
}

async fn status_of(app: &TestApp, job_id: Uuid) -> Result<JobStatus> {
    let job = app.repo.get_extraction_job(job_id).await?;
    Ok(job.map(|job| job.status).unwrap_or(JobStatus::Failed))
}

#[tokio::test]
async fn higher_priority_jobs_are_dequeued_first() -> Result<()> {
    let app = queued_only_app();
    let org = Uuid::new_v4();

    let backup = ingest_text(&app, org, "old-backup.txt").await?;
    let plain = ingest_text(&app, org, "notes.txt").await?;
    let urgent = ingest_text(&app, org, "urgent-memo.txt").await?;

    assert!(app.state.queue.run_once(QueueName::Extraction).await?);
    assert_eq!(status_of(&app, urgent).await?, JobStatus::Completed);
    assert_eq!(status_of(&app, plain).await?, JobStatus::Pending);
    assert_eq!(status_of(&app, backup).await?, JobStatus::Pending);

    assert!(app.state.queue.run_once(QueueName::Extraction).await?);
    assert_eq!(status_of(&app, plain).await?, JobStatus::Completed);
    assert_eq!(status_of(&app, backup).await?, JobStatus::Pending);

    assert!(app.state.queue.run_once(QueueName::Extraction).await?);
    assert_eq!(status_of(&app, backup).await?, JobStatus::Completed);
    assert!(!app.state.queue.run_once(QueueName::Extraction).await?);
    Ok(())
}

#[tokio::test]
async fn equal_priorities_run_in_enqueue_order() -> Result<()> {
    let app = queued_only_app();
    let org = Uuid::new_v4();

    let first = ingest_text(&app, org, "a.txt").await?;
    let second = ingest_text(&app, org, "b.txt").await?;

    app.state.queue.run_once(QueueName::Extraction).await?;
    assert_eq!(status_of(&app, first).await?, JobStatus::Completed);
    assert_eq!(status_of(&app, second).await?, JobStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn identical_jobs_are_queued_once() -> Result<()> {
    let app = TestApp::new();
    let file_id = Uuid::new_v4();

    let first = app
        .state
        .enqueuer
        .enqueue_default(JobKind::IndexFile { file_id })
        .await?;
    let second = app
        .state
        .enqueuer
        .enqueue_default(JobKind::IndexFile { file_id })
        .await?;
    assert!(first.is_some());
    assert!(second.is_none());

    let health = app.state.queue.health_check().await?;
    let indexing = health
        .queues
        .iter()
        .find(|depth| depth.queue == QueueName::Indexing)
        .unwrap();
    assert_eq!(indexing.pending, 1);
    assert!(!health.running);
    Ok(())
}

#[tokio::test]
async fn second_processing_job_for_same_file_and_method_is_rejected() -> Result<()> {
    let app = TestApp::new();
    let file_id = Uuid::new_v4();
    let plan = classify(&FileCharacteristics {
        mime_type: "application/pdf",
        size_bytes: 1024,
        file_name: "scan.pdf",
    });

    let mut first = app
        .repo
        .insert_extraction_job(new_extraction_job(file_id, &plan, 3))
        .await?;
    let mut second = app
        .repo
        .insert_extraction_job(new_extraction_job(file_id, &plan, 3))
        .await?;

    first.start()?;
    app.repo
        .update_extraction_job(&first, JobStatus::Pending)
        .await?;
    second.start()?;
    let err = app
        .repo
        .update_extraction_job(&second, JobStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Conflict(_)));

    let processing = app
        .repo
        .extraction_jobs_for_file(file_id)
        .await?
        .into_iter()
        .filter(|job| job.status == JobStatus::Processing)
        .count();
    assert_eq!(processing, 1);
    Ok(())
}

#[tokio::test]
async fn recovery_sweep_schedules_unqueued_and_stale_jobs() -> Result<()> {
    let app = TestApp::new();
    let plan = classify(&FileCharacteristics {
        mime_type: "image/png",
        size_bytes: 2048,
        file_name: "receipt.png",
    });

    let orphan = app
        .repo
        .insert_extraction_job(new_extraction_job(Uuid::new_v4(), &plan, 3))
        .await?;

    let mut stale = new_extraction_job(Uuid::new_v4(), &plan, 3);
    stale.status = JobStatus::Processing;
    stale.started_at = Some(Utc::now() - chrono::Duration::hours(2));
    let stale = app.repo.insert_extraction_job(stale).await?;

    let report = app.state.queue.process_pending_database_jobs().await?;
    assert_eq!(report.reset_extraction_jobs, 1);
    assert_eq!(report.enqueued_extraction_jobs, 2);

    let stale = app.repo.get_extraction_job(stale.id).await?.unwrap();
    assert_eq!(stale.status, JobStatus::Pending);
    assert_eq!(stale.retry_count, 1);
    let orphan = app.repo.get_extraction_job(orphan.id).await?.unwrap();
    assert_eq!(orphan.status, JobStatus::Pending);

    // queued entries are not duplicated by a second sweep
    let report = app.state.queue.process_pending_database_jobs().await?;
    assert_eq!(report.enqueued_extraction_jobs, 0);
    assert_eq!(app.repo.queued_count(QueueName::Extraction.as_str()).await?, 2);
    Ok(())
}

fn sync_job(organization_id: Uuid, started_at: chrono::DateTime<Utc>) -> StorageSyncJob {
    StorageSyncJob {
        id: Uuid::new_v4(),
        organization_id,
        sync_type: SyncType::Full,
        status: SyncStatus::Running,
        triggered_by: "test".to_string(),
        file_id: None,
        files_checked: 0,
        files_repaired: 0,
        error_message: None,
        created_at: started_at,
        started_at: Some(started_at),
        completed_at: None,
    }
}

#[tokio::test]
async fn recovery_sweep_resets_abandoned_storage_syncs() -> Result<()> {
    let app = TestApp::new();
    let org = Uuid::new_v4();
    let abandoned = app
        .repo
        .insert_sync_job(sync_job(org, Utc::now() - chrono::Duration::hours(2)))
        .await?;
    let running = app
        .repo
        .insert_sync_job(sync_job(org, Utc::now()))
        .await?;

    let report = app.state.queue.process_pending_database_jobs().await?;
    assert_eq!(report.reset_sync_jobs, 1);
    assert_eq!(report.enqueued_sync_jobs, 1);

    let job = app.repo.get_sync_job(abandoned.id).await?.unwrap();
    assert_eq!(job.status, SyncStatus::Pending);
    assert!(job.started_at.is_none());
    let job = app.repo.get_sync_job(running.id).await?.unwrap();
    assert_eq!(job.status, SyncStatus::Running);

    while app.state.queue.run_once(QueueName::Storage).await? {}
    let job = app.repo.get_sync_job(abandoned.id).await?.unwrap();
    assert_eq!(job.status, SyncStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn jobs_for_deleted_files_are_dropped() -> Result<()> {
    let app = queued_only_app();
    let org = Uuid::new_v4();
    let job_id = ingest_text(&app, org, "draft.txt").await?;
    let job = app.repo.get_extraction_job(job_id).await?.unwrap();
    app.state.pipeline.delete_file(job.file_id).await?;

    app.drain().await?;

    let job = app.repo.get_extraction_job(job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(app.extractor.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn started_queue_processes_work_until_stopped() -> Result<()> {
    let app = queued_only_app();
    let org = Uuid::new_v4();

    assert!(app.state.queue.start().await);
    assert!(!app.state.queue.start().await);
    assert!(app.state.queue.is_running().await);

    let job_id = ingest_text(&app, org, "invoice.txt").await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = app.repo.get_extraction_job(job_id).await?.unwrap();
        let indexed = app.search.document(job.file_id).await.is_some();
        if job.status == JobStatus::Completed && indexed {
            break;
        }
        ensure!(
            tokio::time::Instant::now() < deadline,
            "job was not processed in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(app.state.queue.stop().await);
    assert!(!app.state.queue.stop().await);
    assert!(!app.state.queue.is_running().await);
    assert_eq!(app.extractor.methods(), vec![ExtractionMethod::DirectText]);
    Ok(())
}
