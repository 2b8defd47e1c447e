//! End-to-end engine tests against an in-process mock registry.

mod common;

use common::mock_registry::{self, build_image, layer_bytes, MockRegistry, MockRegistryOptions};
use docker_image_fetcher::config::{FetcherConfig, RegistrySource};
use docker_image_fetcher::digest::DigestUtils;
use docker_image_fetcher::download::{BusEvent, CreateRequest, DownloadEngine, Topic};
use docker_image_fetcher::task::{BlobState, Task, TaskState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn engine_for(server: &MockRegistry, root: &Path) -> Arc<DownloadEngine> {
    engine_with(server, root, |c| c)
}

fn engine_with(
    server: &MockRegistry,
    root: &Path,
    tweak: impl FnOnce(FetcherConfig) -> FetcherConfig,
) -> Arc<DownloadEngine> {
    let config = FetcherConfig::default()
        .with_downloads_root(root.to_path_buf())
        .with_custom_registry(Some(RegistrySource::new("custom", &server.base_url)))
        .with_retry_base_delay(Duration::from_millis(50))
        .with_quiet(true);
    DownloadEngine::new(tweak(config)).unwrap()
}

fn create_request(name: &str, tag: &str) -> CreateRequest {
    CreateRequest {
        image_name: name.to_string(),
        tag: Some(tag.to_string()),
        source: "custom".to_string(),
        target_path: None,
        platform: None,
    }
}

async fn wait_for(
    engine: &DownloadEngine,
    id: &str,
    what: &str,
    predicate: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let task = engine.inspect_task(id).await.expect("task exists");
        if predicate(&task) {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} (state={}, downloaded={})",
                what, task.state, task.downloaded_bytes
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn assert_record_consistent(task: &Task) {
    assert_eq!(
        task.downloaded_bytes,
        task.sum_blob_bytes(),
        "downloaded_bytes must equal the sum of blob bytes"
    );
}

fn assert_blob_files_verify(task: &Task) {
    for record in &task.blobs {
        assert_eq!(record.state, BlobState::Done);
        let path = task.blob_path(record);
        let data = std::fs::read(&path).expect("blob file exists");
        assert_eq!(data.len() as u64, record.size, "blob file length");
        DigestUtils::verify_data_integrity(&data, &record.digest).expect("blob digest");
    }
}

#[tokio::test]
async fn happy_path_downloads_every_blob() {
    let image = build_image(
        "demo/app",
        "1.0",
        layer_bytes(256, 7),
        vec![layer_bytes(64 * 1024, 1), layer_bytes(32 * 1024, 2), Vec::new()],
    );
    let manifest_json = image.manifest_json.clone();
    let manifest_digest = image.manifest_digest.clone();
    let config_bytes = image.config.clone();
    let total = (image.config.len() + image.layers.iter().map(Vec::len).sum::<usize>()) as u64;

    let server = mock_registry::start(vec![image], MockRegistryOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());
    let mut events = engine.subscribe(Topic::Global);

    let task = engine
        .create_task(create_request("demo/app", "1.0"))
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.coord.repository, "demo/app");

    let done = wait_for(&engine, &task.id, "completion", |t| t.state.is_terminal()).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.checksum.as_deref(), Some(manifest_digest.as_str()));
    assert_eq!(done.total_bytes, total);
    assert_eq!(done.downloaded_bytes, total);
    assert_record_consistent(&done);
    assert_blob_files_verify(&done);

    // Manifest and config are byte-faithful copies
    assert_eq!(std::fs::read(done.manifest_path()).unwrap(), manifest_json);
    assert_eq!(std::fs::read(done.config_path()).unwrap(), config_bytes);

    // Events: progress is monotone and the terminal event arrives last
    let mut last_progress = 0.0f64;
    let mut saw_complete = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        match event {
            BusEvent::Progress(p) => {
                assert!(!saw_complete, "progress event after the terminal event");
                assert!(p.progress >= last_progress, "progress went backwards");
                assert!(p.progress <= 100.0);
                last_progress = p.progress;
            }
            BusEvent::Complete(p) => {
                assert_eq!(p.checksum, manifest_digest);
                saw_complete = true;
                break;
            }
            BusEvent::Error(e) => panic!("unexpected error event: {:?}", e),
        }
    }
    assert!(saw_complete, "terminal complete event missing");
    engine.shutdown().await;
}

#[tokio::test]
async fn pause_then_resume_preserves_bytes() {
    let image = build_image(
        "demo/slow",
        "1.0",
        layer_bytes(128, 3),
        vec![layer_bytes(512 * 1024, 9)],
    );
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            chunk_delay: Some(Duration::from_millis(20)),
            chunk_size: 8 * 1024,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());

    let task = engine
        .create_task(create_request("demo/slow", "1.0"))
        .await
        .unwrap();
    wait_for(&engine, &task.id, "bytes flowing", |t| {
        t.state == TaskState::Fetching && t.downloaded_bytes > 0
    })
    .await;

    let paused = engine.pause_task(&task.id).await.unwrap();
    assert_eq!(paused.state, TaskState::Paused);

    // After pause returns, the task goes quiet: no progress events, no
    // byte growth once the in-flight read drains.
    let mut events = engine.subscribe(Topic::Task(task.id.clone()));
    tokio::time::sleep(Duration::from_millis(400)).await;
    let settled = engine.inspect_task(&task.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still = engine.inspect_task(&task.id).await.unwrap();
    assert_eq!(settled.downloaded_bytes, still.downloaded_bytes);
    assert_eq!(still.state, TaskState::Paused);
    assert!(events.try_recv().is_err(), "paused task emitted an event");
    assert!(still.downloaded_bytes > 0);
    assert!(still.downloaded_bytes < still.total_bytes);

    // pause loses nothing: the settled counter is at least what the verb saw
    assert!(still.downloaded_bytes >= paused.downloaded_bytes);
    assert_eq!(paused.retries, still.retries);

    let resumed = engine.resume_task(&task.id).await.unwrap();
    assert_eq!(resumed.state, TaskState::Pending);

    let done = wait_for(&engine, &task.id, "completion after resume", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(done.state, TaskState::Completed);
    assert!(done.downloaded_bytes >= still.downloaded_bytes);
    assert_eq!(done.downloaded_bytes, done.total_bytes);
    assert_blob_files_verify(&done);
}

#[tokio::test]
async fn restart_recovery_resumes_from_disk() {
    let image = build_image(
        "demo/restart",
        "2.0",
        layer_bytes(128, 5),
        vec![layer_bytes(384 * 1024, 11)],
    );
    let manifest_digest = image.manifest_digest.clone();
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            chunk_delay: Some(Duration::from_millis(15)),
            chunk_size: 8 * 1024,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();

    // First process: start fetching, then shut down mid-transfer
    let engine = engine_for(&server, dir.path());
    let task = engine
        .create_task(create_request("demo/restart", "2.0"))
        .await
        .unwrap();
    wait_for(&engine, &task.id, "partial progress", |t| {
        t.downloaded_bytes > 32 * 1024
    })
    .await;
    engine.shutdown().await;
    drop(engine);

    // The persisted record still points mid-transfer
    let metadata_path = dir
        .path()
        .join("tasks")
        .join(&task.id)
        .join("metadata.json");
    let raw = std::fs::read(&metadata_path).unwrap();
    let on_disk: Task = serde_json::from_slice(&raw).unwrap();
    assert!(!on_disk.state.is_terminal());
    let disk_bytes: u64 = on_disk
        .blobs
        .iter()
        .map(|b| {
            std::fs::metadata(on_disk.blob_path(b))
                .map(|m| m.len())
                .unwrap_or(0)
        })
        .sum();
    assert!(disk_bytes > 0);

    // Second process, parked recovery: the record converges on the blob
    // files before any network traffic
    let engine = engine_with(&server, dir.path(), |c| c.with_resume_on_start(false));
    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, 0);

    let after = engine.inspect_task(&task.id).await.unwrap();
    assert_eq!(after.state, TaskState::Paused);
    assert_eq!(after.downloaded_bytes, disk_bytes);

    engine.resume_task(&task.id).await.unwrap();
    let done = wait_for(&engine, &task.id, "completion after restart", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.checksum.as_deref(), Some(manifest_digest.as_str()));
    assert_eq!(done.downloaded_bytes, done.total_bytes);
    assert_blob_files_verify(&done);
}

#[tokio::test]
async fn missing_image_fails_with_not_found() {
    let server = mock_registry::start(Vec::new(), MockRegistryOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());
    let mut events = engine.subscribe(Topic::Global);

    let task = engine
        .create_task(create_request("nope/nope", "does-not-exist"))
        .await
        .unwrap();
    let failed = wait_for(&engine, &task.id, "failure", |t| t.state.is_terminal()).await;
    assert_eq!(failed.state, TaskState::Failed);
    let error = failed.last_error.expect("last_error populated");
    assert_eq!(error.kind, "NotFound");
    assert_eq!(failed.retries, 0, "fatal errors consume no retries");

    // The failed task stays visible and a retry fails the same way
    engine.retry_task(&task.id).await.unwrap();
    let failed_again = wait_for(&engine, &task.id, "second failure", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(failed_again.state, TaskState::Failed);
    assert_eq!(failed_again.last_error.unwrap().kind, "NotFound");

    let mut error_events = 0;
    while error_events < 2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(BusEvent::Error(payload))) => {
                assert_eq!(payload.error.kind, "NotFound");
                error_events += 1;
            }
            Ok(Some(_)) => {}
            _ => panic!("expected two error events, saw {}", error_events),
        }
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn transient_errors_are_retried_with_backoff() {
    let image = build_image(
        "demo/flaky",
        "1.0",
        layer_bytes(128, 2),
        vec![layer_bytes(16 * 1024, 4)],
    );
    let manifest_digest = image.manifest_digest.clone();
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            blob_failures: 1,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());

    let task = engine
        .create_task(create_request("demo/flaky", "1.0"))
        .await
        .unwrap();
    let done = wait_for(&engine, &task.id, "completion after retry", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.retries, 1, "one transient failure consumed one retry");
    assert_eq!(done.checksum.as_deref(), Some(manifest_digest.as_str()));
    assert_blob_files_verify(&done);
}

#[tokio::test]
async fn digest_mismatch_is_fatal_and_leaves_siblings_intact() {
    let good_layer = layer_bytes(24 * 1024, 6);
    let bad_layer = layer_bytes(24 * 1024, 8);
    let bad_digest = DigestUtils::compute_registry_digest(&bad_layer);
    let image = build_image(
        "demo/corrupt",
        "1.0",
        layer_bytes(128, 1),
        vec![good_layer, bad_layer],
    );
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            corrupt_digest: Some(bad_digest),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());

    let task = engine
        .create_task(create_request("demo/corrupt", "1.0"))
        .await
        .unwrap();
    let failed = wait_for(&engine, &task.id, "digest failure", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.last_error.clone().unwrap().kind, "ProtocolViolation");
    assert_record_consistent(&failed);

    // The store is not corrupted and finished siblings still verify
    assert_eq!(engine.list_tasks().await.len(), 1);
    for record in failed.blobs.iter().filter(|b| b.state == BlobState::Done) {
        let data = std::fs::read(failed.blob_path(record)).unwrap();
        DigestUtils::verify_data_integrity(&data, &record.digest).unwrap();
    }
}

#[tokio::test]
async fn range_ignoring_server_restarts_the_blob() {
    let image = build_image(
        "demo/norange",
        "1.0",
        layer_bytes(128, 9),
        vec![layer_bytes(256 * 1024, 12)],
    );
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            support_ranges: false,
            chunk_delay: Some(Duration::from_millis(10)),
            chunk_size: 8 * 1024,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());

    let task = engine
        .create_task(create_request("demo/norange", "1.0"))
        .await
        .unwrap();
    wait_for(&engine, &task.id, "partial layer bytes", |t| {
        t.state == TaskState::Fetching && t.downloaded_bytes > 16 * 1024
    })
    .await;

    engine.pause_task(&task.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.resume_task(&task.id).await.unwrap();

    // Resume sends a Range request; the server ignores it, so the blob is
    // truncated and refetched from zero without failing the task.
    let done = wait_for(&engine, &task.id, "completion without ranges", |t| {
        t.state.is_terminal()
    })
    .await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.downloaded_bytes, done.total_bytes);
    assert_blob_files_verify(&done);
}

#[tokio::test]
async fn scheduler_bounds_concurrently_fetching_tasks() {
    let images: Vec<_> = (0..4)
        .map(|i| {
            build_image(
                &format!("demo/task{}", i),
                "1.0",
                layer_bytes(128, i as u8),
                vec![layer_bytes(128 * 1024, 40 + i as u8)],
            )
        })
        .collect();
    let server = mock_registry::start(
        images,
        MockRegistryOptions {
            chunk_delay: Some(Duration::from_millis(10)),
            chunk_size: 16 * 1024,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(&server, dir.path(), |c| c.with_max_concurrent_tasks(2));

    let mut ids = Vec::new();
    for i in 0..4 {
        let task = engine
            .create_task(create_request(&format!("demo/task{}", i), "1.0"))
            .await
            .unwrap();
        ids.push(task.id);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let tasks = engine.list_tasks().await;
        let fetching = tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Resolving | TaskState::Fetching))
            .count();
        assert!(fetching <= 2, "concurrency bound exceeded: {}", fetching);

        if tasks.iter().all(|t| t.state.is_terminal()) {
            for task in &tasks {
                assert_eq!(task.state, TaskState::Completed);
            }
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tasks did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn create_cancel_delete_leaves_nothing_behind() {
    let image = build_image(
        "demo/gone",
        "1.0",
        layer_bytes(128, 2),
        vec![layer_bytes(256 * 1024, 3)],
    );
    let server = mock_registry::start(
        vec![image],
        MockRegistryOptions {
            chunk_delay: Some(Duration::from_millis(15)),
            chunk_size: 8 * 1024,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(&server, dir.path());

    let task = engine
        .create_task(create_request("demo/gone", "1.0"))
        .await
        .unwrap();
    wait_for(&engine, &task.id, "fetching", |t| {
        t.state == TaskState::Fetching
    })
    .await;

    let cancelled = engine.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);

    // Cancel is idempotent and artifacts are retained until delete
    let again = engine.cancel_task(&task.id).await.unwrap();
    assert_eq!(again.state, TaskState::Cancelled);
    assert!(task.metadata_path().exists());

    // Give the aborted transfer a moment to leave its slot
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.delete_task(&task.id).await.unwrap();
    assert!(!task.target_dir.exists());
    assert!(engine.list_tasks().await.is_empty());
    assert!(engine.inspect_task(&task.id).await.is_err());
}
