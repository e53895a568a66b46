//! Crash recovery: a job killed mid-download resumes after restart

mod common;

use common::*;
use nzb_dl::config::{DownloadConfig, ServerConfig, StoreConfig};
use nzb_dl::engine::{Downloader, FileWriter};
use nzb_dl::nntp::ProviderManager;
use nzb_dl::processor::Processor;
use nzb_dl::queue::QueueManager;
use nzb_dl::store::{BlobStore, Store};
use nzb_dl::types::{JobStatus, Release};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Stack {
    store: Arc<Store>,
    blobs: Arc<BlobStore>,
    queue: Arc<QueueManager>,
}

/// Build a full pipeline over an existing root directory, so two stacks
/// can share state across a simulated crash.
async fn build_stack(root: &Path, configs: Vec<ServerConfig>) -> Stack {
    let store = Arc::new(
        Store::new(&StoreConfig {
            sqlite_path: root.join("meta.db"),
            blob_dir: root.join("blobs"),
        })
        .await
        .unwrap(),
    );
    let blobs = Arc::new(BlobStore::new(&root.join("blobs")).await.unwrap());
    let providers = Arc::new(ProviderManager::new(&configs).await.unwrap());
    let writer = Arc::new(FileWriter::new());
    let downloader = Arc::new(Downloader::new(providers, writer.clone()));
    let processor = Arc::new(Processor::new(
        writer,
        &DownloadConfig {
            out_dir: root.join("downloads"),
            completed_dir: None,
            cleanup_extensions: vec![],
        },
    ));
    let queue = Arc::new(QueueManager::new(
        store.clone(),
        blobs.clone(),
        downloader,
        processor,
    ));
    Stack {
        store,
        blobs,
        queue,
    }
}

#[tokio::test]
async fn job_killed_mid_download_is_reset_and_completes_after_restart() {
    let root = tempfile::tempdir().unwrap();

    // ten parts, throttled so the kill lands mid-download
    let chunk = 5_000usize;
    let data = payload(chunk * 10, 21);
    let mut articles = HashMap::new();
    let mut segments = Vec::new();
    for part in 0..10u32 {
        let offset = part as usize * chunk;
        let slice = &data[offset..offset + chunk];
        let id = format!("res{}@test", part + 1);
        let article = multi_part_article(
            "resume.bin",
            part + 1,
            data.len() as u64,
            offset as u64,
            slice,
        );
        segments.push((part + 1, article.len() as u64, id.clone()));
        articles.insert(id, article);
    }

    let server = spawn_server(Duration::from_millis(100), move |id| {
        articles.get(id).cloned()
    })
    .await;

    let nzb = build_nzb(&[NzbFileSpec {
        name: "resume.bin".to_string(),
        segments,
    }]);
    let release = Release::from_upload(nzb.as_bytes(), "resume-job");

    // --- first run: enqueue and kill the scheduler mid-download ---
    let item_id;
    {
        let stack = build_stack(root.path(), vec![server.config("primary", 1, 1)]).await;
        stack.blobs.put(&release.id, nzb.as_bytes()).await.unwrap();
        stack.store.upsert_releases(&[&release]).await.unwrap();
        let item = stack.queue.enqueue(&release.id).await.unwrap();
        item_id = item.id.clone();

        let shutdown = CancellationToken::new();
        let queue = stack.queue.clone();
        let scheduler_shutdown = shutdown.clone();
        let runner = tokio::spawn(async move { queue.run(scheduler_shutdown).await });

        tokio::time::timeout(Duration::from_secs(10), async {
            while item.bytes_written.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no progress before the simulated crash");

        // hard abort: no finalize_job, the row stays Downloading
        runner.abort();
        let _ = runner.await;
        shutdown.cancel();

        let row = stack.store.get_queue_item(&item.id).await.unwrap().unwrap();
        assert_eq!(
            row.status(),
            JobStatus::Downloading,
            "the crash must leave a non-terminal row behind"
        );
        stack.store.close().await;
    }

    assert!(
        root.path().join("downloads/resume.bin.part").exists(),
        "the partial file survives the crash"
    );

    // --- second run: recover and finish ---
    let stack = build_stack(root.path(), vec![server.config("primary", 4, 1)]).await;
    let recovered = stack.queue.recover_on_startup().await.unwrap();
    assert_eq!(recovered, 1);

    let items = stack.queue.items();
    assert_eq!(items[0].id, item_id);
    assert_eq!(items[0].status(), JobStatus::Pending);
    assert_eq!(items[0].error().as_deref(), Some("Unexpected shutdown"));

    let shutdown = CancellationToken::new();
    let queue = stack.queue.clone();
    let scheduler_shutdown = shutdown.clone();
    let runner = tokio::spawn(async move { queue.run(scheduler_shutdown).await });

    let item = items[0].clone();
    tokio::time::timeout(Duration::from_secs(30), async {
        while !item.status().is_terminal() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("recovered job never finished");

    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());
    let content = std::fs::read(root.path().join("downloads/resume.bin")).unwrap();
    assert_eq!(content, data, "identical positional writes are idempotent");
    assert!(!root.path().join("downloads/resume.bin.part").exists());

    let row = stack.store.get_queue_item(&item_id).await.unwrap().unwrap();
    assert_eq!(row.status(), JobStatus::Completed);
    stack.store.close().await;
}
