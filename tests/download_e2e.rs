//! End-to-end download scenarios against in-process NNTP servers

mod common;

use common::*;
use nzb_dl::config::{DownloadConfig, ServerConfig, StoreConfig};
use nzb_dl::engine::{Downloader, FileWriter};
use nzb_dl::nntp::ProviderManager;
use nzb_dl::processor::Processor;
use nzb_dl::queue::QueueManager;
use nzb_dl::store::{BlobStore, Store};
use nzb_dl::types::{JobStatus, QueueItem, Release};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Harness {
    _tmp: tempfile::TempDir,
    out_dir: PathBuf,
    store: Arc<Store>,
    blobs: Arc<BlobStore>,
    providers: Arc<ProviderManager>,
    queue: Arc<QueueManager>,
}

async fn harness(server_configs: Vec<ServerConfig>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("downloads");

    let store = Arc::new(
        Store::new(&StoreConfig {
            sqlite_path: tmp.path().join("meta.db"),
            blob_dir: tmp.path().join("blobs"),
        })
        .await
        .unwrap(),
    );
    let blobs = Arc::new(BlobStore::new(&tmp.path().join("blobs")).await.unwrap());
    let providers = Arc::new(ProviderManager::new(&server_configs).await.unwrap());
    let writer = Arc::new(FileWriter::new());
    let downloader = Arc::new(Downloader::new(providers.clone(), writer.clone()));
    let processor = Arc::new(Processor::new(
        writer,
        &DownloadConfig {
            out_dir: out_dir.clone(),
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

    Harness {
        _tmp: tmp,
        out_dir,
        store,
        blobs,
        providers,
        queue,
    }
}

impl Harness {
    async fn ingest(&self, nzb_xml: &str, title: &str) -> Arc<QueueItem> {
        let release = Release::from_upload(nzb_xml.as_bytes(), title);
        self.blobs.put(&release.id, nzb_xml.as_bytes()).await.unwrap();
        self.store.upsert_releases(&[&release]).await.unwrap();
        self.queue.enqueue(&release.id).await.unwrap()
    }

    async fn run_to_terminal(&self, item: &Arc<QueueItem>, secs: u64) {
        let shutdown = CancellationToken::new();
        let queue = self.queue.clone();
        let scheduler_shutdown = shutdown.clone();
        let runner = tokio::spawn(async move { queue.run(scheduler_shutdown).await });

        let waited = tokio::time::timeout(Duration::from_secs(secs), async {
            while !item.status().is_terminal() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;

        shutdown.cancel();
        runner.await.unwrap();
        waited.expect("job did not reach a terminal state in time");
    }
}

#[tokio::test]
async fn single_segment_file_downloads_verifies_and_renames() {
    let data = payload(1024, 7);
    let article = single_part_article("small.bin", &data);
    let declared = article.len() as u64;

    let server = spawn_server(Duration::ZERO, move |id| {
        (id == "small-1@test").then(|| article.clone())
    })
    .await;

    let h = harness(vec![server.config("primary", 5, 1)]).await;
    let nzb = build_nzb(&[NzbFileSpec {
        name: "small.bin".to_string(),
        segments: vec![(1, declared, "small-1@test".to_string())],
    }]);

    let item = h.ingest(&nzb, "single-small").await;
    h.run_to_terminal(&item, 15).await;

    assert_eq!(item.status(), JobStatus::Completed);
    assert_eq!(item.bytes_written.load(Ordering::Relaxed), 1024);

    let final_path = h.out_dir.join("small.bin");
    assert_eq!(std::fs::read(&final_path).unwrap(), data);
    assert!(
        !h.out_dir.join("small.bin.part").exists(),
        "the part file must be renamed away"
    );
}

#[tokio::test]
async fn two_files_nine_segments_reconstruct_exactly() {
    // File A: 5 parts x 700_000; file B: 4 parts x 500_000
    let file_a = payload(3_500_000, 1);
    let file_b = payload(2_000_000, 2);

    let mut articles: HashMap<String, Vec<u8>> = HashMap::new();
    let mut spec_a = Vec::new();
    for part in 0..5u32 {
        let offset = part as u64 * 700_000;
        let slice = &file_a[offset as usize..(offset as usize + 700_000)];
        let id = format!("a{}@test", part + 1);
        let article =
            multi_part_article("file-a.bin", part + 1, file_a.len() as u64, offset, slice);
        spec_a.push((part + 1, article.len() as u64, id.clone()));
        articles.insert(id, article);
    }
    let mut spec_b = Vec::new();
    for part in 0..4u32 {
        let offset = part as u64 * 500_000;
        let slice = &file_b[offset as usize..(offset as usize + 500_000)];
        let id = format!("b{}@test", part + 1);
        let article =
            multi_part_article("file-b.bin", part + 1, file_b.len() as u64, offset, slice);
        spec_b.push((part + 1, article.len() as u64, id.clone()));
        articles.insert(id, article);
    }

    let server = spawn_server(Duration::ZERO, move |id| articles.get(id).cloned()).await;
    let h = harness(vec![server.config("primary", 10, 1)]).await;

    let nzb = build_nzb(&[
        NzbFileSpec {
            name: "file-a.bin".to_string(),
            segments: spec_a,
        },
        NzbFileSpec {
            name: "file-b.bin".to_string(),
            segments: spec_b,
        },
    ]);

    let item = h.ingest(&nzb, "two-files").await;
    h.run_to_terminal(&item, 60).await;

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());

    let a = std::fs::read(h.out_dir.join("file-a.bin")).unwrap();
    let b = std::fs::read(h.out_dir.join("file-b.bin")).unwrap();
    assert_eq!(a.len(), 3_500_000);
    assert_eq!(b.len(), 2_000_000);
    assert_eq!(a, file_a, "file A content must match byte for byte");
    assert_eq!(b, file_b, "file B content must match byte for byte");

    // after quiescence every provider slot is free again
    assert_eq!(h.providers.free_slots("primary"), Some(10));
}

#[tokio::test]
async fn missing_article_fails_over_to_backup_provider() {
    let data = payload(4096, 3);
    let article = single_part_article("failover.bin", &data);
    let declared = article.len() as u64;

    let primary = spawn_server(Duration::ZERO, |_| None).await; // 430 for everything
    let backup = spawn_server(Duration::ZERO, move |id| {
        (id == "fo-1@test").then(|| article.clone())
    })
    .await;

    let h = harness(vec![
        primary.config("primary", 5, 1),
        backup.config("backup", 5, 2),
    ])
    .await;

    let nzb = build_nzb(&[NzbFileSpec {
        name: "failover.bin".to_string(),
        segments: vec![(1, declared, "fo-1@test".to_string())],
    }]);

    let item = h.ingest(&nzb, "failover").await;
    h.run_to_terminal(&item, 20).await;

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());
    assert_eq!(
        std::fs::read(h.out_dir.join("failover.bin")).unwrap(),
        data
    );

    let tasks = item.tasks();
    assert!(
        tasks[0].segments[0].is_missing_from("primary"),
        "the 430 must be recorded against the primary"
    );
    assert!(!tasks[0].segments[0].is_missing_from("backup"));

    assert_eq!(h.providers.free_slots("primary"), Some(5));
    assert_eq!(h.providers.free_slots("backup"), Some(5));
}

#[tokio::test]
async fn transient_checksum_failure_retries_with_backoff_and_succeeds() {
    let data = payload(2048, 4);
    let good = single_part_article("flaky.bin", &data);
    let bad = corrupted_article("flaky.bin", &data);
    let declared = good.len().max(bad.len()) as u64;

    let attempts: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());
    let server = spawn_server(Duration::ZERO, move |id| {
        let mut attempts = attempts.lock().unwrap();
        let n = attempts.entry(id.to_string()).or_insert(0);
        *n += 1;
        // first attempt ships a corrupt checksum, later attempts are fine
        Some(if *n == 1 { bad.clone() } else { good.clone() })
    })
    .await;

    let h = harness(vec![server.config("primary", 5, 1)]).await;
    let nzb = build_nzb(&[NzbFileSpec {
        name: "flaky.bin".to_string(),
        segments: vec![(1, declared, "flaky-1@test".to_string())],
    }]);

    let started = Instant::now();
    let item = h.ingest(&nzb, "flaky").await;
    h.run_to_terminal(&item, 30).await;

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "first retry backs off for two seconds, elapsed {:?}",
        started.elapsed()
    );
    assert_eq!(std::fs::read(h.out_dir.join("flaky.bin")).unwrap(), data);
}

#[tokio::test]
async fn cancellation_keeps_part_files_and_marks_failed() {
    // ten slow segments through a single connection
    let mut articles = HashMap::new();
    let mut segments = Vec::new();
    let chunk = 5_000usize;
    let total = payload(chunk * 10, 5);
    for part in 0..10u32 {
        let offset = part as usize * chunk;
        let slice = &total[offset..offset + chunk];
        let id = format!("slow{}@test", part + 1);
        let article = multi_part_article(
            "slow.bin",
            part + 1,
            total.len() as u64,
            offset as u64,
            slice,
        );
        segments.push((part + 1, article.len() as u64, id.clone()));
        articles.insert(id, article);
    }

    let server = spawn_server(Duration::from_millis(150), move |id| {
        articles.get(id).cloned()
    })
    .await;
    let h = harness(vec![server.config("primary", 1, 1)]).await;

    let nzb = build_nzb(&[NzbFileSpec {
        name: "slow.bin".to_string(),
        segments,
    }]);
    let item = h.ingest(&nzb, "cancel-me").await;

    let shutdown = CancellationToken::new();
    let queue = h.queue.clone();
    let scheduler_shutdown = shutdown.clone();
    let runner = tokio::spawn(async move { queue.run(scheduler_shutdown).await });

    // wait until some bytes are on disk, then cancel the job
    tokio::time::timeout(Duration::from_secs(10), async {
        while item.bytes_written.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no progress before cancellation");
    item.cancel();

    tokio::time::timeout(Duration::from_secs(10), async {
        while !item.status().is_terminal() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cancelled job never became terminal");

    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(item.status(), JobStatus::Failed);
    assert_eq!(item.error().as_deref(), Some("Cancelled by user"));

    let written = item.bytes_written.load(Ordering::Relaxed);
    assert!(written > 0, "some segments completed before the cancel");
    assert!(
        written < total.len() as u64,
        "cancellation must land before the job finishes"
    );
    assert!(
        h.out_dir.join("slow.bin.part").exists(),
        "part files stay on disk for a later resume"
    );
    assert!(!h.out_dir.join("slow.bin").exists(), "no partial rename");
}

#[tokio::test]
async fn existing_final_files_are_skipped_at_preparation() {
    let data_b = payload(8192, 6);
    let article_b = single_part_article("wanted.bin", &data_b);
    let declared_b = article_b.len() as u64;

    let server = spawn_server(Duration::ZERO, move |id| {
        (id == "wanted-1@test").then(|| article_b.clone())
    })
    .await;
    let h = harness(vec![server.config("primary", 5, 1)]).await;

    // the first file is already fully on disk
    std::fs::create_dir_all(&h.out_dir).unwrap();
    std::fs::write(h.out_dir.join("done.bin"), b"previous run output").unwrap();

    let nzb = build_nzb(&[
        NzbFileSpec {
            name: "done.bin".to_string(),
            segments: vec![(1, 1000, "done-1@test".to_string())],
        },
        NzbFileSpec {
            name: "wanted.bin".to_string(),
            segments: vec![(1, declared_b, "wanted-1@test".to_string())],
        },
    ]);

    let item = h.ingest(&nzb, "resume").await;
    h.run_to_terminal(&item, 15).await;

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());
    assert_eq!(
        std::fs::read(h.out_dir.join("done.bin")).unwrap(),
        b"previous run output",
        "complete files must not be touched"
    );
    assert_eq!(std::fs::read(h.out_dir.join("wanted.bin")).unwrap(), data_b);

    let requested = server.requested_ids();
    assert!(
        !requested.iter().any(|id| id == "done-1@test"),
        "segments of complete files must never be fetched: {requested:?}"
    );
}

#[tokio::test]
async fn declared_size_exceeding_yenc_size_truncates_at_finalize() {
    let data = payload(1500, 8);
    let article = single_part_article("short.bin", &data);

    let server = spawn_server(Duration::ZERO, move |id| {
        (id == "short-1@test").then(|| article.clone())
    })
    .await;
    let h = harness(vec![server.config("primary", 5, 1)]).await;

    // NZB declares 2000 bytes; yEnc says the file is 1500
    let nzb = build_nzb(&[NzbFileSpec {
        name: "short.bin".to_string(),
        segments: vec![(1, 2000, "short-1@test".to_string())],
    }]);

    let item = h.ingest(&nzb, "truncate").await;
    h.run_to_terminal(&item, 15).await;

    assert_eq!(item.status(), JobStatus::Completed, "error: {:?}", item.error());
    let content = std::fs::read(h.out_dir.join("short.bin")).unwrap();
    assert_eq!(content.len(), 1500, "padding beyond the yEnc size must go");
    assert_eq!(content, data);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_but_other_segments_complete() {
    let good_data = payload(4096, 9);
    let good = single_part_article("good.bin", &good_data);
    let declared_good = good.len() as u64;

    let server = spawn_server(Duration::ZERO, move |id| {
        (id == "good-1@test").then(|| good.clone()) // doomed id gets 430
    })
    .await;
    let h = harness(vec![server.config("primary", 5, 1)]).await;

    let nzb = build_nzb(&[
        NzbFileSpec {
            name: "good.bin".to_string(),
            segments: vec![(1, declared_good, "good-1@test".to_string())],
        },
        NzbFileSpec {
            name: "doomed.bin".to_string(),
            segments: vec![(1, 1000, "doomed-1@test".to_string())],
        },
    ]);

    // three backoffs (2+4+8 s) before the permanent failure
    let item = h.ingest(&nzb, "partial-failure").await;
    h.run_to_terminal(&item, 60).await;

    assert_eq!(item.status(), JobStatus::Failed);
    assert!(
        item.error().unwrap().contains("failed permanently"),
        "error: {:?}",
        item.error()
    );

    // the healthy file's bytes are on disk in its part file (no rename
    // happens on a failed job)
    let part = std::fs::read(h.out_dir.join("good.bin.part")).unwrap();
    assert_eq!(&part[..good_data.len()], &good_data[..]);
    assert_eq!(item.bytes_written.load(Ordering::Relaxed), good_data.len() as u64);
    assert!(!h.out_dir.join("good.bin").exists());
}

#[tokio::test]
async fn rerunning_the_same_nzb_is_idempotent() {
    let data = payload(10_000, 10);
    let article = single_part_article("stable.bin", &data);
    let declared = article.len() as u64;

    let server = spawn_server(Duration::ZERO, move |id| {
        (id == "stable-1@test").then(|| article.clone())
    })
    .await;
    let h = harness(vec![server.config("primary", 5, 1)]).await;

    let nzb = build_nzb(&[NzbFileSpec {
        name: "stable.bin".to_string(),
        segments: vec![(1, declared, "stable-1@test".to_string())],
    }]);

    let first = h.ingest(&nzb, "idempotent").await;
    h.run_to_terminal(&first, 15).await;
    assert_eq!(first.status(), JobStatus::Completed);
    let first_bytes = std::fs::read(h.out_dir.join("stable.bin")).unwrap();

    // second enqueue of the same release: every file is already final,
    // so the download is skipped and output is untouched
    let second = h.queue.enqueue(&first.release_id).await.unwrap();
    h.run_to_terminal(&second, 15).await;
    assert_eq!(second.status(), JobStatus::Completed);

    let second_bytes = std::fs::read(h.out_dir.join("stable.bin")).unwrap();
    assert_eq!(first_bytes, second_bytes, "outputs must be byte-identical");
    assert_eq!(second_bytes, data);
}
