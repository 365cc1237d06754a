mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ZipBuilder, payload, release_archive};
use flashd::archive::{ArchiveCache, MemorySource, RangeSource, RemoteArchive};
use flashd::error::{AcquisitionError, ErrorKind, FlashError};

const URL: &str = "https://downloads.example.com/edgetx-2.10.zip";

fn silent(_: u8) {}

fn cache(source: &Arc<MemorySource>) -> ArchiveCache {
    let source: Arc<dyn RangeSource> = source.clone();
    ArchiveCache::new(source, "fw.json", 4)
}

#[tokio::test]
async fn entries_match_their_original_content() {
    let image = payload(20_000, 1);
    let bootloader = payload(3_000, 2);
    let source = Arc::new(MemorySource::new());
    source.insert(URL, release_archive(&image, &bootloader));

    let archives = cache(&source);
    assert_eq!(archives.fetch_entry(URL, "tx16s", &silent).await.unwrap(), image);
    assert_eq!(
        archives
            .fetch_entry(URL, "bootloader/tx16s", &silent)
            .await
            .unwrap(),
        bootloader
    );
    assert_eq!(source.full_requests(), 0);
}

#[tokio::test]
async fn targets_come_from_metadata_with_trailing_dash_trimmed() {
    let source = Arc::new(MemorySource::new());
    source.insert(URL, release_archive(&payload(100, 3), &[]));

    let targets = cache(&source).list_targets(URL).await.unwrap();
    let pairs: Vec<_> = targets
        .iter()
        .map(|t| (t.name.as_str(), t.code.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![("RadioMaster TX16S", "tx16s"), ("Jumper T-Pro", "tpro")]
    );
}

#[tokio::test]
async fn one_entry_costs_far_less_than_the_archive() {
    let large = payload(512 * 1024, 4);
    let small = payload(2_000, 5);
    let archive = ZipBuilder::new()
        .stored("fw.json", br#"{"targets":[]}"#)
        .stored("big-0000000.bin", &large)
        .stored("tpro-0000000.bin", &small)
        .build();
    let total = archive.len() as u64;
    let source = Arc::new(MemorySource::new());
    source.insert(URL, archive);

    let fetched = cache(&source).fetch_entry(URL, "tpro", &silent).await.unwrap();
    assert_eq!(fetched, small);
    assert!(
        source.bytes_served() < total / 10,
        "served {} of {} bytes",
        source.bytes_served(),
        total
    );
    assert_eq!(source.full_requests(), 0);
}

#[tokio::test]
async fn concurrent_calls_share_one_directory_read() {
    let source = Arc::new(MemorySource::new().with_throttle(1024, Duration::from_millis(5)));
    source.insert(URL, release_archive(&payload(4_000, 6), &[]));
    let archives = Arc::new(cache(&source));

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let archives = archives.clone();
            tokio::spawn(async move { archives.list_targets(URL).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().len(), 2);
    }

    assert_eq!(source.probe_count(), 1);
    assert!(archives.contains(URL));
}

#[tokio::test]
async fn missing_metadata_is_not_cached() {
    let source = Arc::new(MemorySource::new());
    source.insert(
        URL,
        ZipBuilder::new().stored("tx16s-abc.bin", &[1, 2, 3]).build(),
    );
    let archives = cache(&source);

    let err = archives.list_targets(URL).await.unwrap_err();
    assert!(matches!(
        err,
        FlashError::Acquisition(AcquisitionError::MetadataMissing { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Acquisition);
    assert!(!archives.contains(URL));

    assert!(archives.list_targets(URL).await.is_err());
    assert_eq!(source.probe_count(), 2);
}

#[tokio::test]
async fn republished_archive_is_seen_after_failure() {
    let source = Arc::new(MemorySource::new());
    source.insert(
        URL,
        ZipBuilder::new().stored("tx16s-abc.bin", &[1, 2, 3]).build(),
    );
    let archives = cache(&source);
    assert!(archives.list_targets(URL).await.is_err());

    source.insert(URL, release_archive(&payload(64, 7), &[]));
    assert_eq!(archives.list_targets(URL).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_entry_keeps_archive_cached() {
    let source = Arc::new(MemorySource::new());
    source.insert(URL, release_archive(&payload(64, 8), &[]));
    let archives = cache(&source);

    let err = archives.fetch_entry(URL, "x9d", &silent).await.unwrap_err();
    assert!(matches!(
        err,
        FlashError::Acquisition(AcquisitionError::EntryNotFound { .. })
    ));
    assert!(archives.contains(URL));
    assert_eq!(source.probe_count(), 1);
}

#[tokio::test]
async fn host_without_ranges_falls_back_to_one_download() {
    let image = payload(10_000, 9);
    let source = Arc::new(MemorySource::new().without_ranges());
    source.insert(URL, release_archive(&image, &[]));
    let archives = cache(&source);

    assert_eq!(archives.list_targets(URL).await.unwrap().len(), 2);
    assert_eq!(archives.fetch_entry(URL, "tx16s", &silent).await.unwrap(), image);
    assert_eq!(source.full_requests(), 1);
    assert_eq!(source.range_requests(), 0);
}

#[tokio::test]
async fn long_comment_widens_the_tail_read() {
    let image = payload(30_000, 10);
    let archive = ZipBuilder::new()
        .stored("fw.json", br#"{"targets":[["X","x-"]]}"#)
        .stored("x-1.bin", &image)
        .comment(&vec![b'c'; 10_000])
        .build();
    let source = Arc::new(MemorySource::new());
    source.insert(URL, archive);

    let source_dyn: Arc<dyn RangeSource> = source.clone();
    let opened = RemoteArchive::open(source_dyn, URL, "fw.json").await.unwrap();
    assert_eq!(opened.entries().len(), 2);
    assert_eq!(opened.fetch_entry("x", &silent).await.unwrap(), image);
    assert_eq!(opened.list_targets().await.unwrap()[0].code, "x");
}

#[tokio::test]
async fn corrupted_entry_fails_integrity_check() {
    let image = payload(5_000, 11);
    let mut archive = release_archive(&image, &[]);
    let marker = archive
        .windows(image.len().min(64))
        .position(|w| w == &image[..64])
        .unwrap();
    archive[marker + 10] ^= 0xff;

    let source = Arc::new(MemorySource::new());
    source.insert(URL, archive);
    let archives = cache(&source);

    let err = archives.fetch_entry(URL, "tx16s", &silent).await.unwrap_err();
    assert!(matches!(
        err,
        FlashError::Acquisition(AcquisitionError::IntegrityMismatch { .. })
    ));
    assert!(!archives.contains(URL));
}

#[tokio::test]
async fn progress_reaches_one_hundred() {
    let source = Arc::new(MemorySource::new().with_throttle(1024, Duration::ZERO));
    source.insert(URL, release_archive(&payload(8_000, 12), &[]));
    let archives = cache(&source);

    let seen = std::sync::Mutex::new(Vec::new());
    let progress = |p: u8| seen.lock().unwrap().push(p);
    archives.fetch_entry(URL, "tx16s", &progress).await.unwrap();

    let seen = seen.into_inner().unwrap();
    assert!(seen.len() > 1);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&100));
}
