use std::collections::HashMap;
use std::time::Duration;

use super::*;
use crate::backends::{ContinuationToken, InMemoryStore, InMemoryTable};
use crate::common::{Record, Value};
use crate::events::EventKind;

fn users(range: std::ops::Range<usize>) -> Vec<Record> {
    range
        .map(|i| Record::new().with("id", i).with("name", format!("user-{i}")))
        .collect()
}

fn coordinator(table: InMemoryTable, store: InMemoryStore) -> (ExportCoordinator, EventReceiver) {
    ExportCoordinator::new(
        TableBackend::InMemory(table),
        StoreBackend::InMemory(store),
        ScanSettings::default(),
    )
}

fn drain(rx: &EventReceiver) -> Vec<ExportEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

async fn text(store: &InMemoryStore, path: &str) -> anyhow::Result<String> {
    let bytes = store
        .object(path)
        .await
        .ok_or_else(|| anyhow::anyhow!("💀 {path} was never committed"))?;
    Ok(String::from_utf8(bytes)?)
}

#[tokio::test]
async fn the_one_where_two_segments_export_six_hundred_rows() -> anyhow::Result<()> {
    let table = InMemoryTable::from_records(users(0..600), 100);
    let store = InMemoryStore::new();
    let (coordinator, rx) = coordinator(table.clone(), store.clone());

    let summary = coordinator
        .export_table(&ExportJob::new("users").with_segments(2))
        .await?;

    assert_eq!(summary.rows, 600);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.segments.len(), 2);
    assert!(summary.segments.iter().all(|s| s.rows == 300));
    // -- 3 pages per segment, no throttles
    assert_eq!(table.requests().len(), 6);

    for segment in 0..2 {
        let csv = text(&store, &format!("users/users-{segment}-0.csv")).await?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 301);
        assert_eq!(lines[0], "id,name");
        assert_eq!(lines[1], format!("{segment},user-{segment}"));
    }
    let written: u64 = summary.segments.iter().map(|s| s.bytes).sum();
    assert_eq!(summary.bytes, written);

    let events = drain(&rx);
    assert!(matches!(events.first(), Some(ExportEvent::JobStarted { total_segments: 2, .. })));
    let pages = events
        .iter()
        .filter(|e| matches!(e, ExportEvent::PageWritten { .. }))
        .count();
    assert_eq!(pages, 6);
    assert!(events.iter().all(|e| e.kind() == EventKind::Info));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn the_one_where_throttles_back_off_and_retry_the_same_page() -> anyhow::Result<()> {
    let pages = HashMap::from([(0, vec![users(0..2), users(2..4)])]);
    let table = InMemoryTable::from_pages(pages).throttle_page(0, 1, 2);
    let store = InMemoryStore::new();
    let (coordinator, rx) = coordinator(table.clone(), store.clone());

    let started = tokio::time::Instant::now();
    let summary = coordinator.export_table(&ExportJob::new("users")).await?;

    assert_eq!(summary.rows, 4);
    assert!(started.elapsed() >= Duration::from_secs(3));

    let waits: Vec<(u32, Duration)> = drain(&rx)
        .into_iter()
        .filter_map(|event| match event {
            ExportEvent::ThroughputExceeded { attempt, wait, .. } => Some((attempt, wait)),
            _ => None,
        })
        .collect();
    assert_eq!(
        waits,
        vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
    );

    let tokens: Vec<Option<ContinuationToken>> =
        table.requests().into_iter().map(|r| r.token).collect();
    assert_eq!(
        tokens,
        vec![
            None,
            Some(ContinuationToken::Offset(1)),
            Some(ContinuationToken::Offset(1)),
            Some(ContinuationToken::Offset(1)),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn the_one_where_a_good_page_calms_the_backoff_down() -> anyhow::Result<()> {
    let pages = HashMap::from([(0, vec![users(0..2), users(2..4), users(4..5)])]);
    let table = InMemoryTable::from_pages(pages)
        .throttle_page(0, 0, 2)
        .throttle_page(0, 1, 1);
    let (coordinator, rx) = coordinator(table.clone(), InMemoryStore::new());

    let summary = coordinator.export_table(&ExportJob::new("users")).await?;

    assert_eq!(summary.rows, 5);
    let waits: Vec<(u32, Duration)> = drain(&rx)
        .into_iter()
        .filter_map(|event| match event {
            ExportEvent::ThroughputExceeded { attempt, wait, .. } => Some((attempt, wait)),
            _ => None,
        })
        .collect();
    // -- page 1's throttle starts over at the base unit, not at 4s
    assert_eq!(
        waits,
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (1, Duration::from_secs(1)),
        ]
    );
    // -- 3 pages + 3 retries
    assert_eq!(table.requests().len(), 6);
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_tiny_size_limit_rotates_between_pages() -> anyhow::Result<()> {
    let pages = HashMap::from([(0, vec![users(0..3), users(3..5)])]);
    let store = InMemoryStore::new();
    let (coordinator, rx) = coordinator(InMemoryTable::from_pages(pages), store.clone());

    let summary = coordinator
        .export_table(&ExportJob::new("users").with_max_file_size_bytes(1))
        .await?;

    assert_eq!(summary.files, 2);
    let files = &summary.segments[0].files;
    assert_eq!(files.iter().map(|f| f.file_index).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(files.iter().map(|f| f.rows).collect::<Vec<_>>(), vec![3, 2]);

    assert_eq!(
        text(&store, "users/users-0-0.csv").await?,
        "id,name\n0,user-0\n1,user-1\n2,user-2\n"
    );
    assert_eq!(
        text(&store, "users/users-0-1.csv").await?,
        "id,name\n3,user-3\n4,user-4\n"
    );

    let started: Vec<String> = drain(&rx)
        .iter()
        .filter(|e| matches!(e, ExportEvent::FileStarted { .. }))
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        started,
        vec![
            "Starting new file: memory://users/users-0-0.csv",
            "Starting new file: memory://users/users-0-1.csv",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_last_page_never_rotates_even_when_big() -> anyhow::Result<()> {
    let pages = HashMap::from([(0, vec![users(0..3)])]);
    let store = InMemoryStore::new();
    let (coordinator, _rx) = coordinator(InMemoryTable::from_pages(pages), store.clone());

    let summary = coordinator
        .export_table(&ExportJob::new("users").with_max_file_size_bytes(1))
        .await?;

    assert_eq!(summary.files, 1);
    assert_eq!(store.objects().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn the_one_where_explicit_columns_shape_every_row() -> anyhow::Result<()> {
    let records = vec![
        Record::new().with("id", 1).with("name", "ada").with("extra", true),
        Record::new().with("id", 2).with("nick", "bob"),
        Record::new().with("id", 3).with("name", Value::Null),
    ];
    let store = InMemoryStore::new();
    let (coordinator, _rx) = coordinator(InMemoryTable::from_records(records, 10), store.clone());

    coordinator
        .export_table(&ExportJob::new("people").with_columns(["name", "id"]))
        .await?;

    assert_eq!(
        text(&store, "people/people-0-0.csv").await?,
        "name,id\nada,1\n,2\n,3\n"
    );
    Ok(())
}

#[tokio::test]
async fn the_one_where_an_empty_segment_still_leaves_a_file() -> anyhow::Result<()> {
    let store = InMemoryStore::new();
    let (coordinator, _rx) = coordinator(InMemoryTable::from_records(users(0..1), 10), store.clone());

    let summary = coordinator
        .export_table(&ExportJob::new("users").with_segments(2))
        .await?;

    assert_eq!(summary.rows, 1);
    assert_eq!(summary.files, 2);
    // -- no rows, no explicit columns: nothing to infer a header from
    assert_eq!(text(&store, "users/users-1-0.csv").await?, "");
    Ok(())
}

#[tokio::test]
async fn the_one_where_one_bad_segment_fails_the_job_but_not_its_sibling() -> anyhow::Result<()> {
    let table = InMemoryTable::from_records(users(0..10), 2).fail_page(1, 1, "kaboom");
    let store = InMemoryStore::new();
    let (coordinator, rx) = coordinator(table, store.clone());

    let err = coordinator
        .export_table(&ExportJob::new("users").with_segments(2))
        .await
        .unwrap_err();

    assert!(matches!(err, ExportError::Read { segment: 1, .. }), "got {err:?}");
    assert!(err.chain_message().contains("kaboom"));

    let csv = text(&store, "users/users-0-0.csv").await?;
    assert_eq!(csv.lines().count(), 6);
    assert!(store.object("users/users-1-0.csv").await.is_none());
    assert_eq!(store.aborted().await, vec!["users/users-1-0.csv".to_string()]);

    let errors: Vec<ExportEvent> = drain(&rx)
        .into_iter()
        .filter(|e| e.kind() == EventKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].segment(), Some(1));
    Ok(())
}

#[tokio::test]
async fn the_one_where_the_destination_breaks_mid_file() -> anyhow::Result<()> {
    let store = InMemoryStore::new().failing_writes_to("users-0-0");
    let (coordinator, _rx) = coordinator(InMemoryTable::from_records(users(0..5), 10), store.clone());

    let err = coordinator
        .export_table(&ExportJob::new("users"))
        .await
        .unwrap_err();

    assert!(matches!(err, ExportError::SinkWrite { segment: 0, .. }), "got {err:?}");
    assert!(store.objects().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn the_one_where_an_unsupported_value_stops_the_segment() -> anyhow::Result<()> {
    let records = vec![
        Record::new().with("id", 1),
        Record::new().with("id", Value::Unsupported("B")),
    ];
    let store = InMemoryStore::new();
    let (coordinator, _rx) = coordinator(InMemoryTable::from_records(records, 10), store.clone());

    let err = coordinator
        .export_table(&ExportJob::new("blobs"))
        .await
        .unwrap_err();

    match err {
        ExportError::Projection { segment, source, .. } => {
            assert_eq!(segment, 0);
            assert_eq!(source.column, "id");
        }
        other => anyhow::bail!("💀 expected a projection error, got {other:?}"),
    }
    assert!(store.objects().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn the_one_where_a_worker_exports_just_its_own_segment() -> anyhow::Result<()> {
    let store = InMemoryStore::new();
    let (coordinator, _rx) = coordinator(InMemoryTable::from_records(users(0..9), 2), store.clone());
    let job = ExportJob::new("users").with_segments(3);

    let report = coordinator.export_segment(&job, 2).await?;

    assert_eq!(report.segment, 2);
    assert_eq!(report.rows, 3);
    assert_eq!(report.files.len(), 1);
    assert_eq!(
        store.objects().await.keys().cloned().collect::<Vec<_>>(),
        vec!["users/users-2-0.csv".to_string()]
    );

    let err = coordinator.export_segment(&job, 3).await.unwrap_err();
    assert!(matches!(err, ExportError::InvalidJob(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn the_one_where_nonsense_jobs_never_reach_the_table() -> anyhow::Result<()> {
    let table = InMemoryTable::from_records(users(0..3), 10);
    let (coordinator, _rx) = coordinator(table.clone(), InMemoryStore::new());

    let nonsense = [
        ExportJob::new(""),
        ExportJob::new("users").with_segments(0),
        ExportJob::new("users").with_max_file_size_bytes(0),
        ExportJob::new("users").with_columns(Vec::<String>::new()),
    ];
    for job in nonsense {
        let err = coordinator.export_table(&job).await.unwrap_err();
        assert!(matches!(err, ExportError::InvalidJob(_)), "got {err:?}");
    }
    assert!(table.requests().is_empty());
    Ok(())
}

#[test]
fn the_one_where_megabytes_become_bytes() {
    assert_eq!(ExportJob::max_file_size_from_mb(None), 250 * 1024 * 1024);
    assert_eq!(ExportJob::max_file_size_from_mb(Some(0)), 250 * 1024 * 1024);
    assert_eq!(ExportJob::max_file_size_from_mb(Some(2)), 2 * 1024 * 1024);
}

#[test]
fn the_one_where_a_fancy_delimiter_is_turned_away() {
    let runtime = RuntimeConfig {
        delimiter: '§',
        ..RuntimeConfig::default()
    };
    assert!(matches!(
        ScanSettings::try_from(&runtime),
        Err(ExportError::InvalidConfig(_))
    ));

    let runtime = RuntimeConfig {
        delimiter: ';',
        backoff_base_ms: 250,
        ..RuntimeConfig::default()
    };
    let settings = ScanSettings::try_from(&runtime).unwrap();
    assert_eq!(settings.sink.delimiter, b';');
    assert_eq!(settings.backoff_base, Duration::from_millis(250));
}
