use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vexport_core::{
    DownloadBody, Downloader, ExportCallbacks, ExportEngine, ExportError, FnResolver,
};
use vexport_types::{
    ChunkPayload, ChunkStatus, ErrorCode, ExportEvent, ExportItem, LinkRequest, LinkResponse,
};

const HOUR: i64 = 3_600_000;

/// Serves `data` for every link, except links whose path starts with a
/// failing prefix (connection reset) or `/hang` (never finishes).
#[derive(Clone, Default)]
struct ScriptedDownloader {
    failing: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDownloader {
    fn fail(&self, prefix: &str) {
        self.failing.lock().unwrap().push(prefix.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls_for(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn fetch(&self, url: &url::Url, cancel: &CancellationToken) -> Result<DownloadBody, ExportError> {
        let path = url.path().to_string();
        self.calls.lock().unwrap().push(path.clone());

        if self.failing.lock().unwrap().iter().any(|p| path.starts_with(p.as_str())) {
            return Err(ExportError::Network("connection reset".to_string()));
        }

        if path.starts_with("/hang") {
            let stream = stream::iter(vec![Ok(Bytes::from_static(b"head"))])
                .chain(stream::pending())
                .boxed();
            return Ok(DownloadBody::new(stream, Some(100), cancel.clone()));
        }

        let stream = stream::iter(vec![Ok(Bytes::from_static(b"da")), Ok(Bytes::from_static(b"ta"))]).boxed();
        Ok(DownloadBody::new(stream, Some(4), cancel.clone()))
    }
}

/// Links look like `http://media.test/<stream_uuid>/<start_date>`
fn resolver() -> FnResolver<impl Fn(LinkRequest) -> futures::future::Ready<anyhow::Result<LinkResponse>> + Send + Sync> {
    FnResolver(|req: LinkRequest| {
        futures::future::ready(Ok::<_, anyhow::Error>(LinkResponse {
            link: format!("http://media.test/{}/{}", req.stream_uuid, req.start_date),
        }))
    })
}

fn item(id: &str, stream: &str, hours: i64) -> ExportItem {
    let mut item = ExportItem::new(format!("Camera {}", id), stream, 0, hours * HOUR);
    item.id = id.to_string();
    item
}

fn engine_with(downloader: &ScriptedDownloader) -> ExportEngine {
    ExportEngine::builder(resolver())
        .downloader(downloader.clone())
        .build()
        .expect("engine")
}

fn statuses(engine: &ExportEngine) -> Vec<ChunkStatus> {
    engine.all_chunks().iter().map(|c| c.status).collect()
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn failed_chunk_does_not_stop_the_run() {
    let downloader = ScriptedDownloader::default();
    downloader.fail(&format!("/cams/{}", HOUR));

    let successes = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let chunk_errors = Arc::new(AtomicUsize::new(0));
    let s = successes.clone();
    let e = chunk_errors.clone();
    let engine = ExportEngine::builder(resolver())
        .downloader(downloader.clone())
        .on_export_success(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_chunk_error(move |_id, _err| {
            e.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let c = completions.clone();
    engine.set_callbacks(ExportCallbacks::new().on_export_complete(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));

    engine.add_item(item("x", "cams", 3)).unwrap();
    engine.start_export().await.unwrap();

    assert_eq!(
        statuses(&engine),
        vec![ChunkStatus::Downloaded, ChunkStatus::Errored, ChunkStatus::Downloaded]
    );
    let failed = engine.chunk("x#1").unwrap();
    assert_eq!(failed.error.unwrap().code, ErrorCode::NetworkError);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert_eq!(chunk_errors.load(Ordering::SeqCst), 1);
    assert!(!engine.is_running());
    assert!(engine.state().current_chunk_id.is_none());
}

#[tokio::test]
async fn successful_run_buffers_chunks_in_memory() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    let mut events = engine.subscribe();

    engine.add_items(vec![item("a", "cams", 2), item("b", "cams", 1)]).unwrap();
    engine.start_export().await.unwrap();

    assert!(statuses(&engine).iter().all(|s| *s == ChunkStatus::Downloaded));
    assert_eq!(engine.state().progress, 100.0);
    assert_eq!(
        engine.take_chunk_payload("b#0").unwrap(),
        Some(ChunkPayload::Memory(Bytes::from_static(b"data")))
    );
    assert_eq!(engine.take_chunk_payload("b#0").unwrap(), None);

    // Processing follows item insertion order, then chunk order
    let mut started = Vec::new();
    let mut succeeded = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ExportEvent::ChunkStatusChanged {
                chunk_id,
                status: ChunkStatus::InProcess,
                ..
            } => started.push(chunk_id),
            ExportEvent::ExportSucceeded => succeeded += 1,
            _ => {}
        }
    }
    assert_eq!(started, vec!["a#0", "a#1", "b#0"]);
    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn second_start_is_rejected_and_cancel_resets_chunks() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    let mut events = engine.subscribe();
    engine.add_item(item("h", "hang", 2)).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("first chunk in process", || {
        engine.chunk("h#0").map(|c| c.status) == Some(ChunkStatus::InProcess)
    })
    .await;

    assert!(engine.should_warn_before_unload());
    let before = statuses(&engine);
    assert!(matches!(engine.start_export().await, Err(ExportError::ExportInProgress)));
    assert_eq!(statuses(&engine), before);

    assert!(engine.cancel());
    // Reset happens at once, not when the run loop catches up
    assert!(engine.state().current_chunk_id.is_none());
    assert_eq!(statuses(&engine), vec![ChunkStatus::Ready, ChunkStatus::Ready]);
    assert!(!engine.cancel());
    run.await.unwrap().unwrap();

    assert_eq!(statuses(&engine), vec![ChunkStatus::Ready, ChunkStatus::Ready]);
    assert!(!engine.is_running());
    assert_eq!(engine.state().progress, 0.0);

    let mut cancelled = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ExportEvent::ExportCancelled => cancelled += 1,
            ExportEvent::ExportCompleted => completed += 1,
            _ => {}
        }
    }
    assert_eq!(cancelled, 1);
    assert_eq!(completed, 0);
}

#[tokio::test]
async fn cancel_with_confirmation_respects_the_answer() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    assert!(!engine.cancel_with_confirmation(async { true }).await);

    engine.add_item(item("h", "hang", 1)).unwrap();
    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("run to start", || engine.is_running()).await;

    assert!(!engine.cancel_with_confirmation(async { false }).await);
    assert!(engine.is_running());
    assert!(engine.cancel_with_confirmation(async { true }).await);
    run.await.unwrap().unwrap();
    assert_eq!(statuses(&engine), vec![ChunkStatus::Ready]);
}

#[tokio::test]
async fn retry_touches_only_errored_chunks() {
    let downloader = ScriptedDownloader::default();
    downloader.fail(&format!("/cams/{}", HOUR));
    let engine = engine_with(&downloader);
    engine.add_item(item("x", "cams", 2)).unwrap();
    engine.start_export().await.unwrap();
    assert_eq!(statuses(&engine), vec![ChunkStatus::Downloaded, ChunkStatus::Errored]);

    downloader.heal();
    engine.start_chunks_export(&["x#0", "x#1"]).await.unwrap();

    assert_eq!(statuses(&engine), vec![ChunkStatus::Downloaded, ChunkStatus::Downloaded]);
    assert!(engine.chunk("x#1").unwrap().error.is_none());
    assert_eq!(downloader.calls_for("/cams/0"), 1);
    assert_eq!(downloader.calls_for(&format!("/cams/{}", HOUR)), 2);
}

#[tokio::test]
async fn chunk_export_validates_ids() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_item(item("x", "cams", 1)).unwrap();

    assert!(matches!(
        engine.start_chunk_export("x#9").await,
        Err(ExportError::ChunkNotFound(id)) if id == "x#9"
    ));
    assert!(matches!(
        engine.start_chunks_export(&["x#0", "nope#0"]).await,
        Err(ExportError::ChunkNotFound(_))
    ));
    assert_eq!(statuses(&engine), vec![ChunkStatus::Ready]);
    assert!(downloader.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn chunk_export_joins_an_active_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_item(item("h", "hang", 1)).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("hanging chunk in process", || {
        engine.state().current_chunk_id.as_deref() == Some("h#0")
    })
    .await;

    engine.add_item(item("late", "cams", 1)).unwrap();
    engine.start_chunk_export("late#0").await.unwrap();
    assert_eq!(engine.chunk("late#0").unwrap().status, ChunkStatus::Waiting);

    engine.remove_item("h").unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(engine.chunk("late#0").unwrap().status, ChunkStatus::Downloaded);
}

#[tokio::test]
async fn cancel_resets_chunks_that_joined_the_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_item(item("h", "hang", 1)).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("hanging chunk in process", || {
        engine.state().current_chunk_id.as_deref() == Some("h#0")
    })
    .await;

    engine.add_item(item("late", "cams", 1)).unwrap();
    engine.start_chunk_export("late#0").await.unwrap();
    assert!(engine.cancel());
    run.await.unwrap().unwrap();

    assert_eq!(statuses(&engine), vec![ChunkStatus::Ready, ChunkStatus::Ready]);
    assert_eq!(downloader.calls_for("/cams"), 0);
}

#[tokio::test]
async fn readded_item_is_exported_after_removal_mid_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    let mut events = engine.subscribe();
    engine.add_item(item("a", "hang", 1)).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("first attempt in process", || {
        engine.state().current_chunk_id.as_deref() == Some("a#0")
    })
    .await;

    // Same item id, new source; the old attempt is still winding down
    engine.remove_item("a").unwrap();
    engine.add_item(item("a", "cams", 1)).unwrap();
    engine.start_chunk_export("a#0").await.unwrap();
    assert_eq!(engine.chunk("a#0").unwrap().status, ChunkStatus::Waiting);

    run.await.unwrap().unwrap();

    let chunk = engine.chunk("a#0").unwrap();
    assert_eq!(chunk.status, ChunkStatus::Downloaded);
    assert!(chunk.error.is_none());
    assert_eq!(
        engine.take_chunk_payload("a#0").unwrap(),
        Some(ChunkPayload::Memory(Bytes::from_static(b"data")))
    );
    assert_eq!(downloader.calls_for("/hang"), 1);
    assert_eq!(downloader.calls_for("/cams"), 1);

    let mut succeeded = 0;
    let mut cancelled_chunks = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ExportEvent::ExportSucceeded => succeeded += 1,
            ExportEvent::ChunkStatusChanged {
                status: ChunkStatus::Ready,
                ..
            } => cancelled_chunks += 1,
            _ => {}
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(cancelled_chunks, 0);
}

#[tokio::test]
async fn only_one_chunk_is_in_process_at_a_time() {
    let downloader = ScriptedDownloader::default();
    downloader.fail(&format!("/cams/{}", HOUR));
    let engine = engine_with(&downloader);

    let peak = Arc::new(AtomicUsize::new(0));
    let transitions = Arc::new(AtomicUsize::new(0));
    let observed = engine.clone();
    let (p, t) = (peak.clone(), transitions.clone());
    engine.set_callbacks(ExportCallbacks::new().on_chunk_status_change(move |_id, _status, _, _| {
        let in_process = observed
            .all_chunks()
            .iter()
            .filter(|c| c.status == ChunkStatus::InProcess)
            .count();
        p.fetch_max(in_process, Ordering::SeqCst);
        t.fetch_add(1, Ordering::SeqCst);
    }));

    engine
        .add_items(vec![item("a", "cams", 2), item("b", "cams", 3), item("c", "cams", 1)])
        .unwrap();
    engine.start_export().await.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    // Waiting, InProcess and a final status for each of the six chunks
    assert_eq!(transitions.load(Ordering::SeqCst), 18);
    assert_eq!(
        statuses(&engine),
        vec![
            ChunkStatus::Downloaded,
            ChunkStatus::Errored,
            ChunkStatus::Downloaded,
            ChunkStatus::Errored,
            ChunkStatus::Downloaded,
            ChunkStatus::Downloaded,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_open_a_single_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    let mut events = engine.subscribe();
    engine.add_item(item("h", "hang", 1)).unwrap();

    let starts: Vec<_> = (0..4)
        .map(|_| {
            let runner = engine.clone();
            tokio::spawn(async move { runner.start_export().await })
        })
        .collect();

    // Losers must be turned away rather than queue behind the winner
    wait_until("three starts rejected", || {
        starts.iter().filter(|s| s.is_finished()).count() == 3
    })
    .await;
    assert!(engine.cancel());

    let mut results = Vec::new();
    for start in starts {
        results.push(start.await.unwrap());
    }
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(ExportError::ExportInProgress)))
            .count(),
        3
    );
    assert_eq!(downloader.calls_for("/hang"), 1);

    let mut cancelled = 0;
    while let Ok(event) = events.try_recv() {
        if event == ExportEvent::ExportCancelled {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn start_after_cancel_waits_for_the_cancelled_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_items(vec![item("h", "hang", 1), item("x", "cams", 1)]).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("hanging chunk in process", || {
        engine.state().current_chunk_id.as_deref() == Some("h#0")
    })
    .await;

    assert!(engine.cancel());
    engine.remove_item("h").unwrap();
    engine.start_export().await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(statuses(&engine), vec![ChunkStatus::Downloaded]);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn removing_an_item_mid_run_moves_on_to_the_next() {
    let downloader = ScriptedDownloader::default();
    let successes = Arc::new(AtomicBool::new(false));
    let flag = successes.clone();
    let engine = ExportEngine::builder(resolver())
        .downloader(downloader.clone())
        .on_export_success(move || flag.store(true, Ordering::SeqCst))
        .build()
        .unwrap();
    engine.add_items(vec![item("a", "hang", 1), item("b", "cams", 1)]).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("first item in process", || {
        engine.state().current_chunk_id.as_deref() == Some("a#0")
    })
    .await;

    engine.remove_item("a").unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(engine.items().len(), 1);
    assert!(engine.chunk("a#0").is_none());
    assert_eq!(engine.chunk("b#0").unwrap().status, ChunkStatus::Downloaded);
    assert!(successes.load(Ordering::SeqCst));
}

#[tokio::test]
async fn items_are_added_atomically() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    let changes = Arc::new(AtomicUsize::new(0));
    let c = changes.clone();
    engine.set_callbacks(ExportCallbacks::new().on_items_change(move || {
        c.fetch_add(1, Ordering::SeqCst);
    }));

    engine.add_item(item("x", "cams", 1)).unwrap();
    assert!(matches!(
        engine.add_item(item("x", "cams", 1)),
        Err(ExportError::ItemAlreadyExists(_))
    ));

    let mut inverted = item("bad", "cams", 1);
    inverted.end_time = inverted.start_time;
    assert!(matches!(
        engine.add_items(vec![item("y", "cams", 1), inverted]),
        Err(ExportError::InvalidTimeRange { .. })
    ));

    assert_eq!(engine.items().len(), 1);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    assert!(matches!(engine.chunks_for_item("y"), Err(ExportError::ItemNotFound(_))));
    assert_eq!(engine.chunks_for_item("x").unwrap().len(), 1);
}

#[tokio::test]
async fn confirmation_gates_removal_and_clear() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_items(vec![item("x", "cams", 1), item("y", "cams", 1)]).unwrap();

    assert!(matches!(
        engine.remove_item_with_confirmation("nope", async { true }).await,
        Err(ExportError::ItemNotFound(_))
    ));
    assert!(!engine.remove_item_with_confirmation("x", async { false }).await.unwrap());
    assert!(engine.remove_item_with_confirmation("x", async { true }).await.unwrap());
    assert_eq!(engine.items().len(), 1);

    assert!(!engine.clear_all_with_confirmation(async { false }).await);
    assert!(engine.clear_all_with_confirmation(async { true }).await);
    assert!(engine.items().is_empty());
    assert!(engine.all_chunks().is_empty());
}

#[tokio::test]
async fn clear_all_cancels_the_active_run() {
    let downloader = ScriptedDownloader::default();
    let engine = engine_with(&downloader);
    engine.add_item(item("h", "hang", 1)).unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.start_export().await });
    wait_until("run to start", || engine.is_running()).await;

    engine.clear_all();
    run.await.unwrap().unwrap();

    assert!(!engine.is_running());
    assert!(engine.all_chunks().is_empty());
}

#[tokio::test]
async fn filesystem_destination_receives_chunk_files() {
    let dir = TempDir::new().unwrap();
    let downloader = ScriptedDownloader::default();
    let engine = ExportEngine::builder(resolver())
        .downloader(downloader.clone())
        .max_chunk_duration(HOUR as u64)
        .build()
        .unwrap();
    engine.set_destination(Some(dir.path().to_path_buf()));

    let mut gate = ExportItem::new("Gate 1", "cams", 1_699_900_000_000, 1_699_900_000_000 + 2 * HOUR);
    gate.id = "gate".to_string();
    engine.add_item(gate).unwrap();
    engine.start_export().await.unwrap();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "Gate_1_2023-11-13_18-26-40_to_19-26-40.mkv",
            "Gate_1_2023-11-13_19-26-40_to_20-26-40.mkv",
        ]
    );
    assert!(matches!(
        engine.take_chunk_payload("gate#1").unwrap(),
        Some(ChunkPayload::File(_))
    ));
}
