//! End-to-end tests for the batch pipeline.
//!
//! A scripted [`InferenceService`] stands in for the VLM: responses are
//! queued per call, and hooks fire on chosen calls so a test can stop the
//! batch, re-enter it or queue more pages while a page is in flight.
//! Everything runs against a [`MemoryStore`]; no network access.

use async_trait::async_trait;
use edgequake_examscan::store::CacheEntry;
use edgequake_examscan::{
    AnalysisRequest, BatchState, InferenceService, MediaBlob, MemoryStore, PageError, PageStatus,
    Pipeline, PipelineConfig, Project, RawPage, RubricCriterion, RunOutcome, Store, StoreError,
    TaskRef,
};
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

// ── Test helpers ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Scripted {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<String, PageError>>>,
    requests: Mutex<Vec<(String, bool)>>,
    pipeline: OnceLock<Pipeline>,
    stop_on_call: Option<usize>,
    reenter_on_call: Option<usize>,
    ingest_on_call: Option<usize>,
    reentry: Mutex<Vec<RunOutcome>>,
}

impl Scripted {
    fn queue(&self, response: Result<String, PageError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceService for Scripted {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap()
            .push((request.page_id.clone(), request.force_rescan));
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok(vec![page_json("1", 1, "default")]));

        if let Some(p) = self.pipeline.get() {
            if self.stop_on_call == Some(n) {
                assert!(p.request_stop());
            }
            if self.reenter_on_call == Some(n) {
                let outcome = p.run_batch().await;
                self.reentry.lock().unwrap().push(outcome);
            }
            if self.ingest_on_call == Some(n) {
                p.ingest("late.png", vec![RawPage::image("image/png", vec![99, 99, 99])])
                    .await
                    .unwrap();
            }
        }
        response
    }
}

fn page_json(candidate: &str, number: u32, text: &str) -> Value {
    json!({
        "layoutType": "single",
        "fullText": text,
        "identifiedTasks": [{"taskNumber": "1", "subTask": "a"}],
        "rotation": 0,
        "pageNumber": number,
        "candidateId": candidate,
        "part": "Part 1"
    })
}

fn ok(elements: Vec<Value>) -> Result<String, PageError> {
    Ok(Value::Array(elements).to_string())
}

fn rubric(labels: &[(&str, &str)]) -> Vec<RubricCriterion> {
    labels
        .iter()
        .map(|(t, s)| RubricCriterion {
            task_number: t.to_string(),
            sub_task: s.to_string(),
            description: String::new(),
        })
        .collect()
}

/// Distinct, undecodable bytes per page: no normalisation needed for single pages.
fn raw(n: u8) -> RawPage {
    RawPage::image("image/png", vec![n, n, n, 7])
}

fn spread_png() -> Vec<u8> {
    let img = RgbaImage::from_fn(40, 10, |x, _| {
        if x < 20 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([0, 0, 255, 255])
        }
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// Portrait 10x40 scan of a landscape page: needs a 90° turn.
fn sideways_png() -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 40, Rgba([0, 128, 0, 255])))
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

async fn media_dims(store: &dyn Store, page_id: &str) -> (u32, u32) {
    let blob = store.get_media(page_id).await.unwrap().unwrap();
    let img = image::load_from_memory(&blob.bytes).unwrap();
    (img.width(), img.height())
}

/// Memory store whose next project write fails once armed and a media
/// write has happened.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    armed: AtomicBool,
    fail_next_project: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        self.inner.get_project(id).await
    }
    async fn put_project(&self, project: &Project) -> Result<(), StoreError> {
        if self.fail_next_project.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: "projects/exam.json".into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.put_project(project).await
    }
    async fn delete_project(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_project(id).await
    }
    async fn get_media(&self, page_id: &str) -> Result<Option<MediaBlob>, StoreError> {
        self.inner.get_media(page_id).await
    }
    async fn put_media(&self, page_id: &str, blob: &MediaBlob) -> Result<(), StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.fail_next_project.store(true, Ordering::SeqCst);
        }
        self.inner.put_media(page_id, blob).await
    }
    async fn delete_media(&self, page_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_media(page_id).await
    }
    async fn get_cached(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get_cached(hash).await
    }
    async fn put_cached(&self, hash: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        self.inner.put_cached(hash, entry).await
    }
    async fn clear_cache(&self) -> Result<usize, StoreError> {
        self.inner.clear_cache().await
    }
    async fn count_cache(&self) -> Result<usize, StoreError> {
        self.inner.count_cache().await
    }
}

async fn setup(script: Scripted, config: PipelineConfig) -> (Pipeline, Arc<Scripted>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let script = Arc::new(script);
    let pipeline = Pipeline::open("exam", store.clone(), script.clone(), config)
        .await
        .unwrap();
    let _ = script.pipeline.set(pipeline.clone());
    (pipeline, script, store)
}

async fn setup_with_rubric(script: Scripted) -> (Pipeline, Arc<Scripted>, Arc<MemoryStore>) {
    let (pipeline, script, store) = setup(script, PipelineConfig::default()).await;
    pipeline.set_rubric(rubric(&[("1", "a")])).await.unwrap();
    (pipeline, script, store)
}

fn finished(outcome: RunOutcome) -> edgequake_examscan::BatchStatus {
    match outcome {
        RunOutcome::Finished(s) => s,
        other => panic!("expected Finished, got {other:?}"),
    }
}

fn all_pages(project: &Project) -> Vec<&edgequake_examscan::Page> {
    project
        .candidates
        .values()
        .flat_map(|c| c.pages.iter())
        .collect()
}

// ── Cache ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_bytes_are_analysed_once() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    script.queue(ok(vec![page_json("007", 1, "same sheet")]));

    let ids = pipeline
        .ingest("scan.pdf", vec![raw(1), raw(1)])
        .await
        .unwrap();
    let project = pipeline.snapshot().await;
    assert_eq!(project.unprocessed[0].content_hash, project.unprocessed[1].content_hash);

    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.completed, 2);
    assert_eq!(script.calls(), 1);
    assert_eq!(pipeline.cache_size().await.unwrap(), 1);

    let project = pipeline.snapshot().await;
    let pages = &project.candidates["007"].pages;
    assert_eq!(pages.len(), 2);
    assert!(ids.iter().all(|id| pages.iter().any(|p| &p.id == id)));
    assert!(pages.iter().all(|p| p.transcription == "same sheet"));
}

#[tokio::test]
async fn forced_rescan_bypasses_and_overwrites_cache() {
    let (pipeline, script, store) = setup_with_rubric(Scripted::default()).await;
    script.queue(ok(vec![page_json("5", 1, "first read")]));
    script.queue(ok(vec![page_json("5", 1, "second read")]));

    let ids = pipeline.ingest("a.png", vec![raw(3)]).await.unwrap();
    finished(pipeline.run_batch().await);
    let hash = pipeline.snapshot().await.candidates["5"].pages[0]
        .content_hash
        .clone();

    pipeline.rescan_page(&ids[0]).await.unwrap();
    let project = pipeline.snapshot().await;
    assert!(project.candidates.is_empty());
    assert!(project.unprocessed[0].force_rescan);

    finished(pipeline.run_batch().await);
    assert_eq!(script.calls(), 2);
    assert_eq!(script.requests.lock().unwrap()[1], (ids[0].clone(), true));

    let page = &pipeline.snapshot().await.candidates["5"].pages[0];
    assert_eq!(page.transcription, "second read");
    assert!(!page.force_rescan);

    let cached = store.get_cached(&hash).await.unwrap().unwrap();
    assert_eq!(cached.results[0].full_text, "second read");
}

// ── Reconciliation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn spread_splits_into_two_pages() {
    let (pipeline, script, store) = setup_with_rubric(Scripted::default()).await;
    let mut left = page_json("12", 1, "left side");
    left["layoutType"] = json!("spread");
    left["sideInSpread"] = json!("LEFT");
    let mut right = page_json("12", 2, "right side");
    right["layoutType"] = json!("spread");
    right["sideInSpread"] = json!("RIGHT");
    script.queue(ok(vec![left, right]));

    let ids = pipeline
        .ingest("a3.pdf", vec![RawPage::image("image/png", spread_png())])
        .await
        .unwrap();
    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.completed, 1);

    let project = pipeline.snapshot().await;
    assert!(project.unprocessed.is_empty());
    let pages = &project.candidates["12"].pages;
    let got: Vec<_> = pages
        .iter()
        .map(|p| (p.id.clone(), p.transcription.clone()))
        .collect();
    assert_eq!(
        got,
        vec![
            (format!("{}_L", ids[0]), "left side".to_string()),
            (format!("{}_R", ids[0]), "right side".to_string()),
        ]
    );
    for p in pages {
        let blob = store.get_media(&p.id).await.unwrap().unwrap();
        let img = image::load_from_memory(&blob.bytes).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }
}

#[tokio::test]
async fn candidates_by_id_and_unknowns_kept_apart() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    script.queue(ok(vec![page_json("Kandidat 007", 2, "p2")]));
    script.queue(ok(vec![page_json("007", 1, "p1")]));
    script.queue(ok(vec![page_json("N/A", 1, "who?")]));
    script.queue(ok(vec![page_json("", 1, "who else?")]));

    pipeline.ingest("a.pdf", vec![raw(1), raw(2)]).await.unwrap();
    pipeline.ingest("b.pdf", vec![raw(3)]).await.unwrap();
    pipeline.ingest("c.pdf", vec![raw(4)]).await.unwrap();
    finished(pipeline.run_batch().await);

    let project = pipeline.snapshot().await;
    let numbers: Vec<_> = project.candidates["007"]
        .pages
        .iter()
        .map(|p| p.page_number)
        .collect();
    assert_eq!(numbers, vec![Some(1), Some(2)]);

    let unknowns: Vec<_> = project
        .candidates
        .values()
        .filter(|c| c.id.starts_with("unknown"))
        .collect();
    assert_eq!(unknowns.len(), 2);
    let mut names: Vec<_> = unknowns.iter().map(|c| c.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["b.pdf", "c.pdf"]);
}

#[tokio::test]
async fn tasks_outside_rubric_are_dropped() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    let mut e = page_json("3", 1, "answers");
    e["identifiedTasks"] = json!([
        {"taskNumber": "1", "subTask": "a"},
        {"taskNumber": "9", "subTask": "z"}
    ]);
    script.queue(ok(vec![e]));

    pipeline.ingest("a.png", vec![raw(1)]).await.unwrap();
    finished(pipeline.run_batch().await);

    let project = pipeline.snapshot().await;
    assert_eq!(
        project.candidates["3"].pages[0].identified_tasks,
        vec![TaskRef::new("1", "a")]
    );
}

#[tokio::test]
async fn merge_and_reassign() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    script.queue(ok(vec![page_json("1", 1, "x")]));
    script.queue(ok(vec![page_json("?", 2, "y")]));
    script.queue(ok(vec![page_json("8", 1, "z")]));

    let ids = pipeline
        .ingest("a.pdf", vec![raw(1), raw(2), raw(3)])
        .await
        .unwrap();
    finished(pipeline.run_batch().await);

    let unknown = pipeline
        .snapshot()
        .await
        .candidates
        .keys()
        .find(|k| k.starts_with("unknown"))
        .cloned()
        .unwrap();
    assert!(pipeline.merge_candidates("1", "1").await.is_err());
    assert_eq!(pipeline.merge_candidates(&unknown, "1").await.unwrap(), 1);
    pipeline.reassign_page(&ids[2], "1").await.unwrap();

    let project = pipeline.snapshot().await;
    assert_eq!(project.candidates.len(), 1);
    let pages = &project.candidates["1"].pages;
    let order: Vec<_> = pages.iter().map(|p| (p.page_number, p.id.clone())).collect();
    assert_eq!(order[0].0, Some(1));
    assert_eq!(order[2].0, Some(2));
    assert_eq!(project.page_count(), 3);
}

// ── Scheduling ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_bad_page_does_not_stop_the_batch() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    for i in 1..=5u32 {
        if i == 3 {
            script.queue(Ok("I could not read this page.".into()));
        } else {
            script.queue(ok(vec![page_json("1", i, "text")]));
        }
    }
    let ids = pipeline
        .ingest("batch.pdf", (1..=5).map(raw).collect())
        .await
        .unwrap();

    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.completed, 5);
    assert_eq!(status.failed, 1);

    let project = pipeline.snapshot().await;
    assert_eq!(project.unprocessed.len(), 1);
    let failed = &project.unprocessed[0];
    assert_eq!(failed.id, ids[2]);
    assert_eq!(failed.status, PageStatus::Error);
    assert_eq!(failed.error.as_deref(), Some("malformed response"));
    assert_eq!(all_pages(&project).len(), 4);

    // Malformed output is never cached.
    assert_eq!(pipeline.cache_size().await.unwrap(), 4);

    assert_eq!(pipeline.retry_failed().await.unwrap(), 1);
    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.total, status.completed, status.failed), (1, 1, 0));
    assert!(pipeline.snapshot().await.unprocessed.is_empty());
}

#[tokio::test]
async fn stop_finishes_current_page_then_resumes() {
    let script = Scripted {
        stop_on_call: Some(2),
        ..Default::default()
    };
    let (pipeline, script, _) = setup_with_rubric(script).await;
    let ids = pipeline
        .ingest("batch.pdf", (1..=5).map(raw).collect())
        .await
        .unwrap();

    let status = match pipeline.run_batch().await {
        RunOutcome::Stopped(s) => s,
        other => panic!("expected Stopped, got {other:?}"),
    };
    assert_eq!(status.completed, 2);
    assert_eq!(status.state, BatchState::Idle);
    assert_eq!(script.calls(), 2);

    let project = pipeline.snapshot().await;
    let pending: Vec<_> = project.unprocessed.iter().map(|p| p.id.clone()).collect();
    assert_eq!(pending, ids[2..].to_vec());
    assert!(project
        .unprocessed
        .iter()
        .all(|p| p.status == PageStatus::Pending));

    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.total, status.completed), (3, 3));
    assert_eq!(script.calls(), 5);
    let resumed: Vec<_> = script.requests.lock().unwrap()[2..]
        .iter()
        .map(|(id, _)| id.clone())
        .collect();
    assert_eq!(resumed, ids[2..].to_vec());
}

#[tokio::test]
async fn second_run_while_running_is_refused() {
    let script = Scripted {
        reenter_on_call: Some(1),
        ..Default::default()
    };
    let (pipeline, script, _) = setup_with_rubric(script).await;
    pipeline.ingest("a.pdf", vec![raw(1), raw(2)]).await.unwrap();

    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.completed, 2);
    assert_eq!(*script.reentry.lock().unwrap(), vec![RunOutcome::AlreadyRunning]);
}

#[tokio::test]
async fn pages_queued_mid_run_join_the_same_run() {
    let script = Scripted {
        ingest_on_call: Some(1),
        ..Default::default()
    };
    let (pipeline, script, _) = setup_with_rubric(script).await;
    let mut watcher = pipeline.subscribe();
    pipeline.ingest("a.pdf", vec![raw(1), raw(2)]).await.unwrap();

    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.total, status.completed), (3, 3));
    assert_eq!(script.calls(), 3);
    assert!(watcher.has_changed().unwrap());
    assert_eq!(watcher.borrow_and_update().total, 3);
}

#[tokio::test]
async fn no_rubric_holds_pages_back() {
    let (pipeline, script, _) = setup(Scripted::default(), PipelineConfig::default()).await;
    pipeline.ingest("a.pdf", vec![raw(1), raw(2)]).await.unwrap();

    assert_eq!(pipeline.run_batch().await, RunOutcome::AwaitingRubric);
    assert_eq!(script.calls(), 0);
    assert_eq!(pipeline.snapshot().await.pending_count(), 2);

    pipeline.set_rubric(rubric(&[("1", "a")])).await.unwrap();
    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.total, 2);
}

#[tokio::test]
async fn quota_exhaustion_can_halt_the_batch() {
    let config = PipelineConfig::builder()
        .stop_on_quota_exhausted(true)
        .build()
        .unwrap();
    let (pipeline, script, _) = setup(Scripted::default(), config).await;
    pipeline.set_rubric(rubric(&[("1", "a")])).await.unwrap();
    script.queue(Err(PageError::QuotaExhausted {
        detail: "429".into(),
    }));
    pipeline
        .ingest("a.pdf", vec![raw(1), raw(2), raw(3)])
        .await
        .unwrap();

    let status = match pipeline.run_batch().await {
        RunOutcome::Stopped(s) => s,
        other => panic!("expected Stopped, got {other:?}"),
    };
    assert_eq!((status.completed, status.failed), (1, 1));
    let project = pipeline.snapshot().await;
    assert_eq!(project.unprocessed[0].error.as_deref(), Some("quota exhausted"));
    assert_eq!(project.pending_count(), 2);
}

#[tokio::test]
async fn missing_media_fails_only_that_page() {
    let (pipeline, script, store) = setup_with_rubric(Scripted::default()).await;
    let ids = pipeline.ingest("a.pdf", vec![raw(1), raw(2)]).await.unwrap();
    store.delete_media(&ids[0]).await.unwrap();

    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.completed, status.failed), (2, 1));
    assert_eq!(script.calls(), 1);
    let project = pipeline.snapshot().await;
    assert_eq!(project.unprocessed[0].error.as_deref(), Some("missing media"));
}

#[tokio::test]
async fn interrupted_run_is_recovered_on_open() {
    let store = Arc::new(MemoryStore::new());
    let mut project = Project::new("exam");
    let mut page = edgequake_examscan::Page::new("p1", "h", "image/png", "a.pdf");
    page.status = PageStatus::Processing;
    project.unprocessed.push(page);
    store.put_project(&project).await.unwrap();

    let pipeline = Pipeline::open(
        "exam",
        store.clone(),
        Arc::new(Scripted::default()),
        PipelineConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(pipeline.snapshot().await.pending_count(), 1);
    let stored = store.get_project("exam").await.unwrap().unwrap();
    assert_eq!(stored.unprocessed[0].status, PageStatus::Pending);
}

#[tokio::test]
async fn clear_cache_forces_new_analysis() {
    let (pipeline, script, _) = setup_with_rubric(Scripted::default()).await;
    pipeline.ingest("a.pdf", vec![raw(1)]).await.unwrap();
    finished(pipeline.run_batch().await);
    assert_eq!(pipeline.clear_cache().await.unwrap(), 1);

    pipeline.ingest("again.pdf", vec![raw(1)]).await.unwrap();
    finished(pipeline.run_batch().await);
    assert_eq!(script.calls(), 2);
}

// ── Rotation ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rotated_page_keeps_identity_and_hash() {
    let (pipeline, script, store) = setup_with_rubric(Scripted::default()).await;
    let mut turned = page_json("8", 1, "first read");
    turned["rotation"] = json!(90);
    script.queue(ok(vec![turned]));
    // The rescan sees the already upright image.
    script.queue(ok(vec![page_json("8", 1, "second read")]));

    let ids = pipeline
        .ingest("sideways.png", vec![RawPage::image("image/png", sideways_png())])
        .await
        .unwrap();
    let ingested = pipeline.snapshot().await.unprocessed[0].content_hash.clone();
    finished(pipeline.run_batch().await);

    let page = pipeline.snapshot().await.candidates["8"].pages[0].clone();
    assert_eq!(page.id, ids[0]);
    assert_eq!(page.content_hash, ingested);
    assert_eq!(page.rotation, 90);
    assert_eq!(media_dims(store.as_ref(), &page.id).await, (40, 10));

    pipeline.rescan_page(&page.id).await.unwrap();
    finished(pipeline.run_batch().await);
    assert_eq!(script.calls(), 2);

    let page = pipeline.snapshot().await.candidates["8"].pages[0].clone();
    assert_eq!(page.transcription, "second read");
    assert_eq!(page.content_hash, ingested);
    assert_eq!(page.rotation, 90);
    assert_eq!(media_dims(store.as_ref(), &page.id).await, (40, 10));

    let cached = store.get_cached(&ingested).await.unwrap().unwrap();
    assert_eq!(cached.results[0].full_text, "second read");
    assert_eq!(cached.results[0].rotation, 90);

    // A fresh copy of the sideways scan is served from cache and turned upright.
    let again = pipeline
        .ingest("again.png", vec![RawPage::image("image/png", sideways_png())])
        .await
        .unwrap();
    finished(pipeline.run_batch().await);
    assert_eq!(script.calls(), 2);
    assert_eq!(media_dims(store.as_ref(), &again[0]).await, (40, 10));
}

#[tokio::test]
async fn failed_commit_leaves_media_as_ingested() {
    let store = Arc::new(FlakyStore::default());
    let script = Arc::new(Scripted::default());
    let mut turned = page_json("8", 1, "sideways");
    turned["rotation"] = json!(90);
    script.queue(ok(vec![turned]));
    let pipeline = Pipeline::open("exam", store.clone(), script.clone(), PipelineConfig::default())
        .await
        .unwrap();
    pipeline.set_rubric(rubric(&[("1", "a")])).await.unwrap();

    let ids = pipeline
        .ingest("sideways.png", vec![RawPage::image("image/png", sideways_png())])
        .await
        .unwrap();
    store.armed.store(true, Ordering::SeqCst);

    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.failed, 1);
    let project = pipeline.snapshot().await;
    assert_eq!(project.unprocessed[0].status, PageStatus::Error);
    assert_eq!(project.unprocessed[0].error.as_deref(), Some("storage failure"));
    assert_eq!(media_dims(store.as_ref(), &ids[0]).await, (10, 40));

    assert_eq!(pipeline.retry_failed().await.unwrap(), 1);
    let status = finished(pipeline.run_batch().await);
    assert_eq!(status.failed, 0);
    assert_eq!(script.calls(), 1);
    assert_eq!(media_dims(store.as_ref(), &ids[0]).await, (40, 10));
}

#[tokio::test]
async fn pages_ingested_after_the_queue_drains_wait_for_the_next_run() {
    let (pipeline, _, _) = setup_with_rubric(Scripted::default()).await;
    pipeline.ingest("a.pdf", vec![raw(1)]).await.unwrap();
    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.total, status.completed), (1, 1));

    pipeline.ingest("b.pdf", vec![raw(2)]).await.unwrap();
    let idle = pipeline.status();
    assert_eq!(idle.state, BatchState::Idle);
    assert_eq!(idle.total, idle.completed);
    assert_eq!(pipeline.snapshot().await.pending_count(), 1);

    let status = finished(pipeline.run_batch().await);
    assert_eq!((status.total, status.completed), (1, 1));
}
