//! Batch scheduling: the [`Pipeline`] handle.
//!
//! One page is analysed at a time. The loop claims the first pending page,
//! dispatches it, reconciles the outcome and moves on; pages queued while a
//! run is in progress are picked up by the same loop. The project lock is
//! held only to claim a page and to apply its results, never across a
//! service call, so readers and administrative calls are never blocked by
//! a slow analysis.
//!
//! ```text
//!            run_batch()                      loop drained
//!   Idle ──────────────────▶ Running ───────────────────────────▶ Idle
//!                              │  request_stop()                   ▲
//!                              ▼                                   │
//!                           Stopping ── in-flight page done ───────┘
//! ```

use crate::cache::ResultCache;
use crate::config::PipelineConfig;
use crate::error::{ExamScanError, PageError};
use crate::model::{Page, PageStatus, Project, Rubric, RubricCriterion};
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::inference::InferenceService;
use crate::pipeline::ingest::{prepare_page, RawPage, Rasterizer};
use crate::progress::{BatchProgressCallback, BatchState, BatchStatus};
use crate::reconcile::Reconciler;
use crate::store::{MediaBlob, Store};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// How a call to [`Pipeline::run_batch`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was already in progress; its loop will pick up new pages.
    AlreadyRunning,
    /// No rubric yet; pending pages are held back.
    AwaitingRubric,
    /// The queue drained.
    Finished(BatchStatus),
    /// A stop was requested; remaining pages stay pending.
    Stopped(BatchStatus),
}

enum Claim {
    Page(Page, Option<Rubric>),
    /// Nothing left; the batch is already idle with this final status.
    Drained(BatchStatus),
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    cache: ResultCache,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    project: Mutex<Project>,
    status: watch::Sender<BatchStatus>,
    stop: AtomicBool,
}

/// Handle to one project's pipeline. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Load `project_id` from `store`, or start an empty project.
    ///
    /// Pages left in `processing` by an interrupted run are reset to
    /// `pending` so the next run resumes them.
    pub async fn open(
        project_id: &str,
        store: Arc<dyn Store>,
        inference: Arc<dyn InferenceService>,
        config: PipelineConfig,
    ) -> Result<Self, ExamScanError> {
        let mut project = match store.get_project(project_id).await? {
            Some(p) => {
                info!(
                    "Opened project {}: {} candidate(s), {} page(s) in pool",
                    p.id,
                    p.candidates.len(),
                    p.unprocessed.len()
                );
                p
            }
            None => {
                info!("Creating project {}", project_id);
                let p = Project::new(project_id);
                store.put_project(&p).await?;
                p
            }
        };

        let recovered = project.recover_interrupted();
        if recovered > 0 {
            warn!("Recovered {} page(s) from an interrupted run", recovered);
            project.touch();
            store.put_project(&project).await?;
        }

        let cache = ResultCache::new(Arc::clone(&store));
        let dispatcher = Dispatcher::new(inference, cache.clone(), config.max_task_label_len);
        let reconciler = Reconciler::new(Arc::clone(&store), config.preview_max_px);
        let (status, _) = watch::channel(BatchStatus::default());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache,
                dispatcher,
                reconciler,
                project: Mutex::new(project),
                status,
                stop: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// A copy of the current project document.
    pub async fn snapshot(&self) -> Project {
        self.inner.project.lock().await.clone()
    }

    pub fn status(&self) -> BatchStatus {
        *self.inner.status.borrow()
    }

    /// Watch the batch status; the receiver always holds the latest value.
    pub fn subscribe(&self) -> watch::Receiver<BatchStatus> {
        self.inner.status.subscribe()
    }

    fn callback(&self) -> Option<&Arc<dyn BatchProgressCallback>> {
        self.inner.config.progress_callback.as_ref()
    }

    // ── Ingestion ────────────────────────────────────────────────────────

    /// Add raw pages from `source_file` to the pending pool.
    ///
    /// Media is written before the project document, so a pending page
    /// always has its bytes. Returns the new page ids.
    pub async fn ingest(&self, source_file: &str, pages: Vec<RawPage>) -> Result<Vec<String>, ExamScanError> {
        if pages.is_empty() {
            warn!("{} produced no pages", source_file);
            return Ok(Vec::new());
        }

        let mut prepared = Vec::with_capacity(pages.len());
        for raw in pages {
            let (page, blob) = prepare_page(raw, source_file, self.inner.config.preview_max_px).await?;
            self.inner.store.put_media(&page.id, &blob).await?;
            prepared.push(page);
        }
        let ids: Vec<String> = prepared.iter().map(|p| p.id.clone()).collect();

        let mut project = self.inner.project.lock().await;
        let before = project.pending_count();
        let mut next = project.clone();
        next.unprocessed.extend(prepared);
        next.touch();
        self.inner.store.put_project(&next).await?;
        *project = next;
        self.enqueued(&project, before);

        info!("Ingested {} page(s) from {}", ids.len(), source_file);
        Ok(ids)
    }

    /// Convert `path` with `rasterizer` and ingest the result.
    pub async fn ingest_file(&self, path: &Path, rasterizer: &dyn Rasterizer) -> Result<Vec<String>, ExamScanError> {
        let pages = rasterizer.convert(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.ingest(&name, pages).await
    }

    /// Raise the running batch's total by however many pages became pending.
    /// Must be called with the project lock held.
    fn enqueued(&self, project: &MutexGuard<'_, Project>, pending_before: usize) {
        let added = project.pending_count().saturating_sub(pending_before);
        if added == 0 {
            return;
        }
        let raised = self.inner.status.send_if_modified(|s| {
            if s.is_running() {
                s.total += added;
                true
            } else {
                false
            }
        });
        if raised {
            debug!("{} page(s) queued into the running batch", added);
            if let Some(cb) = self.callback() {
                cb.on_total_changed(&self.status());
            }
        }
    }

    // ── Batch run ────────────────────────────────────────────────────────

    /// Process pending pages one at a time until the pool drains or a stop
    /// is requested.
    ///
    /// Returns immediately with [`RunOutcome::AlreadyRunning`] if a run is
    /// in progress, and with [`RunOutcome::AwaitingRubric`] if no rubric is
    /// set. Page failures never end the run.
    pub async fn run_batch(&self) -> RunOutcome {
        let total = {
            let project = self.inner.project.lock().await;
            if self.status().is_running() {
                return RunOutcome::AlreadyRunning;
            }
            if project.rubric.is_none() {
                info!(
                    "No rubric set; holding {} pending page(s)",
                    project.pending_count()
                );
                return RunOutcome::AwaitingRubric;
            }
            let total = project.pending_count();
            self.inner.stop.store(false, Ordering::SeqCst);
            let started = self.inner.status.send_if_modified(|s| {
                if s.is_running() {
                    return false;
                }
                *s = BatchStatus {
                    state: BatchState::Running,
                    total,
                    completed: 0,
                    failed: 0,
                };
                true
            });
            if !started {
                return RunOutcome::AlreadyRunning;
            }
            total
        };

        info!("Batch started: {} page(s) pending", total);
        if let Some(cb) = self.callback() {
            cb.on_batch_start(total);
        }

        let (stopped, status) = loop {
            if self.inner.stop.load(Ordering::SeqCst) {
                break (true, self.go_idle());
            }
            let (page, rubric) = match self.claim_next().await {
                Claim::Page(page, rubric) => (page, rubric),
                Claim::Drained(status) => break (false, status),
            };

            if let Some(cb) = self.callback() {
                cb.on_page_start(&page.id, &self.status());
            }

            match self.process(&page, rubric.as_ref()).await {
                Ok(derived) => {
                    self.inner.status.send_modify(|s| s.completed += 1);
                    if let Some(cb) = self.callback() {
                        cb.on_page_complete(&page.id, derived, &self.status());
                    }
                }
                Err(e) => {
                    error!("Page {} failed: {}", page.id, e);
                    self.mark_failed(&page.id, &e).await;
                    self.inner.status.send_modify(|s| {
                        s.completed += 1;
                        s.failed += 1;
                    });
                    if let Some(cb) = self.callback() {
                        cb.on_page_error(&page.id, &e, &self.status());
                    }
                    if e.is_quota() && self.inner.config.stop_on_quota_exhausted {
                        warn!("Quota exhausted; stopping after this page");
                        self.request_stop();
                    }
                }
            }
        };

        info!(
            "Batch {}: {}/{} page(s) done, {} failed",
            if stopped { "stopped" } else { "finished" },
            status.completed,
            status.total,
            status.failed
        );
        if let Some(cb) = self.callback() {
            cb.on_batch_complete(&status, stopped);
        }

        if stopped {
            RunOutcome::Stopped(status)
        } else {
            RunOutcome::Finished(status)
        }
    }

    /// Ask the running batch to stop after its in-flight page.
    /// Returns `false` if no batch is running.
    pub fn request_stop(&self) -> bool {
        self.inner.status.send_if_modified(|s| {
            if s.state == BatchState::Running {
                self.inner.stop.store(true, Ordering::SeqCst);
                s.state = BatchState::Stopping;
                true
            } else {
                false
            }
        })
    }

    /// Set the batch idle and return the status it ended with.
    fn go_idle(&self) -> BatchStatus {
        let mut last = BatchStatus::default();
        self.inner.status.send_modify(|s| {
            s.state = BatchState::Idle;
            last = *s;
        });
        last
    }

    /// Mark the first pending page `processing` and hand out a copy of it.
    ///
    /// When nothing is claimable the batch goes idle before the project
    /// lock is released, so a page ingested from then on is left for the
    /// next run instead of raising this run's total.
    async fn claim_next(&self) -> Claim {
        let mut project = self.inner.project.lock().await;
        let next = match project.rubric {
            Some(_) => project.next_pending(),
            None => None,
        };
        let Some(idx) = next else {
            return Claim::Drained(self.go_idle());
        };
        project.unprocessed[idx].status = PageStatus::Processing;
        let page = project.unprocessed[idx].clone();
        let rubric = project.rubric.clone();
        project.touch();
        if let Err(e) = self.inner.store.put_project(&project).await {
            warn!("Could not persist claim of page {}: {}", page.id, e);
        }
        Claim::Page(page, rubric)
    }

    async fn process(&self, page: &Page, rubric: Option<&Rubric>) -> Result<usize, PageError> {
        let media = self.load_media(&page.id).await?;
        let dispatched = self
            .with_watchdog(&page.id, self.inner.dispatcher.analyze(page, &media, rubric))
            .await?;
        if dispatched.from_cache {
            debug!("Page {}: reusing cached analysis", page.id);
        }
        let derived = self
            .inner
            .reconciler
            .derive(page, &media, dispatched.results)
            .await?;

        let mut project = self.inner.project.lock().await;
        let ids = self
            .inner
            .reconciler
            .apply(&mut project, &page.id, &media, derived)
            .await
            .map_err(|e| PageError::StorageFailed {
                detail: e.to_string(),
            })?;
        Ok(ids.len())
    }

    async fn load_media(&self, page_id: &str) -> Result<MediaBlob, PageError> {
        match self.inner.store.get_media(page_id).await {
            Ok(Some(blob)) => Ok(blob),
            Ok(None) => Err(PageError::MissingMedia {
                page_id: page_id.to_string(),
            }),
            Err(e) => {
                warn!("Media read failed for {}: {}", page_id, e);
                Err(PageError::MissingMedia {
                    page_id: page_id.to_string(),
                })
            }
        }
    }

    /// Await `fut`, logging every `slow_call_warn_secs` while it runs.
    async fn with_watchdog<F: Future>(&self, page_id: &str, fut: F) -> F::Output {
        let secs = self.inner.config.slow_call_warn_secs;
        if secs == 0 {
            return fut.await;
        }
        let period = Duration::from_secs(secs);
        let started = Instant::now();
        let mut ticker = interval_at(started + period, period);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => {
                    warn!("Page {}: analysis still running after {:?}", page_id, started.elapsed());
                }
            }
        }
    }

    async fn mark_failed(&self, page_id: &str, err: &PageError) {
        let mut project = self.inner.project.lock().await;
        let Some(page) = project.pool_page_mut(page_id) else {
            warn!("Failed page {} is no longer in the pool", page_id);
            return;
        };
        page.status = PageStatus::Error;
        page.error = Some(err.label().to_string());
        project.touch();
        if let Err(e) = self.inner.store.put_project(&project).await {
            warn!("Could not persist failure of page {}: {}", page_id, e);
        }
    }

    // ── Administration ───────────────────────────────────────────────────

    /// Replace the rubric. Pending pages become eligible on the next run.
    pub async fn set_rubric(&self, criteria: Vec<RubricCriterion>) -> Result<(), ExamScanError> {
        let mut project = self.inner.project.lock().await;
        let mut next = project.clone();
        next.rubric = Some(Rubric::new(criteria));
        next.touch();
        self.inner.store.put_project(&next).await?;
        *project = next;
        info!("Rubric set; {} page(s) pending", project.pending_count());
        Ok(())
    }

    pub async fn retry_page(&self, page_id: &str) -> Result<bool, ExamScanError> {
        let mut project = self.inner.project.lock().await;
        let before = project.pending_count();
        let reset = self.inner.reconciler.retry_page(&mut project, page_id).await?;
        self.enqueued(&project, before);
        Ok(reset)
    }

    pub async fn retry_failed(&self) -> Result<usize, ExamScanError> {
        let mut project = self.inner.project.lock().await;
        let before = project.pending_count();
        let reset = self.inner.reconciler.retry_failed(&mut project).await?;
        self.enqueued(&project, before);
        info!("{} failed page(s) queued for retry", reset);
        Ok(reset)
    }

    pub async fn rescan_page(&self, page_id: &str) -> Result<(), ExamScanError> {
        let mut project = self.inner.project.lock().await;
        let before = project.pending_count();
        self.inner.reconciler.rescan_page(&mut project, page_id).await?;
        self.enqueued(&project, before);
        Ok(())
    }

    pub async fn merge_candidates(&self, from: &str, into: &str) -> Result<usize, ExamScanError> {
        let mut project = self.inner.project.lock().await;
        self.inner
            .reconciler
            .merge_candidates(&mut project, from, into)
            .await
    }

    pub async fn reassign_page(&self, page_id: &str, candidate_id: &str) -> Result<(), ExamScanError> {
        let mut project = self.inner.project.lock().await;
        self.inner
            .reconciler
            .reassign_page(&mut project, page_id, candidate_id)
            .await
    }

    /// Drop every cached analysis result. Returns how many were removed.
    pub async fn clear_cache(&self) -> Result<usize, ExamScanError> {
        let removed = self.inner.cache.clear().await?;
        info!("Cleared {} cached result(s)", removed);
        Ok(removed)
    }

    pub async fn cache_size(&self) -> Result<usize, ExamScanError> {
        Ok(self.inner.cache.count().await?)
    }
}
