//! Candidate reconciliation: fold analysis results into the project.
//!
//! [`Reconciler`] is the only writer of the candidate collection. Every
//! mutation is computed on a copy of the [`Project`], persisted with a
//! single `put_project`, and only then swapped in, so a failed write leaves
//! both the in-memory project and the stored document untouched.
//!
//! Integration runs in two steps so the scheduler never holds the project
//! lock across image work:
//!
//! 1. [`Reconciler::derive`] turns one source page plus its results into
//!    concrete derived pages (rotating and splitting via
//!    [`crate::pipeline::layout`]). No project access.
//! 2. [`Reconciler::apply`] files the derived pages under their candidates,
//!    removes the source page from the pool exactly once, and persists.

use crate::error::{ExamScanError, PageError};
use crate::hash::content_hash;
use crate::model::{
    AnalysisResult, Candidate, CandidateStatus, Page, PageLocation, PageStatus, Project,
};
use crate::pipeline::layout::{derived_page_id, normalize};
use crate::store::{MediaBlob, Store};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A concrete page produced from one analysis result, not yet filed.
#[derive(Debug, Clone)]
pub struct DerivedPage {
    pub page: Page,
    /// New media to store under `page.id`; `None` when the source blob is reused as-is.
    pub media: Option<MediaBlob>,
    /// Candidate storage key.
    pub target: String,
    /// Display name used if the candidate has to be created.
    pub display_name: String,
}

/// Storage key for a result: the normalised id, or a per-source placeholder.
///
/// Unknown pages are deliberately not pooled into one "unknown" candidate;
/// each source page gets its own until someone reassigns it.
pub fn candidate_key(result: &AnalysisResult, source: &Page) -> String {
    if result.is_unknown_candidate() {
        let raw = format!("unknown-{}-{}", source.source_file, source.id);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    } else {
        result.candidate_id.clone()
    }
}

/// Drop blank spread halves as long as something else remains.
fn populated(results: Vec<AnalysisResult>) -> Vec<AnalysisResult> {
    let keep: Vec<bool> = results
        .iter()
        .map(|r| !(r.side.is_some() && r.is_blank()))
        .collect();
    if !keep.iter().any(|k| *k) {
        return results.into_iter().take(1).collect();
    }
    results
        .into_iter()
        .zip(keep)
        .filter_map(|(r, k)| k.then_some(r))
        .collect()
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    preview_max_px: u32,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, preview_max_px: u32) -> Self {
        Self {
            store,
            preview_max_px,
        }
    }

    /// Derive, file and persist in one call.
    pub async fn integrate(
        &self,
        project: &mut Project,
        source_id: &str,
        media: &MediaBlob,
        results: Vec<AnalysisResult>,
    ) -> Result<Vec<String>, PageError> {
        let source = project
            .unprocessed
            .iter()
            .find(|p| p.id == source_id)
            .cloned()
            .ok_or_else(|| PageError::StorageFailed {
                detail: format!("page {source_id} is no longer in the pool"),
            })?;
        let derived = self.derive(&source, media, results).await?;
        self.apply(project, source_id, media, derived)
            .await
            .map_err(|e| PageError::StorageFailed {
                detail: e.to_string(),
            })
    }

    /// Build the concrete pages for `results` without touching the project.
    ///
    /// Text pages are never rotated or split. Image pages are rotated when
    /// the result says so, then split when it names a spread side.
    ///
    /// `Page::rotation` is the turn already applied to the stored media
    /// relative to the bytes `content_hash` was taken from, and results carry
    /// the same frame, so only the difference is applied to `media`. A page
    /// that keeps its image keeps its hash; split halves are new images with
    /// a hash of their own and no pending rotation.
    pub async fn derive(
        &self,
        source: &Page,
        media: &MediaBlob,
        results: Vec<AnalysisResult>,
    ) -> Result<Vec<DerivedPage>, PageError> {
        let mut used = HashSet::new();
        let mut out = Vec::with_capacity(results.len());

        for (index, result) in populated(results).into_iter().enumerate() {
            let text = source.is_text();
            let side = if text { None } else { result.side };
            let rotation = if text { 0 } else { result.rotation % 360 };
            let turn = (rotation + 360 - source.rotation % 360) % 360;

            let mut id = derived_page_id(&source.id, side, index);
            if !used.insert(id.clone()) {
                id = format!("{id}_{index}");
                used.insert(id.clone());
            }

            let mut page = source.clone();
            let mut new_media = None;
            page.rotation = rotation;
            if side.is_some() || turn != 0 {
                let normalized =
                    normalize(media.bytes.clone(), turn, side, self.preview_max_px).await?;
                if side.is_some() {
                    page.content_hash = content_hash(&normalized.bytes);
                    page.rotation = 0;
                }
                page.mime_type = normalized.mime_type.clone();
                page.preview = normalized.preview;
                new_media = Some(MediaBlob::new(normalized.mime_type, normalized.bytes));
            } else if id != source.id {
                new_media = Some(media.clone());
            }

            let target = candidate_key(&result, source);
            let display_name = if result.is_unknown_candidate() {
                source.source_file.clone()
            } else {
                target.clone()
            };

            page.id = id;
            page.candidate_id = Some(target.clone());
            page.page_number = Some(result.page_number);
            page.part = result.part;
            page.transcription = result.full_text;
            page.visual_evidence = result.visual_evidence;
            page.identified_tasks = result.identified_tasks;
            page.status = PageStatus::Completed;
            page.error = None;
            page.force_rescan = false;

            debug!(
                "Derived page {} from {} → candidate {}",
                page.id, source.id, target
            );
            out.push(DerivedPage {
                page,
                media: new_media,
                target,
                display_name,
            });
        }
        Ok(out)
    }

    /// File `derived` pages and remove `source_id` from the pool, then persist.
    ///
    /// Media for derived pages is written first; the project document is
    /// written last so readers never see a page whose media is missing. If
    /// the document write fails, `original` is put back under `source_id`
    /// so a retry starts from the bytes the page was analysed on.
    pub async fn apply(
        &self,
        project: &mut Project,
        source_id: &str,
        original: &MediaBlob,
        derived: Vec<DerivedPage>,
    ) -> Result<Vec<String>, ExamScanError> {
        let mut next = project.clone();
        let pos = next
            .unprocessed
            .iter()
            .position(|p| p.id == source_id)
            .ok_or_else(|| ExamScanError::PageNotFound(source_id.to_string()))?;
        next.unprocessed.remove(pos);

        let mut ids = Vec::with_capacity(derived.len());
        let mut keeps_source_media = false;
        let mut replaced_source_media = false;
        for d in &derived {
            if let Some(ref blob) = d.media {
                self.store.put_media(&d.page.id, blob).await?;
                replaced_source_media |= d.page.id == source_id;
            }
            if d.page.id == source_id {
                keeps_source_media = true;
            }
        }

        for d in derived {
            ids.push(d.page.id.clone());
            file_page(&mut next, d.page, &d.target, &d.display_name);
        }

        next.touch();
        if let Err(e) = self.store.put_project(&next).await {
            if replaced_source_media {
                if let Err(restore) = self.store.put_media(source_id, original).await {
                    error!("Could not restore media of page {}: {}", source_id, restore);
                }
            }
            return Err(e.into());
        }
        *project = next;

        if !keeps_source_media {
            if let Err(e) = self.store.delete_media(source_id).await {
                warn!("Could not delete media of split page {}: {}", source_id, e);
            }
        }
        info!("Page {} reconciled into {} page(s)", source_id, ids.len());
        Ok(ids)
    }

    /// Fold every page of `from` into `into` and delete `from`.
    ///
    /// `into` is created if absent. Returns the number of pages moved.
    pub async fn merge_candidates(
        &self,
        project: &mut Project,
        from: &str,
        into: &str,
    ) -> Result<usize, ExamScanError> {
        if from == into {
            return Err(ExamScanError::SelfMerge(from.to_string()));
        }
        let mut next = project.clone();
        let source = next
            .candidates
            .remove(from)
            .ok_or_else(|| ExamScanError::CandidateNotFound(from.to_string()))?;
        let moved = source.pages.len();

        let target = next
            .candidates
            .entry(into.to_string())
            .or_insert_with(|| Candidate::new(into, into));
        for mut page in source.pages {
            page.candidate_id = Some(into.to_string());
            target.pages.push(page);
        }
        target.sort_pages();
        mark_completed(target);

        next.touch();
        self.store.put_project(&next).await?;
        *project = next;
        info!("Merged candidate {} into {} ({} pages)", from, into, moved);
        Ok(moved)
    }

    /// Move one reconciled page to another candidate, creating it if absent.
    pub async fn reassign_page(
        &self,
        project: &mut Project,
        page_id: &str,
        candidate_id: &str,
    ) -> Result<(), ExamScanError> {
        let candidate_id = candidate_id.trim();
        if candidate_id.is_empty() {
            return Err(ExamScanError::CandidateNotFound(String::new()));
        }
        match project.locate(page_id) {
            Some(PageLocation::Candidate {
                candidate_id: ref owner,
                ..
            }) if owner == candidate_id => return Ok(()),
            Some(PageLocation::Candidate { .. }) => {}
            _ => return Err(ExamScanError::PageNotFound(page_id.to_string())),
        }

        let mut next = project.clone();
        let (from, mut page) = next
            .take_from_candidates(page_id)
            .ok_or_else(|| ExamScanError::PageNotFound(page_id.to_string()))?;
        page.candidate_id = Some(candidate_id.to_string());
        file_page(&mut next, page, candidate_id, candidate_id);

        next.touch();
        self.store.put_project(&next).await?;
        *project = next;
        info!("Page {} reassigned from {} to {}", page_id, from, candidate_id);
        Ok(())
    }

    /// Queue a page for re-analysis that bypasses the result cache.
    ///
    /// A reconciled page moves back into the pool; a pool page is flagged
    /// in place. A page currently being analysed is left alone.
    pub async fn rescan_page(&self, project: &mut Project, page_id: &str) -> Result<(), ExamScanError> {
        let mut next = project.clone();
        match next.locate(page_id) {
            None => return Err(ExamScanError::PageNotFound(page_id.to_string())),
            Some(PageLocation::Pool(i)) => {
                let page = &mut next.unprocessed[i];
                if page.status == PageStatus::Processing {
                    warn!("Page {} is being analysed; rescan ignored", page_id);
                    return Ok(());
                }
                page.force_rescan = true;
                page.status = PageStatus::Pending;
                page.error = None;
            }
            Some(PageLocation::Candidate { .. }) => {
                let (_, mut page) = next
                    .take_from_candidates(page_id)
                    .ok_or_else(|| ExamScanError::PageNotFound(page_id.to_string()))?;
                page.force_rescan = true;
                page.status = PageStatus::Pending;
                page.error = None;
                next.unprocessed.push(page);
            }
        }
        next.touch();
        self.store.put_project(&next).await?;
        *project = next;
        info!("Page {} queued for forced rescan", page_id);
        Ok(())
    }

    /// Move an `error` page back to `pending`. Returns `false` if it was not in error.
    pub async fn retry_page(&self, project: &mut Project, page_id: &str) -> Result<bool, ExamScanError> {
        let mut next = project.clone();
        let page = next
            .pool_page_mut(page_id)
            .ok_or_else(|| ExamScanError::PageNotFound(page_id.to_string()))?;
        if page.status != PageStatus::Error {
            return Ok(false);
        }
        page.status = PageStatus::Pending;
        page.error = None;
        next.touch();
        self.store.put_project(&next).await?;
        *project = next;
        Ok(true)
    }

    /// Move every `error` page back to `pending`. Returns how many were reset.
    pub async fn retry_failed(&self, project: &mut Project) -> Result<usize, ExamScanError> {
        let mut next = project.clone();
        let mut reset = 0;
        for page in next
            .unprocessed
            .iter_mut()
            .filter(|p| p.status == PageStatus::Error)
        {
            page.status = PageStatus::Pending;
            page.error = None;
            reset += 1;
        }
        if reset > 0 {
            next.touch();
            self.store.put_project(&next).await?;
            *project = next;
        }
        Ok(reset)
    }
}

/// Insert `page` into candidate `target`, replacing a page with the same id.
///
/// A page with that id held by any other candidate is removed first, so a
/// page is never in two candidates at once.
fn file_page(project: &mut Project, page: Page, target: &str, display_name: &str) {
    let in_target = project
        .candidates
        .get(target)
        .and_then(|c| c.position(&page.id));

    if in_target.is_none() {
        if let Some((owner, _)) = project.take_from_candidates(&page.id) {
            debug!("Page {} moved out of candidate {}", page.id, owner);
        }
    }

    let candidate = project.candidates.entry(target.to_string()).or_insert_with(|| {
        info!("New candidate {}", target);
        Candidate::new(target, display_name)
    });
    match in_target {
        Some(i) => candidate.pages[i] = page,
        None => candidate.pages.push(page),
    }
    candidate.sort_pages();
    mark_completed(candidate);
}

fn mark_completed(candidate: &mut Candidate) {
    if candidate.status != CandidateStatus::Evaluated {
        candidate.status = CandidateStatus::Completed;
    }
}
