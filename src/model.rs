//! Core records: pages, candidates, analysis results and the project aggregate.
//!
//! A [`Project`] owns every [`Page`]: a page lives either in the
//! `unprocessed` pool (pending, processing or error) or in exactly one
//! [`Candidate`]'s page list. Only the reconciler and the scheduler mutate
//! these collections; everything else reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Candidate id assigned when no identifier could be extracted from a page.
pub const UNKNOWN_CANDIDATE: &str = "unknown";

/// Processing state of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Error,
}

/// Processing state of a candidate. `Evaluated` is only ever set by grading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Evaluated,
}

/// Coarse section of an exam. Ordering is the rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Part {
    #[default]
    #[serde(rename = "Part 1")]
    One,
    #[serde(rename = "Part 2")]
    Two,
}

impl Part {
    /// Interpret a free-form part label ("Part 2", "del 2", "II", "2").
    /// Anything not recognisably the second part is part one.
    pub fn from_label(raw: &str) -> Part {
        let s = raw.trim().to_ascii_uppercase();
        let last = s.split_whitespace().last().unwrap_or("");
        if last == "2" || last == "II" || last == "B" {
            Part::Two
        } else {
            Part::One
        }
    }
}

/// Page layout as reported by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    #[default]
    #[serde(alias = "SINGLE")]
    Single,
    #[serde(alias = "SPREAD")]
    Spread,
}

/// Which half of a spread a result describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpreadSide {
    #[serde(alias = "left")]
    Left,
    #[serde(alias = "right")]
    Right,
}

impl SpreadSide {
    /// Suffix appended to the parent page id when this half is split off.
    pub fn suffix(self) -> &'static str {
        match self {
            SpreadSide::Left => "L",
            SpreadSide::Right => "R",
        }
    }
}

/// One identified task, e.g. task `"3"` subtask `"b"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_number: String,
    #[serde(default)]
    pub sub_task: String,
}

impl TaskRef {
    pub fn new(task_number: impl Into<String>, sub_task: impl Into<String>) -> Self {
        Self {
            task_number: task_number.into(),
            sub_task: sub_task.into(),
        }
    }
}

/// One criterion of the grading rubric. Only the labels matter here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricCriterion {
    pub task_number: String,
    #[serde(default)]
    pub sub_task: String,
    #[serde(default)]
    pub description: String,
}

/// The active rubric; its criteria form the task whitelist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: Vec<RubricCriterion>,
}

impl Rubric {
    pub fn new(criteria: Vec<RubricCriterion>) -> Self {
        Self { criteria }
    }
}

/// A validated, normalised interpretation of (part of) one page.
///
/// Produced by [`crate::pipeline::dispatch`]; this is also the shape stored
/// in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Digits-only candidate id, or [`UNKNOWN_CANDIDATE`].
    pub candidate_id: String,
    pub page_number: u32,
    pub part: Part,
    pub full_text: String,
    pub visual_evidence: Option<String>,
    pub identified_tasks: Vec<TaskRef>,
    /// Clockwise correction in degrees: 0, 90, 180 or 270.
    pub rotation: u16,
    pub layout: LayoutType,
    pub side: Option<SpreadSide>,
}

impl AnalysisResult {
    pub fn is_unknown_candidate(&self) -> bool {
        self.candidate_id == UNKNOWN_CANDIDATE
    }

    /// A result with no text, no visual evidence and no tasks.
    pub fn is_blank(&self) -> bool {
        self.full_text.trim().is_empty()
            && self
                .visual_evidence
                .as_deref()
                .is_none_or(|v| v.trim().is_empty())
            && self.identified_tasks.is_empty()
    }
}

/// One physical or logical sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    /// Fingerprint taken at ingestion; never recomputed.
    pub content_hash: String,
    pub mime_type: String,
    /// Name of the file this page was ingested from.
    pub source_file: String,
    /// Small inline thumbnail (`data:` URI); the full blob lives in the media store.
    pub preview: Option<String>,
    pub candidate_id: Option<String>,
    pub page_number: Option<u32>,
    pub part: Part,
    pub transcription: String,
    pub visual_evidence: Option<String>,
    pub identified_tasks: Vec<TaskRef>,
    pub rotation: u16,
    pub status: PageStatus,
    /// Short cause when `status == Error`.
    pub error: Option<String>,
    /// Next dispatch must bypass the result cache.
    #[serde(default)]
    pub force_rescan: bool,
    pub created_at: DateTime<Utc>,
}

impl Page {
    pub fn new(
        id: impl Into<String>,
        content_hash: impl Into<String>,
        mime_type: impl Into<String>,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content_hash: content_hash.into(),
            mime_type: mime_type.into(),
            source_file: source_file.into(),
            preview: None,
            candidate_id: None,
            page_number: None,
            part: Part::One,
            transcription: String::new(),
            visual_evidence: None,
            identified_tasks: Vec::new(),
            rotation: 0,
            status: PageStatus::Pending,
            error: None,
            force_rescan: false,
            created_at: Utc::now(),
        }
    }

    /// Rendering order within a candidate: part, then page number.
    /// Pages without a number sort last within their part.
    pub fn sort_key(&self) -> (Part, u32) {
        (self.part, self.page_number.unwrap_or(u32::MAX))
    }

    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
    }
}

/// A student's submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Storage key: normalised candidate id, or a per-source key for unknowns.
    pub id: String,
    pub name: String,
    pub pages: Vec<Page>,
    pub status: CandidateStatus,
}

impl Candidate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pages: Vec::new(),
            status: CandidateStatus::Pending,
        }
    }

    pub fn sort_pages(&mut self) {
        self.pages.sort_by_key(Page::sort_key);
    }

    pub fn position(&self, page_id: &str) -> Option<usize> {
        self.pages.iter().position(|p| p.id == page_id)
    }
}

/// Where a page currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLocation {
    Pool(usize),
    Candidate { candidate_id: String, index: usize },
}

/// The full per-project document persisted in the `projects` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub rubric: Option<Rubric>,
    pub candidates: BTreeMap<String, Candidate>,
    /// Pages not yet reconciled, in queue order.
    pub unprocessed: Vec<Page>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rubric: None,
            candidates: BTreeMap::new(),
            unprocessed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn pending_count(&self) -> usize {
        self.unprocessed
            .iter()
            .filter(|p| p.status == PageStatus::Pending)
            .count()
    }

    /// Index of the first pending page in queue order.
    pub fn next_pending(&self) -> Option<usize> {
        self.unprocessed
            .iter()
            .position(|p| p.status == PageStatus::Pending)
    }

    pub fn locate(&self, page_id: &str) -> Option<PageLocation> {
        if let Some(i) = self.unprocessed.iter().position(|p| p.id == page_id) {
            return Some(PageLocation::Pool(i));
        }
        self.candidates.values().find_map(|c| {
            c.position(page_id).map(|index| PageLocation::Candidate {
                candidate_id: c.id.clone(),
                index,
            })
        })
    }

    pub fn pool_page_mut(&mut self, page_id: &str) -> Option<&mut Page> {
        self.unprocessed.iter_mut().find(|p| p.id == page_id)
    }

    /// Remove a page from whichever candidate holds it, deleting the
    /// candidate if it is left empty.
    pub fn take_from_candidates(&mut self, page_id: &str) -> Option<(String, Page)> {
        let owner = self
            .candidates
            .values()
            .find(|c| c.position(page_id).is_some())
            .map(|c| c.id.clone())?;
        let candidate = self.candidates.get_mut(&owner)?;
        let index = candidate.position(page_id)?;
        let page = candidate.pages.remove(index);
        if candidate.pages.is_empty() {
            self.candidates.remove(&owner);
        }
        Some((owner, page))
    }

    /// Reset pages stranded in `processing` by an interrupted run.
    /// Returns how many pages were recovered.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for page in self
            .unprocessed
            .iter_mut()
            .filter(|p| p.status == PageStatus::Processing)
        {
            page.status = PageStatus::Pending;
            recovered += 1;
        }
        recovered
    }

    /// Total number of pages accounted for in the pool and all candidates.
    pub fn page_count(&self) -> usize {
        self.unprocessed.len() + self.candidates.values().map(|c| c.pages.len()).sum::<usize>()
    }
}
