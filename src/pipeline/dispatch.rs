//! Analysis dispatch: cache lookup, service call, and response validation.
//!
//! The service response is validated against an explicit schema here. Any
//! deviation (non-JSON, missing required field, wrong type, rotation not a
//! multiple of 90, an empty list) is a [`PageError::MalformedResponse`];
//! no field is ever extracted best-effort. Only results that passed
//! validation and label sanitisation reach the cache.
//!
//! Whitelist filtering runs *after* the cache, on every lookup, so a cached
//! result is always re-filtered against the rubric active at the time.

use crate::cache::ResultCache;
use crate::error::PageError;
use crate::model::{AnalysisResult, LayoutType, Page, Part, Rubric, SpreadSide};
use crate::pipeline::inference::{AnalysisRequest, InferenceService, PagePayload};
use crate::pipeline::sanitize::{normalize_candidate_id, sanitize_tasks, TaskWhitelist};
use crate::store::MediaBlob;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

static RE_JSON_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?[ \t]*\n(.*)\n```\s*$").unwrap());

/// Scalars the service may send either quoted or bare (`"7"` or `7`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Text(String),
    Int(i64),
}

impl RawScalar {
    fn into_string(self) -> String {
        match self {
            RawScalar::Text(s) => s,
            RawScalar::Int(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    task_number: RawScalar,
    #[serde(default)]
    sub_task: Option<RawScalar>,
}

/// Wire shape of one element of the service response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    layout_type: LayoutType,
    full_text: String,
    identified_tasks: Vec<RawTask>,
    rotation: i64,
    page_number: i64,
    #[serde(default)]
    side_in_spread: Option<SpreadSide>,
    #[serde(default)]
    candidate_id: Option<RawScalar>,
    #[serde(default)]
    part: Option<String>,
    #[serde(default)]
    visual_evidence: Option<String>,
}

fn malformed(detail: impl Into<String>) -> PageError {
    PageError::MalformedResponse {
        detail: detail.into(),
    }
}

/// Parse and validate a raw service response.
pub fn parse_response(body: &str, max_label_len: usize) -> Result<Vec<AnalysisResult>, PageError> {
    let trimmed = body.trim();
    let json = match RE_JSON_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str()),
        None => trimmed,
    };

    let raw: Vec<RawAnalysis> =
        serde_json::from_str(json).map_err(|e| malformed(format!("schema violation: {e}")))?;
    if raw.is_empty() {
        return Err(malformed("response contains no pages"));
    }

    raw.into_iter()
        .enumerate()
        .map(|(i, r)| validate(r, max_label_len).map_err(|e| malformed(format!("element {i}: {e}"))))
        .collect()
}

fn validate(raw: RawAnalysis, max_label_len: usize) -> Result<AnalysisResult, String> {
    if raw.rotation % 90 != 0 {
        return Err(format!("rotation {} is not a multiple of 90", raw.rotation));
    }
    let page_number = u32::try_from(raw.page_number)
        .map_err(|_| format!("pageNumber {} out of range", raw.page_number))?;

    let tasks: Vec<(String, String)> = raw
        .identified_tasks
        .into_iter()
        .map(|t| {
            (
                t.task_number.into_string(),
                t.sub_task.map(RawScalar::into_string).unwrap_or_default(),
            )
        })
        .collect();
    let identified_tasks = sanitize_tasks(
        tasks.iter().map(|(a, b)| (a.as_str(), b.as_str())),
        max_label_len,
    );

    let raw_id = raw.candidate_id.map(RawScalar::into_string);
    let side = match raw.layout_type {
        LayoutType::Spread => raw.side_in_spread,
        LayoutType::Single => None,
    };

    Ok(AnalysisResult {
        candidate_id: normalize_candidate_id(raw_id.as_deref()),
        page_number,
        part: raw.part.as_deref().map(Part::from_label).unwrap_or_default(),
        full_text: raw.full_text,
        visual_evidence: raw.visual_evidence.filter(|v| !v.trim().is_empty()),
        identified_tasks,
        rotation: raw.rotation.rem_euclid(360) as u16,
        layout: raw.layout_type,
        side,
    })
}

/// Outcome of analysing one page.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub results: Vec<AnalysisResult>,
    pub from_cache: bool,
}

/// Sends pages to the inference service, consulting the cache first.
#[derive(Clone)]
pub struct Dispatcher {
    inference: Arc<dyn InferenceService>,
    cache: ResultCache,
    max_label_len: usize,
}

impl Dispatcher {
    pub fn new(inference: Arc<dyn InferenceService>, cache: ResultCache, max_label_len: usize) -> Self {
        Self {
            inference,
            cache,
            max_label_len,
        }
    }

    /// Analyse `page` whose raw bytes are `media`.
    ///
    /// With `page.force_rescan` set the cache is not read, and is
    /// overwritten when the call succeeds.
    pub async fn analyze(
        &self,
        page: &Page,
        media: &MediaBlob,
        rubric: Option<&Rubric>,
    ) -> Result<Dispatched, PageError> {
        if !page.force_rescan {
            if let Some(results) = self.cache.get(&page.content_hash).await {
                info!("Page {}: served from cache", page.id);
                return Ok(Dispatched {
                    results: self.apply_rubric(results, rubric),
                    from_cache: true,
                });
            }
        }

        let request = AnalysisRequest {
            page_id: page.id.clone(),
            payload: payload_for(media),
            rubric: rubric.map(|r| r.criteria.clone()),
            force_rescan: page.force_rescan,
        };
        let body = self.inference.analyze(&request).await?;
        let mut results = parse_response(&body, self.max_label_len)?;
        // The service saw media already turned by `page.rotation`; cache in
        // the frame of the hashed bytes.
        if page.rotation != 0 {
            for r in &mut results {
                r.rotation = (r.rotation + page.rotation) % 360;
            }
        }
        debug!("Page {}: {} result(s) from service", page.id, results.len());

        if let Err(e) = self.cache.put(&page.content_hash, &results).await {
            warn!("Page {}: could not cache results: {}", page.id, e);
        }

        Ok(Dispatched {
            results: self.apply_rubric(results, rubric),
            from_cache: false,
        })
    }

    fn apply_rubric(&self, mut results: Vec<AnalysisResult>, rubric: Option<&Rubric>) -> Vec<AnalysisResult> {
        if let Some(rubric) = rubric {
            let whitelist = TaskWhitelist::from_rubric(rubric, self.max_label_len);
            for r in &mut results {
                r.identified_tasks = whitelist.filter(&r.identified_tasks);
            }
        }
        results
    }
}

fn payload_for(media: &MediaBlob) -> PagePayload {
    if media.mime_type.starts_with("text/") {
        PagePayload::Text(String::from_utf8_lossy(&media.bytes).into_owned())
    } else {
        PagePayload::Image {
            mime_type: media.mime_type.clone(),
            bytes: media.bytes.clone(),
        }
    }
}
