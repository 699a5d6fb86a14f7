//! Pure normalisation rules applied to every analysis result.
//!
//! VLMs return candidate ids and task labels with OCR noise: `"Kand. 007"`,
//! `"3b)"`, `"Total"`, `"page 2"`. These functions turn that into canonical
//! values or reject it. None of them touch I/O, so each rule is tested here
//! in isolation.

use crate::model::{Rubric, TaskRef, UNKNOWN_CANDIDATE};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Words that mark a label as page furniture rather than a task id.
const FORBIDDEN_TOKENS: &[&str] = &["TOTAL", "PAGE", "NONE", "NULL", "SUM", "POINTS", "N/A"];

/// Short alphanumeric token: `12`, `3B`, `A`, `IV`.
static RE_SHORT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}[A-Z]?|[A-Z]{1,2})\b").unwrap());

/// Reduce a raw candidate identifier to its digits.
///
/// `"007"` stays `"007"`, `"Cand. 12-b"` becomes `"12"`, and anything
/// without a digit (`"N/A"`, `""`, `None`) becomes [`UNKNOWN_CANDIDATE`].
pub fn normalize_candidate_id(raw: Option<&str>) -> String {
    let digits: String = raw
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        UNKNOWN_CANDIDATE.to_string()
    } else {
        digits
    }
}

fn contains_forbidden(label: &str) -> bool {
    FORBIDDEN_TOKENS.iter().any(|t| label.contains(t))
}

/// Canonicalise one task or subtask label.
///
/// Trims, upper-cases and strips trailing punctuation. Labels longer than
/// `max_len` or containing a forbidden token get one chance: the first short
/// alphanumeric token inside them. Otherwise the label is discarded.
pub fn sanitize_label(raw: &str, max_len: usize) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    let cleaned = upper
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .trim_start_matches(['(', '[', '#']);

    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().count() <= max_len && !contains_forbidden(cleaned) {
        return Some(cleaned.to_string());
    }

    RE_SHORT_TOKEN
        .find_iter(cleaned)
        .map(|m| m.as_str())
        .find(|tok| tok.len() <= max_len && !contains_forbidden(tok))
        .map(str::to_string)
}

/// Sanitise a list of `(task, subtask)` labels, dropping tasks whose number
/// is unusable and collapsing duplicates while keeping first-seen order.
pub fn sanitize_tasks<'a, I>(raw: I, max_len: usize) -> Vec<TaskRef>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out: Vec<TaskRef> = Vec::new();
    for (task, sub) in raw {
        let Some(task_number) = sanitize_label(task, max_len) else {
            continue;
        };
        let sub_task = sanitize_label(sub, max_len).unwrap_or_default();
        let t = TaskRef {
            task_number,
            sub_task,
        };
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Task whitelist derived from a rubric, keyed by sanitised labels and
/// mapping back to the rubric's own spelling.
#[derive(Debug, Clone, Default)]
pub struct TaskWhitelist {
    allowed: HashMap<(String, String), TaskRef>,
}

impl TaskWhitelist {
    pub fn from_rubric(rubric: &Rubric, max_len: usize) -> Self {
        let allowed = rubric
            .criteria
            .iter()
            .filter_map(|c| {
                let task = sanitize_label(&c.task_number, max_len)?;
                let sub = sanitize_label(&c.sub_task, max_len).unwrap_or_default();
                Some(((task, sub), TaskRef::new(c.task_number.trim(), c.sub_task.trim())))
            })
            .collect();
        Self { allowed }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Keep only whitelisted tasks, rewritten to the rubric's labels.
    /// Tasks outside the whitelist are discarded silently.
    pub fn filter(&self, tasks: &[TaskRef]) -> Vec<TaskRef> {
        let mut out: Vec<TaskRef> = Vec::new();
        for t in tasks {
            let key = (t.task_number.clone(), t.sub_task.clone());
            if let Some(canonical) = self.allowed.get(&key) {
                if !out.contains(canonical) {
                    out.push(canonical.clone());
                }
            }
        }
        out
    }
}
