//! System prompts for exam page analysis.
//!
//! Every prompt lives here so the response contract the dispatcher
//! validates against ([`crate::pipeline::dispatch`]) and the instructions
//! the model receives are edited side by side.
//!
//! Callers can override the default via [`crate::config::PipelineConfig::system_prompt`].

use crate::model::RubricCriterion;

/// Default system prompt for analysing one scanned exam page.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You analyse scanned pages of handwritten exam answers.

Return ONLY a JSON array. Each element describes one logical page:

{
  "layoutType": "single" | "spread",
  "sideInSpread": "LEFT" | "RIGHT",      // only when layoutType is "spread"
  "candidateId": "string",               // candidate number written on the page, if any
  "pageNumber": 1,                       // page number written on the page
  "part": "Part 1" | "Part 2",
  "rotation": 0 | 90 | 180 | 270,        // clockwise turn that makes the page upright
  "fullText": "string",                  // complete transcription
  "visualEvidence": "string",            // figures, graphs, tables described in words
  "identifiedTasks": [{"taskNumber": "1", "subTask": "a"}]
}

Rules:
- A spread (two pages side by side on one sheet) yields two elements, one per side.
- Omit a side of a spread that is blank.
- If one image holds answers from two candidates, return one element per candidate.
- Never invent a candidate id; omit the field when none is written.
- Do not wrap the JSON in markdown fences or add commentary."#;

/// Context message listing the valid task labels.
pub fn rubric_context(criteria: &[RubricCriterion]) -> String {
    let mut out = String::from(
        "Only report tasks from this list (taskNumber/subTask); ignore anything else:\n",
    );
    for c in criteria {
        if c.sub_task.is_empty() {
            out.push_str(&format!("- {}", c.task_number));
        } else {
            out.push_str(&format!("- {}/{}", c.task_number, c.sub_task));
        }
        if !c.description.is_empty() {
            out.push_str(&format!(": {}", c.description));
        }
        out.push('\n');
    }
    out
}
