//! Pipeline stages for exam page reconciliation.
//!
//! Each submodule implements exactly one step. The scheduler
//! ([`crate::scheduler`]) strings them together; the reconciler
//! ([`crate::reconcile`]) applies the outcome to the project.
//!
//! ## Data Flow
//!
//! ```text
//! ingest ──▶ dispatch ──────────────▶ layout ──▶ reconcile
//! (files)    (cache | inference)      (rotate/split)
//!              │
//!              └─ sanitize (labels, candidate ids, whitelist)
//! ```
//!
//! 1. [`ingest`]   rasterise input files into raw pages and fingerprint them
//! 2. [`render`]   pdfium rasterisation; runs in `spawn_blocking`
//! 3. [`dispatch`] cache lookup, service call, strict response validation
//! 4. [`inference`] the service contract and its VLM implementation with retry/backoff
//! 5. [`sanitize`] task-label cleanup and rubric whitelisting
//! 6. [`layout`]   rotation correction and spread splitting
//! 7. [`encode`]   PNG / preview / image-payload helpers shared by the above

pub mod dispatch;
pub mod encode;
pub mod inference;
pub mod ingest;
pub mod layout;
pub mod render;
pub mod sanitize;
