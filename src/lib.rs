//! # edgequake-examscan
//!
//! Turn piles of scanned exam answer sheets into per-candidate records
//! using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Scans arrive in no particular order: rotated, two pages to a sheet,
//! several candidates per PDF, duplicates from re-scanning. This crate asks
//! a VLM what each image shows (candidate number, page number, part,
//! transcription, tasks answered), corrects rotation, splits spreads and
//! files every page under the right candidate, in reading order.
//!
//! ## Pipeline Overview
//!
//! ```text
//! files
//!  │
//!  ├─ 1. Ingest     rasterise PDFs, pass images/text through, fingerprint bytes
//!  ├─ 2. Schedule   one page at a time, cooperative stop, resumable
//!  ├─ 3. Cache      content hash → earlier validated results
//!  ├─ 4. Dispatch   VLM call with retry/backoff, strict response validation
//!  ├─ 5. Normalise  rotate upright, split spreads into halves
//!  └─ 6. Reconcile  file pages under candidates, sorted by part and page
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_examscan::{
//!     FileRasterizer, FsStore, Pipeline, PipelineConfig, RubricCriterion, VisionInference,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let inference = Arc::new(VisionInference::from_config(&config)?);
//!     let store = Arc::new(FsStore::open(".examscan").await?);
//!     let pipeline = Pipeline::open("spring-exam", store, inference, config.clone()).await?;
//!
//!     let raster = FileRasterizer::from_config(&config);
//!     pipeline.ingest_file(Path::new("scans.pdf"), &raster).await?;
//!     pipeline
//!         .set_rubric(vec![RubricCriterion {
//!             task_number: "1".into(),
//!             sub_task: "a".into(),
//!             description: String::new(),
//!         }])
//!         .await?;
//!     println!("{:?}", pipeline.run_batch().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `examscan` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-examscan = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod reconcile;
pub mod scheduler;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ExamScanError, PageError, StoreError};
pub use model::{
    AnalysisResult, Candidate, CandidateStatus, LayoutType, Page, PageStatus, Part, Project, Rubric,
    RubricCriterion, SpreadSide, TaskRef, UNKNOWN_CANDIDATE,
};
pub use pipeline::inference::{AnalysisRequest, InferenceService, PagePayload, VisionInference};
pub use pipeline::ingest::{FileRasterizer, RawPage, Rasterizer};
pub use progress::{BatchProgressCallback, BatchState, BatchStatus, NoopProgressCallback, ProgressCallback};
pub use scheduler::{Pipeline, RunOutcome};
pub use store::{FsStore, MediaBlob, MemoryStore, Store};
