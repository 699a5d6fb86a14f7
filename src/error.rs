//! Error types for the edgequake-examscan library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExamScanError`] is **fatal**: the requested operation cannot proceed at
//!   all (unreadable input file, store failure, provider not configured,
//!   unknown page in an administrative call). Returned as `Err(ExamScanError)`.
//!
//! * [`PageError`] is **non-fatal**: a single page failed (quota exhausted,
//!   malformed service response, unreadable image) but the batch goes on.
//!   The error's [`PageError::label`] is stored on the page itself so every
//!   page always carries a visible cause.
//!
//! [`StoreError`] is the backend-level error of a [`crate::store::Store`];
//! it converts into [`ExamScanError::Store`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-examscan library.
#[derive(Debug, Error)]
pub enum ExamScanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file extension is not one the rasteriser understands.
    #[error("Unsupported input format for '{path}' (expected pdf, png, jpg, txt or md)")]
    UnsupportedFormat { path: PathBuf },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none (or the wrong one) was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Project errors ────────────────────────────────────────────────────
    /// No page with this id exists in the pool or in any candidate.
    #[error("Page '{0}' not found")]
    PageNotFound(String),

    /// No candidate with this id exists.
    #[error("Candidate '{0}' not found")]
    CandidateNotFound(String),

    /// A candidate cannot be merged into itself.
    #[error("Refusing to merge candidate '{0}' into itself")]
    SelfMerge(String),

    // ── Store errors ──────────────────────────────────────────────────────
    /// The persistent store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Caught at the per-page boundary inside the scheduler; never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The inference service reported a rate-limit or quota exhaustion.
    #[error("Quota exhausted: {detail}")]
    QuotaExhausted { detail: String },

    /// Network failure or generic 5xx; resubmitting the page may succeed.
    #[error("Analysis service unavailable after {retries} retries: {detail}")]
    Transient { retries: u32, detail: String },

    /// The service answered, but not with the expected shape.
    #[error("Malformed analysis response: {detail}")]
    MalformedResponse { detail: String },

    /// The service rejected our credentials (401/403).
    #[error("Authentication failed: {detail}")]
    AuthFailed { detail: String },

    /// The store could not produce the media blob for this page.
    #[error("No media stored for page '{page_id}'")]
    MissingMedia { page_id: String },

    /// Rotating / splitting the page image failed.
    #[error("Layout normalisation failed: {detail}")]
    NormalizationFailed { detail: String },

    /// The reconciled result could not be persisted.
    #[error("Could not persist page: {detail}")]
    StorageFailed { detail: String },
}

impl PageError {
    /// Short human-readable cause stored on the failed page.
    pub fn label(&self) -> &'static str {
        match self {
            PageError::QuotaExhausted { .. } => "quota exhausted",
            PageError::Transient { .. } => "service unavailable",
            PageError::MalformedResponse { .. } => "malformed response",
            PageError::AuthFailed { .. } => "authentication failed",
            PageError::MissingMedia { .. } => "missing media",
            PageError::NormalizationFailed { .. } => "unreadable image",
            PageError::StorageFailed { .. } => "storage failure",
        }
    }

    /// Whether resubmitting the page unchanged has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PageError::Transient { .. } | PageError::QuotaExhausted { .. } | PageError::StorageFailed { .. }
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, PageError::QuotaExhausted { .. })
    }
}

/// Errors emitted by persistent store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record '{key}': {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),
}
