//! Ingestion: turn input files into raw pages, and raw pages into pending [`Page`]s.
//!
//! One file may yield many pages (a multi-page PDF), exactly one (a photo),
//! or a single text block (an exported document). Nothing downstream
//! assumes a 1:1 file-to-page mapping.

use crate::error::ExamScanError;
use crate::hash::{content_hash, text_hash};
use crate::model::Page;
use crate::pipeline::encode::PNG_MIME;
use crate::pipeline::layout::preview_for;
use crate::pipeline::render::render_pdf;
use crate::config::PipelineConfig;
use crate::store::MediaBlob;
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// One page produced by a [`Rasterizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPage {
    Image { mime_type: String, bytes: Vec<u8> },
    Text(String),
}

impl RawPage {
    pub fn image(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        RawPage::Image {
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Converts an input file into raw pages.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn convert(&self, path: &Path) -> Result<Vec<RawPage>, ExamScanError>;
}

/// Input kinds recognised by [`FileRasterizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Png,
    Jpeg,
    Text,
}

impl InputKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(InputKind::Pdf),
            "png" => Some(InputKind::Png),
            "jpg" | "jpeg" => Some(InputKind::Jpeg),
            "txt" | "md" => Some(InputKind::Text),
            _ => None,
        }
    }
}

/// Local-file rasteriser: PDFs through pdfium, images passed through, text read whole.
#[derive(Debug, Clone)]
pub struct FileRasterizer {
    pub max_rendered_pixels: u32,
    pub pdf_password: Option<String>,
}

impl FileRasterizer {
    pub fn new(max_rendered_pixels: u32, pdf_password: Option<String>) -> Self {
        Self {
            max_rendered_pixels,
            pdf_password,
        }
    }

    /// Rasteriser using the raster cap and PDF password from `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_rendered_pixels, config.pdf_password.clone())
    }
}

#[async_trait]
impl Rasterizer for FileRasterizer {
    async fn convert(&self, path: &Path) -> Result<Vec<RawPage>, ExamScanError> {
        let kind = resolve_local(path)?;
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path)
                    .await
                    .map_err(|_| ExamScanError::FileNotFound { path })
            }
        };

        let pages = match kind {
            InputKind::Pdf => render_pdf(path, self.max_rendered_pixels, self.pdf_password.as_deref())
                .await?
                .into_iter()
                .map(|png| RawPage::image(PNG_MIME, png))
                .collect(),
            InputKind::Png => vec![RawPage::image(PNG_MIME, read(path).await?)],
            InputKind::Jpeg => vec![RawPage::image("image/jpeg", read(path).await?)],
            InputKind::Text => {
                let bytes = read(path).await?;
                vec![RawPage::Text(String::from_utf8_lossy(&bytes).into_owned())]
            }
        };
        debug!("{} → {} raw page(s)", path.display(), pages.len());
        Ok(pages)
    }
}

/// Validate that `path` exists, is readable and has a supported format.
fn resolve_local(path: &Path) -> Result<InputKind, ExamScanError> {
    let path_buf = PathBuf::from(path);
    if !path.exists() {
        return Err(ExamScanError::FileNotFound { path: path_buf });
    }
    let kind = InputKind::from_path(path).ok_or_else(|| ExamScanError::UnsupportedFormat {
        path: path_buf.clone(),
    })?;

    match std::fs::File::open(path) {
        Ok(mut f) => {
            if kind == InputKind::Pdf {
                let mut magic = [0u8; 4];
                if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                    return Err(ExamScanError::CorruptPdf {
                        path: path_buf,
                        detail: format!("bad magic bytes {magic:?}"),
                    });
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExamScanError::PermissionDenied { path: path_buf });
        }
        Err(_) => return Err(ExamScanError::FileNotFound { path: path_buf }),
    }
    Ok(kind)
}

/// Build the pending page record and its media blob for one raw page.
///
/// The fingerprint is taken here, once, and never recomputed. The preview
/// decodes the whole image, so it is built on the blocking pool.
pub async fn prepare_page(
    raw: RawPage,
    source_file: &str,
    preview_max_px: u32,
) -> Result<(Page, MediaBlob), ExamScanError> {
    let id = Uuid::new_v4().simple().to_string();
    match raw {
        RawPage::Image { mime_type, bytes } => {
            let mut page = Page::new(id, content_hash(&bytes), mime_type.clone(), source_file);
            let (bytes, preview) = tokio::task::spawn_blocking(move || {
                let preview = preview_for(&bytes, preview_max_px);
                (bytes, preview)
            })
            .await
            .map_err(|e| ExamScanError::Internal(format!("Preview task panicked: {}", e)))?;
            page.preview = preview;
            Ok((page, MediaBlob::new(mime_type, bytes)))
        }
        RawPage::Text(text) => {
            let hash = text_hash(&text);
            let blob = MediaBlob::text(text);
            let page = Page::new(id, hash, blob.mime_type.clone(), source_file);
            Ok((page, blob))
        }
    }
}
