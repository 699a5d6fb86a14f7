//! PDF rasterisation: render every page of a PDF to PNG bytes via pdfium.
//!
//! pdfium keeps thread-local state and is not async-safe, so all work runs
//! inside `spawn_blocking`. `max_rendered_pixels` caps the longest edge
//! regardless of the physical page size: an A3 spread scanned at 600 DPI
//! would otherwise produce a 10 000 px wide bitmap.

use crate::error::ExamScanError;
use crate::pipeline::encode::encode_png;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Rasterise all pages of the PDF at `pdf_path`, in document order.
pub async fn render_pdf(
    pdf_path: &Path,
    max_pixels: u32,
    password: Option<&str>,
) -> Result<Vec<Vec<u8>>, ExamScanError> {
    let path = pdf_path.to_path_buf();
    let password = password.map(str::to_string);

    tokio::task::spawn_blocking(move || render_pdf_blocking(&path, max_pixels, password.as_deref()))
        .await
        .map_err(|e| ExamScanError::Internal(format!("Render task panicked: {}", e)))?
}

/// Bind pdfium from `PDFIUM_LIB_PATH` if set, else from the system library path.
fn bind_pdfium() -> Result<Pdfium, ExamScanError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(dir) if !dir.is_empty() => {
            let dir = PathBuf::from(dir);
            let lib = if dir.is_file() {
                dir
            } else {
                Pdfium::pdfium_platform_library_name_at_path(&dir)
            };
            Pdfium::bind_to_library(lib)
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| ExamScanError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn render_pdf_blocking(
    pdf_path: &Path,
    max_pixels: u32,
    password: Option<&str>,
) -> Result<Vec<Vec<u8>>, ExamScanError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            ExamScanError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        } else {
            ExamScanError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let pages = document.pages();
    info!("PDF {} loaded: {} pages", pdf_path.display(), pages.len());

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut out = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExamScanError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        let png = encode_png(&image).map_err(|e| ExamScanError::RasterisationFailed {
            page: idx + 1,
            detail: format!("PNG encoding failed: {}", e),
        })?;
        out.push(png);
    }

    Ok(out)
}
