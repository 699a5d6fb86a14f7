//! Layout normalisation: rotation correction and spread splitting.
//!
//! The analysis service tells us how a page sits (rotation, single vs.
//! spread, which half a result describes); this module only carries that
//! out. It never infers layout from the pixels itself.
//!
//! Order matters: the image is rotated upright *first*, then split down the
//! vertical centre line, so "left" always means the reader's left.
//!
//! Decoding and re-encoding are CPU-bound and run on the blocking pool, the
//! same way PDF rasterisation does.

use crate::error::PageError;
use crate::model::SpreadSide;
use crate::pipeline::encode::{decode_image, encode_png, preview_data_uri, PNG_MIME};
use image::DynamicImage;
use tracing::{debug, warn};

/// A corrected image ready to become an independent page.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub preview: Option<String>,
}

/// Id of a page derived from `parent_id`.
///
/// Split halves get a side suffix (`<parent>_L`, `<parent>_R`); additional
/// unsplit results from the same image get an index suffix. The first
/// unsplit result keeps the parent id, so rotation does not change identity.
pub fn derived_page_id(parent_id: &str, side: Option<SpreadSide>, index: usize) -> String {
    match side {
        Some(s) => format!("{parent_id}_{}", s.suffix()),
        None if index == 0 => parent_id.to_string(),
        None => format!("{parent_id}_{index}"),
    }
}

/// Rotate `bytes` clockwise by `rotation` degrees, then optionally keep one half.
pub async fn normalize(
    bytes: Vec<u8>,
    rotation: u16,
    side: Option<SpreadSide>,
    preview_max_px: u32,
) -> Result<NormalizedImage, PageError> {
    tokio::task::spawn_blocking(move || normalize_blocking(&bytes, rotation, side, preview_max_px))
        .await
        .map_err(|e| PageError::NormalizationFailed {
            detail: format!("normalisation task panicked: {e}"),
        })?
}

/// Blocking implementation of [`normalize`].
pub fn normalize_blocking(
    bytes: &[u8],
    rotation: u16,
    side: Option<SpreadSide>,
    preview_max_px: u32,
) -> Result<NormalizedImage, PageError> {
    let img = decode_image(bytes).map_err(|e| PageError::NormalizationFailed {
        detail: e.to_string(),
    })?;

    let upright = rotate(img, rotation)?;
    let page = match side {
        Some(s) => split_half(&upright, s)?,
        None => upright,
    };
    debug!(
        "Normalised page: rotation={} side={:?} → {}x{}",
        rotation,
        side,
        page.width(),
        page.height()
    );

    let bytes = encode_png(&page).map_err(|e| PageError::NormalizationFailed {
        detail: e.to_string(),
    })?;
    let preview = preview_data_uri(&page, preview_max_px)
        .map_err(|e| warn!("Preview generation failed: {}", e))
        .ok();

    Ok(NormalizedImage {
        bytes,
        mime_type: PNG_MIME.to_string(),
        preview,
    })
}

fn rotate(img: DynamicImage, rotation: u16) -> Result<DynamicImage, PageError> {
    match rotation % 360 {
        0 => Ok(img),
        90 => Ok(img.rotate90()),
        180 => Ok(img.rotate180()),
        270 => Ok(img.rotate270()),
        other => Err(PageError::NormalizationFailed {
            detail: format!("rotation {other}° is not a multiple of 90"),
        }),
    }
}

fn split_half(img: &DynamicImage, side: SpreadSide) -> Result<DynamicImage, PageError> {
    let (w, h) = (img.width(), img.height());
    if w < 2 || h == 0 {
        return Err(PageError::NormalizationFailed {
            detail: format!("{w}x{h} image is too small to split"),
        });
    }
    let half = w / 2;
    Ok(match side {
        SpreadSide::Left => img.crop_imm(0, 0, half, h),
        SpreadSide::Right => img.crop_imm(half, 0, w - half, h),
    })
}

/// Best-effort preview for freshly ingested image bytes.
pub fn preview_for(bytes: &[u8], max_px: u32) -> Option<String> {
    decode_image(bytes)
        .and_then(|img| preview_data_uri(&img, max_px))
        .map_err(|e| warn!("Could not build preview: {}", e))
        .ok()
}
