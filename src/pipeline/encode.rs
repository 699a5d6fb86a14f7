//! Image encoding helpers: bytes ⇄ `DynamicImage`, previews, and VLM payloads.
//!
//! Full-resolution page blobs are stored as PNG (lossless, so handwriting
//! strokes survive repeated rotate/split passes). Inline previews are small
//! JPEG thumbnails wrapped in a `data:` URI so a project document stays
//! light enough to render a page grid without touching the media store.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

pub const PNG_MIME: &str = "image/png";

/// Decode any supported image format.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Encode a page image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Build a JPEG thumbnail whose longest edge is at most `max_px`, as a `data:` URI.
pub fn preview_data_uri(img: &DynamicImage, max_px: u32) -> Result<String, image::ImageError> {
    let thumb = img.thumbnail(max_px, max_px);
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(thumb.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    debug!(
        "Preview {}x{} → {} bytes",
        rgb.width(),
        rgb.height(),
        buf.len()
    );
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&buf)))
}

/// Wrap raw image bytes for a multimodal request.
///
/// `detail: "high"` keeps fine handwriting legible to GPT-4-class models,
/// which otherwise downsample to a single 512 px tile.
pub fn image_payload(bytes: &[u8], mime_type: &str) -> ImageData {
    ImageData::new(STANDARD.encode(bytes), mime_type).with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn png_roundtrip_keeps_dimensions() {
        let bytes = encode_png(&red(12, 7)).expect("encode");
        let back = decode_image(&bytes).expect("decode");
        assert_eq!((back.width(), back.height()), (12, 7));
    }

    #[test]
    fn preview_is_bounded_jpeg_uri() {
        let uri = preview_data_uri(&red(800, 400), 100).expect("preview");
        let b64 = uri
            .strip_prefix("data:image/jpeg;base64,")
            .expect("jpeg data uri");
        let bytes = STANDARD.decode(b64).expect("valid base64");
        let thumb = decode_image(&bytes).expect("decodable");
        assert!(thumb.width() <= 100 && thumb.height() <= 100);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn payload_is_base64() {
        let data = image_payload(&[1, 2, 3], PNG_MIME);
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&data.data).unwrap(), vec![1, 2, 3]);
    }
}
