//! Local image work around the remote call: shrinking uploads below the size
//! ceiling and fitting results into the requested output box.
//!
//! Everything here is CPU-bound; async callers run it on `spawn_blocking`.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};

use crate::error::Result;
use crate::types::{BlobHandle, ProcessedImage, TargetSize};

/// Longest edge allowed for a recompressed upload.
pub const MAX_UPLOAD_EDGE: u32 = 2048;
const INITIAL_QUALITY: f32 = 80.0;
const MIN_QUALITY: f32 = 10.0;
const MAX_COMPRESSION_ATTEMPTS: u32 = 5;
const WEBP_CONVERSION_QUALITY: u8 = 90;

/// Bytes ready to be sent as the multipart `image` part.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime: String,
}

/// Prepare a source for upload.
///
/// WebP is converted to JPEG. Anything still above `max_bytes` is downscaled
/// to fit [`MAX_UPLOAD_EDGE`] and re-encoded with decreasing JPEG quality.
pub fn prepare_upload(bytes: &[u8], file_name: &str, max_bytes: usize) -> Result<UploadPayload> {
    let format = image::guess_format(bytes).ok();

    let mut payload = if format == Some(ImageFormat::WebP) {
        let img = image::load_from_memory_with_format(bytes, ImageFormat::WebP)?;
        UploadPayload {
            bytes: encode_jpeg(&img, WEBP_CONVERSION_QUALITY)?,
            file_name: with_extension(file_name, "jpg"),
            mime: "image/jpeg".to_string(),
        }
    } else {
        UploadPayload {
            bytes: bytes.to_vec(),
            file_name: file_name.to_string(),
            mime: format
                .map(|f| f.to_mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }
    };

    if payload.bytes.len() <= max_bytes {
        return Ok(payload);
    }

    let img = image::load_from_memory(&payload.bytes)?;
    let (w, h) = img.dimensions();
    let img = if w > MAX_UPLOAD_EDGE || h > MAX_UPLOAD_EDGE {
        img.resize(MAX_UPLOAD_EDGE, MAX_UPLOAD_EDGE, FilterType::Lanczos3)
    } else {
        img
    };

    let original_len = payload.bytes.len();
    payload.bytes = compress_progressively(&img, max_bytes)?;
    payload.file_name = with_extension(&payload.file_name, "jpg");
    payload.mime = "image/jpeg".to_string();
    tracing::debug!(
        from = original_len,
        to = payload.bytes.len(),
        "Recompressed upload to fit size ceiling"
    );
    Ok(payload)
}

/// Re-encode as JPEG, scaling quality by `sqrt(target / size)` until the output
/// fits or the attempts run out. The last encoding is returned either way.
fn compress_progressively(img: &DynamicImage, target_bytes: usize) -> Result<Vec<u8>> {
    let mut quality = INITIAL_QUALITY;
    let mut attempt = 0;
    loop {
        let encoded = encode_jpeg(img, quality.round() as u8)?;
        if encoded.len() <= target_bytes || attempt >= MAX_COMPRESSION_ATTEMPTS {
            return Ok(encoded);
        }
        quality *= (target_bytes as f32 / encoded.len() as f32).sqrt();
        quality = quality.clamp(MIN_QUALITY, 100.0);
        attempt += 1;
    }
}

pub(crate) fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(out)
}

fn with_extension(name: &str, ext: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, ext),
        _ => format!("{}.{}", name, ext),
    }
}

/// Scale `img` to fit inside `target` keeping its aspect ratio, centred on a
/// transparent canvas of exactly `target`.
pub fn fit_onto_canvas(img: &DynamicImage, target: TargetSize) -> RgbaImage {
    let fitted = img.resize(target.width, target.height, FilterType::Lanczos3);
    let (fw, fh) = fitted.dimensions();
    let mut canvas = RgbaImage::new(target.width, target.height);
    let x = (target.width.saturating_sub(fw) / 2) as i64;
    let y = (target.height.saturating_sub(fh) / 2) as i64;
    image::imageops::overlay(&mut canvas, &fitted.to_rgba8(), x, y);
    canvas
}

/// Decode a remote result, optionally fit it into `target`, and wrap it.
///
/// Without a target the bytes are kept as returned; only the size is decoded.
pub fn finish_result(bytes: Vec<u8>, target: Option<TargetSize>) -> Result<ProcessedImage> {
    let img = image::load_from_memory(&bytes)?;
    match target {
        Some(target) => {
            let canvas = fit_onto_canvas(&img, target);
            let mut out = Cursor::new(Vec::new());
            canvas.write_to(&mut out, ImageFormat::Png)?;
            Ok(ProcessedImage {
                data: BlobHandle::new(out.into_inner()),
                width: target.width,
                height: target.height,
                mime: "image/png".to_string(),
            })
        }
        None => {
            let (width, height) = img.dimensions();
            let mime = image::guess_format(&bytes)
                .map(|f| f.to_mime_type().to_string())
                .unwrap_or_else(|_| "image/png".to_string());
            Ok(ProcessedImage {
                data: BlobHandle::new(bytes),
                width,
                height,
                mime,
            })
        }
    }
}
