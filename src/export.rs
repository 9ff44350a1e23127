//! Writing finished results to disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

use crate::error::{ProcessingError, Result};
use crate::imaging;
use crate::types::{ImageJob, JobStatus, ProcessedImage, TargetSize};

pub const EXPORT_JPEG_QUALITY: u8 = 90;

/// Output format for [`export_completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// The processed bytes as returned, transparency kept.
    #[default]
    Original,
    /// Flattened onto white and encoded as JPEG.
    Jpeg,
}

/// Draw `result` over a white canvas and encode it as JPEG.
///
/// With a `size` the image is stretched to exactly that size; otherwise its
/// own size is kept.
pub fn flatten_to_jpeg(result: &ProcessedImage, size: Option<TargetSize>) -> Result<Vec<u8>> {
    let bytes = result
        .data
        .bytes()
        .ok_or_else(|| ProcessingError::Other("Result image was released".into()))?;
    let img = image::load_from_memory(bytes)?;
    let img = match size {
        Some(size) if img.dimensions() != (size.width, size.height) => {
            img.resize_exact(size.width, size.height, FilterType::Lanczos3)
        }
        _ => img,
    };

    let (w, h) = img.dimensions();
    let mut canvas = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut canvas, &img.to_rgba8(), 0, 0);
    imaging::encode_jpeg(&DynamicImage::ImageRgba8(canvas), EXPORT_JPEG_QUALITY)
}

/// File name for an exported result: the source name up to its first dot,
/// with the format's extension.
pub fn export_file_name(source_name: &str, format: ExportFormat, mime: &str) -> String {
    let stem = source_name.split('.').next().filter(|s| !s.is_empty()).unwrap_or("image");
    let ext = match format {
        ExportFormat::Jpeg => "jpg",
        ExportFormat::Original => match mime {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        },
    };
    format!("{}.{}", stem, ext)
}

/// `name`, or `name` with a `-N` suffix on its stem if already taken.
fn claim_unique_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name.as_str(), ""));
    let mut n = 1;
    loop {
        let candidate = if ext.is_empty() {
            format!("{}-{}", stem, n)
        } else {
            format!("{}-{}.{}", stem, n, ext)
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Write every completed job's result into `dir`. Returns the written paths.
///
/// Results whose names collide within one export get a numeric suffix.
pub async fn export_completed(
    jobs: &[ImageJob],
    dir: &Path,
    format: ExportFormat,
    size: Option<TargetSize>,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::new();
    let mut taken = HashSet::new();

    for job in jobs.iter().filter(|j| j.status == JobStatus::Completed) {
        let Some(result) = &job.result else {
            continue;
        };
        let bytes = match format {
            ExportFormat::Original => match result.data.bytes() {
                Some(bytes) => bytes.to_vec(),
                None => continue,
            },
            ExportFormat::Jpeg => {
                let result = result.clone();
                tokio::task::spawn_blocking(move || flatten_to_jpeg(&result, size))
                    .await
                    .map_err(|e| ProcessingError::Other(format!("Export task failed: {}", e)))??
            }
        };

        let name = claim_unique_name(
            export_file_name(&job.file_name, format, &result.mime),
            &mut taken,
        );
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), "Exported result");
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlobHandle, ProcessingMode, SourceImage};
    use std::io::Cursor;

    fn transparent_png(w: u32, h: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbaImage::new(w, h)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn processed(w: u32, h: u32) -> ProcessedImage {
        ProcessedImage {
            data: BlobHandle::new(transparent_png(w, h)),
            width: w,
            height: h,
            mime: "image/png".into(),
        }
    }

    #[test]
    fn test_flatten_is_white_jpeg_of_requested_size() {
        let jpeg = flatten_to_jpeg(&processed(20, 10), Some(TargetSize::new(40, 30))).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);

        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (40, 30));
        let px = decoded.get_pixel(20, 15);
        assert!(px.0.iter().all(|c| *c > 240), "expected white, got {:?}", px);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(export_file_name("cat.photo.png", ExportFormat::Jpeg, "image/png"), "cat.jpg");
        assert_eq!(export_file_name("dog.jpg", ExportFormat::Original, "image/png"), "dog.png");
        assert_eq!(export_file_name(".hidden", ExportFormat::Jpeg, "image/png"), "image.jpg");
    }

    #[test]
    fn test_claim_unique_name() {
        let mut taken = HashSet::new();
        assert_eq!(claim_unique_name("a.jpg".into(), &mut taken), "a.jpg");
        assert_eq!(claim_unique_name("a.jpg".into(), &mut taken), "a-1.jpg");
        assert_eq!(claim_unique_name("a.jpg".into(), &mut taken), "a-2.jpg");
        assert_eq!(claim_unique_name("b.png".into(), &mut taken), "b.png");
    }

    #[tokio::test]
    async fn test_same_stem_results_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let jobs: Vec<ImageJob> = ["a.png", "a.jpg"]
            .iter()
            .map(|name| {
                let source = SourceImage::from_bytes(*name, transparent_png(4, 4), None);
                let mut job = ImageJob::new(source, "bria", Some(ProcessingMode::Ai));
                job.status = JobStatus::Completed;
                job.result = Some(processed(4, 4));
                job
            })
            .collect();

        let written = export_completed(&jobs, dir.path(), ExportFormat::Original, None)
            .await
            .unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("a.png"));
        assert!(written[1].ends_with("a-1.png"));
        assert!(written.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_export_completed_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceImage::from_bytes("a.png", transparent_png(4, 4), None);

        let mut done = ImageJob::new(source.clone(), "bria", Some(ProcessingMode::Ai));
        done.status = JobStatus::Completed;
        done.result = Some(processed(4, 4));
        let pending = ImageJob::new(
            SourceImage::from_bytes("b.png", transparent_png(4, 4), None),
            "bria",
            None,
        );

        let written = export_completed(&[done, pending], dir.path(), ExportFormat::Jpeg, None)
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("a.jpg"));
        assert!(written[0].exists());
    }
}
