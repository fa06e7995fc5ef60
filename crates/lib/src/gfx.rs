//! Raster image recompression.
//!
//! Eligible images inside a package are re-encoded as lossy JPEG at a
//! configured quality. JPEG has no native transparency, so any image with a
//! non-opaque pixel gets its alpha plane extracted into a grayscale JPEG
//! side-file next to the recompressed image.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, Luma};
use tracing::info;

use crate::error::{Error, Result};

/// A recompressed image on disk, plus its alpha side-file if one was needed.
#[derive(Debug)]
pub struct RecompressedImage {
  pub path: PathBuf,
  pub alpha: Option<PathBuf>,
}

/// Side-file path for an image's extracted alpha plane.
pub fn alpha_sidecar(jpeg_path: &Path) -> PathBuf {
  let stem = jpeg_path
    .file_stem()
    .and_then(|s| s.to_str())
    .unwrap_or_default();
  jpeg_path.with_file_name(format!("{stem}_alpha.jpg"))
}

fn image_error(path: &Path, err: image::ImageError) -> Error {
  Error::Image {
    path: path.to_path_buf(),
    message: err.to_string(),
  }
}

/// Re-encode `src` as JPEG at `dest`, extracting the alpha plane to a
/// side-file when the image carries non-opaque transparency.
pub fn recompress(src: &Path, dest: &Path, quality: u8) -> Result<RecompressedImage> {
  info!(src = %src.display(), dest = %dest.display(), quality, "recompressing image");

  let rgba = image::open(src).map_err(|e| image_error(src, e))?.to_rgba8();
  let has_alpha = rgba.pixels().any(|p| p[3] != 255);

  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }

  let rgb = DynamicImage::ImageRgba8(rgba.clone()).to_rgb8();
  let mut out = BufWriter::new(File::create(dest)?);
  JpegEncoder::new_with_quality(&mut out, quality)
    .encode_image(&rgb)
    .map_err(|e| image_error(src, e))?;

  let alpha = if has_alpha {
    let alpha_path = alpha_sidecar(dest);
    let plane = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| Luma([rgba.get_pixel(x, y)[3]]));
    let mut out = BufWriter::new(File::create(&alpha_path)?);
    JpegEncoder::new_with_quality(&mut out, quality)
      .encode_image(&plane)
      .map_err(|e| image_error(src, e))?;
    Some(alpha_path)
  } else {
    None
  };

  Ok(RecompressedImage {
    path: dest.to_path_buf(),
    alpha,
  })
}
