//! Decoding and resizing of fetched payloads
//!
//! The decode step is a pure function from `(bytes, target)` to a
//! [`DecodedImage`]. Workers call it after a network fetch; the store calls
//! it again when promoting a persistent-tier entry into memory.

use crate::error::{DecodeError, Error, Result};
use crate::fingerprint::TargetSize;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

/// Default cap on decoded pixels (width * height). `0` disables the guard.
pub const DEFAULT_MAX_DECODED_PIXELS: u64 = 100_000_000;

/// A decoded (and possibly resized) image plus its in-memory byte size.
///
/// The byte size is what the memory tier accounts against its capacity.
#[derive(Debug)]
pub struct DecodedImage {
  pub image: DynamicImage,
  pub byte_size: usize,
}

impl DecodedImage {
  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}

/// Decode `bytes` and scale to `target`.
///
/// Both axes set: exact resize. One axis set: the other is derived from the
/// source aspect ratio. No axis set, or the target equals the native size:
/// the image is returned as decoded. `url` is only used for error reporting.
pub fn decode_and_scale(
  bytes: &[u8],
  target: TargetSize,
  max_decoded_pixels: u64,
  url: &str,
) -> Result<DecodedImage> {
  let reader = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| malformed(url, e.to_string()))?;

  // Dimension guard before committing to a full decode.
  if max_decoded_pixels > 0 {
    let (w, h) = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()
      .map_err(|e| malformed(url, e.to_string()))?
      .into_dimensions()
      .map_err(|e| malformed(url, e.to_string()))?;
    if u64::from(w) * u64::from(h) > max_decoded_pixels {
      return Err(Error::Decode(DecodeError::TooLarge {
        url: url.to_string(),
        width: w,
        height: h,
        max_pixels: max_decoded_pixels,
      }));
    }
  }

  let decoded = reader
    .decode()
    .map_err(|e| malformed(url, e.to_string()))?;

  let image = scale_to_target(decoded, target);
  let byte_size = image.as_bytes().len();
  Ok(DecodedImage { image, byte_size })
}

fn scale_to_target(image: DynamicImage, target: TargetSize) -> DynamicImage {
  let (native_w, native_h) = image.dimensions();
  let (out_w, out_h) = match (target.width, target.height) {
    (None, None) => return image,
    (Some(w), Some(h)) => (w, h),
    (Some(w), None) => (w, derive_axis(native_h, native_w, w)),
    (None, Some(h)) => (derive_axis(native_w, native_h, h), h),
  };

  if out_w == 0 || out_h == 0 || (out_w, out_h) == (native_w, native_h) {
    return image;
  }
  image.resize_exact(out_w, out_h, FilterType::Triangle)
}

/// Scale `other` by the same ratio that takes `fixed` to `fixed_target`.
fn derive_axis(other: u32, fixed: u32, fixed_target: u32) -> u32 {
  if fixed == 0 {
    return other;
  }
  let scaled = (u64::from(other) * u64::from(fixed_target)) / u64::from(fixed);
  (scaled as u32).max(1)
}

fn malformed(url: &str, reason: String) -> Error {
  Error::Decode(DecodeError::Malformed {
    url: url.to_string(),
    reason,
  })
}
