//! Resizing and pixel transformations applied after decode.

use crate::error::{DecodeError, Result};
use crate::images::{BitmapImage, Image};
use crate::request::Size;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::fmt;

/// How strictly the output must match the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
  /// Output may be larger than requested as long as it does not carry
  /// substantially more pixels; never upscales.
  #[default]
  LessPixels,
  /// Output fits inside the requested size, keeping the source aspect ratio.
  SameAspectRatio,
  /// Output is exactly the requested size, cropping per [`Scale`].
  Exactly,
}

impl Precision {
  pub fn name(&self) -> &'static str {
    match self {
      Precision::LessPixels => "LESS_PIXELS",
      Precision::SameAspectRatio => "SAME_ASPECT_RATIO",
      Precision::Exactly => "EXACTLY",
    }
  }
}

/// Which region survives when [`Precision::Exactly`] has to crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
  StartCrop,
  #[default]
  CenterCrop,
  EndCrop,
  /// Distort instead of cropping.
  Fill,
}

impl Scale {
  pub fn name(&self) -> &'static str {
    match self {
      Scale::StartCrop => "START_CROP",
      Scale::CenterCrop => "CENTER_CROP",
      Scale::EndCrop => "END_CROP",
      Scale::Fill => "FILL",
    }
  }
}

/// A pixel-level transformation with a stable identity key.
///
/// The key participates in result-cache and memory-cache key derivation, so
/// two transformations with equal keys must produce equal output.
pub trait Transformation: Send + Sync {
  fn key(&self) -> String;

  fn transform(&self, image: &BitmapImage) -> Result<BitmapImage>;
}

/// Records one transformation that was applied to a decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
  key: String,
}

impl Transformed {
  pub fn new(key: impl Into<String>) -> Self {
    Self { key: key.into() }
  }

  pub fn resize(size: Size, precision: Precision, scale: Scale) -> Self {
    Self::new(format!(
      "Resize({size},{},{})",
      precision.name(),
      scale.name()
    ))
  }

  pub fn key(&self) -> &str {
    &self.key
  }
}

impl fmt::Display for Transformed {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key)
  }
}

/// Resize `image` toward `target` under the given precision. Returns `None`
/// when the image already satisfies the target and no pixels need to move.
pub fn resize(
  image: &BitmapImage,
  target: Size,
  precision: Precision,
  scale: Scale,
) -> Option<BitmapImage> {
  let (width, height) = (image.width(), image.height());
  if width == 0 || height == 0 || target.width == 0 || target.height == 0 {
    return None;
  }
  match precision {
    Precision::LessPixels => {
      let source_pixels = width as u64 * height as u64;
      let target_pixels = target.width as u64 * target.height as u64;
      if source_pixels <= target_pixels {
        return None;
      }
      // Uniform scale so the output carries roughly target_pixels pixels.
      let factor = (target_pixels as f64 / source_pixels as f64).sqrt();
      let out_w = ((width as f64 * factor).round() as u32).max(1);
      let out_h = ((height as f64 * factor).round() as u32).max(1);
      Some(scale_to(image.pixels(), out_w, out_h))
    }
    Precision::SameAspectRatio => {
      let factor = f64::min(
        target.width as f64 / width as f64,
        target.height as f64 / height as f64,
      );
      if factor >= 1.0 {
        return None;
      }
      let out_w = ((width as f64 * factor).round() as u32).max(1);
      let out_h = ((height as f64 * factor).round() as u32).max(1);
      Some(scale_to(image.pixels(), out_w, out_h))
    }
    Precision::Exactly => {
      if width == target.width && height == target.height {
        return None;
      }
      if scale == Scale::Fill {
        return Some(scale_to(image.pixels(), target.width, target.height));
      }
      // Scale so the target is fully covered, then crop the overflow.
      let factor = f64::max(
        target.width as f64 / width as f64,
        target.height as f64 / height as f64,
      );
      let scaled_w = ((width as f64 * factor).round() as u32).max(target.width);
      let scaled_h = ((height as f64 * factor).round() as u32).max(target.height);
      let scaled = scale_to(image.pixels(), scaled_w, scaled_h);
      let excess_x = scaled_w - target.width;
      let excess_y = scaled_h - target.height;
      let (x, y) = match scale {
        Scale::StartCrop => (0, 0),
        Scale::CenterCrop => (excess_x / 2, excess_y / 2),
        Scale::EndCrop => (excess_x, excess_y),
        Scale::Fill => unreachable!(),
      };
      let cropped =
        imageops::crop_imm(scaled.pixels(), x, y, target.width, target.height).to_image();
      Some(BitmapImage::new(cropped))
    }
  }
}

fn scale_to(pixels: &RgbaImage, width: u32, height: u32) -> BitmapImage {
  BitmapImage::new(imageops::resize(pixels, width, height, FilterType::Triangle))
}

/// Converts the image to grayscale while keeping the alpha channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleTransformation;

impl Transformation for GrayscaleTransformation {
  fn key(&self) -> String {
    "Grayscale".to_string()
  }

  fn transform(&self, image: &BitmapImage) -> Result<BitmapImage> {
    let mut out = image.pixels().clone();
    for pixel in out.pixels_mut() {
      let [r, g, b, a] = pixel.0;
      let luma =
        (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8;
      pixel.0 = [luma, luma, luma, a];
    }
    Ok(BitmapImage::new(out))
  }
}

/// Rotates the image by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy)]
pub struct RotateTransformation {
  degrees: u32,
}

impl RotateTransformation {
  /// `degrees` must be a multiple of 90.
  pub fn new(degrees: u32) -> Result<Self> {
    if degrees % 90 != 0 {
      return Err(
        DecodeError::TransformFailed {
          key: format!("Rotate({degrees})"),
          reason: "rotation must be a multiple of 90 degrees".to_string(),
        }
        .into(),
      );
    }
    Ok(Self {
      degrees: degrees % 360,
    })
  }
}

impl Transformation for RotateTransformation {
  fn key(&self) -> String {
    format!("Rotate({})", self.degrees)
  }

  fn transform(&self, image: &BitmapImage) -> Result<BitmapImage> {
    let pixels = image.pixels();
    let out = match self.degrees {
      0 => pixels.clone(),
      90 => imageops::rotate90(pixels),
      180 => imageops::rotate180(pixels),
      270 => imageops::rotate270(pixels),
      _ => unreachable!(),
    };
    Ok(BitmapImage::new(out))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  fn bitmap(width: u32, height: u32) -> BitmapImage {
    BitmapImage::new(RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255])))
  }

  #[test]
  fn less_pixels_skips_small_sources() {
    let image = bitmap(50, 50);
    assert!(resize(&image, Size::new(100, 100), Precision::LessPixels, Scale::CenterCrop).is_none());
  }

  #[test]
  fn less_pixels_scales_down_preserving_aspect() {
    let image = bitmap(400, 200);
    let out = resize(&image, Size::new(100, 100), Precision::LessPixels, Scale::CenterCrop)
      .expect("should resize");
    assert!(out.width() as u64 * out.height() as u64 <= 100 * 100 + 200);
    let ratio = out.width() as f64 / out.height() as f64;
    assert!((ratio - 2.0).abs() < 0.1, "aspect drifted: {ratio}");
  }

  #[test]
  fn same_aspect_ratio_fits_inside_target() {
    let image = bitmap(400, 200);
    let out = resize(
      &image,
      Size::new(100, 100),
      Precision::SameAspectRatio,
      Scale::CenterCrop,
    )
    .expect("should resize");
    assert_eq!((out.width(), out.height()), (100, 50));
  }

  #[test]
  fn exactly_produces_requested_dimensions() {
    let image = bitmap(400, 200);
    for scale in [Scale::StartCrop, Scale::CenterCrop, Scale::EndCrop, Scale::Fill] {
      let out = resize(&image, Size::new(100, 100), Precision::Exactly, scale)
        .expect("should resize");
      assert_eq!((out.width(), out.height()), (100, 100), "scale {scale:?}");
    }
  }

  #[test]
  fn exactly_is_noop_when_already_matching() {
    let image = bitmap(100, 100);
    assert!(resize(&image, Size::new(100, 100), Precision::Exactly, Scale::CenterCrop).is_none());
  }

  #[test]
  fn rotate_quarter_turn_swaps_dimensions() {
    let image = bitmap(40, 20);
    let rotate = RotateTransformation::new(90).unwrap();
    let out = rotate.transform(&image).unwrap();
    assert_eq!((out.width(), out.height()), (20, 40));
    assert!(RotateTransformation::new(45).is_err());
  }

  #[test]
  fn grayscale_flattens_channels() {
    let image = bitmap(2, 2);
    let out = GrayscaleTransformation.transform(&image).unwrap();
    let pixel = out.pixels().get_pixel(0, 0).0;
    assert_eq!(pixel[0], pixel[1]);
    assert_eq!(pixel[1], pixel[2]);
    assert_eq!(pixel[3], 255);
  }
}
