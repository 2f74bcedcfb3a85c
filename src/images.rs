//! Image values produced by the pipeline.
//!
//! The engine is polymorphic over image representations: it only needs
//! dimensions, an accounting byte size, whether an instance may be handed to
//! multiple concurrent consumers, and whether the underlying resource is
//! still usable. Platform drawables plug in behind this trait; the crate
//! ships a raster [`BitmapImage`] and a [`FakeImage`] test double.

use image::RgbaImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capability surface the caches and the engine require of an image.
pub trait Image: fmt::Debug + Send + Sync {
  fn width(&self) -> u32;

  fn height(&self) -> u32;

  /// Byte size used for memory-cache budget accounting.
  fn byte_count(&self) -> u64;

  /// Whether the same instance may be handed to multiple concurrent
  /// consumers without copying.
  fn shareable(&self) -> bool {
    true
  }

  /// Whether the underlying resource is still usable. A cached image that
  /// fails this check is treated as a cache miss and purged.
  fn check_valid(&self) -> bool {
    true
  }

  /// Raster view of this image, when it is pixel-backed. Non-raster
  /// implementations (and test doubles) return `None` and are skipped by
  /// pixel-level consumers such as the result cache.
  fn as_bitmap(&self) -> Option<&BitmapImage> {
    None
  }
}

/// Decoded raster image backed by an RGBA pixel buffer.
///
/// Pixels are shared via `Arc` so clones are cheap and a cached instance can
/// be handed to several consumers at once.
#[derive(Clone)]
pub struct BitmapImage {
  pixels: Arc<RgbaImage>,
}

impl BitmapImage {
  pub fn new(pixels: RgbaImage) -> Self {
    Self {
      pixels: Arc::new(pixels),
    }
  }

  pub fn pixels(&self) -> &RgbaImage {
    &self.pixels
  }
}

impl fmt::Debug for BitmapImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BitmapImage")
      .field("width", &self.pixels.width())
      .field("height", &self.pixels.height())
      .finish()
  }
}

impl Image for BitmapImage {
  fn width(&self) -> u32 {
    self.pixels.width()
  }

  fn height(&self) -> u32 {
    self.pixels.height()
  }

  fn byte_count(&self) -> u64 {
    u64::from(self.pixels.width()) * u64::from(self.pixels.height()) * 4
  }

  fn as_bitmap(&self) -> Option<&BitmapImage> {
    Some(self)
  }
}

/// Fixed-size placeholder image used by tests.
///
/// `set_valid(false)` simulates the underlying platform resource being
/// recycled while cached.
#[derive(Debug)]
pub struct FakeImage {
  width: u32,
  height: u32,
  shareable: bool,
  valid: AtomicBool,
}

impl FakeImage {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      shareable: true,
      valid: AtomicBool::new(true),
    }
  }

  pub fn unshareable(width: u32, height: u32) -> Self {
    Self {
      shareable: false,
      ..Self::new(width, height)
    }
  }

  pub fn set_valid(&self, valid: bool) {
    self.valid.store(valid, Ordering::SeqCst);
  }
}

impl Image for FakeImage {
  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn byte_count(&self) -> u64 {
    u64::from(self.width) * u64::from(self.height) * 4
  }

  fn shareable(&self) -> bool {
    self.shareable
  }

  fn check_valid(&self) -> bool {
    self.valid.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgba;

  #[test]
  fn bitmap_reports_dimensions_and_bytes() {
    let image = BitmapImage::new(RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 255])));
    assert_eq!(image.width(), 4);
    assert_eq!(image.height(), 2);
    assert_eq!(image.byte_count(), 4 * 2 * 4);
    assert!(image.shareable());
    assert!(image.check_valid());
  }

  #[test]
  fn fake_image_validity_can_flip() {
    let image = FakeImage::new(10, 10);
    assert!(image.check_valid());
    image.set_valid(false);
    assert!(!image.check_valid());
  }
}
