//! Decoding fetched bytes into images.

use crate::error::{DecodeError, Result};
use crate::fetch::{DataFrom, FetchResult};
use crate::images::{BitmapImage, Image};
use crate::request_context::RequestContext;
use crate::transform::Transformed;
use image::ImageFormat;
use std::sync::Arc;

/// Intrinsic properties of the decoded source, before resizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
  pub width: u32,
  pub height: u32,
  pub mime_type: Option<String>,
}

/// Output of the decode stage.
#[derive(Debug, Clone)]
pub struct DecodeResult {
  pub image: Arc<dyn Image>,
  pub info: ImageInfo,
  pub data_from: DataFrom,
  /// Transformations applied on top of the raw decode, in order.
  pub transformeds: Vec<Transformed>,
}

/// Turns one [`FetchResult`] into a [`DecodeResult`].
pub trait Decoder: Send + Sync {
  fn decode(&self, context: &RequestContext, fetched: &FetchResult) -> Result<DecodeResult>;
}

impl std::fmt::Debug for dyn Decoder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("dyn Decoder")
  }
}

/// Creates a [`Decoder`] for sources it recognizes, `None` otherwise.
///
/// Recognition goes by sniffed header bytes first, falling back to the
/// reported mime type; uri extensions are not trusted.
pub trait DecoderFactory: Send + Sync {
  fn create(&self, context: &RequestContext, fetched: &FetchResult)
    -> Option<Box<dyn Decoder>>;
}

/// Decodes raster formats via the `image` crate.
#[derive(Debug, Default)]
pub struct BitmapDecoderFactory;

impl DecoderFactory for BitmapDecoderFactory {
  fn create(
    &self,
    context: &RequestContext,
    fetched: &FetchResult,
  ) -> Option<Box<dyn Decoder>> {
    let header = fetched.header_bytes(context.request().uri()).ok()?;
    let format = image::guess_format(&header).ok()?;
    Some(Box::new(BitmapDecoder { format }))
  }
}

struct BitmapDecoder {
  format: ImageFormat,
}

impl Decoder for BitmapDecoder {
  fn decode(&self, context: &RequestContext, fetched: &FetchResult) -> Result<DecodeResult> {
    let uri = context.request().uri();
    let bytes = fetched.source().read_all().map_err(|e| {
      DecodeError::DecodeFailed {
        uri: uri.to_string(),
        reason: e.to_string(),
      }
    })?;
    let decoded =
      image::load_from_memory_with_format(&bytes, self.format).map_err(|e| {
        DecodeError::DecodeFailed {
          uri: uri.to_string(),
          reason: e.to_string(),
        }
      })?;
    let pixels = decoded.to_rgba8();
    let (width, height) = (pixels.width(), pixels.height());
    if width == 0 || height == 0 {
      return Err(
        DecodeError::ImageInvalid {
          uri: uri.to_string(),
          reason: format!("decoded to {width}x{height}"),
        }
        .into(),
      );
    }
    Ok(DecodeResult {
      image: Arc::new(BitmapImage::new(pixels)),
      info: ImageInfo {
        width,
        height,
        mime_type: Some(self.format.to_mime_type().to_string()),
      },
      data_from: fetched.data_from(),
      transformeds: Vec::new(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::control::CancelToken;
  use crate::fetch::DataSource;
  use crate::request::ImageRequest;
  use image::{Rgba, RgbaImage};
  use std::io::Cursor;

  fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255]));
    let mut out = Cursor::new(Vec::new());
    pixels.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
  }

  fn context(uri: &str) -> RequestContext {
    RequestContext::new(ImageRequest::new(uri), CancelToken::new())
  }

  #[test]
  fn decodes_png_from_sniffed_header() {
    let fetched = FetchResult::new(
      DataSource::from_vec(png_bytes(8, 6)),
      None,
      DataFrom::Local,
    );
    let ctx = context("mem://a");
    let decoder = BitmapDecoderFactory.create(&ctx, &fetched).unwrap();
    let result = decoder.decode(&ctx, &fetched).unwrap();
    assert_eq!((result.info.width, result.info.height), (8, 6));
    assert_eq!(result.info.mime_type.as_deref(), Some("image/png"));
    assert_eq!(result.data_from, DataFrom::Local);
    assert!(result.transformeds.is_empty());
  }

  #[test]
  fn unrecognized_bytes_get_no_decoder() {
    let fetched = FetchResult::new(
      DataSource::from_vec(b"plain text".to_vec()),
      Some("image/png".to_string()),
      DataFrom::Local,
    );
    assert!(BitmapDecoderFactory
      .create(&context("mem://a"), &fetched)
      .is_none());
  }

  #[test]
  fn truncated_payload_fails_decode() {
    let mut bytes = png_bytes(8, 6);
    bytes.truncate(20);
    let fetched = FetchResult::new(DataSource::from_vec(bytes), None, DataFrom::Local);
    let ctx = context("mem://a");
    let decoder = BitmapDecoderFactory.create(&ctx, &fetched).unwrap();
    assert!(decoder.decode(&ctx, &fetched).is_err());
  }
}
