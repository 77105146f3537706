//! Page image serialization.
//!
//! Archives carry JPEG (smaller, good enough for previews); persisted result
//! sets and OCR requests use lossless PNG, since compression artefacts on
//! rendered text hurt recognition. A page without a retained bitmap is an
//! [`ConvertError::ImageUnavailable`], never an empty file.

use crate::error::ConvertError;
use crate::model::Page;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Output encoding for page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

/// Encode a bitmap. JPEG has no alpha channel, so it is flattened to RGB first.
pub fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Png => img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?,
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)?,
    }
    Ok(buf)
}

/// The page's retained bitmap, encoded.
pub fn page_image(page: &Page, format: ImageFormat) -> Result<Vec<u8>, ConvertError> {
    let Some(img) = page.image.as_deref() else {
        let reason = if page.raster_failed() {
            "page failed to rasterize"
        } else {
            "page images were not retained"
        };
        return Err(ConvertError::ImageUnavailable {
            page: page.index,
            reason: reason.into(),
        });
    };
    encode(img, format).map_err(|e| ConvertError::ImageUnavailable {
        page: page.index,
        reason: e.to_string(),
    })
}

/// [`page_image`] as standard base64.
pub fn page_image_base64(page: &Page, format: ImageFormat) -> Result<String, ConvertError> {
    page_image(page, format).map(|bytes| STANDARD.encode(bytes))
}

/// A bitmap wrapped for a vision-LLM request.
///
/// `detail: "high"` lets GPT-4-class models tile the full image, without
/// which fine print and small tables are lost.
pub fn to_image_data(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(encode(img, ImageFormat::Png)?);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
