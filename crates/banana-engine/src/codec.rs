use std::io::Cursor;

use banana_contracts::GenerateError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

/// Decode `bytes` and re-encode them as baseline JPEG. Alpha is dropped.
pub fn reencode_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, GenerateError> {
    let decoded = image::load_from_memory(bytes).map_err(|_| GenerateError::InvalidImageFormat)?;
    let rgb = decoded.to_rgb8();
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode_image(&rgb)
            .map_err(|_| GenerateError::InvalidImageFormat)?;
    }
    Ok(out)
}

/// Fails unless `bytes` decode as an image.
pub fn ensure_decodable(bytes: &[u8]) -> Result<(), GenerateError> {
    image::load_from_memory(bytes)
        .map(|_| ())
        .map_err(|_| GenerateError::InvalidImageFormat)
}

/// File extension for encoded image bytes, sniffed from the header.
pub fn extension_for(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Gif) => "gif",
        _ => "png",
    }
}

/// Small solid-colour PNG; used for fixtures and smoke runs.
pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Result<Vec<u8>, GenerateError> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|_| GenerateError::InvalidImageFormat)?;
    Ok(cursor.into_inner())
}
