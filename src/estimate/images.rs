use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, ImageError, codecs::jpeg::JpegEncoder};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_EDGE: u32 = 1024;
pub const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Error)]
#[error("failed to encode {}: {source}", path.display())]
pub struct EncodeError {
    pub path: PathBuf,
    #[source]
    pub source: ImageError,
}

/// Downscales to fit `MAX_EDGE`, re-encodes as JPEG and wraps it in a data URL.
pub fn encode_data_url(path: &Path) -> Result<String, EncodeError> {
    let wrap = |source| EncodeError {
        path: path.to_path_buf(),
        source,
    };
    let mut img = image::open(path).map_err(wrap)?;
    if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img = img.thumbnail(MAX_EDGE, MAX_EDGE);
    }
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))
        .map_err(wrap)?;
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(buf)))
}

pub fn encode_all(paths: &[PathBuf]) -> Result<Vec<String>, EncodeError> {
    paths.iter().map(|path| encode_data_url(path)).collect()
}
