use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, ImageReader, RgbImage};
use std::{
    io::{self, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageCodecError {
    #[error("Failed to read image: {0}")]
    Read(#[from] io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode image: {0}")]
    Encode(image::ImageError),
}

/// An upload written to its own scratch file. The file is removed on drop.
#[derive(Debug)]
pub struct ScratchImage {
    file: NamedTempFile,
}

impl ScratchImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub fn save_temp_image(content: &[u8], dir: &Path) -> io::Result<ScratchImage> {
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".jpg")
        .tempfile_in(dir)?;
    file.write_all(content)?;
    file.flush()?;
    Ok(ScratchImage { file })
}

/// Decodes by content, the file extension is ignored.
pub fn load_image(path: &Path) -> Result<RgbImage, ImageCodecError> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(ImageCodecError::Decode)?;
    Ok(image.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageCodecError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .map_err(ImageCodecError::Encode)?;
    Ok(buffer)
}

pub fn encode_image_base64(image: &RgbImage, quality: u8) -> Result<String, ImageCodecError> {
    let buffer = encode_jpeg(image, quality)?;
    Ok(STANDARD.encode(buffer))
}
