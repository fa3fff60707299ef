//! Image inputs accepted by the pipeline and their normalization to RGB.

use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),
}

/// Channel layout of a caller-supplied pixel buffer.
///
/// Callers must state it; the pipeline never guesses from pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// A raw image as handed over by the host application.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Already-decoded interleaved 3-channel pixels.
    Pixels {
        data: Vec<u8>,
        width: u32,
        height: u32,
        order: ChannelOrder,
    },
    /// Encoded bytes (JPEG, PNG, ...).
    Encoded(Vec<u8>),
    /// Path to an encoded image on disk.
    Path(PathBuf),
}

impl ImageInput {
    /// Decode into a single RGB image.
    pub fn decode(&self) -> Result<RgbImage, ImageError> {
        match self {
            ImageInput::Pixels {
                data,
                width,
                height,
                order,
            } => {
                let expected = *width as usize * *height as usize * 3;
                if *width == 0 || *height == 0 || data.len() != expected {
                    return Err(ImageError::UnsupportedImageFormat(format!(
                        "pixel buffer of {} bytes does not match {width}x{height}x3",
                        data.len()
                    )));
                }
                let mut pixels = data.clone();
                if *order == ChannelOrder::Bgr {
                    for px in pixels.chunks_exact_mut(3) {
                        px.swap(0, 2);
                    }
                }
                RgbImage::from_raw(*width, *height, pixels).ok_or_else(|| {
                    ImageError::UnsupportedImageFormat("pixel buffer rejected".into())
                })
            }
            ImageInput::Encoded(bytes) => image::load_from_memory(bytes)
                .map(|img| img.to_rgb8())
                .map_err(|e| ImageError::UnsupportedImageFormat(e.to_string())),
            ImageInput::Path(path) => {
                if !path.is_file() {
                    return Err(ImageError::UnsupportedImageFormat(format!(
                        "{} is not an existing file",
                        path.display()
                    )));
                }
                image::open(path)
                    .map(|img| img.to_rgb8())
                    .map_err(|e| {
                        ImageError::UnsupportedImageFormat(format!("{}: {e}", path.display()))
                    })
            }
        }
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Encoded(bytes)
    }
}
