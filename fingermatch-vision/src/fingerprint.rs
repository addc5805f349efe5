use std::io::ErrorKind;
use std::path::Path;

use image::{
    imageops::FilterType, DynamicImage, GenericImageView, GrayImage, ImageError, ImageReader, Luma,
};
use ndarray::{Array1, Array4};

use crate::error::{ExtractError, Result};

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 128;
/// Length of every embedding produced by the extractor.
pub const EMBEDDING_DIM: usize = 128;
/// Intensity normalization applied after scaling pixels to [0, 1].
/// These must match the constants the gallery embeddings were generated with.
pub const NORM_MEAN: f32 = 0.5;
pub const NORM_STD: f32 = 0.5;

/// L2-normalized fingerprint embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    /// Wrap raw model output, normalizing it to unit length.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        Self {
            vector: Array1::from_vec(l2_normalize(raw)),
        }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        // Array1 built from a Vec is always contiguous.
        self.vector.as_slice().unwrap_or(&[])
    }

    pub fn norm(&self) -> f32 {
        self.vector.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

/// Open and decode an image, guessing the format from its content.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        log::debug!("image not found: {}", path.display());
        return Err(ExtractError::InputNotFound);
    }

    let reader = ImageReader::open(path).map_err(|e| {
        log::debug!("opening {}: {e}", path.display());
        if e.kind() == ErrorKind::NotFound {
            ExtractError::InputNotFound
        } else {
            ExtractError::InputUnreadable("cannot open image".to_string())
        }
    })?;
    let reader = reader.with_guessed_format().map_err(|e| {
        log::debug!("sniffing {}: {e}", path.display());
        ExtractError::InputUnreadable("cannot read image".to_string())
    })?;

    reader.decode().map_err(|e| {
        log::debug!("decoding {}: {e}", path.display());
        match e {
            ImageError::IoError(io) if io.kind() == ErrorKind::NotFound => {
                ExtractError::InputNotFound
            }
            ImageError::Unsupported(_) => {
                ExtractError::InputUnreadable("unsupported image format".to_string())
            }
            _ => ExtractError::InputUnreadable("corrupt image data".to_string()),
        }
    })
}

/// Convert an image into the `[1, 1, 128, 128]` network input.
///
/// Grayscale, triangle-filter resize, then `(p / 255 - 0.5) / 0.5`.
pub fn preprocess(img: &DynamicImage) -> Result<Array4<f32>> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ExtractError::InputUnreadable("empty image".to_string()));
    }

    let gray = to_grayscale(img);
    let resized = image::imageops::resize(&gray, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let input_data: Vec<f32> = resized
        .as_raw()
        .iter()
        .map(|&p| (p as f32 / 255.0 - NORM_MEAN) / NORM_STD)
        .collect();

    let size = INPUT_SIZE as usize;
    Array4::from_shape_vec((1, 1, size, size), input_data)
        .map_err(|e| ExtractError::Inference(e.to_string()))
}

/// Single-channel 8-bit luminance with ITU-R 601-2 weights in 16-bit fixed
/// point, rounding half up. Gallery embeddings were produced from this
/// conversion; `to_luma8` uses Rec. 709 weights and gives different pixels.
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    match img {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageLumaA8(gray_alpha) => {
            GrayImage::from_fn(gray_alpha.width(), gray_alpha.height(), |x, y| {
                Luma([gray_alpha.get_pixel(x, y)[0]])
            })
        }
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => img.to_luma8(),
        _ => {
            // Alpha is dropped, not composited.
            let rgb = img.to_rgb8();
            GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                let l = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
                Luma([l as u8])
            })
        }
    }
}

/// L2 normalization. An all-zero vector is returned unchanged.
pub fn l2_normalize(v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v
    }
}

/// Exact cosine similarity, accumulated in f64.
///
/// Computed as `dot / sqrt(|a|^2 * |b|^2)` so that two identical vectors
/// score exactly 1.0. Mismatched lengths or a zero vector score 0.0.
pub fn match_embedding(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut aa, mut bb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        aa += x * x;
        bb += y * y;
    }

    let denom = (aa * bb).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}
