//! Image preprocessing.
//!
//! Converts raw upload bytes into the `[1, H, W, 3]` tensor the classifier
//! was trained on: decode, force three channels, direct resize with the
//! manifest's filter, scale to `[0, 1]`. No cropping and no aspect-ratio
//! preservation.

use std::io::Cursor;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use leaf_core::{InputSpec, ResizeFilter};
use thiserror::Error;

/// Upload rejected before reaching the model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("empty payload")]
    Empty,

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
}

/// Decodes upload bytes into an image.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ImageError>;
}

/// PNG and JPEG decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

impl ImageDecoder for DefaultDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ImageError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ImageError::UnsupportedFormat(e.to_string()))?;

        match reader.format() {
            Some(ImageFormat::Png) | Some(ImageFormat::Jpeg) => {}
            Some(other) => {
                return Err(ImageError::UnsupportedFormat(format!("{other:?}")));
            }
            None => {
                return Err(ImageError::UnsupportedFormat(
                    "unrecognised image data".to_string(),
                ));
            }
        }

        reader
            .decode()
            .map_err(|e| ImageError::UnsupportedFormat(e.to_string()))
    }
}

/// Model input: NHWC, batch of one, channel values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl PreprocessedTensor {
    /// Wraps raw values; `None` when the length does not match the shape.
    pub fn from_raw(shape: [usize; 4], data: Vec<f32>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then_some(Self { shape, data })
    }

    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Turns upload bytes into model input.
#[derive(Clone)]
pub struct Preprocessor {
    input: InputSpec,
    max_bytes: usize,
    decoder: Arc<dyn ImageDecoder>,
}

impl std::fmt::Debug for Preprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preprocessor")
            .field("input", &self.input)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl Preprocessor {
    pub fn new(input: InputSpec, max_bytes: usize) -> Self {
        Self::with_decoder(input, max_bytes, Arc::new(DefaultDecoder))
    }

    pub fn with_decoder(
        input: InputSpec,
        max_bytes: usize,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        Self {
            input,
            max_bytes,
            decoder,
        }
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.input.tensor_shape()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Rejects empty and oversized payloads without decoding them.
    pub fn check_payload(&self, bytes: &[u8]) -> Result<(), ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn prepare(&self, bytes: &[u8]) -> Result<PreprocessedTensor, ImageError> {
        self.check_payload(bytes)?;

        // to_rgb8 drops alpha and expands grayscale/palette, keeping RGB order
        let rgb = self.decoder.decode(bytes)?.to_rgb8();
        let resized = resize(&rgb, self.input.width, self.input.height, self.input.resize);

        let data = resized
            .pixels()
            .flat_map(|pixel| pixel.0)
            .map(|channel| channel as f32 / 255.0)
            .collect();

        Ok(PreprocessedTensor {
            shape: self.input_shape(),
            data,
        })
    }
}

fn resize(img: &RgbImage, width: u32, height: u32, filter: ResizeFilter) -> RgbImage {
    let filter = match filter {
        ResizeFilter::PilBilinear => return pil_bilinear_resize(img, width, height),
        ResizeFilter::Nearest => FilterType::Nearest,
        ResizeFilter::Triangle => FilterType::Triangle,
        ResizeFilter::CatmullRom => FilterType::CatmullRom,
        ResizeFilter::Gaussian => FilterType::Gaussian,
        ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    };
    imageops::resize(img, width, height, filter)
}

/// Bilinear resize matching PIL's `Image.resize(size, BILINEAR)`.
///
/// When downscaling the triangle kernel is widened by the scale factor,
/// which gives PIL's anti-aliasing behaviour.
pub fn pil_bilinear_resize(src: &RgbImage, target_width: u32, target_height: u32) -> RgbImage {
    let src_width = src.width() as usize;
    let src_height = src.height() as usize;
    let target_width = target_width as usize;
    let target_height = target_height as usize;

    let mut dst = RgbImage::new(target_width as u32, target_height as u32);
    if src_width == 0 || src_height == 0 {
        return dst;
    }

    let x_scale = src_width as f32 / target_width as f32;
    let y_scale = src_height as f32 / target_height as f32;
    let support_x = x_scale.max(1.0);
    let support_y = y_scale.max(1.0);

    for dy in 0..target_height {
        for dx in 0..target_width {
            let src_cx = (dx as f32 + 0.5) * x_scale;
            let src_cy = (dy as f32 + 0.5) * y_scale;

            let x_min = (src_cx - support_x).floor().max(0.0) as usize;
            let x_max = (src_cx + support_x).ceil().min(src_width as f32 - 1.0) as usize;
            let y_min = (src_cy - support_y).floor().max(0.0) as usize;
            let y_max = (src_cy + support_y).ceil().min(src_height as f32 - 1.0) as usize;

            let mut total_weight = 0.0f32;
            let mut weighted_sum = [0.0f32; 3];

            for sy in y_min..=y_max {
                for sx in x_min..=x_max {
                    let dist_x = ((sx as f32 + 0.5) - src_cx).abs() / support_x;
                    let dist_y = ((sy as f32 + 0.5) - src_cy).abs() / support_y;
                    if dist_x >= 1.0 || dist_y >= 1.0 {
                        continue;
                    }

                    let weight = (1.0 - dist_x) * (1.0 - dist_y);
                    let pixel = src.get_pixel(sx as u32, sy as u32);
                    for (sum, &channel) in weighted_sum.iter_mut().zip(pixel.0.iter()) {
                        *sum += channel as f32 * weight;
                    }
                    total_weight += weight;
                }
            }

            if total_weight > 0.0 {
                let [r, g, b] = weighted_sum.map(|sum| (sum / total_weight).round() as u8);
                dst.put_pixel(dx as u32, dy as u32, Rgb([r, g, b]));
            }
        }
    }

    dst
}
