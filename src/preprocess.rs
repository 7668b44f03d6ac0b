//! Image Normalization
//!
//! Turns uploaded image bytes into the canonical model input: an NHWC
//! `f32` tensor of shape `(1, H, W, 3)` with values in `[0.0, 1.0]`.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::{Array4, ArrayView4};
use thiserror::Error;

use crate::model::InputShape;

/// Spatial size used when the model does not declare one
pub const DEFAULT_TARGET_SIZE: TargetSize = TargetSize {
    height: 224,
    width: 224,
};

/// Number of color channels the model consumes
pub const CHANNELS: usize = 3;

/// Raised when the upload is not a usable image. Always a caller mistake.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to process image: empty payload")]
    Empty,

    #[error("Failed to process image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to process image: zero-sized image ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub height: u32,
    pub width: u32,
}

impl TargetSize {
    /// Pick the model's declared spatial size when both dimensions are known.
    ///
    /// A partially known shape falls back to [`DEFAULT_TARGET_SIZE`] rather
    /// than guessing the missing side.
    pub fn for_model(shape: Option<&InputShape>) -> Self {
        shape
            .and_then(InputShape::spatial)
            .map(|(height, width)| Self { height, width })
            .unwrap_or(DEFAULT_TARGET_SIZE)
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        DEFAULT_TARGET_SIZE
    }
}

/// Model-ready image tensor, layout `(batch=1, height, width, channels=3)`.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// Flattened values in row-major (NHWC) order
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// Decode, convert to RGB, stretch to `target` and scale into `[0, 1]`.
pub fn normalize(raw: &[u8], target: TargetSize) -> Result<ImageTensor, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    let img = image::load_from_memory(raw)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::ZeroDimension {
            width: img.width(),
            height: img.height(),
        });
    }

    let rgb = to_rgb(img);
    let resized = if rgb.dimensions() == (target.width, target.height) {
        rgb
    } else {
        // Plain stretch: no cropping, no letterboxing
        image::imageops::resize(&rgb, target.width, target.height, FilterType::Triangle)
    };

    let (h, w) = (target.height as usize, target.width as usize);
    let data = Array4::from_shape_fn((1, h, w, CHANNELS), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });

    Ok(ImageTensor { data })
}

/// Collapse any decoded color model into 8-bit RGB.
///
/// Luma is replicated across the three channels; alpha is discarded after
/// the color channels are taken as-is.
fn to_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn assert_unit_range(tensor: &ImageTensor) {
        assert!(tensor.view().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_rgb_jpeg_is_stretched_to_default_size() {
        let img = RgbImage::from_pixel(300, 400, Rgb([128, 128, 128]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg);

        let tensor = normalize(&bytes, TargetSize::default()).unwrap();

        assert_eq!(tensor.shape(), [1, 224, 224, 3]);
        assert_unit_range(&tensor);
    }

    #[test]
    fn test_grayscale_is_replicated_to_three_channels() {
        let img = GrayImage::from_pixel(17, 9, Luma([51]));
        let bytes = encode(DynamicImage::ImageLuma8(img), ImageFormat::Png);

        let tensor = normalize(&bytes, TargetSize { height: 8, width: 12 }).unwrap();

        assert_eq!(tensor.shape(), [1, 8, 12, 3]);
        let view = tensor.view();
        // Uniform input survives the stretch up to one intensity step
        for c in 0..3 {
            assert!((view[[0, 4, 6, c]] - 0.2).abs() < 0.01);
        }
        assert_eq!(view[[0, 4, 6, 0]], view[[0, 4, 6, 2]]);
    }

    #[test]
    fn test_rgba_keeps_color_and_drops_alpha() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 51, 10]));
        let bytes = encode(DynamicImage::ImageRgba8(img), ImageFormat::Png);

        let tensor = normalize(&bytes, TargetSize { height: 4, width: 4 }).unwrap();

        let view = tensor.view();
        assert_eq!(view[[0, 0, 0, 0]], 1.0);
        assert_eq!(view[[0, 0, 0, 1]], 0.0);
        assert!((view[[0, 0, 0, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_extreme_intensities_map_to_unit_bounds() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([255, 255, 255]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let tensor = normalize(&bytes, TargetSize { height: 1, width: 2 }).unwrap();

        assert_eq!(tensor.to_vec(), vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_non_image_bytes_fail_with_decode_error() {
        let err = normalize(b"not an image", TargetSize::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)));
        assert!(err.to_string().starts_with("Failed to process image"));
    }

    #[test]
    fn test_empty_payload_fails_with_decode_error() {
        assert!(matches!(
            normalize(&[], TargetSize::default()),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_truncated_png_fails_with_decode_error() {
        let img = RgbImage::from_pixel(64, 64, Rgb([10, 200, 30]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        // Signature plus a cut-off IHDR chunk
        let result = normalize(&bytes[..30], TargetSize::default());
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_target_size_prefers_fully_known_model_shape() {
        let full = InputShape {
            height: Some(128),
            width: Some(96),
            channels: Some(3),
        };
        assert_eq!(
            TargetSize::for_model(Some(&full)),
            TargetSize { height: 128, width: 96 }
        );

        let partial = InputShape {
            height: Some(128),
            width: None,
            channels: Some(3),
        };
        assert_eq!(TargetSize::for_model(Some(&partial)), DEFAULT_TARGET_SIZE);
        assert_eq!(TargetSize::for_model(None), DEFAULT_TARGET_SIZE);
    }
}
