use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::prelude::*;
use nshare::{AsNdarray2, AsNdarray3};

use crate::errors::{Result, SalObjError};

/// One record flowing through the transform chain.
///
/// All arrays are H×W×C in standard layout. `label` and `prior` are always
/// single-channel; `image` carries 1, 3 or 4 channels depending on the stage
/// (4 after a crop stage has fused the prior into the image). The three
/// arrays share the same spatial extent at every stage boundary.
#[derive(Debug, Clone)]
pub struct Sample {
    pub index: usize,
    pub image: Array3<u8>,
    pub label: Array3<u8>,
    pub prior: Array3<u8>,
}

impl Sample {
    /// Spatial extent (height, width) of the image array.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.image.shape()[0], self.image.shape()[1])
    }
}

/// Network-ready tensors produced by a tensor-conversion stage.
///
/// Channel-first layout: `image` is C×H×W (C = 4 for the prior-carrying
/// variant, 3 otherwise), `label` is 1×H×W.
#[derive(Debug, Clone)]
pub struct SampleTensors {
    pub index: usize,
    pub image: Array3<f32>,
    pub label: Array3<f32>,
}

/// Converts a decoded image into an H×W×C array. Grayscale inputs keep a
/// single channel; everything else is reduced to RGB.
pub fn image_to_array(img: &DynamicImage) -> Array3<u8> {
    match img {
        DynamicImage::ImageLuma8(gray) => gray.as_ndarray2().to_owned().insert_axis(Axis(2)),
        DynamicImage::ImageRgb8(rgb) => rgb.as_ndarray3().permuted_axes([1, 2, 0]).to_owned(),
        DynamicImage::ImageRgba8(rgba) => rgba.as_ndarray3().permuted_axes([1, 2, 0]).to_owned(),
        other => other
            .to_rgb8()
            .as_ndarray3()
            .permuted_axes([1, 2, 0])
            .to_owned(),
    }
}

/// Converts an H×W×C array (C ∈ {1, 3, 4}) back into an image buffer.
pub fn array_to_image(arr: &Array3<u8>) -> Result<DynamicImage> {
    let (h, w, c) = arr.dim();
    let raw = arr.as_standard_layout().to_owned().into_raw_vec_and_offset().0;
    let image = match c {
        1 => GrayImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageRgba8),
        _ => None,
    };
    image.ok_or_else(|| SalObjError::Validation {
        field: "image".to_string(),
        reason: format!("unsupported channel count {} for {}x{} array", c, w, h),
    })
}

/// Lossy u8 → f32 widening of a sample plane.
pub fn to_f32(arr: &Array3<u8>) -> Array3<f32> {
    arr.mapv(f32::from)
}

/// f32 → u8 with clamping, the inverse boundary of [`to_f32`].
pub fn to_u8(arr: &Array3<f32>) -> Array3<u8> {
    arr.mapv(|v| v.clamp(0.0, 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn grayscale_image_keeps_single_channel() {
        let gray = GrayImage::from_pixel(3, 5, Luma([7]));
        let arr = image_to_array(&DynamicImage::ImageLuma8(gray));
        assert_eq!(arr.dim(), (5, 3, 1));
        assert_eq!(arr[[0, 0, 0]], 7);
    }

    #[test]
    fn rgb_round_trip_preserves_pixels() -> Result<()> {
        let mut rgb = RgbImage::new(4, 2);
        rgb.put_pixel(2, 1, image::Rgb([10, 20, 30]));
        let arr = image_to_array(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(arr.dim(), (2, 4, 3));
        assert_eq!(arr[[1, 2, 1]], 20);

        let back = array_to_image(&arr)?;
        assert_eq!(back.to_rgb8().get_pixel(2, 1), &image::Rgb([10, 20, 30]));
        Ok(())
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        let arr = Array3::<u8>::zeros((2, 2, 5));
        assert!(array_to_image(&arr).is_err());
    }

    #[test]
    fn u8_f32_round_trip_clamps() {
        let arr = Array3::<f32>::from_elem((1, 1, 1), 300.0);
        assert_eq!(to_u8(&arr)[[0, 0, 0]], 255);
    }
}
