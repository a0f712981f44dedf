//! Composable sample transform stages.
//!
//! A stage consumes and produces a [`Sample`]; the tensor conversions at the
//! end of a chain produce [`SampleTensors`] instead. Stages may change the
//! spatial size (rescale, crop) but always apply identical geometry to
//! image, label and prior so pixel correspondence survives the chain. All
//! parameters are fixed at construction; the only per-call state is the
//! thread RNG.

use ndarray::prelude::*;
use rand::Rng;

use crate::augment::{
    motion_blur_prior, random_affine_prior, random_perspective_prior, thin_plate_spline_prior,
};
use crate::errors::{Result, SalObjError};
use crate::sample::{array_to_image, image_to_array, to_f32, to_u8, Sample, SampleTensors};
use crate::warp::{warp_affine, Affine2, Border};

/// Intensities below this are treated as zero when max-normalizing.
const NORM_EPS: f32 = 1e-6;

pub trait Stage: Send + Sync {
    fn apply(&self, sample: Sample) -> Result<Sample>;
}

/// An ordered chain of stages applied in sequence.
#[derive(Default)]
pub struct Compose {
    stages: Vec<Box<dyn Stage>>,
}

impl Compose {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn apply(&self, mut sample: Sample) -> Result<Sample> {
        for stage in &self.stages {
            sample = stage.apply(sample)?;
        }
        Ok(sample)
    }
}

fn draw(rng: &mut impl Rng, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.random_range(lo..hi)
    } else {
        lo
    }
}

fn symmetric(rng: &mut impl Rng, bound: f32) -> f32 {
    if bound > 0.0 {
        rng.random_range(-bound..bound)
    } else {
        0.0
    }
}

/// Perturbs the prior channel through a small-angle affine (rotation ≤ 1°,
/// translation ≤ 1%, shear ≤ 2°, zero fill) with the configured
/// probability; on a miss the prior is replaced by zeros so the network
/// periodically trains and runs without the hint. Image and label are never
/// touched, and the u8 dtype survives the round trip.
pub struct AugmentPrior {
    prior_prob: f64,
}

impl AugmentPrior {
    pub fn new(prior_prob: f64) -> Self {
        Self { prior_prob }
    }

    fn small_affine(h: usize, w: usize, rng: &mut impl Rng) -> Result<Affine2> {
        let angle = symmetric(rng, 1.0f32).to_radians();
        let shear_x = symmetric(rng, 2.0f32).to_radians().tan();
        let shear_y = symmetric(rng, 2.0f32).to_radians().tan();
        let tx = symmetric(rng, 0.01) * w as f32;
        let ty = symmetric(rng, 0.01) * h as f32;

        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        let (sin, cos) = angle.sin_cos();
        // rotation ∘ shear about the center, then the translation
        let a = cos - sin * shear_y;
        let b = cos * shear_x - sin;
        let d = sin + cos * shear_y;
        let e = sin * shear_x + cos;
        let forward = Affine2([
            [a, b, cx + tx - a * cx - b * cy],
            [d, e, cy + ty - d * cx - e * cy],
        ]);
        forward.inverse()
    }
}

impl Stage for AugmentPrior {
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        let (h, w, _) = sample.prior.dim();
        let mut rng = rand::rng();

        if rng.random_bool(self.prior_prob.clamp(0.0, 1.0)) {
            let map = Self::small_affine(h, w, &mut rng)?;
            let warped = warp_affine(&to_f32(&sample.prior), &map, Border::Zero);
            sample.prior = to_u8(&warped);
        } else {
            sample.prior = Array3::zeros((h, w, 1));
        }
        Ok(sample)
    }
}

/// Degrades the prior channel through the prior-only geometric
/// augmentations (motion blur, affine, perspective, thin-plate-spline),
/// each independently subject to the skip probability. Used at training
/// time to synthesize the imperfect priors the network must tolerate.
pub struct DistortPrior {
    p_skip: f64,
    ratio: f32,
}

impl DistortPrior {
    pub fn new(p_skip: f64, ratio: f32) -> Self {
        Self { p_skip, ratio }
    }
}

impl Default for DistortPrior {
    fn default() -> Self {
        Self::new(0.1, 0.02)
    }
}

impl Stage for DistortPrior {
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        let mut rng = rand::rng();
        let mut prior = to_f32(&sample.prior);
        prior = motion_blur_prior(prior, self.p_skip, &mut rng);
        prior = random_affine_prior(prior, self.ratio, self.p_skip, &mut rng)?;
        prior = random_perspective_prior(prior, self.ratio, self.p_skip, &mut rng)?;
        prior = thin_plate_spline_prior(prior, self.ratio, self.p_skip, &mut rng)?;
        sample.prior = to_u8(&prior);
        Ok(sample)
    }
}

/// Photometric jitter of the image only; label and prior pass through
/// unchanged. Brightness, contrast and saturation are multiplicative
/// factor ranges, hue is a symmetric shift as a fraction of the hue circle.
pub struct ColorJitter {
    brightness: (f32, f32),
    contrast: (f32, f32),
    saturation: (f32, f32),
    hue: f32,
}

impl ColorJitter {
    pub fn new(
        brightness: (f32, f32),
        contrast: (f32, f32),
        saturation: (f32, f32),
        hue: f32,
    ) -> Self {
        Self {
            brightness,
            contrast,
            saturation,
            hue,
        }
    }
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta < f32::EPSILON {
        0.0
    } else if (max - r).abs() < f32::EPSILON {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if (max - g).abs() < f32::EPSILON {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max < f32::EPSILON { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let c = v * s;
    let x = c * (1.0 - (h6.rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h6 as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (r + m, g + m, b + m)
}

impl Stage for ColorJitter {
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        let (h, w, c) = sample.image.dim();
        let mut rng = rand::rng();

        let brightness = draw(&mut rng, self.brightness);
        let contrast = draw(&mut rng, self.contrast);
        let saturation = draw(&mut rng, self.saturation);
        let hue_shift = symmetric(&mut rng, self.hue);

        let mut image = to_f32(&sample.image).mapv(|v| v / 255.0);
        let color_channels = c.min(3);

        // brightness on every color channel
        for ch in 0..color_channels {
            image
                .slice_mut(s![.., .., ch])
                .mapv_inplace(|v| (v * brightness).clamp(0.0, 1.0));
        }

        if color_channels == 3 {
            // contrast blends toward the mean luminance of the whole image
            let mut mean = 0.0f32;
            for y in 0..h {
                for x in 0..w {
                    mean += 0.299 * image[[y, x, 0]]
                        + 0.587 * image[[y, x, 1]]
                        + 0.114 * image[[y, x, 2]];
                }
            }
            mean /= (h * w) as f32;

            for y in 0..h {
                for x in 0..w {
                    let gray = 0.299 * image[[y, x, 0]]
                        + 0.587 * image[[y, x, 1]]
                        + 0.114 * image[[y, x, 2]];
                    for ch in 0..3 {
                        let v = image[[y, x, ch]];
                        let v = (contrast * v + (1.0 - contrast) * mean).clamp(0.0, 1.0);
                        let v = (saturation * v + (1.0 - saturation) * gray).clamp(0.0, 1.0);
                        image[[y, x, ch]] = v;
                    }
                    if hue_shift != 0.0 {
                        let (hh, ss, vv) =
                            rgb_to_hsv(image[[y, x, 0]], image[[y, x, 1]], image[[y, x, 2]]);
                        let (r, g, b) = hsv_to_rgb(hh + hue_shift, ss, vv);
                        image[[y, x, 0]] = r;
                        image[[y, x, 1]] = g;
                        image[[y, x, 2]] = b;
                    }
                }
            }
        } else {
            // single-channel images only see the brightness/contrast part
            let mean = image.slice(s![.., .., 0]).mean().unwrap_or(0.0);
            image
                .slice_mut(s![.., .., 0])
                .mapv_inplace(|v| (contrast * v + (1.0 - contrast) * mean).clamp(0.0, 1.0));
        }

        sample.image = to_u8(&image.mapv(|v| v * 255.0));
        Ok(sample)
    }
}

/// Resizes image, label and prior to the exact target with one bilinear
/// interpolation policy for all three; label and prior come back as
/// single-channel rank-3 arrays.
pub struct Rescale {
    width: u32,
    height: u32,
}

impl Rescale {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(size: u32) -> Self {
        Self::new(size, size)
    }

    fn resize(&self, arr: &Array3<u8>) -> Result<Array3<u8>> {
        let resized = array_to_image(arr)?.resize_exact(
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );
        Ok(image_to_array(&resized))
    }

    fn resize_mask(&self, arr: &Array3<u8>) -> Result<Array3<u8>> {
        let out = self.resize(&arr.slice(s![.., .., 0..1]).to_owned())?;
        // channel dimension re-added after the resize round trip
        Ok(out.slice(s![.., .., 0..1]).to_owned())
    }
}

impl Stage for Rescale {
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        sample.image = self.resize(&sample.image)?;
        sample.label = self.resize_mask(&sample.label)?;
        sample.prior = self.resize_mask(&sample.prior)?;
        Ok(sample)
    }
}

/// Crops image, prior and label with ONE shared origin, preserving their
/// spatial alignment. The image side accepts either a plain RGB image (the
/// prior is then taken from the sample) or an RGB+prior fusion as a 4th
/// channel; the output image always carries the fused prior and the sample
/// keeps the cropped prior as well.
pub struct RandomCrop {
    width: u32,
    height: u32,
}

impl RandomCrop {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

impl Stage for RandomCrop {
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        let (h, w, c) = sample.image.dim();
        let (ch, cw) = (self.height as usize, self.width as usize);
        if ch > h || cw > w {
            return Err(SalObjError::Validation {
                field: "crop size".to_string(),
                reason: format!("{}x{} exceeds input {}x{}", cw, ch, w, h),
            });
        }

        let (rgb, prior) = match c {
            4 => (
                sample.image.slice(s![.., .., 0..3]).to_owned(),
                sample.image.slice(s![.., .., 3..4]).to_owned(),
            ),
            3 => (sample.image.clone(), sample.prior.clone()),
            _ => {
                return Err(SalObjError::Validation {
                    field: "image".to_string(),
                    reason: format!("random crop expects 3 or 4 channels, got {}", c),
                })
            }
        };

        let mut rng = rand::rng();
        let y0 = rng.random_range(0..=h - ch);
        let x0 = rng.random_range(0..=w - cw);

        let rgb = rgb.slice(s![y0..y0 + ch, x0..x0 + cw, ..]).to_owned();
        let prior = prior.slice(s![y0..y0 + ch, x0..x0 + cw, ..]).to_owned();
        let label = sample
            .label
            .slice(s![y0..y0 + ch, x0..x0 + cw, ..])
            .to_owned();

        sample.image = ndarray::concatenate(Axis(2), &[rgb.view(), prior.view()])?;
        sample.prior = prior;
        sample.label = label;
        Ok(sample)
    }
}

fn normalize_by_max(arr: Array3<f32>) -> Array3<f32> {
    let max = arr.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max < NORM_EPS {
        arr
    } else {
        arr.mapv(|v| v / max)
    }
}

/// Terminal stage turning a [`Sample`] into channel-first tensors.
pub enum TensorConversion {
    /// RGB scaled by 1/255 plus the max-normalized prior as channel 4.
    Lab,
    /// Max-scaled RGB standardized with the usual per-channel image-net
    /// constants; no prior channel.
    Standardized,
}

impl TensorConversion {
    pub fn apply(&self, sample: Sample) -> Result<SampleTensors> {
        let (h, w, c) = sample.image.dim();
        let label = normalize_by_max(to_f32(&sample.label));
        let mut label_tensor = Array3::<f32>::zeros((1, h, w));
        label_tensor
            .index_axis_mut(Axis(0), 0)
            .assign(&label.index_axis(Axis(2), 0));

        let image = match self {
            Self::Lab => {
                let prior = normalize_by_max(to_f32(&sample.prior));
                let scaled = to_f32(&sample.image).mapv(|v| v / 255.0);
                let mut tensor = Array3::<f32>::zeros((4, h, w));
                for channel in 0..3 {
                    // a single-channel image is replicated across the RGB slots
                    let source = if c == 1 { 0 } else { channel };
                    tensor
                        .index_axis_mut(Axis(0), channel)
                        .assign(&scaled.index_axis(Axis(2), source));
                }
                tensor
                    .index_axis_mut(Axis(0), 3)
                    .assign(&prior.index_axis(Axis(2), 0));
                tensor
            }
            Self::Standardized => {
                const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
                const STD: [f32; 3] = [0.229, 0.224, 0.225];
                let scaled = normalize_by_max(to_f32(&sample.image));
                let mut tensor = Array3::<f32>::zeros((3, h, w));
                for channel in 0..3 {
                    let source = if c == 1 { 0 } else { channel };
                    let (mean, std) = if c == 1 {
                        (MEAN[0], STD[0])
                    } else {
                        (MEAN[channel], STD[channel])
                    };
                    let plane = scaled
                        .index_axis(Axis(2), source)
                        .mapv(|v| (v - mean) / std);
                    tensor.index_axis_mut(Axis(0), channel).assign(&plane);
                }
                tensor
            }
        };

        Ok(SampleTensors {
            index: sample.index,
            image,
            label: label_tensor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(h: usize, w: usize) -> Sample {
        Sample {
            index: 0,
            image: Array3::from_shape_fn((h, w, 3), |(y, x, c)| (y * w + x + c) as u8),
            label: Array3::from_elem((h, w, 1), 255),
            prior: Array3::from_elem((h, w, 1), 128),
        }
    }

    #[test]
    fn rescale_hits_exact_target_for_all_planes() -> Result<()> {
        let out = Rescale::new(6, 4).apply(sample(10, 8))?;
        assert_eq!(out.image.dim(), (4, 6, 3));
        assert_eq!(out.label.dim(), (4, 6, 1));
        assert_eq!(out.prior.dim(), (4, 6, 1));
        Ok(())
    }

    #[test]
    fn rescale_keeps_fused_channel_count() -> Result<()> {
        let mut s = sample(8, 8);
        s.image = Array3::from_elem((8, 8, 4), 9);
        let out = Rescale::square(4).apply(s)?;
        assert_eq!(out.image.dim(), (4, 4, 4));
        Ok(())
    }

    #[test]
    fn augment_prior_miss_zeroes_the_prior_only() -> Result<()> {
        let out = AugmentPrior::new(0.0).apply(sample(6, 6))?;
        assert!(out.prior.iter().all(|&v| v == 0));
        assert_eq!(out.image, sample(6, 6).image);
        assert_eq!(out.label, sample(6, 6).label);
        Ok(())
    }

    #[test]
    fn augment_prior_hit_keeps_shape_and_neighbors() -> Result<()> {
        let out = AugmentPrior::new(1.0).apply(sample(16, 16))?;
        assert_eq!(out.prior.dim(), (16, 16, 1));
        // a sub-degree, sub-pixel warp of a constant plane keeps the interior
        assert_eq!(out.prior[[8, 8, 0]], 128);
        assert_eq!(out.image, sample(16, 16).image);
        Ok(())
    }

    #[test]
    fn color_jitter_identity_parameters_change_nothing() -> Result<()> {
        let s = sample(5, 7);
        let out = ColorJitter::new((1.0, 1.0), (1.0, 1.0), (1.0, 1.0), 0.0).apply(s.clone())?;
        assert_eq!(out.image, s.image);
        Ok(())
    }

    #[test]
    fn color_jitter_never_touches_label_or_prior() -> Result<()> {
        let s = sample(5, 7);
        let out = ColorJitter::new((0.5, 1.5), (0.5, 1.5), (0.5, 1.5), 0.1).apply(s.clone())?;
        assert_eq!(out.label, s.label);
        assert_eq!(out.prior, s.prior);
        assert_eq!(out.image.dim(), s.image.dim());
        Ok(())
    }

    #[test]
    fn random_crop_keeps_planes_aligned() -> Result<()> {
        // encode the coordinate into every plane so alignment is observable
        let coded = Array3::from_shape_fn((12, 12, 1), |(y, x, _)| (y * 12 + x) as u8);
        let s = Sample {
            index: 0,
            image: ndarray::concatenate(
                Axis(2),
                &[coded.view(), coded.view(), coded.view()],
            )
            .unwrap(),
            label: coded.clone(),
            prior: coded.clone(),
        };

        let out = RandomCrop::square(5).apply(s)?;
        assert_eq!(out.image.dim(), (5, 5, 4));
        assert_eq!(out.label.dim(), (5, 5, 1));
        assert_eq!(out.prior.dim(), (5, 5, 1));

        let rgb0 = out.image.slice(s![.., .., 0..1]).to_owned();
        let fused_prior = out.image.slice(s![.., .., 3..4]).to_owned();
        assert_eq!(rgb0, out.label, "label crop drifted from image crop");
        assert_eq!(rgb0, out.prior, "prior crop drifted from image crop");
        assert_eq!(fused_prior, out.prior);
        Ok(())
    }

    #[test]
    fn random_crop_rejects_oversized_targets() {
        assert!(RandomCrop::square(20).apply(sample(8, 8)).is_err());
    }

    #[test]
    fn lab_conversion_ranges_and_prior_channel() -> Result<()> {
        let tensors = TensorConversion::Lab.apply(sample(4, 4))?;
        assert_eq!(tensors.image.dim(), (4, 4, 4));
        assert_eq!(tensors.label.dim(), (1, 4, 4));

        for channel in 0..3 {
            for &v in tensors.image.index_axis(Axis(0), channel).iter() {
                assert!((0.0..=1.0).contains(&v));
            }
        }
        // constant 128 prior normalizes to exactly 1.0
        for &v in tensors.image.index_axis(Axis(0), 3).iter() {
            assert!((v - 1.0).abs() < 1e-6);
        }
        for &v in tensors.label.iter() {
            assert!((v - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn lab_conversion_skips_normalizing_empty_label() -> Result<()> {
        let mut s = sample(4, 4);
        s.label = Array3::zeros((4, 4, 1));
        let tensors = TensorConversion::Lab.apply(s)?;
        assert!(tensors.label.iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn lab_conversion_replicates_grayscale_images() -> Result<()> {
        let mut s = sample(4, 4);
        s.image = Array3::from_elem((4, 4, 1), 51);
        let tensors = TensorConversion::Lab.apply(s)?;
        for channel in 0..3 {
            for &v in tensors.image.index_axis(Axis(0), channel).iter() {
                assert!((v - 0.2).abs() < 1e-3);
            }
        }
        Ok(())
    }

    #[test]
    fn standardized_conversion_uses_imagenet_constants() -> Result<()> {
        let mut s = sample(4, 4);
        s.image = Array3::from_elem((4, 4, 3), 255);
        let tensors = TensorConversion::Standardized.apply(s)?;
        assert_eq!(tensors.image.dim(), (3, 4, 4));
        // max-normalized constant image is 1.0 everywhere before standardizing
        let expected = (1.0 - 0.456) / 0.224;
        assert!((tensors.image[[1, 0, 0]] - expected).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn compose_applies_stages_in_order() -> Result<()> {
        let chain = Compose::new(vec![
            Box::new(AugmentPrior::new(0.0)),
            Box::new(Rescale::square(2)),
        ]);
        let out = chain.apply(sample(8, 8))?;
        assert_eq!(out.image.dim(), (2, 2, 3));
        assert!(out.prior.iter().all(|&v| v == 0));
        Ok(())
    }

    #[test]
    fn every_stage_keeps_masks_single_channel() -> Result<()> {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(AugmentPrior::new(1.0)),
            Box::new(DistortPrior::default()),
            Box::new(ColorJitter::new((0.9, 1.1), (0.9, 1.1), (0.9, 1.1), 0.1)),
            Box::new(Rescale::square(6)),
            Box::new(RandomCrop::square(4)),
        ];
        let mut s = sample(8, 8);
        for stage in &stages {
            s = stage.apply(s)?;
            assert_eq!(s.label.shape()[2], 1);
            assert_eq!(s.prior.shape()[2], 1);
        }
        Ok(())
    }
}
