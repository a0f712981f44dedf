//! Stateless geometric augmentations over f32 sample planes.
//!
//! Every function draws its own parameters from the supplied RNG and skips
//! the augmentation entirely with probability `p_skip`, so a configurable
//! fraction of samples passes through untouched. The image+mask variants
//! apply one identical warp to both arrays; the `_prior` variants apply the
//! same contract to the single prior plane.

use ndarray::prelude::*;
use rand::Rng;

use crate::errors::Result;
use crate::warp::{
    affine_from_points, convolve_same, homography_from_points, minmax_rescale, warp_affine,
    warp_projective, warp_tps, Affine2, Border, ThinPlateSpline,
};

fn skip(rng: &mut impl Rng, p_skip: f64) -> bool {
    rng.random_bool(p_skip.clamp(0.0, 1.0))
}

fn jitter(rng: &mut impl Rng, bound: f32) -> f32 {
    if bound > 0.0 {
        rng.random_range(-bound..bound)
    } else {
        0.0
    }
}

/// Diagonal line kernel of random length in [5, 30], rotated by a random
/// angle in [0, 360) and normalized to unit sum.
fn motion_blur_kernel(rng: &mut impl Rng) -> Array2<f32> {
    let length = rng.random_range(5..=30usize);
    let angle = rng.random_range(0.0..360.0f32);

    let mut diagonal = Array3::<f32>::zeros((length, length, 1));
    for i in 0..length {
        diagonal[[i, i, 0]] = 1.0;
    }

    let center = (length - 1) as f32 / 2.0;
    let backward = Affine2::rotation_about(center, center, -angle);
    let rotated = warp_affine(&diagonal, &backward, Border::Zero);

    let sum: f32 = rotated.iter().sum();
    let mut kernel = rotated.index_axis_move(Axis(2), 0);
    // the center pixel survives any rotation, so the sum is never zero
    kernel.mapv_inplace(|v| v / sum);
    kernel
}

/// Motion-blurs image and mask with one shared kernel, then min–max
/// rescales the image to [0, 255] and the mask to [0, 1].
pub fn motion_blur(
    image: Array3<f32>,
    mask: Array3<f32>,
    p_skip: f64,
    rng: &mut impl Rng,
) -> (Array3<f32>, Array3<f32>) {
    if skip(rng, p_skip) {
        return (image, mask);
    }
    let kernel = motion_blur_kernel(rng);
    let blurred_image = convolve_same(&image, &kernel.view());
    let blurred_mask = convolve_same(&mask, &kernel.view());
    (
        minmax_rescale(&blurred_image, 0.0, 255.0),
        minmax_rescale(&blurred_mask, 0.0, 1.0),
    )
}

/// Prior-only motion blur; the convolution alone, no rescale.
pub fn motion_blur_prior(prior: Array3<f32>, p_skip: f64, rng: &mut impl Rng) -> Array3<f32> {
    if skip(rng, p_skip) {
        return prior;
    }
    let kernel = motion_blur_kernel(rng);
    convolve_same(&prior, &kernel.view())
}

fn corner_anchors_3(h: f32, w: f32) -> [[f32; 2]; 3] {
    [[0.0, 0.0], [w, 0.0], [0.0, h]]
}

fn corner_anchors_4(h: f32, w: f32) -> [[f32; 2]; 4] {
    [[0.0, 0.0], [w, 0.0], [0.0, h], [w, h]]
}

fn perturb<const N: usize>(
    anchors: [[f32; 2]; N],
    ratio: f32,
    h: f32,
    w: f32,
    rng: &mut impl Rng,
) -> [[f32; 2]; N] {
    let mut out = anchors;
    for p in &mut out {
        p[0] += jitter(rng, ratio * w);
        p[1] += jitter(rng, ratio * h);
    }
    out
}

/// Fits the backward affine map for a random three-point correspondence
/// whose 12 pixel offsets are bounded by `ratio` of the image extent.
fn random_affine_map(
    h: usize,
    w: usize,
    ratio: f32,
    rng: &mut impl Rng,
) -> Result<Affine2> {
    let anchors = corner_anchors_3(h as f32, w as f32);
    let src = perturb(anchors, ratio, h as f32, w as f32, rng);
    let dst = perturb(anchors, ratio, h as f32, w as f32, rng);
    // fitted destination → source, the direction backward sampling needs
    affine_from_points(&dst, &src)
}

/// Warps image and mask through one random affine, size preserved,
/// bilinear interpolation, reflected borders.
pub fn random_affine(
    image: Array3<f32>,
    mask: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<(Array3<f32>, Array3<f32>)> {
    if skip(rng, p_skip) {
        return Ok((image, mask));
    }
    let (h, w, _) = image.dim();
    let map = random_affine_map(h, w, ratio, rng)?;
    Ok((
        warp_affine(&image, &map, Border::Reflect),
        warp_affine(&mask, &map, Border::Reflect),
    ))
}

/// Prior-only variant of [`random_affine`].
pub fn random_affine_prior(
    prior: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<Array3<f32>> {
    if skip(rng, p_skip) {
        return Ok(prior);
    }
    let (h, w, _) = prior.dim();
    let map = random_affine_map(h, w, ratio, rng)?;
    Ok(warp_affine(&prior, &map, Border::Reflect))
}

fn random_perspective_map(
    h: usize,
    w: usize,
    ratio: f32,
    rng: &mut impl Rng,
) -> Result<crate::warp::Homography> {
    let anchors = corner_anchors_4(h as f32, w as f32);
    let src = perturb(anchors, ratio, h as f32, w as f32, rng);
    let dst = perturb(anchors, ratio, h as f32, w as f32, rng);
    homography_from_points(&dst, &src)
}

/// Warps image and mask through one random homography drawn from a
/// perturbed four-point correspondence (16 offsets).
pub fn random_perspective(
    image: Array3<f32>,
    mask: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<(Array3<f32>, Array3<f32>)> {
    if skip(rng, p_skip) {
        return Ok((image, mask));
    }
    let (h, w, _) = image.dim();
    let map = random_perspective_map(h, w, ratio, rng)?;
    Ok((
        warp_projective(&image, &map, Border::Reflect),
        warp_projective(&mask, &map, Border::Reflect),
    ))
}

/// Prior-only variant of [`random_perspective`].
pub fn random_perspective_prior(
    prior: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<Array3<f32>> {
    if skip(rng, p_skip) {
        return Ok(prior);
    }
    let (h, w, _) = prior.dim();
    let map = random_perspective_map(h, w, ratio, rng)?;
    Ok(warp_projective(&prior, &map, Border::Reflect))
}

fn random_tps_map(
    h: usize,
    w: usize,
    ratio: f32,
    rng: &mut impl Rng,
) -> Result<ThinPlateSpline> {
    let anchors = corner_anchors_4(h as f32, w as f32);
    let src = perturb(anchors, ratio, h as f32, w as f32, rng);
    let dst = perturb(anchors, ratio, h as f32, w as f32, rng);
    ThinPlateSpline::fit(&dst, &src)
}

/// Warps image and mask through one thin-plate-spline fitted between two
/// randomly perturbed four-corner shapes (16 offsets). Pixels pulled from
/// outside the source read as zero, matching the spline warp's fill.
pub fn thin_plate_spline(
    image: Array3<f32>,
    mask: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<(Array3<f32>, Array3<f32>)> {
    if skip(rng, p_skip) {
        return Ok((image, mask));
    }
    let (h, w, _) = image.dim();
    let map = random_tps_map(h, w, ratio, rng)?;
    Ok((
        warp_tps(&image, &map, Border::Zero),
        warp_tps(&mask, &map, Border::Zero),
    ))
}

/// Prior-only variant of [`thin_plate_spline`].
pub fn thin_plate_spline_prior(
    prior: Array3<f32>,
    ratio: f32,
    p_skip: f64,
    rng: &mut impl Rng,
) -> Result<Array3<f32>> {
    if skip(rng, p_skip) {
        return Ok(prior);
    }
    let (h, w, _) = prior.dim();
    let map = random_tps_map(h, w, ratio, rng)?;
    Ok(warp_tps(&prior, &map, Border::Zero))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn test_image() -> Array3<f32> {
        Array3::from_shape_fn((12, 10, 3), |(y, x, c)| (y * 10 + x + c * 3) as f32)
    }

    fn test_mask() -> Array3<f32> {
        Array3::from_shape_fn((12, 10, 1), |(y, x, _)| if y > 5 && x > 4 { 255.0 } else { 0.0 })
    }

    #[test]
    fn p_skip_one_is_identity_for_all_variants() {
        let mut rng = rng();
        let (image, mask) = (test_image(), test_mask());

        let (i, m) = motion_blur(image.clone(), mask.clone(), 1.0, &mut rng);
        assert_eq!(i, image);
        assert_eq!(m, mask);

        let (i, m) = random_affine(image.clone(), mask.clone(), 0.02, 1.0, &mut rng).unwrap();
        assert_eq!(i, image);
        assert_eq!(m, mask);

        let (i, m) = random_perspective(image.clone(), mask.clone(), 0.02, 1.0, &mut rng).unwrap();
        assert_eq!(i, image);
        assert_eq!(m, mask);

        let (i, m) = thin_plate_spline(image.clone(), mask.clone(), 0.02, 1.0, &mut rng).unwrap();
        assert_eq!(i, image);
        assert_eq!(m, mask);

        let p = motion_blur_prior(mask.clone(), 1.0, &mut rng);
        assert_eq!(p, mask);
    }

    #[test]
    fn motion_blur_rescales_image_and_mask_ranges() {
        let mut rng = rng();
        let (image, mask) = motion_blur(test_image(), test_mask(), 0.0, &mut rng);

        assert_eq!(image.dim(), (12, 10, 3));
        assert_eq!(mask.dim(), (12, 10, 1));

        let max_img = image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min_img = image.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!((max_img - 255.0).abs() < 1e-3 && min_img.abs() < 1e-3);

        let max_mask = mask.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!((max_mask - 1.0).abs() < 1e-3);
    }

    #[test]
    fn motion_blur_kernel_sums_to_one() {
        let mut rng = rng();
        for _ in 0..8 {
            let kernel = motion_blur_kernel(&mut rng);
            let sum: f32 = kernel.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn warps_preserve_spatial_size() {
        let mut rng = rng();
        let (image, mask) = random_affine(test_image(), test_mask(), 0.02, 0.0, &mut rng).unwrap();
        assert_eq!(image.dim(), (12, 10, 3));
        assert_eq!(mask.dim(), (12, 10, 1));

        let (image, mask) =
            random_perspective(test_image(), test_mask(), 0.02, 0.0, &mut rng).unwrap();
        assert_eq!(image.dim(), (12, 10, 3));
        assert_eq!(mask.dim(), (12, 10, 1));

        let (image, mask) =
            thin_plate_spline(test_image(), test_mask(), 0.02, 0.0, &mut rng).unwrap();
        assert_eq!(image.dim(), (12, 10, 3));
        assert_eq!(mask.dim(), (12, 10, 1));
    }

    #[test]
    fn prior_variants_match_joint_variant_shapes() {
        let mut rng = rng();
        let prior = test_mask();
        assert_eq!(
            random_affine_prior(prior.clone(), 0.02, 0.0, &mut rng)
                .unwrap()
                .dim(),
            prior.dim()
        );
        assert_eq!(
            random_perspective_prior(prior.clone(), 0.02, 0.0, &mut rng)
                .unwrap()
                .dim(),
            prior.dim()
        );
        assert_eq!(
            thin_plate_spline_prior(prior.clone(), 0.02, 0.0, &mut rng)
                .unwrap()
                .dim(),
            prior.dim()
        );
        assert_eq!(
            motion_blur_prior(prior.clone(), 0.0, &mut rng).dim(),
            prior.dim()
        );
    }

    #[test]
    fn zero_ratio_warp_is_numerically_identity() {
        let mut rng = rng();
        let (image, _) = random_affine(test_image(), test_mask(), 0.0, 0.0, &mut rng).unwrap();
        for (a, b) in image.iter().zip(test_image().iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }
}
