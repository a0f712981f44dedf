//! Resampling primitives shared by the geometric augmentations: bilinear
//! sampling with a border policy, affine / homography / thin-plate-spline
//! fits from point correspondences, and same-size kernel convolution.

use ndarray::prelude::*;
use num_traits::Float;
use rayon::prelude::*;

use crate::errors::{Result, SalObjError};

/// Out-of-bounds policy for resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// Mirror across the edge pixel (reflect-101: `-1 → 1`, `n → n-2`).
    Reflect,
    /// Constant zero fill.
    Zero,
}

fn reflect_index(i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    let period = 2 * n - 2;
    let mut m = i % period;
    if m < 0 {
        m += period;
    }
    if m >= n {
        m = period - m;
    }
    m as usize
}

fn fetch(plane: &ArrayView2<'_, f32>, y: isize, x: isize, border: Border) -> f32 {
    let (h, w) = plane.dim();
    match border {
        Border::Reflect => plane[[reflect_index(y, h), reflect_index(x, w)]],
        Border::Zero => {
            if y < 0 || x < 0 || y >= h as isize || x >= w as isize {
                0.0
            } else {
                plane[[y as usize, x as usize]]
            }
        }
    }
}

/// Bilinear lookup at fractional source coordinates.
pub fn sample_bilinear(plane: &ArrayView2<'_, f32>, x: f32, y: f32, border: Border) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let dx = x - x0;
    let dy = y - y0;
    let (xi, yi) = (x0 as isize, y0 as isize);

    let v00 = fetch(plane, yi, xi, border);
    let v01 = fetch(plane, yi, xi + 1, border);
    let v10 = fetch(plane, yi + 1, xi, border);
    let v11 = fetch(plane, yi + 1, xi + 1, border);

    v00 * (1.0 - dx) * (1.0 - dy)
        + v01 * dx * (1.0 - dy)
        + v10 * (1.0 - dx) * dy
        + v11 * dx * dy
}

/// Resamples every channel of `src` through `map`, where `map` sends output
/// pixel coordinates to source coordinates. Channels are resampled in
/// parallel with identical parameters, so pixel correspondence between
/// channels is preserved.
pub fn warp_with<F>(src: &Array3<f32>, map: F, border: Border) -> Array3<f32>
where
    F: Fn(f32, f32) -> (f32, f32) + Sync,
{
    let (h, w, c) = src.dim();
    let planes: Vec<Array2<f32>> = (0..c)
        .into_par_iter()
        .map(|ch| {
            let plane = src.index_axis(Axis(2), ch);
            Array2::from_shape_fn((h, w), |(y, x)| {
                let (sx, sy) = map(x as f32, y as f32);
                sample_bilinear(&plane, sx, sy, border)
            })
        })
        .collect();
    let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
    ndarray::stack(Axis(2), &views).expect("channel planes share one shape")
}

/// Row-major 2×3 affine matrix sending `(x, y)` to
/// `(a·x + b·y + c, d·x + e·y + f)`.
#[derive(Debug, Clone, Copy)]
pub struct Affine2(pub [[f32; 3]; 2]);

impl Affine2 {
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [[a, b, c], [d, e, f]] = self.0;
        (a * x + b * y + c, d * x + e * y + f)
    }

    /// Counterclockwise rotation by `degrees` about `(cx, cy)`.
    pub fn rotation_about(cx: f32, cy: f32, degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self([
            [cos, sin, (1.0 - cos) * cx - sin * cy],
            [-sin, cos, sin * cx + (1.0 - cos) * cy],
        ])
    }

    pub fn inverse(&self) -> Result<Self> {
        let [[a, b, c], [d, e, f]] = self.0;
        let det = a * e - b * d;
        if det.abs() < 1e-8 {
            return Err(SalObjError::Validation {
                field: "affine".to_string(),
                reason: "matrix is not invertible".to_string(),
            });
        }
        let (ia, ib, id, ie) = (e / det, -b / det, -d / det, a / det);
        Ok(Self([
            [ia, ib, -(ia * c + ib * f)],
            [id, ie, -(id * c + ie * f)],
        ]))
    }
}

/// Solves for the affine matrix sending each `src` point to its `dst`
/// counterpart (three-point correspondence).
pub fn affine_from_points(src: &[[f32; 2]; 3], dst: &[[f32; 2]; 3]) -> Result<Affine2> {
    let rows: Vec<Vec<f64>> = src
        .iter()
        .map(|p| vec![f64::from(p[0]), f64::from(p[1]), 1.0])
        .collect();
    let bx: Vec<f64> = dst.iter().map(|p| f64::from(p[0])).collect();
    let by: Vec<f64> = dst.iter().map(|p| f64::from(p[1])).collect();

    let top = solve_linear(rows.clone(), bx)?;
    let bottom = solve_linear(rows, by)?;
    Ok(Affine2([
        [top[0] as f32, top[1] as f32, top[2] as f32],
        [bottom[0] as f32, bottom[1] as f32, bottom[2] as f32],
    ]))
}

/// Row-major 3×3 projective matrix with `m[2][2] == 1`.
#[derive(Debug, Clone, Copy)]
pub struct Homography(pub [[f32; 3]; 3]);

impl Homography {
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = self.0;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() < 1e-8 {
            return (x, y);
        }
        (
            (m[0][0] * x + m[0][1] * y + m[0][2]) / w,
            (m[1][0] * x + m[1][1] * y + m[1][2]) / w,
        )
    }
}

/// Solves the direct linear system for the homography sending each `src`
/// point to its `dst` counterpart (four-point correspondence).
pub fn homography_from_points(src: &[[f32; 2]; 4], dst: &[[f32; 2]; 4]) -> Result<Homography> {
    let mut a = Vec::with_capacity(8);
    let mut b = Vec::with_capacity(8);
    for (s, d) in src.iter().zip(dst.iter()) {
        let (x, y) = (f64::from(s[0]), f64::from(s[1]));
        let (u, v) = (f64::from(d[0]), f64::from(d[1]));
        a.push(vec![x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u]);
        b.push(u);
        a.push(vec![0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v]);
        b.push(v);
    }
    let m = solve_linear(a, b)?;
    Ok(Homography([
        [m[0] as f32, m[1] as f32, m[2] as f32],
        [m[3] as f32, m[4] as f32, m[5] as f32],
        [m[6] as f32, m[7] as f32, 1.0],
    ]))
}

/// A fitted thin-plate-spline mapping. The spline interpolates its control
/// points exactly and bends smoothly in between.
#[derive(Debug, Clone)]
pub struct ThinPlateSpline {
    control: Vec<[f32; 2]>,
    // n kernel weights followed by the affine terms (1, x, y), per axis
    wx: Vec<f64>,
    wy: Vec<f64>,
}

fn tps_kernel(r2: f64) -> f64 {
    if r2 <= 1e-12 {
        0.0
    } else {
        r2 * r2.ln()
    }
}

impl ThinPlateSpline {
    /// Fits the spline sending each `src` control point onto its `dst`
    /// counterpart.
    pub fn fit(src: &[[f32; 2]], dst: &[[f32; 2]]) -> Result<Self> {
        let n = src.len();
        if n < 3 || n != dst.len() {
            return Err(SalObjError::Validation {
                field: "thin plate spline".to_string(),
                reason: format!("needs >= 3 paired control points, got {}/{}", n, dst.len()),
            });
        }

        let mut a = vec![vec![0.0f64; n + 3]; n + 3];
        for i in 0..n {
            for j in 0..n {
                let dx = f64::from(src[i][0]) - f64::from(src[j][0]);
                let dy = f64::from(src[i][1]) - f64::from(src[j][1]);
                a[i][j] = tps_kernel(dx * dx + dy * dy);
            }
            a[i][n] = 1.0;
            a[i][n + 1] = f64::from(src[i][0]);
            a[i][n + 2] = f64::from(src[i][1]);
            a[n][i] = 1.0;
            a[n + 1][i] = f64::from(src[i][0]);
            a[n + 2][i] = f64::from(src[i][1]);
        }

        let mut bx = vec![0.0f64; n + 3];
        let mut by = vec![0.0f64; n + 3];
        for i in 0..n {
            bx[i] = f64::from(dst[i][0]);
            by[i] = f64::from(dst[i][1]);
        }

        let wx = solve_linear(a.clone(), bx)?;
        let wy = solve_linear(a, by)?;
        Ok(Self {
            control: src.to_vec(),
            wx,
            wy,
        })
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let n = self.control.len();
        let (xf, yf) = (f64::from(x), f64::from(y));
        let mut fx = self.wx[n] + self.wx[n + 1] * xf + self.wx[n + 2] * yf;
        let mut fy = self.wy[n] + self.wy[n + 1] * xf + self.wy[n + 2] * yf;
        for (i, p) in self.control.iter().enumerate() {
            let dx = xf - f64::from(p[0]);
            let dy = yf - f64::from(p[1]);
            let u = tps_kernel(dx * dx + dy * dy);
            fx += self.wx[i] * u;
            fy += self.wy[i] * u;
        }
        (fx as f32, fy as f32)
    }
}

/// Gaussian elimination with partial pivoting. The systems here are at most
/// (n + 3) × (n + 3) with n = 4 control points, so a dense solve is plenty.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let mut pivot = col;
        for row in col + 1..n {
            if a[row][col].abs() > a[pivot][col].abs() {
                pivot = row;
            }
        }
        if a[pivot][col].abs() < 1e-10 {
            return Err(SalObjError::Validation {
                field: "correspondence system".to_string(),
                reason: "degenerate control points (singular system)".to_string(),
            });
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        let pivot_row = a[col].clone();
        let pivot_b = b[col];
        for row in col + 1..n {
            let factor = a[row][col] / pivot_row[col];
            for k in col..n {
                let delta = factor * pivot_row[k];
                a[row][k] -= delta;
            }
            b[row] -= factor * pivot_b;
        }
    }

    let mut x = vec![0.0f64; n];
    for row in (0..n).rev() {
        let mut acc = b[row];
        for k in row + 1..n {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    Ok(x)
}

/// Backward affine warp: `map` sends output coordinates to source
/// coordinates. Output size equals input size.
pub fn warp_affine(src: &Array3<f32>, map: &Affine2, border: Border) -> Array3<f32> {
    warp_with(src, |x, y| map.apply(x, y), border)
}

/// Backward projective warp, same contract as [`warp_affine`].
pub fn warp_projective(src: &Array3<f32>, map: &Homography, border: Border) -> Array3<f32> {
    warp_with(src, |x, y| map.apply(x, y), border)
}

/// Backward thin-plate-spline warp, same contract as [`warp_affine`].
pub fn warp_tps(src: &Array3<f32>, map: &ThinPlateSpline, border: Border) -> Array3<f32> {
    warp_with(src, |x, y| map.apply(x, y), border)
}

/// Correlates every channel with `kernel` (anchor at the kernel center),
/// reading past the edges with reflect-101.
pub fn convolve_same(src: &Array3<f32>, kernel: &ArrayView2<'_, f32>) -> Array3<f32> {
    let (h, w, c) = src.dim();
    let (kh, kw) = kernel.dim();
    let (ay, ax) = (kh as isize / 2, kw as isize / 2);

    let planes: Vec<Array2<f32>> = (0..c)
        .into_par_iter()
        .map(|ch| {
            let plane = src.index_axis(Axis(2), ch);
            Array2::from_shape_fn((h, w), |(y, x)| {
                let mut acc = 0.0;
                for ky in 0..kh {
                    for kx in 0..kw {
                        let sy = y as isize + ky as isize - ay;
                        let sx = x as isize + kx as isize - ax;
                        acc += kernel[[ky, kx]] * fetch(&plane, sy, sx, Border::Reflect);
                    }
                }
                acc
            })
        })
        .collect();
    let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
    ndarray::stack(Axis(2), &views).expect("channel planes share one shape")
}

/// Min–max rescale into `[lo, hi]`. A near-constant array is returned
/// unchanged; rescaling it would divide by zero.
pub fn minmax_rescale<F: Float>(arr: &Array3<F>, lo: F, hi: F) -> Array3<F> {
    let mut min = F::infinity();
    let mut max = F::neg_infinity();
    for &v in arr.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    let eps = F::from(1e-6).unwrap_or_else(F::epsilon);
    if range <= eps {
        return arr.clone();
    }
    arr.mapv(|v| (v - min) / range * (hi - lo) + lo)
}
