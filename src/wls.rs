//! # Weighted least squares disparity filter
//!
//! This module provides an edge-preserving disparity filter guided by the base view. Each
//! disparity is weighted by a left-right consistency confidence, and both the weighted disparity
//! and the confidence are smoothed with the fast global smoother of
//! ("Fast Global Image Smoothing Based on Weighted Least Squares")[https://doi.org/10.1109/TIP.2014.2366600].
//! Their ratio is the filtered disparity, so unreliable pixels are filled in from reliable
//! neighbours which look alike in the guide.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::time::Instant;

use crate::disparity::{DisparityMap, DISP_SCALE, DISP_SHIFT};
use crate::error::*;
use crate::frame::Plane;
use crate::sgbm::Params;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Default left-right consistency threshold, in fixed point disparity units.
pub const DEFAULT_LRC_THRESH: i32 = 24;

/// Default smoother iteration count.
pub const DEFAULT_ITERATIONS: u32 = 3;

/// Below this accumulated confidence a pixel has no support and is set to zero.
const MIN_SUPPORT: f32 = 1e-6;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Filter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WlsParams {
    /// Regularisation strength; larger values smooth more.
    pub lambda: f64,

    /// Sensitivity of the smoothing to intensity edges in the guide.
    pub sigma_color: f64,

    /// Maximum `|d_left + d_right|`, fixed point, for a pixel to be trusted.
    pub lrc_thresh: i32,

    /// Radius around disparity discontinuities in which the consistency check looks for the best
    /// matching right-based disparity.
    pub depth_discontinuity_radius: u32,

    pub iterations: u32
}

pub struct DisparityWlsFilter {
    params: WlsParams,
    confidence: Vec<f32>
}

/// Filtered disparity in pixels, one value per guide pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredDisparity {
    data: Vec<f32>,
    width: u32,
    height: u32
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for WlsParams {
    fn default() -> Self {
        Self {
            lambda: 8000.0,
            sigma_color: 3.0,
            lrc_thresh: DEFAULT_LRC_THRESH,
            depth_discontinuity_radius: 1,
            iterations: DEFAULT_ITERATIONS
        }
    }
}

impl DisparityWlsFilter {
    pub fn new(params: WlsParams) -> Self {
        Self {
            params,
            confidence: Vec::new()
        }
    }

    /// Create a filter for maps produced by a matcher with the given parameters.
    ///
    /// The discontinuity radius follows the matcher's block size.
    pub fn for_matcher(matcher: &Params, lambda: f64, sigma_color: f64) -> Self {
        Self::new(WlsParams {
            lambda,
            sigma_color,
            depth_discontinuity_radius: (0.33 * matcher.block_size as f64).ceil() as u32,
            ..WlsParams::default()
        })
    }

    pub fn params(&self) -> &WlsParams {
        &self.params
    }

    /// Confidence of each pixel in the last filtered map, in `[0, 1]`.
    pub fn confidence_map(&self) -> &[f32] {
        &self.confidence
    }

    /// Filter `disp_left` using `guide`, which must be the view `disp_left` is based on.
    ///
    /// When `disp_right` is given, pixels failing the left-right consistency check get no
    /// weight. Otherwise every valid pixel is trusted.
    pub fn filter(
        &mut self,
        disp_left: &DisparityMap,
        guide: &Plane,
        disp_right: Option<&DisparityMap>
    ) -> Result<FilteredDisparity> {
        check_dims("left", disp_left, guide)?;
        if let Some(right) = disp_right {
            check_dims("right", right, guide)?;
        }

        let start = Instant::now();
        let (width, height) = guide.dimensions();

        self.confidence = match disp_right {
            Some(right) => consistency_confidence(
                disp_left,
                right,
                self.params.lrc_thresh,
                self.params.depth_discontinuity_radius
            ),
            None => disp_left
                .as_raw()
                .iter()
                .map(|&d| if disp_left.is_valid(d) { 1.0 } else { 0.0 })
                .collect()
        };

        let mut weighted: Vec<f32> = disp_left
            .as_raw()
            .iter()
            .zip(self.confidence.iter())
            .map(|(&d, &c)| match c > 0.0 {
                true => f32::from(d) / DISP_SCALE as f32 * c,
                false => 0.0
            })
            .collect();
        let mut support = self.confidence.clone();

        let smoother = FastGlobalSmoother::new(guide, &self.params);
        smoother.smooth(&mut weighted);
        smoother.smooth(&mut support);

        let data = weighted
            .iter()
            .zip(support.iter())
            .map(|(&num, &den)| if den > MIN_SUPPORT { num / den } else { 0.0 })
            .collect();

        log::debug!(
            "WLS filtered {}x{} disparity in {:?}",
            width,
            height,
            start.elapsed()
        );

        Ok(FilteredDisparity { data, width, height })
    }
}

impl FilteredDisparity {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn as_raw(&self) -> &[f32] {
        &self.data
    }

    /// Smallest and largest value, or `None` for an empty map.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v)))
        })
    }
}

/// Separable WLS solver which alternates 1D row and column solves.
struct FastGlobalSmoother<'a> {
    guide: &'a Plane,
    lambda: f64,
    iterations: u32,

    /// Neighbour weight for each absolute guide difference.
    weights: [f64; 256]
}

impl<'a> FastGlobalSmoother<'a> {
    fn new(guide: &'a Plane, params: &WlsParams) -> Self {
        let mut weights = [0.0f64; 256];
        let sigma = params.sigma_color.max(f64::EPSILON);
        for (diff, w) in weights.iter_mut().enumerate() {
            *w = (-(diff as f64) / sigma).exp();
        }

        Self {
            guide,
            lambda: params.lambda,
            iterations: params.iterations.max(1),
            weights
        }
    }

    fn smooth(&self, data: &mut [f32]) {
        let w = self.guide.width() as usize;
        let h = self.guide.height() as usize;
        let guide = self.guide.as_raw();

        let t = self.iterations as i32;
        let mut values = Vec::with_capacity(w.max(h));
        let mut samples = Vec::with_capacity(w.max(h));

        for iter in 0..t {
            // Attenuated lambda, decreasing by 4x per iteration
            let lambda = 1.5 * self.lambda * 4f64.powi(t - iter - 1) / (4f64.powi(t) - 1.0);

            for y in 0..h {
                values.clear();
                samples.clear();
                values.extend(data[y * w..(y + 1) * w].iter().map(|&v| f64::from(v)));
                samples.extend_from_slice(&guide[y * w..(y + 1) * w]);

                self.solve(&mut values, &samples, lambda);

                for (dst, &v) in data[y * w..(y + 1) * w].iter_mut().zip(values.iter()) {
                    *dst = v as f32;
                }
            }

            for x in 0..w {
                values.clear();
                samples.clear();
                values.extend((0..h).map(|y| f64::from(data[y * w + x])));
                samples.extend((0..h).map(|y| guide[y * w + x]));

                self.solve(&mut values, &samples, lambda);

                for (y, &v) in values.iter().enumerate() {
                    data[y * w + x] = v as f32;
                }
            }
        }
    }

    /// Solve `(I + lambda * L) u = f` in place for one scanline with the Thomas algorithm.
    fn solve(&self, f: &mut [f64], guide: &[u8], lambda: f64) {
        let n = f.len();
        if n < 2 {
            return;
        }

        // Weight of the link between sample i and i + 1
        let link: Vec<f64> = guide
            .windows(2)
            .map(|p| lambda * self.weights[(i32::from(p[0]) - i32::from(p[1])).abs() as usize])
            .collect();

        let mut c_prime = vec![0.0f64; n];

        let b0 = 1.0 + link[0];
        c_prime[0] = -link[0] / b0;
        f[0] /= b0;

        for i in 1..n {
            let a = -link[i - 1];
            let right = if i < n - 1 { link[i] } else { 0.0 };
            let b = 1.0 + link[i - 1] + right;
            let m = b - a * c_prime[i - 1];

            c_prime[i] = -right / m;
            f[i] = (f[i] - a * f[i - 1]) / m;
        }

        for i in (0..n - 1).rev() {
            f[i] -= c_prime[i] * f[i + 1];
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn check_dims(map_name: &'static str, map: &DisparityMap, guide: &Plane) -> Result<()> {
    if map.dimensions() != guide.dimensions() {
        return Err(Error::Filter {
            map: map_name,
            map_width: map.width(),
            map_height: map.height(),
            guide_width: guide.width(),
            guide_height: guide.height()
        });
    }

    Ok(())
}

/// Pixels whose valid neighbourhood spans more than `thresh` fixed point units.
fn discontinuities(disp: &DisparityMap, radius: u32, thresh: i32) -> Vec<bool> {
    let (width, height) = disp.dimensions();
    let r = radius as i64;
    let mut disc = vec![false; (width * height) as usize];

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut lo = i32::MAX;
            let mut hi = i32::MIN;

            for j in (y - r).max(0)..=(y + r).min(height as i64 - 1) {
                for i in (x - r).max(0)..=(x + r).min(width as i64 - 1) {
                    let v = disp.get(i as u32, j as u32);
                    if disp.is_valid(v) {
                        lo = lo.min(i32::from(v));
                        hi = hi.max(i32::from(v));
                    }
                }
            }

            disc[(y * width as i64 + x) as usize] = lo <= hi && hi - lo > thresh;
        }
    }

    disc
}

/// Binary confidence from the left-right consistency check.
///
/// A left disparity `d` at `x` is consistent when the right-based disparity at `x - d` is close to
/// `-d`. Near discontinuities the best right-based disparity within `radius` columns is used, so
/// occlusion edges are not rejected for being a pixel off.
fn consistency_confidence(
    left: &DisparityMap,
    right: &DisparityMap,
    lrc_thresh: i32,
    radius: u32
) -> Vec<f32> {
    let (width, height) = left.dimensions();
    let disc = discontinuities(left, radius, lrc_thresh);
    let mut conf = vec![0.0f32; (width * height) as usize];

    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            let dl = left.get(x, y);
            if !left.is_valid(dl) {
                continue;
            }

            let dl = i32::from(dl);
            let xr = x as i32 - ((dl + DISP_SCALE / 2) >> DISP_SHIFT);
            let reach = if disc[idx] { radius as i32 } else { 0 };

            let best = ((xr - reach)..=(xr + reach))
                .filter(|&i| i >= 0 && i < width as i32)
                .map(|i| right.get(i as u32, y))
                .filter(|&dr| right.is_valid(dr))
                .map(|dr| (dl + i32::from(dr)).abs())
                .min();

            if let Some(diff) = best {
                if diff <= lrc_thresh {
                    conf[idx] = 1.0;
                }
            }
        }
    }

    conf
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn constant_pair(width: u32, height: u32, d: i16) -> (DisparityMap, DisparityMap) {
        let mut left = DisparityMap::new(width, height, 0, 16);
        let mut right = DisparityMap::new(width, height, -15, 16);
        for y in 0..height {
            for x in 0..width {
                left.put(x, y, d);
                right.put(x, y, -d);
            }
        }
        (left, right)
    }

    #[test]
    fn mismatched_guide_is_filter_error() {
        let (left, right) = constant_pair(8, 8, 32);
        let guide = GrayImage::new(8, 7);
        let mut filter = DisparityWlsFilter::new(WlsParams::default());

        assert!(matches!(
            filter.filter(&left, &guide, Some(&right)),
            Err(Error::Filter { map: "left", .. })
        ));
    }

    #[test]
    fn mismatched_right_map_is_filter_error() {
        let (left, _) = constant_pair(8, 8, 32);
        let (right, _) = constant_pair(9, 8, 32);
        let guide = GrayImage::new(8, 8);
        let mut filter = DisparityWlsFilter::new(WlsParams::default());

        assert!(matches!(
            filter.filter(&left, &guide, Some(&right)),
            Err(Error::Filter { map: "right", .. })
        ));
    }

    #[test]
    fn consistent_constant_map_is_preserved() {
        let (left, right) = constant_pair(16, 12, 48);
        let guide = GrayImage::from_fn(16, 12, |x, _| Luma([(x * 10) as u8]));
        let mut filter = DisparityWlsFilter::new(WlsParams::default());

        let out = filter.filter(&left, &guide, Some(&right)).unwrap();

        // Columns whose match falls off the right-based map have no confidence
        for (i, &c) in filter.confidence_map().iter().enumerate() {
            assert_eq!(c, if i % 16 < 3 { 0.0 } else { 1.0 });
        }
        for &v in out.as_raw() {
            assert!((v - 3.0).abs() < 1e-3, "value {}", v);
        }
    }

    #[test]
    fn inconsistent_pixels_are_filled_from_neighbours() {
        let (mut left, right) = constant_pair(16, 8, 32);
        left.put(8, 4, 160);
        let guide = GrayImage::from_pixel(16, 8, Luma([100]));
        let mut filter = DisparityWlsFilter::new(WlsParams::default());

        let out = filter.filter(&left, &guide, Some(&right)).unwrap();

        assert_eq!(filter.confidence_map()[(4 * 16 + 8) as usize], 0.0);
        assert!((out.get(8, 4) - 2.0).abs() < 1e-2);
    }

    #[test]
    fn smoothing_stops_at_guide_edges() {
        let mut left = DisparityMap::new(20, 4, 0, 16);
        let right = DisparityMap::new(20, 4, -15, 16);
        for y in 0..4 {
            for x in 0..20 {
                left.put(x, y, if x < 10 { 16 } else { 160 });
            }
        }
        let guide = GrayImage::from_fn(20, 4, |x, _| Luma([if x < 10 { 20 } else { 220 }]));
        let mut filter = DisparityWlsFilter::new(WlsParams::default());

        // Without a right map every valid pixel is trusted
        let out = filter.filter(&left, &guide, None).unwrap();

        assert!((out.get(2, 1) - 1.0).abs() < 0.05);
        assert!((out.get(17, 1) - 10.0).abs() < 0.05);
    }
}
