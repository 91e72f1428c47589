//! # Semi-global block matching
//!
//! This module provides a semi-global block matcher in the style of Hirschmüller's
//! ("Stereo Processing by Semiglobal Matching and Mutual Information")[https://core.ac.uk/download/pdf/11134866.pdf],
//! using block aggregated Birchfield-Tomasi costs on Sobel pre-filtered images.
//!
//! The same matcher computes the right-based map by mirroring both views, so the left-based and
//! right-based maps share their parameters exactly.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::time::Instant;

use image::imageops;
use imageproc::gradients::horizontal_sobel;
use serde::Deserialize;

use crate::disparity::{DisparityAlgorithm, DisparityMap, DISP_SCALE, DISP_SHIFT};
use crate::error::*;
use crate::frame::Plane;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Channel count used when scaling the smoothness penalties.
///
/// Grayscale input is still penalised as if it had three channels.
const PENALTY_CHANNELS: u32 = 3;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct SemiGlobalMatcher {
    params: Params,
    base: BaseView
}

#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub min_disparity: i32,
    pub num_disparities: u32,
    pub block_size: u32,

    /// Penalty for a disparity change of one pixel between neighbours.
    pub p1: u32,

    /// Penalty for larger disparity changes between neighbours.
    pub p2: u32,

    /// Maximum difference between the left-based and the internal right-based disparity, in
    /// whole pixels. Negative values disable the check.
    pub disp12_max_diff: i32,
    pub pre_filter_cap: i32,

    /// Margin, in percent, by which the best cost must beat every non-adjacent candidate.
    pub uniqueness_ratio: u32,
    pub speckle_window_size: u32,

    /// Maximum disparity step within a connected region, in whole pixels.
    pub speckle_range: u32,
    pub mode: Mode
}

/// The set of scanline directions aggregated.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Left to right, right to left and top to bottom.
    ThreeWay,
    /// `ThreeWay` plus bottom to top.
    FourWay,
    /// All horizontal, vertical and diagonal directions.
    EightWay
}

/// The view whose pixel grid the output map is aligned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseView {
    Left,
    Right
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Params {
    /// The reference parameter set for a search range of `num_disparities` pixels.
    pub fn with_num_disparities(num_disparities: u32) -> Self {
        let block_size = 3;
        let area = block_size * block_size;

        Self {
            min_disparity: 0,
            num_disparities,
            block_size,
            p1: 8 * PENALTY_CHANNELS * area,
            p2: 32 * PENALTY_CHANNELS * area,
            disp12_max_diff: 12,
            pre_filter_cap: 63,
            uniqueness_ratio: 10,
            speckle_window_size: 64,
            speckle_range: 2,
            mode: Mode::ThreeWay
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_disparities == 0 || self.num_disparities % 16 != 0 {
            return Err(Error::Configuration(format!(
                "num_disparities must be a positive multiple of 16, got {}",
                self.num_disparities
            )));
        }
        if self.block_size == 0 || self.block_size % 2 == 0 {
            return Err(Error::Configuration(format!(
                "block_size must be odd, got {}",
                self.block_size
            )));
        }
        if self.p2 <= self.p1 {
            return Err(Error::Configuration(format!(
                "p2 ({}) must be greater than p1 ({})",
                self.p2,
                self.p1
            )));
        }
        if self.pre_filter_cap <= 0 || self.pre_filter_cap > 127 {
            return Err(Error::Configuration(format!(
                "pre_filter_cap must be within 1..=127, got {}",
                self.pre_filter_cap
            )));
        }

        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::with_num_disparities(16)
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::ThreeWay
    }
}

impl Mode {
    fn directions(&self) -> &'static [(isize, isize)] {
        match self {
            Mode::ThreeWay => &[(1, 0), (-1, 0), (0, 1)],
            Mode::FourWay => &[(1, 0), (-1, 0), (0, 1), (0, -1)],
            Mode::EightWay => &[
                (1, 0), (-1, 0), (0, 1), (0, -1),
                (1, 1), (-1, 1), (1, -1), (-1, -1)
            ]
        }
    }
}

impl SemiGlobalMatcher {
    /// Create a left-based matcher with the given parameters.
    pub fn new(params: Params) -> Self {
        Self {
            params,
            base: BaseView::Left
        }
    }

    /// Create the matching right-based matcher.
    ///
    /// It must be called as `compute(right, left)` and yields disparities in
    /// `-(min_disparity + num_disparities - 1)..=-min_disparity`.
    pub fn right_matcher(&self) -> Self {
        Self {
            params: self.params.clone(),
            base: BaseView::Right
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn base(&self) -> BaseView {
        self.base
    }
}

impl DisparityAlgorithm for SemiGlobalMatcher {
    fn compute(&mut self, base: &Plane, matched: &Plane) -> Result<DisparityMap> {
        self.params.validate()?;

        if base.dimensions() != matched.dimensions() {
            return Err(Error::Shape {
                rows: matched.height(),
                cols: matched.width(),
                format: "MONO8",
                expected: (base.width() * base.height()) as usize,
                actual: (matched.width() * matched.height()) as usize
            });
        }

        let start = Instant::now();

        let map = match self.base {
            BaseView::Left => match_planes(base, matched, &self.params),
            BaseView::Right => {
                let mirrored = match_planes(
                    &imageops::flip_horizontal(base),
                    &imageops::flip_horizontal(matched),
                    &self.params
                );
                mirror_and_negate(&mirrored)
            }
        };

        log::debug!(
            "{:?}-based disparity of {}x{} computed in {:?} ({:.1}% valid)",
            self.base,
            base.width(),
            base.height(),
            start.elapsed(),
            map.valid_fraction() * 100.0
        );

        Ok(map)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Left-based matching of `left` against `right`.
fn match_planes(left: &Plane, right: &Plane, params: &Params) -> DisparityMap {
    let (width, height) = left.dimensions();
    let w = width as usize;
    let h = height as usize;
    let nd = params.num_disparities as usize;

    // ---- PRE FILTER ----

    let pre_left = pre_filter(left, params.pre_filter_cap);
    let pre_right = pre_filter(right, params.pre_filter_cap);

    // ---- MATCHING COST ----

    let pixel_cost = pixel_costs(
        left.as_raw(),
        right.as_raw(),
        &pre_left,
        &pre_right,
        w,
        h,
        params
    );
    let cost = block_sum(&pixel_cost, w, h, nd, (params.block_size / 2) as usize);

    // ---- PATH AGGREGATION ----

    let mut sum = vec![0u32; w * h * nd];
    for &dir in params.mode.directions() {
        aggregate_path(&cost, w, h, nd, dir, params.p1, params.p2, &mut sum);
    }

    // ---- DISPARITY SELECTION ----

    let mut map = select_disparities(&sum, w, h, params);

    // ---- POST FILTER ----

    map.filter_speckles(
        params.speckle_window_size,
        params.speckle_range as i32 * DISP_SCALE
    );

    map
}

/// Horizontal Sobel response clipped to `[-cap, cap]` and shifted to `[0, 2 * cap]`.
fn pre_filter(plane: &Plane, cap: i32) -> Vec<u8> {
    horizontal_sobel(plane)
        .as_raw()
        .iter()
        .map(|&g| (i32::from(g).max(-cap).min(cap) + cap) as u8)
        .collect()
}

/// Per row minimum and maximum of each sample and its half-way values to both neighbours.
fn half_sample_bounds(row: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let n = row.len();
    let mut lo = vec![0u8; n];
    let mut hi = vec![0u8; n];

    for x in 0..n {
        let v = i32::from(row[x]);
        let prev = i32::from(row[x.saturating_sub(1)]);
        let next = i32::from(row[(x + 1).min(n - 1)]);
        let a = (v + prev) / 2;
        let b = (v + next) / 2;

        lo[x] = v.min(a).min(b) as u8;
        hi[x] = v.max(a).max(b) as u8;
    }

    (lo, hi)
}

/// Birchfield-Tomasi sampling insensitive dissimilarity.
#[inline]
fn bt_cost(l: u8, l_lo: u8, l_hi: u8, r: u8, r_lo: u8, r_hi: u8) -> u16 {
    let (l, l_lo, l_hi) = (i32::from(l), i32::from(l_lo), i32::from(l_hi));
    let (r, r_lo, r_hi) = (i32::from(r), i32::from(r_lo), i32::from(r_hi));

    let d1 = 0.max(l - r_hi).max(r_lo - l);
    let d2 = 0.max(r - l_hi).max(l_lo - r);

    d1.min(d2) as u16
}

/// Matching cost volume laid out as `[(y * w + x) * nd + d]`.
///
/// Candidates which fall off the left edge of the matched view get the largest cost a pixel can
/// reach.
fn pixel_costs(
    raw_left: &[u8],
    raw_right: &[u8],
    pre_left: &[u8],
    pre_right: &[u8],
    w: usize,
    h: usize,
    params: &Params
) -> Vec<u16> {
    let nd = params.num_disparities as usize;
    let max_cost = (2 * params.pre_filter_cap + 255 / 4) as u16;
    let mut cost = vec![max_cost; w * h * nd];

    for y in 0..h {
        let row = y * w..(y + 1) * w;
        let (pl_lo, pl_hi) = half_sample_bounds(&pre_left[row.clone()]);
        let (pr_lo, pr_hi) = half_sample_bounds(&pre_right[row.clone()]);
        let (rl_lo, rl_hi) = half_sample_bounds(&raw_left[row.clone()]);
        let (rr_lo, rr_hi) = half_sample_bounds(&raw_right[row.clone()]);

        for x in 0..w {
            let l = y * w + x;

            for k in 0..nd {
                let xr = x as i64 - (params.min_disparity as i64 + k as i64);
                if xr < 0 || xr >= w as i64 {
                    continue;
                }
                let xr = xr as usize;
                let r = y * w + xr;

                let grad = bt_cost(
                    pre_left[l], pl_lo[x], pl_hi[x],
                    pre_right[r], pr_lo[xr], pr_hi[xr]
                );
                let intensity = bt_cost(
                    raw_left[l], rl_lo[x], rl_hi[x],
                    raw_right[r], rr_lo[xr], rr_hi[xr]
                );

                cost[l * nd + k] = grad + (intensity >> 2);
            }
        }
    }

    cost
}

/// Sum each cost over a `(2 * half + 1)` square window, clamping at the image border.
fn block_sum(cost: &[u16], w: usize, h: usize, nd: usize, half: usize) -> Vec<u16> {
    if half == 0 {
        return cost.to_vec();
    }

    // Horizontal then vertical pass
    let mut horiz = vec![0u32; w * h * nd];
    for y in 0..h {
        for x in 0..w {
            let out = (y * w + x) * nd;
            for i in x.saturating_sub(half)..=(x + half).min(w - 1) {
                let src = (y * w + i) * nd;
                for k in 0..nd {
                    horiz[out + k] += u32::from(cost[src + k]);
                }
            }
        }
    }

    let mut block = vec![0u16; w * h * nd];
    for y in 0..h {
        for x in 0..w {
            let out = (y * w + x) * nd;
            for j in y.saturating_sub(half)..=(y + half).min(h - 1) {
                let src = (j * w + x) * nd;
                for k in 0..nd {
                    let acc = u32::from(block[out + k]) + horiz[src + k];
                    block[out + k] = acc.min(u32::from(u16::MAX)) as u16;
                }
            }
        }
    }

    block
}

/// Accumulate the path cost along direction `(dx, dy)` into `sum`.
///
/// `L(p, d) = C(p, d) + min(L(p-r, d), L(p-r, d±1) + P1, min_k L(p-r, k) + P2) - min_k L(p-r, k)`
#[allow(clippy::too_many_arguments)]
fn aggregate_path(
    cost: &[u16],
    w: usize,
    h: usize,
    nd: usize,
    (dx, dy): (isize, isize),
    p1: u32,
    p2: u32,
    sum: &mut [u32]
) {
    let rows: Vec<usize> = match dy < 0 {
        true => (0..h).rev().collect(),
        false => (0..h).collect()
    };
    let cols: Vec<usize> = match dx < 0 {
        true => (0..w).rev().collect(),
        false => (0..w).collect()
    };

    // Path costs of the previous and the current row
    let mut prev_row = vec![0u32; w * nd];
    let mut cur_row = vec![0u32; w * nd];
    let mut pred = vec![0u32; nd];

    for (row_idx, &y) in rows.iter().enumerate() {
        for &x in &cols {
            let px = x as isize - dx;
            let has_pred = px >= 0 && px < w as isize && (dy == 0 || row_idx > 0);

            if has_pred {
                let px = px as usize;
                let src = match dy == 0 {
                    true => &cur_row[px * nd..(px + 1) * nd],
                    false => &prev_row[px * nd..(px + 1) * nd]
                };
                pred.copy_from_slice(src);
            }

            let c = &cost[(y * w + x) * nd..(y * w + x + 1) * nd];
            let out = &mut cur_row[x * nd..(x + 1) * nd];

            if has_pred {
                let min_prev = pred.iter().copied().fold(u32::MAX, u32::min);

                for d in 0..nd {
                    let mut best = pred[d].min(min_prev + p2);
                    if d > 0 {
                        best = best.min(pred[d - 1] + p1);
                    }
                    if d + 1 < nd {
                        best = best.min(pred[d + 1] + p1);
                    }

                    out[d] = u32::from(c[d]) + best - min_prev;
                }
            }
            else {
                for d in 0..nd {
                    out[d] = u32::from(c[d]);
                }
            }

            let acc = &mut sum[(y * w + x) * nd..(y * w + x + 1) * nd];
            for d in 0..nd {
                acc[d] += out[d];
            }
        }

        std::mem::swap(&mut prev_row, &mut cur_row);
    }
}

/// Winner-take-all selection with uniqueness check, subpixel refinement and the internal
/// left-right check.
fn select_disparities(sum: &[u32], w: usize, h: usize, params: &Params) -> DisparityMap {
    let nd = params.num_disparities as usize;
    let min_d = params.min_disparity;
    let mut map = DisparityMap::new(w as u32, h as u32, min_d, params.num_disparities);
    let invalid = map.invalid_value();

    // Only columns whose whole search range lies inside the matched view are estimated
    let min_x = (min_d + nd as i32).max(0) as usize;
    let max_x = (w as i32 + min_d.min(0)).max(0) as usize;

    let mut disp2 = vec![0i32; w];
    let mut disp2_cost = vec![0u32; w];

    for y in 0..h {
        for v in disp2.iter_mut() {
            *v = min_d - 1;
        }
        for c in disp2_cost.iter_mut() {
            *c = u32::MAX;
        }

        for x in min_x..max_x.max(min_x) {
            let s = &sum[(y * w + x) * nd..(y * w + x + 1) * nd];

            let mut best = 0usize;
            for k in 1..nd {
                if s[k] < s[best] {
                    best = k;
                }
            }
            let min_s = u64::from(s[best]);

            // Reject if any non-adjacent candidate is within the uniqueness margin
            let ambiguous = (0..nd).any(|k| {
                (k as isize - best as isize).abs() > 1
                    && u64::from(s[k]) * u64::from(100 - params.uniqueness_ratio.min(100))
                        < min_s * 100
            });
            if ambiguous {
                continue;
            }

            let xr = x as i32 - min_d - best as i32;
            if xr >= 0 && (xr as usize) < w && disp2_cost[xr as usize] > s[best] {
                disp2_cost[xr as usize] = s[best];
                disp2[xr as usize] = min_d + best as i32;
            }

            let scaled = match best > 0 && best + 1 < nd {
                true => {
                    let prev = i64::from(s[best - 1]);
                    let next = i64::from(s[best + 1]);
                    let cur = i64::from(s[best]);
                    let denom2 = (prev + next - 2 * cur).max(1);
                    best as i64 * DISP_SCALE as i64
                        + ((prev - next) * DISP_SCALE as i64 + denom2) / (denom2 * 2)
                },
                false => best as i64 * DISP_SCALE as i64
            };

            map.put(
                x as u32,
                y as u32,
                (scaled + i64::from(min_d) * DISP_SCALE as i64) as i16
            );
        }

        if params.disp12_max_diff < 0 {
            continue;
        }

        for x in min_x..max_x.max(min_x) {
            let d1 = i32::from(map.get(x as u32, y as u32));
            if d1 == i32::from(invalid) {
                continue;
            }

            let floor_d = d1 >> DISP_SHIFT;
            let ceil_d = (d1 + DISP_SCALE - 1) >> DISP_SHIFT;
            let floor_x = x as i32 - floor_d;
            let ceil_x = x as i32 - ceil_d;

            let inconsistent = |xr: i32, d: i32| {
                xr >= 0
                    && (xr as usize) < w
                    && disp2[xr as usize] >= min_d
                    && (disp2[xr as usize] - d).abs() > params.disp12_max_diff
            };

            if inconsistent(floor_x, floor_d) && inconsistent(ceil_x, ceil_d) {
                map.put(x as u32, y as u32, invalid);
            }
        }
    }

    map
}

/// Mirror a map computed on flipped views back and negate its disparities.
fn mirror_and_negate(mirrored: &DisparityMap) -> DisparityMap {
    let (width, height) = mirrored.dimensions();
    let min_disparity = -(mirrored.min_disparity() + mirrored.num_disparities() as i32 - 1);
    let mut map = DisparityMap::new(width, height, min_disparity, mirrored.num_disparities());
    let invalid = map.invalid_value();

    for y in 0..height {
        for x in 0..width {
            let val = mirrored.get(width - 1 - x, y);
            let out = match mirrored.is_valid(val) {
                true => -val,
                false => invalid
            };
            map.put(x, y, out);
        }
    }

    map
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn texture(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let mut v = x
                .wrapping_mul(73_856_093)
                ^ y.wrapping_mul(19_349_663)
                ^ seed.wrapping_mul(83_492_791);
            v ^= v >> 13;
            v = v.wrapping_mul(0x5bd1_e995);
            v ^= v >> 15;
            Luma([(v & 0xff) as u8])
        })
    }

    /// Shift `src` right by `d` pixels, filling the vacated columns from `fill`.
    fn shifted(src: &GrayImage, fill: &GrayImage, d: u32) -> GrayImage {
        GrayImage::from_fn(src.width(), src.height(), |x, y| match x >= d {
            true => *src.get_pixel(x - d, y),
            false => *fill.get_pixel(x, y)
        })
    }

    #[test]
    fn reference_penalties() {
        let params = Params::default();

        assert_eq!(params.p1, 216);
        assert_eq!(params.p2, 864);
        assert_eq!(params.block_size, 3);
        assert_eq!(params.num_disparities, 16);
    }

    #[test]
    fn rejects_range_not_multiple_of_16() {
        let mut matcher = SemiGlobalMatcher::new(Params::with_num_disparities(20));
        let img = texture(32, 8, 1);

        assert!(matches!(matcher.compute(&img, &img), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_mismatched_views() {
        let mut matcher = SemiGlobalMatcher::new(Params::default());

        assert!(matches!(
            matcher.compute(&texture(32, 8, 1), &texture(31, 8, 1)),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn uniform_shift_is_recovered_by_both_matchers() {
        let scene = texture(64, 32, 7);
        let fill = texture(64, 32, 8);
        // The right view sees the scene 5 pixels further left
        let left = shifted(&scene, &fill, 5);
        let right = scene;

        let mut matcher = SemiGlobalMatcher::new(Params::default());
        let left_map = matcher.compute(&left, &right).unwrap();
        let right_map = matcher.right_matcher().compute(&right, &left).unwrap();

        let mut left_hits = 0;
        let mut right_hits = 0;
        for y in 4..28 {
            for x in 24..40 {
                if let Some(d) = left_map.get_pixels(x, y) {
                    if (d - 5.0).abs() <= 1.0 { left_hits += 1; }
                }
                if let Some(d) = right_map.get_pixels(x, y) {
                    if (d + 5.0).abs() <= 1.0 { right_hits += 1; }
                }
            }
        }

        assert!(left_hits > 24 * 16 * 8 / 10, "left hits {}", left_hits);
        assert!(right_hits > 24 * 16 * 8 / 10, "right hits {}", right_hits);
    }

    #[test]
    fn every_path_mode_recovers_a_uniform_shift() {
        let scene = texture(64, 32, 11);
        let fill = texture(64, 32, 12);
        let left = shifted(&scene, &fill, 5);
        let right = scene;

        for &mode in &[Mode::ThreeWay, Mode::FourWay, Mode::EightWay] {
            let params = Params {
                mode,
                ..Params::default()
            };
            let mut matcher = SemiGlobalMatcher::new(params);
            let map = matcher.compute(&left, &right).unwrap();

            let hits = (4..28)
                .flat_map(|y| (24..40).map(move |x| (x, y)))
                .filter(|&(x, y)| match map.get_pixels(x, y) {
                    Some(d) => (d - 5.0).abs() <= 1.0,
                    None => false
                })
                .count();

            assert_eq!(matcher.base(), BaseView::Left);
            assert!(hits > 24 * 16 * 8 / 10, "{:?} hits {}", mode, hits);
        }
    }

    #[test]
    fn right_matcher_shares_parameters() {
        let params = Params {
            mode: Mode::EightWay,
            ..Params::with_num_disparities(32)
        };
        let matcher = SemiGlobalMatcher::new(params.clone());
        let right = matcher.right_matcher();

        assert_eq!(right.base(), BaseView::Right);
        assert_eq!(right.params(), &params);
    }

    #[test]
    fn left_border_columns_are_invalid() {
        let img = texture(48, 8, 3);
        let mut matcher = SemiGlobalMatcher::new(Params::default());

        let map = matcher.compute(&img, &img).unwrap();

        for y in 0..8 {
            for x in 0..16 {
                assert_eq!(map.get(x, y), map.invalid_value());
            }
        }

        let right_map = matcher.right_matcher().compute(&img, &img).unwrap();
        for y in 0..8 {
            for x in 32..48 {
                assert_eq!(right_map.get(x, y), right_map.invalid_value());
            }
        }
    }
}
