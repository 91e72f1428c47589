//! # Disparity post-filtering and visualisation
//!
//! This module turns a pair of raw disparity maps into a displayable 8 bit disparity image and a
//! jet colored heatmap.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::disparity::DisparityMap;
use crate::error::*;
use crate::frame::Plane;
use crate::sgbm::Params;
use crate::wls::{DisparityWlsFilter, FilteredDisparity};

#[cfg(feature = "statistics")]
use plotters::prelude::*;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_LAMBDA: f64 = 8000.0;
pub const DEFAULT_SIGMA_COLOR: f64 = 3.0;

/// Value of every pixel of a normalised map whose input was constant.
pub const CONSTANT_LEVEL: u8 = 128;

/// A filtered map whose values spread less than this, in pixels, is treated as constant.
const CONSTANT_SPREAD: f32 = 1e-3;

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// A jet colored disparity visualisation.
pub type HeatmapImage = RgbImage;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Settings of the post-filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub lambda: f64,
    pub sigma_color: f64
}

/// Reusable WLS filter, normaliser and colormap.
pub struct PostFilter {
    wls: DisparityWlsFilter
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lambda: DEFAULT_LAMBDA,
            sigma_color: DEFAULT_SIGMA_COLOR
        }
    }
}

impl PostFilter {
    /// Create a post-filter for maps produced by a matcher with the given parameters.
    pub fn new(matcher: &Params, config: FilterConfig) -> Self {
        Self {
            wls: DisparityWlsFilter::for_matcher(matcher, config.lambda, config.sigma_color)
        }
    }

    /// Filter, normalise and colorize a disparity pair.
    ///
    /// `guide` must be the base view of `disp_left`, i.e. the left plane.
    pub fn apply(
        &mut self,
        disp_left: &DisparityMap,
        disp_right: &DisparityMap,
        guide: &Plane
    ) -> Result<(GrayImage, HeatmapImage)> {
        let filtered = self.wls.filter(disp_left, guide, Some(disp_right))?;

        let normalized = normalize_min_max(&filtered);
        let heatmap = apply_jet(&normalized);

        #[cfg(feature = "statistics")]
        plot_histogram(&normalized)?;

        Ok((normalized, heatmap))
    }

    /// Confidence map of the last filtered pair.
    pub fn confidence_map(&self) -> &[f32] {
        self.wls.confidence_map()
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Smooth `disp_left` guided by `guide`, normalise it to `[0, 255]` and colorize it.
///
/// `disp_right` is the right-based map of the same pair and is only used to weight pixels by
/// left-right consistency.
pub fn filter_and_colorize(
    disp_left: &DisparityMap,
    disp_right: &DisparityMap,
    guide: &Plane,
    lambda: f64,
    sigma_color: f64
) -> Result<(GrayImage, HeatmapImage)> {
    let params = Params::with_num_disparities(disp_left.num_disparities());

    PostFilter::new(&params, FilterConfig { lambda, sigma_color })
        .apply(disp_left, disp_right, guide)
}

/// Min-max normalise a filtered map to `[0, 255]`.
///
/// A constant map becomes a uniform image at [`CONSTANT_LEVEL`].
pub fn normalize_min_max(filtered: &FilteredDisparity) -> GrayImage {
    let (width, height) = (filtered.width(), filtered.height());

    let (lo, hi) = match filtered.min_max() {
        Some(range) => range,
        None => return GrayImage::new(width, height)
    };

    if hi - lo < CONSTANT_SPREAD {
        return GrayImage::from_pixel(width, height, Luma([CONSTANT_LEVEL]));
    }

    let scale = 255.0 / (hi - lo);
    let data = filtered
        .as_raw()
        .iter()
        .map(|&v| ((v - lo) * scale).round().max(0.0).min(255.0) as u8)
        .collect();

    // Buffer length always matches the map dimensions
    GrayImage::from_raw(width, height, data)
        .unwrap_or_else(|| GrayImage::new(width, height))
}

/// Jet colormap: 0 is dark blue, 255 dark red, passing through cyan, green and yellow.
pub fn jet(val: u8) -> Rgb<u8> {
    let v = f32::from(val) / 255.0;
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).max(0.0).min(1.0);
        (c * 255.0).round() as u8
    };

    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Color every pixel of a normalised map with [`jet`].
pub fn apply_jet(normalized: &GrayImage) -> HeatmapImage {
    let lut: Vec<Rgb<u8>> = (0..=255u8).map(jet).collect();

    let mut heatmap = RgbImage::new(normalized.width(), normalized.height());
    for (out, px) in heatmap.pixels_mut().zip(normalized.pixels()) {
        *out = lut[px[0] as usize];
    }

    heatmap
}

#[cfg(feature = "statistics")]
fn plot_histogram(normalized: &GrayImage) -> Result<()> {
    let mut hist = vec![0usize; 256];
    for px in normalized.pixels() {
        hist[px[0] as usize] += 1;
    }
    let peak = hist.iter().copied().max().unwrap_or(0).max(1);

    std::fs::create_dir_all("plots/postfilter")?;
    let area = BitMapBackend::new(
        "plots/postfilter/disparity_hist.png",
        (800, 600)
    ).into_drawing_area();
    area.fill(&WHITE).map_err(|e| Error::Statistics(e.to_string()))?;

    let mut chart = ChartBuilder::on(&area)
        .caption("Normalised disparity histogram", ("sans-serif", 20).into_font())
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_ranged(0usize..256usize, 0usize..peak)
        .map_err(|e| Error::Statistics(e.to_string()))?;

    chart.configure_mesh().draw().map_err(|e| Error::Statistics(e.to_string()))?;

    chart
        .draw_series(LineSeries::new(
            hist.into_iter().enumerate(),
            &RED
        ))
        .map_err(|e| Error::Statistics(e.to_string()))?;

    Ok(())
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_pair(width: u32, height: u32) -> (DisparityMap, DisparityMap, GrayImage) {
        let mut left = DisparityMap::new(width, height, 0, 16);
        let mut right = DisparityMap::new(width, height, -15, 16);
        for y in 0..height {
            for x in 0..width {
                let d = if x < width / 2 { 16 } else { 96 };
                left.put(x, y, d);
            }
        }
        for y in 0..height {
            for x in 0..width {
                let xl = (0..width).find(|&xl| {
                    let d = i32::from(left.get(xl, y)) / 16;
                    xl as i32 - d == x as i32
                });
                if let Some(xl) = xl {
                    right.put(x, y, -left.get(xl, y));
                }
            }
        }
        let guide = GrayImage::from_fn(width, height, |x, _| {
            Luma([if x < width / 2 { 30 } else { 200 }])
        });

        (left, right, guide)
    }

    #[test]
    fn jet_endpoints_and_midpoint() {
        let low = jet(0);
        let mid = jet(128);
        let high = jet(255);

        assert!(low[2] > low[0] && low[2] > low[1]);
        assert!(mid[1] > mid[0] && mid[1] > mid[2]);
        assert!(high[0] > high[1] && high[0] > high[2]);
    }

    fn hue(px: Rgb<u8>) -> f32 {
        let (r, g, b) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
        let max = r.max(g).max(b);
        let delta = max - r.min(g).min(b);

        if delta == 0.0 {
            0.0
        }
        else if max == r {
            (60.0 * (g - b) / delta).rem_euclid(360.0)
        }
        else if max == g {
            60.0 * (b - r) / delta + 120.0
        }
        else {
            60.0 * (r - g) / delta + 240.0
        }
    }

    #[test]
    fn jet_hue_runs_from_blue_to_red() {
        assert_eq!(hue(jet(0)), 240.0);
        assert_eq!(hue(jet(255)), 0.0);

        for v in 1..=255u8 {
            assert!(hue(jet(v)) <= hue(jet(v - 1)) + 1e-3, "hue rises at {}", v);
        }
    }

    #[test]
    fn normalisation_spans_full_range() {
        let (left, right, guide) = ramp_pair(32, 8);

        let (normalized, _) = filter_and_colorize(&left, &right, &guide, 8000.0, 3.0).unwrap();

        let min = normalized.pixels().map(|p| p[0]).min().unwrap();
        let max = normalized.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn constant_disparity_gives_midpoint() {
        let mut left = DisparityMap::new(24, 6, 0, 16);
        let mut right = DisparityMap::new(24, 6, -15, 16);
        for y in 0..6 {
            for x in 0..24 {
                left.put(x, y, 32);
                right.put(x, y, -32);
            }
        }
        let guide = GrayImage::from_fn(24, 6, |x, y| Luma([(x * 7 + y * 3) as u8]));

        let (normalized, heatmap) =
            filter_and_colorize(&left, &right, &guide, 8000.0, 3.0).unwrap();

        assert!(normalized.pixels().all(|p| p[0] == CONSTANT_LEVEL));
        assert!(heatmap.pixels().all(|p| *p == jet(CONSTANT_LEVEL)));
    }

    #[test]
    fn output_is_deterministic() {
        let (left, right, guide) = ramp_pair(40, 10);

        let a = filter_and_colorize(&left, &right, &guide, 8000.0, 3.0).unwrap();
        let b = filter_and_colorize(&left, &right, &guide, 8000.0, 3.0).unwrap();

        assert_eq!(a.0.as_raw(), b.0.as_raw());
        assert_eq!(a.1.as_raw(), b.1.as_raw());
    }
}
