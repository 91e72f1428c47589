//! # General disparity objects
//!
//! This module provides generic disparity traits and structures for use by different algorithms.
//!
//! Disparities are stored as signed 16 bit fixed point values with [`DISP_SHIFT`] fractional bits,
//! so a stored value of 64 is a disparity of 4 pixels.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use crate::error::*;
use crate::frame::Plane;
use crate::sgbm::{Params, SemiGlobalMatcher};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of fractional bits in a fixed point disparity.
pub const DISP_SHIFT: u32 = 4;

/// Fixed point scale of a disparity, `1 << DISP_SHIFT`.
pub const DISP_SCALE: i32 = 1 << DISP_SHIFT;

/// The search range is `max_disparity_factor * DISPARITY_STEP` pixels.
pub const DISPARITY_STEP: u32 = 16;

/// Largest accepted `max_disparity_factor`, giving a 256 pixel search range.
pub const MAX_DISPARITY_FACTOR: u32 = 16;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A fixed point disparity map.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    data: Vec<i16>,
    width: u32,
    height: u32,

    /// Smallest disparity the producing matcher searched, in whole pixels.
    min_disparity: i32,

    /// Number of disparities the producing matcher searched.
    num_disparities: u32
}

/// The left-based and right-based disparity maps of one stereo pair.
#[derive(Debug, Clone)]
pub struct DisparityPair {
    pub left: DisparityMap,
    pub right: DisparityMap
}

/// Disparity search settings exposed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisparityConfig {
    pub max_disparity_factor: u32
}

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait DisparityAlgorithm {
    /// Compute the disparity map of `base` against `matched`.
    ///
    /// The returned map has the dimensions of `base`.
    fn compute(&mut self, base: &Plane, matched: &Plane) -> Result<DisparityMap>;
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DisparityMap {
    /// Create a map in which every pixel is invalid.
    pub fn new(width: u32, height: u32, min_disparity: i32, num_disparities: u32) -> Self {
        let invalid = ((min_disparity - 1) * DISP_SCALE) as i16;

        DisparityMap {
            data: vec![invalid; (width * height) as usize],
            width,
            height,
            min_disparity,
            num_disparities
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn min_disparity(&self) -> i32 {
        self.min_disparity
    }

    pub fn num_disparities(&self) -> u32 {
        self.num_disparities
    }

    /// The marker stored in pixels which have no reliable disparity.
    pub fn invalid_value(&self) -> i16 {
        ((self.min_disparity - 1) * DISP_SCALE) as i16
    }

    pub fn is_valid(&self, val: i16) -> bool {
        i32::from(val) >= self.min_disparity * DISP_SCALE
    }

    pub fn get(&self, x: u32, y: u32) -> i16 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn put(&mut self, x: u32, y: u32, val: i16) {
        self.data[(y * self.width + x) as usize] = val;
    }

    /// The disparity at the given pixel in pixels, or `None` if it is invalid.
    pub fn get_pixels(&self, x: u32, y: u32) -> Option<f32> {
        let val = self.get(x, y);

        if self.is_valid(val) {
            Some(f32::from(val) / DISP_SCALE as f32)
        }
        else {
            None
        }
    }

    pub fn as_raw(&self) -> &[i16] {
        &self.data
    }

    /// Fraction of pixels holding a valid disparity.
    pub fn valid_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }

        let valid = self.data.iter().filter(|&&v| self.is_valid(v)).count();
        valid as f32 / self.data.len() as f32
    }

    /// Invalidate small connected regions ("speckles").
    ///
    /// Two 4-neighbours belong to the same region when both are valid and differ by at most
    /// `max_diff` (fixed point units). Regions of at most `max_speckle_size` pixels are replaced
    /// with the invalid marker.
    pub fn filter_speckles(&mut self, max_speckle_size: u32, max_diff: i32) {
        if max_speckle_size == 0 {
            return;
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let invalid = self.invalid_value();

        // Label 0 is "unlabelled"
        let mut labels = vec![0u32; width * height];
        let mut region_is_speckle: Vec<bool> = vec![false];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..width * height {
            if labels[start] != 0 || self.data[start] == invalid {
                continue;
            }

            let label = region_is_speckle.len() as u32;
            labels[start] = label;
            stack.push(start);
            let mut count = 0u32;

            while let Some(idx) = stack.pop() {
                count += 1;
                let val = i32::from(self.data[idx]);
                let (x, y) = (idx % width, idx / width);

                let mut visit = |n: usize| {
                    if labels[n] == 0
                        && self.data[n] != invalid
                        && (i32::from(self.data[n]) - val).abs() <= max_diff
                    {
                        labels[n] = label;
                        stack.push(n);
                    }
                };

                if x > 0 { visit(idx - 1); }
                if x + 1 < width { visit(idx + 1); }
                if y > 0 { visit(idx - width); }
                if y + 1 < height { visit(idx + width); }
            }

            region_is_speckle.push(count <= max_speckle_size);
        }

        for (val, &label) in self.data.iter_mut().zip(labels.iter()) {
            if label != 0 && region_is_speckle[label as usize] {
                *val = invalid;
            }
        }
    }
}

impl DisparityConfig {
    /// Validated disparity settings.
    pub fn new(max_disparity_factor: u32) -> Result<Self> {
        let config = Self { max_disparity_factor };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_disparity_factor == 0 || self.max_disparity_factor > MAX_DISPARITY_FACTOR {
            return Err(Error::Configuration(format!(
                "max_disparity_factor must be within 1..={}, got {}",
                MAX_DISPARITY_FACTOR,
                self.max_disparity_factor
            )));
        }

        Ok(())
    }

    /// Size of the disparity search range in pixels.
    pub fn num_disparities(&self) -> u32 {
        self.max_disparity_factor * DISPARITY_STEP
    }
}

impl Default for DisparityConfig {
    fn default() -> Self {
        Self { max_disparity_factor: 1 }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Compute the left-based and right-based disparity maps of a stereo pair.
///
/// The search range is `max_disparity_factor * 16` pixels starting at zero. The right-based map
/// holds non-positive disparities.
pub fn compute_disparity(
    left: &Plane,
    right: &Plane,
    max_disparity_factor: u32
) -> Result<DisparityPair> {
    let config = DisparityConfig::new(max_disparity_factor)?;

    let mut left_matcher = SemiGlobalMatcher::new(Params::with_num_disparities(
        config.num_disparities()
    ));
    let mut right_matcher = left_matcher.right_matcher();

    Ok(DisparityPair {
        left: left_matcher.compute(left, right)?,
        right: right_matcher.compute(right, left)?
    })
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_map_is_invalid_everywhere() {
        let map = DisparityMap::new(4, 3, 0, 16);

        assert_eq!(map.invalid_value(), -16);
        assert!(map.as_raw().iter().all(|&v| !map.is_valid(v)));
        assert_eq!(map.valid_fraction(), 0.0);
        assert_eq!(map.get_pixels(1, 1), None);
    }

    #[test]
    fn right_based_invalid_marker_is_below_range() {
        let map = DisparityMap::new(2, 2, -15, 16);

        assert_eq!(map.invalid_value(), -256);
        assert!(map.is_valid(-240));
        assert!(map.is_valid(0));
        assert!(!map.is_valid(-256));
    }

    #[test]
    fn speckles_are_removed_and_large_regions_kept() {
        let mut map = DisparityMap::new(10, 10, 0, 16);
        for y in 0..10 {
            for x in 0..10 {
                map.put(x, y, 64);
            }
        }
        // A 2x2 island far from its surroundings
        for &(x, y) in &[(4, 4), (5, 4), (4, 5), (5, 5)] {
            map.put(x, y, 200);
        }

        map.filter_speckles(4, 32);

        assert_eq!(map.get(4, 4), map.invalid_value());
        assert_eq!(map.get(5, 5), map.invalid_value());
        assert_eq!(map.get(0, 0), 64);
        assert_eq!(map.get(9, 9), 64);
    }

    #[test]
    fn disparity_factor_bounds() {
        assert!(DisparityConfig::new(0).is_err());
        assert!(DisparityConfig::new(MAX_DISPARITY_FACTOR + 1).is_err());
        assert_eq!(DisparityConfig::new(4).unwrap().num_disparities(), 64);
        assert_eq!(DisparityConfig::default().num_disparities(), 16);
    }
}
