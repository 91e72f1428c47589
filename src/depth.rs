//! # Depth pipeline
//!
//! This module chains the frame demuxer, the disparity estimator and the post-filter into a single
//! per-frame processor. The matchers and the filter are created once and reused for every frame.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::time::{Duration, Instant};

use image::GrayImage;

use crate::disparity::{DisparityAlgorithm, DisparityConfig, DisparityPair};
use crate::error::*;
use crate::frame::{demux_color, ColorImage, Plane, RawFrame};
use crate::postfilter::{FilterConfig, HeatmapImage, PostFilter};
use crate::sgbm::{Params, SemiGlobalMatcher};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Everything produced from one raw frame, as handed to the sinks.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    /// Index of the dispatched frame, counting from zero.
    pub index: u64,
    pub timestamp: Duration,
    pub left: Plane,
    pub right: Plane,
    pub color: ColorImage,

    /// Filtered disparity normalised to `[0, 255]`, or `None` when disparity is disabled.
    pub disparity: Option<GrayImage>,
    pub heatmap: Option<HeatmapImage>
}

pub struct DepthPipeline {
    left_matcher: SemiGlobalMatcher,
    right_matcher: SemiGlobalMatcher,
    post_filter: PostFilter,
    compute_disparity: bool
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DepthPipeline {
    /// Create a pipeline with the reference matcher parameters for the given search range.
    pub fn new(disparity: DisparityConfig, filter: FilterConfig) -> Result<Self> {
        disparity.validate()?;

        Ok(Self::with_params(
            Params::with_num_disparities(disparity.num_disparities()),
            filter
        ))
    }

    pub fn with_params(params: Params, filter: FilterConfig) -> Self {
        let left_matcher = SemiGlobalMatcher::new(params);
        let right_matcher = left_matcher.right_matcher();
        let post_filter = PostFilter::new(left_matcher.params(), filter);

        Self {
            left_matcher,
            right_matcher,
            post_filter,
            compute_disparity: true
        }
    }

    /// A pipeline which only demuxes, for plain stereo capture.
    pub fn capture_only() -> Self {
        let mut pipeline = Self::with_params(Params::default(), FilterConfig::default());
        pipeline.compute_disparity = false;
        pipeline
    }

    pub fn computes_disparity(&self) -> bool {
        self.compute_disparity
    }

    /// Compute both disparity maps of a stereo pair.
    pub fn disparity(&mut self, left: &Plane, right: &Plane) -> Result<DisparityPair> {
        Ok(DisparityPair {
            left: self.left_matcher.compute(left, right)?,
            right: self.right_matcher.compute(right, left)?
        })
    }

    /// Process one raw frame and its color conversion into a [`DepthFrame`].
    pub fn process(&mut self, index: u64, raw: &RawFrame, bgr: &[u8]) -> Result<DepthFrame> {
        let start = Instant::now();

        let (left, right) = raw.demux()?;
        let color = demux_color(bgr, raw.rows, raw.cols)?;

        let (disparity, heatmap) = match self.compute_disparity {
            true => {
                let pair = self.disparity(&left, &right)?;
                // The guide must be the base view of the left-based map
                let (disparity, heatmap) = self.post_filter.apply(&pair.left, &pair.right, &left)?;
                (Some(disparity), Some(heatmap))
            },
            false => (None, None)
        };

        log::debug!("Frame {} processed in {:?}", index, start.elapsed());

        Ok(DepthFrame {
            index,
            timestamp: raw.timestamp,
            left,
            right,
            color,
            disparity,
            heatmap
        })
    }
}
