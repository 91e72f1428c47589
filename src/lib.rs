//! # Stereo depth camera
//!
//! This crate provides live depth estimation for a dual imager stereo camera. Raw interleaved
//! frames are split into left and right planes, matched with semi-global block matching, smoothed
//! with an edge-aware weighted least squares filter and handed to output sinks as a normalised
//! disparity image and a jet heatmap.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod depth;
mod disparity;
mod error;
pub mod frame;
pub mod pipeline;
pub mod postfilter;
pub mod sgbm;
pub mod sink;
pub mod wls;

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use disparity::{
    compute_disparity, DisparityConfig, DisparityMap, DisparityPair, DISPARITY_STEP, DISP_SCALE,
    DISP_SHIFT, MAX_DISPARITY_FACTOR
};
pub use error::{Error, Result};

pub mod prelude {
    pub use crate::acquisition::{AcquisitionLoop, CancelToken, LoopEvent, LoopStats, RetryPolicy};
    pub use crate::camera::{Camera, Format7Info, Format7Settings, SyntheticCamera};
    pub use crate::depth::{DepthFrame, DepthPipeline};
    pub use crate::disparity::{DisparityAlgorithm, DisparityConfig, DisparityMap};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{PixelFormat, RawFrame};
    pub use crate::pipeline::PipelinedLoop;
    pub use crate::postfilter::FilterConfig;
    pub use crate::sink::FrameSink;
}
