//! # Frame sinks
//!
//! This module provides the consumers which processed frames are dispatched to: image sequences,
//! video files and a live preview window.
//!
//! A sink never interrupts acquisition. Failures while consuming a frame are logged by the sink
//! itself, only flushing at the end of a run reports an error.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

mod avi;
mod encoder;
#[cfg(feature = "video-ffmpeg")]
mod mpeg4;
mod png;
#[cfg(feature = "preview")]
mod preview;
mod video;

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{GrayImage, Rgb, RgbImage};

use crate::depth::DepthFrame;
use crate::error::*;
use crate::frame::ColorImage;

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use avi::AviWriter;
pub use encoder::{EncodedFrame, MjpegEncoder, VideoCodec, VideoEncoder};
#[cfg(feature = "video-ffmpeg")]
pub use mpeg4::Mpeg4Encoder;
pub use png::PngSequenceSink;
#[cfg(feature = "preview")]
pub use preview::PreviewSink;
pub use video::{VideoSink, DEFAULT_FPS};

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// The image streams carried by a [`DepthFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Left,
    Right,
    Color,
    Disparity,
    Heatmap
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A request, shared between sinks, to keep the next frame.
///
/// The preview window raises it on a key press and an on-demand image sequence consumes it.
#[derive(Debug, Clone, Default)]
pub struct CaptureTrigger(Arc<AtomicBool>);

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A consumer of processed frames.
pub trait FrameSink {
    /// Consume one frame. Errors are logged rather than returned.
    fn consume(&mut self, frame: &DepthFrame);

    /// Flush everything written so far.
    fn finish(&mut self) -> Result<()>;

    /// Short name used in log messages.
    fn name(&self) -> &str {
        "sink"
    }
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Stream {
    pub const ALL: [Stream; 5] = [
        Stream::Left,
        Stream::Right,
        Stream::Color,
        Stream::Disparity,
        Stream::Heatmap
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stream::Left => "left",
            Stream::Right => "right",
            Stream::Color => "color",
            Stream::Disparity => "disparity",
            Stream::Heatmap => "heatmap"
        }
    }

    /// Parse a stream from its name.
    pub fn from_name(name: &str) -> Result<Self> {
        Stream::ALL
            .iter()
            .copied()
            .find(|s| s.name() == name)
            .ok_or_else(|| Error::Configuration(format!("unknown stream \"{}\"", name)))
    }
}

impl CaptureTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear the request, returning whether one was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn consume(&mut self, frame: &DepthFrame) {
        (**self).consume(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Reorder a B, G, R image into R, G, B for encoders.
pub fn bgr_to_rgb(color: &ColorImage) -> RgbImage {
    RgbImage::from_fn(color.width(), color.height(), |x, y| {
        let px = color.get_pixel(x, y);
        Rgb([px[2], px[1], px[0]])
    })
}

/// Expand a gray image to three equal channels.
pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
