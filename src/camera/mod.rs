//! # Camera collaborator
//!
//! This module provides the interface the acquisition loop drives a stereo camera through. Vendor
//! SDK bindings implement [`Camera`]; the crate ships a [`SyntheticCamera`] which renders a
//! deterministic stereo scene, for tests and for running without hardware.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

mod synthetic;

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fmt;

use crate::error::*;
use crate::frame::{PixelFormat, RawFrame};

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use synthetic::{SyntheticCamera, SyntheticConfig};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// The Format7 mode delivering both imagers in one raw buffer.
pub const STEREO_MODE: u32 = 3;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Region-of-interest capabilities reported by the camera for one Format7 mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format7Info {
    pub mode: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub image_h_step: u32,
    pub image_v_step: u32,
    pub offset_h_step: u32,
    pub offset_v_step: u32,
    pub pixel_formats: Vec<PixelFormat>
}

/// Region and pixel format requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format7Settings {
    pub mode: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat
}

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A stereo camera session.
///
/// The acquisition loop calls `connect`, `format7_info`, `configure`, `start_capture`, then
/// `retrieve_buffer`/`convert_to_bgr` once per frame, and finally `stop_capture` and
/// `disconnect`.
pub trait Camera {
    fn connect(&mut self) -> Result<()>;

    /// Capabilities of the stereo Format7 mode.
    fn format7_info(&self) -> Result<Format7Info>;

    fn configure(&mut self, settings: &Format7Settings) -> Result<()>;

    fn start_capture(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    ///
    /// Flaky reads must be reported as [`Error::Transient`] so they can be retried.
    fn retrieve_buffer(&mut self) -> Result<RawFrame>;

    /// Convert a raw frame to a packed B, G, R buffer of the same size.
    fn convert_to_bgr(&mut self, frame: &RawFrame) -> Result<Vec<u8>>;

    fn stop_capture(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn format7_info(&self) -> Result<Format7Info> {
        (**self).format7_info()
    }

    fn configure(&mut self, settings: &Format7Settings) -> Result<()> {
        (**self).configure(settings)
    }

    fn start_capture(&mut self) -> Result<()> {
        (**self).start_capture()
    }

    fn retrieve_buffer(&mut self) -> Result<RawFrame> {
        (**self).retrieve_buffer()
    }

    fn convert_to_bgr(&mut self, frame: &RawFrame) -> Result<Vec<u8>> {
        (**self).convert_to_bgr(frame)
    }

    fn stop_capture(&mut self) -> Result<()> {
        (**self).stop_capture()
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }
}

impl Format7Info {
    pub fn supports(&self, pixel_format: PixelFormat) -> bool {
        self.pixel_formats.contains(&pixel_format)
    }
}

impl fmt::Display for Format7Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formats: Vec<String> = self.pixel_formats.iter().map(|p| p.to_string()).collect();

        writeln!(f, "Format7 capabilities:")?;
        writeln!(f, "\tMode: {}", self.mode)?;
        writeln!(f, "\tMax image pixels: ({}, {})", self.max_width, self.max_height)?;
        writeln!(
            f,
            "\tImage unit size (h, v): ({}, {})",
            self.image_h_step,
            self.image_v_step
        )?;
        writeln!(
            f,
            "\tOffset unit size (h, v): ({}, {})",
            self.offset_h_step,
            self.offset_v_step
        )?;
        write!(f, "\tPixel formats: {}", formats.join(", "))
    }
}

impl Format7Settings {
    /// The whole sensor area in the given pixel format.
    pub fn full_frame(info: &Format7Info, pixel_format: PixelFormat) -> Self {
        Self {
            mode: info.mode,
            offset_x: 0,
            offset_y: 0,
            width: info.max_width,
            height: info.max_height,
            pixel_format
        }
    }

    /// Check the settings against the camera's capabilities.
    pub fn validate(&self, info: &Format7Info) -> Result<()> {
        if self.mode != info.mode {
            return Err(Error::Configuration(format!(
                "mode {} requested but capabilities are for mode {}",
                self.mode,
                info.mode
            )));
        }

        if !info.supports(self.pixel_format) {
            return Err(Error::Configuration(format!(
                "pixel format {} is not supported",
                self.pixel_format
            )));
        }

        if self.width == 0
            || self.height == 0
            || self.offset_x + self.width > info.max_width
            || self.offset_y + self.height > info.max_height
        {
            return Err(Error::Configuration(format!(
                "region {}x{}+{}+{} does not fit the {}x{} sensor",
                self.width,
                self.height,
                self.offset_x,
                self.offset_y,
                info.max_width,
                info.max_height
            )));
        }

        let misaligned = |value: u32, step: u32| step > 1 && value % step != 0;
        if misaligned(self.width, info.image_h_step)
            || misaligned(self.height, info.image_v_step)
            || misaligned(self.offset_x, info.offset_h_step)
            || misaligned(self.offset_y, info.offset_v_step)
        {
            return Err(Error::Configuration(format!(
                "region {}x{}+{}+{} is not aligned to the sensor's unit sizes",
                self.width,
                self.height,
                self.offset_x,
                self.offset_y
            )));
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
