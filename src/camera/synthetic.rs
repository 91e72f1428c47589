//! Synthetic stereo camera.
//!
//! Renders a textured background at zero disparity with a textured block in front of it at a
//! fixed disparity. The block drifts sideways from frame to frame. Transient read failures can be
//! injected at a fixed period.

use std::thread;
use std::time::{Duration, Instant};

use image::{GrayImage, Luma};
use imageproc::noise::gaussian_noise_mut;

use super::{Camera, Format7Info, Format7Settings, STEREO_MODE};
use crate::error::*;
use crate::frame::{interleave_raw, PixelFormat, Plane, RawFrame, BLUE_OFFSET, GREEN_OFFSET, RED_OFFSET};

/// Configuration for a synthetic camera.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,

    /// Disparity of the foreground block, in pixels.
    pub disparity: u32,

    /// Fail every n-th buffer retrieval with a transient error.
    pub fail_every: Option<u64>,

    /// Delay before each buffer is delivered, emulating the sensor frame rate.
    pub frame_interval: Duration,

    pub seed: u64
}

pub struct SyntheticCamera {
    config: SyntheticConfig,
    background: GrayImage,
    foreground: GrayImage,
    settings: Option<Format7Settings>,
    connected: bool,
    capturing: bool,
    started: Instant,
    retrievals: u64,
    sequence: u64
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            disparity: 8,
            fail_every: None,
            frame_interval: Duration::from_millis(0),
            seed: 0x5eed
        }
    }
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig) -> Self {
        let tex_width = config.width + config.disparity;
        let background = texture(tex_width, config.height, config.seed);
        let foreground = texture(tex_width, config.height, config.seed.wrapping_add(1));

        Self {
            config,
            background,
            foreground,
            settings: None,
            connected: false,
            capturing: false,
            started: Instant::now(),
            retrievals: 0,
            sequence: 0
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Left edge of the foreground block in the left view for the given frame.
    fn block_x(&self, sequence: u64) -> u32 {
        let travel = (self.config.width / 2).max(1);
        self.config.width / 4 + (sequence * 2 % u64::from(travel)) as u32
    }

    fn in_block(&self, sequence: u64, x: u32, y: u32) -> bool {
        let x0 = self.block_x(sequence);
        let (w, h) = (self.config.width / 4, self.config.height / 2);
        let y0 = self.config.height / 4;

        x >= x0 && x < x0 + w && y >= y0 && y < y0 + h
    }

    /// Render the left and right views of one frame.
    pub fn render(&self, sequence: u64) -> (Plane, Plane) {
        let (width, height) = (self.config.width, self.config.height);
        let d = self.config.disparity;

        let left = GrayImage::from_fn(width, height, |x, y| {
            match self.in_block(sequence, x, y) {
                true => *self.foreground.get_pixel(x + d, y),
                false => *self.background.get_pixel(x, y)
            }
        });

        // The block appears `d` pixels further left in the right view
        let right = GrayImage::from_fn(width, height, |x, y| {
            match self.in_block(sequence, x + d, y) {
                true => *self.foreground.get_pixel(x + d + d, y),
                false => *self.background.get_pixel(x, y)
            }
        });

        (left, right)
    }

    fn require(&self, ok: bool, operation: &'static str, state: &'static str) -> Result<()> {
        match ok {
            true => Ok(()),
            false => Err(Error::InvalidState { operation, state })
        }
    }
}

impl Camera for SyntheticCamera {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "Connected to synthetic stereo camera ({}x{}, block disparity {})",
            self.config.width,
            self.config.height,
            self.config.disparity
        );
        Ok(())
    }

    fn format7_info(&self) -> Result<Format7Info> {
        self.require(self.connected, "query capabilities", "disconnected")?;

        Ok(Format7Info {
            mode: STEREO_MODE,
            max_width: self.config.width,
            max_height: self.config.height,
            image_h_step: 1,
            image_v_step: 1,
            offset_h_step: 1,
            offset_v_step: 1,
            pixel_formats: vec![PixelFormat::Raw16, PixelFormat::Mono8]
        })
    }

    fn configure(&mut self, settings: &Format7Settings) -> Result<()> {
        self.require(self.connected, "configure", "disconnected")?;
        self.require(!self.capturing, "configure", "capturing")?;

        settings.validate(&self.format7_info()?)?;
        if settings.pixel_format != PixelFormat::Raw16
            || settings.width != self.config.width
            || settings.height != self.config.height
        {
            return Err(Error::Configuration(String::from(
                "the synthetic camera only renders full frame RAW16"
            )));
        }

        self.settings = Some(*settings);
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        self.require(self.settings.is_some(), "start capture", "unconfigured")?;

        self.capturing = true;
        self.started = Instant::now();
        Ok(())
    }

    fn retrieve_buffer(&mut self) -> Result<RawFrame> {
        self.require(self.capturing, "retrieve a buffer", "not capturing")?;

        if !self.config.frame_interval.is_zero() {
            thread::sleep(self.config.frame_interval);
        }

        self.retrievals += 1;
        if let Some(n) = self.config.fail_every {
            if n > 0 && self.retrievals % n == 0 {
                return Err(Error::Transient(format!(
                    "synthetic packet loss on retrieval {}",
                    self.retrievals
                )));
            }
        }

        let (left, right) = self.render(self.sequence);
        let frame = RawFrame::new(
            interleave_raw(&left, &right),
            self.config.height,
            self.config.width,
            PixelFormat::Raw16,
            self.started.elapsed(),
            self.sequence
        )?;
        self.sequence += 1;

        Ok(frame)
    }

    fn convert_to_bgr(&mut self, frame: &RawFrame) -> Result<Vec<u8>> {
        let (left, _) = frame.demux()?;

        // Gray scene with the foreground block tinted red
        let mut bgr = vec![0u8; left.as_raw().len() * 3];
        for (i, (chunk, px)) in bgr.chunks_exact_mut(3).zip(left.pixels()).enumerate() {
            let Luma([v]) = *px;
            let (x, y) = (i as u32 % frame.cols, i as u32 / frame.cols);
            let tint = self.in_block(frame.sequence, x, y);

            chunk[BLUE_OFFSET] = if tint { v / 2 } else { v };
            chunk[GREEN_OFFSET] = if tint { v / 2 } else { v };
            chunk[RED_OFFSET] = v;
        }

        Ok(bgr)
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.capturing = false;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.capturing = false;
        self.connected = false;
        log::info!("Disconnected from synthetic stereo camera");
        Ok(())
    }
}

fn texture(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut image = GrayImage::from_pixel(width, height, Luma([128]));
    gaussian_noise_mut(&mut image, 0.0, 48.0, seed);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::demux_color;

    fn configured(config: SyntheticConfig) -> SyntheticCamera {
        let mut camera = SyntheticCamera::new(config);
        camera.connect().unwrap();
        let info = camera.format7_info().unwrap();
        camera.configure(&Format7Settings::full_frame(&info, PixelFormat::Raw16)).unwrap();
        camera.start_capture().unwrap();
        camera
    }

    #[test]
    fn retrieve_before_start_is_invalid_state() {
        let mut camera = SyntheticCamera::new(SyntheticConfig::default());

        assert!(matches!(camera.retrieve_buffer(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn frames_demux_into_shifted_views() {
        let config = SyntheticConfig {
            width: 64,
            height: 32,
            disparity: 4,
            ..SyntheticConfig::default()
        };
        let mut camera = configured(config);

        let frame = camera.retrieve_buffer().unwrap();
        let (left, right) = frame.demux().unwrap();
        let (expected_left, expected_right) = camera.render(0);

        assert_eq!(left, expected_left);
        assert_eq!(right, expected_right);

        // Inside the block the right view is the left view shifted by the disparity
        let x0 = camera.block_x(0);
        for x in x0..x0 + 16 {
            assert_eq!(left.get_pixel(x, 16), right.get_pixel(x - 4, 16));
        }
    }

    #[test]
    fn color_conversion_matches_frame_size() {
        let mut camera = configured(SyntheticConfig { width: 40, height: 20, ..SyntheticConfig::default() });

        let frame = camera.retrieve_buffer().unwrap();
        let bgr = camera.convert_to_bgr(&frame).unwrap();

        assert!(demux_color(&bgr, frame.rows, frame.cols).is_ok());
    }

    #[test]
    fn injected_failures_are_transient() {
        let mut camera = configured(SyntheticConfig {
            width: 32,
            height: 16,
            fail_every: Some(3),
            ..SyntheticConfig::default()
        });

        assert!(camera.retrieve_buffer().is_ok());
        assert!(camera.retrieve_buffer().is_ok());
        assert!(camera.retrieve_buffer().unwrap_err().is_transient());
        assert_eq!(camera.retrieve_buffer().unwrap().sequence, 2);
    }
}
