//! Live preview window.

use minifb::{Key, KeyRepeat, Window, WindowOptions};

use super::{CaptureTrigger, FrameSink};
use crate::acquisition::CancelToken;
use crate::depth::DepthFrame;
use crate::error::*;

/// Shows the left view beside the disparity heatmap.
///
/// Closing the window or pressing `q` or Escape cancels the run through the given token. With a
/// trigger attached, pressing space requests a capture of the next frame.
pub struct PreviewSink {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
    cancel: CancelToken,
    trigger: Option<CaptureTrigger>
}

impl PreviewSink {
    pub fn new(width: u32, height: u32, cancel: CancelToken) -> Result<Self> {
        let (width, height) = (width as usize, height as usize);

        let window = Window::new(
            "depthcam - ESC or q to exit",
            2 * width,
            height,
            WindowOptions::default()
        ).map_err(|e| Error::Preview(e.to_string()))?;

        Ok(Self {
            window,
            buffer: vec![0; 2 * width * height],
            width,
            height,
            cancel,
            trigger: None
        })
    }

    /// Raise `trigger` whenever space is pressed.
    pub fn with_trigger(mut self, trigger: CaptureTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    fn draw(&mut self, frame: &DepthFrame) {
        let rgb = |r: u8, g: u8, b: u8| (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b);
        let (width, height) = (self.width, self.height);
        let stride = 2 * width;
        let buffer = &mut self.buffer;
        let mut put = |x: u32, y: u32, offset: usize, val: u32| {
            let (x, y) = (x as usize, y as usize);
            if x < width && y < height {
                buffer[y * stride + offset + x] = val;
            }
        };

        for (x, y, px) in frame.left.enumerate_pixels() {
            put(x, y, 0, rgb(px[0], px[0], px[0]));
        }

        // Without disparity the right view takes the heatmap's place
        match &frame.heatmap {
            Some(heatmap) => {
                for (x, y, px) in heatmap.enumerate_pixels() {
                    put(x, y, width, rgb(px[0], px[1], px[2]));
                }
            },
            None => {
                for (x, y, px) in frame.right.enumerate_pixels() {
                    put(x, y, width, rgb(px[0], px[0], px[0]));
                }
            }
        }
    }
}

impl FrameSink for PreviewSink {
    fn consume(&mut self, frame: &DepthFrame) {
        if !self.window.is_open()
            || self.window.is_key_down(Key::Escape)
            || self.window.is_key_down(Key::Q)
        {
            log::info!("Preview closed, cancelling");
            self.cancel.cancel();
            return;
        }

        if let Some(trigger) = &self.trigger {
            if self.window.is_key_pressed(Key::Space, KeyRepeat::No) {
                trigger.request();
            }
        }

        self.draw(frame);

        if let Err(e) = self.window.update_with_buffer(&self.buffer, 2 * self.width, self.height) {
            log::warn!("Could not update preview: {}", e);
        }
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "preview"
    }
}
