//! # Frame demuxing
//!
//! This module provides the raw frame container delivered by the camera, and the transforms which
//! split it into the left and right grayscale planes and the merged color view.
//!
//! The sensor interleaves both imagers into one 16 bit per pixel buffer. The byte order is a
//! property of the sensor wiring: the byte at an even offset belongs to the **right** imager and
//! the byte at an odd offset to the **left** one. Swapping them silently mirrors the stereo
//! geometry, so the offsets are named constants below and covered by tests.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fmt;
use std::time::Duration;

use image::{Bgr, GrayImage, ImageBuffer, Luma};

use crate::error::*;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Offset within each 2 byte raw pixel of the right imager's sample.
pub const RIGHT_PLANE_OFFSET: usize = 0;

/// Offset within each 2 byte raw pixel of the left imager's sample.
pub const LEFT_PLANE_OFFSET: usize = 1;

/// Offset of the blue channel within each 3 byte color pixel.
pub const BLUE_OFFSET: usize = 0;

/// Offset of the green channel within each 3 byte color pixel.
pub const GREEN_OFFSET: usize = 1;

/// Offset of the red channel within each 3 byte color pixel.
pub const RED_OFFSET: usize = 2;

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// A single channel 8 bit image, `cols` wide and `rows` high.
pub type Plane = GrayImage;

/// A three channel image stored in B, G, R order.
pub type ColorImage = ImageBuffer<Bgr<u8>, Vec<u8>>;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Pixel formats the camera can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Both imagers interleaved, one byte each.
    Raw16,
    /// A single 8 bit plane.
    Mono8,
    /// Packed 8 bit blue, green, red.
    Bgr8
}

/// One buffer as delivered by the camera, before demuxing.
///
/// A raw frame lives for a single acquisition iteration.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Vec<u8>,
    pub rows: u32,
    pub cols: u32,
    pub pixel_format: PixelFormat,

    /// Capture time relative to the start of capture.
    pub timestamp: Duration,

    /// Sequence number assigned by the camera.
    pub sequence: u64
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl PixelFormat {
    /// Number of bytes a single pixel occupies in a buffer of this format.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Raw16 => 2,
            PixelFormat::Mono8 => 1,
            PixelFormat::Bgr8 => 3
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Mono8 => "MONO8",
            PixelFormat::Bgr8 => "BGR8"
        }
    }

    /// Expected buffer length for an image of the given size.
    pub fn buffer_len(&self, rows: u32, cols: u32) -> usize {
        rows as usize * cols as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl RawFrame {
    /// Wrap a buffer received from the camera.
    ///
    /// The buffer length is checked against the declared size and pixel format.
    pub fn new(
        data: Vec<u8>,
        rows: u32,
        cols: u32,
        pixel_format: PixelFormat,
        timestamp: Duration,
        sequence: u64
    ) -> Result<Self> {
        check_len(data.len(), rows, cols, pixel_format)?;

        Ok(Self {
            data,
            rows,
            cols,
            pixel_format,
            timestamp,
            sequence
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Split a `Raw16` frame into its left and right planes.
    pub fn demux(&self) -> Result<(Plane, Plane)> {
        if self.pixel_format != PixelFormat::Raw16 {
            return Err(Error::Shape {
                rows: self.rows,
                cols: self.cols,
                format: PixelFormat::Raw16.name(),
                expected: PixelFormat::Raw16.buffer_len(self.rows, self.cols),
                actual: self.data.len()
            });
        }

        demux_raw(&self.data, self.rows, self.cols)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Split an interleaved dual plane buffer into `(left, right)` planes.
///
/// Bytes at odd offsets go to the left plane and bytes at even offsets to the right plane.
pub fn demux_raw(buffer: &[u8], rows: u32, cols: u32) -> Result<(Plane, Plane)> {
    check_len(buffer.len(), rows, cols, PixelFormat::Raw16)?;

    let left: Vec<u8> = buffer.iter().skip(LEFT_PLANE_OFFSET).step_by(2).copied().collect();
    let right: Vec<u8> = buffer.iter().skip(RIGHT_PLANE_OFFSET).step_by(2).copied().collect();

    Ok((to_plane(left, rows, cols)?, to_plane(right, rows, cols)?))
}

/// Assemble a color image from a packed 3 byte per pixel buffer.
///
/// Offsets 0, 1 and 2 of each pixel are the blue, green and red channels.
pub fn demux_color(buffer: &[u8], rows: u32, cols: u32) -> Result<ColorImage> {
    check_len(buffer.len(), rows, cols, PixelFormat::Bgr8)?;

    let mut image = ColorImage::new(cols, rows);
    for (pixel, chunk) in image.pixels_mut().zip(buffer.chunks_exact(3)) {
        *pixel = Bgr([chunk[BLUE_OFFSET], chunk[GREEN_OFFSET], chunk[RED_OFFSET]]);
    }

    Ok(image)
}

/// Interleave a left and right plane into a dual plane buffer, the inverse of [`demux_raw`].
///
/// # Panics
///
/// Panics if the planes do not have the same dimensions.
pub fn interleave_raw(left: &Plane, right: &Plane) -> Vec<u8> {
    assert_eq!(left.dimensions(), right.dimensions(), "planes must have equal dimensions");

    let mut buffer = vec![0u8; left.as_raw().len() * 2];
    for (i, (l, r)) in left.as_raw().iter().zip(right.as_raw().iter()).enumerate() {
        buffer[2 * i + LEFT_PLANE_OFFSET] = *l;
        buffer[2 * i + RIGHT_PLANE_OFFSET] = *r;
    }

    buffer
}

/// Pack a color image into a 3 byte per pixel buffer, the inverse of [`demux_color`].
pub fn interleave_color(image: &ColorImage) -> Vec<u8> {
    let mut buffer = vec![0u8; (image.width() * image.height()) as usize * 3];
    for (chunk, pixel) in buffer.chunks_exact_mut(3).zip(image.pixels()) {
        let Bgr([b, g, r]) = *pixel;
        chunk[BLUE_OFFSET] = b;
        chunk[GREEN_OFFSET] = g;
        chunk[RED_OFFSET] = r;
    }

    buffer
}

fn check_len(actual: usize, rows: u32, cols: u32, format: PixelFormat) -> Result<()> {
    let expected = format.buffer_len(rows, cols);

    if actual != expected {
        return Err(Error::Shape {
            rows,
            cols,
            format: format.name(),
            expected,
            actual
        });
    }

    Ok(())
}

fn to_plane(data: Vec<u8>, rows: u32, cols: u32) -> Result<Plane> {
    let actual = data.len();
    ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(cols, rows, data).ok_or(Error::Shape {
        rows,
        cols,
        format: PixelFormat::Mono8.name(),
        expected: rows as usize * cols as usize,
        actual
    })
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_route_odd_left_even_right() {
        let (rows, cols) = (3, 5);
        let buffer: Vec<u8> = (0..(rows * cols * 2) as u8).collect();

        let (left, right) = demux_raw(&buffer, rows, cols).unwrap();

        assert_eq!(left.dimensions(), (cols, rows));
        for (i, v) in left.as_raw().iter().enumerate() {
            assert_eq!(*v as usize, 2 * i + 1);
        }
        for (i, v) in right.as_raw().iter().enumerate() {
            assert_eq!(*v as usize, 2 * i);
        }

        assert_eq!(interleave_raw(&left, &right), buffer);
    }

    #[test]
    fn alternating_pattern_reconstructs() {
        for &(rows, cols) in &[(1u32, 1u32), (2, 7), (16, 9), (48, 64)] {
            let buffer: Vec<u8> = (0..rows * cols * 2)
                .map(|i| if i % 2 == 0 { 0x0f } else { 0xf0 })
                .collect();

            let (left, right) = demux_raw(&buffer, rows, cols).unwrap();

            assert!(left.as_raw().iter().all(|&v| v == 0xf0));
            assert!(right.as_raw().iter().all(|&v| v == 0x0f));
            assert_eq!(interleave_raw(&left, &right), buffer);
        }
    }

    #[test]
    fn raw_length_mismatch_is_shape_error() {
        let buffer = vec![0u8; 4 * 4 * 2 - 1];

        match demux_raw(&buffer, 4, 4) {
            Err(Error::Shape { expected, actual, .. }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 31);
            },
            other => panic!("expected shape error, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn color_channels_merge_in_bgr_order() {
        let (rows, cols) = (2u32, 3u32);
        let n = (rows * cols) as u8;
        let blue: Vec<u8> = (0..n).collect();
        let green: Vec<u8> = (0..n).map(|v| v + 100).collect();
        let red: Vec<u8> = (0..n).map(|v| v + 200).collect();

        let mut buffer = Vec::new();
        for i in 0..n as usize {
            buffer.push(blue[i]);
            buffer.push(green[i]);
            buffer.push(red[i]);
        }

        let image = demux_color(&buffer, rows, cols).unwrap();

        for (i, pixel) in image.pixels().enumerate() {
            assert_eq!(pixel.0, [blue[i], green[i], red[i]]);
        }
        assert_eq!(interleave_color(&image), buffer);
    }

    #[test]
    fn color_length_mismatch_is_shape_error() {
        assert!(matches!(demux_color(&[0u8; 10], 2, 2), Err(Error::Shape { .. })));
    }

    #[test]
    fn raw_frame_demux_requires_raw16() {
        let frame = RawFrame::new(
            vec![0u8; 12],
            2,
            2,
            PixelFormat::Bgr8,
            Duration::from_millis(0),
            0
        ).unwrap();

        assert!(matches!(frame.demux(), Err(Error::Shape { .. })));
    }
}
