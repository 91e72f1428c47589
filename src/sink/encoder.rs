//! Video codecs used by the recording sink.
//!
//! Recordings are MPEG-4 Part 2 (`DIVX`) when the crate is built with the `video-ffmpeg` feature.
//! Without it the sink falls back to Motion-JPEG (`MJPG`), encoded with the `image` crate.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use serde::Deserialize;

use crate::error::*;

const JPEG_QUALITY: u8 = 90;

/// Codec of a recorded video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// MPEG-4 Part 2, tagged `DIVX`.
    Divx,

    /// Motion-JPEG, tagged `MJPG`.
    Mjpeg
}

/// One compressed frame, as stored in a single AVI chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool
}

/// A frame by frame video encoder.
pub trait VideoEncoder {
    fn codec(&self) -> VideoCodec;

    /// Encode one frame, returning the packets it completes.
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFrame>>;

    /// Return any packets still held by the encoder. Later calls return nothing.
    fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        Ok(Vec::new())
    }
}

/// Stateless Motion-JPEG encoder, every frame is a keyframe.
pub struct MjpegEncoder {
    quality: u8
}

impl Default for VideoCodec {
    fn default() -> Self {
        VideoCodec::Divx
    }
}

impl VideoCodec {
    /// The fourcc written to the stream header and format.
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            VideoCodec::Divx => b"DIVX",
            VideoCodec::Mjpeg => b"MJPG"
        }
    }

    /// Whether this build can encode the codec.
    pub fn is_available(&self) -> bool {
        match self {
            VideoCodec::Divx => cfg!(feature = "video-ffmpeg"),
            VideoCodec::Mjpeg => true
        }
    }

    /// The codec actually recorded when this one is requested.
    ///
    /// `DIVX` falls back to `MJPG` in builds without the `video-ffmpeg` feature.
    pub fn resolve(self) -> Self {
        match self.is_available() {
            true => self,
            false => {
                log::warn!(
                    "DIVX recording needs the video-ffmpeg feature, falling back to MJPG"
                );
                VideoCodec::Mjpeg
            }
        }
    }

    /// Open an encoder for `width`x`height` frames at `fps`.
    pub fn open_encoder(&self, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoEncoder>> {
        match self {
            VideoCodec::Divx => open_divx(width, height, fps),
            VideoCodec::Mjpeg => Ok(Box::new(MjpegEncoder::default()))
        }
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self {
            quality: JPEG_QUALITY
        }
    }
}

impl VideoEncoder for MjpegEncoder {
    fn codec(&self) -> VideoCodec {
        VideoCodec::Mjpeg
    }

    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFrame>> {
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.quality).encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ColorType::Rgb8
        )?;

        Ok(vec![EncodedFrame {
            data,
            keyframe: true
        }])
    }
}

#[cfg(feature = "video-ffmpeg")]
fn open_divx(width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoEncoder>> {
    Ok(Box::new(super::mpeg4::Mpeg4Encoder::new(width, height, fps)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_divx(_width: u32, _height: u32, _fps: u32) -> Result<Box<dyn VideoEncoder>> {
    Err(Error::Configuration(String::from(
        "DIVX recording needs a build with the video-ffmpeg feature"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn divx_is_the_default_codec() {
        assert_eq!(VideoCodec::default(), VideoCodec::Divx);
        assert_eq!(VideoCodec::default().fourcc(), b"DIVX");
        assert_eq!(VideoCodec::Mjpeg.resolve(), VideoCodec::Mjpeg);
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn divx_falls_back_without_ffmpeg() {
        assert!(!VideoCodec::Divx.is_available());
        assert_eq!(VideoCodec::Divx.resolve(), VideoCodec::Mjpeg);
        assert!(matches!(
            VideoCodec::Divx.open_encoder(16, 16, 30),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn mjpeg_frames_are_jpeg_keyframes() {
        let mut encoder = VideoCodec::Mjpeg.open_encoder(8, 8, 30).unwrap();
        let packets = encoder.encode(&RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]))).unwrap();

        assert_eq!(encoder.codec(), VideoCodec::Mjpeg);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].keyframe);
        assert_eq!(&packets[0].data[0..2], &[0xff, 0xd8]);
        assert!(encoder.flush().unwrap().is_empty());
    }
}
