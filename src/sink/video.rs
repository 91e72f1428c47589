//! Video file sink.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::RgbImage;

use super::encoder::{EncodedFrame, VideoCodec, VideoEncoder};
use super::{bgr_to_rgb, gray_to_rgb, AviWriter, FrameSink};
use crate::depth::DepthFrame;
use crate::error::*;

/// Default frame rate of the recorded videos.
pub const DEFAULT_FPS: u32 = 30;

/// One encoder feeding one AVI file.
struct VideoStream {
    encoder: Box<dyn VideoEncoder>,
    writer: AviWriter<BufWriter<File>>
}

/// The two streams recorded when disparity is computed.
struct DepthStreams {
    disparity: VideoStream,
    heatmap: VideoStream
}

/// Records `color.avi`, and `disparity.avi` plus `heatmap.avi` when disparity is computed.
///
/// Every stream of a frame is encoded before any of them is written, so all files always hold
/// the same number of frames.
pub struct VideoSink {
    dir: PathBuf,
    width: u32,
    height: u32,
    codec: VideoCodec,
    color: VideoStream,
    depth: Option<DepthStreams>,
    failures: u64
}

impl VideoStream {
    fn open(path: PathBuf, codec: VideoCodec, width: u32, height: u32, fps: u32) -> Result<Self> {
        Ok(Self {
            encoder: codec.open_encoder(width, height, fps)?,
            writer: AviWriter::create(path, width, height, fps, codec)?
        })
    }

    fn append(&mut self, packets: &[EncodedFrame]) -> Result<()> {
        for packet in packets {
            self.writer.write_frame(packet)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let rest = self.encoder.flush()?;
        self.append(&rest)?;
        self.writer.finish()
    }
}

impl VideoSink {
    /// Create the video files in `dir` for frames of the configured sensor size, recorded with
    /// the default codec.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        width: u32,
        height: u32,
        fps: u32,
        with_disparity: bool
    ) -> Result<Self> {
        Self::with_codec(dir, width, height, fps, with_disparity, VideoCodec::default())
    }

    /// Create the video files with a chosen codec, falling back to `MJPG` when it is not built in.
    pub fn with_codec<P: AsRef<Path>>(
        dir: P,
        width: u32,
        height: u32,
        fps: u32,
        with_disparity: bool,
        codec: VideoCodec
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let codec = codec.resolve();
        let open = |name: &str| VideoStream::open(dir.join(name), codec, width, height, fps);

        let color = open("color.avi")?;
        let depth = match with_disparity {
            true => Some(DepthStreams {
                disparity: open("disparity.avi")?,
                heatmap: open("heatmap.avi")?
            }),
            false => None
        };

        log::info!(
            "Recording {}x{} {} video at {} fps to {}",
            width,
            height,
            String::from_utf8_lossy(codec.fourcc()),
            fps,
            dir.display()
        );

        Ok(Self {
            dir,
            width,
            height,
            codec,
            color,
            depth,
            failures: 0
        })
    }

    /// The codec actually being recorded.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn frames_written(&self) -> usize {
        self.color.writer.frame_count()
    }

    fn check_size(&self, image: &RgbImage) -> Result<()> {
        match image.dimensions() == (self.width, self.height) {
            true => Ok(()),
            false => Err(Error::Configuration(format!(
                "{}x{} frame given to a {}x{} video",
                image.width(),
                image.height(),
                self.width,
                self.height
            )))
        }
    }

    fn write(&mut self, frame: &DepthFrame) -> Result<()> {
        let color = bgr_to_rgb(&frame.color);
        self.check_size(&color)?;

        let maps = match self.depth {
            Some(_) => match (frame.disparity.as_ref(), frame.heatmap.as_ref()) {
                (Some(disparity), Some(heatmap)) => {
                    let disparity = gray_to_rgb(disparity);
                    self.check_size(&disparity)?;
                    self.check_size(heatmap)?;
                    Some((disparity, heatmap))
                },
                _ => {
                    return Err(Error::Configuration(String::from(
                        "frame carries no disparity for the disparity videos"
                    )))
                }
            },
            None => None
        };

        // Encode everything first so a failure leaves every file at the same length
        let color_packets = self.color.encoder.encode(&color)?;
        let depth_packets = match (self.depth.as_mut(), maps.as_ref()) {
            (Some(streams), Some((disparity, heatmap))) => Some((
                streams.disparity.encoder.encode(disparity)?,
                streams.heatmap.encoder.encode(heatmap)?
            )),
            _ => None
        };

        self.color.append(&color_packets)?;
        if let (Some(streams), Some((disparity, heatmap))) = (self.depth.as_mut(), depth_packets) {
            streams.disparity.append(&disparity)?;
            streams.heatmap.append(&heatmap)?;
        }

        Ok(())
    }
}

impl FrameSink for VideoSink {
    fn consume(&mut self, frame: &DepthFrame) {
        if let Err(e) = self.write(frame) {
            self.failures += 1;
            log::warn!("Could not record frame {}: {}", frame.index, e);
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.color.finish()?;
        if let Some(streams) = self.depth.as_mut() {
            streams.disparity.finish()?;
            streams.heatmap.finish()?;
        }

        log::info!(
            "Finished {} video frames in {} ({} failed)",
            self.frames_written(),
            self.dir.display(),
            self.failures
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "video"
    }
}
