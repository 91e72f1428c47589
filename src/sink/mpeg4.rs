//! MPEG-4 Part 2 encoding through FFmpeg.
//!
//! Frames are converted from RGB24 to YUV420P and compressed without B-frames, so each input
//! frame completes exactly one packet and packets arrive in display order.

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, encoder};
use ffmpeg::software::scaling::{context::Context as Scaler, flag::Flags};
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::util::frame::video::Video as VideoFrame;
use image::RgbImage;

use super::encoder::{EncodedFrame, VideoCodec, VideoEncoder};
use crate::error::*;

/// Frames between keyframes.
const GOP_SIZE: u32 = 12;

/// Target bit rate per pixel per frame.
const BITS_PER_PIXEL: usize = 2;

pub struct Mpeg4Encoder {
    encoder: encoder::video::Encoder,
    scaler: Scaler,
    rgb: VideoFrame,
    yuv: VideoFrame,
    width: u32,
    height: u32,
    next_pts: i64,
    flushed: bool
}

impl Mpeg4Encoder {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self> {
        if width % 2 == 1 || height % 2 == 1 || fps == 0 {
            return Err(Error::Configuration(format!(
                "cannot encode {}x{} MPEG-4 at {} fps, dimensions must be even",
                width,
                height,
                fps
            )));
        }

        ffmpeg::init().map_err(ffmpeg_error)?;
        let codec = encoder::find(codec::Id::MPEG4)
            .ok_or_else(|| Error::Encoder(String::from("FFmpeg has no MPEG-4 encoder")))?;

        let mut video = codec::context::Context::new()
            .encoder()
            .video()
            .map_err(ffmpeg_error)?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base((1, fps as i32));
        video.set_frame_rate(Some((fps as i32, 1)));
        video.set_gop(GOP_SIZE);
        video.set_max_b_frames(0);
        video.set_bit_rate(width as usize * height as usize * fps as usize * BITS_PER_PIXEL);
        let encoder = video.open_as(codec).map_err(ffmpeg_error)?;

        let scaler = Scaler::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            Flags::BILINEAR
        )
        .map_err(ffmpeg_error)?;

        log::debug!("Opened MPEG-4 encoder for {}x{} at {} fps", width, height, fps);

        Ok(Self {
            encoder,
            scaler,
            rgb: VideoFrame::new(Pixel::RGB24, width, height),
            yuv: VideoFrame::empty(),
            width,
            height,
            next_pts: 0,
            flushed: false
        })
    }

    fn receive(&mut self) -> Vec<EncodedFrame> {
        let mut packets = Vec::new();
        let mut packet = ffmpeg::Packet::empty();

        while self.encoder.receive_packet(&mut packet).is_ok() {
            if let Some(data) = packet.data() {
                packets.push(EncodedFrame {
                    data: data.to_vec(),
                    keyframe: packet.is_key()
                });
            }
        }

        packets
    }
}

impl VideoEncoder for Mpeg4Encoder {
    fn codec(&self) -> VideoCodec {
        VideoCodec::Divx
    }

    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFrame>> {
        if image.dimensions() != (self.width, self.height) || self.flushed {
            return Err(Error::Encoder(format!(
                "cannot encode a {}x{} frame into a {}x{} stream",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }

        // FFmpeg rows may be padded past the image width
        let row_len = self.width as usize * 3;
        let stride = self.rgb.stride(0);
        let plane = self.rgb.data_mut(0);
        for (y, row) in image.as_raw().chunks(row_len).enumerate() {
            plane
                .get_mut(y * stride..y * stride + row_len)
                .ok_or_else(|| Error::Encoder(String::from("RGB frame row out of bounds")))?
                .copy_from_slice(row);
        }

        self.scaler.run(&self.rgb, &mut self.yuv).map_err(ffmpeg_error)?;
        self.yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder.send_frame(&self.yuv).map_err(ffmpeg_error)?;
        Ok(self.receive())
    }

    fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        if self.flushed {
            return Ok(Vec::new());
        }
        self.flushed = true;

        self.encoder.send_eof().map_err(ffmpeg_error)?;
        Ok(self.receive())
    }
}

fn ffmpeg_error(e: ffmpeg::Error) -> Error {
    Error::Encoder(e.to_string())
}
