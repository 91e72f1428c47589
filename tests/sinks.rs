//! # Output sinks
//!
//! Writes processed frames to temporary directories and checks the files produced.

use std::fs;
use std::time::Duration;

use cv_depthcam::frame::ColorImage;
use cv_depthcam::prelude::*;
use cv_depthcam::sink::{CaptureTrigger, PngSequenceSink, Stream, VideoCodec, VideoSink};
use image::{Bgr, DynamicImage, GrayImage, Luma, Rgb, RgbImage};

const WIDTH: u32 = 24;
const HEIGHT: u32 = 16;

fn frame(index: u64, with_disparity: bool) -> DepthFrame {
    let disparity = GrayImage::from_fn(WIDTH, HEIGHT, |x, _| Luma([(x * 10) as u8]));
    let heatmap = RgbImage::from_fn(WIDTH, HEIGHT, |x, _| Rgb([(x * 10) as u8, 0, 255 - (x * 10) as u8]));

    DepthFrame {
        index,
        timestamp: Duration::from_millis(index * 33),
        left: GrayImage::from_pixel(WIDTH, HEIGHT, Luma([50])),
        right: GrayImage::from_pixel(WIDTH, HEIGHT, Luma([60])),
        color: ColorImage::from_pixel(WIDTH, HEIGHT, Bgr([10, 20, 30])),
        disparity: match with_disparity {
            true => Some(disparity),
            false => None
        },
        heatmap: match with_disparity {
            true => Some(heatmap),
            false => None
        }
    }
}

fn le32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[test]
fn png_sequence_names_frames_by_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = PngSequenceSink::all(dir.path()).unwrap();

    sink.consume(&frame(0, true));
    sink.consume(&frame(1, true));
    sink.finish().unwrap();

    assert_eq!(sink.frames_written(), 2);
    for stream in Stream::ALL.iter() {
        for index in 0..2 {
            let path = dir.path().join(stream.name()).join(format!("{:08}.png", index));
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    // Color is stored as R, G, B
    match image::open(dir.path().join("color").join("00000001.png")).unwrap() {
        DynamicImage::ImageRgb8(color) => assert_eq!(*color.get_pixel(3, 3), Rgb([30, 20, 10])),
        other => panic!("unexpected color format {:?}", other.color())
    }

    match image::open(dir.path().join("left").join("00000000.png")).unwrap() {
        DynamicImage::ImageLuma8(left) => {
            assert_eq!(left.dimensions(), (WIDTH, HEIGHT));
            assert_eq!(*left.get_pixel(0, 0), Luma([50]));
        },
        other => panic!("unexpected left format {:?}", other.color())
    }
}

#[test]
fn png_sequence_writes_only_selected_streams() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = PngSequenceSink::new(dir.path(), &[Stream::Left, Stream::Disparity]).unwrap();

    // Without disparity only the left plane can be written
    sink.consume(&frame(3, false));
    sink.finish().unwrap();

    assert!(dir.path().join("left").join("00000003.png").exists());
    assert!(!dir.path().join("disparity").join("00000003.png").exists());
    assert!(!dir.path().join("right").exists());
}

#[test]
fn triggered_sequence_keeps_only_requested_frames() {
    let dir = tempfile::tempdir().unwrap();
    let trigger = CaptureTrigger::new();
    let mut sink =
        PngSequenceSink::on_trigger(dir.path(), &[Stream::Left, Stream::Right], trigger.clone())
            .unwrap();

    sink.consume(&frame(0, false));
    trigger.request();
    sink.consume(&frame(1, false));
    sink.consume(&frame(2, false));
    trigger.request();
    sink.consume(&frame(3, false));
    sink.finish().unwrap();

    // Captures are numbered in order, not by frame index
    assert_eq!(sink.frames_written(), 2);
    for stream in &["left", "right"] {
        assert!(dir.path().join(format!("{}_0000.png", stream)).exists());
        assert!(dir.path().join(format!("{}_0001.png", stream)).exists());
        assert!(!dir.path().join(format!("{}_0002.png", stream)).exists());
    }
    assert_eq!(
        sink.path_for(Stream::Left, 1),
        dir.path().join("left_0001.png")
    );
}

fn check_avi(buf: &[u8], fourcc: &[u8; 4], frames: u32) {
    assert_eq!(&buf[0..4], b"RIFF");
    assert_eq!(&buf[8..12], b"AVI ");
    assert_eq!(le32(buf, 4) as usize, buf.len() - 8);
    assert_eq!(&buf[112..116], fourcc);
    assert_eq!(&buf[188..192], fourcc);
    assert_eq!(le32(buf, 48), frames);
    assert_eq!(le32(buf, 64), WIDTH);
    assert_eq!(le32(buf, 68), HEIGHT);
    assert_eq!(&buf[224..228], b"00dc");

    // The index closes the file
    let idx = buf.len() - 8 - frames as usize * 16;
    assert_eq!(&buf[idx..idx + 4], b"idx1");
}

#[test]
fn default_codec_is_divx() {
    assert_eq!(VideoCodec::default(), VideoCodec::Divx);
}

#[cfg(feature = "video-ffmpeg")]
#[test]
fn default_video_sink_records_divx() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = VideoSink::new(dir.path(), WIDTH, HEIGHT, 30, true).unwrap();

    for index in 0..3 {
        sink.consume(&frame(index, true));
    }
    sink.finish().unwrap();

    assert_eq!(sink.codec(), VideoCodec::Divx);
    assert_eq!(sink.frames_written(), 3);
    for name in &["color.avi", "disparity.avi", "heatmap.avi"] {
        check_avi(&fs::read(dir.path().join(name)).unwrap(), b"DIVX", 3);
    }
}

#[cfg(not(feature = "video-ffmpeg"))]
#[test]
fn default_video_sink_falls_back_to_mjpg() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = VideoSink::new(dir.path(), WIDTH, HEIGHT, 30, false).unwrap();

    sink.consume(&frame(0, false));
    sink.finish().unwrap();

    assert_eq!(sink.codec(), VideoCodec::Mjpeg);
    check_avi(&fs::read(dir.path().join("color.avi")).unwrap(), b"MJPG", 1);
}

#[test]
fn mjpg_video_sink_records_three_streams() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = VideoSink::with_codec(dir.path(), WIDTH, HEIGHT, 30, true, VideoCodec::Mjpeg).unwrap();

    for index in 0..3 {
        sink.consume(&frame(index, true));
    }
    sink.finish().unwrap();

    assert_eq!(sink.frames_written(), 3);
    for name in &["color.avi", "disparity.avi", "heatmap.avi"] {
        let buf = fs::read(dir.path().join(name)).unwrap();
        check_avi(&buf, b"MJPG", 3);

        // The first chunk is a JPEG
        assert_eq!(&buf[232..234], &[0xff, 0xd8]);
    }
}

#[test]
fn video_streams_stay_in_step_when_a_frame_is_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = VideoSink::with_codec(dir.path(), WIDTH, HEIGHT, 30, true, VideoCodec::Mjpeg).unwrap();

    let mut bad_heatmap = frame(1, true);
    bad_heatmap.heatmap = Some(RgbImage::new(WIDTH / 2, HEIGHT));

    sink.consume(&frame(0, true));
    sink.consume(&bad_heatmap);
    sink.consume(&frame(2, false));
    sink.consume(&frame(3, true));
    sink.finish().unwrap();

    assert_eq!(sink.frames_written(), 2);
    for name in &["color.avi", "disparity.avi", "heatmap.avi"] {
        check_avi(&fs::read(dir.path().join(name)).unwrap(), b"MJPG", 2);
    }
}

#[test]
fn video_sink_skips_frames_of_the_wrong_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = VideoSink::with_codec(dir.path(), WIDTH * 2, HEIGHT, 30, false, VideoCodec::Mjpeg).unwrap();

    sink.consume(&frame(0, false));
    sink.finish().unwrap();

    assert_eq!(sink.frames_written(), 0);
    assert!(!dir.path().join("disparity.avi").exists());
}
