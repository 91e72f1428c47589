//! AVI container writer.
//!
//! Writes a single video stream RIFF AVI file: the `hdrl` header list, a `movi` list with one
//! `00dc` chunk per compressed frame and a trailing `idx1` index. Frame counts and list sizes are unknown
//! until the end, so the header is written with zeroed counts and rewritten by
//! [`AviWriter::finish`].

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use super::encoder::{EncodedFrame, VideoCodec};
use crate::error::*;

/// Size of everything before the first frame chunk.
pub const HEADER_LEN: usize = 224;

/// Offset of the `movi` fourcc, which index offsets are relative to.
const MOVI_FOURCC_OFFSET: u32 = 220;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

struct IndexEntry {
    offset: u32,
    size: u32,
    flags: u32
}

pub struct AviWriter<W: Write + Seek> {
    inner: W,
    width: u32,
    height: u32,
    fps: u32,
    codec: VideoCodec,
    index: Vec<IndexEntry>,
    movi_len: u32,
    largest_chunk: u32,
    finished: bool
}

impl AviWriter<BufWriter<File>> {
    /// Create an AVI file at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        fps: u32,
        codec: VideoCodec
    ) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), width, height, fps, codec)
    }
}

impl<W: Write + Seek> AviWriter<W> {
    pub fn new(inner: W, width: u32, height: u32, fps: u32, codec: VideoCodec) -> Result<Self> {
        if width == 0 || height == 0 || fps == 0 {
            return Err(Error::Configuration(format!(
                "cannot record {}x{} video at {} fps",
                width,
                height,
                fps
            )));
        }

        let mut writer = Self {
            inner,
            width,
            height,
            fps,
            codec,
            index: Vec::new(),
            movi_len: 4,
            largest_chunk: 0,
            finished: false
        };
        let header = writer.header(0);
        writer.inner.write_all(&header)?;

        Ok(writer)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// Append one compressed frame.
    pub fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState {
                operation: "write a frame",
                state: "finished"
            });
        }

        let size = frame.data.len() as u32;
        self.index.push(IndexEntry {
            offset: self.movi_len,
            size,
            flags: match frame.keyframe {
                true => AVIIF_KEYFRAME,
                false => 0
            }
        });

        self.inner.write_all(b"00dc")?;
        self.inner.write_all(&size.to_le_bytes())?;
        self.inner.write_all(&frame.data)?;
        if size % 2 == 1 {
            self.inner.write_all(&[0])?;
        }

        self.movi_len += 8 + size + size % 2;
        self.largest_chunk = self.largest_chunk.max(size);
        Ok(())
    }

    /// Write the index, rewrite the header with the final counts and flush.
    ///
    /// Calling this more than once has no further effect.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.inner.write_all(b"idx1")?;
        self.inner.write_all(&(self.index.len() as u32 * 16).to_le_bytes())?;
        for entry in &self.index {
            self.inner.write_all(b"00dc")?;
            self.inner.write_all(&entry.flags.to_le_bytes())?;
            self.inner.write_all(&entry.offset.to_le_bytes())?;
            self.inner.write_all(&entry.size.to_le_bytes())?;
        }

        let file_len = self.inner.seek(SeekFrom::End(0))? as u32;
        let header = self.header(file_len);
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&header)?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;

        Ok(())
    }

    /// Consume the writer, returning the underlying stream. Finishes the file first.
    pub fn into_inner(mut self) -> Result<W> {
        self.finish()?;
        Ok(self.inner)
    }

    /// Build the header for a file of `file_len` bytes, or with zeroed sizes while recording.
    fn header(&self, file_len: u32) -> Vec<u8> {
        let frames = self.index.len() as u32;
        let riff_len = file_len.saturating_sub(8);
        let frame_bytes = self.width * self.height * 3;

        let mut h = Header(Vec::with_capacity(HEADER_LEN));

        h.fourcc(b"RIFF").u32(riff_len).fourcc(b"AVI ");
        h.fourcc(b"LIST").u32(192).fourcc(b"hdrl");

        // Main header
        h.fourcc(b"avih").u32(56)
            .u32(1_000_000 / self.fps)
            .u32(self.largest_chunk * self.fps)
            .u32(0)
            .u32(AVIF_HASINDEX)
            .u32(frames)
            .u32(0)
            .u32(1)
            .u32(self.largest_chunk)
            .u32(self.width)
            .u32(self.height)
            .u32(0).u32(0).u32(0).u32(0);

        // Stream header and format
        h.fourcc(b"LIST").u32(116).fourcc(b"strl");
        h.fourcc(b"strh").u32(56)
            .fourcc(b"vids")
            .fourcc(self.codec.fourcc())
            .u32(0)
            .u16(0).u16(0)
            .u32(0)
            .u32(1)
            .u32(self.fps)
            .u32(0)
            .u32(frames)
            .u32(self.largest_chunk)
            .u32(u32::MAX)
            .u32(0)
            .u16(0).u16(0).u16(self.width as u16).u16(self.height as u16);
        h.fourcc(b"strf").u32(40)
            .u32(40)
            .u32(self.width)
            .u32(self.height)
            .u16(1)
            .u16(24)
            .fourcc(self.codec.fourcc())
            .u32(frame_bytes)
            .u32(0).u32(0).u32(0).u32(0);

        h.fourcc(b"LIST").u32(self.movi_len).fourcc(b"movi");

        h.0
    }
}

/// Little-endian header builder.
struct Header(Vec<u8>);

impl Header {
    fn fourcc(&mut self, code: &[u8; 4]) -> &mut Self {
        self.0.extend_from_slice(code);
        self
    }

    fn u32(&mut self, val: u32) -> &mut Self {
        self.0.extend_from_slice(&val.to_le_bytes());
        self
    }

    fn u16(&mut self, val: u16) -> &mut Self {
        self.0.extend_from_slice(&val.to_le_bytes());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn le32(buf: &[u8], at: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn chunk(data: &[u8], keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            data: data.to_vec(),
            keyframe
        }
    }

    #[test]
    fn empty_header_has_expected_layout() {
        let writer = AviWriter::new(Cursor::new(Vec::new()), 64, 48, 30, VideoCodec::Divx).unwrap();
        let buf = writer.into_inner().unwrap().into_inner();

        assert_eq!(&buf[0..4], b"RIFF");
        assert_eq!(&buf[8..12], b"AVI ");
        assert_eq!(&buf[24..28], b"avih");
        assert_eq!(&buf[100..104], b"strh");
        assert_eq!(&buf[112..116], b"DIVX");
        assert_eq!(&buf[164..168], b"strf");
        assert_eq!(&buf[188..192], b"DIVX");
        assert_eq!(&buf[MOVI_FOURCC_OFFSET as usize..HEADER_LEN], b"movi");
        assert_eq!(le32(&buf, 32), 33_333);
        assert_eq!(le32(&buf, 48), 0);
        assert_eq!(buf.len(), HEADER_LEN + 8);
    }

    #[test]
    fn fallback_codec_is_tagged_mjpg() {
        let writer = AviWriter::new(Cursor::new(Vec::new()), 8, 8, 30, VideoCodec::Mjpeg).unwrap();
        let buf = writer.into_inner().unwrap().into_inner();

        assert_eq!(&buf[112..116], b"MJPG");
        assert_eq!(&buf[188..192], b"MJPG");
    }

    #[test]
    fn odd_chunks_are_padded_and_indexed() {
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), 8, 8, 30, VideoCodec::Divx).unwrap();
        writer.write_frame(&chunk(&[1, 2, 3], true)).unwrap();
        writer.write_frame(&chunk(&[4, 5], false)).unwrap();
        let buf = writer.into_inner().unwrap().into_inner();

        // Chunks of 3 + 1 padding and 2 bytes
        let movi_len = 4 + (8 + 4) + (8 + 2);
        assert_eq!(le32(&buf, 216), movi_len);
        assert_eq!(le32(&buf, 48), 2);
        assert_eq!(le32(&buf, 140), 2);
        assert_eq!(le32(&buf, 4) as usize, buf.len() - 8);

        let idx = 212 + 8 + movi_len as usize;
        assert_eq!(&buf[idx..idx + 4], b"idx1");
        assert_eq!(le32(&buf, idx + 4), 32);
        assert_eq!(le32(&buf, idx + 12), AVIIF_KEYFRAME);
        assert_eq!(le32(&buf, idx + 16), 4);
        assert_eq!(le32(&buf, idx + 20), 3);
        assert_eq!(le32(&buf, idx + 28), 0);
        assert_eq!(le32(&buf, idx + 32), 16);
        assert_eq!(le32(&buf, idx + 36), 2);
    }

    #[test]
    fn frames_after_finish_are_rejected() {
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), 8, 8, 30, VideoCodec::Mjpeg).unwrap();
        writer.write_frame(&chunk(&[1, 2], true)).unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            writer.write_frame(&chunk(&[3, 4], true)),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(writer.frame_count(), 1);
        assert_eq!(writer.codec(), VideoCodec::Mjpeg);
    }
}
