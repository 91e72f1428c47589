//! PNG image sequence sink.

use std::fs;
use std::path::{Path, PathBuf};

use super::{bgr_to_rgb, CaptureTrigger, FrameSink, Stream};
use crate::depth::DepthFrame;
use crate::error::*;

/// Writes each selected stream of every frame to `{dir}/{stream}/{index:08}.png`.
///
/// A sink made with [`PngSequenceSink::on_trigger`] only keeps requested frames, written flat as
/// `{dir}/{stream}_{number:04}.png` and numbered in the order they were captured.
pub struct PngSequenceSink {
    dir: PathBuf,
    streams: Vec<Stream>,
    trigger: Option<CaptureTrigger>,
    written: u64,
    failures: u64
}

impl PngSequenceSink {
    /// Create the sink and the per-stream directories.
    pub fn new<P: AsRef<Path>>(dir: P, streams: &[Stream]) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        for stream in streams {
            fs::create_dir_all(dir.join(stream.name()))?;
        }

        Ok(Self {
            dir,
            streams: streams.to_vec(),
            trigger: None,
            written: 0,
            failures: 0
        })
    }

    /// A sink writing every stream.
    pub fn all<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::new(dir, &Stream::ALL)
    }

    /// A sink writing only the frames requested through `trigger`.
    pub fn on_trigger<P: AsRef<Path>>(
        dir: P,
        streams: &[Stream],
        trigger: CaptureTrigger
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            streams: streams.to_vec(),
            trigger: Some(trigger),
            written: 0,
            failures: 0
        })
    }

    pub fn path_for(&self, stream: Stream, index: u64) -> PathBuf {
        match self.trigger {
            Some(_) => self.dir.join(format!("{}_{:04}.png", stream.name(), index)),
            None => self.dir.join(stream.name()).join(format!("{:08}.png", index))
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn write(&self, frame: &DepthFrame, number: u64) -> Result<()> {
        for &stream in &self.streams {
            let path = self.path_for(stream, number);

            match stream {
                Stream::Left => frame.left.save(&path)?,
                Stream::Right => frame.right.save(&path)?,
                Stream::Color => bgr_to_rgb(&frame.color).save(&path)?,
                Stream::Disparity => {
                    if let Some(disparity) = &frame.disparity {
                        disparity.save(&path)?;
                    }
                },
                Stream::Heatmap => {
                    if let Some(heatmap) = &frame.heatmap {
                        heatmap.save(&path)?;
                    }
                }
            }
        }

        Ok(())
    }
}

impl FrameSink for PngSequenceSink {
    fn consume(&mut self, frame: &DepthFrame) {
        let number = match &self.trigger {
            Some(trigger) => match trigger.take() {
                true => self.written,
                false => return
            },
            None => frame.index
        };

        match self.write(frame, number) {
            Ok(()) => {
                if self.trigger.is_some() {
                    log::info!("Frame {} captured as {:04}", frame.index, number);
                }
                self.written += 1
            },
            Err(e) => {
                self.failures += 1;
                log::warn!("Could not write frame {} to {}: {}", frame.index, self.dir.display(), e);
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        log::info!(
            "Wrote {} frames to {} ({} failed)",
            self.written,
            self.dir.display(),
            self.failures
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "png"
    }
}
