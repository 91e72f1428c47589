//! depthcam - live stereo capture and depth estimation

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use cv_depthcam::camera::{SyntheticCamera, SyntheticConfig};
use cv_depthcam::config::DepthcamConfig;
use cv_depthcam::prelude::*;
use cv_depthcam::sink::{CaptureTrigger, PngSequenceSink, Stream, VideoSink};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "DEPTHCAM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory output is written to.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Do not write any output files.
    #[arg(long, global = true)]
    no_write: bool,

    /// Run capture, processing and output on separate threads.
    #[arg(long, global = true)]
    pipelined: bool,

    /// Stop after this many frames instead of waiting for Ctrl-C.
    #[arg(long, global = true)]
    frames: Option<u64>,

    /// Show the left view and heatmap in a window (q or Escape quits).
    #[cfg(feature = "preview")]
    #[arg(long, global = true)]
    preview: bool,

    #[command(flatten)]
    source: SourceArgs,

    #[command(subcommand)]
    command: Command
}

/// Settings of the synthetic stereo source.
#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Disparity of the synthetic foreground, in pixels.
    #[arg(long, default_value_t = 8)]
    scene_disparity: u32,

    /// Inject a transient read failure every n-th retrieval.
    #[arg(long)]
    fail_every: Option<u64>,

    /// Source frame rate.
    #[arg(long, default_value_t = 30)]
    source_fps: u32
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture left, right and color image sequences.
    Capture {
        /// Comma separated streams to write.
        #[arg(long, value_delimiter = ',', default_value = "left,right,color")]
        streams: Vec<String>,

        /// Open the preview and only save a frame when space is pressed.
        #[cfg(feature = "preview")]
        #[arg(long)]
        on_key: bool
    },

    /// Estimate depth live and record color, disparity and heatmap videos.
    Depth {
        /// Search range in multiples of 16 pixels.
        #[arg(long)]
        max_disparity_factor: Option<u32>,

        #[arg(long)]
        lambda: Option<f64>,

        #[arg(long)]
        sigma_color: Option<f64>
    }
}

/// Cancels the run once a number of frames has been dispatched.
struct FrameLimit {
    remaining: u64,
    cancel: CancelToken
}

impl FrameSink for FrameLimit {
    fn consume(&mut self, _frame: &DepthFrame) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.cancel.cancel();
        }
    }

    fn finish(&mut self) -> cv_depthcam::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "frame limit"
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = DepthcamConfig::load(cli.config.as_deref())
        .context("failed to load the configuration")?;
    apply_overrides(&cli, &mut config);
    config.validate()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("failed to install Ctrl-C handler")?;
    }

    let (width, height) = (cli.source.width, cli.source.height);
    let camera = SyntheticCamera::new(SyntheticConfig {
        width,
        height,
        disparity: cli.source.scene_disparity,
        fail_every: cli.source.fail_every,
        frame_interval: Duration::from_millis(1000 / u64::from(cli.source.source_fps.max(1))),
        ..SyntheticConfig::default()
    });

    let pipeline = match &cli.command {
        Command::Capture { .. } => DepthPipeline::capture_only(),
        Command::Depth { .. } => DepthPipeline::with_params(config.matcher_params(), config.filter)
    };

    let trigger = on_key_trigger(&cli.command);
    let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();

    if config.write_output {
        match &cli.command {
            Command::Capture { streams, .. } => {
                let streams = streams
                    .iter()
                    .map(|s| Stream::from_name(s.trim()))
                    .collect::<cv_depthcam::Result<Vec<_>>>()?;
                let sink = match &trigger {
                    Some(trigger) => PngSequenceSink::on_trigger(
                        config.output_dir.join("press"),
                        &streams,
                        trigger.clone()
                    )?,
                    None => PngSequenceSink::new(&config.output_dir, &streams)?
                };
                sinks.push(Box::new(sink));
            },
            Command::Depth { .. } => {
                sinks.push(Box::new(VideoSink::with_codec(
                    config.output_dir.join("videos"),
                    width,
                    height,
                    config.video.fps,
                    true,
                    config.video.codec
                )?));
            }
        }
    }

    #[cfg(feature = "preview")]
    {
        if cli.preview || trigger.is_some() {
            let mut preview = cv_depthcam::sink::PreviewSink::new(width, height, cancel.clone())?;
            if let Some(trigger) = &trigger {
                log::info!("Press space to capture, q to quit");
                preview = preview.with_trigger(trigger.clone());
            }
            sinks.push(Box::new(preview));
        }
    }

    if let Some(frames) = cli.frames {
        sinks.push(Box::new(FrameLimit {
            remaining: frames,
            cancel: cancel.clone()
        }));
    }

    let stats = match config.pipeline.enabled {
        true => {
            let mut runner = PipelinedLoop::new(
                camera,
                pipeline,
                config.retry,
                config.pipeline.queue_capacity
            );
            for sink in sinks {
                runner.add_sink(sink);
            }
            runner.run(None, &cancel)?
        },
        false => {
            let mut acquisition = AcquisitionLoop::new(camera, pipeline, config.retry);
            for sink in sinks {
                acquisition.add_sink(sink);
            }
            acquisition.start(None)?;
            acquisition.run(&cancel)?
        }
    };

    println!(
        "{} frames dispatched, {} dropped, {} transient errors",
        stats.frames_dispatched,
        stats.frames_dropped,
        stats.transient_errors
    );

    Ok(())
}

/// The capture request shared by the preview and the image sequence in `capture --on-key`.
#[cfg(feature = "preview")]
fn on_key_trigger(command: &Command) -> Option<CaptureTrigger> {
    match command {
        Command::Capture { on_key: true, .. } => Some(CaptureTrigger::new()),
        _ => None
    }
}

#[cfg(not(feature = "preview"))]
fn on_key_trigger(_command: &Command) -> Option<CaptureTrigger> {
    None
}

fn apply_overrides(cli: &Cli, config: &mut DepthcamConfig) {
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if cli.no_write {
        config.write_output = false;
    }
    if cli.pipelined {
        config.pipeline.enabled = true;
    }

    if let Command::Depth {
        max_disparity_factor,
        lambda,
        sigma_color
    } = &cli.command
    {
        if let Some(factor) = max_disparity_factor {
            config.disparity.max_disparity_factor = *factor;
        }
        if let Some(lambda) = lambda {
            config.filter.lambda = *lambda;
        }
        if let Some(sigma) = sigma_color {
            config.filter.sigma_color = *sigma;
        }
    }
}
