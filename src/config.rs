//! # Configuration
//!
//! Settings are read from an optional TOML file. Every key may be omitted, missing keys take their
//! defaults, and the command line may override the result before it is validated.
//!
//! ```toml
//! max_disparity_factor = 2
//! write_output = true
//! output_dir = "output"
//!
//! [retry]
//! max_consecutive_failures = 10
//! initial_backoff_ms = 10
//! max_backoff_ms = 1000
//!
//! [matcher]
//! mode = "three_way"
//! uniqueness_ratio = 10
//! disp12_max_diff = 12
//! speckle_window_size = 64
//! speckle_range = 2
//!
//! [filter]
//! lambda = 8000.0
//! sigma_color = 3.0
//!
//! [video]
//! fps = 30
//! codec = "divx"
//!
//! [pipeline]
//! enabled = false
//! queue_capacity = 2
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::acquisition::{
    RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_MAX_CONSECUTIVE_FAILURES
};
use crate::disparity::DisparityConfig;
use crate::error::*;
use crate::pipeline::DEFAULT_QUEUE_CAPACITY;
use crate::postfilter::{FilterConfig, DEFAULT_LAMBDA, DEFAULT_SIGMA_COLOR};
use crate::sgbm::{Mode, Params};
use crate::sink::{VideoCodec, DEFAULT_FPS};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_OUTPUT_DIR: &str = "output";

// -----------------------------------------------------------------------------------------------
// FILE STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    max_disparity_factor: Option<u32>,
    write_output: Option<bool>,
    output_dir: Option<PathBuf>,
    retry: Option<RetryFile>,
    matcher: Option<MatcherFile>,
    filter: Option<FilterFile>,
    video: Option<VideoFile>,
    pipeline: Option<PipelineFile>
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RetryFile {
    max_consecutive_failures: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MatcherFile {
    mode: Option<Mode>,
    uniqueness_ratio: Option<u32>,
    disp12_max_diff: Option<i32>,
    speckle_window_size: Option<u32>,
    speckle_range: Option<u32>
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FilterFile {
    lambda: Option<f64>,
    sigma_color: Option<f64>
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VideoFile {
    fps: Option<u32>,
    codec: Option<VideoCodec>
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineFile {
    enabled: Option<bool>,
    queue_capacity: Option<usize>
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Resolved settings of a depthcam run.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthcamConfig {
    pub disparity: DisparityConfig,

    /// Whether recording sinks are attached.
    pub write_output: bool,
    pub output_dir: PathBuf,
    pub retry: RetryPolicy,
    pub matcher: MatcherSettings,
    pub filter: FilterConfig,
    pub video: VideoSettings,
    pub pipeline: PipelineSettings
}

/// Matcher settings which do not depend on the search range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherSettings {
    pub mode: Mode,
    pub uniqueness_ratio: u32,
    pub disp12_max_diff: i32,
    pub speckle_window_size: u32,
    pub speckle_range: u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub fps: u32,

    /// Requested codec, `DIVX` unless configured otherwise.
    pub codec: VideoCodec
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Run capture, processing and output on separate threads.
    pub enabled: bool,
    pub queue_capacity: usize
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for DepthcamConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl DepthcamConfig {
    /// Load the configuration file at `path`, or the defaults when no path is given.
    ///
    /// The result is not validated, so that command line overrides can be applied first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                log::info!("Loaded configuration from {}", path.display());
                Self::from_toml_str(&raw)
            },
            None => Ok(Self::default())
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: ConfigFile) -> Self {
        let retry = file.retry.unwrap_or_default();
        let matcher = file.matcher.unwrap_or_default();
        let filter = file.filter.unwrap_or_default();
        let reference = Params::default();
        let video = file.video.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();

        Self {
            disparity: DisparityConfig {
                max_disparity_factor: file
                    .max_disparity_factor
                    .unwrap_or_else(|| DisparityConfig::default().max_disparity_factor)
            },
            write_output: file.write_output.unwrap_or(true),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            retry: RetryPolicy {
                max_consecutive_failures: retry
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
                initial_backoff: Duration::from_millis(
                    retry.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS)
                ),
                max_backoff: Duration::from_millis(
                    retry.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS)
                )
            },
            matcher: MatcherSettings {
                mode: matcher.mode.unwrap_or(reference.mode),
                uniqueness_ratio: matcher.uniqueness_ratio.unwrap_or(reference.uniqueness_ratio),
                disp12_max_diff: matcher.disp12_max_diff.unwrap_or(reference.disp12_max_diff),
                speckle_window_size: matcher
                    .speckle_window_size
                    .unwrap_or(reference.speckle_window_size),
                speckle_range: matcher.speckle_range.unwrap_or(reference.speckle_range)
            },
            filter: FilterConfig {
                lambda: filter.lambda.unwrap_or(DEFAULT_LAMBDA),
                sigma_color: filter.sigma_color.unwrap_or(DEFAULT_SIGMA_COLOR)
            },
            video: VideoSettings {
                fps: video.fps.unwrap_or(DEFAULT_FPS),
                codec: video.codec.unwrap_or_default()
            },
            pipeline: PipelineSettings {
                enabled: pipeline.enabled.unwrap_or(false),
                queue_capacity: pipeline.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY)
            }
        }
    }

    /// Full matcher parameters for the configured search range.
    pub fn matcher_params(&self) -> Params {
        Params {
            mode: self.matcher.mode,
            uniqueness_ratio: self.matcher.uniqueness_ratio,
            disp12_max_diff: self.matcher.disp12_max_diff,
            speckle_window_size: self.matcher.speckle_window_size,
            speckle_range: self.matcher.speckle_range,
            ..Params::with_num_disparities(self.disparity.num_disparities())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.disparity.validate()?;
        self.matcher_params().validate()?;

        if self.retry.max_consecutive_failures == 0 {
            return Err(Error::Configuration(String::from(
                "retry.max_consecutive_failures must be at least 1"
            )));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(Error::Configuration(String::from(
                "retry.max_backoff_ms must not be less than retry.initial_backoff_ms"
            )));
        }
        if !(self.filter.lambda > 0.0) || !(self.filter.sigma_color > 0.0) {
            return Err(Error::Configuration(format!(
                "filter.lambda ({}) and filter.sigma_color ({}) must be positive",
                self.filter.lambda,
                self.filter.sigma_color
            )));
        }
        if self.video.fps == 0 {
            return Err(Error::Configuration(String::from("video.fps must be at least 1")));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::Configuration(String::from(
                "pipeline.queue_capacity must be at least 1"
            )));
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = DepthcamConfig::from_toml_str("").unwrap();

        assert_eq!(config, DepthcamConfig::default());
        assert_eq!(config.disparity.max_disparity_factor, 1);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.codec, VideoCodec::Divx);
        assert_eq!(config.matcher_params(), Params::default());
        assert_eq!(config.pipeline.queue_capacity, 2);
        assert!(config.write_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sections_override_defaults() {
        let config = DepthcamConfig::from_toml_str(
            r#"
            max_disparity_factor = 4
            output_dir = "/tmp/run"

            [retry]
            max_consecutive_failures = 3

            [filter]
            sigma_color = 1.5

            [pipeline]
            enabled = true
            "#
        ).unwrap();

        assert_eq!(config.disparity.num_disparities(), 64);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/run"));
        assert_eq!(config.retry.max_consecutive_failures, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.filter.lambda, DEFAULT_LAMBDA);
        assert_eq!(config.filter.sigma_color, 1.5);
        assert!(config.pipeline.enabled);
    }

    #[test]
    fn matcher_section_reaches_the_matcher_params() {
        let config = DepthcamConfig::from_toml_str(
            r#"
            max_disparity_factor = 2

            [matcher]
            mode = "eight_way"
            uniqueness_ratio = 5

            [video]
            codec = "mjpeg"
            "#
        ).unwrap();

        let params = config.matcher_params();
        assert_eq!(params.mode, Mode::EightWay);
        assert_eq!(params.uniqueness_ratio, 5);
        assert_eq!(params.num_disparities, 32);
        assert_eq!(params.p1, 216);
        assert_eq!(params.speckle_window_size, 64);
        assert_eq!(config.video.codec, VideoCodec::Mjpeg);
        assert!(config.validate().is_ok());

        assert!(matches!(
            DepthcamConfig::from_toml_str("[matcher]\nmode = \"two_way\""),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn unknown_keys_fail_to_parse() {
        assert!(matches!(
            DepthcamConfig::from_toml_str("max_disparity = 2"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let mut config = DepthcamConfig::default();
        config.disparity.max_disparity_factor = 17;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = DepthcamConfig::default();
        config.video.fps = 0;
        assert!(config.validate().is_err());

        let mut config = DepthcamConfig::default();
        config.retry.max_backoff = Duration::from_millis(1);
        assert!(config.validate().is_err());
    }
}
