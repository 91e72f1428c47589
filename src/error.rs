//! # Error standards
//!
//! This module provides a standardised error enum and result type for this crate.

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// Standard result type used in the depthcam crate.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A buffer does not match the dimensions declared for its pixel format.
    #[error("Buffer of {actual} bytes does not match {rows}x{cols} {format} (expected {expected} bytes)")]
    Shape {
        rows: u32,
        cols: u32,
        format: &'static str,
        expected: usize,
        actual: usize
    },

    /// The disparity maps given to the post-filter do not match the guide image.
    #[error("Disparity map {map} is {map_width}x{map_height} but the guide is {guide_width}x{guide_height}")]
    Filter {
        map: &'static str,
        map_width: u32,
        map_height: u32,
        guide_width: u32,
        guide_height: u32
    },

    /// The camera cannot be configured as requested, or the configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A recoverable device read failure.
    #[error("Transient device error: {0}")]
    Transient(String),

    /// The device failed to deliver a frame too many times in a row.
    #[error("Device unavailable after {attempts} consecutive failures (last error: {last})")]
    DeviceUnavailable {
        attempts: u32,
        last: String
    },

    /// An operation was requested in a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Statistics plotting failed: {0}")]
    Statistics(String),

    /// The preview window could not be opened or updated.
    #[error("Preview window error: {0}")]
    Preview(String),

    /// A video encoder could not be opened or rejected a frame.
    #[error("Video encoder error: {0}")]
    Encoder(String)
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Error {
    /// Whether the acquisition loop should retry the operation which raised this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether this error only affects the current frame, which can be dropped.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Error::Shape { .. } | Error::Filter { .. })
    }
}
