//! # Acquisition loop
//!
//! This module drives a [`Camera`] through a capture session: it opens and configures the device,
//! retrieves frames (retrying transient failures with exponential backoff), runs each frame
//! through the [`DepthPipeline`] and dispatches the result to every registered [`FrameSink`].
//!
//! The loop moves through `Idle -> Capturing -> Stopping -> Stopped`. A frame whose buffers turn
//! out to be malformed is dropped and the loop carries on with the next one.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::camera::{Camera, Format7Settings};
use crate::depth::DepthPipeline;
use crate::error::*;
use crate::frame::{PixelFormat, RawFrame};
use crate::sink::FrameSink;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 10;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 1000;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Capturing,
    Stopping,
    Stopped
}

/// Something worth reporting happened in the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// Capture started with the given settings.
    Started(Format7Settings),

    /// A buffer retrieval failed and will be retried.
    TransientError {
        attempt: u32,
        error: String
    },

    /// A processed frame was handed to every sink.
    FrameDispatched {
        index: u64,
        elapsed: Duration
    },

    /// A frame was discarded without reaching the sinks.
    FrameDropped {
        sequence: u64,
        reason: String
    },

    Stopped(LoopStats)
}

/// Outcome of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Dispatched(u64),
    Dropped
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// How transient retrieval failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of failures in a row after which the device is considered unavailable.
    pub max_consecutive_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_dispatched: u64,
    pub frames_dropped: u64,
    pub transient_errors: u64
}

/// Shared cancellation flag, checked by the loop once per iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

type Observer = Box<dyn FnMut(&LoopEvent) + Send>;

pub struct AcquisitionLoop<C: Camera> {
    camera: C,
    pipeline: DepthPipeline,
    sinks: Vec<Box<dyn FrameSink>>,
    retry: RetryPolicy,
    state: LoopState,
    stats: LoopStats,
    settings: Option<Format7Settings>,
    next_index: u64,
    observer: Option<Observer>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Capturing => "capturing",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped"
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS)
        }
    }
}

impl RetryPolicy {
    /// A policy which retries immediately.
    pub fn immediate(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures,
            initial_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0)
        }
    }

    /// Delay before retrying after the given number of consecutive failures.
    ///
    /// Doubles from `initial_backoff` with every failure, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1 << doublings)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl<C: Camera> AcquisitionLoop<C> {
    pub fn new(camera: C, pipeline: DepthPipeline, retry: RetryPolicy) -> Self {
        Self {
            camera,
            pipeline,
            sinks: Vec::new(),
            retry,
            state: LoopState::Idle,
            stats: LoopStats::default(),
            settings: None,
            next_index: 0,
            observer: None
        }
    }

    pub fn add_sink<S: FrameSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    pub fn with_sink<S: FrameSink + 'static>(mut self, sink: S) -> Self {
        self.add_sink(sink);
        self
    }

    /// Register a closure receiving every [`LoopEvent`].
    pub fn set_observer<F: FnMut(&LoopEvent) + Send + 'static>(&mut self, observer: F) {
        self.observer = Some(Box::new(observer));
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Settings capture was started with.
    pub fn settings(&self) -> Option<&Format7Settings> {
        self.settings.as_ref()
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Connect to and configure the camera, then start capturing.
    ///
    /// Without explicit settings the full sensor is captured in `RAW16`. Invalid settings leave
    /// the loop in its previous state and the camera disconnected.
    pub fn start(&mut self, settings: Option<Format7Settings>) -> Result<Format7Settings> {
        if self.state != LoopState::Idle {
            return Err(Error::InvalidState {
                operation: "start capture",
                state: self.state.name()
            });
        }

        let settings = open_camera(&mut self.camera, settings)?;

        self.settings = Some(settings);
        self.state = LoopState::Capturing;
        self.emit(LoopEvent::Started(settings));

        Ok(settings)
    }

    /// Run a single iteration: retrieve, process and dispatch one frame.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state != LoopState::Capturing {
            return Err(Error::InvalidState {
                operation: "step",
                state: self.state.name()
            });
        }

        let start = Instant::now();

        let retry = self.retry;
        let mut failures = Vec::new();
        let raw = retrieve_with_retry(&mut self.camera, &retry, |attempt, e| {
            failures.push(LoopEvent::TransientError {
                attempt,
                error: e.to_string()
            });
        });
        for event in failures {
            self.stats.transient_errors += 1;
            self.emit(event);
        }
        let raw = raw?;

        let bgr = match self.camera.convert_to_bgr(&raw) {
            Ok(bgr) => bgr,
            Err(e) if e.is_frame_local() || e.is_transient() => return Ok(self.drop_frame(&raw, e)),
            Err(e) => return Err(e)
        };

        let frame = match self.pipeline.process(self.next_index, &raw, &bgr) {
            Ok(frame) => frame,
            Err(e) if e.is_frame_local() => return Ok(self.drop_frame(&raw, e)),
            Err(e) => return Err(e)
        };

        for sink in self.sinks.iter_mut() {
            sink.consume(&frame);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.stats.frames_dispatched += 1;
        self.emit(LoopEvent::FrameDispatched {
            index,
            elapsed: start.elapsed()
        });

        Ok(StepOutcome::Dispatched(index))
    }

    /// Step until cancelled or until an unrecoverable error, then stop.
    ///
    /// Cancellation is checked after each iteration's dispatch. The camera is released and the
    /// sinks flushed whichever way the run ends.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<LoopStats> {
        let result = loop {
            if let Err(e) = self.step() {
                break Err(e);
            }
            if cancel.is_cancelled() {
                log::info!("Cancellation requested");
                break Ok(());
            }
        };

        let stopped = self.stop();
        result?;
        stopped?;

        Ok(self.stats)
    }

    /// Flush the sinks and release the camera.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            LoopState::Stopped => return Ok(()),
            LoopState::Idle => {
                self.state = LoopState::Stopped;
                return Ok(());
            },
            LoopState::Capturing | LoopState::Stopping => ()
        }

        self.state = LoopState::Stopping;

        let flushed = finish_sinks(&mut self.sinks);
        let closed = close_camera(&mut self.camera);

        self.state = LoopState::Stopped;
        self.emit(LoopEvent::Stopped(self.stats));

        flushed?;
        closed
    }

    fn drop_frame(&mut self, raw: &RawFrame, error: Error) -> StepOutcome {
        self.stats.frames_dropped += 1;
        self.emit(LoopEvent::FrameDropped {
            sequence: raw.sequence,
            reason: error.to_string()
        });

        StepOutcome::Dropped
    }

    fn emit(&mut self, event: LoopEvent) {
        match &event {
            LoopEvent::Started(s) => log::info!(
                "Capture started: {}x{}+{}+{} {}",
                s.width,
                s.height,
                s.offset_x,
                s.offset_y,
                s.pixel_format
            ),
            LoopEvent::TransientError { attempt, error } => {
                log::warn!("Retrieval attempt {} failed: {}", attempt, error)
            },
            LoopEvent::FrameDispatched { index, elapsed } => {
                log::debug!("Frame {} dispatched after {:?}", index, elapsed)
            },
            LoopEvent::FrameDropped { sequence, reason } => {
                log::warn!("Dropped frame {}: {}", sequence, reason)
            },
            LoopEvent::Stopped(stats) => log::info!(
                "Capture stopped: {} frames dispatched, {} dropped, {} transient errors",
                stats.frames_dispatched,
                stats.frames_dropped,
                stats.transient_errors
            )
        }

        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Connect, validate the requested settings against the camera's capabilities and start capture.
///
/// On a configuration error the camera is disconnected again.
pub(crate) fn open_camera<C: Camera>(
    camera: &mut C,
    settings: Option<Format7Settings>
) -> Result<Format7Settings> {
    camera.connect()?;

    let configured = camera.format7_info().and_then(|info| {
        log::info!("{}", info);

        let settings = settings.unwrap_or_else(|| Format7Settings::full_frame(&info, PixelFormat::Raw16));
        if settings.pixel_format != PixelFormat::Raw16 {
            return Err(Error::Configuration(format!(
                "stereo capture needs {} frames, not {}",
                PixelFormat::Raw16,
                settings.pixel_format
            )));
        }
        settings.validate(&info)?;

        camera.configure(&settings)?;
        camera.start_capture()?;
        Ok(settings)
    });

    if configured.is_err() {
        if let Err(e) = camera.disconnect() {
            log::warn!("Could not disconnect after a failed start: {}", e);
        }
    }

    configured
}

/// Retrieve a buffer, retrying transient errors according to `policy`.
///
/// `on_failure` is called with the attempt number of every transient failure. After
/// `max_consecutive_failures` failures in a row [`Error::DeviceUnavailable`] is returned.
pub(crate) fn retrieve_with_retry<C, F>(
    camera: &mut C,
    policy: &RetryPolicy,
    mut on_failure: F
) -> Result<RawFrame>
where
    C: Camera,
    F: FnMut(u32, &Error)
{
    let mut failures = 0;

    loop {
        match camera.retrieve_buffer() {
            Ok(raw) => return Ok(raw),
            Err(e) if e.is_transient() => {
                failures += 1;
                on_failure(failures, &e);

                if failures >= policy.max_consecutive_failures {
                    return Err(Error::DeviceUnavailable {
                        attempts: failures,
                        last: e.to_string()
                    });
                }

                let delay = policy.backoff(failures);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            },
            Err(e) => return Err(e)
        }
    }
}

/// Stop capture and disconnect, attempting both even if the first fails.
pub(crate) fn close_camera<C: Camera>(camera: &mut C) -> Result<()> {
    let stopped = camera.stop_capture();
    let disconnected = camera.disconnect();

    stopped?;
    disconnected
}

/// Finish every sink, returning the first error after trying them all.
pub(crate) fn finish_sinks(sinks: &mut [Box<dyn FrameSink>]) -> Result<()> {
    let mut result = Ok(());

    for sink in sinks.iter_mut() {
        if let Err(e) = sink.finish() {
            log::error!("Could not finish {} sink: {}", sink.name(), e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    result
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
        assert_eq!(policy.backoff(8), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();

        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }
}
