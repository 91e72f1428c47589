//! # Pipelined acquisition
//!
//! Runs the threaded capture, compute and sink stages against the synthetic camera.

use std::sync::{Arc, Mutex};

use cv_depthcam::camera::SyntheticConfig;
use cv_depthcam::prelude::*;

/// Records frame indices and cancels the run after a number of frames.
struct CancelAfter {
    seen: Arc<Mutex<Vec<u64>>>,
    limit: usize,
    cancel: CancelToken
}

impl FrameSink for CancelAfter {
    fn consume(&mut self, frame: &DepthFrame) {
        let mut seen = self.seen.lock().unwrap();
        seen.push(frame.index);
        if seen.len() >= self.limit {
            self.cancel.cancel();
        }
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn camera(fail_every: Option<u64>) -> SyntheticCamera {
    SyntheticCamera::new(SyntheticConfig {
        width: 64,
        height: 32,
        disparity: 4,
        fail_every,
        ..SyntheticConfig::default()
    })
}

#[test]
fn pipelined_run_dispatches_until_cancelled() {
    let cancel = CancelToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = DepthPipeline::new(DisparityConfig::default(), FilterConfig::default()).unwrap();

    let runner = PipelinedLoop::new(camera(None), pipeline, RetryPolicy::immediate(5), 2)
        .with_sink(CancelAfter {
            seen: seen.clone(),
            limit: 3,
            cancel: cancel.clone()
        });
    let stats = runner.run(None, &cancel).unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 3);
    assert_eq!(stats.frames_dispatched, seen.len() as u64);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn pipelined_run_counts_transient_errors() {
    let cancel = CancelToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let runner = PipelinedLoop::new(camera(Some(2)), DepthPipeline::capture_only(), RetryPolicy::immediate(5), 4)
        .with_sink(CancelAfter {
            seen: seen.clone(),
            limit: 4,
            cancel: cancel.clone()
        });
    let stats = runner.run(None, &cancel).unwrap();

    assert!(stats.frames_dispatched >= 4);
    assert!(stats.transient_errors >= 3);
}

#[test]
fn pipelined_run_reports_configuration_errors() {
    let cancel = CancelToken::new();
    let settings = Format7Settings {
        mode: 3,
        offset_x: 0,
        offset_y: 0,
        width: 64,
        height: 32,
        pixel_format: PixelFormat::Mono8
    };

    let runner = PipelinedLoop::new(camera(None), DepthPipeline::capture_only(), RetryPolicy::default(), 2);

    assert!(matches!(runner.run(Some(settings), &cancel), Err(Error::Configuration(_))));
}
