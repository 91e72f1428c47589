//! # Pipelined acquisition
//!
//! This module runs capture, processing and output as separate stages so that a slow sink never
//! stalls the camera. The capture thread owns the camera, the compute thread owns the
//! [`DepthPipeline`] and the sinks run on the calling thread. Stages are joined by bounded
//! [`FrameQueue`]s which drop their oldest entry when full, so output always shows the most recent
//! frames.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::acquisition::{
    close_camera, finish_sinks, open_camera, retrieve_with_retry, CancelToken, LoopStats,
    RetryPolicy
};
use crate::camera::{Camera, Format7Settings};
use crate::depth::{DepthFrame, DepthPipeline};
use crate::error::*;
use crate::frame::RawFrame;
use crate::sink::FrameSink;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,

    /// The queue was full and its oldest entry was discarded.
    ReplacedOldest,

    /// The queue is closed and the item was discarded.
    Closed
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Bounded multi-producer queue which evicts the oldest entry when full.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64
}

/// A captured frame travelling from the capture to the compute stage.
struct Captured {
    raw: RawFrame,
    bgr: Vec<u8>
}

/// Counters reported by the capture thread.
#[derive(Default)]
struct CaptureReport {
    transient_errors: u64,
    dropped: u64
}

pub struct PipelinedLoop<C: Camera + Send + 'static> {
    camera: C,
    pipeline: DepthPipeline,
    sinks: Vec<Box<dyn FrameSink>>,
    retry: RetryPolicy,
    queue_capacity: usize
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items, at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                evicted: 0
            }),
            available: Condvar::new(),
            capacity: capacity.max(1)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.lock();

        if state.closed {
            return PushOutcome::Closed;
        }

        let outcome = match state.items.len() >= self.capacity {
            true => {
                state.items.pop_front();
                state.evicted += 1;
                PushOutcome::ReplacedOldest
            },
            false => PushOutcome::Queued
        };
        state.items.push_back(item);
        self.available.notify_one();

        outcome
    }

    /// Block until an item is available, or return `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting items. Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items discarded to make room for newer ones.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Camera + Send + 'static> PipelinedLoop<C> {
    pub fn new(
        camera: C,
        pipeline: DepthPipeline,
        retry: RetryPolicy,
        queue_capacity: usize
    ) -> Self {
        Self {
            camera,
            pipeline,
            sinks: Vec::new(),
            retry,
            queue_capacity
        }
    }

    pub fn add_sink<S: FrameSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    pub fn with_sink<S: FrameSink + 'static>(mut self, sink: S) -> Self {
        self.add_sink(sink);
        self
    }

    /// Run all three stages until cancelled or until the camera fails.
    ///
    /// The camera is released by the capture thread and the sinks are flushed on the calling
    /// thread before returning.
    pub fn run(self, settings: Option<Format7Settings>, cancel: &CancelToken) -> Result<LoopStats> {
        let PipelinedLoop {
            camera,
            mut pipeline,
            mut sinks,
            retry,
            queue_capacity
        } = self;

        let captured = Arc::new(FrameQueue::<Captured>::new(queue_capacity));
        let processed = Arc::new(FrameQueue::<DepthFrame>::new(queue_capacity));

        let capture = {
            let captured = captured.clone();
            let cancel = cancel.clone();
            thread::spawn(move || capture_stage(camera, settings, retry, &captured, &cancel))
        };

        let compute = {
            let captured = captured.clone();
            let processed = processed.clone();
            thread::spawn(move || compute_stage(&mut pipeline, &captured, &processed))
        };

        let mut stats = LoopStats::default();
        while let Some(frame) = processed.pop() {
            for sink in sinks.iter_mut() {
                sink.consume(&frame);
            }
            stats.frames_dispatched += 1;
            log::debug!("Frame {} dispatched", frame.index);
        }

        let flushed = finish_sinks(&mut sinks);

        let capture = capture
            .join()
            .unwrap_or_else(|_| Err(Error::InvalidState {
                operation: "join the capture thread",
                state: "panicked"
            }));
        let compute = compute
            .join()
            .unwrap_or_else(|_| Err(Error::InvalidState {
                operation: "join the compute thread",
                state: "panicked"
            }));

        let report = capture?;
        let compute_dropped = compute?;
        flushed?;

        stats.transient_errors = report.transient_errors;
        stats.frames_dropped =
            report.dropped + compute_dropped + captured.evicted() + processed.evicted();

        log::info!(
            "Pipelined capture stopped: {} frames dispatched, {} dropped, {} transient errors",
            stats.frames_dispatched,
            stats.frames_dropped,
            stats.transient_errors
        );

        Ok(stats)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn capture_stage<C: Camera>(
    mut camera: C,
    settings: Option<Format7Settings>,
    retry: RetryPolicy,
    captured: &FrameQueue<Captured>,
    cancel: &CancelToken
) -> Result<CaptureReport> {
    if let Err(e) = open_camera(&mut camera, settings) {
        captured.close();
        return Err(e);
    }

    let mut report = CaptureReport::default();
    let result = loop {
        if cancel.is_cancelled() {
            log::info!("Cancellation requested");
            break Ok(());
        }

        // The compute stage closes the queue when it gives up
        if captured.is_closed() {
            break Ok(());
        }

        let raw = retrieve_with_retry(&mut camera, &retry, |attempt, e| {
            report.transient_errors += 1;
            log::warn!("Retrieval attempt {} failed: {}", attempt, e);
        });
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => break Err(e)
        };

        match camera.convert_to_bgr(&raw) {
            Ok(bgr) => {
                captured.push(Captured { raw, bgr });
            },
            Err(e) if e.is_frame_local() || e.is_transient() => {
                report.dropped += 1;
                log::warn!("Dropped frame {}: {}", raw.sequence, e);
            },
            Err(e) => break Err(e)
        }
    };

    captured.close();
    let closed = close_camera(&mut camera);

    result?;
    closed?;
    Ok(report)
}

fn compute_stage(
    pipeline: &mut DepthPipeline,
    captured: &FrameQueue<Captured>,
    processed: &FrameQueue<DepthFrame>
) -> Result<u64> {
    let mut index = 0;
    let mut dropped = 0;

    let result = loop {
        let Captured { raw, bgr } = match captured.pop() {
            Some(c) => c,
            None => break Ok(dropped)
        };

        match pipeline.process(index, &raw, &bgr) {
            Ok(frame) => {
                index += 1;
                processed.push(frame);
            },
            Err(e) if e.is_frame_local() => {
                dropped += 1;
                log::warn!("Dropped frame {}: {}", raw.sequence, e);
            },
            Err(e) => break Err(e)
        }
    };

    captured.close();
    processed.close();
    result
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = FrameQueue::new(2);

        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.push(3), PushOutcome::ReplacedOldest);

        assert_eq!(queue.evicted(), 1);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let queue = FrameQueue::new(4);
        queue.push("a");
        queue.close();

        assert_eq!(queue.push("b"), PushOutcome::Closed);
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn zero_capacity_holds_one_item() {
        let queue = FrameQueue::new(0);

        queue.push(1);
        queue.push(2);

        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn pop_blocks_until_pushed() {
        let queue = Arc::new(FrameQueue::new(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.push(7u32);
                queue.close();
            })
        };

        assert_eq!(queue.pop(), Some(7));
        assert_eq!(queue.pop(), None);
        producer.join().unwrap();
    }
}
