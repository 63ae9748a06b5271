// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Sink base: bounded frame queue, worker thread and overflow policy.
//!
//! A sink accepts frames through [`SinkBase::submit`] into a bounded FIFO
//! guarded by a mutex and two condition variables. A dedicated worker
//! thread pops frames and hands them to the concrete sink's process hook.
//! When the queue is full, `submit` either blocks the producer until space
//! frees up or drops the oldest queued frame, per the configured policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::block::{Block, BlockCore, BlockState};
use super::error::{PipelineError, Result};
use super::frame::{FrameInfo, PixelFormat, SharedFrame};

pub const MAX_QUEUE_DEPTH: usize = 1_000;
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Hook called by the worker thread for every dequeued frame.
pub type ProcessHook = Box<dyn Fn(&SharedFrame) -> Result<()> + Send>;

/// Consumer capability of a block.
pub trait VideoSink: Block {
    fn sink_base(&self) -> &SinkBase;

    fn supports_format(&self, format: PixelFormat) -> bool;
    fn supported_formats(&self) -> Vec<PixelFormat>;

    /// Enqueue a frame for processing.
    ///
    /// Returns `false` without enqueuing when the sink is not running, or
    /// when a blocking wait for space is interrupted by shutdown.
    fn submit(&self, frame: SharedFrame) -> bool {
        self.sink_base().submit(frame)
    }

    fn input_format(&self) -> FrameInfo {
        self.sink_base().input_format()
    }

    fn set_input_format(&self, format: FrameInfo) -> Result<()> {
        self.sink_base().store_input_format(format)
    }

    fn queue_depth(&self) -> usize {
        self.sink_base().queue_depth()
    }

    fn max_queue_depth(&self) -> usize {
        self.sink_base().max_queue_depth()
    }

    fn set_max_queue_depth(&self, depth: usize) -> Result<()> {
        self.sink_base().set_max_queue_depth(depth)
    }

    fn is_blocking(&self) -> bool {
        self.sink_base().is_blocking()
    }

    fn set_blocking(&self, blocking: bool) {
        self.sink_base().set_blocking(blocking);
    }
}

struct SinkShared {
    core: BlockCore,
    queue: Mutex<VecDeque<SharedFrame>>,
    not_empty: Condvar,
    not_full: Condvar,
    stop: AtomicBool,
    max_depth: AtomicUsize,
    blocking: AtomicBool,
    input_format: Mutex<FrameInfo>,
}

/// Read-only view of a sink's queue and statistics, cloneable into the
/// worker's process hook.
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<SinkShared>,
}

impl SinkHandle {
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn max_queue_depth(&self) -> usize {
        self.shared.max_depth.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> super::block::BlockStats {
        self.shared.core.stats()
    }

    pub fn name(&self) -> String {
        self.shared.core.name()
    }
}

/// Shared state of a sink block: the bounded queue and its worker thread.
pub struct SinkBase {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SinkBase {
    pub fn new(name: &str, type_name: &'static str) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                core: BlockCore::new(name, type_name),
                queue: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                stop: AtomicBool::new(false),
                max_depth: AtomicUsize::new(DEFAULT_QUEUE_DEPTH),
                blocking: AtomicBool::new(true),
                input_format: Mutex::new(FrameInfo::new(640, 480, PixelFormat::Rgb24)),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn core(&self) -> &BlockCore {
        &self.shared.core
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn input_format(&self) -> FrameInfo {
        *self.shared.input_format.lock()
    }

    pub fn store_input_format(&self, format: FrameInfo) -> Result<()> {
        if self.core().state() == BlockState::Running {
            return Err(self.core().reject(PipelineError::InvalidState(format!(
                "sink '{}' cannot change input format while running",
                self.core().name()
            ))));
        }
        *self.shared.input_format.lock() = format;
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn max_queue_depth(&self) -> usize {
        self.shared.max_depth.load(Ordering::Acquire)
    }

    pub fn set_max_queue_depth(&self, depth: usize) -> Result<()> {
        if depth == 0 || depth > MAX_QUEUE_DEPTH {
            return Err(self.core().reject(PipelineError::InvalidArgument(format!(
                "invalid queue depth {depth}"
            ))));
        }
        self.shared.max_depth.store(depth, Ordering::Release);
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.shared.blocking.load(Ordering::Acquire)
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.shared.blocking.store(blocking, Ordering::Release);
    }

    /// Apply the common sink parameters (`queue_depth`, `blocking`) from
    /// the block's parameter map.
    pub fn apply_common_params(&self) -> Result<()> {
        let core = self.core();

        if let Some(depth) = core.parameter("queue_depth") {
            let depth: usize = depth.parse().map_err(|_| {
                core.reject(PipelineError::InvalidArgument(format!(
                    "invalid queue depth '{depth}'"
                )))
            })?;
            self.set_max_queue_depth(depth)?;
        }

        if let Some(blocking) = core.parameter("blocking") {
            self.set_blocking(blocking == "true" || blocking == "1");
        }

        Ok(())
    }

    /// Enqueue a frame; see [`VideoSink::submit`] for the contract.
    pub fn submit(&self, frame: SharedFrame) -> bool {
        let shared = &*self.shared;

        if shared.core.state() != BlockState::Running {
            return false;
        }

        let mut queue = shared.queue.lock();
        let max_depth = shared.max_depth.load(Ordering::Acquire);

        if queue.len() >= max_depth {
            if shared.blocking.load(Ordering::Acquire) {
                while queue.len() >= shared.max_depth.load(Ordering::Acquire)
                    && !shared.stop.load(Ordering::Acquire)
                {
                    shared.not_full.wait(&mut queue);
                }
                if shared.stop.load(Ordering::Acquire) {
                    return false;
                }
            } else {
                // Drop-oldest; a loop in case the bound was lowered at runtime.
                while queue.len() >= max_depth {
                    queue.pop_front();
                    shared.core.record_dropped();
                }
                tracing::debug!(
                    "[{}] queue full, dropped oldest frame",
                    shared.core.name()
                );
            }
        }

        queue.push_back(frame);
        shared.core.set_queue_depth(queue.len() as u32);
        shared.not_empty.notify_one();
        true
    }

    /// Start the worker thread, feeding dequeued frames to `hook`.
    ///
    /// Called by the concrete sink's `start` after its own preparation.
    pub fn start(&self, hook: ProcessHook) -> Result<()> {
        self.core().check_can_start()?;
        self.core().set_state(BlockState::Starting);
        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let thread_name = format!("{}-worker", self.core().name());
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(shared, hook))
            .map_err(|e| {
                self.core().fail(PipelineError::ResourceUnavailable(format!(
                    "failed to spawn sink worker: {e}"
                )))
            })?;

        *self.worker.lock() = Some(handle);
        self.core().set_state(BlockState::Running);
        tracing::info!("[{}] started", self.core().name());
        Ok(())
    }

    /// Stop the worker and drain the queue.
    ///
    /// Ordering matters: set the stop flag, wake both condition variables,
    /// join the worker, then drain. Dropping the drained references may run
    /// frame recyclers, which is why producers are shut down after sinks.
    pub fn stop(&self) -> Result<()> {
        if self.core().state() != BlockState::Running {
            return Ok(());
        }

        self.core().set_state(BlockState::Stopping);
        self.shared.stop.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[{}] worker thread panicked", self.core().name());
            }
        }

        let drained: Vec<SharedFrame> = {
            let mut queue = self.shared.queue.lock();
            let drained = queue.drain(..).collect();
            self.shared.core.set_queue_depth(0);
            drained
        };
        for frame in drained {
            self.core().record_dropped();
            drop(frame);
        }

        self.core().set_state(BlockState::Stopped);
        tracing::info!("[{}] stopped", self.core().name());
        Ok(())
    }

    /// Stop if needed and return to `Uninitialized`.
    pub fn reset(&self) -> Result<()> {
        self.stop()?;
        self.core().set_state(BlockState::Uninitialized);
        Ok(())
    }
}

fn worker_loop(shared: Arc<SinkShared>, hook: ProcessHook) {
    tracing::debug!("[{}] worker thread started", shared.core.name());

    loop {
        let frame = {
            let mut queue = shared.queue.lock();
            while queue.is_empty() && !shared.stop.load(Ordering::Acquire) {
                shared.not_empty.wait(&mut queue);
            }

            // Shutdown signaled and nothing left: exit. A remaining backlog
            // is finished first; no new frames arrive once the sink leaves
            // the Running state.
            let Some(frame) = queue.pop_front() else {
                break;
            };
            shared.core.set_queue_depth(queue.len() as u32);
            shared.not_full.notify_one();
            frame
        };

        match hook(&frame) {
            Ok(()) => shared.core.record_processed(frame.data_size()),
            Err(e) => shared
                .core
                .frame_failure(&format!("frame processing failed: {e}")),
        }
    }

    tracing::debug!("[{}] worker thread stopped", shared.core.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::VideoFrame;
    use std::time::Duration;

    fn shared_frame() -> SharedFrame {
        Arc::new(VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap())
    }

    fn init_base() -> SinkBase {
        let base = SinkBase::new("sink", "TestSink");
        base.core().set_state(BlockState::Initialized);
        base
    }

    #[test]
    fn test_queue_depth_bounds() {
        let base = SinkBase::new("sink", "TestSink");
        assert!(base.set_max_queue_depth(0).is_err());
        assert!(base.set_max_queue_depth(1_001).is_err());
        assert!(base.set_max_queue_depth(1).is_ok());
        assert!(base.set_max_queue_depth(1_000).is_ok());
    }

    #[test]
    fn test_submit_rejected_when_not_running() {
        let base = init_base();
        assert!(!base.submit(shared_frame()));
        assert_eq!(base.queue_depth(), 0);
    }

    #[test]
    fn test_worker_processes_in_fifo_order() {
        let base = init_base();
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        base.start(Box::new(move |frame| {
            sink.lock().push(frame.info().sequence_number);
            Ok(())
        }))
        .unwrap();

        for seq in 1..=5u64 {
            let mut frame = VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap();
            frame.info_mut().sequence_number = seq;
            assert!(base.submit(Arc::new(frame)));
        }

        std::thread::sleep(Duration::from_millis(50));
        base.stop().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(base.core().stats().frames_processed, 5);
        assert_eq!(base.core().stats().frames_dropped, 0);
    }

    #[test]
    fn test_drop_oldest_when_full_and_non_blocking() {
        let base = init_base();
        base.set_max_queue_depth(2).unwrap();
        base.set_blocking(false);

        // No worker: drive submit directly against a full queue.
        base.core().set_state(BlockState::Running);
        for seq in 1..=4u64 {
            let mut frame = VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap();
            frame.info_mut().sequence_number = seq;
            assert!(base.submit(Arc::new(frame)));
        }

        let queue = base.shared.queue.lock();
        let sequences: Vec<u64> = queue.iter().map(|f| f.info().sequence_number).collect();
        assert_eq!(sequences, vec![3, 4], "oldest frames were dropped");
        drop(queue);
        assert_eq!(base.core().stats().frames_dropped, 2);
        assert!(base.queue_depth() <= base.max_queue_depth());
    }

    #[test]
    fn test_blocking_submit_unblocked_by_stop() {
        let base = Arc::new(init_base());
        base.set_max_queue_depth(1).unwrap();
        base.set_blocking(true);
        // Worker slow enough that the queue stays full while we probe.
        base.start(Box::new(|_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }))
        .unwrap();

        assert!(base.submit(shared_frame()));
        // Second fills the queue again once the worker takes the first.
        std::thread::sleep(Duration::from_millis(20));
        assert!(base.submit(shared_frame()));

        let submitter = {
            let base = Arc::clone(&base);
            std::thread::spawn(move || base.submit(shared_frame()))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished(), "submit should be blocked on not_full");

        // Stop wakes the blocked submit, which reports the frame rejected.
        let stopper = {
            let base = Arc::clone(&base);
            std::thread::spawn(move || base.stop())
        };
        assert!(!submitter.join().unwrap());
        stopper.join().unwrap().unwrap();
        assert_eq!(base.core().state(), BlockState::Stopped);
    }

    #[test]
    fn test_hook_failure_counts_drop_and_continues() {
        let base = init_base();
        base.start(Box::new(|frame| {
            if frame.info().sequence_number == 2 {
                Err(PipelineError::Io(std::io::Error::other("disk full")))
            } else {
                Ok(())
            }
        }))
        .unwrap();

        for seq in 1..=3u64 {
            let mut frame = VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap();
            frame.info_mut().sequence_number = seq;
            assert!(base.submit(Arc::new(frame)));
        }

        std::thread::sleep(Duration::from_millis(50));
        base.stop().unwrap();

        let stats = base.core().stats();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(
            stats.frames_processed + stats.frames_dropped,
            3,
            "every submitted frame is accounted for"
        );
    }

    #[test]
    fn test_every_submitted_frame_accounted_after_stop() {
        let base = init_base();
        base.set_max_queue_depth(10).unwrap();
        // Slow worker so frames pile up before stop.
        base.start(Box::new(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }))
        .unwrap();

        for _ in 0..6 {
            assert!(base.submit(shared_frame()));
        }
        base.stop().unwrap();

        let stats = base.core().stats();
        assert_eq!(stats.frames_processed + stats.frames_dropped, 6);
        assert_eq!(stats.queue_depth, 0);
    }

    #[test]
    fn test_stop_is_idempotent_when_not_running() {
        let base = init_base();
        assert!(base.stop().is_ok());
        base.core().set_state(BlockState::Error);
        assert!(base.stop().is_ok(), "stop on an errored block is a no-op");
        assert_eq!(base.core().state(), BlockState::Error);
    }

    #[test]
    fn test_reset_returns_to_uninitialized() {
        let base = init_base();
        base.start(Box::new(|_| Ok(()))).unwrap();
        base.reset().unwrap();
        assert_eq!(base.core().state(), BlockState::Uninitialized);
    }
}
