// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Source base: frame-rate gate, timestamp/sequence stamping and the edge
//! delivery callback.
//!
//! Concrete sources own their producer thread (or platform callback) and
//! funnel every prepared frame through [`SourceBase::emit_frame`], which
//! applies the gate, stamps metadata and delivers the frame synchronously
//! on the producer thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::block::{Block, BlockCore, BlockState};
use super::error::{PipelineError, Result};
use super::frame::{FrameInfo, PixelFormat, SharedFrame, VideoFrame};
use super::timing::monotonic_now_us;

/// Delivery callback installed on a pipeline edge.
pub type FrameCallback = Arc<dyn Fn(SharedFrame) + Send + Sync>;

pub const MAX_FRAME_RATE: f64 = 1_000.0;
pub const MAX_BUFFER_COUNT: usize = 100;

/// Producer capability of a block.
pub trait VideoSource: Block {
    fn source_base(&self) -> &SourceBase;

    fn supports_format(&self, format: PixelFormat) -> bool;
    fn supported_formats(&self) -> Vec<PixelFormat>;
    fn supported_resolutions(&self) -> Vec<(u32, u32)>;

    /// Install the delivery callback for this source's edge.
    fn set_frame_callback(&self, callback: FrameCallback) {
        self.source_base().set_frame_callback(callback);
    }

    fn output_format(&self) -> FrameInfo {
        self.source_base().output_format()
    }

    /// Change the output format. Concrete sources reject formats they do
    /// not support; the base rejects changes while running.
    fn set_output_format(&self, format: FrameInfo) -> Result<()> {
        if !self.supports_format(format.pixel_format) {
            return Err(self.core().reject(PipelineError::InvalidArgument(format!(
                "source '{}' does not support pixel format {}",
                self.name(),
                format.pixel_format
            ))));
        }
        self.source_base().store_output_format(format)
    }

    fn frame_rate(&self) -> f64 {
        self.source_base().frame_rate()
    }

    fn set_frame_rate(&self, fps: f64) -> Result<()> {
        self.source_base().set_frame_rate(fps)
    }

    fn buffer_count(&self) -> usize {
        self.source_base().buffer_count()
    }

    fn set_buffer_count(&self, count: usize) -> Result<()> {
        self.source_base().set_buffer_count(count)
    }
}

struct Gate {
    output_format: FrameInfo,
    frame_rate: f64,
    frame_interval: Option<Duration>,
    buffer_count: usize,
    last_emit: Option<Instant>,
}

struct SourceShared {
    core: BlockCore,
    gate: Mutex<Gate>,
    callback: RwLock<Option<FrameCallback>>,
    sequence: AtomicU64,
    stop_requested: AtomicBool,
}

/// Shared state of a source block. Cheap to clone; clones refer to the
/// same underlying source so the producer thread can emit through it.
#[derive(Clone)]
pub struct SourceBase {
    shared: Arc<SourceShared>,
}

impl SourceBase {
    pub fn new(name: &str, type_name: &'static str) -> Self {
        let default_format = FrameInfo::new(640, 480, PixelFormat::Rgb24);
        Self {
            shared: Arc::new(SourceShared {
                core: BlockCore::new(name, type_name),
                gate: Mutex::new(Gate {
                    output_format: default_format,
                    frame_rate: 30.0,
                    frame_interval: Some(Duration::from_micros(33_333)),
                    buffer_count: 3,
                    last_emit: None,
                }),
                callback: RwLock::new(None),
                sequence: AtomicU64::new(0),
                stop_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn core(&self) -> &BlockCore {
        &self.shared.core
    }

    pub fn set_frame_callback(&self, callback: FrameCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    pub fn clear_frame_callback(&self) {
        *self.shared.callback.write() = None;
    }

    pub fn output_format(&self) -> FrameInfo {
        self.shared.gate.lock().output_format
    }

    /// Store a new output format, normalizing a zero stride. Rejected while
    /// the source is running.
    pub fn store_output_format(&self, mut format: FrameInfo) -> Result<()> {
        if self.core().state() == BlockState::Running {
            return Err(self.core().reject(PipelineError::InvalidState(format!(
                "source '{}' cannot change output format while running",
                self.core().name()
            ))));
        }

        if format.stride == 0 {
            format.stride = format.pixel_format.default_stride(format.width);
        }
        self.shared.gate.lock().output_format = format;
        Ok(())
    }

    pub fn frame_rate(&self) -> f64 {
        self.shared.gate.lock().frame_rate
    }

    pub fn set_frame_rate(&self, fps: f64) -> Result<()> {
        if fps <= 0.0 || fps > MAX_FRAME_RATE {
            return Err(self.core().reject(PipelineError::InvalidArgument(format!(
                "invalid frame rate {fps}"
            ))));
        }

        let mut gate = self.shared.gate.lock();
        gate.frame_rate = fps;
        gate.frame_interval = Some(Duration::from_secs_f64(1.0 / fps));
        Ok(())
    }

    /// Pacing interval derived from the frame rate; `None` when gating is
    /// disabled.
    pub fn frame_interval(&self) -> Option<Duration> {
        let gate = self.shared.gate.lock();
        if gate.frame_rate > 0.0 {
            gate.frame_interval
        } else {
            None
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.gate.lock().buffer_count
    }

    pub fn set_buffer_count(&self, count: usize) -> Result<()> {
        if count == 0 || count > MAX_BUFFER_COUNT {
            return Err(self.core().reject(PipelineError::InvalidArgument(format!(
                "invalid buffer count {count}"
            ))));
        }
        self.shared.gate.lock().buffer_count = count;
        Ok(())
    }

    /// Time of the last successful emission, for producer-side pacing.
    pub fn last_emit_time(&self) -> Option<Instant> {
        self.shared.gate.lock().last_emit
    }

    /// True once stop has been requested; producer threads must not emit
    /// past this point.
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    /// Apply the common source parameters (`width`, `height`, `fps`,
    /// `format`) from the block's parameter map.
    pub fn apply_common_params(&self) -> Result<()> {
        let core = self.core();
        let mut format = self.output_format();

        if let Some(width) = core.parameter("width") {
            format.width = width.parse().map_err(|_| {
                core.reject(PipelineError::InvalidArgument(format!(
                    "invalid width '{width}'"
                )))
            })?;
        }

        if let Some(height) = core.parameter("height") {
            format.height = height.parse().map_err(|_| {
                core.reject(PipelineError::InvalidArgument(format!(
                    "invalid height '{height}'"
                )))
            })?;
        }

        if let Some(name) = core.parameter("format") {
            format.pixel_format = name.parse().map_err(|e: PipelineError| core.reject(e))?;
        }

        format.stride = format.pixel_format.default_stride(format.width);
        self.shared.gate.lock().output_format = format;

        if let Some(fps) = core.parameter("fps") {
            let fps: f64 = fps.parse().map_err(|_| {
                core.reject(PipelineError::InvalidArgument(format!("invalid fps '{fps}'")))
            })?;
            self.set_frame_rate(fps)?;
        }

        Ok(())
    }

    /// Transition into `Starting` and reset the per-start emission state,
    /// so sequence numbers restart at 1.
    pub fn begin_start(&self) -> Result<()> {
        self.core().check_can_start()?;
        self.core().set_state(BlockState::Starting);
        self.shared.sequence.store(0, Ordering::Release);
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.gate.lock().last_emit = None;
        Ok(())
    }

    pub fn finish_start(&self) {
        self.core().set_state(BlockState::Running);
        tracing::info!("[{}] started", self.core().name());
    }

    /// Transition into `Stopping` and flag producer threads to wind down.
    pub fn begin_stop(&self) {
        self.core().set_state(BlockState::Stopping);
        self.shared.stop_requested.store(true, Ordering::Release);
    }

    pub fn finish_stop(&self) {
        self.core().set_state(BlockState::Stopped);
        tracing::info!("[{}] stopped", self.core().name());
    }

    /// Release per-run state and return to `Uninitialized`.
    pub fn reset(&self) {
        self.clear_frame_callback();
        self.core().set_state(BlockState::Uninitialized);
    }

    /// Deliver a prepared frame across the edge.
    ///
    /// In order: applies the frame-rate gate (a gated attempt counts as
    /// dropped), stamps `timestamp_us` and `sequence_number`, invokes the
    /// delivery callback synchronously on the calling thread, then updates
    /// statistics. Returns `true` if the frame was delivered.
    pub fn emit_frame(&self, mut frame: VideoFrame) -> bool {
        if self.stop_requested() || self.core().state() != BlockState::Running {
            return false;
        }

        let callback = match self.shared.callback.read().clone() {
            Some(callback) => callback,
            None => return false,
        };

        let now = Instant::now();
        {
            let gate = self.shared.gate.lock();
            if gate.frame_rate > 0.0 {
                if let (Some(interval), Some(last)) = (gate.frame_interval, gate.last_emit) {
                    if now.duration_since(last) < interval {
                        drop(gate);
                        self.core().record_dropped();
                        return false;
                    }
                }
            }
        }

        let sequence = self.shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let info = frame.info_mut();
            info.timestamp_us = monotonic_now_us();
            info.sequence_number = sequence;
        }

        let bytes = frame.data_size();
        callback(Arc::new(frame));

        self.core().record_processed(bytes);
        self.shared.gate.lock().last_emit = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_base() -> SourceBase {
        let base = SourceBase::new("src", "TestSource");
        base.core().set_state(BlockState::Initialized);
        base.begin_start().unwrap();
        base.finish_start();
        base
    }

    fn test_frame() -> VideoFrame {
        VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap()
    }

    #[test]
    fn test_frame_rate_bounds() {
        let base = SourceBase::new("src", "TestSource");
        assert!(base.set_frame_rate(0.0).is_err());
        assert!(base.set_frame_rate(-5.0).is_err());
        assert!(base.set_frame_rate(1_001.0).is_err());
        assert!(base.set_frame_rate(60.0).is_ok());
        assert_eq!(base.frame_rate(), 60.0);
        assert!(base.core().last_error().is_some());
    }

    #[test]
    fn test_buffer_count_bounds() {
        let base = SourceBase::new("src", "TestSource");
        assert!(base.set_buffer_count(0).is_err());
        assert!(base.set_buffer_count(101).is_err());
        assert!(base.set_buffer_count(8).is_ok());
        assert_eq!(base.buffer_count(), 8);
    }

    #[test]
    fn test_emit_requires_running_and_callback() {
        let base = SourceBase::new("src", "TestSource");
        assert!(!base.emit_frame(test_frame()), "not running");

        let base = running_base();
        assert!(!base.emit_frame(test_frame()), "no callback installed");
    }

    #[test]
    fn test_emit_stamps_sequence_and_timestamp() {
        let base = running_base();
        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        base.set_frame_callback(Arc::new(move |frame| {
            let info = frame.info();
            sink.lock().push((info.sequence_number, info.timestamp_us));
        }));
        base.set_frame_rate(1_000.0).unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            assert!(base.emit_frame(test_frame()));
        }

        let seen = seen.lock();
        let sequences: Vec<u64> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(seen.windows(2).all(|w| w[1].1 >= w[0].1));
        assert_eq!(base.core().stats().frames_processed, 3);
    }

    #[test]
    fn test_gate_drops_early_frames() {
        let base = running_base();
        base.set_frame_callback(Arc::new(|_| {}));
        base.set_frame_rate(10.0).unwrap();

        assert!(base.emit_frame(test_frame()), "first frame always passes");
        // Immediately again: far inside the 100ms interval.
        assert!(!base.emit_frame(test_frame()));
        let stats = base.core().stats();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[test]
    fn test_sequence_restarts_on_start() {
        let base = running_base();
        let last_seq = Arc::new(AtomicU64::new(0));
        let seq = Arc::clone(&last_seq);
        base.set_frame_callback(Arc::new(move |frame| {
            seq.store(frame.info().sequence_number, Ordering::SeqCst);
        }));
        base.set_frame_rate(1_000.0).unwrap();

        assert!(base.emit_frame(test_frame()));
        std::thread::sleep(Duration::from_millis(2));
        assert!(base.emit_frame(test_frame()));
        assert_eq!(last_seq.load(Ordering::SeqCst), 2);

        base.begin_stop();
        base.finish_stop();
        base.begin_start().unwrap();
        base.finish_start();

        assert!(base.emit_frame(test_frame()));
        assert_eq!(last_seq.load(Ordering::SeqCst), 1, "sequence restarts at 1");
    }

    #[test]
    fn test_no_emission_after_stop_requested() {
        let base = running_base();
        base.set_frame_callback(Arc::new(|_| {}));
        base.begin_stop();
        assert!(!base.emit_frame(test_frame()));
    }

    #[test]
    fn test_output_format_locked_while_running() {
        let base = running_base();
        let err = base
            .store_output_format(FrameInfo::new(1920, 1080, PixelFormat::Rgb24))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
    }
}
