// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Console sink: prints frame metadata to stdout.
//!
//! Accepts any pixel format. By default one summary line per second;
//! `verbose=true` logs every frame, `show_pixels=true` dumps the first
//! `max_pixels` pixels.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::block::{Block, BlockCore, BlockParams, BlockState};
use crate::core::error::{PipelineError, Result};
use crate::core::frame::{PixelFormat, SharedFrame};
use crate::core::sink::{SinkBase, SinkHandle, VideoSink};
use crate::core::timing::{monotonic_now_ms, monotonic_now_us, LatencyTracker};
use crate::register_block_type;

const DEFAULT_MAX_PIXELS: usize = 16;

struct ConsoleState {
    verbose: AtomicBool,
    show_pixels: AtomicBool,
    max_pixels: AtomicUsize,
    last_log_ms: AtomicU64,
    /// Frame age (emit-to-process) history for the periodic summary line.
    age: Mutex<LatencyTracker>,
}

impl ConsoleState {
    fn process(&self, frame: &SharedFrame, sink: &SinkHandle) -> Result<()> {
        if !frame.is_valid() {
            return Err(PipelineError::InvalidArgument(
                "invalid frame received".into(),
            ));
        }

        let info = frame.info();
        let age_ms = (monotonic_now_us().saturating_sub(info.timestamp_us)) as f64 / 1_000.0;
        self.age.lock().record(age_ms);

        let now_ms = monotonic_now_ms();
        let verbose = self.verbose.load(Ordering::Relaxed);
        let due = now_ms.saturating_sub(self.last_log_ms.load(Ordering::Relaxed)) > 1_000;

        let stdout = std::io::stdout();
        let mut out = stdout.lock();

        if verbose || due {
            let stats = sink.stats();
            writeln!(
                out,
                "[{}] frame {:>8} | {} | {:>8} bytes | age {:.1}ms | fps {:.1} | queue {}/{}",
                sink.name(),
                info.sequence_number,
                info,
                frame.data_size(),
                age_ms,
                stats.avg_fps,
                sink.queue_depth(),
                sink.max_queue_depth(),
            )?;
            self.last_log_ms.store(now_ms, Ordering::Relaxed);
        }

        if self.show_pixels.load(Ordering::Relaxed) {
            self.dump_pixels(frame, &mut out)?;
        }

        Ok(())
    }

    fn dump_pixels(&self, frame: &SharedFrame, out: &mut impl Write) -> Result<()> {
        let info = frame.info();
        let bytes_per_pixel = match info.pixel_format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
            _ => 1,
        };

        let total = (info.width as usize) * (info.height as usize);
        let count = self.max_pixels.load(Ordering::Relaxed).min(total);
        let data = frame.data();

        writeln!(out, "  first {count} pixels:")?;
        for i in 0..count {
            let offset = i * bytes_per_pixel;
            let pixel = &data[offset..offset + bytes_per_pixel];
            let values: Vec<String> = pixel.iter().map(|b| format!("{b:3}")).collect();
            if i % 8 == 7 || i == count - 1 {
                writeln!(out, "  {:2}: ({})", i, values.join(","))?;
            } else {
                write!(out, "  {:2}: ({})", i, values.join(","))?;
            }
        }
        Ok(())
    }
}

/// Sink block that reports frames on standard output.
///
/// Parameters: `queue_depth`, `blocking`, `verbose`, `show_pixels`,
/// `max_pixels`.
pub struct ConsoleSink {
    base: SinkBase,
    state: Arc<ConsoleState>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            base: SinkBase::new("ConsoleSink", "ConsoleSink"),
            state: Arc::new(ConsoleState {
                verbose: AtomicBool::new(false),
                show_pixels: AtomicBool::new(false),
                max_pixels: AtomicUsize::new(DEFAULT_MAX_PIXELS),
                last_log_ms: AtomicU64::new(0),
                age: Mutex::new(LatencyTracker::default()),
            }),
        }
    }

    /// Frame-age summary across recently processed frames.
    pub fn age_summary(&self) -> String {
        self.state.age.lock().summary()
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for ConsoleSink {
    fn core(&self) -> &BlockCore {
        self.base.core()
    }

    fn initialize(&self, _params: &BlockParams) -> Result<()> {
        self.core().check_can_initialize()?;
        self.base
            .apply_common_params()
            .map_err(|e| self.core().fail(e))?;

        let core = self.core();
        if let Some(verbose) = core.parameter("verbose") {
            self.state
                .verbose
                .store(verbose == "true" || verbose == "1", Ordering::Relaxed);
        }
        if let Some(show) = core.parameter("show_pixels") {
            self.state
                .show_pixels
                .store(show == "true" || show == "1", Ordering::Relaxed);
        }
        if let Some(max) = core.parameter("max_pixels") {
            let max: usize = max.parse().map_err(|_| {
                self.core().fail(PipelineError::InvalidArgument(format!(
                    "invalid max_pixels '{max}'"
                )))
            })?;
            self.state.max_pixels.store(max, Ordering::Relaxed);
        }

        self.core().set_state(BlockState::Initialized);
        tracing::info!(
            "[{}] initialized, queue_depth={}, blocking={}",
            self.name(),
            self.base.max_queue_depth(),
            self.base.is_blocking()
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let handle = self.base.handle();
        self.base
            .start(Box::new(move |frame| state.process(frame, &handle)))
    }

    fn stop(&self) -> Result<()> {
        self.base.stop()
    }

    fn shutdown(&self) -> Result<()> {
        self.base.reset()
    }

    fn as_sink(&self) -> Option<&dyn VideoSink> {
        Some(self)
    }
}

impl VideoSink for ConsoleSink {
    fn sink_base(&self) -> &SinkBase {
        &self.base
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        // Metadata-only consumer; every format is fine.
        true
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        vec![
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Nv21,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
        ]
    }
}

register_block_type!("ConsoleSink", ConsoleSink);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{FrameInfo, VideoFrame};
    use std::time::Duration;

    fn frame() -> SharedFrame {
        let mut frame = VideoFrame::alloc(FrameInfo::new(32, 24, PixelFormat::Rgb24)).unwrap();
        frame.info_mut().timestamp_us = monotonic_now_us();
        frame.info_mut().sequence_number = 1;
        Arc::new(frame)
    }

    #[test]
    fn test_initialize_parses_params() {
        let sink = ConsoleSink::new();
        sink.set_parameter("verbose", "true").unwrap();
        sink.set_parameter("max_pixels", "4").unwrap();
        sink.set_parameter("queue_depth", "5").unwrap();
        sink.initialize(&sink.configuration()).unwrap();

        assert_eq!(sink.state(), BlockState::Initialized);
        assert!(sink.state.verbose.load(Ordering::Relaxed));
        assert_eq!(sink.state.max_pixels.load(Ordering::Relaxed), 4);
        assert_eq!(sink.max_queue_depth(), 5);
    }

    #[test]
    fn test_initialize_rejects_bad_queue_depth() {
        let sink = ConsoleSink::new();
        sink.set_parameter("queue_depth", "0").unwrap();
        assert!(sink.initialize(&sink.configuration()).is_err());
        assert_eq!(sink.state(), BlockState::Error);
    }

    #[test]
    fn test_processes_submitted_frames() {
        let sink = ConsoleSink::new();
        sink.initialize(&BlockParams::new()).unwrap();
        sink.start().unwrap();
        assert_eq!(sink.state(), BlockState::Running);

        for _ in 0..3 {
            assert!(sink.submit(frame()));
        }
        std::thread::sleep(Duration::from_millis(50));
        sink.stop().unwrap();

        let stats = sink.stats();
        assert_eq!(stats.frames_processed + stats.frames_dropped, 3);
        assert!(stats.frames_processed >= 1);
    }

    #[test]
    fn test_accepts_all_formats() {
        let sink = ConsoleSink::new();
        for format in sink.supported_formats() {
            assert!(sink.supports_format(format));
        }
        assert!(sink.supports_format(PixelFormat::Unknown));
    }
}
