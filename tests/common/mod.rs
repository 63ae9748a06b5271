//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use framepipe::core::{
    Block, BlockCore, BlockParams, BlockState, PixelFormat, Result, SharedFrame, SinkBase,
    VideoSink,
};

/// Sink that records the sequence number of every processed frame, with an
/// optional artificial per-frame delay to simulate a slow consumer.
pub struct CollectSink {
    base: SinkBase,
    sequences: Arc<Mutex<Vec<u64>>>,
    delay: Duration,
}

impl CollectSink {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            base: SinkBase::new(name, "CollectSink"),
            sequences: Arc::new(Mutex::new(Vec::new())),
            delay,
        }
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.sequences.lock().clone()
    }

    pub fn clear(&self) {
        self.sequences.lock().clear();
    }
}

impl Block for CollectSink {
    fn core(&self) -> &BlockCore {
        self.base.core()
    }

    fn initialize(&self, _params: &BlockParams) -> Result<()> {
        self.core().check_can_initialize()?;
        self.base
            .apply_common_params()
            .map_err(|e| self.core().fail(e))?;
        self.core().set_state(BlockState::Initialized);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let sequences = Arc::clone(&self.sequences);
        let delay = self.delay;
        self.base.start(Box::new(move |frame| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            sequences.lock().push(frame.info().sequence_number);
            Ok(())
        }))
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

impl VideoSink for CollectSink {
    fn sink_base(&self) -> &SinkBase {
        &self.base
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        vec![
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Yuv420p,
        ]
    }
}
