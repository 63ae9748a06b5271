//! framepipe core: frame model, block lifecycle, pipeline orchestration.
//!
//! Everything platform-agnostic lives here. Reference producer and
//! consumer blocks are in [`crate::blocks`].

pub mod block;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod source;
pub mod threading;
pub mod timing;

// Re-export core types
pub use block::{Block, BlockCore, BlockParams, BlockState, BlockStats, ErrorCallback};
pub use config::{BlockDef, Connection, PipelineConfig};
pub use error::{PipelineError, Result};
pub use frame::{
    FrameInfo, PixelFormat, Recycler, SharedFrame, VideoFrame, FRAME_ALIGNMENT,
};
pub use pipeline::Pipeline;
pub use registry::{global_registry, BlockFactory, BlockRegistry, BlockTypeEntry};
pub use sink::{ProcessHook, SinkBase, SinkHandle, VideoSink, MAX_QUEUE_DEPTH};
pub use source::{FrameCallback, SourceBase, VideoSource, MAX_FRAME_RATE};
pub use threading::{
    available_cores, pin_current_thread, precise_sleep, precise_sleep_until,
    set_current_thread_priority, TaskHandle, TaskPool,
};
pub use timing::{
    format_duration, monotonic_now_ms, monotonic_now_us, FrameRateCalculator, LatencyTracker,
    Timer,
};
