//! # framepipe - Modular Video Pipeline Runtime
//!
//! A concurrent dataflow engine that connects frame producers ("sources")
//! to consumers ("sinks") through bounded, back-pressured queues and
//! drives them through a uniform lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! framepipe
//!   ├─ core/    - frame model, block lifecycle, registry, orchestrator
//!   └─ blocks/  - reference blocks (test pattern, console/file/TCP sinks)
//! ```
//!
//! Data flow: a source prepares a [`VideoFrame`], `emit_frame` stamps it
//! and invokes the edge callback, the sink's `submit` enqueues it, and the
//! sink's worker thread hands it to the concrete `process` hook. Frames
//! are shared as [`SharedFrame`]; when the last reference drops, the
//! frame's recycler runs exactly once, returning any externally owned
//! buffer to its producer without a copy.
//!
//! ## Example
//!
//! ```no_run
//! use framepipe::{Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "name": "demo",
//!     "blocks": [
//!         { "name": "pattern", "type": "TestPatternSource",
//!           "parameters": { "pattern": "bars", "fps": "30" } },
//!         { "name": "console", "type": "ConsoleSink" }
//!     ],
//!     "connections": [ ["pattern.output", "console.input"] ]
//! }"#).unwrap();
//!
//! let pipeline = Pipeline::new();
//! pipeline.initialize(config).unwrap();
//! pipeline.start().unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! pipeline.stop().unwrap();
//! pipeline.shutdown().unwrap();
//! ```

pub mod blocks;
pub mod core;

pub use core::{
    Block, BlockCore, BlockDef, BlockParams, BlockState, BlockStats, Connection, ErrorCallback,
    FrameCallback, FrameInfo, Pipeline, PipelineConfig, PipelineError, PixelFormat, Result,
    SharedFrame, SinkBase, SinkHandle, SourceBase, VideoFrame, VideoSink, VideoSource,
};
pub use core::{global_registry, BlockRegistry};

pub use blocks::{ConsoleSink, FileSink, TcpSink, TestPatternSource};

// Re-exported for the register_block_type! macro.
#[doc(hidden)]
pub use inventory;
