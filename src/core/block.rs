// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Block base: uniform lifecycle state machine, parameters, statistics and
//! the per-block error hook.
//!
//! Every node in a pipeline graph implements [`Block`]. The shared behavior
//! lives in default methods over a [`BlockCore`] accessor so concrete blocks
//! only write their lifecycle transitions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::error::{PipelineError, Result};
use super::sink::VideoSink;
use super::source::VideoSource;
use super::timing::FrameRateCalculator;

/// Ordered block configuration parameters.
pub type BlockParams = BTreeMap<String, String>;

/// Lifecycle states of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Uninitialized = 0,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl BlockState {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockState::Uninitialized => "UNINITIALIZED",
            BlockState::Initialized => "INITIALIZED",
            BlockState::Starting => "STARTING",
            BlockState::Running => "RUNNING",
            BlockState::Stopping => "STOPPING",
            BlockState::Stopped => "STOPPED",
            BlockState::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> BlockState {
        match value {
            0 => BlockState::Uninitialized,
            1 => BlockState::Initialized,
            2 => BlockState::Starting,
            3 => BlockState::Running,
            4 => BlockState::Stopping,
            5 => BlockState::Stopped,
            _ => BlockState::Error,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-block counters, copied out on read.
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub bytes_processed: u64,
    /// Windowed frames-per-second estimate.
    pub avg_fps: f64,
    /// Exponential moving average of inter-frame latency (alpha = 0.1).
    pub avg_latency_ms: f64,
    /// Current queue depth; only meaningful for sinks.
    pub queue_depth: u32,
    pub last_frame_time: Option<Instant>,
}

/// Error hook invoked with the failing block's name and a message.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct CoreInner {
    params: BlockParams,
    stats: BlockStats,
    rate: FrameRateCalculator,
    last_error: Option<String>,
    error_callback: Option<ErrorCallback>,
}

/// Shared state every block carries: name, type, atomic lifecycle state,
/// parameters, statistics, last error and the error callback.
///
/// All mutable state sits behind a single mutex; the state word is atomic so
/// fast-path checks stay lock-free.
pub struct BlockCore {
    name: Mutex<String>,
    type_name: &'static str,
    state: AtomicU8,
    inner: Mutex<CoreInner>,
}

impl BlockCore {
    pub fn new(name: &str, type_name: &'static str) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            type_name,
            state: AtomicU8::new(BlockState::Uninitialized as u8),
            inner: Mutex::new(CoreInner {
                params: BlockParams::new(),
                stats: BlockStats::default(),
                rate: FrameRateCalculator::default(),
                last_error: None,
                error_callback: None,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Copy of the statistics, with `avg_fps` computed from the window.
    pub fn stats(&self) -> BlockStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.avg_fps = inner.rate.fps();
        stats
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.stats = BlockStats::default();
        inner.rate.reset();
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.inner.lock().error_callback = Some(callback);
    }

    /// Store a parameter. Rejected while the block is running; parameters
    /// affect formats and threading, both fixed at start.
    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        if self.state() == BlockState::Running {
            return Err(self.reject(PipelineError::InvalidState(format!(
                "block '{}' cannot change parameter '{key}' while running",
                self.name()
            ))));
        }
        self.inner
            .lock()
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.inner.lock().params.get(key).cloned()
    }

    pub fn configuration(&self) -> BlockParams {
        self.inner.lock().params.clone()
    }

    /// Record a lifecycle failure: transitions to `Error`, stores the
    /// message and fires the error callback once.
    pub fn fail(&self, error: PipelineError) -> PipelineError {
        let message = error.to_string();
        let callback = {
            let mut inner = self.inner.lock();
            inner.last_error = Some(message.clone());
            inner.error_callback.clone()
        };

        self.set_state(BlockState::Error);
        tracing::error!("[{}] {}", self.name(), message);

        if let Some(callback) = callback {
            callback(&self.name(), &message);
        }
        error
    }

    /// Record a validation failure without changing state.
    pub fn reject(&self, error: PipelineError) -> PipelineError {
        let message = error.to_string();
        self.inner.lock().last_error = Some(message.clone());
        tracing::warn!("[{}] {}", self.name(), message);
        error
    }

    /// Record a per-frame failure: counts a drop and fires the callback,
    /// but the block stays running and tries the next frame.
    pub fn frame_failure(&self, message: &str) {
        let callback = {
            let mut inner = self.inner.lock();
            inner.stats.frames_dropped += 1;
            inner.last_error = Some(message.to_string());
            inner.error_callback.clone()
        };

        tracing::warn!("[{}] {}", self.name(), message);
        if let Some(callback) = callback {
            callback(&self.name(), message);
        }
    }

    /// Account one successfully handled frame of `bytes` size.
    pub fn record_processed(&self, bytes: usize) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.stats.frames_processed += 1;
        inner.stats.bytes_processed += bytes as u64;

        // EMA over the inter-frame gap; the first sample has no gap.
        if let Some(last) = inner.stats.last_frame_time {
            if inner.stats.frames_processed > 1 {
                let latency_ms = now.duration_since(last).as_secs_f64() * 1_000.0;
                inner.stats.avg_latency_ms =
                    inner.stats.avg_latency_ms * 0.9 + latency_ms * 0.1;
            }
        }

        inner.stats.last_frame_time = Some(now);
        inner.rate.add_frame(0);
    }

    pub fn record_dropped(&self) {
        self.inner.lock().stats.frames_dropped += 1;
    }

    pub fn set_queue_depth(&self, depth: u32) {
        self.inner.lock().stats.queue_depth = depth;
    }

    /// Check that `initialize` is legal from the current state.
    pub fn check_can_initialize(&self) -> Result<()> {
        match self.state() {
            BlockState::Uninitialized | BlockState::Stopped => Ok(()),
            state => Err(self.reject(PipelineError::InvalidState(format!(
                "block '{}' cannot initialize from state {state}",
                self.name()
            )))),
        }
    }

    /// Check that `start` is legal from the current state.
    ///
    /// A block in `Error` rejects `start` until `shutdown` returns it to
    /// `Uninitialized`.
    pub fn check_can_start(&self) -> Result<()> {
        match self.state() {
            BlockState::Initialized | BlockState::Stopped => Ok(()),
            state => Err(self.reject(PipelineError::InvalidState(format!(
                "block '{}' cannot start from state {state}",
                self.name()
            )))),
        }
    }
}

/// A node in the pipeline graph.
///
/// Lifecycle contract:
/// - `initialize` from `Uninitialized` or `Stopped` only, leaves the block
///   `Initialized` (or `Error`).
/// - `start` from `Initialized` or `Stopped`, drives `Starting -> Running`.
/// - `stop` is a no-op unless `Running` (including on a block in `Error`);
///   otherwise it joins all owned threads and ends `Stopped`.
/// - `shutdown` stops first, releases resources and returns the block to
///   `Uninitialized`.
pub trait Block: Send + Sync {
    fn core(&self) -> &BlockCore;

    fn initialize(&self, params: &BlockParams) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn shutdown(&self) -> Result<()>;

    fn name(&self) -> String {
        self.core().name()
    }

    fn set_name(&self, name: &str) {
        self.core().set_name(name);
    }

    fn type_name(&self) -> &'static str {
        self.core().type_name()
    }

    fn state(&self) -> BlockState {
        self.core().state()
    }

    fn last_error(&self) -> Option<String> {
        self.core().last_error()
    }

    fn stats(&self) -> BlockStats {
        self.core().stats()
    }

    fn reset_stats(&self) {
        self.core().reset_stats();
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.core().set_error_callback(callback);
    }

    fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        self.core().set_parameter(key, value)
    }

    fn get_parameter(&self, key: &str) -> Option<String> {
        self.core().parameter(key)
    }

    fn configuration(&self) -> BlockParams {
        self.core().configuration()
    }

    /// Producer capability, if this block is a source.
    fn as_source(&self) -> Option<&dyn VideoSource> {
        None
    }

    /// Consumer capability, if this block is a sink.
    fn as_sink(&self) -> Option<&dyn VideoSink> {
        None
    }
}
