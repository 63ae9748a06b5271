// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline orchestrator.
//!
//! Builds the block graph from a [`PipelineConfig`], wires edges, and
//! drives every block through the uniform lifecycle in dependency order:
//! sinks start before the sources that feed them, sources stop first, and
//! sinks shut down (draining their queues) before the producers whose
//! buffers those queues may still reference.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::block::{Block, BlockStats, ErrorCallback};
use super::config::PipelineConfig;
use super::error::{PipelineError, Result};
use super::registry::global_registry;

#[derive(Default)]
struct PipelineInner {
    config: PipelineConfig,
    /// Blocks in definition order; names are unique per config validation.
    blocks: Vec<(String, Arc<dyn Block>)>,
}

/// Owner and conductor of a block graph.
///
/// The pipeline exclusively owns the block instances it creates; callers
/// get shared, non-owning handles through [`Pipeline::block`].
pub struct Pipeline {
    inner: Mutex<PipelineInner>,
    running: AtomicBool,
    last_error: Arc<Mutex<Option<String>>>,
    user_callback: Arc<RwLock<Option<ErrorCallback>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PipelineInner::default()),
            running: AtomicBool::new(false),
            last_error: Arc::new(Mutex::new(None)),
            user_callback: Arc::new(RwLock::new(None)),
        }
    }

    /// Load a configuration file and initialize from it.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let config = PipelineConfig::from_file(path).map_err(|e| self.record(e))?;
        self.initialize(config)
    }

    /// Build, configure and connect all blocks described by `config`.
    ///
    /// Rejected while running. A failure creating a block clears the graph;
    /// a failure configuring or connecting leaves the partial graph in
    /// place for the caller to `shutdown`.
    pub fn initialize(&self, config: PipelineConfig) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(self.record(PipelineError::InvalidState(
                "cannot initialize while pipeline is running".into(),
            )));
        }

        config.validate().map_err(|e| self.record(e))?;

        tracing::info!(
            "initializing pipeline '{}' ({} blocks, {} connections)",
            config.name,
            config.blocks.len(),
            config.connections.len()
        );

        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.config = config;

        if let Err(e) = self.create_blocks(&mut inner) {
            inner.blocks.clear();
            return Err(self.record(e));
        }
        self.configure_blocks(&inner).map_err(|e| self.record(e))?;
        self.connect_blocks(&inner).map_err(|e| self.record(e))?;

        tracing::info!("pipeline '{}' initialized", inner.config.name);
        Ok(())
    }

    fn create_blocks(&self, inner: &mut PipelineInner) -> Result<()> {
        let registry = global_registry();

        for def in &inner.config.blocks {
            tracing::debug!("creating block '{}' of type '{}'", def.name, def.block_type);
            let block = registry
                .create_named(&def.block_type, &def.name)
                .ok_or_else(|| {
                    PipelineError::NotFound(format!(
                        "failed to create block '{}' of unknown type '{}'",
                        def.name, def.block_type
                    ))
                })?;

            block.set_error_callback(self.aggregate_callback());
            inner.blocks.push((def.name.clone(), block));
        }

        tracing::info!("created {} blocks", inner.blocks.len());
        Ok(())
    }

    fn configure_blocks(&self, inner: &PipelineInner) -> Result<()> {
        for def in &inner.config.blocks {
            let block = find(inner, &def.name).ok_or_else(|| {
                PipelineError::NotFound(format!("block '{}' missing after creation", def.name))
            })?;

            for (key, value) in &def.parameters {
                block.set_parameter(key, value).map_err(|e| {
                    PipelineError::InvalidArgument(format!(
                        "block '{}' rejected parameter '{key}': {e}",
                        def.name
                    ))
                })?;
            }

            block.initialize(&def.parameters).map_err(|e| {
                PipelineError::InvalidState(format!(
                    "failed to initialize block '{}': {e}",
                    def.name
                ))
            })?;
        }

        tracing::info!("all blocks configured");
        Ok(())
    }

    fn connect_blocks(&self, inner: &PipelineInner) -> Result<()> {
        for connection in &inner.config.connections {
            tracing::debug!("connecting {connection}");

            let source_block = find(inner, &connection.source_block).ok_or_else(|| {
                PipelineError::NotFound(format!(
                    "source block '{}' not found",
                    connection.source_block
                ))
            })?;
            let sink_block = find(inner, &connection.sink_block).ok_or_else(|| {
                PipelineError::NotFound(format!("sink block '{}' not found", connection.sink_block))
            })?;

            let source = source_block.as_source().ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "block '{}' is not a video source",
                    connection.source_block
                ))
            })?;
            let sink = sink_block.as_sink().ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "block '{}' is not a video sink",
                    connection.sink_block
                ))
            })?;

            // Route the edge into the sink's submit queue.
            let target = Arc::clone(sink_block);
            source.set_frame_callback(Arc::new(move |frame| {
                if let Some(sink) = target.as_sink() {
                    sink.submit(frame);
                }
            }));

            // Propagate the negotiated format; a mismatch is worth a
            // warning but not fatal.
            let format = source.output_format();
            if sink.supports_format(format.pixel_format) {
                sink.set_input_format(format)?;
            } else {
                tracing::warn!(
                    "format mismatch on {connection}: {} not accepted by '{}'",
                    format.pixel_format,
                    connection.sink_block
                );
            }
        }

        tracing::info!("connected {} edges", inner.config.connections.len());
        Ok(())
    }

    /// Start every block: sinks first, then intermediaries, then sources.
    ///
    /// A failed start aborts without rolling back already-started blocks;
    /// the caller is expected to `stop` or `shutdown`.
    pub fn start(&self) -> Result<()> {
        let inner = self.inner.lock();

        if inner.blocks.is_empty() {
            return Err(self.record(PipelineError::InvalidState(
                "no blocks to start; initialize first".into(),
            )));
        }
        if self.running.load(Ordering::Acquire) {
            tracing::warn!("pipeline '{}' already running", inner.config.name);
            return Ok(());
        }

        tracing::info!("starting pipeline '{}'", inner.config.name);

        let (sources, sinks, others) = classify(&inner);
        for block in sinks.iter().chain(&others).chain(&sources) {
            block.start().map_err(|e| {
                self.record(PipelineError::InvalidState(format!(
                    "failed to start block '{}': {e}",
                    block.name()
                )))
            })?;
        }

        self.running.store(true, Ordering::Release);
        tracing::info!("pipeline '{}' started", inner.config.name);
        Ok(())
    }

    /// Stop every block in reverse order: sources, intermediaries, sinks.
    ///
    /// Each stop is best-effort; one failure does not prevent the rest.
    pub fn stop(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.blocks.is_empty() {
            self.running.store(false, Ordering::Release);
            return Ok(());
        }

        tracing::info!("stopping pipeline '{}'", inner.config.name);

        let (sources, sinks, others) = classify(&inner);
        for block in sources.iter().chain(&others).chain(&sinks) {
            if let Err(e) = block.stop() {
                tracing::warn!("failed to stop block '{}': {e}", block.name());
            }
        }

        self.running.store(false, Ordering::Release);
        tracing::info!("pipeline '{}' stopped", inner.config.name);
        Ok(())
    }

    /// Stop, release every block's resources and clear the graph.
    ///
    /// Sinks shut down before sources: draining a sink queue releases
    /// frame references whose recyclers may still touch the producer.
    pub fn shutdown(&self) -> Result<()> {
        self.stop()?;

        let mut inner = self.inner.lock();
        let (sources, sinks, others) = classify(&inner);
        for block in sinks.iter().chain(&others).chain(&sources) {
            if let Err(e) = block.shutdown() {
                tracing::warn!("failed to shut down block '{}': {e}", block.name());
            }
        }

        inner.blocks.clear();
        inner.config = PipelineConfig::default();
        tracing::info!("pipeline shutdown complete");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Install the aggregate error callback receiving (block name, message)
    /// from every block. The default handler logs and records the error;
    /// it never restarts blocks.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.user_callback.write() = Some(callback);
    }

    pub fn block(&self, name: &str) -> Option<Arc<dyn Block>> {
        let inner = self.inner.lock();
        find(&inner, name).cloned()
    }

    pub fn block_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn all_stats(&self) -> BTreeMap<String, BlockStats> {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(name, block)| (name.clone(), block.stats()))
            .collect()
    }

    pub fn reset_all_stats(&self) {
        for (_, block) in &self.inner.lock().blocks {
            block.reset_stats();
        }
    }

    /// Human-readable summary of the pipeline and its blocks.
    pub fn status(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        let _ = writeln!(out, "pipeline: {}", inner.config.name);
        let _ = writeln!(
            out,
            "state: {}",
            if self.is_running() { "RUNNING" } else { "STOPPED" }
        );
        let _ = writeln!(out, "blocks: {}", inner.blocks.len());
        for (name, block) in &inner.blocks {
            let _ = writeln!(
                out,
                "  {name} [{}] - {}",
                block.type_name(),
                block.state()
            );
        }
        out
    }

    fn aggregate_callback(&self) -> ErrorCallback {
        let last_error = Arc::clone(&self.last_error);
        let user_callback = Arc::clone(&self.user_callback);
        Arc::new(move |block_name, message| {
            tracing::error!("block '{block_name}' error: {message}");
            *last_error.lock() = Some(format!("block '{block_name}': {message}"));
            if let Some(callback) = user_callback.read().clone() {
                callback(block_name, message);
            }
        })
    }

    fn record(&self, error: PipelineError) -> PipelineError {
        tracing::error!("{error}");
        *self.last_error.lock() = Some(error.to_string());
        error
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn find<'a>(inner: &'a PipelineInner, name: &str) -> Option<&'a Arc<dyn Block>> {
    inner
        .blocks
        .iter()
        .find(|(block_name, _)| block_name == name)
        .map(|(_, block)| block)
}

type Classified<'a> = (
    Vec<&'a Arc<dyn Block>>,
    Vec<&'a Arc<dyn Block>>,
    Vec<&'a Arc<dyn Block>>,
);

/// Split the graph into (sources, sinks, others).
fn classify(inner: &PipelineInner) -> Classified<'_> {
    let mut sources = Vec::new();
    let mut sinks = Vec::new();
    let mut others = Vec::new();

    for (_, block) in &inner.blocks {
        if block.as_source().is_some() {
            sources.push(block);
        } else if block.as_sink().is_some() {
            sinks.push(block);
        } else {
            others.push(block);
        }
    }

    (sources, sinks, others)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BlockDef, Connection};

    fn config_with(blocks: Vec<BlockDef>, connections: Vec<Connection>) -> PipelineConfig {
        PipelineConfig {
            name: "test".into(),
            platform: "generic".into(),
            blocks,
            connections,
            settings: BTreeMap::new(),
        }
    }

    fn def(name: &str, block_type: &str) -> BlockDef {
        BlockDef {
            name: name.into(),
            block_type: block_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn test_initialize_unknown_type_clears_graph() {
        let pipeline = Pipeline::new();
        let config = config_with(vec![def("x", "NoSuchType")], vec![]);

        let err = pipeline.initialize(config).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        assert!(pipeline.last_error().unwrap().contains("'x'"));
        assert!(pipeline.block_names().is_empty());
    }

    #[test]
    fn test_initialize_builds_named_blocks() {
        let pipeline = Pipeline::new();
        let config = config_with(
            vec![def("pattern", "TestPatternSource"), def("console", "ConsoleSink")],
            vec![Connection::new("pattern", "console")],
        );

        pipeline.initialize(config).unwrap();
        assert_eq!(pipeline.block_names(), vec!["pattern", "console"]);
        let block = pipeline.block("pattern").unwrap();
        assert_eq!(block.type_name(), "TestPatternSource");
        assert!(block.as_source().is_some());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_connection_requires_source_capability() {
        let pipeline = Pipeline::new();
        // Backwards edge: sink in the source position.
        let config = config_with(
            vec![def("console", "ConsoleSink"), def("pattern", "TestPatternSource")],
            vec![Connection::new("console", "pattern")],
        );

        let err = pipeline.initialize(config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
        assert!(pipeline
            .last_error()
            .unwrap()
            .contains("not a video source"));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_start_requires_blocks() {
        let pipeline = Pipeline::new();
        assert!(pipeline.start().is_err());
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_status_lists_blocks() {
        let pipeline = Pipeline::new();
        let config = config_with(vec![def("console", "ConsoleSink")], vec![]);
        pipeline.initialize(config).unwrap();

        let status = pipeline.status();
        assert!(status.contains("pipeline: test"));
        assert!(status.contains("console [ConsoleSink] - INITIALIZED"));
        pipeline.shutdown().unwrap();
    }
}
