// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! TCP sink: streams raw frame bytes to a remote peer.
//!
//! The receiver must know the negotiated format; no framing is added.
//! With `reconnect=true` a failed send triggers one reconnect-and-retry
//! before the frame is counted as dropped.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::block::{Block, BlockCore, BlockParams, BlockState};
use crate::core::error::{PipelineError, Result};
use crate::core::frame::{PixelFormat, SharedFrame};
use crate::core::sink::{SinkBase, VideoSink};
use crate::register_block_type;

const DEFAULT_PORT: u16 = 9999;

struct TcpConn {
    host: Mutex<String>,
    port: Mutex<u16>,
    reconnect: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConn {
    fn connect(&self) -> Result<()> {
        let address = format!("{}:{}", self.host.lock(), self.port.lock());
        let stream = TcpStream::connect(&address).map_err(|e| {
            PipelineError::ResourceUnavailable(format!("connect to {address} failed: {e}"))
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("failed to set TCP_NODELAY: {e}");
        }

        tracing::info!("connected to {address}");
        *self.stream.lock() = Some(stream);
        Ok(())
    }

    fn disconnect(&self) {
        *self.stream.lock() = None;
    }

    fn send(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no connection")
        })?;
        stream.write_all(data)
    }

    fn send_frame(&self, frame: &SharedFrame) -> Result<()> {
        if self.stream.lock().is_none() {
            if !self.reconnect.load(Ordering::Relaxed) {
                return Err(PipelineError::ResourceUnavailable(
                    "connection lost".into(),
                ));
            }
            self.connect()?;
        }

        if let Err(e) = self.send(frame.data()) {
            if !self.reconnect.load(Ordering::Relaxed) {
                self.disconnect();
                return Err(PipelineError::Io(e));
            }

            tracing::warn!("send failed ({e}), reconnecting");
            self.disconnect();
            self.connect()?;
            self.send(frame.data()).map_err(PipelineError::Io)?;
        }
        Ok(())
    }
}

/// Sink block forwarding raw frame bytes over a TCP connection.
///
/// Parameters: `queue_depth`, `blocking`, `host`, `port`, `reconnect`.
pub struct TcpSink {
    base: SinkBase,
    conn: Arc<TcpConn>,
}

impl TcpSink {
    pub fn new() -> Self {
        Self {
            base: SinkBase::new("TcpSink", "TcpSink"),
            conn: Arc::new(TcpConn {
                host: Mutex::new("127.0.0.1".to_string()),
                port: Mutex::new(DEFAULT_PORT),
                reconnect: AtomicBool::new(true),
                stream: Mutex::new(None),
            }),
        }
    }
}

impl Default for TcpSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for TcpSink {
    fn core(&self) -> &BlockCore {
        self.base.core()
    }

    fn initialize(&self, _params: &BlockParams) -> Result<()> {
        self.core().check_can_initialize()?;
        self.base
            .apply_common_params()
            .map_err(|e| self.core().fail(e))?;

        let core = self.core();
        if let Some(host) = core.parameter("host") {
            if !host.is_empty() {
                *self.conn.host.lock() = host;
            }
        }

        if let Some(port) = core.parameter("port") {
            let port: u16 = match port.parse() {
                Ok(port) if port > 0 => port,
                _ => {
                    return Err(self.core().fail(PipelineError::InvalidArgument(format!(
                        "invalid port '{port}'"
                    ))))
                }
            };
            *self.conn.port.lock() = port;
        }

        if let Some(reconnect) = core.parameter("reconnect") {
            self.conn
                .reconnect
                .store(reconnect == "true" || reconnect == "1", Ordering::Relaxed);
        }

        self.core().set_state(BlockState::Initialized);
        tracing::info!(
            "[{}] initialized: {}:{}, reconnect={}",
            self.name(),
            self.conn.host.lock(),
            self.conn.port.lock(),
            self.conn.reconnect.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.core().check_can_start()?;

        // Establish the connection before accepting frames.
        self.conn.connect().map_err(|e| self.core().fail(e))?;

        let conn = Arc::clone(&self.conn);
        self.base.start(Box::new(move |frame| conn.send_frame(frame)))
    }

    fn stop(&self) -> Result<()> {
        self.base.stop()?;
        self.conn.disconnect();
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.base.reset()?;
        self.conn.disconnect();
        Ok(())
    }

    fn as_sink(&self) -> Option<&dyn VideoSink> {
        Some(self)
    }
}

impl VideoSink for TcpSink {
    fn sink_base(&self) -> &SinkBase {
        &self.base
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        // Raw byte stream; the receiver interprets.
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

register_block_type!("TcpSink", TcpSink);
