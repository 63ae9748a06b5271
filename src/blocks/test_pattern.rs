// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Synthetic test pattern source.
//!
//! Generates frames on its own producer thread, paced to the configured
//! frame rate. Useful for exercising pipelines without a capture device.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::block::{Block, BlockCore, BlockParams, BlockState};
use crate::core::error::{PipelineError, Result};
use crate::core::frame::{PixelFormat, VideoFrame};
use crate::core::source::{SourceBase, VideoSource};
use crate::core::threading::precise_sleep_until;
use crate::core::timing::monotonic_now_us;
use crate::register_block_type;

/// Available generator patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    SolidColor,
    #[default]
    ColorBars,
    Checkerboard,
    Gradient,
    Noise,
    MovingBox,
}

impl FromStr for TestPattern {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "solid" => Ok(TestPattern::SolidColor),
            "bars" => Ok(TestPattern::ColorBars),
            "checkerboard" => Ok(TestPattern::Checkerboard),
            "gradient" => Ok(TestPattern::Gradient),
            "noise" => Ok(TestPattern::Noise),
            "moving_box" => Ok(TestPattern::MovingBox),
            other => Err(PipelineError::InvalidArgument(format!(
                "unknown test pattern '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PatternSettings {
    pattern: TestPattern,
    color: (u8, u8, u8),
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            pattern: TestPattern::default(),
            color: (255, 255, 255),
        }
    }
}

/// Source block producing synthetic video frames.
///
/// Parameters: `width`, `height`, `fps`, `format`, `pattern`
/// (solid|bars|checkerboard|gradient|noise|moving_box) and `color`
/// (`#rrggbb` or `r,g,b`).
pub struct TestPatternSource {
    base: SourceBase,
    settings: Mutex<PatternSettings>,
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            base: SourceBase::new("TestPatternSource", "TestPatternSource"),
            settings: Mutex::new(PatternSettings::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn set_pattern(&self, pattern: TestPattern) {
        self.settings.lock().pattern = pattern;
    }

    pub fn pattern(&self) -> TestPattern {
        self.settings.lock().pattern
    }

    pub fn set_color(&self, r: u8, g: u8, b: u8) {
        self.settings.lock().color = (r, g, b);
    }

    pub fn color(&self) -> (u8, u8, u8) {
        self.settings.lock().color
    }

    fn parse_own_params(&self) -> Result<()> {
        let core = self.core();

        if let Some(pattern) = core.parameter("pattern") {
            self.settings.lock().pattern = pattern.parse().map_err(|e: PipelineError| core.reject(e))?;
        }

        if let Some(color) = core.parameter("color") {
            let parsed = parse_color(&color).ok_or_else(|| {
                core.reject(PipelineError::InvalidArgument(format!(
                    "invalid color '{color}'"
                )))
            })?;
            self.settings.lock().color = parsed;
        }

        Ok(())
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for TestPatternSource {
    fn core(&self) -> &BlockCore {
        self.base.core()
    }

    fn initialize(&self, _params: &BlockParams) -> Result<()> {
        self.core().check_can_initialize()?;

        self.base
            .apply_common_params()
            .and_then(|_| self.parse_own_params())
            .and_then(|_| {
                let format = self.base.output_format().pixel_format;
                if self.supports_format(format) {
                    Ok(())
                } else {
                    Err(PipelineError::InvalidArgument(format!(
                        "unsupported pixel format {format}"
                    )))
                }
            })
            .map_err(|e| self.core().fail(e))?;

        self.core().set_state(BlockState::Initialized);
        let settings = *self.settings.lock();
        tracing::info!(
            "[{}] initialized: {} pattern={:?}",
            self.name(),
            self.base.output_format(),
            settings.pattern
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.state() == BlockState::Running {
            return Ok(());
        }
        self.base.begin_start().map_err(|e| self.core().fail(e))?;

        self.stop_flag.store(false, Ordering::Release);
        let base = self.base.clone();
        let settings = *self.settings.lock();
        let stop = Arc::clone(&self.stop_flag);

        let handle = std::thread::Builder::new()
            .name(format!("{}-gen", self.name()))
            .spawn(move || generator_loop(base, settings, stop))
            .map_err(|e| {
                self.core().fail(PipelineError::ResourceUnavailable(format!(
                    "failed to spawn generator thread: {e}"
                )))
            })?;

        *self.thread.lock() = Some(handle);
        self.base.finish_start();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.state() != BlockState::Running {
            return Ok(());
        }

        self.base.begin_stop();
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[{}] generator thread panicked", self.name());
            }
        }
        self.base.finish_stop();
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.stop()?;
        self.base.reset();
        Ok(())
    }

    fn as_source(&self) -> Option<&dyn VideoSource> {
        Some(self)
    }
}

impl VideoSource for TestPatternSource {
    fn source_base(&self) -> &SourceBase {
        &self.base
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        matches!(
            format,
            PixelFormat::Rgb24
                | PixelFormat::Bgr24
                | PixelFormat::Rgba32
                | PixelFormat::Bgra32
                | PixelFormat::Yuv420p
                | PixelFormat::Yuyv
        )
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        vec![
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
            PixelFormat::Yuv420p,
            PixelFormat::Yuyv,
        ]
    }

    fn supported_resolutions(&self) -> Vec<(u32, u32)> {
        vec![
            (160, 120),
            (320, 240),
            (640, 480),
            (800, 600),
            (1024, 768),
            (1280, 720),
            (1920, 1080),
        ]
    }
}

register_block_type!("TestPatternSource", TestPatternSource);

fn generator_loop(base: SourceBase, settings: PatternSettings, stop: Arc<AtomicBool>) {
    tracing::debug!("[{}] generator thread started", base.core().name());

    let mut rng = XorShift64::new(monotonic_now_us() | 1);
    let mut counter: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        if base.core().state() != BlockState::Running {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let info = base.output_format();
        let mut frame = match VideoFrame::alloc(info) {
            Ok(frame) => frame,
            Err(e) => {
                base.core()
                    .frame_failure(&format!("frame allocation failed: {e}"));
                break;
            }
        };
        render_pattern(&mut frame, &settings, counter, &mut rng);

        // Pace against the last emission so the rate gate never discards a
        // frame we just rendered.
        if let (Some(interval), Some(last)) = (base.frame_interval(), base.last_emit_time()) {
            precise_sleep_until(last + interval);
        }
        if stop.load(Ordering::Acquire) {
            break;
        }

        base.emit_frame(frame);
        counter += 1;
    }

    tracing::debug!("[{}] generator thread stopped", base.core().name());
}

/// Parse `#rrggbb` or `r,g,b`.
fn parse_color(s: &str) -> Option<(u8, u8, u8)> {
    if let Some(hex) = s.strip_prefix('#') {
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        return Some((r, g, b));
    }

    let mut parts = s.split(',').map(|p| p.trim().parse::<u8>());
    let r = parts.next()?.ok()?;
    let g = parts.next()?.ok()?;
    let b = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((r, g, b))
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64) as u8
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn render_pattern(
    frame: &mut VideoFrame,
    settings: &PatternSettings,
    counter: u64,
    rng: &mut XorShift64,
) {
    let (r, g, b) = settings.color;
    let width = frame.info().width;
    let height = frame.info().height;

    match settings.pattern {
        TestPattern::SolidColor => fill_pixels(frame, |_, _| (r, g, b)),
        TestPattern::ColorBars => {
            // SMPTE-ish full-saturation bars.
            const BARS: [(u8, u8, u8); 8] = [
                (255, 255, 255),
                (255, 255, 0),
                (0, 255, 255),
                (0, 255, 0),
                (255, 0, 255),
                (255, 0, 0),
                (0, 0, 255),
                (0, 0, 0),
            ];
            let bar_width = (width / 8).max(1);
            fill_pixels(frame, |x, _| BARS[((x / bar_width) as usize).min(7)]);
        }
        TestPattern::Checkerboard => {
            const CHECK_SIZE: u32 = 32;
            fill_pixels(frame, |x, y| {
                if ((x / CHECK_SIZE) + (y / CHECK_SIZE)) % 2 == 0 {
                    (255, 255, 255)
                } else {
                    (0, 0, 0)
                }
            });
        }
        TestPattern::Gradient => {
            fill_pixels(frame, |x, y| {
                (
                    ((x * 255) / width.max(1)) as u8,
                    ((y * 255) / height.max(1)) as u8,
                    (((x + y) * 255) / (width + height).max(1)) as u8,
                )
            });
        }
        TestPattern::Noise => {
            for byte in frame.data_mut() {
                *byte = rng.next() as u8;
            }
        }
        TestPattern::MovingBox => {
            const BOX_SIZE: u32 = 64;
            let period = (width + height).max(1);
            let pos = (counter % period as u64) as u32;

            let (box_x, box_y) = if pos < width {
                (pos, 0)
            } else {
                (width.saturating_sub(BOX_SIZE), pos - width)
            };
            let box_x = box_x.min(width.saturating_sub(BOX_SIZE));
            let box_y = box_y.min(height.saturating_sub(BOX_SIZE));

            fill_pixels(frame, |x, y| {
                let inside = x >= box_x && x < box_x + BOX_SIZE && y >= box_y && y < box_y + BOX_SIZE;
                if inside {
                    (r, g, b)
                } else {
                    (0, 0, 0)
                }
            });
        }
    }
}

/// Fill a frame from an RGB-valued function of pixel position, converting
/// to the frame's pixel format.
fn fill_pixels(frame: &mut VideoFrame, pixel: impl Fn(u32, u32) -> (u8, u8, u8)) {
    let info = *frame.info();
    let (width, height) = (info.width, info.height);

    match info.pixel_format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let swap = info.pixel_format == PixelFormat::Bgr24;
            let data = frame.data_mut();
            for y in 0..height {
                for x in 0..width {
                    let (r, g, b) = pixel(x, y);
                    let i = ((y * width + x) * 3) as usize;
                    if swap {
                        data[i] = b;
                        data[i + 1] = g;
                        data[i + 2] = r;
                    } else {
                        data[i] = r;
                        data[i + 1] = g;
                        data[i + 2] = b;
                    }
                }
            }
        }
        PixelFormat::Rgba32 | PixelFormat::Bgra32 => {
            let swap = info.pixel_format == PixelFormat::Bgra32;
            let data = frame.data_mut();
            for y in 0..height {
                for x in 0..width {
                    let (r, g, b) = pixel(x, y);
                    let i = ((y * width + x) * 4) as usize;
                    if swap {
                        data[i] = b;
                        data[i + 1] = g;
                        data[i + 2] = r;
                    } else {
                        data[i] = r;
                        data[i + 1] = g;
                        data[i + 2] = b;
                    }
                    data[i + 3] = 255;
                }
            }
        }
        PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => {
            // Luma-only rendition with neutral chroma.
            if let Some(plane0) = frame.plane_mut(0) {
                for y in 0..height {
                    for x in 0..width {
                        let (r, g, b) = pixel(x, y);
                        plane0[(y * width + x) as usize] = luma(r, g, b);
                    }
                }
            }
            for plane in 1..info.pixel_format.plane_count() {
                if let Some(chroma) = frame.plane_mut(plane) {
                    chroma.fill(128);
                }
            }
        }
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            let y_first = info.pixel_format == PixelFormat::Yuyv;
            let data = frame.data_mut();
            for y in 0..height {
                for x in 0..width {
                    let (r, g, b) = pixel(x, y);
                    let i = ((y * width + x) * 2) as usize;
                    if y_first {
                        data[i] = luma(r, g, b);
                        data[i + 1] = 128;
                    } else {
                        data[i] = 128;
                        data[i + 1] = luma(r, g, b);
                    }
                }
            }
        }
        PixelFormat::Unknown => {}
    }
}
