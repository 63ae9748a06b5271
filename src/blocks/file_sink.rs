// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! File sink: writes frames to disk as raw bytes, PPM, PGM or a YUV dump.
//!
//! In multi-file mode (the default for image formats) each frame lands in
//! `{path}_{frame:06}.{ext}`; `single_file=true` appends every frame to one
//! file instead.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::block::{Block, BlockCore, BlockParams, BlockState};
use crate::core::error::{PipelineError, Result};
use crate::core::frame::{PixelFormat, SharedFrame, VideoFrame};
use crate::core::sink::{SinkBase, VideoSink};
use crate::register_block_type;

/// On-disk frame encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    #[default]
    Raw,
    Ppm,
    Pgm,
    Yuv,
}

impl FileFormat {
    fn extension(self) -> &'static str {
        match self {
            FileFormat::Raw => "raw",
            FileFormat::Ppm => "ppm",
            FileFormat::Pgm => "pgm",
            FileFormat::Yuv => "yuv",
        }
    }
}

impl FromStr for FileFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(FileFormat::Raw),
            "ppm" => Ok(FileFormat::Ppm),
            "pgm" => Ok(FileFormat::Pgm),
            "yuv" => Ok(FileFormat::Yuv),
            other => Err(PipelineError::InvalidArgument(format!(
                "unknown file format '{other}'"
            ))),
        }
    }
}

struct WriterState {
    output: Option<BufWriter<File>>,
    current_path: PathBuf,
    frames_written: u64,
}

struct FileWriter {
    path: Mutex<PathBuf>,
    format: Mutex<FileFormat>,
    single_file: Mutex<bool>,
    state: Mutex<WriterState>,
}

impl FileWriter {
    fn write_frame(&self, frame: &SharedFrame) -> Result<()> {
        if !frame.is_valid() {
            return Err(PipelineError::InvalidArgument(
                "invalid frame received".into(),
            ));
        }

        let format = *self.format.lock();
        match format {
            FileFormat::Raw | FileFormat::Yuv => self.write_raw(frame, format.extension()),
            FileFormat::Ppm => self.write_ppm(frame),
            FileFormat::Pgm => self.write_pgm(frame),
        }?;

        self.state.lock().frames_written += 1;
        Ok(())
    }

    fn numbered_path(&self, extension: &str) -> PathBuf {
        let base = self.path.lock().clone();
        let index = self.state.lock().frames_written;
        numbered_path(&base, index, extension)
    }

    fn open(&self, path: PathBuf, append: bool) -> Result<()> {
        let mut state = self.state.lock();
        if append && state.output.is_some() && state.current_path == path {
            return Ok(());
        }

        let file = if append && path.exists() && state.frames_written > 0 {
            File::options().append(true).open(&path)?
        } else {
            File::create(&path)?
        };

        tracing::debug!("opened output file {}", path.display());
        state.output = Some(BufWriter::new(file));
        state.current_path = path;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut output) = state.output.take() {
            if let Err(e) = output.flush() {
                tracing::warn!("failed to flush output file: {e}");
            }
            tracing::debug!("closed output file {}", state.current_path.display());
        }
    }

    fn write_raw(&self, frame: &SharedFrame, extension: &str) -> Result<()> {
        let single = *self.single_file.lock();
        let path = if single {
            let mut path = self.path.lock().clone();
            if path.extension().is_none() {
                path.set_extension(extension);
            }
            path
        } else {
            self.numbered_path(extension)
        };

        self.open(path, single)?;

        let mut state = self.state.lock();
        let output = state.output.as_mut().ok_or_else(|| {
            PipelineError::ResourceUnavailable("output file not open".into())
        })?;
        output.write_all(frame.data())?;

        if !single {
            drop(state);
            self.close();
        }
        Ok(())
    }

    fn write_ppm(&self, frame: &SharedFrame) -> Result<()> {
        let info = *frame.info();
        if !matches!(
            info.pixel_format,
            PixelFormat::Rgb24 | PixelFormat::Rgba32
        ) {
            return Err(PipelineError::InvalidArgument(format!(
                "PPM output supports RGB24 and RGBA32, got {}",
                info.pixel_format
            )));
        }

        let path = self.numbered_path("ppm");
        self.open(path, false)?;

        {
            let mut state = self.state.lock();
            let output = state.output.as_mut().ok_or_else(|| {
                PipelineError::ResourceUnavailable("output file not open".into())
            })?;

            write!(output, "P6\n{} {}\n255\n", info.width, info.height)?;

            let data = frame.data();
            match info.pixel_format {
                PixelFormat::Rgb24 => output.write_all(data)?,
                PixelFormat::Rgba32 => {
                    // Collapse to RGB by dropping alpha.
                    for pixel in data.chunks_exact(4) {
                        output.write_all(&pixel[..3])?;
                    }
                }
                _ => unreachable!(),
            }
        }

        self.close();
        Ok(())
    }

    fn write_pgm(&self, frame: &SharedFrame) -> Result<()> {
        let info = *frame.info();
        let path = self.numbered_path("pgm");
        self.open(path, false)?;

        {
            let mut state = self.state.lock();
            let output = state.output.as_mut().ok_or_else(|| {
                PipelineError::ResourceUnavailable("output file not open".into())
            })?;

            write!(output, "P5\n{} {}\n255\n", info.width, info.height)?;
            write_luma(output, frame)?;
        }

        self.close();
        Ok(())
    }
}

/// Rec.601 luma from RGB; planar YUV contributes its Y plane directly.
fn write_luma(output: &mut impl Write, frame: &VideoFrame) -> Result<()> {
    let info = frame.info();
    match info.pixel_format {
        PixelFormat::Rgb24 => {
            for pixel in frame.data().chunks_exact(3) {
                let y = (0.299 * pixel[0] as f64
                    + 0.587 * pixel[1] as f64
                    + 0.114 * pixel[2] as f64) as u8;
                output.write_all(&[y])?;
            }
        }
        PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => {
            if let Some(plane0) = frame.plane(0) {
                output.write_all(plane0)?;
            }
        }
        _ => {
            // Treat the first width*height bytes as luma.
            let count = (info.width as usize * info.height as usize).min(frame.data().len());
            output.write_all(&frame.data()[..count])?;
        }
    }
    Ok(())
}

fn numbered_path(base: &Path, index: u64, extension: &str) -> PathBuf {
    let stem = base.to_string_lossy();
    PathBuf::from(format!("{stem}_{index:06}.{extension}"))
}

/// Sink block writing frames to disk.
///
/// Parameters: `queue_depth`, `blocking`, `path`, `format`
/// (raw|ppm|pgm|yuv), `single_file`.
pub struct FileSink {
    base: SinkBase,
    writer: Arc<FileWriter>,
}

impl FileSink {
    pub fn new() -> Self {
        Self {
            base: SinkBase::new("FileSink", "FileSink"),
            writer: Arc::new(FileWriter {
                path: Mutex::new(PathBuf::from("output")),
                format: Mutex::new(FileFormat::Raw),
                single_file: Mutex::new(false),
                state: Mutex::new(WriterState {
                    output: None,
                    current_path: PathBuf::new(),
                    frames_written: 0,
                }),
            }),
        }
    }

    pub fn set_output_path(&self, path: &Path) -> Result<()> {
        if self.state() == BlockState::Running {
            return Err(self.core().reject(PipelineError::InvalidState(
                "cannot change output path while running".into(),
            )));
        }
        *self.writer.path.lock() = path.to_path_buf();
        Ok(())
    }

    pub fn set_file_format(&self, format: FileFormat) -> Result<()> {
        if self.state() == BlockState::Running {
            return Err(self.core().reject(PipelineError::InvalidState(
                "cannot change file format while running".into(),
            )));
        }
        *self.writer.format.lock() = format;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.writer.state.lock().frames_written
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for FileSink {
    fn core(&self) -> &BlockCore {
        self.base.core()
    }

    fn initialize(&self, _params: &BlockParams) -> Result<()> {
        self.core().check_can_initialize()?;
        self.base
            .apply_common_params()
            .map_err(|e| self.core().fail(e))?;

        let core = self.core();
        if let Some(path) = core.parameter("path") {
            if path.is_empty() {
                tracing::warn!("[{}] empty output path, using 'output'", self.name());
            } else {
                *self.writer.path.lock() = PathBuf::from(path);
            }
        }

        if let Some(format) = core.parameter("format") {
            let format: FileFormat = format
                .parse()
                .map_err(|e: PipelineError| self.core().fail(e))?;
            *self.writer.format.lock() = format;
        }

        if let Some(single) = core.parameter("single_file") {
            *self.writer.single_file.lock() = single == "true" || single == "1";
        }

        // Multi-file mode needs the parent directory in place up front.
        if let Some(parent) = self.writer.path.lock().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    self.core().fail(PipelineError::Io(e))
                })?;
            }
        }

        self.writer.state.lock().frames_written = 0;
        self.core().set_state(BlockState::Initialized);
        tracing::info!(
            "[{}] initialized: path={}, format={:?}, single_file={}",
            self.name(),
            self.writer.path.lock().display(),
            *self.writer.format.lock(),
            *self.writer.single_file.lock()
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        self.base.start(Box::new(move |frame| writer.write_frame(frame)))
    }

    fn stop(&self) -> Result<()> {
        self.base.stop()?;
        self.writer.close();
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.base.reset()?;
        self.writer.close();
        Ok(())
    }

    fn as_sink(&self) -> Option<&dyn VideoSink> {
        Some(self)
    }
}

impl VideoSink for FileSink {
    fn sink_base(&self) -> &SinkBase {
        &self.base
    }

    fn supports_format(&self, format: PixelFormat) -> bool {
        // Raw dumps accept anything; the stricter per-format checks happen
        // at write time.
        format != PixelFormat::Unknown
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

register_block_type!("FileSink", FileSink);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::FrameInfo;
    use std::time::Duration;

    fn rgb_frame(fill: u8) -> SharedFrame {
        let mut frame = VideoFrame::alloc(FrameInfo::new(8, 4, PixelFormat::Rgb24)).unwrap();
        frame.data_mut().fill(fill);
        Arc::new(frame)
    }

    fn run_sink_with(params: &[(&str, &str)], frames: Vec<SharedFrame>) -> FileSink {
        let sink = FileSink::new();
        for (key, value) in params {
            sink.set_parameter(key, value).unwrap();
        }
        sink.initialize(&sink.configuration()).unwrap();
        sink.start().unwrap();
        for frame in frames {
            assert!(sink.submit(frame));
        }
        std::thread::sleep(Duration::from_millis(100));
        sink.stop().unwrap();
        sink
    }

    #[test]
    fn test_numbered_path_format() {
        assert_eq!(
            numbered_path(Path::new("/tmp/run/out"), 7, "ppm"),
            PathBuf::from("/tmp/run/out_000007.ppm")
        );
    }

    #[test]
    fn test_ppm_files_have_exact_layout() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        let sink = run_sink_with(
            &[("path", base.to_str().unwrap()), ("format", "ppm")],
            vec![rgb_frame(10), rgb_frame(20)],
        );
        assert_eq!(sink.frames_written(), 2);

        for (index, fill) in [(0u64, 10u8), (1, 20)] {
            let path = numbered_path(&base, index, "ppm");
            let bytes = std::fs::read(&path).unwrap();
            let header = b"P6\n8 4\n255\n";
            assert_eq!(&bytes[..header.len()], header);
            assert_eq!(bytes.len(), header.len() + 8 * 4 * 3);
            assert!(bytes[header.len()..].iter().all(|&b| b == fill));
        }
    }

    #[test]
    fn test_ppm_rejects_yuv_frames() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        let frame =
            Arc::new(VideoFrame::alloc(FrameInfo::new(8, 4, PixelFormat::Yuv420p)).unwrap());
        let sink = run_sink_with(
            &[("path", base.to_str().unwrap()), ("format", "ppm")],
            vec![frame],
        );
        // The frame is counted as dropped, not written.
        assert_eq!(sink.frames_written(), 0);
        assert_eq!(sink.stats().frames_dropped, 1);
    }

    #[test]
    fn test_rgba_collapsed_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");

        let mut frame = VideoFrame::alloc(FrameInfo::new(2, 1, PixelFormat::Rgba32)).unwrap();
        frame.data_mut().copy_from_slice(&[1, 2, 3, 255, 4, 5, 6, 255]);

        let _sink = run_sink_with(
            &[("path", base.to_str().unwrap()), ("format", "ppm")],
            vec![Arc::new(frame)],
        );

        let bytes = std::fs::read(numbered_path(&base, 0, "ppm")).unwrap();
        let header = b"P6\n2 1\n255\n";
        assert_eq!(&bytes[header.len()..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_pgm_from_rgb_uses_rec601() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");

        let mut frame = VideoFrame::alloc(FrameInfo::new(1, 1, PixelFormat::Rgb24)).unwrap();
        frame.data_mut().copy_from_slice(&[255, 0, 0]);

        let _sink = run_sink_with(
            &[("path", base.to_str().unwrap()), ("format", "pgm")],
            vec![Arc::new(frame)],
        );

        let bytes = std::fs::read(numbered_path(&base, 0, "pgm")).unwrap();
        let header = b"P5\n1 1\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(bytes[header.len()], 76); // 0.299 * 255
    }

    #[test]
    fn test_single_file_raw_appends() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("capture.raw");
        let sink = run_sink_with(
            &[
                ("path", base.to_str().unwrap()),
                ("format", "raw"),
                ("single_file", "true"),
            ],
            vec![rgb_frame(1), rgb_frame(2), rgb_frame(3)],
        );
        sink.shutdown().unwrap();

        let bytes = std::fs::read(&base).unwrap();
        assert_eq!(bytes.len(), 8 * 4 * 3 * 3);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8 * 4 * 3], 2);
        assert_eq!(bytes[2 * 8 * 4 * 3], 3);
    }

    #[test]
    fn test_multi_file_raw() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("frames/out");
        let sink = run_sink_with(
            &[("path", base.to_str().unwrap()), ("format", "raw")],
            vec![rgb_frame(9), rgb_frame(8)],
        );
        assert_eq!(sink.frames_written(), 2);
        assert!(numbered_path(&base, 0, "raw").exists());
        assert!(numbered_path(&base, 1, "raw").exists());
    }
}
