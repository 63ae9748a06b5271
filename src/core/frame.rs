// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Video frame and buffer model.
//!
//! A [`VideoFrame`] owns its bytes in one of two ways: a 32-byte-aligned
//! heap allocation, or an externally owned mapping wrapped for zero-copy
//! delivery (camera DMA buffers and the like). Frames travel across
//! pipeline edges as [`SharedFrame`] (`Arc<VideoFrame>`); when the last
//! reference drops anywhere in the chain, the frame's recycler runs exactly
//! once before the storage is reclaimed, so a producer can requeue the
//! underlying capture buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{PipelineError, Result};

/// Heap frame allocations are aligned for SIMD access.
pub const FRAME_ALIGNMENT: usize = 32;

/// Pixel formats understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "RGB24")]
    Rgb24,
    #[serde(rename = "BGR24")]
    Bgr24,
    #[serde(rename = "RGBA32")]
    Rgba32,
    #[serde(rename = "BGRA32")]
    Bgra32,
    #[serde(rename = "YUV420P")]
    Yuv420p,
    #[serde(rename = "NV12")]
    Nv12,
    #[serde(rename = "NV21")]
    Nv21,
    #[serde(rename = "YUYV")]
    Yuyv,
    #[serde(rename = "UYVY")]
    Uyvy,
}

impl PixelFormat {
    /// Total byte size of one frame in this format.
    ///
    /// Pure function of `(format, width, height)`.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => pixels * 4,
            PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => pixels * 3 / 2,
            PixelFormat::Yuyv | PixelFormat::Uyvy => pixels * 2,
            PixelFormat::Unknown => 0,
        }
    }

    /// Number of planes for this format.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Unknown => 0,
            _ => 1,
        }
    }

    /// Row stride of plane 0 when none was supplied.
    pub fn default_stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => width * 4,
            PixelFormat::Yuyv | PixelFormat::Uyvy => width * 2,
            PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::Nv21 => width,
            PixelFormat::Unknown => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Unknown => "UNKNOWN",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgba32 => "RGBA32",
            PixelFormat::Bgra32 => "BGRA32",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(PixelFormat::Unknown),
            "RGB24" => Ok(PixelFormat::Rgb24),
            "BGR24" => Ok(PixelFormat::Bgr24),
            "RGBA32" => Ok(PixelFormat::Rgba32),
            "BGRA32" => Ok(PixelFormat::Bgra32),
            "YUV420P" => Ok(PixelFormat::Yuv420p),
            "NV12" => Ok(PixelFormat::Nv12),
            "NV21" => Ok(PixelFormat::Nv21),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            other => Err(PipelineError::InvalidArgument(format!(
                "unknown pixel format '{other}'"
            ))),
        }
    }
}

/// Frame metadata carried alongside the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of plane 0; 0 means "derive from format".
    pub stride: u32,
    pub pixel_format: PixelFormat,
    /// Monotonic presentation timestamp in microseconds.
    pub timestamp_us: u64,
    /// Per-source counter starting at 1 on each start.
    pub sequence_number: u64,
    pub is_hardware_buffer: bool,
    /// Opaque platform handle (e.g. a dmabuf fd).
    pub hw_handle: u64,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: pixel_format.default_stride(width),
            pixel_format,
            ..Default::default()
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// Effective stride of plane 0.
    pub fn effective_stride(&self) -> u32 {
        if self.stride != 0 {
            self.stride
        } else {
            self.pixel_format.default_stride(self.width)
        }
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)?;
        if self.stride != 0 && self.stride != self.pixel_format.default_stride(self.width) {
            write!(f, " stride={}", self.stride)?;
        }
        if self.timestamp_us > 0 {
            write!(f, " ts={}us", self.timestamp_us)?;
        }
        if self.sequence_number > 0 {
            write!(f, " seq={}", self.sequence_number)?;
        }
        Ok(())
    }
}

/// Callback invoked exactly once when a frame's last reference drops.
///
/// For zero-copy frames this is where the underlying hardware buffer is
/// returned to its producer. The recycler must not hold an owning reference
/// to the frame it releases.
pub type Recycler = Box<dyn FnOnce() + Send>;

struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn new(capacity: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, FRAME_ALIGNMENT).ok()?;
        // Zeroed so plane views never expose uninitialized memory.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum Storage {
    Owned(AlignedBuf),
    External { ptr: NonNull<u8> },
}

/// A reference-counted video buffer with plane views.
///
/// Producers create and fill a `VideoFrame`, then share it as a
/// [`SharedFrame`]. Consumers treat shared frames as read-only; the core
/// does not enforce this, it is a documented contract.
pub struct VideoFrame {
    info: FrameInfo,
    storage: Storage,
    capacity: usize,
    recycler: Option<Recycler>,
}

/// Shared handle to a frame crossing a pipeline edge.
pub type SharedFrame = Arc<VideoFrame>;

// Safety: the owned storage is uniquely held; external storage is only
// wrapped under the documented producer-outlives-frame contract, and
// mutation requires `&mut self`.
unsafe impl Send for VideoFrame {}
unsafe impl Sync for VideoFrame {}

impl VideoFrame {
    /// Allocate a heap-backed frame sized to `info`.
    pub fn alloc(info: FrameInfo) -> Result<VideoFrame> {
        let size = info.frame_size();
        if size == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "cannot allocate zero-sized frame ({info})"
            )));
        }

        let buf = AlignedBuf::new(size).ok_or_else(|| {
            PipelineError::ResourceUnavailable(format!("frame allocation of {size} bytes failed"))
        })?;

        let mut info = info;
        if info.stride == 0 {
            info.stride = info.pixel_format.default_stride(info.width);
        }

        Ok(VideoFrame {
            info,
            storage: Storage::Owned(buf),
            capacity: size,
            recycler: None,
        })
    }

    /// Wrap an externally owned mapping without copying.
    ///
    /// The recycler runs when the last reference drops, typically to
    /// requeue the capture buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// lifetime of the frame and every clone of its [`SharedFrame`] handle.
    /// The owning producer must outlive the frame's final release; the
    /// orchestrator guarantees this by draining sinks before shutting down
    /// sources.
    pub unsafe fn wrap_external(
        ptr: *mut u8,
        len: usize,
        info: FrameInfo,
        recycler: impl FnOnce() + Send + 'static,
    ) -> Result<VideoFrame> {
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            PipelineError::InvalidArgument("cannot wrap null external buffer".into())
        })?;
        if info.frame_size() > len {
            return Err(PipelineError::InvalidArgument(format!(
                "external buffer of {len} bytes too small for {info}"
            )));
        }

        Ok(VideoFrame {
            info,
            storage: Storage::External { ptr },
            capacity: len,
            recycler: Some(Box::new(recycler)),
        })
    }

    /// Install or replace the recycler fired on final release.
    pub fn set_recycler(&mut self, recycler: impl FnOnce() + Send + 'static) {
        self.recycler = Some(Box::new(recycler));
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// Mutable metadata access for producers (timestamp/sequence stamping).
    pub fn info_mut(&mut self) -> &mut FrameInfo {
        &mut self.info
    }

    /// Replace the metadata; fails if the new format outgrows the buffer.
    pub fn set_info(&mut self, info: FrameInfo) -> Result<()> {
        if info.frame_size() > self.capacity {
            return Err(PipelineError::InvalidArgument(format!(
                "frame info {info} exceeds buffer capacity {}",
                self.capacity
            )));
        }
        self.info = info;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of valid pixel data, always `<= capacity`.
    pub fn data_size(&self) -> usize {
        self.info.frame_size()
    }

    pub fn is_valid(&self) -> bool {
        let size = self.data_size();
        size > 0 && size <= self.capacity
    }

    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External { .. })
    }

    fn base_ptr(&self) -> *mut u8 {
        match &self.storage {
            Storage::Owned(buf) => buf.ptr.as_ptr(),
            Storage::External { ptr } => ptr.as_ptr(),
        }
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base_ptr(), self.data_size()) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr(), self.data_size()) }
    }

    pub fn plane_count(&self) -> usize {
        self.info.pixel_format.plane_count()
    }

    fn plane_offset(&self, plane: usize) -> Option<usize> {
        let w = self.info.width as usize;
        let h = self.info.height as usize;
        match (self.info.pixel_format, plane) {
            (PixelFormat::Yuv420p, 0) => Some(0),
            (PixelFormat::Yuv420p, 1) => Some(w * h),
            (PixelFormat::Yuv420p, 2) => Some(w * h * 5 / 4),
            (PixelFormat::Nv12 | PixelFormat::Nv21, 0) => Some(0),
            (PixelFormat::Nv12 | PixelFormat::Nv21, 1) => Some(w * h),
            (PixelFormat::Unknown, _) => None,
            (_, 0) => Some(0),
            _ => None,
        }
    }

    pub fn plane_size(&self, plane: usize) -> usize {
        let w = self.info.width as usize;
        let h = self.info.height as usize;
        match (self.info.pixel_format, plane) {
            (PixelFormat::Yuv420p, 0) => w * h,
            (PixelFormat::Yuv420p, 1 | 2) => w * h / 4,
            (PixelFormat::Nv12 | PixelFormat::Nv21, 0) => w * h,
            (PixelFormat::Nv12 | PixelFormat::Nv21, 1) => w * h / 2,
            (PixelFormat::Unknown, _) => 0,
            (_, 0) => self.data_size(),
            _ => 0,
        }
    }

    pub fn plane_stride(&self, plane: usize) -> u32 {
        let w = self.info.width;
        match (self.info.pixel_format, plane) {
            (PixelFormat::Yuv420p, 0) => w,
            (PixelFormat::Yuv420p, 1 | 2) => w / 2,
            (PixelFormat::Nv12 | PixelFormat::Nv21, 0 | 1) => w,
            (PixelFormat::Unknown, _) => 0,
            (format, 0) => format.default_stride(w),
            _ => 0,
        }
    }

    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        let offset = self.plane_offset(plane)?;
        let size = self.plane_size(plane);
        if size == 0 || offset + size > self.capacity {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.base_ptr().add(offset), size) })
    }

    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        let offset = self.plane_offset(plane)?;
        let size = self.plane_size(plane);
        if size == 0 || offset + size > self.capacity {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(offset), size) })
    }

    /// Copy `other`'s metadata and pixel data into this frame's buffer,
    /// keeping this frame's capacity and recycler.
    ///
    /// Returns `false` if `other` does not fit.
    pub fn copy_from(&mut self, other: &VideoFrame) -> bool {
        if other.data_size() > self.capacity {
            return false;
        }

        let mut info = *other.info();
        info.is_hardware_buffer = false;
        info.hw_handle = 0;
        self.info = info;

        let planes = self.plane_count().min(other.plane_count());
        for i in 0..planes {
            let size = other.plane_size(i).min(self.plane_size(i));
            if size == 0 {
                continue;
            }
            // Planes resolved one at a time; source and destination never alias.
            if let Some(src) = other.plane(i) {
                if let Some(dst) = self.plane_mut(i) {
                    dst[..size].copy_from_slice(&src[..size]);
                }
            }
        }
        true
    }

    /// Deep-copy into a fresh heap frame.
    ///
    /// The copy owns its bytes: any external binding is broken and the
    /// recycler is not carried over.
    pub fn try_clone(&self) -> Result<VideoFrame> {
        let mut info = self.info;
        info.is_hardware_buffer = false;
        info.hw_handle = 0;

        let mut clone = VideoFrame::alloc(info)?;
        clone.copy_from(self);
        Ok(clone)
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        // The last Arc release synchronizes with acquire on the strong
        // count, so the recycler observes all prior writes to the frame.
        if let Some(recycler) = self.recycler.take() {
            recycler();
        }
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("info", &self.info)
            .field("capacity", &self.capacity)
            .field("external", &self.is_external())
            .field("has_recycler", &self.recycler.is_some())
            .finish()
    }
}
