// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pixel buffers shared between the VM renderer and Android surfaces.

use std::collections::TryReserveError;
use std::ffi::c_void;
use std::ptr;
use thiserror::Error;

/// `HAL_PIXEL_FORMAT_BGRA_8888`.
///
/// crosvm always uses BGRA8888 or BGRX8888 for scanout blobs. BGRA is used, not BGRX, so that
/// the cursor surface can be alpha blended.
pub const PIXEL_FORMAT_BGRA_8888: i32 = 5;

/// Bytes per pixel of [`PIXEL_FORMAT_BGRA_8888`].
pub const BYTES_PER_PIXEL: usize = 4;

/// Errors that can occur while (re)allocating a [`PixelBuffer`]
#[derive(Debug, Error)]
pub enum BufferConfigError {
    /// Only BGRA_8888 is supported
    #[error("Pixel format {0} is not BGRA_8888.")]
    UnsupportedFormat(i32),

    /// The requested size cannot be addressed
    #[error("buffer of {width}x{height} pixels is too large")]
    TooLarge { width: u32, height: u32 },

    /// Backing memory couldn't be allocated
    #[error("failed to allocate buffer: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Errors from copying pixels between two buffers
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Source and destination have different sizes
    #[error("dimension mismatch. from=({}, {}) to=({}, {})", .from.0, .from.1, .to.0, .to.1)]
    DimensionMismatch { from: (i32, i32), to: (i32, i32) },

    /// Nothing was rendered since the surface was attached
    #[error("no frame has been rendered yet")]
    NoFrame,

    /// A non-empty buffer without backing memory
    #[error("buffer has no pixel storage")]
    InvalidBuffer,
}

/// Buffer descriptor with the same layout as `ANativeWindow_Buffer`.
///
/// Both real surface buffers and [`PixelBuffer`]s are handed to crosvm in this shape, so the
/// renderer doesn't need to know which one it is drawing into.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NativeBuffer {
    pub width: i32,
    pub height: i32,
    /// In pixels, not bytes.
    pub stride: i32,
    pub format: i32,
    pub bits: *mut c_void,
    pub reserved: [u32; 6],
}

// SAFETY: `NativeBuffer` is a plain descriptor. Dereferencing `bits` is only done through the
// unsafe accessors below, whose callers are responsible for the validity of the memory.
unsafe impl Send for NativeBuffer {}

impl Default for NativeBuffer {
    fn default() -> Self {
        Self { width: 0, height: 0, stride: 0, format: 0, bits: ptr::null_mut(), reserved: [0; 6] }
    }
}

impl NativeBuffer {
    /// (width, height) of the buffer.
    pub fn dimensions(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Returns row `y` of the buffer. Only the visible `width` pixels are included.
    ///
    /// # Safety
    ///
    /// `bits` must point to at least `stride * height` pixels that stay valid and unaliased by
    /// writers for `'a`, and `y` must be less than `height`.
    pub unsafe fn row<'a>(&self, y: usize) -> &'a [u8] {
        let offset = y * self.stride as usize * BYTES_PER_PIXEL;
        // SAFETY: guaranteed by the caller.
        unsafe {
            std::slice::from_raw_parts(
                (self.bits as *const u8).add(offset),
                self.width as usize * BYTES_PER_PIXEL,
            )
        }
    }

    /// Mutable version of [`NativeBuffer::row`].
    ///
    /// # Safety
    ///
    /// Same as [`NativeBuffer::row`], and no other reference to the row may exist for `'a`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut<'a>(&self, y: usize) -> &'a mut [u8] {
        let offset = y * self.stride as usize * BYTES_PER_PIXEL;
        // SAFETY: guaranteed by the caller.
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.bits as *mut u8).add(offset),
                self.width as usize * BYTES_PER_PIXEL,
            )
        }
    }
}

/// Copies the visible pixels of `from` into `to`, line by line, honoring the stride of each.
///
/// # Safety
///
/// Both buffers must describe valid, non-overlapping memory of at least `stride * height` pixels.
pub unsafe fn copy_buffer(from: &NativeBuffer, to: &NativeBuffer) -> Result<(), CopyError> {
    if from.dimensions() != to.dimensions() {
        return Err(CopyError::DimensionMismatch { from: from.dimensions(), to: to.dimensions() });
    }
    if to.is_empty() {
        return Ok(());
    }
    if from.bits.is_null() || to.bits.is_null() {
        return Err(CopyError::InvalidBuffer);
    }
    for y in 0..to.height as usize {
        // SAFETY: guaranteed by the caller; rows of two distinct buffers never overlap.
        unsafe { to.row_mut(y).copy_from_slice(from.row(y)) };
    }
    Ok(())
}

/// A CPU-backed buffer in the same shape as a surface buffer.
///
/// Used as the sink crosvm draws into while no Android surface is attached, and to keep a copy of
/// the last frame.
#[derive(Default)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: i32,
    bits: Vec<u8>,
}

impl PixelBuffer {
    /// Allocates a zeroed buffer of the given geometry.
    pub fn with_geometry(width: u32, height: u32, format: i32) -> Result<Self, BufferConfigError> {
        if format != PIXEL_FORMAT_BGRA_8888 {
            return Err(BufferConfigError::UnsupportedFormat(format));
        }
        let too_large = || BufferConfigError::TooLarge { width, height };
        if i32::try_from(width).is_err() || i32::try_from(height).is_err() {
            return Err(too_large());
        }
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(too_large)?;

        let mut bits = Vec::new();
        bits.try_reserve_exact(len)?;
        bits.resize(len, 0);
        Ok(Self { width, height, format, bits })
    }

    /// Resizes the buffer. Contents are kept when the geometry doesn't change, otherwise the
    /// buffer is zeroed. On error the buffer is left as it was.
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        format: i32,
    ) -> Result<(), BufferConfigError> {
        if format == self.format && width == self.width && height == self.height {
            return Ok(());
        }
        *self = Self::with_geometry(width, height, format)?;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tightly packed BGRA pixels, row after row.
    pub fn pixels(&self) -> &[u8] {
        &self.bits
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.bits
    }

    /// Describes this buffer as a surface buffer. The descriptor is valid until the buffer is
    /// reconfigured or dropped.
    pub fn as_native_buffer(&mut self) -> NativeBuffer {
        let bits =
            if self.bits.is_empty() { ptr::null_mut() } else { self.bits.as_mut_ptr().cast() };
        NativeBuffer {
            width: self.width as i32,
            height: self.height as i32,
            stride: self.width as i32,
            format: self.format,
            bits,
            reserved: [0; 6],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn configure_allocates_zeroed_bgra() -> Result<()> {
        let mut buffer = PixelBuffer::default();
        buffer.configure(3, 2, PIXEL_FORMAT_BGRA_8888)?;
        assert_eq!(buffer.pixels().len(), 3 * 2 * 4);
        assert!(buffer.pixels().iter().all(|&b| b == 0));

        let desc = buffer.as_native_buffer();
        assert_eq!((desc.width, desc.height, desc.stride), (3, 2, 3));
        assert_eq!(desc.format, PIXEL_FORMAT_BGRA_8888);
        assert!(!desc.bits.is_null());
        Ok(())
    }

    #[test]
    fn unsupported_format_leaves_buffer_unconfigured() {
        const RGBA_8888: i32 = 1;
        let mut buffer = PixelBuffer::default();
        let err = buffer.configure(4, 4, RGBA_8888).unwrap_err();
        assert!(matches!(err, BufferConfigError::UnsupportedFormat(RGBA_8888)));
        assert!(buffer.pixels().is_empty());
        assert!(buffer.as_native_buffer().bits.is_null());
    }

    #[test]
    fn too_large() {
        let result = PixelBuffer::with_geometry(u32::MAX, 2, PIXEL_FORMAT_BGRA_8888);
        assert!(matches!(result, Err(BufferConfigError::TooLarge { .. })));
    }

    #[test]
    fn same_geometry_keeps_contents() -> Result<()> {
        let mut buffer = PixelBuffer::with_geometry(2, 2, PIXEL_FORMAT_BGRA_8888)?;
        buffer.pixels_mut()[5] = 0xab;
        buffer.configure(2, 2, PIXEL_FORMAT_BGRA_8888)?;
        assert_eq!(buffer.pixels()[5], 0xab);

        buffer.configure(4, 1, PIXEL_FORMAT_BGRA_8888)?;
        assert_eq!(buffer.pixels()[5], 0);
        Ok(())
    }

    #[test]
    fn copy_respects_stride() -> Result<()> {
        // 2x2 visible pixels inside rows of 3 pixels.
        let mut strided = vec![0u8; 3 * 2 * 4];
        for (i, b) in strided.iter_mut().enumerate() {
            *b = i as u8;
        }
        let from = NativeBuffer {
            width: 2,
            height: 2,
            stride: 3,
            format: PIXEL_FORMAT_BGRA_8888,
            bits: strided.as_mut_ptr().cast(),
            reserved: [0; 6],
        };
        let mut packed = PixelBuffer::with_geometry(2, 2, PIXEL_FORMAT_BGRA_8888)?;
        let to = packed.as_native_buffer();

        // SAFETY: both buffers are alive and sized according to their descriptors.
        unsafe { copy_buffer(&from, &to)? };

        let expected: Vec<u8> = (0u8..8).chain(12..20).collect();
        assert_eq!(packed.pixels(), expected.as_slice());
        Ok(())
    }

    #[test]
    fn copy_rejects_dimension_mismatch() -> Result<()> {
        let mut a = PixelBuffer::with_geometry(2, 2, PIXEL_FORMAT_BGRA_8888)?;
        let mut b = PixelBuffer::with_geometry(2, 3, PIXEL_FORMAT_BGRA_8888)?;
        // SAFETY: both buffers are alive and sized according to their descriptors.
        let err = unsafe { copy_buffer(&a.as_native_buffer(), &b.as_native_buffer()) };
        assert_eq!(err, Err(CopyError::DimensionMismatch { from: (2, 2), to: (2, 3) }));
        Ok(())
    }
}
