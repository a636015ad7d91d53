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

//! Native windows that a VM display can be attached to.

use crate::buffer::{NativeBuffer, BYTES_PER_PIXEL, PIXEL_FORMAT_BGRA_8888};
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard};

/// Status code returned by native window calls. Negative errno values, as `status_t`.
pub type NativeStatus = i32;

const BAD_VALUE: NativeStatus = -libc::EINVAL;
const INVALID_OPERATION: NativeStatus = -libc::ENOSYS;

/// The subset of `ANativeWindow` used to present VM frames.
///
/// # Safety
///
/// The memory described by a buffer returned from [`NativeWindow::lock`] must stay valid for
/// reads and writes of `stride * height` pixels until the window is dropped or
/// [`NativeWindow::set_buffers_geometry`] is called again.
pub unsafe trait NativeWindow: Send {
    /// Sets the size and format of the buffers returned by subsequent locks.
    fn set_buffers_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: i32,
    ) -> Result<(), NativeStatus>;

    /// Locks the next buffer for drawing.
    fn lock(&mut self) -> Result<NativeBuffer, NativeStatus>;

    /// Unlocks the buffer locked by [`NativeWindow::lock`] and queues it for display.
    fn unlock_and_post(&mut self) -> Result<(), NativeStatus>;
}

/// A frame queued on a [`HeadlessWindow`], with the row padding removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Default)]
struct HeadlessState {
    width: u32,
    height: u32,
    stride: u32,
    format: i32,
    stride_alignment: u32,
    buffers: [Vec<u8>; 2],
    back: usize,
    locked: bool,
    geometry_calls: usize,
    posted_frames: usize,
    last_posted: Option<Frame>,
    lock_failure: Option<NativeStatus>,
    geometry_failure: Option<NativeStatus>,
}

impl HeadlessState {
    fn allocate(&mut self) {
        let align = self.stride_alignment.max(1);
        self.stride = self.width.div_ceil(align) * align;
        let len = self.stride as usize * self.height as usize * BYTES_PER_PIXEL;
        self.buffers = [vec![0; len], vec![0; len]];
        self.back = 0;
    }

    fn descriptor(&mut self) -> NativeBuffer {
        NativeBuffer {
            width: self.width as i32,
            height: self.height as i32,
            stride: self.stride as i32,
            format: self.format,
            bits: self.buffers[self.back].as_mut_ptr().cast(),
            reserved: [0; 6],
        }
    }
}

/// A CPU-backed double-buffered window.
///
/// Stands in for an Android `Surface` where there is no compositor, e.g. when running the display
/// path on a host. Rows can be padded with [`HeadlessWindow::with_stride_alignment`] to behave
/// like gralloc buffers.
pub struct HeadlessWindow {
    state: Arc<Mutex<HeadlessState>>,
}

/// Observes a [`HeadlessWindow`] after its ownership has been handed over.
#[derive(Clone)]
pub struct HeadlessWindowMonitor {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessWindow {
    /// Creates a window whose buffers are `width` x `height` until geometry is set.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_stride_alignment(width, height, 1)
    }

    /// Like [`HeadlessWindow::new`], with row strides rounded up to a multiple of `alignment`
    /// pixels.
    pub fn with_stride_alignment(width: u32, height: u32, alignment: u32) -> Self {
        let mut state = HeadlessState {
            width,
            height,
            format: PIXEL_FORMAT_BGRA_8888,
            stride_alignment: alignment,
            ..Default::default()
        };
        state.allocate();
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn monitor(&self) -> HeadlessWindowMonitor {
        HeadlessWindowMonitor { state: self.state.clone() }
    }

    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap()
    }
}

// SAFETY: Buffers are only reallocated in `set_buffers_geometry`, and the shared state (and with
// it the buffers) outlives the window.
unsafe impl NativeWindow for HeadlessWindow {
    fn set_buffers_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: i32,
    ) -> Result<(), NativeStatus> {
        let mut state = self.state();
        if let Some(status) = state.geometry_failure {
            return Err(status);
        }
        if width == 0 || height == 0 || state.locked {
            return Err(BAD_VALUE);
        }
        state.geometry_calls += 1;
        state.width = width;
        state.height = height;
        state.format = format;
        state.allocate();
        debug!("headless window geometry set to {width}x{height}, format {format}");
        Ok(())
    }

    fn lock(&mut self) -> Result<NativeBuffer, NativeStatus> {
        let mut state = self.state();
        if let Some(status) = state.lock_failure {
            return Err(status);
        }
        if state.locked {
            return Err(INVALID_OPERATION);
        }
        state.locked = true;
        Ok(state.descriptor())
    }

    fn unlock_and_post(&mut self) -> Result<(), NativeStatus> {
        let mut state = self.state();
        if !state.locked {
            return Err(INVALID_OPERATION);
        }
        state.locked = false;

        let row_len = state.width as usize * BYTES_PER_PIXEL;
        let stride_len = state.stride as usize * BYTES_PER_PIXEL;
        let pixels = if stride_len == 0 {
            Vec::new()
        } else {
            state.buffers[state.back]
                .chunks(stride_len)
                .flat_map(|row| &row[..row_len])
                .copied()
                .collect()
        };
        state.last_posted = Some(Frame { width: state.width, height: state.height, pixels });
        state.posted_frames += 1;
        state.back ^= 1;
        Ok(())
    }
}

impl HeadlessWindowMonitor {
    /// Number of successful `set_buffers_geometry` calls.
    pub fn geometry_calls(&self) -> usize {
        self.state.lock().unwrap().geometry_calls
    }

    /// (width, height, format) of the buffers.
    pub fn geometry(&self) -> (u32, u32, i32) {
        let state = self.state.lock().unwrap();
        (state.width, state.height, state.format)
    }

    /// Row stride in pixels.
    pub fn stride(&self) -> u32 {
        self.state.lock().unwrap().stride
    }

    pub fn posted_frames(&self) -> usize {
        self.state.lock().unwrap().posted_frames
    }

    pub fn last_posted(&self) -> Option<Frame> {
        self.state.lock().unwrap().last_posted.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Makes every following lock fail with `status`, or succeed again with `None`.
    pub fn set_lock_failure(&self, status: Option<NativeStatus>) {
        self.state.lock().unwrap().lock_failure = status;
    }

    /// Makes every following geometry change fail with `status`, or succeed again with `None`.
    pub fn set_geometry_failure(&self, status: Option<NativeStatus>) {
        self.state.lock().unwrap().geometry_failure = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn posts_locked_buffer_without_padding() -> Result<()> {
        let mut window = HeadlessWindow::with_stride_alignment(3, 2, 4);
        let monitor = window.monitor();
        assert_eq!(monitor.stride(), 4);

        let buffer = window.lock().unwrap();
        assert_eq!((buffer.width, buffer.height, buffer.stride), (3, 2, 4));
        for y in 0..2 {
            // SAFETY: the buffer is locked and stays valid while the window is alive.
            unsafe { buffer.row_mut(y).fill(y as u8 + 1) };
        }
        window.unlock_and_post().unwrap();

        let frame = monitor.last_posted().unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(&frame.pixels[..12], &[1; 12]);
        assert_eq!(&frame.pixels[12..], &[2; 12]);
        assert_eq!(monitor.posted_frames(), 1);
        Ok(())
    }

    #[test]
    fn double_lock_is_rejected() {
        let mut window = HeadlessWindow::new(1, 1);
        assert!(window.lock().is_ok());
        assert_eq!(window.lock().unwrap_err(), INVALID_OPERATION);
        assert!(window.unlock_and_post().is_ok());
        assert_eq!(window.unlock_and_post().unwrap_err(), INVALID_OPERATION);
    }

    #[test]
    fn geometry_reallocates() {
        let mut window = HeadlessWindow::new(1, 1);
        let monitor = window.monitor();
        window.set_buffers_geometry(8, 4, PIXEL_FORMAT_BGRA_8888).unwrap();
        assert_eq!(monitor.geometry(), (8, 4, PIXEL_FORMAT_BGRA_8888));
        assert_eq!(monitor.geometry_calls(), 1);
        assert_eq!(window.set_buffers_geometry(0, 4, PIXEL_FORMAT_BGRA_8888), Err(BAD_VALUE));
    }
}
