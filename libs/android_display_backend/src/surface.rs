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

//! A slot holding the latest native surface handed over by the UI process, if any.
//!
//! A surface may not always be available if, for example, the app on the other end of the
//! display service is not in the foreground. crosvm keeps rendering regardless: while no surface
//! is attached it draws into a sink buffer whose content is never displayed.

use crate::buffer::{
    copy_buffer, BufferConfigError, CopyError, NativeBuffer, PixelBuffer, PIXEL_FORMAT_BGRA_8888,
};
use crate::window::{NativeStatus, NativeWindow};
use log::{debug, error};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Size of the surface requested by the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Errors from locking the next buffer of a slot
#[derive(Debug, PartialEq, Eq, Error)]
pub enum LockError {
    /// A surface is attached but the VM never told us its size
    #[error("Surface dimension is not configured yet!")]
    NotConfigured,

    /// The window rejected the buffer geometry or failed to lock a buffer
    #[error("Failed to lock window: status {0}")]
    NativeFailure(NativeStatus),
}

/// Errors from presenting a locked buffer
#[derive(Debug, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("Failed to unlock and post window: status {0}")]
    NativeFailure(NativeStatus),
}

/// Errors from drawing the saved frame onto the attached surface
#[derive(Debug, PartialEq, Eq, Error)]
pub enum DrawError {
    #[error("Surface not ready")]
    NoSurface,

    #[error("Surface dimension is not configured yet!")]
    NotConfigured,

    #[error("Failed to lock window: status {0}")]
    Lock(NativeStatus),

    #[error("Failed to copy frame: {0}")]
    Copy(#[from] CopyError),

    #[error("Failed to unlock and post window: status {0}")]
    Post(NativeStatus),
}

impl From<LockError> for DrawError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::NotConfigured => DrawError::NotConfigured,
            LockError::NativeFailure(status) => DrawError::Lock(status),
        }
    }
}

struct SlotState {
    native_surface: Option<Box<dyn NativeWindow>>,
    requested_dimensions: Option<Dimensions>,
    needs_reconfiguring: bool,

    // Buffer which crosvm uses when in background. The content drawn here is never displayed on
    // the physical screen.
    sink_buffer: PixelBuffer,

    // Buffer which was last locked on the native surface for crosvm to draw onto. Points into
    // memory owned by `native_surface`, so it is forgotten whenever that surface goes away or
    // reallocates its buffers.
    last_buffer: Option<NativeBuffer>,

    // Copy of `last_buffer` holding the last good (i.e. non-blank) frame before the VM goes
    // background. It is drawn when the VM comes back to foreground, until the VM starts to emit
    // actual frames.
    saved_frame_buffer: PixelBuffer,
}

/// Pushes the requested geometry onto `surface` if it hasn't been done since the surface was
/// attached or the dimensions changed. Returns whether the geometry changed.
fn configure_native_surface(
    surface: &mut dyn NativeWindow,
    requested_dimensions: Option<Dimensions>,
    needs_reconfiguring: &mut bool,
) -> Result<bool, LockError> {
    if !*needs_reconfiguring {
        return Ok(false);
    }
    let dims = requested_dimensions.ok_or(LockError::NotConfigured)?;

    // Ensure locked buffers have our desired format.
    surface.set_buffers_geometry(dims.width, dims.height, PIXEL_FORMAT_BGRA_8888).map_err(
        |status| {
            error!("Failed to set buffer geometry {}x{}: status {status}", dims.width, dims.height);
            LockError::NativeFailure(status)
        },
    )?;

    *needs_reconfiguring = false;
    Ok(true)
}

/// One of the two surfaces (scanout or cursor) of a VM display.
pub struct SurfaceSlot {
    name: String,
    state: Mutex<SlotState>,
    surface_ready: Condvar,
}

impl SurfaceSlot {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(SlotState {
                native_surface: None,
                requested_dimensions: None,
                needs_reconfiguring: true,
                sink_buffer: PixelBuffer::default(),
                last_buffer: None,
                saved_frame_buffer: PixelBuffer::default(),
            }),
            surface_ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap()
    }

    /// Takes ownership of `surface`, replacing the current one, and wakes up waiters.
    pub fn set_native_surface(&self, surface: Box<dyn NativeWindow>) {
        {
            let mut state = self.state();
            state.native_surface = Some(surface);
            state.last_buffer = None;
            state.needs_reconfiguring = true;
        }
        debug!("Surface attached to {}", self.name);
        self.surface_ready.notify_all();
    }

    /// Drops the current surface. Dimensions and the saved frame are kept.
    pub fn remove_surface(&self) {
        {
            let mut state = self.state();
            state.native_surface = None;
            state.last_buffer = None;
        }
        debug!("Surface removed from {}", self.name);
        self.surface_ready.notify_all();
    }

    pub fn is_surface_attached(&self) -> bool {
        self.state().native_surface.is_some()
    }

    /// Dimensions set by the last successful [`SurfaceSlot::configure`].
    pub fn dimensions(&self) -> Option<Dimensions> {
        self.state().requested_dimensions
    }

    /// Sets the size the VM renders at and resizes the sink and saved frame buffers to match.
    ///
    /// Both buffers are allocated before anything is changed, so on error the slot keeps its
    /// previous size. Configuring the current size again is a no-op.
    pub fn configure(&self, width: u32, height: u32) -> Result<(), BufferConfigError> {
        let mut state = self.state();
        let dims = Dimensions { width, height };
        if state.requested_dimensions == Some(dims) {
            return Ok(());
        }

        let sink_buffer = PixelBuffer::with_geometry(width, height, PIXEL_FORMAT_BGRA_8888)?;
        let saved_frame_buffer = PixelBuffer::with_geometry(width, height, PIXEL_FORMAT_BGRA_8888)?;

        state.sink_buffer = sink_buffer;
        state.saved_frame_buffer = saved_frame_buffer;
        state.requested_dimensions = Some(dims);
        state.needs_reconfiguring = true;
        debug!("{} configured to {width}x{height}", self.name);
        Ok(())
    }

    /// Blocks until a surface is attached. This can block forever.
    pub fn wait_for_native_surface(&self) {
        let _state =
            self.surface_ready.wait_while(self.state(), |s| s.native_surface.is_none()).unwrap();
    }

    /// Like [`SurfaceSlot::wait_for_native_surface`], but gives up after `timeout`. Returns
    /// whether a surface is attached.
    pub fn wait_for_native_surface_timeout(&self, timeout: Duration) -> bool {
        let (state, _) = self
            .surface_ready
            .wait_timeout_while(self.state(), timeout, |s| s.native_surface.is_none())
            .unwrap();
        state.native_surface.is_some()
    }

    /// Returns the buffer to render the next frame into.
    ///
    /// Without a surface this is the sink buffer and never fails.
    pub fn lock(&self) -> Result<NativeBuffer, LockError> {
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(surface) = state.native_surface.as_deref_mut() else {
            // Surface not currently available but not necessarily an error if, for example, the
            // app is not in the foreground.
            return Ok(state.sink_buffer.as_native_buffer());
        };

        if configure_native_surface(
            surface,
            state.requested_dimensions,
            &mut state.needs_reconfiguring,
        )? {
            state.last_buffer = None;
        }

        let buffer = surface.lock().map_err(LockError::NativeFailure)?;
        state.last_buffer = Some(buffer);
        Ok(buffer)
    }

    /// Presents the buffer returned by the last [`SurfaceSlot::lock`]. No-op without a surface.
    pub fn unlock_and_post(&self) -> Result<(), PostError> {
        let mut state = self.state();
        let Some(surface) = state.native_surface.as_deref_mut() else {
            return Ok(());
        };
        surface.unlock_and_post().map_err(PostError::NativeFailure)
    }

    /// Saves the last frame drawn on the surface.
    pub fn save_frame(&self) -> Result<(), CopyError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let last_buffer = state.last_buffer.ok_or(CopyError::NoFrame)?;
        let saved = state.saved_frame_buffer.as_native_buffer();

        // SAFETY: `last_buffer` is only set while the surface owning its memory is attached and
        // keeps its geometry, and `saved` is owned by this slot. Both are protected by the lock.
        unsafe { copy_buffer(&last_buffer, &saved) }
    }

    /// Draws the saved frame onto the attached surface.
    pub fn draw_saved_frame(&self) -> Result<(), DrawError> {
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(surface) = state.native_surface.as_deref_mut() else {
            return Err(DrawError::NoSurface);
        };
        if state.requested_dimensions.is_none() {
            return Err(DrawError::NotConfigured);
        }
        if configure_native_surface(
            surface,
            state.requested_dimensions,
            &mut state.needs_reconfiguring,
        )? {
            state.last_buffer = None;
        }

        let buffer = surface.lock().map_err(DrawError::Lock)?;
        let saved = state.saved_frame_buffer.as_native_buffer();
        // SAFETY: `buffer` was just locked on the attached surface and `saved` is owned by this
        // slot.
        let copied = unsafe { copy_buffer(&saved, &buffer) };

        // The buffer has to be queued back even when nothing could be copied into it.
        surface.unlock_and_post().map_err(DrawError::Post)?;
        Ok(copied?)
    }

    /// Copy of the saved frame, tightly packed.
    pub fn saved_frame(&self) -> Vec<u8> {
        self.state().saved_frame_buffer.pixels().to_vec()
    }
}
