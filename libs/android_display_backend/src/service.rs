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

//! Implementation of the display service which the UI process calls to hand its surfaces to
//! crosvm.

use crate::buffer::BufferConfigError;
use crate::cursor::{write_position, CursorError};
use crate::surface::SurfaceSlot;
use crate::window::NativeWindow;
use log::{debug, error};
use std::fmt::Display;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Mutex;
use thiserror::Error;

/// Result of a failed remote call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Status(service-specific error {code}, '{message}')")]
pub struct Status {
    code: i32,
    message: String,
}

impl Status {
    pub fn new_service_specific_error_str<T: AsRef<str>>(code: i32, message: Option<T>) -> Self {
        Self { code, message: message.map(|m| m.as_ref().to_owned()).unwrap_or_default() }
    }

    pub fn service_specific_error(&self) -> i32 {
        self.code
    }

    pub fn get_description(&self) -> &str {
        &self.message
    }
}

/// The interface crosvm exposes to the UI process.
pub trait CrosvmAndroidDisplayService: Send + Sync {
    /// Hands `surface` over to crosvm.
    fn set_surface(&self, surface: Box<dyn NativeWindow>, for_cursor: bool) -> Result<(), Status>;

    fn remove_surface(&self, for_cursor: bool) -> Result<(), Status>;

    /// Saves the last frame drawn, to be redrawn with `draw_saved_frame_for_surface`.
    fn save_frame_for_surface(&self, for_cursor: bool) -> Result<(), Status>;

    fn draw_saved_frame_for_surface(&self, for_cursor: bool) -> Result<(), Status>;

    /// Sets the stream cursor positions are written to. The service keeps its own duplicate.
    fn set_cursor_stream(&self, stream: BorrowedFd<'_>) -> Result<(), Status>;
}

fn service_error(what: &str, e: impl Display) -> Status {
    let msg = format!("{what}: {e}");
    error!("{msg}");
    Status::new_service_specific_error_str(-1, Some(msg))
}

/// Display service of one VM, with a scanout and a cursor surface.
pub struct DisplayService {
    scanout: SurfaceSlot,
    cursor: SurfaceSlot,
    cursor_stream: Mutex<Option<OwnedFd>>,
}

impl Default for DisplayService {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayService {
    pub fn new() -> Self {
        Self {
            scanout: SurfaceSlot::new("scanout"),
            cursor: SurfaceSlot::new("cursor"),
            cursor_stream: Mutex::new(None),
        }
    }

    pub fn surface(&self, for_cursor: bool) -> &SurfaceSlot {
        if for_cursor {
            &self.cursor
        } else {
            &self.scanout
        }
    }

    /// Sets the size crosvm renders the given surface at.
    pub fn configure(
        &self,
        width: u32,
        height: u32,
        for_cursor: bool,
    ) -> Result<(), BufferConfigError> {
        self.surface(for_cursor).configure(width, height)
    }

    pub fn has_cursor_stream(&self) -> bool {
        self.cursor_stream.lock().unwrap().is_some()
    }

    /// Sends a cursor position to the UI process.
    pub fn write_cursor_position(&self, x: u32, y: u32) -> Result<(), CursorError> {
        let stream = self.cursor_stream.lock().unwrap();
        let fd = stream.as_ref().ok_or(CursorError::NoStream)?;
        write_position(fd, x, y)
    }
}

impl CrosvmAndroidDisplayService for DisplayService {
    fn set_surface(&self, surface: Box<dyn NativeWindow>, for_cursor: bool) -> Result<(), Status> {
        self.surface(for_cursor).set_native_surface(surface);
        Ok(())
    }

    fn remove_surface(&self, for_cursor: bool) -> Result<(), Status> {
        self.surface(for_cursor).remove_surface();
        Ok(())
    }

    fn save_frame_for_surface(&self, for_cursor: bool) -> Result<(), Status> {
        self.surface(for_cursor).save_frame().map_err(|e| service_error("Failed to save frame", e))
    }

    fn draw_saved_frame_for_surface(&self, for_cursor: bool) -> Result<(), Status> {
        self.surface(for_cursor)
            .draw_saved_frame()
            .map_err(|e| service_error("Failed to draw saved frame", e))
    }

    fn set_cursor_stream(&self, stream: BorrowedFd<'_>) -> Result<(), Status> {
        let stream = stream
            .try_clone_to_owned()
            .map_err(|e| service_error("Failed to duplicate cursor stream", e))?;
        debug!("Cursor stream replaced");
        // The previous stream, if any, is closed here.
        *self.cursor_stream.lock().unwrap() = Some(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{decode_position, CURSOR_MESSAGE_SIZE};
    use crate::window::HeadlessWindow;
    use anyhow::Result;
    use std::io::Read;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn routes_by_selector() -> Result<()> {
        let service = DisplayService::new();
        service.configure(4, 4, false)?;
        service.configure(2, 2, true)?;
        assert_eq!(service.surface(false).name(), "scanout");
        assert_eq!(service.surface(true).name(), "cursor");

        service.set_surface(Box::new(HeadlessWindow::new(2, 2)), true)?;
        assert!(service.surface(true).is_surface_attached());
        assert!(!service.surface(false).is_surface_attached());

        service.remove_surface(true)?;
        assert!(!service.surface(true).is_surface_attached());
        Ok(())
    }

    #[test]
    fn slot_errors_become_status() -> Result<()> {
        let service = DisplayService::new();
        let status = service.draw_saved_frame_for_surface(false).unwrap_err();
        assert_eq!(status.service_specific_error(), -1);
        assert_eq!(status.get_description(), "Failed to draw saved frame: Surface not ready");

        service.configure(4, 4, false)?;
        let status = service.save_frame_for_surface(false).unwrap_err();
        assert!(status.get_description().starts_with("Failed to save frame: "));
        Ok(())
    }

    #[test]
    fn cursor_stream_is_duplicated() -> Result<()> {
        let service = DisplayService::new();
        assert_eq!(service.write_cursor_position(1, 1), Err(CursorError::NoStream));

        let (mut ui_end, vm_end) = UnixStream::pair()?;
        service.set_cursor_stream(vm_end.as_fd())?;
        drop(vm_end);
        assert!(service.has_cursor_stream());

        service.write_cursor_position(100, 200)?;
        let mut message = [0u8; CURSOR_MESSAGE_SIZE];
        ui_end.read_exact(&mut message)?;
        assert_eq!(decode_position(&message), (100, 200));
        Ok(())
    }

    #[test]
    fn replacing_cursor_stream_closes_previous() -> Result<()> {
        let service = DisplayService::new();
        let (mut first_ui, first_vm) = UnixStream::pair()?;
        service.set_cursor_stream(first_vm.as_fd())?;
        drop(first_vm);

        let (mut second_ui, second_vm) = UnixStream::pair()?;
        service.set_cursor_stream(second_vm.as_fd())?;
        drop(second_vm);

        // All writers of the first stream are gone.
        let mut buf = Vec::new();
        assert_eq!(first_ui.read_to_end(&mut buf)?, 0);

        service.write_cursor_position(3, 4)?;
        let mut message = [0u8; CURSOR_MESSAGE_SIZE];
        second_ui.read_exact(&mut message)?;
        assert_eq!(decode_position(&message), (3, 4));
        Ok(())
    }
}
