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

//! Stream of absolute cursor positions from crosvm to the UI process.
//!
//! Each message is 8 bytes: `x` then `y`, both little-endian `u32`. There is no other framing.

use log::{debug, error, info};
use nix::sys::socket::{send, MsgFlags};
use std::io::{self, ErrorKind, Read};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Size of one cursor message.
pub const CURSOR_MESSAGE_SIZE: usize = 8;

/// Errors from sending a cursor position
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CursorError {
    /// `setCursorStream` was never called
    #[error("Invalid fd")]
    NoStream,

    #[error("failed to write cursor position: {0}")]
    Io(#[from] nix::errno::Errno),

    #[error("short write of cursor position: {0} of 8 bytes")]
    ShortWrite(usize),
}

pub fn encode_position(x: u32, y: u32) -> [u8; CURSOR_MESSAGE_SIZE] {
    let mut message = [0u8; CURSOR_MESSAGE_SIZE];
    message[..4].copy_from_slice(&x.to_le_bytes());
    message[4..].copy_from_slice(&y.to_le_bytes());
    message
}

pub fn decode_position(message: &[u8; CURSOR_MESSAGE_SIZE]) -> (u32, u32) {
    let [x0, x1, x2, x3, y0, y1, y2, y3] = *message;
    (u32::from_le_bytes([x0, x1, x2, x3]), u32::from_le_bytes([y0, y1, y2, y3]))
}

/// Writes one cursor message to the socket `fd`. A closed peer is reported as `EPIPE` rather
/// than raising `SIGPIPE`.
pub fn write_position<Fd: AsFd>(fd: Fd, x: u32, y: u32) -> Result<(), CursorError> {
    let message = encode_position(x, y);
    match send(fd.as_fd().as_raw_fd(), &message, MsgFlags::MSG_NOSIGNAL)? {
        CURSOR_MESSAGE_SIZE => Ok(()),
        n => Err(CursorError::ShortWrite(n)),
    }
}

/// The cursor surface as seen from the UI process.
pub trait CursorOverlay: Send {
    /// Makes the cursor surface a child of the main surface, so positions are relative to it.
    fn reparent_under_main(&mut self);

    /// Moves the cursor surface.
    fn set_position(&mut self, x: f32, y: f32);
}

/// Reads cursor positions on a dedicated thread and applies them to a [`CursorOverlay`].
pub struct CursorChannel {
    stream: UnixStream,
    interrupted: Arc<AtomicBool>,
    handler: Option<JoinHandle<()>>,
}

impl CursorChannel {
    /// Creates the stream and starts the reader thread. Returns the channel and the end of the
    /// stream to hand to crosvm.
    pub fn start(mut overlay: Box<dyn CursorOverlay>) -> io::Result<(Self, OwnedFd)> {
        let (reader, writer) = UnixStream::pair()?;
        let stream = reader.try_clone()?;
        let interrupted = Arc::new(AtomicBool::new(false));

        overlay.reparent_under_main();

        let handler = {
            let interrupted = interrupted.clone();
            thread::Builder::new()
                .name("cursor_handler".to_owned())
                .spawn(move || handle_cursor_stream(reader, &interrupted, overlay.as_mut()))?
        };
        Ok((Self { stream, interrupted, handler: Some(handler) }, writer.into()))
    }

    /// Whether the reader thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handler.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stops the reader thread and waits for it to exit.
    pub fn stop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        self.interrupted.store(true, Ordering::Release);
        // Unblocks the pending read, if any.
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Failed to shut down cursor stream: {e}");
        }
        if handler.join().is_err() {
            error!("Cursor handler thread panicked");
        }
    }
}

impl Drop for CursorChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_cursor_stream(
    mut stream: UnixStream,
    interrupted: &AtomicBool,
    overlay: &mut dyn CursorOverlay,
) {
    let mut message = [0u8; CURSOR_MESSAGE_SIZE];
    loop {
        if interrupted.load(Ordering::Acquire) {
            debug!("Cursor handler interrupted");
            return;
        }
        match stream.read_exact(&mut message) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("Cursor stream closed, stopping the handler");
                return;
            }
            Err(e) => {
                error!("Cannot read from cursor stream, stopping the handler: {e}");
                return;
            }
        }
        let (x, y) = decode_position(&message);
        overlay.set_position(x as f32, y as f32);
    }
}
