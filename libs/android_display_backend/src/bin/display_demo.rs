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

//! Runs the display path of a VM on headless windows.
//!
//! Plays both sides in one process: crosvm rendering frames and moving the cursor, and the UI
//! process attaching its surfaces, going to the background and coming back.

use android_display_backend::broker::{self, LocalBroker, VIRTUALIZATION_SERVICE_NAME};
use android_display_backend::buffer::NativeBuffer;
use android_display_backend::context::{ContextState, DisplayContext};
use android_display_backend::cursor::CursorOverlay;
use android_display_backend::provider::{DisplayProvider, SurfaceKind};
use android_display_backend::window::HeadlessWindow;
use anyhow::{anyhow, ensure, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

const LOG_TAG: &str = "display_demo";

#[derive(Parser, Clone, Copy)]
/// Runs the VM display path end to end without a compositor
struct Args {
    /// Width of the VM display in pixels
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Height of the VM display in pixels
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Number of frames to render
    #[arg(long, default_value_t = 90)]
    frames: u32,

    /// Width and height of the cursor surface in pixels
    #[arg(long, default_value_t = 32)]
    cursor_size: u32,

    /// Row alignment of the window buffers in pixels
    #[arg(long, default_value_t = 64)]
    stride_alignment: u32,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

struct LoggingCursor;

impl CursorOverlay for LoggingCursor {
    fn reparent_under_main(&mut self) {
        debug!("cursor surface reparented under the main surface");
    }

    fn set_position(&mut self, x: f32, y: f32) {
        debug!("cursor moved to ({x}, {y})");
    }
}

fn frame_pixel(frame: u32) -> [u8; 4] {
    [frame.wrapping_mul(3) as u8, frame.wrapping_mul(5) as u8, frame.wrapping_mul(7) as u8, 0xff]
}

fn fill(buffer: &NativeBuffer, pixel: [u8; 4]) {
    for y in 0..buffer.height.max(0) as usize {
        // SAFETY: the buffer was just locked for this thread and is not referenced elsewhere.
        let row = unsafe { buffer.row_mut(y) };
        for dst in row.chunks_exact_mut(4) {
            dst.copy_from_slice(&pixel);
        }
    }
}

/// crosvm's side: renders `args.frames` frames, reporting each one on `progress` and waiting for
/// the UI to acknowledge it.
fn run_vm(args: Args, progress: SyncSender<u32>, ack: Receiver<()>) -> Result<()> {
    let context = DisplayContext::new(
        || Ok(broker::wait_for_service(VIRTUALIZATION_SERVICE_NAME)),
        Box::new(|message: &str| error!("display backend: {message}")),
    );
    ensure!(context.state() == ContextState::Active, "Display service is not registered");

    let scanout = context.create_surface(args.width, args.height, false)?;
    let cursor = context.create_surface(args.cursor_size, args.cursor_size, true)?;
    fill(&context.lock_buffer(cursor)?, [0xff; 4]);
    context.post_buffer(cursor)?;

    for frame in 0..args.frames {
        // A failed frame doesn't stop rendering.
        match context.lock_buffer(scanout) {
            Ok(buffer) => {
                fill(&buffer, frame_pixel(frame));
                if let Err(e) = context.post_buffer(scanout) {
                    warn!("Frame {frame} dropped: {e}");
                }
            }
            Err(e) => warn!("Frame {frame} dropped: {e}"),
        }
        let x = frame.wrapping_mul(7) % args.width.max(1);
        let y = frame.wrapping_mul(5) % args.height.max(1);
        if let Err(e) = context.set_surface_position(x, y) {
            warn!("Cursor not moved: {e}");
        }

        if progress.send(frame).is_err() || ack.recv().is_err() {
            break;
        }
    }
    info!("Rendered {} frames", args.frames);
    Ok(())
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    android_logger::init_once(
        android_logger::Config::default().with_tag(LOG_TAG).with_max_level(log_level),
    );
    ensure!(args.frames >= 3, "At least 3 frames are needed, got {}", args.frames);

    let virt_service = Arc::new(LocalBroker::new());
    broker::add_service(VIRTUALIZATION_SERVICE_NAME, virt_service.clone());

    let mut provider = DisplayProvider::new(
        virt_service,
        Box::new(|| Box::new(LoggingCursor) as Box<dyn CursorOverlay>),
    )?;

    let (progress_tx, progress_rx) = mpsc::sync_channel(0);
    let (ack_tx, ack_rx) = mpsc::channel();
    let crosvm = thread::Builder::new()
        .name("crosvm".to_owned())
        .spawn(move || run_vm(args, progress_tx, ack_rx))
        .context("Failed to spawn crosvm thread")?;

    let new_window = || HeadlessWindow::with_stride_alignment(1, 1, args.stride_alignment);
    provider.surface_created(SurfaceKind::Main, Box::new(new_window()))?;
    provider.surface_created(SurfaceKind::Cursor, Box::new(new_window()))?;

    let background_at = args.frames / 3;
    let foreground_at = args.frames * 2 / 3;
    let mut restored = None;
    for frame in progress_rx {
        if frame == background_at {
            info!("Going to the background after frame {frame}");
            provider.notify_display_is_going_to_invisible()?;
            provider.surface_destroyed(SurfaceKind::Main)?;
        } else if frame == foreground_at {
            info!("Coming back to the foreground after frame {frame}");
            let window = new_window();
            let monitor = window.monitor();
            provider.surface_created(SurfaceKind::Main, Box::new(window))?;

            let shown = monitor.last_posted().context("Saved frame was not drawn")?;
            let expected = frame_pixel(background_at);
            ensure!(
                shown.pixels.chunks_exact(4).all(|p| p == expected),
                "Saved frame doesn't match frame {background_at}"
            );
            info!("Frame {background_at} was redrawn before crosvm rendered again");
            restored = Some(monitor);
        }
        ack_tx.send(()).context("crosvm exited early")?;
    }

    crosvm.join().map_err(|_| anyhow!("crosvm thread panicked"))??;

    if let Some(monitor) = restored {
        info!("{} frames posted after coming back to the foreground", monitor.posted_frames());
    }
    Ok(())
}

fn main() {
    if let Err(e) = try_main() {
        error!("{:?}", e);
        eprintln!("{:?}", e);
        std::process::exit(1)
    }
}
