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

//! Presents UI-side surfaces which the VM can use as a display.

use crate::broker::VirtualizationBroker;
use crate::cursor::{CursorChannel, CursorOverlay};
use crate::service::CrosvmAndroidDisplayService;
use crate::window::NativeWindow;
use anyhow::{Context, Result};
use log::{debug, error};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Main,
    Cursor,
}

impl SurfaceKind {
    fn is_for_cursor(self) -> bool {
        self == SurfaceKind::Cursor
    }
}

/// Creates the cursor overlay for a new cursor stream.
pub type CursorOverlayFactory = Box<dyn FnMut() -> Box<dyn CursorOverlay> + Send>;

pub struct DisplayProvider {
    broker: Arc<dyn VirtualizationBroker>,
    cursor_overlay: CursorOverlayFactory,
    cursor_channel: Option<CursorChannel>,
}

impl DisplayProvider {
    /// Removes any display service left registered by a previous VM, so that only the one of the
    /// VM about to start is picked up.
    pub fn new(
        broker: Arc<dyn VirtualizationBroker>,
        cursor_overlay: CursorOverlayFactory,
    ) -> Result<Self> {
        broker.clear_display_service().context("Failed to clear prior display service")?;
        Ok(Self { broker, cursor_overlay, cursor_channel: None })
    }

    fn display_service(&self) -> Result<Arc<dyn CrosvmAndroidDisplayService>> {
        self.broker.wait_display_service().context("Error while getting display service")
    }

    /// Hands a newly created surface to the VM.
    ///
    /// The main surface gets the saved frame drawn right away; the cursor surface gets a new
    /// cursor stream. Failures of those follow-up steps are logged only, as the surface itself is
    /// in place.
    pub fn surface_created(
        &mut self,
        kind: SurfaceKind,
        surface: Box<dyn NativeWindow>,
    ) -> Result<()> {
        let service = self.display_service()?;
        service
            .set_surface(surface, kind.is_for_cursor())
            .with_context(|| format!("Failed to present surface {kind:?} to VM"))?;

        let configured = match kind {
            SurfaceKind::Main => service
                .draw_saved_frame_for_surface(kind.is_for_cursor())
                .context("Failed to draw saved frame"),
            SurfaceKind::Cursor => self.create_new_cursor_stream().and_then(|stream| {
                service.set_cursor_stream(stream.as_fd()).context("Failed to set cursor stream")
            }),
        };
        if let Err(e) = configured {
            error!("Failed to configure surface {kind:?}: {e:?}");
        }
        Ok(())
    }

    pub fn surface_destroyed(&mut self, kind: SurfaceKind) -> Result<()> {
        debug!("Removing surface {kind:?}");
        self.display_service()?
            .remove_surface(kind.is_for_cursor())
            .with_context(|| format!("Error while destroying surface for {kind:?}"))
    }

    /// Saves the frame of the main surface before the display goes to the background, so that it
    /// can be redrawn as soon as the display is visible again, before the VM draws anything.
    pub fn notify_display_is_going_to_invisible(&self) -> Result<()> {
        self.display_service()?
            .save_frame_for_surface(false)
            .context("Failed to save frame for the main surface")
    }

    fn create_new_cursor_stream(&mut self) -> Result<OwnedFd> {
        if let Some(mut previous) = self.cursor_channel.take() {
            previous.stop();
        }
        let (channel, stream) = CursorChannel::start((self.cursor_overlay)())
            .context("Failed to create socketpair for cursor stream")?;
        self.cursor_channel = Some(channel);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::service::DisplayService;
    use crate::window::HeadlessWindow;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Overlay {
        id: usize,
        events: Sender<(usize, f32, f32)>,
    }

    impl CursorOverlay for Overlay {
        fn reparent_under_main(&mut self) {}

        fn set_position(&mut self, x: f32, y: f32) {
            self.events.send((self.id, x, y)).unwrap();
        }
    }

    fn overlay_factory() -> (CursorOverlayFactory, Receiver<(usize, f32, f32)>) {
        let (tx, rx) = mpsc::channel();
        let mut next_id = 0;
        let factory: CursorOverlayFactory = Box::new(move || {
            next_id += 1;
            Box::new(Overlay { id: next_id, events: tx.clone() }) as Box<dyn CursorOverlay>
        });
        (factory, rx)
    }

    type Setup =
        (Arc<LocalBroker>, Arc<DisplayService>, DisplayProvider, Receiver<(usize, f32, f32)>);

    fn setup() -> Result<Setup> {
        let broker = Arc::new(LocalBroker::new());
        // Left over from a previous VM.
        broker.set_display_service(Arc::new(DisplayService::new()))?;

        let (factory, rx) = overlay_factory();
        let provider = DisplayProvider::new(broker.clone(), factory)?;
        assert!(!broker.has_display_service());

        let service = Arc::new(DisplayService::new());
        broker.set_display_service(service.clone())?;
        Ok((broker, service, provider, rx))
    }

    #[test]
    fn background_and_foreground_redraws_saved_frame() -> Result<()> {
        let (_broker, service, mut provider, _rx) = setup()?;
        let scanout = service.surface(false);
        scanout.configure(2, 2)?;

        provider.surface_created(SurfaceKind::Main, Box::new(HeadlessWindow::new(2, 2)))?;
        let buffer = scanout.lock()?;
        for y in 0..2 {
            // SAFETY: the buffer was just locked and nothing else references it.
            unsafe { buffer.row_mut(y).fill(0x7f) };
        }
        scanout.unlock_and_post()?;

        provider.notify_display_is_going_to_invisible()?;
        provider.surface_destroyed(SurfaceKind::Main)?;
        assert!(!scanout.is_surface_attached());

        let window = HeadlessWindow::new(2, 2);
        let monitor = window.monitor();
        provider.surface_created(SurfaceKind::Main, Box::new(window))?;
        assert_eq!(monitor.last_posted().unwrap().pixels, vec![0x7f; 16]);
        Ok(())
    }

    #[test]
    fn draw_failure_does_not_fail_attach() -> Result<()> {
        let (_broker, service, mut provider, _rx) = setup()?;
        // Not configured yet, so nothing can be drawn.
        provider.surface_created(SurfaceKind::Main, Box::new(HeadlessWindow::new(2, 2)))?;
        assert!(service.surface(false).is_surface_attached());
        Ok(())
    }

    #[test]
    fn new_cursor_surface_replaces_cursor_stream() -> Result<()> {
        let (_broker, service, mut provider, rx) = setup()?;

        provider.surface_created(SurfaceKind::Cursor, Box::new(HeadlessWindow::new(4, 4)))?;
        assert!(service.surface(true).is_surface_attached());
        service.write_cursor_position(100, 200)?;
        assert_eq!(rx.recv_timeout(TIMEOUT)?, (1, 100.0, 200.0));

        provider.surface_destroyed(SurfaceKind::Cursor)?;
        provider.surface_created(SurfaceKind::Cursor, Box::new(HeadlessWindow::new(4, 4)))?;
        service.write_cursor_position(5, 6)?;
        assert_eq!(rx.recv_timeout(TIMEOUT)?, (2, 5.0, 6.0));
        assert_eq!(rx.recv_timeout(Duration::from_millis(50)), Err(RecvTimeoutError::Timeout));
        Ok(())
    }
}
