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

//! Display context of the crosvm process.
//!
//! Creates the display service and registers it to the virtualization service for as long as the
//! context lives. Errors are reported through a callback rather than returned, because the
//! context is driven from crosvm through a C interface.

use crate::broker::{BrokerError, VirtualizationBroker};
use crate::buffer::NativeBuffer;
use crate::cursor::CursorError;
use crate::service::DisplayService;
use crate::surface::{LockError, PostError, SurfaceSlot};
use log::{error, info};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// Receives error messages of the display context.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Errors of operations on a [`DisplayContext`]
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Registration to the virtualization service didn't succeed
    #[error("Display service was not created")]
    NotActive,

    #[error("Failed to lock surface {name}: {source}")]
    Lock { name: String, source: LockError },

    #[error("Failed to unlock and post for surface {name}: {source}")]
    Post { name: String, source: PostError },

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Lifecycle of the display service registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Not registered yet. Only seen while the context is being constructed.
    Uninitialized,
    Registering,
    Active,
    /// Registration didn't succeed. Terminal.
    Failed,
    Cleared,
}

pub struct DisplayContext {
    broker: Option<Arc<dyn VirtualizationBroker>>,
    service: Arc<DisplayService>,
    state: ContextState,
    error_callback: ErrorCallback,
}

impl DisplayContext {
    /// Creates the display service and registers it through the broker returned by
    /// `locate_broker`, which may block until the broker is available.
    ///
    /// This doesn't fail. If the registration doesn't succeed the error is reported through
    /// `error_callback` and the context stays inactive.
    pub fn new<F>(locate_broker: F, error_callback: ErrorCallback) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn VirtualizationBroker>, BrokerError>,
    {
        let mut context = Self {
            broker: None,
            service: Arc::new(DisplayService::new()),
            state: ContextState::Uninitialized,
            error_callback,
        };
        context.register(locate_broker);
        context
    }

    fn register<F>(&mut self, locate_broker: F)
    where
        F: FnOnce() -> Result<Arc<dyn VirtualizationBroker>, BrokerError>,
    {
        self.state = ContextState::Registering;

        let broker = match locate_broker() {
            Ok(broker) => broker,
            Err(e) => return self.fail(format!("Failed to find virtualization service: {e}")),
        };
        if let Err(e) = broker.set_display_service(self.service.clone()) {
            return self.fail(format!("Failed to register display service: {e}"));
        }

        broker.start_thread_pool();
        self.broker = Some(broker);
        self.state = ContextState::Active;
        info!("Display service registered to the virtualization service");
    }

    fn fail(&mut self, message: String) {
        self.state = ContextState::Failed;
        self.report(message);
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn service(&self) -> &Arc<DisplayService> {
        &self.service
    }

    /// Logs `message` and passes it to the error callback.
    pub fn report(&self, message: impl Display) {
        let message = message.to_string();
        error!("{message}");
        (self.error_callback)(&message);
    }

    fn active_service(&self) -> Result<&DisplayService, ContextError> {
        match self.state {
            ContextState::Active => Ok(&self.service),
            _ => Err(ContextError::NotActive),
        }
    }

    /// Configures the scanout or cursor surface and waits until the UI process attaches a native
    /// surface to it. This can block.
    pub fn create_surface(
        &self,
        width: u32,
        height: u32,
        for_cursor: bool,
    ) -> Result<&SurfaceSlot, ContextError> {
        let service = self.active_service()?;
        let surface = service.surface(for_cursor);
        if let Err(e) = surface.configure(width, height) {
            // Not fatal: the surface is still usable once a later configuration succeeds.
            self.report(format!("Failed to configure surface {}: {e}", surface.name()));
        }

        surface.wait_for_native_surface();
        Ok(surface)
    }

    /// Locks the next buffer of `surface` for crosvm to draw onto.
    pub fn lock_buffer(&self, surface: &SurfaceSlot) -> Result<NativeBuffer, ContextError> {
        self.active_service()?;
        surface
            .lock()
            .map_err(|source| ContextError::Lock { name: surface.name().to_owned(), source })
    }

    pub fn post_buffer(&self, surface: &SurfaceSlot) -> Result<(), ContextError> {
        self.active_service()?;
        surface
            .unlock_and_post()
            .map_err(|source| ContextError::Post { name: surface.name().to_owned(), source })
    }

    /// Sends the cursor position to the UI process.
    pub fn set_surface_position(&self, x: u32, y: u32) -> Result<(), ContextError> {
        Ok(self.active_service()?.write_cursor_position(x, y)?)
    }
}

impl Drop for DisplayContext {
    fn drop(&mut self) {
        let Some(broker) = self.broker.take() else {
            self.report("Not connected to virtualization service");
            return;
        };
        if let Err(e) = broker.clear_display_service() {
            self.report(format!("Failed to clear display service: {e}"));
        }
        self.state = ContextState::Cleared;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::service::CrosvmAndroidDisplayService;
    use crate::window::HeadlessWindow;
    use anyhow::Result;
    use std::sync::Mutex;
    use std::thread;

    struct Errors(Arc<Mutex<Vec<String>>>);

    impl Errors {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn callback(&self) -> ErrorCallback {
            let errors = self.0.clone();
            Box::new(move |msg: &str| errors.lock().unwrap().push(msg.to_owned()))
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn connect(broker: &Arc<LocalBroker>, errors: &Errors) -> DisplayContext {
        let broker: Arc<dyn VirtualizationBroker> = broker.clone();
        DisplayContext::new(move || Ok(broker), errors.callback())
    }

    #[test]
    fn registers_and_clears() {
        let broker = Arc::new(LocalBroker::new());
        let errors = Errors::new();

        let context = connect(&broker, &errors);
        assert_eq!(context.state(), ContextState::Active);
        assert!(broker.has_display_service());
        assert!(broker.is_thread_pool_started());

        drop(context);
        assert!(!broker.has_display_service());
        assert!(errors.take().is_empty());
    }

    #[test]
    fn second_context_is_rejected() {
        let broker = Arc::new(LocalBroker::new());
        let errors = Errors::new();

        let first = connect(&broker, &errors);
        let second = connect(&broker, &errors);
        assert_eq!(first.state(), ContextState::Active);
        assert_eq!(second.state(), ContextState::Failed);
        assert_eq!(
            errors.take(),
            ["Failed to register display service: a display service is already registered"]
        );

        // The rejected context doesn't clear the registration of the first one.
        drop(second);
        assert!(broker.has_display_service());
        assert_eq!(errors.take(), ["Not connected to virtualization service"]);

        drop(first);
        let third = connect(&broker, &errors);
        assert_eq!(third.state(), ContextState::Active);
    }

    #[test]
    fn missing_broker_is_reported() {
        let errors = Errors::new();
        let context = DisplayContext::new(
            || Err(BrokerError::NotFound("virtualizationservice".to_owned())),
            errors.callback(),
        );
        assert_eq!(context.state(), ContextState::Failed);
        assert_eq!(
            errors.take(),
            ["Failed to find virtualization service: service virtualizationservice not found"]
        );
        assert_eq!(context.create_surface(1, 1, false).err(), Some(ContextError::NotActive));
        assert_eq!(context.set_surface_position(1, 1).unwrap_err(), ContextError::NotActive);
    }

    #[test]
    fn inactive_context_does_not_hand_out_buffers() {
        let errors = Errors::new();
        let context = DisplayContext::new(
            || Err(BrokerError::Remote("dead object".to_owned())),
            errors.callback(),
        );
        assert_eq!(context.state(), ContextState::Failed);

        let surface = context.service().surface(false);
        assert_eq!(context.lock_buffer(surface).unwrap_err(), ContextError::NotActive);
        assert_eq!(context.post_buffer(surface).unwrap_err(), ContextError::NotActive);
        assert_eq!(errors.take(), ["Failed to find virtualization service: dead object"]);
    }

    #[test]
    fn create_surface_waits_for_native_surface() -> Result<()> {
        let broker = Arc::new(LocalBroker::new());
        let errors = Errors::new();
        let context = connect(&broker, &errors);

        let window = HeadlessWindow::new(1, 1);
        let monitor = window.monitor();
        let ui = {
            let broker = broker.clone();
            thread::spawn(move || -> Result<()> {
                let service = broker.wait_display_service()?;
                service.set_surface(Box::new(window), false)?;
                Ok(())
            })
        };

        let surface = context.create_surface(64, 32, false)?;
        ui.join().unwrap()?;

        context.lock_buffer(surface)?;
        context.post_buffer(surface)?;
        assert_eq!(monitor.geometry().0, 64);
        assert_eq!(monitor.posted_frames(), 1);

        assert!(matches!(context.post_buffer(surface), Err(ContextError::Post { .. })));
        assert!(errors.take().is_empty());
        Ok(())
    }

    #[test]
    fn bad_configuration_is_reported_but_not_fatal() -> Result<()> {
        let broker = Arc::new(LocalBroker::new());
        let errors = Errors::new();
        let context = connect(&broker, &errors);
        context.service().set_surface(Box::new(HeadlessWindow::new(1, 1)), true)?;

        let surface = context.create_surface(u32::MAX, 1, true)?;
        assert_eq!(surface.name(), "cursor");
        let reported = errors.take();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].starts_with("Failed to configure surface cursor: "));

        let err = context.lock_buffer(surface).unwrap_err();
        assert_eq!(
            err,
            ContextError::Lock { name: "cursor".to_owned(), source: LockError::NotConfigured }
        );
        Ok(())
    }

    #[test]
    fn cursor_position_needs_stream() {
        let broker = Arc::new(LocalBroker::new());
        let errors = Errors::new();
        let context = connect(&broker, &errors);
        assert_eq!(
            context.set_surface_position(1, 2).unwrap_err(),
            ContextError::Cursor(CursorError::NoStream)
        );
    }
}
