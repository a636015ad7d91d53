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

//! The virtualization service, which registers the display service on behalf of crosvm.
//!
//! crosvm runs as an app, and apps are not allowed to register a service to the service manager.
//! Instead the display service is handed to the virtualization service, from where the UI process
//! picks it up.

use crate::service::CrosvmAndroidDisplayService;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use thiserror::Error;

/// Name the virtualization service is registered under.
pub const VIRTUALIZATION_SERVICE_NAME: &str = "android.system.virtualizationservice";

/// Errors returned by a [`VirtualizationBroker`]
#[derive(Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("service {0} not found")]
    NotFound(String),

    /// Another display service is registered and hasn't been cleared
    #[error("a display service is already registered")]
    AlreadyRegistered,

    #[error("{0}")]
    Remote(String),
}

/// The display-related part of `IVirtualizationServiceInternal`.
pub trait VirtualizationBroker: Send + Sync {
    fn set_display_service(
        &self,
        service: Arc<dyn CrosvmAndroidDisplayService>,
    ) -> Result<(), BrokerError>;

    fn clear_display_service(&self) -> Result<(), BrokerError>;

    /// Blocks until a display service is registered and returns it.
    fn wait_display_service(&self) -> Result<Arc<dyn CrosvmAndroidDisplayService>, BrokerError>;

    /// Starts the threads serving incoming calls to services registered through this broker.
    fn start_thread_pool(&self) {}
}

/// A broker living in the same process as its clients.
#[derive(Default)]
pub struct LocalBroker {
    display_service: Mutex<Option<Arc<dyn CrosvmAndroidDisplayService>>>,
    registered: Condvar,
    thread_pool_started: AtomicBool,
}

impl LocalBroker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn has_display_service(&self) -> bool {
        self.display_service.lock().unwrap().is_some()
    }

    pub fn is_thread_pool_started(&self) -> bool {
        self.thread_pool_started.load(Ordering::Acquire)
    }
}

impl VirtualizationBroker for LocalBroker {
    fn set_display_service(
        &self,
        service: Arc<dyn CrosvmAndroidDisplayService>,
    ) -> Result<(), BrokerError> {
        let mut display_service = self.display_service.lock().unwrap();
        if display_service.is_some() {
            return Err(BrokerError::AlreadyRegistered);
        }
        *display_service = Some(service);
        drop(display_service);
        info!("Display service registered");
        self.registered.notify_all();
        Ok(())
    }

    fn clear_display_service(&self) -> Result<(), BrokerError> {
        if self.display_service.lock().unwrap().take().is_some() {
            info!("Display service cleared");
        }
        Ok(())
    }

    fn wait_display_service(&self) -> Result<Arc<dyn CrosvmAndroidDisplayService>, BrokerError> {
        let display_service = self
            .registered
            .wait_while(self.display_service.lock().unwrap(), |s| s.is_none())
            .unwrap();
        display_service.clone().ok_or_else(|| BrokerError::NotFound("display service".to_owned()))
    }

    fn start_thread_pool(&self) {
        self.thread_pool_started.store(true, Ordering::Release);
    }
}

/// Process-wide lookup of brokers by name, in the manner of the service manager.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<dyn VirtualizationBroker>>>,
    added: Condvar,
}

static SERVICE_REGISTRY: LazyLock<ServiceRegistry> = LazyLock::new(ServiceRegistry::default);

impl ServiceRegistry {
    /// Registers `service` under `name`, replacing any previous one.
    pub fn add_service(&self, name: &str, service: Arc<dyn VirtualizationBroker>) {
        self.services.lock().unwrap().insert(name.to_owned(), service);
        debug!("Service {name} added");
        self.added.notify_all();
    }

    pub fn check_service(&self, name: &str) -> Option<Arc<dyn VirtualizationBroker>> {
        self.services.lock().unwrap().get(name).cloned()
    }

    /// Blocks until a service named `name` is registered.
    pub fn wait_for_service(&self, name: &str) -> Arc<dyn VirtualizationBroker> {
        let services = self
            .added
            .wait_while(self.services.lock().unwrap(), |s| !s.contains_key(name))
            .unwrap();
        services[name].clone()
    }
}

/// See [`ServiceRegistry::add_service`].
pub fn add_service(name: &str, service: Arc<dyn VirtualizationBroker>) {
    SERVICE_REGISTRY.add_service(name, service)
}

/// See [`ServiceRegistry::check_service`].
pub fn check_service(name: &str) -> Option<Arc<dyn VirtualizationBroker>> {
    SERVICE_REGISTRY.check_service(name)
}

/// See [`ServiceRegistry::wait_for_service`].
pub fn wait_for_service(name: &str) -> Arc<dyn VirtualizationBroker> {
    SERVICE_REGISTRY.wait_for_service(name)
}
