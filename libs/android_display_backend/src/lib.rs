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

//! Android display backend for crosvm.
//!
//! The UI process owns the surfaces the VM display is shown on. It hands them over to crosvm
//! through the display service, which crosvm registers to the virtualization service. crosvm then
//! renders each frame directly into the surface buffers, or into a sink buffer while the UI is in
//! the background. Cursor positions flow back over a separate byte stream.

pub mod broker;
pub mod buffer;
pub mod context;
pub mod cursor;
pub mod ffi;
pub mod provider;
pub mod service;
pub mod surface;
pub mod window;

pub use broker::{LocalBroker, VirtualizationBroker, VIRTUALIZATION_SERVICE_NAME};
pub use buffer::{NativeBuffer, PixelBuffer, PIXEL_FORMAT_BGRA_8888};
pub use context::{ContextError, ContextState, DisplayContext, ErrorCallback};
pub use cursor::{CursorChannel, CursorOverlay};
pub use provider::{DisplayProvider, SurfaceKind};
pub use service::{CrosvmAndroidDisplayService, DisplayService, Status};
pub use surface::{Dimensions, DrawError, LockError, PostError, SurfaceSlot};
pub use window::{HeadlessWindow, HeadlessWindowMonitor, NativeWindow};
