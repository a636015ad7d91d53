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

//! C interface used by crosvm's Android display backend.
//!
//! Errors never cross this boundary as return values with details; they are passed as messages
//! to the error callback given at context creation.

use crate::broker::{wait_for_service, VIRTUALIZATION_SERVICE_NAME};
use crate::buffer::NativeBuffer;
use crate::context::DisplayContext;
use crate::surface::SurfaceSlot;
use libc::c_char;
use log::error;
use std::ffi::CString;
use std::ptr;

/// Receives a NUL-terminated error message.
pub type ErrorCallbackFn = unsafe extern "C" fn(message: *const c_char);

fn to_c_message(message: &str) -> CString {
    CString::new(message.replace('\0', " ")).unwrap_or_default()
}

/// Creates the display context, registering the display service to the virtualization service.
/// This blocks until the virtualization service is available.
///
/// # Safety
///
/// `error_callback` must stay callable until the context is destroyed.
#[no_mangle]
pub unsafe extern "C" fn create_android_display_context(
    _name: *const c_char,
    error_callback: ErrorCallbackFn,
) -> *mut DisplayContext {
    let callback = move |message: &str| {
        let message = to_c_message(message);
        // SAFETY: the callback is valid per the contract of this function, and `message` is a
        // valid C string for the duration of the call.
        unsafe { error_callback(message.as_ptr()) };
    };
    let context = DisplayContext::new(
        || Ok(wait_for_service(VIRTUALIZATION_SERVICE_NAME)),
        Box::new(callback),
    );
    Box::into_raw(Box::new(context))
}

/// Destroys the context, clearing the display service registration.
///
/// # Safety
///
/// `ctx` must have been returned by `create_android_display_context` and not destroyed yet, or be
/// null. Surfaces obtained from it must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn destroy_android_display_context(ctx: *mut DisplayContext) {
    if ctx.is_null() {
        return;
    }
    // SAFETY: ownership of the context is given back per the contract of this function.
    drop(unsafe { Box::from_raw(ctx) });
}

/// Configures the scanout or cursor surface and blocks until the UI process attaches a surface to
/// it. Returns null on failure.
///
/// # Safety
///
/// `ctx` must be a live context or null.
#[no_mangle]
pub unsafe extern "C" fn create_android_surface(
    ctx: *mut DisplayContext,
    width: u32,
    height: u32,
    for_cursor: bool,
) -> *mut SurfaceSlot {
    // SAFETY: `ctx` is live or null per the contract of this function.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        error!("create_android_surface: null context");
        return ptr::null_mut();
    };
    match ctx.create_surface(width, height, for_cursor) {
        // The slot lives as long as the context; crosvm only reads it through this interface.
        Ok(surface) => surface as *const SurfaceSlot as *mut SurfaceSlot,
        Err(e) => {
            ctx.report(e);
            ptr::null_mut()
        }
    }
}

/// Not implemented. Surfaces live as long as their context.
///
/// TODO: once surfaces can go away while the VM is running, hold a reference to the native window
/// from create to destroy so that crosvm never keeps a dangling one.
#[no_mangle]
pub extern "C" fn destroy_android_surface(_ctx: *mut DisplayContext, _surface: *mut SurfaceSlot) {}

/// Locks the next buffer of `surface` into `out_buffer`. Returns false on failure.
///
/// # Safety
///
/// `ctx` must be a live context or null, `surface` a surface of that context or null, and
/// `out_buffer` valid for writes or null.
#[no_mangle]
pub unsafe extern "C" fn get_android_surface_buffer(
    ctx: *mut DisplayContext,
    surface: *mut SurfaceSlot,
    out_buffer: *mut NativeBuffer,
) -> bool {
    // SAFETY: `ctx` is live or null per the contract of this function.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        error!("get_android_surface_buffer: null context");
        return false;
    };
    if out_buffer.is_null() {
        ctx.report("out_buffer is null");
        return false;
    }
    // SAFETY: `surface` belongs to `ctx` or is null per the contract of this function.
    let Some(surface) = (unsafe { surface.as_ref() }) else {
        ctx.report("Invalid AndroidDisplaySurface provided");
        return false;
    };

    match ctx.lock_buffer(surface) {
        Ok(buffer) => {
            // SAFETY: checked for null above; valid for writes per the contract of this function.
            unsafe { out_buffer.write(buffer) };
            true
        }
        Err(e) => {
            ctx.report(e);
            false
        }
    }
}

/// Sends the cursor position to the UI process.
///
/// # Safety
///
/// `ctx` must be a live context or null.
#[no_mangle]
pub unsafe extern "C" fn set_android_surface_position(ctx: *mut DisplayContext, x: u32, y: u32) {
    // SAFETY: `ctx` is live or null per the contract of this function.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        error!("set_android_surface_position: null context");
        return;
    };
    if let Err(e) = ctx.set_surface_position(x, y) {
        ctx.report(e);
    }
}

/// Presents the buffer last locked with `get_android_surface_buffer`.
///
/// # Safety
///
/// `ctx` must be a live context or null, and `surface` a surface of that context or null.
#[no_mangle]
pub unsafe extern "C" fn post_android_surface_buffer(
    ctx: *mut DisplayContext,
    surface: *mut SurfaceSlot,
) {
    // SAFETY: `ctx` is live or null per the contract of this function.
    let Some(ctx) = (unsafe { ctx.as_ref() }) else {
        error!("post_android_surface_buffer: null context");
        return;
    };
    // SAFETY: `surface` belongs to `ctx` or is null per the contract of this function.
    let Some(surface) = (unsafe { surface.as_ref() }) else {
        ctx.report("Invalid AndroidDisplaySurface provided");
        return;
    };
    if let Err(e) = ctx.post_buffer(surface) {
        ctx.report(e);
    }
}
