// Copyright 2025 The rfbserver Authors
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

//! FFI bindings to libjpeg-turbo's TurboJPEG API.
//!
//! A thin safe wrapper over `tjCompress2` used by the Tight encoder's
//! JPEG mode for photographic rectangles.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uchar, c_ulong};

/// RGB pixel format (red, green, blue).
pub const TJPF_RGB: c_int = 0;
/// 4:2:2 chrominance subsampling, the quality/size middle ground.
pub const TJSAMP_422: c_int = 1;

type TjHandle = *mut c_void;

#[link(name = "turbojpeg")]
extern "C" {
    fn tjInitCompress() -> TjHandle;
    fn tjDestroy(handle: TjHandle) -> c_int;
    fn tjCompress2(
        handle: TjHandle,
        src_buf: *const c_uchar,
        width: c_int,
        pitch: c_int,
        height: c_int,
        pixel_format: c_int,
        jpeg_buf: *mut *mut c_uchar,
        jpeg_size: *mut c_ulong,
        jpeg_subsamp: c_int,
        jpeg_qual: c_int,
        flags: c_int,
    ) -> c_int;
    fn tjFree(buffer: *mut c_uchar);
    fn tjGetErrorStr2(handle: TjHandle) -> *const c_char;
}

/// Safe wrapper for TurboJPEG compression.
pub struct TurboJpegEncoder {
    handle: TjHandle,
}

impl TurboJpegEncoder {
    /// Creates a compressor handle.
    pub fn new() -> Result<Self, String> {
        let handle = unsafe { tjInitCompress() };
        if handle.is_null() {
            return Err("failed to initialize TurboJPEG compressor".to_string());
        }
        Ok(Self { handle })
    }

    /// Compresses tightly packed RGB pixels to JPEG at the given quality
    /// (1-100).
    pub fn compress_rgb(
        &mut self,
        rgb_data: &[u8],
        width: u16,
        height: u16,
        quality: u8,
    ) -> Result<Vec<u8>, String> {
        let expected = usize::from(width) * usize::from(height) * 3;
        if rgb_data.len() != expected {
            return Err(format!(
                "invalid RGB data size: expected {expected}, got {}",
                rgb_data.len()
            ));
        }

        let mut jpeg_buf: *mut c_uchar = std::ptr::null_mut();
        let mut jpeg_size: c_ulong = 0;

        let result = unsafe {
            tjCompress2(
                self.handle,
                rgb_data.as_ptr(),
                c_int::from(width),
                0, // pitch 0 = width * pixel size
                c_int::from(height),
                TJPF_RGB,
                &mut jpeg_buf,
                &mut jpeg_size,
                TJSAMP_422,
                c_int::from(quality),
                0,
            )
        };

        if result != 0 {
            return Err(format!("TurboJPEG compression failed: {}", self.error_string()));
        }
        if jpeg_buf.is_null() {
            return Err("TurboJPEG returned a null buffer".to_string());
        }

        let jpeg_data =
            unsafe { std::slice::from_raw_parts(jpeg_buf, jpeg_size as usize).to_vec() };
        unsafe {
            tjFree(jpeg_buf);
        }
        Ok(jpeg_data)
    }

    fn error_string(&self) -> String {
        unsafe {
            let c_str = tjGetErrorStr2(self.handle);
            if c_str.is_null() {
                return "unknown error".to_string();
            }
            std::ffi::CStr::from_ptr(c_str).to_string_lossy().into_owned()
        }
    }
}

impl Drop for TurboJpegEncoder {
    fn drop(&mut self) {
        unsafe {
            tjDestroy(self.handle);
        }
    }
}

unsafe impl Send for TurboJpegEncoder {}
