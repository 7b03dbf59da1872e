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

//! Interfaces to the display and input sides of the host.
//!
//! The server core never touches a real screen or input device. It pulls
//! frames from a [`ScreenSource`] and pushes keyboard, pointer, and
//! clipboard traffic into an [`InputSink`]; embedding applications supply
//! both.

use crate::protocol::Rect;
use async_trait::async_trait;
use std::time::Instant;

/// One captured frame.
#[derive(Debug, Clone)]
pub struct Capture {
    /// BGRA pixel bytes, `width * height * 4` long.
    pub pixels: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Monotonic capture time.
    pub timestamp: Instant,
}

/// Failure modes of a capture attempt.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// The source cannot produce a frame right now; skip this cycle.
    Unavailable,
    /// The source is gone; the connection must terminate.
    Fatal(String),
}

/// A shared, read-only provider of display frames.
///
/// Implementations may serialise capture internally with a short lock but
/// must tolerate concurrent callers; every connection captures on its own
/// schedule.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    /// Captures the current frame, or the given region of it.
    async fn capture(&self, region: Option<Rect>) -> Result<Capture, CaptureError>;
}

/// A best-effort sink for client input.
///
/// Errors are logged by the server and dropped; a failing injection never
/// terminates the session. Input from different clients is delivered in
/// call order with no cross-client ordering guarantee.
pub trait InputSink: Send + Sync {
    /// Presses or releases a key identified by X11 keysym.
    fn inject_key(&self, keysym: u32, pressed: bool) -> std::io::Result<()>;

    /// Moves the pointer and applies the given button mask.
    fn inject_pointer(&self, x: i32, y: i32, buttons: u8) -> std::io::Result<()>;

    /// Replaces the host clipboard contents (Latin-1 bytes per RFB).
    fn set_clipboard(&self, text: &[u8]) -> std::io::Result<()>;
}

/// An input sink that discards everything. Useful for view-only servers
/// and tests.
#[derive(Debug, Default)]
pub struct NullInputSink;

impl InputSink for NullInputSink {
    fn inject_key(&self, _keysym: u32, _pressed: bool) -> std::io::Result<()> {
        Ok(())
    }

    fn inject_pointer(&self, _x: i32, _y: i32, _buttons: u8) -> std::io::Result<()> {
        Ok(())
    }

    fn set_clipboard(&self, _text: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}
