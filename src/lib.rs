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

//! # rfbserver
//!
//! An async RFB (Remote Framebuffer, RFC 6143) server core. It speaks
//! protocol versions 3.3, 3.7, and 3.8 over raw TCP or WebSocket on the
//! same port, encodes updates adaptively (Raw, CopyRect, RRE, Hextile,
//! Zlib, ZRLE, optional Tight/JPEG), and tracks screen changes with
//! tile-hash diffing so idle screens cost nothing.
//!
//! The crate deliberately stops at two traits: a [`ScreenSource`] that
//! produces BGRA frames and an [`InputSink`] that receives keyboard,
//! pointer, and clipboard input. Everything between those traits and the
//! socket — handshake, authentication, change detection, encoder
//! selection, frame pacing, connection supervision — lives here.
//!
//! ## Quick start
//!
//! ```no_run
//! use rfbserver::{ServerConfig, VncServer, NullInputSink};
//! use std::sync::Arc;
//!
//! # struct MyScreen;
//! # #[async_trait::async_trait]
//! # impl rfbserver::ScreenSource for MyScreen {
//! #     async fn capture(&self, _region: Option<rfbserver::Rect>)
//! #         -> Result<rfbserver::Capture, rfbserver::CaptureError> { unimplemented!() }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 5900,
//!         password: "secret".to_string(),
//!         ..Default::default()
//!     };
//!     let screen = Arc::new(MyScreen);
//!     let input = Arc::new(NullInputSink);
//!     let (server, mut events) = VncServer::new(config, screen, input);
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     server.listen().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ScreenSource ──capture──▶ Snapshot ──diff──▶ dirty rects
//!                                                │
//!                                      selector picks encoder
//!                                                │
//!                  FramebufferUpdate ◀──encode───┘
//!                        │
//!              Transport (raw TCP / WebSocket)
//!                        │
//!                     client ──input──▶ InputSink
//! ```
//!
//! One task per connection; sessions own their sockets, snapshots, tile
//! hashes, and compression streams outright. The supervisor keeps only a
//! command channel per session and a shutdown broadcast.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod diff;
pub mod encoding;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod jpeg;
pub mod protocol;
pub mod server;
pub mod source;

// Internal modules
mod auth;
mod client;
mod translate;
mod transport;
mod websocket;

// Re-exports
pub use config::{LanTuning, NetworkProfile, ServerConfig};
pub use error::{Result, VncError};
pub use events::ServerEvent;
pub use framebuffer::Snapshot;
pub use protocol::{PixelFormat, ProtocolVersion, Rect};
pub use server::VncServer;
pub use source::{Capture, CaptureError, InputSink, NullInputSink, ScreenSource};

#[cfg(feature = "turbojpeg")]
pub use jpeg::TurboJpegEncoder;

/// RFB protocol version string the server advertises.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
