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

//! Rectangle encoders for framebuffer updates.
//!
//! Every encoder turns a rectangle of BGRA snapshot pixels into wire
//! bytes in the client's negotiated pixel format. Encoders are pure with
//! one exception: ZRLE, Zlib, and Tight write through their connection's
//! persistent deflate streams, which RFC 6143 requires to stay continuous
//! across updates.

use crate::error::{Result, VncError};
use crate::protocol::{
    PixelFormat, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_TIGHT, ENCODING_ZLIB,
    ENCODING_ZRLE,
};
use bytes::BytesMut;
use flate2::{Compress, Compression};

pub mod common;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod select;
pub mod tight;
pub mod zlib;
pub mod zrle;

pub use hextile::HextileEncoding;
pub use raw::RawEncoding;
pub use rre::RreEncoding;
pub use select::{ContentHint, EncoderSelector, Selection, SelectionInputs};
pub use tight::TightEncoding;
pub use zlib::ZlibEncoding;
pub use zrle::ZrleEncoding;

/// The persistent deflate streams owned by one connection.
///
/// Streams are created lazily at the level first requested and are never
/// reset mid-session; resetting would desynchronise the client's
/// inflater. They are destroyed with the session.
pub struct CompressStreams {
    zlib: Option<Compress>,
    zrle: Option<Compress>,
    tight: [Option<Compress>; 4],
}

impl CompressStreams {
    /// Creates the container with no streams initialised.
    #[must_use]
    pub fn new() -> Self {
        Self {
            zlib: None,
            zrle: None,
            tight: [None, None, None, None],
        }
    }

    /// The Zlib-encoding stream.
    pub fn zlib(&mut self, level: u32) -> &mut Compress {
        self.zlib
            .get_or_insert_with(|| Compress::new(Compression::new(level), true))
    }

    /// The ZRLE stream.
    pub fn zrle(&mut self, level: u32) -> &mut Compress {
        self.zrle
            .get_or_insert_with(|| Compress::new(Compression::new(level), true))
    }

    /// One of the four Tight streams.
    ///
    /// # Panics
    ///
    /// Panics if `id > 3`; Tight defines exactly four streams.
    pub fn tight(&mut self, id: usize, level: u32) -> &mut Compress {
        self.tight[id].get_or_insert_with(|| Compress::new(Compression::new(level), true))
    }
}

impl Default for CompressStreams {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-rectangle encoding parameters and stream access.
pub struct EncodeContext<'a> {
    /// The client's negotiated pixel format.
    pub format: &'a PixelFormat,
    /// JPEG quality (1-100) for lossy modes.
    pub quality: u8,
    /// Deflate level (0-9) for the compressing encoders.
    pub compression: u8,
    /// Whether the Tight encoder may use its JPEG mode for this
    /// rectangle.
    pub jpeg_allowed: bool,
    /// The connection's persistent deflate streams.
    pub streams: &'a mut CompressStreams,
}

/// A rectangle encoder.
///
/// Implementations must emit exactly the bytes RFC 6143 defines for their
/// encoding, in the client's pixel format. A failure is reported as
/// [`VncError::Encoding`]; the caller falls back to Raw unless the
/// encoder has already advanced a persistent stream, in which case the
/// error is fatal for the connection.
pub trait Encoding: Send + Sync {
    /// The wire encoding identifier.
    fn id(&self) -> i32;

    /// Whether this encoder advances a persistent deflate stream. Stream
    /// encoders cannot be retried or raced; the scheduler keeps them on
    /// the session task.
    fn uses_streams(&self) -> bool {
        false
    }

    /// Encodes `width * height` BGRA pixels into wire bytes.
    fn encode(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut>;
}

static RAW: RawEncoding = RawEncoding;
static RRE: RreEncoding = RreEncoding;
static HEXTILE: HextileEncoding = HextileEncoding;
static ZLIB: ZlibEncoding = ZlibEncoding;
static ZRLE: ZrleEncoding = ZrleEncoding;
static TIGHT: TightEncoding = TightEncoding;

/// Looks up the encoder for a wire identifier.
#[must_use]
pub fn get_encoder(encoding_type: i32) -> Option<&'static dyn Encoding> {
    match encoding_type {
        ENCODING_RAW => Some(&RAW),
        ENCODING_RRE => Some(&RRE),
        ENCODING_HEXTILE => Some(&HEXTILE),
        ENCODING_ZLIB => Some(&ZLIB),
        ENCODING_ZRLE => Some(&ZRLE),
        ENCODING_TIGHT => Some(&TIGHT),
        _ => None,
    }
}

/// Encoding identifiers this server implements, in no particular order.
pub const IMPLEMENTED_ENCODINGS: [i32; 6] = [
    ENCODING_RAW,
    ENCODING_RRE,
    ENCODING_HEXTILE,
    ENCODING_ZLIB,
    ENCODING_ZRLE,
    ENCODING_TIGHT,
];

/// Converts a deflate failure into an encoding error.
pub(crate) fn stream_error(what: &str, err: impl std::fmt::Display) -> VncError {
    VncError::Encoding(format!("{what}: {err}"))
}
