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

//! RFB (Remote Framebuffer) protocol constants and wire structures.
//!
//! This module provides the building blocks for RFB communication as
//! specified in RFC 6143: protocol versions, message types, security
//! types, encoding identifiers, and the pixel format descriptor, plus an
//! incremental decoder for client messages.
//!
//! # Protocol Overview
//!
//! An RFB connection passes through the following phases:
//! 1. **Protocol Version** - server and client agree on a version
//! 2. **Security Handshake** - authentication selection and execution
//! 3. **Initialization** - exchange of framebuffer parameters
//! 4. **Normal Operation** - input events and framebuffer updates

use bytes::{Buf, BufMut, BytesMut};

/// The RFB protocol version string advertised by the server.
///
/// The server speaks 3.8 and clamps down to what the client offers.
/// The string must be exactly 12 bytes including the newline.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// RFB protocol versions this server can drive a session at.
///
/// Anything the client sends that is not literally 3.7 or 3.8 is treated
/// as 3.3, per RFC 6143 §7.1.1: unknown versions do not implement the
/// newer handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// RFB 3.3: server dictates the security type as a u32.
    Rfb33,
    /// RFB 3.7: security type list, no SecurityResult for None.
    Rfb37,
    /// RFB 3.8: security type list plus SecurityResult and reason strings.
    Rfb38,
}

impl ProtocolVersion {
    /// Clamps a client version string to the highest mutually supported
    /// version.
    pub fn from_client_bytes(bytes: &[u8; 12]) -> Self {
        match bytes {
            b"RFB 003.008\n" => ProtocolVersion::Rfb38,
            b"RFB 003.007\n" => ProtocolVersion::Rfb37,
            _ => ProtocolVersion::Rfb33,
        }
    }
}

// Client-to-Server Message Types

/// Client requests a change of pixel format for subsequent updates.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Client announces the encodings it supports, in preference order.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Client asks for a framebuffer update (incremental or full).
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Client sends a key press or release.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Client sends a pointer position and button state.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Client transfers clipboard text to the server.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Server sends one or more rectangles of encoded pixel data.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
/// Server sets colour map entries. Never sent in true-colour mode.
#[allow(dead_code)]
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
/// Server rings the client bell.
pub const SERVER_MSG_BELL: u8 = 2;
/// Server transfers clipboard text to the client.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Raw: uncompressed pixel data in the client's format.
pub const ENCODING_RAW: i32 = 0;
/// CopyRect: copy a region the client already has.
pub const ENCODING_COPYRECT: i32 = 1;
/// RRE: background colour plus coloured subrectangles.
pub const ENCODING_RRE: i32 = 2;
/// Hextile: 16x16 tiles with per-tile subencodings.
pub const ENCODING_HEXTILE: i32 = 5;
/// Zlib: raw pixels through a persistent deflate stream.
pub const ENCODING_ZLIB: i32 = 6;
/// Tight: palette/fill/zlib/JPEG modes with four zlib streams.
pub const ENCODING_TIGHT: i32 = 7;
/// ZRLE: 64x64 tiles, palette/RLE, one persistent deflate stream.
pub const ENCODING_ZRLE: i32 = 16;

// Pseudo-encodings (capability declarations, not pixel data)

/// Rich cursor shape updates.
pub const ENCODING_CURSOR: i32 = -239;
/// Framebuffer dimension change notification.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
/// Extended (multi-screen) desktop size notification.
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;
/// Continuous updates negotiation.
pub const ENCODING_CONTINUOUS_UPDATES: i32 = -313;
/// LastRect terminator for open-ended updates.
pub const ENCODING_LAST_RECT: i32 = -224;

/// JPEG quality level 0 (lowest quality, strongest compression).
pub const ENCODING_QUALITY_LEVEL_0: i32 = -32;
/// JPEG quality level 9 (highest quality).
pub const ENCODING_QUALITY_LEVEL_9: i32 = -23;
/// Compression level 0 (fastest).
pub const ENCODING_COMPRESS_LEVEL_0: i32 = -256;
/// Compression level 9 (densest).
pub const ENCODING_COMPRESS_LEVEL_9: i32 = -247;

/// UltraVNC's private "Ultra" encodings. Their presence in a SetEncodings
/// list identifies an UltraVNC viewer for the Tight compatibility
/// workaround.
pub const ENCODING_ULTRA: i32 = 9;
/// Second UltraVNC private encoding id.
pub const ENCODING_ULTRA2: i32 = 10;

// Hextile subencoding flags

/// Hextile: tile is raw pixel data; all other flags must be clear.
pub const HEXTILE_RAW: u8 = 1 << 0;
/// Hextile: a background pixel follows the subencoding byte.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;
/// Hextile: a foreground pixel follows.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;
/// Hextile: a subrectangle count and subrectangles follow.
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;
/// Hextile: each subrectangle carries its own pixel.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

// Security Types

/// No authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;
/// DES challenge-response VNC authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Authentication (if any) succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;
/// Authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Pixel layout negotiated with a client.
///
/// 16 bytes on the wire. Only true-colour formats are supported; the
/// server closes connections that request a colour map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel: 8, 16, or 32.
    pub bits_per_pixel: u8,
    /// Colour depth in bits, at most `bits_per_pixel`.
    pub depth: u8,
    /// 1 if multi-byte pixels are big-endian on the wire.
    pub big_endian_flag: u8,
    /// 1 for true-colour. Colour-mapped formats are rejected.
    pub true_colour_flag: u8,
    /// Maximum red value, of the form 2^n - 1.
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Right-shift that isolates the red field.
    pub red_shift: u8,
    /// Right-shift that isolates the green field.
    pub green_shift: u8,
    /// Right-shift that isolates the blue field.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The server's native format: 32 bpp little-endian with blue in the
    /// low byte, matching BGRA byte order in memory. Conversion to this
    /// format is a straight copy of the snapshot.
    #[must_use]
    pub fn bgra32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 16-bit RGB565, the common format for bandwidth-constrained clients.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 8-bit BGR233 for very low bandwidth and legacy clients.
    #[must_use]
    pub fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// Whether pixels in this format are bit-identical to the server's
    /// BGRA snapshot, allowing conversion by memcpy.
    #[must_use]
    pub fn is_native_bgra32(&self) -> bool {
        self.bits_per_pixel == 32
            && self.big_endian_flag == 0
            && self.true_colour_flag == 1
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
            && self.red_shift == 16
            && self.green_shift == 8
            && self.blue_shift == 0
    }

    /// Bytes per pixel on the wire.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Validates the format against what the server can serve.
    ///
    /// Requires bpp in {8, 16, 32}, true colour, 2^n - 1 max fields that
    /// fit the depth, and non-overlapping shifts within the pixel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        if self.true_colour_flag == 0 {
            return false;
        }

        let field_bits = |max: u16| -> Option<u32> {
            // max must be 2^n - 1 and non-zero
            if max == 0 || (max & (max + 1)) != 0 {
                None
            } else {
                Some(16 - max.leading_zeros())
            }
        };

        let (red_bits, green_bits, blue_bits) = match (
            field_bits(self.red_max),
            field_bits(self.green_max),
            field_bits(self.blue_max),
        ) {
            (Some(r), Some(g), Some(b)) => (r, g, b),
            _ => return false,
        };

        if red_bits + green_bits + blue_bits > u32::from(self.depth) {
            return false;
        }

        let bpp = u32::from(self.bits_per_pixel);
        let fields = [
            (u32::from(self.red_shift), red_bits),
            (u32::from(self.green_shift), green_bits),
            (u32::from(self.blue_shift), blue_bits),
        ];
        let mut occupied: u32 = 0;
        for (shift, bits) in fields {
            if shift + bits > bpp {
                return false;
            }
            let mask = ((1u32 << bits) - 1) << shift;
            if occupied & mask != 0 {
                return false;
            }
            occupied |= mask;
        }

        true
    }

    /// Serializes the format in RFB wire layout (16 bytes with padding).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Deserializes a format from 16 wire bytes. The caller must have
    /// checked that 16 bytes are available.
    pub fn read_from(buf: &mut BytesMut) -> Self {
        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        pf
    }
}

/// The ServerInit message sent once security negotiation completes.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name shown by the viewer.
    pub name: String,
}

impl ServerInit {
    /// Serializes the message: width, height, pixel format, name.
    #[allow(clippy::cast_possible_truncation)] // name length bounded by u32 per RFB
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);
        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// A framebuffer region with x, y, width, height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: u16,
    /// Top edge.
    pub y: u16,
    /// Width, at least 1 for pixel rectangles.
    pub w: u16,
    /// Height, at least 1 for pixel rectangles.
    pub h: u16,
}

impl Rect {
    /// Constructs a rectangle.
    #[must_use]
    pub fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    /// Area in pixels.
    #[must_use]
    pub fn area(&self) -> usize {
        self.w as usize * self.h as usize
    }

    /// Clamps this rectangle to a framebuffer of the given size. Returns
    /// `None` when nothing remains.
    #[must_use]
    pub fn clamp_to(&self, fb_width: u16, fb_height: u16) -> Option<Rect> {
        if self.x >= fb_width || self.y >= fb_height {
            return None;
        }
        let w = self.w.min(fb_width - self.x);
        let h = self.h.min(fb_height - self.y);
        if w == 0 || h == 0 {
            None
        } else {
            Some(Rect::new(self.x, self.y, w, h))
        }
    }

    /// Intersection with another rectangle, if non-empty.
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        if x1 < x2 && y1 < y2 {
            Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    /// Smallest rectangle covering both.
    #[must_use]
    pub fn union(&self, other: &Rect) -> Rect {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = (self.x + self.w).max(other.x + other.w);
        let y2 = (self.y + self.h).max(other.y + other.h);
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// True when the rectangles share at least one pixel.
    #[must_use]
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.intersect(other).is_some()
    }

    /// The parts of `self` not covered by `other`: up to four disjoint
    /// strips (top, bottom, left, right of the overlap).
    #[must_use]
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersect(other) else {
            return vec![*self];
        };
        let mut out = Vec::new();
        if overlap.y > self.y {
            out.push(Rect::new(self.x, self.y, self.w, overlap.y - self.y));
        }
        let bottom = self.y + self.h;
        let overlap_bottom = overlap.y + overlap.h;
        if overlap_bottom < bottom {
            out.push(Rect::new(self.x, overlap_bottom, self.w, bottom - overlap_bottom));
        }
        if overlap.x > self.x {
            out.push(Rect::new(self.x, overlap.y, overlap.x - self.x, overlap.h));
        }
        let right = self.x + self.w;
        let overlap_right = overlap.x + overlap.w;
        if overlap_right < right {
            out.push(Rect::new(overlap_right, overlap.y, right - overlap_right, overlap.h));
        }
        out
    }

    /// Writes the rectangle header: x, y, w, h, encoding id.
    pub fn write_header(&self, encoding: i32, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.w);
        buf.put_u16(self.h);
        buf.put_i32(encoding);
    }
}

/// Limits applied while decoding client messages.
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    /// Maximum entries accepted in a SetEncodings list.
    pub max_set_encodings: usize,
    /// Maximum ClientCutText payload in bytes.
    pub max_client_cut_text: usize,
}

/// Messages a client can send during normal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Change of pixel format for subsequent updates.
    SetPixelFormat(PixelFormat),
    /// Supported encodings in client preference order, verbatim.
    SetEncodings(Vec<i32>),
    /// Request for a framebuffer update.
    FramebufferUpdateRequest {
        /// When true, only changes since the last update are wanted.
        incremental: bool,
        /// Requested region.
        region: Rect,
    },
    /// Key press or release.
    KeyEvent {
        /// True on press, false on release.
        down: bool,
        /// X11 keysym.
        keysym: u32,
    },
    /// Pointer position and button state.
    PointerEvent {
        /// Bitmask of held buttons, bit 0 = left.
        button_mask: u8,
        /// Pointer x.
        x: u16,
        /// Pointer y.
        y: u16,
    },
    /// Clipboard text from the client (Latin-1 on the wire).
    ClientCutText(Vec<u8>),
}

/// Outcome of a decode attempt over a partially filled buffer.
///
/// `Truncated` asks the caller to read more bytes; `Malformed` means the
/// byte stream cannot be resynchronised and the connection must close.
#[derive(Debug)]
pub enum Decoded<T> {
    /// A complete message was consumed from the buffer.
    Ok(T),
    /// Not enough bytes buffered yet; nothing was consumed.
    Truncated,
    /// The stream is irrecoverably malformed.
    Malformed(&'static str),
}

impl ClientMessage {
    /// Decodes one client message from the front of `buf`, consuming its
    /// bytes only when the message is complete.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(buf: &mut BytesMut, limits: &MessageLimits) -> Decoded<ClientMessage> {
        if buf.is_empty() {
            return Decoded::Truncated;
        }
        match buf[0] {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                // type + 3 pad + 16 format
                if buf.len() < 20 {
                    return Decoded::Truncated;
                }
                buf.advance(4);
                let pf = PixelFormat::read_from(buf);
                Decoded::Ok(ClientMessage::SetPixelFormat(pf))
            }
            CLIENT_MSG_SET_ENCODINGS => {
                if buf.len() < 4 {
                    return Decoded::Truncated;
                }
                let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if count > limits.max_set_encodings {
                    return Decoded::Malformed("SetEncodings list too long");
                }
                if buf.len() < 4 + count * 4 {
                    return Decoded::Truncated;
                }
                buf.advance(4);
                let mut encodings = Vec::with_capacity(count);
                for _ in 0..count {
                    encodings.push(buf.get_i32());
                }
                Decoded::Ok(ClientMessage::SetEncodings(encodings))
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                if buf.len() < 10 {
                    return Decoded::Truncated;
                }
                buf.advance(1);
                let incremental = buf.get_u8() != 0;
                let region = Rect::new(buf.get_u16(), buf.get_u16(), buf.get_u16(), buf.get_u16());
                Decoded::Ok(ClientMessage::FramebufferUpdateRequest {
                    incremental,
                    region,
                })
            }
            CLIENT_MSG_KEY_EVENT => {
                if buf.len() < 8 {
                    return Decoded::Truncated;
                }
                buf.advance(1);
                let down = buf.get_u8() != 0;
                buf.advance(2);
                let keysym = buf.get_u32();
                Decoded::Ok(ClientMessage::KeyEvent { down, keysym })
            }
            CLIENT_MSG_POINTER_EVENT => {
                if buf.len() < 6 {
                    return Decoded::Truncated;
                }
                buf.advance(1);
                let button_mask = buf.get_u8();
                let x = buf.get_u16();
                let y = buf.get_u16();
                Decoded::Ok(ClientMessage::PointerEvent { button_mask, x, y })
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                if buf.len() < 8 {
                    return Decoded::Truncated;
                }
                let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                if length > limits.max_client_cut_text {
                    return Decoded::Malformed("ClientCutText too large");
                }
                if buf.len() < 8 + length {
                    return Decoded::Truncated;
                }
                buf.advance(8);
                let text = buf.split_to(length).to_vec();
                Decoded::Ok(ClientMessage::ClientCutText(text))
            }
            _ => Decoded::Malformed("unknown client message type"),
        }
    }
}
