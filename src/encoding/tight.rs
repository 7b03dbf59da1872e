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

//! Tight encoding (7): fill, palette, and full-colour zlib modes, with
//! an optional JPEG mode.
//!
//! # Wire format
//!
//! Every Tight rectangle starts with a control byte. The high nibble
//! selects the mode: `0x8` solid fill, `0x9` JPEG, otherwise "basic"
//! with the zlib stream id in bits 4-5 and bit 6 marking an explicit
//! filter byte. The low nibble carries stream-reset flags, which this
//! server never sets: its four per-connection streams live for the whole
//! session.
//!
//! Basic-mode payloads shorter than 12 bytes are sent raw with no length
//! field; longer ones are deflated through the mode's persistent stream
//! and framed with the 1-3 byte compact length form.
//!
//! Pixels inside Tight rectangles use the TPIXEL form: 3 RGB bytes when
//! the client format is 32 bpp, depth 24, true colour with 8-bit
//! channels, otherwise the full pixel.

use super::common::deflate_sync;
use super::{stream_error, EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::{ENCODING_TIGHT, PixelFormat};
use crate::translate;
use bytes::{BufMut, BytesMut};

/// Mode nibble: solid fill.
const TIGHT_FILL: u8 = 0x08;
/// Mode nibble: JPEG.
#[allow(dead_code)]
const TIGHT_JPEG: u8 = 0x09;
/// Basic-mode bit: an explicit filter byte follows the control byte.
const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
/// Filter id: indexed palette.
const TIGHT_FILTER_PALETTE: u8 = 0x01;

/// Zlib stream for full-colour data.
const STREAM_FULL_COLOR: usize = 0;
/// Zlib stream for monochrome bitmaps.
const STREAM_MONO: usize = 1;
/// Zlib stream for palette indices.
const STREAM_INDEXED: usize = 2;

/// Payloads below this length are sent raw without a length field.
const TIGHT_MIN_TO_COMPRESS: usize = 12;

/// Deflate levels per compression setting: (indexed, mono, full-colour).
fn zlib_levels(compression: u8) -> (u32, u32, u32) {
    match compression {
        0 => (0, 0, 0),
        1 => (1, 1, 1),
        2 | 3 => (3, 3, 2),
        _ => (7, 7, 5),
    }
}

/// Implements the Tight encoding.
pub struct TightEncoding;

impl Encoding for TightEncoding {
    fn id(&self) -> i32 {
        ENCODING_TIGHT
    }

    fn uses_streams(&self) -> bool {
        true
    }

    fn encode(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        let palette = analyze_colors(pixels);

        match palette {
            ColorClass::Solid(bgra) => Ok(encode_fill(&bgra, ctx.format)),
            ColorClass::Mono(bg, fg) => encode_mono(pixels, width, height, bg, fg, ctx),
            ColorClass::Indexed(colors) => encode_indexed(pixels, width, height, &colors, ctx),
            ColorClass::TrueColor => {
                #[cfg(feature = "turbojpeg")]
                if ctx.jpeg_allowed {
                    return encode_jpeg(pixels, width, height, ctx);
                }
                encode_full_color(pixels, width, height, ctx)
            }
        }
    }
}

/// Colour structure of a rectangle.
enum ColorClass {
    Solid([u8; 4]),
    Mono([u8; 4], [u8; 4]),
    Indexed(Vec<[u8; 4]>),
    TrueColor,
}

/// Scans the rectangle once, giving up as soon as the palette exceeds
/// the indexed-mode cap.
fn analyze_colors(pixels: &[u8]) -> ColorClass {
    const MAX_INDEXED: usize = 16;
    let mut palette: Vec<[u8; 4]> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();

    for bgra in pixels.chunks_exact(4) {
        let key = [bgra[0], bgra[1], bgra[2], 0];
        match palette.iter().position(|c| *c == key) {
            Some(i) => counts[i] += 1,
            None => {
                if palette.len() == MAX_INDEXED {
                    return ColorClass::TrueColor;
                }
                palette.push(key);
                counts.push(1);
            }
        }
    }

    match palette.len() {
        0 => ColorClass::Solid([0; 4]),
        1 => ColorClass::Solid(palette[0]),
        2 => {
            // Background first: the more frequent colour.
            if counts[0] >= counts[1] {
                ColorClass::Mono(palette[0], palette[1])
            } else {
                ColorClass::Mono(palette[1], palette[0])
            }
        }
        _ => ColorClass::Indexed(palette),
    }
}

/// Whether the format takes the 3-byte TPIXEL shortcut.
fn is_tpixel_format(format: &PixelFormat) -> bool {
    format.bits_per_pixel == 32
        && format.depth == 24
        && format.true_colour_flag != 0
        && format.red_max == 255
        && format.green_max == 255
        && format.blue_max == 255
}

/// Writes one BGRA colour as a TPIXEL (or full pixel).
fn put_tpixel(buf: &mut BytesMut, format: &PixelFormat, bgra: &[u8; 4]) {
    if is_tpixel_format(format) {
        buf.put_u8(bgra[2]);
        buf.put_u8(bgra[1]);
        buf.put_u8(bgra[0]);
    } else {
        let value = translate::pack_bgra_pixel(bgra, format);
        translate::put_packed(buf, value, format);
    }
}

/// Converts a rectangle to its TPIXEL byte form.
fn tpixel_bytes(pixels: &[u8], format: &PixelFormat) -> Vec<u8> {
    if is_tpixel_format(format) {
        let mut out = Vec::with_capacity(pixels.len() / 4 * 3);
        for bgra in pixels.chunks_exact(4) {
            out.push(bgra[2]);
            out.push(bgra[1]);
            out.push(bgra[0]);
        }
        out
    } else {
        translate::convert(pixels, format).to_vec()
    }
}

/// The 1-3 byte compact length form.
#[allow(clippy::cast_possible_truncation)]
fn put_compact_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len < 0x4000 {
        buf.put_u8((len as u8 & 0x7F) | 0x80);
        buf.put_u8((len >> 7) as u8);
    } else {
        buf.put_u8((len as u8 & 0x7F) | 0x80);
        buf.put_u8(((len >> 7) as u8 & 0x7F) | 0x80);
        buf.put_u8((len >> 14) as u8);
    }
}

/// Compresses basic-mode data through a persistent stream, or sends it
/// raw below the compression threshold.
fn put_basic_data(
    buf: &mut BytesMut,
    data: &[u8],
    stream_id: usize,
    level: u32,
    ctx: &mut EncodeContext<'_>,
) -> Result<()> {
    if data.len() < TIGHT_MIN_TO_COMPRESS {
        buf.put_slice(data);
        return Ok(());
    }
    let stream = ctx.streams.tight(stream_id, level);
    let compressed = deflate_sync(stream, data).map_err(|e| stream_error("Tight deflate", e))?;
    put_compact_length(buf, compressed.len());
    buf.put_slice(&compressed);
    Ok(())
}

/// Solid fill: control byte then one TPIXEL.
fn encode_fill(bgra: &[u8; 4], format: &PixelFormat) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(TIGHT_FILL << 4);
    put_tpixel(&mut buf, format, bgra);
    buf
}

/// Two-colour rectangle: palette filter with a 1-bit bitmap, rows
/// byte-aligned, MSB first, 1 = foreground.
fn encode_mono(
    pixels: &[u8],
    width: u16,
    height: u16,
    bg: [u8; 4],
    fg: [u8; 4],
    ctx: &mut EncodeContext<'_>,
) -> Result<BytesMut> {
    let (_, mono_level, _) = zlib_levels(ctx.compression);
    let mut buf = BytesMut::new();
    buf.put_u8(((STREAM_MONO as u8) | TIGHT_EXPLICIT_FILTER) << 4);
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8(1); // palette size - 1
    put_tpixel(&mut buf, ctx.format, &bg);
    put_tpixel(&mut buf, ctx.format, &fg);

    let row_bytes = (width as usize).div_ceil(8);
    let mut bitmap = Vec::with_capacity(row_bytes * height as usize);
    for row in pixels.chunks_exact(width as usize * 4) {
        let mut byte = 0u8;
        let mut filled = 0;
        for bgra in row.chunks_exact(4) {
            let is_fg = bgra[0] == fg[0] && bgra[1] == fg[1] && bgra[2] == fg[2];
            byte = (byte << 1) | u8::from(is_fg);
            filled += 1;
            if filled == 8 {
                bitmap.push(byte);
                byte = 0;
                filled = 0;
            }
        }
        if filled > 0 {
            bitmap.push(byte << (8 - filled));
        }
    }

    put_basic_data(&mut buf, &bitmap, STREAM_MONO, mono_level, ctx)?;
    Ok(buf)
}

/// 3-16 colour rectangle: palette filter with one index byte per pixel.
#[allow(clippy::cast_possible_truncation)]
fn encode_indexed(
    pixels: &[u8],
    _width: u16,
    _height: u16,
    colors: &[[u8; 4]],
    ctx: &mut EncodeContext<'_>,
) -> Result<BytesMut> {
    let (indexed_level, _, _) = zlib_levels(ctx.compression);
    let mut buf = BytesMut::new();
    buf.put_u8(((STREAM_INDEXED as u8) | TIGHT_EXPLICIT_FILTER) << 4);
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8((colors.len() - 1) as u8);
    for color in colors {
        put_tpixel(&mut buf, ctx.format, color);
    }

    let mut indices = Vec::with_capacity(pixels.len() / 4);
    for bgra in pixels.chunks_exact(4) {
        let key = [bgra[0], bgra[1], bgra[2], 0];
        let idx = colors.iter().position(|c| *c == key).unwrap_or(0);
        indices.push(idx as u8);
    }

    put_basic_data(&mut buf, &indices, STREAM_INDEXED, indexed_level, ctx)?;
    Ok(buf)
}

/// Full-colour rectangle: TPIXELs through stream 0.
fn encode_full_color(
    pixels: &[u8],
    _width: u16,
    _height: u16,
    ctx: &mut EncodeContext<'_>,
) -> Result<BytesMut> {
    let (_, _, raw_level) = zlib_levels(ctx.compression);
    let mut buf = BytesMut::new();
    buf.put_u8((STREAM_FULL_COLOR as u8) << 4);
    let data = tpixel_bytes(pixels, ctx.format);
    put_basic_data(&mut buf, &data, STREAM_FULL_COLOR, raw_level, ctx)?;
    Ok(buf)
}

/// JPEG rectangle: lossy DCT compression of the RGB data.
#[cfg(feature = "turbojpeg")]
fn encode_jpeg(
    pixels: &[u8],
    width: u16,
    height: u16,
    ctx: &mut EncodeContext<'_>,
) -> Result<BytesMut> {
    use crate::jpeg::TurboJpegEncoder;

    let mut rgb = Vec::with_capacity(pixels.len() / 4 * 3);
    for bgra in pixels.chunks_exact(4) {
        rgb.push(bgra[2]);
        rgb.push(bgra[1]);
        rgb.push(bgra[0]);
    }

    let jpeg = TurboJpegEncoder::new()
        .and_then(|mut enc| enc.compress_rgb(&rgb, width, height, ctx.quality));
    match jpeg {
        Ok(data) => {
            let mut buf = BytesMut::with_capacity(4 + data.len());
            buf.put_u8(TIGHT_JPEG << 4);
            put_compact_length(&mut buf, data.len());
            buf.put_slice(&data);
            Ok(buf)
        }
        Err(err) => {
            log::warn!("TurboJPEG failed ({err}), sending full-colour instead");
            encode_full_color(pixels, width, height, ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CompressStreams;

    fn ctx<'a>(fmt: &'a PixelFormat, streams: &'a mut CompressStreams) -> EncodeContext<'a> {
        EncodeContext {
            format: fmt,
            quality: 80,
            compression: 6,
            jpeg_allowed: false,
            streams,
        }
    }

    #[test]
    fn compact_length_forms() {
        let mut buf = BytesMut::new();
        put_compact_length(&mut buf, 0x42);
        assert_eq!(&buf[..], &[0x42]);

        let mut buf = BytesMut::new();
        put_compact_length(&mut buf, 0x1234);
        assert_eq!(&buf[..], &[0xB4, 0x24]);

        let mut buf = BytesMut::new();
        put_compact_length(&mut buf, 0x0010_0000);
        assert_eq!(&buf[..], &[0x80, 0x80, 0x40]);
    }

    #[test]
    fn solid_rect_is_fill_mode() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        let bgra = [10u8, 20, 30, 0].repeat(64);
        let out = TightEncoding.encode(&bgra, 8, 8, &mut c).unwrap();
        // Control 0x80 then R, G, B.
        assert_eq!(&out[..], &[0x80, 30, 20, 10]);
    }

    #[test]
    fn mono_rect_has_palette_header() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        // 8x1: six background, two foreground pixels.
        let bg = [0u8, 0, 0, 0];
        let fg = [255u8, 255, 255, 0];
        let mut bgra = Vec::new();
        for i in 0..8 {
            bgra.extend_from_slice(if i < 6 { &bg } else { &fg });
        }
        let out = TightEncoding.encode(&bgra, 8, 1, &mut c).unwrap();
        assert_eq!(out[0], 0x50); // stream 1, explicit filter
        assert_eq!(out[1], TIGHT_FILTER_PALETTE);
        assert_eq!(out[2], 1);
        // bg TPIXEL black, fg TPIXEL white
        assert_eq!(&out[3..6], &[0, 0, 0]);
        assert_eq!(&out[6..9], &[255, 255, 255]);
        // 1-byte bitmap below the compression threshold: raw.
        assert_eq!(out[9], 0b0000_0011);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn full_color_compresses_through_stream_zero() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        // Gradient forces TrueColor classification.
        let mut bgra = Vec::new();
        for i in 0..256u32 {
            bgra.extend_from_slice(&[(i % 256) as u8, (i / 2) as u8, (i / 4) as u8, 0]);
        }
        let out = TightEncoding.encode(&bgra, 16, 16, &mut c).unwrap();
        assert_eq!(out[0], 0x00);
        // Compact length present because 768 bytes exceed the threshold.
        assert!(out.len() > 2);
    }

    #[test]
    fn tpixel_falls_back_to_full_pixels() {
        let fmt = PixelFormat::rgb565();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        let bgra = [0u8, 0, 255, 0].repeat(4);
        let out = TightEncoding.encode(&bgra, 2, 2, &mut c).unwrap();
        // Fill mode with a 2-byte RGB565 pixel.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 0x80);
        assert_eq!(u16::from_le_bytes([out[1], out[2]]), 0xF800);
    }
}
