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

//! Hextile encoding (5): 16x16 tiles with per-tile subencodings.
//!
//! Tiles are emitted in raster order; right and bottom edge tiles may be
//! narrower. Each tile starts with a subencoding byte whose flags say
//! whether the tile is raw, whether background/foreground pixels follow,
//! and whether subrectangles (coloured or monochrome) follow. Background
//! and foreground carry over between tiles when their flags are absent,
//! so the encoder always specifies them on the first tile that needs
//! them.

use super::common::{analyze_tile_colors, extract_tile_values, find_subrects, put_pixel};
use super::{EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::{
    ENCODING_HEXTILE, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED,
    HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};
use crate::translate;
use bytes::{BufMut, BytesMut};

/// Implements the Hextile encoding.
pub struct HextileEncoding;

impl Encoding for HextileEncoding {
    fn id(&self) -> i32 {
        ENCODING_HEXTILE
    }

    #[allow(clippy::cast_possible_truncation)] // tile coordinates fit in a nibble
    fn encode(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        let values = translate::pack_values(pixels, ctx.format);
        let bpp = ctx.format.bytes_per_pixel();
        let mut buf = BytesMut::new();

        let mut last_bg: Option<u32> = None;
        let mut last_fg: Option<u32> = None;

        for tile_y in (0..height).step_by(16) {
            for tile_x in (0..width).step_by(16) {
                let tile_w = 16.min(width - tile_x);
                let tile_h = 16.min(height - tile_y);
                let tile = extract_tile_values(
                    &values,
                    width as usize,
                    tile_x as usize,
                    tile_y as usize,
                    tile_w as usize,
                    tile_h as usize,
                );

                let (is_solid, is_mono, bg, fg) = analyze_tile_colors(&tile);

                let tile_start = buf.len();
                buf.put_u8(0); // subencoding, patched below
                let mut subencoding: u8 = 0;

                if is_solid {
                    if last_bg != Some(bg) {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        put_pixel(&mut buf, ctx.format, bg);
                        last_bg = Some(bg);
                    }
                    buf[tile_start] = subencoding;
                    continue;
                }

                let subrects =
                    find_subrects(&tile, tile_w as usize, tile_h as usize, bg);

                // Raw wins when the subrect form would be bigger or the
                // count overflows its u8.
                let raw_size = tile.len() * bpp;
                let bg_cost = if last_bg == Some(bg) { 0 } else { bpp };
                let fg_cost = if is_mono && last_fg != Some(fg) { bpp } else { 0 };
                let subrect_cost = subrects.len() * if is_mono { 2 } else { 2 + bpp };
                let encoded_size = bg_cost + fg_cost + 1 + subrect_cost;

                if subrects.is_empty() || subrects.len() > 255 || encoded_size > raw_size {
                    buf.truncate(tile_start);
                    buf.put_u8(HEXTILE_RAW);
                    for &value in &tile {
                        put_pixel(&mut buf, ctx.format, value);
                    }
                    // Raw tiles invalidate the carried colours.
                    last_bg = None;
                    last_fg = None;
                    continue;
                }

                if last_bg != Some(bg) {
                    subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                    put_pixel(&mut buf, ctx.format, bg);
                    last_bg = Some(bg);
                }

                subencoding |= HEXTILE_ANY_SUBRECTS;

                if is_mono {
                    if last_fg != Some(fg) {
                        subencoding |= HEXTILE_FOREGROUND_SPECIFIED;
                        put_pixel(&mut buf, ctx.format, fg);
                        last_fg = Some(fg);
                    }
                    buf.put_u8(subrects.len() as u8);
                    for sr in subrects {
                        buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                        buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                    }
                } else {
                    subencoding |= HEXTILE_SUBRECTS_COLOURED;
                    last_fg = None;
                    buf.put_u8(subrects.len() as u8);
                    for sr in subrects {
                        put_pixel(&mut buf, ctx.format, sr.color);
                        buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                        buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                    }
                }

                buf[tile_start] = subencoding;
            }
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CompressStreams;
    use crate::protocol::PixelFormat;

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
    fn solid_frame_is_one_background_then_inherits() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        // 32x16: two tiles, same colour.
        let bgra = [1u8, 2, 3, 0].repeat(32 * 16);
        let out = HextileEncoding.encode(&bgra, 32, 16, &mut c).unwrap();
        // Tile 1: subencoding + background pixel; tile 2 inherits.
        assert_eq!(out.len(), 1 + 4 + 1);
        assert_eq!(out[0], HEXTILE_BACKGROUND_SPECIFIED);
        assert_eq!(&out[1..5], &[1, 2, 3, 0]);
        assert_eq!(out[5], 0);
    }

    #[test]
    fn mono_tile_uses_packed_subrects() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        // 16x16 background with a 2x2 foreground block at (4, 5).
        let bg = [0u8, 0, 0, 0];
        let fg = [9u8, 9, 9, 0];
        let mut bgra = Vec::new();
        for y in 0..16u16 {
            for x in 0..16u16 {
                if (4..6).contains(&x) && (5..7).contains(&y) {
                    bgra.extend_from_slice(&fg);
                } else {
                    bgra.extend_from_slice(&bg);
                }
            }
        }
        let out = HextileEncoding.encode(&bgra, 16, 16, &mut c).unwrap();
        assert_eq!(
            out[0],
            HEXTILE_BACKGROUND_SPECIFIED
                | HEXTILE_FOREGROUND_SPECIFIED
                | HEXTILE_ANY_SUBRECTS
        );
        // bg pixel, fg pixel, count, then one packed subrect.
        assert_eq!(&out[1..5], &bg);
        assert_eq!(&out[5..9], &fg);
        assert_eq!(out[9], 1);
        assert_eq!(out[10], (4 << 4) | 5); // x=4 y=5
        assert_eq!(out[11], (1 << 4) | 1); // w-1=1 h-1=1
        assert_eq!(out.len(), 12);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let fmt = PixelFormat::bgr233();
        let mut streams = CompressStreams::new();
        let mut c = ctx(&fmt, &mut streams);
        // 20x18 solid: tiles 16x16, 4x16, 16x2, 4x2.
        let bgra = [3u8, 3, 3, 0].repeat(20 * 18);
        let out = HextileEncoding.encode(&bgra, 20, 18, &mut c).unwrap();
        // First tile announces the background (1 byte for 8bpp), the
        // remaining three inherit.
        assert_eq!(out.len(), (1 + 1) + 1 + 1 + 1);
    }
}
