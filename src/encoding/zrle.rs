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

//! ZRLE encoding (16): tiled palette/run-length compression behind a
//! persistent zlib stream.
//!
//! The rectangle is split into 64x64 tiles in raster order. Each tile
//! body starts with a subencoding byte:
//!
//! - `0`: raw CPIXELs
//! - `1`: solid tile, one CPIXEL
//! - `2..=16`: packed palette of that size; indices are bit-packed with
//!   `ceil(log2(n))` bits per pixel and every row padded to a byte
//!   boundary
//! - `128`: plain RLE of (CPIXEL, length) runs
//! - `130..=255`: palette RLE with palette size `sub - 128`
//!
//! Run lengths encode `run - 1` as a sum: bytes of 255 accumulate until a
//! final byte below 255. The concatenated tile bodies are deflated
//! through the connection's ZRLE stream, which is never reset, and the
//! result is framed with a `u32` length.

use super::common::{build_palette, cpixel_len, deflate_sync, extract_tile_values, put_cpixel};
use super::{stream_error, EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::ENCODING_ZRLE;
use crate::translate;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

const TILE_SIZE: usize = 64;

/// Implements the ZRLE encoding.
pub struct ZrleEncoding;

impl Encoding for ZrleEncoding {
    fn id(&self) -> i32 {
        ENCODING_ZRLE
    }

    fn uses_streams(&self) -> bool {
        true
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        let values = translate::pack_values(pixels, ctx.format);
        let width = width as usize;
        let height = height as usize;
        let mut body = BytesMut::new();

        for y in (0..height).step_by(TILE_SIZE) {
            for x in (0..width).step_by(TILE_SIZE) {
                let tile_w = TILE_SIZE.min(width - x);
                let tile_h = TILE_SIZE.min(height - y);
                let tile = extract_tile_values(&values, width, x, y, tile_w, tile_h);
                encode_tile(&mut body, &tile, tile_w, tile_h, ctx.format);
            }
        }

        let stream = ctx.streams.zrle(u32::from(ctx.compression.min(9)));
        let compressed =
            deflate_sync(stream, &body).map_err(|e| stream_error("ZRLE deflate", e))?;

        let mut out = BytesMut::with_capacity(4 + compressed.len());
        out.put_u32(compressed.len() as u32);
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

/// Statistics over a tile: RLE runs, isolated pixels, distinct colours.
fn analyze_runs(pixels: &[u32]) -> (usize, usize, usize) {
    let mut runs = 0;
    let mut singles = 0;
    let mut seen: HashMap<u32, ()> = HashMap::new();
    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        seen.entry(color).or_insert(());
        let mut run = 1;
        while i + run < pixels.len() && pixels[i + run] == color {
            run += 1;
        }
        if run == 1 {
            singles += 1;
        } else {
            runs += 1;
        }
        i += run;
    }
    (runs, singles, seen.len())
}

/// Picks and writes the cheapest subencoding for one tile.
fn encode_tile(
    buf: &mut BytesMut,
    tile: &[u32],
    width: usize,
    height: usize,
    format: &crate::protocol::PixelFormat,
) {
    let (runs, singles, distinct) = analyze_runs(tile);
    let cpixel = cpixel_len(format);

    if distinct == 1 {
        buf.put_u8(1);
        put_cpixel(buf, format, tile[0]);
        return;
    }

    let raw_bytes = width * height * cpixel;
    let mut best = TileMode::Raw;
    let mut best_bytes = raw_bytes;

    let plain_rle_bytes = (cpixel + 1) * (runs + singles);
    if plain_rle_bytes < best_bytes {
        best = TileMode::PlainRle;
        best_bytes = plain_rle_bytes;
    }

    if distinct <= 127 {
        let palette_rle_bytes = cpixel * distinct + 2 * runs + singles;
        if palette_rle_bytes < best_bytes {
            best = TileMode::PaletteRle;
            best_bytes = palette_rle_bytes;
        }

        if distinct <= 16 {
            let bits = packed_bits(distinct);
            let row_bytes = (width * bits).div_ceil(8);
            let packed_bytes = cpixel * distinct + row_bytes * height;
            if packed_bytes < best_bytes {
                best = TileMode::PackedPalette;
            }
        }
    }

    match best {
        TileMode::Raw => {
            buf.put_u8(0);
            for &value in tile {
                put_cpixel(buf, format, value);
            }
        }
        TileMode::PlainRle => {
            buf.put_u8(128);
            write_plain_rle(buf, tile, format);
        }
        TileMode::PackedPalette => {
            let (palette, index) = build_palette(tile);
            buf.put_u8(palette.len() as u8);
            for &color in &palette {
                put_cpixel(buf, format, color);
            }
            write_packed_indices(buf, tile, width, packed_bits(palette.len()), &index);
        }
        TileMode::PaletteRle => {
            let (palette, index) = build_palette(tile);
            buf.put_u8(128 | palette.len() as u8);
            for &color in &palette {
                put_cpixel(buf, format, color);
            }
            write_palette_rle(buf, tile, &index);
        }
    }
}

enum TileMode {
    Raw,
    PlainRle,
    PackedPalette,
    PaletteRle,
}

/// Index width for a packed palette of the given size.
fn packed_bits(palette_size: usize) -> usize {
    match palette_size {
        0..=2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

/// Bit-packs palette indices MSB-first, restarting at every row so each
/// row is byte aligned.
fn write_packed_indices(
    buf: &mut BytesMut,
    tile: &[u32],
    width: usize,
    bits: usize,
    index: &HashMap<u32, u8>,
) {
    for row in tile.chunks(width) {
        let mut byte = 0u8;
        let mut filled = 0usize;
        for &value in row {
            let idx = index[&value];
            byte |= idx << (8 - filled - bits);
            filled += bits;
            if filled == 8 {
                buf.put_u8(byte);
                byte = 0;
                filled = 0;
            }
        }
        if filled > 0 {
            buf.put_u8(byte);
        }
    }
}

/// Emits `run_length - 1` in the ZRLE sum form.
fn write_run_length(buf: &mut BytesMut, run_length: usize) {
    let mut remaining = run_length - 1;
    while remaining >= 255 {
        buf.put_u8(255);
        remaining -= 255;
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(remaining as u8);
}

fn write_plain_rle(buf: &mut BytesMut, tile: &[u32], format: &crate::protocol::PixelFormat) {
    let mut i = 0;
    while i < tile.len() {
        let color = tile[i];
        let mut run = 1;
        while i + run < tile.len() && tile[i + run] == color {
            run += 1;
        }
        put_cpixel(buf, format, color);
        write_run_length(buf, run);
        i += run;
    }
}

fn write_palette_rle(buf: &mut BytesMut, tile: &[u32], index: &HashMap<u32, u8>) {
    let mut i = 0;
    while i < tile.len() {
        let color = tile[i];
        let idx = index[&color];
        let mut run = 1;
        while i + run < tile.len() && tile[i + run] == color {
            run += 1;
        }
        if run == 1 {
            buf.put_u8(idx);
        } else {
            buf.put_u8(idx | 128);
            write_run_length(buf, run);
        }
        i += run;
    }
}
