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

//! Helpers shared across the rectangle encoders.
//!
//! Encoders operate on packed client-format pixel values (`u32`) produced
//! by [`crate::translate::pack_values`]; serialization helpers here put
//! those values on the wire with the right width and endianness,
//! including the ZRLE/Tight compressed-pixel forms.

use crate::protocol::PixelFormat;
use crate::translate::put_packed;
use bytes::{BufMut, BytesMut};
use flate2::{Compress, FlushCompress, Status};
use std::collections::HashMap;
use std::io;

/// A subrectangle of uniform colour inside a larger rectangle.
#[derive(Debug)]
pub struct Subrect {
    /// Packed client-format pixel value.
    pub color: u32,
    /// X offset within the enclosing rectangle.
    pub x: u16,
    /// Y offset within the enclosing rectangle.
    pub y: u16,
    /// Subrectangle width.
    pub w: u16,
    /// Subrectangle height.
    pub h: u16,
}

/// Writes a packed pixel value in the client's full pixel form.
#[inline]
pub fn put_pixel(buf: &mut BytesMut, format: &PixelFormat, value: u32) {
    put_packed(buf, value, format);
}

/// Bytes per ZRLE CPIXEL for a format.
///
/// A 32-bpp true-colour format whose colour fields all fit in three bytes
/// compresses each pixel to 3 bytes (RFC 6143 §7.7.5); everything else
/// uses the full pixel width.
#[must_use]
pub fn cpixel_len(format: &PixelFormat) -> usize {
    if format.true_colour_flag != 0 && format.bits_per_pixel == 32 && format.depth <= 24 {
        if fits_in_low_bytes(format) || fits_in_high_bytes(format) {
            return 3;
        }
    }
    format.bytes_per_pixel()
}

fn fits_in_low_bytes(format: &PixelFormat) -> bool {
    (u32::from(format.red_max) << format.red_shift) < (1 << 24)
        && (u32::from(format.green_max) << format.green_shift) < (1 << 24)
        && (u32::from(format.blue_max) << format.blue_shift) < (1 << 24)
}

fn fits_in_high_bytes(format: &PixelFormat) -> bool {
    format.red_shift > 7 && format.green_shift > 7 && format.blue_shift > 7
}

/// Writes a packed pixel value as a CPIXEL.
///
/// For the 3-byte form the bytes are the ones a client reads back into
/// the significant end of its pixel, honouring the declared endianness.
#[inline]
pub fn put_cpixel(buf: &mut BytesMut, format: &PixelFormat, value: u32) {
    if cpixel_len(format) != 3 {
        put_pixel(buf, format, value);
        return;
    }
    let big_endian = format.big_endian_flag != 0;
    let low = fits_in_low_bytes(format);
    if big_endian {
        let bytes = value.to_be_bytes();
        if low {
            buf.put_slice(&bytes[1..4]);
        } else {
            buf.put_slice(&bytes[0..3]);
        }
    } else {
        let bytes = value.to_le_bytes();
        if low {
            buf.put_slice(&bytes[0..3]);
        } else {
            buf.put_slice(&bytes[1..4]);
        }
    }
}

/// The most frequent pixel value in a rectangle.
#[must_use]
pub fn background_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map_or(pixels[0], |(color, _)| color)
}

/// Greedily covers all non-background pixels with maximal uniform
/// rectangles. The result is non-overlapping and, together with the
/// background, covers the input exactly.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn find_subrects(pixels: &[u32], width: usize, height: usize, bg_color: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg_color {
                continue;
            }
            let color = pixels[idx];

            // Widest run at (x, y), then grow downward.
            let mut run_w = 0;
            for test_x in x..width {
                let test_idx = y * width + test_x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                run_w = test_x - x + 1;
            }
            let mut run_h = 1;
            'rows: for test_y in (y + 1)..height {
                for test_x in x..(x + run_w) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'rows;
                    }
                }
                run_h = test_y - y + 1;
            }

            // Tallest run, then grow rightward; keep the larger cover.
            let mut col_h = 0;
            for test_y in y..height {
                let test_idx = test_y * width + x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                col_h = test_y - y + 1;
            }
            let mut col_w = 1;
            'cols: for test_x in (x + 1)..width {
                for test_y in y..(y + col_h) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'cols;
                    }
                }
                col_w = test_x - x + 1;
            }

            let (best_w, best_h) = if col_w * col_h > run_w * run_h {
                (col_w, col_h)
            } else {
                (run_w, run_h)
            };

            for dy in 0..best_h {
                for dx in 0..best_w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }

            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: best_w as u16,
                h: best_h as u16,
            });
        }
    }

    subrects
}

/// Copies one tile out of a rectangle's packed pixel values.
#[must_use]
pub fn extract_tile_values(
    pixels: &[u32],
    width: usize,
    x: usize,
    y: usize,
    tw: usize,
    th: usize,
) -> Vec<u32> {
    let mut tile = Vec::with_capacity(tw * th);
    for dy in 0..th {
        let start = (y + dy) * width + x;
        tile.extend_from_slice(&pixels[start..start + tw]);
    }
    tile
}

/// Classifies a tile as solid, two-colour, or multicolour.
/// Returns `(is_solid, is_mono, background, foreground)`.
#[must_use]
pub fn analyze_tile_colors(pixels: &[u32]) -> (bool, bool, u32, u32) {
    if pixels.is_empty() {
        return (true, true, 0, 0);
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }
    match counts.len() {
        1 => (true, true, pixels[0], 0),
        2 => {
            let mut sorted: Vec<_> = counts.into_iter().collect();
            sorted.sort_by_key(|&(_, count)| std::cmp::Reverse(count));
            (false, true, sorted[0].0, sorted[1].0)
        }
        _ => (false, false, background_color(pixels), 0),
    }
}

/// Builds a palette in first-appearance order with an index lookup.
/// Deterministic regardless of hash-map iteration order.
#[must_use]
pub fn build_palette(pixels: &[u32]) -> (Vec<u32>, HashMap<u32, u8>) {
    let mut palette = Vec::new();
    let mut index: HashMap<u32, u8> = HashMap::new();
    for &pixel in pixels {
        if !index.contains_key(&pixel) {
            if palette.len() >= 256 {
                break;
            }
            #[allow(clippy::cast_possible_truncation)]
            index.insert(pixel, palette.len() as u8);
            palette.push(pixel);
        }
    }
    (palette, index)
}

/// Runs `input` through a persistent deflate stream with a sync flush,
/// so the client can inflate this update without waiting for the next.
///
/// The stream's history window survives across calls; that continuity is
/// what the RFB zlib-family encodings require.
pub fn deflate_sync(compressor: &mut Compress, input: &[u8]) -> io::Result<Vec<u8>> {
    let base_in = compressor.total_in();
    let mut output = Vec::with_capacity(input.len() / 2 + 64);
    let mut chunk = vec![0u8; 32 * 1024];

    loop {
        let consumed = (compressor.total_in() - base_in) as usize;
        let before_out = compressor.total_out();
        let status = compressor
            .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let produced = (compressor.total_out() - before_out) as usize;
        output.extend_from_slice(&chunk[..produced]);

        let consumed = (compressor.total_in() - base_in) as usize;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // The sync flush is complete once all input is consumed
                // and the output chunk was not filled to the brim.
                if consumed == input.len() && produced < chunk.len() {
                    break;
                }
                if produced == 0 && consumed == input.len() {
                    break;
                }
            }
        }
    }

    if (compressor.total_in() - base_in) as usize != input.len() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "deflate did not consume the whole rectangle",
        ));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;

    #[test]
    fn cpixel_width_rules() {
        // Native 32bpp depth 24 with low-byte fields compresses to 3.
        assert_eq!(cpixel_len(&PixelFormat::bgra32()), 3);
        // 16bpp stays at 2 bytes.
        assert_eq!(cpixel_len(&PixelFormat::rgb565()), 2);
        // 8bpp stays at 1 byte.
        assert_eq!(cpixel_len(&PixelFormat::bgr233()), 1);
        // Depth 32... depth beyond 24 keeps the full 4 bytes.
        let mut deep = PixelFormat::bgra32();
        deep.depth = 32;
        assert_eq!(cpixel_len(&deep), 4);
    }

    #[test]
    fn cpixel_bytes_little_endian_low() {
        let fmt = PixelFormat::bgra32(); // B low byte
        let mut buf = BytesMut::new();
        // R=0x11 G=0x22 B=0x33 packed at shifts 16/8/0.
        put_cpixel(&mut buf, &fmt, 0x0011_2233);
        assert_eq!(&buf[..], &[0x33, 0x22, 0x11]);
    }

    #[test]
    fn background_is_most_frequent() {
        let pixels = [1u32, 2, 2, 3, 2, 1];
        assert_eq!(background_color(&pixels), 2);
    }

    #[test]
    fn subrects_cover_non_background_exactly() {
        // 4x3: background 0, an L of 5s.
        let pixels = [
            5, 0, 0, 0, //
            5, 0, 7, 7, //
            5, 0, 7, 7,
        ];
        let subrects = find_subrects(&pixels, 4, 3, 0);
        let mut covered = vec![false; pixels.len()];
        for sr in &subrects {
            for dy in 0..sr.h as usize {
                for dx in 0..sr.w as usize {
                    let idx = (sr.y as usize + dy) * 4 + sr.x as usize + dx;
                    assert!(!covered[idx], "subrects overlap");
                    covered[idx] = true;
                    assert_eq!(pixels[idx], sr.color);
                }
            }
        }
        for (idx, &p) in pixels.iter().enumerate() {
            assert_eq!(covered[idx], p != 0, "coverage mismatch at {idx}");
        }
    }

    #[test]
    fn palette_is_first_appearance_ordered() {
        let pixels = [9u32, 4, 9, 7, 4, 1];
        let (palette, index) = build_palette(&pixels);
        assert_eq!(palette, vec![9, 4, 7, 1]);
        assert_eq!(index[&7], 2);
    }

    #[test]
    fn deflate_sync_round_trips_and_keeps_state() {
        use flate2::{Decompress, FlushDecompress};
        let mut comp = Compress::new(Compression::new(6), true);
        let a = deflate_sync(&mut comp, b"hello hello hello").unwrap();
        let b = deflate_sync(&mut comp, b"hello again again").unwrap();

        // A single inflater must decode both chunks in sequence.
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        let mut inflater = Decompress::new(true);
        let mut out = vec![0u8; 1024];
        inflater
            .decompress(&stream, &mut out, FlushDecompress::Sync)
            .unwrap();
        let produced = inflater.total_out() as usize;
        assert_eq!(&out[..produced], b"hello hello hellohello again again");
    }

    #[test]
    fn deflate_sync_handles_large_input() {
        let mut comp = Compress::new(Compression::new(1), true);
        let input = vec![0xA5u8; 512 * 1024];
        let out = deflate_sync(&mut comp, &input).unwrap();
        assert!(!out.is_empty());
    }
}
