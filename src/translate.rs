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

//! Pixel conversion from the server's BGRA snapshot to client formats.
//!
//! The server keeps every snapshot as BGRA bytes (blue first in memory,
//! which is 32 bpp little-endian with red shift 16). Clients may ask for
//! anything the protocol allows; conversion scales each 8-bit channel to
//! the client's max values by integer arithmetic, packs the result at the
//! declared shifts, and serializes with the declared endianness. Alpha is
//! dropped: RFB carries no alpha channel, the fourth byte of a 32-bit
//! pixel is padding.
//!
//! Conversion is direct per-pixel arithmetic rather than lookup tables;
//! the optimizer does well on this shape and the memcpy fast path covers
//! the dominant case of an unchanged format.

use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};

/// Converts BGRA pixels to the client's wire format.
///
/// Output length is exactly `pixel_count * format.bytes_per_pixel()`.
#[must_use]
pub fn convert(src_bgra: &[u8], format: &PixelFormat) -> BytesMut {
    debug_assert_eq!(src_bgra.len() % 4, 0, "snapshot pixels are 4-byte BGRA");

    // Fast path: the client wants exactly what the snapshot stores.
    if format.is_native_bgra32() {
        return BytesMut::from(src_bgra);
    }

    let pixel_count = src_bgra.len() / 4;
    let mut dst = BytesMut::with_capacity(pixel_count * format.bytes_per_pixel());
    for bgra in src_bgra.chunks_exact(4) {
        let value = pack_bgra_pixel(bgra, format);
        put_packed(&mut dst, value, format);
    }
    dst
}

/// Packs every pixel into its client-format value without serializing.
///
/// Encoders that work on whole pixels (palette analysis, run detection)
/// operate on these values and serialize them at emission time.
#[must_use]
pub fn pack_values(src_bgra: &[u8], format: &PixelFormat) -> Vec<u32> {
    src_bgra
        .chunks_exact(4)
        .map(|bgra| pack_bgra_pixel(bgra, format))
        .collect()
}

/// Packs one BGRA pixel into the client-format integer value.
#[inline]
#[must_use]
pub fn pack_bgra_pixel(bgra: &[u8], format: &PixelFormat) -> u32 {
    let b = bgra[0];
    let g = bgra[1];
    let r = bgra[2];
    (u32::from(downscale(r, format.red_max)) << format.red_shift)
        | (u32::from(downscale(g, format.green_max)) << format.green_shift)
        | (u32::from(downscale(b, format.blue_max)) << format.blue_shift)
}

/// Serializes one packed pixel value with the format's width and
/// endianness.
#[inline]
pub fn put_packed(dst: &mut BytesMut, value: u32, format: &PixelFormat) {
    #[allow(clippy::cast_possible_truncation)]
    match format.bits_per_pixel {
        8 => dst.put_u8(value as u8),
        16 => {
            if format.big_endian_flag != 0 {
                dst.put_u16(value as u16);
            } else {
                dst.put_u16_le(value as u16);
            }
        }
        _ => {
            if format.big_endian_flag != 0 {
                dst.put_u32(value);
            } else {
                dst.put_u32_le(value);
            }
        }
    }
}

/// Scales an 8-bit channel down to a `max`-bounded field.
#[inline]
fn downscale(value: u8, max: u16) -> u16 {
    if max == 255 {
        return u16::from(value);
    }
    if max == 0 {
        return 0;
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_format_is_verbatim() {
        let src = vec![10u8, 20, 30, 255, 40, 50, 60, 0];
        let out = convert(&src, &PixelFormat::bgra32());
        assert_eq!(&out[..], &src[..]);
    }

    #[test]
    fn rgb565_quantisation() {
        // Pure red BGRA -> RGB565 0xF800
        let src = vec![0u8, 0, 255, 255];
        let out = convert(&src, &PixelFormat::rgb565());
        assert_eq!(out.len(), 2);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0xF800);

        // Pure green -> 0x07E0
        let src = vec![0u8, 255, 0, 255];
        let out = convert(&src, &PixelFormat::rgb565());
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0x07E0);

        // Pure blue -> 0x001F
        let src = vec![255u8, 0, 0, 255];
        let out = convert(&src, &PixelFormat::rgb565());
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0x001F);
    }

    #[test]
    fn big_endian_serialization() {
        let mut fmt = PixelFormat::rgb565();
        fmt.big_endian_flag = 1;
        let src = vec![0u8, 0, 255, 255];
        let out = convert(&src, &fmt);
        assert_eq!(u16::from_be_bytes([out[0], out[1]]), 0xF800);
    }

    #[test]
    fn bgr233_packing() {
        // White maps to all fields at max: r=7, g=7<<3, b=3<<6
        let src = vec![255u8, 255, 255, 255];
        let out = convert(&src, &PixelFormat::bgr233());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], 7 | (7 << 3) | (3 << 6));
    }

    #[test]
    fn output_length_matches_bpp() {
        let src = vec![1u8; 16]; // 4 pixels
        for fmt in [
            PixelFormat::bgra32(),
            PixelFormat::rgb565(),
            PixelFormat::bgr233(),
        ] {
            let out = convert(&src, &fmt);
            assert_eq!(out.len(), 4 * fmt.bytes_per_pixel());
        }
    }

    #[test]
    fn downscale_bounds() {
        assert_eq!(downscale(0, 31), 0);
        assert_eq!(downscale(255, 31), 31);
        assert_eq!(downscale(128, 31), 15);
        assert_eq!(downscale(128, 255), 128);
    }

    #[test]
    fn non_native_32bpp_shifts() {
        // RGBA-style layout: red in the low byte.
        let fmt = PixelFormat {
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
            ..PixelFormat::bgra32()
        };
        let src = vec![30u8, 20, 10, 255]; // B=30 G=20 R=10
        let out = convert(&src, &fmt);
        assert_eq!(&out[..], &[10, 20, 30, 0]);
    }
}
