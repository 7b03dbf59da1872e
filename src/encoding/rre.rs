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

//! RRE encoding (2): background colour plus coloured subrectangles.
//!
//! Wire format: `u32 count`, background pixel, then for each subrectangle
//! a pixel followed by `u16 x, y, w, h`. Effective for near-solid content
//! where the subrectangle list stays short.

use super::common::{background_color, find_subrects, put_pixel};
use super::{EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::ENCODING_RRE;
use crate::translate;
use bytes::{BufMut, BytesMut};

/// Implements the RRE encoding.
pub struct RreEncoding;

impl Encoding for RreEncoding {
    fn id(&self) -> i32 {
        ENCODING_RRE
    }

    #[allow(clippy::cast_possible_truncation)] // subrect count bounded by rect area
    fn encode(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        let values = translate::pack_values(pixels, ctx.format);
        let bg = background_color(&values);
        let subrects = find_subrects(&values, width as usize, height as usize, bg);

        let bpp = ctx.format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 8));
        buf.put_u32(subrects.len() as u32);
        put_pixel(&mut buf, ctx.format, bg);
        for sr in subrects {
            put_pixel(&mut buf, ctx.format, sr.color);
            buf.put_u16(sr.x);
            buf.put_u16(sr.y);
            buf.put_u16(sr.w);
            buf.put_u16(sr.h);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CompressStreams;
    use crate::protocol::PixelFormat;

    #[test]
    fn solid_rect_has_no_subrects() {
        let mut streams = CompressStreams::new();
        let fmt = PixelFormat::bgra32();
        let mut ctx = EncodeContext {
            format: &fmt,
            quality: 80,
            compression: 6,
            jpeg_allowed: false,
            streams: &mut streams,
        };
        let bgra = [7u8, 8, 9, 0].repeat(16); // 4x4 solid
        let out = RreEncoding.encode(&bgra, 4, 4, &mut ctx).unwrap();
        // count (4) + one background pixel (4)
        assert_eq!(out.len(), 8);
        assert_eq!(u32::from_be_bytes([out[0], out[1], out[2], out[3]]), 0);
        assert_eq!(&out[4..8], &[7, 8, 9, 0]);
    }

    #[test]
    fn foreground_block_becomes_one_subrect() {
        let mut streams = CompressStreams::new();
        let fmt = PixelFormat::bgra32();
        let mut ctx = EncodeContext {
            format: &fmt,
            quality: 80,
            compression: 6,
            jpeg_allowed: false,
            streams: &mut streams,
        };
        // 4x2 background, 2x1 foreground at (1, 0).
        let bg = [0u8, 0, 0, 0];
        let fg = [255u8, 255, 255, 0];
        let mut bgra = Vec::new();
        for y in 0..2 {
            for x in 0..4 {
                if y == 0 && (x == 1 || x == 2) {
                    bgra.extend_from_slice(&fg);
                } else {
                    bgra.extend_from_slice(&bg);
                }
            }
        }
        let out = RreEncoding.encode(&bgra, 4, 2, &mut ctx).unwrap();
        let count = u32::from_be_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(count, 1);
        // subrect pixel then x=1 y=0 w=2 h=1
        let sub = &out[8..];
        assert_eq!(&sub[0..4], &fg);
        assert_eq!(u16::from_be_bytes([sub[4], sub[5]]), 1);
        assert_eq!(u16::from_be_bytes([sub[6], sub[7]]), 0);
        assert_eq!(u16::from_be_bytes([sub[8], sub[9]]), 2);
        assert_eq!(u16::from_be_bytes([sub[10], sub[11]]), 1);
    }
}
