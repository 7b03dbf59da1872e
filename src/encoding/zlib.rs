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

//! Zlib encoding (6): raw client-format pixels through a persistent
//! deflate stream, framed with a `u32` compressed length.

use super::common::deflate_sync;
use super::{stream_error, EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::ENCODING_ZLIB;
use crate::translate;
use bytes::{BufMut, BytesMut};

/// Implements the Zlib encoding.
pub struct ZlibEncoding;

impl Encoding for ZlibEncoding {
    fn id(&self) -> i32 {
        ENCODING_ZLIB
    }

    fn uses_streams(&self) -> bool {
        true
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(
        &self,
        pixels: &[u8],
        _width: u16,
        _height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        let raw = translate::convert(pixels, ctx.format);
        let stream = ctx.streams.zlib(u32::from(ctx.compression.min(9)));
        let compressed =
            deflate_sync(stream, &raw).map_err(|e| stream_error("Zlib deflate", e))?;

        let mut out = BytesMut::with_capacity(4 + compressed.len());
        out.put_u32(compressed.len() as u32);
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CompressStreams;
    use crate::protocol::PixelFormat;
    use flate2::{Decompress, FlushDecompress};

    #[test]
    fn stream_survives_across_rectangles() {
        let fmt = PixelFormat::bgra32();
        let mut streams = CompressStreams::new();
        let bgra = [4u8, 5, 6, 0].repeat(64);

        let mut first = BytesMut::new();
        let mut second = BytesMut::new();
        for out in [&mut first, &mut second] {
            let mut ctx = EncodeContext {
                format: &fmt,
                quality: 80,
                compression: 6,
                jpeg_allowed: false,
                streams: &mut streams,
            };
            *out = ZlibEncoding.encode(&bgra, 8, 8, &mut ctx).unwrap();
        }

        // One inflater must decode both updates in sequence.
        let mut wire = Vec::new();
        wire.extend_from_slice(&first[4..]);
        wire.extend_from_slice(&second[4..]);
        let mut inflater = Decompress::new(true);
        let mut plain = vec![0u8; 4096];
        inflater
            .decompress(&wire, &mut plain, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(inflater.total_out() as usize, bgra.len() * 2);
        assert_eq!(&plain[..bgra.len()], &bgra[..]);
    }

    #[test]
    fn length_prefix_matches_payload() {
        let fmt = PixelFormat::rgb565();
        let mut streams = CompressStreams::new();
        let mut ctx = EncodeContext {
            format: &fmt,
            quality: 80,
            compression: 6,
            jpeg_allowed: false,
            streams: &mut streams,
        };
        let bgra = [1u8, 2, 3, 0].repeat(16);
        let out = ZlibEncoding.encode(&bgra, 4, 4, &mut ctx).unwrap();
        let len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(out.len(), 4 + len);
    }
}
