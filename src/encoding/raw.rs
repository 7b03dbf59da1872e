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

//! Raw encoding (0): pixels in the client's format, uncompressed.
//!
//! The universal fallback. Bandwidth-heavy, but it never fails and every
//! client accepts it.

use super::{EncodeContext, Encoding};
use crate::error::Result;
use crate::protocol::ENCODING_RAW;
use crate::translate;
use bytes::BytesMut;

/// Implements the Raw encoding.
pub struct RawEncoding;

impl Encoding for RawEncoding {
    fn id(&self) -> i32 {
        ENCODING_RAW
    }

    fn encode(
        &self,
        pixels: &[u8],
        _width: u16,
        _height: u16,
        ctx: &mut EncodeContext<'_>,
    ) -> Result<BytesMut> {
        Ok(translate::convert(pixels, ctx.format))
    }
}
