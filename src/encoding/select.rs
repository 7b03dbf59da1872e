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

//! Per-rectangle encoder selection.
//!
//! The selector combines what the client advertised, what the server has
//! enabled, a content hint for the rectangle, and the connection's
//! network profile into one encoding choice. CopyRect never reaches the
//! selector: the scheduler emits it directly once a verified source
//! region exists.

use crate::config::{LanTuning, NetworkProfile, ServerConfig};
use crate::protocol::{
    ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_TIGHT, ENCODING_ZLIB, ENCODING_ZRLE,
};

/// What the rectangle's content looks like, derived by the scheduler
/// from the change detector and snapshot sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHint {
    /// Region changed once; not seen changing recently.
    Static,
    /// Region keeps changing frame over frame.
    Dynamic,
    /// Region is a verified translation of prior content.
    Scrolling,
    /// At least 95% of sampled pixels share one colour.
    Solid,
}

/// A selector decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// The chosen wire encoding.
    pub encoding: i32,
    /// Whether the Tight encoder should use its JPEG mode.
    pub use_jpeg: bool,
}

impl Selection {
    fn plain(encoding: i32) -> Self {
        Self {
            encoding,
            use_jpeg: false,
        }
    }
}

/// Per-connection encoder selector.
///
/// Holds the server-side availability flags; per-call inputs carry the
/// client's preference list and the rectangle's properties.
#[derive(Debug)]
pub struct EncoderSelector {
    tight_enabled: bool,
    tight_ultravnc_workaround: bool,
    jpeg_enabled: bool,
    lan: LanTuning,
}

/// Rectangle-specific inputs to a selection.
#[derive(Debug)]
pub struct SelectionInputs<'a> {
    /// The client's SetEncodings list in preference order.
    pub client_encodings: &'a [i32],
    /// Content hint for this rectangle.
    pub hint: ContentHint,
    /// Rectangle area as a fraction of the framebuffer.
    pub area_fraction: f64,
    /// Rectangle area in pixels.
    pub pixel_count: usize,
    /// Rectangle width in pixels.
    pub width: u16,
    /// The connection's network profile.
    pub profile: NetworkProfile,
    /// Updates sent so far; Zlib is withheld during its warm-up window.
    pub updates_sent: u32,
    /// True when the client looks like an UltraVNC viewer.
    pub ultravnc: bool,
}

/// Tight rectangles must not exceed this width.
const TIGHT_MAX_WIDTH: u16 = 2048;

impl EncoderSelector {
    /// Builds a selector from the server configuration.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            tight_enabled: config.enable_tight_encoding,
            tight_ultravnc_workaround: config.tight_disable_for_ultravnc,
            jpeg_enabled: config.enable_jpeg_encoding,
            lan: config.lan.clone(),
        }
    }

    /// Picks an encoding for one rectangle. First matching rule wins;
    /// everything is restricted to encodings the client listed.
    #[must_use]
    pub fn select(&self, inputs: &SelectionInputs<'_>) -> Selection {
        let supports = |id: i32| inputs.client_encodings.contains(&id);
        let tight_ok = self.tight_enabled
            && supports(ENCODING_TIGHT)
            && inputs.width <= TIGHT_MAX_WIDTH
            && !(self.tight_ultravnc_workaround && inputs.ultravnc);

        // Solid content compresses to nothing under RRE.
        if inputs.hint == ContentHint::Solid && supports(ENCODING_RRE) {
            return Selection::plain(ENCODING_RRE);
        }

        match inputs.profile {
            NetworkProfile::Localhost => Selection::plain(ENCODING_RAW),
            NetworkProfile::Wan => {
                if supports(ENCODING_ZRLE) {
                    Selection::plain(ENCODING_ZRLE)
                } else if supports(ENCODING_HEXTILE) {
                    Selection::plain(ENCODING_HEXTILE)
                } else {
                    self.fallback(inputs)
                }
            }
            NetworkProfile::Lan => {
                if inputs.area_fraction < self.lan.raw_area_threshold
                    && inputs.pixel_count < self.lan.raw_max_pixels
                {
                    return Selection::plain(ENCODING_RAW);
                }
                if self.lan.prefer_zlib
                    && supports(ENCODING_ZLIB)
                    && inputs.area_fraction >= self.lan.zlib_area_threshold
                    && inputs.pixel_count >= self.lan.zlib_min_pixels
                    && inputs.updates_sent >= self.lan.zlib_warmup_requests
                {
                    return Selection::plain(ENCODING_ZLIB);
                }
                if self.jpeg_enabled
                    && tight_ok
                    && inputs.hint == ContentHint::Dynamic
                    && inputs.area_fraction >= self.lan.jpeg_area_threshold
                    && inputs.pixel_count >= self.lan.jpeg_min_pixels
                {
                    return Selection {
                        encoding: ENCODING_TIGHT,
                        use_jpeg: true,
                    };
                }
                if supports(ENCODING_ZRLE) {
                    return Selection::plain(ENCODING_ZRLE);
                }
                self.fallback(inputs)
            }
        }
    }

    /// Fallback chain restricted to what the client listed, honouring
    /// the client's own ordering between the chain members.
    fn fallback(&self, inputs: &SelectionInputs<'_>) -> Selection {
        for &id in inputs.client_encodings {
            if id == ENCODING_HEXTILE || id == ENCODING_RRE {
                return Selection::plain(id);
            }
        }
        Selection::plain(ENCODING_RAW)
    }

    /// Deflate level for the chosen encoding under the current profile.
    #[must_use]
    pub fn compression_level(&self, encoding: i32, profile: NetworkProfile) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        match (encoding, profile) {
            (ENCODING_ZRLE, NetworkProfile::Wan) => 6,
            (ENCODING_ZRLE, _) => self.lan.zrle_compression_level as u8,
            (ENCODING_ZLIB, _) => self.lan.zlib_compression_level as u8,
            _ => 6,
        }
    }
}
