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

//! Framebuffer snapshots.
//!
//! Each connection owns one [`Snapshot`]: the pixels of the last frame it
//! sent, kept in the server's BGRA layout. The snapshot feeds the change
//! detector, supplies rectangle pixel data to the encoders, and is the
//! source side of CopyRect detection.

use crate::protocol::Rect;
use crate::source::Capture;

/// A contiguous BGRA pixel buffer with its dimensions.
///
/// Owned by a single connection and written only by its capture step.
#[derive(Debug, Clone)]
pub struct Snapshot {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
}

impl Snapshot {
    /// Creates an empty snapshot; the first capture sizes it.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        }
    }

    /// Builds a snapshot from a capture, applying the configured
    /// downscale when it is not 1.0. Returns the snapshot.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_capture(capture: &Capture, scale_factor: f64) -> Self {
        if (scale_factor - 1.0).abs() < f64::EPSILON || scale_factor <= 0.0 {
            return Self {
                width: capture.width as u16,
                height: capture.height as u16,
                pixels: capture.pixels.clone(),
            };
        }

        // Nearest-neighbour downscale.
        let src_w = capture.width as usize;
        let src_h = capture.height as usize;
        let dst_w = ((capture.width as f64) * scale_factor).round().max(1.0) as usize;
        let dst_h = ((capture.height as f64) * scale_factor).round().max(1.0) as usize;
        let mut pixels = Vec::with_capacity(dst_w * dst_h * 4);
        for dy in 0..dst_h {
            let sy = (dy * src_h / dst_h).min(src_h - 1);
            for dx in 0..dst_w {
                let sx = (dx * src_w / dst_w).min(src_w - 1);
                let off = (sy * src_w + sx) * 4;
                pixels.extend_from_slice(&capture.pixels[off..off + 4]);
            }
        }
        Self {
            width: dst_w as u16,
            height: dst_h as u16,
            pixels,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// True before the first capture has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// The full BGRA buffer.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Whether another snapshot has the same dimensions.
    #[must_use]
    pub fn same_dimensions(&self, other: &Snapshot) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// One row segment as a BGRA byte slice.
    #[must_use]
    pub fn row(&self, x: u16, y: u16, w: u16) -> &[u8] {
        let start = (y as usize * self.width as usize + x as usize) * 4;
        &self.pixels[start..start + w as usize * 4]
    }

    /// Copies a rectangle out as contiguous BGRA bytes.
    #[must_use]
    pub fn extract_rect(&self, rect: &Rect) -> Vec<u8> {
        let mut out = Vec::with_capacity(rect.area() * 4);
        for dy in 0..rect.h {
            out.extend_from_slice(self.row(rect.x, rect.y + dy, rect.w));
        }
        out
    }

    /// Fraction of sampled pixels that equal the rectangle's dominant
    /// colour, with that colour's BGRA bytes. Sampling caps the cost on
    /// large rectangles; the content hint only needs a coarse answer.
    #[must_use]
    pub fn solid_fraction(&self, rect: &Rect) -> (f64, [u8; 4]) {
        const MAX_SAMPLES: usize = 1024;
        let area = rect.area();
        if area == 0 {
            return (0.0, [0; 4]);
        }
        let step = (area / MAX_SAMPLES).max(1);

        let mut counts: std::collections::HashMap<[u8; 4], usize> = std::collections::HashMap::new();
        let mut sampled = 0usize;
        let mut idx = 0usize;
        while idx < area {
            let px = rect.x + (idx % rect.w as usize) as u16;
            let py = rect.y + (idx / rect.w as usize) as u16;
            let off = (py as usize * self.width as usize + px as usize) * 4;
            let pixel = [
                self.pixels[off],
                self.pixels[off + 1],
                self.pixels[off + 2],
                self.pixels[off + 3],
            ];
            *counts.entry(pixel).or_insert(0) += 1;
            sampled += 1;
            idx += step;
        }

        let (color, count) = counts
            .into_iter()
            .max_by_key(|(_, c)| *c)
            .unwrap_or(([0; 4], 0));
        (count as f64 / sampled as f64, color)
    }
}

/// Offsets probed by the vertical scroll search, nearest first.
/// Positive means content moved up (the source lies below the
/// destination in the previous frame).
const SCROLL_PROBE_OFFSETS: [i32; 10] = [8, -8, 16, -16, 32, -32, 64, -64, 128, -128];

/// A verified scroll within a dirty rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollMatch {
    /// Destination of the CopyRect.
    pub dest: Rect,
    /// Source x in the client's (previous) framebuffer.
    pub src_x: u16,
    /// Source y in the client's (previous) framebuffer.
    pub src_y: u16,
    /// Strip of newly exposed pixels not covered by the copy, if any.
    pub exposed: Option<Rect>,
}

/// Probes a dirty rectangle for a vertical scroll against the previous
/// snapshot.
///
/// For each bounded offset the overlapping rows are compared
/// byte-for-byte, so an emitted CopyRect is correct by construction: the
/// previous frame at the source equals the current frame at the
/// destination. The strip the scroll uncovered is returned separately
/// for normal encoding. The probe requires the copied part to cover the
/// majority of the rectangle; anything less encodes cheaper directly.
#[must_use]
pub fn find_vertical_scroll(prev: &Snapshot, current: &Snapshot, rect: &Rect) -> Option<ScrollMatch> {
    if prev.is_empty() || !prev.same_dimensions(current) {
        return None;
    }
    if rect.area() < 4096 {
        return None;
    }

    for dy in SCROLL_PROBE_OFFSETS {
        let shift = dy.unsigned_abs() as u16;
        if shift >= rect.h || u32::from(rect.h - shift) * u32::from(rect.w) * 2
            < u32::from(rect.h) * u32::from(rect.w)
        {
            continue;
        }
        let copy_h = rect.h - shift;

        // Content moved up: destination rows are the top of the rect,
        // the source sits `shift` rows lower in the previous frame.
        // Content moved down mirrors that.
        let (dest_y, src_y, exposed_y) = if dy > 0 {
            (rect.y, rect.y + shift, rect.y + copy_h)
        } else {
            (rect.y + shift, rect.y, rect.y)
        };
        if src_y + copy_h > prev.height() {
            continue;
        }

        // Quick reject on the first row, then confirm the whole copy.
        if prev.row(rect.x, src_y, rect.w) != current.row(rect.x, dest_y, rect.w) {
            continue;
        }
        let matches = (1..copy_h).all(|row| {
            prev.row(rect.x, src_y + row, rect.w) == current.row(rect.x, dest_y + row, rect.w)
        });
        if !matches {
            continue;
        }

        let exposed = if shift > 0 {
            Some(Rect::new(rect.x, exposed_y, rect.w, shift))
        } else {
            None
        };
        return Some(ScrollMatch {
            dest: Rect::new(rect.x, dest_y, rect.w, copy_h),
            src_x: rect.x,
            src_y,
            exposed,
        });
    }
    None
}
