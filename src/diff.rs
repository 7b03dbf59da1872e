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

//! Tile-hashed change detection.
//!
//! The detector covers the framebuffer with a grid of 64x64 tiles and
//! remembers a 16-byte content hash per tile. Each scan hashes the new
//! frame, marks tiles whose hash is unseeded or changed, and merges the
//! dirty tiles into a small set of covering rectangles. Hashes are
//! SHA-256 truncated to 128 bits; cryptographic strength is incidental,
//! collision resistance across frames is what matters.

use crate::framebuffer::Snapshot;
use crate::protocol::Rect;
use sha2::{Digest, Sha256};

/// Tile edge length in pixels.
pub const TILE_SIZE: usize = 64;

/// Above this dirty-tile fraction a scan collapses to one full-frame
/// rectangle.
const FULL_UPDATE_FRACTION: f64 = 0.75;

/// Maximum rectangles a scan may emit; beyond this the closest pairs are
/// merged.
const MAX_RECTS: usize = 32;

/// Result of scanning one captured frame.
#[derive(Debug)]
pub struct ScanOutcome {
    /// Changed regions, clipped to the framebuffer. Empty when nothing
    /// changed.
    pub rects: Vec<Rect>,
    /// True when the scan collapsed to a single full-frame rectangle.
    pub full_frame: bool,
}

/// Per-connection dirty-region tracker.
#[derive(Debug)]
pub struct ChangeDetector {
    tiles_x: usize,
    tiles_y: usize,
    width: u16,
    height: u16,
    /// Row-major tile hashes; `None` is unseeded and always dirty.
    hashes: Vec<Option<[u8; 16]>>,
    /// Consecutive scans with zero dirty tiles.
    clean_streak: u32,
}

impl ChangeDetector {
    /// Creates a detector with no seeded tiles.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiles_x: 0,
            tiles_y: 0,
            width: 0,
            height: 0,
            hashes: Vec::new(),
            clean_streak: 0,
        }
    }

    /// Number of consecutive scans that found nothing dirty.
    #[must_use]
    pub fn clean_streak(&self) -> u32 {
        self.clean_streak
    }

    /// Hashes the snapshot's tiles, updates stored hashes, and returns
    /// the changed regions merged into at most [`MAX_RECTS`] rectangles.
    pub fn scan(&mut self, snapshot: &Snapshot) -> ScanOutcome {
        let width = snapshot.width();
        let height = snapshot.height();
        if width != self.width || height != self.height {
            self.resize(width, height);
        }
        if self.tiles_x == 0 || self.tiles_y == 0 {
            return ScanOutcome {
                rects: Vec::new(),
                full_frame: false,
            };
        }

        let mut dirty = vec![false; self.tiles_x * self.tiles_y];
        let mut dirty_count = 0usize;

        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let idx = ty * self.tiles_x + tx;
                let hash = self.hash_tile(snapshot, tx, ty);
                let changed = self.hashes[idx] != Some(hash);
                if changed {
                    dirty[idx] = true;
                    dirty_count += 1;
                    self.hashes[idx] = Some(hash);
                }
            }
        }

        if dirty_count == 0 {
            self.clean_streak = self.clean_streak.saturating_add(1);
            return ScanOutcome {
                rects: Vec::new(),
                full_frame: false,
            };
        }
        self.clean_streak = 0;

        let fraction = dirty_count as f64 / (self.tiles_x * self.tiles_y) as f64;
        if fraction > FULL_UPDATE_FRACTION {
            return ScanOutcome {
                rects: vec![Rect::new(0, 0, width, height)],
                full_frame: true,
            };
        }

        let mut rects = self.merge_components(&dirty);
        merge_overlapping(&mut rects);
        cap_rect_count(&mut rects, MAX_RECTS);
        ScanOutcome {
            rects,
            full_frame: false,
        }
    }

    /// Drops all seeded hashes so the next scan reports everything dirty.
    pub fn invalidate(&mut self) {
        for hash in &mut self.hashes {
            *hash = None;
        }
        self.clean_streak = 0;
    }

    fn resize(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        self.tiles_x = (width as usize).div_ceil(TILE_SIZE);
        self.tiles_y = (height as usize).div_ceil(TILE_SIZE);
        self.hashes = vec![None; self.tiles_x * self.tiles_y];
        self.clean_streak = 0;
    }

    /// Hashes the clipped pixel bytes of one tile.
    fn hash_tile(&self, snapshot: &Snapshot, tx: usize, ty: usize) -> [u8; 16] {
        let x = (tx * TILE_SIZE) as u16;
        let y = (ty * TILE_SIZE) as u16;
        let w = TILE_SIZE.min(self.width as usize - tx * TILE_SIZE) as u16;
        let h = TILE_SIZE.min(self.height as usize - ty * TILE_SIZE) as u16;

        let mut hasher = Sha256::new();
        for row in 0..h {
            hasher.update(snapshot.row(x, y + row, w));
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        out
    }

    /// Groups dirty tiles into 4-connected components and returns each
    /// component's bounding box in pixel coordinates.
    fn merge_components(&self, dirty: &[bool]) -> Vec<Rect> {
        let mut visited = vec![false; dirty.len()];
        let mut rects = Vec::new();
        let mut stack = Vec::new();

        for start in 0..dirty.len() {
            if !dirty[start] || visited[start] {
                continue;
            }
            let mut min_tx = usize::MAX;
            let mut min_ty = usize::MAX;
            let mut max_tx = 0usize;
            let mut max_ty = 0usize;

            visited[start] = true;
            stack.push(start);
            while let Some(idx) = stack.pop() {
                let tx = idx % self.tiles_x;
                let ty = idx / self.tiles_x;
                min_tx = min_tx.min(tx);
                min_ty = min_ty.min(ty);
                max_tx = max_tx.max(tx);
                max_ty = max_ty.max(ty);

                let mut neighbour = |nx: usize, ny: usize| {
                    let nidx = ny * self.tiles_x + nx;
                    if dirty[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                };
                if tx > 0 {
                    neighbour(tx - 1, ty);
                }
                if tx + 1 < self.tiles_x {
                    neighbour(tx + 1, ty);
                }
                if ty > 0 {
                    neighbour(tx, ty - 1);
                }
                if ty + 1 < self.tiles_y {
                    neighbour(tx, ty + 1);
                }
            }

            let x = (min_tx * TILE_SIZE) as u16;
            let y = (min_ty * TILE_SIZE) as u16;
            let x2 = (((max_tx + 1) * TILE_SIZE).min(self.width as usize)) as u16;
            let y2 = (((max_ty + 1) * TILE_SIZE).min(self.height as usize)) as u16;
            rects.push(Rect::new(x, y, x2 - x, y2 - y));
        }
        rects
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges rectangles whose bounding boxes overlap, repeating until the
/// set is pairwise disjoint.
fn merge_overlapping(rects: &mut Vec<Rect>) {
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                if rects[i].overlaps(&rects[j]) {
                    let union = rects[i].union(&rects[j]);
                    rects[i] = union;
                    rects.swap_remove(j);
                    merged = true;
                    break 'outer;
                }
            }
        }
    }
}

/// Reduces the rectangle count to `cap` by repeatedly merging the pair
/// whose union wastes the least area.
fn cap_rect_count(rects: &mut Vec<Rect>, cap: usize) {
    while rects.len() > cap {
        let mut best_pair = (0, 1);
        let mut best_waste = usize::MAX;
        for i in 0..rects.len() {
            for j in (i + 1)..rects.len() {
                let union = rects[i].union(&rects[j]);
                let waste = union.area() - rects[i].area() - rects[j].area();
                if waste < best_waste {
                    best_waste = waste;
                    best_pair = (i, j);
                }
            }
        }
        let (i, j) = best_pair;
        rects[i] = rects[i].union(&rects[j]);
        rects.swap_remove(j);
        // A grown rectangle may now overlap others.
        merge_overlapping(rects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Capture;
    use std::time::Instant;

    fn snapshot(w: u32, h: u32, pixels: Vec<u8>) -> Snapshot {
        Snapshot::from_capture(
            &Capture {
                pixels,
                width: w,
                height: h,
                timestamp: Instant::now(),
            },
            1.0,
        )
    }

    fn frame(w: u32, h: u32, fill: u8) -> Vec<u8> {
        vec![fill; (w * h * 4) as usize]
    }

    #[test]
    fn first_scan_is_all_dirty() {
        let mut det = ChangeDetector::new();
        let snap = snapshot(256, 256, frame(256, 256, 0));
        let outcome = det.scan(&snap);
        // Unseeded tiles are all dirty -> full-frame collapse.
        assert!(outcome.full_frame);
        assert_eq!(outcome.rects, vec![Rect::new(0, 0, 256, 256)]);
    }

    #[test]
    fn identical_frames_are_clean() {
        let mut det = ChangeDetector::new();
        let snap = snapshot(256, 192, frame(256, 192, 7));
        det.scan(&snap);
        let outcome = det.scan(&snap);
        assert!(outcome.rects.is_empty());
        assert_eq!(det.clean_streak(), 1);
        det.scan(&snap);
        assert_eq!(det.clean_streak(), 2);
    }

    #[test]
    fn single_tile_change_is_localised() {
        let mut det = ChangeDetector::new();
        let mut pixels = frame(256, 256, 0);
        let base = snapshot(256, 256, pixels.clone());
        det.scan(&base);

        // Touch one pixel inside tile (1, 2).
        let x = 64 + 5;
        let y = 128 + 9;
        pixels[(y * 256 + x) * 4] = 0xFF;
        let changed = snapshot(256, 256, pixels);
        let outcome = det.scan(&changed);
        assert!(!outcome.full_frame);
        assert_eq!(outcome.rects, vec![Rect::new(64, 128, 64, 64)]);
    }

    #[test]
    fn change_coverage() {
        // Every changed pixel must be inside the emitted rectangles.
        let mut det = ChangeDetector::new();
        let w = 320u32;
        let h = 320u32;
        let mut pixels = frame(w, h, 0);
        det.scan(&snapshot(w, h, pixels.clone()));

        let changed_at = [(3usize, 3usize), (300, 10), (150, 310)];
        for &(x, y) in &changed_at {
            pixels[(y * w as usize + x) * 4 + 1] = 0x55;
        }
        let outcome = det.scan(&snapshot(w, h, pixels));
        for &(x, y) in &changed_at {
            let covered = outcome.rects.iter().any(|r| {
                x >= r.x as usize
                    && x < (r.x + r.w) as usize
                    && y >= r.y as usize
                    && y < (r.y + r.h) as usize
            });
            assert!(covered, "pixel ({x},{y}) not covered by {:?}", outcome.rects);
        }
    }

    #[test]
    fn mostly_dirty_collapses_to_full_frame() {
        let mut det = ChangeDetector::new();
        let w = 512u32;
        let h = 512u32;
        det.scan(&snapshot(w, h, frame(w, h, 0)));
        // Change > 75% of the frame.
        let mut pixels = frame(w, h, 0);
        for b in pixels.iter_mut().take((w * h * 4) as usize * 9 / 10) {
            *b = 0xAA;
        }
        let outcome = det.scan(&snapshot(w, h, pixels));
        assert!(outcome.full_frame);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let mut det = ChangeDetector::new();
        // 100x70 leaves 36x6 edge tiles.
        let mut pixels = frame(100, 70, 1);
        det.scan(&snapshot(100, 70, pixels.clone()));
        // Change the bottom-right corner pixel.
        let off = (69 * 100 + 99) * 4;
        pixels[off] = 0xEE;
        let outcome = det.scan(&snapshot(100, 70, pixels));
        assert_eq!(outcome.rects, vec![Rect::new(64, 64, 36, 6)]);
    }

    #[test]
    fn invalidate_marks_everything_dirty() {
        let mut det = ChangeDetector::new();
        let snap = snapshot(128, 128, frame(128, 128, 3));
        det.scan(&snap);
        det.invalidate();
        let outcome = det.scan(&snap);
        assert!(outcome.full_frame);
    }

    #[test]
    fn resize_reseeds() {
        let mut det = ChangeDetector::new();
        det.scan(&snapshot(128, 128, frame(128, 128, 3)));
        let outcome = det.scan(&snapshot(256, 128, frame(256, 128, 3)));
        assert!(outcome.full_frame);
    }

    #[test]
    fn cap_respected() {
        let mut rects: Vec<Rect> = (0..40)
            .map(|i| Rect::new((i * 100) as u16, 0, 10, 10))
            .collect();
        cap_rect_count(&mut rects, 32);
        assert!(rects.len() <= 32);
    }
}
