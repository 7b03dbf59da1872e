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

//! Server configuration and network profile selection.

use std::net::IpAddr;
use std::time::Duration;

/// Network profile driving encoder selection and frame pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProfile {
    /// Same-host connection: raw pixels, no pacing.
    Localhost,
    /// Private-network connection: adaptive encoders, high frame rate.
    Lan,
    /// Everything else: dense encodings, conservative frame rate.
    Wan,
}

impl NetworkProfile {
    /// Classifies a peer address when no override is configured.
    #[must_use]
    pub fn detect(peer: IpAddr) -> Self {
        if peer.is_loopback() {
            return NetworkProfile::Localhost;
        }
        let private = match peer {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => {
                // fe80::/10 link-local or fc00::/7 unique-local
                (v6.segments()[0] & 0xffc0) == 0xfe80 || (v6.segments()[0] & 0xfe00) == 0xfc00
            }
        };
        if private {
            NetworkProfile::Lan
        } else {
            NetworkProfile::Wan
        }
    }
}

/// Tuning knobs for the adaptive LAN encoder selection.
///
/// Area thresholds are fractions of the framebuffer; pixel thresholds are
/// absolute counts. See the selector for how they combine.
#[derive(Debug, Clone)]
pub struct LanTuning {
    /// Rectangles below this framebuffer fraction may go Raw.
    pub raw_area_threshold: f64,
    /// Raw is never used above this pixel count.
    pub raw_max_pixels: usize,
    /// Prefer Zlib over ZRLE for large rectangles.
    pub prefer_zlib: bool,
    /// Zlib engages at or above this framebuffer fraction.
    pub zlib_area_threshold: f64,
    /// Zlib engages at or above this pixel count.
    pub zlib_min_pixels: usize,
    /// Deflate level for the LAN Zlib stream.
    pub zlib_compression_level: u32,
    /// Number of initial updates during which Zlib is withheld.
    pub zlib_warmup_requests: u32,
    /// JPEG engages at or above this framebuffer fraction.
    pub jpeg_area_threshold: f64,
    /// JPEG engages at or above this pixel count.
    pub jpeg_min_pixels: usize,
    /// Starting JPEG quality.
    pub jpeg_quality_initial: u8,
    /// Lower bound for adaptive JPEG quality.
    pub jpeg_quality_min: u8,
    /// Upper bound for adaptive JPEG quality.
    pub jpeg_quality_max: u8,
    /// Deflate level for ZRLE on LAN (lower than the WAN level).
    pub zrle_compression_level: u32,
}

impl Default for LanTuning {
    fn default() -> Self {
        Self {
            raw_area_threshold: 0.02,
            raw_max_pixels: 65_536,
            prefer_zlib: true,
            zlib_area_threshold: 0.25,
            zlib_min_pixels: 262_144,
            zlib_compression_level: 3,
            zlib_warmup_requests: 10,
            jpeg_area_threshold: 0.5,
            jpeg_min_pixels: 524_288,
            jpeg_quality_initial: 80,
            jpeg_quality_min: 40,
            jpeg_quality_max: 95,
            zrle_compression_level: 3,
        }
    }
}

/// Server configuration.
///
/// Every option has a working default; embedding applications override
/// the fields they care about before constructing the server. The
/// library only consumes the `log` facade, so `log_level` and `log_file`
/// are passed through for the embedding application's logger setup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listening TCP port, serving both raw RFB and WebSocket.
    pub port: u16,
    /// VNC auth password; empty string disables VNC auth (None only).
    pub password: String,
    /// Desktop name sent in ServerInit.
    pub desktop_name: String,
    /// Target FPS on WAN profiles.
    pub frame_rate: u32,
    /// Target FPS on LAN profiles.
    pub lan_frame_rate: u32,
    /// Bypass peer-address profile autodetection.
    pub network_profile_override: Option<NetworkProfile>,
    /// Capture downscale factor; 1.0 means no scaling.
    pub scale_factor: f64,
    /// Connection pool cap.
    pub max_connections: usize,
    /// Use tile-hash change detection; when false every update covers the
    /// full framebuffer.
    pub enable_region_detection: bool,
    /// Offer the cursor pseudo-encoding capability.
    pub enable_cursor_encoding: bool,
    /// Make the Tight encoder available.
    pub enable_tight_encoding: bool,
    /// Make the JPEG (Tight) mode available.
    pub enable_jpeg_encoding: bool,
    /// Reserved: H.264 is declared in configuration but not implemented.
    pub enable_h264_encoding: bool,
    /// Encode rectangles of one update on a worker pool.
    pub enable_parallel_encoding: bool,
    /// Suppress Tight when the client looks like an UltraVNC viewer.
    pub tight_disable_for_ultravnc: bool,
    /// Worker count for parallel encoding; `None` picks a default.
    pub encoding_threads: Option<usize>,
    /// Accept WebSocket upgrades on the VNC port.
    pub enable_websocket: bool,
    /// How long to wait for the first bytes before assuming raw RFB.
    pub websocket_detect_timeout: Duration,
    /// Upper bound on the HTTP upgrade request size.
    pub websocket_max_handshake_bytes: usize,
    /// Upper bound on a single WebSocket frame payload.
    pub websocket_max_payload_bytes: usize,
    /// Upper bound on a fragmented-message reassembly buffer.
    pub websocket_max_buffer_bytes: usize,
    /// Maximum entries accepted in a SetEncodings list.
    pub max_set_encodings: usize,
    /// Maximum ClientCutText payload in bytes.
    pub max_client_cut_text: usize,
    /// Idle connections beyond this are dropped by the health checker.
    pub client_socket_timeout: Duration,
    /// Collapse repeated update requests into one pending union.
    pub enable_request_coalescing: bool,
    /// Adaptive LAN thresholds.
    pub lan: LanTuning,
    /// Log level hint for the embedding application's logger.
    pub log_level: Option<String>,
    /// Log file hint for the embedding application's logger.
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5900,
            password: String::new(),
            desktop_name: "rfbserver".to_string(),
            frame_rate: 30,
            lan_frame_rate: 60,
            network_profile_override: None,
            scale_factor: 1.0,
            max_connections: 10,
            enable_region_detection: true,
            enable_cursor_encoding: false,
            enable_tight_encoding: false,
            enable_jpeg_encoding: false,
            enable_h264_encoding: false,
            enable_parallel_encoding: false,
            tight_disable_for_ultravnc: true,
            encoding_threads: None,
            enable_websocket: true,
            websocket_detect_timeout: Duration::from_millis(250),
            websocket_max_handshake_bytes: 16 * 1024,
            websocket_max_payload_bytes: 16 * 1024 * 1024,
            websocket_max_buffer_bytes: 32 * 1024 * 1024,
            max_set_encodings: 32,
            max_client_cut_text: 1024 * 1024,
            client_socket_timeout: Duration::from_secs(30),
            enable_request_coalescing: true,
            lan: LanTuning::default(),
            log_level: None,
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// The pacing interval for a profile: `1/frame_rate` on WAN,
    /// `1/lan_frame_rate` on LAN, zero on localhost.
    #[must_use]
    pub fn frame_interval(&self, profile: NetworkProfile) -> Duration {
        let fps = match profile {
            NetworkProfile::Localhost => return Duration::ZERO,
            NetworkProfile::Lan => self.lan_frame_rate,
            NetworkProfile::Wan => self.frame_rate,
        };
        if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / f64::from(fps))
        }
    }

    /// Resolves the profile for a peer, honouring the override.
    #[must_use]
    pub fn profile_for(&self, peer: IpAddr) -> NetworkProfile {
        self.network_profile_override
            .unwrap_or_else(|| NetworkProfile::detect(peer))
    }
}
