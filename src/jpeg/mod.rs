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

//! JPEG compression for the Tight encoding's lossy mode.
//!
//! TurboJPEG support is optional and enabled with the `turbojpeg`
//! feature; without it the Tight encoder sends full-colour zlib data.

#[cfg(feature = "turbojpeg")]
pub mod turbojpeg;

#[cfg(feature = "turbojpeg")]
pub use turbojpeg::TurboJpegEncoder;
