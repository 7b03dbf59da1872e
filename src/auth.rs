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

//! VNC authentication (security type 2).
//!
//! The challenge-response scheme of RFC 6143 §7.2.2: the server sends 16
//! random bytes, the client DES-encrypts them with a key derived from the
//! password, and the server compares against its own encryption of the
//! same challenge.

use cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Generates a fresh 16-byte authentication challenge.
#[must_use]
pub fn generate_challenge() -> [u8; 16] {
    rand::thread_rng().gen()
}

/// Computes the expected DES response for a password and challenge.
///
/// VNC key derivation: the password is truncated or zero-padded to 8
/// bytes, then the bit order of every byte is reversed before it is used
/// as a DES ECB key over the two 8-byte challenge halves.
#[must_use]
pub fn expected_response(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, &byte) in key.iter_mut().zip(password.as_bytes().iter().take(8)) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new_from_slice(&key).expect("DES key is always 8 bytes");

    let mut response = *challenge;
    let (block0, block1) = response.split_at_mut(8);
    cipher.encrypt_block(block0.into());
    cipher.encrypt_block(block1.into());
    response
}

/// Constant-shape comparison of a client response against the expectation.
#[must_use]
pub fn verify_response(password: &str, challenge: &[u8; 16], response: &[u8; 16]) -> bool {
    let expected = expected_response(password, challenge);
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(response.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // Sequential challenge bytes, password "12345678".
        let challenge: [u8; 16] = core::array::from_fn(|i| i as u8);
        let response = expected_response("12345678", &challenge);
        assert_eq!(
            response,
            [
                0x83, 0xdd, 0x2b, 0x4d, 0xbd, 0x04, 0x36, 0x7f, 0x28, 0x57, 0x8f, 0xdd, 0x5b,
                0x14, 0x27, 0x40
            ]
        );
    }

    #[test]
    fn short_password_is_zero_padded() {
        let challenge = [0u8; 16];
        // "abc" and "abc\0\0\0\0\0" derive the same key.
        assert_eq!(
            expected_response("abc", &challenge),
            expected_response("abc\0\0\0\0\0", &challenge)
        );
    }

    #[test]
    fn long_password_is_truncated() {
        let challenge = [7u8; 16];
        assert_eq!(
            expected_response("longpassword", &challenge),
            expected_response("longpass", &challenge)
        );
    }

    #[test]
    fn verify_accepts_and_rejects() {
        let challenge = generate_challenge();
        let good = expected_response("secret", &challenge);
        assert!(verify_response("secret", &challenge, &good));
        let mut bad = good;
        bad[0] ^= 1;
        assert!(!verify_response("secret", &challenge, &bad));
        assert!(!verify_response("other", &challenge, &good));
    }
}
