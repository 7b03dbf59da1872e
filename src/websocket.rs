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

//! WebSocket transport adapter (RFC 6455, server side).
//!
//! Browser clients reach the VNC port through a WebSocket upgrade; this
//! module performs the HTTP handshake and then tunnels RFB bytes through
//! binary frames. Only binary frames carry payload; pings are answered
//! with pongs, close frames surface as EOF, and both per-frame and
//! reassembly-buffer caps close the connection with status 1009.

use crate::config::ServerConfig;
use crate::error::{Result, VncError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, trace};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// GUID appended to the client key for the accept hash, from RFC 6455.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest frame the server emits; larger writes are chunked.
const OUTBOUND_FRAME_LIMIT: usize = 64 * 1024;

// Frame opcodes
const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Close status: message too big (RFC 6455 §7.4.1).
const CLOSE_TOO_BIG: u16 = 1009;
/// Close status: protocol error.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Computes the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parsed upgrade request details the response needs.
struct UpgradeRequest {
    key: String,
    offered_binary_protocol: bool,
}

/// Reads and validates the HTTP upgrade request. Returns the parsed
/// request plus any bytes the client pipelined behind it, which must
/// seed the frame parser.
///
/// The request is bounded by `websocket_max_handshake_bytes`; anything
/// malformed gets a 400 response before the error is returned.
async fn read_upgrade_request(
    stream: &mut TcpStream,
    config: &ServerConfig,
) -> Result<(UpgradeRequest, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() >= config.websocket_max_handshake_bytes {
            return Err(VncError::ResourceLimit("WebSocket handshake too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(VncError::ConnectionClosed);
        }
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| VncError::Handshake("request is not valid UTF-8".into()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    if !request_line.starts_with("GET ") {
        return Err(VncError::Handshake(format!(
            "unsupported request line: {request_line}"
        )));
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let token_in = |value: Option<&String>, token: &str| {
        value.is_some_and(|v| {
            v.split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    };

    if !token_in(headers.get("upgrade"), "websocket") {
        return Err(VncError::Handshake("missing Upgrade: websocket".into()));
    }
    if !token_in(headers.get("connection"), "upgrade") {
        return Err(VncError::Handshake("missing Connection: Upgrade".into()));
    }
    if headers.get("sec-websocket-version").map(String::as_str) != Some("13") {
        return Err(VncError::Handshake("unsupported Sec-WebSocket-Version".into()));
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| VncError::Handshake("missing Sec-WebSocket-Key".into()))?
        .clone();

    let offered_binary_protocol = token_in(headers.get("sec-websocket-protocol"), "binary");

    let mut leftover = buf;
    leftover.advance(header_end);
    Ok((
        UpgradeRequest {
            key,
            offered_binary_protocol,
        },
        leftover,
    ))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Performs the server side of the WebSocket upgrade and returns the
/// framed stream. On handshake failure a 400 response is written before
/// the error propagates.
pub async fn upgrade(mut stream: TcpStream, config: &ServerConfig) -> Result<WsStream> {
    let (request, leftover) = match read_upgrade_request(&mut stream, config).await {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
            return Err(err);
        }
    };

    let mut response = String::with_capacity(192);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!(
        "Sec-WebSocket-Accept: {}\r\n",
        accept_key(&request.key)
    ));
    if request.offered_binary_protocol {
        response.push_str("Sec-WebSocket-Protocol: binary\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;

    info!("WebSocket upgrade complete");
    Ok(WsStream::new(
        stream,
        leftover,
        config.websocket_max_payload_bytes,
        config.websocket_max_buffer_bytes,
    ))
}

/// A TCP stream speaking RFC 6455 framing, carrying RFB bytes in binary
/// messages.
pub struct WsStream {
    stream: TcpStream,
    read_buf: BytesMut,
    /// Reassembly buffer for a fragmented binary message.
    fragment_buf: BytesMut,
    fragment_open: bool,
    max_payload: usize,
    max_buffer: usize,
    peer_closed: bool,
}

/// One parsed frame header.
struct FrameHeader {
    fin: bool,
    opcode: u8,
    masked: bool,
    mask: [u8; 4],
    payload_len: usize,
    header_len: usize,
}

impl WsStream {
    fn new(stream: TcpStream, pipelined: BytesMut, max_payload: usize, max_buffer: usize) -> Self {
        Self {
            stream,
            read_buf: pipelined,
            fragment_buf: BytesMut::new(),
            fragment_open: false,
            max_payload,
            max_buffer,
            peer_closed: false,
        }
    }

    /// Reads the next chunk of RFB payload bytes into `out`, handling
    /// control frames internally. Returns the number of bytes delivered;
    /// zero means the peer closed.
    pub async fn read_payload(&mut self, out: &mut BytesMut) -> Result<usize> {
        loop {
            if self.peer_closed {
                return Ok(0);
            }
            let Some(header) = self.parse_frame_header()? else {
                let n = self.stream.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Ok(0);
                }
                continue;
            };

            if header.payload_len > self.max_payload {
                self.send_close(CLOSE_TOO_BIG).await?;
                return Err(VncError::ResourceLimit("WebSocket frame too large"));
            }

            // Wait for the whole frame.
            if self.read_buf.len() < header.header_len + header.payload_len {
                let n = self.stream.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Ok(0);
                }
                continue;
            }

            self.read_buf.advance(header.header_len);
            let mut payload = self.read_buf.split_to(header.payload_len);
            if header.masked {
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte ^= header.mask[i % 4];
                }
            } else if header.payload_len > 0 {
                // RFC 6455 §5.1: client frames must be masked.
                self.send_close(CLOSE_PROTOCOL_ERROR).await?;
                return Err(VncError::Protocol("unmasked client frame".into()));
            }

            match header.opcode {
                OPCODE_BINARY | OPCODE_CONTINUATION => {
                    let starting = header.opcode == OPCODE_BINARY;
                    if starting && self.fragment_open {
                        self.send_close(CLOSE_PROTOCOL_ERROR).await?;
                        return Err(VncError::Protocol("interleaved data message".into()));
                    }
                    if !starting && !self.fragment_open {
                        self.send_close(CLOSE_PROTOCOL_ERROR).await?;
                        return Err(VncError::Protocol("continuation without start".into()));
                    }
                    if self.fragment_buf.len() + payload.len() > self.max_buffer {
                        self.send_close(CLOSE_TOO_BIG).await?;
                        return Err(VncError::ResourceLimit("WebSocket message too large"));
                    }
                    self.fragment_buf.unsplit(payload);
                    if header.fin {
                        self.fragment_open = false;
                        let message = self.fragment_buf.split();
                        let len = message.len();
                        out.extend_from_slice(&message);
                        if len > 0 {
                            return Ok(len);
                        }
                    } else {
                        self.fragment_open = true;
                    }
                }
                OPCODE_TEXT => {
                    self.send_close(CLOSE_PROTOCOL_ERROR).await?;
                    return Err(VncError::Protocol("text frames are not accepted".into()));
                }
                OPCODE_PING => {
                    trace!("WebSocket ping, {} bytes", payload.len());
                    self.write_frame(OPCODE_PONG, &payload).await?;
                }
                OPCODE_PONG => {
                    // Unsolicited pongs are permitted and ignored.
                }
                OPCODE_CLOSE => {
                    debug!("WebSocket close from peer");
                    let _ = self.write_frame(OPCODE_CLOSE, &payload).await;
                    self.peer_closed = true;
                    return Ok(0);
                }
                other => {
                    self.send_close(CLOSE_PROTOCOL_ERROR).await?;
                    return Err(VncError::Protocol(format!("unknown opcode {other:#x}")));
                }
            }
        }
    }

    /// Tries to parse a frame header from the buffered bytes.
    fn parse_frame_header(&self) -> Result<Option<FrameHeader>> {
        let buf = &self.read_buf;
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(VncError::Protocol("reserved frame bits set".into()));
        }
        let opcode = buf[0] & 0x0F;
        let masked = buf[1] & 0x80 != 0;
        let len7 = (buf[1] & 0x7F) as usize;

        let (payload_len, mut offset) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                (usize::try_from(len).unwrap_or(usize::MAX), 10)
            }
            n => (n, 2),
        };

        let mut mask = [0u8; 4];
        if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            mask.copy_from_slice(&buf[offset..offset + 4]);
            offset += 4;
        }

        Ok(Some(FrameHeader {
            fin,
            opcode,
            masked,
            mask,
            payload_len,
            header_len: offset,
        }))
    }

    /// Writes RFB bytes as one or more unmasked binary frames.
    pub async fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(OUTBOUND_FRAME_LIMIT.max(1)) {
            self.write_frame(OPCODE_BINARY, chunk).await?;
        }
        Ok(())
    }

    async fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        // Header and payload go out in one write so a cancelled control
        // frame cannot leave half a header on the wire.
        let mut frame = BytesMut::with_capacity(10 + payload.len());
        frame.put_u8(0x80 | opcode); // FIN, no fragmentation server-side
        #[allow(clippy::cast_possible_truncation)]
        if payload.len() < 126 {
            frame.put_u8(payload.len() as u8);
        } else if payload.len() <= usize::from(u16::MAX) {
            frame.put_u8(126);
            frame.put_u16(payload.len() as u16);
        } else {
            frame.put_u8(127);
            frame.put_u64(payload.len() as u64);
        }
        frame.put_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Sends a close frame with the given status code.
    pub async fn send_close(&mut self, code: u16) -> Result<()> {
        let payload = code.to_be_bytes();
        self.write_frame(OPCODE_CLOSE, &payload).await
    }

    /// Flushes and shuts the underlying socket down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
