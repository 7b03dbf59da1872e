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

//! Transport multiplexing between raw RFB and WebSocket.
//!
//! RFB servers speak first, so a raw client connects and waits silently;
//! a WebSocket client opens with an HTTP `GET`. Peeking the first bytes
//! with a short timeout tells the two apart without consuming anything
//! from the stream.

use crate::config::ServerConfig;
use crate::error::{Result, VncError};
use crate::websocket::{self, WsStream};
use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A client connection, either raw RFB or RFB tunnelled through
/// WebSocket binary frames.
pub enum Transport {
    /// Plain TCP carrying RFB bytes.
    Raw(TcpStream),
    /// RFC 6455 framing around the RFB bytes.
    WebSocket(WsStream),
}

impl Transport {
    /// Sniffs the first bytes of an accepted socket and routes it.
    ///
    /// `TcpStream::peek` leaves the bytes in the kernel buffer, so the
    /// WebSocket handshake (or the RFB engine) reads the stream from the
    /// start. A timeout or fewer than three bytes means a raw RFB client
    /// sitting silent, waiting for the server's version string.
    pub async fn detect(stream: TcpStream, config: &ServerConfig) -> Result<Transport> {
        if !config.enable_websocket {
            return Ok(Transport::Raw(stream));
        }

        let mut probe = [0u8; 3];
        let peeked = timeout(config.websocket_detect_timeout, async {
            // Short reads happen; re-peek until three bytes or EOF.
            loop {
                let n = stream.peek(&mut probe).await?;
                if n >= 3 || n == 0 {
                    return Ok::<usize, std::io::Error>(n);
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;

        match peeked {
            Ok(Ok(n)) if n >= 3 && &probe == b"GET" => {
                debug!("HTTP GET detected, upgrading to WebSocket");
                let ws = websocket::upgrade(stream, config).await?;
                Ok(Transport::WebSocket(ws))
            }
            Ok(Ok(0)) => Err(VncError::ConnectionClosed),
            Ok(Err(e)) => Err(e.into()),
            // Silence or a non-GET preamble: raw RFB.
            _ => Ok(Transport::Raw(stream)),
        }
    }

    /// Reads more RFB bytes into `buf`, returning the count; zero means
    /// EOF.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Raw(stream) => Ok(stream.read_buf(buf).await?),
            Transport::WebSocket(ws) => ws.read_payload(buf).await,
        }
    }

    /// Writes RFB bytes through the transport.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Raw(stream) => Ok(stream.write_all(data).await?),
            Transport::WebSocket(ws) => ws.write_payload(data).await,
        }
    }

    /// Closes the transport, sending a WebSocket close frame first when
    /// applicable.
    pub async fn shutdown(&mut self) {
        match self {
            Transport::Raw(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::WebSocket(ws) => {
                let _ = ws.send_close(1000).await;
                let _ = ws.shutdown().await;
            }
        }
    }
}
