//! End-to-end protocol scenarios against a live server on a loopback
//! socket: handshakes, authentication, update flow, pixel format
//! switches, WebSocket tunnelling, and pool saturation.

use rfbserver::{
    Capture, CaptureError, NullInputSink, Rect, ScreenSource, ServerConfig, VncServer,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(3);

/// A screen source backed by a swappable in-memory frame.
struct TestScreen {
    frame: Mutex<(Vec<u8>, u32, u32)>,
}

impl TestScreen {
    fn new(width: u32, height: u32, pixels: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new((pixels, width, height)),
        })
    }

    fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Arc<Self> {
        let pixels = bgra
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(width, height, pixels)
    }

    fn set_pixels(&self, pixels: Vec<u8>) {
        let mut frame = self.frame.lock().unwrap();
        frame.0 = pixels;
    }
}

#[async_trait::async_trait]
impl ScreenSource for TestScreen {
    async fn capture(&self, _region: Option<Rect>) -> Result<Capture, CaptureError> {
        let frame = self.frame.lock().unwrap();
        Ok(Capture {
            pixels: frame.0.clone(),
            width: frame.1,
            height: frame.2,
            timestamp: Instant::now(),
        })
    }
}

/// Starts a server on an ephemeral loopback port.
async fn start_server(config: ServerConfig, screen: Arc<TestScreen>) -> (VncServer, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (server, _events) = VncServer::new(config, screen, Arc::new(NullInputSink));
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.serve_on(listener).await;
    });
    (server, addr)
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Runs the version + None-security + init phases as a 3.8 client.
/// Returns (width, height, name).
async fn handshake_none_auth(stream: &mut TcpStream) -> (u16, u16, String) {
    let version = read_n(stream, 12).await;
    assert_eq!(&version, b"RFB 003.008\n");
    stream.write_all(b"RFB 003.008\n").await.unwrap();

    let security = read_n(stream, 2).await;
    assert_eq!(security, vec![1, 1], "one type offered: None");
    stream.write_all(&[1]).await.unwrap();

    let result = read_n(stream, 4).await;
    assert_eq!(u32::from_be_bytes(result.try_into().unwrap()), 0);

    stream.write_all(&[1]).await.unwrap(); // ClientInit, shared

    read_server_init(stream).await
}

async fn read_server_init(stream: &mut TcpStream) -> (u16, u16, String) {
    let head = read_n(stream, 24).await;
    let width = u16::from_be_bytes([head[0], head[1]]);
    let height = u16::from_be_bytes([head[2], head[3]]);
    // Default format: 32 bpp, depth 24, little-endian true colour.
    assert_eq!(head[4], 32);
    assert_eq!(head[5], 24);
    assert_eq!(head[6], 0);
    assert_eq!(head[7], 1);
    let name_len = u32::from_be_bytes([head[20], head[21], head[22], head[23]]) as usize;
    let name = read_n(stream, name_len).await;
    (width, height, String::from_utf8(name).unwrap())
}

async fn send_update_request(stream: &mut TcpStream, incremental: bool, region: Rect) {
    let mut msg = vec![3u8, u8::from(incremental)];
    msg.extend_from_slice(&region.x.to_be_bytes());
    msg.extend_from_slice(&region.y.to_be_bytes());
    msg.extend_from_slice(&region.w.to_be_bytes());
    msg.extend_from_slice(&region.h.to_be_bytes());
    stream.write_all(&msg).await.unwrap();
}

async fn send_set_encodings(stream: &mut TcpStream, encodings: &[i32]) {
    let mut msg = vec![2u8, 0];
    msg.extend_from_slice(&u16::try_from(encodings.len()).unwrap().to_be_bytes());
    for e in encodings {
        msg.extend_from_slice(&e.to_be_bytes());
    }
    stream.write_all(&msg).await.unwrap();
}

struct UpdateRect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    encoding: i32,
    payload: Vec<u8>,
}

/// Reads one FramebufferUpdate whose rectangles are Raw or CopyRect.
async fn read_update(stream: &mut TcpStream, bytes_per_pixel: usize) -> Vec<UpdateRect> {
    let head = read_n(stream, 4).await;
    assert_eq!(head[0], 0, "FramebufferUpdate message type");
    let count = u16::from_be_bytes([head[2], head[3]]) as usize;

    let mut rects = Vec::with_capacity(count);
    for _ in 0..count {
        let header = read_n(stream, 12).await;
        let x = u16::from_be_bytes([header[0], header[1]]);
        let y = u16::from_be_bytes([header[2], header[3]]);
        let w = u16::from_be_bytes([header[4], header[5]]);
        let h = u16::from_be_bytes([header[6], header[7]]);
        let encoding =
            i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let payload_len = match encoding {
            0 => w as usize * h as usize * bytes_per_pixel,
            1 => 4,
            -223 => 0,
            other => panic!("unexpected encoding {other} in test update"),
        };
        let payload = read_n(stream, payload_len).await;
        rects.push(UpdateRect {
            x,
            y,
            w,
            h,
            encoding,
            payload,
        });
    }
    rects
}

#[tokio::test]
async fn none_auth_handshake_and_server_init() {
    let screen = TestScreen::solid(1920, 1080, [0, 0, 0, 255]);
    let config = ServerConfig {
        desktop_name: "PyVNC".to_string(),
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (width, height, name) = handshake_none_auth(&mut stream).await;
    assert_eq!((width, height), (1920, 1080));
    assert_eq!(name, "PyVNC");
}

#[tokio::test]
async fn vnc_auth_failure_sends_reason_and_closes() {
    let screen = TestScreen::solid(64, 48, [1, 2, 3, 255]);
    let config = ServerConfig {
        password: "secret".to_string(),
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _version = read_n(&mut stream, 12).await;
    stream.write_all(b"RFB 003.008\n").await.unwrap();

    let security = read_n(&mut stream, 2).await;
    assert_eq!(security, vec![1, 2], "one type offered: VNC auth");
    stream.write_all(&[2]).await.unwrap();

    let _challenge = read_n(&mut stream, 16).await;
    stream.write_all(&[0u8; 16]).await.unwrap(); // wrong response

    let result = read_n(&mut stream, 4).await;
    assert_eq!(u32::from_be_bytes(result.try_into().unwrap()), 1);
    let reason_len = read_n(&mut stream, 4).await;
    let reason_len = u32::from_be_bytes(reason_len.try_into().unwrap()) as usize;
    let reason = read_n(&mut stream, reason_len).await;
    assert_eq!(reason, b"Authentication failed");

    // No ServerInit follows; the connection just ends.
    let mut probe = [0u8; 1];
    let eof = timeout(IO_TIMEOUT, stream.read(&mut probe)).await.unwrap();
    assert_eq!(eof.unwrap(), 0);
}

#[tokio::test]
async fn full_update_then_quiet_incrementals() {
    let screen = TestScreen::solid(64, 64, [10, 20, 30, 255]);
    let config = ServerConfig {
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (w, h, _) = handshake_none_auth(&mut stream).await;
    send_set_encodings(&mut stream, &[0]).await;

    send_update_request(&mut stream, false, Rect::new(0, 0, w, h)).await;
    let rects = read_update(&mut stream, 4).await;
    assert_eq!(rects.len(), 1);
    assert_eq!((rects[0].x, rects[0].y, rects[0].w, rects[0].h), (0, 0, w, h));
    assert_eq!(rects[0].encoding, 0);
    // Raw payload carries the BGRA pixels verbatim.
    assert_eq!(&rects[0].payload[..4], &[10, 20, 30, 255]);

    // Unchanged screen: the request spam collapses into at most one
    // empty update.
    for _ in 0..5 {
        send_update_request(&mut stream, true, Rect::new(0, 0, w, h)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let head = read_n(&mut stream, 4).await;
    assert_eq!(head, vec![0, 0, 0, 0], "empty FramebufferUpdate");

    // Then silence until the screen actually changes.
    let mut probe = [0u8; 1];
    let quiet = timeout(Duration::from_millis(300), stream.read(&mut probe)).await;
    assert!(quiet.is_err(), "server must withhold further updates");
}

#[tokio::test]
async fn pixel_format_switch_to_rgb565() {
    let screen = TestScreen::solid(64, 48, [0, 0, 255, 255]); // pure red
    let config = ServerConfig {
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (w, h, _) = handshake_none_auth(&mut stream).await;

    // SetPixelFormat: RGB565 little-endian.
    let mut msg = vec![0u8, 0, 0, 0];
    msg.extend_from_slice(&[16, 16, 0, 1]);
    msg.extend_from_slice(&31u16.to_be_bytes());
    msg.extend_from_slice(&63u16.to_be_bytes());
    msg.extend_from_slice(&31u16.to_be_bytes());
    msg.extend_from_slice(&[11, 5, 0]);
    msg.extend_from_slice(&[0, 0, 0]);
    stream.write_all(&msg).await.unwrap();

    send_update_request(&mut stream, false, Rect::new(0, 0, w, h)).await;
    let rects = read_update(&mut stream, 2).await;
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0].payload.len(), w as usize * h as usize * 2);
    for pixel in rects[0].payload.chunks_exact(2) {
        assert_eq!(u16::from_le_bytes([pixel[0], pixel[1]]), 0xF800);
    }
}

#[tokio::test]
async fn vertical_scroll_produces_copyrect() {
    let w = 256u32;
    let h = 256u32;
    let mut frame1 = vec![0u8; (w * h * 4) as usize];
    for y in 0..h {
        for x in 0..w {
            let off = ((y * w + x) * 4) as usize;
            frame1[off] = (y % 251) as u8;
            frame1[off + 1] = (x % 251) as u8;
            frame1[off + 2] = ((x ^ y) % 251) as u8;
        }
    }
    let screen = TestScreen::new(w, h, frame1.clone());
    let config = ServerConfig {
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, Arc::clone(&screen)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (fw, fh, _) = handshake_none_auth(&mut stream).await;
    send_set_encodings(&mut stream, &[1, 0]).await;

    send_update_request(&mut stream, false, Rect::new(0, 0, fw, fh)).await;
    let _initial = read_update(&mut stream, 4).await;

    // Scroll the content up by 16 rows; fresh rows at the bottom.
    let shift = 16u32;
    let mut frame2 = vec![0x7Fu8; (w * h * 4) as usize];
    for y in 0..(h - shift) {
        let src = ((y + shift) * w * 4) as usize;
        let dst = (y * w * 4) as usize;
        frame2[dst..dst + (w * 4) as usize].copy_from_slice(&frame1[src..src + (w * 4) as usize]);
    }
    screen.set_pixels(frame2);

    send_update_request(&mut stream, true, Rect::new(0, 0, fw, fh)).await;
    let rects = read_update(&mut stream, 4).await;

    let copy = rects
        .iter()
        .find(|r| r.encoding == 1)
        .expect("scroll must yield a CopyRect");
    assert_eq!((copy.x, copy.y), (0, 0));
    assert_eq!(copy.h, (h - shift) as u16);
    let src_x = u16::from_be_bytes([copy.payload[0], copy.payload[1]]);
    let src_y = u16::from_be_bytes([copy.payload[2], copy.payload[3]]);
    assert_eq!((src_x, src_y), (0, shift as u16));

    // The exposed strip arrives as normally encoded pixels.
    assert!(rects.iter().any(|r| r.encoding == 0 && r.h == shift as u16));
}

/// Minimal masked-frame WebSocket client helpers.
mod ws {
    use super::*;

    pub async fn send_binary(stream: &mut TcpStream, payload: &[u8]) {
        let mask = [0x12u8, 0x34, 0x56, 0x78];
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(0x82); // FIN + binary
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % 4]),
        );
        stream.write_all(&frame).await.unwrap();
    }

    /// Collects unmasked binary payload until `needed` bytes arrived.
    pub async fn recv_exact(stream: &mut TcpStream, buffer: &mut Vec<u8>, needed: usize) -> Vec<u8> {
        while buffer.len() < needed {
            let head = read_n(stream, 2).await;
            assert_eq!(head[0] & 0x0F, 0x2, "server sends binary frames");
            assert_eq!(head[1] & 0x80, 0, "server frames are unmasked");
            let len7 = (head[1] & 0x7F) as usize;
            let len = match len7 {
                126 => {
                    let ext = read_n(stream, 2).await;
                    u16::from_be_bytes([ext[0], ext[1]]) as usize
                }
                127 => {
                    let ext = read_n(stream, 8).await;
                    u64::from_be_bytes(ext.try_into().unwrap()) as usize
                }
                n => n,
            };
            buffer.extend_from_slice(&read_n(stream, len).await);
        }
        buffer.drain(..needed).collect()
    }
}

#[tokio::test]
async fn websocket_upgrade_carries_the_same_session() {
    let screen = TestScreen::solid(320, 200, [9, 9, 9, 255]);
    let config = ServerConfig {
        desktop_name: "PyVNC".to_string(),
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
         Connection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: binary\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // Read the 101 response head.
    let mut response = Vec::new();
    loop {
        let byte = read_n(&mut stream, 1).await;
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        assert!(response.len() < 4096);
    }
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert!(response.contains("Sec-WebSocket-Protocol: binary"));

    // The RFB session proceeds inside binary frames.
    let mut rx = Vec::new();
    let version = ws::recv_exact(&mut stream, &mut rx, 12).await;
    assert_eq!(&version, b"RFB 003.008\n");
    ws::send_binary(&mut stream, b"RFB 003.008\n").await;

    let security = ws::recv_exact(&mut stream, &mut rx, 2).await;
    assert_eq!(security, vec![1, 1]);
    ws::send_binary(&mut stream, &[1]).await;

    let result = ws::recv_exact(&mut stream, &mut rx, 4).await;
    assert_eq!(u32::from_be_bytes(result.try_into().unwrap()), 0);

    ws::send_binary(&mut stream, &[1]).await; // ClientInit

    let init_head = ws::recv_exact(&mut stream, &mut rx, 24).await;
    let width = u16::from_be_bytes([init_head[0], init_head[1]]);
    let height = u16::from_be_bytes([init_head[2], init_head[3]]);
    assert_eq!((width, height), (320, 200));
    let name_len =
        u32::from_be_bytes([init_head[20], init_head[21], init_head[22], init_head[23]]) as usize;
    let name = ws::recv_exact(&mut stream, &mut rx, name_len).await;
    assert_eq!(name, b"PyVNC");
}

#[tokio::test]
async fn saturated_pool_rejects_with_reason() {
    let screen = TestScreen::solid(32, 32, [0, 0, 0, 255]);
    let config = ServerConfig {
        max_connections: 1,
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    // First connection occupies the single pool slot.
    let _occupant = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut rejected = TcpStream::connect(addr).await.unwrap();
    let version = read_n(&mut rejected, 12).await;
    assert_eq!(&version, b"RFB 003.008\n");
    rejected.write_all(b"RFB 003.008\n").await.unwrap();

    let count = read_n(&mut rejected, 1).await;
    assert_eq!(count[0], 0, "zero security types on saturation");
    let reason_len = read_n(&mut rejected, 4).await;
    let reason_len = u32::from_be_bytes(reason_len.try_into().unwrap()) as usize;
    let reason = read_n(&mut rejected, reason_len).await;
    assert_eq!(reason, b"Too many connections");
}

#[tokio::test]
async fn shrinking_framebuffer_clamps_stale_requests() {
    let screen = TestScreen::solid(128, 128, [4, 5, 6, 255]);
    let config = ServerConfig {
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, Arc::clone(&screen)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (w, h, _) = handshake_none_auth(&mut stream).await;
    assert_eq!((w, h), (128, 128));

    send_update_request(&mut stream, false, Rect::new(0, 0, w, h)).await;
    let initial = read_update(&mut stream, 4).await;
    assert_eq!((initial[0].w, initial[0].h), (128, 128));

    // The screen shrinks; the next request still names the old bounds
    // and must be served clamped, not crash the session.
    let mut frame = screen.frame.lock().unwrap();
    frame.0 = [7u8, 8, 9, 255].repeat(64 * 64);
    frame.1 = 64;
    frame.2 = 64;
    drop(frame);

    send_update_request(&mut stream, false, Rect::new(0, 0, 128, 128)).await;
    let rects = read_update(&mut stream, 4).await;
    assert_eq!(rects.len(), 1);
    assert_eq!((rects[0].x, rects[0].y, rects[0].w, rects[0].h), (0, 0, 64, 64));
    assert_eq!(rects[0].payload.len(), 64 * 64 * 4);
    assert_eq!(&rects[0].payload[..4], &[7, 8, 9, 255]);

    // The session is still healthy: another request round-trips.
    send_update_request(&mut stream, false, Rect::new(0, 0, 64, 64)).await;
    let again = read_update(&mut stream, 4).await;
    assert_eq!((again[0].w, again[0].h), (64, 64));
}

#[tokio::test]
async fn malformed_message_type_closes_connection() {
    let screen = TestScreen::solid(32, 32, [0, 0, 0, 255]);
    let config = ServerConfig {
        enable_websocket: false,
        ..Default::default()
    };
    let (_server, addr) = start_server(config, screen).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none_auth(&mut stream).await;

    stream.write_all(&[0xAA, 0, 0, 0]).await.unwrap();
    let mut probe = [0u8; 16];
    let eof = timeout(IO_TIMEOUT, stream.read(&mut probe)).await.unwrap();
    assert_eq!(eof.unwrap(), 0, "unknown message type must close");
}
