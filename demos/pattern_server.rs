//! Headless server example with an animated test pattern.
//!
//! Serves a moving gradient so a real viewer can be pointed at the
//! server without any screen-capture backend.
//!
//! Usage:
//!   cargo run --example pattern_server
//!   vncviewer localhost:5900

use rfbserver::{
    Capture, CaptureError, NullInputSink, Rect, ScreenSource, ServerConfig, VncServer,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// A screen source that renders a time-dependent gradient.
struct PatternScreen {
    start: Instant,
}

#[async_trait::async_trait]
impl ScreenSource for PatternScreen {
    async fn capture(&self, _region: Option<Rect>) -> Result<Capture, CaptureError> {
        let frame = self.start.elapsed().as_millis() / 33;
        let mut pixels = vec![0u8; (WIDTH * HEIGHT * 4) as usize];
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let offset = ((y * WIDTH + x) * 4) as usize;
                pixels[offset] = ((frame / 2) % 256) as u8; // B
                pixels[offset + 1] = ((y as u128 + frame) % 256) as u8; // G
                pixels[offset + 2] = ((x as u128 + frame) % 256) as u8; // R
                pixels[offset + 3] = 255;
            }
        }
        Ok(Capture {
            pixels,
            width: WIDTH,
            height: HEIGHT,
            timestamp: Instant::now(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = ServerConfig {
        desktop_name: "pattern".to_string(),
        ..Default::default()
    };
    let screen = Arc::new(PatternScreen {
        start: Instant::now(),
    });
    let (server, mut events) = VncServer::new(config, screen, Arc::new(NullInputSink));

    println!("Serving test pattern on port 5900, connect with: vncviewer localhost:5900");

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    server.listen().await?;
    Ok(())
}
