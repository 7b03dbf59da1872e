//! Server events observable by the embedding application.

use std::net::SocketAddr;

/// Events emitted by the server as sessions come, go, and send input.
///
/// Input is also delivered to the configured
/// [`InputSink`](crate::source::InputSink); this stream exists so an
/// application can observe session lifecycle and traffic without
/// implementing a sink.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed its handshake.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Peer socket address.
        address: SocketAddr,
    },

    /// A client disconnected or was dropped.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
    },

    /// Pointer movement or button change from a client.
    PointerEvent {
        /// Client identifier.
        client_id: usize,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Held buttons, bit 0 = left.
        button_mask: u8,
    },

    /// Key press or release from a client.
    KeyEvent {
        /// Client identifier.
        client_id: usize,
        /// X11 keysym.
        keysym: u32,
        /// True if pressed.
        pressed: bool,
    },

    /// Clipboard text received from a client.
    ClipboardReceived {
        /// Client identifier.
        client_id: usize,
        /// Clipboard bytes (Latin-1 per RFB).
        text: Vec<u8>,
    },
}
