//! Per-connection session handling.
//!
//! Each accepted transport gets one [`Session`] driven by its own task:
//! the RFB handshake (version, security, init), the message dispatch
//! loop, and the update scheduler that paces captures, diffs them, and
//! streams encoded rectangles back. Session state is exclusively owned
//! by the task; the supervisor only keeps a command channel and an
//! activity timestamp.

use bytes::{BufMut, BytesMut};
use log::{debug, info, trace, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::auth;
use crate::config::{NetworkProfile, ServerConfig};
use crate::diff::ChangeDetector;
use crate::encoding::{
    self, CompressStreams, ContentHint, EncodeContext, EncoderSelector, SelectionInputs,
};
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::framebuffer::{find_vertical_scroll, Snapshot};
use crate::protocol::*;
use crate::source::{CaptureError, InputSink, ScreenSource};
use crate::transport::Transport;

/// Commands the supervisor can push into a running session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Ring the client's bell.
    Bell,
    /// Push clipboard text to the client.
    CutText(Vec<u8>),
    /// Ask the session to close cooperatively.
    Close,
}

/// Session lifecycle, advanced strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SessionState {
    Accepted,
    VersionNegotiated,
    SecurityNegotiated,
    Initialized,
    Serving,
    Closing,
    Closed,
}

/// Capabilities a client declares through pseudo-encodings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PseudoCaps {
    pub cursor: bool,
    pub desktop_size: bool,
    pub extended_desktop_size: bool,
    pub continuous_updates: bool,
    pub last_rect: bool,
}

impl PseudoCaps {
    /// Extracts capability flags from a SetEncodings list.
    pub(crate) fn from_encodings(encodings: &[i32]) -> Self {
        Self {
            cursor: encodings.contains(&ENCODING_CURSOR),
            desktop_size: encodings.contains(&ENCODING_DESKTOP_SIZE),
            extended_desktop_size: encodings.contains(&ENCODING_EXTENDED_DESKTOP_SIZE),
            continuous_updates: encodings.contains(&ENCODING_CONTINUOUS_UPDATES),
            last_rect: encodings.contains(&ENCODING_LAST_RECT),
        }
    }
}

/// An unanswered FramebufferUpdateRequest.
#[derive(Debug, Clone, Copy)]
struct PendingUpdate {
    incremental: bool,
    region: Rect,
    since: Instant,
}

/// Folds a new update request into the pending one.
///
/// With coalescing the regions union and `incremental` is the logical
/// AND, collapsing request spam on slow links; without it the newest
/// request simply replaces the old.
fn coalesce_request(
    pending: Option<PendingUpdate>,
    incremental: bool,
    region: Rect,
    coalescing: bool,
    now: Instant,
) -> PendingUpdate {
    match pending {
        Some(old) if coalescing => PendingUpdate {
            incremental: old.incremental && incremental,
            region: old.region.union(&region),
            since: old.since,
        },
        _ => PendingUpdate {
            incremental,
            region,
            since: now,
        },
    }
}

/// Quality-level pseudo-encodings map to these JPEG qualities, matching
/// the TigerVNC table.
const QUALITY_TABLE: [u8; 10] = [15, 29, 41, 42, 62, 77, 79, 86, 92, 100];

/// One encoded rectangle ready for framing.
struct EncodedRect {
    rect: Rect,
    encoding: i32,
    bytes: BytesMut,
}

/// Shared handles the supervisor keeps per session.
pub(crate) struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    /// Milliseconds since the server epoch of the last client activity.
    pub last_activity: Arc<AtomicU64>,
}

/// Everything a session needs from the supervisor. The shutdown signal
/// and command channel are passed to [`Session::run`] separately.
pub(crate) struct SessionContext {
    pub id: usize,
    pub peer: SocketAddr,
    pub config: Arc<ServerConfig>,
    pub screen: Arc<dyn ScreenSource>,
    pub input: Arc<dyn InputSink>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub last_activity: Arc<AtomicU64>,
    pub epoch: Instant,
}

/// A single client connection.
pub(crate) struct Session {
    id: usize,
    transport: Transport,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    screen: Arc<dyn ScreenSource>,
    input: Arc<dyn InputSink>,
    events: mpsc::UnboundedSender<ServerEvent>,
    last_activity: Arc<AtomicU64>,
    epoch: Instant,

    state: SessionState,
    version: ProtocolVersion,
    pixel_format: PixelFormat,
    client_encodings: Vec<i32>,
    caps: PseudoCaps,
    ultravnc: bool,
    jpeg_quality: u8,
    /// Deflate level the client requested through a compress-level
    /// pseudo-encoding; absent, the selector's per-profile level rules.
    compression_override: Option<u8>,

    snapshot: Snapshot,
    detector: ChangeDetector,
    pending: Option<PendingUpdate>,
    button_state: u8,
    streams: CompressStreams,
    selector: EncoderSelector,
    profile: NetworkProfile,
    frame_interval: Duration,
    last_send: Instant,
    updates_sent: u32,
    /// Dirty rectangles of the previous update, for the dynamic hint.
    prev_dirty: Vec<Rect>,
    /// Dirty rectangles detected but not yet sent because they fell
    /// outside the requested region. Folded into the next update.
    carry_dirty: Vec<Rect>,
    /// One empty reply was already sent for the current quiet period.
    empty_reply_sent: bool,
    encode_permits: Arc<Semaphore>,
    /// Buffered inbound bytes; messages are decoded from the front.
    /// Shared between the handshake and the serving loop so pipelined
    /// client bytes survive the transition.
    inbox: BytesMut,
}

impl Session {
    /// Builds a session over an already-detected transport.
    pub(crate) fn new(transport: Transport, ctx: &SessionContext) -> Self {
        let profile = ctx.config.profile_for(ctx.peer.ip());
        let frame_interval = ctx.config.frame_interval(profile);
        let selector = EncoderSelector::new(&ctx.config);
        let workers = ctx.config.encoding_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(2)
        });
        let jpeg_quality = ctx
            .config
            .lan
            .jpeg_quality_initial
            .clamp(ctx.config.lan.jpeg_quality_min, ctx.config.lan.jpeg_quality_max);

        Self {
            id: ctx.id,
            transport,
            peer: ctx.peer,
            config: Arc::clone(&ctx.config),
            screen: Arc::clone(&ctx.screen),
            input: Arc::clone(&ctx.input),
            events: ctx.events.clone(),
            last_activity: Arc::clone(&ctx.last_activity),
            epoch: ctx.epoch,
            state: SessionState::Accepted,
            version: ProtocolVersion::Rfb38,
            pixel_format: PixelFormat::bgra32(),
            client_encodings: vec![ENCODING_RAW],
            caps: PseudoCaps::default(),
            ultravnc: false,
            jpeg_quality,
            compression_override: None,
            snapshot: Snapshot::empty(),
            detector: ChangeDetector::new(),
            pending: None,
            button_state: 0,
            streams: CompressStreams::new(),
            selector,
            profile,
            frame_interval,
            last_send: Instant::now(),
            updates_sent: 0,
            prev_dirty: Vec::new(),
            carry_dirty: Vec::new(),
            empty_reply_sent: false,
            encode_permits: Arc::new(Semaphore::new(workers)),
            inbox: BytesMut::with_capacity(4096),
        }
    }

    fn touch_activity(&self) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_activity.store(
            self.epoch.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    /// Drives the whole session: handshake, then the serving loop.
    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        let handshake_deadline = self.config.client_socket_timeout;
        match tokio::time::timeout(handshake_deadline, self.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.close().await;
                return Err(e);
            }
            Err(_) => {
                self.close().await;
                return Err(VncError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timed out",
                )));
            }
        }

        self.state = SessionState::Serving;
        let _ = self.events.send(ServerEvent::ClientConnected {
            id: self.id,
            address: self.peer,
        });

        let result = self.serve(&mut shutdown, &mut commands).await;

        self.close().await;
        let _ = self.events.send(ServerEvent::ClientDisconnected { id: self.id });
        match result {
            Err(e) if e.is_disconnect() => {
                info!("client {} disconnected: {e}", self.id);
                Ok(())
            }
            other => other,
        }
    }

    /// Version, security, ClientInit, ServerInit.
    async fn handshake(&mut self) -> Result<()> {
        self.transport.write_all(PROTOCOL_VERSION.as_bytes()).await?;

        let version_buf = self.read_exact(12).await?;
        let mut version_bytes = [0u8; 12];
        version_bytes.copy_from_slice(&version_buf[..12]);
        self.version = ProtocolVersion::from_client_bytes(&version_bytes);
        self.state = SessionState::VersionNegotiated;
        info!(
            "client {} ({}) negotiated {:?}",
            self.id, self.peer, self.version
        );

        self.negotiate_security().await?;
        self.state = SessionState::SecurityNegotiated;

        // ClientInit: the shared flag is honoured by always sharing.
        let shared = self.read_exact(1).await?;
        debug!("client {} shared flag: {}", self.id, shared[0]);

        // First capture sizes the framebuffer for ServerInit.
        let capture = match self.screen.capture(None).await {
            Ok(c) => c,
            Err(CaptureError::Unavailable) => {
                return Err(VncError::CaptureFailed(
                    "screen source unavailable during init".into(),
                ))
            }
            Err(CaptureError::Fatal(why)) => return Err(VncError::CaptureFailed(why)),
        };
        self.snapshot = Snapshot::from_capture(&capture, self.config.scale_factor);

        let server_init = ServerInit {
            framebuffer_width: self.snapshot.width(),
            framebuffer_height: self.snapshot.height(),
            pixel_format: PixelFormat::bgra32(),
            name: self.config.desktop_name.clone(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        self.transport.write_all(&buf).await?;
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Security negotiation for the negotiated protocol version.
    async fn negotiate_security(&mut self) -> Result<()> {
        let auth_required = !self.config.password.is_empty();
        let security_type = if auth_required {
            SECURITY_TYPE_VNC_AUTH
        } else {
            SECURITY_TYPE_NONE
        };

        match self.version {
            ProtocolVersion::Rfb33 => {
                // The server dictates the type as a u32; no client reply.
                let mut buf = BytesMut::new();
                buf.put_u32(u32::from(security_type));
                self.transport.write_all(&buf).await?;
            }
            ProtocolVersion::Rfb37 | ProtocolVersion::Rfb38 => {
                self.transport.write_all(&[1, security_type]).await?;
                let choice = self.read_exact(1).await?;
                if choice[0] != security_type {
                    return Err(VncError::Protocol(format!(
                        "client selected unsupported security type {}",
                        choice[0]
                    )));
                }
            }
        }

        if auth_required {
            self.vnc_authenticate().await?;
        } else if self.version == ProtocolVersion::Rfb38 {
            // 3.8 sends SecurityResult even for None; 3.3/3.7 do not.
            let mut buf = BytesMut::new();
            buf.put_u32(SECURITY_RESULT_OK);
            self.transport.write_all(&buf).await?;
        }
        Ok(())
    }

    /// DES challenge-response, with SecurityResult and the 3.8 reason
    /// string on failure.
    async fn vnc_authenticate(&mut self) -> Result<()> {
        let challenge = auth::generate_challenge();
        self.transport.write_all(&challenge).await?;

        let response_buf = self.read_exact(16).await?;
        let mut response = [0u8; 16];
        response.copy_from_slice(&response_buf[..16]);

        let ok = auth::verify_response(&self.config.password, &challenge, &response);
        let mut buf = BytesMut::new();
        if ok {
            buf.put_u32(SECURITY_RESULT_OK);
            self.transport.write_all(&buf).await?;
            Ok(())
        } else {
            buf.put_u32(SECURITY_RESULT_FAILED);
            if self.version == ProtocolVersion::Rfb38 {
                let reason = b"Authentication failed";
                buf.put_u32(reason.len() as u32);
                buf.put_slice(reason);
            }
            self.transport.write_all(&buf).await?;
            Err(VncError::AuthenticationFailed)
        }
    }

    /// The serving loop: dispatch incoming messages, tick the scheduler,
    /// honour supervisor commands, observe shutdown.
    async fn serve(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        let limits = MessageLimits {
            max_set_encodings: self.config.max_set_encodings,
            max_client_cut_text: self.config.max_client_cut_text,
        };
        let mut tick = tokio::time::interval(Duration::from_millis(8));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Messages pipelined behind the handshake may already be
        // buffered; drain them before waiting on the socket.
        loop {
            match ClientMessage::decode(&mut self.inbox, &limits) {
                Decoded::Ok(message) => self.handle_message(message).await?,
                Decoded::Truncated => break,
                Decoded::Malformed(why) => return Err(VncError::Protocol(why.into())),
            }
        }

        while self.state == SessionState::Serving {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("client {}: shutdown signalled", self.id);
                        self.state = SessionState::Closing;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Bell) => self.send_bell().await?,
                        Some(SessionCommand::CutText(text)) => self.send_cut_text(&text).await?,
                        Some(SessionCommand::Close) | None => {
                            self.state = SessionState::Closing;
                        }
                    }
                }
                read = self.transport.read_buf(&mut self.inbox) => {
                    let n = read?;
                    if n == 0 {
                        self.state = SessionState::Closing;
                        continue;
                    }
                    self.touch_activity();
                    loop {
                        match ClientMessage::decode(&mut self.inbox, &limits) {
                            Decoded::Ok(message) => self.handle_message(message).await?,
                            Decoded::Truncated => break,
                            Decoded::Malformed(why) => {
                                warn!("client {}: {why}, closing", self.id);
                                return Err(VncError::Protocol(why.into()));
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    self.maybe_send_update().await?;
                }
            }
        }
        Ok(())
    }

    /// Applies one decoded client message.
    async fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::SetPixelFormat(format) => {
                if !format.is_valid() {
                    warn!(
                        "client {} requested unusable pixel format ({}bpp depth {}), closing",
                        self.id, format.bits_per_pixel, format.depth
                    );
                    return Err(VncError::InvalidPixelFormat);
                }
                info!(
                    "client {} set pixel format: {}bpp depth {} shifts R{} G{} B{}",
                    self.id,
                    format.bits_per_pixel,
                    format.depth,
                    format.red_shift,
                    format.green_shift,
                    format.blue_shift
                );
                self.pixel_format = format;
                // The client re-requests after a format change.
                self.pending = None;
            }
            ClientMessage::SetEncodings(encodings) => {
                self.apply_set_encodings(encodings);
            }
            ClientMessage::FramebufferUpdateRequest {
                incremental,
                region,
            } => {
                let region = region
                    .clamp_to(self.snapshot.width().max(1), self.snapshot.height().max(1))
                    .unwrap_or(Rect::new(0, 0, self.snapshot.width(), self.snapshot.height()));
                trace!(
                    "client {} update request incremental={incremental} region={region:?}",
                    self.id
                );
                if !incremental {
                    self.empty_reply_sent = false;
                }
                self.pending = Some(coalesce_request(
                    self.pending,
                    incremental,
                    region,
                    self.config.enable_request_coalescing,
                    Instant::now(),
                ));
            }
            ClientMessage::KeyEvent { down, keysym } => {
                if let Err(e) = self.input.inject_key(keysym, down) {
                    warn!("client {}: key injection failed: {e}", self.id);
                }
                let _ = self.events.send(ServerEvent::KeyEvent {
                    client_id: self.id,
                    keysym,
                    pressed: down,
                });
            }
            ClientMessage::PointerEvent { button_mask, x, y } => {
                let pressed = button_mask & !self.button_state;
                let released = self.button_state & !button_mask;
                if pressed != 0 || released != 0 {
                    trace!(
                        "client {} buttons +{pressed:#04x} -{released:#04x}",
                        self.id
                    );
                }
                self.button_state = button_mask;
                if let Err(e) = self
                    .input
                    .inject_pointer(i32::from(x), i32::from(y), button_mask)
                {
                    warn!("client {}: pointer injection failed: {e}", self.id);
                }
                let _ = self.events.send(ServerEvent::PointerEvent {
                    client_id: self.id,
                    x,
                    y,
                    button_mask,
                });
            }
            ClientMessage::ClientCutText(text) => {
                if let Err(e) = self.input.set_clipboard(&text) {
                    warn!("client {}: clipboard update failed: {e}", self.id);
                }
                let _ = self.events.send(ServerEvent::ClipboardReceived {
                    client_id: self.id,
                    text,
                });
            }
        }
        Ok(())
    }

    /// Stores the encoding list verbatim and derives the capability
    /// flags and quality/compression settings it carries.
    fn apply_set_encodings(&mut self, encodings: Vec<i32>) {
        self.caps = PseudoCaps::from_encodings(&encodings);
        self.ultravnc = encodings.contains(&ENCODING_ULTRA) || encodings.contains(&ENCODING_ULTRA2);

        for &encoding in &encodings {
            if (ENCODING_QUALITY_LEVEL_0..=ENCODING_QUALITY_LEVEL_9).contains(&encoding) {
                let level = (encoding - ENCODING_QUALITY_LEVEL_0) as usize;
                self.jpeg_quality = QUALITY_TABLE[level].clamp(
                    self.config.lan.jpeg_quality_min,
                    self.config.lan.jpeg_quality_max,
                );
            }
            if (ENCODING_COMPRESS_LEVEL_0..=ENCODING_COMPRESS_LEVEL_9).contains(&encoding) {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    self.compression_override =
                        Some((encoding - ENCODING_COMPRESS_LEVEL_0) as u8);
                }
            }
        }

        info!(
            "client {} set {} encodings (cursor={} desktop_size={} continuous={} last_rect={})",
            self.id,
            encodings.len(),
            self.caps.cursor,
            self.caps.desktop_size,
            self.caps.continuous_updates,
            self.caps.last_rect
        );
        self.client_encodings = encodings;
    }

    /// One scheduler cycle: pacing, capture, diff, encode, send.
    async fn maybe_send_update(&mut self) -> Result<()> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        if self.last_send.elapsed() < self.frame_interval {
            return Ok(());
        }

        let capture = match self.screen.capture(None).await {
            Ok(c) => c,
            Err(CaptureError::Unavailable) => return Ok(()), // skip this cycle
            Err(CaptureError::Fatal(why)) => return Err(VncError::CaptureFailed(why)),
        };
        let current = Snapshot::from_capture(&capture, self.config.scale_factor);

        // Dimension change: notify capable clients, rescan from scratch.
        // Regions tracked against the old geometry are stale and must
        // not reach the extractors.
        if !current.same_dimensions(&self.snapshot) && !self.snapshot.is_empty() {
            info!(
                "client {}: framebuffer resized to {}x{}",
                self.id,
                current.width(),
                current.height()
            );
            self.detector.invalidate();
            self.carry_dirty.clear();
            self.prev_dirty.clear();
            if self.caps.desktop_size {
                self.send_desktop_size(current.width(), current.height())
                    .await?;
            }
        }

        // The pending region was clamped against the snapshot that
        // existed at request time; the framebuffer may have shrunk
        // since.
        let pending = match pending
            .region
            .clamp_to(current.width(), current.height())
        {
            Some(region) => PendingUpdate { region, ..pending },
            None => {
                // The requested region vanished with the resize; adopt
                // the new geometry so the next request is judged
                // against it.
                self.snapshot = current;
                self.send_empty_update().await?;
                self.pending = None;
                self.last_send = Instant::now();
                return Ok(());
            }
        };

        let full_frame = Rect::new(0, 0, current.width(), current.height());
        let scan = if self.config.enable_region_detection {
            self.detector.scan(&current)
        } else {
            crate::diff::ScanOutcome {
                rects: vec![full_frame],
                full_frame: true,
            }
        };

        let rects: Vec<Rect> = if pending.incremental {
            // Changes detected earlier but never requested stay eligible
            // until a request covers them.
            let mut candidates = std::mem::take(&mut self.carry_dirty);
            candidates.extend(scan.rects);
            let mut sent = Vec::new();
            for candidate in candidates {
                match candidate.intersect(&pending.region) {
                    Some(hit) => {
                        // Only the uncovered remainder stays pending.
                        self.carry_dirty.extend(candidate.subtract(&pending.region));
                        sent.push(hit);
                    }
                    None => self.carry_dirty.push(candidate),
                }
            }
            sent
        } else {
            // A full refresh answers with the requested region exactly,
            // tiled by a single rectangle.
            self.carry_dirty = self
                .carry_dirty
                .iter()
                .flat_map(|r| r.subtract(&pending.region))
                .collect();
            vec![pending.region]
        };

        // Final guard: nothing leaves this cycle unless it fits the
        // frame the pixels will be extracted from.
        let rects: Vec<Rect> = rects
            .into_iter()
            .filter_map(|r| r.clamp_to(current.width(), current.height()))
            .collect();

        if rects.is_empty() {
            return self.answer_quiet_cycle(pending).await;
        }
        self.empty_reply_sent = false;

        let update = self.build_update(&rects, &current).await?;
        self.transport.write_all(&update).await?;

        self.prev_dirty = rects;
        self.snapshot = current;
        self.pending = None;
        self.updates_sent = self.updates_sent.saturating_add(1);
        self.last_send = Instant::now();
        Ok(())
    }

    /// Nothing changed: answer (or keep deferring) an incremental
    /// request.
    async fn answer_quiet_cycle(&mut self, pending: PendingUpdate) -> Result<()> {
        if !self.config.enable_request_coalescing {
            self.send_empty_update().await?;
            self.pending = None;
            self.last_send = Instant::now();
            return Ok(());
        }

        // With coalescing: answer once after the deferral deadline, then
        // stay quiet until pixels change. ContinuousUpdates clients get
        // the same deadline; they negotiated not to be polled.
        let deadline = self.frame_interval * 2;
        if !self.empty_reply_sent
            && self.detector.clean_streak() >= 2
            && pending.since.elapsed() >= deadline
        {
            self.send_empty_update().await?;
            self.empty_reply_sent = true;
            self.pending = None;
            self.last_send = Instant::now();
        }
        Ok(())
    }

    /// Encodes the rectangles and frames a FramebufferUpdate.
    async fn build_update(&mut self, rects: &[Rect], current: &Snapshot) -> Result<BytesMut> {
        let fb_area = (current.width() as f64) * (current.height() as f64);
        let supports_copyrect = self.client_encodings.contains(&ENCODING_COPYRECT);

        // Plan the rectangles: verified scrolls become CopyRects (always
        // emitted first), everything else goes through the selector.
        let mut copy_rects: Vec<(Rect, u16, u16)> = Vec::new();
        let mut encode_jobs: Vec<(Rect, ContentHint)> = Vec::new();

        for rect in rects {
            if supports_copyrect {
                if let Some(scroll) = find_vertical_scroll(&self.snapshot, current, rect) {
                    copy_rects.push((scroll.dest, scroll.src_x, scroll.src_y));
                    if let Some(exposed) = scroll.exposed {
                        encode_jobs.push((exposed, ContentHint::Dynamic));
                    }
                    continue;
                }
            }
            let (solid_fraction, _) = current.solid_fraction(rect);
            let hint = if solid_fraction >= 0.95 {
                ContentHint::Solid
            } else if self.prev_dirty.iter().any(|p| p.overlaps(rect)) {
                ContentHint::Dynamic
            } else {
                ContentHint::Static
            };
            encode_jobs.push((*rect, hint));
        }

        let encoded = self.encode_rects(&encode_jobs, current, fb_area).await?;

        let total = copy_rects.len() + encoded.len();
        let open_ended = self.caps.last_rect
            && self.config.enable_parallel_encoding
            && encoded.len() > 1;

        let mut update = BytesMut::new();
        update.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        update.put_u8(0); // padding
        #[allow(clippy::cast_possible_truncation)]
        if open_ended {
            update.put_u16(0xFFFF);
        } else {
            update.put_u16(total as u16);
        }

        for (dest, src_x, src_y) in &copy_rects {
            dest.write_header(ENCODING_COPYRECT, &mut update);
            update.put_u16(*src_x);
            update.put_u16(*src_y);
        }
        for er in encoded {
            er.rect.write_header(er.encoding, &mut update);
            update.extend_from_slice(&er.bytes);
        }
        if open_ended {
            Rect::new(0, 0, 0, 0).write_header(ENCODING_LAST_RECT, &mut update);
        }
        Ok(update)
    }

    /// Encodes every job, fanning stateless encoders out to blocking
    /// workers when configured. Emission order always matches job order.
    async fn encode_rects(
        &mut self,
        jobs: &[(Rect, ContentHint)],
        current: &Snapshot,
        fb_area: f64,
    ) -> Result<Vec<EncodedRect>> {
        let mut slots: Vec<Option<EncodedRect>> = Vec::with_capacity(jobs.len());
        slots.resize_with(jobs.len(), || None);
        let mut workers = Vec::new();

        for (index, (rect, hint)) in jobs.iter().enumerate() {
            let selection = self.selector.select(&SelectionInputs {
                client_encodings: &self.client_encodings,
                hint: *hint,
                area_fraction: rect.area() as f64 / fb_area.max(1.0),
                pixel_count: rect.area(),
                width: rect.w,
                profile: self.profile,
                updates_sent: self.updates_sent,
                ultravnc: self.ultravnc,
            });

            let encoder = encoding::get_encoder(selection.encoding)
                .unwrap_or_else(|| encoding::get_encoder(ENCODING_RAW).expect("raw encoder"));
            let pixels = current.extract_rect(rect);

            if self.config.enable_parallel_encoding && !encoder.uses_streams() && jobs.len() > 1 {
                // Stateless encoders can race; results rejoin by index.
                let permit = Arc::clone(&self.encode_permits)
                    .acquire_owned()
                    .await
                    .expect("encode semaphore closed");
                let format = self.pixel_format.clone();
                let quality = self.jpeg_quality;
                let compression = self.effective_compression(selection.encoding);
                let encoding_id = selection.encoding;
                let (w, h) = (rect.w, rect.h);
                let rect = *rect;
                workers.push((
                    index,
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        let mut scratch = CompressStreams::new();
                        let mut ctx = EncodeContext {
                            format: &format,
                            quality,
                            compression,
                            jpeg_allowed: false,
                            streams: &mut scratch,
                        };
                        let encoder = encoding::get_encoder(encoding_id).expect("known encoder");
                        let bytes = encoder.encode(&pixels, w, h, &mut ctx)?;
                        Ok::<(Rect, i32, BytesMut, Vec<u8>), VncError>((
                            rect,
                            encoding_id,
                            bytes,
                            pixels,
                        ))
                    }),
                ));
            } else {
                let encoded = self.encode_one(encoder, &pixels, *rect, selection.use_jpeg)?;
                slots[index] = Some(encoded);
            }
        }

        for (index, worker) in workers {
            let joined = worker
                .await
                .map_err(|e| VncError::Encoding(format!("encode worker panicked: {e}")))?;
            let (rect, encoding_id, bytes, pixels) = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Stateless encoders fall back to Raw on failure.
                    warn!("client {}: encoder failed ({e}), falling back to Raw", self.id);
                    (jobs[index].0, ENCODING_RAW, BytesMut::new(), Vec::new())
                }
            };
            let resolved = self.resolve_worker_result(rect, encoding_id, bytes, &pixels, current);
            slots[index] = Some(resolved);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Deflate level for an encoding: the client's requested level when
    /// one arrived, otherwise the profile-tuned default.
    fn effective_compression(&self, encoding: i32) -> u8 {
        self.compression_override
            .unwrap_or_else(|| self.selector.compression_level(encoding, self.profile))
    }

    /// Applies the Raw-fallback rule to a worker result.
    fn resolve_worker_result(
        &self,
        rect: Rect,
        encoding_id: i32,
        bytes: BytesMut,
        pixels: &[u8],
        current: &Snapshot,
    ) -> EncodedRect {
        let raw_len = rect.area() * self.pixel_format.bytes_per_pixel();
        if encoding_id != ENCODING_RAW && !bytes.is_empty() && bytes.len() <= raw_len {
            return EncodedRect {
                rect,
                encoding: encoding_id,
                bytes,
            };
        }
        // Oversized or failed: Raw wins.
        let pixels = if pixels.is_empty() {
            current.extract_rect(&rect)
        } else {
            pixels.to_vec()
        };
        EncodedRect {
            rect,
            encoding: ENCODING_RAW,
            bytes: crate::translate::convert(&pixels, &self.pixel_format),
        }
    }

    /// Encodes one rectangle on the session task, honouring the
    /// Raw-fallback rule for stateless encoders.
    fn encode_one(
        &mut self,
        encoder: &'static dyn encoding::Encoding,
        pixels: &[u8],
        rect: Rect,
        use_jpeg: bool,
    ) -> Result<EncodedRect> {
        let raw_len = rect.area() * self.pixel_format.bytes_per_pixel();
        let compression = self.effective_compression(encoder.id());
        let mut ctx = EncodeContext {
            format: &self.pixel_format,
            quality: self.jpeg_quality,
            compression,
            jpeg_allowed: use_jpeg,
            streams: &mut self.streams,
        };
        match encoder.encode(pixels, rect.w, rect.h, &mut ctx) {
            Ok(bytes) => {
                // A stateless result bigger than Raw is pointless; for
                // stream encoders the bytes are already part of the
                // deflate history and must be sent as-is.
                if !encoder.uses_streams()
                    && encoder.id() != ENCODING_RAW
                    && bytes.len() > raw_len
                {
                    return Ok(EncodedRect {
                        rect,
                        encoding: ENCODING_RAW,
                        bytes: crate::translate::convert(pixels, &self.pixel_format),
                    });
                }
                Ok(EncodedRect {
                    rect,
                    encoding: encoder.id(),
                    bytes,
                })
            }
            Err(e) if encoder.uses_streams() => {
                // Stream state is unrecoverable for the peer.
                Err(e)
            }
            Err(e) => {
                warn!(
                    "client {}: encoder {} failed ({e}), falling back to Raw",
                    self.id,
                    encoder.id()
                );
                Ok(EncodedRect {
                    rect,
                    encoding: ENCODING_RAW,
                    bytes: crate::translate::convert(pixels, &self.pixel_format),
                })
            }
        }
    }

    /// FramebufferUpdate with zero rectangles.
    async fn send_empty_update(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(0);
        self.transport.write_all(&buf).await
    }

    /// DesktopSize pseudo-rectangle announcing new dimensions.
    async fn send_desktop_size(&mut self, width: u16, height: u16) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(1);
        Rect::new(0, 0, width, height).write_header(ENCODING_DESKTOP_SIZE, &mut buf);
        self.transport.write_all(&buf).await
    }

    /// Bell message.
    async fn send_bell(&mut self) -> Result<()> {
        self.transport.write_all(&[SERVER_MSG_BELL]).await
    }

    /// ServerCutText message.
    async fn send_cut_text(&mut self, text: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 + text.len());
        buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        buf.put_bytes(0, 3);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(text.len() as u32);
        buf.put_slice(text);
        self.transport.write_all(&buf).await
    }

    /// Takes exactly `n` bytes from the inbox, reading as needed.
    async fn read_exact(&mut self, n: usize) -> Result<BytesMut> {
        while self.inbox.len() < n {
            let read = self.transport.read_buf(&mut self.inbox).await?;
            if read == 0 {
                return Err(VncError::ConnectionClosed);
            }
            self.touch_activity();
        }
        Ok(self.inbox.split_to(n))
    }

    /// Flushes the close and releases the socket.
    async fn close(&mut self) {
        self.state = SessionState::Closing;
        self.transport.shutdown().await;
        self.state = SessionState::Closed;
    }
}
