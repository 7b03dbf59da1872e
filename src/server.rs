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

//! Server supervisor: listener, connection pool, shutdown, health.
//!
//! The supervisor owns the listening socket and a weak view of every
//! session (a command channel and an activity timestamp). Sessions own
//! everything else themselves; the supervisor never touches their state.
//! INT/TERM/HUP trigger cooperative shutdown: the listener closes, every
//! session is signalled, and after a grace period the stragglers are
//! aborted.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::{Session, SessionCommand, SessionContext, SessionHandle};
use crate::config::ServerConfig;
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::protocol::PROTOCOL_VERSION;
use crate::source::{InputSink, ScreenSource};
use crate::transport::Transport;

/// How long sessions get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Health checker cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

struct PoolEntry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

struct Shared {
    config: Arc<ServerConfig>,
    screen: Arc<dyn ScreenSource>,
    input: Arc<dyn InputSink>,
    pool: Mutex<HashMap<usize, PoolEntry>>,
    next_id: AtomicUsize,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    shutdown_tx: watch::Sender<bool>,
    epoch: Instant,
}

/// The RFB server: accepts connections, spawns sessions, supervises
/// their lifecycle.
///
/// Cloning is cheap and every clone controls the same server.
#[derive(Clone)]
pub struct VncServer {
    shared: Arc<Shared>,
}

impl VncServer {
    /// Creates a server over a screen source and input sink.
    ///
    /// Returns the server and the event stream for lifecycle and input
    /// observation.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        screen: Arc<dyn ScreenSource>,
        input: Arc<dyn InputSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let server = Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                screen,
                input,
                pool: Mutex::new(HashMap::new()),
                next_id: AtomicUsize::new(1),
                events_tx,
                shutdown_tx,
                epoch: Instant::now(),
            }),
        };
        (server, events_rx)
    }

    /// Binds the configured address and serves until shutdown.
    ///
    /// Installs INT/TERM/HUP handlers that trigger the same cooperative
    /// shutdown as [`VncServer::shutdown`].
    pub async fn listen(&self) -> Result<()> {
        let addr = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("listening on {addr}");

        let signal_server = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            signal_server.shutdown();
        });

        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener until shutdown. Useful when
    /// the embedding application manages sockets (or tests bind port 0).
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let health = self.spawn_health_checker();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.handle_accept(stream, peer),
                        Err(e) => {
                            // Transient accept errors (EMFILE and kin)
                            // must not kill the listener.
                            warn!("accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        health.abort();
        self.drain_sessions().await;
        info!("server stopped");
        Ok(())
    }

    /// Triggers cooperative shutdown from any task.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }

    /// Rings the bell on every connected client.
    pub fn ring_bell(&self) {
        self.broadcast(|| SessionCommand::Bell);
    }

    /// Pushes clipboard text to every connected client.
    pub fn send_clipboard(&self, text: &[u8]) {
        let owned = text.to_vec();
        self.broadcast(move || SessionCommand::CutText(owned.clone()));
    }

    /// Number of live sessions.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.pool.lock().expect("pool lock").len()
    }

    fn broadcast(&self, make: impl Fn() -> SessionCommand) {
        let pool = self.shared.pool.lock().expect("pool lock");
        for entry in pool.values() {
            let _ = entry.handle.commands.send(make());
        }
    }

    /// Accepts one connection: reject on saturation, otherwise spawn the
    /// session task.
    fn handle_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = Arc::clone(&self.shared);
        let at_capacity = {
            let pool = shared.pool.lock().expect("pool lock");
            pool.len() >= shared.config.max_connections
        };
        if at_capacity {
            warn!("rejecting {peer}: connection pool full");
            tokio::spawn(reject_saturated(stream));
            return;
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(AtomicU64::new(
            u64::try_from(shared.epoch.elapsed().as_millis()).unwrap_or(0),
        ));
        let shutdown_rx = shared.shutdown_tx.subscribe();

        let ctx = SessionContext {
            id,
            peer,
            config: Arc::clone(&shared.config),
            screen: Arc::clone(&shared.screen),
            input: Arc::clone(&shared.input),
            events: shared.events_tx.clone(),
            last_activity: Arc::clone(&last_activity),
            epoch: shared.epoch,
        };

        let pool_shared = Arc::clone(&shared);
        // The entry is inserted while the lock is held across the spawn,
        // so the task's exit-time removal cannot run first and leak the
        // pool slot.
        let mut pool = shared.pool.lock().expect("pool lock");
        let task = tokio::spawn(async move {
            debug!("client {id} connected from {peer}");
            let transport = match Transport::detect(stream, &ctx.config).await {
                Ok(t) => t,
                Err(e) => {
                    info!("client {id}: transport detection failed: {e}");
                    pool_shared.pool.lock().expect("pool lock").remove(&id);
                    return;
                }
            };
            let session = Session::new(transport, &ctx);
            if let Err(e) = session.run(shutdown_rx, command_rx).await {
                match e {
                    VncError::AuthenticationFailed => {
                        warn!("client {id}: authentication failed")
                    }
                    VncError::Protocol(ref why) => warn!("client {id}: protocol error: {why}"),
                    other => error!("client {id}: session error: {other}"),
                }
            }
            pool_shared.pool.lock().expect("pool lock").remove(&id);
        });

        pool.insert(
            id,
            PoolEntry {
                handle: SessionHandle {
                    commands: command_tx,
                    last_activity,
                },
                task,
            },
        );
    }

    /// Periodically drops connections idle beyond the socket timeout.
    fn spawn_health_checker(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                interval.tick().await;
                let now_ms =
                    u64::try_from(shared.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
                let timeout_ms =
                    u64::try_from(shared.config.client_socket_timeout.as_millis())
                        .unwrap_or(u64::MAX);
                let pool = shared.pool.lock().expect("pool lock");
                for (id, entry) in pool.iter() {
                    let last = entry.handle.last_activity.load(Ordering::Relaxed);
                    if now_ms.saturating_sub(last) > timeout_ms {
                        info!("client {id}: idle beyond timeout, closing");
                        let _ = entry.handle.commands.send(SessionCommand::Close);
                    }
                }
            }
        })
    }

    /// Signals every session, waits out the grace period, force-closes
    /// what remains.
    async fn drain_sessions(&self) {
        {
            let pool = self.shared.pool.lock().expect("pool lock");
            for entry in pool.values() {
                let _ = entry.handle.commands.send(SessionCommand::Close);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            if self.connection_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut pool = self.shared.pool.lock().expect("pool lock");
        for (id, entry) in pool.drain() {
            warn!("client {id}: force-closing after grace period");
            entry.task.abort();
        }
    }
}

/// Tells a client the pool is full, in its own protocol version.
///
/// 3.7/3.8 clients get an empty security-type list followed by a reason
/// string; 3.3 and unknown speakers just get the socket closed.
async fn reject_saturated(mut stream: TcpStream) {
    use crate::protocol::ProtocolVersion;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let reject = async {
        stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;
        let mut version = [0u8; 12];
        stream.read_exact(&mut version).await?;
        if ProtocolVersion::from_client_bytes(&version) != ProtocolVersion::Rfb33 {
            let reason = b"Too many connections";
            let mut buf = Vec::with_capacity(5 + reason.len());
            buf.push(0); // zero security types
            buf.extend_from_slice(&u32::try_from(reason.len()).unwrap_or(0).to_be_bytes());
            buf.extend_from_slice(reason);
            stream.write_all(&buf).await?;
        }
        stream.shutdown().await
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), reject).await;
}

/// Completes when INT, TERM, or HUP arrives.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("SIGHUP handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

/// Completes when Ctrl-C arrives.
#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
