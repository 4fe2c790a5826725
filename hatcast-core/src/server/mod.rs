//! server — capture → process → encode → fan out, plus the control listener
//!
//! Two threads share the [`SessionRegistry`] and the [`HatCatalog`]
//! selection:
//!
//! - the **stream loop** (the caller's thread) reads frames, runs the
//!   [`FrameProcessor`], JPEG-encodes the result and sends the fragments to a
//!   snapshot of the registered clients;
//! - the **listener** blocks on `recv_from` with a bounded timeout and applies
//!   control commands.
//!
//! Both observe the same [`RunFlag`] and exit within one timeout of it being
//! cleared.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::catalog::HatCatalog;
use crate::pipeline::FrameProcessor;
use crate::protocol::{
    ControlCommand, DEFAULT_MAX_PACKET_SIZE, REGISTERED_ACK, SequenceCounter, fragment,
    fragment_capacity,
};
use crate::video::{FrameSource, encode_jpeg, mirror_horizontal};

/// Control datagrams are short ASCII strings.
const COMMAND_BUFFER: usize = 1024;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address for both control datagrams and outbound fragments.
    pub bind: SocketAddr,
    /// Largest datagram sent, header included.
    pub max_packet_size: usize,
    /// JPEG quality, 1–100.
    pub jpeg_quality: u8,
    /// Flip frames horizontally before processing.
    pub mirror: bool,
    /// Outline verified faces.
    pub show_boxes: bool,
    /// Listener receive timeout.
    pub listen_timeout_ms: u64,
    /// Sleep between polls while no client is registered.
    pub idle_backoff_ms: u64,
    /// Consecutive unreadable frames tolerated before the stream gives up.
    pub max_read_failures: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8888)),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            jpeg_quality: 50,
            mirror: true,
            show_boxes: true,
            listen_timeout_ms: 1_000,
            idle_backoff_ms: 100,
            max_read_failures: 30,
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file; absent keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read server config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed server config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fragment_capacity(self.max_packet_size)?;
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100, got {}", self.jpeg_quality);
        }
        if self.listen_timeout_ms == 0 {
            bail!("listen_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

/// Global "keep going" flag shared by the stream loop and the listener.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses that receive every produced frame.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    clients: Mutex<HashSet<SocketAddr>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SocketAddr>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` when `addr` was not registered before.
    pub fn register(&self, addr: SocketAddr) -> bool {
        self.lock().insert(addr)
    }

    /// `true` when `addr` was registered.
    pub fn unregister(&self, addr: &SocketAddr) -> bool {
        self.lock().remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.lock().contains(addr)
    }

    /// Copy of the current set; iterate this, never the live set.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ── Control listener ─────────────────────────────────────────────────────────

/// Applies inbound control commands to the shared state.
#[derive(Clone)]
pub struct ControlHandler {
    sessions: Arc<SessionRegistry>,
    catalog: Arc<HatCatalog>,
}

impl ControlHandler {
    pub fn new(sessions: Arc<SessionRegistry>, catalog: Arc<HatCatalog>) -> Self {
        Self { sessions, catalog }
    }

    /// Handle one datagram from `from`. Never fails: bad input is logged and
    /// the state is left alone.
    pub fn handle(&self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
        let command = match ControlCommand::parse(datagram) {
            Ok(command) => command,
            Err(e) => {
                warn!(client = %from, "ignoring datagram: {e}");
                return;
            }
        };

        match command {
            ControlCommand::Register => {
                if self.sessions.register(from) {
                    info!(client = %from, clients = self.sessions.len(), "client registered");
                } else {
                    debug!(client = %from, "client re-registered");
                }
                if let Err(e) = socket.send_to(REGISTERED_ACK, from) {
                    warn!(client = %from, "failed to acknowledge registration: {e}");
                }
            }
            ControlCommand::Unregister => {
                if self.sessions.unregister(&from) {
                    info!(client = %from, clients = self.sessions.len(), "client unregistered");
                }
            }
            ControlCommand::HatOff => {
                self.catalog.disable();
                info!(client = %from, "accessory overlay disabled");
            }
            ControlCommand::HatCategory(name) => {
                if self.catalog.select_by_name(&name) {
                    info!(client = %from, name = %name, "accessory selected");
                } else {
                    warn!(client = %from, name = %name, "unknown accessory requested");
                }
            }
        }
    }
}

fn listen(socket: UdpSocket, handler: ControlHandler, running: RunFlag, backoff: Duration) {
    let mut buf = [0u8; COMMAND_BUFFER];
    info!("control listener started");
    while running.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => handler.handle(&socket, &buf[..len], from),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            // ICMP unreachable from an earlier send surfaces here on some platforms
            Err(e) if is_peer_gone(&e) => debug!("listener: {e}"),
            Err(e) => {
                warn!("listener receive error: {e}");
                thread::sleep(backoff);
            }
        }
    }
    info!("control listener stopped");
}

/// Errors reported for a client that is no longer there.
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Send errors worth retrying on the next frame; every other one evicts.
fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

// ── Streaming server ─────────────────────────────────────────────────────────

/// Counters returned when [`StreamingServer::run`] ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub packets_sent: u64,
    pub idle_polls: u64,
    pub read_failures: u64,
    pub evicted: u64,
}

pub struct StreamingServer {
    config: ServerConfig,
    socket: UdpSocket,
    catalog: Arc<HatCatalog>,
    sessions: Arc<SessionRegistry>,
    running: RunFlag,
    sequence: SequenceCounter,
}

impl StreamingServer {
    /// Bind the UDP socket. Fails on an invalid config or an unavailable
    /// address.
    pub fn bind(config: ServerConfig, catalog: Arc<HatCatalog>) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind)
            .with_context(|| format!("failed to bind UDP socket on {}", config.bind))?;
        info!(addr = %socket.local_addr()?, "streaming server bound");
        Ok(Self {
            config,
            socket,
            catalog,
            sessions: Arc::new(SessionRegistry::new()),
            running: RunFlag::new(),
            sequence: SequenceCounter::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("socket has no local address")
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Clear this flag to stop [`run`](Self::run) from another thread.
    pub fn run_flag(&self) -> RunFlag {
        self.running.clone()
    }

    /// Stream until the run flag is cleared, the source ends or the source
    /// keeps failing. The listener is started here and joined before
    /// returning.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        processor: &mut FrameProcessor,
    ) -> Result<StreamStats> {
        let listener_socket = self
            .socket
            .try_clone()
            .context("failed to clone UDP socket for the listener")?;
        listener_socket
            .set_read_timeout(Some(self.config.listen_timeout()))
            .context("failed to set listener timeout")?;

        let handler = ControlHandler::new(Arc::clone(&self.sessions), Arc::clone(&self.catalog));
        let running = self.running.clone();
        let backoff = self.config.idle_backoff();
        let listener = thread::Builder::new()
            .name("hatcast-listener".into())
            .spawn(move || listen(listener_socket, handler, running, backoff))
            .context("failed to spawn listener thread")?;

        processor.set_show_boxes(self.config.show_boxes);
        let mut stats = StreamStats::default();
        let outcome = self.stream(source, processor, &mut stats);

        self.running.stop();
        listener
            .join()
            .map_err(|_| anyhow!("control listener panicked"))?;
        info!(
            frames = stats.frames_sent,
            packets = stats.packets_sent,
            evicted = stats.evicted,
            "streaming stopped"
        );
        outcome.map(|()| stats)
    }

    fn stream(
        &mut self,
        source: &mut dyn FrameSource,
        processor: &mut FrameProcessor,
        stats: &mut StreamStats,
    ) -> Result<()> {
        let mut consecutive_failures = 0u32;

        while self.running.is_running() {
            if self.sessions.is_empty() {
                stats.idle_polls += 1;
                thread::sleep(self.config.idle_backoff());
                continue;
            }

            let mut frame = match source.read_frame() {
                Ok(Some(frame)) => {
                    consecutive_failures = 0;
                    frame
                }
                Ok(None) => {
                    info!("capture source ended");
                    return Ok(());
                }
                Err(e) => {
                    stats.read_failures += 1;
                    consecutive_failures += 1;
                    warn!(consecutive = consecutive_failures, "unreadable frame: {e:#}");
                    if consecutive_failures >= self.config.max_read_failures {
                        error!("capture source keeps failing, stopping");
                        return Err(e.context(format!(
                            "{consecutive_failures} consecutive capture failures"
                        )));
                    }
                    continue;
                }
            };

            if self.config.mirror {
                mirror_horizontal(&mut frame);
            }

            let accessory = self.catalog.active();
            processor.process(&mut frame, accessory.as_deref());

            let jpeg = match encode_jpeg(&frame, self.config.jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!("skipping frame: {e:#}");
                    continue;
                }
            };
            self.send_frame(&jpeg, stats)?;
        }
        Ok(())
    }

    /// Fragment one encoded frame and send it to every registered client.
    /// A failed send evicts that client, unless the error is transient, in
    /// which case only the rest of this frame is skipped for it. Other
    /// clients are unaffected either way.
    pub fn send_frame(&mut self, payload: &[u8], stats: &mut StreamStats) -> Result<()> {
        let sequence = self.sequence.next();
        let packets: Vec<Vec<u8>> = fragment(payload, sequence, self.config.max_packet_size)?.collect();

        for client in self.sessions.snapshot() {
            for packet in &packets {
                match self.socket.send_to(packet, client) {
                    Ok(_) => stats.packets_sent += 1,
                    Err(e) if is_transient(&e) => {
                        debug!(client = %client, sequence, "send interrupted: {e}");
                        break;
                    }
                    Err(e) => {
                        if self.sessions.unregister(&client) {
                            stats.evicted += 1;
                            warn!(client = %client, "send failed, client evicted: {e}");
                        }
                        break;
                    }
                }
            }
        }

        stats.frames_sent += 1;
        debug!(sequence, fragments = packets.len(), bytes = payload.len(), "frame sent");
        Ok(())
    }
}
