//! Heartbeats over UDP multicast.
//!
//! The transmitter broadcasts one message per period, fragmenting
//! anything larger than a datagram (see [`crate::fragment`]). The
//! receiver reassembles and hands complete messages to short-lived
//! workers for decrypt+apply; the worker pool is semaphore-gated so a
//! flood degrades to drops, never to unbounded queueing.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use pulsemesh_core::HeartbeatTiming;
use pulsemesh_proto::{Engine, Target};

use crate::error::TransportError;
use crate::fragment::{to_datagrams, Ingest, Reassembler};
use crate::stats::TransferStats;

/// Beat-board identifier of this transport.
pub const MCAST_ID: &str = "mcast";

/// Multicast transport configuration.
#[derive(Debug, Clone)]
pub struct McastConfig {
    /// Multicast group address.
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Interface address to join on; unspecified lets the kernel pick.
    pub intf: Ipv4Addr,
    pub timing: HeartbeatTiming,
    /// Datagram payload budget; larger messages fragment.
    pub chunk_size: usize,
    /// Reassembly bound: pending fragments per message id.
    pub max_fragments: usize,
    /// Reassembly bound: pending message ids per source address.
    pub max_messages: usize,
    /// Worker cap is this multiple of the configured peer count.
    pub worker_factor: usize,
    /// Receive timeout; an idle loop still re-evaluates liveness this
    /// often.
    pub recv_timeout: Duration,
}

impl Default for McastConfig {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::new(224, 3, 29, 71),
            port: 10000,
            intf: Ipv4Addr::UNSPECIFIED,
            timing: HeartbeatTiming::default(),
            chunk_size: 1200,
            max_fragments: 256,
            max_messages: 16,
            worker_factor: 2,
            recv_timeout: Duration::from_secs(1),
        }
    }
}

/// The UDP multicast transport.
pub struct McastTransport {
    engine: Arc<Engine>,
    config: McastConfig,
    socket: Arc<UdpSocket>,
    workers: Arc<Semaphore>,
    failing: Mutex<HashSet<SocketAddr>>,
    stats: Arc<TransferStats>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl McastTransport {
    /// Bind the socket and join the group. Fatal configuration errors
    /// surface here and abort this transport only.
    pub async fn open(
        engine: Arc<Engine>,
        config: McastConfig,
        stop: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|e| {
                error!(port = config.port, error = %e, "multicast bind failed");
                TransportError::Io(e)
            })?;
        socket.join_multicast_v4(config.addr, config.intf).map_err(|e| {
            error!(addr = %config.addr, error = %e, "multicast join failed");
            TransportError::Io(e)
        })?;

        let peer_count = engine.cluster().peers().count().max(1);
        let workers = Arc::new(Semaphore::new(config.worker_factor.max(1) * peer_count));
        info!(addr = %config.addr, port = config.port, "multicast heartbeat ready");

        Ok(Arc::new(Self {
            engine,
            config,
            socket: Arc::new(socket),
            workers,
            failing: Mutex::new(HashSet::new()),
            stats: Arc::new(TransferStats::new()),
            stop,
            wake,
        }))
    }

    /// Transfer counters for observability.
    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    // ─────────────────────────────────────────────────────────────────
    // Transmit
    // ─────────────────────────────────────────────────────────────────

    /// Periodic transmit loop; returns when stop is requested.
    pub async fn run_tx(self: Arc<Self>) {
        while !self.stop.load(Ordering::Relaxed) {
            self.tx_tick().await;
            self.engine
                .evaluate_beats(MCAST_ID, self.config.timing.timeout);
            let _ = tokio::time::timeout(self.config.timing.period, self.wake.notified()).await;
        }
        debug!("mcast tx loop stopped");
    }

    async fn tx_tick(&self) {
        let wire = match self.engine.build_outbound(Target::Broadcast) {
            Ok(Some(wire)) => wire,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not build heartbeat");
                TransferStats::bump(&self.stats.tx_errors);
                return;
            }
        };

        let group = (self.config.addr, self.config.port);
        let mut success = true;
        for datagram in to_datagrams(&wire, self.config.chunk_size) {
            // Fire and forget; a lost fragment costs one message, the
            // next period resends.
            if let Err(e) = self.socket.send_to(&datagram, group).await {
                debug!(error = %e, "datagram send failed");
                success = false;
            }
        }

        if success {
            TransferStats::bump(&self.stats.tx_msgs);
        } else {
            TransferStats::bump(&self.stats.tx_errors);
        }
        self.engine.note_beat_tx(MCAST_ID, success);
    }

    // ─────────────────────────────────────────────────────────────────
    // Receive
    // ─────────────────────────────────────────────────────────────────

    /// Receive loop; returns when stop is requested.
    pub async fn run_rx(self: Arc<Self>) {
        let mut reassembler =
            Reassembler::new(self.config.max_messages, self.config.max_fragments);
        let mut buf = vec![0u8; 65536];

        while !self.stop.load(Ordering::Relaxed) {
            match tokio::time::timeout(self.config.recv_timeout, self.socket.recv_from(&mut buf))
                .await
            {
                Err(_) => {
                    // Idle; liveness still needs its tick.
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "multicast receive failed");
                    TransferStats::bump(&self.stats.rx_errors);
                    tokio::time::sleep(self.config.recv_timeout).await;
                }
                Ok(Ok((len, src))) => match reassembler.ingest(src, &buf[..len]) {
                    Ingest::Pending => {}
                    Ingest::Dropped(reason) => {
                        debug!(%src, reason, "datagram dropped");
                        TransferStats::bump(&self.stats.rx_drops);
                    }
                    Ingest::Complete(sealed) => self.dispatch(src, sealed),
                },
            }
            self.engine
                .evaluate_beats(MCAST_ID, self.config.timing.timeout);
        }
        debug!("mcast rx loop stopped");
    }

    /// Hand one complete message to a worker, or drop at the cap.
    fn dispatch(self: &Arc<Self>, src: SocketAddr, sealed: Vec<u8>) {
        match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => {
                let transport = Arc::clone(self);
                tokio::spawn(async move {
                    let _permit = permit;
                    transport.process(src, &sealed);
                });
            }
            Err(_) => {
                warn!(%src, "worker pool full, dropping message");
                TransferStats::bump(&self.stats.worker_drops);
            }
        }
    }

    fn process(&self, src: SocketAddr, sealed: &[u8]) {
        let (sender, message) = match self.engine.open_wire(sealed) {
            Ok(opened) => opened,
            Err(e) => {
                TransferStats::bump(&self.stats.rx_drops);
                // Log the first failure per source; a chatty foreign
                // sender would flood otherwise.
                if self.failing.lock().unwrap().insert(src) {
                    debug!(%src, error = %e, "dropping undecryptable traffic");
                }
                return;
            }
        };
        self.failing.lock().unwrap().remove(&src);

        let configured = self.engine.cluster().nodes.contains(&sender);
        let seen = self.engine.shared().lock().gens.peer(&sender).is_some();
        if !configured && !seen {
            // It holds the cluster secret: that is membership.
            info!(%sender, %src, "discovered unconfigured peer");
        }

        self.engine.note_beat_rx(MCAST_ID, &sender);
        self.engine.apply(&sender, &message);
        TransferStats::bump(&self.stats.rx_msgs);
    }
}
