//! Heartbeats over a shared block or character device.
//!
//! Every node owns one fixed-size slot addressed through the meta
//! region (see [`crate::slots`]); the transmitter rewrites its own
//! slot each period and the receiver polls every claimed slot.
//!
//! Device opens request synchronous semantics (`O_SYNC`), plus
//! `O_DIRECT` on block devices so reads see what was last durably
//! written rather than a cached page. Buffers and offsets are
//! page-aligned throughout to satisfy direct I/O.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task;
use tracing::{debug, error, info, warn};

use pulsemesh_core::{HeartbeatTiming, NodeName};
use pulsemesh_proto::{Engine, Target};

use crate::error::TransportError;
use crate::slots::{unpad_candidates, SlotLayout};
use crate::stats::TransferStats;

/// Beat-board identifier of this transport.
pub const DISK_ID: &str = "disk";

/// Trailing zero bytes of ciphertext that NUL-stripping may have
/// eaten; each candidate length is retried against the envelope.
const UNPAD_RESTORE: usize = 2;

/// Bound on one blocking device operation. A stuck device loses its
/// tick, not the loop.
const IO_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Disk transport configuration.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Path of the shared device (or a regular file in tests).
    pub dev: PathBuf,
    pub timing: HeartbeatTiming,
    pub layout: SlotLayout,
}

impl DiskConfig {
    pub fn new(dev: impl Into<PathBuf>) -> Self {
        Self {
            dev: dev.into(),
            timing: HeartbeatTiming::default(),
            layout: SlotLayout::default(),
        }
    }
}

/// The shared-device transport.
///
/// Constructed once at startup; [`DiskTransport::open`] performs the
/// meta scan and slot claim synchronously and is the only place fatal
/// configuration errors surface. The loops never fail.
pub struct DiskTransport {
    engine: Arc<Engine>,
    config: DiskConfig,
    file: Arc<File>,
    my_slot: usize,
    slot_map: Mutex<HashMap<NodeName, usize>>,
    last_updated: Mutex<HashMap<NodeName, f64>>,
    stats: Arc<TransferStats>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl DiskTransport {
    /// Open the device, scan the meta region, and claim a slot.
    pub fn open(
        engine: Arc<Engine>,
        config: DiskConfig,
        stop: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Result<Arc<Self>, TransportError> {
        let layout = config.layout;
        if layout.page_size == 0
            || layout.meta_size % layout.page_size != 0
            || layout.slot_size % layout.page_size != 0
        {
            return Err(TransportError::Config(format!(
                "slot layout not page aligned: page={} meta={} slot={}",
                layout.page_size, layout.meta_size, layout.slot_size
            )));
        }

        let meta = std::fs::metadata(&config.dev).map_err(|e| {
            error!(dev = %config.dev.display(), error = %e, "heartbeat device unavailable");
            TransportError::Io(e)
        })?;
        let file_type = meta.file_type();
        if !file_type.is_block_device() && !file_type.is_char_device() && !file_type.is_file() {
            return Err(TransportError::Config(format!(
                "{} is not a block device, character device, or regular file",
                config.dev.display()
            )));
        }

        let file = open_device(&config.dev, file_type.is_block_device())?;

        let mut slots = load_peer_slots(&file, &layout)?;
        let me = engine.node_name().clone();
        let my_slot = allocate_slot(&file, &layout, &mut slots, &me)?;
        info!(dev = %config.dev.display(), slot = my_slot, "disk heartbeat ready");

        Ok(Arc::new(Self {
            engine,
            config,
            file: Arc::new(file),
            my_slot,
            slot_map: Mutex::new(slots),
            last_updated: Mutex::new(HashMap::new()),
            stats: Arc::new(TransferStats::new()),
            stop,
            wake,
        }))
    }

    /// Transfer counters for observability.
    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// The claimed slot index.
    pub fn slot(&self) -> usize {
        self.my_slot
    }

    // ─────────────────────────────────────────────────────────────────
    // Transmit
    // ─────────────────────────────────────────────────────────────────

    /// Periodic transmit loop; returns when stop is requested.
    pub async fn run_tx(self: Arc<Self>) {
        while !self.stop.load(Ordering::Relaxed) {
            self.tx_tick().await;
            self.engine.evaluate_beats(DISK_ID, self.config.timing.timeout);
            let _ = tokio::time::timeout(self.config.timing.period, self.wake.notified()).await;
        }
        debug!("disk tx loop stopped");
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

        let slot_bytes = match self.config.layout.pad_message(&wire) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "heartbeat does not fit slot");
                TransferStats::bump(&self.stats.tx_errors);
                self.engine.note_beat_tx(DISK_ID, false);
                return;
            }
        };

        let file = Arc::clone(&self.file);
        let offset = self.config.layout.slot_offset(self.my_slot);
        let align = self.config.layout.page_size;
        let written = tokio::time::timeout(
            IO_DEADLINE,
            task::spawn_blocking(move || write_aligned(&file, &slot_bytes, offset, align)),
        )
        .await;

        match written {
            Ok(Ok(Ok(()))) => {
                TransferStats::bump(&self.stats.tx_msgs);
                self.engine.note_beat_tx(DISK_ID, true);
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "slot write failed");
                TransferStats::bump(&self.stats.tx_errors);
                self.engine.note_beat_tx(DISK_ID, false);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "slot writer task failed");
                TransferStats::bump(&self.stats.tx_errors);
            }
            Err(_) => {
                warn!("slot write stalled past deadline");
                TransferStats::bump(&self.stats.tx_errors);
                self.engine.note_beat_tx(DISK_ID, false);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Receive
    // ─────────────────────────────────────────────────────────────────

    /// Periodic receive loop; returns when stop is requested.
    pub async fn run_rx(self: Arc<Self>) {
        while !self.stop.load(Ordering::Relaxed) {
            self.rx_tick().await;
            self.engine.evaluate_beats(DISK_ID, self.config.timing.timeout);
            let _ = tokio::time::timeout(self.config.timing.period, self.wake.notified()).await;
        }
        debug!("disk rx loop stopped");
    }

    async fn rx_tick(&self) {
        // Opportunistic rescan picks up slots claimed after startup.
        let file = Arc::clone(&self.file);
        let layout = self.config.layout;
        match tokio::time::timeout(
            IO_DEADLINE,
            task::spawn_blocking(move || load_peer_slots(&file, &layout)),
        )
        .await
        {
            Ok(Ok(Ok(fresh))) => *self.slot_map.lock().unwrap() = fresh,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "meta region scan failed");
                TransferStats::bump(&self.stats.rx_errors);
            }
            Ok(Err(e)) => warn!(error = %e, "meta scanner task failed"),
            Err(_) => warn!("meta region scan stalled past deadline"),
        }

        let me = self.engine.node_name().clone();
        let peers: Vec<(NodeName, usize)> = {
            let map = self.slot_map.lock().unwrap();
            map.iter()
                .filter(|(name, _)| **name != me)
                .map(|(name, index)| (name.clone(), *index))
                .collect()
        };

        for (owner, index) in peers {
            let file = Arc::clone(&self.file);
            let offset = self.config.layout.slot_offset(index);
            let len = self.config.layout.slot_size;
            let align = self.config.layout.page_size;
            let read = tokio::time::timeout(
                IO_DEADLINE,
                task::spawn_blocking(move || read_aligned(&file, len, offset, align)),
            )
            .await;

            match read {
                Ok(Ok(Ok(slot))) => self.handle_slot(&owner, &slot),
                Ok(Ok(Err(e))) => {
                    // One bad slot must not spoil the tick.
                    warn!(%owner, index, error = %e, "slot read failed");
                    TransferStats::bump(&self.stats.rx_errors);
                }
                Ok(Err(e)) => warn!(error = %e, "slot reader task failed"),
                Err(_) => {
                    warn!(%owner, index, "slot read stalled past deadline");
                    TransferStats::bump(&self.stats.rx_errors);
                }
            }
        }
    }

    fn handle_slot(&self, owner: &NodeName, slot: &[u8]) {
        let candidates = unpad_candidates(slot, UNPAD_RESTORE);
        if candidates.is_empty() {
            // Claimed but never written.
            return;
        }

        for candidate in candidates {
            let (sender, message) = match self.engine.open_wire(candidate) {
                Ok(opened) => opened,
                Err(_) => continue,
            };

            if sender != *owner {
                // Slot assignment is advisory; the payload identity
                // wins.
                debug!(%owner, %sender, "slot owner mismatch, trusting payload");
            }

            self.engine.note_beat_rx(DISK_ID, &sender);

            let unchanged = {
                let mut seen = self.last_updated.lock().unwrap();
                if seen.get(&sender) == Some(&message.updated()) {
                    true
                } else {
                    seen.insert(sender.clone(), message.updated());
                    false
                }
            };
            if !unchanged {
                self.engine.apply(&sender, &message);
                TransferStats::bump(&self.stats.rx_msgs);
            }
            return;
        }

        // Content present but nothing opened: foreign or torn slot.
        debug!(%owner, "undecryptable slot content");
        TransferStats::bump(&self.stats.rx_drops);
    }
}

fn open_device(path: &PathBuf, direct: bool) -> Result<File, TransportError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);

    if direct {
        match options
            .clone()
            .custom_flags(libc::O_SYNC | libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) => {
                warn!(dev = %path.display(), error = %e, "direct i/o refused, using O_SYNC only");
            }
        }
    }

    Ok(options.custom_flags(libc::O_SYNC).open(path)?)
}

/// Scan the meta region into nodename → slot index. Ascending scan,
/// first claim wins; a duplicate claim is logged and ignored.
fn load_peer_slots(
    file: &File,
    layout: &SlotLayout,
) -> Result<HashMap<NodeName, usize>, std::io::Error> {
    let meta = read_aligned(file, layout.meta_size, 0, layout.page_size)?;

    let mut slots = HashMap::new();
    for index in 0..layout.max_slots() {
        let page = &meta[index * layout.page_size..(index + 1) * layout.page_size];
        let Some(name) = SlotLayout::parse_name(page) else {
            continue;
        };
        let name = NodeName::new(name);
        if let Some(first) = slots.get(&name) {
            warn!(%name, first = *first, duplicate = index, "duplicate slot claim, keeping first");
            continue;
        }
        slots.insert(name, index);
    }
    Ok(slots)
}

/// Claim the first unclaimed slot for `me`, or reuse an existing one.
///
/// The claim is scan-then-write with no device-level lock: two nodes
/// first-booting against an empty device at the same instant can both
/// pick the same index. Best effort by design; a rescan flags the
/// collision.
fn allocate_slot(
    file: &File,
    layout: &SlotLayout,
    slots: &mut HashMap<NodeName, usize>,
    me: &NodeName,
) -> Result<usize, TransportError> {
    if let Some(&index) = slots.get(me) {
        return Ok(index);
    }

    let claimed: Vec<usize> = slots.values().copied().collect();
    let Some(free) = (0..layout.max_slots()).find(|i| !claimed.contains(i)) else {
        return Err(TransportError::NoFreeSlot(layout.max_slots()));
    };

    let page = layout.encode_name(me.as_str())?;
    write_aligned(file, &page, layout.meta_offset(free), layout.page_size)?;
    info!(%me, slot = free, "claimed heartbeat slot");

    let fresh = load_peer_slots(file, layout)?;
    if let Some(&settled) = fresh.get(me) {
        if settled != free {
            warn!(%me, wrote = free, settled, "concurrent slot claim, deferring to first");
        }
        *slots = fresh;
        return Ok(settled);
    }
    // Our write did not read back; something rewrote the page.
    *slots = fresh;
    Err(TransportError::Config(format!(
        "slot claim for {me} did not persist"
    )))
}

// ─────────────────────────────────────────────────────────────────────
// Aligned blocking I/O
// ─────────────────────────────────────────────────────────────────────

/// Page-aligned scratch buffer, as direct I/O requires.
struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize, align: usize) -> Self {
        let raw = vec![0u8; len + align];
        let offset = raw.as_ptr().align_offset(align);
        Self { raw, offset, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

fn read_aligned(
    file: &File,
    len: usize,
    offset: u64,
    align: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = AlignedBuf::zeroed(len, align);
    let mut read = 0;
    // Short reads past a regular file's end come back zero-filled.
    while read < len {
        match file.read_at(&mut buf.as_mut_slice()[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(buf.as_slice().to_vec())
}

fn write_aligned(
    file: &File,
    bytes: &[u8],
    offset: u64,
    align: usize,
) -> Result<(), std::io::Error> {
    let mut buf = AlignedBuf::zeroed(bytes.len(), align);
    buf.as_mut_slice().copy_from_slice(bytes);
    file.write_all_at(buf.as_slice(), offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> SlotLayout {
        SlotLayout {
            page_size: 512,
            meta_size: 512 * 8,
            slot_size: 4096,
        }
    }

    fn device(layout: &SlotLayout) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbdev");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(layout.required_size()).unwrap();
        (dir, file)
    }

    #[test]
    fn test_empty_device_has_no_claims() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);
        assert!(load_peer_slots(&file, &layout).unwrap().is_empty());
    }

    #[test]
    fn test_serialized_claims_never_collide() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);

        let mut indices = Vec::new();
        for name in ["n1", "n2", "n3", "n4"] {
            let mut slots = load_peer_slots(&file, &layout).unwrap();
            let index =
                allocate_slot(&file, &layout, &mut slots, &NodeName::new(name)).unwrap();
            indices.push(index);
        }

        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), indices.len());
    }

    #[test]
    fn test_reclaim_is_stable() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);
        let me = NodeName::new("n1");

        let mut slots = load_peer_slots(&file, &layout).unwrap();
        let first = allocate_slot(&file, &layout, &mut slots, &me).unwrap();

        // A restart scans the device and finds its old claim.
        let mut slots = load_peer_slots(&file, &layout).unwrap();
        let second = allocate_slot(&file, &layout, &mut slots, &me).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_full_meta_region_errors() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);

        for i in 0..layout.max_slots() {
            let mut slots = load_peer_slots(&file, &layout).unwrap();
            allocate_slot(&file, &layout, &mut slots, &NodeName::new(format!("n{i}"))).unwrap();
        }

        let mut slots = load_peer_slots(&file, &layout).unwrap();
        assert!(matches!(
            allocate_slot(&file, &layout, &mut slots, &NodeName::new("late")),
            Err(TransportError::NoFreeSlot(_))
        ));
    }

    #[test]
    fn test_duplicate_claim_keeps_first() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);

        // Simulate the first-boot race: the same name lands on two
        // meta pages.
        let page = layout.encode_name("twin").unwrap();
        write_aligned(&file, &page, layout.meta_offset(1), layout.page_size).unwrap();
        write_aligned(&file, &page, layout.meta_offset(3), layout.page_size).unwrap();

        let slots = load_peer_slots(&file, &layout).unwrap();
        assert_eq!(slots[&NodeName::new("twin")], 1);
    }

    #[test]
    fn test_slot_write_read_roundtrip() {
        let layout = small_layout();
        let (_dir, file) = device(&layout);

        let message = b"\x0bnot-a-real-envelope\x00\x01\x02";
        let padded = layout.pad_message(message).unwrap();
        write_aligned(&file, &padded, layout.slot_offset(2), layout.page_size).unwrap();

        let slot = read_aligned(&file, layout.slot_size, layout.slot_offset(2), layout.page_size)
            .unwrap();
        let candidates = unpad_candidates(&slot, UNPAD_RESTORE);
        assert_eq!(candidates[0], message.as_slice());
    }

    #[test]
    fn test_short_regular_file_reads_zero_filled() {
        let layout = small_layout();
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("hbdev"))
            .unwrap();
        // Empty file: the meta scan still sees a clean region.
        assert!(load_peer_slots(&file, &layout).unwrap().is_empty());
    }
}
