use std::collections::HashSet;

use aya::maps::{HashMap as TracedInodeMap, MapData, RingBuf};
use aya::programs::KProbe;
use aya::{Ebpf, Pod};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};

/* ============================= CONSTANTS ============================= */

/// Kernel symbol the probe attaches to.
pub const PROBE_SYMBOL: &str = "inode_permission";

/// Program name inside the probe object.
const PROBE_PROGRAM: &str = "kive_inode_permission";

/// Map names inside the probe object.
const TRACED_INODES_MAP: &str = "TRACED_INODES";
const EVENTS_MAP: &str = "EVENTS";

/// Capacity of the traced-inode set, fixed by the bytecode.
pub const MAP_MAX_ENTRIES: usize = 1024;

/// Default location of the compiled probe object.
pub const DEFAULT_PROBE_OBJECT: &str = "/opt/kive/kive-probe.bpf.o";

/// Environment override for the probe object path.
pub const PROBE_OBJECT_ENV: &str = "KIVE_PROBE_OBJECT";

/* ============================= MAP KEY ============================= */

/// Key layout of the traced-inode set. Must match the bytecode: the device
/// is in the kernel layout, the trailing pad keeps the struct free of
/// implicit padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct TracedKey {
    pub inode: u64,
    pub dev: u32,
    _pad: u32,
}

unsafe impl Pod for TracedKey {}

impl TracedKey {
    pub fn new(inode: u64, dev: u32) -> Self {
        Self {
            inode,
            dev,
            _pad: 0,
        }
    }
}

/// Convert a user-space packed `st_dev` into the kernel map-key layout.
pub fn user_dev_to_kernel_dev(x: u64) -> u32 {
    let major = ((x & 0x0000_0000_000f_ff00) >> 8) | ((x & 0xffff_f000_0000_0000) >> 32);
    let minor = (x & 0xff) | ((x & 0x0000_0fff_fff0_0000) >> 12);
    ((major << 20) | minor) as u32
}

/* ============================= EVENT ============================= */

/// One fixed-layout little-endian record from the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeEvent {
    pub pid: i32,
    pub tgid: u32,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub mask: i32,
    pub comm: [u8; 16],
}

/// Wire size of a record; the kernel may pad the tail.
pub const EVENT_SIZE: usize = 44;

impl ProbeEvent {
    /// The `comm[]` field as a string, truncated at the first NUL.
    pub fn comm_str(&self) -> String {
        let end = self.comm.iter().position(|b| *b == 0).unwrap_or(self.comm.len());
        String::from_utf8_lossy(&self.comm[..end]).into_owned()
    }
}

/// Decode a raw ring-buffer record.
pub fn decode_event(raw: &[u8]) -> Result<ProbeEvent> {
    if raw.len() < EVENT_SIZE {
        return Err(Error::Decode(raw.len()));
    }

    let u32_at = |off: usize| {
        u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
    };

    let mut comm = [0u8; 16];
    comm.copy_from_slice(&raw[28..44]);

    Ok(ProbeEvent {
        pid: u32_at(0) as i32,
        tgid: u32_at(4),
        uid: u32_at(8),
        gid: u32_at(12),
        ino: u64::from_le_bytes([
            raw[16], raw[17], raw[18], raw[19], raw[20], raw[21], raw[22], raw[23],
        ]),
        mask: u32_at(24) as i32,
        comm,
    })
}

/* ============================= EVENT READER ============================= */

/// Blocking side of the ring buffer, handed to the alert emitter.
///
/// Reads resolve when the kernel publishes a record; closing the probe
/// surfaces as `Error::BufferClosed` and is terminal.
pub struct EventReader {
    ring: AsyncFd<RingBuf<MapData>>,
    closed: watch::Receiver<bool>,
}

impl EventReader {
    /// Wait for the next record and decode it. Malformed records are
    /// `Error::Decode` and may simply be read past.
    pub async fn read_event(&mut self) -> Result<ProbeEvent> {
        loop {
            if *self.closed.borrow() {
                return Err(Error::BufferClosed);
            }

            if let Some(item) = self.ring.get_mut().next() {
                return decode_event(&item);
            }

            let mut closed = self.closed.clone();
            tokio::select! {
                guard = self.ring.readable_mut() => {
                    let mut guard = guard.map_err(|_| Error::BufferClosed)?;
                    guard.clear_ready();
                }
                _ = closed.changed() => return Err(Error::BufferClosed),
            }
        }
    }
}

/* ============================= PROBE HANDLE ============================= */

/// Owner of the loaded probe: program, traced-inode set and ring buffer.
///
/// Constructed once in `main`, shared with the entry reconciler for key
/// programming; the reader is taken exactly once by the alert emitter.
pub struct ProbeHandle {
    object_path: String,
    ebpf: Option<Ebpf>,
    traced: Option<TracedInodeMap<MapData, TracedKey, u8>>,
    reader: Option<EventReader>,
    tracked: HashSet<TracedKey>,
    close_tx: Option<watch::Sender<bool>>,
    loaded: bool,
}

impl ProbeHandle {
    pub fn new() -> Self {
        let object_path = std::env::var(PROBE_OBJECT_ENV)
            .unwrap_or_else(|_| DEFAULT_PROBE_OBJECT.to_string());
        Self::with_object(object_path)
    }

    pub fn with_object(object_path: impl Into<String>) -> Self {
        Self {
            object_path: object_path.into(),
            ebpf: None,
            traced: None,
            reader: None,
            tracked: HashSet::new(),
            close_tx: None,
            loaded: false,
        }
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    /// Load the bytecode, attach the kprobe and open the ring buffer.
    /// A second call on a loaded handle is a no-op.
    pub fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }

        // Kernels before 5.11 account probe memory against RLIMIT_MEMLOCK.
        setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
            .map_err(|e| Error::Runtime(format!("raise memlock rlimit: {e}")))?;

        let mut ebpf = Ebpf::load_file(&self.object_path)?;

        let program: &mut KProbe = ebpf
            .program_mut(PROBE_PROGRAM)
            .ok_or_else(|| Error::Runtime(format!("program {PROBE_PROGRAM} missing from object")))?
            .try_into()?;
        program.load()?;
        program.attach(PROBE_SYMBOL, 0)?;

        let traced = TracedInodeMap::try_from(
            ebpf.take_map(TRACED_INODES_MAP)
                .ok_or_else(|| Error::Runtime(format!("map {TRACED_INODES_MAP} missing from object")))?,
        )?;
        let ring = RingBuf::try_from(
            ebpf.take_map(EVENTS_MAP)
                .ok_or_else(|| Error::Runtime(format!("map {EVENTS_MAP} missing from object")))?,
        )?;
        let ring = AsyncFd::new(ring).map_err(Error::Io)?;

        let (close_tx, close_rx) = watch::channel(false);

        self.reader = Some(EventReader {
            ring,
            closed: close_rx,
        });
        self.close_tx = Some(close_tx);
        self.traced = Some(traced);
        self.ebpf = Some(ebpf);
        self.loaded = true;

        info!(object = %self.object_path, symbol = PROBE_SYMBOL, "probe_loaded");
        Ok(())
    }

    /// Hand the ring buffer to the emitter. Yields once per load.
    pub fn take_reader(&mut self) -> Option<EventReader> {
        self.reader.take()
    }

    /// Install a key in the traced set. Re-inserting a present key is fine;
    /// a full set is reported as `Error::MapFull` without crashing.
    pub fn insert_key(&mut self, key: TracedKey) -> Result<()> {
        let traced = self.traced.as_mut().ok_or(Error::ProbeNotLoaded)?;

        if !self.tracked.contains(&key) && self.tracked.len() >= MAP_MAX_ENTRIES {
            return Err(Error::MapFull);
        }

        traced.insert(key, 0u8, 0)?;
        if self.tracked.insert(key) {
            debug!(inode = key.inode, dev = key.dev, "traced_inode_installed");
        }
        Ok(())
    }

    /// Remove a key from the traced set. Removing an absent key is a no-op.
    pub fn delete_key(&mut self, key: TracedKey) -> Result<()> {
        let traced = self.traced.as_mut().ok_or(Error::ProbeNotLoaded)?;

        if let Err(e) = traced.remove(&key) {
            if self.tracked.contains(&key) {
                return Err(e.into());
            }
        }
        self.tracked.remove(&key);
        debug!(inode = key.inode, dev = key.dev, "traced_inode_removed");
        Ok(())
    }

    /// Number of keys currently programmed.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Detach and release everything: probe and program objects first, then
    /// the map, then the reader (signalled; the emitter drops it).
    pub fn unload(&mut self) {
        if !self.loaded {
            return;
        }

        self.ebpf = None;
        self.traced = None;
        self.reader = None;
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(true);
        }
        self.tracked.clear();
        self.loaded = false;

        info!("probe_unloaded");
    }

}

impl Default for ProbeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_event(
        pid: i32,
        tgid: u32,
        uid: u32,
        gid: u32,
        ino: u64,
        mask: i32,
        comm: &str,
    ) -> Vec<u8> {
        let mut raw = Vec::with_capacity(EVENT_SIZE);
        raw.extend_from_slice(&pid.to_le_bytes());
        raw.extend_from_slice(&tgid.to_le_bytes());
        raw.extend_from_slice(&uid.to_le_bytes());
        raw.extend_from_slice(&gid.to_le_bytes());
        raw.extend_from_slice(&ino.to_le_bytes());
        raw.extend_from_slice(&mask.to_le_bytes());
        let mut comm_bytes = [0u8; 16];
        comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
        raw.extend_from_slice(&comm_bytes);
        raw
    }

    // ── Event decoding ──

    #[test]
    fn test_decode_event_fields() {
        let raw = encode_event(1234, 1234, 0, 0, 8675309, 4, "cat");
        let event = decode_event(&raw).expect("should decode");

        assert_eq!(event.pid, 1234);
        assert_eq!(event.tgid, 1234);
        assert_eq!(event.uid, 0);
        assert_eq!(event.gid, 0);
        assert_eq!(event.ino, 8675309);
        assert_eq!(event.mask, 4);
        assert_eq!(event.comm_str(), "cat");
    }

    #[test]
    fn test_decode_event_negative_pid() {
        let raw = encode_event(-1, 7, 1000, 1000, 1, -2, "x");
        let event = decode_event(&raw).expect("should decode");
        assert_eq!(event.pid, -1);
        assert_eq!(event.mask, -2);
    }

    #[test]
    fn test_decode_event_tolerates_trailing_padding() {
        let mut raw = encode_event(1, 1, 0, 0, 42, 2, "sh");
        raw.extend_from_slice(&[0u8; 4]);
        let event = decode_event(&raw).expect("should decode");
        assert_eq!(event.ino, 42);
    }

    #[test]
    fn test_decode_event_short_record_is_error() {
        let raw = vec![0u8; EVENT_SIZE - 1];
        match decode_event(&raw) {
            Err(Error::Decode(len)) => assert_eq!(len, EVENT_SIZE - 1),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_comm_str_full_width() {
        let raw = encode_event(1, 1, 0, 0, 1, 0, "sixteen-chars-xy");
        let event = decode_event(&raw).expect("should decode");
        assert_eq!(event.comm_str(), "sixteen-chars-xy");
    }

    // ── Device conversion ──

    #[test]
    fn test_dev_conversion_small_numbers() {
        // major 8, minor 1 → user 0x801, kernel (8 << 20) | 1
        assert_eq!(user_dev_to_kernel_dev(0x801), (8 << 20) | 1);
    }

    #[test]
    fn test_dev_conversion_zero() {
        assert_eq!(user_dev_to_kernel_dev(0), 0);
    }

    #[test]
    fn test_dev_conversion_large_minor() {
        // minor 0x12345 spills past the low byte: user layout packs the
        // upper minor bits at bit 20.
        let user = 0x45u64 | (0x123u64 << 20) | (7u64 << 8);
        let kernel = user_dev_to_kernel_dev(user);
        assert_eq!(kernel, (7 << 20) | 0x12345);
    }

    // ── Key layout ──

    #[test]
    fn test_traced_key_size_and_zero_pad() {
        assert_eq!(std::mem::size_of::<TracedKey>(), 16);
        let key = TracedKey::new(1, 2);
        assert_eq!(key.inode, 1);
        assert_eq!(key.dev, 2);
    }

    #[test]
    fn test_traced_key_equality_ignores_nothing() {
        assert_eq!(TracedKey::new(1, 2), TracedKey::new(1, 2));
        assert_ne!(TracedKey::new(1, 2), TracedKey::new(1, 3));
    }

    // ── Handle state machine (no kernel needed) ──

    #[test]
    fn test_unloaded_handle_rejects_key_ops() {
        let mut handle = ProbeHandle::with_object("/nonexistent.o");
        assert!(!handle.loaded());
        assert!(matches!(
            handle.insert_key(TracedKey::new(1, 0)),
            Err(Error::ProbeNotLoaded)
        ));
        assert!(matches!(
            handle.delete_key(TracedKey::new(1, 0)),
            Err(Error::ProbeNotLoaded)
        ));
    }

    #[test]
    fn test_unload_before_load_is_noop() {
        let mut handle = ProbeHandle::with_object("/nonexistent.o");
        handle.unload();
        assert!(!handle.loaded());
        assert_eq!(handle.tracked_len(), 0);
    }
}
