//! Process-wide counters for the bus path, the store and device polling.
//! Logged by the status task; `snapshot()` is also what `smoketest` prints.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static FRAMES_PLAINTEXT: AtomicU64 = AtomicU64::new(0);
static FRAMES_DECRYPTED: AtomicU64 = AtomicU64::new(0);
static FRAMES_DISCARDED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_STORED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DUPLICATE: AtomicU64 = AtomicU64::new(0);
static NODE_UPDATES: AtomicU64 = AtomicU64::new(0);
static NODES_CREATED: AtomicU64 = AtomicU64::new(0);
static POSITIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static POSITIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
static TELEMETRY_ROWS: AtomicU64 = AtomicU64::new(0);
static STORE_FAILURES: AtomicU64 = AtomicU64::new(0);
static POLLS_OK: AtomicU64 = AtomicU64::new(0);
static POLLS_FAILED: AtomicU64 = AtomicU64::new(0);
static DEVICES_DISCOVERED: AtomicU64 = AtomicU64::new(0);
static DEVICES_REMOVED: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
/// Frame decoded; `encrypted` tells whether a channel key was needed.
pub fn inc_frames_decoded(encrypted: bool) {
    if encrypted {
        FRAMES_DECRYPTED.fetch_add(1, Ordering::Relaxed);
    } else {
        FRAMES_PLAINTEXT.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn inc_frames_discarded() {
    FRAMES_DISCARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_message_stored(inserted: bool) {
    if inserted {
        MESSAGES_STORED.fetch_add(1, Ordering::Relaxed);
    } else {
        MESSAGES_DUPLICATE.fetch_add(1, Ordering::Relaxed);
    }
}
/// Account one applied node update.
pub fn record_update(created: bool, position_accepted: Option<bool>, telemetry_row: bool) {
    NODE_UPDATES.fetch_add(1, Ordering::Relaxed);
    if created {
        NODES_CREATED.fetch_add(1, Ordering::Relaxed);
    }
    match position_accepted {
        Some(true) => {
            POSITIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
        }
        Some(false) => {
            POSITIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
        }
        None => {}
    }
    if telemetry_row {
        TELEMETRY_ROWS.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn inc_store_failures() {
    STORE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_poll(ok: bool) {
    if ok {
        POLLS_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        POLLS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}
pub fn inc_devices_discovered() {
    DEVICES_DISCOVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_devices_removed() {
    DEVICES_REMOVED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_received: u64,
    pub frames_plaintext: u64,
    pub frames_decrypted: u64,
    pub frames_discarded: u64,
    pub messages_stored: u64,
    pub messages_duplicate: u64,
    pub node_updates: u64,
    pub nodes_created: u64,
    pub positions_accepted: u64,
    pub positions_rejected: u64,
    pub telemetry_rows: u64,
    pub store_failures: u64,
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub devices_discovered: u64,
    pub devices_removed: u64,
}

impl Snapshot {
    /// Share of received frames that decoded, if any arrived.
    pub fn decode_rate(&self) -> Option<f64> {
        (self.frames_received > 0).then(|| {
            (self.frames_plaintext + self.frames_decrypted) as f64 / self.frames_received as f64
        })
    }
}

pub fn snapshot() -> Snapshot {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    Snapshot {
        frames_received: load(&FRAMES_RECEIVED),
        frames_plaintext: load(&FRAMES_PLAINTEXT),
        frames_decrypted: load(&FRAMES_DECRYPTED),
        frames_discarded: load(&FRAMES_DISCARDED),
        messages_stored: load(&MESSAGES_STORED),
        messages_duplicate: load(&MESSAGES_DUPLICATE),
        node_updates: load(&NODE_UPDATES),
        nodes_created: load(&NODES_CREATED),
        positions_accepted: load(&POSITIONS_ACCEPTED),
        positions_rejected: load(&POSITIONS_REJECTED),
        telemetry_rows: load(&TELEMETRY_ROWS),
        store_failures: load(&STORE_FAILURES),
        polls_ok: load(&POLLS_OK),
        polls_failed: load(&POLLS_FAILED),
        devices_discovered: load(&DEVICES_DISCOVERED),
        devices_removed: load(&DEVICES_REMOVED),
    }
}
