//! Per-session fan-out of PTY output: a ring buffer of recent frames for
//! catch-up, a copy-on-write spectator registry for lock-free reads and a
//! bounded channel into a dispatcher task for live delivery.
//!
//! The publish path never blocks on a spectator. The bounded frame channel is
//! the only intentional point of loss: when it is full the frame is dropped
//! for live distribution but stays in the ring, so a newly joining spectator
//! still catches up. The player's throughput is bounded only by the PTY
//! reader.

use crate::model::{Frame, SpectatorInfo};
use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Full terminal reset, sent to a spectator before the catch-up frames.
const RESET_HINT: &[u8] = b"\x1bc";
/// A frame containing this sequence resets the screen model: history before a
/// full clear is useless for catch-up. Cursor-home and other partial updates
/// must not discard history.
const CLEAR_SCREEN: &[u8] = b"\x1b[2J";
/// Floor for the per-spectator delivery channel.
const SPECTATOR_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fixed-capacity ring of the most recent frames.
struct FrameRing {
    frames: std::collections::VecDeque<Frame>,
    capacity: usize,
}

impl FrameRing {
    fn new(capacity: usize) -> Self {
        FrameRing {
            frames: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, frame: Frame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }
}

/// One connected observer. Shared between the registry, the dispatcher and
/// the owning connection task.
pub struct SpectatorHandle {
    pub user_id: u64,
    pub username: String,
    pub joined_at: chrono::DateTime<Utc>,
    /// The owning player's own stream attachment, not a spectator.
    pub player: bool,
    active: AtomicBool,
    bytes_sent: AtomicU64,
    /// Highest frame id covered by the catch-up sequence; the dispatcher
    /// skips anything at or below it to avoid duplicates.
    last_seen: AtomicU64,
}

impl SpectatorHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> SpectatorInfo {
        SpectatorInfo {
            user_id: self.user_id,
            username: self.username.clone(),
            joined_at: self.joined_at,
            active: self.is_active(),
            bytes_sent: self.bytes_sent(),
        }
    }
}

#[derive(Clone)]
struct SpectatorEntry {
    handle: Arc<SpectatorHandle>,
    tx: mpsc::Sender<Frame>,
}

/// Immutable registry snapshot. Mutation is by copy and a single atomic
/// pointer swap; readers iterate without locks and never observe a torn set.
#[derive(Default)]
pub struct SpectatorSet {
    entries: Vec<SpectatorEntry>,
}

impl SpectatorSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user_id: u64) -> bool {
        self.entries
            .iter()
            .any(|e| !e.handle.player && e.handle.user_id == user_id)
    }
}

/// Owns the fan-out state of one session.
pub struct StreamManager {
    session_id: String,
    ring: Mutex<FrameRing>,
    spectators: ArcSwap<SpectatorSet>,
    /// Publisher side of the frame channel. Taken on shutdown so the
    /// dispatcher drains and exits.
    frame_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_frame_id: AtomicU64,
    last_timestamp_ns: AtomicI64,
    frames_published: AtomicU64,
    live_drops: AtomicU64,
}

impl StreamManager {
    pub fn new(session_id: &str, ring_capacity: usize, channel_capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Frame>(channel_capacity);
        let manager = Arc::new(StreamManager {
            session_id: session_id.to_owned(),
            ring: Mutex::new(FrameRing::new(ring_capacity)),
            spectators: ArcSwap::from_pointee(SpectatorSet::default()),
            frame_tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(None),
            next_frame_id: AtomicU64::new(1),
            last_timestamp_ns: AtomicI64::new(0),
            frames_published: AtomicU64::new(0),
            live_drops: AtomicU64::new(0),
        });

        let dispatch = manager.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                dispatch.deliver(frame);
            }
        });
        *lock(&manager.dispatcher) = Some(handle);
        manager
    }

    /// Stamps one chunk of PTY output with the next frame id and a
    /// non-regressing timestamp. The bytes were already copied out of the
    /// read buffer; the frame is immutable from here on.
    pub fn next_frame(&self, data: Bytes) -> Frame {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        // Clamp to the last published timestamp so frame times never run backwards.
        let prior = self.last_timestamp_ns.fetch_max(now, Ordering::Relaxed);
        Frame {
            id,
            timestamp_ns: prior.max(now),
            data,
        }
    }

    /// Convenience for callers without a recording pipeline.
    pub fn publish(&self, data: Bytes) -> u64 {
        let frame = self.next_frame(data);
        let id = frame.id;
        self.publish_frame(frame);
        id
    }

    /// Stores the frame in the ring and offers it for live distribution.
    /// Never blocks.
    pub fn publish_frame(&self, frame: Frame) {
        {
            let mut ring = lock(&self.ring);
            if contains_bytes(&frame.data, CLEAR_SCREEN) {
                ring.frames.clear();
            }
            ring.push(frame.clone());
        }

        if let Some(tx) = lock(&self.frame_tx).as_ref() {
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The player must never block on spectator congestion;
                    // the ring still holds the frame for catch-up.
                    self.live_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Hands one live frame to every active spectator. Runs on the dispatcher
    /// task; failures affect only the one spectator.
    fn deliver(&self, frame: Frame) {
        let snapshot = self.spectators.load();
        for entry in &snapshot.entries {
            if !entry.handle.is_active() {
                continue;
            }
            if frame.id <= entry.handle.last_seen.load(Ordering::Acquire) {
                // Already covered by this spectator's catch-up sequence.
                continue;
            }
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => {
                    entry
                        .handle
                        .bytes_sent
                        .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    // Slow link; this spectator observes a gap.
                }
                Err(TrySendError::Closed(_)) => {
                    entry.handle.active.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    /// Registers a spectator and returns its handle plus the frame stream.
    /// The catch-up sequence (reset hint, then the ring contents in order) is
    /// placed on the stream atomically before any live frame.
    pub fn subscribe(
        &self,
        user_id: u64,
        username: &str,
    ) -> (Arc<SpectatorHandle>, mpsc::Receiver<Frame>) {
        self.subscribe_inner(user_id, username, false)
    }

    /// Stream attachment for the owning player. Kept out of the spectator
    /// accounting; reconnects replace any prior player attachment.
    pub fn subscribe_player(
        &self,
        user_id: u64,
        username: &str,
    ) -> (Arc<SpectatorHandle>, mpsc::Receiver<Frame>) {
        self.remove_player(user_id);
        self.subscribe_inner(user_id, username, true)
    }

    fn subscribe_inner(
        &self,
        user_id: u64,
        username: &str,
        player: bool,
    ) -> (Arc<SpectatorHandle>, mpsc::Receiver<Frame>) {
        // Holding the ring lock makes snapshot-and-register atomic against a
        // concurrent publish.
        let ring = lock(&self.ring);
        let snapshot = ring.snapshot();
        let last_seen = self.next_frame_id.load(Ordering::Acquire).saturating_sub(1);

        let capacity = SPECTATOR_CHANNEL_CAPACITY.max(ring.capacity + 16);
        let (tx, rx) = mpsc::channel::<Frame>(capacity);
        let handle = Arc::new(SpectatorHandle {
            user_id,
            username: username.to_owned(),
            joined_at: Utc::now(),
            player,
            active: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            last_seen: AtomicU64::new(last_seen),
        });

        let _ = tx.try_send(Frame {
            id: 0,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            data: Bytes::from_static(RESET_HINT),
        });
        for frame in snapshot {
            handle
                .bytes_sent
                .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
            let _ = tx.try_send(frame);
        }

        let entry = SpectatorEntry {
            handle: handle.clone(),
            tx,
        };
        self.spectators.rcu(|set| {
            let mut entries = set.entries.clone();
            entries.push(entry.clone());
            SpectatorSet { entries }
        });
        drop(ring);

        tracing::debug!(
            session_id = %self.session_id,
            user_id,
            username,
            "stream subscriber added"
        );
        (handle, rx)
    }

    /// Drops a spectator from the registry. Its frame channel closes, which
    /// ends the attached connection task. Returns false if absent.
    pub fn remove(&self, user_id: u64) -> bool {
        let mut removed = false;
        self.spectators.rcu(|set| {
            let mut entries = set.entries.clone();
            let before = entries.len();
            entries.retain(|e| e.handle.player || e.handle.user_id != user_id);
            removed = entries.len() != before;
            SpectatorSet { entries }
        });
        if removed {
            tracing::debug!(session_id = %self.session_id, user_id, "stream subscriber removed");
        }
        removed
    }

    /// Drops a player attachment, leaving spectator entries alone.
    pub fn remove_player(&self, user_id: u64) -> bool {
        let mut removed = false;
        self.spectators.rcu(|set| {
            let mut entries = set.entries.clone();
            let before = entries.len();
            entries.retain(|e| !e.handle.player || e.handle.user_id != user_id);
            removed = entries.len() != before;
            SpectatorSet { entries }
        });
        removed
    }

    pub fn has(&self, user_id: u64) -> bool {
        self.spectators.load().contains(user_id)
    }

    /// Point-in-time registry snapshot. The returned set never changes, even
    /// across concurrent joins and leaves.
    pub fn snapshot(&self) -> Arc<SpectatorSet> {
        self.spectators.load_full()
    }

    pub fn spectator_infos(&self) -> Vec<SpectatorInfo> {
        self.spectators
            .load()
            .entries
            .iter()
            .filter(|e| !e.handle.player)
            .map(|e| e.handle.info())
            .collect()
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    pub fn live_drops(&self) -> u64 {
        self.live_drops.load(Ordering::Relaxed)
    }

    /// Cooperative teardown: stop accepting frames, let the dispatcher drain
    /// the channel, then drop every spectator.
    pub async fn shutdown(&self) {
        lock(&self.frame_tx).take();
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(?error, session_id = %self.session_id, "dispatcher task panicked");
            }
        }
        self.spectators.store(Arc::new(SpectatorSet::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        // Give the dispatcher task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn catch_up_is_reset_hint_plus_last_ring_frames_in_order() {
        let manager = StreamManager::new("s", 100, 1000);
        for i in 0..250u32 {
            manager.publish(Bytes::from(format!("{i}")));
        }

        let (_handle, mut rx) = manager.subscribe(42, "watcher");
        let hint = rx.recv().await.unwrap();
        assert_eq!(hint.id, 0);
        assert_eq!(&hint.data[..], RESET_HINT);

        for i in 150..250u32 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.id, u64::from(i) + 1);
            assert_eq!(&frame.data[..], format!("{i}").as_bytes());
        }

        // Frames published after the join arrive live, in order.
        manager.publish(Bytes::from_static(b"live"));
        settle().await;
        let live = rx.recv().await.unwrap();
        assert_eq!(&live.data[..], b"live");
        assert_eq!(live.id, 251);
    }

    #[tokio::test]
    async fn frame_ids_increment_and_timestamps_never_regress() {
        let manager = StreamManager::new("s", 10, 100);
        let (_handle, mut rx) = manager.subscribe(1, "w");
        let _ = rx.recv().await; // reset hint

        for _ in 0..20 {
            manager.publish(Bytes::from_static(b"x"));
        }
        settle().await;

        let mut prior: Option<Frame> = None;
        for _ in 0..20 {
            let frame = rx.recv().await.unwrap();
            if let Some(p) = prior {
                assert_eq!(frame.id, p.id + 1);
                assert!(frame.timestamp_ns >= p.timestamp_ns);
            }
            prior = Some(frame);
        }
    }

    #[tokio::test]
    async fn publisher_survives_a_stalled_spectator() {
        let manager = StreamManager::new("s", 8, 16);
        // Never drained; its channel fills up.
        let (handle, _rx) = manager.subscribe(9, "slow");

        for i in 0..2000u32 {
            manager.publish(Bytes::from(format!("{i}")));
        }
        settle().await;

        assert_eq!(manager.frames_published(), 2000);
        // The stalled spectator is still registered; it only observes gaps.
        assert!(manager.has(9));
        assert!(handle.is_active());
        // The ring retained the newest frames for future joiners.
        let (_h2, mut rx2) = manager.subscribe(10, "fresh");
        let hint = rx2.recv().await.unwrap();
        assert_eq!(hint.id, 0);
        let first = rx2.recv().await.unwrap();
        assert_eq!(&first.data[..], b"1992");
    }

    #[tokio::test]
    async fn add_remove_readd_produces_a_fresh_record() {
        let manager = StreamManager::new("s", 10, 100);
        manager.publish(Bytes::from_static(b"seed"));

        let (first, _rx1) = manager.subscribe(5, "eve");
        assert!(manager.has(5));
        assert!(first.bytes_sent() > 0);

        assert!(manager.remove(5));
        assert!(!manager.has(5));
        assert!(!manager.remove(5));

        let (second, _rx2) = manager.subscribe(5, "eve");
        assert!(manager.has(5));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn a_held_snapshot_never_changes() {
        let manager = StreamManager::new("s", 10, 100);
        let (_h, _rx) = manager.subscribe(1, "a");
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);

        manager.remove(1);
        let (_h2, _rx2) = manager.subscribe(2, "b");

        // The old snapshot still shows the set as it was.
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(1));
        assert!(!snapshot.contains(2));
        assert!(manager.snapshot().contains(2));
    }

    #[tokio::test]
    async fn clear_screen_resets_catch_up_history() {
        let manager = StreamManager::new("s", 10, 100);
        manager.publish(Bytes::from_static(b"old text"));
        manager.publish(Bytes::from_static(b"more old text"));
        // Cursor home is a partial update and must not discard history.
        manager.publish(Bytes::from_static(b"\x1b[Hpartial"));
        manager.publish(Bytes::from_static(b"\x1b[2Jfresh screen"));

        let (_h, mut rx) = manager.subscribe(1, "w");
        let hint = rx.recv().await.unwrap();
        assert_eq!(hint.id, 0);
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame.data[..], b"\x1b[2Jfresh screen");
        // Nothing older survived the clear.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes_spectator_streams() {
        let manager = StreamManager::new("s", 10, 100);
        let (_h, mut rx) = manager.subscribe(1, "w");
        let _ = rx.recv().await; // reset hint
        manager.publish(Bytes::from_static(b"last words"));

        manager.shutdown().await;

        // The published frame was drained to the spectator before the close.
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame.data[..], b"last words");
        assert!(rx.recv().await.is_none());
    }
}
