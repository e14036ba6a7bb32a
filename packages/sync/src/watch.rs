//! Storage-polling fallback transport.
//!
//! Instances that share nothing but a storage backend cannot hear each
//! other's broadcasts. The watcher closes that gap: it polls the two
//! persisted slots, diffs the raw payload strings, and reconstructs the
//! same [`SyncMessage`]s a broadcast peer would have sent.

use std::sync::Arc;
use std::time::Duration;

use flowtrack_storage::KeyValueStore;
use flowtrack_zones::{COUNTS_KEY, ZONES_KEY};
use flowtrack_zones_models::{CountSnapshot, SyncMessage, Zone};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events buffered between the poll task and the consumer. The poll
/// task awaits a free slot, so a slow consumer pauses polling rather
/// than dropping events.
const WATCH_QUEUE_CAPACITY: usize = 16;

/// Polls the persisted zone and count slots and emits a [`SyncMessage`]
/// whenever a payload changes.
///
/// Baselines are read at spawn time, so only changes made after the
/// watcher started are reported. Dropping the watcher stops the poll
/// task and releases its storage handle.
#[derive(Debug)]
pub struct StorageWatcher {
    events: mpsc::Receiver<SyncMessage>,
    task: JoinHandle<()>,
}

impl StorageWatcher {
    /// Starts watching `storage`, polling every `poll_interval`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(storage: Arc<dyn KeyValueStore>, poll_interval: Duration) -> Self {
        let zones_baseline = read_slot(&*storage, ZONES_KEY);
        let counts_baseline = read_slot(&*storage, COUNTS_KEY);
        let (sender, events) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        let task = tokio::spawn(watch_slots(
            storage,
            poll_interval,
            sender,
            zones_baseline,
            counts_baseline,
        ));
        Self { events, task }
    }

    /// Waits for the next reconstructed message.
    ///
    /// Returns [`None`] if the poll task has stopped.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.events.recv().await
    }
}

impl Drop for StorageWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_slots(
    storage: Arc<dyn KeyValueStore>,
    poll_interval: Duration,
    events: mpsc::Sender<SyncMessage>,
    mut last_zones: Option<String>,
    mut last_counts: Option<String>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        let zone_change = poll_slot(&*storage, ZONES_KEY, &mut last_zones);
        if !relay(&events, zone_change.as_deref().and_then(decode_zones)).await {
            return;
        }
        let count_change = poll_slot(&*storage, COUNTS_KEY, &mut last_counts);
        if !relay(&events, count_change.as_deref().and_then(decode_counts)).await {
            return;
        }
    }
}

/// Forwards `message` to the consumer. Returns `false` once the
/// consumer side is gone and polling should stop.
async fn relay(events: &mpsc::Sender<SyncMessage>, message: Option<SyncMessage>) -> bool {
    match message {
        Some(message) => events.send(message).await.is_ok(),
        None => true,
    }
}

/// Reads `key` once, for the spawn-time baseline.
fn read_slot(storage: &dyn KeyValueStore, key: &str) -> Option<String> {
    match storage.get(key) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Failed to read sync slot {key}: {err}");
            None
        }
    }
}

/// Reads `key` and returns the new payload when it differs from
/// `last`. Read failures are logged and treated as no change; a removed
/// slot updates the baseline but yields nothing to decode.
fn poll_slot(storage: &dyn KeyValueStore, key: &str, last: &mut Option<String>) -> Option<String> {
    match storage.get(key) {
        Ok(current) => {
            if current == *last {
                None
            } else {
                last.clone_from(&current);
                current
            }
        }
        Err(err) => {
            log::warn!("Failed to poll sync slot {key}: {err}");
            None
        }
    }
}

fn decode_zones(payload: &str) -> Option<SyncMessage> {
    match serde_json::from_str::<Vec<Zone>>(payload) {
        Ok(zones) => Some(SyncMessage::ZonesUpdated { zones }),
        Err(err) => {
            log::warn!("Ignoring unreadable zone payload under {ZONES_KEY}: {err}");
            None
        }
    }
}

fn decode_counts(payload: &str) -> Option<SyncMessage> {
    match serde_json::from_str::<CountSnapshot>(payload) {
        Ok(snapshot) => Some(SyncMessage::CountsUpdated {
            counts: snapshot.counts,
        }),
        Err(err) => {
            log::warn!("Ignoring unreadable count payload under {COUNTS_KEY}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use flowtrack_storage::MemoryStore;
    use flowtrack_zones_models::{LatLng, ZoneCounts};
    use tokio::time::timeout;

    use super::*;

    const POLL: Duration = Duration::from_millis(20);

    fn zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            name: format!("{id} pen"),
            vertices: vec![
                LatLng::new(13.6280, 79.4190),
                LatLng::new(13.6290, 79.4190),
                LatLng::new(13.6290, 79.4200),
            ],
            area: 6_100.0,
            color_tag: "#e67e22".to_string(),
        }
    }

    fn zone_payload(zones: &[Zone]) -> String {
        serde_json::to_string(zones).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reconstructs_zone_updates_from_slot_changes() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);

        let zones = vec![zone("zone-a"), zone("zone-b")];
        storage.set(ZONES_KEY, &zone_payload(&zones)).unwrap();

        assert_eq!(
            watcher.recv().await,
            Some(SyncMessage::ZonesUpdated { zones })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconstructs_count_updates_from_slot_changes() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);

        let counts = ZoneCounts::from([("zone-a".to_string(), 12), ("zone-b".to_string(), 3)]);
        let snapshot = CountSnapshot::now(counts.clone());
        storage
            .set(COUNTS_KEY, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        assert_eq!(
            watcher.recv().await,
            Some(SyncMessage::CountsUpdated { counts })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_changes_after_spawn_are_reported() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        storage
            .set(ZONES_KEY, &zone_payload(&[zone("zone-a")]))
            .unwrap();

        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);
        let counts = ZoneCounts::from([("zone-a".to_string(), 9)]);
        let snapshot = CountSnapshot::now(counts.clone());
        storage
            .set(COUNTS_KEY, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        // The pre-spawn zone payload is baseline, not a change.
        assert_eq!(
            watcher.recv().await,
            Some(SyncMessage::CountsUpdated { counts })
        );
        assert!(timeout(Duration::from_millis(200), watcher.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_payloads_are_skipped() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);

        storage.set(ZONES_KEY, "not even json").unwrap();
        assert!(timeout(Duration::from_millis(200), watcher.recv())
            .await
            .is_err());

        let zones = vec![zone("zone-a")];
        storage.set(ZONES_KEY, &zone_payload(&zones)).unwrap();
        assert_eq!(
            watcher.recv().await,
            Some(SyncMessage::ZonesUpdated { zones })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_slots_emit_nothing() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);

        let zones = vec![zone("zone-a")];
        storage.set(ZONES_KEY, &zone_payload(&zones)).unwrap();
        assert!(watcher.recv().await.is_some());

        storage.remove(ZONES_KEY).unwrap();
        assert!(timeout(Duration::from_millis(200), watcher.recv())
            .await
            .is_err());

        // Re-appearing content counts as a fresh change.
        storage.set(ZONES_KEY, &zone_payload(&zones)).unwrap();
        assert_eq!(
            watcher.recv().await,
            Some(SyncMessage::ZonesUpdated { zones })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rewriting_an_identical_payload_is_quiet() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);

        let payload = zone_payload(&[zone("zone-a")]);
        storage.set(ZONES_KEY, &payload).unwrap();
        assert!(watcher.recv().await.is_some());

        storage.set(ZONES_KEY, &payload).unwrap();
        assert!(timeout(Duration::from_millis(200), watcher.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_watcher_releases_its_storage_handle() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let watcher = StorageWatcher::spawn(Arc::clone(&storage), POLL);
        assert_eq!(Arc::strong_count(&storage), 2);

        drop(watcher);
        for _ in 0..16 {
            if Arc::strong_count(&storage) == 1 {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
        assert_eq!(Arc::strong_count(&storage), 1);
    }
}
