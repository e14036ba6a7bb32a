#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cross-instance propagation of zone and count changes.
//!
//! Every instance that mutates shared state publishes a full-state
//! [`SyncMessage`] and applies the ones it receives wholesale, so peers
//! converge on the last writer without merging. Two transports carry
//! the messages:
//!
//! * a process-global registry of named broadcast topics, for instances
//!   living in the same process (a bus's own broadcasts are filtered
//!   out of its subscription), and
//! * [`watch::StorageWatcher`], which polls the persisted slots and
//!   reconstructs the same messages from payload changes, for instances
//!   that only share a storage backend.

pub mod watch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use crate::watch::StorageWatcher;
use flowtrack_storage::KeyValueStore;
use flowtrack_zones_models::SyncMessage;
use thiserror::Error;
use tokio::sync::broadcast;

/// Topic joined when the caller does not name one.
pub const DEFAULT_TOPIC: &str = "flowtrack-sync";

/// Poll cadence of the storage watcher when the caller does not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Messages buffered per broadcast topic. A subscription that falls
/// further behind is lagged: it logs a warning and resumes at the
/// oldest message still retained, which for full-state messages just
/// means catching up to a newer snapshot.
const BROADCAST_CAPACITY: usize = 64;

/// A topic message plus the origin id of the bus that published it.
/// Internal to the channel transport; the wire shape of [`SyncMessage`]
/// is unchanged.
#[derive(Clone)]
struct Envelope {
    origin: u64,
    message: SyncMessage,
}

/// One sender per topic, shared by every bus in the process that joins
/// the topic. Entries are never removed; the handful of topics a
/// process uses live as long as the process does.
static TOPICS: LazyLock<Mutex<BTreeMap<String, broadcast::Sender<Envelope>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Distinguishes publishing buses within the process. Stamped on every
/// channel message so a subscription can drop what its own bus sent.
static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(0);

/// Failure to establish a sync transport.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No transport had what it needs: the broadcast channel needs a
    /// topic name and the storage watcher needs a storage handle.
    #[error("No sync transport is available")]
    TransportUnavailable,
}

/// Which transport [`SyncBus::connect`] should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportPreference {
    /// The first transport whose requirement is met, channel first.
    #[default]
    Auto,
    /// The in-process broadcast channel only.
    Channel,
    /// The storage-polling watcher only.
    StorageWatch,
}

/// Connection settings for [`SyncBus::connect`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Broadcast topic to join. An empty topic means there is no
    /// channel to join; under [`TransportPreference::Auto`] that falls
    /// through to the storage watcher.
    pub topic: String,
    /// Transport selection policy.
    pub preference: TransportPreference,
    /// How often the storage watcher polls for changes.
    pub poll_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            preference: TransportPreference::Auto,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Returns the broadcast sender for `topic`, creating the channel on
/// first use.
fn topic_sender(topic: &str) -> broadcast::Sender<Envelope> {
    let mut topics = TOPICS.lock().expect("sync topic registry mutex poisoned");
    topics
        .entry(topic.to_string())
        .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
        .clone()
}

enum Transport {
    Channel {
        sender: broadcast::Sender<Envelope>,
        receiver: broadcast::Receiver<Envelope>,
    },
    Watcher(StorageWatcher),
}

/// One instance's attachment to the sync fabric: a publisher plus a
/// subscription over whichever transport [`SyncBus::connect`] selected.
///
/// Dropping the bus releases the subscription and, for the watcher
/// transport, stops the poll task.
pub struct SyncBus {
    transport: Transport,
    origin: u64,
}

impl SyncBus {
    /// Attaches to the sync fabric per `options`.
    ///
    /// The channel transport needs a non-empty topic; the storage
    /// watcher needs `storage`. Under [`TransportPreference::Auto`] the
    /// bus takes the first of the two whose requirement is met, channel
    /// first.
    ///
    /// # Errors
    ///
    /// * [`SyncError::TransportUnavailable`] if the preferred transport
    ///   (under `Auto`, every transport) is missing its requirement.
    ///
    /// # Panics
    ///
    /// Panics if the watcher transport is selected outside a tokio
    /// runtime, or if the topic registry `Mutex` is poisoned.
    pub fn connect(
        options: &SyncOptions,
        storage: Option<Arc<dyn KeyValueStore>>,
    ) -> Result<Self, SyncError> {
        let transport = match options.preference {
            TransportPreference::Channel => channel_transport(&options.topic)?,
            TransportPreference::StorageWatch => watcher_transport(storage, options.poll_interval)?,
            TransportPreference::Auto => channel_transport(&options.topic)
                .or_else(|_| watcher_transport(storage, options.poll_interval))?,
        };
        match &transport {
            Transport::Channel { .. } => {
                log::debug!("Sync attached to broadcast topic {topic}", topic = options.topic);
            }
            Transport::Watcher(_) => log::debug!("Sync attached to the storage watcher"),
        }
        Ok(Self {
            transport,
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Publishes a full-state message to peers and returns how many
    /// topic subscriptions it was handed to. Zero listeners is not an
    /// error.
    ///
    /// Each message is stamped with this bus's origin, and subscriptions
    /// drop their own bus's messages on receive, so a local mutation is
    /// never replayed onto the instance that made it. The publisher's
    /// own subscription still counts toward the reach; it receives the
    /// envelope and discards it. With the watcher transport there is
    /// nothing to push (peers observe the persisted slots instead) and
    /// the reach is always zero.
    #[must_use]
    pub fn publish(&self, message: &SyncMessage) -> usize {
        match &self.transport {
            Transport::Channel { sender, .. } => sender
                .send(Envelope {
                    origin: self.origin,
                    message: message.clone(),
                })
                .unwrap_or(0),
            Transport::Watcher(_) => 0,
        }
    }

    /// Waits for the next message from peers.
    ///
    /// Messages this bus (or a publisher derived from it) published are
    /// skipped. Returns [`None`] once the transport can produce no more
    /// messages. A lagged subscription logs a warning and resumes at
    /// the oldest retained message.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        let origin = self.origin;
        match &mut self.transport {
            Transport::Channel { receiver, .. } => loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin == origin => {}
                    Ok(envelope) => return Some(envelope.message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Sync subscription lagged, skipped {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Transport::Watcher(watcher) => watcher.recv().await,
        }
    }

    /// Returns a standalone publishing handle onto this bus's topic, so
    /// one part of a program can keep publishing while another owns the
    /// bus and receives. The handle carries this bus's origin stamp, so
    /// its messages are likewise invisible to this bus's subscription.
    #[must_use]
    pub fn publisher(&self) -> SyncPublisher {
        let sender = match &self.transport {
            Transport::Channel { sender, .. } => Some(sender.clone()),
            Transport::Watcher(_) => None,
        };
        SyncPublisher {
            sender,
            origin: self.origin,
        }
    }
}

/// The publishing half of a bus, detached from the subscription.
///
/// Over the watcher transport there is no channel to push into, so a
/// publisher's reach is always zero there (peers observe the persisted
/// slots instead).
#[derive(Clone)]
pub struct SyncPublisher {
    sender: Option<broadcast::Sender<Envelope>>,
    origin: u64,
}

impl SyncPublisher {
    /// Publishes a full-state message; same contract as
    /// [`SyncBus::publish`].
    #[must_use]
    pub fn publish(&self, message: &SyncMessage) -> usize {
        self.sender.as_ref().map_or(0, |sender| {
            sender
                .send(Envelope {
                    origin: self.origin,
                    message: message.clone(),
                })
                .unwrap_or(0)
        })
    }
}

fn channel_transport(topic: &str) -> Result<Transport, SyncError> {
    if topic.is_empty() {
        return Err(SyncError::TransportUnavailable);
    }
    let sender = topic_sender(topic);
    let receiver = sender.subscribe();
    Ok(Transport::Channel { sender, receiver })
}

fn watcher_transport(
    storage: Option<Arc<dyn KeyValueStore>>,
    poll_interval: Duration,
) -> Result<Transport, SyncError> {
    let storage = storage.ok_or(SyncError::TransportUnavailable)?;
    Ok(Transport::Watcher(StorageWatcher::spawn(
        storage,
        poll_interval,
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use flowtrack_storage::MemoryStore;
    use flowtrack_zones::ZONES_KEY;
    use flowtrack_zones_models::{LatLng, Zone, ZoneCounts};
    use tokio::time::timeout;

    use super::*;

    fn zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            name: format!("{id} stand"),
            vertices: vec![
                LatLng::new(13.6280, 79.4190),
                LatLng::new(13.6290, 79.4190),
                LatLng::new(13.6290, 79.4200),
            ],
            area: 6_100.0,
            color_tag: "#3498db".to_string(),
        }
    }

    fn options(topic: &str) -> SyncOptions {
        SyncOptions {
            topic: topic.to_string(),
            ..SyncOptions::default()
        }
    }

    fn counts_message(seq: u64) -> SyncMessage {
        SyncMessage::CountsUpdated {
            counts: ZoneCounts::from([("zone-seq".to_string(), seq)]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_zone_lists_between_buses_on_one_topic() {
        let sender = SyncBus::connect(&options("t-alpha"), None).unwrap();
        let mut receiver = SyncBus::connect(&options("t-alpha"), None).unwrap();

        let zones = vec![zone("zone-a"), zone("zone-b")];
        let reach = sender.publish(&SyncMessage::ZonesUpdated {
            zones: zones.clone(),
        });
        assert_eq!(reach, 2);

        let Some(SyncMessage::ZonesUpdated { zones: received }) = receiver.recv().await else {
            panic!("expected a zone update");
        };
        assert_eq!(received, zones);
        let ids: BTreeSet<&str> = received.iter().map(|zone| zone.id.as_str()).collect();
        assert_eq!(ids.len(), received.len());
    }

    #[tokio::test(start_paused = true)]
    async fn a_bus_never_hears_its_own_broadcasts() {
        let mut bus = SyncBus::connect(&options("t-bravo"), None).unwrap();
        let mut peer = SyncBus::connect(&options("t-bravo"), None).unwrap();

        let message = counts_message(7);
        assert_eq!(bus.publish(&message), 2);
        // The peer hears it; the publishing bus's subscription drops it.
        assert_eq!(peer.recv().await, Some(message));
        let echo = timeout(Duration::from_millis(50), bus.recv()).await;
        assert!(echo.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn topics_do_not_leak_into_each_other() {
        let sender = SyncBus::connect(&options("t-charlie"), None).unwrap();
        let mut other = SyncBus::connect(&options("t-delta"), None).unwrap();

        assert_eq!(sender.publish(&counts_message(1)), 1);
        let heard = timeout(Duration::from_millis(50), other.recv()).await;
        assert!(heard.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lagged_subscriptions_resume_at_the_oldest_retained_message() {
        let sender = SyncBus::connect(&options("t-echo"), None).unwrap();
        let mut slow = SyncBus::connect(&options("t-echo"), None).unwrap();

        let backlog = BROADCAST_CAPACITY + 3;
        for seq in 0..backlog {
            let _ = sender.publish(&counts_message(u64::try_from(seq).unwrap()));
        }

        // The first three messages fell out of the topic buffer, so the
        // slow subscription resumes at sequence 3.
        assert_eq!(slow.recv().await, Some(counts_message(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn a_detached_publisher_keeps_its_bus_origin() {
        let mut bus = SyncBus::connect(&options("t-foxtrot"), None).unwrap();
        let mut peer = SyncBus::connect(&options("t-foxtrot"), None).unwrap();
        let publisher = bus.publisher();

        assert_eq!(publisher.publish(&counts_message(2)), 2);
        assert_eq!(peer.recv().await, Some(counts_message(2)));
        // The handle publishes under its bus's origin, so that bus does
        // not receive the message back either.
        let echo = timeout(Duration::from_millis(50), bus.recv()).await;
        assert!(echo.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_requires_some_transport() {
        let channel_only = SyncOptions {
            topic: String::new(),
            preference: TransportPreference::Channel,
            ..SyncOptions::default()
        };
        assert!(matches!(
            SyncBus::connect(&channel_only, None),
            Err(SyncError::TransportUnavailable)
        ));

        let watcher_only = SyncOptions {
            preference: TransportPreference::StorageWatch,
            ..SyncOptions::default()
        };
        assert!(matches!(
            SyncBus::connect(&watcher_only, None),
            Err(SyncError::TransportUnavailable)
        ));

        let nothing = SyncOptions {
            topic: String::new(),
            ..SyncOptions::default()
        };
        assert!(matches!(
            SyncBus::connect(&nothing, None),
            Err(SyncError::TransportUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_falls_back_to_the_storage_watcher() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let fallback = SyncOptions {
            topic: String::new(),
            poll_interval: Duration::from_millis(20),
            ..SyncOptions::default()
        };
        let mut bus = SyncBus::connect(&fallback, Some(Arc::clone(&storage))).unwrap();

        let zones = vec![zone("zone-a")];
        storage
            .set(ZONES_KEY, &serde_json::to_string(&zones).unwrap())
            .unwrap();
        assert_eq!(
            bus.recv().await,
            Some(SyncMessage::ZonesUpdated { zones })
        );
    }
}
