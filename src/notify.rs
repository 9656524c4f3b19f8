use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ZoneId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-zone change feed. Every committed event that touches a zone is
/// broadcast to that zone's subscribers.
pub struct NotifyHub {
    channels: DashMap<ZoneId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a zone's feed. Creates the channel if needed.
    pub fn subscribe(&self, zone: &ZoneId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(zone.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, zone: &ZoneId, event: &Event) {
        if let Some(sender) = self.channels.get(zone) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscriber_count(&self, zone: &ZoneId) -> usize {
        self.channels
            .get(zone)
            .map_or(0, |sender| sender.receiver_count())
    }
}
