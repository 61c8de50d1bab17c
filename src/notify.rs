use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, PaymentStatus, SpaceStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget events emitted after a write is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    SpaceUpdated {
        location_id: Ulid,
        space_id: String,
        status: SpaceStatus,
    },
    AvailabilityUpdated {
        location_id: Ulid,
        available_spaces: u32,
        occupancy_percentage: f64,
    },
    BookingUpdated {
        booking_id: Ulid,
        user_id: String,
        location_id: Ulid,
        space_id: String,
        status: BookingStatus,
    },
    PaymentUpdated {
        booking_id: Ulid,
        user_id: String,
        location_id: Ulid,
        payment_status: PaymentStatus,
    },
}

impl Notification {
    pub fn location_id(&self) -> Ulid {
        match self {
            Notification::SpaceUpdated { location_id, .. }
            | Notification::AvailabilityUpdated { location_id, .. }
            | Notification::BookingUpdated { location_id, .. }
            | Notification::PaymentUpdated { location_id, .. } => *location_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SpaceUpdated { .. } => "space_updated",
            Notification::AvailabilityUpdated { .. } => "availability_updated",
            Notification::BookingUpdated { .. } => "booking_updated",
            Notification::PaymentUpdated { .. } => "payment_updated",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Unavailable(String),
}

/// Transport-agnostic sink the engine publishes to. Failures are logged by
/// the caller and never undo the write that produced the notification.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// In-process broadcast hub: one channel per location plus a firehose.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
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
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for a location. Creates the channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every notification regardless of location.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening.
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(&notification.location_id()) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_updated(location_id: Ulid) -> Notification {
        Notification::SpaceUpdated {
            location_id,
            space_id: "A1".into(),
            status: SpaceStatus::Reserved,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let lid = Ulid::new();
        let mut rx = hub.subscribe(lid);

        let n = space_updated(lid);
        hub.publish(&n).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
    }

    #[tokio::test]
    async fn other_locations_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);
        hub.publish(&space_updated(Ulid::new())).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_sees_everything() {
        let hub = NotifyHub::new();
        let mut all = hub.subscribe_all();
        hub.publish(&space_updated(Ulid::new())).unwrap();
        hub.publish(&space_updated(Ulid::new())).unwrap();
        assert!(all.recv().await.is_ok());
        assert!(all.recv().await.is_ok());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(hub.publish(&space_updated(Ulid::new())).is_ok());
    }

    #[test]
    fn json_payload_is_tagged() {
        let n = space_updated(Ulid::nil());
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "space_updated");
        assert_eq!(json["status"], "reserved");
        assert_eq!(n.kind(), "space_updated");
    }
}
