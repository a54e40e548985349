//! Post-commit change notifications.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{ChangedFields, PersonaResult, Source, SubjectId, Timestamp};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub subject_id: SubjectId,
    pub changed_fields: ChangedFields,
    pub source: Source,
    pub timestamp: Timestamp,
}

/// Receives notifications once the transaction that produced them has
/// committed. Implementations must not assume exactly-once delivery.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn publish(&self, notification: ChangeNotification) -> PersonaResult<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl ChangeSink for NoopSink {
    async fn publish(&self, _notification: ChangeNotification) -> PersonaResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ChangeSink for LogSink {
    async fn publish(&self, notification: ChangeNotification) -> PersonaResult<()> {
        let fields = notification
            .changed_fields
            .iter()
            .map(|field| field.as_str())
            .collect::<Vec<_>>()
            .join(",");
        info!(
            "subject {} changed [{fields}] ({:?}) at {}",
            notification.subject_id, notification.source, notification.timestamp
        );
        Ok(())
    }
}

/// Forwards notifications to an in-process subscriber.
///
/// Publishing never waits: when the subscriber lags behind and the channel
/// is full, or has gone away, the notification is dropped with a warning so
/// writers are not held up after their commit.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<ChangeNotification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChangeNotification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ChangeSink for ChannelSink {
    async fn publish(&self, notification: ChangeNotification) -> PersonaResult<()> {
        debug!("forwarding change for subject {}", notification.subject_id);
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                "change subscriber is lagging; dropped notification for subject {}",
                dropped.subject_id
            ),
            Err(TrySendError::Closed(dropped)) => warn!(
                "change subscriber is gone; dropped notification for subject {}",
                dropped.subject_id
            ),
        }
        Ok(())
    }
}
