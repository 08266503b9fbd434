//! Background consumer of the processing queue.
//!
//! Delivery is at-least-once, so handling is idempotent: the metadata row is
//! created only if missing. Notifications whose body cannot be parsed are
//! acknowledged and dropped at once. A notification is sent before its
//! ingestion commits, so one whose file record is missing is left for
//! redelivery and only dropped after [`UNKNOWN_RECORD_MAX_RECEIVES`]
//! deliveries (a rolled-back ingestion).

use super::{
    metadata_repository::FileRepository,
    queue_client::{NotificationQueue, QueueError},
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Deliveries of a notification whose file record does not exist before it
/// is discarded. With the default 30 s visibility timeout this outlasts any
/// commit bounded by the read timeout.
pub const UNKNOWN_RECORD_MAX_RECEIVES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Empty,
    Handled { store_key: String, created: bool },
    Discarded { message_id: String },
    /// Left unacknowledged; it reappears after the visibility timeout.
    Deferred { message_id: String },
}

pub struct NotificationWorker {
    queue: Arc<dyn NotificationQueue>,
    repository: Arc<dyn FileRepository>,
    poll_interval: Duration,
}

impl NotificationWorker {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        repository: Arc<dyn FileRepository>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            repository,
            poll_interval,
        }
    }

    pub async fn run(self) {
        info!(
            "Starting notification worker with {}ms poll interval",
            self.poll_interval.as_millis()
        );
        loop {
            match self.run_once().await {
                Ok(Processed::Empty) => sleep(self.poll_interval).await,
                Ok(_) => {}
                Err(err) => {
                    error!("worker.receive_failed: {}", err);
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Receive and handle at most one message.
    pub async fn run_once(&self) -> Result<Processed, QueueError> {
        let Some(message) = self.queue.receive().await? else {
            return Ok(Processed::Empty);
        };

        let Some(notification) = message.payload else {
            warn!(message_id = %message.message_id, "worker.discard_unparseable");
            self.acknowledge(&message.receipt_handle).await?;
            return Ok(Processed::Discarded {
                message_id: message.message_id,
            });
        };

        let store_key = notification.store_key;
        let record = match self.repository.find_file(&store_key).await {
            Ok(record) => record,
            Err(err) => {
                warn!(store_key = %store_key, "worker.lookup_failed, deferring: {}", err);
                return Ok(Processed::Deferred {
                    message_id: message.message_id,
                });
            }
        };

        let Some(record) = record else {
            if message.receive_count < UNKNOWN_RECORD_MAX_RECEIVES {
                info!(
                    store_key = %store_key,
                    attempt = message.receive_count,
                    "worker.record_not_visible_yet, deferring"
                );
                return Ok(Processed::Deferred {
                    message_id: message.message_id,
                });
            }
            warn!(
                store_key = %store_key,
                attempt = message.receive_count,
                "worker.discard_unknown_file"
            );
            self.acknowledge(&message.receipt_handle).await?;
            return Ok(Processed::Discarded {
                message_id: message.message_id,
            });
        };

        let created = match self
            .repository
            .ensure_metadata(&record.store_key, record.owner_id)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                warn!(store_key = %store_key, "worker.metadata_failed, deferring: {}", err);
                return Ok(Processed::Deferred {
                    message_id: message.message_id,
                });
            }
        };

        self.acknowledge(&message.receipt_handle).await?;
        info!(
            store_key = %store_key,
            created,
            attempt = message.receive_count,
            "worker.handled"
        );
        Ok(Processed::Handled { store_key, created })
    }

    async fn acknowledge(&self, receipt_handle: &str) -> Result<(), QueueError> {
        if !self.queue.acknowledge(receipt_handle).await? {
            warn!("worker.ack_superseded: message was redelivered before acknowledgement");
        }
        Ok(())
    }
}
