use async_trait::async_trait;
use ciq_core::AlertEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget destination for alert events. Failures are reported but
/// never undo the persisted event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        info!(
            rule_id = %event.rule_id,
            entity_id = %event.entity_id,
            metric = %event.metric,
            old_value = event.old_value,
            new_value = event.new_value,
            delta = event.delta,
            "alert published"
        );
        Ok(())
    }
}

/// Hands events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<AlertEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        self.sender.try_send(event.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
            mpsc::error::TrySendError::Full(_) => {
                NotifyError::Delivery("notification channel full".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ciq_core::MetricName;

    fn event() -> AlertEvent {
        AlertEvent {
            rule_id: "B001:price".into(),
            entity_id: "B001".into(),
            metric: MetricName::Price,
            triggered_at: Utc::now(),
            old_value: 100.0,
            new_value: 89.0,
            delta: -0.11,
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers_until_full_or_closed() {
        let (sink, mut receiver) = ChannelSink::new(1);
        sink.publish(&event()).await.unwrap();
        assert!(matches!(
            sink.publish(&event()).await,
            Err(NotifyError::Delivery(_))
        ));
        assert_eq!(receiver.recv().await.unwrap().rule_id, "B001:price");

        drop(receiver);
        assert!(matches!(sink.publish(&event()).await, Err(NotifyError::Closed)));
    }

    #[tokio::test]
    async fn log_sink_never_fails() {
        assert!(LogSink.publish(&event()).await.is_ok());
    }
}
