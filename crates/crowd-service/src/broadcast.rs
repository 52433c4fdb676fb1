use common::crowd::CrowdEvent;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of crowd events to live clients.
///
/// Publishing never blocks the pipeline. Slow receivers lag and lose the
/// oldest events instead of holding the sender back.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<CrowdEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrowdEvent> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers the event reached
    pub fn publish(&self, event: CrowdEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("no live subscribers for crowd event");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::crowd::CountUpdate;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let broadcaster = Broadcaster::default();
        assert_eq!(
            broadcaster.publish(CrowdEvent::CrowdUpdate(CountUpdate::new(3))),
            0
        );
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let broadcaster = Broadcaster::new(8);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        let event = CrowdEvent::CrowdUpdate(CountUpdate::new(12));
        assert_eq!(broadcaster.publish(event.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.subscribe();
        for count in 0..5 {
            broadcaster.publish(CrowdEvent::CrowdUpdate(CountUpdate::new(count)));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            CrowdEvent::CrowdUpdate(CountUpdate::new(3))
        );
    }
}
