//! Event intake: a dedicated task drains the cluster event stream into a
//! bounded channel so the control loop sees events one at a time, in order.

use async_trait::async_trait;
use expose_cluster::{ClusterError, ClusterEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Buffer between the event stream and the control loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A source of cluster change notifications.
///
/// `Ok(None)` means the stream ended.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, ClusterError>;
}

/// Forward every event from `source` into `tx` until the stream ends, the
/// stream fails, or the receiver is dropped.
pub fn spawn_event_pump<E>(
    mut source: E,
    tx: mpsc::Sender<ClusterEvent>,
) -> JoinHandle<Result<(), ClusterError>>
where
    E: EventSource + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = source.next_event().await? {
            debug!(event = %event, "received cluster event");
            if tx.send(event).await.is_err() {
                info!("control loop stopped, closing event pump");
                return Ok(());
            }
        }

        info!("cluster event stream ended");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use expose_cluster::EventAction;
    use std::collections::VecDeque;

    struct ScriptedSource {
        events: VecDeque<Result<Option<ClusterEvent>, ClusterError>>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Option<ClusterEvent>, ClusterError> {
            self.events.pop_front().unwrap_or(Ok(None))
        }
    }

    #[tokio::test]
    async fn test_pump_forwards_in_order_then_closes() {
        let source = ScriptedSource {
            events: VecDeque::from(vec![
                Ok(Some(ClusterEvent::node(EventAction::Create, "n1"))),
                Ok(Some(ClusterEvent::service(EventAction::Update, "s1", "api"))),
            ]),
        };
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pump = spawn_event_pump(source, tx);

        assert_eq!(rx.recv().await, Some(ClusterEvent::node(EventAction::Create, "n1")));
        assert_eq!(
            rx.recv().await,
            Some(ClusterEvent::service(EventAction::Update, "s1", "api"))
        );
        assert_eq!(rx.recv().await, None);
        assert!(pump.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pump_surfaces_stream_errors() {
        let source = ScriptedSource {
            events: VecDeque::from(vec![
                Ok(Some(ClusterEvent::node(EventAction::Remove, "n1"))),
                Err(ClusterError::Transport("connection reset".into())),
            ]),
        };
        let (tx, mut rx) = mpsc::channel(1);
        let pump = spawn_event_pump(source, tx);

        assert!(rx.recv().await.is_some());
        assert_eq!(rx.recv().await, None);
        assert_eq!(
            pump.await.unwrap(),
            Err(ClusterError::Transport("connection reset".into()))
        );
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_dropped() {
        let source = ScriptedSource {
            events: VecDeque::from(vec![
                Ok(Some(ClusterEvent::node(EventAction::Create, "n1"))),
                Ok(Some(ClusterEvent::node(EventAction::Create, "n2"))),
            ]),
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert!(spawn_event_pump(source, tx).await.unwrap().is_ok());
    }
}
