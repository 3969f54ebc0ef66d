//! Notification protocol: one way, no session survives delivery.

use crate::message::Message;

/// Business hook of a notification listener.
pub trait Listener: Send {
    /// A notification arrived.
    fn notified(&mut self, notification: &Message) -> anyhow::Result<()>;
}

/// Hand a notification to its listener; failures are only logged.
pub(crate) fn deliver(listener: &mut dyn Listener, notification: &Message) {
    match listener.notified(notification) {
        Ok(()) => tracing::debug!(
            session_id = %notification.session_id,
            protocol_id = %notification.protocol_id,
            from = %notification.sender,
            "Notified"
        ),
        Err(err) => tracing::error!(
            session_id = %notification.session_id,
            protocol_id = %notification.protocol_id,
            error = %format!("{err:#}"),
            "Listener failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, Notification, Recipient};

    struct Counter(usize);

    impl Listener for Counter {
        fn notified(&mut self, notification: &Message) -> anyhow::Result<()> {
            anyhow::ensure!(notification.payload().is_some_and(|p| !p.is_null()), "empty");
            self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn test_failure_is_contained() {
        let mut counter = Counter(0);
        let message = Message::new(
            "n-1".into(),
            "heartbeat",
            Recipient::agent("eu", "a"),
            Recipient::agent("eu", "b"),
            Body::Notification(Notification::default()),
        );
        deliver(&mut counter, &message);
        assert_eq!(counter.0, 0);

        let message = Message {
            body: Body::Notification(Notification {
                payload: serde_json::json!({"up": true}),
            }),
            ..message
        };
        deliver(&mut counter, &message);
        assert_eq!(counter.0, 1);
    }
}
