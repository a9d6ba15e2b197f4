use crate::image::NotificationEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::Sender<NotificationEvent>>,
    closed: bool,
}

/// Forwards every event from the shared worker channel to all registered subscribers.
/// Subscribers are never removed; their channels close once the fanout shuts down.
#[derive(Clone)]
pub struct Fanout {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Fanout {
    pub fn spawn(
        input: mpsc::Receiver<NotificationEvent>,
        cancel: CancellationToken,
    ) -> (Fanout, JoinHandle<()>) {
        let fanout = Fanout {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
        };
        let task = tokio::spawn(fanout.clone().run(input, cancel));
        (fanout, task)
    }

    /// Registers a subscriber for all events emitted from now on.
    pub fn notify(&self, subscriber: mpsc::Sender<NotificationEvent>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subscribers.closed {
            debug!("Fanout already stopped, subscriber will not receive events");
            return;
        }
        subscribers.senders.push(subscriber);
    }

    async fn run(self, mut input: mpsc::Receiver<NotificationEvent>, cancel: CancellationToken) {
        'events: loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = input.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let senders = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .senders
                .clone();
            for sender in senders {
                // A subscriber that stops draining must not keep the fanout alive past shutdown
                tokio::select! {
                    _ = cancel.cancelled() => break 'events,
                    sent = sender.send(event.clone()) => if sent.is_err() {
                        warn!(
                            "Subscriber went away, dropping notification for {}",
                            event.image
                        );
                    },
                }
            }
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.closed = true;
        subscribers.senders.clear();
        info!("Notification fanout stopped");
    }
}
