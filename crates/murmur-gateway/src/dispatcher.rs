use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};
use uuid::Uuid;

use murmur_types::events::{ClientEvent, JsonCommand};

/// Close code sent when a frontend's outbound queue overflows.
pub const STATUS_EVENTS_STUCK: u16 = 4001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue is at capacity.
    Full,
    /// The connection is already shutting down.
    Closed,
}

/// One registered frontend as seen by the dispatcher.
pub trait Subscriber: Send + Sync {
    fn try_push(&self, cmd: &JsonCommand) -> Result<(), PushError>;

    /// Start the connection's teardown. Must be safe to call repeatedly.
    fn close(&self, code: u16, reason: &str);
}

/// Fans client events out to every connected frontend.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    subscribers: RwLock<HashMap<Uuid, Arc<dyn Subscriber>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conn_id: Uuid, subscriber: Arc<dyn Subscriber>) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, subscriber);
    }

    pub fn unsubscribe(&self, conn_id: Uuid) -> bool {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id)
            .is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue `event` on every subscriber. Subscribers whose queue is full are
    /// closed with [`STATUS_EVENTS_STUCK`] once the map lock is released.
    pub fn publish(&self, event: &ClientEvent) {
        let cmd = match event.to_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.command_name(), e);
                return;
            }
        };

        let stuck: Vec<(Uuid, Arc<dyn Subscriber>)> = {
            let subscribers = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter_map(|(id, sub)| match sub.try_push(&cmd) {
                    Ok(()) => None,
                    Err(PushError::Full) => Some((*id, Arc::clone(sub))),
                    Err(PushError::Closed) => {
                        debug!(conn = %id, "Skipping {} for closing connection", event.command_name());
                        None
                    }
                })
                .collect()
        };

        for (id, sub) in stuck {
            warn!(conn = %id, "Event queue full, closing connection");
            sub.close(STATUS_EVENTS_STUCK, "event queue overflow");
        }
    }

    /// Close every connection, e.g. on server shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        let all: Vec<Arc<dyn Subscriber>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        debug!("Closing {} connections with {}", all.len(), code);
        for sub in all {
            sub.close(code, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use murmur_types::events::{SyncStatus, SyncStatusKind};

    struct Recorder {
        id: Uuid,
        dispatcher: Dispatcher,
        capacity: usize,
        pushed: Mutex<Vec<JsonCommand>>,
        closes: Mutex<Vec<u16>>,
    }

    impl Subscriber for Recorder {
        fn try_push(&self, cmd: &JsonCommand) -> Result<(), PushError> {
            let mut pushed = self.pushed.lock().unwrap();
            if !self.closes.lock().unwrap().is_empty() {
                return Err(PushError::Closed);
            }
            if pushed.len() >= self.capacity {
                return Err(PushError::Full);
            }
            pushed.push(cmd.clone());
            Ok(())
        }

        fn close(&self, code: u16, _reason: &str) {
            // Unsubscribing takes the write lock; this deadlocks if called
            // while publish still holds the read lock.
            self.dispatcher.unsubscribe(self.id);
            self.closes.lock().unwrap().push(code);
        }
    }

    fn recorder(dispatcher: &Dispatcher, capacity: usize) -> Arc<Recorder> {
        let rec = Arc::new(Recorder {
            id: Uuid::new_v4(),
            dispatcher: dispatcher.clone(),
            capacity,
            pushed: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        });
        dispatcher.subscribe(rec.id, rec.clone());
        rec
    }

    fn status() -> ClientEvent {
        ClientEvent::SyncStatus(SyncStatus {
            kind: SyncStatusKind::Ok,
            error_count: 0,
            last_error: None,
        })
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let a = recorder(&dispatcher, 10);
        let b = recorder(&dispatcher, 10);
        dispatcher.publish(&status());
        assert_eq!(a.pushed.lock().unwrap().len(), 1);
        assert_eq!(b.pushed.lock().unwrap()[0].command.as_deref(), Some("sync_status"));
    }

    #[test]
    fn full_queue_closes_only_that_subscriber() {
        let dispatcher = Dispatcher::new();
        let slow = recorder(&dispatcher, 1);
        let fast = recorder(&dispatcher, 10);

        dispatcher.publish(&status());
        dispatcher.publish(&status());
        dispatcher.publish(&status());

        assert_eq!(*slow.closes.lock().unwrap(), vec![STATUS_EVENTS_STUCK]);
        assert!(fast.closes.lock().unwrap().is_empty());
        assert_eq!(fast.pushed.lock().unwrap().len(), 3);
        assert_eq!(dispatcher.connection_count(), 1);
    }

    #[test]
    fn close_all_closes_everyone() {
        let dispatcher = Dispatcher::new();
        let a = recorder(&dispatcher, 1);
        let b = recorder(&dispatcher, 1);
        dispatcher.close_all(1001, "shutdown");
        assert_eq!(*a.closes.lock().unwrap(), vec![1001]);
        assert_eq!(*b.closes.lock().unwrap(), vec![1001]);
        assert_eq!(dispatcher.connection_count(), 0);
    }
}
