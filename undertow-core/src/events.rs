//! Fan-out and one-shot signalling primitives.
//!
//! `Broadcaster` delivers every published value to all current listeners
//! through a bounded ring: a listener that falls behind loses its oldest
//! entries instead of stalling the producer. `Event` is a latch that is set
//! once and observed by any number of waiters.

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default per-listener queue depth.
pub const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// One producer, many listeners.
///
/// `broadcast` never blocks. Each listener owns its position in the ring;
/// order is preserved per listener.
pub struct Broadcaster<T: Clone + Send + 'static> {
    sender: Mutex<Option<broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Creates a broadcaster with the default listener capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LISTENER_CAPACITY)
    }

    /// Creates a broadcaster whose listeners buffer at most `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new listener. Listening on a closed broadcaster yields a
    /// listener that reports closed immediately.
    pub fn listen(&self) -> Listener<T> {
        let guard = self.sender.lock();
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                drop(sender);
                receiver
            }
        };
        Listener {
            receiver,
            done: CancellationToken::new(),
        }
    }

    /// Publishes `value` to every current listener. Returns the number of
    /// listeners the value was queued for.
    pub fn broadcast(&self, value: T) -> usize {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Closes every listener channel. Further broadcasts are dropped.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a `Broadcaster`.
///
/// Dropping the listener or calling `close` removes it from the fan-out.
pub struct Listener<T: Clone + Send + 'static> {
    receiver: broadcast::Receiver<T>,
    done: CancellationToken,
}

impl<T: Clone + Send + 'static> Listener<T> {
    /// Waits for the next value. Returns `None` once the broadcaster is
    /// closed or this listener's done signal fired.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(value) => return Some(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Listener lagged, dropped {} oldest values", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.done.is_cancelled() {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Handle that closes this listener from another task.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Stops this listener; pending and future values are discarded.
    pub fn close(self) {
        self.done.cancel();
    }
}

/// One-shot latch. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct Event {
    token: CancellationToken,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event, waking every waiter. Idempotent.
    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the event is set.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Underlying token, for use in `tokio::select!` alongside other tokens.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_listener() {
        let broadcaster = Broadcaster::new();
        let mut first = broadcaster.listen();
        let mut second = broadcaster.listen();

        assert_eq!(broadcaster.broadcast(7u32), 2);
        assert_eq!(first.recv().await, Some(7));
        assert_eq!(second.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_order_preserved_per_listener() {
        let broadcaster = Broadcaster::new();
        let mut listener = broadcaster.listen();
        for value in 0..10u32 {
            broadcaster.broadcast(value);
        }
        for expected in 0..10u32 {
            assert_eq!(listener.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_slow_listener_drops_oldest_without_blocking_producer() {
        let broadcaster = Broadcaster::with_capacity(4);
        let mut slow = broadcaster.listen();
        for value in 0..100u32 {
            broadcaster.broadcast(value);
        }
        // Only the newest values survive.
        let first = slow.recv().await.unwrap();
        assert!(first >= 96);
    }

    #[tokio::test]
    async fn test_close_ends_all_listeners() {
        let broadcaster: Broadcaster<u8> = Broadcaster::new();
        let mut listener = broadcaster.listen();
        broadcaster.close();
        assert!(broadcaster.is_closed());
        assert_eq!(listener.recv().await, None);
        assert_eq!(broadcaster.broadcast(1), 0);

        let mut late = broadcaster.listen();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_listener_done_removes_it() {
        let broadcaster: Broadcaster<u8> = Broadcaster::new();
        let mut listener = broadcaster.listen();
        let done = listener.done();
        done.cancel();
        broadcaster.broadcast(3);
        assert_eq!(listener.recv().await, None);

        let closing = broadcaster.listen();
        assert_eq!(broadcaster.listener_count(), 2);
        drop(listener);
        closing.close();
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_event_wakes_waiters() {
        let event = Event::new();
        let waiter = event.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        assert!(!event.is_set());
        event.set();
        event.set();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_set());
    }
}
