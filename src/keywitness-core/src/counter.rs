//! Monotonic event counter with threshold subscriptions.
//!
//! Each counter holds its own subscriber list. A subscriber registered with
//! threshold `n` receives a [`CountEvent`] whenever the count has advanced by
//! at least `n` since the last event it actually received. Delivery never
//! blocks the producer: a full channel skips that notification and a closed
//! channel drops the subscriber.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::error::WitnessError;

/// Buffered notifications per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 10;

/// Notification sent to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEvent {
    /// Count at notification time.
    pub count: u64,
    /// Wall-clock time of the notification.
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    threshold: u64,
    last_notified: u64,
    tx: mpsc::Sender<CountEvent>,
}

#[derive(Default)]
struct CounterState {
    count: u64,
    subscribers: Vec<Subscriber>,
}

/// Thread-safe monotonic counter.
#[derive(Default)]
pub struct EventCounter {
    state: Mutex<CounterState>,
}

impl EventCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one event. Returns the new count.
    pub fn increment(&self) -> u64 {
        self.add(1)
    }

    /// Record `n` events at once. Returns the new count.
    pub fn add(&self, n: u64) -> u64 {
        let mut state = self.lock();
        state.count = state.count.saturating_add(n);
        let count = state.count;
        if n > 0 {
            Self::notify(&mut state.subscribers, count);
        }
        count
    }

    fn notify(subscribers: &mut Vec<Subscriber>, count: u64) {
        let timestamp = Utc::now();
        subscribers.retain_mut(|sub| {
            if count - sub.last_notified < sub.threshold {
                return true;
            }
            match sub.tx.try_send(CountEvent { count, timestamp }) {
                Ok(()) => {
                    sub.last_notified = count;
                    true
                },
                Err(TrySendError::Full(_)) => {
                    trace!(count, threshold = sub.threshold, "subscriber full, notification skipped");
                    true
                },
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Subscribe to growth of at least `threshold` events.
    ///
    /// Progress is measured from the count at subscription time.
    pub fn subscribe(&self, threshold: u64) -> Result<mpsc::Receiver<CountEvent>, WitnessError> {
        if threshold == 0 {
            return Err(WitnessError::InvalidThreshold);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut state = self.lock();
        let last_notified = state.count;
        state.subscribers.push(Subscriber {
            threshold,
            last_notified,
            tx,
        });
        Ok(rx)
    }

    /// Drop every subscriber; receivers observe end of stream.
    pub fn close_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl std::fmt::Debug for EventCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventCounter")
            .field("count", &state.count)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_increment_and_count() {
        let counter = EventCounter::new();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.add(4), 5);
        assert_eq!(counter.count(), 5);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let counter = EventCounter::new();
        assert!(matches!(
            counter.subscribe(0),
            Err(WitnessError::InvalidThreshold)
        ));
    }

    #[test]
    fn test_threshold_notifications() {
        let counter = EventCounter::new();
        let mut rx = counter.subscribe(3).unwrap();

        for _ in 0..7 {
            counter.increment();
        }

        assert_eq!(rx.try_recv().unwrap().count, 3);
        assert_eq!(rx.try_recv().unwrap().count, 6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_skips_without_blocking() {
        let counter = EventCounter::new();
        let mut rx = counter.subscribe(1).unwrap();

        for _ in 0..(SUBSCRIBER_CAPACITY as u64 + 5) {
            counter.increment();
        }

        let mut received = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            received.push(ev.count);
        }
        assert_eq!(received.len(), SUBSCRIBER_CAPACITY);
        assert_eq!(received[0], 1);

        // After draining, the next increment is delivered.
        counter.increment();
        assert_eq!(rx.try_recv().unwrap().count, SUBSCRIBER_CAPACITY as u64 + 6);
    }

    #[test]
    fn test_closed_receiver_is_dropped() {
        let counter = EventCounter::new();
        let rx = counter.subscribe(1).unwrap();
        assert_eq!(counter.subscriber_count(), 1);
        drop(rx);
        counter.increment();
        assert_eq!(counter.subscriber_count(), 0);
    }

    #[test]
    fn test_close_subscribers_ends_stream() {
        let counter = EventCounter::new();
        let mut rx = counter.subscribe(1).unwrap();
        counter.close_subscribers();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_concurrent_increments() {
        let counter = Arc::new(EventCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.count(), 8000);
    }
}
