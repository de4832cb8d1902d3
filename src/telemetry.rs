//! Application-level event stream for external consumers, kept separate
//! from `tracing`'s human-readable diagnostics. A bounded channel fed by
//! a non-blocking `try_send` that drops the *oldest* queued event rather
//! than blocking the matching thread when full — a logging sink must
//! never back-pressure matching.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    OrderAccepted { order_id: u64, client_id: u64 },
    Trade { trade_id: u64, price: i64, qty: i64 },
    BookLevelAdded { price: i64, side: crate::engine::BookSide },
    BookLevelRemoved { price: i64, side: crate::engine::BookSide },
    SessionClosed { client_id: u64 },
    MdGapDetected { last_sequence: u64, next_sequence: u64 },
}

/// Handle held by the matching thread. Cloning is cheap (an `Arc`-backed
/// channel sender); every clone shares the same bounded backing buffer.
#[derive(Clone)]
pub struct EventLog {
    sender: Sender<TelemetryEvent>,
    receiver: Receiver<TelemetryEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        EventLog { sender, receiver }
    }

    /// Never blocks. On a full buffer, drops the oldest queued event and
    /// retries once so the newest event is the one that survives.
    pub fn emit(&self, event: TelemetryEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.receiver.try_recv();
                let _ = self.sender.try_send(event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Drained by the dedicated consumer thread/task.
    pub fn receiver(&self) -> Receiver<TelemetryEvent> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookSide;

    #[test]
    fn full_buffer_drops_oldest_not_newest() {
        let log = EventLog::new(2);
        log.emit(TelemetryEvent::BookLevelAdded { price: 1, side: BookSide::Bid });
        log.emit(TelemetryEvent::BookLevelAdded { price: 2, side: BookSide::Bid });
        log.emit(TelemetryEvent::BookLevelAdded { price: 3, side: BookSide::Bid });

        let rx = log.receiver();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let prices: Vec<i64> = [first, second]
            .iter()
            .map(|e| match e {
                TelemetryEvent::BookLevelAdded { price, .. } => *price,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(prices, vec![2, 3]);
    }
}
