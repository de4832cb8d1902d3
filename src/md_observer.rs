//! Market-data observer: drains the SPSC ring into a replicated
//! `Level2OrderBook` and validates/recovers the replica from published
//! MD messages, detecting sequence gaps.

use std::collections::BTreeMap;

use tracing::warn;

use crate::engine::{BookUpdate, BookSide, BookUpdateKind};
use crate::md_wire::{MdMessage, SnapshotPayload};
use crate::ring::Consumer;
use crate::telemetry::{EventLog, TelemetryEvent};

/// The MD thread's own replica — it never reads the engine's book
/// directly.
pub struct Level2OrderBook {
    pub bids: BTreeMap<u64, u64>,
    pub asks: BTreeMap<u64, u64>,
}

impl Default for Level2OrderBook {
    fn default() -> Self {
        Level2OrderBook {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }
}

impl Level2OrderBook {
    pub fn bids_desc(&self) -> impl Iterator<Item = (&u64, &u64)> {
        self.bids.iter().rev()
    }

    pub fn asks_asc(&self) -> impl Iterator<Item = (&u64, &u64)> {
        self.asks.iter()
    }

    /// Up to `depth` (price, qty) levels per side, best first. Used by the
    /// publisher to build SNAPSHOT messages from its own replica, never
    /// from the engine's book directly.
    pub fn levels(&self, depth: usize) -> (Vec<(u64, u64)>, Vec<(u64, u64)>) {
        let bids = self.bids_desc().take(depth).map(|(p, q)| (*p, *q)).collect();
        let asks = self.asks_asc().take(depth).map(|(p, q)| (*p, *q)).collect();
        (bids, asks)
    }

    fn apply_add(&mut self, side: BookSide, price: u64, amount: u64) {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        *levels.entry(price).or_insert(0) += amount;
    }

    /// A REDUCE that doesn't find its price, or yields negative quantity,
    /// is a replication-error invariant violation — surfaced to the
    /// caller rather than silently ignored.
    fn apply_reduce(&mut self, side: BookSide, price: u64, amount: u64) -> Result<(), String> {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let Some(qty) = levels.get_mut(&price) else {
            return Err(format!("reduce at missing price level {price}"));
        };
        if *qty < amount {
            return Err(format!(
                "reduce of {amount} at price {price} exceeds resting {qty}"
            ));
        }
        *qty -= amount;
        if *qty == 0 {
            levels.remove(&price);
        }
        Ok(())
    }
}

/// Consumes the ring and maintains the replica directly from engine-side
/// book updates (used in-process, without going through the MD wire).
pub struct RingObserver {
    consumer: Consumer,
    pub book: Level2OrderBook,
}

impl RingObserver {
    pub fn new(consumer: Consumer) -> Self {
        RingObserver {
            consumer,
            book: Level2OrderBook::default(),
        }
    }

    /// Pops one ring entry, applies it to the replica, and returns it so
    /// the caller (the publisher) can still build a DELTA payload from
    /// the raw update without reading the engine's book itself.
    pub fn try_pop_and_apply(&mut self) -> Option<BookUpdate> {
        let update = self.consumer.try_pop()?;
        match update.kind {
            BookUpdateKind::Add => {
                self.book.apply_add(update.side, update.price as u64, update.amount as u64)
            }
            BookUpdateKind::Reduce => {
                self.book
                    .apply_reduce(update.side, update.price as u64, update.amount as u64)
                    .expect("replica invariant violation");
            }
        }
        Some(update)
    }

    /// Drains every pending ring entry, applying each to the replica.
    /// Returns the number of updates applied.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.try_pop_and_apply().is_some() {
            n += 1;
        }
        n
    }
}

/// Validates/recovers a replica from the published wire stream: tracks
/// `valid` against MD sequence continuity, applies SNAPSHOT unconditionally,
/// applies DELTA only while valid, and fires `on_gap_detected` on a
/// sequence gap.
pub struct WireObserver<F: FnMut(u64, u64)> {
    pub book: Level2OrderBook,
    pub valid: bool,
    last_sequence: Option<u64>,
    on_gap_detected: F,
}

impl<F: FnMut(u64, u64)> WireObserver<F> {
    pub fn new(on_gap_detected: F) -> Self {
        WireObserver {
            book: Level2OrderBook::default(),
            valid: false,
            last_sequence: None,
            on_gap_detected,
        }
    }

    pub fn apply(&mut self, message: MdMessage) {
        let sequence_number = match &message {
            MdMessage::Delta { header, .. } => header.sequence_number,
            MdMessage::Snapshot { header, .. } => header.sequence_number,
        };

        if let Some(last) = self.last_sequence {
            if sequence_number != last + 1 {
                (self.on_gap_detected)(last, sequence_number);
                self.valid = false;
            }
        }
        self.last_sequence = Some(sequence_number);

        match message {
            MdMessage::Snapshot { payload, .. } => {
                self.book = Self::replica_from_snapshot(&payload);
                self.valid = true;
            }
            MdMessage::Delta { payload, .. } => {
                if !self.valid {
                    return;
                }
                let side = if payload.side == 0 { BookSide::Bid } else { BookSide::Ask };
                match payload.delta_type {
                    0 => self.book.apply_add(side, payload.price_level, payload.amount_delta),
                    _ => {
                        if self
                            .book
                            .apply_reduce(side, payload.price_level, payload.amount_delta)
                            .is_err()
                        {
                            self.valid = false;
                        }
                    }
                }
            }
        }
    }

    fn replica_from_snapshot(payload: &SnapshotPayload) -> Level2OrderBook {
        let mut book = Level2OrderBook::default();
        for (price, qty) in &payload.bids {
            book.bids.insert(*price, *qty);
        }
        for (price, qty) in &payload.asks {
            book.asks.insert(*price, *qty);
        }
        book
    }
}

/// Subscribes to the publisher's own multicast stream and feeds it through
/// a `WireObserver`, so a gap introduced between the ring and the wire (a
/// dropped UDP datagram) surfaces as `TelemetryEvent::MdGapDetected`
/// instead of silently drifting the replica a receiving client would
/// build from the same feed.
pub struct MdGapMonitor {
    observer: WireObserver<Box<dyn FnMut(u64, u64)>>,
}

impl MdGapMonitor {
    pub fn new(events: EventLog) -> Self {
        let callback: Box<dyn FnMut(u64, u64)> = Box::new(move |last_sequence, next_sequence| {
            warn!(target: "marketdata", last_sequence, next_sequence, "md sequence gap detected");
            events.emit(TelemetryEvent::MdGapDetected { last_sequence, next_sequence });
        });
        MdGapMonitor {
            observer: WireObserver::new(callback),
        }
    }

    /// Decodes one received datagram and applies it. Malformed datagrams
    /// are dropped silently, same as any other best-effort UDP traffic.
    pub fn handle_datagram(&mut self, bytes: &[u8]) {
        if let Some(message) = crate::md_wire::decode(bytes) {
            self.observer.apply(message);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.observer.valid
    }
}
