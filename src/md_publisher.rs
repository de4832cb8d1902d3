//! Market-data publisher: snapshot cadence + ring-drain delta sender over
//! UDP multicast. Drains a channel, serializes each update, and
//! `send_to`s it in a loop, with its own monotonic sequence counter and
//! snapshot cadence.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::error::InitError;
use crate::md_observer::RingObserver;
use crate::md_wire::{encode_delta, encode_snapshot, DeltaPayload, SnapshotPayload};
use crate::ring::Consumer;

pub struct MdPublisher {
    socket: UdpSocket,
    target: SocketAddr,
    instrument_id: u32,
    observer: RingObserver,
    snapshot_interval: Duration,
    max_depth: usize,
    sequence: u64,
    last_snapshot_at: Instant,
}

impl MdPublisher {
    pub async fn bind(
        bind_addr: SocketAddr,
        group: std::net::Ipv4Addr,
        interface: std::net::Ipv4Addr,
        target: SocketAddr,
        ttl: u32,
        instrument_id: u32,
        consumer: Consumer,
        snapshot_interval: Duration,
        max_depth: usize,
    ) -> Result<Self, InitError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(InitError::Multicast)?;
        socket
            .set_multicast_ttl_v4(ttl)
            .map_err(InitError::Multicast)?;
        socket
            .join_multicast_v4(group, interface)
            .map_err(|source| InitError::MulticastJoin { group, source })?;

        Ok(MdPublisher {
            socket,
            target,
            instrument_id,
            observer: RingObserver::new(consumer),
            snapshot_interval,
            max_depth,
            sequence: 0,
            last_snapshot_at: Instant::now() - snapshot_interval,
        })
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn snapshot_due(&self) -> bool {
        self.last_snapshot_at.elapsed() >= self.snapshot_interval
    }

    /// Drains the ring into the publisher's own replica, sending one DELTA
    /// per update and never reordering entries; then, if the snapshot
    /// interval has elapsed, sends a SNAPSHOT built from that same replica
    /// — the MD thread never reads the engine's book directly, only its
    /// own `RingObserver` replica.
    pub async fn run_once(&mut self) -> std::io::Result<()> {
        while let Some(update) = self.observer.try_pop_and_apply() {
            let payload = DeltaPayload::from_book_update(&update);
            let sequence_number = self.next_sequence();
            let bytes = encode_delta(sequence_number, self.instrument_id, &payload);
            self.socket.send_to(&bytes, self.target).await?;
        }

        if self.snapshot_due() {
            let (bids, asks) = self.observer.book.levels(self.max_depth);
            let payload = SnapshotPayload { bids, asks };
            let sequence_number = self.next_sequence();
            let bytes = encode_snapshot(sequence_number, self.instrument_id, &payload);
            self.socket.send_to(&bytes, self.target).await?;
            self.last_snapshot_at = Instant::now();
        }
        Ok(())
    }
}
