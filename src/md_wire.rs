//! Market-data wire format: MD header, DELTA and SNAPSHOT payloads. No
//! HMAC — best-effort UDP multicast. Packed the same way the trading
//! protocol payloads are: manual offset-tracked writes into a fixed
//! buffer, no derive macros.

use crate::engine::{BookSide, BookUpdateKind};

pub const MD_VERSION: u8 = 0x01;
pub const MD_TYPE_DELTA: u8 = 0;
pub const MD_TYPE_SNAPSHOT: u8 = 1;

pub const MD_HEADER_LEN: usize = 8 + 4 + 2 + 1 + 1;
pub const MD_DELTA_PAYLOAD_LEN: usize = 8 + 8 + 1 + 1 + 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdHeader {
    pub sequence_number: u64,
    pub instrument_id: u32,
    pub payload_length: u16,
    pub md_msg_type: u8,
    pub version: u8,
}

impl MdHeader {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.instrument_id.to_be_bytes());
        buf.extend_from_slice(&self.payload_length.to_be_bytes());
        buf.push(self.md_msg_type);
        buf.push(self.version);
    }

    fn read(buf: &[u8]) -> Self {
        MdHeader {
            sequence_number: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            instrument_id: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            payload_length: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            md_msg_type: buf[14],
            version: buf[15],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaPayload {
    pub price_level: u64,
    pub amount_delta: u64,
    pub delta_type: u8,
    pub side: u8,
}

impl DeltaPayload {
    pub fn from_book_update(update: &crate::engine::BookUpdate) -> Self {
        DeltaPayload {
            price_level: update.price as u64,
            amount_delta: update.amount as u64,
            delta_type: match update.kind {
                BookUpdateKind::Add => 0,
                BookUpdateKind::Reduce => 1,
            },
            side: match update.side {
                BookSide::Bid => 0,
                BookSide::Ask => 1,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPayload {
    pub bids: Vec<(u64, u64)>,
    pub asks: Vec<(u64, u64)>,
}

impl SnapshotPayload {
    pub fn wire_len(&self) -> usize {
        2 + 2 + 4 + (self.bids.len() + self.asks.len()) * 16
    }
}

pub fn encode_delta(sequence_number: u64, instrument_id: u32, payload: &DeltaPayload) -> Vec<u8> {
    let header = MdHeader {
        sequence_number,
        instrument_id,
        payload_length: MD_DELTA_PAYLOAD_LEN as u16,
        md_msg_type: MD_TYPE_DELTA,
        version: MD_VERSION,
    };
    let mut buf = Vec::with_capacity(MD_HEADER_LEN + MD_DELTA_PAYLOAD_LEN);
    header.write(&mut buf);
    buf.extend_from_slice(&payload.price_level.to_be_bytes());
    buf.extend_from_slice(&payload.amount_delta.to_be_bytes());
    buf.push(payload.delta_type);
    buf.push(payload.side);
    buf.extend_from_slice(&[0u8; 6]);
    buf
}

pub fn encode_snapshot(sequence_number: u64, instrument_id: u32, payload: &SnapshotPayload) -> Vec<u8> {
    let header = MdHeader {
        sequence_number,
        instrument_id,
        payload_length: payload.wire_len() as u16,
        md_msg_type: MD_TYPE_SNAPSHOT,
        version: MD_VERSION,
    };
    let mut buf = Vec::with_capacity(MD_HEADER_LEN + payload.wire_len());
    header.write(&mut buf);
    buf.extend_from_slice(&(payload.bids.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(payload.asks.len() as u16).to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    for (price, qty) in &payload.bids {
        buf.extend_from_slice(&price.to_be_bytes());
        buf.extend_from_slice(&qty.to_be_bytes());
    }
    for (price, qty) in &payload.asks {
        buf.extend_from_slice(&price.to_be_bytes());
        buf.extend_from_slice(&qty.to_be_bytes());
    }
    buf
}

/// Decoded MD message, used by the observer.
pub enum MdMessage {
    Delta { header: MdHeader, payload: DeltaPayload },
    Snapshot { header: MdHeader, payload: SnapshotPayload },
}

pub fn decode(bytes: &[u8]) -> Option<MdMessage> {
    if bytes.len() < MD_HEADER_LEN {
        return None;
    }
    let header = MdHeader::read(bytes);
    let body = &bytes[MD_HEADER_LEN..];

    match header.md_msg_type {
        MD_TYPE_DELTA => {
            if body.len() < MD_DELTA_PAYLOAD_LEN {
                return None;
            }
            let payload = DeltaPayload {
                price_level: u64::from_be_bytes(body[0..8].try_into().unwrap()),
                amount_delta: u64::from_be_bytes(body[8..16].try_into().unwrap()),
                delta_type: body[16],
                side: body[17],
            };
            Some(MdMessage::Delta { header, payload })
        }
        MD_TYPE_SNAPSHOT => {
            if body.len() < 8 {
                return None;
            }
            let bid_count = u16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
            let ask_count = u16::from_be_bytes(body[2..4].try_into().unwrap()) as usize;
            let levels_start = 8;
            let needed = levels_start + (bid_count + ask_count) * 16;
            if body.len() < needed {
                return None;
            }
            let mut bids = Vec::with_capacity(bid_count);
            let mut offset = levels_start;
            for _ in 0..bid_count {
                let price = u64::from_be_bytes(body[offset..offset + 8].try_into().unwrap());
                let qty = u64::from_be_bytes(body[offset + 8..offset + 16].try_into().unwrap());
                bids.push((price, qty));
                offset += 16;
            }
            let mut asks = Vec::with_capacity(ask_count);
            for _ in 0..ask_count {
                let price = u64::from_be_bytes(body[offset..offset + 8].try_into().unwrap());
                let qty = u64::from_be_bytes(body[offset + 8..offset + 16].try_into().unwrap());
                asks.push((price, qty));
                offset += 16;
            }
            Some(MdMessage::Snapshot {
                header,
                payload: SnapshotPayload { bids, asks },
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_round_trip() {
        let payload = DeltaPayload {
            price_level: 2000,
            amount_delta: 50,
            delta_type: 1,
            side: 0,
        };
        let bytes = encode_delta(7, 1, &payload);
        match decode(&bytes).unwrap() {
            MdMessage::Delta { header, payload: decoded } => {
                assert_eq!(header.sequence_number, 7);
                assert_eq!(decoded, payload);
            }
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let payload = SnapshotPayload {
            bids: vec![(100, 5), (99, 10)],
            asks: vec![(101, 3)],
        };
        let bytes = encode_snapshot(1, 1, &payload);
        match decode(&bytes).unwrap() {
            MdMessage::Snapshot { payload: decoded, .. } => assert_eq!(decoded, payload),
            _ => panic!("expected snapshot"),
        }
    }
}
