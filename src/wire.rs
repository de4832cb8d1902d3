//! Wire codec: 16-byte header, big-endian fixed payloads, trailing
//! 32-byte HMAC-SHA256 tag.
//!
//! Every payload that crosses the trust boundary is packed with explicit
//! offset-tracked `copy_from_slice`/`to_be_bytes` writes into a fixed
//! buffer, no derive macros. HMAC-SHA256 is computed over
//! `header || payload-without-tag`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::FramingError;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;

// --- Message type codes (ABI) ---
pub const MSG_HELLO: u8 = 1;
pub const MSG_HELLO_ACK: u8 = 2;
pub const MSG_LOGOUT: u8 = 3;
pub const MSG_LOGOUT_ACK: u8 = 4;
pub const MSG_HEARTBEAT: u8 = 5;
pub const MSG_NEW_ORDER: u8 = 6;
pub const MSG_ORDER_ACK: u8 = 7;
pub const MSG_CANCEL_ORDER: u8 = 8;
pub const MSG_CANCEL_ACK: u8 = 9;
pub const MSG_MODIFY_ORDER: u8 = 10;
pub const MSG_MODIFY_ACK: u8 = 11;
pub const MSG_TRADE: u8 = 12;
pub const MSG_SESSION_TIMEOUT: u8 = 13;

pub const PROTOCOL_VERSION: u8 = 1;

// --- Status taxonomies ---
pub const HELLO_ACCEPTED: u8 = 1;
pub const HELLO_INVALID_HMAC: u8 = 2;
pub const HELLO_INVALID_API_KEY: u8 = 3;
pub const HELLO_OUT_OF_ORDER: u8 = 4;
pub const HELLO_ILL_FORMED: u8 = 5;

pub const LOGOUT_ACCEPTED: u8 = 1;
pub const LOGOUT_INVALID_HMAC: u8 = 2;
pub const LOGOUT_OUT_OF_ORDER: u8 = 4;

pub const ORDER_ACK_ACCEPTED: u8 = 1;
pub const ORDER_ACK_INVALID: u8 = 2;
pub const ORDER_ACK_OUT_OF_ORDER: u8 = 3;
pub const ORDER_ACK_NOT_AUTHENTICATED: u8 = 4;

pub const CANCEL_ACK_ACCEPTED: u8 = 1;
pub const CANCEL_ACK_NOT_FOUND: u8 = 2;
pub const CANCEL_ACK_NOT_AUTHENTICATED: u8 = 3;
pub const CANCEL_ACK_INVALID_HMAC: u8 = 4;

pub const MODIFY_ACK_ACCEPTED: u8 = 1;
pub const MODIFY_ACK_NOT_FOUND: u8 = 2;
pub const MODIFY_ACK_INVALID: u8 = 3;
pub const MODIFY_ACK_NOT_AUTHENTICATED: u8 = 4;
pub const MODIFY_ACK_INVALID_HMAC: u8 = 5;

/// Fixed 16-byte frame header. All multi-byte fields are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: u8,
    pub protocol_version_flag: u8,
    pub payload_length: u16,
    pub client_msg_sqn: u32,
    pub server_msg_sqn: u32,
    // 4 reserved bytes, always zero on encode.
}

impl Header {
    pub fn new(message_type: u8, client_msg_sqn: u32, server_msg_sqn: u32) -> Self {
        Header {
            message_type,
            protocol_version_flag: PROTOCOL_VERSION,
            payload_length: 0,
            client_msg_sqn,
            server_msg_sqn,
        }
    }

    fn write(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = self.message_type;
        buf[1] = self.protocol_version_flag;
        buf[2..4].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.client_msg_sqn.to_be_bytes());
        buf[8..12].copy_from_slice(&self.server_msg_sqn.to_be_bytes());
        buf[12..16].copy_from_slice(&[0u8; 4]);
    }

    fn read(buf: &[u8]) -> Self {
        Header {
            message_type: buf[0],
            protocol_version_flag: buf[1],
            payload_length: u16::from_be_bytes([buf[2], buf[3]]),
            client_msg_sqn: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            server_msg_sqn: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// A payload type with a fixed wire size (including its trailing HMAC tag).
pub trait Payload: Sized {
    /// Total payload length on the wire, including the 32-byte HMAC tag.
    const WIRE_LEN: u16;

    /// Append this payload's body (everything except the HMAC tag) to `buf`.
    fn encode_body(&self, buf: &mut Vec<u8>);

    /// Parse the body (everything except the HMAC tag).
    fn decode_body(body: &[u8]) -> Self;
}

fn compute_hmac(key: &[u8], data: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&tag);
    out
}

fn verify_hmac(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Encode `header` and `payload` into a framed byte vector, filling in
/// `payload_length` and appending the HMAC tag computed over the preceding
/// bytes with `hmac_key`.
pub fn encode<T: Payload>(mut header: Header, payload: &T, hmac_key: &[u8]) -> Vec<u8> {
    header.payload_length = T::WIRE_LEN;

    let mut out = Vec::with_capacity(HEADER_LEN + T::WIRE_LEN as usize);
    let mut header_buf = [0u8; HEADER_LEN];
    header.write(&mut header_buf);
    out.extend_from_slice(&header_buf);
    payload.encode_body(&mut out);

    let tag = compute_hmac(hmac_key, &out);
    out.extend_from_slice(&tag);
    out
}

/// Decode a framed message of a known payload type. Recomputes the HMAC
/// in constant time before trusting any field. Never partially mutates
/// caller state on failure (it returns before any side effect).
pub fn decode<T: Payload>(bytes: &[u8], hmac_key: &[u8]) -> Result<(Header, T), FramingError> {
    if bytes.len() < HEADER_LEN {
        return Err(FramingError::TooShort {
            have: bytes.len(),
            need: HEADER_LEN,
        });
    }
    let header = Header::read(bytes);

    let need = HEADER_LEN + T::WIRE_LEN as usize;
    if bytes.len() < need {
        return Err(FramingError::TooShort {
            have: bytes.len(),
            need,
        });
    }
    if header.payload_length != T::WIRE_LEN {
        return Err(FramingError::LengthMismatch {
            declared: header.payload_length,
            expected: T::WIRE_LEN,
        });
    }

    let frame = &bytes[..need];
    let signed = &frame[..need - HMAC_LEN];
    let tag = &frame[need - HMAC_LEN..need];

    if !verify_hmac(hmac_key, signed, tag) {
        return Err(FramingError::InvalidHmac);
    }

    let body = &frame[HEADER_LEN..need - HMAC_LEN];
    Ok((header, T::decode_body(body)))
}

/// Reads the 16-byte header without verifying the HMAC tag. Used by the
/// protocol handler to learn a frame's message type and client sequence
/// number before it has a session key to verify against.
pub fn read_header(bytes: &[u8]) -> Header {
    Header::read(bytes)
}

/// Verifies a full frame's HMAC tag generically, using the payload length
/// the header itself declares rather than a known `Payload` type. Used by
/// the protocol handler's guard stage, ahead of the type-specific decode
/// each message handler performs.
pub fn verify_frame_hmac(frame: &[u8], hmac_key: &[u8]) -> bool {
    if frame.len() < HEADER_LEN {
        return false;
    }
    let header = Header::read(frame);
    let need = HEADER_LEN + header.payload_length as usize;
    if frame.len() < need || need < HMAC_LEN {
        return false;
    }
    let signed = &frame[..need - HMAC_LEN];
    let tag = &frame[need - HMAC_LEN..need];
    verify_hmac(hmac_key, signed, tag)
}

/// Returns how many bytes of `buf` a complete frame of message type
/// `message_type` needs, given the header is already readable. Used by
/// the protocol handler's pre-parse guard.
pub fn frame_len_for(message_type: u8) -> Option<u16> {
    let payload_len = match message_type {
        MSG_HELLO => HelloPayload::WIRE_LEN,
        MSG_HELLO_ACK => HelloAckPayload::WIRE_LEN,
        MSG_LOGOUT => LogoutPayload::WIRE_LEN,
        MSG_LOGOUT_ACK => LogoutAckPayload::WIRE_LEN,
        MSG_HEARTBEAT => HeartbeatPayload::WIRE_LEN,
        MSG_NEW_ORDER => NewOrderPayload::WIRE_LEN,
        MSG_ORDER_ACK => OrderAckPayload::WIRE_LEN,
        MSG_CANCEL_ORDER => CancelOrderPayload::WIRE_LEN,
        MSG_CANCEL_ACK => CancelAckPayload::WIRE_LEN,
        MSG_MODIFY_ORDER => ModifyOrderPayload::WIRE_LEN,
        MSG_MODIFY_ACK => ModifyAckPayload::WIRE_LEN,
        MSG_TRADE => TradePayload::WIRE_LEN,
        _ => return None,
    };
    Some(HEADER_LEN as u16 + payload_len)
}

fn read_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b[..8].try_into().unwrap())
}
fn read_i64(b: &[u8]) -> i64 {
    i64::from_be_bytes(b[..8].try_into().unwrap())
}
fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes(b[..4].try_into().unwrap())
}

// --- Payload definitions ---

/// `apiKey[16]`, `hmac[32]`. 48 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub api_key: [u8; 16],
}

impl Payload for HelloPayload {
    const WIRE_LEN: u16 = 16 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.api_key);
    }

    fn decode_body(body: &[u8]) -> Self {
        let mut api_key = [0u8; 16];
        api_key.copy_from_slice(&body[0..16]);
        HelloPayload { api_key }
    }
}

/// `serverClientID: u64`, `status: u8`, `padding[7]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAckPayload {
    pub server_client_id: u64,
    pub status: u8,
}

impl Payload for HelloAckPayload {
    const WIRE_LEN: u16 = 8 + 1 + 7 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.push(self.status);
        buf.extend_from_slice(&[0u8; 7]);
    }

    fn decode_body(body: &[u8]) -> Self {
        HelloAckPayload {
            server_client_id: read_u64(&body[0..8]),
            status: body[8],
        }
    }
}

/// `serverClientID: u64`, `padding[8]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutPayload {
    pub server_client_id: u64,
}

impl Payload for LogoutPayload {
    const WIRE_LEN: u16 = 8 + 8 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
    }

    fn decode_body(body: &[u8]) -> Self {
        LogoutPayload {
            server_client_id: read_u64(&body[0..8]),
        }
    }
}

pub type LogoutAckPayload = HelloAckPayload;

/// `serverClientID: u64`, `padding[8]`, `hmac[32]`.
pub type HeartbeatPayload = LogoutPayload;

/// `serverClientID: u64`, `instrumentID: u32`, `orderSide: u8`,
/// `orderType: u8`, `quantity: i64`, `price: i64`, `timeInForce: u8`,
/// `goodTillDate: u64`, `padding[9]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOrderPayload {
    pub server_client_id: u64,
    pub instrument_id: u32,
    pub order_side: u8,
    pub order_type: u8,
    pub quantity: i64,
    pub price: i64,
    pub time_in_force: u8,
    pub good_till_date: u64,
}

impl Payload for NewOrderPayload {
    const WIRE_LEN: u16 = 8 + 4 + 1 + 1 + 8 + 8 + 1 + 8 + 9 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.instrument_id.to_be_bytes());
        buf.push(self.order_side);
        buf.push(self.order_type);
        buf.extend_from_slice(&self.quantity.to_be_bytes());
        buf.extend_from_slice(&self.price.to_be_bytes());
        buf.push(self.time_in_force);
        buf.extend_from_slice(&self.good_till_date.to_be_bytes());
        buf.extend_from_slice(&[0u8; 9]);
    }

    fn decode_body(body: &[u8]) -> Self {
        let server_client_id = read_u64(&body[0..8]);
        let instrument_id = read_u32(&body[8..12]);
        let order_side = body[12];
        let order_type = body[13];
        let quantity = read_i64(&body[14..22]);
        let price = read_i64(&body[22..30]);
        let time_in_force = body[30];
        let good_till_date = read_u64(&body[31..39]);
        NewOrderPayload {
            server_client_id,
            instrument_id,
            order_side,
            order_type,
            quantity,
            price,
            time_in_force,
            good_till_date,
        }
    }
}

/// `serverClientID: u64`, `serverOrderID: u64`, `padding[16]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOrderPayload {
    pub server_client_id: u64,
    pub server_order_id: u64,
}

impl Payload for CancelOrderPayload {
    const WIRE_LEN: u16 = 8 + 8 + 16 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.server_order_id.to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
    }

    fn decode_body(body: &[u8]) -> Self {
        CancelOrderPayload {
            server_client_id: read_u64(&body[0..8]),
            server_order_id: read_u64(&body[8..16]),
        }
    }
}

/// `serverClientID: u64`, `serverOrderID: u64`, `newQty: i64`,
/// `newPrice: i64`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyOrderPayload {
    pub server_client_id: u64,
    pub server_order_id: u64,
    pub new_qty: i64,
    pub new_price: i64,
}

impl Payload for ModifyOrderPayload {
    const WIRE_LEN: u16 = 8 + 8 + 8 + 8 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.server_order_id.to_be_bytes());
        buf.extend_from_slice(&self.new_qty.to_be_bytes());
        buf.extend_from_slice(&self.new_price.to_be_bytes());
    }

    fn decode_body(body: &[u8]) -> Self {
        ModifyOrderPayload {
            server_client_id: read_u64(&body[0..8]),
            server_order_id: read_u64(&body[8..16]),
            new_qty: read_i64(&body[16..24]),
            new_price: read_i64(&body[24..32]),
        }
    }
}

/// `serverClientID: u64`, `instrumentID: u32`, `serverOrderID: u64`,
/// `status: u8`, `acceptedPrice: i64`, `serverTime: u64`, `latency: u32`,
/// `padding[7]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderAckPayload {
    pub server_client_id: u64,
    pub instrument_id: u32,
    pub server_order_id: u64,
    pub status: u8,
    pub accepted_price: i64,
    pub server_time: u64,
    pub latency: u32,
}

impl Payload for OrderAckPayload {
    const WIRE_LEN: u16 = 8 + 4 + 8 + 1 + 8 + 8 + 4 + 7 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.instrument_id.to_be_bytes());
        buf.extend_from_slice(&self.server_order_id.to_be_bytes());
        buf.push(self.status);
        buf.extend_from_slice(&self.accepted_price.to_be_bytes());
        buf.extend_from_slice(&self.server_time.to_be_bytes());
        buf.extend_from_slice(&self.latency.to_be_bytes());
        buf.extend_from_slice(&[0u8; 7]);
    }

    fn decode_body(body: &[u8]) -> Self {
        OrderAckPayload {
            server_client_id: read_u64(&body[0..8]),
            instrument_id: read_u32(&body[8..12]),
            server_order_id: read_u64(&body[12..20]),
            status: body[20],
            accepted_price: read_i64(&body[21..29]),
            server_time: read_u64(&body[29..37]),
            latency: read_u32(&body[37..41]),
        }
    }
}

/// `serverClientID: u64`, `serverOrderID: u64`, `status: u8`,
/// `padding[15]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelAckPayload {
    pub server_client_id: u64,
    pub server_order_id: u64,
    pub status: u8,
}

impl Payload for CancelAckPayload {
    const WIRE_LEN: u16 = 8 + 8 + 1 + 15 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.server_order_id.to_be_bytes());
        buf.push(self.status);
        buf.extend_from_slice(&[0u8; 15]);
    }

    fn decode_body(body: &[u8]) -> Self {
        CancelAckPayload {
            server_client_id: read_u64(&body[0..8]),
            server_order_id: read_u64(&body[8..16]),
            status: body[16],
        }
    }
}

/// `serverClientID: u64`, `oldServerOrderID: u64`, `newServerOrderID: u64`,
/// `status: u8`, `padding[7]`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifyAckPayload {
    pub server_client_id: u64,
    pub old_server_order_id: u64,
    pub new_server_order_id: u64,
    pub status: u8,
}

impl Payload for ModifyAckPayload {
    const WIRE_LEN: u16 = 8 + 8 + 8 + 1 + 7 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.old_server_order_id.to_be_bytes());
        buf.extend_from_slice(&self.new_server_order_id.to_be_bytes());
        buf.push(self.status);
        buf.extend_from_slice(&[0u8; 7]);
    }

    fn decode_body(body: &[u8]) -> Self {
        ModifyAckPayload {
            server_client_id: read_u64(&body[0..8]),
            old_server_order_id: read_u64(&body[8..16]),
            new_server_order_id: read_u64(&body[16..24]),
            status: body[24],
        }
    }
}

/// `serverClientID: u64`, `serverOrderID: u64`, `tradeID: u64`,
/// `filledQty: i64`, `filledPrice: i64`, `timestamp: u64`, `hmac[32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradePayload {
    pub server_client_id: u64,
    pub server_order_id: u64,
    pub trade_id: u64,
    pub filled_qty: i64,
    pub filled_price: i64,
    pub timestamp: u64,
}

impl Payload for TradePayload {
    const WIRE_LEN: u16 = 8 + 8 + 8 + 8 + 8 + 8 + HMAC_LEN as u16;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.server_client_id.to_be_bytes());
        buf.extend_from_slice(&self.server_order_id.to_be_bytes());
        buf.extend_from_slice(&self.trade_id.to_be_bytes());
        buf.extend_from_slice(&self.filled_qty.to_be_bytes());
        buf.extend_from_slice(&self.filled_price.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    fn decode_body(body: &[u8]) -> Self {
        TradePayload {
            server_client_id: read_u64(&body[0..8]),
            server_order_id: read_u64(&body[8..16]),
            trade_id: read_u64(&body[16..24]),
            filled_qty: read_i64(&body[24..32]),
            filled_price: read_i64(&body[32..40]),
            timestamp: read_u64(&body[40..48]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_round_trip() {
        let key = [0x11u8; 32];
        let header = Header::new(MSG_NEW_ORDER, 7, 3);
        let payload = NewOrderPayload {
            server_client_id: 42,
            instrument_id: 7,
            order_side: 1,
            order_type: 1,
            quantity: 100,
            price: 2000,
            time_in_force: 0,
            good_till_date: 0,
        };

        let framed = encode(header, &payload, &key);
        let (decoded_header, decoded_payload) =
            decode::<NewOrderPayload>(&framed, &key).expect("should decode");

        assert_eq!(decoded_header.client_msg_sqn, 7);
        assert_eq!(decoded_header.server_msg_sqn, 3);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn flipped_byte_fails_hmac() {
        let key = [0x11u8; 32];
        let header = Header::new(MSG_NEW_ORDER, 1, 0);
        let payload = NewOrderPayload {
            server_client_id: 1,
            instrument_id: 1,
            order_side: 1,
            order_type: 1,
            quantity: 1,
            price: 1,
            time_in_force: 0,
            good_till_date: 0,
        };
        let mut framed = encode(header, &payload, &key);
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        let result = decode::<NewOrderPayload>(&framed, &key);
        assert_eq!(result.unwrap_err(), FramingError::InvalidHmac);
    }

    #[test]
    fn too_short_is_rejected() {
        let key = [0x11u8; 32];
        let bytes = [0u8; 10];
        let result = decode::<NewOrderPayload>(&bytes, &key);
        assert!(matches!(result, Err(FramingError::TooShort { .. })));
    }

    #[test]
    fn wrong_key_fails_hmac() {
        let key = [0x11u8; 32];
        let other_key = [0x22u8; 32];
        let header = Header::new(MSG_HEARTBEAT, 1, 0);
        let payload = HeartbeatPayload {
            server_client_id: 9,
        };
        let framed = encode(header, &payload, &key);
        let result = decode::<HeartbeatPayload>(&framed, &other_key);
        assert_eq!(result.unwrap_err(), FramingError::InvalidHmac);
    }
}
