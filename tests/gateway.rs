//! End-to-end gateway tests: a real `TcpStream` client talks the framed
//! HMAC protocol to a `Reactor` bound on an ephemeral port, the same way
//! a trading client would.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use lighting_exchange_core::config::EngineConfig;
use lighting_exchange_core::engine::{Engine, ORDER_TYPE_LIMIT, SIDE_BUY, SIDE_SELL};
use lighting_exchange_core::protocol::ApiKeyRegistry;
use lighting_exchange_core::reactor::{Reactor, SharedState};
use lighting_exchange_core::ring;
use lighting_exchange_core::telemetry::EventLog;
use lighting_exchange_core::wire::{self, *};

const API_KEY: [u8; 16] = [7u8; 16];
const HMAC_KEY: [u8; 32] = [9u8; 32];

fn test_config() -> EngineConfig {
    EngineConfig::new(
        Ipv4Addr::UNSPECIFIED,
        0,
        Ipv4Addr::new(239, 0, 0, 1),
        0,
        Ipv4Addr::UNSPECIFIED,
        1,
        Duration::from_secs(3600),
        20,
        Duration::from_secs(30),
        64,
    )
}

async fn spawn_reactor() -> (SocketAddr, Rc<Notify>) {
    let engine = Engine::new(1);
    let mut api_keys = ApiKeyRegistry::new();
    api_keys.register(API_KEY, HMAC_KEY);
    let events = EventLog::new(256);
    let (producer, _consumer) = ring::channel(64);

    let shared = Rc::new(RefCell::new(SharedState::new(
        engine,
        api_keys,
        producer,
        events,
        test_config(),
    )));

    let reactor = Reactor::bind((Ipv4Addr::LOCALHOST, 0).into(), shared)
        .await
        .expect("reactor bind");
    let addr = reactor.local_addr().expect("local addr");
    let shutdown = reactor.shutdown_handle();

    tokio::task::spawn_local(reactor.run(Duration::from_secs(1)));
    (addr, shutdown)
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.expect("read header");
    let payload_length = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut rest = vec![0u8; payload_length];
    stream.read_exact(&mut rest).await.expect("read payload");
    let mut frame = header.to_vec();
    frame.extend_from_slice(&rest);
    frame
}

async fn hello(stream: &mut TcpStream, client_sqn: u32) -> HelloAckPayload {
    let header = Header::new(MSG_HELLO, client_sqn, 0);
    let payload = HelloPayload { api_key: API_KEY };
    let frame = wire::encode(header, &payload, &HMAC_KEY);
    stream.write_all(&frame).await.expect("write hello");

    let response = read_frame(stream).await;
    let (_, ack) = wire::decode::<HelloAckPayload>(&response, &HMAC_KEY).expect("decode hello ack");
    ack
}

#[tokio::test(flavor = "current_thread")]
async fn hello_handshake_assigns_a_client_id() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (addr, _shutdown) = spawn_reactor().await;
            let mut stream = TcpStream::connect(addr).await.expect("connect");

            let ack = hello(&mut stream, 1).await;
            assert_eq!(ack.status, HELLO_ACCEPTED);
            assert_ne!(ack.server_client_id, 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn unregistered_api_key_is_rejected() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (addr, _shutdown) = spawn_reactor().await;
            let mut stream = TcpStream::connect(addr).await.expect("connect");

            let header = Header::new(MSG_HELLO, 1, 0);
            let payload = HelloPayload { api_key: [0xFFu8; 16] };
            let frame = wire::encode(header, &payload, &[0u8; 32]);
            stream.write_all(&frame).await.expect("write hello");

            let response = read_frame(&mut stream).await;
            let (_, ack) = wire::decode::<HelloAckPayload>(&response, &[0u8; 32]).expect("decode");
            assert_eq!(ack.status, HELLO_INVALID_API_KEY);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn new_order_after_hello_is_accepted_and_acked() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (addr, _shutdown) = spawn_reactor().await;
            let mut stream = TcpStream::connect(addr).await.expect("connect");

            let ack = hello(&mut stream, 1).await;
            assert_eq!(ack.status, HELLO_ACCEPTED);

            let header = Header::new(MSG_NEW_ORDER, 2, 0);
            let order = NewOrderPayload {
                server_client_id: ack.server_client_id,
                instrument_id: 1,
                order_side: SIDE_BUY,
                order_type: ORDER_TYPE_LIMIT,
                quantity: 10,
                price: 100,
                time_in_force: 0,
                good_till_date: 0,
            };
            let frame = wire::encode(header, &order, &HMAC_KEY);
            stream.write_all(&frame).await.expect("write new order");

            let response = read_frame(&mut stream).await;
            let (_, order_ack) =
                wire::decode::<OrderAckPayload>(&response, &HMAC_KEY).expect("decode order ack");
            assert_eq!(order_ack.status, ORDER_ACK_ACCEPTED);
            assert_ne!(order_ack.server_order_id, 0);
        })
        .await;
}

/// Two connections cross a limit order: both sides receive a TRADE
/// message bearing their own order id and the same fill price.
#[tokio::test(flavor = "current_thread")]
async fn crossing_orders_notify_both_counterparties() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (addr, _shutdown) = spawn_reactor().await;
            let mut buyer = TcpStream::connect(addr).await.expect("connect buyer");
            let mut seller = TcpStream::connect(addr).await.expect("connect seller");

            let buyer_ack = hello(&mut buyer, 1).await;
            let seller_ack = hello(&mut seller, 1).await;
            assert_eq!(buyer_ack.status, HELLO_ACCEPTED);
            assert_eq!(seller_ack.status, HELLO_ACCEPTED);

            let sell_header = Header::new(MSG_NEW_ORDER, 2, 0);
            let sell_order = NewOrderPayload {
                server_client_id: seller_ack.server_client_id,
                instrument_id: 1,
                order_side: SIDE_SELL,
                order_type: ORDER_TYPE_LIMIT,
                quantity: 5,
                price: 150,
                time_in_force: 0,
                good_till_date: 0,
            };
            seller
                .write_all(&wire::encode(sell_header, &sell_order, &HMAC_KEY))
                .await
                .expect("write sell order");
            let seller_order_ack = read_frame(&mut seller).await;
            let (_, seller_order_ack) =
                wire::decode::<OrderAckPayload>(&seller_order_ack, &HMAC_KEY).expect("decode");
            assert_eq!(seller_order_ack.status, ORDER_ACK_ACCEPTED);

            let buy_header = Header::new(MSG_NEW_ORDER, 2, 0);
            let buy_order = NewOrderPayload {
                server_client_id: buyer_ack.server_client_id,
                instrument_id: 1,
                order_side: SIDE_BUY,
                order_type: ORDER_TYPE_LIMIT,
                quantity: 5,
                price: 150,
                time_in_force: 0,
                good_till_date: 0,
            };
            buyer
                .write_all(&wire::encode(buy_header, &buy_order, &HMAC_KEY))
                .await
                .expect("write buy order");

            let buyer_order_ack = read_frame(&mut buyer).await;
            let (_, buyer_order_ack) =
                wire::decode::<OrderAckPayload>(&buyer_order_ack, &HMAC_KEY).expect("decode");
            assert_eq!(buyer_order_ack.status, ORDER_ACK_ACCEPTED);

            let buyer_trade = read_frame(&mut buyer).await;
            let (_, buyer_trade) = wire::decode::<TradePayload>(&buyer_trade, &HMAC_KEY).expect("decode");
            let seller_trade = read_frame(&mut seller).await;
            let (_, seller_trade) = wire::decode::<TradePayload>(&seller_trade, &HMAC_KEY).expect("decode");

            assert_eq!(buyer_trade.filled_price, 150);
            assert_eq!(seller_trade.filled_price, 150);
            assert_eq!(buyer_trade.filled_qty, 5);
            // trade_id is each session's own outbound execution counter, not
            // the engine's shared trade id, so it need not match across legs.
            assert_eq!(buyer_trade.trade_id, 1);
            assert_eq!(seller_trade.trade_id, 1);

            // A second crossing trade advances each session's exec counter
            // independently of the other leg's.
            let sell_header2 = Header::new(MSG_NEW_ORDER, 3, 0);
            let sell_order2 = NewOrderPayload {
                server_client_id: seller_ack.server_client_id,
                instrument_id: 1,
                order_side: SIDE_SELL,
                order_type: ORDER_TYPE_LIMIT,
                quantity: 3,
                price: 150,
                time_in_force: 0,
                good_till_date: 0,
            };
            seller
                .write_all(&wire::encode(sell_header2, &sell_order2, &HMAC_KEY))
                .await
                .expect("write second sell order");
            let _seller_order_ack2 = read_frame(&mut seller).await;

            let buy_header2 = Header::new(MSG_NEW_ORDER, 3, 0);
            let buy_order2 = NewOrderPayload {
                server_client_id: buyer_ack.server_client_id,
                instrument_id: 1,
                order_side: SIDE_BUY,
                order_type: ORDER_TYPE_LIMIT,
                quantity: 3,
                price: 150,
                time_in_force: 0,
                good_till_date: 0,
            };
            buyer
                .write_all(&wire::encode(buy_header2, &buy_order2, &HMAC_KEY))
                .await
                .expect("write second buy order");
            let _buyer_order_ack2 = read_frame(&mut buyer).await;

            let buyer_trade2 = read_frame(&mut buyer).await;
            let (_, buyer_trade2) = wire::decode::<TradePayload>(&buyer_trade2, &HMAC_KEY).expect("decode");
            let seller_trade2 = read_frame(&mut seller).await;
            let (_, seller_trade2) = wire::decode::<TradePayload>(&seller_trade2, &HMAC_KEY).expect("decode");

            assert_eq!(buyer_trade2.trade_id, 2);
            assert_eq!(seller_trade2.trade_id, 2);
        })
        .await;
}
